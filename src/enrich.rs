//! Enrichment of an address group: one resolution and at most one probe per
//! address, fanned out to every record of the group.
//!
//! Tags, in the order they are stored:
//!
//! | outcome                       | tags                                          |
//! |-------------------------------|-----------------------------------------------|
//! | resolution failed             | `unresolved`                                  |
//! | resolved, no 2xx response     | `resolved`, `failure`                         |
//! | resolved, 2xx response        | `resolved`, `success`, `active`/`inactive`, optional `login` |
use std::net::IpAddr;
use std::sync::Arc;

use log::debug;

use crate::credential::{CredentialRecord, OutputRecord};
use crate::group::AddressGroup;
use crate::probe::{ProbeError, ProbeOutcome, Prober};
use crate::resolve::{Resolution, Resolve};

pub const TAG_RESOLVED: &str = "resolved";
pub const TAG_UNRESOLVED: &str = "unresolved";
pub const TAG_SUCCESS: &str = "success";
pub const TAG_FAILURE: &str = "failure";
pub const TAG_ACTIVE: &str = "active";
pub const TAG_INACTIVE: &str = "inactive";
pub const TAG_LOGIN: &str = "login";

/// Enrichment shared by every record of one address group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichmentResult {
    pub ip_address: Option<String>,
    pub tags: Vec<String>,
    pub title: Option<String>,
    pub port: Option<u16>,
    pub scheme: Option<String>,
    pub path: Option<String>,
}

impl EnrichmentResult {
    pub fn unresolved() -> Self {
        Self {
            ip_address: None,
            tags: vec![TAG_UNRESOLVED.to_string()],
            title: None,
            port: None,
            scheme: None,
            path: None,
        }
    }

    pub fn from_probe(ip: IpAddr, outcome: ProbeOutcome) -> Self {
        let ip_address = Some(ip.to_string());
        match outcome {
            ProbeOutcome::Failed => Self {
                ip_address,
                tags: vec![TAG_RESOLVED.to_string(), TAG_FAILURE.to_string()],
                title: None,
                port: None,
                scheme: None,
                path: None,
            },
            ProbeOutcome::Response(r) => {
                let mut tags = vec![TAG_RESOLVED.to_string(), TAG_SUCCESS.to_string()];
                tags.push(if r.active { TAG_ACTIVE } else { TAG_INACTIVE }.to_string());
                if r.login {
                    tags.push(TAG_LOGIN.to_string());
                }
                Self {
                    ip_address,
                    tags,
                    title: r.title,
                    port: r.port,
                    scheme: Some(r.scheme),
                    path: Some(r.path),
                }
            }
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Join one credential record with this result.
    pub fn apply(&self, record: CredentialRecord) -> OutputRecord {
        OutputRecord {
            username: record.username,
            password: record.password,
            address: record.normalized_address,
            scheme: self.scheme.clone(),
            port: self.port,
            url_path: self.path.clone(),
            ip_address: self.ip_address.clone(),
            title: self.title.clone(),
            file_name: record.source_file,
            line_number: record.line_number,
            application: None,
            tags: self.tags.clone(),
        }
    }
}

pub struct Enricher {
    resolver: Arc<dyn Resolve>,
    prober: Arc<Prober>,
}

impl Enricher {
    pub fn new(resolver: Arc<dyn Resolve>, prober: Arc<Prober>) -> Self {
        Self { resolver, prober }
    }

    /// Resolve `address` and, if that succeeds, probe it.
    pub async fn enrich_address(&self, address: &str) -> Result<EnrichmentResult, ProbeError> {
        match self.resolver.resolve(address).await {
            Resolution::Unresolved => {
                debug!("{} did not resolve", address);
                Ok(EnrichmentResult::unresolved())
            }
            Resolution::Resolved(ip) => {
                let outcome = self.prober.probe(address).await?;
                Ok(EnrichmentResult::from_probe(ip, outcome))
            }
        }
    }

    /// One output record per group member, all sharing the group's result.
    pub async fn enrich(&self, group: AddressGroup) -> Result<Vec<OutputRecord>, ProbeError> {
        let result = self.enrich_address(&group.address).await?;
        debug!(
            "{} ({} lines) tagged {:?}",
            group.address,
            group.len(),
            result.tags
        );
        Ok(group
            .records
            .into_iter()
            .map(|record| result.apply(record))
            .collect())
    }
}
