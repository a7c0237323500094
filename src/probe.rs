//! HTTP probing of resolved addresses.
//!
//! A [`Prober`] owns the HTTP client and the semaphore that caps probes in
//! flight across a whole run. Each probe is one GET with redirects followed
//! and a per-request timeout. Network-level failures (timeouts, refused or
//! reset connections, protocol errors, truncated bodies) come back as
//! [`ProbeOutcome::Failed`]; anything else is a [`ProbeError`] and aborts the
//! run.
use std::sync::{Arc, LazyLock};

use log::{debug, warn};
use regex::Regex;
use reqwest::redirect::Policy;
use tokio::sync::Semaphore;
use url::Url;

use crate::classify::KNOWN_PROTOCOLS;
use crate::config::PipelineConfig;

static TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title(?:\s[^>]*)?>(.*?)</title>").unwrap());

/// Largest body prefix read from a 2xx response.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Lowercased markers of a password input field.
const PASSWORD_FIELD_MARKERS: [&str; 3] = [
    "type=\"password\"",
    "type='password'",
    "type=password",
];

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("invalid probe url: {0}")]
    InvalidUrl(String),
    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("probe of {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("probe semaphore closed")]
    Closed,
}

/// Signals taken from a 2xx response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResponse {
    pub title: Option<String>,
    pub scheme: String,
    pub port: Option<u16>,
    pub path: String,
    /// Body was non-empty.
    pub active: bool,
    /// Body contains a password input field.
    pub login: bool,
}

impl ProbeResponse {
    /// Build from the final URL (after redirects) and the response body.
    pub fn from_parts(final_url: &Url, body: &str) -> Self {
        Self {
            title: extract_title(body),
            scheme: final_url.scheme().to_string(),
            port: final_url.port_or_known_default(),
            path: final_url.path().to_string(),
            active: !body.is_empty(),
            login: has_password_field(body),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Response(ProbeResponse),
    /// No response, or a non-2xx status.
    Failed,
}

/// Inner text of the first `<title>` element, trimmed. Empty titles count as
/// absent.
pub fn extract_title(body: &str) -> Option<String> {
    TITLE
        .captures(body)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|t| !t.is_empty())
}

pub fn has_password_field(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    PASSWORD_FIELD_MARKERS.iter().any(|m| lower.contains(m))
}

/// URL to probe for `address`, defaulting to `http://` when it carries no
/// known protocol.
pub fn probe_url(address: &str) -> String {
    if KNOWN_PROTOCOLS.iter().any(|p| address.starts_with(p)) {
        address.to_string()
    } else {
        warn!("address {} has no protocol, probing over http", address);
        format!("http://{}", address)
    }
}

/// Body text up to [`MAX_BODY_BYTES`]; the rest is never read.
async fn read_body(mut response: reqwest::Response) -> Result<String, reqwest::Error> {
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        let room = MAX_BODY_BYTES - body.len();
        if chunk.len() >= room {
            body.extend_from_slice(&chunk[..room]);
            break;
        }
        body.extend_from_slice(&chunk);
    }
    Ok(String::from_utf8_lossy(&body).into_owned())
}

fn is_network_failure(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() || e.is_decode()
}

pub struct Prober {
    client: reqwest::Client,
    permits: Arc<Semaphore>,
    connect_retries: usize,
}

impl Prober {
    pub fn new(config: &PipelineConfig) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .redirect(Policy::limited(config.max_redirects))
            .timeout(config.probe_timeout)
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(ProbeError::Client)?;
        Ok(Self {
            client,
            permits: Arc::new(Semaphore::new(config.probe_concurrency.max(1))),
            connect_retries: config.connect_retries,
        })
    }

    /// Permits currently free; equals the configured concurrency when idle.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    pub async fn probe(&self, address: &str) -> Result<ProbeOutcome, ProbeError> {
        let target = probe_url(address);
        let url = Url::parse(&target).map_err(|_| ProbeError::InvalidUrl(target.clone()))?;
        let _permit = self.permits.acquire().await.map_err(|_| ProbeError::Closed)?;

        let mut attempt = 0;
        let response = loop {
            match self.client.get(url.clone()).send().await {
                Ok(response) => break response,
                Err(e) if e.is_connect() && attempt < self.connect_retries => {
                    attempt += 1;
                    debug!("connect to {} failed, retry {}: {}", url, attempt, e);
                }
                Err(e) if is_network_failure(&e) => {
                    debug!("probe of {} got no response: {}", url, e);
                    return Ok(ProbeOutcome::Failed);
                }
                Err(source) => {
                    return Err(ProbeError::Request {
                        url: url.to_string(),
                        source,
                    });
                }
            }
        };

        let status = response.status();
        if !status.is_success() {
            debug!("probe of {} returned {}", url, status);
            return Ok(ProbeOutcome::Failed);
        }
        let final_url = response.url().clone();
        let body = match read_body(response).await {
            Ok(body) => body,
            Err(e) if is_network_failure(&e) => {
                debug!("reading body from {} failed: {}", final_url, e);
                return Ok(ProbeOutcome::Failed);
            }
            Err(source) => {
                return Err(ProbeError::Request {
                    url: final_url.to_string(),
                    source,
                });
            }
        };
        Ok(ProbeOutcome::Response(ProbeResponse::from_parts(
            &final_url, &body,
        )))
    }
}
