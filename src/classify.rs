//! Line classifier for `scheme://host:username:password` leak lines.
//!
//! A line is accepted only if it passes every check, in order:
//! no `::` run, an `http://` or `https://` prefix, at most three colons, and no
//! embedded IPv4 literal. Accepted lines are split on `:` into the normalized
//! address (`scheme:host`) and up to two credential fields.
use std::convert::Infallible;
use std::sync::LazyLock;

use log::{debug, warn};
use rayon::prelude::*;
use regex::Regex;

use crate::credential::CredentialRecord;

/// Protocol prefixes the field extraction understands.
pub const KNOWN_PROTOCOLS: [&str; 2] = ["http://", "https://"];

/// Upper bound on `:` separators in an accepted line.
pub const MAX_COLONS: usize = 3;

static IPV4_LIKE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}").unwrap());

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LineError {
    #[error("consecutive colons")]
    ConsecutiveColons,
    #[error("unknown protocol")]
    UnknownProtocol,
    #[error("too many colons: {0}")]
    TooManyColons(usize),
    #[error("embedded IPv4 address")]
    EmbeddedIpv4,
}

/// Fields extracted from one accepted line, before placeholder masking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLine {
    pub scheme: String,
    pub address: String,
    pub username: String,
    pub password: String,
}

pub fn parse_credential_line(line: &str) -> Result<ParsedLine, LineError> {
    if line.contains("::") {
        return Err(LineError::ConsecutiveColons);
    }
    if !KNOWN_PROTOCOLS.iter().any(|p| line.starts_with(p)) {
        return Err(LineError::UnknownProtocol);
    }
    let colons = memchr::memchr_iter(b':', line.as_bytes()).count();
    if colons > MAX_COLONS {
        return Err(LineError::TooManyColons(colons));
    }
    if IPV4_LIKE.is_match(line) {
        return Err(LineError::EmbeddedIpv4);
    }

    let parts: Vec<&str> = line.split(':').collect();
    let scheme = parts[0];
    let domain = parts.get(1).copied().unwrap_or_default();
    let (username, password) = match &parts[2.min(parts.len())..] {
        [user] => (*user, ""),
        [user, pass] => (*user, *pass),
        rest => {
            warn!(
                "unexpected credential field count {} in line: {}",
                rest.len(),
                line
            );
            ("", "")
        }
    };

    Ok(ParsedLine {
        scheme: scheme.to_string(),
        address: format!("{}:{}", scheme, domain),
        username: username.to_string(),
        password: password.to_string(),
    })
}

/// Counters over one classification pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ClassifyStats {
    pub lines_total: usize,
    pub accepted: usize,
    pub consecutive_colons: usize,
    pub unknown_protocol: usize,
    pub too_many_colons: usize,
    pub embedded_ipv4: usize,
}

impl ClassifyStats {
    pub fn rejected(&self) -> usize {
        self.lines_total - self.accepted
    }

    fn record(&mut self, index: usize, outcome: &Result<CredentialRecord, LineError>) {
        self.lines_total += 1;
        let err = match outcome {
            Ok(_) => {
                self.accepted += 1;
                return;
            }
            Err(e) => e,
        };
        debug!("line {} rejected: {}", index, err);
        match err {
            LineError::ConsecutiveColons => self.consecutive_colons += 1,
            LineError::UnknownProtocol => self.unknown_protocol += 1,
            LineError::TooManyColons(_) => self.too_many_colons += 1,
            LineError::EmbeddedIpv4 => self.embedded_ipv4 += 1,
        }
    }
}

fn classify_indexed(
    file_name: &str,
    index: usize,
    line: &str,
) -> Result<CredentialRecord, LineError> {
    let parsed = parse_credential_line(line.trim())?;
    Ok(CredentialRecord::new(
        file_name,
        index,
        parsed.address,
        &parsed.username,
        &parsed.password,
    ))
}

fn tally<I>(outcomes: I) -> (Vec<CredentialRecord>, ClassifyStats)
where
    I: IntoIterator<Item = (usize, Result<CredentialRecord, LineError>)>,
{
    let mut stats = ClassifyStats::default();
    let mut records = Vec::new();
    for (index, outcome) in outcomes {
        stats.record(index, &outcome);
        if let Ok(record) = outcome {
            records.push(record);
        }
    }
    (records, stats)
}

/// Classify a whole file held in memory. Lines are checked in parallel; the
/// returned records keep file order and their original 0-based line index.
pub fn classify_contents(file_name: &str, contents: &str) -> (Vec<CredentialRecord>, ClassifyStats) {
    let lines: Vec<&str> = contents.lines().collect();
    let outcomes: Vec<_> = lines
        .par_iter()
        .enumerate()
        .map(|(index, line)| (index, classify_indexed(file_name, index, line)))
        .collect();
    tally(outcomes)
}

/// Streaming counterpart of [`classify_contents`] for line iterators.
pub fn classify_lines<I, S>(file_name: &str, lines: I) -> (Vec<CredentialRecord>, ClassifyStats)
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    match try_classify_lines(file_name, lines.into_iter().map(Ok::<S, Infallible>)) {
        Ok(classified) => classified,
        Err(never) => match never {},
    }
}

/// Like [`classify_lines`] for sources that can fail mid-stream, such as
/// [`crate::io::LineIter`]. Stops at the first source error.
pub fn try_classify_lines<I, S, E>(
    file_name: &str,
    lines: I,
) -> Result<(Vec<CredentialRecord>, ClassifyStats), E>
where
    I: IntoIterator<Item = Result<S, E>>,
    S: AsRef<str>,
{
    let mut stats = ClassifyStats::default();
    let mut records = Vec::new();
    for (index, line) in lines.into_iter().enumerate() {
        let outcome = classify_indexed(file_name, index, line?.as_ref());
        stats.record(index, &outcome);
        if let Ok(record) = outcome {
            records.push(record);
        }
    }
    Ok((records, stats))
}
