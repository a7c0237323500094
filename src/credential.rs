//! Credential data model: the classified line (`CredentialRecord`) and the
//! persisted shape (`OutputRecord`) that joins it with the enrichment of its
//! address group.
//!
//! Redacted or missing credential fields are replaced with random
//! alphanumeric placeholders so that every accepted line still produces a row.
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};

/// Length of generated username placeholders.
pub const USERNAME_PLACEHOLDER_LEN: usize = 8;
/// Length of generated password placeholders.
pub const PASSWORD_PLACEHOLDER_LEN: usize = 16;

/// A single accepted input line, split into its address and credential parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub source_file: String,
    pub line_number: usize,
    pub normalized_address: String,
    pub username: String,
    pub password: String,
}

impl CredentialRecord {
    /// Build a record, masking empty or all-`*` credential fields.
    pub fn new(
        source_file: &str,
        line_number: usize,
        normalized_address: String,
        username: &str,
        password: &str,
    ) -> Self {
        Self {
            source_file: source_file.to_string(),
            line_number,
            normalized_address,
            username: mask_redacted(username, USERNAME_PLACEHOLDER_LEN),
            password: mask_redacted(password, PASSWORD_PLACEHOLDER_LEN),
        }
    }
}

/// True for values that carry no usable credential: empty, or only asterisks.
pub fn is_redacted(value: &str) -> bool {
    value.chars().all(|c| c == '*')
}

fn mask_redacted(value: &str, placeholder_len: usize) -> String {
    if is_redacted(value) {
        random_placeholder(placeholder_len)
    } else {
        value.to_string()
    }
}

/// Random alphanumeric string of `len` characters.
pub fn random_placeholder(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// The record handed to the persistence gateway. One per `CredentialRecord`;
/// every record of an address group shares the same enrichment fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub username: String,
    pub password: String,
    pub address: String,
    pub scheme: Option<String>,
    pub port: Option<u16>,
    pub url_path: Option<String>,
    pub ip_address: Option<String>,
    pub title: Option<String>,
    pub file_name: String,
    pub line_number: usize,
    /// Classification assigned outside the pipeline; always `None` here.
    pub application: Option<String>,
    pub tags: Vec<String>,
}
