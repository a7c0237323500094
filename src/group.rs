//! Grouping of classified records by normalized address, and the population
//! filter that decides which addresses are worth enriching.
use std::cmp::Reverse;
use std::collections::HashMap;

use crate::credential::CredentialRecord;

/// All records sharing one normalized address, in file order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressGroup {
    pub address: String,
    pub records: Vec<CredentialRecord>,
}

impl AddressGroup {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Address-keyed buckets of credential records.
#[derive(Debug, Default, Clone)]
pub struct AddressGroups {
    buckets: HashMap<String, Vec<CredentialRecord>>,
}

impl AddressGroups {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = CredentialRecord>,
    {
        let mut groups = Self::new();
        for record in records {
            groups.insert_or_create(record);
        }
        groups
    }

    /// Append `record` to the bucket for its address, creating the bucket on
    /// first sight of the address.
    pub fn insert_or_create(&mut self, record: CredentialRecord) {
        match self.buckets.get_mut(&record.normalized_address) {
            Some(bucket) => bucket.push(record),
            None => {
                self.buckets
                    .insert(record.normalized_address.clone(), vec![record]);
            }
        }
    }

    /// Number of distinct addresses.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn population(&self, address: &str) -> usize {
        self.buckets.get(address).map_or(0, Vec::len)
    }

    /// Keep groups whose population is strictly greater than `threshold`,
    /// largest first. Equal sizes are ordered by address so runs are
    /// reproducible.
    pub fn retain_populous(self, threshold: usize) -> Vec<AddressGroup> {
        let mut kept: Vec<AddressGroup> = self
            .buckets
            .into_iter()
            .filter(|(_, records)| records.len() > threshold)
            .map(|(address, records)| AddressGroup { address, records })
            .collect();
        kept.sort_by(|a, b| (Reverse(a.len()), &a.address).cmp(&(Reverse(b.len()), &b.address)));
        kept
    }
}
