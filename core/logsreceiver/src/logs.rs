//! Log records in the format of the host.
//!
//! The [`Converter`](crate::converter::Converter) produces batches of [`Entry`]; before
//! being given to the downstream consumer, a batch is turned into [`Logs`], where the
//! records are grouped by resource.

use serde::Serialize;

use crate::{
    converter::Batch,
    entry::{Attributes, Entry, Timestamp},
};

/// A group of log records, ready to be consumed.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Logs {
    pub resource_logs: Vec<ResourceLogs>,
}

/// The records that share the same resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceLogs {
    pub resource: Attributes,
    pub records: Vec<LogRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    pub time_unix_nano: u64,
    pub observed_time_unix_nano: u64,
    pub severity_number: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity_text: Option<String>,
    pub body: serde_json::Value,
    pub attributes: Attributes,
}

impl Logs {
    /// Converts a batch of entries, preserving their order within each resource.
    ///
    /// Resources appear in the order in which they are first seen in the batch.
    pub fn from_batch(batch: Batch) -> Self {
        let mut resource_logs: Vec<ResourceLogs> = Vec::new();
        let observed = Timestamp::now().unix_nanos();
        for entry in batch {
            let Entry {
                timestamp,
                body,
                attributes,
                resource,
                severity,
                severity_text,
            } = entry;
            let record = LogRecord {
                time_unix_nano: timestamp.unix_nanos(),
                observed_time_unix_nano: observed,
                severity_number: severity.number(),
                severity_text,
                body,
                attributes,
            };
            // Batches usually contain few resources: a linear search is enough.
            match resource_logs.iter_mut().find(|r| r.resource == resource) {
                Some(group) => group.records.push(record),
                None => resource_logs.push(ResourceLogs {
                    resource,
                    records: vec![record],
                }),
            }
        }
        Self { resource_logs }
    }

    /// Total number of records.
    pub fn record_count(&self) -> usize {
        self.resource_logs.iter().map(|r| r.records.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.record_count() == 0
    }

    /// Iterates over all the records, with their resource.
    pub fn records(&self) -> impl Iterator<Item = (&Attributes, &LogRecord)> {
        self.resource_logs
            .iter()
            .flat_map(|r| r.records.iter().map(move |record| (&r.resource, record)))
    }
}

impl From<Batch> for Logs {
    fn from(batch: Batch) -> Self {
        Self::from_batch(batch)
    }
}
