//! Native delayed delivery.
//!
//! A send carrying a delay is stored as a [`DelayedEntry`] instead of being
//! enqueued. Entry keys sort by due time: the partition key is the due time
//! in whole hours since the epoch and the row key starts with the
//! zero-padded due timestamp, so "everything due before now" is a prefix
//! scan of the table. The [`DelayedDeliveryPoller`] sends entries once they
//! are due.

pub mod poller;

pub use poller::{DelayedDeliveryPoller, PollOutcome};

use crate::message::{headers, MessageId, OutgoingMessage};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;

/// Partition key for entries due at `due`: whole hours since the Unix epoch,
/// zero padded to a fixed width so keys compare in due order for every
/// representable time
pub fn partition_key(due: DateTime<Utc>) -> String {
    format!("{:012}", due.timestamp().max(0) / 3_600)
}

/// Row key for an entry: due time in microseconds, zero padded, then the
/// message id to keep keys unique
pub fn row_key(due: DateTime<Utc>, message_id: &MessageId) -> String {
    format!("{:020}_{}", due.timestamp_micros().max(0), message_id)
}

/// A message waiting in the delayed store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayedEntry {
    pub partition_key: String,
    pub row_key: String,
    pub due: DateTime<Utc>,
    /// Destination address, always in `queue@alias` form
    pub destination: String,
    pub message_id: MessageId,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl DelayedEntry {
    /// Build an entry for `message`. A time-to-live travels as a header and
    /// counts from the moment the entry is sent on.
    pub fn new(
        due: DateTime<Utc>,
        destination: impl Into<String>,
        message: OutgoingMessage,
        time_to_live: Option<Duration>,
    ) -> Self {
        let mut headers = message.headers;
        if let Some(ttl) = time_to_live {
            headers.insert(
                headers::TIME_TO_BE_RECEIVED.to_string(),
                ttl.as_millis().to_string(),
            );
        }

        Self {
            partition_key: partition_key(due),
            row_key: row_key(due, &message.message_id),
            due,
            destination: destination.into(),
            message_id: message.message_id,
            headers,
            body: message.body,
        }
    }

    pub fn time_to_live(&self) -> Option<Duration> {
        self.headers
            .get(headers::TIME_TO_BE_RECEIVED)
            .and_then(|ms| ms.parse::<u64>().ok())
            .map(Duration::from_millis)
    }

    /// The message to send once the entry is due
    pub fn to_outgoing(&self) -> OutgoingMessage {
        let mut headers = self.headers.clone();
        headers.remove(headers::TIME_TO_BE_RECEIVED);

        OutgoingMessage {
            message_id: self.message_id.clone(),
            headers,
            body: self.body.clone(),
        }
    }
}
