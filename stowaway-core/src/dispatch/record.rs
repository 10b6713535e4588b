//! Captured telemetry records

use chrono::{DateTime, Utc};
use std::fmt;

/// One captured telemetry event.
///
/// The payload is an already-escaped query string such as
/// `?idsite=1&rec=1&action_name=Home`; the dispatch pipeline never looks
/// inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    captured_at: DateTime<Utc>,
    payload: String,
}

impl Record {
    /// Capture a record now
    pub fn new(payload: impl Into<String>) -> Self {
        Self::at(Utc::now(), payload)
    }

    /// Capture a record with an explicit timestamp (used when restoring from disk)
    pub fn at(captured_at: DateTime<Utc>, payload: impl Into<String>) -> Self {
        Self {
            captured_at,
            payload: payload.into(),
        }
    }

    /// When the record was captured
    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Capture time as unix milliseconds, the resolution used on disk
    pub fn timestamp_millis(&self) -> i64 {
        self.captured_at.timestamp_millis()
    }

    /// The encoded query string
    pub fn payload(&self) -> &str {
        &self.payload
    }
}

impl From<String> for Record {
    fn from(payload: String) -> Self {
        Record::new(payload)
    }
}

impl From<&str> for Record {
    fn from(payload: &str) -> Self {
        Record::new(payload)
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.payload)
    }
}
