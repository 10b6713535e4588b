//! Wire packets and the factory that batches records into them
//!
//! A single record travels as a GET request with the payload appended to the
//! endpoint. Larger drains are split into pages of [`PAGE_SIZE`] and sent as
//! bulk POST requests:
//!
//! ```text
//! {
//!   "requests": ["?idsite=1&url=http://example.org&rec=1", "?idsite=1&rec=1"],
//!   "token_auth": "33dc3f2536d3025974cccb4b4d2d98f4"
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::error::Result;

use super::record::Record;

/// Maximum number of records in one bulk POST
pub const PAGE_SIZE: usize = 20;

/// One network-transmittable unit built from one or more records
#[derive(Debug, Clone)]
pub struct Packet {
    target_url: String,
    post_body: Option<String>,
    captured_at: DateTime<Utc>,
    record_count: usize,
    /// Position of the first covered record in the drained list
    offset: usize,
}

impl Packet {
    fn get(target_url: String, offset: usize) -> Self {
        Self {
            target_url,
            post_body: None,
            captured_at: Utc::now(),
            record_count: 1,
            offset,
        }
    }

    fn post(target_url: String, body: String, record_count: usize, offset: usize) -> Self {
        Self {
            target_url,
            post_body: Some(body),
            captured_at: Utc::now(),
            record_count,
            offset,
        }
    }

    /// Full request URL (endpoint plus payload for GET)
    pub fn target_url(&self) -> &str {
        &self.target_url
    }

    /// JSON body; `None` for GET packets
    pub fn post_body(&self) -> Option<&str> {
        self.post_body.as_deref()
    }

    /// Whether this packet is sent as a bulk POST
    pub fn is_post(&self) -> bool {
        self.post_body.is_some()
    }

    /// When the packet was built
    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Number of records this packet delivers
    pub fn record_count(&self) -> usize {
        self.record_count
    }

    pub(crate) fn offset(&self) -> usize {
        self.offset
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.post_body {
            Some(body) => write!(f, "Packet(type=POST, data={})", body),
            None => write!(f, "Packet(type=GET, data={})", self.target_url),
        }
    }
}

/// Request body for bulk POST
#[derive(Serialize)]
struct BulkRequest<'a> {
    requests: Vec<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    token_auth: Option<&'a str>,
}

/// Groups drained records into packets for one endpoint
#[derive(Debug, Clone)]
pub struct PacketFactory {
    endpoint: String,
    auth_token: Option<String>,
}

impl PacketFactory {
    pub fn new(endpoint: impl Into<String>, auth_token: Option<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            auth_token,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Build packets covering `records` in order.
    ///
    /// Batches that cannot be encoded are logged and skipped; the remaining
    /// batches are still returned.
    pub fn build_packets(&self, records: &[Record]) -> Vec<Packet> {
        match records {
            [] => Vec::new(),
            [single] => self.build_get(single, 0).into_iter().collect(),
            _ => {
                let mut packets = Vec::with_capacity(records.len().div_ceil(PAGE_SIZE));
                for (page, batch) in records.chunks(PAGE_SIZE).enumerate() {
                    let offset = page * PAGE_SIZE;
                    let packet = match batch {
                        [single] => self.build_get(single, offset),
                        _ => match self.build_post(batch, offset) {
                            Ok(packet) => Some(packet),
                            Err(e) => {
                                tracing::warn!(
                                    error = %e,
                                    records = batch.len(),
                                    "Cannot encode bulk request, dropping batch"
                                );
                                None
                            }
                        },
                    };
                    packets.extend(packet);
                }
                packets
            }
        }
    }

    fn build_get(&self, record: &Record, offset: usize) -> Option<Packet> {
        if record.payload().is_empty() {
            tracing::debug!("Skipping record with empty payload");
            return None;
        }
        Some(Packet::get(
            format!("{}{}", self.endpoint, record.payload()),
            offset,
        ))
    }

    fn build_post(&self, batch: &[Record], offset: usize) -> Result<Packet> {
        let body = BulkRequest {
            requests: batch.iter().map(Record::payload).collect(),
            token_auth: self.auth_token.as_deref(),
        };
        let json = serde_json::to_string(&body)?;
        Ok(Packet::post(self.endpoint.clone(), json, batch.len(), offset))
    }
}
