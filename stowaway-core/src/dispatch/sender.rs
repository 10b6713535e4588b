//! HTTP transport for packets
//!
//! GET packets are sent as-is; POST packets carry a JSON bulk body with
//! `Content-Type: application/json`, optionally gzip-compressed with
//! `Content-Encoding: gzip`. Only 200 and 204 count as delivered.

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::StatusCode;

use crate::error::{Error, Result};

use super::packet::Packet;

/// Delivers one packet per call.
///
/// Any `Err` is treated as a transient failure by the dispatcher: the
/// packet's records are requeued and retried after backoff.
#[async_trait]
pub trait PacketSender: Send + Sync {
    /// Send one packet, bounded by the configured timeout
    async fn send(&self, packet: &Packet) -> Result<()>;

    /// Timeout for connecting and reading the response
    fn set_timeout(&self, timeout: Duration);

    /// Whether POST bodies are gzip-compressed
    fn set_gzip(&self, gzip: bool);
}

/// `PacketSender` backed by a shared reqwest client
pub struct HttpPacketSender {
    http_client: reqwest::Client,
    timeout_ms: AtomicU64,
    gzip: AtomicBool,
}

impl HttpPacketSender {
    /// Create a sender; settings can be changed later through the trait setters
    pub fn new(timeout: Duration, gzip: bool) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("stowaway/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            timeout_ms: AtomicU64::new(duration_millis(timeout)),
            gzip: AtomicBool::new(gzip),
        })
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed))
    }

    fn gzip(&self) -> bool {
        self.gzip.load(Ordering::Relaxed)
    }

    fn request(&self, packet: &Packet) -> Result<reqwest::RequestBuilder> {
        let Some(body) = packet.post_body() else {
            return Ok(self.http_client.get(packet.target_url()));
        };

        let builder = self
            .http_client
            .post(packet.target_url())
            .header(CONTENT_TYPE, "application/json");

        if self.gzip() {
            Ok(builder
                .header(CONTENT_ENCODING, "gzip")
                .body(gzip_body(body)?))
        } else {
            Ok(builder.body(body.to_owned()))
        }
    }
}

#[async_trait]
impl PacketSender for HttpPacketSender {
    async fn send(&self, packet: &Packet) -> Result<()> {
        tracing::trace!(%packet, "Sending");

        let response = self
            .request(packet)?
            .timeout(self.timeout())
            .send()
            .await
            .map_err(|e| Error::Transmission(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        tracing::trace!(status = status.as_u16(), "Transmission finished");

        if status == StatusCode::OK || status == StatusCode::NO_CONTENT {
            Ok(())
        } else {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            Err(Error::Transmission(format!(
                "API error ({}): {}",
                status, error_text
            )))
        }
    }

    fn set_timeout(&self, timeout: Duration) {
        self.timeout_ms
            .store(duration_millis(timeout), Ordering::Relaxed);
    }

    fn set_gzip(&self, gzip: bool) {
        self.gzip.store(gzip, Ordering::Relaxed);
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn gzip_body(body: &str) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body.as_bytes())?;
    Ok(encoder.finish()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{PacketFactory, Record};
    use flate2::read::GzDecoder;
    use std::io::Read;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn factory(server: &MockServer) -> PacketFactory {
        PacketFactory::new(format!("{}/matomo.php", server.uri()), None)
    }

    fn sender() -> HttpPacketSender {
        HttpPacketSender::new(Duration::from_secs(5), false).unwrap()
    }

    #[tokio::test]
    async fn test_get_packet_succeeds_on_204() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/matomo.php"))
            .and(query_param("idsite", "1"))
            .and(query_param("action_name", "Home"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let packets = factory(&server).build_packets(&[Record::new("?idsite=1&action_name=Home")]);
        assert!(sender().send(&packets[0]).await.is_ok());
    }

    #[tokio::test]
    async fn test_post_packet_carries_json_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/matomo.php"))
            .and(header("content-type", "application/json"))
            .and(body_json(serde_json::json!({
                "requests": ["?idsite=1&seq=0", "?idsite=1&seq=1"]
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let packets = factory(&server).build_packets(&[
            Record::new("?idsite=1&seq=0"),
            Record::new("?idsite=1&seq=1"),
        ]);
        assert!(sender().send(&packets[0]).await.is_ok());
    }

    #[tokio::test]
    async fn test_gzip_post_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("content-encoding", "gzip"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sender = sender();
        sender.set_gzip(true);
        let packets = factory(&server).build_packets(&[
            Record::new("?idsite=1&seq=0"),
            Record::new("?idsite=1&seq=1"),
        ]);
        sender.send(&packets[0]).await.unwrap();

        let received = server.received_requests().await.unwrap();
        let mut decoded = String::new();
        GzDecoder::new(&received[0].body[..])
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, packets[0].post_body().unwrap());
    }

    #[tokio::test]
    async fn test_other_status_is_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let packets = factory(&server).build_packets(&[Record::new("?idsite=1")]);
        let err = sender().send(&packets[0]).await.unwrap_err();
        assert!(matches!(err, Error::Transmission(msg) if msg.contains("500")));
    }

    #[tokio::test]
    async fn test_timeout_is_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let sender = sender();
        sender.set_timeout(Duration::from_millis(50));
        let packets = factory(&server).build_packets(&[Record::new("?idsite=1")]);
        assert!(sender.send(&packets[0]).await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_failure() {
        let factory = PacketFactory::new("http://127.0.0.1:9/matomo.php", None);
        let packets = factory.build_packets(&[Record::new("?idsite=1")]);
        assert!(sender().send(&packets[0]).await.is_err());
    }
}
