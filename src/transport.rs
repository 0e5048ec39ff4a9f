//! Single-attempt HTTP transport.
//!
//! `send` performs exactly one delivery attempt: envelope the payloads for
//! the stream kind, gzip, POST, classify the response. Retry, failover and
//! circuit state all live in the forwarder; the transport holds nothing but
//! the connection pool.

use crate::config::EndpointConfig;
use crate::stream::StreamKind;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;
use std::io::Write;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

/// Response body characters kept for client-error logging.
const BODY_PREFIX_LIMIT: usize = 256;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Everything one delivery attempt can come back with.
#[derive(Debug, Clone)]
pub enum SendOutcome {
    Success { bytes_sent: u64, items: usize },
    RateLimited { retry_after: Option<Duration> },
    ServerError { status: u16 },
    /// Non-retryable client fault. `status` 0 marks a local encoding
    /// failure that never reached the wire.
    ClientError { status: u16, body: String },
    ConnectionError { message: String },
    DnsError { message: String },
    Timeout,
}

impl SendOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SendOutcome::Success { .. })
    }

    /// Outcomes that feed the circuit breaker's failure streak. Rate
    /// limiting and client faults never do.
    pub fn counts_toward_breaker(&self) -> bool {
        matches!(
            self,
            SendOutcome::ServerError { .. }
                | SendOutcome::ConnectionError { .. }
                | SendOutcome::DnsError { .. }
                | SendOutcome::Timeout
        )
    }

    /// Connection-class failures: the remote was never reached.
    pub fn is_connection_class(&self) -> bool {
        matches!(
            self,
            SendOutcome::ConnectionError { .. } | SendOutcome::DnsError { .. } | SendOutcome::Timeout
        )
    }

    pub fn is_dns(&self) -> bool {
        matches!(self, SendOutcome::DnsError { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            SendOutcome::Success { .. } => "success",
            SendOutcome::RateLimited { .. } => "rate_limited",
            SendOutcome::ServerError { .. } => "server_error",
            SendOutcome::ClientError { .. } => "client_error",
            SendOutcome::ConnectionError { .. } => "connection_error",
            SendOutcome::DnsError { .. } => "dns_error",
            SendOutcome::Timeout => "timeout",
        }
    }
}

#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    tenant_id: String,
    user_agent: String,
}

impl HttpTransport {
    pub fn new(tenant_id: impl Into<String>) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().pool_max_idle_per_host(10).build()?;
        Ok(Self {
            client,
            tenant_id: tenant_id.into(),
            user_agent: format!("packrat/{}", env!("CARGO_PKG_VERSION")),
        })
    }

    /// One delivery attempt. Never retries, never consults shared state.
    pub async fn send(
        &self,
        endpoint: &EndpointConfig,
        kind: StreamKind,
        payloads: &[Value],
    ) -> SendOutcome {
        let url = endpoint.url_for(kind);

        let body = match encode_body(kind, payloads) {
            Ok(body) => body,
            Err(err) => {
                return SendOutcome::ClientError { status: 0, body: err.to_string() };
            }
        };
        let compressed = match gzip(&body) {
            Ok(compressed) => compressed,
            Err(err) => {
                return SendOutcome::ClientError { status: 0, body: err.to_string() };
            }
        };

        // Resolve the host up front so resolver failures classify as DNS
        // rather than generic connection errors.
        if let Err(outcome) = resolve_host(&url).await {
            return outcome;
        }

        let bytes_sent = compressed.len() as u64;
        let response = self
            .client
            .post(&url)
            .timeout(endpoint.timeout)
            .header("api-key", &endpoint.api_key)
            .header("tenant-id", &self.tenant_id)
            .header("content-type", "application/json")
            .header("content-encoding", "gzip")
            .header("user-agent", &self.user_agent)
            .body(compressed)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => return classify_request_error(&err),
        };

        let status = response.status();
        if status.is_success() {
            return SendOutcome::Success { bytes_sent, items: payloads.len() };
        }
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return SendOutcome::RateLimited { retry_after };
        }
        if status.is_server_error() {
            return SendOutcome::ServerError { status: status.as_u16() };
        }

        let body: String = response
            .text()
            .await
            .unwrap_or_default()
            .chars()
            .take(BODY_PREFIX_LIMIT)
            .collect();
        SendOutcome::ClientError { status: status.as_u16(), body }
    }

    /// Startup probe: can the endpoint's host be resolved at all?
    pub async fn probe_dns(endpoint: &EndpointConfig) -> Result<(), String> {
        match resolve_host(&endpoint.url).await {
            Ok(()) => Ok(()),
            Err(SendOutcome::DnsError { message }) => Err(message),
            Err(other) => Err(other.label().to_string()),
        }
    }
}

/// Wrap payloads in the kind-specific envelope. Metrics and logs travel
/// under a single key; traces and topology are bare sequences.
pub(crate) fn encode_body(kind: StreamKind, payloads: &[Value]) -> serde_json::Result<Vec<u8>> {
    let body = match kind {
        StreamKind::Metrics => serde_json::json!({ "metrics": payloads }),
        StreamKind::Logs => serde_json::json!({ "logs": payloads }),
        StreamKind::Traces | StreamKind::Topology => Value::Array(payloads.to_vec()),
    };
    serde_json::to_vec(&body)
}

pub(crate) fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

/// Resolve the URL's host, mapping failures into `SendOutcome` variants.
/// Literal IP hosts skip resolution.
async fn resolve_host(url: &str) -> Result<(), SendOutcome> {
    let parsed = reqwest::Url::parse(url).map_err(|err| SendOutcome::ClientError {
        status: 0,
        body: format!("invalid url {url}: {err}"),
    })?;
    let host = match parsed.host_str() {
        Some(host) => host.to_string(),
        None => {
            return Err(SendOutcome::ClientError {
                status: 0,
                body: format!("url {url} has no host"),
            })
        }
    };
    if host.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    let port = parsed.port_or_known_default().unwrap_or(80);

    let result = tokio::net::lookup_host((host.as_str(), port)).await;
    match result {
        Ok(mut addrs) => {
            if addrs.next().is_some() {
                Ok(())
            } else {
                Err(SendOutcome::DnsError { message: format!("no addresses for {host}") })
            }
        }
        Err(err) => Err(SendOutcome::DnsError { message: format!("{host}: {err}") }),
    }
}

fn classify_request_error(err: &reqwest::Error) -> SendOutcome {
    if err.is_timeout() {
        return SendOutcome::Timeout;
    }
    // reqwest re-resolves internally; if its resolver disagrees with our
    // pre-check, still classify by the error chain.
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(current) = source {
        let text = current.to_string().to_ascii_lowercase();
        if text.contains("dns error") || text.contains("failed to lookup address") {
            return SendOutcome::DnsError { message: err.to_string() };
        }
        source = current.source();
    }
    SendOutcome::ConnectionError { message: err.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use serde_json::json;
    use std::io::Read;

    fn decode(bytes: &[u8]) -> Value {
        let mut decoder = GzDecoder::new(bytes);
        let mut raw = String::new();
        decoder.read_to_string(&mut raw).unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    #[test]
    fn metrics_and_logs_are_enveloped() {
        let payloads = vec![json!({"name": "cpu", "value": 0.5})];

        let metrics: Value =
            serde_json::from_slice(&encode_body(StreamKind::Metrics, &payloads).unwrap()).unwrap();
        assert_eq!(metrics, json!({"metrics": [{"name": "cpu", "value": 0.5}]}));

        let logs: Value =
            serde_json::from_slice(&encode_body(StreamKind::Logs, &payloads).unwrap()).unwrap();
        assert_eq!(logs, json!({"logs": [{"name": "cpu", "value": 0.5}]}));
    }

    #[test]
    fn traces_and_topology_are_bare_sequences() {
        let payloads = vec![json!({"span": 1}), json!({"span": 2})];
        let traces: Value =
            serde_json::from_slice(&encode_body(StreamKind::Traces, &payloads).unwrap()).unwrap();
        assert_eq!(traces, json!([{"span": 1}, {"span": 2}]));

        let topology: Value =
            serde_json::from_slice(&encode_body(StreamKind::Topology, &payloads).unwrap()).unwrap();
        assert_eq!(topology, json!([{"span": 1}, {"span": 2}]));
    }

    #[test]
    fn gzip_round_trips() {
        let payloads = vec![json!({"k": "v"})];
        let body = encode_body(StreamKind::Metrics, &payloads).unwrap();
        let compressed = gzip(&body).unwrap();
        assert_eq!(decode(&compressed), json!({"metrics": [{"k": "v"}]}));
    }

    #[tokio::test]
    async fn invalid_hostname_classifies_as_dns() {
        let outcome = resolve_host("http://nope.invalid:9/metrics").await.unwrap_err();
        assert!(outcome.is_dns(), "got {outcome:?}");
    }

    #[tokio::test]
    async fn literal_ip_skips_resolution() {
        assert!(resolve_host("http://127.0.0.1:9/metrics").await.is_ok());
    }

    #[tokio::test]
    async fn classifies_statuses_from_a_live_server() {
        use httpmock::prelude::*;
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/metrics");
                then.status(200);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/logs");
                then.status(429).header("retry-after", "7");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/traces");
                then.status(500);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/topology");
                then.status(422).body("unprocessable thing");
            })
            .await;

        let transport = HttpTransport::new("tenant").unwrap();
        let endpoint = EndpointConfig::new(server.base_url(), "key");
        let payloads = vec![json!({"v": 1})];

        match transport.send(&endpoint, StreamKind::Metrics, &payloads).await {
            SendOutcome::Success { bytes_sent, items } => {
                assert!(bytes_sent > 0);
                assert_eq!(items, 1);
            }
            other => panic!("expected success, got {other:?}"),
        }
        match transport.send(&endpoint, StreamKind::Logs, &payloads).await {
            SendOutcome::RateLimited { retry_after } => {
                assert_eq!(retry_after, Some(Duration::from_secs(7)));
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
        match transport.send(&endpoint, StreamKind::Traces, &payloads).await {
            SendOutcome::ServerError { status } => assert_eq!(status, 500),
            other => panic!("expected server error, got {other:?}"),
        }
        match transport.send(&endpoint, StreamKind::Topology, &payloads).await {
            SendOutcome::ClientError { status, body } => {
                assert_eq!(status, 422);
                assert!(body.contains("unprocessable"));
            }
            other => panic!("expected client error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn refused_connection_classifies_as_connection_error() {
        let transport = HttpTransport::new("tenant").unwrap();
        let endpoint = EndpointConfig::new("http://127.0.0.1:9", "key");
        let outcome = transport.send(&endpoint, StreamKind::Metrics, &[json!({"v": 1})]).await;
        assert!(
            matches!(outcome, SendOutcome::ConnectionError { .. }),
            "got {outcome:?}"
        );
    }

    #[test]
    fn breaker_classification() {
        assert!(SendOutcome::ServerError { status: 503 }.counts_toward_breaker());
        assert!(SendOutcome::Timeout.counts_toward_breaker());
        assert!(SendOutcome::Timeout.is_connection_class());
        assert!(!SendOutcome::ServerError { status: 503 }.is_connection_class());
        assert!(!SendOutcome::RateLimited { retry_after: None }.counts_toward_breaker());
        assert!(!SendOutcome::ClientError { status: 400, body: String::new() }
            .counts_toward_breaker());
    }
}
