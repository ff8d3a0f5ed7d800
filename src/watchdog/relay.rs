//! Forwarding requests to a monitored gateway.
//!
//! Each call is retried up to `MAX_RETRIES` times, every attempt bounded
//! by `GATEWAY_TIMEOUT_MS`. Only the final outcome is reported back to the
//! circuit breaker.

use super::{GATEWAY_TIMEOUT_MS, MAX_RETRIES};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Request headers carried across the relay. Everything else, hop-by-hop
/// headers included, is dropped.
const FORWARDED_HEADERS: [&str; 3] = ["authorization", "content-type", "accept"];

#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub method: reqwest::Method,
    /// Path below the gateway root, without a leading slash.
    pub path: String,
    pub query: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct RelayResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    pub latency_ms: f64,
    pub attempts: u32,
}

/// Final failure of a relayed call, after all attempts.
#[derive(Debug, Clone)]
pub struct RelayFailure {
    pub attempts: u32,
    pub reason: String,
}

#[derive(Clone)]
pub struct Relay {
    http: reqwest::Client,
    timeout: Duration,
}

impl Default for Relay {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl Relay {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            timeout: Duration::from_millis(GATEWAY_TIMEOUT_MS as u64),
        }
    }

    /// Forward `req` to `base_url`, retrying transport errors and 5xx.
    ///
    /// A 4xx is a valid answer from a live gateway and is returned as is.
    pub async fn forward(
        &self,
        base_url: &str,
        req: &RelayRequest,
    ) -> Result<RelayResponse, RelayFailure> {
        let url = target_url(base_url, &req.path, req.query.as_deref());
        let mut last_reason = String::new();

        for attempt in 1..=MAX_RETRIES {
            let started = Instant::now();
            let mut builder = self
                .http
                .request(req.method.clone(), &url)
                .timeout(self.timeout)
                .body(req.body.clone());
            for (name, value) in &req.headers {
                if is_forwarded(name) {
                    builder = builder.header(name.as_str(), value.as_str());
                }
            }

            match builder.send().await {
                Ok(resp) if !resp.status().is_server_error() => {
                    let status = resp.status().as_u16();
                    let content_type = resp
                        .headers()
                        .get(reqwest::header::CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    match resp.bytes().await {
                        Ok(body) => {
                            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                            debug!("Relayed {} {} -> {} ({} attempts)", req.method, url, status, attempt);
                            return Ok(RelayResponse {
                                status,
                                content_type,
                                body: body.to_vec(),
                                latency_ms,
                                attempts: attempt,
                            });
                        }
                        Err(err) => last_reason = format!("reading response: {err}"),
                    }
                }
                Ok(resp) => last_reason = format!("gateway answered {}", resp.status()),
                Err(err) if err.is_timeout() => {
                    last_reason = format!("timed out after {} ms", GATEWAY_TIMEOUT_MS)
                }
                Err(err) => last_reason = err.to_string(),
            }
            warn!("Relay attempt {}/{} to {} failed: {}", attempt, MAX_RETRIES, url, last_reason);
        }

        Err(RelayFailure {
            attempts: MAX_RETRIES,
            reason: last_reason,
        })
    }

    /// Single `GET {base_url}/health`; returns the latency on a 2xx.
    pub async fn probe(&self, base_url: &str) -> Result<f64, String> {
        let started = Instant::now();
        let url = target_url(base_url, "health", None);
        let resp = self
            .http
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|err| err.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("health probe answered {}", resp.status()));
        }
        Ok(started.elapsed().as_secs_f64() * 1000.0)
    }
}

fn is_forwarded(name: &str) -> bool {
    FORWARDED_HEADERS
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(name))
}

fn target_url(base_url: &str, path: &str, query: Option<&str>) -> String {
    let mut url = format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_url_joins_path_and_query() {
        assert_eq!(
            target_url("http://gw:18789/", "/sessions", None),
            "http://gw:18789/sessions"
        );
        assert_eq!(
            target_url("http://gw:18789", "logs", Some("limit=5")),
            "http://gw:18789/logs?limit=5"
        );
        assert_eq!(target_url("http://gw", "status", Some("")), "http://gw/status");
    }

    #[test]
    fn hop_by_hop_headers_are_not_forwarded() {
        assert!(is_forwarded("Authorization"));
        assert!(is_forwarded("content-type"));
        assert!(!is_forwarded("connection"));
        assert!(!is_forwarded("transfer-encoding"));
        assert!(!is_forwarded("host"));
    }
}
