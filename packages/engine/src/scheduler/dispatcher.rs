//! Dispatcher - executes one endpoint.
//!
//! The dispatcher never returns an error: every failure mode (blocked URL,
//! missing signing key, timeout, non-2xx, transport fault) is encoded in
//! the `ExecutionResult` so the scheduler can record it as a failed run
//! and move on.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, warn};
use url::{Host, Url};

use super::endpoint::Endpoint;
use super::run::{truncate_body, RunStatus};
use crate::kernel::signing::{sign_request, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use crate::kernel::traits::{Clock, SigningKeyProvider};

/// Outcome of a single dispatch.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub status: RunStatus,
    pub duration_ms: i64,
    pub status_code: Option<i32>,
    pub response_body: Option<String>,
    pub error_message: Option<String>,
}

impl ExecutionResult {
    fn rejected(message: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            duration_ms: 0,
            status_code: None,
            response_body: None,
            error_message: Some(message.into()),
        }
    }
}

#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn execute(&self, endpoint: &Endpoint) -> ExecutionResult;
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Used when the endpoint does not set `timeout_ms`.
    pub default_timeout_ms: i64,
    /// Used when the endpoint does not set `max_response_size_kb`.
    pub default_max_response_size_kb: i64,
    /// Fail dispatch when the tenant has no signing key.
    pub signing_required: bool,
    /// Disable the private-address guard (development only).
    pub allow_private_urls: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            default_max_response_size_kb: 100,
            signing_required: false,
            allow_private_urls: false,
        }
    }
}

/// Production dispatcher on reqwest.
pub struct HttpDispatcher {
    client: reqwest::Client,
    keys: Arc<dyn SigningKeyProvider>,
    clock: Arc<dyn Clock>,
    config: DispatcherConfig,
}

impl HttpDispatcher {
    pub fn new(
        client: reqwest::Client,
        keys: Arc<dyn SigningKeyProvider>,
        clock: Arc<dyn Clock>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            client,
            keys,
            clock,
            config,
        }
    }

    fn build_headers(&self, endpoint: &Endpoint) -> HeaderMap {
        let mut headers = HeaderMap::new();

        if let Some(custom) = endpoint.headers_json.as_ref().and_then(|h| h.as_object()) {
            for (key, value) in custom {
                let Some(value) = value.as_str() else {
                    continue;
                };
                match (
                    HeaderName::from_bytes(key.as_bytes()),
                    HeaderValue::from_str(value),
                ) {
                    (Ok(name), Ok(value)) => {
                        headers.insert(name, value);
                    }
                    _ => {
                        warn!(endpoint_id = %endpoint.id, header = %key, "skipping invalid header");
                    }
                }
            }
        }

        headers
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn execute(&self, endpoint: &Endpoint) -> ExecutionResult {
        let now = self.clock.now();

        // 1. SSRF guard.
        if let Err(reason) = check_url(&endpoint.url, self.config.allow_private_urls) {
            debug!(endpoint_id = %endpoint.id, url = %endpoint.url, reason = reason, "url rejected");
            return ExecutionResult::rejected("URL not allowed");
        }

        // 2. Body resolution: fresh AI body hint > static body > none.
        let body = endpoint
            .resolve_body(now)
            .map(|value| value.to_string());

        // 3. Signing.
        let secret = match self.keys.get_key(&endpoint.tenant_id).await {
            Ok(secret) => secret,
            Err(e) => {
                warn!(endpoint_id = %endpoint.id, error = %e, "signing key lookup failed");
                return ExecutionResult::rejected("signing key lookup failed");
            }
        };
        if secret.is_none() && self.config.signing_required {
            return ExecutionResult::rejected("signing required but no key available");
        }

        let mut headers = self.build_headers(endpoint);
        if let Some(secret) = &secret {
            let unix_ts = now.timestamp();
            let signature = sign_request(secret, unix_ts, body.as_deref().unwrap_or(""));
            // Names and values are ASCII by construction.
            if let (Ok(ts_name), Ok(sig_name), Ok(ts_value), Ok(sig_value)) = (
                HeaderName::from_bytes(TIMESTAMP_HEADER.as_bytes()),
                HeaderName::from_bytes(SIGNATURE_HEADER.as_bytes()),
                HeaderValue::from_str(&unix_ts.to_string()),
                HeaderValue::from_str(&signature),
            ) {
                headers.insert(ts_name, ts_value);
                headers.insert(sig_name, sig_value);
            }
        }

        // 4. Issue the request under the endpoint's timeout.
        let timeout_ms = endpoint
            .timeout_ms
            .unwrap_or(self.config.default_timeout_ms)
            .max(1) as u64;
        let max_kb = endpoint
            .max_response_size_kb
            .unwrap_or(self.config.default_max_response_size_kb);

        let mut request = self
            .client
            .request(endpoint.method.as_reqwest(), &endpoint.url)
            .headers(headers)
            .timeout(Duration::from_millis(timeout_ms));
        if let Some(body) = body {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }

        let started = Instant::now();
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                let duration_ms = started.elapsed().as_millis() as i64;
                return ExecutionResult {
                    status: RunStatus::Failed,
                    duration_ms,
                    status_code: None,
                    response_body: None,
                    error_message: Some(e.to_string()),
                };
            }
        };

        // 5. Capture and classify.
        let status_code = response.status().as_u16() as i32;
        let body = read_capped(response, max_kb).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        if (200..300).contains(&status_code) {
            ExecutionResult {
                status: RunStatus::Success,
                duration_ms,
                status_code: Some(status_code),
                response_body: body,
                error_message: None,
            }
        } else {
            ExecutionResult {
                status: RunStatus::Failed,
                duration_ms,
                status_code: Some(status_code),
                response_body: body,
                error_message: Some(format!("endpoint returned HTTP {}", status_code)),
            }
        }
    }
}

/// Read at most `max_kb` KiB of the response body.
async fn read_capped(mut response: reqwest::Response, max_kb: i64) -> Option<String> {
    let cap = (max_kb.max(0) as usize) * 1024;
    let mut buf: Vec<u8> = Vec::new();

    while let Ok(Some(chunk)) = response.chunk().await {
        let remaining = cap.saturating_sub(buf.len());
        if remaining == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
    }

    if buf.is_empty() {
        return None;
    }
    let text = String::from_utf8_lossy(&buf).into_owned();
    Some(truncate_body(&text, max_kb))
}

/// SSRF guard: http(s) only, no literal private/loopback/link-local hosts.
///
/// Only literal addresses (and `localhost`) are rejected; resolved-DNS
/// checks belong to the network layer, not this guard.
fn check_url(raw: &str, allow_private: bool) -> Result<Url, &'static str> {
    let url = Url::parse(raw).map_err(|_| "malformed url")?;

    match url.scheme() {
        "http" | "https" => {}
        _ => return Err("scheme not allowed"),
    }

    if allow_private {
        return Ok(url);
    }

    match url.host() {
        Some(Host::Domain(domain)) => {
            if domain.eq_ignore_ascii_case("localhost") {
                return Err("loopback host");
            }
        }
        Some(Host::Ipv4(ip)) => {
            if is_private_v4(ip) {
                return Err("private address");
            }
        }
        Some(Host::Ipv6(ip)) => {
            if is_private_v6(ip) {
                return Err("private address");
            }
        }
        None => return Err("missing host"),
    }

    Ok(url)
}

fn is_private_v4(ip: std::net::Ipv4Addr) -> bool {
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
}

fn is_private_v6(ip: std::net::Ipv6Addr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() {
        return true;
    }
    // Mapped v4 carries the v4 rules.
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_private_v4(v4);
    }
    let segments = ip.segments();
    // fc00::/7 unique local, fe80::/10 link local.
    (segments[0] & 0xfe00) == 0xfc00 || (segments[0] & 0xffc0) == 0xfe80
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_public_http_and_https() {
        assert!(check_url("https://api.example.com/hook", false).is_ok());
        assert!(check_url("http://93.184.216.34/hook", false).is_ok());
    }

    #[test]
    fn test_rejects_non_http_schemes() {
        assert!(check_url("ftp://example.com/x", false).is_err());
        assert!(check_url("file:///etc/passwd", false).is_err());
        assert!(check_url("gopher://example.com", false).is_err());
    }

    #[test]
    fn test_rejects_loopback() {
        assert!(check_url("http://127.0.0.1/admin", false).is_err());
        assert!(check_url("http://localhost:8080/", false).is_err());
        assert!(check_url("http://[::1]/", false).is_err());
    }

    #[test]
    fn test_rejects_rfc1918_and_link_local() {
        assert!(check_url("http://10.0.0.8/", false).is_err());
        assert!(check_url("http://172.16.4.1/", false).is_err());
        assert!(check_url("http://192.168.1.10/", false).is_err());
        assert!(check_url("http://169.254.169.254/latest/meta-data", false).is_err());
    }

    #[test]
    fn test_rejects_private_v6_ranges() {
        assert!(check_url("http://[fc00::1]/", false).is_err());
        assert!(check_url("http://[fe80::1]/", false).is_err());
        assert!(check_url("http://[::ffff:192.168.0.1]/", false).is_err());
    }

    #[test]
    fn test_allowlist_flag_admits_private_addresses() {
        assert!(check_url("http://127.0.0.1:9000/dev", true).is_ok());
        assert!(check_url("http://192.168.1.10/", true).is_ok());
        // Scheme restrictions hold even with the flag.
        assert!(check_url("file:///etc/passwd", true).is_err());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(check_url("not a url", false).is_err());
        assert!(check_url("", false).is_err());
    }
}
