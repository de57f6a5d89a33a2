//! HTTP transport: one request, one classified outcome
//!
//! GET/DELETE carry parameters as a query string, POST/PATCH as a JSON
//! body. Signed calls attach the `X-API-Key`/`X-Signature`/`X-Timestamp`/
//! `X-Window` headers; public market-data calls never do. All traffic is
//! tunnelled through the account's SOCKS5 proxy when one is bound, and
//! carries the account's fake identity headers and cookies.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, COOKIE};
use reqwest::Method;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::warn;

use super::error::ExchangeError;
use super::signer::{render_param, RequestSigner, SIGNING_WINDOW_MS};
use crate::types::FakeIdentity;

/// Timeout classes, one per operation kind.
pub const SIGNED_TIMEOUT: Duration = Duration::from_secs(20);
pub const PUBLIC_TIMEOUT: Duration = Duration::from_secs(30);
pub const PROXY_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Transport {
    base_url: String,
    identity: FakeIdentity,
    /// Mutated by proxy rotation while requests are in flight.
    proxy_url: RwLock<Option<String>>,
}

impl Transport {
    pub fn new(base_url: &str, identity: FakeIdentity, proxy_url: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            identity,
            proxy_url: RwLock::new(proxy_url),
        }
    }

    pub async fn proxy_url(&self) -> Option<String> {
        self.proxy_url.read().await.clone()
    }

    pub async fn set_proxy(&self, proxy_url: Option<String>) {
        *self.proxy_url.write().await = proxy_url;
    }

    /// Signed request. A fresh timestamp and signature are produced on
    /// every invocation, so retries re-sign.
    pub async fn send_signed(
        &self,
        signer: &RequestSigner,
        instruction: &str,
        method: Method,
        endpoint: &str,
        params: Option<&BTreeMap<String, Value>>,
    ) -> Result<Value, ExchangeError> {
        let timestamp = Utc::now().timestamp_millis();
        let signature = signer.sign(instruction, timestamp, params);

        let mut headers = self.common_headers();
        insert_header(&mut headers, "X-API-Key", signer.api_key());
        insert_header(&mut headers, "X-Signature", &signature);
        insert_header(&mut headers, "X-Timestamp", &timestamp.to_string());
        insert_header(&mut headers, "X-Window", &SIGNING_WINDOW_MS.to_string());

        self.dispatch(method, endpoint, params, headers, SIGNED_TIMEOUT)
            .await
    }

    /// Public market-data request. No auth headers, ever.
    pub async fn send_public(
        &self,
        method: Method,
        endpoint: &str,
        params: Option<&BTreeMap<String, Value>>,
    ) -> Result<Value, ExchangeError> {
        let headers = self.common_headers();
        self.dispatch(method, endpoint, params, headers, PUBLIC_TIMEOUT)
            .await
    }

    /// Fetch an absolute URL through the bound proxy and report the
    /// round-trip latency. Used only for egress verification.
    pub async fn probe(&self, url: &str) -> Result<(Value, u128), ExchangeError> {
        let client = self.build_client(PROXY_CHECK_TIMEOUT).await?;
        let started = Instant::now();

        let response = client
            .get(url)
            .headers(self.common_headers())
            .send()
            .await
            .map_err(|e| ExchangeError::from_network_error(&e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ExchangeError::from_network_error(&e))?;
        let elapsed = started.elapsed().as_millis();

        if !status.is_success() {
            return Err(ExchangeError::Api {
                status: status.as_u16(),
                message: snippet(&text),
            });
        }
        let value = serde_json::from_str(&text)
            .map_err(|_| ExchangeError::InvalidJson(snippet(&text)))?;
        Ok((value, elapsed))
    }

    async fn dispatch(
        &self,
        method: Method,
        endpoint: &str,
        params: Option<&BTreeMap<String, Value>>,
        headers: HeaderMap,
        timeout: Duration,
    ) -> Result<Value, ExchangeError> {
        let url = format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'));
        let client = self.build_client(timeout).await?;

        let mut request = client.request(method.clone(), &url).headers(headers);
        if let Some(params) = params {
            if method == Method::POST || method == Method::PATCH {
                let body: serde_json::Map<String, Value> =
                    params.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                request = request.body(Value::Object(body).to_string());
            } else {
                let pairs: Vec<(String, String)> = params
                    .iter()
                    .map(|(k, v)| (k.clone(), render_param(v)))
                    .collect();
                request = request.query(&pairs);
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| ExchangeError::from_network_error(&e))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ExchangeError::from_network_error(&e))?;

        classify_body(status.as_u16(), status.is_success(), &text)
    }

    /// Per-call client, so a rotated proxy takes effect on the next
    /// attempt without tearing down anything shared.
    async fn build_client(&self, timeout: Duration) -> Result<reqwest::Client, ExchangeError> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(proxy_url) = self.proxy_url.read().await.as_deref() {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|e| ExchangeError::Unexpected(format!("bad proxy url: {e}")))?;
            builder = builder.proxy(proxy);
        }
        builder
            .build()
            .map_err(|e| ExchangeError::Unexpected(format!("client build failed: {e}")))
    }

    fn common_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        for (name, value) in &self.identity.headers {
            insert_header(&mut headers, name, value);
        }
        if !self.identity.cookies.is_empty() {
            let cookie = self
                .identity
                .cookies
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("; ");
            insert_header(&mut headers, COOKIE.as_str(), &cookie);
        }
        headers
    }
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) {
    match (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        (Ok(name), Ok(value)) => {
            headers.insert(name, value);
        }
        _ => warn!("Dropping malformed header {name:?}"),
    }
}

/// Classify a response body into success JSON, an API-level error, or
/// an invalid-JSON report. An empty 2xx body is a legitimate outcome
/// for fire-and-forget endpoints.
fn classify_body(status: u16, success: bool, text: &str) -> Result<Value, ExchangeError> {
    if text.trim().is_empty() {
        return if success {
            Ok(Value::Null)
        } else {
            Err(ExchangeError::Api {
                status,
                message: "empty error body".to_string(),
            })
        };
    }

    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) if success => return Err(ExchangeError::InvalidJson(snippet(text))),
        Err(_) => {
            return Err(ExchangeError::Api {
                status,
                message: snippet(text),
            })
        }
    };

    if !success {
        return Err(ExchangeError::Api {
            status,
            message: api_error_message(&value).unwrap_or_else(|| snippet(text)),
        });
    }
    if let Some(message) = api_error_message(&value) {
        return Err(ExchangeError::Api { status, message });
    }
    Ok(value)
}

/// The exchange reports business errors as objects carrying a non-null
/// `error` field, with the human-readable text under `message`.
fn api_error_message(value: &Value) -> Option<String> {
    let object = value.as_object()?;
    let error = object.get("error")?;
    if error.is_null() {
        return None;
    }
    let message = object
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| render_param(error));
    Some(message)
}

fn snippet(text: &str) -> String {
    const LIMIT: usize = 200;
    let trimmed = text.trim();
    if trimmed.len() <= LIMIT {
        trimmed.to_string()
    } else {
        let mut end = LIMIT;
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &trimmed[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classify_success_json() {
        let value = classify_body(200, true, r#"{"ok": 1}"#).unwrap();
        assert_eq!(value, json!({"ok": 1}));
    }

    #[test]
    fn classify_empty_success_body() {
        assert_eq!(classify_body(200, true, "  ").unwrap(), Value::Null);
    }

    #[test]
    fn classify_garbage_body() {
        let err = classify_body(200, true, "<html>502 Bad Gateway</html>").unwrap_err();
        assert!(matches!(err, ExchangeError::InvalidJson(_)));
    }

    #[test]
    fn classify_api_error_object() {
        let err =
            classify_body(200, true, r#"{"error": "RESOURCE_NOT_FOUND", "message": "no order"}"#)
                .unwrap_err();
        match err {
            ExchangeError::Api { message, .. } => assert_eq!(message, "no order"),
            other => panic!("expected Api error, got {other:?}"),
        }
    }

    #[test]
    fn classify_http_error_status() {
        let err = classify_body(400, false, r#"{"error": "INVALID_ORDER"}"#).unwrap_err();
        match err {
            ExchangeError::Api { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "INVALID_ORDER");
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }

    #[test]
    fn null_error_field_is_not_an_error() {
        let value = classify_body(200, true, r#"{"error": null, "id": "1"}"#).unwrap();
        assert_eq!(value["id"], "1");
    }
}
