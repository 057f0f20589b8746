//! Resilient JSON-over-HTTP call client.
//!
//! One JSON request in, one parsed JSON response out. The client owns
//! authentication, the per-attempt timeout, bounded retry with exponential
//! backoff, and structured request/response logging. Retries fire only on
//! the transient set (429, 5xx, network timeout/reset); protocol
//! violations fail immediately because retrying cannot fix them.

pub mod auth;
pub mod log;

use serde::Serialize;
use serde_json::{Value, json};
use std::time::{Duration, Instant};
use thiserror::Error;

pub use auth::{AuthMode, BearerToken, CachedTokenSource, StaticTokenSource, TokenSource};
pub use log::CallLog;

use crate::config::CallConfig;

const MAX_BACKOFF_MS: u64 = 10_000;
const ERROR_SNIPPET_CHARS: usize = 500;
const CONTENT_SNIPPET_CHARS: usize = 120;

#[derive(Debug, Error)]
pub enum CallError {
    /// Transient failures exhausted the retry budget.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    /// Non-transient HTTP status (4xx other than 429).
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// Non-transient network/client failure.
    #[error("transport: {0}")]
    Transport(String),

    /// Health probe did not return 200.
    #[error("health probe failed: {0}")]
    Unhealthy(String),

    /// Credential acquisition failed.
    #[error("auth: {0}")]
    Auth(String),

    /// Response body was not JSON (first decode of the double-decode
    /// contract).
    #[error("response body was not valid JSON: {0}")]
    BodyNotJson(String),

    /// Chat response had no extractable message content.
    #[error("missing content in model response")]
    MissingContent,

    /// Message content was not JSON (second decode).
    #[error("model content was not valid JSON: {snippet}")]
    ContentNotJson { snippet: String },
}

impl CallError {
    /// True when the failure came from the JSON contract rather than the
    /// network: the payload arrived, but was unusable.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::BodyNotJson(_) | Self::MissingContent | Self::ContentNotJson { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system",
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }
}

pub struct CallClient {
    http: reqwest::Client,
    auth: AuthMode,
    retries: u32,
    retry_base_ms: u64,
    log: CallLog,
}

fn transient_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

fn truncate_chars(input: &str, max: usize) -> String {
    if input.chars().count() <= max {
        input.to_string()
    } else {
        let cut: String = input.chars().take(max).collect();
        format!("{cut}...")
    }
}

impl CallClient {
    pub fn new(call: &CallConfig, auth: AuthMode) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(call.timeout_ms))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            auth,
            retries: call.retries,
            retry_base_ms: call.retry_base_ms.max(1),
            log: CallLog::new(call.log_path.clone()),
        }
    }

    /// Probe an endpoint with a single GET; anything but 200 fails. No
    /// retries: an unhealthy tool aborts the record with its own error.
    pub async fn health(&self, url: &str) -> Result<(), CallError> {
        match self.http.get(url).send().await {
            Ok(resp) if resp.status().as_u16() == 200 => Ok(()),
            Ok(resp) => Err(CallError::Unhealthy(format!(
                "{url} returned {}",
                resp.status()
            ))),
            Err(e) => Err(CallError::Unhealthy(format!("{url}: {e}"))),
        }
    }

    /// POST a JSON body and return the parsed JSON response.
    pub async fn call_json(&self, url: &str, body: &Value) -> Result<Value, CallError> {
        let corr = correlation_id();
        self.log.prompt(&corr, body);
        let parsed = self.request_json(&corr, url, body).await?;
        self.log.parsed(&corr, &parsed);
        Ok(parsed)
    }

    /// Chat completion with the double-decode contract: the HTTP body must
    /// be JSON, and the first choice's message content must itself parse
    /// as JSON. Failure at either level is non-transient.
    pub async fn chat(&self, url: &str, messages: &[ChatMessage]) -> Result<Value, CallError> {
        let corr = correlation_id();
        let body = json!({
            "messages": messages,
            "response_format": { "type": "json_object" },
        });
        self.log.prompt(&corr, &json!({ "messages": messages }));

        let envelope = self.request_json(&corr, url, &body).await?;
        let content = envelope
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or(CallError::MissingContent)
            .inspect_err(|e| self.log.error(&corr, 0, &e.to_string(), false))?;

        let parsed: Value = serde_json::from_str(content).map_err(|e| {
            let err = CallError::ContentNotJson {
                snippet: format!("{e}; content: {}", truncate_chars(content, CONTENT_SNIPPET_CHARS)),
            };
            self.log.error(&corr, 0, &err.to_string(), false);
            err
        })?;

        self.log.parsed(&corr, &parsed);
        Ok(parsed)
    }

    /// Retry loop shared by tool and model calls. The timeout bounds each
    /// attempt; backoff is `base * 2^(attempt-1)`.
    async fn request_json(&self, corr: &str, url: &str, body: &Value) -> Result<Value, CallError> {
        let request_body = body.to_string();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let (header_name, header_value) = match self.auth.header().await {
                Ok(pair) => pair,
                Err(e) => {
                    let err = CallError::Auth(e.to_string());
                    self.log.error(corr, attempt, &err.to_string(), false);
                    return Err(err);
                }
            };

            self.log.request(
                corr,
                url,
                attempt,
                log::redact_headers([
                    ("Content-Type", "application/json"),
                    (header_name, header_value.as_str()),
                ]),
                &request_body,
            );

            let started = Instant::now();
            let response = self
                .http
                .post(url)
                .header("Content-Type", "application/json")
                .header(header_name, &header_value)
                .body(request_body.clone())
                .send()
                .await;

            match response {
                Err(e) => {
                    // Only network-level failures are worth retrying; a
                    // request that could not be built will not build better
                    // the second time.
                    let transient = e.is_timeout() || e.is_connect();
                    let message = format!("{url}: {e}");
                    self.log.error(corr, attempt, &message, transient);
                    if transient {
                        if let Some(delay) = self.backoff(attempt) {
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                        return Err(CallError::RetriesExhausted {
                            attempts: attempt,
                            last: message,
                        });
                    }
                    return Err(CallError::Transport(message));
                }
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    // A failure while reading the body (reset, timeout) is
                    // a network fault, not the peer's payload.
                    let raw = match resp.text().await {
                        Ok(raw) => raw,
                        Err(e) => {
                            let message = format!("{url}: body read failed: {e}");
                            self.log.error(corr, attempt, &message, true);
                            if let Some(delay) = self.backoff(attempt) {
                                tokio::time::sleep(delay).await;
                                continue;
                            }
                            return Err(CallError::RetriesExhausted {
                                attempts: attempt,
                                last: message,
                            });
                        }
                    };
                    let elapsed = started.elapsed().as_millis();
                    self.log.response(corr, attempt, status, elapsed, &raw);

                    if !(200..300).contains(&status) {
                        let message = format!(
                            "HTTP {status}: {}",
                            truncate_chars(&raw, ERROR_SNIPPET_CHARS)
                        );
                        let transient = transient_status(status);
                        self.log.error(corr, attempt, &message, transient);
                        if transient {
                            if let Some(delay) = self.backoff(attempt) {
                                tokio::time::sleep(delay).await;
                                continue;
                            }
                            return Err(CallError::RetriesExhausted {
                                attempts: attempt,
                                last: message,
                            });
                        }
                        return Err(CallError::Status {
                            status,
                            body: truncate_chars(&raw, ERROR_SNIPPET_CHARS),
                        });
                    }

                    return serde_json::from_str(&raw).map_err(|e| {
                        let err = CallError::BodyNotJson(e.to_string());
                        self.log.error(corr, attempt, &err.to_string(), false);
                        err
                    });
                }
            }
        }
    }

    /// Delay before the next attempt, or `None` when the budget is spent.
    /// `retries` extra attempts are allowed after the first.
    fn backoff(&self, attempt: u32) -> Option<Duration> {
        if attempt > self.retries {
            return None;
        }
        let factor = 1u64 << (attempt - 1).min(20);
        let ms = self.retry_base_ms.saturating_mul(factor).min(MAX_BACKOFF_MS);
        Some(Duration::from_millis(ms))
    }
}

fn correlation_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_with(retries: u32, base_ms: u64) -> CallClient {
        let call = CallConfig {
            timeout_ms: 5_000,
            retries,
            retry_base_ms: base_ms,
            log_path: None,
        };
        CallClient::new(&call, AuthMode::ApiKey("test-key".into()))
    }

    fn chat_envelope(content: &str) -> Value {
        json!({
            "choices": [{ "message": { "content": content } }]
        })
    }

    #[tokio::test]
    async fn call_json_round_trips() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tools/call"))
            .and(header("api-key", "test-key"))
            .and(body_partial_json(json!({ "name": "create_portal_ui" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
            .mount(&server)
            .await;

        let client = client_with(0, 1);
        let result = client
            .call_json(
                &format!("{}/tools/call", server.uri()),
                &json!({ "name": "create_portal_ui", "arguments": { "message": "hi" } }),
            )
            .await
            .unwrap();
        assert_eq!(result["ok"], true);
    }

    #[tokio::test]
    async fn retries_on_429_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_with(3, 1);
        let result = client.call_json(&server.uri(), &json!({})).await.unwrap();
        assert_eq!(result["ok"], true);
    }

    #[tokio::test]
    async fn exhausts_retries_on_persistent_429() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .expect(3) // 1 attempt + 2 retries
            .mount(&server)
            .await;

        let client = client_with(2, 1);
        let err = client.call_json(&server.uri(), &json!({})).await.unwrap_err();
        match err {
            CallError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(last.contains("429"));
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn does_not_retry_on_404() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_string("nope"))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_with(5, 1);
        let err = client.call_json(&server.uri(), &json!({})).await.unwrap_err();
        assert!(matches!(err, CallError::Status { status: 404, .. }));
    }

    #[tokio::test]
    async fn network_timeout_is_transient_and_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "ok": true }))
                    .set_delay(Duration::from_millis(500)),
            )
            .expect(2) // 1 attempt + 1 retry, both timing out
            .mount(&server)
            .await;

        let call = CallConfig {
            timeout_ms: 50,
            retries: 1,
            retry_base_ms: 1,
            log_path: None,
        };
        let client = CallClient::new(&call, AuthMode::ApiKey("test-key".into()));
        let err = client.call_json(&server.uri(), &json!({})).await.unwrap_err();
        match err {
            CallError::RetriesExhausted { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unbuildable_request_fails_without_retry() {
        // No host: the request can never be constructed, so no attempt
        // budget is spent on it.
        let client = client_with(5, 1);
        let err = client.call_json("http://", &json!({})).await.unwrap_err();
        assert!(matches!(err, CallError::Transport(_)));
    }

    #[tokio::test]
    async fn retries_on_500() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": 1 })))
            .mount(&server)
            .await;

        let client = client_with(1, 1);
        assert!(client.call_json(&server.uri(), &json!({})).await.is_ok());
    }

    #[tokio::test]
    async fn non_json_body_fails_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_with(5, 1);
        let err = client.call_json(&server.uri(), &json!({})).await.unwrap_err();
        assert!(matches!(err, CallError::BodyNotJson(_)));
        assert!(err.is_protocol());
    }

    #[tokio::test]
    async fn chat_double_decodes_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(chat_envelope(r#"{"layout":"dashboard"}"#)),
            )
            .mount(&server)
            .await;

        let client = client_with(0, 1);
        let result = client
            .chat(&server.uri(), &[ChatMessage::user("hi")])
            .await
            .unwrap();
        assert_eq!(result["layout"], "dashboard");
    }

    #[tokio::test]
    async fn chat_prose_content_is_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(chat_envelope("Sure! Here is the UI:")),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = client_with(5, 1);
        let err = client
            .chat(&server.uri(), &[ChatMessage::user("hi")])
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::ContentNotJson { .. }));
    }

    #[tokio::test]
    async fn chat_missing_content_is_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "choices": [] })))
            .mount(&server)
            .await;

        let client = client_with(0, 1);
        let err = client
            .chat(&server.uri(), &[ChatMessage::user("hi")])
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::MissingContent));
    }

    #[tokio::test]
    async fn health_requires_200() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = client_with(0, 1);
        let err = client
            .health(&format!("{}/health", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Unhealthy(_)));
    }

    #[tokio::test]
    async fn health_passes_on_200() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "ok" })))
            .mount(&server)
            .await;

        let client = client_with(0, 1);
        assert!(client
            .health(&format!("{}/health", server.uri()))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn bearer_auth_sends_authorization_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("Authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
            .expect(1)
            .mount(&server)
            .await;

        let call = CallConfig {
            timeout_ms: 5_000,
            retries: 0,
            retry_base_ms: 1,
            log_path: None,
        };
        let auth = AuthMode::Bearer(CachedTokenSource::new(Box::new(StaticTokenSource::new(
            "tok".into(),
            None,
        ))));
        let client = CallClient::new(&call, auth);
        assert!(client.call_json(&server.uri(), &json!({})).await.is_ok());
    }

    #[tokio::test]
    async fn log_events_are_ordered_and_redacted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("calls.log");
        let call = CallConfig {
            timeout_ms: 5_000,
            retries: 0,
            retry_base_ms: 1,
            log_path: Some(log_path.clone()),
        };
        let client = CallClient::new(&call, AuthMode::ApiKey("super-secret".into()));
        client.call_json(&server.uri(), &json!({})).await.unwrap();

        let contents = std::fs::read_to_string(&log_path).unwrap();
        let kinds: Vec<String> = contents
            .lines()
            .map(|l| serde_json::from_str::<Value>(l).unwrap()["kind"]
                .as_str()
                .unwrap()
                .to_string())
            .collect();
        assert_eq!(kinds, vec!["prompt", "request", "response", "parsed"]);
        assert!(!contents.contains("super-secret"));
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let client = client_with(10, 100);
        assert_eq!(client.backoff(1), Some(Duration::from_millis(100)));
        assert_eq!(client.backoff(2), Some(Duration::from_millis(200)));
        assert_eq!(client.backoff(3), Some(Duration::from_millis(400)));
        assert_eq!(client.backoff(8), Some(Duration::from_millis(10_000)));
        assert_eq!(client.backoff(11), None);
    }
}
