use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use opentelemetry::KeyValue;

use crate::metrics::Metrics;
use crate::models::{is_failover_status, Account, ProtocolFamily, UpstreamFailoverError};
use crate::slots::SlotPermit;
use crate::state::{AppState, RequestGuard};

/// RFC 7230 §6.1 headers (plus Host and framing) that must never be proxied.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "te",
    "proxy-authorization",
    "proxy-authenticate",
    "trailer",
    "host",
    "content-length",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|header| header.eq_ignore_ascii_case(name))
}

#[derive(Debug)]
pub enum ForwardError {
    /// Classifiable upstream failure; the failover controller may retry on
    /// another account.
    Failover(UpstreamFailoverError),
    /// Non-failover upstream error; surfaced to the client with the body
    /// passed through, subject to passthrough rules.
    Passthrough { status: u16, body: String },
}

/// Client headers minus hop-by-hop, with auth rewritten from the account
/// credentials. Everything else passes through verbatim.
pub fn build_upstream_headers(
    client_headers: &HeaderMap,
    account: &Account,
    family: ProtocolFamily,
) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in client_headers {
        let name_str = name.as_str();
        if is_hop_by_hop(name_str)
            || name_str.eq_ignore_ascii_case("authorization")
            || name_str.eq_ignore_ascii_case("x-api-key")
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    if !headers.contains_key("content-type") {
        headers.insert("content-type", HeaderValue::from_static("application/json"));
    }

    let api_key = account.credentials.api_key.as_str();
    if let Ok(bearer) = HeaderValue::from_str(&format!("Bearer {}", api_key)) {
        headers.insert("authorization", bearer);
    }
    if family == ProtocolFamily::Messages {
        if let Ok(value) = HeaderValue::from_str(api_key) {
            headers.insert("x-api-key", value);
        }
    }
    headers
}

pub fn upstream_url(
    account: &Account,
    family: ProtocolFamily,
    model: &str,
    action: Option<&str>,
) -> String {
    let base = account.credentials.base_url.trim_end_matches('/');
    match family {
        ProtocolFamily::Responses => {
            if base.ends_with("/v1") {
                format!("{}/responses", base)
            } else {
                format!("{}/v1/responses", base)
            }
        }
        ProtocolFamily::Messages => {
            if base.ends_with("/v1") {
                format!("{}/messages", base)
            } else {
                format!("{}/v1/messages", base)
            }
        }
        ProtocolFamily::Gemini => {
            format!(
                "{}/v1beta/models/{}:{}",
                base,
                model,
                action.unwrap_or("generateContent")
            )
        }
    }
}

/// Issue the upstream request and classify the result. A 2xx response is
/// returned for streaming through; everything else becomes a failover or
/// passthrough error.
pub async fn forward_upstream(
    state: &AppState,
    client_headers: &HeaderMap,
    account: &Account,
    family: ProtocolFamily,
    model: &str,
    action: Option<&str>,
    body: Bytes,
    stream: bool,
) -> Result<reqwest::Response, ForwardError> {
    let client = if stream {
        &state.stream_client
    } else {
        &state.client
    };
    let url = upstream_url(account, family, model, action);
    let headers = build_upstream_headers(client_headers, account, family);

    let result = client.post(&url).headers(headers).body(body).send().await;
    let response = match result {
        Ok(response) => response,
        Err(err) => {
            let kind = if err.is_timeout() {
                "timeout_error"
            } else if err.is_connect() {
                "connection_error"
            } else {
                "network_error"
            };
            return Err(ForwardError::Failover(UpstreamFailoverError {
                status_code: 0,
                response_body: json!({"error": {"type": kind, "message": err.to_string()}})
                    .to_string(),
                headers: HashMap::new(),
            }));
        }
    };

    let status = response.status().as_u16();
    if response.status().is_success() {
        return Ok(response);
    }

    let response_headers = headers_to_map(response.headers());
    let body = response.text().await.unwrap_or_default();
    if is_failover_status(status) {
        Err(ForwardError::Failover(UpstreamFailoverError {
            status_code: status,
            response_body: body,
            headers: response_headers,
        }))
    } else {
        Err(ForwardError::Passthrough { status, body })
    }
}

fn headers_to_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

/// Slot permits and the in-flight gauge guard travel with the response body
/// so release happens on stream termination, client disconnect included.
pub struct StreamGuards {
    pub user: SlotPermit,
    pub account: SlotPermit,
    pub inflight: RequestGuard,
}

/// Pump the upstream body to the client verbatim. The first flushed chunk
/// flips `stream_started`; after that point errors are delivered as a
/// single in-stream SSE error event. Idle gaps on streaming responses emit
/// comment pings to keep intermediaries from timing out the connection.
pub fn stream_through(
    upstream: reqwest::Response,
    guards: StreamGuards,
    stream: bool,
    stream_started: Arc<AtomicBool>,
    ping_interval: Duration,
    metrics: Metrics,
    request_id: String,
    model: String,
    start: Instant,
) -> Response {
    let status =
        StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::OK);
    let mut response_headers = HeaderMap::new();
    for (name, value) in upstream.headers() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        response_headers.append(name.clone(), value.clone());
    }

    let mut byte_stream = upstream.bytes_stream();
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::convert::Infallible>>(64);
    let stream_label = if stream { "true" } else { "false" };

    tokio::spawn(async move {
        let _guards = guards;
        loop {
            let chunk = if stream && !ping_interval.is_zero() {
                tokio::select! {
                    chunk = byte_stream.next() => chunk,
                    _ = tokio::time::sleep(ping_interval) => {
                        if stream_started.load(Ordering::Acquire) {
                            if tx.send(Ok(Bytes::from_static(b": ping\n\n"))).await.is_err() {
                                return;
                            }
                        }
                        continue;
                    }
                }
            } else {
                byte_stream.next().await
            };

            match chunk {
                Some(Ok(bytes)) => {
                    if tx.send(Ok(bytes)).await.is_err() {
                        return;
                    }
                    stream_started.store(true, Ordering::Release);
                }
                Some(Err(err)) => {
                    metrics
                        .errors
                        .add(1, &[KeyValue::new("type", "upstream_error")]);
                    tracing::warn!(
                        request_id = %request_id,
                        model = %model,
                        "upstream stream error: {}",
                        err
                    );
                    if stream && stream_started.load(Ordering::Acquire) {
                        let _ = tx
                            .send(Ok(Bytes::from(error_event(
                                "upstream_error",
                                "Upstream connection interrupted",
                            ))))
                            .await;
                    }
                    return;
                }
                None => {
                    metrics.latency_ms.record(
                        start.elapsed().as_millis() as f64,
                        &[KeyValue::new("stream", stream_label)],
                    );
                    tracing::info!(
                        request_id = %request_id,
                        model = %model,
                        latency_ms = start.elapsed().as_millis(),
                        status = status.as_u16(),
                        "request completed"
                    );
                    return;
                }
            }
        }
    });

    let body = axum::body::Body::from_stream(ReceiverStream::new(rx));
    (status, response_headers, body).into_response()
}

/// In-stream error shape: the client already accepted `text/event-stream`,
/// so errors after the first byte must stay SSE-encoded.
pub fn error_event(error_type: &str, message: &str) -> String {
    format!(
        "event: error\ndata: {}\n\n",
        json!({"error": {"type": error_type, "message": message}})
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccountStatus, AccountType, Credentials};

    fn account() -> Account {
        Account {
            id: 100,
            name: "upstream-test".to_string(),
            platform: "anthropic".to_string(),
            account_type: AccountType::Upstream,
            status: AccountStatus::Active,
            concurrency: 1,
            credentials: Credentials {
                base_url: "https://upstream.example.com".to_string(),
                api_key: "sk-upstream-secret".to_string(),
                extra: Default::default(),
            },
            models: ["claude-sonnet-4-5".to_string()].into_iter().collect(),
        }
    }

    #[test]
    fn passes_through_custom_headers() {
        let mut client_headers = HeaderMap::new();
        client_headers.insert("content-type", "application/json".parse().unwrap());
        client_headers.insert("anthropic-version", "2024-10-22".parse().unwrap());
        client_headers.insert("anthropic-beta", "output-128k-2025-02-19".parse().unwrap());
        client_headers.insert("x-custom-header", "custom-value".parse().unwrap());

        let headers = build_upstream_headers(&client_headers, &account(), ProtocolFamily::Messages);
        assert_eq!(headers.get("content-type").unwrap(), "application/json");
        assert_eq!(headers.get("anthropic-version").unwrap(), "2024-10-22");
        assert_eq!(headers.get("anthropic-beta").unwrap(), "output-128k-2025-02-19");
        assert_eq!(headers.get("x-custom-header").unwrap(), "custom-value");
    }

    #[test]
    fn overrides_client_auth_headers() {
        let mut client_headers = HeaderMap::new();
        client_headers.insert("authorization", "Bearer client-token".parse().unwrap());
        client_headers.insert("x-api-key", "client-api-key".parse().unwrap());

        let headers = build_upstream_headers(&client_headers, &account(), ProtocolFamily::Messages);
        assert_eq!(
            headers.get("authorization").unwrap(),
            "Bearer sk-upstream-secret"
        );
        assert_eq!(headers.get("x-api-key").unwrap(), "sk-upstream-secret");
    }

    #[test]
    fn gemini_and_responses_do_not_carry_x_api_key() {
        let mut client_headers = HeaderMap::new();
        client_headers.insert("authorization", "Bearer client-gemini-token".parse().unwrap());

        for family in [ProtocolFamily::Gemini, ProtocolFamily::Responses] {
            let headers = build_upstream_headers(&client_headers, &account(), family);
            assert_eq!(
                headers.get("authorization").unwrap(),
                "Bearer sk-upstream-secret"
            );
            assert!(headers.get("x-api-key").is_none());
        }
    }

    #[test]
    fn strips_hop_by_hop_headers() {
        let mut client_headers = HeaderMap::new();
        client_headers.insert("content-type", "application/json".parse().unwrap());
        client_headers.insert("connection", "keep-alive".parse().unwrap());
        client_headers.insert("keep-alive", "timeout=5".parse().unwrap());
        client_headers.insert("transfer-encoding", "chunked".parse().unwrap());
        client_headers.insert("upgrade", "websocket".parse().unwrap());
        client_headers.insert("te", "trailers".parse().unwrap());
        client_headers.insert("proxy-authorization", "Basic dXNlcjpwYXNz".parse().unwrap());
        client_headers.insert("host", "evil.example.com".parse().unwrap());

        let headers = build_upstream_headers(&client_headers, &account(), ProtocolFamily::Messages);
        for name in [
            "connection",
            "keep-alive",
            "transfer-encoding",
            "upgrade",
            "te",
            "proxy-authorization",
            "host",
        ] {
            assert!(headers.get(name).is_none(), "{} should be stripped", name);
        }
        assert_eq!(headers.get("content-type").unwrap(), "application/json");
    }

    #[test]
    fn upstream_urls_per_family() {
        let account = account();
        assert_eq!(
            upstream_url(&account, ProtocolFamily::Responses, "gpt-5.2", None),
            "https://upstream.example.com/v1/responses"
        );
        assert_eq!(
            upstream_url(&account, ProtocolFamily::Messages, "claude-sonnet-4-5", None),
            "https://upstream.example.com/v1/messages"
        );
        assert_eq!(
            upstream_url(
                &account,
                ProtocolFamily::Gemini,
                "gemini-2.5-flash",
                Some("streamGenerateContent")
            ),
            "https://upstream.example.com/v1beta/models/gemini-2.5-flash:streamGenerateContent"
        );

        let mut versioned = account.clone();
        versioned.credentials.base_url = "https://upstream.example.com/v1/".to_string();
        assert_eq!(
            upstream_url(&versioned, ProtocolFamily::Responses, "gpt-5.2", None),
            "https://upstream.example.com/v1/responses"
        );
    }

    #[test]
    fn error_event_is_sse_shaped() {
        let event = error_event("rate_limit_error", "slow down");
        assert!(event.starts_with("event: error\ndata: "));
        assert!(event.ends_with("\n\n"));
        assert!(event.contains(r#""type":"rate_limit_error""#));
        assert!(event.contains(r#""message":"slow down""#));
    }
}
