use axum::body::Bytes;
use axum::extract::{Path, Request, State};
use axum::http::{header::CONTENT_TYPE, request::Parts, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use opentelemetry::KeyValue;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

use crate::accounts::select_account;
use crate::accounts::SelectorConfig;
use crate::audit_log::GatewayAuditRecord;
use crate::error::{map_upstream_error, AppError};
use crate::forward::{forward_upstream, stream_through, ForwardError, StreamGuards};
use crate::models::{
    ApiKeyRecord, AuthSubject, ProtocolFamily, Subscription, UpstreamFailoverError,
};
use crate::normalize::{
    collect_normalized_stats, collect_raw_stats, log_normalization_observations, normalize_chat,
};
use crate::passthrough::{extract_upstream_error_message, PassthroughRules};
use crate::precheck::validate_function_call_context;
use crate::state::{AppState, RequestGuard};
use crate::sticky::session_hash;

/// POST /openai/v1/responses
pub async fn post_responses(State(state): State<AppState>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let (api_key, subject, subscription) = match auth_context(&parts) {
        Ok(ctx) => ctx,
        Err(err) => return err.into_response(),
    };
    let body = match read_body(body, state.config.server.max_body_bytes).await {
        Ok(body) => body,
        Err(err) => return err.into_response(),
    };
    let req_map: Map<String, Value> = match serde_json::from_slice(&body) {
        Ok(map) => map,
        Err(_) => return AppError::invalid_request("Failed to parse request body").into_response(),
    };
    responses_flow(state, parts.headers, api_key, subject, subscription, req_map, body).await
}

/// POST /v1/chat/completions — normalized to the Responses shape, then
/// routed through the same flow.
pub async fn post_chat_completions(State(state): State<AppState>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let (api_key, subject, subscription) = match auth_context(&parts) {
        Ok(ctx) => ctx,
        Err(err) => return err.into_response(),
    };
    let body = match read_body(body, state.config.server.max_body_bytes).await {
        Ok(body) => body,
        Err(err) => return err.into_response(),
    };
    let req_map: Map<String, Value> = match serde_json::from_slice(&body) {
        Ok(map) => map,
        Err(_) => return AppError::invalid_request("Failed to parse request body").into_response(),
    };

    let model = req_map
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let raw_stats = collect_raw_stats(req_map.get("messages"));

    let normalized = match normalize_chat(req_map) {
        Ok(normalized) => normalized,
        Err(err) => {
            if raw_stats.raw_image_parts > 0
                || raw_stats.raw_invalid_image_parts > 0
                || raw_stats.raw_unknown_parts > 0
            {
                tracing::warn!(
                    model = %model,
                    raw_images = raw_stats.raw_image_parts,
                    invalid_images = raw_stats.raw_invalid_image_parts,
                    unknown_parts = raw_stats.raw_unknown_parts,
                    unknown_types = %raw_stats.unknown_types_string(),
                    "normalization failed: {}",
                    err.message
                );
            }
            return err.into_response();
        }
    };
    let normalized_stats = collect_normalized_stats(normalized.get("input"));
    log_normalization_observations(&model, &raw_stats, &normalized_stats);

    let normalized_body = match serde_json::to_vec(&normalized) {
        Ok(bytes) => Bytes::from(bytes),
        Err(_) => return AppError::api_error("Failed to process request").into_response(),
    };
    responses_flow(
        state,
        parts.headers,
        api_key,
        subject,
        subscription,
        normalized,
        normalized_body,
    )
    .await
}

async fn responses_flow(
    state: AppState,
    headers: HeaderMap,
    api_key: ApiKeyRecord,
    subject: AuthSubject,
    subscription: Option<Subscription>,
    req_map: Map<String, Value>,
    body: Bytes,
) -> Response {
    let model = match req_map.get("model").and_then(Value::as_str) {
        Some(model) if !model.is_empty() => model.to_string(),
        _ => return AppError::invalid_request("model is required").into_response(),
    };
    let stream = req_map.get("stream").and_then(Value::as_bool).unwrap_or(false);

    if let Err(err) = validate_function_call_context(&req_map) {
        tracing::info!(model = %model, "function_call_output context missing");
        return err.into_response();
    }

    dispatch(
        state,
        api_key,
        subject,
        subscription,
        headers,
        ProtocolFamily::Responses,
        model,
        None,
        stream,
        &req_map,
        body,
    )
    .await
}

/// POST /v1/messages
pub async fn post_messages(State(state): State<AppState>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let (api_key, subject, subscription) = match auth_context(&parts) {
        Ok(ctx) => ctx,
        Err(err) => return err.into_response(),
    };
    let body = match read_body(body, state.config.server.max_body_bytes).await {
        Ok(body) => body,
        Err(err) => return err.into_response(),
    };
    let req_map: Map<String, Value> = match serde_json::from_slice(&body) {
        Ok(map) => map,
        Err(_) => return AppError::invalid_request("Failed to parse request body").into_response(),
    };
    let model = match req_map.get("model").and_then(Value::as_str) {
        Some(model) if !model.is_empty() => model.to_string(),
        _ => return AppError::invalid_request("model is required").into_response(),
    };
    let stream = req_map.get("stream").and_then(Value::as_bool).unwrap_or(false);

    dispatch(
        state,
        api_key,
        subject,
        subscription,
        parts.headers,
        ProtocolFamily::Messages,
        model,
        None,
        stream,
        &req_map,
        body,
    )
    .await
}

/// POST /v1beta/models/{model}:{action}
pub async fn post_gemini(
    State(state): State<AppState>,
    Path(model_and_action): Path<String>,
    req: Request,
) -> Response {
    let (model, action) = match model_and_action.split_once(':') {
        Some((model, action)) if !model.is_empty() => (model.to_string(), action.to_string()),
        _ => return AppError::invalid_request("model is required").into_response(),
    };
    let stream = match action.as_str() {
        "generateContent" => false,
        "streamGenerateContent" => true,
        _ => {
            return AppError::invalid_request(format!("unsupported action: {}", action))
                .into_response()
        }
    };

    let (parts, body) = req.into_parts();
    let (api_key, subject, subscription) = match auth_context(&parts) {
        Ok(ctx) => ctx,
        Err(err) => return err.into_response(),
    };
    let body = match read_body(body, state.config.server.max_body_bytes).await {
        Ok(body) => body,
        Err(err) => return err.into_response(),
    };
    let req_map: Map<String, Value> = match serde_json::from_slice(&body) {
        Ok(map) => map,
        Err(_) => return AppError::invalid_request("Failed to parse request body").into_response(),
    };

    dispatch(
        state,
        api_key,
        subject,
        subscription,
        parts.headers,
        ProtocolFamily::Gemini,
        model,
        Some(action),
        stream,
        &req_map,
        body,
    )
    .await
}

pub async fn health() -> impl IntoResponse {
    axum::Json(serde_json::json!({"status": "ok"}))
}

/// Admission, selection, forwarding, and failover for one request.
/// User slot strictly before account slot; each failed account is attempted
/// at most once; the account slot is released before re-selection.
#[allow(clippy::too_many_arguments)]
async fn dispatch(
    state: AppState,
    api_key: ApiKeyRecord,
    subject: AuthSubject,
    subscription: Option<Subscription>,
    headers: HeaderMap,
    family: ProtocolFamily,
    model: String,
    action: Option<String>,
    stream: bool,
    req_map: &Map<String, Value>,
    body: Bytes,
) -> Response {
    let request_id = next_request_id();
    let start = Instant::now();
    let inflight = RequestGuard::new(state.inflight_count.clone());
    state.metrics.requests.add(
        1,
        &[
            KeyValue::new("family", family.as_str()),
            KeyValue::new("stream", if stream { "true" } else { "false" }),
        ],
    );

    let max_wait = state.config.max_wait_for(subject.concurrency);
    let wait_token =
        state
            .user_slots
            .increment_waiting(subject.user_id, max_wait, subject.concurrency);
    let wait_token = match wait_token {
        Some(token) => token,
        None => {
            return fail(
                &state,
                &request_id,
                &model,
                start,
                AppError::rate_limited("Too many pending requests, please retry later"),
            )
        }
    };

    let user_permit = match state
        .user_slots
        .acquire(subject.user_id, subject.concurrency, state.config.slot_wait_timeout())
        .await
    {
        Ok(permit) => permit,
        Err(err) => {
            tracing::info!(request_id = %request_id, "user slot acquire failed: {}", err);
            return fail(
                &state,
                &request_id,
                &model,
                start,
                AppError::rate_limited(format!(
                    "Concurrency limit exceeded for {}, please retry later",
                    state.user_slots.slot_type()
                )),
            );
        }
    };
    // Acquired: no longer waiting.
    drop(wait_token);

    let session = session_hash(&headers, req_map, &state.config.gateway.session_header);
    let selector = SelectorConfig {
        slot_wait_timeout: state.config.slot_wait_timeout(),
        waiting_multiplier: state.config.gateway.waiting_multiplier,
    };
    let stream_started = Arc::new(AtomicBool::new(false));

    let mut excluded: HashSet<i64> = HashSet::new();
    let mut switch_count: u32 = 0;
    let mut last_failover: Option<UpstreamFailoverError> = None;

    loop {
        let selection = match select_account(
            &state.accounts,
            &state.account_slots,
            &state.sticky,
            &selector,
            api_key.group_id,
            session,
            &model,
            &excluded,
        ) {
            Ok(selection) => selection,
            Err(err) => {
                if excluded.is_empty() {
                    return fail(
                        &state,
                        &request_id,
                        &model,
                        start,
                        AppError::service_unavailable(format!("No available accounts: {}", err)),
                    );
                }
                return failover_exhausted(
                    &state,
                    &request_id,
                    &model,
                    start,
                    family,
                    last_failover.as_ref(),
                );
            }
        };
        let account = selection.account;
        info!(
            request_id = %request_id,
            account_id = account.id,
            account = %account.name,
            model = %model,
            "account selected"
        );

        let account_permit = match selection.permit {
            Some(permit) => permit,
            None => {
                let plan = match selection.wait_plan {
                    Some(plan) => plan,
                    None => {
                        return fail(
                            &state,
                            &request_id,
                            &model,
                            start,
                            AppError::service_unavailable("No available accounts"),
                        )
                    }
                };
                let account_wait = state.account_slots.increment_waiting(
                    account.id,
                    plan.max_waiting,
                    plan.max_concurrency,
                );
                let account_wait = match account_wait {
                    Some(token) => token,
                    None => {
                        tracing::info!(
                            request_id = %request_id,
                            account_id = account.id,
                            "account wait queue full"
                        );
                        return fail(
                            &state,
                            &request_id,
                            &model,
                            start,
                            AppError::rate_limited(
                                "Too many pending requests, please retry later",
                            ),
                        );
                    }
                };
                let permit = match state
                    .account_slots
                    .acquire(account.id, plan.max_concurrency, plan.timeout)
                    .await
                {
                    Ok(permit) => permit,
                    Err(err) => {
                        tracing::info!(
                            request_id = %request_id,
                            account_id = account.id,
                            "account slot acquire failed: {}",
                            err
                        );
                        return fail(
                            &state,
                            &request_id,
                            &model,
                            start,
                            AppError::rate_limited(format!(
                                "Concurrency limit exceeded for {}, please retry later",
                                state.account_slots.slot_type()
                            )),
                        );
                    }
                };
                drop(account_wait);
                if let Some(hash) = session {
                    state.sticky.bind(api_key.group_id, hash, account.id);
                }
                permit
            }
        };

        match forward_upstream(
            &state,
            &headers,
            &account,
            family,
            &model,
            action.as_deref(),
            body.clone(),
            stream,
        )
        .await
        {
            Ok(upstream) => {
                record_usage(
                    &state,
                    &request_id,
                    family,
                    &model,
                    &account,
                    &api_key,
                    subscription.as_ref(),
                    stream,
                    switch_count,
                );
                return stream_through(
                    upstream,
                    StreamGuards {
                        user: user_permit,
                        account: account_permit,
                        inflight,
                    },
                    stream,
                    stream_started,
                    state.config.ping_interval(),
                    state.metrics.clone(),
                    request_id,
                    model,
                    start,
                );
            }
            Err(ForwardError::Failover(failover)) => {
                account_permit.release();
                excluded.insert(account.id);
                if let Some(hash) = session {
                    state.sticky.unbind(api_key.group_id, hash, account.id);
                }
                tracing::warn!(
                    request_id = %request_id,
                    account_id = account.id,
                    upstream_status = failover.status_code,
                    retry_after = failover.headers.get("retry-after").map(String::as_str).unwrap_or("-"),
                    switch_count = switch_count,
                    "upstream error, switching account"
                );
                last_failover = Some(failover);
                if switch_count >= state.config.gateway.max_account_switches {
                    return failover_exhausted(
                        &state,
                        &request_id,
                        &model,
                        start,
                        family,
                        last_failover.as_ref(),
                    );
                }
                switch_count += 1;
                state
                    .metrics
                    .account_switches
                    .add(1, &[KeyValue::new("family", family.as_str())]);
                continue;
            }
            Err(ForwardError::Passthrough { status, body: upstream_body }) => {
                account_permit.release();
                return upstream_passthrough_response(
                    &state,
                    &request_id,
                    &model,
                    start,
                    family,
                    status,
                    upstream_body,
                );
            }
        }
    }
}

fn auth_context(
    parts: &Parts,
) -> Result<(ApiKeyRecord, AuthSubject, Option<Subscription>), AppError> {
    let api_key = parts
        .extensions
        .get::<ApiKeyRecord>()
        .cloned()
        .ok_or_else(|| AppError::authentication("Invalid API key"))?;
    let subject = parts
        .extensions
        .get::<AuthSubject>()
        .copied()
        .ok_or_else(|| AppError::api_error("User context not found"))?;
    let subscription = parts.extensions.get::<Subscription>().cloned();
    Ok((api_key, subject, subscription))
}

async fn read_body(body: axum::body::Body, limit: usize) -> Result<Bytes, AppError> {
    let bytes = axum::body::to_bytes(body, limit)
        .await
        .map_err(|_| AppError::body_too_large(limit))?;
    if bytes.is_empty() {
        return Err(AppError::invalid_request("Request body is empty"));
    }
    Ok(bytes)
}

fn fail(state: &AppState, request_id: &str, model: &str, start: Instant, err: AppError) -> Response {
    state
        .metrics
        .errors
        .add(1, &[KeyValue::new("type", err.error_type.clone())]);
    log_error(request_id, model, start.elapsed().as_millis(), &err);
    err.into_response()
}

fn log_error(request_id: &str, model: &str, latency_ms: u128, err: &AppError) {
    info!(
        request_id = %request_id,
        model = %model,
        latency_ms = latency_ms,
        status = err.status.as_u16(),
        error_type = %err.error_type,
        "request failed"
    );
}

/// Map an exhausted failover sequence to the client response: passthrough
/// rules first, then the default status table.
fn resolve_exhausted(
    rules: &PassthroughRules,
    family: ProtocolFamily,
    last_error: Option<&UpstreamFailoverError>,
) -> (StatusCode, String, String, bool) {
    let last_status = last_error.map(|err| err.status_code).unwrap_or(502);
    if let Some(err) = last_error {
        if !err.response_body.is_empty() {
            if let Some(rule) = rules.match_rule(family.as_str(), err.status_code, &err.response_body)
            {
                let code = if rule.passthrough_code {
                    err.status_code
                } else {
                    rule.response_code.unwrap_or(err.status_code)
                };
                let status = StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_GATEWAY);
                let message = if rule.passthrough_body {
                    extract_upstream_error_message(&err.response_body)
                } else {
                    rule.custom_message
                        .clone()
                        .unwrap_or_else(|| extract_upstream_error_message(&err.response_body))
                };
                return (status, "upstream_error".to_string(), message, rule.skip_monitoring);
            }
        }
    }
    let (status, error_type, message) = map_upstream_error(last_status);
    (status, error_type.to_string(), message.to_string(), false)
}

fn failover_exhausted(
    state: &AppState,
    request_id: &str,
    model: &str,
    start: Instant,
    family: ProtocolFamily,
    last_error: Option<&UpstreamFailoverError>,
) -> Response {
    let (status, error_type, message, skip_monitoring) =
        resolve_exhausted(&state.passthrough, family, last_error);
    let err = AppError::new(status, error_type, message);
    if skip_monitoring {
        log_error(request_id, model, start.elapsed().as_millis(), &err);
        return err.into_response();
    }
    fail(state, request_id, model, start, err)
}

/// Non-failover upstream errors: pass the vendor body through with the
/// upstream status unless a rule rewrites it.
fn upstream_passthrough_response(
    state: &AppState,
    request_id: &str,
    model: &str,
    start: Instant,
    family: ProtocolFamily,
    status: u16,
    body: String,
) -> Response {
    let mut skip_monitoring = false;
    let response = if let Some(rule) = state.passthrough.match_rule(family.as_str(), status, &body)
    {
        skip_monitoring = rule.skip_monitoring;
        let code = if rule.passthrough_code {
            status
        } else {
            rule.response_code.unwrap_or(status)
        };
        let status_code = StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_GATEWAY);
        if rule.passthrough_body {
            raw_json_response(status_code, body)
        } else {
            let message = rule
                .custom_message
                .clone()
                .unwrap_or_else(|| extract_upstream_error_message(&body));
            AppError::new(status_code, "upstream_error", message).into_response()
        }
    } else {
        let status_code = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
        if body.is_empty() {
            AppError::new(status_code, "upstream_error", "Upstream request failed").into_response()
        } else {
            raw_json_response(status_code, body)
        }
    };

    if !skip_monitoring {
        state
            .metrics
            .errors
            .add(1, &[KeyValue::new("type", "upstream_error")]);
    }
    info!(
        request_id = %request_id,
        model = %model,
        latency_ms = start.elapsed().as_millis(),
        status = response.status().as_u16(),
        "upstream error passed through"
    );
    response
}

fn raw_json_response(status: StatusCode, body: String) -> Response {
    (status, [(CONTENT_TYPE, "application/json")], body).into_response()
}

#[allow(clippy::too_many_arguments)]
fn record_usage(
    state: &AppState,
    request_id: &str,
    family: ProtocolFamily,
    model: &str,
    account: &crate::models::Account,
    api_key: &ApiKeyRecord,
    subscription: Option<&Subscription>,
    stream: bool,
    switch_count: u32,
) {
    let audit = match &state.audit_logger {
        Some(audit) => audit.clone(),
        None => return,
    };
    let record = GatewayAuditRecord {
        ts_ms: crate::audit_log::now_ms(),
        request_id: request_id.to_string(),
        family: family.as_str().to_string(),
        model: model.to_string(),
        account_id: account.id,
        account_name: account.name.clone(),
        api_key_id: api_key.id,
        user_id: api_key.user_id,
        group_id: api_key.group_id,
        subscription: subscription.map(|s| s.plan.clone()),
        stream,
        switch_count,
        status: 200,
    };
    // Detached from the request: recording must never delay the response.
    tokio::spawn(async move {
        if tokio::time::timeout(Duration::from_secs(10), audit.push(record))
            .await
            .is_err()
        {
            tracing::warn!("usage record timed out");
        }
    });
}

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_request_id() -> String {
    let seq = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("req-{}-{}", ts, seq)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::{AccountRegistry, NoAvailableAccount};
    use crate::models::{Account, AccountStatus, AccountType, Credentials};
    use crate::passthrough::PassthroughRuleConfig;
    use crate::slots::SlotLedger;
    use crate::sticky::StickySessions;
    use std::collections::HashMap;

    fn account(id: i64) -> Account {
        Account {
            id,
            name: format!("acct-{}", id),
            platform: "openai".to_string(),
            account_type: AccountType::Upstream,
            status: AccountStatus::Active,
            concurrency: 2,
            credentials: Credentials {
                base_url: "https://upstream.example.com".to_string(),
                api_key: format!("sk-{}", id),
                extra: Default::default(),
            },
            models: ["gpt-5.2".to_string()].into_iter().collect(),
        }
    }

    #[test]
    fn request_ids_are_unique() {
        let a = next_request_id();
        let b = next_request_id();
        assert_ne!(a, b);
        assert!(a.starts_with("req-"));
    }

    #[test]
    fn exhausted_uses_default_table_without_rules() {
        let rules = PassthroughRules::new(vec![]);
        let err = UpstreamFailoverError {
            status_code: 429,
            response_body: r#"{"error":{"message":"quota"}}"#.to_string(),
            headers: HashMap::new(),
        };
        let (status, error_type, _, skip) =
            resolve_exhausted(&rules, ProtocolFamily::Responses, Some(&err));
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(error_type, "rate_limit_error");
        assert!(!skip);
    }

    #[test]
    fn exhausted_without_any_error_maps_to_bad_gateway() {
        let rules = PassthroughRules::new(vec![]);
        let (status, error_type, _, _) = resolve_exhausted(&rules, ProtocolFamily::Gemini, None);
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(error_type, "upstream_error");
    }

    #[test]
    fn exhausted_applies_matching_rule_overrides() {
        let rules = PassthroughRules::new(vec![PassthroughRuleConfig {
            family: Some("responses".to_string()),
            status: Some(529),
            body_contains: None,
            passthrough_code: false,
            response_code: Some(503),
            passthrough_body: false,
            custom_message: Some("capacity exhausted upstream".to_string()),
            skip_monitoring: true,
        }]);
        let err = UpstreamFailoverError {
            status_code: 529,
            response_body: r#"{"error":{"message":"overloaded"}}"#.to_string(),
            headers: HashMap::new(),
        };
        let (status, error_type, message, skip) =
            resolve_exhausted(&rules, ProtocolFamily::Responses, Some(&err));
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error_type, "upstream_error");
        assert_eq!(message, "capacity exhausted upstream");
        assert!(skip);
    }

    #[test]
    fn exhausted_passthrough_rule_keeps_upstream_message() {
        let rules = PassthroughRules::new(vec![PassthroughRuleConfig {
            family: None,
            status: Some(429),
            body_contains: Some("quota".to_string()),
            passthrough_code: true,
            response_code: None,
            passthrough_body: true,
            custom_message: None,
            skip_monitoring: false,
        }]);
        let err = UpstreamFailoverError {
            status_code: 429,
            response_body: r#"{"error":{"message":"quota exhausted for project"}}"#.to_string(),
            headers: HashMap::new(),
        };
        let (status, _, message, _) =
            resolve_exhausted(&rules, ProtocolFamily::Responses, Some(&err));
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(message, "quota exhausted for project");
    }

    /// Scenario: every account fails with a retriable status. Each account
    /// must be dispatched at most once, the exclusion set must cover all of
    /// them, and no failed account may stay sticky-preferred.
    #[tokio::test]
    async fn failover_attempts_each_account_once() {
        let registry = AccountRegistry::new(vec![account(1), account(2), account(3)]);
        let ledger = SlotLedger::new("account");
        let sticky = StickySessions::new(Duration::from_secs(60));
        sticky.bind(9, 42, 2);
        let selector = SelectorConfig {
            slot_wait_timeout: Duration::from_secs(30),
            waiting_multiplier: 3,
        };

        let mut excluded: HashSet<i64> = HashSet::new();
        let mut dispatched: Vec<i64> = Vec::new();
        loop {
            match select_account(
                &registry,
                &ledger,
                &sticky,
                &selector,
                9,
                Some(42),
                "gpt-5.2",
                &excluded,
            ) {
                Ok(selection) => {
                    let id = selection.account.id;
                    dispatched.push(id);
                    // Simulated 502: release the slot, exclude, unbind.
                    drop(selection.permit);
                    excluded.insert(id);
                    sticky.unbind(9, 42, id);
                }
                Err(err) => {
                    assert_eq!(err, NoAvailableAccount);
                    break;
                }
            }
        }

        assert_eq!(dispatched.len(), 3);
        let unique: HashSet<i64> = dispatched.iter().copied().collect();
        assert_eq!(unique.len(), 3, "no account dispatched twice");
        assert_eq!(dispatched[0], 2, "sticky binding tried first");
        assert_eq!(excluded.len(), 3);
        assert_eq!(sticky.lookup(9, 42), None, "failed accounts never stay preferred");
        for id in [1, 2, 3] {
            assert_eq!(ledger.inflight_of(id), 0, "slots all released");
        }
    }
}
