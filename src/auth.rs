use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::AppError;
use crate::models::{ApiKeyRecord, AuthSubject, Subscription};
use crate::state::AppState;

/// Resolve the client API key against the configured tenant table and stash
/// the authenticated records as request extensions. Handlers read them back
/// and answer 401/500 themselves when a record is missing.
pub async fn require_api_key(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let token = extract_token(req.headers());
    let tenant = token.and_then(|token| state.tenants.get(token.as_str()));
    let tenant = match tenant {
        Some(tenant) => tenant.clone(),
        None => return AppError::authentication("Invalid API key").into_response(),
    };

    req.extensions_mut().insert(ApiKeyRecord {
        id: tenant.key_id,
        name: tenant.name.clone(),
        user_id: tenant.user_id,
        group_id: tenant.group_id,
    });
    req.extensions_mut().insert(AuthSubject {
        user_id: tenant.user_id,
        concurrency: tenant.concurrency,
    });
    if let Some(plan) = tenant.subscription {
        req.extensions_mut().insert(Subscription { plan });
    }

    next.run(req).await
}

fn extract_token(headers: &axum::http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        let value = value.trim();
        if let Some(token) = value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer ")) {
            let token = token.trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    if let Some(value) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        let value = value.trim();
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;

    #[test]
    fn bearer_token_wins_over_x_api_key() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer sk-primary".parse().unwrap());
        headers.insert("x-api-key", "sk-secondary".parse().unwrap());
        assert_eq!(extract_token(&headers).as_deref(), Some("sk-primary"));
    }

    #[test]
    fn falls_back_to_x_api_key() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "sk-secondary".parse().unwrap());
        assert_eq!(extract_token(&headers).as_deref(), Some("sk-secondary"));
    }

    #[test]
    fn blank_or_missing_token_is_none() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer   ".parse().unwrap());
        assert_eq!(extract_token(&headers), None);
        assert_eq!(extract_token(&HeaderMap::new()), None);
    }
}
