use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Upstream identity with its own credentials, model set, and concurrency
/// budget. Records are read-only for the lifetime of the process.
#[derive(Clone, Debug, Deserialize)]
pub struct Account {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub account_type: AccountType,
    #[serde(default)]
    pub status: AccountStatus,
    pub concurrency: u32,
    pub credentials: Credentials,
    pub models: HashSet<String>,
}

impl Account {
    pub fn supports_model(&self, model: &str) -> bool {
        self.models.contains(model)
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, AccountStatus::Active)
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    #[default]
    Upstream,
    ManagedOauth,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    #[default]
    Active,
    Disabled,
    Exhausted,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Credentials {
    pub base_url: String,
    pub api_key: String,
    #[serde(default, flatten)]
    pub extra: HashMap<String, String>,
}

/// Wire family of an inbound endpoint; decides upstream path and auth shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolFamily {
    Responses,
    Messages,
    Gemini,
}

impl ProtocolFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolFamily::Responses => "responses",
            ProtocolFamily::Messages => "messages",
            ProtocolFamily::Gemini => "gemini",
        }
    }
}

/// Authenticated client key, resolved by the auth middleware.
#[derive(Clone, Debug)]
pub struct ApiKeyRecord {
    pub id: i64,
    pub name: String,
    pub user_id: i64,
    pub group_id: i64,
}

#[derive(Clone, Copy, Debug)]
pub struct AuthSubject {
    pub user_id: i64,
    pub concurrency: u32,
}

#[derive(Clone, Debug)]
pub struct Subscription {
    pub plan: String,
}

/// Offered when the selected account has no immediately free slot.
#[derive(Clone, Copy, Debug)]
pub struct WaitPlan {
    pub max_concurrency: u32,
    pub max_waiting: u32,
    pub timeout: Duration,
}

/// Upstream error eligible for account switching. `status_code` is 0 for
/// network-level failures that never produced a response.
#[derive(Debug)]
pub struct UpstreamFailoverError {
    pub status_code: u16,
    pub response_body: String,
    pub headers: HashMap<String, String>,
}

impl std::fmt::Display for UpstreamFailoverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "upstream error status={}", self.status_code)
    }
}

pub fn is_failover_status(status: u16) -> bool {
    matches!(status, 401 | 403 | 429 | 500 | 502 | 503 | 504 | 529)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failover_status_set() {
        for status in [401u16, 403, 429, 500, 502, 503, 504, 529] {
            assert!(is_failover_status(status), "{} should fail over", status);
        }
        for status in [400u16, 404, 422, 200] {
            assert!(!is_failover_status(status), "{} should not fail over", status);
        }
    }

    #[test]
    fn account_status_deserializes_snake_case() {
        let account: Account = serde_json::from_value(serde_json::json!({
            "id": 7,
            "name": "pool-a",
            "platform": "openai",
            "status": "exhausted",
            "concurrency": 4,
            "credentials": {"base_url": "https://upstream.example.com", "api_key": "sk-a"},
            "models": ["gpt-5.2"]
        }))
        .expect("account");
        assert_eq!(account.status, AccountStatus::Exhausted);
        assert!(!account.is_active());
        assert!(account.supports_model("gpt-5.2"));
    }
}
