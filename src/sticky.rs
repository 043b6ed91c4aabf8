use axum::http::HeaderMap;
use serde_json::{Map, Value};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Advisory (group, session) → account bindings with a bounded TTL,
/// refreshed whenever a binding is used for a successful acquisition.
pub struct StickySessions {
    ttl: Duration,
    bindings: Mutex<HashMap<(i64, u64), Binding>>,
}

struct Binding {
    account_id: i64,
    expires_at: Instant,
}

impl StickySessions {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            bindings: Mutex::new(HashMap::new()),
        }
    }

    pub fn lookup(&self, group_id: i64, session: u64) -> Option<i64> {
        let mut bindings = self.bindings.lock().expect("sticky map poisoned");
        match bindings.get(&(group_id, session)) {
            Some(binding) if binding.expires_at > Instant::now() => Some(binding.account_id),
            Some(_) => {
                bindings.remove(&(group_id, session));
                None
            }
            None => None,
        }
    }

    /// Create or refresh the binding for this session.
    pub fn bind(&self, group_id: i64, session: u64, account_id: i64) {
        let mut bindings = self.bindings.lock().expect("sticky map poisoned");
        bindings.insert(
            (group_id, session),
            Binding {
                account_id,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Drop the binding only if it still points at `account_id`. Called when
    /// an account enters a request's exclusion set so a failed account never
    /// stays preferred.
    pub fn unbind(&self, group_id: i64, session: u64, account_id: i64) {
        let mut bindings = self.bindings.lock().expect("sticky map poisoned");
        if let Some(binding) = bindings.get(&(group_id, session)) {
            if binding.account_id == account_id {
                bindings.remove(&(group_id, session));
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.bindings.lock().expect("sticky map poisoned").len()
    }
}

/// Derive the session key: explicit client header first, `prompt_cache_key`
/// in the body as fallback. Neither present → sticky routing is skipped.
pub fn session_hash(headers: &HeaderMap, body: &Map<String, Value>, header_name: &str) -> Option<u64> {
    if let Some(value) = headers.get(header_name) {
        if let Ok(value) = value.to_str() {
            let value = value.trim();
            if !value.is_empty() {
                return Some(hash_str(value));
            }
        }
    }
    if let Some(Value::String(key)) = body.get("prompt_cache_key") {
        let key = key.trim();
        if !key.is_empty() {
            return Some(hash_str(key));
        }
    }
    None
}

fn hash_str(value: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_and_lookup() {
        let sticky = StickySessions::new(Duration::from_secs(60));
        sticky.bind(1, 42, 100);
        assert_eq!(sticky.lookup(1, 42), Some(100));
        assert_eq!(sticky.lookup(2, 42), None);
    }

    #[test]
    fn expired_binding_is_dropped_on_lookup() {
        let sticky = StickySessions::new(Duration::from_millis(5));
        sticky.bind(1, 42, 100);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(sticky.lookup(1, 42), None);
        assert_eq!(sticky.len(), 0);
    }

    #[test]
    fn rebind_refreshes_expiry() {
        let sticky = StickySessions::new(Duration::from_millis(40));
        sticky.bind(1, 42, 100);
        std::thread::sleep(Duration::from_millis(25));
        sticky.bind(1, 42, 100);
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(sticky.lookup(1, 42), Some(100));
    }

    #[test]
    fn unbind_only_removes_matching_account() {
        let sticky = StickySessions::new(Duration::from_secs(60));
        sticky.bind(1, 42, 100);
        sticky.unbind(1, 42, 200);
        assert_eq!(sticky.lookup(1, 42), Some(100));
        sticky.unbind(1, 42, 100);
        assert_eq!(sticky.lookup(1, 42), None);
    }

    #[test]
    fn session_hash_prefers_header_over_cache_key() {
        let mut headers = HeaderMap::new();
        headers.insert("x-session-id", "abc".parse().unwrap());
        let mut body = Map::new();
        body.insert("prompt_cache_key".to_string(), Value::String("xyz".to_string()));

        let from_header = session_hash(&headers, &body, "x-session-id").expect("hash");
        let from_body = session_hash(&HeaderMap::new(), &body, "x-session-id").expect("hash");
        assert_ne!(from_header, from_body);
        assert_eq!(from_header, hash_str("abc"));
        assert_eq!(from_body, hash_str("xyz"));
    }

    #[test]
    fn session_hash_skips_blank_values() {
        let mut headers = HeaderMap::new();
        headers.insert("x-session-id", "  ".parse().unwrap());
        let body = Map::new();
        assert_eq!(session_hash(&headers, &body, "x-session-id"), None);
    }
}
