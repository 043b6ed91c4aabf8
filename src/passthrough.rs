use serde::Deserialize;
use serde_json::Value;
use std::sync::RwLock;

/// One configurable rule converting an upstream error into the client-visible
/// response. `family`/`status`/`body_contains` are the match predicate; the
/// remaining fields control the response.
#[derive(Clone, Debug, Deserialize)]
pub struct PassthroughRuleConfig {
    #[serde(default)]
    pub family: Option<String>,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub body_contains: Option<String>,
    #[serde(default = "default_passthrough")]
    pub passthrough_code: bool,
    #[serde(default)]
    pub response_code: Option<u16>,
    #[serde(default = "default_passthrough")]
    pub passthrough_body: bool,
    #[serde(default)]
    pub custom_message: Option<String>,
    #[serde(default)]
    pub skip_monitoring: bool,
}

fn default_passthrough() -> bool {
    true
}

impl PassthroughRuleConfig {
    fn matches(&self, family: &str, status: u16, body: &str) -> bool {
        if let Some(rule_family) = &self.family {
            if !rule_family.eq_ignore_ascii_case(family) {
                return false;
            }
        }
        if let Some(rule_status) = self.status {
            if rule_status != status {
                return false;
            }
        }
        if let Some(needle) = &self.body_contains {
            if !body.contains(needle.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Read-mostly rule set; `reload` swaps the whole list.
pub struct PassthroughRules {
    rules: RwLock<Vec<PassthroughRuleConfig>>,
}

impl PassthroughRules {
    pub fn new(rules: Vec<PassthroughRuleConfig>) -> Self {
        Self {
            rules: RwLock::new(rules),
        }
    }

    pub fn reload(&self, rules: Vec<PassthroughRuleConfig>) {
        *self.rules.write().expect("passthrough rules poisoned") = rules;
    }

    pub fn match_rule(&self, family: &str, status: u16, body: &str) -> Option<PassthroughRuleConfig> {
        let rules = self.rules.read().expect("passthrough rules poisoned");
        rules
            .iter()
            .find(|rule| rule.matches(family, status, body))
            .cloned()
    }
}

/// Best-effort human-readable message from an upstream error body.
pub fn extract_upstream_error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        for path in [&["error", "message"][..], &["message"][..]] {
            let mut node = &value;
            let mut found = true;
            for key in path {
                match node.get(key) {
                    Some(next) => node = next,
                    None => {
                        found = false;
                        break;
                    }
                }
            }
            if found {
                if let Some(message) = node.as_str() {
                    if !message.trim().is_empty() {
                        return message.to_string();
                    }
                }
            }
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "Upstream request failed".to_string()
    } else {
        let mut message: String = trimmed.chars().take(200).collect();
        if message.len() < trimmed.len() {
            message.push('…');
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(family: Option<&str>, status: Option<u16>, body_contains: Option<&str>) -> PassthroughRuleConfig {
        PassthroughRuleConfig {
            family: family.map(str::to_string),
            status,
            body_contains: body_contains.map(str::to_string),
            passthrough_code: true,
            response_code: None,
            passthrough_body: true,
            custom_message: None,
            skip_monitoring: false,
        }
    }

    #[test]
    fn matches_on_family_status_and_body() {
        let rules = PassthroughRules::new(vec![rule(
            Some("responses"),
            Some(429),
            Some("quota"),
        )]);
        assert!(rules
            .match_rule("responses", 429, r#"{"error":{"message":"quota exhausted"}}"#)
            .is_some());
        assert!(rules.match_rule("responses", 429, "slow down").is_none());
        assert!(rules.match_rule("gemini", 429, "quota").is_none());
        assert!(rules.match_rule("responses", 500, "quota").is_none());
    }

    #[test]
    fn wildcard_fields_match_anything() {
        let rules = PassthroughRules::new(vec![rule(None, None, None)]);
        assert!(rules.match_rule("messages", 503, "").is_some());
    }

    #[test]
    fn first_matching_rule_wins() {
        let mut custom = rule(None, Some(429), None);
        custom.passthrough_body = false;
        custom.custom_message = Some("custom".to_string());
        let rules = PassthroughRules::new(vec![custom, rule(None, None, None)]);
        let matched = rules.match_rule("responses", 429, "{}").expect("rule");
        assert_eq!(matched.custom_message.as_deref(), Some("custom"));
    }

    #[test]
    fn reload_replaces_rules() {
        let rules = PassthroughRules::new(vec![rule(None, Some(429), None)]);
        rules.reload(vec![rule(None, Some(500), None)]);
        assert!(rules.match_rule("responses", 429, "").is_none());
        assert!(rules.match_rule("responses", 500, "").is_some());
    }

    #[test]
    fn extracts_nested_error_message() {
        assert_eq!(
            extract_upstream_error_message(r#"{"error":{"message":"bad key"}}"#),
            "bad key"
        );
        assert_eq!(
            extract_upstream_error_message(r#"{"message":"flat"}"#),
            "flat"
        );
        assert_eq!(extract_upstream_error_message("plain text"), "plain text");
        assert_eq!(extract_upstream_error_message("  "), "Upstream request failed");
    }
}
