//! # Evidence buffers
//!
//! Capture-side state the engine inspects while a run executes: console
//! messages, finished network responses, and the mock-rule table consulted
//! by request interception. Producers are the CDP pump tasks; consumers
//! are step handlers, which always read point-in-time snapshots.

use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// CONSOLE
// ============================================================================

/// One captured console message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsoleMessage {
    /// CDP level: `log`, `info`, `warning`, `error`, `debug`.
    #[serde(rename = "type")]
    pub level: String,
    pub text: String,
    /// Capture time, milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// Shared append-only console buffer. Cloning shares the underlying store.
#[derive(Debug, Clone, Default)]
pub struct ConsoleBuffer {
    messages: Arc<Mutex<Vec<ConsoleMessage>>>,
}

impl ConsoleBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: ConsoleMessage) {
        self.messages.lock().expect("console buffer lock").push(message);
    }

    /// Snapshot of everything buffered so far.
    pub fn snapshot(&self) -> Vec<ConsoleMessage> {
        self.messages.lock().expect("console buffer lock").clone()
    }

    pub fn clear(&self) {
        self.messages.lock().expect("console buffer lock").clear();
    }
}

// ============================================================================
// NETWORK
// ============================================================================

/// One finished network exchange.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkResponse {
    pub url: String,
    pub method: String,
    pub status: u16,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default)]
pub struct NetworkBuffer {
    responses: Arc<Mutex<Vec<NetworkResponse>>>,
}

impl NetworkBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, response: NetworkResponse) {
        self.responses.lock().expect("network buffer lock").push(response);
    }

    pub fn snapshot(&self) -> Vec<NetworkResponse> {
        self.responses.lock().expect("network buffer lock").clone()
    }

    pub fn clear(&self) {
        self.responses.lock().expect("network buffer lock").clear();
    }
}

// ============================================================================
// MOCK RULES
// ============================================================================

/// A registered interception rule. URLs are matched against the glob;
/// matching requests receive the canned status and body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockRule {
    pub pattern: String,
    pub status: u16,
    /// Already rendered wire body. Non-string step bodies are JSON-encoded
    /// at registration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
}

impl MockRule {
    /// Builds a rule from step fields, JSON-encoding non-string bodies.
    pub fn from_step(pattern: &str, status: u16, body: Option<&Value>, delay: Option<u64>) -> Self {
        let body = body.map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
        Self {
            pattern: pattern.to_string(),
            status,
            body,
            delay,
        }
    }
}

static GLOB_SPECIALS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[.+^$(){}\[\]|\\]").expect("valid glob escape regex"));

/// Compiles a URL glob to an anchored regex: `**` crosses path segments,
/// `*` stays within one, `?` matches a single character.
pub fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let escaped = GLOB_SPECIALS.replace_all(pattern, r"\$0");
    let translated = escaped
        .replace("**", "\u{0}")
        .replace('*', "[^/]*")
        .replace('\u{0}', ".*")
        .replace('?', ".");
    Regex::new(&format!("^{}$", translated))
}

/// Registration-ordered rule table shared between the engine and the
/// interception pump. First match wins.
#[derive(Debug, Clone, Default)]
pub struct MockRegistry {
    rules: Arc<Mutex<Vec<(MockRule, Regex)>>>,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, rule: MockRule) -> Result<(), regex::Error> {
        let compiled = glob_to_regex(&rule.pattern)?;
        self.rules
            .lock()
            .expect("mock registry lock")
            .push((rule, compiled));
        Ok(())
    }

    /// The first registered rule matching `url`, if any.
    pub fn find(&self, url: &str) -> Option<MockRule> {
        self.rules
            .lock()
            .expect("mock registry lock")
            .iter()
            .find(|(_, re)| re.is_match(url))
            .map(|(rule, _)| rule.clone())
    }

    pub fn len(&self) -> usize {
        self.rules.lock().expect("mock registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.rules.lock().expect("mock registry lock").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_console_buffer_snapshot_is_point_in_time() {
        let buffer = ConsoleBuffer::new();
        buffer.push(ConsoleMessage {
            level: "error".into(),
            text: "boom".into(),
            timestamp: 1,
        });
        let snap = buffer.snapshot();
        buffer.push(ConsoleMessage {
            level: "log".into(),
            text: "later".into(),
            timestamp: 2,
        });
        assert_eq!(snap.len(), 1);
        assert_eq!(buffer.snapshot().len(), 2);
    }

    #[test]
    fn test_glob_single_star_stays_in_segment() {
        let re = glob_to_regex("http://x/api/*/detail").unwrap();
        assert!(re.is_match("http://x/api/users/detail"));
        assert!(!re.is_match("http://x/api/users/1/detail"));
    }

    #[test]
    fn test_glob_double_star_crosses_segments() {
        let re = glob_to_regex("**/api/users").unwrap();
        assert!(re.is_match("http://x/api/users"));
        assert!(re.is_match("https://deep.host/v2/api/users"));
        assert!(!re.is_match("http://x/api/orders"));
    }

    #[test]
    fn test_glob_escapes_regex_metacharacters() {
        let re = glob_to_regex("http://x/path?q=1").unwrap();
        assert!(re.is_match("http://x/pathXq=1"));
        assert!(!re.is_match("http://x/pat?q=1"));
    }

    #[test]
    fn test_first_registered_rule_wins() {
        let registry = MockRegistry::new();
        registry
            .register(MockRule::from_step("**/api/**", 200, None, None))
            .unwrap();
        registry
            .register(MockRule::from_step("**/api/users", 404, None, None))
            .unwrap();
        let hit = registry.find("http://x/api/users").unwrap();
        assert_eq!(hit.status, 200);
    }

    #[test]
    fn test_non_string_body_is_json_encoded() {
        let rule = MockRule::from_step("**", 200, Some(&json!({ "ok": true })), None);
        assert_eq!(rule.body.as_deref(), Some(r#"{"ok":true}"#));
        let rule = MockRule::from_step("**", 200, Some(&json!("plain")), None);
        assert_eq!(rule.body.as_deref(), Some("plain"));
    }

    #[test]
    fn test_no_match_returns_none() {
        let registry = MockRegistry::new();
        registry
            .register(MockRule::from_step("**/api/users", 200, None, None))
            .unwrap();
        assert!(registry.find("http://x/other").is_none());
    }
}
