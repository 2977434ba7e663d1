//! Network-side handlers: mock-rule registration and the out-of-band
//! `http_request` step, which calls from the engine process rather than
//! the page.

use reqwest::Method;
use serde_json::Value;
use tracing::{info, instrument};

use super::{client_err, ExecEnv, StepOutcome};
use crate::evidence::MockRule;
use crate::protocol::{HttpRequestSpec, MockRuleSpec};

/// Registers an interception rule with the client. Rules registered in
/// `before` are active for the initial navigation; first match wins.
pub async fn mock_network(env: &ExecEnv, spec: &MockRuleSpec) -> StepOutcome {
    let rule = MockRule::from_step(&spec.pattern, spec.status, spec.body.as_ref(), spec.delay);
    match env.client.add_mock_rule(rule).await {
        Ok(()) => {
            info!(pattern = %spec.pattern, status = spec.status, "mock rule registered");
            StepOutcome::ok()
        }
        Err(e) => client_err(e),
    }
}

/// Joins query parameters onto the URL, URL-encoding keys and values.
fn build_url(spec: &HttpRequestSpec) -> String {
    if spec.query_params.is_empty() {
        return spec.url.clone();
    }
    let mut parts: Vec<String> = Vec::with_capacity(spec.query_params.len());
    for (k, v) in &spec.query_params {
        let value = match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        parts.push(format!(
            "{}={}",
            urlencoding::encode(k),
            urlencoding::encode(&value)
        ));
    }
    let separator = if spec.url.contains('?') { "&" } else { "?" };
    format!("{}{}{}", spec.url, separator, parts.join("&"))
}

/// Renders the request body: strings go out verbatim, everything else is
/// JSON-encoded.
fn render_body(body: &Value) -> String {
    match body {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Out-of-band HTTP call. Defaults: `GET`, `Content-Type:
/// application/json`, 30s timeout. Non-2xx statuses fail the step; 2xx
/// responses become the step value, parsed as JSON when the response
/// advertises it.
#[instrument(skip_all, fields(url = %spec.url, method = tracing::field::Empty))]
pub async fn http_request(env: &ExecEnv, spec: &HttpRequestSpec) -> StepOutcome {
    let method_str = spec.method.as_deref().unwrap_or("GET").to_uppercase();
    let method = match Method::from_bytes(method_str.as_bytes()) {
        Ok(m) => m,
        Err(_) => return StepOutcome::fail(format!("invalid HTTP method: {}", method_str)),
    };
    tracing::Span::current().record("method", method_str.as_str());

    let url = build_url(spec);
    let mut request = env
        .http
        .request(method, &url)
        .header("Content-Type", "application/json");
    for (k, v) in &spec.headers {
        request = request.header(k, v);
    }
    if let Some(body) = &spec.body {
        request = request.body(render_body(body));
    }
    let timeout_ms = spec.timeout.unwrap_or(30_000);
    request = request.timeout(std::time::Duration::from_millis(timeout_ms));

    let response = match request.send().await {
        Ok(r) => r,
        Err(e) => return StepOutcome::fail(format!("request failed: {}", e)),
    };

    let status = response.status();
    let is_json = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("application/json"))
        .unwrap_or(false);
    let text = response.text().await.unwrap_or_default();

    if !status.is_success() {
        return StepOutcome::fail(format!(
            "HTTP {} from {}: {}",
            status.as_u16(),
            url,
            truncate(&text, 200)
        ));
    }

    info!(status = status.as_u16(), %url, "http_request finished");

    let value = if is_json {
        serde_json::from_str(&text).unwrap_or(Value::String(text))
    } else {
        Value::String(text)
    };
    StepOutcome::ok_with(value)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::test_support::harness;
    use serde_json::json;

    fn spec(v: Value) -> HttpRequestSpec {
        serde_json::from_value(v).unwrap()
    }

    #[tokio::test]
    async fn test_mock_network_registers_with_client() {
        let (env, _ctx, fake) = harness();
        let rule: MockRuleSpec = serde_json::from_value(json!({
            "match": "**/api/users",
            "status": 503,
            "body": { "error": "down" },
            "delay": 100
        }))
        .unwrap();
        let outcome = mock_network(&env, &rule).await;
        assert!(outcome.success);
        let hit = fake.mocks().find("http://x/api/users").unwrap();
        assert_eq!(hit.status, 503);
        assert_eq!(hit.body.as_deref(), Some(r#"{"error":"down"}"#));
        assert_eq!(hit.delay, Some(100));
    }

    #[tokio::test]
    async fn test_mock_network_bad_glob_fails() {
        let (env, _ctx, _fake) = harness();
        // A pattern that survives glob translation but produces an invalid
        // regex is not constructible; invalid rules surface through the
        // client error path instead.
        let rule: MockRuleSpec =
            serde_json::from_value(json!({ "match": "**", "status": 200 })).unwrap();
        assert!(mock_network(&env, &rule).await.success);
    }

    #[test]
    fn test_build_url_appends_encoded_query_params() {
        let spec = spec(json!({
            "url": "http://x/search",
            "query_params": { "q": "a b", "page": 2 }
        }));
        let url = build_url(&spec);
        assert_eq!(url, "http://x/search?page=2&q=a%20b");
    }

    #[test]
    fn test_build_url_respects_existing_query() {
        let spec = spec(json!({
            "url": "http://x/search?lang=en",
            "query_params": { "q": "rust" }
        }));
        assert_eq!(build_url(&spec), "http://x/search?lang=en&q=rust");
    }

    #[test]
    fn test_render_body_json_encodes_non_strings() {
        assert_eq!(render_body(&json!({ "a": 1 })), r#"{"a":1}"#);
        assert_eq!(render_body(&json!("raw text")), "raw text");
    }

    #[test]
    fn test_default_method_is_get() {
        let spec = spec(json!({ "url": "http://x" }));
        assert!(spec.method.is_none());
    }
}
