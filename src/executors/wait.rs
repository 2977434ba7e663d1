//! Timing handlers: fixed sleeps and the polling family.
//!
//! Polls run at a fixed 200ms cadence against the page and always probe at
//! least once before declaring a timeout, so a zero timeout still observes
//! current state.

use serde_json::Value;
use tokio::time::{sleep, Duration, Instant};
use tracing::instrument;

use super::page::js_string;
use super::{client_err, truthy, ExecEnv, StepOutcome};
use crate::errors::RunError;
use crate::protocol::{MatchMode, TextProbe, WaitForSpec, WaitSpec};

pub const POLL_INTERVAL_MS: u64 = 200;
pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 5_000;

/// Pure timer. Suspends only this run's task.
pub async fn wait(spec: &WaitSpec) -> StepOutcome {
    sleep(Duration::from_millis(spec.millis())).await;
    StepOutcome::ok()
}

/// Polls until the selector resolves or the timeout elapses.
#[instrument(skip_all, fields(selector = spec.selector()))]
pub async fn wait_for(env: &ExecEnv, spec: &WaitForSpec) -> StepOutcome {
    let timeout_ms = spec.timeout().unwrap_or(DEFAULT_WAIT_TIMEOUT_MS);
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    let script = format!(
        "!!document.querySelector({})",
        js_string(spec.selector())
    );

    loop {
        match env.client.evaluate(&script).await {
            Ok(value) if truthy(&value) => return StepOutcome::ok(),
            Ok(_) => {}
            Err(e) => return client_err(e),
        }
        if Instant::now() >= deadline {
            return StepOutcome::fail(format!(
                "{} waiting for selector: {}",
                RunError::StepTimeout(timeout_ms),
                spec.selector()
            ));
        }
        sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
    }
}

/// Polls for text presence (or absence when `gone`) inside the scope
/// element, `document.body` by default. Matching happens engine-side so
/// `regex` mode uses real regex syntax, not whatever the page ships.
#[instrument(skip_all, fields(text = probe.text(), gone))]
pub async fn wait_for_text(env: &ExecEnv, probe: &TextProbe, gone: bool) -> StepOutcome {
    let timeout_ms = probe.timeout().unwrap_or(DEFAULT_WAIT_TIMEOUT_MS);
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    let script = scope_text_script(probe.selector());

    loop {
        let text = match env.client.evaluate(&script).await {
            Ok(Value::String(s)) => s,
            Ok(other) => {
                if other.is_null() {
                    String::new()
                } else {
                    other.to_string()
                }
            }
            Err(e) => return client_err(e),
        };

        let present = match text_matches(&text, probe.text(), probe.match_mode()) {
            Ok(present) => present,
            Err(e) => return StepOutcome::fail(e),
        };
        if present != gone {
            return StepOutcome::ok();
        }

        if Instant::now() >= deadline {
            let what = if gone { "text to disappear" } else { "text" };
            return StepOutcome::fail(format!(
                "{} waiting for {}: {}",
                RunError::StepTimeout(timeout_ms),
                what,
                probe.text()
            ));
        }
        sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
    }
}

/// JS expression reading the scope's rendered text.
pub fn scope_text_script(selector: Option<&str>) -> String {
    match selector {
        Some(sel) => format!(
            "(() => {{ const el = document.querySelector({}); return el ? el.innerText : ''; }})()",
            js_string(sel)
        ),
        None => "document.body.innerText".to_string(),
    }
}

/// Shared match-mode comparison. Regex errors surface as step failures.
pub fn text_matches(haystack: &str, needle: &str, mode: MatchMode) -> Result<bool, String> {
    match mode {
        MatchMode::Contains => Ok(haystack.contains(needle)),
        MatchMode::Exact => Ok(haystack.trim() == needle),
        MatchMode::Regex => regex::Regex::new(needle)
            .map(|re| re.is_match(haystack))
            .map_err(|e| format!("invalid regex '{}': {}", needle, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::test_support::harness;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_wait_sleeps_roughly_the_requested_time() {
        let start = Instant::now();
        let outcome = wait(&WaitSpec::Millis(60)).await;
        assert!(outcome.success);
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_wait_for_succeeds_once_selector_appears() {
        let (env, _ctx, fake) = harness();
        let polls = Arc::new(AtomicU32::new(0));
        let polls_clone = polls.clone();
        fake.set_eval(move |_| {
            let n = polls_clone.fetch_add(1, Ordering::SeqCst);
            Ok(json!(n >= 2))
        });
        let spec: WaitForSpec =
            serde_json::from_value(json!({ "selector": "#late", "timeout": 2000 })).unwrap();
        let outcome = wait_for(&env, &spec).await;
        assert!(outcome.success);
        assert!(polls.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_wait_for_times_out_with_selector_in_message() {
        let (env, _ctx, fake) = harness();
        fake.set_eval(|_| Ok(json!(false)));
        let spec: WaitForSpec =
            serde_json::from_value(json!({ "selector": "#never", "timeout": 0 })).unwrap();
        let outcome = wait_for(&env, &spec).await;
        assert!(!outcome.success);
        let error = outcome.error.unwrap();
        assert!(error.contains("Timeout after 0ms"));
        assert!(error.contains("#never"));
    }

    #[tokio::test]
    async fn test_wait_for_text_contains_default() {
        let (env, _ctx, fake) = harness();
        fake.set_eval(|_| Ok(json!("Welcome back, Ada")));
        let probe = TextProbe::Text("Welcome".into());
        let outcome = wait_for_text(&env, &probe, false).await;
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn test_wait_for_text_gone_inverts() {
        let (env, _ctx, fake) = harness();
        fake.set_eval(|_| Ok(json!("Loading complete")));
        let probe: TextProbe =
            serde_json::from_value(json!({ "text": "Spinner", "timeout": 0 })).unwrap();
        let outcome = wait_for_text(&env, &probe, true).await;
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn test_wait_for_text_regex_mode() {
        let (env, _ctx, fake) = harness();
        fake.set_eval(|_| Ok(json!("Order #4217 confirmed")));
        let probe: TextProbe = serde_json::from_value(json!({
            "text": r"Order #\d+",
            "match": "regex",
            "timeout": 0
        }))
        .unwrap();
        let outcome = wait_for_text(&env, &probe, false).await;
        assert!(outcome.success);
    }

    #[test]
    fn test_text_matches_exact_trims_scope_text() {
        assert!(text_matches("  Save  \n", "Save", MatchMode::Exact).unwrap());
        assert!(!text_matches("Save all", "Save", MatchMode::Exact).unwrap());
    }

    #[test]
    fn test_text_matches_bad_regex_is_an_error() {
        assert!(text_matches("x", "(", MatchMode::Regex).is_err());
    }
}
