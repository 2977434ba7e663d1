//! Assertion handlers: page-expression asserts with optional retry, text
//! asserts, and the evidence checks over the console and network buffers.

use tokio::time::{sleep, Duration, Instant};
use tracing::instrument;

use super::wait::{scope_text_script, text_matches};
use super::{client_err, truthy, ExecEnv, StepOutcome};
use crate::errors::RunError;
use crate::protocol::{AssertTextSpec, ConsoleCheckSpec, RetrySpec};

/// Evaluates the assertion expression, re-trying per the retry block.
/// The expression is evaluated at least once even with a zero timeout; on
/// timeout the error carries the last evaluation error, or the expression
/// itself when evaluation kept returning falsy values.
#[instrument(skip_all, fields(expr))]
pub async fn assert_expr(env: &ExecEnv, expr: &str, retry: Option<&RetrySpec>) -> StepOutcome {
    let Some(retry) = retry else {
        return match env.client.evaluate(expr).await {
            Ok(value) if truthy(&value) => StepOutcome::ok(),
            Ok(_) => StepOutcome::fail(
                RunError::AssertionFailure(format!("Assertion failed: {}", expr)).to_string(),
            ),
            Err(e) => client_err(e),
        };
    };

    let deadline = Instant::now() + Duration::from_millis(retry.timeout);
    let mut last_error: Option<String> = None;
    loop {
        match env.client.evaluate(expr).await {
            Ok(value) if truthy(&value) => return StepOutcome::ok(),
            Ok(_) => last_error = None,
            Err(e) => last_error = Some(e.to_string()),
        }
        if Instant::now() >= deadline {
            let detail = last_error.unwrap_or_else(|| expr.to_string());
            return StepOutcome::fail(format!(
                "{}: {}",
                RunError::StepTimeout(retry.timeout),
                detail
            ));
        }
        sleep(Duration::from_millis(retry.interval)).await;
    }
}

/// Match-mode equality over the scope's `innerText`; `absent` inverts.
#[instrument(skip_all, fields(text = %spec.text, absent = spec.absent))]
pub async fn assert_text(
    env: &ExecEnv,
    spec: &AssertTextSpec,
    retry: Option<&RetrySpec>,
) -> StepOutcome {
    let script = scope_text_script(spec.selector.as_deref());
    let deadline = retry.map(|r| Instant::now() + Duration::from_millis(r.timeout));

    loop {
        let attempt = check_text_once(env, spec, &script).await;
        match attempt {
            Ok(()) => return StepOutcome::ok(),
            Err(error) => {
                let Some(deadline) = deadline else {
                    return StepOutcome::fail(error);
                };
                if Instant::now() >= deadline {
                    let timeout = retry.map(|r| r.timeout).unwrap_or_default();
                    return StepOutcome::fail(format!(
                        "{}: {}",
                        RunError::StepTimeout(timeout),
                        error
                    ));
                }
            }
        }
        if let Some(retry) = retry {
            sleep(Duration::from_millis(retry.interval)).await;
        }
    }
}

async fn check_text_once(env: &ExecEnv, spec: &AssertTextSpec, script: &str) -> Result<(), String> {
    let text = match env.client.evaluate(script).await {
        Ok(serde_json::Value::String(s)) => s,
        Ok(v) if v.is_null() => String::new(),
        Ok(v) => v.to_string(),
        Err(e) => return Err(e.to_string()),
    };
    let present = text_matches(&text, &spec.text, spec.match_mode)?;
    let scope = spec.selector.as_deref().unwrap_or("body");
    match (present, spec.absent) {
        (true, false) | (false, true) => Ok(()),
        (false, false) => Err(format!("Text not found in {}: \"{}\"", scope, spec.text)),
        (true, true) => Err(format!("Text still present in {}: \"{}\"", scope, spec.text)),
    }
}

/// Passes when no buffered console message has a forbidden level. `warn`
/// is normalised to `warning` to line up with CDP level names.
pub async fn console_check(env: &ExecEnv, spec: &ConsoleCheckSpec) -> StepOutcome {
    let forbidden: Vec<String> = spec
        .levels()
        .iter()
        .map(|l| normalise_level(l))
        .collect();

    let messages = match env.client.get_console_messages().await {
        Ok(m) => m,
        Err(e) => return client_err(e),
    };

    let offending: Vec<String> = messages
        .iter()
        .filter(|m| forbidden.contains(&normalise_level(&m.level)))
        .map(|m| format!("[{}] {}", m.level, m.text))
        .collect();

    if offending.is_empty() {
        StepOutcome::ok()
    } else {
        StepOutcome::fail(RunError::ConsoleCheckFailure(offending.join("; ")).to_string())
    }
}

fn normalise_level(level: &str) -> String {
    match level {
        "warn" => "warning".to_string(),
        other => other.to_string(),
    }
}

/// When enabled, fails if any buffered response carried an HTTP error
/// status.
pub async fn network_check(env: &ExecEnv, enabled: bool) -> StepOutcome {
    if !enabled {
        return StepOutcome::ok();
    }
    let responses = match env.client.get_network_responses().await {
        Ok(r) => r,
        Err(e) => return client_err(e),
    };
    let failures: Vec<String> = responses
        .iter()
        .filter(|r| r.status >= 400)
        .map(|r| format!("{} {}", r.status, r.url))
        .collect();
    if failures.is_empty() {
        StepOutcome::ok()
    } else {
        StepOutcome::fail(RunError::NetworkCheckFailure(failures.join("; ")).to_string())
    }
}
