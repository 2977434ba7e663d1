//! Page interaction handlers: evaluation, input, and the thin wrappers
//! over the browser capability set.
//!
//! Input handlers go through the client's `fill`, which writes via the
//! native value setter and dispatches bubbling `input` / `change` events.
//! React-style controlled inputs ignore plain `.value =` writes, so the
//! setter path is load-bearing, not cosmetic.

use serde_json::Value;
use tokio::time::{sleep, Duration};
use tracing::instrument;

use super::{client_err, ExecEnv, StepOutcome};
use crate::protocol::{DialogSpec, FillSpec, FormSpec, KeySpec, SelectSpec, Target, TypeSpec};

/// Default pause between typed characters.
const TYPE_DELAY_MS: u64 = 50;

/// Evaluates a JS expression in the page. The result is the step value.
pub async fn eval(env: &ExecEnv, expr: &str) -> StepOutcome {
    match env.client.evaluate(expr).await {
        Ok(value) => StepOutcome::ok_with(value),
        Err(e) => client_err(e),
    }
}

pub async fn fill(env: &ExecEnv, spec: &FillSpec) -> StepOutcome {
    match env.client.fill(&spec.selector, &spec.value).await {
        Ok(()) => StepOutcome::ok(),
        Err(e) => client_err(e),
    }
}

/// `fill` with the empty string: same native-setter mechanism.
pub async fn clear_input(env: &ExecEnv, selector: &str) -> StepOutcome {
    match env.client.fill(selector, "").await {
        Ok(()) => StepOutcome::ok(),
        Err(e) => client_err(e),
    }
}

/// Applies fill semantics to each field in order, failing fast with the
/// field index and selector.
#[instrument(skip_all, fields(fields = spec.fields().len()))]
pub async fn fill_form(env: &ExecEnv, spec: &FormSpec) -> StepOutcome {
    for (i, field) in spec.fields().iter().enumerate() {
        if let Err(e) = env.client.fill(&field.selector, &field.value).await {
            return StepOutcome::fail(format!(
                "fill_form field {} ({}): {}",
                i, field.selector, e
            ));
        }
    }
    StepOutcome::ok()
}

/// Types text one character at a time, driving the full key event
/// sequence so per-keystroke listeners fire.
#[instrument(skip_all, fields(selector = %spec.selector, chars = spec.text.chars().count()))]
pub async fn type_text(env: &ExecEnv, spec: &TypeSpec) -> StepOutcome {
    if spec.clear {
        if let Err(e) = env.client.fill(&spec.selector, "").await {
            return client_err(e);
        }
    }

    let delay = spec.delay.unwrap_or(TYPE_DELAY_MS);
    let chars: Vec<char> = spec.text.chars().collect();
    for (i, ch) in chars.iter().enumerate() {
        let script = type_char_script(&spec.selector, *ch);
        match env.client.evaluate(&script).await {
            Ok(Value::String(s)) if s == "notfound" => {
                return StepOutcome::fail(format!("element not found: {}", spec.selector));
            }
            Ok(_) => {}
            Err(e) => return client_err(e),
        }
        if delay > 0 && i + 1 < chars.len() {
            sleep(Duration::from_millis(delay)).await;
        }
    }
    StepOutcome::ok()
}

/// Per-character script: keydown, keypress, native-setter append, input,
/// keyup.
fn type_char_script(selector: &str, ch: char) -> String {
    let sel = js_string(selector);
    let key = js_string(&ch.to_string());
    format!(
        r#"(() => {{
  const el = document.querySelector({sel});
  if (!el) return 'notfound';
  const proto = el instanceof HTMLTextAreaElement
    ? HTMLTextAreaElement.prototype
    : HTMLInputElement.prototype;
  const setter = Object.getOwnPropertyDescriptor(proto, 'value').set;
  el.focus();
  el.dispatchEvent(new KeyboardEvent('keydown', {{ key: {key}, bubbles: true }}));
  el.dispatchEvent(new KeyboardEvent('keypress', {{ key: {key}, bubbles: true }}));
  setter.call(el, el.value + {key});
  el.dispatchEvent(new Event('input', {{ bubbles: true }}));
  el.dispatchEvent(new KeyboardEvent('keyup', {{ key: {key}, bubbles: true }}));
  return 'ok';
}})()"#
    )
}

/// Fill, then Enter.
pub async fn scan_input(env: &ExecEnv, spec: &FillSpec) -> StepOutcome {
    if let Err(e) = env.client.fill(&spec.selector, &spec.value).await {
        return client_err(e);
    }
    match env.client.press_key("Enter", &[]).await {
        Ok(()) => StepOutcome::ok(),
        Err(e) => client_err(e),
    }
}

pub async fn click(env: &ExecEnv, selector: &str) -> StepOutcome {
    match env.client.click(selector).await {
        Ok(()) => StepOutcome::ok(),
        Err(e) => client_err(e),
    }
}

pub async fn hover(env: &ExecEnv, selector: &str) -> StepOutcome {
    match env.client.hover(selector).await {
        Ok(()) => StepOutcome::ok(),
        Err(e) => client_err(e),
    }
}

pub async fn select(env: &ExecEnv, spec: &SelectSpec) -> StepOutcome {
    match env.client.select(&spec.selector, &spec.value).await {
        Ok(()) => StepOutcome::ok(),
        Err(e) => client_err(e),
    }
}

pub async fn press_key(env: &ExecEnv, spec: &KeySpec) -> StepOutcome {
    match env.client.press_key(spec.key(), spec.modifiers()).await {
        Ok(()) => StepOutcome::ok(),
        Err(e) => client_err(e),
    }
}

pub async fn switch_frame(env: &ExecEnv, target: Option<&Target>) -> StepOutcome {
    match env.client.switch_frame(target.map(|t| t.selector())).await {
        Ok(()) => StepOutcome::ok(),
        Err(e) => client_err(e),
    }
}

pub async fn handle_dialog(env: &ExecEnv, spec: &DialogSpec) -> StepOutcome {
    match env
        .client
        .handle_dialog(spec.action, spec.text.as_deref())
        .await
    {
        Ok(()) => StepOutcome::ok(),
        Err(e) => client_err(e),
    }
}

/// Captures a screenshot; the base64 PNG is the step value.
pub async fn screenshot(env: &ExecEnv) -> StepOutcome {
    match env.client.capture_screenshot().await {
        Ok(png) => StepOutcome::ok_with(Value::String(png)),
        Err(e) => client_err(e),
    }
}

pub async fn scroll_to(env: &ExecEnv, selector: &str) -> StepOutcome {
    let sel = js_string(selector);
    let script = format!(
        r#"(() => {{
  const el = document.querySelector({sel});
  if (!el) return 'notfound';
  el.scrollIntoView({{ behavior: 'smooth', block: 'center' }});
  return 'ok';
}})()"#
    );
    match env.client.evaluate(&script).await {
        Ok(Value::String(s)) if s == "notfound" => {
            StepOutcome::fail(format!("element not found: {}", selector))
        }
        Ok(_) => StepOutcome::ok(),
        Err(e) => client_err(e),
    }
}

/// Encodes a Rust string as a JS string literal.
pub fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::test_support::harness;
    use serde_json::json;

    #[tokio::test]
    async fn test_eval_returns_value() {
        let (env, _ctx, _fake) = harness();
        let outcome = eval(&env, "1+1").await;
        assert!(outcome.success);
        assert_eq!(outcome.value, Some(json!(2)));
    }

    #[tokio::test]
    async fn test_fill_goes_through_client() {
        let (env, _ctx, fake) = harness();
        let outcome = fill(
            &env,
            &FillSpec {
                selector: "#email".into(),
                value: "a@b.c".into(),
            },
        )
        .await;
        assert!(outcome.success);
        assert_eq!(fake.calls(), vec!["fill #email a@b.c"]);
    }

    #[tokio::test]
    async fn test_clear_input_fills_empty() {
        let (env, _ctx, fake) = harness();
        clear_input(&env, "#q").await;
        assert_eq!(fake.calls(), vec!["fill #q "]);
    }

    #[tokio::test]
    async fn test_fill_form_fails_fast_with_index() {
        let (env, _ctx, fake) = harness();
        fake.fail_on("fill #b", "element not found");
        let spec: FormSpec = serde_json::from_value(json!({
            "fields": [
                { "selector": "#a", "value": "1" },
                { "selector": "#b", "value": "2" },
                { "selector": "#c", "value": "3" }
            ]
        }))
        .unwrap();
        let outcome = fill_form(&env, &spec).await;
        assert!(!outcome.success);
        let error = outcome.error.unwrap();
        assert!(error.contains("field 1"));
        assert!(error.contains("#b"));
        // Fail fast: #c never touched.
        assert_eq!(fake.count_calls("fill #c"), 0);
    }

    #[tokio::test]
    async fn test_type_dispatches_per_character() {
        let (env, _ctx, fake) = harness();
        fake.set_eval(|_| Ok(json!("ok")));
        let outcome = type_text(
            &env,
            &TypeSpec {
                selector: "#name".into(),
                text: "hi".into(),
                delay: Some(0),
                clear: false,
            },
        )
        .await;
        assert!(outcome.success);
        assert_eq!(fake.count_calls("evaluate"), 2);
    }

    #[tokio::test]
    async fn test_type_reports_missing_element() {
        let (env, _ctx, fake) = harness();
        fake.set_eval(|_| Ok(json!("notfound")));
        let outcome = type_text(
            &env,
            &TypeSpec {
                selector: "#ghost".into(),
                text: "x".into(),
                delay: Some(0),
                clear: false,
            },
        )
        .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("#ghost"));
    }

    #[tokio::test]
    async fn test_scan_input_fills_then_presses_enter() {
        let (env, _ctx, fake) = harness();
        scan_input(
            &env,
            &FillSpec {
                selector: "#search".into(),
                value: "rust".into(),
            },
        )
        .await;
        assert_eq!(fake.calls(), vec!["fill #search rust", "press_key Enter"]);
    }

    #[tokio::test]
    async fn test_scroll_to_missing_element_fails() {
        let (env, _ctx, fake) = harness();
        fake.set_eval(|_| Ok(json!("notfound")));
        let outcome = scroll_to(&env, "#gone").await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("element not found"));
    }

    #[test]
    fn test_js_string_escapes() {
        assert_eq!(js_string(r#"a"b"#), r#""a\"b""#);
    }
}
