//! Derived interaction handlers for common UI widgets: text-targeted
//! clicks, dropdowns, collapsible menu groups, toggles, and modals.
//!
//! These run as page-side scripts returning small status strings
//! (`clicked`, `notfound`, ...) that the engine folds into outcomes. Text
//! matching happens in the page so the DOM is walked once per attempt.

use serde_json::Value;
use tokio::time::{sleep, Duration, Instant};
use tracing::instrument;

use super::page::js_string;
use super::wait::POLL_INTERVAL_MS;
use super::{client_err, ExecEnv, StepOutcome};
use crate::errors::RunError;
use crate::protocol::{
    ClickNthSpec, ClickTextSpec, CloseModalSpec, CloseStrategy, DropdownSpec, ExpandMenuSpec,
    MatchMode, ToggleSpec,
};

/// Default deadline for dropdown options to appear.
const DROPDOWN_TIMEOUT_MS: u64 = 3_000;

/// Selector list the `button` close strategy probes, in order.
const CLOSE_BUTTON_SELECTORS: &[&str] = &[
    r#"[aria-label="Close modal"]"#,
    r#"[aria-label="Close"]"#,
    ".close-button",
    "button.close",
    r#"[data-dismiss="modal"]"#,
];

fn match_mode_js(mode: MatchMode) -> &'static str {
    match mode {
        MatchMode::Contains => "contains",
        MatchMode::Exact => "exact",
        MatchMode::Regex => "regex",
    }
}

/// Script fragment defining `matches(t)` for the given needle and mode.
fn matcher_js(text: &str, mode: MatchMode) -> String {
    format!(
        r#"const want = {}; const mode = {};
  const matches = (t) => {{
    t = (t || '').toString();
    if (mode === 'exact') return t.trim() === want;
    if (mode === 'regex') {{ try {{ return new RegExp(want).test(t); }} catch (e) {{ return false; }} }}
    return t.includes(want);
  }};"#,
        js_string(text),
        js_string(match_mode_js(mode))
    )
}

fn click_match_script(text: &str, selector: Option<&str>, mode: MatchMode, index: usize) -> String {
    let scope = match selector {
        Some(sel) => format!("document.querySelector({})", js_string(sel)),
        None => "document.body".to_string(),
    };
    format!(
        r#"(() => {{
  const scope = {scope};
  if (!scope) return 'noscope';
  {matcher}
  const hits = [];
  for (const el of scope.querySelectorAll('*')) {{
    if (el.children.length === 0 && matches(el.innerText)) hits.push(el);
  }}
  if ({index} >= hits.length) return 'notfound';
  hits[{index}].click();
  return 'clicked';
}})()"#,
        scope = scope,
        matcher = matcher_js(text, mode),
        index = index,
    )
}

/// Clicks the first leaf descendant of the scope whose text matches.
pub async fn click_text(env: &ExecEnv, spec: &ClickTextSpec) -> StepOutcome {
    click_match(env, spec.text(), spec.selector(), spec.match_mode(), 0).await
}

/// Clicks the `index`-th match. Out-of-range indices report the same
/// element-not-found failure as a zero-hit scan.
pub async fn click_nth(env: &ExecEnv, spec: &ClickNthSpec) -> StepOutcome {
    click_match(
        env,
        &spec.text,
        spec.selector.as_deref(),
        spec.match_mode,
        spec.index,
    )
    .await
}

async fn click_match(
    env: &ExecEnv,
    text: &str,
    selector: Option<&str>,
    mode: MatchMode,
    index: usize,
) -> StepOutcome {
    let script = click_match_script(text, selector, mode, index);
    match env.client.evaluate(&script).await {
        Ok(Value::String(s)) if s == "clicked" => StepOutcome::ok(),
        Ok(Value::String(s)) if s == "noscope" => StepOutcome::fail(format!(
            "element not found: {}",
            selector.unwrap_or("body")
        )),
        Ok(_) => StepOutcome::fail(format!("element not found: text \"{}\"", text)),
        Err(e) => client_err(e),
    }
}

/// Clicks the dropdown trigger, then polls for `[role=menuitem]` /
/// `[role=option]` elements and clicks the first text match.
#[instrument(skip_all, fields(selector = %spec.selector, text = %spec.text))]
pub async fn choose_dropdown(env: &ExecEnv, spec: &DropdownSpec) -> StepOutcome {
    if let Err(e) = env.client.click(&spec.selector).await {
        return client_err(e);
    }

    let timeout_ms = spec.timeout.unwrap_or(DROPDOWN_TIMEOUT_MS);
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    let script = format!(
        r#"(() => {{
  const opts = Array.from(document.querySelectorAll('[role=menuitem],[role=option]'));
  if (!opts.length) return 'none';
  {matcher}
  const hit = opts.find(el => matches(el.innerText));
  if (!hit) return 'nomatch';
  hit.click();
  return 'clicked';
}})()"#,
        matcher = matcher_js(&spec.text, spec.match_mode),
    );

    loop {
        match env.client.evaluate(&script).await {
            Ok(Value::String(s)) if s == "clicked" => return StepOutcome::ok(),
            Ok(_) => {}
            Err(e) => return client_err(e),
        }
        if Instant::now() >= deadline {
            return StepOutcome::fail(format!(
                "{} waiting for option: \"{}\"",
                RunError::StepTimeout(timeout_ms),
                spec.text
            ));
        }
        sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
    }
}

/// Expands a collapsible group by its accessible name. A group that is
/// already expanded is a success without action.
pub async fn expand_menu(env: &ExecEnv, spec: &ExpandMenuSpec) -> StepOutcome {
    let group = js_string(spec.group());
    let script = format!(
        r#"(() => {{
  const group = {group};
  const els = Array.from(document.querySelectorAll('[aria-label]'));
  const collapsed = els.find(el => el.getAttribute('aria-label') === group + ', collapsed');
  if (collapsed) {{ collapsed.click(); return 'clicked'; }}
  const expanded = els.find(el => el.getAttribute('aria-label') === group + ', expanded');
  if (expanded) return 'already';
  return 'notfound';
}})()"#
    );
    match env.client.evaluate(&script).await {
        Ok(Value::String(s)) if s == "clicked" || s == "already" => StepOutcome::ok(),
        Ok(_) => StepOutcome::fail(format!("menu group not found: \"{}\"", spec.group())),
        Err(e) => client_err(e),
    }
}

/// Flips the control associated with a label. With an explicit `state`,
/// a control already in that state is left untouched.
pub async fn toggle(env: &ExecEnv, spec: &ToggleSpec) -> StepOutcome {
    let desired = match spec.state() {
        Some(b) => b.to_string(),
        None => "null".to_string(),
    };
    let script = format!(
        r#"(() => {{
  const want = {text};
  const label = Array.from(document.querySelectorAll('label'))
    .find(l => (l.innerText || '').includes(want));
  if (!label) return 'notfound';
  let control = null;
  const forId = label.getAttribute('for');
  if (forId) control = document.getElementById(forId);
  if (!control) control = label.querySelector('input');
  if (!control) {{
    const root = label.parentElement || document.body;
    control = root.querySelector('[role=switch],[role=checkbox],input[type=checkbox]');
  }}
  if (!control) return 'nocontrol';
  const current = control.getAttribute('role')
    ? control.getAttribute('aria-checked') === 'true'
    : !!control.checked;
  const desired = {desired};
  if (desired !== null && current === desired) return 'already';
  control.click();
  return 'clicked';
}})()"#,
        text = js_string(spec.text()),
        desired = desired,
    );
    match env.client.evaluate(&script).await {
        Ok(Value::String(s)) if s == "clicked" || s == "already" => StepOutcome::ok(),
        Ok(Value::String(s)) if s == "nocontrol" => StepOutcome::fail(format!(
            "no toggle control associated with label \"{}\"",
            spec.text()
        )),
        Ok(_) => StepOutcome::fail(format!("label not found: \"{}\"", spec.text())),
        Err(e) => client_err(e),
    }
}

/// Dismisses a modal. Without an explicit strategy, tries the close-button
/// scan first and falls back to Escape.
pub async fn close_modal(env: &ExecEnv, spec: &CloseModalSpec) -> StepOutcome {
    match spec.strategy() {
        Some(CloseStrategy::Button) => close_via_button(env).await,
        Some(CloseStrategy::Escape) => close_via_escape(env).await,
        Some(CloseStrategy::Backdrop) => close_via_backdrop(env).await,
        None => {
            let outcome = close_via_button(env).await;
            if outcome.success {
                outcome
            } else {
                close_via_escape(env).await
            }
        }
    }
}

async fn close_via_button(env: &ExecEnv) -> StepOutcome {
    let selectors: Vec<String> = CLOSE_BUTTON_SELECTORS.iter().map(|s| js_string(s)).collect();
    let script = format!(
        r#"(() => {{
  const selectors = [{}];
  for (const sel of selectors) {{
    const el = document.querySelector(sel);
    if (el) {{ el.click(); return 'clicked'; }}
  }}
  return 'notfound';
}})()"#,
        selectors.join(", ")
    );
    match env.client.evaluate(&script).await {
        Ok(Value::String(s)) if s == "clicked" => StepOutcome::ok(),
        Ok(_) => StepOutcome::fail("no close button found"),
        Err(e) => client_err(e),
    }
}

async fn close_via_escape(env: &ExecEnv) -> StepOutcome {
    match env.client.press_key("Escape", &[]).await {
        Ok(()) => StepOutcome::ok(),
        Err(e) => client_err(e),
    }
}

async fn close_via_backdrop(env: &ExecEnv) -> StepOutcome {
    let script = r#"(() => {
  const dialog = document.querySelector('[role=dialog]');
  if (dialog && dialog.parentElement) { dialog.parentElement.click(); return 'clicked'; }
  const backdrop = document.querySelector('.modal-backdrop');
  if (backdrop) { backdrop.click(); return 'clicked'; }
  return 'notfound';
})()"#;
    match env.client.evaluate(script).await {
        Ok(Value::String(s)) if s == "clicked" => StepOutcome::ok(),
        Ok(_) => StepOutcome::fail("no modal backdrop found"),
        Err(e) => client_err(e),
    }
}
