//! In-memory [`BrowserClient`] used by unit tests.
//!
//! Records every capability call, owns real evidence buffers, and
//! evaluates JS through a pluggable handler. The default handler
//! understands the small expression subset test documents lean on (JSON
//! literals, `===` / `!==`, `||` / `&&`, `!`, numeric `+`), which keeps
//! most tests free of custom eval closures; anything richer installs one
//! with [`FakeBrowser::set_eval`].

use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;

use super::BrowserClient;
use crate::evidence::{ConsoleBuffer, ConsoleMessage, MockRegistry, MockRule, NetworkBuffer, NetworkResponse};
use crate::protocol::DialogAction;

type EvalHandler = Box<dyn Fn(&str) -> Result<Value> + Send + Sync>;

pub struct FakeBrowser {
    calls: Mutex<Vec<String>>,
    console: ConsoleBuffer,
    network: NetworkBuffer,
    mocks: MockRegistry,
    eval_handler: Mutex<Option<EvalHandler>>,
    dom: Mutex<String>,
    /// When set, any call whose log entry starts with the prefix fails
    /// with the given message.
    fail_on: Mutex<Option<(String, String)>>,
}

impl Default for FakeBrowser {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBrowser {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            console: ConsoleBuffer::new(),
            network: NetworkBuffer::new(),
            mocks: MockRegistry::new(),
            eval_handler: Mutex::new(None),
            dom: Mutex::new("<html><body></body></html>".to_string()),
            fail_on: Mutex::new(None),
        }
    }

    /// Installs a custom evaluate handler. The handler sees the exact JS
    /// the engine would send over CDP.
    pub fn set_eval<F>(&self, handler: F)
    where
        F: Fn(&str) -> Result<Value> + Send + Sync + 'static,
    {
        *self.eval_handler.lock().expect("eval handler lock") = Some(Box::new(handler));
    }

    pub fn set_dom(&self, html: impl Into<String>) {
        *self.dom.lock().expect("dom lock") = html.into();
    }

    /// Makes every call whose recorded entry starts with `prefix` fail.
    pub fn fail_on(&self, prefix: impl Into<String>, message: impl Into<String>) {
        *self.fail_on.lock().expect("fail_on lock") = Some((prefix.into(), message.into()));
    }

    pub fn push_console(&self, level: &str, text: &str) {
        self.console.push(ConsoleMessage {
            level: level.to_string(),
            text: text.to_string(),
            timestamp: 0,
        });
    }

    pub fn push_network(&self, url: &str, method: &str, status: u16) {
        self.network.push(NetworkResponse {
            url: url.to_string(),
            method: method.to_string(),
            status,
            duration_ms: 1,
        });
    }

    pub fn mocks(&self) -> &MockRegistry {
        &self.mocks
    }

    /// Snapshot of every recorded capability call, oldest first.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("call log lock").clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn record(&self, entry: String) -> Result<()> {
        if let Some((prefix, message)) = self.fail_on.lock().expect("fail_on lock").as_ref() {
            if entry.starts_with(prefix.as_str()) {
                self.calls.lock().expect("call log lock").push(entry);
                return Err(anyhow!("{}", message));
            }
        }
        self.calls.lock().expect("call log lock").push(entry);
        Ok(())
    }
}

#[async_trait]
impl BrowserClient for FakeBrowser {
    async fn connect(&self) -> Result<()> {
        self.record("connect".to_string())
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        self.record(format!("navigate {}", url))
    }

    async fn evaluate(&self, js: &str) -> Result<Value> {
        self.record(format!("evaluate {}", js))?;
        if let Some(handler) = self.eval_handler.lock().expect("eval handler lock").as_ref() {
            return handler(js);
        }
        Ok(default_eval(js))
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<()> {
        self.record(format!("fill {} {}", selector, value))
    }

    async fn click(&self, selector: &str) -> Result<()> {
        self.record(format!("click {}", selector))
    }

    async fn select(&self, selector: &str, value: &str) -> Result<()> {
        self.record(format!("select {} {}", selector, value))
    }

    async fn press_key(&self, key: &str, modifiers: &[String]) -> Result<()> {
        if modifiers.is_empty() {
            self.record(format!("press_key {}", key))
        } else {
            self.record(format!("press_key {}+{}", modifiers.join("+"), key))
        }
    }

    async fn hover(&self, selector: &str) -> Result<()> {
        self.record(format!("hover {}", selector))
    }

    async fn switch_frame(&self, selector: Option<&str>) -> Result<()> {
        self.record(format!("switch_frame {}", selector.unwrap_or("<top>")))
    }

    async fn handle_dialog(&self, action: DialogAction, text: Option<&str>) -> Result<()> {
        let action = match action {
            DialogAction::Accept => "accept",
            DialogAction::Dismiss => "dismiss",
        };
        self.record(format!("handle_dialog {} {}", action, text.unwrap_or("")))
    }

    async fn get_console_messages(&self) -> Result<Vec<ConsoleMessage>> {
        self.record("get_console_messages".to_string())?;
        Ok(self.console.snapshot())
    }

    async fn get_network_responses(&self) -> Result<Vec<NetworkResponse>> {
        self.record("get_network_responses".to_string())?;
        Ok(self.network.snapshot())
    }

    async fn get_dom_snapshot(&self) -> Result<String> {
        self.record("get_dom_snapshot".to_string())?;
        Ok(self.dom.lock().expect("dom lock").clone())
    }

    async fn capture_screenshot(&self) -> Result<String> {
        self.record("capture_screenshot".to_string())?;
        Ok("iVBORw0KGgoAAAANSUhEUg==".to_string())
    }

    async fn add_mock_rule(&self, rule: MockRule) -> Result<()> {
        self.record(format!("add_mock_rule {} {}", rule.pattern, rule.status))?;
        self.mocks
            .register(rule)
            .map_err(|e| anyhow!("invalid mock pattern: {}", e))
    }

    async fn reset(&self) -> Result<()> {
        self.console.clear();
        self.network.clear();
        self.mocks.clear();
        self.record("reset".to_string())
    }

    async fn close(&self) -> Result<()> {
        self.record("close".to_string())
    }
}

// ============================================================================
// DEFAULT EXPRESSION EVALUATOR
// ============================================================================

/// Evaluates the expression subset used by test documents after
/// interpolation has replaced `$vars` / `$env` references with literals.
/// Anything it cannot read evaluates to `null`.
fn default_eval(js: &str) -> Value {
    eval_expr(js.trim().trim_end_matches(';').trim())
}

fn eval_expr(expr: &str) -> Value {
    if expr.contains("||") {
        return Value::Bool(expr.split("||").any(|part| truthy(&eval_expr(part.trim()))));
    }
    if expr.contains("&&") {
        return Value::Bool(expr.split("&&").all(|part| truthy(&eval_expr(part.trim()))));
    }
    if let Some((lhs, rhs)) = expr.split_once(" !== ") {
        return Value::Bool(literal(lhs.trim()) != literal(rhs.trim()));
    }
    if let Some((lhs, rhs)) = expr.split_once(" === ") {
        return Value::Bool(literal(lhs.trim()) == literal(rhs.trim()));
    }
    if let Some(rest) = expr.strip_prefix('!') {
        return Value::Bool(!truthy(&eval_expr(rest.trim())));
    }
    if let Some((lhs, rhs)) = expr.split_once('+') {
        if let (Some(a), Some(b)) = (number(lhs.trim()), number(rhs.trim())) {
            if a.fract() == 0.0 && b.fract() == 0.0 {
                return Value::from((a + b) as i64);
            }
            return Value::from(a + b);
        }
    }
    literal(expr)
}

/// Reads one literal: JSON first, then single-quoted strings. Unreadable
/// input becomes `null`, matching an undefined page expression.
fn literal(token: &str) -> Value {
    if let Ok(v) = serde_json::from_str::<Value>(token) {
        return v;
    }
    if token.len() >= 2 && token.starts_with('\'') && token.ends_with('\'') {
        return Value::String(token[1..token.len() - 1].to_string());
    }
    Value::Null
}

fn number(token: &str) -> Option<f64> {
    match literal(token) {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
