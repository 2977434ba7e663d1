// Module: Context
// Per-run state: variables, interpolation, nesting, deadline.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::{Map, Value};
use tokio::time::Instant;

use crate::protocol::{Section, Step, StepTrace};

static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$(env|vars)\.([A-Za-z_][A-Za-z0-9_]*)").expect("valid placeholder regex")
});

/// Expands `$env.NAME` and `$vars.NAME` placeholders inside a string.
///
/// Undefined references expand to the empty string; typos surface later as
/// assertion failures rather than interpolation errors. Pure text
/// substitution, depends only on its inputs.
pub fn interpolate(input: &str, env: &BTreeMap<String, String>, vars: &BTreeMap<String, Value>) -> String {
    PLACEHOLDER_RE
        .replace_all(input, |caps: &Captures<'_>| {
            let name = &caps[2];
            match &caps[1] {
                "env" => env.get(name).cloned().unwrap_or_default(),
                _ => vars.get(name).map(stringify).unwrap_or_default(),
            }
        })
        .into_owned()
}

/// Renders a variable value the way it reads inside a step string: bare
/// strings without quotes, everything else as JSON.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Walks a JSON value, substituting placeholders in every string leaf.
/// Object keys and non-string leaves pass through untouched.
pub fn interpolate_value(
    value: &Value,
    env: &BTreeMap<String, String>,
    vars: &BTreeMap<String, Value>,
) -> Value {
    match value {
        Value::String(s) => Value::String(interpolate(s, env, vars)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| interpolate_value(item, env, vars))
                .collect(),
        ),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), interpolate_value(v, env, vars));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

/// Engine-side state for one run.
///
/// `vars` is owned by the run and only touched from its sequential path;
/// the browser-side mirror (`window.__cdp_vars`) is synced explicitly after
/// each mutation. `visited` is the stack of in-progress nested test ids
/// used for cycle detection.
#[derive(Debug)]
pub struct RunContext {
    pub env: BTreeMap<String, String>,
    pub vars: BTreeMap<String, Value>,
    pub visited: Vec<String>,
    pub traces: Vec<StepTrace>,
    pub deadline: Instant,
    /// Configured whole-run timeout, kept for the deadline error message.
    pub timeout_ms: u64,
    /// Section currently executing. Control-flow handlers tag nested steps
    /// with it.
    pub section: Section,
}

impl RunContext {
    pub fn new(env: BTreeMap<String, String>, timeout_ms: u64) -> Self {
        Self {
            env,
            vars: BTreeMap::new(),
            visited: Vec::new(),
            traces: Vec::new(),
            deadline: Instant::now() + std::time::Duration::from_millis(timeout_ms),
            timeout_ms,
            section: Section::Steps,
        }
    }

    /// Binds a step result to a variable. Rebinding the same name
    /// overwrites; nothing is ever removed during a run.
    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    pub fn interpolate_str(&self, input: &str) -> String {
        interpolate(input, &self.env, &self.vars)
    }

    /// Applies interpolation structurally to a whole step: every string
    /// leaf of its serialised form is substituted, then the step is
    /// reparsed. The interpolator never learns the step grammar.
    pub fn interpolate_step(&self, step: &Step) -> Step {
        let raw = match serde_json::to_value(step) {
            Ok(v) => v,
            Err(_) => return step.clone(),
        };
        let expanded = interpolate_value(&raw, &self.env, &self.vars);
        serde_json::from_value(expanded).unwrap_or_else(|_| step.clone())
    }

    /// JS statement that refreshes the browser-side variable mirror.
    pub fn mirror_script(&self) -> String {
        let vars = serde_json::to_string(&self.vars).unwrap_or_else(|_| "{}".to_string());
        format!("window.__cdp_vars = {};", vars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env_of(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn vars_of(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_interpolates_env_and_vars() {
        let env = env_of(&[("HOST", "example.com")]);
        let vars = vars_of(&[("token", json!("abc123"))]);
        let out = interpolate("https://$env.HOST/?t=$vars.token", &env, &vars);
        assert_eq!(out, "https://example.com/?t=abc123");
    }

    #[test]
    fn test_undefined_reference_expands_to_empty() {
        let env = BTreeMap::new();
        let vars = BTreeMap::new();
        assert_eq!(interpolate("[$vars.missing]", &env, &vars), "[]");
        assert_eq!(interpolate("[$env.MISSING]", &env, &vars), "[]");
    }

    #[test]
    fn test_non_string_vars_render_as_json() {
        let env = BTreeMap::new();
        let vars = vars_of(&[("n", json!(42)), ("flag", json!(true)), ("obj", json!({"a": 1}))]);
        assert_eq!(interpolate("$vars.n", &env, &vars), "42");
        assert_eq!(interpolate("$vars.flag", &env, &vars), "true");
        assert_eq!(interpolate("$vars.obj", &env, &vars), r#"{"a":1}"#);
    }

    #[test]
    fn test_interpolation_is_pure() {
        let env = env_of(&[("A", "1")]);
        let vars = vars_of(&[("b", json!("2"))]);
        let before_env = env.clone();
        let before_vars = vars.clone();
        let _ = interpolate("$env.A $vars.b $env.A", &env, &vars);
        assert_eq!(env, before_env);
        assert_eq!(vars, before_vars);
    }

    #[test]
    fn test_name_charset_is_respected() {
        let env = env_of(&[("A_1", "x")]);
        let vars = BTreeMap::new();
        // The dash ends the placeholder name.
        assert_eq!(interpolate("$env.A_1-tail", &env, &vars), "x-tail");
    }

    #[test]
    fn test_structural_walk_only_touches_string_leaves() {
        let env = BTreeMap::new();
        let vars = vars_of(&[("sel", json!("#login"))]);
        let input = json!({
            "click": { "selector": "$vars.sel" },
            "count": 3,
            "nested": ["$vars.sel", 7, null]
        });
        let out = interpolate_value(&input, &env, &vars);
        assert_eq!(out["click"]["selector"], "#login");
        assert_eq!(out["count"], 3);
        assert_eq!(out["nested"][0], "#login");
        assert_eq!(out["nested"][1], 7);
    }

    #[test]
    fn test_interpolate_step_preserves_shape() {
        let mut ctx = RunContext::new(BTreeMap::new(), 30_000);
        ctx.bind("target", json!("#submit"));
        let step: Step =
            serde_json::from_value(json!({ "click": { "selector": "$vars.target" } })).unwrap();
        let expanded = ctx.interpolate_step(&step);
        match &expanded.op {
            crate::protocol::StepOp::Click(t) => assert_eq!(t.selector(), "#submit"),
            other => panic!("unexpected op: {:?}", other),
        }
    }

    #[test]
    fn test_bind_overwrites_existing_value() {
        let mut ctx = RunContext::new(BTreeMap::new(), 30_000);
        ctx.bind("x", json!(1));
        ctx.bind("x", json!(2));
        assert_eq!(ctx.vars.get("x"), Some(&json!(2)));
    }

    #[test]
    fn test_mirror_script_embeds_vars() {
        let mut ctx = RunContext::new(BTreeMap::new(), 30_000);
        ctx.bind("user", json!("ada"));
        let script = ctx.mirror_script();
        assert!(script.starts_with("window.__cdp_vars = "));
        assert!(script.contains(r#""user":"ada""#));
    }
}
