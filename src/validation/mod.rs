//! # Edit validator
//!
//! Pure validation over proposed edits to a test definition. The editor
//! (GUI or API client) submits a change against the current document and
//! gets back a list of findings; an empty list means the edit is safe to
//! apply. Both the document and the candidate step arrive as raw JSON so
//! malformed shapes can be reported instead of failing to parse.
//!
//! Rules:
//! - `mock_network_placement`: mocks belong in `before`, where they are
//!   registered ahead of the initial navigation.
//! - `variable_dependency_check`: removing or reordering a step must not
//!   strand a later `$vars` reference to its `as:` binding.
//! - `duplicate_step_warning`: adding a step identical to its neighbour is
//!   usually a double-click, so it warns.
//! - `index_bounds_check` / `move_bounds_check`: indices must land inside
//!   the section (`add` may append at `len`).
//! - `conditional_step_structure`: a bare `if` with no operation is inert.
//! - `loop_structure_check`: loops need non-empty `steps` and a
//!   terminating shape (`over`, or `while` with `max`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::{Section, OP_KEYS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// One validation finding. `rule` names the rule that produced it.
#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    pub severity: Severity,
    pub rule: &'static str,
    pub message: String,
}

impl Finding {
    fn error(rule: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            rule,
            message: message.into(),
        }
    }

    fn warning(rule: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            rule,
            message: message.into(),
        }
    }
}

/// A proposed edit to one section of a test definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum EditChange {
    Add {
        #[serde(default = "default_section")]
        section: Section,
        index: usize,
        step: Value,
    },
    Remove {
        #[serde(default = "default_section")]
        section: Section,
        index: usize,
    },
    Move {
        #[serde(default = "default_section")]
        section: Section,
        from: usize,
        to: usize,
    },
    Update {
        #[serde(default = "default_section")]
        section: Section,
        index: usize,
        step: Value,
    },
}

fn default_section() -> Section {
    Section::Steps
}

fn section_key(section: Section) -> &'static str {
    match section {
        Section::Before => "before",
        Section::Steps => "steps",
        Section::After => "after",
    }
}

fn section_steps(def: &Value, section: Section) -> Vec<Value> {
    def.get(section_key(section))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

/// Validates a proposed change against the current definition. An empty
/// result means no errors and no warnings.
pub fn validate_edit(def: &Value, change: &EditChange) -> Vec<Finding> {
    let mut findings = Vec::new();

    match change {
        EditChange::Add {
            section,
            index,
            step,
        } => {
            let steps = section_steps(def, *section);
            // Add allows appending at index == len.
            if *index > steps.len() {
                findings.push(Finding::error(
                    "index_bounds_check",
                    format!(
                        "add index {} is out of bounds for {} ({} steps)",
                        index,
                        section_key(*section),
                        steps.len()
                    ),
                ));
            }
            check_step_shape(step, *section, &mut findings);
            check_duplicate(&steps, *index, step, &mut findings);
        }
        EditChange::Remove { section, index } => {
            let steps = section_steps(def, *section);
            if *index >= steps.len() {
                findings.push(Finding::error(
                    "index_bounds_check",
                    format!(
                        "remove index {} is out of bounds for {} ({} steps)",
                        index,
                        section_key(*section),
                        steps.len()
                    ),
                ));
                return findings;
            }
            check_removed_binding(&steps, *index, &mut findings);
        }
        EditChange::Move { section, from, to } => {
            let steps = section_steps(def, *section);
            if *from >= steps.len() || *to >= steps.len() {
                findings.push(Finding::error(
                    "move_bounds_check",
                    format!(
                        "move {} -> {} is out of bounds for {} ({} steps)",
                        from,
                        to,
                        section_key(*section),
                        steps.len()
                    ),
                ));
                return findings;
            }
            check_moved_binding(&steps, *from, *to, &mut findings);
        }
        EditChange::Update {
            section,
            index,
            step,
        } => {
            let steps = section_steps(def, *section);
            if *index >= steps.len() {
                findings.push(Finding::error(
                    "index_bounds_check",
                    format!(
                        "update index {} is out of bounds for {} ({} steps)",
                        index,
                        section_key(*section),
                        steps.len()
                    ),
                ));
                return findings;
            }
            check_step_shape(step, *section, &mut findings);
            // Replacing a step drops its binding the same way removal does.
            if binding_of(&steps[*index]) != binding_of(step) {
                check_removed_binding(&steps, *index, &mut findings);
            }
        }
    }

    findings
}

/// Applies an in-bounds change, returning the edited definition. Used by
/// the control surface after a clean validation pass.
pub fn apply_edit(def: &Value, change: &EditChange) -> Value {
    let mut out = def.clone();
    let (section, mutate): (Section, Box<dyn FnOnce(&mut Vec<Value>)>) = match change.clone() {
        EditChange::Add { section, index, step } => (
            section,
            Box::new(move |steps| {
                steps.insert(index.min(steps.len()), step);
            }),
        ),
        EditChange::Remove { section, index } => (
            section,
            Box::new(move |steps| {
                if index < steps.len() {
                    steps.remove(index);
                }
            }),
        ),
        EditChange::Move { section, from, to } => (
            section,
            Box::new(move |steps| {
                if from < steps.len() && to < steps.len() {
                    let step = steps.remove(from);
                    steps.insert(to, step);
                }
            }),
        ),
        EditChange::Update { section, index, step } => (
            section,
            Box::new(move |steps| {
                if index < steps.len() {
                    steps[index] = step;
                }
            }),
        ),
    };

    let key = section_key(section);
    let mut steps = section_steps(&out, section);
    mutate(&mut steps);
    if let Some(obj) = out.as_object_mut() {
        obj.insert(key.to_string(), Value::Array(steps));
    }
    out
}

// ----------------------------------------------------------------------
// Rules
// ----------------------------------------------------------------------

fn operation_keys(step: &Value) -> Vec<&str> {
    let Some(obj) = step.as_object() else {
        return Vec::new();
    };
    OP_KEYS
        .iter()
        .copied()
        .filter(|k| obj.contains_key(*k))
        .collect()
}

fn binding_of(step: &Value) -> Option<String> {
    step.get("as").and_then(Value::as_str).map(str::to_string)
}

/// Does any string inside the step reference `$vars.<name>`?
fn references_var(step: &Value, name: &str) -> bool {
    match step {
        Value::String(s) => {
            let needle = format!("$vars.{}", name);
            // A following identifier character would make it a longer name.
            s.match_indices(&needle).any(|(i, _)| {
                let after = s[i + needle.len()..].chars().next();
                !matches!(after, Some(c) if c.is_ascii_alphanumeric() || c == '_')
            })
        }
        Value::Array(items) => items.iter().any(|v| references_var(v, name)),
        Value::Object(map) => map.values().any(|v| references_var(v, name)),
        _ => false,
    }
}

fn check_step_shape(step: &Value, section: Section, findings: &mut Vec<Finding>) {
    let ops = operation_keys(step);

    if ops.is_empty() {
        if step.get("if").is_some() {
            findings.push(Finding::error(
                "conditional_step_structure",
                "step has an 'if' condition but no operation to guard",
            ));
        } else {
            findings.push(Finding::error(
                "conditional_step_structure",
                "step has no operation field",
            ));
        }
        return;
    }
    if ops.len() > 1 {
        findings.push(Finding::error(
            "conditional_step_structure",
            format!("step has multiple operation fields: {}", ops.join(", ")),
        ));
        return;
    }

    if ops[0] == "mock_network" && section != Section::Before {
        findings.push(Finding::error(
            "mock_network_placement",
            "mock_network steps must be placed in the before section so rules are active for the initial navigation",
        ));
    }

    if ops[0] == "loop" {
        check_loop_shape(step.get("loop"), findings);
    }
}

fn check_loop_shape(payload: Option<&Value>, findings: &mut Vec<Finding>) {
    let Some(payload) = payload.and_then(Value::as_object) else {
        findings.push(Finding::error(
            "loop_structure_check",
            "loop payload must be an object",
        ));
        return;
    };
    let inner = payload.get("steps").and_then(Value::as_array);
    if inner.map(|s| s.is_empty()).unwrap_or(true) {
        findings.push(Finding::error(
            "loop_structure_check",
            "loop requires a non-empty 'steps' array",
        ));
    }
    let has_over = payload.contains_key("over");
    let has_while = payload.contains_key("while");
    let has_max = payload.contains_key("max");
    if !has_over && !has_while {
        findings.push(Finding::error(
            "loop_structure_check",
            "loop requires 'over' or 'while'",
        ));
    }
    if has_while && !has_max {
        findings.push(Finding::error(
            "loop_structure_check",
            "'while' loops require 'max' to bound iteration",
        ));
    }
}

fn check_duplicate(steps: &[Value], index: usize, step: &Value, findings: &mut Vec<Finding>) {
    let neighbours = [index.checked_sub(1), (index < steps.len()).then_some(index)];
    for neighbour in neighbours.into_iter().flatten() {
        if steps.get(neighbour) == Some(step) {
            findings.push(Finding::warning(
                "duplicate_step_warning",
                format!("added step is identical to the step at index {}", neighbour),
            ));
            return;
        }
    }
}

fn check_removed_binding(steps: &[Value], index: usize, findings: &mut Vec<Finding>) {
    let Some(bind) = binding_of(&steps[index]) else {
        return;
    };
    for (j, later) in steps.iter().enumerate().skip(index + 1) {
        if references_var(later, &bind) {
            findings.push(Finding::error(
                "variable_dependency_check",
                format!(
                    "step {} references $vars.{} which is bound by the step being removed",
                    j, bind
                ),
            ));
            return;
        }
    }
}

fn check_moved_binding(steps: &[Value], from: usize, to: usize, findings: &mut Vec<Finding>) {
    // Moving a binder later: steps that slide in front of it lose the
    // binding.
    if to > from {
        if let Some(bind) = binding_of(&steps[from]) {
            for (j, step) in steps.iter().enumerate().take(to + 1).skip(from + 1) {
                if references_var(step, &bind) {
                    findings.push(Finding::error(
                        "variable_dependency_check",
                        format!(
                            "moving this step after step {} strands its $vars.{} reference",
                            j, bind
                        ),
                    ));
                    return;
                }
            }
        }
    }

    // Moving a referencing step earlier: it may now precede its binder.
    if to < from {
        for (k, binder) in steps.iter().enumerate().take(from).skip(to) {
            if let Some(bind) = binding_of(binder) {
                if references_var(&steps[from], &bind) {
                    findings.push(Finding::error(
                        "variable_dependency_check",
                        format!(
                            "moving this step before step {} strands its $vars.{} reference",
                            k, bind
                        ),
                    ));
                    return;
                }
            }
        }
    }
}
