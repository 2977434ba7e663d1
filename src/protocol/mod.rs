//! # Test definition protocol
//!
//! Data structures for the declarative test documents the engine executes.
//! A test is a target URL plus ordered `before` / `steps` / `after`
//! sections; every step is a single operation with a shared envelope of
//! optional fields.
//!
//! ## Shape of a test document
//!
//! ```json
//! {
//!   "url": "http://localhost:3000",
//!   "env": { "ADMIN_EMAIL": "admin@test.com" },
//!   "inputs": [ { "name": "count", "type": "number", "default": 3 } ],
//!   "before": [ { "mock_network": { "match": "**/api/users", "status": 200 } } ],
//!   "steps": [
//!     { "eval": "1+1", "as": "r" },
//!     { "assert": "$vars.r === 2", "label": "Sanity" }
//!   ],
//!   "after": [ { "eval": "window.__teardown()" } ],
//!   "timeout": 30000
//! }
//! ```
//!
//! On the wire a step is a flat JSON object: exactly one *operation* key
//! (`eval`, `click`, `loop`, ...) plus the shared envelope keys (`label`,
//! `if`, `as`, `capture_dom`, `comment`) and op-specific siblings such as
//! `retry`. Deserialisation normalises that schemaless shape into the
//! closed [`StepOp`] sum so dispatch is an exhaustive match, not a chain of
//! "which field is present" probes.

use serde::de::Error as DeError;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// TEST DEFINITION
// ============================================================================

/// Whole-run timeout applied when the document does not set one.
pub const DEFAULT_RUN_TIMEOUT_MS: u64 = 30_000;

/// A parsed test document. Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TestDefinition {
    /// Target URL, navigated to after the `before` section.
    #[serde(default)]
    pub url: String,

    /// Static values exposed as `$env.KEY` inside step strings.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Runtime inputs. Values supplied at run start seed `$vars.<name>`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<InputDef>,

    /// Setup steps. Mock rules are registered here so they are active for
    /// the initial navigation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub before: Vec<Step>,

    /// The main step sequence.
    #[serde(default)]
    pub steps: Vec<Step>,

    /// Cleanup steps. Always executed, even when the run fails.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<Step>,

    /// Whole-run deadline in milliseconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Optional index into `steps` to resume from. Earlier indices are
    /// recorded as skipped traces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_from: Option<usize>,
}

fn default_timeout() -> u64 {
    DEFAULT_RUN_TIMEOUT_MS
}

/// Declares one runtime input of a test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputDef {
    /// Variable name the supplied value is bound to.
    pub name: String,

    /// Human-readable label for prompts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// Declared value type. Supplied values are coerced to this.
    #[serde(rename = "type", default)]
    pub input_type: InputType,

    /// Fallback used when no value is supplied at run start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    /// When true, a run without a value for this input is refused.
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    #[default]
    Text,
    Number,
    Boolean,
}

// ============================================================================
// STEP ENVELOPE + OPERATIONS
// ============================================================================

/// A single declarative instruction.
///
/// The envelope fields are shared by every operation; the payload is the
/// closed [`StepOp`] sum.
#[derive(Debug, Clone, Default)]
pub struct Step {
    /// Display label, shown in traces and events.
    pub label: Option<String>,

    /// Conditional guard expression. Falsy result skips the step.
    pub guard: Option<String>,

    /// Variable name the step result is bound to.
    pub bind: Option<String>,

    /// When true, the step trace carries a DOM snapshot. Never affects the
    /// verdict.
    pub capture_dom: bool,

    /// Free-form author note. Carried through, never executed.
    pub comment: Option<String>,

    /// The operation payload.
    pub op: StepOp,
}

impl Step {
    /// Builds a step around an operation with an empty envelope.
    pub fn of(op: StepOp) -> Self {
        Self {
            op,
            ..Self::default()
        }
    }

    /// Operation discriminator name, e.g. `"eval"` or `"loop"`.
    pub fn kind(&self) -> &'static str {
        self.op.kind()
    }
}

/// Selects how `text` is compared against page content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    #[default]
    Contains,
    Exact,
    Regex,
}

/// Retry block for `assert` / `assert_text`. The expression is re-evaluated
/// every `interval` until truthy or until `timeout` elapses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySpec {
    #[serde(default = "default_retry_interval")]
    pub interval: u64,
    #[serde(default = "default_retry_timeout")]
    pub timeout: u64,
}

fn default_retry_interval() -> u64 {
    200
}

fn default_retry_timeout() -> u64 {
    5_000
}

/// Selector argument accepted either as a bare string or `{ "selector": .. }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Target {
    Selector(String),
    Spec { selector: String },
}

impl Target {
    pub fn selector(&self) -> &str {
        match self {
            Target::Selector(s) => s,
            Target::Spec { selector } => selector,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillSpec {
    pub selector: String,
    pub value: String,
}

/// `fill_form` accepts `{ "fields": [...] }` or a bare field array.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FormSpec {
    Fields { fields: Vec<FillSpec> },
    Bare(Vec<FillSpec>),
}

impl FormSpec {
    pub fn fields(&self) -> &[FillSpec] {
        match self {
            FormSpec::Fields { fields } => fields,
            FormSpec::Bare(fields) => fields,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeSpec {
    pub selector: String,
    pub text: String,
    /// Milliseconds between characters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
    /// Clear the field before typing.
    #[serde(default)]
    pub clear: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectSpec {
    pub selector: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeySpec {
    Key(String),
    Detailed {
        key: String,
        #[serde(default)]
        modifiers: Vec<String>,
    },
}

impl KeySpec {
    pub fn key(&self) -> &str {
        match self {
            KeySpec::Key(k) => k,
            KeySpec::Detailed { key, .. } => key,
        }
    }

    pub fn modifiers(&self) -> &[String] {
        match self {
            KeySpec::Key(_) => &[],
            KeySpec::Detailed { modifiers, .. } => modifiers,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialogAction {
    Accept,
    Dismiss,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogSpec {
    pub action: DialogAction,
    /// Prompt text entered before accepting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// `wait_for` accepts a bare selector or `{ selector, timeout }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WaitForSpec {
    Selector(String),
    Spec {
        selector: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout: Option<u64>,
    },
}

impl WaitForSpec {
    pub fn selector(&self) -> &str {
        match self {
            WaitForSpec::Selector(s) => s,
            WaitForSpec::Spec { selector, .. } => selector,
        }
    }

    pub fn timeout(&self) -> Option<u64> {
        match self {
            WaitForSpec::Selector(_) => None,
            WaitForSpec::Spec { timeout, .. } => *timeout,
        }
    }
}

/// Text probe shared by `wait_for_text` / `wait_for_text_gone`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TextProbe {
    Text(String),
    Spec {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selector: Option<String>,
        #[serde(rename = "match", default)]
        match_mode: MatchMode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout: Option<u64>,
    },
}

impl TextProbe {
    pub fn text(&self) -> &str {
        match self {
            TextProbe::Text(t) => t,
            TextProbe::Spec { text, .. } => text,
        }
    }

    pub fn selector(&self) -> Option<&str> {
        match self {
            TextProbe::Text(_) => None,
            TextProbe::Spec { selector, .. } => selector.as_deref(),
        }
    }

    pub fn match_mode(&self) -> MatchMode {
        match self {
            TextProbe::Text(_) => MatchMode::Contains,
            TextProbe::Spec { match_mode, .. } => *match_mode,
        }
    }

    pub fn timeout(&self) -> Option<u64> {
        match self {
            TextProbe::Text(_) => None,
            TextProbe::Spec { timeout, .. } => *timeout,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssertTextSpec {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(rename = "match", default)]
    pub match_mode: MatchMode,
    /// Inverts the check: pass when the text is NOT present.
    #[serde(default)]
    pub absent: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClickTextSpec {
    Text(String),
    Spec {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selector: Option<String>,
        #[serde(rename = "match", default)]
        match_mode: MatchMode,
    },
}

impl ClickTextSpec {
    pub fn text(&self) -> &str {
        match self {
            ClickTextSpec::Text(t) => t,
            ClickTextSpec::Spec { text, .. } => text,
        }
    }

    pub fn selector(&self) -> Option<&str> {
        match self {
            ClickTextSpec::Text(_) => None,
            ClickTextSpec::Spec { selector, .. } => selector.as_deref(),
        }
    }

    pub fn match_mode(&self) -> MatchMode {
        match self {
            ClickTextSpec::Text(_) => MatchMode::Contains,
            ClickTextSpec::Spec { match_mode, .. } => *match_mode,
        }
    }
}

/// `click_nth` scans like `click_text` but clicks the `index`-th match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClickNthSpec {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(rename = "match", default)]
    pub match_mode: MatchMode,
    pub index: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropdownSpec {
    pub selector: String,
    pub text: String,
    #[serde(rename = "match", default)]
    pub match_mode: MatchMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExpandMenuSpec {
    Group(String),
    Spec { group: String },
}

impl ExpandMenuSpec {
    pub fn group(&self) -> &str {
        match self {
            ExpandMenuSpec::Group(g) => g,
            ExpandMenuSpec::Spec { group } => group,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToggleSpec {
    Text(String),
    Spec {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<bool>,
    },
}

impl ToggleSpec {
    pub fn text(&self) -> &str {
        match self {
            ToggleSpec::Text(t) => t,
            ToggleSpec::Spec { text, .. } => text,
        }
    }

    pub fn state(&self) -> Option<bool> {
        match self {
            ToggleSpec::Text(_) => None,
            ToggleSpec::Spec { state, .. } => *state,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloseStrategy {
    Button,
    Escape,
    Backdrop,
}

/// `close_modal` accepts `true`, a bare strategy string, or `{ strategy }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CloseModalSpec {
    Strategy(CloseStrategy),
    Any(bool),
    Spec {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        strategy: Option<CloseStrategy>,
    },
}

impl CloseModalSpec {
    pub fn strategy(&self) -> Option<CloseStrategy> {
        match self {
            CloseModalSpec::Any(_) => None,
            CloseModalSpec::Strategy(s) => Some(*s),
            CloseModalSpec::Spec { strategy } => *strategy,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConsoleCheckSpec {
    Levels(Vec<String>),
    Spec { levels: Vec<String> },
}

impl ConsoleCheckSpec {
    pub fn levels(&self) -> &[String] {
        match self {
            ConsoleCheckSpec::Levels(l) => l,
            ConsoleCheckSpec::Spec { levels } => levels,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockRuleSpec {
    /// Glob over request URLs. First registered rule matching a URL wins.
    #[serde(rename = "match")]
    pub pattern: String,
    pub status: u16,
    /// Canned body. Non-string values are JSON-encoded on the wire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    /// Artificial response delay in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRequestSpec {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub query_params: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopSpec {
    /// Expression yielding the array to iterate. Mutually exclusive with
    /// `while`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub over: Option<String>,

    /// Condition re-evaluated before every iteration. Requires `max`.
    #[serde(rename = "while", default, skip_serializing_if = "Option::is_none")]
    pub while_expr: Option<String>,

    /// Iteration cap. Mandatory in `while` mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<u64>,

    /// Variable the loop counter is bound to. Defaults to `index`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_as: Option<String>,

    /// Steps executed once per iteration.
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunTestSpec {
    Id(String),
    Spec { id: String },
}

impl RunTestSpec {
    pub fn id(&self) -> &str {
        match self {
            RunTestSpec::Id(id) => id,
            RunTestSpec::Spec { id } => id,
        }
    }
}

/// `wait` accepts a bare millisecond count or `{ "ms": .. }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WaitSpec {
    Millis(u64),
    Spec { ms: u64 },
}

impl WaitSpec {
    pub fn millis(&self) -> u64 {
        match self {
            WaitSpec::Millis(ms) => *ms,
            WaitSpec::Spec { ms } => *ms,
        }
    }
}

/// The closed sum of step operations.
#[derive(Debug, Clone)]
pub enum StepOp {
    Eval(String),
    Fill(FillSpec),
    ClearInput(Target),
    FillForm(FormSpec),
    Type(TypeSpec),
    ScanInput(FillSpec),
    Click(Target),
    Hover(Target),
    Select(SelectSpec),
    PressKey(KeySpec),
    SwitchFrame(Option<Target>),
    HandleDialog(DialogSpec),
    Screenshot,
    ScrollTo(Target),
    Wait(WaitSpec),
    WaitFor(WaitForSpec),
    WaitForText(TextProbe),
    WaitForTextGone(TextProbe),
    Assert {
        expr: String,
        retry: Option<RetrySpec>,
    },
    AssertText {
        spec: AssertTextSpec,
        retry: Option<RetrySpec>,
    },
    ClickText(ClickTextSpec),
    ClickNth(ClickNthSpec),
    ChooseDropdown(DropdownSpec),
    ExpandMenu(ExpandMenuSpec),
    Toggle(ToggleSpec),
    CloseModal(CloseModalSpec),
    ConsoleCheck(ConsoleCheckSpec),
    NetworkCheck(bool),
    MockNetwork(MockRuleSpec),
    HttpRequest(HttpRequestSpec),
    Loop(LoopSpec),
    RunTest(RunTestSpec),
}

impl Default for StepOp {
    fn default() -> Self {
        StepOp::Eval(String::new())
    }
}

/// Operation discriminators. Deserialisation rejects a step carrying zero
/// or more than one of these keys.
pub const OP_KEYS: &[&str] = &[
    "eval",
    "fill",
    "clear_input",
    "fill_form",
    "type",
    "scan_input",
    "click",
    "hover",
    "select",
    "press_key",
    "switch_frame",
    "handle_dialog",
    "screenshot",
    "scroll_to",
    "wait",
    "wait_for",
    "wait_for_text",
    "wait_for_text_gone",
    "assert",
    "assert_text",
    "click_text",
    "click_nth",
    "choose_dropdown",
    "expand_menu",
    "toggle",
    "close_modal",
    "console_check",
    "network_check",
    "mock_network",
    "http_request",
    "loop",
    "run_test",
];

impl StepOp {
    pub fn kind(&self) -> &'static str {
        match self {
            StepOp::Eval(_) => "eval",
            StepOp::Fill(_) => "fill",
            StepOp::ClearInput(_) => "clear_input",
            StepOp::FillForm(_) => "fill_form",
            StepOp::Type(_) => "type",
            StepOp::ScanInput(_) => "scan_input",
            StepOp::Click(_) => "click",
            StepOp::Hover(_) => "hover",
            StepOp::Select(_) => "select",
            StepOp::PressKey(_) => "press_key",
            StepOp::SwitchFrame(_) => "switch_frame",
            StepOp::HandleDialog(_) => "handle_dialog",
            StepOp::Screenshot => "screenshot",
            StepOp::ScrollTo(_) => "scroll_to",
            StepOp::Wait(_) => "wait",
            StepOp::WaitFor(_) => "wait_for",
            StepOp::WaitForText(_) => "wait_for_text",
            StepOp::WaitForTextGone(_) => "wait_for_text_gone",
            StepOp::Assert { .. } => "assert",
            StepOp::AssertText { .. } => "assert_text",
            StepOp::ClickText(_) => "click_text",
            StepOp::ClickNth(_) => "click_nth",
            StepOp::ChooseDropdown(_) => "choose_dropdown",
            StepOp::ExpandMenu(_) => "expand_menu",
            StepOp::Toggle(_) => "toggle",
            StepOp::CloseModal(_) => "close_modal",
            StepOp::ConsoleCheck(_) => "console_check",
            StepOp::NetworkCheck(_) => "network_check",
            StepOp::MockNetwork(_) => "mock_network",
            StepOp::HttpRequest(_) => "http_request",
            StepOp::Loop(_) => "loop",
            StepOp::RunTest(_) => "run_test",
        }
    }

    fn from_parts(key: &str, payload: Value, siblings: &Map<String, Value>) -> Result<Self, String> {
        fn from_value<T: serde::de::DeserializeOwned>(key: &str, v: Value) -> Result<T, String> {
            serde_json::from_value(v).map_err(|e| format!("invalid '{}' payload: {}", key, e))
        }

        let retry = |siblings: &Map<String, Value>| -> Result<Option<RetrySpec>, String> {
            match siblings.get("retry") {
                Some(v) => Ok(Some(from_value("retry", v.clone())?)),
                None => Ok(None),
            }
        };

        let op = match key {
            "eval" => StepOp::Eval(from_value(key, payload)?),
            "fill" => StepOp::Fill(from_value(key, payload)?),
            "clear_input" => StepOp::ClearInput(from_value(key, payload)?),
            "fill_form" => StepOp::FillForm(from_value(key, payload)?),
            "type" => StepOp::Type(from_value(key, payload)?),
            "scan_input" => StepOp::ScanInput(from_value(key, payload)?),
            "click" => StepOp::Click(from_value(key, payload)?),
            "hover" => StepOp::Hover(from_value(key, payload)?),
            "select" => StepOp::Select(from_value(key, payload)?),
            "press_key" => StepOp::PressKey(from_value(key, payload)?),
            "switch_frame" => match payload {
                Value::Null => StepOp::SwitchFrame(None),
                other => StepOp::SwitchFrame(Some(from_value(key, other)?)),
            },
            "handle_dialog" => StepOp::HandleDialog(from_value(key, payload)?),
            "screenshot" => StepOp::Screenshot,
            "scroll_to" => StepOp::ScrollTo(from_value(key, payload)?),
            "wait" => StepOp::Wait(from_value(key, payload)?),
            "wait_for" => StepOp::WaitFor(from_value(key, payload)?),
            "wait_for_text" => StepOp::WaitForText(from_value(key, payload)?),
            "wait_for_text_gone" => StepOp::WaitForTextGone(from_value(key, payload)?),
            "assert" => StepOp::Assert {
                expr: from_value(key, payload)?,
                retry: retry(siblings)?,
            },
            "assert_text" => {
                let spec = match payload {
                    Value::String(text) => AssertTextSpec {
                        text,
                        selector: None,
                        match_mode: MatchMode::Contains,
                        absent: false,
                    },
                    other => from_value(key, other)?,
                };
                StepOp::AssertText {
                    spec,
                    retry: retry(siblings)?,
                }
            }
            "click_text" => StepOp::ClickText(from_value(key, payload)?),
            "click_nth" => StepOp::ClickNth(from_value(key, payload)?),
            "choose_dropdown" => StepOp::ChooseDropdown(from_value(key, payload)?),
            "expand_menu" => StepOp::ExpandMenu(from_value(key, payload)?),
            "toggle" => StepOp::Toggle(from_value(key, payload)?),
            "close_modal" => StepOp::CloseModal(from_value(key, payload)?),
            "console_check" => StepOp::ConsoleCheck(from_value(key, payload)?),
            "network_check" => StepOp::NetworkCheck(from_value(key, payload)?),
            "mock_network" => StepOp::MockNetwork(from_value(key, payload)?),
            "http_request" => StepOp::HttpRequest(from_value(key, payload)?),
            "loop" => StepOp::Loop(from_value(key, payload)?),
            "run_test" => StepOp::RunTest(from_value(key, payload)?),
            other => return Err(format!("unknown operation '{}'", other)),
        };
        Ok(op)
    }

    /// The operation payload as a JSON value, for re-serialisation.
    fn payload_value(&self) -> Value {
        fn to_value<T: Serialize>(v: &T) -> Value {
            serde_json::to_value(v).unwrap_or(Value::Null)
        }
        match self {
            StepOp::Eval(expr) => Value::String(expr.clone()),
            StepOp::Fill(s) => to_value(s),
            StepOp::ClearInput(s) => to_value(s),
            StepOp::FillForm(s) => to_value(s),
            StepOp::Type(s) => to_value(s),
            StepOp::ScanInput(s) => to_value(s),
            StepOp::Click(s) => to_value(s),
            StepOp::Hover(s) => to_value(s),
            StepOp::Select(s) => to_value(s),
            StepOp::PressKey(s) => to_value(s),
            StepOp::SwitchFrame(s) => to_value(s),
            StepOp::HandleDialog(s) => to_value(s),
            StepOp::Screenshot => Value::Bool(true),
            StepOp::ScrollTo(s) => to_value(s),
            StepOp::Wait(s) => to_value(s),
            StepOp::WaitFor(s) => to_value(s),
            StepOp::WaitForText(s) => to_value(s),
            StepOp::WaitForTextGone(s) => to_value(s),
            StepOp::Assert { expr, .. } => Value::String(expr.clone()),
            StepOp::AssertText { spec, .. } => to_value(spec),
            StepOp::ClickText(s) => to_value(s),
            StepOp::ClickNth(s) => to_value(s),
            StepOp::ChooseDropdown(s) => to_value(s),
            StepOp::ExpandMenu(s) => to_value(s),
            StepOp::Toggle(s) => to_value(s),
            StepOp::CloseModal(s) => to_value(s),
            StepOp::ConsoleCheck(s) => to_value(s),
            StepOp::NetworkCheck(b) => Value::Bool(*b),
            StepOp::MockNetwork(s) => to_value(s),
            StepOp::HttpRequest(s) => to_value(s),
            StepOp::Loop(s) => to_value(s),
            StepOp::RunTest(s) => to_value(s),
        }
    }

    /// Retry block, for ops that carry one as a sibling key.
    fn retry_sibling(&self) -> Option<&RetrySpec> {
        match self {
            StepOp::Assert { retry, .. } | StepOp::AssertText { retry, .. } => retry.as_ref(),
            _ => None,
        }
    }
}

impl<'de> Deserialize<'de> for Step {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let map = Map::deserialize(deserializer)?;

        let mut ops = OP_KEYS.iter().copied().filter(|k| map.contains_key(*k));
        let op_key = match (ops.next(), ops.next()) {
            (Some(k), None) => k,
            (None, _) => {
                return Err(D::Error::custom(
                    "step has no operation field (expected one of eval, click, assert, ...)",
                ))
            }
            (Some(a), Some(b)) => {
                return Err(D::Error::custom(format!(
                    "step has multiple operation fields: '{}' and '{}'",
                    a, b
                )))
            }
        };

        let payload = map.get(op_key).cloned().unwrap_or(Value::Null);
        let op = StepOp::from_parts(op_key, payload, &map).map_err(D::Error::custom)?;

        let str_field = |name: &str| {
            map.get(name)
                .and_then(Value::as_str)
                .map(|s| s.to_string())
        };

        Ok(Step {
            label: str_field("label"),
            guard: str_field("if"),
            bind: str_field("as"),
            capture_dom: map
                .get("capture_dom")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            comment: str_field("comment"),
            op,
        })
    }
}

impl Serialize for Step {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut entries: Vec<(&str, Value)> = Vec::new();
        entries.push((self.op.kind(), self.op.payload_value()));
        if let Some(retry) = self.op.retry_sibling() {
            entries.push(("retry", serde_json::to_value(retry).unwrap_or(Value::Null)));
        }
        if let Some(label) = &self.label {
            entries.push(("label", Value::String(label.clone())));
        }
        if let Some(guard) = &self.guard {
            entries.push(("if", Value::String(guard.clone())));
        }
        if let Some(bind) = &self.bind {
            entries.push(("as", Value::String(bind.clone())));
        }
        if self.capture_dom {
            entries.push(("capture_dom", Value::Bool(true)));
        }
        if let Some(comment) = &self.comment {
            entries.push(("comment", Value::String(comment.clone())));
        }

        let mut out = serializer.serialize_map(Some(entries.len()))?;
        for (k, v) in entries {
            out.serialize_entry(k, &v)?;
        }
        out.end()
    }
}

// ============================================================================
// SAVED TESTS & RUNS
// ============================================================================

/// A test definition persisted in the project store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedTest {
    /// Slug id. Matches the on-disk filename; unique within a project.
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub definition: TestDefinition,
    pub created_at: String,
    pub updated_at: String,
}

/// Which section a step belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Section {
    Before,
    Steps,
    After,
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Section::Before => write!(f, "before"),
            Section::Steps => write!(f, "steps"),
            Section::After => write!(f, "after"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Passed,
    Failed,
    Skipped,
}

/// Per-step record of what happened, including captured evidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTrace {
    pub step_index: usize,
    pub section: Section,
    pub step_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub status: StepStatus,
    /// Wall-clock start, milliseconds since the Unix epoch.
    pub start_time_ms: u64,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dom_snapshot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console_messages: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_requests: Option<Vec<Value>>,
}

/// One level of the loop breadcrumb attached to failures inside loops.
/// Ordered outermost first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopContextEntry {
    pub iteration: u64,
    pub step: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Final verdict of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TestResult {
    Passed {
        steps_completed: usize,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step_traces: Option<Vec<StepTrace>>,
    },
    Failed {
        failed_step: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failed_label: Option<String>,
        /// The failing step, echoed verbatim.
        step_definition: Step,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        loop_context: Option<Vec<LoopContextEntry>>,
        #[serde(default)]
        console_errors: Vec<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dom_snapshot: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        screenshot: Option<String>,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step_traces: Option<Vec<StepTrace>>,
    },
}

impl TestResult {
    pub fn passed(&self) -> bool {
        matches!(self, TestResult::Passed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Passed,
    Failed,
    Running,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Passed => write!(f, "passed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Running => write!(f, "running"),
        }
    }
}

/// A persisted run record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRun {
    pub id: String,
    pub test_id: String,
    pub status: RunStatus,
    pub result: TestResult,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

// ============================================================================
// TESTS
// ============================================================================
