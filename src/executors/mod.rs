// Module: Executors
// One handler per step kind, plus the per-step drive pipeline shared by
// the orchestrator and the control-flow handlers that recurse into it.

pub mod assert;
pub mod flow;
pub mod http;
pub mod page;
pub mod wait;
pub mod widgets;

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, warn};

use crate::browser::BrowserClient;
use crate::context::RunContext;
use crate::debug::DebugGate;
use crate::errors::RunError;
use crate::events::{EventBus, RunEvent};
use crate::protocol::{
    LoopContextEntry, Section, Step, StepOp, StepStatus, StepTrace,
};
use crate::store::TestStore;

/// What a handler reports back to the pipeline.
#[derive(Debug, Default)]
pub struct StepOutcome {
    pub success: bool,
    pub error: Option<String>,
    /// Result to bind when the step carries `as:`.
    pub value: Option<Value>,
    pub skipped: bool,
    /// Loop breadcrumb, outermost first. Only set by `loop`.
    pub loop_context: Option<Vec<LoopContextEntry>>,
    /// True when a nested step was stopped or timed out; the failure is a
    /// run abort, not a plain step failure.
    pub stopped: bool,
}

impl StepOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn ok_with(value: Value) -> Self {
        Self {
            success: true,
            value: Some(value),
            ..Self::default()
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Everything a handler may need besides the run context. Cheap to clone;
/// shared by the orchestrator and recursive control flow.
#[derive(Clone)]
pub struct ExecEnv {
    pub client: Arc<dyn BrowserClient>,
    /// Store used by `run_test` to resolve nested tests. Absent in bare
    /// engine tests, where `run_test` fails with an unknown-test error.
    pub store: Option<Arc<TestStore>>,
    pub bus: EventBus,
    pub gate: Arc<DebugGate>,
    pub http: reqwest::Client,
}

/// A failed (or aborted) step, with everything the verdict needs.
#[derive(Debug)]
pub struct StepFailure {
    pub section: Section,
    pub index: usize,
    pub label: Option<String>,
    /// The step as written, echoed into the failure record.
    pub step: Step,
    pub error: String,
    pub loop_context: Option<Vec<LoopContextEntry>>,
    /// Evidence captured at failure time.
    pub console_errors: Vec<Value>,
    pub dom_snapshot: Option<String>,
    pub screenshot: Option<String>,
    /// True when the run was stopped or timed out rather than the step
    /// itself failing.
    pub stopped: bool,
}

/// Runs one step through the full pipeline: debug gate, conditional guard,
/// interpolation, dispatch, result binding, trace and event emission.
///
/// Boxed so `loop` and `run_test` can recurse through it.
pub fn drive_step<'a>(
    env: &'a ExecEnv,
    ctx: &'a mut RunContext,
    step: &'a Step,
    section: Section,
    index: usize,
) -> BoxFuture<'a, Result<(), StepFailure>> {
    Box::pin(async move {
        let deadline = (section != Section::After).then_some(ctx.deadline);
        if let Err(e) = env.gate.pass(index, deadline, ctx.timeout_ms).await {
            return Err(aborted(env, section, index, step, e).await);
        }

        let started = tokio::time::Instant::now();
        let start_time_ms = chrono::Utc::now().timestamp_millis() as u64;
        env.bus.emit(RunEvent::StepStart {
            step_index: index,
            section,
            label: step.label.clone(),
        });

        // Conditional guard: falsy skips the step body and the binding.
        if let Some(guard) = &step.guard {
            let expr = ctx.interpolate_str(guard);
            match env.client.evaluate(&expr).await {
                Ok(value) if !truthy(&value) => {
                    let duration_ms = started.elapsed().as_millis() as u64;
                    ctx.traces.push(StepTrace {
                        step_index: index,
                        section,
                        step_type: step.kind().to_string(),
                        label: step.label.clone(),
                        status: StepStatus::Skipped,
                        start_time_ms,
                        duration_ms,
                        error: None,
                        result: None,
                        dom_snapshot: None,
                        screenshot: None,
                        console_messages: None,
                        network_requests: None,
                    });
                    env.bus.emit(RunEvent::StepPass {
                        step_index: index,
                        section,
                        duration_ms,
                        skipped: true,
                    });
                    debug!(step = step.kind(), index, "guard falsy, step skipped");
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => {
                    let outcome = StepOutcome::fail(format!("condition failed: {}", e));
                    return finish(env, ctx, step, section, index, started, start_time_ms, outcome)
                        .await;
                }
            }
        }

        // Control-flow ops interpolate lazily: their nested steps and
        // condition expressions must see per-iteration variable state, not
        // a snapshot taken before the loop ran.
        let interpolated = match step.op {
            StepOp::Loop(_) | StepOp::RunTest(_) => step.clone(),
            _ => ctx.interpolate_step(step),
        };
        let outcome = dispatch(env, ctx, &interpolated).await;
        finish(env, ctx, step, section, index, started, start_time_ms, outcome).await
    })
}

/// Trace and event bookkeeping shared by the success and failure paths.
#[allow(clippy::too_many_arguments)]
async fn finish(
    env: &ExecEnv,
    ctx: &mut RunContext,
    step: &Step,
    section: Section,
    index: usize,
    started: tokio::time::Instant,
    start_time_ms: u64,
    outcome: StepOutcome,
) -> Result<(), StepFailure> {
    let duration_ms = started.elapsed().as_millis() as u64;

    if outcome.success {
        // Loops bind their iteration variables themselves and produce no
        // value; only value-producing ops bind the envelope `as:`.
        if let (Some(bind), Some(value)) = (&step.bind, outcome.value.clone()) {
            ctx.bind(bind.clone(), value);
            // Keep the page-side mirror current for later JS expressions.
            if let Err(e) = env.client.evaluate(&ctx.mirror_script()).await {
                warn!(error = %e, "failed to sync variable mirror");
            }
        }

        let dom_snapshot = if step.capture_dom {
            env.client.get_dom_snapshot().await.ok()
        } else {
            None
        };

        ctx.traces.push(StepTrace {
            step_index: index,
            section,
            step_type: step.kind().to_string(),
            label: step.label.clone(),
            status: StepStatus::Passed,
            start_time_ms,
            duration_ms,
            error: None,
            result: outcome.value,
            dom_snapshot,
            screenshot: None,
            console_messages: None,
            network_requests: None,
        });
        env.bus.emit(RunEvent::StepPass {
            step_index: index,
            section,
            duration_ms,
            skipped: outcome.skipped,
        });
        return Ok(());
    }

    let error = outcome
        .error
        .unwrap_or_else(|| "step failed".to_string());

    let console_errors: Vec<Value> = env
        .client
        .get_console_messages()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|m| m.level == "error")
        .filter_map(|m| serde_json::to_value(m).ok())
        .collect();
    let dom_snapshot = env.client.get_dom_snapshot().await.ok();
    let screenshot = env.client.capture_screenshot().await.ok();

    ctx.traces.push(StepTrace {
        step_index: index,
        section,
        step_type: step.kind().to_string(),
        label: step.label.clone(),
        status: StepStatus::Failed,
        start_time_ms,
        duration_ms,
        error: Some(error.clone()),
        result: None,
        dom_snapshot: dom_snapshot.clone(),
        screenshot: None,
        console_messages: None,
        network_requests: None,
    });
    env.bus.emit(RunEvent::StepFail {
        step_index: index,
        section,
        duration_ms,
        error: error.clone(),
    });

    Err(StepFailure {
        section,
        index,
        label: step.label.clone(),
        step: step.clone(),
        error,
        loop_context: outcome.loop_context,
        console_errors,
        dom_snapshot,
        screenshot,
        stopped: outcome.stopped,
    })
}

/// Failure raised by the gate before the step started: stop or deadline.
/// No events are emitted, so the start/finish pairing stays intact.
async fn aborted(
    env: &ExecEnv,
    section: Section,
    index: usize,
    step: &Step,
    error: RunError,
) -> StepFailure {
    let console_errors: Vec<Value> = env
        .client
        .get_console_messages()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|m| m.level == "error")
        .filter_map(|m| serde_json::to_value(m).ok())
        .collect();
    StepFailure {
        section,
        index,
        label: step.label.clone(),
        step: step.clone(),
        error: error.to_string(),
        loop_context: None,
        console_errors,
        dom_snapshot: None,
        screenshot: None,
        stopped: true,
    }
}

/// Exhaustive dispatch over the operation tag.
pub async fn dispatch(env: &ExecEnv, ctx: &mut RunContext, step: &Step) -> StepOutcome {
    match &step.op {
        StepOp::Eval(expr) => page::eval(env, expr).await,
        StepOp::Fill(spec) => page::fill(env, spec).await,
        StepOp::ClearInput(target) => page::clear_input(env, target.selector()).await,
        StepOp::FillForm(spec) => page::fill_form(env, spec).await,
        StepOp::Type(spec) => page::type_text(env, spec).await,
        StepOp::ScanInput(spec) => page::scan_input(env, spec).await,
        StepOp::Click(target) => page::click(env, target.selector()).await,
        StepOp::Hover(target) => page::hover(env, target.selector()).await,
        StepOp::Select(spec) => page::select(env, spec).await,
        StepOp::PressKey(spec) => page::press_key(env, spec).await,
        StepOp::SwitchFrame(target) => page::switch_frame(env, target.as_ref()).await,
        StepOp::HandleDialog(spec) => page::handle_dialog(env, spec).await,
        StepOp::Screenshot => page::screenshot(env).await,
        StepOp::ScrollTo(target) => page::scroll_to(env, target.selector()).await,
        StepOp::Wait(spec) => wait::wait(spec).await,
        StepOp::WaitFor(spec) => wait::wait_for(env, spec).await,
        StepOp::WaitForText(probe) => wait::wait_for_text(env, probe, false).await,
        StepOp::WaitForTextGone(probe) => wait::wait_for_text(env, probe, true).await,
        StepOp::Assert { expr, retry } => assert::assert_expr(env, expr, retry.as_ref()).await,
        StepOp::AssertText { spec, retry } => {
            assert::assert_text(env, spec, retry.as_ref()).await
        }
        StepOp::ClickText(spec) => widgets::click_text(env, spec).await,
        StepOp::ClickNth(spec) => widgets::click_nth(env, spec).await,
        StepOp::ChooseDropdown(spec) => widgets::choose_dropdown(env, spec).await,
        StepOp::ExpandMenu(spec) => widgets::expand_menu(env, spec).await,
        StepOp::Toggle(spec) => widgets::toggle(env, spec).await,
        StepOp::CloseModal(spec) => widgets::close_modal(env, spec).await,
        StepOp::ConsoleCheck(spec) => assert::console_check(env, spec).await,
        StepOp::NetworkCheck(enabled) => assert::network_check(env, *enabled).await,
        StepOp::MockNetwork(spec) => http::mock_network(env, spec).await,
        StepOp::HttpRequest(spec) => http::http_request(env, spec).await,
        StepOp::Loop(spec) => flow::run_loop(env, ctx, step, spec).await,
        StepOp::RunTest(spec) => flow::run_test(env, ctx, spec).await,
    }
}

/// Folds a failed client call into a step failure, tagged as a transport
/// error.
pub(crate) fn client_err(e: anyhow::Error) -> StepOutcome {
    StepOutcome::fail(RunError::BrowserTransport(e.to_string()).to_string())
}

/// JS truthiness over the JSON values `evaluate` returns.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{harness, step};
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_drive_step_binds_result_and_syncs_mirror() {
        let (env, mut ctx, fake) = harness();
        let s = step(json!({ "eval": "1+1", "as": "r" }));
        drive_step(&env, &mut ctx, &s, Section::Steps, 0)
            .await
            .unwrap();
        assert_eq!(ctx.vars.get("r"), Some(&json!(2)));
        assert_eq!(fake.count_calls("evaluate window.__cdp_vars"), 1);
    }

    #[tokio::test]
    async fn test_guard_falsy_skips_without_dispatch_or_binding() {
        let (env, mut ctx, fake) = harness();
        ctx.bind("flag", json!(false));
        let s = step(json!({ "if": "$vars.flag", "click": { "selector": "#x" }, "as": "out" }));
        drive_step(&env, &mut ctx, &s, Section::Steps, 1)
            .await
            .unwrap();
        assert_eq!(fake.count_calls("click"), 0);
        assert!(!ctx.vars.contains_key("out"));
        assert_eq!(ctx.traces.last().unwrap().status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn test_failure_captures_evidence_and_emits_fail() {
        let (env, mut ctx, fake) = harness();
        fake.push_console("error", "kaboom");
        fake.fail_on("click #broken", "element not found");
        let mut events = env.bus.subscribe("step:");
        let s = step(json!({ "click": { "selector": "#broken" } }));
        let failure = drive_step(&env, &mut ctx, &s, Section::Steps, 2)
            .await
            .unwrap_err();
        assert_eq!(failure.error, "element not found");
        assert_eq!(failure.console_errors.len(), 1);
        assert!(failure.dom_snapshot.is_some());
        assert!(!failure.stopped);
        let topics: Vec<_> = events.drain().iter().map(|e| e.topic()).collect();
        assert_eq!(topics, vec!["step:start", "step:fail"]);
    }

    #[tokio::test]
    async fn test_capture_dom_only_affects_trace() {
        let (env, mut ctx, _fake) = harness();
        let s = step(json!({ "eval": "true", "capture_dom": true }));
        drive_step(&env, &mut ctx, &s, Section::Steps, 0)
            .await
            .unwrap();
        let trace = ctx.traces.last().unwrap();
        assert_eq!(trace.status, StepStatus::Passed);
        assert!(trace.dom_snapshot.is_some());
    }
}
