//! # Run orchestrator
//!
//! Drives one test definition to a verdict: seed inputs, prime the client,
//! `before` hooks, navigation, `steps` (honouring `resume_from`), then the
//! `after` section, which runs no matter how the middle went. The first
//! failure anywhere is the verdict's failure; later `after` failures only
//! land in traces.
//!
//! One run occupies one task. Everything concurrent (event fan-out, CDP
//! pumps, the control server) lives elsewhere and talks to the run through
//! the debug gate and the evidence buffers.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde_json::Value;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::browser::BrowserClient;
use crate::context::RunContext;
use crate::debug::DebugGate;
use crate::events::{EventBus, RunEvent};
use crate::executors::{drive_step, ExecEnv, StepFailure};
use crate::protocol::{
    InputDef, InputType, RunStatus, Section, StepStatus, StepTrace, TestDefinition, TestResult,
};
use crate::store::TestStore;

/// Per-run parameters supplied by the host.
#[derive(Debug, Default)]
pub struct RunConfig {
    /// Saved-test id, used for events and root cycle detection. Ad-hoc
    /// definitions run without one.
    pub test_id: Option<String>,
    pub run_id: Option<String>,
    /// Raw input values; coerced per the definition's input declarations.
    pub inputs: BTreeMap<String, Value>,
}

pub struct Runner {
    client: Arc<dyn BrowserClient>,
    store: Option<Arc<TestStore>>,
    bus: EventBus,
    http: reqwest::Client,
}

impl Runner {
    pub fn new(client: Arc<dyn BrowserClient>, store: Option<Arc<TestStore>>, bus: EventBus) -> Self {
        Self {
            client,
            store,
            bus,
            http: reqwest::Client::new(),
        }
    }

    /// Runs a definition to completion. `Err` only for pre-run problems
    /// (bad inputs); everything after `run:start` lands in the verdict.
    #[instrument(skip_all, fields(test_id = config.test_id.as_deref().unwrap_or("adhoc")))]
    pub async fn run(
        &self,
        def: &TestDefinition,
        config: RunConfig,
        gate: Arc<DebugGate>,
    ) -> Result<TestResult> {
        let run_id = config.run_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let test_id = config.test_id.unwrap_or_else(|| "adhoc".to_string());

        let mut ctx = RunContext::new(def.env.clone(), def.timeout);
        seed_inputs(&mut ctx, &def.inputs, &config.inputs)?;
        ctx.visited.push(test_id.clone());

        let env = ExecEnv {
            client: self.client.clone(),
            store: self.store.clone(),
            bus: self.bus.clone(),
            gate,
            http: self.http.clone(),
        };

        self.bus.emit(RunEvent::RunStart {
            test_id: test_id.clone(),
            run_id: run_id.clone(),
        });
        let started = tokio::time::Instant::now();

        if let Err(e) = env.client.reset().await {
            warn!(error = %e, "failed to reset client state");
        }

        let mut first_failure: Option<StepFailure> = None;

        // Setup hooks. A failure here skips navigation and the main steps
        // but cleanup still runs.
        ctx.section = Section::Before;
        for (i, step) in def.before.iter().enumerate() {
            if let Err(failure) = drive_step(&env, &mut ctx, step, Section::Before, i).await {
                first_failure = Some(failure);
                break;
            }
        }

        if first_failure.is_none() {
            if !def.url.is_empty() {
                if let Err(e) = env.client.navigate(&def.url).await {
                    first_failure = Some(navigation_failure(def, &e.to_string()));
                }
            }
            // Navigation replaced the page; republish the variable mirror.
            if first_failure.is_none() {
                if let Err(e) = env.client.evaluate(&ctx.mirror_script()).await {
                    warn!(error = %e, "failed to sync variable mirror");
                }
            }
        }

        if first_failure.is_none() {
            ctx.section = Section::Steps;
            let resume = def.resume_from.unwrap_or(0).min(def.steps.len());
            for (i, step) in def.steps.iter().enumerate().take(resume) {
                ctx.traces.push(skipped_trace(step, i));
            }
            for (i, step) in def.steps.iter().enumerate().skip(resume) {
                if let Err(failure) = drive_step(&env, &mut ctx, step, Section::Steps, i).await {
                    first_failure = Some(failure);
                    break;
                }
            }
        }

        // Cleanup always runs; a stop consumed by the main section no
        // longer applies, but a fresh stop aborts the remaining hooks.
        ctx.section = Section::After;
        env.gate.begin_cleanup();
        for (i, step) in def.after.iter().enumerate() {
            match drive_step(&env, &mut ctx, step, Section::After, i).await {
                Ok(()) => {}
                Err(failure) => {
                    let abort = failure.stopped;
                    if first_failure.is_none() {
                        first_failure = Some(failure);
                    }
                    if abort {
                        break;
                    }
                }
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        let result = match first_failure {
            None => TestResult::Passed {
                steps_completed: def.steps.len(),
                duration_ms,
                step_traces: Some(ctx.traces.clone()),
            },
            Some(failure) => TestResult::Failed {
                failed_step: failure.index,
                failed_label: failure.label.clone(),
                step_definition: failure.step.clone(),
                error: failure.error.clone(),
                loop_context: failure.loop_context.clone(),
                console_errors: failure.console_errors.clone(),
                dom_snapshot: failure.dom_snapshot.clone(),
                screenshot: failure.screenshot.clone(),
                duration_ms,
                step_traces: Some(ctx.traces.clone()),
            },
        };

        let status = if result.passed() {
            RunStatus::Passed
        } else {
            RunStatus::Failed
        };
        self.bus.emit(RunEvent::RunComplete {
            test_id,
            run_id,
            status,
        });

        let (passed, failed, skipped) = tally(&ctx.traces);
        info!(
            status = %status,
            passed,
            failed,
            skipped,
            duration_ms,
            "run finished"
        );
        Ok(result)
    }
}

/// Seeds `$vars` from declared inputs: supplied value, else default.
/// Required inputs without either refuse the run.
fn seed_inputs(
    ctx: &mut RunContext,
    declared: &[InputDef],
    supplied: &BTreeMap<String, Value>,
) -> Result<()> {
    for input in declared {
        let raw = supplied
            .get(&input.name)
            .cloned()
            .or_else(|| input.default.clone());
        match raw {
            Some(value) => {
                let coerced = coerce_input(&value, input.input_type)
                    .ok_or_else(|| {
                        anyhow!(
                            "input \"{}\" is not a valid {:?}",
                            input.name,
                            input.input_type
                        )
                    })?;
                ctx.bind(input.name.clone(), coerced);
            }
            None if input.required => {
                return Err(anyhow!("missing required input \"{}\"", input.name));
            }
            None => {}
        }
    }
    Ok(())
}

/// Coerces a supplied value to the declared input type. GUI forms submit
/// strings, so string parses are accepted for every type.
fn coerce_input(value: &Value, input_type: InputType) -> Option<Value> {
    match input_type {
        InputType::Text => Some(match value {
            Value::String(_) => value.clone(),
            other => Value::String(other.to_string()),
        }),
        InputType::Number => match value {
            Value::Number(_) => Some(value.clone()),
            Value::String(s) => {
                if let Ok(i) = s.trim().parse::<i64>() {
                    Some(Value::from(i))
                } else {
                    s.trim().parse::<f64>().ok().map(Value::from)
                }
            }
            _ => None,
        },
        InputType::Boolean => match value {
            Value::Bool(_) => Some(value.clone()),
            Value::String(s) => match s.trim() {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },
            _ => None,
        },
    }
}

fn skipped_trace(step: &crate::protocol::Step, index: usize) -> StepTrace {
    StepTrace {
        step_index: index,
        section: Section::Steps,
        step_type: step.kind().to_string(),
        label: step.label.clone(),
        status: StepStatus::Skipped,
        start_time_ms: chrono::Utc::now().timestamp_millis() as u64,
        duration_ms: 0,
        error: None,
        result: None,
        dom_snapshot: None,
        screenshot: None,
        console_messages: None,
        network_requests: None,
    }
}

/// Navigation happens between sections, so a failed load is pinned to the
/// first main step.
fn navigation_failure(def: &TestDefinition, error: &str) -> StepFailure {
    let step = def.steps.first().cloned().unwrap_or_default();
    StepFailure {
        section: Section::Steps,
        index: 0,
        label: step.label.clone(),
        step,
        error: format!("navigation to \"{}\" failed: {}", def.url, error),
        loop_context: None,
        console_errors: Vec::new(),
        dom_snapshot: None,
        screenshot: None,
        stopped: false,
    }
}

fn tally(traces: &[StepTrace]) -> (usize, usize, usize) {
    let passed = traces.iter().filter(|t| t.status == StepStatus::Passed).count();
    let failed = traces.iter().filter(|t| t.status == StepStatus::Failed).count();
    let skipped = traces.iter().filter(|t| t.status == StepStatus::Skipped).count();
    (passed, failed, skipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::fake::FakeBrowser;
    use serde_json::json;
    use tokio::time::Duration;

    fn definition(v: Value) -> TestDefinition {
        serde_json::from_value(v).unwrap()
    }

    fn runner() -> (Runner, Arc<FakeBrowser>, EventBus) {
        let fake = Arc::new(FakeBrowser::new());
        let bus = EventBus::new();
        (
            Runner::new(fake.clone(), None, bus.clone()),
            fake,
            bus,
        )
    }

    fn free_gate(bus: &EventBus) -> Arc<DebugGate> {
        Arc::new(DebugGate::new(false, 0, bus.clone()))
    }

    #[tokio::test]
    async fn test_simple_pass_with_event_sequence() {
        let (runner, _fake, bus) = runner();
        let mut events = bus.subscribe("");
        let def = definition(json!({
            "url": "http://x",
            "steps": [
                { "eval": "1+1", "as": "r" },
                { "assert": "$vars.r === 2" }
            ]
        }));
        let result = runner
            .run(&def, RunConfig::default(), free_gate(&bus))
            .await
            .unwrap();

        match result {
            TestResult::Passed {
                steps_completed, ..
            } => assert_eq!(steps_completed, 2),
            other => panic!("expected pass, got {:?}", other),
        }

        let topics: Vec<_> = events.drain().iter().map(|e| e.topic()).collect();
        assert_eq!(
            topics,
            vec![
                "run:start",
                "step:start",
                "step:pass",
                "step:start",
                "step:pass",
                "run:complete"
            ]
        );
    }

    #[tokio::test]
    async fn test_conditional_skip_does_not_touch_client() {
        let (runner, fake, bus) = runner();
        let mut events = bus.subscribe("step:");
        let def = definition(json!({
            "url": "http://x",
            "steps": [
                { "eval": "false", "as": "flag" },
                { "if": "$vars.flag", "click": { "selector": "#x" } },
                { "assert": "true" }
            ]
        }));
        let result = runner
            .run(&def, RunConfig::default(), free_gate(&bus))
            .await
            .unwrap();
        assert!(result.passed());
        assert_eq!(fake.count_calls("click"), 0);

        let events = events.drain();
        let passes: Vec<bool> = events
            .iter()
            .filter_map(|e| match e {
                RunEvent::StepPass { skipped, .. } => Some(*skipped),
                _ => None,
            })
            .collect();
        assert_eq!(passes, vec![false, true, false]);
    }

    #[tokio::test]
    async fn test_nested_loop_failure_points_at_outer_loop_step() {
        let (runner, _fake, bus) = runner();
        let def = definition(json!({
            "url": "http://x",
            "steps": [ {
                "loop": {
                    "over": "[1, 2, 3]",
                    "steps": [ {
                        "loop": {
                            "over": "[10, 20]",
                            "steps": [ { "assert": "$vars.i !== 2 || $vars.j !== 20" } ]
                        },
                        "as": "j"
                    } ]
                },
                "as": "i"
            } ]
        }));
        let result = runner
            .run(&def, RunConfig::default(), free_gate(&bus))
            .await
            .unwrap();
        match result {
            TestResult::Failed {
                failed_step,
                loop_context,
                ..
            } => {
                assert_eq!(failed_step, 0);
                let breadcrumb = loop_context.unwrap();
                assert_eq!(breadcrumb.len(), 2);
                assert_eq!(breadcrumb[0].iteration, 1);
                assert_eq!(breadcrumb[0].step, 0);
                assert_eq!(breadcrumb[1].iteration, 1);
                assert_eq!(breadcrumb[1].step, 0);
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_debug_gate_round_trip() {
        let (runner, _fake, bus) = runner();
        let gate = Arc::new(DebugGate::new(true, 0, bus.clone()));
        let mut debug_events = bus.subscribe("debug:");
        let def = definition(json!({
            "url": "http://x",
            "steps": [ { "eval": "1" }, { "eval": "2" }, { "eval": "3" } ]
        }));

        let handle = {
            let gate = gate.clone();
            tokio::spawn(async move { runner.run(&def, RunConfig::default(), gate).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(gate.is_paused());
        gate.command(crate::debug::DebugCommand::Step);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(gate.is_paused());
        gate.command(crate::debug::DebugCommand::Continue);

        let result = handle.await.unwrap().unwrap();
        assert!(result.passed());

        let topics: Vec<_> = debug_events.drain().iter().map(|e| e.topic()).collect();
        assert_eq!(
            topics,
            vec![
                "debug:paused",
                "debug:resumed",
                "debug:paused",
                "debug:resumed"
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_drains_after_section() {
        let (runner, fake, bus) = runner();
        let gate = Arc::new(DebugGate::new(true, 0, bus.clone()));
        let def = definition(json!({
            "url": "http://x",
            "steps": [ { "eval": "1" }, { "eval": "2" } ],
            "after": [ { "eval": "'cleanup'", "label": "Cleanup" } ]
        }));

        let handle = {
            let gate = gate.clone();
            tokio::spawn(async move { runner.run(&def, RunConfig::default(), gate).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(gate.is_paused());
        gate.command(crate::debug::DebugCommand::Stop);

        let result = handle.await.unwrap().unwrap();
        match result {
            TestResult::Failed { error, .. } => assert_eq!(error, "Stopped by user"),
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(fake.count_calls("evaluate 'cleanup'"), 1);
    }

    #[tokio::test]
    async fn test_before_failure_skips_steps_but_runs_after() {
        let (runner, fake, bus) = runner();
        fake.fail_on("click #setup", "element not found");
        let def = definition(json!({
            "url": "http://x",
            "before": [ { "click": { "selector": "#setup" } } ],
            "steps": [ { "eval": "'main'" } ],
            "after": [ { "eval": "'cleanup'" } ]
        }));
        let result = runner
            .run(&def, RunConfig::default(), free_gate(&bus))
            .await
            .unwrap();
        assert!(!result.passed());
        assert_eq!(fake.count_calls("evaluate 'main'"), 0);
        assert_eq!(fake.count_calls("evaluate 'cleanup'"), 1);
        assert_eq!(fake.count_calls("navigate"), 0);
    }

    #[tokio::test]
    async fn test_resume_from_records_skipped_traces() {
        let (runner, fake, bus) = runner();
        let def = definition(json!({
            "url": "http://x",
            "steps": [
                { "eval": "'a'", "label": "A" },
                { "eval": "'b'" },
                { "eval": "'c'" }
            ],
            "resume_from": 1
        }));
        let result = runner
            .run(&def, RunConfig::default(), free_gate(&bus))
            .await
            .unwrap();
        assert!(result.passed());
        assert_eq!(fake.count_calls("evaluate 'a'"), 0);
        assert_eq!(fake.count_calls("evaluate 'b'"), 1);
        match result {
            TestResult::Passed { step_traces, .. } => {
                let traces = step_traces.unwrap();
                assert_eq!(traces[0].status, StepStatus::Skipped);
                assert_eq!(traces[0].label.as_deref(), Some("A"));
                assert_eq!(traces[1].status, StepStatus::Passed);
            }
            other => panic!("expected pass, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_deadline_reports_timeout() {
        let (runner, _fake, bus) = runner();
        let def = definition(json!({
            "url": "http://x",
            "timeout": 20,
            "steps": [ { "wait": 60 }, { "eval": "'late'" } ]
        }));
        let result = runner
            .run(&def, RunConfig::default(), free_gate(&bus))
            .await
            .unwrap();
        match result {
            TestResult::Failed {
                failed_step, error, ..
            } => {
                assert_eq!(failed_step, 1);
                assert_eq!(error, "Timeout after 20ms");
            }
            other => panic!("expected timeout failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_event_pairing_invariant() {
        let (runner, fake, bus) = runner();
        fake.fail_on("click #broken", "element not found");
        let mut events = bus.subscribe("step:");
        let def = definition(json!({
            "url": "http://x",
            "steps": [
                { "eval": "1" },
                { "click": { "selector": "#broken" } },
                { "eval": "'never'" }
            ],
            "after": [ { "eval": "'cleanup'" } ]
        }));
        let _ = runner
            .run(&def, RunConfig::default(), free_gate(&bus))
            .await
            .unwrap();

        let events = events.drain();
        let starts = events
            .iter()
            .filter(|e| matches!(e, RunEvent::StepStart { .. }))
            .count();
        let finishes = events
            .iter()
            .filter(|e| matches!(e, RunEvent::StepPass { .. } | RunEvent::StepFail { .. }))
            .count();
        assert_eq!(starts, finishes);
    }

    #[tokio::test]
    async fn test_inputs_seed_vars_with_coercion() {
        let (runner, _fake, bus) = runner();
        let def = definition(json!({
            "url": "http://x",
            "inputs": [
                { "name": "count", "type": "number" },
                { "name": "dry_run", "type": "boolean", "default": true }
            ],
            "steps": [ { "assert": "$vars.count === 7" }, { "assert": "$vars.dry_run" } ]
        }));
        let mut config = RunConfig::default();
        config.inputs.insert("count".into(), json!("7"));
        let result = runner.run(&def, config, free_gate(&bus)).await.unwrap();
        assert!(result.passed());
    }

    #[tokio::test]
    async fn test_missing_required_input_refuses_run() {
        let (runner, _fake, bus) = runner();
        let def = definition(json!({
            "url": "http://x",
            "inputs": [ { "name": "token", "type": "text", "required": true } ],
            "steps": [ { "eval": "1" } ]
        }));
        let err = runner
            .run(&def, RunConfig::default(), free_gate(&bus))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("token"));
    }

    #[tokio::test]
    async fn test_after_failure_is_headline_only_when_steps_passed() {
        let (runner, fake, bus) = runner();
        fake.fail_on("click #cleanup", "element not found");
        let def = definition(json!({
            "url": "http://x",
            "steps": [ { "eval": "1" } ],
            "after": [ { "click": { "selector": "#cleanup" } } ]
        }));
        let result = runner
            .run(&def, RunConfig::default(), free_gate(&bus))
            .await
            .unwrap();
        match result {
            TestResult::Failed { error, .. } => {
                assert_eq!(error, "element not found");
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }
}
