//! Control-flow handlers: `loop` and `run_test`. Both recurse into the
//! step pipeline, so nested steps get the full gate / event / trace
//! treatment with their own index stream.
//!
//! Interpolation here is deliberately lazy. The drive pipeline hands flow
//! ops the step as written; condition expressions and nested steps are
//! interpolated per iteration so they observe the loop variables.

use serde_json::Value;
use tracing::instrument;

use super::{client_err, drive_step, truthy, ExecEnv, StepOutcome};
use crate::context::RunContext;
use crate::errors::RunError;
use crate::protocol::{LoopContextEntry, LoopSpec, RunTestSpec, Step};

/// Iteration variable used when an `over` loop has no `as:`.
const DEFAULT_ITEM_VAR: &str = "item";
/// Counter variable used when `index_as` is absent.
const DEFAULT_INDEX_VAR: &str = "index";

/// Executes a `loop` step in either `over` or `while` mode.
#[instrument(skip_all, fields(mode = if spec.over.is_some() { "over" } else { "while" }))]
pub async fn run_loop(
    env: &ExecEnv,
    ctx: &mut RunContext,
    step: &Step,
    spec: &LoopSpec,
) -> StepOutcome {
    if spec.steps.is_empty() {
        return shape_err("loop has no steps");
    }
    match (&spec.over, &spec.while_expr) {
        (Some(over), None) => run_over_loop(env, ctx, step, spec, over).await,
        (None, Some(cond)) => run_while_loop(env, ctx, spec, cond).await,
        (Some(_), Some(_)) => shape_err("loop cannot have both 'over' and 'while'"),
        (None, None) => shape_err("loop requires 'over' or 'while'"),
    }
}

fn shape_err(message: &str) -> StepOutcome {
    StepOutcome::fail(RunError::StepValidation(message.to_string()).to_string())
}

async fn run_over_loop(
    env: &ExecEnv,
    ctx: &mut RunContext,
    step: &Step,
    spec: &LoopSpec,
    over: &str,
) -> StepOutcome {
    let expr = ctx.interpolate_str(over);
    let items = match env.client.evaluate(&expr).await {
        Ok(Value::Array(items)) => items,
        Ok(other) => {
            return StepOutcome::fail(format!(
                "loop 'over' expression did not yield an array: {}",
                other
            ))
        }
        Err(e) => return client_err(e),
    };

    let item_var = step.bind.clone().unwrap_or_else(|| DEFAULT_ITEM_VAR.to_string());
    let index_var = spec
        .index_as
        .clone()
        .unwrap_or_else(|| DEFAULT_INDEX_VAR.to_string());

    // The whole array is published once so page expressions can look
    // ahead or behind the current item.
    ctx.bind(format!("{}__array", item_var), Value::Array(items.clone()));
    if let Err(e) = env.client.evaluate(&ctx.mirror_script()).await {
        return client_err(e);
    }

    let bound = spec
        .max
        .map(|max| (max as usize).min(items.len()))
        .unwrap_or(items.len());

    for (i, item) in items.into_iter().take(bound).enumerate() {
        ctx.bind(item_var.clone(), item);
        ctx.bind(index_var.clone(), Value::from(i as u64));
        if let Err(e) = env.client.evaluate(&ctx.mirror_script()).await {
            return client_err(e);
        }
        if let Some(outcome) = run_iteration(env, ctx, &spec.steps, i as u64).await {
            return outcome;
        }
    }
    StepOutcome::ok()
}

async fn run_while_loop(
    env: &ExecEnv,
    ctx: &mut RunContext,
    spec: &LoopSpec,
    cond: &str,
) -> StepOutcome {
    // Unbounded while loops are rejected when a test is edited; a
    // definition that sneaks past still refuses to run.
    let Some(max) = spec.max else {
        return shape_err("loop 'while' requires 'max'");
    };
    let index_var = spec
        .index_as
        .clone()
        .unwrap_or_else(|| DEFAULT_INDEX_VAR.to_string());

    for i in 0..max {
        let expr = ctx.interpolate_str(cond);
        match env.client.evaluate(&expr).await {
            Ok(value) if truthy(&value) => {}
            Ok(_) => return StepOutcome::ok(),
            Err(e) => return client_err(e),
        }

        ctx.bind(index_var.clone(), Value::from(i));
        if let Err(e) = env.client.evaluate(&ctx.mirror_script()).await {
            return client_err(e);
        }
        if let Some(outcome) = run_iteration(env, ctx, &spec.steps, i).await {
            return outcome;
        }
    }
    StepOutcome::ok()
}

/// Runs one iteration's steps. `Some(outcome)` means the iteration failed
/// and carries the breadcrumb for this level, outermost first.
async fn run_iteration(
    env: &ExecEnv,
    ctx: &mut RunContext,
    steps: &[Step],
    iteration: u64,
) -> Option<StepOutcome> {
    let section = ctx.section;
    for (s, inner) in steps.iter().enumerate() {
        if let Err(failure) = drive_step(env, ctx, inner, section, s).await {
            let entry = LoopContextEntry {
                iteration,
                step: failure.index,
                label: failure
                    .label
                    .clone()
                    .or_else(|| Some(format!("Step {}", failure.index + 1))),
            };
            let mut breadcrumb = vec![entry];
            breadcrumb.extend(failure.loop_context.unwrap_or_default());
            return Some(StepOutcome {
                success: false,
                error: Some(failure.error),
                value: None,
                skipped: false,
                loop_context: Some(breadcrumb),
                stopped: failure.stopped,
            });
        }
    }
    None
}

/// Executes a nested test by id: cycle check, navigate to the sub-test's
/// URL, then its `steps` only. The sub-test shares the parent's `vars`
/// and interpolates against the parent's `env`.
#[instrument(skip_all, fields(id = spec.id()))]
pub async fn run_test(env: &ExecEnv, ctx: &mut RunContext, spec: &RunTestSpec) -> StepOutcome {
    let id = ctx.interpolate_str(spec.id());

    if ctx.visited.iter().any(|v| v == &id) {
        return StepOutcome::fail(RunError::CycleDetected(id).to_string());
    }

    let Some(store) = &env.store else {
        return StepOutcome::fail(format!("test not found: \"{}\"", id));
    };
    let Some(saved) = store.get_test(&id) else {
        return StepOutcome::fail(format!("test not found: \"{}\"", id));
    };

    ctx.visited.push(id.clone());
    let outcome = run_sub_test(env, ctx, &id, &saved.definition.url, &saved.definition.steps).await;
    ctx.visited.pop();
    outcome
}

async fn run_sub_test(
    env: &ExecEnv,
    ctx: &mut RunContext,
    id: &str,
    url: &str,
    steps: &[Step],
) -> StepOutcome {
    if !url.is_empty() {
        let url = ctx.interpolate_str(url);
        if let Err(e) = env.client.navigate(&url).await {
            return StepOutcome::fail(format!("navigation to \"{}\" failed: {}", url, e));
        }
    }

    let section = ctx.section;
    for (i, sub_step) in steps.iter().enumerate() {
        if let Err(failure) = drive_step(env, ctx, sub_step, section, i).await {
            if failure.stopped {
                return StepOutcome {
                    success: false,
                    error: Some(failure.error),
                    value: None,
                    skipped: false,
                    loop_context: failure.loop_context,
                    stopped: true,
                };
            }
            let error =
                RunError::sub_test(id, failure.index, failure.label.as_deref(), &failure.error);
            return StepOutcome {
                success: false,
                error: Some(error.to_string()),
                value: None,
                skipped: false,
                loop_context: failure.loop_context,
                stopped: false,
            };
        }
    }
    StepOutcome::ok()
}
