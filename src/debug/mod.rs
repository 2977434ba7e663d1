//! # Debug gate
//!
//! Cooperative single-step controller. The run task calls [`DebugGate::pass`]
//! once per step, before dispatch; an external UI issues commands through
//! [`DebugGate::command`]. Pausing blocks only the run task, while command
//! delivery stays non-blocking for the control surface.
//!
//! Commands issued while the run is between gates are latched and take
//! effect at the next gate entry. `stop` is the exception: it flips the
//! stopped flag immediately and the next check fails the run.

use std::sync::Mutex;

use tokio::sync::Notify;
use tokio::time::{sleep, Duration, Instant};

use crate::errors::RunError;
use crate::events::{EventBus, RunEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugCommand {
    /// Run one step, then pause again.
    Step,
    /// Leave step mode and run freely.
    Continue,
    /// Run without pausing until the given step index, then re-enter step
    /// mode.
    RunTo(usize),
    /// Abort the run. Takes effect immediately.
    Stop,
}

#[derive(Debug, Default)]
struct GateState {
    step_mode: bool,
    stopped: bool,
    paused: bool,
    run_to: Option<usize>,
    pending: Option<DebugCommand>,
}

pub struct DebugGate {
    state: Mutex<GateState>,
    wakeup: Notify,
    /// Extra delay inserted before every step after the first.
    step_delay_ms: u64,
    bus: EventBus,
}

impl DebugGate {
    /// `debug` starts the run in step mode, pausing before the first step.
    pub fn new(debug: bool, step_delay_ms: u64, bus: EventBus) -> Self {
        Self {
            state: Mutex::new(GateState {
                step_mode: debug,
                ..GateState::default()
            }),
            wakeup: Notify::new(),
            step_delay_ms,
            bus,
        }
    }

    /// Delivers a command from the control surface.
    pub fn command(&self, command: DebugCommand) {
        {
            let mut state = self.state.lock().expect("gate state lock");
            match command {
                DebugCommand::Stop => state.stopped = true,
                other => state.pending = Some(other),
            }
        }
        self.wakeup.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().expect("gate state lock").paused
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().expect("gate state lock").stopped
    }

    /// Clears stop and step state before the `after` section runs, so a
    /// stop that killed `steps[]` does not also kill the cleanup. A fresh
    /// stop issued during cleanup aborts the remaining steps.
    pub fn begin_cleanup(&self) {
        let mut state = self.state.lock().expect("gate state lock");
        state.stopped = false;
        state.step_mode = false;
        state.run_to = None;
        state.pending = None;
    }

    /// The per-step barrier. `deadline` is the whole-run deadline; `None`
    /// disables the check (cleanup steps).
    pub async fn pass(
        &self,
        step_index: usize,
        deadline: Option<Instant>,
        timeout_ms: u64,
    ) -> Result<(), RunError> {
        if self.is_stopped() {
            return Err(RunError::Stopped);
        }
        if let Some(deadline) = deadline {
            if Instant::now() > deadline {
                return Err(RunError::DeadlineExceeded(timeout_ms));
            }
        }

        if self.step_delay_ms > 0 && step_index > 0 {
            sleep(Duration::from_millis(self.step_delay_ms)).await;
            if self.is_stopped() {
                return Err(RunError::Stopped);
            }
        }

        let must_pause = {
            let mut state = self.state.lock().expect("gate state lock");

            // Latched command from between gates.
            if let Some(cmd) = state.pending.take() {
                apply(&mut state, cmd);
            }

            if let Some(target) = state.run_to {
                if step_index < target {
                    return Ok(());
                }
                state.step_mode = true;
                state.run_to = None;
            }

            if state.step_mode {
                state.paused = true;
                true
            } else {
                false
            }
        };

        if !must_pause {
            return Ok(());
        }

        self.bus.emit(RunEvent::DebugPaused { step_index });
        loop {
            let outcome = {
                let mut state = self.state.lock().expect("gate state lock");
                if state.stopped {
                    state.paused = false;
                    Some(Err(RunError::Stopped))
                } else if let Some(cmd) = state.pending.take() {
                    apply(&mut state, cmd);
                    state.paused = false;
                    Some(Ok(()))
                } else {
                    None
                }
            };
            match outcome {
                Some(Err(e)) => return Err(e),
                Some(Ok(())) => break,
                None => self.wakeup.notified().await,
            }
        }
        self.bus.emit(RunEvent::DebugResumed { step_index });
        Ok(())
    }
}

fn apply(state: &mut GateState, command: DebugCommand) {
    match command {
        DebugCommand::Step => state.step_mode = true,
        DebugCommand::Continue => {
            state.step_mode = false;
            state.run_to = None;
        }
        DebugCommand::RunTo(target) => {
            state.run_to = Some(target);
            state.step_mode = false;
        }
        DebugCommand::Stop => state.stopped = true,
    }
}
