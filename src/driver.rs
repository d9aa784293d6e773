//! The batch driver: runs one paced approval run as an explicit state machine.
//!
//! A run lives on a single tokio task. The task is only ever suspended in one
//! of two places: awaiting a step (`Running`) or awaiting a countdown tick
//! (`Cooling`). Both waits race the run's cancellation token, so a cancelled
//! run drops any in-flight step future unheard.
//!
//! A step is admitted under `issue_gate`, the same lock `cancel` holds while it
//! publishes `Cancelled`: the step's first poll happens under the gate, so no
//! step is entered once `cancel` has returned.
use anyhow::Result;
use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::StepClient;
use crate::governor::{Decision, PacingGovernor, Tick};
use crate::model::{Cursor, Phase, RunProgress, StepResult, WorkTarget};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("run already started (phase: {0})")]
    AlreadyStarted(Phase),
    #[error("run has not been started")]
    NotStarted,
    #[error("progress channel closed")]
    Closed,
}

pub struct BatchDriver {
    client: Arc<dyn StepClient>,
    governor: Option<PacingGovernor>,
    progress: Arc<watch::Sender<RunProgress>>,
    cancel: CancellationToken,
    issue_gate: Arc<Mutex<()>>,
}

impl BatchDriver {
    pub fn new(client: Arc<dyn StepClient>, governor: PacingGovernor) -> Self {
        let (progress, _) = watch::channel(RunProgress::idle());
        Self {
            client,
            governor: Some(governor),
            progress: Arc::new(progress),
            cancel: CancellationToken::new(),
            issue_gate: Arc::new(Mutex::new(())),
        }
    }

    pub fn snapshot(&self) -> RunProgress {
        self.progress.borrow().clone()
    }

    /// Receives a new snapshot after every change.
    pub fn subscribe(&self) -> watch::Receiver<RunProgress> {
        self.progress.subscribe()
    }

    /// Starts the run on a new tokio task. Only legal once, from `Idle`.
    pub fn start(&mut self, target: WorkTarget) -> Result<(), DriverError> {
        let Some(governor) = self.governor.take() else {
            return Err(DriverError::AlreadyStarted(self.snapshot().phase));
        };

        self.progress.send_modify(|p| {
            p.target = Some(target.clone());
            p.current_cursor = Cursor::ZERO;
            p.phase = Phase::Running;
            p.started_at = Some(Utc::now());
        });
        let run_id = self.progress.borrow().run_id;
        info!(%run_id, %target, "starting approval run");

        let run = Run {
            target,
            client: Arc::clone(&self.client),
            governor,
            progress: Arc::clone(&self.progress),
            cancel: self.cancel.clone(),
            issue_gate: Arc::clone(&self.issue_gate),
        };
        tokio::spawn(run.drive());
        Ok(())
    }

    /// Cancels an active run. A no-op when idle or already finished.
    pub fn cancel(&self) {
        let cancelled = {
            let _gate = self.issue_gate.lock();
            let cancelled = self.progress.send_if_modified(|p| p.finish(Phase::Cancelled));
            if cancelled {
                self.cancel.cancel();
            }
            cancelled
        };
        if cancelled {
            let p = self.progress.borrow();
            info!(
                run_id = %p.run_id,
                total_approved = p.total_approved,
                offset = p.current_cursor.offset,
                "approval run cancelled"
            );
        }
    }

    /// Resolves with the final snapshot once the run reaches a terminal phase.
    pub async fn wait(&self) -> Result<RunProgress, DriverError> {
        let mut rx = self.subscribe();
        if rx.borrow_and_update().phase == Phase::Idle {
            return Err(DriverError::NotStarted);
        }
        let done = rx
            .wait_for(|p| p.phase.is_terminal())
            .await
            .map_err(|_| DriverError::Closed)?;
        Ok(done.clone())
    }
}

impl Drop for BatchDriver {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for BatchDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchDriver")
            .field("progress", &*self.progress.borrow())
            .finish_non_exhaustive()
    }
}

enum Event {
    Step(Result<StepResult>),
    Tick(Tick),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    IssueStep,
    AwaitTimer,
    Halt,
}

struct Run {
    target: WorkTarget,
    client: Arc<dyn StepClient>,
    governor: PacingGovernor,
    progress: Arc<watch::Sender<RunProgress>>,
    cancel: CancellationToken,
    issue_gate: Arc<Mutex<()>>,
}

impl Run {
    async fn drive(mut self) {
        let cancel = self.cancel.clone();
        let mut next = Next::IssueStep;
        loop {
            let event = match next {
                Next::IssueStep => {
                    let cursor = self.progress.borrow().current_cursor;
                    let mut step = self.client.execute_step(&self.target, cursor);
                    let first = {
                        let _gate = self.issue_gate.lock();
                        if cancel.is_cancelled() || !self.progress.borrow().phase.is_active() {
                            debug!(offset = cursor.offset, "run no longer active; step not issued");
                            break;
                        }
                        debug!(offset = cursor.offset, cumulative_sent = cursor.cumulative_sent, "issuing step");
                        step.as_mut().now_or_never()
                    };
                    match first {
                        Some(res) => Event::Step(res),
                        None => tokio::select! {
                            biased;
                            _ = cancel.cancelled() => {
                                debug!(offset = cursor.offset, "discarding in-flight step");
                                break;
                            }
                            res = step.as_mut() => Event::Step(res),
                        },
                    }
                }
                Next::AwaitTimer => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        tick = self.governor.tick() => Event::Tick(tick),
                    }
                }
                Next::Halt => break,
            };
            next = self.advance(event);
        }
        self.governor.release();
    }

    /// The single transition function of the run.
    fn advance(&mut self, event: Event) -> Next {
        match event {
            Event::Step(Ok(result)) => {
                let governor = &mut self.governor;
                let mut outcome = None;
                self.progress.send_if_modified(|p| {
                    if !p.phase.is_active() {
                        return false;
                    }
                    // Only accepted results draw a pause duration.
                    let folded = p.check(&result).and_then(|()| {
                        let decision = governor.decide(&result);
                        p.fold(&result, decision).map(|()| decision)
                    });
                    if let Err(violation) = &folded {
                        p.finish(Phase::Failed {
                            reason: violation.to_string(),
                        });
                    }
                    outcome = Some(folded);
                    true
                });
                let decision = match outcome {
                    None => return Next::Halt,
                    Some(Err(violation)) => {
                        warn!(%violation, "malformed step result; failing run");
                        return Next::Halt;
                    }
                    Some(Ok(decision)) => decision,
                };

                let p = self.progress.borrow().clone();
                debug!(
                    total_approved = p.total_approved,
                    total_sent = p.total_sent_messages,
                    total_skipped = p.total_skipped_messages,
                    offset = p.current_cursor.offset,
                    "step folded"
                );
                match decision {
                    Decision::Continue => Next::IssueStep,
                    Decision::Pause { secs } => {
                        info!(secs, offset = p.current_cursor.offset, "cooling down before next step");
                        self.governor.arm(secs);
                        Next::AwaitTimer
                    }
                    Decision::Stop => {
                        info!(
                            run_id = %p.run_id,
                            total_approved = p.total_approved,
                            total_sent = p.total_sent_messages,
                            total_skipped = p.total_skipped_messages,
                            steps = p.steps,
                            "approval run completed"
                        );
                        Next::Halt
                    }
                }
            }
            Event::Step(Err(err)) => {
                let reason = format!("{err:#}");
                if self.progress.send_if_modified(|p| p.finish(Phase::Failed { reason: reason.clone() })) {
                    warn!(%reason, "step failed; approval run aborted");
                }
                Next::Halt
            }
            Event::Tick(Tick::Remaining(secs)) => {
                let cooling = self.progress.send_if_modified(|p| match p.phase {
                    Phase::Cooling { .. } => {
                        p.phase = Phase::Cooling { remaining_secs: secs };
                        true
                    }
                    _ => false,
                });
                if cooling {
                    Next::AwaitTimer
                } else {
                    Next::Halt
                }
            }
            Event::Tick(Tick::Elapsed) => {
                let resumed = self.progress.send_if_modified(|p| match p.phase {
                    Phase::Cooling { .. } => {
                        p.phase = Phase::Running;
                        true
                    }
                    _ => false,
                });
                if resumed {
                    debug!("cool-down elapsed");
                    Next::IssueStep
                } else {
                    Next::Halt
                }
            }
        }
    }
}
