//! Folding of step results into cumulative run progress.
use chrono::Utc;
use thiserror::Error;

use crate::governor::Decision;
use crate::model::{Phase, RunProgress, StepResult};

/// A step result that would break the run's ordering guarantees if folded.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContractViolation {
    #[error("cursor did not advance past offset {offset} although more work remains")]
    StalledCursor { offset: u64 },
    #[error("cursor moved backwards from offset {from} to {to}")]
    CursorRegressed { from: u64, to: u64 },
    #[error("cumulative sent count dropped from {from} to {to}")]
    SentCountRegressed { from: u64, to: u64 },
}

impl RunProgress {
    /// Checks `result` against the current state without changing anything.
    pub fn check(&self, result: &StepResult) -> Result<(), ContractViolation> {
        let from = self.current_cursor.offset;
        let to = result.next_cursor.offset;
        if to < from {
            return Err(ContractViolation::CursorRegressed { from, to });
        }
        if result.has_more && to == from {
            return Err(ContractViolation::StalledCursor { offset: from });
        }
        if result.messages_sent < self.total_sent_messages {
            return Err(ContractViolation::SentCountRegressed {
                from: self.total_sent_messages,
                to: result.messages_sent,
            });
        }
        Ok(())
    }

    /// Folds one step result. On a contract violation nothing is changed.
    pub fn fold(&mut self, result: &StepResult, decision: Decision) -> Result<(), ContractViolation> {
        self.check(result)?;

        self.total_approved += result.records_approved;
        self.total_sent_messages = result.messages_sent;
        self.total_skipped_messages += result.messages_skipped;
        self.current_cursor = result.next_cursor;
        self.steps += 1;
        self.phase = match decision {
            Decision::Continue => Phase::Running,
            Decision::Pause { secs } => {
                self.pauses += 1;
                Phase::Cooling {
                    remaining_secs: secs,
                }
            }
            Decision::Stop => Phase::Completed,
        };
        if self.phase.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Moves an active run into `phase` (which must be terminal). Returns
    /// false when the run had already finished.
    pub fn finish(&mut self, phase: Phase) -> bool {
        debug_assert!(phase.is_terminal());
        if !self.phase.is_active() {
            return false;
        }
        self.phase = phase;
        self.finished_at = Some(Utc::now());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Cursor;

    fn step(approved: u64, sent: u64, skipped: u64, next: u64, has_more: bool) -> StepResult {
        StepResult {
            records_approved: approved,
            messages_sent: sent,
            messages_skipped: skipped,
            next_cursor: Cursor { offset: next, cumulative_sent: sent },
            has_more,
            needs_break: false,
        }
    }

    fn running() -> RunProgress {
        let mut p = RunProgress::idle();
        p.phase = Phase::Running;
        p
    }

    #[test]
    fn fold_accumulates_and_overwrites_sent() {
        let mut p = running();
        p.fold(&step(20, 18, 2, 20, true), Decision::Continue).unwrap();
        p.fold(&step(15, 31, 1, 35, true), Decision::Pause { secs: 140 }).unwrap();

        assert_eq!(p.total_approved, 35);
        assert_eq!(p.total_sent_messages, 31);
        assert_eq!(p.total_skipped_messages, 3);
        assert_eq!(p.current_cursor, Cursor { offset: 35, cumulative_sent: 31 });
        assert_eq!(p.phase, Phase::Cooling { remaining_secs: 140 });
        assert_eq!(p.steps, 2);
        assert_eq!(p.pauses, 1);
        assert!(p.finished_at.is_none());

        p.fold(&step(5, 36, 0, 40, false), Decision::Stop).unwrap();
        assert_eq!(p.phase, Phase::Completed);
        assert_eq!(p.total_approved, 40);
        assert!(p.finished_at.is_some());
    }

    #[test]
    fn final_step_may_keep_the_cursor() {
        let mut p = running();
        p.fold(&step(0, 0, 0, 0, false), Decision::Stop).unwrap();
        assert_eq!(p.phase, Phase::Completed);
    }

    #[test]
    fn stalled_cursor_rejected_without_mutation() {
        let mut p = running();
        p.fold(&step(10, 10, 0, 10, true), Decision::Continue).unwrap();
        let before = p.clone();

        let err = p.fold(&step(10, 20, 0, 10, true), Decision::Continue).unwrap_err();
        assert_eq!(err, ContractViolation::StalledCursor { offset: 10 });
        assert_eq!(p, before);
    }

    #[test]
    fn regressions_rejected() {
        let mut p = running();
        p.fold(&step(10, 10, 0, 10, true), Decision::Continue).unwrap();

        assert_eq!(
            p.check(&step(1, 11, 0, 5, true)),
            Err(ContractViolation::CursorRegressed { from: 10, to: 5 })
        );
        assert_eq!(
            p.check(&step(1, 9, 0, 11, true)),
            Err(ContractViolation::SentCountRegressed { from: 10, to: 9 })
        );
    }

    #[test]
    fn finish_only_once() {
        let mut p = running();
        assert!(p.finish(Phase::Cancelled));
        let at = p.finished_at;
        assert!(!p.finish(Phase::Failed { reason: "late".into() }));
        assert_eq!(p.phase, Phase::Cancelled);
        assert_eq!(p.finished_at, at);

        let mut idle = RunProgress::idle();
        assert!(!idle.finish(Phase::Cancelled));
        assert_eq!(idle.phase, Phase::Idle);
    }
}
