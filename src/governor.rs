//! Pacing policy: turns a step result into a scheduling decision and owns the
//! cool-down countdown between steps.
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use crate::model::StepResult;

/// Shortest cool-down, in seconds.
pub const PAUSE_MIN_SECS: u64 = 120;
/// Longest cool-down, in seconds (inclusive).
pub const PAUSE_MAX_SECS: u64 = 180;

const TICK: Duration = Duration::from_secs(1);

/// Source of cool-down durations. Called once per pause.
pub trait PauseSource: Send {
    fn next_pause_secs(&mut self) -> u64;
}

/// Uniform draw over `[PAUSE_MIN_SECS, PAUSE_MAX_SECS]`.
#[derive(Debug)]
pub struct UniformPause {
    rng: StdRng,
}

impl UniformPause {
    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl PauseSource for UniformPause {
    fn next_pause_secs(&mut self) -> u64 {
        self.rng.gen_range(PAUSE_MIN_SECS..=PAUSE_MAX_SECS)
    }
}

/// Always the same duration.
#[derive(Debug, Clone, Copy)]
pub struct FixedPause(pub u64);

impl PauseSource for FixedPause {
    fn next_pause_secs(&mut self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Continue,
    Pause { secs: u64 },
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Remaining(u64),
    Elapsed,
}

/// A one-second countdown. Owning it is owning the timer; dropping it
/// releases the timer.
#[derive(Debug)]
pub struct Countdown {
    remaining: u64,
    ticker: Interval,
}

impl Countdown {
    fn arm(secs: u64) -> Self {
        let mut ticker = interval_at(Instant::now() + TICK, TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            remaining: secs,
            ticker,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    async fn tick(&mut self) -> Tick {
        if self.remaining > 0 {
            self.ticker.tick().await;
            self.remaining -= 1;
        }
        if self.remaining == 0 {
            Tick::Elapsed
        } else {
            Tick::Remaining(self.remaining)
        }
    }
}

pub struct PacingGovernor {
    pauses: Box<dyn PauseSource>,
    timer: Option<Countdown>,
}

impl PacingGovernor {
    pub fn new(pauses: Box<dyn PauseSource>) -> Self {
        Self {
            pauses,
            timer: None,
        }
    }

    /// Production policy: uniform random pauses.
    pub fn uniform() -> Self {
        Self::new(Box::new(UniformPause::from_entropy()))
    }

    /// Draws a fresh duration for every pause.
    pub fn decide(&mut self, result: &StepResult) -> Decision {
        if !result.has_more {
            Decision::Stop
        } else if result.needs_break {
            Decision::Pause {
                secs: self.pauses.next_pause_secs(),
            }
        } else {
            Decision::Continue
        }
    }

    /// Arms the countdown, replacing (and releasing) any previous one.
    pub fn arm(&mut self, secs: u64) {
        self.timer = Some(Countdown::arm(secs));
    }

    pub fn release(&mut self) {
        self.timer = None;
    }

    pub fn is_armed(&self) -> bool {
        self.timer.is_some()
    }

    pub fn remaining(&self) -> Option<u64> {
        self.timer.as_ref().map(Countdown::remaining)
    }

    /// Waits for the next tick of the armed countdown. The countdown is
    /// released once it elapses. With nothing armed this reports `Elapsed`
    /// immediately.
    pub async fn tick(&mut self) -> Tick {
        let tick = match self.timer.as_mut() {
            Some(timer) => timer.tick().await,
            None => Tick::Elapsed,
        };
        if tick == Tick::Elapsed {
            self.release();
        }
        tick
    }
}

impl std::fmt::Debug for PacingGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacingGovernor")
            .field("timer", &self.timer)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Cursor;

    fn result(has_more: bool, needs_break: bool) -> StepResult {
        StepResult {
            records_approved: 1,
            messages_sent: 1,
            messages_skipped: 0,
            next_cursor: Cursor { offset: 1, cumulative_sent: 1 },
            has_more,
            needs_break,
        }
    }

    #[test]
    fn decisions_follow_flags() {
        let mut gov = PacingGovernor::new(Box::new(FixedPause(130)));
        assert_eq!(gov.decide(&result(false, false)), Decision::Stop);
        assert_eq!(gov.decide(&result(false, true)), Decision::Stop);
        assert_eq!(gov.decide(&result(true, false)), Decision::Continue);
        assert_eq!(gov.decide(&result(true, true)), Decision::Pause { secs: 130 });
    }

    #[test]
    fn uniform_pauses_stay_in_bounds_and_vary() {
        let mut gov = PacingGovernor::new(Box::new(UniformPause::seeded(7)));
        let mut seen = std::collections::HashSet::new();
        for _ in 0..500 {
            match gov.decide(&result(true, true)) {
                Decision::Pause { secs } => {
                    assert!((PAUSE_MIN_SECS..=PAUSE_MAX_SECS).contains(&secs), "{secs}");
                    seen.insert(secs);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(seen.len() > 1, "pause duration must be drawn per pause");
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_ticks_once_per_second() {
        let mut gov = PacingGovernor::new(Box::new(FixedPause(3)));
        gov.arm(3);
        assert_eq!(gov.remaining(), Some(3));

        let start = Instant::now();
        assert_eq!(gov.tick().await, Tick::Remaining(2));
        assert_eq!(gov.tick().await, Tick::Remaining(1));
        assert_eq!(gov.tick().await, Tick::Elapsed);
        assert_eq!(start.elapsed(), Duration::from_secs(3));
        assert!(!gov.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_pause_elapses_without_waiting() {
        let mut gov = PacingGovernor::new(Box::new(FixedPause(0)));
        gov.arm(0);
        let start = Instant::now();
        assert_eq!(gov.tick().await, Tick::Elapsed);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn release_drops_the_timer() {
        let mut gov = PacingGovernor::uniform();
        gov.arm(150);
        assert!(gov.is_armed());
        gov.release();
        assert!(!gov.is_armed());
        assert_eq!(gov.remaining(), None);
    }
}
