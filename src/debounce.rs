//! Per-game evaluation timer: `Idle -> Pending -> Evaluating -> Idle`.
//!
//! Pure logic over [`tokio::time::Instant`], so paused-clock tests can drive it.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Idle,
    /// An evaluation is due at `deadline`; `is_retry` marks the single follow-up run.
    Pending { deadline: Instant, is_retry: bool },
    Evaluating { is_retry: bool },
}

#[derive(Debug, Clone, Copy)]
pub struct DebounceTimer {
    state: TimerState,
    debounce: Duration,
    cooldown: Duration,
    retry_delay: Duration,
    last_run: Option<Instant>,
    /// An event arrived while evaluating.
    dirty: bool,
}

impl DebounceTimer {
    pub fn new(debounce: Duration, cooldown: Duration, retry_delay: Duration) -> Self {
        Self {
            state: TimerState::Idle,
            debounce,
            cooldown,
            retry_delay,
            last_run: None,
            dirty: false,
        }
    }

    pub fn state(&self) -> TimerState {
        self.state
    }

    fn earliest_run(&self, now: Instant) -> Instant {
        let debounced = now + self.debounce;
        match self.last_run {
            Some(last) => debounced.max(last + self.cooldown),
            None => debounced,
        }
    }

    /// A relevant filesystem event; bursts push the deadline out.
    pub fn on_event(&mut self, now: Instant) {
        match self.state {
            TimerState::Evaluating { .. } => self.dirty = true,
            TimerState::Idle | TimerState::Pending { .. } => {
                self.state = TimerState::Pending {
                    deadline: self.earliest_run(now),
                    is_retry: false,
                };
            }
        }
    }

    /// A periodic poll for sources without change events. Never schedules a retry.
    pub fn on_poll(&mut self, now: Instant) {
        if self.state == TimerState::Idle {
            self.state = TimerState::Pending {
                deadline: self.earliest_run(now),
                is_retry: true,
            };
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            TimerState::Pending { deadline, .. } => Some(deadline),
            _ => None,
        }
    }

    /// Move to `Evaluating` if the deadline has passed; returns whether to evaluate now.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.state {
            TimerState::Pending { deadline, is_retry } if now >= deadline => {
                self.state = TimerState::Evaluating { is_retry };
                true
            }
            _ => false,
        }
    }

    /// Record the outcome of an evaluation. An unchanged result from a first run
    /// schedules exactly one retry.
    pub fn finish(&mut self, now: Instant, changed: bool) {
        let is_retry = match self.state {
            TimerState::Evaluating { is_retry } => is_retry,
            _ => return,
        };
        self.last_run = Some(now);

        if std::mem::take(&mut self.dirty) {
            self.state = TimerState::Pending {
                deadline: self.earliest_run(now),
                is_retry: false,
            };
        } else if !changed && !is_retry {
            self.state = TimerState::Pending {
                deadline: now + self.retry_delay,
                is_retry: true,
            };
        } else {
            self.state = TimerState::Idle;
        }
    }

    pub fn cancel(&mut self) {
        self.state = TimerState::Idle;
        self.dirty = false;
    }
}
