//! The breaker state machine, kept synchronous so transitions are
//! testable without a runtime. The registry drives it under a mutex.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::BreakerConfig;

/// Externally visible circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum CoreState {
    Closed,
    Open { opened_at: Instant },
    // The trial slot is stamped, not flagged: a trial that is dropped
    // before settling (caller disconnect) is reclaimed by a later
    // arrival once the call timeout has lapsed.
    HalfOpen { trial_started: Instant },
}

/// Whether a call may proceed, decided before the future is polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Admit { trial: bool },
    Reject { retry_in: Duration },
}

/// A state change the registry should publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    Opened,
    HalfOpened,
    Closed,
}

/// Rolling window plus state. One per dependency.
pub(crate) struct BreakerCore {
    config: BreakerConfig,
    state: CoreState,
    // (recorded_at, success)
    samples: VecDeque<(Instant, bool)>,
}

impl BreakerCore {
    pub(crate) fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: CoreState::Closed,
            samples: VecDeque::new(),
        }
    }

    pub(crate) fn kind(&self) -> StateKind {
        match self.state {
            CoreState::Closed => StateKind::Closed,
            CoreState::Open { .. } => StateKind::Open,
            CoreState::HalfOpen { .. } => StateKind::HalfOpen,
        }
    }

    /// Decide admission for a call arriving at `now`. An open breaker
    /// whose reset timeout has elapsed moves to half-open and admits
    /// exactly one trial; concurrent arrivals are rejected until the
    /// trial settles or its call timeout lapses, whichever comes first.
    pub(crate) fn begin(&mut self, now: Instant) -> (Admission, Option<Transition>) {
        match self.state {
            CoreState::Closed => (Admission::Admit { trial: false }, None),
            CoreState::Open { opened_at } => {
                let elapsed = now.duration_since(opened_at);
                if elapsed >= self.config.reset_timeout {
                    self.state = CoreState::HalfOpen { trial_started: now };
                    (Admission::Admit { trial: true }, Some(Transition::HalfOpened))
                } else {
                    (
                        Admission::Reject {
                            retry_in: self.config.reset_timeout - elapsed,
                        },
                        None,
                    )
                }
            }
            CoreState::HalfOpen { trial_started } => {
                let elapsed = now.duration_since(trial_started);
                if elapsed < self.config.call_timeout {
                    (
                        Admission::Reject {
                            retry_in: self.config.call_timeout - elapsed,
                        },
                        None,
                    )
                } else {
                    // An in-flight trial always settles within the call
                    // timeout; past it the slot belongs to nobody and
                    // this caller takes it over.
                    self.state = CoreState::HalfOpen { trial_started: now };
                    (Admission::Admit { trial: true }, None)
                }
            }
        }
    }

    pub(crate) fn on_success(&mut self, now: Instant, trial: bool) -> Option<Transition> {
        if trial {
            self.state = CoreState::Closed;
            self.samples.clear();
            return Some(Transition::Closed);
        }
        self.record(now, true);
        None
    }

    pub(crate) fn on_failure(&mut self, now: Instant, trial: bool) -> Option<Transition> {
        if trial {
            self.state = CoreState::Open { opened_at: now };
            return Some(Transition::Opened);
        }
        self.record(now, false);
        if matches!(self.state, CoreState::Closed) && self.should_trip() {
            self.state = CoreState::Open { opened_at: now };
            return Some(Transition::Opened);
        }
        None
    }

    fn record(&mut self, now: Instant, success: bool) {
        self.samples.push_back((now, success));
        self.prune(now);
    }

    fn prune(&mut self, now: Instant) {
        let horizon = self.config.window;
        while let Some(&(at, _)) = self.samples.front() {
            if now.duration_since(at) > horizon {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn should_trip(&self) -> bool {
        if self.samples.len() < self.config.volume_threshold {
            return false;
        }
        self.failure_rate() >= self.config.error_threshold_pct
    }

    pub(crate) fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub(crate) fn failure_rate(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let failures = self.samples.iter().filter(|(_, ok)| !ok).count();
        failures as f64 * 100.0 / self.samples.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BreakerConfig {
        BreakerConfig {
            call_timeout: Duration::from_secs(1),
            error_threshold_pct: 50.0,
            window: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(30),
            volume_threshold: 10,
        }
    }

    #[test]
    fn stays_closed_below_volume_threshold() {
        let mut core = BreakerCore::new(config());
        let now = Instant::now();
        // 9 straight failures: 100% error rate but under the volume floor.
        for _ in 0..9 {
            assert_eq!(core.on_failure(now, false), None);
        }
        assert_eq!(core.kind(), StateKind::Closed);
    }

    #[test]
    fn trips_at_volume_with_rate_over_threshold() {
        let mut core = BreakerCore::new(config());
        let now = Instant::now();
        for _ in 0..4 {
            core.on_success(now, false);
        }
        for _ in 0..5 {
            assert_eq!(core.on_failure(now, false), None);
        }
        // Tenth sample, sixth failure: 60% ≥ 50% at volume 10.
        assert_eq!(core.on_failure(now, false), Some(Transition::Opened));
        assert_eq!(core.kind(), StateKind::Open);
    }

    #[test]
    fn stays_closed_when_rate_is_under_threshold() {
        let mut core = BreakerCore::new(config());
        let now = Instant::now();
        for _ in 0..8 {
            core.on_success(now, false);
        }
        for _ in 0..4 {
            assert_eq!(core.on_failure(now, false), None);
        }
        assert_eq!(core.kind(), StateKind::Closed);
    }

    #[test]
    fn open_rejects_until_reset_timeout() {
        let mut core = BreakerCore::new(config());
        let now = Instant::now();
        for _ in 0..10 {
            core.on_failure(now, false);
        }

        let (admission, transition) = core.begin(now + Duration::from_secs(1));
        assert!(matches!(admission, Admission::Reject { .. }));
        assert_eq!(transition, None);
    }

    #[test]
    fn half_open_admits_a_single_trial() {
        let mut core = BreakerCore::new(config());
        let now = Instant::now();
        for _ in 0..10 {
            core.on_failure(now, false);
        }

        let after_reset = now + Duration::from_secs(31);
        let (admission, transition) = core.begin(after_reset);
        assert_eq!(admission, Admission::Admit { trial: true });
        assert_eq!(transition, Some(Transition::HalfOpened));

        // A concurrent caller while the trial is in flight.
        let (admission, _) = core.begin(after_reset);
        assert!(matches!(admission, Admission::Reject { .. }));
    }

    #[test]
    fn abandoned_trial_slot_is_reclaimed_after_call_timeout() {
        let mut core = BreakerCore::new(config());
        let now = Instant::now();
        for _ in 0..10 {
            core.on_failure(now, false);
        }
        let after_reset = now + Duration::from_secs(31);
        let (admission, _) = core.begin(after_reset);
        assert_eq!(admission, Admission::Admit { trial: true });

        // The trial never settles. Within its call timeout the slot is
        // still reserved.
        let (admission, _) = core.begin(after_reset + Duration::from_millis(500));
        assert!(matches!(admission, Admission::Reject { .. }));

        // Past the call timeout the next arrival takes over the trial.
        let (admission, _) = core.begin(after_reset + Duration::from_secs(2));
        assert_eq!(admission, Admission::Admit { trial: true });
        assert_eq!(core.kind(), StateKind::HalfOpen);

        // And that trial can still close the circuit.
        let settled_at = after_reset + Duration::from_secs(2);
        assert_eq!(core.on_success(settled_at, true), Some(Transition::Closed));
    }

    #[test]
    fn trial_success_closes_and_clears_window() {
        let mut core = BreakerCore::new(config());
        let now = Instant::now();
        for _ in 0..10 {
            core.on_failure(now, false);
        }
        let after_reset = now + Duration::from_secs(31);
        core.begin(after_reset);

        assert_eq!(core.on_success(after_reset, true), Some(Transition::Closed));
        assert_eq!(core.kind(), StateKind::Closed);
        assert_eq!(core.sample_count(), 0);
    }

    #[test]
    fn trial_failure_reopens_with_restarted_timer() {
        let mut core = BreakerCore::new(config());
        let now = Instant::now();
        for _ in 0..10 {
            core.on_failure(now, false);
        }
        let after_reset = now + Duration::from_secs(31);
        core.begin(after_reset);
        assert_eq!(core.on_failure(after_reset, true), Some(Transition::Opened));

        // Timer restarted: still rejecting 29s after the reopen.
        let (admission, _) = core.begin(after_reset + Duration::from_secs(29));
        assert!(matches!(admission, Admission::Reject { .. }));
        // Admits again a full reset period later.
        let (admission, _) = core.begin(after_reset + Duration::from_secs(31));
        assert_eq!(admission, Admission::Admit { trial: true });
    }

    #[test]
    fn old_samples_fall_out_of_the_window() {
        let mut core = BreakerCore::new(config());
        let now = Instant::now();
        for _ in 0..9 {
            core.on_failure(now, false);
        }
        // A tenth failure far in the future finds the window drained.
        let later = now + Duration::from_secs(120);
        assert_eq!(core.on_failure(later, false), None);
        assert_eq!(core.kind(), StateKind::Closed);
        assert_eq!(core.sample_count(), 1);
    }
}
