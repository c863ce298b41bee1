//! Step timers.
//!
//! One timeout is armed at a time, for the step that owns the current wait:
//! Propose (no proposal yet), PrevoteWait / PrecommitWait (votes disagree),
//! NewHeight (pause before the next propose). The scheduler captures the
//! (step, round) coordinate so a late firing can be recognized as stale.

use {
    crate::{config::ConsensusConfig, types::Step},
    std::time::{Duration, Instant},
};

#[derive(Debug)]
pub struct TimeoutScheduler {
    config: ConsensusConfig,
    started_at: Option<Instant>,
    active: Option<(Step, u32)>,
}

impl TimeoutScheduler {
    pub fn new(config: ConsensusConfig) -> Self {
        Self {
            config,
            started_at: None,
            active: None,
        }
    }

    /// Duration of the timer a step owns, or `None` for steps that only
    /// advance on messages.
    pub fn duration_for(&self, step: Step, round: u32) -> Option<Duration> {
        match step {
            Step::Propose => Some(self.config.timeout_propose(round)),
            Step::PrevoteWait => Some(self.config.timeout_prevote()),
            Step::PrecommitWait => Some(self.config.timeout_precommit()),
            Step::NewHeight => Some(self.config.timeout_commit()),
            _ => None,
        }
    }

    /// Arm the timer for `(step, round)`; steps without a timer disarm.
    pub fn start(&mut self, step: Step, round: u32) {
        if self.duration_for(step, round).is_some() {
            self.started_at = Some(Instant::now());
            self.active = Some((step, round));
        } else {
            self.cancel();
        }
    }

    pub fn cancel(&mut self) {
        self.started_at = None;
        self.active = None;
    }

    /// The expired (step, round), if the armed timer has fired.
    pub fn check_expired(&self) -> Option<(Step, u32)> {
        let started_at = self.started_at?;
        let (step, round) = self.active?;
        let duration = self.duration_for(step, round)?;
        (started_at.elapsed() >= duration).then_some((step, round))
    }

    /// Time left on the armed timer; `Duration::ZERO` when already expired.
    pub fn remaining(&self) -> Option<Duration> {
        let started_at = self.started_at?;
        let (step, round) = self.active?;
        let duration = self.duration_for(step, round)?;
        Some(duration.saturating_sub(started_at.elapsed()))
    }

    pub fn active(&self) -> Option<(Step, u32)> {
        self.active
    }
}

#[cfg(test)]
mod tests {
    use {super::*, std::thread::sleep};

    fn quick_config() -> ConsensusConfig {
        ConsensusConfig {
            timeout_propose_ms: 10,
            timeout_propose_delta_ms: 5,
            timeout_prevote_ms: 10,
            timeout_precommit_ms: 10,
            timeout_commit_ms: 10,
            ..Default::default()
        }
    }

    #[test]
    fn test_propose_timeout_grows_with_round() {
        let sched = TimeoutScheduler::new(quick_config());
        let d0 = sched.duration_for(Step::Propose, 0).unwrap();
        let d3 = sched.duration_for(Step::Propose, 3).unwrap();
        assert!(d3 > d0);
    }

    #[test]
    fn test_message_driven_steps_have_no_timer() {
        let mut sched = TimeoutScheduler::new(quick_config());
        for step in [
            Step::PrePropose,
            Step::Prevote,
            Step::Precommit,
            Step::Commit,
            Step::TransactionWait,
        ] {
            assert!(sched.duration_for(step, 0).is_none());
            sched.start(step, 0);
            assert!(sched.active().is_none());
        }
    }

    #[test]
    fn test_expiry_carries_coordinate() {
        let mut sched = TimeoutScheduler::new(quick_config());
        sched.start(Step::PrevoteWait, 2);
        assert!(sched.check_expired().is_none());
        sleep(Duration::from_millis(20));
        assert_eq!(sched.check_expired(), Some((Step::PrevoteWait, 2)));
    }

    #[test]
    fn test_cancel() {
        let mut sched = TimeoutScheduler::new(quick_config());
        sched.start(Step::Propose, 0);
        sched.cancel();
        sleep(Duration::from_millis(20));
        assert!(sched.check_expired().is_none());
        assert!(sched.remaining().is_none());
    }

    #[test]
    fn test_rearming_replaces_previous_timer() {
        let mut sched = TimeoutScheduler::new(quick_config());
        sched.start(Step::Propose, 0);
        sched.start(Step::PrecommitWait, 1);
        assert_eq!(sched.active(), Some((Step::PrecommitWait, 1)));
    }
}
