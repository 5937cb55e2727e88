// src/failover/state.rs

//! Per-candidate-host verification state and failover progress reporting.

use crate::config::{FailoverConfig, HostInfo};
use crate::core::FabricError;
use crate::core::events::{EventBus, FailoverProgress};
use std::sync::Arc;

/// Verification stages a candidate host advances through. The state only
/// moves forward; any stage error resets to `NotConnected` (the TCP state
/// is unknown after a failure, so a fresh connect is mandatory) until the
/// stage's retry budget is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum VerificationState {
    NotConnected,
    Connected,
    SmListChecked,
    PmChecked,
    Successful,
    Unsuccessful,
}

/// Percentage budget pre-allocated to each stage. Partial retries within a
/// stage produce partial progress out of that stage's budget.
const CONNECT_BUDGET: u32 = 30;
const SM_BUDGET: u32 = 30;
const PM_BUDGET: u32 = 30;

/// Progress of one candidate host during failover.
#[derive(Debug)]
pub struct HostStatus {
    /// Position in the candidate ordering (for logging only).
    pub ordinal: usize,
    /// Index of this host in the subnet's configured host list.
    pub host_index: usize,
    pub host: HostInfo,
    pub state: VerificationState,
    pub connect_attempts: u32,
    pub sm_attempts: u32,
    pub pm_attempts: u32,
    pub last_error: Option<FabricError>,
    connect_retries: u32,
    sm_retries: u32,
    pm_retries: u32,
}

impl HostStatus {
    pub fn new(ordinal: usize, host_index: usize, host: HostInfo, config: &FailoverConfig) -> Self {
        Self {
            ordinal,
            host_index,
            host,
            state: VerificationState::NotConnected,
            connect_attempts: 0,
            sm_attempts: 0,
            pm_attempts: 0,
            last_error: None,
            connect_retries: config.connect_retries.max(1),
            sm_retries: config.sm_list_retries.max(1),
            pm_retries: config.pm_retries.max(1),
        }
    }

    /// This host's verification progress as a percentage. Completed stages
    /// contribute their whole budget; the current stage contributes its
    /// budget scaled by retries already burned.
    pub fn percent(&self) -> u8 {
        let raw = match self.state {
            VerificationState::NotConnected => {
                CONNECT_BUDGET * self.connect_attempts / self.connect_retries
            }
            VerificationState::Connected => {
                CONNECT_BUDGET + SM_BUDGET * self.sm_attempts / self.sm_retries
            }
            VerificationState::SmListChecked => {
                CONNECT_BUDGET + SM_BUDGET + PM_BUDGET * self.pm_attempts / self.pm_retries
            }
            VerificationState::PmChecked => CONNECT_BUDGET + SM_BUDGET + PM_BUDGET,
            VerificationState::Successful => 100,
            VerificationState::Unsuccessful => {
                CONNECT_BUDGET + SM_BUDGET + PM_BUDGET
            }
        };
        raw.min(100) as u8
    }
}

/// Publishes failover progress, enforcing two properties: the sequence is
/// non-decreasing across the whole run (even when a later candidate host
/// starts its stages over), and nothing reaches 100 before the terminal
/// report.
pub struct ProgressTracker {
    events: Arc<EventBus>,
    percent: u8,
    finished: bool,
}

impl ProgressTracker {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            events,
            percent: 0,
            finished: false,
        }
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }

    /// Reports intermediate progress, clamped to `99` so only [`Self::finish`]
    /// can emit the terminal value.
    pub fn report(&mut self, raw: u8, message: impl Into<String>) {
        if self.finished {
            return;
        }
        self.percent = self.percent.max(raw.min(99));
        self.events.publish_progress(FailoverProgress {
            percent: self.percent,
            message: message.into(),
        });
    }

    /// Emits the terminal `100` report, exactly once, whatever the outcome.
    pub fn finish(&mut self, message: impl Into<String>) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.percent = 100;
        self.events.publish_progress(FailoverProgress {
            percent: 100,
            message: message.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(config: &FailoverConfig) -> HostStatus {
        HostStatus::new(0, 0, HostInfo::new("fe-a", 3245), config)
    }

    #[test]
    fn stage_budgets_accumulate() {
        let config = FailoverConfig::default();
        let mut s = status(&config);
        assert_eq!(s.percent(), 0);

        // One of three connect attempts burned: a third of the 30% budget.
        s.connect_attempts = 1;
        assert_eq!(s.percent(), 10);

        s.state = VerificationState::Connected;
        assert_eq!(s.percent(), 30);
        s.sm_attempts = 1;
        assert_eq!(s.percent(), 45);

        s.state = VerificationState::SmListChecked;
        assert_eq!(s.percent(), 60);

        s.state = VerificationState::PmChecked;
        assert_eq!(s.percent(), 90);

        s.state = VerificationState::Successful;
        assert_eq!(s.percent(), 100);
    }

    #[test]
    fn tracker_is_monotone_and_caps_at_99() {
        let events = Arc::new(EventBus::new());
        let mut rx = events.subscribe_progress();
        let mut tracker = ProgressTracker::new(events);

        tracker.report(45, "stage done");
        // A later host starting over must not regress the published value.
        tracker.report(10, "next candidate");
        tracker.report(100, "never terminal via report");
        tracker.finish("done");
        tracker.report(50, "ignored after finish");

        let mut seen = Vec::new();
        while let Ok(p) = rx.try_recv() {
            seen.push(p.percent);
        }
        assert_eq!(seen, vec![45, 45, 99, 100]);
        for pair in seen.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
    }
}
