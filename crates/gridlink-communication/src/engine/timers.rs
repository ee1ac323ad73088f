//! Engine timers
//!
//! The engine never sleeps. It arms deadlines here and the event loop calls
//! back once the earliest one has passed.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Replay history length kept for resend requests
pub const HISTORY_LEN: usize = 20;

/// Every timer the engine can arm. At most one deadline exists per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// First check for device silence after open
    BootWatchdog,
    /// Second check; closes a silent device
    BootFinal,
    /// Quiescence poll
    Quiescence,
    /// Quiet window ending a resend
    ResendQuiet,
    /// Retry after planner back-pressure
    PlannerRetry,
    /// Retry after input buffer back-pressure
    BufferRetry,
    /// Transport open attempt
    Reconnect,
    /// Idle temperature / position poll
    IdlePoll,
    /// Status push to watchers
    StatusPush,
    /// Process exit after a successful flash
    FlashExit,
}

/// Engine time constants
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timing {
    /// Silence allowed after open before a bump boot
    pub boot_watchdog: Duration,
    /// Further silence allowed before the transport is closed
    pub boot_final: Duration,
    /// First quiescence check after the first device line
    pub quiescence_first: Duration,
    /// Quiescence poll interval
    pub quiescence: Duration,
    /// Resend quiet window
    pub resend_quiet: Duration,
    /// Planner back-pressure retry
    pub planner_retry: Duration,
    /// Input buffer back-pressure retry
    pub buffer_retry: Duration,
    /// Reconnect interval
    pub reconnect: Duration,
    /// Idle poll interval
    pub idle_poll: Duration,
    /// Status push interval
    pub status_push: Duration,
    /// Delay before exiting after a flash
    pub flash_exit: Duration,
    /// Age after which temperature / position reports are refreshed
    pub report_age: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            boot_watchdog: Duration::from_secs(2),
            boot_final: Duration::from_secs(2),
            quiescence_first: Duration::from_secs(2),
            quiescence: Duration::from_secs(1),
            resend_quiet: Duration::from_millis(50),
            planner_retry: Duration::from_millis(100),
            buffer_retry: Duration::from_millis(500),
            reconnect: Duration::from_secs(2),
            idle_poll: Duration::from_secs(1),
            status_push: Duration::from_secs(1),
            flash_exit: Duration::from_secs(1),
            report_age: Duration::from_secs(1),
        }
    }
}

/// Armed deadlines
#[derive(Debug, Default)]
pub struct TimerSet {
    deadlines: HashMap<TimerKind, Instant>,
}

impl TimerSet {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `kind`, replacing any existing deadline
    pub fn arm(&mut self, kind: TimerKind, at: Instant) {
        self.deadlines.insert(kind, at);
    }

    /// Disarm `kind`
    pub fn cancel(&mut self, kind: TimerKind) {
        self.deadlines.remove(&kind);
    }

    /// Whether `kind` is armed
    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.deadlines.contains_key(&kind)
    }

    /// Earliest deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Remove and return the earliest timer due at `now`
    pub fn pop_expired(&mut self, now: Instant) -> Option<TimerKind> {
        let (kind, _) = self
            .deadlines
            .iter()
            .filter(|(_, at)| **at <= now)
            .min_by_key(|(_, at)| **at)
            .map(|(k, at)| (*k, *at))?;
        self.deadlines.remove(&kind);
        Some(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn due(timers: &mut TimerSet, now: Instant) -> Vec<TimerKind> {
        std::iter::from_fn(|| timers.pop_expired(now)).collect()
    }

    #[test]
    fn test_rearm_replaces_deadline() {
        let now = Instant::now();
        let mut timers = TimerSet::new();
        timers.arm(TimerKind::Quiescence, now + Duration::from_secs(1));
        timers.arm(TimerKind::Quiescence, now + Duration::from_secs(5));
        assert_eq!(timers.next_deadline(), Some(now + Duration::from_secs(5)));
        assert!(due(&mut timers, now + Duration::from_secs(2)).is_empty());
    }

    #[test]
    fn test_expired_in_deadline_order() {
        let now = Instant::now();
        let mut timers = TimerSet::new();
        timers.arm(TimerKind::Reconnect, now + Duration::from_millis(30));
        timers.arm(TimerKind::ResendQuiet, now + Duration::from_millis(10));
        timers.arm(TimerKind::IdlePoll, now + Duration::from_millis(500));
        let fired = due(&mut timers, now + Duration::from_millis(100));
        assert_eq!(fired, vec![TimerKind::ResendQuiet, TimerKind::Reconnect]);
        assert!(timers.is_armed(TimerKind::IdlePoll));
        timers.cancel(TimerKind::IdlePoll);
        assert_eq!(timers.next_deadline(), None);
    }
}
