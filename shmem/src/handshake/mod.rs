//! Turn-taking state machine and the wall-clock poller behind it.
//!
//! The session feeds every observation of the control flags through
//! [`TurnState::on`]; nothing else decides what state a side is in.

use std::hint;
use std::thread;
use std::time::{Duration, Instant};

use crate::core::ShmemConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    /// Constructed, flags not yet observed.
    Idle,
    /// Waiting for the peer to hand control back.
    Blocked,
    /// Holds control; payload access is allowed.
    Active,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnEvent {
    /// Own flag observed true.
    Unblocked,
    /// Own flag observed false.
    StillBlocked,
    /// Control handed to the peer.
    Yielded,
    PeerClosed,
    TimedOut,
    /// Local close or delete.
    Shutdown,
}

impl TurnState {
    /// Returns `None` for transitions the protocol forbids.
    pub fn on(self, event: TurnEvent) -> Option<TurnState> {
        match (self, event) {
            (TurnState::Closed, TurnEvent::Shutdown) => Some(TurnState::Closed),
            (TurnState::Closed, _) => None,
            (_, TurnEvent::PeerClosed) | (_, TurnEvent::TimedOut) | (_, TurnEvent::Shutdown) => {
                Some(TurnState::Closed)
            }
            (_, TurnEvent::Unblocked) => Some(TurnState::Active),
            (_, TurnEvent::StillBlocked) => Some(TurnState::Blocked),
            (TurnState::Active, TurnEvent::Yielded) => Some(TurnState::Blocked),
            (TurnState::Idle, TurnEvent::Yielded) | (TurnState::Blocked, TurnEvent::Yielded) => {
                None
            }
        }
    }

    pub fn holds_control(self) -> bool {
        self == TurnState::Active
    }
}

/// `None` waits forever. Zero, negative and non-finite values all mean
/// "no timeout".
pub fn timeout_from_secs(secs: f64) -> Option<Duration> {
    if secs.is_finite() && secs > 0.0 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}

/// Spins for a while, then sleeps between polls. The deadline is compared
/// with elapsed wall-clock time once per `deadline_check_ms`, independent of
/// how many polls ran in between.
pub struct PollClock {
    started: Instant,
    last_check: Instant,
    timeout: Option<Duration>,
    check_every: Duration,
    spins: u32,
    spin_limit: u32,
    sleep: Duration,
}

impl PollClock {
    pub fn start(timeout: Option<Duration>, cfg: &ShmemConfig) -> PollClock {
        let now = Instant::now();
        PollClock {
            started: now,
            last_check: now,
            timeout,
            check_every: Duration::from_millis(cfg.deadline_check_ms),
            spins: 0,
            spin_limit: cfg.spin_iterations,
            sleep: Duration::from_micros(cfg.poll_interval_us),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Backs off once and reports whether the deadline has passed.
    pub fn tick(&mut self) -> bool {
        if self.spins < self.spin_limit {
            self.spins += 1;
            hint::spin_loop();
        } else {
            thread::sleep(self.sleep);
        }
        let timeout = match self.timeout {
            Some(v) => v,
            None => return false,
        };
        let now = Instant::now();
        if now.duration_since(self.last_check) < self.check_every {
            return false;
        }
        self.last_check = now;
        now.duration_since(self.started) >= timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observing_flags() {
        assert_eq!(TurnState::Idle.on(TurnEvent::Unblocked), Some(TurnState::Active));
        assert_eq!(TurnState::Idle.on(TurnEvent::StillBlocked), Some(TurnState::Blocked));
        assert_eq!(TurnState::Blocked.on(TurnEvent::Unblocked), Some(TurnState::Active));
        assert_eq!(TurnState::Active.on(TurnEvent::Unblocked), Some(TurnState::Active));
    }

    #[test]
    fn yield_only_from_active() {
        assert_eq!(TurnState::Active.on(TurnEvent::Yielded), Some(TurnState::Blocked));
        assert_eq!(TurnState::Blocked.on(TurnEvent::Yielded), None);
        assert_eq!(TurnState::Idle.on(TurnEvent::Yielded), None);
        assert_eq!(TurnState::Closed.on(TurnEvent::Yielded), None);
    }

    #[test]
    fn terminal_events_close() {
        for state in &[TurnState::Idle, TurnState::Blocked, TurnState::Active] {
            assert_eq!(state.on(TurnEvent::PeerClosed), Some(TurnState::Closed));
            assert_eq!(state.on(TurnEvent::TimedOut), Some(TurnState::Closed));
            assert_eq!(state.on(TurnEvent::Shutdown), Some(TurnState::Closed));
        }
        assert_eq!(TurnState::Closed.on(TurnEvent::Shutdown), Some(TurnState::Closed));
        assert_eq!(TurnState::Closed.on(TurnEvent::Unblocked), None);
    }

    #[test]
    fn timeout_values() {
        assert_eq!(timeout_from_secs(0.0), None);
        assert_eq!(timeout_from_secs(-1.0), None);
        assert_eq!(timeout_from_secs(f64::NAN), None);
        assert_eq!(timeout_from_secs(0.5), Some(Duration::from_millis(500)));
    }

    #[test]
    fn clock_without_timeout_never_expires() {
        let mut clock = PollClock::start(None, &ShmemConfig::default());
        for _ in 0..5_000 {
            assert!(!clock.tick());
        }
    }

    #[test]
    fn clock_expires_near_deadline() {
        let timeout = Duration::from_millis(30);
        let mut clock = PollClock::start(Some(timeout), &ShmemConfig::default());
        while !clock.tick() {}
        let elapsed = clock.elapsed();
        assert!(elapsed >= timeout);
        assert!(elapsed < Duration::from_millis(500), "expired late: {:?}", elapsed);
    }
}
