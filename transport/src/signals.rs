//! Cross-thread signaling for one session.
//!
//! One shutdown flag shared by all three data-plane threads, a two-flag
//! capture gate driven by the control plane, and a silence watchdog fed
//! by the receive thread. No process-wide state: every session carries
//! its own signal set.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Cooperative cancellation flag, checked at each loop iteration in all
/// three pipeline threads.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Two-flag rendezvous gating the capture loop.
///
/// The control plane opens the gate with `begin()` (clear stop, set start)
/// when the remote side finishes speaking and closes it with `end()` on an
/// explicit interrupt. Both operations are idempotent and tolerate being
/// applied out of order; this is deliberately not a full state machine.
#[derive(Debug, Clone, Default)]
pub struct CaptureGate {
    // ---
    start: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
}

impl CaptureGate {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the gate for the next capture turn.
    pub fn begin(&self) {
        // ---
        self.stop.store(false, Ordering::Release);
        self.start.store(true, Ordering::Release);
    }

    /// Requests the current capture turn to end.
    pub fn end(&self) {
        // ---
        self.stop.store(true, Ordering::Release);
    }

    /// Whether a capture turn should be running right now.
    pub fn is_open(&self) -> bool {
        // ---
        self.start.load(Ordering::Acquire) && !self.stop.load(Ordering::Acquire)
    }

    /// Whether a stop has been requested for the current turn.
    pub fn stop_requested(&self) -> bool {
        // ---
        self.stop.load(Ordering::Acquire)
    }

    /// Clears the start flag after a turn finishes, so the next turn
    /// needs a fresh `begin()`. Called by the capture thread only.
    pub fn rearm(&self) {
        // ---
        self.start.store(false, Ordering::Release);
    }
}

/// Shared last-packet clock, touched by the receive thread.
#[derive(Debug, Clone)]
pub struct RxActivity(Arc<Mutex<Instant>>);

impl RxActivity {
    // ---
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Instant::now())))
    }

    pub fn touch(&self) {
        *self.0.lock() = Instant::now();
    }

    pub fn elapsed(&self) -> Duration {
        self.0.lock().elapsed()
    }
}

impl Default for RxActivity {
    fn default() -> Self {
        Self::new()
    }
}

/// Verdict from one watchdog check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogVerdict {
    // ---
    /// Audio flowed recently (or none was expected).
    Healthy,

    /// Silence exceeded the budget; strike `n` of the allowance recorded.
    Strike(u32),

    /// Strike allowance exhausted: the session should be marked inactive.
    Expired,
}

/// Detects prolonged silence while a reply is expected.
///
/// Sequence gaps and short stalls are routine; only repeated full-budget
/// silences are fatal. The session owner polls `check` periodically and
/// trips the shutdown flag on `Expired`.
#[derive(Debug)]
pub struct SilenceWatchdog {
    // ---
    activity: RxActivity,
    budget: Duration,
    max_strikes: u32,
    strikes: u32,
}

impl SilenceWatchdog {
    // ---
    pub fn new(activity: RxActivity, budget: Duration, max_strikes: u32) -> Self {
        // ---
        Self {
            activity,
            budget,
            max_strikes,
            strikes: 0,
        }
    }

    /// Evaluates the silence budget.
    ///
    /// `expecting_audio` is the caller's knowledge that the remote side
    /// should currently be speaking; silence while idle is not a fault.
    pub fn check(&mut self, expecting_audio: bool) -> WatchdogVerdict {
        // ---
        if !expecting_audio || self.activity.elapsed() < self.budget {
            self.strikes = 0;
            return WatchdogVerdict::Healthy;
        }

        self.strikes += 1;
        if self.strikes >= self.max_strikes {
            warn!(
                "No audio for {:?} ({} strikes), giving up on this session",
                self.budget, self.strikes
            );
            WatchdogVerdict::Expired
        } else {
            warn!(
                "No audio for {:?} while expecting a reply (strike {}/{})",
                self.budget, self.strikes, self.max_strikes
            );
            WatchdogVerdict::Strike(self.strikes)
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn gate_open_close_cycle() {
        // ---
        let gate = CaptureGate::new();
        assert!(!gate.is_open());

        gate.begin();
        assert!(gate.is_open());

        gate.end();
        assert!(!gate.is_open());
        assert!(gate.stop_requested());

        // Next turn: begin clears the stale stop.
        gate.begin();
        assert!(gate.is_open());
        assert!(!gate.stop_requested());
    }

    #[test]
    fn gate_operations_are_idempotent() {
        // ---
        let gate = CaptureGate::new();
        gate.begin();
        gate.begin();
        assert!(gate.is_open());

        gate.end();
        gate.end();
        assert!(!gate.is_open());

        // Out-of-order close before any open is harmless.
        let fresh = CaptureGate::new();
        fresh.end();
        assert!(!fresh.is_open());
        fresh.begin();
        assert!(fresh.is_open());
    }

    #[test]
    fn rearm_requires_fresh_begin() {
        // ---
        let gate = CaptureGate::new();
        gate.begin();
        gate.rearm();
        assert!(!gate.is_open());
    }

    #[test]
    fn shutdown_flag_is_shared() {
        // ---
        let flag = ShutdownFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_set());
        flag.set();
        assert!(clone.is_set());
    }

    #[test]
    fn watchdog_strikes_then_expires() {
        // ---
        let activity = RxActivity::new();
        let mut watchdog = SilenceWatchdog::new(activity.clone(), Duration::from_millis(1), 3);
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(watchdog.check(true), WatchdogVerdict::Strike(1));
        assert_eq!(watchdog.check(true), WatchdogVerdict::Strike(2));
        assert_eq!(watchdog.check(true), WatchdogVerdict::Expired);
    }

    #[test]
    fn watchdog_resets_on_activity_or_idle() {
        // ---
        let activity = RxActivity::new();
        let mut watchdog = SilenceWatchdog::new(activity.clone(), Duration::from_millis(1), 3);
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(watchdog.check(true), WatchdogVerdict::Strike(1));

        // Silence while idle is not a fault, and clears the strikes.
        assert_eq!(watchdog.check(false), WatchdogVerdict::Healthy);

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(watchdog.check(true), WatchdogVerdict::Strike(1));

        activity.touch();
        assert_eq!(watchdog.check(true), WatchdogVerdict::Healthy);
    }
}
