// Per-agent outstanding-command tracking with timeout recovery

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Tracks which agents have an unacknowledged command in flight.
///
/// Each agent is either Idle (no entry) or Busy (entry holding the time the
/// command was sent). Acknowledgements clear the entry; a busy check past
/// the timeout clears it too, so one silent agent cannot stall the arena.
///
/// Safe to share between the arena loop and broker callback tasks.
#[derive(Default)]
pub struct BusyTracker {
    /// agent id -> time of the last command
    busy: DashMap<u32, Instant>,

    /// Busy flags force-cleared by timeout
    timeouts: AtomicU64,

    /// Busy flags cleared by acknowledgement
    acks: AtomicU64,
}

impl BusyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idle -> Busy, recording `now` as the command time
    pub fn mark_busy(&self, agent_id: u32, now: Instant) {
        self.busy.insert(agent_id, now);
        debug!(agent_id = agent_id, "Agent busy");
    }

    /// Whether the agent still has a command outstanding.
    ///
    /// Once `timeout` has elapsed since the command, the agent is forced back
    /// to Idle (exactly once) and reported as not busy.
    pub fn is_busy(&self, agent_id: u32, timeout: Duration, now: Instant) -> bool {
        let expired = match self.busy.get(&agent_id) {
            None => return false,
            Some(since) => now.saturating_duration_since(*since) >= timeout,
        };

        if !expired {
            return true;
        }

        // remove_if so a fresh mark_busy racing with us is not discarded
        let removed = self
            .busy
            .remove_if(&agent_id, |_, since| {
                now.saturating_duration_since(*since) >= timeout
            })
            .is_some();

        if removed {
            self.timeouts.fetch_add(1, Ordering::Relaxed);
            info!(
                agent_id = agent_id,
                timeout_ms = timeout.as_millis() as u64,
                "No acknowledgement before timeout, agent released"
            );
            false
        } else {
            self.busy.contains_key(&agent_id)
        }
    }

    /// Busy -> Idle on acknowledgement. Returns false if the agent was not busy.
    pub fn clear(&self, agent_id: u32) -> bool {
        let cleared = self.busy.remove(&agent_id).is_some();
        if cleared {
            self.acks.fetch_add(1, Ordering::Relaxed);
            debug!(agent_id = agent_id, "Agent acknowledged");
        }
        cleared
    }

    /// Busy -> Idle for a command that never reached the agent
    pub fn cancel(&self, agent_id: u32) -> bool {
        self.busy.remove(&agent_id).is_some()
    }

    /// Number of busy flags cleared by timeout since startup
    pub fn timeout_count(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    pub fn ack_count(&self) -> u64 {
        self.acks.load(Ordering::Relaxed)
    }

    pub fn busy_count(&self) -> usize {
        self.busy.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn test_idle_by_default() {
        let tracker = BusyTracker::new();
        assert!(!tracker.is_busy(3, TIMEOUT, Instant::now()));
        assert!(!tracker.clear(3));
    }

    #[test]
    fn test_busy_until_timeout_then_released_once() {
        let tracker = BusyTracker::new();
        let t = Instant::now();
        tracker.mark_busy(1, t);

        assert!(tracker.is_busy(1, TIMEOUT, t));
        assert!(tracker.is_busy(1, TIMEOUT, t + Duration::from_millis(4999)));

        // first call at T + timeout forces Idle
        assert!(!tracker.is_busy(1, TIMEOUT, t + TIMEOUT));
        assert_eq!(tracker.timeout_count(), 1);

        // later calls are idempotent
        assert!(!tracker.is_busy(1, TIMEOUT, t + TIMEOUT * 2));
        assert!(!tracker.is_busy(1, TIMEOUT, t + TIMEOUT * 3));
        assert_eq!(tracker.timeout_count(), 1);
    }

    #[test]
    fn test_ack_clears_busy() {
        let tracker = BusyTracker::new();
        let t = Instant::now();
        tracker.mark_busy(2, t);

        assert!(tracker.clear(2));
        assert!(!tracker.is_busy(2, TIMEOUT, t));
        assert_eq!(tracker.ack_count(), 1);
        assert_eq!(tracker.timeout_count(), 0);
    }

    #[test]
    fn test_cancel_is_not_an_ack() {
        let tracker = BusyTracker::new();
        tracker.mark_busy(5, Instant::now());

        assert!(tracker.cancel(5));
        assert!(!tracker.cancel(5));
        assert_eq!(tracker.ack_count(), 0);
        assert_eq!(tracker.busy_count(), 0);
    }

    #[test]
    fn test_remark_restarts_the_clock() {
        let tracker = BusyTracker::new();
        let t = Instant::now();
        tracker.mark_busy(4, t);
        tracker.mark_busy(4, t + Duration::from_secs(4));

        assert!(tracker.is_busy(4, TIMEOUT, t + Duration::from_secs(6)));
        assert!(!tracker.is_busy(4, TIMEOUT, t + Duration::from_secs(9)));
    }

    #[test]
    fn test_agents_are_independent() {
        let tracker = BusyTracker::new();
        let t = Instant::now();
        tracker.mark_busy(1, t);

        assert!(tracker.is_busy(1, TIMEOUT, t));
        assert!(!tracker.is_busy(2, TIMEOUT, t));
        assert_eq!(tracker.busy_count(), 1);
    }

    #[test]
    fn test_concurrent_acks_and_checks() {
        let tracker = Arc::new(BusyTracker::new());
        let t = Instant::now();
        for id in 0..10 {
            tracker.mark_busy(id, t);
        }

        let mut handles = vec![];
        for id in 0..10 {
            let tracker = Arc::clone(&tracker);
            handles.push(thread::spawn(move || {
                tracker.clear(id);
                tracker.is_busy(id, TIMEOUT, t)
            }));
        }

        for handle in handles {
            assert!(!handle.join().unwrap());
        }
        assert_eq!(tracker.ack_count(), 10);
    }
}
