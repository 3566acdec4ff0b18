use crate::config::LinkConfig;
use crate::protocol::{ClientId, Message};
use crate::relay::{Relay, RelayState};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

// tokio intervals must be non-zero
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// Heartbeat timeout detection for relay clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessMonitor {
    timeout: Duration,
    interval: Duration,
}

impl LivenessMonitor {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self {
            timeout,
            interval: interval.max(MIN_SWEEP_INTERVAL),
        }
    }

    pub fn from_config(config: &LinkConfig) -> Self {
        Self::new(config.client_timeout, config.sweep_interval)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_stale(&self, last_seen: Instant, now: Instant) -> bool {
        now.saturating_duration_since(last_seen) > self.timeout
    }

    pub fn stale_clients(&self, state: &RelayState, now: Instant) -> Vec<ClientId> {
        let mut stale: Vec<_> = state
            .clients()
            .filter(|(_, last_seen)| self.is_stale(*last_seen, now))
            .map(|(client, _)| client)
            .collect();
        stale.sort_unstable();
        stale
    }

    /// Removes timed-out clients and releases every lock they held.
    ///
    /// Returns the lock releases, already applied and cached, for broadcast.
    pub fn sweep(&self, state: &mut RelayState, now: Instant) -> Vec<Message> {
        let mut releases = Vec::new();

        for client in self.stale_clients(state, now) {
            state.remove_client(client);
            let held = state.locks_held_by(client);
            tracing::info!(client, locks = held.len(), "Client timed out");

            releases.extend(held.into_iter().filter_map(|object| state.release_lock(object)));
        }

        releases
    }

    pub fn spawn(&self, relay: Arc<Relay>) -> JoinHandle<()> {
        let interval = self.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let released = relay.sweep(Instant::now());
                if released > 0 {
                    tracing::debug!(released, "Liveness sweep released locks");
                }
            }
        })
    }
}

impl Default for LivenessMonitor {
    fn default() -> Self {
        Self::from_config(&LinkConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_threshold() {
        let monitor = LivenessMonitor::new(Duration::from_secs(3), Duration::from_secs(1));
        let seen = Instant::now();

        assert!(!monitor.is_stale(seen, seen + Duration::from_secs(3)));
        assert!(monitor.is_stale(seen, seen + Duration::from_millis(3001)));
        // clock skew between touch and sweep
        assert!(!monitor.is_stale(seen + Duration::from_secs(1), seen));
    }

    #[test]
    fn test_sweep_releases_each_lock_once() {
        let monitor = LivenessMonitor::default();
        let mut state = RelayState::new(255);
        let start = Instant::now();

        state.process(Message::lock(1, 0, 7, true), start);
        state.process(Message::lock(1, 0, 3, true), start);
        state.process(Message::lock(2, 0, 8, true), start + Duration::from_secs(2));

        let releases = monitor.sweep(&mut state, start + Duration::from_secs(4));
        let objects: Vec<_> = releases.iter().map(|m| m.object_id).collect();
        assert_eq!(objects, vec![3, 7]);
        assert!(releases.iter().all(|m| m.client_id == 255 && m.lock_state() == Some(false)));

        assert_eq!(state.lock_holder(7), None);
        assert_eq!(state.lock_holder(8), Some(2));
        assert_eq!(state.last_seen(1), None);

        assert!(monitor.sweep(&mut state, start + Duration::from_secs(4)).is_empty());
    }

    #[tokio::test]
    async fn test_zero_interval_sweeps_keep_running() {
        let dir = tempfile::tempdir().unwrap();
        let config = LinkConfig::new()
            .with_record_dir(dir.path())
            .with_sweep_interval(Duration::ZERO);
        let relay = Arc::new(Relay::new(config));
        assert_eq!(relay.liveness().interval(), MIN_SWEEP_INTERVAL);

        let task = relay.liveness().spawn(Arc::clone(&relay));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
    }

    #[test]
    fn test_heartbeat_keeps_client_alive() {
        let monitor = LivenessMonitor::default();
        let mut state = RelayState::new(255);
        let start = Instant::now();

        state.process(Message::lock(1, 0, 7, true), start);
        state.process(Message::ping(1, 0), start + Duration::from_secs(2));

        assert!(monitor.sweep(&mut state, start + Duration::from_secs(4)).is_empty());
        assert_eq!(state.lock_holder(7), Some(1));
    }
}
