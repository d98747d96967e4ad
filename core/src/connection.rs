//! Process-wide backend connection state.

use pagetap_protocol::ConnectionState;
use tokio::sync::watch;

/// Holds the current [`ConnectionState`].
///
/// Writers are the health-check loop and direct I/O outcomes (a delivery
/// that fails or succeeds). Readers may subscribe to transitions.
#[derive(Debug)]
pub struct ConnectionMonitor {
    tx: watch::Sender<ConnectionState>,
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionMonitor {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx }
    }

    pub fn state(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Move to `next`, logging real transitions. Returns the previous state.
    pub fn set(&self, next: ConnectionState, reason: &str) -> ConnectionState {
        let mut previous = next;
        self.tx.send_if_modified(|current| {
            previous = *current;
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if previous != next {
            match next {
                ConnectionState::Connected => {
                    tracing::info!(from = %previous, to = %next, reason, "backend connection state")
                }
                ConnectionState::Error => {
                    tracing::warn!(from = %previous, to = %next, reason, "backend connection state")
                }
                _ => {
                    tracing::debug!(from = %previous, to = %next, reason, "backend connection state")
                }
            }
        }
        previous
    }

    /// Record the outcome of a direct backend call.
    pub fn record_io(&self, ok: bool, reason: &str) {
        let next = if ok {
            ConnectionState::Connected
        } else {
            ConnectionState::Error
        };
        self.set(next, reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn transitions_are_observable() {
        let monitor = ConnectionMonitor::new();
        let mut rx = monitor.subscribe();
        assert_eq!(monitor.state(), ConnectionState::Disconnected);

        assert_eq!(
            monitor.set(ConnectionState::Connecting, "startup"),
            ConnectionState::Disconnected
        );
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), ConnectionState::Connecting);

        monitor.record_io(true, "ingest ok");
        assert_eq!(monitor.state(), ConnectionState::Connected);
        monitor.record_io(false, "ingest failed");
        assert_eq!(monitor.state(), ConnectionState::Error);
    }

    #[test]
    fn setting_same_state_is_quiet() {
        let monitor = ConnectionMonitor::new();
        let rx = monitor.subscribe();
        monitor.set(ConnectionState::Disconnected, "noop");
        assert!(!rx.has_changed().unwrap());
    }
}
