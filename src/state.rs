//! Connection state publisher
//!
//! Single-slot, latest-value-wins cell. The registry overwrites it after
//! every mutation; observers only ever see the most recent value.

use serde::Serialize;
use tokio::sync::watch;

/// Published connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ConnectionState {
    pub count: usize,
    pub connected: bool,
}

impl ConnectionState {
    pub fn from_count(count: usize) -> Self {
        Self {
            count,
            connected: count > 0,
        }
    }
}

/// Writing side, owned by the registry
#[derive(Debug)]
pub struct StatePublisher {
    tx: watch::Sender<ConnectionState>,
}

impl StatePublisher {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionState::default());
        Self { tx }
    }

    /// Overwrite the published state. Never blocks, never fails.
    pub fn publish(&self, count: usize) {
        self.tx.send_replace(ConnectionState::from_count(count));
    }

    pub fn subscribe(&self) -> StateObserver {
        StateObserver {
            rx: self.tx.subscribe(),
        }
    }

    pub fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }
}

impl Default for StatePublisher {
    fn default() -> Self {
        Self::new()
    }
}

/// Reading side, handed to the application layer
#[derive(Debug, Clone)]
pub struct StateObserver {
    rx: watch::Receiver<ConnectionState>,
}

impl StateObserver {
    /// Latest published state.
    pub fn current(&self) -> ConnectionState {
        *self.rx.borrow()
    }

    /// Wait for a state newer than the last one observed.
    ///
    /// Returns `None` once the bridge has been dropped.
    pub async fn changed(&mut self) -> Option<ConnectionState> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }

    /// Wait until `pred` holds for the published state.
    pub async fn wait_for(
        &mut self,
        pred: impl FnMut(&ConnectionState) -> bool,
    ) -> Option<ConnectionState> {
        self.rx.wait_for(pred).await.ok().map(|state| *state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connected_follows_count() {
        assert_eq!(
            ConnectionState::from_count(0),
            ConnectionState { count: 0, connected: false }
        );
        assert_eq!(
            ConnectionState::from_count(2),
            ConnectionState { count: 2, connected: true }
        );
    }

    #[tokio::test]
    async fn test_observer_sees_only_latest() {
        let publisher = StatePublisher::new();
        let mut observer = publisher.subscribe();

        publisher.publish(1);
        publisher.publish(2);
        publisher.publish(3);

        let state = observer.changed().await.unwrap();
        assert_eq!(state, ConnectionState::from_count(3));
        assert_eq!(observer.current().count, 3);
    }

    #[tokio::test]
    async fn test_publish_without_observers() {
        let publisher = StatePublisher::new();
        publisher.publish(1);
        assert_eq!(publisher.current(), ConnectionState::from_count(1));
    }
}
