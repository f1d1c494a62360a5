//! ==============================================================================
//! handoff.rs - listener thread -> tokio runtime handoff
//! ==============================================================================
//!
//! purpose:
//!     the mqtt listener runs on its own os thread; the connection registry
//!     lives on the tokio runtime that serves the push channel. this is the
//!     single crossing point between the two.
//!
//!     deliver() never blocks: it try_sends into a bounded channel. if the
//!     pump on the runtime side is gone (shutdown) or has fallen behind by a
//!     full channel, the reading is dropped for live viewers with a warning.
//!     storage already happened on the listener side, so nothing is lost
//!     except the live update.
//!
//!     readings are pumped one at a time, so viewers see them in the order
//!     the listener processed them.
//!
//! relationships:
//!     - used by: ingest.rs (deliver), main.rs (spawn_pump)
//!     - drives: push.rs (ConnectionRegistry::broadcast)
//!
//! ==============================================================================

use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::push::ConnectionRegistry;
use crate::telemetry::Reading;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Scheduled,
    /// the registry's runtime is not running (or the pump has exited)
    DroppedNotRunning,
    /// the pump is a full channel behind
    DroppedBackpressure,
}

/// sending side, owned by the listener thread
#[derive(Clone)]
pub struct ProcessBridge {
    tx: mpsc::Sender<Reading>,
}

impl ProcessBridge {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Reading>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub fn deliver(&self, reading: Reading) -> Delivery {
        match self.tx.try_send(reading) {
            Ok(()) => Delivery::Scheduled,
            Err(TrySendError::Closed(r)) => {
                warn!(device = %r.device_id, "push context not running, skipping broadcast");
                Delivery::DroppedNotRunning
            }
            Err(TrySendError::Full(r)) => {
                warn!(device = %r.device_id, "push context backlogged, skipping broadcast");
                Delivery::DroppedBackpressure
            }
        }
    }
}

/// spawns the runtime-side pump on the current tokio runtime
pub fn spawn_pump(registry: Arc<ConnectionRegistry>, mut rx: mpsc::Receiver<Reading>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(reading) = rx.recv().await {
            let report = registry.broadcast(&reading).await;
            debug!(
                device = %reading.device_id,
                delivered = report.delivered,
                failed = report.failures.len(),
                "broadcast"
            );
        }
        debug!("handoff channel closed, pump exiting");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::{Authenticator, PushFrame};
    use chrono::Utc;
    use std::time::Duration;

    fn reading(raw: u64) -> Reading {
        Reading {
            device_id: "dev".to_string(),
            observed_at: Utc::now(),
            raw_value: raw,
            moisture_pct: 0.0,
            latitude: None,
            longitude: None,
        }
    }

    #[test]
    fn deliver_without_running_context_is_a_noop() {
        let (bridge, rx) = ProcessBridge::channel(4);
        drop(rx);
        assert_eq!(bridge.deliver(reading(1)), Delivery::DroppedNotRunning);
    }

    #[test]
    fn deliver_never_queues_past_capacity() {
        let (bridge, _rx) = ProcessBridge::channel(2);
        assert_eq!(bridge.deliver(reading(1)), Delivery::Scheduled);
        assert_eq!(bridge.deliver(reading(2)), Delivery::Scheduled);
        assert_eq!(bridge.deliver(reading(3)), Delivery::DroppedBackpressure);
    }

    #[tokio::test]
    async fn pump_broadcasts_in_listener_order_from_another_thread() {
        let registry = Arc::new(ConnectionRegistry::new(
            Authenticator::SharedSecret("k".into()),
            Duration::from_millis(500),
        ));
        let (viewer_tx, mut viewer_rx) = mpsc::channel(16);
        registry.register(["k"], viewer_tx).unwrap();

        let (bridge, rx) = ProcessBridge::channel(16);
        let pump = spawn_pump(registry.clone(), rx);

        // listener side: a plain os thread
        std::thread::spawn(move || {
            for raw in 1..=5 {
                assert_eq!(bridge.deliver(reading(raw)), Delivery::Scheduled);
            }
        })
        .join()
        .unwrap();

        for expected in 1..=5 {
            let frame: PushFrame = serde_json::from_str(&viewer_rx.recv().await.unwrap()).unwrap();
            assert_eq!(frame.raw_value, expected);
        }

        // bridge dropped with the thread, so the pump winds down
        pump.await.unwrap();
    }
}
