//! Push-broadcast surface (spec.md §6, external collaborator): fire-and-
//! forget fan-out of named events to UI clients. Collapses the spec's
//! named channels (`ReceiveOpportunity`, `ReceiveTransaction`, ...) into one
//! tagged payload over a single `tokio::sync::broadcast` channel, mirroring
//! the teacher's `WsServerEvent` + `broadcast::channel::<WsServerEvent>`
//! shape in `main.rs`. A disconnected or lagging subscriber never blocks or
//! panics a producer: broadcast sends are `Result`-returning and ignored.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

const CAPACITY: usize = 1024;

/// One named, JSON-encoded event crossing the push surface. `channel`
/// corresponds to one of spec.md §6's named broadcast channels
/// (`ReceiveOpportunity`, `ReceiveTransaction`, `ReceiveStrategyUpdate`, ...).
#[derive(Debug, Clone)]
pub struct WsEvent {
    pub channel: &'static str,
    pub payload: Value,
}

pub struct BroadcastHub {
    tx: broadcast::Sender<WsEvent>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WsEvent> {
        self.tx.subscribe()
    }

    /// Serializes `value` and fans it out under `channel`. Serialization
    /// failure and "no subscribers" are both benign, non-fatal outcomes for
    /// a fire-and-forget surface; both are merely logged.
    pub fn publish<T: Serialize>(&self, channel: &'static str, value: &T) {
        match serde_json::to_value(value) {
            Ok(payload) => {
                let _ = self.tx.send(WsEvent { channel, payload });
            }
            Err(e) => {
                tracing::warn!(channel, error = %e, "broadcast payload serialization failed");
            }
        }
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let hub = BroadcastHub::new();
        hub.publish("ReceiveOpportunity", &json!({"symbol": "BTC-USD"}));
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let hub = BroadcastHub::new();
        let mut rx = hub.subscribe();
        hub.publish("ReceiveTransaction", &json!({"id": "tx-1"}));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.channel, "ReceiveTransaction");
        assert_eq!(event.payload["id"], "tx-1");
    }
}
