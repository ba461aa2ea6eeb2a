// Outbound events for an external notifier

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::core::error_handler::ErrorRecord;
use crate::core::types::{RegenerationTrigger, Trade};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BotEvent {
    TradeFilled {
        trade: Trade,
    },
    StopLossTriggered {
        price: f64,
        reference_price: f64,
        drop_percent: f64,
        canceled_orders: usize,
        at: DateTime<Utc>,
    },
    GridRegenerated {
        generation: i64,
        reference_price: f64,
        trigger: RegenerationTrigger,
        orders_placed: usize,
        at: DateTime<Utc>,
    },
    Error {
        record: ErrorRecord,
    },
}

/// Fan-out point for events; a missing receiver is not an error.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    sender: Option<mpsc::UnboundedSender<BotEvent>>,
}

impl EventSink {
    pub fn new(sender: mpsc::UnboundedSender<BotEvent>) -> Self {
        Self { sender: Some(sender) }
    }

    /// A sink that drops every event
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<BotEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn emit(&self, event: BotEvent) {
        if let Some(sender) = &self.sender {
            if sender.send(event).is_err() {
                debug!("Event receiver dropped, discarding event");
            }
        }
    }
}
