//! Domain events and the notification outbox.
//!
//! Financial mutations commit state first and append events to the outbox;
//! a separate dispatcher task delivers them to a [`NotificationSink`], so a
//! delivery failure can never roll back a committed balance change.

use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{LedgerEntry, Position};

/// Outbound notification event, addressed to the owning account.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum EngineEvent {
    OrderExecuted {
        account_id: Uuid,
        position: Position,
        ledger: LedgerEntry,
    },
    OrderCancelled {
        account_id: Uuid,
        position: Position,
        ledger: LedgerEntry,
    },
    PendingOrderActivated {
        account_id: Uuid,
        position: Position,
    },
    TradeClosed {
        account_id: Uuid,
        position: Position,
        ledger: LedgerEntry,
    },
    TradeModified {
        account_id: Uuid,
        position: Position,
    },
    MarginCall {
        account_id: Uuid,
        margin_level: Decimal,
        equity: Decimal,
    },
    StopOut {
        account_id: Uuid,
        margin_level: Decimal,
        closed_positions: usize,
    },
    TradeCopied {
        master_id: Uuid,
        follower_id: Uuid,
        position: Position,
    },
    CommissionCredited {
        beneficiary_id: Uuid,
        source_user_id: Uuid,
        amount: Decimal,
        reference: Option<Uuid>,
    },
}

/// Best-effort delivery target for engine events.
pub trait NotificationSink: Send + Sync {
    fn deliver(&self, event: &EngineEvent);
}

/// Default sink: structured log line per event.
pub struct LogSink;

impl NotificationSink for LogSink {
    fn deliver(&self, event: &EngineEvent) {
        match serde_json::to_string(event) {
            Ok(json) => info!(payload = %json, "Notification"),
            Err(e) => warn!(error = %e, "Failed to render notification"),
        }
    }
}

/// Fire-and-forget event publisher held by the engine.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl Outbox {
    /// Create the outbox and spawn its dispatcher task.
    pub fn spawn(sink: Box<dyn NotificationSink>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<EngineEvent>();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                sink.deliver(&event);
            }
        });
        Self { tx }
    }

    /// Publish one event. Send failures are logged, never propagated.
    pub fn publish(&self, event: EngineEvent) {
        if self.tx.send(event).is_err() {
            warn!("Notification dispatcher is gone, dropping event");
        }
    }
}
