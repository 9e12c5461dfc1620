//! Recurring position monitor: pending activation, SL/TP, margin calls and
//! stop-outs.
//!
//! One scan runs at a time; a cycle that overruns the interval makes the
//! next tick skip instead of overlapping. Per-item failures are logged and
//! never halt the rest of the scan. A symbol without a live quote is skipped
//! for the cycle.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::events::EngineEvent;
use crate::models::{CloseReason, Position, PositionStatus, Side};

use super::Engine;

/// Outcome counters for one scan cycle, surfaced for logging and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub activated: usize,
    pub sl_tp_closed: usize,
    pub margin_calls: usize,
    pub stopped_out_accounts: usize,
    pub stopped_out_positions: usize,
}

pub struct PositionMonitor {
    engine: Arc<Engine>,
    scan_lock: Mutex<()>,
    /// Last margin-call notification per account, for rate limiting
    margin_call_sent: Mutex<HashMap<Uuid, DateTime<Utc>>>,
}

impl PositionMonitor {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            scan_lock: Mutex::new(()),
            margin_call_sent: Mutex::new(HashMap::new()),
        }
    }

    /// Run the recurring scan until the task is aborted.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval(Duration::from_secs(
            self.engine.config().monitor_interval_secs,
        ));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;

            // Non-overlapping execution: skip the tick if a scan is running.
            let Ok(_guard) = self.scan_lock.try_lock() else {
                debug!("Previous scan still running, skipping tick");
                continue;
            };
            match self.scan().await {
                Ok(report) => {
                    if report != CycleReport::default() {
                        info!(
                            activated = report.activated,
                            sl_tp = report.sl_tp_closed,
                            margin_calls = report.margin_calls,
                            stop_outs = report.stopped_out_accounts,
                            "Scan cycle"
                        );
                    }
                }
                Err(e) => error!(error = %e, "Scan cycle failed"),
            }
        }
    }

    /// One full scan cycle. Public so tests can drive it directly.
    pub async fn scan(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        self.activate_pending(&mut report).await;
        self.evaluate_stops(&mut report).await;
        self.evaluate_margin(&mut report).await;

        Ok(report)
    }

    /// Step 1: activate pending orders whose trigger rule fires.
    async fn activate_pending(&self, report: &mut CycleReport) {
        let pendings = self
            .engine
            .store()
            .positions_with_status(PositionStatus::Pending)
            .await;

        for position in pendings {
            let Some(tick) = self.engine.prices().get(&position.symbol).await else {
                continue;
            };
            if !position.pending_triggered(tick.bid, tick.ask) {
                continue;
            }

            // Entry becomes the live triggering price. No additional charge
            // is levied at activation.
            let live = match position.side {
                Side::Buy => tick.ask,
                Side::Sell => tick.bid,
            };
            let result = self
                .engine
                .store()
                .transition_position(position.id, PositionStatus::Pending, |p| {
                    p.status = PositionStatus::Open;
                    p.entry_price = live;
                    p.activated_at = Some(Utc::now());
                })
                .await;

            match result {
                Ok(Some(activated)) => {
                    report.activated += 1;
                    info!(position = %activated.id, price = %live, "Pending order activated");
                    self.engine.publish(EngineEvent::PendingOrderActivated {
                        account_id: activated.account_id,
                        position: activated,
                    });
                }
                Ok(None) => {}
                Err(e) => warn!(position = %position.id, error = %e, "Activation failed"),
            }
        }
    }

    /// Step 2: close positions whose SL or TP level has been reached, at the
    /// configured level itself rather than the live price.
    async fn evaluate_stops(&self, report: &mut CycleReport) {
        let opens = self
            .engine
            .store()
            .positions_with_status(PositionStatus::Open)
            .await;

        for position in opens {
            let Some(tick) = self.engine.prices().get(&position.symbol).await else {
                continue;
            };
            let reference = match position.side {
                Side::Buy => tick.bid,
                Side::Sell => tick.ask,
            };

            let trigger = stop_trigger(&position, reference);
            let Some((close_price, reason)) = trigger else {
                continue;
            };

            match self
                .engine
                .close_position(position.id, close_price, reason)
                .await
            {
                Ok(Some(_)) => report.sl_tp_closed += 1,
                Ok(None) => {}
                Err(e) => {
                    warn!(position = %position.id, error = %e, "SL/TP close failed")
                }
            }
        }
    }

    /// Steps 3-5: per-account margin aggregation, margin calls, stop-outs.
    async fn evaluate_margin(&self, report: &mut CycleReport) {
        let opens = self
            .engine
            .store()
            .positions_with_status(PositionStatus::Open)
            .await;

        let mut by_account: HashMap<Uuid, Vec<Position>> = HashMap::new();
        for position in opens {
            by_account.entry(position.account_id).or_default().push(position);
        }

        for (account_id, positions) in by_account {
            if let Err(e) = self
                .evaluate_account_margin(account_id, positions, report)
                .await
            {
                // One bad account record must not halt the scan for others.
                warn!(account = %account_id, error = %e, "Margin evaluation failed");
            }
        }
    }

    async fn evaluate_account_margin(
        &self,
        account_id: Uuid,
        positions: Vec<Position>,
        report: &mut CycleReport,
    ) -> Result<()> {
        let balance = self.engine.store().balance(account_id).await?;
        let risk = self.engine.risk_for(balance, &positions).await?;

        // An unpriced position makes equity unreliable; defer any action.
        if !risk.fully_priced {
            debug!(account = %account_id, "Skipping margin evaluation, missing quotes");
            return Ok(());
        }

        let Some(margin_level) = risk.margin_level else {
            return Ok(());
        };

        let stop_out = margin_level <= self.engine.config().stop_out_level
            || risk.equity <= Decimal::ZERO;

        if stop_out {
            let closed = self.stop_out_account(account_id, positions).await;
            report.stopped_out_accounts += 1;
            report.stopped_out_positions += closed;

            self.margin_call_sent.lock().await.remove(&account_id);
            self.engine.publish(EngineEvent::StopOut {
                account_id,
                margin_level,
                closed_positions: closed,
            });
            return Ok(());
        }

        if margin_level <= self.engine.config().margin_call_level {
            if self.should_send_margin_call(account_id).await {
                report.margin_calls += 1;
                warn!(account = %account_id, margin_level = %margin_level, "Margin call");
                self.engine.publish(EngineEvent::MarginCall {
                    account_id,
                    margin_level,
                    equity: risk.equity,
                });
            }
        } else {
            // Recovered above the call level: clear the rate-limit record.
            self.margin_call_sent.lock().await.remove(&account_id);
        }

        Ok(())
    }

    /// Force-close every open position for the account at current market
    /// price, smallest lot first. Returns the number closed.
    async fn stop_out_account(&self, account_id: Uuid, mut positions: Vec<Position>) -> usize {
        positions.sort_by(|a, b| a.lots.cmp(&b.lots));

        let mut closed = 0;
        for position in positions {
            let Some(tick) = self.engine.prices().get(&position.symbol).await else {
                continue;
            };
            let price = match position.side {
                Side::Buy => tick.bid,
                Side::Sell => tick.ask,
            };
            match self
                .engine
                .close_position(position.id, price, CloseReason::StopOut)
                .await
            {
                Ok(Some(_)) => closed += 1,
                Ok(None) => {}
                Err(e) => {
                    warn!(position = %position.id, account = %account_id, error = %e, "Stop-out close failed")
                }
            }
        }

        warn!(account = %account_id, closed, "Stop-out executed");
        closed
    }

    /// At most one margin call per cooldown window per account.
    async fn should_send_margin_call(&self, account_id: Uuid) -> bool {
        let cooldown = ChronoDuration::seconds(self.engine.config().margin_call_cooldown_secs);
        let mut sent = self.margin_call_sent.lock().await;
        let now = Utc::now();

        match sent.get(&account_id) {
            Some(last) if now - *last < cooldown => false,
            _ => {
                sent.insert(account_id, now);
                true
            }
        }
    }
}

/// SL fires when the reference price has moved to or past the stop level, TP
/// symmetrically in the favorable direction. SL wins when both would fire.
fn stop_trigger(position: &Position, reference: Decimal) -> Option<(Decimal, CloseReason)> {
    if let Some(sl) = position.stop_loss {
        let hit = match position.side {
            Side::Buy => reference <= sl,
            Side::Sell => reference >= sl,
        };
        if hit {
            return Some((sl, CloseReason::StopLoss));
        }
    }
    if let Some(tp) = position.take_profit {
        let hit = match position.side {
            Side::Buy => reference >= tp,
            Side::Sell => reference <= tp,
        };
        if hit {
            return Some((tp, CloseReason::TakeProfit));
        }
    }
    None
}
