//! Rebalance orchestrator.
//!
//! One cycle: take the position lock, read the account, position and bar
//! history through the circuit breaker and retry policy, evaluate the trend
//! signal, place at most one order, update the persisted bot state and
//! export a status snapshot. The lock is released on every exit path.
//!
//! [`RebalanceBot::run`] fires the cycle once a day. Cycle errors are logged
//! and never stop the loop.

mod schedule;
mod state;

pub use schedule::DailySchedule;
pub use state::{BOT_STATE_FILE, BotState, BotStateStore};

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::broker::{BrokerError, BrokerPort, MarketOrderRequest, OrderAck, OrderSide};
use crate::config::Config;
use crate::error::CycleError;
use crate::observability;
use crate::resilience::{
    CircuitBreaker, CircuitStateStore, Clock, FileCircuitStore, LockError, PositionLock,
    PositionLockGuard, RetryPolicy, Sleeper, SystemClock, TokioSleeper, guarded_call,
};
use crate::status::{StatusExporter, StatusReport};
use crate::strategy::{
    MarketSnapshot, OrderPlan, Signal, SignalDecision, StrategyParams, generate_signal,
    plan_order, target_quantity,
};

/// What a completed cycle did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CycleAction {
    /// The market was closed; nothing was evaluated.
    MarketClosed,
    /// The strategy said HOLD.
    Hold,
    /// A signal fired but no order was needed.
    NoTrade {
        /// Why no order was placed.
        reason: String,
    },
    /// A market order was submitted.
    Ordered {
        /// Order side.
        side: OrderSide,
        /// Quantity.
        qty: Decimal,
        /// Broker acknowledgment.
        ack: OrderAck,
    },
    /// The whole position was closed.
    PositionClosed {
        /// Broker acknowledgment.
        ack: OrderAck,
    },
}

impl CycleAction {
    /// Short label for metrics and logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::MarketClosed => "market_closed",
            Self::Hold => "hold",
            Self::NoTrade { .. } => "no_trade",
            Self::Ordered { .. } => "ordered",
            Self::PositionClosed { .. } => "position_closed",
        }
    }
}

/// Result of one completed cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Traded symbol.
    pub symbol: String,
    /// Cycle start.
    pub started_at: DateTime<Utc>,
    /// Account equity, when read.
    pub equity: Option<Decimal>,
    /// Quantity held before any order.
    pub position_qty: Option<Decimal>,
    /// Price used for sizing.
    pub price: Option<Decimal>,
    /// Strategy decision, when evaluated.
    pub decision: Option<SignalDecision>,
    /// What was done.
    pub action: CycleAction,
}

impl CycleReport {
    fn market_closed(symbol: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.to_string(),
            started_at,
            equity: None,
            position_qty: None,
            price: None,
            decision: None,
            action: CycleAction::MarketClosed,
        }
    }
}

/// Scheduled SMA rebalancer for one symbol.
pub struct RebalanceBot<B, S = FileCircuitStore> {
    symbol: String,
    params: StrategyParams,
    broker: B,
    breaker: CircuitBreaker<S>,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    lock: PositionLock,
    lock_timeout: Duration,
    state: BotStateStore,
    status: Option<StatusExporter>,
    clock: Arc<dyn Clock>,
}

impl<B: BrokerPort> RebalanceBot<B, FileCircuitStore> {
    /// Wire a bot from configuration with file-backed state.
    ///
    /// Backoff sleeps abort when `shutdown` is cancelled.
    #[must_use]
    pub fn from_config(config: &Config, broker: B, shutdown: CancellationToken) -> Self {
        let breaker = CircuitBreaker::persistent(
            config.resilience.circuit_breaker.name.clone(),
            config.circuit_breaker_config(),
            &config.state_dir,
        );
        let mut bot = Self::new(
            config.bot.symbol.clone(),
            config.strategy_params(),
            broker,
            breaker,
            PositionLock::new(config.position_lock_config()),
            BotStateStore::in_dir(&config.state_dir),
        )
        .with_retry(config.retry_policy())
        .with_lock_timeout(config.lock_acquire_timeout())
        .with_sleeper(Arc::new(TokioSleeper::new(shutdown)));
        if let Some(path) = config.status_path() {
            bot = bot.with_status(StatusExporter::new(path));
        }
        bot
    }
}

impl<B: BrokerPort, S: CircuitStateStore> RebalanceBot<B, S> {
    /// Create a bot with default retry policy, a 30s lock timeout, the
    /// system clock and no status export.
    #[must_use]
    pub fn new(
        symbol: impl Into<String>,
        params: StrategyParams,
        broker: B,
        breaker: CircuitBreaker<S>,
        lock: PositionLock,
        state: BotStateStore,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            params,
            broker,
            breaker,
            retry: RetryPolicy::default(),
            sleeper: Arc::new(TokioSleeper::default()),
            lock,
            lock_timeout: Duration::from_secs(30),
            state,
            status: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use `policy` for broker calls.
    #[must_use]
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Use `sleeper` for retry backoff.
    #[must_use]
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Wait at most `timeout` for the position lock.
    #[must_use]
    pub const fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Export status after every cycle.
    #[must_use]
    pub fn with_status(mut self, exporter: StatusExporter) -> Self {
        self.status = Some(exporter);
        self
    }

    /// Read time from `clock` (strategy cadence and scheduling).
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Traded symbol.
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Strategy parameters.
    #[must_use]
    pub const fn params(&self) -> &StrategyParams {
        &self.params
    }

    /// Broker adapter.
    #[must_use]
    pub const fn broker(&self) -> &B {
        &self.broker
    }

    /// Broker circuit breaker.
    #[must_use]
    pub const fn breaker(&self) -> &CircuitBreaker<S> {
        &self.breaker
    }

    /// Run one cycle now, log its outcome and return it.
    pub async fn run_once(&self) -> Result<CycleReport, CycleError> {
        tracing::info!(symbol = %self.symbol, "Running single rebalance check");
        let result = self.execute_rebalance().await;
        match &result {
            Ok(report) => tracing::info!(action = report.action.label(), "Single run complete"),
            Err(e) => log_cycle_error(e),
        }
        result
    }

    /// Run a cycle at every fire time of `schedule` until `shutdown`.
    pub async fn run(&self, schedule: DailySchedule, shutdown: CancellationToken) {
        tracing::info!(symbol = %self.symbol, schedule = %schedule, "Starting continuous operation");
        let mut last_fire = self.clock.now();
        loop {
            let now = self.clock.now();
            let next = schedule.next_after(last_fire.max(now));
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            tracing::info!(next_run = %next, "Waiting for next scheduled run");

            tokio::select! {
                () = shutdown.cancelled() => {
                    tracing::info!("Shutdown requested, stopping scheduler");
                    return;
                }
                () = tokio::time::sleep(wait) => {}
            }
            last_fire = next;

            match self.execute_rebalance().await {
                Ok(report) => {
                    tracing::info!(action = report.action.label(), "Daily check complete");
                }
                Err(e) => log_cycle_error(&e),
            }
        }
    }

    /// One full rebalance cycle under the position lock.
    ///
    /// Records cycle metrics and exports status whatever the outcome.
    #[tracing::instrument(name = "rebalance.cycle", skip(self), fields(symbol = %self.symbol))]
    pub async fn execute_rebalance(&self) -> Result<CycleReport, CycleError> {
        let started = Instant::now();
        let result = self.locked_cycle().await;

        let outcome = match &result {
            Ok(report) => report.action.label(),
            Err(e) => e.kind(),
        };
        observability::record_cycle_outcome(outcome, started.elapsed().as_secs_f64());
        self.export_status(&result);
        result
    }

    async fn locked_cycle(&self) -> Result<CycleReport, CycleError> {
        let guard = self.lock.acquire(self.lock_timeout).await?;
        tracing::debug!(holder = guard.holder(), "Position lock acquired");
        let result = self.cycle(&guard).await;
        if let Err(e) = guard.release() {
            tracing::warn!(error = %e, "Failed to release position lock");
        }
        result
    }

    async fn cycle(&self, guard: &PositionLockGuard) -> Result<CycleReport, CycleError> {
        let started_at = self.clock.now();
        tracing::info!("Starting rebalance check");

        if self.params.requires_market_open {
            let open = self
                .call("is_market_open", |_| self.broker.is_market_open())
                .await?;
            if !open {
                tracing::info!("Market closed, skipping");
                return Ok(CycleReport::market_closed(&self.symbol, started_at));
            }
        }

        let account = self.call("get_account", |_| self.broker.get_account()).await?;
        tracing::info!(equity = %account.equity, buying_power = %account.buying_power, "Account");

        let position = self
            .call("get_position", |_| self.broker.get_position(&self.symbol))
            .await?;
        let current_qty = position.as_ref().map_or(Decimal::ZERO, |p| p.qty);

        let start = self.params.history_start(started_at);
        let timeframe = self.params.timeframe;
        let bars = self
            .call("get_bars", |_| {
                self.broker.get_bars(&self.symbol, timeframe, start)
            })
            .await?;
        let closes: Vec<Decimal> = bars.iter().map(|bar| bar.close).collect();

        let price = position
            .as_ref()
            .and_then(|p| p.current_price)
            .or_else(|| closes.last().copied())
            .ok_or_else(|| CycleError::InvalidData(format!("no price for {}", self.symbol)))?;
        tracing::info!(position = %current_qty, price = %price, bars = closes.len(), "Market state");

        let state = self.state.load()?;
        let decision = generate_signal(
            &self.params,
            &MarketSnapshot {
                closes: &closes,
                position_qty: current_qty,
                entry_price: state.entry_price,
                last_rebalance_at: state.last_rebalance_at,
                now: started_at,
            },
        );
        observability::record_signal(&self.symbol, decision.signal.as_str());
        tracing::info!(
            signal = %decision.signal,
            sma = ?decision.sma,
            reason = %decision.reason,
            "Signal"
        );

        let mut report = CycleReport {
            symbol: self.symbol.clone(),
            started_at,
            equity: Some(account.equity),
            position_qty: Some(current_qty),
            price: Some(price),
            decision: None,
            action: CycleAction::Hold,
        };

        if decision.signal.is_actionable() {
            report.action = self
                .trade(guard, decision.signal, current_qty, account.equity, price)
                .await?;
            self.record_trade(decision.signal, &report.action, current_qty, price, started_at)?;
        }
        report.decision = Some(decision);

        tracing::info!(action = report.action.label(), "Rebalance complete");
        Ok(report)
    }

    async fn trade(
        &self,
        guard: &PositionLockGuard,
        signal: Signal,
        current_qty: Decimal,
        equity: Decimal,
        price: Decimal,
    ) -> Result<CycleAction, CycleError> {
        let target_qty = match signal {
            Signal::Buy => target_quantity(&self.params, equity, price),
            Signal::Sell | Signal::Hold => Decimal::ZERO,
        };
        tracing::info!(target = %target_qty, current = %current_qty, "Target position");

        match plan_order(&self.params, signal, current_qty, target_qty) {
            OrderPlan::Skip { reason } => {
                tracing::info!(reason = %reason, "No trade needed");
                Ok(CycleAction::NoTrade { reason })
            }
            OrderPlan::Submit { side, qty } => {
                ensure_lock_held(guard, "submit_order")?;
                let order = MarketOrderRequest::new(
                    self.symbol.clone(),
                    side,
                    qty,
                    self.params.asset_class.default_time_in_force(),
                );
                tracing::info!(
                    side = %side,
                    qty = %qty,
                    notional = %(qty * price),
                    client_order_id = %order.client_order_id,
                    "Submitting market order"
                );
                let ack = self
                    .call("submit_order", |_| self.broker.submit_market_order(&order))
                    .await
                    .inspect_err(|_| {
                        observability::record_order_submission(&self.symbol, side.as_str(), "failed");
                    })?;
                observability::record_order_submission(&self.symbol, side.as_str(), "submitted");
                Ok(CycleAction::Ordered { side, qty, ack })
            }
            OrderPlan::ClosePosition => {
                ensure_lock_held(guard, "close_position")?;
                tracing::info!(qty = %current_qty, "Closing entire position");
                let ack = self
                    .call("close_position", |_| self.broker.close_position(&self.symbol))
                    .await
                    .inspect_err(|_| {
                        observability::record_order_submission(&self.symbol, "sell", "failed");
                    })?;
                observability::record_order_submission(&self.symbol, "sell", "submitted");
                Ok(CycleAction::PositionClosed { ack })
            }
        }
    }

    /// Update entry price and cadence after an actionable signal.
    ///
    /// The entry price is set when a position is opened; top-up buys keep
    /// the first entry as the stop-loss reference.
    fn record_trade(
        &self,
        signal: Signal,
        action: &CycleAction,
        held_qty: Decimal,
        price: Decimal,
        at: DateTime<Utc>,
    ) -> Result<(), CycleError> {
        match (signal, action) {
            (Signal::Buy, CycleAction::Ordered { .. }) => {
                if held_qty <= Decimal::ZERO || self.state.load()?.entry_price.is_none() {
                    self.state.record_entry(price)?;
                }
            }
            (Signal::Sell, _) => self.state.clear_entry()?,
            _ => {}
        }
        self.state.mark_rebalanced(at)?;
        Ok(())
    }

    /// One broker operation through the breaker and retry policy.
    async fn call<T, F, Fut>(&self, operation: &'static str, f: F) -> Result<T, CycleError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, BrokerError>>,
    {
        guarded_call(
            &self.breaker,
            &self.retry,
            self.sleeper.as_ref(),
            BrokerError::is_retryable,
            f,
        )
        .instrument(tracing::info_span!("broker.call", operation))
        .await
        .map_err(|e| CycleError::from_broker_call(operation, e))
    }

    fn export_status(&self, result: &Result<CycleReport, CycleError>) {
        let Some(exporter) = &self.status else {
            return;
        };
        let circuit = self
            .breaker
            .state()
            .ok()
            .map(|state| state.as_str().to_string());

        let report = match result {
            Ok(cycle) => {
                let mut report = StatusReport {
                    current_position: cycle.position_qty,
                    current_price: cycle.price,
                    account_value: cycle.equity,
                    last_signal: cycle
                        .decision
                        .as_ref()
                        .map(|d| d.signal.as_str().to_string()),
                    circuit_breaker_status: circuit,
                    ..StatusReport::new(&self.symbol, "running", self.clock.now())
                }
                .with_extra("action", cycle.action.label());
                if let Some(sma) = cycle.decision.as_ref().and_then(|d| d.sma) {
                    report = report.with_extra("sma", sma.to_string());
                }
                report
            }
            Err(e) => {
                let status = if e.is_skip() { "skipped" } else { "error" };
                StatusReport {
                    circuit_breaker_status: circuit,
                    ..StatusReport::new(&self.symbol, status, self.clock.now())
                }
                .with_extra("error", e.to_string())
                .with_extra("error_kind", e.kind())
            }
        };
        exporter.export(&report);
    }
}

/// Extend the lock before an order, or abandon the cycle if it was lost.
fn ensure_lock_held(guard: &PositionLockGuard, operation: &'static str) -> Result<(), CycleError> {
    match guard.renew() {
        Ok(_) => Ok(()),
        Err(LockError::Lost { .. }) => Err(CycleError::LockLost { operation }),
        Err(e) => Err(e.into()),
    }
}

fn log_cycle_error(error: &CycleError) {
    if error.is_skip() {
        tracing::warn!(kind = error.kind(), error = %error, "Cycle skipped");
    } else {
        tracing::error!(kind = error.kind(), error = %error, "Error in trading cycle");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_labels() {
        assert_eq!(CycleAction::Hold.label(), "hold");
        assert_eq!(CycleAction::MarketClosed.label(), "market_closed");
        assert_eq!(
            CycleAction::NoTrade {
                reason: "tiny".into()
            }
            .label(),
            "no_trade"
        );
    }

    #[test]
    fn market_closed_report_has_no_market_data() {
        let report = CycleReport::market_closed("SPY", Utc::now());
        assert_eq!(report.action, CycleAction::MarketClosed);
        assert!(report.decision.is_none());
        assert!(report.price.is_none());
    }
}
