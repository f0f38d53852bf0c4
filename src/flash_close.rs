// ===============================
// src/flash_close.rs (cleanup orchestrator)
// ===============================
//
// Urutan (sekuensial, satu per satu):
// 1) acquire session (load markets)      -> gagal = run dibatalkan
// 2) close semua posisi
// 3) cancel trigger orders               (planType normal_plan)
// 4) cancel TP/SL orders                 (planType profit_loss, endpoint cancel trigger)
// 5) cancel limit orders                 (status live, filter orderType == limit)
// 6) verifikasi: fetch ulang keempat kelas
// 7) release session, selalu, tepat satu kali
//
// Posisi ditutup lebih dulu supaya posisi tidak sempat tanpa proteksi TP/SL.
// Kegagalan per item hanya dicatat; stage lanjut ke item berikutnya.
//
use std::panic::AssertUnwindSafe;

use chrono::Utc;
use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::domain::{Event, Order, OrderKind, OrderStatus, PlanType, Position};
use crate::gateway::{Gateway, GatewayError};
use crate::metrics::{ITEMS, RESIDUAL};
use crate::report::{FlashCloseReport, ItemFailure, Residual, StageReport};
use crate::retry::{OperationFailed, RetryPolicy};

#[derive(Debug, Error)]
pub enum FlashCloseError {
    #[error("could not acquire exchange session: {0}")]
    SessionAcquire(#[source] OperationFailed),
}

pub struct FlashClose<'a, G: Gateway + ?Sized> {
    gateway: &'a G,
    policy: RetryPolicy,
    events: Option<mpsc::Sender<Event>>,
}

impl<'a, G: Gateway + ?Sized> FlashClose<'a, G> {
    pub fn new(gateway: &'a G, policy: RetryPolicy) -> Self {
        Self { gateway, policy, events: None }
    }

    pub fn with_recorder(mut self, tx: mpsc::Sender<Event>) -> Self {
        self.events = Some(tx);
        self
    }

    async fn record(&self, ev: Event) {
        if let Some(tx) = &self.events {
            let _ = tx.send(ev).await;
        }
    }

    /// Run the whole cleanup. Only a failed session acquire is an `Err`;
    /// everything after that is reported inside [`FlashCloseReport`].
    pub async fn run(&self) -> Result<FlashCloseReport, FlashCloseError> {
        info!("starting flash close");
        let markets = self
            .policy
            .call("load_markets", || self.gateway.load_markets())
            .await
            .map_err(|e| {
                error!(error = %e, "could not acquire exchange session");
                FlashCloseError::SessionAcquire(e)
            })?;
        info!(markets, "session ready");
        self.record(Event::SessionOpened { markets }).await;

        let mut report = FlashCloseReport::new(Utc::now());
        let outcome = AssertUnwindSafe(self.cleanup(&mut report)).catch_unwind().await;

        // 7) release, juga saat cleanup panic
        if let Err(e) = self.policy.call("close", || self.gateway.close()).await {
            error!(error = %e, "session release failed");
            report.release_error = Some(e.to_string());
        }
        self.record(Event::SessionClosed).await;

        if let Err(panic) = outcome {
            std::panic::resume_unwind(panic);
        }
        report.finished_at = Utc::now();
        Ok(report)
    }

    async fn cleanup(&self, report: &mut FlashCloseReport) {
        report.positions = self.close_positions().await;
        for kind in OrderKind::ALL {
            *report.orders_mut(kind) = self.cancel_orders(kind).await;
        }
        report.residual = self.verify().await;
    }

    pub async fn fetch_open_positions(&self) -> Result<Vec<Position>, OperationFailed> {
        let all = self.policy.call("fetch_positions", || self.gateway.fetch_positions()).await?;
        Ok(all.into_iter().filter(Position::is_open).collect())
    }

    /// Fetch one open-order class.
    ///
    /// The limit query shares its endpoint with other order types, so the
    /// result is narrowed to `orderType == limit`. A malformed limit response
    /// counts as "no orders"; the trigger and TP/SL fetches keep failing loudly.
    pub async fn fetch_open_orders(&self, kind: OrderKind) -> Result<Vec<Order>, OperationFailed> {
        let gw = self.gateway;
        match kind {
            OrderKind::Trigger => {
                self.policy.call("fetch_trigger_orders", || gw.fetch_plan_orders(PlanType::Normal, None)).await
            }
            OrderKind::TpSl => {
                self.policy.call("fetch_tpsl_orders", || gw.fetch_plan_orders(PlanType::ProfitLoss, None)).await
            }
            OrderKind::Limit => {
                self.policy
                    .call("fetch_limit_orders", || async move {
                        match gw.fetch_pending_orders(OrderStatus::Live, None).await {
                            Ok(orders) => Ok(orders.into_iter().filter(Order::is_limit).collect()),
                            Err(GatewayError::MalformedResponse(msg)) => {
                                warn!(%msg, "unexpected response format when fetching limit orders, treating as none");
                                Ok(Vec::new())
                            }
                            Err(e) => Err(e),
                        }
                    })
                    .await
            }
        }
    }

    async fn cancel(&self, kind: OrderKind, order: &Order) -> Result<(), OperationFailed> {
        let gw = self.gateway;
        match kind {
            // TP/SL memakai endpoint cancel yang sama dengan trigger
            OrderKind::Trigger | OrderKind::TpSl => {
                self.policy
                    .call("cancel_trigger_order", || gw.cancel_trigger_order(&order.symbol, &order.order_id))
                    .await
            }
            OrderKind::Limit => {
                self.policy
                    .call("cancel_limit_order", || gw.cancel_limit_order(&order.symbol, &order.order_id))
                    .await
            }
        }
    }

    async fn stage_fetch_failed(&self, stage: &str, e: &OperationFailed) -> StageReport {
        error!(stage, error = %e, "fetch failed, stage skipped");
        self.record(Event::StageFetchFailed { stage: stage.to_string(), error: e.to_string() }).await;
        StageReport { fetch_error: Some(e.to_string()), ..Default::default() }
    }

    async fn close_positions(&self) -> StageReport {
        info!("fetching open positions");
        let positions = match self.fetch_open_positions().await {
            Ok(p) => p,
            Err(e) => return self.stage_fetch_failed("positions", &e).await,
        };
        let mut stage = StageReport { found: positions.len(), ..Default::default() };
        if positions.is_empty() {
            info!("no open positions found");
            return stage;
        }
        info!(count = positions.len(), "found open positions to close");

        for p in &positions {
            let res = self.policy.call("close_position", || self.gateway.close_position(&p.symbol, p.side)).await;
            match res {
                Ok(()) => {
                    stage.done += 1;
                    ITEMS.with_label_values(&["position", "ok"]).inc();
                    info!(symbol = %p.symbol, side = %p.side, contracts = %p.contracts, "closed position");
                    self.record(Event::PositionClosed {
                        symbol: p.symbol.clone(),
                        side: p.side,
                        contracts: p.contracts,
                    })
                    .await;
                }
                Err(e) => {
                    ITEMS.with_label_values(&["position", "failed"]).inc();
                    error!(
                        symbol = %p.symbol,
                        side = %p.side,
                        contracts = %p.contracts,
                        margin_coin = %p.margin_coin,
                        error = %e,
                        "error closing position"
                    );
                    stage.failures.push(ItemFailure {
                        symbol: p.symbol.clone(),
                        id: p.side.to_string(),
                        error: e.to_string(),
                    });
                    self.record(Event::PositionCloseFailed {
                        symbol: p.symbol.clone(),
                        side: p.side,
                        contracts: p.contracts,
                        error: e.to_string(),
                    })
                    .await;
                }
            }
        }
        stage
    }

    async fn cancel_orders(&self, kind: OrderKind) -> StageReport {
        let label = kind.label();
        info!(kind = label, "fetching orders");
        let orders = match self.fetch_open_orders(kind).await {
            Ok(o) => o,
            Err(e) => return self.stage_fetch_failed(kind.metric_label(), &e).await,
        };
        let mut stage = StageReport { found: orders.len(), ..Default::default() };
        if orders.is_empty() {
            info!(kind = label, "no open orders found");
            return stage;
        }
        info!(kind = label, count = orders.len(), "found orders to cancel");

        for o in &orders {
            match self.cancel(kind, o).await {
                Ok(()) => {
                    stage.done += 1;
                    ITEMS.with_label_values(&[kind.metric_label(), "ok"]).inc();
                    info!(kind = label, order_id = %o.order_id, symbol = %o.symbol, "canceled order");
                    self.record(Event::OrderCanceled {
                        kind,
                        symbol: o.symbol.clone(),
                        order_id: o.order_id.clone(),
                    })
                    .await;
                }
                Err(e) => {
                    ITEMS.with_label_values(&[kind.metric_label(), "failed"]).inc();
                    error!(kind = label, order_id = %o.order_id, symbol = %o.symbol, error = %e, "error canceling order");
                    stage.failures.push(ItemFailure {
                        symbol: o.symbol.clone(),
                        id: o.order_id.clone(),
                        error: e.to_string(),
                    });
                    self.record(Event::OrderCancelFailed {
                        kind,
                        symbol: o.symbol.clone(),
                        order_id: o.order_id.clone(),
                        error: e.to_string(),
                    })
                    .await;
                }
            }
        }
        stage
    }

    async fn verify(&self) -> Residual {
        info!("performing final verification");
        let mut residual = Residual::default();

        match self.fetch_open_positions().await {
            Ok(p) => {
                for pos in &p {
                    warn!(symbol = %pos.symbol, side = %pos.side, contracts = %pos.contracts, "position still open");
                }
                residual.positions = Some(p);
            }
            Err(e) => {
                error!(error = %e, "could not verify positions");
                residual.errors.push(format!("positions: {e}"));
            }
        }
        for kind in OrderKind::ALL {
            match self.fetch_open_orders(kind).await {
                Ok(o) => residual.set_orders(kind, Some(o.len())),
                Err(e) => {
                    error!(kind = kind.label(), error = %e, "could not verify orders");
                    residual.errors.push(format!("{}: {e}", kind.metric_label()));
                }
            }
        }

        let gauge = |n: Option<usize>| n.map_or(-1, |n| n as i64);
        RESIDUAL.with_label_values(&["position"]).set(gauge(residual.remaining_positions()));
        for kind in OrderKind::ALL {
            RESIDUAL.with_label_values(&[kind.metric_label()]).set(gauge(residual.orders(kind)));
        }

        match residual.remaining_positions() {
            Some(0) => info!("all positions closed successfully"),
            Some(n) => warn!(remaining = n, "positions still open"),
            None => {}
        }
        match residual.remaining_orders() {
            Some(0) => info!("all orders canceled successfully"),
            Some(n) => warn!(
                remaining = n,
                trigger = residual.trigger_orders,
                tpsl = residual.tpsl_orders,
                limit = residual.limit_orders,
                "orders still open"
            ),
            None => {}
        }
        self.record(Event::Verified {
            positions: residual.remaining_positions(),
            trigger: residual.trigger_orders,
            tpsl: residual.tpsl_orders,
            limit: residual.limit_orders,
        })
        .await;
        residual
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PositionSide, ProductType};
    use crate::gateway::{Call, MockGateway, Op};
    use rust_decimal::Decimal;
    use tokio::time::Duration;

    fn fast() -> RetryPolicy {
        RetryPolicy::new(5, Duration::from_millis(1))
    }

    fn position(symbol: &str, side: PositionSide, contracts: i64) -> Position {
        Position { symbol: symbol.into(), side, contracts: Decimal::new(contracts, 0), margin_coin: "USDT".into() }
    }

    fn boom() -> GatewayError {
        GatewayError::Api { code: "22002".into(), msg: "position is being liquidated".into() }
    }

    #[tokio::test]
    async fn end_to_end_cleanup_reports_success() {
        let gw = MockGateway::new(ProductType::UsdtFutures)
            .with_position(position("BTC/USDT:USDT", PositionSide::Long, 2))
            .with_plan_order(PlanType::Normal, "BTC/USDT:USDT", "T1")
            .with_pending_order("ETH/USDT:USDT", "L1", "limit");

        let report = FlashClose::new(&gw, fast()).run().await.unwrap();
        let lines = report.summary_lines();

        assert_eq!(lines[0], "1 open position closed");
        assert_eq!(lines[1], "1 trigger order canceled");
        assert_eq!(lines[2], "no TP/SL orders");
        assert_eq!(lines[3], "1 limit order canceled");
        assert!(lines.contains(&"All positions closed successfully".to_string()));
        assert!(lines.contains(&"All orders canceled successfully".to_string()));
        assert!(report.is_flat());
        assert_eq!(gw.sessions_closed(), 1);
    }

    #[tokio::test]
    async fn stages_run_in_order_and_verification_refetches_everything() {
        let gw = MockGateway::new(ProductType::UsdtFutures);
        FlashClose::new(&gw, fast()).run().await.unwrap();

        let expected = vec![
            Call::LoadMarkets,
            Call::FetchPositions,
            Call::FetchPlanOrders(PlanType::Normal),
            Call::FetchPlanOrders(PlanType::ProfitLoss),
            Call::FetchPendingOrders(OrderStatus::Live),
            Call::FetchPositions,
            Call::FetchPlanOrders(PlanType::Normal),
            Call::FetchPlanOrders(PlanType::ProfitLoss),
            Call::FetchPendingOrders(OrderStatus::Live),
            Call::Close,
        ];
        assert_eq!(gw.calls(), expected);
    }

    #[tokio::test]
    async fn one_failing_position_does_not_block_the_others() {
        let gw = MockGateway::new(ProductType::UsdtFutures)
            .with_position(position("BTC/USDT:USDT", PositionSide::Long, 1))
            .with_position(position("ETH/USDT:USDT", PositionSide::Short, 3))
            .with_position(position("SOL/USDT:USDT", PositionSide::Long, 7));
        gw.fail_always(Op::ClosePosition, "ETH/USDT:USDT", boom());

        let report = FlashClose::new(&gw, fast()).run().await.unwrap();

        let closes: Vec<String> = gw
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::ClosePosition { symbol, .. } => Some(symbol),
                _ => None,
            })
            .collect();
        assert_eq!(closes, vec!["BTC/USDT:USDT", "ETH/USDT:USDT", "SOL/USDT:USDT"]);

        assert_eq!(report.positions.found, 3);
        assert_eq!(report.positions.done, 2);
        assert_eq!(report.positions.failures.len(), 1);
        assert_eq!(report.positions.failures[0].symbol, "ETH/USDT:USDT");

        let left = report.residual.positions.clone().unwrap();
        assert_eq!(left, vec![position("ETH/USDT:USDT", PositionSide::Short, 3)]);
        let lines = report.summary_lines();
        assert!(lines.contains(&"WARNING: 1 positions still open".to_string()));
        assert!(lines.contains(&"  - ETH/USDT:USDT short: 3 contracts".to_string()));
        assert!(!report.is_flat());
    }

    #[tokio::test]
    async fn no_positions_still_cancels_every_order_kind() {
        let gw = MockGateway::new(ProductType::UsdtFutures)
            .with_plan_order(PlanType::Normal, "BTC/USDT:USDT", "T1")
            .with_plan_order(PlanType::ProfitLoss, "BTC/USDT:USDT", "P1")
            .with_pending_order("ETH/USDT:USDT", "L1", "limit");

        let report = FlashClose::new(&gw, fast()).run().await.unwrap();

        assert_eq!(gw.count(Op::ClosePosition), 0);
        assert_eq!(report.summary_lines()[0], "no open positions");
        assert_eq!(report.trigger_orders.done, 1);
        assert_eq!(report.tpsl_orders.done, 1);
        assert_eq!(report.limit_orders.done, 1);
        assert!(report.is_flat());
    }

    #[tokio::test]
    async fn tpsl_orders_are_canceled_through_the_trigger_endpoint() {
        let gw = MockGateway::new(ProductType::UsdtFutures)
            .with_plan_order(PlanType::ProfitLoss, "BTC/USDT:USDT", "TPSL-7");

        FlashClose::new(&gw, fast()).run().await.unwrap();

        assert!(gw.calls().contains(&Call::CancelTriggerOrder {
            symbol: "BTC/USDT:USDT".into(),
            order_id: "TPSL-7".into(),
        }));
        assert_eq!(gw.count(Op::CancelLimitOrder), 0);
    }

    #[tokio::test]
    async fn limit_stage_skips_non_limit_orders() {
        let gw = MockGateway::new(ProductType::UsdtFutures)
            .with_pending_order("ETH/USDT:USDT", "L1", "limit")
            .with_pending_order("ETH/USDT:USDT", "M1", "market");

        let fc = FlashClose::new(&gw, fast());
        let orders = fc.fetch_open_orders(OrderKind::Limit).await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].order_id, "L1");

        let report = fc.run().await.unwrap();
        assert_eq!(report.limit_orders.found, 1);
        assert_eq!(gw.count(Op::CancelLimitOrder), 1);
    }

    #[tokio::test]
    async fn malformed_limit_response_counts_as_no_orders() {
        let gw = MockGateway::new(ProductType::UsdtFutures);
        gw.malformed_pending_response();

        let fc = FlashClose::new(&gw, fast());
        assert!(fc.fetch_open_orders(OrderKind::Limit).await.unwrap().is_empty());
        // tidak di-retry
        assert_eq!(gw.count(Op::FetchPendingOrders), 1);

        let report = fc.run().await.unwrap();
        assert!(report.limit_orders.fetch_error.is_none());
        assert_eq!(report.residual.limit_orders, Some(0));
    }

    #[tokio::test]
    async fn malformed_trigger_response_is_a_stage_failure() {
        let gw = MockGateway::new(ProductType::UsdtFutures)
            .with_pending_order("ETH/USDT:USDT", "L1", "limit");
        gw.fail_times(Op::FetchPlanOrders, 1, GatewayError::MalformedResponse("no entrustedList".into()));

        let report = FlashClose::new(&gw, fast()).run().await.unwrap();

        assert!(report.trigger_orders.fetch_error.as_deref().unwrap().contains("no entrustedList"));
        // stage berikutnya tetap jalan
        assert_eq!(report.limit_orders.done, 1);
        assert!(report.residual.errors.is_empty());
        assert_eq!(gw.sessions_closed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_cancel_is_retried_then_succeeds() {
        let gw = MockGateway::new(ProductType::UsdtFutures)
            .with_plan_order(PlanType::Normal, "BTC/USDT:USDT", "T1");
        gw.fail_times(Op::CancelTriggerOrder, 2, GatewayError::RateLimited("slow down".into()));

        let report = FlashClose::new(&gw, RetryPolicy::default()).run().await.unwrap();

        assert_eq!(gw.count(Op::CancelTriggerOrder), 3);
        assert_eq!(report.trigger_orders.done, 1);
        assert!(report.is_flat());
    }

    #[tokio::test]
    async fn acquire_failure_aborts_without_release() {
        let gw = MockGateway::new(ProductType::UsdtFutures)
            .with_position(position("BTC/USDT:USDT", PositionSide::Long, 1));
        gw.fail_times(Op::LoadMarkets, 1, GatewayError::Auth("bad passphrase".into()));

        let err = FlashClose::new(&gw, fast()).run().await.unwrap_err();
        assert!(err.to_string().contains("bad passphrase"));
        assert_eq!(gw.calls(), vec![Call::LoadMarkets]);
        assert_eq!(gw.sessions_closed(), 0);
    }

    #[tokio::test]
    async fn release_failure_is_reported_not_raised() {
        let gw = MockGateway::new(ProductType::UsdtFutures);
        gw.fail_times(Op::Close, 1, GatewayError::Transport("reset".into()));

        let report = FlashClose::new(&gw, fast()).run().await.unwrap();
        assert!(report.release_error.as_deref().unwrap().contains("reset"));
        assert_eq!(gw.count(Op::Close), 1);
    }

    #[tokio::test]
    async fn verification_failure_leaves_class_unknown() {
        let gw = MockGateway::new(ProductType::UsdtFutures)
            .with_plan_order(PlanType::Normal, "BTC/USDT:USDT", "T1");
        // stage dan verifikasi posisi sama-sama gagal
        gw.fail_times(Op::FetchPositions, 2, GatewayError::Transport("timeout".into()));

        let report = FlashClose::new(&gw, fast()).run().await.unwrap();
        assert!(report.positions.fetch_error.is_some());
        // stage order tetap jalan
        assert_eq!(report.trigger_orders.done, 1);
        assert!(report.residual.positions.is_none());
        assert_eq!(report.residual.remaining_orders(), Some(0));
        assert!(!report.is_flat());
        assert!(report.summary_lines().contains(&"WARNING: positions could not be verified".to_string()));
    }

    #[tokio::test]
    async fn recorder_receives_item_events() {
        let gw = MockGateway::new(ProductType::UsdtFutures)
            .with_position(position("BTC/USDT:USDT", PositionSide::Long, 1))
            .with_plan_order(PlanType::Normal, "BTC/USDT:USDT", "T1");
        gw.fail_always(Op::CancelTriggerOrder, "T1", boom());

        let (tx, mut rx) = mpsc::channel(64);
        FlashClose::new(&gw, fast()).with_recorder(tx).run().await.unwrap();

        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        assert!(matches!(events.first(), Some(Event::SessionOpened { .. })));
        assert!(events.iter().any(|e| matches!(e, Event::PositionClosed { .. })));
        assert!(events.iter().any(|e| matches!(e, Event::OrderCancelFailed { order_id, .. } if order_id == "T1")));
        assert!(matches!(events.last(), Some(Event::SessionClosed)));
    }

    struct PanickyGateway {
        inner: MockGateway,
    }

    #[async_trait::async_trait]
    impl Gateway for PanickyGateway {
        async fn load_markets(&self) -> Result<usize, GatewayError> { self.inner.load_markets().await }
        async fn close(&self) -> Result<(), GatewayError> { self.inner.close().await }
        async fn fetch_positions(&self) -> Result<Vec<Position>, GatewayError> {
            panic!("decoder bug")
        }
        async fn close_position(&self, symbol: &str, side: PositionSide) -> Result<(), GatewayError> {
            self.inner.close_position(symbol, side).await
        }
        async fn fetch_plan_orders(&self, p: PlanType, s: Option<&str>) -> Result<Vec<Order>, GatewayError> {
            self.inner.fetch_plan_orders(p, s).await
        }
        async fn fetch_pending_orders(&self, st: OrderStatus, s: Option<&str>) -> Result<Vec<Order>, GatewayError> {
            self.inner.fetch_pending_orders(st, s).await
        }
        async fn cancel_trigger_order(&self, symbol: &str, id: &str) -> Result<(), GatewayError> {
            self.inner.cancel_trigger_order(symbol, id).await
        }
        async fn cancel_limit_order(&self, symbol: &str, id: &str) -> Result<(), GatewayError> {
            self.inner.cancel_limit_order(symbol, id).await
        }
    }

    #[tokio::test]
    async fn session_is_released_even_when_cleanup_panics() {
        let gw = PanickyGateway { inner: MockGateway::new(ProductType::UsdtFutures) };
        let outcome = AssertUnwindSafe(FlashClose::new(&gw, fast()).run()).catch_unwind().await;
        assert!(outcome.is_err());
        assert_eq!(gw.inner.sessions_closed(), 1);
    }
}
