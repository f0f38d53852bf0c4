// ===============================
// src/gateway.rs (exchange seam + mock venue)
// ===============================
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::time::{sleep, Duration};

use crate::domain::{Order, OrderStatus, PlanType, Position, PositionSide, ProductType};

/// Bitget code for "too many requests".
pub const RATE_LIMIT_CODE: &str = "429";

/// Every failure an exchange call can report, translated at the venue boundary.
/// Only the rate-limit flavour is considered transient.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("rate limit exceeded: {0}")]
    RateLimited(String),
    #[error("{{\"code\":\"{code}\",\"msg\":\"{msg}\"}}")]
    Api { code: String, msg: String },
    #[error("http {status}: {body}")]
    Http { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected response shape: {0}")]
    MalformedResponse(String),
    #[error("authentication failed: {0}")]
    Auth(String),
}

impl GatewayError {
    pub fn is_rate_limited(&self) -> bool {
        match self {
            GatewayError::RateLimited(_) => true,
            GatewayError::Api { code, .. } => code == RATE_LIMIT_CODE,
            GatewayError::Http { status, body } => {
                *status == 429 || body.starts_with(&format!("{{\"code\":\"{RATE_LIMIT_CODE}\""))
            }
            _ => false,
        }
    }
}

/// Remote operations the cleanup needs from one exchange account.
/// Product type and margin coin are fixed per instance.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Load market metadata, returns the number of markets known.
    async fn load_markets(&self) -> Result<usize, GatewayError>;
    async fn close(&self) -> Result<(), GatewayError>;
    async fn fetch_positions(&self) -> Result<Vec<Position>, GatewayError>;
    async fn close_position(&self, symbol: &str, side: PositionSide) -> Result<(), GatewayError>;
    async fn fetch_plan_orders(
        &self,
        plan_type: PlanType,
        symbol: Option<&str>,
    ) -> Result<Vec<Order>, GatewayError>;
    async fn fetch_pending_orders(
        &self,
        status: OrderStatus,
        symbol: Option<&str>,
    ) -> Result<Vec<Order>, GatewayError>;
    /// Cancels trigger and TP/SL orders (shared endpoint).
    async fn cancel_trigger_order(&self, symbol: &str, order_id: &str) -> Result<(), GatewayError>;
    async fn cancel_limit_order(&self, symbol: &str, order_id: &str) -> Result<(), GatewayError>;
}

// -----------------------------------------------------------------------------
// Mock venue: in-memory account, dipakai untuk VENUE_MODE=mock dan unit test
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    LoadMarkets,
    Close,
    FetchPositions,
    ClosePosition,
    FetchPlanOrders,
    FetchPendingOrders,
    CancelTriggerOrder,
    CancelLimitOrder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    LoadMarkets,
    Close,
    FetchPositions,
    ClosePosition { symbol: String, side: PositionSide },
    FetchPlanOrders(PlanType),
    FetchPendingOrders(OrderStatus),
    CancelTriggerOrder { symbol: String, order_id: String },
    CancelLimitOrder { symbol: String, order_id: String },
}

impl Call {
    pub fn op(&self) -> Op {
        match self {
            Call::LoadMarkets => Op::LoadMarkets,
            Call::Close => Op::Close,
            Call::FetchPositions => Op::FetchPositions,
            Call::ClosePosition { .. } => Op::ClosePosition,
            Call::FetchPlanOrders(_) => Op::FetchPlanOrders,
            Call::FetchPendingOrders(_) => Op::FetchPendingOrders,
            Call::CancelTriggerOrder { .. } => Op::CancelTriggerOrder,
            Call::CancelLimitOrder { .. } => Op::CancelLimitOrder,
        }
    }

    /// Symbol or order id the call acts on, used to match sticky failures.
    fn target(&self) -> Option<&str> {
        match self {
            Call::ClosePosition { symbol, .. } => Some(symbol),
            Call::CancelTriggerOrder { order_id, .. } | Call::CancelLimitOrder { order_id, .. } => {
                Some(order_id)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    positions: Vec<Position>,
    plan_orders: Vec<Order>,
    pending_orders: Vec<Order>,
    calls: Vec<Call>,
    // kegagalan sekali pakai per operasi (FIFO)
    scripted: HashMap<Op, VecDeque<GatewayError>>,
    // kegagalan permanen per (operasi, symbol/order id)
    sticky: Vec<(Op, String, GatewayError)>,
    malformed_pending: bool,
    sessions_closed: usize,
}

#[derive(Debug)]
pub struct MockGateway {
    product_type: ProductType,
    latency: Duration,
    state: Mutex<MockState>,
}

impl MockGateway {
    pub fn new(product_type: ProductType) -> Self {
        Self { product_type, latency: Duration::ZERO, state: Mutex::new(MockState::default()) }
    }

    /// Demo account used by `VENUE_MODE=mock`.
    pub fn demo(product_type: ProductType) -> Self {
        let coin = product_type.margin_coin();
        let sym = |base: &str| format!("{base}/{coin}:{coin}");
        let mut gw = Self::new(product_type)
            .with_position(Position {
                symbol: sym("BTC"),
                side: PositionSide::Long,
                contracts: Decimal::new(2, 0),
                margin_coin: coin.to_string(),
            })
            .with_plan_order(PlanType::Normal, sym("BTC"), "T1")
            .with_plan_order(PlanType::ProfitLoss, sym("BTC"), "P1")
            .with_pending_order(sym("ETH"), "L1", "limit");
        gw.latency = Duration::from_millis(20);
        gw
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn with_position(self, position: Position) -> Self {
        self.lock().positions.push(position);
        self
    }

    pub fn with_plan_order(self, plan_type: PlanType, symbol: impl Into<String>, order_id: &str) -> Self {
        self.lock().plan_orders.push(Order {
            symbol: symbol.into(),
            order_id: order_id.to_string(),
            order_type: "market".to_string(),
            plan_type: Some(plan_type.as_str().to_string()),
            status: Some("live".to_string()),
        });
        self
    }

    pub fn with_pending_order(self, symbol: impl Into<String>, order_id: &str, order_type: &str) -> Self {
        self.lock().pending_orders.push(Order {
            symbol: symbol.into(),
            order_id: order_id.to_string(),
            order_type: order_type.to_string(),
            plan_type: None,
            status: Some(OrderStatus::Live.as_str().to_string()),
        });
        self
    }

    /// Fail the next `times` calls of `op` with `err`.
    pub fn fail_times(&self, op: Op, times: usize, err: GatewayError) {
        let mut st = self.lock();
        let q = st.scripted.entry(op).or_default();
        for _ in 0..times {
            q.push_back(err.clone());
        }
    }

    /// Fail every call of `op` targeting `target` (symbol for positions, order id for orders).
    pub fn fail_always(&self, op: Op, target: &str, err: GatewayError) {
        self.lock().sticky.push((op, target.to_string(), err));
    }

    /// Orders-pending answers without its data field.
    pub fn malformed_pending_response(&self) {
        self.lock().malformed_pending = true;
    }

    pub fn calls(&self) -> Vec<Call> { self.lock().calls.clone() }

    pub fn count(&self, op: Op) -> usize {
        self.lock().calls.iter().filter(|c| c.op() == op).count()
    }

    pub fn sessions_closed(&self) -> usize { self.lock().sessions_closed }


    async fn enter(&self, call: Call) -> Result<(), GatewayError> {
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }
        let mut st = self.lock();
        let op = call.op();
        let target = call.target().map(str::to_string);
        st.calls.push(call);
        if let Some(err) = st.scripted.get_mut(&op).and_then(|q| q.pop_front()) {
            return Err(err);
        }
        if let Some(t) = target {
            if let Some((_, _, err)) = st.sticky.iter().find(|(o, tg, _)| *o == op && *tg == t) {
                return Err(err.clone());
            }
        }
        Ok(())
    }
}

fn not_found(code: &str, msg: &str) -> GatewayError {
    GatewayError::Api { code: code.to_string(), msg: msg.to_string() }
}

#[async_trait]
impl Gateway for MockGateway {
    async fn load_markets(&self) -> Result<usize, GatewayError> {
        self.enter(Call::LoadMarkets).await?;
        let st = self.lock();
        let mut symbols: Vec<&str> = st
            .positions
            .iter()
            .map(|p| p.symbol.as_str())
            .chain(st.plan_orders.iter().map(|o| o.symbol.as_str()))
            .chain(st.pending_orders.iter().map(|o| o.symbol.as_str()))
            .collect();
        symbols.sort_unstable();
        symbols.dedup();
        Ok(symbols.len())
    }

    async fn close(&self) -> Result<(), GatewayError> {
        self.enter(Call::Close).await?;
        self.lock().sessions_closed += 1;
        Ok(())
    }

    async fn fetch_positions(&self) -> Result<Vec<Position>, GatewayError> {
        self.enter(Call::FetchPositions).await?;
        // sama seperti query all-position: hanya margin coin milik product type ini
        let coin = self.product_type.margin_coin();
        Ok(self.lock().positions.iter().filter(|p| p.margin_coin == coin).cloned().collect())
    }

    async fn close_position(&self, symbol: &str, side: PositionSide) -> Result<(), GatewayError> {
        self.enter(Call::ClosePosition { symbol: symbol.to_string(), side }).await?;
        let mut st = self.lock();
        let before = st.positions.len();
        st.positions.retain(|p| !(p.symbol == symbol && p.side == side));
        if st.positions.len() == before {
            return Err(not_found("22002", "No position to close"));
        }
        Ok(())
    }

    async fn fetch_plan_orders(
        &self,
        plan_type: PlanType,
        symbol: Option<&str>,
    ) -> Result<Vec<Order>, GatewayError> {
        self.enter(Call::FetchPlanOrders(plan_type)).await?;
        Ok(self
            .lock()
            .plan_orders
            .iter()
            .filter(|o| o.plan_type.as_deref() == Some(plan_type.as_str()))
            .filter(|o| symbol.map_or(true, |s| o.symbol == s))
            .cloned()
            .collect())
    }

    async fn fetch_pending_orders(
        &self,
        status: OrderStatus,
        symbol: Option<&str>,
    ) -> Result<Vec<Order>, GatewayError> {
        self.enter(Call::FetchPendingOrders(status)).await?;
        let st = self.lock();
        if st.malformed_pending {
            return Err(GatewayError::MalformedResponse("orders-pending: missing data".into()));
        }
        Ok(st
            .pending_orders
            .iter()
            .filter(|o| o.status.as_deref() == Some(status.as_str()))
            .filter(|o| symbol.map_or(true, |s| o.symbol == s))
            .cloned()
            .collect())
    }

    async fn cancel_trigger_order(&self, symbol: &str, order_id: &str) -> Result<(), GatewayError> {
        self.enter(Call::CancelTriggerOrder { symbol: symbol.to_string(), order_id: order_id.to_string() })
            .await?;
        let mut st = self.lock();
        let before = st.plan_orders.len();
        st.plan_orders.retain(|o| !(o.symbol == symbol && o.order_id == order_id));
        if st.plan_orders.len() == before {
            return Err(not_found("40768", "Order does not exist"));
        }
        Ok(())
    }

    async fn cancel_limit_order(&self, symbol: &str, order_id: &str) -> Result<(), GatewayError> {
        self.enter(Call::CancelLimitOrder { symbol: symbol.to_string(), order_id: order_id.to_string() })
            .await?;
        let mut st = self.lock();
        let before = st.pending_orders.len();
        st.pending_orders.retain(|o| !(o.symbol == symbol && o.order_id == order_id));
        if st.pending_orders.len() == before {
            return Err(not_found("40768", "Order does not exist"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_is_recognised_by_kind_code_or_payload() {
        assert!(GatewayError::RateLimited("slow down".into()).is_rate_limited());
        assert!(GatewayError::Api { code: "429".into(), msg: "Too Many Requests".into() }.is_rate_limited());
        assert!(GatewayError::Http { status: 429, body: String::new() }.is_rate_limited());
        assert!(GatewayError::Http {
            status: 400,
            body: r#"{"code":"429","msg":"Too Many Requests"}"#.into()
        }
        .is_rate_limited());

        assert!(!GatewayError::Api { code: "40768".into(), msg: "Order does not exist".into() }.is_rate_limited());
        assert!(!GatewayError::Transport("connection reset".into()).is_rate_limited());
        assert!(!GatewayError::MalformedResponse("no data".into()).is_rate_limited());
    }

    #[test]
    fn api_error_renders_like_the_exchange_payload() {
        let e = GatewayError::Api { code: "429".into(), msg: "Too Many Requests".into() };
        assert_eq!(e.to_string(), r#"{"code":"429","msg":"Too Many Requests"}"#);
    }

    #[tokio::test]
    async fn mock_scripted_failures_are_consumed_in_order() {
        let gw = MockGateway::new(ProductType::UsdtFutures);
        gw.fail_times(Op::FetchPositions, 1, GatewayError::RateLimited("x".into()));
        assert!(gw.fetch_positions().await.is_err());
        assert!(gw.fetch_positions().await.is_ok());
        assert_eq!(gw.count(Op::FetchPositions), 2);
    }

    #[tokio::test]
    async fn mock_sticky_failure_only_hits_its_target() {
        let gw = MockGateway::new(ProductType::UsdtFutures)
            .with_pending_order("ETH/USDT:USDT", "L1", "limit")
            .with_pending_order("ETH/USDT:USDT", "L2", "limit");
        gw.fail_always(Op::CancelLimitOrder, "L1", GatewayError::Transport("boom".into()));

        assert!(gw.cancel_limit_order("ETH/USDT:USDT", "L1").await.is_err());
        assert!(gw.cancel_limit_order("ETH/USDT:USDT", "L2").await.is_ok());
        let left = gw.fetch_pending_orders(OrderStatus::Live, None).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].order_id, "L1");
    }

    #[tokio::test]
    async fn positions_are_scoped_to_the_product_margin_coin() {
        let pos = |coin: &str| Position {
            symbol: format!("BTC/{coin}:{coin}"),
            side: PositionSide::Long,
            contracts: Decimal::ONE,
            margin_coin: coin.to_string(),
        };
        let gw = MockGateway::new(ProductType::UsdcFutures).with_position(pos("USDT")).with_position(pos("USDC"));
        let got = gw.fetch_positions().await.unwrap();
        assert_eq!(got, vec![pos("USDC")]);
    }

    #[tokio::test]
    async fn demo_book_has_every_resource_class() {
        let gw = MockGateway::demo(ProductType::UsdtFutures);
        assert_eq!(gw.fetch_positions().await.unwrap().len(), 1);
        assert_eq!(gw.fetch_plan_orders(PlanType::Normal, None).await.unwrap().len(), 1);
        assert_eq!(gw.fetch_plan_orders(PlanType::ProfitLoss, None).await.unwrap().len(), 1);
        assert_eq!(gw.fetch_pending_orders(OrderStatus::Live, None).await.unwrap().len(), 1);
    }
}
