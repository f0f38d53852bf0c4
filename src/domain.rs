// ===============================
// src/domain.rs
// ===============================
use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Produk futures Bitget yang didukung (menentukan margin coin)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProductType {
    #[serde(rename = "USDT-FUTURES")]
    UsdtFutures,
    #[serde(rename = "USDC-FUTURES")]
    UsdcFutures,
}

impl ProductType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "USDT-FUTURES" | "USDT" => Some(ProductType::UsdtFutures),
            "USDC-FUTURES" | "USDC" => Some(ProductType::UsdcFutures),
            _ => None,
        }
    }

    /// Wire value for the `productType` parameter.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductType::UsdtFutures => "USDT-FUTURES",
            ProductType::UsdcFutures => "USDC-FUTURES",
        }
    }

    pub fn margin_coin(&self) -> &'static str {
        match self {
            ProductType::UsdtFutures => "USDT",
            ProductType::UsdcFutures => "USDC",
        }
    }
}

impl fmt::Display for ProductType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide { Long, Short }

impl PositionSide {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "long" => Some(PositionSide::Long),
            "short" => Some(PositionSide::Short),
            _ => None,
        }
    }
    pub fn as_str(&self) -> &'static str {
        match self { PositionSide::Long => "long", PositionSide::Short => "short" }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub contracts: Decimal,
    pub margin_coin: String,
}

impl Position {
    /// Only positions holding contracts are eligible for closing.
    pub fn is_open(&self) -> bool { self.contracts > Decimal::ZERO }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub symbol: String,
    pub order_id: String,
    pub order_type: String,
    pub plan_type: Option<String>,
    pub status: Option<String>,
}

impl Order {
    pub fn is_limit(&self) -> bool { self.order_type.eq_ignore_ascii_case("limit") }
}

/// Filter `planType` untuk endpoint plan-pending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlanType {
    /// Trigger orders (`normal_plan` on the wire).
    Normal,
    ProfitLoss,
}

impl PlanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanType::Normal => "normal_plan",
            PlanType::ProfitLoss => "profit_loss",
        }
    }
}

/// Filter `status` untuk endpoint orders-pending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus { Live }

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self { OrderStatus::Live => "live" }
    }
}

/// The three open-order classes the cleanup walks through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind { Trigger, TpSl, Limit }

impl OrderKind {
    pub const ALL: [OrderKind; 3] = [OrderKind::Trigger, OrderKind::TpSl, OrderKind::Limit];

    pub fn label(&self) -> &'static str {
        match self {
            OrderKind::Trigger => "trigger",
            OrderKind::TpSl => "TP/SL",
            OrderKind::Limit => "limit",
        }
    }

    /// Metric label (no slash).
    pub fn metric_label(&self) -> &'static str {
        match self {
            OrderKind::Trigger => "trigger",
            OrderKind::TpSl => "tpsl",
            OrderKind::Limit => "limit",
        }
    }
}

/// Audit events appended by the recorder (one JSON line each).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    SessionOpened { markets: usize },
    PositionClosed { symbol: String, side: PositionSide, contracts: Decimal },
    PositionCloseFailed { symbol: String, side: PositionSide, contracts: Decimal, error: String },
    OrderCanceled { kind: OrderKind, symbol: String, order_id: String },
    OrderCancelFailed { kind: OrderKind, symbol: String, order_id: String, error: String },
    StageFetchFailed { stage: String, error: String },
    /// `None` when that class could not be re-fetched.
    Verified { positions: Option<usize>, trigger: Option<usize>, tpsl: Option<usize>, limit: Option<usize> },
    SessionClosed,
    Note { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn product_type_parses_and_derives_margin_coin() {
        assert_eq!(ProductType::parse("usdt-futures"), Some(ProductType::UsdtFutures));
        assert_eq!(ProductType::parse("USDC"), Some(ProductType::UsdcFutures));
        assert_eq!(ProductType::parse("COIN-FUTURES"), None);
        assert_eq!(ProductType::UsdtFutures.margin_coin(), "USDT");
        assert_eq!(ProductType::UsdcFutures.margin_coin(), "USDC");
    }

    #[test]
    fn only_positions_with_contracts_are_open() {
        let mut p = Position {
            symbol: "BTC/USDT:USDT".into(),
            side: PositionSide::Long,
            contracts: Decimal::new(2, 0),
            margin_coin: "USDT".into(),
        };
        assert!(p.is_open());
        p.contracts = Decimal::ZERO;
        assert!(!p.is_open());
    }

    #[test]
    fn limit_filter_ignores_other_order_types() {
        let mk = |t: &str| Order {
            symbol: "ETH/USDT:USDT".into(),
            order_id: "1".into(),
            order_type: t.into(),
            plan_type: None,
            status: Some("live".into()),
        };
        assert!(mk("limit").is_limit());
        assert!(!mk("market").is_limit());
    }
}
