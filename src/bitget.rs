// ===============================
// src/bitget.rs
// ===============================
//
// Helper Bitget v2 (mix): signer, envelope response, model mentah, dan tabel market.
//
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use ahash::AHashMap as HashMap;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use tracing::warn;

use crate::domain::{Order, Position, PositionSide};
use crate::gateway::{GatewayError, RATE_LIMIT_CODE};

pub const SUCCESS_CODE: &str = "00000";

pub const PATH_CONTRACTS: &str = "/api/v2/mix/market/contracts";
pub const PATH_ALL_POSITIONS: &str = "/api/v2/mix/position/all-position";
pub const PATH_CLOSE_POSITIONS: &str = "/api/v2/mix/order/close-positions";
pub const PATH_PLAN_PENDING: &str = "/api/v2/mix/order/orders-plan-pending";
pub const PATH_ORDERS_PENDING: &str = "/api/v2/mix/order/orders-pending";
pub const PATH_CANCEL_PLAN: &str = "/api/v2/mix/order/cancel-plan-order";
pub const PATH_CANCEL_ORDER: &str = "/api/v2/mix/order/cancel-order";

pub fn timestamp_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// `ACCESS-SIGN`: base64(HMAC-SHA256(secret, ts + METHOD + path[?query] + body)).
pub fn sign(secret: &str, ts: u64, method: &str, request_path: &str, body: &str) -> String {
    let prehash = format!("{ts}{}{request_path}{body}", method.to_ascii_uppercase());
    // HMAC menerima key dengan panjang berapa pun
    let mut mac = match Hmac::<Sha256>::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return String::new(),
    };
    mac.update(prehash.as_bytes());
    STANDARD.encode(mac.finalize().into_bytes())
}

pub fn encode_query(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// `BTC/USDT:USDT` -> `BTCUSDT`; raw symbols pass through.
pub fn format_symbol(symbol: &str) -> String {
    if symbol.contains('/') {
        let pair = symbol.split(':').next().unwrap_or(symbol);
        pair.replace('/', "")
    } else {
        symbol.to_string()
    }
}

// --- Envelope semua response REST ---
#[derive(Debug, Deserialize)]
pub struct Envelope {
    pub code: String,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// Translate one HTTP answer into the gateway taxonomy.
/// `Ok(None)` means success without a `data` field (or `data: null`).
pub fn decode<T: DeserializeOwned>(status: u16, body: &str) -> Result<Option<T>, GatewayError> {
    if status == 429 {
        return Err(GatewayError::RateLimited(body.to_string()));
    }
    let env: Envelope = match serde_json::from_str(body) {
        Ok(env) => env,
        Err(_) if !(200..300).contains(&status) => {
            return Err(GatewayError::Http { status, body: body.to_string() })
        }
        Err(e) => return Err(GatewayError::MalformedResponse(format!("{e}: {body}"))),
    };
    if env.code != SUCCESS_CODE {
        if env.code == RATE_LIMIT_CODE {
            return Err(GatewayError::RateLimited(env.msg));
        }
        return Err(GatewayError::Api { code: env.code, msg: env.msg });
    }
    match env.data {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => serde_json::from_value(v)
            .map(Some)
            .map_err(|e| GatewayError::MalformedResponse(e.to_string())),
    }
}

// --- Model mentah ---
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawContract {
    pub symbol: String,
    pub base_coin: String,
    pub quote_coin: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPosition {
    pub symbol: String,
    pub margin_coin: String,
    pub hold_side: String,
    pub total: String, // jumlah kontrak (string desimal)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawOrderList {
    #[serde(default)]
    pub entrusted_list: Option<Vec<RawOrder>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawOrder {
    pub symbol: String,
    pub order_id: String,
    #[serde(default)]
    pub order_type: Option<String>,
    #[serde(default)]
    pub plan_type: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Raw <-> unified symbol table built from the contracts endpoint.
/// USDC contracts are named `BTCPERP` on Bitget, so the raw name is always
/// looked up here instead of derived from the unified one.
#[derive(Debug, Default, Clone)]
pub struct MarketTable {
    unified: HashMap<String, String>,
    raw: HashMap<String, String>,
}

impl MarketTable {
    pub fn from_contracts(contracts: &[RawContract], margin_coin: &str) -> Self {
        let mut table = Self::default();
        for c in contracts {
            let unified = format!("{}/{}:{}", c.base_coin, c.quote_coin, margin_coin);
            table.raw.insert(unified.clone(), c.symbol.clone());
            table.unified.insert(c.symbol.clone(), unified);
        }
        table
    }

    pub fn len(&self) -> usize { self.unified.len() }

    /// Unknown symbols stay raw.
    pub fn unify(&self, raw: &str) -> String {
        self.unified.get(raw).cloned().unwrap_or_else(|| raw.to_string())
    }

    /// Exchange symbol for a unified one; unknown symbols fall back to [`format_symbol`].
    pub fn raw(&self, symbol: &str) -> String {
        self.raw.get(symbol).cloned().unwrap_or_else(|| format_symbol(symbol))
    }

    /// Rows that do not parse are skipped with a warning, the rest are kept.
    pub fn positions(&self, rows: Vec<RawPosition>) -> Vec<Position> {
        rows.into_iter()
            .filter_map(|row| {
                let symbol = row.symbol.clone();
                match self.position(row) {
                    Ok(p) => Some(p),
                    Err(e) => {
                        warn!(%symbol, error = %e, "skipping unreadable position row");
                        None
                    }
                }
            })
            .collect()
    }

    pub fn position(&self, raw: RawPosition) -> Result<Position, GatewayError> {
        let side = PositionSide::parse(&raw.hold_side)
            .ok_or_else(|| GatewayError::MalformedResponse(format!("holdSide {:?}", raw.hold_side)))?;
        let contracts = Decimal::from_str(raw.total.trim())
            .map_err(|e| GatewayError::MalformedResponse(format!("total {:?}: {e}", raw.total)))?;
        Ok(Position { symbol: self.unify(&raw.symbol), side, contracts, margin_coin: raw.margin_coin })
    }

    pub fn order(&self, raw: RawOrder) -> Order {
        Order {
            symbol: self.unify(&raw.symbol),
            order_id: raw.order_id,
            order_type: raw.order_type.unwrap_or_default(),
            plan_type: raw.plan_type,
            status: raw.status,
        }
    }
}
