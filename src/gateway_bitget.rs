// ===============================
// src/gateway_bitget.rs
// ===============================
use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::{
    sync::{Mutex, RwLock},
    time::{sleep_until, Duration, Instant},
};
use tracing::{debug, info};

use crate::bitget::{
    decode, encode_query, sign, timestamp_ms, MarketTable, RawContract, RawOrder,
    RawOrderList, RawPosition, PATH_ALL_POSITIONS, PATH_CANCEL_ORDER, PATH_CANCEL_PLAN,
    PATH_CLOSE_POSITIONS, PATH_CONTRACTS, PATH_ORDERS_PENDING, PATH_PLAN_PENDING,
};
use crate::config::{Args, Credentials};
use crate::domain::{Order, OrderStatus, PlanType, Position, PositionSide, ProductType};
use crate::gateway::{Gateway, GatewayError};

/// Minimum spacing between two requests on the same session.
struct Pacer {
    spacing: Duration,
    last: Mutex<Option<Instant>>,
}

impl Pacer {
    async fn wait(&self) {
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            sleep_until(prev + self.spacing).await;
        }
        *last = Some(Instant::now());
    }
}

/// One authenticated Bitget session (REST v2, mix endpoints).
pub struct BitgetGateway {
    http: reqwest::Client,
    rest_base: String,
    credentials: Credentials,
    product_type: ProductType,
    markets: RwLock<MarketTable>,
    pacer: Pacer,
    closed: AtomicBool,
}

impl BitgetGateway {
    /// Open a session: validate credentials and build the HTTP client.
    pub fn connect(args: &Args, credentials: Credentials) -> Result<Self, GatewayError> {
        if credentials.api_key.is_empty() || credentials.secret.is_empty() {
            return Err(GatewayError::Auth("api key and secret are required".into()));
        }
        let http = reqwest::Client::builder()
            .timeout(args.http_timeout)
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        info!(rest = %args.rest_url, product_type = %args.product_type, "bitget session opened");
        Ok(Self {
            http,
            rest_base: args.rest_url.trim_end_matches('/').to_string(),
            credentials,
            product_type: args.product_type,
            markets: RwLock::new(MarketTable::default()),
            pacer: Pacer { spacing: args.request_spacing, last: Mutex::new(None) },
            closed: AtomicBool::new(false),
        })
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<serde_json::Value>,
        signed: bool,
    ) -> Result<Option<T>, GatewayError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::Transport("session already closed".into()));
        }
        self.pacer.wait().await;

        let qs = encode_query(query);
        let request_path = if qs.is_empty() { path.to_string() } else { format!("{path}?{qs}") };
        let body = body.map(|b| b.to_string()).unwrap_or_default();
        let url = format!("{}{}", self.rest_base, request_path);

        let mut req = self
            .http
            .request(method.clone(), url)
            .header("Content-Type", "application/json")
            .header("locale", "en-US");
        if signed {
            let ts = timestamp_ms();
            let sig = sign(&self.credentials.secret, ts, method.as_str(), &request_path, &body);
            req = req
                .header("ACCESS-KEY", &self.credentials.api_key)
                .header("ACCESS-SIGN", sig)
                .header("ACCESS-TIMESTAMP", ts.to_string())
                .header("ACCESS-PASSPHRASE", &self.credentials.passphrase);
        }
        if !body.is_empty() {
            req = req.body(body);
        }

        let rsp = req.send().await.map_err(|e| GatewayError::Transport(e.to_string()))?;
        let status = rsp.status().as_u16();
        let text = rsp.text().await.map_err(|e| GatewayError::Transport(e.to_string()))?;
        debug!(%method, path, status, "bitget response");
        decode(status, &text)
    }

    /// Unified symbol -> exchange symbol via the loaded market table.
    async fn raw_symbol(&self, symbol: &str) -> String {
        self.markets.read().await.raw(symbol)
    }

    async fn order_body(&self, symbol: &str, order_id: &str) -> serde_json::Value {
        let symbol = self.raw_symbol(symbol).await;
        json!({
            "productType": self.product_type.as_str(),
            "marginCoin": self.product_type.margin_coin(),
            "symbol": symbol,
            "orderId": order_id,
        })
    }

    async fn order_query(&self, filter: (&'static str, &str), symbol: Option<&str>) -> Vec<(&'static str, String)> {
        let mut q = vec![("productType", self.product_type.as_str().to_string()), (filter.0, filter.1.to_string())];
        if let Some(s) = symbol {
            q.push(("symbol", self.raw_symbol(s).await));
        }
        q
    }
}

#[async_trait]
impl Gateway for BitgetGateway {
    async fn load_markets(&self) -> Result<usize, GatewayError> {
        let contracts: Vec<RawContract> = self
            .request(Method::GET, PATH_CONTRACTS, &[("productType", self.product_type.as_str().to_string())], None, false)
            .await?
            .unwrap_or_default();
        let table = MarketTable::from_contracts(&contracts, self.product_type.margin_coin());
        let n = table.len();
        *self.markets.write().await = table;
        Ok(n)
    }

    async fn close(&self) -> Result<(), GatewayError> {
        // koneksi reqwest dilepas saat gateway di-drop; di sini cukup tandai sesi tertutup
        self.closed.store(true, Ordering::SeqCst);
        info!("bitget session closed");
        Ok(())
    }

    async fn fetch_positions(&self) -> Result<Vec<Position>, GatewayError> {
        let query = [
            ("productType", self.product_type.as_str().to_string()),
            ("marginCoin", self.product_type.margin_coin().to_string()),
        ];
        let raw: Vec<RawPosition> =
            self.request(Method::GET, PATH_ALL_POSITIONS, &query, None, true).await?.unwrap_or_default();
        Ok(self.markets.read().await.positions(raw))
    }

    async fn close_position(&self, symbol: &str, side: PositionSide) -> Result<(), GatewayError> {
        let symbol = self.raw_symbol(symbol).await;
        let body = json!({
            "symbol": symbol,
            "productType": self.product_type.as_str(),
            "holdSide": side.as_str(),
        });
        self.request::<serde_json::Value>(Method::POST, PATH_CLOSE_POSITIONS, &[], Some(body), true).await?;
        Ok(())
    }

    async fn fetch_plan_orders(
        &self,
        plan_type: PlanType,
        symbol: Option<&str>,
    ) -> Result<Vec<Order>, GatewayError> {
        let query = self.order_query(("planType", plan_type.as_str()), symbol).await;
        let list: Option<RawOrderList> = self.request(Method::GET, PATH_PLAN_PENDING, &query, None, true).await?;
        let raw: Vec<RawOrder> = list.and_then(|l| l.entrusted_list).unwrap_or_default();
        let markets = self.markets.read().await;
        Ok(raw.into_iter().map(|o| markets.order(o)).collect())
    }

    async fn fetch_pending_orders(
        &self,
        status: OrderStatus,
        symbol: Option<&str>,
    ) -> Result<Vec<Order>, GatewayError> {
        let query = self.order_query(("status", status.as_str()), symbol).await;
        let list: RawOrderList = self
            .request(Method::GET, PATH_ORDERS_PENDING, &query, None, true)
            .await?
            .ok_or_else(|| GatewayError::MalformedResponse("orders-pending: missing data".into()))?;
        let raw: Vec<RawOrder> = list.entrusted_list.unwrap_or_default();
        let markets = self.markets.read().await;
        Ok(raw.into_iter().map(|o| markets.order(o)).collect())
    }

    async fn cancel_trigger_order(&self, symbol: &str, order_id: &str) -> Result<(), GatewayError> {
        let body = self.order_body(symbol, order_id).await;
        self.request::<serde_json::Value>(Method::POST, PATH_CANCEL_PLAN, &[], Some(body), true).await?;
        Ok(())
    }

    async fn cancel_limit_order(&self, symbol: &str, order_id: &str) -> Result<(), GatewayError> {
        let body = self.order_body(symbol, order_id).await;
        self.request::<serde_json::Value>(Method::POST, PATH_CANCEL_ORDER, &[], Some(body), true).await?;
        Ok(())
    }
}
