//! Venue seam. The engine talks to one [`ExchangeClient`] trait object;
//! concrete transports (REST/websocket per venue) live behind it. This repo
//! ships the in-process paper venue; real venues implement the same trait
//! out of tree.

pub mod paper;

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::{Candle, Market, Order, OrderUpdate, PnlFill, PositionUpdate, Ticker};

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("request timed out")]
    Timeout,
    #[error("rate limited")]
    RateLimited,
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("unknown or delisted symbol: {0}")]
    BadSymbol(String),
    #[error("http {status}: {msg}")]
    Http { status: u16, msg: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ExchangeError {
    /// Worth retrying on the next tick or maintainer round.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExchangeError::Timeout
                | ExchangeError::RateLimited
                | ExchangeError::Transport(_)
                | ExchangeError::Http { status: 500.., .. }
        )
    }
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// The full operation set the engine needs from a venue. Hedge mode with
/// explicit position sides and honored reduce_only flags is assumed.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    fn name(&self) -> &str;

    async fn load_markets(&self) -> ExchangeResult<HashMap<String, Market>>;

    async fn fetch_tickers(&self) -> ExchangeResult<HashMap<String, Ticker>>;

    /// All open positions plus the account balance in quote currency.
    async fn fetch_positions(&self) -> ExchangeResult<(Vec<PositionUpdate>, f64)>;

    async fn fetch_open_orders(&self) -> ExchangeResult<Vec<Order>>;

    async fn fetch_ohlcvs(
        &self,
        symbol: &str,
        timeframe: &str,
        since: Option<i64>,
    ) -> ExchangeResult<Vec<Candle>>;

    async fn fetch_pnl_fills(
        &self,
        start_ts: i64,
        end_ts: Option<i64>,
    ) -> ExchangeResult<Vec<PnlFill>>;

    /// Timestamp of the symbol's first candle on the venue, if it has one.
    async fn first_candle_ts(&self, symbol: &str) -> ExchangeResult<Option<i64>>;

    /// Best effort per order: one result per input, same order.
    async fn place_orders(&self, orders: Vec<Order>) -> Vec<ExchangeResult<Order>>;

    async fn cancel_orders(&self, orders: Vec<Order>) -> Vec<ExchangeResult<Order>>;

    async fn set_hedge_mode(&self) -> ExchangeResult<()>;

    async fn set_leverage(&self, symbol: &str, leverage: f64) -> ExchangeResult<()>;

    async fn set_margin_mode(&self, symbol: &str, mode: &str) -> ExchangeResult<()>;

    async fn watch_tickers(&self) -> ExchangeResult<mpsc::Receiver<(String, Ticker)>>;

    async fn watch_orders(&self) -> ExchangeResult<mpsc::Receiver<OrderUpdate>>;

    async fn watch_balance(&self) -> ExchangeResult<mpsc::Receiver<f64>>;
}
