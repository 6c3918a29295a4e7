//! In-process paper venue: rests limit orders, fills whatever the fed ticker
//! crosses, tracks hedge-mode positions, balance and realized pnl. Used for
//! dry runs and as the integration-test venue.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::info;

use crate::math::{calc_new_psize_pprice, calc_pnl, round_to};
use crate::types::{
    Candle, Market, Order, OrderUpdate, PnlFill, Position, PositionSide, PositionUpdate, Side,
    Ticker,
};

use super::{ExchangeClient, ExchangeError, ExchangeResult};

const STREAM_CAPACITY: usize = 1024;

#[derive(Default)]
struct PaperState {
    markets: HashMap<String, Market>,
    tickers: HashMap<String, Ticker>,
    balance: f64,
    positions: HashMap<(String, PositionSide), Position>,
    open_orders: Vec<Order>,
    fills: Vec<PnlFill>,
    candles: HashMap<(String, String), Vec<Candle>>,
    next_id: u64,
    hedge_mode: bool,
    leverage: HashMap<String, f64>,
    ticker_txs: Vec<mpsc::Sender<(String, Ticker)>>,
    order_txs: Vec<mpsc::Sender<OrderUpdate>>,
    balance_txs: Vec<mpsc::Sender<f64>>,
}

pub struct PaperExchange {
    state: Mutex<PaperState>,
}

impl PaperExchange {
    pub fn new(markets: Vec<Market>, starting_balance: f64) -> Self {
        let state = PaperState {
            markets: markets.into_iter().map(|m| (m.symbol.clone(), m)).collect(),
            balance: starting_balance,
            ..PaperState::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    /// Feed a fresh ticker: updates the tape, fills every crossed resting
    /// order at its limit price, and pushes stream events.
    pub fn set_ticker(&self, symbol: &str, ticker: Ticker) {
        let mut s = self.state.lock().unwrap();
        s.tickers.insert(symbol.to_string(), ticker);
        for tx in &s.ticker_txs {
            let _ = tx.try_send((symbol.to_string(), ticker));
        }

        let crossed: Vec<Order> = s
            .open_orders
            .iter()
            .filter(|o| {
                o.symbol == symbol
                    && match o.side {
                        Side::Buy => ticker.ask <= o.price,
                        Side::Sell => ticker.bid >= o.price,
                    }
            })
            .cloned()
            .collect();
        for order in crossed {
            s.open_orders.retain(|o| o.id != order.id);
            Self::apply_fill(&mut s, &order);
        }
    }

    /// Seed candles served by `fetch_ohlcvs` for (symbol, timeframe).
    pub fn seed_candles(&self, symbol: &str, timeframe: &str, candles: Vec<Candle>) {
        let mut s = self.state.lock().unwrap();
        s.candles
            .insert((symbol.to_string(), timeframe.to_string()), candles);
    }

    pub fn open_order_count(&self) -> usize {
        self.state.lock().unwrap().open_orders.len()
    }

    pub fn balance(&self) -> f64 {
        self.state.lock().unwrap().balance
    }

    pub fn position(&self, symbol: &str, pside: PositionSide) -> Position {
        self.state
            .lock()
            .unwrap()
            .positions
            .get(&(symbol.to_string(), pside))
            .copied()
            .unwrap_or_default()
    }

    fn apply_fill(s: &mut PaperState, order: &Order) {
        let key = (order.symbol.clone(), order.position_side);
        let qty_step = s
            .markets
            .get(&order.symbol)
            .map(|m| m.qty_step)
            .unwrap_or(0.0);
        let c_mult = s
            .markets
            .get(&order.symbol)
            .map(|m| m.c_mult)
            .unwrap_or(1.0);
        let inverse = s
            .markets
            .get(&order.symbol)
            .map(|m| m.inverse)
            .unwrap_or(false);
        let pos = s.positions.entry(key.clone()).or_default();
        let signed_qty = match order.side {
            Side::Buy => order.qty,
            Side::Sell => -order.qty,
        };
        if order.reduce_only {
            let closed = order.qty.min(pos.size.abs());
            let pnl = calc_pnl(
                order.position_side,
                pos.price,
                order.price,
                closed,
                inverse,
                c_mult,
            );
            let direction = if pos.size >= 0.0 { -1.0 } else { 1.0 };
            pos.size = round_to(pos.size + direction * closed, qty_step);
            if pos.size == 0.0 {
                pos.price = 0.0;
            }
            s.balance += pnl;
            let id = format!("paper-fill-{}", s.fills.len() + 1);
            let ts = s
                .tickers
                .get(&order.symbol)
                .map(|t| t.ts)
                .unwrap_or_default();
            s.fills.push(PnlFill {
                id,
                symbol: order.symbol.clone(),
                position_side: order.position_side,
                qty: closed,
                price: order.price,
                pnl,
                timestamp: ts,
            });
            let balance = s.balance;
            for tx in &s.balance_txs {
                let _ = tx.try_send(balance);
            }
        } else {
            let (size, price) =
                calc_new_psize_pprice(pos.size, pos.price, signed_qty, order.price, qty_step);
            pos.size = size;
            pos.price = price;
        }
        info!(
            symbol = %order.symbol,
            side = order.side.as_str(),
            qty = order.qty,
            price = order.price,
            "paper fill"
        );
        for tx in &s.order_txs {
            let _ = tx.try_send(OrderUpdate::Filled(order.clone()));
        }
    }

    fn validate(s: &PaperState, order: &Order) -> ExchangeResult<()> {
        let Some(market) = s.markets.get(&order.symbol) else {
            return Err(ExchangeError::BadSymbol(order.symbol.clone()));
        };
        if !order.reduce_only_consistent() {
            return Err(ExchangeError::Rejected("reduce_only violation".to_string()));
        }
        if order.qty < market.min_qty {
            return Err(ExchangeError::Rejected(format!(
                "qty {} below min {}",
                order.qty, market.min_qty
            )));
        }
        if order.price <= 0.0 {
            return Err(ExchangeError::Rejected("price out of band".to_string()));
        }
        if order.reduce_only {
            let pos = s
                .positions
                .get(&(order.symbol.clone(), order.position_side))
                .copied()
                .unwrap_or_default();
            if order.qty > pos.size.abs() + market.qty_step * 0.5 {
                return Err(ExchangeError::Rejected(
                    "reduce_only exceeds position".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    fn name(&self) -> &str {
        "paper"
    }

    async fn load_markets(&self) -> ExchangeResult<HashMap<String, Market>> {
        Ok(self.state.lock().unwrap().markets.clone())
    }

    async fn fetch_tickers(&self) -> ExchangeResult<HashMap<String, Ticker>> {
        Ok(self.state.lock().unwrap().tickers.clone())
    }

    async fn fetch_positions(&self) -> ExchangeResult<(Vec<PositionUpdate>, f64)> {
        let s = self.state.lock().unwrap();
        let positions = s
            .positions
            .iter()
            .filter(|(_, p)| p.is_open())
            .map(|((symbol, pside), p)| PositionUpdate {
                symbol: symbol.clone(),
                position_side: *pside,
                size: p.size,
                price: p.price,
            })
            .collect();
        Ok((positions, s.balance))
    }

    async fn fetch_open_orders(&self) -> ExchangeResult<Vec<Order>> {
        Ok(self.state.lock().unwrap().open_orders.clone())
    }

    async fn fetch_ohlcvs(
        &self,
        symbol: &str,
        timeframe: &str,
        since: Option<i64>,
    ) -> ExchangeResult<Vec<Candle>> {
        let s = self.state.lock().unwrap();
        if !s.markets.contains_key(symbol) {
            return Err(ExchangeError::BadSymbol(symbol.to_string()));
        }
        let candles = s
            .candles
            .get(&(symbol.to_string(), timeframe.to_string()))
            .cloned()
            .unwrap_or_default();
        Ok(match since {
            Some(since) => candles.into_iter().filter(|c| c.ts >= since).collect(),
            None => candles,
        })
    }

    async fn fetch_pnl_fills(
        &self,
        start_ts: i64,
        end_ts: Option<i64>,
    ) -> ExchangeResult<Vec<PnlFill>> {
        let s = self.state.lock().unwrap();
        Ok(s.fills
            .iter()
            .filter(|f| f.timestamp >= start_ts && end_ts.is_none_or(|end| f.timestamp <= end))
            .cloned()
            .collect())
    }

    async fn first_candle_ts(&self, symbol: &str) -> ExchangeResult<Option<i64>> {
        let s = self.state.lock().unwrap();
        Ok(s.candles
            .iter()
            .filter(|((sym, _), _)| sym == symbol)
            .filter_map(|(_, candles)| candles.first().map(|c| c.ts))
            .min())
    }

    async fn place_orders(&self, orders: Vec<Order>) -> Vec<ExchangeResult<Order>> {
        let mut s = self.state.lock().unwrap();
        let mut results = Vec::with_capacity(orders.len());
        for mut order in orders {
            if let Err(e) = Self::validate(&s, &order) {
                results.push(Err(e));
                continue;
            }
            s.next_id += 1;
            order.id = Some(format!("paper-{}", s.next_id));
            for tx in &s.order_txs {
                let _ = tx.try_send(OrderUpdate::New(order.clone()));
            }
            let crossed = s.tickers.get(&order.symbol).is_some_and(|t| match order.side {
                Side::Buy => t.ask <= order.price,
                Side::Sell => t.bid >= order.price,
            });
            if crossed {
                Self::apply_fill(&mut s, &order);
            } else {
                s.open_orders.push(order.clone());
            }
            results.push(Ok(order));
        }
        results
    }

    async fn cancel_orders(&self, orders: Vec<Order>) -> Vec<ExchangeResult<Order>> {
        let mut s = self.state.lock().unwrap();
        let mut results = Vec::with_capacity(orders.len());
        for order in orders {
            let Some(id) = order.id.clone() else {
                results.push(Err(ExchangeError::Rejected("missing order id".to_string())));
                continue;
            };
            let pos = s.open_orders.iter().position(|o| o.id.as_deref() == Some(&id));
            match pos {
                Some(idx) => {
                    let removed = s.open_orders.remove(idx);
                    for tx in &s.order_txs {
                        let _ = tx.try_send(OrderUpdate::Cancelled(removed.clone()));
                    }
                    results.push(Ok(removed));
                }
                None => results.push(Err(ExchangeError::Rejected(format!(
                    "unknown order {id}"
                )))),
            }
        }
        results
    }

    async fn set_hedge_mode(&self) -> ExchangeResult<()> {
        self.state.lock().unwrap().hedge_mode = true;
        Ok(())
    }

    async fn set_leverage(&self, symbol: &str, leverage: f64) -> ExchangeResult<()> {
        self.state
            .lock()
            .unwrap()
            .leverage
            .insert(symbol.to_string(), leverage);
        Ok(())
    }

    async fn set_margin_mode(&self, _symbol: &str, _mode: &str) -> ExchangeResult<()> {
        Ok(())
    }

    async fn watch_tickers(&self) -> ExchangeResult<mpsc::Receiver<(String, Ticker)>> {
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        self.state.lock().unwrap().ticker_txs.push(tx);
        Ok(rx)
    }

    async fn watch_orders(&self) -> ExchangeResult<mpsc::Receiver<OrderUpdate>> {
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        self.state.lock().unwrap().order_txs.push(tx);
        Ok(rx)
    }

    async fn watch_balance(&self) -> ExchangeResult<mpsc::Receiver<f64>> {
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        self.state.lock().unwrap().balance_txs.push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn market(symbol: &str) -> Market {
        Market {
            symbol: symbol.to_string(),
            price_step: 0.01,
            qty_step: 0.001,
            min_qty: 0.001,
            min_cost: 5.0,
            c_mult: 1.0,
            inverse: false,
            active: true,
            quote: "USDT".to_string(),
            listed_ts: Some(0),
        }
    }

    fn order(symbol: &str, side: Side, pside: PositionSide, qty: f64, price: f64) -> Order {
        Order {
            symbol: symbol.to_string(),
            side,
            position_side: pside,
            qty,
            price,
            reduce_only: side == pside.close_side(),
            id: None,
            custom_id: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn resting_order_fills_when_crossed() {
        let venue = PaperExchange::new(vec![market("A/USDT:USDT")], 1000.0);
        venue.set_ticker(
            "A/USDT:USDT",
            Ticker {
                bid: 100.0,
                ask: 100.01,
                last: 100.0,
                ts: 1,
            },
        );
        let res = venue
            .place_orders(vec![order(
                "A/USDT:USDT",
                Side::Buy,
                PositionSide::Long,
                1.0,
                99.0,
            )])
            .await;
        assert!(res[0].is_ok());
        assert_eq!(venue.open_order_count(), 1);

        venue.set_ticker(
            "A/USDT:USDT",
            Ticker {
                bid: 98.9,
                ask: 98.95,
                last: 98.9,
                ts: 2,
            },
        );
        assert_eq!(venue.open_order_count(), 0);
        let pos = venue.position("A/USDT:USDT", PositionSide::Long);
        assert!((pos.size - 1.0).abs() < 1e-9);
        assert!((pos.price - 99.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn reduce_only_close_realizes_pnl() {
        let venue = PaperExchange::new(vec![market("A/USDT:USDT")], 1000.0);
        venue.set_ticker(
            "A/USDT:USDT",
            Ticker {
                bid: 100.0,
                ask: 100.01,
                last: 100.0,
                ts: 1,
            },
        );
        // crossing buy fills immediately
        venue
            .place_orders(vec![order(
                "A/USDT:USDT",
                Side::Buy,
                PositionSide::Long,
                1.0,
                100.01,
            )])
            .await;
        // sell above market rests, then fills on the way up
        venue
            .place_orders(vec![order(
                "A/USDT:USDT",
                Side::Sell,
                PositionSide::Long,
                1.0,
                101.0,
            )])
            .await;
        venue.set_ticker(
            "A/USDT:USDT",
            Ticker {
                bid: 101.5,
                ask: 101.51,
                last: 101.5,
                ts: 2,
            },
        );
        let pos = venue.position("A/USDT:USDT", PositionSide::Long);
        assert_eq!(pos.size, 0.0);
        let fills = venue.fetch_pnl_fills(0, None).await.unwrap();
        assert_eq!(fills.len(), 1);
        assert!((fills[0].pnl - (101.0 - 100.01)).abs() < 1e-9);
        assert!((venue.balance() - (1000.0 + fills[0].pnl)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn violations_are_rejected() {
        let venue = PaperExchange::new(vec![market("A/USDT:USDT")], 1000.0);
        venue.set_ticker(
            "A/USDT:USDT",
            Ticker {
                bid: 100.0,
                ask: 100.01,
                last: 100.0,
                ts: 1,
            },
        );
        // reduce_only close with no position
        let res = venue
            .place_orders(vec![order(
                "A/USDT:USDT",
                Side::Sell,
                PositionSide::Long,
                1.0,
                101.0,
            )])
            .await;
        assert!(matches!(res[0], Err(ExchangeError::Rejected(_))));
        // unknown symbol
        let res = venue
            .place_orders(vec![order(
                "B/USDT:USDT",
                Side::Buy,
                PositionSide::Long,
                1.0,
                100.0,
            )])
            .await;
        assert!(matches!(res[0], Err(ExchangeError::BadSymbol(_))));
        // inconsistent reduce_only flag
        let mut bad = order("A/USDT:USDT", Side::Buy, PositionSide::Long, 1.0, 99.0);
        bad.reduce_only = true;
        let res = venue.place_orders(vec![bad]).await;
        assert!(matches!(res[0], Err(ExchangeError::Rejected(_))));
    }
}
