pub mod hlc;
pub mod pnl;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use dashmap::DashMap;
use tokio::sync::{Notify, RwLock};
use tracing::info;

use crate::config::BotParams;
use crate::math::EmaTriple;
use crate::types::{
    BOTH_SIDES, Candle, Market, Order, Position, PositionSide, PositionUpdate, Ticker,
    TrailingExtremes,
};
use hlc::HlcSeries;
use pnl::PnlLedger;

/// One value per position side.
#[derive(Debug, Clone, Copy, Default)]
pub struct SideMap<T> {
    pub long: T,
    pub short: T,
}

impl<T> SideMap<T> {
    pub fn get(&self, pside: PositionSide) -> &T {
        match pside {
            PositionSide::Long => &self.long,
            PositionSide::Short => &self.short,
        }
    }

    pub fn get_mut(&mut self, pside: PositionSide) -> &mut T {
        match pside {
            PositionSide::Long => &mut self.long,
            PositionSide::Short => &mut self.short,
        }
    }
}

/// Millisecond timestamp of the last successful refresh of one data class.
/// Zeroing it forces a refetch on the next tick.
#[derive(Debug, Default)]
pub struct Stamp(AtomicI64);

impl Stamp {
    pub fn mark(&self, now_ms: i64) {
        self.0.store(now_ms, Ordering::Release);
    }

    pub fn invalidate(&self) {
        self.0.store(0, Ordering::Release);
    }

    pub fn older_than(&self, now_ms: i64, max_age_ms: i64) -> bool {
        now_ms - self.0.load(Ordering::Acquire) > max_age_ms
    }
}

#[derive(Debug, Default)]
pub struct Freshness {
    pub positions: Stamp,
    pub open_orders: Stamp,
    pub tickers: Stamp,
    pub pnls: Stamp,
    pub hlcs_1m: Stamp,
}

impl Freshness {
    /// A websocket fill means positions, orders and pnls are all suspect.
    pub fn invalidate_after_fill(&self) {
        self.positions.invalidate();
        self.open_orders.invalidate();
        self.pnls.invalidate();
    }
}

/// Everything the engine knows about one symbol. Guarded by the per-symbol
/// lock in [`SymbolState`]; the tick takes short critical sections per
/// symbol, never a global one.
#[derive(Debug)]
pub struct SymbolData {
    pub market: Market,
    pub ticker: Option<Ticker>,
    pub positions: SideMap<Position>,
    pub open_orders: Vec<Order>,
    pub hlcs_1m: HlcSeries,
    /// Rolling candles on the configured interval, for noisiness/volume.
    pub candles: Vec<Candle>,
    pub candles_updated_ms: i64,
    pub emas: SideMap<EmaTriple>,
    pub trailing: SideMap<TrailingExtremes>,
    /// Strategy parameters with per-symbol mode and exposure limit resolved
    /// by the mode selector each tick.
    pub params: SideMap<BotParams>,
}

impl SymbolData {
    pub fn new(market: Market) -> Self {
        Self {
            market,
            ticker: None,
            positions: SideMap::default(),
            open_orders: Vec::new(),
            hlcs_1m: HlcSeries::default(),
            candles: Vec::new(),
            candles_updated_ms: 0,
            emas: SideMap {
                long: EmaTriple::new(1.0, 1.0),
                short: EmaTriple::new(1.0, 1.0),
            },
            trailing: SideMap {
                long: TrailingExtremes::default(),
                short: TrailingExtremes::default(),
            },
            params: SideMap::default(),
        }
    }

    pub fn position(&self, pside: PositionSide) -> Position {
        *self.positions.get(pside)
    }

    pub fn has_position(&self, pside: PositionSide) -> bool {
        self.positions.get(pside).is_open()
    }

    /// Whether either trailing rule on this side actually looks at extremes.
    pub fn is_trailing(&self, pside: PositionSide) -> bool {
        let p = self.params.get(pside);
        p.entry_trailing_grid_ratio != 0.0 || p.close_trailing_grid_ratio != 0.0
    }
}

#[derive(Debug)]
pub struct SymbolState {
    pub symbol: String,
    pub data: RwLock<SymbolData>,
}

/// The only shared mutable state in the process. Mutated by REST refreshes
/// at tick start, websocket handlers between ticks, and exec-task responses.
#[derive(Clone)]
pub struct Shared {
    pub symbols: Arc<DashMap<String, Arc<SymbolState>>>,
    pub balance: Arc<RwLock<f64>>,
    pub pnls: Arc<RwLock<PnlLedger>>,
    pub freshness: Arc<Freshness>,
    pub recent_fill: Arc<AtomicBool>,
    pub notify: Arc<Notify>,
}

impl Shared {
    pub fn new(pnls: PnlLedger) -> Self {
        Self {
            symbols: Arc::new(DashMap::new()),
            balance: Arc::new(RwLock::new(0.0)),
            pnls: Arc::new(RwLock::new(pnls)),
            freshness: Arc::new(Freshness::default()),
            recent_fill: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn get(&self, symbol: &str) -> Option<Arc<SymbolState>> {
        self.symbols.get(symbol).map(|e| e.value().clone())
    }

    pub fn symbols_vec(&self) -> Vec<Arc<SymbolState>> {
        self.symbols.iter().map(|e| e.value().clone()).collect()
    }

    /// Ensure a symbol exists in the store (insert if missing), refreshing
    /// its market metadata either way.
    pub async fn ensure_symbol(&self, market: Market) -> Arc<SymbolState> {
        if let Some(existing) = self.symbols.get(&market.symbol) {
            let state = existing.value().clone();
            drop(existing);
            state.data.write().await.market = market;
            return state;
        }
        let state = Arc::new(SymbolState {
            symbol: market.symbol.clone(),
            data: RwLock::new(SymbolData::new(market.clone())),
        });
        self.symbols.insert(market.symbol, state.clone());
        state
    }

    pub fn take_recent_fill(&self) -> bool {
        self.recent_fill.swap(false, Ordering::AcqRel)
    }

    pub fn mark_recent_fill(&self) {
        self.recent_fill.store(true, Ordering::Release);
        self.freshness.invalidate_after_fill();
        self.notify.notify_one();
    }

    /// Record an order the venue acked. No-op when the id is already known.
    pub async fn add_order(&self, order: &Order, source: &str) {
        let Some(state) = self.get(&order.symbol) else {
            return;
        };
        let Some(id) = order.id.as_deref() else {
            return;
        };
        let mut data = state.data.write().await;
        if data.open_orders.iter().any(|o| o.id.as_deref() == Some(id)) {
            return;
        }
        info!(
            symbol = %order.symbol,
            side = order.side.as_str(),
            position_side = order.position_side.as_str(),
            qty = order.qty,
            price = order.price,
            source,
            "created order"
        );
        data.open_orders.push(order.clone());
    }

    /// Drop an order the venue reported gone (cancelled or filled).
    pub async fn remove_order(&self, order: &Order, source: &str) {
        let Some(state) = self.get(&order.symbol) else {
            return;
        };
        let Some(id) = order.id.as_deref() else {
            return;
        };
        let mut data = state.data.write().await;
        let before = data.open_orders.len();
        data.open_orders.retain(|o| o.id.as_deref() != Some(id));
        if data.open_orders.len() != before {
            info!(
                symbol = %order.symbol,
                side = order.side.as_str(),
                position_side = order.position_side.as_str(),
                qty = order.qty,
                price = order.price,
                source,
                "cancelled order"
            );
        }
    }

    /// Replace fetched positions wholesale. Returns the (symbol, side, old,
    /// new) tuples that actually changed so the caller can log the table.
    /// A side whose position vanished resets its trailing extremes.
    pub async fn apply_positions(
        &self,
        fetched: &[PositionUpdate],
        balance: f64,
    ) -> Vec<(String, PositionSide, Position, Position)> {
        let mut changes = Vec::new();
        *self.balance.write().await = balance;
        for entry in self.symbols_vec() {
            let mut data = entry.data.write().await;
            for pside in BOTH_SIDES {
                let new = fetched
                    .iter()
                    .find(|p| p.symbol == entry.symbol && p.position_side == pside)
                    .map(|p| Position {
                        size: p.size,
                        price: p.price,
                    })
                    .unwrap_or_default();
                let old = *data.positions.get(pside);
                if old != new {
                    if !new.is_open() {
                        *data.trailing.get_mut(pside) = TrailingExtremes::default();
                    }
                    *data.positions.get_mut(pside) = new;
                    changes.push((entry.symbol.clone(), pside, old, new));
                }
            }
        }
        changes
    }

    /// Replace the open-order list per symbol from a full REST fetch.
    pub async fn apply_open_orders(&self, fetched: &[Order]) {
        for entry in self.symbols_vec() {
            let mut data = entry.data.write().await;
            data.open_orders = fetched
                .iter()
                .filter(|o| o.symbol == entry.symbol)
                .cloned()
                .collect();
        }
    }
}
