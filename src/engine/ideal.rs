//! Ideal-order composer: turns per-symbol state snapshots into the exact set
//! of orders that should be resting on the venue right now.

use std::collections::HashSet;

use crate::config::Settings;
use crate::grid::unstuck::{UnstuckCandidate, calc_unstuck_close};
use crate::grid::{EmaBands, GridOrder, OrderBook, StateParams, closes, entries};
use crate::math::calc_diff;
use crate::state::{Shared, SymbolData};
use crate::types::{
    BOTH_SIDES, Market, Mode, Order, OrderKind, Position, PositionSide, Side, Ticker,
    TrailingExtremes,
};

struct SymSnapshot {
    market: Market,
    ticker: Ticker,
    positions: [Position; 2],
    trailing: [TrailingExtremes; 2],
    params: [crate::config::BotParams; 2],
    ema_bands: [EmaBands; 2],
}

fn side_idx(pside: PositionSide) -> usize {
    match pside {
        PositionSide::Long => 0,
        PositionSide::Short => 1,
    }
}

fn snapshot(data: &SymbolData) -> Option<SymSnapshot> {
    let ticker = data.ticker?;
    let bands = |pside: PositionSide| {
        let ema = data.emas.get(pside);
        if ema.is_ready() {
            EmaBands {
                lower: ema.band_lower(),
                upper: ema.band_upper(),
            }
        } else {
            // no EMA history yet: band collapses onto the tape
            EmaBands {
                lower: ticker.last,
                upper: ticker.last,
            }
        }
    };
    Some(SymSnapshot {
        market: data.market.clone(),
        ticker,
        positions: [data.position(PositionSide::Long), data.position(PositionSide::Short)],
        trailing: [
            *data.trailing.get(PositionSide::Long),
            *data.trailing.get(PositionSide::Short),
        ],
        params: [
            data.params.get(PositionSide::Long).clone(),
            data.params.get(PositionSide::Short).clone(),
        ],
        ema_bands: [bands(PositionSide::Long), bands(PositionSide::Short)],
    })
}

/// Grid + trailing + panic output for one (symbol, side), before unstuck
/// substitution and filtering.
fn side_orders(snap: &SymSnapshot, pside: PositionSide, balance: f64) -> Vec<GridOrder> {
    let idx = side_idx(pside);
    let params = &snap.params[idx];
    let position = &snap.positions[idx];
    let has_pos = position.is_open();
    let state = StateParams {
        balance,
        order_book: OrderBook {
            bid: snap.ticker.bid,
            ask: snap.ticker.ask,
        },
        ema_bands: snap.ema_bands[idx],
    };

    match params.mode {
        Mode::Panic => {
            if has_pos {
                let (qty, price) = match pside {
                    PositionSide::Long => (-position.size.abs(), snap.ticker.ask),
                    PositionSide::Short => (position.size.abs(), snap.ticker.bid),
                };
                vec![GridOrder {
                    qty,
                    price,
                    kind: OrderKind::ClosePanic,
                }]
            } else {
                Vec::new()
            }
        }
        Mode::Manual => Vec::new(),
        Mode::GracefulStop if !has_pos => Vec::new(),
        mode => {
            if !(params.enabled || has_pos) {
                return Vec::new();
            }
            let mut orders = Vec::new();
            // tp_only keeps the take-profit side alive, nothing else
            if mode != Mode::TpOnly {
                orders.extend(match pside {
                    PositionSide::Long => entries::calc_entries_long(
                        &snap.market,
                        &state,
                        params,
                        position,
                        &snap.trailing[idx],
                    ),
                    PositionSide::Short => entries::calc_entries_short(
                        &snap.market,
                        &state,
                        params,
                        position,
                        &snap.trailing[idx],
                    ),
                });
            }
            orders.extend(match pside {
                PositionSide::Long => closes::calc_closes_long(
                    &snap.market,
                    &state,
                    params,
                    position,
                    &snap.trailing[idx],
                ),
                PositionSide::Short => closes::calc_closes_short(
                    &snap.market,
                    &state,
                    params,
                    position,
                    &snap.trailing[idx],
                ),
            });
            orders
        }
    }
}

fn to_order(symbol: &str, pside: PositionSide, g: &GridOrder) -> Order {
    Order {
        symbol: symbol.to_string(),
        side: if g.qty > 0.0 { Side::Buy } else { Side::Sell },
        position_side: pside,
        qty: g.qty.abs(),
        price: g.price,
        reduce_only: g.kind.is_close(),
        id: None,
        custom_id: format!("{}_{}", g.kind.as_str(), pside.as_str()),
    }
}

/// Compose the full ideal order set across all symbols.
pub async fn calc_ideal_orders(shared: &Shared, settings: &Settings) -> Vec<Order> {
    let balance = *shared.balance.read().await;
    let (pnl_cum, pnl_peak) = shared.pnls.read().await.cum_and_peak();

    let mut snaps: Vec<(String, SymSnapshot)> = Vec::new();
    for entry in shared.symbols_vec() {
        let data = entry.data.read().await;
        if let Some(snap) = snapshot(&data) {
            snaps.push((entry.symbol.clone(), snap));
        }
    }

    // per (symbol, side) raw proposals
    let mut proposed: Vec<(String, PositionSide, Vec<GridOrder>)> = Vec::new();
    for (symbol, snap) in &snaps {
        for pside in BOTH_SIDES {
            proposed.push((symbol.clone(), pside, side_orders(snap, pside, balance)));
        }
    }

    // unstuck substitution: at most one (symbol, side) bleeds per tick
    let mut candidates: Vec<UnstuckCandidate> = Vec::new();
    for (symbol, snap) in &snaps {
        for pside in BOTH_SIDES {
            let idx = side_idx(pside);
            if !snap.positions[idx].is_open() {
                continue;
            }
            if matches!(snap.params[idx].mode, Mode::Panic | Mode::Manual) {
                continue;
            }
            let first_close_price = proposed
                .iter()
                .find(|(s, p, _)| s == symbol && *p == pside)
                .and_then(|(_, _, orders)| {
                    let close_prices =
                        orders.iter().filter(|o| o.kind.is_close()).map(|o| o.price);
                    match pside {
                        PositionSide::Long => close_prices.min_by(f64::total_cmp),
                        PositionSide::Short => close_prices.max_by(f64::total_cmp),
                    }
                });
            candidates.push(UnstuckCandidate {
                symbol: symbol.clone(),
                pside,
                market: snap.market.clone(),
                ticker: snap.ticker,
                position: snap.positions[idx],
                params: snap.params[idx].clone(),
                ema_band_lower: snap.ema_bands[idx].lower,
                ema_band_upper: snap.ema_bands[idx].upper,
                first_close_price,
            });
        }
    }

    if let Some((symbol, pside, bleed)) = calc_unstuck_close(&candidates, balance, pnl_cum, pnl_peak)
    {
        for (s, p, orders) in proposed.iter_mut() {
            if *s == symbol && *p == pside {
                orders.retain(|o| !o.kind.is_close());
                orders.push(bleed);
                break;
            }
        }
    }

    // filter: price-distance gate on initial/unstuck, dedupe, drop zeros
    let mut ideal: Vec<Order> = Vec::new();
    for (symbol, snap) in &snaps {
        let last = snap.ticker.last;
        let mut with_diff: Vec<(f64, PositionSide, GridOrder)> = proposed
            .iter()
            .filter(|(s, _, _)| s == symbol)
            .flat_map(|(_, pside, orders)| {
                orders.iter().map(move |o| (calc_diff(o.price, last), *pside, *o))
            })
            .collect();
        with_diff.sort_by(|a, b| a.0.total_cmp(&b.0));
        let mut seen: HashSet<(u64, u64)> = HashSet::new();
        for (diff, pside, order) in with_diff {
            if order.qty == 0.0 {
                continue;
            }
            if (order.kind.is_initial() || order.kind.is_unstuck())
                && diff > settings.live.price_distance_threshold
            {
                continue;
            }
            let key = (order.qty.abs().to_bits(), order.price.to_bits());
            if !seen.insert(key) {
                continue;
            }
            ideal.push(to_order(symbol, pside, &order));
        }
    }

    // some venues cap resting orders; keep the closest to the tape
    const MAX_OPEN_ORDERS: usize = 100;
    if ideal.len() > MAX_OPEN_ORDERS {
        let last_for = |symbol: &str| {
            snaps
                .iter()
                .find(|(s, _)| s == symbol)
                .map(|(_, snap)| snap.ticker.last)
                .unwrap_or(0.0)
        };
        ideal.sort_by(|a, b| {
            calc_diff(a.price, last_for(&a.symbol))
                .total_cmp(&calc_diff(b.price, last_for(&b.symbol)))
        });
        ideal.truncate(MAX_OPEN_ORDERS);
    }
    ideal
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BotParams;
    use crate::state::pnl::PnlLedger;

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

    async fn seed(
        shared: &Shared,
        symbol: &str,
        mode: Mode,
        position: Position,
    ) {
        let state = shared.ensure_symbol(market(symbol)).await;
        let mut data = state.data.write().await;
        data.ticker = Some(Ticker {
            bid: 100.4,
            ask: 100.5,
            last: 100.45,
            ts: 0,
        });
        let params = BotParams {
            mode,
            enabled: mode == Mode::Normal,
            wallet_exposure_limit: 1.0,
            entry_initial_qty_pct: 0.05,
            entry_initial_ema_dist: 0.0,
            close_grid_min_markup: 0.002,
            close_grid_markup_range: 0.004,
            close_grid_qty_pct: 0.2,
            ..BotParams::default()
        };
        data.params.long = params;
        data.positions.long = position;
        let mut ema = crate::math::EmaTriple::new(12.0, 24.0);
        ema.update(100.45, 60_000);
        data.emas.long = ema;
    }

    #[tokio::test]
    async fn panic_mode_emits_single_touch_close() {
        let shared = Shared::new(PnlLedger::default());
        *shared.balance.write().await = 1000.0;
        seed(
            &shared,
            "A/USDT:USDT",
            Mode::Panic,
            Position {
                size: 0.3,
                price: 90.0,
            },
        )
        .await;
        let ideal = calc_ideal_orders(&shared, &Settings::default()).await;
        assert_eq!(ideal.len(), 1);
        let order = &ideal[0];
        assert_eq!(order.side, Side::Sell);
        assert!(order.reduce_only);
        assert!((order.qty - 0.3).abs() < 1e-9);
        assert!((order.price - 100.5).abs() < 1e-9);
        assert!(order.custom_id.starts_with("close_panic"));
    }

    #[tokio::test]
    async fn graceful_stop_without_position_is_silent() {
        let shared = Shared::new(PnlLedger::default());
        *shared.balance.write().await = 1000.0;
        seed(&shared, "A/USDT:USDT", Mode::GracefulStop, Position::default()).await;
        let ideal = calc_ideal_orders(&shared, &Settings::default()).await;
        assert!(ideal.is_empty());
    }

    #[tokio::test]
    async fn graceful_stop_with_position_keeps_reentries_and_closes() {
        let shared = Shared::new(PnlLedger::default());
        *shared.balance.write().await = 1000.0;
        seed(
            &shared,
            "A/USDT:USDT",
            Mode::GracefulStop,
            Position {
                size: 1.0,
                price: 100.0,
            },
        )
        .await;
        let ideal = calc_ideal_orders(&shared, &Settings::default()).await;
        assert!(ideal.iter().any(|o| o.reduce_only));
        assert!(ideal.iter().any(|o| !o.reduce_only));
    }

    #[tokio::test]
    async fn tp_only_suppresses_entries() {
        let shared = Shared::new(PnlLedger::default());
        *shared.balance.write().await = 1000.0;
        seed(
            &shared,
            "A/USDT:USDT",
            Mode::TpOnly,
            Position {
                size: 1.0,
                price: 100.0,
            },
        )
        .await;
        let ideal = calc_ideal_orders(&shared, &Settings::default()).await;
        assert!(!ideal.is_empty());
        assert!(ideal.iter().all(|o| o.reduce_only));
    }

    #[tokio::test]
    async fn normal_mode_emits_reduce_only_consistent_orders() {
        let shared = Shared::new(PnlLedger::default());
        *shared.balance.write().await = 1000.0;
        seed(
            &shared,
            "A/USDT:USDT",
            Mode::Normal,
            Position {
                size: 1.0,
                price: 100.0,
            },
        )
        .await;
        let ideal = calc_ideal_orders(&shared, &Settings::default()).await;
        assert!(!ideal.is_empty());
        for order in &ideal {
            assert!(order.reduce_only_consistent(), "{order:?}");
            assert!(order.qty > 0.0);
        }
        // closes above the tape, entries below
        for order in &ideal {
            if order.reduce_only {
                assert!(order.price >= 100.45);
            } else {
                assert!(order.price <= 100.45);
            }
        }
    }

    #[tokio::test]
    async fn initial_entry_beyond_price_threshold_is_held_back() {
        let shared = Shared::new(PnlLedger::default());
        *shared.balance.write().await = 1000.0;
        seed(&shared, "A/USDT:USDT", Mode::Normal, Position::default()).await;
        // EMA far below the tape pushes the initial entry out of range
        {
            let state = shared.get("A/USDT:USDT").unwrap();
            let mut data = state.data.write().await;
            let mut ema = crate::math::EmaTriple::new(12.0, 24.0);
            ema.update(90.0, 60_000);
            data.emas.long = ema;
        }
        let mut settings = Settings::default();
        settings.live.price_distance_threshold = 0.002;
        let ideal = calc_ideal_orders(&shared, &settings).await;
        assert!(ideal.is_empty());
    }
}
