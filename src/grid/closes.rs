//! Close proposals: laddered take-profit grid over the markup range, and
//! trailing closes, interpolated by `close_trailing_grid_ratio`.

use crate::config::BotParams;
use crate::math::{min_entry_qty, round_dn, round_to, round_up};
use crate::types::{Market, OrderKind, Position, TrailingExtremes};

use super::{GridOrder, StateParams};

/// A single level carrying more than this share of the position collapses
/// the ladder into one close.
const MERGE_THRESHOLD: f64 = 0.75;

fn market_min_qty(market: &Market, price: f64) -> f64 {
    min_entry_qty(
        price,
        market.inverse,
        market.c_mult,
        market.qty_step,
        market.min_qty,
        market.min_cost,
    )
}

/// Ladder `budget` contracts of a long position across the markup range.
/// Level prices are floored at the ask; equal-price levels merge.
fn close_grid_long(
    market: &Market,
    state: &StateParams,
    params: &BotParams,
    position: &Position,
    budget: f64,
) -> Vec<GridOrder> {
    let full = position.size.abs();
    if budget <= 0.0 || full <= 0.0 || params.close_grid_qty_pct <= 0.0 {
        return Vec::new();
    }
    let n = (1.0 / params.close_grid_qty_pct).ceil().clamp(1.0, 100.0) as usize;
    let qty_per = round_up(full * params.close_grid_qty_pct, market.qty_step);

    let mut levels: Vec<(f64, f64)> = Vec::new();
    let mut remaining = budget;
    for i in 0..n {
        if remaining <= 0.0 {
            break;
        }
        let frac = if n > 1 { i as f64 / (n - 1) as f64 } else { 0.0 };
        let raw = position.price
            * (1.0 + params.close_grid_min_markup + params.close_grid_markup_range * frac);
        let price = state
            .order_book
            .ask
            .max(round_up(raw, market.price_step));
        let min_q = market_min_qty(market, price);
        let mut qty = qty_per.min(remaining).max(min_q.min(remaining));
        // the last level absorbs what would be a dust remainder
        if remaining - qty < min_q {
            qty = remaining;
        }
        match levels.last_mut() {
            Some(last) if last.0 == price => last.1 = round_to(last.1 + qty, market.qty_step),
            _ => levels.push((price, qty)),
        }
        remaining = round_to(remaining - qty, market.qty_step);
    }

    if let Some(&(price, qty)) = levels.iter().max_by(|a, b| a.1.total_cmp(&b.1)) {
        if levels.len() > 1 && qty > MERGE_THRESHOLD * full {
            return vec![GridOrder {
                qty: -budget,
                price,
                kind: OrderKind::CloseGrid,
            }];
        }
    }

    levels
        .into_iter()
        .map(|(price, qty)| GridOrder {
            qty: -qty,
            price,
            kind: OrderKind::CloseGrid,
        })
        .collect()
}

/// Close set for a long position.
///
/// `close_trailing_grid_ratio` splits the position: positive means the first
/// `ratio` share is closed by the trailing rule and the rest by the markup
/// grid, negative means grid first up to `1 + ratio`; 0 is pure grid, |1|
/// pure trailing.
pub fn calc_closes_long(
    market: &Market,
    state: &StateParams,
    params: &BotParams,
    position: &Position,
    trailing: &TrailingExtremes,
) -> Vec<GridOrder> {
    if position.size <= 0.0 {
        return Vec::new();
    }
    let full = position.size.abs();
    let ratio = params.close_trailing_grid_ratio;
    if ratio >= 1.0 || ratio <= -1.0 {
        return trailing_close_qty_long(market, state, params, position, trailing, full)
            .into_iter()
            .collect();
    }
    if ratio == 0.0 {
        return close_grid_long(market, state, params, position, full);
    }
    let trailing_qty = round_to(full * ratio.abs(), market.qty_step).min(full);
    let grid_qty = round_to(full - trailing_qty, market.qty_step);
    let mut out = Vec::new();
    if let Some(tc) =
        trailing_close_qty_long(market, state, params, position, trailing, trailing_qty)
    {
        out.push(tc);
    }
    out.extend(close_grid_long(market, state, params, position, grid_qty));
    out
}

fn trailing_close_qty_long(
    market: &Market,
    state: &StateParams,
    params: &BotParams,
    position: &Position,
    trailing: &TrailingExtremes,
    qty: f64,
) -> Option<GridOrder> {
    if qty <= 0.0 || params.close_trailing_retracement_pct <= 0.0 {
        return None;
    }
    let armed = params.close_trailing_threshold_pct <= 0.0
        || trailing.max_since_open
            > position.price * (1.0 + params.close_trailing_threshold_pct);
    if !armed {
        return None;
    }
    // fires once price has pulled back `retracement` off the high
    let trigger = trailing.max_since_open * (1.0 - params.close_trailing_retracement_pct);
    if trailing.min_since_max >= trigger {
        return None;
    }
    let price = state
        .order_book
        .ask
        .max(round_up(trigger, market.price_step));
    if qty < market_min_qty(market, price) {
        return None;
    }
    Some(GridOrder {
        qty: -qty,
        price,
        kind: OrderKind::CloseTrailing,
    })
}

fn close_grid_short(
    market: &Market,
    state: &StateParams,
    params: &BotParams,
    position: &Position,
    budget: f64,
) -> Vec<GridOrder> {
    let full = position.size.abs();
    if budget <= 0.0 || full <= 0.0 || params.close_grid_qty_pct <= 0.0 {
        return Vec::new();
    }
    let n = (1.0 / params.close_grid_qty_pct).ceil().clamp(1.0, 100.0) as usize;
    let qty_per = round_up(full * params.close_grid_qty_pct, market.qty_step);

    let mut levels: Vec<(f64, f64)> = Vec::new();
    let mut remaining = budget;
    for i in 0..n {
        if remaining <= 0.0 {
            break;
        }
        let frac = if n > 1 { i as f64 / (n - 1) as f64 } else { 0.0 };
        let raw = position.price
            * (1.0 - params.close_grid_min_markup - params.close_grid_markup_range * frac);
        let price = state
            .order_book
            .bid
            .min(round_dn(raw, market.price_step));
        if price <= 0.0 {
            break;
        }
        let min_q = market_min_qty(market, price);
        let mut qty = qty_per.min(remaining).max(min_q.min(remaining));
        if remaining - qty < min_q {
            qty = remaining;
        }
        match levels.last_mut() {
            Some(last) if last.0 == price => last.1 = round_to(last.1 + qty, market.qty_step),
            _ => levels.push((price, qty)),
        }
        remaining = round_to(remaining - qty, market.qty_step);
    }

    if let Some(&(price, qty)) = levels.iter().max_by(|a, b| a.1.total_cmp(&b.1)) {
        if levels.len() > 1 && qty > MERGE_THRESHOLD * full {
            return vec![GridOrder {
                qty: budget,
                price,
                kind: OrderKind::CloseGrid,
            }];
        }
    }

    levels
        .into_iter()
        .map(|(price, qty)| GridOrder {
            qty,
            price,
            kind: OrderKind::CloseGrid,
        })
        .collect()
}

fn trailing_close_qty_short(
    market: &Market,
    state: &StateParams,
    params: &BotParams,
    position: &Position,
    trailing: &TrailingExtremes,
    qty: f64,
) -> Option<GridOrder> {
    if qty <= 0.0 || params.close_trailing_retracement_pct <= 0.0 {
        return None;
    }
    let armed = params.close_trailing_threshold_pct <= 0.0
        || trailing.min_since_open
            < position.price * (1.0 - params.close_trailing_threshold_pct);
    if !armed {
        return None;
    }
    let trigger = trailing.min_since_open * (1.0 + params.close_trailing_retracement_pct);
    if trailing.max_since_min <= trigger {
        return None;
    }
    let price = state
        .order_book
        .bid
        .min(round_dn(trigger, market.price_step));
    if price <= 0.0 || qty < market_min_qty(market, price) {
        return None;
    }
    Some(GridOrder {
        qty,
        price,
        kind: OrderKind::CloseTrailing,
    })
}

pub fn calc_closes_short(
    market: &Market,
    state: &StateParams,
    params: &BotParams,
    position: &Position,
    trailing: &TrailingExtremes,
) -> Vec<GridOrder> {
    if position.size >= 0.0 {
        return Vec::new();
    }
    let full = position.size.abs();
    let ratio = params.close_trailing_grid_ratio;
    if ratio >= 1.0 || ratio <= -1.0 {
        return trailing_close_qty_short(market, state, params, position, trailing, full)
            .into_iter()
            .collect();
    }
    if ratio == 0.0 {
        return close_grid_short(market, state, params, position, full);
    }
    let trailing_qty = round_to(full * ratio.abs(), market.qty_step).min(full);
    let grid_qty = round_to(full - trailing_qty, market.qty_step);
    let mut out = Vec::new();
    if let Some(tc) =
        trailing_close_qty_short(market, state, params, position, trailing, trailing_qty)
    {
        out.push(tc);
    }
    out.extend(close_grid_short(market, state, params, position, grid_qty));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{EmaBands, OrderBook};

    fn test_market() -> Market {
        Market {
            symbol: "XYZ/USDT:USDT".to_string(),
            price_step: 0.1,
            qty_step: 0.001,
            min_qty: 0.001,
            min_cost: 5.0,
            c_mult: 1.0,
            inverse: false,
            active: true,
            quote: "USDT".to_string(),
            listed_ts: None,
        }
    }

    fn test_state() -> StateParams {
        StateParams {
            balance: 1000.0,
            order_book: OrderBook {
                bid: 99.9,
                ask: 100.0,
            },
            ema_bands: EmaBands {
                lower: 99.0,
                upper: 101.0,
            },
        }
    }

    fn test_params() -> BotParams {
        BotParams {
            close_grid_min_markup: 0.002,
            close_grid_markup_range: 0.004,
            close_grid_qty_pct: 0.2,
            wallet_exposure_limit: 1.0,
            ..BotParams::default()
        }
    }

    #[test]
    fn long_close_grid_ladders_markup_range() {
        let closes = calc_closes_long(
            &test_market(),
            &test_state(),
            &test_params(),
            &Position {
                size: 1.0,
                price: 100.0,
            },
            &TrailingExtremes::default(),
        );
        assert_eq!(closes.len(), 5);
        let prices: Vec<f64> = closes.iter().map(|o| o.price).collect();
        assert_eq!(prices, vec![100.2, 100.3, 100.4, 100.5, 100.6]);
        for o in &closes {
            assert!((o.qty + 0.2).abs() < 1e-9);
            assert_eq!(o.kind, OrderKind::CloseGrid);
        }
        // full position covered
        let total: f64 = closes.iter().map(|o| o.qty.abs()).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn long_close_prices_strictly_increase() {
        let closes = calc_closes_long(
            &test_market(),
            &test_state(),
            &test_params(),
            &Position {
                size: 1.0,
                price: 100.0,
            },
            &TrailingExtremes::default(),
        );
        for w in closes.windows(2) {
            assert!(w[1].price > w[0].price);
        }
    }

    #[test]
    fn levels_below_ask_collapse_onto_ask() {
        // position price far below market: every computed level is under the
        // ask, so the whole ladder merges into one close at the ask
        let closes = calc_closes_long(
            &test_market(),
            &test_state(),
            &test_params(),
            &Position {
                size: 1.0,
                price: 50.0,
            },
            &TrailingExtremes::default(),
        );
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].price, 100.0);
        assert!((closes[0].qty + 1.0).abs() < 1e-9);
    }

    #[test]
    fn short_close_grid_mirrors_long() {
        let closes = calc_closes_short(
            &test_market(),
            &test_state(),
            &test_params(),
            &Position {
                size: -1.0,
                price: 100.0,
            },
            &TrailingExtremes::default(),
        );
        assert_eq!(closes.len(), 5);
        let prices: Vec<f64> = closes.iter().map(|o| o.price).collect();
        assert_eq!(prices, vec![99.8, 99.7, 99.6, 99.5, 99.4]);
        for o in &closes {
            assert!(o.qty > 0.0);
        }
    }

    #[test]
    fn trailing_close_fires_on_retracement() {
        let market = test_market();
        let state = test_state();
        let mut params = test_params();
        params.close_trailing_grid_ratio = 1.0;
        params.close_trailing_threshold_pct = 0.01;
        params.close_trailing_retracement_pct = 0.02;
        let pos = Position {
            size: 1.0,
            price: 100.0,
        };
        // ran up past threshold, but no pullback yet
        let running = TrailingExtremes {
            max_since_open: 105.0,
            min_since_max: 104.0,
            ..TrailingExtremes::default()
        };
        assert!(calc_closes_long(&market, &state, &params, &pos, &running).is_empty());
        // pulled back through the retracement level
        let retraced = TrailingExtremes {
            max_since_open: 105.0,
            min_since_max: 102.0,
            ..TrailingExtremes::default()
        };
        let closes = calc_closes_long(&market, &state, &params, &pos, &retraced);
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].kind, OrderKind::CloseTrailing);
        // 105 * 0.98 = 102.9
        assert!((closes[0].price - 102.9).abs() < 1e-9);
        assert!((closes[0].qty + 1.0).abs() < 1e-9);
    }

    #[test]
    fn hybrid_ratio_splits_position_between_rules() {
        let market = test_market();
        let state = test_state();
        let mut params = test_params();
        params.close_trailing_grid_ratio = 0.4;
        params.close_trailing_threshold_pct = 0.01;
        params.close_trailing_retracement_pct = 0.02;
        let pos = Position {
            size: 1.0,
            price: 100.0,
        };
        let retraced = TrailingExtremes {
            max_since_open: 105.0,
            min_since_max: 102.0,
            ..TrailingExtremes::default()
        };
        let closes = calc_closes_long(&market, &state, &params, &pos, &retraced);
        let trailing_qty: f64 = closes
            .iter()
            .filter(|o| o.kind == OrderKind::CloseTrailing)
            .map(|o| o.qty.abs())
            .sum();
        let grid_qty: f64 = closes
            .iter()
            .filter(|o| o.kind == OrderKind::CloseGrid)
            .map(|o| o.qty.abs())
            .sum();
        assert!((trailing_qty - 0.4).abs() < 1e-9);
        assert!((grid_qty - 0.6).abs() < 1e-9);
    }
}
