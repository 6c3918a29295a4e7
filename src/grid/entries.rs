//! Entry proposals: initial EMA-band entry, recursive martingale reentry
//! grid, and trailing reentries, interpolated by `entry_trailing_grid_ratio`.

use crate::config::BotParams;
use crate::math::{
    calc_new_psize_pprice, calc_wallet_exposure, cost_to_qty, min_entry_qty, round_dn,
};
use crate::types::{Market, OrderKind, Position, TrailingExtremes};

use super::{GridOrder, StateParams};

/// Emitting past this many hypothetical levels means the parameters are
/// degenerate (e.g. zero spacing); bail instead of spinning.
const MAX_GRID_LEVELS: usize = 500;

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

/// Qty for one reentry level: double-down on the current size, at least the
/// venue minimum.
fn reentry_qty(market: &Market, params: &BotParams, psize: f64, price: f64) -> f64 {
    market_min_qty(market, price).max(round_dn(
        psize.abs() * params.entry_grid_double_down_factor,
        market.qty_step,
    ))
}

/// Shrink a reentry so the filled position lands exactly on the exposure
/// limit. Returns 0.0 when even the venue minimum would overshoot.
fn crop_reentry_qty(
    market: &Market,
    state: &StateParams,
    we_limit: f64,
    position: &Position,
    price: f64,
) -> f64 {
    let pos_cost = crate::math::qty_to_cost(position.size, position.price, market.c_mult, market.inverse);
    let headroom = state.balance * we_limit - pos_cost;
    if headroom <= 0.0 {
        return 0.0;
    }
    let qty = round_dn(
        cost_to_qty(headroom, price, market.c_mult, market.inverse),
        market.qty_step,
    );
    if qty < market_min_qty(market, price) {
        0.0
    } else {
        qty
    }
}

fn initial_entry_long(
    market: &Market,
    state: &StateParams,
    params: &BotParams,
) -> Option<GridOrder> {
    let price = state.order_book.bid.min(round_dn(
        state.ema_bands.lower * (1.0 - params.entry_initial_ema_dist),
        market.price_step,
    ));
    if price <= 0.0 {
        return None;
    }
    let min_q = market_min_qty(market, price);
    let budget = state.balance * params.wallet_exposure_limit;
    let qty = min_q
        .max(round_dn(
            cost_to_qty(
                budget * params.entry_initial_qty_pct,
                price,
                market.c_mult,
                market.inverse,
            ),
            market.qty_step,
        ))
        // never propose more than the whole exposure budget affords
        .min(round_dn(
            cost_to_qty(budget, price, market.c_mult, market.inverse),
            market.qty_step,
        ));
    if qty < min_q {
        return None;
    }
    Some(GridOrder {
        qty,
        price,
        kind: OrderKind::EntryInitialNormal,
    })
}

fn grid_reentry_long(
    market: &Market,
    state: &StateParams,
    params: &BotParams,
    we_limit: f64,
    position: &Position,
) -> Option<GridOrder> {
    let we = calc_wallet_exposure(
        market.c_mult,
        state.balance,
        position.size,
        position.price,
        market.inverse,
    );
    // spacing widens as exposure builds up
    let spacing =
        params.entry_grid_spacing_pct * (1.0 + params.entry_grid_spacing_weight * we / we_limit);
    let price = state
        .order_book
        .bid
        .min(round_dn(position.price * (1.0 - spacing), market.price_step));
    if price <= 0.0 {
        return None;
    }
    let qty = reentry_qty(market, params, position.size, price);
    let (new_size, new_price) =
        calc_new_psize_pprice(position.size, position.price, qty, price, market.qty_step);
    let we_next = calc_wallet_exposure(
        market.c_mult,
        state.balance,
        new_size,
        new_price,
        market.inverse,
    );
    if we_next > we_limit {
        let cropped = crop_reentry_qty(market, state, we_limit, position, price);
        if cropped <= 0.0 {
            return None;
        }
        return Some(GridOrder {
            qty: cropped,
            price,
            kind: OrderKind::EntryGridCropped,
        });
    }
    Some(GridOrder {
        qty,
        price,
        kind: OrderKind::EntryGridNormal,
    })
}

fn trailing_reentry_long(
    market: &Market,
    state: &StateParams,
    params: &BotParams,
    we_limit: f64,
    position: &Position,
    trailing: &TrailingExtremes,
) -> Option<GridOrder> {
    if params.entry_trailing_retracement_pct <= 0.0 {
        return None;
    }
    let armed = params.entry_trailing_threshold_pct <= 0.0
        || trailing.min_since_open
            < position.price * (1.0 - params.entry_trailing_threshold_pct);
    if !armed {
        return None;
    }
    // fires once price has bounced `retracement` off the low
    let trigger = trailing.min_since_open * (1.0 + params.entry_trailing_retracement_pct);
    if trailing.max_since_min <= trigger {
        return None;
    }
    let price = state
        .order_book
        .bid
        .min(round_dn(trigger, market.price_step));
    if price <= 0.0 {
        return None;
    }
    let qty = reentry_qty(market, params, position.size, price);
    let (new_size, new_price) =
        calc_new_psize_pprice(position.size, position.price, qty, price, market.qty_step);
    let we_next = calc_wallet_exposure(
        market.c_mult,
        state.balance,
        new_size,
        new_price,
        market.inverse,
    );
    if we_next > we_limit {
        let cropped = crop_reentry_qty(market, state, we_limit, position, price);
        if cropped <= 0.0 {
            return None;
        }
        return Some(GridOrder {
            qty: cropped,
            price,
            kind: OrderKind::EntryTrailingCropped,
        });
    }
    Some(GridOrder {
        qty,
        price,
        kind: OrderKind::EntryTrailingNormal,
    })
}

/// Next entry for a long position, routing between grid and trailing rules.
///
/// `entry_trailing_grid_ratio` in [-1, 1] splits the exposure budget:
/// positive means trailing fills the first `ratio` share of the budget and
/// the grid the rest; negative means grid first up to `1 + ratio`, trailing
/// after; 0 is pure grid and |1| pure trailing.
fn calc_next_entry_long(
    market: &Market,
    state: &StateParams,
    params: &BotParams,
    position: &Position,
    trailing: &TrailingExtremes,
) -> Option<GridOrder> {
    let we_limit = params.wallet_exposure_limit;
    if we_limit <= 0.0 || state.balance <= 0.0 {
        return None;
    }
    if !position.is_open() {
        return initial_entry_long(market, state, params);
    }
    let we = calc_wallet_exposure(
        market.c_mult,
        state.balance,
        position.size,
        position.price,
        market.inverse,
    );
    if we >= we_limit * 0.999 {
        return None;
    }
    let ratio = params.entry_trailing_grid_ratio;
    if ratio <= -1.0 || ratio >= 1.0 {
        trailing_reentry_long(market, state, params, we_limit, position, trailing)
    } else if ratio == 0.0 {
        grid_reentry_long(market, state, params, we_limit, position)
    } else if ratio > 0.0 {
        if we / we_limit < ratio {
            trailing_reentry_long(market, state, params, we_limit * ratio, position, trailing)
        } else {
            grid_reentry_long(market, state, params, we_limit, position)
        }
    } else if we / we_limit < 1.0 + ratio {
        grid_reentry_long(market, state, params, we_limit * (1.0 + ratio), position)
    } else {
        trailing_reentry_long(market, state, params, we_limit, position, trailing)
    }
}

/// Whole pending entry ladder for a long position: recurse on the
/// hypothetical position after each fill until the next level is infeasible.
pub fn calc_entries_long(
    market: &Market,
    state: &StateParams,
    params: &BotParams,
    position: &Position,
    trailing: &TrailingExtremes,
) -> Vec<GridOrder> {
    let mut pos = *position;
    let mut entries: Vec<GridOrder> = Vec::new();
    for _ in 0..MAX_GRID_LEVELS {
        let Some(entry) = calc_next_entry_long(market, state, params, &pos, trailing) else {
            break;
        };
        if entry.qty <= 0.0 || entry.price <= 0.0 {
            break;
        }
        if entries.last() == Some(&entry) {
            break;
        }
        // trailing levels are priced off real extremes, which hypothetical
        // fills cannot move: at most one per ladder
        if matches!(
            entry.kind,
            OrderKind::EntryTrailingNormal | OrderKind::EntryTrailingCropped
        ) && !entries.is_empty()
        {
            break;
        }
        let (size, price) =
            calc_new_psize_pprice(pos.size, pos.price, entry.qty, entry.price, market.qty_step);
        pos = Position { size, price };
        entries.push(entry);
    }
    entries
}

fn initial_entry_short(
    market: &Market,
    state: &StateParams,
    params: &BotParams,
) -> Option<GridOrder> {
    let price = state.order_book.ask.max(crate::math::round_up(
        state.ema_bands.upper * (1.0 + params.entry_initial_ema_dist),
        market.price_step,
    ));
    if price <= 0.0 {
        return None;
    }
    let min_q = market_min_qty(market, price);
    let budget = state.balance * params.wallet_exposure_limit;
    let qty = min_q
        .max(round_dn(
            cost_to_qty(
                budget * params.entry_initial_qty_pct,
                price,
                market.c_mult,
                market.inverse,
            ),
            market.qty_step,
        ))
        .min(round_dn(
            cost_to_qty(budget, price, market.c_mult, market.inverse),
            market.qty_step,
        ));
    if qty < min_q {
        return None;
    }
    Some(GridOrder {
        qty: -qty,
        price,
        kind: OrderKind::EntryInitialNormal,
    })
}

fn grid_reentry_short(
    market: &Market,
    state: &StateParams,
    params: &BotParams,
    we_limit: f64,
    position: &Position,
) -> Option<GridOrder> {
    let we = calc_wallet_exposure(
        market.c_mult,
        state.balance,
        position.size,
        position.price,
        market.inverse,
    );
    let spacing =
        params.entry_grid_spacing_pct * (1.0 + params.entry_grid_spacing_weight * we / we_limit);
    let price = state.order_book.ask.max(crate::math::round_up(
        position.price * (1.0 + spacing),
        market.price_step,
    ));
    if price <= 0.0 {
        return None;
    }
    let qty = reentry_qty(market, params, position.size, price);
    let (new_size, new_price) =
        calc_new_psize_pprice(position.size, position.price, -qty, price, market.qty_step);
    let we_next = calc_wallet_exposure(
        market.c_mult,
        state.balance,
        new_size,
        new_price,
        market.inverse,
    );
    if we_next > we_limit {
        let cropped = crop_reentry_qty(market, state, we_limit, position, price);
        if cropped <= 0.0 {
            return None;
        }
        return Some(GridOrder {
            qty: -cropped,
            price,
            kind: OrderKind::EntryGridCropped,
        });
    }
    Some(GridOrder {
        qty: -qty,
        price,
        kind: OrderKind::EntryGridNormal,
    })
}

fn trailing_reentry_short(
    market: &Market,
    state: &StateParams,
    params: &BotParams,
    we_limit: f64,
    position: &Position,
    trailing: &TrailingExtremes,
) -> Option<GridOrder> {
    if params.entry_trailing_retracement_pct <= 0.0 {
        return None;
    }
    let armed = params.entry_trailing_threshold_pct <= 0.0
        || trailing.max_since_open
            > position.price * (1.0 + params.entry_trailing_threshold_pct);
    if !armed {
        return None;
    }
    let trigger = trailing.max_since_open * (1.0 - params.entry_trailing_retracement_pct);
    if trailing.min_since_max >= trigger {
        return None;
    }
    let price = state
        .order_book
        .ask
        .max(crate::math::round_up(trigger, market.price_step));
    if price <= 0.0 {
        return None;
    }
    let qty = reentry_qty(market, params, position.size, price);
    let (new_size, new_price) =
        calc_new_psize_pprice(position.size, position.price, -qty, price, market.qty_step);
    let we_next = calc_wallet_exposure(
        market.c_mult,
        state.balance,
        new_size,
        new_price,
        market.inverse,
    );
    if we_next > we_limit {
        let cropped = crop_reentry_qty(market, state, we_limit, position, price);
        if cropped <= 0.0 {
            return None;
        }
        return Some(GridOrder {
            qty: -cropped,
            price,
            kind: OrderKind::EntryTrailingCropped,
        });
    }
    Some(GridOrder {
        qty: -qty,
        price,
        kind: OrderKind::EntryTrailingNormal,
    })
}

fn calc_next_entry_short(
    market: &Market,
    state: &StateParams,
    params: &BotParams,
    position: &Position,
    trailing: &TrailingExtremes,
) -> Option<GridOrder> {
    let we_limit = params.wallet_exposure_limit;
    if we_limit <= 0.0 || state.balance <= 0.0 {
        return None;
    }
    if !position.is_open() {
        return initial_entry_short(market, state, params);
    }
    let we = calc_wallet_exposure(
        market.c_mult,
        state.balance,
        position.size,
        position.price,
        market.inverse,
    );
    if we >= we_limit * 0.999 {
        return None;
    }
    let ratio = params.entry_trailing_grid_ratio;
    if ratio <= -1.0 || ratio >= 1.0 {
        trailing_reentry_short(market, state, params, we_limit, position, trailing)
    } else if ratio == 0.0 {
        grid_reentry_short(market, state, params, we_limit, position)
    } else if ratio > 0.0 {
        if we / we_limit < ratio {
            trailing_reentry_short(market, state, params, we_limit * ratio, position, trailing)
        } else {
            grid_reentry_short(market, state, params, we_limit, position)
        }
    } else if we / we_limit < 1.0 + ratio {
        grid_reentry_short(market, state, params, we_limit * (1.0 + ratio), position)
    } else {
        trailing_reentry_short(market, state, params, we_limit, position, trailing)
    }
}

pub fn calc_entries_short(
    market: &Market,
    state: &StateParams,
    params: &BotParams,
    position: &Position,
    trailing: &TrailingExtremes,
) -> Vec<GridOrder> {
    let mut pos = *position;
    let mut entries: Vec<GridOrder> = Vec::new();
    for _ in 0..MAX_GRID_LEVELS {
        let Some(entry) = calc_next_entry_short(market, state, params, &pos, trailing) else {
            break;
        };
        if entry.qty >= 0.0 || entry.price <= 0.0 {
            break;
        }
        if entries.last() == Some(&entry) {
            break;
        }
        if matches!(
            entry.kind,
            OrderKind::EntryTrailingNormal | OrderKind::EntryTrailingCropped
        ) && !entries.is_empty()
        {
            break;
        }
        let (size, price) =
            calc_new_psize_pprice(pos.size, pos.price, entry.qty, entry.price, market.qty_step);
        pos = Position { size, price };
        entries.push(entry);
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{EmaBands, OrderBook};
    use crate::math::{calc_wallet_exposure, qty_to_cost};

    fn test_market() -> Market {
        Market {
            symbol: "XYZ/USDT:USDT".to_string(),
            price_step: 0.01,
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
                bid: 100.0,
                ask: 100.01,
            },
            ema_bands: EmaBands {
                lower: 99.5,
                upper: 100.5,
            },
        }
    }

    fn test_params() -> BotParams {
        BotParams {
            entry_initial_ema_dist: 0.01,
            entry_initial_qty_pct: 0.05,
            entry_grid_spacing_pct: 0.04,
            entry_grid_spacing_weight: 1.0,
            entry_grid_double_down_factor: 1.0,
            wallet_exposure_limit: 1.0,
            ..BotParams::default()
        }
    }

    #[test]
    fn initial_long_entry_at_ema_band() {
        let entries = calc_entries_long(
            &test_market(),
            &test_state(),
            &test_params(),
            &Position::default(),
            &TrailingExtremes::default(),
        );
        assert!(!entries.is_empty());
        let first = entries[0];
        assert_eq!(first.kind, OrderKind::EntryInitialNormal);
        // round_dn(99.5 * 0.99) = 98.50
        assert!((first.price - 98.50).abs() < 1e-9);
        // round(0.05 * 1000 * 1.0 / 98.50) on 0.001 step
        assert!((first.qty - 0.507).abs() < 1e-9);
    }

    #[test]
    fn first_reentry_spacing_scales_with_exposure() {
        let market = test_market();
        let state = test_state();
        let params = test_params();
        let pos = Position {
            size: 0.5,
            price: 98.50,
        };
        let entry = calc_next_entry_long(
            &market,
            &state,
            &params,
            &pos,
            &TrailingExtremes::default(),
        )
        .unwrap();
        let we = calc_wallet_exposure(1.0, 1000.0, 0.5, 98.50, false);
        let expected = crate::math::round_dn(98.50 * (1.0 - 0.04 * (1.0 + we)), 0.01);
        assert_eq!(entry.kind, OrderKind::EntryGridNormal);
        assert!((entry.price - expected).abs() < 1e-9);
        assert!((entry.qty - 0.5).abs() < 1e-9);
    }

    #[test]
    fn entry_ladder_respects_exposure_limit() {
        let market = test_market();
        let state = test_state();
        let params = test_params();
        let entries = calc_entries_long(
            &market,
            &state,
            &params,
            &Position::default(),
            &TrailingExtremes::default(),
        );
        assert!(entries.len() > 1);
        // replay all fills: final exposure must not exceed the limit
        let mut pos = Position::default();
        for e in &entries {
            let (size, price) =
                calc_new_psize_pprice(pos.size, pos.price, e.qty, e.price, market.qty_step);
            pos = Position { size, price };
        }
        let we = calc_wallet_exposure(1.0, state.balance, pos.size, pos.price, false);
        assert!(we <= params.wallet_exposure_limit + 1e-6);
        // and without the last level it stays clearly below
        let mut pos = Position::default();
        for e in &entries[..entries.len() - 1] {
            let (size, price) =
                calc_new_psize_pprice(pos.size, pos.price, e.qty, e.price, market.qty_step);
            pos = Position { size, price };
        }
        let we_without_last =
            calc_wallet_exposure(1.0, state.balance, pos.size, pos.price, false);
        let last = entries.last().unwrap();
        let last_cost = qty_to_cost(last.qty, last.price, 1.0, false);
        assert!(we_without_last < params.wallet_exposure_limit - last_cost / state.balance + 1e-6);
    }

    #[test]
    fn long_entry_prices_strictly_decrease() {
        let entries = calc_entries_long(
            &test_market(),
            &test_state(),
            &test_params(),
            &Position::default(),
            &TrailingExtremes::default(),
        );
        for w in entries.windows(2) {
            assert!(w[1].price < w[0].price, "{:?}", entries);
        }
    }

    #[test]
    fn short_entry_prices_strictly_increase() {
        let entries = calc_entries_short(
            &test_market(),
            &test_state(),
            &test_params(),
            &Position::default(),
            &TrailingExtremes::default(),
        );
        assert!(entries.len() > 1);
        for w in entries.windows(2) {
            assert!(w[1].price > w[0].price);
        }
        for e in &entries {
            assert!(e.qty < 0.0);
        }
    }

    #[test]
    fn entries_meet_venue_minimums() {
        let entries = calc_entries_long(
            &test_market(),
            &test_state(),
            &test_params(),
            &Position::default(),
            &TrailingExtremes::default(),
        );
        for e in &entries {
            assert!(e.qty >= 0.001);
            assert!(e.qty * e.price >= 5.0 * (1.0 - 1e-9));
        }
    }

    #[test]
    fn pure_trailing_waits_for_retracement() {
        let market = test_market();
        let state = test_state();
        let mut params = test_params();
        params.entry_trailing_grid_ratio = 1.0;
        params.entry_trailing_threshold_pct = 0.05;
        params.entry_trailing_retracement_pct = 0.02;
        let pos = Position {
            size: 0.5,
            price: 100.0,
        };
        // price never dropped below the threshold: nothing proposed
        let quiet = TrailingExtremes {
            min_since_open: 99.0,
            max_since_min: 99.5,
            ..TrailingExtremes::default()
        };
        assert!(calc_entries_long(&market, &state, &params, &pos, &quiet).is_empty());
        // dropped past threshold and bounced past retracement: entry fires
        let bounced = TrailingExtremes {
            min_since_open: 90.0,
            max_since_min: 95.0,
            ..TrailingExtremes::default()
        };
        let entries = calc_entries_long(&market, &state, &params, &pos, &bounced);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, OrderKind::EntryTrailingNormal);
        // placed at the retracement level, 90 * 1.02
        assert!((entries[0].price - 91.8).abs() < 1e-9);
    }
}
