//! Ideal-vs-actual diff. Keys quantize qty and price to their exchange steps
//! so float noise cannot produce cancel/create churn.

use std::collections::HashMap;

use crate::math::calc_diff;
use crate::types::{Mode, Order, PositionSide};

/// Per-symbol context the diff needs: steps for key quantization, last price
/// for proximity ordering, current modes for the touch filters.
#[derive(Debug, Clone, Copy)]
pub struct SymbolCtx {
    pub qty_step: f64,
    pub price_step: f64,
    pub last: f64,
    pub mode_long: Mode,
    pub mode_short: Mode,
}

impl SymbolCtx {
    fn mode(&self, pside: PositionSide) -> Mode {
        match pside {
            PositionSide::Long => self.mode_long,
            PositionSide::Short => self.mode_short,
        }
    }
}

type OrderKey = (String, crate::types::Side, PositionSide, i64, i64);

fn quantize(x: f64, step: f64) -> i64 {
    if step <= 0.0 {
        (x * 1e9).round() as i64
    } else {
        (x / step).round() as i64
    }
}

fn order_key(order: &Order, ctx: &HashMap<String, SymbolCtx>) -> OrderKey {
    let (qty_step, price_step) = ctx
        .get(&order.symbol)
        .map(|c| (c.qty_step, c.price_step))
        .unwrap_or((0.0, 0.0));
    (
        order.symbol.clone(),
        order.side,
        order.position_side,
        quantize(order.qty, qty_step),
        quantize(order.price, price_step),
    )
}

fn mode_allows(order: &Order, ctx: &HashMap<String, SymbolCtx>) -> bool {
    let Some(c) = ctx.get(&order.symbol) else {
        return true;
    };
    match c.mode(order.position_side) {
        // hands off entirely
        Mode::Manual => false,
        // only reduce-only orders may be touched
        Mode::TpOnly => order.reduce_only,
        _ => true,
    }
}

fn distance(order: &Order, ctx: &HashMap<String, SymbolCtx>) -> f64 {
    match ctx.get(&order.symbol) {
        Some(c) if c.last > 0.0 => calc_diff(order.price, c.last),
        _ => f64::MAX,
    }
}

/// Diff the ideal set against the venue's resting orders. Returns
/// (to_cancel, to_create), both ordered closest-to-tape first and trimmed to
/// the batch caps; cancel trimming keeps reduce-only orders ahead of the
/// rest.
pub fn diff_orders(
    ideal: &[Order],
    actual: &[Order],
    ctx: &HashMap<String, SymbolCtx>,
    max_cancellations: usize,
    max_creations: usize,
) -> (Vec<Order>, Vec<Order>) {
    let mut ideal_counts: HashMap<OrderKey, usize> = HashMap::new();
    for order in ideal {
        *ideal_counts.entry(order_key(order, ctx)).or_default() += 1;
    }
    let mut actual_counts: HashMap<OrderKey, usize> = HashMap::new();
    for order in actual {
        *actual_counts.entry(order_key(order, ctx)).or_default() += 1;
    }

    let mut to_cancel: Vec<Order> = Vec::new();
    for order in actual {
        let key = order_key(order, ctx);
        match ideal_counts.get_mut(&key) {
            Some(n) if *n > 0 => *n -= 1,
            _ => to_cancel.push(order.clone()),
        }
    }
    let mut to_create: Vec<Order> = Vec::new();
    for order in ideal {
        let key = order_key(order, ctx);
        match actual_counts.get_mut(&key) {
            Some(n) if *n > 0 => *n -= 1,
            _ => to_create.push(order.clone()),
        }
    }

    to_cancel.retain(|o| mode_allows(o, ctx));
    to_create.retain(|o| mode_allows(o, ctx));

    to_cancel.sort_by(|a, b| distance(a, ctx).total_cmp(&distance(b, ctx)));
    to_create.sort_by(|a, b| distance(a, ctx).total_cmp(&distance(b, ctx)));

    if to_cancel.len() > max_cancellations {
        // closes protect the account; keep them ahead of entry churn
        to_cancel.sort_by(|a, b| {
            b.reduce_only
                .cmp(&a.reduce_only)
                .then(distance(a, ctx).total_cmp(&distance(b, ctx)))
        });
        to_cancel.truncate(max_cancellations);
    }
    to_create.truncate(max_creations);

    (to_cancel, to_create)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;

    fn ctx_for(symbols: &[&str]) -> HashMap<String, SymbolCtx> {
        symbols
            .iter()
            .map(|s| {
                (
                    s.to_string(),
                    SymbolCtx {
                        qty_step: 0.001,
                        price_step: 0.01,
                        last: 100.0,
                        mode_long: Mode::Normal,
                        mode_short: Mode::Normal,
                    },
                )
            })
            .collect()
    }

    fn order(symbol: &str, side: Side, qty: f64, price: f64, reduce_only: bool) -> Order {
        Order {
            symbol: symbol.to_string(),
            side,
            position_side: PositionSide::Long,
            qty,
            price,
            reduce_only,
            id: Some(format!("{symbol}-{side:?}-{qty}-{price}")),
            custom_id: String::new(),
        }
    }

    #[test]
    fn identical_sets_produce_no_work() {
        let ctx = ctx_for(&["A"]);
        let orders = vec![
            order("A", Side::Buy, 0.5, 99.0, false),
            order("A", Side::Sell, 0.5, 101.0, true),
        ];
        let (cancels, creates) = diff_orders(&orders, &orders, &ctx, 10, 10);
        assert!(cancels.is_empty());
        assert!(creates.is_empty());
    }

    #[test]
    fn qty_change_cancels_and_recreates_same_price() {
        let ctx = ctx_for(&["A"]);
        let actual = vec![order("A", Side::Sell, 0.2, 100.3, true)];
        let ideal = vec![order("A", Side::Sell, 0.3, 100.3, true)];
        let (cancels, creates) = diff_orders(&ideal, &actual, &ctx, 10, 10);
        assert_eq!(cancels.len(), 1);
        assert_eq!(creates.len(), 1);
        assert!((cancels[0].qty - 0.2).abs() < 1e-9);
        assert!((creates[0].qty - 0.3).abs() < 1e-9);
    }

    #[test]
    fn float_noise_within_step_does_not_churn() {
        let ctx = ctx_for(&["A"]);
        let actual = vec![order("A", Side::Buy, 0.5, 99.0, false)];
        let ideal = vec![order("A", Side::Buy, 0.5000000001, 99.000000001, false)];
        let (cancels, creates) = diff_orders(&ideal, &actual, &ctx, 10, 10);
        assert!(cancels.is_empty());
        assert!(creates.is_empty());
    }

    #[test]
    fn manual_side_is_untouchable() {
        let mut ctx = ctx_for(&["A"]);
        ctx.get_mut("A").unwrap().mode_long = Mode::Manual;
        let actual = vec![order("A", Side::Buy, 0.5, 99.0, false)];
        let ideal = vec![order("A", Side::Buy, 0.7, 98.0, false)];
        let (cancels, creates) = diff_orders(&ideal, &actual, &ctx, 10, 10);
        assert!(cancels.is_empty());
        assert!(creates.is_empty());
    }

    #[test]
    fn tp_only_touches_only_reduce_only() {
        let mut ctx = ctx_for(&["A"]);
        ctx.get_mut("A").unwrap().mode_long = Mode::TpOnly;
        let actual = vec![
            order("A", Side::Buy, 0.5, 99.0, false),
            order("A", Side::Sell, 0.2, 101.0, true),
        ];
        let ideal = vec![order("A", Side::Sell, 0.3, 101.0, true)];
        let (cancels, creates) = diff_orders(&ideal, &actual, &ctx, 10, 10);
        // the stale entry survives; the stale close is replaced
        assert_eq!(cancels.len(), 1);
        assert!(cancels[0].reduce_only);
        assert_eq!(creates.len(), 1);
        assert!((creates[0].qty - 0.3).abs() < 1e-9);
    }

    #[test]
    fn queues_sorted_by_distance_and_trimmed() {
        let ctx = ctx_for(&["A"]);
        let ideal = vec![
            order("A", Side::Buy, 0.1, 90.0, false),
            order("A", Side::Buy, 0.1, 99.0, false),
            order("A", Side::Buy, 0.1, 95.0, false),
        ];
        let (_, creates) = diff_orders(&ideal, &[], &ctx, 10, 2);
        assert_eq!(creates.len(), 2);
        assert_eq!(creates[0].price, 99.0);
        assert_eq!(creates[1].price, 95.0);
    }

    #[test]
    fn cancel_trim_prioritizes_reduce_only() {
        let ctx = ctx_for(&["A"]);
        let actual = vec![
            order("A", Side::Buy, 0.1, 99.5, false),
            order("A", Side::Buy, 0.1, 99.0, false),
            order("A", Side::Sell, 0.2, 110.0, true),
        ];
        let (cancels, _) = diff_orders(&[], &actual, &ctx, 2, 10);
        assert_eq!(cancels.len(), 2);
        // the far-away reduce-only close outranks nearer entries
        assert!(cancels[0].reduce_only);
        assert_eq!(cancels[1].price, 99.5);
    }
}
