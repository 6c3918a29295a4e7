//! Loss-bleed closes for positions whose wallet exposure has blown past the
//! unstuck threshold. At most one (symbol, side) bleeds per tick, and the
//! bleed size is capped by the realized-loss allowance.

use crate::config::BotParams;
use crate::math::{
    calc_pnl, calc_pprice_diff, calc_wallet_exposure, cost_to_qty, min_entry_qty, round_dn,
    round_up,
};
use crate::types::{Market, OrderKind, Position, PositionSide, Ticker};

use super::GridOrder;

/// Everything the bleed selector needs to know about one stuck candidate.
#[derive(Debug, Clone)]
pub struct UnstuckCandidate {
    pub symbol: String,
    pub pside: PositionSide,
    pub market: Market,
    pub ticker: Ticker,
    pub position: Position,
    pub params: BotParams,
    pub ema_band_lower: f64,
    pub ema_band_upper: f64,
    /// Best regular close price already composed for this side, if any.
    pub first_close_price: Option<f64>,
}

pub fn is_stuck(we: f64, we_limit: f64, threshold: f64) -> bool {
    we_limit == 0.0 || we / we_limit > threshold
}

/// Remaining realized-loss budget given the ledger's cumulative pnl and its
/// running peak: the bleed may not push cumulative pnl further than
/// `loss_allowance_pct` of the balance at the pnl peak below that peak.
pub fn loss_allowance(balance: f64, loss_allowance_pct: f64, pnl_cum: f64, pnl_peak: f64) -> f64 {
    let drawdown = pnl_peak - pnl_cum;
    let peak_balance = balance + drawdown;
    peak_balance * loss_allowance_pct - drawdown
}

fn bleed_qty(
    candidate: &UnstuckCandidate,
    balance: f64,
    close_price: f64,
    allowance: f64,
) -> f64 {
    let market = &candidate.market;
    let params = &candidate.params;
    let min_q = min_entry_qty(
        close_price,
        market.inverse,
        market.c_mult,
        market.qty_step,
        market.min_qty,
        market.min_cost,
    );
    let mut qty = candidate.position.size.abs().min(min_q.max(round_dn(
        cost_to_qty(
            balance * params.wallet_exposure_limit * params.unstuck_close_pct,
            close_price,
            market.c_mult,
            market.inverse,
        ),
        market.qty_step,
    )));
    if qty <= 0.0 {
        return 0.0;
    }
    let expected = calc_pnl(
        candidate.pside,
        candidate.position.price,
        close_price,
        qty,
        market.inverse,
        market.c_mult,
    );
    if expected < 0.0 {
        let loss = -expected;
        if allowance <= 0.0 {
            return 0.0;
        }
        if loss > allowance {
            qty = round_dn(qty * allowance / loss, market.qty_step);
        }
    }
    if qty < min_q { 0.0 } else { qty }
}

/// Pick the stuck position closest to even and price its bleed close off the
/// EMA band. Candidates whose bleed would not improve on their own close
/// grid are skipped.
pub fn calc_unstuck_close(
    candidates: &[UnstuckCandidate],
    balance: f64,
    pnl_cum: f64,
    pnl_peak: f64,
) -> Option<(String, PositionSide, GridOrder)> {
    let mut stuck: Vec<(&UnstuckCandidate, f64)> = candidates
        .iter()
        .filter(|c| {
            let we = calc_wallet_exposure(
                c.market.c_mult,
                balance,
                c.position.size,
                c.position.price,
                c.market.inverse,
            );
            c.position.is_open()
                && is_stuck(we, c.params.wallet_exposure_limit, c.params.unstuck_threshold)
        })
        .map(|c| {
            (
                c,
                calc_pprice_diff(c.pside, c.position.price, c.ticker.last),
            )
        })
        .collect();
    stuck.sort_by(|a, b| a.1.total_cmp(&b.1));

    for (candidate, _) in stuck {
        let allowance = loss_allowance(
            balance,
            candidate.params.unstuck_loss_allowance_pct,
            pnl_cum,
            pnl_peak,
        );
        match candidate.pside {
            PositionSide::Long => {
                let close_price = candidate.ticker.ask.max(round_up(
                    candidate.ema_band_upper * (1.0 + candidate.params.unstuck_ema_dist),
                    candidate.market.price_step,
                ));
                // only bleed if it undercuts the regular close grid
                match candidate.first_close_price {
                    Some(first) if close_price < first => {}
                    _ => continue,
                }
                let qty = bleed_qty(candidate, balance, close_price, allowance);
                if qty > 0.0 {
                    return Some((
                        candidate.symbol.clone(),
                        candidate.pside,
                        GridOrder {
                            qty: -qty,
                            price: close_price,
                            kind: OrderKind::CloseUnstuck,
                        },
                    ));
                }
            }
            PositionSide::Short => {
                let close_price = candidate.ticker.bid.min(round_dn(
                    candidate.ema_band_lower * (1.0 - candidate.params.unstuck_ema_dist),
                    candidate.market.price_step,
                ));
                if close_price <= 0.0 {
                    continue;
                }
                match candidate.first_close_price {
                    Some(first) if close_price > first => {}
                    _ => continue,
                }
                let qty = bleed_qty(candidate, balance, close_price, allowance);
                if qty > 0.0 {
                    return Some((
                        candidate.symbol.clone(),
                        candidate.pside,
                        GridOrder {
                            qty,
                            price: close_price,
                            kind: OrderKind::CloseUnstuck,
                        },
                    ));
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn market() -> Market {
        Market {
            symbol: "A/USDT:USDT".to_string(),
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

    fn candidate(symbol: &str, size: f64, pprice: f64, last: f64) -> UnstuckCandidate {
        let mut market = market();
        market.symbol = symbol.to_string();
        UnstuckCandidate {
            symbol: symbol.to_string(),
            pside: PositionSide::Long,
            market,
            ticker: Ticker {
                bid: last - 0.01,
                ask: last,
                last,
                ts: 0,
            },
            position: Position {
                size,
                price: pprice,
            },
            params: BotParams {
                wallet_exposure_limit: 1.0,
                unstuck_threshold: 0.5,
                unstuck_close_pct: 0.05,
                unstuck_ema_dist: 0.01,
                unstuck_loss_allowance_pct: 0.02,
                ..BotParams::default()
            },
            ema_band_lower: last * 0.99,
            ema_band_upper: last * 1.01,
            first_close_price: Some(pprice * 1.05),
        }
    }

    #[test]
    fn picks_candidate_closest_to_even() {
        // A: 2% under water, B: 1% under water; both over threshold
        let a = candidate("A/USDT:USDT", 12.0, 102.0, 100.0);
        let b = candidate("B/USDT:USDT", 14.0, 101.0, 100.0);
        let picked = calc_unstuck_close(&[a, b], 1000.0, 0.0, 0.0).unwrap();
        assert_eq!(picked.0, "B/USDT:USDT");
        assert_eq!(picked.1, PositionSide::Long);
        let order = picked.2;
        assert_eq!(order.kind, OrderKind::CloseUnstuck);
        assert!(order.qty < 0.0);
        // close price = max(ask, round_up(ema_upper * 1.01))
        let expected_price = 100.0f64.max(round_up(100.0 * 1.01 * 1.01, 0.01));
        assert!((order.price - expected_price).abs() < 1e-9);
    }

    #[test]
    fn not_stuck_below_threshold() {
        // exposure 0.1 of limit 1.0, threshold 0.5: healthy
        let c = candidate("A/USDT:USDT", 1.0, 100.0, 100.0);
        assert!(calc_unstuck_close(&[c], 1000.0, 0.0, 0.0).is_none());
    }

    #[test]
    fn exhausted_allowance_blocks_bleeding() {
        let mut c = candidate("A/USDT:USDT", 12.0, 120.0, 100.0);
        // deep under water: the bleed close realizes a loss
        c.ema_band_upper = 100.0;
        c.first_close_price = Some(126.0);
        // ledger already 100 quote below its peak with 2% allowance on ~1100
        let picked = calc_unstuck_close(&[c.clone()], 1000.0, -100.0, 0.0);
        assert!(picked.is_none());
        // with a fresh ledger the same candidate bleeds
        let picked = calc_unstuck_close(&[c], 1000.0, 0.0, 0.0);
        assert!(picked.is_some());
    }

    #[test]
    fn bleed_qty_bounded_by_close_pct() {
        let c = candidate("A/USDT:USDT", 12.0, 101.0, 100.0);
        let (_, _, order) = calc_unstuck_close(&[c], 1000.0, 0.0, 0.0).unwrap();
        // balance * WE limit * unstuck_close_pct / price = 1000*1*0.05/~102
        let max_qty = 1000.0 * 1.0 * 0.05 / order.price;
        assert!(order.qty.abs() <= max_qty + 0.001);
    }
}
