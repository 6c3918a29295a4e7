use tracing::info;

use crate::math::{calc_pnl, calc_pprice_diff, calc_wallet_exposure};
use crate::state::Shared;
use crate::types::{Position, PositionSide};

/// Round to `digits` significant figures for log output.
pub fn round_dynamic(x: f64, digits: i32) -> f64 {
    if x == 0.0 || !x.is_finite() {
        return x;
    }
    let shift = digits - 1 - x.abs().log10().floor() as i32;
    let scale = 10f64.powi(shift);
    (x * scale).round() / scale
}

/// One aligned line per changed position: old -> new, exposure, ratio to the
/// limit, distance from entry, unrealized pnl.
pub async fn log_position_changes(
    shared: &Shared,
    changes: &[(String, PositionSide, Position, Position)],
) {
    if changes.is_empty() {
        return;
    }
    let balance = *shared.balance.read().await;
    for (symbol, pside, old, new) in changes {
        let Some(state) = shared.get(symbol) else {
            continue;
        };
        let data = state.data.read().await;
        let we = calc_wallet_exposure(
            data.market.c_mult,
            balance,
            new.size,
            new.price,
            data.market.inverse,
        );
        let we_limit = data.params.get(*pside).wallet_exposure_limit;
        let we_ratio = if we_limit > 0.0 { we / we_limit } else { 0.0 };
        let (pprice_diff, upnl) = match data.ticker {
            Some(ticker) => (
                calc_pprice_diff(*pside, new.price, ticker.last),
                calc_pnl(
                    *pside,
                    new.price,
                    ticker.last,
                    new.size,
                    data.market.inverse,
                    data.market.c_mult,
                ),
            ),
            None => (0.0, 0.0),
        };
        info!(
            "{} {:<5} {} @ {} -> {} @ {}  WE: {}  WE ratio: {}  PA dist: {}  upnl: {}",
            symbol,
            pside.as_str(),
            round_dynamic(old.size, 6),
            round_dynamic(old.price, 6),
            round_dynamic(new.size, 6),
            round_dynamic(new.price, 6),
            round_dynamic(we, 4),
            round_dynamic(we_ratio, 3),
            round_dynamic(pprice_diff, 4),
            round_dynamic(upnl, 5),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_dynamic_keeps_significant_figures() {
        assert_eq!(round_dynamic(123.456789, 6), 123.457);
        assert_eq!(round_dynamic(0.000123456, 3), 0.000123);
        assert_eq!(round_dynamic(0.0, 4), 0.0);
        assert_eq!(round_dynamic(-98.7654, 4), -98.77);
    }
}
