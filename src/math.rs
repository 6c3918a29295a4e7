//! Numeric primitives shared by grid math, the composer and the reconciler.
//!
//! All prices and quantities live on exchange-defined steps (usually powers of
//! ten). Rounding goes through a 10-decimal safety rounding of the quotient so
//! binary float error cannot push a value off its step.

use crate::types::PositionSide;

const SAFETY_DECIMALS: f64 = 1e10;

fn safety_round(x: f64) -> f64 {
    (x * SAFETY_DECIMALS).round() / SAFETY_DECIMALS
}

pub fn round_to(n: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return n;
    }
    safety_round((n / step).round() * step)
}

pub fn round_up(n: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return n;
    }
    safety_round((safety_round(n / step)).ceil() * step)
}

pub fn round_dn(n: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return n;
    }
    safety_round((safety_round(n / step)).floor() * step)
}

/// Relative distance of x from y.
pub fn calc_diff(x: f64, y: f64) -> f64 {
    (x - y).abs() / y.abs()
}

/// Notional cost of a quantity at a price.
pub fn qty_to_cost(qty: f64, price: f64, c_mult: f64, inverse: bool) -> f64 {
    if inverse {
        if price == 0.0 {
            0.0
        } else {
            qty.abs() * c_mult / price
        }
    } else {
        qty.abs() * c_mult * price
    }
}

/// Inverse of [`qty_to_cost`] at a given price.
pub fn cost_to_qty(cost: f64, price: f64, c_mult: f64, inverse: bool) -> f64 {
    if inverse {
        cost * price / c_mult
    } else if price == 0.0 {
        0.0
    } else {
        cost / (price * c_mult)
    }
}

/// Smallest quantity the venue accepts at this price: min_qty, or min_cost
/// worth of contracts rounded up to the qty step, whichever is larger.
pub fn min_entry_qty(
    price: f64,
    inverse: bool,
    c_mult: f64,
    qty_step: f64,
    min_qty: f64,
    min_cost: f64,
) -> f64 {
    min_qty.max(round_up(cost_to_qty(min_cost, price, c_mult, inverse), qty_step))
}

pub fn calc_wallet_exposure(
    c_mult: f64,
    balance: f64,
    size: f64,
    price: f64,
    inverse: bool,
) -> f64 {
    if balance <= 0.0 || size == 0.0 {
        return 0.0;
    }
    qty_to_cost(size, price, c_mult, inverse) / balance
}

/// Standard perp pnl for a (partial) close of `size` from `entry` to `close`.
pub fn calc_pnl(
    pside: PositionSide,
    entry: f64,
    close: f64,
    size: f64,
    inverse: bool,
    c_mult: f64,
) -> f64 {
    if entry == 0.0 || close == 0.0 {
        return 0.0;
    }
    match pside {
        PositionSide::Long => {
            if inverse {
                size.abs() * c_mult * (1.0 / entry - 1.0 / close)
            } else {
                size.abs() * c_mult * (close - entry)
            }
        }
        PositionSide::Short => {
            if inverse {
                size.abs() * c_mult * (1.0 / close - 1.0 / entry)
            } else {
                size.abs() * c_mult * (entry - close)
            }
        }
    }
}

/// Signed distance of last price from entry price; positive means the
/// position is under water.
pub fn calc_pprice_diff(pside: PositionSide, pprice: f64, last: f64) -> f64 {
    if pprice == 0.0 {
        return 0.0;
    }
    match pside {
        PositionSide::Long => 1.0 - last / pprice,
        PositionSide::Short => last / pprice - 1.0,
    }
}

/// Average-in a fill: returns the hypothetical (size, price) after adding
/// `qty` at `price` to (`psize`, `pprice`). Sizes are signed.
pub fn calc_new_psize_pprice(
    psize: f64,
    pprice: f64,
    qty: f64,
    price: f64,
    qty_step: f64,
) -> (f64, f64) {
    if qty == 0.0 {
        return (psize, pprice);
    }
    if psize == 0.0 {
        return (qty, price);
    }
    let new_psize = round_to(psize + qty, qty_step);
    if new_psize == 0.0 {
        return (0.0, 0.0);
    }
    (
        new_psize,
        safety_round(pprice * (psize / new_psize) + price * (qty / new_psize)),
    )
}

pub fn ema_alpha(span: f64) -> f64 {
    2.0 / (span + 1.0)
}

/// Three EMAs of 1m closes with spans (s0, s1, sqrt(s0*s1)). The band used by
/// initial entries and unstuck closes is the min/max of the three.
#[derive(Debug, Clone, Copy)]
pub struct EmaTriple {
    pub spans: [f64; 3],
    pub values: [f64; 3],
    /// Minute-start ms of the last close folded in.
    pub last_ts: i64,
}

impl EmaTriple {
    pub fn new(span_0: f64, span_1: f64) -> Self {
        let spans = [
            span_0.max(1.0),
            span_1.max(1.0),
            (span_0 * span_1).sqrt().max(1.0),
        ];
        Self {
            spans,
            values: [0.0; 3],
            last_ts: 0,
        }
    }

    /// Seed from a run of historical 1m closes ending at `last_ts`.
    pub fn init(&mut self, closes: &[f64], last_ts: i64) {
        if closes.is_empty() {
            return;
        }
        self.values = [closes[0]; 3];
        for &close in &closes[1..] {
            for i in 0..3 {
                let a = ema_alpha(self.spans[i]);
                self.values[i] = self.values[i] * (1.0 - a) + close * a;
            }
        }
        self.last_ts = last_ts;
    }

    /// Fold in one new minute close. Ignores stale minutes.
    pub fn update(&mut self, close: f64, ts: i64) {
        if ts <= self.last_ts {
            return;
        }
        if self.last_ts == 0 {
            self.values = [close; 3];
        } else {
            for i in 0..3 {
                let a = ema_alpha(self.spans[i]);
                self.values[i] = self.values[i] * (1.0 - a) + close * a;
            }
        }
        self.last_ts = ts;
    }

    pub fn band_lower(&self) -> f64 {
        self.values[0].min(self.values[1]).min(self.values[2])
    }

    pub fn band_upper(&self) -> f64 {
        self.values[0].max(self.values[1]).max(self.values[2])
    }

    pub fn is_ready(&self) -> bool {
        self.last_ts != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::quickcheck;

    fn on_step(x: f64, step: f64) -> bool {
        let q = x / step;
        (q - q.round()).abs() < 1e-6
    }

    quickcheck! {
        fn rounding_stays_on_step(n: f64, exp: u8) -> quickcheck::TestResult {
            if !n.is_finite() || n.abs() > 1e6 {
                return quickcheck::TestResult::discard();
            }
            let step = 10f64.powi(-((exp % 6) as i32));
            let tol = step * 1e-6 + 1e-9;
            let r = round_to(n, step);
            let up = round_up(n, step);
            let dn = round_dn(n, step);
            quickcheck::TestResult::from_bool(
                on_step(r, step)
                    && on_step(up, step)
                    && on_step(dn, step)
                    && (r - n).abs() <= step
                    && dn <= n + tol
                    && up >= n - tol,
            )
        }

        fn min_entry_qty_is_feasible(price_cents: u32) -> quickcheck::TestResult {
            if price_cents == 0 || price_cents > 10_000_000 {
                return quickcheck::TestResult::discard();
            }
            let price = price_cents as f64 / 100.0;
            let q = min_entry_qty(price, false, 1.0, 0.001, 0.001, 5.0);
            quickcheck::TestResult::from_bool(
                q >= 0.001 && q * price >= 5.0 * (1.0 - 1e-9) && on_step(q, 0.001),
            )
        }
    }

    #[test]
    fn round_examples() {
        assert_eq!(round_dn(98.505, 0.01), 98.5);
        assert_eq!(round_up(100.2001, 0.01), 100.21);
        assert_eq!(round_to(0.5070001, 0.001), 0.507);
        // 0.1 + 0.2 style float error must not move the result off-step
        assert_eq!(round_dn(0.30000000000000004, 0.1), 0.3);
    }

    #[test]
    fn cost_qty_roundtrip() {
        let cost = qty_to_cost(0.507, 98.5, 1.0, false);
        let qty = cost_to_qty(cost, 98.5, 1.0, false);
        assert!((qty - 0.507).abs() < 1e-12);

        let cost_inv = qty_to_cost(100.0, 25_000.0, 1.0, true);
        assert!((cost_inv - 0.004).abs() < 1e-12);
    }

    #[test]
    fn pnl_signs() {
        assert!(calc_pnl(PositionSide::Long, 100.0, 110.0, 1.0, false, 1.0) > 0.0);
        assert!(calc_pnl(PositionSide::Long, 100.0, 90.0, 1.0, false, 1.0) < 0.0);
        assert!(calc_pnl(PositionSide::Short, 100.0, 90.0, -1.0, false, 1.0) > 0.0);
        // inverse long profits when price rises
        assert!(calc_pnl(PositionSide::Long, 100.0, 110.0, 1.0, true, 1.0) > 0.0);
    }

    #[test]
    fn new_psize_pprice_averages() {
        let (size, price) = calc_new_psize_pprice(1.0, 100.0, 1.0, 110.0, 0.001);
        assert_eq!(size, 2.0);
        assert!((price - 105.0).abs() < 1e-9);
    }

    #[test]
    fn ema_constant_input_converges() {
        let mut ema = EmaTriple::new(12.0, 96.0);
        let mut ts = 60_000;
        for _ in 0..10_000 {
            ema.update(42.0, ts);
            ts += 60_000;
        }
        for v in ema.values {
            assert!((v - 42.0).abs() < 1e-9);
        }
    }

    #[test]
    fn ema_span_one_tracks_last_input() {
        let mut ema = EmaTriple::new(1.0, 1.0);
        ema.update(10.0, 60_000);
        ema.update(20.0, 120_000);
        for v in ema.values {
            assert_eq!(v, 20.0);
        }
    }
}
