//! Per-symbol 1-minute high/low/close series. Fed from REST candle refreshes
//! and from websocket ticker mids between refreshes; drives trailing
//! extremes and the minute EMAs.

use std::collections::BTreeMap;

use crate::types::{Candle, Hlc, TrailingExtremes};

/// Seven days of minutes.
const RETENTION_MINUTES: i64 = 10_080;
const MINUTE_MS: i64 = 60_000;

#[derive(Debug, Default, Clone)]
pub struct HlcSeries {
    by_minute: BTreeMap<i64, Hlc>,
}

impl HlcSeries {
    pub fn len(&self) -> usize {
        self.by_minute.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_minute.is_empty()
    }

    pub fn last_ts(&self) -> Option<i64> {
        self.by_minute.keys().next_back().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Hlc> {
        self.by_minute.values()
    }

    /// Merge a REST 1m candle. REST data wins over ws-built minutes.
    pub fn insert_candle(&mut self, candle: &Candle) {
        let ts = candle.ts - candle.ts.rem_euclid(MINUTE_MS);
        self.by_minute.insert(
            ts,
            Hlc {
                ts,
                high: candle.high,
                low: candle.low,
                close: candle.close,
            },
        );
        self.prune();
    }

    /// Fold a websocket price observation into the current minute.
    pub fn note_price(&mut self, price: f64, ts: i64) {
        if price <= 0.0 {
            return;
        }
        let minute = ts - ts.rem_euclid(MINUTE_MS);
        self.by_minute
            .entry(minute)
            .and_modify(|hlc| {
                hlc.high = hlc.high.max(price);
                hlc.low = hlc.low.min(price);
                hlc.close = price;
            })
            .or_insert(Hlc {
                ts: minute,
                high: price,
                low: price,
                close: price,
            });
        self.prune();
    }

    fn prune(&mut self) {
        if let Some(&newest) = self.by_minute.keys().next_back() {
            let cutoff = newest - RETENTION_MINUTES * MINUTE_MS;
            self.by_minute.retain(|&ts, _| ts >= cutoff);
        }
    }

    /// Running extremes over every minute strictly after `since_ts`.
    ///
    /// The high of a new maximum minute seeds min_since_max with that
    /// minute's close (and mirrored for minima), matching how the extremes
    /// are re-derived after each position change.
    pub fn trailing_extremes(&self, since_ts: i64) -> TrailingExtremes {
        let mut tr = TrailingExtremes::default();
        for (&ts, hlc) in self.by_minute.range((since_ts + 1)..) {
            debug_assert!(ts > since_ts);
            if hlc.high > tr.max_since_open {
                tr.max_since_open = hlc.high;
                tr.min_since_max = hlc.close;
            } else {
                tr.min_since_max = tr.min_since_max.min(hlc.low);
            }
            if hlc.low < tr.min_since_open {
                tr.min_since_open = hlc.low;
                tr.max_since_min = hlc.close;
            } else {
                tr.max_since_min = tr.max_since_min.max(hlc.high);
            }
        }
        tr
    }

    /// Closes of minutes strictly after `since_ts`, oldest first.
    pub fn closes_after(&self, since_ts: i64) -> Vec<(i64, f64)> {
        self.by_minute
            .range((since_ts + 1)..)
            .map(|(&ts, hlc)| (ts, hlc.close))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(points: &[(i64, f64, f64, f64)]) -> HlcSeries {
        let mut s = HlcSeries::default();
        for &(min, high, low, close) in points {
            s.insert_candle(&Candle {
                ts: min * MINUTE_MS,
                open: close,
                high,
                low,
                close,
                volume: 1.0,
            });
        }
        s
    }

    #[test]
    fn note_price_builds_minutes() {
        let mut s = HlcSeries::default();
        s.note_price(100.0, 30_000);
        s.note_price(101.0, 40_000);
        s.note_price(99.0, 59_000);
        s.note_price(100.5, 61_000);
        assert_eq!(s.len(), 2);
        let first = s.iter().next().unwrap();
        assert_eq!(first.high, 101.0);
        assert_eq!(first.low, 99.0);
        assert_eq!(first.close, 99.0);
    }

    #[test]
    fn trailing_extremes_track_new_highs_and_lows() {
        let s = series(&[
            (1, 100.0, 99.0, 99.5),
            (2, 103.0, 99.5, 102.0), // new high: min_since_max seeds at close
            (3, 102.5, 101.0, 101.5),
            (4, 101.8, 98.0, 98.5), // new low
            (5, 100.0, 98.5, 99.8),
        ]);
        let tr = s.trailing_extremes(0);
        assert_eq!(tr.max_since_open, 103.0);
        assert_eq!(tr.min_since_max, 98.0);
        assert_eq!(tr.min_since_open, 98.0);
        assert_eq!(tr.max_since_min, 100.0);
    }

    #[test]
    fn extremes_ignore_minutes_before_position_change() {
        let s = series(&[(1, 200.0, 10.0, 100.0), (10, 101.0, 99.0, 100.0)]);
        let tr = s.trailing_extremes(9 * MINUTE_MS);
        assert_eq!(tr.max_since_open, 101.0);
        assert_eq!(tr.min_since_open, 99.0);
    }

    #[test]
    fn empty_range_keeps_sentinels() {
        let s = series(&[(1, 101.0, 99.0, 100.0)]);
        let tr = s.trailing_extremes(i64::MAX - 1);
        assert_eq!(tr, TrailingExtremes::default());
    }

    #[test]
    fn retention_prunes_old_minutes() {
        let mut s = HlcSeries::default();
        s.insert_candle(&Candle {
            ts: 0,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 0.0,
        });
        s.insert_candle(&Candle {
            ts: (RETENTION_MINUTES + 10) * MINUTE_MS,
            open: 2.0,
            high: 2.0,
            low: 2.0,
            close: 2.0,
            volume: 0.0,
        });
        assert_eq!(s.len(), 1);
    }
}
