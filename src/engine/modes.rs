//! Symbol selection and per-side mode assignment.
//!
//! Every tick the selector recomputes which symbols should be traded
//! (forager ranking by noisiness), assigns each (symbol, side) a mode, splits
//! the side's wallet-exposure budget across its active symbols, and
//! refreshes the trailing extremes used by the grid math.

use std::collections::{HashMap, HashSet};

use tracing::{info, warn};

use crate::config::{Settings, symbol_to_coin};
use crate::math::round_to;
use crate::state::Shared;
use crate::types::{BOTH_SIDES, Mode, PositionSide, Ticker};

const DAY_MS: f64 = 1000.0 * 60.0 * 60.0 * 24.0;

struct SymView {
    symbol: String,
    active_market: bool,
    quote: String,
    listed_ts: Option<i64>,
    ticker: Option<Ticker>,
    min_qty: f64,
    min_cost: f64,
    c_mult: f64,
    has_pos: [bool; 2],
    has_orders: [bool; 2],
    noisiness: f64,
    volume: f64,
}

fn side_idx(pside: PositionSide) -> usize {
    match pside {
        PositionSide::Long => 0,
        PositionSide::Short => 1,
    }
}

/// Mean of (high-low)/close over the rolling candle window: the forager's
/// desirability metric.
fn calc_noisiness(candles: &[crate::types::Candle], window: usize) -> f64 {
    let tail = &candles[candles.len().saturating_sub(window)..];
    if tail.is_empty() {
        return 0.0;
    }
    let sum: f64 = tail
        .iter()
        .filter(|c| c.close > 0.0)
        .map(|c| (c.high - c.low) / c.close)
        .sum();
    sum / tail.len() as f64
}

fn calc_volume(candles: &[crate::types::Candle], window: usize) -> f64 {
    let tail = &candles[candles.len().saturating_sub(window)..];
    tail.iter().map(|c| c.close * c.volume).sum()
}

/// Recompute modes, exposure limits and trailing extremes for every symbol.
/// Returns the symbols carrying at least one non-manual mode assignment.
pub async fn update_modes(shared: &Shared, settings: &Settings, now_ms: i64) -> Vec<String> {
    let balance = *shared.balance.read().await;
    let window = settings.common.noisiness_rolling_mean_window_size;

    // short per-symbol read sections, no global lock
    let mut views: Vec<SymView> = Vec::new();
    for entry in shared.symbols_vec() {
        let data = entry.data.read().await;
        let mut has_pos = [false; 2];
        let mut has_orders = [false; 2];
        for pside in BOTH_SIDES {
            has_pos[side_idx(pside)] = data.has_position(pside);
            has_orders[side_idx(pside)] = data
                .open_orders
                .iter()
                .any(|o| o.position_side == pside);
        }
        views.push(SymView {
            symbol: entry.symbol.clone(),
            active_market: data.market.active,
            quote: data.market.quote.clone(),
            listed_ts: data.market.listed_ts,
            ticker: data.ticker,
            min_qty: data.market.min_qty,
            min_cost: data.market.min_cost,
            c_mult: data.market.c_mult,
            has_pos,
            has_orders,
            noisiness: calc_noisiness(&data.candles, window),
            volume: calc_volume(&data.candles, window),
        });
    }

    let approved: HashSet<String> = settings
        .live
        .approved_coins
        .iter()
        .map(|c| crate::config::coin_to_symbol(c, "USDT"))
        .collect();
    let ignored: HashSet<String> = settings
        .live
        .ignored_coins
        .iter()
        .map(|c| crate::config::coin_to_symbol(c, "USDT"))
        .collect();

    let old_enough = |v: &SymView| match v.listed_ts {
        Some(ts) => {
            (now_ms - ts) as f64 >= settings.common.minimum_coin_age_days * DAY_MS
        }
        None => false,
    };

    let eligible: HashSet<String> = views
        .iter()
        .filter(|v| v.active_market && v.quote == "USDT")
        .filter(|v| approved.is_empty() || approved.contains(&v.symbol))
        .filter(|v| !ignored.contains(&v.symbol))
        .filter(|v| old_enough(v))
        .map(|v| v.symbol.clone())
        .collect();

    // forager mode: more approved symbols than slots (or open-ended list)
    let n_slots_max = settings
        .bot
        .long
        .n_positions
        .max(settings.bot.short.n_positions);
    let forager_mode = approved.is_empty() || n_slots_max < approved.len();

    // drop the bottom fraction by rolling volume
    let mut ranked: Vec<&SymView> = views.iter().filter(|v| eligible.contains(&v.symbol)).collect();
    if settings.common.relative_volume_filter_clip_pct > 0.0 && !ranked.is_empty() {
        ranked.sort_by(|a, b| a.volume.total_cmp(&b.volume));
        let clip =
            (ranked.len() as f64 * settings.common.relative_volume_filter_clip_pct).round() as usize;
        ranked = ranked.split_off(clip.min(ranked.len()));
    }
    // most desirable first
    ranked.sort_by(|a, b| b.noisiness.total_cmp(&a.noisiness));

    let mut modes: [HashMap<String, Mode>; 2] = [HashMap::new(), HashMap::new()];
    let mut active_symbols: HashSet<String> = HashSet::new();

    for pside in BOTH_SIDES {
        let idx = side_idx(pside);
        let base = match pside {
            PositionSide::Long => &settings.bot.long,
            PositionSide::Short => &settings.bot.short,
        };
        let forced_global = match pside {
            PositionSide::Long => settings.live.forced_mode_long,
            PositionSide::Short => settings.live.forced_mode_short,
        };
        let side_enabled = base.side_enabled();

        let forced_for = |symbol: &str| -> Option<Mode> {
            let flags = settings.flags_for(symbol_to_coin(symbol));
            let flag_mode = match pside {
                PositionSide::Long => flags.mode_long,
                PositionSide::Short => flags.mode_short,
            };
            flag_mode.or(forced_global)
        };

        let effective_min_cost_ok = |v: &SymView| -> bool {
            if !settings.live.filter_by_min_effective_cost || base.n_positions == 0 {
                return true;
            }
            let Some(ticker) = v.ticker else { return false };
            let eff = v.min_cost.max(v.min_qty * ticker.last * v.c_mult);
            let we_per = base.total_wallet_exposure_limit / base.n_positions as f64;
            balance * we_per * base.entry_initial_qty_pct >= eff
        };

        let actual_actives: HashSet<String> = views
            .iter()
            .filter(|v| v.has_pos[idx] || v.has_orders[idx])
            .map(|v| v.symbol.clone())
            .collect();

        // forced modes claim their symbols first and never compete for slots
        let mut forced_set: HashSet<String> = HashSet::new();
        for v in &views {
            if let Some(mode) = forced_for(&v.symbol) {
                forced_set.insert(v.symbol.clone());
                if mode == Mode::Normal || actual_actives.contains(&v.symbol) {
                    modes[idx].insert(v.symbol.clone(), mode);
                }
            }
        }

        if side_enabled {
            let ideal: Vec<String> = if forager_mode {
                ranked
                    .iter()
                    .filter(|v| effective_min_cost_ok(v))
                    .take(base.n_positions)
                    .map(|v| v.symbol.clone())
                    .collect()
            } else {
                views
                    .iter()
                    .filter(|v| eligible.contains(&v.symbol))
                    .filter(|v| effective_min_cost_ok(v))
                    .map(|v| v.symbol.clone())
                    .collect()
            };
            let ideal_set: HashSet<&String> = ideal.iter().collect();

            // symbols already carrying risk reserve their slots first
            for symbol in &actual_actives {
                if modes[idx].contains_key(symbol) || forced_set.contains(symbol) {
                    continue;
                }
                let mode = if ideal_set.contains(symbol) {
                    Mode::Normal
                } else if settings.live.auto_gs {
                    Mode::GracefulStop
                } else {
                    Mode::Manual
                };
                modes[idx].insert(symbol.clone(), mode);
            }
            // then the ranking fills what remains
            for symbol in &ideal {
                if modes[idx].contains_key(symbol) || forced_set.contains(symbol) {
                    continue;
                }
                let slots_filled = modes[idx]
                    .values()
                    .filter(|m| matches!(m, Mode::Normal | Mode::GracefulStop))
                    .count();
                if forager_mode && slots_filled >= base.n_positions {
                    break;
                }
                modes[idx].insert(symbol.clone(), Mode::Normal);
            }
        } else {
            for symbol in &actual_actives {
                if modes[idx].contains_key(symbol) {
                    continue;
                }
                let mode = if settings.live.auto_gs {
                    Mode::GracefulStop
                } else {
                    Mode::Manual
                };
                modes[idx].insert(symbol.clone(), mode);
            }
        }

        // positions stranded on dead markets only keep their take-profits
        for v in &views {
            if v.has_pos[idx] && (!v.active_market || !eligible.contains(&v.symbol)) {
                let entry = modes[idx].entry(v.symbol.clone()).or_insert(Mode::TpOnly);
                if !v.active_market {
                    *entry = Mode::TpOnly;
                }
            }
        }

        active_symbols.extend(modes[idx].keys().cloned());
    }

    // split each side's budget equally across its active set
    let mut we_limits: [HashMap<String, f64>; 2] = [HashMap::new(), HashMap::new()];
    for pside in BOTH_SIDES {
        let idx = side_idx(pside);
        let base = match pside {
            PositionSide::Long => &settings.bot.long,
            PositionSide::Short => &settings.bot.short,
        };
        let in_play: Vec<&String> = modes[idx]
            .iter()
            .filter(|(_, m)| matches!(m, Mode::Normal | Mode::GracefulStop | Mode::TpOnly))
            .map(|(s, _)| s)
            .collect();
        let n_active = in_play
            .len()
            .max(modes[idx].values().filter(|m| **m == Mode::Normal).count())
            .max(1);
        let per = round_to(base.total_wallet_exposure_limit / n_active as f64, 0.0001);
        for symbol in modes[idx].keys() {
            let flags = settings.flags_for(symbol_to_coin(symbol));
            let pinned = match pside {
                PositionSide::Long => flags.we_limit_long,
                PositionSide::Short => flags.we_limit_short,
            };
            we_limits[idx].insert(symbol.clone(), pinned.unwrap_or(per));
        }
    }

    // write back resolved params, log changes, refresh trailing extremes
    let pnls = shared.pnls.read().await;
    for entry in shared.symbols_vec() {
        let mut data = entry.data.write().await;
        for pside in BOTH_SIDES {
            let idx = side_idx(pside);
            let base = match pside {
                PositionSide::Long => &settings.bot.long,
                PositionSide::Short => &settings.bot.short,
            };
            let forced_global = match pside {
                PositionSide::Long => settings.live.forced_mode_long,
                PositionSide::Short => settings.live.forced_mode_short,
            };
            let flags = settings.flags_for(symbol_to_coin(&entry.symbol));
            let flag_mode = match pside {
                PositionSide::Long => flags.mode_long,
                PositionSide::Short => flags.mode_short,
            };
            let fallback = flag_mode.or(forced_global).unwrap_or(if settings.live.auto_gs {
                Mode::GracefulStop
            } else {
                Mode::Manual
            });
            let mode = modes[idx].get(&entry.symbol).copied().unwrap_or(fallback);
            let old_mode = data.params.get(pside).mode;
            let mut params = base.clone();
            params.mode = mode;
            params.enabled = mode == Mode::Normal;
            params.wallet_exposure_limit = we_limits[idx]
                .get(&entry.symbol)
                .copied()
                .unwrap_or(0.0);
            if old_mode != mode {
                info!(
                    symbol = %entry.symbol,
                    position_side = pside.as_str(),
                    from = old_mode.as_str(),
                    to = mode.as_str(),
                    "mode change"
                );
            }
            *data.params.get_mut(pside) = params;

            if data.has_position(pside) && data.is_trailing(pside) {
                if data.hlcs_1m.is_empty() {
                    warn!(symbol = %entry.symbol, "no 1m data for trailing update");
                } else {
                    let since = pnls.last_position_change(&entry.symbol, pside, now_ms);
                    *data.trailing.get_mut(pside) = data.hlcs_1m.trailing_extremes(since);
                }
            }
        }
    }

    let mut out: Vec<String> = active_symbols.into_iter().collect();
    out.sort();
    out
}
