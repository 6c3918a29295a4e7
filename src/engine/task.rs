//! Execution tick loop: once per wall-clock minute (or immediately after a
//! websocket fill), refresh whatever state has gone stale, recompute modes
//! and the ideal order set, diff against the venue and hand the batch to the
//! exec task. Single-symbol failures are isolated; only a sustained error
//! rate takes the engine down for the supervisor to restart.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::sync::mpsc;
use tokio::time::{Duration, sleep};
use tracing::{debug, error, info, warn};

use crate::config::{Settings, symbol_to_coin};
use crate::engine::{ideal, modes, reconcile};
use crate::exchange::{ExchangeClient, ExchangeError};
use crate::math::EmaTriple;
use crate::state::{Shared, pnl::PnlLedger};
use crate::types::{BOTH_SIDES, ExecCommand, Mode, utc_ms};

const FORCE_UPDATE_AGE_MS: i64 = 60_000;
const MAX_ERRORS_PER_HOUR: usize = 10;
const MINUTE_MS: i64 = 60_000;
/// Re-seed an EMA wholesale when it lags the series by more than this.
const EMA_RESEED_GAP_MS: i64 = 30 * 60_000;

pub async fn run_engine(
    settings: Settings,
    shared: Shared,
    client: Arc<dyn ExchangeClient>,
    exec_tx: mpsc::Sender<ExecCommand>,
) -> Result<()> {
    let delay_ms = (settings.live.execution_delay_seconds * 1000.0).max(3000.0) as i64;
    let mut prev_minute = utc_ms() / MINUTE_MS;
    let mut prev_exec = 0i64;
    let mut errors: Vec<i64> = Vec::new();
    let mut configured: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            _ = shared.notify.notified() => {}
            _ = sleep(Duration::from_millis(250)) => {}
        }
        let now = utc_ms();
        if now - prev_exec < delay_ms {
            continue;
        }
        let minute = now / MINUTE_MS;
        let due = minute != prev_minute || shared.take_recent_fill();
        if !due {
            continue;
        }
        prev_minute = minute;

        let res = run_once(&settings, &shared, &*client, &exec_tx, &mut configured).await;
        prev_exec = utc_ms();
        if let Err(e) = res {
            error!("tick failed: {e:#}");
            let cutoff = utc_ms() - 3_600_000;
            errors.retain(|t| *t > cutoff);
            errors.push(utc_ms());
            info!(
                count = errors.len(),
                max = MAX_ERRORS_PER_HOUR,
                "tick errors in the last hour"
            );
            if errors.len() >= MAX_ERRORS_PER_HOUR {
                bail!("too many tick errors per hour, aborting so the supervisor restarts");
            }
        }
    }
}

/// One full tick: refresh -> modes -> EMAs -> compose -> diff -> dispatch.
pub async fn run_once(
    settings: &Settings,
    shared: &Shared,
    client: &dyn ExchangeClient,
    exec_tx: &mpsc::Sender<ExecCommand>,
    configured: &mut HashSet<String>,
) -> Result<()> {
    let now = utc_ms();
    force_update(settings, shared, client, now).await?;
    modes::update_modes(shared, settings, now).await;
    update_emas(shared).await;
    configure_new_actives(settings, shared, client, configured).await;

    let ideal = ideal::calc_ideal_orders(shared, settings).await;

    let mut actual = Vec::new();
    let mut ctx: HashMap<String, reconcile::SymbolCtx> = HashMap::new();
    for entry in shared.symbols_vec() {
        let data = entry.data.read().await;
        actual.extend(data.open_orders.iter().cloned());
        if let Some(ticker) = data.ticker {
            ctx.insert(
                entry.symbol.clone(),
                reconcile::SymbolCtx {
                    qty_step: data.market.qty_step,
                    price_step: data.market.price_step,
                    last: ticker.last,
                    mode_long: data.params.long.mode,
                    mode_short: data.params.short.mode,
                },
            );
        }
    }

    let (cancels, creates) = reconcile::diff_orders(
        &ideal,
        &actual,
        &ctx,
        settings.live.max_n_cancellations_per_batch,
        settings.live.max_n_creations_per_batch,
    );
    if !cancels.is_empty() || !creates.is_empty() {
        debug!(
            n_cancel = cancels.len(),
            n_create = creates.len(),
            "dispatching reconciliation batch"
        );
        exec_tx
            .send(ExecCommand::Batch { cancels, creates })
            .await
            .context("exec task gone")?;
    }
    Ok(())
}

/// Refetch every data class older than `FORCE_UPDATE_AGE_MS`. A websocket
/// fill zeroes the positions/orders/pnls stamps, so those are refetched on
/// the very next tick regardless of age.
async fn force_update(
    settings: &Settings,
    shared: &Shared,
    client: &dyn ExchangeClient,
    now: i64,
) -> Result<()> {
    if shared.freshness.tickers.older_than(now, FORCE_UPDATE_AGE_MS) {
        let tickers = client.fetch_tickers().await.context("fetching tickers")?;
        for entry in shared.symbols_vec() {
            if let Some(ticker) = tickers.get(&entry.symbol) {
                entry.data.write().await.ticker = Some(*ticker);
            }
        }
        shared.freshness.tickers.mark(utc_ms());
    }

    if shared.freshness.positions.older_than(now, FORCE_UPDATE_AGE_MS) {
        let (positions, balance) = client
            .fetch_positions()
            .await
            .context("fetching positions")?;
        let changes = shared.apply_positions(&positions, balance).await;
        crate::report::log_position_changes(shared, &changes).await;
        shared.freshness.positions.mark(utc_ms());
    }

    if shared.freshness.open_orders.older_than(now, FORCE_UPDATE_AGE_MS) {
        let orders = client
            .fetch_open_orders()
            .await
            .context("fetching open orders")?;
        shared.apply_open_orders(&orders).await;
        shared.freshness.open_orders.mark(utc_ms());
    }

    if shared.freshness.pnls.older_than(now, FORCE_UPDATE_AGE_MS) {
        let age_limit = PnlLedger::age_limit(now, settings.live.pnls_max_lookback_days);
        let start = {
            let ledger = shared.pnls.read().await;
            ledger.last_timestamp().unwrap_or(age_limit)
        };
        let fills = client
            .fetch_pnl_fills(start, None)
            .await
            .context("fetching pnl fills")?;
        shared.pnls.write().await.merge(fills, age_limit);
        shared.freshness.pnls.mark(utc_ms());
    }

    if shared.freshness.hlcs_1m.older_than(now, FORCE_UPDATE_AGE_MS) {
        refresh_hlcs(shared, client).await;
        shared.freshness.hlcs_1m.mark(utc_ms());
    }
    Ok(())
}

/// 1m candles for every symbol the engine is actually working. Per-symbol
/// failures are logged and isolated; a delisted symbol is flagged inactive
/// and drops to tp_only on the next mode pass.
async fn refresh_hlcs(shared: &Shared, client: &dyn ExchangeClient) {
    for entry in shared.symbols_vec() {
        let since = {
            let data = entry.data.read().await;
            let working = BOTH_SIDES.iter().any(|&pside| {
                data.has_position(pside) || data.params.get(pside).mode == Mode::Normal
            });
            if !working {
                continue;
            }
            data.hlcs_1m.last_ts()
        };
        match client.fetch_ohlcvs(&entry.symbol, "1m", since).await {
            Ok(candles) => {
                let mut data = entry.data.write().await;
                for candle in &candles {
                    data.hlcs_1m.insert_candle(candle);
                }
            }
            Err(ExchangeError::BadSymbol(symbol)) => {
                warn!(symbol = %symbol, "symbol gone while fetching 1m candles");
                entry.data.write().await.market.active = false;
            }
            Err(e) => warn!(symbol = %entry.symbol, "1m candle refresh failed: {e}"),
        }
    }
}

/// Step each side's EMA triple forward over newly arrived minutes, or
/// re-seed it from the whole series when spans changed or it fell behind.
async fn update_emas(shared: &Shared) {
    for entry in shared.symbols_vec() {
        let mut data = entry.data.write().await;
        if data.hlcs_1m.is_empty() {
            continue;
        }
        let last_ts = data.hlcs_1m.last_ts().unwrap_or(0);
        for pside in BOTH_SIDES {
            let params = data.params.get(pside);
            let spans = (params.ema_span_0.max(1.0), params.ema_span_1.max(1.0));
            let ema = *data.emas.get(pside);
            let spans_changed =
                (ema.spans[0] - spans.0).abs() > 1e-9 || (ema.spans[1] - spans.1).abs() > 1e-9;
            if !ema.is_ready() || spans_changed || last_ts - ema.last_ts > EMA_RESEED_GAP_MS {
                let closes = data.hlcs_1m.closes_after(0);
                let mut fresh = EmaTriple::new(spans.0, spans.1);
                fresh.init(
                    &closes.iter().map(|(_, c)| *c).collect::<Vec<f64>>(),
                    last_ts,
                );
                *data.emas.get_mut(pside) = fresh;
            } else {
                let pending = data.hlcs_1m.closes_after(ema.last_ts);
                let ema = data.emas.get_mut(pside);
                for (ts, close) in pending {
                    ema.update(close, ts);
                }
            }
        }
    }
}

/// Hedge-mode venues want leverage and margin mode set per symbol before the
/// first order; do it once per newly selected symbol.
async fn configure_new_actives(
    settings: &Settings,
    shared: &Shared,
    client: &dyn ExchangeClient,
    configured: &mut HashSet<String>,
) {
    for entry in shared.symbols_vec() {
        if configured.contains(&entry.symbol) {
            continue;
        }
        let is_normal = {
            let data = entry.data.read().await;
            BOTH_SIDES
                .iter()
                .any(|&pside| data.params.get(pside).mode == Mode::Normal)
        };
        if !is_normal {
            continue;
        }
        let leverage = settings
            .flags_for(symbol_to_coin(&entry.symbol))
            .leverage
            .unwrap_or(settings.live.leverage);
        let mut ok = true;
        if let Err(e) = client.set_leverage(&entry.symbol, leverage).await {
            warn!(symbol = %entry.symbol, "set_leverage failed: {e}");
            ok = false;
        }
        if let Err(e) = client.set_margin_mode(&entry.symbol, "cross").await {
            warn!(symbol = %entry.symbol, "set_margin_mode failed: {e}");
            ok = false;
        }
        if ok {
            configured.insert(entry.symbol.clone());
        }
    }
}
