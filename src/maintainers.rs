//! maintainers.rs
//!
//! Control-plane refresh loops that run beside the execution tick:
//!
//! - market info: reloads contract metadata hourly, flags delisted symbols,
//!   and keeps the first-listing timestamp cache warm.
//! - candles: rotates through symbols refreshing the ranking candles used
//!   for noisiness/volume, one symbol per round after the initial sweep.
//!
//! A maintainer that fails logs and retries on its next round; it never
//! takes the tick loop down with it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::time::{Duration, sleep};
use tracing::{error, info};

use crate::config::Settings;
use crate::exchange::ExchangeClient;
use crate::state::Shared;
use crate::types::utc_ms;

const MARKET_REFRESH_MS: i64 = 1000 * 60 * 60;
const CANDLE_ROTATION_MS: u64 = 60_000;
/// Ranking candles kept per symbol.
const MAX_CANDLES: usize = 200;

pub fn first_ts_cache_path(cache_dir: &Path, exchange: &str) -> PathBuf {
    cache_dir.join(exchange).join("first_ohlcv_timestamps.json")
}

fn load_first_ts_cache(path: &Path) -> HashMap<String, i64> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}

fn dump_first_ts_cache(path: &Path, cache: &HashMap<String, i64>) {
    if let Some(dir) = path.parent() {
        let _ = std::fs::create_dir_all(dir);
    }
    match serde_json::to_string(cache) {
        Ok(raw) => {
            if let Err(e) = std::fs::write(path, raw) {
                error!(path = %path.display(), "error dumping first-listing cache: {e}");
            }
        }
        Err(e) => error!("error serializing first-listing cache: {e}"),
    }
}

/// Full market reload: upserts every listed symbol, resolves first-listing
/// timestamps through the disk cache, and marks symbols the venue no longer
/// lists as inactive (their positions fall back to tp_only via the mode
/// selector).
pub async fn refresh_markets(
    shared: &Shared,
    client: &dyn ExchangeClient,
    cache_dir: &Path,
) -> Result<()> {
    let markets = client
        .load_markets()
        .await
        .context("loading markets")?;

    let cache_path = first_ts_cache_path(cache_dir, client.name());
    let mut first_ts = load_first_ts_cache(&cache_path);
    let mut cache_dirty = false;
    for symbol in markets.keys() {
        if first_ts.contains_key(symbol) {
            continue;
        }
        match client.first_candle_ts(symbol).await {
            Ok(Some(ts)) => {
                first_ts.insert(symbol.clone(), ts);
                cache_dirty = true;
            }
            Ok(None) => {}
            Err(e) => error!(symbol = %symbol, "error fetching first candle ts: {e}"),
        }
    }
    if cache_dirty {
        dump_first_ts_cache(&cache_path, &first_ts);
    }

    for (symbol, mut market) in markets.clone() {
        if market.listed_ts.is_none() {
            market.listed_ts = first_ts.get(&symbol).copied();
        }
        shared.ensure_symbol(market).await;
    }

    for entry in shared.symbols_vec() {
        if !markets.contains_key(&entry.symbol) {
            let mut data = entry.data.write().await;
            if data.market.active {
                info!(symbol = %entry.symbol, "market disappeared, flagging inactive");
                data.market.active = false;
            }
        }
    }
    Ok(())
}

pub async fn run_market_info(
    shared: Shared,
    client: Arc<dyn ExchangeClient>,
    cache_dir: PathBuf,
) -> Result<()> {
    let mut last_refresh = utc_ms();
    loop {
        sleep(Duration::from_secs(60)).await;
        if utc_ms() - last_refresh < MARKET_REFRESH_MS {
            continue;
        }
        last_refresh = utc_ms();
        if let Err(e) = refresh_markets(&shared, &*client, &cache_dir).await {
            error!("market info refresh failed: {e:#}");
            sleep(Duration::from_secs(5)).await;
        }
    }
}

async fn refresh_candles_for(
    shared: &Shared,
    client: &dyn ExchangeClient,
    settings: &Settings,
    symbol: &str,
) -> Result<()> {
    let candles = client
        .fetch_ohlcvs(symbol, &settings.common.ohlcv_interval, None)
        .await
        .with_context(|| format!("fetching {} candles for {symbol}", settings.common.ohlcv_interval))?;
    let Some(state) = shared.get(symbol) else {
        return Ok(());
    };
    let mut data = state.data.write().await;
    data.candles = candles;
    if data.candles.len() > MAX_CANDLES {
        let drop = data.candles.len() - MAX_CANDLES;
        data.candles.drain(..drop);
    }
    data.candles_updated_ms = utc_ms();
    Ok(())
}

/// Initial sweep over every symbol, then one refresh per rotation so a full
/// pass over the universe takes roughly an hour at 60 symbols.
pub async fn run_candles(
    shared: Shared,
    client: Arc<dyn ExchangeClient>,
    settings: Settings,
) -> Result<()> {
    loop {
        let mut pending: Vec<(i64, String)> = Vec::new();
        for entry in shared.symbols_vec() {
            let data = entry.data.read().await;
            if data.market.active {
                pending.push((data.candles_updated_ms, entry.symbol.clone()));
            }
        }
        pending.sort();

        let never_fetched: Vec<String> = pending
            .iter()
            .filter(|(ts, _)| *ts == 0)
            .map(|(_, s)| s.clone())
            .collect();
        if !never_fetched.is_empty() {
            for symbol in never_fetched {
                if let Err(e) = refresh_candles_for(&shared, &*client, &settings, &symbol).await {
                    error!("candle refresh failed: {e:#}");
                }
                sleep(Duration::from_millis(100)).await;
            }
            continue;
        }

        if let Some((_, symbol)) = pending.first() {
            if let Err(e) = refresh_candles_for(&shared, &*client, &settings, symbol).await {
                error!("candle refresh failed: {e:#}");
            }
        }
        sleep(Duration::from_millis(CANDLE_ROTATION_MS)).await;
    }
}
