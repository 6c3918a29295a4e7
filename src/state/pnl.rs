//! Realized-pnl ledger: incremental fetch merge, id dedup, lookback pruning,
//! and the json disk cache at `caches/<exchange>/<user>_pnls.json`.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::types::{PnlFill, PositionSide};

const DAY_MS: i64 = 1000 * 60 * 60 * 24;

#[derive(Debug, Default)]
pub struct PnlLedger {
    fills: Vec<PnlFill>,
    cache_path: Option<PathBuf>,
}

impl PnlLedger {
    pub fn new(cache_path: PathBuf) -> Self {
        Self {
            fills: Vec::new(),
            cache_path: Some(cache_path),
        }
    }

    pub fn fills(&self) -> &[PnlFill] {
        &self.fills
    }

    pub fn is_empty(&self) -> bool {
        self.fills.is_empty()
    }

    pub fn last_timestamp(&self) -> Option<i64> {
        self.fills.last().map(|f| f.timestamp)
    }

    pub fn age_limit(now_ms: i64, lookback_days: f64) -> i64 {
        now_ms - (lookback_days * DAY_MS as f64) as i64
    }

    /// Load cached fills, dropping anything past the lookback window.
    pub fn load_cache(&mut self, age_limit: i64) {
        let Some(path) = self.cache_path.clone() else {
            return;
        };
        if !path.exists() {
            return;
        }
        match read_fills(&path) {
            Ok(fills) => {
                let n = fills.len();
                self.fills = fills
                    .into_iter()
                    .filter(|f| f.timestamp > age_limit)
                    .collect();
                self.fills.sort_by_key(|f| f.timestamp);
                info!(
                    loaded = n,
                    kept = self.fills.len(),
                    path = %path.display(),
                    "loaded pnl cache"
                );
            }
            Err(e) => error!(path = %path.display(), "error loading pnl cache: {e:#}"),
        }
    }

    /// Merge newly fetched fills; returns how many were actually new. Dumps
    /// the cache when anything changed.
    pub fn merge(&mut self, fetched: Vec<PnlFill>, age_limit: i64) -> usize {
        let seen: HashSet<String> = self.fills.iter().map(|f| f.id.clone()).collect();
        let new_fills: Vec<PnlFill> = fetched
            .into_iter()
            .filter(|f| !seen.contains(&f.id))
            .collect();
        let n_new = new_fills.len();
        if n_new > 0 {
            let income: f64 = new_fills.iter().map(|f| f.pnl).sum();
            info!(n = n_new, income, "new pnl fills");
            self.fills.extend(new_fills);
        }
        let before = self.fills.len();
        self.fills.retain(|f| f.timestamp > age_limit);
        self.fills.sort_by_key(|f| f.timestamp);
        if n_new > 0 || self.fills.len() != before {
            self.dump();
        }
        n_new
    }

    fn dump(&self) {
        let Some(path) = &self.cache_path else {
            return;
        };
        if let Err(e) = write_fills(path, &self.fills) {
            error!(path = %path.display(), "error dumping pnl cache: {e:#}");
        }
    }

    /// Cumulative pnl over the window and the running peak of the cumulative
    /// series; the pair feeds the unstuck loss allowance.
    pub fn cum_and_peak(&self) -> (f64, f64) {
        let mut cum = 0.0;
        let mut peak = 0.0f64;
        for f in &self.fills {
            cum += f.pnl;
            peak = peak.max(cum);
        }
        (cum, peak)
    }

    /// Timestamp of the most recent fill on (symbol, side): the position's
    /// last change, from which trailing extremes are measured. Falls back to
    /// seven days ago when the window holds no fill for the pair.
    pub fn last_position_change(
        &self,
        symbol: &str,
        pside: PositionSide,
        now_ms: i64,
    ) -> i64 {
        self.fills
            .iter()
            .rev()
            .find(|f| f.symbol == symbol && f.position_side == pside)
            .map(|f| f.timestamp)
            .unwrap_or(now_ms - 7 * DAY_MS)
    }
}

fn read_fills(path: &Path) -> Result<Vec<PnlFill>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn write_fills(path: &Path, fills: &[PnlFill]) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::write(path, serde_json::to_string(fills)?)?;
    Ok(())
}
