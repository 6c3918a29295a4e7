//! Config document, CLI overrides and credentials.
//!
//! The config file is one nested json document with `live`, `common` and
//! `bot.long` / `bot.short` sections. Unknown keys are a hard error; anything
//! venue- or user-specific that does not fit the schema goes under `extra`.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::types::Mode;

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "n" | "normal" => Ok(Mode::Normal),
            "gs" | "graceful_stop" => Ok(Mode::GracefulStop),
            "t" | "tp_only" => Ok(Mode::TpOnly),
            "p" | "panic" => Ok(Mode::Panic),
            "m" | "manual" => Ok(Mode::Manual),
            other => Err(format!("unknown mode {other:?}")),
        }
    }
}

/// Strategy parameters for one position side. The mode selector clones the
/// side's base params per symbol and fills in `wallet_exposure_limit`,
/// `mode` and `enabled` each tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BotParams {
    pub close_grid_markup_range: f64,
    pub close_grid_min_markup: f64,
    pub close_grid_qty_pct: f64,
    pub close_trailing_grid_ratio: f64,
    pub close_trailing_retracement_pct: f64,
    pub close_trailing_threshold_pct: f64,
    pub ema_span_0: f64,
    pub ema_span_1: f64,
    pub entry_grid_double_down_factor: f64,
    pub entry_grid_spacing_pct: f64,
    pub entry_grid_spacing_weight: f64,
    pub entry_initial_ema_dist: f64,
    pub entry_initial_qty_pct: f64,
    pub entry_trailing_grid_ratio: f64,
    pub entry_trailing_retracement_pct: f64,
    pub entry_trailing_threshold_pct: f64,
    pub n_positions: usize,
    pub total_wallet_exposure_limit: f64,
    pub unstuck_close_pct: f64,
    pub unstuck_ema_dist: f64,
    pub unstuck_loss_allowance_pct: f64,
    pub unstuck_threshold: f64,
    // resolved per symbol at runtime; normally absent from the document
    pub wallet_exposure_limit: f64,
    pub mode: Mode,
    pub enabled: bool,
}

impl Default for BotParams {
    fn default() -> Self {
        Self {
            close_grid_markup_range: 0.03,
            close_grid_min_markup: 0.005,
            close_grid_qty_pct: 0.1,
            close_trailing_grid_ratio: 0.0,
            close_trailing_retracement_pct: 0.01,
            close_trailing_threshold_pct: 0.01,
            ema_span_0: 480.0,
            ema_span_1: 2400.0,
            entry_grid_double_down_factor: 1.0,
            entry_grid_spacing_pct: 0.05,
            entry_grid_spacing_weight: 1.0,
            entry_initial_ema_dist: 0.003,
            entry_initial_qty_pct: 0.01,
            entry_trailing_grid_ratio: 0.0,
            entry_trailing_retracement_pct: 0.01,
            entry_trailing_threshold_pct: 0.01,
            n_positions: 0,
            total_wallet_exposure_limit: 0.0,
            unstuck_close_pct: 0.01,
            unstuck_ema_dist: 0.01,
            unstuck_loss_allowance_pct: 0.002,
            unstuck_threshold: 0.9,
            wallet_exposure_limit: 0.0,
            mode: Mode::Normal,
            enabled: false,
        }
    }
}

impl BotParams {
    /// A side trades at all only if it has slots and a nonzero budget.
    pub fn side_enabled(&self) -> bool {
        self.n_positions > 0 && self.total_wallet_exposure_limit > 0.0
    }
}

/// Per-symbol overrides pinned by the user, keyed by coin in the document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CoinFlags {
    pub we_limit_long: Option<f64>,
    pub we_limit_short: Option<f64>,
    pub leverage: Option<f64>,
    pub mode_long: Option<Mode>,
    pub mode_short: Option<Mode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LiveSettings {
    /// Key into api-keys.json.
    pub user: String,
    pub approved_coins: Vec<String>,
    pub ignored_coins: Vec<String>,
    pub coin_flags: HashMap<String, CoinFlags>,
    pub leverage: f64,
    /// Deselected symbols with positions go to graceful_stop instead of
    /// manual.
    pub auto_gs: bool,
    pub forced_mode_long: Option<Mode>,
    pub forced_mode_short: Option<Mode>,
    pub execution_delay_seconds: f64,
    pub max_n_cancellations_per_batch: usize,
    pub max_n_creations_per_batch: usize,
    pub pnls_max_lookback_days: f64,
    /// Initial/unstuck orders further than this from last price are held back.
    pub price_distance_threshold: f64,
    pub filter_by_min_effective_cost: bool,
    pub time_in_force: String,
}

impl Default for LiveSettings {
    fn default() -> Self {
        Self {
            user: "paper".to_string(),
            approved_coins: Vec::new(),
            ignored_coins: Vec::new(),
            coin_flags: HashMap::new(),
            leverage: 10.0,
            auto_gs: true,
            forced_mode_long: None,
            forced_mode_short: None,
            execution_delay_seconds: 2.0,
            max_n_cancellations_per_batch: 8,
            max_n_creations_per_batch: 4,
            pnls_max_lookback_days: 30.0,
            price_distance_threshold: 0.002,
            filter_by_min_effective_cost: true,
            time_in_force: "good_till_cancelled".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CommonSettings {
    /// Candle interval used for noisiness/volume ranking.
    pub ohlcv_interval: String,
    pub noisiness_rolling_mean_window_size: usize,
    pub minimum_coin_age_days: f64,
    /// Drop this bottom fraction of eligible symbols by rolling volume.
    pub relative_volume_filter_clip_pct: f64,
}

impl Default for CommonSettings {
    fn default() -> Self {
        Self {
            ohlcv_interval: "15m".to_string(),
            noisiness_rolling_mean_window_size: 60,
            minimum_coin_age_days: 7.0,
            relative_volume_filter_clip_pct: 0.1,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BotSettings {
    pub long: BotParams,
    pub short: BotParams,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Settings {
    pub live: LiveSettings,
    pub common: CommonSettings,
    pub bot: BotSettings,
    /// Escape hatch for keys the schema does not know.
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let settings: Settings = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.live.execution_delay_seconds < 0.0 {
            bail!("live.execution_delay_seconds must be >= 0");
        }
        if self.live.max_n_cancellations_per_batch == 0 || self.live.max_n_creations_per_batch == 0
        {
            bail!("batch caps must be >= 1");
        }
        for (name, p) in [("long", &self.bot.long), ("short", &self.bot.short)] {
            if p.close_grid_qty_pct <= 0.0 || p.close_grid_qty_pct > 1.0 {
                bail!("bot.{name}.close_grid_qty_pct must be in (0, 1]");
            }
            if !(-1.0..=1.0).contains(&p.entry_trailing_grid_ratio)
                || !(-1.0..=1.0).contains(&p.close_trailing_grid_ratio)
            {
                bail!("bot.{name} trailing grid ratios must be in [-1, 1]");
            }
        }
        Ok(())
    }

    pub fn flags_for(&self, coin: &str) -> CoinFlags {
        self.live.coin_flags.get(coin).cloned().unwrap_or_default()
    }
}

/// Credentials file: user -> venue + keys.
#[derive(Debug, Clone, Deserialize)]
pub struct UserCreds {
    pub exchange: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub wallet_address: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
}

pub fn load_user_creds(path: &Path, user: &str) -> Result<UserCreds> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading api keys {}", path.display()))?;
    let mut users: HashMap<String, UserCreds> =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    users
        .remove(user)
        .with_context(|| format!("user {user:?} not found in {}", path.display()))
}

/// "BTC" -> "BTC/USDT:USDT". Symbols already in slash form pass through.
pub fn coin_to_symbol(coin: &str, quote: &str) -> String {
    if coin.contains('/') {
        coin.to_string()
    } else {
        format!("{coin}/{quote}:{quote}")
    }
}

/// "BTC/USDT:USDT" -> "BTC".
pub fn symbol_to_coin(symbol: &str) -> &str {
    symbol.split('/').next().unwrap_or(symbol)
}

#[derive(Debug, Parser)]
#[command(name = "gridbot", about = "multi-symbol perp grid bot")]
pub struct Cli {
    /// Path to the json config document.
    pub config_path: std::path::PathBuf,

    /// Override live.user.
    #[arg(short = 'u', long)]
    pub user: Option<String>,

    /// Override live.approved_coins (comma separated).
    #[arg(long, value_delimiter = ',')]
    pub approved_coins: Option<Vec<String>>,

    /// Override live.ignored_coins (comma separated).
    #[arg(long, value_delimiter = ',')]
    pub ignored_coins: Option<Vec<String>>,

    /// Override bot.long.total_wallet_exposure_limit.
    #[arg(long = "twe-long")]
    pub twe_long: Option<f64>,

    /// Override bot.short.total_wallet_exposure_limit.
    #[arg(long = "twe-short")]
    pub twe_short: Option<f64>,

    /// Enable or disable the long side (disabling forces graceful_stop).
    #[arg(long)]
    pub long_enabled: Option<bool>,

    /// Enable or disable the short side.
    #[arg(long)]
    pub short_enabled: Option<bool>,

    /// Override unstuck loss allowance pct on both sides (0 disables).
    #[arg(long)]
    pub loss_allowance_pct: Option<f64>,

    /// Override unstuck close pct on both sides.
    #[arg(long)]
    pub unstuck_close_pct: Option<f64>,

    /// Override unstuck threshold on both sides.
    #[arg(long = "stuck-threshold")]
    pub stuck_threshold: Option<f64>,

    #[arg(long)]
    pub execution_delay_seconds: Option<f64>,

    #[arg(long)]
    pub max_n_cancellations_per_batch: Option<usize>,

    #[arg(long)]
    pub max_n_creations_per_batch: Option<usize>,

    /// Override live.auto_gs.
    #[arg(long)]
    pub auto_gs: Option<bool>,

    /// Override live.price_distance_threshold.
    #[arg(long = "price-threshold")]
    pub price_threshold: Option<f64>,
}

impl Cli {
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(user) = &self.user {
            settings.live.user = user.clone();
        }
        if let Some(coins) = &self.approved_coins {
            settings.live.approved_coins = coins.clone();
        }
        if let Some(coins) = &self.ignored_coins {
            settings.live.ignored_coins = coins.clone();
        }
        if let Some(twe) = self.twe_long {
            settings.bot.long.total_wallet_exposure_limit = twe;
        }
        if let Some(twe) = self.twe_short {
            settings.bot.short.total_wallet_exposure_limit = twe;
        }
        if self.long_enabled == Some(false) {
            settings.live.forced_mode_long = Some(if settings.live.auto_gs {
                Mode::GracefulStop
            } else {
                Mode::Manual
            });
        }
        if self.short_enabled == Some(false) {
            settings.live.forced_mode_short = Some(if settings.live.auto_gs {
                Mode::GracefulStop
            } else {
                Mode::Manual
            });
        }
        for params in [&mut settings.bot.long, &mut settings.bot.short] {
            if let Some(v) = self.loss_allowance_pct {
                params.unstuck_loss_allowance_pct = v;
            }
            if let Some(v) = self.unstuck_close_pct {
                params.unstuck_close_pct = v;
            }
            if let Some(v) = self.stuck_threshold {
                params.unstuck_threshold = v;
            }
        }
        if let Some(v) = self.execution_delay_seconds {
            settings.live.execution_delay_seconds = v;
        }
        if let Some(v) = self.max_n_cancellations_per_batch {
            settings.live.max_n_cancellations_per_batch = v;
        }
        if let Some(v) = self.max_n_creations_per_batch {
            settings.live.max_n_creations_per_batch = v;
        }
        if let Some(v) = self.auto_gs {
            settings.live.auto_gs = v;
        }
        if let Some(v) = self.price_threshold {
            settings.live.price_distance_threshold = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_keys_are_rejected_outside_extra() {
        let doc = r#"{"live": {"user": "u", "no_such_key": 1}}"#;
        assert!(serde_json::from_str::<Settings>(doc).is_err());
        let doc = r#"{"live": {"user": "u"}, "extra": {"no_such_key": 1}}"#;
        let settings: Settings = serde_json::from_str(doc).unwrap();
        assert_eq!(settings.live.user, "u");
        assert_eq!(settings.extra.len(), 1);
    }

    #[test]
    fn partial_document_fills_defaults() {
        let doc = r#"{"bot": {"long": {"n_positions": 3, "total_wallet_exposure_limit": 1.5}}}"#;
        let settings: Settings = serde_json::from_str(doc).unwrap();
        assert!(settings.bot.long.side_enabled());
        assert!(!settings.bot.short.side_enabled());
        assert_eq!(settings.live.max_n_cancellations_per_batch, 8);
    }

    #[test]
    fn symbol_coin_mapping() {
        assert_eq!(coin_to_symbol("BTC", "USDT"), "BTC/USDT:USDT");
        assert_eq!(coin_to_symbol("BTC/USDT:USDT", "USDT"), "BTC/USDT:USDT");
        assert_eq!(symbol_to_coin("BTC/USDT:USDT"), "BTC");
    }

    #[test]
    fn validation_catches_bad_ratios() {
        let mut settings = Settings::default();
        settings.bot.long.entry_trailing_grid_ratio = 1.5;
        assert!(settings.validate().is_err());
    }
}
