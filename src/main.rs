use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use dotenv::dotenv;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gridbot::config::{Cli, Settings, load_user_creds};
use gridbot::exchange::ExchangeClient;
use gridbot::exchange::paper::PaperExchange;
use gridbot::state::Shared;
use gridbot::state::pnl::PnlLedger;
use gridbot::types::utc_ms;
use gridbot::{engine, exec, maintainers, ws};

const MAX_N_RESTARTS_PER_DAY: usize = 5;
const RESTART_COOLDOWN_SECS: u64 = 60;
const DAY_MS: i64 = 1000 * 60 * 60 * 24;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    dotenv().ok();

    let cli = Cli::parse();
    let mut settings = Settings::load(&cli.config_path)?;
    cli.apply(&mut settings);
    settings.validate()?;

    let client = build_client(&settings)?;
    info!(exchange = client.name(), user = %settings.live.user, "starting");

    let mut restarts: Vec<i64> = Vec::new();
    loop {
        match run_bot(&settings, client.clone()).await {
            Ok(()) => {
                info!("shutdown complete");
                return Ok(());
            }
            Err(e) => {
                error!("bot stopped: {e:#}");
                let cutoff = utc_ms() - DAY_MS;
                restarts.retain(|t| *t > cutoff);
                restarts.push(utc_ms());
                if restarts.len() >= MAX_N_RESTARTS_PER_DAY {
                    bail!("hit {MAX_N_RESTARTS_PER_DAY} restarts within a day, giving up");
                }
                info!(
                    n = restarts.len(),
                    max = MAX_N_RESTARTS_PER_DAY,
                    "restarting after cooldown"
                );
                tokio::time::sleep(tokio::time::Duration::from_secs(RESTART_COOLDOWN_SECS)).await;
            }
        }
    }
}

/// Resolve the configured user to a venue client. Only the in-process paper
/// venue ships with this repo; real venues are separate trait impls.
fn build_client(settings: &Settings) -> Result<Arc<dyn ExchangeClient>> {
    let exchange = match load_user_creds(Path::new("api-keys.json"), &settings.live.user) {
        Ok(creds) => creds.exchange,
        // a missing keyfile is fine for the built-in paper venue
        Err(_) if settings.live.user == "paper" => "paper".to_string(),
        Err(e) => return Err(e).context("loading credentials"),
    };
    match exchange.as_str() {
        "paper" => Ok(Arc::new(PaperExchange::new(Vec::new(), 1000.0))),
        other => bail!("no client built in for exchange {other:?} (available: paper)"),
    }
}

fn cache_dir() -> PathBuf {
    PathBuf::from("caches")
}

async fn run_bot(settings: &Settings, client: Arc<dyn ExchangeClient>) -> Result<()> {
    let pnls_path = cache_dir()
        .join(client.name())
        .join(format!("{}_pnls.json", settings.live.user));
    let mut ledger = PnlLedger::new(pnls_path);
    ledger.load_cache(PnlLedger::age_limit(
        utc_ms(),
        settings.live.pnls_max_lookback_days,
    ));
    let shared = Shared::new(ledger);

    client.set_hedge_mode().await.context("setting hedge mode")?;
    maintainers::refresh_markets(&shared, &*client, &cache_dir())
        .await
        .context("initial market load")?;
    info!(n_symbols = shared.symbols.len(), "markets loaded");

    let (exec_tx, exec_rx) = mpsc::channel(256);

    let mut tasks = Vec::new();
    {
        let shared = shared.clone();
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let _ = ws::task::run_ws(client, shared).await;
        }));
    }
    {
        let shared = shared.clone();
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let _ = exec::task::run_exec(client, shared, exec_rx).await;
        }));
    }
    {
        let shared = shared.clone();
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let _ = maintainers::run_market_info(shared, client, cache_dir()).await;
        }));
    }
    {
        let shared = shared.clone();
        let client = client.clone();
        let settings = settings.clone();
        tasks.push(tokio::spawn(async move {
            let _ = maintainers::run_candles(shared, client, settings).await;
        }));
    }

    // engine runs here; ctrl-c wins and shuts everything down cooperatively
    let result = tokio::select! {
        res = engine::task::run_engine(settings.clone(), shared.clone(), client, exec_tx) => res,
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c, shutting down");
            Ok(())
        }
    };

    for task in &tasks {
        task.abort();
    }
    for task in tasks {
        let _ = task.await;
    }
    result
}
