//! Websocket consumption: drains the venue's ticker, order and balance
//! streams into the state store between ticks. Stream loss is handled by
//! resubscribing; REST refreshes at tick time paper over any gap.

use std::sync::Arc;

use anyhow::Result;
use tokio::time::{Duration, sleep};
use tracing::{info, warn};

use crate::exchange::ExchangeClient;
use crate::state::Shared;
use crate::types::{OrderUpdate, Ticker};

pub async fn run_ws(client: Arc<dyn ExchangeClient>, shared: Shared) -> Result<()> {
    loop {
        let streams = async {
            Ok::<_, crate::exchange::ExchangeError>((
                client.watch_tickers().await?,
                client.watch_orders().await?,
                client.watch_balance().await?,
            ))
        }
        .await;
        let (mut tickers_rx, mut orders_rx, mut balance_rx) = match streams {
            Ok(streams) => streams,
            Err(e) => {
                warn!("ws subscribe failed: {e} (retrying)");
                sleep(Duration::from_millis(1000)).await;
                continue;
            }
        };
        info!("ws streams connected");

        loop {
            tokio::select! {
                msg = tickers_rx.recv() => {
                    let Some((symbol, ticker)) = msg else { break };
                    handle_ticker(&shared, &symbol, ticker).await;
                }
                msg = orders_rx.recv() => {
                    let Some(update) = msg else { break };
                    handle_order(&shared, update).await;
                }
                msg = balance_rx.recv() => {
                    let Some(balance) = msg else { break };
                    *shared.balance.write().await = balance;
                }
            }
        }

        warn!("ws stream closed; resubscribing");
        sleep(Duration::from_millis(1000)).await;
    }
}

async fn handle_ticker(shared: &Shared, symbol: &str, ticker: Ticker) {
    let Some(state) = shared.get(symbol) else {
        return;
    };
    let mut data = state.data.write().await;
    data.ticker = Some(ticker);
    // keep the current minute's hlc warm between REST refreshes
    let mid = if ticker.bid > 0.0 && ticker.ask > 0.0 {
        (ticker.bid + ticker.ask) / 2.0
    } else {
        ticker.last
    };
    data.hlcs_1m.note_price(mid, ticker.ts);
}

async fn handle_order(shared: &Shared, update: OrderUpdate) {
    match update {
        OrderUpdate::New(order) => shared.add_order(&order, "WS").await,
        OrderUpdate::Cancelled(order) => shared.remove_order(&order, "WS").await,
        OrderUpdate::Filled(order) => {
            shared.remove_order(&order, "WS").await;
            // positions/orders/pnls must be refetched before the next compose
            shared.mark_recent_fill();
        }
    }
}
