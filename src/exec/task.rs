//! Dispatch task: receives one batch per reconciliation round and pushes it
//! to the venue, cancels strictly before creates. Failures are logged and
//! dropped; the next tick recomputes from scratch.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::warn;

use crate::exchange::ExchangeClient;
use crate::state::Shared;
use crate::types::{ExecCommand, Order};

/// Venue-side client-id budget.
const CUSTOM_ID_MAX_LEN: usize = 36;

fn format_custom_id(order: &mut Order) {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let mut id = format!("{}{}", order.custom_id.replace('_', ""), suffix);
    id.truncate(CUSTOM_ID_MAX_LEN);
    order.custom_id = id;
}

pub async fn run_exec(
    client: Arc<dyn ExchangeClient>,
    shared: Shared,
    mut rx: mpsc::Receiver<ExecCommand>,
) -> Result<()> {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            ExecCommand::Batch { cancels, creates } => {
                if !cancels.is_empty() {
                    let results = client.cancel_orders(cancels.clone()).await;
                    for (order, res) in cancels.iter().zip(results) {
                        match res {
                            Ok(acked) => shared.remove_order(&acked, "POST").await,
                            Err(e) => warn!(
                                symbol = %order.symbol,
                                price = order.price,
                                "cancel failed: {e}"
                            ),
                        }
                    }
                }
                if !creates.is_empty() {
                    let mut to_place = creates.clone();
                    for order in &mut to_place {
                        format_custom_id(order);
                    }
                    let results = client.place_orders(to_place.clone()).await;
                    for (order, res) in to_place.iter().zip(results) {
                        match res {
                            Ok(acked) => shared.add_order(&acked, "POST").await,
                            // dropped either way; the next tick recomputes
                            // from scratch, so transient failures self-heal
                            Err(e) => warn!(
                                symbol = %order.symbol,
                                side = order.side.as_str(),
                                qty = order.qty,
                                price = order.price,
                                transient = e.is_transient(),
                                "create failed: {e}"
                            ),
                        }
                    }
                }
            }
        }
    }
    Ok(())
}
