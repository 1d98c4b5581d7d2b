//! Peer-node mempool subscription.
//!
//! Connects to an execution client over WebSocket and subscribes to the full
//! pending-transaction firehose. Runs forever, reconnecting with exponential
//! backoff.

use std::sync::Arc;

use alloy::eips::eip2718::Encodable2718;
use alloy::primitives::keccak256;
use alloy::providers::{Provider, ProviderBuilder, WsConnect};
use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{info, warn};

use super::{next_backoff, publish, SourceCounters, RECONNECT_INITIAL};
use crate::types::{now_ms, TxObservation, SOURCE_PEER};

pub struct NodeConnection {
    url: String,
    queue: mpsc::Sender<TxObservation>,
    counters: Arc<SourceCounters>,
}

impl NodeConnection {
    pub fn new(
        url: String,
        queue: mpsc::Sender<TxObservation>,
        counters: Arc<SourceCounters>,
    ) -> Self {
        Self {
            url,
            queue,
            counters,
        }
    }

    /// Connect, subscribe, stream until failure, back off, repeat.
    pub async fn run(self) {
        let mut delay = RECONNECT_INITIAL;

        loop {
            match self.connect_and_stream().await {
                Ok(StreamEnd::QueueClosed) => {
                    info!(node = %self.url, "processor gone, stopping node connection");
                    return;
                }
                Ok(StreamEnd::Disconnected) => {
                    warn!(node = %self.url, "subscription ended, reconnecting in {delay:?}");
                }
                Err(e) => {
                    warn!(node = %self.url, "node connection error: {e:#}, reconnecting in {delay:?}");
                }
            }
            sleep(delay).await;
            delay = next_backoff(delay);
        }
    }

    async fn connect_and_stream(&self) -> Result<StreamEnd> {
        info!(node = %self.url, "🔌 connecting to execution client");

        let provider = ProviderBuilder::new()
            .connect_ws(WsConnect::new(self.url.clone()))
            .await
            .context("websocket connect failed")?;

        let sub = provider
            .subscribe_full_pending_transactions()
            .await
            .context("pending-transactions subscription failed")?;
        let mut stream = sub.into_stream();

        info!(node = %self.url, "✅ subscribed to pending transactions");

        while let Some(tx) = stream.next().await {
            let received_at_ms = now_ms();
            let raw_tx = tx.inner.inner().encoded_2718();
            let hash = format!("0x{}", hex::encode(keccak256(&raw_tx)));

            let obs = TxObservation {
                received_at_ms,
                hash,
                raw_tx,
                source: SOURCE_PEER.to_string(),
            };
            if !publish(&self.queue, obs, &self.counters) {
                return Ok(StreamEnd::QueueClosed);
            }
        }

        Ok(StreamEnd::Disconnected)
    }
}

enum StreamEnd {
    /// Server closed the subscription; reconnect.
    Disconnected,
    /// The processor side of the fan-in queue is gone; terminate.
    QueueClosed,
}
