//! Vendor mempool streams.
//!
//! Three vendor feeds ship raw transactions over authenticated WebSocket
//! streams: vendor A and vendor B authenticate with a bearer token, vendor C
//! with an API key header. Vendor A's URL scheme selects between its
//! WebSocket and bidirectional-RPC transports; only the WebSocket transport
//! is wired here, other schemes are rejected at startup.

use std::sync::Arc;

use alloy::primitives::keccak256;
use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::{connect_async, tungstenite};
use tracing::{debug, info, warn};

use super::{next_backoff, publish, SourceCounters, RECONNECT_INITIAL};
use crate::types::{
    hex_to_bytes, now_ms, TxObservation, SOURCE_VENDOR_A, SOURCE_VENDOR_B, SOURCE_VENDOR_C,
};

const VENDOR_A_DEFAULT_URL: &str = "wss://stream.vendor-a.net/ws";
const VENDOR_B_DEFAULT_URL: &str = "wss://txstream.vendor-b.io/v1/ws";
const VENDOR_C_DEFAULT_URL: &str = "wss://mempool.vendor-c.xyz/stream";

/// Subscription request for the raw-transaction channel.
const SUBSCRIBE_NEW_TXS: &str =
    r#"{"jsonrpc":"2.0","id":1,"method":"subscribe","params":["newTxs",{"include":["raw_tx"]}]}"#;

/// Raw transaction notification, the one message shape we consume.
#[derive(Debug, Deserialize)]
struct VendorTxMsg {
    params: VendorTxParams,
}

#[derive(Debug, Deserialize)]
struct VendorTxParams {
    result: VendorTxResult,
}

#[derive(Debug, Deserialize)]
struct VendorTxResult {
    #[serde(rename = "rawTx", alias = "raw_tx")]
    raw_tx: String,
}

enum VendorAuth {
    Bearer(String),
    ApiKey(String),
}

pub struct VendorConnection {
    source: &'static str,
    url: String,
    auth: VendorAuth,
    queue: mpsc::Sender<TxObservation>,
    counters: Arc<SourceCounters>,
}

impl VendorConnection {
    pub fn vendor_a(
        token: String,
        queue: mpsc::Sender<TxObservation>,
        counters: Arc<SourceCounters>,
    ) -> Result<Self> {
        let url = url_from_env("VENDOR_A_URL", VENDOR_A_DEFAULT_URL);
        require_websocket_scheme(&url)?;
        Ok(Self {
            source: SOURCE_VENDOR_A,
            url,
            auth: VendorAuth::Bearer(token),
            queue,
            counters,
        })
    }

    pub fn vendor_b(
        token: String,
        queue: mpsc::Sender<TxObservation>,
        counters: Arc<SourceCounters>,
    ) -> Result<Self> {
        let url = url_from_env("VENDOR_B_URL", VENDOR_B_DEFAULT_URL);
        require_websocket_scheme(&url)?;
        Ok(Self {
            source: SOURCE_VENDOR_B,
            url,
            auth: VendorAuth::Bearer(token),
            queue,
            counters,
        })
    }

    pub fn vendor_c(
        api_key: String,
        queue: mpsc::Sender<TxObservation>,
        counters: Arc<SourceCounters>,
    ) -> Result<Self> {
        let url = url_from_env("VENDOR_C_URL", VENDOR_C_DEFAULT_URL);
        require_websocket_scheme(&url)?;
        Ok(Self {
            source: SOURCE_VENDOR_C,
            url,
            auth: VendorAuth::ApiKey(api_key),
            queue,
            counters,
        })
    }

    pub fn source(&self) -> &'static str {
        self.source
    }

    /// Stream until the queue closes. Transient failures reconnect with
    /// backoff; an explicit auth rejection is fatal and returned to the
    /// supervisor.
    pub async fn run(self) -> Result<()> {
        let mut delay = RECONNECT_INITIAL;

        loop {
            match self.connect_and_stream().await {
                Ok(StreamEnd::QueueClosed) => {
                    info!(source = self.source, "processor gone, stopping vendor stream");
                    return Ok(());
                }
                Ok(StreamEnd::Disconnected) => {
                    warn!(source = self.source, "stream ended, reconnecting in {delay:?}");
                }
                Err(e) if is_auth_rejection(&e) => {
                    return Err(e.context(format!("{} credentials rejected", self.source)));
                }
                Err(e) => {
                    warn!(source = self.source, "stream error: {e:#}, reconnecting in {delay:?}");
                }
            }
            sleep(delay).await;
            delay = next_backoff(delay);
        }
    }

    async fn connect_and_stream(&self) -> Result<StreamEnd> {
        // Don't log the URL, some vendors put the credential in the path.
        info!(source = self.source, "🔌 connecting to vendor stream");

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .context("failed to build websocket request")?;
        let (header, value) = match &self.auth {
            VendorAuth::Bearer(token) => ("Authorization", format!("Bearer {token}")),
            VendorAuth::ApiKey(key) => ("x-api-key", key.clone()),
        };
        request.headers_mut().insert(
            header,
            value.parse().context("credential is not a valid header value")?,
        );

        let (ws_stream, response) = connect_async(request).await.map_err(classify_ws_error)?;
        info!(source = self.source, status = %response.status(), "✅ vendor stream connected");

        let (mut write, mut read) = ws_stream.split();
        write
            .send(tungstenite::Message::Text(SUBSCRIBE_NEW_TXS.to_string()))
            .await
            .context("failed to send subscription")?;

        while let Some(message) = read.next().await {
            match message {
                Ok(tungstenite::Message::Text(text)) => {
                    if let Some(obs) = self.observation_from_text(&text) {
                        if !publish(&self.queue, obs, &self.counters) {
                            return Ok(StreamEnd::QueueClosed);
                        }
                    }
                }
                Ok(tungstenite::Message::Ping(payload)) => {
                    write
                        .send(tungstenite::Message::Pong(payload))
                        .await
                        .context("failed to send pong")?;
                }
                Ok(tungstenite::Message::Close(frame)) => {
                    info!(source = self.source, "stream closed by server: {frame:?}");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(source = self.source, "read error: {e}");
                    break;
                }
            }
        }

        Ok(StreamEnd::Disconnected)
    }

    /// Parse one text frame into an observation. Subscription confirmations
    /// and other control messages are ignored at debug level.
    fn observation_from_text(&self, text: &str) -> Option<TxObservation> {
        let received_at_ms = now_ms();
        match serde_json::from_str::<VendorTxMsg>(text) {
            Ok(msg) => match hex_to_bytes(&msg.params.result.raw_tx) {
                Ok(raw_tx) => {
                    let hash = format!("0x{}", hex::encode(keccak256(&raw_tx)));
                    Some(TxObservation {
                        received_at_ms,
                        hash,
                        raw_tx,
                        source: self.source.to_string(),
                    })
                }
                Err(e) => {
                    warn!(source = self.source, "bad raw tx hex: {e}");
                    None
                }
            },
            Err(e) => {
                if serde_json::from_str::<serde_json::Value>(text)
                    .map(|v| v.get("result").is_some() || v.get("error").is_some())
                    .unwrap_or(false)
                {
                    debug!(source = self.source, "control message: {text}");
                } else {
                    warn!(source = self.source, "unparseable message: {e} | {text}");
                }
                None
            }
        }
    }
}

enum StreamEnd {
    Disconnected,
    QueueClosed,
}

fn url_from_env(var: &str, default: &str) -> String {
    std::env::var(var).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string())
}

fn require_websocket_scheme(url: &str) -> Result<()> {
    if url.starts_with("ws://") || url.starts_with("wss://") {
        Ok(())
    } else {
        let scheme = url.split("://").next().unwrap_or(url);
        Err(anyhow!(
            "unsupported vendor stream scheme '{scheme}' (only ws:// and wss:// are wired)"
        ))
    }
}

/// Map a handshake rejected with 401/403 to a distinguishable error so the
/// supervisor can stop retrying doomed credentials.
fn classify_ws_error(e: tungstenite::Error) -> anyhow::Error {
    if let tungstenite::Error::Http(response) = &e {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return anyhow!(AuthRejected(status.as_u16()));
        }
    }
    anyhow::Error::new(e).context("websocket connect failed")
}

#[derive(Debug, thiserror::Error)]
#[error("authentication rejected (HTTP {0})")]
struct AuthRejected(u16);

fn is_auth_rejection(e: &anyhow::Error) -> bool {
    e.downcast_ref::<AuthRejected>().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_tx_notification_deserializes() {
        let json = r#"{
            "jsonrpc": "2.0",
            "method": "subscribe",
            "params": {
                "subscription": "sub-1",
                "result": { "rawTx": "0x02f870018203e8" }
            }
        }"#;
        let msg: VendorTxMsg = serde_json::from_str(json).unwrap();
        assert_eq!(msg.params.result.raw_tx, "0x02f870018203e8");
    }

    #[test]
    fn test_snake_case_raw_tx_alias() {
        let json = r#"{"params":{"result":{"raw_tx":"0x01"}}}"#;
        let msg: VendorTxMsg = serde_json::from_str(json).unwrap();
        assert_eq!(msg.params.result.raw_tx, "0x01");
    }

    #[test]
    fn test_non_websocket_scheme_is_rejected() {
        assert!(require_websocket_scheme("wss://stream.vendor-a.net/ws").is_ok());
        assert!(require_websocket_scheme("ws://localhost:9000").is_ok());
        let err = require_websocket_scheme("grpc://stream.vendor-a.net:5001").unwrap_err();
        assert!(err.to_string().contains("grpc"));
    }

    #[tokio::test]
    async fn test_observation_from_text_parses_and_hashes() {
        let (queue, _rx) = mpsc::channel(1);
        let conn = VendorConnection {
            source: SOURCE_VENDOR_A,
            url: VENDOR_A_DEFAULT_URL.to_string(),
            auth: VendorAuth::Bearer("t".to_string()),
            queue,
            counters: Arc::new(SourceCounters::default()),
        };

        let text = r#"{"params":{"result":{"rawTx":"0x0102"}}}"#;
        let obs = conn.observation_from_text(text).unwrap();
        assert_eq!(obs.raw_tx, vec![1, 2]);
        assert_eq!(
            obs.hash,
            format!("0x{}", hex::encode(keccak256([1u8, 2u8])))
        );
        assert_eq!(obs.source, "vendor_a");

        // subscription confirmation is a control message, not an observation
        assert!(conn
            .observation_from_text(r#"{"jsonrpc":"2.0","id":1,"result":"sub-1"}"#)
            .is_none());
    }

    #[test]
    fn test_auth_rejection_is_detected_through_context() {
        let err = anyhow!(AuthRejected(401)).context("vendor_a credentials rejected");
        assert!(is_auth_rejection(&err));
        let other = anyhow!("connection reset");
        assert!(!is_auth_rejection(&other));
    }
}
