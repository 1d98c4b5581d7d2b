//! Core data types shared between the live collector and the offline merger.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Source tag for observations coming from a locally connected execution client.
pub const SOURCE_PEER: &str = "peer";
/// Source tag for the bearer-token vendor stream (WebSocket or gRPC by URL scheme).
pub const SOURCE_VENDOR_A: &str = "vendor_a";
/// Source tag for the second bearer-token vendor stream.
pub const SOURCE_VENDOR_B: &str = "vendor_b";
/// Source tag for the API-key vendor stream.
pub const SOURCE_VENDOR_C: &str = "vendor_c";

/// Header of the merged metadata CSV. Values are never quoted; none of the
/// fields can contain a comma by construction.
pub const TX_SUMMARY_CSV_HEADER: &str = "timestamp_ms,hash,chain_id,from,to,value,nonce,gas,gas_price,gas_tip_cap,gas_fee_cap,data_size,data_4bytes";

/// A single mempool observation as produced by a source connector.
///
/// Transient: created by a connector, consumed by the processor, never
/// persisted in this form.
#[derive(Debug, Clone)]
pub struct TxObservation {
    /// Local wall-clock reading (ms) at the moment the connector received the record.
    pub received_at_ms: i64,
    /// Canonical transaction hash, `0x` + 64 lowercase hex chars.
    pub hash: String,
    /// Canonical signed encoding of the transaction.
    pub raw_tx: Vec<u8>,
    /// Tag of the connector that produced this observation.
    pub source: String,
}

/// Decoded summary of one transaction, one row of the metadata CSV and the
/// Parquet output.
///
/// Numeric fields are rendered as base-10 text so that 256-bit values survive
/// every downstream tool unharmed. Addresses carry their EIP-55 checksum.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TxSummaryEntry {
    pub timestamp_ms: i64,
    pub hash: String,

    pub chain_id: String,
    /// Empty when signature recovery failed.
    pub from: String,
    /// Empty for contract creation.
    pub to: String,
    pub value: String,
    pub nonce: String,

    pub gas: String,
    pub gas_price: String,
    pub gas_tip_cap: String,
    pub gas_fee_cap: String,

    pub data_size: i64,
    /// `0x` + first four bytes of calldata, empty if the calldata is shorter.
    pub data_4bytes: String,

    /// Source tags ordered by each source's earliest arrival time.
    #[serde(default)]
    pub sources: Vec<String>,
    /// 0 = unknown or not included within the probe horizon.
    #[serde(default)]
    pub included_at_block_height: i64,
    #[serde(default)]
    pub included_block_timestamp: i64,
    /// `included_block_timestamp * 1000 - timestamp_ms` when included, else 0.
    #[serde(default)]
    pub inclusion_delay_ms: i64,
}

impl TxSummaryEntry {
    pub fn is_included(&self) -> bool {
        self.included_at_block_height != 0
    }

    pub fn has_source(&self, source: &str) -> bool {
        self.sources.iter().any(|s| s == source)
    }

    /// Render the metadata CSV row (matches [`TX_SUMMARY_CSV_HEADER`]).
    pub fn to_csv_row(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{},{},{},{},{},{}",
            self.timestamp_ms,
            self.hash,
            self.chain_id,
            self.from,
            self.to,
            self.value,
            self.nonce,
            self.gas,
            self.gas_price,
            self.gas_tip_cap,
            self.gas_fee_cap,
            self.data_size,
            self.data_4bytes,
        )
    }
}

/// A merged transaction: decoded summary plus the raw encoding it came from,
/// kept around for the optional re-hydration CSV.
#[derive(Debug, Clone)]
pub struct TxRecord {
    /// `0x`-prefixed hex of the canonical signed encoding.
    pub raw_tx: String,
    pub summary: TxSummaryEntry,
}

/// `hash -> source -> earliest observation timestamp (ms)`.
pub type Sourcelog = HashMap<String, HashMap<String, i64>>;

/// A latency-comparison pair for the analyzer.
#[derive(Debug, Clone)]
pub struct SourceComp {
    pub source: String,
    pub reference: String,
}

impl SourceComp {
    pub fn new(source: &str, reference: &str) -> Self {
        Self {
            source: source.to_string(),
            reference: reference.to_string(),
        }
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Decode a hex string into bytes, with or without `0x` prefix.
pub fn hex_to_bytes(s: &str) -> Result<Vec<u8>, hex::FromHexError> {
    hex::decode(s.strip_prefix("0x").unwrap_or(s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_row_matches_header_arity() {
        let entry = TxSummaryEntry {
            timestamp_ms: 1000,
            hash: "0xabc".to_string(),
            ..Default::default()
        };
        let row = entry.to_csv_row();
        assert_eq!(
            row.split(',').count(),
            TX_SUMMARY_CSV_HEADER.split(',').count()
        );
    }

    #[test]
    fn test_csv_row_renders_fields_in_header_order() {
        let entry = TxSummaryEntry {
            timestamp_ms: 1693526400000,
            hash: "0x11".to_string(),
            chain_id: "1".to_string(),
            from: "0xAa".to_string(),
            to: String::new(),
            value: "0".to_string(),
            nonce: "7".to_string(),
            gas: "21000".to_string(),
            gas_price: "100".to_string(),
            gas_tip_cap: "2".to_string(),
            gas_fee_cap: "100".to_string(),
            data_size: 0,
            data_4bytes: String::new(),
            ..Default::default()
        };
        assert_eq!(
            entry.to_csv_row(),
            "1693526400000,0x11,1,0xAa,,0,7,21000,100,2,100,0,"
        );
    }

    #[test]
    fn test_hex_to_bytes_accepts_both_prefix_styles() {
        assert_eq!(hex_to_bytes("0x0102").unwrap(), vec![1, 2]);
        assert_eq!(hex_to_bytes("0102").unwrap(), vec![1, 2]);
        assert!(hex_to_bytes("0xzz").is_err());
    }

    #[test]
    fn test_has_source() {
        let entry = TxSummaryEntry {
            sources: vec!["peer".to_string(), "vendor_a".to_string()],
            ..Default::default()
        };
        assert!(entry.has_source("peer"));
        assert!(!entry.has_source("vendor_b"));
    }
}
