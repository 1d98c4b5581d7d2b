//! Signed-transaction decoding.
//!
//! Turns the canonical byte encoding of a signed Ethereum transaction into a
//! [`TxSummaryEntry`]. Handles every envelope type live on mainnet: legacy,
//! EIP-2930 access-list, EIP-1559 dynamic-fee and EIP-4844 blob-carrier
//! (blob fields are not part of the summary).

use alloy::consensus::transaction::SignerRecoverable;
use alloy::consensus::{Transaction, TxEnvelope};
use alloy::eips::eip2718::Decodable2718;
use thiserror::Error;

use crate::types::TxSummaryEntry;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty raw transaction")]
    Empty,

    #[error("failed to decode transaction envelope: {0}")]
    Envelope(String),
}

/// Decode a raw signed transaction into a summary entry.
///
/// Signature recovery failure is non-fatal: the entry is still returned with
/// an empty `from`, every other field populated. The returned hash is always
/// the canonical hash of `raw`, lowercased.
pub fn parse_tx(timestamp_ms: i64, raw: &[u8]) -> Result<TxSummaryEntry, DecodeError> {
    if raw.is_empty() {
        return Err(DecodeError::Empty);
    }

    let envelope = TxEnvelope::decode_2718(&mut &raw[..])
        .map_err(|e| DecodeError::Envelope(e.to_string()))?;

    let from = match envelope.recover_signer() {
        Ok(addr) => addr.to_checksum(None),
        // Bad signatures still carry a decodable payload worth archiving.
        Err(_) => String::new(),
    };

    let to = envelope
        .to()
        .map(|addr| addr.to_checksum(None))
        .unwrap_or_default();

    // Legacy and access-list transactions carry a single gas price; render it
    // into all three fee columns so the dataset reads uniformly. Dynamic-fee
    // transactions report their fee cap as the effective gas price.
    let (gas_price, gas_tip_cap, gas_fee_cap) = match envelope.gas_price() {
        Some(price) => (price, price, price),
        None => (
            envelope.max_fee_per_gas(),
            envelope.max_priority_fee_per_gas().unwrap_or_default(),
            envelope.max_fee_per_gas(),
        ),
    };

    let input = envelope.input();
    let data_4bytes = if input.len() >= 4 {
        format!("0x{}", hex::encode(&input[..4]))
    } else {
        String::new()
    };

    Ok(TxSummaryEntry {
        timestamp_ms,
        hash: format!("0x{}", hex::encode(envelope.tx_hash())),

        chain_id: envelope
            .chain_id()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "0".to_string()),
        from,
        to,
        value: envelope.value().to_string(),
        nonce: envelope.nonce().to_string(),

        gas: envelope.gas_limit().to_string(),
        gas_price: gas_price.to_string(),
        gas_tip_cap: gas_tip_cap.to_string(),
        gas_fee_cap: gas_fee_cap.to_string(),

        data_size: input.len() as i64,
        data_4bytes,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::consensus::{SignableTransaction, TxEip1559, TxEip2930, TxLegacy};
    use alloy::eips::eip2718::Encodable2718;
    use alloy::primitives::{address, keccak256, Address, Bytes, TxKind, B256, U256};
    use alloy::signers::local::PrivateKeySigner;
    use alloy::signers::SignerSync;

    const TO: Address = address!("d8dA6BF26964aF9D7eEd9e03E53415D37aA96045");

    fn signer() -> PrivateKeySigner {
        PrivateKeySigner::from_bytes(&B256::repeat_byte(0x42)).unwrap()
    }

    fn sign_eip1559(tx: TxEip1559) -> Vec<u8> {
        let sig = signer().sign_hash_sync(&tx.signature_hash()).unwrap();
        let envelope: TxEnvelope = tx.into_signed(sig).into();
        envelope.encoded_2718()
    }

    fn sign_legacy(tx: TxLegacy) -> Vec<u8> {
        let sig = signer().sign_hash_sync(&tx.signature_hash()).unwrap();
        let envelope: TxEnvelope = tx.into_signed(sig).into();
        envelope.encoded_2718()
    }

    #[test]
    fn test_decode_eip1559() {
        let raw = sign_eip1559(TxEip1559 {
            chain_id: 1,
            nonce: 7,
            gas_limit: 21_000,
            max_fee_per_gas: 100_000_000_000,
            max_priority_fee_per_gas: 2_000_000_000,
            to: TxKind::Call(TO),
            value: U256::from(1_000_000_000_000_000_000u128),
            access_list: Default::default(),
            input: Bytes::default(),
        });

        let entry = parse_tx(1000, &raw).unwrap();
        assert_eq!(entry.timestamp_ms, 1000);
        assert_eq!(entry.chain_id, "1");
        assert_eq!(entry.from, signer().address().to_checksum(None));
        assert_eq!(entry.to, TO.to_checksum(None));
        assert_eq!(entry.value, "1000000000000000000");
        assert_eq!(entry.nonce, "7");
        assert_eq!(entry.gas, "21000");
        assert_eq!(entry.gas_price, "100000000000");
        assert_eq!(entry.gas_tip_cap, "2000000000");
        assert_eq!(entry.gas_fee_cap, "100000000000");
        assert_eq!(entry.data_size, 0);
        assert_eq!(entry.data_4bytes, "");
    }

    #[test]
    fn test_decode_legacy_renders_single_gas_price_everywhere() {
        let raw = sign_legacy(TxLegacy {
            chain_id: Some(1),
            nonce: 0,
            gas_price: 50_000_000_000,
            gas_limit: 60_000,
            to: TxKind::Call(TO),
            value: U256::ZERO,
            input: Bytes::from(vec![0xa9, 0x05, 0x9c, 0xbb, 0x00, 0x01]),
        });

        let entry = parse_tx(42, &raw).unwrap();
        assert_eq!(entry.gas_price, "50000000000");
        assert_eq!(entry.gas_tip_cap, "50000000000");
        assert_eq!(entry.gas_fee_cap, "50000000000");
        assert_eq!(entry.data_size, 6);
        assert_eq!(entry.data_4bytes, "0xa9059cbb");
    }

    #[test]
    fn test_decode_eip2930() {
        let tx = TxEip2930 {
            chain_id: 1,
            nonce: 3,
            gas_price: 30_000_000_000,
            gas_limit: 21_000,
            to: TxKind::Call(TO),
            value: U256::from(5u64),
            access_list: Default::default(),
            input: Bytes::default(),
        };
        let sig = signer().sign_hash_sync(&tx.signature_hash()).unwrap();
        let envelope: TxEnvelope = tx.into_signed(sig).into();
        let raw = envelope.encoded_2718();

        let entry = parse_tx(1, &raw).unwrap();
        assert_eq!(entry.nonce, "3");
        assert_eq!(entry.gas_price, "30000000000");
        assert_eq!(entry.gas_tip_cap, "30000000000");
    }

    #[test]
    fn test_decode_contract_creation_has_empty_to() {
        let raw = sign_eip1559(TxEip1559 {
            chain_id: 1,
            nonce: 0,
            gas_limit: 1_000_000,
            max_fee_per_gas: 10_000_000_000,
            max_priority_fee_per_gas: 1_000_000_000,
            to: TxKind::Create,
            value: U256::ZERO,
            access_list: Default::default(),
            input: Bytes::from(vec![0x60, 0x80, 0x60, 0x40, 0x52]),
        });

        let entry = parse_tx(1, &raw).unwrap();
        assert_eq!(entry.to, "");
        assert_eq!(entry.data_size, 5);
        assert_eq!(entry.data_4bytes, "0x60806040");
    }

    #[test]
    fn test_calldata_shorter_than_four_bytes_yields_empty_selector() {
        let raw = sign_eip1559(TxEip1559 {
            chain_id: 1,
            nonce: 0,
            gas_limit: 30_000,
            max_fee_per_gas: 10_000_000_000,
            max_priority_fee_per_gas: 1_000_000_000,
            to: TxKind::Call(TO),
            value: U256::ZERO,
            access_list: Default::default(),
            input: Bytes::from(vec![0xaa, 0xbb, 0xcc]),
        });

        let entry = parse_tx(1, &raw).unwrap();
        assert_eq!(entry.data_size, 3);
        assert_eq!(entry.data_4bytes, "");
    }

    #[test]
    fn test_hash_matches_keccak_of_raw_bytes() {
        let raw = sign_eip1559(TxEip1559 {
            chain_id: 1,
            nonce: 99,
            gas_limit: 21_000,
            max_fee_per_gas: 10_000_000_000,
            max_priority_fee_per_gas: 1_000_000_000,
            to: TxKind::Call(TO),
            value: U256::from(1u64),
            access_list: Default::default(),
            input: Bytes::default(),
        });

        let entry = parse_tx(1, &raw).unwrap();
        assert_eq!(entry.hash, format!("0x{}", hex::encode(keccak256(&raw))));
    }

    #[test]
    fn test_decode_rejects_empty_and_garbage_input() {
        assert!(matches!(parse_tx(1, &[]), Err(DecodeError::Empty)));
        assert!(matches!(
            parse_tx(1, &[0xff, 0xff, 0xff, 0xff]),
            Err(DecodeError::Envelope(_))
        ));
    }
}
