//! Event records exchanged between the pipelines and the message bus.

use ethers::types::{Address, Bytes, H256, U256, U64};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Canonical transfer representation published on the bus.
///
/// Numeric fields serialize as `0x`-prefixed hex quantities and `data` as
/// `0x`-prefixed hex bytes. `to` is `null` for contract creation and
/// `blockNumber` stays `null` until the record is confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferTx {
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    pub hash: H256,
    #[serde(default)]
    pub data: Bytes,
    #[serde(default)]
    pub block_number: Option<U64>,
}

impl TransferTx {
    pub fn is_contract_creation(&self) -> bool {
        self.to.is_none()
    }

    /// Returns a copy stamped with the block that confirmed it.
    pub fn confirmed_at(&self, block_number: u64) -> Self {
        Self {
            block_number: Some(U64::from(block_number)),
            ..self.clone()
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// Delivery guarantee requested from the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum QualityOfService {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("quality of service must be 0, 1 or 2 (got {0})")]
pub struct InvalidQos(pub u8);

impl TryFrom<u8> for QualityOfService {
    type Error = InvalidQos;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactlyOnce),
            other => Err(InvalidQos(other)),
        }
    }
}

impl From<QualityOfService> for u8 {
    fn from(value: QualityOfService) -> Self {
        match value {
            QualityOfService::AtMostOnce => 0,
            QualityOfService::AtLeastOnce => 1,
            QualityOfService::ExactlyOnce => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TransferTx {
        TransferTx {
            from: Address::repeat_byte(0xaa),
            to: Some(Address::repeat_byte(0xbb)),
            value: U256::from(1000u64),
            hash: H256::repeat_byte(0x11),
            data: Bytes::from(vec![0xde, 0xad]),
            block_number: None,
        }
    }

    #[test]
    fn serializes_numbers_and_bytes_as_hex() {
        let json: serde_json::Value = serde_json::from_slice(&sample().to_json().unwrap()).unwrap();
        assert_eq!(json["value"], "0x3e8");
        assert_eq!(json["data"], "0xdead");
        assert_eq!(
            json["to"],
            "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb"
        );
        assert!(json["blockNumber"].is_null());
    }

    #[test]
    fn confirmed_copy_carries_block_number() {
        let confirmed = sample().confirmed_at(0x10);
        let json: serde_json::Value = serde_json::from_slice(&confirmed.to_json().unwrap()).unwrap();
        assert_eq!(json["blockNumber"], "0x10");
        assert_eq!(confirmed.hash, sample().hash);
    }

    #[test]
    fn decodes_records_without_optional_fields() {
        let payload = br#"{
            "from": "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
            "to": null,
            "value": "0x0",
            "hash": "0x1111111111111111111111111111111111111111111111111111111111111111"
        }"#;
        let tx = TransferTx::from_json(payload).expect("decodes");
        assert!(tx.is_contract_creation());
        assert!(tx.data.is_empty());
        assert_eq!(tx.block_number, None);
    }

    #[test]
    fn qos_rejects_out_of_range_levels() {
        assert_eq!(QualityOfService::try_from(2), Ok(QualityOfService::ExactlyOnce));
        assert_eq!(QualityOfService::try_from(3), Err(InvalidQos(3)));
        assert_eq!(u8::from(QualityOfService::AtMostOnce), 0);
    }
}
