//! Topic naming for published transfer records.

use ethers::types::Address;

use crate::model::TransferTx;

/// Suffix appended to the prefix for records that deploy a contract.
pub const CONTRACT_CREATE_SUFFIX: &str = "ContractCreate";

/// `<prefix><recipient>/<depth>` where the recipient is 40 lowercase hex
/// digits without `0x`.
pub fn address_topic(prefix: &str, recipient: &Address, depth: u64) -> String {
    format!("{prefix}{}/{depth}", hex::encode(recipient.as_bytes()))
}

pub fn contract_create_topic(prefix: &str) -> String {
    format!("{prefix}{CONTRACT_CREATE_SUFFIX}")
}

/// Picks the topic a record lands on for the given confirmation depth.
pub fn topic_for(prefix: &str, tx: &TransferTx, depth: u64) -> String {
    match &tx.to {
        Some(recipient) => address_topic(prefix, recipient, depth),
        None => contract_create_topic(prefix),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::{Bytes, H256, U256};
    use std::str::FromStr;

    fn record(to: Option<Address>) -> TransferTx {
        TransferTx {
            from: Address::repeat_byte(0xaa),
            to,
            value: U256::one(),
            hash: H256::zero(),
            data: Bytes::default(),
            block_number: None,
        }
    }

    #[test]
    fn recipient_topic_is_lowercase_without_prefix() {
        let to = Address::from_str("0xBBbbBBbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbBBBB").unwrap();
        assert_eq!(
            topic_for("notify/", &record(Some(to)), 3),
            "notify/bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb/3"
        );
    }

    #[test]
    fn contract_creation_ignores_depth() {
        assert_eq!(topic_for("n/", &record(None), 7), "n/ContractCreate");
        assert_eq!(topic_for("", &record(None), 1), "ContractCreate");
    }
}
