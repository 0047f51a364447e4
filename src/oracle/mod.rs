//! Chain Oracle: evidence that an on-chain action actually happened.
//!
//! The service asks for a transaction receipt before mirroring a lifecycle
//! action locally. A receipt only counts when [`ReceiptPolicy`] ties it to
//! the agreement's `on_chain_id` (and, when configured, to the escrow
//! contract and the action's event). The lifecycle engine itself never talks
//! to the chain.

mod rpc;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agreement::{ActionKind, Address, Guard};
use crate::error::OracleError;

pub use rpc::JsonRpcOracle;

/// Hex digits in a 32-byte word (transaction hash, log topic) after `0x`.
const WORD_HEX_LEN: usize = 64;

/// Parse a `0x`-prefixed 32-byte word, lowercased.
pub fn parse_word(raw: &str) -> Option<String> {
    let digits = raw.strip_prefix("0x")?;
    if digits.len() == WORD_HEX_LEN && digits.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(format!("0x{}", digits.to_ascii_lowercase()))
    } else {
        None
    }
}

/// The log topic an `indexed uint256` agreement id is encoded as.
pub fn agreement_topic(on_chain_id: u64) -> String {
    format!("0x{on_chain_id:064x}")
}

/// A `0x`-prefixed 32-byte transaction hash, kept lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TxHash(String);

impl TxHash {
    pub fn parse(raw: &str) -> Option<Self> {
        parse_word(raw).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One event log from a receipt. Addresses and topics are lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptLog {
    pub address: String,
    pub topics: Vec<String>,
}

/// The parts of a transaction receipt the service relies on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub transaction_hash: String,
    pub block_number: Option<u64>,
    /// `false` when the transaction was mined but reverted.
    pub succeeded: bool,
    /// Called contract, lowercase. `None` for contract creations.
    pub to: Option<String>,
    pub logs: Vec<ReceiptLog>,
}

/// What a receipt must show to authorize one action on one agreement.
///
/// A log must carry the agreement's `on_chain_id` as an indexed topic after
/// the event signature. With `contract` set, the transaction must call it and
/// the log must come from it. With an entry in `event_topics`, the log's
/// signature topic must match the action's event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiptPolicy {
    pub contract: Option<Address>,
    pub event_topics: HashMap<ActionKind, String>,
}

impl ReceiptPolicy {
    pub fn check(
        &self,
        receipt: &Receipt,
        on_chain_id: u64,
        action: ActionKind,
    ) -> Result<(), Guard> {
        if !receipt.succeeded {
            return Err(Guard::ReceiptNotSuccessful);
        }

        let contract = self.contract.as_ref().map(Address::as_str);
        if contract.is_some_and(|contract| receipt.to.as_deref() != Some(contract)) {
            return Err(Guard::ReceiptMismatch);
        }

        let id_topic = agreement_topic(on_chain_id);
        let signature = self.event_topics.get(&action);
        let correlated = receipt.logs.iter().any(|log| {
            contract.is_none_or(|contract| log.address == contract)
                && signature.is_none_or(|signature| log.topics.first() == Some(signature))
                && log.topics.iter().skip(1).any(|topic| *topic == id_topic)
        });

        if correlated {
            Ok(())
        } else {
            Err(Guard::ReceiptMismatch)
        }
    }
}

#[async_trait]
pub trait ChainOracle: Send + Sync {
    /// `Ok(None)` when the chain does not know the transaction (yet).
    async fn receipt(&self, tx_hash: &TxHash) -> Result<Option<Receipt>, OracleError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTRACT: &str = "0x5fbdb2315678afecb367f032d93f642f64180aa3";

    fn signature(byte: &str) -> String {
        format!("0x{}", byte.repeat(32))
    }

    fn receipt(to: &str, log_address: &str, topics: Vec<String>) -> Receipt {
        Receipt {
            transaction_hash: signature("aa"),
            block_number: Some(7),
            succeeded: true,
            to: Some(to.to_string()),
            logs: vec![ReceiptLog {
                address: log_address.to_string(),
                topics,
            }],
        }
    }

    fn strict_policy() -> ReceiptPolicy {
        ReceiptPolicy {
            contract: Some(Address::parse(CONTRACT).unwrap()),
            event_topics: HashMap::from([(ActionKind::Confirm, signature("c1"))]),
        }
    }

    #[test]
    fn agreement_topic_is_a_padded_word() {
        assert_eq!(agreement_topic(255), format!("0x{}ff", "0".repeat(62)));
        assert!(parse_word(&agreement_topic(u64::MAX)).is_some());
    }

    #[test]
    fn receipt_must_carry_the_agreement_id() {
        let policy = ReceiptPolicy::default();
        let matching = receipt(CONTRACT, CONTRACT, vec![signature("c1"), agreement_topic(40)]);
        assert_eq!(policy.check(&matching, 40, ActionKind::Confirm), Ok(()));
        assert_eq!(
            policy.check(&matching, 41, ActionKind::Confirm),
            Err(Guard::ReceiptMismatch)
        );

        // The signature slot never counts as the agreement id.
        let id_as_signature = receipt(CONTRACT, CONTRACT, vec![agreement_topic(40)]);
        assert_eq!(
            policy.check(&id_as_signature, 40, ActionKind::Confirm),
            Err(Guard::ReceiptMismatch)
        );
    }

    #[test]
    fn contract_and_event_signature_are_enforced_when_configured() {
        let policy = strict_policy();
        let topics = vec![signature("c1"), agreement_topic(9)];

        let good = receipt(CONTRACT, CONTRACT, topics.clone());
        assert_eq!(policy.check(&good, 9, ActionKind::Confirm), Ok(()));
        // No signature configured for disputes, so any event with the id passes.
        assert_eq!(policy.check(&good, 9, ActionKind::RaiseDispute), Ok(()));

        let other_contract = "0x9999999999999999999999999999999999999999";
        let wrong_target = receipt(other_contract, CONTRACT, topics.clone());
        assert_eq!(
            policy.check(&wrong_target, 9, ActionKind::Confirm),
            Err(Guard::ReceiptMismatch)
        );
        let wrong_emitter = receipt(CONTRACT, other_contract, topics);
        assert_eq!(
            policy.check(&wrong_emitter, 9, ActionKind::Confirm),
            Err(Guard::ReceiptMismatch)
        );

        let wrong_event = receipt(CONTRACT, CONTRACT, vec![signature("d2"), agreement_topic(9)]);
        assert_eq!(
            policy.check(&wrong_event, 9, ActionKind::Confirm),
            Err(Guard::ReceiptMismatch)
        );
    }

    #[test]
    fn reverted_receipt_fails_before_correlation() {
        let mut reverted = receipt(CONTRACT, CONTRACT, vec![signature("c1"), agreement_topic(1)]);
        reverted.succeeded = false;
        assert_eq!(
            ReceiptPolicy::default().check(&reverted, 1, ActionKind::Confirm),
            Err(Guard::ReceiptNotSuccessful)
        );
    }

    #[test]
    fn tx_hash_requires_64_hex_digits() {
        let raw = format!("0x{}", "AB".repeat(32));
        let hash = TxHash::parse(&raw).unwrap();
        assert_eq!(hash.as_str(), format!("0x{}", "ab".repeat(32)));

        assert!(TxHash::parse("0x1234").is_none());
        assert!(TxHash::parse(&"ab".repeat(32)).is_none());
        assert!(TxHash::parse(&format!("0x{}", "zz".repeat(32))).is_none());
    }
}
