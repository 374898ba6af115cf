//! The EVM `exact` scheme, settled through ERC-3009 `transferWithAuthorization`.
//!
//! The scheme payload carried in [`agent402::proto::PaymentPayload::payload`]:
//!
//! ```json
//! {
//!   "signature": "0x…",
//!   "authorization": {
//!     "from": "0x…", "to": "0x…", "value": "10000",
//!     "validAfter": "1740672089", "validBefore": "1740672154",
//!     "nonce": "0xf374…"
//!   }
//! }
//! ```

#[cfg(feature = "client")]
pub mod client;
#[cfg(feature = "facilitator")]
pub mod facilitator;
mod server;

pub use server::*;

use agent402::proto::PaymentRequirements;
use agent402::scheme::{ExactScheme, SchemeId};
use agent402::timestamp::UnixTimestamp;
use alloy_primitives::{Address, B256, Bytes, U256};
use alloy_sol_types::Eip712Domain;
use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, serde_as};

use crate::auth::TransferAuthorization;
use crate::chain::EIP155_NAMESPACE;

/// Identifies the `eip155` / `exact` scheme pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Eip155Exact;

impl SchemeId for Eip155Exact {
    fn namespace(&self) -> &str {
        EIP155_NAMESPACE
    }

    fn scheme(&self) -> &str {
        ExactScheme::VALUE
    }
}

/// Signature plus the authorization it covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExactEvmPayload {
    /// 65-byte EOA signature, or an EIP-1271 contract signature.
    pub signature: Bytes,
    /// The signed fields.
    pub authorization: ExactEvmAuthorization,
}

/// The signed ERC-3009 fields, as they travel on the wire.
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExactEvmAuthorization {
    /// Payer.
    pub from: Address,
    /// Recipient; must equal `payTo`.
    pub to: Address,
    /// Amount in atomic units, as a decimal string.
    #[serde_as(as = "DisplayFromStr")]
    pub value: U256,
    /// Unix seconds the transfer becomes valid.
    pub valid_after: UnixTimestamp,
    /// Unix seconds the transfer stops being valid.
    pub valid_before: UnixTimestamp,
    /// 32-byte nonce.
    pub nonce: B256,
}

impl ExactEvmAuthorization {
    /// Binds the wire fields to a token domain for hashing.
    #[must_use]
    pub const fn bind(&self, domain: Eip712Domain) -> TransferAuthorization {
        TransferAuthorization {
            from: self.from,
            to: self.to,
            value: self.value,
            valid_after: self.valid_after,
            valid_before: self.valid_before,
            nonce: self.nonce,
            domain,
        }
    }
}

impl From<&TransferAuthorization> for ExactEvmAuthorization {
    fn from(value: &TransferAuthorization) -> Self {
        Self {
            from: value.from,
            to: value.to,
            value: value.value,
            valid_after: value.valid_after,
            valid_before: value.valid_before,
            nonce: value.nonce,
        }
    }
}

/// EIP-712 domain hints carried in [`PaymentRequirements::extra`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PaymentRequirementsExtra {
    /// EIP-712 domain name of the token.
    pub name: String,
    /// EIP-712 domain version of the token.
    pub version: String,
}

impl PaymentRequirementsExtra {
    /// Reads the hints, if `extra` has both fields.
    #[must_use]
    pub fn from_requirements(requirements: &PaymentRequirements) -> Option<Self> {
        requirements
            .extra()
            .and_then(|extra| serde_json::from_value(extra.clone()).ok())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_payload_wire_format() {
        let payload: ExactEvmPayload = serde_json::from_value(json!({
            "signature": "0x2d6a7588d6acca505cbf0d9a4a227e0c52c6c34008c8e8986a1283259764173608a2ce6496642e377d6da8dbbf5836e9bd15092f9ecab05ded3d6293af148b571c",
            "authorization": {
                "from": "0x857b06519E91e3A54538791bDbb0E22373e36b66",
                "to": "0x209693Bc6afc0C5328bA36FaF03C514EF312287C",
                "value": "10000",
                "validAfter": "1740672089",
                "validBefore": "1740672154",
                "nonce": "0xf3746613c2d920b5fdabc0856f2aeb2d4f88ee6037b8cc5d04a71a4462f13480"
            }
        }))
        .unwrap();
        assert_eq!(payload.signature.len(), 65);
        assert_eq!(payload.authorization.value, U256::from(10_000u64));
        assert_eq!(payload.authorization.valid_before.as_secs(), 1_740_672_154);

        let back = serde_json::to_value(&payload).unwrap();
        assert_eq!(back["authorization"]["value"], "10000");
        assert_eq!(back["authorization"]["validAfter"], "1740672089");
    }

    #[test]
    fn test_extra_requires_both_fields() {
        let mut requirements = PaymentRequirements {
            scheme: "exact".into(),
            network: "eip155:8453".into(),
            asset: "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913".into(),
            amount: "1".into(),
            pay_to: "0x209693Bc6afc0C5328bA36FaF03C514EF312287C".into(),
            max_timeout_seconds: 60,
            extra: json!({"name": "USD Coin"}),
        };
        assert!(PaymentRequirementsExtra::from_requirements(&requirements).is_none());
        requirements.extra = json!({"name": "USD Coin", "version": "2"});
        assert_eq!(
            PaymentRequirementsExtra::from_requirements(&requirements).unwrap().version,
            "2"
        );
    }
}
