//! Wire format types.
//!
//! - [`v2`] - Challenge, payload and request bodies
//! - [`SupportedResponse`] - What a facilitator can verify and settle
//! - [`VerifyResponse`] / [`SettleResponse`] - Terminal outcomes of the facilitator contract
//! - [`SettlementStatus`] - Whether an authorization has already been settled
//! - [`PaymentVerificationError`] / [`ErrorReason`] - Why a payment was rejected
//!
//! All types serialize to JSON using camelCase field names.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_with::{VecSkipError, serde_as};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::chain::ChainId;

pub mod v2;

pub use v2::{
    PaymentPayload, PaymentRequired, PaymentRequirements, ResourceInfo, SettleRequest,
    VerifyRequest,
};

/// Extension data keyed by extension name.
pub type Extensions = HashMap<String, serde_json::Value>;

/// One `(version, scheme, network)` triple a facilitator accepts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportedPaymentKind {
    /// Protocol version.
    pub x402_version: u32,
    /// Payment scheme.
    pub scheme: String,
    /// The network or network pattern (e.g., `eip155:8453`, `eip155:*`).
    pub network: String,
    /// Scheme-specific details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

/// Response of `GET /supported`.
#[serde_as]
#[derive(Clone, Default, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportedResponse {
    /// Supported payment kinds, each tagged with its protocol version.
    #[serde_as(as = "VecSkipError<_>")]
    pub kinds: Vec<SupportedPaymentKind>,
    /// Enabled protocol extensions.
    #[serde(default)]
    pub extensions: Vec<String>,
    /// Signer addresses keyed by CAIP-2 chain id or pattern (`eip155:*`).
    #[serde(default)]
    pub signers: HashMap<String, Vec<String>>,
}

impl SupportedResponse {
    /// Groups kinds by protocol version, keyed by the version as a string.
    #[must_use]
    pub fn kinds_by_version(&self) -> BTreeMap<String, Vec<&SupportedPaymentKind>> {
        let mut grouped: BTreeMap<String, Vec<&SupportedPaymentKind>> = BTreeMap::new();
        for kind in &self.kinds {
            grouped
                .entry(kind.x402_version.to_string())
                .or_default()
                .push(kind);
        }
        grouped
    }

    /// Finds signer addresses for the given chain, checking both the exact
    /// key and the namespace wildcard.
    #[must_use]
    pub fn signers_for_chain(&self, chain_id: &ChainId) -> Vec<&str> {
        [chain_id.to_string(), chain_id.family()]
            .iter()
            .filter_map(|key| self.signers.get(key))
            .flat_map(|addrs| addrs.iter().map(String::as_str))
            .collect()
    }

    /// Merges another response into this one, deduplicating signers and extensions.
    pub fn merge(&mut self, mut other: Self) {
        self.kinds.append(&mut other.kinds);
        self.extensions.append(&mut other.extensions);
        for (family, addrs) in other.signers {
            self.signers.entry(family).or_default().extend(addrs);
        }
        for addrs in self.signers.values_mut() {
            addrs.sort_unstable();
            addrs.dedup();
        }
        self.extensions.sort_unstable();
        self.extensions.dedup();
    }
}

/// Outcome of verifying a payment.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum VerifyResponse {
    /// Accepted; `payer` is the recovered sender.
    Valid {
        /// The recovered sender.
        payer: String,
    },
    /// Rejected; `reason` is an [`ErrorReason`] string or a mechanism-specific one.
    Invalid {
        /// Machine-readable reason.
        reason: String,
        /// Human-readable details.
        message: Option<String>,
        /// The sender, when it could be recovered.
        payer: Option<String>,
    },
}

impl VerifyResponse {
    /// Acceptance for `payer`.
    #[must_use]
    pub const fn valid(payer: String) -> Self {
        Self::Valid { payer }
    }

    /// Rejection without a message.
    #[must_use]
    pub const fn invalid(payer: Option<String>, reason: String) -> Self {
        Self::Invalid {
            reason,
            message: None,
            payer,
        }
    }

    /// Rejection with details.
    #[must_use]
    pub const fn invalid_with_message(
        payer: Option<String>,
        reason: String,
        message: String,
    ) -> Self {
        Self::Invalid {
            reason,
            message: Some(message),
            payer,
        }
    }

    /// Whether the payment was accepted.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        matches!(self, Self::Valid { .. })
    }

    /// The payer, when known.
    #[must_use]
    pub fn payer(&self) -> Option<&str> {
        match self {
            Self::Valid { payer } => Some(payer),
            Self::Invalid { payer, .. } => payer.as_deref(),
        }
    }
}

impl From<PaymentVerificationError> for VerifyResponse {
    fn from(err: PaymentVerificationError) -> Self {
        Self::invalid_with_message(None, err.reason().to_string(), err.to_string())
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyResponseWire {
    is_valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    invalid_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    invalid_message: Option<String>,
}

impl Serialize for VerifyResponse {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let wire = match self {
            Self::Valid { payer } => VerifyResponseWire {
                is_valid: true,
                payer: Some(payer.clone()),
                invalid_reason: None,
                invalid_message: None,
            },
            Self::Invalid {
                reason,
                message,
                payer,
            } => VerifyResponseWire {
                is_valid: false,
                payer: payer.clone(),
                invalid_reason: Some(reason.clone()),
                invalid_message: message.clone(),
            },
        };
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for VerifyResponse {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let wire = VerifyResponseWire::deserialize(deserializer)?;
        if wire.is_valid {
            let payer = wire
                .payer
                .ok_or_else(|| serde::de::Error::missing_field("payer"))?;
            Ok(Self::Valid { payer })
        } else {
            let reason = wire
                .invalid_reason
                .ok_or_else(|| serde::de::Error::missing_field("invalidReason"))?;
            Ok(Self::Invalid {
                reason,
                message: wire.invalid_message,
                payer: wire.payer,
            })
        }
    }
}

/// Outcome of settling a payment.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SettleResponse {
    /// Settlement succeeded.
    Success {
        /// The address that paid.
        payer: String,
        /// The on-chain transaction hash.
        transaction: String,
        /// The network where settlement occurred.
        network: String,
        /// Optional protocol extensions returned by the facilitator.
        extensions: Option<Extensions>,
    },
    /// Settlement failed.
    Error {
        /// Machine-readable reason for failure.
        reason: String,
        /// Optional human-readable description of the failure.
        message: Option<String>,
        /// The payer, when known.
        payer: Option<String>,
        /// The network where settlement was attempted.
        network: String,
    },
}

impl SettleResponse {
    /// Whether settlement succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// The payer, when known.
    #[must_use]
    pub fn payer(&self) -> Option<&str> {
        match self {
            Self::Success { payer, .. } => Some(payer),
            Self::Error { payer, .. } => payer.as_deref(),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettleResponseWire {
    success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payer: Option<String>,
    #[serde(default)]
    transaction: String,
    network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    extensions: Option<Extensions>,
}

impl Serialize for SettleResponse {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let wire = match self {
            Self::Success {
                payer,
                transaction,
                network,
                extensions,
            } => SettleResponseWire {
                success: true,
                error_reason: None,
                error_message: None,
                payer: Some(payer.clone()),
                transaction: transaction.clone(),
                network: network.clone(),
                extensions: extensions.clone(),
            },
            Self::Error {
                reason,
                message,
                payer,
                network,
            } => SettleResponseWire {
                success: false,
                error_reason: Some(reason.clone()),
                error_message: message.clone(),
                payer: payer.clone(),
                transaction: String::new(),
                network: network.clone(),
                extensions: None,
            },
        };
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SettleResponse {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let wire = SettleResponseWire::deserialize(deserializer)?;
        if wire.success {
            let payer = wire
                .payer
                .ok_or_else(|| serde::de::Error::missing_field("payer"))?;
            if wire.transaction.is_empty() {
                return Err(serde::de::Error::missing_field("transaction"));
            }
            Ok(Self::Success {
                payer,
                transaction: wire.transaction,
                network: wire.network,
                extensions: wire.extensions,
            })
        } else {
            let reason = wire
                .error_reason
                .ok_or_else(|| serde::de::Error::missing_field("errorReason"))?;
            Ok(Self::Error {
                reason,
                message: wire.error_message,
                payer: wire.payer,
                network: wire.network,
            })
        }
    }
}

/// Whether a payment authorization has already landed on-chain.
///
/// Answers `POST /settlement-status`, letting a resource server that lost a
/// settle response find out whether the charge went through before retrying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementStatus {
    /// `true` once the authorization nonce is consumed.
    pub settled: bool,
    /// The payer the authorization belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
    /// Settlement transaction hash, when the facilitator knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
    /// The network that was queried.
    pub network: String,
}

/// Errors that can occur during payment verification.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PaymentVerificationError {
    /// The payment payload format is invalid or malformed.
    #[error("Invalid format: {0}")]
    InvalidFormat(String),
    /// The payment amount doesn't match the requirements.
    #[error("Payment amount is invalid with respect to the payment requirements")]
    InvalidPaymentAmount,
    /// The payment authorization's `validAfter` timestamp is in the future.
    #[error("Payment authorization is not yet valid")]
    Early,
    /// The payment authorization's `validBefore` timestamp has passed.
    #[error("Payment authorization is expired")]
    Expired,
    /// The payment's chain ID doesn't match the requirements.
    #[error("Payment chain id is invalid with respect to the payment requirements")]
    ChainIdMismatch,
    /// The payment recipient doesn't match the requirements.
    #[error("Payment recipient is invalid with respect to the payment requirements")]
    RecipientMismatch,
    /// The payment asset (token) doesn't match the requirements.
    #[error("Payment asset is invalid with respect to the payment requirements")]
    AssetMismatch,
    /// The payer's on-chain balance is insufficient.
    #[error("Onchain balance is not enough to cover the payment amount")]
    InsufficientFunds,
    /// The payment signature is invalid.
    #[error("{0}")]
    InvalidSignature(String),
    /// The authorization nonce was already consumed on-chain.
    #[error("Authorization nonce has already been used")]
    NonceAlreadyUsed,
    /// The chain is not supported by this facilitator.
    #[error("Unsupported chain")]
    UnsupportedChain,
    /// The payment scheme is not supported by this facilitator.
    #[error("Unsupported scheme")]
    UnsupportedScheme,
    /// The accepted payment details don't match the requirements.
    #[error("Accepted does not match payment requirements")]
    AcceptedRequirementsMismatch,
}

impl PaymentVerificationError {
    /// Machine-readable reason code.
    #[must_use]
    pub const fn reason(&self) -> ErrorReason {
        match self {
            Self::InvalidFormat(_) => ErrorReason::InvalidFormat,
            Self::InvalidPaymentAmount => ErrorReason::InvalidPaymentAmount,
            Self::InsufficientFunds => ErrorReason::InsufficientFunds,
            Self::Early => ErrorReason::InvalidPaymentEarly,
            Self::Expired => ErrorReason::InvalidPaymentExpired,
            Self::ChainIdMismatch => ErrorReason::ChainIdMismatch,
            Self::RecipientMismatch => ErrorReason::RecipientMismatch,
            Self::AssetMismatch => ErrorReason::AssetMismatch,
            Self::InvalidSignature(_) => ErrorReason::InvalidSignature,
            Self::NonceAlreadyUsed => ErrorReason::NonceAlreadyUsed,
            Self::UnsupportedChain => ErrorReason::UnsupportedChain,
            Self::UnsupportedScheme => ErrorReason::UnsupportedScheme,
            Self::AcceptedRequirementsMismatch => ErrorReason::AcceptedRequirementsMismatch,
        }
    }
}

impl From<serde_json::Error> for PaymentVerificationError {
    fn from(value: serde_json::Error) -> Self {
        Self::InvalidFormat(value.to_string())
    }
}

/// Machine-readable reason codes carried in `invalidReason` / `errorReason`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ErrorReason {
    /// The payment payload format is invalid.
    InvalidFormat,
    /// The payment amount is incorrect.
    InvalidPaymentAmount,
    /// The payment authorization is not yet valid.
    InvalidPaymentEarly,
    /// The payment authorization has expired.
    InvalidPaymentExpired,
    /// The chain ID doesn't match.
    ChainIdMismatch,
    /// The recipient address doesn't match.
    RecipientMismatch,
    /// The token asset doesn't match.
    AssetMismatch,
    /// The accepted details don't match requirements.
    AcceptedRequirementsMismatch,
    /// The signature is invalid.
    InvalidSignature,
    /// Insufficient on-chain balance.
    InsufficientFunds,
    /// The authorization nonce was already used.
    NonceAlreadyUsed,
    /// The chain is not supported.
    UnsupportedChain,
    /// The scheme is not supported.
    UnsupportedScheme,
    /// The settlement transaction reverted.
    TransactionReverted,
    /// A payment policy rejected the sender or the amount.
    PolicyViolation,
    /// An unexpected error occurred.
    UnexpectedError,
}

impl ErrorReason {
    /// The snake_case wire string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidFormat => "invalid_format",
            Self::InvalidPaymentAmount => "invalid_payment_amount",
            Self::InvalidPaymentEarly => "invalid_payment_early",
            Self::InvalidPaymentExpired => "invalid_payment_expired",
            Self::ChainIdMismatch => "chain_id_mismatch",
            Self::RecipientMismatch => "recipient_mismatch",
            Self::AssetMismatch => "asset_mismatch",
            Self::AcceptedRequirementsMismatch => "accepted_requirements_mismatch",
            Self::InvalidSignature => "invalid_signature",
            Self::InsufficientFunds => "insufficient_funds",
            Self::NonceAlreadyUsed => "nonce_already_used",
            Self::UnsupportedChain => "unsupported_chain",
            Self::UnsupportedScheme => "unsupported_scheme",
            Self::TransactionReverted => "transaction_reverted",
            Self::PolicyViolation => "policy_violation",
            Self::UnexpectedError => "unexpected_error",
        }
    }
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_verify_response_wire() {
        let valid = serde_json::to_value(VerifyResponse::valid("0xabc".into())).unwrap();
        assert_eq!(valid, json!({"isValid": true, "payer": "0xabc"}));

        let invalid: VerifyResponse = serde_json::from_value(json!({
            "isValid": false,
            "invalidReason": "invalid_payment_expired"
        }))
        .unwrap();
        assert!(!invalid.is_valid());
        assert!(matches!(
            invalid,
            VerifyResponse::Invalid { ref reason, .. } if reason == "invalid_payment_expired"
        ));
    }

    #[test]
    fn test_settle_error_keeps_payer() {
        let response = SettleResponse::Error {
            reason: ErrorReason::NonceAlreadyUsed.to_string(),
            message: None,
            payer: Some("0xabc".into()),
            network: "eip155:8453".into(),
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["errorReason"], "nonce_already_used");
        assert_eq!(value["payer"], "0xabc");
        assert_eq!(value["transaction"], "");
        let back: SettleResponse = serde_json::from_value(value).unwrap();
        assert_eq!(back, response);
    }

    #[test]
    fn test_settle_success_requires_transaction() {
        let result: Result<SettleResponse, _> = serde_json::from_value(json!({
            "success": true,
            "payer": "0xabc",
            "network": "eip155:8453"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_error_reason_strings_match_serde() {
        for reason in [
            ErrorReason::InvalidPaymentExpired,
            ErrorReason::NonceAlreadyUsed,
            ErrorReason::PolicyViolation,
        ] {
            let json = serde_json::to_value(reason).unwrap();
            assert_eq!(json, json!(reason.as_str()));
        }
    }

    #[test]
    fn test_supported_grouping_and_signers() {
        let mut supported = SupportedResponse {
            kinds: vec![SupportedPaymentKind {
                x402_version: 2,
                scheme: "exact".into(),
                network: "eip155:8453".into(),
                extra: None,
            }],
            extensions: vec![],
            signers: HashMap::from([("eip155:*".into(), vec!["0xb".into()])]),
        };
        supported.merge(SupportedResponse {
            kinds: vec![SupportedPaymentKind {
                x402_version: 1,
                scheme: "exact".into(),
                network: "eip155:84532".into(),
                extra: None,
            }],
            extensions: vec!["identity".into()],
            signers: HashMap::from([("eip155:*".into(), vec!["0xa".into(), "0xb".into()])]),
        });
        let grouped = supported.kinds_by_version();
        assert_eq!(grouped["1"].len(), 1);
        assert_eq!(grouped["2"].len(), 1);
        assert_eq!(
            supported.signers_for_chain(&ChainId::new("eip155", "8453")),
            vec!["0xa", "0xb"]
        );
        assert_eq!(supported.extensions, vec!["identity".to_owned()]);
    }
}
