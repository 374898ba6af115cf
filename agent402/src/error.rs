//! Error taxonomy for payment operations.
//!
//! Every fallible negotiation, verification, settlement and policy step reports
//! one [`PaymentError`]. Each variant carries a stable snake_case
//! [`PaymentError::reason`] that is forwarded verbatim to HTTP callers.

use std::fmt;

use crate::proto::ErrorReason;

/// Base error type for payment operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PaymentError {
    /// No implementation is registered for the network at all.
    #[error("Unsupported network '{network}'")]
    UnsupportedNetwork {
        /// The requested network.
        network: String,
    },

    /// The network is known but not with this scheme.
    #[error("{0}")]
    UnsupportedScheme(#[from] SchemeNotFoundError),

    /// No accepted requirement is covered by a registered scheme.
    #[error("No payment requirements match registered schemes")]
    NoMatchingRequirements,

    /// A client policy filtered the candidate list down to nothing.
    #[error("Payment policy #{index} filtered out every payment requirement")]
    PolicyExhausted {
        /// Zero-based position of the policy in registration order.
        index: usize,
    },

    /// The payment header or body could not be decoded.
    #[error("Invalid payment payload: {0}")]
    InvalidPaymentPayload(String),

    /// Bad signature, expired authorization, insufficient funds, and so on.
    #[error("Verification failed: {0}")]
    VerificationFailed(#[from] VerifyError),

    /// The ledger rejected the settlement, including duplicate nonces.
    #[error("Settlement failed: {0}")]
    SettlementFailed(#[from] SettleError),

    /// The sender is blocked or a payment limit would be exceeded.
    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    /// A delegation credential targets a different contract than configured.
    #[error("Authorization targets {actual}, expected {expected}")]
    AuthorizationAddressMismatch {
        /// The configured delegate contract.
        expected: String,
        /// The contract named in the authorization.
        actual: String,
    },

    /// A lifecycle hook aborted the operation.
    #[error("Payment aborted: {reason}")]
    Aborted {
        /// Machine-readable abort reason.
        reason: String,
        /// Optional human-readable details.
        message: Option<String>,
    },
}

impl PaymentError {
    /// Machine-readable reason for this error.
    ///
    /// Verification and settlement failures report the reason produced by the
    /// mechanism (e.g. `invalid_payment_expired`, `nonce_already_used`).
    #[must_use]
    pub fn reason(&self) -> &str {
        match self {
            Self::UnsupportedNetwork { .. } => "unsupported_network",
            Self::UnsupportedScheme(_) => "unsupported_scheme",
            Self::NoMatchingRequirements => "no_matching_requirements",
            Self::PolicyExhausted { .. } => "policy_exhausted",
            Self::InvalidPaymentPayload(_) => "invalid_payment_payload",
            Self::VerificationFailed(e) => &e.invalid_reason,
            Self::SettlementFailed(e) => &e.error_reason,
            Self::PolicyViolation(_) => ErrorReason::PolicyViolation.as_str(),
            Self::AuthorizationAddressMismatch { .. } => "authorization_address_mismatch",
            Self::Aborted { reason, .. } => reason,
        }
    }

    /// Shorthand for [`Self::VerificationFailed`] with the generic reason.
    ///
    /// Used for transport failures so network details never reach the caller.
    #[must_use]
    pub fn verification_unexpected(message: impl Into<String>) -> Self {
        Self::VerificationFailed(
            VerifyError::new(ErrorReason::UnexpectedError.as_str()).with_message(message),
        )
    }

    /// Shorthand for [`Self::SettlementFailed`] with the generic reason.
    #[must_use]
    pub fn settlement_unexpected(message: impl Into<String>) -> Self {
        Self::SettlementFailed(
            SettleError::new(ErrorReason::UnexpectedError.as_str()).with_message(message),
        )
    }
}

/// Error during payment verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyError {
    /// Machine-readable reason for the error.
    pub invalid_reason: String,
    /// Human-readable message for the error.
    pub invalid_message: Option<String>,
    /// The payer's address (if known).
    pub payer: Option<String>,
}

impl VerifyError {
    /// Creates a new verification error.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            invalid_reason: reason.into(),
            invalid_message: None,
            payer: None,
        }
    }

    /// Sets the human-readable message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.invalid_message = Some(message.into());
        self
    }

    /// Sets the payer address.
    #[must_use]
    pub fn with_payer(mut self, payer: impl Into<String>) -> Self {
        self.payer = Some(payer.into());
        self
    }
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(msg) = &self.invalid_message {
            write!(f, "{}: {}", self.invalid_reason, msg)
        } else {
            write!(f, "{}", self.invalid_reason)
        }
    }
}

impl std::error::Error for VerifyError {}

/// Error during payment settlement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettleError {
    /// Machine-readable reason for the error.
    pub error_reason: String,
    /// Human-readable message for the error.
    pub error_message: Option<String>,
    /// Transaction hash, if one was submitted.
    pub transaction: Option<String>,
    /// The payer's address (if known).
    pub payer: Option<String>,
}

impl SettleError {
    /// Creates a new settlement error.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            error_reason: reason.into(),
            error_message: None,
            transaction: None,
            payer: None,
        }
    }

    /// Sets the human-readable message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    /// Sets the transaction hash.
    #[must_use]
    pub fn with_transaction(mut self, tx: impl Into<String>) -> Self {
        self.transaction = Some(tx.into());
        self
    }

    /// Sets the payer address.
    #[must_use]
    pub fn with_payer(mut self, payer: impl Into<String>) -> Self {
        self.payer = Some(payer.into());
        self
    }

    /// `true` when the failure came from the transport rather than the ledger.
    #[must_use]
    pub fn is_unexpected(&self) -> bool {
        self.error_reason == ErrorReason::UnexpectedError.as_str()
    }
}

impl fmt::Display for SettleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(msg) = &self.error_message {
            write!(f, "{}: {}", self.error_reason, msg)
        } else {
            write!(f, "{}", self.error_reason)
        }
    }
}

impl std::error::Error for SettleError {}

/// No registered scheme found for scheme/network combination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemeNotFoundError {
    /// The requested scheme.
    pub scheme: String,
    /// The requested network.
    pub network: String,
}

impl SchemeNotFoundError {
    /// Creates a new scheme-not-found error.
    #[must_use]
    pub fn new(scheme: impl Into<String>, network: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            network: network.into(),
        }
    }
}

impl fmt::Display for SchemeNotFoundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "No scheme '{}' registered for network '{}'",
            self.scheme, self.network
        )
    }
}

impl std::error::Error for SchemeNotFoundError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reasons_are_stable() {
        assert_eq!(
            PaymentError::NoMatchingRequirements.reason(),
            "no_matching_requirements"
        );
        assert_eq!(
            PaymentError::PolicyExhausted { index: 0 }.reason(),
            "policy_exhausted"
        );
        let expired = PaymentError::from(VerifyError::new("invalid_payment_expired"));
        assert_eq!(expired.reason(), "invalid_payment_expired");
        let dup = PaymentError::from(SettleError::new("nonce_already_used").with_payer("0xabc"));
        assert_eq!(dup.reason(), "nonce_already_used");
    }

    #[test]
    fn test_unexpected_helpers_hide_transport_details() {
        let err = PaymentError::settlement_unexpected("connection reset");
        assert_eq!(err.reason(), "unexpected_error");
        assert!(matches!(err, PaymentError::SettlementFailed(ref e) if e.is_unexpected()));
    }

    #[test]
    fn test_display() {
        let err = PaymentError::from(SchemeNotFoundError::new("exact", "solana:mainnet"));
        assert_eq!(
            err.to_string(),
            "No scheme 'exact' registered for network 'solana:mainnet'"
        );
    }
}
