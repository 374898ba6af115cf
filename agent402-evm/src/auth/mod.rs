//! Signed authorizations.
//!
//! Two primitives share one contract, [`AuthorizationCodec`]:
//!
//! - [`TransferAuthorization`] moves tokens through ERC-3009
//!   `transferWithAuthorization`. Its digest is the EIP-712 typed-data hash.
//! - [`FeedbackAuthorization`] lets a client post feedback about an agent in
//!   the identity registry. Its digest is `keccak256(message)` wrapped with
//!   the EIP-191 personal-message prefix.
//!
//! The message is always the ABI encoding of the fields in declaration order.
//! Where an authorization travels as one blob, the 65-byte signature is
//! appended to the message ([`encode_with_signature`]).

mod feedback;
mod transfer;

pub use feedback::*;
pub use transfer::*;

use agent402::proto::PaymentVerificationError;
use agent402::timestamp::UnixTimestamp;
use alloy_primitives::{Address, B256, Bytes, Signature, SignatureError};

/// Length of an `r || s || v` signature.
pub const SIGNATURE_LENGTH: usize = 65;

/// Why an authorization was rejected.
#[derive(Debug, thiserror::Error)]
pub enum AuthorizationError {
    /// The window has not opened yet.
    #[error("authorization is not valid until {valid_after}")]
    NotYetValid {
        /// When the window opens.
        valid_after: UnixTimestamp,
    },
    /// The window has closed.
    #[error("authorization expired at {valid_before}")]
    Expired {
        /// When the window closed.
        valid_before: UnixTimestamp,
    },
    /// The signature recovers to someone else.
    #[error("signed by {recovered}, expected {expected}")]
    SignerMismatch {
        /// The claimed signer.
        expected: Address,
        /// The address the signature recovers to.
        recovered: Address,
    },
    /// The signature bytes are not a valid ECDSA signature.
    #[error("malformed signature: {0}")]
    Signature(#[from] SignatureError),
    /// Fewer bytes than a signature.
    #[error("encoded authorization is {0} bytes, too short to hold a signature")]
    TooShort(usize),
    /// The named field overflows `u64`.
    #[error("{0} does not fit in 64 bits")]
    OutOfRange(&'static str),
    /// The message is not valid ABI.
    #[error("cannot decode authorization: {0}")]
    Decode(#[from] alloy_sol_types::Error),
    /// The signer refused or failed.
    #[cfg(feature = "client")]
    #[error("signing failed: {0}")]
    Signing(#[from] alloy_signer::Error),
}

impl From<AuthorizationError> for PaymentVerificationError {
    fn from(value: AuthorizationError) -> Self {
        match value {
            AuthorizationError::NotYetValid { .. } => Self::Early,
            AuthorizationError::Expired { .. } => Self::Expired,
            AuthorizationError::TooShort(_)
            | AuthorizationError::OutOfRange(_)
            | AuthorizationError::Decode(_) => {
                Self::InvalidFormat(value.to_string())
            }
            other => Self::InvalidSignature(other.to_string()),
        }
    }
}

/// Deterministic encoding, hashing and verification of one authorization.
pub trait AuthorizationCodec {
    /// ABI encoding of the fields, in their fixed order.
    fn message(&self) -> Vec<u8>;

    /// The 32-byte digest that is signed.
    fn digest(&self) -> B256;

    /// Who must have signed.
    fn expected_signer(&self) -> Address;

    /// Earliest moment the authorization may be used, if bounded.
    fn valid_after(&self) -> Option<UnixTimestamp> {
        None
    }

    /// The authorization is unusable at and after this moment.
    fn valid_before(&self) -> UnixTimestamp;

    /// Checks the validity window against `now`.
    ///
    /// # Errors
    ///
    /// [`AuthorizationError::NotYetValid`] if `valid_after > now`,
    /// [`AuthorizationError::Expired`] if `valid_before <= now`.
    fn check_window(&self, now: UnixTimestamp) -> Result<(), AuthorizationError> {
        if let Some(valid_after) = self.valid_after()
            && valid_after > now
        {
            return Err(AuthorizationError::NotYetValid { valid_after });
        }
        let valid_before = self.valid_before();
        if valid_before <= now {
            return Err(AuthorizationError::Expired { valid_before });
        }
        Ok(())
    }

    /// Window check, then signer recovery against [`Self::expected_signer`].
    ///
    /// # Errors
    ///
    /// Returns the first failing check.
    fn verify(&self, signature: &Signature, now: UnixTimestamp) -> Result<(), AuthorizationError> {
        self.check_window(now)?;
        let recovered = recover_signer(&self.digest(), signature)?;
        let expected = self.expected_signer();
        if recovered == expected {
            Ok(())
        } else {
            Err(AuthorizationError::SignerMismatch { expected, recovered })
        }
    }
}

/// Recovers the address that signed `digest`.
///
/// # Errors
///
/// Returns an error if the signature is not a valid secp256k1 signature.
pub fn recover_signer(digest: &B256, signature: &Signature) -> Result<Address, AuthorizationError> {
    Ok(signature.recover_address_from_prehash(digest)?)
}

/// `message || r || s || v`, the layout on-chain parsers expect.
#[must_use]
pub fn encode_with_signature(message: &[u8], signature: &Signature) -> Bytes {
    let mut out = Vec::with_capacity(message.len() + SIGNATURE_LENGTH);
    out.extend_from_slice(message);
    out.extend_from_slice(&signature.as_bytes());
    out.into()
}

/// Splits a blob produced by [`encode_with_signature`].
///
/// # Errors
///
/// Fails if the blob is shorter than a signature or the trailing bytes do not
/// parse as one.
pub fn split_signature(encoded: &[u8]) -> Result<(&[u8], Signature), AuthorizationError> {
    let split = encoded
        .len()
        .checked_sub(SIGNATURE_LENGTH)
        .ok_or(AuthorizationError::TooShort(encoded.len()))?;
    let (message, raw) = encoded.split_at(split);
    Ok((message, Signature::from_raw(raw)?))
}

/// Signs the codec's digest.
///
/// # Errors
///
/// Returns [`AuthorizationError::Signing`] if the signer fails.
#[cfg(feature = "client")]
pub async fn sign_authorization<C, S>(
    codec: &C,
    signer: &S,
) -> Result<Signature, AuthorizationError>
where
    C: AuthorizationCodec + Sync,
    S: crate::exact::client::SignerLike,
{
    Ok(signer.sign_hash(&codec.digest()).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_requires_signature_length() {
        assert!(matches!(
            split_signature(&[0u8; 64]),
            Err(AuthorizationError::TooShort(64))
        ));
    }

    #[test]
    fn test_window_errors_map_to_reasons() {
        let early: PaymentVerificationError = AuthorizationError::NotYetValid {
            valid_after: UnixTimestamp::from_secs(10),
        }
        .into();
        assert_eq!(early.reason().as_str(), "invalid_payment_early");
        let expired: PaymentVerificationError = AuthorizationError::Expired {
            valid_before: UnixTimestamp::from_secs(10),
        }
        .into();
        assert_eq!(expired.reason().as_str(), "invalid_payment_expired");
    }
}
