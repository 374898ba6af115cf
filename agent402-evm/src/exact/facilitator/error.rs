use agent402::error::{PaymentError, SettleError};
use agent402::proto::{ErrorReason, PaymentVerificationError, VerifyResponse};
use alloy_primitives::{Address, TxHash};
use alloy_transport::TransportError;

use crate::auth::AuthorizationError;
use crate::chain::MetaTransactionSendError;

/// Errors specific to EIP-155 exact scheme operations.
#[derive(Debug, thiserror::Error)]
pub enum Eip155ExactError {
    /// The RPC call failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Waiting for the receipt failed or timed out.
    #[error(transparent)]
    PendingTransaction(#[from] alloy_provider::PendingTransactionError),
    /// The transfer was mined but reverted.
    #[error("Transaction {0} reverted")]
    TransactionReverted(TxHash),
    /// A read-only contract call failed.
    #[error("Contract call failed: {0}")]
    ContractCall(String),
    /// The payment failed a check.
    #[error(transparent)]
    PaymentVerification(#[from] PaymentVerificationError),
}

impl Eip155ExactError {
    /// Verification failures become an invalid response, everything else an
    /// unexpected error.
    ///
    /// # Errors
    ///
    /// [`PaymentError::VerificationFailed`] with reason `unexpected_error`
    /// for transport and contract-call failures.
    pub fn into_verify_response(
        self,
        payer: Option<Address>,
    ) -> Result<VerifyResponse, PaymentError> {
        match self {
            Self::PaymentVerification(e) => Ok(VerifyResponse::invalid_with_message(
                payer.map(|p| p.to_string()),
                e.reason().to_string(),
                e.to_string(),
            )),
            other => Err(PaymentError::verification_unexpected(other.to_string())),
        }
    }

    /// Converts into [`PaymentError::SettlementFailed`], keeping the reason
    /// distinguishable: a consumed nonce stays `nonce_already_used`.
    #[must_use]
    pub fn into_settle_error(self, payer: Option<Address>) -> PaymentError {
        let error = match self {
            Self::PaymentVerification(e) => {
                SettleError::new(e.reason().as_str()).with_message(e.to_string())
            }
            Self::TransactionReverted(tx) => {
                SettleError::new(ErrorReason::TransactionReverted.as_str())
                    .with_message(format!("Transaction {tx} reverted"))
                    .with_transaction(tx.to_string())
            }
            other => SettleError::new(ErrorReason::UnexpectedError.as_str())
                .with_message(other.to_string()),
        };
        let error = match payer {
            Some(payer) => error.with_payer(payer.to_string()),
            None => error,
        };
        PaymentError::SettlementFailed(error)
    }
}

impl From<AuthorizationError> for Eip155ExactError {
    fn from(e: AuthorizationError) -> Self {
        Self::PaymentVerification(e.into())
    }
}

impl From<MetaTransactionSendError> for Eip155ExactError {
    fn from(e: MetaTransactionSendError) -> Self {
        match e {
            MetaTransactionSendError::Transport(e) => Self::Transport(e),
            MetaTransactionSendError::PendingTransaction(e) => Self::PendingTransaction(e),
            MetaTransactionSendError::Custom(e) => Self::ContractCall(e),
        }
    }
}

impl From<alloy_contract::Error> for Eip155ExactError {
    fn from(e: alloy_contract::Error) -> Self {
        match e {
            alloy_contract::Error::TransportError(e) => Self::Transport(e),
            alloy_contract::Error::PendingTransactionError(e) => Self::PendingTransaction(e),
            other => Self::ContractCall(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verification_failure_is_invalid_response() {
        let payer = Address::repeat_byte(1);
        let response = Eip155ExactError::from(PaymentVerificationError::Expired)
            .into_verify_response(Some(payer))
            .unwrap();
        assert_eq!(response.payer(), Some(payer.to_string().as_str()));
        assert!(matches!(
            response,
            VerifyResponse::Invalid { ref reason, .. } if reason == "invalid_payment_expired"
        ));

        let err = Eip155ExactError::ContractCall("boom".into())
            .into_verify_response(None)
            .unwrap_err();
        assert_eq!(err.reason(), "unexpected_error");
    }

    #[test]
    fn test_settle_errors_keep_reason() {
        let err = Eip155ExactError::from(PaymentVerificationError::NonceAlreadyUsed)
            .into_settle_error(Some(Address::ZERO));
        assert_eq!(err.reason(), "nonce_already_used");

        let err =
            Eip155ExactError::TransactionReverted(TxHash::repeat_byte(2)).into_settle_error(None);
        assert_eq!(err.reason(), "transaction_reverted");
        assert!(matches!(
            err,
            PaymentError::SettlementFailed(ref e) if e.transaction.is_some() && !e.is_unexpected()
        ));

        let err = Eip155ExactError::ContractCall("rpc".into()).into_settle_error(None);
        assert!(matches!(err, PaymentError::SettlementFailed(ref e) if e.is_unexpected()));
    }
}
