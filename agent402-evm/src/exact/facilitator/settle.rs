//! On-chain settlement for the `exact` scheme.

use alloy_primitives::{B256, Bytes, Signature, TxHash, U256};
use alloy_sol_types::SolCall;
#[cfg(feature = "telemetry")]
use tracing::Level;

use super::contract::IEIP3009;
use super::error::Eip155ExactError;
use super::verify::ExactPayment;
use crate::auth::SIGNATURE_LENGTH;
use crate::chain::{Eip155MetaTransactionProvider, MetaTransaction};

/// Calldata for `transferWithAuthorization`.
///
/// A 65-byte EOA signature uses the `(v, r, s)` overload, which every
/// ERC-3009 token implements; anything else goes through the bytes overload
/// for EIP-1271 wallets.
#[must_use]
pub fn transfer_calldata(payment: &ExactPayment) -> Bytes {
    let auth = &payment.authorization;
    let valid_after = U256::from(auth.valid_after.as_secs());
    let valid_before = U256::from(auth.valid_before.as_secs());
    let eoa = (payment.signature.len() == SIGNATURE_LENGTH)
        .then(|| Signature::from_raw(&payment.signature).ok())
        .flatten();
    match eoa {
        Some(signature) => IEIP3009::transferWithAuthorization_1Call {
            from: auth.from,
            to: auth.to,
            value: auth.value,
            validAfter: valid_after,
            validBefore: valid_before,
            nonce: auth.nonce,
            v: 27 + u8::from(signature.v()),
            r: B256::from(signature.r()),
            s: B256::from(signature.s()),
        }
        .abi_encode()
        .into(),
        None => IEIP3009::transferWithAuthorization_0Call {
            from: auth.from,
            to: auth.to,
            value: auth.value,
            validAfter: valid_after,
            validBefore: valid_before,
            nonce: auth.nonce,
            signature: payment.signature.clone(),
        }
        .abi_encode()
        .into(),
    }
}

/// Submits a verified payment and waits for its receipt.
///
/// # Errors
///
/// [`Eip155ExactError::TransactionReverted`] if the receipt reports failure,
/// or the provider's send error.
pub async fn settle_payment<P, E>(
    provider: &P,
    payment: &ExactPayment,
) -> Result<TxHash, Eip155ExactError>
where
    P: Eip155MetaTransactionProvider<Error = E> + Sync,
    Eip155ExactError: From<E>,
{
    let tx = MetaTransaction::call(payment.asset, transfer_calldata(payment));
    let send = provider.send_transaction(tx);
    #[cfg(feature = "telemetry")]
    let receipt = {
        use tracing::Instrument;
        let auth = &payment.authorization;
        send.instrument(tracing::info_span!("call_transferWithAuthorization",
            from = %auth.from,
            to = %auth.to,
            value = %auth.value,
            nonce = %auth.nonce,
            token_contract = %payment.asset,
            otel.kind = "client",
        ))
        .await?
    };
    #[cfg(not(feature = "telemetry"))]
    let receipt = send.await?;

    let tx_hash = receipt.transaction_hash;
    if receipt.status() {
        #[cfg(feature = "telemetry")]
        tracing::event!(Level::INFO,
            status = "ok",
            tx = %tx_hash,
            payer = %payment.payer(),
            "transferWithAuthorization succeeded"
        );
        Ok(tx_hash)
    } else {
        #[cfg(feature = "telemetry")]
        tracing::event!(Level::WARN,
            status = "failed",
            tx = %tx_hash,
            payer = %payment.payer(),
            "transferWithAuthorization reverted"
        );
        Err(Eip155ExactError::TransactionReverted(tx_hash))
    }
}

#[cfg(test)]
mod tests {
    use agent402::timestamp::UnixTimestamp;
    use alloy_primitives::Address;
    use alloy_signer::SignerSync;
    use alloy_signer_local::PrivateKeySigner;

    use super::*;
    use crate::auth::{AuthorizationCodec, TransferAuthorization, token_domain};

    fn payment(signature: Bytes) -> ExactPayment {
        ExactPayment {
            asset: Address::repeat_byte(0xAA),
            authorization: TransferAuthorization {
                from: Address::repeat_byte(1),
                to: Address::repeat_byte(2),
                value: U256::from(10_000u64),
                valid_after: UnixTimestamp::from_secs(1),
                valid_before: UnixTimestamp::from_secs(2),
                nonce: B256::repeat_byte(3),
                domain: token_domain("USDC".into(), "2".into(), 84532, Address::repeat_byte(0xAA)),
            },
            signature,
        }
    }

    #[test]
    fn test_eoa_signature_uses_split_overload() {
        let signer = PrivateKeySigner::random();
        let mut p = payment(Bytes::new());
        p.authorization.from = signer.address();
        let signature = signer.sign_hash_sync(&p.authorization.digest()).unwrap();
        p.signature = signature.as_bytes().into();

        let calldata = transfer_calldata(&p);
        assert_eq!(&calldata[..4], IEIP3009::transferWithAuthorization_1Call::SELECTOR.as_slice());
        let decoded = IEIP3009::transferWithAuthorization_1Call::abi_decode(&calldata).unwrap();
        assert_eq!(decoded.from, signer.address());
        assert_eq!(decoded.nonce, B256::repeat_byte(3));
        assert!(decoded.v == 27 || decoded.v == 28);
    }

    #[test]
    fn test_contract_signature_uses_bytes_overload() {
        let p = payment(Bytes::from(vec![7u8; 96]));
        let calldata = transfer_calldata(&p);
        assert_eq!(&calldata[..4], IEIP3009::transferWithAuthorization_0Call::SELECTOR.as_slice());
        let decoded = IEIP3009::transferWithAuthorization_0Call::abi_decode(&calldata).unwrap();
        assert_eq!(decoded.signature.len(), 96);
        assert_eq!(decoded.validBefore, U256::from(2u64));
    }
}
