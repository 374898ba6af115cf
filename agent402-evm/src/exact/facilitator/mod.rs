//! Facilitator side of the EVM `exact` scheme.
//!
//! Verifies ERC-3009 `transferWithAuthorization` payloads and settles them
//! through an [`Eip155MetaTransactionProvider`]. Settlement is safe to
//! retry: the token tracks each `(from, nonce)` pair, and a consumed pair is
//! reported as `nonce_already_used` before anything is submitted.

mod contract;
mod error;
mod settle;
mod verify;

use std::collections::HashMap;

use agent402::chain::ChainProviderOps;
use agent402::error::PaymentError;
use agent402::facilitator::{BoxFuture, Facilitator};
use agent402::proto::{self, v2};
use agent402::scheme::{ExactScheme, SchemeId};
use agent402::timestamp::UnixTimestamp;
use alloy_primitives::Address;
use alloy_provider::Provider;
pub use contract::IEIP3009;
pub use error::Eip155ExactError;
pub use settle::{settle_payment, transfer_calldata};
pub use verify::{
    ExactPayment, SETTLEMENT_BUFFER_SECS, assert_domain, assert_enough_balance,
    assert_enough_value, assert_eoa_signature, assert_nonce_unused, assert_requirements,
    assert_time, assert_valid_payment, authorization_used, decode_payload, simulate_transfer,
};

use crate::chain::Eip155MetaTransactionProvider;
use crate::exact::Eip155Exact;

/// `exact` scheme facilitator for one EIP-155 chain.
pub struct Eip155ExactFacilitator<P> {
    provider: P,
}

impl<P> std::fmt::Debug for Eip155ExactFacilitator<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Eip155ExactFacilitator")
            .finish_non_exhaustive()
    }
}

impl<P> Eip155ExactFacilitator<P> {
    /// A facilitator settling through `provider`.
    pub const fn new(provider: P) -> Self {
        Self { provider }
    }

    /// The chain provider.
    pub const fn provider(&self) -> &P {
        &self.provider
    }
}

impl<P> Eip155ExactFacilitator<P>
where
    P: Eip155MetaTransactionProvider + Send + Sync,
    P::Inner: Provider,
{
    async fn validate(
        &self,
        payload: &proto::PaymentPayload,
        requirements: &proto::PaymentRequirements,
    ) -> Result<ExactPayment, (Eip155ExactError, Option<Address>)> {
        let exact = decode_payload(payload).map_err(|e| (e.into(), None))?;
        let payer = exact.authorization.from;
        assert_valid_payment(
            self.provider.inner(),
            self.provider.chain(),
            &exact,
            &payload.accepted,
            requirements,
            UnixTimestamp::now(),
        )
        .await
        .map_err(|e| (e, Some(payer)))
    }
}

impl<P> Facilitator for Eip155ExactFacilitator<P>
where
    P: Eip155MetaTransactionProvider + ChainProviderOps + Send + Sync,
    P::Inner: Provider,
    Eip155ExactError: From<P::Error>,
{
    fn verify(
        &self,
        request: proto::VerifyRequest,
    ) -> BoxFuture<'_, Result<proto::VerifyResponse, PaymentError>> {
        Box::pin(async move {
            match self
                .validate(&request.payment_payload, &request.payment_requirements)
                .await
            {
                Ok(payment) => Ok(proto::VerifyResponse::valid(payment.payer().to_string())),
                Err((error, payer)) => error.into_verify_response(payer),
            }
        })
    }

    fn settle(
        &self,
        request: proto::SettleRequest,
    ) -> BoxFuture<'_, Result<proto::SettleResponse, PaymentError>> {
        Box::pin(async move {
            let payment = self
                .validate(&request.payment_payload, &request.payment_requirements)
                .await
                .map_err(|(error, payer)| error.into_settle_error(payer))?;
            let payer = payment.payer();
            let tx_hash = settle_payment(&self.provider, &payment)
                .await
                .map_err(|e| e.into_settle_error(Some(payer)))?;
            Ok(proto::SettleResponse::Success {
                payer: payer.to_string(),
                transaction: tx_hash.to_string(),
                network: request.payment_requirements.network.clone(),
                extensions: None,
            })
        })
    }

    fn supported(&self) -> BoxFuture<'_, Result<proto::SupportedResponse, PaymentError>> {
        Box::pin(async move {
            let kinds = vec![proto::SupportedPaymentKind {
                x402_version: v2::V2,
                scheme: ExactScheme.to_string(),
                network: self.provider.chain_id().to_string(),
                extra: None,
            }];
            let mut signers = HashMap::with_capacity(1);
            signers.insert(Eip155Exact.caip_family(), self.provider.signer_addresses());
            Ok(proto::SupportedResponse {
                kinds,
                extensions: Vec::new(),
                signers,
            })
        })
    }

    /// Reads `authorizationState(from, nonce)` on the payload's token.
    fn settlement_status(
        &self,
        request: proto::SettleRequest,
    ) -> BoxFuture<'_, Result<proto::SettlementStatus, PaymentError>> {
        Box::pin(async move {
            let exact = decode_payload(&request.payment_payload)
                .map_err(|e| PaymentError::InvalidPaymentPayload(e.to_string()))?;
            let asset: Address = request
                .payment_requirements
                .asset
                .parse()
                .map_err(|e| PaymentError::InvalidPaymentPayload(format!("asset: {e}")))?;
            let token = IEIP3009::new(asset, self.provider.inner());
            let from = exact.authorization.from;
            let settled = authorization_used(&token, from, exact.authorization.nonce)
                .await
                .map_err(|e| PaymentError::settlement_unexpected(e.to_string()))?;
            Ok(proto::SettlementStatus {
                settled,
                payer: Some(from.to_string()),
                transaction: None,
                network: request.payment_requirements.network.clone(),
            })
        })
    }
}
