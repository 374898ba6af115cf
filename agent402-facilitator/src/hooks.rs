//! Lifecycle hooks installed by the server.

use agent402::error::PaymentError;
use agent402::facilitator::BoxFuture;
use agent402::hooks::{FacilitatorHooks, Recovery};
use agent402::proto::{SettleRequest, SettleResponse, VerifyRequest, VerifyResponse};

/// Logs the outcome of every verify and settle.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHooks;

impl FacilitatorHooks for LoggingHooks {
    fn after_verify<'a>(
        &'a self,
        request: &'a VerifyRequest,
        response: &'a VerifyResponse,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let requirements = &request.payment_requirements;
            match response {
                VerifyResponse::Invalid { reason, payer, .. } => tracing::info!(
                    network = %requirements.network,
                    payer = payer.as_deref().unwrap_or("unknown"),
                    reason = %reason,
                    "payment rejected"
                ),
                _ => tracing::info!(
                    network = %requirements.network,
                    payer = response.payer().unwrap_or("unknown"),
                    amount = %requirements.amount,
                    "payment verified"
                ),
            }
        })
    }

    fn on_verify_failure<'a>(
        &'a self,
        request: &'a VerifyRequest,
        error: &'a PaymentError,
    ) -> BoxFuture<'a, Recovery<VerifyResponse>> {
        Box::pin(async move {
            tracing::warn!(
                network = %request.payment_requirements.network,
                reason = error.reason(),
                "verify failed: {error}"
            );
            Recovery::Propagate
        })
    }

    fn after_settle<'a>(
        &'a self,
        request: &'a SettleRequest,
        response: &'a SettleResponse,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if let SettleResponse::Success {
                payer, transaction, ..
            } = response
            {
                tracing::info!(
                    network = %request.payment_requirements.network,
                    payer = %payer,
                    transaction = %transaction,
                    amount = %request.payment_requirements.amount,
                    "payment settled"
                );
            }
        })
    }

    fn on_settle_failure<'a>(
        &'a self,
        request: &'a SettleRequest,
        error: &'a PaymentError,
    ) -> BoxFuture<'a, Recovery<SettleResponse>> {
        Box::pin(async move {
            tracing::warn!(
                network = %request.payment_requirements.network,
                reason = error.reason(),
                "settle failed: {error}"
            );
            Recovery::Propagate
        })
    }
}
