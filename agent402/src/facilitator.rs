//! The facilitator contract.
//!
//! A facilitator verifies payment authorizations and settles them on-chain on
//! behalf of a resource server. [`Facilitator`] is implemented by chain
//! mechanisms, by remote HTTP clients, by decorators such as
//! [`HookedFacilitator`](crate::hooks::HookedFacilitator), and by
//! [`FacilitatorRegistry`], which dispatches to per-network mechanisms.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

#[cfg(feature = "telemetry")]
use tracing::Instrument;

use crate::chain::NetworkPattern;
use crate::error::{PaymentError, SchemeNotFoundError};
use crate::proto;
use crate::scheme::SchemeRegistry;

/// A boxed, `Send` future borrowed for `'a`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Verify, settle and describe payments.
///
/// `verify` must never change ledger state. `settle` submits the transaction
/// and waits for inclusion; callers bound it with a timeout.
pub trait Facilitator: Send + Sync {
    /// Checks signature, funds and validity window without moving value.
    ///
    /// A payment that fails a check yields `Ok(VerifyResponse::Invalid)`;
    /// `Err` is reserved for unsupported networks and transport failures.
    fn verify(
        &self,
        request: proto::VerifyRequest,
    ) -> BoxFuture<'_, Result<proto::VerifyResponse, PaymentError>>;

    /// Submits the authorization on-chain and waits for the receipt.
    ///
    /// Resubmitting an already settled authorization fails with reason
    /// `nonce_already_used`.
    fn settle(
        &self,
        request: proto::SettleRequest,
    ) -> BoxFuture<'_, Result<proto::SettleResponse, PaymentError>>;

    /// Describes the kinds, signers and extensions this facilitator handles.
    fn supported(&self) -> BoxFuture<'_, Result<proto::SupportedResponse, PaymentError>>;

    /// Reports whether the payload's authorization has already been settled.
    ///
    /// The default implementation reports the status as unknown via
    /// [`PaymentError::UnsupportedScheme`].
    fn settlement_status(
        &self,
        request: proto::SettleRequest,
    ) -> BoxFuture<'_, Result<proto::SettlementStatus, PaymentError>> {
        Box::pin(async move {
            Err(PaymentError::UnsupportedScheme(SchemeNotFoundError::new(
                request.payment_payload.scheme(),
                request.payment_payload.network(),
            )))
        })
    }
}

impl<T: Facilitator + ?Sized> Facilitator for Arc<T> {
    fn verify(
        &self,
        request: proto::VerifyRequest,
    ) -> BoxFuture<'_, Result<proto::VerifyResponse, PaymentError>> {
        (**self).verify(request)
    }

    fn settle(
        &self,
        request: proto::SettleRequest,
    ) -> BoxFuture<'_, Result<proto::SettleResponse, PaymentError>> {
        (**self).settle(request)
    }

    fn supported(&self) -> BoxFuture<'_, Result<proto::SupportedResponse, PaymentError>> {
        (**self).supported()
    }

    fn settlement_status(
        &self,
        request: proto::SettleRequest,
    ) -> BoxFuture<'_, Result<proto::SettlementStatus, PaymentError>> {
        (**self).settlement_status(request)
    }
}

impl<T: Facilitator + ?Sized> Facilitator for Box<T> {
    fn verify(
        &self,
        request: proto::VerifyRequest,
    ) -> BoxFuture<'_, Result<proto::VerifyResponse, PaymentError>> {
        (**self).verify(request)
    }

    fn settle(
        &self,
        request: proto::SettleRequest,
    ) -> BoxFuture<'_, Result<proto::SettleResponse, PaymentError>> {
        (**self).settle(request)
    }

    fn supported(&self) -> BoxFuture<'_, Result<proto::SupportedResponse, PaymentError>> {
        (**self).supported()
    }

    fn settlement_status(
        &self,
        request: proto::SettleRequest,
    ) -> BoxFuture<'_, Result<proto::SettlementStatus, PaymentError>> {
        (**self).settlement_status(request)
    }
}

/// Dispatches facilitator calls to per-network mechanisms.
///
/// Mechanisms are keyed by `(version, network pattern, scheme)` and resolved
/// with the precedence rules of [`SchemeRegistry`].
#[derive(Debug, Default)]
pub struct FacilitatorRegistry {
    schemes: SchemeRegistry<Box<dyn Facilitator>>,
    extensions: Vec<String>,
}

impl FacilitatorRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a mechanism. The first registration of a triple wins.
    #[must_use]
    pub fn with_scheme(
        mut self,
        version: u32,
        pattern: NetworkPattern,
        scheme: &str,
        facilitator: impl Facilitator + 'static,
    ) -> Self {
        self.register(version, pattern, scheme, facilitator);
        self
    }

    /// Registers a mechanism in place.
    ///
    /// Returns `false` if the triple was already taken.
    pub fn register(
        &mut self,
        version: u32,
        pattern: NetworkPattern,
        scheme: &str,
        facilitator: impl Facilitator + 'static,
    ) -> bool {
        self.schemes
            .register(version, pattern, scheme, Box::new(facilitator))
    }

    /// Advertises a protocol extension in `/supported`.
    #[must_use]
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extensions.push(extension.into());
        self
    }

    /// The underlying scheme registry.
    #[must_use]
    pub const fn schemes(&self) -> &SchemeRegistry<Box<dyn Facilitator>> {
        &self.schemes
    }

    fn require(
        &self,
        version: u32,
        network: &str,
        scheme: &str,
    ) -> Result<&dyn Facilitator, PaymentError> {
        if let Some(handler) = self.schemes.resolve(version, network, scheme) {
            return Ok(handler.as_ref());
        }
        if self.schemes.supports_network(version, network) {
            Err(SchemeNotFoundError::new(scheme, network).into())
        } else {
            Err(PaymentError::UnsupportedNetwork {
                network: network.to_owned(),
            })
        }
    }
}

impl Facilitator for FacilitatorRegistry {
    fn verify(
        &self,
        request: proto::VerifyRequest,
    ) -> BoxFuture<'_, Result<proto::VerifyResponse, PaymentError>> {
        let fut = async move {
            let payload = &request.payment_payload;
            let handler = self.require(payload.x402_version, payload.network(), payload.scheme())?;
            handler.verify(request).await
        };
        #[cfg(feature = "telemetry")]
        let fut = fut.instrument(tracing::info_span!("facilitator.verify"));
        Box::pin(fut)
    }

    fn settle(
        &self,
        request: proto::SettleRequest,
    ) -> BoxFuture<'_, Result<proto::SettleResponse, PaymentError>> {
        let fut = async move {
            let payload = &request.payment_payload;
            let handler = self.require(payload.x402_version, payload.network(), payload.scheme())?;
            handler.settle(request).await
        };
        #[cfg(feature = "telemetry")]
        let fut = fut.instrument(tracing::info_span!("facilitator.settle"));
        Box::pin(fut)
    }

    fn supported(&self) -> BoxFuture<'_, Result<proto::SupportedResponse, PaymentError>> {
        Box::pin(async move {
            let mut merged = proto::SupportedResponse {
                extensions: self.extensions.clone(),
                ..Default::default()
            };
            for registration in self.schemes.entries() {
                match registration.handler.supported().await {
                    Ok(resp) => merged.merge(resp),
                    #[cfg(feature = "telemetry")]
                    Err(err) => tracing::warn!(
                        pattern = %registration.pattern,
                        scheme = registration.scheme,
                        "supported() failed: {err}"
                    ),
                    #[cfg(not(feature = "telemetry"))]
                    Err(_) => {}
                }
            }
            Ok(merged)
        })
    }

    fn settlement_status(
        &self,
        request: proto::SettleRequest,
    ) -> BoxFuture<'_, Result<proto::SettlementStatus, PaymentError>> {
        Box::pin(async move {
            let payload = &request.payment_payload;
            let handler = self.require(payload.x402_version, payload.network(), payload.scheme())?;
            handler.settlement_status(request).await
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    /// Facilitator double that accepts everything and tags responses.
    pub(crate) struct StaticFacilitator(pub &'static str);

    impl Facilitator for StaticFacilitator {
        fn verify(
            &self,
            _request: proto::VerifyRequest,
        ) -> BoxFuture<'_, Result<proto::VerifyResponse, PaymentError>> {
            Box::pin(async move { Ok(proto::VerifyResponse::valid(self.0.to_owned())) })
        }

        fn settle(
            &self,
            request: proto::SettleRequest,
        ) -> BoxFuture<'_, Result<proto::SettleResponse, PaymentError>> {
            Box::pin(async move {
                Ok(proto::SettleResponse::Success {
                    payer: self.0.to_owned(),
                    transaction: "0xtx".into(),
                    network: request.payment_payload.network().to_owned(),
                    extensions: None,
                })
            })
        }

        fn supported(&self) -> BoxFuture<'_, Result<proto::SupportedResponse, PaymentError>> {
            Box::pin(async move {
                Ok(proto::SupportedResponse {
                    kinds: vec![proto::SupportedPaymentKind {
                        x402_version: 2,
                        scheme: "exact".into(),
                        network: self.0.to_owned(),
                        extra: None,
                    }],
                    ..Default::default()
                })
            })
        }
    }

    pub(crate) fn request(network: &str, scheme: &str) -> proto::VerifyRequest {
        let requirements: proto::PaymentRequirements = serde_json::from_value(json!({
            "scheme": scheme,
            "network": network,
            "asset": "0xasset",
            "amount": "100",
            "payTo": "0xpayee",
            "maxTimeoutSeconds": 60
        }))
        .unwrap();
        proto::VerifyRequest {
            payment_payload: proto::PaymentPayload {
                x402_version: 2,
                payload: json!({}),
                accepted: requirements.clone(),
                resource: None,
                extensions: None,
            },
            payment_requirements: requirements,
        }
    }

    fn registry() -> FacilitatorRegistry {
        FacilitatorRegistry::new()
            .with_scheme(
                2,
                NetworkPattern::parse("eip155:*").unwrap(),
                "exact",
                StaticFacilitator("evm"),
            )
            .with_scheme(
                2,
                NetworkPattern::parse("eip155:8453").unwrap(),
                "exact",
                StaticFacilitator("base"),
            )
            .with_extension("identity")
    }

    #[tokio::test]
    async fn test_dispatch_prefers_exact_registration() {
        let registry = registry();
        let base = registry.verify(request("eip155:8453", "exact")).await.unwrap();
        assert_eq!(base.payer(), Some("base"));
        let other = registry.verify(request("eip155:10", "exact")).await.unwrap();
        assert_eq!(other.payer(), Some("evm"));
    }

    #[tokio::test]
    async fn test_unknown_network_and_scheme() {
        let registry = registry();
        let network = registry.verify(request("solana:mainnet", "exact")).await;
        assert!(matches!(network, Err(PaymentError::UnsupportedNetwork { .. })));
        let scheme = registry.settle(request("eip155:8453", "upto").into()).await;
        assert!(matches!(scheme, Err(PaymentError::UnsupportedScheme(_))));
    }

    #[tokio::test]
    async fn test_supported_aggregates_handlers() {
        let supported = registry().supported().await.unwrap();
        assert_eq!(supported.kinds.len(), 2);
        assert_eq!(supported.extensions, vec!["identity".to_owned()]);
    }

    #[tokio::test]
    async fn test_settlement_status_defaults_to_unsupported() {
        let status = registry()
            .settlement_status(request("eip155:8453", "exact").into())
            .await;
        assert!(matches!(status, Err(PaymentError::UnsupportedScheme(_))));
    }
}
