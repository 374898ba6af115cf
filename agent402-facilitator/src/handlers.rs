//! Axum handlers for the facilitator API.
//!
//! | Route | Body | Response |
//! |-------|------|----------|
//! | `POST /verify` | `VerifyRequest` | `VerifyResponse` |
//! | `POST /settle` | `SettleRequest` | `SettleResponse` |
//! | `GET /supported` | | `SupportedResponse` |
//! | `POST /settlement-status` | `SettleRequest` | `SettlementStatus` |
//! | `POST /register` | `RegisterRequest` | `RegisterResponse` |
//! | `GET /health` | | `{"status": "ok"}` |
//!
//! A payment that is rejected for a definite reason is a `200` carrying the
//! invalid or error response. Everything else, including failures whose
//! outcome is unknown, is an error status with a JSON `{error, message}` body.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use agent402::chain::ChainId;
use agent402::error::PaymentError;
use agent402::facilitator::Facilitator;
use agent402::proto::{
    SettleRequest, SettleResponse, SettlementStatus, SupportedResponse, VerifyRequest,
    VerifyResponse,
};
use agent402_evm::chain::Eip155ChainProvider;
use agent402_evm::identity::{IdentityRegistrar, RegisterRequest, RegisterResponse};
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::error::FacilitatorError;

/// Default bound on `/verify`.
pub const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on `/settle` and `/register`.
pub const DEFAULT_SETTLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Registrar for one chain.
pub type ChainRegistrar = IdentityRegistrar<Arc<Eip155ChainProvider>>;

/// Everything the handlers share.
pub struct FacilitatorState {
    facilitator: Box<dyn Facilitator>,
    registrars: HashMap<ChainId, ChainRegistrar>,
    verify_timeout: Duration,
    settle_timeout: Duration,
}

impl std::fmt::Debug for FacilitatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FacilitatorState")
            .field("registrars", &self.registrars.keys().collect::<Vec<_>>())
            .field("verify_timeout", &self.verify_timeout)
            .field("settle_timeout", &self.settle_timeout)
            .finish_non_exhaustive()
    }
}

impl FacilitatorState {
    /// State serving `facilitator` with default timeouts and no registrars.
    pub fn new(facilitator: impl Facilitator + 'static) -> Self {
        Self {
            facilitator: Box::new(facilitator),
            registrars: HashMap::new(),
            verify_timeout: DEFAULT_VERIFY_TIMEOUT,
            settle_timeout: DEFAULT_SETTLE_TIMEOUT,
        }
    }

    /// Enables `/register` on `network`.
    #[must_use]
    pub fn with_registrar(mut self, network: ChainId, registrar: ChainRegistrar) -> Self {
        self.registrars.insert(network, registrar);
        self
    }

    /// Overrides the `/verify` and `/settle` deadlines.
    #[must_use]
    pub const fn with_timeouts(mut self, verify: Duration, settle: Duration) -> Self {
        self.verify_timeout = verify;
        self.settle_timeout = settle;
        self
    }

    /// Whether `/register` is enabled on `network`.
    pub fn registers(&self, network: &ChainId) -> bool {
        self.registrars.contains_key(network)
    }

    /// The wrapped facilitator.
    pub fn facilitator(&self) -> &dyn Facilitator {
        self.facilitator.as_ref()
    }
}

/// Shared handler state.
pub type SharedState = Arc<FacilitatorState>;

async fn bounded<T>(
    operation: &'static str,
    after: Duration,
    fut: impl Future<Output = Result<T, PaymentError>>,
) -> Result<T, FacilitatorError> {
    match tokio::time::timeout(after, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(FacilitatorError::Timeout { operation, after }),
    }
}

/// `POST /verify`
///
/// # Errors
///
/// Unsupported networks, timeouts and failures of unknown outcome.
pub async fn post_verify(
    State(state): State<SharedState>,
    Json(request): Json<VerifyRequest>,
) -> Result<Json<VerifyResponse>, FacilitatorError> {
    match bounded("verify", state.verify_timeout, state.facilitator.verify(request)).await {
        Ok(response) => Ok(Json(response)),
        Err(FacilitatorError::Payment(PaymentError::VerificationFailed(err)))
            if err.invalid_reason != "unexpected_error" =>
        {
            Ok(Json(VerifyResponse::Invalid {
                reason: err.invalid_reason,
                message: err.invalid_message,
                payer: err.payer,
            }))
        }
        Err(err) => Err(err),
    }
}

/// `POST /settle`
///
/// # Errors
///
/// Unsupported networks, timeouts and failures of unknown outcome. A caller
/// seeing one of these should ask `/settlement-status` before retrying.
pub async fn post_settle(
    State(state): State<SharedState>,
    Json(request): Json<SettleRequest>,
) -> Result<Json<SettleResponse>, FacilitatorError> {
    let network = request.payment_requirements.network.clone();
    match bounded("settle", state.settle_timeout, state.facilitator.settle(request)).await {
        Ok(response) => Ok(Json(response)),
        Err(FacilitatorError::Payment(PaymentError::SettlementFailed(err)))
            if !err.is_unexpected() =>
        {
            Ok(Json(SettleResponse::Error {
                reason: err.error_reason,
                message: err.error_message,
                payer: err.payer,
                network,
            }))
        }
        Err(err) => Err(err),
    }
}

/// `GET /supported`
///
/// # Errors
///
/// Fails if a mechanism cannot report its signers.
pub async fn get_supported(
    State(state): State<SharedState>,
) -> Result<Json<SupportedResponse>, FacilitatorError> {
    let supported =
        bounded("supported", state.verify_timeout, state.facilitator.supported()).await?;
    Ok(Json(supported))
}

/// `POST /settlement-status`
///
/// # Errors
///
/// Unsupported networks, malformed payloads and unreachable chains.
pub async fn post_settlement_status(
    State(state): State<SharedState>,
    Json(request): Json<SettleRequest>,
) -> Result<Json<SettlementStatus>, FacilitatorError> {
    let status = bounded(
        "settlement-status",
        state.verify_timeout,
        state.facilitator.settlement_status(request),
    )
    .await?;
    Ok(Json(status))
}

/// `POST /register`
///
/// # Errors
///
/// `404` when registration is not configured for the network, `400` for an
/// authorization naming another delegate, and the send or receipt failure
/// otherwise.
pub async fn post_register(
    State(state): State<SharedState>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, FacilitatorError> {
    let registrar = state
        .registrars
        .get(&request.network)
        .ok_or_else(|| PaymentError::UnsupportedNetwork {
            network: request.network.to_string(),
        })?;
    let registration = async { registrar.register(request).await.map_err(PaymentError::from) };
    let response = bounded("register", state.settle_timeout, registration).await?;
    tracing::info!(agent_id = %response.agent_id, tx = %response.tx_hash, "agent registered");
    Ok(Json(response))
}

/// `GET /health`
pub async fn get_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Router with every endpoint.
pub fn facilitator_router(state: SharedState) -> Router {
    Router::new()
        .route("/verify", post(post_verify))
        .route("/settle", post(post_settle))
        .route("/supported", get(get_supported))
        .route("/settlement-status", post(post_settlement_status))
        .route("/register", post(post_register))
        .route("/health", get(get_health))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use agent402::error::{SettleError, VerifyError};
    use agent402::facilitator::BoxFuture;
    use agent402::proto::{PaymentPayload, PaymentRequirements, SupportedPaymentKind, v2};
    use agent402_evm::chain::{DEFAULT_RECEIPT_TIMEOUT_SECS, Eip155ChainReference};
    use alloy_network::EthereumWallet;
    use alloy_primitives::Address;
    use alloy_signer_local::PrivateKeySigner;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;

    #[derive(Clone, Copy)]
    enum Mode {
        Accept,
        Reject,
        Unexpected,
        Hang,
    }

    struct Stub {
        mode: Mode,
    }

    impl Facilitator for Stub {
        fn verify(
            &self,
            _request: VerifyRequest,
        ) -> BoxFuture<'_, Result<VerifyResponse, PaymentError>> {
            let mode = self.mode;
            Box::pin(async move {
                match mode {
                    Mode::Accept => Ok(VerifyResponse::valid("0xpayer".into())),
                    Mode::Reject => Err(PaymentError::from(
                        VerifyError::new("invalid_signature").with_payer("0xpayer"),
                    )),
                    Mode::Unexpected => Err(PaymentError::verification_unexpected("rpc down")),
                    Mode::Hang => std::future::pending().await,
                }
            })
        }

        fn settle(
            &self,
            request: SettleRequest,
        ) -> BoxFuture<'_, Result<SettleResponse, PaymentError>> {
            let mode = self.mode;
            Box::pin(async move {
                match mode {
                    Mode::Accept => Ok(SettleResponse::Success {
                        payer: "0xpayer".into(),
                        transaction: "0xfeed".into(),
                        network: request.payment_requirements.network,
                        extensions: None,
                    }),
                    Mode::Reject => Err(PaymentError::from(SettleError::new("nonce_already_used"))),
                    Mode::Unexpected => Err(PaymentError::settlement_unexpected("rpc down")),
                    Mode::Hang => std::future::pending().await,
                }
            })
        }

        fn supported(&self) -> BoxFuture<'_, Result<SupportedResponse, PaymentError>> {
            Box::pin(async {
                Ok(SupportedResponse {
                    kinds: vec![SupportedPaymentKind {
                        x402_version: v2::V2,
                        scheme: "exact".into(),
                        network: "eip155:84532".into(),
                        extra: None,
                    }],
                    ..SupportedResponse::default()
                })
            })
        }

        fn settlement_status(
            &self,
            request: SettleRequest,
        ) -> BoxFuture<'_, Result<SettlementStatus, PaymentError>> {
            Box::pin(async move {
                Ok(SettlementStatus {
                    settled: true,
                    payer: Some("0xpayer".into()),
                    transaction: None,
                    network: request.payment_requirements.network,
                })
            })
        }
    }

    fn router(mode: Mode) -> Router {
        let state = FacilitatorState::new(Stub { mode })
            .with_timeouts(Duration::from_millis(100), Duration::from_millis(100));
        facilitator_router(Arc::new(state))
    }

    fn request_body() -> Value {
        let requirements = PaymentRequirements {
            scheme: "exact".into(),
            network: "eip155:84532".into(),
            asset: "0x036CbD53842c5426634e7929541eC2318f3dCF7e".into(),
            amount: "10000".into(),
            pay_to: "0x209693Bc6afc0C5328bA36FaF03C514EF312287C".into(),
            max_timeout_seconds: 300,
            extra: json!({}),
        };
        let payload = PaymentPayload {
            x402_version: v2::V2,
            payload: json!({"signature": "0x00"}),
            accepted: requirements.clone(),
            resource: None,
            extensions: None,
        };
        json!({
            "paymentPayload": payload,
            "paymentRequirements": requirements,
        })
    }

    async fn call(
        router: Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.map_or_else(Body::empty, |b| Body::from(b.to_string())))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_verify_valid() {
        let (status, body) =
            call(router(Mode::Accept), "POST", "/verify", Some(request_body())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["isValid"], true);
        assert_eq!(body["payer"], "0xpayer");
    }

    #[tokio::test]
    async fn test_definite_rejections_are_ok_responses() {
        let (status, body) =
            call(router(Mode::Reject), "POST", "/verify", Some(request_body())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["isValid"], false);
        assert_eq!(body["invalidReason"], "invalid_signature");

        let (status, body) =
            call(router(Mode::Reject), "POST", "/settle", Some(request_body())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);
        assert_eq!(body["errorReason"], "nonce_already_used");
        assert_eq!(body["network"], "eip155:84532");
    }

    #[tokio::test]
    async fn test_unknown_outcome_is_error_status() {
        let (status, body) =
            call(router(Mode::Unexpected), "POST", "/settle", Some(request_body())).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"], "unexpected_error");

        let (status, body) =
            call(router(Mode::Hang), "POST", "/settle", Some(request_body())).await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body["error"], "unexpected_error");
    }

    #[tokio::test]
    async fn test_settle_success() {
        let (status, body) =
            call(router(Mode::Accept), "POST", "/settle", Some(request_body())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["transaction"], "0xfeed");
    }

    #[tokio::test]
    async fn test_supported_status_and_health() {
        let (status, body) = call(router(Mode::Accept), "GET", "/supported", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["kinds"][0]["network"], "eip155:84532");

        let (status, body) =
            call(router(Mode::Accept), "POST", "/settlement-status", Some(request_body())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["settled"], true);

        let (status, body) = call(router(Mode::Accept), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    fn register_body(delegate: Address) -> Value {
        json!({
            "agentAddress": "0x857b06519E91e3A54538791bDbb0E22373e36b66",
            "authorization": {
                "chainId": "0x14a34",
                "address": delegate,
                "nonce": "0x0",
                "yParity": "0x0",
                "r": "0x1",
                "s": "0x1"
            },
            "tokenURI": "ipfs://agent",
            "network": "eip155:84532"
        })
    }

    #[tokio::test]
    async fn test_register_requires_configured_network() {
        let (status, body) = call(
            router(Mode::Accept),
            "POST",
            "/register",
            Some(register_body(Address::repeat_byte(0x11))),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "unsupported_network");
    }

    #[tokio::test]
    async fn test_register_rejects_foreign_delegate_before_sending() {
        let chain = Eip155ChainReference::new(84532);
        let provider = Eip155ChainProvider::new(
            chain,
            EthereumWallet::from(PrivateKeySigner::random()),
            &[("http://127.0.0.1:1".parse().unwrap(), None)],
            true,
            DEFAULT_RECEIPT_TIMEOUT_SECS,
        )
        .unwrap();
        let registrar = IdentityRegistrar::new(Arc::new(provider), Address::repeat_byte(0x11));
        let state = FacilitatorState::new(Stub { mode: Mode::Accept })
            .with_registrar(chain.as_chain_id(), registrar);

        let (status, body) = call(
            facilitator_router(Arc::new(state)),
            "POST",
            "/register",
            Some(register_body(Address::repeat_byte(0x22))),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "authorization_address_mismatch");
    }
}
