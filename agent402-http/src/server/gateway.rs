//! Payment enforcement for protected routes.

use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};

use agent402::chain::NetworkPattern;
use agent402::config::{RouteConfig, RoutesConfig};
use agent402::error::{PaymentError, SettleError};
use agent402::facilitator::{BoxFuture, Facilitator};
use agent402::policy::{Direction, SharedPolicyEngine};
use agent402::proto::{
    ErrorReason, PaymentPayload, PaymentRequired, PaymentRequirements, ResourceInfo,
    SettleRequest, SettleResponse, VerifyRequest, VerifyResponse, v2,
};
use agent402::scheme::{SchemeRegistry, SchemeServer};
use axum_core::body::Body;
use axum_core::extract::Request;
use axum_core::response::Response;
use http::header::{CONTENT_TYPE, HOST, ORIGIN, REFERER};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::Serialize;
use serde_json::json;
use tower::util::BoxCloneSyncService;
use tower::{Layer, Service, ServiceExt};
use url::Url;

#[cfg(feature = "telemetry")]
use tracing::{Instrument, instrument};

use super::pricing::{PricingSource, StaticPricing};
use super::routes::{RoutePattern, RoutePatternError};
use crate::constants::{EXPOSED_PAYMENT_HEADERS, PAYMENT_SIGNATURE_HEADER, X_PAYMENT_HEADER};
use crate::headers::{decode_payment_payload, encode_payment_required, encode_settle_response};

const PAYMENT_REQUIRED: &str = "Payment required";
const NO_MATCHING_REQUIREMENTS: &str = "No matching payment requirements";
const SETTLEMENT_FAILED: &str = "Settlement failed";

// `HeaderName::from_static` only takes the lowercase form.
const PAYMENT_REQUIRED_LOWER: &str = "payment-required";
const PAYMENT_RESPONSE_LOWER: &str = "payment-response";
const X_PAYMENT_RESPONSE_LOWER: &str = "x-payment-response";

/// A route pattern with its payment options and metadata.
pub struct ProtectedRoute {
    pattern: RoutePattern,
    pricing: Arc<dyn PricingSource>,
    description: Option<String>,
    mime_type: Option<String>,
    policy_group: Option<String>,
}

impl std::fmt::Debug for ProtectedRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtectedRoute")
            .field("pattern", &self.pattern)
            .field("policy_group", &self.policy_group)
            .finish_non_exhaustive()
    }
}

impl ProtectedRoute {
    /// A route priced by `pricing`.
    pub fn new(pattern: RoutePattern, pricing: impl PricingSource + 'static) -> Self {
        Self {
            pattern,
            pricing: Arc::new(pricing),
            description: None,
            mime_type: None,
            policy_group: None,
        }
    }

    /// A route with fixed options, from declarative configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RoutePatternError`] if `pattern` does not compile.
    pub fn from_config(pattern: &str, config: RouteConfig) -> Result<Self, RoutePatternError> {
        Ok(Self {
            pattern: RoutePattern::parse(pattern)?,
            pricing: Arc::new(StaticPricing::new(config.accepts)),
            description: config.description,
            mime_type: config.mime_type,
            policy_group: config.policy_group,
        })
    }

    /// Description shown in the challenge.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// MIME type shown in the challenge.
    #[must_use]
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    /// Checks and records payments on this route under `group`.
    #[must_use]
    pub fn with_policy_group(mut self, group: impl Into<String>) -> Self {
        self.policy_group = Some(group.into());
        self
    }

    /// The compiled route pattern.
    pub const fn pattern(&self) -> &RoutePattern {
        &self.pattern
    }
}

/// Shared state behind every [`PaymentGateService`].
pub struct Gateway<F> {
    facilitator: F,
    schemes: SchemeRegistry<Box<dyn SchemeServer>>,
    routes: Vec<ProtectedRoute>,
    policy: Option<SharedPolicyEngine>,
    base_url: Option<Url>,
}

impl<F> std::fmt::Debug for Gateway<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("routes", &self.routes)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

/// Builder for the payment layer.
///
/// ```rust,no_run
/// use agent402::config::RoutesConfig;
/// use agent402_http::server::{FacilitatorClient, PaymentGateway};
///
/// # use agent402::scheme::SchemeServer;
/// # fn demo(server: impl SchemeServer + 'static) -> Result<(), Box<dyn std::error::Error>> {
/// let routes: RoutesConfig = serde_json::from_str(r#"{
///     "GET /weather": {
///         "accepts": [{"scheme": "exact", "payTo": "0x209693Bc6afc0C5328bA36FaF03C514EF312287C",
///                      "price": "$0.001", "network": "eip155:84532"}]
///     }
/// }"#)?;
/// let layer = PaymentGateway::new(FacilitatorClient::try_from("https://facilitator.example.com")?)
///     .with_scheme("eip155:*".parse()?, server)
///     .with_routes(routes)?
///     .layer();
/// # drop(layer);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct PaymentGateway<F> {
    gateway: Gateway<F>,
}

impl<F> PaymentGateway<F> {
    /// A gateway with no schemes or routes.
    pub const fn new(facilitator: F) -> Self {
        Self {
            gateway: Gateway {
                facilitator,
                schemes: SchemeRegistry::new(),
                routes: Vec::new(),
                policy: None,
                base_url: None,
            },
        }
    }

    /// Prices options whose network matches `pattern` and whose scheme is
    /// `server.scheme()`. The first registration of a pattern wins.
    #[must_use]
    pub fn with_scheme(
        mut self,
        pattern: NetworkPattern,
        server: impl SchemeServer + 'static,
    ) -> Self {
        let scheme = server.scheme().to_owned();
        self.gateway
            .schemes
            .register(v2::V2, pattern, scheme, Box::new(server));
        self
    }

    /// Adds every route of a declarative configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RoutePatternError`] for the first key that does not compile.
    pub fn with_routes(mut self, routes: RoutesConfig) -> Result<Self, RoutePatternError> {
        for (pattern, config) in routes {
            self.gateway
                .routes
                .push(ProtectedRoute::from_config(&pattern, config)?);
        }
        Ok(self)
    }

    /// Adds a route. Routes are tried in the order they were added.
    #[must_use]
    pub fn with_route(mut self, route: ProtectedRoute) -> Self {
        self.gateway.routes.push(route);
        self
    }

    /// Enforces incoming limits on routes that name a policy group.
    #[must_use]
    pub fn with_policy(mut self, engine: SharedPolicyEngine) -> Self {
        self.gateway.policy = Some(engine);
        self
    }

    /// Origin used for the challenge's resource URL.
    ///
    /// Without one the request's `Host` header is used over `http`.
    #[must_use]
    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.gateway.base_url = Some(base_url);
        self
    }

    /// Finishes the gateway as a tower layer.
    #[must_use]
    pub fn layer(self) -> PaymentGateLayer<F> {
        PaymentGateLayer {
            gateway: Arc::new(self.gateway),
        }
    }
}

/// Who is paying, as far as the request reveals before verification.
#[derive(Debug, Default)]
struct Sender {
    address: Option<String>,
    domain: Option<String>,
}

impl Sender {
    fn from_request(payload: &PaymentPayload, headers: &HeaderMap) -> Self {
        let address = payload
            .payload
            .pointer("/authorization/from")
            .and_then(serde_json::Value::as_str)
            .map(str::to_owned);
        let domain = [ORIGIN, REFERER]
            .iter()
            .filter_map(|name| headers.get(name)?.to_str().ok())
            .find_map(|value| Url::parse(value).ok()?.host_str().map(str::to_owned));
        Self { address, domain }
    }
}

impl<F> Gateway<F> {
    fn route_for(&self, method: &Method, path: &str) -> Option<&ProtectedRoute> {
        self.routes
            .iter()
            .find(|route| route.pattern.matches(method.as_str(), path))
    }

    fn policy_for<'a>(
        &'a self,
        route: &'a ProtectedRoute,
    ) -> Option<(&'a SharedPolicyEngine, &'a str)> {
        Some((self.policy.as_ref()?, route.policy_group.as_deref()?))
    }

    /// Resolves the route's options into wire requirements.
    ///
    /// Options no registered scheme can price are skipped; it is an error only
    /// when none is left.
    async fn requirements(
        &self,
        route: &ProtectedRoute,
        headers: &HeaderMap,
        uri: &http::Uri,
    ) -> Result<Vec<PaymentRequirements>, PaymentError> {
        let options = route.pricing.resolve(headers, uri).await;
        let mut accepts = Vec::with_capacity(options.len());
        let mut last_error = None;
        for option in &options {
            let network = option.network.to_string();
            let built = match self.schemes.resolve(v2::V2, &network, &option.scheme) {
                Some(server) => option.to_requirements(&**server),
                None => Err(PaymentError::UnsupportedNetwork { network }),
            };
            match built {
                Ok(requirements) => accepts.push(requirements),
                Err(err) => {
                    #[cfg(feature = "telemetry")]
                    tracing::warn!(
                        route = %route.pattern,
                        scheme = %option.scheme,
                        "cannot price payment option: {err}"
                    );
                    last_error = Some(err);
                }
            }
        }
        match last_error {
            Some(err) if accepts.is_empty() => Err(err),
            _ => Ok(accepts),
        }
    }

    fn resource_info(&self, route: &ProtectedRoute, req: &Request) -> ResourceInfo {
        let uri = req.uri();
        let path_and_query = uri.path_and_query().map_or("/", http::uri::PathAndQuery::as_str);
        let url = self
            .base_url
            .as_ref()
            .and_then(|base| base.join(path_and_query).ok())
            .map(String::from)
            .unwrap_or_else(|| {
                if uri.scheme().is_some() {
                    return uri.to_string();
                }
                let host = req
                    .headers()
                    .get(HOST)
                    .and_then(|h| h.to_str().ok())
                    .unwrap_or("localhost");
                format!("http://{host}{path_and_query}")
            });
        ResourceInfo {
            url,
            description: route.description.clone(),
            mime_type: route.mime_type.clone(),
        }
    }

    fn record(
        &self,
        route: &ProtectedRoute,
        sender: &Sender,
        receipt: &SettleResponse,
        amount: u128,
    ) {
        let Some((engine, group)) = self.policy_for(route) else {
            return;
        };
        let address = receipt.payer().or(sender.address.as_deref());
        let scope = engine.scope_for(group, Direction::In, address, sender.domain.as_deref());
        if let Err(err) = engine.record_incoming(group, &scope, amount) {
            #[cfg(feature = "telemetry")]
            tracing::warn!(group, scope = %scope, "failed to record payment: {err}");
            #[cfg(not(feature = "telemetry"))]
            let _ = err;
        }
    }
}

impl<F: Facilitator> Gateway<F> {
    /// Runs one request through the payment flow, calling `inner` once the
    /// payment is verified.
    ///
    /// Every failure becomes a response: `402` with a challenge for missing,
    /// mismatched or invalid payments, `403` for policy violations, `402`
    /// with a JSON error when settlement fails, `500` when no option can be
    /// priced or the chosen option's amount is not an integer. A handler
    /// response with status 400 or above is returned unchanged and nothing
    /// is settled.
    #[cfg_attr(
        feature = "telemetry",
        instrument(name = "agent402.gateway.handle", skip_all, fields(
            method = %req.method(),
            path = %req.uri().path()
        ))
    )]
    pub async fn handle<S>(&self, inner: S, req: Request) -> Response
    where
        S: Service<Request, Response = Response, Error = Infallible> + Send,
        S::Future: Send,
    {
        let Some(route) = self.route_for(req.method(), req.uri().path()) else {
            return call_inner(inner, req).await;
        };

        let accepts = match self.requirements(route, req.headers(), req.uri()).await {
            Ok(accepts) if accepts.is_empty() => return call_inner(inner, req).await,
            Ok(accepts) => accepts,
            Err(err) => {
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &json!({"error": err.reason(), "message": err.to_string()}),
                );
            }
        };
        let resource = self.resource_info(route, &req);
        let challenge = |error: &str, accepts: Vec<PaymentRequirements>| {
            #[cfg(feature = "telemetry")]
            tracing::debug!(route = %route.pattern, error, "payment challenge");
            challenge_response(&PaymentRequired {
                x402_version: v2::V2,
                error: Some(error.to_owned()),
                resource: Some(resource.clone()),
                accepts,
                extensions: None,
            })
        };

        let Some((header, legacy)) = payment_header(req.headers()) else {
            return challenge(PAYMENT_REQUIRED, accepts);
        };
        let payload = match decode_payment_payload(header.as_bytes()) {
            Ok(payload) => payload,
            Err(err) => {
                let err = PaymentError::InvalidPaymentPayload(err.to_string());
                return challenge(&err.to_string(), accepts);
            }
        };
        let Some(requirements) = accepts.iter().find(|r| **r == payload.accepted).cloned() else {
            return challenge(NO_MATCHING_REQUIREMENTS, accepts);
        };

        let sender = Sender::from_request(&payload, req.headers());
        let Ok(amount) = requirements.amount.parse::<u128>() else {
            #[cfg(feature = "telemetry")]
            tracing::warn!(
                route = %route.pattern,
                amount = %requirements.amount,
                "priced amount is not an integer"
            );
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &json!({
                    "error": ErrorReason::InvalidPaymentAmount.as_str(),
                    "message": format!("amount {:?} is not in atomic units", requirements.amount),
                }),
            );
        };
        if let Some((engine, group)) = self.policy_for(route) {
            if let Err(err) = engine.check_incoming(
                group,
                sender.address.as_deref(),
                sender.domain.as_deref(),
                amount,
            ) {
                #[cfg(feature = "telemetry")]
                tracing::debug!(group, "payment rejected by policy: {err}");
                return error_response(
                    StatusCode::FORBIDDEN,
                    &json!({"error": err.reason(), "message": err.to_string()}),
                );
            }
        }

        let request = VerifyRequest {
            payment_payload: payload,
            payment_requirements: requirements,
        };
        match self.facilitator.verify(request.clone()).await {
            Ok(response) if response.is_valid() => {}
            Ok(VerifyResponse::Invalid { reason, .. }) => return challenge(&reason, accepts),
            Ok(_) => return challenge("unexpected_error", accepts),
            Err(err) => return challenge(err.reason(), accepts),
        }

        let response = call_inner(inner, req).await;
        if response.status().is_client_error() || response.status().is_server_error() {
            return response;
        }

        match self.settle(request.into()).await {
            Ok(receipt) => {
                self.record(route, &sender, &receipt, amount);
                attach_receipt(response, &receipt, legacy)
            }
            Err(err) => {
                #[cfg(feature = "telemetry")]
                tracing::warn!(
                    reason = %err.error_reason,
                    "settlement failed after serving the request"
                );
                error_response(
                    StatusCode::PAYMENT_REQUIRED,
                    &json!({
                        "error": SETTLEMENT_FAILED,
                        "reason": err.error_reason,
                        "message": err.error_message,
                    }),
                )
            }
        }
    }

    /// Settles, and after an `unexpected_error` asks once whether the
    /// authorization landed anyway before reporting failure.
    async fn settle(&self, request: SettleRequest) -> Result<SettleResponse, SettleError> {
        let error = match self.facilitator.settle(request.clone()).await {
            Ok(receipt) if receipt.is_success() => return Ok(receipt),
            Ok(SettleResponse::Error {
                reason,
                message,
                payer,
                ..
            }) => SettleError {
                error_message: message,
                payer,
                ..SettleError::new(reason)
            },
            Ok(_) => SettleError::new("unexpected_error"),
            Err(PaymentError::SettlementFailed(err)) => err,
            Err(err) => SettleError::new(err.reason()).with_message(err.to_string()),
        };
        if !error.is_unexpected() {
            return Err(error);
        }

        match self.facilitator.settlement_status(request).await {
            Ok(status) if status.settled => {
                #[cfg(feature = "telemetry")]
                tracing::info!(
                    network = %status.network,
                    "settle failed in transit but the payment landed"
                );
                Ok(SettleResponse::Success {
                    payer: status.payer.or(error.payer).unwrap_or_default(),
                    transaction: status.transaction.unwrap_or_default(),
                    network: status.network,
                    extensions: None,
                })
            }
            _ => Err(error),
        }
    }
}

/// The payment header and whether it is the legacy one.
fn payment_header(headers: &HeaderMap) -> Option<(&HeaderValue, bool)> {
    headers
        .get(PAYMENT_SIGNATURE_HEADER)
        .map(|value| (value, false))
        .or_else(|| headers.get(X_PAYMENT_HEADER).map(|value| (value, true)))
}

async fn call_inner<S>(inner: S, req: Request) -> Response
where
    S: Service<Request, Response = Response, Error = Infallible>,
    S::Future: Send,
{
    let fut = inner.oneshot(req);
    #[cfg(feature = "telemetry")]
    let fut = fut.instrument(tracing::info_span!("inner"));
    match fut.await {
        Ok(response) => response,
        Err(never) => match never {},
    }
}

fn expose_payment_headers(headers: &mut HeaderMap) {
    headers.insert(
        http::header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static(EXPOSED_PAYMENT_HEADERS),
    );
}

fn error_response(status: StatusCode, body: &impl Serialize) -> Response {
    let body = serde_json::to_vec(body).map_or_else(|_| Body::empty(), Body::from);
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    expose_payment_headers(response.headers_mut());
    response
}

fn challenge_response(required: &PaymentRequired) -> Response {
    let mut response = error_response(StatusCode::PAYMENT_REQUIRED, required);
    match encode_payment_required(required).map(HeaderValue::try_from) {
        Ok(Ok(value)) => {
            response
                .headers_mut()
                .insert(HeaderName::from_static(PAYMENT_REQUIRED_LOWER), value);
        }
        _ => *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR,
    }
    response
}

/// Adds `PAYMENT-RESPONSE`, and `X-PAYMENT-RESPONSE` for legacy payers.
///
/// A receipt without a transaction hash (a settlement found only through the
/// status query) is not attached.
fn attach_receipt(mut response: Response, receipt: &SettleResponse, legacy: bool) -> Response {
    let has_transaction = matches!(
        receipt,
        SettleResponse::Success { transaction, .. } if !transaction.is_empty()
    );
    let value = encode_settle_response(receipt)
        .ok()
        .and_then(|encoded| HeaderValue::try_from(encoded).ok());
    let headers = response.headers_mut();
    if let (true, Some(value)) = (has_transaction, value) {
        if legacy {
            headers.insert(HeaderName::from_static(X_PAYMENT_RESPONSE_LOWER), value.clone());
        }
        headers.insert(HeaderName::from_static(PAYMENT_RESPONSE_LOWER), value);
    }
    expose_payment_headers(headers);
    response
}

/// Layer produced by [`PaymentGateway::layer`].
pub struct PaymentGateLayer<F> {
    gateway: Arc<Gateway<F>>,
}

impl<F> Clone for PaymentGateLayer<F> {
    fn clone(&self) -> Self {
        Self {
            gateway: Arc::clone(&self.gateway),
        }
    }
}

impl<F> std::fmt::Debug for PaymentGateLayer<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentGateLayer")
            .field("gateway", &self.gateway)
            .finish()
    }
}

impl<F> PaymentGateLayer<F> {
    /// The configured gateway.
    pub fn gateway(&self) -> &Gateway<F> {
        &self.gateway
    }
}

impl<S, F> Layer<S> for PaymentGateLayer<F>
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
{
    type Service = PaymentGateService<F>;

    fn layer(&self, inner: S) -> Self::Service {
        PaymentGateService {
            gateway: Arc::clone(&self.gateway),
            inner: BoxCloneSyncService::new(inner),
        }
    }
}

/// Service enforcing payment in front of an inner service.
pub struct PaymentGateService<F> {
    gateway: Arc<Gateway<F>>,
    inner: BoxCloneSyncService<Request, Response, Infallible>,
}

impl<F> Clone for PaymentGateService<F> {
    fn clone(&self) -> Self {
        Self {
            gateway: Arc::clone(&self.gateway),
            inner: self.inner.clone(),
        }
    }
}

impl<F> std::fmt::Debug for PaymentGateService<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentGateService")
            .field("gateway", &self.gateway)
            .finish_non_exhaustive()
    }
}

impl<F: Facilitator + 'static> Service<Request> for PaymentGateService<F> {
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Response, Infallible>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let gateway = Arc::clone(&self.gateway);
        let inner = self.inner.clone();
        Box::pin(async move { Ok(gateway.handle(inner, req).await) })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use agent402::chain::ChainId;
    use agent402::policy::{MemoryRecordStore, PolicyConfig, PolicyEngine, RecordStore};
    use agent402::proto::{SettlementStatus, SupportedResponse};
    use agent402::scheme::{AssetAmount, Money, SchemeId};
    use agent402::timestamp::{Clock, SystemClock};
    use tower::service_fn;

    use super::*;
    use crate::constants::{
        ACCESS_CONTROL_EXPOSE_HEADERS, PAYMENT_REQUIRED_HEADER, PAYMENT_RESPONSE_HEADER,
        X_PAYMENT_RESPONSE_HEADER,
    };
    use crate::headers::{decode_payment_required, decode_settle_response, encode_payment_payload};

    const PAYER: &str = "0x857b06519E91e3A54538791bDbb0E22373e36b66";
    const PAY_TO: &str = "0x209693Bc6afc0C5328bA36FaF03C514EF312287C";

    struct UsdcServer;

    impl SchemeId for UsdcServer {
        fn namespace(&self) -> &str {
            "eip155"
        }

        fn scheme(&self) -> &str {
            "exact"
        }
    }

    impl SchemeServer for UsdcServer {
        fn parse_price(
            &self,
            price: &Money,
            _network: &ChainId,
        ) -> Result<AssetAmount, PaymentError> {
            let amount = price
                .to_atomic(6)
                .ok_or_else(|| PaymentError::InvalidPaymentPayload("price".into()))?;
            Ok(AssetAmount {
                asset: "0x036CbD53842c5426634e7929541eC2318f3dCF7e".into(),
                amount: amount.to_string(),
                extra: None,
            })
        }
    }

    /// Prices in whole-token decimals instead of atomic units.
    struct DecimalServer;

    impl SchemeId for DecimalServer {
        fn namespace(&self) -> &str {
            "eip155"
        }

        fn scheme(&self) -> &str {
            "exact"
        }
    }

    impl SchemeServer for DecimalServer {
        fn parse_price(
            &self,
            _price: &Money,
            _network: &ChainId,
        ) -> Result<AssetAmount, PaymentError> {
            Ok(AssetAmount {
                asset: "0x036CbD53842c5426634e7929541eC2318f3dCF7e".into(),
                amount: "0.01".into(),
                extra: None,
            })
        }
    }

    #[derive(Clone, Copy)]
    enum Settle {
        Success,
        Reject,
        Unexpected { landed: bool },
    }

    struct MockFacilitator {
        valid: bool,
        settle: Settle,
        verifies: AtomicUsize,
        settles: AtomicUsize,
        status_queries: AtomicUsize,
        last_settle: Mutex<Option<SettleRequest>>,
    }

    impl MockFacilitator {
        fn new(valid: bool, settle: Settle) -> Arc<Self> {
            Arc::new(Self {
                valid,
                settle,
                verifies: AtomicUsize::new(0),
                settles: AtomicUsize::new(0),
                status_queries: AtomicUsize::new(0),
                last_settle: Mutex::new(None),
            })
        }
    }

    impl Facilitator for MockFacilitator {
        fn verify(
            &self,
            _request: VerifyRequest,
        ) -> BoxFuture<'_, Result<VerifyResponse, PaymentError>> {
            self.verifies.fetch_add(1, Ordering::SeqCst);
            let response = if self.valid {
                VerifyResponse::valid(PAYER.into())
            } else {
                VerifyResponse::invalid(Some(PAYER.into()), "invalid_payment_expired".into())
            };
            Box::pin(async move { Ok(response) })
        }

        fn settle(
            &self,
            request: SettleRequest,
        ) -> BoxFuture<'_, Result<SettleResponse, PaymentError>> {
            self.settles.fetch_add(1, Ordering::SeqCst);
            let network = request.payment_requirements.network.clone();
            *self.last_settle.lock().unwrap() = Some(request);
            let result = match self.settle {
                Settle::Success => Ok(SettleResponse::Success {
                    payer: PAYER.into(),
                    transaction: "0xfeed".into(),
                    network,
                    extensions: None,
                }),
                Settle::Reject => Ok(SettleResponse::Error {
                    reason: "nonce_already_used".into(),
                    message: None,
                    payer: Some(PAYER.into()),
                    network,
                }),
                Settle::Unexpected { .. } => {
                    Err(PaymentError::settlement_unexpected("connection reset"))
                }
            };
            Box::pin(async move { result })
        }

        fn supported(&self) -> BoxFuture<'_, Result<SupportedResponse, PaymentError>> {
            Box::pin(async { Ok(SupportedResponse::default()) })
        }

        fn settlement_status(
            &self,
            request: SettleRequest,
        ) -> BoxFuture<'_, Result<SettlementStatus, PaymentError>> {
            self.status_queries.fetch_add(1, Ordering::SeqCst);
            let landed = matches!(self.settle, Settle::Unexpected { landed: true });
            Box::pin(async move {
                Ok(SettlementStatus {
                    settled: landed,
                    payer: Some(PAYER.into()),
                    transaction: landed.then(|| "0xbeef".to_owned()),
                    network: request.payment_requirements.network,
                })
            })
        }
    }

    fn routes() -> RoutesConfig {
        serde_json::from_value(json!({
            "GET /weather/[city]": {
                "accepts": [{
                    "scheme": "exact",
                    "payTo": PAY_TO,
                    "price": "$0.01",
                    "network": "eip155:84532"
                }],
                "description": "Weather report",
                "policyGroup": "api"
            }
        }))
        .unwrap()
    }

    fn policy() -> SharedPolicyEngine {
        let config: PolicyConfig = serde_json::from_value(json!({
            "groups": [{
                "name": "api",
                "blockedSenders": ["0x000000000000000000000000000000000000dEaD"],
                "incomingLimits": [{"scope": "global", "maxAmount": "15000"}]
            }]
        }))
        .unwrap();
        let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Arc::new(PolicyEngine::with_store(config, store, clock))
    }

    struct Harness {
        service: PaymentGateService<Arc<MockFacilitator>>,
        facilitator: Arc<MockFacilitator>,
        handled: Arc<AtomicUsize>,
        engine: SharedPolicyEngine,
    }

    fn harness(facilitator: Arc<MockFacilitator>, handler_status: StatusCode) -> Harness {
        harness_with(UsdcServer, facilitator, handler_status)
    }

    fn harness_with(
        server: impl SchemeServer + 'static,
        facilitator: Arc<MockFacilitator>,
        handler_status: StatusCode,
    ) -> Harness {
        let engine = policy();
        let layer = PaymentGateway::new(Arc::clone(&facilitator))
            .with_scheme("eip155:*".parse().unwrap(), server)
            .with_routes(routes())
            .unwrap()
            .with_policy(Arc::clone(&engine))
            .with_base_url("https://api.example.com/".parse().unwrap())
            .layer();
        let handled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&handled);
        let inner = service_fn(move |_req: Request| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let mut response = Response::new(Body::from("sunny"));
                *response.status_mut() = handler_status;
                Ok::<_, Infallible>(response)
            }
        });
        Harness {
            service: layer.layer(inner),
            facilitator,
            handled,
            engine,
        }
    }

    async fn challenge_for(harness: &Harness) -> PaymentRequired {
        let response = harness
            .service
            .clone()
            .oneshot(get("/weather/paris", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
        decode_payment_required(response.headers()[PAYMENT_REQUIRED_HEADER].as_bytes()).unwrap()
    }

    fn get(path: &str, payment: Option<(&str, &PaymentPayload)>) -> Request {
        let mut builder = http::Request::builder().method("GET").uri(path);
        if let Some((header, payload)) = payment {
            builder = builder.header(header, encode_payment_payload(payload).unwrap());
        }
        builder.body(Body::empty()).unwrap()
    }

    fn pay(accepted: PaymentRequirements) -> Request {
        get("/weather/paris", Some((PAYMENT_SIGNATURE_HEADER, &paid(accepted, PAYER))))
    }

    fn paid(accepted: PaymentRequirements, from: &str) -> PaymentPayload {
        PaymentPayload {
            x402_version: v2::V2,
            payload: json!({"signature": "0x00", "authorization": {"from": from}}),
            accepted,
            resource: None,
            extensions: None,
        }
    }

    #[tokio::test]
    async fn test_unprotected_route_passes_through() {
        let h = harness(MockFacilitator::new(true, Settle::Success), StatusCode::OK);
        let response = h.service.clone().oneshot(get("/health", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(h.handled.load(Ordering::SeqCst), 1);
        assert_eq!(h.facilitator.verifies.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_payment_is_challenged() {
        let h = harness(MockFacilitator::new(true, Settle::Success), StatusCode::OK);
        let required = challenge_for(&h).await;
        assert_eq!(required.error.as_deref(), Some(PAYMENT_REQUIRED));
        assert_eq!(required.accepts.len(), 1);
        assert_eq!(required.accepts[0].amount, "10000");
        assert_eq!(required.accepts[0].pay_to, PAY_TO);
        let resource = required.resource.unwrap();
        assert_eq!(resource.url, "https://api.example.com/weather/paris");
        assert_eq!(resource.description.as_deref(), Some("Weather report"));
        assert_eq!(h.handled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_challenge_body_and_expose_header() {
        let h = harness(MockFacilitator::new(true, Settle::Success), StatusCode::OK);
        let response = h
            .service
            .clone()
            .oneshot(get("/weather/paris/?units=c", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
        let exposed = response.headers()[ACCESS_CONTROL_EXPOSE_HEADERS].to_str().unwrap();
        assert!(exposed.contains(PAYMENT_REQUIRED_HEADER));
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
    }

    #[tokio::test]
    async fn test_unoffered_requirements_are_rejected() {
        let h = harness(MockFacilitator::new(true, Settle::Success), StatusCode::OK);
        let mut accepted = challenge_for(&h).await.accepts.remove(0);
        accepted.amount = "1".into();
        let response = h
            .service
            .clone()
            .oneshot(pay(accepted))
            .await
            .unwrap();
        let header = &response.headers()[PAYMENT_REQUIRED_HEADER];
        let required = decode_payment_required(header.as_bytes()).unwrap();
        assert_eq!(required.error.as_deref(), Some(NO_MATCHING_REQUIREMENTS));
        assert_eq!(h.facilitator.verifies.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_invalid_payment_skips_handler() {
        let h = harness(MockFacilitator::new(false, Settle::Success), StatusCode::OK);
        let accepted = challenge_for(&h).await.accepts.remove(0);
        let response = h
            .service
            .clone()
            .oneshot(pay(accepted))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
        let header = &response.headers()[PAYMENT_REQUIRED_HEADER];
        let required = decode_payment_required(header.as_bytes()).unwrap();
        assert_eq!(required.error.as_deref(), Some("invalid_payment_expired"));
        assert_eq!(h.handled.load(Ordering::SeqCst), 0);
        assert_eq!(h.facilitator.settles.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_paid_request_is_settled_and_recorded() {
        let h = harness(MockFacilitator::new(true, Settle::Success), StatusCode::OK);
        let accepted = challenge_for(&h).await.accepts.remove(0);
        let response = h
            .service
            .clone()
            .oneshot(pay(accepted.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.headers().contains_key(X_PAYMENT_RESPONSE_HEADER));
        let header = &response.headers()[PAYMENT_RESPONSE_HEADER];
        let receipt = decode_settle_response(header.as_bytes()).unwrap();
        assert!(receipt.is_success());

        let settled = h.facilitator.last_settle.lock().unwrap().clone().unwrap();
        assert_eq!(settled.payment_requirements, accepted);
        assert_eq!(h.engine.get_total("api", "global", Direction::In, None), 10_000);
    }

    #[tokio::test]
    async fn test_legacy_header_gets_legacy_receipt() {
        let h = harness(MockFacilitator::new(true, Settle::Success), StatusCode::OK);
        let accepted = challenge_for(&h).await.accepts.remove(0);
        let response = h
            .service
            .clone()
            .oneshot(get("/weather/paris", Some((X_PAYMENT_HEADER, &paid(accepted, PAYER)))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[X_PAYMENT_RESPONSE_HEADER],
            response.headers()[PAYMENT_RESPONSE_HEADER]
        );
    }

    #[tokio::test]
    async fn test_failed_handler_is_not_charged() {
        let h = harness(
            MockFacilitator::new(true, Settle::Success),
            StatusCode::INTERNAL_SERVER_ERROR,
        );
        let accepted = challenge_for(&h).await.accepts.remove(0);
        let response = h
            .service
            .clone()
            .oneshot(pay(accepted))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(h.handled.load(Ordering::SeqCst), 1);
        assert_eq!(h.facilitator.settles.load(Ordering::SeqCst), 0);
        assert_eq!(h.engine.get_total("api", "global", Direction::In, None), 0);
    }

    #[tokio::test]
    async fn test_settlement_failure_discards_response() {
        let h = harness(MockFacilitator::new(true, Settle::Reject), StatusCode::OK);
        let accepted = challenge_for(&h).await.accepts.remove(0);
        let response = h
            .service
            .clone()
            .oneshot(pay(accepted))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
        assert!(!response.headers().contains_key(PAYMENT_RESPONSE_HEADER));
        // no status query for a definite rejection
        assert_eq!(h.facilitator.status_queries.load(Ordering::SeqCst), 0);
        assert_eq!(h.engine.get_total("api", "global", Direction::In, None), 0);
    }

    #[tokio::test]
    async fn test_lost_settle_response_is_resolved_by_status() {
        let facilitator = MockFacilitator::new(true, Settle::Unexpected { landed: true });
        let h = harness(facilitator, StatusCode::OK);
        let accepted = challenge_for(&h).await.accepts.remove(0);
        let response = h
            .service
            .clone()
            .oneshot(pay(accepted))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let header = &response.headers()[PAYMENT_RESPONSE_HEADER];
        let receipt = decode_settle_response(header.as_bytes()).unwrap();
        assert!(matches!(
            receipt,
            SettleResponse::Success { ref transaction, .. } if transaction == "0xbeef"
        ));
        assert_eq!(h.facilitator.settles.load(Ordering::SeqCst), 1);
        assert_eq!(h.facilitator.status_queries.load(Ordering::SeqCst), 1);

        let facilitator = MockFacilitator::new(true, Settle::Unexpected { landed: false });
        let h = harness(facilitator, StatusCode::OK);
        let accepted = challenge_for(&h).await.accepts.remove(0);
        let response = h
            .service
            .clone()
            .oneshot(pay(accepted))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(h.facilitator.settles.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_policy_is_checked_before_verify() {
        let h = harness(MockFacilitator::new(true, Settle::Success), StatusCode::OK);
        let accepted = challenge_for(&h).await.accepts.remove(0);
        let blocked = paid(accepted.clone(), "0x000000000000000000000000000000000000dEaD");
        let response = h
            .service
            .clone()
            .oneshot(get("/weather/paris", Some((PAYMENT_SIGNATURE_HEADER, &blocked))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(h.facilitator.verifies.load(Ordering::SeqCst), 0);

        // the first payment fits the 15000 limit, the second would exceed it
        let payment = paid(accepted, PAYER);
        let first = h
            .service
            .clone()
            .oneshot(get("/weather/paris", Some((PAYMENT_SIGNATURE_HEADER, &payment))))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let second = h
            .service
            .clone()
            .oneshot(get("/weather/paris", Some((PAYMENT_SIGNATURE_HEADER, &payment))))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::FORBIDDEN);
        assert_eq!(h.facilitator.verifies.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_integer_amount_is_server_error() {
        let facilitator = MockFacilitator::new(true, Settle::Success);
        let h = harness_with(DecimalServer, facilitator, StatusCode::OK);
        let accepted = challenge_for(&h).await.accepts.remove(0);
        assert_eq!(accepted.amount, "0.01");
        let response = h
            .service
            .clone()
            .oneshot(pay(accepted))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(h.facilitator.verifies.load(Ordering::SeqCst), 0);
        assert_eq!(h.facilitator.settles.load(Ordering::SeqCst), 0);
        assert_eq!(h.handled.load(Ordering::SeqCst), 0);
        assert_eq!(h.engine.get_total("api", "global", Direction::In, None), 0);
    }

    #[tokio::test]
    async fn test_unpriceable_route_is_server_error() {
        let facilitator = MockFacilitator::new(true, Settle::Success);
        let layer = PaymentGateway::new(Arc::clone(&facilitator))
            .with_routes(routes())
            .unwrap()
            .layer();
        let inner =
            service_fn(|_req: Request| async { Ok::<_, Infallible>(Response::new(Body::empty())) });
        let response = layer
            .layer(inner)
            .oneshot(get("/weather/paris", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
