//! A [`Facilitator`] backed by a remote facilitator over HTTP.
//!
//! [`FacilitatorClient`] talks to `POST ./verify`, `POST ./settle`,
//! `GET ./supported` and `POST ./settlement-status` relative to a base URL.
//!
//! - Each call carries its own timeout (verify 30 s, settle 60 s by default).
//! - `/supported` is cached for a configurable TTL.
//! - A structured `{"error": reason, "message": ...}` reply keeps its reason.
//!   Transport failures, timeouts and unreadable replies surface as
//!   `unexpected_error` so network details never reach a paying client.

use std::time::{Duration, Instant};

use agent402::error::{PaymentError, SettleError, VerifyError};
use agent402::facilitator::{BoxFuture, Facilitator};
use agent402::proto::{
    SettleRequest, SettleResponse, SettlementStatus, SupportedResponse, VerifyRequest,
    VerifyResponse,
};
use http::{HeaderMap, StatusCode};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::RwLock;
use url::Url;

#[cfg(feature = "telemetry")]
use tracing::{Instrument, instrument};

#[derive(Clone, Debug)]
struct SupportedCacheState {
    response: SupportedResponse,
    expires_at: Instant,
}

/// TTL cache for the `/supported` response.
///
/// Each clone starts empty.
#[derive(Debug)]
pub struct SupportedCache {
    ttl: Duration,
    state: RwLock<Option<SupportedCacheState>>,
}

impl SupportedCache {
    /// An empty cache holding entries for `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: RwLock::new(None),
        }
    }

    /// The cached response, unless it has expired.
    pub async fn get(&self) -> Option<SupportedResponse> {
        let guard = self.state.read().await;
        let cache = guard.as_ref()?;
        (Instant::now() < cache.expires_at).then(|| cache.response.clone())
    }

    /// Stores `response` until the TTL passes.
    pub async fn set(&self, response: SupportedResponse) {
        *self.state.write().await = Some(SupportedCacheState {
            response,
            expires_at: Instant::now() + self.ttl,
        });
    }

    /// Drops the cached response.
    pub async fn clear(&self) {
        *self.state.write().await = None;
    }
}

impl Clone for SupportedCache {
    fn clone(&self) -> Self {
        Self::new(self.ttl)
    }
}

/// Errors talking to a remote facilitator.
#[derive(Debug, thiserror::Error)]
pub enum FacilitatorClientError {
    /// URL parse error.
    #[error("URL parse error: {context}: {source}")]
    UrlParse {
        /// What was being built.
        context: &'static str,
        /// The parse failure.
        #[source]
        source: url::ParseError,
    },
    /// Transport error, including timeouts.
    #[error("HTTP error: {context}: {source}")]
    Http {
        /// The endpoint, e.g. `POST /verify`.
        context: &'static str,
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },
    /// The reply body was not the expected JSON.
    #[error("Failed to deserialize JSON: {context}: {source}")]
    JsonDeserialization {
        /// The endpoint.
        context: &'static str,
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },
    /// Any status other than `200 OK`.
    #[error("Unexpected HTTP status {status}: {context}: {body}")]
    HttpStatus {
        /// The endpoint.
        context: &'static str,
        /// The status received.
        status: StatusCode,
        /// The reply body, verbatim.
        body: String,
    },
    /// The reply body could not be read.
    #[error("Failed to read response body as text: {context}: {source}")]
    ResponseBodyRead {
        /// The endpoint.
        context: &'static str,
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },
}

/// Error body returned by the facilitator server.
#[derive(Debug, Deserialize)]
struct RemoteError {
    error: String,
    #[serde(default)]
    message: Option<String>,
}

impl FacilitatorClientError {
    /// The `{error, message}` pair of a structured error reply.
    fn remote(&self) -> Option<RemoteError> {
        match self {
            Self::HttpStatus { body, .. } => serde_json::from_str(body).ok(),
            _ => None,
        }
    }

    fn into_verify_error(self) -> PaymentError {
        match self.remote() {
            Some(RemoteError { error, message }) => {
                let mut err = VerifyError::new(error);
                err.invalid_message = message;
                PaymentError::VerificationFailed(err)
            }
            None => PaymentError::verification_unexpected(self.to_string()),
        }
    }

    fn into_settle_error(self) -> PaymentError {
        match self.remote() {
            Some(RemoteError { error, message }) => {
                let mut err = SettleError::new(error);
                err.error_message = message;
                PaymentError::SettlementFailed(err)
            }
            None => PaymentError::settlement_unexpected(self.to_string()),
        }
    }
}

/// Client for a remote facilitator.
#[derive(Clone, Debug)]
pub struct FacilitatorClient {
    base_url: Url,
    verify_url: Url,
    settle_url: Url,
    supported_url: Url,
    settlement_status_url: Url,
    client: Client,
    headers: HeaderMap,
    verify_timeout: Duration,
    settle_timeout: Duration,
    supported_cache: SupportedCache,
}

impl FacilitatorClient {
    /// Default TTL of the `/supported` cache (10 minutes).
    pub const DEFAULT_SUPPORTED_CACHE_TTL: Duration = Duration::from_secs(600);
    /// Default timeout of `/verify`, `/supported` and `/settlement-status`.
    pub const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(30);
    /// Default timeout of `/settle`, which waits for inclusion.
    pub const DEFAULT_SETTLE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Builds a client whose endpoints are resolved relative to `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`FacilitatorClientError::UrlParse`] if an endpoint URL cannot
    /// be joined.
    pub fn try_new(base_url: Url) -> Result<Self, FacilitatorClientError> {
        let join = |path: &str, context: &'static str| {
            base_url
                .join(path)
                .map_err(|source| FacilitatorClientError::UrlParse { context, source })
        };
        let verify_url = join("./verify", "Failed to construct ./verify URL")?;
        let settle_url = join("./settle", "Failed to construct ./settle URL")?;
        let supported_url = join("./supported", "Failed to construct ./supported URL")?;
        let settlement_status_url = join(
            "./settlement-status",
            "Failed to construct ./settlement-status URL",
        )?;
        Ok(Self {
            base_url,
            verify_url,
            settle_url,
            supported_url,
            settlement_status_url,
            client: Client::new(),
            headers: HeaderMap::new(),
            verify_timeout: Self::DEFAULT_VERIFY_TIMEOUT,
            settle_timeout: Self::DEFAULT_SETTLE_TIMEOUT,
            supported_cache: SupportedCache::new(Self::DEFAULT_SUPPORTED_CACHE_TTL),
        })
    }

    /// The facilitator's base URL.
    pub const fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// `<base>/verify`.
    pub const fn verify_url(&self) -> &Url {
        &self.verify_url
    }

    /// `<base>/settle`.
    pub const fn settle_url(&self) -> &Url {
        &self.settle_url
    }

    /// `<base>/supported`.
    pub const fn supported_url(&self) -> &Url {
        &self.supported_url
    }

    /// `<base>/settlement-status`.
    pub const fn settlement_status_url(&self) -> &Url {
        &self.settlement_status_url
    }

    /// The `/supported` cache.
    pub const fn supported_cache(&self) -> &SupportedCache {
        &self.supported_cache
    }

    /// Sends `headers` with every request, e.g. an API key.
    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Deadline for `/verify`.
    #[must_use]
    pub const fn with_verify_timeout(mut self, timeout: Duration) -> Self {
        self.verify_timeout = timeout;
        self
    }

    /// Deadline for `/settle`.
    #[must_use]
    pub const fn with_settle_timeout(mut self, timeout: Duration) -> Self {
        self.settle_timeout = timeout;
        self
    }

    /// How long a `/supported` answer is reused.
    #[must_use]
    pub fn with_supported_cache_ttl(mut self, ttl: Duration) -> Self {
        self.supported_cache = SupportedCache::new(ttl);
        self
    }

    /// Fetches `/supported` on every call.
    #[must_use]
    pub fn without_supported_cache(self) -> Self {
        self.with_supported_cache_ttl(Duration::ZERO)
    }

    /// Sends `POST /verify`.
    ///
    /// # Errors
    ///
    /// Returns [`FacilitatorClientError`] if the request fails.
    pub async fn post_verify(
        &self,
        request: &VerifyRequest,
    ) -> Result<VerifyResponse, FacilitatorClientError> {
        self.post_json(&self.verify_url, "POST /verify", request, self.verify_timeout)
            .await
    }

    /// Sends `POST /settle`.
    ///
    /// # Errors
    ///
    /// Returns [`FacilitatorClientError`] if the request fails.
    pub async fn post_settle(
        &self,
        request: &SettleRequest,
    ) -> Result<SettleResponse, FacilitatorClientError> {
        self.post_json(&self.settle_url, "POST /settle", request, self.settle_timeout)
            .await
    }

    /// Sends `POST /settlement-status`.
    ///
    /// # Errors
    ///
    /// Returns [`FacilitatorClientError`] if the request fails.
    pub async fn post_settlement_status(
        &self,
        request: &SettleRequest,
    ) -> Result<SettlementStatus, FacilitatorClientError> {
        self.post_json(
            &self.settlement_status_url,
            "POST /settlement-status",
            request,
            self.verify_timeout,
        )
        .await
    }

    /// Sends `GET /supported`, bypassing the cache.
    #[cfg_attr(
        feature = "telemetry",
        instrument(name = "agent402.facilitator_client.supported", skip_all, err)
    )]
    async fn fetch_supported(&self) -> Result<SupportedResponse, FacilitatorClientError> {
        self.get_json(&self.supported_url, "GET /supported", self.verify_timeout)
            .await
    }

    /// `GET /supported`, served from the cache while it is fresh.
    ///
    /// # Errors
    ///
    /// Returns [`FacilitatorClientError`] if the request fails.
    pub async fn get_supported(&self) -> Result<SupportedResponse, FacilitatorClientError> {
        if let Some(response) = self.supported_cache.get().await {
            return Ok(response);
        }

        #[cfg(feature = "telemetry")]
        tracing::debug!("agent402.facilitator_client.supported_cache_miss");

        let response = self.fetch_supported().await?;
        self.supported_cache.set(response.clone()).await;
        Ok(response)
    }

    async fn post_json<T, R>(
        &self,
        url: &Url,
        context: &'static str,
        payload: &T,
        timeout: Duration,
    ) -> Result<R, FacilitatorClientError>
    where
        T: serde::Serialize + Sync + ?Sized,
        R: serde::de::DeserializeOwned,
    {
        let req = self
            .client
            .post(url.clone())
            .json(payload)
            .headers(self.headers.clone())
            .timeout(timeout);
        let result = Self::read_json(req, context).await;
        record_result(&result, context);
        result
    }

    async fn get_json<R>(
        &self,
        url: &Url,
        context: &'static str,
        timeout: Duration,
    ) -> Result<R, FacilitatorClientError>
    where
        R: serde::de::DeserializeOwned,
    {
        let req = self
            .client
            .get(url.clone())
            .headers(self.headers.clone())
            .timeout(timeout);
        let result = Self::read_json(req, context).await;
        record_result(&result, context);
        result
    }

    async fn read_json<R>(
        req: reqwest::RequestBuilder,
        context: &'static str,
    ) -> Result<R, FacilitatorClientError>
    where
        R: serde::de::DeserializeOwned,
    {
        let http_response = req
            .send()
            .await
            .map_err(|source| FacilitatorClientError::Http { context, source })?;

        if http_response.status() == StatusCode::OK {
            http_response
                .json::<R>()
                .await
                .map_err(|source| FacilitatorClientError::JsonDeserialization { context, source })
        } else {
            let status = http_response.status();
            let body = http_response
                .text()
                .await
                .map_err(|source| FacilitatorClientError::ResponseBodyRead { context, source })?;
            Err(FacilitatorClientError::HttpStatus {
                context,
                status,
                body,
            })
        }
    }
}

impl Facilitator for FacilitatorClient {
    fn verify(
        &self,
        request: VerifyRequest,
    ) -> BoxFuture<'_, Result<VerifyResponse, PaymentError>> {
        let fut = async move {
            self.post_verify(&request)
                .await
                .map_err(FacilitatorClientError::into_verify_error)
        };
        #[cfg(feature = "telemetry")]
        let fut = fut.instrument(tracing::info_span!(
            "agent402.facilitator_client.verify",
            timeout = ?self.verify_timeout
        ));
        Box::pin(fut)
    }

    fn settle(
        &self,
        request: SettleRequest,
    ) -> BoxFuture<'_, Result<SettleResponse, PaymentError>> {
        let fut = async move {
            self.post_settle(&request)
                .await
                .map_err(FacilitatorClientError::into_settle_error)
        };
        #[cfg(feature = "telemetry")]
        let fut = fut.instrument(tracing::info_span!(
            "agent402.facilitator_client.settle",
            timeout = ?self.settle_timeout
        ));
        Box::pin(fut)
    }

    fn supported(&self) -> BoxFuture<'_, Result<SupportedResponse, PaymentError>> {
        Box::pin(async move {
            self.get_supported()
                .await
                .map_err(|e| PaymentError::verification_unexpected(e.to_string()))
        })
    }

    fn settlement_status(
        &self,
        request: SettleRequest,
    ) -> BoxFuture<'_, Result<SettlementStatus, PaymentError>> {
        Box::pin(async move {
            self.post_settlement_status(&request)
                .await
                .map_err(FacilitatorClientError::into_settle_error)
        })
    }
}

/// Parses the URL, forcing exactly one trailing slash so endpoints join
/// under it rather than replacing its last segment.
impl TryFrom<&str> for FacilitatorClient {
    type Error = FacilitatorClientError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let mut normalized = value.trim_end_matches('/').to_owned();
        normalized.push('/');
        let url = Url::parse(&normalized).map_err(|source| FacilitatorClientError::UrlParse {
            context: "Failed to parse base url",
            source,
        })?;
        Self::try_new(url)
    }
}

impl TryFrom<String> for FacilitatorClient {
    type Error = FacilitatorClientError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}

#[cfg(feature = "telemetry")]
fn record_result<R>(result: &Result<R, FacilitatorClientError>, context: &'static str) {
    if let Err(err) = result {
        tracing::warn!(context, error = %err, "request to facilitator failed");
    }
}

#[cfg(not(feature = "telemetry"))]
const fn record_result<R>(_result: &Result<R, FacilitatorClientError>, _context: &'static str) {}
