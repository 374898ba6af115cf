//! Retrying `402` responses with a signed payment.

use std::sync::Arc;

use agent402::client::PaymentNegotiator;
use agent402::error::PaymentError;
use agent402::policy::{Direction, SharedPolicyEngine};
use agent402::proto::{PaymentPayload, PaymentRequired};
use http::{Extensions, HeaderValue, StatusCode};
use reqwest::{Request, Response};
use reqwest_middleware as rqm;
#[cfg(feature = "telemetry")]
use tracing::{debug, info, instrument, trace, warn};

use crate::constants::{PAYMENT_REQUIRED_HEADER, PAYMENT_SIGNATURE_HEADER, X_PAYMENT_HEADER};
use crate::error::HttpError;
use crate::headers::{decode_payment_required, encode_payment_payload};

/// Errors raised while paying for a request.
#[derive(Debug, thiserror::Error)]
pub enum PaymentClientError {
    /// The request body is a stream and cannot be sent twice.
    #[error("request cannot be retried with a payment: body is not cloneable")]
    RequestNotCloneable,
    /// The `402` carried neither a readable header nor a JSON body.
    #[error("invalid 402 response: {0}")]
    InvalidChallenge(String),
    /// The negotiator could not produce a payload.
    #[error(transparent)]
    Payment(#[from] PaymentError),
    /// The payload could not be encoded into a header.
    #[error(transparent)]
    Header(#[from] HttpError),
    /// The encoded header contains invalid bytes.
    #[error("encoded payment is not a valid header value")]
    HeaderValue(#[from] http::header::InvalidHeaderValue),
}

/// Outgoing limits applied before paying.
#[derive(Clone)]
struct OutgoingPolicy {
    engine: SharedPolicyEngine,
    group: String,
}

/// Middleware answering `402 Payment Required` once per request.
///
/// On a `402` it reads the challenge, asks the [`PaymentNegotiator`] for a
/// payload and sends the request again with it. The retry's response is
/// returned as is, even when it is another `402`.
#[derive(Clone)]
pub struct PaymentRetryMiddleware {
    negotiator: Arc<PaymentNegotiator>,
    policy: Option<OutgoingPolicy>,
}

impl std::fmt::Debug for PaymentRetryMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentRetryMiddleware")
            .field("negotiator", &self.negotiator)
            .field("policy_group", &self.policy.as_ref().map(|p| &p.group))
            .finish()
    }
}

impl PaymentRetryMiddleware {
    /// Middleware paying with `negotiator`.
    #[must_use]
    pub fn new(negotiator: PaymentNegotiator) -> Self {
        Self {
            negotiator: Arc::new(negotiator),
            policy: None,
        }
    }

    /// Enforces the outgoing limits of `group` and records what was paid.
    ///
    /// The recipient address and the request host select the limit scope.
    #[must_use]
    pub fn with_policy(mut self, engine: SharedPolicyEngine, group: impl Into<String>) -> Self {
        self.policy = Some(OutgoingPolicy {
            engine,
            group: group.into(),
        });
        self
    }

    /// The negotiator building payloads.
    pub fn negotiator(&self) -> &PaymentNegotiator {
        &self.negotiator
    }

    /// Turns a `402` into a signed payload and the header to send it in.
    ///
    /// # Errors
    ///
    /// [`PaymentClientError::InvalidChallenge`] when the response carries no
    /// challenge, otherwise the negotiator's or the policy's error.
    #[cfg_attr(
        feature = "telemetry",
        instrument(name = "agent402.reqwest.pay", skip_all, err)
    )]
    pub async fn pay(
        &self,
        response: Response,
    ) -> Result<(&'static str, PaymentPayload), PaymentClientError> {
        let host = response.url().host_str().map(str::to_owned);
        let required = parse_payment_required(response).await?;
        let payload = self.negotiator.create_payment_payload(&required).await?;
        if let Some(policy) = &self.policy {
            policy.engine.check_outgoing(
                &policy.group,
                Some(&payload.accepted.pay_to),
                host.as_deref(),
                amount_of(&payload)?,
            )?;
        }
        #[cfg(feature = "telemetry")]
        debug!(
            network = %payload.accepted.network,
            amount = %payload.accepted.amount,
            "created payment payload"
        );
        Ok((payment_header_for(required.x402_version), payload))
    }

    fn record(&self, payload: &PaymentPayload, host: Option<&str>) {
        let Some(policy) = &self.policy else {
            return;
        };
        // `pay` already rejected amounts that do not parse
        let Ok(amount) = amount_of(payload) else {
            return;
        };
        let pay_to = Some(payload.accepted.pay_to.as_str());
        let scope = policy
            .engine
            .scope_for(&policy.group, Direction::Out, pay_to, host);
        if let Err(err) = policy
            .engine
            .record_outgoing(&policy.group, &scope, amount)
        {
            #[cfg(feature = "telemetry")]
            warn!(group = %policy.group, scope = %scope, "failed to record payment: {err}");
            #[cfg(not(feature = "telemetry"))]
            let _ = err;
        }
    }
}

/// `X-PAYMENT` for version 1 challenges, `PAYMENT-SIGNATURE` otherwise.
#[must_use]
pub const fn payment_header_for(version: u32) -> &'static str {
    if version == 1 {
        X_PAYMENT_HEADER
    } else {
        PAYMENT_SIGNATURE_HEADER
    }
}

fn amount_of(payload: &PaymentPayload) -> Result<u128, PaymentError> {
    let amount = &payload.accepted.amount;
    amount.parse().map_err(|_| {
        PaymentError::InvalidPaymentPayload(format!("amount {amount:?} is not in atomic units"))
    })
}

/// Runs the next middleware or the HTTP client.
#[cfg_attr(
    feature = "telemetry",
    instrument(name = "agent402.reqwest.next", skip_all)
)]
async fn run_next(
    next: rqm::Next<'_>,
    req: Request,
    extensions: &mut Extensions,
) -> rqm::Result<Response> {
    next.run(req, extensions).await
}

#[async_trait::async_trait]
impl rqm::Middleware for PaymentRetryMiddleware {
    #[cfg_attr(
        feature = "telemetry",
        instrument(name = "agent402.reqwest.handle", skip_all, err)
    )]
    async fn handle(
        &self,
        req: Request,
        extensions: &mut Extensions,
        next: rqm::Next<'_>,
    ) -> rqm::Result<Response> {
        let retry = req.try_clone();
        let res = run_next(next.clone(), req, extensions).await?;
        if res.status() != StatusCode::PAYMENT_REQUIRED {
            #[cfg(feature = "telemetry")]
            trace!(status = ?res.status(), "no payment required");
            return Ok(res);
        }

        #[cfg(feature = "telemetry")]
        info!(url = %res.url(), "received 402 Payment Required, paying");

        let host = res.url().host_str().map(str::to_owned);
        let (header, payload) = self
            .pay(res)
            .await
            .map_err(|e| rqm::Error::Middleware(e.into()))?;
        let value = encode_payment_payload(&payload)
            .map_err(PaymentClientError::from)
            .and_then(|encoded| Ok(HeaderValue::try_from(encoded)?))
            .map_err(|e| rqm::Error::Middleware(e.into()))?;

        let mut retry = retry.ok_or_else(|| {
            rqm::Error::Middleware(PaymentClientError::RequestNotCloneable.into())
        })?;
        retry.headers_mut().insert(header, value);

        let res = run_next(next, retry, extensions).await?;
        if res.status().is_success() {
            self.record(&payload, host.as_deref());
        }
        Ok(res)
    }
}

/// Reads the challenge from `PAYMENT-REQUIRED`, falling back to a JSON body.
///
/// # Errors
///
/// [`PaymentClientError::InvalidChallenge`] when neither form decodes.
#[cfg_attr(
    feature = "telemetry",
    instrument(name = "agent402.reqwest.parse_payment_required", skip(response), err)
)]
pub async fn parse_payment_required(
    response: Response,
) -> Result<PaymentRequired, PaymentClientError> {
    if let Some(header) = response.headers().get(PAYMENT_REQUIRED_HEADER) {
        match decode_payment_required(header.as_bytes()) {
            Ok(required) => return Ok(required),
            #[cfg(feature = "telemetry")]
            Err(err) => debug!("unreadable payment-required header, trying the body: {err}"),
            #[cfg(not(feature = "telemetry"))]
            Err(_) => {}
        }
    }
    response
        .json::<PaymentRequired>()
        .await
        .map_err(|e| PaymentClientError::InvalidChallenge(e.to_string()))
}
