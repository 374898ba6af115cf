//! Paying HTTP client built on `reqwest`.
//!
//! [`PaymentRetryMiddleware`] wraps a [`PaymentNegotiator`]: when a request
//! comes back `402 Payment Required`, it signs one of the offered options and
//! sends the request again with the payment header.
//!
//! ```rust,no_run
//! use agent402::client::PaymentNegotiator;
//! use agent402_http::client::{
//!     PaymentRetryMiddleware, ReqwestWithPayments, ReqwestWithPaymentsBuild,
//! };
//!
//! # async fn demo(negotiator: PaymentNegotiator) -> Result<(), Box<dyn std::error::Error>> {
//! let client = reqwest::Client::new()
//!     .with_payments(PaymentRetryMiddleware::new(negotiator))
//!     .build();
//! let weather = client.get("https://api.example.com/weather").send().await?;
//! # drop(weather);
//! # Ok(())
//! # }
//! ```
//!
//! [`PaymentNegotiator`]: agent402::client::PaymentNegotiator

mod middleware;

pub use middleware::*;

use reqwest::{Client, ClientBuilder};
use reqwest_middleware as rqm;

/// Adds payment handling to a reqwest [`Client`] or [`ClientBuilder`].
pub trait ReqwestWithPayments<A> {
    /// Wraps the client in `middleware`.
    fn with_payments(self, middleware: PaymentRetryMiddleware) -> ReqwestWithPaymentsBuilder<A>;
}

impl ReqwestWithPayments<Self> for Client {
    fn with_payments(self, middleware: PaymentRetryMiddleware) -> ReqwestWithPaymentsBuilder<Self> {
        ReqwestWithPaymentsBuilder {
            inner: self,
            middleware,
        }
    }
}

impl ReqwestWithPayments<Self> for ClientBuilder {
    fn with_payments(self, middleware: PaymentRetryMiddleware) -> ReqwestWithPaymentsBuilder<Self> {
        ReqwestWithPaymentsBuilder {
            inner: self,
            middleware,
        }
    }
}

/// A client or builder waiting to be wrapped with [`PaymentRetryMiddleware`].
#[allow(missing_debug_implementations)] // generic A may not implement Debug
pub struct ReqwestWithPaymentsBuilder<A> {
    inner: A,
    middleware: PaymentRetryMiddleware,
}

/// Finishes a [`ReqwestWithPaymentsBuilder`].
pub trait ReqwestWithPaymentsBuild {
    /// What [`build`](Self::build) returns.
    type BuildResult;
    /// What [`builder`](Self::builder) returns.
    type BuilderResult;

    /// Builds the client with the payment middleware installed.
    fn build(self) -> Self::BuildResult;

    /// Returns a middleware builder, for stacking more middleware.
    fn builder(self) -> Self::BuilderResult;
}

impl ReqwestWithPaymentsBuild for ReqwestWithPaymentsBuilder<Client> {
    type BuildResult = rqm::ClientWithMiddleware;
    type BuilderResult = rqm::ClientBuilder;

    fn build(self) -> Self::BuildResult {
        self.builder().build()
    }

    fn builder(self) -> Self::BuilderResult {
        rqm::ClientBuilder::new(self.inner).with(self.middleware)
    }
}

impl ReqwestWithPaymentsBuild for ReqwestWithPaymentsBuilder<ClientBuilder> {
    type BuildResult = Result<rqm::ClientWithMiddleware, reqwest::Error>;
    type BuilderResult = Result<rqm::ClientBuilder, reqwest::Error>;

    fn build(self) -> Self::BuildResult {
        Ok(self.builder()?.build())
    }

    fn builder(self) -> Self::BuilderResult {
        let client = self.inner.build()?;
        Ok(rqm::ClientBuilder::new(client).with(self.middleware))
    }
}
