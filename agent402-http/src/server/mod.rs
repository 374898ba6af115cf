//! Server side: a tower layer that puts routes behind payment.
//!
//! Build a [`PaymentGateway`] with the facilitator to use (local or a remote
//! [`FacilitatorClient`]), the [`SchemeServer`](agent402::scheme::SchemeServer)s
//! that turn prices into requirements, and the protected routes; then mount
//! [`PaymentGateway::layer`] on the router.
//!
//! For each request the gateway:
//!
//! 1. passes through requests no route matches,
//! 2. answers `402` with a `PAYMENT-REQUIRED` challenge when no payment is attached,
//! 3. checks the route's policy group, then verifies the payment,
//! 4. runs the handler and settles only if it succeeded,
//! 5. attaches the `PAYMENT-RESPONSE` receipt and records the payment.

mod facilitator_client;
mod gateway;
mod pricing;
mod routes;

pub use facilitator_client::{FacilitatorClient, FacilitatorClientError, SupportedCache};
pub use gateway::{Gateway, PaymentGateLayer, PaymentGateService, PaymentGateway, ProtectedRoute};
pub use pricing::{DynamicPricing, PricingSource, StaticPricing};
pub use routes::{RoutePattern, RoutePatternError, normalize_path};
