//! Payment scheme system.
//!
//! A scheme is a named payment mechanism (e.g. `exact`) pluggable per network.
//! Implementations are keyed by protocol version, [`NetworkPattern`] and scheme
//! name in a [`SchemeRegistry`].
//!
//! - [`SchemeClient`] - Client side: produces the scheme-specific signed payload
//! - [`SchemeServer`] - Server side: turns a price into [`PaymentRequirements`]
//! - [`crate::Facilitator`] - Facilitator side: verifies and settles
//!
//! [`NetworkPattern`]: crate::chain::NetworkPattern

mod registry;
mod server;

pub use registry::*;
pub use server::*;

use crate::error::PaymentError;
use crate::facilitator::BoxFuture;
use crate::proto::PaymentRequirements;

/// A unit struct representing the string literal `"exact"`.
///
/// The canonical name of the exact-amount transfer scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExactScheme;

impl ExactScheme {
    /// The string literal value: `"exact"`.
    pub const VALUE: &'static str = "exact";
}

impl std::fmt::Display for ExactScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(Self::VALUE)
    }
}

impl AsRef<str> for ExactScheme {
    fn as_ref(&self) -> &str {
        Self::VALUE
    }
}

impl std::str::FromStr for ExactScheme {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == Self::VALUE {
            Ok(Self)
        } else {
            Err(format!("expected '{}', got '{s}'", Self::VALUE))
        }
    }
}

impl serde::Serialize for ExactScheme {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(Self::VALUE)
    }
}

impl<'de> serde::Deserialize<'de> for ExactScheme {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Identifies a scheme implementation by chain namespace and scheme name.
pub trait SchemeId {
    /// Returns the chain namespace (e.g., "eip155").
    fn namespace(&self) -> &str;
    /// Returns the scheme name (e.g., "exact").
    fn scheme(&self) -> &str;
    /// Returns the CAIP-2 family pattern this scheme supports, e.g. `"eip155:*"`.
    fn caip_family(&self) -> String {
        format!("{}:*", self.namespace())
    }
    /// Returns the full scheme identifier (e.g., "eip155-exact").
    fn id(&self) -> String {
        format!("{}-{}", self.namespace(), self.scheme())
    }
}

/// Client-side half of a scheme: signs a payment for chosen requirements.
///
/// Returns only the scheme-specific `payload` object; the negotiator wraps it
/// into a [`PaymentPayload`](crate::proto::PaymentPayload).
pub trait SchemeClient: Send + Sync {
    /// The scheme name this client produces payloads for.
    fn scheme(&self) -> &str;

    /// Creates the signed scheme payload for `requirements`.
    fn create_payment_payload<'a>(
        &'a self,
        requirements: &'a PaymentRequirements,
    ) -> BoxFuture<'a, Result<serde_json::Value, PaymentError>>;
}

impl<T: SchemeClient + ?Sized> SchemeClient for Box<T> {
    fn scheme(&self) -> &str {
        (**self).scheme()
    }

    fn create_payment_payload<'a>(
        &'a self,
        requirements: &'a PaymentRequirements,
    ) -> BoxFuture<'a, Result<serde_json::Value, PaymentError>> {
        (**self).create_payment_payload(requirements)
    }
}
