#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! HTTP transport for pay-per-request payments.
//!
//! Payment messages travel as base64-encoded JSON in HTTP headers. This crate
//! provides the header codec plus, behind features, both ends of the
//! exchange.
//!
//! # Modules
//!
//! - [`constants`] - Header names
//! - [`headers`] - Base64 JSON encoding of challenges, payloads and receipts
//! - [`error`] - Header codec errors
//! - [`server`] - The resource gateway and the remote facilitator client (feature: `server`)
//! - [`client`] - A `reqwest` middleware that pays and retries on `402` (feature: `client`)
//!
//! # Feature Flags
//!
//! - `server` - tower gateway layer, route patterns, [`server::FacilitatorClient`]
//! - `client` - [`client::PaymentRetryMiddleware`]
//! - `telemetry` - tracing instrumentation

pub mod constants;
pub mod error;
pub mod headers;

#[cfg(feature = "client")]
pub mod client;
#[cfg(feature = "server")]
pub mod server;

pub use error::HttpError;
