#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Core types for pay-per-request HTTP payments.
//!
//! A resource server answers unpaid requests with `402 Payment Required` and a
//! list of accepted payment options. A client picks one, signs a payment
//! authorization and retries. A facilitator verifies the authorization and
//! settles it on-chain before the server releases its response.
//!
//! This crate is chain-agnostic. Chain mechanisms live in separate crates
//! (see `agent402-evm`), and HTTP plumbing in `agent402-http`.
//!
//! # Modules
//!
//! - [`chain`] - CAIP-2 chain identifiers and network patterns
//! - [`scheme`] - Scheme traits and the versioned [`scheme::SchemeRegistry`]
//! - [`client`] - The [`client::PaymentNegotiator`] turning a challenge into a signed payload
//! - [`facilitator`] - The verify/settle/supported contract and a registry-backed dispatcher
//! - [`hooks`] - Lifecycle hooks around facilitator verify/settle
//! - [`policy`] - Sender allow/block rules and windowed payment limits
//! - [`proto`] - Wire format types
//! - [`error`] - The payment error taxonomy
//!
//! # Feature Flags
//!
//! - `telemetry` - Enables tracing instrumentation

pub mod chain;
pub mod client;
pub mod config;
pub mod encoding;
pub mod error;
pub mod facilitator;
pub mod hooks;
pub mod policy;
pub mod proto;
pub mod scheme;
pub mod timestamp;

pub use error::PaymentError;
pub use facilitator::{BoxFuture, Facilitator};
