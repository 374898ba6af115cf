#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! EIP-155 (EVM) support for pay-per-request payments and agent identity.
//!
//! # Modules
//!
//! - [`auth`] - Deterministic encode/hash/sign/verify for the two signed
//!   authorizations: ERC-3009 transfers and identity feedback grants
//! - [`chain`] - Chain references, and (with `facilitator`) the transaction
//!   provider with pending-nonce management
//! - [`exact`] - The `exact` scheme: client signing, server pricing and the
//!   facilitator's verify/settle/settlement-status
//! - [`identity`] - Delegated agent registration (`facilitator` feature)
//!
//! # Feature Flags
//!
//! - `client` - Payment signing with a local key
//! - `facilitator` - On-chain verification, settlement and registration
//! - `telemetry` - Tracing instrumentation

pub mod auth;
pub mod chain;
pub mod exact;
#[cfg(feature = "facilitator")]
pub mod identity;

mod networks;
pub use networks::*;

pub use exact::{Eip155Exact, ExactEvmServer};

#[cfg(feature = "client")]
pub use exact::client::{ExactEvmClient, SignerLike};
#[cfg(feature = "facilitator")]
pub use exact::facilitator::Eip155ExactFacilitator;
