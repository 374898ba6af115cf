//! Facilitator server for agent payments.
//!
//! Verifies and settles `exact` payments on the configured EVM chains and
//! submits delegated agent registrations to the identity registry.
//!
//! # Modules
//!
//! - [`handlers`] - Axum handlers and router
//! - [`setup`] - Chain providers and mechanisms from configuration
//! - [`config`] - TOML configuration with environment variable expansion
//! - [`error`] - Error responses
//! - [`hooks`] - Outcome logging
//! - [`util`] - Shutdown signal handling

pub mod config;
pub mod error;
pub mod handlers;
pub mod hooks;
pub mod setup;
pub mod util;

pub use handlers::{FacilitatorState, facilitator_router};
pub use setup::build_state;
