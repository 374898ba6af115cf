//! EVM chain references and transaction plumbing.
//!
//! - [`Eip155ChainReference`] - The numeric chain id behind an `eip155:<n>` network
//! - [`Eip155ChainProvider`] - RPC provider with round-robin signers (`facilitator`)
//! - [`PendingNonceManager`] - Nonce tracking that survives failed sends (`facilitator`)

#[cfg(feature = "facilitator")]
mod nonce;
#[cfg(feature = "facilitator")]
mod provider;

#[cfg(feature = "facilitator")]
pub use nonce::*;
#[cfg(feature = "facilitator")]
pub use provider::*;

use std::fmt;
use std::str::FromStr;

use agent402::chain::ChainId;
use serde::{Deserialize, Serialize};

/// The CAIP-2 namespace of EVM chains.
pub const EIP155_NAMESPACE: &str = "eip155";

/// Numeric EIP-155 chain id, e.g. `8453` for Base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Eip155ChainReference(u64);

impl Eip155ChainReference {
    /// Wraps a raw chain id.
    #[must_use]
    pub const fn new(chain_id: u64) -> Self {
        Self(chain_id)
    }

    /// The raw chain id.
    #[must_use]
    pub const fn inner(&self) -> u64 {
        self.0
    }

    /// The CAIP-2 form, `eip155:<n>`.
    #[must_use]
    pub fn as_chain_id(&self) -> ChainId {
        ChainId::new(EIP155_NAMESPACE, self.0.to_string())
    }
}

impl fmt::Display for Eip155ChainReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{EIP155_NAMESPACE}:{}", self.0)
    }
}

impl From<Eip155ChainReference> for ChainId {
    fn from(value: Eip155ChainReference) -> Self {
        value.as_chain_id()
    }
}

impl From<&Eip155ChainReference> for ChainId {
    fn from(value: &Eip155ChainReference) -> Self {
        value.as_chain_id()
    }
}

/// The network is not an `eip155:<n>` chain.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("not an eip155 network: {0}")]
pub struct NotEip155Error(String);

impl TryFrom<&ChainId> for Eip155ChainReference {
    type Error = NotEip155Error;

    fn try_from(value: &ChainId) -> Result<Self, Self::Error> {
        if value.namespace() != EIP155_NAMESPACE {
            return Err(NotEip155Error(value.to_string()));
        }
        value
            .reference()
            .parse()
            .map(Self)
            .map_err(|_| NotEip155Error(value.to_string()))
    }
}

impl FromStr for Eip155ChainReference {
    type Err = NotEip155Error;

    /// Parses `eip155:<n>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let chain_id = ChainId::from_str(s).map_err(|_| NotEip155Error(s.to_owned()))?;
        Self::try_from(&chain_id)
    }
}
