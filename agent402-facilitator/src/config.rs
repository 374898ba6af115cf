//! Facilitator server configuration.
//!
//! Read from a TOML file. `$VAR` and `${VAR}` references anywhere in the file
//! are replaced from the environment before parsing; unknown variables are
//! left untouched.
//!
//! ```toml
//! host = "0.0.0.0"
//! port = 4021
//! verify_timeout_secs = 30
//! settle_timeout_secs = 60
//!
//! [chains."eip155:84532"]
//! rpc_url = "https://sepolia.base.org"
//! signer_private_key = "$SIGNER_KEY_BASE_SEPOLIA"
//! identity_registry = "0x8004A818BFB912233c491871b3d84c89A494BD9e"
//! ```
//!
//! # Environment Variables
//!
//! - `CONFIG` - Path to the file (default: `config.toml`)
//! - `HOST` - Overrides `host`
//! - `PORT` - Overrides `port`

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use agent402_evm::chain::DEFAULT_RECEIPT_TIMEOUT_SECS;
use alloy_primitives::Address;
use serde::{Deserialize, Serialize};

const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Errors loading the configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read {path}: {source}")]
    Read {
        /// The configuration path.
        path: String,
        /// The I/O failure.
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level facilitator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FacilitatorConfig {
    /// Address to bind.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to bind.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Upper bound on a `/verify` call, in seconds.
    #[serde(default = "default_verify_timeout")]
    pub verify_timeout_secs: u64,

    /// Upper bound on a `/settle` or `/register` call, in seconds.
    #[serde(default = "default_settle_timeout")]
    pub settle_timeout_secs: u64,

    /// EVM chains keyed by CAIP-2 identifier.
    #[serde(default)]
    pub chains: BTreeMap<String, ChainConfig>,
}

/// One EVM chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// HTTP(S) JSON-RPC endpoint.
    pub rpc_url: String,

    /// Hex private key of the signer paying gas.
    pub signer_private_key: String,

    /// Seconds to wait for a settlement receipt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_timeout_secs: Option<u64>,

    /// Delegate contract agents must authorize for `/register`. Registration
    /// is disabled on the chain without it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_registry: Option<Address>,

    /// `false` pins a legacy gas price on every send.
    #[serde(default = "default_eip1559")]
    pub eip1559: bool,
}

impl ChainConfig {
    /// The receipt timeout, or its default.
    #[must_use]
    pub fn receipt_timeout_secs(&self) -> u64 {
        self.receipt_timeout_secs
            .unwrap_or(DEFAULT_RECEIPT_TIMEOUT_SECS)
    }

    /// The signer key, or `None` while it is still an unexpanded reference.
    #[must_use]
    pub fn signer_key(&self) -> Option<&str> {
        let key = self.signer_private_key.trim();
        (!key.is_empty() && !key.starts_with('$')).then_some(key)
    }
}

const fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

const fn default_port() -> u16 {
    4021
}

const fn default_verify_timeout() -> u64 {
    30
}

const fn default_settle_timeout() -> u64 {
    60
}

const fn default_eip1559() -> bool {
    true
}

impl Default for FacilitatorConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            verify_timeout_secs: default_verify_timeout(),
            settle_timeout_secs: default_settle_timeout(),
            chains: BTreeMap::new(),
        }
    }
}

impl FacilitatorConfig {
    /// Loads the file named by `CONFIG`, then applies `HOST` and `PORT`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_owned());
        let mut config = Self::load_from(&path)?;
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Loads a file. A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&raw, |name| std::env::var(name).ok())
    }

    /// Expands variables through `lookup` and parses the result.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for invalid TOML or field types.
    pub fn parse(raw: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(toml::from_str(&expand_vars(raw, lookup))?)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("HOST").and_then(|h| h.parse().ok()) {
            self.host = host;
        }
        if let Some(port) = lookup("PORT").and_then(|p| p.parse().ok()) {
            self.port = port;
        }
    }

    /// The `/verify` deadline.
    #[must_use]
    pub const fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }

    /// The `/settle` and `/register` deadline.
    #[must_use]
    pub const fn settle_timeout(&self) -> Duration {
        Duration::from_secs(self.settle_timeout_secs)
    }
}

/// Replaces `$NAME` and `${NAME}` with `lookup(NAME)` where it resolves.
fn expand_vars(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find('$') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };
        match lookup(name).filter(|_| !name.is_empty()) {
            Some(value) => out.push_str(&value),
            None => out.push_str(&rest[start..=start + consumed]),
        }
        rest = &after[consumed..];
    }
    out.push_str(rest);
    out
}
