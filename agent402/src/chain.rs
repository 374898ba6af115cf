//! Chain identifiers and network patterns.
//!
//! - [`ChainId`] - A CAIP-2 chain identifier (e.g., `eip155:8453` for Base)
//! - [`NetworkPattern`] - A registry key that matches one or many networks
//!   (`eip155:8453`, `eip155:*`, `*`)
//! - [`ChainProviderOps`] - Common operations on chain providers

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;

/// A CAIP-2 compliant blockchain identifier.
///
/// The format is `namespace:reference` where:
///
/// - `namespace` identifies the blockchain family (e.g., `eip155`, `solana`)
/// - `reference` identifies the specific chain within that family
///
/// # Serialization
///
/// Serializes to/from a colon-separated string: `"eip155:8453"`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChainId {
    namespace: String,
    reference: String,
}

impl ChainId {
    /// Creates a new chain ID from namespace and reference components.
    pub fn new<N: Into<String>, R: Into<String>>(namespace: N, reference: R) -> Self {
        Self {
            namespace: namespace.into(),
            reference: reference.into(),
        }
    }

    /// Returns the namespace component of the chain ID.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Returns the reference component of the chain ID.
    #[must_use]
    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// Returns the `namespace:*` pattern covering this chain's family.
    #[must_use]
    pub fn family(&self) -> String {
        format!("{}:*", self.namespace)
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.reference)
    }
}

impl From<ChainId> for String {
    fn from(value: ChainId) -> Self {
        value.to_string()
    }
}

/// Error returned when parsing an invalid chain ID string.
///
/// A valid chain ID is `namespace:reference` with both parts non-empty and
/// neither containing a wildcard.
#[derive(Debug, thiserror::Error)]
#[error("Invalid chain id format {0}")]
pub struct ChainIdFormatError(String);

impl FromStr for ChainId {
    type Err = ChainIdFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (namespace, reference) = s
            .split_once(':')
            .ok_or_else(|| ChainIdFormatError(s.into()))?;
        if namespace.is_empty() || reference.is_empty() || s.contains('*') {
            return Err(ChainIdFormatError(s.into()));
        }
        Ok(Self::new(namespace, reference))
    }
}

impl Serialize for ChainId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ChainId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(de::Error::custom)
    }
}

/// A network key used in scheme registries.
///
/// Three shapes are recognised:
///
/// - **Exact**: a concrete network such as `eip155:8453`
/// - **Wildcard**: any string containing `*`, e.g. `eip155:*`. Every `*` matches
///   any run of characters; all other characters match literally. The pattern
///   is anchored at both ends, so `eip155:*` never matches `solana:mainnet`.
/// - **Universal**: the bare `*`, matching every network
///
/// Patterns are only ever registry keys; payloads always carry concrete networks.
#[derive(Debug, Clone)]
pub struct NetworkPattern {
    source: String,
    matcher: Matcher,
}

#[derive(Debug, Clone)]
enum Matcher {
    Exact,
    Universal,
    Wildcard(Arc<Regex>),
}

/// Error returned for an unusable network pattern.
#[derive(Debug, thiserror::Error)]
pub enum NetworkPatternError {
    /// The pattern string was empty.
    #[error("network pattern must not be empty")]
    Empty,
    /// The derived regular expression failed to compile.
    #[error("invalid network pattern {pattern}: {source}")]
    Regex {
        /// The offending pattern.
        pattern: String,
        /// The regex compile error.
        source: regex::Error,
    },
}

impl NetworkPattern {
    /// The universal pattern, `*`.
    pub const UNIVERSAL: &'static str = "*";

    /// Parses a pattern string.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkPatternError`] if the string is empty.
    pub fn parse(pattern: impl Into<String>) -> Result<Self, NetworkPatternError> {
        let source = pattern.into();
        if source.is_empty() {
            return Err(NetworkPatternError::Empty);
        }
        let matcher = if source == Self::UNIVERSAL {
            Matcher::Universal
        } else if source.contains('*') {
            let body = regex::escape(&source).replace(r"\*", ".*");
            let regex = Regex::new(&format!("^{body}$")).map_err(|source_err| {
                NetworkPatternError::Regex {
                    pattern: source.clone(),
                    source: source_err,
                }
            })?;
            Matcher::Wildcard(Arc::new(regex))
        } else {
            Matcher::Exact
        };
        Ok(Self { source, matcher })
    }

    /// Pattern covering every network of a namespace, e.g. `eip155:*`.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkPatternError`] if the namespace produces an invalid pattern.
    pub fn namespace(namespace: &str) -> Result<Self, NetworkPatternError> {
        Self::parse(format!("{namespace}:*"))
    }

    /// The universal pattern.
    #[must_use]
    pub fn universal() -> Self {
        Self {
            source: Self::UNIVERSAL.to_owned(),
            matcher: Matcher::Universal,
        }
    }

    /// The pattern text as registered.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// `true` unless this pattern names a single concrete network.
    #[must_use]
    pub const fn is_wildcard(&self) -> bool {
        !matches!(self.matcher, Matcher::Exact)
    }

    /// Tests a concrete network against this pattern.
    #[must_use]
    pub fn matches(&self, network: &str) -> bool {
        match &self.matcher {
            Matcher::Exact => self.source == network,
            Matcher::Universal => true,
            Matcher::Wildcard(regex) => regex.is_match(network),
        }
    }
}

impl PartialEq for NetworkPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for NetworkPattern {}

impl Hash for NetworkPattern {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.source.hash(state);
    }
}

impl fmt::Display for NetworkPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for NetworkPattern {
    type Err = NetworkPatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<&ChainId> for NetworkPattern {
    fn from(chain_id: &ChainId) -> Self {
        Self {
            source: chain_id.to_string(),
            matcher: Matcher::Exact,
        }
    }
}

impl Serialize for NetworkPattern {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for NetworkPattern {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(s).map_err(de::Error::custom)
    }
}

/// Common operations available on all chain providers.
pub trait ChainProviderOps {
    /// Returns the addresses of all configured signers for this chain.
    fn signer_addresses(&self) -> Vec<String>;

    /// Returns the CAIP-2 chain identifier for this provider.
    fn chain_id(&self) -> ChainId;
}

impl<T: ChainProviderOps> ChainProviderOps for Arc<T> {
    fn signer_addresses(&self) -> Vec<String> {
        (**self).signer_addresses()
    }
    fn chain_id(&self) -> ChainId {
        (**self).chain_id()
    }
}
