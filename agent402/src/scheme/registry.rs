//! Versioned scheme registry.
//!
//! [`SchemeRegistry`] maps `(protocol version, network pattern, scheme)` to an
//! implementation. It is generic over the stored handler so the same lookup
//! rules serve client-side [`SchemeClient`](super::SchemeClient)s and
//! facilitator-side [`Facilitator`](crate::Facilitator)s.
//!
//! Resolution of a concrete network:
//!
//! 1. Exact registration for the literal network string.
//! 2. Wildcard registrations in registration order; first match wins.
//!    The universal `*` pattern is just the most permissive of these.
//!
//! An exact registration always outranks a wildcard, even one registered first.
//! The registry is built once and then only read, so it is shared without locks.

use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Debug, Formatter};

use crate::chain::NetworkPattern;

/// A single registry insertion.
pub struct SchemeRegistration<'a, T> {
    /// Protocol version the handler speaks.
    pub version: u32,
    /// The network key it was registered under.
    pub pattern: &'a NetworkPattern,
    /// The scheme name.
    pub scheme: &'a str,
    /// The handler itself.
    pub handler: &'a T,
}

impl<T> Debug for SchemeRegistration<'_, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemeRegistration")
            .field("version", &self.version)
            .field("pattern", &self.pattern.as_str())
            .field("scheme", &self.scheme)
            .finish_non_exhaustive()
    }
}

struct Entry<T> {
    pattern: NetworkPattern,
    scheme: String,
    handler: T,
}

struct VersionTable<T> {
    entries: Vec<Entry<T>>,
    /// `(network, scheme)` to entry index, exact registrations only.
    exact: HashMap<(String, String), usize>,
    /// Entry indices of wildcard registrations, in registration order.
    wildcards: Vec<usize>,
}

impl<T> Default for VersionTable<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            exact: HashMap::new(),
            wildcards: Vec::new(),
        }
    }
}

/// Registry of scheme handlers keyed by version, network pattern and scheme.
pub struct SchemeRegistry<T> {
    versions: BTreeMap<u32, VersionTable<T>>,
}

impl<T> Default for SchemeRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Debug for SchemeRegistry<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let keys: Vec<String> = self
            .entries()
            .map(|r| format!("v{}:{}:{}", r.version, r.pattern, r.scheme))
            .collect();
        f.debug_tuple("SchemeRegistry").field(&keys).finish()
    }
}

impl<T> SchemeRegistry<T> {
    /// Creates an empty registry.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            versions: BTreeMap::new(),
        }
    }

    /// Registers `handler` for `(version, pattern, scheme)`.
    ///
    /// Returns `false` and drops `handler` when the exact triple is already
    /// registered; the first registration wins.
    pub fn register(
        &mut self,
        version: u32,
        pattern: NetworkPattern,
        scheme: impl Into<String>,
        handler: T,
    ) -> bool {
        let scheme = scheme.into();
        let table = self.versions.entry(version).or_default();
        let duplicate = table
            .entries
            .iter()
            .any(|e| e.pattern == pattern && e.scheme == scheme);
        if duplicate {
            return false;
        }
        let index = table.entries.len();
        if pattern.is_wildcard() {
            table.wildcards.push(index);
        } else {
            table
                .exact
                .insert((pattern.as_str().to_owned(), scheme.clone()), index);
        }
        table.entries.push(Entry {
            pattern,
            scheme,
            handler,
        });
        true
    }

    /// Finds the handler for a concrete network and scheme.
    #[must_use]
    pub fn resolve(&self, version: u32, network: &str, scheme: &str) -> Option<&T> {
        let table = self.versions.get(&version)?;
        let exact = table
            .exact
            .get(&(network.to_owned(), scheme.to_owned()))
            .copied();
        let index = exact.or_else(|| {
            table.wildcards.iter().copied().find(|&i| {
                let entry = &table.entries[i];
                entry.scheme == scheme && entry.pattern.matches(network)
            })
        })?;
        Some(&table.entries[index].handler)
    }

    /// `true` if [`Self::resolve`] would find a handler.
    #[must_use]
    pub fn supports(&self, version: u32, network: &str, scheme: &str) -> bool {
        self.resolve(version, network, scheme).is_some()
    }

    /// `true` if any scheme is registered for a pattern covering `network`.
    #[must_use]
    pub fn supports_network(&self, version: u32, network: &str) -> bool {
        self.versions
            .get(&version)
            .is_some_and(|t| t.entries.iter().any(|e| e.pattern.matches(network)))
    }

    /// Iterates over every registration, by version then registration order.
    pub fn entries(&self) -> impl Iterator<Item = SchemeRegistration<'_, T>> {
        self.versions.iter().flat_map(|(version, table)| {
            table.entries.iter().map(move |e| SchemeRegistration {
                version: *version,
                pattern: &e.pattern,
                scheme: &e.scheme,
                handler: &e.handler,
            })
        })
    }

    /// Number of registrations across all versions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.versions.values().map(|t| t.entries.len()).sum()
    }

    /// `true` when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
