//! Sender rules and windowed payment limits.
//!
//! A [`PaymentPolicyGroup`] bundles allow/block lists with incoming and
//! outgoing [`ScopedLimit`]s. The [`PolicyEngine`] evaluates senders, checks a
//! prospective amount against the most specific limit, and records settled
//! payments in a [`RecordStore`].
//!
//! Limit scopes, most specific first: a sender address, a domain, `"global"`.

mod tracker;

pub use tracker::*;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, serde_as};

use crate::error::PaymentError;
use crate::timestamp::{Clock, SystemClock};

/// The catch-all limit scope.
pub const GLOBAL_SCOPE: &str = "global";

/// Minimum time between two evictions triggered by recording a payment.
pub const EVICTION_INTERVAL_MS: u64 = 60_000;

/// A cap on value moved within one scope.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopedLimit {
    /// An address, a domain, or `"global"`.
    pub scope: String,
    /// Atomic token units.
    #[serde_as(as = "DisplayFromStr")]
    pub max_amount: u128,
    /// Sliding window; `None` caps the lifetime total.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_ms: Option<u64>,
}

/// A named bundle of sender rules and limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPolicyGroup {
    /// Name routes and clients refer to.
    pub name: String,
    /// When set, only these senders pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_senders: Option<Vec<String>>,
    /// Senders that never pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_senders: Option<Vec<String>>,
    /// Limits on what we receive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incoming_limits: Option<Vec<ScopedLimit>>,
    /// Limits on what we pay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outgoing_limits: Option<Vec<ScopedLimit>>,
}

impl PaymentPolicyGroup {
    fn limits(&self, direction: Direction) -> &[ScopedLimit] {
        let limits = match direction {
            Direction::In => &self.incoming_limits,
            Direction::Out => &self.outgoing_limits,
        };
        limits.as_deref().unwrap_or_default()
    }
}

/// Policy groups, as loaded from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// All groups; names must be unique.
    #[serde(default)]
    pub groups: Vec<PaymentPolicyGroup>,
}

/// Outcome of [`PolicyEngine::evaluate_sender`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderDecision {
    /// Whether the sender may pay.
    pub allowed: bool,
    /// Why not, when denied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SenderDecision {
    const fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn deny(reason: String) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

/// The longest window over all limits, if every limit has one.
fn retention<'a>(groups: impl Iterator<Item = &'a PaymentPolicyGroup>) -> Option<u64> {
    let mut longest = None;
    for group in groups {
        for limit in group.limits(Direction::In).iter().chain(group.limits(Direction::Out)) {
            let window = limit.window_ms?;
            longest = Some(longest.map_or(window, |l: u64| l.max(window)));
        }
    }
    longest
}

fn listed(list: &[String], address: Option<&str>, domain: Option<&str>) -> bool {
    list.iter().any(|entry| {
        address.is_some_and(|a| entry.eq_ignore_ascii_case(a))
            || domain.is_some_and(|d| entry.eq_ignore_ascii_case(d))
    })
}

/// Evaluates policy groups against senders and settled amounts.
pub struct PolicyEngine<S = MemoryRecordStore, C = SystemClock> {
    groups: HashMap<String, PaymentPolicyGroup>,
    store: S,
    clock: C,
    retention_ms: Option<u64>,
    last_eviction_ms: AtomicU64,
}

impl<S: std::fmt::Debug, C> std::fmt::Debug for PolicyEngine<S, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyEngine")
            .field("groups", &self.groups.keys().collect::<Vec<_>>())
            .field("store", &self.store)
            .field("retention_ms", &self.retention_ms)
            .finish_non_exhaustive()
    }
}

impl PolicyEngine {
    /// In-memory engine on the system clock.
    #[must_use]
    pub fn new(config: PolicyConfig) -> Self {
        Self::with_store(config, MemoryRecordStore::new(), SystemClock)
    }
}

impl<S: RecordStore, C: Clock> PolicyEngine<S, C> {
    /// Engine over an explicit store and clock.
    ///
    /// A later group with the same name replaces an earlier one.
    pub fn with_store(config: PolicyConfig, store: S, clock: C) -> Self {
        let groups: HashMap<_, _> = config
            .groups
            .into_iter()
            .map(|g| (g.name.clone(), g))
            .collect();
        let retention_ms = retention(groups.values());
        Self {
            groups,
            store,
            clock,
            retention_ms,
            last_eviction_ms: AtomicU64::new(0),
        }
    }

    /// How long records stay relevant to a limit check.
    ///
    /// `None` when some limit caps a lifetime total, or when no limit is
    /// configured; records are then kept forever.
    #[must_use]
    pub const fn retention_ms(&self) -> Option<u64> {
        self.retention_ms
    }

    /// Drops records older than every configured window.
    ///
    /// Returns how many records were dropped; always `0` without a
    /// [`retention_ms`](Self::retention_ms).
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails to rewrite its data.
    pub fn evict_expired(&self) -> Result<usize, RecordStoreError> {
        let Some(retention) = self.retention_ms else {
            return Ok(0);
        };
        let now = self.clock.now_millis();
        self.last_eviction_ms.store(now, Ordering::Relaxed);
        let evicted = self.store.evict_before(now.saturating_sub(retention))?;
        #[cfg(feature = "telemetry")]
        if evicted > 0 {
            tracing::debug!(evicted, retention_ms = retention, "evicted expired payment records");
        }
        Ok(evicted)
    }

    /// Evicts when the last eviction is at least [`EVICTION_INTERVAL_MS`] old.
    fn maybe_evict(&self) -> Result<(), RecordStoreError> {
        if self.retention_ms.is_none() {
            return Ok(());
        }
        let now = self.clock.now_millis();
        let last = self.last_eviction_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) < EVICTION_INTERVAL_MS
            || self
                .last_eviction_ms
                .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_err()
        {
            return Ok(());
        }
        self.evict_expired().map(drop)
    }

    /// The group named `name`, if configured.
    #[must_use]
    pub fn group(&self, name: &str) -> Option<&PaymentPolicyGroup> {
        self.groups.get(name)
    }

    /// The backing record store.
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Blocked list first, then the allowed list if one is configured.
    ///
    /// An unknown group allows everyone.
    #[must_use]
    pub fn evaluate_sender(
        &self,
        group: &str,
        address: Option<&str>,
        domain: Option<&str>,
    ) -> SenderDecision {
        let Some(group) = self.groups.get(group) else {
            return SenderDecision::allow();
        };
        if let Some(blocked) = &group.blocked_senders {
            if listed(blocked, address, domain) {
                return SenderDecision::deny(format!(
                    "sender {} is blocked by policy group '{}'",
                    address.or(domain).unwrap_or_default(),
                    group.name
                ));
            }
        }
        if let Some(allowed) = &group.allowed_senders {
            if !listed(allowed, address, domain) {
                return SenderDecision::deny(format!(
                    "sender {} is not allowed by policy group '{}'",
                    address.or(domain).unwrap_or("<unknown>"),
                    group.name
                ));
            }
        }
        SenderDecision::allow()
    }

    /// Picks the most specific limit: address, then domain, then global.
    #[must_use]
    pub fn resolve_limit(
        &self,
        group: &str,
        direction: Direction,
        address: Option<&str>,
        domain: Option<&str>,
    ) -> Option<&ScopedLimit> {
        let limits = self.groups.get(group)?.limits(direction);
        let find = |scope: &str| limits.iter().find(|l| l.scope.eq_ignore_ascii_case(scope));
        address
            .and_then(find)
            .or_else(|| domain.and_then(find))
            .or_else(|| find(GLOBAL_SCOPE))
    }

    /// Sums recorded amounts for a scope, optionally within a window.
    #[must_use]
    pub fn get_total(
        &self,
        group: &str,
        scope: &str,
        direction: Direction,
        window_ms: Option<u64>,
    ) -> u128 {
        windowed_total(
            &self.store.snapshot(),
            group,
            scope,
            direction,
            window_ms,
            self.clock.now_millis(),
        )
    }

    /// Checks the sender and whether `amount` more would exceed the
    /// applicable incoming limit.
    ///
    /// # Errors
    ///
    /// Returns [`PaymentError::PolicyViolation`] describing the rule hit.
    pub fn check_incoming(
        &self,
        group: &str,
        address: Option<&str>,
        domain: Option<&str>,
        amount: u128,
    ) -> Result<(), PaymentError> {
        let decision = self.evaluate_sender(group, address, domain);
        if !decision.allowed {
            return Err(PaymentError::PolicyViolation(
                decision.reason.unwrap_or_default(),
            ));
        }
        self.check_limit(group, Direction::In, address, domain, amount)
    }

    /// Checks whether paying `amount` would exceed the applicable outgoing limit.
    ///
    /// # Errors
    ///
    /// Returns [`PaymentError::PolicyViolation`] when the limit would be exceeded.
    pub fn check_outgoing(
        &self,
        group: &str,
        address: Option<&str>,
        domain: Option<&str>,
        amount: u128,
    ) -> Result<(), PaymentError> {
        self.check_limit(group, Direction::Out, address, domain, amount)
    }

    fn check_limit(
        &self,
        group: &str,
        direction: Direction,
        address: Option<&str>,
        domain: Option<&str>,
        amount: u128,
    ) -> Result<(), PaymentError> {
        let Some(limit) = self.resolve_limit(group, direction, address, domain) else {
            return Ok(());
        };
        let spent = self.get_total(group, &limit.scope, direction, limit.window_ms);
        let projected = spent.saturating_add(amount);
        #[cfg(feature = "telemetry")]
        tracing::debug!(
            group,
            scope = %limit.scope,
            spent = %spent,
            amount = %amount,
            max = %limit.max_amount,
            "policy limit check"
        );
        if projected > limit.max_amount {
            return Err(PaymentError::PolicyViolation(format!(
                "limit of {} for scope '{}' in group '{group}' would be exceeded \
                 ({spent} already recorded)",
                limit.max_amount, limit.scope
            )));
        }
        Ok(())
    }

    /// Records a received payment. Zero amounts are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails to persist the record.
    pub fn record_incoming(
        &self,
        group: &str,
        scope: &str,
        amount: u128,
    ) -> Result<(), RecordStoreError> {
        self.record(group, scope, Direction::In, amount)
    }

    /// Records a sent payment. Zero amounts are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails to persist the record.
    pub fn record_outgoing(
        &self,
        group: &str,
        scope: &str,
        amount: u128,
    ) -> Result<(), RecordStoreError> {
        self.record(group, scope, Direction::Out, amount)
    }

    fn record(
        &self,
        group: &str,
        scope: &str,
        direction: Direction,
        amount: u128,
    ) -> Result<(), RecordStoreError> {
        if amount == 0 {
            return Ok(());
        }
        self.store.append(PaymentRecord {
            group_name: group.to_owned(),
            scope: scope.to_owned(),
            direction,
            amount,
            timestamp: self.clock.now_millis(),
        })?;
        self.maybe_evict()
    }

    /// Scope under which a payment from this sender should be recorded.
    ///
    /// Mirrors [`Self::resolve_limit`] so totals accrue where they are checked.
    #[must_use]
    pub fn scope_for(
        &self,
        group: &str,
        direction: Direction,
        address: Option<&str>,
        domain: Option<&str>,
    ) -> String {
        self.resolve_limit(group, direction, address, domain)
            .map_or_else(|| GLOBAL_SCOPE.to_owned(), |l| l.scope.clone())
    }
}

/// A policy engine shareable across request handlers.
pub type SharedPolicyEngine = Arc<PolicyEngine<Arc<dyn RecordStore>, Arc<dyn Clock>>>;

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    #[derive(Clone, Default)]
    struct ManualClock(Arc<AtomicU64>);

    impl ManualClock {
        fn set(&self, ms: u64) {
            self.0.store(ms, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_millis(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn config() -> PolicyConfig {
        toml::from_str(
            r#"
            [[groups]]
            name = "api"
            blockedSenders = ["0xBAD"]
            allowedSenders = ["0xabc", "0xBAD", "partner.example"]

            [[groups.incomingLimits]]
            scope = "global"
            maxAmount = "1000"
            windowMs = 1000

            [[groups.incomingLimits]]
            scope = "0xabc"
            maxAmount = "150"
            windowMs = 1000

            [[groups]]
            name = "open"
            "#,
        )
        .unwrap()
    }

    fn engine() -> (PolicyEngine<MemoryRecordStore, ManualClock>, ManualClock) {
        let clock = ManualClock::default();
        let engine = PolicyEngine::with_store(config(), MemoryRecordStore::new(), clock.clone());
        (engine, clock)
    }

    #[test]
    fn test_blocked_wins_over_allowed() {
        let (engine, _) = engine();
        let blocked = engine.evaluate_sender("api", Some("0xbad"), None);
        assert!(!blocked.allowed);
        assert!(blocked.reason.unwrap().contains("blocked"));
        assert!(engine.evaluate_sender("api", Some("0xABC"), None).allowed);
        assert!(engine.evaluate_sender("api", None, Some("partner.example")).allowed);
        assert!(!engine.evaluate_sender("api", Some("0xdef"), None).allowed);
    }

    #[test]
    fn test_no_lists_allows_everyone() {
        let (engine, _) = engine();
        assert!(engine.evaluate_sender("open", Some("0xdef"), None).allowed);
        assert!(engine.evaluate_sender("missing", None, None).allowed);
    }

    #[test]
    fn test_windowed_total_through_engine() {
        let (engine, clock) = engine();
        clock.set(10_000);
        engine.record_incoming("api", "global", 100).unwrap();
        clock.set(10_500);
        assert_eq!(engine.get_total("api", "global", Direction::In, Some(1000)), 100);
        clock.set(11_500);
        assert_eq!(engine.get_total("api", "global", Direction::In, Some(1000)), 0);
    }

    #[test]
    fn test_recording_evicts_records_outside_every_window() {
        let (engine, clock) = engine();
        assert_eq!(engine.retention_ms(), Some(1000));

        clock.set(1_000);
        engine.record_incoming("api", "global", 100).unwrap();
        clock.set(2_000);
        engine.record_incoming("api", "global", 200).unwrap();
        assert_eq!(engine.store().snapshot().len(), 2);

        clock.set(EVICTION_INTERVAL_MS + 5_000);
        engine.record_incoming("api", "global", 300).unwrap();
        let records = engine.store().snapshot();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].amount, 300);
        assert_eq!(engine.get_total("api", "global", Direction::In, Some(1000)), 300);
    }

    #[test]
    fn test_lifetime_limit_keeps_history() {
        let config: PolicyConfig = serde_json::from_value(serde_json::json!({
            "groups": [{
                "name": "api",
                "incomingLimits": [
                    {"scope": "global", "maxAmount": "1000", "windowMs": 1000},
                    {"scope": "0xabc", "maxAmount": "1000"}
                ]
            }]
        }))
        .unwrap();
        let clock = ManualClock::default();
        let engine = PolicyEngine::with_store(config, MemoryRecordStore::new(), clock.clone());
        assert_eq!(engine.retention_ms(), None);

        clock.set(1_000);
        engine.record_incoming("api", "0xabc", 100).unwrap();
        clock.set(10 * EVICTION_INTERVAL_MS);
        engine.record_incoming("api", "0xabc", 100).unwrap();
        assert_eq!(engine.evict_expired().unwrap(), 0);
        assert_eq!(engine.get_total("api", "0xabc", Direction::In, None), 200);
    }

    #[test]
    fn test_zero_amount_is_noop() {
        let (engine, _) = engine();
        engine.record_outgoing("api", "global", 0).unwrap();
        assert!(engine.store().snapshot().is_empty());
    }

    #[test]
    fn test_most_specific_limit_wins() {
        let (engine, _) = engine();
        let addr = engine
            .resolve_limit("api", Direction::In, Some("0xABC"), Some("partner.example"))
            .unwrap();
        assert_eq!(addr.scope, "0xabc");
        let global = engine
            .resolve_limit("api", Direction::In, Some("0xdef"), Some("partner.example"))
            .unwrap();
        assert_eq!(global.scope, GLOBAL_SCOPE);
        assert!(engine.resolve_limit("api", Direction::Out, None, None).is_none());
    }

    #[test]
    fn test_check_incoming_enforces_limit() {
        let (engine, clock) = engine();
        clock.set(1_000);
        assert!(engine.check_incoming("api", Some("0xabc"), None, 100).is_ok());
        let scope = engine.scope_for("api", Direction::In, Some("0xabc"), None);
        engine.record_incoming("api", &scope, 100).unwrap();

        let err = engine
            .check_incoming("api", Some("0xabc"), None, 100)
            .unwrap_err();
        assert_eq!(err.reason(), "policy_violation");

        clock.set(2_500);
        assert!(engine.check_incoming("api", Some("0xabc"), None, 100).is_ok());
        assert!(matches!(
            engine.check_incoming("api", Some("0xbad"), None, 1),
            Err(PaymentError::PolicyViolation(_))
        ));
    }
}
