//! Client-side payment negotiation.
//!
//! [`PaymentNegotiator`] answers a `402 Payment Required` challenge: it picks
//! one of the offered [`PaymentRequirements`], asks the matching
//! [`SchemeClient`] to sign a payload, and wraps it in a [`PaymentPayload`].
//!
//! Selection runs as a fixed pipeline:
//!
//! 1. keep the requirements a registered scheme can serve,
//! 2. apply each policy in registration order,
//! 3. let the selector pick one of the survivors.
//!
//! Before-creation hooks may then abort, after-creation hooks observe the
//! payload, and failure hooks may supply a substitute. Hooks run one at a
//! time in registration order.

use alloy_primitives::U256;

use crate::chain::NetworkPattern;
use crate::error::PaymentError;
use crate::facilitator::BoxFuture;
use crate::proto::{PaymentPayload, PaymentRequired, PaymentRequirements, v2};
use crate::scheme::{SchemeClient, SchemeRegistry};

/// Filters or reorders candidate requirements for a protocol version.
pub type PaymentPolicy =
    Box<dyn Fn(u32, Vec<PaymentRequirements>) -> Vec<PaymentRequirements> + Send + Sync>;

/// Picks the index of the final requirement from a non-empty list.
pub type PaymentRequirementsSelector =
    Box<dyn Fn(u32, &[PaymentRequirements]) -> usize + Send + Sync>;

/// Runs before the scheme is asked to sign. `Some` aborts the negotiation.
pub type BeforePaymentCreationHook =
    Box<dyn Fn(&PaymentCreationContext) -> BoxFuture<'_, Option<AbortResult>> + Send + Sync>;

/// Observes a successfully created payload.
pub type AfterPaymentCreationHook =
    Box<dyn Fn(&PaymentCreatedContext) -> BoxFuture<'_, ()> + Send + Sync>;

/// Runs after the scheme failed. `Some` replaces the error with a payload.
pub type OnPaymentCreationFailureHook = Box<
    dyn Fn(&PaymentCreationFailureContext) -> BoxFuture<'_, Option<PaymentPayload>> + Send + Sync,
>;

/// What a before hook sees.
#[derive(Debug, Clone)]
pub struct PaymentCreationContext {
    /// The full challenge.
    pub payment_required: PaymentRequired,
    /// The option about to be paid.
    pub selected_requirements: PaymentRequirements,
}

/// What an after hook sees.
#[derive(Debug, Clone)]
pub struct PaymentCreatedContext {
    /// The full challenge.
    pub payment_required: PaymentRequired,
    /// The option that was paid.
    pub selected_requirements: PaymentRequirements,
    /// The payload the scheme produced.
    pub payment_payload: PaymentPayload,
}

/// What a failure hook sees.
#[derive(Debug)]
pub struct PaymentCreationFailureContext {
    /// The full challenge.
    pub payment_required: PaymentRequired,
    /// The option that failed.
    pub selected_requirements: PaymentRequirements,
    /// What the scheme returned.
    pub error: PaymentError,
}

/// Reason a before hook gave for aborting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortResult {
    /// Machine-readable reason.
    pub reason: String,
    /// Human-readable details.
    pub message: Option<String>,
}

impl AbortResult {
    /// An abort with no message.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            message: None,
        }
    }

    /// Adds details.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Moves requirements for `network` to the front, keeping relative order.
#[must_use]
pub fn prefer_network(network: impl Into<String>) -> PaymentPolicy {
    let network = network.into();
    Box::new(move |_version, reqs| {
        let (mut preferred, others): (Vec<_>, Vec<_>) =
            reqs.into_iter().partition(|r| r.network == network);
        preferred.extend(others);
        preferred
    })
}

/// Moves requirements for `scheme` to the front, keeping relative order.
#[must_use]
pub fn prefer_scheme(scheme: impl Into<String>) -> PaymentPolicy {
    let scheme = scheme.into();
    Box::new(move |_version, reqs| {
        let (mut preferred, others): (Vec<_>, Vec<_>) =
            reqs.into_iter().partition(|r| r.scheme == scheme);
        preferred.extend(others);
        preferred
    })
}

/// Drops requirements asking for more than `limit` atomic units.
///
/// Requirements whose amount does not parse are dropped as well.
#[must_use]
pub fn max_amount(limit: U256) -> PaymentPolicy {
    Box::new(move |_version, reqs| {
        reqs.into_iter()
            .filter(|r| r.amount_value().is_some_and(|a| a <= limit))
            .collect()
    })
}

const fn first(_version: u32, _reqs: &[PaymentRequirements]) -> usize {
    0
}

/// Builds signed payment payloads from payment challenges.
pub struct PaymentNegotiator {
    schemes: SchemeRegistry<Box<dyn SchemeClient>>,
    policies: Vec<PaymentPolicy>,
    selector: PaymentRequirementsSelector,
    before_hooks: Vec<BeforePaymentCreationHook>,
    after_hooks: Vec<AfterPaymentCreationHook>,
    failure_hooks: Vec<OnPaymentCreationFailureHook>,
}

impl std::fmt::Debug for PaymentNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentNegotiator")
            .field("schemes", &self.schemes)
            .field("policies", &self.policies.len())
            .field("before_hooks", &self.before_hooks.len())
            .field("after_hooks", &self.after_hooks.len())
            .field("failure_hooks", &self.failure_hooks.len())
            .finish_non_exhaustive()
    }
}

impl Default for PaymentNegotiator {
    fn default() -> Self {
        Self::new()
    }
}

impl PaymentNegotiator {
    /// A negotiator with no schemes and the first-match selector.
    #[must_use]
    pub fn new() -> Self {
        Self {
            schemes: SchemeRegistry::new(),
            policies: Vec::new(),
            selector: Box::new(first),
            before_hooks: Vec::new(),
            after_hooks: Vec::new(),
            failure_hooks: Vec::new(),
        }
    }

    /// Registers a scheme client for every network matching `pattern`.
    ///
    /// A second registration for the same pattern and scheme is ignored.
    pub fn register(
        &mut self,
        pattern: NetworkPattern,
        client: impl SchemeClient + 'static,
    ) -> &mut Self {
        let scheme = client.scheme().to_owned();
        self.schemes
            .register(v2::V2, pattern, scheme, Box::new(client));
        self
    }

    /// Adds a policy; policies run in registration order before selection.
    pub fn with_policy(&mut self, policy: PaymentPolicy) -> &mut Self {
        self.policies.push(policy);
        self
    }

    /// Replaces the selector, which defaults to the first candidate.
    pub fn with_selector(&mut self, selector: PaymentRequirementsSelector) -> &mut Self {
        self.selector = selector;
        self
    }

    /// Runs `hook` before a payload is created; it may abort.
    pub fn on_before_creation(&mut self, hook: BeforePaymentCreationHook) -> &mut Self {
        self.before_hooks.push(hook);
        self
    }

    /// Runs `hook` after a payload is created.
    pub fn on_after_creation(&mut self, hook: AfterPaymentCreationHook) -> &mut Self {
        self.after_hooks.push(hook);
        self
    }

    /// Runs `hook` when the scheme fails; it may recover.
    pub fn on_creation_failure(&mut self, hook: OnPaymentCreationFailureHook) -> &mut Self {
        self.failure_hooks.push(hook);
        self
    }

    /// The registered scheme clients.
    #[must_use]
    pub const fn schemes(&self) -> &SchemeRegistry<Box<dyn SchemeClient>> {
        &self.schemes
    }

    /// Runs the filter, policy and selector stages.
    ///
    /// # Errors
    ///
    /// - [`PaymentError::NoMatchingRequirements`] when no registered scheme
    ///   covers any requirement, or the selector returns an out-of-range index.
    /// - [`PaymentError::PolicyExhausted`] when a policy returns an empty list.
    pub fn select_requirements(
        &self,
        version: u32,
        accepts: &[PaymentRequirements],
    ) -> Result<PaymentRequirements, PaymentError> {
        let mut candidates: Vec<PaymentRequirements> = accepts
            .iter()
            .filter(|r| self.schemes.supports(version, &r.network, &r.scheme))
            .cloned()
            .collect();
        if candidates.is_empty() {
            return Err(PaymentError::NoMatchingRequirements);
        }
        for (index, policy) in self.policies.iter().enumerate() {
            candidates = policy(version, candidates);
            if candidates.is_empty() {
                return Err(PaymentError::PolicyExhausted { index });
            }
        }
        let chosen = (self.selector)(version, &candidates);
        candidates
            .into_iter()
            .nth(chosen)
            .ok_or(PaymentError::NoMatchingRequirements)
    }

    /// Answers a payment challenge with a signed payload.
    ///
    /// # Errors
    ///
    /// Fails with the selection errors of [`Self::select_requirements`], with
    /// [`PaymentError::Aborted`] when a before hook aborts, or with the scheme's
    /// own error when no failure hook recovers.
    pub async fn create_payment_payload(
        &self,
        payment_required: &PaymentRequired,
    ) -> Result<PaymentPayload, PaymentError> {
        let version = payment_required.x402_version;
        let selected = self.select_requirements(version, &payment_required.accepts)?;

        #[cfg(feature = "telemetry")]
        tracing::debug!(
            network = %selected.network,
            scheme = %selected.scheme,
            amount = %selected.amount,
            "selected payment requirements"
        );

        let context = PaymentCreationContext {
            payment_required: payment_required.clone(),
            selected_requirements: selected,
        };
        for hook in &self.before_hooks {
            if let Some(abort) = hook(&context).await {
                return Err(PaymentError::Aborted {
                    reason: abort.reason,
                    message: abort.message,
                });
            }
        }
        let PaymentCreationContext {
            payment_required,
            selected_requirements,
        } = context;

        match self
            .sign(version, &payment_required, &selected_requirements)
            .await
        {
            Ok(payload) => {
                let created = PaymentCreatedContext {
                    payment_required,
                    selected_requirements,
                    payment_payload: payload,
                };
                for hook in &self.after_hooks {
                    hook(&created).await;
                }
                Ok(created.payment_payload)
            }
            Err(error) => {
                let failure = PaymentCreationFailureContext {
                    payment_required,
                    selected_requirements,
                    error,
                };
                for hook in &self.failure_hooks {
                    if let Some(payload) = hook(&failure).await {
                        return Ok(payload);
                    }
                }
                Err(failure.error)
            }
        }
    }

    async fn sign(
        &self,
        version: u32,
        payment_required: &PaymentRequired,
        selected: &PaymentRequirements,
    ) -> Result<PaymentPayload, PaymentError> {
        let client = self
            .schemes
            .resolve(version, &selected.network, &selected.scheme)
            .ok_or(PaymentError::NoMatchingRequirements)?;
        let payload = client.create_payment_payload(selected).await?;
        Ok(PaymentPayload {
            x402_version: version,
            payload,
            accepted: selected.clone(),
            resource: payment_required.resource.clone(),
            extensions: payment_required.extensions.clone(),
        })
    }
}
