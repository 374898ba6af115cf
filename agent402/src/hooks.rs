//! Facilitator lifecycle hooks.
//!
//! [`HookedFacilitator`] wraps any [`Facilitator`] and runs registered
//! [`FacilitatorHooks`] around `verify` and `settle`:
//!
//! - before hooks run in order; the first abort short-circuits the call,
//! - after hooks all run on success and cannot change the result,
//! - failure hooks run in order; the first recovery replaces the error.

use std::fmt::{self, Debug};

use crate::error::PaymentError;
use crate::facilitator::{BoxFuture, Facilitator};
use crate::proto;

/// Outcome of a before hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookDecision {
    /// Let the operation run.
    Continue,
    /// Skip the operation and fail with [`PaymentError::Aborted`].
    Abort {
        /// Machine-readable reason, e.g. `kyt_blocked`.
        reason: String,
        /// Optional details.
        message: Option<String>,
    },
}

impl HookDecision {
    /// Abort with a reason and no message.
    #[must_use]
    pub fn abort(reason: impl Into<String>) -> Self {
        Self::Abort {
            reason: reason.into(),
            message: None,
        }
    }
}

/// Outcome of a failure hook.
#[derive(Debug)]
pub enum Recovery<T> {
    /// Leave the error in place.
    Propagate,
    /// Replace the error with this result.
    Recovered(T),
}

/// Hooks around facilitator operations. Every method defaults to a no-op.
pub trait FacilitatorHooks: Send + Sync {
    /// Runs before verification. An abort skips the facilitator.
    fn before_verify<'a>(
        &'a self,
        _request: &'a proto::VerifyRequest,
    ) -> BoxFuture<'a, HookDecision> {
        Box::pin(async { HookDecision::Continue })
    }

    /// Runs after a successful verification.
    fn after_verify<'a>(
        &'a self,
        _request: &'a proto::VerifyRequest,
        _response: &'a proto::VerifyResponse,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }

    /// Runs when verification fails. The first recovery wins.
    fn on_verify_failure<'a>(
        &'a self,
        _request: &'a proto::VerifyRequest,
        _error: &'a PaymentError,
    ) -> BoxFuture<'a, Recovery<proto::VerifyResponse>> {
        Box::pin(async { Recovery::Propagate })
    }

    /// Runs before settlement. An abort skips the facilitator.
    fn before_settle<'a>(
        &'a self,
        _request: &'a proto::SettleRequest,
    ) -> BoxFuture<'a, HookDecision> {
        Box::pin(async { HookDecision::Continue })
    }

    /// Runs after a successful settlement.
    fn after_settle<'a>(
        &'a self,
        _request: &'a proto::SettleRequest,
        _response: &'a proto::SettleResponse,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }

    /// Runs when settlement fails. The first recovery wins.
    fn on_settle_failure<'a>(
        &'a self,
        _request: &'a proto::SettleRequest,
        _error: &'a PaymentError,
    ) -> BoxFuture<'a, Recovery<proto::SettleResponse>> {
        Box::pin(async { Recovery::Propagate })
    }
}

/// A facilitator decorated with lifecycle hooks.
pub struct HookedFacilitator<F> {
    inner: F,
    hooks: Vec<Box<dyn FacilitatorHooks>>,
}

impl<F: Debug> Debug for HookedFacilitator<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookedFacilitator")
            .field("inner", &self.inner)
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

impl<F> HookedFacilitator<F> {
    /// Wraps `inner` with no hooks.
    pub const fn new(inner: F) -> Self {
        Self {
            inner,
            hooks: Vec::new(),
        }
    }

    /// Appends a hook; hooks run in registration order.
    #[must_use]
    pub fn with_hook(mut self, hook: impl FacilitatorHooks + 'static) -> Self {
        self.hooks.push(Box::new(hook));
        self
    }

    /// Appends a hook in place.
    pub fn add_hook(&mut self, hook: impl FacilitatorHooks + 'static) -> &mut Self {
        self.hooks.push(Box::new(hook));
        self
    }

    /// The wrapped facilitator.
    #[must_use]
    pub const fn inner(&self) -> &F {
        &self.inner
    }
}

fn aborted(decision: HookDecision) -> Result<(), PaymentError> {
    match decision {
        HookDecision::Continue => Ok(()),
        HookDecision::Abort { reason, message } => {
            #[cfg(feature = "telemetry")]
            tracing::debug!(%reason, "operation aborted by hook");
            Err(PaymentError::Aborted { reason, message })
        }
    }
}

impl<F: Facilitator> Facilitator for HookedFacilitator<F> {
    fn verify(
        &self,
        request: proto::VerifyRequest,
    ) -> BoxFuture<'_, Result<proto::VerifyResponse, PaymentError>> {
        Box::pin(async move {
            for hook in &self.hooks {
                aborted(hook.before_verify(&request).await)?;
            }
            match self.inner.verify(request.clone()).await {
                Ok(response) => {
                    for hook in &self.hooks {
                        hook.after_verify(&request, &response).await;
                    }
                    Ok(response)
                }
                Err(err) => {
                    for hook in &self.hooks {
                        if let Recovery::Recovered(response) =
                            hook.on_verify_failure(&request, &err).await
                        {
                            return Ok(response);
                        }
                    }
                    Err(err)
                }
            }
        })
    }

    fn settle(
        &self,
        request: proto::SettleRequest,
    ) -> BoxFuture<'_, Result<proto::SettleResponse, PaymentError>> {
        Box::pin(async move {
            for hook in &self.hooks {
                aborted(hook.before_settle(&request).await)?;
            }
            match self.inner.settle(request.clone()).await {
                Ok(response) => {
                    for hook in &self.hooks {
                        hook.after_settle(&request, &response).await;
                    }
                    Ok(response)
                }
                Err(err) => {
                    for hook in &self.hooks {
                        if let Recovery::Recovered(response) =
                            hook.on_settle_failure(&request, &err).await
                        {
                            return Ok(response);
                        }
                    }
                    Err(err)
                }
            }
        })
    }

    fn supported(&self) -> BoxFuture<'_, Result<proto::SupportedResponse, PaymentError>> {
        self.inner.supported()
    }

    fn settlement_status(
        &self,
        request: proto::SettleRequest,
    ) -> BoxFuture<'_, Result<proto::SettlementStatus, PaymentError>> {
        self.inner.settlement_status(request)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::facilitator::tests::{StaticFacilitator, request};

    struct Blocklist(&'static str);

    impl FacilitatorHooks for Blocklist {
        fn before_settle<'a>(
            &'a self,
            request: &'a proto::SettleRequest,
        ) -> BoxFuture<'a, HookDecision> {
            Box::pin(async move {
                if request.payment_requirements.pay_to == self.0 {
                    HookDecision::abort("kyt_blocked")
                } else {
                    HookDecision::Continue
                }
            })
        }
    }

    struct Counter(Arc<AtomicUsize>);

    impl FacilitatorHooks for Counter {
        fn after_verify<'a>(
            &'a self,
            _request: &'a proto::VerifyRequest,
            _response: &'a proto::VerifyResponse,
        ) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                self.0.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    struct Failing;

    impl Facilitator for Failing {
        fn verify(
            &self,
            _request: proto::VerifyRequest,
        ) -> BoxFuture<'_, Result<proto::VerifyResponse, PaymentError>> {
            Box::pin(async { Err(PaymentError::verification_unexpected("boom")) })
        }

        fn settle(
            &self,
            _request: proto::SettleRequest,
        ) -> BoxFuture<'_, Result<proto::SettleResponse, PaymentError>> {
            Box::pin(async { Err(PaymentError::settlement_unexpected("boom")) })
        }

        fn supported(&self) -> BoxFuture<'_, Result<proto::SupportedResponse, PaymentError>> {
            Box::pin(async { Ok(proto::SupportedResponse::default()) })
        }
    }

    struct Recover;

    impl FacilitatorHooks for Recover {
        fn on_verify_failure<'a>(
            &'a self,
            _request: &'a proto::VerifyRequest,
            _error: &'a PaymentError,
        ) -> BoxFuture<'a, Recovery<proto::VerifyResponse>> {
            Box::pin(async {
                Recovery::Recovered(proto::VerifyResponse::valid("recovered".into()))
            })
        }
    }

    #[tokio::test]
    async fn test_before_hook_aborts_settle() {
        let hooked =
            HookedFacilitator::new(StaticFacilitator("evm")).with_hook(Blocklist("0xpayee"));
        let err = hooked
            .settle(request("eip155:8453", "exact").into())
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "kyt_blocked");
        assert!(hooked.verify(request("eip155:8453", "exact")).await.is_ok());
    }

    #[tokio::test]
    async fn test_after_hooks_observe_success() {
        let count = Arc::new(AtomicUsize::new(0));
        let hooked = HookedFacilitator::new(StaticFacilitator("evm"))
            .with_hook(Counter(count.clone()))
            .with_hook(Counter(count.clone()));
        hooked.verify(request("eip155:8453", "exact")).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_hook_recovers() {
        let plain = HookedFacilitator::new(Failing);
        assert!(plain.verify(request("eip155:1", "exact")).await.is_err());

        let hooked = HookedFacilitator::new(Failing).with_hook(Recover);
        let resp = hooked.verify(request("eip155:1", "exact")).await.unwrap();
        assert_eq!(resp.payer(), Some("recovered"));
        assert!(hooked.settle(request("eip155:1", "exact").into()).await.is_err());
    }

    #[cfg(feature = "telemetry")]
    #[derive(Clone, Default)]
    struct Captured(Arc<std::sync::Mutex<Vec<u8>>>);

    #[cfg(feature = "telemetry")]
    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    #[cfg(feature = "telemetry")]
    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[cfg(feature = "telemetry")]
    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for Captured {
        type Writer = Self;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[cfg(feature = "telemetry")]
    fn abort_logs_at(level: tracing::Level) -> String {
        let out = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_ansi(false)
            .with_writer(out.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            let err = aborted(HookDecision::abort("kyt_blocked")).unwrap_err();
            assert_eq!(err.reason(), "kyt_blocked");
        });
        out.text()
    }

    #[cfg(feature = "telemetry")]
    #[test]
    fn test_hook_abort_logs_at_debug() {
        assert!(abort_logs_at(tracing::Level::INFO).is_empty());
        let debug = abort_logs_at(tracing::Level::DEBUG);
        assert!(debug.contains("DEBUG"), "{debug}");
        assert!(debug.contains("operation aborted by hook"), "{debug}");
    }
}
