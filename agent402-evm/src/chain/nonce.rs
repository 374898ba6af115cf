use std::sync::Arc;

use alloy_network::Network;
use alloy_primitives::Address;
use alloy_provider::Provider;
use alloy_provider::fillers::NonceManager;
use alloy_transport::TransportResult;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;

/// Marks an address whose next nonce must be fetched from the node.
const UNKNOWN: u64 = u64::MAX;

/// Nonce manager that seeds from the node's *pending* transaction count.
///
/// After the first fetch, nonces are handed out locally so concurrent
/// settlements from one signer never collide. A failed send must call
/// [`PendingNonceManager::reset_nonce`] so the next transaction re-reads the
/// count instead of leaving a gap.
#[derive(Clone, Debug, Default)]
pub struct PendingNonceManager {
    nonces: Arc<DashMap<Address, Arc<Mutex<u64>>>>,
}

#[async_trait]
impl NonceManager for PendingNonceManager {
    async fn get_next_nonce<P, N>(&self, provider: &P, address: Address) -> TransportResult<u64>
    where
        P: Provider<N>,
        N: Network,
    {
        let slot = self
            .nonces
            .entry(address)
            .or_insert_with(|| Arc::new(Mutex::new(UNKNOWN)))
            .clone();
        let mut nonce = slot.lock().await;
        let next = if *nonce == UNKNOWN {
            provider.get_transaction_count(address).pending().await?
        } else {
            *nonce + 1
        };
        *nonce = next;
        Ok(next)
    }
}

impl PendingNonceManager {
    /// Forgets the cached nonce for `address`.
    pub async fn reset_nonce(&self, address: Address) {
        let slot = self.nonces.get(&address).map(|entry| Arc::clone(entry.value()));
        if let Some(slot) = slot {
            *slot.lock().await = UNKNOWN;
            #[cfg(feature = "telemetry")]
            tracing::debug!(%address, "nonce reset");
        }
    }
}
