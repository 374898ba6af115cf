use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use agent402::chain::{ChainId, ChainProviderOps};
use alloy_eips::eip7702::SignedAuthorization;
use alloy_network::{Ethereum, EthereumWallet, NetworkWallet, TransactionBuilder};
use alloy_primitives::{Address, Bytes};
use alloy_provider::fillers::{
    BlobGasFiller, ChainIdFiller, FillProvider, GasFiller, JoinFill, NonceFiller, WalletFiller,
};
use alloy_provider::{
    Identity, PendingTransactionError, Provider, ProviderBuilder, RootProvider, WalletProvider,
};
use alloy_rpc_client::RpcClient;
use alloy_rpc_types_eth::{BlockId, TransactionReceipt, TransactionRequest};
use alloy_transport::TransportError;
use alloy_transport::layers::{FallbackLayer, ThrottleLayer};
use alloy_transport_http::Http;
use tower::ServiceBuilder;
#[cfg(feature = "telemetry")]
use tracing::Instrument;
use url::Url;

use super::Eip155ChainReference;
use super::nonce::PendingNonceManager;

/// Default wait for a settlement receipt.
pub const DEFAULT_RECEIPT_TIMEOUT_SECS: u64 = 30;

/// Gas, blob gas, nonce and chain id fillers.
pub type InnerFiller = JoinFill<
    GasFiller,
    JoinFill<BlobGasFiller, JoinFill<NonceFiller<PendingNonceManager>, ChainIdFiller>>,
>;

/// The composed provider: fillers plus wallet over a JSON-RPC root provider.
pub type InnerProvider = FillProvider<
    JoinFill<JoinFill<Identity, InnerFiller>, WalletFiller<EthereumWallet>>,
    RootProvider,
>;

/// Errors building an [`Eip155ChainProvider`].
#[derive(Debug, thiserror::Error)]
pub enum ProviderBuildError {
    /// The signer list was empty.
    #[error("at least one signer must be provided")]
    NoSigners,
    /// No endpoint for the chain speaks http or https.
    #[error("no usable http(s) rpc endpoint for {0}")]
    NoRpcEndpoints(ChainId),
}

/// Facilitator-side provider for one EVM chain.
///
/// Transactions rotate over the wallet's signers round-robin. Nonces come
/// from a [`PendingNonceManager`] and are reset whenever a send or receipt
/// wait fails.
#[derive(Debug)]
pub struct Eip155ChainProvider {
    chain: Eip155ChainReference,
    eip1559: bool,
    receipt_timeout: Duration,
    inner: InnerProvider,
    signer_addresses: Arc<Vec<Address>>,
    signer_cursor: Arc<AtomicUsize>,
    nonce_manager: PendingNonceManager,
}

impl Eip155ChainProvider {
    /// Builds a throttled fallback RPC client over the http(s) endpoints.
    ///
    /// Other URL schemes are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderBuildError::NoRpcEndpoints`] if nothing usable remains.
    pub fn rpc_client(
        chain_id: &ChainId,
        endpoints: &[(Url, Option<u32>)],
    ) -> Result<RpcClient, ProviderBuildError> {
        let transports = endpoints
            .iter()
            .filter(|(url, _)| matches!(url.scheme(), "http" | "https"))
            .map(|(url, rate_limit)| {
                #[cfg(feature = "telemetry")]
                tracing::info!(
                    chain = %chain_id,
                    rpc_url = %url,
                    ?rate_limit,
                    "using http transport"
                );
                ServiceBuilder::new()
                    .layer(ThrottleLayer::new(rate_limit.unwrap_or(u32::MAX)))
                    .service(Http::new(url.clone()))
            })
            .collect::<Vec<_>>();
        let count = NonZeroUsize::new(transports.len())
            .ok_or_else(|| ProviderBuildError::NoRpcEndpoints(chain_id.clone()))?;
        let fallback = ServiceBuilder::new()
            .layer(FallbackLayer::default().with_active_transport_count(count))
            .service(transports);
        Ok(RpcClient::new(fallback, false))
    }

    /// Creates a provider for `chain`.
    ///
    /// `eip1559 = false` makes sends fetch and pin a legacy gas price.
    ///
    /// # Errors
    ///
    /// Fails if the wallet has no signers or no endpoint is usable.
    pub fn new(
        chain: Eip155ChainReference,
        wallet: EthereumWallet,
        rpc_endpoints: &[(Url, Option<u32>)],
        eip1559: bool,
        receipt_timeout_secs: u64,
    ) -> Result<Self, ProviderBuildError> {
        let signer_addresses =
            NetworkWallet::<Ethereum>::signer_addresses(&wallet).collect::<Vec<_>>();
        if signer_addresses.is_empty() {
            return Err(ProviderBuildError::NoSigners);
        }
        let chain_id = chain.as_chain_id();
        let client = Self::rpc_client(&chain_id, rpc_endpoints)?;

        let nonce_manager = PendingNonceManager::default();
        let filler = JoinFill::new(
            GasFiller,
            JoinFill::new(
                BlobGasFiller::default(),
                JoinFill::new(
                    NonceFiller::new(nonce_manager.clone()),
                    ChainIdFiller::default(),
                ),
            ),
        );
        let inner: InnerProvider = ProviderBuilder::default()
            .filler(filler)
            .wallet(wallet)
            .connect_client(client);

        #[cfg(feature = "telemetry")]
        tracing::info!(chain = %chain_id, signers = ?signer_addresses, "evm provider ready");

        Ok(Self {
            chain,
            eip1559,
            receipt_timeout: Duration::from_secs(receipt_timeout_secs),
            inner,
            signer_addresses: Arc::new(signer_addresses),
            signer_cursor: Arc::new(AtomicUsize::new(0)),
            nonce_manager,
        })
    }

    fn next_signer_address(&self) -> Address {
        let next = self.signer_cursor.fetch_add(1, Ordering::Relaxed) % self.signer_addresses.len();
        self.signer_addresses[next]
    }
}

/// Errors sending a meta-transaction.
#[derive(Debug, thiserror::Error)]
pub enum MetaTransactionSendError {
    /// The RPC call failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Waiting for the receipt failed or timed out.
    #[error(transparent)]
    PendingTransaction(#[from] PendingTransactionError),
    /// Any other provider failure.
    #[error("{0}")]
    Custom(String),
}

/// A transaction the facilitator pays gas for.
#[derive(Debug, Clone)]
pub struct MetaTransaction {
    /// Contract being called.
    pub to: Address,
    /// ABI-encoded call.
    pub calldata: Bytes,
    /// Blocks to wait for before returning the receipt.
    pub confirmations: u64,
    /// EIP-7702 delegations to attach; empty for plain calls.
    pub authorization_list: Vec<SignedAuthorization>,
}

impl MetaTransaction {
    /// A plain call waiting for one confirmation.
    #[must_use]
    pub const fn call(to: Address, calldata: Bytes) -> Self {
        Self {
            to,
            calldata,
            confirmations: 1,
            authorization_list: Vec::new(),
        }
    }

    /// Attaches an EIP-7702 delegation.
    #[must_use]
    pub fn with_authorization(mut self, authorization: SignedAuthorization) -> Self {
        self.authorization_list.push(authorization);
        self
    }
}

impl ChainProviderOps for Eip155ChainProvider {
    fn signer_addresses(&self) -> Vec<String> {
        self.inner
            .signer_addresses()
            .map(|a| a.to_string())
            .collect()
    }

    fn chain_id(&self) -> ChainId {
        self.chain.as_chain_id()
    }
}

/// Sends facilitator-paid transactions on one chain.
pub trait Eip155MetaTransactionProvider {
    /// Send failure.
    type Error;
    /// The read provider underneath.
    type Inner: Provider;

    /// The underlying read provider.
    fn inner(&self) -> &Self::Inner;

    /// The chain transactions are sent on.
    fn chain(&self) -> &Eip155ChainReference;

    /// Submits `tx` and waits for its receipt.
    fn send_transaction(
        &self,
        tx: MetaTransaction,
    ) -> impl Future<Output = Result<TransactionReceipt, Self::Error>> + Send;
}

impl<T: Eip155MetaTransactionProvider + Sync + Send> Eip155MetaTransactionProvider for Arc<T> {
    type Error = T::Error;
    type Inner = T::Inner;

    fn inner(&self) -> &Self::Inner {
        (**self).inner()
    }

    fn chain(&self) -> &Eip155ChainReference {
        (**self).chain()
    }

    fn send_transaction(
        &self,
        tx: MetaTransaction,
    ) -> impl Future<Output = Result<TransactionReceipt, Self::Error>> + Send {
        (**self).send_transaction(tx)
    }
}

impl Eip155MetaTransactionProvider for Eip155ChainProvider {
    type Error = MetaTransactionSendError;
    type Inner = InnerProvider;

    fn inner(&self) -> &Self::Inner {
        &self.inner
    }

    fn chain(&self) -> &Eip155ChainReference {
        &self.chain
    }

    /// Sends from the next signer in rotation and waits up to the receipt
    /// timeout. Any failure resets that signer's nonce.
    async fn send_transaction(
        &self,
        tx: MetaTransaction,
    ) -> Result<TransactionReceipt, Self::Error> {
        let from_address = self.next_signer_address();
        let mut txr = TransactionRequest::default()
            .with_to(tx.to)
            .with_from(from_address)
            .with_input(tx.calldata);
        if !tx.authorization_list.is_empty() {
            txr.authorization_list = Some(tx.authorization_list);
        }

        if !self.eip1559 {
            let gas_fut = self.inner.get_gas_price();
            #[cfg(feature = "telemetry")]
            let gas = gas_fut.instrument(tracing::info_span!("get_gas_price")).await?;
            #[cfg(not(feature = "telemetry"))]
            let gas = gas_fut.await?;
            txr.set_gas_price(gas);
        }

        if txr.gas.is_none() {
            let gas_limit = match self
                .inner
                .estimate_gas(txr.clone())
                .block(BlockId::pending())
                .await
            {
                Ok(limit) => limit,
                Err(e) => {
                    self.nonce_manager.reset_nonce(from_address).await;
                    return Err(MetaTransactionSendError::Transport(e));
                }
            };
            txr.set_gas_limit(gas_limit);
        }

        let pending_tx = match self.inner.send_transaction(txr).await {
            Ok(pending) => pending,
            Err(e) => {
                self.nonce_manager.reset_nonce(from_address).await;
                return Err(MetaTransactionSendError::Transport(e));
            }
        };

        let watcher = pending_tx
            .with_required_confirmations(tx.confirmations)
            .with_timeout(Some(self.receipt_timeout));
        match watcher.get_receipt().await {
            Ok(receipt) => Ok(receipt),
            Err(e) => {
                self.nonce_manager.reset_nonce(from_address).await;
                Err(MetaTransactionSendError::PendingTransaction(e))
            }
        }
    }
}
