//! Delegated agent registration.
//!
//! An agent signs an EIP-7702 authorization that points its EOA at the
//! configured delegate contract. The facilitator submits a type-4
//! transaction to the agent's own address carrying that authorization and a
//! `register(tokenURI, metadata)` call, paying the gas. The delegate code
//! mints the identity token to the agent and emits `Registered`.

use agent402::chain::ChainId;
use agent402::error::{PaymentError, SettleError};
use agent402::proto::ErrorReason;
use alloy_eips::eip7702::SignedAuthorization;
use alloy_primitives::{Address, Bytes, TxHash, U256};
use alloy_rpc_types_eth::Log;
use alloy_sol_types::{SolCall, SolEvent, sol};
use serde::{Deserialize, Serialize};
#[cfg(feature = "telemetry")]
use tracing::instrument;

use crate::chain::{
    Eip155ChainReference, Eip155MetaTransactionProvider, MetaTransaction,
    MetaTransactionSendError,
};

sol! {
    /// Registration entry points of the delegate contract.
    #[allow(missing_docs)]
    #[derive(Debug)]
    interface IAgentDelegate {
        struct MetadataEntry {
            string key;
            bytes value;
        }

        function register(string tokenURI, MetadataEntry[] metadata) external returns (uint256 agentId);

        event Registered(uint256 indexed agentId, string tokenURI, address indexed owner);
    }
}

/// One metadata key/value stored with the identity token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataEntry {
    /// Metadata key.
    pub key: String,
    /// Metadata value.
    pub value: String,
}

/// Body of `POST /register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    /// The agent's EOA; becomes the token owner.
    pub agent_address: Address,
    /// EIP-7702 delegation signed by the agent.
    pub authorization: SignedAuthorization,
    /// Registration file URI.
    #[serde(default, rename = "tokenURI", skip_serializing_if = "Option::is_none")]
    pub token_uri: Option<String>,
    /// Extra on-chain metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Vec<MetadataEntry>>,
    /// Chain to register on.
    pub network: ChainId,
}

/// Response of `POST /register`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    /// The new agent id, in decimal.
    pub agent_id: String,
    /// The registration transaction.
    pub tx_hash: TxHash,
}

/// Why a delegated registration failed.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    /// The delegation targets another contract.
    #[error("authorization delegates to {actual}, expected {expected}")]
    AddressMismatch {
        /// The registrar's delegate.
        expected: Address,
        /// The delegation's target.
        actual: Address,
    },
    /// The request names a chain this registrar does not serve.
    #[error("registrar serves {expected}, request is for {actual}")]
    NetworkMismatch {
        /// The registrar's chain.
        expected: ChainId,
        /// The requested chain.
        actual: ChainId,
    },
    /// The delegation is for another chain.
    #[error("authorization is bound to chain {0}")]
    ChainMismatch(U256),
    /// The delegation signature is malformed.
    #[error("cannot recover authorization signer: {0}")]
    Recovery(String),
    /// The delegation was not signed by the agent.
    #[error("authorization signed by {recovered}, agent is {agent}")]
    AuthorityMismatch {
        /// The agent named in the request.
        agent: Address,
        /// The delegation's actual signer.
        recovered: Address,
    },
    /// The transaction could not be sent.
    #[error(transparent)]
    Send(#[from] MetaTransactionSendError),
    /// The transaction was mined but reverted.
    #[error("registration transaction {0} reverted")]
    Reverted(TxHash),
    /// The receipt has no `Registered` log.
    #[error("transaction {0} emitted no Registered event")]
    MissingEvent(TxHash),
}

impl From<RegistrationError> for PaymentError {
    fn from(value: RegistrationError) -> Self {
        match value {
            RegistrationError::AddressMismatch { expected, actual } => {
                Self::AuthorizationAddressMismatch {
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                }
            }
            RegistrationError::NetworkMismatch { actual, .. } => Self::UnsupportedNetwork {
                network: actual.to_string(),
            },
            RegistrationError::ChainMismatch(_)
            | RegistrationError::Recovery(_)
            | RegistrationError::AuthorityMismatch { .. } => {
                Self::InvalidPaymentPayload(value.to_string())
            }
            RegistrationError::Reverted(tx) => Self::SettlementFailed(
                SettleError::new(ErrorReason::TransactionReverted.as_str())
                    .with_message(value.to_string())
                    .with_transaction(tx.to_string()),
            ),
            RegistrationError::Send(_) | RegistrationError::MissingEvent(_) => {
                Self::settlement_unexpected(value.to_string())
            }
        }
    }
}

/// Submits delegated registrations on one chain.
pub struct IdentityRegistrar<P> {
    provider: P,
    delegate: Address,
}

impl<P> std::fmt::Debug for IdentityRegistrar<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityRegistrar")
            .field("delegate", &self.delegate)
            .finish_non_exhaustive()
    }
}

impl<P> IdentityRegistrar<P> {
    /// `delegate` is the only contract agents may delegate to.
    pub const fn new(provider: P, delegate: Address) -> Self {
        Self { provider, delegate }
    }

    /// The only contract agents may delegate to.
    pub const fn delegate(&self) -> Address {
        self.delegate
    }
}

impl<P> IdentityRegistrar<P>
where
    P: Eip155MetaTransactionProvider + Sync,
    RegistrationError: From<P::Error>,
{
    /// Checks the delegation, submits it with the `register` call, and reads
    /// the new agent id from the receipt.
    ///
    /// Nothing is submitted unless the authorization targets the configured
    /// delegate, is bound to this chain (or to any chain), and was signed by
    /// `agentAddress`.
    ///
    /// # Errors
    ///
    /// [`RegistrationError::AddressMismatch`] comes first; send failures,
    /// reverts and a missing event follow.
    #[cfg_attr(feature = "telemetry", instrument(skip_all, err, fields(
        agent = %request.agent_address,
        network = %request.network
    )))]
    pub async fn register(
        &self,
        request: RegisterRequest,
    ) -> Result<RegisterResponse, RegistrationError> {
        self.check(&request)?;

        let metadata = request
            .metadata
            .unwrap_or_default()
            .into_iter()
            .map(|entry| IAgentDelegate::MetadataEntry {
                key: entry.key,
                value: Bytes::from(entry.value.into_bytes()),
            })
            .collect();
        let call = IAgentDelegate::registerCall {
            tokenURI: request.token_uri.unwrap_or_default(),
            metadata,
        };
        let tx = MetaTransaction::call(request.agent_address, call.abi_encode().into())
            .with_authorization(request.authorization);
        let receipt = self.provider.send_transaction(tx).await?;

        let tx_hash = receipt.transaction_hash;
        if !receipt.status() {
            return Err(RegistrationError::Reverted(tx_hash));
        }
        let agent_id = registered_agent_id(receipt.inner.logs(), request.agent_address)
            .ok_or(RegistrationError::MissingEvent(tx_hash))?;

        #[cfg(feature = "telemetry")]
        tracing::info!(
            agent = %request.agent_address,
            %agent_id,
            tx = %tx_hash,
            "agent registered"
        );

        Ok(RegisterResponse {
            agent_id: agent_id.to_string(),
            tx_hash,
        })
    }

    fn check(&self, request: &RegisterRequest) -> Result<(), RegistrationError> {
        let authorization = request.authorization.inner();
        if authorization.address != self.delegate {
            return Err(RegistrationError::AddressMismatch {
                expected: self.delegate,
                actual: authorization.address,
            });
        }
        let chain: &Eip155ChainReference = self.provider.chain();
        let expected = chain.as_chain_id();
        if request.network != expected {
            return Err(RegistrationError::NetworkMismatch {
                expected,
                actual: request.network.clone(),
            });
        }
        if !authorization.chain_id.is_zero()
            && authorization.chain_id != U256::from(chain.inner())
        {
            return Err(RegistrationError::ChainMismatch(authorization.chain_id));
        }
        let recovered = request
            .authorization
            .recover_authority()
            .map_err(|e| RegistrationError::Recovery(e.to_string()))?;
        if recovered != request.agent_address {
            return Err(RegistrationError::AuthorityMismatch {
                agent: request.agent_address,
                recovered,
            });
        }
        Ok(())
    }
}

/// The `agentId` of the first `Registered` event emitted by `agent`.
#[must_use]
pub fn registered_agent_id(logs: &[Log], agent: Address) -> Option<U256> {
    logs.iter()
        .filter(|log| log.inner.address == agent)
        .find_map(|log| IAgentDelegate::Registered::decode_log(&log.inner).ok())
        .map(|event| event.data.agentId)
}
