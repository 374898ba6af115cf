use agent402::timestamp::UnixTimestamp;
use alloy_primitives::{Address, B256, Bytes, Signature, U256, eip191_hash_message, keccak256};
use alloy_sol_types::{SolType, SolValue, sol};

use super::{AuthorizationCodec, AuthorizationError, encode_with_signature, split_signature};

sol! {
    /// Identity-registry feedback grant. Field order is part of the wire format.
    #[derive(Debug, PartialEq, Eq)]
    struct FeedbackAuth {
        uint256 agentId;
        address clientAddress;
        uint64 indexLimit;
        uint256 expiry;
        uint256 chainId;
        address identityRegistry;
        address signerAddress;
    }
}

/// Permission for `client_address` to leave up to `index_limit` feedback
/// entries about `agent_id`, signed by the agent's owner or operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedbackAuthorization {
    /// The agent receiving feedback.
    pub agent_id: U256,
    /// The client allowed to give it.
    pub client_address: Address,
    /// Highest feedback index the client may use.
    pub index_limit: u64,
    /// Last second the authorization is valid.
    pub expiry: UnixTimestamp,
    /// Chain the reputation registry lives on.
    pub chain_id: u64,
    /// Identity registry holding `agent_id`.
    pub identity_registry: Address,
    /// Owner or operator of the agent.
    pub signer_address: Address,
}

impl FeedbackAuthorization {
    fn typed(&self) -> FeedbackAuth {
        FeedbackAuth {
            agentId: self.agent_id,
            clientAddress: self.client_address,
            indexLimit: self.index_limit,
            expiry: U256::from(self.expiry.as_secs()),
            chainId: U256::from(self.chain_id),
            identityRegistry: self.identity_registry,
            signerAddress: self.signer_address,
        }
    }

    /// `message || signature`, as submitted to `giveFeedback`.
    #[must_use]
    pub fn encode(&self, signature: &Signature) -> Bytes {
        encode_with_signature(&self.message(), signature)
    }

    /// Parses a blob produced by [`Self::encode`].
    ///
    /// # Errors
    ///
    /// Fails on a short blob, a bad signature, an undecodable message, or
    /// expiry/chain id values that do not fit 64 bits.
    pub fn decode(encoded: &[u8]) -> Result<(Self, Signature), AuthorizationError> {
        let (message, signature) = split_signature(encoded)?;
        let raw = <FeedbackAuth as SolType>::abi_decode(message)?;
        let narrow = |value: U256, field| {
            u64::try_from(value).map_err(|_| AuthorizationError::OutOfRange(field))
        };
        let authorization = Self {
            agent_id: raw.agentId,
            client_address: raw.clientAddress,
            index_limit: raw.indexLimit,
            expiry: UnixTimestamp::from_secs(narrow(raw.expiry, "expiry")?),
            chain_id: narrow(raw.chainId, "chainId")?,
            identity_registry: raw.identityRegistry,
            signer_address: raw.signerAddress,
        };
        Ok((authorization, signature))
    }

    /// `keccak256(message)` before the EIP-191 prefix.
    #[must_use]
    pub fn struct_hash(&self) -> B256 {
        keccak256(self.message())
    }
}

impl AuthorizationCodec for FeedbackAuthorization {
    fn message(&self) -> Vec<u8> {
        self.typed().abi_encode()
    }

    fn digest(&self) -> B256 {
        eip191_hash_message(self.struct_hash())
    }

    fn expected_signer(&self) -> Address {
        self.signer_address
    }

    fn valid_before(&self) -> UnixTimestamp {
        self.expiry
    }
}
