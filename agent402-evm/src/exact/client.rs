//! Client-side signing for the EVM `exact` scheme.

use std::future::Future;
use std::sync::Arc;

use agent402::error::PaymentError;
use agent402::facilitator::BoxFuture;
use agent402::proto::PaymentRequirements;
use agent402::scheme::{SchemeClient, SchemeId};
use agent402::timestamp::UnixTimestamp;
use alloy_primitives::{Address, B256, Signature};
use alloy_signer_local::PrivateKeySigner;
use rand::{RngExt, rng};

use super::{Eip155Exact, ExactEvmAuthorization, ExactEvmPayload, PaymentRequirementsExtra};
use crate::auth::{TransferAuthorization, sign_authorization, token_domain};
use crate::chain::Eip155ChainReference;
use crate::networks::usdc_by_address;

/// How far `validAfter` is backdated, absorbing clock drift between client
/// and chain.
pub const VALID_AFTER_BACKDATE_SECS: u64 = 10 * 60;

/// Signing operations over owned or shared signers.
///
/// Alloy's `Signer` is not implemented for `Arc<T>`.
pub trait SignerLike: Send + Sync {
    /// The signing address.
    fn address(&self) -> Address;

    /// Signs a prehashed message.
    fn sign_hash(
        &self,
        hash: &B256,
    ) -> impl Future<Output = Result<Signature, alloy_signer::Error>> + Send;
}

impl SignerLike for PrivateKeySigner {
    fn address(&self) -> Address {
        Self::address(self)
    }

    async fn sign_hash(&self, hash: &B256) -> Result<Signature, alloy_signer::Error> {
        alloy_signer::Signer::sign_hash(self, hash).await
    }
}

impl<T: SignerLike> SignerLike for Arc<T> {
    fn address(&self) -> Address {
        (**self).address()
    }

    async fn sign_hash(&self, hash: &B256) -> Result<Signature, alloy_signer::Error> {
        (**self).sign_hash(hash).await
    }
}

/// Signs ERC-3009 transfers for `exact` requirements on any EIP-155 chain.
#[derive(Debug, Clone)]
pub struct ExactEvmClient<S> {
    signer: S,
}

impl<S> ExactEvmClient<S> {
    /// A client signing with `signer`.
    pub const fn new(signer: S) -> Self {
        Self { signer }
    }

    /// The wrapped signer.
    pub const fn signer(&self) -> &S {
        &self.signer
    }
}

impl<S: SignerLike> ExactEvmClient<S> {
    /// Builds the unsigned authorization for `requirements`, valid from ten
    /// minutes ago until `now + maxTimeoutSeconds`.
    ///
    /// # Errors
    ///
    /// [`PaymentError::UnsupportedNetwork`] for a non-EIP-155 network, and
    /// [`PaymentError::InvalidPaymentPayload`] for unparseable addresses or
    /// amounts, or when no EIP-712 domain is known for the asset.
    pub fn authorization(
        &self,
        requirements: &PaymentRequirements,
        now: UnixTimestamp,
    ) -> Result<TransferAuthorization, PaymentError> {
        let chain: Eip155ChainReference =
            requirements
                .network
                .parse()
                .map_err(|_| PaymentError::UnsupportedNetwork {
                    network: requirements.network.clone(),
                })?;
        let asset: Address = requirements
            .asset
            .parse()
            .map_err(|e| invalid(format!("asset: {e}")))?;
        let pay_to: Address = requirements
            .pay_to
            .parse()
            .map_err(|e| invalid(format!("payTo: {e}")))?;
        let value = requirements
            .amount_value()
            .ok_or_else(|| invalid(format!("amount '{}'", requirements.amount)))?;

        let (name, version) = match PaymentRequirementsExtra::from_requirements(requirements) {
            Some(extra) => (extra.name, extra.version),
            None => {
                let known = usdc_by_address(chain, asset).ok_or_else(|| {
                    invalid(format!("no EIP-712 domain known for {asset} on {chain}"))
                })?;
                (known.name.to_owned(), known.version.to_owned())
            }
        };

        let nonce: [u8; 32] = rng().random();
        Ok(TransferAuthorization {
            from: self.signer.address(),
            to: pay_to,
            value,
            valid_after: UnixTimestamp::from_secs(
                now.as_secs().saturating_sub(VALID_AFTER_BACKDATE_SECS),
            ),
            valid_before: now + requirements.max_timeout_seconds,
            nonce: B256::from(nonce),
            domain: token_domain(name, version, chain.inner(), asset),
        })
    }
}

fn invalid(message: String) -> PaymentError {
    PaymentError::InvalidPaymentPayload(message)
}

impl<S: SignerLike> SchemeClient for ExactEvmClient<S> {
    fn scheme(&self) -> &str {
        Eip155Exact.scheme()
    }

    fn create_payment_payload<'a>(
        &'a self,
        requirements: &'a PaymentRequirements,
    ) -> BoxFuture<'a, Result<serde_json::Value, PaymentError>> {
        Box::pin(async move {
            let authorization = self.authorization(requirements, UnixTimestamp::now())?;
            let signature = sign_authorization(&authorization, &self.signer)
                .await
                .map_err(|e| invalid(e.to_string()))?;
            let payload = ExactEvmPayload {
                signature: signature.as_bytes().into(),
                authorization: ExactEvmAuthorization::from(&authorization),
            };
            serde_json::to_value(&payload).map_err(|e| invalid(e.to_string()))
        })
    }
}
