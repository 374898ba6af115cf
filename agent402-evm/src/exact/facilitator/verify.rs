//! Verification of `exact` payments.
//!
//! Checks that need no chain access run first, so a stale or mismatched
//! payload is rejected without a single RPC round trip.

use agent402::proto::{PaymentPayload, PaymentRequirements, PaymentVerificationError};
use agent402::scheme::ExactScheme;
use agent402::timestamp::UnixTimestamp;
use alloy_primitives::{Address, B256, Bytes, Signature, U256};
use alloy_provider::Provider;
use alloy_sol_types::Eip712Domain;
#[cfg(feature = "telemetry")]
use tracing::instrument;

use super::contract::IEIP3009;
use super::error::Eip155ExactError;
use crate::auth::{
    AuthorizationCodec, AuthorizationError, SIGNATURE_LENGTH, TransferAuthorization,
    recover_signer, token_domain,
};
use crate::chain::Eip155ChainReference;
use crate::exact::{ExactEvmPayload, PaymentRequirementsExtra};

/// Awaits a future, optionally instrumenting it with a tracing span.
macro_rules! traced {
    ($fut:expr, $span:expr) => {{
        #[cfg(feature = "telemetry")]
        {
            use tracing::Instrument;
            $fut.instrument($span).await
        }
        #[cfg(not(feature = "telemetry"))]
        {
            $fut.await
        }
    }};
}

/// Seconds an authorization must stay valid past `now` to leave room for
/// the settlement transaction.
pub const SETTLEMENT_BUFFER_SECS: u64 = 6;

/// A payment that passed every check and can be settled.
#[derive(Debug, Clone)]
pub struct ExactPayment {
    /// The token contract.
    pub asset: Address,
    /// The checked authorization.
    pub authorization: TransferAuthorization,
    /// Signature over `authorization`.
    pub signature: Bytes,
}

impl ExactPayment {
    /// The address paying.
    #[must_use]
    pub const fn payer(&self) -> Address {
        self.authorization.from
    }
}

/// Parses the scheme payload.
///
/// # Errors
///
/// [`PaymentVerificationError::InvalidFormat`] if the JSON does not match.
pub fn decode_payload(
    payload: &PaymentPayload,
) -> Result<ExactEvmPayload, PaymentVerificationError> {
    Ok(serde_json::from_value(payload.payload.clone())?)
}

/// Offline checks of the payload against the requirements.
///
/// Returns the token address on success.
///
/// # Errors
///
/// The first mismatch found.
pub fn assert_requirements(
    chain: &Eip155ChainReference,
    payload: &ExactEvmPayload,
    accepted: &PaymentRequirements,
    requirements: &PaymentRequirements,
) -> Result<Address, PaymentVerificationError> {
    if accepted != requirements {
        return Err(PaymentVerificationError::AcceptedRequirementsMismatch);
    }
    if requirements.scheme != ExactScheme::VALUE {
        return Err(PaymentVerificationError::UnsupportedScheme);
    }
    let network: Eip155ChainReference = requirements
        .network
        .parse()
        .map_err(|_| PaymentVerificationError::UnsupportedChain)?;
    if network != *chain {
        return Err(PaymentVerificationError::ChainIdMismatch);
    }
    let pay_to: Address = requirements
        .pay_to
        .parse()
        .map_err(|e| PaymentVerificationError::InvalidFormat(format!("payTo: {e}")))?;
    if payload.authorization.to != pay_to {
        return Err(PaymentVerificationError::RecipientMismatch);
    }
    let required = requirements.amount_value().ok_or_else(|| {
        PaymentVerificationError::InvalidFormat(format!("amount '{}'", requirements.amount))
    })?;
    assert_enough_value(&payload.authorization.value, &required)?;
    requirements
        .asset
        .parse()
        .map_err(|_| PaymentVerificationError::AssetMismatch)
}

/// Checks the validity window.
///
/// `validBefore` must leave [`SETTLEMENT_BUFFER_SECS`] of headroom and
/// `validAfter` must not be after `now`; the token contract rejects an
/// authorization that is not yet valid.
///
/// # Errors
///
/// [`PaymentVerificationError::Expired`] or [`PaymentVerificationError::Early`].
pub fn assert_time(
    valid_after: UnixTimestamp,
    valid_before: UnixTimestamp,
    now: UnixTimestamp,
) -> Result<(), PaymentVerificationError> {
    if valid_before < now + SETTLEMENT_BUFFER_SECS {
        return Err(PaymentVerificationError::Expired);
    }
    if valid_after > now {
        return Err(PaymentVerificationError::Early);
    }
    Ok(())
}

/// # Errors
///
/// [`PaymentVerificationError::InvalidPaymentAmount`] if `sent` is short.
pub fn assert_enough_value(sent: &U256, required: &U256) -> Result<(), PaymentVerificationError> {
    if sent < required {
        Err(PaymentVerificationError::InvalidPaymentAmount)
    } else {
        Ok(())
    }
}

/// The token's EIP-712 domain, from `extra` when present, else read from
/// the contract.
///
/// # Errors
///
/// Returns [`Eip155ExactError`] if the on-chain name/version queries fail.
#[cfg_attr(feature = "telemetry", instrument(skip_all, err, fields(
    network = %chain.as_chain_id(),
    asset = %token.address()
)))]
pub async fn assert_domain<P: Provider>(
    chain: &Eip155ChainReference,
    token: &IEIP3009::IEIP3009Instance<P>,
    extra: Option<PaymentRequirementsExtra>,
) -> Result<Eip712Domain, Eip155ExactError> {
    let (name, version) = if let Some(extra) = extra {
        (extra.name, extra.version)
    } else {
        let name_call = token.name();
        let name = traced!(
            name_call.call().into_future(),
            tracing::info_span!("fetch_eip712_name", otel.kind = "client")
        )?;
        let version_call = token.version();
        let version = traced!(
            version_call.call().into_future(),
            tracing::info_span!("fetch_eip712_version", otel.kind = "client")
        )?;
        (name, version)
    };
    Ok(token_domain(name, version, chain.inner(), *token.address()))
}

/// Recovers an EOA signature and compares it with `from`.
///
/// Returns `false` for contract-wallet signatures (any length other than 65
/// bytes); those are left to [`simulate_transfer`].
///
/// # Errors
///
/// [`AuthorizationError::SignerMismatch`] if another key signed.
pub fn assert_eoa_signature(
    authorization: &TransferAuthorization,
    signature: &[u8],
) -> Result<bool, AuthorizationError> {
    if signature.len() != SIGNATURE_LENGTH {
        return Ok(false);
    }
    let signature = Signature::from_raw(signature)?;
    let recovered = recover_signer(&authorization.digest(), &signature)?;
    if recovered == authorization.from {
        Ok(true)
    } else {
        Err(AuthorizationError::SignerMismatch {
            expected: authorization.from,
            recovered,
        })
    }
}

/// Fails with [`PaymentVerificationError::NonceAlreadyUsed`] once the token
/// has consumed `(from, nonce)`.
///
/// # Errors
///
/// Also returns transport errors from the state query.
#[cfg_attr(feature = "telemetry", instrument(skip_all, err, fields(
    from = %authorization.from,
    nonce = %authorization.nonce
)))]
pub async fn assert_nonce_unused<P: Provider>(
    token: &IEIP3009::IEIP3009Instance<P>,
    authorization: &TransferAuthorization,
) -> Result<(), Eip155ExactError> {
    if authorization_used(token, authorization.from, authorization.nonce).await? {
        Err(PaymentVerificationError::NonceAlreadyUsed.into())
    } else {
        Ok(())
    }
}

/// Reads `authorizationState(from, nonce)`.
///
/// # Errors
///
/// Transport or decoding errors from the call.
pub async fn authorization_used<P: Provider>(
    token: &IEIP3009::IEIP3009Instance<P>,
    from: Address,
    nonce: B256,
) -> Result<bool, Eip155ExactError> {
    let state = token.authorizationState(from, nonce);
    let used = traced!(
        state.call().into_future(),
        tracing::info_span!("fetch_authorization_state",
            token_contract = %token.address(),
            otel.kind = "client"
        )
    )?;
    Ok(used)
}

/// # Errors
///
/// [`PaymentVerificationError::InsufficientFunds`] if the balance is short.
#[cfg_attr(feature = "telemetry", instrument(skip_all, err, fields(
    sender = %sender,
    required = %required
)))]
pub async fn assert_enough_balance<P: Provider>(
    token: &IEIP3009::IEIP3009Instance<P>,
    sender: &Address,
    required: U256,
) -> Result<(), Eip155ExactError> {
    let balance_of = token.balanceOf(*sender);
    let balance = traced!(
        balance_of.call().into_future(),
        tracing::info_span!("fetch_token_balance",
            token_contract = %token.address(),
            otel.kind = "client"
        )
    )?;
    if balance < required {
        Err(PaymentVerificationError::InsufficientFunds.into())
    } else {
        Ok(())
    }
}

/// Dry-runs `transferWithAuthorization` with the raw signature bytes.
///
/// A revert means the token rejected the signature.
///
/// # Errors
///
/// [`PaymentVerificationError::InvalidSignature`] on revert, transport
/// errors otherwise.
#[cfg_attr(feature = "telemetry", instrument(skip_all, err))]
pub async fn simulate_transfer<P: Provider>(
    token: &IEIP3009::IEIP3009Instance<P>,
    authorization: &TransferAuthorization,
    signature: Bytes,
) -> Result<(), Eip155ExactError> {
    let call = token.transferWithAuthorization_0(
        authorization.from,
        authorization.to,
        authorization.value,
        U256::from(authorization.valid_after.as_secs()),
        U256::from(authorization.valid_before.as_secs()),
        authorization.nonce,
        signature,
    );
    let result = traced!(
        call.call().into_future(),
        tracing::info_span!("simulate_transferWithAuthorization_0", otel.kind = "client")
    );
    match result {
        Ok(_) => Ok(()),
        Err(alloy_contract::Error::TransportError(e)) if e.as_error_resp().is_some() => Err(
            PaymentVerificationError::InvalidSignature(format!("transfer simulation reverted: {e}"))
                .into(),
        ),
        Err(e) => Err(e.into()),
    }
}

/// Runs every check a payment must pass before settlement.
///
/// # Errors
///
/// The first failing check.
#[cfg_attr(feature = "telemetry", instrument(skip_all, err, fields(
    payer = %payload.authorization.from
)))]
pub async fn assert_valid_payment<P: Provider>(
    provider: &P,
    chain: &Eip155ChainReference,
    payload: &ExactEvmPayload,
    accepted: &PaymentRequirements,
    requirements: &PaymentRequirements,
    now: UnixTimestamp,
) -> Result<ExactPayment, Eip155ExactError> {
    let asset = assert_requirements(chain, payload, accepted, requirements)?;
    let wire = &payload.authorization;
    assert_time(wire.valid_after, wire.valid_before, now)?;

    let token = IEIP3009::new(asset, provider);
    let extra = PaymentRequirementsExtra::from_requirements(requirements);
    let domain = assert_domain(chain, &token, extra).await?;
    let authorization = wire.bind(domain);

    let is_eoa = assert_eoa_signature(&authorization, &payload.signature)?;
    assert_nonce_unused(&token, &authorization).await?;
    assert_enough_balance(&token, &authorization.from, authorization.value).await?;
    if !is_eoa {
        simulate_transfer(&token, &authorization, payload.signature.clone()).await?;
    }

    Ok(ExactPayment {
        asset,
        authorization,
        signature: payload.signature.clone(),
    })
}
