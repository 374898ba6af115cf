//! Builds the running facilitator from [`FacilitatorConfig`].
//!
//! Each `[chains."eip155:<id>"]` section gets one provider shared by the
//! `exact` mechanism and, when `identity_registry` is set, by the agent
//! registrar. Sections with an unresolved signer key are skipped with a
//! warning so a partially filled environment still starts.

use std::sync::Arc;

use agent402::chain::NetworkPattern;
use agent402::facilitator::FacilitatorRegistry;
use agent402::hooks::HookedFacilitator;
use agent402::proto::v2;
use agent402_evm::Eip155ExactFacilitator;
use agent402_evm::chain::{Eip155ChainProvider, Eip155ChainReference, ProviderBuildError};
use agent402_evm::identity::IdentityRegistrar;
use alloy_network::EthereumWallet;
use alloy_signer_local::PrivateKeySigner;
use url::Url;

use crate::config::{ChainConfig, FacilitatorConfig};
use crate::handlers::FacilitatorState;
use crate::hooks::LoggingHooks;

/// A chain section that cannot be turned into a provider.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    /// The private key does not parse.
    #[error("invalid signer key for {network}: {reason}")]
    SignerKey {
        /// The chain section.
        network: String,
        /// Why the key was rejected.
        reason: String,
    },
    /// The RPC URL does not parse.
    #[error("invalid rpc url for {network}: {source}")]
    RpcUrl {
        /// The chain section.
        network: String,
        /// The parse failure.
        source: url::ParseError,
    },
    /// The provider could not be built.
    #[error(transparent)]
    Provider(#[from] ProviderBuildError),
}

/// Builds the handler state for every usable chain in `config`.
///
/// # Errors
///
/// Returns [`SetupError`] if a chain section names a malformed key or URL.
pub fn build_state(config: &FacilitatorConfig) -> Result<FacilitatorState, SetupError> {
    let mut registry = FacilitatorRegistry::new();
    let mut registrars = Vec::new();

    for (network, chain_config) in &config.chains {
        let Ok(chain) = network.parse::<Eip155ChainReference>() else {
            tracing::warn!(network = %network, "skipping chain: not an eip155 identifier");
            continue;
        };
        let Some(provider) = build_provider(network, chain, chain_config)? else {
            tracing::warn!(network = %network, "skipping chain: signer_private_key not resolved");
            continue;
        };
        let provider = Arc::new(provider);
        let chain_id = chain.as_chain_id();

        let exact = Eip155ExactFacilitator::new(Arc::clone(&provider));
        registry.register(v2::V2, NetworkPattern::from(&chain_id), "exact", exact);

        if let Some(delegate) = chain_config.identity_registry {
            registrars.push((chain_id.clone(), IdentityRegistrar::new(provider, delegate)));
        }
        tracing::info!(
            network = %chain_id,
            registration = chain_config.identity_registry.is_some(),
            "chain ready"
        );
    }

    if registry.schemes().is_empty() {
        tracing::warn!("no chains configured, /supported will be empty");
    }

    let hooked = HookedFacilitator::new(registry).with_hook(LoggingHooks);
    let state = registrars.into_iter().fold(
        FacilitatorState::new(hooked)
            .with_timeouts(config.verify_timeout(), config.settle_timeout()),
        |state, (network, registrar)| state.with_registrar(network, registrar),
    );
    Ok(state)
}

fn build_provider(
    network: &str,
    chain: Eip155ChainReference,
    config: &ChainConfig,
) -> Result<Option<Eip155ChainProvider>, SetupError> {
    let Some(key) = config.signer_key() else {
        return Ok(None);
    };
    let signer: PrivateKeySigner = key.parse().map_err(|e: alloy_signer_local::LocalSignerError| {
        SetupError::SignerKey {
            network: network.to_owned(),
            reason: e.to_string(),
        }
    })?;
    tracing::debug!(network = %network, signer = %signer.address(), "loaded signer");
    let rpc_url: Url = config.rpc_url.parse().map_err(|source| SetupError::RpcUrl {
        network: network.to_owned(),
        source,
    })?;
    let provider = Eip155ChainProvider::new(
        chain,
        EthereumWallet::from(signer),
        &[(rpc_url, None)],
        config.eip1559,
        config.receipt_timeout_secs(),
    )?;
    Ok(Some(provider))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    fn config(raw: &str) -> FacilitatorConfig {
        FacilitatorConfig::parse(raw, |name| (name == "KEY").then(|| KEY.to_owned())).unwrap()
    }

    #[tokio::test]
    async fn test_skips_unusable_chains() {
        let config = config(
            r#"
            [chains."eip155:84532"]
            rpc_url = "http://127.0.0.1:8545"
            signer_private_key = "$KEY"
            identity_registry = "0x8004A818BFB912233c491871b3d84c89A494BD9e"

            [chains."eip155:8453"]
            rpc_url = "http://127.0.0.1:8546"
            signer_private_key = "$UNSET_KEY"

            [chains."solana:mainnet"]
            rpc_url = "http://127.0.0.1:8899"
            signer_private_key = "$KEY"
            "#,
        );
        let state = build_state(&config).unwrap();
        let supported = state.facilitator().supported().await.unwrap();
        let networks: Vec<_> = supported.kinds.iter().map(|k| k.network.as_str()).collect();
        assert_eq!(networks, ["eip155:84532"]);
        assert_eq!(supported.signers["eip155:*"].len(), 1);
        assert!(state.registers(&"eip155:84532".parse().unwrap()));
        assert!(!state.registers(&"eip155:8453".parse().unwrap()));
    }

    #[test]
    fn test_rejects_malformed_key() {
        let config = config(
            r#"
            [chains."eip155:84532"]
            rpc_url = "http://127.0.0.1:8545"
            signer_private_key = "not-a-key"
            "#,
        );
        let err = build_state(&config).unwrap_err();
        assert!(matches!(err, SetupError::SignerKey { .. }));
    }

    #[test]
    fn test_rejects_malformed_url() {
        let config = config(
            r#"
            [chains."eip155:84532"]
            rpc_url = "not a url"
            signer_private_key = "$KEY"
            "#,
        );
        assert!(matches!(build_state(&config).unwrap_err(), SetupError::RpcUrl { .. }));
    }
}
