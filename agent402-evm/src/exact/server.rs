//! Server-side pricing for the EVM `exact` scheme.

use agent402::chain::ChainId;
use agent402::error::PaymentError;
use agent402::proto::PaymentRequirements;
use agent402::scheme::{AssetAmount, Money, SchemeId, SchemeServer};
use alloy_primitives::Address;
use serde_json::json;

use super::{Eip155Exact, PaymentRequirementsExtra};
use crate::chain::Eip155ChainReference;
use crate::networks::{USDC_DECIMALS, usdc_by_address, usdc_deployment};

/// Prices routes in USDC and stamps the token's EIP-712 domain into `extra`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactEvmServer;

impl SchemeId for ExactEvmServer {
    fn namespace(&self) -> &str {
        Eip155Exact.namespace()
    }

    fn scheme(&self) -> &str {
        Eip155Exact.scheme()
    }
}

impl SchemeServer for ExactEvmServer {
    fn parse_price(&self, price: &Money, network: &ChainId) -> Result<AssetAmount, PaymentError> {
        let usdc = Eip155ChainReference::try_from(network)
            .ok()
            .and_then(usdc_deployment)
            .ok_or_else(|| PaymentError::UnsupportedNetwork {
                network: network.to_string(),
            })?;
        let amount = price.to_atomic(USDC_DECIMALS).ok_or_else(|| {
            PaymentError::InvalidPaymentPayload(format!(
                "price {} is not representable in {USDC_DECIMALS} decimals",
                price.value()
            ))
        })?;
        Ok(AssetAmount {
            asset: usdc.address.to_string(),
            amount: amount.to_string(),
            extra: Some(json!({ "name": usdc.name, "version": usdc.version })),
        })
    }

    fn enhance_requirements(&self, mut requirements: PaymentRequirements) -> PaymentRequirements {
        if PaymentRequirementsExtra::from_requirements(&requirements).is_some() {
            return requirements;
        }
        let known = requirements
            .network
            .parse::<Eip155ChainReference>()
            .ok()
            .zip(requirements.asset.parse::<Address>().ok())
            .and_then(|(chain, asset)| usdc_by_address(chain, asset));
        if let Some(usdc) = known
            && let serde_json::Value::Object(map) = &mut requirements.extra
        {
            map.insert("name".into(), usdc.name.into());
            map.insert("version".into(), usdc.version.into());
        }
        requirements
    }
}
