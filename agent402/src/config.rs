//! Declarative configuration for protected resources.
//!
//! A [`RoutesConfig`] maps route patterns such as `"GET /weather/[city]"` to
//! the payment options accepted there. It deserializes from JSON or TOML so a
//! gateway can be configured without code.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::chain::ChainId;
use crate::error::PaymentError;
use crate::proto::PaymentRequirements;
use crate::scheme::{Price, SchemeServer};

/// Default authorization lifetime when a resource sets none.
pub const DEFAULT_MAX_TIMEOUT_SECONDS: u64 = 300;

/// One way to pay for a resource.
///
/// ```rust
/// use agent402::config::ResourceConfig;
///
/// let config: ResourceConfig = serde_json::from_value(serde_json::json!({
///     "scheme": "exact",
///     "payTo": "0x209693Bc6afc0C5328bA36FaF03C514EF312287C",
///     "price": "$0.01",
///     "network": "eip155:84532"
/// }))
/// .unwrap();
/// assert_eq!(config.max_timeout_seconds(), 300);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConfig {
    /// Payment scheme, e.g. `exact`.
    pub scheme: String,
    /// Recipient address.
    pub pay_to: String,
    /// Money amount or explicit token amount.
    pub price: Price,
    /// CAIP-2 network.
    pub network: ChainId,
    /// Seconds the payment stays valid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_timeout_seconds: Option<u64>,
}

impl ResourceConfig {
    /// The timeout, or its default.
    #[must_use]
    pub fn max_timeout_seconds(&self) -> u64 {
        self.max_timeout_seconds
            .unwrap_or(DEFAULT_MAX_TIMEOUT_SECONDS)
    }

    /// Resolves the price through `server` into wire requirements.
    ///
    /// # Errors
    ///
    /// Returns [`PaymentError::UnsupportedScheme`] when `server` implements a
    /// different scheme, or the server's error when the price cannot be
    /// converted on this network.
    pub fn to_requirements(
        &self,
        server: &dyn SchemeServer,
    ) -> Result<PaymentRequirements, PaymentError> {
        if server.scheme() != self.scheme {
            return Err(crate::error::SchemeNotFoundError::new(
                &self.scheme,
                self.network.to_string(),
            )
            .into());
        }
        server.build_requirements(
            &self.price,
            &self.network,
            &self.pay_to,
            self.max_timeout_seconds(),
        )
    }
}

/// Payment options and metadata for one route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteConfig {
    /// Accepted payment options.
    pub accepts: Vec<ResourceConfig>,
    /// Shown in the challenge's resource info.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Shown in the challenge's resource info.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Policy group applied to payments on this route.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_group: Option<String>,
}

/// Route pattern to route configuration.
pub type RoutesConfig = BTreeMap<String, RouteConfig>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheme::{AssetAmount, Money, SchemeId};

    struct UsdcServer;

    impl SchemeId for UsdcServer {
        fn namespace(&self) -> &str {
            "eip155"
        }

        fn scheme(&self) -> &str {
            "exact"
        }
    }

    impl SchemeServer for UsdcServer {
        fn parse_price(
            &self,
            price: &Money,
            _network: &ChainId,
        ) -> Result<AssetAmount, PaymentError> {
            let amount = price
                .to_atomic(6)
                .ok_or_else(|| PaymentError::InvalidPaymentPayload("bad price".into()))?;
            Ok(AssetAmount {
                asset: "0xusdc".into(),
                amount: amount.to_string(),
                extra: None,
            })
        }
    }

    #[test]
    fn test_routes_from_json() {
        let routes: RoutesConfig = serde_json::from_str(
            r#"{
                "GET /weather": {
                    "accepts": [{
                        "scheme": "exact",
                        "payTo": "0xpayee",
                        "price": "$0.001",
                        "network": "eip155:8453",
                        "maxTimeoutSeconds": 60
                    }],
                    "description": "Weather report",
                    "policyGroup": "default"
                }
            }"#,
        )
        .unwrap();
        let route = &routes["GET /weather"];
        assert_eq!(route.policy_group.as_deref(), Some("default"));
        assert_eq!(route.accepts[0].max_timeout_seconds(), 60);
    }

    #[test]
    fn test_to_requirements() {
        let config: ResourceConfig = serde_json::from_value(serde_json::json!({
            "scheme": "exact",
            "payTo": "0xpayee",
            "price": "$0.01",
            "network": "eip155:8453"
        }))
        .unwrap();
        let reqs = config.to_requirements(&UsdcServer).unwrap();
        assert_eq!(reqs.amount, "10000");
        assert_eq!(reqs.asset, "0xusdc");
        assert_eq!(reqs.max_timeout_seconds, 300);

        let other = ResourceConfig {
            scheme: "upto".into(),
            ..config
        };
        assert!(matches!(
            other.to_requirements(&UsdcServer),
            Err(PaymentError::UnsupportedScheme(_))
        ));
    }
}
