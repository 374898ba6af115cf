//! Server-side scheme abstractions.
//!
//! A resource server names prices as money (`"$0.01"`) or as a raw token
//! amount; a [`SchemeServer`] turns either into [`PaymentRequirements`].

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::chain::ChainId;
use crate::error::PaymentError;
use crate::proto::PaymentRequirements;

/// A token amount ready for use in payment requirements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetAmount {
    /// The token contract address.
    pub asset: String,
    /// The amount in the token's smallest unit (e.g., "10000" for 0.01 USDC).
    pub amount: String,
    /// Scheme-specific data to merge into `extra`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

/// A route price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Price {
    /// A fiat-denominated amount, converted by the scheme's default stablecoin.
    Money(Money),
    /// An explicit token amount.
    Asset(AssetAmount),
}

/// A non-negative money amount such as `$0.01`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Money(Decimal);

impl Money {
    /// The decimal value.
    #[must_use]
    pub const fn value(&self) -> Decimal {
        self.0
    }

    /// Scales the amount to atomic units with `decimals` places.
    ///
    /// Returns `None` on overflow or if precision would be lost.
    #[must_use]
    pub fn to_atomic(&self, decimals: u32) -> Option<u128> {
        let scale = Decimal::from(10u64.checked_pow(decimals)?);
        let scaled = self.0.checked_mul(scale)?;
        if scaled.fract() != Decimal::ZERO {
            return None;
        }
        scaled.to_u128()
    }
}

/// Error for an unparseable money string.
#[derive(Debug, thiserror::Error)]
#[error("invalid money amount '{0}'")]
pub struct MoneyFormatError(String);

impl FromStr for Money {
    type Err = MoneyFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches('$').replace('_', "");
        let value = Decimal::from_str(&trimmed).map_err(|_| MoneyFormatError(s.into()))?;
        if value.is_sign_negative() {
            return Err(MoneyFormatError(s.into()));
        }
        Ok(Self(value))
    }
}

impl Serialize for Money {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("${}", self.0))
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Server-side half of a scheme.
pub trait SchemeServer: super::SchemeId + Send + Sync {
    /// Converts money into the scheme's default asset on `network`.
    ///
    /// # Errors
    ///
    /// Returns [`PaymentError::UnsupportedNetwork`] if the scheme has no
    /// default asset on the network.
    fn parse_price(&self, price: &Money, network: &ChainId) -> Result<AssetAmount, PaymentError>;

    /// Adds scheme-specific data to freshly built requirements.
    ///
    /// The default implementation returns the requirements unchanged.
    fn enhance_requirements(&self, requirements: PaymentRequirements) -> PaymentRequirements {
        requirements
    }

    /// Builds complete [`PaymentRequirements`] for a price.
    ///
    /// # Errors
    ///
    /// Returns an error if the price cannot be converted on `network`.
    fn build_requirements(
        &self,
        price: &Price,
        network: &ChainId,
        pay_to: &str,
        max_timeout_seconds: u64,
    ) -> Result<PaymentRequirements, PaymentError> {
        let asset_amount = match price {
            Price::Money(money) => self.parse_price(money, network)?,
            Price::Asset(asset) => asset.clone(),
        };
        let base = PaymentRequirements {
            scheme: self.scheme().to_owned(),
            network: network.to_string(),
            amount: asset_amount.amount,
            pay_to: pay_to.to_owned(),
            max_timeout_seconds,
            asset: asset_amount.asset,
            extra: asset_amount
                .extra
                .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new())),
        };
        Ok(self.enhance_requirements(base))
    }
}
