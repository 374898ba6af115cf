//! Version 2 wire types.
//!
//! Networks are CAIP-2 chain IDs and every field is camelCase on the wire.

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Extensions;

/// The protocol version these types speak.
pub const V2: u32 = 2;

/// Describes the resource being paid for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInfo {
    /// The URL of the resource.
    pub url: String,

    /// Optional human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Optional MIME type of the resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// One accepted way to pay for a resource.
///
/// Issued by the resource server and never changed afterwards.
///
/// ```json
/// {
///   "scheme": "exact",
///   "network": "eip155:8453",
///   "asset": "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913",
///   "amount": "1000000",
///   "payTo": "0x...",
///   "maxTimeoutSeconds": 300,
///   "extra": { "name": "USD Coin", "version": "2" }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    /// Payment scheme identifier (e.g., "exact").
    pub scheme: String,

    /// CAIP-2 network identifier (e.g., "eip155:8453").
    pub network: String,

    /// Asset address/identifier.
    pub asset: String,

    /// Amount in atomic units, as a decimal string.
    pub amount: String,

    /// Recipient address.
    pub pay_to: String,

    /// Maximum time in seconds for payment validity.
    pub max_timeout_seconds: u64,

    /// Scheme-specific data (e.g., EIP-712 domain name and version).
    #[serde(default = "default_empty_object")]
    pub extra: Value,
}

impl PaymentRequirements {
    /// Parses [`Self::amount`] as an unsigned integer.
    #[must_use]
    pub fn amount_value(&self) -> Option<U256> {
        U256::from_str_radix(&self.amount, 10).ok()
    }

    /// Returns the extra metadata, or `None` if it is null or empty.
    #[must_use]
    pub fn extra(&self) -> Option<&Value> {
        match &self.extra {
            Value::Null => None,
            Value::Object(map) if map.is_empty() => None,
            other => Some(other),
        }
    }
}

/// The `402 Payment Required` challenge.
///
/// ```json
/// {
///   "x402Version": 2,
///   "error": "Payment required",
///   "resource": { "url": "https://api.example.com/data" },
///   "accepts": [{ "scheme": "exact", "network": "eip155:8453", "...": "..." }]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequired {
    /// Protocol version.
    #[serde(default = "default_v2")]
    pub x402_version: u32,

    /// Why the request was challenged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// The resource being paid for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceInfo>,

    /// Accepted payment options.
    pub accepts: Vec<PaymentRequirements>,

    /// Extension data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Extensions>,
}

/// A signed payment, sent by the client in the payment header.
///
/// ```json
/// {
///   "x402Version": 2,
///   "payload": { "authorization": {"...": "..."}, "signature": "0x..." },
///   "accepted": { "scheme": "exact", "network": "eip155:8453", "...": "..." }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    /// Protocol version.
    #[serde(default = "default_v2")]
    pub x402_version: u32,

    /// Scheme-specific signed data.
    pub payload: Value,

    /// The requirements this payment fulfils.
    pub accepted: PaymentRequirements,

    /// The resource being paid for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceInfo>,

    /// Extension data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Extensions>,
}

impl PaymentPayload {
    /// Returns the payment scheme from accepted requirements.
    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.accepted.scheme
    }

    /// Returns the network from accepted requirements.
    #[must_use]
    pub fn network(&self) -> &str {
        &self.accepted.network
    }
}

/// Body of `POST /verify`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    /// The payment payload to verify.
    pub payment_payload: PaymentPayload,

    /// The requirements to verify against.
    pub payment_requirements: PaymentRequirements,
}

/// Body of `POST /settle` and `POST /settlement-status`.
///
/// Same shape as [`VerifyRequest`], kept distinct so a verify request is never
/// settled by accident.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleRequest {
    /// The payment payload to settle.
    pub payment_payload: PaymentPayload,

    /// The requirements for settlement.
    pub payment_requirements: PaymentRequirements,
}

impl VerifyRequest {
    /// Returns the protocol version of the payload.
    #[must_use]
    pub const fn version(&self) -> u32 {
        self.payment_payload.x402_version
    }
}

impl SettleRequest {
    /// Returns the protocol version of the payload.
    #[must_use]
    pub const fn version(&self) -> u32 {
        self.payment_payload.x402_version
    }
}

impl From<VerifyRequest> for SettleRequest {
    fn from(request: VerifyRequest) -> Self {
        Self {
            payment_payload: request.payment_payload,
            payment_requirements: request.payment_requirements,
        }
    }
}

const fn default_v2() -> u32 {
    V2
}

fn default_empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}
