//! Header encoding and decoding for payment messages.
//!
//! Every payment header is standard-alphabet base64 of a JSON document:
//! `PAYMENT-REQUIRED` carries a [`PaymentRequired`], `PAYMENT-SIGNATURE` (or
//! legacy `X-PAYMENT`) a [`PaymentPayload`], and `PAYMENT-RESPONSE` (or legacy
//! `X-PAYMENT-RESPONSE`) a [`SettleResponse`].

use agent402::encoding::Base64Bytes;
use agent402::proto::{PaymentPayload, PaymentRequired, SettleResponse};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::HttpError;

fn encode<T: Serialize>(value: &T) -> Result<String, HttpError> {
    Ok(Base64Bytes::encode_json(value)?.to_string())
}

fn decode<T: DeserializeOwned>(header_value: &[u8]) -> Result<T, HttpError> {
    Ok(Base64Bytes::from(header_value).decode_json()?)
}

/// Encodes a challenge for the `PAYMENT-REQUIRED` header.
///
/// # Errors
///
/// Returns [`HttpError::Json`] if serialization fails.
pub fn encode_payment_required(required: &PaymentRequired) -> Result<String, HttpError> {
    encode(required)
}

/// Decodes a `PAYMENT-REQUIRED` header value.
///
/// # Errors
///
/// Returns [`HttpError`] on base64 or JSON failure.
pub fn decode_payment_required(
    header_value: impl AsRef<[u8]>,
) -> Result<PaymentRequired, HttpError> {
    decode(header_value.as_ref())
}

/// Encodes a signed payload for the `PAYMENT-SIGNATURE` header.
///
/// # Errors
///
/// Returns [`HttpError::Json`] if serialization fails.
pub fn encode_payment_payload(payload: &PaymentPayload) -> Result<String, HttpError> {
    encode(payload)
}

/// Decodes a `PAYMENT-SIGNATURE` or `X-PAYMENT` header value.
///
/// # Errors
///
/// Returns [`HttpError`] on base64 or JSON failure.
pub fn decode_payment_payload(header_value: impl AsRef<[u8]>) -> Result<PaymentPayload, HttpError> {
    decode(header_value.as_ref())
}

/// Encodes a settlement receipt for the `PAYMENT-RESPONSE` header.
///
/// # Errors
///
/// Returns [`HttpError::Json`] if serialization fails.
pub fn encode_settle_response(response: &SettleResponse) -> Result<String, HttpError> {
    encode(response)
}

/// Decodes a `PAYMENT-RESPONSE` or `X-PAYMENT-RESPONSE` header value.
///
/// # Errors
///
/// Returns [`HttpError`] on base64 or JSON failure.
pub fn decode_settle_response(header_value: impl AsRef<[u8]>) -> Result<SettleResponse, HttpError> {
    decode(header_value.as_ref())
}

#[cfg(test)]
mod tests {
    use agent402::proto::{PaymentRequirements, ResourceInfo, v2};
    use serde_json::json;

    use super::*;

    fn requirements() -> PaymentRequirements {
        PaymentRequirements {
            scheme: "exact".into(),
            network: "eip155:84532".into(),
            asset: "0x036CbD53842c5426634e7929541eC2318f3dCF7e".into(),
            amount: "10000".into(),
            pay_to: "0x209693Bc6afc0C5328bA36FaF03C514EF312287C".into(),
            max_timeout_seconds: 300,
            extra: json!({"name": "USDC", "version": "2"}),
        }
    }

    #[test]
    fn test_payment_required_header() {
        let required = PaymentRequired {
            x402_version: v2::V2,
            error: Some("Payment required".into()),
            resource: Some(ResourceInfo {
                url: "https://api.example.com/weather".into(),
                description: Some("Weather".into()),
                mime_type: None,
            }),
            accepts: vec![requirements()],
            extensions: None,
        };
        let header = encode_payment_required(&required).unwrap();
        assert!(!header.contains('{'));
        assert_eq!(decode_payment_required(&header).unwrap(), required);
    }

    fn extensions() -> agent402::proto::Extensions {
        [(
            "bazaar".to_owned(),
            json!({"zeta": [3, {"y": null, "b": true}], "alpha": {"nested": {"z": 1, "a": "x"}}}),
        )]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_payload_roundtrip_is_exact() {
        let mut accepted = requirements();
        accepted.extra = json!({
            "version": "2",
            "name": "USDC",
            "domain": {"z": 0, "chainId": 84532}
        });
        let payload = PaymentPayload {
            x402_version: v2::V2,
            payload: json!({
                "signature": "0xabc",
                "authorization": {
                    "validBefore": "17",
                    "from": "0x01",
                    "value": "10000",
                    "nonce": "0x02",
                    "validAfter": "0",
                    "to": "0x03"
                },
                "meta": [{"z": [1, 2, {"b": "c"}]}, "tail"]
            }),
            accepted,
            resource: Some(ResourceInfo {
                url: "https://api.example.com/weather?city=paris".into(),
                description: Some("Weather".into()),
                mime_type: Some("application/json".into()),
            }),
            extensions: Some(extensions()),
        };
        let decoded = decode_payment_payload(encode_payment_payload(&payload).unwrap()).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_payment_required_roundtrip_with_extensions() {
        let mut second = requirements();
        second.network = "eip155:8453".into();
        second.extra = json!({"b": {"d": [1, {"f": "g"}], "c": 2}, "a": null});
        let required = PaymentRequired {
            x402_version: v2::V2,
            error: Some("No matching payment requirements".into()),
            resource: Some(ResourceInfo {
                url: "https://api.example.com/report".into(),
                description: None,
                mime_type: Some("text/csv".into()),
            }),
            accepts: vec![requirements(), second],
            extensions: Some(extensions()),
        };
        let decoded = decode_payment_required(encode_payment_required(&required).unwrap()).unwrap();
        assert_eq!(decoded, required);
    }

    #[test]
    fn test_settle_error_roundtrip() {
        let response = SettleResponse::Error {
            reason: "nonce_already_used".into(),
            message: Some("authorization already settled".into()),
            payer: Some("0xpayer".into()),
            network: "eip155:84532".into(),
        };
        let decoded = decode_settle_response(encode_settle_response(&response).unwrap()).unwrap();
        assert_eq!(decoded, response);

        let success = SettleResponse::Success {
            payer: "0xpayer".into(),
            transaction: "0xhash".into(),
            network: "eip155:84532".into(),
            extensions: Some(extensions()),
        };
        let decoded = decode_settle_response(encode_settle_response(&success).unwrap()).unwrap();
        assert_eq!(decoded, success);
    }

    #[test]
    fn test_settle_response_wire_names() {
        let response = SettleResponse::Success {
            payer: "0xpayer".into(),
            transaction: "0xhash".into(),
            network: "eip155:84532".into(),
            extensions: None,
        };
        let header = encode_settle_response(&response).unwrap();
        let raw: serde_json::Value = Base64Bytes::from(header.as_str()).decode_json().unwrap();
        assert_eq!(raw["success"], true);
        assert_eq!(raw["transaction"], "0xhash");
        assert_eq!(decode_settle_response(header.as_bytes()).unwrap(), response);
    }

    #[test]
    fn test_malformed_headers() {
        assert!(matches!(decode_payment_payload("not base64!"), Err(HttpError::Base64(_))));
        let not_json = Base64Bytes::encode("plain text").to_string();
        assert!(matches!(decode_payment_required(not_json), Err(HttpError::Json(_))));
    }
}
