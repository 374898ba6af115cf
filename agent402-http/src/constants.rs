//! Header names used by the payment exchange.

/// Signed payment payload (client to server).
pub const PAYMENT_SIGNATURE_HEADER: &str = "PAYMENT-SIGNATURE";

/// Payment challenge attached to a `402` (server to client).
pub const PAYMENT_REQUIRED_HEADER: &str = "PAYMENT-REQUIRED";

/// Settlement receipt (server to client).
pub const PAYMENT_RESPONSE_HEADER: &str = "PAYMENT-RESPONSE";

/// Legacy payment payload header, also accepted by the gateway.
pub const X_PAYMENT_HEADER: &str = "X-PAYMENT";

/// Legacy receipt header, written when the request used [`X_PAYMENT_HEADER`].
pub const X_PAYMENT_RESPONSE_HEADER: &str = "X-PAYMENT-RESPONSE";

/// CORS header listing the payment headers browsers may read.
pub const ACCESS_CONTROL_EXPOSE_HEADERS: &str = "Access-Control-Expose-Headers";

/// Value of [`ACCESS_CONTROL_EXPOSE_HEADERS`] on gateway responses.
pub const EXPOSED_PAYMENT_HEADERS: &str = "PAYMENT-REQUIRED, PAYMENT-RESPONSE, X-PAYMENT-RESPONSE";
