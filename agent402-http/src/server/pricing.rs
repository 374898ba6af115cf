//! Payment options for a protected route.
//!
//! [`PricingSource`] abstracts over options fixed at startup
//! ([`StaticPricing`]) and options computed per request from its headers and
//! URI ([`DynamicPricing`]), which is how a route charges different
//! recipients or amounts per caller.

use std::future::Future;
use std::sync::Arc;

use agent402::config::ResourceConfig;
use agent402::facilitator::BoxFuture;
use http::{HeaderMap, Uri};

/// Something that yields the accepted payment options for a request.
///
/// An empty list means the request is served without payment.
pub trait PricingSource: Send + Sync {
    /// The options accepted for this request.
    fn resolve<'a>(
        &'a self,
        headers: &'a HeaderMap,
        uri: &'a Uri,
    ) -> BoxFuture<'a, Vec<ResourceConfig>>;
}

/// The same options for every request.
#[derive(Clone, Debug)]
pub struct StaticPricing {
    options: Arc<[ResourceConfig]>,
}

impl StaticPricing {
    /// Serves `options` for every request.
    #[must_use]
    pub fn new(options: Vec<ResourceConfig>) -> Self {
        Self {
            options: options.into(),
        }
    }

    /// The configured options.
    #[must_use]
    pub fn options(&self) -> &[ResourceConfig] {
        &self.options
    }
}

impl PricingSource for StaticPricing {
    fn resolve<'a>(
        &'a self,
        _headers: &'a HeaderMap,
        _uri: &'a Uri,
    ) -> BoxFuture<'a, Vec<ResourceConfig>> {
        Box::pin(async move { self.options.to_vec() })
    }
}

type BoxedPricingCallback =
    dyn Fn(&HeaderMap, &Uri) -> BoxFuture<'static, Vec<ResourceConfig>> + Send + Sync;

/// Options computed per request by a callback.
///
/// ```rust
/// use agent402::config::ResourceConfig;
/// use agent402_http::server::DynamicPricing;
///
/// let pricing = DynamicPricing::new(|headers, _uri| {
///     let premium = headers.contains_key("x-premium");
///     async move {
///         let price = if premium { "$0.10" } else { "$0.01" };
///         vec![serde_json::from_value::<ResourceConfig>(serde_json::json!({
///             "scheme": "exact",
///             "payTo": "0x209693Bc6afc0C5328bA36FaF03C514EF312287C",
///             "price": price,
///             "network": "eip155:84532"
///         }))
///         .unwrap()]
///     }
/// });
/// # drop(pricing);
/// ```
#[derive(Clone)]
pub struct DynamicPricing {
    callback: Arc<BoxedPricingCallback>,
}

impl std::fmt::Debug for DynamicPricing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicPricing")
            .field("callback", &"<callback>")
            .finish()
    }
}

impl DynamicPricing {
    /// Wraps an async callback over the request headers and URI.
    pub fn new<F, Fut>(callback: F) -> Self
    where
        F: Fn(&HeaderMap, &Uri) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Vec<ResourceConfig>> + Send + 'static,
    {
        Self {
            callback: Arc::new(
                move |headers: &HeaderMap, uri: &Uri| -> BoxFuture<'static, Vec<ResourceConfig>> {
                    Box::pin(callback(headers, uri))
                },
            ),
        }
    }
}

impl PricingSource for DynamicPricing {
    fn resolve<'a>(
        &'a self,
        headers: &'a HeaderMap,
        uri: &'a Uri,
    ) -> BoxFuture<'a, Vec<ResourceConfig>> {
        (self.callback)(headers, uri)
    }
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;
    use serde_json::json;

    use super::*;

    fn option(pay_to: &str, price: &str) -> ResourceConfig {
        serde_json::from_value(json!({
            "scheme": "exact",
            "payTo": pay_to,
            "price": price,
            "network": "eip155:84532"
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_static_pricing_ignores_request() {
        let pricing = StaticPricing::new(vec![option("0xaa", "$0.01")]);
        let resolved = pricing.resolve(&HeaderMap::new(), &Uri::from_static("/a")).await;
        assert_eq!(resolved, pricing.options());
    }

    #[tokio::test]
    async fn test_dynamic_pricing_reads_headers_and_uri() {
        let pricing = DynamicPricing::new(|headers, uri| {
            let tenant = headers
                .get("x-tenant")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("0xdefault")
                .to_owned();
            let bulk = uri.query().is_some_and(|q| q.contains("bulk"));
            async move {
                let price = if bulk { "$1" } else { "$0.01" };
                vec![option(&tenant, price)]
            }
        });

        let mut headers = HeaderMap::new();
        headers.insert("x-tenant", HeaderValue::from_static("0xtenant"));
        let resolved = pricing
            .resolve(&headers, &Uri::from_static("/report?bulk=1"))
            .await;
        assert_eq!(resolved, vec![option("0xtenant", "$1")]);

        let resolved = pricing.resolve(&HeaderMap::new(), &Uri::from_static("/report")).await;
        assert_eq!(resolved, vec![option("0xdefault", "$0.01")]);
    }
}
