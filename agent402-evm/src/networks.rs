//! Known USDC deployments, used as the default asset for money prices.

use alloy_primitives::{Address, address};

use crate::chain::Eip155ChainReference;

/// Default EIP-712 domain name for USDC.
pub const DEFAULT_USDC_NAME: &str = "USD Coin";

/// Default EIP-712 domain version for USDC.
pub const DEFAULT_USDC_VERSION: &str = "2";

/// USDC decimals on every supported chain.
pub const USDC_DECIMALS: u32 = 6;

/// A USDC contract on one chain, with its EIP-712 domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsdcDeployment {
    /// Chain the contract is deployed on.
    pub chain: Eip155ChainReference,
    /// Token contract address.
    pub address: Address,
    /// EIP-712 domain name.
    pub name: &'static str,
    /// EIP-712 domain version.
    pub version: &'static str,
}

const fn usdc(chain: u64, address: Address) -> UsdcDeployment {
    UsdcDeployment {
        chain: Eip155ChainReference::new(chain),
        address,
        name: DEFAULT_USDC_NAME,
        version: DEFAULT_USDC_VERSION,
    }
}

/// Every deployment this crate knows about.
pub const USDC_DEPLOYMENTS: &[UsdcDeployment] = &[
    usdc(1, address!("A0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48")),
    usdc(8453, address!("833589fCD6eDb6E08f4c7C32D4f71b54bdA02913")),
    UsdcDeployment {
        chain: Eip155ChainReference::new(84532),
        address: address!("036CbD53842c5426634e7929541eC2318f3dCF7e"),
        name: "USDC",
        version: DEFAULT_USDC_VERSION,
    },
    usdc(137, address!("3c499c542cEF5E3811e1192ce70d8cC03d5c3359")),
    usdc(80002, address!("41E94Eb71Ef8C9fAE0235d1e472b21E21B5a4dbF")),
    usdc(43114, address!("B97EF9Ef8734C71904D8002F8b6Bc66Dd9c48a6E")),
    usdc(43113, address!("5425890298aed601595a70AB815c96711a31Bc65")),
    usdc(42220, address!("cebA9300f2b948710d2653dD7B07f33A8B32118C")),
];

/// The USDC deployment on `chain`, if known.
#[must_use]
pub fn usdc_deployment(chain: Eip155ChainReference) -> Option<&'static UsdcDeployment> {
    USDC_DEPLOYMENTS.iter().find(|d| d.chain == chain)
}

/// The deployment at `address` on `chain`, if it is a known USDC contract.
#[must_use]
pub fn usdc_by_address(
    chain: Eip155ChainReference,
    address: Address,
) -> Option<&'static UsdcDeployment> {
    usdc_deployment(chain).filter(|d| d.address == address)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        let base = usdc_deployment(Eip155ChainReference::new(8453)).unwrap();
        assert_eq!(base.name, "USD Coin");
        assert!(usdc_by_address(base.chain, base.address).is_some());
        assert!(usdc_by_address(base.chain, Address::ZERO).is_none());
        assert!(usdc_deployment(Eip155ChainReference::new(999_999)).is_none());
    }
}
