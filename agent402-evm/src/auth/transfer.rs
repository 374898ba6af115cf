use agent402::timestamp::UnixTimestamp;
use alloy_primitives::{Address, B256, U256};
use alloy_sol_types::{Eip712Domain, SolStruct, SolValue, eip712_domain, sol};

use super::AuthorizationCodec;

sol! {
    /// ERC-3009 typed data, field order fixed by the token contract.
    #[derive(Debug, PartialEq, Eq)]
    struct TransferWithAuthorization {
        address from;
        address to;
        uint256 value;
        uint256 validAfter;
        uint256 validBefore;
        bytes32 nonce;
    }
}

/// The EIP-712 domain of an ERC-3009 token.
#[must_use]
pub fn token_domain(name: String, version: String, chain_id: u64, token: Address) -> Eip712Domain {
    eip712_domain! {
        name: name,
        version: version,
        chain_id: chain_id,
        verifying_contract: token,
    }
}

/// A `transferWithAuthorization` grant bound to one token domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferAuthorization {
    /// Payer.
    pub from: Address,
    /// Recipient.
    pub to: Address,
    /// Amount in atomic token units.
    pub value: U256,
    /// Not valid before this second.
    pub valid_after: UnixTimestamp,
    /// Not valid from this second on.
    pub valid_before: UnixTimestamp,
    /// Single-use nonce chosen by the payer.
    pub nonce: B256,
    /// The token's EIP-712 domain.
    pub domain: Eip712Domain,
}

impl TransferAuthorization {
    fn typed(&self) -> TransferWithAuthorization {
        TransferWithAuthorization {
            from: self.from,
            to: self.to,
            value: self.value,
            validAfter: U256::from(self.valid_after.as_secs()),
            validBefore: U256::from(self.valid_before.as_secs()),
            nonce: self.nonce,
        }
    }
}

impl AuthorizationCodec for TransferAuthorization {
    fn message(&self) -> Vec<u8> {
        self.typed().abi_encode()
    }

    fn digest(&self) -> B256 {
        self.typed().eip712_signing_hash(&self.domain)
    }

    fn expected_signer(&self) -> Address {
        self.from
    }

    fn valid_after(&self) -> Option<UnixTimestamp> {
        Some(self.valid_after)
    }

    fn valid_before(&self) -> UnixTimestamp {
        self.valid_before
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::{Signature, address, keccak256};
    use alloy_signer::SignerSync;
    use alloy_signer_local::PrivateKeySigner;

    use super::*;
    use crate::auth::AuthorizationError;

    const NOW: u64 = 1_700_000_000;

    fn authorization(from: Address) -> TransferAuthorization {
        TransferAuthorization {
            from,
            to: address!("209693Bc6afc0C5328bA36FaF03C514EF312287C"),
            value: U256::from(10_000u64),
            valid_after: UnixTimestamp::from_secs(NOW - 600),
            valid_before: UnixTimestamp::from_secs(NOW + 300),
            nonce: B256::repeat_byte(7),
            domain: token_domain(
                "USD Coin".into(),
                "2".into(),
                8453,
                address!("833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"),
            ),
        }
    }

    #[test]
    fn test_message_is_six_words_in_order() {
        let auth = authorization(Address::repeat_byte(1));
        let message = auth.message();
        assert_eq!(message.len(), 6 * 32);
        assert_eq!(&message[12..32], auth.from.as_slice());
        assert_eq!(&message[44..64], auth.to.as_slice());
        assert_eq!(&message[160..192], auth.nonce.as_slice());
    }

    #[test]
    fn test_digest_is_typed_data_hash_of_message() {
        let auth = authorization(Address::repeat_byte(1));
        let struct_hash =
            keccak256([auth.typed().eip712_type_hash().as_slice(), &auth.message()].concat());
        let expected = keccak256(
            [
                &[0x19, 0x01][..],
                auth.domain.separator().as_slice(),
                struct_hash.as_slice(),
            ]
            .concat(),
        );
        assert_eq!(auth.digest(), expected);
    }

    #[test]
    fn test_sign_and_verify() {
        let signer = PrivateKeySigner::random();
        let auth = authorization(signer.address());
        let signature = signer.sign_hash_sync(&auth.digest()).unwrap();
        auth.verify(&signature, UnixTimestamp::from_secs(NOW)).unwrap();

        let other = PrivateKeySigner::random();
        let forged = other.sign_hash_sync(&auth.digest()).unwrap();
        assert!(matches!(
            auth.verify(&forged, UnixTimestamp::from_secs(NOW)),
            Err(AuthorizationError::SignerMismatch { .. })
        ));
    }

    #[test]
    fn test_window_checked_before_signature() {
        let auth = authorization(Address::repeat_byte(1));
        let garbage = Signature::from_raw(&[1u8; 65]).unwrap();
        assert!(matches!(
            auth.verify(&garbage, UnixTimestamp::from_secs(NOW + 300)),
            Err(AuthorizationError::Expired { .. })
        ));
        assert!(matches!(
            auth.verify(&garbage, UnixTimestamp::from_secs(NOW - 601)),
            Err(AuthorizationError::NotYetValid { .. })
        ));
        // validAfter == now is usable
        assert!(auth.check_window(UnixTimestamp::from_secs(NOW - 600)).is_ok());
    }
}
