//! Sponsor authorization for submitted compacts.
//!
//! A submission is authorized either by a sponsor signature over the compact
//! digest (65-byte `r‖s‖v` or 64-byte EIP-2098, both accepted and
//! normalized before recovery) or by a compact the sponsor registered
//! directly on-chain, which lets smart-contract-wallet sponsors skip
//! off-chain signing entirely.

use alloy_primitives::{Address, B256, Bytes, Signature};
use tracing::instrument;

use crate::codec::EncodingError;
use crate::indexer::{Indexer, IndexerError};
use crate::types::ValidatedCompact;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid sponsor authorization: {0}")]
    InvalidSponsor(String),
    #[error(transparent)]
    Indexer(#[from] IndexerError),
}

impl From<EncodingError> for AuthError {
    fn from(error: EncodingError) -> Self {
        AuthError::InvalidSponsor(error.to_string())
    }
}

/// How a submission proved its sponsor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SponsorAuthorization {
    Signature,
    OnchainRegistration,
}

/// Normalizes a raw sponsor signature into `(r, s, yParity)` form.
pub fn parse_signature(raw: &[u8]) -> Result<Signature, AuthError> {
    match raw.len() {
        65 => Signature::from_raw(raw)
            .map_err(|e| AuthError::InvalidSponsor(format!("malformed 65-byte signature: {e}"))),
        64 => Ok(Signature::from_erc2098(raw)),
        n => Err(EncodingError::Width {
            what: "sponsor signature",
            expected: 64,
            actual: n,
        }
        .into()),
    }
}

/// Recovers the signing address of a raw signature over a digest.
pub fn recover_signer(digest: B256, raw: &[u8]) -> Result<Address, AuthError> {
    let signature = parse_signature(raw)?;
    signature
        .recover_address_from_prehash(&digest)
        .map_err(|e| AuthError::InvalidSponsor(format!("signature recovery failed: {e}")))
}

/// Authorizes a submission, preferring the signature path and falling back
/// to an on-chain registration when no signature was provided.
#[instrument(skip_all, err, fields(sponsor = %compact.sponsor))]
pub async fn authorize<I: Indexer>(
    indexer: &I,
    allocator: Address,
    compact: &ValidatedCompact,
    claim_hash: B256,
    digest: B256,
    sponsor_signature: Option<&Bytes>,
) -> Result<SponsorAuthorization, AuthError> {
    match sponsor_signature {
        Some(raw) if !raw.is_empty() => {
            let recovered = recover_signer(digest, raw)?;
            if recovered != compact.sponsor {
                return Err(AuthError::InvalidSponsor(format!(
                    "signature recovers {recovered}, expected {}",
                    compact.sponsor
                )));
            }
            Ok(SponsorAuthorization::Signature)
        }
        _ => {
            let registered = indexer
                .registered_compact(allocator, compact.sponsor, claim_hash, compact.chain_id)
                .await?
                .ok_or_else(|| {
                    AuthError::InvalidSponsor(
                        "no sponsor signature and no on-chain registration".to_string(),
                    )
                })?;
            if registered.sponsor != compact.sponsor {
                return Err(AuthError::InvalidSponsor(format!(
                    "on-chain registration names sponsor {}, expected {}",
                    registered.sponsor, compact.sponsor
                )));
            }
            if registered.expires < compact.expires {
                return Err(AuthError::InvalidSponsor(format!(
                    "on-chain registration expires at {} before the compact at {}",
                    registered.expires, compact.expires
                )));
            }
            Ok(SponsorAuthorization::OnchainRegistration)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::RegisteredCompact;
    use crate::indexer::testing::MockIndexer;
    use crate::signer::erc2098;
    use crate::types::{CompactVariant, LockTag, ValidatedCommitment, ValidatedElement};
    use alloy_primitives::{FixedBytes, U256, address, keccak256};
    use alloy_signer::SignerSync;
    use alloy_signer_local::PrivateKeySigner;
    use std::str::FromStr;

    const SPONSOR_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const SPONSOR: Address = address!("0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266");
    const ALLOCATOR: Address = address!("0x70997970C51812dc3A010C7d01b50e0d17dc79C8");

    fn sponsor_signer() -> PrivateKeySigner {
        PrivateKeySigner::from_str(SPONSOR_KEY).unwrap()
    }

    fn sign_65(digest: B256) -> Vec<u8> {
        let signature = sponsor_signer().sign_hash_sync(&digest).unwrap();
        let mut raw = Vec::with_capacity(65);
        raw.extend_from_slice(&signature.r().to_be_bytes::<32>());
        raw.extend_from_slice(&signature.s().to_be_bytes::<32>());
        raw.push(if signature.v() { 28 } else { 27 });
        raw
    }

    fn sign_64(digest: B256) -> Vec<u8> {
        let signature = sponsor_signer().sign_hash_sync(&digest).unwrap();
        erc2098(&signature).to_vec()
    }

    fn compact(expires: u64) -> ValidatedCompact {
        ValidatedCompact {
            variant: CompactVariant::Single,
            chain_id: 10,
            sponsor: SPONSOR,
            nonce: U256::ONE,
            expires: U256::from(expires),
            witness_type_string: None,
            witness_hash: None,
            elements: vec![ValidatedElement {
                arbiter: ALLOCATOR,
                chain_id: 10,
                commitments: vec![ValidatedCommitment {
                    lock_tag: LockTag(FixedBytes::ZERO),
                    token: Address::ZERO,
                    amount: U256::ONE,
                }],
                mandate_hash: None,
            }],
        }
    }

    #[test]
    fn both_signature_widths_recover_the_sponsor() {
        let digest = keccak256(b"compact digest");
        assert_eq!(recover_signer(digest, &sign_65(digest)).unwrap(), SPONSOR);
        assert_eq!(recover_signer(digest, &sign_64(digest)).unwrap(), SPONSOR);
    }

    #[test]
    fn zero_one_recovery_bytes_are_accepted() {
        let digest = keccak256(b"another digest");
        let mut raw = sign_65(digest);
        raw[64] -= 27;
        assert_eq!(recover_signer(digest, &raw).unwrap(), SPONSOR);
    }

    #[test]
    fn odd_widths_are_rejected() {
        let digest = keccak256(b"digest");
        for width in [0usize, 63, 66, 130] {
            let raw = vec![0u8; width];
            assert!(matches!(
                recover_signer(digest, &raw),
                Err(AuthError::InvalidSponsor(_))
            ));
        }
    }

    #[test]
    fn garbage_recovery_byte_is_rejected() {
        let digest = keccak256(b"digest");
        let mut raw = sign_65(digest);
        raw[64] = 9;
        assert!(matches!(
            recover_signer(digest, &raw),
            Err(AuthError::InvalidSponsor(_))
        ));
    }

    #[tokio::test]
    async fn signature_path_authorizes_the_sponsor() {
        let indexer = MockIndexer::new();
        let compact = compact(1_700_000_600);
        let digest = keccak256(b"digest");
        let signature = Bytes::from(sign_64(digest));
        let outcome = authorize(
            &indexer,
            ALLOCATOR,
            &compact,
            B256::ZERO,
            digest,
            Some(&signature),
        )
        .await
        .unwrap();
        assert_eq!(outcome, SponsorAuthorization::Signature);
    }

    #[tokio::test]
    async fn foreign_signature_is_rejected() {
        let indexer = MockIndexer::new();
        let mut compact = compact(1_700_000_600);
        compact.sponsor = ALLOCATOR;
        let digest = keccak256(b"digest");
        let signature = Bytes::from(sign_64(digest));
        let result = authorize(
            &indexer,
            ALLOCATOR,
            &compact,
            B256::ZERO,
            digest,
            Some(&signature),
        )
        .await;
        assert!(matches!(result, Err(AuthError::InvalidSponsor(_))));
    }

    #[tokio::test]
    async fn registration_path_requires_a_covering_expiry() {
        let indexer = MockIndexer::new();
        let first_compact = compact(1_700_000_600);
        let claim_hash = B256::repeat_byte(5);
        indexer.register_compact(
            SPONSOR,
            10,
            claim_hash,
            RegisteredCompact {
                sponsor: SPONSOR,
                expires: U256::from(1_700_000_600u64),
                typehash: B256::ZERO,
                claim: None,
            },
        );

        let outcome = authorize(&indexer, ALLOCATOR, &first_compact, claim_hash, B256::ZERO, None)
            .await
            .unwrap();
        assert_eq!(outcome, SponsorAuthorization::OnchainRegistration);

        let outlives_registration = compact(1_700_099_999);
        let result = authorize(
            &indexer,
            ALLOCATOR,
            &outlives_registration,
            claim_hash,
            B256::ZERO,
            None,
        )
        .await;
        assert!(matches!(result, Err(AuthError::InvalidSponsor(_))));
    }

    #[tokio::test]
    async fn missing_signature_and_registration_is_rejected() {
        let indexer = MockIndexer::new();
        let compact = compact(1_700_000_600);
        let result = authorize(&indexer, ALLOCATOR, &compact, B256::ZERO, B256::ZERO, None).await;
        assert!(matches!(result, Err(AuthError::InvalidSponsor(_))));

        let empty = Bytes::new();
        let result = authorize(
            &indexer,
            ALLOCATOR,
            &compact,
            B256::ZERO,
            B256::ZERO,
            Some(&empty),
        )
        .await;
        assert!(matches!(result, Err(AuthError::InvalidSponsor(_))));
    }
}
