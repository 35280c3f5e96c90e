//! Claim-hash assembly for the three compact shapes.
//!
//! The claim hash is the EIP-712 struct hash the on-chain verifier computes
//! for a compact; the digest wraps it in the `0x1901` envelope under the
//! protocol domain of the notarization chain. Witness type strings splice
//! into the type string as a trailing `Mandate` member, which is why the
//! type hashes here are composed at runtime instead of precomputed.

use alloy_primitives::{Address, B256, U256, address, keccak256};
use alloy_sol_types::eip712_domain;
use once_cell::sync::Lazy;

use crate::codec::{AbiWords, encode_packed, type_hash};
use crate::types::{CompactVariant, ValidatedCommitment, ValidatedCompact, ValidatedElement};

/// EIP-712 domain name, fixed by the protocol.
pub const DOMAIN_NAME: &str = "The Compact";
/// EIP-712 domain version, fixed by the protocol.
pub const DOMAIN_VERSION: &str = "1";
/// The protocol's verifying contract, identical on every chain.
pub const VERIFYING_CONTRACT: Address = address!("0x00000000000000171ede64904551eeDF3C6C9788");

const LOCK_TYPESTRING: &str = "Lock(bytes12 lockTag,address token,uint256 amount)";

const COMPACT_TYPESTRING: &str =
    "Compact(address arbiter,address sponsor,uint256 nonce,uint256 expires,uint256 id,uint256 amount)";

const BATCH_MEMBERS: &str =
    "BatchCompact(address arbiter,address sponsor,uint256 nonce,uint256 expires,Lock[] commitments";

const ELEMENT_MEMBERS: &str = "Element(address arbiter,uint256 chainId,Lock[] commitments";

const MULTICHAIN_MEMBERS: &str =
    "MultichainCompact(address sponsor,uint256 nonce,uint256 expires,Element[] elements)";

static LOCK_TYPEHASH: Lazy<B256> = Lazy::new(|| type_hash(LOCK_TYPESTRING));

/// Failures while canonicalizing a batch of lock commitments.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BatchError {
    /// Two commitments resolve to the same lock id; a valid batch has a
    /// unique `(lockTag, token)` per entry.
    #[error("duplicate lock in batch: 0x{0:064x}")]
    DuplicateLock(U256),
    /// A multichain element arrived without its mandate hash.
    #[error("multichain element {0} is missing its witness hash")]
    MissingMandate(usize),
}

/// Computes the claim hash of a validated compact, dispatching on shape.
pub fn claim_hash(compact: &ValidatedCompact) -> Result<B256, BatchError> {
    match compact.variant {
        CompactVariant::Single => Ok(claim_hash_single(compact)),
        CompactVariant::Batch => claim_hash_batch(compact),
        CompactVariant::Multichain => claim_hash_multichain(compact),
    }
}

/// `Compact(address arbiter,address sponsor,uint256 nonce,uint256 expires,uint256 id,uint256 amount[,Mandate mandate])`
fn claim_hash_single(compact: &ValidatedCompact) -> B256 {
    let element = &compact.elements[0];
    let commitment = &element.commitments[0];
    let witness = witness_pair(compact);

    let type_string = match witness {
        None => COMPACT_TYPESTRING.to_string(),
        Some((witness_type, _)) => format!(
            "{},Mandate mandate)Mandate({witness_type})",
            &COMPACT_TYPESTRING[..COMPACT_TYPESTRING.len() - 1]
        ),
    };

    let mut words = AbiWords::with_capacity(8)
        .push_b256(type_hash(&type_string))
        .push_address(element.arbiter)
        .push_address(compact.sponsor)
        .push_uint(compact.nonce)
        .push_uint(compact.expires)
        .push_uint(commitment.lock_id())
        .push_uint(commitment.amount);
    if let Some((_, witness_hash)) = witness {
        words = words.push_b256(witness_hash);
    }
    words.hash()
}

/// `BatchCompact(…,Lock[] commitments[,Mandate mandate])Lock(…)[Mandate(…)]`
fn claim_hash_batch(compact: &ValidatedCompact) -> Result<B256, BatchError> {
    let element = &compact.elements[0];
    let commitments = commitments_hash(&element.commitments)?;
    let witness = witness_pair(compact);

    let type_string = match witness {
        None => format!("{BATCH_MEMBERS}){LOCK_TYPESTRING}"),
        Some((witness_type, _)) => {
            format!("{BATCH_MEMBERS},Mandate mandate){LOCK_TYPESTRING}Mandate({witness_type})")
        }
    };

    let mut words = AbiWords::with_capacity(7)
        .push_b256(type_hash(&type_string))
        .push_address(element.arbiter)
        .push_address(compact.sponsor)
        .push_uint(compact.nonce)
        .push_uint(compact.expires)
        .push_b256(commitments);
    if let Some((_, witness_hash)) = witness {
        words = words.push_b256(witness_hash);
    }
    Ok(words.hash())
}

/// `MultichainCompact(address sponsor,uint256 nonce,uint256 expires,Element[] elements)Element(…)Lock(…)Mandate(…)`
///
/// Element order is preserved as given; each element carries a distinct
/// mandate hash, so reordering produces a different compact.
fn claim_hash_multichain(compact: &ValidatedCompact) -> Result<B256, BatchError> {
    let witness_type = compact.witness_type_string.as_deref().unwrap_or_default();
    let element_type_string =
        format!("{ELEMENT_MEMBERS},Mandate mandate){LOCK_TYPESTRING}Mandate({witness_type})");
    let element_type_hash = type_hash(&element_type_string);

    let mut element_hashes = Vec::with_capacity(compact.elements.len() * 32);
    for (index, element) in compact.elements.iter().enumerate() {
        let hash = element_hash(element, element_type_hash, index)?;
        element_hashes.extend_from_slice(hash.as_slice());
    }
    let elements_hash = keccak256(&element_hashes);

    let root_type_string = format!(
        "{MULTICHAIN_MEMBERS}{ELEMENT_MEMBERS},Mandate mandate){LOCK_TYPESTRING}Mandate({witness_type})"
    );

    Ok(AbiWords::with_capacity(5)
        .push_b256(type_hash(&root_type_string))
        .push_address(compact.sponsor)
        .push_uint(compact.nonce)
        .push_uint(compact.expires)
        .push_b256(elements_hash)
        .hash())
}

fn element_hash(
    element: &ValidatedElement,
    element_type_hash: B256,
    index: usize,
) -> Result<B256, BatchError> {
    let mandate_hash = element
        .mandate_hash
        .ok_or(BatchError::MissingMandate(index))?;
    let commitments = commitments_hash(&element.commitments)?;
    Ok(AbiWords::with_capacity(5)
        .push_b256(element_type_hash)
        .push_address(element.arbiter)
        .push_uint(U256::from(element.chain_id))
        .push_b256(commitments)
        .push_b256(mandate_hash)
        .hash())
}

/// Canonicalizes a commitment list (ascending lock id) and hashes it as a
/// `Lock[]` value: keccak over the concatenated per-lock struct hashes.
pub fn commitments_hash(commitments: &[ValidatedCommitment]) -> Result<B256, BatchError> {
    let mut sorted: Vec<&ValidatedCommitment> = commitments.iter().collect();
    sorted.sort_by_key(|c| c.lock_id());
    for pair in sorted.windows(2) {
        if pair[0].lock_id() == pair[1].lock_id() {
            return Err(BatchError::DuplicateLock(pair[0].lock_id()));
        }
    }

    let mut hashes = Vec::with_capacity(sorted.len() * 32);
    for commitment in sorted {
        let hash = AbiWords::with_capacity(4)
            .push_b256(*LOCK_TYPEHASH)
            .push_bytes12(commitment.lock_tag.0)
            .push_address(commitment.token)
            .push_uint(commitment.amount)
            .hash();
        hashes.extend_from_slice(hash.as_slice());
    }
    Ok(keccak256(&hashes))
}

/// Domain separator of the notarization chain.
pub fn domain_separator(chain_id: u64) -> B256 {
    let domain = eip712_domain! {
        name: DOMAIN_NAME,
        version: DOMAIN_VERSION,
        chain_id: chain_id,
        verifying_contract: VERIFYING_CONTRACT,
    };
    domain.hash_struct()
}

/// `keccak256(0x1901 ‖ domainSeparator(chainId) ‖ claimHash)`
pub fn digest(chain_id: u64, claim_hash: B256) -> B256 {
    let separator = domain_separator(chain_id);
    keccak256(encode_packed(&[
        &[0x19, 0x01],
        separator.as_slice(),
        claim_hash.as_slice(),
    ]))
}

fn witness_pair(compact: &ValidatedCompact) -> Option<(&str, B256)> {
    match (&compact.witness_type_string, compact.witness_hash) {
        (Some(witness_type), Some(witness_hash)) => Some((witness_type.as_str(), witness_hash)),
        _ => None,
    }
}
