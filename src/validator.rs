//! Structural validation of submitted compacts.
//!
//! Checks run cheapest-first and stop at the first failure; a failed
//! validation has no side effects. Address, hash, and lock-tag widths are
//! enforced during JSON deserialization by the typed wire format
//! ([`crate::types`]); everything else is enforced here, producing the
//! normalized [`ValidatedCompact`] the hash builders and engines consume.

use alloy_primitives::U256;

use crate::types::{
    BatchCompactPayload, CompactPayload, CompactVariant, LockTag, MultichainCompactPayload,
    SingleCompactPayload, UnixTimestamp, ValidatedCommitment, ValidatedCompact, ValidatedElement,
};

/// Maximum look-ahead for a compact's expiration, in seconds.
pub const EXPIRATION_WINDOW_SECS: u64 = 7200;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid chain id {0:?}: expected a positive decimal integer")]
    InvalidChainId(String),
    #[error("nonce is required; request one from /suggested-nonce")]
    MissingNonce,
    #[error("compact has no elements")]
    NoElements,
    #[error("element {0} has no commitments")]
    NoCommitments(usize),
    #[error("commitment {index} of element {element} has a zero amount")]
    ZeroAmount { element: usize, index: usize },
    #[error("witness type string and witness hash must both be present or both absent")]
    WitnessPairMismatch,
    #[error("multichain compact requires a witness type string")]
    MissingWitnessTypeString,
    #[error("multichain element {0} requires a witness hash")]
    MissingElementWitness(usize),
    #[error("compact expired: expires {expires} is not after now {now}")]
    Expired { expires: U256, now: u64 },
    #[error("expires {expires} exceeds the {EXPIRATION_WINDOW_SECS}s look-ahead window")]
    ExpiresTooFar { expires: U256 },
    #[error("No elements found for chain {0}")]
    NoElementForChain(u64),
}

/// Parses a chain id the way it travels on the wire: a positive decimal
/// integer that round-trips through its string form.
pub fn parse_chain_id(raw: &str) -> Result<u64, ValidationError> {
    let parsed: u64 = raw
        .parse()
        .map_err(|_| ValidationError::InvalidChainId(raw.to_string()))?;
    if parsed == 0 || parsed.to_string() != raw {
        return Err(ValidationError::InvalidChainId(raw.to_string()));
    }
    Ok(parsed)
}

/// Validates a submitted compact against the notarization chain and clock,
/// returning its normalized form.
pub fn validate(
    chain_id: &str,
    payload: &CompactPayload,
    now: UnixTimestamp,
) -> Result<ValidatedCompact, ValidationError> {
    let chain_id = parse_chain_id(chain_id)?;
    let nonce = payload.nonce().ok_or(ValidationError::MissingNonce)?;

    let compact = match payload {
        CompactPayload::Single(single) => validate_single(chain_id, nonce, single)?,
        CompactPayload::Batch(batch) => validate_batch(chain_id, nonce, batch)?,
        CompactPayload::Multichain(multichain) => {
            validate_multichain(chain_id, nonce, multichain)?
        }
    };

    check_expiration(compact.expires, now)?;
    if !compact.elements.iter().any(|e| e.chain_id == chain_id) {
        return Err(ValidationError::NoElementForChain(chain_id));
    }
    Ok(compact)
}

fn validate_single(
    chain_id: u64,
    nonce: U256,
    single: &SingleCompactPayload,
) -> Result<ValidatedCompact, ValidationError> {
    check_witness_pair(&single.witness_type_string, single.witness_hash.is_some())?;
    let amount = single.amount.0;
    if amount.is_zero() {
        return Err(ValidationError::ZeroAmount {
            element: 0,
            index: 0,
        });
    }
    let (lock_tag, token) = LockTag::split_lock_id(single.id.into());
    Ok(ValidatedCompact {
        variant: CompactVariant::Single,
        chain_id,
        sponsor: single.sponsor.into(),
        nonce,
        expires: single.expires.into(),
        witness_type_string: single.witness_type_string.clone(),
        witness_hash: single.witness_hash,
        elements: vec![ValidatedElement {
            arbiter: single.arbiter.into(),
            chain_id,
            commitments: vec![ValidatedCommitment {
                lock_tag,
                token,
                amount,
            }],
            mandate_hash: None,
        }],
    })
}

fn validate_batch(
    chain_id: u64,
    nonce: U256,
    batch: &BatchCompactPayload,
) -> Result<ValidatedCompact, ValidationError> {
    check_witness_pair(&batch.witness_type_string, batch.witness_hash.is_some())?;
    if batch.commitments.is_empty() {
        return Err(ValidationError::NoCommitments(0));
    }
    let commitments = collect_commitments(0, &batch.commitments)?;
    Ok(ValidatedCompact {
        variant: CompactVariant::Batch,
        chain_id,
        sponsor: batch.sponsor.into(),
        nonce,
        expires: batch.expires.into(),
        witness_type_string: batch.witness_type_string.clone(),
        witness_hash: batch.witness_hash,
        elements: vec![ValidatedElement {
            arbiter: batch.arbiter.into(),
            chain_id,
            commitments,
            mandate_hash: None,
        }],
    })
}

fn validate_multichain(
    chain_id: u64,
    nonce: U256,
    multichain: &MultichainCompactPayload,
) -> Result<ValidatedCompact, ValidationError> {
    let witness_type_string = multichain
        .witness_type_string
        .clone()
        .ok_or(ValidationError::MissingWitnessTypeString)?;
    if multichain.elements.is_empty() {
        return Err(ValidationError::NoElements);
    }

    let mut elements = Vec::with_capacity(multichain.elements.len());
    for (index, element) in multichain.elements.iter().enumerate() {
        let element_chain = parse_chain_id(&element.chain_id)?;
        if element.commitments.is_empty() {
            return Err(ValidationError::NoCommitments(index));
        }
        let mandate_hash = element
            .witness_hash
            .ok_or(ValidationError::MissingElementWitness(index))?;
        elements.push(ValidatedElement {
            arbiter: element.arbiter.into(),
            chain_id: element_chain,
            commitments: collect_commitments(index, &element.commitments)?,
            mandate_hash: Some(mandate_hash),
        });
    }

    Ok(ValidatedCompact {
        variant: CompactVariant::Multichain,
        chain_id,
        sponsor: multichain.sponsor.into(),
        nonce,
        expires: multichain.expires.into(),
        witness_type_string: Some(witness_type_string),
        witness_hash: None,
        elements,
    })
}

fn collect_commitments(
    element: usize,
    commitments: &[crate::types::CommitmentPayload],
) -> Result<Vec<ValidatedCommitment>, ValidationError> {
    commitments
        .iter()
        .enumerate()
        .map(|(index, c)| {
            let amount = c.amount.0;
            if amount.is_zero() {
                return Err(ValidationError::ZeroAmount { element, index });
            }
            Ok(ValidatedCommitment {
                lock_tag: c.lock_tag,
                token: c.token.into(),
                amount,
            })
        })
        .collect()
}

fn check_witness_pair(
    witness_type_string: &Option<String>,
    witness_hash_present: bool,
) -> Result<(), ValidationError> {
    if witness_type_string.is_some() != witness_hash_present {
        return Err(ValidationError::WitnessPairMismatch);
    }
    Ok(())
}

fn check_expiration(expires: U256, now: UnixTimestamp) -> Result<(), ValidationError> {
    if expires <= now.as_u256() {
        return Err(ValidationError::Expired {
            expires,
            now: now.0,
        });
    }
    if expires > U256::from(now.0 + EXPIRATION_WINDOW_SECS) {
        return Err(ValidationError::ExpiresTooFar { expires });
    }
    Ok(())
}
