//! Durable storage of compacts and consumed nonces.
//!
//! The [`Store`] trait is the persistence seam: it captures the transactional
//! contract the allocation engine relies on without naming a driver. The
//! in-memory implementation backs the binary and the test suite; a database
//! driver implements the same trait behind the same semantics.
//!
//! Ownership is a parent → child tree: a compact owns its elements, an
//! element owns its commitments, and removal cascades by construction.
//! Consumed nonces are independent rows that live forever.

use alloy_primitives::{Address, B256, Bytes, U256};
use async_trait::async_trait;
use std::collections::HashSet;
use tokio::sync::RwLock;

use crate::types::LockTag;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("compact already stored for chain {chain_id} and claim hash {claim_hash}")]
    Duplicate { chain_id: u64, claim_hash: B256 },
    #[error("nonce already consumed")]
    DuplicateNonce,
    #[error("store backend failure: {0}")]
    Backend(String),
}

/// A compact row together with its element/commitment children.
#[derive(Debug, Clone)]
pub struct StoredCompact {
    /// Surrogate id, monotonically increasing in creation order.
    pub id: u64,
    /// Shape tag: 0 single, 1 batch, 2 multichain.
    pub variant: u8,
    /// Notarization chain.
    pub chain_id: u64,
    pub claim_hash: B256,
    pub sponsor: Address,
    pub nonce: U256,
    pub expires: U256,
    /// Allocator co-signature, EIP-2098.
    pub signature: Bytes,
    pub sponsor_signature: Option<Bytes>,
    pub witness_type_string: Option<String>,
    pub witness_hash: Option<B256>,
    pub elements: Vec<StoredElement>,
    pub created_at: u64,
}

#[derive(Debug, Clone)]
pub struct StoredElement {
    pub element_index: u32,
    pub arbiter: Address,
    /// Lock-location chain.
    pub chain_id: u64,
    pub mandate_hash: Option<B256>,
    pub commitments: Vec<StoredCommitment>,
}

#[derive(Debug, Clone)]
pub struct StoredCommitment {
    pub lock_tag: LockTag,
    pub token: Address,
    pub amount: U256,
}

impl StoredCommitment {
    pub fn lock_id(&self) -> U256 {
        self.lock_tag.lock_id(self.token)
    }
}

/// A compact ready for insertion; the store assigns the surrogate id.
#[derive(Debug, Clone)]
pub struct NewCompact {
    pub variant: u8,
    pub chain_id: u64,
    pub claim_hash: B256,
    pub sponsor: Address,
    pub nonce: U256,
    pub expires: U256,
    pub signature: Bytes,
    pub sponsor_signature: Option<Bytes>,
    pub witness_type_string: Option<String>,
    pub witness_hash: Option<B256>,
    pub elements: Vec<StoredElement>,
    pub created_at: u64,
}

/// Composite key persisting a 256-bit nonce losslessly: the top 192 bits as
/// an integer and the bottom 64 bits separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NonceKey {
    pub high: U256,
    pub low: u64,
}

impl From<U256> for NonceKey {
    fn from(nonce: U256) -> Self {
        NonceKey {
            high: nonce >> 64,
            low: nonce.to_be_bytes::<32>()[24..32]
                .try_into()
                .map(u64::from_be_bytes)
                .unwrap_or_default(),
        }
    }
}

/// Transactional persistence keyed at the compact level.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Inserts the compact tree and consumes its nonce as one atomic action.
    /// Fails with [`StoreError::Duplicate`] if `(chain_id, claim_hash)` is
    /// taken and [`StoreError::DuplicateNonce`] if the nonce is; a failure
    /// leaves no partial state.
    async fn insert_compact(&self, compact: NewCompact) -> Result<StoredCompact, StoreError>;

    /// All compacts of a sponsor, most recently created first. Stable
    /// between writes.
    async fn list_by_sponsor(&self, sponsor: Address) -> Result<Vec<StoredCompact>, StoreError>;

    async fn find_by_chain_and_claim_hash(
        &self,
        chain_id: u64,
        claim_hash: B256,
    ) -> Result<Option<StoredCompact>, StoreError>;

    /// Sum of commitment amounts against `(sponsor, chain_id, lock_id)`
    /// whose parent compact is still live: `expires > now` and claim hash
    /// not among the settled set.
    async fn sum_outstanding(
        &self,
        sponsor: Address,
        chain_id: u64,
        lock_id: U256,
        now: U256,
        settled: &HashSet<B256>,
    ) -> Result<U256, StoreError>;

    /// Records a consumed nonce; duplicate insertion is an error.
    async fn insert_consumed_nonce(
        &self,
        chain_id: u64,
        sponsor: Address,
        nonce: U256,
    ) -> Result<(), StoreError>;

    async fn nonce_consumed(
        &self,
        chain_id: u64,
        sponsor: Address,
        nonce: U256,
    ) -> Result<bool, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    next_id: u64,
    compacts: Vec<StoredCompact>,
    claim_keys: HashSet<(u64, B256)>,
    nonces: HashSet<(u64, Address, NonceKey)>,
}

/// Single-process [`Store`] over a `tokio` read-write lock.
///
/// All writes funnel through one exclusive section, which yields the
/// single-writer ordering the allocation engine assumes: commitments become
/// visible to `sum_outstanding` in commit order.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_compact(&self, compact: NewCompact) -> Result<StoredCompact, StoreError> {
        let mut inner = self.inner.write().await;
        let claim_key = (compact.chain_id, compact.claim_hash);
        if inner.claim_keys.contains(&claim_key) {
            return Err(StoreError::Duplicate {
                chain_id: compact.chain_id,
                claim_hash: compact.claim_hash,
            });
        }
        let nonce_key = (
            compact.chain_id,
            compact.sponsor,
            NonceKey::from(compact.nonce),
        );
        if inner.nonces.contains(&nonce_key) {
            return Err(StoreError::DuplicateNonce);
        }

        inner.next_id += 1;
        let stored = StoredCompact {
            id: inner.next_id,
            variant: compact.variant,
            chain_id: compact.chain_id,
            claim_hash: compact.claim_hash,
            sponsor: compact.sponsor,
            nonce: compact.nonce,
            expires: compact.expires,
            signature: compact.signature,
            sponsor_signature: compact.sponsor_signature,
            witness_type_string: compact.witness_type_string,
            witness_hash: compact.witness_hash,
            elements: compact.elements,
            created_at: compact.created_at,
        };
        inner.claim_keys.insert(claim_key);
        inner.nonces.insert(nonce_key);
        inner.compacts.push(stored.clone());
        Ok(stored)
    }

    async fn list_by_sponsor(&self, sponsor: Address) -> Result<Vec<StoredCompact>, StoreError> {
        let inner = self.inner.read().await;
        let mut rows: Vec<StoredCompact> = inner
            .compacts
            .iter()
            .filter(|c| c.sponsor == sponsor)
            .cloned()
            .collect();
        rows.reverse();
        Ok(rows)
    }

    async fn find_by_chain_and_claim_hash(
        &self,
        chain_id: u64,
        claim_hash: B256,
    ) -> Result<Option<StoredCompact>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .compacts
            .iter()
            .find(|c| c.chain_id == chain_id && c.claim_hash == claim_hash)
            .cloned())
    }

    async fn sum_outstanding(
        &self,
        sponsor: Address,
        chain_id: u64,
        lock_id: U256,
        now: U256,
        settled: &HashSet<B256>,
    ) -> Result<U256, StoreError> {
        let inner = self.inner.read().await;
        let mut total = U256::ZERO;
        for compact in &inner.compacts {
            if compact.sponsor != sponsor
                || compact.expires <= now
                || settled.contains(&compact.claim_hash)
            {
                continue;
            }
            for element in &compact.elements {
                if element.chain_id != chain_id {
                    continue;
                }
                for commitment in &element.commitments {
                    if commitment.lock_id() != lock_id {
                        continue;
                    }
                    total = total.checked_add(commitment.amount).ok_or_else(|| {
                        StoreError::Backend("outstanding commitment sum overflow".to_string())
                    })?;
                }
            }
        }
        Ok(total)
    }

    async fn insert_consumed_nonce(
        &self,
        chain_id: u64,
        sponsor: Address,
        nonce: U256,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if !inner
            .nonces
            .insert((chain_id, sponsor, NonceKey::from(nonce)))
        {
            return Err(StoreError::DuplicateNonce);
        }
        Ok(())
    }

    async fn nonce_consumed(
        &self,
        chain_id: u64,
        sponsor: Address,
        nonce: U256,
    ) -> Result<bool, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .nonces
            .contains(&(chain_id, sponsor, NonceKey::from(nonce))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{FixedBytes, address};

    const SPONSOR: Address = address!("0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266");
    const ARBITER: Address = address!("0x70997970C51812dc3A010C7d01b50e0d17dc79C8");

    fn commitment(token_byte: u8, amount: u64) -> StoredCommitment {
        let mut tag = [0u8; 12];
        tag[11] = 0x10;
        let mut token = [0u8; 20];
        token[19] = token_byte;
        StoredCommitment {
            lock_tag: LockTag(FixedBytes::from(tag)),
            token: Address::from(token),
            amount: U256::from(amount),
        }
    }

    fn new_compact(claim_byte: u8, nonce: u64, expires: u64, amount: u64) -> NewCompact {
        NewCompact {
            variant: 0,
            chain_id: 10,
            claim_hash: B256::repeat_byte(claim_byte),
            sponsor: SPONSOR,
            nonce: U256::from(nonce),
            expires: U256::from(expires),
            signature: Bytes::from(vec![0u8; 64]),
            sponsor_signature: None,
            witness_type_string: None,
            witness_hash: None,
            elements: vec![StoredElement {
                element_index: 0,
                arbiter: ARBITER,
                chain_id: 10,
                mandate_hash: None,
                commitments: vec![commitment(0x01, amount)],
            }],
            created_at: 1_700_000_000,
        }
    }

    #[tokio::test]
    async fn assigns_monotonic_ids_and_lists_descending() {
        let store = MemoryStore::new();
        for i in 0..3u8 {
            store
                .insert_compact(new_compact(i + 1, u64::from(i) + 1, 2_000_000_000, 100))
                .await
                .unwrap();
        }
        let rows = store.list_by_sponsor(SPONSOR).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].id, 3);
        assert_eq!(rows[2].id, 1);

        let again = store.list_by_sponsor(SPONSOR).await.unwrap();
        let ids: Vec<u64> = again.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn rejects_duplicate_claim_hash_without_side_effects() {
        let store = MemoryStore::new();
        store
            .insert_compact(new_compact(1, 1, 2_000_000_000, 100))
            .await
            .unwrap();
        let duplicate = store
            .insert_compact(new_compact(1, 2, 2_000_000_000, 100))
            .await;
        assert!(matches!(duplicate, Err(StoreError::Duplicate { .. })));
        // Nonce 2 must not have been consumed by the failed insert.
        assert!(!store.nonce_consumed(10, SPONSOR, U256::from(2u64)).await.unwrap());
    }

    #[tokio::test]
    async fn rejects_duplicate_nonce_without_side_effects() {
        let store = MemoryStore::new();
        store
            .insert_compact(new_compact(1, 7, 2_000_000_000, 100))
            .await
            .unwrap();
        let replay = store
            .insert_compact(new_compact(2, 7, 2_000_000_000, 100))
            .await;
        assert!(matches!(replay, Err(StoreError::DuplicateNonce)));
        assert!(
            store
                .find_by_chain_and_claim_hash(10, B256::repeat_byte(2))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn sum_outstanding_filters_expired_settled_and_foreign_rows() {
        let store = MemoryStore::new();
        let lock_id = commitment(0x01, 0).lock_id();
        let now = U256::from(1_800_000_000u64);

        // Live commitment.
        store
            .insert_compact(new_compact(1, 1, 2_000_000_000, 100))
            .await
            .unwrap();
        // Expired.
        store
            .insert_compact(new_compact(2, 2, 1_700_000_000, 200))
            .await
            .unwrap();
        // Live but settled.
        store
            .insert_compact(new_compact(3, 3, 2_000_000_000, 400))
            .await
            .unwrap();
        // Different lock.
        let mut other_lock = new_compact(4, 4, 2_000_000_000, 800);
        other_lock.elements[0].commitments = vec![commitment(0x02, 800)];
        store.insert_compact(other_lock).await.unwrap();
        // Different chain.
        let mut other_chain = new_compact(5, 5, 2_000_000_000, 1600);
        other_chain.chain_id = 137;
        other_chain.elements[0].chain_id = 137;
        store.insert_compact(other_chain).await.unwrap();

        let settled: HashSet<B256> = [B256::repeat_byte(3)].into_iter().collect();
        let total = store
            .sum_outstanding(SPONSOR, 10, lock_id, now, &settled)
            .await
            .unwrap();
        assert_eq!(total, U256::from(100u64));
    }

    #[tokio::test]
    async fn consumed_nonces_are_permanent_and_unique() {
        let store = MemoryStore::new();
        let nonce = U256::from(42u64);
        assert!(!store.nonce_consumed(10, SPONSOR, nonce).await.unwrap());
        store
            .insert_consumed_nonce(10, SPONSOR, nonce)
            .await
            .unwrap();
        assert!(store.nonce_consumed(10, SPONSOR, nonce).await.unwrap());
        assert_eq!(
            store.insert_consumed_nonce(10, SPONSOR, nonce).await,
            Err(StoreError::DuplicateNonce)
        );
        // Same nonce on another chain is a distinct key.
        store
            .insert_consumed_nonce(137, SPONSOR, nonce)
            .await
            .unwrap();
    }

    #[test]
    fn nonce_key_split_is_lossless_at_the_64_bit_boundary() {
        let nonce = (U256::from(0xabcdu64) << 64) | U256::from(u64::MAX);
        let key = NonceKey::from(nonce);
        assert_eq!(key.high, U256::from(0xabcdu64));
        assert_eq!(key.low, u64::MAX);

        let low_only = NonceKey::from(U256::from(7u64));
        assert_eq!(low_only.high, U256::ZERO);
        assert_eq!(low_only.low, 7);
        assert_ne!(key, low_only);
    }
}
