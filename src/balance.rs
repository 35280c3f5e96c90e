//! Allocatable-balance computation for one `(sponsor, chain, lock)` triple.
//!
//! `allocatable = max(0, onchainBalance − pendingWithdrawals)` and
//! `outstanding` is the sum of live local commitments against the lock:
//! those not yet expired and not among the claims the indexer reports
//! settled. The sponsor's uncommitted capacity is `allocatable − outstanding`.

use alloy_primitives::{Address, I256, U256};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::instrument;

use crate::chains::ChainRegistry;
use crate::indexer::{Indexer, IndexerError};
use crate::store::{Store, StoreError};
use crate::types::LockTag;

#[derive(Debug, thiserror::Error)]
pub enum BalanceError {
    #[error("no resource lock 0x{lock_id:064x} for sponsor on chain {chain_id}")]
    LockMissing { chain_id: u64, lock_id: U256 },
    #[error("resource lock 0x{lock_id:064x} is under forced withdrawal (status {status})")]
    ForcedWithdrawal { lock_id: U256, status: u8 },
    #[error("chain {0} is not supported by this allocator")]
    UnsupportedChain(u64),
    #[error("lock 0x{lock_id:064x} names allocator id {actual}, this allocator is {expected}")]
    WrongAllocator {
        lock_id: U256,
        actual: U256,
        expected: U256,
    },
    #[error("insufficient balance for lock 0x{lock_id:064x}: have {have}, need {need}")]
    InsufficientBalance {
        lock_id: U256,
        have: U256,
        need: U256,
    },
    #[error(transparent)]
    Indexer(#[from] IndexerError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Balance facts about one lock at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockBalance {
    /// On-chain balance minus scheduled withdrawals, floored at zero.
    pub allocatable: U256,
    /// Live local commitments against the lock.
    pub outstanding: U256,
    pub withdrawal_status: u8,
}

impl LockBalance {
    /// What the sponsor can still commit: `allocatable − outstanding`.
    pub fn available(&self) -> U256 {
        self.allocatable.saturating_sub(self.outstanding)
    }
}

/// Computes lock balances from the indexer and the local store.
#[derive(Debug)]
pub struct BalanceEngine<I, S> {
    indexer: Arc<I>,
    store: Arc<S>,
    chains: Arc<ChainRegistry>,
}

impl<I, S> Clone for BalanceEngine<I, S> {
    fn clone(&self) -> Self {
        Self {
            indexer: Arc::clone(&self.indexer),
            store: Arc::clone(&self.store),
            chains: Arc::clone(&self.chains),
        }
    }
}

impl<I: Indexer, S: Store> BalanceEngine<I, S> {
    pub fn new(indexer: Arc<I>, store: Arc<S>, chains: Arc<ChainRegistry>) -> Self {
        Self {
            indexer,
            store,
            chains,
        }
    }

    /// Assesses one lock: verifies it exists, is not being withdrawn, and is
    /// tagged for this allocator, then computes allocatable and outstanding.
    #[instrument(skip(self), err)]
    pub async fn assess(
        &self,
        sponsor: Address,
        chain_id: u64,
        lock_id: U256,
        now: U256,
    ) -> Result<LockBalance, BalanceError> {
        let details = self
            .indexer
            .compact_details(self.chains.allocator(), sponsor, lock_id, chain_id)
            .await?;

        let lock = details
            .resource_lock
            .ok_or(BalanceError::LockMissing { chain_id, lock_id })?;
        if lock.withdrawal_status != 0 {
            return Err(BalanceError::ForcedWithdrawal {
                lock_id,
                status: lock.withdrawal_status,
            });
        }

        let supported = self
            .chains
            .get(chain_id)
            .ok_or(BalanceError::UnsupportedChain(chain_id))?;
        let (lock_tag, _) = LockTag::split_lock_id(lock_id);
        let allocator_id = lock_tag.allocator_id();
        if allocator_id != supported.allocator_id {
            return Err(BalanceError::WrongAllocator {
                lock_id,
                actual: allocator_id,
                expected: supported.allocator_id,
            });
        }

        let mut pending = I256::ZERO;
        for delta in &details.account_deltas {
            pending = pending.checked_add(delta.delta).ok_or_else(|| {
                IndexerError::Malformed("pending delta sum overflow".to_string())
            })?;
        }
        let allocatable = if pending.is_negative() {
            lock.balance.saturating_add(pending.unsigned_abs())
        } else {
            lock.balance.saturating_sub(pending.unsigned_abs())
        };

        let settled: HashSet<_> = details.claims.iter().map(|c| c.claim_hash).collect();
        let outstanding = self
            .store
            .sum_outstanding(sponsor, chain_id, lock_id, now, &settled)
            .await?;

        Ok(LockBalance {
            allocatable,
            outstanding,
            withdrawal_status: 0,
        })
    }
}
