//! Nonce derivation, uniqueness, and consumption tracking.
//!
//! A nonce is 32 bytes: the high 20 bytes are the sponsor address, the low
//! 12 bytes a fragment the sponsor picks or this service suggests. Embedding
//! the sponsor makes cross-sponsor collisions impossible, so uniqueness only
//! has to hold within one sponsor's fragment space. Consumption is tracked
//! against both the local store and the on-chain record the indexer exposes.

use alloy_primitives::{Address, U256};
use std::sync::Arc;
use tracing::instrument;

use crate::indexer::{Indexer, IndexerError};
use crate::store::{Store, StoreError};

/// Upper bound on the fragment scan in [`NonceService::suggest`].
pub const SUGGESTION_SCAN_LIMIT: u64 = 1024;

#[derive(Debug, thiserror::Error)]
pub enum NonceError {
    #[error("nonce is required; request one from /suggested-nonce")]
    Missing,
    #[error("nonce 0x{0:064x} does not embed sponsor {1}")]
    SponsorMismatch(U256, Address),
    #[error("nonce 0x{0:064x} has already been used")]
    Replay(U256),
    #[error("nonce 0x{0:064x} is already consumed on-chain")]
    ConsumedOnchain(U256),
    #[error("no free nonce fragment found within {SUGGESTION_SCAN_LIMIT} attempts")]
    Exhausted,
    #[error(transparent)]
    Indexer(#[from] IndexerError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Composes a nonce from a sponsor and a 96-bit fragment.
pub fn compose(sponsor: Address, fragment: U256) -> U256 {
    (U256::from_be_slice(sponsor.as_slice()) << 96) | (fragment & (U256::MAX >> 160))
}

/// The sponsor embedded in a nonce's high 20 bytes.
pub fn sponsor_of(nonce: U256) -> Address {
    Address::from_slice(&nonce.to_be_bytes::<32>()[0..20])
}

/// The low 96-bit fragment of a nonce.
pub fn fragment_of(nonce: U256) -> U256 {
    nonce & (U256::MAX >> 160)
}

/// Suggests, validates, and consumes sponsor-bound nonces.
#[derive(Debug)]
pub struct NonceService<I, S> {
    indexer: Arc<I>,
    store: Arc<S>,
}

impl<I, S> Clone for NonceService<I, S> {
    fn clone(&self) -> Self {
        Self {
            indexer: Arc::clone(&self.indexer),
            store: Arc::clone(&self.store),
        }
    }
}

impl<I: Indexer, S: Store> NonceService<I, S> {
    pub fn new(indexer: Arc<I>, store: Arc<S>) -> Self {
        Self { indexer, store }
    }

    /// Picks the smallest fragment whose composed nonce is unused both
    /// locally and on-chain. The scan is bounded; running out means the
    /// sponsor has burned the low fragment space and should widen it.
    #[instrument(skip(self), err)]
    pub async fn suggest(&self, sponsor: Address, chain_id: u64) -> Result<U256, NonceError> {
        for fragment in 0..SUGGESTION_SCAN_LIMIT {
            let nonce = compose(sponsor, U256::from(fragment));
            if self.store.nonce_consumed(chain_id, sponsor, nonce).await? {
                continue;
            }
            if self.indexer.nonce_consumed(sponsor, nonce, chain_id).await? {
                continue;
            }
            return Ok(nonce);
        }
        Err(NonceError::Exhausted)
    }

    /// Confirms a sponsor-supplied nonce is well-bound and fresh.
    #[instrument(skip(self), err)]
    pub async fn validate(
        &self,
        nonce: U256,
        sponsor: Address,
        chain_id: u64,
    ) -> Result<(), NonceError> {
        if sponsor_of(nonce) != sponsor {
            return Err(NonceError::SponsorMismatch(nonce, sponsor));
        }
        if self.store.nonce_consumed(chain_id, sponsor, nonce).await? {
            return Err(NonceError::Replay(nonce));
        }
        if self.indexer.nonce_consumed(sponsor, nonce, chain_id).await? {
            return Err(NonceError::ConsumedOnchain(nonce));
        }
        Ok(())
    }

    /// Marks a nonce consumed; a second consumption is a replay.
    #[instrument(skip(self), err)]
    pub async fn consume(
        &self,
        nonce: U256,
        sponsor: Address,
        chain_id: u64,
    ) -> Result<(), NonceError> {
        match self
            .store
            .insert_consumed_nonce(chain_id, sponsor, nonce)
            .await
        {
            Ok(()) => Ok(()),
            Err(StoreError::DuplicateNonce) => Err(NonceError::Replay(nonce)),
            Err(other) => Err(other.into()),
        }
    }
}
