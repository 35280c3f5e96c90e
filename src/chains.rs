//! Process-wide cache of the chains this allocator serves.
//!
//! Populated from the indexer at startup and refreshed only through an
//! explicit administrative call; reads never await. Each entry pairs a chain
//! id with the allocator id registered on that chain, which the balance
//! engine checks lock tags against.

use alloy_primitives::{Address, U256};
use dashmap::DashMap;
use tracing::instrument;

use crate::indexer::{Indexer, IndexerError};

/// Configuration of this allocator on one chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupportedChain {
    pub allocator_id: U256,
    pub finalization_lag_blocks: u64,
}

/// Read-mostly registry of supported chains.
#[derive(Debug)]
pub struct ChainRegistry {
    allocator: Address,
    chains: DashMap<u64, SupportedChain>,
}

impl ChainRegistry {
    pub fn new(allocator: Address) -> Self {
        Self {
            allocator,
            chains: DashMap::new(),
        }
    }

    /// The allocator address this registry was built for.
    pub fn allocator(&self) -> Address {
        self.allocator
    }

    /// Replaces the cached chain set with the indexer's current view.
    #[instrument(skip_all, err)]
    pub async fn refresh<I: Indexer>(&self, indexer: &I) -> Result<usize, IndexerError> {
        let records = indexer.supported_chains(self.allocator).await?;
        self.chains.clear();
        for record in &records {
            self.chains.insert(
                record.chain_id,
                SupportedChain {
                    allocator_id: record.allocator_id,
                    finalization_lag_blocks: record.finalization_lag_blocks,
                },
            );
        }
        tracing::info!(chains = records.len(), "refreshed supported chains");
        Ok(records.len())
    }

    pub fn get(&self, chain_id: u64) -> Option<SupportedChain> {
        self.chains.get(&chain_id).map(|entry| *entry.value())
    }

    pub fn contains(&self, chain_id: u64) -> bool {
        self.chains.contains_key(&chain_id)
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}
