//! Read-only client for the protocol indexer.
//!
//! The allocator never talks to a chain node directly: on-chain balances,
//! scheduled withdrawals, settled claims, consumed nonces, and the
//! allocator's supported-chain configuration all come from an external
//! indexer. The [`Indexer`] trait is the seam the engines depend on; the
//! [`HttpIndexerClient`] is a thin GraphQL-over-HTTP adapter with a
//! client-side timeout so no critical section waits on a stuck upstream.

use alloy_primitives::{Address, B256, I256, U256};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::instrument;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum IndexerError {
    #[error("indexer request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("indexer returned errors: {0}")]
    Query(String),
    #[error("malformed indexer response: {0}")]
    Malformed(String),
}

/// On-chain state of one resource lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLockState {
    /// Non-zero while the sponsor has initiated a forced withdrawal.
    pub withdrawal_status: u8,
    pub balance: U256,
}

/// A scheduled balance change; positive deltas are pending outflows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountDelta {
    pub delta: I256,
}

/// A claim the indexer has observed as settled on-chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimRecord {
    pub claim_hash: B256,
}

/// Everything the balance engine needs about one `(sponsor, lock, chain)`.
#[derive(Debug, Clone, Default)]
pub struct CompactDetails {
    pub resource_lock: Option<ResourceLockState>,
    pub account_deltas: Vec<AccountDelta>,
    pub claims: Vec<ClaimRecord>,
}

/// One resource lock of a sponsor, as listed across all chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLockListing {
    pub chain_id: u64,
    pub lock_id: U256,
    pub allocator_address: Address,
}

/// Per-chain configuration of this allocator, as registered on-chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupportedChainRecord {
    pub chain_id: u64,
    pub allocator_id: U256,
    pub finalization_lag_blocks: u64,
}

/// A compact registered directly on-chain by the sponsor, which stands in
/// for an off-chain sponsor signature.
#[derive(Debug, Clone)]
pub struct RegisteredCompact {
    pub sponsor: Address,
    pub expires: U256,
    pub typehash: B256,
    /// Claim processing status, opaque to the allocator.
    pub claim: Option<Value>,
}

/// The indexer read surface the engines depend on.
#[async_trait]
pub trait Indexer: Send + Sync + 'static {
    /// Lock state, pending deltas, and settled claims for one
    /// `(sponsor, lock, chain)` triple.
    async fn compact_details(
        &self,
        allocator: Address,
        sponsor: Address,
        lock_id: U256,
        chain_id: u64,
    ) -> Result<CompactDetails, IndexerError>;

    /// Every resource lock the sponsor holds, across all chains and
    /// allocators.
    async fn all_resource_locks(
        &self,
        sponsor: Address,
    ) -> Result<Vec<ResourceLockListing>, IndexerError>;

    /// Chains on which the given allocator is registered.
    async fn supported_chains(
        &self,
        allocator: Address,
    ) -> Result<Vec<SupportedChainRecord>, IndexerError>;

    /// A compact the sponsor registered on-chain, if any.
    async fn registered_compact(
        &self,
        allocator: Address,
        sponsor: Address,
        claim_hash: B256,
        chain_id: u64,
    ) -> Result<Option<RegisteredCompact>, IndexerError>;

    /// Whether a nonce has already been consumed on-chain.
    async fn nonce_consumed(
        &self,
        sponsor: Address,
        nonce: U256,
        chain_id: u64,
    ) -> Result<bool, IndexerError>;
}

/// GraphQL-over-HTTP implementation of [`Indexer`].
#[derive(Debug, Clone)]
pub struct HttpIndexerClient {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpIndexerClient {
    /// Builds a client with the given endpoint and request timeout.
    pub fn new(endpoint: Url, timeout: Duration) -> Result<Self, IndexerError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoint })
    }

    async fn query<T: for<'de> Deserialize<'de>>(
        &self,
        query: &'static str,
        variables: Value,
    ) -> Result<T, IndexerError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await?
            .error_for_status()?;
        let body: GraphqlResponse<T> = response.json().await?;
        if !body.errors.is_empty() {
            let messages: Vec<String> = body.errors.into_iter().map(|e| e.message).collect();
            return Err(IndexerError::Query(messages.join("; ")));
        }
        body.data
            .ok_or_else(|| IndexerError::Malformed("response carries no data".to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct GraphqlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct Items<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

impl<T> Default for Items<T> {
    fn default() -> Self {
        Items { items: Vec::new() }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompactDetailsData {
    #[serde(default)]
    resource_lock: Option<ResourceLockRow>,
    #[serde(default)]
    account_deltas: Items<DeltaRow>,
    #[serde(default)]
    claims: Items<ClaimRow>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceLockRow {
    withdrawal_status: u8,
    balance: String,
}

#[derive(Debug, Deserialize)]
struct DeltaRow {
    delta: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClaimRow {
    claim_hash: B256,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockListingRow {
    chain_id: String,
    lock_id: String,
    allocator_address: Address,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SupportedChainRow {
    chain_id: String,
    allocator_id: String,
    #[serde(default)]
    finalization_lag_blocks: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisteredCompactRow {
    sponsor: Address,
    expires: String,
    typehash: B256,
    claim: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NonceRow {
    #[allow(dead_code)]
    nonce: String,
}

const COMPACT_DETAILS_QUERY: &str = r#"
query CompactDetails($allocator: String!, $sponsor: String!, $lockId: BigInt!, $chainId: BigInt!) {
  resourceLock(allocator: $allocator, sponsor: $sponsor, lockId: $lockId, chainId: $chainId) {
    withdrawalStatus
    balance
  }
  accountDeltas(sponsor: $sponsor, lockId: $lockId, chainId: $chainId) {
    items { delta }
  }
  claims(sponsor: $sponsor, chainId: $chainId) {
    items { claimHash }
  }
}
"#;

const ALL_RESOURCE_LOCKS_QUERY: &str = r#"
query AllResourceLocks($sponsor: String!) {
  resourceLocks(sponsor: $sponsor) {
    items { chainId lockId allocatorAddress }
  }
}
"#;

const SUPPORTED_CHAINS_QUERY: &str = r#"
query SupportedChains($allocator: String!) {
  supportedChains(allocator: $allocator) {
    items { chainId allocatorId finalizationLagBlocks }
  }
}
"#;

const REGISTERED_COMPACT_QUERY: &str = r#"
query RegisteredCompact($allocator: String!, $sponsor: String!, $claimHash: String!, $chainId: BigInt!) {
  registeredCompact(allocator: $allocator, sponsor: $sponsor, claimHash: $claimHash, chainId: $chainId) {
    sponsor
    expires
    typehash
    claim
  }
}
"#;

const CONSUMED_NONCE_QUERY: &str = r#"
query ConsumedNonce($sponsor: String!, $nonce: String!, $chainId: BigInt!) {
  consumedNonces(sponsor: $sponsor, nonce: $nonce, chainId: $chainId) {
    items { nonce }
  }
}
"#;

fn parse_u256(raw: &str, what: &str) -> Result<U256, IndexerError> {
    let parsed = if let Some(stripped) = raw.strip_prefix("0x") {
        U256::from_str_radix(stripped, 16)
    } else {
        U256::from_str_radix(raw, 10)
    };
    parsed.map_err(|e| IndexerError::Malformed(format!("{what} {raw:?}: {e}")))
}

fn parse_i256(raw: &str, what: &str) -> Result<I256, IndexerError> {
    let (negative, digits) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    let magnitude = parse_u256(digits, what)?;
    let signed = I256::try_from(magnitude)
        .map_err(|_| IndexerError::Malformed(format!("{what} {raw:?} out of range")))?;
    if negative {
        signed
            .checked_neg()
            .ok_or_else(|| IndexerError::Malformed(format!("{what} {raw:?} out of range")))
    } else {
        Ok(signed)
    }
}

fn parse_chain(raw: &str) -> Result<u64, IndexerError> {
    raw.parse()
        .map_err(|_| IndexerError::Malformed(format!("chain id {raw:?}")))
}

#[async_trait]
impl Indexer for HttpIndexerClient {
    #[instrument(skip(self), err)]
    async fn compact_details(
        &self,
        allocator: Address,
        sponsor: Address,
        lock_id: U256,
        chain_id: u64,
    ) -> Result<CompactDetails, IndexerError> {
        let data: CompactDetailsData = self
            .query(
                COMPACT_DETAILS_QUERY,
                json!({
                    "allocator": allocator.to_checksum(None),
                    "sponsor": sponsor.to_checksum(None),
                    "lockId": format!("0x{lock_id:064x}"),
                    "chainId": chain_id.to_string(),
                }),
            )
            .await?;

        let resource_lock = data
            .resource_lock
            .map(|row| {
                Ok::<_, IndexerError>(ResourceLockState {
                    withdrawal_status: row.withdrawal_status,
                    balance: parse_u256(&row.balance, "balance")?,
                })
            })
            .transpose()?;
        let account_deltas = data
            .account_deltas
            .items
            .iter()
            .map(|row| {
                Ok(AccountDelta {
                    delta: parse_i256(&row.delta, "delta")?,
                })
            })
            .collect::<Result<_, IndexerError>>()?;
        let claims = data
            .claims
            .items
            .into_iter()
            .map(|row| ClaimRecord {
                claim_hash: row.claim_hash,
            })
            .collect();

        Ok(CompactDetails {
            resource_lock,
            account_deltas,
            claims,
        })
    }

    #[instrument(skip(self), err)]
    async fn all_resource_locks(
        &self,
        sponsor: Address,
    ) -> Result<Vec<ResourceLockListing>, IndexerError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Data {
            resource_locks: Items<LockListingRow>,
        }

        let data: Data = self
            .query(
                ALL_RESOURCE_LOCKS_QUERY,
                json!({ "sponsor": sponsor.to_checksum(None) }),
            )
            .await?;
        data.resource_locks
            .items
            .iter()
            .map(|row| {
                Ok(ResourceLockListing {
                    chain_id: parse_chain(&row.chain_id)?,
                    lock_id: parse_u256(&row.lock_id, "lock id")?,
                    allocator_address: row.allocator_address,
                })
            })
            .collect()
    }

    #[instrument(skip(self), err)]
    async fn supported_chains(
        &self,
        allocator: Address,
    ) -> Result<Vec<SupportedChainRecord>, IndexerError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Data {
            supported_chains: Items<SupportedChainRow>,
        }

        let data: Data = self
            .query(
                SUPPORTED_CHAINS_QUERY,
                json!({ "allocator": allocator.to_checksum(None) }),
            )
            .await?;
        data.supported_chains
            .items
            .iter()
            .map(|row| {
                Ok(SupportedChainRecord {
                    chain_id: parse_chain(&row.chain_id)?,
                    allocator_id: parse_u256(&row.allocator_id, "allocator id")?,
                    finalization_lag_blocks: row.finalization_lag_blocks,
                })
            })
            .collect()
    }

    #[instrument(skip(self), err)]
    async fn registered_compact(
        &self,
        allocator: Address,
        sponsor: Address,
        claim_hash: B256,
        chain_id: u64,
    ) -> Result<Option<RegisteredCompact>, IndexerError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Data {
            registered_compact: Option<RegisteredCompactRow>,
        }

        let data: Data = self
            .query(
                REGISTERED_COMPACT_QUERY,
                json!({
                    "allocator": allocator.to_checksum(None),
                    "sponsor": sponsor.to_checksum(None),
                    "claimHash": claim_hash.to_string(),
                    "chainId": chain_id.to_string(),
                }),
            )
            .await?;
        data.registered_compact
            .map(|row| {
                Ok(RegisteredCompact {
                    sponsor: row.sponsor,
                    expires: parse_u256(&row.expires, "expires")?,
                    typehash: row.typehash,
                    claim: row.claim,
                })
            })
            .transpose()
    }

    #[instrument(skip(self), err)]
    async fn nonce_consumed(
        &self,
        sponsor: Address,
        nonce: U256,
        chain_id: u64,
    ) -> Result<bool, IndexerError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Data {
            consumed_nonces: Items<NonceRow>,
        }

        let data: Data = self
            .query(
                CONSUMED_NONCE_QUERY,
                json!({
                    "sponsor": sponsor.to_checksum(None),
                    "nonce": format!("0x{nonce:064x}"),
                    "chainId": chain_id.to_string(),
                }),
            )
            .await?;
        Ok(!data.consumed_nonces.items.is_empty())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory [`Indexer`] used across the engine test suites.

    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    pub struct MockIndexer {
        locks: Mutex<HashMap<(Address, u64, U256), ResourceLockState>>,
        deltas: Mutex<HashMap<(Address, u64, U256), Vec<AccountDelta>>>,
        claims: Mutex<HashMap<(Address, u64), Vec<ClaimRecord>>>,
        consumed: Mutex<HashSet<(Address, u64, U256)>>,
        supported: Mutex<Vec<SupportedChainRecord>>,
        registered: Mutex<HashMap<(Address, u64, B256), RegisteredCompact>>,
        listings: Mutex<Vec<ResourceLockListing>>,
        unavailable: AtomicBool,
    }

    impl MockIndexer {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_chain(self, chain_id: u64, allocator_id: U256) -> Self {
            self.supported.lock().unwrap().push(SupportedChainRecord {
                chain_id,
                allocator_id,
                finalization_lag_blocks: 1,
            });
            self
        }

        pub fn set_lock(
            &self,
            sponsor: Address,
            chain_id: u64,
            lock_id: U256,
            balance: U256,
            withdrawal_status: u8,
        ) {
            self.locks.lock().unwrap().insert(
                (sponsor, chain_id, lock_id),
                ResourceLockState {
                    withdrawal_status,
                    balance,
                },
            );
        }

        pub fn add_delta(&self, sponsor: Address, chain_id: u64, lock_id: U256, delta: I256) {
            self.deltas
                .lock()
                .unwrap()
                .entry((sponsor, chain_id, lock_id))
                .or_default()
                .push(AccountDelta { delta });
        }

        pub fn add_settled_claim(&self, sponsor: Address, chain_id: u64, claim_hash: B256) {
            self.claims
                .lock()
                .unwrap()
                .entry((sponsor, chain_id))
                .or_default()
                .push(ClaimRecord { claim_hash });
        }

        pub fn mark_nonce_consumed(&self, sponsor: Address, chain_id: u64, nonce: U256) {
            self.consumed
                .lock()
                .unwrap()
                .insert((sponsor, chain_id, nonce));
        }

        pub fn register_compact(
            &self,
            sponsor: Address,
            chain_id: u64,
            claim_hash: B256,
            registered: RegisteredCompact,
        ) {
            self.registered
                .lock()
                .unwrap()
                .insert((sponsor, chain_id, claim_hash), registered);
        }

        pub fn add_listing(&self, listing: ResourceLockListing) {
            self.listings.lock().unwrap().push(listing);
        }

        /// Makes every subsequent call fail, simulating an outage.
        pub fn go_dark(&self) {
            self.unavailable.store(true, Ordering::SeqCst);
        }

        fn check_available(&self) -> Result<(), IndexerError> {
            if self.unavailable.load(Ordering::SeqCst) {
                Err(IndexerError::Query("indexer unavailable".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl Indexer for MockIndexer {
        async fn compact_details(
            &self,
            _allocator: Address,
            sponsor: Address,
            lock_id: U256,
            chain_id: u64,
        ) -> Result<CompactDetails, IndexerError> {
            self.check_available()?;
            let key = (sponsor, chain_id, lock_id);
            Ok(CompactDetails {
                resource_lock: self.locks.lock().unwrap().get(&key).copied(),
                account_deltas: self
                    .deltas
                    .lock()
                    .unwrap()
                    .get(&key)
                    .cloned()
                    .unwrap_or_default(),
                claims: self
                    .claims
                    .lock()
                    .unwrap()
                    .get(&(sponsor, chain_id))
                    .cloned()
                    .unwrap_or_default(),
            })
        }

        async fn all_resource_locks(
            &self,
            _sponsor: Address,
        ) -> Result<Vec<ResourceLockListing>, IndexerError> {
            self.check_available()?;
            Ok(self.listings.lock().unwrap().clone())
        }

        async fn supported_chains(
            &self,
            _allocator: Address,
        ) -> Result<Vec<SupportedChainRecord>, IndexerError> {
            self.check_available()?;
            Ok(self.supported.lock().unwrap().clone())
        }

        async fn registered_compact(
            &self,
            _allocator: Address,
            sponsor: Address,
            claim_hash: B256,
            chain_id: u64,
        ) -> Result<Option<RegisteredCompact>, IndexerError> {
            self.check_available()?;
            Ok(self
                .registered
                .lock()
                .unwrap()
                .get(&(sponsor, chain_id, claim_hash))
                .cloned())
        }

        async fn nonce_consumed(
            &self,
            sponsor: Address,
            nonce: U256,
            chain_id: u64,
        ) -> Result<bool, IndexerError> {
            self.check_available()?;
            Ok(self
                .consumed
                .lock()
                .unwrap()
                .contains(&(sponsor, chain_id, nonce)))
        }
    }
}
