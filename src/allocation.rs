//! The allocation critical section.
//!
//! Submissions by the same sponsor serialize through a per-sponsor mutex;
//! different sponsors proceed in parallel. Balances are re-checked inside
//! the region even when the client pre-checked via `/compact/is-allocatable`:
//! that recheck closes the window between two simultaneous submissions
//! against the same lock. Persisting the compact and consuming its nonce
//! happen as one atomic store action; any earlier failure leaves no state.

use alloy_primitives::{Address, B256, Bytes, U256};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::instrument;

use crate::balance::{BalanceEngine, BalanceError, LockBalance};
use crate::chains::ChainRegistry;
use crate::hash::{self, BatchError};
use crate::indexer::Indexer;
use crate::nonce::{NonceError, NonceService};
use crate::signer::{AllocatorSigner, SignerError};
use crate::sponsor::{self, AuthError, SponsorAuthorization};
use crate::store::{NewCompact, Store, StoreError, StoredCommitment, StoredElement};
use crate::types::{CompactPayload, UnixTimestamp, ValidatedCompact};
use crate::validator::{self, ValidationError};

#[derive(Debug, thiserror::Error)]
pub enum AllocationError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Nonce(#[from] NonceError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Balance(#[from] BalanceError),
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Signer(#[from] SignerError),
    #[error("system clock unavailable")]
    Clock,
}

/// What a successful submission hands back to the sponsor.
#[derive(Debug, Clone)]
pub struct AllocationOutcome {
    pub claim_hash: B256,
    /// Allocator co-signature over the digest, EIP-2098.
    pub signature: Bytes,
    pub nonce: U256,
    pub authorization: SponsorAuthorization,
}

/// Gate that admits, signs, and records compact submissions.
pub struct AllocationEngine<I, S> {
    store: Arc<S>,
    chains: Arc<ChainRegistry>,
    signer: Arc<AllocatorSigner>,
    indexer: Arc<I>,
    nonces: NonceService<I, S>,
    balances: BalanceEngine<I, S>,
    sponsor_locks: DashMap<Address, Arc<Mutex<()>>>,
}

impl<I: Indexer, S: Store> AllocationEngine<I, S> {
    pub fn new(
        indexer: Arc<I>,
        store: Arc<S>,
        chains: Arc<ChainRegistry>,
        signer: Arc<AllocatorSigner>,
    ) -> Self {
        let nonces = NonceService::new(Arc::clone(&indexer), Arc::clone(&store));
        let balances = BalanceEngine::new(
            Arc::clone(&indexer),
            Arc::clone(&store),
            Arc::clone(&chains),
        );
        Self {
            store,
            chains,
            signer,
            indexer,
            nonces,
            balances,
            sponsor_locks: DashMap::new(),
        }
    }

    pub fn nonces(&self) -> &NonceService<I, S> {
        &self.nonces
    }

    pub fn balances(&self) -> &BalanceEngine<I, S> {
        &self.balances
    }

    pub fn chains(&self) -> &ChainRegistry {
        &self.chains
    }

    fn sponsor_lock(&self, sponsor: Address) -> Arc<Mutex<()>> {
        self.sponsor_locks
            .entry(sponsor)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Validates and admits a submission, returning the allocator signature.
    #[instrument(skip_all, err, fields(chain_id = %chain_id))]
    pub async fn submit(
        &self,
        chain_id: &str,
        payload: &CompactPayload,
        sponsor_signature: Option<&Bytes>,
    ) -> Result<AllocationOutcome, AllocationError> {
        let now = UnixTimestamp::try_now().map_err(|_| AllocationError::Clock)?;
        let compact = validator::validate(chain_id, payload, now)?;
        let sponsor = compact.sponsor;

        let lock = self.sponsor_lock(sponsor);
        let _guard = lock.lock().await;

        self.check_capacity(&compact, now).await?;
        self.nonces
            .validate(compact.nonce, sponsor, compact.chain_id)
            .await?;

        let claim_hash = hash::claim_hash(&compact)?;
        let digest = hash::digest(compact.chain_id, claim_hash);
        let authorization = sponsor::authorize(
            self.indexer.as_ref(),
            self.chains.allocator(),
            &compact,
            claim_hash,
            digest,
            sponsor_signature,
        )
        .await?;

        let signature = self.signer.sign_digest(digest)?;
        let inserted = self
            .store
            .insert_compact(new_compact(
                &compact,
                claim_hash,
                signature.clone(),
                sponsor_signature.cloned(),
                now,
            ))
            .await
            .map_err(|error| match error {
                StoreError::DuplicateNonce => {
                    AllocationError::Nonce(NonceError::Replay(compact.nonce))
                }
                other => AllocationError::Store(other),
            })?;

        tracing::info!(
            claim_hash = %inserted.claim_hash,
            sponsor = %sponsor,
            nonce = %format!("0x{:064x}", inserted.nonce),
            "allocated compact"
        );
        Ok(AllocationOutcome {
            claim_hash: inserted.claim_hash,
            signature,
            nonce: inserted.nonce,
            authorization,
        })
    }

    /// Lock-free viability check backing `/compact/is-allocatable`: the same
    /// validation, nonce, and balance gates as `submit`, with no side
    /// effects and no sponsor authorization.
    #[instrument(skip_all, err, fields(chain_id = %chain_id))]
    pub async fn is_allocatable(
        &self,
        chain_id: &str,
        payload: &CompactPayload,
    ) -> Result<ValidatedCompact, AllocationError> {
        let now = UnixTimestamp::try_now().map_err(|_| AllocationError::Clock)?;
        let compact = validator::validate(chain_id, payload, now)?;
        self.check_capacity(&compact, now).await?;
        self.nonces
            .validate(compact.nonce, compact.sponsor, compact.chain_id)
            .await?;
        Ok(compact)
    }

    async fn check_capacity(
        &self,
        compact: &ValidatedCompact,
        now: UnixTimestamp,
    ) -> Result<(), AllocationError> {
        for (chain_id, commitment) in compact.commitments() {
            let lock_id = commitment.lock_id();
            let balance: LockBalance = self
                .balances
                .assess(compact.sponsor, chain_id, lock_id, now.as_u256())
                .await?;
            let have = balance.available();
            if have < commitment.amount {
                return Err(BalanceError::InsufficientBalance {
                    lock_id,
                    have,
                    need: commitment.amount,
                }
                .into());
            }
        }
        Ok(())
    }
}

fn new_compact(
    compact: &ValidatedCompact,
    claim_hash: B256,
    signature: Bytes,
    sponsor_signature: Option<Bytes>,
    now: UnixTimestamp,
) -> NewCompact {
    NewCompact {
        variant: compact.variant.tag(),
        chain_id: compact.chain_id,
        claim_hash,
        sponsor: compact.sponsor,
        nonce: compact.nonce,
        expires: compact.expires,
        signature,
        sponsor_signature,
        witness_type_string: compact.witness_type_string.clone(),
        witness_hash: compact.witness_hash,
        elements: compact
            .elements
            .iter()
            .enumerate()
            .map(|(index, element)| StoredElement {
                element_index: index as u32,
                arbiter: element.arbiter,
                chain_id: element.chain_id,
                mandate_hash: element.mandate_hash,
                commitments: element
                    .commitments
                    .iter()
                    .map(|c| StoredCommitment {
                        lock_tag: c.lock_tag,
                        token: c.token,
                        amount: c.amount,
                    })
                    .collect(),
            })
            .collect(),
        created_at: now.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::testing::MockIndexer;
    use crate::nonce;
    use crate::store::MemoryStore;
    use crate::types::LockTag;
    use alloy_primitives::{address, keccak256};
    use alloy_signer::SignerSync;
    use alloy_signer_local::PrivateKeySigner;
    use serde_json::json;
    use std::str::FromStr;

    const SPONSOR_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const ALLOCATOR_KEY: &str =
        "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";
    const SPONSOR: Address = address!("0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266");
    const CHAIN: u64 = 10;

    // Lock tag encoding allocator id 1; token 0x…01.
    const LOCK_TAG: &str = "0x000000000000000000000010";
    const TOKEN: &str = "0x0000000000000000000000000000000000000001";

    struct Harness {
        indexer: Arc<MockIndexer>,
        store: Arc<MemoryStore>,
        engine: Arc<AllocationEngine<MockIndexer, MemoryStore>>,
    }

    async fn harness() -> Harness {
        let indexer = Arc::new(MockIndexer::new().with_chain(CHAIN, U256::from(1u64)));
        let store = Arc::new(MemoryStore::new());
        let signer = Arc::new(AllocatorSigner::new(ALLOCATOR_KEY, None, false).unwrap());
        let chains = Arc::new(ChainRegistry::new(signer.address()));
        chains.refresh(indexer.as_ref()).await.unwrap();
        let engine = Arc::new(AllocationEngine::new(
            Arc::clone(&indexer),
            Arc::clone(&store),
            chains,
            signer,
        ));
        Harness {
            indexer,
            store,
            engine,
        }
    }

    fn lock_id() -> U256 {
        LockTag::from_str(LOCK_TAG)
            .unwrap()
            .lock_id(Address::from_str(TOKEN).unwrap())
    }

    fn expires() -> u64 {
        UnixTimestamp::try_now().unwrap().0 + 600
    }

    fn single_payload(amount: &str, fragment: u64) -> CompactPayload {
        let nonce = nonce::compose(SPONSOR, U256::from(fragment));
        serde_json::from_value(json!({
            "arbiter": "0x70997970C51812dc3A010C7d01b50e0d17dc79C8",
            "sponsor": SPONSOR.to_checksum(None),
            "nonce": format!("0x{nonce:064x}"),
            "expires": expires().to_string(),
            "id": format!("0x{:064x}", lock_id()),
            "amount": amount,
        }))
        .unwrap()
    }

    fn batch_payload(order: [(u8, &str); 2], fragment: u64) -> CompactPayload {
        let nonce = nonce::compose(SPONSOR, U256::from(fragment));
        let commitments: Vec<_> = order
            .iter()
            .map(|(token_byte, amount)| {
                json!({
                    "lockTag": LOCK_TAG,
                    "token": format!("0x{:038x}{:02x}", 0, token_byte),
                    "amount": amount,
                })
            })
            .collect();
        serde_json::from_value(json!({
            "arbiter": "0x70997970C51812dc3A010C7d01b50e0d17dc79C8",
            "sponsor": SPONSOR.to_checksum(None),
            "nonce": format!("0x{nonce:064x}"),
            "expires": expires().to_string(),
            "commitments": commitments,
        }))
        .unwrap()
    }

    fn sponsor_sign(payload: &CompactPayload, chain_id: &str) -> Bytes {
        let now = UnixTimestamp::try_now().unwrap();
        let compact = validator::validate(chain_id, payload, now).unwrap();
        let claim_hash = hash::claim_hash(&compact).unwrap();
        let digest = hash::digest(compact.chain_id, claim_hash);
        let signer = PrivateKeySigner::from_str(SPONSOR_KEY).unwrap();
        let signature = signer.sign_hash_sync(&digest).unwrap();
        Bytes::from(crate::signer::erc2098(&signature).to_vec())
    }

    #[tokio::test]
    async fn happy_path_single_allocation() {
        let h = harness().await;
        h.indexer.set_lock(
            SPONSOR,
            CHAIN,
            lock_id(),
            U256::from(10u64).pow(U256::from(21u64)),
            0,
        );

        let payload = single_payload("1000000000000000000", 0);
        let signature = sponsor_sign(&payload, "10");
        let outcome = h.engine.submit("10", &payload, Some(&signature)).await.unwrap();

        assert_eq!(outcome.nonce, nonce::compose(SPONSOR, U256::ZERO));
        assert_eq!(outcome.signature.len(), 64);
        assert_eq!(outcome.authorization, SponsorAuthorization::Signature);

        let stored = h
            .store
            .find_by_chain_and_claim_hash(CHAIN, outcome.claim_hash)
            .await
            .unwrap()
            .expect("compact persisted");
        assert_eq!(stored.sponsor, SPONSOR);
        assert!(
            h.store
                .nonce_consumed(CHAIN, SPONSOR, outcome.nonce)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn replayed_nonce_is_rejected() {
        let h = harness().await;
        h.indexer.set_lock(
            SPONSOR,
            CHAIN,
            lock_id(),
            U256::from(10u64).pow(U256::from(21u64)),
            0,
        );

        let payload = single_payload("1000000000000000000", 0);
        let signature = sponsor_sign(&payload, "10");
        h.engine.submit("10", &payload, Some(&signature)).await.unwrap();

        let result = h.engine.submit("10", &payload, Some(&signature)).await;
        assert!(matches!(
            result,
            Err(AllocationError::Nonce(NonceError::Replay(_)))
        ));
    }

    #[tokio::test]
    async fn batch_claim_hash_ignores_commitment_order() {
        let now = UnixTimestamp::try_now().unwrap();
        let forward = batch_payload([(1, "100"), (2, "200")], 0);
        let backward = batch_payload([(2, "200"), (1, "100")], 0);
        let forward_hash =
            hash::claim_hash(&validator::validate("10", &forward, now).unwrap()).unwrap();
        let backward_hash =
            hash::claim_hash(&validator::validate("10", &backward, now).unwrap()).unwrap();
        assert_eq!(forward_hash, backward_hash);
    }

    #[tokio::test]
    async fn overallocation_reports_have_and_need() {
        let h = harness().await;
        let e18 = U256::from(10u64).pow(U256::from(18u64));
        h.indexer
            .set_lock(SPONSOR, CHAIN, lock_id(), e18 * U256::from(2u64), 0);

        // Prior outstanding commitment of 1.5e18.
        let prior = single_payload("1500000000000000000", 0);
        let prior_sig = sponsor_sign(&prior, "10");
        h.engine.submit("10", &prior, Some(&prior_sig)).await.unwrap();

        let over = single_payload("1000000000000000000", 1);
        let over_sig = sponsor_sign(&over, "10");
        let result = h.engine.submit("10", &over, Some(&over_sig)).await;
        match result {
            Err(AllocationError::Balance(BalanceError::InsufficientBalance {
                have,
                need,
                ..
            })) => {
                assert_eq!(have, e18 / U256::from(2u64));
                assert_eq!(need, e18);
            }
            other => panic!("expected InsufficientBalance, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_submissions_admit_exactly_one_when_capacity_allows_one() {
        let h = harness().await;
        h.indexer
            .set_lock(SPONSOR, CHAIN, lock_id(), U256::from(1_000u64), 0);

        let first = single_payload("600", 0);
        let second = single_payload("600", 1);
        let first_sig = sponsor_sign(&first, "10");
        let second_sig = sponsor_sign(&second, "10");

        let engine_a = Arc::clone(&h.engine);
        let engine_b = Arc::clone(&h.engine);
        let (a, b) = tokio::join!(
            async move { engine_a.submit("10", &first, Some(&first_sig)).await },
            async move { engine_b.submit("10", &second, Some(&second_sig)).await },
        );

        let successes = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(successes, 1, "exactly one submission must win");
        let failure = if a.is_ok() { b } else { a };
        assert!(matches!(
            failure,
            Err(AllocationError::Balance(BalanceError::InsufficientBalance { .. }))
        ));
    }

    #[tokio::test]
    async fn forced_withdrawal_rejects_without_store_mutation() {
        let h = harness().await;
        h.indexer
            .set_lock(SPONSOR, CHAIN, lock_id(), U256::from(1_000u64), 1);

        let payload = single_payload("100", 0);
        let signature = sponsor_sign(&payload, "10");
        let result = h.engine.submit("10", &payload, Some(&signature)).await;
        assert!(matches!(
            result,
            Err(AllocationError::Balance(BalanceError::ForcedWithdrawal { .. }))
        ));
        assert!(h.store.list_by_sponsor(SPONSOR).await.unwrap().is_empty());
        assert!(
            !h.store
                .nonce_consumed(CHAIN, SPONSOR, nonce::compose(SPONSOR, U256::ZERO))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn bad_sponsor_signature_is_rejected_before_persisting() {
        let h = harness().await;
        h.indexer
            .set_lock(SPONSOR, CHAIN, lock_id(), U256::from(1_000u64), 0);

        let payload = single_payload("100", 0);
        // Allocator key signs instead of the sponsor.
        let wrong_signer = PrivateKeySigner::from_str(ALLOCATOR_KEY).unwrap();
        let digest = keccak256(b"unrelated");
        let wrong = Bytes::from(
            crate::signer::erc2098(&wrong_signer.sign_hash_sync(&digest).unwrap()).to_vec(),
        );

        let result = h.engine.submit("10", &payload, Some(&wrong)).await;
        assert!(matches!(result, Err(AllocationError::Auth(_))));
        assert!(h.store.list_by_sponsor(SPONSOR).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn onchain_registration_substitutes_for_a_signature() {
        let h = harness().await;
        h.indexer
            .set_lock(SPONSOR, CHAIN, lock_id(), U256::from(1_000u64), 0);

        let payload = single_payload("100", 0);
        let now = UnixTimestamp::try_now().unwrap();
        let compact = validator::validate("10", &payload, now).unwrap();
        let claim_hash = hash::claim_hash(&compact).unwrap();
        h.indexer.register_compact(
            SPONSOR,
            CHAIN,
            claim_hash,
            crate::indexer::RegisteredCompact {
                sponsor: SPONSOR,
                expires: compact.expires,
                typehash: B256::ZERO,
                claim: None,
            },
        );

        let outcome = h.engine.submit("10", &payload, None).await.unwrap();
        assert_eq!(
            outcome.authorization,
            SponsorAuthorization::OnchainRegistration
        );
    }

    #[tokio::test]
    async fn is_allocatable_precheck_has_no_side_effects() {
        let h = harness().await;
        h.indexer
            .set_lock(SPONSOR, CHAIN, lock_id(), U256::from(1_000u64), 0);

        let payload = single_payload("100", 0);
        let compact = h.engine.is_allocatable("10", &payload).await.unwrap();
        assert_eq!(compact.sponsor, SPONSOR);
        assert!(h.store.list_by_sponsor(SPONSOR).await.unwrap().is_empty());

        let over = single_payload("5000", 1);
        assert!(matches!(
            h.engine.is_allocatable("10", &over).await,
            Err(AllocationError::Balance(BalanceError::InsufficientBalance { .. }))
        ));
    }

    #[tokio::test]
    async fn balance_conservation_across_sequential_allocations() {
        let h = harness().await;
        h.indexer
            .set_lock(SPONSOR, CHAIN, lock_id(), U256::from(1_000u64), 0);

        let mut allocated = U256::ZERO;
        for fragment in 0..4u64 {
            let payload = single_payload("300", fragment);
            let signature = sponsor_sign(&payload, "10");
            match h.engine.submit("10", &payload, Some(&signature)).await {
                Ok(_) => allocated += U256::from(300u64),
                Err(AllocationError::Balance(BalanceError::InsufficientBalance {
                    have, ..
                })) => {
                    assert_eq!(have, U256::from(100u64));
                    break;
                }
                Err(other) => panic!("unexpected error {other:?}"),
            }
        }
        assert_eq!(allocated, U256::from(900u64));
    }
}
