//! HTTP endpoints exposed by the allocator.
//!
//! This is the only layer that knows about status codes: the engines return
//! typed errors and the [`ApiError`] conversion maps each class to its HTTP
//! status. Ingress integers arrive as decimal or hex strings, egress values
//! leave as zero-padded hex except amounts, which stay decimal.

use alloy_primitives::{Address, B256, Bytes, U256};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;
use tracing::instrument;

use crate::allocation::{AllocationEngine, AllocationError};
use crate::balance::BalanceError;
use crate::indexer::Indexer;
use crate::nonce::NonceError;
use crate::sponsor::AuthError;
use crate::store::{Store, StoreError, StoredCompact};
use crate::types::{
    ChecksummedAddress, CompactRequest, DecimalU256, HexU256, LockTag, UnixTimestamp,
    ValidatedCompactView,
};
use crate::validator::{ValidationError, parse_chain_id};

/// Shared state behind every handler.
pub struct AppState<I, S> {
    pub engine: AllocationEngine<I, S>,
    pub store: Arc<S>,
    pub indexer: Arc<I>,
}

/// An error ready for the wire: a status code and a JSON `{"error": …}` body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<ValidationError> for ApiError {
    fn from(error: ValidationError) -> Self {
        ApiError::bad_request(error.to_string())
    }
}

impl From<AllocationError> for ApiError {
    fn from(error: AllocationError) -> Self {
        let status = allocation_status(&error);
        ApiError::new(status, error.to_string())
    }
}

fn allocation_status(error: &AllocationError) -> StatusCode {
    match error {
        AllocationError::Validation(_) | AllocationError::Batch(_) => StatusCode::BAD_REQUEST,
        AllocationError::Nonce(nonce) => match nonce {
            NonceError::Indexer(_) => StatusCode::BAD_GATEWAY,
            NonceError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        },
        AllocationError::Auth(auth) => match auth {
            AuthError::InvalidSponsor(_) => StatusCode::FORBIDDEN,
            AuthError::Indexer(_) => StatusCode::BAD_GATEWAY,
        },
        AllocationError::Balance(balance) => balance_status(balance),
        AllocationError::Store(StoreError::Duplicate { .. }) => StatusCode::CONFLICT,
        AllocationError::Store(_) | AllocationError::Signer(_) | AllocationError::Clock => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn balance_status(error: &BalanceError) -> StatusCode {
    match error {
        BalanceError::Indexer(_) => StatusCode::BAD_GATEWAY,
        BalanceError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    }
}

pub fn routes<I, S>() -> Router<Arc<AppState<I, S>>>
where
    I: Indexer,
    S: Store,
{
    Router::new()
        .route("/", get(get_root))
        .route("/health", get(get_health::<I, S>))
        .route(
            "/suggested-nonce/{chain_id}/{account}",
            get(get_suggested_nonce::<I, S>),
        )
        .route("/compact", post(post_compact::<I, S>))
        .route("/compact/is-allocatable", post(post_is_allocatable::<I, S>))
        .route("/compact/{chain_id}/{claim_hash}", get(get_compact::<I, S>))
        .route("/compacts/{account}", get(get_compacts::<I, S>))
        .route(
            "/balance/{chain_id}/{lock_id}/{account}",
            get(get_balance::<I, S>),
        )
        .route("/balances/{account}", get(get_balances::<I, S>))
}

/// `GET /`: service greeting.
#[instrument(skip_all)]
async fn get_root() -> impl IntoResponse {
    let pkg_name = env!("CARGO_PKG_NAME");
    (StatusCode::OK, format!("Hello from {pkg_name}!"))
}

/// `GET /health`: liveness plus the size of the supported-chain set.
#[instrument(skip_all)]
async fn get_health<I: Indexer, S: Store>(
    State(state): State<Arc<AppState<I, S>>>,
) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "supportedChains": state.engine.chains().len(),
    }))
}

#[derive(Debug, Serialize)]
struct SuggestedNonceResponse {
    nonce: HexU256,
}

/// `GET /suggested-nonce/:chainId/:account`
#[instrument(skip(state))]
async fn get_suggested_nonce<I: Indexer, S: Store>(
    State(state): State<Arc<AppState<I, S>>>,
    Path((chain_id, account)): Path<(String, String)>,
) -> Result<Json<SuggestedNonceResponse>, ApiError> {
    let chain_id = parse_chain_id(&chain_id)?;
    let sponsor = parse_account(&account)?;
    if !state.engine.chains().contains(chain_id) {
        return Err(ApiError::bad_request(format!(
            "chain {chain_id} is not supported by this allocator"
        )));
    }
    let nonce = state
        .engine
        .nonces()
        .suggest(sponsor, chain_id)
        .await
        .map_err(|e| ApiError::from(AllocationError::from(e)))?;
    Ok(Json(SuggestedNonceResponse {
        nonce: nonce.into(),
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CompactResponse {
    hash: B256,
    signature: Bytes,
    nonce: HexU256,
}

/// `POST /compact`: the submission endpoint.
#[instrument(skip_all)]
async fn post_compact<I: Indexer, S: Store>(
    State(state): State<Arc<AppState<I, S>>>,
    body: Result<Json<CompactRequest>, JsonRejection>,
) -> Result<Json<CompactResponse>, ApiError> {
    let Json(body) = body.map_err(reject_body)?;
    let outcome = state
        .engine
        .submit(&body.chain_id, &body.compact, body.sponsor_signature.as_ref())
        .await
        .inspect_err(|error| {
            tracing::warn!(error = %error, chain_id = %body.chain_id, "compact rejected");
        })?;
    Ok(Json(CompactResponse {
        hash: outcome.claim_hash,
        signature: outcome.signature,
        nonce: outcome.nonce.into(),
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IsAllocatableResponse {
    is_allocatable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    validated_compact: Option<ValidatedCompactView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// `POST /compact/is-allocatable`: side-effect-free viability check.
#[instrument(skip_all)]
async fn post_is_allocatable<I: Indexer, S: Store>(
    State(state): State<Arc<AppState<I, S>>>,
    body: Result<Json<CompactRequest>, JsonRejection>,
) -> Response {
    let body = match body {
        Ok(Json(body)) => body,
        Err(rejection) => return reject_body(rejection).into_response(),
    };
    match state.engine.is_allocatable(&body.chain_id, &body.compact).await {
        Ok(compact) => Json(IsAllocatableResponse {
            is_allocatable: true,
            validated_compact: Some(ValidatedCompactView::from(&compact)),
            error: None,
        })
        .into_response(),
        Err(error) => {
            let status = allocation_status(&error);
            (
                status,
                Json(IsAllocatableResponse {
                    is_allocatable: false,
                    validated_compact: None,
                    error: Some(error.to_string()),
                }),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CompactRecordView {
    id: u64,
    variant: u8,
    chain_id: String,
    claim_hash: B256,
    sponsor: ChecksummedAddress,
    nonce: HexU256,
    expires: DecimalU256,
    signature: Bytes,
    #[serde(skip_serializing_if = "Option::is_none")]
    sponsor_signature: Option<Bytes>,
    #[serde(skip_serializing_if = "Option::is_none")]
    witness_type_string: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    witness_hash: Option<B256>,
    elements: Vec<ElementRecordView>,
    created_at: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ElementRecordView {
    element_index: u32,
    arbiter: ChecksummedAddress,
    chain_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    mandate_hash: Option<B256>,
    commitments: Vec<CommitmentRecordView>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CommitmentRecordView {
    lock_tag: LockTag,
    token: ChecksummedAddress,
    amount: DecimalU256,
    lock_id: HexU256,
}

impl From<StoredCompact> for CompactRecordView {
    fn from(compact: StoredCompact) -> Self {
        CompactRecordView {
            id: compact.id,
            variant: compact.variant,
            chain_id: compact.chain_id.to_string(),
            claim_hash: compact.claim_hash,
            sponsor: compact.sponsor.into(),
            nonce: compact.nonce.into(),
            expires: compact.expires.into(),
            signature: compact.signature,
            sponsor_signature: compact.sponsor_signature,
            witness_type_string: compact.witness_type_string,
            witness_hash: compact.witness_hash,
            elements: compact
                .elements
                .into_iter()
                .map(|element| ElementRecordView {
                    element_index: element.element_index,
                    arbiter: element.arbiter.into(),
                    chain_id: element.chain_id.to_string(),
                    mandate_hash: element.mandate_hash,
                    commitments: element
                        .commitments
                        .into_iter()
                        .map(|c| CommitmentRecordView {
                            lock_id: c.lock_id().into(),
                            lock_tag: c.lock_tag,
                            token: c.token.into(),
                            amount: c.amount.into(),
                        })
                        .collect(),
                })
                .collect(),
            created_at: compact.created_at,
        }
    }
}

/// `GET /compacts/:account`: a sponsor's compacts, newest first.
#[instrument(skip(state))]
async fn get_compacts<I: Indexer, S: Store>(
    State(state): State<Arc<AppState<I, S>>>,
    Path(account): Path<String>,
) -> Result<Json<Vec<CompactRecordView>>, ApiError> {
    let sponsor = parse_account(&account)?;
    let rows = state
        .store
        .list_by_sponsor(sponsor)
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(rows.into_iter().map(CompactRecordView::from).collect()))
}

/// `GET /compact/:chainId/:claimHash`: a single compact or 404.
#[instrument(skip(state))]
async fn get_compact<I: Indexer, S: Store>(
    State(state): State<Arc<AppState<I, S>>>,
    Path((chain_id, claim_hash)): Path<(String, String)>,
) -> Result<Json<CompactRecordView>, ApiError> {
    let chain_id = parse_chain_id(&chain_id)?;
    let claim_hash = B256::from_str(&claim_hash)
        .map_err(|_| ApiError::bad_request(format!("invalid claim hash {claim_hash:?}")))?;
    let row = state
        .store
        .find_by_chain_and_claim_hash(chain_id, claim_hash)
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .ok_or_else(|| ApiError::not_found("compact not found"))?;
    Ok(Json(row.into()))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BalanceResponse {
    allocatable_balance: DecimalU256,
    allocated_balance: DecimalU256,
    balance_available_to_allocate: DecimalU256,
    withdrawal_status: u8,
}

/// `GET /balance/:chainId/:lockId/:account`
#[instrument(skip(state))]
async fn get_balance<I: Indexer, S: Store>(
    State(state): State<Arc<AppState<I, S>>>,
    Path((chain_id, lock_id, account)): Path<(String, String, String)>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let chain_id = parse_chain_id(&chain_id)?;
    let lock_id = parse_uint(&lock_id, "lock id")?;
    let sponsor = parse_account(&account)?;
    let now = UnixTimestamp::try_now()
        .map_err(|_| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "clock unavailable"))?;

    let balance = state
        .engine
        .balances()
        .assess(sponsor, chain_id, lock_id, now.as_u256())
        .await
        .map_err(|error| match error {
            BalanceError::LockMissing { .. } => ApiError::not_found(error.to_string()),
            other => ApiError::new(balance_status(&other), other.to_string()),
        })?;

    Ok(Json(BalanceResponse {
        allocatable_balance: balance.allocatable.into(),
        allocated_balance: balance.outstanding.into(),
        balance_available_to_allocate: balance.available().into(),
        withdrawal_status: balance.withdrawal_status,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LockBalanceView {
    chain_id: String,
    lock_id: HexU256,
    allocatable_balance: DecimalU256,
    allocated_balance: DecimalU256,
    balance_available_to_allocate: DecimalU256,
    withdrawal_status: u8,
}

#[derive(Debug, Serialize)]
struct BalancesResponse {
    balances: Vec<LockBalanceView>,
}

/// `GET /balances/:account`: every lock of the sponsor held under this
/// allocator. Locks the engine refuses to price (forced withdrawal, indexer
/// gaps) are skipped with a warning rather than failing the whole listing.
#[instrument(skip(state))]
async fn get_balances<I: Indexer, S: Store>(
    State(state): State<Arc<AppState<I, S>>>,
    Path(account): Path<String>,
) -> Result<Json<BalancesResponse>, ApiError> {
    let sponsor = parse_account(&account)?;
    let now = UnixTimestamp::try_now()
        .map_err(|_| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "clock unavailable"))?;

    let listings = state
        .indexer
        .all_resource_locks(sponsor)
        .await
        .map_err(|e| ApiError::new(StatusCode::BAD_GATEWAY, e.to_string()))?;

    let allocator = state.engine.chains().allocator();
    let mut balances = Vec::new();
    for listing in listings
        .into_iter()
        .filter(|l| l.allocator_address == allocator)
    {
        match state
            .engine
            .balances()
            .assess(sponsor, listing.chain_id, listing.lock_id, now.as_u256())
            .await
        {
            Ok(balance) => balances.push(LockBalanceView {
                chain_id: listing.chain_id.to_string(),
                lock_id: listing.lock_id.into(),
                allocatable_balance: balance.allocatable.into(),
                allocated_balance: balance.outstanding.into(),
                balance_available_to_allocate: balance.available().into(),
                withdrawal_status: balance.withdrawal_status,
            }),
            Err(error) => {
                tracing::warn!(
                    chain_id = listing.chain_id,
                    lock_id = %format!("0x{:064x}", listing.lock_id),
                    error = %error,
                    "skipping lock in balances listing"
                );
            }
        }
    }
    Ok(Json(BalancesResponse { balances }))
}

fn reject_body(rejection: JsonRejection) -> ApiError {
    ApiError::bad_request(format!("malformed request body: {rejection}"))
}

fn parse_account(raw: &str) -> Result<Address, ApiError> {
    Address::from_str(raw).map_err(|_| ApiError::bad_request(format!("invalid address {raw:?}")))
}

fn parse_uint(raw: &str, what: &str) -> Result<U256, ApiError> {
    let parsed = if let Some(stripped) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        U256::from_str_radix(stripped, 16)
    } else {
        U256::from_str_radix(raw, 10)
    };
    parsed.map_err(|_| ApiError::bad_request(format!("invalid {what} {raw:?}")))
}
