//! Wire format and core data model for compacts.
//!
//! This module provides the types that cross the HTTP boundary and the
//! normalized internal representations the engines operate on. Numeric wire
//! conventions: 256-bit integers arrive as decimal or `0x…` hex strings and
//! leave as zero-padded hex, except amounts which stay decimal in both
//! directions. Addresses leave in EIP-55 checksum form.

use alloy_primitives::{Address, B256, Bytes, FixedBytes, U256, hex};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::{SystemTime, SystemTimeError};

/// An Ethereum address that serializes with EIP-55 checksum encoding.
///
/// Inbound values are accepted in any hex casing that parses as 20 bytes;
/// outbound values are always checksummed (e.g.
/// `0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266`).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ChecksummedAddress(pub Address);

impl FromStr for ChecksummedAddress {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let address = Address::from_str(s)?;
        Ok(Self(address))
    }
}

impl Display for ChecksummedAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_checksum(None))
    }
}

impl Serialize for ChecksummedAddress {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_checksum(None))
    }
}

impl<'de> Deserialize<'de> for ChecksummedAddress {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl From<ChecksummedAddress> for Address {
    fn from(value: ChecksummedAddress) -> Self {
        value.0
    }
}

impl From<Address> for ChecksummedAddress {
    fn from(address: Address) -> Self {
        Self(address)
    }
}

fn u256_from_dec_or_hex(s: &str) -> Result<U256, String> {
    let parsed = if let Some(stripped) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        U256::from_str_radix(stripped, 16)
    } else {
        U256::from_str_radix(s, 10)
    };
    parsed.map_err(|e| format!("invalid uint256 {s:?}: {e}"))
}

/// A `U256` that serializes as a decimal string.
///
/// Used for token amounts, which remain decimal on both ingress and egress.
/// Ingress additionally accepts `0x…` hex.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DecimalU256(pub U256);

impl Serialize for DecimalU256 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for DecimalU256 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        u256_from_dec_or_hex(&s)
            .map(DecimalU256)
            .map_err(serde::de::Error::custom)
    }
}

impl From<U256> for DecimalU256 {
    fn from(value: U256) -> Self {
        Self(value)
    }
}

impl From<DecimalU256> for U256 {
    fn from(value: DecimalU256) -> Self {
        value.0
    }
}

/// A `U256` that serializes as `0x` plus 64 zero-padded hex characters.
///
/// Used for nonces and lock ids. Ingress accepts decimal or hex.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct HexU256(pub U256);

impl Display for HexU256 {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:064x}", self.0)
    }
}

impl Serialize for HexU256 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for HexU256 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        u256_from_dec_or_hex(&s)
            .map(HexU256)
            .map_err(serde::de::Error::custom)
    }
}

impl From<U256> for HexU256 {
    fn from(value: U256) -> Self {
        Self(value)
    }
}

impl From<HexU256> for U256 {
    fn from(value: HexU256) -> Self {
        value.0
    }
}

/// The 12-byte lock tag: `(scope: 1 bit, resetPeriod: 3 bits, allocatorId: 92 bits)`.
///
/// Together with a token address it forms the 32-byte lock id
/// `(lockTag << 160) | token` that identifies a resource lock on-chain.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct LockTag(pub FixedBytes<12>);

impl LockTag {
    /// Composes the 32-byte lock id from this tag and a token address.
    pub fn lock_id(&self, token: Address) -> U256 {
        let tag = U256::from_be_slice(self.0.as_slice());
        let token = U256::from_be_slice(token.as_slice());
        (tag << 160) | token
    }

    /// Extracts the 92-bit allocator id: `(lockTag >> 4) & (2^92 − 1)`.
    pub fn allocator_id(&self) -> U256 {
        let tag = U256::from_be_slice(self.0.as_slice());
        (tag >> 4) & (U256::MAX >> (256 - 92))
    }

    /// Splits a 32-byte lock id back into its tag and token halves.
    pub fn split_lock_id(lock_id: U256) -> (LockTag, Address) {
        let bytes = lock_id.to_be_bytes::<32>();
        let tag = LockTag(FixedBytes::<12>::from_slice(&bytes[0..12]));
        let token = Address::from_slice(&bytes[12..32]);
        (tag, token)
    }
}

impl Display for LockTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(self.0.as_slice()))
    }
}

impl FromStr for LockTag {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let inner = FixedBytes::<12>::from_str(s)?;
        Ok(Self(inner))
    }
}

impl Serialize for LockTag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for LockTag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Seconds since the Unix epoch, read from the system clock.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Ord, Eq)]
pub struct UnixTimestamp(pub u64);

impl UnixTimestamp {
    pub fn try_now() -> Result<Self, SystemTimeError> {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)?
            .as_secs();
        Ok(Self(now))
    }

    pub fn as_u256(&self) -> U256 {
        U256::from(self.0)
    }
}

impl Display for UnixTimestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The three compact shapes, tagged 0/1/2 in the store.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CompactVariant {
    /// One lock, one amount, identified by a composite `id`.
    Single,
    /// One arbiter, several lock commitments on a single chain.
    Batch,
    /// One element per chain, each with its own arbiter and witness hash.
    Multichain,
}

impl CompactVariant {
    pub fn tag(&self) -> u8 {
        match self {
            CompactVariant::Single => 0,
            CompactVariant::Batch => 1,
            CompactVariant::Multichain => 2,
        }
    }
}

impl Display for CompactVariant {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactVariant::Single => write!(f, "single"),
            CompactVariant::Batch => write!(f, "batch"),
            CompactVariant::Multichain => write!(f, "multichain"),
        }
    }
}

/// Body of `POST /compact` and `POST /compact/is-allocatable`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactRequest {
    /// Notarization chain id as a decimal string.
    pub chain_id: String,
    pub compact: CompactPayload,
    /// Sponsor signature over the compact digest, 64-byte EIP-2098 or
    /// 65-byte `r‖s‖v`, hex-encoded. Absent for sponsors registered on-chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sponsor_signature: Option<Bytes>,
}

/// A compact as submitted by a sponsor, shape-discriminated:
/// `elements` → multichain, `commitments` → batch, otherwise single.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CompactPayload {
    Multichain(MultichainCompactPayload),
    Batch(BatchCompactPayload),
    Single(SingleCompactPayload),
}

impl CompactPayload {
    pub fn variant(&self) -> CompactVariant {
        match self {
            CompactPayload::Single(_) => CompactVariant::Single,
            CompactPayload::Batch(_) => CompactVariant::Batch,
            CompactPayload::Multichain(_) => CompactVariant::Multichain,
        }
    }

    pub fn sponsor(&self) -> Address {
        match self {
            CompactPayload::Single(p) => p.sponsor.0,
            CompactPayload::Batch(p) => p.sponsor.0,
            CompactPayload::Multichain(p) => p.sponsor.0,
        }
    }

    pub fn nonce(&self) -> Option<U256> {
        match self {
            CompactPayload::Single(p) => p.nonce.map(|n| n.0),
            CompactPayload::Batch(p) => p.nonce.map(|n| n.0),
            CompactPayload::Multichain(p) => p.nonce.map(|n| n.0),
        }
    }
}

/// Variant 0: a single commitment addressed by its composite lock id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleCompactPayload {
    pub arbiter: ChecksummedAddress,
    pub sponsor: ChecksummedAddress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<HexU256>,
    pub expires: DecimalU256,
    /// The 32-byte lock id `(lockTag << 160) | token`.
    pub id: HexU256,
    pub amount: DecimalU256,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub witness_type_string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub witness_hash: Option<B256>,
}

/// Variant 1: several commitments under one arbiter on one chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchCompactPayload {
    pub arbiter: ChecksummedAddress,
    pub sponsor: ChecksummedAddress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<HexU256>,
    pub expires: DecimalU256,
    pub commitments: Vec<CommitmentPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub witness_type_string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub witness_hash: Option<B256>,
}

/// Variant 2: one element per lock-location chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultichainCompactPayload {
    pub sponsor: ChecksummedAddress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<HexU256>,
    pub expires: DecimalU256,
    pub elements: Vec<ElementPayload>,
    /// Witness type string shared by every element's mandate.
    pub witness_type_string: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementPayload {
    pub arbiter: ChecksummedAddress,
    /// Lock-location chain id as a decimal string.
    pub chain_id: String,
    pub commitments: Vec<CommitmentPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub witness_hash: Option<B256>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitmentPayload {
    pub lock_tag: LockTag,
    pub token: ChecksummedAddress,
    pub amount: DecimalU256,
}

/// A compact after structural validation, normalized to one shape.
///
/// Variants 0 and 1 carry exactly one element whose `chain_id` equals the
/// notarization chain; the single variant's element holds one commitment
/// decomposed from the composite `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedCompact {
    pub variant: CompactVariant,
    /// Notarization chain: its domain separator notarizes the digest.
    pub chain_id: u64,
    pub sponsor: Address,
    pub nonce: U256,
    pub expires: U256,
    /// Witness type string; for variants 0/1 paired with `witness_hash`,
    /// for variant 2 required whenever elements carry mandate hashes.
    pub witness_type_string: Option<String>,
    /// Root witness hash (variants 0 and 1 only).
    pub witness_hash: Option<B256>,
    pub elements: Vec<ValidatedElement>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedElement {
    pub arbiter: Address,
    /// Lock-location chain.
    pub chain_id: u64,
    pub commitments: Vec<ValidatedCommitment>,
    /// Per-element witness hash (variant 2 only).
    pub mandate_hash: Option<B256>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidatedCommitment {
    pub lock_tag: LockTag,
    pub token: Address,
    pub amount: U256,
}

impl ValidatedCommitment {
    pub fn lock_id(&self) -> U256 {
        self.lock_tag.lock_id(self.token)
    }
}

impl ValidatedCompact {
    /// All `(chain_id, commitment)` pairs of the submission, element order.
    pub fn commitments(&self) -> impl Iterator<Item = (u64, &ValidatedCommitment)> {
        self.elements
            .iter()
            .flat_map(|e| e.commitments.iter().map(move |c| (e.chain_id, c)))
    }
}

/// Egress view of a validated compact, returned by `/compact/is-allocatable`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatedCompactView {
    pub variant: String,
    pub chain_id: String,
    pub sponsor: ChecksummedAddress,
    pub nonce: HexU256,
    pub expires: DecimalU256,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub witness_type_string: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub witness_hash: Option<B256>,
    pub elements: Vec<ValidatedElementView>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatedElementView {
    pub arbiter: ChecksummedAddress,
    pub chain_id: String,
    pub commitments: Vec<ValidatedCommitmentView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub witness_hash: Option<B256>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatedCommitmentView {
    pub lock_tag: LockTag,
    pub token: ChecksummedAddress,
    pub amount: DecimalU256,
    pub lock_id: HexU256,
}

impl From<&ValidatedCompact> for ValidatedCompactView {
    fn from(compact: &ValidatedCompact) -> Self {
        ValidatedCompactView {
            variant: compact.variant.to_string(),
            chain_id: compact.chain_id.to_string(),
            sponsor: compact.sponsor.into(),
            nonce: compact.nonce.into(),
            expires: compact.expires.into(),
            witness_type_string: compact.witness_type_string.clone(),
            witness_hash: compact.witness_hash,
            elements: compact
                .elements
                .iter()
                .map(|e| ValidatedElementView {
                    arbiter: e.arbiter.into(),
                    chain_id: e.chain_id.to_string(),
                    commitments: e
                        .commitments
                        .iter()
                        .map(|c| ValidatedCommitmentView {
                            lock_tag: c.lock_tag,
                            token: c.token.into(),
                            amount: c.amount.into(),
                            lock_id: c.lock_id().into(),
                        })
                        .collect(),
                    witness_hash: e.mandate_hash,
                })
                .collect(),
        }
    }
}
