//! The allocator's signing key.
//!
//! Holds the secp256k1 key loaded from the environment at startup and
//! produces EIP-2098 compact signatures (`r ‖ (v << 255 | s)`, 64 bytes)
//! over compact digests. The configured allocator address must match the
//! key-derived address; a mismatch is a fatal startup error unless the
//! operator explicitly skips verification.

use alloy_primitives::{Address, B256, Bytes, Signature, U256};
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("invalid allocator private key: {0}")]
    InvalidKey(String),
    #[error("allocator address mismatch: configured {configured}, key derives {derived}")]
    AddressMismatch { configured: Address, derived: Address },
    #[error("signing failed: {0}")]
    Signing(String),
}

/// Signs compact digests with the allocator key.
///
/// The key is immutable after startup; `sign_digest` is the only signing
/// surface the rest of the system sees.
#[derive(Clone, Debug)]
pub struct AllocatorSigner {
    signer: PrivateKeySigner,
    address: Address,
}

impl AllocatorSigner {
    /// Loads the key and checks it against the configured allocator address.
    pub fn new(
        private_key: &str,
        configured_address: Option<Address>,
        skip_verification: bool,
    ) -> Result<Self, SignerError> {
        let signer = PrivateKeySigner::from_str(private_key)
            .map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        let derived = signer.address();
        if let Some(configured) = configured_address {
            if configured != derived && !skip_verification {
                return Err(SignerError::AddressMismatch {
                    configured,
                    derived,
                });
            }
        }
        Ok(Self {
            signer,
            address: derived,
        })
    }

    /// The key-derived allocator address.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Signs a 32-byte digest, returning the 64-byte EIP-2098 encoding.
    pub fn sign_digest(&self, digest: B256) -> Result<Bytes, SignerError> {
        let signature = self
            .signer
            .sign_hash_sync(&digest)
            .map_err(|e| SignerError::Signing(e.to_string()))?;
        Ok(Bytes::from(erc2098(&signature).to_vec()))
    }
}

/// Packs a signature as EIP-2098: `r ‖ (yParity << 255 | s)`.
pub fn erc2098(signature: &Signature) -> [u8; 64] {
    let mut out = [0u8; 64];
    out[0..32].copy_from_slice(&signature.r().to_be_bytes::<32>());
    let mut vs = signature.s();
    if signature.v() {
        vs |= U256::ONE << 255;
    }
    out[32..64].copy_from_slice(&vs.to_be_bytes::<32>());
    out
}
