// src/crypto.rs
// Signature capabilities consumed by the stake-based strategies.
// The core never defines the algorithm; it is handed a verifier (and,
// for block production, a signer).

use crate::chain::Address;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use parking_lot::RwLock;
use std::collections::HashMap;

pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, message: &[u8], signature: &[u8], public_key: &[u8]) -> bool;
}

/// Produces a producer signature over a block hash.
pub trait BlockSigner: Send + Sync {
    /// None when no key is held for `signer`.
    fn sign(&self, signer: &str, message: &[u8]) -> Option<Vec<u8>>;
}

/// Ed25519 verifier (32-byte public keys, 64-byte signatures).
#[derive(Debug, Default, Clone, Copy)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, message: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
        verify_bytes(public_key, message, signature)
    }
}

/// Verify a signature over `msg` using `pubkey` (32 bytes) and signature bytes.
pub fn verify_bytes(pubkey: &[u8], msg: &[u8], sig_bytes: &[u8]) -> bool {
    let Ok(pubkey_array) = <&[u8; 32]>::try_from(pubkey) else {
        return false;
    };
    let Ok(vk) = VerifyingKey::from_bytes(pubkey_array) else {
        return false;
    };
    let Ok(sig_array) = <&[u8; 64]>::try_from(sig_bytes) else {
        return false;
    };
    let sig = Signature::from_bytes(sig_array);
    vk.verify(msg, &sig).is_ok()
}

/// Sign `msg` with a 32-byte secret seed. None for an invalid seed length.
pub fn sign_bytes(secret_seed: &[u8], msg: &[u8]) -> Option<Vec<u8>> {
    let seed_array = <&[u8; 32]>::try_from(secret_seed).ok()?;
    let sk = SigningKey::from_bytes(seed_array);
    let sig: Signature = sk.sign(msg);
    Some(sig.to_bytes().to_vec())
}

/// Derive verifying (public) key bytes from a 32-byte seed.
pub fn public_from_seed(seed: &[u8]) -> Option<Vec<u8>> {
    let seed_array = <&[u8; 32]>::try_from(seed).ok()?;
    let sk = SigningKey::from_bytes(seed_array);
    Some(VerifyingKey::from(&sk).to_bytes().to_vec())
}

/// In-memory ed25519 keyring: address -> 32-byte seed.
#[derive(Default)]
pub struct Keyring {
    seeds: RwLock<HashMap<Address, [u8; 32]>>,
}

impl Keyring {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a seed and return the derived public key.
    pub fn insert(&self, address: &str, seed: [u8; 32]) -> Vec<u8> {
        self.seeds.write().insert(address.to_string(), seed);
        VerifyingKey::from(&SigningKey::from_bytes(&seed))
            .to_bytes()
            .to_vec()
    }

    pub fn public_key(&self, address: &str) -> Option<Vec<u8>> {
        let seeds = self.seeds.read();
        let seed = seeds.get(address)?;
        public_from_seed(seed)
    }
}

impl BlockSigner for Keyring {
    fn sign(&self, signer: &str, message: &[u8]) -> Option<Vec<u8>> {
        let seeds = self.seeds.read();
        sign_bytes(seeds.get(signer)?, message)
    }
}
