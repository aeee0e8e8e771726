//! hashing and signing primitives for the feed
//!
//! All tree hashing is SHA-256 with a single domain byte so that a leaf, an
//! interior node and a root summary can never be confused for one another.
//! Sizes and indices are mixed in as big-endian u64. The discovery key is an
//! HMAC under the feed's public key, which lets a feed be advertised without
//! revealing the key itself.
use crate::error::{Error, Result};
use crate::storage::Node;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

pub type Hash = [u8; 32];

type HmacSha256 = Hmac<Sha256>;

const LEAF_TYPE: [u8; 1] = [0];
const PARENT_TYPE: [u8; 1] = [1];
const ROOT_TYPE: [u8; 1] = [2];
const DISCOVERY_LABEL: &[u8] = b"canopy";

/// hash of a single block of data
pub fn leaf(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(LEAF_TYPE);
    hasher.update((data.len() as u64).to_be_bytes());
    hasher.update(data);
    hasher.finalize().into()
}

/// Hash of an interior node over its two children.
///
/// The children are ordered by index, so callers may pass them either way.
pub fn parent(a: &Node, b: &Node) -> Hash {
    let (left, right) = if a.index < b.index { (a, b) } else { (b, a) };
    let mut hasher = Sha256::new();
    hasher.update(PARENT_TYPE);
    hasher.update((left.size + right.size).to_be_bytes());
    hasher.update(left.hash);
    hasher.update(right.hash);
    hasher.finalize().into()
}

/// summary hash over a full root set, the message that signatures cover
pub fn tree_root(roots: &[Node]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(ROOT_TYPE);
    for root in roots {
        hasher.update(root.hash);
        hasher.update(root.index.to_be_bytes());
        hasher.update(root.size.to_be_bytes());
    }
    hasher.finalize().into()
}

/// keyed hash of the fixed label under the feed's public key
pub fn discovery_key(key: &[u8; 32]) -> Hash {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(DISCOVERY_LABEL);
    mac.finalize().into_bytes().into()
}

/// sign a message with the feed's secret key
pub fn sign(secret: &SigningKey, message: &[u8]) -> [u8; 64] {
    secret.sign(message).to_bytes()
}

/// Verify a detached signature against a 32-byte public key.
///
/// Fails with [Error::InvalidProof] on a bad key or a bad signature.
pub fn verify(key: &[u8; 32], message: &[u8], signature: &[u8]) -> Result<()> {
    let key = VerifyingKey::from_bytes(key).map_err(|_| Error::InvalidProof("bad public key"))?;
    let signature = Signature::from_slice(signature)
        .map_err(|_| Error::InvalidProof("malformed signature"))?;
    key.verify(message, &signature)
        .map_err(|_| Error::InvalidProof("bad signature"))
}

/// fresh Ed25519 key pair; returns the public key bytes alongside the secret
pub fn generate_keypair() -> ([u8; 32], SigningKey) {
    let secret = SigningKey::generate(&mut rand::rngs::OsRng);
    (secret.verifying_key().to_bytes(), secret)
}
