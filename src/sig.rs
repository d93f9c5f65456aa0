//! Handles the creation and verification of (Ethereum) Signatures.
//!
//! The channel logic only sees the [Account] trait, so any wallet that can
//! produce Ethereum signed-message signatures can be plugged in.

use crate::abiencode::types::{Address, Hash, Signature};
use core::fmt::Debug;
use sha3::{Digest, Keccak256};

mod k256;
pub use self::k256::{recover_signer, Error, Signer};


/// Signing capability of a single channel participant.
///
/// Implementations must be reentrant: the same account may sign for several
/// channels concurrently.
pub trait Account: Debug + Send + Sync {
    /// Off-chain address the signatures recover to.
    fn address(&self) -> Address;
    /// Sign `msg` in the `\x19Ethereum Signed Message` format.
    fn sign_eth(&self, msg: Hash) -> Signature;
}

/// Returns true iff `sig` is a signature of `signer` on `msg`.
pub fn verify(signer: Address, msg: Hash, sig: Signature) -> bool {
    matches!(recover_signer(msg, sig), Ok(addr) if addr == signer)
}

/// Add the `\x19Ethereum Signed Message\n<length>` prefix to hash.
///
/// This is the format expected by the Solidity contracts.
fn hash_to_eth_signed_msg_hash(hash: Hash) -> Hash {
    // Packed encoding => We can't use the abi encoder
    let mut hasher = Keccak256::new();
    hasher.update(b"\x19Ethereum Signed Message:\n32");
    hasher.update(hash.0);
    Hash(hasher.finalize().into())
}
