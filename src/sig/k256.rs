//! Signer using the k256 Rust crate (implementation of ecdsa in Rust).

use super::{hash_to_eth_signed_msg_hash, Account};
use crate::abiencode::types::{Address, Hash, Signature};
use k256::{
    ecdsa::{
        recoverable,
        signature::{hazmat::PrehashSigner, Signature as k256Signature},
        SigningKey, VerifyingKey,
    },
    elliptic_curve::sec1::ToEncodedPoint,
};
use sha3::{Digest, Keccak256};

pub use k256::ecdsa::Error;

pub struct Signer {
    key: SigningKey,
    addr: Address,
}

// Never print the secret key.
impl core::fmt::Debug for Signer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Signer").field("addr", &self.addr).finish()
    }
}

impl From<VerifyingKey> for Address {
    fn from(key: VerifyingKey) -> Self {
        // An uncompressed secp256k1 point is always 65 bytes (0x04 || x || y).
        let point = key.to_encoded_point(false);
        let pk_bytes = point.as_bytes();

        // See https://ethereum.stackexchange.com/questions/65233/goethereum-getting-public-key-from-private-key-hex-formatting
        //
        // Throw away the first byte, which is not part of the public key. It is
        // added by the uncompressed SEC1 encoding.
        let hash: [u8; 32] = Keccak256::digest(&pk_bytes[1..]).into();

        let mut addr = Address([0; 20]);
        addr.0.copy_from_slice(&hash[32 - 20..]);
        addr
    }
}

impl Signer {
    pub fn new<R: rand::Rng + rand::CryptoRng>(rng: &mut R) -> Self {
        // Out-of-range scalars are astronomically unlikely, just draw again.
        loop {
            let secret: [u8; 32] = rng.gen();
            if let Ok(signer) = Self::from_secret_bytes(&secret) {
                return signer;
            }
        }
    }

    pub fn from_secret_bytes(secret: &[u8; 32]) -> Result<Self, Error> {
        let key = SigningKey::from_bytes(secret)?;
        let addr = key.verifying_key().into();
        Ok(Self { key, addr })
    }

    pub fn address(&self) -> Address {
        self.addr
    }

    pub fn sign_eth(&self, msg: Hash) -> Signature {
        // "\x19Ethereum Signed Message:\n32" format
        let hash = hash_to_eth_signed_msg_hash(msg);

        // Signing a 32 byte prehash with a valid key cannot fail.
        let sig: recoverable::Signature = match self.key.sign_prehash(&hash.0) {
            Ok(sig) => sig,
            Err(e) => unreachable!("signing a 32 byte prehash failed: {}", e),
        };

        // Luckily for us, this Signature type already has the format we need:
        // - 65 bytes containing r, s and v in this order
        //
        // But we still have to add 27 to v for the signature to be valid in the
        // EVM.
        let mut sig_bytes = [0u8; 65];
        sig_bytes.copy_from_slice(sig.as_bytes());
        sig_bytes[64] += 27;

        Signature(sig_bytes)
    }
}

impl Account for Signer {
    fn address(&self) -> Address {
        self.addr
    }

    fn sign_eth(&self, msg: Hash) -> Signature {
        Signer::sign_eth(self, msg)
    }
}

/// Recover the address that produced `eth_sig` on `msg`.
pub fn recover_signer(msg: Hash, eth_sig: Signature) -> Result<Address, Error> {
    // "\x19Ethereum Signed Message:\n32" format
    let hash = hash_to_eth_signed_msg_hash(msg);

    // Undo adding the 27, to go back to the format expected below
    let mut sig_bytes: [u8; 65] = eth_sig.0;
    sig_bytes[64] = sig_bytes[64].checked_sub(27).ok_or_else(Error::new)?;

    let sig = recoverable::Signature::from_bytes(&sig_bytes)?;
    let verifying_key = sig.recover_verifying_key_from_digest_bytes(&hash.0.into())?;
    Ok(verifying_key.into())
}
