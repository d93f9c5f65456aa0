use super::{
    encoder::{to_writer, AbiEncode, Token, Writer},
    types::Hash,
};

use sha3::{
    digest::{core_api::CoreWrapper, Output},
    Digest, Keccak256, Keccak256Core,
};

pub struct Keccak256Writer {
    hasher: CoreWrapper<Keccak256Core>,
}

impl Default for Keccak256Writer {
    fn default() -> Self {
        Self {
            hasher: Keccak256::new(),
        }
    }
}

impl Writer for Keccak256Writer {
    fn write(&mut self, slot: &[u8]) {
        self.hasher.update(slot);
    }
}

impl Keccak256Writer {
    pub fn finalize(self) -> Output<Keccak256> {
        self.hasher.finalize()
    }
}

/// `keccak256(abi.encode(args...))`, streamed into the hasher.
pub fn hash_tokens(args: &[Token]) -> Hash {
    let mut writer = Keccak256Writer::default();
    to_writer(args, &mut writer);
    Hash(writer.finalize().into())
}

/// `keccak256(abi.encode(value))`
pub fn to_hash<T: AbiEncode + ?Sized>(value: &T) -> Hash {
    hash_tokens(&[value.to_token()])
}
