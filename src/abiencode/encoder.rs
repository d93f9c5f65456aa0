//! Solidity ABI encoding (`abi.encode(...)`) for the types the adjudicator
//! contract hashes and verifies.
//!
//! Values are first lowered into a [Token] tree, which is then written in two
//! passes per tuple: the head (static values and offsets) followed by the tail
//! (the contents of dynamic values). Offsets are relative to the start of the
//! enclosing tuple, exactly like the Solidity encoder.

use super::types::{Address, Bytes32, Hash, U256};

/// Size of one ABI slot in bytes.
pub const SLOT_SIZE: usize = 32;

/// Intermediate representation of an ABI value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Any static 32 byte value (uintN, bool, address, bytes32).
    Word([u8; SLOT_SIZE]),
    /// Solidity `bytes`.
    Bytes(Vec<u8>),
    /// Dynamic-length array `T[]`.
    Array(Vec<Token>),
    /// Struct or fixed-size array. Dynamic iff any of its members is.
    Tuple(Vec<Token>),
}

impl Token {
    pub fn uint(v: U256) -> Self {
        Token::Word(v.to_be_bytes())
    }

    /// Addresses are right aligned (like uints), unlike fixed-size bytes.
    pub fn address(a: Address) -> Self {
        let mut slot = [0u8; SLOT_SIZE];
        slot[SLOT_SIZE - 20..].copy_from_slice(&a.0);
        Token::Word(slot)
    }

    pub fn is_dynamic(&self) -> bool {
        match self {
            Token::Word(_) => false,
            Token::Bytes(_) | Token::Array(_) => true,
            Token::Tuple(members) => members.iter().any(Token::is_dynamic),
        }
    }

    /// Number of bytes this token occupies in the head of its parent.
    fn head_size(&self) -> usize {
        match self {
            _ if self.is_dynamic() => SLOT_SIZE,
            Token::Tuple(members) => members.iter().map(Token::head_size).sum(),
            _ => SLOT_SIZE,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            Token::Word(_) => SLOT_SIZE,
            Token::Bytes(b) => SLOT_SIZE + padded_len(b.len()),
            Token::Array(items) => SLOT_SIZE + tuple_len(items),
            Token::Tuple(members) => tuple_len(members),
        }
    }

    fn write<W: Writer>(&self, w: &mut W) {
        match self {
            Token::Word(slot) => w.write(slot),
            Token::Bytes(b) => {
                write_usize(w, b.len());
                for chunk in b.chunks(SLOT_SIZE) {
                    let mut slot = [0u8; SLOT_SIZE];
                    slot[..chunk.len()].copy_from_slice(chunk);
                    w.write(&slot);
                }
            }
            Token::Array(items) => {
                write_usize(w, items.len());
                write_tuple(items, w);
            }
            Token::Tuple(members) => write_tuple(members, w),
        }
    }
}

fn padded_len(n: usize) -> usize {
    (n + SLOT_SIZE - 1) / SLOT_SIZE * SLOT_SIZE
}

fn tuple_len(members: &[Token]) -> usize {
    members
        .iter()
        .map(|m| {
            if m.is_dynamic() {
                SLOT_SIZE + m.encoded_len()
            } else {
                m.encoded_len()
            }
        })
        .sum()
}

fn write_usize<W: Writer>(w: &mut W, v: usize) {
    w.write(&U256::from(v).to_be_bytes());
}

fn write_tuple<W: Writer>(members: &[Token], w: &mut W) {
    let mut offset: usize = members.iter().map(Token::head_size).sum();
    for m in members {
        if m.is_dynamic() {
            write_usize(w, offset);
            offset += m.encoded_len();
        } else {
            m.write(w);
        }
    }
    for m in members.iter().filter(|m| m.is_dynamic()) {
        m.write(w);
    }
}

/// Sink for encoded slots, e.g. a hasher or a byte buffer.
pub trait Writer {
    fn write(&mut self, slot: &[u8]);
}

impl Writer for Vec<u8> {
    fn write(&mut self, slot: &[u8]) {
        self.extend_from_slice(slot);
    }
}

/// Types that have a Solidity counterpart.
pub trait AbiEncode {
    fn to_token(&self) -> Token;
}

impl AbiEncode for U256 {
    fn to_token(&self) -> Token {
        Token::uint(*self)
    }
}

impl AbiEncode for u64 {
    fn to_token(&self) -> Token {
        Token::uint(U256::from(*self))
    }
}

impl AbiEncode for u16 {
    fn to_token(&self) -> Token {
        Token::uint(U256::from(*self))
    }
}

impl AbiEncode for bool {
    fn to_token(&self) -> Token {
        Token::uint(U256::from(*self as u8))
    }
}

impl AbiEncode for Address {
    fn to_token(&self) -> Token {
        Token::address(*self)
    }
}

impl AbiEncode for Hash {
    fn to_token(&self) -> Token {
        Token::Word(self.0)
    }
}

impl AbiEncode for Bytes32 {
    fn to_token(&self) -> Token {
        Token::Word(self.0)
    }
}

impl<T: AbiEncode> AbiEncode for [T] {
    fn to_token(&self) -> Token {
        Token::Array(self.iter().map(AbiEncode::to_token).collect())
    }
}

impl<T: AbiEncode> AbiEncode for Vec<T> {
    fn to_token(&self) -> Token {
        self.as_slice().to_token()
    }
}

/// Write `abi.encode(args...)` to the writer.
pub fn to_writer<W: Writer>(args: &[Token], writer: &mut W) {
    write_tuple(args, writer)
}

/// Return `abi.encode(args...)` as bytes.
pub fn encode(args: &[Token]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(tuple_len(args));
    to_writer(args, &mut buf);
    buf
}
