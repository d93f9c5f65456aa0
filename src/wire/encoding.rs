use super::{perunwire, BytesBus, MessageBus};
use crate::messages::{ConversionError, Envelope};
use prost::{bytes::BufMut, Message};
use thiserror::Error;

/// Size of the length prefix in front of every frame.
pub const LENGTH_PREFIX: usize = 2;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("encoded message is {0} bytes, frames are limited to 65535")]
    TooLarge(usize),
    #[error("frame announces {expected} bytes but has {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("protobuf encoding failed: {0}")]
    Encode(#[from] prost::EncodeError),
    #[error("protobuf decoding failed: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("invalid message: {0}")]
    Conversion(#[from] ConversionError),
    #[error("peer {0:?} is not reachable")]
    Unreachable(crate::Address),
}

/// Frame `env` as a 2-byte big-endian length followed by the protobuf
/// encoded envelope.
pub fn encode_envelope(env: &Envelope) -> Result<Vec<u8>, WireError> {
    let msg = perunwire::Envelope::from(env);
    // Go-perun writes a u16 for the length (2 bytes), this means we cannot
    // use `encode_length_delimited`, which would write a variable length
    // integer using LEB128.
    let len = msg.encoded_len();
    let prefix = u16::try_from(len).or(Err(WireError::TooLarge(len)))?;

    let mut buf = Vec::with_capacity(LENGTH_PREFIX + len);
    buf.put_slice(&prefix.to_be_bytes());
    msg.encode(&mut buf)?;
    Ok(buf)
}

/// Inverse of [encode_envelope]. `frame` must contain exactly one frame.
pub fn decode_envelope(frame: &[u8]) -> Result<Envelope, WireError> {
    if frame.len() < LENGTH_PREFIX {
        return Err(WireError::Truncated {
            expected: LENGTH_PREFIX,
            actual: frame.len(),
        });
    }
    let (prefix, body) = frame.split_at(LENGTH_PREFIX);
    let len = u16::from_be_bytes([prefix[0], prefix[1]]) as usize;
    if body.len() != len {
        return Err(WireError::Truncated {
            expected: len,
            actual: body.len(),
        });
    }
    Ok(perunwire::Envelope::decode(body)?.try_into()?)
}

/// Adapts a byte transport to a [MessageBus].
#[derive(Debug)]
pub struct ProtoBufEncodingLayer<B: BytesBus> {
    pub bus: B,
}

impl<B: BytesBus> MessageBus for ProtoBufEncodingLayer<B> {
    fn send(&self, env: Envelope) -> Result<(), WireError> {
        let buf = encode_envelope(&env)?;
        self.bus.send(env.recipient, &buf)
    }
}
