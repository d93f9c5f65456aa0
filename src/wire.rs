//! Message transport seen from the channel logic: typed envelopes, their
//! framing on a byte transport and the cache for early arrivals.

mod cache;
mod encoding;
pub mod perunwire;
mod relay;

use core::fmt::Debug;

pub use crate::messages::Envelope;
pub use cache::{Cache, Predicate, PredicateId};
pub use encoding::{decode_envelope, encode_envelope, ProtoBufEncodingLayer, WireError};
pub use relay::{Relay, Subscription};

use crate::Address;

/// Byte transport to other participants, e.g. a TCP connection per peer.
pub trait BytesBus: Debug + Send + Sync {
    fn send(&self, recipient: Address, msg: &[u8]) -> Result<(), WireError>;
}

/// Typed transport to other participants.
///
/// Delivery is fire and forget, an `Ok` only means the envelope was handed to
/// the transport.
pub trait MessageBus: Debug + Send + Sync {
    fn send(&self, env: Envelope) -> Result<(), WireError>;
}
