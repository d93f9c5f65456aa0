//! Off-chain state channel client: participants agree on a channel, fund it
//! on a ledger, exchange signed state updates off-chain and settle the
//! outcome on-chain, cooperatively or through a dispute.

mod abiencode {
    pub mod encoder;
    mod hashing;
    pub mod types;

    pub use hashing::{hash_tokens, to_hash};
}

pub mod adjudicator;
pub mod channel;
pub mod client;
pub mod config;
pub mod funder;
pub mod ledger;
pub mod messages;
pub mod sig;
pub mod wire;

pub use abiencode::types::{Address, Bytes32, Hash, Signature, U256};
pub use client::{AcceptAll, ChannelHandle, Client, UpdateHandler};
pub use config::ClientConfig;
