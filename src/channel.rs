//! Channel data model and the off-chain update protocol.
//!
//! A channel goes through the following phases:
//! - [AgreedUponChannel]: parameters and initial allocation are known, the
//!   participants exchange signatures on version 0.
//! - funding (see [crate::funder]), using the [SignedState] produced above.
//! - [ActiveChannel]: the channel can be updated off-chain, closed
//!   cooperatively or disputed (see [crate::adjudicator]).

mod active;
mod agreed_upon;
pub mod allocation;
mod params;
pub(crate) mod state;
pub mod subchannel;
mod withdrawal_auth;

use crate::abiencode::{
    self,
    types::{Address, Hash},
};

pub use active::*;
pub use agreed_upon::*;
pub use allocation::{Allocation, AllocationError, Asset, SubAlloc};
pub use params::Params;
pub use state::{InvalidUpdate, SignatureError, SignedState, State};
pub use withdrawal_auth::{make_signed_withdrawal_auths, SignedWithdrawalAuth, WithdrawalAuth};

/// Index of a participant in the channel.
///
/// `0` is the proposer of the channel.
pub type PartIdx = usize;

/// Identifies the deposit of one participant into one channel.
///
/// `keccak256(abi.encode(channelID, participant))`, so a deposit can never be
/// credited to a different channel or participant.
pub fn funding_id(channel_id: Hash, participant: Address) -> Hash {
    use abiencode::encoder::AbiEncode;
    abiencode::hash_tokens(&[channel_id.to_token(), participant.to_token()])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn funding_id_binds_channel_and_participant() {
        let a = Address([1; 20]);
        let b = Address([2; 20]);
        let c1 = Hash([3; 32]);
        let c2 = Hash([4; 32]);
        assert_eq!(funding_id(c1, a), funding_id(c1, a));
        assert_ne!(funding_id(c1, a), funding_id(c1, b));
        assert_ne!(funding_id(c1, a), funding_id(c2, a));
    }
}
