use super::{
    allocation::{Allocation, AllocationError},
    params::Params,
    PartIdx,
};
use crate::{
    abiencode::{
        self,
        encoder::{AbiEncode, Token},
        types::{Hash, Signature},
    },
    sig,
};
use thiserror::Error;

/// Reasons for refusing a proposed state transition.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidUpdate {
    #[error("state belongs to a different channel")]
    InvalidChannelID,
    #[error("invalid version number: current {current}, proposed {proposed}")]
    InvalidVersionNumber { current: u64, proposed: u64 },
    #[error("current state is final")]
    CurrentStateIsFinal,
    #[error("assets changed")]
    AssetsMismatch,
    #[error("total allocation amount changed")]
    TotalAllocationAmountMismatch,
    #[error("locked sub-allocations changed in a plain update")]
    LockedMismatch,
    #[error("allocation has {actual} participants, channel has {expected}")]
    ParticipantCountMismatch { expected: usize, actual: usize },
    #[error("actor index {0} is out of range")]
    InvalidActor(PartIdx),
    #[error("malformed allocation: {0}")]
    Dimension(#[from] AllocationError),
}

/// Stores the complete state of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct State {
    id: Hash,
    version: u64,
    pub outcome: Allocation,
    pub app_data: Vec<u8>,
    pub is_final: bool,
}

impl State {
    /// Version 0 of the channel described by `params`.
    pub fn new(params: &Params, init_bals: Allocation) -> Self {
        State {
            id: params.channel_id(),
            version: 0,
            outcome: init_bals,
            app_data: Vec::new(),
            is_final: false,
        }
    }

    /// Used when decoding a state received over the wire, where id and
    /// version are whatever the peer sent.
    pub(crate) fn from_parts(
        id: Hash,
        version: u64,
        outcome: Allocation,
        app_data: Vec<u8>,
        is_final: bool,
    ) -> Self {
        State {
            id,
            version,
            outcome,
            app_data,
            is_final,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn channel_id(&self) -> Hash {
        self.id
    }

    /// Create a new state that will replace this state.
    ///
    /// Having id and version as private fields forces the caller to not
    /// accidentally write garbage to one of those fields. The allocation is
    /// deep-copied, so the caller may mutate it freely.
    pub fn make_next_state(&self) -> Self {
        State {
            id: self.id,
            version: self.version + 1,
            outcome: self.outcome.clone(),
            app_data: self.app_data.clone(),
            is_final: self.is_final,
        }
    }

    /// `keccak256(abi.encode(state))`, the payload every participant signs.
    pub fn hash(&self) -> Hash {
        abiencode::to_hash(self)
    }

    /// Checks shared by every kind of update: same channel, not final,
    /// version bumped by exactly one, well-formed and value conserving.
    /// Locked sub-allocations may differ.
    pub(crate) fn check_base_transition(
        &self,
        next: &State,
        num_parts: usize,
    ) -> Result<(), InvalidUpdate> {
        if next.id != self.id {
            return Err(InvalidUpdate::InvalidChannelID);
        }
        if self.is_final {
            return Err(InvalidUpdate::CurrentStateIsFinal);
        }
        if next.version != self.version + 1 {
            return Err(InvalidUpdate::InvalidVersionNumber {
                current: self.version,
                proposed: next.version,
            });
        }
        next.outcome.valid()?;
        if next.outcome.num_parts() != num_parts {
            return Err(InvalidUpdate::ParticipantCountMismatch {
                expected: num_parts,
                actual: next.outcome.num_parts(),
            });
        }
        if next.outcome.assets != self.outcome.assets {
            return Err(InvalidUpdate::AssetsMismatch);
        }
        if !self.outcome.equal_sum(&next.outcome)? {
            return Err(InvalidUpdate::TotalAllocationAmountMismatch);
        }
        Ok(())
    }

    /// Full check for an ordinary (ledger channel) update.
    pub fn check_transition(&self, next: &State, num_parts: usize) -> Result<(), InvalidUpdate> {
        self.check_base_transition(next, num_parts)?;
        if next.outcome.locked != self.outcome.locked {
            return Err(InvalidUpdate::LockedMismatch);
        }
        Ok(())
    }
}

impl AbiEncode for State {
    fn to_token(&self) -> Token {
        Token::Tuple(vec![
            self.id.to_token(),
            self.version.to_token(),
            self.outcome.to_token(),
            Token::Bytes(self.app_data.clone()),
            self.is_final.to_token(),
        ])
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("expected {expected} signatures, got {actual}")]
    Count { expected: usize, actual: usize },
    #[error("signature of participant {0} does not verify")]
    Invalid(PartIdx),
}

/// A state together with the parameters it belongs to and one signature per
/// participant, in participant order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedState {
    pub params: Params,
    pub state: State,
    pub sigs: Vec<Signature>,
}

impl SignedState {
    pub fn channel_id(&self) -> Hash {
        self.state.channel_id()
    }

    pub fn version(&self) -> u64 {
        self.state.version()
    }

    /// Every participant's signature recovers to that participant's address
    /// over the encoding of `state`, and `state` belongs to `params`.
    pub fn verify(&self) -> Result<(), SignatureError> {
        let n = self.params.num_parts();
        if self.sigs.len() != n {
            return Err(SignatureError::Count {
                expected: n,
                actual: self.sigs.len(),
            });
        }
        let hash = self.state.hash();
        for (idx, (sig, addr)) in self.sigs.iter().zip(&self.params.participants).enumerate() {
            if !sig::verify(*addr, hash, *sig) {
                return Err(SignatureError::Invalid(idx));
            }
        }
        Ok(())
    }

    pub fn is_fully_signed(&self) -> bool {
        self.state.channel_id() == self.params.channel_id() && self.verify().is_ok()
    }
}
