use super::{
    state::{hash_from_bytes, sig_from_bytes},
    ConversionError,
};
use crate::{
    abiencode::types::{Hash, Signature},
    channel::{PartIdx, State},
    wire::perunwire,
};

/// Proposal of a new state, signed by its author (the actor).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerChannelUpdate {
    pub state: State,
    pub actor_idx: PartIdx,
    pub sig: Signature,
}

impl TryFrom<perunwire::ChannelUpdateMsg> for LedgerChannelUpdate {
    type Error = ConversionError;

    fn try_from(value: perunwire::ChannelUpdateMsg) -> Result<Self, Self::Error> {
        let update = value
            .channel_update
            .ok_or(ConversionError::ExpectedSome("channel_update"))?;

        Ok(Self {
            state: update
                .state
                .ok_or(ConversionError::ExpectedSome("state"))?
                .try_into()?,
            actor_idx: update.actor_idx as usize,
            sig: sig_from_bytes(&value.sig)?,
        })
    }
}

impl From<&LedgerChannelUpdate> for perunwire::ChannelUpdateMsg {
    fn from(value: &LedgerChannelUpdate) -> Self {
        Self {
            channel_update: Some(perunwire::ChannelUpdate {
                state: Some((&value.state).into()),
                actor_idx: value.actor_idx as u32,
            }),
            sig: value.sig.0.to_vec(),
        }
    }
}

/// Signature of a participant on a proposed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerChannelUpdateAccepted {
    pub channel: Hash,
    pub version: u64,
    pub sig: Signature,
}

impl TryFrom<perunwire::ChannelUpdateAccMsg> for LedgerChannelUpdateAccepted {
    type Error = ConversionError;

    fn try_from(value: perunwire::ChannelUpdateAccMsg) -> Result<Self, Self::Error> {
        Ok(LedgerChannelUpdateAccepted {
            channel: hash_from_bytes(&value.channel_id)?,
            version: value.version,
            sig: sig_from_bytes(&value.sig)?,
        })
    }
}

impl From<&LedgerChannelUpdateAccepted> for perunwire::ChannelUpdateAccMsg {
    fn from(value: &LedgerChannelUpdateAccepted) -> Self {
        Self {
            channel_id: value.channel.0.to_vec(),
            version: value.version,
            sig: value.sig.0.to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelUpdateRejected {
    pub channel: Hash,
    pub version: u64,
    pub reason: String,
}

impl TryFrom<perunwire::ChannelUpdateRejMsg> for ChannelUpdateRejected {
    type Error = ConversionError;

    fn try_from(value: perunwire::ChannelUpdateRejMsg) -> Result<Self, Self::Error> {
        Ok(ChannelUpdateRejected {
            channel: hash_from_bytes(&value.channel_id)?,
            version: value.version,
            reason: value.reason,
        })
    }
}

impl From<&ChannelUpdateRejected> for perunwire::ChannelUpdateRejMsg {
    fn from(value: &ChannelUpdateRejected) -> Self {
        Self {
            channel_id: value.channel.0.to_vec(),
            version: value.version,
            reason: value.reason.clone(),
        }
    }
}
