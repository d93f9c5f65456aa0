//! Typed messages exchanged between channel participants and their
//! conversion from/to the protobuf wire types.

mod state;
mod subchannel;
mod update;

pub use subchannel::{VirtualChannelFundingProposal, VirtualChannelSettlementProposal};
pub use update::{ChannelUpdateRejected, LedgerChannelUpdate, LedgerChannelUpdateAccepted};

use self::state::address_from_bytes;
use crate::{
    abiencode::types::{Address, Hash},
    channel::AllocationError,
    wire::perunwire,
};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConversionError {
    #[error("balance rows have different participant counts")]
    ParticipantSizeMismatch,
    #[error("number of balance rows does not match number of assets")]
    AssetSizeMismatch,
    #[error("field has the wrong byte length")]
    ByteLengthMismatch,
    #[error("missing field `{0}`")]
    ExpectedSome(&'static str),
    #[error("index does not fit into 16 bits")]
    IndexOutOfRange,
    #[error("channel id does not match the parameters")]
    ChannelIdMismatch,
    #[error("envelope carries no message")]
    EmptyEnvelope,
    #[error("{0}")]
    Allocation(#[from] AllocationError),
}

/// Messages sent between participants of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParticipantMessage {
    ChannelUpdate(LedgerChannelUpdate),
    ChannelUpdateAccepted(LedgerChannelUpdateAccepted),
    ChannelUpdateRejected(ChannelUpdateRejected),
    VirtualChannelFundingProposal(VirtualChannelFundingProposal),
    VirtualChannelSettlementProposal(VirtualChannelSettlementProposal),
}

impl ParticipantMessage {
    pub fn channel_id(&self) -> Hash {
        match self {
            Self::ChannelUpdate(m) => m.state.channel_id(),
            Self::ChannelUpdateAccepted(m) => m.channel,
            Self::ChannelUpdateRejected(m) => m.channel,
            Self::VirtualChannelFundingProposal(m) => m.update.state.channel_id(),
            Self::VirtualChannelSettlementProposal(m) => m.update.state.channel_id(),
        }
    }

    /// Version of the (proposed) state the message refers to.
    pub fn version(&self) -> u64 {
        match self {
            Self::ChannelUpdate(m) => m.state.version(),
            Self::ChannelUpdateAccepted(m) => m.version,
            Self::ChannelUpdateRejected(m) => m.version,
            Self::VirtualChannelFundingProposal(m) => m.update.state.version(),
            Self::VirtualChannelSettlementProposal(m) => m.update.state.version(),
        }
    }

    /// True for the messages that open a new update attempt.
    pub fn is_proposal(&self) -> bool {
        matches!(
            self,
            Self::ChannelUpdate(_)
                | Self::VirtualChannelFundingProposal(_)
                | Self::VirtualChannelSettlementProposal(_)
        )
    }
}

impl TryFrom<perunwire::envelope::Msg> for ParticipantMessage {
    type Error = ConversionError;

    fn try_from(value: perunwire::envelope::Msg) -> Result<Self, Self::Error> {
        use perunwire::envelope::Msg;
        Ok(match value {
            Msg::ChannelUpdateMsg(m) => Self::ChannelUpdate(m.try_into()?),
            Msg::ChannelUpdateAccMsg(m) => Self::ChannelUpdateAccepted(m.try_into()?),
            Msg::ChannelUpdateRejMsg(m) => Self::ChannelUpdateRejected(m.try_into()?),
            Msg::VirtualChannelFundingProposalMsg(m) => {
                Self::VirtualChannelFundingProposal(m.try_into()?)
            }
            Msg::VirtualChannelSettlementProposalMsg(m) => {
                Self::VirtualChannelSettlementProposal(m.try_into()?)
            }
        })
    }
}

impl From<&ParticipantMessage> for perunwire::envelope::Msg {
    fn from(value: &ParticipantMessage) -> Self {
        use perunwire::envelope::Msg;
        match value {
            ParticipantMessage::ChannelUpdate(m) => Msg::ChannelUpdateMsg(m.into()),
            ParticipantMessage::ChannelUpdateAccepted(m) => Msg::ChannelUpdateAccMsg(m.into()),
            ParticipantMessage::ChannelUpdateRejected(m) => Msg::ChannelUpdateRejMsg(m.into()),
            ParticipantMessage::VirtualChannelFundingProposal(m) => {
                Msg::VirtualChannelFundingProposalMsg(m.into())
            }
            ParticipantMessage::VirtualChannelSettlementProposal(m) => {
                Msg::VirtualChannelSettlementProposalMsg(m.into())
            }
        }
    }
}

/// A message together with its sender and recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub sender: Address,
    pub recipient: Address,
    pub msg: ParticipantMessage,
}

impl TryFrom<perunwire::Envelope> for Envelope {
    type Error = ConversionError;

    fn try_from(value: perunwire::Envelope) -> Result<Self, Self::Error> {
        Ok(Envelope {
            sender: address_from_bytes(&value.sender)?,
            recipient: address_from_bytes(&value.recipient)?,
            msg: value.msg.ok_or(ConversionError::EmptyEnvelope)?.try_into()?,
        })
    }
}

impl From<&Envelope> for perunwire::Envelope {
    fn from(value: &Envelope) -> Self {
        Self {
            sender: value.sender.0.to_vec(),
            recipient: value.recipient.0.to_vec(),
            msg: Some((&value.msg).into()),
        }
    }
}
