use super::{ConversionError, LedgerChannelUpdate};
use crate::{channel::SignedState, wire::perunwire};

/// Parent channel update that locks funds for a new sub-channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualChannelFundingProposal {
    pub update: LedgerChannelUpdate,
    /// Fully signed version 0 of the sub-channel.
    pub initial: SignedState,
    /// Parent participant index of each sub-channel participant.
    pub index_map: Vec<u16>,
}

impl TryFrom<perunwire::VirtualChannelFundingProposalMsg> for VirtualChannelFundingProposal {
    type Error = ConversionError;

    fn try_from(value: perunwire::VirtualChannelFundingProposalMsg) -> Result<Self, Self::Error> {
        let index_map = value
            .index_map
            .ok_or(ConversionError::ExpectedSome("index_map"))?
            .index_map
            .into_iter()
            .map(|i| u16::try_from(i).or(Err(ConversionError::IndexOutOfRange)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            update: value
                .channel_update_msg
                .ok_or(ConversionError::ExpectedSome("channel_update_msg"))?
                .try_into()?,
            initial: value
                .initial
                .ok_or(ConversionError::ExpectedSome("initial"))?
                .try_into()?,
            index_map,
        })
    }
}

impl From<&VirtualChannelFundingProposal> for perunwire::VirtualChannelFundingProposalMsg {
    fn from(value: &VirtualChannelFundingProposal) -> Self {
        Self {
            channel_update_msg: Some((&value.update).into()),
            initial: Some((&value.initial).into()),
            index_map: Some(perunwire::IndexMap {
                index_map: value.index_map.iter().map(|&i| i as u32).collect(),
            }),
        }
    }
}

/// Parent channel update that releases the funds of a finalized sub-channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualChannelSettlementProposal {
    pub update: LedgerChannelUpdate,
    pub final_state: SignedState,
}

impl TryFrom<perunwire::VirtualChannelSettlementProposalMsg>
    for VirtualChannelSettlementProposal
{
    type Error = ConversionError;

    fn try_from(
        value: perunwire::VirtualChannelSettlementProposalMsg,
    ) -> Result<Self, Self::Error> {
        Ok(Self {
            update: value
                .channel_update_msg
                .ok_or(ConversionError::ExpectedSome("channel_update_msg"))?
                .try_into()?,
            final_state: value
                .r#final
                .ok_or(ConversionError::ExpectedSome("final"))?
                .try_into()?,
        })
    }
}

impl From<&VirtualChannelSettlementProposal> for perunwire::VirtualChannelSettlementProposalMsg {
    fn from(value: &VirtualChannelSettlementProposal) -> Self {
        Self {
            channel_update_msg: Some((&value.update).into()),
            r#final: Some((&value.final_state).into()),
        }
    }
}
