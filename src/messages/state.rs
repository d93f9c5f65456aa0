//! Wire representation of the channel data model.

use super::ConversionError;
use crate::{
    abiencode::types::{Address, Hash, Signature, U256},
    channel::{Allocation, Asset, Params, SignedState, State, SubAlloc},
    wire::perunwire,
};

pub(crate) fn u256_from_bytes(b: &[u8]) -> Result<U256, ConversionError> {
    // Peers may strip leading zeroes, anything up to 32 bytes is fine.
    if b.len() > 32 {
        return Err(ConversionError::ByteLengthMismatch);
    }
    Ok(U256::from_big_endian(b))
}

pub(crate) fn u256_to_bytes(v: U256) -> Vec<u8> {
    v.to_be_bytes().to_vec()
}

pub(crate) fn hash_from_bytes(b: &[u8]) -> Result<Hash, ConversionError> {
    Hash::try_from(b).or(Err(ConversionError::ByteLengthMismatch))
}

pub(crate) fn address_from_bytes(b: &[u8]) -> Result<Address, ConversionError> {
    Address::try_from(b).or(Err(ConversionError::ByteLengthMismatch))
}

pub(crate) fn sig_from_bytes(b: &[u8]) -> Result<Signature, ConversionError> {
    Signature::try_from(b).or(Err(ConversionError::ByteLengthMismatch))
}

fn balance_from_wire(value: perunwire::Balance) -> Result<Vec<U256>, ConversionError> {
    value.balance.iter().map(|b| u256_from_bytes(b)).collect()
}

fn balance_to_wire(bals: &[U256]) -> perunwire::Balance {
    perunwire::Balance {
        balance: bals.iter().map(|v| u256_to_bytes(*v)).collect(),
    }
}

impl TryFrom<perunwire::Params> for Params {
    type Error = ConversionError;

    fn try_from(value: perunwire::Params) -> Result<Self, Self::Error> {
        let participants = value
            .parts
            .iter()
            .map(|b| address_from_bytes(b))
            .collect::<Result<Vec<_>, _>>()?;
        let params = Self {
            challenge_duration: value.challenge_duration,
            nonce: u256_from_bytes(&value.nonce)?,
            participants,
            app: if value.app.is_empty() {
                Address::default()
            } else {
                address_from_bytes(&value.app)?
            },
            ledger_channel: value.ledger_channel,
            virtual_channel: value.virtual_channel,
        };
        // The id is redundant, but a mismatch means the peer computes ids
        // differently and nothing it signs would be valid for us.
        if !value.id.is_empty() && hash_from_bytes(&value.id)? != params.channel_id() {
            return Err(ConversionError::ChannelIdMismatch);
        }
        Ok(params)
    }
}

impl From<&Params> for perunwire::Params {
    fn from(value: &Params) -> Self {
        Self {
            id: value.channel_id().0.to_vec(),
            challenge_duration: value.challenge_duration,
            parts: value.participants.iter().map(|a| a.0.to_vec()).collect(),
            app: value.app.0.to_vec(),
            nonce: u256_to_bytes(value.nonce),
            ledger_channel: value.ledger_channel,
            virtual_channel: value.virtual_channel,
        }
    }
}

impl TryFrom<perunwire::SubAlloc> for SubAlloc {
    type Error = ConversionError;

    fn try_from(value: perunwire::SubAlloc) -> Result<Self, Self::Error> {
        let index_map = value
            .index_map
            .ok_or(ConversionError::ExpectedSome("index_map"))?
            .index_map
            .into_iter()
            .map(|i| u16::try_from(i).or(Err(ConversionError::IndexOutOfRange)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SubAlloc::new(
            hash_from_bytes(&value.id)?,
            balance_from_wire(value.bals.ok_or(ConversionError::ExpectedSome("bals"))?)?,
            index_map,
        ))
    }
}

impl From<&SubAlloc> for perunwire::SubAlloc {
    fn from(value: &SubAlloc) -> Self {
        Self {
            id: value.id.0.to_vec(),
            bals: Some(balance_to_wire(&value.balances)),
            index_map: Some(perunwire::IndexMap {
                index_map: value.index_map.iter().map(|&i| i as u32).collect(),
            }),
        }
    }
}

impl TryFrom<perunwire::Allocation> for Allocation {
    type Error = ConversionError;

    fn try_from(value: perunwire::Allocation) -> Result<Self, Self::Error> {
        let assets = value
            .assets
            .iter()
            .map(|b| Asset::from_bytes(b).ok_or(ConversionError::ByteLengthMismatch))
            .collect::<Result<Vec<_>, _>>()?;

        // On the wire balances are indexed [asset][participant].
        let by_asset = value
            .balances
            .ok_or(ConversionError::ExpectedSome("balances"))?
            .balances
            .into_iter()
            .map(balance_from_wire)
            .collect::<Result<Vec<_>, _>>()?;
        if by_asset.len() != assets.len() {
            return Err(ConversionError::AssetSizeMismatch);
        }
        let num_parts = by_asset.first().map_or(0, Vec::len);
        if by_asset.iter().any(|row| row.len() != num_parts) {
            return Err(ConversionError::ParticipantSizeMismatch);
        }
        let balances = (0..num_parts)
            .map(|p| by_asset.iter().map(|row| row[p]).collect())
            .collect();

        let locked = value
            .locked
            .into_iter()
            .map(SubAlloc::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Allocation::with_locked(assets, balances, locked)?)
    }
}

impl From<&Allocation> for perunwire::Allocation {
    fn from(value: &Allocation) -> Self {
        let by_asset = (0..value.num_assets())
            .map(|a| {
                let column: Vec<U256> = value.balances.iter().map(|row| row[a]).collect();
                balance_to_wire(&column)
            })
            .collect();
        Self {
            assets: value.assets.iter().map(Asset::to_bytes).collect(),
            balances: Some(perunwire::Balances { balances: by_asset }),
            locked: value.locked.iter().map(perunwire::SubAlloc::from).collect(),
        }
    }
}

impl TryFrom<perunwire::State> for State {
    type Error = ConversionError;

    fn try_from(value: perunwire::State) -> Result<Self, Self::Error> {
        Ok(State::from_parts(
            hash_from_bytes(&value.id)?,
            value.version,
            value
                .allocation
                .ok_or(ConversionError::ExpectedSome("allocation"))?
                .try_into()?,
            value.data,
            value.is_final,
        ))
    }
}

impl From<&State> for perunwire::State {
    fn from(value: &State) -> Self {
        Self {
            id: value.channel_id().0.to_vec(),
            version: value.version(),
            app: vec![],
            allocation: Some((&value.outcome).into()),
            data: value.app_data.clone(),
            is_final: value.is_final,
        }
    }
}

impl TryFrom<perunwire::SignedState> for SignedState {
    type Error = ConversionError;

    fn try_from(value: perunwire::SignedState) -> Result<Self, Self::Error> {
        Ok(SignedState {
            params: value
                .params
                .ok_or(ConversionError::ExpectedSome("params"))?
                .try_into()?,
            state: value
                .state
                .ok_or(ConversionError::ExpectedSome("state"))?
                .try_into()?,
            sigs: value
                .sigs
                .iter()
                .map(|s| sig_from_bytes(s))
                .collect::<Result<Vec<_>, _>>()?,
        })
    }
}

impl From<&SignedState> for perunwire::SignedState {
    fn from(value: &SignedState) -> Self {
        Self {
            params: Some((&value.params).into()),
            state: Some((&value.state).into()),
            sigs: value.sigs.iter().map(|s| s.0.to_vec()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::state::tests::two_party_setup;

    #[test]
    fn short_big_endian_balances_are_accepted() {
        assert_eq!(u256_from_bytes(&[0x01, 0x00]).unwrap(), U256::from(256));
        assert_eq!(u256_from_bytes(&[]).unwrap(), U256::zero());
        assert!(u256_from_bytes(&[0; 33]).is_err());
    }

    #[test]
    fn wire_balances_are_indexed_by_asset() {
        let (_, _, state) = two_party_setup(40);
        let wire = perunwire::Allocation::from(&state.outcome);
        let bals = wire.balances.unwrap().balances;
        assert_eq!(bals.len(), 1);
        assert_eq!(bals[0].balance.len(), 2);
        assert_eq!(u256_from_bytes(&bals[0].balance[0]).unwrap(), 100.into());
    }

    #[test]
    fn params_with_forged_id_are_rejected() {
        let (_, params, _) = two_party_setup(41);
        let mut wire = perunwire::Params::from(&params);
        wire.id[0] ^= 1;
        assert_eq!(
            Params::try_from(wire).unwrap_err(),
            ConversionError::ChannelIdMismatch
        );
    }

    #[test]
    fn asset_count_must_match_balance_rows() {
        let (_, _, state) = two_party_setup(42);
        let mut wire = perunwire::Allocation::from(&state.outcome);
        wire.assets.push(wire.assets[0].clone());
        assert_eq!(
            Allocation::try_from(wire).unwrap_err(),
            ConversionError::AssetSizeMismatch
        );
    }
}
