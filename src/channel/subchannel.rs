//! Validation of updates that fund or settle a sub-channel out of a parent
//! ledger channel.
//!
//! Funding moves balances of the parent participants into a new locked
//! sub-allocation, settlement moves the final balances of the sub-channel back
//! to the parent participants. Both are ordinary parent updates otherwise.

use super::{
    allocation::{Allocation, AllocationError, SubAlloc},
    state::{SignatureError, SignedState, State},
    PartIdx,
};
use crate::abiencode::types::Hash;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubChannelError {
    #[error("sub-channel initial state has version {0}, expected 0")]
    NotInitialVersion(u64),
    #[error("sub-channel state is not final")]
    NotFinal,
    #[error("sub-channel state is not fully signed: {0}")]
    NotFullySigned(#[from] SignatureError),
    #[error("sub-channel state does not belong to its parameters")]
    ParamsMismatch,
    #[error("index map has {actual} entries for {expected} sub-channel participants")]
    IndexMapLength { expected: usize, actual: usize },
    #[error("index map entry {0} points outside the parent channel")]
    IndexOutOfRange(u16),
    #[error("sub-channel assets differ from the parent channel")]
    AssetsMismatch,
    #[error("locked sub-allocations do not match the proposal")]
    LockedMismatch,
    #[error("sub-channel {0:?} is not locked in the parent channel")]
    UnknownSubChannel(Hash),
    #[error("participant {0} balance does not reflect the sub-channel")]
    BalanceMismatch(PartIdx),
    #[error("{0}")]
    Allocation(#[from] AllocationError),
}

fn check_index_map(
    index_map: &[u16],
    sub_parts: usize,
    parent_parts: usize,
) -> Result<(), SubChannelError> {
    if index_map.len() != sub_parts {
        return Err(SubChannelError::IndexMapLength {
            expected: sub_parts,
            actual: index_map.len(),
        });
    }
    match index_map.iter().find(|&&i| i as usize >= parent_parts) {
        Some(&i) => Err(SubChannelError::IndexOutOfRange(i)),
        None => Ok(()),
    }
}

/// Subtracts (funding) or adds (settlement) the sub-channel balances to the
/// mapped parent balances and compares the result with `new`.
fn check_parent_balances(
    old: &Allocation,
    new: &Allocation,
    sub: &Allocation,
    index_map: &[u16],
    funding: bool,
) -> Result<(), SubChannelError> {
    let mut expected = old.balances.clone();
    for (sub_idx, &parent_idx) in index_map.iter().enumerate() {
        let parent_idx = parent_idx as usize;
        for (asset, amount) in sub.balances[sub_idx].iter().enumerate() {
            let bal = &mut expected[parent_idx][asset];
            let updated = if funding {
                bal.checked_sub(*amount)
            } else {
                bal.checked_add(*amount)
            };
            *bal = updated.ok_or(SubChannelError::BalanceMismatch(parent_idx))?;
        }
    }
    match expected
        .iter()
        .zip(&new.balances)
        .position(|(want, got)| want != got)
    {
        Some(idx) => Err(SubChannelError::BalanceMismatch(idx)),
        None => Ok(()),
    }
}

fn check_signed_sub_state(sub: &SignedState) -> Result<(), SubChannelError> {
    if sub.state.channel_id() != sub.params.channel_id()
        || sub.state.outcome.num_parts() != sub.params.num_parts()
    {
        return Err(SubChannelError::ParamsMismatch);
    }
    sub.verify()?;
    sub.state.outcome.valid()?;
    Ok(())
}

/// The parent transition `current -> next` locks the funds of the sub-channel
/// described by `initial`.
pub fn check_funding(
    current: &State,
    next: &State,
    initial: &SignedState,
    index_map: &[u16],
) -> Result<(), SubChannelError> {
    if initial.version() != 0 {
        return Err(SubChannelError::NotInitialVersion(initial.version()));
    }
    check_signed_sub_state(initial)?;
    check_index_map(
        index_map,
        initial.params.num_parts(),
        current.outcome.num_parts(),
    )?;
    let sub = &initial.state.outcome;
    if sub.assets != current.outcome.assets {
        return Err(SubChannelError::AssetsMismatch);
    }

    let mut expected_locked = current.outcome.locked.clone();
    expected_locked.push(SubAlloc::new(
        initial.channel_id(),
        sub.try_sum()?,
        index_map.to_vec(),
    ));
    if next.outcome.locked != expected_locked {
        return Err(SubChannelError::LockedMismatch);
    }

    check_parent_balances(&current.outcome, &next.outcome, sub, index_map, true)
}

/// The parent transition `current -> next` releases the locked funds of the
/// sub-channel according to its final state.
pub fn check_settlement(
    current: &State,
    next: &State,
    final_state: &SignedState,
) -> Result<(), SubChannelError> {
    if !final_state.state.is_final {
        return Err(SubChannelError::NotFinal);
    }
    check_signed_sub_state(final_state)?;
    let id = final_state.channel_id();
    let locked = current
        .outcome
        .sub_alloc(id)
        .ok_or(SubChannelError::UnknownSubChannel(id))?;
    let sub = &final_state.state.outcome;
    if sub.assets != current.outcome.assets {
        return Err(SubChannelError::AssetsMismatch);
    }
    check_index_map(
        &locked.index_map,
        final_state.params.num_parts(),
        current.outcome.num_parts(),
    )?;
    if sub.try_sum()? != locked.balances {
        return Err(SubChannelError::BalanceMismatch(0));
    }

    let expected_locked: Vec<SubAlloc> = current
        .outcome
        .locked
        .iter()
        .filter(|s| s.id != id)
        .cloned()
        .collect();
    if next.outcome.locked != expected_locked {
        return Err(SubChannelError::LockedMismatch);
    }

    check_parent_balances(
        &current.outcome,
        &next.outcome,
        sub,
        &locked.index_map,
        false,
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        abiencode::types::U256,
        channel::{state::tests::two_party_setup, Params},
        sig::Signer,
    };

    /// Signed sub-channel state between the parent participants with the
    /// given balances (one asset).
    pub(crate) fn sub_channel(
        signers: &[Signer],
        parent: &State,
        bals: [u64; 2],
        version: u64,
        is_final: bool,
    ) -> SignedState {
        let params = Params {
            virtual_channel: true,
            ledger_channel: false,
            ..Params::new_ledger(
                30,
                U256::from(77),
                signers.iter().map(|s| s.address()).collect(),
            )
        };
        let alloc = Allocation::new(
            parent.outcome.assets.clone(),
            vec![vec![bals[0].into()], vec![bals[1].into()]],
        )
        .unwrap();
        let init = State::new(&params, alloc);
        let state = State::from_parts(
            init.channel_id(),
            version,
            init.outcome,
            vec![],
            is_final,
        );
        let hash = state.hash();
        SignedState {
            params,
            sigs: signers.iter().map(|s| s.sign_eth(hash)).collect(),
            state,
        }
    }

    /// Parent participant 0 pays 30 into the sub-channel.
    pub(crate) fn funded_next(current: &State, initial: &SignedState, index_map: &[u16]) -> State {
        let mut next = current.make_next_state();
        next.outcome.balances[0][0] = next.outcome.balances[0][0] - U256::from(30);
        next.outcome.locked.push(SubAlloc::new(
            initial.channel_id(),
            initial.state.outcome.sum(),
            index_map.to_vec(),
        ));
        next
    }

    #[test]
    fn funding_locks_sub_channel_balances() {
        let (signers, _, current) = two_party_setup(30);
        let initial = sub_channel(&signers, &current, [30, 0], 0, false);
        let next = funded_next(&current, &initial, &[0, 1]);
        assert_eq!(check_funding(&current, &next, &initial, &[0, 1]), Ok(()));
        assert_eq!(current.check_base_transition(&next, 2), Ok(()));
    }

    #[test]
    fn funding_requires_version_zero() {
        let (signers, _, current) = two_party_setup(31);
        let initial = sub_channel(&signers, &current, [30, 0], 1, false);
        let next = funded_next(&current, &initial, &[0, 1]);
        assert_eq!(
            check_funding(&current, &next, &initial, &[0, 1]),
            Err(SubChannelError::NotInitialVersion(1))
        );
    }

    #[test]
    fn funding_requires_all_signatures() {
        let (signers, _, current) = two_party_setup(32);
        let mut initial = sub_channel(&signers, &current, [30, 0], 0, false);
        initial.sigs.pop();
        let next = funded_next(&current, &initial, &[0, 1]);
        assert!(matches!(
            check_funding(&current, &next, &initial, &[0, 1]),
            Err(SubChannelError::NotFullySigned(_))
        ));
    }

    #[test]
    fn funding_must_take_from_mapped_participant() {
        let (signers, _, current) = two_party_setup(33);
        let initial = sub_channel(&signers, &current, [30, 0], 0, false);
        // Swapped index map: participant 1 would have to pay 30.
        let next = funded_next(&current, &initial, &[1, 0]);
        assert_eq!(
            check_funding(&current, &next, &initial, &[1, 0]),
            Err(SubChannelError::BalanceMismatch(1))
        );
    }

    #[test]
    fn settlement_releases_final_balances() {
        let (signers, _, current) = two_party_setup(34);
        let initial = sub_channel(&signers, &current, [30, 0], 0, false);
        let funded = funded_next(&current, &initial, &[0, 1]);

        let final_state = sub_channel(&signers, &current, [10, 20], 3, true);
        let mut settled = funded.make_next_state();
        settled.outcome.locked.clear();
        settled.outcome.balances[0][0] = 80.into();
        settled.outcome.balances[1][0] = 20.into();

        assert_eq!(check_settlement(&funded, &settled, &final_state), Ok(()));
        assert_eq!(funded.check_base_transition(&settled, 2), Ok(()));
    }

    #[test]
    fn settlement_requires_final_state() {
        let (signers, _, current) = two_party_setup(35);
        let initial = sub_channel(&signers, &current, [30, 0], 0, false);
        let funded = funded_next(&current, &initial, &[0, 1]);
        let not_final = sub_channel(&signers, &current, [10, 20], 3, false);
        let mut settled = funded.make_next_state();
        settled.outcome.locked.clear();
        assert_eq!(
            check_settlement(&funded, &settled, &not_final),
            Err(SubChannelError::NotFinal)
        );
    }

    #[test]
    fn settlement_of_unknown_sub_channel() {
        let (signers, _, current) = two_party_setup(36);
        let final_state = sub_channel(&signers, &current, [10, 20], 3, true);
        let next = current.make_next_state();
        assert_eq!(
            check_settlement(&current, &next, &final_state),
            Err(SubChannelError::UnknownSubChannel(final_state.channel_id()))
        );
    }
}
