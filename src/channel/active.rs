use super::{
    agreed_upon::AddSignatureError,
    params::Params,
    state::{InvalidUpdate, SignedState, State},
    subchannel::{self, SubChannelError},
    PartIdx,
};
use crate::{
    abiencode::types::{Hash, Signature},
    messages::{
        ChannelUpdateRejected, LedgerChannelUpdate, LedgerChannelUpdateAccepted,
        VirtualChannelFundingProposal, VirtualChannelSettlementProposal,
    },
    sig::{self, Account},
    Address,
};
use std::{fmt, sync::Arc};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProposeUpdateError {
    #[error("another update is in progress")]
    Busy,
    #[error("channel is closed")]
    Closed,
    #[error("invalid update: {0}")]
    InvalidUpdate(#[from] InvalidUpdate),
    #[error("invalid sub-channel update: {0}")]
    SubChannel(#[from] SubChannelError),
}

#[derive(Debug, Error)]
pub enum HandleUpdateError {
    #[error("another update is in progress")]
    Busy,
    #[error("channel is closed")]
    Closed,
    #[error("signature recovery failed: {0}")]
    RecoveryFailed(#[from] sig::Error),
    #[error("proposal signed by {0:?}, not by the actor")]
    InvalidSignature(Address),
    #[error("invalid update: {0}")]
    InvalidUpdate(#[from] InvalidUpdate),
    #[error("invalid sub-channel update: {0}")]
    SubChannel(#[from] SubChannelError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AcceptError {
    #[error("no update in progress")]
    NoPendingUpdate,
    #[error("update already accepted")]
    AlreadyAccepted,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApplyError {
    #[error("no update in progress")]
    NoPendingUpdate,
    #[error("missing signature of participant {0}")]
    MissingSignature(PartIdx),
}

/// Where the channel is in the current update attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePhase {
    /// No update in flight.
    Idle,
    /// We proposed and have not heard back from anyone yet.
    ProposalSent,
    /// A peer proposed and we have not decided yet.
    ProposalReceived,
    /// The proposal is acknowledged by at least one party other than the
    /// actor and the remaining signatures are being collected.
    SignaturesCollecting,
}

/// A proposed state and the signatures collected for it so far.
#[derive(Debug, Clone)]
pub struct ChannelUpdate {
    pub state: State,
    pub actor_idx: PartIdx,
    signatures: Vec<Option<Signature>>,
    phase: UpdatePhase,
}

impl ChannelUpdate {
    fn new(
        state: State,
        actor_idx: PartIdx,
        sig: Signature,
        num_parts: usize,
        phase: UpdatePhase,
    ) -> Self {
        let mut signatures = vec![None; num_parts];
        signatures[actor_idx] = Some(sig);
        ChannelUpdate {
            state,
            actor_idx,
            signatures,
            phase,
        }
    }

    pub fn missing(&self) -> Vec<PartIdx> {
        self.signatures
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_none())
            .map(|(idx, _)| idx)
            .collect()
    }

    fn signatures(&self) -> Result<Vec<Signature>, ApplyError> {
        self.signatures
            .iter()
            .enumerate()
            .map(|(idx, s)| s.ok_or(ApplyError::MissingSignature(idx)))
            .collect()
    }
}

/// Per-channel runtime object: the only owner of the channel's current
/// fully signed state.
///
/// The type does no I/O. Every operation returns the message the caller has
/// to deliver, and incoming messages are passed in by the caller. At most one
/// update can be in flight, a second proposal is refused with `Busy`.
pub struct ActiveChannel {
    account: Arc<dyn Account>,
    part_idx: PartIdx,
    current: SignedState,
    pending: Option<ChannelUpdate>,
    closed: bool,
}

impl fmt::Debug for ActiveChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveChannel")
            .field("id", &self.channel_id())
            .field("version", &self.version())
            .field("part_idx", &self.part_idx)
            .field("phase", &self.phase())
            .finish()
    }
}

impl ActiveChannel {
    pub fn new(account: Arc<dyn Account>, part_idx: PartIdx, init: SignedState) -> Self {
        debug_assert!(part_idx < init.params.num_parts());
        ActiveChannel {
            account,
            part_idx,
            current: init,
            pending: None,
            closed: false,
        }
    }

    pub fn channel_id(&self) -> Hash {
        self.current.channel_id()
    }

    pub fn version(&self) -> u64 {
        self.current.version()
    }

    pub fn part_idx(&self) -> PartIdx {
        self.part_idx
    }

    pub fn params(&self) -> &Params {
        &self.current.params
    }

    pub fn state(&self) -> &State {
        &self.current.state
    }

    pub fn signed_state(&self) -> &SignedState {
        &self.current
    }

    pub fn pending(&self) -> Option<&ChannelUpdate> {
        self.pending.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn phase(&self) -> UpdatePhase {
        self.pending.as_ref().map_or(UpdatePhase::Idle, |p| p.phase)
    }

    /// Copy of the current state with the version bumped, to be modified and
    /// passed to [Self::propose].
    pub fn next_state(&self) -> State {
        self.current.state.make_next_state()
    }

    fn num_parts(&self) -> usize {
        self.current.params.num_parts()
    }

    fn check_can_propose(&self) -> Result<(), ProposeUpdateError> {
        if self.closed {
            Err(ProposeUpdateError::Closed)
        } else if self.pending.is_some() {
            Err(ProposeUpdateError::Busy)
        } else {
            Ok(())
        }
    }

    fn sign_and_track(&mut self, new_state: State) -> LedgerChannelUpdate {
        // Sign immediately, we need the signature to send the proposal.
        let sig = self.account.sign_eth(new_state.hash());
        debug!(
            channel = ?self.channel_id(),
            version = new_state.version(),
            "proposing update"
        );
        self.pending = Some(ChannelUpdate::new(
            new_state.clone(),
            self.part_idx,
            sig,
            self.num_parts(),
            UpdatePhase::ProposalSent,
        ));
        LedgerChannelUpdate {
            state: new_state,
            actor_idx: self.part_idx,
            sig,
        }
    }

    /// Start an update to `new_state`. The returned message has to be sent to
    /// all other participants.
    pub fn propose(&mut self, new_state: State) -> Result<LedgerChannelUpdate, ProposeUpdateError> {
        self.check_can_propose()?;
        self.current
            .state
            .check_transition(&new_state, self.num_parts())?;
        Ok(self.sign_and_track(new_state))
    }

    /// Propose the next version with the finality flag set.
    pub fn close_normal(&mut self) -> Result<LedgerChannelUpdate, ProposeUpdateError> {
        let mut new_state = self.next_state();
        new_state.is_final = true;
        self.propose(new_state)
    }

    /// Propose locking funds for the sub-channel `initial`.
    pub fn propose_sub_channel_funding(
        &mut self,
        new_state: State,
        initial: SignedState,
        index_map: Vec<u16>,
    ) -> Result<VirtualChannelFundingProposal, ProposeUpdateError> {
        self.check_can_propose()?;
        self.current
            .state
            .check_base_transition(&new_state, self.num_parts())?;
        subchannel::check_funding(&self.current.state, &new_state, &initial, &index_map)?;
        Ok(VirtualChannelFundingProposal {
            update: self.sign_and_track(new_state),
            initial,
            index_map,
        })
    }

    /// Propose releasing the funds of the finalized sub-channel.
    pub fn propose_sub_channel_settlement(
        &mut self,
        new_state: State,
        final_state: SignedState,
    ) -> Result<VirtualChannelSettlementProposal, ProposeUpdateError> {
        self.check_can_propose()?;
        self.current
            .state
            .check_base_transition(&new_state, self.num_parts())?;
        subchannel::check_settlement(&self.current.state, &new_state, &final_state)?;
        Ok(VirtualChannelSettlementProposal {
            update: self.sign_and_track(new_state),
            final_state,
        })
    }

    fn check_incoming(&self, msg: &LedgerChannelUpdate) -> Result<(), HandleUpdateError> {
        if self.closed {
            return Err(HandleUpdateError::Closed);
        }
        if self.pending.is_some() {
            return Err(HandleUpdateError::Busy);
        }
        if msg.actor_idx >= self.num_parts() || msg.actor_idx == self.part_idx {
            return Err(InvalidUpdate::InvalidActor(msg.actor_idx).into());
        }
        self.current
            .state
            .check_base_transition(&msg.state, self.num_parts())?;
        let signer = sig::recover_signer(msg.state.hash(), msg.sig)?;
        if self.current.params.participants[msg.actor_idx] != signer {
            return Err(HandleUpdateError::InvalidSignature(signer));
        }
        Ok(())
    }

    fn track_incoming(&mut self, msg: LedgerChannelUpdate) {
        debug!(
            channel = ?self.channel_id(),
            version = msg.state.version(),
            actor = msg.actor_idx,
            "received update proposal"
        );
        self.pending = Some(ChannelUpdate::new(
            msg.state,
            msg.actor_idx,
            msg.sig,
            self.num_parts(),
            UpdatePhase::ProposalReceived,
        ));
    }

    /// Validate a peer's proposal. On success the update is pending and the
    /// caller decides between [Self::accept] and [Self::reject].
    pub fn handle_update(&mut self, msg: LedgerChannelUpdate) -> Result<(), HandleUpdateError> {
        self.check_incoming(&msg)?;
        if msg.state.outcome.locked != self.current.state.outcome.locked {
            return Err(InvalidUpdate::LockedMismatch.into());
        }
        self.track_incoming(msg);
        Ok(())
    }

    pub fn handle_sub_channel_funding(
        &mut self,
        msg: VirtualChannelFundingProposal,
    ) -> Result<(), HandleUpdateError> {
        self.check_incoming(&msg.update)?;
        subchannel::check_funding(
            &self.current.state,
            &msg.update.state,
            &msg.initial,
            &msg.index_map,
        )?;
        self.track_incoming(msg.update);
        Ok(())
    }

    pub fn handle_sub_channel_settlement(
        &mut self,
        msg: VirtualChannelSettlementProposal,
    ) -> Result<(), HandleUpdateError> {
        self.check_incoming(&msg.update)?;
        subchannel::check_settlement(&self.current.state, &msg.update.state, &msg.final_state)?;
        self.track_incoming(msg.update);
        Ok(())
    }

    /// Sign the pending proposal. The returned message goes to all other
    /// participants.
    pub fn accept(&mut self) -> Result<LedgerChannelUpdateAccepted, AcceptError> {
        let channel = self.channel_id();
        let part_idx = self.part_idx;
        let pending = self.pending.as_mut().ok_or(AcceptError::NoPendingUpdate)?;
        if pending.signatures[part_idx].is_some() {
            return Err(AcceptError::AlreadyAccepted);
        }
        let sig = self.account.sign_eth(pending.state.hash());
        pending.signatures[part_idx] = Some(sig);
        pending.phase = UpdatePhase::SignaturesCollecting;
        Ok(LedgerChannelUpdateAccepted {
            channel,
            version: pending.state.version(),
            sig,
        })
    }

    /// Refuse the pending proposal and drop it.
    pub fn reject(&mut self, reason: &str) -> Result<ChannelUpdateRejected, AcceptError> {
        let pending = self.pending.take().ok_or(AcceptError::NoPendingUpdate)?;
        debug!(
            channel = ?self.channel_id(),
            version = pending.state.version(),
            reason,
            "rejecting update"
        );
        Ok(ChannelUpdateRejected {
            channel: self.channel_id(),
            version: pending.state.version(),
            reason: reason.to_string(),
        })
    }

    /// Add the signature of participant `part_idx` on the pending state.
    pub fn handle_accepted(
        &mut self,
        part_idx: PartIdx,
        msg: &LedgerChannelUpdateAccepted,
    ) -> Result<(), AddSignatureError> {
        if msg.channel != self.channel_id() {
            return Err(AddSignatureError::InvalidChannelID);
        }
        let participant = *self
            .current
            .params
            .participants
            .get(part_idx)
            .ok_or(AddSignatureError::InvalidParticipant(part_idx))?;
        let pending = self
            .pending
            .as_mut()
            .ok_or(AddSignatureError::NoPendingUpdate)?;
        if msg.version != pending.state.version() {
            return Err(AddSignatureError::InvalidVersionNumber {
                expected: pending.state.version(),
                got: msg.version,
            });
        }

        let signer = sig::recover_signer(pending.state.hash(), msg.sig)?;
        if participant != signer {
            return Err(AddSignatureError::InvalidSignature(signer));
        }

        match pending.signatures[part_idx] {
            Some(_) => Err(AddSignatureError::AlreadySigned(part_idx)),
            None => {
                pending.signatures[part_idx] = Some(msg.sig);
                pending.phase = UpdatePhase::SignaturesCollecting;
                Ok(())
            }
        }
    }

    /// Drop the pending update if `msg` refers to it. Returns whether it did.
    pub fn handle_rejected(&mut self, msg: &ChannelUpdateRejected) -> bool {
        let matches = msg.channel == self.channel_id()
            && self
                .pending
                .as_ref()
                .map_or(false, |p| p.state.version() == msg.version);
        if matches {
            debug!(
                channel = ?self.channel_id(),
                version = msg.version,
                reason = %msg.reason,
                "update rejected by peer"
            );
            self.pending = None;
        }
        matches
    }

    /// Participants whose signature on the pending state is missing.
    pub fn missing_signatures(&self) -> Vec<PartIdx> {
        self.pending.as_ref().map_or(vec![], ChannelUpdate::missing)
    }

    /// Replace the current state with the pending one once every signature
    /// is present. On error nothing changes.
    pub fn apply(&mut self) -> Result<&SignedState, ApplyError> {
        let pending = self.pending.as_ref().ok_or(ApplyError::NoPendingUpdate)?;
        let sigs = pending.signatures()?;
        let state = pending.state.clone();
        self.pending = None;
        self.current = SignedState {
            params: self.current.params.clone(),
            state,
            sigs,
        };
        debug!(
            channel = ?self.channel_id(),
            version = self.version(),
            "update applied"
        );
        Ok(&self.current)
    }

    /// Discard the pending update, e.g. after a timeout.
    pub fn abort(&mut self) {
        if let Some(p) = self.pending.take() {
            debug!(
                channel = ?self.channel_id(),
                version = p.state.version(),
                "update aborted"
            );
        }
    }

    /// The channel was concluded on-chain with `registered`. No further
    /// off-chain updates are possible.
    pub(crate) fn settle(&mut self, registered: SignedState) {
        self.pending = None;
        self.current = registered;
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        abiencode::types::U256,
        channel::{
            allocation::{Allocation, Asset},
            state::tests::two_party_setup,
            subchannel::tests::{funded_next, sub_channel},
        },
        sig::Signer,
    };
    use rand::{rngs::StdRng, SeedableRng};

    fn channels(seed: u64) -> (Vec<Arc<Signer>>, ActiveChannel, ActiveChannel) {
        let (signers, params, state) = two_party_setup(seed);
        let hash = state.hash();
        let signed = SignedState {
            params,
            sigs: signers.iter().map(|s| s.sign_eth(hash)).collect(),
            state,
        };
        let signers: Vec<Arc<Signer>> = signers.into_iter().map(Arc::new).collect();
        let a = ActiveChannel::new(signers[0].clone(), 0, signed.clone());
        let b = ActiveChannel::new(signers[1].clone(), 1, signed);
        (signers, a, b)
    }

    fn pay(ch: &ActiveChannel, amount: u64) -> State {
        let mut next = ch.next_state();
        next.outcome.transfer(0, 0, 1, amount.into()).unwrap();
        next
    }

    #[test]
    fn two_party_update() {
        let (_, mut a, mut b) = channels(60);
        let proposal = a.propose(pay(&a, 20)).unwrap();
        assert_eq!(a.phase(), UpdatePhase::ProposalSent);

        b.handle_update(proposal).unwrap();
        assert_eq!(b.phase(), UpdatePhase::ProposalReceived);
        let acc = b.accept().unwrap();
        assert_eq!(b.phase(), UpdatePhase::SignaturesCollecting);

        a.handle_accepted(1, &acc).unwrap();
        let applied = a.apply().unwrap().clone();
        b.apply().unwrap();

        assert!(applied.is_fully_signed());
        assert_eq!(a.signed_state(), b.signed_state());
        assert_eq!(a.version(), 1);
        assert_eq!(a.state().outcome.balances[1][0], 20.into());
        assert_eq!(a.phase(), UpdatePhase::Idle);
    }

    #[test]
    fn rejection_keeps_current_state() {
        let (_, mut a, mut b) = channels(61);
        let before = a.signed_state().clone();
        let proposal = a.propose(pay(&a, 20)).unwrap();
        b.handle_update(proposal).unwrap();
        let rej = b.reject("no thanks").unwrap();

        assert!(a.handle_rejected(&rej));
        assert_eq!(a.phase(), UpdatePhase::Idle);
        assert_eq!(b.phase(), UpdatePhase::Idle);
        assert_eq!(a.signed_state(), &before);
        assert_eq!(b.signed_state(), &before);
    }

    #[test]
    fn second_proposal_is_busy() {
        let (_, mut a, mut b) = channels(62);
        let from_a = a.propose(pay(&a, 10)).unwrap();
        b.handle_update(from_a).unwrap();

        assert_eq!(
            b.propose(b.next_state()).unwrap_err(),
            ProposeUpdateError::Busy
        );

        let (_, mut a2, _) = channels(62);
        let other = a2.propose(pay(&a2, 5)).unwrap();
        assert!(matches!(b.handle_update(other), Err(HandleUpdateError::Busy)));
        // The first proposal is untouched.
        assert_eq!(b.pending().unwrap().state.outcome.balances[1][0], 10.into());
    }

    #[test]
    fn forged_actor_signature_is_rejected() {
        let (signers, _, mut b) = channels(63);
        let mut next = b.next_state();
        next.outcome.transfer(0, 0, 1, 50.into()).unwrap();
        // Signed by B, claims to come from A.
        let msg = LedgerChannelUpdate {
            sig: signers[1].sign_eth(next.hash()),
            state: next,
            actor_idx: 0,
        };
        assert!(matches!(
            b.handle_update(msg),
            Err(HandleUpdateError::InvalidSignature(_))
        ));
        assert_eq!(b.phase(), UpdatePhase::Idle);
    }

    #[test]
    fn value_creating_update_is_rejected() {
        let (signers, mut a, mut b) = channels(64);
        let mut next = a.next_state();
        next.outcome.balances[1][0] = 1000.into();
        assert!(matches!(
            a.propose(next.clone()),
            Err(ProposeUpdateError::InvalidUpdate(
                InvalidUpdate::TotalAllocationAmountMismatch
            ))
        ));

        let msg = LedgerChannelUpdate {
            sig: signers[0].sign_eth(next.hash()),
            state: next,
            actor_idx: 0,
        };
        assert!(matches!(
            b.handle_update(msg),
            Err(HandleUpdateError::InvalidUpdate(
                InvalidUpdate::TotalAllocationAmountMismatch
            ))
        ));
    }

    #[test]
    fn apply_without_all_signatures_fails() {
        let (_, mut a, _) = channels(65);
        a.propose(pay(&a, 1)).unwrap();
        assert_eq!(a.missing_signatures(), vec![1]);
        assert_eq!(a.apply().unwrap_err(), ApplyError::MissingSignature(1));
        assert_eq!(a.version(), 0);

        a.abort();
        assert_eq!(a.phase(), UpdatePhase::Idle);
        assert_eq!(a.version(), 0);
    }

    #[test]
    fn acceptance_for_wrong_version_is_ignored() {
        let (signers, mut a, _) = channels(66);
        let proposal = a.propose(pay(&a, 1)).unwrap();
        let acc = LedgerChannelUpdateAccepted {
            channel: a.channel_id(),
            version: 7,
            sig: signers[1].sign_eth(proposal.state.hash()),
        };
        assert!(matches!(
            a.handle_accepted(1, &acc),
            Err(AddSignatureError::InvalidVersionNumber { expected: 1, got: 7 })
        ));
    }

    #[test]
    fn close_normal_makes_state_final() {
        let (_, mut a, mut b) = channels(67);
        let proposal = a.close_normal().unwrap();
        assert!(proposal.state.is_final);
        b.handle_update(proposal).unwrap();
        let acc = b.accept().unwrap();
        a.handle_accepted(1, &acc).unwrap();
        a.apply().unwrap();

        assert!(matches!(
            a.propose(a.next_state()),
            Err(ProposeUpdateError::InvalidUpdate(
                InvalidUpdate::CurrentStateIsFinal
            ))
        ));
    }

    #[test]
    fn three_party_update_collects_all_signatures() {
        let mut rng = StdRng::seed_from_u64(68);
        let signers: Vec<Arc<Signer>> = (0..3).map(|_| Arc::new(Signer::new(&mut rng))).collect();
        let params = Params::new_ledger(
            60,
            U256::from(1),
            signers.iter().map(|s| s.address()).collect(),
        );
        let alloc = Allocation::new(
            vec![Asset::new(1.into(), Address([1; 20]))],
            vec![vec![10.into()], vec![10.into()], vec![10.into()]],
        )
        .unwrap();
        let state = State::new(&params, alloc);
        let hash = state.hash();
        let signed = SignedState {
            params,
            sigs: signers.iter().map(|s| s.sign_eth(hash)).collect(),
            state,
        };
        let mut chans: Vec<ActiveChannel> = signers
            .iter()
            .enumerate()
            .map(|(i, s)| ActiveChannel::new(s.clone(), i, signed.clone()))
            .collect();

        let mut next = chans[1].next_state();
        next.outcome.transfer(0, 1, 2, 5.into()).unwrap();
        let proposal = chans[1].propose(next).unwrap();

        let mut accs = vec![];
        for i in [0, 2] {
            chans[i].handle_update(proposal.clone()).unwrap();
            accs.push((i, chans[i].accept().unwrap()));
        }
        // Every participant needs every acknowledgement.
        for (from, acc) in &accs {
            for (to, ch) in chans.iter_mut().enumerate() {
                if to != *from {
                    ch.handle_accepted(*from, acc).unwrap();
                }
            }
        }
        for ch in chans.iter_mut() {
            ch.apply().unwrap();
        }
        assert!(chans.iter().all(|c| c.version() == 1));
        assert!(chans[0].signed_state().is_fully_signed());
    }

    #[test]
    fn sub_channel_funding_update() {
        let (_, mut a, mut b) = channels(69);
        let initial = sub_channel(
            &[
                Signer::from_secret_bytes(&[1; 32]).unwrap(),
                Signer::from_secret_bytes(&[2; 32]).unwrap(),
            ],
            a.state(),
            [30, 0],
            0,
            false,
        );
        let next = funded_next(a.state(), &initial, &[0, 1]);
        let proposal = a
            .propose_sub_channel_funding(next, initial, vec![0, 1])
            .unwrap();

        // A plain update must not touch locked funds.
        assert!(matches!(
            b.handle_update(proposal.update.clone()),
            Err(HandleUpdateError::InvalidUpdate(InvalidUpdate::LockedMismatch))
        ));
        b.handle_sub_channel_funding(proposal).unwrap();
        let acc = b.accept().unwrap();
        a.handle_accepted(1, &acc).unwrap();
        a.apply().unwrap();
        assert_eq!(a.state().outcome.locked.len(), 1);
    }

    #[test]
    fn settled_channel_refuses_updates() {
        let (_, mut a, _) = channels(70);
        let registered = a.signed_state().clone();
        a.settle(registered);
        assert_eq!(
            a.propose(a.next_state()).unwrap_err(),
            ProposeUpdateError::Closed
        );
    }
}
