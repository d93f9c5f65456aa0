use super::{params::Params, state::SignedState, state::State, PartIdx};
use crate::{
    abiencode::types::{Address, Signature},
    messages::LedgerChannelUpdateAccepted,
    sig::{self, Account},
};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignError {
    #[error("already signed")]
    AlreadySigned,
}

#[derive(Debug, Error)]
pub enum AddSignatureError {
    #[error("signature recovery failed: {0}")]
    RecoveryFailed(#[from] sig::Error),
    #[error("participant {0} already signed")]
    AlreadySigned(PartIdx),
    #[error("signature by {0:?} does not belong to the expected participant")]
    InvalidSignature(Address),
    #[error("message is for a different channel")]
    InvalidChannelID,
    #[error("expected version {expected}, got {got}")]
    InvalidVersionNumber { expected: u64, got: u64 },
    #[error("no update in progress")]
    NoPendingUpdate,
    #[error("participant index {0} is out of range")]
    InvalidParticipant(PartIdx),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("missing signature of participant {0}")]
    MissingSignatureResponse(PartIdx),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("account {0:?} is not a participant of the channel")]
pub struct NotAParticipant(pub Address);

/// Parameters and initial state are fixed, signatures on version 0 are being
/// exchanged. Once built, the resulting [SignedState] is the funding request
/// and the starting point of the [super::ActiveChannel].
#[derive(Debug)]
pub struct AgreedUponChannel {
    account: Arc<dyn Account>,
    part_idx: PartIdx,
    params: Params,
    init_state: State,
    signatures: Vec<Option<Signature>>,
}

impl AgreedUponChannel {
    pub fn new(
        account: Arc<dyn Account>,
        params: Params,
        init_state: State,
    ) -> Result<Self, NotAParticipant> {
        let part_idx = params
            .index_of(&account.address())
            .ok_or(NotAParticipant(account.address()))?;
        let signatures = vec![None; params.num_parts()];
        Ok(AgreedUponChannel {
            account,
            part_idx,
            params,
            init_state,
            signatures,
        })
    }

    pub fn part_idx(&self) -> PartIdx {
        self.part_idx
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn state(&self) -> &State {
        &self.init_state
    }

    /// Sign the initial state, returning the message for the other
    /// participants.
    pub fn sign(&mut self) -> Result<LedgerChannelUpdateAccepted, SignError> {
        match self.signatures[self.part_idx] {
            Some(_) => Err(SignError::AlreadySigned),
            None => {
                let sig = self.account.sign_eth(self.init_state.hash());
                self.signatures[self.part_idx] = Some(sig);
                Ok(LedgerChannelUpdateAccepted {
                    channel: self.init_state.channel_id(),
                    version: self.init_state.version(),
                    sig,
                })
            }
        }
    }

    /// Add the signature of another participant. The participant is derived
    /// from the signature.
    pub fn add_signature(
        &mut self,
        msg: &LedgerChannelUpdateAccepted,
    ) -> Result<PartIdx, AddSignatureError> {
        if msg.channel != self.init_state.channel_id() {
            return Err(AddSignatureError::InvalidChannelID);
        }
        if msg.version != 0 {
            return Err(AddSignatureError::InvalidVersionNumber {
                expected: 0,
                got: msg.version,
            });
        }

        let signer = sig::recover_signer(self.init_state.hash(), msg.sig)?;

        // Verify signature is coming from a valid participant.
        let part_idx = self
            .params
            .index_of(&signer)
            .ok_or(AddSignatureError::InvalidSignature(signer))?;

        match self.signatures[part_idx] {
            Some(_) => Err(AddSignatureError::AlreadySigned(part_idx)),
            None => {
                self.signatures[part_idx] = Some(msg.sig);
                Ok(part_idx)
            }
        }
    }

    pub fn missing_signatures(&self) -> Vec<PartIdx> {
        self.signatures
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_none())
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Make sure we have the signature from all participants. They have
    /// already been verified in `add_signature()` or we created it ourselves
    /// with `sign()`.
    pub fn build(self) -> Result<SignedState, BuildError> {
        let mut sigs = Vec::with_capacity(self.signatures.len());
        for (part_idx, s) in self.signatures.iter().enumerate() {
            sigs.push(s.ok_or(BuildError::MissingSignatureResponse(part_idx))?);
        }
        Ok(SignedState {
            params: self.params,
            state: self.init_state,
            sigs,
        })
    }
}
