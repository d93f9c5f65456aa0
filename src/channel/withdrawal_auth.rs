use super::{params::Params, state::State, PartIdx};
use crate::{
    abiencode::{
        self,
        encoder::{AbiEncode, Token},
        types::{Signature, U256},
    },
    sig::{self, Account},
    Address, Hash,
};

/// Authorization for the adjudicator to pay out one participant's balance of
/// one asset to an on-chain receiver.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct WithdrawalAuth {
    pub channel_id: Hash,
    pub participant: Address, // Off-chain channel address
    pub receiver: Address,    // On-chain receiver of funds on withdrawal
    pub amount: U256,
}

impl AbiEncode for WithdrawalAuth {
    fn to_token(&self) -> Token {
        Token::Tuple(vec![
            self.channel_id.to_token(),
            self.participant.to_token(),
            self.receiver.to_token(),
            self.amount.to_token(),
        ])
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SignedWithdrawalAuth {
    pub auth: WithdrawalAuth,
    pub sig: Signature,
}

impl SignedWithdrawalAuth {
    /// The signature was made by the participant named in the auth.
    pub fn verify(&self) -> bool {
        sig::verify(self.auth.participant, abiencode::to_hash(&self.auth), self.sig)
    }
}

/// One signed auth per asset of `state`, in asset order.
pub fn make_signed_withdrawal_auths(
    account: &dyn Account,
    params: &Params,
    state: &State,
    withdraw_receiver: Address,
    part_idx: PartIdx,
) -> Vec<SignedWithdrawalAuth> {
    (0..state.outcome.num_assets())
        .map(|asset| {
            let auth = WithdrawalAuth {
                channel_id: state.channel_id(),
                participant: params.participants[part_idx],
                receiver: withdraw_receiver,
                amount: state.outcome.balances[part_idx][asset],
            };
            SignedWithdrawalAuth {
                auth,
                sig: account.sign_eth(abiencode::to_hash(&auth)),
            }
        })
        .collect()
}
