use super::PartIdx;
use crate::abiencode::{
    self,
    encoder::{AbiEncode, Token},
    types::{Address, Hash, U256},
};

/// Parameters for this channel, exchanged during channel setup and sent
/// on-chain during a dispute.
///
/// The channel id is derived from these fields only, so participants who
/// agree on the parameters agree on the id without any registration step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Params {
    /// On-chain dispute timeout in seconds.
    pub challenge_duration: u64,
    pub nonce: U256,
    pub participants: Vec<Address>,
    /// App logic contract, the zero address for plain payment channels.
    pub app: Address,
    pub ledger_channel: bool,
    pub virtual_channel: bool,
}

impl Params {
    /// Parameters of a plain ledger (payment) channel.
    pub fn new_ledger(challenge_duration: u64, nonce: U256, participants: Vec<Address>) -> Self {
        Self {
            challenge_duration,
            nonce,
            participants,
            app: Address::default(),
            ledger_channel: true,
            virtual_channel: false,
        }
    }

    /// `keccak256(abi.encode(params))`
    pub fn channel_id(&self) -> Hash {
        abiencode::to_hash(self)
    }

    pub fn num_parts(&self) -> usize {
        self.participants.len()
    }

    pub fn index_of(&self, addr: &Address) -> Option<PartIdx> {
        self.participants.iter().position(|p| p == addr)
    }
}

impl AbiEncode for Params {
    fn to_token(&self) -> Token {
        Token::Tuple(vec![
            self.challenge_duration.to_token(),
            self.nonce.to_token(),
            self.participants.to_token(),
            self.app.to_token(),
            self.ledger_channel.to_token(),
            self.virtual_channel.to_token(),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn random_params(rng: &mut StdRng) -> Params {
        Params::new_ledger(rng.gen_range(1..1000), rng.gen(), vec![rng.gen(), rng.gen()])
    }

    #[test]
    fn channel_id_is_deterministic() {
        let mut rng = StdRng::seed_from_u64(0);
        let params = random_params(&mut rng);
        let copy = Params {
            participants: params.participants.clone(),
            ..params.clone()
        };
        assert_eq!(params.channel_id(), copy.channel_id());
    }

    #[test]
    fn channel_id_depends_on_every_field() {
        let mut rng = StdRng::seed_from_u64(1);
        let base = random_params(&mut rng);
        let id = base.channel_id();

        let variants = [
            Params {
                challenge_duration: base.challenge_duration + 1,
                ..base.clone()
            },
            Params {
                nonce: base.nonce + U256::one(),
                ..base.clone()
            },
            Params {
                participants: vec![base.participants[1], base.participants[0]],
                ..base.clone()
            },
            Params {
                app: Address([1; 20]),
                ..base.clone()
            },
            Params {
                virtual_channel: true,
                ..base.clone()
            },
        ];
        for v in variants {
            assert_ne!(v.channel_id(), id, "{:?}", v);
        }
    }

    #[test]
    fn index_of_participant() {
        let mut rng = StdRng::seed_from_u64(2);
        let params = random_params(&mut rng);
        assert_eq!(params.index_of(&params.participants[1]), Some(1));
        assert_eq!(params.index_of(&Address([0xee; 20])), None);
    }
}
