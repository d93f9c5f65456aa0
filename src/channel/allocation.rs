//! Asset and balance bookkeeping.
//!
//! An [Allocation] distributes every asset of a channel over its participants
//! and over locked sub-channels. Updates may move funds around but must never
//! change the per-asset total, see [Allocation::equal_sum].

use crate::abiencode::{
    encoder::{AbiEncode, Token},
    types::{Address, Hash, U256},
};
use thiserror::Error;

use super::PartIdx;

/// Uniquely identifies an Asset by blockchain + AssetHolder (the deposit
/// holder contract).
///
/// Assets are immutable values, sharing one between allocations is a copy.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct Asset {
    pub chain_id: U256,
    pub holder: Address,
}

/// Length prefix width used in [Asset::to_bytes].
const LEN_SIZE: usize = 2;

impl Asset {
    pub fn new(chain_id: U256, holder: Address) -> Self {
        Self { chain_id, holder }
    }

    /// Stable identifier of this asset, `keccak256(abi.encode(asset))`.
    pub fn id(&self) -> Hash {
        crate::abiencode::to_hash(self)
    }

    /// Wire representation: each field is prefixed by its length as a
    /// little-endian u16, chain id first.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut b = Vec::with_capacity(2 * LEN_SIZE + 32 + 20);
        b.extend_from_slice(&32u16.to_le_bytes());
        b.extend_from_slice(&self.chain_id.to_be_bytes());
        b.extend_from_slice(&20u16.to_le_bytes());
        b.extend_from_slice(&self.holder.0);
        b
    }

    /// Inverse of [Asset::to_bytes]. Chain ids shorter than 32 bytes are
    /// accepted, as long as the length prefixes match the buffer.
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        let (chain_id_len, b) = split_len(b)?;
        if chain_id_len > 32 || b.len() < chain_id_len {
            return None;
        }
        let chain_id = U256::from_big_endian(&b[..chain_id_len]);
        let (holder_len, b) = split_len(&b[chain_id_len..])?;
        if holder_len != 20 || b.len() != 20 {
            return None;
        }
        let holder = Address::try_from(b).ok()?;
        Some(Self { chain_id, holder })
    }
}

fn split_len(b: &[u8]) -> Option<(usize, &[u8])> {
    if b.len() < LEN_SIZE {
        return None;
    }
    let len = u16::from_le_bytes([b[0], b[1]]) as usize;
    Some((len, &b[LEN_SIZE..]))
}

impl AbiEncode for Asset {
    fn to_token(&self) -> Token {
        Token::Tuple(vec![self.chain_id.to_token(), self.holder.to_token()])
    }
}

/// Funds of every asset locked into a sub-channel `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAlloc {
    pub id: Hash,
    /// One balance per asset of the parent allocation.
    pub balances: Vec<U256>,
    /// Maps sub-channel participant indices to parent participant indices.
    pub index_map: Vec<u16>,
}

impl SubAlloc {
    pub fn new(id: Hash, balances: Vec<U256>, index_map: Vec<u16>) -> Self {
        Self {
            id,
            balances,
            index_map,
        }
    }
}

impl AbiEncode for SubAlloc {
    fn to_token(&self) -> Token {
        Token::Tuple(vec![
            self.id.to_token(),
            self.balances.to_token(),
            self.index_map.to_token(),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocationError {
    #[error("assets and participant balances must not be of length zero")]
    EmptyDimension,
    #[error("dimension mismatch of participant {participant}'s balance vector: expected {expected} assets, got {actual}")]
    ParticipantDimension {
        participant: PartIdx,
        expected: usize,
        actual: usize,
    },
    #[error("dimension mismatch of sub-channel balance vector (ID: {id:?}): expected {expected} assets, got {actual}")]
    SubAllocDimension {
        id: Hash,
        expected: usize,
        actual: usize,
    },
    #[error("cannot compare sums over {left} and {right} assets")]
    AssetCountMismatch { left: usize, right: usize },
    #[error("sum of asset {asset} overflows 256 bits")]
    Overflow { asset: usize },
    #[error("participant {participant} has insufficient balance of asset {asset}")]
    InsufficientBalance { participant: PartIdx, asset: usize },
    #[error("index out of range")]
    OutOfRange,
}

/// Stores which participant has how much of each asset, plus the funds
/// locked in sub-channels.
///
/// The fields are public so updates can be written directly. Whoever does so
/// must keep the allocation [valid](Allocation::valid): everything taking an
/// allocation from outside (state transitions, funding requests, the
/// ledger) checks it again and refuses malformed ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    /// The asset types held in the channel. Their order defines the asset
    /// index used in every balance vector.
    pub assets: Vec<Asset>,
    /// `balances[participant][asset]`
    pub balances: Vec<Vec<U256>>,
    /// Sub-channel allocations, may be empty.
    pub locked: Vec<SubAlloc>,
}

impl Allocation {
    /// Create a validated allocation without locked funds.
    pub fn new(assets: Vec<Asset>, balances: Vec<Vec<U256>>) -> Result<Self, AllocationError> {
        Self::with_locked(assets, balances, Vec::new())
    }

    pub fn with_locked(
        assets: Vec<Asset>,
        balances: Vec<Vec<U256>>,
        locked: Vec<SubAlloc>,
    ) -> Result<Self, AllocationError> {
        let alloc = Self {
            assets,
            balances,
            locked,
        };
        alloc.valid()?;
        Ok(alloc)
    }

    pub fn num_assets(&self) -> usize {
        self.assets.len()
    }

    pub fn num_parts(&self) -> usize {
        self.balances.len()
    }

    /// Checks that the asset dimensions match and that there is at least one
    /// asset and one participant.
    pub fn valid(&self) -> Result<(), AllocationError> {
        if self.assets.is_empty() || self.balances.is_empty() {
            return Err(AllocationError::EmptyDimension);
        }

        let n = self.assets.len();
        for (participant, bals) in self.balances.iter().enumerate() {
            if bals.len() != n {
                return Err(AllocationError::ParticipantDimension {
                    participant,
                    expected: n,
                    actual: bals.len(),
                });
            }
        }

        for sub in &self.locked {
            if sub.balances.len() != n {
                return Err(AllocationError::SubAllocDimension {
                    id: sub.id,
                    expected: n,
                    actual: sub.balances.len(),
                });
            }
        }

        Ok(())
    }

    /// Per-asset total over all participants and locked sub-channels, or an
    /// error if the allocation is malformed or a total overflows.
    pub fn try_sum(&self) -> Result<Vec<U256>, AllocationError> {
        self.valid()?;

        let mut totals = vec![U256::zero(); self.assets.len()];
        let rows = self
            .balances
            .iter()
            .map(Vec::as_slice)
            .chain(self.locked.iter().map(|sub| sub.balances.as_slice()));
        for row in rows {
            for (asset, (total, bal)) in totals.iter_mut().zip(row).enumerate() {
                *total = total
                    .checked_add(*bal)
                    .ok_or(AllocationError::Overflow { asset })?;
            }
        }
        Ok(totals)
    }

    /// Per-asset total over all participants and locked sub-channels.
    ///
    /// # Panics
    ///
    /// The allocation must be valid (see [Allocation::valid]); calling this on
    /// a malformed allocation is a construction bug upstream. Values received
    /// from peers must go through [Allocation::try_sum] or
    /// [Allocation::equal_sum] instead.
    pub fn sum(&self) -> Vec<U256> {
        match self.try_sum() {
            Ok(totals) => totals,
            Err(e) => panic!("Allocation::sum on malformed allocation: {}", e),
        }
    }

    /// Whether both allocations hold the same total of every asset.
    ///
    /// Returns an error only if the comparison itself is impossible
    /// (malformed allocation or differing asset count).
    pub fn equal_sum(&self, other: &Allocation) -> Result<bool, AllocationError> {
        let (s0, s1) = (self.try_sum()?, other.try_sum()?);
        if s0.len() != s1.len() {
            return Err(AllocationError::AssetCountMismatch {
                left: s0.len(),
                right: s1.len(),
            });
        }
        Ok(s0 == s1)
    }

    pub fn balance(&self, participant: PartIdx, asset: usize) -> Option<U256> {
        self.balances.get(participant)?.get(asset).copied()
    }

    /// Move `amount` of `asset` from one participant to another. On error
    /// the allocation is unchanged.
    pub fn transfer(
        &mut self,
        asset: usize,
        from: PartIdx,
        to: PartIdx,
        amount: U256,
    ) -> Result<(), AllocationError> {
        let from_bal = self.balance(from, asset).ok_or(AllocationError::OutOfRange)?;
        let to_bal = self.balance(to, asset).ok_or(AllocationError::OutOfRange)?;
        let new_from = from_bal
            .checked_sub(amount)
            .ok_or(AllocationError::InsufficientBalance {
                participant: from,
                asset,
            })?;
        if from == to {
            return Ok(());
        }
        let new_to = to_bal
            .checked_add(amount)
            .ok_or(AllocationError::Overflow { asset })?;
        self.balances[from][asset] = new_from;
        self.balances[to][asset] = new_to;
        Ok(())
    }

    pub fn sub_alloc(&self, id: Hash) -> Option<&SubAlloc> {
        self.locked.iter().find(|sub| sub.id == id)
    }
}

impl AbiEncode for Allocation {
    fn to_token(&self) -> Token {
        // On-chain balances are indexed [asset][participant].
        let by_asset: Vec<Vec<U256>> = (0..self.assets.len())
            .map(|asset| {
                self.balances
                    .iter()
                    .map(|bals| bals.get(asset).copied().unwrap_or_default())
                    .collect()
            })
            .collect();

        Token::Tuple(vec![
            self.assets.to_token(),
            by_asset.to_token(),
            self.locked.to_token(),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn random_alloc(rng: &mut StdRng, assets: usize, parts: usize, locked: usize) -> Allocation {
        let small = |rng: &mut StdRng| U256::from(rng.gen::<u64>());
        Allocation::with_locked(
            (0..assets).map(|_| Asset::new(1.into(), rng.gen())).collect(),
            (0..parts)
                .map(|_| (0..assets).map(|_| small(rng)).collect())
                .collect(),
            (0..locked)
                .map(|_| SubAlloc::new(rng.gen(), (0..assets).map(|_| small(rng)).collect(), vec![0, 1]))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn sum_over_parts_and_locked() {
        let asset = Asset::default();
        let alloc = Allocation::with_locked(
            vec![asset, asset],
            vec![vec![1.into(), 10.into()], vec![2.into(), 20.into()]],
            vec![SubAlloc::new(Hash::default(), vec![4.into(), 40.into()], vec![])],
        )
        .unwrap();

        assert_eq!(alloc.sum(), vec![U256::from(7), U256::from(70)]);
    }

    #[test]
    fn clone_is_deep() {
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..8 {
            let orig = random_alloc(&mut rng, 3, 2, 1);
            let mut clone = orig.clone();
            assert_eq!(clone.sum(), orig.sum());

            let before = orig.balances.clone();
            clone.balances[0][0] = clone.balances[0][0] + U256::one();
            clone.locked[0].balances[1] = U256::zero();
            assert_eq!(orig.balances, before);
            assert_ne!(orig, clone);
        }
    }

    #[test]
    fn cloning_absent_allocation_yields_none() {
        let none: Option<Allocation> = None;
        assert_eq!(none.clone(), None);
    }

    #[test]
    fn empty_dimensions_are_invalid() {
        assert_eq!(
            Allocation::new(vec![], vec![vec![]]),
            Err(AllocationError::EmptyDimension)
        );
        assert_eq!(
            Allocation::new(vec![Asset::default()], vec![]),
            Err(AllocationError::EmptyDimension)
        );
    }

    #[test]
    fn participant_row_mismatch_names_participant() {
        let err = Allocation::new(
            vec![Asset::default(), Asset::default()],
            vec![vec![1.into(), 2.into()], vec![3.into()]],
        )
        .unwrap_err();
        assert_eq!(
            err,
            AllocationError::ParticipantDimension {
                participant: 1,
                expected: 2,
                actual: 1
            }
        );
        assert!(err.to_string().contains("participant 1"));
    }

    #[test]
    fn locked_row_mismatch_names_subchannel() {
        let id = Hash([9; 32]);
        let err = Allocation::with_locked(
            vec![Asset::default()],
            vec![vec![1.into()]],
            vec![SubAlloc::new(id, vec![1.into(), 2.into()], vec![])],
        )
        .unwrap_err();
        assert!(matches!(err, AllocationError::SubAllocDimension { id: i, .. } if i == id));
    }

    #[test]
    #[should_panic(expected = "malformed allocation")]
    fn sum_of_malformed_allocation_panics() {
        let mut alloc = Allocation::new(vec![Asset::default()], vec![vec![1.into()]]).unwrap();
        alloc.balances.push(vec![]);
        alloc.sum();
    }

    #[test]
    fn try_sum_reports_overflow() {
        let alloc = Allocation::new(
            vec![Asset::default()],
            vec![vec![U256::max_value()], vec![U256::one()]],
        )
        .unwrap();
        assert_eq!(alloc.try_sum(), Err(AllocationError::Overflow { asset: 0 }));
    }

    #[test]
    fn equal_sum_after_transfer() {
        let mut rng = StdRng::seed_from_u64(1);
        let orig = random_alloc(&mut rng, 2, 3, 0);
        let mut moved = orig.clone();
        let amount = moved.balances[0][1] / U256::from(2);
        moved.transfer(1, 0, 2, amount).unwrap();
        assert_eq!(orig.equal_sum(&moved), Ok(true));

        moved.balances[1][0] = moved.balances[1][0] + U256::one();
        assert_eq!(orig.equal_sum(&moved), Ok(false));
    }

    #[test]
    fn equal_sum_dimension_mismatch_is_error() {
        let one = Allocation::new(vec![Asset::default()], vec![vec![1.into()]]).unwrap();
        let two = Allocation::new(
            vec![Asset::default(), Asset::default()],
            vec![vec![1.into(), 0.into()]],
        )
        .unwrap();
        assert_eq!(
            one.equal_sum(&two),
            Err(AllocationError::AssetCountMismatch { left: 1, right: 2 })
        );
    }

    #[test]
    fn transfer_rejects_overdraft() {
        let mut alloc = Allocation::new(vec![Asset::default()], vec![vec![5.into()], vec![0.into()]]).unwrap();
        assert_eq!(
            alloc.transfer(0, 0, 1, 6.into()),
            Err(AllocationError::InsufficientBalance {
                participant: 0,
                asset: 0
            })
        );
        assert_eq!(alloc.balance(0, 0), Some(5.into()));
    }

    #[test]
    fn failed_transfer_leaves_allocation_unchanged() {
        let mut alloc =
            Allocation::new(vec![Asset::default()], vec![vec![5.into()], vec![U256::MAX]]).unwrap();
        let before = alloc.clone();
        assert_eq!(
            alloc.transfer(0, 0, 1, 3.into()),
            Err(AllocationError::Overflow { asset: 0 })
        );
        assert_eq!(alloc, before);
        assert_eq!(alloc.transfer(0, 0, 2, 3.into()), Err(AllocationError::OutOfRange));
        assert_eq!(alloc, before);
    }

    #[test]
    fn transfer_to_self_needs_balance() {
        let mut alloc = Allocation::new(vec![Asset::default()], vec![vec![5.into()], vec![0.into()]]).unwrap();
        alloc.transfer(0, 0, 0, 5.into()).unwrap();
        assert_eq!(alloc.balance(0, 0), Some(5.into()));
        assert!(alloc.transfer(0, 0, 0, 6.into()).is_err());
    }

    #[test]
    fn asset_bytes_roundtrip() {
        let asset = Asset::new(1337.into(), Address([0xab; 20]));
        assert_eq!(Asset::from_bytes(&asset.to_bytes()), Some(asset));
    }

    #[test]
    fn asset_bytes_accepts_short_chain_id() {
        let mut b = vec![];
        b.extend_from_slice(&1u16.to_le_bytes());
        b.push(5);
        b.extend_from_slice(&20u16.to_le_bytes());
        b.extend_from_slice(&[7; 20]);
        assert_eq!(
            Asset::from_bytes(&b),
            Some(Asset::new(5.into(), Address([7; 20])))
        );
        assert_eq!(Asset::from_bytes(&b[..b.len() - 1]), None);
    }
}
