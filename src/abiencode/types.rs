use core::fmt::Debug;

use rand::{distributions::Standard, prelude::Distribution};
use uint::construct_uint;

macro_rules! impl_hex_debug {
    ($T:ident) => {
        impl Debug for $T {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str("0x")?;
                for b in self.0 {
                    f.write_fmt(format_args!("{:02x}", b))?;
                }
                Ok(())
            }
        }
    };
}

macro_rules! bytesN {
    ( $T:ident, $N:literal ) => {
        #[derive(PartialEq, Eq, Hash, PartialOrd, Ord, Copy, Clone)]
        pub struct $T(pub [u8; $N]);

        impl Distribution<$T> for Standard {
            fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> $T {
                let mut buf = [0u8; $N];
                rng.fill(&mut buf[..]);
                $T(buf)
            }
        }

        impl Default for $T {
            fn default() -> Self {
                Self([0; $N])
            }
        }

        impl TryFrom<&[u8]> for $T {
            type Error = core::array::TryFromSliceError;

            fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
                Ok(Self(value.try_into()?))
            }
        }

        impl_hex_debug!($T);
    };
}

bytesN!(Bytes32, 32);
bytesN!(Hash, 32);
bytesN!(Signature, 65);

impl Signature {
    pub fn new(rs: &[u8; 64], v: u8) -> Self {
        let mut sig: Signature = Signature([0; 65]);
        sig.0[..64].copy_from_slice(rs);
        sig.0[64] = v;
        sig
    }
}

// Balances are plain 256 bit words, the same width the adjudicator contract
// uses. `U256` is `Copy`, so cloning an allocation never aliases balances.
construct_uint! {
    pub struct U256(4);
}

impl U256 {
    pub fn to_be_bytes(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        self.to_big_endian(&mut bytes);
        bytes
    }
}

impl Distribution<U256> for Standard {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> U256 {
        let buf: [u8; 32] = rng.gen();
        U256::from_big_endian(&buf)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(pub [u8; 20]);
impl_hex_debug!(Address);

impl TryFrom<&[u8]> for Address {
    type Error = core::array::TryFromSliceError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        Ok(Self(value.try_into()?))
    }
}

impl Distribution<Address> for Standard {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> Address {
        Address(rng.gen())
    }
}
