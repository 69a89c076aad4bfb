use std::{
    fmt::{self, Display},
    ops::{Add, Sub},
    str::FromStr,
};

use integer_encoding::VarInt;
use num_bigint::BigInt;
use primitives_proofs::{ChainEpoch, Randomness};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// Address protocol byte for ID addresses.
const ID_PROTOCOL: u8 = 0;

/// An actor ID address, printed as `f0<id>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(u64);

impl Address {
    pub const fn new_id(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }

    /// Binary representation of the address: the protocol byte followed by the varint encoded ID.
    ///
    /// This is what gets mixed into randomness draws as entropy.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![ID_PROTOCOL];
        bytes.extend(self.0.encode_var_vec());
        bytes
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f0{}", self.0)
    }
}

/// An on-chain amount in attoFIL.
///
/// Amounts are unbounded and serialized as decimal strings so they survive JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TokenAmount(BigInt);

impl TokenAmount {
    pub fn zero() -> Self {
        Self(BigInt::ZERO)
    }

    pub fn from_atto<A>(atto: A) -> Self
    where
        A: Into<BigInt>,
    {
        Self(atto.into())
    }

    pub fn atto(&self) -> &BigInt {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == BigInt::ZERO
    }

    /// Negative amounts become zero.
    pub fn clamp_zero(self) -> Self {
        if self.0 < BigInt::ZERO {
            Self::zero()
        } else {
            self
        }
    }
}

impl Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} attoFIL", self.0)
    }
}

impl Add for TokenAmount {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sub for TokenAmount {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl<'a> Sub<&'a TokenAmount> for TokenAmount {
    type Output = Self;

    fn sub(self, rhs: &'a TokenAmount) -> Self::Output {
        Self(self.0 - &rhs.0)
    }
}

impl Serialize for TokenAmount {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for TokenAmount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let amount = String::deserialize(deserializer)?;
        BigInt::from_str(&amount)
            .map(Self)
            .map_err(|err| de::Error::custom(format!("invalid token amount {amount}: {err}")))
    }
}

/// Randomness drawn from the chain, together with the epoch it was drawn at.
///
/// Used for both the sealing ticket and the interactive seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochRandomness {
    pub value: Randomness,
    pub epoch: ChainEpoch,
}
