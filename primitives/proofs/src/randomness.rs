use crate::{ChainEpoch, Randomness};

/// Specifies a domain for randomness generation.
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
pub enum DomainSeparationTag {
    SealRandomness,
    InteractiveSealChallengeSeed,
    WindowedPoStChallengeSeed,
}

impl DomainSeparationTag {
    /// Returns the domain separation tag as a byte array.
    pub fn as_bytes(&self) -> [u8; 8] {
        let value: i64 = match self {
            DomainSeparationTag::SealRandomness => 1,
            DomainSeparationTag::InteractiveSealChallengeSeed => 2,
            DomainSeparationTag::WindowedPoStChallengeSeed => 3,
        };

        value.to_be_bytes()
    }
}

/// Derives randomness for a given domain and epoch from a base randomness value.
pub fn draw_randomness(
    rbase: &Randomness,
    pers: DomainSeparationTag,
    epoch: ChainEpoch,
    entropy: &[u8],
) -> Randomness {
    // 8(pers) + 32(rbase) + 8(round) + entropy.len()
    let mut data = Vec::with_capacity(8 + 32 + 8 + entropy.len());

    data.extend_from_slice(&pers.as_bytes());
    data.extend_from_slice(rbase);
    data.extend_from_slice(&epoch.to_be_bytes());
    data.extend_from_slice(entropy);

    let digest = blake2b_simd::Params::new().hash_length(32).hash(&data);
    let mut hashed = [0u8; 32];
    hashed.copy_from_slice(digest.as_bytes());
    // Necessary to be valid bls12 381 element.
    hashed[31] &= 0x3f;
    hashed
}
