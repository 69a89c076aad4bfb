pub type DealId = u64;

pub type SectorNumber = u64;

/// Chain height, Filecoin epochs are signed so that lookback arithmetic never underflows.
pub type ChainEpoch = i64;

/// 32 bytes of chain randomness, used both for tickets and interactive seeds.
pub type Randomness = [u8; 32];

/// Proof of Replication type, indicating version and sector size of the proof.
#[allow(non_camel_case_types)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash)]
pub enum RegisteredSealProof {
    StackedDRG2KiBV1P1,
    StackedDRG8MiBV1P1,
    StackedDRG512MiBV1P1,
    StackedDRG32GiBV1P1,
    StackedDRG64GiBV1P1,
}

impl RegisteredSealProof {
    pub fn sector_size(&self) -> SectorSize {
        match self {
            RegisteredSealProof::StackedDRG2KiBV1P1 => SectorSize::_2KiB,
            RegisteredSealProof::StackedDRG8MiBV1P1 => SectorSize::_8MiB,
            RegisteredSealProof::StackedDRG512MiBV1P1 => SectorSize::_512MiB,
            RegisteredSealProof::StackedDRG32GiBV1P1 => SectorSize::_32GiB,
            RegisteredSealProof::StackedDRG64GiBV1P1 => SectorSize::_64GiB,
        }
    }
}

/// SectorSize indicates one of a set of possible sizes in the network.
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
#[derive(Clone, Debug, PartialEq, Eq, Copy)]
pub enum SectorSize {
    _2KiB,
    _8MiB,
    _512MiB,
    _32GiB,
    _64GiB,
}

impl SectorSize {
    /// Returns the size of a sector in bytes
    /// <https://github.com/filecoin-project/ref-fvm/blob/5659196fa94accdf1e7f10e00586a8166c44a60d/shared/src/sector/mod.rs#L40>
    pub fn bytes(&self) -> u64 {
        match self {
            SectorSize::_2KiB => 2 << 10,
            SectorSize::_8MiB => 8 << 20,
            SectorSize::_512MiB => 512 << 20,
            SectorSize::_32GiB => 32 << 30,
            SectorSize::_64GiB => 2 * (32 << 30),
        }
    }
}
