use cid::Cid;
use primitives_commitment::piece::{PieceInfo, UnpaddedPieceSize};
use primitives_proofs::{Randomness, RegisteredSealProof, SectorNumber};
use serde::{Deserialize, Serialize};

use crate::types::Address;

#[derive(Debug, thiserror::Error)]
pub enum SealerError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Identifies a sector towards the sealing backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorRef {
    pub miner: Address,
    pub number: SectorNumber,
    pub seal_proof: RegisteredSealProof,
}

/// Output of the first pre-commit phase, opaque to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreCommit1Output(pub Vec<u8>);

/// Output of the first commit phase, opaque to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit1Output(pub Vec<u8>);

/// Commitments produced by the second pre-commit phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorCids {
    /// CommD
    pub unsealed: Cid,
    /// CommR
    pub sealed: Cid,
}

/// Everything needed to check a seal proof locally before it is submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealVerifyInfo {
    pub sector: SectorRef,
    pub randomness: Randomness,
    pub interactive_randomness: Randomness,
    pub proof: Vec<u8>,
    pub sealed_cid: Cid,
    pub unsealed_cid: Cid,
}

/// Proof computation backend.
///
/// Calls may take minutes to hours; they only block the calling sector.
#[async_trait::async_trait]
pub trait SealingBackend: Send + Sync {
    /// Writes a zero filled piece of `size` into the sector after `existing` pieces.
    async fn add_filler_piece(
        &self,
        sector: &SectorRef,
        existing: &[UnpaddedPieceSize],
        size: UnpaddedPieceSize,
    ) -> Result<PieceInfo, SealerError>;

    async fn seal_pre_commit1(
        &self,
        sector: &SectorRef,
        ticket: &Randomness,
        pieces: &[PieceInfo],
    ) -> Result<PreCommit1Output, SealerError>;

    async fn seal_pre_commit2(
        &self,
        sector: &SectorRef,
        pre_commit1_out: &PreCommit1Output,
    ) -> Result<SectorCids, SealerError>;

    async fn seal_commit1(
        &self,
        sector: &SectorRef,
        ticket: &Randomness,
        seed: &Randomness,
        pieces: &[PieceInfo],
        cids: &SectorCids,
    ) -> Result<Commit1Output, SealerError>;

    async fn seal_commit2(
        &self,
        sector: &SectorRef,
        commit1_out: &Commit1Output,
    ) -> Result<Vec<u8>, SealerError>;

    async fn finalize_sector(&self, sector: &SectorRef) -> Result<(), SealerError>;

    async fn verify_seal(&self, info: &SealVerifyInfo) -> Result<bool, SealerError>;
}
