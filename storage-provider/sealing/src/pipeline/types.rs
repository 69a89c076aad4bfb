use cid::Cid;
use primitives_commitment::piece::{PieceInfo, UnpaddedPieceSize};
use primitives_proofs::{ChainEpoch, DealId, RegisteredSealProof, SectorNumber};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use super::PipelineError;
use crate::{
    chain::{HeadChange, TipSet},
    sealer::{PreCommit1Output, SectorCids, SectorRef},
    types::{Address, EpochRandomness},
};

#[derive(Debug)]
pub struct StartSectorMessage {
    pub sector_type: RegisteredSealProof,
    /// Deal pieces, an empty list starts a committed capacity sector.
    pub pieces: Vec<Piece>,
    pub reply: oneshot::Sender<Result<SectorNumber, PipelineError>>,
}

#[derive(Debug)]
pub enum PipelineMessage {
    StartSector(StartSectorMessage),
    HeadChange(HeadChange),
    FaultDetected(SectorNumber),
}

/// Messages delivered to a single sector's inbox.
#[derive(Debug)]
pub(crate) enum SectorMessage {
    /// Re-run the current state handler, e.g. after the chain head moved.
    Retry,
    FaultDetected,
    SeedHeightReached {
        tipset: TipSet,
        rand_height: ChainEpoch,
    },
    SeedHeightReverted {
        tipset: TipSet,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealSchedule {
    pub start_epoch: ChainEpoch,
    pub end_epoch: ChainEpoch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealInfo {
    pub deal_id: DealId,
    pub schedule: DealSchedule,
}

/// A piece placed in a sector. Fillers carry no deal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Piece {
    pub piece: PieceInfo,
    pub deal: Option<DealInfo>,
}

impl Piece {
    pub fn filler(piece: PieceInfo) -> Self {
        Self { piece, deal: None }
    }

    pub fn unpadded_size(&self) -> UnpaddedPieceSize {
        self.piece.size.unpadded()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SectorState {
    Packing,
    PreCommit1,
    PreCommit2,
    PreCommitting,
    WaitSeed,
    Committing,
    CommitWait,
    FinalizeSector,
    Proving,

    Faulty,
    FaultReported,
    FaultedFinal,

    PackingFailed,
    SealPreCommitFailed,
    ChainPreCommitFailed,
    ComputeProofFailed,
    CommitFailed,
    FinalizeFailed,
    FailedUnrecoverable,
}

impl SectorState {
    /// States that need an operator (or an external event) to move on.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            SectorState::Proving
                | SectorState::FaultedFinal
                | SectorState::PackingFailed
                | SectorState::SealPreCommitFailed
                | SectorState::ChainPreCommitFailed
                | SectorState::ComputeProofFailed
                | SectorState::CommitFailed
                | SectorState::FinalizeFailed
                | SectorState::FailedUnrecoverable
        )
    }

    /// States no event leads out of.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SectorState::FaultedFinal | SectorState::FailedUnrecoverable
        )
    }
}

/// Checkpointed state of a sector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorInfo {
    pub sector_number: SectorNumber,
    pub state: SectorState,
    pub sector_type: RegisteredSealProof,
    pub pieces: Vec<Piece>,

    pub ticket: Option<EpochRandomness>,
    pub pre_commit1_out: Option<PreCommit1Output>,
    /// CommD
    pub comm_d: Option<Cid>,
    /// CommR
    pub comm_r: Option<Cid>,
    pub pre_commit_message: Option<Cid>,

    pub seed: Option<EpochRandomness>,
    pub proof: Option<Vec<u8>>,
    pub commit_message: Option<Cid>,

    pub fault_report_message: Option<Cid>,

    /// Error carried by the last failure event.
    pub last_error: Option<String>,
}

impl SectorInfo {
    pub fn new(
        sector_number: SectorNumber,
        sector_type: RegisteredSealProof,
        pieces: Vec<Piece>,
    ) -> Self {
        Self {
            sector_number,
            state: SectorState::Packing,
            sector_type,
            pieces,
            ticket: None,
            pre_commit1_out: None,
            comm_d: None,
            comm_r: None,
            pre_commit_message: None,
            seed: None,
            proof: None,
            commit_message: None,
            fault_report_message: None,
            last_error: None,
        }
    }

    pub fn sector_ref(&self, miner: Address) -> SectorRef {
        SectorRef {
            miner,
            number: self.sector_number,
            seal_proof: self.sector_type,
        }
    }

    pub fn deal_ids(&self) -> Vec<DealId> {
        self.pieces
            .iter()
            .filter_map(|piece| piece.deal.map(|deal| deal.deal_id))
            .collect()
    }

    pub fn piece_infos(&self) -> Vec<PieceInfo> {
        self.pieces.iter().map(|piece| piece.piece).collect()
    }

    pub fn piece_sizes(&self) -> Vec<UnpaddedPieceSize> {
        self.pieces.iter().map(Piece::unpadded_size).collect()
    }

    /// Sum of the unpadded piece sizes.
    pub fn allocated_space(&self) -> u64 {
        self.pieces.iter().map(|piece| *piece.unpadded_size()).sum()
    }

    pub fn sector_cids(&self) -> Option<SectorCids> {
        Some(SectorCids {
            unsealed: self.comm_d?,
            sealed: self.comm_r?,
        })
    }
}
