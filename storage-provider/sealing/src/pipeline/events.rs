use cid::Cid;
use primitives_proofs::{RegisteredSealProof, SectorNumber};
use serde::{Deserialize, Serialize};

use super::types::{Piece, SectorInfo, SectorState};
use crate::{sealer::PreCommit1Output, types::EpochRandomness};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("event {event} is not valid in state {state:?}")]
    InvalidEvent {
        state: SectorState,
        event: &'static str,
    },

    #[error("event log of sector {0} doesn't begin with a start event")]
    MissingStart(SectorNumber),
}

/// Inputs of the sector state machine, appended to the sector's event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SectorEvent {
    Start {
        sector_type: RegisteredSealProof,
        pieces: Vec<Piece>,
    },
    Packed {
        filler_pieces: Vec<Piece>,
    },
    PackingFailed {
        error: String,
    },
    PreCommit1 {
        pre_commit1_out: PreCommit1Output,
        ticket: EpochRandomness,
    },
    PreCommit2 {
        unsealed: Cid,
        sealed: Cid,
    },
    SealPreCommitFailed {
        error: String,
    },
    PreCommitted {
        message: Cid,
    },
    ChainPreCommitFailed {
        error: String,
    },
    SeedReady {
        seed: EpochRandomness,
    },
    ComputeProofFailed {
        error: String,
    },
    Committed {
        proof: Vec<u8>,
        message: Cid,
    },
    CommitFailed {
        error: String,
    },
    /// The commit landed, the sector is finalized before it is proven.
    Proving,
    Finalized,
    FinalizeFailed {
        error: String,
    },
    FaultDetected,
    FaultReported {
        message: Cid,
    },
    FaultedFinal,
    FatalError {
        error: String,
    },
}

impl SectorEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SectorEvent::Start { .. } => "start",
            SectorEvent::Packed { .. } => "packed",
            SectorEvent::PackingFailed { .. } => "packing-failed",
            SectorEvent::PreCommit1 { .. } => "pre-commit1",
            SectorEvent::PreCommit2 { .. } => "pre-commit2",
            SectorEvent::SealPreCommitFailed { .. } => "seal-pre-commit-failed",
            SectorEvent::PreCommitted { .. } => "pre-committed",
            SectorEvent::ChainPreCommitFailed { .. } => "chain-pre-commit-failed",
            SectorEvent::SeedReady { .. } => "seed-ready",
            SectorEvent::ComputeProofFailed { .. } => "compute-proof-failed",
            SectorEvent::Committed { .. } => "committed",
            SectorEvent::CommitFailed { .. } => "commit-failed",
            SectorEvent::Proving => "proving",
            SectorEvent::Finalized => "finalized",
            SectorEvent::FinalizeFailed { .. } => "finalize-failed",
            SectorEvent::FaultDetected => "fault-detected",
            SectorEvent::FaultReported { .. } => "fault-reported",
            SectorEvent::FaultedFinal => "faulted-final",
            SectorEvent::FatalError { .. } => "fatal-error",
        }
    }
}

impl SectorInfo {
    /// Rebuilds a sector from its event log.
    pub fn replay(
        sector_number: SectorNumber,
        events: &[SectorEvent],
    ) -> Result<SectorInfo, TransitionError> {
        let Some((SectorEvent::Start { sector_type, pieces }, rest)) = events.split_first() else {
            return Err(TransitionError::MissingStart(sector_number));
        };

        let mut sector = SectorInfo::new(sector_number, *sector_type, pieces.clone());
        for event in rest {
            sector.apply(event)?;
        }
        Ok(sector)
    }

    /// Applies `event` to the sector. The sector is left untouched when the event is not valid in
    /// the current state.
    pub fn apply(&mut self, event: &SectorEvent) -> Result<(), TransitionError> {
        use SectorState as S;

        let next = match (self.state, event) {
            (S::Packing, SectorEvent::Packed { filler_pieces }) => {
                self.pieces.extend(filler_pieces.iter().copied());
                S::PreCommit1
            }

            (S::PreCommit1, SectorEvent::PreCommit1 {
                pre_commit1_out,
                ticket,
            }) => {
                self.pre_commit1_out = Some(pre_commit1_out.clone());
                self.ticket = Some(*ticket);
                S::PreCommit2
            }
            (S::PreCommit1 | S::PreCommitting, SectorEvent::PackingFailed { error }) => {
                self.last_error = Some(error.clone());
                S::PackingFailed
            }

            (S::PreCommit2, SectorEvent::PreCommit2 { unsealed, sealed }) => {
                self.comm_d = Some(*unsealed);
                self.comm_r = Some(*sealed);
                S::PreCommitting
            }
            (
                S::PreCommit1 | S::PreCommit2 | S::PreCommitting,
                SectorEvent::SealPreCommitFailed { error },
            ) => {
                self.last_error = Some(error.clone());
                S::SealPreCommitFailed
            }

            (S::PreCommitting, SectorEvent::PreCommitted { message }) => {
                self.pre_commit_message = Some(*message);
                S::WaitSeed
            }
            (S::PreCommitting | S::WaitSeed, SectorEvent::ChainPreCommitFailed { error }) => {
                self.last_error = Some(error.clone());
                S::ChainPreCommitFailed
            }

            (S::WaitSeed, SectorEvent::SeedReady { seed }) => {
                self.seed = Some(*seed);
                S::Committing
            }

            (S::Committing, SectorEvent::Committed { proof, message }) => {
                self.proof = Some(proof.clone());
                self.commit_message = Some(*message);
                S::CommitWait
            }
            (S::Committing, SectorEvent::ComputeProofFailed { error }) => {
                self.last_error = Some(error.clone());
                S::ComputeProofFailed
            }
            (S::Committing | S::CommitWait, SectorEvent::CommitFailed { error }) => {
                self.last_error = Some(error.clone());
                S::CommitFailed
            }

            (S::CommitWait, SectorEvent::Proving) => S::FinalizeSector,
            (S::FinalizeSector, SectorEvent::Finalized) => S::Proving,
            (S::FinalizeSector, SectorEvent::FinalizeFailed { error }) => {
                self.last_error = Some(error.clone());
                S::FinalizeFailed
            }

            (S::Proving, SectorEvent::FaultDetected) => S::Faulty,
            (S::Faulty, SectorEvent::FaultReported { message }) => {
                self.fault_report_message = Some(*message);
                S::FaultReported
            }
            (S::FaultReported, SectorEvent::FaultedFinal) => S::FaultedFinal,

            (state, SectorEvent::FatalError { error })
                if state != S::FailedUnrecoverable && state != S::FaultedFinal =>
            {
                self.last_error = Some(error.clone());
                S::FailedUnrecoverable
            }

            (state, event) => {
                return Err(TransitionError::InvalidEvent {
                    state,
                    event: event.name(),
                })
            }
        };

        self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use primitives_commitment::piece::{PaddedPieceSize, PieceInfo};

    use super::*;
    use crate::mock::MockSealer;

    fn start() -> SectorEvent {
        SectorEvent::Start {
            sector_type: RegisteredSealProof::StackedDRG2KiBV1P1,
            pieces: vec![],
        }
    }

    fn packed() -> SectorEvent {
        SectorEvent::Packed {
            filler_pieces: vec![Piece::filler(PieceInfo::new(
                [0; 32],
                PaddedPieceSize::new(2048).unwrap(),
            ))],
        }
    }

    #[test]
    fn replay_follows_happy_path() {
        let ticket = EpochRandomness {
            value: [1; 32],
            epoch: 10,
        };
        let seed = EpochRandomness {
            value: [2; 32],
            epoch: 200,
        };
        let events = vec![
            start(),
            packed(),
            SectorEvent::PreCommit1 {
                pre_commit1_out: PreCommit1Output(vec![1, 2, 3]),
                ticket,
            },
            SectorEvent::PreCommit2 {
                unsealed: MockSealer::unsealed_cid(),
                sealed: MockSealer::sealed_cid(),
            },
            SectorEvent::PreCommitted {
                message: MockSealer::sealed_cid(),
            },
            SectorEvent::SeedReady { seed },
            SectorEvent::Committed {
                proof: vec![9; 4],
                message: MockSealer::unsealed_cid(),
            },
            SectorEvent::Proving,
            SectorEvent::Finalized,
        ];

        let sector = SectorInfo::replay(4, &events).unwrap();
        assert_eq!(sector.sector_number, 4);
        assert_eq!(sector.state, SectorState::Proving);
        assert_eq!(sector.pieces.len(), 1);
        assert_eq!(sector.ticket, Some(ticket));
        assert_eq!(sector.seed, Some(seed));
        assert_eq!(sector.comm_d, Some(MockSealer::unsealed_cid()));
        assert_eq!(sector.commit_message, Some(MockSealer::unsealed_cid()));
        assert_eq!(sector.proof, Some(vec![9; 4]));
        assert_eq!(sector.last_error, None);
    }

    #[test]
    fn replay_requires_start() {
        assert_eq!(
            SectorInfo::replay(1, &[packed()]),
            Err(TransitionError::MissingStart(1))
        );
        assert_eq!(
            SectorInfo::replay(1, &[]),
            Err(TransitionError::MissingStart(1))
        );
    }

    #[test]
    fn invalid_event_leaves_sector_untouched() {
        let mut sector = SectorInfo::replay(1, &[start()]).unwrap();
        let before = sector.clone();

        let result = sector.apply(&SectorEvent::SeedReady {
            seed: EpochRandomness {
                value: [0; 32],
                epoch: 0,
            },
        });
        assert_eq!(
            result,
            Err(TransitionError::InvalidEvent {
                state: SectorState::Packing,
                event: "seed-ready",
            })
        );
        assert_eq!(sector, before);
    }

    #[test]
    fn failures_record_the_error() {
        let mut sector = SectorInfo::replay(1, &[start(), packed()]).unwrap();
        sector
            .apply(&SectorEvent::PackingFailed {
                error: "deal expired".to_string(),
            })
            .unwrap();
        assert_eq!(sector.state, SectorState::PackingFailed);
        assert_eq!(sector.last_error.as_deref(), Some("deal expired"));

        // Failed sectors only move on fatal errors
        assert!(sector.apply(&packed()).is_err());
        sector
            .apply(&SectorEvent::FatalError {
                error: "operator gave up".to_string(),
            })
            .unwrap();
        assert_eq!(sector.state, SectorState::FailedUnrecoverable);
        assert!(sector
            .apply(&SectorEvent::FatalError {
                error: "again".to_string(),
            })
            .is_err());
    }

    #[test]
    fn fault_path() {
        let mut sector = SectorInfo::new(1, RegisteredSealProof::StackedDRG2KiBV1P1, vec![]);
        sector.state = SectorState::Proving;

        sector.apply(&SectorEvent::FaultDetected).unwrap();
        assert_eq!(sector.state, SectorState::Faulty);
        sector
            .apply(&SectorEvent::FaultReported {
                message: MockSealer::sealed_cid(),
            })
            .unwrap();
        assert_eq!(sector.fault_report_message, Some(MockSealer::sealed_cid()));
        sector.apply(&SectorEvent::FaultedFinal).unwrap();
        assert_eq!(sector.state, SectorState::FaultedFinal);
    }
}
