//! Sanity checks run before a message goes on chain.
//!
//! Failures are reported as [`CheckError`] variants so handlers branch on the cause and never on
//! the error text.

use cid::Cid;
use primitives_proofs::{ChainEpoch, DomainSeparationTag};

use crate::{
    chain::{ChainApi, ChainApiError, SectorPreCommitOnChainInfo, TipSet, TipSetKey},
    config::ChainConfig,
    pipeline::types::SectorInfo,
    sealer::{SealVerifyInfo, SealingBackend},
    types::Address,
};

#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error(transparent)]
    Api(#[from] ChainApiError),

    #[error("invalid deals: {0}")]
    InvalidDeals(String),

    #[error("expired deals: {0}")]
    ExpiredDeals(String),

    #[error("on chain CommD {expected} differs from sealed CommD {actual:?}")]
    BadCommD { expected: Cid, actual: Option<Cid> },

    #[error("ticket from epoch {ticket_epoch} expired at head {head}")]
    ExpiredTicket {
        ticket_epoch: ChainEpoch,
        head: ChainEpoch,
    },

    #[error("sector is not pre-committed on chain")]
    NoPreCommit,

    #[error("bad seed: {0}")]
    BadSeed(String),

    #[error("invalid proof: {0}")]
    InvalidProof(String),
}

/// Checks every deal piece against its on-chain deal.
#[tracing::instrument(skip_all, fields(sector_number = sector.sector_number))]
pub async fn check_pieces(
    chain: &dyn ChainApi,
    sector: &SectorInfo,
    head: &TipSet,
    provider: Address,
) -> Result<(), CheckError> {
    for (index, piece) in sector.pieces.iter().enumerate() {
        let Some(deal) = piece.deal else {
            continue;
        };

        let proposal = match chain.market_storage_deal(deal.deal_id, &head.key).await {
            Ok(proposal) => proposal,
            Err(ChainApiError::DealNotFound(deal_id)) => {
                return Err(CheckError::InvalidDeals(format!(
                    "piece {index} references unknown deal {deal_id}"
                )));
            }
            Err(err) => return Err(err.into()),
        };

        if proposal.provider != provider {
            return Err(CheckError::InvalidDeals(format!(
                "piece {index} (deal {}) is for provider {}, not {provider}",
                deal.deal_id, proposal.provider
            )));
        }

        let piece_cid = piece.piece.commitment.cid();
        if proposal.piece_cid != piece_cid {
            return Err(CheckError::InvalidDeals(format!(
                "piece {index} (deal {}) has CID {piece_cid}, deal expects {}",
                deal.deal_id, proposal.piece_cid
            )));
        }

        if proposal.piece_size != piece.piece.size {
            return Err(CheckError::InvalidDeals(format!(
                "piece {index} (deal {}) has size {}, deal expects {}",
                deal.deal_id, piece.piece.size, proposal.piece_size
            )));
        }

        if head.height >= proposal.start_epoch {
            return Err(CheckError::ExpiredDeals(format!(
                "piece {index} (deal {}) should have started at {}, head is {}",
                deal.deal_id, proposal.start_epoch, head.height
            )));
        }
    }

    Ok(())
}

/// Checks the sealed sector can still be pre-committed at `head`.
#[tracing::instrument(skip_all, fields(sector_number = sector.sector_number))]
pub async fn check_precommit(
    chain: &dyn ChainApi,
    sector: &SectorInfo,
    head: &TipSet,
    provider: Address,
    config: &ChainConfig,
) -> Result<(), CheckError> {
    check_pieces(chain, sector, head, provider).await?;

    let expected = chain
        .compute_data_commitment(sector.sector_type, &sector.deal_ids(), &head.key)
        .await?;
    if sector.comm_d != Some(expected) {
        return Err(CheckError::BadCommD {
            expected,
            actual: sector.comm_d,
        });
    }

    // A sector without a ticket can't be pre-committed either
    let ticket_epoch = sector.ticket.map(|ticket| ticket.epoch).unwrap_or_default();
    if head.height - (ticket_epoch + config.seal_randomness_lookback)
        > config.max_pre_commit_randomness_lookback
    {
        return Err(CheckError::ExpiredTicket {
            ticket_epoch,
            head: head.height,
        });
    }

    Ok(())
}

/// Checks the seed and the proof against the chain before proving the sector.
///
/// Returns the on-chain pre-commit, its deposit offsets the initial pledge.
#[tracing::instrument(skip_all, fields(sector_number = sector.sector_number))]
pub async fn check_commit(
    chain: &dyn ChainApi,
    sealer: &dyn SealingBackend,
    sector: &SectorInfo,
    proof: &[u8],
    tipset: &TipSetKey,
    miner: Address,
    config: &ChainConfig,
) -> Result<SectorPreCommitOnChainInfo, CheckError> {
    let Some(seed) = sector.seed else {
        return Err(CheckError::BadSeed("sector has no seed".to_string()));
    };

    let Some(pre_commit) = chain
        .sector_pre_commit_info(miner, sector.sector_number, tipset)
        .await?
    else {
        return Err(CheckError::NoPreCommit);
    };

    let seed_epoch = pre_commit.pre_commit_epoch + config.pre_commit_challenge_delay;
    if seed.epoch != seed_epoch {
        return Err(CheckError::BadSeed(format!(
            "seed epoch {} doesn't match on chain seed epoch {seed_epoch}",
            seed.epoch
        )));
    }

    let randomness = chain
        .chain_randomness(
            tipset,
            DomainSeparationTag::InteractiveSealChallengeSeed,
            seed.epoch,
            &miner.to_bytes(),
        )
        .await?;
    if randomness != seed.value {
        return Err(CheckError::BadSeed(
            "seed randomness doesn't match on chain randomness".to_string(),
        ));
    }

    let (Some(ticket), Some(cids)) = (sector.ticket, sector.sector_cids()) else {
        return Err(CheckError::InvalidProof(
            "sector is missing its ticket or commitments".to_string(),
        ));
    };

    let verify_info = SealVerifyInfo {
        sector: sector.sector_ref(miner),
        randomness: ticket.value,
        interactive_randomness: seed.value,
        proof: proof.to_vec(),
        sealed_cid: cids.sealed,
        unsealed_cid: cids.unsealed,
    };
    match sealer.verify_seal(&verify_info).await {
        Ok(true) => Ok(pre_commit),
        Ok(false) => Err(CheckError::InvalidProof(
            "proof does not verify".to_string(),
        )),
        Err(err) => Err(CheckError::InvalidProof(err.to_string())),
    }
}
