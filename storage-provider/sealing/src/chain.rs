use cid::Cid;
use primitives_commitment::piece::PaddedPieceSize;
use primitives_proofs::{
    ChainEpoch, DealId, DomainSeparationTag, Randomness, RegisteredSealProof, SectorNumber,
};
use serde::{Deserialize, Serialize};

use crate::{
    message::SectorPreCommitInfo,
    types::{Address, TokenAmount},
};

#[derive(Debug, thiserror::Error)]
pub enum ChainApiError {
    #[error("chain request failed: {0}")]
    Rpc(String),

    #[error("deal {0} not found")]
    DealNotFound(DealId),

    #[error("tipset at height {0} not found")]
    TipSetNotFound(ChainEpoch),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TipSetKey(pub Vec<Cid>);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TipSet {
    pub key: TipSetKey,
    pub height: ChainEpoch,
}

/// A single step of a chain head change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadChange {
    /// The tipset became part of the canonical chain.
    Apply(TipSet),
    /// The tipset was removed from the canonical chain.
    Revert(TipSet),
}

/// Exit code of an executed message. Zero means success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitCode(pub u32);

impl ExitCode {
    pub const OK: ExitCode = ExitCode(0);

    pub fn is_success(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageReceipt {
    pub exit_code: ExitCode,
    pub return_data: Vec<u8>,
    pub gas_used: i64,
}

/// Result of waiting for a message: the receipt and where the message was executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageLookup {
    pub message: Cid,
    pub receipt: MessageReceipt,
    pub tipset: TipSetKey,
    pub height: ChainEpoch,
}

/// Market actor deal proposal, as published on chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealProposal {
    pub piece_cid: Cid,
    pub piece_size: PaddedPieceSize,
    pub provider: Address,
    pub start_epoch: ChainEpoch,
    pub end_epoch: ChainEpoch,
}

/// Pre-commit record kept by the miner actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorPreCommitOnChainInfo {
    pub info: SectorPreCommitInfo,
    pub pre_commit_deposit: TokenAmount,
    pub pre_commit_epoch: ChainEpoch,
}

/// Chain state queries used by the sealing pipeline.
///
/// Implementations must be safe to call from many sectors at once.
#[async_trait::async_trait]
pub trait ChainApi: Send + Sync {
    async fn chain_head(&self) -> Result<TipSet, ChainApiError>;

    /// Looks up the tipset at `height` on the chain ending at `head`.
    async fn tipset_by_height(
        &self,
        height: ChainEpoch,
        head: &TipSetKey,
    ) -> Result<TipSet, ChainApiError>;

    /// Waits until `message` has been executed and `confidence` epochs have passed on top of it.
    async fn wait_message(&self, message: Cid, confidence: u64)
        -> Result<MessageLookup, ChainApiError>;

    async fn sector_pre_commit_info(
        &self,
        miner: Address,
        sector_number: SectorNumber,
        tipset: &TipSetKey,
    ) -> Result<Option<SectorPreCommitOnChainInfo>, ChainApiError>;

    async fn miner_available_balance(
        &self,
        miner: Address,
        tipset: &TipSetKey,
    ) -> Result<TokenAmount, ChainApiError>;

    async fn chain_randomness(
        &self,
        tipset: &TipSetKey,
        tag: DomainSeparationTag,
        epoch: ChainEpoch,
        entropy: &[u8],
    ) -> Result<Randomness, ChainApiError>;

    async fn market_storage_deal(
        &self,
        deal_id: DealId,
        tipset: &TipSetKey,
    ) -> Result<DealProposal, ChainApiError>;

    /// Unsealed sector CID (CommD) the chain derives from the given deals.
    async fn compute_data_commitment(
        &self,
        seal_proof: RegisteredSealProof,
        deal_ids: &[DealId],
        tipset: &TipSetKey,
    ) -> Result<Cid, ChainApiError>;

    async fn pre_commit_deposit(
        &self,
        miner: Address,
        info: &SectorPreCommitInfo,
        tipset: &TipSetKey,
    ) -> Result<TokenAmount, ChainApiError>;

    async fn initial_pledge(
        &self,
        miner: Address,
        info: &SectorPreCommitInfo,
        tipset: &TipSetKey,
    ) -> Result<TokenAmount, ChainApiError>;
}
