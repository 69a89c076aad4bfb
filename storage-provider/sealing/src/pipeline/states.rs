use std::{
    fmt::Display,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use primitives_commitment::piece::PaddedPieceSize;
use primitives_proofs::{ChainEpoch, DomainSeparationTag};
use tokio::sync::mpsc::{UnboundedReceiver, WeakUnboundedSender};

use super::{
    events::SectorEvent,
    types::{Piece, SectorInfo, SectorMessage, SectorState},
    PipelineError, PipelineState,
};
use crate::{
    chain::{ChainApiError, TipSet},
    chain_events::{HeightHandler, SubscriptionHandle},
    checks::{check_commit, check_pieces, check_precommit, CheckError},
    collateral::{collateral_send_amount, max_fee},
    config::ChainConfig,
    fillers::fillers_from_rem,
    message::{
        methods, serialize_params, DeclareFaultsParams, ProveCommitSectorParams,
        SectorPreCommitInfo,
    },
    types::{EpochRandomness, TokenAmount},
};

type HandlerResult = Result<Option<SectorEvent>, PipelineError>;

/// Epoch the sector expires at: the latest deal end, or the committed capacity lifetime when
/// there are no deals, plus the expiration margin.
pub(crate) fn sector_expiration(pieces: &[Piece], head: ChainEpoch, config: &ChainConfig) -> ChainEpoch {
    let end = pieces
        .iter()
        .filter_map(|piece| piece.deal.map(|deal| deal.schedule.end_epoch))
        .max()
        .unwrap_or(head + config.committed_capacity_sector_lifetime);
    end + config.sector_expiration_margin
}

/// Delivers seed wait callbacks to the sector's inbox.
struct SeedWaitHandler {
    inbox: WeakUnboundedSender<SectorMessage>,
    rand_height: ChainEpoch,
}

impl SeedWaitHandler {
    fn deliver(&self, msg: SectorMessage) {
        match self.inbox.upgrade() {
            Some(inbox) => {
                if inbox.send(msg).is_err() {
                    tracing::debug!("sector inbox closed, dropping seed notification");
                }
            }
            None => tracing::debug!("sector is gone, dropping seed notification"),
        }
    }
}

impl HeightHandler for SeedWaitHandler {
    fn reached(&self, tipset: &TipSet, _current_height: ChainEpoch) {
        self.deliver(SectorMessage::SeedHeightReached {
            tipset: tipset.clone(),
            rand_height: self.rand_height,
        });
    }

    fn reverted(&self, tipset: &TipSet) {
        self.deliver(SectorMessage::SeedHeightReverted {
            tipset: tipset.clone(),
        });
    }
}

/// Owns a single sector: applies its events, checkpoints them and runs the state handlers.
///
/// Only the runner mutates its sector, and it handles one message at a time.
pub(crate) struct SectorRunner {
    state: Arc<PipelineState>,
    sector: SectorInfo,
    inbox: UnboundedReceiver<SectorMessage>,
    inbox_sender: WeakUnboundedSender<SectorMessage>,
    seed_subscription: Option<SubscriptionHandle>,
    /// Set when the last handler run stopped on an error, the next chain tick re-runs it.
    /// Shared with the pipeline, which only ticks sectors that have it set.
    wants_retry: Arc<AtomicBool>,
    /// Proof computed in `Committing`, kept while the sector waits out chain errors.
    pending_proof: Option<Vec<u8>>,
}

impl SectorRunner {
    pub(crate) fn new(
        state: Arc<PipelineState>,
        sector: SectorInfo,
        inbox: UnboundedReceiver<SectorMessage>,
        inbox_sender: WeakUnboundedSender<SectorMessage>,
        wants_retry: Arc<AtomicBool>,
    ) -> Self {
        Self {
            state,
            sector,
            inbox,
            inbox_sender,
            seed_subscription: None,
            wants_retry,
            pending_proof: None,
        }
    }

    /// Handles inbox messages until the inbox closes or the sector can no longer move.
    #[tracing::instrument(skip_all, fields(sector_number = self.sector.sector_number))]
    pub(crate) async fn run(mut self) {
        while let Some(msg) = self.inbox.recv().await {
            match msg {
                SectorMessage::Retry => {
                    if self.wants_retry.load(Ordering::Acquire) {
                        self.step().await;
                    }
                }
                SectorMessage::FaultDetected => self.advance(SectorEvent::FaultDetected).await,
                SectorMessage::SeedHeightReached {
                    tipset,
                    rand_height,
                } => {
                    if let Some(event) = self.seed_reached(&tipset, rand_height).await {
                        self.advance(event).await;
                    }
                }
                SectorMessage::SeedHeightReverted { tipset } => {
                    // Randomness is not re-derived, the sector stays where it is
                    tracing::warn!(
                        height = tipset.height,
                        state = ?self.sector.state,
                        "seed epoch reverted"
                    );
                }
            }

            if self.sector.state.is_terminal() {
                tracing::info!(state = ?self.sector.state, "sector accepts no more events");
                break;
            }
        }
    }

    fn retry_on_tick(&self, retry: bool) {
        self.wants_retry.store(retry, Ordering::Release);
    }

    async fn checkpoint(&self, sector: &SectorInfo, event: &SectorEvent) -> Result<(), PipelineError> {
        let db = self.state.db.clone();
        let sector = sector.clone();
        let event = event.clone();
        tokio::task::spawn_blocking(move || db.commit_transition(&sector, &event)).await??;
        Ok(())
    }

    /// Runs the handler of the current state and applies whatever it emits.
    async fn step(&mut self) {
        self.retry_on_tick(false);
        match self.handle().await {
            Ok(Some(event)) => self.advance(event).await,
            Ok(None) => {}
            Err(err) => {
                tracing::error!(%err, state = ?self.sector.state, "sector handler failed");
                self.retry_on_tick(true);
            }
        }
    }

    /// Applies `event`, persists the result and keeps going while handlers emit events.
    ///
    /// When the event is dropped or cannot be persisted the sector keeps its current state and
    /// re-runs that state's handler on the next tick.
    async fn advance(&mut self, mut event: SectorEvent) {
        loop {
            let mut next = self.sector.clone();
            if let Err(err) = next.apply(&event) {
                tracing::warn!(%err, "dropping event");
                self.retry_on_tick(true);
                return;
            }
            if let Err(err) = self.checkpoint(&next, &event).await {
                tracing::error!(%err, event = event.name(), "failed to persist transition");
                // A lost seed callback is only redelivered by registering again
                if let Some(subscription) = self.seed_subscription.take() {
                    self.state.events.cancel(subscription).await;
                }
                self.retry_on_tick(true);
                return;
            }

            tracing::info!(
                from = ?self.sector.state,
                to = ?next.state,
                event = event.name(),
                "sector transitioned"
            );
            if self.sector.state == SectorState::WaitSeed && next.state != SectorState::WaitSeed {
                if let Some(subscription) = self.seed_subscription.take() {
                    self.state.events.cancel(subscription).await;
                }
            }
            if next.state != SectorState::Committing {
                self.pending_proof = None;
            }
            self.sector = next;
            self.retry_on_tick(false);

            match self.handle().await {
                Ok(Some(next_event)) => event = next_event,
                Ok(None) => return,
                Err(err) => {
                    tracing::error!(%err, state = ?self.sector.state, "sector handler failed");
                    self.retry_on_tick(true);
                    return;
                }
            }
        }
    }

    async fn handle(&mut self) -> HandlerResult {
        match self.sector.state {
            SectorState::Packing => self.handle_packing().await,
            SectorState::PreCommit1 => self.handle_pre_commit1().await,
            SectorState::PreCommit2 => self.handle_pre_commit2().await,
            SectorState::PreCommitting => self.handle_pre_committing().await,
            SectorState::WaitSeed => self.handle_wait_seed().await,
            SectorState::Committing => self.handle_committing().await,
            SectorState::CommitWait => self.handle_commit_wait().await,
            SectorState::FinalizeSector => self.handle_finalize().await,
            SectorState::Faulty => self.handle_faulty().await,
            SectorState::FaultReported => self.handle_fault_reported().await,
            SectorState::Proving
            | SectorState::FaultedFinal
            | SectorState::PackingFailed
            | SectorState::SealPreCommitFailed
            | SectorState::ChainPreCommitFailed
            | SectorState::ComputeProofFailed
            | SectorState::CommitFailed
            | SectorState::FinalizeFailed
            | SectorState::FailedUnrecoverable => Ok(None),
        }
    }

    /// Leaves the sector in place until the next chain tick.
    fn park<E>(&mut self, err: E) -> HandlerResult
    where
        E: Display,
    {
        tracing::error!(%err, state = ?self.sector.state, "api error, retrying on the next tick");
        self.retry_on_tick(true);
        Ok(None)
    }

    async fn chain_head(&mut self) -> Result<TipSet, HandlerResult> {
        let chain = self.state.chain.clone();
        match chain.chain_head().await {
            Ok(head) => Ok(head),
            Err(err) => Err(self.park(err)),
        }
    }

    async fn ticket(&self, head: &TipSet) -> Result<EpochRandomness, ChainApiError> {
        let epoch = head.height - self.state.config.chain.seal_randomness_lookback;
        let value = self
            .state
            .chain
            .chain_randomness(
                &head.key,
                DomainSeparationTag::SealRandomness,
                epoch,
                &self.state.config.miner.to_bytes(),
            )
            .await?;
        Ok(EpochRandomness { value, epoch })
    }

    async fn handle_packing(&mut self) -> HandlerResult {
        let capacity = match PaddedPieceSize::try_from(self.sector.sector_type.sector_size()) {
            Ok(size) => *size.unpadded(),
            Err(err) => {
                return Ok(Some(SectorEvent::FatalError {
                    error: format!("invalid sector size: {err}"),
                }))
            }
        };

        let allocated = self.sector.allocated_space();
        if allocated > capacity {
            return Ok(Some(SectorEvent::FatalError {
                error: format!("too much data in sector: {allocated} > {capacity}"),
            }));
        }

        let fillers = match fillers_from_rem(capacity - allocated) {
            Ok(fillers) => fillers,
            Err(err) => {
                return Ok(Some(SectorEvent::FatalError {
                    error: format!("failed to compute filler pieces: {err}"),
                }))
            }
        };
        tracing::info!(allocated, fillers = fillers.len(), "packing sector");

        let sector_ref = self.sector.sector_ref(self.state.config.miner);
        let mut existing = self.sector.piece_sizes();
        let mut filler_pieces = Vec::with_capacity(fillers.len());
        for size in fillers {
            let piece = self
                .state
                .sealer
                .add_filler_piece(&sector_ref, &existing, size)
                .await?;
            existing.push(size);
            filler_pieces.push(Piece::filler(piece));
        }

        Ok(Some(SectorEvent::Packed { filler_pieces }))
    }

    async fn handle_pre_commit1(&mut self) -> HandlerResult {
        let head = match self.chain_head().await {
            Ok(head) => head,
            Err(parked) => return parked,
        };
        let state = self.state.clone();

        match check_pieces(
            state.chain.as_ref(),
            &self.sector,
            &head,
            state.config.miner,
        )
        .await
        {
            Ok(()) => {}
            Err(CheckError::Api(err)) => return self.park(err),
            Err(err @ (CheckError::InvalidDeals(_) | CheckError::ExpiredDeals(_))) => {
                return Ok(Some(SectorEvent::PackingFailed {
                    error: err.to_string(),
                }))
            }
            Err(err) => {
                return Ok(Some(SectorEvent::SealPreCommitFailed {
                    error: err.to_string(),
                }))
            }
        }

        let ticket = match self.ticket(&head).await {
            Ok(ticket) => ticket,
            Err(err) => {
                return Ok(Some(SectorEvent::SealPreCommitFailed {
                    error: format!("getting ticket failed: {err}"),
                }))
            }
        };

        let sector_ref = self.sector.sector_ref(self.state.config.miner);
        match self
            .state
            .sealer
            .seal_pre_commit1(&sector_ref, &ticket.value, &self.sector.piece_infos())
            .await
        {
            Ok(pre_commit1_out) => Ok(Some(SectorEvent::PreCommit1 {
                pre_commit1_out,
                ticket,
            })),
            Err(err) => Ok(Some(SectorEvent::SealPreCommitFailed {
                error: format!("seal pre commit(1) failed: {err}"),
            })),
        }
    }

    async fn handle_pre_commit2(&mut self) -> HandlerResult {
        let Some(pre_commit1_out) = &self.sector.pre_commit1_out else {
            return Ok(Some(SectorEvent::SealPreCommitFailed {
                error: "sector has no pre commit(1) output".to_string(),
            }));
        };

        let sector_ref = self.sector.sector_ref(self.state.config.miner);
        match self
            .state
            .sealer
            .seal_pre_commit2(&sector_ref, pre_commit1_out)
            .await
        {
            Ok(cids) => Ok(Some(SectorEvent::PreCommit2 {
                unsealed: cids.unsealed,
                sealed: cids.sealed,
            })),
            Err(err) => Ok(Some(SectorEvent::SealPreCommitFailed {
                error: format!("seal pre commit(2) failed: {err}"),
            })),
        }
    }

    async fn handle_pre_committing(&mut self) -> HandlerResult {
        if let Some(message) = self.sector.pre_commit_message {
            tracing::info!(%message, "pre-commit message already sent");
            return Ok(Some(SectorEvent::PreCommitted { message }));
        }

        let head = match self.chain_head().await {
            Ok(head) => head,
            Err(parked) => return parked,
        };
        let state = self.state.clone();
        let config = &state.config;

        match check_precommit(
            state.chain.as_ref(),
            &self.sector,
            &head,
            config.miner,
            &config.chain,
        )
        .await
        {
            Ok(()) => {}
            Err(CheckError::Api(err)) => return self.park(err),
            Err(err @ (CheckError::InvalidDeals(_) | CheckError::ExpiredDeals(_))) => {
                return Ok(Some(SectorEvent::PackingFailed {
                    error: err.to_string(),
                }))
            }
            Err(err) => {
                return Ok(Some(SectorEvent::SealPreCommitFailed {
                    error: err.to_string(),
                }))
            }
        }

        let (Some(cids), Some(ticket)) = (self.sector.sector_cids(), self.sector.ticket) else {
            return Ok(Some(SectorEvent::SealPreCommitFailed {
                error: "sector has no ticket or commitments".to_string(),
            }));
        };

        let info = SectorPreCommitInfo {
            seal_proof: self.sector.sector_type,
            sector_number: self.sector.sector_number,
            sealed_cid: cids.sealed,
            seal_rand_epoch: ticket.epoch,
            deal_ids: self.sector.deal_ids(),
            expiration: sector_expiration(&self.sector.pieces, head.height, &config.chain),
            unsealed_cid: Some(cids.unsealed),
        };
        let params = match serialize_params(&info) {
            Ok(params) => params,
            Err(err) => {
                return Ok(Some(SectorEvent::ChainPreCommitFailed {
                    error: format!("could not serialize pre-commit sector parameters: {err}"),
                }))
            }
        };

        let deposit = match state
            .chain
            .pre_commit_deposit(config.miner, &info, &head.key)
            .await
        {
            Ok(deposit) => deposit,
            Err(err) => return self.park(err),
        };
        let value = match collateral_send_amount(
            state.chain.as_ref(),
            &config.collateral,
            config.miner,
            &head.key,
            deposit,
        )
        .await
        {
            Ok(value) => value,
            Err(err) => return self.park(err),
        };

        match state
            .sender
            .send(
                config.worker,
                config.miner,
                methods::PRE_COMMIT_SECTOR,
                value,
                max_fee(&config.fees, methods::PRE_COMMIT_SECTOR),
                params,
            )
            .await
        {
            Ok(message) => Ok(Some(SectorEvent::PreCommitted { message })),
            Err(err) => Ok(Some(SectorEvent::ChainPreCommitFailed {
                error: format!("pushing message to mpool: {err}"),
            })),
        }
    }

    async fn handle_wait_seed(&mut self) -> HandlerResult {
        if self.seed_subscription.is_some() {
            return Ok(None);
        }

        let Some(message) = self.sector.pre_commit_message else {
            return Ok(Some(SectorEvent::ChainPreCommitFailed {
                error: "entered wait seed with no pre-commit message".to_string(),
            }));
        };

        let lookup = match self.state.events.wait_for_message(message).await {
            Ok(lookup) => lookup,
            Err(err) => {
                return Ok(Some(SectorEvent::ChainPreCommitFailed {
                    error: format!("failed to wait for pre-commit message: {err}"),
                }))
            }
        };
        if !lookup.receipt.exit_code.is_success() {
            return Ok(Some(SectorEvent::ChainPreCommitFailed {
                error: format!(
                    "pre-commit message failed (exit={})",
                    lookup.receipt.exit_code
                ),
            }));
        }

        let state = self.state.clone();
        let config = &state.config;
        let pre_commit = match state
            .chain
            .sector_pre_commit_info(config.miner, self.sector.sector_number, &lookup.tipset)
            .await
        {
            Ok(Some(pre_commit)) => pre_commit,
            Ok(None) => {
                return Ok(Some(SectorEvent::ChainPreCommitFailed {
                    error: "pre-commit info not found on chain".to_string(),
                }))
            }
            Err(err) => {
                return Ok(Some(SectorEvent::ChainPreCommitFailed {
                    error: format!("getting pre-commit info: {err}"),
                }))
            }
        };

        // The seed epoch is fixed by the chain
        let rand_height = pre_commit.pre_commit_epoch + config.chain.pre_commit_challenge_delay;
        tracing::info!(rand_height, "waiting for seed");

        let handler = SeedWaitHandler {
            inbox: self.inbox_sender.clone(),
            rand_height,
        };
        let confidence = config.chain.interactive_porep_confidence;
        match state
            .events
            .register_height(rand_height, confidence, Box::new(handler))
            .await
        {
            Ok(subscription) => {
                self.seed_subscription = Some(subscription);
                Ok(None)
            }
            Err(err) => self.park(err),
        }
    }

    /// Draws the interactive seed once its epoch is final enough.
    async fn seed_reached(&mut self, tipset: &TipSet, rand_height: ChainEpoch) -> Option<SectorEvent> {
        if self.sector.state != SectorState::WaitSeed {
            tracing::debug!(state = ?self.sector.state, "ignoring seed, sector is not waiting on it");
            return None;
        }

        match self
            .state
            .chain
            .chain_randomness(
                &tipset.key,
                DomainSeparationTag::InteractiveSealChallengeSeed,
                rand_height,
                &self.state.config.miner.to_bytes(),
            )
            .await
        {
            Ok(value) => Some(SectorEvent::SeedReady {
                seed: EpochRandomness {
                    value,
                    epoch: rand_height,
                },
            }),
            Err(err) => Some(SectorEvent::FatalError {
                error: format!("failed to get randomness for computing seal proof: {err}"),
            }),
        }
    }

    async fn handle_committing(&mut self) -> HandlerResult {
        let head = match self.chain_head().await {
            Ok(head) => head,
            Err(parked) => return parked,
        };

        let (Some(ticket), Some(seed), Some(cids)) =
            (self.sector.ticket, self.sector.seed, self.sector.sector_cids())
        else {
            return Ok(Some(SectorEvent::ComputeProofFailed {
                error: "sector has no ticket, seed or commitments".to_string(),
            }));
        };

        let state = self.state.clone();
        let config = &state.config;
        let sealer = state.sealer.as_ref();
        let proof = match self.pending_proof.clone() {
            Some(proof) => {
                tracing::debug!("reusing computed seal proof");
                proof
            }
            None => {
                let sector_ref = self.sector.sector_ref(config.miner);
                let commit1_out = match sealer
                    .seal_commit1(
                        &sector_ref,
                        &ticket.value,
                        &seed.value,
                        &self.sector.piece_infos(),
                        &cids,
                    )
                    .await
                {
                    Ok(out) => out,
                    Err(err) => {
                        return Ok(Some(SectorEvent::ComputeProofFailed {
                            error: format!("computing seal proof failed(1): {err}"),
                        }))
                    }
                };
                let proof = match sealer.seal_commit2(&sector_ref, &commit1_out).await {
                    Ok(proof) => proof,
                    Err(err) => {
                        return Ok(Some(SectorEvent::ComputeProofFailed {
                            error: format!("computing seal proof failed(2): {err}"),
                        }))
                    }
                };
                self.pending_proof = Some(proof.clone());
                proof
            }
        };

        let pre_commit = match check_commit(
            state.chain.as_ref(),
            sealer,
            &self.sector,
            &proof,
            &head.key,
            config.miner,
            &config.chain,
        )
        .await
        {
            Ok(pre_commit) => pre_commit,
            Err(CheckError::Api(err)) => return self.park(err),
            Err(err) => {
                return Ok(Some(SectorEvent::CommitFailed {
                    error: format!("commit check error: {err}"),
                }))
            }
        };

        let params = match serialize_params(&ProveCommitSectorParams {
            sector_number: self.sector.sector_number,
            proof: proof.clone(),
        }) {
            Ok(params) => params,
            Err(err) => {
                return Ok(Some(SectorEvent::CommitFailed {
                    error: format!("could not serialize commit sector parameters: {err}"),
                }))
            }
        };

        let pledge = match state
            .chain
            .initial_pledge(config.miner, &pre_commit.info, &head.key)
            .await
        {
            Ok(pledge) => pledge,
            Err(err) => return self.park(err),
        };
        // The pre-commit deposit already sits with the miner
        let collateral = (pledge - &pre_commit.pre_commit_deposit).clamp_zero();
        let value = match collateral_send_amount(
            state.chain.as_ref(),
            &config.collateral,
            config.miner,
            &head.key,
            collateral,
        )
        .await
        {
            Ok(value) => value,
            Err(err) => return self.park(err),
        };

        match state
            .sender
            .send(
                config.worker,
                config.miner,
                methods::PROVE_COMMIT_SECTOR,
                value,
                max_fee(&config.fees, methods::PROVE_COMMIT_SECTOR),
                params,
            )
            .await
        {
            Ok(message) => Ok(Some(SectorEvent::Committed { proof, message })),
            Err(err) => Ok(Some(SectorEvent::CommitFailed {
                error: format!("pushing message to mpool: {err}"),
            })),
        }
    }

    async fn handle_commit_wait(&mut self) -> HandlerResult {
        let Some(message) = self.sector.commit_message else {
            return Ok(Some(SectorEvent::CommitFailed {
                error: "entered commit wait with no commit message".to_string(),
            }));
        };

        match self.state.events.wait_for_message(message).await {
            Ok(lookup) if lookup.receipt.exit_code.is_success() => Ok(Some(SectorEvent::Proving)),
            Ok(lookup) => Ok(Some(SectorEvent::CommitFailed {
                error: format!(
                    "submitting sector proof failed (exit={})",
                    lookup.receipt.exit_code
                ),
            })),
            Err(err) => Ok(Some(SectorEvent::CommitFailed {
                error: format!("failed to wait for porep inclusion: {err}"),
            })),
        }
    }

    async fn handle_finalize(&mut self) -> HandlerResult {
        let sector_ref = self.sector.sector_ref(self.state.config.miner);
        match self.state.sealer.finalize_sector(&sector_ref).await {
            Ok(()) => Ok(Some(SectorEvent::Finalized)),
            Err(err) => Ok(Some(SectorEvent::FinalizeFailed {
                error: format!("finalize sector: {err}"),
            })),
        }
    }

    async fn handle_faulty(&mut self) -> HandlerResult {
        let config = &self.state.config;
        let params = serialize_params(&DeclareFaultsParams {
            sectors: vec![self.sector.sector_number],
        })?;

        let message = self
            .state
            .sender
            .send(
                config.worker,
                config.miner,
                methods::DECLARE_FAULTS,
                TokenAmount::zero(),
                max_fee(&config.fees, methods::DECLARE_FAULTS),
                params,
            )
            .await?;

        Ok(Some(SectorEvent::FaultReported { message }))
    }

    async fn handle_fault_reported(&mut self) -> HandlerResult {
        let Some(message) = self.sector.fault_report_message else {
            return Err(PipelineError::MissingMessage(
                self.sector.sector_number,
                "fault report",
            ));
        };

        let lookup = self.state.events.wait_for_message(message).await?;
        if !lookup.receipt.exit_code.is_success() {
            // Left for an operator
            tracing::error!(
                %message,
                exit_code = %lookup.receipt.exit_code,
                "declare faults message failed"
            );
            return Ok(None);
        }

        Ok(Some(SectorEvent::FaultedFinal))
    }
}
