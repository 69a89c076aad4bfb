pub mod events;
mod states;
pub mod types;


use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use primitives_proofs::{RegisteredSealProof, SectorNumber};
use tokio::{
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    task::JoinError,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    chain::{ChainApi, ChainApiError},
    chain_events::ChainEventWaiter,
    config::SealingConfig,
    db::{DBError, SectorStore},
    message::{Mempool, MessageError, MessageSender},
    sealer::{SealerError, SealingBackend},
};
use events::{SectorEvent, TransitionError};
use states::SectorRunner;
use types::{Piece, PipelineMessage, SectorInfo, SectorMessage, StartSectorMessage};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Join(#[from] JoinError),
    #[error(transparent)]
    DBError(#[from] DBError),
    #[error(transparent)]
    ChainApi(#[from] ChainApiError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Sealer(#[from] SealerError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("sector {0} has no {1} message")]
    MissingMessage(SectorNumber, &'static str),
}

/// Pipeline shared state.
pub struct PipelineState {
    pub config: SealingConfig,
    pub db: Arc<dyn SectorStore>,
    pub chain: Arc<dyn ChainApi>,
    pub sender: MessageSender,
    pub sealer: Arc<dyn SealingBackend>,
    pub events: Arc<ChainEventWaiter>,
}

impl PipelineState {
    pub fn new(
        config: SealingConfig,
        db: Arc<dyn SectorStore>,
        chain: Arc<dyn ChainApi>,
        mempool: Arc<dyn Mempool>,
        sealer: Arc<dyn SealingBackend>,
    ) -> Self {
        let events = Arc::new(ChainEventWaiter::new(
            chain.clone(),
            config.chain.message_confidence,
        ));
        let sender = MessageSender::new(mempool, config.simulate_gas);

        Self {
            config,
            db,
            chain,
            sender,
            sealer,
            events,
        }
    }
}

/// Runs the sealing pipeline until the token is cancelled or the channel is closed.
///
/// Sectors found in the store are resumed from their last checkpoint. Every sector gets its own
/// task, so transitions of a single sector are strictly sequential while different sectors make
/// progress independently.
#[tracing::instrument(skip_all)]
pub async fn start_pipeline(
    state: Arc<PipelineState>,
    mut receiver: UnboundedReceiver<PipelineMessage>,
    token: CancellationToken,
) -> Result<(), PipelineError> {
    state.events.start().await?;

    let tracker = TaskTracker::new();
    let mut sectors = HashMap::new();

    for sector in state.db.list_sectors()? {
        tracing::info!(
            sector_number = sector.sector_number,
            state = ?sector.state,
            "resuming sector"
        );
        let sector_number = sector.sector_number;
        let handle = spawn_sector(&tracker, state.clone(), sector, token.clone());
        sectors.insert(sector_number, handle);
    }

    loop {
        tokio::select! {
            msg = receiver.recv() => {
                tracing::debug!("Received msg: {:?}", msg);
                match msg {
                    Some(msg) => {
                        process(&tracker, &mut sectors, msg, state.clone(), token.clone()).await;
                    },
                    None => {
                        tracing::info!("Channel has been closed...");
                        break;
                    },
                }
            },
            _ = token.cancelled() => {
                tracing::info!("Pipeline has been stopped by the cancellation token...");
                break;
            },
        }
    }

    // Closing the inboxes lets idle sectors finish
    drop(sectors);
    tracker.close();
    tracker.wait().await;

    Ok(())
}

/// Pipeline side of a running sector.
struct SectorHandle {
    inbox: UnboundedSender<SectorMessage>,
    /// Set by the sector while it waits for a chain tick to retry.
    wants_retry: Arc<AtomicBool>,
}

async fn process(
    tracker: &TaskTracker,
    sectors: &mut HashMap<SectorNumber, SectorHandle>,
    msg: PipelineMessage,
    state: Arc<PipelineState>,
    token: CancellationToken,
) {
    match msg {
        PipelineMessage::StartSector(StartSectorMessage {
            sector_type,
            pieces,
            reply,
        }) => {
            let result = create_sector(&state, sector_type, pieces)
                .await
                .map(|sector| {
                    let sector_number = sector.sector_number;
                    tracing::info!(
                        sector_number,
                        ?sector_type,
                        pieces = sector.pieces.len(),
                        "sector created"
                    );
                    let handle = spawn_sector(tracker, state, sector, token);
                    sectors.insert(sector_number, handle);
                    sector_number
                });

            if let Err(err) = &result {
                tracing::error!(%err, "failed to create sector");
            }
            if reply.send(result).is_err() {
                tracing::warn!("StartSector requester went away");
            }
        }
        PipelineMessage::HeadChange(change) => {
            if let Err(err) = state.events.handle_head_change(change).await {
                tracing::error!(%err, "failed to process head change");
            }

            sectors.retain(|sector_number, handle| {
                if handle.inbox.is_closed() {
                    tracing::debug!(sector_number, "dropping finished sector");
                    return false;
                }
                true
            });
            for handle in sectors.values() {
                if handle.wants_retry.load(Ordering::Acquire) {
                    let _ = handle.inbox.send(SectorMessage::Retry);
                }
            }
        }
        PipelineMessage::FaultDetected(sector_number) => match sectors.get(&sector_number) {
            Some(handle) => {
                if handle.inbox.send(SectorMessage::FaultDetected).is_err() {
                    tracing::warn!(sector_number, "fault detected for finished sector");
                }
            }
            None => tracing::warn!(sector_number, "fault detected for unknown sector"),
        },
    }
}

/// Allocates a sector number and persists the sector's start event.
async fn create_sector(
    state: &PipelineState,
    sector_type: RegisteredSealProof,
    pieces: Vec<Piece>,
) -> Result<SectorInfo, PipelineError> {
    let db = state.db.clone();
    let sector = tokio::task::spawn_blocking(move || {
        let sector_number = db.next_sector_number()?;
        let sector = SectorInfo::new(sector_number, sector_type, pieces.clone());
        db.commit_transition(
            &sector,
            &SectorEvent::Start {
                sector_type,
                pieces,
            },
        )?;
        Ok::<_, DBError>(sector)
    })
    .await??;

    Ok(sector)
}

/// Spawns the sector's task and ticks it once, which runs the handler of its checkpointed state.
fn spawn_sector(
    tracker: &TaskTracker,
    state: Arc<PipelineState>,
    sector: SectorInfo,
    token: CancellationToken,
) -> SectorHandle {
    let (inbox_sender, inbox) = unbounded_channel();
    let wants_retry = Arc::new(AtomicBool::new(true));
    let sector_number = sector.sector_number;
    let runner = SectorRunner::new(
        state,
        sector,
        inbox,
        inbox_sender.downgrade(),
        wants_retry.clone(),
    );

    tracker.spawn(async move {
        tokio::select! {
            () = runner.run() => {
                tracing::debug!(sector_number, "sector task finished");
            },
            () = token.cancelled() => {
                tracing::warn!(sector_number, "sector task has been cancelled");
            }
        }
    });

    let _ = inbox_sender.send(SectorMessage::Retry);
    SectorHandle {
        inbox: inbox_sender,
        wants_retry,
    }
}
