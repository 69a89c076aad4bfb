use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use cid::Cid;
use primitives_proofs::ChainEpoch;
use tokio::sync::Mutex;

use crate::chain::{ChainApi, ChainApiError, HeadChange, MessageLookup, TipSet};

/// How many epochs of the current branch are kept around for height lookups.
const TIPSET_CACHE_DEPTH: ChainEpoch = 2000;

/// Callbacks for a height-with-confidence registration.
///
/// Callbacks run while the waiter is locked, they must not block.
pub trait HeightHandler: Send + Sync {
    /// The chain reached `target + confidence`. `tipset` is the tipset at the target height on the
    /// current branch.
    fn reached(&self, tipset: &TipSet, current_height: ChainEpoch);

    /// The branch that triggered [`HeightHandler::reached`] was abandoned.
    fn reverted(&self, tipset: &TipSet);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Status {
    Pending,
    Fired,
    Reverted,
}

struct Registration {
    target: ChainEpoch,
    confidence: u64,
    handler: Box<dyn HeightHandler>,
    status: Status,
}

impl Registration {
    fn trigger_height(&self) -> ChainEpoch {
        self.target + self.confidence as ChainEpoch
    }
}

#[derive(Default)]
struct WaiterState {
    head: ChainEpoch,
    /// Tipsets of the current branch by height.
    branch: BTreeMap<ChainEpoch, TipSet>,
    next_id: u64,
    registrations: HashMap<u64, Registration>,
}

/// Waits on chain conditions for the sectors.
///
/// Fed with head changes, it delivers each registration's forward callback at most once and
/// notifies reverts when the triggering branch is abandoned. A revert never causes the forward
/// callback to run again.
pub struct ChainEventWaiter {
    chain: Arc<dyn ChainApi>,
    message_confidence: u64,
    state: Mutex<WaiterState>,
}

impl ChainEventWaiter {
    pub fn new(chain: Arc<dyn ChainApi>, message_confidence: u64) -> Self {
        Self {
            chain,
            message_confidence,
            state: Mutex::new(WaiterState::default()),
        }
    }

    /// Seeds the waiter with the current chain head.
    pub async fn start(&self) -> Result<(), ChainApiError> {
        let head = self.chain.chain_head().await?;
        self.handle_head_change(HeadChange::Apply(head)).await
    }

    pub async fn head(&self) -> ChainEpoch {
        self.state.lock().await.head
    }

    /// Waits until `message` has been executed with the configured confidence.
    #[tracing::instrument(skip(self))]
    pub async fn wait_for_message(&self, message: Cid) -> Result<MessageLookup, ChainApiError> {
        self.chain
            .wait_message(message, self.message_confidence)
            .await
    }

    /// Registers `handler` to be called once the chain is `confidence` epochs past `target`.
    ///
    /// Fires immediately when the chain is already there.
    #[tracing::instrument(skip(self, handler))]
    pub async fn register_height(
        &self,
        target: ChainEpoch,
        confidence: u64,
        handler: Box<dyn HeightHandler>,
    ) -> Result<SubscriptionHandle, ChainApiError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let mut registration = Registration {
            target,
            confidence,
            handler,
            status: Status::Pending,
        };

        if state.head >= registration.trigger_height() {
            let tipset = self.tipset_at(&state.branch, target).await?;
            registration.handler.reached(&tipset, state.head);
            registration.status = Status::Fired;
        }

        let id = state.next_id;
        state.next_id += 1;
        state.registrations.insert(id, registration);

        Ok(SubscriptionHandle(id))
    }

    pub async fn cancel(&self, handle: SubscriptionHandle) {
        self.state.lock().await.registrations.remove(&handle.0);
    }

    #[tracing::instrument(skip_all)]
    pub async fn handle_head_change(&self, change: HeadChange) -> Result<(), ChainApiError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        match change {
            HeadChange::Apply(tipset) => {
                tracing::trace!(height = tipset.height, "applying tipset");
                state.head = tipset.height;
                state.branch.insert(tipset.height, tipset);
                state.branch = state.branch.split_off(&(state.head - TIPSET_CACHE_DEPTH));

                let head = state.head;
                let mut ready = state
                    .registrations
                    .iter()
                    .filter(|(_, registration)| {
                        registration.status != Status::Fired
                            && head >= registration.trigger_height()
                    })
                    .map(|(id, _)| *id)
                    .collect::<Vec<_>>();
                // Deterministic callback order
                ready.sort();

                for id in ready {
                    let Some(target) = state.registrations.get(&id).map(|r| r.target) else {
                        continue;
                    };
                    let tipset = self.tipset_at(&state.branch, target).await?;
                    let Some(registration) = state.registrations.get_mut(&id) else {
                        continue;
                    };

                    match registration.status {
                        Status::Pending => {
                            registration.handler.reached(&tipset, head);
                        }
                        Status::Reverted => {
                            // The forward callback already ran, it must not run twice
                            tracing::debug!(target_height = target, "registration re-extended");
                        }
                        Status::Fired => {}
                    }
                    registration.status = Status::Fired;
                }
            }
            HeadChange::Revert(tipset) => {
                tracing::debug!(height = tipset.height, "reverting tipset");
                // Drop the reverted tipset and everything built on top of it
                let _ = state.branch.split_off(&tipset.height);
                state.head = state
                    .branch
                    .keys()
                    .next_back()
                    .copied()
                    .unwrap_or(tipset.height - 1);

                for registration in state.registrations.values_mut() {
                    if registration.status == Status::Fired
                        && tipset.height <= registration.trigger_height()
                    {
                        registration.handler.reverted(&tipset);
                        registration.status = Status::Reverted;
                    }
                }
            }
        }

        Ok(())
    }

    async fn tipset_at(
        &self,
        branch: &BTreeMap<ChainEpoch, TipSet>,
        height: ChainEpoch,
    ) -> Result<TipSet, ChainApiError> {
        if let Some(tipset) = branch.get(&height) {
            return Ok(tipset.clone());
        }

        let head = branch
            .values()
            .next_back()
            .map(|tipset| tipset.key.clone())
            .unwrap_or_default();
        self.chain.tipset_by_height(height, &head).await
    }
}
