//! In-memory chain, mempool and sealing backend used by the tests.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use cid::Cid;
use multihash_codetable::{Code, MultihashDigest};
use primitives_commitment::{
    piece::{PieceInfo, UnpaddedPieceSize},
    Commitment, CommitmentKind,
};
use primitives_proofs::{
    draw_randomness, ChainEpoch, DealId, DomainSeparationTag, Randomness, RegisteredSealProof,
    SectorNumber,
};

use crate::{
    chain::{
        ChainApi, ChainApiError, DealProposal, ExitCode, MessageLookup, MessageReceipt,
        SectorPreCommitOnChainInfo, TipSet, TipSetKey,
    },
    db::{DBError, SectorDB, SectorStore},
    message::{
        methods, Mempool, MempoolError, Message, MessageSendSpec, SectorPreCommitInfo,
        SignedMessage, DAG_CBOR,
    },
    pipeline::{
        events::SectorEvent,
        types::{DealSchedule, SectorInfo},
    },
    sealer::{
        Commit1Output, PreCommit1Output, SealVerifyInfo, SealerError, SealingBackend, SectorCids,
        SectorRef,
    },
    types::{Address, TokenAmount},
};

pub const MINER: Address = Address::new_id(1000);
pub const WORKER: Address = Address::new_id(1001);

const RANDOMNESS_BASE: Randomness = [0x42; 32];

/// Deterministic tipset, `fork` tells apart tipsets at the same height on different branches.
pub fn tipset(height: ChainEpoch, fork: u8) -> TipSet {
    let digest = Code::Blake2b256.digest(format!("tipset-{height}-{fork}").as_bytes());
    TipSet {
        key: TipSetKey(vec![Cid::new_v1(DAG_CBOR, digest)]),
        height,
    }
}

struct ChainState {
    head: ChainEpoch,
    available_balance: TokenAmount,
    deals: HashMap<DealId, DealProposal>,
    pre_commits: HashMap<SectorNumber, SectorPreCommitOnChainInfo>,
    exit_code: ExitCode,
    method_exit_codes: HashMap<u64, ExitCode>,
    message_methods: HashMap<Cid, u64>,
    message_waits: usize,
    fail_queries: bool,
    fail_initial_pledge: bool,
}

pub struct MockChain {
    state: Mutex<ChainState>,
}

impl MockChain {
    pub const PRE_COMMIT_DEPOSIT: u64 = 10;
    pub const INITIAL_PLEDGE: u64 = 100;

    pub fn new(head: ChainEpoch) -> Self {
        Self {
            state: Mutex::new(ChainState {
                head,
                available_balance: TokenAmount::zero(),
                deals: HashMap::new(),
                pre_commits: HashMap::new(),
                exit_code: ExitCode::OK,
                method_exit_codes: HashMap::new(),
                message_methods: HashMap::new(),
                message_waits: 0,
                fail_queries: false,
                fail_initial_pledge: false,
            }),
        }
    }

    pub fn head(&self) -> TipSet {
        tipset(self.state.lock().unwrap().head, 0)
    }

    pub fn set_head(&self, height: ChainEpoch) -> TipSet {
        self.state.lock().unwrap().head = height;
        tipset(height, 0)
    }

    pub fn fail_queries(&self, fail: bool) {
        self.state.lock().unwrap().fail_queries = fail;
    }

    pub fn set_available_balance(&self, balance: TokenAmount) {
        self.state.lock().unwrap().available_balance = balance;
    }

    pub fn fail_initial_pledge(&self, fail: bool) {
        self.state.lock().unwrap().fail_initial_pledge = fail;
    }

    /// Exit code every waited message executes with.
    pub fn set_exit_code(&self, exit_code: ExitCode) {
        self.state.lock().unwrap().exit_code = exit_code;
    }

    /// Exit code messages calling `method` execute with, takes precedence over `set_exit_code`.
    pub fn set_method_exit_code(&self, method: u64, exit_code: ExitCode) {
        self.state
            .lock()
            .unwrap()
            .method_exit_codes
            .insert(method, exit_code);
    }

    pub fn record_message(&self, message: Cid, method: u64) {
        self.state
            .lock()
            .unwrap()
            .message_methods
            .insert(message, method);
    }

    /// Number of `wait_message` calls so far.
    pub fn message_waits(&self) -> usize {
        self.state.lock().unwrap().message_waits
    }

    pub fn publish_deal(
        &self,
        deal_id: DealId,
        piece: &PieceInfo,
        provider: Address,
        schedule: DealSchedule,
    ) {
        self.state.lock().unwrap().deals.insert(
            deal_id,
            DealProposal {
                piece_cid: piece.commitment.cid(),
                piece_size: piece.size,
                provider,
                start_epoch: schedule.start_epoch,
                end_epoch: schedule.end_epoch,
            },
        );
    }

    pub fn randomness_at(
        &self,
        tag: DomainSeparationTag,
        epoch: ChainEpoch,
        entropy: &[u8],
    ) -> Randomness {
        draw_randomness(&RANDOMNESS_BASE, tag, epoch, entropy)
    }

    pub fn insert_pre_commit(&self, info: SectorPreCommitInfo, epoch: ChainEpoch) {
        self.state.lock().unwrap().pre_commits.insert(
            info.sector_number,
            SectorPreCommitOnChainInfo {
                info,
                pre_commit_deposit: TokenAmount::from_atto(Self::PRE_COMMIT_DEPOSIT),
                pre_commit_epoch: epoch,
            },
        );
    }

    /// Puts a pre-commit for an already sealed sector on chain.
    pub fn record_pre_commit(&self, sector: &SectorInfo, epoch: ChainEpoch) {
        let info = SectorPreCommitInfo {
            seal_proof: sector.sector_type,
            sector_number: sector.sector_number,
            sealed_cid: sector.comm_r.expect("sector has CommR"),
            seal_rand_epoch: sector.ticket.map(|ticket| ticket.epoch).unwrap_or_default(),
            deal_ids: sector.deal_ids(),
            expiration: epoch + 1_000_000,
            unsealed_cid: sector.comm_d,
        };
        self.insert_pre_commit(info, epoch);
    }

    fn check(&self) -> Result<(), ChainApiError> {
        if self.state.lock().unwrap().fail_queries {
            return Err(ChainApiError::Rpc("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ChainApi for MockChain {
    async fn chain_head(&self) -> Result<TipSet, ChainApiError> {
        self.check()?;
        Ok(self.head())
    }

    async fn tipset_by_height(
        &self,
        height: ChainEpoch,
        _head: &TipSetKey,
    ) -> Result<TipSet, ChainApiError> {
        self.check()?;
        if height > self.state.lock().unwrap().head {
            return Err(ChainApiError::TipSetNotFound(height));
        }
        Ok(tipset(height, 0))
    }

    async fn wait_message(
        &self,
        message: Cid,
        _confidence: u64,
    ) -> Result<MessageLookup, ChainApiError> {
        self.check()?;
        let exit_code = {
            let mut state = self.state.lock().unwrap();
            state.message_waits += 1;
            state
                .message_methods
                .get(&message)
                .and_then(|method| state.method_exit_codes.get(method))
                .copied()
                .unwrap_or(state.exit_code)
        };
        let head = self.head();
        Ok(MessageLookup {
            message,
            receipt: MessageReceipt {
                exit_code,
                return_data: vec![],
                gas_used: 1_000,
            },
            tipset: head.key,
            height: head.height,
        })
    }

    async fn sector_pre_commit_info(
        &self,
        _miner: Address,
        sector_number: SectorNumber,
        _tipset: &TipSetKey,
    ) -> Result<Option<SectorPreCommitOnChainInfo>, ChainApiError> {
        self.check()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .pre_commits
            .get(&sector_number)
            .cloned())
    }

    async fn miner_available_balance(
        &self,
        _miner: Address,
        _tipset: &TipSetKey,
    ) -> Result<TokenAmount, ChainApiError> {
        self.check()?;
        Ok(self.state.lock().unwrap().available_balance.clone())
    }

    async fn chain_randomness(
        &self,
        _tipset: &TipSetKey,
        tag: DomainSeparationTag,
        epoch: ChainEpoch,
        entropy: &[u8],
    ) -> Result<Randomness, ChainApiError> {
        self.check()?;
        Ok(self.randomness_at(tag, epoch, entropy))
    }

    async fn market_storage_deal(
        &self,
        deal_id: DealId,
        _tipset: &TipSetKey,
    ) -> Result<DealProposal, ChainApiError> {
        self.check()?;
        self.state
            .lock()
            .unwrap()
            .deals
            .get(&deal_id)
            .cloned()
            .ok_or(ChainApiError::DealNotFound(deal_id))
    }

    async fn compute_data_commitment(
        &self,
        _seal_proof: RegisteredSealProof,
        _deal_ids: &[DealId],
        _tipset: &TipSetKey,
    ) -> Result<Cid, ChainApiError> {
        self.check()?;
        Ok(MockSealer::unsealed_cid())
    }

    async fn pre_commit_deposit(
        &self,
        _miner: Address,
        _info: &SectorPreCommitInfo,
        _tipset: &TipSetKey,
    ) -> Result<TokenAmount, ChainApiError> {
        self.check()?;
        Ok(TokenAmount::from_atto(Self::PRE_COMMIT_DEPOSIT))
    }

    async fn initial_pledge(
        &self,
        _miner: Address,
        _info: &SectorPreCommitInfo,
        _tipset: &TipSetKey,
    ) -> Result<TokenAmount, ChainApiError> {
        self.check()?;
        if self.state.lock().unwrap().fail_initial_pledge {
            return Err(ChainApiError::Rpc("initial pledge unavailable".to_string()));
        }
        Ok(TokenAmount::from_atto(Self::INITIAL_PLEDGE))
    }
}

#[derive(Default)]
struct MempoolState {
    pushed: Vec<SignedMessage>,
    estimations: usize,
    fail_push: bool,
    fail_estimation: bool,
}

/// Accepts every message. With a chain attached, pre-commits land on it right away.
#[derive(Default)]
pub struct MockMempool {
    chain: Option<Arc<MockChain>>,
    state: Mutex<MempoolState>,
}

impl MockMempool {
    pub fn with_chain(chain: Arc<MockChain>) -> Self {
        Self {
            chain: Some(chain),
            state: Mutex::default(),
        }
    }

    pub fn pushed(&self) -> Vec<SignedMessage> {
        self.state.lock().unwrap().pushed.clone()
    }

    pub fn pushed_methods(&self) -> Vec<u64> {
        self.pushed()
            .into_iter()
            .map(|signed| signed.message.method)
            .collect()
    }

    pub fn estimations(&self) -> usize {
        self.state.lock().unwrap().estimations
    }

    pub fn fail_push(&self, fail: bool) {
        self.state.lock().unwrap().fail_push = fail;
    }

    pub fn fail_estimation(&self, fail: bool) {
        self.state.lock().unwrap().fail_estimation = fail;
    }
}

#[async_trait::async_trait]
impl Mempool for MockMempool {
    async fn push_message(
        &self,
        mut message: Message,
        _spec: MessageSendSpec,
    ) -> Result<SignedMessage, MempoolError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_push {
            return Err(MempoolError::Rejected("not enough funds".to_string()));
        }

        if let (Some(chain), methods::PRE_COMMIT_SECTOR) = (&self.chain, message.method) {
            let info: SectorPreCommitInfo = serde_ipld_dagcbor::from_slice(&message.params)
                .map_err(|err| MempoolError::Rejected(err.to_string()))?;
            chain.insert_pre_commit(info, chain.head().height);
        }

        message.sequence = state.pushed.len() as u64;
        let signed = SignedMessage {
            message,
            signature: vec![0xaa; 65],
        };
        if let Some(chain) = &self.chain {
            let cid = signed
                .cid()
                .map_err(|err| MempoolError::Rejected(err.to_string()))?;
            chain.record_message(cid, signed.message.method);
        }
        state.pushed.push(signed.clone());
        Ok(signed)
    }

    async fn estimate_message_gas(
        &self,
        message: &Message,
        _spec: &MessageSendSpec,
    ) -> Result<Message, MempoolError> {
        let mut state = self.state.lock().unwrap();
        state.estimations += 1;
        if state.fail_estimation {
            return Err(MempoolError::GasEstimation("actor panicked".to_string()));
        }
        Ok(Message {
            gas_limit: 1_000_000,
            ..message.clone()
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SealPhase {
    PreCommit1,
    PreCommit2,
    Commit1,
    Commit2,
    Finalize,
}

/// Produces fixture outputs instead of running proofs.
pub struct MockSealer {
    proof_valid: AtomicBool,
    failing: Mutex<HashSet<SealPhase>>,
    commit2_calls: AtomicUsize,
}

impl Default for MockSealer {
    fn default() -> Self {
        Self {
            proof_valid: AtomicBool::new(true),
            failing: Mutex::default(),
            commit2_calls: AtomicUsize::new(0),
        }
    }
}

impl MockSealer {
    pub const PROOF: &'static [u8] = b"seal-proof";

    pub fn unsealed_cid() -> Cid {
        Commitment::new([0x0d; 32], CommitmentKind::Data).cid()
    }

    pub fn sealed_cid() -> Cid {
        Commitment::new([0x0c; 32], CommitmentKind::Replica).cid()
    }

    pub fn set_proof_valid(&self, valid: bool) {
        self.proof_valid.store(valid, Ordering::SeqCst);
    }

    /// Makes every later run of `phase` fail.
    pub fn fail(&self, phase: SealPhase) {
        self.failing.lock().unwrap().insert(phase);
    }

    pub fn commit2_calls(&self) -> usize {
        self.commit2_calls.load(Ordering::SeqCst)
    }

    fn run(&self, phase: SealPhase) -> Result<(), SealerError> {
        if self.failing.lock().unwrap().contains(&phase) {
            return Err(anyhow::anyhow!("{phase:?} worker crashed").into());
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl SealingBackend for MockSealer {
    async fn add_filler_piece(
        &self,
        _sector: &SectorRef,
        _existing: &[UnpaddedPieceSize],
        size: UnpaddedPieceSize,
    ) -> Result<PieceInfo, SealerError> {
        Ok(PieceInfo::new([0; 32], size.padded()))
    }

    async fn seal_pre_commit1(
        &self,
        _sector: &SectorRef,
        _ticket: &Randomness,
        _pieces: &[PieceInfo],
    ) -> Result<PreCommit1Output, SealerError> {
        self.run(SealPhase::PreCommit1)?;
        Ok(PreCommit1Output(vec![1, 2, 3]))
    }

    async fn seal_pre_commit2(
        &self,
        _sector: &SectorRef,
        _pre_commit1_out: &PreCommit1Output,
    ) -> Result<SectorCids, SealerError> {
        self.run(SealPhase::PreCommit2)?;
        Ok(SectorCids {
            unsealed: Self::unsealed_cid(),
            sealed: Self::sealed_cid(),
        })
    }

    async fn seal_commit1(
        &self,
        _sector: &SectorRef,
        _ticket: &Randomness,
        _seed: &Randomness,
        _pieces: &[PieceInfo],
        _cids: &SectorCids,
    ) -> Result<Commit1Output, SealerError> {
        self.run(SealPhase::Commit1)?;
        Ok(Commit1Output(vec![4, 5, 6]))
    }

    async fn seal_commit2(
        &self,
        _sector: &SectorRef,
        _commit1_out: &Commit1Output,
    ) -> Result<Vec<u8>, SealerError> {
        self.commit2_calls.fetch_add(1, Ordering::SeqCst);
        self.run(SealPhase::Commit2)?;
        Ok(Self::PROOF.to_vec())
    }

    async fn finalize_sector(&self, _sector: &SectorRef) -> Result<(), SealerError> {
        self.run(SealPhase::Finalize)
    }

    async fn verify_seal(&self, _info: &SealVerifyInfo) -> Result<bool, SealerError> {
        Ok(self.proof_valid.load(Ordering::SeqCst))
    }
}

/// RocksDB store whose commit of a chosen event fails once.
pub struct FlakyStore {
    inner: SectorDB,
    fail_event: Mutex<Option<&'static str>>,
    failures: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: SectorDB) -> Self {
        Self {
            inner,
            fail_event: Mutex::new(None),
            failures: AtomicUsize::new(0),
        }
    }

    /// Fails the next commit of an event named `event`.
    pub fn fail_next(&self, event: &'static str) {
        *self.fail_event.lock().unwrap() = Some(event);
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

impl SectorStore for FlakyStore {
    fn get_sector(&self, sector_number: SectorNumber) -> Result<Option<SectorInfo>, DBError> {
        self.inner.get_sector(sector_number)
    }

    fn list_sectors(&self) -> Result<Vec<SectorInfo>, DBError> {
        self.inner.list_sectors()
    }

    fn next_sector_number(&self) -> Result<SectorNumber, DBError> {
        self.inner.next_sector_number()
    }

    fn commit_transition(&self, sector: &SectorInfo, event: &SectorEvent) -> Result<(), DBError> {
        {
            let mut fail_event = self.fail_event.lock().unwrap();
            if *fail_event == Some(event.name()) {
                *fail_event = None;
                self.failures.fetch_add(1, Ordering::SeqCst);
                let err = std::io::Error::other("no space left on device");
                return Err(DBError::Json(serde_json::Error::io(err)));
            }
        }
        self.inner.commit_transition(sector, event)
    }

    fn sector_events(&self, sector_number: SectorNumber) -> Result<Vec<SectorEvent>, DBError> {
        self.inner.sector_events(sector_number)
    }
}
