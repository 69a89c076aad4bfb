use std::sync::Arc;

use cid::Cid;
use multihash_codetable::{Code, MultihashDigest};
use primitives_proofs::{ChainEpoch, DealId, RegisteredSealProof, SectorNumber};
use serde::{Deserialize, Serialize};

use crate::types::{Address, TokenAmount};

/// Multicodec code for DAG-CBOR, messages are content addressed as such.
pub(crate) const DAG_CBOR: u64 = 0x71;

pub type MethodNum = u64;

/// Miner actor methods invoked by the pipeline.
pub mod methods {
    use super::MethodNum;

    pub const PRE_COMMIT_SECTOR: MethodNum = 6;
    pub const PROVE_COMMIT_SECTOR: MethodNum = 7;
    pub const DECLARE_FAULTS: MethodNum = 10;
}

#[derive(Debug, thiserror::Error)]
pub enum MempoolError {
    #[error("message rejected by mempool: {0}")]
    Rejected(String),

    #[error("gas estimation failed: {0}")]
    GasEstimation(String),
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("failed to serialize message: {0}")]
    Serialization(String),

    #[error(transparent)]
    Mempool(#[from] MempoolError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub version: u64,
    pub to: Address,
    pub from: Address,
    pub sequence: u64,
    pub value: TokenAmount,
    pub method: MethodNum,
    pub params: Vec<u8>,
    pub gas_limit: u64,
    pub gas_fee_cap: TokenAmount,
    pub gas_premium: TokenAmount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedMessage {
    pub message: Message,
    pub signature: Vec<u8>,
}

impl SignedMessage {
    /// Content identifier of the signed message, CIDv1 over its DAG-CBOR encoding.
    pub fn cid(&self) -> Result<Cid, MessageError> {
        let bytes = serialize_params(self)?;
        Ok(Cid::new_v1(DAG_CBOR, Code::Blake2b256.digest(&bytes)))
    }
}

/// Per-message sending options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSendSpec {
    /// Ceiling for the total fee the mempool may attach to the message.
    pub max_fee: TokenAmount,
}

/// Parameters of `PreCommitSector`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorPreCommitInfo {
    pub seal_proof: RegisteredSealProof,
    pub sector_number: SectorNumber,
    pub sealed_cid: Cid,
    pub seal_rand_epoch: ChainEpoch,
    pub deal_ids: Vec<DealId>,
    pub expiration: ChainEpoch,
    pub unsealed_cid: Option<Cid>,
}

/// Parameters of `ProveCommitSector`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProveCommitSectorParams {
    pub sector_number: SectorNumber,
    pub proof: Vec<u8>,
}

/// Parameters of `DeclareFaults`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclareFaultsParams {
    pub sectors: Vec<SectorNumber>,
}

pub fn serialize_params<T>(params: &T) -> Result<Vec<u8>, MessageError>
where
    T: Serialize,
{
    serde_ipld_dagcbor::to_vec(params).map_err(|err| MessageError::Serialization(err.to_string()))
}

/// Wallet backed message pool.
#[async_trait::async_trait]
pub trait Mempool: Send + Sync {
    /// Assigns a nonce and gas, signs and pushes the message.
    async fn push_message(
        &self,
        message: Message,
        spec: MessageSendSpec,
    ) -> Result<SignedMessage, MempoolError>;

    /// Fills in gas values for `message` by executing it against the current head.
    async fn estimate_message_gas(
        &self,
        message: &Message,
        spec: &MessageSendSpec,
    ) -> Result<Message, MempoolError>;
}

/// Builds actor calls and pushes them through the [`Mempool`].
///
/// The sender does not deduplicate: the caller stores the returned CID before moving on and checks
/// for it before sending again.
#[derive(Clone)]
pub struct MessageSender {
    mempool: Arc<dyn Mempool>,
    simulate_gas: bool,
}

impl MessageSender {
    pub fn new(mempool: Arc<dyn Mempool>, simulate_gas: bool) -> Self {
        Self {
            mempool,
            simulate_gas,
        }
    }

    #[tracing::instrument(skip_all, fields(from = %from, to = %to, method = method))]
    pub async fn send(
        &self,
        from: Address,
        to: Address,
        method: MethodNum,
        value: TokenAmount,
        max_fee: TokenAmount,
        params: Vec<u8>,
    ) -> Result<Cid, MessageError> {
        let message = Message {
            version: 0,
            to,
            from,
            sequence: 0,
            value,
            method,
            params,
            // Gas is filled in by the mempool, bounded by the fee ceiling.
            gas_limit: 0,
            gas_fee_cap: TokenAmount::zero(),
            gas_premium: TokenAmount::zero(),
        };
        let spec = MessageSendSpec { max_fee };

        if self.simulate_gas {
            let estimated = self.mempool.estimate_message_gas(&message, &spec).await?;
            tracing::debug!(gas_limit = estimated.gas_limit, "gas estimation succeeded");
        }

        let signed = self.mempool.push_message(message, spec).await?;
        let cid = signed.cid()?;
        tracing::info!(%cid, "message pushed");

        Ok(cid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockMempool;

    #[tokio::test]
    async fn send_returns_pushed_message_cid() {
        let mempool = Arc::new(MockMempool::default());
        let sender = MessageSender::new(mempool.clone(), false);

        let params = serialize_params(&DeclareFaultsParams { sectors: vec![1] }).unwrap();
        let cid = sender
            .send(
                Address::new_id(1001),
                Address::new_id(1000),
                methods::DECLARE_FAULTS,
                TokenAmount::zero(),
                TokenAmount::from_atto(100),
                params.clone(),
            )
            .await
            .unwrap();

        let pushed = mempool.pushed();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].cid().unwrap(), cid);
        assert_eq!(pushed[0].message.params, params);
        assert_eq!(pushed[0].message.method, methods::DECLARE_FAULTS);
        assert_eq!(mempool.estimations(), 0);
    }

    #[tokio::test]
    async fn simulation_runs_before_push() {
        let mempool = Arc::new(MockMempool::default());
        let sender = MessageSender::new(mempool.clone(), true);

        sender
            .send(
                Address::new_id(1001),
                Address::new_id(1000),
                methods::PRE_COMMIT_SECTOR,
                TokenAmount::from_atto(1),
                TokenAmount::from_atto(100),
                vec![],
            )
            .await
            .unwrap();
        assert_eq!(mempool.estimations(), 1);

        mempool.fail_estimation(true);
        let result = sender
            .send(
                Address::new_id(1001),
                Address::new_id(1000),
                methods::PRE_COMMIT_SECTOR,
                TokenAmount::from_atto(1),
                TokenAmount::from_atto(100),
                vec![],
            )
            .await;
        assert!(matches!(
            result,
            Err(MessageError::Mempool(MempoolError::GasEstimation(_)))
        ));
        // Failed simulation never reaches the pool
        assert_eq!(mempool.pushed().len(), 1);
    }

    #[test]
    fn distinct_messages_have_distinct_cids() {
        let message = Message {
            version: 0,
            to: Address::new_id(1000),
            from: Address::new_id(1001),
            sequence: 0,
            value: TokenAmount::zero(),
            method: methods::PRE_COMMIT_SECTOR,
            params: vec![],
            gas_limit: 0,
            gas_fee_cap: TokenAmount::zero(),
            gas_premium: TokenAmount::zero(),
        };
        let first = SignedMessage {
            message: message.clone(),
            signature: vec![],
        };
        let second = SignedMessage {
            message: Message {
                sequence: 1,
                ..message
            },
            signature: vec![],
        };
        assert_ne!(first.cid().unwrap(), second.cid().unwrap());
        assert_eq!(first.cid().unwrap().codec(), DAG_CBOR);
    }
}
