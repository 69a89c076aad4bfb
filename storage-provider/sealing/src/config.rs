use std::path::Path;

use primitives_proofs::ChainEpoch;
use serde::{Deserialize, Serialize};

use crate::types::{Address, TokenAmount};

/// 1 FIL in attoFIL.
const FIL: u64 = 1_000_000_000_000_000_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Sealing pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealingConfig {
    /// Miner actor the sectors belong to.
    pub miner: Address,
    /// Address messages are sent from.
    pub worker: Address,
    #[serde(default)]
    pub collateral: CollateralConfig,
    #[serde(default)]
    pub fees: FeeConfig,
    /// Dry-run gas estimation before pushing a message.
    #[serde(default)]
    pub simulate_gas: bool,
    #[serde(default)]
    pub chain: ChainConfig,
}

impl SealingConfig {
    pub fn new(miner: Address, worker: Address) -> Self {
        Self {
            miner,
            worker,
            collateral: CollateralConfig::default(),
            fees: FeeConfig::default(),
            simulate_gas: false,
            chain: ChainConfig::default(),
        }
    }

    /// Reads the configuration from a JSON file.
    pub fn load<P>(path: P) -> Result<Self, ConfigError>
    where
        P: AsRef<Path>,
    {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }
}

/// Where message collateral comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollateralConfig {
    /// Pay collateral out of the miner actor's available balance first.
    pub from_miner_balance: bool,
    /// When paying from the miner balance, never fall back to the sending wallet.
    pub disable_fallback: bool,
    /// Part of the miner balance that is never used for collateral.
    pub available_balance_buffer: TokenAmount,
}

/// Fee ceilings per message kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeeConfig {
    pub max_pre_commit_fee: TokenAmount,
    pub max_commit_fee: TokenAmount,
    pub max_declare_faults_fee: TokenAmount,
}

impl Default for FeeConfig {
    fn default() -> Self {
        // 0.025 FIL, 0.05 FIL and 0.05 FIL
        Self {
            max_pre_commit_fee: TokenAmount::from_atto(FIL / 40),
            max_commit_fee: TokenAmount::from_atto(FIL / 20),
            max_declare_faults_fee: TokenAmount::from_atto(FIL / 20),
        }
    }
}

/// Network policy values the pipeline depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Epochs between the pre-commit landing and the interactive seed epoch.
    pub pre_commit_challenge_delay: ChainEpoch,
    /// Epochs that must pass on top of the seed epoch before it is used.
    pub interactive_porep_confidence: u64,
    /// How far behind the head the ticket is drawn.
    pub seal_randomness_lookback: ChainEpoch,
    /// Oldest ticket the miner actor still accepts in a pre-commit.
    pub max_pre_commit_randomness_lookback: ChainEpoch,
    /// Epochs on top of a message before its receipt is trusted.
    pub message_confidence: u64,
    /// Lifetime of sectors without deals.
    pub committed_capacity_sector_lifetime: ChainEpoch,
    /// Added on top of the latest deal end when computing the sector expiration.
    pub sector_expiration_margin: ChainEpoch,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            pre_commit_challenge_delay: 150,
            interactive_porep_confidence: 6,
            seal_randomness_lookback: 900,
            max_pre_commit_randomness_lookback: 1800,
            message_confidence: 5,
            // 180 days
            committed_capacity_sector_lifetime: 518_400,
            sector_expiration_margin: 20,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn load_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "miner": 1000,
                "worker": 1001,
                "collateral": {{ "from_miner_balance": true, "available_balance_buffer": "500" }},
                "chain": {{ "pre_commit_challenge_delay": 10 }}
            }}"#
        )
        .unwrap();

        let config = SealingConfig::load(file.path()).unwrap();
        assert_eq!(config.miner, Address::new_id(1000));
        assert_eq!(config.worker, Address::new_id(1001));
        assert!(config.collateral.from_miner_balance);
        assert!(!config.collateral.disable_fallback);
        assert_eq!(
            config.collateral.available_balance_buffer,
            TokenAmount::from_atto(500)
        );
        assert_eq!(config.chain.pre_commit_challenge_delay, 10);
        assert_eq!(config.chain.seal_randomness_lookback, 900);
        assert_eq!(config.fees, FeeConfig::default());
        assert!(!config.simulate_gas);
    }

    #[test]
    fn load_rejects_missing_miner() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "worker": 1001 }}"#).unwrap();
        assert!(matches!(
            SealingConfig::load(file.path()),
            Err(ConfigError::Json(_))
        ));
    }
}
