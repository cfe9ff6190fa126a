use crate::core::transaction::AssetId;
use crate::crypto::hash::Hash256;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum NetworkType {
    Mainnet,
    Testnet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub network_type: NetworkType,
    pub storage: StorageConfig,
    pub consensus: ConsensusParams,
    pub mining: MiningConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

/// Constants supplied by the consensus-parameters collaborator. Nothing in the
/// chain, pool or template code hard-codes these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusParams {
    pub native_asset: AssetId,
    pub coinbase_maturity: u64,
    pub initial_block_subsidy: u64,
    pub subsidy_halving_interval: u64,
    pub retarget_interval: u64,
    pub target_block_time: u64, // seconds
    pub seed_interval: u64,
    pub initial_seed: Hash256,
    pub pow_limit_bits: u32,
    pub max_block_size: usize,
    pub max_block_txs: usize,
    pub max_tx_size: usize,
    pub max_future_block_time: u64, // seconds
    pub median_time_blocks: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiningConfig {
    pub coinbase_program: String, // hex
    pub max_template_txs: usize,
}

impl Default for ConsensusParams {
    fn default() -> Self {
        Self {
            native_asset: AssetId::new([0xff; 32]),
            coinbase_maturity: 100,
            initial_block_subsidy: 41_250_000_000,
            subsidy_halving_interval: 840_000,
            retarget_interval: 2016,
            target_block_time: 150, // 2.5 minutes
            seed_interval: 256,
            initial_seed: Hash256::hash(b"qtc ledger initial seed"),
            pow_limit_bits: 0x1f00_ffff,
            max_block_size: 1024 * 1024, // 1MB
            max_block_txs: 10_000,
            max_tx_size: 100_000, // 100KB
            max_future_block_time: 2 * 60 * 60,
            median_time_blocks: 11,
        }
    }
}

impl ConsensusParams {
    /// Parameters for local chains where proof of work has to be trivially solvable.
    pub fn regtest() -> Self {
        Self {
            coinbase_maturity: 10,
            retarget_interval: 20,
            seed_interval: 8,
            pow_limit_bits: 0x207f_ffff,
            ..Self::default()
        }
    }
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            coinbase_program: "51".to_string(), // OP_TRUE
            max_template_txs: 5_000,
        }
    }
}

impl MiningConfig {
    pub fn coinbase_program_bytes(&self) -> anyhow::Result<Vec<u8>> {
        Ok(hex::decode(&self.coinbase_program)?)
    }
}

impl Default for Config {
    fn default() -> Self {
        let home_dir = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        let data_dir = PathBuf::from(home_dir).join(".qtc-ledger");

        Self {
            network_type: NetworkType::Mainnet,
            storage: StorageConfig { data_dir },
            consensus: ConsensusParams::default(),
            mining: MiningConfig::default(),
        }
    }
}

impl Config {
    pub fn testnet() -> Self {
        let home_dir = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        let data_dir = PathBuf::from(home_dir).join(".qtc-ledger-testnet");

        Self {
            network_type: NetworkType::Testnet,
            storage: StorageConfig { data_dir },
            consensus: ConsensusParams::regtest(),
            mining: MiningConfig::default(),
        }
    }

    pub fn is_testnet(&self) -> bool {
        self.network_type == NetworkType::Testnet
    }

    pub fn chain_db_path(&self) -> PathBuf {
        self.storage.data_dir.join("chain.db")
    }

    /// Loads the config at `path` (or the default location), writing the
    /// defaults there on first use.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let config_path = path.map(Path::to_path_buf).unwrap_or_else(Self::config_path);

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Config = serde_json::from_str(&content)?;
            Ok(config)
        } else {
            let config = Self::default();
            config.save(&config_path)?;
            Ok(config)
        }
    }

    pub fn save(&self, config_path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;

        Ok(())
    }

    fn config_path() -> PathBuf {
        let home_dir = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home_dir).join(".qtc-ledger").join("config.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_writes_defaults() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("config.json");

        let config = Config::load(Some(&path))?;
        assert!(path.exists());
        assert_eq!(config.network_type, NetworkType::Mainnet);

        let reloaded = Config::load(Some(&path))?;
        assert_eq!(reloaded.consensus.coinbase_maturity, config.consensus.coinbase_maturity);
        assert_eq!(reloaded.consensus.native_asset, config.consensus.native_asset);
        Ok(())
    }

    #[test]
    fn test_testnet_uses_regtest_params() {
        let config = Config::testnet();
        assert!(config.is_testnet());
        assert_eq!(config.consensus.pow_limit_bits, 0x207f_ffff);
        assert_eq!(config.mining.coinbase_program_bytes().unwrap(), vec![0x51]);
    }
}
