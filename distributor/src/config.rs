use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use airdrop_common::{AirdropError, AirdropResult};

/// Environment prefix for overrides, e.g. `AIRDROP__CHAIN__RPC_URL`
pub const ENV_PREFIX: &str = "AIRDROP";

/// Distributor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributorConfig {
    /// Service identity and startup behaviour
    pub service: ServiceConfig,

    /// Task and user task storage
    pub database: DatabaseConfig,

    /// RPC endpoint, contract and signing key
    pub chain: ChainConfig,

    /// Cycle scheduling
    pub schedule: ScheduleConfig,

    /// Metrics and logging
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,

    /// Run one cycle immediately instead of waiting a full interval
    pub run_on_start: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// `postgres` or `memory`
    pub backend: String,

    pub url: String,

    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub rpc_url: String,

    /// EIP-155 chain id; queried from the node when unset
    pub chain_id: Option<u64>,

    /// Address of the airdrop registry contract
    pub contract_address: String,

    /// ABI JSON of the registry contract
    pub abi_path: String,

    /// Hex signing key. Prefer `private_key_env` outside of development.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,

    /// Name of the environment variable holding the hex signing key
    #[serde(default)]
    pub private_key_env: Option<String>,

    /// Upper bound for every single RPC call
    pub rpc_timeout_ms: u64,

    /// Headroom applied to the node's gas estimate, in percent
    pub gas_limit_multiplier_percent: u64,

    /// Gas limit cap, also used when the node cannot estimate
    pub max_gas_limit: u64,

    /// Also push task rewards with `setReward` after publishing roots
    pub sync_rewards: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub cycle_interval_secs: u64,

    /// Number of task trees built in parallel
    pub max_concurrent_tasks: usize,

    /// Skip tasks whose leaves did not change since the last published root
    pub skip_unchanged: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub enable_metrics: bool,

    pub log_level: String,
}

impl DistributorConfig {
    /// Load a TOML file and apply `AIRDROP__SECTION__KEY` environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> AirdropResult<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).format(config::FileFormat::Toml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| AirdropError::Config(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| AirdropError::Config(e.to_string()))
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> AirdropResult<()> {
        let content = toml::to_string_pretty(self).map_err(|e| AirdropError::Config(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| AirdropError::Config(e.to_string()))?;
        Ok(())
    }

    pub fn validate(&self) -> AirdropResult<()> {
        if self.service.name.is_empty() {
            return Err(AirdropError::Config("Service name cannot be empty".to_string()));
        }

        match self.database.backend.as_str() {
            "memory" => {}
            "postgres" => {
                if self.database.url.is_empty() {
                    return Err(AirdropError::Config("Database URL cannot be empty".to_string()));
                }
                if self.database.max_connections == 0 {
                    return Err(AirdropError::Config("max_connections must be > 0".to_string()));
                }
            }
            other => {
                return Err(AirdropError::Config(format!("Unknown database backend '{}'", other)));
            }
        }

        if self.chain.rpc_url.is_empty() {
            return Err(AirdropError::Config("RPC URL cannot be empty".to_string()));
        }
        if self.chain.contract_address.is_empty() {
            return Err(AirdropError::Config("Contract address cannot be empty".to_string()));
        }
        if self.chain.abi_path.is_empty() {
            return Err(AirdropError::Config("ABI path cannot be empty".to_string()));
        }
        if self.chain.private_key.is_none() && self.chain.private_key_env.is_none() {
            return Err(AirdropError::Config(
                "Either chain.private_key or chain.private_key_env must be set".to_string(),
            ));
        }
        if self.chain.rpc_timeout_ms == 0 {
            return Err(AirdropError::Config("rpc_timeout_ms must be > 0".to_string()));
        }
        if self.chain.gas_limit_multiplier_percent < 100 {
            return Err(AirdropError::Config("gas_limit_multiplier_percent must be >= 100".to_string()));
        }
        if self.chain.max_gas_limit == 0 {
            return Err(AirdropError::Config("max_gas_limit must be > 0".to_string()));
        }

        if self.schedule.cycle_interval_secs == 0 {
            return Err(AirdropError::Config("cycle_interval_secs must be > 0".to_string()));
        }
        if self.schedule.max_concurrent_tasks == 0 {
            return Err(AirdropError::Config("max_concurrent_tasks must be > 0".to_string()));
        }

        Ok(())
    }

    /// Signing key as hex, inline value first, then the named environment variable
    pub fn resolve_private_key(&self) -> AirdropResult<String> {
        if let Some(key) = &self.chain.private_key {
            return Ok(key.clone());
        }
        match &self.chain.private_key_env {
            Some(var) => std::env::var(var)
                .map_err(|_| AirdropError::Config(format!("Environment variable {} is not set", var))),
            None => Err(AirdropError::Config("No signing key configured".to_string())),
        }
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.chain.rpc_timeout_ms)
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.schedule.cycle_interval_secs)
    }
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            database: DatabaseConfig::default(),
            chain: ChainConfig {
                rpc_url: "http://localhost:8545".to_string(),
                chain_id: None,
                contract_address: "0x0000000000000000000000000000000000000000".to_string(),
                abi_path: "abi/Airdrop.json".to_string(),
                private_key: None,
                private_key_env: Some("AIRDROP_PRIVATE_KEY".to_string()),
                rpc_timeout_ms: 30_000,
                gas_limit_multiplier_percent: 120,
                max_gas_limit: 1_000_000,
                sync_rewards: false,
            },
            schedule: ScheduleConfig {
                cycle_interval_secs: 3600,
                max_concurrent_tasks: 4,
                skip_unchanged: false,
            },
            monitoring: MonitoringConfig {
                enable_metrics: true,
                log_level: "info".to_string(),
            },
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "airdrop-distributor".to_string(),
            run_on_start: true,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: "postgres".to_string(),
            url: "postgresql://localhost/airdrop".to_string(),
            max_connections: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = DistributorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rpc_timeout(), Duration::from_secs(30));
        assert_eq!(config.cycle_interval(), Duration::from_secs(3600));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = DistributorConfig::default();
        config.schedule.max_concurrent_tasks = 0;
        assert!(matches!(config.validate(), Err(AirdropError::Config(_))));

        let mut config = DistributorConfig::default();
        config.chain.private_key_env = None;
        assert!(config.validate().is_err());

        let mut config = DistributorConfig::default();
        config.database.backend = "mysql".to_string();
        assert!(config.validate().is_err());

        let mut config = DistributorConfig::default();
        config.chain.gas_limit_multiplier_percent = 90;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("distributor.toml");

        let mut config = DistributorConfig::default();
        config.database.backend = "memory".to_string();
        config.schedule.skip_unchanged = true;
        config.chain.chain_id = Some(80001);
        config.save(&path).unwrap();

        let loaded = DistributorConfig::load(&path).unwrap();
        assert_eq!(loaded.database.backend, "memory");
        assert!(loaded.schedule.skip_unchanged);
        assert_eq!(loaded.chain.chain_id, Some(80001));
        assert_eq!(loaded.chain.max_gas_limit, 1_000_000);
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            DistributorConfig::load("/nonexistent/distributor.toml"),
            Err(AirdropError::Config(_))
        ));
    }

    #[test]
    fn test_inline_key_wins() {
        let mut config = DistributorConfig::default();
        config.chain.private_key = Some("0xabc".to_string());
        assert_eq!(config.resolve_private_key().unwrap(), "0xabc");

        config.chain.private_key = None;
        config.chain.private_key_env = Some("AIRDROP_TEST_KEY_THAT_IS_NEVER_SET".to_string());
        assert!(config.resolve_private_key().is_err());
    }
}
