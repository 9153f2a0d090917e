use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use web3::{
    signing::{Key, SecretKey, SecretKeyRef},
    types::{Address, Bytes, CallRequest, TransactionParameters, H256, U256},
};

use airdrop_common::{AirdropError, AirdropResult, ChainError, RootPair, TaskId};

use crate::abi::{AbiPacker, SET_MERKLE_ROOT, SET_REWARD};
use crate::chain::{bounded, ChainClient};
use crate::config::DistributorConfig;
use crate::leaf::parse_address;

/// Gas and timeout knobs for root submission
#[derive(Debug, Clone)]
pub struct PublisherSettings {
    /// Fixed EIP-155 chain id; asked from the node when `None`
    pub chain_id: Option<u64>,
    pub rpc_timeout: Duration,
    pub gas_limit_multiplier_percent: u64,
    pub max_gas_limit: u64,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            chain_id: None,
            rpc_timeout: Duration::from_secs(30),
            gas_limit_multiplier_percent: 120,
            max_gas_limit: 1_000_000,
        }
    }
}

/// Signs and broadcasts root batches to the airdrop registry contract.
///
/// One `publish` call is one transaction. Nonce and gas price are fetched
/// right before signing and nothing waits for confirmation.
pub struct RootPublisher {
    client: Arc<dyn ChainClient>,
    abi: AbiPacker,
    contract: Address,
    key: SecretKey,
    sender: Address,
    settings: PublisherSettings,
}

/// Parse a hex-encoded secp256k1 private key
pub fn parse_secret_key(input: &str) -> Result<SecretKey, ChainError> {
    let trimmed = input.trim();
    let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    let bytes = hex::decode(digits).map_err(|e| ChainError::InvalidKey(format!("not hex: {}", e)))?;
    SecretKey::from_slice(&bytes).map_err(|e| ChainError::InvalidKey(e.to_string()))
}

impl RootPublisher {
    pub fn new(
        client: Arc<dyn ChainClient>,
        abi: AbiPacker,
        contract: Address,
        key: SecretKey,
        settings: PublisherSettings,
    ) -> Self {
        let sender = SecretKeyRef::new(&key).address();
        Self {
            client,
            abi,
            contract,
            key,
            sender,
            settings,
        }
    }

    /// Build a publisher from the `chain` section
    pub fn from_config(config: &DistributorConfig, client: Arc<dyn ChainClient>) -> AirdropResult<Self> {
        let abi = AbiPacker::from_file(&config.chain.abi_path)?;
        let contract = parse_address(&config.chain.contract_address)
            .map_err(|e| AirdropError::Config(format!("chain.contract_address: {}", e)))?;
        let key = parse_secret_key(&config.resolve_private_key()?)?;

        let settings = PublisherSettings {
            chain_id: config.chain.chain_id,
            rpc_timeout: config.rpc_timeout(),
            gas_limit_multiplier_percent: config.chain.gas_limit_multiplier_percent,
            max_gas_limit: config.chain.max_gas_limit,
        };

        let publisher = Self::new(client, abi, contract, key, settings);
        info!(sender = ?publisher.sender, contract = ?contract, "Root publisher ready");
        Ok(publisher)
    }

    /// Account that signs every publication
    pub fn sender(&self) -> Address {
        self.sender
    }

    pub fn abi(&self) -> &AbiPacker {
        &self.abi
    }

    /// Submit `setMerkleRoot(taskIds, roots)` for the whole batch
    pub async fn publish(&self, pairs: &[RootPair]) -> Result<H256, ChainError> {
        if pairs.is_empty() {
            return Err(ChainError::EmptyBatch);
        }

        let data = self.abi.encode_set_merkle_root(pairs)?;
        let tx_hash = self.submit(SET_MERKLE_ROOT, data).await?;
        info!(tx_hash = ?tx_hash, tasks = pairs.len(), "Published merkle roots");
        Ok(tx_hash)
    }

    /// Submit `setReward(taskIds, amounts)`
    pub async fn publish_rewards(&self, rewards: &[(TaskId, U256)]) -> Result<H256, ChainError> {
        if rewards.is_empty() {
            return Err(ChainError::EmptyBatch);
        }

        let data = self.abi.encode_set_reward(rewards)?;
        let tx_hash = self.submit(SET_REWARD, data).await?;
        info!(tx_hash = ?tx_hash, tasks = rewards.len(), "Published task rewards");
        Ok(tx_hash)
    }

    async fn submit(&self, function: &str, data: Vec<u8>) -> Result<H256, ChainError> {
        let timeout = self.settings.rpc_timeout;

        let chain_id = match self.settings.chain_id {
            Some(id) => id,
            None => bounded("eth_chainId", timeout, self.client.chain_id()).await?,
        };
        let nonce = bounded("eth_getTransactionCount", timeout, self.client.pending_nonce(self.sender)).await?;
        let gas_price = bounded("eth_gasPrice", timeout, self.client.suggest_gas_price()).await?;
        let gas = self.gas_limit(&data).await?;

        debug!(
            function,
            nonce = %nonce,
            gas_price = %gas_price,
            gas = %gas,
            chain_id,
            "Signing contract call"
        );

        let tx = TransactionParameters {
            nonce: Some(nonce),
            to: Some(self.contract),
            gas,
            gas_price: Some(gas_price),
            value: U256::zero(),
            data: Bytes(data),
            chain_id: Some(chain_id),
            ..Default::default()
        };

        let signed = bounded("sign_transaction", timeout, self.client.sign_transaction(tx, self.key)).await?;
        bounded(
            "eth_sendRawTransaction",
            timeout,
            self.client.send_raw_transaction(signed.raw_transaction),
        )
        .await
    }

    /// Node estimate scaled by the configured headroom and capped at the maximum.
    /// A node that cannot estimate gets the cap.
    async fn gas_limit(&self, data: &[u8]) -> Result<U256, ChainError> {
        let max = U256::from(self.settings.max_gas_limit);
        let call = CallRequest {
            from: Some(self.sender),
            to: Some(self.contract),
            data: Some(Bytes(data.to_vec())),
            ..Default::default()
        };

        match bounded("eth_estimateGas", self.settings.rpc_timeout, self.client.estimate_gas(call)).await {
            Ok(estimate) => {
                let scaled = estimate.saturating_mul(U256::from(self.settings.gas_limit_multiplier_percent))
                    / U256::from(100u64);
                Ok(scaled.min(max))
            }
            Err(ChainError::Rpc(reason)) => {
                warn!(reason = %reason, "Gas estimation failed, using the configured cap");
                Ok(max)
            }
            Err(e) => Err(e),
        }
    }
}
