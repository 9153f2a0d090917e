use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};
use web3::{
    signing::SecretKey,
    transports::Http,
    types::{Address, BlockNumber, Bytes, CallRequest, SignedTransaction, TransactionParameters, H256, U256},
    Web3,
};

use airdrop_common::ChainError;

/// RPC surface the root publisher needs from an EVM node
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Next nonce for `account`, counting pending transactions
    async fn pending_nonce(&self, account: Address) -> Result<U256, ChainError>;

    async fn suggest_gas_price(&self) -> Result<U256, ChainError>;

    async fn estimate_gas(&self, call: CallRequest) -> Result<U256, ChainError>;

    async fn chain_id(&self) -> Result<u64, ChainError>;

    async fn sign_transaction(&self, tx: TransactionParameters, key: SecretKey) -> Result<SignedTransaction, ChainError>;

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, ChainError>;
}

/// Run one chain call under `timeout`, turning expiry into `ChainError::Timeout`
pub async fn bounded<T, F>(operation: &str, timeout: Duration, call: F) -> Result<T, ChainError>
where
    F: Future<Output = Result<T, ChainError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(ChainError::Timeout {
            operation: operation.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

/// JSON-RPC chain client over HTTP
pub struct Web3ChainClient {
    client: Web3<Http>,
    endpoint: String,
}

impl Web3ChainClient {
    pub fn new(rpc_url: &str) -> Result<Self, ChainError> {
        let transport = Http::new(rpc_url).map_err(|e| ChainError::Rpc(format!("invalid RPC endpoint {}: {}", rpc_url, e)))?;
        info!("Chain client configured for {}", rpc_url);
        Ok(Self {
            client: Web3::new(transport),
            endpoint: rpc_url.to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn rpc_error(operation: &str, e: web3::Error) -> ChainError {
    ChainError::Rpc(format!("{}: {}", operation, e))
}

#[async_trait]
impl ChainClient for Web3ChainClient {
    async fn pending_nonce(&self, account: Address) -> Result<U256, ChainError> {
        self.client
            .eth()
            .transaction_count(account, Some(BlockNumber::Pending))
            .await
            .map_err(|e| rpc_error("eth_getTransactionCount", e))
    }

    async fn suggest_gas_price(&self) -> Result<U256, ChainError> {
        self.client.eth().gas_price().await.map_err(|e| rpc_error("eth_gasPrice", e))
    }

    async fn estimate_gas(&self, call: CallRequest) -> Result<U256, ChainError> {
        self.client
            .eth()
            .estimate_gas(call, None)
            .await
            .map_err(|e| rpc_error("eth_estimateGas", e))
    }

    async fn chain_id(&self) -> Result<u64, ChainError> {
        let id = self.client.eth().chain_id().await.map_err(|e| rpc_error("eth_chainId", e))?;
        Ok(id.low_u64())
    }

    async fn sign_transaction(&self, tx: TransactionParameters, key: SecretKey) -> Result<SignedTransaction, ChainError> {
        // nonce, gas price and chain id are always set, so signing stays local
        self.client
            .accounts()
            .sign_transaction(tx, &key)
            .await
            .map_err(|e| ChainError::Submission(format!("signing failed: {}", e)))
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, ChainError> {
        let tx_hash = self
            .client
            .eth()
            .send_raw_transaction(raw)
            .await
            .map_err(|e| ChainError::Submission(format!("broadcast failed: {}", e)))?;
        debug!("Broadcast transaction {:?} via {}", tx_hash, self.endpoint);
        Ok(tx_hash)
    }
}
