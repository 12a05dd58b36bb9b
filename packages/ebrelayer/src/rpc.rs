//! Source chain access
//!
//! The watcher only needs two reads: the chain head and a full block by
//! height. [`EvmRpcClient`] serves them over JSON-RPC, rotating to the next
//! configured URL whenever a read fails.

use alloy::primitives::{Address, Bytes, B256, U64};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Transient failure reading the source chain
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainReadError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("request timed out")]
    Timeout,

    #[error("block {0} not available")]
    MissingBlock(u64),

    #[error("malformed response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for ChainReadError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ChainReadError::Timeout
        } else if e.is_decode() {
            ChainReadError::Decode(e.to_string())
        } else {
            ChainReadError::Transport(e.to_string())
        }
    }
}

/// One transaction of a block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTx {
    pub hash: [u8; 32],
    pub index: u64,
    pub from: [u8; 20],
    /// None for contract creation
    pub to: Option<[u8; 20]>,
    pub input: Vec<u8>,
}

/// A block with its full transaction list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainBlock {
    pub height: u64,
    pub hash: [u8; 32],
    pub transactions: Vec<ChainTx>,
}

/// Read access to the source chain
#[async_trait]
pub trait SourceChain: Send + Sync {
    async fn head_height(&self) -> Result<u64, ChainReadError>;

    async fn block(&self, height: u64) -> Result<ChainBlock, ChainReadError>;
}

/// EVM RPC response wrapper
#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

/// EVM RPC error
#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcBlock {
    number: U64,
    hash: B256,
    transactions: Vec<RpcTransaction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcTransaction {
    hash: B256,
    from: Address,
    to: Option<Address>,
    input: Bytes,
    transaction_index: U64,
}

impl From<RpcBlock> for ChainBlock {
    fn from(block: RpcBlock) -> Self {
        let transactions = block
            .transactions
            .into_iter()
            .map(|tx| ChainTx {
                hash: tx.hash.0,
                index: tx.transaction_index.to::<u64>(),
                from: tx.from.into(),
                to: tx.to.map(Into::into),
                input: tx.input.to_vec(),
            })
            .collect();

        ChainBlock {
            height: block.number.to::<u64>(),
            hash: block.hash.0,
            transactions,
        }
    }
}

/// JSON-RPC client with ordered fallback URLs
pub struct EvmRpcClient {
    urls: Vec<String>,
    active: AtomicUsize,
    client: Client,
}

impl EvmRpcClient {
    pub fn new(urls: Vec<String>, timeout: Duration) -> Result<Self, ChainReadError> {
        if urls.is_empty() {
            return Err(ChainReadError::Transport(
                "at least one RPC URL is required".to_string(),
            ));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChainReadError::Transport(e.to_string()))?;
        Ok(Self {
            urls,
            active: AtomicUsize::new(0),
            client,
        })
    }

    fn current_url(&self) -> &str {
        &self.urls[self.active.load(Ordering::Relaxed) % self.urls.len()]
    }

    fn rotate(&self, error: &ChainReadError) {
        if self.urls.len() > 1 {
            let next = (self.active.fetch_add(1, Ordering::Relaxed) + 1) % self.urls.len();
            warn!(error = %error, next_url = %self.urls[next], "RPC failed, switching endpoint");
        }
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Option<T>, ChainReadError> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        let result = async {
            let response = self
                .client
                .post(self.current_url())
                .json(&body)
                .send()
                .await?
                .error_for_status()?
                .json::<RpcResponse<T>>()
                .await?;

            if let Some(error) = response.error {
                return Err(ChainReadError::Rpc {
                    code: error.code,
                    message: error.message,
                });
            }
            Ok(response.result)
        }
        .await;

        if let Err(e) = &result {
            self.rotate(e);
        }
        result
    }
}

#[async_trait]
impl SourceChain for EvmRpcClient {
    async fn head_height(&self) -> Result<u64, ChainReadError> {
        let head = self
            .call::<U64>("eth_blockNumber", serde_json::json!([]))
            .await?
            .ok_or_else(|| ChainReadError::Decode("no block number returned".to_string()))?;
        Ok(head.to::<u64>())
    }

    async fn block(&self, height: u64) -> Result<ChainBlock, ChainReadError> {
        let block = self
            .call::<RpcBlock>(
                "eth_getBlockByNumber",
                serde_json::json!([format!("0x{:x}", height), true]),
            )
            .await?
            .ok_or(ChainReadError::MissingBlock(height))?;

        let block = ChainBlock::from(block);
        if block.height != height {
            return Err(ChainReadError::Decode(format!(
                "asked for block {}, got {}",
                height, block.height
            )));
        }
        debug!(height, txs = block.transactions.len(), "Fetched block");
        Ok(block)
    }
}
