//! bitcoind JSON-RPC ledger source.
//!
//! Talks to a Bitcoin Core node over HTTP with basic auth. Blocks are
//! requested with verbosity 2 so every transaction arrives decoded, with
//! destination addresses already extracted from the output scripts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::Amount;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, trace, warn};

use super::LedgerSource;
use crate::error::RecoveryError;
use crate::types::{Block, BlockHeader, Transaction, TxInput, TxOutput};

/// Connection settings for a bitcoind node.
#[derive(Debug, Clone)]
pub struct BitcoindConfig {
    /// RPC endpoint, e.g. `http://127.0.0.1:8332`
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Per-request timeout
    pub timeout: Duration,
    /// Retries after a transport failure (0 = single attempt)
    pub max_retries: u32,
    /// Base delay between retries; attempt `n` waits `n * retry_delay`
    pub retry_delay: Duration,
}

impl Default for BitcoindConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8332".to_string(),
            user: None,
            password: None,
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// A failed attempt, split by whether another attempt may help.
enum CallError {
    Transport(anyhow::Error),
    Fatal(anyhow::Error),
}

/// Ledger source backed by bitcoind's JSON-RPC interface.
pub struct BitcoindClient {
    client: reqwest::Client,
    config: BitcoindConfig,
    next_id: AtomicU64,
}

impl BitcoindClient {
    pub fn new(config: BitcoindConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            config,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// Call `method`, retrying transport failures with linear backoff.
    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> anyhow::Result<T> {
        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                warn!("RPC retry {} for {}", attempt, method);
                tokio::time::sleep(self.config.retry_delay * attempt).await;
            }

            match self.call_once(method, params.clone()).await {
                Ok(result) => return Ok(result),
                Err(CallError::Fatal(e)) => return Err(e),
                Err(CallError::Transport(e)) => {
                    debug!("RPC {} failed: {}", method, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("RPC {} failed", method)))
    }

    async fn call_once<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, CallError> {
        let request = JsonRpcRequest {
            jsonrpc: "1.0",
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            method,
            params,
        };
        trace!("RPC {} {}", request.method, request.params);

        let mut builder = self.client.post(&self.config.url).json(&request);
        if let Some(user) = &self.config.user {
            builder = builder.basic_auth(user, self.config.password.as_ref());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| CallError::Transport(e.into()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(CallError::Fatal(anyhow::anyhow!(
                "RPC authentication rejected by {}",
                self.config.url
            )));
        }
        if status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            return Err(CallError::Transport(anyhow::anyhow!(
                "node busy (HTTP {})",
                status
            )));
        }

        // bitcoind reports RPC errors with a non-2xx status and a JSON body
        let body = response
            .text()
            .await
            .map_err(|e| CallError::Transport(e.into()))?;
        let parsed: JsonRpcResponse<T> = serde_json::from_str(&body).map_err(|e| {
            CallError::Fatal(anyhow::anyhow!(
                "HTTP {} with unparseable body ({}): {}",
                status,
                e,
                body.chars().take(200).collect::<String>()
            ))
        })?;

        if let Some(error) = parsed.error {
            return Err(CallError::Fatal(anyhow::anyhow!(
                "RPC error {}: {}",
                error.code,
                error.message
            )));
        }

        parsed
            .result
            .ok_or_else(|| CallError::Fatal(anyhow::anyhow!("Missing result in RPC response")))
    }
}

#[async_trait]
impl LedgerSource for BitcoindClient {
    async fn best_block_hash(&self) -> anyhow::Result<String> {
        self.call("getbestblockhash", json!([])).await
    }

    async fn header(&self, hash: &str) -> anyhow::Result<BlockHeader> {
        let header: RpcHeader = self.call("getblockheader", json!([hash, true])).await?;
        Ok(BlockHeader {
            hash: header.hash,
            height: header.height,
        })
    }

    async fn block_hash(&self, height: u64) -> anyhow::Result<String> {
        self.call("getblockhash", json!([height])).await
    }

    async fn block(&self, hash: &str) -> anyhow::Result<Block> {
        let block: RpcBlock = self.call("getblock", json!([hash, 2])).await?;
        Ok(Block::try_from(block)?)
    }
}

#[derive(Debug, Deserialize)]
struct RpcHeader {
    hash: String,
    height: u64,
}

#[derive(Debug, Deserialize)]
struct RpcBlock {
    hash: String,
    height: u64,
    tx: Vec<RpcTransaction>,
}

#[derive(Debug, Deserialize)]
struct RpcTransaction {
    txid: String,
    vin: Vec<RpcInput>,
    vout: Vec<RpcOutput>,
}

#[derive(Debug, Deserialize)]
struct RpcInput {
    txid: Option<String>,
    vout: Option<u32>,
    coinbase: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RpcOutput {
    value: f64,
    #[serde(rename = "scriptPubKey")]
    script_pub_key: RpcScriptPubKey,
}

#[derive(Debug, Deserialize)]
struct RpcScriptPubKey {
    /// Single destination (Bitcoin Core 22+)
    address: Option<String>,
    /// Destination list (Bitcoin Core before 22)
    #[serde(default)]
    addresses: Vec<String>,
}

impl TryFrom<RpcBlock> for Block {
    type Error = RecoveryError;

    fn try_from(block: RpcBlock) -> Result<Self, Self::Error> {
        let transactions = block
            .tx
            .into_iter()
            .map(Transaction::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Block::new(block.hash, block.height, transactions))
    }
}

impl TryFrom<RpcTransaction> for Transaction {
    type Error = RecoveryError;

    fn try_from(tx: RpcTransaction) -> Result<Self, Self::Error> {
        let mut inputs = Vec::with_capacity(tx.vin.len());
        for (n, vin) in tx.vin.into_iter().enumerate() {
            let input = match (vin.txid, vin.vout, vin.coinbase) {
                (Some(prev_txid), Some(prev_vout), _) => TxInput::Spend {
                    prev_txid,
                    prev_vout,
                },
                (None, _, Some(_)) => TxInput::Coinbase,
                _ => {
                    return Err(RecoveryError::MalformedLedgerData(format!(
                        "input {} of {} has neither a previous output nor coinbase data",
                        n, tx.txid
                    )))
                }
            };
            inputs.push(input);
        }

        let mut outputs = Vec::with_capacity(tx.vout.len());
        for vout in tx.vout {
            let value = Amount::from_btc(vout.value).map_err(|e| {
                RecoveryError::MalformedLedgerData(format!(
                    "bad output value {} in {}: {}",
                    vout.value, tx.txid, e
                ))
            })?;
            let RpcScriptPubKey { address, mut addresses } = vout.script_pub_key;
            if let Some(address) = address {
                if !addresses.contains(&address) {
                    addresses.insert(0, address);
                }
            }
            outputs.push(TxOutput::new(value.to_sat(), addresses));
        }

        Ok(Transaction::new(tx.txid, inputs, outputs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_block(value: Value) -> Result<Block, RecoveryError> {
        let block: RpcBlock = serde_json::from_value(value).unwrap();
        Block::try_from(block)
    }

    #[test]
    fn test_parse_verbose_block() {
        let block = parse_block(json!({
            "hash": "00ff",
            "height": 101,
            "tx": [
                {
                    "txid": "cb",
                    "vin": [{ "coinbase": "0165", "sequence": 4294967295u32 }],
                    "vout": [
                        { "value": 50.0, "n": 0, "scriptPubKey": { "address": "bcrt1qminer", "type": "witness_v0_keyhash" } },
                        { "value": 0.0, "n": 1, "scriptPubKey": { "type": "nulldata" } }
                    ]
                },
                {
                    "txid": "t1",
                    "vin": [{ "txid": "cb", "vout": 0 }],
                    "vout": [
                        { "value": 0.1234, "n": 0, "scriptPubKey": { "addresses": ["1legacy"] } }
                    ]
                }
            ]
        }))
        .unwrap();

        assert_eq!(block.height, 101);
        assert_eq!(block.transactions.len(), 2);

        let coinbase = &block.transactions[0];
        assert_eq!(coinbase.inputs, vec![TxInput::Coinbase]);
        assert_eq!(coinbase.outputs[0].value, 5_000_000_000);
        assert_eq!(coinbase.outputs[0].addresses, vec!["bcrt1qminer".to_string()]);
        assert!(coinbase.outputs[1].addresses.is_empty());

        let spend = &block.transactions[1];
        assert_eq!(spend.inputs, vec![TxInput::spend("cb", 0)]);
        assert_eq!(spend.outputs[0].value, 12_340_000);
        assert_eq!(spend.outputs[0].addresses, vec!["1legacy".to_string()]);
    }

    #[test]
    fn test_input_without_reference_is_malformed() {
        let err = parse_block(json!({
            "hash": "00ff",
            "height": 1,
            "tx": [{ "txid": "t", "vin": [{ "sequence": 1 }], "vout": [] }]
        }))
        .unwrap_err();
        assert!(matches!(err, RecoveryError::MalformedLedgerData(_)));
    }

    #[test]
    fn test_negative_value_is_malformed() {
        let err = parse_block(json!({
            "hash": "00ff",
            "height": 1,
            "tx": [{
                "txid": "t",
                "vin": [{ "coinbase": "00" }],
                "vout": [{ "value": -1.0, "n": 0, "scriptPubKey": {} }]
            }]
        }))
        .unwrap_err();
        assert!(matches!(err, RecoveryError::MalformedLedgerData(_)));
    }

    #[test]
    fn test_error_response_parses() {
        let parsed: JsonRpcResponse<String> = serde_json::from_str(
            r#"{"result":null,"error":{"code":-8,"message":"Block height out of range"},"id":1}"#,
        )
        .unwrap();
        assert!(parsed.result.is_none());
        let error = parsed.error.unwrap();
        assert_eq!(error.code, -8);
        assert_eq!(error.message, "Block height out of range");
    }

    #[tokio::test]
    async fn test_unreachable_node_fails_after_retries() {
        let client = BitcoindClient::new(BitcoindConfig {
            url: "http://127.0.0.1:1".to_string(),
            timeout: Duration::from_millis(200),
            max_retries: 1,
            retry_delay: Duration::from_millis(1),
            ..Default::default()
        })
        .unwrap();

        assert!(client.best_block_hash().await.is_err());
    }
}
