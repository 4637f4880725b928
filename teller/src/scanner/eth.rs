//! ETH chain client over the geth JSON-RPC API.
//!
//! Amounts are wei. Ethereum has no transaction outputs, so every
//! transaction whose `to` field matches a scan address becomes one
//! pseudo-output at index zero. Addresses are normalized to lowercase
//! hex, which is also how the pool must store them.

use serde::Deserialize;
use serde::Serialize;
use url::Url;

use crate::error::Error;
use crate::scanner::ChainBlock;
use crate::scanner::ChainInteract;
use crate::scanner::ChainOutput;
use crate::scanner::ChainTx;
use crate::storage::model::CoinType;

/// Client for a geth-compatible node.
#[derive(Debug, Clone)]
pub struct EthRpcClient {
    http: reqwest::Client,
    url: Url,
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u32,
    method: &'a str,
    params: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<serde_json::Value>,
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    message: String,
}

#[derive(Debug, Deserialize)]
struct EthBlock {
    hash: String,
    timestamp: String,
    transactions: Vec<EthTransaction>,
}

#[derive(Debug, Deserialize)]
struct EthTransaction {
    hash: String,
    to: Option<String>,
    value: String,
}

impl EthRpcClient {
    /// Build a client for the node at `url`.
    pub fn new(url: &str, timeout: std::time::Duration) -> Result<Self, Error> {
        let url = Url::parse(url).map_err(|error| Error::InvalidUrl {
            url: url.to_string(),
            error,
        })?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, url })
    }

    /// Issue one JSON-RPC call and return its raw result value, which is
    /// `null` for "no such block".
    async fn call(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value, Error> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method,
            params,
        };

        let response: RpcResponse = self
            .http
            .post(self.url.clone())
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(error) = response.error {
            return Err(Error::NodeRpc {
                coin_type: CoinType::Eth,
                message: error.message,
            });
        }
        Ok(response.result.unwrap_or(serde_json::Value::Null))
    }
}

/// Parse a `0x`-prefixed hex quantity.
fn parse_quantity(raw: &str) -> Result<u128, Error> {
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    u128::from_str_radix(digits, 16).map_err(|_| Error::NodeResponse {
        coin_type: CoinType::Eth,
        message: format!("bad hex quantity {raw:?}"),
    })
}

impl ChainInteract for EthRpcClient {
    fn coin_type(&self) -> CoinType {
        CoinType::Eth
    }

    async fn get_block_count(&self) -> Result<u64, Error> {
        let raw = self.call("eth_blockNumber", serde_json::json!([])).await?;
        let raw = raw.as_str().ok_or_else(|| Error::NodeResponse {
            coin_type: CoinType::Eth,
            message: "eth_blockNumber result is not a string".to_string(),
        })?;
        Ok(parse_quantity(raw)? as u64)
    }

    async fn get_block_at(&self, height: u64) -> Result<Option<ChainBlock>, Error> {
        let tag = format!("0x{height:x}");
        let value = self
            .call("eth_getBlockByNumber", serde_json::json!([tag, true]))
            .await?;
        if value.is_null() {
            return Ok(None);
        }
        let block: EthBlock =
            serde_json::from_value(value).map_err(|error| Error::NodeResponse {
                coin_type: CoinType::Eth,
                message: error.to_string(),
            })?;

        let txs = block
            .transactions
            .iter()
            .filter_map(|tx| {
                let to = tx.to.as_deref()?;
                let amount = parse_quantity(&tx.value).ok()?;
                Some(ChainTx {
                    id: tx.hash.clone(),
                    outputs: vec![ChainOutput {
                        index: 0,
                        address: to.to_ascii_lowercase(),
                        amount: amount as i128,
                    }],
                })
            })
            .collect();

        Ok(Some(ChainBlock {
            height,
            hash: block.hash,
            timestamp: parse_quantity(&block.timestamp)? as i64,
            txs,
        }))
    }
}
