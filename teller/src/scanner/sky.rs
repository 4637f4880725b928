//! SKY chain client over the Skycoin node REST API.
//!
//! Output amounts arrive as decimal coin strings and are normalized to
//! droplets (10^-6) without going through floating point.

use serde::Deserialize;
use url::Url;

use crate::error::Error;
use crate::scanner::ChainBlock;
use crate::scanner::ChainInteract;
use crate::scanner::ChainOutput;
use crate::scanner::ChainTx;
use crate::storage::model::CoinType;

/// Client for a Skycoin node.
#[derive(Debug, Clone)]
pub struct SkyRpcClient {
    http: reqwest::Client,
    base: Url,
}

#[derive(Debug, Deserialize)]
struct BlockchainMetadata {
    head: BlockHeader,
}

#[derive(Debug, Deserialize)]
struct BlocksResponse {
    blocks: Vec<SkyBlock>,
}

#[derive(Debug, Deserialize)]
struct SkyBlock {
    header: BlockHeader,
    body: SkyBlockBody,
}

#[derive(Debug, Deserialize)]
struct BlockHeader {
    seq: u64,
    #[serde(default)]
    block_hash: String,
    #[serde(default)]
    timestamp: i64,
}

#[derive(Debug, Deserialize)]
struct SkyBlockBody {
    txns: Vec<SkyTransaction>,
}

#[derive(Debug, Deserialize)]
struct SkyTransaction {
    txid: String,
    outputs: Vec<SkyOutput>,
}

#[derive(Debug, Deserialize)]
struct SkyOutput {
    dst: String,
    coins: String,
}

impl SkyRpcClient {
    /// Build a client for the node at `url`.
    pub fn new(url: &str, timeout: std::time::Duration) -> Result<Self, Error> {
        let base = Url::parse(url).map_err(|error| Error::InvalidUrl {
            url: url.to_string(),
            error,
        })?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, base })
    }

    fn endpoint(&self, path: &str) -> Result<Url, Error> {
        self.base.join(path).map_err(|error| Error::InvalidUrl {
            url: path.to_string(),
            error,
        })
    }
}

impl ChainInteract for SkyRpcClient {
    fn coin_type(&self) -> CoinType {
        CoinType::Sky
    }

    async fn get_block_count(&self) -> Result<u64, Error> {
        let url = self.endpoint("/api/v1/blockchain/metadata")?;
        let metadata: BlockchainMetadata = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(metadata.head.seq)
    }

    async fn get_block_at(&self, height: u64) -> Result<Option<ChainBlock>, Error> {
        let url = self.endpoint("/api/v1/blocks")?;
        let response = self
            .http
            .get(url)
            .query(&[("start", height), ("end", height)])
            .send()
            .await?
            .error_for_status()?;
        let blocks: BlocksResponse = response.json().await?;

        let Some(block) = blocks.blocks.into_iter().find(|b| b.header.seq == height) else {
            return Ok(None);
        };

        let txs = block
            .body
            .txns
            .iter()
            .map(|tx| {
                let outputs = tx
                    .outputs
                    .iter()
                    .enumerate()
                    .map(|(index, output)| {
                        let droplets = mdl::amount::droplets_from_coin_string(&output.coins)
                            .map_err(|error| Error::NodeResponse {
                                coin_type: CoinType::Sky,
                                message: format!("output {}:{index}: {error}", tx.txid),
                            })?;
                        Ok(ChainOutput {
                            index: index as u32,
                            address: output.dst.clone(),
                            amount: i128::from(droplets),
                        })
                    })
                    .collect::<Result<Vec<_>, Error>>()?;

                Ok(ChainTx {
                    id: tx.txid.clone(),
                    outputs,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        Ok(Some(ChainBlock {
            height,
            hash: block.header.block_hash,
            timestamp: block.header.timestamp,
            txs,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn normalizes_coin_strings_to_droplets() {
        let body = serde_json::json!({
            "blocks": [{
                "header": {
                    "seq": 42,
                    "block_hash": "hash-42",
                    "timestamp": 1_600_000_042,
                },
                "body": {
                    "txns": [{
                        "txid": "sky-tx",
                        "outputs": [
                            {"dst": "addr-a", "coins": "12.5", "hours": 7},
                            {"dst": "addr-b", "coins": "0.000001", "hours": 0},
                        ],
                    }],
                },
            }],
        });

        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/api/v1/blocks")
            .match_query(mockito::Matcher::UrlEncoded("start".into(), "42".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await;

        let client =
            SkyRpcClient::new(&server.url(), std::time::Duration::from_secs(1)).unwrap();
        let block = client.get_block_at(42).await.unwrap().unwrap();

        assert_eq!(block.hash, "hash-42");
        let outputs = &block.txs[0].outputs;
        assert_eq!(outputs[0].amount, 12_500_000);
        assert_eq!(outputs[1].amount, 1);
        assert_eq!(outputs[1].index, 1);
    }

    #[tokio::test]
    async fn an_absent_block_is_not_ready() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/api/v1/blocks")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"blocks": []}"#)
            .create_async()
            .await;

        let client =
            SkyRpcClient::new(&server.url(), std::time::Duration::from_secs(1)).unwrap();
        assert_eq!(client.get_block_at(99).await.unwrap(), None);
    }
}
