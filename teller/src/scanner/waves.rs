//! WAVES chain client over the Waves node REST API.
//!
//! Serves both the native WAVES scanner and the WAVES-MDL asset scanner:
//! the only difference is which `assetId` a transfer must carry to count.
//! Amounts are in 10^-8 units either way. Transfers to aliases are
//! skipped; pool addresses are always plain addresses.

use serde::Deserialize;
use url::Url;

use crate::error::Error;
use crate::scanner::ChainBlock;
use crate::scanner::ChainInteract;
use crate::scanner::ChainOutput;
use crate::scanner::ChainTx;
use crate::storage::model::CoinType;

/// Waves transaction type tag for transfers.
const TRANSFER_TX_TYPE: u32 = 4;

/// Client for a Waves node, parameterized by the asset it watches.
#[derive(Debug, Clone)]
pub struct WavesRpcClient {
    http: reqwest::Client,
    base: Url,
    coin_type: CoinType,
    /// `None` watches native WAVES transfers; `Some` an asset.
    asset_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HeightResponse {
    height: u64,
}

#[derive(Debug, Deserialize)]
struct WavesBlock {
    id: String,
    /// Milliseconds since the epoch.
    timestamp: i64,
    #[serde(default)]
    transactions: Vec<WavesTransaction>,
}

#[derive(Debug, Deserialize)]
struct WavesTransaction {
    #[serde(rename = "type")]
    tx_type: u32,
    id: String,
    #[serde(default)]
    recipient: Option<String>,
    #[serde(default)]
    amount: Option<u64>,
    #[serde(rename = "assetId", default)]
    asset_id: Option<String>,
}

impl WavesRpcClient {
    /// Build a client watching native WAVES transfers.
    pub fn new(url: &str, timeout: std::time::Duration) -> Result<Self, Error> {
        Self::build(url, timeout, CoinType::Waves, None)
    }

    /// Build a client watching transfers of the MDL asset.
    pub fn new_for_asset(
        url: &str,
        timeout: std::time::Duration,
        asset_id: String,
    ) -> Result<Self, Error> {
        Self::build(url, timeout, CoinType::WavesMdl, Some(asset_id))
    }

    fn build(
        url: &str,
        timeout: std::time::Duration,
        coin_type: CoinType,
        asset_id: Option<String>,
    ) -> Result<Self, Error> {
        let base = Url::parse(url).map_err(|error| Error::InvalidUrl {
            url: url.to_string(),
            error,
        })?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base,
            coin_type,
            asset_id,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, Error> {
        self.base.join(path).map_err(|error| Error::InvalidUrl {
            url: path.to_string(),
            error,
        })
    }

    fn transfer_matches(&self, tx: &WavesTransaction) -> bool {
        tx.tx_type == TRANSFER_TX_TYPE && tx.asset_id == self.asset_id
    }
}

impl ChainInteract for WavesRpcClient {
    fn coin_type(&self) -> CoinType {
        self.coin_type
    }

    async fn get_block_count(&self) -> Result<u64, Error> {
        let url = self.endpoint("/blocks/height")?;
        let response: HeightResponse = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.height)
    }

    async fn get_block_at(&self, height: u64) -> Result<Option<ChainBlock>, Error> {
        let url = self.endpoint(&format!("/blocks/at/{height}"))?;
        let response = self.http.get(url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let block: WavesBlock = response.error_for_status()?.json().await?;

        let txs = block
            .transactions
            .iter()
            .filter(|tx| self.transfer_matches(tx))
            .filter_map(|tx| {
                let recipient = tx.recipient.as_deref()?;
                // Aliases ("alias:W:name") cannot be pool addresses.
                if recipient.starts_with("alias:") {
                    return None;
                }
                Some(ChainTx {
                    id: tx.id.clone(),
                    outputs: vec![ChainOutput {
                        index: 0,
                        address: recipient.to_string(),
                        amount: i128::from(tx.amount?),
                    }],
                })
            })
            .collect();

        Ok(Some(ChainBlock {
            height,
            hash: block.id,
            timestamp: block.timestamp / 1_000,
            txs,
        }))
    }
}
