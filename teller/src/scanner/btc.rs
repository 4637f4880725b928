//! BTC chain client, speaking the bitcoind/btcd JSON-RPC surface.
//!
//! Amounts are satoshis. Addresses come from each output's script;
//! outputs whose script does not encode a standard address (op_return,
//! bare multisig) are skipped, they can never match the pool.

use std::sync::Arc;

use bitcoincore_rpc::RpcApi as _;

use crate::error::Error;
use crate::scanner::ChainBlock;
use crate::scanner::ChainInteract;
use crate::scanner::ChainOutput;
use crate::scanner::ChainTx;
use crate::storage::model::CoinType;

/// JSON-RPC error code bitcoind answers with when a block height is past
/// the tip.
const RPC_INVALID_PARAMETER: i32 = -8;

/// Client for a bitcoind or btcd node.
#[derive(Debug, Clone)]
pub struct BtcRpcClient {
    client: Arc<bitcoincore_rpc::Client>,
    network: bitcoin::Network,
}

impl BtcRpcClient {
    /// Connect to the node at `url` with the given credentials.
    pub fn new(
        url: &str,
        user: Option<String>,
        password: Option<String>,
        network: bitcoin::Network,
    ) -> Result<Self, Error> {
        let auth = match (user, password) {
            (Some(user), password) => {
                bitcoincore_rpc::Auth::UserPass(user, password.unwrap_or_default())
            }
            (None, _) => bitcoincore_rpc::Auth::None,
        };
        let client = bitcoincore_rpc::Client::new(url, auth)?;

        Ok(Self {
            client: Arc::new(client),
            network,
        })
    }

    /// Run a blocking RPC call off the async runtime.
    async fn blocking<T, F>(&self, call: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&bitcoincore_rpc::Client) -> Result<T, bitcoincore_rpc::Error> + Send + 'static,
    {
        let client = Arc::clone(&self.client);
        tokio::task::spawn_blocking(move || call(&client))
            .await?
            .map_err(Error::from)
    }
}

/// Whether the RPC failure just means "no block at that height yet".
fn is_out_of_range(error: &bitcoincore_rpc::Error) -> bool {
    matches!(
        error,
        bitcoincore_rpc::Error::JsonRpc(bitcoincore_rpc::jsonrpc::Error::Rpc(rpc))
            if rpc.code == RPC_INVALID_PARAMETER
    )
}

impl ChainInteract for BtcRpcClient {
    fn coin_type(&self) -> CoinType {
        CoinType::Btc
    }

    fn get_block_count(&self) -> impl std::future::Future<Output = Result<u64, Error>> + Send {
        self.blocking(|client| client.get_block_count())
    }

    async fn get_block_at(&self, height: u64) -> Result<Option<ChainBlock>, Error> {
        let hash = match self.blocking(move |client| client.get_block_hash(height)).await {
            Ok(hash) => hash,
            Err(Error::BitcoinRpc(error)) if is_out_of_range(&error) => return Ok(None),
            Err(error) => return Err(error),
        };

        let block = self.blocking(move |client| client.get_block(&hash)).await?;

        let txs = block
            .txdata
            .iter()
            .map(|tx| ChainTx {
                id: tx.compute_txid().to_string(),
                outputs: tx
                    .output
                    .iter()
                    .enumerate()
                    .filter_map(|(index, output)| {
                        let address =
                            bitcoin::Address::from_script(&output.script_pubkey, self.network)
                                .ok()?;
                        Some(ChainOutput {
                            index: index as u32,
                            address: address.to_string(),
                            amount: i128::from(output.value.to_sat()),
                        })
                    })
                    .collect(),
            })
            .collect();

        Ok(Some(ChainBlock {
            height,
            hash: hash.to_string(),
            timestamp: i64::from(block.header.time),
            txs,
        }))
    }
}
