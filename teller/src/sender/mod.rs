//! # MDL sender
//!
//! The only component allowed to move coins out of the hot wallet. The
//! raw node surface is [`WalletInteract`]; [`WalletRpcClient`] implements
//! it against the MDL node REST API, and [`RetrySender`] adds the retry
//! policy: transient faults back off exponentially up to a ceiling, node
//! rejections surface immediately and finalize the deposit being paid.
//!
//! To keep payouts at-most-once across crashes, a send first asks the
//! wallet for its pending transactions and adopts the txid of an existing
//! pending payment of the same address and amount instead of submitting a
//! second one.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use url::Url;

use crate::context::ShutdownSignal;
use crate::error::Error;

/// Outcome of a confirmation poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxConfirmation {
    /// The transaction is confirmed on the MDL chain.
    Confirmed,
    /// The node knows the transaction but it has not confirmed yet.
    NotYet,
    /// The node does not know the transaction.
    Unknown,
}

/// A transaction sitting in the wallet's mempool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTx {
    /// Transaction id.
    pub txid: String,
    /// Receiving address of the first output.
    pub address: String,
    /// Droplets paid to that address.
    pub droplets: u64,
}

/// Hot wallet balance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletBalance {
    /// Spendable droplets.
    pub coins: u64,
    /// Coin hours.
    pub hours: u64,
}

/// The wallet RPC surface the exchange engine relies on.
pub trait WalletInteract {
    /// Pay `droplets` to `address`; resolves to the submitted txid.
    fn send(
        &self,
        address: &str,
        droplets: u64,
    ) -> impl Future<Output = Result<String, Error>> + Send;

    /// Poll the node for the confirmation state of `txid`.
    fn is_tx_confirmed(
        &self,
        txid: &str,
    ) -> impl Future<Output = Result<TxConfirmation, Error>> + Send;

    /// Transactions submitted by the wallet that have not confirmed.
    fn pending_transactions(&self) -> impl Future<Output = Result<Vec<PendingTx>, Error>> + Send;

    /// Spendable balance of the hot wallet.
    fn get_balance(&self) -> impl Future<Output = Result<WalletBalance, Error>> + Send;
}

/// Client for the MDL node wallet API.
#[derive(Debug, Clone)]
pub struct WalletRpcClient {
    http: reqwest::Client,
    base: Url,
    wallet_id: String,
}

#[derive(Debug, Serialize)]
struct CreateTransactionRequest<'a> {
    hours_selection: HoursSelection,
    wallet_id: &'a str,
    to: Vec<Receiver<'a>>,
}

#[derive(Debug, Serialize)]
struct HoursSelection {
    #[serde(rename = "type")]
    selection_type: &'static str,
    mode: &'static str,
    share_factor: &'static str,
}

#[derive(Debug, Serialize)]
struct Receiver<'a> {
    address: &'a str,
    coins: String,
}

#[derive(Debug, Deserialize)]
struct CreateTransactionResponse {
    encoded_transaction: String,
    transaction: CreatedTransaction,
}

#[derive(Debug, Deserialize)]
struct CreatedTransaction {
    txid: String,
}

#[derive(Debug, Serialize)]
struct InjectTransactionRequest {
    rawtx: String,
}

#[derive(Debug, Deserialize)]
struct TransactionResponse {
    status: TransactionStatus,
}

#[derive(Debug, Deserialize)]
struct TransactionStatus {
    confirmed: bool,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    confirmed: WalletBalance,
}

#[derive(Debug, Deserialize)]
struct PendingTxResponse {
    transaction: PendingTransactionBody,
}

#[derive(Debug, Deserialize)]
struct PendingTransactionBody {
    txid: String,
    outputs: Vec<PendingOutput>,
}

#[derive(Debug, Deserialize)]
struct PendingOutput {
    dst: String,
    coins: String,
}

#[derive(Debug, Deserialize)]
struct NodeErrorBody {
    error: NodeErrorObject,
}

#[derive(Debug, Deserialize)]
struct NodeErrorObject {
    message: String,
}

impl WalletRpcClient {
    /// Build a client for the node at `url` spending from `wallet_id`.
    pub fn new(url: &str, wallet_id: String, timeout: Duration) -> Result<Self, Error> {
        let base = Url::parse(url).map_err(|error| Error::InvalidUrl {
            url: url.to_string(),
            error,
        })?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base,
            wallet_id,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, Error> {
        self.base.join(path).map_err(|error| Error::InvalidUrl {
            url: path.to_string(),
            error,
        })
    }

    /// Classify a non-success response: 4xx is a node rejection (fatal
    /// for the deposit being paid), anything else means the wallet is
    /// unavailable and worth retrying.
    async fn check(response: reqwest::Response) -> Result<reqwest::Response, Error> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = match response.json::<NodeErrorBody>().await {
            Ok(body) => body.error.message,
            Err(_) => status.to_string(),
        };
        if status.is_client_error() {
            Err(Error::WalletRpc(message))
        } else {
            Err(Error::WalletUnavailable(message))
        }
    }
}

impl WalletInteract for WalletRpcClient {
    async fn send(&self, address: &str, droplets: u64) -> Result<String, Error> {
        let request = CreateTransactionRequest {
            hours_selection: HoursSelection {
                selection_type: "auto",
                mode: "share",
                share_factor: "0.5",
            },
            wallet_id: &self.wallet_id,
            to: vec![Receiver {
                address,
                coins: mdl::amount::coin_string_from_droplets(droplets),
            }],
        };

        let url = self.endpoint("/api/v1/wallet/transaction")?;
        let response = self.http.post(url).json(&request).send().await?;
        let created: CreateTransactionResponse = Self::check(response).await?.json().await?;

        let url = self.endpoint("/api/v1/injectTransaction")?;
        let request = InjectTransactionRequest {
            rawtx: created.encoded_transaction,
        };
        let response = self.http.post(url).json(&request).send().await?;
        Self::check(response).await?;

        Ok(created.transaction.txid)
    }

    async fn is_tx_confirmed(&self, txid: &str) -> Result<TxConfirmation, Error> {
        let url = self.endpoint("/api/v1/transaction")?;
        let response = self.http.get(url).query(&[("txid", txid)]).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(TxConfirmation::Unknown);
        }
        let transaction: TransactionResponse = Self::check(response).await?.json().await?;

        if transaction.status.confirmed {
            Ok(TxConfirmation::Confirmed)
        } else {
            Ok(TxConfirmation::NotYet)
        }
    }

    async fn pending_transactions(&self) -> Result<Vec<PendingTx>, Error> {
        let url = self.endpoint("/api/v1/pendingTxs")?;
        let response = self.http.get(url).send().await?;
        let pending: Vec<PendingTxResponse> = Self::check(response).await?.json().await?;

        let mut transactions = Vec::new();
        for entry in pending {
            let PendingTransactionBody { txid, outputs } = entry.transaction;
            let Some(output) = outputs.first() else {
                continue;
            };
            let droplets = mdl::amount::droplets_from_coin_string(&output.coins)
                .map_err(|error| Error::WalletRpc(error.to_string()))?;
            transactions.push(PendingTx {
                txid,
                address: output.dst.clone(),
                droplets,
            });
        }
        Ok(transactions)
    }

    async fn get_balance(&self) -> Result<WalletBalance, Error> {
        let url = self.endpoint("/api/v1/wallet/balance")?;
        let response = self
            .http
            .get(url)
            .query(&[("id", self.wallet_id.as_str())])
            .send()
            .await?;
        let balance: BalanceResponse = Self::check(response).await?.json().await?;
        Ok(balance.confirmed)
    }
}

/// Retry policy of the [`RetrySender`].
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// First backoff interval after a transient send failure.
    pub initial_interval: Duration,
    /// Backoff ceiling; intervals never grow past this.
    pub max_interval: Duration,
    /// Total time budget for one send before it is parked for a later
    /// pass over the deposit.
    pub max_elapsed: Duration,
    /// Pause between confirmation polls that failed transiently.
    pub confirm_retry_interval: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(10),
            max_elapsed: Duration::from_secs(60),
            confirm_retry_interval: Duration::from_secs(3),
        }
    }
}

/// A [`WalletInteract`] wrapper owning the retry policy.
#[derive(Debug, Clone)]
pub struct RetrySender<W> {
    wallet: W,
    config: SenderConfig,
    shutdown: ShutdownSignal,
}

impl<W: WalletInteract + Sync> RetrySender<W> {
    /// Wrap `wallet` with the given retry policy.
    pub fn new(wallet: W, config: SenderConfig, shutdown: ShutdownSignal) -> Self {
        Self {
            wallet,
            config,
            shutdown,
        }
    }

    fn backoff(&self) -> backoff::ExponentialBackoff {
        backoff::ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.initial_interval)
            .with_max_interval(self.config.max_interval)
            .with_max_elapsed_time(Some(self.config.max_elapsed))
            .build()
    }

    /// Pay `droplets` to `address`, retrying transient faults with
    /// bounded exponential backoff.
    ///
    /// Before every attempt the wallet's pending transactions are
    /// checked; an existing pending payment of this address and amount is
    /// adopted instead of resubmitting, so a crash between a submission
    /// and its durable record cannot double-pay.
    pub async fn send(&self, address: &str, droplets: u64) -> Result<String, Error> {
        let operation = || async {
            if self.shutdown.is_shutdown() {
                return Err(backoff::Error::permanent(Error::ShuttingDown));
            }

            match self.wallet.pending_transactions().await {
                Ok(pending) => {
                    let adopted = pending
                        .iter()
                        .find(|tx| tx.address == address && tx.droplets == droplets);
                    if let Some(tx) = adopted {
                        tracing::info!(
                            txid = %tx.txid,
                            %address,
                            droplets,
                            "adopting pending wallet transaction instead of resubmitting"
                        );
                        return Ok(tx.txid.clone());
                    }
                }
                Err(error) if error.is_transient() => {
                    return Err(backoff::Error::transient(error));
                }
                Err(error) => return Err(backoff::Error::permanent(error)),
            }

            match self.wallet.send(address, droplets).await {
                Ok(txid) => Ok(txid),
                Err(error) if error.is_transient() => {
                    tracing::warn!(%error, %address, "transient send failure, backing off");
                    Err(backoff::Error::transient(error))
                }
                Err(error) => Err(backoff::Error::permanent(error)),
            }
        };

        backoff::future::retry(self.backoff(), operation).await
    }

    /// Poll the confirmation state of `txid`, retrying transient faults
    /// until shutdown.
    pub async fn is_tx_confirmed(&self, txid: &str) -> Result<TxConfirmation, Error> {
        loop {
            if self.shutdown.is_shutdown() {
                return Err(Error::ShuttingDown);
            }

            match self.wallet.is_tx_confirmed(txid).await {
                Ok(confirmation) => return Ok(confirmation),
                Err(error) if error.is_transient() => {
                    tracing::warn!(%error, txid, "transient confirmation poll failure");
                    let mut shutdown = self.shutdown.clone();
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.confirm_retry_interval) => {}
                        _ = shutdown.wait_for_shutdown() => return Err(Error::ShuttingDown),
                    }
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::context::ShutdownHandle;
    use crate::testing::MockWallet;

    use super::*;

    fn fast_config() -> SenderConfig {
        SenderConfig {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(5),
            max_elapsed: Duration::from_millis(500),
            confirm_retry_interval: Duration::from_millis(1),
        }
    }

    fn sender(wallet: MockWallet) -> RetrySender<MockWallet> {
        RetrySender::new(wallet, fast_config(), ShutdownHandle::new().subscribe())
    }

    #[tokio::test]
    async fn transient_send_failures_are_retried() {
        let wallet = MockWallet::new();
        wallet.push_send_result(Err(Error::WalletUnavailable("down".into())));
        wallet.push_send_result(Err(Error::WalletUnavailable("still down".into())));
        wallet.push_send_result(Ok("tx-final".into()));

        let txid = sender(wallet.clone()).send("addr", 1_000_000).await.unwrap();
        assert_eq!(txid, "tx-final");
        assert_eq!(wallet.send_attempts(), 3);
    }

    #[tokio::test]
    async fn wallet_rejections_are_not_retried() {
        let wallet = MockWallet::new();
        wallet.push_send_result(Err(Error::WalletRpc("insufficient balance".into())));

        let result = sender(wallet.clone()).send("addr", 1_000_000).await;
        assert!(matches!(result, Err(Error::WalletRpc(_))));
        assert_eq!(wallet.send_attempts(), 1);
    }

    #[tokio::test]
    async fn pending_payments_are_adopted_instead_of_resubmitted() {
        let wallet = MockWallet::new();
        wallet.set_pending(vec![PendingTx {
            txid: "tx-pending".into(),
            address: "addr".into(),
            droplets: 1_000_000,
        }]);

        let txid = sender(wallet.clone()).send("addr", 1_000_000).await.unwrap();
        assert_eq!(txid, "tx-pending");
        assert_eq!(wallet.send_attempts(), 0);
    }

    #[tokio::test]
    async fn pending_payments_of_other_amounts_are_ignored() {
        let wallet = MockWallet::new();
        wallet.set_pending(vec![PendingTx {
            txid: "tx-pending".into(),
            address: "addr".into(),
            droplets: 5,
        }]);
        wallet.push_send_result(Ok("tx-new".into()));

        let txid = sender(wallet.clone()).send("addr", 1_000_000).await.unwrap();
        assert_eq!(txid, "tx-new");
        assert_eq!(wallet.send_attempts(), 1);
    }

    #[tokio::test]
    async fn confirmation_polls_retry_transient_failures() {
        let wallet = MockWallet::new();
        wallet.push_confirm_result(Err(Error::WalletUnavailable("down".into())));
        wallet.push_confirm_result(Ok(TxConfirmation::NotYet));

        let confirmation = sender(wallet).is_tx_confirmed("tx").await.unwrap();
        assert_eq!(confirmation, TxConfirmation::NotYet);
    }

    #[tokio::test]
    async fn confirmation_polls_stop_on_shutdown() {
        let wallet = MockWallet::new();
        wallet.push_confirm_result(Err(Error::WalletUnavailable("down".into())));

        let handle = ShutdownHandle::new();
        let sender = RetrySender::new(wallet, fast_config(), handle.subscribe());
        handle.signal();

        let result = sender.is_tx_confirmed("tx").await;
        assert!(matches!(result, Err(Error::ShuttingDown)));
    }

    #[tokio::test]
    async fn rpc_client_parses_node_rejections() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/api/v1/wallet/transaction")
            .with_status(400)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error": {"message": "balance is not sufficient", "code": 400}}"#)
            .create_async()
            .await;

        let client = WalletRpcClient::new(
            &server.url(),
            "hot.wlt".to_string(),
            Duration::from_secs(1),
        )
        .unwrap();

        let result = client.send("addr", 1_000_000).await;
        assert!(
            matches!(result, Err(Error::WalletRpc(message)) if message == "balance is not sufficient")
        );
    }

    #[tokio::test]
    async fn rpc_client_submits_created_transactions() {
        let mut server = mockito::Server::new_async().await;
        let _create = server
            .mock("POST", "/api/v1/wallet/transaction")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"encoded_transaction": "rawbytes", "transaction": {"txid": "tx-77"}}"#,
            )
            .create_async()
            .await;
        let inject = server
            .mock("POST", "/api/v1/injectTransaction")
            .match_body(mockito::Matcher::JsonString(
                r#"{"rawtx": "rawbytes"}"#.to_string(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#""tx-77""#)
            .create_async()
            .await;

        let client = WalletRpcClient::new(
            &server.url(),
            "hot.wlt".to_string(),
            Duration::from_secs(1),
        )
        .unwrap();

        let txid = client.send("addr", 2_500_000).await.unwrap();
        assert_eq!(txid, "tx-77");
        inject.assert_async().await;
    }

    #[tokio::test]
    async fn rpc_client_maps_confirmation_states() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/api/v1/transaction")
            .match_query(mockito::Matcher::UrlEncoded("txid".into(), "tx-1".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"status": {"confirmed": true}}"#)
            .create_async()
            .await;
        let _unknown = server
            .mock("GET", "/api/v1/transaction")
            .match_query(mockito::Matcher::UrlEncoded("txid".into(), "tx-2".into()))
            .with_status(404)
            .create_async()
            .await;

        let client = WalletRpcClient::new(
            &server.url(),
            "hot.wlt".to_string(),
            Duration::from_secs(1),
        )
        .unwrap();

        assert_eq!(
            client.is_tx_confirmed("tx-1").await.unwrap(),
            TxConfirmation::Confirmed
        );
        assert_eq!(
            client.is_tx_confirmed("tx-2").await.unwrap(),
            TxConfirmation::Unknown
        );
    }
}
