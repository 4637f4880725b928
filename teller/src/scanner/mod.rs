//! # Block scanners
//!
//! One scanner per enabled coin walks its chain from a starting height,
//! asks the store to match each block's outputs against the active scan
//! set, and emits the matches downstream. The walking loop lives in
//! [`BaseScanner`]; everything chain-specific sits behind the
//! [`ChainInteract`] trait, implemented by one client per coin.
//!
//! A block is only examined once it is `confirmations_required` below the
//! chain tip; that gate is the only reorg safeguard. Matches are journaled
//! together with the cursor advance in one store transaction, so a crash
//! at any point replays into exactly the same set of deposits.

mod btc;
mod eth;
mod sky;
mod waves;

pub use btc::BtcRpcClient;
pub use eth::EthRpcClient;
pub use sky::SkyRpcClient;
pub use waves::WavesRpcClient;

use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::oneshot;

use crate::context::ShutdownHandle;
use crate::context::ShutdownSignal;
use crate::error::Error;
use crate::storage::model::CoinType;
use crate::storage::model::DepositEvent;
use crate::storage::Store;

/// A block normalized into the shape the store can match against,
/// whatever chain it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainBlock {
    /// Height of the block.
    pub height: u64,
    /// Chain-native block hash or signature.
    pub hash: String,
    /// Block timestamp, unix seconds.
    pub timestamp: i64,
    /// Transactions with at least a potential output of interest.
    pub txs: Vec<ChainTx>,
}

/// A transaction inside a [`ChainBlock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTx {
    /// Chain-native transaction id.
    pub id: String,
    /// Outputs paying to a concrete address.
    pub outputs: Vec<ChainOutput>,
}

/// One output of a [`ChainTx`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainOutput {
    /// Output index within the transaction. Chains without real outputs
    /// (ETH) use one pseudo-output at index zero.
    pub index: u32,
    /// Receiving address, normalized the way the pool stores it.
    pub address: String,
    /// Amount in the chain's smallest integer unit.
    pub amount: i128,
}

/// Interface to a source-chain node, one implementation per coin.
pub trait ChainInteract {
    /// The coin this client scans for.
    fn coin_type(&self) -> CoinType;

    /// Current chain tip height.
    fn get_block_count(&self) -> impl Future<Output = Result<u64, Error>> + Send;

    /// The block at `height`, normalized. `Ok(None)` means the node does
    /// not have the block yet (or answered with a tolerable "not ready");
    /// any `Err` is unrecoverable and stops the scanner.
    fn get_block_at(
        &self,
        height: u64,
    ) -> impl Future<Output = Result<Option<ChainBlock>, Error>> + Send;
}

/// A scanned deposit travelling to the exchange, paired with an ack the
/// consumer fires once the deposit is durably recorded. The scanner only
/// marks the journal entry processed after the ack; un-acked deposits are
/// re-emitted on the next start.
#[derive(Debug)]
pub struct DepositNote {
    /// The scanned deposit.
    pub deposit: DepositEvent,
    ack: oneshot::Sender<()>,
}

impl DepositNote {
    /// Pair a deposit with a fresh ack channel.
    pub fn new(deposit: DepositEvent) -> (Self, oneshot::Receiver<()>) {
        let (ack, acked) = oneshot::channel();
        (Self { deposit, ack }, acked)
    }

    /// Acknowledge the deposit as durably accepted.
    pub fn ack(self) {
        // The scanner may have shut down in the meantime; that is fine,
        // the journal entry is simply re-emitted next start.
        let _ = self.ack.send(());
    }
}

/// The scanner surface the teller and the multiplexer consume. Object
/// safe on purpose; the async walking loop stays on the concrete
/// [`BaseScanner`].
pub trait Scanner: Send + Sync {
    /// Take the outbound deposit stream. Returns `None` on the second
    /// call; there is exactly one consumer.
    fn take_deposits(&self) -> Option<mpsc::Receiver<DepositNote>>;

    /// Add an address to the active scan set. Idempotent.
    fn add_scan_address(&self, address: &str) -> Result<(), Error>;

    /// The active scan set.
    fn get_scan_addresses(&self) -> Result<Vec<String>, Error>;

    /// Request the walking loop to stop. Idempotent.
    fn shutdown(&self);
}

/// Scan parameters for one coin.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Height to start scanning from on a fresh database. A persisted
    /// cursor wins when it is further along.
    pub initial_scan_height: u64,
    /// How deep below the tip a block must be before it is processed.
    pub confirmations_required: u64,
    /// Pause between polls when the chain has nothing new.
    pub scan_period: Duration,
}

/// The shared scanner: a height-walking loop around a [`ChainInteract`]
/// client and the store.
pub struct BaseScanner<C> {
    client: C,
    store: Store,
    config: ScanConfig,
    deposits_tx: mpsc::Sender<DepositNote>,
    deposits_rx: Mutex<Option<mpsc::Receiver<DepositNote>>>,
    shutdown: ShutdownHandle,
    started: AtomicBool,
}

impl<C: ChainInteract> BaseScanner<C> {
    /// Build a scanner over `client`, reading and journaling through
    /// `store`.
    pub fn new(client: C, store: Store, config: ScanConfig) -> Self {
        // Capacity one: emitting blocks until the previous deposit has
        // been taken, which is what halts scanning when nobody drains.
        let (deposits_tx, deposits_rx) = mpsc::channel(1);
        Self {
            client,
            store,
            config,
            deposits_tx,
            deposits_rx: Mutex::new(Some(deposits_rx)),
            shutdown: ShutdownHandle::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Run the walking loop until shutdown or an unrecoverable error.
    /// May only be called once per scanner.
    pub async fn run(&self) -> Result<(), Error> {
        let coin_type = self.client.coin_type();
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning("scanner"));
        }
        let mut shutdown = self.shutdown.subscribe();

        tracing::info!(%coin_type, "starting deposit scanner");

        // Deposits journaled before a previous stop but never accepted by
        // the exchange go out first.
        for deposit in self.store.unprocessed_deposits(coin_type)? {
            if !self.emit(deposit, &mut shutdown).await? {
                return Ok(());
            }
        }

        let mut height = self
            .store
            .scan_cursor(coin_type)?
            .unwrap_or(0)
            .max(self.config.initial_scan_height);

        while !shutdown.is_shutdown() {
            let tip = self.client.get_block_count().await?;
            if height + self.config.confirmations_required > tip {
                if !self.wait(&mut shutdown).await {
                    break;
                }
                continue;
            }

            let Some(block) = self.client.get_block_at(height).await? else {
                if !self.wait(&mut shutdown).await {
                    break;
                }
                continue;
            };

            let matches = self.store.scan_block(&block, coin_type)?;
            if !matches.is_empty() {
                tracing::info!(%coin_type, height, count = matches.len(), "block has deposits");
            }
            for deposit in matches {
                if !self.emit(deposit, &mut shutdown).await? {
                    return Ok(());
                }
            }

            height += 1;
        }

        tracing::info!(%coin_type, "deposit scanner stopped");
        Ok(())
    }

    /// Emit one deposit and wait for the consumer's ack, then mark the
    /// journal entry processed. Returns `Ok(false)` when the loop should
    /// stop instead (shutdown, or the consumer went away).
    async fn emit(
        &self,
        deposit: DepositEvent,
        shutdown: &mut ShutdownSignal,
    ) -> Result<bool, Error> {
        let (note, acked) = DepositNote::new(deposit.clone());

        tokio::select! {
            sent = self.deposits_tx.send(note) => {
                if sent.is_err() {
                    return Err(Error::ChannelClosed);
                }
            }
            _ = shutdown.wait_for_shutdown() => return Ok(false),
        }

        tokio::select! {
            acked = acked => {
                if acked.is_err() {
                    // The consumer dropped the note without acking; leave
                    // the journal entry for the next start.
                    return Ok(false);
                }
                self.store.mark_deposit_processed(&deposit)?;
            }
            _ = shutdown.wait_for_shutdown() => return Ok(false),
        }

        Ok(true)
    }

    /// Sleep one scan period. Returns `false` when shutdown interrupted
    /// the sleep.
    async fn wait(&self, shutdown: &mut ShutdownSignal) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.config.scan_period) => true,
            _ = shutdown.wait_for_shutdown() => false,
        }
    }
}

impl<C: ChainInteract + Send + Sync> Scanner for BaseScanner<C> {
    fn take_deposits(&self) -> Option<mpsc::Receiver<DepositNote>> {
        self.deposits_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn add_scan_address(&self, address: &str) -> Result<(), Error> {
        self.store.add_scan_address(self.client.coin_type(), address)
    }

    fn get_scan_addresses(&self) -> Result<Vec<String>, Error> {
        self.store.scan_addresses(self.client.coin_type())
    }

    fn shutdown(&self) {
        self.shutdown.signal();
    }
}
