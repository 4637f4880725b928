//! Test doubles and dummy values shared by the unit tests: a scripted
//! chain for scanner runs, a channel-backed scanner for wiring tests and
//! a programmable hot wallet.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use tokio::sync::mpsc;

use crate::error::Error;
use crate::scanner::ChainBlock;
use crate::scanner::ChainInteract;
use crate::scanner::DepositNote;
use crate::scanner::Scanner;
use crate::sender::PendingTx;
use crate::sender::TxConfirmation;
use crate::sender::WalletBalance;
use crate::sender::WalletInteract;
use crate::storage::model::CoinType;
use crate::storage::model::DepositEvent;

/// The deposit address every dummy deposit pays to.
pub const TEST_DEPOSIT_ADDRESS: &str = "dep-addr";

/// A deposit event paying [`TEST_DEPOSIT_ADDRESS`].
pub fn dummy_deposit(coin_type: CoinType, tx_id: &str) -> DepositEvent {
    DepositEvent {
        coin_type,
        tx_id: tx_id.to_string(),
        out_index: 0,
        address: TEST_DEPOSIT_ADDRESS.to_string(),
        amount: 100_000,
        block_height: 1,
        block_hash: "hash-1".to_string(),
        timestamp: 1_600_000_000,
    }
}

/// A random, syntactically valid MDL address.
pub fn mdl_address<R: rand::RngCore + ?Sized>(config: &fake::Faker, rng: &mut R) -> String {
    use fake::Fake as _;

    let digest: [u8; 20] = config.fake_with_rng(rng);
    mdl::address::encode(&digest)
}

/// A chain whose blocks and tip the test scripts up front.
#[derive(Debug, Clone)]
pub struct ScriptedChain {
    inner: Arc<ScriptedChainInner>,
}

#[derive(Debug)]
struct ScriptedChainInner {
    coin_type: CoinType,
    tip: AtomicU64,
    blocks: Mutex<HashMap<u64, ChainBlock>>,
}

impl ScriptedChain {
    /// An empty chain for `coin_type` with the tip at zero.
    pub fn new(coin_type: CoinType) -> Self {
        Self {
            inner: Arc::new(ScriptedChainInner {
                coin_type,
                tip: AtomicU64::new(0),
                blocks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Install a block at its height.
    pub fn push_block(&self, block: ChainBlock) {
        lock(&self.inner.blocks).insert(block.height, block);
    }

    /// Move the chain tip.
    pub fn set_tip(&self, height: u64) {
        self.inner.tip.store(height, Ordering::SeqCst);
    }
}

impl ChainInteract for ScriptedChain {
    fn coin_type(&self) -> CoinType {
        self.inner.coin_type
    }

    async fn get_block_count(&self) -> Result<u64, Error> {
        Ok(self.inner.tip.load(Ordering::SeqCst))
    }

    async fn get_block_at(&self, height: u64) -> Result<Option<ChainBlock>, Error> {
        Ok(lock(&self.inner.blocks).get(&height).cloned())
    }
}

/// A [`Scanner`] whose deposit stream the test feeds directly.
pub struct ChannelScanner {
    deposits: Mutex<Option<mpsc::Receiver<DepositNote>>>,
    addresses: Mutex<Vec<String>>,
}

/// A channel-backed scanner plus the sending half of its stream.
pub fn channel_scanner() -> (ChannelScanner, mpsc::Sender<DepositNote>) {
    let (tx, rx) = mpsc::channel(8);
    let scanner = ChannelScanner {
        deposits: Mutex::new(Some(rx)),
        addresses: Mutex::new(Vec::new()),
    };
    (scanner, tx)
}

impl Scanner for ChannelScanner {
    fn take_deposits(&self) -> Option<mpsc::Receiver<DepositNote>> {
        lock(&self.deposits).take()
    }

    fn add_scan_address(&self, address: &str) -> Result<(), Error> {
        let mut addresses = lock(&self.addresses);
        if !addresses.iter().any(|known| known == address) {
            addresses.push(address.to_string());
        }
        Ok(())
    }

    fn get_scan_addresses(&self) -> Result<Vec<String>, Error> {
        Ok(lock(&self.addresses).clone())
    }

    fn shutdown(&self) {}
}

/// A hot wallet with scripted outcomes. Queued results are consumed
/// first; once the queues run dry, sends mint fresh txids and
/// confirmation polls answer `Confirmed`.
#[derive(Debug, Clone)]
pub struct MockWallet {
    inner: Arc<MockWalletInner>,
}

#[derive(Debug)]
struct MockWalletInner {
    send_results: Mutex<VecDeque<Result<String, Error>>>,
    confirm_results: Mutex<VecDeque<Result<TxConfirmation, Error>>>,
    pending: Mutex<Vec<PendingTx>>,
    balance: Mutex<WalletBalance>,
    sent: Mutex<Vec<(String, u64)>>,
    send_attempts: AtomicU64,
    next_txid: AtomicU64,
}

impl MockWallet {
    /// A wallet with empty queues.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MockWalletInner {
                send_results: Mutex::new(VecDeque::new()),
                confirm_results: Mutex::new(VecDeque::new()),
                pending: Mutex::new(Vec::new()),
                balance: Mutex::new(WalletBalance::default()),
                sent: Mutex::new(Vec::new()),
                send_attempts: AtomicU64::new(0),
                next_txid: AtomicU64::new(0),
            }),
        }
    }

    /// Queue the outcome of the next `send`.
    pub fn push_send_result(&self, result: Result<String, Error>) {
        lock(&self.inner.send_results).push_back(result);
    }

    /// Queue the outcome of the next confirmation poll.
    pub fn push_confirm_result(&self, result: Result<TxConfirmation, Error>) {
        lock(&self.inner.confirm_results).push_back(result);
    }

    /// Replace the wallet's pending transaction list.
    pub fn set_pending(&self, pending: Vec<PendingTx>) {
        *lock(&self.inner.pending) = pending;
    }

    /// Set the reported balance.
    pub fn set_balance(&self, balance: WalletBalance) {
        *lock(&self.inner.balance) = balance;
    }

    /// How many times `send` was called.
    pub fn send_attempts(&self) -> u64 {
        self.inner.send_attempts.load(Ordering::SeqCst)
    }

    /// Successfully sent payments as `(address, droplets)` pairs.
    pub fn sent(&self) -> Vec<(String, u64)> {
        lock(&self.inner.sent).clone()
    }
}

impl Default for MockWallet {
    fn default() -> Self {
        Self::new()
    }
}

impl WalletInteract for MockWallet {
    async fn send(&self, address: &str, droplets: u64) -> Result<String, Error> {
        self.inner.send_attempts.fetch_add(1, Ordering::SeqCst);

        let queued = lock(&self.inner.send_results).pop_front();
        let result = match queued {
            Some(result) => result,
            None => {
                let id = self.inner.next_txid.fetch_add(1, Ordering::SeqCst);
                Ok(format!("mock-tx-{id}"))
            }
        };

        if result.is_ok() {
            lock(&self.inner.sent).push((address.to_string(), droplets));
        }
        result
    }

    async fn is_tx_confirmed(&self, _txid: &str) -> Result<TxConfirmation, Error> {
        match lock(&self.inner.confirm_results).pop_front() {
            Some(result) => result,
            None => Ok(TxConfirmation::Confirmed),
        }
    }

    async fn pending_transactions(&self) -> Result<Vec<PendingTx>, Error> {
        Ok(lock(&self.inner.pending).clone())
    }

    async fn get_balance(&self) -> Result<WalletBalance, Error> {
        Ok(*lock(&self.inner.balance))
    }
}

/// Lock a mutex, surviving poisoning.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
