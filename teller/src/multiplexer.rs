//! # Deposit multiplexer
//!
//! Fans the per-coin scanner streams into the single stream the exchange
//! engine consumes. One drain task per scanner forwards notes in arrival
//! order, so each coin's deposits stay FIFO; across coins the merge is
//! arbitrary. The outbound stream closes once every inbound stream has
//! drained or shutdown cancelled the drains.

use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::sync::PoisonError;

use tokio::sync::mpsc;

use crate::context::ShutdownHandle;
use crate::error::Error;
use crate::scanner::DepositNote;
use crate::scanner::Scanner;
use crate::storage::model::CoinType;

/// Fan-in of scanner deposit streams.
pub struct Multiplexer {
    registered: Mutex<HashSet<CoinType>>,
    sources: Mutex<Vec<(CoinType, mpsc::Receiver<DepositNote>)>>,
    deposits_tx: Mutex<Option<mpsc::Sender<DepositNote>>>,
    deposits_rx: Mutex<Option<mpsc::Receiver<DepositNote>>>,
    shutdown: ShutdownHandle,
    started: AtomicBool,
}

impl Multiplexer {
    /// A multiplexer with no scanners registered yet.
    pub fn new() -> Self {
        let (deposits_tx, deposits_rx) = mpsc::channel(1);
        Self {
            registered: Mutex::new(HashSet::new()),
            sources: Mutex::new(Vec::new()),
            deposits_tx: Mutex::new(Some(deposits_tx)),
            deposits_rx: Mutex::new(Some(deposits_rx)),
            shutdown: ShutdownHandle::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Register a scanner's deposit stream under its coin type.
    pub fn add_scanner(&self, scanner: &dyn Scanner, coin_type: CoinType) -> Result<(), Error> {
        let mut registered = lock(&self.registered);
        if !registered.insert(coin_type) {
            return Err(Error::ScannerAlreadyRegistered(coin_type));
        }

        let deposits = scanner
            .take_deposits()
            .ok_or(Error::DepositStreamTaken("scanner"))?;
        lock(&self.sources).push((coin_type, deposits));
        Ok(())
    }

    /// Take the merged outbound stream. Returns `None` on the second call.
    pub fn take_deposits(&self) -> Option<mpsc::Receiver<DepositNote>> {
        lock(&self.deposits_rx).take()
    }

    /// Request the drain tasks to stop. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.signal();
    }

    /// Drain every registered scanner into the outbound stream. Returns
    /// once all sources have closed or shutdown was requested. May only
    /// be called once.
    pub async fn run(&self) -> Result<(), Error> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning("multiplexer"));
        }

        let sources = std::mem::take(&mut *lock(&self.sources));
        let deposits_tx = lock(&self.deposits_tx)
            .take()
            .ok_or(Error::AlreadyRunning("multiplexer"))?;

        let mut drains = Vec::with_capacity(sources.len());
        for (coin_type, mut deposits) in sources {
            let out = deposits_tx.clone();
            let mut shutdown = self.shutdown.subscribe();

            drains.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        note = deposits.recv() => {
                            let Some(note) = note else { break };
                            if out.send(note).await.is_err() {
                                break;
                            }
                        }
                        _ = shutdown.wait_for_shutdown() => break,
                    }
                }
                tracing::debug!(%coin_type, "deposit drain stopped");
            }));
        }

        // Dropping the last sender closes the outbound stream, which is
        // how the exchange learns that no more deposits are coming.
        drop(deposits_tx);

        for drained in futures::future::join_all(drains).await {
            drained?;
        }
        tracing::info!("deposit multiplexer stopped");
        Ok(())
    }
}

impl Default for Multiplexer {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock a mutex, surviving poisoning; none of the guarded state can be
/// left inconsistent by a panic.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::testing::channel_scanner;

    use super::*;

    #[tokio::test]
    async fn merges_sources_and_preserves_per_coin_order() {
        let mux = Arc::new(Multiplexer::new());

        let (btc_scanner, btc_tx) = channel_scanner();
        let (sky_scanner, sky_tx) = channel_scanner();
        mux.add_scanner(&btc_scanner, CoinType::Btc).unwrap();
        mux.add_scanner(&sky_scanner, CoinType::Sky).unwrap();

        let mut merged = mux.take_deposits().unwrap();
        let runner = tokio::spawn({
            let mux = Arc::clone(&mux);
            async move { mux.run().await }
        });

        for seq in 0..3 {
            let (note, _acked) = DepositNote::new(crate::testing::dummy_deposit(
                CoinType::Btc,
                &format!("btc-{seq}"),
            ));
            btc_tx.send(note).await.unwrap();
        }
        let (note, _acked) =
            DepositNote::new(crate::testing::dummy_deposit(CoinType::Sky, "sky-0"));
        sky_tx.send(note).await.unwrap();

        let mut btc_seen = Vec::new();
        let mut sky_seen = Vec::new();
        for _ in 0..4 {
            let note = tokio::time::timeout(Duration::from_secs(2), merged.recv())
                .await
                .expect("note arrives")
                .expect("stream open");
            match note.deposit.coin_type {
                CoinType::Btc => btc_seen.push(note.deposit.tx_id.clone()),
                _ => sky_seen.push(note.deposit.tx_id.clone()),
            }
        }

        assert_eq!(btc_seen, vec!["btc-0", "btc-1", "btc-2"]);
        assert_eq!(sky_seen, vec!["sky-0"]);

        // Closing every source closes the merged stream.
        drop(btc_tx);
        drop(sky_tx);
        assert!(
            tokio::time::timeout(Duration::from_secs(2), merged.recv())
                .await
                .expect("stream closes")
                .is_none()
        );
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn rejects_duplicate_coin_types() {
        let mux = Multiplexer::new();
        let (scanner_a, _tx_a) = channel_scanner();
        let (scanner_b, _tx_b) = channel_scanner();

        mux.add_scanner(&scanner_a, CoinType::Btc).unwrap();
        let result = mux.add_scanner(&scanner_b, CoinType::Btc);
        assert!(matches!(
            result,
            Err(Error::ScannerAlreadyRegistered(CoinType::Btc))
        ));
    }

    #[tokio::test]
    async fn shutdown_closes_the_outbound_stream() {
        let mux = Arc::new(Multiplexer::new());
        let (scanner, _tx) = channel_scanner();
        mux.add_scanner(&scanner, CoinType::Btc).unwrap();

        let mut merged = mux.take_deposits().unwrap();
        let runner = tokio::spawn({
            let mux = Arc::clone(&mux);
            async move { mux.run().await }
        });

        mux.shutdown();
        runner.await.unwrap().unwrap();
        assert!(
            tokio::time::timeout(Duration::from_secs(2), merged.recv())
                .await
                .expect("stream closes")
                .is_none()
        );
    }
}
