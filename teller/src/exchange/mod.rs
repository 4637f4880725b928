//! # Exchange engine
//!
//! Consumes the multiplexer's deposit stream and drives every deposit
//! record through its payout state machine:
//!
//! ```text
//! waiting_decide -> waiting_send -> waiting_confirm -> done
//!        \-> waiting_passthrough_order -^
//! ```
//!
//! Intake is idempotent: a replayed deposit event finds its existing
//! record and changes nothing, which is what makes scanner replay after a
//! crash harmless. A separate processor walks all records not yet done
//! and spawns one driving task per record; the in-memory active set
//! guarantees a record is never driven twice concurrently, while the
//! store remains the ground truth across restarts.

pub mod rate;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::context::ShutdownSignal;
use crate::error::Error;
use crate::scanner::DepositNote;
use crate::sender::RetrySender;
use crate::sender::TxConfirmation;
use crate::sender::WalletInteract;
use crate::storage::model::BuyMethod;
use crate::storage::model::CoinType;
use crate::storage::model::DepositRecord;
use crate::storage::model::DepositStatus;
use crate::storage::Store;

/// Payout parameters for one coin.
#[derive(Debug, Clone)]
pub struct CoinRate {
    /// Exchange rate string, decimal or `a/b`.
    pub rate: String,
    /// Payout precision, 0..=6 decimal places of MDL.
    pub max_decimals: u32,
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    /// Rates for the enabled coins. A deposit in a coin without a rate
    /// finalizes with an error instead of guessing.
    pub rates: HashMap<CoinType, CoinRate>,
    /// Pause between passes over the records that still need driving.
    pub processor_interval: Duration,
    /// Pause between confirmation polls of a sent payout.
    pub tx_confirmation_check_wait: Duration,
}

/// Counterparty used to fill passthrough binds: buy the deposited value
/// on an external exchange before paying out.
pub trait PassthroughInteract {
    /// Place (or re-attach to) the buy order covering `deposit` and
    /// resolve to the droplets bought. Must be idempotent per deposit:
    /// calling it again for the same record returns the same fill instead
    /// of ordering twice.
    fn place_order(
        &self,
        deposit: &DepositRecord,
    ) -> impl Future<Output = Result<u64, Error>> + Send;
}

impl PassthroughInteract for () {
    async fn place_order(&self, _deposit: &DepositRecord) -> Result<u64, Error> {
        Err(Error::PassthroughUnavailable)
    }
}

/// The deposit state machine driver.
pub struct ExchangeEngine<W, P = ()> {
    processor: DepositProcessor<W, P>,
    deposits: Mutex<Option<mpsc::Receiver<DepositNote>>>,
    active: Arc<Mutex<std::collections::HashSet<String>>>,
    unmatched: AtomicU64,
    shutdown: ShutdownSignal,
    started: AtomicBool,
}

impl<W> ExchangeEngine<W, ()>
where
    W: WalletInteract + Clone + Send + Sync + 'static,
{
    /// Build an engine with no passthrough counterparty.
    pub fn new(
        store: Store,
        sender: RetrySender<W>,
        config: ExchangeConfig,
        deposits: mpsc::Receiver<DepositNote>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            processor: DepositProcessor {
                store,
                sender,
                config,
                passthrough: None,
                last_error: Arc::new(Mutex::new(None)),
                shutdown: shutdown.clone(),
            },
            deposits: Mutex::new(Some(deposits)),
            active: Arc::new(Mutex::new(std::collections::HashSet::new())),
            unmatched: AtomicU64::new(0),
            shutdown,
            started: AtomicBool::new(false),
        }
    }
}

impl<W, P> ExchangeEngine<W, P>
where
    W: WalletInteract + Clone + Send + Sync + 'static,
    P: PassthroughInteract + Clone + Send + Sync + 'static,
{
    /// Attach a passthrough counterparty.
    pub fn with_passthrough<P2>(self, passthrough: P2) -> ExchangeEngine<W, P2>
    where
        P2: PassthroughInteract + Clone + Send + Sync + 'static,
    {
        ExchangeEngine {
            processor: DepositProcessor {
                store: self.processor.store,
                sender: self.processor.sender,
                config: self.processor.config,
                passthrough: Some(passthrough),
                last_error: self.processor.last_error,
                shutdown: self.processor.shutdown,
            },
            deposits: self.deposits,
            active: self.active,
            unmatched: self.unmatched,
            shutdown: self.shutdown,
            started: self.started,
        }
    }

    /// Shared handle to the most recent fatal sender error, surfaced by
    /// the exchange-status endpoint.
    pub fn last_error_handle(&self) -> Arc<Mutex<Option<String>>> {
        Arc::clone(&self.processor.last_error)
    }

    /// Deposits dropped because no bind owned their address.
    pub fn unmatched_deposits(&self) -> u64 {
        self.unmatched.load(Ordering::Relaxed)
    }

    /// Run intake and the record processor until shutdown. May only be
    /// called once.
    pub async fn run(&self) -> Result<(), Error> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning("exchange engine"));
        }
        let deposits = lock(&self.deposits)
            .take()
            .ok_or(Error::DepositStreamTaken("exchange engine"))?;

        tracing::info!("starting exchange engine");
        tokio::try_join!(self.intake(deposits), self.process_loop())?;
        tracing::info!("exchange engine stopped");
        Ok(())
    }

    /// Receive deposit notes, record them durably and ack.
    async fn intake(&self, mut deposits: mpsc::Receiver<DepositNote>) -> Result<(), Error> {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                note = deposits.recv() => {
                    let Some(note) = note else { break };
                    self.record_deposit(note)?;
                }
                _ = shutdown.wait_for_shutdown() => break,
            }
        }
        tracing::debug!("exchange intake stopped");
        Ok(())
    }

    fn record_deposit(&self, note: DepositNote) -> Result<(), Error> {
        match self.processor.store.get_or_create_deposit(&note.deposit)? {
            Some((record, true)) => {
                tracing::info!(
                    deposit = %record.id(),
                    mdl_address = %record.mdl_address,
                    amount = %record.amount_native,
                    "recorded deposit"
                );
            }
            Some((record, false)) => {
                tracing::debug!(deposit = %record.id(), "deposit already recorded");
            }
            None => {
                let unmatched = self.unmatched.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    deposit = %note.deposit.id(),
                    address = %note.deposit.address,
                    unmatched,
                    "deposit does not match any bind, dropping"
                );
            }
        }

        // Ack after the durable write (or the unmatched verdict) so the
        // scanner can retire its journal entry.
        note.ack();
        Ok(())
    }

    /// Periodically sweep all records not done and spawn one driver per
    /// record that is not already being driven.
    async fn process_loop(&self) -> Result<(), Error> {
        let mut shutdown = self.shutdown.clone();
        let mut drivers: JoinSet<()> = JoinSet::new();

        loop {
            while drivers.try_join_next().is_some() {}

            for record in self.processor.store.deposits_not_done()? {
                self.spawn_driver(&mut drivers, record);
            }

            tokio::select! {
                _ = tokio::time::sleep(self.processor.config.processor_interval) => {}
                _ = shutdown.wait_for_shutdown() => break,
            }
        }

        // Drivers observe the shutdown signal themselves; wait for them
        // to park their records.
        while drivers.join_next().await.is_some() {}
        tracing::debug!("exchange processor stopped");
        Ok(())
    }

    fn spawn_driver(&self, drivers: &mut JoinSet<()>, record: DepositRecord) {
        let id = record.id();
        if !lock(&self.active).insert(id.clone()) {
            return;
        }

        let processor = self.processor.clone();
        let active = Arc::clone(&self.active);
        drivers.spawn(async move {
            if let Err(error) = processor.process(record).await {
                tracing::error!(%error, deposit = %id, "deposit driver failed");
            }
            lock(&active).remove(&id);
        });
    }
}

/// Outcome of one state machine step.
enum Step {
    /// The record moved to a new state; keep driving it.
    Advanced(DepositRecord),
    /// The record stays in its state for a later pass.
    Parked,
    /// The record reached `done` (or there is nothing left to do).
    Finished,
}

/// Everything a spawned driving task needs, cloneable into the task.
#[derive(Clone)]
struct DepositProcessor<W, P> {
    store: Store,
    sender: RetrySender<W>,
    config: ExchangeConfig,
    passthrough: Option<P>,
    last_error: Arc<Mutex<Option<String>>>,
    shutdown: ShutdownSignal,
}

impl<W, P> DepositProcessor<W, P>
where
    W: WalletInteract + Clone + Send + Sync + 'static,
    P: PassthroughInteract + Clone + Send + Sync + 'static,
{
    /// Drive one record forward until it finishes, parks or shutdown.
    #[tracing::instrument(skip_all, fields(deposit = %record.id(), status = %record.status))]
    async fn process(&self, mut record: DepositRecord) -> Result<(), Error> {
        loop {
            if self.shutdown.is_shutdown() {
                return Ok(());
            }

            let step = match record.status {
                DepositStatus::WaitingDecide => self.decide(record).await?,
                DepositStatus::WaitingPassthroughOrder => self.passthrough_order(record).await?,
                DepositStatus::WaitingSend => self.send(record).await?,
                DepositStatus::WaitingConfirm => self.confirm(record).await?,
                DepositStatus::Done | DepositStatus::WaitingDeposit => Step::Finished,
            };

            match step {
                Step::Advanced(next) => record = next,
                Step::Parked | Step::Finished => return Ok(()),
            }
        }
    }

    /// `waiting_decide`: snapshot the rate and validate the amount, or
    /// detour through the passthrough order for passthrough binds.
    async fn decide(&self, record: DepositRecord) -> Result<Step, Error> {
        if record.buy_method == BuyMethod::Passthrough {
            let updated = self.store.update_deposit(&record.id(), |record| {
                record.status = DepositStatus::WaitingPassthroughOrder;
            })?;
            return Ok(Step::Advanced(updated));
        }

        let droplets = match self.payout_amount(&record, None) {
            Ok(droplets) => droplets,
            Err(error) => return self.finalize_with_error(&record, &error.to_string()),
        };
        if droplets == 0 {
            return self.finalize_with_error(&record, "computed payout is zero droplets");
        }

        let rate = self.config.rates[&record.coin_type].rate.clone();
        let updated = self.store.update_deposit(&record.id(), move |record| {
            record.status = DepositStatus::WaitingSend;
            record.rate_used = rate.clone();
        })?;
        tracing::info!(droplets, rate = %updated.rate_used, "decided payout amount");
        Ok(Step::Advanced(updated))
    }

    /// `waiting_passthrough_order`: have the counterparty buy the coins,
    /// then pay out what was bought.
    async fn passthrough_order(&self, record: DepositRecord) -> Result<Step, Error> {
        let Some(passthrough) = &self.passthrough else {
            return self.finalize_with_error(&record, &Error::PassthroughUnavailable.to_string());
        };

        match passthrough.place_order(&record).await {
            Ok(droplets) => {
                let updated = self.store.update_deposit(&record.id(), move |record| {
                    record.status = DepositStatus::WaitingSend;
                    record.passthrough_droplets = Some(droplets);
                })?;
                tracing::info!(droplets, "passthrough order filled");
                Ok(Step::Advanced(updated))
            }
            Err(error) if error.is_transient() => {
                tracing::warn!(%error, "passthrough order not filled yet");
                Ok(Step::Parked)
            }
            Err(error) => self.finalize_with_error(&record, &error.to_string()),
        }
    }

    /// `waiting_send`: move the coins. The txid and the status advance
    /// are written in one transaction, which is the at-most-once hinge.
    async fn send(&self, record: DepositRecord) -> Result<Step, Error> {
        let droplets = match record.passthrough_droplets {
            Some(droplets) => droplets,
            None => match self.payout_amount(&record, Some(&record.rate_used)) {
                Ok(droplets) => droplets,
                Err(error) => return self.finalize_with_error(&record, &error.to_string()),
            },
        };

        match self.sender.send(&record.mdl_address, droplets).await {
            Ok(txid) => {
                let updated = self.store.update_deposit(&record.id(), move |record| {
                    record.status = DepositStatus::WaitingConfirm;
                    record.mdl_tx_id = Some(txid.clone());
                    record.mdl_sent = droplets;
                })?;
                tracing::info!(
                    txid = updated.mdl_tx_id.as_deref().unwrap_or_default(),
                    droplets,
                    "sent MDL payout"
                );
                Ok(Step::Advanced(updated))
            }
            Err(Error::ShuttingDown) => Ok(Step::Parked),
            Err(error) if error.is_transient() => {
                tracing::warn!(%error, "send exhausted its backoff budget, parking");
                Ok(Step::Parked)
            }
            Err(error) => {
                *lock(&self.last_error) = Some(error.to_string());
                self.finalize_with_error(&record, &error.to_string())
            }
        }
    }

    /// `waiting_confirm`: poll until the payout transaction confirms.
    async fn confirm(&self, record: DepositRecord) -> Result<Step, Error> {
        let Some(txid) = record.mdl_tx_id.clone() else {
            // Cannot happen while the status invariant holds; refuse to
            // guess rather than resend.
            return self.finalize_with_error(&record, "waiting_confirm without a txid");
        };

        loop {
            match self.sender.is_tx_confirmed(&txid).await {
                Ok(TxConfirmation::Confirmed) => {
                    self.store.update_deposit(&record.id(), |record| {
                        record.status = DepositStatus::Done;
                    })?;
                    tracing::info!(%txid, "payout confirmed");
                    return Ok(Step::Finished);
                }
                Ok(TxConfirmation::NotYet) | Ok(TxConfirmation::Unknown) => {
                    let mut shutdown = self.shutdown.clone();
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.tx_confirmation_check_wait) => {}
                        _ = shutdown.wait_for_shutdown() => return Ok(Step::Parked),
                    }
                }
                Err(Error::ShuttingDown) => return Ok(Step::Parked),
                Err(error) => {
                    tracing::warn!(%error, %txid, "confirmation poll failed, parking");
                    return Ok(Step::Parked);
                }
            }
        }
    }

    /// The droplets owed for `record`. `snapshot` uses the rate string
    /// frozen at decide time; `None` reads the configured rate.
    fn payout_amount(&self, record: &DepositRecord, snapshot: Option<&str>) -> Result<u64, Error> {
        let coin_rate = self
            .config
            .rates
            .get(&record.coin_type)
            .ok_or_else(|| Error::InvalidRate(format!("no rate for {}", record.coin_type)))?;
        let rate = rate::parse_rate(snapshot.unwrap_or(&coin_rate.rate))?;
        rate::calculate_mdl_droplets(
            record.amount_native,
            record.coin_type,
            &rate,
            coin_rate.max_decimals,
        )
    }

    /// Finalize the record without a payout, recording the cause.
    fn finalize_with_error(&self, record: &DepositRecord, message: &str) -> Result<Step, Error> {
        let cause = message.to_string();
        let updated = self.store.update_deposit(&record.id(), move |record| {
            record.status = DepositStatus::Done;
            record.error = Some(cause.clone());
        })?;
        tracing::warn!(
            deposit = %updated.id(),
            error = message,
            "deposit finalized without payout"
        );
        Ok(Step::Finished)
    }
}

/// Lock a mutex, surviving poisoning.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use crate::context::ShutdownHandle;
    use crate::scanner::DepositNote;
    use crate::sender::SenderConfig;
    use crate::storage::model::DepositEvent;
    use crate::testing::dummy_deposit;
    use crate::testing::MockWallet;

    use super::*;

    struct Harness {
        store: Store,
        wallet: MockWallet,
        notes: mpsc::Sender<DepositNote>,
        shutdown: ShutdownHandle,
        runner: tokio::task::JoinHandle<Result<(), Error>>,
        last_error: Arc<Mutex<Option<String>>>,
        engine: Arc<ExchangeEngine<MockWallet>>,
    }

    fn exchange_config() -> ExchangeConfig {
        let mut rates = HashMap::new();
        rates.insert(
            CoinType::Btc,
            CoinRate {
                rate: "500".to_string(),
                max_decimals: 0,
            },
        );
        ExchangeConfig {
            rates,
            processor_interval: Duration::from_millis(10),
            tx_confirmation_check_wait: Duration::from_millis(10),
        }
    }

    fn sender_config() -> SenderConfig {
        SenderConfig {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(5),
            max_elapsed: Duration::from_millis(200),
            confirm_retry_interval: Duration::from_millis(1),
        }
    }

    fn start_engine(wallet: MockWallet, buy_method: BuyMethod) -> Harness {
        let store = Store::open_temporary().unwrap();
        store
            .merge_pool(CoinType::Btc, &["dep-addr".to_string()])
            .unwrap();
        store
            .allocate_address(CoinType::Btc, "dep-addr", "mdl-addr", buy_method, 0)
            .unwrap();

        let shutdown = ShutdownHandle::new();
        let sender = RetrySender::new(wallet.clone(), sender_config(), shutdown.subscribe());
        let (notes, deposits) = mpsc::channel(8);
        let engine = Arc::new(ExchangeEngine::new(
            store.clone(),
            sender,
            exchange_config(),
            deposits,
            shutdown.subscribe(),
        ));
        let last_error = engine.last_error_handle();

        let runner = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.run().await }
        });

        Harness {
            store,
            wallet,
            notes,
            shutdown,
            runner,
            last_error,
            engine,
        }
    }

    fn btc_deposit(amount: i128) -> DepositEvent {
        DepositEvent {
            amount,
            ..dummy_deposit(CoinType::Btc, "tx-1")
        }
    }

    async fn deliver(harness: &Harness, event: DepositEvent) {
        let (note, _acked) = DepositNote::new(event);
        harness.notes.send(note).await.unwrap();
    }

    async fn await_done(store: &Store, id: &str) -> DepositRecord {
        for _ in 0..200 {
            if let Some(record) = store.get_deposit(id).unwrap() {
                if record.status == DepositStatus::Done {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("deposit {id} did not finish");
    }

    async fn stop(harness: Harness) {
        harness.shutdown.signal();
        drop(harness.notes);
        harness.runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn pays_out_a_confirmed_deposit() {
        let harness = start_engine(MockWallet::new(), BuyMethod::Direct);

        // 0.002 BTC at 500 MDL/BTC pays 1 MDL.
        let event = btc_deposit(200_000);
        deliver(&harness, event.clone()).await;

        let record = await_done(&harness.store, &event.id()).await;
        assert_eq!(record.mdl_sent, 1_000_000);
        assert_eq!(record.rate_used, "500");
        assert!(record.mdl_tx_id.is_some());
        assert!(record.error.is_none());

        stop(harness).await;
    }

    /// Scanner replay delivers the same event twice; only one record may
    /// exist and the payout must not repeat.
    #[tokio::test]
    async fn replayed_deposits_do_not_double_pay() {
        let harness = start_engine(MockWallet::new(), BuyMethod::Direct);

        let event = btc_deposit(200_000);
        deliver(&harness, event.clone()).await;
        let record = await_done(&harness.store, &event.id()).await;

        deliver(&harness, event.clone()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let replayed = harness.store.get_deposit(&event.id()).unwrap().unwrap();
        assert_eq!(replayed.seq, record.seq);
        assert_eq!(replayed.mdl_sent, 1_000_000);
        assert_eq!(harness.wallet.send_attempts(), 1);

        stop(harness).await;
    }

    #[tokio::test]
    async fn transient_send_failures_eventually_pay_out() {
        let wallet = MockWallet::new();
        wallet.push_send_result(Err(Error::WalletUnavailable("down".into())));
        wallet.push_send_result(Err(Error::WalletUnavailable("down".into())));
        let harness = start_engine(wallet, BuyMethod::Direct);

        let event = btc_deposit(200_000);
        deliver(&harness, event.clone()).await;

        let record = await_done(&harness.store, &event.id()).await;
        assert!(record.error.is_none());
        assert_eq!(record.mdl_sent, 1_000_000);
        assert!(harness.wallet.send_attempts() >= 3);

        stop(harness).await;
    }

    #[tokio::test]
    async fn wallet_rejections_finalize_without_payout() {
        let wallet = MockWallet::new();
        wallet.push_send_result(Err(Error::WalletRpc("insufficient balance".into())));
        let harness = start_engine(wallet, BuyMethod::Direct);

        let event = btc_deposit(200_000);
        deliver(&harness, event.clone()).await;

        let record = await_done(&harness.store, &event.id()).await;
        assert_eq!(record.mdl_sent, 0);
        assert!(record.mdl_tx_id.is_none());
        assert!(record.error.as_deref().unwrap_or_default().contains("insufficient balance"));
        assert!(lock(&harness.last_error).as_deref().unwrap_or_default().contains("insufficient balance"));

        stop(harness).await;
    }

    #[tokio::test]
    async fn negative_amounts_finalize_with_an_error() {
        let harness = start_engine(MockWallet::new(), BuyMethod::Direct);

        let event = btc_deposit(-5);
        deliver(&harness, event.clone()).await;

        let record = await_done(&harness.store, &event.id()).await;
        assert_eq!(record.mdl_sent, 0);
        assert!(record.error.is_some());
        assert_eq!(harness.wallet.send_attempts(), 0);

        stop(harness).await;
    }

    #[tokio::test]
    async fn unmatched_deposits_are_counted_and_dropped() {
        let harness = start_engine(MockWallet::new(), BuyMethod::Direct);

        let mut event = btc_deposit(200_000);
        event.address = "never-bound".to_string();
        deliver(&harness, event.clone()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(harness.store.get_deposit(&event.id()).unwrap().is_none());
        assert_eq!(harness.engine.unmatched_deposits(), 1);

        stop(harness).await;
    }

    #[tokio::test]
    async fn passthrough_without_counterparty_finalizes_with_an_error() {
        let harness = start_engine(MockWallet::new(), BuyMethod::Passthrough);

        let event = btc_deposit(200_000);
        deliver(&harness, event.clone()).await;

        let record = await_done(&harness.store, &event.id()).await;
        assert_eq!(record.mdl_sent, 0);
        assert!(record
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("passthrough"));

        stop(harness).await;
    }

    #[derive(Clone)]
    struct FixedFill(u64);

    impl PassthroughInteract for FixedFill {
        async fn place_order(&self, _deposit: &DepositRecord) -> Result<u64, Error> {
            Ok(self.0)
        }
    }

    #[tokio::test]
    async fn passthrough_fills_pay_out_the_bought_amount() {
        let store = Store::open_temporary().unwrap();
        store
            .merge_pool(CoinType::Btc, &["dep-addr".to_string()])
            .unwrap();
        store
            .allocate_address(
                CoinType::Btc,
                "dep-addr",
                "mdl-addr",
                BuyMethod::Passthrough,
                0,
            )
            .unwrap();

        let wallet = MockWallet::new();
        let shutdown = ShutdownHandle::new();
        let sender = RetrySender::new(wallet.clone(), sender_config(), shutdown.subscribe());
        let (notes, deposits) = mpsc::channel(8);
        let engine = ExchangeEngine::new(
            store.clone(),
            sender,
            exchange_config(),
            deposits,
            shutdown.subscribe(),
        )
        .with_passthrough(FixedFill(42_000_000));
        let engine = Arc::new(engine);

        let runner = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.run().await }
        });

        let event = btc_deposit(200_000);
        let (note, _acked) = DepositNote::new(event.clone());
        notes.send(note).await.unwrap();

        let record = await_done(&store, &event.id()).await;
        assert_eq!(record.passthrough_droplets, Some(42_000_000));
        assert_eq!(record.mdl_sent, 42_000_000);
        assert!(record.error.is_none());

        shutdown.signal();
        drop(notes);
        runner.await.unwrap().unwrap();
    }
}
