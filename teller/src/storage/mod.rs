//! # Storage
//!
//! A single sled database holds every bucket the teller owns:
//!
//! - `deposit_addresses_<coin>`: the pre-provisioned address pool,
//! - `scan_meta_<coin>`: scan cursor, active scan addresses and the
//!   scanner's raw deposit journal,
//! - `binds`: bind records plus a per-recipient index,
//! - `deposits`: exchange-level deposit records.
//!
//! Every multi-step invariant is enforced inside one sled transaction:
//! allocating an address and writing its bind commit together, and a
//! scanned block's deposits commit together with the cursor advance.
//! Buckets are created idempotently at open; existing data is never
//! truncated.

pub mod model;

use std::collections::HashMap;
use std::path::Path;

use sled::transaction::ConflictableTransactionError;
use sled::transaction::UnabortableTransactionError;
use sled::Transactional as _;

use crate::error::Error;
use crate::scanner::ChainBlock;
use crate::storage::model::bind_key;
use crate::storage::model::now_timestamp;
use crate::storage::model::BindRecord;
use crate::storage::model::BuyMethod;
use crate::storage::model::CoinType;
use crate::storage::model::DepositAddressEntry;
use crate::storage::model::DepositEvent;
use crate::storage::model::DepositRecord;
use crate::storage::model::DepositStatus;
use crate::storage::model::RawDeposit;

/// Key prefix for active scan addresses within a `scan_meta` bucket.
const SCAN_ADDRESS_PREFIX: &str = "addr:";
/// Key prefix for journaled raw deposits within a `scan_meta` bucket.
const RAW_DEPOSIT_PREFIX: &str = "deposit:";
/// Key of the scan cursor within a `scan_meta` bucket.
const CURSOR_KEY: &str = "cursor";
/// Key prefix of the per-recipient index within the binds bucket.
const BIND_INDEX_PREFIX: &str = "index:";
/// Key prefix of bind records within the binds bucket.
const BIND_PREFIX: &str = "bind:";

/// Handle to the teller's database. Cheap to clone; all clones share the
/// same sled instance.
#[derive(Debug, Clone)]
pub struct Store {
    db: sled::Db,
    binds: sled::Tree,
    deposits: sled::Tree,
    pools: HashMap<CoinType, sled::Tree>,
    scan_meta: HashMap<CoinType, sled::Tree>,
}

impl Store {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, Error> {
        Self::from_db(sled::open(path)?)
    }

    /// Open a throwaway database for tests.
    #[cfg(any(test, feature = "testing"))]
    pub fn open_temporary() -> Result<Self, Error> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: sled::Db) -> Result<Self, Error> {
        use strum::IntoEnumIterator as _;

        let binds = db.open_tree("binds")?;
        let deposits = db.open_tree("deposits")?;

        let mut pools = HashMap::new();
        let mut scan_meta = HashMap::new();
        for coin_type in CoinType::iter() {
            let suffix = coin_type.bucket_suffix();
            pools.insert(coin_type, db.open_tree(format!("deposit_addresses_{suffix}"))?);
            scan_meta.insert(coin_type, db.open_tree(format!("scan_meta_{suffix}"))?);
        }

        Ok(Self { db, binds, deposits, pools, scan_meta })
    }

    fn pool(&self, coin_type: CoinType) -> &sled::Tree {
        &self.pools[&coin_type]
    }

    fn scan_meta(&self, coin_type: CoinType) -> &sled::Tree {
        &self.scan_meta[&coin_type]
    }

    // ---- address pools ----

    /// Insert pool addresses that are not present yet, all or none.
    /// Returns how many were new. Addresses keep their input order via a
    /// monotonic sequence, which is what allocation hands out later.
    pub fn merge_pool(&self, coin_type: CoinType, addresses: &[String]) -> Result<usize, Error> {
        let pool = self.pool(coin_type);
        let db = &self.db;

        let merged = pool.transaction(|tree| {
            let mut added = 0usize;
            for address in addresses {
                if tree.get(address.as_bytes())?.is_some() {
                    continue;
                }
                let seq = db.generate_id().map_err(abort)?;
                let entry = DepositAddressEntry {
                    seq,
                    used: false,
                    extra: serde_json::Map::new(),
                };
                tree.insert(address.as_bytes(), encode(&entry).map_err(abort)?)?;
                added += 1;
            }
            Ok(added)
        })?;

        self.db.flush()?;
        Ok(merged)
    }

    /// The unused pool address with the lowest sequence, if any.
    pub fn first_unused_address(&self, coin_type: CoinType) -> Result<Option<String>, Error> {
        let bucket = format!("deposit_addresses_{}", coin_type.bucket_suffix());
        let mut candidate: Option<(u64, String)> = None;

        for item in self.pool(coin_type).iter() {
            let (key, value) = item?;
            let entry: DepositAddressEntry = decode(&bucket, &value)?;
            if entry.used {
                continue;
            }
            let address = String::from_utf8_lossy(&key).into_owned();
            if candidate.as_ref().is_none_or(|(seq, _)| entry.seq < *seq) {
                candidate = Some((entry.seq, address));
            }
        }

        Ok(candidate.map(|(_, address)| address))
    }

    /// Every address currently in a coin's pool, with its entry.
    pub fn pool_entries(
        &self,
        coin_type: CoinType,
    ) -> Result<Vec<(String, DepositAddressEntry)>, Error> {
        let bucket = format!("deposit_addresses_{}", coin_type.bucket_suffix());
        let mut entries = Vec::new();
        for item in self.pool(coin_type).iter() {
            let (key, value) = item?;
            let entry: DepositAddressEntry = decode(&bucket, &value)?;
            entries.push((String::from_utf8_lossy(&key).into_owned(), entry));
        }
        entries.sort_by_key(|(_, entry)| entry.seq);
        Ok(entries)
    }

    /// Atomically mark `candidate` used and write the bind record.
    ///
    /// Fails with [`Error::AddressTaken`] when a concurrent allocation got
    /// the candidate first (the caller picks the next one), and with
    /// [`Error::MaxBoundExceeded`] when the recipient is at its limit.
    pub fn allocate_address(
        &self,
        coin_type: CoinType,
        candidate: &str,
        mdl_address: &str,
        buy_method: BuyMethod,
        max_bound: u32,
    ) -> Result<BindRecord, Error> {
        let index_key = format!("{BIND_INDEX_PREFIX}{mdl_address}");

        let bind = (self.pool(coin_type), &self.binds).transaction(|(pool, binds)| {
            let Some(raw) = pool.get(candidate.as_bytes())? else {
                return Err(ConflictableTransactionError::Abort(Error::AddressTaken));
            };
            let mut entry: DepositAddressEntry =
                decode("deposit_addresses", &raw).map_err(abort)?;
            if entry.used {
                return Err(ConflictableTransactionError::Abort(Error::AddressTaken));
            }

            let mut index: Vec<String> = match binds.get(index_key.as_bytes())? {
                Some(raw) => decode("binds", &raw).map_err(abort)?,
                None => Vec::new(),
            };
            if max_bound > 0 && index.len() >= max_bound as usize {
                return Err(ConflictableTransactionError::Abort(Error::MaxBoundExceeded(
                    max_bound,
                )));
            }

            entry.used = true;
            pool.insert(candidate.as_bytes(), encode(&entry).map_err(abort)?)?;

            let bind = BindRecord {
                mdl_address: mdl_address.to_string(),
                coin_type,
                deposit_address: candidate.to_string(),
                buy_method,
                created_at: now_timestamp(),
                extra: serde_json::Map::new(),
            };
            binds.insert(bind.key().as_bytes(), encode(&bind).map_err(abort)?)?;

            index.push(bind.key());
            binds.insert(index_key.as_bytes(), encode(&index).map_err(abort)?)?;

            Ok(bind)
        })?;

        self.db.flush()?;
        Ok(bind)
    }

    /// All binds held by an MDL address, oldest first.
    pub fn binds_for(&self, mdl_address: &str) -> Result<Vec<BindRecord>, Error> {
        let index_key = format!("{BIND_INDEX_PREFIX}{mdl_address}");
        let keys: Vec<String> = match self.binds.get(index_key.as_bytes())? {
            Some(raw) => decode("binds", &raw)?,
            None => return Ok(Vec::new()),
        };

        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(raw) = self.binds.get(key.as_bytes())? {
                records.push(decode("binds", &raw)?);
            }
        }
        Ok(records)
    }

    /// The bind owning a deposit address, if one exists.
    pub fn get_bind(
        &self,
        coin_type: CoinType,
        deposit_address: &str,
    ) -> Result<Option<BindRecord>, Error> {
        let key = bind_key(coin_type, deposit_address);
        self.binds
            .get(key.as_bytes())?
            .map(|raw| decode("binds", &raw))
            .transpose()
    }

    /// Every bind record in the store.
    pub fn all_binds(&self) -> Result<Vec<BindRecord>, Error> {
        let mut records = Vec::new();
        for item in self.binds.scan_prefix(BIND_PREFIX.as_bytes()) {
            let (_, raw) = item?;
            records.push(decode("binds", &raw)?);
        }
        Ok(records)
    }

    // ---- scanners ----

    /// Add an address to a coin's active scan set. Idempotent.
    pub fn add_scan_address(&self, coin_type: CoinType, address: &str) -> Result<(), Error> {
        let key = format!("{SCAN_ADDRESS_PREFIX}{address}");
        self.scan_meta(coin_type).insert(key.as_bytes(), &[1u8][..])?;
        Ok(())
    }

    /// The active scan set of a coin.
    pub fn scan_addresses(&self, coin_type: CoinType) -> Result<Vec<String>, Error> {
        let mut addresses = Vec::new();
        for item in self.scan_meta(coin_type).scan_prefix(SCAN_ADDRESS_PREFIX.as_bytes()) {
            let (key, _) = item?;
            let key = String::from_utf8_lossy(&key).into_owned();
            addresses.push(key[SCAN_ADDRESS_PREFIX.len()..].to_string());
        }
        Ok(addresses)
    }

    /// Next block height the coin's scanner should examine, if a scan has
    /// ever run.
    pub fn scan_cursor(&self, coin_type: CoinType) -> Result<Option<u64>, Error> {
        let bucket = format!("scan_meta_{}", coin_type.bucket_suffix());
        self.scan_meta(coin_type)
            .get(CURSOR_KEY.as_bytes())?
            .map(|raw| decode(&bucket, &raw))
            .transpose()
    }

    /// Join a block's outputs against the active scan set, journal the
    /// matches and advance the cursor past the block, all in one
    /// transaction. Returns the matches that were not journaled before,
    /// so replaying a block after a crash yields nothing new.
    pub fn scan_block(
        &self,
        block: &ChainBlock,
        coin_type: CoinType,
    ) -> Result<Vec<DepositEvent>, Error> {
        let bucket = format!("scan_meta_{}", coin_type.bucket_suffix());

        let events = self.scan_meta(coin_type).transaction(|tree| {
            let mut events = Vec::new();

            for tx in &block.txs {
                for output in &tx.outputs {
                    let addr_key = format!("{SCAN_ADDRESS_PREFIX}{}", output.address);
                    if tree.get(addr_key.as_bytes())?.is_none() {
                        continue;
                    }

                    let journal_key =
                        format!("{RAW_DEPOSIT_PREFIX}{}:{}", tx.id, output.index);
                    if tree.get(journal_key.as_bytes())?.is_some() {
                        continue;
                    }

                    let raw = RawDeposit {
                        deposit: DepositEvent {
                            coin_type,
                            tx_id: tx.id.clone(),
                            out_index: output.index,
                            address: output.address.clone(),
                            amount: output.amount,
                            block_height: block.height,
                            block_hash: block.hash.clone(),
                            timestamp: block.timestamp,
                        },
                        processed: false,
                    };
                    tree.insert(journal_key.as_bytes(), encode(&raw).map_err(abort)?)?;
                    events.push(raw.deposit);
                }
            }

            let cursor: u64 = match tree.get(CURSOR_KEY.as_bytes())? {
                Some(raw) => decode(&bucket, &raw).map_err(abort)?,
                None => 0,
            };
            let next = cursor.max(block.height + 1);
            tree.insert(CURSOR_KEY.as_bytes(), encode(&next).map_err(abort)?)?;

            Ok(events)
        })?;

        self.db.flush()?;
        Ok(events)
    }

    /// Journaled deposits the exchange has not acknowledged yet, in chain
    /// order.
    pub fn unprocessed_deposits(&self, coin_type: CoinType) -> Result<Vec<DepositEvent>, Error> {
        let bucket = format!("scan_meta_{}", coin_type.bucket_suffix());
        let mut deposits = Vec::new();

        for item in self.scan_meta(coin_type).scan_prefix(RAW_DEPOSIT_PREFIX.as_bytes()) {
            let (_, raw) = item?;
            let raw: RawDeposit = decode(&bucket, &raw)?;
            if !raw.processed {
                deposits.push(raw.deposit);
            }
        }

        deposits.sort_by(|a, b| {
            (a.block_height, &a.tx_id, a.out_index).cmp(&(b.block_height, &b.tx_id, b.out_index))
        });
        Ok(deposits)
    }

    /// Flip a journaled deposit to processed once the exchange accepted it.
    pub fn mark_deposit_processed(&self, deposit: &DepositEvent) -> Result<(), Error> {
        let bucket = format!("scan_meta_{}", deposit.coin_type.bucket_suffix());
        let journal_key = format!("{RAW_DEPOSIT_PREFIX}{}:{}", deposit.tx_id, deposit.out_index);

        self.scan_meta(deposit.coin_type).transaction(|tree| {
            let Some(raw) = tree.get(journal_key.as_bytes())? else {
                return Err(ConflictableTransactionError::Abort(Error::DepositNotFound(
                    deposit.id(),
                )));
            };
            let mut raw: RawDeposit = decode(&bucket, &raw).map_err(abort)?;
            raw.processed = true;
            tree.insert(journal_key.as_bytes(), encode(&raw).map_err(abort)?)?;
            Ok(())
        })?;

        self.db.flush()?;
        Ok(())
    }

    // ---- deposits ----

    /// Record a scanned deposit, idempotently.
    ///
    /// Returns `None` when no bind owns the deposit address (the event is
    /// unexpected and dropped by the caller). Otherwise returns the record
    /// and whether this call created it; replays return the existing
    /// record untouched.
    pub fn get_or_create_deposit(
        &self,
        event: &DepositEvent,
    ) -> Result<Option<(DepositRecord, bool)>, Error> {
        let key = event.id();
        let bind_key = bind_key(event.coin_type, &event.address);
        let db = &self.db;

        let outcome = (&self.deposits, &self.binds).transaction(|(deposits, binds)| {
            let Some(raw_bind) = binds.get(bind_key.as_bytes())? else {
                return Ok(None);
            };
            let bind: BindRecord = decode("binds", &raw_bind).map_err(abort)?;

            if let Some(raw) = deposits.get(key.as_bytes())? {
                let existing: DepositRecord = decode("deposits", &raw).map_err(abort)?;
                return Ok(Some((existing, false)));
            }

            let now = now_timestamp();
            let record = DepositRecord {
                seq: db.generate_id().map_err(abort)?,
                status: DepositStatus::WaitingDecide,
                coin_type: event.coin_type,
                tx_id: event.tx_id.clone(),
                out_index: event.out_index,
                amount_native: event.amount,
                mdl_sent: 0,
                mdl_tx_id: None,
                rate_used: String::new(),
                passthrough_droplets: None,
                error: None,
                mdl_address: bind.mdl_address,
                deposit_address: bind.deposit_address,
                buy_method: bind.buy_method,
                created_at: now,
                updated_at: now,
                extra: serde_json::Map::new(),
            };
            deposits.insert(key.as_bytes(), encode(&record).map_err(abort)?)?;
            Ok(Some((record, true)))
        })?;

        self.db.flush()?;
        Ok(outcome)
    }

    /// Apply `update` to a deposit record in one transaction and bump its
    /// `updated_at`. Finalized records refuse any further change.
    pub fn update_deposit(
        &self,
        id: &str,
        update: impl Fn(&mut DepositRecord),
    ) -> Result<DepositRecord, Error> {
        let record = self.deposits.transaction(|tree| {
            let Some(raw) = tree.get(id.as_bytes())? else {
                return Err(ConflictableTransactionError::Abort(Error::DepositNotFound(
                    id.to_string(),
                )));
            };
            let mut record: DepositRecord = decode("deposits", &raw).map_err(abort)?;
            if record.status == DepositStatus::Done {
                return Err(ConflictableTransactionError::Abort(Error::DepositFinalized(
                    id.to_string(),
                )));
            }

            update(&mut record);
            record.updated_at = now_timestamp();
            tree.insert(id.as_bytes(), encode(&record).map_err(abort)?)?;
            Ok(record)
        })?;

        self.db.flush()?;
        Ok(record)
    }

    /// A deposit record by its identity.
    pub fn get_deposit(&self, id: &str) -> Result<Option<DepositRecord>, Error> {
        self.deposits
            .get(id.as_bytes())?
            .map(|raw| decode("deposits", &raw))
            .transpose()
    }

    /// Every record that still needs driving, oldest first.
    pub fn deposits_not_done(&self) -> Result<Vec<DepositRecord>, Error> {
        let mut records = Vec::new();
        for item in self.deposits.iter() {
            let (_, raw) = item?;
            let record: DepositRecord = decode("deposits", &raw)?;
            if record.status != DepositStatus::Done {
                records.push(record);
            }
        }
        records.sort_by_key(|record| record.seq);
        Ok(records)
    }

    /// Deposit records that arrived on one deposit address, oldest first.
    pub fn deposits_for_address(
        &self,
        coin_type: CoinType,
        deposit_address: &str,
    ) -> Result<Vec<DepositRecord>, Error> {
        let mut records = Vec::new();
        for item in self.deposits.iter() {
            let (_, raw) = item?;
            let record: DepositRecord = decode("deposits", &raw)?;
            if record.coin_type == coin_type && record.deposit_address == deposit_address {
                records.push(record);
            }
        }
        records.sort_by_key(|record| record.seq);
        Ok(records)
    }
}

/// Decode a stored JSON value, attributing failures to its bucket.
fn decode<T: serde::de::DeserializeOwned>(bucket: &str, raw: &[u8]) -> Result<T, Error> {
    serde_json::from_slice(raw).map_err(|error| Error::CorruptValue {
        bucket: bucket.to_string(),
        error,
    })
}

/// Encode a value for storage.
fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, Error> {
    serde_json::to_vec(value).map_err(Error::SerializeValue)
}

/// Turn an error into a transaction abort.
fn abort<E: Into<Error>>(error: E) -> ConflictableTransactionError<Error> {
    ConflictableTransactionError::Abort(error.into())
}

impl From<UnabortableTransactionError> for Error {
    fn from(error: UnabortableTransactionError) -> Self {
        match error {
            UnabortableTransactionError::Storage(error) => Error::Sled(error),
            UnabortableTransactionError::Conflict => {
                Error::Sled(sled::Error::Unsupported("transaction conflict".into()))
            }
        }
    }
}
