//! # Database model types
//!
//! Records persisted by the teller. Values are stored as JSON documents;
//! every record carries a flattened map of unknown fields so that
//! read-modify-write cycles never drop data written by a newer build.

use serde::Deserialize;
use serde::Serialize;

/// The coins the teller can accept deposits in.
///
/// Adding a coin means adding a tag here plus a chain client for its
/// scanner; everything else is keyed off this type.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
pub enum CoinType {
    /// Bitcoin, amounts in satoshis.
    #[serde(rename = "BTC")]
    #[strum(serialize = "BTC")]
    Btc,
    /// Ethereum, amounts in wei.
    #[serde(rename = "ETH")]
    #[strum(serialize = "ETH")]
    Eth,
    /// Skycoin, amounts in droplets.
    #[serde(rename = "SKY")]
    #[strum(serialize = "SKY")]
    Sky,
    /// Waves, amounts in 10^-8 units.
    #[serde(rename = "WAVES")]
    #[strum(serialize = "WAVES")]
    Waves,
    /// The MDL asset hosted on the Waves chain, 10^-8 units.
    #[serde(rename = "WAVES-MDL")]
    #[strum(serialize = "WAVES-MDL")]
    WavesMdl,
}

impl CoinType {
    /// Scale between a whole coin and the chain's smallest integer unit.
    pub fn native_unit_scale(self) -> u64 {
        match self {
            CoinType::Btc => 100_000_000,
            CoinType::Eth => 1_000_000_000_000_000_000,
            CoinType::Sky => 1_000_000,
            CoinType::Waves | CoinType::WavesMdl => 100_000_000,
        }
    }

    /// Suffix used in per-coin bucket names, e.g. `deposit_addresses_btc`.
    pub fn bucket_suffix(self) -> &'static str {
        match self {
            CoinType::Btc => "btc",
            CoinType::Eth => "eth",
            CoinType::Sky => "sky",
            CoinType::Waves => "waves",
            CoinType::WavesMdl => "waves_mdl",
        }
    }
}

/// How a bound recipient's order is filled.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
pub enum BuyMethod {
    /// Pay out straight from the hot wallet at the configured rate.
    #[serde(rename = "direct")]
    #[strum(serialize = "direct")]
    Direct,
    /// Buy the coins on an external exchange first.
    #[serde(rename = "passthrough")]
    #[strum(serialize = "passthrough")]
    Passthrough,
}

/// Lifecycle of a deposit record.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
pub enum DepositStatus {
    /// A bind exists but no deposit has been seen for it yet. Only used
    /// in status reports; stored records start at `WaitingDecide`.
    #[serde(rename = "waiting_deposit")]
    #[strum(serialize = "waiting_deposit")]
    WaitingDeposit,
    /// Deposit recorded; the payout amount has not been decided.
    #[serde(rename = "waiting_decide")]
    #[strum(serialize = "waiting_decide")]
    WaitingDecide,
    /// Amount decided; MDL has not left the hot wallet.
    #[serde(rename = "waiting_send")]
    #[strum(serialize = "waiting_send")]
    WaitingSend,
    /// MDL sent; waiting for the transaction to confirm.
    #[serde(rename = "waiting_confirm")]
    #[strum(serialize = "waiting_confirm")]
    WaitingConfirm,
    /// Waiting for an external exchange order to fill.
    #[serde(rename = "waiting_passthrough_order")]
    #[strum(serialize = "waiting_passthrough_order")]
    WaitingPassthroughOrder,
    /// Terminal. The record never changes again.
    #[serde(rename = "done")]
    #[strum(serialize = "done")]
    Done,
}

/// One address in a coin's deposit address pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositAddressEntry {
    /// Insertion order; allocation hands out the lowest unused sequence.
    pub seq: u64,
    /// Whether the address has been handed to a recipient. Never unset.
    pub used: bool,
    /// Fields written by other builds, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Durable association of an MDL recipient with one deposit address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindRecord {
    /// Recipient of the payout.
    pub mdl_address: String,
    /// Coin of the allocated deposit address.
    pub coin_type: CoinType,
    /// The allocated deposit address.
    pub deposit_address: String,
    /// How deposits against this bind are filled.
    pub buy_method: BuyMethod,
    /// Unix timestamp of the allocation.
    pub created_at: i64,
    /// Fields written by other builds, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl BindRecord {
    /// Key of this bind in the binds bucket.
    pub fn key(&self) -> String {
        bind_key(self.coin_type, &self.deposit_address)
    }
}

/// Key of a bind in the binds bucket.
pub fn bind_key(coin_type: CoinType, deposit_address: &str) -> String {
    format!("bind:{coin_type}:{deposit_address}")
}

/// A deposit detected by a scanner, normalized across chains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositEvent {
    /// Coin the deposit arrived in.
    pub coin_type: CoinType,
    /// Transaction id on the source chain.
    pub tx_id: String,
    /// Output index within the transaction.
    pub out_index: u32,
    /// The matched deposit address.
    pub address: String,
    /// Amount in the chain's smallest integer unit. Wide enough for wei.
    #[serde(with = "i128_string")]
    pub amount: i128,
    /// Height of the block the transaction confirmed in.
    pub block_height: u64,
    /// Hash of that block.
    pub block_hash: String,
    /// Block timestamp, unix seconds.
    pub timestamp: i64,
}

impl DepositEvent {
    /// Identity of the deposit, used to key records and in-flight work.
    pub fn id(&self) -> String {
        deposit_key(&self.tx_id, self.out_index, self.coin_type)
    }
}

/// Key of a deposit record in the deposits bucket.
pub fn deposit_key(tx_id: &str, out_index: u32, coin_type: CoinType) -> String {
    format!("{tx_id}:{out_index}:{coin_type}")
}

/// A scanner's journal entry for a matched output. Journaled in the same
/// transaction that advances the scan cursor; `processed` flips once the
/// exchange has durably accepted the deposit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDeposit {
    /// The normalized deposit.
    #[serde(flatten)]
    pub deposit: DepositEvent,
    /// Whether the exchange has acknowledged the deposit.
    pub processed: bool,
}

/// Durable per-deposit payout record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositRecord {
    /// Monotonic sequence assigned at creation, reported by the status API.
    pub seq: u64,
    /// Current lifecycle state.
    pub status: DepositStatus,
    /// Coin the deposit arrived in.
    pub coin_type: CoinType,
    /// Source chain transaction id.
    pub tx_id: String,
    /// Output index within the transaction.
    pub out_index: u32,
    /// Deposited amount in the chain's smallest unit.
    #[serde(with = "i128_string")]
    pub amount_native: i128,
    /// Droplets actually sent; zero until the send succeeds.
    pub mdl_sent: u64,
    /// Transaction id of the MDL payout, once submitted.
    pub mdl_tx_id: Option<String>,
    /// Exchange rate snapshotted when the amount was decided.
    pub rate_used: String,
    /// Droplets bought on the external exchange for passthrough binds.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub passthrough_droplets: Option<u64>,
    /// Fatal cause, set when the record finalized without a payout.
    pub error: Option<String>,
    /// Recipient of the payout.
    pub mdl_address: String,
    /// Deposit address the coins arrived on.
    pub deposit_address: String,
    /// How the payout is filled.
    pub buy_method: BuyMethod,
    /// Unix timestamp of record creation.
    pub created_at: i64,
    /// Unix timestamp of the last transition.
    pub updated_at: i64,
    /// Fields written by other builds, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl DepositRecord {
    /// Identity of the record, used to key the deposits bucket.
    pub fn id(&self) -> String {
        deposit_key(&self.tx_id, self.out_index, self.coin_type)
    }
}

/// Serialize an `i128` as a decimal string. JSON numbers cap out at 64
/// bits in practice and wei amounts do not fit.
mod i128_string {
    use serde::de::Error as _;
    use serde::Deserialize as _;

    pub fn serialize<S>(value: &i128, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<i128, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

/// Current unix timestamp in seconds.
pub fn now_timestamp() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}
