//! # Error types
//!
//! One error enum for the whole service. Variants group into the
//! taxonomy the components care about: input errors surface as HTTP 400,
//! policy errors as 403/400, transient RPC faults are retried locally,
//! per-record faults finalize a single deposit, and everything else takes
//! the process down.

use crate::storage::model::CoinType;

/// Top-level teller error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // ---- input ----
    /// The MDL address in a request failed the base58 codec.
    #[error("invalid MDL address: {0}")]
    InvalidMdlAddress(#[source] mdl::address::AddressError),

    /// A deposit address failed its coin's codec.
    #[error("invalid {coin_type} address: {address:?}")]
    InvalidDepositAddress {
        /// Coin the address was supposed to belong to.
        coin_type: CoinType,
        /// The offending address.
        address: String,
    },

    /// The coin tag is unknown or its scanner is not running.
    #[error("unsupported coin type: {0:?}")]
    UnsupportedCoin(String),

    // ---- policy ----
    /// Binding new deposit addresses is disabled by configuration.
    #[error("binding is disabled")]
    BindDisabled,

    /// The deposit address pool for a coin has no unused address left.
    #[error("deposit address pool for {0} is exhausted")]
    PoolExhausted(CoinType),

    /// The MDL address already holds the configured number of binds.
    #[error("MDL address is already bound to {0} deposit addresses")]
    MaxBoundExceeded(u32),

    /// An address list contains the same address twice.
    #[error("duplicate {coin_type} address in input: {address:?}")]
    DuplicatePoolAddress {
        /// Coin the pool belongs to.
        coin_type: CoinType,
        /// The duplicated address.
        address: String,
    },

    // ---- store ----
    /// Database error.
    #[error("sled: {0}")]
    Sled(#[from] sled::Error),

    /// A value under a bucket failed to deserialize.
    #[error("corrupt value in bucket {bucket}: {error}")]
    CorruptValue {
        /// Bucket holding the value.
        bucket: String,
        /// Underlying serde failure.
        #[source]
        error: serde_json::Error,
    },

    /// A value failed to serialize; this is a bug, not a data problem.
    #[error("could not serialize value: {0}")]
    SerializeValue(#[source] serde_json::Error),

    /// A candidate pool address was taken by a concurrent allocation.
    /// Internal; the allocator retries with the next candidate.
    #[error("deposit address was allocated concurrently")]
    AddressTaken,

    /// An update targeted a deposit that is already finalized.
    #[error("deposit {0} is finalized and cannot change")]
    DepositFinalized(String),

    /// An update targeted a deposit that does not exist.
    #[error("no deposit record under {0}")]
    DepositNotFound(String),

    // ---- rates / amounts ----
    /// A configured exchange rate string did not parse or is not positive.
    #[error("invalid exchange rate: {0:?}")]
    InvalidRate(String),

    /// A deposit carried a negative native amount.
    #[error("negative deposit amount: {0}")]
    NegativeDeposit(i128),

    /// The computed droplet amount does not fit in 64 bits.
    #[error("computed MDL amount out of range")]
    AmountOverflow,

    /// `max_decimals` outside the supported 0..=6 window.
    #[error("max_decimals must be at most 6, got {0}")]
    InvalidMaxDecimals(u32),

    /// A passthrough bind was hit with no counterparty configured.
    #[error("no passthrough counterparty is configured")]
    PassthroughUnavailable,

    // ---- rpc ----
    /// bitcoind/btcd RPC failure.
    #[error("bitcoin RPC: {0}")]
    BitcoinRpc(#[from] bitcoincore_rpc::Error),

    /// HTTP-level failure talking to a node.
    #[error("http client: {0}")]
    Reqwest(#[from] reqwest::Error),

    /// A node answered with a JSON-RPC error object.
    #[error("{coin_type} node rejected the call: {message}")]
    NodeRpc {
        /// Coin whose node produced the error.
        coin_type: CoinType,
        /// Error message from the node.
        message: String,
    },

    /// A node response was missing fields we rely on.
    #[error("unexpected {coin_type} node response: {message}")]
    NodeResponse {
        /// Coin whose node produced the response.
        coin_type: CoinType,
        /// What was wrong with it.
        message: String,
    },

    /// The MDL wallet node rejected a request. Fatal for the deposit
    /// being paid out, never retried.
    #[error("wallet rejected the request: {0}")]
    WalletRpc(String),

    /// The MDL wallet node could not be reached or answered 5xx.
    #[error("wallet unavailable: {0}")]
    WalletUnavailable(String),

    /// An endpoint URL in the configuration did not parse.
    #[error("invalid URL {url:?}: {error}")]
    InvalidUrl {
        /// The configured URL.
        url: String,
        /// Parse failure.
        #[source]
        error: url::ParseError,
    },

    // ---- lifecycle ----
    /// `run` was called twice on the same component.
    #[error("{0} is already running")]
    AlreadyRunning(&'static str),

    /// A scanner was registered twice for the same coin.
    #[error("a scanner for {0} is already registered")]
    ScannerAlreadyRegistered(CoinType),

    /// The deposit stream was taken more than once.
    #[error("the {0} deposit stream was already taken")]
    DepositStreamTaken(&'static str),

    /// A channel peer went away while the pipeline was still running.
    #[error("deposit channel closed")]
    ChannelClosed,

    /// Shutdown was requested while waiting on an operation.
    #[error("shutting down")]
    ShuttingDown,

    /// A blocking task could not be joined.
    #[error("task join: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    /// A supervised task returned while the process was still running.
    #[error("task {0} exited unexpectedly")]
    TaskExited(String),

    // ---- startup ----
    /// Configuration loading failure.
    #[error("config: {0}")]
    Config(#[from] config::ConfigError),

    /// A configuration value failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Filesystem failure, e.g. reading an address list.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// The HTTP listener failed to bind or serve.
    #[error("http server: {0}")]
    HttpServer(#[source] std::io::Error),
}

impl From<sled::transaction::TransactionError<Error>> for Error {
    fn from(error: sled::transaction::TransactionError<Error>) -> Self {
        match error {
            sled::transaction::TransactionError::Abort(error) => error,
            sled::transaction::TransactionError::Storage(error) => Error::Sled(error),
        }
    }
}

impl Error {
    /// Whether retrying the operation later may succeed. Node rejections
    /// and malformed requests are not transient; connectivity problems are.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Reqwest(error) => {
                error.is_timeout() || error.is_connect() || error.is_request()
            }
            Error::WalletUnavailable(_) => true,
            _ => false,
        }
    }
}
