//! # MDL teller
//!
//! The teller receives deposits in supported source coins (BTC, ETH, SKY,
//! WAVES and a Waves-hosted MDL asset) on addresses it has issued and pays
//! out a proportional amount of MDL from a local hot wallet once the
//! deposit confirms.
//!
//! The deposit pipeline is:
//!
//! - per coin [`scanner`]s walk their chain from a starting height,
//!   matching block outputs against the active deposit address set,
//! - the [`multiplexer`] fans the scanner streams into one channel,
//! - the [`exchange`] engine drives each deposit through its payout state
//!   machine, using the [`sender`] to move coins out of the hot wallet,
//! - the [`teller`] service exposes bind and status operations, served
//!   over HTTP by the [`api`] module.
//!
//! All durable state lives in the sled-backed [`storage`] layer.

pub mod addresses;
pub mod api;
pub mod config;
pub mod context;
pub mod error;
pub mod exchange;
pub mod multiplexer;
pub mod scanner;
pub mod sender;
pub mod storage;
pub mod teller;
#[cfg(feature = "testing")]
pub mod testing;

/// Package version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
