//! # MDL chain primitives
//!
//! This crate contains the pieces of the MDL chain that the teller needs
//! without talking to a node: the base58 address codec and droplet
//! arithmetic. It performs no I/O and has no async surface, so it can be
//! used from codecs, validators and tests alike.

pub mod address;
pub mod amount;

/// Package version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
