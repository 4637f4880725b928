//! # Deposit address pools
//!
//! Per-coin pools of pre-provisioned deposit addresses. Pools are loaded
//! from newline-delimited files at startup and merged idempotently;
//! allocation hands out the oldest unused address and writes the bind in
//! the same transaction. Addresses are never released back.

use std::str::FromStr as _;

use crate::error::Error;
use crate::storage::model::BindRecord;
use crate::storage::model::BuyMethod;
use crate::storage::model::CoinType;
use crate::storage::Store;

/// Validate `address` against `coin_type`'s codec and return the
/// canonical form the pool and the scanners agree on.
pub fn normalize_address(coin_type: CoinType, address: &str) -> Result<String, Error> {
    let address = address.trim();
    let invalid = || Error::InvalidDepositAddress {
        coin_type,
        address: address.to_string(),
    };

    match coin_type {
        CoinType::Btc => {
            // Network-agnostic parse; the pool decides which network the
            // addresses came from.
            bitcoin::Address::from_str(address).map_err(|_| invalid())?;
            Ok(address.to_string())
        }
        CoinType::Eth => {
            let digits = address.strip_prefix("0x").ok_or_else(invalid)?;
            if digits.len() != 40 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            Ok(address.to_ascii_lowercase())
        }
        CoinType::Sky => {
            // SKY shares the MDL codec.
            mdl::address::validate(address).map_err(|_| invalid())?;
            Ok(address.to_string())
        }
        CoinType::Waves | CoinType::WavesMdl => {
            let bytes = bs58::decode(address).into_vec().map_err(|_| invalid())?;
            // Entity tag 1, chain id, 20 byte hash, 4 byte checksum.
            if bytes.len() != 26 || bytes[0] != 1 {
                return Err(invalid());
            }
            Ok(address.to_string())
        }
    }
}

/// Parse the contents of an address-list file: one address per line,
/// blank lines and `#` comments skipped.
pub fn parse_address_file(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// The per-coin pools and the bind ledger.
#[derive(Debug, Clone)]
pub struct AddressManager {
    store: Store,
    max_bound_addrs: u32,
}

impl AddressManager {
    /// A manager over `store` allowing `max_bound_addrs` binds per MDL
    /// address; zero means unbounded.
    pub fn new(store: Store, max_bound_addrs: u32) -> Self {
        Self {
            store,
            max_bound_addrs,
        }
    }

    /// Validate and merge `addresses` into the coin's pool.
    ///
    /// Every address must pass the coin's codec and appear only once in
    /// the input; addresses already pooled are skipped. Persists all new
    /// addresses or none.
    pub fn load_pool<I>(&self, coin_type: CoinType, addresses: I) -> Result<usize, Error>
    where
        I: IntoIterator<Item = String>,
    {
        let mut seen = std::collections::HashSet::new();
        let mut normalized = Vec::new();
        for address in addresses {
            let address = normalize_address(coin_type, &address)?;
            if !seen.insert(address.clone()) {
                return Err(Error::DuplicatePoolAddress { coin_type, address });
            }
            normalized.push(address);
        }

        let added = self.store.merge_pool(coin_type, &normalized)?;
        let skipped = normalized.len() - added;
        if skipped > 0 {
            tracing::info!(%coin_type, skipped, "addresses already pooled");
        }
        tracing::info!(%coin_type, added, "loaded deposit address pool");
        Ok(added)
    }

    /// Allocate a fresh deposit address for `mdl_address` and record the
    /// bind. The oldest unused address wins; a concurrent allocation of
    /// the same candidate just moves on to the next one.
    pub fn allocate(
        &self,
        mdl_address: &str,
        coin_type: CoinType,
        buy_method: BuyMethod,
    ) -> Result<BindRecord, Error> {
        loop {
            let Some(candidate) = self.store.first_unused_address(coin_type)? else {
                return Err(Error::PoolExhausted(coin_type));
            };

            match self.store.allocate_address(
                coin_type,
                &candidate,
                mdl_address,
                buy_method,
                self.max_bound_addrs,
            ) {
                Ok(bind) => {
                    tracing::info!(
                        %coin_type,
                        deposit_address = %bind.deposit_address,
                        mdl_address,
                        "allocated deposit address"
                    );
                    return Ok(bind);
                }
                Err(Error::AddressTaken) => continue,
                Err(error) => return Err(error),
            }
        }
    }

    /// All binds held by `mdl_address`, oldest first.
    pub fn binds_for(&self, mdl_address: &str) -> Result<Vec<BindRecord>, Error> {
        self.store.binds_for(mdl_address)
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn manager(max_bound: u32) -> AddressManager {
        AddressManager::new(Store::open_temporary().unwrap(), max_bound)
    }

    #[test_case(CoinType::Btc, "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa"; "btc base58")]
    #[test_case(CoinType::Btc, "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4"; "btc bech32")]
    #[test_case(CoinType::Eth, "0xde0B295669a9FD93d5F28D9Ec85E40f4cb697BAe"; "eth checksummed")]
    fn accepts_real_addresses(coin_type: CoinType, address: &str) {
        assert!(normalize_address(coin_type, address).is_ok());
    }

    #[test_case(CoinType::Btc, "notanaddress"; "btc junk")]
    #[test_case(CoinType::Eth, "de0B295669a9FD93d5F28D9Ec85E40f4cb697BAe"; "eth missing prefix")]
    #[test_case(CoinType::Eth, "0x1234"; "eth short")]
    #[test_case(CoinType::Sky, "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa"; "sky wrong codec")]
    #[test_case(CoinType::Waves, "zzz"; "waves junk")]
    fn rejects_invalid_addresses(coin_type: CoinType, address: &str) {
        assert!(matches!(
            normalize_address(coin_type, address),
            Err(Error::InvalidDepositAddress { .. })
        ));
    }

    #[test]
    fn eth_addresses_normalize_to_lowercase() {
        let normalized =
            normalize_address(CoinType::Eth, "0xde0B295669a9FD93d5F28D9Ec85E40f4cb697BAe")
                .unwrap();
        assert_eq!(normalized, "0xde0b295669a9fd93d5f28d9ec85e40f4cb697bae");
    }

    #[test]
    fn sky_addresses_use_the_mdl_codec() {
        let address = mdl::address::encode(&[9u8; 20]);
        assert!(normalize_address(CoinType::Sky, &address).is_ok());
    }

    #[test]
    fn address_files_skip_blanks_and_comments() {
        let contents = "\n# pool one\naddr-a\n  addr-b  \n\n# done\n";
        assert_eq!(parse_address_file(contents), vec!["addr-a", "addr-b"]);
    }

    #[test]
    fn duplicate_input_addresses_are_rejected() {
        let manager = manager(0);
        let address = mdl::address::encode(&[1u8; 20]);
        let result =
            manager.load_pool(CoinType::Sky, vec![address.clone(), address.clone()]);
        assert!(matches!(result, Err(Error::DuplicatePoolAddress { .. })));
    }

    #[test]
    fn reloading_a_pool_is_idempotent() {
        let manager = manager(0);
        let addresses: Vec<String> =
            (0u8..4).map(|i| mdl::address::encode(&[i; 20])).collect();

        assert_eq!(manager.load_pool(CoinType::Sky, addresses.clone()).unwrap(), 4);
        assert_eq!(manager.load_pool(CoinType::Sky, addresses).unwrap(), 0);
    }

    /// Every allocation returns a distinct address until the pool runs
    /// dry, in insertion order.
    #[test]
    fn allocations_are_exclusive_and_ordered() {
        let manager = manager(0);
        let addresses: Vec<String> =
            (0u8..5).map(|i| mdl::address::encode(&[i; 20])).collect();
        manager.load_pool(CoinType::Sky, addresses.clone()).unwrap();

        let mut allocated = Vec::new();
        for i in 0..5 {
            let bind = manager
                .allocate(&format!("recipient-{i}"), CoinType::Sky, BuyMethod::Direct)
                .unwrap();
            allocated.push(bind.deposit_address);
        }

        assert_eq!(allocated, addresses);
        let result = manager.allocate("one-more", CoinType::Sky, BuyMethod::Direct);
        assert!(matches!(result, Err(Error::PoolExhausted(CoinType::Sky))));
    }

    /// Two binds allowed, the third fails, and other coins do not reset
    /// the count.
    #[test]
    fn bind_limits_span_coin_types() {
        let manager = manager(2);
        let sky: Vec<String> = (0u8..3).map(|i| mdl::address::encode(&[i; 20])).collect();
        manager.load_pool(CoinType::Sky, sky).unwrap();
        manager
            .load_pool(CoinType::Eth, vec![format!("0x{}", "ab".repeat(20))])
            .unwrap();

        let first = manager.allocate("recipient", CoinType::Sky, BuyMethod::Direct).unwrap();
        let second = manager.allocate("recipient", CoinType::Sky, BuyMethod::Direct).unwrap();
        assert_ne!(first.deposit_address, second.deposit_address);

        let third = manager.allocate("recipient", CoinType::Eth, BuyMethod::Direct);
        assert!(matches!(third, Err(Error::MaxBoundExceeded(2))));

        assert_eq!(manager.binds_for("recipient").unwrap().len(), 2);
    }
}
