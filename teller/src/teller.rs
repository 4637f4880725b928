//! # Teller service
//!
//! The bind and status operations the HTTP layer serves. Sits on top of
//! the address manager and the store; registering freshly allocated
//! addresses with the right scanner is the one side effect it owns.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::addresses::AddressManager;
use crate::error::Error;
use crate::scanner::Scanner;
use crate::storage::model::BindRecord;
use crate::storage::model::BuyMethod;
use crate::storage::model::CoinType;
use crate::storage::model::DepositStatus;
use crate::storage::Store;

/// One row of a status report.
#[derive(Debug, Clone, Serialize)]
pub struct DepositStatusView {
    /// Record sequence; binds with no deposit yet report zero.
    pub seq: u64,
    /// Unix timestamp of the last change.
    pub updated_at: i64,
    /// Current state.
    pub status: DepositStatus,
}

/// Bind and status operations.
pub struct TellerService {
    addresses: AddressManager,
    store: Store,
    scanners: HashMap<CoinType, Arc<dyn Scanner>>,
    buy_methods: HashMap<CoinType, BuyMethod>,
    bind_enabled: bool,
}

impl TellerService {
    /// A service over the given collaborators. `scanners` holds one
    /// entry per enabled coin; binds for any other coin are refused.
    pub fn new(
        addresses: AddressManager,
        store: Store,
        scanners: HashMap<CoinType, Arc<dyn Scanner>>,
        buy_methods: HashMap<CoinType, BuyMethod>,
        bind_enabled: bool,
    ) -> Self {
        Self {
            addresses,
            store,
            scanners,
            buy_methods,
            bind_enabled,
        }
    }

    /// Bind `mdl_address` to a freshly allocated deposit address of
    /// `coin_type` and start scanning for it.
    pub fn bind(&self, mdl_address: &str, coin_type: CoinType) -> Result<BindRecord, Error> {
        if !self.bind_enabled {
            return Err(Error::BindDisabled);
        }
        mdl::address::validate(mdl_address).map_err(Error::InvalidMdlAddress)?;

        let scanner = self
            .scanners
            .get(&coin_type)
            .ok_or_else(|| Error::UnsupportedCoin(coin_type.to_string()))?;
        let buy_method = self
            .buy_methods
            .get(&coin_type)
            .copied()
            .unwrap_or(BuyMethod::Direct);

        let bind = self.addresses.allocate(mdl_address, coin_type, buy_method)?;
        scanner.add_scan_address(&bind.deposit_address)?;

        tracing::info!(
            mdl_address,
            %coin_type,
            deposit_address = %bind.deposit_address,
            "bound deposit address"
        );
        Ok(bind)
    }

    /// Deposit statuses across every bind of `mdl_address`, oldest
    /// first. A bind that has not seen a deposit yet contributes one
    /// `waiting_deposit` row.
    pub fn status(&self, mdl_address: &str) -> Result<Vec<DepositStatusView>, Error> {
        mdl::address::validate(mdl_address).map_err(Error::InvalidMdlAddress)?;

        let mut views = Vec::new();
        for bind in self.addresses.binds_for(mdl_address)? {
            let records = self
                .store
                .deposits_for_address(bind.coin_type, &bind.deposit_address)?;

            if records.is_empty() {
                views.push(DepositStatusView {
                    seq: 0,
                    updated_at: bind.created_at,
                    status: DepositStatus::WaitingDeposit,
                });
                continue;
            }

            for record in records {
                views.push(DepositStatusView {
                    seq: record.seq,
                    updated_at: record.updated_at,
                    status: record.status,
                });
            }
        }

        views.sort_by_key(|view| view.seq);
        Ok(views)
    }

    /// The coins binds are currently accepted for.
    pub fn enabled_coins(&self) -> Vec<CoinType> {
        let mut coins: Vec<CoinType> = self.scanners.keys().copied().collect();
        coins.sort();
        coins
    }
}
