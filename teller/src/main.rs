//! Teller binary: wires the store, scanners, multiplexer, exchange
//! engine and HTTP API together and supervises them until shutdown.
//!
//! Exit code 0 means a clean shutdown; any startup failure or fatal
//! runtime error exits 1.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

use teller::addresses::parse_address_file;
use teller::addresses::AddressManager;
use teller::api;
use teller::api::AppState;
use teller::api::ConfigView;
use teller::api::RateLimiter;
use teller::config::Settings;
use teller::context::ShutdownHandle;
use teller::error::Error;
use teller::exchange::ExchangeEngine;
use teller::multiplexer::Multiplexer;
use teller::scanner::BaseScanner;
use teller::scanner::BtcRpcClient;
use teller::scanner::ChainInteract;
use teller::scanner::EthRpcClient;
use teller::scanner::Scanner;
use teller::scanner::SkyRpcClient;
use teller::scanner::WavesRpcClient;
use teller::sender::RetrySender;
use teller::sender::WalletRpcClient;
use teller::storage::model::BuyMethod;
use teller::storage::model::CoinType;
use teller::storage::Store;
use teller::teller::TellerService;

/// HTTP timeout for chain node calls.
const CHAIN_RPC_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "teller", version = teller::VERSION, about = "MDL crypto-deposit teller")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run(cli) {
        Ok(()) => {
            tracing::info!("teller stopped");
            ExitCode::SUCCESS
        }
        Err(error) => {
            tracing::error!(%error, "teller exited with a fatal error");
            ExitCode::FAILURE
        }
    }
}

/// One supervised task: its name and how it ended.
type TaskResult = (String, Result<(), Error>);

#[tokio::main]
async fn run(cli: Cli) -> Result<(), Error> {
    let settings = Settings::new(cli.config.as_deref())?;
    tracing::info!(version = teller::VERSION, "starting teller");

    let store = Store::open(&settings.storage.db_path)?;
    let addresses = AddressManager::new(store.clone(), settings.teller.max_bound_addrs);

    for coin_type in settings.enabled_coins() {
        let coin = settings.coin(coin_type);
        if let Some(path) = &coin.addresses_file {
            let contents = std::fs::read_to_string(path)?;
            addresses.load_pool(coin_type, parse_address_file(&contents))?;
        }
    }

    let shutdown = ShutdownHandle::new();
    let multiplexer = Arc::new(Multiplexer::new());
    let mut tasks: JoinSet<TaskResult> = JoinSet::new();
    let mut scanners: HashMap<CoinType, Arc<dyn Scanner>> = HashMap::new();

    for coin_type in settings.enabled_coins() {
        let coin = settings.coin(coin_type);
        match coin_type {
            CoinType::Btc => {
                let network = coin.network.parse().map_err(|_| {
                    Error::InvalidConfig(format!("unknown bitcoin network {:?}", coin.network))
                })?;
                let client = BtcRpcClient::new(
                    &coin.rpc_url,
                    coin.rpc_user.clone(),
                    coin.rpc_password.clone(),
                    network,
                )?;
                install_scanner(&mut tasks, &multiplexer, &mut scanners, client, &store, &settings)?;
            }
            CoinType::Eth => {
                let client = EthRpcClient::new(&coin.rpc_url, CHAIN_RPC_TIMEOUT)?;
                install_scanner(&mut tasks, &multiplexer, &mut scanners, client, &store, &settings)?;
            }
            CoinType::Sky => {
                let client = SkyRpcClient::new(&coin.rpc_url, CHAIN_RPC_TIMEOUT)?;
                install_scanner(&mut tasks, &multiplexer, &mut scanners, client, &store, &settings)?;
            }
            CoinType::Waves => {
                let client = WavesRpcClient::new(&coin.rpc_url, CHAIN_RPC_TIMEOUT)?;
                install_scanner(&mut tasks, &multiplexer, &mut scanners, client, &store, &settings)?;
            }
            CoinType::WavesMdl => {
                let asset_id = coin.asset_id.clone().ok_or_else(|| {
                    Error::InvalidConfig("waves_mdl.asset_id must be set".into())
                })?;
                let client =
                    WavesRpcClient::new_for_asset(&coin.rpc_url, CHAIN_RPC_TIMEOUT, asset_id)?;
                install_scanner(&mut tasks, &multiplexer, &mut scanners, client, &store, &settings)?;
            }
        }
    }

    // Addresses bound before this start must be scanned again; the scan
    // set is persisted, this just covers a bind that raced a crash.
    for bind in store.all_binds()? {
        if let Some(scanner) = scanners.get(&bind.coin_type) {
            scanner.add_scan_address(&bind.deposit_address)?;
        }
    }

    let deposits = multiplexer
        .take_deposits()
        .ok_or(Error::DepositStreamTaken("multiplexer"))?;
    tasks.spawn({
        let multiplexer = Arc::clone(&multiplexer);
        async move { ("multiplexer".to_string(), multiplexer.run().await) }
    });

    let wallet = WalletRpcClient::new(
        &settings.mdl.node_url,
        settings.mdl.wallet_id.clone(),
        Duration::from_secs(settings.mdl.rpc_timeout_secs),
    )?;
    let sender = RetrySender::new(wallet.clone(), settings.sender_config(), shutdown.subscribe());
    let engine = Arc::new(ExchangeEngine::new(
        store.clone(),
        sender,
        settings.exchange_config(),
        deposits,
        shutdown.subscribe(),
    ));
    let last_error = engine.last_error_handle();
    tasks.spawn({
        let engine = Arc::clone(&engine);
        async move { ("exchange engine".to_string(), engine.run().await) }
    });

    let buy_methods: HashMap<CoinType, BuyMethod> = settings
        .enabled_coins()
        .into_iter()
        .map(|coin_type| (coin_type, settings.coin(coin_type).buy_method))
        .collect();
    let teller_service = Arc::new(TellerService::new(
        addresses,
        store.clone(),
        scanners.clone(),
        buy_methods,
        settings.teller.bind_enabled,
    ));

    let state = AppState {
        teller: teller_service,
        wallet,
        last_error,
        limiter: Arc::new(RateLimiter::new(
            settings.http.rate_limit_requests,
            Duration::from_secs(settings.http.rate_limit_window_secs),
        )),
        behind_proxy: settings.http.behind_proxy,
        config_view: ConfigView::from_settings(&settings),
    };
    let app = api::router(state, Duration::from_secs(settings.http.request_timeout_secs));

    let listener = tokio::net::TcpListener::bind(settings.http.listen)
        .await
        .map_err(Error::HttpServer)?;
    tracing::info!(listen = %settings.http.listen, "serving HTTP API");
    tasks.spawn({
        let mut http_shutdown = shutdown.subscribe();
        async move {
            let result =
                axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                    .with_graceful_shutdown(async move {
                        http_shutdown.wait_for_shutdown().await;
                    })
                    .await
                    .map_err(Error::HttpServer);
            ("http server".to_string(), result)
        }
    });

    // Supervise: the first task to die takes the process down; a signal
    // shuts everything down cleanly.
    let mut failure: Option<Error> = None;
    tokio::select! {
        _ = shutdown_requested() => {
            tracing::info!("shutdown requested");
        }
        Some(joined) = tasks.join_next() => match joined {
            Ok((name, Ok(()))) => {
                tracing::error!(task = %name, "task exited unexpectedly");
                failure = Some(Error::TaskExited(name));
            }
            other => note_task_result(&mut failure, other),
        },
    }

    shutdown.signal();
    for scanner in scanners.values() {
        scanner.shutdown();
    }
    multiplexer.shutdown();

    let drain_budget =
        Duration::from_secs(settings.http.graceful_shutdown_timeout_secs.max(1) + 5);
    let drained = tokio::time::timeout(drain_budget, async {
        while let Some(joined) = tasks.join_next().await {
            note_task_result(&mut failure, joined);
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!("tasks did not stop in time, aborting the stragglers");
        tasks.abort_all();
    }

    match failure {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

/// Build a scanner over `client`, register it everywhere and spawn its
/// walking loop.
fn install_scanner<C>(
    tasks: &mut JoinSet<TaskResult>,
    multiplexer: &Multiplexer,
    scanners: &mut HashMap<CoinType, Arc<dyn Scanner>>,
    client: C,
    store: &Store,
    settings: &Settings,
) -> Result<(), Error>
where
    C: ChainInteract + Send + Sync + 'static,
{
    let coin_type = client.coin_type();
    let config = settings.coin(coin_type).scan_config();
    let scanner = Arc::new(BaseScanner::new(client, store.clone(), config));

    multiplexer.add_scanner(scanner.as_ref(), coin_type)?;
    scanners.insert(coin_type, Arc::clone(&scanner) as Arc<dyn Scanner>);

    tasks.spawn(async move { (format!("{coin_type} scanner"), scanner.run().await) });
    Ok(())
}

/// Record how a supervised task ended, keeping the first failure.
fn note_task_result(
    failure: &mut Option<Error>,
    joined: Result<TaskResult, tokio::task::JoinError>,
) {
    match joined {
        Ok((name, Ok(()))) => tracing::debug!(task = %name, "task stopped"),
        Ok((name, Err(error))) => {
            tracing::error!(task = %name, %error, "task failed");
            if failure.is_none() {
                *failure = Some(error);
            }
        }
        Err(error) => {
            if failure.is_none() {
                *failure = Some(Error::TaskJoin(error));
            }
        }
    }
}

/// Resolve when the operator asks the process to stop.
async fn shutdown_requested() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::signal;
        use tokio::signal::unix::SignalKind;

        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(error) => {
                tracing::warn!(%error, "could not install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
