//! # HTTP API
//!
//! The JSON surface clients consume:
//!
//! | Method | Path                 |                                        |
//! |--------|----------------------|----------------------------------------|
//! | POST   | /api/bind            | bind an MDL address to a deposit address |
//! | GET    | /api/status          | deposit statuses of an MDL address     |
//! | GET    | /api/config          | rates, confirmations, enabled coins    |
//! | GET    | /api/exchange-status | last payout error and wallet balance   |
//!
//! Errors come back as `{"error": {"message", "code"}}`. Every route is
//! rate limited per client IP; behind a proxy the client IP is read from
//! `X-Forwarded-For` when the configuration says the header is trusted.

mod ratelimit;

pub use ratelimit::RateLimiter;

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use axum::extract::ConnectInfo;
use axum::extract::Query;
use axum::extract::Request;
use axum::extract::State;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use axum::Json;
use axum::Router;
use serde::Deserialize;
use serde::Serialize;
use tower_http::request_id::MakeRequestUuid;
use tower_http::request_id::PropagateRequestIdLayer;
use tower_http::request_id::SetRequestIdLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::Settings;
use crate::error::Error;
use crate::sender::WalletInteract;
use crate::storage::model::BuyMethod;
use crate::storage::model::CoinType;
use crate::teller::DepositStatusView;
use crate::teller::TellerService;

/// Static configuration snapshot served by `/api/config`.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigView {
    /// Enabled flag per coin tag.
    pub enabled: BTreeMap<String, bool>,
    /// Exchange rate per enabled coin tag.
    pub rates: BTreeMap<String, String>,
    /// Confirmation depth per enabled coin tag.
    pub confirmations: BTreeMap<String, u64>,
    /// Maximum binds per MDL address; zero means unbounded.
    pub max_bound_addrs: u32,
    /// Whether new binds are accepted.
    pub bind_enabled: bool,
}

impl ConfigView {
    /// Build the snapshot from the loaded settings.
    pub fn from_settings(settings: &Settings) -> Self {
        use strum::IntoEnumIterator as _;

        let mut enabled = BTreeMap::new();
        let mut rates = BTreeMap::new();
        let mut confirmations = BTreeMap::new();
        for coin_type in CoinType::iter() {
            let coin = settings.coin(coin_type);
            enabled.insert(coin_type.to_string(), coin.enabled);
            if coin.enabled {
                rates.insert(coin_type.to_string(), coin.rate.clone());
                confirmations.insert(coin_type.to_string(), coin.confirmations_required);
            }
        }

        Self {
            enabled,
            rates,
            confirmations,
            max_bound_addrs: settings.teller.max_bound_addrs,
            bind_enabled: settings.teller.bind_enabled,
        }
    }
}

/// State shared by every handler.
pub struct AppState<W> {
    /// Bind and status operations.
    pub teller: Arc<TellerService>,
    /// Hot wallet, for balance reporting only.
    pub wallet: W,
    /// Most recent fatal payout error, shared with the exchange engine.
    pub last_error: Arc<Mutex<Option<String>>>,
    /// Per-IP limiter.
    pub limiter: Arc<RateLimiter>,
    /// Whether `X-Forwarded-For` identifies the client.
    pub behind_proxy: bool,
    /// Snapshot served by `/api/config`.
    pub config_view: ConfigView,
}

impl<W: Clone> Clone for AppState<W> {
    fn clone(&self) -> Self {
        Self {
            teller: Arc::clone(&self.teller),
            wallet: self.wallet.clone(),
            last_error: Arc::clone(&self.last_error),
            limiter: Arc::clone(&self.limiter),
            behind_proxy: self.behind_proxy,
            config_view: self.config_view.clone(),
        }
    }
}

/// Build the application router.
pub fn router<W>(state: AppState<W>, request_timeout: Duration) -> Router
where
    W: WalletInteract + Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/api/bind", post(bind_deposit_address::<W>))
        .route("/api/status", get(deposit_status::<W>))
        .route("/api/config", get(teller_config::<W>))
        .route("/api/exchange-status", get(exchange_status::<W>))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            rate_limit::<W>,
        ))
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct BindRequest {
    mdladdr: String,
    coin_type: String,
}

#[derive(Debug, Serialize)]
struct BindResponse {
    deposit_address: String,
    coin_type: CoinType,
    buy_method: BuyMethod,
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    mdladdr: String,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    statuses: Vec<DepositStatusView>,
}

#[derive(Debug, Serialize)]
struct ConfigResponse {
    #[serde(flatten)]
    view: ConfigView,
    /// Spendable hot wallet balance as an MDL coin string, `"0"` when
    /// the wallet is unreachable.
    available_mdl: String,
}

#[derive(Debug, Serialize)]
struct ExchangeStatusResponse {
    error: String,
    balance: ExchangeBalance,
}

#[derive(Debug, Serialize)]
struct ExchangeBalance {
    coins: String,
    hours: u64,
}

async fn bind_deposit_address<W>(
    State(state): State<AppState<W>>,
    Json(request): Json<BindRequest>,
) -> Result<Json<BindResponse>, ApiError>
where
    W: WalletInteract + Clone + Send + Sync + 'static,
{
    let coin_type: CoinType = request
        .coin_type
        .parse()
        .map_err(|_| Error::UnsupportedCoin(request.coin_type.clone()))?;

    let bind = state.teller.bind(&request.mdladdr, coin_type)?;
    Ok(Json(BindResponse {
        deposit_address: bind.deposit_address,
        coin_type: bind.coin_type,
        buy_method: bind.buy_method,
    }))
}

async fn deposit_status<W>(
    State(state): State<AppState<W>>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<StatusResponse>, ApiError>
where
    W: WalletInteract + Clone + Send + Sync + 'static,
{
    let statuses = state.teller.status(&query.mdladdr)?;
    Ok(Json(StatusResponse { statuses }))
}

async fn teller_config<W>(State(state): State<AppState<W>>) -> Json<ConfigResponse>
where
    W: WalletInteract + Clone + Send + Sync + 'static,
{
    let available_mdl = match state.wallet.get_balance().await {
        Ok(balance) => mdl::amount::coin_string_from_droplets(balance.coins),
        Err(error) => {
            tracing::warn!(%error, "could not read wallet balance for /api/config");
            "0".to_string()
        }
    };

    Json(ConfigResponse {
        view: state.config_view.clone(),
        available_mdl,
    })
}

async fn exchange_status<W>(State(state): State<AppState<W>>) -> Json<ExchangeStatusResponse>
where
    W: WalletInteract + Clone + Send + Sync + 'static,
{
    let balance = match state.wallet.get_balance().await {
        Ok(balance) => ExchangeBalance {
            coins: mdl::amount::coin_string_from_droplets(balance.coins),
            hours: balance.hours,
        },
        Err(error) => {
            tracing::warn!(%error, "could not read wallet balance for /api/exchange-status");
            ExchangeBalance {
                coins: "0".to_string(),
                hours: 0,
            }
        }
    };

    let error = state
        .last_error
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
        .unwrap_or_default();

    Json(ExchangeStatusResponse { error, balance })
}

/// Reject requests over the per-IP budget before they reach a handler.
async fn rate_limit<W>(
    State(state): State<AppState<W>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response
where
    W: WalletInteract + Clone + Send + Sync + 'static,
{
    let client_ip = client_ip(&state, peer, &request);
    if !state.limiter.allow(client_ip) {
        tracing::debug!(%client_ip, "rate limited");
        return error_response(StatusCode::TOO_MANY_REQUESTS, "too many requests");
    }
    next.run(request).await
}

/// The IP a request is accounted against: the first `X-Forwarded-For`
/// hop when the proxy header is trusted, the socket peer otherwise.
fn client_ip<W>(state: &AppState<W>, peer: SocketAddr, request: &Request) -> IpAddr {
    if state.behind_proxy {
        let forwarded = request
            .headers()
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .and_then(|value| value.trim().parse().ok());
        if let Some(ip) = forwarded {
            return ip;
        }
    }
    peer.ip()
}

/// An error on its way out as the JSON envelope.
#[derive(Debug)]
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::InvalidMdlAddress(_)
            | Error::InvalidDepositAddress { .. }
            | Error::UnsupportedCoin(_)
            | Error::MaxBoundExceeded(_) => StatusCode::BAD_REQUEST,
            Error::BindDisabled | Error::PoolExhausted(_) => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "request failed");
            return error_response(status, "internal server error");
        }
        error_response(status, &self.0.to_string())
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "message": message,
            "code": status.as_u16(),
        }
    });
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::body::Body;
    use tower::ServiceExt as _;

    use crate::addresses::AddressManager;
    use crate::scanner::Scanner;
    use crate::sender::WalletBalance;
    use crate::storage::Store;
    use crate::testing::channel_scanner;
    use crate::testing::MockWallet;

    use super::*;

    fn test_state(bind_enabled: bool, limit: u32) -> AppState<MockWallet> {
        let store = Store::open_temporary().unwrap();
        let addresses = AddressManager::new(store.clone(), 0);
        let sky: Vec<String> = (0u8..4).map(|i| mdl::address::encode(&[i; 20])).collect();
        addresses.load_pool(CoinType::Sky, sky).unwrap();

        let (scanner, _deposits) = channel_scanner();
        let mut scanners: HashMap<CoinType, Arc<dyn Scanner>> = HashMap::new();
        scanners.insert(CoinType::Sky, Arc::new(scanner));
        let mut buy_methods = HashMap::new();
        buy_methods.insert(CoinType::Sky, BuyMethod::Direct);

        let teller = Arc::new(TellerService::new(
            addresses,
            store,
            scanners,
            buy_methods,
            bind_enabled,
        ));

        let wallet = MockWallet::new();
        wallet.set_balance(WalletBalance {
            coins: 2_500_000,
            hours: 9,
        });

        AppState {
            teller,
            wallet,
            last_error: Arc::new(Mutex::new(None)),
            limiter: Arc::new(RateLimiter::new(limit, Duration::from_secs(60))),
            behind_proxy: false,
            config_view: ConfigView {
                enabled: BTreeMap::from([("SKY".to_string(), true)]),
                rates: BTreeMap::from([("SKY".to_string(), "1/2".to_string())]),
                confirmations: BTreeMap::from([("SKY".to_string(), 1)]),
                max_bound_addrs: 0,
                bind_enabled,
            },
        }
    }

    fn test_router(state: AppState<MockWallet>) -> Router {
        router(state, Duration::from_secs(5))
    }

    fn request(method: &str, uri: &str, body: Option<serde_json::Value>) -> Request {
        let peer: SocketAddr = "192.0.2.1:4711".parse().unwrap();
        let builder = axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .extension(ConnectInfo(peer));

        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn recipient() -> String {
        mdl::address::encode(&[55u8; 20])
    }

    #[tokio::test]
    async fn bind_returns_the_allocated_address() {
        let app = test_router(test_state(true, 100));
        let body = serde_json::json!({"mdladdr": recipient(), "coin_type": "SKY"});

        let response = app
            .oneshot(request("POST", "/api/bind", Some(body)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["coin_type"], "SKY");
        assert_eq!(json["buy_method"], "direct");
        assert!(json["deposit_address"].as_str().is_some());
    }

    #[tokio::test]
    async fn unknown_coins_are_a_400_with_the_error_envelope() {
        let app = test_router(test_state(true, 100));
        let body = serde_json::json!({"mdladdr": recipient(), "coin_type": "DOGE"});

        let response = app
            .oneshot(request("POST", "/api/bind", Some(body)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], 400);
        assert!(json["error"]["message"].as_str().unwrap().contains("DOGE"));
    }

    #[tokio::test]
    async fn disabled_binding_is_a_403() {
        let app = test_router(test_state(false, 100));
        let body = serde_json::json!({"mdladdr": recipient(), "coin_type": "SKY"});

        let response = app
            .oneshot(request("POST", "/api/bind", Some(body)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn status_lists_the_recipients_binds() {
        let state = test_state(true, 100);
        let recipient = recipient();
        state.teller.bind(&recipient, CoinType::Sky).unwrap();

        let app = test_router(state);
        let response = app
            .oneshot(request("GET", &format!("/api/status?mdladdr={recipient}"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        let statuses = json["statuses"].as_array().unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0]["status"], "waiting_deposit");
    }

    #[tokio::test]
    async fn config_reports_rates_and_available_mdl() {
        let app = test_router(test_state(true, 100));

        let response = app
            .oneshot(request("GET", "/api/config", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["rates"]["SKY"], "1/2");
        assert_eq!(json["available_mdl"], "2.5");
        assert_eq!(json["bind_enabled"], true);
    }

    #[tokio::test]
    async fn exchange_status_reports_the_balance_and_last_error() {
        let state = test_state(true, 100);
        *state.last_error.lock().unwrap() = Some("wallet said no".to_string());

        let app = test_router(state);
        let response = app
            .oneshot(request("GET", "/api/exchange-status", None))
            .await
            .unwrap();

        let json = body_json(response).await;
        assert_eq!(json["error"], "wallet said no");
        assert_eq!(json["balance"]["coins"], "2.5");
        assert_eq!(json["balance"]["hours"], 9);
    }

    #[tokio::test]
    async fn requests_over_the_budget_are_rejected() {
        let app = test_router(test_state(true, 1));

        let first = app
            .clone()
            .oneshot(request("GET", "/api/config", None))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app
            .oneshot(request("GET", "/api/config", None))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);

        let json = body_json(second).await;
        assert_eq!(json["error"]["code"], 429);
    }
}
