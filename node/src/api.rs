//! # REST API
//!
//! Builds the axum routers for both node roles. All endpoints share
//! application state through axum's `State` extractor.
//!
//! ## Device endpoints
//!
//! | Method | Path                       | Description                          |
//! |--------|----------------------------|--------------------------------------|
//! | GET    | `/health`                  | Liveness check                       |
//! | GET    | `/device-id`               | This device's id                     |
//! | GET    | `/api/balance`             | Owner account                        |
//! | GET    | `/api/transactions`        | Owner log, most recent first         |
//! | POST   | `/api/process-transaction` | Apply a transaction received elsewhere |
//! | POST   | `/api/send`                | Debit and send a payment to a peer   |
//! | POST   | `/api/sync`                | Sync with the authority now          |
//! | POST   | `/api/sync/reset`          | Rescan the whole log on the next sync |
//! | GET    | `/api/peers`               | Peers with a live session            |
//! | POST   | `/api/peers`               | Dial a peer                          |
//! | GET    | `/api/confirmations`       | Confirmations received from peers    |
//! | GET    | `/metrics`                 | Prometheus text                      |
//!
//! ## Authority endpoints
//!
//! | Method | Path                     | Description                   |
//! |--------|--------------------------|-------------------------------|
//! | GET    | `/health`                | Liveness check                |
//! | POST   | `/api/users`             | Open an account               |
//! | GET    | `/api/balance/:id`       | Canonical balance, 0 if unknown |
//! | POST   | `/api/transactions`      | Apply one transaction         |
//! | GET    | `/api/transactions/:id`  | Canonical log of one account  |
//! | POST   | `/api/sync`              | Judge a device's sync batch   |
//! | GET    | `/metrics`               | Prometheus text               |
//!
//! Errors are `{ "error": <message>, "type": <category> }`, with category
//! `validation` (400), `not_found` (404), `database` (500) or `transport`
//! (503).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use tally_ledger::sync::SyncRequest;
use tally_ledger::{
    Account, ApplyError, Authority, DeviceId, PaymentService, StorageError, SyncReconciler,
    SyncTrigger, Transaction,
};

use crate::metrics::{self, SharedMetrics};
use crate::peer::PeerNetwork;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared state of a device server. Cheap to clone, everything behind `Arc`.
#[derive(Clone)]
pub struct DeviceState {
    /// The node's reported version string.
    pub version: String,
    pub service: Arc<PaymentService>,
    pub reconciler: Arc<SyncReconciler>,
    pub peers: Arc<PeerNetwork>,
    pub trigger: SyncTrigger,
    pub metrics: SharedMetrics,
}

impl DeviceState {
    fn owner(&self) -> &DeviceId {
        self.service.owner()
    }

    fn refresh_gauges(&self) {
        match self.service.engine().pending_transactions() {
            Ok(pending) => self.metrics.pending_transactions.set(pending.len() as i64),
            Err(e) => tracing::warn!(error = %e, "failed to count pending transactions"),
        }
        self.metrics
            .connected_peers
            .set(self.peers.registry().len() as i64);
    }
}

/// Shared state of the authority server.
#[derive(Clone)]
pub struct AuthorityState {
    pub version: String,
    pub authority: Arc<Authority>,
    pub metrics: SharedMetrics,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error body returned by every endpoint.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

/// Handler failure, mapped onto a status code and an [`ErrorResponse`].
#[derive(Debug)]
pub enum ApiError {
    Validation(String),
    NotFound(String),
    Database(String),
    Transport(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, error) = match self {
            ApiError::Validation(e) => (StatusCode::BAD_REQUEST, "validation", e),
            ApiError::NotFound(e) => (StatusCode::NOT_FOUND, "not_found", e),
            ApiError::Database(e) => (StatusCode::INTERNAL_SERVER_ERROR, "database", e),
            ApiError::Transport(e) => (StatusCode::SERVICE_UNAVAILABLE, "transport", e),
        };
        (status, Json(ErrorResponse { error, kind })).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        tracing::error!(error = %e, "storage failure");
        ApiError::Database(e.to_string())
    }
}

impl From<ApplyError> for ApiError {
    fn from(e: ApplyError) -> Self {
        match e {
            ApplyError::Rejected(e) => ApiError::Validation(e.to_string()),
            ApplyError::Storage(e) => e.into(),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Request Bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ProcessTransactionRequest {
    pub transaction: Transaction,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub receiver_id: DeviceId,
    pub amount: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct DialRequest {
    pub address: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub id: DeviceId,
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
}

/// Builds the device [`Router`] with CORS and request tracing.
pub fn create_device_router(state: DeviceState) -> Router {
    Router::new()
        .route("/health", get(device_health))
        .route("/device-id", get(device_id))
        .route("/api/balance", get(device_balance))
        .route("/api/transactions", get(device_transactions))
        .route("/api/process-transaction", post(process_transaction))
        .route("/api/send", post(send_payment))
        .route("/api/sync", post(sync_now))
        .route("/api/sync/reset", post(reset_sync))
        .route("/api/peers", get(list_peers).post(dial_peer))
        .route("/api/confirmations", get(confirmations))
        .route("/metrics", get(device_metrics))
        .layer(cors())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Builds the authority [`Router`] with CORS and request tracing.
pub fn create_authority_router(state: AuthorityState) -> Router {
    Router::new()
        .route("/health", get(authority_health))
        .route("/api/users", post(create_user))
        .route("/api/balance/:id", get(authority_balance))
        .route("/api/transactions", post(authority_apply))
        .route("/api/transactions/:id", get(authority_transactions))
        .route("/api/sync", post(authority_sync))
        .route("/metrics", get(authority_metrics))
        .layer(cors())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Device Handlers
// ---------------------------------------------------------------------------

/// `GET /health` - returns 200 if the node is alive.
async fn device_health(State(state): State<DeviceState>) -> impl IntoResponse {
    Json(json!({ "status": "ok", "role": "device", "version": state.version }))
}

async fn device_id(State(state): State<DeviceState>) -> impl IntoResponse {
    Json(json!({ "deviceId": state.owner() }))
}

/// `GET /api/balance` - the owner's account as this device sees it,
/// including unsynced transfers.
async fn device_balance(State(state): State<DeviceState>) -> ApiResult<Json<Account>> {
    let owner = state.owner().clone();
    let balance = state.service.engine().balance(&owner)?;
    Ok(Json(Account::new(owner, balance)))
}

async fn device_transactions(
    State(state): State<DeviceState>,
) -> ApiResult<Json<Vec<Transaction>>> {
    Ok(Json(state.service.engine().list_transactions(state.owner())?))
}

/// `POST /api/process-transaction` - apply the owner's leg of a
/// transaction that arrived outside the peer transport.
async fn process_transaction(
    State(state): State<DeviceState>,
    Json(req): Json<ProcessTransactionRequest>,
) -> ApiResult<impl IntoResponse> {
    match state.service.engine().apply(&req.transaction) {
        Ok(outcome) => {
            if !outcome.replayed {
                state.metrics.payments_applied_total.inc();
                state.trigger.notify();
            }
            Ok(Json(json!({
                "success": true,
                "sequence": outcome.sequence,
                "replayed": outcome.replayed,
            })))
        }
        Err(e) => {
            state.metrics.record_rejection(e.kind());
            Err(e.into())
        }
    }
}

/// `POST /api/send` - debit the owner and hand the payment to the peer
/// transport. An undelivered payment still returns 200: the debit stands.
async fn send_payment(
    State(state): State<DeviceState>,
    Json(req): Json<SendRequest>,
) -> ApiResult<impl IntoResponse> {
    match state.service.send_payment(req.receiver_id, req.amount).await {
        Ok(sent) => {
            state.metrics.payments_applied_total.inc();
            Ok(Json(json!({
                "success": true,
                "delivered": sent.delivered(),
                "deliveryError": sent.delivery_error.map(|e| e.to_string()),
                "transaction": sent.transaction,
            })))
        }
        Err(e) => {
            state.metrics.record_rejection(e.kind());
            Err(e.into())
        }
    }
}

/// `POST /api/sync` - run a sync now and report what the authority said.
///
/// An unreachable authority is not an HTTP error; the entries simply stay
/// pending.
async fn sync_now(State(state): State<DeviceState>) -> ApiResult<impl IntoResponse> {
    let started = Instant::now();
    let outcome = state.reconciler.sync().await?;
    state
        .metrics
        .sync_duration_seconds
        .observe(started.elapsed().as_secs_f64());
    state.metrics.record_sync(&outcome);
    state.refresh_gauges();

    let body = if outcome.unreachable {
        json!({ "success": false, "error": "Central server unreachable" })
    } else if outcome.is_empty() {
        json!({ "success": true, "message": "No transactions to sync", "synced": 0 })
    } else {
        json!({
            "success": true,
            "synced": outcome.synced.len(),
            "rejected": outcome.failed.len(),
            "syncedIds": outcome.synced,
            "rejectedIds": outcome.failed,
        })
    };
    Ok(Json(body))
}

async fn reset_sync(State(state): State<DeviceState>) -> ApiResult<impl IntoResponse> {
    state.reconciler.reset_cursor()?;
    tracing::info!("sync cursor reset");
    Ok(Json(json!({ "success": true, "cursor": 0 })))
}

async fn list_peers(State(state): State<DeviceState>) -> impl IntoResponse {
    let mut peers = state.peers.registry().devices();
    peers.sort();
    Json(json!({ "peers": peers }))
}

/// `POST /api/peers` - connect to a peer at `address` (`host:port`).
async fn dial_peer(
    State(state): State<DeviceState>,
    Json(req): Json<DialRequest>,
) -> ApiResult<impl IntoResponse> {
    let addr: SocketAddr = req
        .address
        .parse()
        .map_err(|e| ApiError::Validation(format!("invalid peer address {}: {}", req.address, e)))?;
    state
        .peers
        .dial(addr)
        .await
        .map_err(|e| ApiError::Transport(format!("{:#}", e)))?;
    Ok(Json(json!({ "status": "connected", "address": addr.to_string() })))
}

async fn confirmations(State(state): State<DeviceState>) -> impl IntoResponse {
    Json(state.service.recent_confirmations())
}

async fn device_metrics(State(state): State<DeviceState>) -> Response {
    state.refresh_gauges();
    metrics::render(&state.metrics)
}

// ---------------------------------------------------------------------------
// Authority Handlers
// ---------------------------------------------------------------------------

async fn authority_health(State(state): State<AuthorityState>) -> impl IntoResponse {
    Json(json!({ "status": "ok", "role": "authority", "version": state.version }))
}

/// `POST /api/users` - open an account with the initial balance. Opening
/// an existing account leaves it untouched.
async fn create_user(
    State(state): State<AuthorityState>,
    Json(req): Json<CreateUserRequest>,
) -> ApiResult<impl IntoResponse> {
    let account = state.authority.create_user(&req.id)?;
    tracing::info!(device = %account.id, balance = %account.balance, "user initialized");
    Ok(Json(json!({ "message": "User initialized", "account": account })))
}

async fn authority_balance(
    Path(id): Path<String>,
    State(state): State<AuthorityState>,
) -> ApiResult<Json<Account>> {
    let id = DeviceId::new(id);
    let balance = state.authority.engine().balance(&id)?;
    Ok(Json(Account::new(id, balance)))
}

/// `POST /api/transactions` - apply one transaction to the canonical
/// ledger outside of a sync batch.
async fn authority_apply(
    State(state): State<AuthorityState>,
    Json(tx): Json<Transaction>,
) -> ApiResult<impl IntoResponse> {
    match state.authority.apply(&tx) {
        Ok(outcome) => {
            if !outcome.replayed {
                state.metrics.payments_applied_total.inc();
            }
            Ok(Json(json!({
                "message": "Transaction processed",
                "sequence": outcome.sequence,
                "replayed": outcome.replayed,
            })))
        }
        Err(e) => {
            state.metrics.record_rejection(e.kind());
            Err(e.into())
        }
    }
}

async fn authority_transactions(
    Path(id): Path<String>,
    State(state): State<AuthorityState>,
) -> ApiResult<Json<Vec<Transaction>>> {
    let id = DeviceId::new(id);
    if state.authority.account(&id)?.is_none() {
        return Err(ApiError::NotFound(format!("unknown account: {}", id)));
    }
    Ok(Json(state.authority.engine().list_transactions(&id)?))
}

async fn authority_sync(
    State(state): State<AuthorityState>,
    Json(request): Json<SyncRequest>,
) -> ApiResult<impl IntoResponse> {
    let judgement = state.authority.judge(&request)?;
    let response = judgement.response;
    state
        .metrics
        .payments_applied_total
        .inc_by(judgement.newly_applied as u64);
    state
        .metrics
        .authority_rejected_total
        .inc_by(response.rejected_ids.len() as u64);
    state.metrics.sync_runs_total.inc();
    Ok(Json(response))
}

async fn authority_metrics(State(state): State<AuthorityState>) -> Response {
    metrics::render(&state.metrics)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tally_ledger::config::{LedgerLimits, SyncConfig};
    use tally_ledger::{LedgerDB, LedgerEngine, Perspective, SessionRegistry, TransactionId};
    use tokio::sync::watch;
    use tower::ServiceExt;

    use crate::metrics::NodeMetrics;

    fn test_authority_state() -> AuthorityState {
        AuthorityState {
            version: "0.1.0-test".into(),
            authority: Arc::new(Authority::new(
                LedgerDB::open_temporary().expect("temp db"),
                LedgerLimits::default(),
            )),
            metrics: Arc::new(NodeMetrics::new().unwrap()),
        }
    }

    /// A device named `owner` whose authority is `authority`, in process.
    fn test_device_state(owner: &str, authority: Arc<Authority>) -> DeviceState {
        let owner = DeviceId::new(owner);
        let engine = Arc::new(LedgerEngine::new(
            LedgerDB::open_temporary().expect("temp db"),
            Perspective::Device(owner.clone()),
            LedgerLimits::default(),
        ));
        engine.ensure_account(&owner).unwrap();

        let registry = Arc::new(SessionRegistry::new());
        let trigger = SyncTrigger::new();
        let metrics = Arc::new(NodeMetrics::new().unwrap());
        let service = Arc::new(PaymentService::new(
            owner.clone(),
            engine.clone(),
            registry.clone(),
            trigger.clone(),
        ));
        let reconciler = Arc::new(SyncReconciler::new(
            engine,
            authority,
            owner,
            &SyncConfig::default(),
        ));
        // The sender is dropped at once; nothing in these tests listens.
        let (_, shutdown) = watch::channel(false);
        let peers = PeerNetwork::new(registry, service.clone(), metrics.clone(), shutdown);

        DeviceState {
            version: "0.1.0-test".into(),
            service,
            reconciler,
            peers,
            trigger,
            metrics,
        }
    }

    fn tx_json(id: &str, from: &str, to: &str, amount: i64) -> serde_json::Value {
        json!({
            "id": id,
            "senderId": from,
            "receiverId": to,
            "amount": amount,
            "timestamp": "2026-01-01T00:00:00Z",
        })
    }

    /// Sends a GET request and returns the (status, body_bytes).
    async fn get(router: &Router, path: &str) -> (StatusCode, Vec<u8>) {
        let req = Request::builder().uri(path).body(Body::empty()).unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .unwrap()
            .to_bytes()
            .to_vec();
        (status, body)
    }

    /// Sends a POST request with JSON body and returns (status, body_bytes).
    async fn post_json(
        router: &Router,
        path: &str,
        body: serde_json::Value,
    ) -> (StatusCode, Vec<u8>) {
        let req = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .unwrap()
            .to_bytes()
            .to_vec();
        (status, body)
    }

    fn json_of(body: &[u8]) -> serde_json::Value {
        serde_json::from_slice(body).unwrap()
    }

    // -- 1. Health endpoints ---------------------------------------------------

    #[tokio::test]
    async fn health_endpoints_return_ok() {
        let authority = test_authority_state();
        let device = create_device_router(test_device_state("alice", authority.authority.clone()));
        let authority = create_authority_router(authority);

        for (router, role) in [(&device, "device"), (&authority, "authority")] {
            let (status, body) = get(router, "/health").await;
            assert_eq!(status, StatusCode::OK);
            let json = json_of(&body);
            assert_eq!(json["status"], "ok");
            assert_eq!(json["role"], role);
        }
    }

    // -- 2. Device id and opening balance --------------------------------------

    #[tokio::test]
    async fn device_reports_id_and_initial_balance() {
        let authority = test_authority_state();
        let router = create_device_router(test_device_state("alice", authority.authority));

        let (_, body) = get(&router, "/device-id").await;
        assert_eq!(json_of(&body)["deviceId"], "alice");

        let (status, body) = get(&router, "/api/balance").await;
        assert_eq!(status, StatusCode::OK);
        let json = json_of(&body);
        assert_eq!(json["id"], "alice");
        assert_eq!(json["balance"], "1000");
    }

    // -- 3. Processing a debit lowers the balance and lists the entry ----------

    #[tokio::test]
    async fn process_transaction_applies_owner_leg() {
        let authority = test_authority_state();
        let router = create_device_router(test_device_state("alice", authority.authority));

        let (status, body) = post_json(
            &router,
            "/api/process-transaction",
            json!({ "transaction": tx_json("t1", "alice", "bob", 200) }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_of(&body)["success"], true);

        let (_, body) = get(&router, "/api/balance").await;
        assert_eq!(json_of(&body)["balance"], "800");

        let (_, body) = get(&router, "/api/transactions").await;
        let list = json_of(&body);
        assert_eq!(list.as_array().unwrap().len(), 1);
        assert_eq!(list[0]["id"], "t1");
        assert_eq!(list[0]["syncState"], "pending");
    }

    // -- 4. Overspend is a 400 validation error --------------------------------

    #[tokio::test]
    async fn overspend_returns_validation_error() {
        let authority = test_authority_state();
        let state = test_device_state("alice", authority.authority);
        let metrics = state.metrics.clone();
        let router = create_device_router(state);

        let (status, body) = post_json(
            &router,
            "/api/process-transaction",
            json!({ "transaction": tx_json("t1", "alice", "bob", 1_500) }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let json = json_of(&body);
        assert_eq!(json["type"], "validation");
        assert!(json["error"].as_str().unwrap().contains("insufficient balance"));
        assert_eq!(
            metrics
                .payments_rejected_total
                .with_label_values(&["InsufficientBalance"])
                .get(),
            1
        );

        let (_, body) = get(&router, "/api/balance").await;
        assert_eq!(json_of(&body)["balance"], "1000");
    }

    // -- 5. Replayed transaction is accepted once ------------------------------

    #[tokio::test]
    async fn process_transaction_is_idempotent() {
        let authority = test_authority_state();
        let router = create_device_router(test_device_state("bob", authority.authority));
        let body = json!({ "transaction": tx_json("t1", "alice", "bob", 200) });

        let (_, first) = post_json(&router, "/api/process-transaction", body.clone()).await;
        let (status, second) = post_json(&router, "/api/process-transaction", body).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_of(&first)["replayed"], false);
        assert_eq!(json_of(&second)["replayed"], true);
        let (_, balance) = get(&router, "/api/balance").await;
        assert_eq!(json_of(&balance)["balance"], "1200");
    }

    // -- 6. Send without a session still debits --------------------------------

    #[tokio::test]
    async fn send_without_peer_keeps_debit() {
        let authority = test_authority_state();
        let router = create_device_router(test_device_state("alice", authority.authority));

        let (status, body) = post_json(
            &router,
            "/api/send",
            json!({ "receiverId": "bob", "amount": "250" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let json = json_of(&body);
        assert_eq!(json["delivered"], false);
        assert!(json["deliveryError"].as_str().unwrap().contains("bob"));

        let (_, body) = get(&router, "/api/balance").await;
        assert_eq!(json_of(&body)["balance"], "750");
    }

    // -- 7. Sync with nothing pending ------------------------------------------

    #[tokio::test]
    async fn sync_with_nothing_pending() {
        let authority = test_authority_state();
        let router = create_device_router(test_device_state("alice", authority.authority));

        let (status, body) = post_json(&router, "/api/sync", json!({})).await;
        assert_eq!(status, StatusCode::OK);
        let json = json_of(&body);
        assert_eq!(json["success"], true);
        assert_eq!(json["message"], "No transactions to sync");
    }

    // -- 8. Sync settles pending entries and the authority agrees --------------

    #[tokio::test]
    async fn sync_settles_with_authority() {
        let authority_state = test_authority_state();
        let authority = create_authority_router(authority_state.clone());
        let state = test_device_state("alice", authority_state.authority.clone());
        let metrics = state.metrics.clone();
        let device = create_device_router(state);

        post_json(
            &device,
            "/api/process-transaction",
            json!({ "transaction": tx_json("t1", "alice", "bob", 200) }),
        )
        .await;

        let (status, body) = post_json(&device, "/api/sync", json!({})).await;
        assert_eq!(status, StatusCode::OK);
        let json = json_of(&body);
        assert_eq!(json["synced"], 1);
        assert_eq!(json["rejected"], 0);
        assert_eq!(metrics.synced_total.get(), 1);
        assert_eq!(metrics.pending_transactions.get(), 0);

        let (_, body) = get(&device, "/api/transactions").await;
        assert_eq!(json_of(&body)[0]["syncState"], "synced");

        let (_, body) = get(&authority, "/api/balance/alice").await;
        assert_eq!(json_of(&body)["balance"], "800");
        let (_, body) = get(&authority, "/api/balance/bob").await;
        assert_eq!(json_of(&body)["balance"], "1200");
    }

    // -- 9. Peers start empty; a bad address is rejected -----------------------

    #[tokio::test]
    async fn peers_listing_and_bad_dial() {
        let authority = test_authority_state();
        let router = create_device_router(test_device_state("alice", authority.authority));

        let (_, body) = get(&router, "/api/peers").await;
        assert_eq!(json_of(&body)["peers"], json!([]));

        let (status, body) =
            post_json(&router, "/api/peers", json!({ "address": "not an address" })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json_of(&body)["type"], "validation");
    }

    // -- 10. Device metrics are exposed ----------------------------------------

    #[tokio::test]
    async fn device_metrics_expose_pending_gauge() {
        let authority = test_authority_state();
        let router = create_device_router(test_device_state("alice", authority.authority));
        post_json(
            &router,
            "/api/process-transaction",
            json!({ "transaction": tx_json("t1", "alice", "bob", 10) }),
        )
        .await;

        let (status, body) = get(&router, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("tally_pending_transactions 1"));
        assert!(text.contains("tally_payments_applied_total 1"));
    }

    // -- 11. Authority user creation and unknown balances ----------------------

    #[tokio::test]
    async fn authority_creates_users() {
        let router = create_authority_router(test_authority_state());

        let (_, body) = get(&router, "/api/balance/carol").await;
        assert_eq!(json_of(&body)["balance"], "0");

        let (status, body) = post_json(&router, "/api/users", json!({ "id": "carol" })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_of(&body)["message"], "User initialized");

        let (_, body) = get(&router, "/api/balance/carol").await;
        assert_eq!(json_of(&body)["balance"], "1000");
    }

    // -- 12. Authority single apply and history --------------------------------

    #[tokio::test]
    async fn authority_applies_single_transaction() {
        let router = create_authority_router(test_authority_state());

        let (status, _) =
            post_json(&router, "/api/transactions", tx_json("t1", "alice", "bob", 300)).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) =
            post_json(&router, "/api/transactions", tx_json("t2", "alice", "bob", 900)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json_of(&body)["type"], "validation");

        let (status, body) = get(&router, "/api/transactions/bob").await;
        assert_eq!(status, StatusCode::OK);
        let list = json_of(&body);
        assert_eq!(list.as_array().unwrap().len(), 1);
        assert_eq!(list[0]["syncState"], "synced");

        let (status, body) = get(&router, "/api/transactions/nobody").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json_of(&body)["type"], "not_found");
    }

    // -- 13. Authority sync judges each entry ----------------------------------

    #[tokio::test]
    async fn authority_sync_returns_verdicts() {
        let router = create_authority_router(test_authority_state());

        let (status, body) = post_json(
            &router,
            "/api/sync",
            json!({
                "deviceId": "alice",
                "transactions": [
                    tx_json("ok", "alice", "bob", 600),
                    tx_json("over", "alice", "bob", 600),
                    tx_json("foreign", "carol", "bob", 10),
                ],
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let json = json_of(&body);
        assert_eq!(json["success"], true);
        assert_eq!(json["acceptedIds"], json!(["ok"]));
        assert_eq!(json["rejectedIds"], json!(["over", "foreign"]));

        let ids: Vec<TransactionId> =
            serde_json::from_value(json["acceptedIds"].clone()).unwrap();
        assert_eq!(ids, vec![TransactionId::new("ok")]);
    }

    // -- 14. Both parties syncing one transfer count it once -------------------

    #[tokio::test]
    async fn authority_sync_counts_replays_once() {
        let state = test_authority_state();
        let metrics = state.metrics.clone();
        let router = create_authority_router(state);

        for device in ["alice", "bob"] {
            let (status, body) = post_json(
                &router,
                "/api/sync",
                json!({
                    "deviceId": device,
                    "transactions": [tx_json("t1", "alice", "bob", 250)],
                }),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(json_of(&body)["acceptedIds"], json!(["t1"]));
        }

        assert_eq!(metrics.payments_applied_total.get(), 1);
        assert_eq!(metrics.sync_runs_total.get(), 2);
    }

    // -- 15. A refused transfer stays refused on the single-apply route --------

    #[tokio::test]
    async fn authority_apply_repeats_earlier_rejection() {
        let router = create_authority_router(test_authority_state());

        let (status, _) =
            post_json(&router, "/api/transactions", tx_json("big", "alice", "bob", 1_500)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) =
            post_json(&router, "/api/transactions", tx_json("gift", "carol", "alice", 800)).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) =
            post_json(&router, "/api/transactions", tx_json("big", "alice", "bob", 1_500)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json_of(&body)["type"], "validation");
    }
}
