use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vaultsync_api::{
    ImportResult, MigrateResult, PreviewResult, TransactionResult, VaultSyncApi, VaultSyncConfig,
    API_CONTRACT_VERSION,
};
use vaultsync_core::{Container, ContainerId, OperationToken, OwnerId, ReconcileError, TransferKind};
use vaultsync_store_sqlite::{SchemaStatus, TransferLogEntry};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");
const OWNER_HEADER: &str = "x-owner-id";

#[derive(Debug, Clone)]
struct ServiceState {
    api: VaultSyncApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct CreateContainerRequest {
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ConfirmRequest {
    token: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "vaultsync-service")]
#[command(about = "Local HTTP service for VaultSync inventory transfers")]
struct Args {
    #[arg(long, default_value = "./vaultsync.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    /// Seconds a previewed transfer stays redeemable.
    #[arg(long, default_value_t = vaultsync_api::DEFAULT_PENDING_TTL_SECS)]
    pending_ttl_secs: i64,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, service_contract_version: SERVICE_CONTRACT_VERSION, error: message.into() }
    }

    fn from_reconcile(err: &ReconcileError) -> Self {
        let status = match err {
            ReconcileError::MalformedSnapshot(_) | ReconcileError::Validation(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ReconcileError::OperationNotFound(_) => StatusCode::NOT_FOUND,
            ReconcileError::Unauthorized(_) => StatusCode::FORBIDDEN,
            ReconcileError::TransactionFailure(_) | ReconcileError::InvalidTransition { .. } => {
                StatusCode::BAD_REQUEST
            }
        };
        Self::new(status, err.to_string())
    }

    fn from_api(err: &anyhow::Error) -> Self {
        match err.downcast_ref::<ReconcileError>() {
            Some(reconcile) => Self::from_reconcile(reconcile),
            None => Self::new(StatusCode::BAD_REQUEST, err.to_string()),
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn owner_from(headers: &HeaderMap) -> Result<OwnerId, ServiceError> {
    headers
        .get(OWNER_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| OwnerId::parse(value).ok())
        .ok_or_else(|| {
            ServiceError::new(StatusCode::UNAUTHORIZED, format!("missing {OWNER_HEADER} header"))
        })
}

fn container_from(raw: &str) -> Result<ContainerId, ServiceError> {
    ContainerId::from_str(raw).map_err(|err| ServiceError::from_reconcile(&err))
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/containers", get(containers_list).post(containers_create))
        .route("/v1/inventory/import", post(inventory_import))
        .route("/v1/containers/:container_id/deposit/preview", post(deposit_preview))
        .route("/v1/containers/:container_id/deposit/confirm", post(deposit_confirm))
        .route("/v1/containers/:container_id/withdraw/preview", post(withdraw_preview))
        .route("/v1/containers/:container_id/withdraw/confirm", post(withdraw_confirm))
        .route("/v1/containers/:container_id/history", get(container_history))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = VaultSyncConfig {
        db_path: args.db,
        pending_ttl: Duration::seconds(args.pending_ttl_secs),
    };
    let state = ServiceState { api: VaultSyncApi::new(config) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(bind = %args.bind, "vaultsync service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status().map_err(|err| ServiceError::from_api(&err))?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let result = state.api.migrate(request.dry_run).map_err(|err| ServiceError::from_api(&err))?;
    Ok(Json(envelope(result)))
}

async fn containers_list(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<Vec<Container>>>, ServiceError> {
    let owner = owner_from(&headers)?;
    let containers = state.api.list_containers(&owner).map_err(|err| ServiceError::from_api(&err))?;
    Ok(Json(envelope(containers)))
}

async fn containers_create(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<CreateContainerRequest>,
) -> Result<Json<ServiceEnvelope<Container>>, ServiceError> {
    let owner = owner_from(&headers)?;
    let container = state
        .api
        .create_container(&owner, &request.name)
        .map_err(|err| ServiceError::from_api(&err))?;
    Ok(Json(envelope(container)))
}

async fn inventory_import(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    snapshot_text: String,
) -> Result<Json<ServiceEnvelope<ImportResult>>, ServiceError> {
    let owner = owner_from(&headers)?;
    let result = state
        .api
        .import_inventory(&owner, &snapshot_text)
        .map_err(|err| ServiceError::from_api(&err))?;
    Ok(Json(envelope(result)))
}

fn preview(
    state: &ServiceState,
    raw_container_id: &str,
    headers: &HeaderMap,
    snapshot_text: &str,
    kind: TransferKind,
) -> Result<Json<ServiceEnvelope<PreviewResult>>, ServiceError> {
    let owner = owner_from(headers)?;
    let container_id = container_from(raw_container_id)?;
    let result = state
        .api
        .prepare_preview(&owner, container_id, snapshot_text, kind)
        .map_err(|err| ServiceError::from_api(&err))?;
    Ok(Json(envelope(result)))
}

fn confirm(
    state: &ServiceState,
    raw_container_id: &str,
    headers: &HeaderMap,
    request: &ConfirmRequest,
    kind: TransferKind,
) -> Result<Json<ServiceEnvelope<TransactionResult>>, ServiceError> {
    let owner = owner_from(headers)?;
    let container_id = container_from(raw_container_id)?;
    let token = OperationToken::from_str(request.token.trim())
        .map_err(|err| ServiceError::from_reconcile(&err))?;
    let result = state
        .api
        .execute(&owner, container_id, kind, token)
        .map_err(|err| ServiceError::from_api(&err))?;
    Ok(Json(envelope(result)))
}

async fn deposit_preview(
    State(state): State<ServiceState>,
    Path(container_id): Path<String>,
    headers: HeaderMap,
    snapshot_text: String,
) -> Result<Json<ServiceEnvelope<PreviewResult>>, ServiceError> {
    preview(&state, &container_id, &headers, &snapshot_text, TransferKind::Deposit)
}

async fn deposit_confirm(
    State(state): State<ServiceState>,
    Path(container_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<ConfirmRequest>,
) -> Result<Json<ServiceEnvelope<TransactionResult>>, ServiceError> {
    confirm(&state, &container_id, &headers, &request, TransferKind::Deposit)
}

async fn withdraw_preview(
    State(state): State<ServiceState>,
    Path(container_id): Path<String>,
    headers: HeaderMap,
    snapshot_text: String,
) -> Result<Json<ServiceEnvelope<PreviewResult>>, ServiceError> {
    preview(&state, &container_id, &headers, &snapshot_text, TransferKind::Withdraw)
}

async fn withdraw_confirm(
    State(state): State<ServiceState>,
    Path(container_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<ConfirmRequest>,
) -> Result<Json<ServiceEnvelope<TransactionResult>>, ServiceError> {
    confirm(&state, &container_id, &headers, &request, TransferKind::Withdraw)
}

async fn container_history(
    State(state): State<ServiceState>,
    Path(container_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<Vec<TransferLogEntry>>>, ServiceError> {
    let owner = owner_from(&headers)?;
    let container_id = container_from(&container_id)?;
    let history = state
        .api
        .container_history(&owner, container_id)
        .map_err(|err| ServiceError::from_api(&err))?;
    Ok(Json(envelope(history)))
}
