//! REST surface for the remittance release core.
//!
//! The composition root lives here: KMS backend, rail provider stack
//! (mock/real/shadow wrapped by the resilient dispatcher), and the
//! release engine are built once at bootstrap and shared behind the
//! router state.

#![deny(unsafe_code)]

use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use remit_core::{
    AnomalyThresholds, CloseInputs, EngineConfig, IdempotencyStore, KmsProvider, LocalKms,
    MtlsMaterial, PeriodKey, ReleaseOutcome, ReleaseRequest, RemitEngine, RemitError, RemoteKms,
    TaxType,
};
use remit_rails::{
    CircuitBreaker, CircuitBreakerConfig, DispatcherConfig, HttpRail, HttpRailConfig, MockRail,
    RailDispatcher, ShadowRail,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

const IDEMPOTENCY_HEADER: &str = "idempotency-key";

/// Which KMS backend signs and verifies release tokens.
#[derive(Debug, Clone)]
pub enum KmsBackendConfig {
    Local {
        key_id: String,
        /// Hex seed from configuration; `None` generates an ephemeral
        /// key, which only makes sense for development and dry-run.
        seed_hex: Option<String>,
    },
    Remote {
        key_id: String,
        base_url: String,
        mtls: Option<MtlsMaterial>,
        timeout: Duration,
    },
    Cloud {
        key_resource: String,
        endpoint: String,
        api_token: String,
        timeout: Duration,
    },
}

/// Which provider stack backs the rail dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RailMode {
    Mock,
    Real,
    /// Real primary with the mock shadowing it for divergence logging.
    Shadow,
}

#[derive(Debug, Clone)]
pub struct RailStackConfig {
    pub mode: RailMode,
    pub http: Option<HttpRailConfig>,
    pub breaker: CircuitBreakerConfig,
    pub dispatcher: DispatcherConfig,
}

pub struct ServiceConfig {
    pub engine: EngineConfig,
    pub kms: KmsBackendConfig,
    pub rails: RailStackConfig,
}

#[derive(Clone)]
pub struct ServiceState {
    pub engine: Arc<RemitEngine>,
}

impl ServiceState {
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, ServiceError> {
        let kms = build_kms(config.kms)?;
        let rail = build_rail_stack(config.rails)?;
        let engine = RemitEngine::bootstrap(config.engine, rail, kms).await?;
        Ok(Self {
            engine: Arc::new(engine),
        })
    }
}

fn build_kms(config: KmsBackendConfig) -> Result<Arc<dyn KmsProvider>, ServiceError> {
    match config {
        KmsBackendConfig::Local { key_id, seed_hex } => match seed_hex {
            Some(seed) => Ok(Arc::new(LocalKms::from_hex_seed(key_id, &seed)?)),
            None => {
                warn!("no KMS seed configured; generating an ephemeral signing key");
                Ok(Arc::new(LocalKms::generate(key_id)))
            }
        },
        KmsBackendConfig::Remote {
            key_id,
            base_url,
            mtls,
            timeout,
        } => Ok(Arc::new(RemoteKms::new(
            key_id,
            base_url,
            mtls.as_ref(),
            timeout,
        )?)),
        KmsBackendConfig::Cloud {
            key_resource,
            endpoint,
            api_token,
            timeout,
        } => Ok(Arc::new(remit_core::CloudKms::new(
            key_resource,
            endpoint,
            &api_token,
            timeout,
        )?)),
    }
}

fn build_rail_stack(
    config: RailStackConfig,
) -> Result<Arc<dyn remit_core::RailProvider>, ServiceError> {
    let provider: Arc<dyn remit_core::RailProvider> = match config.mode {
        RailMode::Mock => Arc::new(MockRail),
        RailMode::Real => {
            let http = config.http.clone().ok_or_else(|| {
                ServiceError::Config("rail mode 'real' requires a rail base url".to_string())
            })?;
            Arc::new(HttpRail::new(http)?)
        }
        RailMode::Shadow => {
            let http = config.http.clone().ok_or_else(|| {
                ServiceError::Config("rail mode 'shadow' requires a rail base url".to_string())
            })?;
            Arc::new(ShadowRail::new(
                Arc::new(HttpRail::new(http)?),
                Arc::new(MockRail),
            ))
        }
    };

    let endpoint = config
        .http
        .as_ref()
        .map(|http| http.base_url.clone())
        .unwrap_or_else(|| "mock".to_string());
    let breaker = Arc::new(CircuitBreaker::new(endpoint, config.breaker));
    Ok(Arc::new(RailDispatcher::new(
        provider,
        breaker,
        config.dispatcher,
    )))
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/periods", post(open_period))
        .route("/v1/periods/:abn/:tax_type/:period_id", get(get_period))
        .route(
            "/v1/periods/:abn/:tax_type/:period_id/close",
            post(close_period),
        )
        .route(
            "/v1/periods/:abn/:tax_type/:period_id/reevaluate",
            post(reevaluate_period),
        )
        .route("/v1/deposits", post(deposit))
        .route("/v1/release", post(release))
        .route(
            "/v1/ledger/:abn/:tax_type/:period_id/entries",
            get(ledger_entries),
        )
        .route(
            "/v1/ledger/:abn/:tax_type/:period_id/proof",
            get(ledger_proof),
        )
        .route("/v1/rpt/:abn/:tax_type/:period_id", get(get_rpt))
        .route("/v1/recon/statement", post(ingest_statement))
        .route("/v1/recon/settlement", post(ingest_settlement))
        .route("/v1/recon/unresolved", get(unresolved_lines))
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("core engine error: {0}")]
    Core(#[from] RemitError),
    #[error("service configuration error: {0}")]
    Config(String),
}

/// API error envelope: core errors carry their HTTP-style status.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ApiError(#[from] RemitError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (
            status,
            Json(serde_json::json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

fn parse_key(abn: String, tax_type: String, period_id: String) -> Result<PeriodKey, ApiError> {
    let tax_type = TaxType::parse(&tax_type).ok_or_else(|| {
        ApiError(RemitError::Validation(format!(
            "unknown tax type '{tax_type}'"
        )))
    })?;
    Ok(PeriodKey::new(abn, tax_type, period_id))
}

#[derive(Debug, serde::Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "remitd",
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenPeriodRequest {
    abn: String,
    tax_type: TaxType,
    period_id: String,
    #[serde(default)]
    thresholds: Option<AnomalyThresholds>,
}

async fn open_period(
    State(state): State<ServiceState>,
    Json(request): Json<OpenPeriodRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let key = PeriodKey::new(request.abn, request.tax_type, request.period_id);
    let period = state
        .engine
        .open_period(key, request.thresholds.unwrap_or_default())
        .await?;
    Ok((StatusCode::CREATED, Json(period)))
}

async fn get_period(
    State(state): State<ServiceState>,
    Path((abn, tax_type, period_id)): Path<(String, String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let key = parse_key(abn, tax_type, period_id)?;
    Ok(Json(state.engine.period(&key).await?))
}

async fn close_period(
    State(state): State<ServiceState>,
    Path((abn, tax_type, period_id)): Path<(String, String, String)>,
    Json(inputs): Json<CloseInputs>,
) -> Result<impl IntoResponse, ApiError> {
    let key = parse_key(abn, tax_type, period_id)?;
    Ok(Json(state.engine.close_period(&key, inputs).await?))
}

async fn reevaluate_period(
    State(state): State<ServiceState>,
    Path((abn, tax_type, period_id)): Path<(String, String, String)>,
    Json(inputs): Json<CloseInputs>,
) -> Result<impl IntoResponse, ApiError> {
    let key = parse_key(abn, tax_type, period_id)?;
    Ok(Json(state.engine.reevaluate(&key, inputs).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DepositRequest {
    abn: String,
    tax_type: TaxType,
    period_id: String,
    amount_cents: i64,
    bank_receipt_id: String,
}

async fn deposit(
    State(state): State<ServiceState>,
    Json(request): Json<DepositRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let key = PeriodKey::new(request.abn, request.tax_type, request.period_id);
    let entry = state
        .engine
        .deposit(&key, request.amount_cents, &request.bank_receipt_id)
        .await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

/// Release endpoint. The idempotency key resolves header-first, then
/// body, then a content-derived fallback; whichever key was used is
/// echoed back on every response, including errors.
async fn release(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(mut request): Json<ReleaseRequest>,
) -> Response {
    if request.idempotency_key.is_none() {
        if let Some(header_key) = headers
            .get(IDEMPOTENCY_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            request.idempotency_key = Some(header_key.to_string());
        }
    }
    let effective_key = request.idempotency_key.clone().unwrap_or_else(|| {
        IdempotencyStore::derive_key(
            &request.abn,
            request.tax_type.as_str(),
            &request.period_id,
            request.amount_cents,
        )
    });
    request.idempotency_key = Some(effective_key.clone());

    let response = match state.engine.release(request).await {
        Ok(ReleaseOutcome::Completed(body)) => (StatusCode::OK, Json(body)).into_response(),
        Ok(ReleaseOutcome::Replayed(record)) => {
            let status = StatusCode::from_u16(record.http_status)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(record.response_body)).into_response()
        }
        Err(err) => ApiError(err).into_response(),
    };
    with_idempotency_header(response, &effective_key)
}

fn with_idempotency_header(mut response: Response, key: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(key) {
        response.headers_mut().insert(IDEMPOTENCY_HEADER, value);
    }
    response
}

async fn ledger_entries(
    State(state): State<ServiceState>,
    Path((abn, tax_type, period_id)): Path<(String, String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let key = parse_key(abn, tax_type, period_id)?;
    Ok(Json(state.engine.ledger_entries(&key).await?))
}

async fn ledger_proof(
    State(state): State<ServiceState>,
    Path((abn, tax_type, period_id)): Path<(String, String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let key = parse_key(abn, tax_type, period_id)?;
    Ok(Json(state.engine.ledger_proof(&key).await?))
}

async fn get_rpt(
    State(state): State<ServiceState>,
    Path((abn, tax_type, period_id)): Path<(String, String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let key = parse_key(abn, tax_type, period_id)?;
    let view = state.engine.period(&key).await?;
    let token = view
        .rpt
        .ok_or_else(|| ApiError(RemitError::NotFound(format!("no token issued for {key}"))))?;
    Ok(Json(token))
}

async fn ingest_statement(
    State(state): State<ServiceState>,
    body: String,
) -> Result<impl IntoResponse, ApiError> {
    let report = state.engine.ingest_statement(body.as_bytes()).await?;
    info!(
        ingested = report.ingested,
        matched = report.matched,
        unresolved = report.unresolved,
        "statement file ingested"
    );
    Ok(Json(report))
}

async fn ingest_settlement(
    State(state): State<ServiceState>,
    body: String,
) -> Result<impl IntoResponse, ApiError> {
    let report = state.engine.ingest_settlement(body.as_bytes()).await?;
    info!(
        applied = report.applied_rows,
        duplicates = report.duplicate_components,
        rejected = report.rejected_rows,
        "settlement file ingested"
    );
    Ok(Json(report))
}

async fn unresolved_lines(State(state): State<ServiceState>) -> impl IntoResponse {
    Json(state.engine.unresolved_lines().await)
}
