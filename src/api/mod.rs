use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::warn;
use uuid::Uuid;

use crate::backtest::BacktestConfig;
use crate::error::PricingError;
use crate::service::{CycleReport, PricingService};
use crate::store::models::{
    FeatureSnapshot, FixtureContext, LineupConfirmation, Market, OddsSnapshot, PlayerResult,
    PricingOutput,
};

#[derive(Clone)]
pub struct AppState {
    pub service: PricingService,
}

type ApiError = (StatusCode, String);

fn status_for(err: &PricingError) -> StatusCode {
    match err {
        PricingError::UnknownFixture(_) | PricingError::UnknownDecision(_) => StatusCode::NOT_FOUND,
        PricingError::DecisionNotOpen(_) | PricingError::InvalidPhaseTransition { .. } => {
            StatusCode::CONFLICT
        }
        PricingError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
        PricingError::CriticalDataMissing { .. }
        | PricingError::DataStale { .. }
        | PricingError::IncompleteMarket { .. }
        | PricingError::MarginOutOfRange { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(err: PricingError) -> ApiError {
    (status_for(&err), err.to_string())
}

/// Build the Axum router for the pricing interface.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/pricing/:fixture_id/:player_id", get(pricing_handler))
        .route("/api/fixtures", post(fixture_handler))
        .route("/api/fixtures/:fixture_id/lineup", post(lineup_handler))
        .route("/api/fixtures/:fixture_id/outputs", get(outputs_handler))
        .route("/api/fixtures/:fixture_id/decisions", get(decisions_handler))
        .route("/api/fixtures/:fixture_id/exposure", get(exposure_handler))
        .route("/api/fixtures/:fixture_id/overrides", delete(clear_overrides_handler))
        .route("/api/snapshots/features", post(features_handler))
        .route("/api/snapshots/odds", post(odds_handler))
        .route("/api/results", post(result_handler))
        .route("/api/decisions/:decision_id/execute", post(execute_handler))
        .route("/api/calibration/:market/recalibrate", post(recalibrate_handler))
        .route("/api/backtest", post(backtest_handler))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
pub struct PricingQuery {
    #[serde(default = "default_market")]
    pub market: Market,
    /// Operator team-xG total for the player's team
    pub team_xg: Option<f64>,
    /// Pricing instant; now when absent
    pub at: Option<DateTime<Utc>>,
}

fn default_market() -> Market {
    Market::AnytimeGoalscorer
}

/// GET /api/pricing/:fixture_id/:player_id?market=anytime_assist&team_xg=2.1
async fn pricing_handler(
    State(state): State<Arc<AppState>>,
    Path((fixture_id, player_id)): Path<(String, String)>,
    Query(query): Query<PricingQuery>,
) -> Result<Json<PricingOutput>, ApiError> {
    let at = query.at.unwrap_or_else(Utc::now);
    state
        .service
        .price(&fixture_id, &player_id, query.market, query.team_xg, at)
        .map(Json)
        .map_err(reject)
}

#[derive(Debug, Deserialize)]
pub struct LineupRequest {
    pub home_starters: Vec<String>,
    pub away_starters: Vec<String>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct LineupResponse {
    pub cycle: CycleReport,
    pub outputs: Vec<PricingOutput>,
}

/// POST /api/fixtures/:fixture_id/lineup
async fn lineup_handler(
    State(state): State<Arc<AppState>>,
    Path(fixture_id): Path<String>,
    Json(body): Json<LineupRequest>,
) -> Result<Json<LineupResponse>, ApiError> {
    let lineup = LineupConfirmation {
        fixture_id: fixture_id.clone(),
        home_starters: body.home_starters,
        away_starters: body.away_starters,
        confirmed_at: body.confirmed_at.unwrap_or_else(Utc::now),
    };
    let cycle = state.service.confirm_lineup(lineup).map_err(reject)?;
    Ok(Json(LineupResponse {
        cycle,
        outputs: state.service.fixture_outputs(&fixture_id),
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct OutputsQuery {
    /// Include superseded outputs
    #[serde(default)]
    pub history: bool,
}

/// GET /api/fixtures/:fixture_id/outputs?history=true
async fn outputs_handler(
    State(state): State<Arc<AppState>>,
    Path(fixture_id): Path<String>,
    Query(query): Query<OutputsQuery>,
) -> axum::response::Response {
    if query.history {
        Json(state.service.output_history(&fixture_id)).into_response()
    } else {
        Json(state.service.fixture_outputs(&fixture_id)).into_response()
    }
}

/// GET /api/fixtures/:fixture_id/exposure
async fn exposure_handler(
    State(state): State<Arc<AppState>>,
    Path(fixture_id): Path<String>,
) -> impl IntoResponse {
    Json(state.service.exposure_for(&fixture_id))
}

/// GET /api/fixtures/:fixture_id/decisions
async fn decisions_handler(
    State(state): State<Arc<AppState>>,
    Path(fixture_id): Path<String>,
) -> impl IntoResponse {
    Json(state.service.decisions_for(&fixture_id))
}

/// DELETE /api/fixtures/:fixture_id/overrides
async fn clear_overrides_handler(
    State(state): State<Arc<AppState>>,
    Path(fixture_id): Path<String>,
) -> impl IntoResponse {
    state.service.clear_overrides(&fixture_id);
    StatusCode::NO_CONTENT
}

/// POST /api/fixtures
async fn fixture_handler(
    State(state): State<Arc<AppState>>,
    Json(fixture): Json<FixtureContext>,
) -> impl IntoResponse {
    state.service.ingest_fixture(fixture);
    StatusCode::CREATED
}

/// POST /api/snapshots/features
async fn features_handler(
    State(state): State<Arc<AppState>>,
    Json(snapshot): Json<FeatureSnapshot>,
) -> Result<StatusCode, ApiError> {
    let key = format!("{}@{}", snapshot.player_id, snapshot.as_of);
    if state.service.ingest_features(snapshot) {
        Ok(StatusCode::CREATED)
    } else {
        Err((StatusCode::CONFLICT, format!("feature snapshot {key} already exists")))
    }
}

/// POST /api/snapshots/odds: stores the snapshot and re-prices its fixture
/// as of `ingested_at`.
async fn odds_handler(
    State(state): State<Arc<AppState>>,
    Json(snapshot): Json<OddsSnapshot>,
) -> Result<Json<CycleReport>, ApiError> {
    let at = snapshot.ingested_at;
    state.service.ingest_odds(snapshot, at).map(Json).map_err(reject)
}

/// POST /api/results
async fn result_handler(
    State(state): State<Arc<AppState>>,
    Json(result): Json<PlayerResult>,
) -> impl IntoResponse {
    state.service.ingest_result(result);
    StatusCode::CREATED
}

/// POST /api/decisions/:decision_id/execute
async fn execute_handler(
    State(state): State<Arc<AppState>>,
    Path(decision_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .service
        .execute(decision_id, Utc::now())
        .map(Json)
        .map_err(reject)
}

/// POST /api/calibration/:market/recalibrate
async fn recalibrate_handler(
    State(state): State<Arc<AppState>>,
    Path(market): Path<Market>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .service
        .recalibrate(market, Utc::now())
        .map(Json)
        .map_err(reject)
}

/// POST /api/backtest: the body is a backtest configuration; omitted
/// fields take their defaults, the engine section the server's.
async fn backtest_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Result<impl IntoResponse, ApiError> {
    let has_engine = body.get("engine").is_some();
    let mut config: BacktestConfig =
        serde_json::from_value(body).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    if !has_engine {
        config.engine = state.service.config().clone();
    }
    state.service.backtest(config).await.map(Json).map_err(|e| {
        warn!("Backtest failed: {:#}", e);
        match e.downcast_ref::<PricingError>() {
            Some(err) => (status_for(err), err.to_string()),
            None => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    })
}
