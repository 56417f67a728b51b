//! HTTP surface: admin console API, collaborator portal API, and the
//! public booking endpoint.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use ctv_core::{
    canonical_phone, phone_suffix9, Collaborator, CommissionRow, NetworkStats, NewVisit,
    RateEntry, SourceTag, Visit, Watermark,
};
use ctv_sheets::{booking_sheet_row, resolve_tab_title, SheetClient, DEFAULT_STATUS};
use ctv_storage::{
    CollaboratorSummary, HeartbeatRow, LevelTrendRow, ReportFilter, Store, StoreError,
};
use ctv_sync::{
    parse_source_tag, CountCheck, CycleSummary, IntegrityProbe, MissingReport, Reconciler,
    RecomputeOutcome, SyncConfig, TraceReport, Worker,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, warn};

pub const CRATE_NAME: &str = "ctv-web";

// ---------------------------------------------------------------------------
// Error envelope
// ---------------------------------------------------------------------------

/// JSON error envelope: `{ "error": { "kind", "message" } }`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "bad_request",
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            kind: "not_found",
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            kind: "conflict",
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "internal",
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": { "kind": self.kind, "message": self.message }
        }));
        (self.status, body).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(code) => ApiError::not_found(format!("collaborator {code} not found")),
            StoreError::Hierarchy(violation) => ApiError::conflict(violation.to_string()),
            other => {
                error!(error = %other, "storage failure");
                ApiError::internal("storage failure")
            }
        }
    }
}

impl From<ctv_sync::SyncError> for ApiError {
    fn from(err: ctv_sync::SyncError) -> Self {
        match err {
            ctv_sync::SyncError::Store(store) => store.into(),
            ctv_sync::SyncError::Sheet(sheet) => {
                error!(error = %sheet, "sheet failure");
                ApiError::internal("sheet failure")
            }
        }
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ---------------------------------------------------------------------------
// State and router
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub sheets: Arc<dyn SheetClient>,
    pub sync: SyncConfig,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/booking", post(create_booking))
        .route("/api/admin/rates", get(get_rates).put(put_rates))
        .route(
            "/api/admin/collaborators",
            get(list_collaborators).post(upsert_collaborator),
        )
        .route(
            "/api/admin/collaborators/{code}",
            get(get_collaborator)
                .put(update_collaborator)
                .delete(deactivate_collaborator),
        )
        .route("/api/admin/commissions", get(list_commissions))
        .route("/api/admin/commissions/summary", get(commission_summary))
        .route("/api/admin/commissions/trend", get(commission_trend))
        .route("/api/admin/commissions/top", get(top_earners))
        .route("/api/admin/commissions/recompute", post(recompute_all))
        .route("/api/admin/integrity/counts", get(integrity_counts))
        .route("/api/admin/integrity/missing", get(integrity_missing))
        .route("/api/admin/integrity/trace/{phone}", get(integrity_trace))
        .route("/api/admin/sync", post(run_sync_cycle))
        .route("/api/admin/reset/preview", get(reset_preview))
        .route("/api/admin/reset/delete", post(reset_delete))
        .route("/api/admin/reset/import/{tab}", post(reset_import))
        .route("/api/admin/reset/recompute", post(reset_recompute))
        .route("/api/portal/{code}/profile", get(portal_profile))
        .route("/api/portal/{code}/network", get(portal_network))
        .route("/api/portal/{code}/commissions", get(portal_commissions))
        .route("/api/portal/{code}/clients", get(portal_clients))
        .with_state(state)
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    worker: &'static str,
    heartbeat: Option<HeartbeatRow>,
}

/// Worker liveness from the heartbeat row's age.
pub fn heartbeat_health(age_secs: Option<i64>) -> &'static str {
    match age_secs {
        None => "unknown",
        Some(age) if age < 60 => "healthy",
        Some(age) if age < 300 => "warning",
        Some(_) => "critical",
    }
}

async fn health(State(state): State<AppState>) -> ApiResult<HealthResponse> {
    let heartbeat = state.store.heartbeat().await?;
    let age = heartbeat
        .as_ref()
        .map(|row| (Utc::now() - row.last_updated).num_seconds());
    Ok(Json(HealthResponse {
        status: "ok",
        worker: heartbeat_health(age),
        heartbeat,
    }))
}

// ---------------------------------------------------------------------------
// Rates
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct RatesResponse {
    rates: Vec<RateEntry>,
}

async fn get_rates(State(state): State<AppState>) -> ApiResult<RatesResponse> {
    let table = state.store.rate_table().await;
    Ok(Json(RatesResponse {
        rates: table.entries().cloned().collect(),
    }))
}

#[derive(Debug, Deserialize)]
struct PutRatesRequest {
    updated_by: Option<String>,
    entries: Vec<RateEntry>,
}

#[derive(Debug, Serialize)]
struct PutRatesResponse {
    rates: Vec<RateEntry>,
    recompute: RecomputeOutcome,
}

/// Rate changes apply retroactively: the whole ledger is rebuilt under the
/// new table before the response returns.
async fn put_rates(
    State(state): State<AppState>,
    Json(body): Json<PutRatesRequest>,
) -> ApiResult<PutRatesResponse> {
    if body.entries.is_empty() {
        return Err(ApiError::bad_request("at least one rate entry required"));
    }
    for entry in &body.entries {
        if !(0.0..=1.0).contains(&entry.rate) {
            return Err(ApiError::bad_request(format!(
                "rate {} for level {} is outside [0, 1]",
                entry.rate, entry.level
            )));
        }
    }
    let updated_by = body.updated_by.as_deref().unwrap_or("admin");
    state.store.put_rates(&body.entries, updated_by).await?;
    let recompute = Reconciler::new(&state.store, state.sync.phone_matching)
        .recompute_all()
        .await?;
    let table = state.store.rate_table().await;
    Ok(Json(PutRatesResponse {
        rates: table.entries().cloned().collect(),
        recompute,
    }))
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

async fn list_collaborators(State(state): State<AppState>) -> ApiResult<Vec<Collaborator>> {
    Ok(Json(state.store.list_collaborators().await?))
}

async fn get_collaborator(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> ApiResult<Collaborator> {
    state
        .store
        .get_collaborator(&code)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("collaborator {code} not found")))
}

async fn upsert_collaborator(
    State(state): State<AppState>,
    Json(collab): Json<Collaborator>,
) -> ApiResult<Collaborator> {
    if collab.code.trim().is_empty() {
        return Err(ApiError::bad_request("collaborator code required"));
    }
    state.store.upsert_collaborator(&collab).await?;
    get_collaborator(State(state), Path(collab.code)).await
}

async fn update_collaborator(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Json(mut collab): Json<Collaborator>,
) -> ApiResult<Collaborator> {
    collab.code = code;
    upsert_collaborator(State(state), Json(collab)).await
}

async fn deactivate_collaborator(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> ApiResult<serde_json::Value> {
    state.store.deactivate_collaborator(&code).await?;
    Ok(Json(json!({ "code": code, "active": false })))
}

// ---------------------------------------------------------------------------
// Commissions & reports
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CommissionQuery {
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    collaborator: Option<String>,
    level: Option<i16>,
    source: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

/// Default window is the trailing year, inclusive on both ends.
fn report_filter(query: &CommissionQuery) -> Result<ReportFilter, ApiError> {
    let today = Utc::now().date_naive();
    let mut filter = ReportFilter::range(
        query.from.unwrap_or(today - ChronoDuration::days(365)),
        query.to.unwrap_or(today),
    );
    if filter.from > filter.to {
        return Err(ApiError::bad_request("from is after to"));
    }
    if let Some(code) = &query.collaborator {
        filter.collaborators = Some(vec![code.trim().to_lowercase()]);
    }
    filter.level = query.level;
    if let Some(raw) = &query.source {
        filter.source =
            Some(parse_source_tag(raw).ok_or_else(|| {
                ApiError::bad_request(format!("unknown source '{raw}'"))
            })?);
    }
    Ok(filter)
}

async fn list_commissions(
    State(state): State<AppState>,
    Query(query): Query<CommissionQuery>,
) -> ApiResult<Vec<CommissionRow>> {
    let filter = report_filter(&query)?;
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    let offset = query.offset.unwrap_or(0).max(0);
    Ok(Json(state.store.list_commissions(&filter, limit, offset).await?))
}

async fn commission_summary(
    State(state): State<AppState>,
    Query(query): Query<CommissionQuery>,
) -> ApiResult<Vec<CollaboratorSummary>> {
    let filter = report_filter(&query)?;
    Ok(Json(state.store.summary_by_collaborator(&filter).await?))
}

async fn commission_trend(
    State(state): State<AppState>,
    Query(query): Query<CommissionQuery>,
) -> ApiResult<Vec<LevelTrendRow>> {
    let filter = report_filter(&query)?;
    Ok(Json(state.store.trend_by_level(&filter).await?))
}

async fn top_earners(
    State(state): State<AppState>,
    Query(query): Query<CommissionQuery>,
) -> ApiResult<Vec<CollaboratorSummary>> {
    let filter = report_filter(&query)?;
    let limit = query.limit.unwrap_or(10).clamp(1, 100);
    Ok(Json(state.store.top_earners(&filter, limit).await?))
}

async fn recompute_all(State(state): State<AppState>) -> ApiResult<RecomputeOutcome> {
    let outcome = Reconciler::new(&state.store, state.sync.phone_matching)
        .recompute_all()
        .await?;
    Ok(Json(outcome))
}

// ---------------------------------------------------------------------------
// Integrity & sync
// ---------------------------------------------------------------------------

async fn integrity_counts(State(state): State<AppState>) -> ApiResult<serde_json::Value> {
    let probe = IntegrityProbe::new(&state.store, state.sheets.as_ref());
    let checks: Vec<CountCheck> = probe.counts().await?;
    let heartbeat = state.store.heartbeat().await?;
    let age = heartbeat
        .as_ref()
        .map(|row| (Utc::now() - row.last_updated).num_seconds());
    Ok(Json(json!({
        "tabs": checks,
        "worker": heartbeat_health(age),
        "heartbeat": heartbeat,
    })))
}

#[derive(Debug, Deserialize)]
struct MissingQuery {
    tab: Option<String>,
    limit: Option<usize>,
}

/// One report per tab; no `tab` parameter means all three.
async fn integrity_missing(
    State(state): State<AppState>,
    Query(query): Query<MissingQuery>,
) -> ApiResult<Vec<MissingReport>> {
    let probe = IntegrityProbe::new(&state.store, state.sheets.as_ref());
    let mut reports = match &query.tab {
        Some(tab) => {
            let tag = parse_source_tag(tab)
                .ok_or_else(|| ApiError::bad_request(format!("unknown tab '{tab}'")))?;
            vec![probe.missing(tag).await?]
        }
        None => probe.missing_all().await?,
    };
    if let Some(limit) = query.limit {
        for report in &mut reports {
            report.missing_phones.truncate(limit);
        }
    }
    Ok(Json(reports))
}

async fn integrity_trace(
    State(state): State<AppState>,
    Path(phone): Path<String>,
) -> ApiResult<TraceReport> {
    if phone_suffix9(&phone).is_empty() {
        return Err(ApiError::bad_request("phone has no digits"));
    }
    let probe = IntegrityProbe::new(&state.store, state.sheets.as_ref());
    Ok(Json(probe.trace(&phone).await?))
}

async fn run_sync_cycle(State(state): State<AppState>) -> ApiResult<CycleSummary> {
    let worker = Worker::new(
        state.store.clone(),
        state.sheets.clone(),
        state.sync.clone(),
    );
    Ok(Json(worker.run_cycle().await?))
}

// ---------------------------------------------------------------------------
// Hard reset steps
// ---------------------------------------------------------------------------

async fn reset_preview(State(state): State<AppState>) -> ApiResult<serde_json::Value> {
    let probe = IntegrityProbe::new(&state.store, state.sheets.as_ref());
    let checks = probe.counts().await?;
    let total_db: i64 = checks.iter().map(|c| c.db_rows).sum();
    Ok(Json(json!({
        "tabs": checks,
        "rows_to_delete": total_db,
        "next_step": "POST /api/admin/reset/delete",
    })))
}

/// Step two of the hard reset: wipe synced rows, the ledger, the watermark
/// and the heartbeat. Import and recompute follow as separate calls.
async fn reset_delete(State(state): State<AppState>) -> ApiResult<serde_json::Value> {
    let mut deleted = 0u64;
    for tag in SourceTag::ALL {
        deleted += state.store.delete_visits_by_source(tag).await?;
    }
    state.store.truncate_commissions().await?;
    state.store.reset_watermark().await?;
    state.store.reset_heartbeat().await?;
    warn!(deleted, "hard reset wiped synced rows and the commission ledger");
    Ok(Json(json!({
        "deleted": deleted,
        "watermark": Watermark::ZERO,
        "next_step": "POST /api/admin/reset/import/{tab}",
    })))
}

async fn reset_import(
    State(state): State<AppState>,
    Path(tab): Path<String>,
) -> ApiResult<serde_json::Value> {
    let tag = parse_source_tag(&tab)
        .ok_or_else(|| ApiError::bad_request(format!("unknown tab '{tab}'")))?;
    let worker = Worker::new(
        state.store.clone(),
        state.sheets.clone(),
        state.sync.clone(),
    );
    let outcome = worker.import_tab(tag).await?;
    Ok(Json(json!({
        "imported": outcome.inserted,
        "dropped_missing_phone": outcome.dropped_missing_phone,
        "tab": tag,
        "next_step": "POST /api/admin/reset/recompute",
    })))
}

async fn reset_recompute(State(state): State<AppState>) -> ApiResult<RecomputeOutcome> {
    recompute_all(State(state)).await
}

// ---------------------------------------------------------------------------
// Portal
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct PortalNetwork {
    code: String,
    stats: NetworkStats,
    direct_children: Vec<String>,
    max_depth_below: u8,
    descendants: Vec<String>,
}

async fn portal_profile(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> ApiResult<Collaborator> {
    get_collaborator(State(state), Path(code)).await
}

async fn portal_network(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> ApiResult<PortalNetwork> {
    let map = state.store.parent_map().await?;
    if !map.contains(&code) {
        return Err(ApiError::not_found(format!("collaborator {code} not found")));
    }
    Ok(Json(PortalNetwork {
        stats: map.stats(&code),
        direct_children: map.direct_children(&code),
        max_depth_below: map.max_depth_below(&code),
        descendants: map.descendants(&code),
        code,
    }))
}

/// Portal queries are always scoped to the caller's own subtree.
async fn subtree_codes(state: &AppState, code: &str) -> Result<Vec<String>, ApiError> {
    let map = state.store.parent_map().await?;
    if !map.contains(code) {
        return Err(ApiError::not_found(format!("collaborator {code} not found")));
    }
    let mut codes = map.descendants(code);
    codes.push(code.trim().to_lowercase());
    Ok(codes)
}

async fn portal_commissions(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Query(query): Query<CommissionQuery>,
) -> ApiResult<Vec<CommissionRow>> {
    let codes = subtree_codes(&state, &code).await?;
    let mut filter = report_filter(&query)?;
    filter.collaborators = Some(codes);
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    let offset = query.offset.unwrap_or(0).max(0);
    Ok(Json(state.store.list_commissions(&filter, limit, offset).await?))
}

async fn portal_clients(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> ApiResult<Vec<Visit>> {
    let codes = subtree_codes(&state, &code).await?;
    let suffixes: Vec<String> = codes.iter().map(|c| phone_suffix9(c)).filter(|s| !s.is_empty()).collect();
    Ok(Json(state.store.visits_closed_by_suffixes(&suffixes).await?))
}

// ---------------------------------------------------------------------------
// Booking
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct BookingRequest {
    pub name: String,
    pub phone: String,
    #[serde(default)]
    pub branch: String,
    pub appt_date: Option<NaiveDate>,
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub note: String,
    pub referrer_phone: Option<String>,
    pub region: Option<String>,
}

/// Booking rows land in the referral tab's table with a fresh status; the
/// referrer's phone rides in the closer column like sheet-entered rows.
pub fn validate_booking(req: &BookingRequest) -> Result<NewVisit, ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError::bad_request("name required"));
    }
    if canonical_phone(&req.phone).is_empty() {
        return Err(ApiError::bad_request("phone requires at least one digit"));
    }
    Ok(NewVisit {
        date_entered: Some(Utc::now().date_naive()),
        name: req.name.trim().to_string(),
        phone: req.phone.trim().to_string(),
        branch: req.branch.trim().to_string(),
        appt_date: req.appt_date,
        time: req.time.trim().to_string(),
        service: req.service.trim().to_string(),
        gross: 0,
        deposit: 0,
        balance: 0,
        closer: req
            .referrer_phone
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_string(),
        note: req.note.trim().to_string(),
        status: DEFAULT_STATUS.to_string(),
        source: SourceTag::GioiThieu,
        region: req.region.clone(),
    })
}

#[derive(Debug, Serialize)]
struct BookingResponse {
    id: i64,
    sheet_appended: bool,
}

async fn create_booking(
    State(state): State<AppState>,
    Json(req): Json<BookingRequest>,
) -> Result<(StatusCode, Json<BookingResponse>), ApiError> {
    let visit = validate_booking(&req)?;
    let id = state.store.insert_booking(&visit).await?;
    if !visit.closer.is_empty() {
        state.store.ensure_referrer_collaborator(&visit.closer).await?;
    }

    // The sheet copy is convenience for the front office; its failure must
    // never fail the booking.
    let sheet_appended = match append_booking_to_sheet(&state, &visit).await {
        Ok(()) => true,
        Err(err) => {
            warn!(error = %err, booking_id = id, "booking saved but sheet append failed");
            false
        }
    };
    Ok((
        StatusCode::CREATED,
        Json(BookingResponse { id, sheet_appended }),
    ))
}

async fn append_booking_to_sheet(state: &AppState, visit: &NewVisit) -> anyhow::Result<()> {
    let titles = state.sheets.worksheet_titles().await?;
    let title = resolve_tab_title(&titles, SourceTag::GioiThieu)
        .ok_or_else(|| anyhow::anyhow!("no referral worksheet found"))?;
    state
        .sheets
        .append_row(&title, &booking_sheet_row(visit))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use ctv_sheets::MemorySheetClient;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    /// Lazy pool and an empty in-memory sheet: routes that validate before
    /// touching Postgres are testable without a server.
    fn test_state() -> AppState {
        let config = ctv_storage::StoreConfig {
            database_url: "postgres://nobody@127.0.0.1:1/ctv".to_string(),
            max_connections: 1,
            acquire_timeout: std::time::Duration::from_millis(200),
            rate_cache_ttl: std::time::Duration::from_secs(60),
        };
        AppState {
            store: Arc::new(Store::connect_lazy(&config).unwrap()),
            sheets: MemorySheetClient::new(),
            sync: SyncConfig::default(),
        }
    }

    fn booking(name: &str, phone: &str) -> BookingRequest {
        BookingRequest {
            name: name.to_string(),
            phone: phone.to_string(),
            branch: String::new(),
            appt_date: None,
            time: String::new(),
            service: String::new(),
            note: String::new(),
            referrer_phone: Some("0905550001".to_string()),
            region: None,
        }
    }

    #[test]
    fn booking_validation_requires_name_and_digits() {
        assert!(validate_booking(&booking("", "0901234567")).is_err());
        assert!(validate_booking(&booking("Lan", "no digits")).is_err());
        let visit = validate_booking(&booking("  Lan  ", "0901234567")).unwrap();
        assert_eq!(visit.name, "Lan");
        assert_eq!(visit.source, SourceTag::GioiThieu);
        assert_eq!(visit.status, DEFAULT_STATUS);
        assert_eq!(visit.closer, "0905550001");
        assert_eq!(visit.gross, 0);
    }

    #[test]
    fn heartbeat_health_thresholds() {
        assert_eq!(heartbeat_health(None), "unknown");
        assert_eq!(heartbeat_health(Some(5)), "healthy");
        assert_eq!(heartbeat_health(Some(59)), "healthy");
        assert_eq!(heartbeat_health(Some(120)), "warning");
        assert_eq!(heartbeat_health(Some(900)), "critical");
    }

    #[test]
    fn report_filter_defaults_and_validation() {
        let query = CommissionQuery {
            from: None,
            to: None,
            collaborator: Some(" 0905550001 ".to_string()),
            level: Some(1),
            source: Some("tham_my".to_string()),
            limit: None,
            offset: None,
        };
        let filter = report_filter(&query).unwrap();
        assert_eq!(filter.to - filter.from, ChronoDuration::days(365));
        assert_eq!(
            filter.collaborators,
            Some(vec!["0905550001".to_string()])
        );
        assert_eq!(filter.source, Some(SourceTag::ThamMy));

        let inverted = CommissionQuery {
            from: NaiveDate::from_ymd_opt(2025, 6, 1),
            to: NaiveDate::from_ymd_opt(2025, 1, 1),
            collaborator: None,
            level: None,
            source: None,
            limit: None,
            offset: None,
        };
        assert!(report_filter(&inverted).is_err());
    }

    #[tokio::test]
    async fn router_rejects_unknown_report_source() {
        let response = router(test_state())
            .oneshot(
                Request::builder()
                    .uri("/api/admin/commissions?source=spa")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["error"]["kind"], "bad_request");
    }

    #[tokio::test]
    async fn missing_probe_tab_parameter_is_optional() {
        // No worksheets exist, so every tab is skipped and the body is [].
        let response = router(test_state())
            .oneshot(
                Request::builder()
                    .uri("/api/admin/integrity/missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value, json!([]));
    }

    #[tokio::test]
    async fn error_envelope_shape() {
        let response = ApiError::conflict("would deepen the chain past 4").into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["error"]["kind"], "conflict");
        assert_eq!(value["error"]["message"], "would deepen the chain past 4");
    }
}
