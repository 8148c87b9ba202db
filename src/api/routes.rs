//! REST endpoints: leads, campaigns, suppressions, analytics, composition
//! and open/click tracking.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::ws::metrics_ws;
use crate::campaigns::{Campaign, CampaignSettings, write_outcomes_csv};
use crate::compose::{ComposeRequest, TextGenerator};
use crate::error::{CampaignError, ComposeError, DatabaseError, Error, ImportError};
use crate::leads::import::is_valid_address;
use crate::leads::{Lead, LeadSelector, LeadStatus, import_leads, write_leads_csv};
use crate::pipeline::engine::CampaignEngine;
use crate::pipeline::metrics::{MetricsHub, TrackingKind};
use crate::pipeline::suppression::{SuppressionEntry, SuppressionList};
use crate::store::Database;

/// 1×1 transparent GIF.
const PIXEL_GIF: [u8; 43] = [
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00,
    0xff, 0xff, 0xff, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00, 0x00, 0x00,
    0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3b,
];

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn Database>,
    pub engine: Arc<CampaignEngine>,
    pub metrics: Arc<MetricsHub>,
    pub suppressions: Arc<SuppressionList>,
    pub composer: Arc<dyn TextGenerator>,
    /// Tenant used when a request does not name one.
    pub default_tenant: String,
}

impl AppState {
    fn tenant(&self, requested: Option<&str>) -> String {
        requested
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(&self.default_tenant)
            .to_string()
    }
}

/// Build the Axum router with all REST, tracking and WebSocket routes.
pub fn app_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws/metrics", get(metrics_ws))
        .route("/api/leads", get(list_leads).post(create_lead))
        .route("/api/leads/import", post(import_csv))
        .route("/api/leads/export", get(export_leads))
        .route("/api/leads/{id}/status", post(set_lead_status))
        .route("/api/campaigns", get(list_campaigns).post(create_campaign))
        .route("/api/campaigns/{id}", get(get_campaign))
        .route("/api/campaigns/{id}/start", post(start_campaign))
        .route("/api/campaigns/{id}/cancel", post(cancel_campaign))
        .route("/api/campaigns/{id}/report", get(campaign_report))
        .route("/api/campaigns/{id}/report.csv", get(campaign_report_csv))
        .route(
            "/api/suppressions",
            get(list_suppressions)
                .post(add_suppression)
                .delete(remove_suppression),
        )
        .route("/api/analytics", get(analytics))
        .route("/api/compose", post(compose))
        .route("/t/open/{token}", get(track_open))
        .route("/t/click/{token}", get(track_click))
        .with_state(state)
}

// ── Errors ──────────────────────────────────────────────────────────────

fn error_json(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({"error": message.into()}))).into_response()
}

fn error_response(err: Error) -> Response {
    let status = match &err {
        Error::Campaign(CampaignError::NotFound { .. }) => StatusCode::NOT_FOUND,
        Error::Campaign(CampaignError::AlreadyRunning { .. })
        | Error::Campaign(CampaignError::InvalidTransition { .. }) => StatusCode::CONFLICT,
        Error::Campaign(CampaignError::Invalid(_))
        | Error::Campaign(CampaignError::UnknownProfile { .. }) => StatusCode::BAD_REQUEST,
        Error::Import(ImportError::MissingColumn(_)) | Error::Import(ImportError::Header(_)) => {
            StatusCode::BAD_REQUEST
        }
        Error::Compose(ComposeError::UnknownTone(_)) => StatusCode::BAD_REQUEST,
        Error::Database(DatabaseError::NotFound { .. }) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        warn!(error = %err, "Request failed");
    }
    error_json(status, err.to_string())
}

fn parse_id(id: &str, what: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(id).map_err(|_| error_json(StatusCode::BAD_REQUEST, format!("Invalid {what} ID")))
}

fn csv_attachment(filename: &str, body: Vec<u8>) -> Response {
    (
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        body,
    )
        .into_response()
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "leadai",
        "transport": if state.engine.can_send() { "smtp" } else { "simulated" },
        "profiles": state.engine.profiles(),
    }))
}

// ── Leads ───────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct LeadQuery {
    tenant: Option<String>,
    category: Option<String>,
}

impl LeadQuery {
    fn selector(&self) -> LeadSelector {
        match &self.category {
            Some(category) if !category.trim().is_empty() => LeadSelector::Category {
                category: category.clone(),
            },
            _ => LeadSelector::All,
        }
    }
}

async fn list_leads(State(state): State<AppState>, Query(q): Query<LeadQuery>) -> Response {
    let tenant = state.tenant(q.tenant.as_deref());
    match state.db.list_leads(&tenant, &q.selector()).await {
        Ok(leads) => Json(leads).into_response(),
        Err(e) => error_response(e.into()),
    }
}

async fn export_leads(State(state): State<AppState>, Query(q): Query<LeadQuery>) -> Response {
    let tenant = state.tenant(q.tenant.as_deref());
    let leads = match state.db.list_leads(&tenant, &q.selector()).await {
        Ok(leads) => leads,
        Err(e) => return error_response(e.into()),
    };
    let mut body = Vec::new();
    if let Err(e) = write_leads_csv(&leads, &mut body) {
        return error_response(e.into());
    }
    info!(tenant = %tenant, rows = leads.len(), "Leads exported");
    let slug: String = tenant
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
        .collect();
    csv_attachment(&format!("leads_{slug}_{}.csv", Utc::now().format("%Y%m%d_%H%M%S")), body)
}

#[derive(Deserialize)]
struct NewLead {
    #[serde(default)]
    tenant: Option<String>,
    email: String,
    name: String,
    #[serde(default)]
    company: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    score: Option<i64>,
    #[serde(default)]
    attributes: BTreeMap<String, String>,
}

async fn create_lead(State(state): State<AppState>, Json(body): Json<NewLead>) -> Response {
    if !is_valid_address(&body.email) {
        return error_json(StatusCode::BAD_REQUEST, format!("Invalid email address: {}", body.email));
    }
    let tenant = state.tenant(body.tenant.as_deref());
    let mut lead = Lead::new(tenant, body.email, body.name, body.company);
    if let Some(category) = body.category.filter(|c| !c.trim().is_empty()) {
        lead = lead.with_category(category);
    }
    if let Some(score) = body.score {
        lead = lead.with_score(score);
    }
    for (key, value) in body.attributes {
        lead = lead.with_attribute(key, value);
    }

    match state.db.insert_lead(&lead).await {
        Ok(true) => {
            info!(lead_id = %lead.id, "Lead created");
            (StatusCode::CREATED, Json(serde_json::json!(lead))).into_response()
        }
        Ok(false) => error_json(StatusCode::CONFLICT, "Lead with this email already exists"),
        Err(e) => error_response(e.into()),
    }
}

#[derive(Deserialize)]
struct ImportQuery {
    tenant: Option<String>,
    delimiter: Option<char>,
}

async fn import_csv(
    State(state): State<AppState>,
    Query(q): Query<ImportQuery>,
    body: Bytes,
) -> Response {
    let tenant = state.tenant(q.tenant.as_deref());
    let delimiter = match q.delimiter.unwrap_or(',') {
        c if c.is_ascii() => c as u8,
        c => return error_json(StatusCode::BAD_REQUEST, format!("Unsupported delimiter: {c}")),
    };
    match import_leads(state.db.as_ref(), &tenant, body.as_ref(), delimiter).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => error_response(e.into()),
    }
}

#[derive(Deserialize)]
struct StatusUpdate {
    status: String,
}

async fn set_lead_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<StatusUpdate>,
) -> Response {
    let id = match parse_id(&id, "lead") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let status = match body.status.parse::<LeadStatus>() {
        Ok(status) => status,
        Err(e) => return error_json(StatusCode::BAD_REQUEST, e),
    };
    match state.db.update_lead_status(id, status).await {
        Ok(()) => Json(serde_json::json!({"id": id, "status": status})).into_response(),
        Err(e) => error_response(e.into()),
    }
}

// ── Campaigns ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TenantQuery {
    tenant: Option<String>,
}

async fn list_campaigns(State(state): State<AppState>, Query(q): Query<TenantQuery>) -> Response {
    let tenant = state.tenant(q.tenant.as_deref());
    match state.db.list_campaigns(&tenant).await {
        Ok(campaigns) => Json(campaigns).into_response(),
        Err(e) => error_response(e.into()),
    }
}

#[derive(Deserialize)]
struct NewCampaign {
    #[serde(default)]
    tenant: Option<String>,
    name: String,
    subject: String,
    body: String,
    #[serde(default)]
    selector: LeadSelector,
    #[serde(default)]
    settings: CampaignSettings,
    #[serde(default)]
    profile_id: Option<String>,
    #[serde(default)]
    dry_run: bool,
    #[serde(default)]
    send_at: Option<DateTime<Utc>>,
    /// Start right away when not scheduled.
    #[serde(default)]
    start: bool,
}

async fn create_campaign(State(state): State<AppState>, Json(body): Json<NewCampaign>) -> Response {
    let tenant = state.tenant(body.tenant.as_deref());
    let mut campaign = Campaign::new(tenant, body.name, body.subject, body.body)
        .with_selector(body.selector)
        .with_settings(body.settings)
        .with_dry_run(body.dry_run);
    campaign.profile_id = body.profile_id;
    if let Some(send_at) = body.send_at {
        campaign = campaign.scheduled_at(send_at);
    }

    let campaign = match state.engine.create_campaign(campaign).await {
        Ok(c) => c,
        Err(e) => return error_response(e),
    };

    if body.start && campaign.send_at.is_none() {
        if let Err(e) = state.engine.start(campaign.id).await {
            return error_response(e);
        }
        info!(campaign_id = %campaign.id, "Campaign created and started");
    }
    (StatusCode::CREATED, Json(serde_json::json!(campaign))).into_response()
}

async fn get_campaign(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id, "campaign") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.db.get_campaign(id).await {
        Ok(Some(c)) => Json(c).into_response(),
        Ok(None) => error_json(StatusCode::NOT_FOUND, "Campaign not found"),
        Err(e) => error_response(e.into()),
    }
}

async fn start_campaign(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id, "campaign") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.engine.start(id).await {
        Ok(run) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({"campaign_id": run.campaign_id, "status": "sending"})),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn cancel_campaign(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id, "campaign") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.engine.cancel(id).await {
        Ok(status) => Json(serde_json::json!({"campaign_id": id, "status": status})).into_response(),
        Err(e) => error_response(e),
    }
}

async fn campaign_report(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id, "campaign") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.engine.report(id).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => error_response(e),
    }
}

async fn campaign_report_csv(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id, "campaign") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let report = match state.engine.report(id).await {
        Ok(report) => report,
        Err(e) => return error_response(e),
    };
    let mut body = Vec::new();
    if let Err(e) = write_outcomes_csv(&report.outcomes, &mut body) {
        return error_response(e.into());
    }
    csv_attachment(&format!("campaign_{id}.csv"), body)
}

// ── Suppressions ────────────────────────────────────────────────────────

async fn list_suppressions(State(state): State<AppState>, Query(q): Query<TenantQuery>) -> Response {
    let tenant = state.tenant(q.tenant.as_deref());
    match state.db.list_suppressions(&tenant).await {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => error_response(e.into()),
    }
}

#[derive(Deserialize)]
struct NewSuppression {
    #[serde(default)]
    tenant: Option<String>,
    pattern: String,
    #[serde(default = "default_reason")]
    reason: String,
}

fn default_reason() -> String {
    "manual".into()
}

async fn add_suppression(State(state): State<AppState>, Json(body): Json<NewSuppression>) -> Response {
    let tenant = state.tenant(body.tenant.as_deref());
    let entry = SuppressionEntry::new(tenant, &body.pattern, body.reason);
    if entry.pattern.is_empty() {
        return error_json(StatusCode::BAD_REQUEST, "Pattern is empty");
    }
    if let Err(e) = state.db.add_suppression(&entry).await {
        return error_response(e.into());
    }
    state.suppressions.insert(&entry).await;
    info!(tenant = %entry.tenant_id, pattern = %entry.pattern, "Suppression added");
    (StatusCode::CREATED, Json(serde_json::json!(entry))).into_response()
}

#[derive(Deserialize)]
struct RemoveQuery {
    tenant: Option<String>,
    pattern: String,
}

async fn remove_suppression(State(state): State<AppState>, Query(q): Query<RemoveQuery>) -> Response {
    let tenant = state.tenant(q.tenant.as_deref());
    let pattern = crate::pipeline::suppression::normalize_pattern(&q.pattern);
    match state.db.remove_suppression(&tenant, &pattern).await {
        Ok(true) => {
            state.suppressions.remove(&tenant, &pattern).await;
            info!(tenant = %tenant, pattern = %pattern, "Suppression removed");
            Json(serde_json::json!({"status": "removed", "pattern": pattern})).into_response()
        }
        Ok(false) => error_json(StatusCode::NOT_FOUND, "Suppression not found"),
        Err(e) => error_response(e.into()),
    }
}

// ── Analytics ───────────────────────────────────────────────────────────

async fn analytics(State(state): State<AppState>, Query(q): Query<TenantQuery>) -> Response {
    let tenant = state.tenant(q.tenant.as_deref());
    match state.db.analytics(&tenant).await {
        Ok(summary) => Json(serde_json::json!({
            "tenant": tenant,
            "summary": summary,
            "live": state.metrics.snapshot().await,
        }))
        .into_response(),
        Err(e) => error_response(e.into()),
    }
}

// ── Compose ─────────────────────────────────────────────────────────────

async fn compose(State(state): State<AppState>, Json(body): Json<ComposeRequest>) -> Response {
    match state.composer.generate(&body).await {
        Ok(email) => Json(email).into_response(),
        Err(e) => error_response(e.into()),
    }
}

// ── Tracking ────────────────────────────────────────────────────────────

async fn track_open(State(state): State<AppState>, Path(token): Path<String>) -> Response {
    match state.db.record_open(&token, Utc::now()).await {
        Ok(Some(campaign_id)) => {
            debug!(campaign_id = %campaign_id, "Open tracked");
            state.metrics.tracking(campaign_id, TrackingKind::Open).await;
        }
        Ok(None) => debug!(token = %token, "Open for unknown token"),
        Err(e) => warn!(error = %e, "Failed to record open"),
    }
    // Always serve the pixel.
    (
        [
            (header::CONTENT_TYPE, "image/gif"),
            (header::CACHE_CONTROL, "no-store, max-age=0"),
        ],
        PIXEL_GIF.to_vec(),
    )
        .into_response()
}

#[derive(Deserialize)]
struct ClickQuery {
    url: String,
}

async fn track_click(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Query(q): Query<ClickQuery>,
) -> Response {
    let target = match reqwest::Url::parse(&q.url) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => url,
        _ => return error_json(StatusCode::BAD_REQUEST, "Invalid redirect URL"),
    };
    match state.db.record_click(&token, Utc::now()).await {
        Ok(Some(campaign_id)) => {
            debug!(campaign_id = %campaign_id, "Click tracked");
            state.metrics.tracking(campaign_id, TrackingKind::Click).await;
        }
        Ok(None) => debug!(token = %token, "Click for unknown token"),
        Err(e) => warn!(error = %e, "Failed to record click"),
    }
    Redirect::temporary(target.as_str()).into_response()
}
