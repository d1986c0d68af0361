//! HTTP request handlers
//!
//! Implements the REST API and the WebSocket upgrade. Every handler is a
//! thin adapter over [`ControllerHandle`]; validation happens here, at the
//! boundary, before anything reaches the session.

use actix_web::{web, HttpRequest, HttpResponse, Result};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::controller::ControllerHandle;
use crate::error::AppError;
use crate::models::{DeviceInput, HealthCheck, SocPolicy};
use crate::state::CreditAction;
use crate::validation::{
    validate_credit_days, validate_device_input, validate_month, validate_soc_policy,
    validate_year,
};
use crate::websocket::WsSession;

/// Configure all application routes
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            // Health check
            .route("/health", web::get().to(health_check))
            // Fleet
            .route("/devices", web::get().to(list_devices))
            .route("/devices/{name}", web::get().to(get_device))
            .route("/devices/{name}", web::put().to(put_device))
            .route("/devices/{name}", web::delete().to(delete_device))
            .route("/devices/{name}/credit", web::post().to(adjust_credit))
            .route("/devices/{name}/profile", web::get().to(get_profile))
            .route("/devices/{name}/summary", web::get().to(get_summary))
            .route(
                "/devices/{name}/history/annual/{year}",
                web::get().to(get_annual_history),
            )
            .route(
                "/devices/{name}/history/monthly/{year}/{month}",
                web::get().to(get_monthly_history),
            )
            .route("/alerts", web::get().to(get_alerts))
            // SOC policy
            .route("/soc-policy", web::get().to(get_soc_policy))
            .route("/soc-policy", web::put().to(put_soc_policy))
            // Dashboard session
            .route("/selection", web::post().to(select_device))
            .route("/selection", web::delete().to(deselect_device))
            .route("/dashboard", web::get().to(get_dashboard))
            .route("/connection", web::get().to(get_connection)),
    )
    // WebSocket endpoint
    .route("/ws", web::get().to(websocket_handler));
}

/// Health check endpoint
///
/// GET /api/health
pub async fn health_check(
    controller: web::Data<ControllerHandle>,
) -> Result<HttpResponse, AppError> {
    let session = controller.info().await?;

    let health = HealthCheck {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now(),
        uptime_seconds: session.uptime_seconds,
        selected_device: session.selected_device,
    };

    Ok(HttpResponse::Ok().json(health))
}

/// Query parameters for the device list
#[derive(Debug, Deserialize)]
pub struct DeviceQuery {
    pub q: Option<String>,
}

/// List devices, optionally filtered
///
/// GET /api/devices?q=industrial
pub async fn list_devices(
    controller: web::Data<ControllerHandle>,
    query: web::Query<DeviceQuery>,
) -> Result<HttpResponse, AppError> {
    let devices = controller.devices(query.into_inner().q).await?;
    Ok(HttpResponse::Ok().json(devices))
}

/// GET /api/devices/{name}
pub async fn get_device(
    controller: web::Data<ControllerHandle>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let device = controller.device(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(device))
}

/// Create or replace a device
///
/// PUT /api/devices/{name}
pub async fn put_device(
    controller: web::Data<ControllerHandle>,
    path: web::Path<String>,
    body: web::Json<DeviceInput>,
    req: HttpRequest,
) -> Result<HttpResponse, AppError> {
    let correlation_id = extract_correlation_id(&req);
    let name = path.into_inner();

    validate_device_input(&name, &body)?;

    let device = body.into_inner().into_device(name);
    let created = controller.upsert_device(device.clone()).await?;

    info!(
        correlation_id = %correlation_id,
        device = %device.name,
        created,
        "Device saved"
    );

    if created {
        Ok(HttpResponse::Created().json(device))
    } else {
        Ok(HttpResponse::Ok().json(device))
    }
}

/// DELETE /api/devices/{name}
pub async fn delete_device(
    controller: web::Data<ControllerHandle>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    controller.remove_device(path.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}

/// Credit adjustment request body
#[derive(Debug, Serialize, Deserialize)]
pub struct CreditRequest {
    pub days: u32,
    pub action: CreditAction,
}

#[derive(Serialize)]
struct CreditResponse {
    device: String,
    credit_days: u32,
}

/// POST /api/devices/{name}/credit
pub async fn adjust_credit(
    controller: web::Data<ControllerHandle>,
    path: web::Path<String>,
    body: web::Json<CreditRequest>,
) -> Result<HttpResponse, AppError> {
    validate_credit_days(body.days)?;

    let device = path.into_inner();
    let credit_days = controller
        .adjust_credit(device.clone(), body.days, body.action)
        .await?;

    Ok(HttpResponse::Ok().json(CreditResponse {
        device,
        credit_days,
    }))
}

/// Synthetic day profile of an active device
///
/// GET /api/devices/{name}/profile
pub async fn get_profile(
    controller: web::Data<ControllerHandle>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let profile = controller.profile(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(profile))
}

/// GET /api/devices/{name}/summary
pub async fn get_summary(
    controller: web::Data<ControllerHandle>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let summary = controller.summary(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(summary))
}

#[derive(Serialize)]
struct AnnualHistory {
    device: String,
    year: i32,
    months: [u64; 12],
}

/// GET /api/devices/{name}/history/annual/{year}
pub async fn get_annual_history(
    controller: web::Data<ControllerHandle>,
    path: web::Path<(String, i32)>,
) -> Result<HttpResponse, AppError> {
    let (device, year) = path.into_inner();
    validate_year(year)?;

    let months = controller.annual(device.clone(), year).await?;
    Ok(HttpResponse::Ok().json(AnnualHistory {
        device,
        year,
        months,
    }))
}

#[derive(Serialize)]
struct MonthlyHistory {
    device: String,
    year: i32,
    month: usize,
    days: Vec<u64>,
}

/// Daily totals for a month; `month` is 0-based
///
/// GET /api/devices/{name}/history/monthly/{year}/{month}
pub async fn get_monthly_history(
    controller: web::Data<ControllerHandle>,
    path: web::Path<(String, i32, usize)>,
) -> Result<HttpResponse, AppError> {
    let (device, year, month) = path.into_inner();
    validate_year(year)?;
    validate_month(month)?;

    let days = controller.monthly(device.clone(), year, month).await?;
    Ok(HttpResponse::Ok().json(MonthlyHistory {
        device,
        year,
        month,
        days,
    }))
}

/// Fleet alert panel
///
/// GET /api/alerts
pub async fn get_alerts(
    controller: web::Data<ControllerHandle>,
) -> Result<HttpResponse, AppError> {
    let overview = controller.fleet().await?;
    Ok(HttpResponse::Ok().json(overview))
}

/// GET /api/soc-policy
pub async fn get_soc_policy(
    controller: web::Data<ControllerHandle>,
) -> Result<HttpResponse, AppError> {
    let policy = controller.policy().await?;
    Ok(HttpResponse::Ok().json(policy))
}

/// Replace the SOC policy; cached profiles are regenerated
///
/// PUT /api/soc-policy
pub async fn put_soc_policy(
    controller: web::Data<ControllerHandle>,
    body: web::Json<SocPolicy>,
    req: HttpRequest,
) -> Result<HttpResponse, AppError> {
    let correlation_id = extract_correlation_id(&req);
    validate_soc_policy(&body)?;

    let policy = controller.set_policy(body.into_inner()).await?;
    info!(
        correlation_id = %correlation_id,
        soc_max = policy.soc_max,
        dod = policy.dod,
        "SOC policy replaced"
    );
    Ok(HttpResponse::Ok().json(policy))
}

/// Selection request body
#[derive(Debug, Serialize, Deserialize)]
pub struct SelectionRequest {
    pub device: String,
}

/// Put a device on the dashboard
///
/// POST /api/selection
pub async fn select_device(
    controller: web::Data<ControllerHandle>,
    body: web::Json<SelectionRequest>,
    req: HttpRequest,
) -> Result<HttpResponse, AppError> {
    let correlation_id = extract_correlation_id(&req);
    let update = controller.select(body.into_inner().device).await?;

    info!(
        correlation_id = %correlation_id,
        device = %update.device,
        "Dashboard selection changed"
    );
    Ok(HttpResponse::Ok().json(update))
}

/// DELETE /api/selection
pub async fn deselect_device(
    controller: web::Data<ControllerHandle>,
) -> Result<HttpResponse, AppError> {
    controller.deselect().await?;
    Ok(HttpResponse::NoContent().finish())
}

/// Latest published dashboard update
///
/// GET /api/dashboard
pub async fn get_dashboard(
    controller: web::Data<ControllerHandle>,
) -> Result<HttpResponse, AppError> {
    controller
        .latest()
        .map(|update| HttpResponse::Ok().json(update))
        .ok_or_else(|| AppError::NotFound("No device selected".to_string()))
}

/// GET /api/connection
pub async fn get_connection(
    controller: web::Data<ControllerHandle>,
) -> Result<HttpResponse, AppError> {
    let view = controller.connection().await?;
    Ok(HttpResponse::Ok().json(view))
}

/// WebSocket upgrade handler
///
/// GET /ws
pub async fn websocket_handler(
    req: HttpRequest,
    stream: web::Payload,
    controller: web::Data<ControllerHandle>,
) -> Result<HttpResponse, actix_web::Error> {
    let client_id = Uuid::new_v4().to_string();

    info!(client_id = %client_id, "WebSocket connection request");

    let ws_session = WsSession::new(client_id, controller.subscribe());

    actix_web_actors::ws::start(ws_session, &req, stream)
}

/// Extract or generate correlation ID from request headers
fn extract_correlation_id(req: &HttpRequest) -> String {
    req.headers()
        .get("X-Correlation-ID")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}
