//! Solar installation monitor (solmon)
//!
//! Real-time backend for a fleet of solar+battery installations. Serves a
//! dashboard driven by an accelerated simulated day, overlays live sensor
//! readings for the one device wired to a real bridge, and classifies
//! device health against battery and solar thresholds.

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod aggregate;
mod alerts;
mod clock;
mod config;
mod controller;
mod error;
mod handlers;
mod live;
mod models;
mod profile;
mod reconcile;
mod state;
mod validation;
mod websocket;

use crate::config::{load_fleet, Settings};
use crate::controller::{ControllerConfig, ControllerHandle};
use crate::models::SocPolicy;
use crate::state::{default_devices, SessionState};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load .env
    dotenv::dotenv().ok();

    // Logging
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,solmon=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();

    // Load configuration
    let settings = Settings::from_env().context("Failed to load configuration")?;
    let bind_address = format!("{}:{}", settings.server.host, settings.server.port);

    info!("Starting solmon backend");

    let (devices, policy) = match settings.devices_file.as_deref() {
        Some(path) => {
            let fleet = load_fleet(path)?;
            (fleet.devices, fleet.soc_policy)
        }
        None => {
            info!("No DEVICES_FILE configured, using built-in fleet");
            (default_devices(), SocPolicy::default())
        }
    };

    match settings.live.endpoint_url.as_deref() {
        Some(url) => info!(device = %settings.live.device, url = %url, "Live sensor bridge enabled"),
        None => info!("LIVE_ENDPOINT_URL not set, every device runs on synthetic data"),
    }

    // ---------------------------------------------------------------------
    // Session controller
    // ---------------------------------------------------------------------
    let controller_config =
        ControllerConfig::from_settings(&settings).context("Failed to build live sensor client")?;
    let controller = ControllerHandle::spawn(SessionState::new(devices, policy), controller_config);

    // ---------------------------------------------------------------------
    // HTTP + WebSocket server
    // ---------------------------------------------------------------------
    info!("Binding server to {}", bind_address);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(controller.clone()))
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            .wrap(tracing_actix_web::TracingLogger::default())
            .configure(handlers::configure_routes)
    })
    .bind(&bind_address)
    .with_context(|| format!("Failed to bind {}", bind_address))?
    .run()
    .await
    .context("HTTP server failed")
}
