//! Live sensor polling and connectivity tracking
//!
//! One device may be backed by a real sensor bridge that serves JSON over
//! HTTP. The poller fetches it on a fixed interval, and [`ConnectionState`]
//! turns the stream of successes and failures into user-facing
//! connectivity state: an alert after repeated failures and a short-lived
//! "restored" notice once data flows again.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::controller::TimerEvent;
use crate::models::{LiveSample, LiveWireReading};

/// Failure to obtain a live reading. Never fatal.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("endpoint answered HTTP {0}")]
    Status(u16),

    #[error("invalid payload: {0}")]
    Decode(String),

    #[error("no answer within {0} ms")]
    Timeout(u64),
}

/// Source of live readings
#[async_trait]
pub trait LiveFetcher: Send + Sync {
    async fn fetch(&self) -> Result<LiveSample, FetchError>;
}

/// Fetches the sensor bridge JSON over HTTP
pub struct HttpLiveFetcher {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpLiveFetcher {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            url: url.into(),
            timeout,
        })
    }

    fn classify(&self, error: reqwest::Error) -> FetchError {
        if error.is_timeout() {
            FetchError::Timeout(self.timeout.as_millis() as u64)
        } else if error.is_decode() {
            FetchError::Decode(error.to_string())
        } else {
            FetchError::Transport(error.to_string())
        }
    }
}

#[async_trait]
impl LiveFetcher for HttpLiveFetcher {
    async fn fetch(&self) -> Result<LiveSample, FetchError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let reading: LiveWireReading = response.json().await.map_err(|e| self.classify(e))?;
        Ok(reading.into_sample(Utc::now()))
    }
}

/// Spawn the live polling loop for one selection.
///
/// The first fetch happens immediately. Each fetch is bounded by `timeout`,
/// which must stay below `every` so requests never overlap.
pub fn spawn_poller(
    fetcher: Arc<dyn LiveFetcher>,
    every: Duration,
    timeout: Duration,
    generation: u64,
    events: mpsc::UnboundedSender<TimerEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let result = match tokio::time::timeout(timeout, fetcher.fetch()).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::Timeout(timeout.as_millis() as u64)),
            };

            if events.send(TimerEvent::LivePoll { generation, result }).is_err() {
                debug!(generation, "Controller gone, stopping live poller");
                break;
            }
        }
    })
}

/// Connectivity banner the presentation layer should show
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectionNotice {
    None,
    /// Persistent until data flows again or the device is deselected
    Lost { message: String },
    /// Transient, clears on its own
    Restored { message: String },
}

/// Outcome of feeding one poll result into [`ConnectionState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionTransition {
    Unchanged,
    AlertRaised,
    Restored,
}

/// Snapshot of [`ConnectionState`] for publishing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionView {
    pub live_eligible: bool,
    pub available: bool,
    pub consecutive_failures: u32,
    pub alert_shown: bool,
    pub notice: ConnectionNotice,
}

impl ConnectionView {
    /// View for a device that never polls
    pub fn idle() -> Self {
        Self {
            live_eligible: false,
            available: false,
            consecutive_failures: 0,
            alert_shown: false,
            notice: ConnectionNotice::None,
        }
    }
}

/// Connectivity of the live-eligible device for the current selection
#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub available: bool,
    pub consecutive_failures: u32,
    pub alert_shown: bool,
    failure_threshold: u32,
    restored_notice: Duration,
    restored_at: Option<Instant>,
    alert_message: Option<String>,
}

impl ConnectionState {
    pub fn new(failure_threshold: u32, restored_notice: Duration) -> Self {
        Self {
            available: false,
            consecutive_failures: 0,
            alert_shown: false,
            failure_threshold: failure_threshold.max(1),
            restored_notice,
            restored_at: None,
            alert_message: None,
        }
    }

    /// A fetch succeeded.
    pub fn record_success(&mut self, now: Instant) -> ConnectionTransition {
        self.available = true;

        if self.consecutive_failures == 0 {
            return ConnectionTransition::Unchanged;
        }

        info!(
            failures = self.consecutive_failures,
            "Live sensor connection restored"
        );
        self.consecutive_failures = 0;
        self.alert_shown = false;
        self.alert_message = None;
        self.restored_at = Some(now);
        ConnectionTransition::Restored
    }

    /// A fetch failed. Raises the alert once the threshold is reached, at most once per outage.
    pub fn record_failure(&mut self, error: &FetchError) -> ConnectionTransition {
        self.available = false;
        self.consecutive_failures += 1;
        self.restored_at = None;

        warn!(
            error = %error,
            failures = self.consecutive_failures,
            "Live sensor fetch failed, falling back to synthetic data"
        );

        if self.consecutive_failures >= self.failure_threshold && !self.alert_shown {
            let hint = match error {
                FetchError::Transport(_) | FetchError::Timeout(_) => {
                    "Verifique que el servidor esté ejecutándose y accesible en la red.".to_string()
                }
                other => format!("Error: {}", other),
            };
            self.alert_shown = true;
            self.alert_message = Some(format!(
                "No se pueden obtener datos del sensor. {}",
                hint
            ));
            warn!(
                failures = self.consecutive_failures,
                "Live sensor connectivity alert raised"
            );
            return ConnectionTransition::AlertRaised;
        }

        ConnectionTransition::Unchanged
    }

    pub fn notice(&self, now: Instant) -> ConnectionNotice {
        if let Some(message) = self.alert_message.as_ref().filter(|_| self.alert_shown) {
            return ConnectionNotice::Lost {
                message: message.clone(),
            };
        }

        match self.restored_at {
            Some(at) if now.saturating_duration_since(at) < self.restored_notice => {
                ConnectionNotice::Restored {
                    message: "Conexión con el sensor restaurada correctamente".to_string(),
                }
            }
            _ => ConnectionNotice::None,
        }
    }

    pub fn view(&self, now: Instant) -> ConnectionView {
        ConnectionView {
            live_eligible: true,
            available: self.available,
            consecutive_failures: self.consecutive_failures,
            alert_shown: self.alert_shown,
            notice: self.notice(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn state() -> ConnectionState {
        ConnectionState::new(3, Duration::from_millis(5000))
    }

    fn transport() -> FetchError {
        FetchError::Transport("connection refused".into())
    }

    #[test]
    fn test_initial_state_is_cleared() {
        let s = state();
        assert!(!s.available);
        assert_eq!(s.consecutive_failures, 0);
        assert!(!s.alert_shown);
        assert_eq!(s.notice(Instant::now()), ConnectionNotice::None);
    }

    #[test]
    fn test_alert_raised_on_third_failure_only() {
        let mut s = state();
        assert_eq!(s.record_failure(&transport()), ConnectionTransition::Unchanged);
        assert!(!s.alert_shown);
        assert_eq!(s.record_failure(&transport()), ConnectionTransition::Unchanged);
        assert!(!s.alert_shown);
        assert_eq!(s.record_failure(&transport()), ConnectionTransition::AlertRaised);
        assert!(s.alert_shown);
        assert!(!s.available);
        assert!(matches!(s.notice(Instant::now()), ConnectionNotice::Lost { .. }));
    }

    #[test]
    fn test_alert_is_not_repeated() {
        let mut s = state();
        for _ in 0..3 {
            s.record_failure(&transport());
        }
        assert_eq!(s.record_failure(&transport()), ConnectionTransition::Unchanged);
        assert_eq!(s.record_failure(&FetchError::Status(502)), ConnectionTransition::Unchanged);
        assert_eq!(s.consecutive_failures, 5);
        assert!(s.alert_shown);
    }

    #[test]
    fn test_success_after_two_failures_resets_without_alert() {
        let mut s = state();
        s.record_failure(&transport());
        s.record_failure(&transport());

        let now = Instant::now();
        assert_eq!(s.record_success(now), ConnectionTransition::Restored);
        assert_eq!(s.consecutive_failures, 0);
        assert!(!s.alert_shown);
        assert!(s.available);
    }

    #[test]
    fn test_restored_notice_clears_after_five_seconds() {
        let mut s = state();
        for _ in 0..3 {
            s.record_failure(&transport());
        }
        let now = Instant::now();
        assert_eq!(s.record_success(now), ConnectionTransition::Restored);
        assert!(!s.alert_shown);

        assert!(matches!(s.notice(now), ConnectionNotice::Restored { .. }));
        assert!(matches!(
            s.notice(now + Duration::from_millis(4999)),
            ConnectionNotice::Restored { .. }
        ));
        assert_eq!(s.notice(now + Duration::from_millis(5000)), ConnectionNotice::None);
    }

    #[test]
    fn test_repeated_success_is_idempotent() {
        let mut s = state();
        let now = Instant::now();
        assert_eq!(s.record_success(now), ConnectionTransition::Unchanged);
        assert_eq!(s.record_success(now), ConnectionTransition::Unchanged);
        assert!(s.available);
        assert_eq!(s.consecutive_failures, 0);
        assert_eq!(s.notice(now), ConnectionNotice::None);
    }

    #[test]
    fn test_alert_message_explains_status_errors() {
        let mut s = state();
        for _ in 0..3 {
            s.record_failure(&FetchError::Status(503));
        }
        match s.notice(Instant::now()) {
            ConnectionNotice::Lost { message } => assert!(message.contains("HTTP 503")),
            other => panic!("unexpected notice {:?}", other),
        }
    }

    mod http {
        use super::*;
        use actix_web::{web, App, HttpResponse, HttpServer};

        async fn serve(body: &'static str, status: u16) -> (String, actix_web::dev::ServerHandle) {
            let server = HttpServer::new(move || {
                App::new().route(
                    "/api/datos",
                    web::get().to(move || async move {
                        HttpResponse::build(
                            actix_web::http::StatusCode::from_u16(status).unwrap(),
                        )
                        .content_type("application/json")
                        .body(body)
                    }),
                )
            })
            .workers(1)
            .bind(("127.0.0.1", 0))
            .unwrap();

            let addr = server.addrs()[0];
            let server = server.run();
            let handle = server.handle();
            actix_rt::spawn(server);
            (format!("http://{}/api/datos", addr), handle)
        }

        #[actix_web::test]
        async fn test_http_fetcher_reads_bridge_payload() {
            let (url, handle) = serve(
                r#"{"Vbat":52.3,"SOC":81.0,"Ppv":1450.0,"Vpv":39.5,"Ibat":-4.2}"#,
                200,
            )
            .await;

            let fetcher = HttpLiveFetcher::new(url, Duration::from_millis(2000)).unwrap();
            let sample = assert_ok!(fetcher.fetch().await);
            assert_eq!(sample.pack_voltage_v, 52.3);
            assert_eq!(sample.soc_pct, 81.0);
            assert_eq!(sample.net_power_w, -4.2);

            handle.stop(false).await;
        }

        #[actix_web::test]
        async fn test_http_fetcher_rejects_non_success_status() {
            let (url, handle) = serve("{}", 503).await;

            let fetcher = HttpLiveFetcher::new(url, Duration::from_millis(2000)).unwrap();
            let error = assert_err!(fetcher.fetch().await);
            assert_eq!(error, FetchError::Status(503));

            handle.stop(false).await;
        }

        #[actix_web::test]
        async fn test_http_fetcher_rejects_malformed_payload() {
            let (url, handle) = serve(r#"{"Vbat":"n/a"}"#, 200).await;

            let fetcher = HttpLiveFetcher::new(url, Duration::from_millis(2000)).unwrap();
            let error = assert_err!(fetcher.fetch().await);
            assert!(matches!(error, FetchError::Decode(_)));

            handle.stop(false).await;
        }
    }
}
