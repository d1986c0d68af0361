//! Reconciliation controller
//!
//! A single task owns the session: the fleet, the caches, the current
//! selection and its connectivity state. HTTP handlers talk to it through
//! [`ControllerHandle`] and timer tasks feed it [`TimerEvent`]s, so every
//! effect is applied in one place and in order.
//!
//! Each selection gets a fresh generation number. Timers are tagged with the
//! generation they were started for and the controller drops anything that
//! does not match the current one, so a tick or poll result that was already
//! in flight when the user switched devices can never touch the new
//! selection.

use chrono::{Local, Timelike, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::alerts::{evaluate, DeviceHealth};
use crate::clock::{spawn_ticker, SimulationClock};
use crate::config::Settings;
use crate::error::{AppError, AppResult};
use crate::live::{
    spawn_poller, ConnectionState, ConnectionTransition, ConnectionView, FetchError,
    HttpLiveFetcher, LiveFetcher,
};
use crate::models::{DashboardUpdate, DayProfile, Device, LiveSample, SocPolicy};
use crate::profile::DaySummary;
use crate::reconcile::{live_telemetry, synthetic_telemetry};
use crate::state::{CreditAction, FleetOverview, SessionState};
use crate::validation::validate_soc_policy;

/// Command queue depth
const COMMAND_BUFFER: usize = 64;

/// Message from a timer task, tagged with the selection it was started for
#[derive(Debug)]
pub enum TimerEvent {
    Tick {
        generation: u64,
    },
    LivePoll {
        generation: u64,
        result: Result<LiveSample, FetchError>,
    },
}

impl TimerEvent {
    fn generation(&self) -> u64 {
        match self {
            TimerEvent::Tick { generation } | TimerEvent::LivePoll { generation, .. } => *generation,
        }
    }
}

/// The device backed by a real sensor bridge
#[derive(Clone)]
pub struct LiveSource {
    pub device: String,
    pub fetcher: Arc<dyn LiveFetcher>,
    pub poll_interval: Duration,
    pub timeout: Duration,
}

/// Timer and connectivity parameters
#[derive(Clone)]
pub struct ControllerConfig {
    pub tick: Duration,
    pub start_hour: u8,
    pub live: Option<LiveSource>,
    pub failure_threshold: u32,
    pub restored_notice: Duration,
}

impl ControllerConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self, FetchError> {
        let live = match settings.live.endpoint_url.as_deref() {
            Some(url) => Some(LiveSource {
                device: settings.live.device.clone(),
                fetcher: Arc::new(HttpLiveFetcher::new(url, settings.live.timeout())?),
                poll_interval: settings.live.poll_interval(),
                timeout: settings.live.timeout(),
            }),
            None => None,
        };

        Ok(Self {
            tick: Duration::from_millis(settings.simulation.tick_ms),
            start_hour: settings.simulation.start_hour,
            live,
            failure_threshold: settings.live.failure_threshold,
            restored_notice: settings.live.restored_notice(),
        })
    }
}

/// Session information for the health endpoint
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub uptime_seconds: u64,
    pub selected_device: Option<String>,
}

/// Reply channel of a [`Command`]
pub type Reply<T> = oneshot::Sender<T>;

/// Requests served by the controller
pub enum Command {
    Select { device: String, reply: Reply<AppResult<DashboardUpdate>> },
    Deselect { reply: Reply<()> },
    ListDevices { query: Option<String>, reply: Reply<Vec<Device>> },
    GetDevice { name: String, reply: Reply<AppResult<Device>> },
    UpsertDevice { device: Device, reply: Reply<bool> },
    RemoveDevice { name: String, reply: Reply<AppResult<Device>> },
    AdjustCredit { name: String, days: u32, action: CreditAction, reply: Reply<AppResult<u32>> },
    Profile { name: String, reply: Reply<AppResult<DayProfile>> },
    Summary { name: String, reply: Reply<AppResult<DaySummary>> },
    Annual { name: String, year: i32, reply: Reply<AppResult<[u64; 12]>> },
    Monthly { name: String, year: i32, month: usize, reply: Reply<AppResult<Vec<u64>>> },
    Fleet { reply: Reply<FleetOverview> },
    GetPolicy { reply: Reply<SocPolicy> },
    SetPolicy { policy: SocPolicy, reply: Reply<AppResult<SocPolicy>> },
    Connection { reply: Reply<ConnectionView> },
    Info { reply: Reply<SessionInfo> },
}

/// What is currently on screen
struct Selection {
    device: String,
    generation: u64,
    clock: SimulationClock,
    /// Present only for the live-eligible device
    connection: Option<ConnectionState>,
    last_live: Option<LiveSample>,
    timers: Vec<JoinHandle<()>>,
}

impl Drop for Selection {
    fn drop(&mut self) {
        for timer in &self.timers {
            timer.abort();
        }
    }
}

/// Session owner
pub struct Controller {
    state: SessionState,
    config: ControllerConfig,
    selection: Option<Selection>,
    generation: u64,
    commands: mpsc::Receiver<Command>,
    events_tx: mpsc::UnboundedSender<TimerEvent>,
    events_rx: mpsc::UnboundedReceiver<TimerEvent>,
    updates: watch::Sender<Option<DashboardUpdate>>,
}

impl Controller {
    pub fn new(state: SessionState, config: ControllerConfig) -> (Self, ControllerHandle) {
        let (commands_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (updates, updates_rx) = watch::channel(None);

        let controller = Self {
            state,
            config,
            selection: None,
            generation: 0,
            commands,
            events_tx,
            events_rx,
            updates,
        };
        let handle = ControllerHandle {
            commands: commands_tx,
            updates: updates_rx,
        };
        (controller, handle)
    }

    /// Process commands and timer events until every handle is dropped
    pub async fn run(mut self) {
        info!("Controller started");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event),
            }
        }
        self.selection = None;
        info!("Controller stopped");
    }

    fn handle_command(&mut self, command: Command) {
        // A dropped reply means the requester went away; nothing to do.
        match command {
            Command::Select { device, reply } => {
                let _ = reply.send(self.select(&device));
            }
            Command::Deselect { reply } => {
                self.deselect();
                let _ = reply.send(());
            }
            Command::ListDevices { query, reply } => {
                let devices = self
                    .state
                    .search(query.as_deref().unwrap_or(""))
                    .into_iter()
                    .cloned()
                    .collect();
                let _ = reply.send(devices);
            }
            Command::GetDevice { name, reply } => {
                let _ = reply.send(self.state.device(&name).cloned());
            }
            Command::UpsertDevice { device, reply } => {
                let _ = reply.send(self.upsert(device));
            }
            Command::RemoveDevice { name, reply } => {
                let _ = reply.send(self.remove(&name));
            }
            Command::AdjustCredit { name, days, action, reply } => {
                let _ = reply.send(self.state.adjust_credit(&name, days, action));
            }
            Command::Profile { name, reply } => {
                let _ = reply.send(self.state.profile(&name).cloned());
            }
            Command::Summary { name, reply } => {
                let _ = reply.send(self.state.profile(&name).map(DaySummary::from_profile));
            }
            Command::Annual { name, year, reply } => {
                let _ = reply.send(self.state.annual(&name, year));
            }
            Command::Monthly { name, year, month, reply } => {
                let _ = reply.send(self.state.monthly(&name, year, month).map(|days| days.to_vec()));
            }
            Command::Fleet { reply } => {
                let hour = self
                    .selection
                    .as_ref()
                    .map(|s| s.clock.hour())
                    .unwrap_or(self.config.start_hour);
                let _ = reply.send(self.state.fleet_overview(hour));
            }
            Command::GetPolicy { reply } => {
                let _ = reply.send(self.state.policy());
            }
            Command::SetPolicy { policy, reply } => {
                let _ = reply.send(self.set_policy(policy));
            }
            Command::Connection { reply } => {
                let view = self
                    .selection
                    .as_ref()
                    .and_then(|s| s.connection.as_ref())
                    .map(|c| c.view(Instant::now()))
                    .unwrap_or_else(ConnectionView::idle);
                let _ = reply.send(view);
            }
            Command::Info { reply } => {
                let _ = reply.send(SessionInfo {
                    uptime_seconds: self.state.uptime_seconds(),
                    selected_device: self.selection.as_ref().map(|s| s.device.clone()),
                });
            }
        }
    }

    fn handle_event(&mut self, event: TimerEvent) {
        let generation = event.generation();
        let Some(selection) = self
            .selection
            .as_mut()
            .filter(|s| s.generation == generation)
        else {
            debug!(generation, current = self.generation, "Dropping stale timer event");
            return;
        };

        match event {
            TimerEvent::Tick { .. } => {
                let hour = selection.clock.advance();
                debug!(device = %selection.device, hour, "Simulation tick");
            }
            TimerEvent::LivePoll { result, .. } => {
                let Some(connection) = selection.connection.as_mut() else {
                    return;
                };
                match result {
                    Ok(sample) => {
                        if connection.record_success(Instant::now()) == ConnectionTransition::Restored {
                            info!(device = %selection.device, "Live data flowing again");
                        }
                        selection.last_live = Some(sample);
                    }
                    Err(error) => {
                        if connection.record_failure(&error) == ConnectionTransition::AlertRaised {
                            warn!(device = %selection.device, "Showing live connectivity alert");
                        }
                        selection.last_live = None;
                    }
                }
            }
        }

        self.publish();
    }

    /// Switch the dashboard to `name`. Old timers stop before new ones start.
    fn select(&mut self, name: &str) -> AppResult<DashboardUpdate> {
        let device = self.state.device(name)?.clone();

        self.selection = None;
        self.generation += 1;
        let generation = self.generation;

        let mut timers = Vec::new();
        let mut connection = None;

        if device.active {
            self.state.profile(name)?;
            timers.push(spawn_ticker(self.config.tick, generation, self.events_tx.clone()));

            if let Some(live) = self.config.live.as_ref().filter(|l| l.device == device.name) {
                connection = Some(ConnectionState::new(
                    self.config.failure_threshold,
                    self.config.restored_notice,
                ));
                timers.push(spawn_poller(
                    live.fetcher.clone(),
                    live.poll_interval,
                    live.timeout,
                    generation,
                    self.events_tx.clone(),
                ));
            }
        }

        info!(
            device = %device.name,
            generation,
            active = device.active,
            live = connection.is_some(),
            "Device selected"
        );

        self.selection = Some(Selection {
            device: device.name,
            generation,
            clock: SimulationClock::starting_at(self.config.start_hour),
            connection,
            last_live: None,
            timers,
        });

        self.publish()
            .ok_or_else(|| AppError::InternalError("selection produced no update".into()))
    }

    fn deselect(&mut self) {
        if let Some(selection) = self.selection.take() {
            info!(device = %selection.device, "Device deselected");
        }
        self.generation += 1;
        self.updates.send_replace(None);
    }

    fn upsert(&mut self, device: Device) -> bool {
        let name = device.name.clone();
        let created = self.state.upsert(device);

        if self.selected_device() == Some(name.as_str()) {
            if let Err(error) = self.select(&name) {
                warn!(device = %name, error = %error, "Reselecting edited device failed");
                self.deselect();
            }
        }
        created
    }

    fn remove(&mut self, name: &str) -> AppResult<Device> {
        let device = self.state.remove(name)?;
        if self.selected_device() == Some(name) {
            self.deselect();
        }
        Ok(device)
    }

    fn set_policy(&mut self, policy: SocPolicy) -> AppResult<SocPolicy> {
        validate_soc_policy(&policy)?;
        self.state.set_policy(policy);
        if self.selection.is_some() {
            self.publish();
        }
        Ok(policy)
    }

    fn selected_device(&self) -> Option<&str> {
        self.selection.as_ref().map(|s| s.device.as_str())
    }

    /// Reconcile the current selection into an update and broadcast it
    fn publish(&mut self) -> Option<DashboardUpdate> {
        let selection = self.selection.as_ref()?;
        let device = self.state.device(&selection.device).ok()?.clone();
        let connection = selection
            .connection
            .as_ref()
            .map(|c| c.view(Instant::now()))
            .unwrap_or_else(ConnectionView::idle);

        let (status, telemetry, alerts) = if device.active {
            let policy = self.state.policy();
            let live = selection
                .last_live
                .as_ref()
                .filter(|_| selection.connection.as_ref().is_some_and(|c| c.available));

            let telemetry = match live {
                Some(sample) => {
                    let hour = sample.timestamp.with_timezone(&Local).hour() as u8;
                    live_telemetry(sample, device.base_load_kw, hour, self.state.rng())
                }
                None => {
                    let hour = selection.clock.hour();
                    match self.state.profile(&device.name) {
                        Ok(profile) => synthetic_telemetry(profile, hour, &policy),
                        Err(error) => {
                            warn!(device = %device.name, error = %error, "No profile to publish");
                            return None;
                        }
                    }
                }
            };
            let alerts = evaluate(&telemetry, &policy);
            debug!(
                device = %device.name,
                live = telemetry.is_live(),
                hour = telemetry.hour(),
                soc = telemetry.soc_pct(),
                status = %alerts.status,
                "Reconciled telemetry"
            );
            (alerts.status.clone(), Some(telemetry), Some(alerts))
        } else {
            (DeviceHealth::Inactive.label().to_string(), None, None)
        };

        let update = DashboardUpdate {
            id: Uuid::new_v4(),
            device: device.name,
            published_at: Utc::now(),
            status,
            telemetry,
            alerts,
            connection,
        };

        debug!(update_id = %update.id, device = %update.device, "Publishing dashboard update");
        self.updates.send_replace(Some(update.clone()));
        Some(update)
    }
}

/// Cloneable client of the controller task
#[derive(Clone)]
pub struct ControllerHandle {
    commands: mpsc::Sender<Command>,
    updates: watch::Receiver<Option<DashboardUpdate>>,
}

impl ControllerHandle {
    /// Spawn a controller on the current runtime
    pub fn spawn(state: SessionState, config: ControllerConfig) -> Self {
        let (controller, handle) = Controller::new(state, config);
        tokio::spawn(controller.run());
        handle
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> AppResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| AppError::InternalError("controller stopped".into()))?;
        response
            .await
            .map_err(|_| AppError::InternalError("controller dropped the request".into()))
    }

    /// Receiver of published updates; `None` while nothing is selected
    pub fn subscribe(&self) -> watch::Receiver<Option<DashboardUpdate>> {
        self.updates.clone()
    }

    /// Most recent update
    pub fn latest(&self) -> Option<DashboardUpdate> {
        self.updates.borrow().clone()
    }

    pub async fn select(&self, device: impl Into<String>) -> AppResult<DashboardUpdate> {
        let device = device.into();
        self.request(|reply| Command::Select { device, reply }).await?
    }

    pub async fn deselect(&self) -> AppResult<()> {
        self.request(|reply| Command::Deselect { reply }).await
    }

    pub async fn devices(&self, query: Option<String>) -> AppResult<Vec<Device>> {
        self.request(|reply| Command::ListDevices { query, reply }).await
    }

    pub async fn device(&self, name: impl Into<String>) -> AppResult<Device> {
        let name = name.into();
        self.request(|reply| Command::GetDevice { name, reply }).await?
    }

    /// Store a device; `true` when it did not exist before
    pub async fn upsert_device(&self, device: Device) -> AppResult<bool> {
        self.request(|reply| Command::UpsertDevice { device, reply }).await
    }

    pub async fn remove_device(&self, name: impl Into<String>) -> AppResult<Device> {
        let name = name.into();
        self.request(|reply| Command::RemoveDevice { name, reply }).await?
    }

    pub async fn adjust_credit(
        &self,
        name: impl Into<String>,
        days: u32,
        action: CreditAction,
    ) -> AppResult<u32> {
        let name = name.into();
        self.request(|reply| Command::AdjustCredit { name, days, action, reply })
            .await?
    }

    pub async fn profile(&self, name: impl Into<String>) -> AppResult<DayProfile> {
        let name = name.into();
        self.request(|reply| Command::Profile { name, reply }).await?
    }

    pub async fn summary(&self, name: impl Into<String>) -> AppResult<DaySummary> {
        let name = name.into();
        self.request(|reply| Command::Summary { name, reply }).await?
    }

    pub async fn annual(&self, name: impl Into<String>, year: i32) -> AppResult<[u64; 12]> {
        let name = name.into();
        self.request(|reply| Command::Annual { name, year, reply }).await?
    }

    pub async fn monthly(
        &self,
        name: impl Into<String>,
        year: i32,
        month: usize,
    ) -> AppResult<Vec<u64>> {
        let name = name.into();
        self.request(|reply| Command::Monthly { name, year, month, reply })
            .await?
    }

    pub async fn fleet(&self) -> AppResult<FleetOverview> {
        self.request(|reply| Command::Fleet { reply }).await
    }

    pub async fn policy(&self) -> AppResult<SocPolicy> {
        self.request(|reply| Command::GetPolicy { reply }).await
    }

    pub async fn set_policy(&self, policy: SocPolicy) -> AppResult<SocPolicy> {
        self.request(|reply| Command::SetPolicy { policy, reply }).await?
    }

    pub async fn connection(&self) -> AppResult<ConnectionView> {
        self.request(|reply| Command::Connection { reply }).await
    }

    pub async fn info(&self) -> AppResult<SessionInfo> {
        self.request(|reply| Command::Info { reply }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::ConnectionNotice;
    use crate::models::Telemetry;
    use crate::state::default_devices;
    use async_trait::async_trait;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::sleep;

    /// Replays scripted results, then repeats the fallback forever
    struct ScriptedFetcher {
        script: Mutex<VecDeque<Result<LiveSample, FetchError>>>,
        fallback: Result<LiveSample, FetchError>,
        calls: AtomicUsize,
    }

    impl ScriptedFetcher {
        fn new(
            script: Vec<Result<LiveSample, FetchError>>,
            fallback: Result<LiveSample, FetchError>,
        ) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                fallback,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl LiveFetcher for ScriptedFetcher {
        async fn fetch(&self) -> Result<LiveSample, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| self.fallback.clone())
        }
    }

    fn sample() -> LiveSample {
        LiveSample {
            pack_voltage_v: 52.0,
            soc_pct: 70.0,
            solar_w: 2500.0,
            panel_voltage_v: 41.0,
            net_power_w: 300.0,
            inverter_state: None,
            timestamp: Utc::now(),
        }
    }

    fn refused() -> FetchError {
        FetchError::Transport("connection refused".into())
    }

    fn config(fetcher: Option<Arc<ScriptedFetcher>>) -> ControllerConfig {
        ControllerConfig {
            tick: Duration::from_millis(2000),
            start_hour: 6,
            live: fetcher.map(|f| LiveSource {
                device: "Equipo 1".into(),
                fetcher: f,
                poll_interval: Duration::from_millis(3000),
                timeout: Duration::from_millis(2500),
            }),
            failure_threshold: 3,
            restored_notice: Duration::from_millis(5000),
        }
    }

    fn state() -> SessionState {
        SessionState::with_rng(default_devices(), SocPolicy::default(), StdRng::seed_from_u64(1))
    }

    fn spawn(fetcher: Option<Arc<ScriptedFetcher>>) -> ControllerHandle {
        ControllerHandle::spawn(state(), config(fetcher))
    }

    fn hour_of(update: &DashboardUpdate) -> u8 {
        update.telemetry.as_ref().map(Telemetry::hour).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_selection_publishes_start_hour_and_ticks() {
        let handle = spawn(None);

        let update = handle.select("Equipo 3").await.unwrap();
        assert_eq!(update.device, "Equipo 3");
        assert_eq!(hour_of(&update), 6);
        assert!(update.alerts.is_some());
        assert!(!update.connection.live_eligible);

        sleep(Duration::from_millis(2100)).await;
        assert_eq!(hour_of(&handle.latest().unwrap()), 7);

        sleep(Duration::from_millis(4000)).await;
        assert_eq!(hour_of(&handle.latest().unwrap()), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_device_is_rejected() {
        let handle = spawn(None);
        assert!(matches!(handle.select("Equipo 9").await, Err(AppError::NotFound(_))));
        assert!(handle.latest().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactive_selection_starts_no_timers() {
        let handle = spawn(None);

        let update = handle.select("Equipo 2").await.unwrap();
        assert_eq!(update.status, "INACTIVO");
        assert!(update.telemetry.is_none());
        assert!(update.alerts.is_none());

        sleep(Duration::from_millis(10_000)).await;
        assert_eq!(handle.latest().unwrap().id, update.id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_alert_raised_on_third_consecutive_failure() {
        let fetcher = ScriptedFetcher::new(vec![], Err(refused()));
        let handle = spawn(Some(fetcher.clone()));

        handle.select("Equipo 1").await.unwrap();

        // polls at 0 and 3000 ms
        sleep(Duration::from_millis(3100)).await;
        let view = handle.connection().await.unwrap();
        assert_eq!(view.consecutive_failures, 2);
        assert!(!view.alert_shown);
        assert!(!view.available);

        // third poll at 6000 ms
        sleep(Duration::from_millis(3000)).await;
        let view = handle.connection().await.unwrap();
        assert_eq!(view.consecutive_failures, 3);
        assert!(view.alert_shown);
        assert!(matches!(view.notice, ConnectionNotice::Lost { .. }));

        // synthetic fallback keeps the dashboard alive
        let latest = handle.latest().unwrap();
        assert!(!latest.telemetry.unwrap().is_live());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_two_failures_restores_without_alert() {
        let fetcher = ScriptedFetcher::new(vec![Err(refused()), Err(refused())], Ok(sample()));
        let handle = spawn(Some(fetcher));

        handle.select("Equipo 1").await.unwrap();

        sleep(Duration::from_millis(6100)).await;
        let view = handle.connection().await.unwrap();
        assert_eq!(view.consecutive_failures, 0);
        assert!(view.available);
        assert!(!view.alert_shown);
        assert!(matches!(view.notice, ConnectionNotice::Restored { .. }));

        let latest = handle.latest().unwrap();
        assert!(latest.telemetry.unwrap().is_live());

        // restored at 6000 ms, notice gone 5000 ms later
        sleep(Duration::from_millis(5000)).await;
        assert_eq!(handle.connection().await.unwrap().notice, ConnectionNotice::None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_sample_feeds_dashboard() {
        let fetcher = ScriptedFetcher::new(vec![], Ok(sample()));
        let handle = spawn(Some(fetcher));

        handle.select("Equipo 1").await.unwrap();
        sleep(Duration::from_millis(100)).await;

        let latest = handle.latest().unwrap();
        match latest.telemetry.unwrap() {
            Telemetry::Live { sample, complement, .. } => {
                assert_eq!(sample.solar_w, 2500.0);
                // base 8 kW -> reference demand 4000 W
                assert_eq!(complement.grid_import_w, 1200.0);
            }
            other => panic!("unexpected telemetry {:?}", other),
        }
        assert!(latest.connection.available);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switching_device_discards_connection_state() {
        let fetcher = ScriptedFetcher::new(vec![], Err(refused()));
        let handle = spawn(Some(fetcher.clone()));

        handle.select("Equipo 1").await.unwrap();
        sleep(Duration::from_millis(3100)).await;
        assert_eq!(handle.connection().await.unwrap().consecutive_failures, 2);

        handle.select("Equipo 3").await.unwrap();
        assert_eq!(handle.connection().await.unwrap(), ConnectionView::idle());

        // no polling while another device is selected
        let calls = fetcher.calls.load(Ordering::SeqCst);
        sleep(Duration::from_millis(9000)).await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), calls);

        let update = handle.select("Equipo 1").await.unwrap();
        assert_eq!(update.connection.consecutive_failures, 0);
        assert!(!update.connection.alert_shown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_events_are_dropped() {
        let (mut controller, _handle) = Controller::new(state(), config(None));

        controller.select("Equipo 1").unwrap();
        let old = controller.generation;
        controller.select("Equipo 3").unwrap();

        controller.handle_event(TimerEvent::Tick { generation: old });
        controller.handle_event(TimerEvent::LivePoll {
            generation: old,
            result: Ok(sample()),
        });

        let selection = controller.selection.as_ref().unwrap();
        assert_eq!(selection.device, "Equipo 3");
        assert_eq!(selection.clock.hour(), 6);
        assert!(selection.last_live.is_none());

        controller.handle_event(TimerEvent::Tick {
            generation: controller.generation,
        });
        assert_eq!(controller.selection.as_ref().unwrap().clock.hour(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_removing_selected_device_deselects() {
        let handle = spawn(None);
        handle.select("Equipo 3").await.unwrap();

        handle.remove_device("Equipo 3").await.unwrap();
        assert!(handle.latest().is_none());
        assert!(handle.info().await.unwrap().selected_device.is_none());
        assert!(matches!(handle.profile("Equipo 3").await, Err(AppError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_policy_change_applies_to_selection() {
        let handle = spawn(None);
        handle.select("Equipo 1").await.unwrap();

        let policy = SocPolicy { soc_max: 80, dod: 60 };
        handle.set_policy(policy).await.unwrap();

        let latest = handle.latest().unwrap();
        let soc = latest.telemetry.unwrap().soc_pct();
        assert!((60.0..=80.0).contains(&soc));
        assert_eq!(handle.profile("Equipo 1").await.unwrap().policy, policy);

        let rejected = handle.set_policy(SocPolicy { soc_max: 60, dod: 60 }).await;
        assert!(matches!(rejected, Err(AppError::Configuration(_))));
        assert_eq!(handle.policy().await.unwrap(), policy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deactivating_selected_device_stops_ticks() {
        let handle = spawn(None);
        handle.select("Equipo 3").await.unwrap();

        let mut device = handle.device("Equipo 3").await.unwrap();
        device.active = false;
        assert!(!handle.upsert_device(device).await.unwrap());

        let update = handle.latest().unwrap();
        assert_eq!(update.status, "INACTIVO");

        sleep(Duration::from_millis(5000)).await;
        assert_eq!(handle.latest().unwrap().id, update.id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_controller_stops_when_handles_drop() {
        let (controller, handle) = Controller::new(state(), config(None));
        let task = tokio::spawn(controller.run());

        handle.select("Equipo 1").await.unwrap();
        drop(handle);

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
