//! The per-device monitor task: initial sync, the continuous
//! change-detection loop, heartbeats, compliance snapshots, error backoff
//! and offline marking.
//!
//! One task owns one device. All of the device's mutable state
//! (`last_values`, error counters, the open connection) lives inside the
//! task; the only outbound paths are the change queue and the shared health
//! cell. Commands arrive over a channel, the way every actor in this
//! codebase is driven.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use daqsrv_protocol::{
    ChangeEvent, ChangeSource, Device, DeviceError, DeviceHealth, DeviceReadingSet,
    DeviceSnapshot, DeviceStatus, Error, Reading, Result, Value,
};

use crate::connection::DeviceConnection;
use crate::engine::dispatch::ChangeNotice;
use crate::engine::startup::BACKGROUND_RETRY;
use crate::reader::{read_device, DevicePlan};
use crate::sinks::DeviceCatalog;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const COMPLIANCE_INTERVAL: Duration = Duration::from_secs(300);
pub const MAX_CONSECUTIVE_ERRORS: u32 = 10;
pub const OFFLINE_BACKOFF: Duration = Duration::from_secs(300);
const TRANSIENT_BACKOFF_BASE: Duration = Duration::from_millis(500);
const TRANSIENT_BACKOFF_CAP: Duration = Duration::from_secs(30);
const HEALTH_WINDOW: usize = 50;
const RESPONSE_WINDOW: usize = 20;

/// Numeric change threshold: smaller absolute deltas are noise.
const CHANGE_THRESHOLD: f64 = 0.01;

pub enum DeviceCommand {
    Sync(oneshot::Sender<Result<()>>),
    ReadNow(oneshot::Sender<Result<DeviceReadingSet>>),
    TestConnection(oneshot::Sender<Result<Duration>>),
}

struct HealthInner {
    last_seen: Option<DateTime<Utc>>,
    status: DeviceStatus,
    online: bool,
    outcomes: VecDeque<bool>,
    response_times_ms: VecDeque<f64>,
}

/// Health view of one device, shared between its monitor task (writer) and
/// the engine API (readers).
#[derive(Clone)]
pub struct HealthCell(Arc<Mutex<HealthInner>>);

impl HealthCell {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(HealthInner {
            last_seen: None,
            status: DeviceStatus::Unknown,
            online: false,
            outcomes: VecDeque::new(),
            response_times_ms: VecDeque::new(),
        })))
    }

    fn record_success(&self, timestamp: DateTime<Utc>, elapsed: Duration) {
        let mut inner = self.0.lock().unwrap();
        inner.last_seen = Some(timestamp);
        inner.status = DeviceStatus::Online;
        inner.online = true;
        push_window(&mut inner.outcomes, true, HEALTH_WINDOW);
        push_window(
            &mut inner.response_times_ms,
            elapsed.as_secs_f64() * 1000.0,
            RESPONSE_WINDOW,
        );
    }

    fn record_failure(&self) {
        let mut inner = self.0.lock().unwrap();
        push_window(&mut inner.outcomes, false, HEALTH_WINDOW);
    }

    fn set_state(&self, status: DeviceStatus, online: bool) {
        let mut inner = self.0.lock().unwrap();
        inner.status = status;
        inner.online = online;
    }

    pub fn is_online(&self) -> bool {
        self.0.lock().unwrap().online
    }

    pub fn report(&self) -> DeviceHealth {
        let inner = self.0.lock().unwrap();
        let error_rate = if inner.outcomes.is_empty() {
            0.0
        } else {
            let failures = inner.outcomes.iter().filter(|ok| !**ok).count();
            failures as f64 / inner.outcomes.len() as f64
        };
        let response_time_ms = if inner.response_times_ms.is_empty() {
            None
        } else {
            Some(inner.response_times_ms.iter().sum::<f64>() / inner.response_times_ms.len() as f64)
        };
        DeviceHealth {
            last_seen: inner.last_seen,
            error_rate,
            response_time_ms,
            status: inner.status,
        }
    }
}

impl Default for HealthCell {
    fn default() -> Self {
        Self::new()
    }
}

fn push_window<T>(window: &mut VecDeque<T>, value: T, cap: usize) {
    if window.len() == cap {
        window.pop_front();
    }
    window.push_back(value);
}

/// Everything the engine keeps per spawned device task.
pub struct MonitorHandle {
    pub cmd_tx: mpsc::Sender<DeviceCommand>,
    pub health: HealthCell,
    pub join: tokio::task::JoinHandle<()>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Phase {
    Syncing,
    Monitoring,
    OfflineBackoff,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Due {
    Poll,
    Heartbeat,
    Compliance,
}

pub struct Monitor {
    device: Device,
    catalog: Arc<dyn DeviceCatalog>,
    queue_tx: mpsc::Sender<ChangeNotice>,
    pending: Arc<AtomicUsize>,
    health: HealthCell,
    interval_rx: watch::Receiver<Duration>,
    connection: Option<DeviceConnection>,
    /// Parameter addresses in plan order; snapshots list readings in this
    /// order regardless of which sub-plan produced the latest cycle.
    param_order: Vec<u16>,
    last_values: HashMap<u16, Value>,
    last_readings: HashMap<u16, Reading>,
    consecutive_errors: u32,
    phase: Phase,
    next_poll: Instant,
    last_success: Option<Instant>,
    last_compliance: Instant,
}

/// Spawn the monitor task for one device. The returned oneshot resolves
/// when the initial sync finished (or failed); startup awaits it for
/// foreground devices and ignores it for background ones.
pub fn spawn(
    device: Device,
    catalog: Arc<dyn DeviceCatalog>,
    queue_tx: mpsc::Sender<ChangeNotice>,
    pending: Arc<AtomicUsize>,
    interval_rx: watch::Receiver<Duration>,
    shutdown_rx: watch::Receiver<bool>,
) -> (MonitorHandle, oneshot::Receiver<Result<()>>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(8);
    let (ready_tx, ready_rx) = oneshot::channel();
    let health = HealthCell::new();
    let monitor = Monitor {
        device,
        catalog,
        queue_tx,
        pending,
        health: health.clone(),
        interval_rx: interval_rx.clone(),
        connection: None,
        param_order: Vec::new(),
        last_values: HashMap::new(),
        last_readings: HashMap::new(),
        consecutive_errors: 0,
        phase: Phase::Syncing,
        next_poll: Instant::now(),
        last_success: None,
        last_compliance: Instant::now(),
    };
    let join = tokio::spawn(monitor.run(ready_tx, cmd_rx, shutdown_rx, interval_rx));
    (
        MonitorHandle {
            cmd_tx,
            health,
            join,
        },
        ready_rx,
    )
}

impl Monitor {
    async fn run(
        mut self,
        ready: oneshot::Sender<Result<()>>,
        mut cmd_rx: mpsc::Receiver<DeviceCommand>,
        mut shutdown_rx: watch::Receiver<bool>,
        mut interval_rx: watch::Receiver<Duration>,
    ) {
        let plan = match self.prepare_plan().await {
            Ok(plan) => plan,
            Err(err) => {
                log::error!("device {} quarantined: {}", self.device.id, err);
                self.health.set_state(DeviceStatus::Degraded, false);
                let _ = ready.send(Err(err.clone()));
                self.quarantine_loop(err, &mut cmd_rx, &mut shutdown_rx).await;
                return;
            }
        };
        self.param_order = plan.param_addresses();
        log::info!("device {}: starting initial sync", self.device.id);
        let first = self.initial_sync(&plan).await;
        let _ = ready.send(first);

        loop {
            let due = self.next_deadline();
            let sleep_target = due
                .map(|(at, _)| at)
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = interval_rx.changed() => {
                    // drain the old timer and rearm with the new interval
                    self.next_poll = Instant::now() + self.effective_interval();
                }
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(&plan, cmd).await,
                    None => break,
                },
                _ = tokio::time::sleep_until(sleep_target), if due.is_some() => {
                    if let Some((_, what)) = due {
                        self.fire(&plan, what).await;
                    }
                }
            }
        }
        self.close_connection().await;
        self.health.set_state(DeviceStatus::Offline, false);
        log::info!("device {}: monitor stopped", self.device.id);
    }

    async fn quarantine_loop(
        &mut self,
        err: Error,
        cmd_rx: &mut mpsc::Receiver<DeviceCommand>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                cmd = cmd_rx.recv() => match cmd {
                    Some(DeviceCommand::Sync(reply)) => {
                        let _ = reply.send(Err(err.clone()));
                    }
                    Some(DeviceCommand::ReadNow(reply)) => {
                        let _ = reply.send(Err(err.clone()));
                    }
                    Some(DeviceCommand::TestConnection(reply)) => {
                        let _ = reply.send(self.probe_connection(None).await);
                    }
                    None => break,
                },
            }
        }
        self.close_connection().await;
    }

    /// Materialize driver-provided data points, then compile the plan.
    /// Every failure here is fatal for the device.
    async fn prepare_plan(&mut self) -> Result<DevicePlan> {
        if self.device.data_points.is_empty() {
            if let Some(driver_id) = self.device.driver_id.clone() {
                match self.catalog.load_driver_config(&driver_id).await {
                    Ok(Some(config)) => self.device.data_points = config.data_points,
                    Ok(None) => {
                        return Err(Error::Device(DeviceError::MissingDriver(driver_id)))
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        DevicePlan::build(&self.device)
    }

    fn effective_interval(&self) -> Duration {
        let engine_wide = *self.interval_rx.borrow();
        self.device
            .advanced_settings
            .poll_interval_ms
            .map(super::clamp_interval)
            .unwrap_or(engine_wide)
    }

    fn next_deadline(&self) -> Option<(Instant, Due)> {
        match self.phase {
            Phase::Syncing | Phase::OfflineBackoff => Some((self.next_poll, Due::Poll)),
            Phase::Monitoring => {
                let mut best = (self.next_poll, Due::Poll);
                if let Some(last_success) = self.last_success {
                    let heartbeat_at = last_success + HEARTBEAT_INTERVAL;
                    if heartbeat_at < best.0 {
                        best = (heartbeat_at, Due::Heartbeat);
                    }
                }
                let compliance_at = self.last_compliance + COMPLIANCE_INTERVAL;
                if compliance_at < best.0 {
                    best = (compliance_at, Due::Compliance);
                }
                Some(best)
            }
        }
    }

    async fn fire(&mut self, plan: &DevicePlan, what: Due) {
        match what {
            Due::Poll => match self.phase {
                Phase::Syncing => {
                    let _ = self.initial_sync(plan).await;
                }
                _ => {
                    let _ = self.cycle(plan, ChangeSource::Modbus, false, true).await;
                }
            },
            Due::Heartbeat => self.heartbeat(plan).await,
            Due::Compliance => {
                let _ = self.cycle(plan, ChangeSource::Snapshot, true, true).await;
                self.last_compliance = Instant::now();
            }
        }
    }

    async fn handle_command(&mut self, plan: &DevicePlan, cmd: DeviceCommand) {
        match cmd {
            DeviceCommand::Sync(reply) => {
                let result = self.initial_sync(plan).await;
                let _ = reply.send(result);
            }
            DeviceCommand::ReadNow(reply) => {
                let result = self.read_once(plan).await;
                let _ = reply.send(result);
            }
            DeviceCommand::TestConnection(reply) => {
                let _ = reply.send(self.probe_connection(Some(plan)).await);
            }
        }
    }

    /// Full read of every configured register; first observations and
    /// value changes flow out as sync-sourced events. Keeps the monitor
    /// timer installed even on failure, a device may come online later.
    async fn initial_sync(&mut self, plan: &DevicePlan) -> Result<()> {
        self.cycle(plan, ChangeSource::Sync, false, true).await.map(|_| ())
    }

    /// One read cycle with full bookkeeping. `force_all` turns every
    /// reading into an event (compliance snapshots); `reset_poll` rearms
    /// the polling timer on success.
    async fn cycle(
        &mut self,
        plan: &DevicePlan,
        source: ChangeSource,
        force_all: bool,
        reset_poll: bool,
    ) -> Result<DeviceReadingSet> {
        let started = Instant::now();
        match self.read_once(plan).await {
            Ok(set) => {
                self.on_success(&set, source, force_all, reset_poll, started.elapsed())
                    .await;
                Ok(set)
            }
            Err(err) => {
                self.on_failure(&err);
                Err(err)
            }
        }
    }

    async fn read_once(&mut self, plan: &DevicePlan) -> Result<DeviceReadingSet> {
        self.ensure_connection().await?;
        let connection = match self.connection.as_mut() {
            Some(connection) => connection,
            None => {
                return Err(Error::internal(anyhow::anyhow!(
                    "connection missing after ensure"
                )))
            }
        };
        let result = read_device(plan, connection.transport_mut()).await;
        self.release_after_cycle().await;
        result
    }

    async fn on_success(
        &mut self,
        set: &DeviceReadingSet,
        source: ChangeSource,
        force_all: bool,
        reset_poll: bool,
        elapsed: Duration,
    ) {
        self.consecutive_errors = 0;
        self.phase = Phase::Monitoring;
        self.last_success = Some(Instant::now());
        if reset_poll {
            self.next_poll = Instant::now() + self.effective_interval();
        }

        let events = self.apply_readings(set, source, force_all);
        let snapshot = Arc::new(self.build_snapshot(set.timestamp));
        for event in events {
            self.pending.fetch_add(1, Ordering::SeqCst);
            let notice = ChangeNotice {
                event,
                snapshot: snapshot.clone(),
            };
            if self.queue_tx.send(notice).await.is_err() {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                log::error!("change queue closed, dropping event for {}", self.device.id);
            }
        }

        self.health.record_success(set.timestamp, elapsed);
        if let Err(err) = self
            .catalog
            .update_last_seen(&self.device.id, set.timestamp)
            .await
        {
            log::debug!("update_last_seen for {} failed: {}", self.device.id, err);
        }
    }

    fn on_failure(&mut self, err: &Error) {
        self.consecutive_errors += 1;
        self.health.record_failure();
        log::warn!(
            "device {}: cycle failed ({} consecutive): {}",
            self.device.id,
            self.consecutive_errors,
            err
        );
        match self.phase {
            Phase::Syncing => {
                // never synced; retry at the background cadence
                self.health.set_state(DeviceStatus::Degraded, false);
                self.next_poll = Instant::now() + BACKGROUND_RETRY;
            }
            _ if self.consecutive_errors >= MAX_CONSECUTIVE_ERRORS => {
                log::warn!(
                    "device {}: {} consecutive errors, offline for {:?}",
                    self.device.id,
                    self.consecutive_errors,
                    OFFLINE_BACKOFF
                );
                self.phase = Phase::OfflineBackoff;
                self.health.set_state(DeviceStatus::Offline, false);
                self.next_poll = Instant::now() + OFFLINE_BACKOFF;
            }
            _ => {
                self.phase = Phase::Monitoring;
                self.health.set_state(DeviceStatus::Degraded, true);
                self.next_poll = Instant::now() + transient_backoff(self.consecutive_errors);
            }
        }
    }

    /// Diff the readings against the last observed values. The value map is
    /// updated before the events are handed out, so `last_values[address]`
    /// always equals `new_value` once an event exists.
    fn apply_readings(
        &mut self,
        set: &DeviceReadingSet,
        source: ChangeSource,
        force_all: bool,
    ) -> Vec<ChangeEvent> {
        let mut events = Vec::new();
        for reading in &set.readings {
            let address = reading.address();
            let new_value = reading.value();
            let old_value = self.last_values.get(&address).cloned();
            let changed = is_change(old_value.as_ref(), &new_value);
            self.last_values.insert(address, new_value.clone());
            self.last_readings.insert(address, reading.clone());
            if changed || force_all {
                events.push(ChangeEvent {
                    device_id: set.device_id.clone(),
                    address,
                    register_name: reading.name().to_string(),
                    old_value: old_value.unwrap_or(Value::Null),
                    new_value,
                    timestamp: set.timestamp,
                    source,
                });
            }
        }
        events
    }

    /// The complete current state of the device, built from the retained
    /// readings rather than the (possibly partial) diff.
    fn build_snapshot(&self, timestamp: DateTime<Utc>) -> DeviceSnapshot {
        let readings = self
            .param_order
            .iter()
            .filter_map(|address| self.last_readings.get(address).cloned())
            .collect();
        DeviceSnapshot {
            device_name: self.device.name.clone(),
            timestamp,
            readings,
        }
    }

    /// Cheap single-item read confirming liveness when monitoring has had
    /// no successful cycle recently.
    async fn heartbeat(&mut self, plan: &DevicePlan) {
        let probe = match plan.heartbeat_plan() {
            Some(probe) => probe,
            None => {
                self.last_success = Some(Instant::now());
                return;
            }
        };
        log::debug!("device {}: heartbeat", self.device.id);
        let _ = self.cycle(&probe, ChangeSource::Heartbeat, false, false).await;
    }

    async fn probe_connection(&mut self, plan: Option<&DevicePlan>) -> Result<Duration> {
        let started = Instant::now();
        self.ensure_connection().await?;
        if let Some(probe) = plan.and_then(|p| p.heartbeat_plan()) {
            let connection = match self.connection.as_mut() {
                Some(connection) => connection,
                None => {
                    return Err(Error::internal(anyhow::anyhow!(
                        "connection missing after ensure"
                    )))
                }
            };
            read_device(&probe, connection.transport_mut()).await?;
        }
        self.release_after_cycle().await;
        Ok(started.elapsed())
    }

    async fn ensure_connection(&mut self) -> Result<()> {
        let reusable = self.connection.as_ref().map(|x| x.valid()).unwrap_or(false);
        if !reusable {
            if let Some(old) = self.connection.take() {
                old.close().await;
            }
            let connection = DeviceConnection::open(&self.device).await?;
            self.connection = Some(connection);
        }
        Ok(())
    }

    /// RTU connections are closed after every cycle so the port lock is
    /// released between cycles; TCP connections are kept and revalidated.
    async fn release_after_cycle(&mut self) {
        let release = self
            .connection
            .as_ref()
            .map(|x| x.is_rtu() || !x.valid())
            .unwrap_or(false);
        if release {
            if let Some(connection) = self.connection.take() {
                connection.close().await;
            }
        }
    }

    async fn close_connection(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close().await;
        }
    }
}

fn transient_backoff(errors: u32) -> Duration {
    let backoff = TRANSIENT_BACKOFF_BASE * 2_u32.saturating_pow(errors.min(10));
    backoff.min(TRANSIENT_BACKOFF_CAP)
}

/// The change predicate: numeric values must move by more than the
/// threshold, everything else compares strictly. A first observation and
/// every null transition count as changes.
fn is_change(old: Option<&Value>, new: &Value) -> bool {
    match old {
        None => true,
        Some(old) => match (old, new) {
            (Value::Number(a), Value::Number(b)) => (a - b).abs() > CHANGE_THRESHOLD,
            (a, b) => a != b,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_threshold_is_absolute() {
        let old = Value::Number(10.0);
        assert!(!is_change(Some(&old), &Value::Number(10.005)));
        assert!(is_change(Some(&old), &Value::Number(10.02)));
        assert!(!is_change(Some(&old), &Value::Number(10.0)));
    }

    #[test]
    fn first_observation_and_null_transitions_are_changes() {
        assert!(is_change(None, &Value::Number(1.0)));
        assert!(is_change(Some(&Value::Null), &Value::Number(1.0)));
        assert!(is_change(Some(&Value::Number(1.0)), &Value::Null));
        assert!(!is_change(Some(&Value::Null), &Value::Null));
    }

    #[test]
    fn bools_and_text_compare_strictly() {
        assert!(is_change(Some(&Value::Bool(false)), &Value::Bool(true)));
        assert!(!is_change(Some(&Value::Bool(true)), &Value::Bool(true)));
        assert!(is_change(
            Some(&Value::Text("a".to_string())),
            &Value::Text("b".to_string())
        ));
    }

    #[test]
    fn transient_backoff_grows_and_caps() {
        assert_eq!(transient_backoff(1), Duration::from_secs(1));
        assert_eq!(transient_backoff(2), Duration::from_secs(2));
        assert_eq!(transient_backoff(5), Duration::from_secs(16));
        assert_eq!(transient_backoff(9), TRANSIENT_BACKOFF_CAP);
        assert_eq!(transient_backoff(100), TRANSIENT_BACKOFF_CAP);
    }

    #[test]
    fn health_report_aggregates_recent_outcomes() {
        let health = HealthCell::new();
        assert_eq!(health.report().status, DeviceStatus::Unknown);
        assert_eq!(health.report().error_rate, 0.0);

        health.record_success(Utc::now(), Duration::from_millis(20));
        health.record_success(Utc::now(), Duration::from_millis(40));
        health.record_failure();
        let report = health.report();
        assert_eq!(report.status, DeviceStatus::Online);
        assert!((report.error_rate - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(report.response_time_ms, Some(30.0));
        assert!(health.is_online());

        health.set_state(DeviceStatus::Offline, false);
        assert!(!health.is_online());
    }
}
