//! The polling engine: owns the dispatch task and one monitor task per
//! enabled device, and exposes the host-facing API (start/stop, on-demand
//! sync and reads, health and stats).

mod cache;
mod dispatch;
mod monitor;
mod startup;

pub use cache::RealtimeCache;
pub use dispatch::{ChangeNotice, Dispatcher};
pub use monitor::{
    DeviceCommand, HealthCell, MonitorHandle, COMPLIANCE_INTERVAL, HEARTBEAT_INTERVAL,
};
pub use startup::StartupMode;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use futures::future::join_all;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use daqsrv_protocol::{
    Device, DeviceError, DeviceHealth, DeviceReadingSet, DeviceSnapshot, Error, IntervalSettings,
    Result, ServiceStats,
};

use crate::connection::{self, DeviceConnection};
use crate::sinks::{DeviceCatalog, HistorySink, PushChannel};

pub const DEFAULT_MONITORING_INTERVAL: Duration = Duration::from_secs(10);
pub const MIN_MONITORING_INTERVAL_MS: u64 = 500;
pub const MAX_MONITORING_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 30_000;

/// Clamp a requested monitoring interval into the supported band.
pub fn clamp_interval(ms: u64) -> Duration {
    Duration::from_millis(ms.max(MIN_MONITORING_INTERVAL_MS).min(MAX_MONITORING_INTERVAL_MS))
}

#[derive(Clone, Debug)]
pub struct EngineOptions {
    pub monitoring_interval_ms: Option<u64>,
    pub startup_timeout_ms: u64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            monitoring_interval_ms: None,
            startup_timeout_ms: DEFAULT_STARTUP_TIMEOUT_MS,
        }
    }
}

pub struct Engine {
    catalog: Arc<dyn DeviceCatalog>,
    history: Arc<dyn HistorySink>,
    push: Arc<dyn PushChannel>,
    cache: RealtimeCache,
    devices: Mutex<HashMap<String, MonitorHandle>>,
    interval_tx: watch::Sender<Duration>,
    interval_rx: watch::Receiver<Duration>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    queue_tx: Mutex<Option<mpsc::Sender<ChangeNotice>>>,
    queue_rx: Mutex<Option<mpsc::Receiver<ChangeNotice>>>,
    pending: Arc<AtomicUsize>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Engine {
    /// Collaborators are constructor-injected; the engine holds no
    /// process-wide handles.
    pub fn new(
        catalog: Arc<dyn DeviceCatalog>,
        history: Arc<dyn HistorySink>,
        push: Arc<dyn PushChannel>,
    ) -> Self {
        let (interval_tx, interval_rx) = watch::channel(DEFAULT_MONITORING_INTERVAL);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (queue_tx, queue_rx) = mpsc::channel(dispatch::QUEUE_CAPACITY);
        Self {
            catalog,
            history,
            push,
            cache: RealtimeCache::new(),
            devices: Mutex::new(HashMap::new()),
            interval_tx,
            interval_rx,
            shutdown_tx,
            shutdown_rx,
            queue_tx: Mutex::new(Some(queue_tx)),
            queue_rx: Mutex::new(Some(queue_rx)),
            pending: Arc::new(AtomicUsize::new(0)),
            dispatcher: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Bring the engine up within the caller's startup budget: spawn the
    /// dispatch task, enumerate enabled devices and initialize them in the
    /// regime the remaining time allows. Devices that do not make it into
    /// the foreground keep initializing in the background.
    pub async fn start(&self, options: EngineOptions) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::internal(anyhow!("engine already started")));
        }
        let deadline = Instant::now() + Duration::from_millis(options.startup_timeout_ms);
        if let Some(ms) = options.monitoring_interval_ms {
            self.set_change_monitoring_interval(ms);
        }

        // core task bring-up; its failure is the only engine-fatal condition
        let queue_rx = self.queue_rx.lock().unwrap().take();
        let queue_rx =
            queue_rx.ok_or_else(|| Error::internal(anyhow!("change queue already consumed")))?;
        let dispatcher = Dispatcher::new(
            queue_rx,
            self.cache.clone(),
            self.history.clone(),
            self.push.clone(),
            self.pending.clone(),
        );
        *self.dispatcher.lock().unwrap() = Some(tokio::spawn(dispatcher.run()));

        let devices = self.catalog.list_enabled_devices().await?;
        let available = deadline
            .saturating_duration_since(Instant::now())
            .checked_sub(startup::STARTUP_RESERVE)
            .unwrap_or_default();
        let mode = startup::select_mode(devices.len(), available);
        log::info!(
            "starting {} devices, {:?} budget left, {:?} startup",
            devices.len(),
            available,
            mode
        );
        match mode {
            StartupMode::Sequential => self.start_sequential(devices, deadline).await?,
            StartupMode::Parallel => self.start_parallel(devices, deadline).await?,
            StartupMode::Emergency => self.start_emergency(devices, deadline).await?,
        }
        Ok(())
    }

    async fn start_sequential(&self, mut devices: Vec<Device>, deadline: Instant) -> Result<()> {
        let mid = (devices.len() + 1) / 2;
        let second = devices.split_off(mid);
        for (batch_no, batch) in vec![devices, second].into_iter().enumerate() {
            log::debug!("sequential startup batch {}", batch_no + 1);
            for device in batch {
                let ready = self.spawn_device(device)?;
                self.await_ready(ready, deadline).await;
            }
        }
        Ok(())
    }

    async fn start_parallel(&self, devices: Vec<Device>, deadline: Instant) -> Result<()> {
        // screen in waves so an unreachable site cannot eat the budget
        let mut healthy = Vec::new();
        let mut deferred = Vec::new();
        for wave in devices.chunks(startup::HEALTH_CHECK_BATCH) {
            let checks = wave.iter().map(|device| async move {
                let probe = tokio::time::timeout(
                    startup::HEALTH_CHECK_BUDGET,
                    DeviceConnection::open(device),
                )
                .await;
                match probe {
                    Ok(Ok(conn)) => {
                        conn.close().await;
                        true
                    }
                    _ => false,
                }
            });
            let outcomes = join_all(checks).await;
            for (device, ok) in wave.iter().cloned().zip(outcomes) {
                if ok {
                    healthy.push(device);
                } else {
                    deferred.push(device);
                }
            }
        }
        log::info!(
            "health check: {} reachable, {} deferred to background init",
            healthy.len(),
            deferred.len()
        );
        // initialize the healthy ones in bounded waves
        for wave in healthy.chunks(startup::INIT_CONCURRENCY) {
            let mut readies = Vec::new();
            for device in wave.iter().cloned() {
                readies.push(self.spawn_device(device)?);
            }
            join_all(readies.into_iter().map(|ready| self.await_ready(ready, deadline))).await;
        }
        for device in deferred {
            let _ = self.spawn_device(device)?;
        }
        Ok(())
    }

    async fn start_emergency(&self, devices: Vec<Device>, deadline: Instant) -> Result<()> {
        log::warn!("startup budget nearly exhausted, emergency bring-up");
        for (index, device) in devices.into_iter().enumerate() {
            let ready = self.spawn_device(device)?;
            if index < startup::EMERGENCY_FOREGROUND {
                self.await_ready(ready, deadline).await;
            }
        }
        Ok(())
    }

    fn spawn_device(&self, device: Device) -> Result<oneshot::Receiver<Result<()>>> {
        let queue_tx = self.queue_tx.lock().unwrap().as_ref().cloned();
        let queue_tx = queue_tx.ok_or_else(|| Error::internal(anyhow!("engine is stopped")))?;
        let device_id = device.id.clone();
        let (handle, ready) = monitor::spawn(
            device,
            self.catalog.clone(),
            queue_tx,
            self.pending.clone(),
            self.interval_rx.clone(),
            self.shutdown_rx.clone(),
        );
        self.devices.lock().unwrap().insert(device_id, handle);
        Ok(ready)
    }

    /// Wait for a device's initial sync, but never past the startup
    /// deadline; a slow device finishes initializing in the background.
    async fn await_ready(&self, ready: oneshot::Receiver<Result<()>>, deadline: Instant) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return;
        }
        match tokio::time::timeout(remaining, ready).await {
            Ok(Ok(Err(err))) => log::warn!("initial sync failed: {}", err),
            Err(_) => log::warn!("startup budget exhausted before initial sync finished"),
            _ => {}
        }
    }

    /// Stop all device tasks, drain the change queue and release every
    /// transport (and with them the serial-port locks).
    pub async fn stop(&self) {
        if !self.started.load(Ordering::SeqCst) {
            return;
        }
        log::info!("stopping engine");
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<MonitorHandle> = {
            let mut devices = self.devices.lock().unwrap();
            devices.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            drop(handle.cmd_tx);
            if tokio::time::timeout(Duration::from_secs(10), handle.join)
                .await
                .is_err()
            {
                log::warn!("a device task did not stop in time");
            }
        }

        // closing the queue lets the dispatcher drain what is left and exit
        let queue_tx = self.queue_tx.lock().unwrap().take();
        drop(queue_tx);
        let dispatcher = self.dispatcher.lock().unwrap().take();
        if let Some(join) = dispatcher {
            let _ = join.await;
        }
        log::info!("engine stopped");
    }

    /// Force an out-of-cycle initial sync of one device.
    pub async fn trigger_device_sync(&self, device_id: &str) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send_command(device_id, DeviceCommand::Sync(tx)).await?;
        rx.await
            .map_err(|_| Error::internal(anyhow!("device task dropped the request")))?
    }

    /// One out-of-cycle full read, without touching the monitor's change
    /// state.
    pub async fn read_device_now(&self, device_id: &str) -> Result<DeviceReadingSet> {
        let (tx, rx) = oneshot::channel();
        self.send_command(device_id, DeviceCommand::ReadNow(tx)).await?;
        rx.await
            .map_err(|_| Error::internal(anyhow!("device task dropped the request")))?
    }

    /// Connect (or reuse the open session) and run a single probe read;
    /// returns the round-trip time.
    pub async fn test_device_connection(&self, device_id: &str) -> Result<Duration> {
        let (tx, rx) = oneshot::channel();
        self.send_command(device_id, DeviceCommand::TestConnection(tx))
            .await?;
        rx.await
            .map_err(|_| Error::internal(anyhow!("device task dropped the request")))?
    }

    async fn send_command(&self, device_id: &str, cmd: DeviceCommand) -> Result<()> {
        let cmd_tx = {
            let devices = self.devices.lock().unwrap();
            devices
                .get(device_id)
                .map(|handle| handle.cmd_tx.clone())
                .ok_or(Error::Device(DeviceError::NotTracked))?
        };
        cmd_tx
            .send(cmd)
            .await
            .map_err(|_| Error::Device(DeviceError::NotTracked))
    }

    pub fn get_realtime_snapshot(&self, device_id: &str) -> Option<Arc<DeviceSnapshot>> {
        self.cache.get(device_id)
    }

    pub fn get_device_health(&self, device_id: &str) -> Result<DeviceHealth> {
        let devices = self.devices.lock().unwrap();
        devices
            .get(device_id)
            .map(|handle| handle.health.report())
            .ok_or(Error::Device(DeviceError::NotTracked))
    }

    pub fn get_service_stats(&self) -> ServiceStats {
        let devices = self.devices.lock().unwrap();
        let total_devices = devices.len();
        let online = devices
            .values()
            .filter(|handle| handle.health.is_online())
            .count();
        ServiceStats {
            total_devices,
            online,
            offline: total_devices - online,
            active_connections: connection::active_connections(),
            pending_changes: self.pending.load(Ordering::SeqCst),
            intervals: IntervalSettings {
                monitoring_ms: self.interval_rx.borrow().as_millis() as u64,
                heartbeat_ms: HEARTBEAT_INTERVAL.as_millis() as u64,
                compliance_snapshot_ms: COMPLIANCE_INTERVAL.as_millis() as u64,
            },
        }
    }

    /// Clamp into `[500 ms, 60 s]` and apply to every running monitor.
    pub fn set_change_monitoring_interval(&self, ms: u64) -> Duration {
        let clamped = clamp_interval(ms);
        let _ = self.interval_tx.send(clamped);
        log::info!("change monitoring interval set to {:?}", clamped);
        clamped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use daqsrv_protocol::{
        AdvancedSettings, ConnectionSettings, DataPoint, DataType, HistoryRow, Parameter,
        RegisterFunction, RegisterRange, Value,
    };
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct MemoryCatalog {
        devices: Mutex<Vec<Device>>,
    }

    #[async_trait]
    impl DeviceCatalog for MemoryCatalog {
        async fn find_device(&self, id: &str) -> Result<Option<Device>> {
            Ok(self
                .devices
                .lock()
                .unwrap()
                .iter()
                .find(|x| x.id == id)
                .cloned())
        }

        async fn list_enabled_devices(&self) -> Result<Vec<Device>> {
            Ok(self
                .devices
                .lock()
                .unwrap()
                .iter()
                .filter(|x| x.enabled)
                .cloned()
                .collect())
        }

        async fn update_last_seen(&self, id: &str, timestamp: DateTime<Utc>) -> Result<()> {
            let mut devices = self.devices.lock().unwrap();
            if let Some(device) = devices.iter_mut().find(|x| x.id == id) {
                device.last_seen = Some(timestamp);
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingHistory {
        rows: Mutex<Vec<HistoryRow>>,
    }

    #[async_trait]
    impl HistorySink for RecordingHistory {
        async fn append_many(&self, rows: Vec<HistoryRow>) -> Result<()> {
            self.rows.lock().unwrap().extend(rows);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingPush {
        count: AtomicUsize,
    }

    #[async_trait]
    impl PushChannel for RecordingPush {
        async fn publish_snapshot(&self, _device_id: &str, _snapshot: &DeviceSnapshot) -> Result<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Minimal Modbus TCP server answering holding-register reads from a
    /// shared register file.
    async fn serve(listener: TcpListener, registers: Arc<Mutex<Vec<u16>>>) {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(x) => x,
                Err(_) => break,
            };
            let registers = registers.clone();
            tokio::spawn(async move {
                loop {
                    let mut header = [0_u8; 7];
                    if socket.read_exact(&mut header).await.is_err() {
                        break;
                    }
                    let len = u16::from_be_bytes([header[4], header[5]]) as usize;
                    let mut pdu = vec![0_u8; len - 1];
                    if socket.read_exact(&mut pdu).await.is_err() {
                        break;
                    }
                    if pdu[0] != 3 {
                        break;
                    }
                    let addr = u16::from_be_bytes([pdu[1], pdu[2]]) as usize;
                    let cnt = u16::from_be_bytes([pdu[3], pdu[4]]) as usize;
                    let mut body = vec![3_u8, (cnt * 2) as u8];
                    {
                        let registers = registers.lock().unwrap();
                        for i in 0..cnt {
                            let value = registers.get(addr + i).copied().unwrap_or(0);
                            body.extend(&value.to_be_bytes());
                        }
                    }
                    let mut reply = Vec::new();
                    reply.extend(&header[0..2]);
                    reply.extend(&[0_u8, 0]);
                    reply.extend(&((body.len() as u16 + 1).to_be_bytes()));
                    reply.push(header[6]);
                    reply.extend(&body);
                    if socket.write_all(&reply).await.is_err() {
                        break;
                    }
                }
            });
        }
    }

    fn test_device(port: u16) -> Device {
        Device {
            id: "dev-1".to_string(),
            name: "Meter A".to_string(),
            enabled: true,
            connection: ConnectionSettings::Tcp {
                ip: "127.0.0.1".to_string(),
                port,
                unit_id: 1,
            },
            data_points: vec![DataPoint {
                range: RegisterRange {
                    function_code: RegisterFunction::HoldingRegisters,
                    start_address: 0,
                    count: 3,
                },
                parameters: vec![Parameter {
                    name: "voltage".to_string(),
                    data_type: DataType::Uint16,
                    byte_order: None,
                    register_index: 0,
                    word_count: None,
                    scaling_factor: Some(0.1),
                    scale_factor: None,
                    scaling_equation: None,
                    decimal_point: Some(1),
                    unit: Some("V".to_string()),
                    min_value: None,
                    max_value: None,
                }],
            }],
            driver_id: None,
            address_base: 0,
            advanced_settings: AdvancedSettings {
                connect_timeout_ms: 1000,
                request_timeout_ms: 1000,
                poll_interval_ms: Some(500),
                ..Default::default()
            },
            last_seen: None,
        }
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, predicate: F) {
        for _ in 0..100 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    #[tokio::test]
    async fn engine_polls_detects_changes_and_serves_the_api() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let registers = Arc::new(Mutex::new(vec![100_u16, 0, 0]));
        tokio::spawn(serve(listener, registers.clone()));

        let catalog = Arc::new(MemoryCatalog {
            devices: Mutex::new(vec![test_device(port)]),
        });
        let history = Arc::new(RecordingHistory::default());
        let push = Arc::new(RecordingPush::default());
        let engine = Engine::new(catalog.clone(), history.clone(), push.clone());

        engine
            .start(EngineOptions {
                monitoring_interval_ms: Some(500),
                startup_timeout_ms: 10_000,
            })
            .await
            .unwrap();

        // the initial sync produces a first-observation change, which lands
        // in the cache through the dispatcher
        wait_for("first snapshot", || {
            engine.get_realtime_snapshot("dev-1").is_some()
        })
        .await;
        let snapshot = engine.get_realtime_snapshot("dev-1").unwrap();
        assert_eq!(snapshot.readings[0].value(), Value::Number(10.0));

        let health = engine.get_device_health("dev-1").unwrap();
        assert_eq!(health.status, daqsrv_protocol::DeviceStatus::Online);
        let stats = engine.get_service_stats();
        assert_eq!(stats.total_devices, 1);
        assert_eq!(stats.online, 1);
        assert_eq!(stats.offline, 0);
        assert_eq!(stats.intervals.monitoring_ms, 500);

        // a register change beyond the threshold becomes a history row
        registers.lock().unwrap()[0] = 105;
        wait_for("change event in history", || {
            history
                .rows
                .lock()
                .unwrap()
                .iter()
                .any(|row| row.value == Value::Number(10.5))
        })
        .await;
        let rows = history.rows.lock().unwrap();
        let row = rows
            .iter()
            .find(|row| row.value == Value::Number(10.5))
            .unwrap();
        assert_eq!(row.old_value, Value::Number(10.0));
        assert_eq!(row.parameter_name, "voltage");
        assert_eq!(row.quality, "good");
        drop(rows);
        assert!(push.count.load(Ordering::SeqCst) >= 1);

        // on-demand surface
        engine.trigger_device_sync("dev-1").await.unwrap();
        let set = engine.read_device_now("dev-1").await.unwrap();
        assert_eq!(set.readings.len(), 1);
        assert!(!set.partial);
        engine.test_device_connection("dev-1").await.unwrap();
        assert!(matches!(
            engine.trigger_device_sync("nope").await.unwrap_err(),
            Error::Device(DeviceError::NotTracked)
        ));

        // the catalog saw last_seen updates
        let device = catalog.find_device("dev-1").await.unwrap().unwrap();
        assert!(device.last_seen.is_some());

        engine.stop().await;
    }

    #[tokio::test]
    async fn unreachable_device_is_tracked_as_offline() {
        // a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut device = test_device(port);
        device.advanced_settings.connect_timeout_ms = 200;
        let catalog = Arc::new(MemoryCatalog {
            devices: Mutex::new(vec![device]),
        });
        let engine = Engine::new(
            catalog,
            Arc::new(RecordingHistory::default()),
            Arc::new(RecordingPush::default()),
        );
        engine
            .start(EngineOptions {
                monitoring_interval_ms: None,
                startup_timeout_ms: 8_000,
            })
            .await
            .unwrap();

        let stats = engine.get_service_stats();
        assert_eq!(stats.total_devices, 1);
        assert_eq!(stats.online, 0);
        assert_eq!(stats.offline, 1);
        let health = engine.get_device_health("dev-1").unwrap();
        assert_eq!(health.status, daqsrv_protocol::DeviceStatus::Degraded);
        assert!(health.error_rate > 0.0);

        engine.stop().await;
    }

    #[test]
    fn interval_clamping() {
        assert_eq!(clamp_interval(10), Duration::from_millis(500));
        assert_eq!(clamp_interval(10_000), Duration::from_secs(10));
        assert_eq!(clamp_interval(600_000), Duration::from_secs(60));
    }
}
