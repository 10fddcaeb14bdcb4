//! Interfaces of the external collaborators the engine consumes and
//! produces into: the device catalog, the time-series history sink and the
//! realtime push channel.
//!
//! All of them are constructor-injected into the engine; there are no
//! process-wide handles. Their failures must never block polling.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use daqsrv_protocol::{DataPoint, Device, DeviceSnapshot, HistoryRow, Parameter, Result};

/// Parser schema loaded on demand for devices that carry only a driver
/// reference. Kept in memory only, never persisted back.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverConfig {
    pub data_points: Vec<DataPoint>,
    #[serde(default)]
    pub writable_registers: Vec<u16>,
    #[serde(default)]
    pub control_parameters: Vec<Parameter>,
}

/// The catalog of device definitions, owned by an external document store.
#[async_trait]
pub trait DeviceCatalog: Send + Sync {
    async fn find_device(&self, id: &str) -> Result<Option<Device>>;

    async fn list_enabled_devices(&self) -> Result<Vec<Device>>;

    /// Reported after every successful transaction with the device.
    async fn update_last_seen(&self, id: &str, timestamp: DateTime<Utc>) -> Result<()>;

    /// Catalogs without driver support may leave this at the default.
    async fn load_driver_config(&self, driver_id: &str) -> Result<Option<DriverConfig>> {
        let _ = driver_id;
        Ok(None)
    }
}

/// The time-series history store.
#[async_trait]
pub trait HistorySink: Send + Sync {
    /// Unordered bulk write; the sink tolerates per-row failures.
    async fn append_many(&self, rows: Vec<HistoryRow>) -> Result<()>;
}

/// The realtime push collaborator. Best effort: the engine logs and drops
/// failures and never lets the channel backpressure the poller.
#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn publish_snapshot(&self, device_id: &str, snapshot: &DeviceSnapshot) -> Result<()>;
}
