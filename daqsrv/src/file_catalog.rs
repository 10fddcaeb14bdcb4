//! File-backed reference collaborators for the `daqsrv` binary: a device
//! catalog loaded from a JSON file, a history sink appending JSON lines and
//! a push channel that logs. Production deployments plug their own
//! implementations of the traits in [`crate::sinks`] into the engine.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use daqsrv_protocol::{Device, DeviceSnapshot, Error, HistoryRow, Result};

use crate::sinks::{DeviceCatalog, DriverConfig, HistorySink, PushChannel};

/// On-disk catalog format: the device list plus optional driver configs
/// referenced by `driverId`.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CatalogFile {
    devices: Vec<Device>,
    #[serde(default)]
    drivers: HashMap<String, DriverConfig>,
}

pub struct FileCatalog {
    devices: Mutex<HashMap<String, Device>>,
    drivers: HashMap<String, DriverConfig>,
}

impl FileCatalog {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = tokio::fs::read(path.as_ref())
            .await
            .map_err(Error::transport)?;
        let parsed: CatalogFile = serde_json::from_slice(&raw).map_err(Error::config)?;
        let devices = parsed
            .devices
            .into_iter()
            .map(|device| (device.id.clone(), device))
            .collect();
        Ok(Self {
            devices: Mutex::new(devices),
            drivers: parsed.drivers,
        })
    }
}

#[async_trait]
impl DeviceCatalog for FileCatalog {
    async fn find_device(&self, id: &str) -> Result<Option<Device>> {
        Ok(self.devices.lock().unwrap().get(id).cloned())
    }

    async fn list_enabled_devices(&self) -> Result<Vec<Device>> {
        Ok(self
            .devices
            .lock()
            .unwrap()
            .values()
            .filter(|device| device.enabled)
            .cloned()
            .collect())
    }

    async fn update_last_seen(&self, id: &str, timestamp: DateTime<Utc>) -> Result<()> {
        if let Some(device) = self.devices.lock().unwrap().get_mut(id) {
            device.last_seen = Some(timestamp);
        }
        Ok(())
    }

    async fn load_driver_config(&self, driver_id: &str) -> Result<Option<DriverConfig>> {
        Ok(self.drivers.get(driver_id).cloned())
    }
}

/// Appends history rows as JSON lines. Rows that fail to serialize are
/// logged and skipped, matching the sink contract of tolerating per-row
/// failures.
pub struct JsonlHistorySink {
    file: tokio::sync::Mutex<tokio::fs::File>,
}

impl JsonlHistorySink {
    pub async fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
            .await
            .map_err(Error::transport)?;
        Ok(Self {
            file: tokio::sync::Mutex::new(file),
        })
    }
}

#[async_trait]
impl HistorySink for JsonlHistorySink {
    async fn append_many(&self, rows: Vec<HistoryRow>) -> Result<()> {
        let mut buffer = Vec::new();
        for row in &rows {
            match serde_json::to_vec(row) {
                Ok(mut line) => {
                    buffer.append(&mut line);
                    buffer.push(b'\n');
                }
                Err(err) => log::error!("skipping unserializable history row: {}", err),
            }
        }
        let mut file = self.file.lock().await;
        file.write_all(&buffer).await.map_err(Error::transport)?;
        file.flush().await.map_err(Error::transport)?;
        Ok(())
    }
}

/// Best-effort push channel that only logs. Stands in for the realtime
/// gateway in deployments that do not have one.
pub struct LogPushChannel;

#[async_trait]
impl PushChannel for LogPushChannel {
    async fn publish_snapshot(&self, device_id: &str, snapshot: &DeviceSnapshot) -> Result<()> {
        log::debug!(
            "push: {} ({} readings at {})",
            device_id,
            snapshot.readings.len(),
            snapshot.timestamp
        );
        Ok(())
    }
}
