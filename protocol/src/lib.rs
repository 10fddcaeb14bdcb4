//! Shared data model of the `daqsrv` data-acquisition engine.
//!
//! This crate carries everything that crosses a component boundary: the
//! device schema consumed from the catalog, the typed values and readings
//! produced by the engine, the change events and history rows emitted by the
//! dispatch fan-out, and the error taxonomy. All types are plain
//! serde-serializable data without any tokio machinery, so collaborators can
//! depend on this crate alone.

use serde::{Deserialize, Serialize};

pub mod device;
pub mod error;
pub mod serial;
pub mod value;

pub use device::{
    AdvancedSettings, ConnectionSettings, DataPoint, Device, Parameter, RegisterFunction,
    RegisterRange,
};
pub use error::{
    DecodeError, DeviceError, Error, ModbusException, ProtocolError, Result, TransportError,
};
pub use serial::{DataBits, Parity, SerialParams, StopBits};
pub use value::{
    ByteOrder, ChangeEvent, ChangeSource, DataType, DeviceHealth, DeviceReadingSet,
    DeviceSnapshot, DeviceStatus, HistoryRow, Reading, Value,
};

/// Aggregate counters reported by the engine's `get_service_stats` call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceStats {
    pub total_devices: usize,
    pub online: usize,
    pub offline: usize,
    pub active_connections: usize,
    pub pending_changes: usize,
    pub intervals: IntervalSettings,
}

/// The engine's currently effective timer settings, in milliseconds.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct IntervalSettings {
    pub monitoring_ms: u64,
    pub heartbeat_ms: u64,
    pub compliance_snapshot_ms: u64,
}
