//! Typed engineering values and the event/record types built from them.

use std::fmt;
use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The register-level data types the codec understands. The names follow the
/// device schema verbatim.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    #[serde(rename = "UINT16")]
    Uint16,
    #[serde(rename = "INT16")]
    Int16,
    #[serde(rename = "UINT32")]
    Uint32,
    #[serde(rename = "INT32")]
    Int32,
    #[serde(rename = "FLOAT32")]
    Float32,
    #[serde(rename = "BOOL")]
    Bool,
}

impl DataType {
    /// Number of 16-bit registers one value of this type occupies.
    pub fn word_count(&self) -> usize {
        match self {
            DataType::Uint16 | DataType::Int16 | DataType::Bool => 1,
            DataType::Uint32 | DataType::Int32 | DataType::Float32 => 2,
        }
    }
}

impl Display for DataType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let x = match self {
            DataType::Uint16 => "UINT16",
            DataType::Int16 => "INT16",
            DataType::Uint32 => "UINT32",
            DataType::Int32 => "INT32",
            DataType::Float32 => "FLOAT32",
            DataType::Bool => "BOOL",
        };
        f.write_str(x)
    }
}

/// Arrangement of the bytes of a value across its registers. `Ab`/`Ba` apply
/// to 1-word types, the 4-letter variants to 2-word types. Whether an order
/// fits a data type is checked when the schema is loaded, never at decode
/// time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ByteOrder {
    #[serde(rename = "AB")]
    Ab,
    #[serde(rename = "BA")]
    Ba,
    #[serde(rename = "ABCD")]
    Abcd,
    #[serde(rename = "CDAB")]
    Cdab,
    #[serde(rename = "BADC")]
    Badc,
    #[serde(rename = "DCBA")]
    Dcba,
}

impl ByteOrder {
    pub fn word_count(&self) -> usize {
        match self {
            ByteOrder::Ab | ByteOrder::Ba => 1,
            _ => 2,
        }
    }

    /// The default order for a data type: `AB` for 1-word, `ABCD` for 2-word.
    pub fn default_for(data_type: DataType) -> Self {
        if data_type.word_count() == 1 {
            ByteOrder::Ab
        } else {
            ByteOrder::Abcd
        }
    }
}

impl Display for ByteOrder {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let x = match self {
            ByteOrder::Ab => "AB",
            ByteOrder::Ba => "BA",
            ByteOrder::Abcd => "ABCD",
            ByteOrder::Cdab => "CDAB",
            ByteOrder::Badc => "BADC",
            ByteOrder::Dcba => "DCBA",
        };
        f.write_str(x)
    }
}

/// A decoded engineering value. `Null` is the sole sentinel for
/// "unreadable/undefined"; errors never appear in the value itself. All
/// numeric types decode into `Number` (every 32-bit integer is exact in an
/// `f64`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(x) => Some(*x),
            _ => None,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(x) => write!(f, "{}", x),
            Value::Number(x) => write!(f, "{}", x),
            Value::Text(x) => f.write_str(x),
        }
    }
}

/// One parameter's outcome within a device read. A failed decode is reported
/// alongside successful neighbours instead of failing the range.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reading {
    Ok {
        name: String,
        address: u16,
        value: Value,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        unit: Option<String>,
        data_type: DataType,
    },
    Failed {
        name: String,
        address: u16,
        error: String,
    },
}

impl Reading {
    pub fn name(&self) -> &str {
        match self {
            Reading::Ok { name, .. } => name,
            Reading::Failed { name, .. } => name,
        }
    }

    pub fn address(&self) -> u16 {
        match self {
            Reading::Ok { address, .. } => *address,
            Reading::Failed { address, .. } => *address,
        }
    }

    /// The reading's value; a failed reading reads as `Null`.
    pub fn value(&self) -> Value {
        match self {
            Reading::Ok { value, .. } => value.clone(),
            Reading::Failed { .. } => Value::Null,
        }
    }

    pub fn unit(&self) -> Option<&str> {
        match self {
            Reading::Ok { unit, .. } => unit.as_deref(),
            Reading::Failed { .. } => None,
        }
    }
}

/// The outcome of one full pass over a device's data points.
/// `partial` is true if at least one range read or parameter decode failed
/// while at least one reading succeeded.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceReadingSet {
    pub device_id: String,
    pub device_name: String,
    pub timestamp: DateTime<Utc>,
    pub readings: Vec<Reading>,
    pub partial: bool,
}

/// What triggered an observation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeSource {
    Modbus,
    Sync,
    Heartbeat,
    Snapshot,
}

/// Emitted whenever a parameter's value differs from the last observation by
/// more than the change threshold (and unconditionally for compliance
/// snapshots).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub device_id: String,
    pub address: u16,
    pub register_name: String,
    pub old_value: Value,
    pub new_value: Value,
    pub timestamp: DateTime<Utc>,
    pub source: ChangeSource,
}

/// One row appended to the history sink per changed parameter.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryRow {
    pub device_id: String,
    pub parameter_name: String,
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub unit: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub quality: String,
    pub source: ChangeSource,
    pub old_value: Value,
}

/// The most recent fully-read state of one device. A new snapshot replaces
/// the previous one atomically; readers never observe a torn mix.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub device_name: String,
    pub timestamp: DateTime<Utc>,
    pub readings: Vec<Reading>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
    Degraded,
    Unknown,
}

/// Health report for one tracked device, served by the engine's API.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceHealth {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_seen: Option<DateTime<Utc>>,
    /// Fraction of recent cycles that failed, in `[0, 1]`.
    pub error_rate: f64,
    /// Rolling average transaction time in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub response_time_ms: Option<f64>,
    pub status: DeviceStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_serializes_null_and_numbers() {
        assert_eq!(serde_json::to_string(&Value::Null).unwrap(), "null");
        assert_eq!(serde_json::to_string(&Value::Number(3.5)).unwrap(), "3.5");
        assert_eq!(serde_json::to_string(&Value::Bool(true)).unwrap(), "true");
        let v: Value = serde_json::from_str("null").unwrap();
        assert!(v.is_null());
    }

    #[test]
    fn reading_roundtrips_both_variants() {
        let ok = Reading::Ok {
            name: "voltage".to_string(),
            address: 102,
            value: Value::Number(3.0),
            unit: Some("V".to_string()),
            data_type: DataType::Uint16,
        };
        let json = serde_json::to_string(&ok).unwrap();
        let back: Reading = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ok);

        let failed = Reading::Failed {
            name: "voltage".to_string(),
            address: 102,
            error: "insufficient words: needed 2, got 1".to_string(),
        };
        let json = serde_json::to_string(&failed).unwrap();
        let back: Reading = serde_json::from_str(&json).unwrap();
        assert_eq!(back, failed);
        assert!(back.value().is_null());
    }

    #[test]
    fn byte_order_defaults_match_width() {
        assert_eq!(ByteOrder::default_for(DataType::Uint16), ByteOrder::Ab);
        assert_eq!(ByteOrder::default_for(DataType::Float32), ByteOrder::Abcd);
        assert_eq!(ByteOrder::Cdab.word_count(), 2);
        assert_eq!(ByteOrder::Ba.word_count(), 1);
    }
}
