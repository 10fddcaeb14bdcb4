//! The device schema as handed over by the catalog: connection settings,
//! read ranges and the per-parameter decoding rules.
//!
//! Schemas arrive in slightly different vintages (relative vs absolute
//! register indices, divisor vs factor scaling). [`Device::normalize`] folds
//! all of them into one canonical representation at load time so the rest of
//! the engine never branches on schema age.

use std::convert::TryFrom;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::serial::{DataBits, Parity, SerialParams, StopBits};
use crate::value::{ByteOrder, DataType};

/// Modbus limit for a single register-range read.
pub const MAX_REGISTER_COUNT: u16 = 125;
/// Modbus limit for a single coil/discrete-input read.
pub const MAX_BIT_COUNT: u16 = 2000;

/// The four read function codes a range may use.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum RegisterFunction {
    Coils,
    DiscreteInputs,
    HoldingRegisters,
    InputRegisters,
}

impl RegisterFunction {
    pub fn code(&self) -> u8 {
        match self {
            RegisterFunction::Coils => 1,
            RegisterFunction::DiscreteInputs => 2,
            RegisterFunction::HoldingRegisters => 3,
            RegisterFunction::InputRegisters => 4,
        }
    }

    /// True for the bit-addressed functions (coils, discrete inputs).
    pub fn is_bits(&self) -> bool {
        matches!(self, RegisterFunction::Coils | RegisterFunction::DiscreteInputs)
    }

    pub fn max_count(&self) -> u16 {
        if self.is_bits() {
            MAX_BIT_COUNT
        } else {
            MAX_REGISTER_COUNT
        }
    }
}

impl TryFrom<u8> for RegisterFunction {
    type Error = String;

    fn try_from(x: u8) -> std::result::Result<Self, String> {
        match x {
            1 => Ok(RegisterFunction::Coils),
            2 => Ok(RegisterFunction::DiscreteInputs),
            3 => Ok(RegisterFunction::HoldingRegisters),
            4 => Ok(RegisterFunction::InputRegisters),
            _ => Err(format!("invalid read function code: {}", x)),
        }
    }
}

impl From<RegisterFunction> for u8 {
    fn from(x: RegisterFunction) -> u8 {
        x.code()
    }
}

/// A contiguous run of addresses read in one Modbus transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRange {
    pub function_code: RegisterFunction,
    pub start_address: u16,
    pub count: u16,
}

impl RegisterRange {
    pub fn contains(&self, address: u16, words: usize) -> bool {
        let start = self.start_address as u32;
        let end = start + self.count as u32;
        let first = address as u32;
        let last = first + words as u32 - 1;
        first >= start && last < end
    }
}

/// Decoding rule for one value inside a range. `register_index` is the
/// parameter's absolute address after [`Device::normalize`] ran.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Parameter {
    pub name: String,
    pub data_type: DataType,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub byte_order: Option<ByteOrder>,
    pub register_index: u16,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub word_count: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub scaling_factor: Option<f64>,
    /// Legacy divisor form; folded into `scaling_factor` by normalization.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub scale_factor: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub scaling_equation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub decimal_point: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub min_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub max_value: Option<f64>,
}

impl Parameter {
    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
            .unwrap_or_else(|| ByteOrder::default_for(self.data_type))
    }

    pub fn word_count(&self) -> usize {
        self.word_count
            .map(|x| x as usize)
            .unwrap_or_else(|| self.data_type.word_count())
    }

    pub fn scaling_factor(&self) -> f64 {
        self.scaling_factor.unwrap_or(1.0)
    }
}

/// One read plan entry: a range plus the decoding schema for values in it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPoint {
    pub range: RegisterRange,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

fn default_tcp_port() -> u16 {
    502
}

fn default_unit_id() -> u8 {
    1
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> DataBits {
    DataBits::Eight
}

fn default_stop_bits() -> StopBits {
    StopBits::One
}

fn default_parity() -> Parity {
    Parity::None
}

/// How to reach a device: Modbus TCP or Modbus RTU over a serial line.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectionSettings {
    #[serde(rename_all = "camelCase")]
    Tcp {
        ip: String,
        #[serde(default = "default_tcp_port")]
        port: u16,
        #[serde(default = "default_unit_id")]
        unit_id: u8,
    },
    #[serde(rename_all = "camelCase")]
    Rtu {
        serial_port: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        #[serde(default = "default_data_bits")]
        data_bits: DataBits,
        #[serde(default = "default_stop_bits")]
        stop_bits: StopBits,
        #[serde(default = "default_parity")]
        parity: Parity,
        #[serde(default = "default_unit_id")]
        unit_id: u8,
    },
}

impl ConnectionSettings {
    pub fn unit_id(&self) -> u8 {
        match self {
            ConnectionSettings::Tcp { unit_id, .. } => *unit_id,
            ConnectionSettings::Rtu { unit_id, .. } => *unit_id,
        }
    }

    pub fn is_rtu(&self) -> bool {
        matches!(self, ConnectionSettings::Rtu { .. })
    }

    /// The serial path and line parameters of an RTU connection.
    pub fn serial_params(&self) -> Option<(&str, SerialParams)> {
        match self {
            ConnectionSettings::Rtu {
                serial_port,
                baud_rate,
                data_bits,
                stop_bits,
                parity,
                ..
            } => Some((
                serial_port,
                SerialParams {
                    baud: *baud_rate,
                    data_bits: *data_bits,
                    stop_bits: *stop_bits,
                    parity: *parity,
                },
            )),
            _ => None,
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_retry_delay_ms() -> u64 {
    500
}

/// Per-device tuning knobs, all optional in the schema.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvancedSettings {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub poll_interval_ms: Option<u64>,
}

impl Default for AdvancedSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            retries: 0,
            retry_delay_ms: default_retry_delay_ms(),
            poll_interval_ms: None,
        }
    }
}

/// A field device as defined in the catalog. Immutable within a polling
/// cycle; the engine clones it at cycle start and reports `last_seen`
/// mutations back through the catalog.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub connection: ConnectionSettings,
    #[serde(default)]
    pub data_points: Vec<DataPoint>,
    /// Set when the device carries only a driver reference; its data points
    /// are then loaded lazily from the catalog's driver config.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub driver_id: Option<String>,
    /// Register numbering origin, 0 or 1. A base of 1 shifts every range
    /// down by one register on the wire.
    #[serde(default)]
    pub address_base: u8,
    #[serde(default)]
    pub advanced_settings: AdvancedSettings,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_seen: Option<DateTime<Utc>>,
}

impl Device {
    pub fn unit_id(&self) -> u8 {
        self.connection.unit_id()
    }

    /// Normalize then validate; call once after loading a schema.
    pub fn prepare(&mut self) -> Result<()> {
        self.normalize()?;
        self.validate()
    }

    /// Fold schema vintages into the canonical representation:
    /// register indices become absolute, legacy divisor scaling becomes a
    /// multiplicative factor.
    pub fn normalize(&mut self) -> Result<()> {
        for point in &mut self.data_points {
            let start = point.range.start_address;
            for param in &mut point.parameters {
                // A relative index is only recognizable when it lies below
                // the range start; anything else is already absolute.
                if param.register_index < start {
                    let absolute = param.register_index as u32 + start as u32;
                    if absolute > u16::MAX as u32 {
                        return Err(Error::config(anyhow!(
                            "parameter {}: relative index {} overflows the address space",
                            param.name,
                            param.register_index
                        )));
                    }
                    param.register_index = absolute as u16;
                }
                if let Some(divisor) = param.scale_factor.take() {
                    if divisor == 0.0 {
                        return Err(Error::config(anyhow!(
                            "parameter {}: legacy scale factor must not be zero",
                            param.name
                        )));
                    }
                    if param.scaling_factor.is_none() {
                        param.scaling_factor = Some(1.0 / divisor);
                    }
                }
            }
        }
        Ok(())
    }

    /// Structural validation of the schema. Violations are configuration
    /// errors, which quarantine the device.
    pub fn validate(&self) -> Result<()> {
        if self.address_base > 1 {
            return Err(Error::config(anyhow!(
                "device {}: address base must be 0 or 1, got {}",
                self.id,
                self.address_base
            )));
        }
        for point in &self.data_points {
            let range = &point.range;
            if range.count == 0 {
                return Err(Error::config(anyhow!(
                    "device {}: range at {} has zero count",
                    self.id,
                    range.start_address
                )));
            }
            if range.count > range.function_code.max_count() {
                return Err(Error::config(anyhow!(
                    "device {}: range at {} reads {} items, maximum is {}",
                    self.id,
                    range.start_address,
                    range.count,
                    range.function_code.max_count()
                )));
            }
            if range.start_address as u32 + range.count as u32 > 0x10000 {
                return Err(Error::config(anyhow!(
                    "device {}: range at {} runs past the address space",
                    self.id,
                    range.start_address
                )));
            }
            if self.address_base == 1 && range.start_address == 0 {
                return Err(Error::config(anyhow!(
                    "device {}: address base 1 does not allow a range at address 0",
                    self.id
                )));
            }
            for param in &point.parameters {
                self.validate_parameter(range, param)?;
            }
        }
        Ok(())
    }

    fn validate_parameter(&self, range: &RegisterRange, param: &Parameter) -> Result<()> {
        let words = param.word_count();
        if words != param.data_type.word_count() {
            return Err(Error::config(anyhow!(
                "parameter {}: word count {} does not match {}",
                param.name,
                words,
                param.data_type
            )));
        }
        if param.byte_order().word_count() != param.data_type.word_count() {
            return Err(Error::config(anyhow!(
                "parameter {}: byte order {} does not fit {}",
                param.name,
                param.byte_order(),
                param.data_type
            )));
        }
        if range.function_code.is_bits() && param.data_type != DataType::Bool {
            return Err(Error::config(anyhow!(
                "parameter {}: {} is not readable from a bit range",
                param.name,
                param.data_type
            )));
        }
        if let Some(factor) = param.scaling_factor {
            if !factor.is_finite() {
                return Err(Error::config(anyhow!(
                    "parameter {}: scaling factor must be finite",
                    param.name
                )));
            }
        }
        if let (Some(min), Some(max)) = (param.min_value, param.max_value) {
            if min > max {
                return Err(Error::config(anyhow!(
                    "parameter {}: minValue {} exceeds maxValue {}",
                    param.name,
                    min,
                    max
                )));
            }
        }
        Ok(())
    }
}
