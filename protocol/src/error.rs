//! This module defines the [`enum@Error`] enum, which separates all errors
//! that may occur in the engine into different categories.

use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::value::DataType;

pub type Result<T> = std::result::Result<T, Error>;

/// Encodes errors occurring in the engine. It allows separating errors into
/// categories that drive different recovery policies:
///
///  * [`Error::Transport`] - Errors on the transport layer, such as a refused TCP connection or a disconnected serial port. Transient; counted against a device's consecutive error budget.
///  * [`Error::Protocol`] - Errors on the protocol layer, such as Modbus exception responses, invalid frames or devices failing to answer in time. Scoped to a single range read.
///  * [`Error::Decode`] - Errors turning register words into typed values. Scoped to a single parameter.
///  * [`Error::Device`] - Per-device conditions such as a missing configuration or a disabled flag.
///  * [`Error::Config`] - Invalid device schemas. Fatal per-device; the device is quarantined and not retried.
///  * [`Error::Internal`] - Bugs or broken invariants inside the engine itself.
///
/// To avoid a very large enum that captures all errors coming from internal
/// libraries, the uncommon causes fall back to [`anyhow::Error`].
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Transport Error: {0}")]
    Transport(TransportError),
    #[error("Protocol Error: {0}")]
    Protocol(ProtocolError),
    #[error("Decode Error: {0}")]
    Decode(DecodeError),
    #[error("Device Error: {0}")]
    Device(DeviceError),
    #[error("Configuration Error: {0}")]
    Config(Arc<anyhow::Error>),
    #[error("Internal Error: {0}")]
    Internal(Arc<anyhow::Error>),
}

impl Error {
    pub fn transport<T: Into<TransportError>>(err: T) -> Self {
        Self::Transport(err.into())
    }

    pub fn protocol<T: Into<ProtocolError>>(err: T) -> Self {
        Self::Protocol(err.into())
    }

    /// Helper function to create `Error::Protocol(ProtocolError::Timeout)`
    pub fn protocol_timeout() -> Self {
        Error::Protocol(ProtocolError::Timeout)
    }

    pub fn config<T: Into<anyhow::Error>>(err: T) -> Self {
        Self::Config(Arc::new(err.into()))
    }

    pub fn internal<T: Into<anyhow::Error>>(err: T) -> Self {
        Self::Internal(Arc::new(err.into()))
    }

    /// Determines based on the error type whether it makes sense (and is
    /// allowed) to retry the operation on the same device.
    pub fn should_retry(&self) -> bool {
        match self {
            Error::Transport(TransportError::Io(err)) => {
                err.kind() == io::ErrorKind::ConnectionReset
                    || err.kind() == io::ErrorKind::ConnectionAborted
                    || err.kind() == io::ErrorKind::BrokenPipe
                    || err.kind() == io::ErrorKind::TimedOut
                    || err.kind() == io::ErrorKind::UnexpectedEof
            }
            Error::Transport(TransportError::Refused) => true,
            Error::Transport(TransportError::Timeout) => true,
            Error::Transport(TransportError::ConnectionLost) => true,
            Error::Transport(TransportError::PortBusy(_)) => true,
            Error::Transport(_) => false,
            Error::Protocol(ProtocolError::Timeout) => true,
            Error::Protocol(_) => false,
            Error::Decode(_) => false,
            Error::Device(_) => false,
            Error::Config(_) => false,
            Error::Internal(_) => false,
        }
    }

    /// True for errors that quarantine a device: no automatic retry will
    /// ever succeed because the device definition itself is broken.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::Device(DeviceError::NoConfiguration)
                | Error::Device(DeviceError::MissingDriver(_))
        )
    }

    /// True for errors after which the underlying session state is
    /// undefined and the transport must be discarded.
    pub fn poisons_session(&self) -> bool {
        matches!(
            self,
            Error::Transport(TransportError::Timeout)
                | Error::Transport(TransportError::ConnectionLost)
                | Error::Transport(TransportError::Io(_))
                | Error::Protocol(ProtocolError::Timeout)
        )
    }

    pub fn is_transport_error(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

#[derive(Error, Clone, Debug)]
pub enum TransportError {
    #[error("IO Error: {0:?}")]
    Io(Arc<io::Error>),
    #[error("Connection refused")]
    Refused,
    #[error("Timed out")]
    Timeout,
    #[error("Connection lost")]
    ConnectionLost,
    #[error("Serial port not found: {0}")]
    PortNotFound(String),
    #[error("Permission denied on serial port: {0}")]
    PermissionDenied(String),
    #[error("Serial port busy: {0}")]
    PortBusy(String),
    #[error("Other Error: {0}")]
    Other(Arc<anyhow::Error>),
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => TransportError::Refused,
            io::ErrorKind::TimedOut => TransportError::Timeout,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => TransportError::ConnectionLost,
            _ => TransportError::Io(Arc::new(err)),
        }
    }
}

impl From<anyhow::Error> for TransportError {
    fn from(x: anyhow::Error) -> Self {
        TransportError::Other(Arc::new(x))
    }
}

#[derive(Error, Clone, Debug)]
pub enum ProtocolError {
    #[error("Timeout")]
    Timeout,
    #[error("Modbus exception: {0}")]
    Exception(ModbusException),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
    #[error("Invalid CRC in received frame")]
    Crc,
}

impl From<ModbusException> for ProtocolError {
    fn from(x: ModbusException) -> Self {
        ProtocolError::Exception(x)
    }
}

/// Exception codes a Modbus server may answer with instead of data. The
/// server sets the high bit of the function code and appends one of these.
#[derive(Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModbusException {
    #[error("Illegal Function")]
    IllegalFunction,
    #[error("Illegal Data Address")]
    IllegalAddress,
    #[error("Illegal Data Value")]
    IllegalValue,
    #[error("Slave Device Failure")]
    SlaveFailure,
    #[error("Acknowledge")]
    Acknowledge,
    #[error("Slave Device Busy")]
    SlaveBusy,
    #[error("Negative Acknowledgement")]
    Nak,
    #[error("Gateway Path Unavailable")]
    GatewayPath,
    #[error("Gateway Target Device Failed to Respond")]
    GatewayTarget,
    #[error("Unknown Exception Code: {0}")]
    Unknown(u8),
}

impl ModbusException {
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => ModbusException::IllegalFunction,
            2 => ModbusException::IllegalAddress,
            3 => ModbusException::IllegalValue,
            4 => ModbusException::SlaveFailure,
            5 => ModbusException::Acknowledge,
            6 => ModbusException::SlaveBusy,
            7 => ModbusException::Nak,
            10 => ModbusException::GatewayPath,
            11 => ModbusException::GatewayTarget,
            x => ModbusException::Unknown(x),
        }
    }
}

/// Errors turning raw register words into typed values. Width mismatches are
/// rejected when the schema is loaded; only `InsufficientWords` can surface
/// during a live decode.
#[derive(Error, Clone, Debug, PartialEq)]
pub enum DecodeError {
    #[error("insufficient words: needed {needed}, got {got}")]
    InsufficientWords { needed: usize, got: usize },
    #[error("byte order {order} does not fit a {data_type} value")]
    WidthMismatch { data_type: DataType, order: String },
    #[error("value is not numeric")]
    NotNumeric,
    #[error("value {value} is out of range for {data_type}")]
    OutOfRange { data_type: DataType, value: f64 },
}

#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum DeviceError {
    #[error("device has no data points configured")]
    NoConfiguration,
    #[error("device is disabled")]
    Disabled,
    #[error("device is not tracked by the engine")]
    NotTracked,
    #[error("driver config {0} could not be loaded")]
    MissingDriver(String),
}
