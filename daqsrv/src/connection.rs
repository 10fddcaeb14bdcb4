//! Per-device connection management: translates a `Device` into a ready
//! [`Transport`], serializes access to shared serial ports and retries
//! failed connects with exponential backoff.
//!
//! An RTU bus is a shared medium, so a process-wide registry maps every
//! serial-port path to an exclusive async lock. The lock is acquired before
//! the port is opened and released when the connection is dropped, on every
//! path. TCP connections are per-device and need no such registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_serial::SerialStream;

use daqsrv_protocol::{
    ConnectionSettings, DataBits, Device, Error, Parity, Result, StopBits, TransportError,
};

use crate::modbus::Transport;

lazy_static! {
    static ref SERIAL_PORTS: Mutex<HashMap<String, Arc<AsyncMutex<()>>>> =
        Mutex::new(HashMap::new());
}

static ACTIVE_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);

/// Number of currently open transports, across all devices.
pub fn active_connections() -> usize {
    ACTIVE_CONNECTIONS.load(Ordering::SeqCst)
}

/// The exclusive lock for a serial-port path. The same physical port may be
/// spelled with different casing across device records.
fn port_lock(path: &str) -> Arc<AsyncMutex<()>> {
    let mut table = SERIAL_PORTS.lock().unwrap();
    table
        .entry(path.to_lowercase())
        .or_insert_with(|| Arc::new(AsyncMutex::new(())))
        .clone()
}

#[derive(Debug)]
struct ConnectionTicket;

impl ConnectionTicket {
    fn new() -> Self {
        ACTIVE_CONNECTIONS.fetch_add(1, Ordering::SeqCst);
        ConnectionTicket
    }
}

impl Drop for ConnectionTicket {
    fn drop(&mut self) {
        ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An open transport bound to one device, holding the port lock for RTU
/// devices. Dropping the connection releases the lock and the accounting
/// even if the owning task aborts mid-transaction.
#[derive(Debug)]
pub struct DeviceConnection {
    transport: Transport,
    _ticket: ConnectionTicket,
    _port_guard: Option<OwnedMutexGuard<()>>,
}

impl DeviceConnection {
    /// Open a transport for the device, retrying per its advanced settings
    /// (`retries`, `retry_delay_ms`, doubling per attempt). Only errors
    /// worth retrying are retried.
    pub async fn open(device: &Device) -> Result<Self> {
        let settings = &device.advanced_settings;
        let retry_delay = Duration::from_millis(settings.retry_delay_ms);
        let mut attempt: u32 = 0;
        loop {
            match Self::open_once(device).await {
                Ok(x) => return Ok(x),
                Err(err) => {
                    if attempt >= settings.retries || !err.should_retry() {
                        return Err(err);
                    }
                    let delay = retry_delay * 2_u32.saturating_pow(attempt);
                    log::debug!(
                        "connect to {} failed ({}), retrying in {:?}",
                        device.id,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn open_once(device: &Device) -> Result<Self> {
        let connect_timeout = Duration::from_millis(device.advanced_settings.connect_timeout_ms);
        let request_timeout = Duration::from_millis(device.advanced_settings.request_timeout_ms);
        match &device.connection {
            ConnectionSettings::Tcp { ip, port, unit_id } => {
                let mut transport =
                    Transport::connect_tcp(ip, *port, *unit_id, connect_timeout).await?;
                transport.set_timeout(request_timeout);
                Ok(Self {
                    transport,
                    _ticket: ConnectionTicket::new(),
                    _port_guard: None,
                })
            }
            ConnectionSettings::Rtu {
                serial_port,
                baud_rate,
                data_bits,
                stop_bits,
                parity,
                unit_id,
            } => {
                let lock = port_lock(serial_port);
                let guard = match tokio::time::timeout(connect_timeout, lock.lock_owned()).await {
                    Ok(guard) => guard,
                    Err(_) => {
                        return Err(Error::Transport(TransportError::PortBusy(
                            serial_port.clone(),
                        )))
                    }
                };
                if let Some((path, params)) = device.connection.serial_params() {
                    log::debug!("opening serial port {} ({})", path, params);
                }
                let builder = tokio_serial::new(serial_port, *baud_rate)
                    .data_bits(to_serial_data_bits(*data_bits))
                    .stop_bits(to_serial_stop_bits(*stop_bits))
                    .parity(to_serial_parity(*parity))
                    .timeout(connect_timeout);
                let stream = SerialStream::open(&builder)
                    .map_err(|err| map_serial_error(serial_port, err))?;
                Ok(Self {
                    transport: Transport::rtu(stream, *unit_id, request_timeout),
                    _ticket: ConnectionTicket::new(),
                    _port_guard: Some(guard),
                })
            }
        }
    }

    pub fn transport_mut(&mut self) -> &mut Transport {
        &mut self.transport
    }

    /// A connection is valid iff the session is open and the last operation
    /// did not poison it. Invalid connections must be discarded.
    pub fn valid(&self) -> bool {
        self.transport.valid()
    }

    pub fn is_rtu(&self) -> bool {
        self.transport.is_rtu()
    }

    /// Close gracefully, releasing the serial-port lock. Dropping the
    /// connection without calling this releases the lock as well.
    pub async fn close(self) {
        self.transport.close().await;
    }
}

fn map_serial_error(path: &str, err: tokio_serial::Error) -> Error {
    let transport = match err.kind {
        tokio_serial::ErrorKind::NoDevice => TransportError::PortNotFound(path.to_string()),
        tokio_serial::ErrorKind::Io(std::io::ErrorKind::NotFound) => {
            TransportError::PortNotFound(path.to_string())
        }
        tokio_serial::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
            TransportError::PermissionDenied(path.to_string())
        }
        _ => TransportError::Other(Arc::new(anyhow::anyhow!("{}: {}", path, err))),
    };
    Error::Transport(transport)
}

fn to_serial_data_bits(x: DataBits) -> tokio_serial::DataBits {
    match x {
        DataBits::Five => tokio_serial::DataBits::Five,
        DataBits::Six => tokio_serial::DataBits::Six,
        DataBits::Seven => tokio_serial::DataBits::Seven,
        DataBits::Eight => tokio_serial::DataBits::Eight,
    }
}

fn to_serial_stop_bits(x: StopBits) -> tokio_serial::StopBits {
    match x {
        StopBits::One => tokio_serial::StopBits::One,
        StopBits::Two => tokio_serial::StopBits::Two,
    }
}

fn to_serial_parity(x: Parity) -> tokio_serial::Parity {
    match x {
        Parity::None => tokio_serial::Parity::None,
        Parity::Odd => tokio_serial::Parity::Odd,
        Parity::Even => tokio_serial::Parity::Even,
    }
}
