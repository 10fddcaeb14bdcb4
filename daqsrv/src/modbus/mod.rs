//! Modbus TCP and RTU client framing.
//!
//! All framing operates on bytestreams (`AsyncRead + AsyncWrite`). On a
//! typical OS it is not possible to implement Modbus RTU with timer-based
//! inter-character framing, so frames are delimited by exact-length reads
//! and validated with the CRC instead.

mod registers;
mod rtu;
mod tcp;

pub use registers::{ReadBoolRegisters, ReadU16Registers, WriteCoil, WriteCoils};
pub use rtu::crc;

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio_serial::SerialStream;

use daqsrv_protocol::{Error, Result, TransportError};

pub(crate) mod function_codes {
    pub const READ_COILS: u8 = 1;
    pub const READ_DISCRETES: u8 = 2;
    pub const READ_HOLDINGS: u8 = 3;
    pub const READ_INPUTS: u8 = 4;
    pub const WRITE_COIL: u8 = 5;
    pub const WRITE_MULTIPLE_COILS: u8 = 15;
}

/// Function code handler. Both the RTU and the TCP handler implementations
/// get the necessary information from these handlers to perform the framing.
pub trait FunctionCode {
    type Output;

    fn format_request(&self, data: &mut Vec<u8>);
    fn get_header_length(&self) -> usize;
    fn get_data_length_from_header(&self, data: &[u8]) -> Result<usize>;
    fn parse_frame(&self, data: &[u8]) -> Result<Self::Output>;

    fn function_code(&self) -> u8;
}

pub struct TransactionInfo {
    transaction_id: u16,
    unit_id: u8,
}

impl TransactionInfo {
    pub fn new(unit_id: u8) -> Self {
        Self {
            transaction_id: rand::random(),
            unit_id,
        }
    }
}

#[derive(Debug)]
enum Session {
    Tcp(TcpStream),
    Rtu(SerialStream),
}

/// One open Modbus session. The same contract is offered regardless of the
/// underlying framing. Every operation is bounded by the session timeout;
/// once an operation times out or the connection drops, the session state is
/// undefined, `valid()` turns false and the caller must discard the
/// transport.
#[derive(Debug)]
pub struct Transport {
    session: Session,
    unit_id: u8,
    timeout: Duration,
    valid: bool,
}

impl Transport {
    /// Open a Modbus TCP session. Connect errors map to the transport error
    /// taxonomy; a connect running past `timeout` fails with `Timeout`.
    pub async fn connect_tcp(ip: &str, port: u16, unit_id: u8, timeout: Duration) -> Result<Self> {
        let fut = TcpStream::connect((ip, port));
        let stream = match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(Error::transport(err)),
            Err(_) => return Err(Error::Transport(TransportError::Timeout)),
        };
        Ok(Self {
            session: Session::Tcp(stream),
            unit_id,
            timeout,
            valid: true,
        })
    }

    /// Wrap an already-open serial stream into an RTU session. Opening the
    /// port (and holding its exclusive lock) is the connection manager's
    /// business.
    pub fn rtu(stream: SerialStream, unit_id: u8, timeout: Duration) -> Self {
        Self {
            session: Session::Rtu(stream),
            unit_id,
            timeout,
            valid: true,
        }
    }

    pub fn set_unit_id(&mut self, unit_id: u8) {
        self.unit_id = unit_id;
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// False once the session state is undefined (timeout, lost
    /// connection). An invalid transport must be discarded and reconnected.
    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn is_rtu(&self) -> bool {
        matches!(self.session, Session::Rtu(_))
    }

    pub async fn read_coils(&mut self, addr: u16, cnt: u16) -> Result<Vec<bool>> {
        let function = ReadBoolRegisters::new(function_codes::READ_COILS, addr, cnt)?;
        self.transact(function).await
    }

    pub async fn read_discrete_inputs(&mut self, addr: u16, cnt: u16) -> Result<Vec<bool>> {
        let function = ReadBoolRegisters::new(function_codes::READ_DISCRETES, addr, cnt)?;
        self.transact(function).await
    }

    pub async fn read_holding_registers(&mut self, addr: u16, cnt: u16) -> Result<Vec<u16>> {
        let function = ReadU16Registers::new(function_codes::READ_HOLDINGS, addr, cnt)?;
        self.transact(function).await
    }

    pub async fn read_input_registers(&mut self, addr: u16, cnt: u16) -> Result<Vec<u16>> {
        let function = ReadU16Registers::new(function_codes::READ_INPUTS, addr, cnt)?;
        self.transact(function).await
    }

    pub async fn write_coil(&mut self, addr: u16, value: bool) -> Result<()> {
        self.transact(WriteCoil::new(addr, value)).await
    }

    pub async fn write_coils(&mut self, addr: u16, values: &[bool]) -> Result<()> {
        let function = WriteCoils::new(addr, values)?;
        self.transact(function).await
    }

    /// Close the session. Serial ports close on drop; TCP is shut down
    /// gracefully but a failure to do so is irrelevant at this point.
    pub async fn close(self) {
        if let Session::Tcp(mut stream) = self.session {
            use tokio::io::AsyncWriteExt;
            let _ = stream.shutdown().await;
        }
    }

    async fn transact<F: FunctionCode>(&mut self, function: F) -> Result<F::Output> {
        if !self.valid {
            return Err(Error::Transport(TransportError::ConnectionLost));
        }
        let transaction = TransactionInfo::new(self.unit_id);
        let timeout = self.timeout;
        let result = match &mut self.session {
            Session::Tcp(stream) => match drain_stale(stream).await {
                Ok(()) => {
                    let handler = tcp::TcpHandler::new(function);
                    match tokio::time::timeout(timeout, handler.handle(&transaction, stream)).await
                    {
                        Ok(x) => x,
                        Err(_) => Err(Error::protocol_timeout()),
                    }
                }
                Err(err) => Err(err),
            },
            Session::Rtu(stream) => match drain_stale(stream).await {
                Ok(()) => {
                    let handler = rtu::RtuHandler::new(function);
                    match tokio::time::timeout(timeout, handler.handle(&transaction, stream)).await
                    {
                        Ok(x) => x,
                        Err(_) => Err(Error::protocol_timeout()),
                    }
                }
                Err(err) => Err(err),
            },
        };
        if let Err(err) = &result {
            if err.poisons_session() {
                self.valid = false;
            }
        }
        result
    }
}

/// Discard bytes left over from an aborted earlier transaction so the next
/// response is parsed from a frame boundary.
async fn drain_stale<S: AsyncRead + Unpin>(stream: &mut S) -> Result<()> {
    loop {
        let mut buf = [0_u8; 128];
        match tokio::time::timeout(Duration::from_micros(100), stream.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(_)) => continue,
            Ok(Err(err)) => return Err(Error::transport(err)),
            Err(_) => break,
        }
    }
    Ok(())
}
