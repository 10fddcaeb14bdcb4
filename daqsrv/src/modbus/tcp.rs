use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use daqsrv_protocol::{Error, ModbusException, ProtocolError, Result};

use super::{FunctionCode, TransactionInfo};

pub struct TcpHandler<T: FunctionCode> {
    function_code: T,
}

impl<T: FunctionCode> TcpHandler<T> {
    pub fn new(function_code: T) -> Self {
        Self { function_code }
    }

    pub async fn handle<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        transaction: &TransactionInfo,
        stream: &mut S,
    ) -> Result<T::Output> {
        let mut request = Vec::new();
        request.extend(&transaction.transaction_id.to_be_bytes());
        request.extend(&[0_u8, 0, 0, 0]);
        request.extend(&[transaction.unit_id, self.function_code.function_code()]);
        self.function_code.format_request(&mut request);
        let l = request.len() - 6;
        if l > u16::MAX as usize {
            return Err(Error::Protocol(ProtocolError::InvalidRequest(
                "Modbus frame over length".to_string(),
            )));
        }
        let len_buf = (l as u16).to_be_bytes();
        request[4] = len_buf[0];
        request[5] = len_buf[1];
        stream.write_all(&request).await.map_err(Error::transport)?;

        let reply = read_mbap_frame(transaction, self.function_code.function_code(), stream).await?;
        let header_len = self.function_code.get_header_length();
        if reply.len() < header_len {
            return Err(Error::Protocol(ProtocolError::UnexpectedResponse(
                "frame shorter than function header".to_string(),
            )));
        }
        let data_len = self.function_code.get_data_length_from_header(&reply[0..header_len])?;
        if reply.len() - header_len < data_len {
            return Err(Error::Protocol(ProtocolError::UnexpectedResponse(
                "frame data part shorter than expected".to_string(),
            )));
        }
        self.function_code.parse_frame(&reply[header_len..header_len + data_len])
    }
}

/// Read one MBAP-framed response and return the bytes after unit id and
/// function code. Exception responses are surfaced here.
async fn read_mbap_frame<S: AsyncRead + Unpin>(
    transaction: &TransactionInfo,
    function_code: u8,
    stream: &mut S,
) -> Result<Vec<u8>> {
    let mut header = [0_u8; 8];
    stream.read_exact(&mut header).await.map_err(Error::transport)?;
    let transaction_id = u16::from_be_bytes([header[0], header[1]]);
    let protocol_id = u16::from_be_bytes([header[2], header[3]]);
    let len = u16::from_be_bytes([header[4], header[5]]);
    let unit_id = header[6];
    let parsed_function_code = header[7];
    if transaction_id != transaction.transaction_id
        || protocol_id != 0
        || unit_id != transaction.unit_id
        || len < 2
    {
        return Err(Error::Protocol(ProtocolError::UnexpectedResponse(
            "invalid MBAP header".to_string(),
        )));
    }
    if parsed_function_code == (0x80 | function_code) {
        let exception_code = stream.read_u8().await.map_err(Error::transport)?;
        return Err(Error::protocol(ModbusException::from_code(exception_code)));
    } else if parsed_function_code != function_code {
        return Err(Error::Protocol(ProtocolError::UnexpectedResponse(format!(
            "unexpected function code {:#x}",
            parsed_function_code
        ))));
    }
    let mut buf = vec![0_u8; (len - 2) as usize];
    stream.read_exact(&mut buf).await.map_err(Error::transport)?;
    Ok(buf)
}
