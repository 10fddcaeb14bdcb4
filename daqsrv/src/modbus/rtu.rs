use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use daqsrv_protocol::{Error, ModbusException, ProtocolError, Result};

use super::{FunctionCode, TransactionInfo};

pub struct RtuHandler<T: FunctionCode> {
    function_code: T,
}

impl<T: FunctionCode> RtuHandler<T> {
    pub fn new(function_code: T) -> Self {
        Self { function_code }
    }

    pub async fn handle<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        transaction: &TransactionInfo,
        stream: &mut S,
    ) -> Result<T::Output> {
        let mut request = Vec::new();
        request.extend(&[transaction.unit_id, self.function_code.function_code()]);
        self.function_code.format_request(&mut request);
        if request.len() + 2 > 256 {
            return Err(Error::Protocol(ProtocolError::InvalidRequest(
                "RTU frame over length".to_string(),
            )));
        }
        request.extend(&crc(&request).to_le_bytes());
        stream.write_all(&request).await.map_err(Error::transport)?;

        let mut header = [0_u8; 2];
        stream.read_exact(&mut header).await.map_err(Error::transport)?;
        let unit_id = header[0];
        let parsed_function_code = header[1];
        if unit_id != transaction.unit_id {
            return Err(Error::Protocol(ProtocolError::UnexpectedResponse(format!(
                "answer from unit {} instead of {}",
                unit_id, transaction.unit_id
            ))));
        }
        if parsed_function_code == (0x80 | self.function_code.function_code()) {
            // exception frame: unit, fc | 0x80, code, crc
            let mut rest = [0_u8; 3];
            stream.read_exact(&mut rest).await.map_err(Error::transport)?;
            let frame = [header[0], header[1], rest[0], rest[1], rest[2]];
            if crc(&frame) != 0 {
                return Err(Error::Protocol(ProtocolError::Crc));
            }
            return Err(Error::protocol(ModbusException::from_code(rest[0])));
        } else if parsed_function_code != self.function_code.function_code() {
            return Err(Error::Protocol(ProtocolError::UnexpectedResponse(format!(
                "unexpected function code {:#x}",
                parsed_function_code
            ))));
        }
        let fun_header_len = self.function_code.get_header_length();
        let mut fun_header = vec![0_u8; fun_header_len];
        stream.read_exact(&mut fun_header).await.map_err(Error::transport)?;
        let data_len = self.function_code.get_data_length_from_header(&fun_header)?;
        let mut frame = vec![0_u8; 2 + fun_header_len + data_len + 2];
        frame[0..2].copy_from_slice(&header);
        frame[2..2 + fun_header_len].copy_from_slice(&fun_header);
        stream
            .read_exact(&mut frame[2 + fun_header_len..])
            .await
            .map_err(Error::transport)?;
        if crc(&frame) != 0 {
            return Err(Error::Protocol(ProtocolError::Crc));
        }
        self.function_code
            .parse_frame(&frame[2 + fun_header_len..frame.len() - 2])
    }
}

/// CRC-16/MODBUS. Appending the little-endian CRC to a frame makes the CRC
/// over the whole buffer zero, which is how received frames are checked.
pub fn crc(data: &[u8]) -> u16 {
    let mut crc = 0xFFFF_u16;
    for x in data {
        crc ^= *x as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}
