use daqsrv_protocol::{Error, ProtocolError, Result};

use super::FunctionCode;

fn invalid_request(msg: String) -> Error {
    Error::Protocol(ProtocolError::InvalidRequest(msg))
}

pub struct ReadU16Registers {
    function_code: u8,
    address: u16,
    cnt: u16,
}

impl ReadU16Registers {
    pub fn new(function_code: u8, address: u16, cnt: u16) -> Result<Self> {
        if cnt == 0 {
            return Err(invalid_request("Need to read at least 1 register.".to_string()));
        }
        if cnt > 125 {
            return Err(invalid_request(format!(
                "Trying to read too many registers: {}. Maximum 125.",
                cnt
            )));
        }
        Ok(Self {
            function_code,
            address,
            cnt,
        })
    }
}

impl FunctionCode for ReadU16Registers {
    type Output = Vec<u16>;

    fn format_request(&self, data: &mut Vec<u8>) {
        data.extend(&self.address.to_be_bytes());
        data.extend(&self.cnt.to_be_bytes());
    }

    fn get_header_length(&self) -> usize {
        1
    }

    fn get_data_length_from_header(&self, data: &[u8]) -> Result<usize> {
        let len = data[0] as usize;
        if len != 2 * self.cnt as usize {
            return Err(Error::Protocol(ProtocolError::UnexpectedResponse(format!(
                "byte count {} does not match {} requested registers",
                len, self.cnt
            ))));
        }
        Ok(len)
    }

    fn parse_frame(&self, data: &[u8]) -> Result<Self::Output> {
        let mut ret = Vec::with_capacity(self.cnt as usize);
        for x in data.chunks(2).take(self.cnt as usize) {
            ret.push(u16::from_be_bytes([x[0], x[1]]));
        }
        Ok(ret)
    }

    fn function_code(&self) -> u8 {
        self.function_code
    }
}

pub struct ReadBoolRegisters {
    function_code: u8,
    address: u16,
    cnt: u16,
}

impl ReadBoolRegisters {
    pub fn new(function_code: u8, address: u16, cnt: u16) -> Result<Self> {
        if cnt == 0 {
            return Err(invalid_request("Need to read at least 1 bit.".to_string()));
        }
        if cnt > 2000 {
            return Err(invalid_request(format!(
                "Trying to read too many bits: {}. Maximum 2000.",
                cnt
            )));
        }
        Ok(Self {
            function_code,
            address,
            cnt,
        })
    }

    fn expected_byte_count(&self) -> usize {
        ((self.cnt as usize - 1) / 8) + 1
    }
}

impl FunctionCode for ReadBoolRegisters {
    type Output = Vec<bool>;

    fn format_request(&self, data: &mut Vec<u8>) {
        data.extend(&self.address.to_be_bytes());
        data.extend(&self.cnt.to_be_bytes());
    }

    fn get_header_length(&self) -> usize {
        1
    }

    fn get_data_length_from_header(&self, data: &[u8]) -> Result<usize> {
        let len = data[0] as usize;
        if len != self.expected_byte_count() {
            return Err(Error::Protocol(ProtocolError::UnexpectedResponse(format!(
                "byte count {} does not match {} requested bits",
                len, self.cnt
            ))));
        }
        Ok(len)
    }

    fn parse_frame(&self, data: &[u8]) -> Result<Self::Output> {
        let mut ret = Vec::with_capacity(self.cnt as usize);
        'outer: for x in data {
            let mut x = *x;
            for _ in 0..8 {
                ret.push((x & 1) == 1);
                if ret.len() == self.cnt as usize {
                    break 'outer;
                }
                x >>= 1;
            }
        }
        Ok(ret)
    }

    fn function_code(&self) -> u8 {
        self.function_code
    }
}

pub struct WriteCoil {
    address: u16,
    value: bool,
}

impl WriteCoil {
    pub fn new(address: u16, value: bool) -> Self {
        Self { address, value }
    }
}

impl FunctionCode for WriteCoil {
    type Output = ();

    fn format_request(&self, data: &mut Vec<u8>) {
        data.extend(&self.address.to_be_bytes());
        let value: u16 = if self.value { 0xFF00 } else { 0x0000 };
        data.extend(&value.to_be_bytes());
    }

    fn get_header_length(&self) -> usize {
        4
    }

    fn get_data_length_from_header(&self, data: &[u8]) -> Result<usize> {
        // the reply echoes the request
        let addr = u16::from_be_bytes([data[0], data[1]]);
        let value = u16::from_be_bytes([data[2], data[3]]);
        let expected: u16 = if self.value { 0xFF00 } else { 0x0000 };
        if addr != self.address || value != expected {
            return Err(Error::Protocol(ProtocolError::UnexpectedResponse(
                "write coil echo does not match request".to_string(),
            )));
        }
        Ok(0)
    }

    fn parse_frame(&self, _data: &[u8]) -> Result<Self::Output> {
        Ok(())
    }

    fn function_code(&self) -> u8 {
        super::function_codes::WRITE_COIL
    }
}

pub struct WriteCoils<'a> {
    address: u16,
    data: &'a [bool],
}

impl<'a> WriteCoils<'a> {
    pub fn new(address: u16, data: &'a [bool]) -> Result<Self> {
        if data.is_empty() {
            return Err(invalid_request("Number of write coils must be > 0".to_string()));
        }
        if data.len() > 0x7B0 {
            return Err(invalid_request("Number of write coils must be <= 1968".to_string()));
        }
        Ok(Self { address, data })
    }
}

impl<'a> FunctionCode for WriteCoils<'a> {
    type Output = ();

    fn format_request(&self, data: &mut Vec<u8>) {
        data.extend(&self.address.to_be_bytes());
        data.extend(&(self.data.len() as u16).to_be_bytes());
        data.push(((self.data.len() - 1) / 8 + 1) as u8);
        for chunk in self.data.chunks(8) {
            let mut byte: u8 = 0;
            for (k, x) in chunk.iter().enumerate() {
                if *x {
                    byte |= 1 << k;
                }
            }
            data.push(byte);
        }
    }

    fn get_header_length(&self) -> usize {
        4
    }

    fn get_data_length_from_header(&self, data: &[u8]) -> Result<usize> {
        let starting_address = u16::from_be_bytes([data[0], data[1]]);
        let num_outputs = u16::from_be_bytes([data[2], data[3]]);
        if starting_address != self.address || num_outputs as usize != self.data.len() {
            return Err(Error::Protocol(ProtocolError::UnexpectedResponse(
                "write coils echo does not match request".to_string(),
            )));
        }
        Ok(0)
    }

    fn parse_frame(&self, _data: &[u8]) -> Result<Self::Output> {
        Ok(())
    }

    fn function_code(&self) -> u8 {
        super::function_codes::WRITE_MULTIPLE_COILS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_read_requests_are_range_checked() {
        assert!(ReadU16Registers::new(3, 0, 0).is_err());
        assert!(ReadU16Registers::new(3, 0, 126).is_err());
        assert!(ReadU16Registers::new(3, 0, 125).is_ok());
        assert!(ReadBoolRegisters::new(1, 0, 2001).is_err());
        assert!(ReadBoolRegisters::new(1, 0, 2000).is_ok());
        assert!(WriteCoils::new(0, &[]).is_err());
    }

    #[test]
    fn register_read_formats_request_body() {
        let read = ReadU16Registers::new(3, 100, 5).unwrap();
        let mut body = Vec::new();
        read.format_request(&mut body);
        assert_eq!(body, vec![0x00, 0x64, 0x00, 0x05]);
    }

    #[test]
    fn bool_parse_returns_requested_number_of_bits() {
        let read = ReadBoolRegisters::new(1, 0, 11).unwrap();
        assert_eq!(read.get_data_length_from_header(&[2]).unwrap(), 2);
        let bits = read.parse_frame(&[0b1010_0101, 0b0000_0110]).unwrap();
        assert_eq!(bits.len(), 11);
        assert_eq!(
            bits,
            vec![true, false, true, false, false, true, false, true, false, true, true]
        );
    }

    #[test]
    fn byte_count_mismatch_is_rejected() {
        let read = ReadU16Registers::new(3, 0, 5).unwrap();
        assert!(read.get_data_length_from_header(&[9]).is_err());
        assert_eq!(read.get_data_length_from_header(&[10]).unwrap(), 10);
    }

    #[test]
    fn write_coil_checks_the_echo() {
        let write = WriteCoil::new(7, true);
        let mut body = Vec::new();
        write.format_request(&mut body);
        assert_eq!(body, vec![0x00, 0x07, 0xFF, 0x00]);
        assert!(write.get_data_length_from_header(&[0x00, 0x07, 0xFF, 0x00]).is_ok());
        assert!(write.get_data_length_from_header(&[0x00, 0x07, 0x00, 0x00]).is_err());
    }

    #[test]
    fn write_coils_packs_bits_lsb_first() {
        let coils = [true, false, true, true, false, false, false, false, true];
        let write = WriteCoils::new(16, &coils).unwrap();
        let mut body = Vec::new();
        write.format_request(&mut body);
        assert_eq!(body, vec![0x00, 0x10, 0x00, 0x09, 2, 0b0000_1101, 0b0000_0001]);
    }
}
