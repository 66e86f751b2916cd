//! Modbus application PDUs shared by the RTU and TCP framings.

use super::FrameError;
use bytes::{Buf, BufMut, BytesMut};
use labdrive_core::{InstrError, InstrResult};

pub const READ_HOLDING_REGISTERS: u8 = 0x03;
pub const READ_INPUT_REGISTERS: u8 = 0x04;
pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Bit set in the function code of an exception response.
pub const EXCEPTION_FLAG: u8 = 0x80;

const MAX_READ_COUNT: u16 = 125;
const MAX_WRITE_COUNT: usize = 123;

/// Standard description of a Modbus exception code.
pub fn exception_description(code: u8) -> &'static str {
    match code {
        0x01 => "Illegal function",
        0x02 => "Illegal data address",
        0x03 => "Illegal data value",
        0x04 => "Server device failure",
        0x05 => "Acknowledge",
        0x06 => "Server device busy",
        0x08 => "Memory parity error",
        0x0A => "Gateway path unavailable",
        0x0B => "Gateway target device failed to respond",
        _ => "Unknown exception",
    }
}

/// One register request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request<'a> {
    ReadHolding { address: u16, count: u16 },
    ReadInput { address: u16, count: u16 },
    WriteSingle { address: u16, value: u16 },
    WriteMultiple { address: u16, values: &'a [u16] },
}

impl<'a> Request<'a> {
    /// Chooses 0x06 for one word and 0x10 otherwise.
    pub fn write(address: u16, values: &'a [u16]) -> Self {
        match values {
            [value] => Request::WriteSingle {
                address,
                value: *value,
            },
            _ => Request::WriteMultiple { address, values },
        }
    }

    pub fn function(&self) -> u8 {
        match self {
            Request::ReadHolding { .. } => READ_HOLDING_REGISTERS,
            Request::ReadInput { .. } => READ_INPUT_REGISTERS,
            Request::WriteSingle { .. } => WRITE_SINGLE_REGISTER,
            Request::WriteMultiple { .. } => WRITE_MULTIPLE_REGISTERS,
        }
    }

    /// Serialises the PDU, rejecting quantities the protocol cannot carry.
    pub fn encode(&self) -> InstrResult<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u8(self.function());
        match self {
            Request::ReadHolding { address, count } | Request::ReadInput { address, count } => {
                if *count == 0 || *count > MAX_READ_COUNT {
                    return Err(InstrError::domain(
                        "register count",
                        format!("{} is outside 1..={}", count, MAX_READ_COUNT),
                    ));
                }
                buf.put_u16(*address);
                buf.put_u16(*count);
            }
            Request::WriteSingle { address, value } => {
                buf.put_u16(*address);
                buf.put_u16(*value);
            }
            Request::WriteMultiple { address, values } => {
                if values.is_empty() || values.len() > MAX_WRITE_COUNT {
                    return Err(InstrError::domain(
                        "register count",
                        format!("{} is outside 1..={}", values.len(), MAX_WRITE_COUNT),
                    ));
                }
                buf.put_u16(*address);
                buf.put_u16(values.len() as u16);
                buf.put_u8((values.len() * 2) as u8);
                for value in values.iter() {
                    buf.put_u16(*value);
                }
            }
        }
        Ok(buf.to_vec())
    }

    /// Length in bytes of a normal (non-exception) response PDU.
    pub fn response_len(&self) -> usize {
        match self {
            Request::ReadHolding { count, .. } | Request::ReadInput { count, .. } => {
                2 + 2 * *count as usize
            }
            Request::WriteSingle { .. } | Request::WriteMultiple { .. } => 5,
        }
    }

    /// Validates a response PDU against this request and extracts register
    /// values (empty for writes).
    pub fn parse_response(&self, pdu: &[u8]) -> InstrResult<Vec<u16>> {
        let function = self.function();
        match pdu {
            [] => Err(FrameError::Truncated { expected: 1, got: 0 }.into()),
            [fc, code, ..] if *fc == function | EXCEPTION_FLAG => Err(InstrError::Remote {
                code: i32::from(*code),
                description: exception_description(*code).to_string(),
            }),
            [fc, ..] if *fc != function => Err(FrameError::FunctionMismatch {
                expected: function,
                got: *fc,
            }
            .into()),
            _ if pdu.len() < self.response_len() => Err(FrameError::Truncated {
                expected: self.response_len(),
                got: pdu.len(),
            }
            .into()),
            _ => self.parse_body(&pdu[1..]),
        }
    }

    fn parse_body(&self, mut body: &[u8]) -> InstrResult<Vec<u16>> {
        match self {
            Request::ReadHolding { count, .. } | Request::ReadInput { count, .. } => {
                let byte_count = body.get_u8() as usize;
                if byte_count != 2 * *count as usize || body.len() < byte_count {
                    return Err(InstrError::protocol(format!(
                        "byte count {} does not match {} registers",
                        byte_count, count
                    )));
                }
                Ok((0..*count).map(|_| body.get_u16()).collect())
            }
            Request::WriteSingle { address, value } => {
                let (echo_address, echo_value) = (body.get_u16(), body.get_u16());
                if (echo_address, echo_value) != (*address, *value) {
                    return Err(InstrError::protocol(format!(
                        "write echo {}={} does not match request {}={}",
                        echo_address, echo_value, address, value
                    )));
                }
                Ok(Vec::new())
            }
            Request::WriteMultiple { address, values } => {
                let (echo_address, echo_count) = (body.get_u16(), body.get_u16());
                if (echo_address, echo_count as usize) != (*address, values.len()) {
                    return Err(InstrError::protocol(format!(
                        "write echo {}+{} does not match request {}+{}",
                        echo_address,
                        echo_count,
                        address,
                        values.len()
                    )));
                }
                Ok(Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labdrive_core::ErrorKind;

    #[test]
    fn encode_requests() {
        let read = Request::ReadHolding {
            address: 0x006B,
            count: 3,
        };
        assert_eq!(read.encode().unwrap(), vec![0x03, 0x00, 0x6B, 0x00, 0x03]);

        let write = Request::write(1, &[0x000A, 0x0102]);
        assert_eq!(
            write.encode().unwrap(),
            vec![0x10, 0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02]
        );
        assert_eq!(Request::write(7, &[3]).function(), WRITE_SINGLE_REGISTER);
    }

    #[test]
    fn quantities_are_bounded() {
        let too_many = Request::ReadInput {
            address: 0,
            count: 126,
        };
        assert_eq!(too_many.encode().unwrap_err().kind(), ErrorKind::Domain);
        let values = [0u16; 124];
        assert!(Request::write(0, &values).encode().is_err());
    }

    #[test]
    fn parse_read_response() {
        let read = Request::ReadHolding {
            address: 0x006B,
            count: 3,
        };
        let pdu = [0x03, 0x06, 0x02, 0x2B, 0x00, 0x00, 0x00, 0x64];
        assert_eq!(read.parse_response(&pdu).unwrap(), vec![0x022B, 0, 0x64]);
        assert!(read.parse_response(&pdu[..5]).is_err());
    }

    #[test]
    fn exceptions_map_to_remote_errors() {
        let read = Request::ReadHolding {
            address: 0xFFFF,
            count: 1,
        };
        let err = read.parse_response(&[0x83, 0x02]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Remote);
        assert!(err.to_string().contains("Illegal data address"));
    }

    #[test]
    fn mismatched_function_is_protocol_error() {
        let read = Request::ReadInput {
            address: 0,
            count: 1,
        };
        let err = read.parse_response(&[0x03, 0x02, 0x00, 0x01]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn write_echo_is_checked() {
        let write = Request::write(4, &[0x0200]);
        assert!(write.parse_response(&[0x06, 0x00, 0x04, 0x02, 0x00]).is_ok());
        assert!(write.parse_response(&[0x06, 0x00, 0x05, 0x02, 0x00]).is_err());
    }
}
