use tokio_util::bytes::Buf;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// Both supported function codes operate on holding registers.
pub const FUNCTION_READ_HOLDINGS: u8 = 3;
pub const FUNCTION_WRITE_SINGLE: u8 = 6;

#[derive(Debug, Clone, Copy)]
pub struct Request {
    pub device_id: u8,
    pub transaction_id: u16,
    pub operation: Operation,
}

#[derive(Debug, Clone, Copy)]
pub enum Operation {
    GetHoldings { address: u16, count: u16 },
    SetHolding { address: u16, value: u16 },
}

#[derive(Debug, Clone)]
pub struct Response {
    pub device_id: u8,
    /// Always 0 for RTU, where the wire carries no transaction identifier.
    pub transaction_id: u16,
    pub kind: ResponseKind,
}

impl Response {
    pub fn exception_code(&self) -> Option<u8> {
        match &self.kind {
            ResponseKind::ErrorCode(c) => Some(*c),
            ResponseKind::GetHoldings { .. } => None,
            ResponseKind::SetHolding { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ResponseKind {
    ErrorCode(u8),
    GetHoldings { values: Vec<u16> },
    SetHolding { address: u16, value: u16 },
}

pub trait Codec:
    for<'a> Encoder<&'a Request, Error = std::io::Error>
    + Decoder<Item = Response, Error = std::io::Error>
    + Send
{
}

pub struct ModbusTCPCodec {}

impl Encoder<&Request> for ModbusTCPCodec {
    type Error = std::io::Error;
    fn encode(
        &mut self,
        req: &Request,
        dst: &mut tokio_util::bytes::BytesMut,
    ) -> Result<(), Self::Error> {
        match req.operation {
            Operation::GetHoldings { address, count } => {
                dst.extend(req.transaction_id.to_be_bytes());
                dst.extend(&[0, 0, 0, 6, req.device_id, FUNCTION_READ_HOLDINGS]);
                dst.extend(address.to_be_bytes());
                dst.extend(count.to_be_bytes());
            }
            Operation::SetHolding { address, value } => {
                dst.extend(req.transaction_id.to_be_bytes());
                dst.extend(&[0, 0, 0, 6, req.device_id, FUNCTION_WRITE_SINGLE]);
                dst.extend(address.to_be_bytes());
                dst.extend(value.to_be_bytes());
            }
        };
        trace!(message="sending encoded", buffer=?dst);
        Ok(())
    }
}

impl Decoder for ModbusTCPCodec {
    type Item = Response;
    type Error = std::io::Error;
    fn decode(
        &mut self,
        src: &mut tokio_util::bytes::BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            trace!(message="attempt at decoding", buffer=?src);
            if src.len() < 8 {
                return Ok(None);
            }
            let Some((tr_id_buffer, remainder)) = src.split_first_chunk::<2>() else {
                return Ok(None);
            };
            let transaction_id = u16::from_be_bytes(*tr_id_buffer);
            let Some((proto_buffer, remainder)) = remainder.split_first_chunk::<2>() else {
                return Ok(None);
            };
            let proto = u16::from_be_bytes(*proto_buffer);
            if proto != 0 {
                src.advance(1);
                continue;
            }
            let Some((length_buffer, remainder)) = remainder.split_first_chunk::<2>() else {
                return Ok(None);
            };
            let required_length = u16::from_be_bytes(*length_buffer);
            let Some((data, _)) = remainder.split_at_checked(required_length.into()) else {
                return Ok(None);
            };
            let [device_id, function_code, code, ..] = data else {
                src.advance(1);
                continue;
            };
            let (device_id, function_code, code) = (*device_id, *function_code, *code);
            if function_code > 0x80 {
                src.advance(6 + 3);
                return Ok(Some(Response {
                    transaction_id,
                    device_id,
                    kind: ResponseKind::ErrorCode(code),
                }));
            }
            let kind = match function_code {
                FUNCTION_READ_HOLDINGS => {
                    let [_, _, _, payload @ ..] = data else { unreachable!() };
                    let values = payload
                        .chunks_exact(2)
                        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                        .collect();
                    ResponseKind::GetHoldings { values }
                }
                FUNCTION_WRITE_SINGLE => {
                    let [_, _, a, b, c, d] = data else {
                        src.advance(1);
                        continue;
                    };
                    ResponseKind::SetHolding {
                        address: u16::from_be_bytes([*a, *b]),
                        value: u16::from_be_bytes([*c, *d]),
                    }
                }
                _ => {
                    src.advance(1);
                    continue;
                }
            };
            src.advance(usize::from(required_length) + 6);
            return Ok(Some(Response { transaction_id, device_id, kind }));
        }
    }
}

impl Codec for ModbusTCPCodec {}

fn rtu_crc(frame: &[u8]) -> [u8; 2] {
    crc16::State::<crc16::MODBUS>::calculate(frame).to_le_bytes()
}

pub struct ModbusRTUCodec {}

impl Encoder<&Request> for ModbusRTUCodec {
    type Error = std::io::Error;
    fn encode(
        &mut self,
        req: &Request,
        dst: &mut tokio_util::bytes::BytesMut,
    ) -> Result<(), Self::Error> {
        let start = dst.len();
        match req.operation {
            Operation::GetHoldings { address, count } => {
                dst.extend(&[req.device_id, FUNCTION_READ_HOLDINGS]);
                dst.extend(address.to_be_bytes());
                dst.extend(count.to_be_bytes());
            }
            Operation::SetHolding { address, value } => {
                dst.extend(&[req.device_id, FUNCTION_WRITE_SINGLE]);
                dst.extend(address.to_be_bytes());
                dst.extend(value.to_be_bytes());
            }
        }
        let crc = rtu_crc(&dst[start..]);
        dst.extend(crc);
        trace!(message="sending encoded", buffer=?dst);
        Ok(())
    }
}

impl Decoder for ModbusRTUCodec {
    type Item = Response;
    type Error = std::io::Error;
    fn decode(
        &mut self,
        src: &mut tokio_util::bytes::BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            trace!(message="attempt at decoding", buffer=?src);
            let [device_id, function_code, ..] = **src else {
                return Ok(None);
            };
            // RTU frames carry no length prefix, so the length is implied by
            // the function code (and, for reads, the byte-count field).
            let frame_length = if function_code > 0x80 {
                5
            } else if function_code == FUNCTION_READ_HOLDINGS {
                let Some(byte_count) = src.get(2) else {
                    return Ok(None);
                };
                3 + usize::from(*byte_count) + 2
            } else if function_code == FUNCTION_WRITE_SINGLE {
                8
            } else {
                // Not something we ever request. Resynchronize.
                src.advance(1);
                continue;
            };
            let Some(frame) = src.get(..frame_length) else {
                return Ok(None);
            };
            let (payload, crc) = frame.split_at(frame_length - 2);
            if rtu_crc(payload)[..] != *crc {
                trace!(message = "crc mismatch, resynchronizing", buffer = ?src);
                src.advance(1);
                continue;
            }
            let kind = if function_code > 0x80 {
                ResponseKind::ErrorCode(payload[2])
            } else if function_code == FUNCTION_READ_HOLDINGS {
                let values = payload[3..]
                    .chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .collect();
                ResponseKind::GetHoldings { values }
            } else {
                ResponseKind::SetHolding {
                    address: u16::from_be_bytes([payload[2], payload[3]]),
                    value: u16::from_be_bytes([payload[4], payload[5]]),
                }
            };
            src.advance(frame_length);
            return Ok(Some(Response { device_id, transaction_id: 0, kind }));
        }
    }
}

impl Codec for ModbusRTUCodec {}
