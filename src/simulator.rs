use crate::modbus::{FUNCTION_READ_HOLDINGS, FUNCTION_WRITE_SINGLE};
use crate::registers;
use futures::{SinkExt as _, StreamExt as _};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::bytes::Buf;
use tokio_util::codec::{Decoder, Encoder, Framed};
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info, trace, warn};

/// The whole addressable register space of the simulated controller.
pub type Bank = [u16; registers::REGISTER_SPACE_LEN as usize];

pub const EXCEPTION_ILLEGAL_FUNCTION: u8 = 1;
pub const EXCEPTION_ILLEGAL_DATA_ADDRESS: u8 = 2;
pub const EXCEPTION_ILLEGAL_DATA_VALUE: u8 = 3;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not bind the simulator to `{1}`")]
    Bind(#[source] std::io::Error, String),
    #[error("could not determine the address the simulator is listening on")]
    LocalAddr(#[source] std::io::Error),
}

/// A register-bank Modbus TCP server behaving like a Koolnova controller.
///
/// Supports exactly the two function codes the real unit does: Read Holding
/// Registers and Write Single Register. Everything else earns an
/// illegal-function exception. The protocol layer's conformance tests run
/// against this.
pub struct Simulator {
    bank: Arc<Mutex<Bank>>,
    local_addr: SocketAddr,
    #[allow(unused)] // exists for its drop handler
    accept_task: AbortOnDropHandle<()>,
}

impl Simulator {
    pub async fn bind(address: &str, device_id: u8, bank: Bank) -> Result<Simulator, Error> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| Error::Bind(e, address.to_string()))?;
        let local_addr = listener.local_addr().map_err(Error::LocalAddr)?;
        let bank = Arc::new(Mutex::new(bank));
        let accept_bank = Arc::clone(&bank);
        let accept_task = tokio::spawn(async move {
            loop {
                let (socket, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        warn!(
                            message = "could not accept a connection",
                            error = &error as &dyn std::error::Error,
                        );
                        continue;
                    }
                };
                debug!(message = "accepted a connection", ?peer);
                tokio::spawn(serve(socket, device_id, Arc::clone(&accept_bank)));
            }
        });
        info!(message = "simulator listening", address = %local_addr);
        Ok(Simulator { bank, local_addr, accept_task: AbortOnDropHandle::new(accept_task) })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Direct access to the backing registers, for priming scenarios and for
    /// asserting on what a write actually stored.
    pub fn bank(&self) -> Arc<Mutex<Bank>> {
        Arc::clone(&self.bank)
    }
}

/// A plausible controller state for interactive use of the `simulate`
/// command: four registered areas (two of them running), all engines on
/// automatic flow.
pub fn demo_bank() -> Bank {
    let mut bank = [0; registers::REGISTER_SPACE_LEN as usize];
    for id in registers::AreaId::all().take(4) {
        let enabled = id.get() <= 2;
        bank[id.state_register() as usize] =
            registers::AREA_REGISTERED_BIT | u16::from(enabled);
        bank[id.modes_register() as usize] =
            (registers::FanMode::Low as u16) << 4 | registers::ClimMode::Hot as u16;
        bank[id.order_temp_register() as usize] = registers::encode_temperature(21.0);
        bank[id.real_temp_register() as usize] = registers::encode_temperature(19.5);
    }
    for id in registers::EngineId::all() {
        bank[id.throughput_register() as usize] = 8;
        bank[id.order_temp_register() as usize] = registers::encode_temperature(25.0);
        bank[id.flow_state_register() as usize] = registers::FlowState::Auto as u16;
    }
    bank[registers::REG_MODBUS_ADDRESS as usize] = 49;
    bank[registers::REG_EFFICIENCY as usize] = registers::Efficiency::Med as u16;
    bank[registers::REG_SYS_STATE as usize] = registers::SysState::On as u16;
    bank[registers::REG_GLOBAL_MODE as usize] = registers::GlobalMode::Cold as u16;
    bank
}

async fn serve(socket: TcpStream, device_id: u8, bank: Arc<Mutex<Bank>>) {
    let mut framed = Framed::new(socket, ServerCodec {});
    loop {
        let request = match framed.next().await {
            None => return,
            Some(Err(error)) => {
                warn!(
                    message = "could not read a request frame",
                    error = &error as &dyn std::error::Error,
                );
                return;
            }
            Some(Ok(request)) => request,
        };
        if request.device_id != device_id {
            debug!(message = "request for another device", device_id = request.device_id);
            continue;
        }
        let reply = respond(&request, &bank);
        if let Err(error) = framed.send(reply).await {
            warn!(
                message = "could not send a response frame",
                error = &error as &dyn std::error::Error,
            );
            return;
        }
    }
}

fn respond(request: &Incoming, bank: &Mutex<Bank>) -> Outgoing {
    let bank_len = registers::REGISTER_SPACE_LEN;
    let exception = |code| Outgoing::Exception {
        transaction_id: request.transaction_id,
        device_id: request.device_id,
        function: request.function,
        code,
    };
    match request.function {
        FUNCTION_READ_HOLDINGS => {
            let (address, count) = (request.address, request.value);
            if count == 0 || count > 125 {
                return exception(EXCEPTION_ILLEGAL_DATA_VALUE);
            }
            let Some(end) = address.checked_add(count).filter(|end| *end <= bank_len) else {
                return exception(EXCEPTION_ILLEGAL_DATA_ADDRESS);
            };
            let bank = bank.lock().unwrap_or_else(|e| e.into_inner());
            let values = bank[usize::from(address)..usize::from(end)].to_vec();
            Outgoing::Holdings {
                transaction_id: request.transaction_id,
                device_id: request.device_id,
                values,
            }
        }
        FUNCTION_WRITE_SINGLE => {
            let (address, value) = (request.address, request.value);
            if address >= bank_len {
                return exception(EXCEPTION_ILLEGAL_DATA_ADDRESS);
            }
            let mut bank = bank.lock().unwrap_or_else(|e| e.into_inner());
            bank[usize::from(address)] = value;
            Outgoing::Echo {
                transaction_id: request.transaction_id,
                device_id: request.device_id,
                address,
                value,
            }
        }
        _ => exception(EXCEPTION_ILLEGAL_FUNCTION),
    }
}

/// A request as seen from the server side.
///
/// `value` carries the register count for reads and the register value for
/// writes. Unsupported functions decode with both fields zeroed; they only
/// exist to be answered with an exception.
struct Incoming {
    transaction_id: u16,
    device_id: u8,
    function: u8,
    address: u16,
    value: u16,
}

enum Outgoing {
    Holdings { transaction_id: u16, device_id: u8, values: Vec<u16> },
    Echo { transaction_id: u16, device_id: u8, address: u16, value: u16 },
    Exception { transaction_id: u16, device_id: u8, function: u8, code: u8 },
}

struct ServerCodec {}

impl Decoder for ServerCodec {
    type Item = Incoming;
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
            if u16::from_be_bytes(*proto_buffer) != 0 {
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
            let request = match *data {
                [device_id, function @ (FUNCTION_READ_HOLDINGS | FUNCTION_WRITE_SINGLE), a, b, c, d] => {
                    Incoming {
                        transaction_id,
                        device_id,
                        function,
                        address: u16::from_be_bytes([a, b]),
                        value: u16::from_be_bytes([c, d]),
                    }
                }
                [device_id, function, ..] => {
                    Incoming { transaction_id, device_id, function, address: 0, value: 0 }
                }
                [] | [_] => {
                    src.advance(1);
                    continue;
                }
            };
            src.advance(usize::from(required_length) + 6);
            return Ok(Some(request));
        }
    }
}

impl Encoder<Outgoing> for ServerCodec {
    type Error = std::io::Error;
    fn encode(
        &mut self,
        reply: Outgoing,
        dst: &mut tokio_util::bytes::BytesMut,
    ) -> Result<(), Self::Error> {
        match reply {
            Outgoing::Holdings { transaction_id, device_id, values } => {
                let byte_count = values.len() * 2;
                dst.extend(transaction_id.to_be_bytes());
                dst.extend(&[0, 0]);
                dst.extend((3 + byte_count as u16).to_be_bytes());
                dst.extend(&[device_id, FUNCTION_READ_HOLDINGS, byte_count as u8]);
                for value in values {
                    dst.extend(value.to_be_bytes());
                }
            }
            Outgoing::Echo { transaction_id, device_id, address, value } => {
                dst.extend(transaction_id.to_be_bytes());
                dst.extend(&[0, 0, 0, 6, device_id, FUNCTION_WRITE_SINGLE]);
                dst.extend(address.to_be_bytes());
                dst.extend(value.to_be_bytes());
            }
            Outgoing::Exception { transaction_id, device_id, function, code } => {
                dst.extend(transaction_id.to_be_bytes());
                dst.extend(&[0, 0, 0, 3, device_id, function | 0x80, code]);
            }
        }
        trace!(message="sending encoded", buffer=?dst);
        Ok(())
    }
}
