use crate::modbus::{self, Codec, ModbusRTUCodec, ModbusTCPCodec, Request, Response};
use futures::{SinkExt as _, StreamExt as _};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_serial::SerialPortBuilderExt as _;
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Calling code attempted a register operation before `connect` (or after
    /// teardown). This is a sequencing bug in the caller, not a link failure,
    /// and is never retried.
    #[error("modbus link is not connected")]
    NotConnected,
    #[error("lookup of `{1}` failed")]
    LookupHost(#[source] std::io::Error, String),
    #[error("could not connect to `{1}` over TCP")]
    Connect(#[source] std::io::Error, String),
    #[error("could not open {1:?} for reading and writing")]
    OpenDevice(#[source] tokio_serial::Error, PathBuf),
    #[error("could not send out the request")]
    Send(#[source] std::io::Error),
    #[error("could not read data from the stream")]
    Receive(#[source] std::io::Error),
    #[error("connection was closed while a response was pending")]
    UnexpectedEof,
    #[error("did not receive a response within the configured timeout")]
    ResponseTimeout,
    #[error("controller responded with modbus exception code {0}")]
    Exception(u8),
    #[error("controller response does not match the request")]
    UnexpectedResponse,
}

impl Error {
    /// Failures of the underlying byte stream. These invalidate the link and,
    /// over TCP, make the next attempt eligible for a reconnect.
    fn is_link_failure(&self) -> bool {
        matches!(self, Error::Send(_) | Error::Receive(_) | Error::UnexpectedEof)
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum Parity {
    None,
    Odd,
    Even,
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        }
    }
}

#[derive(clap::Parser, Clone)]
#[group(id = "connection::Args")]
pub struct Args {
    #[clap(flatten)]
    how: ConnectionGroup,

    /// The modbus device ID of the climate controller.
    #[arg(long, short = 'i', default_value_t = 49)]
    pub device_id: u8,

    /// Consider a register operation failed if the response isn't received in
    /// this amount of time.
    #[arg(long, default_value = "1s")]
    pub timeout: humantime::Duration,

    /// Quiet period enforced between two consecutive register operations.
    ///
    /// The controller stops responding when frames follow each other too
    /// closely on the half-duplex bus. Defaults to 300ms over RTU and 100ms
    /// over TCP.
    #[arg(long)]
    pub frame_delay: Option<humantime::Duration>,

    /// The baudrate of the serial link.
    #[arg(long, default_value_t = 9600)]
    pub baudrate: u32,

    /// The parity of the serial link.
    #[arg(long, value_enum, default_value_t = Parity::Even)]
    pub parity: Parity,

    /// Data bits of the serial link.
    #[arg(long, default_value_t = 8, value_parser = clap::value_parser!(u8).range(5..=8))]
    pub data_bits: u8,

    /// Stop bits of the serial link.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..=2))]
    pub stop_bits: u8,

    /// How many times to attempt re-establishing a broken TCP connection
    /// before reporting the operation failed.
    #[arg(long, default_value_t = 3)]
    pub reconnect_attempts: u32,

    /// Initial delay before re-establishing a broken TCP connection.
    ///
    /// Doubles with every consecutive attempt up to `--reconnect-delay-max`.
    #[arg(long, default_value = "100ms")]
    pub reconnect_delay_min: humantime::Duration,

    /// Upper bound for the reconnection delay.
    #[arg(long, default_value = "10s")]
    pub reconnect_delay_max: humantime::Duration,
}

#[derive(clap::Parser, Clone)]
#[group(required = true)]
pub struct ConnectionGroup {
    /// Connect to the controller over Modbus TCP (`host:port`).
    #[arg(long)]
    tcp: Option<String>,
    /// Connect to the controller over serial Modbus RTU.
    ///
    /// Specify the path to the serial device.
    #[arg(long)]
    rtu: Option<PathBuf>,
}

impl Args {
    fn frame_delay(&self) -> Duration {
        match self.frame_delay {
            Some(delay) => *delay,
            None if self.how.rtu.is_some() => Duration::from_millis(300),
            None => Duration::from_millis(100),
        }
    }

    fn reconnect_delay(&self, attempt: u32) -> Duration {
        let delay = self.reconnect_delay_min.saturating_mul(2u32.saturating_pow(attempt));
        delay.min(*self.reconnect_delay_max)
    }
}

enum Link {
    Tcp(Framed<TcpStream, ModbusTCPCodec>),
    Rtu(Framed<tokio_serial::SerialStream, ModbusRTUCodec>),
}

struct State {
    link: Option<Link>,
    /// The earliest instant the next frame is allowed on the wire.
    next_slot: Instant,
}

/// A serialized modbus link to the climate controller.
///
/// Every register operation takes the single `state` lock for its whole
/// duration, so at most one request is in flight at any time regardless of
/// how many tasks share the connection. The inter-frame quiet period is also
/// taken inside the critical section so that callers cannot accidentally
/// interleave into it.
pub struct Connection {
    args: Args,
    state: tokio::sync::Mutex<State>,
    link_up: AtomicBool,
    transaction_id_generator: AtomicU16,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("link_up", &self.link_up.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn new(args: Args) -> Connection {
        Connection {
            args,
            state: tokio::sync::Mutex::new(State { link: None, next_slot: Instant::now() }),
            link_up: AtomicBool::new(false),
            transaction_id_generator: AtomicU16::new(0),
        }
    }

    pub async fn connect(&self) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        if state.link.is_none() {
            state.link = Some(self.establish().await?);
            self.link_up.store(true, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Drop the underlying link.
    ///
    /// Waits for the register operation in flight (if any) to finish first;
    /// must not be called from code that already holds an operation pending.
    pub async fn disconnect(&self) {
        let mut state = self.state.lock().await;
        self.link_up.store(false, Ordering::Relaxed);
        if state.link.take().is_some() {
            info!("disconnected");
        }
    }

    pub fn connected(&self) -> bool {
        self.link_up.load(Ordering::Relaxed)
    }

    /// Read `count` holding registers starting at `address`.
    pub async fn read(&self, address: u16, count: u16) -> Result<Vec<u16>, Error> {
        let mut state = self.state.lock().await;
        let response =
            self.roundtrip(&mut state, modbus::Operation::GetHoldings { address, count }).await?;
        match response.kind {
            modbus::ResponseKind::GetHoldings { values } if values.len() == usize::from(count) => {
                Ok(values)
            }
            _ => Err(Error::UnexpectedResponse),
        }
    }

    /// Write a single holding register.
    pub async fn write(&self, address: u16, value: u16) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        self.write_locked(&mut state, address, value).await
    }

    /// Read a register, apply `merge` to the fresh value and write the result
    /// back, all without releasing the operation lock.
    ///
    /// Packed registers (area state bits, fan/climate nibbles) must be
    /// modified this way: merging from a cached value would silently revert
    /// whatever the other field was changed to in the meantime. Holding the
    /// lock across both frames also keeps another local writer from slipping
    /// in between the read and the write.
    ///
    /// Returns the word that was written.
    pub async fn read_modify_write(
        &self,
        address: u16,
        merge: impl FnOnce(u16) -> u16,
    ) -> Result<u16, Error> {
        let mut state = self.state.lock().await;
        let response =
            self.roundtrip(&mut state, modbus::Operation::GetHoldings { address, count: 1 }).await?;
        let current = match response.kind {
            modbus::ResponseKind::GetHoldings { values } => {
                *values.first().ok_or(Error::UnexpectedResponse)?
            }
            _ => return Err(Error::UnexpectedResponse),
        };
        let merged = merge(current);
        self.write_locked(&mut state, address, merged).await?;
        Ok(merged)
    }

    async fn write_locked(
        &self,
        state: &mut State,
        address: u16,
        value: u16,
    ) -> Result<(), Error> {
        let response =
            self.roundtrip(state, modbus::Operation::SetHolding { address, value }).await?;
        match response.kind {
            modbus::ResponseKind::SetHolding { address: echo_address, value: echo_value }
                if echo_address == address && echo_value == value =>
            {
                Ok(())
            }
            _ => Err(Error::UnexpectedResponse),
        }
    }

    async fn roundtrip(
        &self,
        state: &mut State,
        operation: modbus::Operation,
    ) -> Result<Response, Error> {
        if state.link.is_none() {
            return Err(Error::NotConnected);
        }
        tokio::time::sleep_until(state.next_slot).await;
        let mut reconnects = 0;
        loop {
            let link = state.link.as_mut().ok_or(Error::NotConnected)?;
            let request = Request {
                device_id: self.args.device_id,
                transaction_id: self.new_transaction_id(),
                operation,
            };
            let result = match link {
                Link::Tcp(io) => self.exchange(io, &request, true).await,
                Link::Rtu(io) => self.exchange(io, &request, false).await,
            };
            state.next_slot = Instant::now() + self.args.frame_delay();
            match result {
                Ok(response) => return Ok(response),
                Err(error) if error.is_link_failure() => {
                    state.link = None;
                    self.link_up.store(false, Ordering::Relaxed);
                    let can_reconnect =
                        self.args.how.tcp.is_some() && reconnects < self.args.reconnect_attempts;
                    if !can_reconnect {
                        return Err(error);
                    }
                    let delay = self.args.reconnect_delay(reconnects);
                    warn!(
                        message = "link failure, will reconnect",
                        error = (&error as &dyn std::error::Error),
                        ?delay,
                    );
                    reconnects += 1;
                    tokio::time::sleep(delay).await;
                    match self.establish().await {
                        Ok(link) => {
                            state.link = Some(link);
                            self.link_up.store(true, Ordering::Relaxed);
                        }
                        Err(error) => {
                            debug!(
                                message = "reconnection attempt failed",
                                error = (&error as &dyn std::error::Error),
                            );
                        }
                    }
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn exchange<T>(
        &self,
        io: &mut Framed<T, impl Codec>,
        request: &Request,
        check_transaction: bool,
    ) -> Result<Response, Error>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let deadline = Instant::now() + *self.args.timeout;
        tokio::time::timeout_at(deadline, io.send(request))
            .await
            .map_err(|_| Error::ResponseTimeout)?
            .map_err(Error::Send)?;
        loop {
            let frame = tokio::time::timeout_at(deadline, io.next())
                .await
                .map_err(|_| Error::ResponseTimeout)?;
            let response = frame.ok_or(Error::UnexpectedEof)?.map_err(Error::Receive)?;
            if response.device_id != request.device_id {
                debug!(
                    message = "response for another device, ignoring",
                    device_id = response.device_id
                );
                continue;
            }
            if check_transaction && response.transaction_id != request.transaction_id {
                debug!(
                    message = "stale response, ignoring",
                    transaction = response.transaction_id
                );
                continue;
            }
            trace!(message = "response", transaction = response.transaction_id);
            if let Some(code) = response.exception_code() {
                return Err(Error::Exception(code));
            }
            return Ok(response);
        }
    }

    async fn establish(&self) -> Result<Link, Error> {
        if let Some(address) = &self.args.how.tcp {
            info!(message = "connecting...", address);
            let addresses = tokio::net::lookup_host(address)
                .await
                .map_err(|e| Error::LookupHost(e, address.to_string()))?
                .collect::<Vec<_>>();
            debug!(message = "resolved", ?addresses);
            let socket = tokio::time::timeout(*self.args.timeout, TcpStream::connect(&*addresses))
                .await
                .map_err(|_| Error::Connect(std::io::ErrorKind::TimedOut.into(), address.to_string()))?
                .map_err(|e| Error::Connect(e, address.to_string()))?;
            let nodelay_result = socket.set_nodelay(true);
            trace!(message = "setting nodelay", is_error = ?nodelay_result.err());
            info!(message = "connected");
            Ok(Link::Tcp(Framed::new(socket, ModbusTCPCodec {})))
        } else if let Some(path) = &self.args.how.rtu {
            info!(message = "opening serial device...", path = ?path);
            let stop_bits = match self.args.stop_bits {
                2 => tokio_serial::StopBits::Two,
                _ => tokio_serial::StopBits::One,
            };
            let data_bits = match self.args.data_bits {
                5 => tokio_serial::DataBits::Five,
                6 => tokio_serial::DataBits::Six,
                7 => tokio_serial::DataBits::Seven,
                _ => tokio_serial::DataBits::Eight,
            };
            let stream = tokio_serial::new(path.to_string_lossy(), self.args.baudrate)
                .parity(self.args.parity.into())
                .data_bits(data_bits)
                .stop_bits(stop_bits)
                .timeout(*self.args.timeout)
                .open_native_async()
                .map_err(|e| Error::OpenDevice(e, path.clone()))?;
            info!(message = "opened");
            Ok(Link::Rtu(Framed::new(stream, ModbusRTUCodec {})))
        } else {
            unreachable!("clap requires one of `--tcp` and `--rtu`");
        }
    }

    fn new_transaction_id(&self) -> u16 {
        self.transaction_id_generator.fetch_add(1, Ordering::Relaxed)
    }
}
