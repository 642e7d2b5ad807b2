//! S-Bus master side: one request telegram out, one response telegram back.
//!
//! [`SBusClient`] works on anything implementing `Read + Write`. For a real
//! station use [`SBusClient::connect`], which opens a TCP connection with
//! read, write and connect deadlines.
//!
//! ```no_run
//! use sbus_probe::client::SBusClient;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = SBusClient::connect("192.168.0.10", 5050, Duration::from_secs(5), 1.into())?;
//! let value = client.request(6, 100, None)?; // read register R 100
//! println!("R 100 = {}", value);
//! client.request(11, 10, Some(1))?; // set flag F 10
//! # Ok(()) }
//! ```

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use log::{debug, info};
use snafu::{OptionExt, ResultExt, Snafu};

use crate::buffer::Buffer;
use crate::codec;
use crate::telegram::{self, build_request, frame_length, parse_response, Telegram};
use crate::types::{Attribute, CommandCode, DataAddress, Sequence, Station};

/// Sockets reject a zero deadline, and no deadline at all could block forever.
pub const MIN_TIMEOUT: Duration = Duration::from_millis(1);

/// Failure of the connection itself, classified at the socket boundary.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum TransportError {
    #[snafu(display("Could not resolve host {}", host))]
    Resolve { host: String },
    #[snafu(display("Connection refused"))]
    Refused,
    #[snafu(display("Timed out waiting for the station"))]
    TimedOut,
    #[snafu(display("Connection closed"))]
    Closed,
    #[snafu(display("Not connected"))]
    NotConnected,
    #[snafu(display("I/O error: {}", source))]
    Io { source: io::Error },
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        use io::ErrorKind::*;
        match err.kind() {
            ConnectionRefused => TransportError::Refused,
            TimedOut | WouldBlock => TransportError::TimedOut,
            UnexpectedEof | ConnectionReset | ConnectionAborted | BrokenPipe | NotConnected => {
                TransportError::Closed
            }
            _ => TransportError::Io { source: err },
        }
    }
}

/// Broad category of a failed request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// Rejected locally, nothing was sent.
    Rejected,
    /// The response was malformed or unexpected.
    Protocol,
    /// The station answered with a NAK.
    Device,
    /// The connection failed.
    Transport,
}

/// A failed request. The display strings are the messages shown to the user.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum RequestError {
    #[snafu(display("Unsupported command code."))]
    UnsupportedCommand,
    #[snafu(display("Invalid address."))]
    InvalidAddress,
    #[snafu(display("Invalid data."))]
    InvalidData,
    #[snafu(display("Invalid parameter."))]
    InvalidParameter { source: telegram::Error },
    #[snafu(display("Invalid response length."))]
    ResponseLength { source: telegram::Error },
    #[snafu(display("CRC error."))]
    Crc { source: telegram::Error },
    #[snafu(display("Device error."))]
    Device { code: i16 },
    #[snafu(display("Bad response message."))]
    BadResponse { reason: &'static str },
    #[snafu(display("Could not establish contact with remote host."))]
    Transport { source: TransportError },
}

impl RequestError {
    pub fn kind(&self) -> FailureKind {
        use RequestError::*;
        match self {
            UnsupportedCommand | InvalidAddress | InvalidData | InvalidParameter { .. } => {
                FailureKind::Rejected
            }
            ResponseLength { .. } | Crc { .. } | BadResponse { .. } => FailureKind::Protocol,
            Device { .. } => FailureKind::Device,
            Transport { .. } => FailureKind::Transport,
        }
    }
}

impl From<TransportError> for RequestError {
    fn from(source: TransportError) -> Self {
        RequestError::Transport { source }
    }
}

/// A successful request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Reply {
    /// State of a flag, input or output.
    Bit(bool),
    /// Register contents.
    Register(i32),
    /// The station acknowledged a write.
    Written,
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Bit(bit) => write!(f, "{}", *bit as u8),
            Reply::Register(value) => write!(f, "{}", value),
            Reply::Written => Ok(()),
        }
    }
}

/// S-Bus client talking to a single station over `IO`.
///
/// Only one request can be outstanding at a time, which `&mut self`
/// enforces.
pub struct SBusClient<IO> {
    io: IO,
    station: Station,
    sequence: Sequence,
    buffer: Buffer,
}

impl SBusClient<TcpStream> {
    /// Open a TCP connection to the station at `host:port`.
    ///
    /// `timeout` is used for connecting and as the deadline of every
    /// read and write afterwards.
    pub fn connect(
        host: &str,
        port: u16,
        timeout: Duration,
        station: Station,
    ) -> Result<Self, TransportError> {
        let timeout = timeout.max(MIN_TIMEOUT);
        let addrs = (host, port)
            .to_socket_addrs()
            .ok()
            .context(ResolveSnafu { host })?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(timeout))?;
                    stream.set_write_timeout(Some(timeout))?;
                    stream.set_nodelay(true)?;
                    info!("Connected to S-Bus station {} at {}", station, addr);
                    return Ok(Self::new(stream, station));
                }
                Err(err) => {
                    debug!("Connecting to {} failed: {}", addr, err);
                    last_err = Some(err);
                }
            }
        }
        Err(match last_err {
            Some(err) => err.into(),
            None => TransportError::Resolve { host: host.into() },
        })
    }
}

impl<IO> SBusClient<IO>
where
    IO: Read + Write,
{
    pub fn new(io: IO, station: Station) -> Self {
        Self {
            io,
            station,
            sequence: Sequence::default(),
            buffer: Buffer::new(),
        }
    }

    /// The sequence number used by the most recent request.
    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    pub fn get_ref(&self) -> &IO {
        &self.io
    }

    /// Read or write one value in the station.
    ///
    /// `cmd` is the raw command code, `address` the data address, and `data`
    /// the value to write (0/1 for flags and outputs, any `i32` for
    /// registers). Reads ignore `data`.
    pub fn request(
        &mut self,
        cmd: u8,
        address: i64,
        data: Option<i64>,
    ) -> Result<Reply, RequestError> {
        let sequence = self.sequence.advance();

        let cmd = CommandCode::new(cmd).ok().context(UnsupportedCommandSnafu)?;
        let address = DataAddress::new(address)
            .ok()
            .context(InvalidAddressSnafu)?;
        let payload = if cmd.is_write() {
            Some(write_payload(cmd, data)?)
        } else {
            None
        };

        let request = build_request(
            sequence,
            self.station,
            cmd.code(),
            1,
            *address,
            payload.as_deref(),
        )
        .context(InvalidParameterSnafu)?;
        debug!("S-Bus tx {:02x?}", request);

        self.buffer.clear();
        self.send(&request)?;
        let response = self.receive()?;
        debug!("S-Bus rx {:?}", response);

        if response.sequence != sequence.get() {
            return BadResponseSnafu {
                reason: "sequence mismatch",
            }
            .fail();
        }
        decode_reply(cmd, &response)
    }

    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.io.write_all(data)?;
        self.io.flush()?;
        Ok(())
    }

    fn receive(&mut self) -> Result<Telegram, RequestError> {
        let mut chunk = [0; 64];
        loop {
            let needed = frame_length(self.buffer.as_ref()).map_err(receive_error)?;
            if let Some(len) = needed {
                if self.buffer.len() >= len {
                    let frame = self.buffer.take(len);
                    return parse_response(&frame).map_err(receive_error);
                }
            }
            let n = self.io.read(&mut chunk).map_err(TransportError::from)?;
            if n == 0 {
                return Err(TransportError::Closed.into());
            }
            self.buffer.write(&chunk[..n]);
        }
    }
}

fn write_payload(cmd: CommandCode, data: Option<i64>) -> Result<Vec<u8>, RequestError> {
    let value = data.context(InvalidDataSnafu)?;
    if cmd.is_bit() {
        match value {
            0 | 1 => codec::pack_booleans(&[value == 1])
                .map(|byte| vec![byte])
                .map_err(|_| RequestError::InvalidData),
            _ => InvalidDataSnafu.fail(),
        }
    } else {
        codec::encode_int32(&[value]).map_err(|_| RequestError::InvalidData)
    }
}

fn receive_error(err: telegram::Error) -> RequestError {
    match err {
        telegram::Error::Crc { .. } => RequestError::Crc { source: err },
        _ => RequestError::ResponseLength { source: err },
    }
}

fn decode_reply(cmd: CommandCode, response: &Telegram) -> Result<Reply, RequestError> {
    let payload = response.payload.as_slice();
    match response.attribute {
        Attribute::Response if !cmd.is_write() => {
            if cmd.is_bit() {
                let byte = payload.first().context(BadResponseSnafu {
                    reason: "empty data",
                })?;
                Ok(Reply::Bit(codec::unpack_booleans(*byte)[0]))
            } else {
                let value = payload
                    .get(..4)
                    .and_then(|reg| codec::decode_int32(reg).ok())
                    .and_then(|regs| regs.first().copied())
                    .context(BadResponseSnafu {
                        reason: "short register data",
                    })?;
                Ok(Reply::Register(value))
            }
        }
        Attribute::Response => BadResponseSnafu {
            reason: "data response to a write",
        }
        .fail(),
        Attribute::AckNak => {
            let code = codec::decode_int16(payload)
                .ok()
                .and_then(|codes| codes.first().copied())
                .context(BadResponseSnafu {
                    reason: "malformed ACK/NAK",
                })?;
            if code == 0 && cmd.is_write() {
                Ok(Reply::Written)
            } else {
                DeviceSnafu { code }.fail()
            }
        }
        _ => BadResponseSnafu {
            reason: "unexpected telegram attribute",
        }
        .fail(),
    }
}
