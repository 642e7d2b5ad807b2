//! Ether-S-Bus telegram framing.
//!
//! Every telegram starts with a nine byte header and ends with a CRC:
//!
//! ```text
//! u32 length | u8 version | u8 protocol type | u16 sequence | u8 attribute | body | u16 crc
//! ```
//!
//! All fields are big-endian and the length covers the whole telegram,
//! CRC included.

use arrayvec::ArrayVec;
use core::convert::TryInto;
use nom::number::complete::{be_u16, be_u32, u8};
use nom::sequence::tuple;
use nom::IResult;
use snafu::{ensure, OptionExt, Snafu};

use crate::codec;
use crate::types::{Attribute, CommandCode, Sequence, Station};

type Buf = [u8];

pub const HEADER_LEN: usize = 9;
pub const CRC_LEN: usize = 2;
/// Header and CRC with nothing in between.
pub const MIN_TELEGRAM_LEN: usize = HEADER_LEN + CRC_LEN;
/// Header, i16 ACK/NAK code and CRC.
pub const ACK_TELEGRAM_LEN: usize = MIN_TELEGRAM_LEN + 2;
/// Larger than any telegram carrying 32 registers or 128 bits.
pub const MAX_TELEGRAM_LEN: usize = 256;

const VERSION: u8 = 1;
const PROTOCOL_SBUS: u8 = 0;

// length, version, protocol, sequence, attribute, station, command, count, address, fio-count
type RequestHeader = ArrayVec<u8, 15>;

/// Error type for this module
#[derive(Debug, Snafu, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The request can't be encoded as an S-Bus telegram.
    #[snafu(display("Invalid parameter: {}", reason))]
    Param { reason: &'static str },
    /// The telegram length doesn't match any known telegram shape.
    #[snafu(display("Telegram length {} doesn't match any telegram", len))]
    MessageLength { len: usize },
    /// The trailing CRC doesn't match the telegram contents.
    #[snafu(display(
        "CRC mismatch, computed {:#06x} but received {:#06x}",
        computed,
        received
    ))]
    Crc { computed: u16, received: u16 },
}

/// A parsed incoming telegram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Telegram {
    pub attribute: Attribute,
    pub sequence: u16,
    pub payload: Vec<u8>,
}

/// Encode a request telegram.
///
/// `payload` must be absent for reads, and hold `count` packed bits
/// (flags, outputs) or `count` big-endian registers for writes.
///
/// # Errors
/// Returns [`Error::Param`] if the command code or address is out of
/// range, or if `count` and `payload` don't fit the command.
pub fn build_request(
    sequence: Sequence,
    station: Station,
    cmd: impl TryInto<u8>,
    count: u8,
    address: impl TryInto<u16>,
    payload: Option<&[u8]>,
) -> Result<Vec<u8>, Error> {
    let cmd = cmd
        .try_into()
        .ok()
        .and_then(|c| CommandCode::new(c).ok())
        .context(ParamSnafu {
            reason: "unsupported command code",
        })?;
    let address: u16 = address.try_into().ok().context(ParamSnafu {
        reason: "address out of range",
    })?;
    let max_count = if cmd.is_bit() { 128 } else { 32 };
    ensure!(
        (1..=max_count).contains(&count),
        ParamSnafu {
            reason: "count out of range"
        }
    );

    let data = payload.unwrap_or(&[]);
    let data_len = if !cmd.is_write() {
        0
    } else if cmd.is_bit() {
        (count as usize + 7) / 8
    } else {
        count as usize * 4
    };
    ensure!(
        data.len() == data_len,
        ParamSnafu {
            reason: "payload doesn't match count"
        }
    );

    let mut header = RequestHeader::new();
    header.push(VERSION);
    header.push(PROTOCOL_SBUS);
    header.extend(sequence.get().to_be_bytes());
    header.push(Attribute::Request.into());
    header.push(*station);
    header.push(cmd.code());
    match cmd {
        CommandCode::WriteRegister => header.push(data.len() as u8 + 1),
        CommandCode::WriteFlag | CommandCode::WriteOutput => header.push(data.len() as u8 + 2),
        _ => header.push(count - 1),
    }
    header.extend(address.to_be_bytes());
    if cmd.is_write() && cmd.is_bit() {
        header.push(count - 1);
    }

    let len = 4 + header.len() + data.len() + CRC_LEN;
    let mut telegram = Vec::with_capacity(len);
    telegram.extend_from_slice(&(len as u32).to_be_bytes());
    telegram.extend_from_slice(&header);
    telegram.extend_from_slice(data);
    let crc = codec::crc(&telegram);
    telegram.extend_from_slice(&crc.to_be_bytes());
    Ok(telegram)
}

/// Encode a station reply, a data response or an ACK/NAK.
pub fn build_reply(sequence: u16, attribute: Attribute, payload: &[u8]) -> Vec<u8> {
    let len = MIN_TELEGRAM_LEN + payload.len();
    let mut telegram = Vec::with_capacity(len);
    telegram.extend_from_slice(&(len as u32).to_be_bytes());
    telegram.push(VERSION);
    telegram.push(PROTOCOL_SBUS);
    telegram.extend_from_slice(&sequence.to_be_bytes());
    telegram.push(attribute.into());
    telegram.extend_from_slice(payload);
    let crc = codec::crc(&telegram);
    telegram.extend_from_slice(&crc.to_be_bytes());
    telegram
}

/// Parse one complete telegram.
///
/// The CRC is verified before anything inside the telegram is trusted, so
/// any corrupted byte is reported as a CRC error.
///
/// # Errors
/// [`Error::MessageLength`] if the buffer doesn't have the shape of an S-Bus
/// telegram, [`Error::Crc`] if the checksum doesn't match.
pub fn parse_response(buf: &Buf) -> Result<Telegram, Error> {
    let len = buf.len();
    ensure!(len >= MIN_TELEGRAM_LEN, MessageLengthSnafu { len });

    let (body, crc_bytes) = buf.split_at(len - CRC_LEN);
    let received = u16::from_be_bytes([crc_bytes[0], crc_bytes[1]]);
    let computed = codec::crc(body);
    ensure!(computed == received, CrcSnafu { computed, received });

    let (payload, (length, _version, _protocol, sequence, attribute)) =
        header(body).map_err(|_| Error::MessageLength { len })?;
    ensure!(length as usize == len, MessageLengthSnafu { len });

    let attribute = Attribute::from(attribute);
    match attribute {
        Attribute::AckNak => ensure!(len == ACK_TELEGRAM_LEN, MessageLengthSnafu { len }),
        Attribute::Response => ensure!(len > MIN_TELEGRAM_LEN, MessageLengthSnafu { len }),
        _ => {}
    }

    Ok(Telegram {
        attribute,
        sequence,
        payload: payload.to_vec(),
    })
}

/// Find the length of the telegram at the start of `buf`.
///
/// Returns `Ok(None)` while the length prefix is still incomplete.
pub fn frame_length(buf: &Buf) -> Result<Option<usize>, Error> {
    match nom::number::streaming::be_u32::<_, nom::error::Error<&Buf>>(buf) {
        Ok((_, length)) => {
            let len = length as usize;
            ensure!(
                (MIN_TELEGRAM_LEN..=MAX_TELEGRAM_LEN).contains(&len),
                MessageLengthSnafu { len }
            );
            Ok(Some(len))
        }
        // streaming be_u32 only fails when fewer than four bytes are present
        Err(_) => Ok(None),
    }
}

fn header(buf: &Buf) -> IResult<&Buf, (u32, u8, u8, u16, u8)> {
    tuple((be_u32, u8, u8, be_u16, u8))(buf)
}

/// A request telegram as seen by the station.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub sequence: u16,
    pub station: u8,
    pub command: u8,
    /// The raw count byte: count - 1 for reads, w-count for writes.
    pub count: u8,
    pub address: u16,
    /// Everything after the address, including the fio-count of bit writes.
    pub data: Vec<u8>,
}

/// Parse a request telegram, the station side of [`build_request`].
pub fn parse_request(buf: &Buf) -> Result<Request, Error> {
    let telegram = parse_response(buf)?;
    let len = buf.len();
    let (data, (station, command, count, address)) =
        request_body(&telegram.payload).map_err(|_| Error::MessageLength { len })?;
    Ok(Request {
        sequence: telegram.sequence,
        station,
        command,
        count,
        address,
        data: data.to_vec(),
    })
}

fn request_body(buf: &Buf) -> IResult<&Buf, (u8, u8, u8, u16)> {
    tuple((u8, u8, u8, be_u16))(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(n: u16) -> Sequence {
        Sequence::new(n).unwrap()
    }

    #[test]
    fn test_read_request_layout() {
        let msg = build_request(seq(2), Station::from(1), 6, 1, 300, None).unwrap();
        assert_eq!(msg.len(), 16);
        assert_eq!(&msg[..4], &[0, 0, 0, 16]);
        assert_eq!(&msg[4..9], &[VERSION, PROTOCOL_SBUS, 0, 2, 0]);
        assert_eq!(&msg[9..14], &[1, 6, 0, 0x01, 0x2c]);
        let crc = codec::crc(&msg[..14]);
        assert_eq!(&msg[14..], &crc.to_be_bytes());
    }

    #[test]
    fn test_write_flag_layout() {
        let msg =
            build_request(seq(7), Station::from(3), 11, 1, 10, Some(&[0x01][..])).unwrap();
        assert_eq!(msg.len(), 18);
        // station, cmd, w-count, address, fio-count, data
        assert_eq!(&msg[9..16], &[3, 11, 3, 0, 10, 0, 0x01]);

        let req = parse_request(&msg).unwrap();
        assert_eq!(req.sequence, 7);
        assert_eq!(req.command, 11);
        assert_eq!(req.address, 10);
        assert_eq!(req.data, vec![0, 0x01]);
    }

    #[test]
    fn test_write_register_layout() {
        let data = codec::encode_int32(&[-2]).unwrap();
        let msg =
            build_request(seq(1), Station::from(1), 14, 1, 65535, Some(data.as_slice())).unwrap();
        assert_eq!(msg.len(), 20);
        assert_eq!(&msg[9..18], &[1, 14, 5, 0xff, 0xff, 0xff, 0xff, 0xff, 0xfe]);
    }

    #[test]
    fn test_build_request_params() {
        let param = |r: Result<Vec<u8>, Error>| matches!(r, Err(Error::Param { .. }));
        let st = Station::default();
        assert!(param(build_request(seq(1), st, 7, 1, 0, None)));
        assert!(param(build_request(seq(1), st, 300, 1, 0, None)));
        assert!(param(build_request(seq(1), st, 6, 1, 65536, None)));
        assert!(param(build_request(seq(1), st, 6, 1, -1, None)));
        assert!(param(build_request(seq(1), st, 6, 0, 0, None)));
        assert!(param(build_request(seq(1), st, 6, 33, 0, None)));
        assert!(param(build_request(seq(1), st, 6, 1, 0, Some(&[0][..]))));
        assert!(param(build_request(seq(1), st, 14, 1, 0, Some(&[0, 0][..]))));
        assert!(param(build_request(seq(1), st, 11, 1, 0, None)));
        assert!(build_request(seq(1), st, 2, 128, 0, None).is_ok());
    }

    #[test]
    fn test_parse_reply() {
        let msg = build_reply(42, Attribute::Response, &[0x01]);
        let telegram = parse_response(&msg).unwrap();
        assert_eq!(telegram.attribute, Attribute::Response);
        assert_eq!(telegram.sequence, 42);
        assert_eq!(telegram.payload, vec![0x01]);

        let ack = build_reply(43, Attribute::AckNak, &[0, 0]);
        assert_eq!(ack.len(), ACK_TELEGRAM_LEN);
        assert_eq!(parse_response(&ack).unwrap().payload, vec![0, 0]);
    }

    #[test]
    fn test_parse_length_errors() {
        assert_eq!(
            parse_response(&[0; 10]),
            Err(Error::MessageLength { len: 10 })
        );
        // data response without any data
        let empty = build_reply(1, Attribute::Response, &[]);
        assert_eq!(
            parse_response(&empty),
            Err(Error::MessageLength { len: 11 })
        );
        // ACK/NAK must carry exactly one i16
        let long_ack = build_reply(1, Attribute::AckNak, &[0, 0, 0, 0]);
        assert_eq!(
            parse_response(&long_ack),
            Err(Error::MessageLength { len: 15 })
        );
        // length field disagreeing with the buffer, CRC still valid
        let mut msg = build_reply(1, Attribute::Response, &[1]);
        msg[3] = 20;
        let crc = codec::crc(&msg[..msg.len() - 2]);
        let n = msg.len();
        msg[n - 2..].copy_from_slice(&crc.to_be_bytes());
        assert_eq!(parse_response(&msg), Err(Error::MessageLength { len: 12 }));
    }

    #[test]
    fn test_any_corrupt_byte_is_crc_error() {
        let data = codec::encode_int32(&[123_456]).unwrap();
        let msg =
            build_request(seq(99), Station::from(5), 14, 1, 1000, Some(data.as_slice())).unwrap();
        assert!(parse_response(&msg).is_ok());
        for n in 0..msg.len() {
            let mut corrupt = msg.clone();
            corrupt[n] ^= 0x5a;
            assert!(
                matches!(parse_response(&corrupt), Err(Error::Crc { .. })),
                "byte {} not detected",
                n
            );
        }
    }

    #[test]
    fn test_frame_length() {
        assert_eq!(frame_length(&[]), Ok(None));
        assert_eq!(frame_length(&[0, 0, 0]), Ok(None));
        assert_eq!(frame_length(&[0, 0, 0, 13, 1]), Ok(Some(13)));
        assert_eq!(
            frame_length(&[0, 0, 0, 3]),
            Err(Error::MessageLength { len: 3 })
        );
        assert_eq!(
            frame_length(&[0xff, 0, 0, 0]),
            Err(Error::MessageLength { len: 0xff00_0000 })
        );
    }
}
