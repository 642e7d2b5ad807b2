//! Conversions between values and their S-Bus on-wire representation.
//!
//! Flags, inputs and outputs travel as packed bits, least significant bit
//! first. Registers travel as big-endian signed 32-bit integers. Every
//! telegram ends with a CRC-16/XMODEM checksum over all preceding bytes.

use core::convert::TryFrom;

use crc::{Crc, CRC_16_XMODEM};
use snafu::{ensure, Snafu};

const SBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Error type for this module
#[derive(Debug, Snafu, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The value doesn't fit in a signed 32-bit register.
    #[snafu(display("Value {} is outside the signed 32-bit range", value))]
    Range { value: i64 },
    /// The byte string can't be split into whole values.
    #[snafu(display("Length {} is not a multiple of {}", len, width))]
    Format { len: usize, width: usize },
    /// More bits than fit in a single byte.
    #[snafu(display("Can't pack {} bits into one byte", count))]
    TooManyBits { count: usize },
}

/// Pack up to eight booleans into one byte. `bits[0]` ends up in the least
/// significant bit; bits that aren't given are cleared.
pub fn pack_booleans(bits: &[bool]) -> Result<u8, Error> {
    ensure!(bits.len() <= 8, TooManyBitsSnafu { count: bits.len() });
    Ok(bits
        .iter()
        .enumerate()
        .filter(|(_, bit)| **bit)
        .fold(0, |byte, (n, _)| byte | (1 << n)))
}

/// Inverse of [`pack_booleans`].
pub fn unpack_booleans(byte: u8) -> [bool; 8] {
    let mut bits = [false; 8];
    for (n, bit) in bits.iter_mut().enumerate() {
        *bit = byte & (1 << n) != 0;
    }
    bits
}

/// Pack any number of booleans, eight per byte.
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    bits.chunks(8)
        .map(|chunk| pack_booleans(chunk).unwrap_or_default())
        .collect()
}

/// Unpack every bit of every byte, in wire order.
pub fn unpack_bits(bytes: &[u8]) -> Vec<bool> {
    bytes.iter().flat_map(|b| unpack_booleans(*b)).collect()
}

/// Encode register values, four big-endian bytes each.
///
/// # Errors
/// Returns [`Error::Range`] for the first value that isn't a valid `i32`.
pub fn encode_int32(values: &[i64]) -> Result<Vec<u8>, Error> {
    let mut out = Vec::with_capacity(values.len() * 4);
    for &value in values {
        let value = i32::try_from(value).map_err(|_| Error::Range { value })?;
        out.extend_from_slice(&value.to_be_bytes());
    }
    Ok(out)
}

/// Decode big-endian signed 32-bit register values.
///
/// # Errors
/// Returns [`Error::Format`] if `bytes` isn't a whole number of registers.
pub fn decode_int32(bytes: &[u8]) -> Result<Vec<i32>, Error> {
    ensure!(
        bytes.len() % 4 == 0,
        FormatSnafu {
            len: bytes.len(),
            width: 4usize
        }
    );
    Ok(bytes
        .chunks_exact(4)
        .map(|c| i32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Decode big-endian signed 16-bit values, as used by the ACK/NAK code.
pub fn decode_int16(bytes: &[u8]) -> Result<Vec<i16>, Error> {
    ensure!(
        bytes.len() % 2 == 0,
        FormatSnafu {
            len: bytes.len(),
            width: 2usize
        }
    );
    Ok(bytes
        .chunks_exact(2)
        .map(|c| i16::from_be_bytes([c[0], c[1]]))
        .collect())
}

/// S-Bus telegram checksum (CRC-16/XMODEM).
pub fn crc(bytes: &[u8]) -> u16 {
    SBUS_CRC.checksum(bytes)
}
