//! This module defines range-checked types for S-Bus command codes, data
//! addresses, station addresses and message sequence numbers, meant to
//! simplify correct usage of the API.

use snafu::{OptionExt, Snafu};

use core::convert::{TryFrom, TryInto};
use core::fmt;
use core::ops::Deref;

/// Error type for this module
#[derive(Debug, Snafu, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The value isn't one of the supported S-Bus command codes.
    #[snafu(display("Unsupported command code"))]
    UnsupportedCommand,
    /// The value isn't a valid S-Bus data address.
    #[snafu(display("Invalid address"))]
    InvalidAddress,
    /// The value isn't a valid S-Bus station address.
    #[snafu(display("Invalid station address"))]
    InvalidStation,
}

const fn unsupported_command() -> UnsupportedCommandSnafu {
    UnsupportedCommandSnafu
}

const fn invalid_address() -> InvalidAddressSnafu {
    InvalidAddressSnafu
}

const fn invalid_station() -> InvalidStationSnafu {
    InvalidStationSnafu
}

/// The subset of S-Bus command codes this crate speaks.
///
/// ## Example
/// ```
/// use sbus_probe::CommandCode;
/// use std::convert::TryFrom;
/// let cmd = CommandCode::try_from(6u8).unwrap();
/// assert_eq!(cmd, CommandCode::ReadRegister);
/// assert!(CommandCode::new(7).is_err());
/// ```
#[derive(PartialEq, Eq, Debug, Copy, Clone, Hash)]
#[repr(u8)]
pub enum CommandCode {
    ReadFlag = 2,
    ReadInput = 3,
    ReadOutput = 5,
    ReadRegister = 6,
    WriteFlag = 11,
    WriteOutput = 13,
    WriteRegister = 14,
}

impl CommandCode {
    /// Every legal command code, in numeric order.
    pub const ALL: [CommandCode; 7] = [
        CommandCode::ReadFlag,
        CommandCode::ReadInput,
        CommandCode::ReadOutput,
        CommandCode::ReadRegister,
        CommandCode::WriteFlag,
        CommandCode::WriteOutput,
        CommandCode::WriteRegister,
    ];

    /// Look up a command code.
    /// # Errors
    /// Returns [`Error::UnsupportedCommand`] for anything outside
    /// {2, 3, 5, 6, 11, 13, 14}.
    pub fn new(code: impl TryInto<u8>) -> Result<Self, Error> {
        let code = code.try_into().ok().with_context(unsupported_command)?;
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.code() == code)
            .with_context(unsupported_command)
    }

    /// The numeric code sent on the wire.
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// True for the three write commands.
    pub const fn is_write(self) -> bool {
        matches!(
            self,
            CommandCode::WriteFlag | CommandCode::WriteOutput | CommandCode::WriteRegister
        )
    }

    /// True for commands carrying single-bit values (flags, inputs, outputs).
    pub const fn is_bit(self) -> bool {
        !matches!(self, CommandCode::ReadRegister | CommandCode::WriteRegister)
    }
}

impl TryFrom<u8> for CommandCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<CommandCode> for u8 {
    fn from(cmd: CommandCode) -> Self {
        cmd.code()
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// `DataAddress` is a range-checked \[0, 65535\] integer, the address of a
/// flag, input, output or register in the station.
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Copy, Clone, Hash)]
#[repr(transparent)]
pub struct DataAddress(u16);

impl DataAddress {
    /// Create a new `DataAddress`.
    /// # Errors
    /// Returns [`Error::InvalidAddress`] if `address` is out of range.
    pub fn new(address: impl TryInto<u16>) -> Result<Self, Error> {
        let address = address.try_into().ok().with_context(invalid_address)?;
        Ok(Self(address))
    }
}

impl Deref for DataAddress {
    type Target = u16;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<u16> for DataAddress {
    fn from(address: u16) -> Self {
        Self(address)
    }
}

/// Station address [0, 255] of the addressed field device.
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Copy, Clone, Hash)]
#[repr(transparent)]
pub struct Station(u8);

impl Station {
    /// Create a new station address.
    /// # Errors
    /// Returns [`Error::InvalidStation`] if `station` doesn't fit in a byte.
    pub fn new(station: impl TryInto<u8>) -> Result<Self, Error> {
        let station = station.try_into().ok().with_context(invalid_station)?;
        Ok(Self(station))
    }
}

impl Deref for Station {
    type Target = u8;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<u8> for Station {
    fn from(station: u8) -> Self {
        Self(station)
    }
}

impl Default for Station {
    fn default() -> Self {
        Self(1)
    }
}

impl fmt::Display for Station {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message sequence number. Only the lower 15 bits are used, and the
/// counter never returns to zero.
#[derive(PartialEq, Eq, Debug, Copy, Clone, Hash)]
#[repr(transparent)]
pub struct Sequence(u16);

impl Sequence {
    pub const MAX: u16 = 32767;

    /// Create a sequence number, checking that it's in [1, 32767].
    pub fn new(seq: u16) -> Option<Self> {
        if (1..=Self::MAX).contains(&seq) {
            Some(Self(seq))
        } else {
            None
        }
    }

    /// Step to the next sequence number, wrapping from 32767 to 1.
    pub fn advance(&mut self) -> Self {
        self.0 = if self.0 >= Self::MAX { 1 } else { self.0 + 1 };
        *self
    }

    pub const fn get(self) -> u16 {
        self.0
    }
}

impl Default for Sequence {
    fn default() -> Self {
        Self(1)
    }
}

/// The telegram attribute byte, telling what kind of telegram follows.
#[derive(PartialEq, Eq, Debug, Copy, Clone, Hash)]
pub enum Attribute {
    Request,
    /// Data response to a read.
    Response,
    /// Acknowledge (code 0) or negative acknowledge of a write.
    AckNak,
    Other(u8),
}

impl From<u8> for Attribute {
    fn from(byte: u8) -> Self {
        match byte {
            0 => Attribute::Request,
            1 => Attribute::Response,
            2 => Attribute::AckNak,
            other => Attribute::Other(other),
        }
    }
}

impl From<Attribute> for u8 {
    fn from(attr: Attribute) -> Self {
        match attr {
            Attribute::Request => 0,
            Attribute::Response => 1,
            Attribute::AckNak => 2,
            Attribute::Other(other) => other,
        }
    }
}



#[cfg(test)]
mod sequence_tests {
    use super::*;

    #[test]
    fn test_sequence_wraps() {
        let mut seq = Sequence::default();
        assert_eq!(seq.get(), 1);
        assert_eq!(seq.advance().get(), 2);

        let mut seq = Sequence::new(32766).unwrap();
        assert_eq!(seq.advance().get(), 32767);
        assert_eq!(seq.advance().get(), 1);
        assert_eq!(Sequence::new(0), None);
        assert_eq!(Sequence::new(32768), None);
    }

    #[test]
    fn test_attribute() {
        assert_eq!(Attribute::from(1), Attribute::Response);
        assert_eq!(Attribute::from(2), Attribute::AckNak);
        assert_eq!(Attribute::from(9), Attribute::Other(9));
        assert_eq!(u8::from(Attribute::Other(9)), 9);
    }
}
