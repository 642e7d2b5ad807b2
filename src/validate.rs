//! Checks user-entered address types, addresses and values before anything
//! is sent to the station.
//!
//! Only the format is checked here. Range checks (address in \[0, 65535\],
//! 0/1 for bits, 32-bit registers) belong to the client.

use snafu::{OptionExt, Snafu};

use crate::types::CommandCode;

/// Address type meaning "nothing selected on this row".
pub const NO_ADDRESS_TYPE: &str = "None";

const READ_CODES: [(&str, CommandCode); 4] = [
    ("Flag", CommandCode::ReadFlag),
    ("Input", CommandCode::ReadInput),
    ("Output", CommandCode::ReadOutput),
    ("Register", CommandCode::ReadRegister),
];

const WRITE_CODES: [(&str, CommandCode); 3] = [
    ("Flag", CommandCode::WriteFlag),
    ("Output", CommandCode::WriteOutput),
    ("Register", CommandCode::WriteRegister),
];

/// Errors keep whatever was validated before the failing field.
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ValidationError {
    #[snafu(display("Invalid command code."))]
    InvalidCommandCode,
    #[snafu(display("Invalid address."))]
    InvalidAddress { command: CommandCode },
    #[snafu(display("Invalid data format."))]
    InvalidDataFormat { command: CommandCode, address: i64 },
}

impl ValidationError {
    /// The command code, if the address type was valid.
    pub fn command(&self) -> Option<CommandCode> {
        match self {
            ValidationError::InvalidCommandCode => None,
            ValidationError::InvalidAddress { command }
            | ValidationError::InvalidDataFormat { command, .. } => Some(*command),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub command: CommandCode,
    pub address: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRequest {
    pub command: CommandCode,
    pub address: i64,
    pub value: i64,
}

/// Validates the fields of a read row.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReadParamValidator;

impl ReadParamValidator {
    /// `Ok(None)` if no address type was selected.
    pub fn validate(
        &self,
        addr_type: &str,
        addr: &str,
    ) -> Result<Option<ReadRequest>, ValidationError> {
        if addr_type == NO_ADDRESS_TYPE {
            return Ok(None);
        }
        let command = lookup(&READ_CODES, addr_type).context(InvalidCommandCodeSnafu)?;
        let address = parse_int(addr).context(InvalidAddressSnafu { command })?;
        Ok(Some(ReadRequest { command, address }))
    }

    pub fn address_types(&self) -> impl Iterator<Item = &'static str> {
        READ_CODES.iter().map(|(name, _)| *name)
    }
}

/// Validates the fields of a write row.
#[derive(Debug, Default, Clone, Copy)]
pub struct WriteParamValidator;

impl WriteParamValidator {
    /// `Ok(None)` if no address type was selected.
    pub fn validate(
        &self,
        addr_type: &str,
        addr: &str,
        value: &str,
    ) -> Result<Option<WriteRequest>, ValidationError> {
        if addr_type == NO_ADDRESS_TYPE {
            return Ok(None);
        }
        let command = lookup(&WRITE_CODES, addr_type).context(InvalidCommandCodeSnafu)?;
        let address = parse_int(addr).context(InvalidAddressSnafu { command })?;
        let value = parse_int(value).context(InvalidDataFormatSnafu { command, address })?;
        Ok(Some(WriteRequest {
            command,
            address,
            value,
        }))
    }

    pub fn address_types(&self) -> impl Iterator<Item = &'static str> {
        WRITE_CODES.iter().map(|(name, _)| *name)
    }
}

fn lookup(table: &[(&str, CommandCode)], addr_type: &str) -> Option<CommandCode> {
    table
        .iter()
        .find(|(name, _)| *name == addr_type)
        .map(|(_, cmd)| *cmd)
}

/// Decimal integer with optional sign and surrounding whitespace.
fn parse_int(s: &str) -> Option<i64> {
    s.trim().parse().ok()
}
