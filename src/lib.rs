//! Diagnostic gateway for S-Bus field devices reached over Ethernet.
//!
//! The crate is layered bottom-up:
//!
//! * [`codec`]: bit packing, big-endian integers and the telegram CRC.
//! * [`telegram`]: building request telegrams and parsing responses.
//! * [`client`]: one request/response exchange with a station over any
//!   `Read + Write` stream, or TCP via [`SBusClient::connect`].
//! * [`validate`]: checks of user-entered rows before anything is sent.
//! * [`connection`]: connection parameters, reconnect and retry.
//! * [`gateway`]: the shared session used by the read, write and
//!   connection pages of a front end.

pub mod client;
pub mod codec;
pub mod connection;
pub mod gateway;
pub mod telegram;
pub mod types;
pub mod validate;

mod buffer;

pub use client::{FailureKind, Reply, RequestError, SBusClient, TransportError};
pub use connection::{
    ConfigError, ConnectionManager, ConnectionParams, ConnectionState, Connector, Link,
    TcpConnector,
};
pub use gateway::{ConnectForm, Gateway, Row};
pub use types::{Attribute, CommandCode, DataAddress, Sequence, Station};
pub use validate::{ReadParamValidator, ValidationError, WriteParamValidator};
