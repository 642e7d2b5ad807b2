//! Connection management for the single field device the probe talks to.
//!
//! [`ConnectionManager`] keeps the connection parameters and the current
//! client, and recovers from a broken connection by reconnecting once and
//! retrying the request when auto-reconnect is enabled.
//!
//! The manager isn't synchronised. Callers sharing it between threads must
//! hold a lock for the whole of every `connect`, `reconnect` and `request`
//! call, since the protocol can't multiplex requests on one connection.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use log::{info, warn};
use snafu::{ensure, OptionExt, Snafu};

use crate::client::{FailureKind, Reply, RequestError, SBusClient, TransportError};
use crate::types::Station;

/// Pause before reconnecting, so a station that just failed isn't hammered.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5050;
pub const DEFAULT_TIMEOUT: f64 = 5.0;

/// Shown on the connection page after a failed connect.
pub const CONNECT_ERROR_MESSAGE: &str = "Could not establish contact with remote host.";

/// Invalid connection parameters.
#[derive(Debug, Snafu, PartialEq)]
#[non_exhaustive]
pub enum ConfigError {
    #[snafu(display("Invalid remote host name."))]
    InvalidHost,
    #[snafu(display("Invalid remote port number: {}", port))]
    InvalidPort { port: String },
    #[snafu(display("Invalid time out: {}", timeout))]
    InvalidTimeout { timeout: f64 },
    #[snafu(display("Invalid remote station address number: {}", station))]
    InvalidStation { station: i64 },
}

/// Where and how to reach the field device.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionParams {
    host: String,
    port: u16,
    timeout: f64,
    timeout_duration: Duration,
    station: Station,
    auto_reconnect: bool,
}

impl ConnectionParams {
    /// # Errors
    /// Rejects an empty host, a timeout that isn't a representable
    /// non-negative duration, and station addresses outside \[0, 255\].
    pub fn new(
        host: impl Into<String>,
        port: u16,
        timeout: f64,
        station: i64,
        auto_reconnect: bool,
    ) -> Result<Self, ConfigError> {
        let host = host.into();
        ensure!(!host.trim().is_empty(), InvalidHostSnafu);
        let timeout_duration = Duration::try_from_secs_f64(timeout)
            .ok()
            .context(InvalidTimeoutSnafu { timeout })?;
        let station = Station::new(station).map_err(|_| ConfigError::InvalidStation { station })?;
        Ok(Self {
            host,
            port,
            timeout,
            timeout_duration,
            station,
            auto_reconnect,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Timeout in seconds.
    pub fn timeout(&self) -> f64 {
        self.timeout
    }

    pub fn timeout_duration(&self) -> Duration {
        self.timeout_duration
    }

    pub fn station(&self) -> Station {
        self.station
    }

    pub fn auto_reconnect(&self) -> bool {
        self.auto_reconnect
    }

    pub fn set_auto_reconnect(&mut self, auto_reconnect: bool) {
        self.auto_reconnect = auto_reconnect;
    }
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.into(),
            port: DEFAULT_PORT,
            timeout: DEFAULT_TIMEOUT,
            timeout_duration: Duration::from_secs(5),
            station: Station::default(),
            auto_reconnect: true,
        }
    }
}

/// Something that can carry S-Bus requests to the station.
pub trait Link {
    fn request(&mut self, cmd: u8, address: i64, data: Option<i64>)
        -> Result<Reply, RequestError>;
}

impl<IO: Read + Write> Link for SBusClient<IO> {
    fn request(
        &mut self,
        cmd: u8,
        address: i64,
        data: Option<i64>,
    ) -> Result<Reply, RequestError> {
        SBusClient::request(self, cmd, address, data)
    }
}

/// Opens new links from connection parameters.
pub trait Connector {
    type Link: Link;
    fn connect(&mut self, params: &ConnectionParams) -> Result<Self::Link, TransportError>;
}

/// Connects over TCP.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Link = SBusClient<TcpStream>;

    fn connect(&mut self, params: &ConnectionParams) -> Result<Self::Link, TransportError> {
        SBusClient::connect(
            params.host(),
            params.port(),
            params.timeout_duration(),
            params.station(),
        )
    }
}

/// Connection status as shown to the user.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionState {
    pub connected: bool,
    /// The most recent connection attempt failed.
    pub last_error: bool,
}

pub struct ConnectionManager<C: Connector = TcpConnector> {
    connector: C,
    params: ConnectionParams,
    link: Option<C::Link>,
    state: ConnectionState,
    version_info: String,
}

impl ConnectionManager<TcpConnector> {
    pub fn tcp(params: ConnectionParams) -> Self {
        Self::new(TcpConnector, params)
    }
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, params: ConnectionParams) -> Self {
        Self {
            connector,
            params,
            link: None,
            state: ConnectionState::default(),
            version_info: String::new(),
        }
    }

    /// Store new connection parameters. Takes effect on the next connect.
    pub fn set_connection_params(&mut self, params: ConnectionParams) {
        self.params = params;
    }

    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    pub fn set_auto_reconnect(&mut self, auto_reconnect: bool) {
        self.params.set_auto_reconnect(auto_reconnect);
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    pub fn set_version_info(&mut self, version_info: impl Into<String>) {
        self.version_info = version_info.into();
    }

    /// Open a new connection with the current parameters, replacing any
    /// existing one.
    pub fn connect(&mut self) -> Result<(), TransportError> {
        self.link = None;
        match self.connector.connect(&self.params) {
            Ok(link) => {
                self.link = Some(link);
                self.state = ConnectionState {
                    connected: true,
                    last_error: false,
                };
                Ok(())
            }
            Err(err) => {
                warn!(
                    "Could not connect to {}:{}: {}",
                    self.params.host(),
                    self.params.port(),
                    err
                );
                self.state = ConnectionState {
                    connected: false,
                    last_error: true,
                };
                Err(err)
            }
        }
    }

    pub fn disconnect(&mut self) {
        if self.link.take().is_some() {
            info!("Disconnected from {}", self.params.host());
        }
        self.state.connected = false;
    }

    /// Drop the current connection, wait [`RECONNECT_DELAY`] and connect again.
    pub fn reconnect(&mut self) -> Result<(), TransportError> {
        self.link = None;
        self.state.connected = false;
        thread::sleep(RECONNECT_DELAY);
        self.connect()
    }

    /// Send one request to the station.
    ///
    /// With auto-reconnect enabled, any failure triggers exactly one
    /// reconnect followed by exactly one retry, whose result is returned.
    pub fn request(
        &mut self,
        cmd: u8,
        address: i64,
        data: Option<i64>,
    ) -> Result<Reply, RequestError> {
        let first = self.request_once(cmd, address, data);
        let err = match first {
            Ok(reply) => return Ok(reply),
            Err(err) => err,
        };
        if !self.params.auto_reconnect() {
            return Err(err);
        }

        warn!("Request failed ({}), auto reconnecting ...", err);
        // A failed reconnect shows up as NotConnected in the retry.
        let _ = self.reconnect();
        self.request_once(cmd, address, data)
    }

    fn request_once(
        &mut self,
        cmd: u8,
        address: i64,
        data: Option<i64>,
    ) -> Result<Reply, RequestError> {
        let link = match self.link.as_mut() {
            Some(link) => link,
            None => return Err(TransportError::NotConnected.into()),
        };
        let result = link.request(cmd, address, data);
        if let Err(err) = &result {
            if matches!(err.kind(), FailureKind::Transport | FailureKind::Protocol) {
                // the stream may be out of step with the station now
                self.disconnect();
            }
        }
        result
    }

    /// Flat key/value view of the connection status for page templates.
    pub fn page_data(&self) -> BTreeMap<&'static str, String> {
        let params = &self.params;
        let connected = self.state.connected;
        let current = |value: String| if connected { value } else { String::new() };
        let checked = |on: bool| {
            if on {
                r#"checked="checked""#.to_string()
            } else {
                String::new()
            }
        };

        let mut data = BTreeMap::new();
        data.insert("host", params.host().to_string());
        data.insert("port", params.port().to_string());
        data.insert("timeout", params.timeout().to_string());
        data.insert("unitid", params.station().to_string());
        data.insert("connectedstat", checked(connected));
        data.insert("disconnectedstat", checked(!connected));
        data.insert("autoconnectstat", checked(params.auto_reconnect()));
        data.insert(
            "connectionstat",
            if connected { "Connected" } else { "Disconnected" }.to_string(),
        );
        data.insert("currenthost", current(params.host().to_string()));
        data.insert("currentport", current(params.port().to_string()));
        data.insert("currenttimeout", current(params.timeout().to_string()));
        data.insert("currentunitid", current(params.station().to_string()));
        data.insert(
            "connectionstyle",
            if connected {
                "statusconnected"
            } else {
                "statusdisconnected"
            }
            .to_string(),
        );
        data.insert(
            "connecterror",
            if self.state.last_error {
                CONNECT_ERROR_MESSAGE.to_string()
            } else {
                String::new()
            },
        );
        data.insert("softversion", self.version_info.clone());
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_validation() {
        assert!(ConnectionParams::new("plc", 5050, 0.0, 0, true).is_ok());
        assert!(ConnectionParams::new("plc", 5050, 2.5, 255, false).is_ok());
        assert_eq!(
            ConnectionParams::new(" ", 5050, 1.0, 1, true),
            Err(ConfigError::InvalidHost)
        );
        assert_eq!(
            ConnectionParams::new("plc", 5050, -1.0, 1, true),
            Err(ConfigError::InvalidTimeout { timeout: -1.0 })
        );
        assert!(ConnectionParams::new("plc", 5050, f64::NAN, 1, true).is_err());
        assert_eq!(
            ConnectionParams::new("plc", 5050, 1.0, 256, true),
            Err(ConfigError::InvalidStation { station: 256 })
        );
        assert!(ConnectionParams::new("plc", 5050, 1.0, -1, true).is_err());
    }

    #[test]
    fn test_timeout_too_large() {
        assert_eq!(
            ConnectionParams::new("plc", 5050, 1e300, 1, true),
            Err(ConfigError::InvalidTimeout { timeout: 1e300 })
        );
        assert!(ConnectionParams::new("plc", 5050, f64::INFINITY, 1, true).is_err());
        let params = ConnectionParams::new("plc", 5050, 0.25, 1, true).unwrap();
        assert_eq!(params.timeout_duration(), Duration::from_millis(250));
    }

    #[test]
    fn test_default_params() {
        let params = ConnectionParams::default();
        assert_eq!(params.host(), "localhost");
        assert_eq!(params.port(), 5050);
        assert_eq!(params.timeout_duration(), Duration::from_secs(5));
        assert_eq!(*params.station(), 1);
        assert!(params.auto_reconnect());
    }
}
