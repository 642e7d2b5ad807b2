//! The probe session: everything a front end needs to turn submitted form
//! rows into S-Bus requests and back.
//!
//! One [`Gateway`] is created at startup and shared by all request handlers.
//! It owns the connection manager behind a mutex, so concurrent handlers are
//! serialised per request.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, warn};

use crate::connection::{
    ConfigError, ConnectionManager, ConnectionParams, ConnectionState, Connector, TcpConnector,
};
use crate::validate::{ReadParamValidator, WriteParamValidator, NO_ADDRESS_TYPE};

/// One row of the read or write page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub addr_type: String,
    pub address: String,
    pub data: String,
    pub error: String,
}

impl Row {
    pub fn new(
        addr_type: impl Into<String>,
        address: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        Self {
            addr_type: addr_type.into(),
            address: address.into(),
            data: data.into(),
            error: String::new(),
        }
    }
}

impl Default for Row {
    fn default() -> Self {
        Row::new(NO_ADDRESS_TYPE, "", "")
    }
}

/// Build page rows from submitted `addrtypeNN`, `addrNN` and `dataNN`
/// fields, ordered by `NN`. Other fields are ignored.
pub fn rows_from_form<I, K, V>(fields: I) -> Vec<Row>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Into<String>,
{
    let mut rows: BTreeMap<u32, Row> = BTreeMap::new();
    for (key, value) in fields {
        let key = key.as_ref();
        let (field, index) = match split_row_key(key) {
            Some(split) => split,
            None => continue,
        };
        let row = rows.entry(index).or_default();
        match field {
            "addrtype" => row.addr_type = value.into(),
            "addr" => row.address = value.into(),
            "data" => row.data = value.into(),
            _ => {}
        }
    }
    rows.into_values().collect()
}

fn split_row_key(key: &str) -> Option<(&str, u32)> {
    ["addrtype", "addr", "data"].iter().find_map(|field| {
        let index = key.strip_prefix(field)?;
        if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some((*field, index.parse().ok()?))
    })
}

/// Flatten rows into the `addrtypeNN`/`addrNN`/`dataNN`/`errorsNN` keys
/// used by page templates, numbered from 01.
pub fn page_data(rows: &[Row]) -> BTreeMap<String, String> {
    let mut data = BTreeMap::new();
    for (n, row) in rows.iter().enumerate() {
        let n = n + 1;
        data.insert(format!("addrtype{:02}", n), row.addr_type.clone());
        data.insert(format!("addr{:02}", n), row.address.clone());
        data.insert(format!("data{:02}", n), row.data.clone());
        data.insert(format!("errors{:02}", n), row.error.clone());
    }
    data
}

/// Fields of the "set parameters" page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectForm {
    pub host: String,
    pub port: String,
    pub timeout: String,
    pub unit_id: String,
    /// Connect (true) or disconnect (false).
    pub connect: bool,
    pub auto_reconnect: bool,
}

impl ConnectForm {
    /// Read the form from submitted fields. Checkboxes that weren't ticked
    /// are simply missing.
    pub fn from_fields<I, K, V>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut form = ConnectForm::default();
        for (key, value) in fields {
            let value = value.into();
            match key.as_ref() {
                "host" => form.host = value,
                "port" => form.port = value,
                "timeout" => form.timeout = value,
                "unitid" => form.unit_id = value,
                "connect" => form.connect = value == "connect",
                "autoconnect" => form.auto_reconnect = value == "autoconnect",
                _ => {}
            }
        }
        form
    }

    /// Parse the text fields into connection parameters.
    pub fn params(&self) -> Result<ConnectionParams, ConfigError> {
        let port = self
            .port
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidPort {
                port: self.port.clone(),
            })?;
        let timeout = self
            .timeout
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidTimeout { timeout: f64::NAN })?;
        let station = self
            .unit_id
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidStation { station: -1 })?;
        ConnectionParams::new(
            self.host.trim(),
            port,
            timeout,
            station,
            self.auto_reconnect,
        )
    }
}

/// Session context shared by the read, write and connection pages.
pub struct Gateway<C: Connector = TcpConnector> {
    connection: Mutex<ConnectionManager<C>>,
    read_validator: ReadParamValidator,
    write_validator: WriteParamValidator,
    read_page: Mutex<Vec<Row>>,
    write_page: Mutex<Vec<Row>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panic in another handler doesn't leave the pages or the manager inconsistent.
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<C: Connector> Gateway<C> {
    pub fn new(connection: ConnectionManager<C>) -> Self {
        Self {
            connection: Mutex::new(connection),
            read_validator: ReadParamValidator,
            write_validator: WriteParamValidator,
            read_page: Mutex::new(Vec::new()),
            write_page: Mutex::new(Vec::new()),
        }
    }

    /// Run `f` with exclusive access to the connection manager.
    pub fn with_connection<R>(&self, f: impl FnOnce(&mut ConnectionManager<C>) -> R) -> R {
        f(&mut lock(&self.connection))
    }

    pub fn set_version_info(&self, version_info: impl Into<String>) {
        lock(&self.connection).set_version_info(version_info);
    }

    pub fn connect(&self) -> ConnectionState {
        let mut conn = lock(&self.connection);
        // the failure is recorded in the connection state
        let _ = conn.connect();
        conn.state()
    }

    pub fn disconnect(&self) {
        lock(&self.connection).disconnect();
    }

    pub fn connection_state(&self) -> ConnectionState {
        lock(&self.connection).state()
    }

    /// Apply the "set parameters" page.
    ///
    /// With `connect` requested and valid fields, the new parameters are
    /// stored and the connection is re-established. Without `connect`, the
    /// connection is closed. The auto-reconnect flag is always taken over.
    ///
    /// # Errors
    /// Returns the [`ConfigError`] for invalid fields; nothing but the
    /// auto-reconnect flag changes in that case.
    pub fn configure(&self, form: &ConnectForm) -> Result<ConnectionState, ConfigError> {
        let mut conn = lock(&self.connection);
        let result = if form.connect {
            form.params().map(|params| {
                conn.set_connection_params(params);
                let _ = conn.reconnect();
            })
        } else {
            conn.disconnect();
            Ok(())
        };
        conn.set_auto_reconnect(form.auto_reconnect);
        if let Err(err) = &result {
            warn!("Connection parameters rejected: {}", err);
        }
        result.map(|_| conn.state())
    }

    /// Snapshot of the connection page.
    pub fn connection_page(&self) -> BTreeMap<&'static str, String> {
        lock(&self.connection).page_data()
    }

    /// Read every row from the station. Rows that fail validation get their
    /// error set and are never sent.
    pub fn read(&self, mut rows: Vec<Row>) -> Vec<Row> {
        for row in rows.iter_mut() {
            row.error.clear();
            match self.read_validator.validate(&row.addr_type, &row.address) {
                Ok(Some(req)) => {
                    row.data.clear();
                    let result =
                        lock(&self.connection).request(req.command.code(), req.address, None);
                    match result {
                        Ok(reply) => row.data = reply.to_string(),
                        Err(err) => row.error = err.to_string(),
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    debug!("Read row {:?} rejected: {}", row, err);
                    row.error = err.to_string();
                }
            }
        }
        *lock(&self.read_page) = rows.clone();
        rows
    }

    /// Write every row to the station.
    pub fn write(&self, mut rows: Vec<Row>) -> Vec<Row> {
        for row in rows.iter_mut() {
            row.error.clear();
            match self
                .write_validator
                .validate(&row.addr_type, &row.address, &row.data)
            {
                Ok(Some(req)) => {
                    let result = lock(&self.connection).request(
                        req.command.code(),
                        req.address,
                        Some(req.value),
                    );
                    if let Err(err) = result {
                        row.error = err.to_string();
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    debug!("Write row {:?} rejected: {}", row, err);
                    row.error = err.to_string();
                }
            }
        }
        *lock(&self.write_page) = rows.clone();
        rows
    }

    /// Handle a submitted read page. `read=reset` clears the page instead.
    pub fn read_form<I, K, V>(&self, fields: I) -> Vec<Row>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let (reset, fields) = split_reset(fields, "read");
        if reset {
            self.clear_read();
            return Vec::new();
        }
        self.read(rows_from_form(fields))
    }

    /// Handle a submitted write page. `write=reset` clears the page instead.
    pub fn write_form<I, K, V>(&self, fields: I) -> Vec<Row>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let (reset, fields) = split_reset(fields, "write");
        if reset {
            self.clear_write();
            return Vec::new();
        }
        self.write(rows_from_form(fields))
    }

    pub fn read_page(&self) -> Vec<Row> {
        lock(&self.read_page).clone()
    }

    pub fn write_page(&self) -> Vec<Row> {
        lock(&self.write_page).clone()
    }

    pub fn clear_read(&self) {
        lock(&self.read_page).clear();
    }

    pub fn clear_write(&self) {
        lock(&self.write_page).clear();
    }
}

fn split_reset<I, K, V>(fields: I, action: &str) -> (bool, Vec<(String, String)>)
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Into<String>,
{
    let fields: Vec<(String, String)> = fields
        .into_iter()
        .map(|(k, v)| (k.as_ref().to_string(), v.into()))
        .collect();
    let reset = fields.iter().any(|(k, v)| k == action && v == "reset");
    (reset, fields)
}
