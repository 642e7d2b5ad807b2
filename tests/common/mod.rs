#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst};
use std::sync::{Arc, Mutex};
use std::thread;

use sbus_probe::connection::{ConnectionParams, Connector, Link};
use sbus_probe::telegram::{build_reply, parse_request, Request};
use sbus_probe::{Attribute, Reply, RequestError, TransportError};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Shared script for [`ScriptedConnector`] and its links.
#[derive(Default)]
pub struct Script {
    /// Results of the coming requests, in order. An empty script answers
    /// every request with `Reply::Written`.
    pub replies: VecDeque<Result<Reply, RequestError>>,
    /// Number of coming connect attempts that fail.
    pub failing_connects: usize,
    pub connects: usize,
    pub requests: Vec<(u8, i64, Option<i64>)>,
}

pub type SharedScript = Arc<Mutex<Script>>;

/// Connector handing out in-memory links that play back a [`Script`].
#[derive(Default, Clone)]
pub struct ScriptedConnector {
    pub script: SharedScript,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn push_reply(&self, reply: Result<Reply, RequestError>) {
        self.script.lock().unwrap().replies.push_back(reply);
    }

    pub fn fail_connects(&self, count: usize) {
        self.script.lock().unwrap().failing_connects = count;
    }

    pub fn connects(&self) -> usize {
        self.script.lock().unwrap().connects
    }

    pub fn requests(&self) -> Vec<(u8, i64, Option<i64>)> {
        self.script.lock().unwrap().requests.clone()
    }
}

pub struct ScriptedLink {
    script: SharedScript,
}

impl Connector for ScriptedConnector {
    type Link = ScriptedLink;

    fn connect(&mut self, _params: &ConnectionParams) -> Result<ScriptedLink, TransportError> {
        let mut script = self.script.lock().unwrap();
        script.connects += 1;
        if script.failing_connects > 0 {
            script.failing_connects -= 1;
            return Err(TransportError::Refused);
        }
        Ok(ScriptedLink {
            script: Arc::clone(&self.script),
        })
    }
}

impl Link for ScriptedLink {
    fn request(&mut self, cmd: u8, address: i64, data: Option<i64>) -> Result<Reply, RequestError> {
        let mut script = self.script.lock().unwrap();
        script.requests.push((cmd, address, data));
        script.replies.pop_front().unwrap_or(Ok(Reply::Written))
    }
}

pub fn closed() -> RequestError {
    TransportError::Closed.into()
}

/// Data memory of a [`FakeStation`].
#[derive(Default, Debug)]
pub struct Memory {
    pub flags: HashMap<u16, bool>,
    pub inputs: HashMap<u16, bool>,
    pub outputs: HashMap<u16, bool>,
    pub registers: HashMap<u16, i32>,
    /// Answer every request with this NAK code instead.
    pub nak: Option<i16>,
}

/// An S-Bus station on a local TCP port. Every accepted connection is
/// served by its own thread.
pub struct FakeStation {
    addr: SocketAddr,
    pub memory: Arc<Mutex<Memory>>,
    pub requests: Arc<Mutex<Vec<Request>>>,
    connections: Arc<AtomicUsize>,
    hang_up: Arc<AtomicBool>,
    silent: Arc<AtomicBool>,
}

impl FakeStation {
    pub fn start() -> FakeStation {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let station = FakeStation {
            addr: listener.local_addr().unwrap(),
            memory: Default::default(),
            requests: Default::default(),
            connections: Default::default(),
            hang_up: Default::default(),
            silent: Default::default(),
        };

        let ctx = StationContext {
            memory: Arc::clone(&station.memory),
            requests: Arc::clone(&station.requests),
            hang_up: Arc::clone(&station.hang_up),
            silent: Arc::clone(&station.silent),
        };
        let connections = Arc::clone(&station.connections);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(_) => break,
                };
                connections.fetch_add(1, SeqCst);
                let ctx = ctx.clone();
                thread::spawn(move || ctx.serve(stream));
            }
        });
        station
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn params(&self, auto_reconnect: bool) -> ConnectionParams {
        ConnectionParams::new("127.0.0.1", self.port(), 2.0, 1, auto_reconnect).unwrap()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(SeqCst)
    }

    /// Close the connection instead of answering the next request.
    pub fn hang_up_next(&self) {
        self.hang_up.store(true, SeqCst);
    }

    /// Stop answering requests.
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, SeqCst);
    }

    pub fn last_request(&self) -> Option<Request> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[derive(Clone)]
struct StationContext {
    memory: Arc<Mutex<Memory>>,
    requests: Arc<Mutex<Vec<Request>>>,
    hang_up: Arc<AtomicBool>,
    silent: Arc<AtomicBool>,
}

impl StationContext {
    fn serve(&self, mut stream: TcpStream) {
        loop {
            let mut len = [0; 4];
            if stream.read_exact(&mut len).is_err() {
                return;
            }
            let mut telegram = len.to_vec();
            telegram.resize(u32::from_be_bytes(len) as usize, 0);
            if stream.read_exact(&mut telegram[4..]).is_err() {
                return;
            }
            let request = parse_request(&telegram).unwrap();
            self.requests.lock().unwrap().push(request.clone());

            if self.hang_up.swap(false, SeqCst) {
                return;
            }
            if self.silent.load(SeqCst) {
                continue;
            }
            let reply = self.answer(&request);
            if stream.write_all(&reply).is_err() {
                return;
            }
        }
    }

    fn answer(&self, request: &Request) -> Vec<u8> {
        let mut memory = self.memory.lock().unwrap();
        let seq = request.sequence;
        if let Some(code) = memory.nak {
            return build_reply(seq, Attribute::AckNak, &code.to_be_bytes());
        }
        let addr = request.address;
        let bit = |b: Option<&bool>| vec![b.copied().unwrap_or(false) as u8];
        match request.command {
            2 => build_reply(seq, Attribute::Response, &bit(memory.flags.get(&addr))),
            3 => build_reply(seq, Attribute::Response, &bit(memory.inputs.get(&addr))),
            5 => build_reply(seq, Attribute::Response, &bit(memory.outputs.get(&addr))),
            6 => {
                let value = memory.registers.get(&addr).copied().unwrap_or(0);
                build_reply(seq, Attribute::Response, &value.to_be_bytes())
            }
            11 | 13 => {
                // fio-count, then the packed bits
                let value = request.data[1] & 1 == 1;
                if request.command == 11 {
                    memory.flags.insert(addr, value);
                } else {
                    memory.outputs.insert(addr, value);
                }
                build_reply(seq, Attribute::AckNak, &[0, 0])
            }
            14 => {
                let value = i32::from_be_bytes([
                    request.data[0],
                    request.data[1],
                    request.data[2],
                    request.data[3],
                ]);
                memory.registers.insert(addr, value);
                build_reply(seq, Attribute::AckNak, &[0, 0])
            }
            _ => build_reply(seq, Attribute::AckNak, &1i16.to_be_bytes()),
        }
    }
}
