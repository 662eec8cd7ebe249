//! Shared fixtures: an in-process fake meter and an instrumented transport

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_modbus::prelude::{ExceptionCode, Request, Response};

use meterbridge::gateway::{self, GatewaySession, RetryPolicy};
use meterbridge::modbus::{RawRegisterValue, ReadError, Transport};
use meterbridge::registers::{Register, HOLDING_REGISTERS, INPUT_REGISTERS};

pub fn float_words(v: f32) -> [u16; 2] {
    let bits = v.to_bits();
    [(bits >> 16) as u16, bits as u16]
}

/// Value the fake meter reports for a catalog register
pub fn meter_value(register: &Register) -> f32 {
    register.id as f32 + 0.25
}

/// Fake SDM72D answering reads from fixed register tables
#[derive(Clone)]
pub struct FakeMeter {
    input: Arc<HashMap<u16, u16>>,
    holding: Arc<HashMap<u16, u16>>,
}

impl FakeMeter {
    pub fn sdm72d() -> Self {
        let table = |registers: &[Register]| {
            let mut map = HashMap::new();
            for register in registers {
                let [hi, lo] = float_words(meter_value(register));
                map.insert(register.address(), hi);
                map.insert(register.address() + 1, lo);
            }
            Arc::new(map)
        };

        Self {
            input: table(INPUT_REGISTERS),
            holding: table(HOLDING_REGISTERS),
        }
    }

    fn read(map: &HashMap<u16, u16>, addr: u16, cnt: u16) -> Result<Vec<u16>, ExceptionCode> {
        (0..cnt)
            .map(|i| {
                map.get(&(addr + i))
                    .copied()
                    .ok_or(ExceptionCode::IllegalDataAddress)
            })
            .collect()
    }
}

impl tokio_modbus::server::Service for FakeMeter {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        let res = match req {
            Request::ReadInputRegisters(addr, cnt) => {
                Self::read(&self.input, addr, cnt).map(Response::ReadInputRegisters)
            }
            Request::ReadHoldingRegisters(addr, cnt) => {
                Self::read(&self.holding, addr, cnt).map(Response::ReadHoldingRegisters)
            }
            _ => Err(ExceptionCode::IllegalFunction),
        };
        future::ready(res)
    }
}

fn bind_local() -> (std::net::TcpListener, SocketAddr) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Run the fake meter as a Modbus TCP server on its own thread
pub fn spawn_fake_meter_tcp() -> SocketAddr {
    use tokio_modbus::server::tcp::{accept_tcp_connection, Server};

    let (std_listener, addr) = bind_local();
    thread::spawn(move || {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async move {
            let server = Server::new(TcpListener::from_std(std_listener).unwrap());
            let new_service = |_socket_addr: SocketAddr| Ok(Some(FakeMeter::sdm72d()));
            let on_connected = |stream: TcpStream, socket_addr: SocketAddr| async move {
                accept_tcp_connection(stream, socket_addr, new_service)
            };
            let _ = server.serve(&on_connected, |_err: std::io::Error| {}).await;
        });
    });
    addr
}

/// Run the fake meter as an RTU-over-TCP server on its own thread
pub fn spawn_fake_meter_rtu_over_tcp() -> SocketAddr {
    use tokio_modbus::server::rtu_over_tcp::{accept_tcp_connection, Server};

    let (std_listener, addr) = bind_local();
    thread::spawn(move || {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async move {
            let server = Server::new(TcpListener::from_std(std_listener).unwrap());
            let new_service = |_socket_addr: SocketAddr| Ok(Some(FakeMeter::sdm72d()));
            let on_connected = |stream: TcpStream, socket_addr: SocketAddr| async move {
                accept_tcp_connection(stream, socket_addr, new_service)
            };
            let _ = server.serve(&on_connected, |_err: std::io::Error| {}).await;
        });
    });
    addr
}

/// A peer that accepts connections and never answers
pub fn spawn_silent_peer() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let mut held = Vec::new();
        for stream in listener.incoming().flatten() {
            held.push(stream);
        }
    });
    addr
}

/// Modbus CRC-16, appended low byte first
pub fn crc16(frame: &[u8]) -> u16 {
    let mut crc = 0xFFFFu16;
    for &byte in frame {
        crc ^= byte as u16;
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xA001
            } else {
                crc >> 1
            };
        }
    }
    crc
}

/// RTU-over-TCP peer answering input reads with `0x1111 * (address / 10)` in
/// the first word. Reads of `slow_address` are answered only after `lag`.
pub fn spawn_lagging_rtu_peer(slow_address: u16, lag: Duration) -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            thread::spawn(move || serve_rtu_reads(stream, slow_address, lag));
        }
    });
    addr
}

fn serve_rtu_reads(mut stream: std::net::TcpStream, slow_address: u16, lag: Duration) {
    use std::io::{Read, Write};

    let mut request = [0u8; 8];
    while stream.read_exact(&mut request).is_ok() {
        let address = u16::from_be_bytes([request[2], request[3]]);
        let count = u16::from_be_bytes([request[4], request[5]]);
        if address == slow_address {
            thread::sleep(lag);
        }

        let mut frame = vec![request[0], request[1], (count * 2) as u8];
        for i in 0..count {
            let word = if i == 0 { 0x1111 * (address / 10) } else { 0 };
            frame.extend_from_slice(&word.to_be_bytes());
        }
        let crc = crc16(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        if stream.write_all(&frame).is_err() {
            break;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    SetUnit(u8),
    Read(u16),
}

/// What a [`ScriptedTransport`] observed
#[derive(Default)]
pub struct Stats {
    pub reads: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub events: Mutex<Vec<Event>>,
}

impl Stats {
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

type Responder = Box<dyn FnMut(usize, u16) -> Result<RawRegisterValue, ReadError> + Send>;

/// Transport stub that records every call and answers through a closure
/// receiving the 1-based read number and the address.
pub struct ScriptedTransport {
    stats: Arc<Stats>,
    delay: Duration,
    responder: Responder,
}

impl ScriptedTransport {
    pub fn new<F>(responder: F) -> (Self, Arc<Stats>)
    where
        F: FnMut(usize, u16) -> Result<RawRegisterValue, ReadError> + Send + 'static,
    {
        let stats = Arc::new(Stats::default());
        let transport = Self {
            stats: stats.clone(),
            delay: Duration::ZERO,
            responder: Box::new(responder),
        };
        (transport, stats)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    async fn read(&mut self, address: u16) -> Result<RawRegisterValue, ReadError> {
        let n = self.stats.reads.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.events.lock().unwrap().push(Event::Read(address));

        let now = self.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if self.delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.delay).await;
        }
        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);

        (self.responder)(n, address)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn set_unit_id(&mut self, unit_id: u8) {
        self.stats.events.lock().unwrap().push(Event::SetUnit(unit_id));
    }

    async fn read_holding(
        &mut self,
        address: u16,
        _words: u16,
    ) -> Result<RawRegisterValue, ReadError> {
        self.read(address).await
    }

    async fn read_input(
        &mut self,
        address: u16,
        _words: u16,
    ) -> Result<RawRegisterValue, ReadError> {
        self.read(address).await
    }
}

pub fn timeout_error() -> ReadError {
    ReadError::Timeout(Duration::from_millis(3000))
}

/// Run a gateway over `transport` on its own thread, returning its address
pub fn spawn_gateway<T: Transport + 'static>(transport: T, unit_id: u8) -> SocketAddr {
    let (std_listener, addr) = bind_local();
    thread::spawn(move || {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async move {
            let session = GatewaySession::new(transport, unit_id, RetryPolicy::default());
            let listener = TcpListener::from_std(std_listener).unwrap();
            let _ = gateway::run(listener, session, 32).await;
        });
    });
    addr
}
