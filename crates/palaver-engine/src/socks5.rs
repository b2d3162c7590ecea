//! SOCKS5 client handshake for bytestream relays.
//!
//! [`Socks5Handshake`] is the wire-level state machine: no sockets, just
//! bytes in and bytes out. [`Socks5Client`] drives one handshake over a
//! non-blocking TCP socket on the [`EventQueue`]. As a [`Socks5Prober`] it
//! only finds out whether a relay works and closes the socket; as a
//! [`Socks5Connector`] it hands the established socket over for a transfer.
//!
//! Relays address the peer by a domain name that is the hex SHA-1 of
//! `sid + initiator + target`, with port 0.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use sha1::{Digest, Sha1};
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::event_queue::{EventQueue, IdleObject};

pub const SOCKS5_VERSION: u8 = 0x05;

/// Greeting offering only the "no authentication" method.
pub const GREETING: [u8; 3] = [SOCKS5_VERSION, 0x01, 0x00];

const METHOD_NONE: u8 = 0x00;
const METHOD_REJECTED: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Why a handshake failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Socks5Error {
    #[error("unexpected SOCKS version {0}")]
    BadVersion(u8),

    #[error("relay accepts none of the offered authentication methods")]
    NoAcceptableMethod,

    #[error("relay selected unsupported authentication method {0:#04x}")]
    UnsupportedMethod(u8),

    #[error("relay refused the request: {reason}")]
    RequestRejected { code: u8, reason: &'static str },

    #[error("unsupported address type {0}")]
    BadAddressType(u8),

    #[error("relay sent more data than the reply holds")]
    UnexpectedData,

    #[error("connection closed during handshake")]
    Truncated,

    #[error("destination name longer than 255 bytes")]
    AddressTooLong,

    #[error("connection failed: {0}")]
    ConnectFailed(String),

    #[error("handshake timed out")]
    Timeout,

    #[error("event not valid in state {0:?}")]
    UnexpectedEvent(Socks5State),
}

impl From<io::Error> for Socks5Error {
    fn from(e: io::Error) -> Self {
        Self::ConnectFailed(e.to_string())
    }
}

fn reply_reason(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

/// Hex SHA-1 of `sid + initiator + target`, the destination name relays
/// use to pair the two sides of a bytestream.
pub fn destination_hash(sid: &str, initiator: &str, target: &str) -> String {
    let digest = Sha1::digest(format!("{sid}{initiator}{target}").as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Socks5State {
    /// TCP connect in progress.
    Connecting,
    /// Greeting written, waiting for the method selection.
    GreetingSent,
    /// Method accepted, connect request not yet written.
    GreetingReply,
    /// Connect request written, waiting for the reply header.
    RequestSent,
    /// Reply header seen, waiting for the rest of the bound address.
    RequestReply,
    Established,
    Failed,
}

/// Inputs to the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Socks5Event<'a> {
    Connected,
    Data(&'a [u8]),
    Closed,
}

/// What the handshake wants next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Socks5Step {
    Send(Vec<u8>),
    Wait,
    Established,
    Failed(Socks5Error),
}

/// Client side of a SOCKS5 CONNECT handshake.
#[derive(Debug)]
pub struct Socks5Handshake {
    state: Socks5State,
    destination: String,
    port: u16,
    inbound: Vec<u8>,
    early_data: Vec<u8>,
}

impl Socks5Handshake {
    /// Connects to `destination:port` by domain name.
    pub fn new(destination: impl Into<String>, port: u16) -> Result<Self, Socks5Error> {
        let destination = destination.into();
        if destination.len() > u8::MAX as usize {
            return Err(Socks5Error::AddressTooLong);
        }
        Ok(Self {
            state: Socks5State::Connecting,
            destination,
            port,
            inbound: Vec::new(),
            early_data: Vec::new(),
        })
    }

    pub fn state(&self) -> Socks5State {
        self.state
    }

    /// Bytes the relay sent after its reply, if any.
    pub fn early_data(&self) -> &[u8] {
        &self.early_data
    }

    /// The CONNECT request for our destination.
    pub fn request(&self) -> Vec<u8> {
        let mut req = Vec::with_capacity(7 + self.destination.len());
        req.extend_from_slice(&[SOCKS5_VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN]);
        req.push(self.destination.len() as u8);
        req.extend_from_slice(self.destination.as_bytes());
        req.extend_from_slice(&self.port.to_be_bytes());
        req
    }

    pub fn advance(&mut self, event: Socks5Event<'_>) -> Socks5Step {
        match (self.state, event) {
            (Socks5State::Connecting, Socks5Event::Connected) => {
                self.state = Socks5State::GreetingSent;
                Socks5Step::Send(GREETING.to_vec())
            }
            (
                Socks5State::GreetingSent | Socks5State::RequestSent | Socks5State::RequestReply,
                Socks5Event::Data(data),
            ) => {
                self.inbound.extend_from_slice(data);
                self.consume()
            }
            (Socks5State::Established | Socks5State::Failed, _) => Socks5Step::Wait,
            (_, Socks5Event::Closed) => self.fail(Socks5Error::Truncated),
            (state, _) => self.fail(Socks5Error::UnexpectedEvent(state)),
        }
    }

    fn fail(&mut self, err: Socks5Error) -> Socks5Step {
        self.state = Socks5State::Failed;
        Socks5Step::Failed(err)
    }

    fn consume(&mut self) -> Socks5Step {
        match self.state {
            Socks5State::GreetingSent => self.consume_method(),
            _ => self.consume_reply(),
        }
    }

    fn consume_method(&mut self) -> Socks5Step {
        match self.inbound.len() {
            0 | 1 => return Socks5Step::Wait,
            2 => {}
            _ => return self.fail(Socks5Error::UnexpectedData),
        }
        let (version, method) = (self.inbound[0], self.inbound[1]);
        self.inbound.clear();
        if version != SOCKS5_VERSION {
            return self.fail(Socks5Error::BadVersion(version));
        }
        match method {
            METHOD_NONE => {}
            METHOD_REJECTED => return self.fail(Socks5Error::NoAcceptableMethod),
            other => return self.fail(Socks5Error::UnsupportedMethod(other)),
        }
        self.state = Socks5State::GreetingReply;
        let request = self.request();
        self.state = Socks5State::RequestSent;
        Socks5Step::Send(request)
    }

    fn consume_reply(&mut self) -> Socks5Step {
        if self.inbound.len() < 4 {
            return Socks5Step::Wait;
        }
        let (version, code, atyp) = (self.inbound[0], self.inbound[1], self.inbound[3]);
        if version != SOCKS5_VERSION {
            return self.fail(Socks5Error::BadVersion(version));
        }
        if code != 0x00 {
            return self.fail(Socks5Error::RequestRejected {
                code,
                reason: reply_reason(code),
            });
        }
        let address_len = match atyp {
            ATYP_IPV4 => 4,
            ATYP_IPV6 => 16,
            ATYP_DOMAIN => match self.inbound.get(4) {
                Some(&len) => 1 + len as usize,
                None => {
                    self.state = Socks5State::RequestReply;
                    return Socks5Step::Wait;
                }
            },
            other => return self.fail(Socks5Error::BadAddressType(other)),
        };
        self.state = Socks5State::RequestReply;

        let total = 4 + address_len + 2;
        if self.inbound.len() < total {
            return Socks5Step::Wait;
        }
        self.early_data = self.inbound.split_off(total);
        self.inbound.clear();
        self.state = Socks5State::Established;
        Socks5Step::Established
    }
}

/// Outcome of one relay probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub relay: String,
    pub result: Result<(), Socks5Error>,
}

/// Where finished probes leave their reports for the engine to collect.
pub type ProbeInbox = Rc<RefCell<VecDeque<ProbeReport>>>;

/// A relayed or direct connection that completed its handshake.
#[derive(Debug)]
pub struct EstablishedStream {
    /// Still non-blocking and no longer plugged into any queue.
    pub socket: Socket,
    /// Payload the other side sent right behind the SOCKS5 reply.
    pub early_data: Vec<u8>,
}

/// Outcome of a handshake started for a transfer.
#[derive(Debug)]
pub struct TransferReport {
    pub sid: String,
    pub result: Result<EstablishedStream, Socks5Error>,
}

pub type TransferInbox = Rc<RefCell<VecDeque<TransferReport>>>;

/// Receives the result of a finished handshake.
pub trait HandshakeSink {
    fn deliver(&mut self, label: &str, result: Result<EstablishedStream, Socks5Error>);
}

impl HandshakeSink for ProbeInbox {
    fn deliver(&mut self, label: &str, result: Result<EstablishedStream, Socks5Error>) {
        // the probe socket is closed here
        let result = result.map(drop);
        match result {
            Ok(()) => info!(relay = %label, "relay probe succeeded"),
            Err(ref e) => warn!(relay = %label, error = %e, "relay probe failed"),
        }
        self.borrow_mut().push_back(ProbeReport {
            relay: label.to_string(),
            result,
        });
    }
}

impl HandshakeSink for TransferInbox {
    fn deliver(&mut self, label: &str, result: Result<EstablishedStream, Socks5Error>) {
        match result {
            Ok(ref stream) => info!(sid = %label, early = stream.early_data.len(), "bytestream established"),
            Err(ref e) => warn!(sid = %label, error = %e, "bytestream handshake failed"),
        }
        self.borrow_mut().push_back(TransferReport {
            sid: label.to_string(),
            result,
        });
    }
}

/// Drives one [`Socks5Handshake`] over a non-blocking TCP socket on the
/// [`EventQueue`] and hands the outcome to its sink.
pub struct Socks5Client<S> {
    label: String,
    fd: RawFd,
    socket: Option<Socket>,
    handshake: Socks5Handshake,
    outbound: Vec<u8>,
    sink: S,
}

/// Runs one throwaway handshake against a relay.
pub type Socks5Prober = Socks5Client<ProbeInbox>;

/// Runs the handshake of an actual transfer and keeps the socket.
pub type Socks5Connector = Socks5Client<TransferInbox>;

impl Socks5Client<ProbeInbox> {
    /// Starts a non-blocking connect to `addr` and plugs the prober into the
    /// queue. The whole handshake must finish within `timeout`.
    ///
    /// Fails immediately if the socket cannot be created or the connect is
    /// refused synchronously; nothing is reported to the inbox in that case.
    pub fn start(
        queue: &mut EventQueue,
        relay: impl Into<String>,
        addr: SocketAddr,
        destination: &str,
        timeout: Duration,
        inbox: ProbeInbox,
    ) -> Result<RawFd, Socks5Error> {
        Self::connect(queue, relay.into(), addr, destination, timeout, inbox)
    }
}

impl Socks5Client<TransferInbox> {
    /// Connects to the chosen streamhost for stream `sid`. The established
    /// socket lands in `inbox` together with any data that followed the
    /// reply.
    pub fn start(
        queue: &mut EventQueue,
        sid: impl Into<String>,
        addr: SocketAddr,
        destination: &str,
        timeout: Duration,
        inbox: TransferInbox,
    ) -> Result<RawFd, Socks5Error> {
        Self::connect(queue, sid.into(), addr, destination, timeout, inbox)
    }
}

impl<S: HandshakeSink + 'static> Socks5Client<S> {
    fn connect(
        queue: &mut EventQueue,
        label: String,
        addr: SocketAddr,
        destination: &str,
        timeout: Duration,
        sink: S,
    ) -> Result<RawFd, Socks5Error> {
        let handshake = Socks5Handshake::new(destination, 0)?;
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(e)
                if e.raw_os_error() == Some(libc::EINPROGRESS)
                    || e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e.into()),
        }

        let fd = socket.as_raw_fd();
        debug!(label = %label, addr = %addr, fd = fd, "starting SOCKS5 handshake");
        let client = Rc::new(RefCell::new(Self {
            label,
            fd,
            socket: Some(socket),
            handshake,
            outbound: Vec::new(),
            sink,
        }));
        queue.plug(client, true, false);
        queue.set_read_timeout(fd, timeout);
        Ok(fd)
    }
}

impl<S: HandshakeSink> Socks5Client<S> {
    fn step(&mut self, queue: &mut EventQueue, step: Socks5Step) {
        match step {
            Socks5Step::Send(bytes) => {
                self.outbound.extend_from_slice(&bytes);
                self.flush(queue);
            }
            Socks5Step::Wait => {}
            Socks5Step::Established => self.finish(queue, Ok(())),
            Socks5Step::Failed(err) => self.finish(queue, Err(err)),
        }
    }

    fn flush(&mut self, queue: &mut EventQueue) {
        let Some(socket) = self.socket.as_mut() else {
            return;
        };
        while !self.outbound.is_empty() {
            match socket.write(&self.outbound) {
                Ok(n) => {
                    self.outbound.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return self.finish(queue, Err(e.into())),
            }
        }
        let want_write = !self.outbound.is_empty();
        queue.update_interest(self.fd, want_write, !want_write);
    }

    fn finish(&mut self, queue: &mut EventQueue, result: Result<(), Socks5Error>) {
        let Some(socket) = self.socket.take() else {
            return;
        };
        queue.remove_timeout(self.fd);
        queue.unplug(self.fd);
        let result = result.map(|()| EstablishedStream {
            socket,
            early_data: std::mem::take(&mut self.handshake.early_data),
        });
        self.sink.deliver(&self.label, result);
    }
}

impl<S: HandshakeSink> IdleObject for Socks5Client<S> {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn pollout(&mut self, queue: &mut EventQueue) {
        if self.handshake.state() != Socks5State::Connecting {
            self.flush(queue);
            return;
        }
        let pending = match self.socket.as_ref().map(Socket::take_error) {
            Some(Ok(None)) => None,
            Some(Ok(Some(e))) | Some(Err(e)) => Some(e),
            None => return,
        };
        if let Some(e) = pending {
            return self.finish(queue, Err(e.into()));
        }
        let step = self.handshake.advance(Socks5Event::Connected);
        self.step(queue, step);
    }

    fn pollin(&mut self, queue: &mut EventQueue) {
        let mut buf = [0u8; 512];
        loop {
            let Some(socket) = self.socket.as_mut() else {
                return;
            };
            let step = match socket.read(&mut buf) {
                Ok(0) => self.handshake.advance(Socks5Event::Closed),
                Ok(n) => self.handshake.advance(Socks5Event::Data(&buf[..n])),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => return self.finish(queue, Err(e.into())),
            };
            let terminal = !matches!(step, Socks5Step::Wait | Socks5Step::Send(_));
            self.step(queue, step);
            if terminal {
                return;
            }
        }
    }

    fn pollend(&mut self, queue: &mut EventQueue) {
        self.finish(queue, Err(Socks5Error::ConnectFailed("connection reset".into())));
    }

    fn read_timeout(&mut self, queue: &mut EventQueue) {
        self.finish(queue, Err(Socks5Error::Timeout));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;
    use std::time::Instant;

    const HASH: &str = "a9993e364706816aba3e25717850c26c9cd0d89d";

    #[test]
    fn destination_hash_is_hex_sha1() {
        assert_eq!(destination_hash("a", "b", "c"), HASH);
        assert_eq!(destination_hash("", "", ""), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
    }

    #[test]
    fn request_encodes_domain_and_port() {
        let hs = Socks5Handshake::new("abc", 0).expect("handshake");
        assert_eq!(hs.request(), vec![5, 1, 0, 3, 3, b'a', b'b', b'c', 0, 0]);
        assert!(matches!(
            Socks5Handshake::new("x".repeat(256), 0),
            Err(Socks5Error::AddressTooLong)
        ));
    }

    #[test]
    fn happy_path_with_split_replies() {
        let mut hs = Socks5Handshake::new(HASH, 0).expect("handshake");
        assert_eq!(hs.advance(Socks5Event::Connected), Socks5Step::Send(GREETING.to_vec()));
        assert_eq!(hs.state(), Socks5State::GreetingSent);

        assert_eq!(hs.advance(Socks5Event::Data(&[5])), Socks5Step::Wait);
        let request = hs.advance(Socks5Event::Data(&[0]));
        assert_eq!(request, Socks5Step::Send(hs.request()));
        assert_eq!(hs.state(), Socks5State::RequestSent);

        let mut reply = vec![5, 0, 0, 3, 40];
        reply.extend_from_slice(HASH.as_bytes());
        reply.extend_from_slice(&[0, 0, b'x']);
        assert_eq!(hs.advance(Socks5Event::Data(&reply[..6])), Socks5Step::Wait);
        assert_eq!(hs.state(), Socks5State::RequestReply);
        assert_eq!(hs.advance(Socks5Event::Data(&reply[6..])), Socks5Step::Established);
        assert_eq!(hs.early_data(), b"x");
    }

    #[test]
    fn ipv4_reply() {
        let mut hs = Socks5Handshake::new(HASH, 0).expect("handshake");
        hs.advance(Socks5Event::Connected);
        hs.advance(Socks5Event::Data(&[5, 0]));
        assert_eq!(
            hs.advance(Socks5Event::Data(&[5, 0, 0, 1, 127, 0, 0, 1, 0x04, 0x38])),
            Socks5Step::Established
        );
    }

    #[test]
    fn method_rejection_fails_without_request() {
        let mut hs = Socks5Handshake::new(HASH, 0).expect("handshake");
        hs.advance(Socks5Event::Connected);
        assert_eq!(
            hs.advance(Socks5Event::Data(&[5, 0xFF])),
            Socks5Step::Failed(Socks5Error::NoAcceptableMethod)
        );
        assert_eq!(hs.state(), Socks5State::Failed);
        assert_eq!(hs.advance(Socks5Event::Data(&[5, 0])), Socks5Step::Wait);
    }

    #[test]
    fn malformed_replies_are_named() {
        let mut hs = Socks5Handshake::new(HASH, 0).expect("handshake");
        hs.advance(Socks5Event::Connected);
        assert_eq!(
            hs.advance(Socks5Event::Data(&[4, 0])),
            Socks5Step::Failed(Socks5Error::BadVersion(4))
        );

        let mut hs = Socks5Handshake::new(HASH, 0).expect("handshake");
        hs.advance(Socks5Event::Connected);
        assert_eq!(
            hs.advance(Socks5Event::Data(&[5, 0, 0])),
            Socks5Step::Failed(Socks5Error::UnexpectedData)
        );

        let mut hs = Socks5Handshake::new(HASH, 0).expect("handshake");
        hs.advance(Socks5Event::Connected);
        hs.advance(Socks5Event::Data(&[5, 0]));
        let rejected = hs.advance(Socks5Event::Data(&[5, 5, 0, 1]));
        assert_eq!(
            rejected,
            Socks5Step::Failed(Socks5Error::RequestRejected {
                code: 5,
                reason: "connection refused"
            })
        );
        if let Socks5Step::Failed(err) = rejected {
            assert_eq!(err.to_string(), "relay refused the request: connection refused");
        }

        let mut hs = Socks5Handshake::new(HASH, 0).expect("handshake");
        hs.advance(Socks5Event::Connected);
        hs.advance(Socks5Event::Data(&[5, 0]));
        hs.advance(Socks5Event::Data(&[5, 0, 0, 3]));
        assert_eq!(
            hs.advance(Socks5Event::Closed),
            Socks5Step::Failed(Socks5Error::Truncated)
        );
    }

    #[test]
    fn data_before_connect_is_unexpected() {
        let mut hs = Socks5Handshake::new(HASH, 0).expect("handshake");
        assert_eq!(
            hs.advance(Socks5Event::Data(&[5, 0])),
            Socks5Step::Failed(Socks5Error::UnexpectedEvent(Socks5State::Connecting))
        );
    }

    fn run_until_report(queue: &mut EventQueue, inbox: &ProbeInbox) -> ProbeReport {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            queue.process().expect("process");
            if let Some(report) = inbox.borrow_mut().pop_front() {
                return report;
            }
            assert!(Instant::now() < deadline, "probe did not finish");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn probe_against_rejecting_relay_closes_without_request() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let relay = thread::spawn(move || {
            let (mut conn, _) = listener.accept().expect("accept");
            let mut greeting = [0u8; 3];
            conn.read_exact(&mut greeting).expect("greeting");
            conn.write_all(&[5, 0xFF]).expect("method reply");
            let mut rest = Vec::new();
            conn.read_to_end(&mut rest).expect("read until close");
            (greeting, rest)
        });

        let mut queue = EventQueue::new();
        let inbox = ProbeInbox::default();
        let fd = Socks5Prober::start(
            &mut queue,
            "proxy.example.com",
            addr,
            HASH,
            Duration::from_secs(5),
            inbox.clone(),
        )
        .expect("connect started");

        let report = run_until_report(&mut queue, &inbox);
        assert_eq!(report.relay, "proxy.example.com");
        assert_eq!(report.result, Err(Socks5Error::NoAcceptableMethod));
        assert!(!queue.is_registered(fd));

        let (greeting, rest) = relay.join().expect("relay thread");
        assert_eq!(greeting, GREETING);
        assert!(rest.is_empty(), "request bytes were sent: {rest:?}");
    }

    #[test]
    fn probe_against_working_relay() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let relay = thread::spawn(move || {
            let (mut conn, _) = listener.accept().expect("accept");
            let mut greeting = [0u8; 3];
            conn.read_exact(&mut greeting).expect("greeting");
            conn.write_all(&[5, 0]).expect("method reply");
            let mut request = vec![0u8; 7 + HASH.len()];
            conn.read_exact(&mut request).expect("request");
            let mut reply = vec![5, 0, 0, 3, HASH.len() as u8];
            reply.extend_from_slice(HASH.as_bytes());
            reply.extend_from_slice(&[0, 0]);
            conn.write_all(&reply).expect("reply");
            request
        });

        let mut queue = EventQueue::new();
        let inbox = ProbeInbox::default();
        Socks5Prober::start(&mut queue, "relay", addr, HASH, Duration::from_secs(5), inbox.clone())
            .expect("connect started");

        let report = run_until_report(&mut queue, &inbox);
        assert_eq!(report.result, Ok(()));
        assert!(queue.is_empty());

        let request = relay.join().expect("relay thread");
        assert_eq!(&request[..5], &[5, 1, 0, 3, 40]);
        assert_eq!(&request[5..45], HASH.as_bytes());
        assert_eq!(&request[45..], &[0, 0]);
    }

    #[test]
    fn connector_keeps_socket_and_early_data() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let relay = thread::spawn(move || {
            let (mut conn, _) = listener.accept().expect("accept");
            let mut greeting = [0u8; 3];
            conn.read_exact(&mut greeting).expect("greeting");
            conn.write_all(&[5, 0]).expect("method reply");
            let mut request = vec![0u8; 7 + HASH.len()];
            conn.read_exact(&mut request).expect("request");
            let mut reply = vec![5, 0, 0, 3, HASH.len() as u8];
            reply.extend_from_slice(HASH.as_bytes());
            reply.extend_from_slice(&[0, 0]);
            reply.extend_from_slice(b"hello");
            conn.write_all(&reply).expect("reply");

            let mut upload = [0u8; 4];
            conn.read_exact(&mut upload).expect("payload");
            upload
        });

        let mut queue = EventQueue::new();
        let inbox = TransferInbox::default();
        Socks5Connector::start(&mut queue, "sid-1", addr, HASH, Duration::from_secs(5), inbox.clone())
            .expect("connect started");

        let deadline = Instant::now() + Duration::from_secs(5);
        let report = loop {
            queue.process().expect("process");
            if let Some(report) = inbox.borrow_mut().pop_front() {
                break report;
            }
            assert!(Instant::now() < deadline, "handshake did not finish");
            thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(report.sid, "sid-1");
        assert!(queue.is_empty());

        let mut stream = report.result.expect("established");
        let mut early = stream.early_data.clone();
        // The greeting payload may be split across reads.
        while early.len() < 5 {
            let mut buf = [0u8; 16];
            match stream.socket.read(&mut buf) {
                Ok(n) => early.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(Duration::from_millis(5)),
                Err(e) => panic!("read failed: {e}"),
            }
        }
        assert_eq!(early, b"hello");

        stream.socket.set_nonblocking(false).expect("blocking");
        stream.socket.write_all(b"data").expect("write");
        assert_eq!(&relay.join().expect("relay thread"), b"data");
    }

    #[test]
    fn connector_reports_failure_without_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let relay = thread::spawn(move || {
            let (mut conn, _) = listener.accept().expect("accept");
            let mut greeting = [0u8; 3];
            conn.read_exact(&mut greeting).expect("greeting");
            conn.write_all(&[5, 0xFF]).expect("method reply");
        });

        let mut queue = EventQueue::new();
        let inbox = TransferInbox::default();
        let fd = Socks5Connector::start(&mut queue, "sid-2", addr, HASH, Duration::from_secs(5), inbox.clone())
            .expect("connect started");

        let deadline = Instant::now() + Duration::from_secs(5);
        let report = loop {
            queue.process().expect("process");
            if let Some(report) = inbox.borrow_mut().pop_front() {
                break report;
            }
            assert!(Instant::now() < deadline, "handshake did not finish");
            thread::sleep(Duration::from_millis(5));
        };
        assert!(matches!(report.result, Err(Socks5Error::NoAcceptableMethod)));
        assert!(!queue.is_registered(fd));
        relay.join().expect("relay thread");
    }

    #[test]
    fn probe_against_closed_port_fails() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
            listener.local_addr().expect("addr")
        };

        let mut queue = EventQueue::new();
        let inbox = ProbeInbox::default();
        match Socks5Prober::start(&mut queue, "relay", addr, HASH, Duration::from_secs(5), inbox.clone()) {
            Err(err) => assert!(matches!(err, Socks5Error::ConnectFailed(_))),
            Ok(_) => {
                let report = run_until_report(&mut queue, &inbox);
                assert!(matches!(report.result, Err(Socks5Error::ConnectFailed(_))));
            }
        }
    }
}
