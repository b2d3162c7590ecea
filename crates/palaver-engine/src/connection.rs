//! One signaling connection on the event loop.
//!
//! A [`Connection`] owns the transport, the stanza dispatcher and the
//! stream management session for that stream. Handlers never touch shared
//! engine state: they leave [`ConnectionReport`]s that the engine collects
//! after each pass.

use std::fmt;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use palaver_protocol::dispatcher::{
    Dispatcher, Handled, HandlerId, HandlerSpec, Outbox, ProcessOutcome,
};
use palaver_protocol::ns::NS_CLIENT;
use palaver_protocol::sm::{self, SmEvent, SmState};
use palaver_protocol::stream::STREAM_FOOTER;
use palaver_protocol::{Element, SmNotice, Stanza, StreamManaged, StreamManagement};
use tracing::{debug, info, warn};

use crate::caps::CapsKey;
use crate::config::EngineConfig;
use crate::event_queue::{EventQueue, IdleObject};

const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A non-blocking byte stream with a pollable descriptor. TLS and friends
/// live behind this.
pub trait Transport: Read + Write + AsRawFd {}

impl<T: Read + Write + AsRawFd> Transport for T {}

/// Something a handler observed that the engine must act on.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionReport {
    RelayDiscovered { proxy: String, response: Element },
    RelayDiscoveryFailed { proxy: String },
    DiscoInfo { entity: String, key: CapsKey, response: Element },
    DiscoInfoFailed { entity: String, key: CapsKey },
    StreamManagement(SmNotice),
    Closed,
}

/// Per-connection state handed to stanza handlers.
#[derive(Debug, Default)]
pub struct ConnectionState {
    sm: StreamManagement,
    reports: Vec<ConnectionReport>,
    jid: Option<String>,
}

impl ConnectionState {
    pub fn report(&mut self, report: ConnectionReport) {
        self.reports.push(report);
    }

    pub fn jid(&self) -> Option<&str> {
        self.jid.as_deref()
    }
}

impl StreamManaged for ConnectionState {
    fn stream_management(&mut self) -> &mut StreamManagement {
        &mut self.sm
    }

    fn on_stream_management(&mut self, notice: SmNotice) {
        self.reports.push(ConnectionReport::StreamManagement(notice));
    }
}

pub struct Connection {
    id: ConnectionId,
    server: String,
    lang: String,
    resume: bool,
    negotiation_timeout: Duration,
    transport: Option<Box<dyn Transport>>,
    fd: RawFd,
    dispatcher: Dispatcher<ConnectionState>,
    state: ConnectionState,
    write_buf: Vec<u8>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("server", &self.server)
            .field("fd", &self.fd)
            .field("sm", &self.state.sm.state())
            .finish()
    }
}

impl Connection {
    /// Creates a detached connection to `server`.
    pub fn new(id: ConnectionId, server: impl Into<String>, config: &EngineConfig) -> Self {
        let mut dispatcher = Dispatcher::new(NS_CLIENT);
        sm::register_handlers(&mut dispatcher);
        Self {
            id,
            server: server.into(),
            lang: config.lang.clone(),
            resume: config.stream_management.resume,
            negotiation_timeout: config.negotiation_timeout(),
            transport: None,
            fd: -1,
            dispatcher,
            state: ConnectionState {
                sm: StreamManagement::new(config.stream_management.ack_every),
                ..ConnectionState::default()
            },
            write_buf: Vec::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    pub fn stream_management(&self) -> &StreamManagement {
        &self.state.sm
    }

    /// Our own address, once bound.
    pub fn jid(&self) -> Option<&str> {
        self.state.jid()
    }

    pub fn set_bound_jid(&mut self, jid: impl Into<String>) {
        let jid = jid.into();
        self.dispatcher.outbox().set_bound_jid(Some(jid.clone()));
        self.state.jid = Some(jid);
    }

    /// Installs a fresh transport and queues our stream header. The caller
    /// plugs the connection into the queue afterwards.
    ///
    /// The transport must already be non-blocking.
    pub fn attach(&mut self, transport: Box<dyn Transport>) -> RawFd {
        self.fd = transport.as_raw_fd();
        self.transport = Some(transport);
        self.dispatcher.restart();
        self.write_buf.clear();
        self.write_buf
            .extend_from_slice(self.dispatcher.stream_header(&self.server, &self.lang).as_bytes());
        info!(connection = %self.id, fd = self.fd, server = %self.server, "transport attached");
        self.fd
    }

    pub fn register_handler<F>(&mut self, spec: HandlerSpec, callback: F) -> HandlerId
    where
        F: FnMut(&mut ConnectionState, &Stanza, &mut Outbox<ConnectionState>) -> Handled + 'static,
    {
        self.dispatcher.register_handler(spec, callback)
    }

    pub fn send(&mut self, element: Element) -> Option<String> {
        self.dispatcher.send(element)
    }

    /// Sends an iq and turns its reply into a report.
    pub fn request<F>(&mut self, element: Element, on_reply: F) -> String
    where
        F: FnOnce(&Stanza) -> ConnectionReport + 'static,
    {
        self.dispatcher
            .send_and_call_for_response(element, move |state: &mut ConnectionState, reply, _| {
                state.report(on_reply(reply));
            })
    }

    /// Asks the server to enable stream management.
    pub fn enable_stream_management(&mut self, queue: &mut EventQueue) {
        let actions = self.state.sm.advance(SmEvent::Negotiate { resume: self.resume });
        self.apply(queue, actions);
        if self.is_connected() {
            queue.set_read_timeout(self.fd, self.negotiation_timeout);
        }
    }

    /// Asks the server to resume the previous session on this transport.
    pub fn resume_stream_management(&mut self, queue: &mut EventQueue) {
        let actions = self.state.sm.advance(SmEvent::Resume);
        let waiting = self.is_connected() && self.state.sm.state() == SmState::Resuming;
        self.apply(queue, actions);
        if waiting {
            queue.set_read_timeout(self.fd, self.negotiation_timeout);
        }
    }

    /// Asks the server how much it has received.
    pub fn request_ack(&mut self, queue: &mut EventQueue) {
        if self.state.sm.is_enabled() {
            let request = self.state.sm.request_ack();
            self.dispatcher.outbox().send_control(request);
            self.flush(queue);
        }
    }

    pub fn take_reports(&mut self) -> Vec<ConnectionReport> {
        std::mem::take(&mut self.state.reports)
    }

    /// Writes queued output.
    ///
    /// While detached, stanzas still pass through stream management so an
    /// enabled session replays them after resumption; without a session
    /// they are dropped.
    pub fn flush(&mut self, queue: &mut EventQueue) {
        for item in self.dispatcher.outbox().drain() {
            for element in self.state.sm.track_outgoing(item) {
                if self.transport.is_some() {
                    self.write_buf
                        .extend_from_slice(element.to_xml_in(NS_CLIENT).as_bytes());
                } else if !self.state.sm.is_enabled() {
                    warn!(connection = %self.id, name = element.name(), "dropping stanza while disconnected");
                }
            }
        }
        self.write_pending(queue);
    }

    /// Closes our side of the stream and drops the transport.
    pub fn close(&mut self, queue: &mut EventQueue) {
        if self.transport.is_none() {
            return;
        }
        self.flush(queue);
        self.write_buf.extend_from_slice(STREAM_FOOTER.as_bytes());
        self.write_pending(queue);
        self.lost(queue);
    }

    fn apply(&mut self, queue: &mut EventQueue, actions: Vec<sm::SmAction>) {
        sm::apply_actions(&mut self.state, actions, self.dispatcher.outbox());
        self.flush(queue);
    }

    fn write_pending(&mut self, queue: &mut EventQueue) {
        let result = match self.transport.as_mut() {
            Some(transport) => write_some(transport.as_mut(), &mut self.write_buf),
            None => return,
        };
        match result {
            Ok(()) => {
                let want_write = !self.write_buf.is_empty();
                queue.update_interest(self.fd, want_write, true);
            }
            Err(e) => {
                warn!(connection = %self.id, error = %e, "write failed");
                self.lost(queue);
            }
        }
    }

    /// The transport is gone. Pending output is discarded; the session
    /// keeps its unacknowledged queue for resumption.
    fn lost(&mut self, queue: &mut EventQueue) {
        if self.transport.take().is_none() {
            return;
        }
        queue.unplug(self.fd);
        info!(connection = %self.id, fd = self.fd, "connection closed");
        self.fd = -1;
        self.write_buf.clear();
        self.state.sm.advance(SmEvent::TransportLost);
        self.state.reports.push(ConnectionReport::Closed);
    }

    /// Drops the negotiation timeout once the server answered.
    fn settle_timeout(&mut self, queue: &mut EventQueue) {
        let waiting = matches!(self.state.sm.state(), SmState::Negotiating | SmState::Resuming);
        if !waiting && queue.has_timeout(self.fd) {
            queue.remove_timeout(self.fd);
        }
    }
}

impl IdleObject for Connection {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn pollin(&mut self, queue: &mut EventQueue) {
        let mut data = Vec::new();
        let status = match self.transport.as_mut() {
            Some(transport) => read_available(transport.as_mut(), &mut data),
            None => return,
        };

        let mut closed = false;
        if !data.is_empty() {
            match self.dispatcher.process_nonblocking(&mut self.state, &data) {
                Ok(ProcessOutcome::Disconnected) => closed = true,
                Ok(_) => {}
                Err(e) => {
                    warn!(connection = %self.id, error = %e, "stream failed");
                    closed = true;
                }
            }
        }
        self.settle_timeout(queue);
        self.flush(queue);

        match status {
            Ok(true) => {
                debug!(connection = %self.id, "peer closed the transport");
                self.lost(queue);
            }
            Err(e) => {
                warn!(connection = %self.id, error = %e, "read failed");
                self.lost(queue);
            }
            Ok(false) if closed => self.lost(queue),
            Ok(false) => {}
        }
    }

    fn pollout(&mut self, queue: &mut EventQueue) {
        self.flush(queue);
    }

    fn pollend(&mut self, queue: &mut EventQueue) {
        self.lost(queue);
    }

    fn read_timeout(&mut self, queue: &mut EventQueue) {
        let actions = self.state.sm.advance(SmEvent::Timeout);
        self.apply(queue, actions);
    }
}

/// Reads until the transport would block. Returns true on end of stream.
fn read_available(transport: &mut dyn Transport, into: &mut Vec<u8>) -> io::Result<bool> {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match transport.read(&mut buf) {
            Ok(0) => return Ok(true),
            Ok(n) => into.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Writes until done or the transport would block.
fn write_some(transport: &mut dyn Transport, buf: &mut Vec<u8>) -> io::Result<()> {
    while !buf.is_empty() {
        match transport.write(buf) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                buf.drain(..n);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;

    use palaver_protocol::ns::NS_SM;

    const SERVER_HEADER: &str = "<stream:stream xmlns='jabber:client' \
        xmlns:stream='http://etherx.jabber.org/streams' id='s1' from='example.com' version='1.0'>";

    struct Harness {
        queue: EventQueue,
        conn: Rc<RefCell<Connection>>,
        server: UnixStream,
    }

    impl Harness {
        fn new(config: &EngineConfig) -> Self {
            let (client, server) = UnixStream::pair().expect("socketpair");
            client.set_nonblocking(true).expect("nonblocking");
            server.set_nonblocking(true).expect("nonblocking");

            let conn = Rc::new(RefCell::new(Connection::new(ConnectionId::new(1), "example.com", config)));
            conn.borrow_mut().attach(Box::new(client));
            let mut queue = EventQueue::new();
            queue.plug(conn.clone(), true, true);
            Self { queue, conn, server }
        }

        fn pass(&mut self) {
            self.queue.process().expect("process");
        }

        fn server_reads(&mut self) -> String {
            self.pass();
            let mut out = Vec::new();
            read_available(&mut self.server, &mut out).expect("server read");
            String::from_utf8(out).expect("utf-8")
        }

        fn server_writes(&mut self, data: &str) {
            self.server.write_all(data.as_bytes()).expect("server write");
            self.pass();
        }
    }

    #[test]
    fn display_id() {
        assert_eq!(ConnectionId::new(7).to_string(), "conn-7");
    }

    #[test]
    fn writes_header_and_dispatches_replies() {
        let mut h = Harness::new(&EngineConfig::default());
        let written = h.server_reads();
        assert!(written.starts_with("<?xml version='1.0'?><stream:stream"), "{written}");
        assert!(written.contains("to='example.com'"));

        let iq = Element::new("iq", NS_CLIENT)
            .with_attr("type", "get")
            .with_attr("to", "proxy.example.com")
            .with_child(Element::new("query", palaver_protocol::ns::NS_BYTESTREAMS));
        let id = h.conn.borrow_mut().request(iq, |reply| ConnectionReport::RelayDiscovered {
            proxy: "proxy.example.com".into(),
            response: reply.element().clone(),
        });
        h.conn.borrow_mut().flush(&mut h.queue);
        let written = h.server_reads();
        assert!(written.contains(&format!("id='{id}'")), "{written}");

        h.server_writes(SERVER_HEADER);
        h.server_writes(&format!("<iq type='result' id='{id}' from='proxy.example.com'/>"));
        let reports = h.conn.borrow_mut().take_reports();
        assert!(matches!(
            reports.as_slice(),
            [ConnectionReport::RelayDiscovered { proxy, response }]
                if proxy == "proxy.example.com" && response.attr("type") == Some("result")
        ));
    }

    #[test]
    fn unhandled_request_gets_an_error() {
        let mut h = Harness::new(&EngineConfig::default());
        h.server_reads();
        h.server_writes(SERVER_HEADER);
        h.server_writes("<iq type='get' id='q1' from='example.com'><ping xmlns='urn:xmpp:ping'/></iq>");

        let written = h.server_reads();
        assert!(written.contains("type='error'"), "{written}");
        assert!(written.contains("feature-not-implemented"), "{written}");
    }

    #[test]
    fn negotiates_and_acks() {
        let config = EngineConfig::default().with_ack_every(2);
        let mut h = Harness::new(&config);
        h.server_reads();
        h.server_writes(SERVER_HEADER);

        h.conn.borrow_mut().enable_stream_management(&mut h.queue);
        let fd = h.conn.borrow().fd;
        assert!(h.queue.has_timeout(fd));
        let written = h.server_reads();
        assert!(written.contains("<enable xmlns='urn:xmpp:sm:3' resume='true'/>"), "{written}");

        h.server_writes(&format!("<enabled xmlns='{NS_SM}' id='sess' resume='true' max='60'/>"));
        assert!(!h.queue.has_timeout(fd));
        assert_eq!(
            h.conn.borrow_mut().take_reports(),
            vec![ConnectionReport::StreamManagement(SmNotice::Enabled { resumable: true })]
        );

        for n in 0..2 {
            h.conn
                .borrow_mut()
                .send(Element::new("message", NS_CLIENT).with_attr("to", format!("peer{n}@example.com")));
        }
        h.conn.borrow_mut().flush(&mut h.queue);
        let written = h.server_reads();
        assert!(written.ends_with("<r xmlns='urn:xmpp:sm:3'/>"), "{written}");
        assert_eq!(h.conn.borrow().stream_management().unacked_len(), 2);

        h.server_writes(&format!("<message from='peer@example.com'/><r xmlns='{NS_SM}'/>"));
        let written = h.server_reads();
        assert_eq!(written, "<a xmlns='urn:xmpp:sm:3' h='1'/>");

        h.server_writes(&format!("<a xmlns='{NS_SM}' h='2'/>"));
        assert_eq!(h.conn.borrow().stream_management().unacked_len(), 0);
    }

    #[test]
    fn negotiation_timeout_reports_failure() {
        let config = EngineConfig::default();
        let mut h = Harness::new(&config);
        h.server_reads();
        h.conn.borrow_mut().enable_stream_management(&mut h.queue);

        // Re-arm the timeout in the past so the next pass fires it.
        let fd = h.conn.borrow().fd;
        h.queue.set_read_timeout(fd, Duration::ZERO);
        h.pass();
        assert_eq!(
            h.conn.borrow_mut().take_reports(),
            vec![ConnectionReport::StreamManagement(SmNotice::Failed(
                palaver_protocol::NegotiationError::Timeout
            ))]
        );
        assert_eq!(h.conn.borrow().stream_management().state(), SmState::Disabled);
    }

    #[test]
    fn peer_close_reports_and_unplugs() {
        let mut h = Harness::new(&EngineConfig::default());
        h.server_reads();
        h.server_writes(SERVER_HEADER);
        h.server_writes("</stream:stream>");

        assert_eq!(h.conn.borrow_mut().take_reports(), vec![ConnectionReport::Closed]);
        assert!(!h.conn.borrow().is_connected());
        assert!(h.queue.is_empty());
    }

    #[test]
    fn stanzas_sent_while_detached_are_replayed_after_resume() {
        let mut h = Harness::new(&EngineConfig::default());
        h.server_reads();
        h.server_writes(SERVER_HEADER);
        h.conn.borrow_mut().enable_stream_management(&mut h.queue);
        h.server_reads();
        h.server_writes(&format!("<enabled xmlns='{NS_SM}' id='sess' resume='true'/>"));
        h.conn.borrow_mut().take_reports();

        drop(std::mem::replace(&mut h.server, UnixStream::pair().expect("pair").0));
        h.pass();
        assert!(!h.conn.borrow().is_connected());

        let id = h
            .conn
            .borrow_mut()
            .send(Element::new("message", NS_CLIENT).with_attr("to", "peer@example.com"))
            .expect("id");
        h.conn.borrow_mut().flush(&mut h.queue);
        assert_eq!(h.conn.borrow().stream_management().unacked_len(), 1);

        let (client, server) = UnixStream::pair().expect("socketpair");
        client.set_nonblocking(true).expect("nonblocking");
        server.set_nonblocking(true).expect("nonblocking");
        h.server = server;
        h.conn.borrow_mut().attach(Box::new(client));
        h.queue.plug(h.conn.clone(), true, true);
        h.server_reads();
        h.server_writes(SERVER_HEADER);

        h.conn.borrow_mut().resume_stream_management(&mut h.queue);
        let written = h.server_reads();
        assert!(written.contains("previd='sess'"), "{written}");

        h.server_writes(&format!("<resumed xmlns='{NS_SM}' h='0' previd='sess'/>"));
        let written = h.server_reads();
        assert!(written.contains(&format!("id='{id}'")), "{written}");
        let reports = h.conn.borrow_mut().take_reports();
        assert!(reports
            .iter()
            .any(|r| *r == ConnectionReport::StreamManagement(SmNotice::Resumed { replayed: 1 })));
        assert!(reports.contains(&ConnectionReport::Closed));
    }
}
