//! The protocol engine: connections, relays and capabilities on one loop.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::task::Poll;

use palaver_protocol::{Element, SmNotice};
use tracing::{debug, info, warn};

use crate::caps::{
    CapabilityCache, CapsKey, ClaimedCaps, MemoryCapsStore, Verification, parse_disco_info,
};
use crate::config::EngineConfig;
use crate::connection::{Connection, ConnectionId, ConnectionReport, Transport};
use crate::driver::{self, Pump};
use crate::error::{EngineError, EngineResult};
use crate::event_queue::EventQueue;
use crate::handoff::{PendingResolution, resolve_in_background};
use crate::relay::{ProbeRequest, ProxyRecord, RelayAction, RelayManager};
use crate::socks5::{
    ProbeInbox, Socks5Connector, Socks5Error, Socks5Prober, TransferInbox, TransferReport,
    destination_hash,
};

/// State shared by every connection.
#[derive(Debug)]
pub struct EngineState {
    pub config: EngineConfig,
    pub relays: RelayManager,
    pub caps: CapabilityCache,
}

impl EngineState {
    pub fn new(config: EngineConfig) -> Self {
        let caps = CapabilityCache::new(
            Box::new(MemoryCapsStore::default()),
            config.caps.feature_blacklist.clone(),
        );
        Self {
            relays: RelayManager::new(config.test_relays),
            config,
            caps,
        }
    }
}

/// What the embedder hears about.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    RelayReady {
        connection: ConnectionId,
        record: ProxyRecord,
    },
    CapsVerified {
        entity: String,
        key: CapsKey,
    },
    CapsRejected {
        entity: String,
        key: CapsKey,
    },
    StreamManagement {
        connection: ConnectionId,
        notice: SmNotice,
    },
    Disconnected(ConnectionId),
}

pub struct Engine {
    queue: EventQueue,
    state: EngineState,
    connections: BTreeMap<ConnectionId, Rc<RefCell<Connection>>>,
    next_connection: u64,
    probes: ProbeInbox,
    transfers: TransferInbox,
    resolutions: Vec<(ProbeRequest, PendingResolution)>,
    events: VecDeque<EngineEvent>,
}

impl Engine {
    /// Creates an engine with a `poll(2)` event queue.
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        Self::with_queue(config, EventQueue::new())
    }

    pub fn with_queue(config: EngineConfig, queue: EventQueue) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self {
            queue,
            state: EngineState::new(config),
            connections: BTreeMap::new(),
            next_connection: 1,
            probes: ProbeInbox::default(),
            transfers: TransferInbox::default(),
            resolutions: Vec::new(),
            events: VecDeque::new(),
        })
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut EngineState {
        &mut self.state
    }

    pub fn queue_mut(&mut self) -> &mut EventQueue {
        &mut self.queue
    }

    /// Registers a connection to `server`. It stays detached until a
    /// transport is attached.
    pub fn add_connection(&mut self, server: impl Into<String>) -> ConnectionId {
        let id = ConnectionId::new(self.next_connection);
        self.next_connection += 1;
        let connection = Connection::new(id, server, &self.state.config);
        self.connections.insert(id, Rc::new(RefCell::new(connection)));
        id
    }

    pub fn connection(&self, id: ConnectionId) -> EngineResult<Rc<RefCell<Connection>>> {
        self.connections
            .get(&id)
            .cloned()
            .ok_or(EngineError::UnknownConnection(id))
    }

    /// Attaches a connected, non-blocking transport. Also used to reconnect
    /// after a loss; resume afterwards with [`Engine::resume_stream`].
    pub fn attach_transport(&mut self, id: ConnectionId, transport: Box<dyn Transport>) -> EngineResult<()> {
        let connection = self.connection(id)?;
        connection.borrow_mut().attach(transport);
        self.queue.plug(connection, true, true);
        Ok(())
    }

    /// Drops a connection and hands its relay work to other connections.
    pub fn remove_connection(&mut self, id: ConnectionId) -> EngineResult<()> {
        let connection = self
            .connections
            .remove(&id)
            .ok_or(EngineError::UnknownConnection(id))?;
        connection.borrow_mut().close(&mut self.queue);
        let actions = self.state.relays.disconnect(id);
        self.run_relay_actions(actions);
        info!(connection = %id, "connection removed");
        Ok(())
    }

    /// Sends a stanza and writes it out right away.
    pub fn send(&mut self, id: ConnectionId, element: Element) -> EngineResult<Option<String>> {
        let connection = self.connection(id)?;
        let mut connection = connection.borrow_mut();
        let stanza_id = connection.send(element);
        connection.flush(&mut self.queue);
        Ok(stanza_id)
    }

    pub fn enable_stream_management(&mut self, id: ConnectionId) -> EngineResult<()> {
        let connection = self.connection(id)?;
        connection.borrow_mut().enable_stream_management(&mut self.queue);
        Ok(())
    }

    pub fn resume_stream(&mut self, id: ConnectionId) -> EngineResult<()> {
        let connection = self.connection(id)?;
        connection.borrow_mut().resume_stream_management(&mut self.queue);
        Ok(())
    }

    /// Resolves a relay for `id`. The answer arrives as
    /// [`EngineEvent::RelayReady`].
    pub fn resolve_relay(&mut self, id: ConnectionId, proxy: &str) -> EngineResult<()> {
        let owner = self.owner_jid(id)?;
        let actions = self.state.relays.resolve(proxy, id, &owner);
        self.run_relay_actions(actions);
        Ok(())
    }

    /// Forgets what is known about `proxy` and resolves it again.
    pub fn reresolve_relay(&mut self, id: ConnectionId, proxy: &str) -> EngineResult<()> {
        let owner = self.owner_jid(id)?;
        let actions = self.state.relays.reresolve(proxy, id, &owner);
        self.run_relay_actions(actions);
        Ok(())
    }

    /// Resolves every configured relay for `id` and records the configured
    /// default relay for its server.
    pub fn resolve_configured_relays(&mut self, id: ConnectionId) -> EngineResult<()> {
        let relays = self.state.config.relays.clone();
        for proxy in relays {
            self.resolve_relay(id, &proxy)?;
        }
        if let Some(default) = self.state.config.default_relay.clone() {
            let server = self.connection(id)?.borrow().server().to_string();
            self.state.relays.set_default(server, default);
        }
        Ok(())
    }

    /// Asks `entity` for its features unless its caps are already known or
    /// being asked for. Returns whether a query went out.
    pub fn query_caps(&mut self, id: ConnectionId, entity: &str, claimed: &ClaimedCaps) -> EngineResult<bool> {
        let connection = self.connection(id)?;
        let Some(query) = self.state.caps.query_if_unknown(id, entity, claimed) else {
            return Ok(false);
        };
        let mut connection = connection.borrow_mut();
        let (entity, key) = (query.entity, query.key);
        connection.request(query.request, move |reply| {
            if reply.stanza_type() == Some("result") {
                ConnectionReport::DiscoInfo {
                    entity,
                    key,
                    response: reply.element().clone(),
                }
            } else {
                ConnectionReport::DiscoInfoFailed { entity, key }
            }
        });
        connection.flush(&mut self.queue);
        Ok(true)
    }

    /// Opens the bytestream `sid` through the streamhost at `addr`, once the
    /// peers agreed on it. The result is picked up with
    /// [`Engine::take_bytestreams`].
    pub fn connect_bytestream(
        &mut self,
        sid: &str,
        addr: SocketAddr,
        initiator: &str,
        target: &str,
    ) -> EngineResult<RawFd> {
        let destination = destination_hash(sid, initiator, target);
        let fd = Socks5Connector::start(
            &mut self.queue,
            sid,
            addr,
            &destination,
            self.state.config.relay_connect_timeout(),
            self.transfers.clone(),
        )?;
        Ok(fd)
    }

    /// Bytestream handshakes finished since the last call.
    pub fn take_bytestreams(&mut self) -> Vec<TransferReport> {
        self.transfers.borrow_mut().drain(..).collect()
    }

    /// Runs one pass of the loop, then settles everything it produced.
    pub fn process(&mut self) -> EngineResult<()> {
        self.queue.process()?;
        loop {
            let mut progressed = self.poll_resolutions();
            progressed |= self.collect_probes();
            progressed |= self.collect_reports();
            if !progressed {
                return Ok(());
            }
        }
    }

    /// Drives the engine at the configured cadence until `shutdown`.
    pub async fn run<S>(&mut self, shutdown: S) -> EngineResult<()>
    where
        S: Future<Output = ()>,
    {
        let period = self.state.config.process_interval();
        driver::drive(self, period, shutdown).await
    }

    pub fn take_events(&mut self) -> Vec<EngineEvent> {
        self.events.drain(..).collect()
    }

    fn owner_jid(&self, id: ConnectionId) -> EngineResult<String> {
        let connection = self.connection(id)?;
        let connection = connection.borrow();
        Ok(connection
            .jid()
            .map_or_else(|| connection.server().to_string(), str::to_string))
    }

    fn run_relay_actions(&mut self, actions: Vec<RelayAction>) {
        let mut work: VecDeque<RelayAction> = actions.into();
        while let Some(action) = work.pop_front() {
            match action {
                RelayAction::Discover {
                    connection,
                    proxy,
                    request,
                } => {
                    let Some(conn) = self.connections.get(&connection).cloned() else {
                        warn!(connection = %connection, proxy = %proxy, "discovery connection is gone");
                        work.extend(self.state.relays.disconnect(connection));
                        continue;
                    };
                    let mut conn = conn.borrow_mut();
                    conn.request(request, move |reply| {
                        if reply.stanza_type() == Some("result") {
                            ConnectionReport::RelayDiscovered {
                                proxy,
                                response: reply.element().clone(),
                            }
                        } else {
                            ConnectionReport::RelayDiscoveryFailed { proxy }
                        }
                    });
                    conn.flush(&mut self.queue);
                }
                RelayAction::Probe(request) => {
                    debug!(proxy = %request.proxy, host = %request.host, "resolving relay host");
                    let pending = resolve_in_background(request.host.clone(), request.port);
                    self.resolutions.push((request, pending));
                }
                RelayAction::Deliver { waiters, record } => {
                    for connection in waiters {
                        self.events.push_back(EngineEvent::RelayReady {
                            connection,
                            record: record.clone(),
                        });
                    }
                }
            }
        }
    }

    fn poll_resolutions(&mut self) -> bool {
        let mut finished = Vec::new();
        let mut index = 0;
        while index < self.resolutions.len() {
            match self.resolutions[index].1.poll() {
                Poll::Pending => index += 1,
                Poll::Ready(result) => {
                    let (request, _) = self.resolutions.swap_remove(index);
                    finished.push((request, result));
                }
            }
        }

        let progressed = !finished.is_empty();
        for (request, result) in finished {
            let addr = match result {
                Ok(addrs) => addrs.into_iter().next(),
                Err(e) => {
                    warn!(host = %request.host, error = %e, "relay host lookup failed");
                    None
                }
            };
            let started = match addr {
                Some(addr) => Socks5Prober::start(
                    &mut self.queue,
                    request.proxy.clone(),
                    addr,
                    &request.destination,
                    self.state.config.relay_connect_timeout(),
                    self.probes.clone(),
                )
                .map(|_| ()),
                None => Err(Socks5Error::ConnectFailed(format!("cannot resolve {}", request.host))),
            };
            if let Err(e) = started {
                let actions = self.state.relays.on_probe_result(&request.proxy, Err(e));
                self.run_relay_actions(actions);
            }
        }
        progressed
    }

    fn collect_probes(&mut self) -> bool {
        let reports: Vec<_> = self.probes.borrow_mut().drain(..).collect();
        let progressed = !reports.is_empty();
        for report in reports {
            let actions = self.state.relays.on_probe_result(&report.relay, report.result);
            self.run_relay_actions(actions);
        }
        progressed
    }

    fn collect_reports(&mut self) -> bool {
        let reports: Vec<(ConnectionId, ConnectionReport)> = self
            .connections
            .iter()
            .flat_map(|(id, conn)| {
                conn.borrow_mut()
                    .take_reports()
                    .into_iter()
                    .map(move |report| (*id, report))
            })
            .collect();
        let progressed = !reports.is_empty();
        for (id, report) in reports {
            self.handle_report(id, report);
        }
        progressed
    }

    fn handle_report(&mut self, id: ConnectionId, report: ConnectionReport) {
        match report {
            ConnectionReport::RelayDiscovered { proxy, response } => {
                let actions = self.state.relays.on_discovery_result(&proxy, &response);
                self.run_relay_actions(actions);
            }
            ConnectionReport::RelayDiscoveryFailed { proxy } => {
                let actions = self.state.relays.on_discovery_error(&proxy);
                self.run_relay_actions(actions);
            }
            ConnectionReport::DiscoInfo { entity, key, response } => {
                let verified = match parse_disco_info(&response) {
                    Some(info) => self.state.caps.verify_and_store(&key, info) == Verification::Verified,
                    None => {
                        warn!(entity = %entity, "disco answer without a query");
                        self.state.caps.on_query_failed(&key);
                        false
                    }
                };
                let event = if verified {
                    EngineEvent::CapsVerified { entity, key }
                } else {
                    EngineEvent::CapsRejected { entity, key }
                };
                self.events.push_back(event);
            }
            ConnectionReport::DiscoInfoFailed { entity, key } => {
                debug!(entity = %entity, key = %key, "capabilities query failed");
                self.state.caps.on_query_failed(&key);
                self.events.push_back(EngineEvent::CapsRejected { entity, key });
            }
            ConnectionReport::StreamManagement(notice) => {
                self.events.push_back(EngineEvent::StreamManagement {
                    connection: id,
                    notice,
                });
            }
            ConnectionReport::Closed => {
                let actions = self.state.relays.disconnect(id);
                self.run_relay_actions(actions);
                self.events.push_back(EngineEvent::Disconnected(id));
            }
        }
    }
}

impl Pump for Engine {
    fn process(&mut self) -> EngineResult<()> {
        Engine::process(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::os::unix::net::UnixStream;
    use std::thread;
    use std::time::{Duration, Instant};

    use palaver_protocol::ns::{NS_BYTESTREAMS, NS_CLIENT, NS_DISCO_INFO};

    use crate::caps::CapsStatus;
    use crate::socks5::GREETING;

    const SERVER_HEADER: &str = "<stream:stream xmlns='jabber:client' \
        xmlns:stream='http://etherx.jabber.org/streams' id='s1' from='example.com' version='1.0'>";
    const PROXY: &str = "proxy.example.com";

    struct Server(UnixStream);

    impl Server {
        fn read(&mut self) -> String {
            let mut out = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                match self.0.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => out.extend_from_slice(&buf[..n]),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => panic!("server read: {e}"),
                }
            }
            String::from_utf8(out).expect("utf-8")
        }

        fn write(&mut self, data: &str) {
            self.0.write_all(data.as_bytes()).expect("server write");
        }
    }

    fn engine_with_server(config: EngineConfig) -> (Engine, ConnectionId, Server) {
        let mut engine = Engine::new(config).expect("engine");
        let id = engine.add_connection("example.com");
        let (client, server) = UnixStream::pair().expect("socketpair");
        client.set_nonblocking(true).expect("nonblocking");
        server.set_nonblocking(true).expect("nonblocking");
        engine.attach_transport(id, Box::new(client)).expect("attach");
        engine.process().expect("process");

        let mut server = Server(server);
        assert!(server.read().contains("<stream:stream"));
        server.write(SERVER_HEADER);
        engine.process().expect("process");
        (engine, id, server)
    }

    fn run_until<F>(engine: &mut Engine, mut done: F) -> Vec<EngineEvent>
    where
        F: FnMut(&[EngineEvent]) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut events = Vec::new();
        loop {
            engine.process().expect("process");
            events.extend(engine.take_events());
            if done(&events) {
                return events;
            }
            assert!(Instant::now() < deadline, "timed out, got {events:?}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn stanza_id(xml: &str) -> String {
        let start = xml.find("id='").expect("id attribute") + 4;
        let end = xml[start..].find('\'').expect("closing quote") + start;
        xml[start..end].to_string()
    }

    #[test]
    fn rejects_invalid_config() {
        let config = EngineConfig::default().with_hash_algorithm("crc32");
        assert!(matches!(Engine::new(config), Err(EngineError::Config { .. })));
    }

    #[test]
    fn bytestream_handshake_uses_stream_destination() {
        let relay = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = relay.local_addr().expect("addr");
        let expected = destination_hash("sid-7", "alice@example.com/a", "bob@example.com/b");
        let relay_thread = thread::spawn(move || {
            let (mut conn, _) = relay.accept().expect("accept");
            let mut greeting = [0u8; 3];
            conn.read_exact(&mut greeting).expect("greeting");
            conn.write_all(&[5, 0]).expect("method");
            let mut request = vec![0u8; 47];
            conn.read_exact(&mut request).expect("request");
            conn.write_all(&[5, 0, 0, 1, 127, 0, 0, 1, 0, 0]).expect("reply");
            request
        });

        let mut engine = Engine::new(EngineConfig::default()).expect("engine");
        engine
            .connect_bytestream("sid-7", addr, "alice@example.com/a", "bob@example.com/b")
            .expect("connect");
        let deadline = Instant::now() + Duration::from_secs(5);
        let reports = loop {
            engine.process().expect("process");
            let reports = engine.take_bytestreams();
            if !reports.is_empty() {
                break reports;
            }
            assert!(Instant::now() < deadline, "handshake did not finish");
            thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].sid, "sid-7");
        assert!(reports[0].result.is_ok());

        let request = relay_thread.join().expect("relay thread");
        assert_eq!(&request[5..45], expected.as_bytes());
    }

    #[test]
    fn unknown_connection() {
        let mut engine = Engine::new(EngineConfig::default()).expect("engine");
        let err = engine.resolve_relay(ConnectionId::new(9), PROXY).expect_err("unknown");
        assert_eq!(err.to_string(), "unknown connection: conn-9");
    }

    #[test]
    fn relay_resolution_probes_and_delivers_to_all_waiters() {
        let relay = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = relay.local_addr().expect("addr").port();
        let relay_thread = thread::spawn(move || {
            let (mut conn, _) = relay.accept().expect("accept");
            let mut greeting = [0u8; 3];
            conn.read_exact(&mut greeting).expect("greeting");
            assert_eq!(greeting, GREETING);
            conn.write_all(&[5, 0]).expect("method");
            let mut request = [0u8; 47];
            conn.read_exact(&mut request).expect("request");
            let mut reply = vec![5, 0, 0, 1, 127, 0, 0, 1];
            reply.extend_from_slice(&port.to_be_bytes());
            conn.write_all(&reply).expect("reply");
        });

        let (mut engine, first, mut server) = engine_with_server(EngineConfig::default());
        let second = engine.add_connection("example.com");
        engine.resolve_relay(first, PROXY).expect("resolve");
        engine.resolve_relay(second, PROXY).expect("resolve");

        let sent = server.read();
        assert_eq!(sent.matches("<iq").count(), 1, "{sent}");
        let id = stanza_id(&sent);
        server.write(&format!(
            "<iq type='result' id='{id}' from='{PROXY}'><query xmlns='{NS_BYTESTREAMS}'>\
             <streamhost host='127.0.0.1' port='{port}' jid='{PROXY}'/></query></iq>"
        ));

        let events = run_until(&mut engine, |events| events.len() >= 2);
        relay_thread.join().expect("relay thread");

        let ready: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::RelayReady { connection, record } => Some((*connection, record)),
                _ => None,
            })
            .collect();
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].0, first);
        assert_eq!(ready[1].0, second);
        assert_eq!(ready[0].1, ready[1].1);
        assert!(ready[0].1.is_usable());
        assert!(engine.state().relays.get_proxy(PROXY).is_some());
    }

    #[test]
    fn discovery_error_delivers_unusable_record() {
        let (mut engine, id, mut server) = engine_with_server(EngineConfig::default());
        engine.resolve_relay(id, PROXY).expect("resolve");
        let stanza = stanza_id(&server.read());
        server.write(&format!("<iq type='error' id='{stanza}' from='{PROXY}'/>"));

        let events = run_until(&mut engine, |events| !events.is_empty());
        assert!(matches!(
            events.as_slice(),
            [EngineEvent::RelayReady { record, .. }] if !record.is_usable()
        ));
    }

    #[test]
    fn caps_round_trip() {
        let (mut engine, id, mut server) = engine_with_server(EngineConfig::default());
        let claimed = ClaimedCaps {
            node: "http://code.google.com/p/exodus".into(),
            key: CapsKey::new("sha-1", "QgayPKawpkPSDYmwT/WM94uAlu0="),
        };
        assert!(engine.query_caps(id, "juliet@example.com/balcony", &claimed).expect("query"));
        assert!(!engine.query_caps(id, "romeo@example.com/orchard", &claimed).expect("query"));

        let sent = server.read();
        assert_eq!(sent.matches("<iq").count(), 1, "{sent}");
        let stanza = stanza_id(&sent);
        let features: String = [
            "http://jabber.org/protocol/caps",
            "http://jabber.org/protocol/disco#info",
            "http://jabber.org/protocol/disco#items",
            "http://jabber.org/protocol/muc",
        ]
        .iter()
        .map(|f| format!("<feature var='{f}'/>"))
        .collect();
        server.write(&format!(
            "<iq type='result' id='{stanza}' from='juliet@example.com/balcony'>\
             <query xmlns='{NS_DISCO_INFO}'><identity category='client' type='pc' name='Exodus 0.9.1'/>\
             {features}</query></iq>"
        ));

        let events = run_until(&mut engine, |events| !events.is_empty());
        assert_eq!(
            events,
            vec![EngineEvent::CapsVerified {
                entity: "juliet@example.com/balcony".into(),
                key: claimed.key.clone(),
            }]
        );
        assert_eq!(
            engine.state().caps.get(&claimed.key).map(|e| e.status),
            Some(CapsStatus::Cached)
        );
    }

    #[test]
    fn stream_management_and_disconnect_events() {
        let (mut engine, id, mut server) = engine_with_server(EngineConfig::default());
        engine.enable_stream_management(id).expect("enable");
        assert!(server.read().contains("<enable"));
        server.write("<enabled xmlns='urn:xmpp:sm:3' id='sess' resume='true'/>");
        let events = run_until(&mut engine, |events| !events.is_empty());
        assert_eq!(
            events,
            vec![EngineEvent::StreamManagement {
                connection: id,
                notice: SmNotice::Enabled { resumable: true },
            }]
        );

        engine
            .send(id, Element::new("message", NS_CLIENT).with_attr("to", "peer@example.com"))
            .expect("send");
        drop(server);
        let events = run_until(&mut engine, |events| !events.is_empty());
        assert_eq!(events, vec![EngineEvent::Disconnected(id)]);

        let connection = engine.connection(id).expect("connection");
        assert!(!connection.borrow().is_connected());
        assert_eq!(connection.borrow().stream_management().unacked_len(), 1);
    }

    #[test]
    fn removing_a_connection_hands_relay_work_over() {
        let (mut engine, first, mut server) = engine_with_server(EngineConfig::default());
        let second = engine.add_connection("example.com");
        engine.resolve_relay(first, PROXY).expect("resolve");
        engine.resolve_relay(second, PROXY).expect("resolve");
        server.read();

        engine.remove_connection(first).expect("remove");
        assert!(engine.connection(first).is_err());
        assert_eq!(
            engine.state().relays.record(PROXY).map(|r| r.state),
            Some(crate::relay::ResolveState::Started)
        );
    }

    #[test]
    fn configured_relays_and_default() {
        let config = EngineConfig::default()
            .with_relays([PROXY, "proxy.example.net"])
            .with_default_relay("proxy.example.net");
        let (mut engine, id, mut server) = engine_with_server(config);
        engine.resolve_configured_relays(id).expect("resolve");

        assert_eq!(server.read().matches("<iq").count(), 2);
        assert_eq!(engine.state().relays.default_for("example.com"), Some("proxy.example.net"));
    }

    #[tokio::test(start_paused = true)]
    async fn runs_until_shutdown() {
        let mut engine = Engine::new(EngineConfig::default()).expect("engine");
        engine
            .run(tokio::time::sleep(Duration::from_millis(500)))
            .await
            .expect("run");
    }
}
