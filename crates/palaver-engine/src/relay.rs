//! Bytestream relay resolution.
//!
//! Every configured relay is discovered once over the signaling channel,
//! probed with a throwaway SOCKS5 handshake, then cached. Callers that ask
//! for a relay while it is being resolved are queued and all get the same
//! record when it finishes.
//!
//! The manager does no I/O: each operation returns [`RelayAction`]s the
//! engine carries out.

use std::collections::{BTreeMap, HashMap};

use palaver_protocol::Element;
use palaver_protocol::ns::{NS_BYTESTREAMS, NS_CLIENT};
use rand::distr::{Alphanumeric, SampleString};
use tracing::{debug, info, warn};

use crate::connection::ConnectionId;
use crate::socks5::{Socks5Error, destination_hash};

/// Port assumed when a streamhost does not name one.
pub const DEFAULT_STREAMHOST_PORT: u16 = 1080;

/// Peer name used in probe handshakes. Relays only see its hash.
pub const PROBE_TARGET: &str = "probe@palaver.invalid/relay-test";

const SID_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResolveState {
    Initial,
    Started,
    Resolved,
    Finished,
}

/// Network location a relay advertised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Streamhost {
    pub host: String,
    pub port: u16,
    pub jid: String,
}

/// What we know about one relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRecord {
    pub address: String,
    pub owner_jid: String,
    pub state: ResolveState,
    /// Set once discovery answered; cleared again if the probe failed.
    pub streamhost: Option<Streamhost>,
    pub sid: String,
}

impl ProxyRecord {
    fn new(address: &str, owner_jid: &str) -> Self {
        Self {
            address: address.to_string(),
            owner_jid: owner_jid.to_string(),
            state: ResolveState::Initial,
            streamhost: None,
            sid: Alphanumeric.sample_string(&mut rand::rng(), SID_LEN),
        }
    }

    /// Finished with a working streamhost.
    pub fn is_usable(&self) -> bool {
        self.state == ResolveState::Finished && self.streamhost.is_some()
    }
}

/// A probe the engine should run against a discovered streamhost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRequest {
    pub proxy: String,
    pub host: String,
    pub port: u16,
    /// Hashed SOCKS5 destination for the probe session.
    pub destination: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayAction {
    /// Send `request` on `connection`; feed the answer back with
    /// `on_discovery_result` or `on_discovery_error`.
    Discover {
        connection: ConnectionId,
        proxy: String,
        request: Element,
    },
    Probe(ProbeRequest),
    /// Resolution finished. Every waiter receives the same record.
    Deliver {
        waiters: Vec<ConnectionId>,
        record: ProxyRecord,
    },
}

/// Inputs to [`RelayManager::advance`].
#[derive(Debug, Clone, Copy)]
pub enum RelayEvent<'a> {
    Resolve {
        proxy: &'a str,
        connection: ConnectionId,
        owner_jid: &'a str,
    },
    DiscoveryResult {
        proxy: &'a str,
        query: &'a Element,
    },
    DiscoveryError {
        proxy: &'a str,
    },
    ProbeFinished {
        proxy: &'a str,
        result: &'a Result<(), Socks5Error>,
    },
    Disconnected(ConnectionId),
    Reresolve {
        proxy: &'a str,
        connection: ConnectionId,
        owner_jid: &'a str,
    },
}

/// Builds the discovery request for `proxy`.
pub fn discovery_request(proxy: &str) -> Element {
    Element::new("iq", NS_CLIENT)
        .with_attr("type", "get")
        .with_attr("to", proxy)
        .with_child(Element::new("query", NS_BYTESTREAMS))
}

/// Reads the first `streamhost` out of a discovery answer.
pub fn parse_streamhost(query: &Element) -> Option<Streamhost> {
    let query = if query.is("query", NS_BYTESTREAMS) {
        query
    } else {
        query.child("query", NS_BYTESTREAMS)?
    };
    let item = query.child("streamhost", NS_BYTESTREAMS)?;
    let host = item.attr("host")?.to_string();
    let jid = item.attr("jid")?.to_string();
    let port = match item.attr("port") {
        Some(port) => port.parse().ok()?,
        None => DEFAULT_STREAMHOST_PORT,
    };
    Some(Streamhost { host, port, jid })
}

#[derive(Debug)]
struct ProxyResolver {
    record: ProxyRecord,
    /// Connection whose discovery request is in flight.
    active: Option<ConnectionId>,
    /// Everyone who asked, in order.
    waiters: Vec<ConnectionId>,
    /// Owner of a re-resolution requested while this attempt was running.
    restart: Option<String>,
}

impl ProxyResolver {
    fn new(address: &str, owner_jid: &str) -> Self {
        Self {
            record: ProxyRecord::new(address, owner_jid),
            active: None,
            waiters: Vec::new(),
            restart: None,
        }
    }

    fn start(&mut self, connection: ConnectionId) -> RelayAction {
        self.record.state = ResolveState::Started;
        self.active = Some(connection);
        debug!(proxy = %self.record.address, connection = %connection, "requesting relay address");
        RelayAction::Discover {
            connection,
            proxy: self.record.address.clone(),
            request: discovery_request(&self.record.address),
        }
    }

    fn finish(&mut self) -> RelayAction {
        self.record.state = ResolveState::Finished;
        self.active = None;
        RelayAction::Deliver {
            waiters: std::mem::take(&mut self.waiters),
            record: self.record.clone(),
        }
    }

    /// Ends the running attempt: delivers it, or starts the re-resolution
    /// that was queued behind it.
    fn settle(&mut self) -> Vec<RelayAction> {
        let Some(owner_jid) = self.restart.take() else {
            return vec![self.finish()];
        };
        debug!(proxy = %self.record.address, "discarding attempt for queued re-resolution");
        self.record = ProxyRecord::new(&self.record.address, &owner_jid);
        self.active = None;
        match self.waiters.first() {
            Some(&next) => vec![self.start(next)],
            None => Vec::new(),
        }
    }
}

/// Resolves and caches bytestream relays.
#[derive(Debug)]
pub struct RelayManager {
    resolvers: BTreeMap<String, ProxyResolver>,
    defaults: HashMap<String, String>,
    probe_relays: bool,
}

impl Default for RelayManager {
    fn default() -> Self {
        Self::new(true)
    }
}

impl RelayManager {
    /// With `probe_relays` off, discovered relays are cached untested.
    pub fn new(probe_relays: bool) -> Self {
        Self {
            resolvers: BTreeMap::new(),
            defaults: HashMap::new(),
            probe_relays,
        }
    }

    pub fn advance(&mut self, event: RelayEvent<'_>) -> Vec<RelayAction> {
        match event {
            RelayEvent::Resolve {
                proxy,
                connection,
                owner_jid,
            } => self.resolve(proxy, connection, owner_jid),
            RelayEvent::DiscoveryResult { proxy, query } => self.on_discovery_result(proxy, query),
            RelayEvent::DiscoveryError { proxy } => self.on_discovery_error(proxy),
            RelayEvent::ProbeFinished { proxy, result } => self.on_probe_result(proxy, result.clone()),
            RelayEvent::Disconnected(connection) => self.disconnect(connection),
            RelayEvent::Reresolve {
                proxy,
                connection,
                owner_jid,
            } => self.reresolve(proxy, connection, owner_jid),
        }
    }

    /// Asks for `proxy` on behalf of `connection`.
    ///
    /// Starts discovery for a new relay, queues the caller behind a running
    /// one, and answers at once from the cache when the relay is finished.
    pub fn resolve(
        &mut self,
        proxy: &str,
        connection: ConnectionId,
        owner_jid: &str,
    ) -> Vec<RelayAction> {
        let resolver = self
            .resolvers
            .entry(proxy.to_string())
            .or_insert_with(|| ProxyResolver::new(proxy, owner_jid));

        if resolver.record.state == ResolveState::Finished {
            return vec![RelayAction::Deliver {
                waiters: vec![connection],
                record: resolver.record.clone(),
            }];
        }
        if !resolver.waiters.contains(&connection) {
            resolver.waiters.push(connection);
        }
        if resolver.record.state == ResolveState::Initial {
            return vec![resolver.start(connection)];
        }
        debug!(proxy = %proxy, connection = %connection, "relay resolution already running");
        Vec::new()
    }

    pub fn on_discovery_result(&mut self, proxy: &str, query: &Element) -> Vec<RelayAction> {
        let probe_relays = self.probe_relays;
        let Some(resolver) = self.started(proxy) else {
            return Vec::new();
        };
        let Some(streamhost) = parse_streamhost(query) else {
            warn!(proxy = %proxy, "relay answered without a usable streamhost");
            resolver.record.streamhost = None;
            return resolver.settle();
        };
        if resolver.restart.is_some() {
            return resolver.settle();
        }

        info!(proxy = %proxy, host = %streamhost.host, port = streamhost.port, "relay address discovered");
        resolver.record.state = ResolveState::Resolved;
        resolver.active = None;
        if !probe_relays {
            resolver.record.streamhost = Some(streamhost);
            return resolver.settle();
        }

        let request = ProbeRequest {
            proxy: proxy.to_string(),
            host: streamhost.host.clone(),
            port: streamhost.port,
            destination: destination_hash(&resolver.record.sid, &resolver.record.owner_jid, PROBE_TARGET),
        };
        resolver.record.streamhost = Some(streamhost);
        vec![RelayAction::Probe(request)]
    }

    pub fn on_discovery_error(&mut self, proxy: &str) -> Vec<RelayAction> {
        let Some(resolver) = self.started(proxy) else {
            return Vec::new();
        };
        warn!(proxy = %proxy, "relay discovery failed");
        resolver.record.streamhost = None;
        resolver.settle()
    }

    /// Caches the outcome of a probe. A failed probe still finishes the
    /// record, with no streamhost.
    pub fn on_probe_result(&mut self, proxy: &str, result: Result<(), Socks5Error>) -> Vec<RelayAction> {
        let Some(resolver) = self.resolvers.get_mut(proxy) else {
            return Vec::new();
        };
        if resolver.record.state != ResolveState::Resolved {
            debug!(proxy = %proxy, state = ?resolver.record.state, "ignoring stale probe result");
            return Vec::new();
        }
        if let Err(e) = result {
            warn!(proxy = %proxy, error = %e, "relay is not usable");
            resolver.record.streamhost = None;
        }
        resolver.settle()
    }

    /// Forgets `connection`. An unfinished resolution it was driving moves
    /// to the next queued connection.
    pub fn disconnect(&mut self, connection: ConnectionId) -> Vec<RelayAction> {
        let mut actions = Vec::new();
        for resolver in self.resolvers.values_mut() {
            resolver.waiters.retain(|c| *c != connection);
            if resolver.active != Some(connection) {
                continue;
            }
            resolver.active = None;
            if resolver.record.state == ResolveState::Finished {
                continue;
            }
            if let Some(owner_jid) = resolver.restart.take() {
                resolver.record = ProxyRecord::new(&resolver.record.address, &owner_jid);
            }
            resolver.record.state = ResolveState::Initial;
            if let Some(&next) = resolver.waiters.first() {
                actions.push(resolver.start(next));
            }
        }
        actions
    }

    /// Throws away what is known about `proxy` and resolves it again.
    ///
    /// While an attempt is running the caller is queued and the fresh
    /// discovery starts once that attempt answers, so at most one discovery
    /// request per relay is ever in flight.
    pub fn reresolve(
        &mut self,
        proxy: &str,
        connection: ConnectionId,
        owner_jid: &str,
    ) -> Vec<RelayAction> {
        if let Some(running) = self
            .resolvers
            .get_mut(proxy)
            .filter(|r| matches!(r.record.state, ResolveState::Started | ResolveState::Resolved))
        {
            debug!(proxy = %proxy, state = ?running.record.state, "re-resolution queued behind running attempt");
            if !running.waiters.contains(&connection) {
                running.waiters.push(connection);
            }
            running.restart = Some(owner_jid.to_string());
            return Vec::new();
        }
        if let Some(old) = self.resolvers.remove(proxy) {
            debug!(proxy = %proxy, state = ?old.record.state, "re-resolving relay");
            let mut resolver = ProxyResolver::new(proxy, owner_jid);
            resolver.waiters = old.waiters;
            self.resolvers.insert(proxy.to_string(), resolver);
        }
        self.resolve(proxy, connection, owner_jid)
    }

    /// The record for `proxy`, once finished.
    pub fn get_proxy(&self, proxy: &str) -> Option<&ProxyRecord> {
        self.resolvers
            .get(proxy)
            .map(|r| &r.record)
            .filter(|r| r.state == ResolveState::Finished)
    }

    /// The record for `proxy` in whatever state it is.
    pub fn record(&self, proxy: &str) -> Option<&ProxyRecord> {
        self.resolvers.get(proxy).map(|r| &r.record)
    }

    pub fn set_default(&mut self, account: impl Into<String>, proxy: impl Into<String>) {
        self.defaults.insert(account.into(), proxy.into());
    }

    pub fn default_for(&self, account: &str) -> Option<&str> {
        self.defaults.get(account).map(String::as_str)
    }

    fn started(&mut self, proxy: &str) -> Option<&mut ProxyResolver> {
        let resolver = self.resolvers.get_mut(proxy)?;
        if resolver.record.state != ResolveState::Started {
            debug!(proxy = %proxy, state = ?resolver.record.state, "ignoring unexpected discovery answer");
            return None;
        }
        Some(resolver)
    }
}
