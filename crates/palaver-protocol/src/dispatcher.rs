//! Stanza dispatch.
//!
//! The [`Dispatcher`] owns the stream framer and the handler table for one
//! connection. It is generic over the connection state `S` that handlers
//! mutate, so handlers are plain closures with no shared ownership:
//!
//! ```ignore
//! let mut dispatcher = Dispatcher::<Session>::new(NS_CLIENT);
//! dispatcher.register_handler(
//!     HandlerSpec::new("message").priority(Priority::Ui),
//!     |session, stanza, _out| {
//!         session.inbox.push(stanza.clone());
//!         Handled::Consumed
//!     },
//! );
//! ```
//!
//! Handlers for a stanza run in [`Priority`] order across all matching keys,
//! ties broken by registration order. Once a handler consumes the stanza only
//! `system` handlers see it.

use std::collections::{HashMap, HashSet};

use tracing::{debug, trace, warn};

use crate::element::Element;
use crate::error::{ProtocolError, ProtocolResult};
use crate::stanza::{Stanza, StanzaKind};
use crate::stream::{FrameEvent, StreamFramer, stream_header};

/// Matches every element name within a namespace.
pub const ANY_NAME: &str = "*";

/// Handler priority tiers, lowest runs first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Protocol bookkeeping that must see every stanza (ack counting).
    Early,
    /// Core protocol handling.
    #[default]
    Core,
    /// Extensions layered on the core protocol.
    Late,
    /// Application and user-interface consumers.
    Ui,
}

/// What a handler did with a stanza.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// Let later handlers see the stanza.
    Pass,
    /// Stop propagation to non-system handlers.
    Consumed,
}

/// Result of feeding bytes to [`Dispatcher::process_nonblocking`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// All `n` input bytes were consumed.
    Consumed(usize),
    /// Zero-length input, nothing to do.
    Idle,
    /// The peer closed the stream.
    Disconnected,
}

/// Where the stream is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Disconnected,
    StreamOpened,
}

/// Handle returned by [`Dispatcher::register_handler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

pub type HandlerFn<S> = Box<dyn FnMut(&mut S, &Stanza, &mut Outbox<S>) -> Handled>;
pub type ResponseFn<S> = Box<dyn FnOnce(&mut S, &Stanza, &mut Outbox<S>)>;
pub type DisconnectFn<S> = Box<dyn FnMut(&mut S)>;

/// Which stanzas a handler wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerSpec {
    name: String,
    namespace: Option<String>,
    stanza_type: Option<String>,
    child_namespace: Option<String>,
    priority: Priority,
    system: bool,
}

impl HandlerSpec {
    /// Matches elements with this local name in the stream's default
    /// namespace. Use [`ANY_NAME`] to match every element.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
            stanza_type: None,
            child_namespace: None,
            priority: Priority::default(),
            system: false,
        }
    }

    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Only stanzas whose `type` attribute equals `stanza_type`.
    #[must_use]
    pub fn stanza_type(mut self, stanza_type: impl Into<String>) -> Self {
        self.stanza_type = Some(stanza_type.into());
        self
    }

    /// Only stanzas with a direct child in `namespace`.
    #[must_use]
    pub fn child_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.child_namespace = Some(namespace.into());
        self
    }

    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// System handlers also run for consumed stanzas.
    #[must_use]
    pub fn system(mut self) -> Self {
        self.system = true;
        self
    }

    fn accepts(&self, stanza: &Stanza) -> bool {
        let type_ok = match self.stanza_type {
            Some(ref typ) => stanza.stanza_type() == Some(typ.as_str()),
            None => true,
        };
        let child_ok = match self.child_namespace {
            Some(ref ns) => stanza.child_namespaces().any(|child| child == ns),
            None => true,
        };
        type_ok && child_ok
    }
}

struct Registration<S> {
    id: u64,
    spec: HandlerSpec,
    callback: HandlerFn<S>,
}

/// An outbound element queued by a handler or the embedder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    /// A message, presence or iq. Counted by stream management.
    Stanza(Element),
    /// A protocol control element that is never counted.
    Control(Element),
    /// A stanza retransmitted after resumption. Already counted.
    Replay(Element),
}

impl Outgoing {
    pub fn element(&self) -> &Element {
        match self {
            Self::Stanza(el) | Self::Control(el) | Self::Replay(el) => el,
        }
    }
}

/// A reply we are waiting for: its id and the address the request went to.
struct Expected<S> {
    peer: Option<String>,
    callback: ResponseFn<S>,
}

/// Outbound queue shared with handlers during dispatch.
pub struct Outbox<S> {
    items: Vec<Outgoing>,
    pending: Vec<(String, Expected<S>)>,
    next_id: u64,
    bound_jid: Option<String>,
}

impl<S> Default for Outbox<S> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            pending: Vec::new(),
            next_id: 1,
            bound_jid: None,
        }
    }
}

impl<S> Outbox<S> {
    /// Returns a fresh stanza id.
    pub fn next_id(&mut self) -> String {
        let id = self.next_id.to_string();
        self.next_id += 1;
        id
    }

    /// Sets the jid stamped as `from` on outgoing stanzas.
    pub fn set_bound_jid(&mut self, jid: Option<String>) {
        self.bound_jid = jid;
    }

    fn prepare(&mut self, element: &mut Element) -> String {
        let id = match element.attr("id") {
            Some(id) => id.to_owned(),
            None => {
                let id = self.next_id();
                element.set_attr("id", id.clone());
                id
            }
        };
        if element.attr("from").is_none() {
            if let Some(ref jid) = self.bound_jid {
                element.set_attr("from", jid.clone());
            }
        }
        id
    }

    /// Queues a stanza, assigning an id if it lacks one. Elements that are
    /// not message, presence or iq are queued as control elements untouched.
    pub fn send(&mut self, mut element: Element) -> Option<String> {
        if !StanzaKind::classify(&element).is_countable() {
            self.items.push(Outgoing::Control(element));
            return None;
        }
        let id = self.prepare(&mut element);
        self.items.push(Outgoing::Stanza(element));
        Some(id)
    }

    /// Queues a control element. It gets no id and is never counted.
    pub fn send_control(&mut self, element: Element) {
        self.items.push(Outgoing::Control(element));
    }

    /// Queues an already-counted stanza for retransmission.
    pub fn replay(&mut self, element: Element) {
        self.items.push(Outgoing::Replay(element));
    }

    /// Queues a stanza and calls `callback` when a reply with the same id
    /// arrives from the address the stanza was sent to, ahead of regular
    /// handlers.
    pub fn send_and_call_for_response<F>(&mut self, mut element: Element, callback: F) -> String
    where
        F: FnOnce(&mut S, &Stanza, &mut Outbox<S>) + 'static,
    {
        let id = self.prepare(&mut element);
        let peer = element.attr("to").map(str::to_owned);
        if StanzaKind::classify(&element).is_countable() {
            self.items.push(Outgoing::Stanza(element));
        } else {
            self.items.push(Outgoing::Control(element));
        }
        self.pending.push((
            id.clone(),
            Expected {
                peer,
                callback: Box::new(callback),
            },
        ));
        id
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Takes everything queued so far, in order.
    pub fn drain(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.items)
    }
}

/// Routes parsed stanzas to registered handlers.
pub struct Dispatcher<S> {
    default_ns: String,
    namespaces: HashSet<String>,
    handlers: HashMap<String, HashMap<String, Vec<Registration<S>>>>,
    next_handler: u64,
    expected: HashMap<String, Expected<S>>,
    outbox: Outbox<S>,
    framer: StreamFramer,
    state: StreamState,
    features: Option<Element>,
    on_disconnect: Option<DisconnectFn<S>>,
    disconnect_armed: bool,
}

impl<S> Dispatcher<S> {
    /// Creates a dispatcher for a stream whose default namespace is
    /// `default_ns` (`jabber:client` for clients).
    pub fn new(default_ns: impl Into<String>) -> Self {
        let default_ns = default_ns.into();
        let mut namespaces = HashSet::new();
        namespaces.insert(default_ns.clone());
        namespaces.insert(crate::ns::NS_STREAMS.to_owned());
        Self {
            default_ns,
            namespaces,
            handlers: HashMap::new(),
            next_handler: 0,
            expected: HashMap::new(),
            outbox: Outbox::default(),
            framer: StreamFramer::new(),
            state: StreamState::Disconnected,
            features: None,
            on_disconnect: None,
            disconnect_armed: false,
        }
    }

    pub fn default_namespace(&self) -> &str {
        &self.default_ns
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// The last `<stream:features/>` received.
    pub fn features(&self) -> Option<&Element> {
        self.features.as_ref()
    }

    pub fn outbox(&mut self) -> &mut Outbox<S> {
        &mut self.outbox
    }

    /// Opening tag for our side of the stream.
    pub fn stream_header(&self, to: &str, lang: &str) -> String {
        stream_header(&self.default_ns, to, lang)
    }

    /// Declares a namespace as known. Stanzas in unknown namespaces are
    /// still dispatched, but logged.
    pub fn register_namespace(&mut self, namespace: impl Into<String>) {
        let namespace = namespace.into();
        if self.namespaces.insert(namespace.clone()) {
            debug!(namespace = %namespace, "registered namespace");
        }
    }

    pub fn register_handler<F>(&mut self, spec: HandlerSpec, callback: F) -> HandlerId
    where
        F: FnMut(&mut S, &Stanza, &mut Outbox<S>) -> Handled + 'static,
    {
        let namespace = spec
            .namespace
            .clone()
            .unwrap_or_else(|| self.default_ns.clone());
        self.register_namespace(namespace.clone());

        let id = self.next_handler;
        self.next_handler += 1;
        debug!(
            name = %spec.name,
            namespace = %namespace,
            priority = ?spec.priority,
            system = spec.system,
            "registered handler"
        );
        self.handlers
            .entry(namespace)
            .or_default()
            .entry(spec.name.clone())
            .or_default()
            .push(Registration {
                id,
                spec,
                callback: Box::new(callback),
            });
        HandlerId(id)
    }

    /// Removes a handler. Returns false if it was not registered.
    pub fn unregister_handler(&mut self, handler: HandlerId) -> bool {
        for by_name in self.handlers.values_mut() {
            for registrations in by_name.values_mut() {
                if let Some(index) = registrations.iter().position(|r| r.id == handler.0) {
                    registrations.remove(index);
                    return true;
                }
            }
        }
        false
    }

    /// Sets the callback fired when the stream ends. It fires once per
    /// stream; [`Dispatcher::restart`] arms it again for the next one.
    pub fn set_disconnect_handler<F>(&mut self, callback: F)
    where
        F: FnMut(&mut S) + 'static,
    {
        self.on_disconnect = Some(Box::new(callback));
        self.disconnect_armed = true;
    }

    /// Queues a stanza on the outbox.
    pub fn send(&mut self, element: Element) -> Option<String> {
        self.outbox.send(element)
    }

    pub fn send_and_call_for_response<F>(&mut self, element: Element, callback: F) -> String
    where
        F: FnOnce(&mut S, &Stanza, &mut Outbox<S>) + 'static,
    {
        let id = self.outbox.send_and_call_for_response(element, callback);
        self.absorb_pending();
        id
    }

    /// Prepares for a new stream on the same session (after a transport
    /// reconnect or a stream restart). Handlers, pending responses and the
    /// disconnect callback are kept, and the callback is armed again.
    pub fn restart(&mut self) {
        self.framer = StreamFramer::new();
        self.state = StreamState::Disconnected;
        self.features = None;
        self.disconnect_armed = true;
    }

    /// Feeds received bytes, dispatching every stanza they complete.
    ///
    /// Fatal stream errors fire the disconnect callback and are returned.
    pub fn process_nonblocking(&mut self, state: &mut S, data: &[u8]) -> ProtocolResult<ProcessOutcome> {
        if data.is_empty() {
            return Ok(ProcessOutcome::Idle);
        }
        if self.framer.is_finished() {
            return Err(ProtocolError::StreamClosed);
        }
        trace!(bytes = data.len(), "processing input");

        for event in self.framer.feed(data) {
            match event {
                FrameEvent::Opened(header) => {
                    debug!(id = ?header.id, from = ?header.from, "stream opened");
                    self.state = StreamState::StreamOpened;
                }
                FrameEvent::Stanza(element) => self.dispatch(state, Stanza::new(element)),
                FrameEvent::Discarded(_) => {}
                FrameEvent::Closed => {
                    debug!("stream closed by peer");
                    self.disconnect(state);
                    return Ok(ProcessOutcome::Disconnected);
                }
                FrameEvent::Fatal(err) => {
                    warn!(error = %err, "fatal stream error");
                    self.disconnect(state);
                    return Err(err);
                }
            }
        }
        Ok(ProcessOutcome::Consumed(data.len()))
    }

    fn disconnect(&mut self, state: &mut S) {
        self.state = StreamState::Disconnected;
        if !std::mem::take(&mut self.disconnect_armed) {
            return;
        }
        if let Some(callback) = self.on_disconnect.as_mut() {
            callback(state);
        }
    }

    fn absorb_pending(&mut self) {
        for (id, expected) in self.outbox.pending.drain(..) {
            self.expected.insert(id, expected);
        }
    }

    /// Our own account: the bound jid, its bare form, or the server.
    fn is_own_account(&self, address: &str) -> bool {
        let bound = self.outbox.bound_jid.as_deref();
        let server = self.framer.header().and_then(|h| h.from.as_deref());
        bound.is_some_and(|jid| jid == address || jid.split('/').next() == Some(address))
            || server == Some(address)
    }

    /// Whether a reply from `from` may answer a request sent to `peer`.
    /// Requests without `to` went to our own account, which may answer
    /// without a `from`.
    fn is_expected_sender(&self, peer: Option<&str>, from: Option<&str>) -> bool {
        match (peer, from) {
            (Some(peer), Some(from)) => {
                peer == from || (self.is_own_account(peer) && self.is_own_account(from))
            }
            (Some(peer), None) => self.is_own_account(peer),
            (None, Some(from)) => self.is_own_account(from),
            (None, None) => true,
        }
    }

    fn take_response(&mut self, stanza: &Stanza) -> Option<ResponseFn<S>> {
        let id = stanza.id()?;
        let expected = self.expected.get(id)?;
        if !self.is_expected_sender(expected.peer.as_deref(), stanza.from()) {
            warn!(
                id = %id,
                from = ?stanza.from(),
                expected = ?expected.peer,
                "reply id matches a pending request from another sender"
            );
            return None;
        }
        self.expected.remove(id).map(|expected| expected.callback)
    }

    fn matching(&self, stanza: &Stanza) -> Vec<(Priority, u64, String, usize)> {
        let mut found = Vec::new();
        let Some(by_name) = self.handlers.get(stanza.namespace()) else {
            return found;
        };
        for name in [stanza.name(), ANY_NAME] {
            let Some(registrations) = by_name.get(name) else {
                continue;
            };
            for (index, reg) in registrations.iter().enumerate() {
                if reg.spec.accepts(stanza) {
                    found.push((reg.spec.priority, reg.id, name.to_owned(), index));
                }
            }
        }
        found.sort_by_key(|(priority, id, ..)| (*priority, *id));
        found
    }

    /// Runs one stanza through the handler chain.
    pub fn dispatch(&mut self, state: &mut S, stanza: Stanza) {
        if stanza.kind() == StanzaKind::Features {
            self.features = Some(stanza.element().clone());
        }
        if !self.namespaces.contains(stanza.namespace()) {
            warn!(namespace = %stanza.namespace(), name = %stanza.name(), "stanza in unknown namespace");
        }
        trace!(name = %stanza.name(), id = ?stanza.id(), "dispatching");

        let mut user = true;
        let response = if stanza.is_request() {
            None
        } else {
            self.take_response(&stanza)
        };
        if let Some(callback) = response {
            callback(state, &stanza, &mut self.outbox);
            user = false;
        }

        let namespace = stanza.namespace().to_owned();
        for (_, _, name, index) in self.matching(&stanza) {
            let Some(reg) = self
                .handlers
                .get_mut(&namespace)
                .and_then(|by_name| by_name.get_mut(&name))
                .and_then(|regs| regs.get_mut(index))
            else {
                continue;
            };
            if !user && !reg.spec.system {
                continue;
            }
            if (reg.callback)(state, &stanza, &mut self.outbox) == Handled::Consumed {
                user = false;
            }
        }

        if user && stanza.is_request() {
            debug!(id = ?stanza.id(), from = ?stanza.from(), "no handler answered request");
            self.outbox.send(stanza.error_reply("feature-not-implemented"));
        }
        self.absorb_pending();
    }
}
