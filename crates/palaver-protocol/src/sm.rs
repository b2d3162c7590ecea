//! Stream management: acknowledgement tracking and session resumption.
//!
//! [`StreamManagement`] is a pure state machine. Everything that happens to
//! the session goes in through [`StreamManagement::advance`] as an
//! [`SmEvent`], and what the caller must do comes back as [`SmAction`]s.
//! [`register_handlers`] wires it into a [`Dispatcher`] so inbound stanzas
//! are counted before any other handler sees them.
//!
//! Outbound stanzas are kept in the unacked queue until the server
//! acknowledges them. The queue is never dropped on transport loss; it is
//! replayed on resumption, or handed back to the caller when the server no
//! longer knows the session.

use std::collections::VecDeque;

use tracing::{debug, error, info, warn};

use crate::dispatcher::{ANY_NAME, Dispatcher, Handled, HandlerSpec, Outbox, Outgoing, Priority};
use crate::element::Element;
use crate::error::NegotiationError;
use crate::ns::{NS_SM, NS_STANZAS};

/// Default number of unacknowledged stanzas after which an ack is requested.
pub const DEFAULT_ACK_EVERY: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmState {
    Disabled,
    Negotiating,
    Enabled,
    Resuming,
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmEvent {
    /// Ask the server to enable stream management.
    Negotiate { resume: bool },
    /// Server sent `<enabled/>`.
    Enabled {
        id: Option<String>,
        resume: bool,
        max: Option<u32>,
    },
    /// Server sent `<failed/>`.
    Failed { condition: Option<String> },
    /// Server sent `<r/>`.
    AckRequested,
    /// Server sent `<a h='..'/>`.
    Acked { h: u32 },
    /// Ask the server to resume the previous session.
    Resume,
    /// Server sent `<resumed/>`.
    Resumed { h: u32, previd: Option<String> },
    /// A countable stanza was written to the stream.
    Sent(Element),
    /// A countable stanza was received.
    Received,
    /// A negotiation or resumption request went unanswered.
    Timeout,
    /// The transport went away.
    TransportLost,
}

impl SmEvent {
    /// Parses a control element received from the server.
    pub fn from_element(element: &Element) -> Option<Self> {
        if element.namespace() != NS_SM {
            return None;
        }
        let event = match element.name() {
            "enabled" => Self::Enabled {
                id: element.attr("id").map(str::to_owned),
                resume: matches!(element.attr("resume"), Some("true" | "1")),
                max: element.attr("max").and_then(|m| m.parse().ok()),
            },
            "failed" => Self::Failed {
                condition: element
                    .children()
                    .find(|c| c.namespace() == NS_STANZAS)
                    .map(|c| c.name().to_owned()),
            },
            "r" => Self::AckRequested,
            "a" => Self::Acked {
                h: parse_h(element)?,
            },
            "resumed" => Self::Resumed {
                h: parse_h(element)?,
                previd: element.attr("previd").map(str::to_owned),
            },
            other => {
                debug!(name = other, "ignoring stream management element");
                return None;
            }
        };
        Some(event)
    }
}

fn parse_h(element: &Element) -> Option<u32> {
    let h = element.attr("h")?;
    match h.parse() {
        Ok(h) => Some(h),
        Err(_) => {
            warn!(h = h, name = element.name(), "invalid h attribute");
            None
        }
    }
}

/// Things the caller should know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmNotice {
    Enabled { resumable: bool },
    Resumed { replayed: usize },
    /// The server lost the session. Bind afresh and negotiate again; the
    /// stanzas that were never acknowledged are handed back.
    Rebind { abandoned: Vec<Element> },
    Failed(NegotiationError),
}

/// Outputs of the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmAction {
    /// Write a control element. It is not counted.
    Send(Element),
    /// Retransmit these stanzas, in order. They are already counted.
    Replay(Vec<Element>),
    Notify(SmNotice),
}

pub fn enable_element(resume: bool) -> Element {
    let el = Element::new("enable", NS_SM);
    if resume { el.with_attr("resume", "true") } else { el }
}

pub fn request_element() -> Element {
    Element::new("r", NS_SM)
}

pub fn ack_element(h: u32) -> Element {
    Element::new("a", NS_SM).with_attr("h", h.to_string())
}

pub fn resume_element(h: u32, previd: &str) -> Element {
    Element::new("resume", NS_SM)
        .with_attr("h", h.to_string())
        .with_attr("previd", previd)
}

/// Per-session acknowledgement state.
#[derive(Debug)]
pub struct StreamManagement {
    state: SmState,
    out_h: u32,
    in_h: u32,
    unacked: VecDeque<Element>,
    session_id: Option<String>,
    resumption_allowed: bool,
    max: Option<u32>,
    ack_every: usize,
    requested_resume: bool,
    retried: bool,
}

impl Default for StreamManagement {
    fn default() -> Self {
        Self::new(DEFAULT_ACK_EVERY)
    }
}

impl StreamManagement {
    /// `ack_every` of zero disables periodic ack requests.
    pub fn new(ack_every: usize) -> Self {
        Self {
            state: SmState::Disabled,
            out_h: 0,
            in_h: 0,
            unacked: VecDeque::new(),
            session_id: None,
            resumption_allowed: false,
            max: None,
            ack_every,
            requested_resume: false,
            retried: false,
        }
    }

    pub fn state(&self) -> SmState {
        self.state
    }

    pub fn is_enabled(&self) -> bool {
        self.state == SmState::Enabled
    }

    pub fn out_h(&self) -> u32 {
        self.out_h
    }

    pub fn in_h(&self) -> u32 {
        self.in_h
    }

    pub fn unacked(&self) -> impl Iterator<Item = &Element> {
        self.unacked.iter()
    }

    pub fn unacked_len(&self) -> usize {
        self.unacked.len()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn resumption_allowed(&self) -> bool {
        self.resumption_allowed
    }

    /// Longest resumption delay the server offered, in seconds.
    pub fn max_resume_time(&self) -> Option<u32> {
        self.max
    }

    /// Feeds one event and returns what to do about it.
    pub fn advance(&mut self, event: SmEvent) -> Vec<SmAction> {
        match event {
            SmEvent::Negotiate { resume } => vec![SmAction::Send(self.negotiate(resume))],
            SmEvent::Enabled { id, resume, max } => self.on_enabled(id, resume, max),
            SmEvent::Failed { condition } => self.on_failed(condition),
            SmEvent::AckRequested => {
                if self.state == SmState::Enabled {
                    vec![SmAction::Send(self.send_ack())]
                } else {
                    debug!(state = ?self.state, "ignoring ack request");
                    Vec::new()
                }
            }
            SmEvent::Acked { h } => {
                // A mismatched ack is logged by on_ack and otherwise ignored.
                let _ = self.on_ack(h);
                Vec::new()
            }
            SmEvent::Resume => match self.resume_request() {
                Ok(element) => vec![SmAction::Send(element)],
                Err(err) => vec![SmAction::Notify(SmNotice::Failed(err))],
            },
            SmEvent::Resumed { h, previd } => self.on_resumed(h, previd),
            SmEvent::Sent(element) => self.on_send(element).map(SmAction::Send).into_iter().collect(),
            SmEvent::Received => {
                if self.state == SmState::Enabled {
                    self.in_h = self.in_h.wrapping_add(1);
                }
                Vec::new()
            }
            SmEvent::Timeout => self.on_timeout(),
            SmEvent::TransportLost => {
                self.on_transport_lost();
                Vec::new()
            }
        }
    }

    /// Starts a fresh session: counters and queue are reset.
    pub fn negotiate(&mut self, resume: bool) -> Element {
        info!(resume = resume, "negotiating stream management");
        self.state = SmState::Negotiating;
        self.out_h = 0;
        self.in_h = 0;
        self.unacked.clear();
        self.session_id = None;
        self.resumption_allowed = false;
        self.max = None;
        self.requested_resume = resume;
        self.retried = false;
        enable_element(resume)
    }

    /// Records a stanza written to the stream. Returns an ack request when
    /// the unacked queue reaches a multiple of `ack_every`.
    pub fn on_send(&mut self, element: Element) -> Option<Element> {
        if self.state != SmState::Enabled {
            return None;
        }
        self.out_h = self.out_h.wrapping_add(1);
        self.unacked.push_back(element);
        if self.ack_every > 0 && self.unacked.len() % self.ack_every == 0 {
            return Some(self.request_ack());
        }
        None
    }

    /// Answer to a server `<r/>`.
    pub fn send_ack(&self) -> Element {
        ack_element(self.in_h)
    }

    pub fn request_ack(&self) -> Element {
        request_element()
    }

    /// Drops acknowledged stanzas from the front of the queue and returns
    /// how many were dropped. An `h` that acknowledges more than was sent
    /// leaves the queue untouched.
    pub fn on_ack(&mut self, h: u32) -> Result<usize, NegotiationError> {
        let pending = self.out_h.wrapping_sub(h) as usize;
        if pending > self.unacked.len() {
            error!(
                h = h,
                out_h = self.out_h,
                queued = self.unacked.len(),
                "server acknowledged stanzas that were never sent"
            );
            return Err(NegotiationError::ConsistencyError(format!(
                "ack h={h} does not match out_h={} with {} queued",
                self.out_h,
                self.unacked.len()
            )));
        }
        let acked = self.unacked.len() - pending;
        self.unacked.drain(..acked);
        debug!(h = h, acked = acked, queued = self.unacked.len(), "ack received");
        Ok(acked)
    }

    /// Builds the resumption request. Fails locally, without touching the
    /// network, when there is no resumable session.
    pub fn resume_request(&mut self) -> Result<Element, NegotiationError> {
        let id = match self.session_id {
            Some(ref id) if self.resumption_allowed => id.clone(),
            _ => {
                return Err(NegotiationError::ConsistencyError(
                    "no resumable session".into(),
                ));
            }
        };
        info!(previd = %id, h = self.in_h, queued = self.unacked.len(), "resuming session");
        self.state = SmState::Resuming;
        Ok(resume_element(self.in_h, &id))
    }

    fn on_enabled(&mut self, id: Option<String>, resume: bool, max: Option<u32>) -> Vec<SmAction> {
        if self.state != SmState::Negotiating {
            warn!(state = ?self.state, "unexpected enabled");
            return Vec::new();
        }
        self.state = SmState::Enabled;
        self.resumption_allowed = resume && id.is_some();
        self.session_id = id;
        self.max = max;
        info!(
            id = ?self.session_id,
            resumable = self.resumption_allowed,
            max = ?self.max,
            "stream management enabled"
        );
        vec![SmAction::Notify(SmNotice::Enabled {
            resumable: self.resumption_allowed,
        })]
    }

    fn on_failed(&mut self, condition: Option<String>) -> Vec<SmAction> {
        match self.state {
            SmState::Negotiating => {
                if self.requested_resume && !self.retried {
                    warn!(condition = ?condition, "enable with resumption refused, retrying without");
                    self.retried = true;
                    self.requested_resume = false;
                    return vec![SmAction::Send(enable_element(false))];
                }
                self.state = SmState::Disabled;
                let err = match condition.as_deref() {
                    Some("feature-not-implemented") => NegotiationError::Unsupported,
                    _ => NegotiationError::Rejected { condition },
                };
                warn!(error = %err, "stream management unavailable");
                vec![SmAction::Notify(SmNotice::Failed(err))]
            }
            SmState::Resuming => {
                warn!(condition = ?condition, "resumption failed, binding afresh");
                self.state = SmState::Disabled;
                self.session_id = None;
                self.resumption_allowed = false;
                self.out_h = 0;
                self.in_h = 0;
                let abandoned = self.unacked.drain(..).collect();
                vec![SmAction::Notify(SmNotice::Rebind { abandoned })]
            }
            SmState::Enabled => {
                warn!(condition = ?condition, "server reported a stream management failure");
                vec![SmAction::Notify(SmNotice::Failed(NegotiationError::Rejected {
                    condition,
                }))]
            }
            SmState::Disabled => {
                debug!(condition = ?condition, "ignoring failed while disabled");
                Vec::new()
            }
        }
    }

    fn on_resumed(&mut self, h: u32, previd: Option<String>) -> Vec<SmAction> {
        if self.state != SmState::Resuming {
            warn!(state = ?self.state, "unexpected resumed");
            return Vec::new();
        }
        if previd.as_deref() != self.session_id.as_deref() {
            warn!(previd = ?previd, id = ?self.session_id, "resumed a different session id");
        }
        let _ = self.on_ack(h);
        self.state = SmState::Enabled;

        let replay: Vec<Element> = self.unacked.iter().cloned().collect();
        let replayed = replay.len();
        info!(h = h, replayed = replayed, "session resumed");

        let mut actions = Vec::new();
        if !replay.is_empty() {
            actions.push(SmAction::Replay(replay));
        }
        actions.push(SmAction::Notify(SmNotice::Resumed { replayed }));
        actions
    }

    fn on_timeout(&mut self) -> Vec<SmAction> {
        match self.state {
            SmState::Negotiating | SmState::Resuming => {
                warn!(state = ?self.state, "stream management request timed out");
                // The session id and queue survive so resumption can be retried.
                self.state = SmState::Disabled;
                vec![SmAction::Notify(SmNotice::Failed(NegotiationError::Timeout))]
            }
            _ => Vec::new(),
        }
    }

    fn on_transport_lost(&mut self) {
        debug!(state = ?self.state, queued = self.unacked.len(), "transport lost");
        if matches!(self.state, SmState::Negotiating | SmState::Resuming) {
            self.state = SmState::Disabled;
        }
    }

    /// Runs an outgoing element through the counters and returns what to
    /// write, in order.
    pub fn track_outgoing(&mut self, outgoing: Outgoing) -> Vec<Element> {
        match outgoing {
            Outgoing::Stanza(element) => {
                let request = self.on_send(element.clone());
                let mut out = vec![element];
                out.extend(request);
                out
            }
            Outgoing::Control(element) | Outgoing::Replay(element) => vec![element],
        }
    }
}

/// Connection state that carries a stream management session.
pub trait StreamManaged {
    fn stream_management(&mut self) -> &mut StreamManagement;

    /// Called for every notice the session produces.
    fn on_stream_management(&mut self, notice: SmNotice);
}

/// Applies actions: control elements and replays go to the outbox, notices
/// to the state.
pub fn apply_actions<S: StreamManaged>(state: &mut S, actions: Vec<SmAction>, out: &mut Outbox<S>) {
    for action in actions {
        match action {
            SmAction::Send(element) => out.send_control(element),
            SmAction::Replay(elements) => {
                for element in elements {
                    out.replay(element);
                }
            }
            SmAction::Notify(notice) => state.on_stream_management(notice),
        }
    }
}

/// Registers inbound counting (`Early`) and control element handling
/// (`Core`). Both are system handlers so consumed stanzas still count.
pub fn register_handlers<S: StreamManaged + 'static>(dispatcher: &mut Dispatcher<S>) {
    for name in ["message", "presence", "iq"] {
        dispatcher.register_handler(
            HandlerSpec::new(name).priority(Priority::Early).system(),
            |state: &mut S, _, _| {
                state.stream_management().advance(SmEvent::Received);
                Handled::Pass
            },
        );
    }
    dispatcher.register_handler(
        HandlerSpec::new(ANY_NAME)
            .namespace(NS_SM)
            .priority(Priority::Core)
            .system(),
        |state: &mut S, stanza, out| {
            if let Some(event) = SmEvent::from_element(stanza.element()) {
                let actions = state.stream_management().advance(event);
                apply_actions(state, actions, out);
            }
            Handled::Consumed
        },
    );
}
