//! The stanza model: a parsed top-level element tagged with its kind.

use crate::element::Element;
use crate::ns::{NS_CLIENT, NS_SM, NS_STANZAS, NS_STREAMS};

/// What kind of top-level element a stanza is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaKind {
    Message,
    Presence,
    Iq,
    /// A stream management control element (`<r/>`, `<a/>`, `<enabled/>` ...).
    StreamManagement,
    /// `<stream:features/>`.
    Features,
    /// `<stream:error/>`.
    StreamError,
    Other,
}

impl StanzaKind {
    pub(crate) fn classify(element: &Element) -> Self {
        match (element.namespace(), element.name()) {
            (NS_CLIENT, "message") => Self::Message,
            (NS_CLIENT, "presence") => Self::Presence,
            (NS_CLIENT, "iq") => Self::Iq,
            (NS_SM, _) => Self::StreamManagement,
            (NS_STREAMS, "features") => Self::Features,
            (NS_STREAMS, "error") => Self::StreamError,
            _ => Self::Other,
        }
    }

    /// Message, presence and iq are the stanzas counted by stream management.
    pub fn is_countable(self) -> bool {
        matches!(self, Self::Message | Self::Presence | Self::Iq)
    }
}

/// An immutable parsed stanza.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stanza {
    kind: StanzaKind,
    element: Element,
}

impl Stanza {
    pub fn new(element: Element) -> Self {
        Self {
            kind: StanzaKind::classify(&element),
            element,
        }
    }

    pub fn kind(&self) -> StanzaKind {
        self.kind
    }

    pub fn element(&self) -> &Element {
        &self.element
    }

    pub fn into_element(self) -> Element {
        self.element
    }

    pub fn name(&self) -> &str {
        self.element.name()
    }

    pub fn namespace(&self) -> &str {
        self.element.namespace()
    }

    pub fn id(&self) -> Option<&str> {
        self.element.attr("id")
    }

    pub fn from(&self) -> Option<&str> {
        self.element.attr("from")
    }

    pub fn to(&self) -> Option<&str> {
        self.element.attr("to")
    }

    /// The `type` attribute.
    pub fn stanza_type(&self) -> Option<&str> {
        self.element.attr("type")
    }

    /// Namespaces of the direct child elements, in document order.
    pub fn child_namespaces(&self) -> impl Iterator<Item = &str> {
        self.element.children().map(Element::namespace)
    }

    /// Returns true for an iq `get` or `set`, which must always be answered.
    pub fn is_request(&self) -> bool {
        self.kind == StanzaKind::Iq && matches!(self.stanza_type(), Some("get" | "set"))
    }

    /// Builds a `type='error'` reply carrying the given stanza error
    /// condition. The addresses are swapped and the id is preserved; the
    /// payload of the request is not echoed back.
    pub fn error_reply(&self, condition: &str) -> Element {
        let mut reply = Element::new(self.element.name(), self.element.namespace());
        if let Some(from) = self.from() {
            reply.set_attr("to", from);
        }
        if let Some(to) = self.to() {
            reply.set_attr("from", to);
        }
        if let Some(id) = self.id() {
            reply.set_attr("id", id);
        }
        reply.set_attr("type", "error");
        reply.with_child(
            Element::new("error", self.element.namespace())
                .with_attr("type", "cancel")
                .with_child(Element::new(condition, NS_STANZAS)),
        )
    }

    /// Builds an empty `type='result'` reply to an iq request.
    pub fn result_reply(&self) -> Element {
        let mut reply = Element::new("iq", self.element.namespace());
        if let Some(from) = self.from() {
            reply.set_attr("to", from);
        }
        if let Some(id) = self.id() {
            reply.set_attr("id", id);
        }
        reply.with_attr("type", "result")
    }
}

impl From<Element> for Stanza {
    fn from(element: Element) -> Self {
        Self::new(element)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iq(kind: &str) -> Stanza {
        Stanza::new(
            Element::new("iq", NS_CLIENT)
                .with_attr("type", kind)
                .with_attr("id", "abc")
                .with_attr("from", "juliet@example.com/balcony")
                .with_attr("to", "romeo@example.net/orchard")
                .with_child(Element::new("query", "urn:example:unknown")),
        )
    }

    #[test]
    fn classifies_by_name_and_namespace() {
        assert_eq!(iq("get").kind(), StanzaKind::Iq);
        assert_eq!(
            Stanza::new(Element::new("r", NS_SM)).kind(),
            StanzaKind::StreamManagement
        );
        assert_eq!(
            Stanza::new(Element::new("features", NS_STREAMS)).kind(),
            StanzaKind::Features
        );
        assert_eq!(
            Stanza::new(Element::new("message", "jabber:server")).kind(),
            StanzaKind::Other
        );
    }

    #[test]
    fn only_get_and_set_are_requests() {
        assert!(iq("get").is_request());
        assert!(iq("set").is_request());
        assert!(!iq("result").is_request());
        assert!(!iq("error").is_request());
    }

    #[test]
    fn error_reply_swaps_addresses_and_keeps_id() {
        let reply = iq("get").error_reply("feature-not-implemented");

        insta::assert_snapshot!(
            reply.to_xml_in(NS_CLIENT),
            @"<iq to='juliet@example.com/balcony' from='romeo@example.net/orchard' id='abc' type='error'><error type='cancel'><feature-not-implemented xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></iq>"
        );
    }

    #[test]
    fn child_namespaces_in_document_order() {
        let stanza = Stanza::new(
            Element::new("message", NS_CLIENT)
                .with_child(Element::new("body", NS_CLIENT))
                .with_child(Element::new("active", "http://jabber.org/protocol/chatstates")),
        );
        let namespaces: Vec<_> = stanza.child_namespaces().collect();
        assert_eq!(
            namespaces,
            vec![NS_CLIENT, "http://jabber.org/protocol/chatstates"]
        );
    }
}
