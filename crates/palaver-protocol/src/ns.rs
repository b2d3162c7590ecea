//! Namespace URIs used on the wire.

pub const NS_CLIENT: &str = "jabber:client";
pub const NS_STREAMS: &str = "http://etherx.jabber.org/streams";
pub const NS_STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
pub const NS_SM: &str = "urn:xmpp:sm:3";
pub const NS_BYTESTREAMS: &str = "http://jabber.org/protocol/bytestreams";
pub const NS_DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";
pub const NS_CAPS: &str = "http://jabber.org/protocol/caps";
pub const NS_DATA_FORMS: &str = "jabber:x:data";
