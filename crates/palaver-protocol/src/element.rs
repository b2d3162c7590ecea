//! A small owned XML element tree.
//!
//! Elements carry their resolved namespace URI rather than a prefix, so two
//! stanzas compare equal regardless of how the sender spelled their prefixes.
//! Attribute names are kept as written (`xml:lang`, `type`, ...).

use std::fmt::Write as _;

use quick_xml::escape::escape;

/// A child node: either a nested element or character data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

/// An XML element with a resolved namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    name: String,
    namespace: String,
    attrs: Vec<(String, String)>,
    children: Vec<Node>,
}

impl Element {
    /// Creates an empty element.
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Builder form of [`Element::set_attr`].
    #[must_use]
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    /// Builder form of [`Element::push_child`].
    #[must_use]
    pub fn with_child(mut self, child: Element) -> Self {
        self.push_child(child);
        self
    }

    /// Appends character data.
    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.children.push(Node::Text(text.into()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Returns true if the element has the given local name and namespace.
    pub fn is(&self, name: &str, namespace: &str) -> bool {
        self.name == name && self.namespace == namespace
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Sets an attribute, replacing any previous value in place.
    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.attrs.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.attrs.push((key, value)),
        }
    }

    pub fn remove_attr(&mut self, key: &str) -> Option<String> {
        let index = self.attrs.iter().position(|(k, _)| k == key)?;
        Some(self.attrs.remove(index).1)
    }

    pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn push_child(&mut self, child: Element) {
        self.children.push(Node::Element(child));
    }

    pub(crate) fn push_node(&mut self, node: Node) {
        self.children.push(node);
    }

    pub fn nodes(&self) -> &[Node] {
        &self.children
    }

    /// Iterates over child elements, skipping text.
    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(el) => Some(el),
            Node::Text(_) => None,
        })
    }

    /// Returns the first child with the given name and namespace.
    pub fn child(&self, name: &str, namespace: &str) -> Option<&Element> {
        self.children().find(|el| el.is(name, namespace))
    }

    pub fn has_child(&self, name: &str, namespace: &str) -> bool {
        self.child(name, namespace).is_some()
    }

    /// Concatenated character data of this element (not its descendants).
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                Node::Text(t) => Some(t.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    /// Serializes the element, declaring its namespace on the root.
    pub fn to_xml(&self) -> String {
        self.to_xml_in("")
    }

    /// Serializes the element as it appears inside a parent whose default
    /// namespace is `parent_ns`. Stanzas written onto a `jabber:client`
    /// stream pass that namespace so the redundant declaration is omitted.
    pub fn to_xml_in(&self, parent_ns: &str) -> String {
        let mut out = String::new();
        self.write_into(&mut out, parent_ns);
        out
    }

    fn write_into(&self, out: &mut String, parent_ns: &str) {
        out.push('<');
        out.push_str(&self.name);
        if self.namespace != parent_ns {
            let _ = write!(out, " xmlns='{}'", escape(self.namespace.as_str()));
        }
        for (key, value) in &self.attrs {
            let _ = write!(out, " {}='{}'", key, escape(value.as_str()));
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for node in &self.children {
            match node {
                Node::Element(child) => child.write_into(out, &self.namespace),
                Node::Text(text) => out.push_str(&escape(text.as_str())),
            }
        }
        let _ = write!(out, "</{}>", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_keep_insertion_order_and_replace_in_place() {
        let mut el = Element::new("iq", "jabber:client")
            .with_attr("type", "get")
            .with_attr("id", "1");
        el.set_attr("type", "set");

        let attrs: Vec<_> = el.attrs().collect();
        assert_eq!(attrs, vec![("type", "set"), ("id", "1")]);
        assert_eq!(el.remove_attr("id").as_deref(), Some("1"));
        assert_eq!(el.attr("id"), None);
    }

    #[test]
    fn child_lookup_respects_namespace() {
        let el = Element::new("iq", "jabber:client")
            .with_child(Element::new("query", "http://jabber.org/protocol/disco#info"));

        assert!(el.has_child("query", "http://jabber.org/protocol/disco#info"));
        assert!(!el.has_child("query", "http://jabber.org/protocol/bytestreams"));
    }

    #[test]
    fn serializes_namespace_only_when_it_changes() {
        let el = Element::new("iq", "jabber:client")
            .with_attr("type", "get")
            .with_child(Element::new("query", "http://jabber.org/protocol/bytestreams"));

        insta::assert_snapshot!(
            el.to_xml_in("jabber:client"),
            @"<iq type='get'><query xmlns='http://jabber.org/protocol/bytestreams'/></iq>"
        );
    }

    #[test]
    fn escapes_text_and_attribute_values() {
        let el = Element::new("body", "jabber:client")
            .with_attr("note", "it's <b>")
            .with_text("a & b");

        assert_eq!(
            el.to_xml_in("jabber:client"),
            "<body note='it&apos;s &lt;b&gt;'>a &amp; b</body>"
        );
        assert_eq!(el.text(), "a & b");
    }
}
