//! Incremental framing of an XML stream into stanzas.
//!
//! Bytes arrive in arbitrary chunks. The framer scans markup just far enough
//! to track nesting depth, and once a depth-1 element is complete it hands
//! that slice to `quick_xml`'s namespace-aware reader. Namespace bindings
//! declared on the stream header are re-declared around each stanza, so a
//! stanza that fails to parse (an unbound prefix, a mismatched end tag) is
//! dropped on its own and the stream carries on.

use quick_xml::NsReader;
use quick_xml::events::{BytesStart, Event};
use quick_xml::escape::escape;
use quick_xml::name::ResolveResult;
use tracing::{trace, warn};

use crate::element::{Element, Node};
use crate::error::{ProtocolError, ProtocolResult};
use crate::ns::NS_STREAMS;

/// Largest stanza the framer will buffer.
pub const MAX_STANZA_SIZE: usize = 1024 * 1024;

const WRAPPER: &str = "palaver-wrapper";

/// Attributes of the peer's `<stream:stream>` header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHeader {
    pub id: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub version: Option<String>,
    pub lang: Option<String>,
    declarations: Vec<(String, String)>,
}

impl StreamHeader {
    /// The default namespace declared on the stream, if any.
    pub fn default_namespace(&self) -> Option<&str> {
        self.declarations
            .iter()
            .find(|(k, _)| k == "xmlns")
            .map(|(_, v)| v.as_str())
    }

    fn wrapper_open(&self) -> String {
        let mut open = format!("<{WRAPPER}");
        for (key, value) in &self.declarations {
            open.push_str(&format!(" {}='{}'", key, escape(value.as_str())));
        }
        open.push('>');
        open
    }
}

/// Something the framer recognised in the byte stream.
#[derive(Debug)]
pub enum FrameEvent {
    /// The peer's stream header.
    Opened(StreamHeader),
    /// A complete, parsed top-level element.
    Stanza(Element),
    /// A complete top-level element that could not be parsed.
    Discarded(ProtocolError),
    /// The closing `</stream:stream>` tag.
    Closed,
    /// The stream is unusable. No further events follow.
    Fatal(ProtocolError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Markup {
    Skip,
    Start,
    Empty,
    End,
}

/// Splits an incoming byte stream into stanzas.
#[derive(Debug)]
pub struct StreamFramer {
    buf: Vec<u8>,
    scan: usize,
    depth: usize,
    stanza_start: Option<usize>,
    header: Option<StreamHeader>,
    wrapper_open: String,
    finished: bool,
    max_stanza_size: usize,
}

impl Default for StreamFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamFramer {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            scan: 0,
            depth: 0,
            stanza_start: None,
            header: None,
            wrapper_open: String::new(),
            finished: false,
            max_stanza_size: MAX_STANZA_SIZE,
        }
    }

    #[must_use]
    pub fn with_max_stanza_size(mut self, max: usize) -> Self {
        self.max_stanza_size = max;
        self
    }

    /// The peer's stream header once it has been seen.
    pub fn header(&self) -> Option<&StreamHeader> {
        self.header.as_ref()
    }

    /// Returns true once the stream was closed or failed.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feeds received bytes and returns everything they completed.
    pub fn feed(&mut self, data: &[u8]) -> Vec<FrameEvent> {
        if self.finished {
            return vec![FrameEvent::Fatal(ProtocolError::StreamClosed)];
        }
        self.buf.extend_from_slice(data);

        let mut events = Vec::new();
        while let Some(offset) = self.buf[self.scan..].iter().position(|&b| b == b'<') {
            let start = self.scan + offset;
            let Some((markup, end)) = scan_markup(&self.buf, start) else {
                self.scan = start;
                break;
            };
            self.scan = end;

            if let Err(err) = self.on_markup(markup, start, end, &mut events) {
                self.finished = true;
                events.push(FrameEvent::Fatal(err));
                return events;
            }
            if self.finished {
                return events;
            }
        }
        if !self.buf[self.scan..].contains(&b'<') {
            // Character data between stanzas is whitespace keepalive.
            self.scan = self.buf.len();
        }

        // Everything from `keep` on stays buffered: a stanza in progress or
        // a tag that has not closed yet.
        let keep = self.stanza_start.unwrap_or(self.scan);
        let size = self.buf.len() - keep;
        if size > self.max_stanza_size {
            self.finished = true;
            events.push(FrameEvent::Fatal(ProtocolError::StanzaTooLarge {
                size,
                max: self.max_stanza_size,
            }));
            return events;
        }

        self.buf.drain(..keep);
        self.scan -= keep;
        if self.stanza_start.is_some() {
            self.stanza_start = Some(0);
        }
        events
    }

    fn on_markup(
        &mut self,
        markup: Markup,
        start: usize,
        end: usize,
        events: &mut Vec<FrameEvent>,
    ) -> ProtocolResult<()> {
        match (self.depth, markup) {
            (_, Markup::Skip) => {}
            (0, Markup::Start | Markup::Empty) => {
                let header = parse_header(&self.buf[start..end])?;
                trace!(id = ?header.id, from = ?header.from, "stream opened");
                self.wrapper_open = header.wrapper_open();
                self.header = Some(header.clone());
                events.push(FrameEvent::Opened(header));
                if markup == Markup::Empty {
                    self.finished = true;
                    events.push(FrameEvent::Closed);
                } else {
                    self.depth = 1;
                }
            }
            (0, Markup::End) => {
                return Err(ProtocolError::MalformedStream(
                    "end tag before stream header".into(),
                ));
            }
            (1, Markup::Start) => {
                self.stanza_start = Some(start);
                self.depth = 2;
            }
            (1, Markup::Empty) => {
                events.push(self.parse_stanza(start, end));
            }
            (1, Markup::End) => {
                self.depth = 0;
                self.finished = true;
                events.push(FrameEvent::Closed);
            }
            (_, Markup::Start) => self.depth += 1,
            (_, Markup::Empty) => {}
            (_, Markup::End) => {
                self.depth -= 1;
                if self.depth == 1 {
                    let from = self.stanza_start.take().unwrap_or(start);
                    events.push(self.parse_stanza(from, end));
                }
            }
        }
        Ok(())
    }

    fn parse_stanza(&self, start: usize, end: usize) -> FrameEvent {
        match parse_wrapped(&self.wrapper_open, &self.buf[start..end]) {
            Ok(element) => FrameEvent::Stanza(element),
            Err(err) => {
                warn!(error = %err, "discarding unparseable stanza");
                FrameEvent::Discarded(err)
            }
        }
    }
}

/// Builds the opening tag of a client stream.
pub fn stream_header(default_ns: &str, to: &str, lang: &str) -> String {
    format!(
        "<?xml version='1.0'?><stream:stream xmlns='{}' xmlns:stream='{}' to='{}' version='1.0' xml:lang='{}'>",
        escape(default_ns),
        NS_STREAMS,
        escape(to),
        escape(lang)
    )
}

/// The closing tag of a stream.
pub const STREAM_FOOTER: &str = "</stream:stream>";

/// Classifies the markup starting at `buf[start] == b'<'` and returns where
/// it ends, or `None` if more bytes are needed.
fn scan_markup(buf: &[u8], start: usize) -> Option<(Markup, usize)> {
    let rest = &buf[start..];
    if rest.len() < 2 {
        return None;
    }
    if rest.starts_with(b"<?") {
        return find(buf, b"?>", start + 2).map(|i| (Markup::Skip, i + 2));
    }
    if rest[1] == b'!' {
        for (open, close) in [(&b"<!--"[..], &b"-->"[..]), (&b"<![CDATA["[..], &b"]]>"[..])] {
            if rest.len() < open.len() && open.starts_with(rest) {
                return None;
            }
            if rest.starts_with(open) {
                return find(buf, close, start + open.len()).map(|i| (Markup::Skip, i + close.len()));
            }
        }
        return find(buf, b">", start + 2).map(|i| (Markup::Skip, i + 1));
    }

    let mut quote = None;
    for (i, &b) in rest.iter().enumerate().skip(1) {
        match (quote, b) {
            (None, b'"' | b'\'') => quote = Some(b),
            (Some(q), _) if q == b => quote = None,
            (None, b'>') => {
                let kind = if rest[1] == b'/' {
                    Markup::End
                } else if rest[i - 1] == b'/' {
                    Markup::Empty
                } else {
                    Markup::Start
                };
                return Some((kind, start + i + 1));
            }
            _ => {}
        }
    }
    None
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| from + i)
}

fn namespace_of(result: ResolveResult<'_>) -> ProtocolResult<String> {
    match result {
        ResolveResult::Bound(ns) => Ok(String::from_utf8_lossy(ns.as_ref()).into_owned()),
        ResolveResult::Unbound => Ok(String::new()),
        ResolveResult::Unknown(prefix) => Err(ProtocolError::unbound_prefix(
            String::from_utf8_lossy(&prefix),
        )),
    }
}

fn parse_header(tag: &[u8]) -> ProtocolResult<StreamHeader> {
    let text = std::str::from_utf8(tag).map_err(|_| ProtocolError::InvalidUtf8)?;
    let body = text.trim_end_matches('>').trim_end_matches('/');
    let doc = format!("{body}/>");

    let mut reader = NsReader::from_str(&doc);
    loop {
        let (ns, event) = reader.read_resolved_event()?;
        let namespace = namespace_of(ns);
        match event {
            Event::Empty(e) => {
                let namespace = namespace?;
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if namespace != NS_STREAMS || name != "stream" {
                    return Err(ProtocolError::InvalidStreamStart { name, namespace });
                }

                let mut header = StreamHeader::default();
                for attr in e.attributes() {
                    let attr = attr.map_err(quick_xml::Error::from)?;
                    let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
                    let value = attr.unescape_value()?.into_owned();
                    match key.as_str() {
                        "id" => header.id = Some(value),
                        "from" => header.from = Some(value),
                        "to" => header.to = Some(value),
                        "version" => header.version = Some(value),
                        "xml:lang" => header.lang = Some(value),
                        k if k == "xmlns" || k.starts_with("xmlns:") => {
                            header.declarations.push((key, value));
                        }
                        _ => {}
                    }
                }
                return Ok(header);
            }
            Event::Eof => {
                return Err(ProtocolError::MalformedStream("empty stream header".into()));
            }
            _ => {}
        }
    }
}

fn parse_wrapped(wrapper_open: &str, stanza: &[u8]) -> ProtocolResult<Element> {
    let text = std::str::from_utf8(stanza).map_err(|_| ProtocolError::InvalidUtf8)?;
    let doc = format!("{wrapper_open}{text}</{WRAPPER}>");

    let mut reader = NsReader::from_str(&doc);
    let mut stack: Vec<Element> = Vec::new();
    let mut in_wrapper = false;
    loop {
        let (ns, event) = reader.read_resolved_event()?;
        let namespace = namespace_of(ns);
        match event {
            Event::Start(_) if !in_wrapper => in_wrapper = true,
            Event::Start(e) => {
                stack.push(start_element(&reader, namespace?, &e)?);
            }
            Event::Empty(e) => {
                let element = start_element(&reader, namespace?, &e)?;
                match stack.last_mut() {
                    Some(parent) => parent.push_child(element),
                    None => return Ok(element),
                }
            }
            Event::End(_) => {
                let Some(element) = stack.pop() else {
                    break;
                };
                match stack.last_mut() {
                    Some(parent) => parent.push_child(element),
                    None => return Ok(element),
                }
            }
            Event::Text(t) => {
                if let Some(top) = stack.last_mut() {
                    let text = t.unescape()?;
                    if !text.trim().is_empty() {
                        top.push_node(Node::Text(text.into_owned()));
                    }
                }
            }
            Event::CData(c) => {
                if let Some(top) = stack.last_mut() {
                    top.push_node(Node::Text(String::from_utf8_lossy(&c).into_owned()));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Err(ProtocolError::InvalidStanza("no element found".into()))
}

fn start_element(
    reader: &NsReader<&[u8]>,
    namespace: String,
    e: &BytesStart<'_>,
) -> ProtocolResult<Element> {
    let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
    let mut element = Element::new(name, namespace);
    for attr in e.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        let key = attr.key.as_ref();
        if key == b"xmlns" || key.starts_with(b"xmlns:") {
            continue;
        }
        if key.contains(&b':') && !key.starts_with(b"xml:") {
            if let (ResolveResult::Unknown(prefix), _) = reader.resolve_attribute(attr.key) {
                return Err(ProtocolError::unbound_prefix(String::from_utf8_lossy(&prefix)));
            }
        }
        let value = attr.unescape_value()?.into_owned();
        element.set_attr(String::from_utf8_lossy(key).into_owned(), value);
    }
    Ok(element)
}
