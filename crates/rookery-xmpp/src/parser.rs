//! Incremental XML parsing for XMPP streams.
//!
//! XMPP uses a single long-lived XML document per session, so parsing
//! has to be incremental: bytes arrive in arbitrary chunks and complete
//! stanzas must be surfaced as soon as their closing tag is seen. An
//! [`rxml::Parser`] does the namespace-aware lexing, driven through an
//! [`rxml::AsyncReader`] over an in-memory [`FeedBuffer`] that parks
//! the reader (`Pending`) whenever the fed bytes run out; the resulting
//! [`rxml::Event`]s are assembled into `minidom::Element` trees.
//!
//! Two modes exist:
//!
//! - [`ParserMode::Stream`]: the first start element (the `<stream:stream>`
//!   header) is emitted immediately as a childless [`StreamEvent::StreamOpen`]
//!   carrying all header attributes; every element that closes back down to
//!   the stream level afterwards is a complete [`StreamEvent::Stanza`].
//! - [`ParserMode::Fragment`]: no stream framing; each complete top-level
//!   element is emitted on close. Used for multicast datagrams.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use futures::task::noop_waker_ref;
use minidom::Element;
use rxml::writer::{SimpleNamespaces, TrackNamespace};
use tokio::io::{AsyncBufRead, AsyncRead, ReadBuf};

use crate::XmppError;

/// Namespace URIs used in XMPP.
pub mod ns {
    /// XMPP client namespace
    pub const JABBER_CLIENT: &str = "jabber:client";
    /// XMPP streams namespace
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    /// SASL namespace
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    /// Resource binding namespace
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    /// Session namespace
    pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
    /// Stanza error namespace
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    /// Roster namespace
    pub const ROSTER: &str = "jabber:iq:roster";
    /// Service discovery items namespace
    pub const DISCO_ITEMS: &str = "http://jabber.org/protocol/disco#items";
    /// Service discovery info namespace
    pub const DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";
    /// Multi-user chat namespace
    pub const MUC: &str = "http://jabber.org/protocol/muc";
    /// Multi-user chat user namespace
    pub const MUC_USER: &str = "http://jabber.org/protocol/muc#user";
}

/// Parsing mode, see module docs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserMode {
    /// Long-lived XMPP stream with a `<stream:stream>` root.
    Stream,
    /// Self-contained fragments, one document root per stanza.
    Fragment,
}

/// An event surfaced by the parser.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// The stream header opened. The element is childless and carries
    /// the header attributes (`to`, `from`, `version`, ...).
    StreamOpen(Element),
    /// A complete top-level stanza.
    Stanza(Element),
    /// The stream root element was closed (`</stream:stream>`).
    StreamClosed,
}

/// In-memory byte source driving the XML reader.
///
/// Unlike a socket, this never signals EOF: when the previously fed
/// bytes are exhausted `poll_fill_buf` returns `Pending`, parking the
/// reader until the next `feed` call supplies more data. A stream ends
/// at its root close tag, not at EOF.
#[derive(Default)]
struct FeedBuffer {
    buf: BytesMut,
}

impl FeedBuffer {
    fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }
}

impl AsyncRead for FeedBuffer {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        read_buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.buf.is_empty() {
            return Poll::Pending;
        }
        let n = read_buf.remaining().min(this.buf.len());
        read_buf.put_slice(&this.buf[..n]);
        this.buf.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncBufRead for FeedBuffer {
    fn poll_fill_buf(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        let this = self.get_mut();
        if this.buf.is_empty() {
            return Poll::Pending;
        }
        Poll::Ready(Ok(&this.buf[..]))
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        self.get_mut().buf.advance(amt);
    }
}

/// Incremental stanza parser over a byte stream.
pub struct StanzaParser {
    reader: Pin<Box<rxml::AsyncReader<FeedBuffer>>>,
    mode: ParserMode,
    /// Stream mode: whether the stream header was already emitted.
    stream_opened: bool,
    /// Elements of the stanza currently under construction, outermost
    /// first. Empty between stanzas.
    stack: Vec<Element>,
}

impl StanzaParser {
    /// Create a new parser in the given mode.
    pub fn new(mode: ParserMode) -> Self {
        Self {
            reader: Box::pin(rxml::AsyncReader::wrap(
                FeedBuffer::default(),
                rxml::Parser::default(),
            )),
            mode,
            stream_opened: false,
            stack: Vec::new(),
        }
    }

    /// Feed bytes into the parser, collecting every event that
    /// completes.
    ///
    /// Returns the events in document order. A malformed document
    /// yields an error describing the defect; events completed before
    /// the defect are still returned through `events`.
    pub fn feed(&mut self, data: &[u8], events: &mut Vec<StreamEvent>) -> Result<(), XmppError> {
        self.reader.as_mut().inner_pinned().get_mut().push(data);

        // The reader never blocks on anything but the buffer above, so
        // polling with a no-op waker drains every completed event.
        let mut cx = Context::from_waker(noop_waker_ref());
        loop {
            match self.reader.as_mut().poll_read(&mut cx) {
                // Starved for input, wait for the next feed.
                Poll::Pending => break,
                Poll::Ready(Ok(Some(event))) => self.process(event, events),
                // Document ended cleanly.
                Poll::Ready(Ok(None)) => break,
                Poll::Ready(Err(e)) => return Err(XmppError::xml_parse(e.to_string())),
            }
        }
        Ok(())
    }

    fn process(&mut self, event: rxml::Event, events: &mut Vec<StreamEvent>) {
        match event {
            rxml::Event::XmlDeclaration(_, _) => (),
            rxml::Event::StartElement(_, qname, attrs) => {
                let element = element_from_parts(qname, attrs);
                if self.mode == ParserMode::Stream && !self.stream_opened {
                    // The stream header itself: emitted before any of
                    // its children exist.
                    self.stream_opened = true;
                    events.push(StreamEvent::StreamOpen(element));
                } else {
                    self.stack.push(element);
                }
            }
            rxml::Event::Text(_, text) => {
                // Text outside any stanza is whitespace keep-alive.
                if let Some(top) = self.stack.last_mut() {
                    top.append_text_node(text);
                }
            }
            rxml::Event::EndElement(_) => match self.stack.pop() {
                Some(done) => match self.stack.last_mut() {
                    Some(parent) => {
                        parent.append_child(done);
                    }
                    None => events.push(StreamEvent::Stanza(done)),
                },
                // The stream root itself closed.
                None => events.push(StreamEvent::StreamClosed),
            },
        }
    }

    /// Clear all parser state.
    ///
    /// Re-arms the given mode; a session resets into [`ParserMode::Stream`]
    /// after SASL, the multicast bridge resets into
    /// [`ParserMode::Fragment`] before every datagram.
    pub fn reset(&mut self, mode: ParserMode) {
        *self = Self::new(mode);
    }

    /// The mode the parser currently runs in.
    pub fn mode(&self) -> ParserMode {
        self.mode
    }
}

/// Build a childless element from a start-element event.
///
/// Namespace declarations are not attributes at this level: the lexer
/// resolves them, so every attribute arrives with its namespace and
/// prefixed attributes get a prefix re-declared on the element.
fn element_from_parts(qname: rxml::QName, attrs: rxml::AttrMap) -> Element {
    let mut prefixes = SimpleNamespaces::new();
    let mut builder = Element::builder(qname.1, qname.0);
    for ((namespace, name), value) in attrs.into_iter() {
        if namespace.is_none() {
            builder = builder.attr(name, value);
        } else {
            let (is_new, prefix) = prefixes.declare_with_auto_prefix(namespace.clone());
            let name = prefix.with_suffix(&name);
            if is_new {
                builder = builder
                    .prefix(
                        Some(prefix.as_str().to_owned()),
                        namespace.as_str().to_owned(),
                    )
                    .unwrap();
            }
            builder = builder.attr(name, value);
        }
    }
    builder.build()
}

/// Serialize an element to its XML text form.
pub fn element_to_string(element: &Element) -> String {
    String::from(element)
}
