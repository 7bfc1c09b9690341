//! Shared harness for end-to-end tests: a real server on an ephemeral
//! loopback port and a raw-XMPP test client.

use std::net::SocketAddr;
use std::sync::Arc;

use minidom::Element;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

use rookery_xmpp::{ParserMode, ServerOptions, StanzaParser, StreamEvent, XmppServer};

pub struct TestServer {
    pub addr: SocketAddr,
    pub server: Arc<XmppServer>,
    shutdown: CancellationToken,
}

impl TestServer {
    pub async fn start() -> Self {
        let server = Arc::new(XmppServer::new(ServerOptions::default()).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(Arc::clone(&server).run(listener, shutdown.clone()));
        Self {
            addr,
            server,
            shutdown,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub struct TestClient {
    stream: TcpStream,
    buffer: String,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = timeout(Duration::from_secs(5), TcpStream::connect(addr))
            .await
            .expect("connect timed out")
            .expect("connect failed");
        Self {
            stream,
            buffer: String::new(),
        }
    }

    /// Raw access to the socket, for EOF assertions.
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub async fn send(&mut self, xml: &str) {
        self.stream
            .write_all(xml.as_bytes())
            .await
            .expect("write failed");
    }

    /// Read until `marker` appears; returns everything up to and
    /// including it. Bytes after the marker stay buffered for the next
    /// call.
    pub async fn read_until(&mut self, marker: &str) -> String {
        let mut buf = [0u8; 8192];
        loop {
            if let Some(pos) = self.buffer.find(marker) {
                let end = pos + marker.len();
                let consumed: String = self.buffer.drain(..end).collect();
                return consumed;
            }
            let n = timeout(Duration::from_secs(5), self.stream.read(&mut buf))
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {:?}", marker))
                .expect("read failed");
            assert!(n > 0, "connection closed while waiting for {:?}", marker);
            self.buffer
                .push_str(std::str::from_utf8(&buf[..n]).expect("non-UTF8 from server"));
        }
    }

    /// Full handshake: stream, SASL PLAIN, stream restart, bind.
    pub async fn bind(addr: SocketAddr, user: &str, resource: &str) -> Self {
        let mut client = Self::connect(addr).await;

        client.send(&stream_header()).await;
        let features = client.read_until("</stream:features>").await;
        assert!(features.contains("PLAIN"), "expected SASL feature");

        client
            .send(&format!(
                "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{}</auth>",
                plain_payload(user)
            ))
            .await;
        client.read_until("<success").await;
        client.read_until(">").await;

        client.send(&stream_header()).await;
        let features = client.read_until("</stream:features>").await;
        assert!(features.contains("xmpp-bind"), "expected bind feature");

        client
            .send(&format!(
                "<iq id='bind1' type='set'>\
                 <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
                 <resource>{}</resource></bind></iq>",
                resource
            ))
            .await;
        let reply = client.read_until("</iq>").await;
        assert!(
            reply.contains(&format!("{}@localhost/{}", user, resource)),
            "bind reply missing jid: {}",
            reply
        );
        client
    }
}

pub fn stream_header() -> String {
    "<stream:stream to='localhost' version='1.0' xmlns='jabber:client' \
     xmlns:stream='http://etherx.jabber.org/streams'>"
        .to_owned()
}

/// base64("\0user\0user")
pub fn plain_payload(user: &str) -> String {
    use base64::prelude::*;
    BASE64_STANDARD.encode(format!("\0{}\0{}", user, user))
}

/// Parse one serialized stanza back into an element for
/// order-insensitive assertions.
pub fn parse_stanza(xml: &str) -> Element {
    let mut parser = StanzaParser::new(ParserMode::Fragment);
    let mut events = Vec::new();
    parser
        .feed(xml.as_bytes(), &mut events)
        .unwrap_or_else(|e| panic!("unparseable stanza {:?}: {}", xml, e));
    for event in events {
        if let StreamEvent::Stanza(stanza) = event {
            return stanza;
        }
    }
    panic!("no stanza in {:?}", xml);
}
