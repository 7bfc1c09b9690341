//! Per-connection client sessions.
//!
//! Each accepted socket gets one reader task running the session state
//! machine and one writer task draining the session's outbound channel.
//! The state machine moves strictly forward: stream open, SASL PLAIN,
//! a fresh stream, resource binding, live stanza exchange. Anything a
//! state does not admit drops the client with no reply.

use std::net::SocketAddr;
use std::sync::Arc;

use jid::FullJid;
use minidom::Element;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth;
use crate::parser::{ns, ParserMode, StanzaParser, StreamEvent};
use crate::pattern::JidPattern;
use crate::registry::{ClientHandle, OutboundStanza};
use crate::routing::StanzaHandler;
use crate::server::XmppServer;
use crate::XmppError;

/// Read buffer size per connection.
const READ_BUFFER_SIZE: usize = 8192;

/// Outbound channel depth per connection.
const OUTBOUND_QUEUE: usize = 256;

/// Session progress, forward-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    /// Waiting for the initial stream header.
    StreamExpected,
    /// Header answered, waiting for `<auth/>`.
    AuthExpected,
    /// SASL done, waiting for the restarted stream's header.
    StreamExpectedPostAuth,
    /// Waiting for the resource-binding IQ.
    BindExpected,
    /// Bound and routed.
    Live,
}

/// Delivers routed stanzas onto one session's socket.
struct ClientDelivery {
    jid: FullJid,
    sender: mpsc::Sender<OutboundStanza>,
}

impl StanzaHandler for ClientDelivery {
    fn handle(&self, _server: &XmppServer, stanza: &mut Element) -> bool {
        let xml = String::from(&*stanza);
        match self.sender.try_send(OutboundStanza::new(xml)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(jid = %self.jid, "outbound queue full, stanza dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(jid = %self.jid, "delivery to closed session");
                false
            }
        }
    }
}

struct Session {
    id: Uuid,
    server: Arc<XmppServer>,
    sender: mpsc::Sender<OutboundStanza>,
    parser: StanzaParser,
    state: SessionState,
    stream_id: String,
    /// Localpart adopted from SASL; survives the post-auth stream reset.
    local: Option<String>,
    /// Set once the session is live.
    handle: Option<ClientHandle>,
    delivery: Option<Arc<dyn StanzaHandler>>,
}

/// Drive one client connection to completion.
///
/// Returns when the peer disconnects, the session commits a protocol
/// violation, or the transport fails. Teardown always runs: registry
/// entry, delivery route, and disconnect listeners.
pub async fn serve<S>(
    server: Arc<XmppServer>,
    stream: S,
    peer: SocketAddr,
) -> Result<(), XmppError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (sender, mut receiver) = mpsc::channel::<OutboundStanza>(OUTBOUND_QUEUE);

    let writer_task = tokio::spawn(async move {
        while let Some(outbound) = receiver.recv().await {
            if let Err(e) = writer.write_all(outbound.xml.as_bytes()).await {
                debug!(error = %e, "write failed, stopping writer");
                break;
            }
            if writer.flush().await.is_err() {
                break;
            }
        }
    });

    let mut session = Session {
        id: Uuid::new_v4(),
        server,
        sender,
        parser: StanzaParser::new(ParserMode::Stream),
        state: SessionState::StreamExpected,
        stream_id: Uuid::new_v4().to_string(),
        local: None,
        handle: None,
        delivery: None,
    };

    let result = session.read_loop(&mut reader, peer).await;
    session.teardown();
    // Dropping the last sender stops the writer once the queue drains.
    drop(session);
    let _ = writer_task.await;
    result
}

impl Session {
    async fn read_loop<R>(
        &mut self,
        reader: &mut R,
        peer: SocketAddr,
    ) -> Result<(), XmppError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                info!(%peer, "peer disconnected");
                return Ok(());
            }

            let mut events = Vec::new();
            let parse_result = self.parser.feed(&buf[..n], &mut events);
            for event in events {
                if !self.on_event(event)? {
                    return Ok(());
                }
            }
            if let Err(e) = parse_result {
                warn!(%peer, error = %e, "dropping client on malformed XML");
                return Err(e);
            }
        }
    }

    /// Dispatch one parser event. `Ok(false)` ends the session cleanly.
    fn on_event(&mut self, event: StreamEvent) -> Result<bool, XmppError> {
        match event {
            StreamEvent::StreamOpen(header) => self.on_stream_open(&header),
            StreamEvent::Stanza(mut stanza) => self.on_stanza(&mut stanza),
            StreamEvent::StreamClosed => {
                self.send_raw("</stream:stream>");
                Ok(false)
            }
        }
    }

    fn on_stream_open(&mut self, header: &Element) -> Result<bool, XmppError> {
        if !header.is("stream", ns::STREAM) {
            return Err(XmppError::protocol(format!(
                "expected stream header, got <{}/>",
                header.name()
            )));
        }

        self.send_raw(&self.stream_header());
        match self.state {
            SessionState::StreamExpected | SessionState::AuthExpected => {
                self.send_raw(
                    "<stream:features>\
                       <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
                         <mechanism>PLAIN</mechanism>\
                       </mechanisms>\
                     </stream:features>",
                );
                self.state = SessionState::AuthExpected;
            }
            SessionState::StreamExpectedPostAuth => {
                self.send_raw(
                    "<stream:features>\
                       <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>\
                     </stream:features>",
                );
                self.state = SessionState::BindExpected;
            }
            SessionState::Live => {
                // Stream restarts are tolerated on live sessions.
                self.send_raw("<stream:features/>");
            }
            SessionState::BindExpected => {
                return Err(XmppError::protocol("stream restart while binding"));
            }
        }
        Ok(true)
    }

    fn on_stanza(&mut self, stanza: &mut Element) -> Result<bool, XmppError> {
        match self.state {
            SessionState::AuthExpected => self.on_auth(stanza),
            SessionState::BindExpected => self.on_bind(stanza),
            SessionState::Live => {
                self.on_live(stanza);
                Ok(true)
            }
            SessionState::StreamExpected | SessionState::StreamExpectedPostAuth => {
                Err(XmppError::protocol(format!(
                    "unexpected <{}/> before stream header",
                    stanza.name()
                )))
            }
        }
    }

    fn on_auth(&mut self, stanza: &mut Element) -> Result<bool, XmppError> {
        if !stanza.is("auth", ns::SASL) {
            return Err(XmppError::protocol(format!(
                "expected SASL auth, got <{}/>",
                stanza.name()
            )));
        }
        match stanza.attr("mechanism") {
            Some("PLAIN") => {}
            other => {
                return Err(XmppError::auth_rejected(format!(
                    "unsupported mechanism {:?}",
                    other
                )));
            }
        }

        let credentials = auth::parse_plain(&stanza.text())?;
        info!(authcid = %credentials.authcid, "authenticated");
        self.local = Some(credentials.authcid);

        self.send_raw("<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>");
        // The client restarts the stream; the localpart survives.
        self.parser.reset(ParserMode::Stream);
        self.state = SessionState::StreamExpectedPostAuth;
        Ok(true)
    }

    fn on_bind(&mut self, stanza: &mut Element) -> Result<bool, XmppError> {
        if !stanza.is("iq", ns::JABBER_CLIENT) || stanza.attr("type") != Some("set") {
            return Err(XmppError::protocol("expected resource binding iq"));
        }
        let Some(id) = stanza.attr("id").map(str::to_owned) else {
            return Err(XmppError::protocol("binding iq has no id"));
        };
        let Some(bind) = stanza.get_child("bind", ns::BIND) else {
            return Err(XmppError::protocol("binding iq has no bind child"));
        };

        let resource = bind
            .get_child("resource", ns::BIND)
            .map(|r| r.text())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let local = self
            .local
            .as_ref()
            .ok_or_else(|| XmppError::internal("bind without authentication"))?;
        let jid: FullJid = format!("{}@{}/{}", local, self.server.domain(), resource)
            .parse()
            .map_err(|e| XmppError::protocol(format!("bound JID invalid: {}", e)))?;

        let reply = Element::builder("iq", ns::JABBER_CLIENT)
            .attr("id", id)
            .attr("type", "result")
            .append(
                Element::builder("bind", ns::BIND)
                    .append(
                        Element::builder("jid", ns::BIND)
                            .append(jid.to_string())
                            .build(),
                    )
                    .build(),
            )
            .build();
        self.send_raw(&String::from(&reply));

        // The session is addressable now: registry entry plus a
        // delivery route on the exact bound JID.
        let handle = ClientHandle::new(self.id, jid.clone(), self.sender.clone());
        self.server.registry().register(handle.clone());

        let delivery: Arc<dyn StanzaHandler> = Arc::new(ClientDelivery {
            jid: jid.clone(),
            sender: self.sender.clone(),
        });
        self.server
            .router()
            .add_stanza_route(JidPattern::from(&jid), Arc::clone(&delivery));

        self.handle = Some(handle);
        self.delivery = Some(delivery);
        self.state = SessionState::Live;
        info!(jid = %jid, "session bound");
        Ok(true)
    }

    fn on_live(&mut self, stanza: &mut Element) {
        if stanza.attr("from").is_none() {
            if let Some(handle) = &self.handle {
                stanza.set_attr("from", handle.jid.to_string());
            }
        }
        self.server.route(stanza);
    }

    fn stream_header(&self) -> String {
        format!(
            "<stream:stream from='{}' id='{}' version='1.0' xml:lang='en' \
             xmlns='jabber:client' \
             xmlns:stream='http://etherx.jabber.org/streams'>",
            self.server.domain(),
            self.stream_id
        )
    }

    fn send_raw(&self, xml: &str) {
        match self.sender.try_send(OutboundStanza::new(xml.to_owned())) {
            Ok(()) => {}
            Err(e) => debug!(error = %e, "failed to queue outbound frame"),
        }
    }

    fn teardown(&mut self) {
        if let (Some(handle), Some(delivery)) = (&self.handle, &self.delivery) {
            self.server.client_disconnected(handle, delivery);
        }
    }
}
