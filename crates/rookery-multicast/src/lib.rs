//! UDP multicast stanza bridge.
//!
//! Forwards stanzas originated by locally connected clients to peer
//! server instances over UDP multicast, and reinjects stanzas received
//! from the group into the local router. Peers sharing a group address
//! thereby form a federated stanza bus with no framing beyond "one or
//! more stanzas of UTF-8 XML per datagram".
//!
//! Outbound filtering is deliberately blunt: `iq` stanzas never cross
//! the bridge, and neither does anything whose `from` is not a client
//! of this instance — which is also what keeps reinjected stanzas from
//! echoing back out. The filter claims such stanzas as handled anyway
//! so ordinary traffic never triggers the router's error fallback.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use jid::Jid;
use minidom::Element;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rookery_xmpp::{
    JidPattern, Module, ParserMode, StanzaHandler, StanzaParser, StreamEvent, XmppError,
    XmppServer,
};

const DEFAULT_ADDRESS: Ipv4Addr = Ipv4Addr::new(225, 1, 2, 104);
const DEFAULT_PORT: u16 = 6010;
const DEFAULT_TTL: u32 = 64;
const DEFAULT_BUFFER_SIZE: usize = 30720;

/// The multicast bridge, packaged as a server extension module.
///
/// Configuration keys: `address`, `port`, `ttl`, `bufsize`.
pub struct MulticastModule {
    address: Ipv4Addr,
    port: u16,
    ttl: u32,
    buffer_size: usize,
    running: Option<Running>,
}

struct Running {
    server: Arc<XmppServer>,
    outbound: Arc<dyn StanzaHandler>,
    pattern: JidPattern,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl MulticastModule {
    /// Create a bridge with the default group parameters.
    pub fn new() -> Self {
        Self {
            address: DEFAULT_ADDRESS,
            port: DEFAULT_PORT,
            ttl: DEFAULT_TTL,
            buffer_size: DEFAULT_BUFFER_SIZE,
            running: None,
        }
    }

    /// Configured multicast group address.
    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    /// Configured UDP port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Configured multicast TTL.
    pub fn ttl(&self) -> u32 {
        self.ttl
    }

    /// Configured receive buffer size.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Open, configure, and join the multicast socket.
    ///
    /// `SO_REUSEADDR` must be set before bind so several instances on
    /// one host can share the port, hence the socket2 bring-up.
    fn bind_socket(&self) -> Result<UdpSocket, XmppError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port));
        socket.bind(&bind_addr.into())?;

        let socket = UdpSocket::from_std(socket.into())?;
        socket.join_multicast_v4(self.address, Ipv4Addr::UNSPECIFIED)?;
        socket.set_multicast_loop_v4(false)?;
        socket.set_multicast_ttl_v4(self.ttl)?;

        info!(group = %self.address, port = self.port, "joined multicast group");
        Ok(socket)
    }
}

impl Default for MulticastModule {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for MulticastModule {
    fn configure(&mut self, key: &str, value: &str) -> Result<(), XmppError> {
        match key {
            "address" => {
                self.address = value.parse().map_err(|_| {
                    XmppError::config(format!("bad multicast address '{}'", value))
                })?;
            }
            "port" => {
                self.port = value
                    .parse()
                    .map_err(|_| XmppError::config(format!("bad multicast port '{}'", value)))?;
            }
            "ttl" => {
                self.ttl = value
                    .parse()
                    .map_err(|_| XmppError::config(format!("bad multicast ttl '{}'", value)))?;
            }
            "bufsize" => {
                self.buffer_size = value.parse().map_err(|_| {
                    XmppError::config(format!("bad multicast bufsize '{}'", value))
                })?;
            }
            other => {
                debug!(key = other, "ignoring unknown multicast option");
            }
        }
        Ok(())
    }

    fn start(&mut self, server: &Arc<XmppServer>) -> Result<(), XmppError> {
        let socket = Arc::new(self.bind_socket()?);

        let outbound: Arc<dyn StanzaHandler> = Arc::new(OutboundFilter {
            socket: Arc::clone(&socket),
            group: SocketAddrV4::new(self.address, self.port),
        });
        let pattern: JidPattern = "*@*/*".parse().expect("bridge wildcard pattern");
        server
            .router()
            .add_stanza_route(pattern.clone(), Arc::clone(&outbound));

        let stop = CancellationToken::new();
        let task = tokio::spawn(inbound_loop(
            Arc::clone(server),
            socket,
            self.buffer_size,
            stop.clone(),
        ));

        self.running = Some(Running {
            server: Arc::clone(server),
            outbound,
            pattern,
            stop,
            task,
        });
        Ok(())
    }

    fn stop(&mut self) -> Result<(), XmppError> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        running
            .server
            .router()
            .remove_stanza_route(&running.pattern, &running.outbound);
        running.stop.cancel();
        running.task.abort();
        info!("multicast bridge stopped");
        Ok(())
    }
}

/// Outbound side: mirrors locally originated stanzas to the group.
struct OutboundFilter {
    socket: Arc<UdpSocket>,
    group: SocketAddrV4,
}

impl StanzaHandler for OutboundFilter {
    fn handle(&self, server: &XmppServer, stanza: &mut Element) -> bool {
        if stanza.name() == "iq" {
            debug!("ignoring iq stanza");
            return true;
        }

        let local_sender = stanza
            .attr("from")
            .and_then(|from| from.parse::<Jid>().ok())
            .map(|jid| server.registry().is_connected(&jid))
            .unwrap_or(false);
        if !local_sender {
            debug!("ignoring stanza from non-local client");
            return true;
        }

        let xml = String::from(&*stanza);
        match self
            .socket
            .try_send_to(xml.as_bytes(), SocketAddr::V4(self.group))
        {
            Ok(sent) if sent == xml.len() => {
                info!(bytes = sent, "sent stanza to multicast group");
                true
            }
            Ok(sent) => {
                warn!(sent, total = xml.len(), "short multicast send");
                false
            }
            Err(e) => {
                warn!(error = %e, "failed to send on multicast socket");
                false
            }
        }
    }
}

/// Inbound side: parse each datagram as stanza fragments and hand them
/// to the router. Malformed datagrams are logged and discarded.
async fn inbound_loop(
    server: Arc<XmppServer>,
    socket: Arc<UdpSocket>,
    buffer_size: usize,
    stop: CancellationToken,
) {
    let mut parser = StanzaParser::new(ParserMode::Fragment);
    let mut buf = vec![0u8; buffer_size];

    loop {
        let (len, peer) = tokio::select! {
            _ = stop.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok(received) => received,
                Err(e) => {
                    warn!(error = %e, "multicast receive failed");
                    continue;
                }
            },
        };

        debug!(bytes = len, %peer, "received multicast datagram");
        parser.reset(ParserMode::Fragment);
        let mut events = Vec::new();
        let parse_result = parser.feed(&buf[..len], &mut events);

        for event in events {
            if let StreamEvent::Stanza(mut stanza) = event {
                server.route(&mut stanza);
            }
        }
        if let Err(e) = parse_result {
            warn!(%peer, error = %e, "discarding malformed datagram");
        }
    }
}
