//! XMPP server state and accept loop.
//!
//! The [`XmppServer`] owns the dispatch tables, the connected-client
//! registry, the bundled MUC engine, and the optional TLS acceptor. The
//! accept loop takes a pre-bound listener (the caller chooses the
//! address, tests bind an ephemeral port) and a cancellation token that
//! stops it.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::connection;
use crate::im;
use crate::muc::MucEngine;
use crate::pattern::JidPattern;
use crate::registry::{ClientHandle, ClientRegistry};
use crate::routing::{StanzaHandler, StanzaRouter};
use crate::XmppError;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Address to listen on for client connections.
    pub address: String,
    /// Port to listen on for client connections.
    pub port: u16,
    /// Whether to wrap accepted connections in TLS.
    pub ssl: bool,
    /// PEM private key path, used when `ssl` is set.
    pub keyfile: String,
    /// PEM certificate path, used when `ssl` is set.
    pub certificate: String,
    /// The domain this server serves (the JID domainpart).
    pub name: String,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_owned(),
            port: 5222,
            ssl: false,
            keyfile: "server.pem".to_owned(),
            certificate: "server.crt".to_owned(),
            name: "localhost".to_owned(),
        }
    }
}

impl ServerOptions {
    /// The socket address string to bind.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// XMPP server instance.
pub struct XmppServer {
    options: ServerOptions,
    router: StanzaRouter,
    registry: ClientRegistry,
    muc: Arc<MucEngine>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl XmppServer {
    /// Create a server and install the built-in components: the
    /// IM/disco/roster IQ stubs and the MUC engine on
    /// `conference.<domain>`.
    ///
    /// TLS material is loaded here; a bad key or certificate is fatal
    /// to boot.
    pub fn new(options: ServerOptions) -> Result<Self, XmppError> {
        let tls_acceptor = if options.ssl {
            Some(Self::load_tls_config(&options)?)
        } else {
            None
        };

        let server = Self {
            muc: Arc::new(MucEngine::new(&options.name)),
            options,
            router: StanzaRouter::new(),
            registry: ClientRegistry::new(),
            tls_acceptor,
        };

        im::install(&server);
        server.muc.clone().install(&server);

        info!(domain = %server.options.name, "XMPP server initialized");
        Ok(server)
    }

    /// Load TLS configuration from the key and certificate files.
    fn load_tls_config(options: &ServerOptions) -> Result<TlsAcceptor, XmppError> {
        use rustls_pemfile::{certs, private_key};
        use std::fs::File;
        use std::io::BufReader;
        use tokio_rustls::rustls::ServerConfig;

        let cert_file = File::open(&options.certificate).map_err(|e| {
            XmppError::config(format!(
                "cannot open certificate {}: {}",
                options.certificate, e
            ))
        })?;
        let key_file = File::open(&options.keyfile).map_err(|e| {
            XmppError::config(format!("cannot open keyfile {}: {}", options.keyfile, e))
        })?;

        let certs: Vec<_> = certs(&mut BufReader::new(cert_file))
            .collect::<Result<_, _>>()
            .map_err(|e| XmppError::config(format!("bad certificate: {}", e)))?;
        let key = private_key(&mut BufReader::new(key_file))
            .map_err(|e| XmppError::config(format!("bad keyfile: {}", e)))?
            .ok_or_else(|| XmppError::config("no private key found"))?;

        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| XmppError::config(format!("TLS config error: {}", e)))?;

        Ok(TlsAcceptor::from(Arc::new(server_config)))
    }

    /// The domain this server serves.
    pub fn domain(&self) -> &str {
        &self.options.name
    }

    /// The server configuration.
    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    /// The dispatch tables.
    pub fn router(&self) -> &StanzaRouter {
        &self.router
    }

    /// The connected-client registry.
    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    /// The bundled MUC engine.
    pub fn muc(&self) -> &Arc<MucEngine> {
        &self.muc
    }

    /// Route a stanza through the dispatch tables.
    pub fn route(&self, stanza: &mut minidom::Element) -> bool {
        self.router.route(self, stanza)
    }

    /// Tear down a client session: drop its registration, its delivery
    /// route, and fire every disconnect listener watching it.
    pub fn client_disconnected(
        &self,
        client: &ClientHandle,
        delivery: &Arc<dyn StanzaHandler>,
    ) {
        self.registry.unregister(client.id);
        self.router
            .remove_stanza_route(&JidPattern::from(&client.jid), delivery);
        self.router.fire_disconnect(self, client);
        info!(jid = %client.jid, "client disconnected");
    }

    /// Accept client connections until the token is cancelled.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), XmppError> {
        let addr = listener.local_addr()?;
        info!(%addr, tls = self.tls_acceptor.is_some(), "listening for XMPP connections");

        loop {
            let (stream, peer_addr) = tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "failed to accept connection");
                            continue;
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("accept loop stopped");
                    return Ok(());
                }
            };

            info!(peer = %peer_addr, "new connection");
            let server = Arc::clone(&self);
            let acceptor = self.tls_acceptor.clone();
            tokio::spawn(async move {
                let result = match acceptor {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            connection::serve(server, tls_stream, peer_addr).await
                        }
                        Err(e) => {
                            warn!(peer = %peer_addr, error = %e, "TLS handshake failed");
                            return;
                        }
                    },
                    None => connection::serve(server, stream, peer_addr).await,
                };
                if let Err(e) = result {
                    warn!(peer = %peer_addr, error = %e, "connection error");
                }
            });
        }
    }
}
