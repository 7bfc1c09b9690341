//! # rookery-xmpp
//!
//! Native XMPP server library for Rookery.
//!
//! This crate implements a small standalone XMPP server: client streams
//! over TCP (optionally TLS), SASL PLAIN, resource binding, and address
//! based stanza routing between locally connected clients and bundled
//! components. A XEP-0045 multi-user chat engine runs on the
//! `conference.` subdomain, and extension modules (see [`module`]) can
//! hook additional routes into the server — the UDP multicast bridge in
//! `rookery-multicast` being the canonical example.
//!
//! ## Architecture
//!
//! - **Server**: TCP accept loop, one reader and one writer task per
//!   connection, stopped through a `CancellationToken`
//! - **Sessions**: explicit per-connection state machine
//!   (stream open → SASL → bind → live)
//! - **Routing**: ordered route tables keyed on wildcard JID patterns
//!   and on IQ child namespaces; handlers are plain trait objects
//! - **Stanzas**: `minidom::Element` trees produced by an incremental
//!   rxml-based stream parser

pub mod auth;
pub mod connection;
pub mod im;
pub mod module;
pub mod muc;
pub mod parser;
pub mod pattern;
pub mod registry;
pub mod routing;
pub mod server;

mod error;

pub use error::XmppError;
pub use module::{Module, ModuleHost};
pub use parser::{ns, ParserMode, StanzaParser, StreamEvent};
pub use pattern::JidPattern;
pub use registry::{ClientHandle, ClientRegistry, SendResult};
pub use routing::{DisconnectListener, StanzaHandler, StanzaRouter};
pub use server::{ServerOptions, XmppServer};
