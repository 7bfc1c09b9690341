//! Built-in IQ handlers for the core IM feature set.
//!
//! These are the stubs every client expects from an RFC 6121 server
//! before it considers the session usable: the legacy session IQ, the
//! two service-discovery queries against the server itself, and the
//! roster fetch. Rosters are not persisted, so the roster reply is
//! always empty.

use std::sync::Arc;

use minidom::Element;
use tracing::debug;

use crate::parser::ns;
use crate::routing::StanzaHandler;
use crate::server::XmppServer;

/// Install the built-in IQ routes. Called once at server construction.
pub fn install(server: &XmppServer) {
    let router = server.router();
    router.add_iq_route(ns::SESSION, Arc::new(SessionIq));
    router.add_iq_route(ns::DISCO_ITEMS, Arc::new(DiscoItems));
    router.add_iq_route(ns::DISCO_INFO, Arc::new(DiscoInfo));
    router.add_iq_route(ns::ROSTER, Arc::new(Roster));
}

/// Whether this IQ is a request directed at the server itself.
///
/// Requests carry no `to` or name the bare server domain; anything
/// addressed elsewhere is left for other routes (or the
/// service-unavailable fallback).
fn server_request(server: &XmppServer, stanza: &Element) -> bool {
    match stanza.attr("type") {
        Some("get") | Some("set") => {}
        _ => return false,
    }
    match stanza.attr("to") {
        None => true,
        Some(to) => to == server.domain(),
    }
}

/// Send a `type='result'` reply mirroring the request's id.
fn reply_result(server: &XmppServer, stanza: &Element, payload: Option<Element>) -> bool {
    let Some(id) = stanza.attr("id") else {
        debug!("iq request has no id, cannot reply");
        return false;
    };
    let Some(from) = stanza.attr("from") else {
        debug!("iq request has no from, cannot reply");
        return false;
    };

    let mut builder = Element::builder("iq", ns::JABBER_CLIENT)
        .attr("id", id)
        .attr("type", "result")
        .attr("from", server.domain())
        .attr("to", from);
    if let Some(payload) = payload {
        builder = builder.append(payload);
    }
    let mut reply = builder.build();
    server.route(&mut reply);
    true
}

/// `urn:ietf:params:xml:ns:xmpp-session` — always succeeds.
struct SessionIq;

impl StanzaHandler for SessionIq {
    fn handle(&self, server: &XmppServer, stanza: &mut Element) -> bool {
        if !server_request(server, stanza) {
            return false;
        }
        reply_result(server, stanza, None)
    }
}

/// `disco#items` on the server: nothing to enumerate.
struct DiscoItems;

impl StanzaHandler for DiscoItems {
    fn handle(&self, server: &XmppServer, stanza: &mut Element) -> bool {
        if !server_request(server, stanza) {
            return false;
        }
        let query = Element::builder("query", ns::DISCO_ITEMS).build();
        reply_result(server, stanza, Some(query))
    }
}

/// `disco#info` on the server: a plain IM server identity.
struct DiscoInfo;

impl StanzaHandler for DiscoInfo {
    fn handle(&self, server: &XmppServer, stanza: &mut Element) -> bool {
        if !server_request(server, stanza) {
            return false;
        }
        let query = Element::builder("query", ns::DISCO_INFO)
            .append(
                Element::builder("identity", ns::DISCO_INFO)
                    .attr("category", "server")
                    .attr("type", "im")
                    .attr("name", "Rookery")
                    .build(),
            )
            .append(
                Element::builder("feature", ns::DISCO_INFO)
                    .attr("var", ns::DISCO_INFO)
                    .build(),
            )
            .build();
        reply_result(server, stanza, Some(query))
    }
}

/// `jabber:iq:roster` — rosters are not stored, reply empty.
struct Roster;

impl StanzaHandler for Roster {
    fn handle(&self, server: &XmppServer, stanza: &mut Element) -> bool {
        if !server_request(server, stanza) {
            return false;
        }
        let query = Element::builder("query", ns::ROSTER).build();
        reply_result(server, stanza, Some(query))
    }
}
