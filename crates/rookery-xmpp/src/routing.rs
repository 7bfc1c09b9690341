//! Stanza routing.
//!
//! The router owns three callback tables:
//!
//! - stanza routes: `(JidPattern, handler)` entries matched against a
//!   stanza's `to` address under wildcard rules, walked in registration
//!   order; every matching handler runs and the stanza counts as
//!   handled if any of them claims it;
//! - IQ routes: `(child namespace, handler)` entries consulted when an
//!   `iq` went unclaimed by the stanza walk;
//! - disconnect listeners: per-client callbacks fired when a session is
//!   torn down.
//!
//! Duplicate registrations (same pattern or namespace, same handler
//! object) are rejected. Handlers may mutate the stanza they receive;
//! a handler that rewrites `to`/`from` for a broadcast must restore
//! them before returning, the router restores nothing.

use std::sync::{Arc, RwLock};

use minidom::Element;
use tracing::{debug, info, warn};

use crate::parser::ns;
use crate::pattern::JidPattern;
use crate::registry::ClientHandle;
use crate::server::XmppServer;

/// A component that can consume stanzas routed to it.
///
/// Returns `true` when the stanza was handled. Internal failures are
/// logged and reported as `false` so the router can fall back to the
/// standard error reply.
pub trait StanzaHandler: Send + Sync {
    /// Process one stanza. The element is shared with every other
    /// matching handler, in registration order.
    fn handle(&self, server: &XmppServer, stanza: &mut Element) -> bool;
}

/// A component that wants to know when a client session ends.
pub trait DisconnectListener: Send + Sync {
    /// The given client's connection is gone; its routes are already
    /// removed.
    fn on_disconnect(&self, server: &XmppServer, client: &ClientHandle);
}

/// Object identity for registered callbacks.
///
/// Compares the data pointers only; vtable pointers are not stable
/// enough across codegen units to participate in identity.
fn same_handler(a: &Arc<dyn StanzaHandler>, b: &Arc<dyn StanzaHandler>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

fn same_listener(a: &Arc<dyn DisconnectListener>, b: &Arc<dyn DisconnectListener>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

struct StanzaRoute {
    pattern: JidPattern,
    handler: Arc<dyn StanzaHandler>,
}

struct IqRoute {
    namespace: String,
    handler: Arc<dyn StanzaHandler>,
}

struct Listener {
    client_id: uuid::Uuid,
    listener: Arc<dyn DisconnectListener>,
}

/// Address- and namespace-based dispatch tables.
pub struct StanzaRouter {
    stanza_routes: RwLock<Vec<StanzaRoute>>,
    iq_routes: RwLock<Vec<IqRoute>>,
    listeners: RwLock<Vec<Listener>>,
}

impl StanzaRouter {
    /// Create an empty router.
    pub fn new() -> Self {
        Self {
            stanza_routes: RwLock::new(Vec::new()),
            iq_routes: RwLock::new(Vec::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register a stanza route. Returns `false` (and leaves the table
    /// unchanged) when the same pattern/handler pair is already present.
    pub fn add_stanza_route(&self, pattern: JidPattern, handler: Arc<dyn StanzaHandler>) -> bool {
        let mut routes = self.stanza_routes.write().unwrap();
        if routes
            .iter()
            .any(|r| r.pattern == pattern && same_handler(&r.handler, &handler))
        {
            warn!(pattern = %pattern, "attempted to add duplicate stanza route");
            return false;
        }
        debug!(pattern = %pattern, "registered stanza route");
        routes.push(StanzaRoute { pattern, handler });
        true
    }

    /// Remove a previously registered stanza route.
    pub fn remove_stanza_route(&self, pattern: &JidPattern, handler: &Arc<dyn StanzaHandler>) {
        let mut routes = self.stanza_routes.write().unwrap();
        let before = routes.len();
        routes.retain(|r| !(r.pattern == *pattern && same_handler(&r.handler, handler)));
        if routes.len() == before {
            warn!(pattern = %pattern, "attempted to remove non-existent stanza route");
        } else {
            debug!(pattern = %pattern, "removed stanza route");
        }
    }

    /// Register an IQ route for a child namespace. Returns `false` on a
    /// duplicate registration.
    pub fn add_iq_route(&self, namespace: &str, handler: Arc<dyn StanzaHandler>) -> bool {
        let mut routes = self.iq_routes.write().unwrap();
        if routes
            .iter()
            .any(|r| r.namespace == namespace && same_handler(&r.handler, &handler))
        {
            warn!(namespace, "attempted to add duplicate IQ route");
            return false;
        }
        debug!(namespace, "registered IQ route");
        routes.push(IqRoute {
            namespace: namespace.to_owned(),
            handler,
        });
        true
    }

    /// Remove a previously registered IQ route.
    pub fn remove_iq_route(&self, namespace: &str, handler: &Arc<dyn StanzaHandler>) {
        let mut routes = self.iq_routes.write().unwrap();
        let before = routes.len();
        routes.retain(|r| !(r.namespace == namespace && same_handler(&r.handler, handler)));
        if routes.len() == before {
            warn!(namespace, "attempted to remove non-existent IQ route");
        }
    }

    /// Register a disconnect listener for a client. Returns `false` on
    /// a duplicate registration, which notably makes re-joining a MUC
    /// room idempotent.
    pub fn add_disconnect_listener(
        &self,
        client_id: uuid::Uuid,
        listener: Arc<dyn DisconnectListener>,
    ) -> bool {
        let mut listeners = self.listeners.write().unwrap();
        if listeners
            .iter()
            .any(|l| l.client_id == client_id && same_listener(&l.listener, &listener))
        {
            return false;
        }
        debug!(client = %client_id, "registered disconnect listener");
        listeners.push(Listener {
            client_id,
            listener,
        });
        true
    }

    /// Remove every listener registered for the client and invoke it.
    pub fn fire_disconnect(&self, server: &XmppServer, client: &ClientHandle) {
        let fired: Vec<Arc<dyn DisconnectListener>> = {
            let mut listeners = self.listeners.write().unwrap();
            let mut fired = Vec::new();
            listeners.retain(|l| {
                if l.client_id == client.id {
                    fired.push(Arc::clone(&l.listener));
                    false
                } else {
                    true
                }
            });
            fired
        };
        for listener in fired {
            listener.on_disconnect(server, client);
        }
    }

    /// Route a stanza by its `to` address.
    ///
    /// Returns whether any handler claimed the stanza. Unclaimed `iq`
    /// requests fall back to the IQ-route table and finally to a
    /// synthesized `service-unavailable` reply.
    pub fn route(&self, server: &XmppServer, stanza: &mut Element) -> bool {
        let target = match stanza.attr("to") {
            Some(to) => match to.parse::<JidPattern>() {
                Ok(target) => target,
                Err(_) => {
                    warn!(to, "stanza with unparseable destination dropped");
                    return false;
                }
            },
            // No address means the server itself.
            None => JidPattern::new(None, Some(server.domain()), None),
        };

        let matching: Vec<Arc<dyn StanzaHandler>> = {
            let routes = self.stanza_routes.read().unwrap();
            routes
                .iter()
                .filter(|r| r.pattern.matches(&target))
                .map(|r| Arc::clone(&r.handler))
                .collect()
        };

        let mut handled = false;
        for handler in matching {
            if handler.handle(server, stanza) {
                handled = true;
            }
        }

        if !handled && stanza.name() == "iq" {
            handled = self.route_iq(server, stanza);
        }

        if !handled {
            info!(to = %target, name = %stanza.name(), "no route for destination");
        }
        handled
    }

    /// Second-stage IQ dispatch by the first child's namespace.
    fn route_iq(&self, server: &XmppServer, stanza: &mut Element) -> bool {
        let namespace = match stanza.children().next() {
            Some(child) => child.ns(),
            None => {
                warn!("iq stanza has no child");
                return false;
            }
        };

        let matching: Vec<Arc<dyn StanzaHandler>> = {
            let routes = self.iq_routes.read().unwrap();
            routes
                .iter()
                .filter(|r| r.namespace == namespace)
                .map(|r| Arc::clone(&r.handler))
                .collect()
        };

        let mut handled = false;
        for handler in matching {
            if handler.handle(server, stanza) {
                handled = true;
            }
        }

        if !handled {
            self.send_service_unavailable(server, stanza);
        }
        handled
    }

    /// Reply to an undeliverable IQ request with `service-unavailable`.
    ///
    /// Replies are only generated for requests (`get`/`set`): answering
    /// an `error` or `result` would bounce between unroutable
    /// addresses forever. IQs without `id` or `from` cannot be answered
    /// and are dropped.
    fn send_service_unavailable(&self, server: &XmppServer, stanza: &mut Element) {
        match stanza.attr("type") {
            Some("error") | Some("result") => return,
            _ => {}
        }
        let Some(id) = stanza.attr("id") else {
            debug!("unroutable iq has no id, not answering");
            return;
        };
        let Some(from) = stanza.attr("from") else {
            debug!("unroutable iq has no from, not answering");
            return;
        };

        info!(id, to = from, "sending service-unavailable");
        let mut reply = Element::builder("iq", ns::JABBER_CLIENT)
            .attr("id", id)
            .attr("type", "error")
            .attr("from", server.domain())
            .attr("to", from)
            .append(
                Element::builder("error", ns::JABBER_CLIENT)
                    .attr("type", "cancel")
                    .append(Element::builder("service-unavailable", ns::STANZAS).build())
                    .build(),
            )
            .build();
        self.route(server, &mut reply);
    }
}

impl Default for StanzaRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{ServerOptions, XmppServer};
    use std::sync::Mutex;

    /// Handler that records every stanza it sees and returns a fixed
    /// verdict.
    struct Recorder {
        name: &'static str,
        verdict: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn new(
            name: &'static str,
            verdict: bool,
            log: &Arc<Mutex<Vec<String>>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                name,
                verdict,
                log: Arc::clone(log),
            })
        }
    }

    impl StanzaHandler for Recorder {
        fn handle(&self, _server: &XmppServer, stanza: &mut Element) -> bool {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.name, stanza.name()));
            self.verdict
        }
    }

    /// Handler that captures routed elements for inspection.
    struct Capture {
        seen: Arc<Mutex<Vec<Element>>>,
    }

    impl StanzaHandler for Capture {
        fn handle(&self, _server: &XmppServer, stanza: &mut Element) -> bool {
            self.seen.lock().unwrap().push(stanza.clone());
            true
        }
    }

    fn test_server() -> XmppServer {
        XmppServer::new(ServerOptions::default()).unwrap()
    }

    fn message_to(to: &str) -> Element {
        Element::builder("message", ns::JABBER_CLIENT)
            .attr("to", to)
            .attr("from", "a@localhost/1")
            .build()
    }

    fn iq_to(to: &str, child_ns: &str) -> Element {
        Element::builder("iq", ns::JABBER_CLIENT)
            .attr("id", "x1")
            .attr("type", "get")
            .attr("to", to)
            .attr("from", "a@localhost/1")
            .append(Element::builder("query", child_ns).build())
            .build()
    }

    #[test]
    fn duplicate_routes_are_rejected() {
        let router = StanzaRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = Recorder::new("h", true, &log);
        let pattern: JidPattern = "a@localhost/1".parse().unwrap();

        assert!(router.add_stanza_route(pattern.clone(), handler.clone()));
        assert!(!router.add_stanza_route(pattern.clone(), handler.clone()));

        // A different handler object under the same pattern is fine.
        let other = Recorder::new("h2", true, &log);
        assert!(router.add_stanza_route(pattern, other));

        assert!(router.add_iq_route(ns::ROSTER, handler.clone()));
        assert!(!router.add_iq_route(ns::ROSTER, handler));
    }

    #[test]
    fn all_matching_handlers_run_in_registration_order() {
        let server = test_server();
        let log = Arc::new(Mutex::new(Vec::new()));

        let first = Recorder::new("first", false, &log);
        let second = Recorder::new("second", true, &log);
        let third = Recorder::new("third", false, &log);
        let router = server.router();
        router.add_stanza_route("b@localhost/2".parse().unwrap(), first);
        router.add_stanza_route("*@localhost/*".parse().unwrap(), second);
        router.add_stanza_route("b@localhost".parse().unwrap(), third);

        let mut stanza = message_to("b@localhost/2");
        assert!(router.route(&server, &mut stanza));

        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:message", "second:message", "third:message"]
        );
    }

    #[test]
    fn wildcard_route_catches_bare_addresses() {
        let server = test_server();
        let log = Arc::new(Mutex::new(Vec::new()));
        let muc = Recorder::new("muc", true, &log);
        server
            .router()
            .add_stanza_route("*@conference.localhost/*".parse().unwrap(), muc);

        let mut stanza = message_to("room@conference.localhost");
        assert!(server.router().route(&server, &mut stanza));
        assert_eq!(*log.lock().unwrap(), vec!["muc:message"]);
    }

    #[test]
    fn removed_route_no_longer_matches() {
        let server = test_server();
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = Recorder::new("h", true, &log);
        let pattern: JidPattern = "a@localhost/1".parse().unwrap();

        let router = server.router();
        router.add_stanza_route(pattern.clone(), handler.clone());
        let as_dyn: Arc<dyn StanzaHandler> = handler;
        router.remove_stanza_route(&pattern, &as_dyn);

        let mut stanza = message_to("a@localhost/1");
        assert!(!router.route(&server, &mut stanza));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn unclaimed_iq_falls_back_to_namespace_table() {
        let server = test_server();
        let log = Arc::new(Mutex::new(Vec::new()));
        let roster = Recorder::new("roster", true, &log);
        server.router().add_iq_route(ns::ROSTER, roster);

        let mut stanza = iq_to("localhost", ns::ROSTER);
        assert!(server.router().route(&server, &mut stanza));
        assert_eq!(*log.lock().unwrap(), vec!["roster:iq"]);
    }

    #[test]
    fn claimed_iq_skips_namespace_table() {
        let server = test_server();
        let log = Arc::new(Mutex::new(Vec::new()));
        let direct = Recorder::new("direct", true, &log);
        let roster = Recorder::new("roster", true, &log);

        let router = server.router();
        router.add_stanza_route("localhost".parse().unwrap(), direct);
        router.add_iq_route(ns::ROSTER, roster);

        let mut stanza = iq_to("localhost", ns::ROSTER);
        assert!(router.route(&server, &mut stanza));
        assert_eq!(*log.lock().unwrap(), vec!["direct:iq"]);
    }

    #[test]
    fn unroutable_iq_gets_service_unavailable() {
        let server = test_server();
        let seen = Arc::new(Mutex::new(Vec::new()));
        server.router().add_stanza_route(
            "a@localhost/1".parse().unwrap(),
            Arc::new(Capture {
                seen: Arc::clone(&seen),
            }),
        );

        let mut stanza = iq_to("ghost@localhost/void", "urn:example:ping");
        server.router().route(&server, &mut stanza);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let reply = &seen[0];
        assert_eq!(reply.name(), "iq");
        assert_eq!(reply.attr("id"), Some("x1"));
        assert_eq!(reply.attr("type"), Some("error"));
        assert_eq!(reply.attr("to"), Some("a@localhost/1"));
        let error = reply.get_child("error", ns::JABBER_CLIENT).unwrap();
        assert_eq!(error.attr("type"), Some("cancel"));
        assert!(error
            .get_child("service-unavailable", ns::STANZAS)
            .is_some());
    }

    #[test]
    fn error_and_result_iqs_are_never_answered() {
        let server = test_server();
        let seen = Arc::new(Mutex::new(Vec::new()));
        server.router().add_stanza_route(
            "a@localhost/1".parse().unwrap(),
            Arc::new(Capture {
                seen: Arc::clone(&seen),
            }),
        );

        for iq_type in ["error", "result"] {
            let mut stanza = iq_to("ghost@localhost/void", "urn:example:ping");
            stanza.set_attr("type", iq_type);
            server.router().route(&server, &mut stanza);
        }
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn iq_without_id_or_from_is_dropped_silently() {
        let server = test_server();
        let seen = Arc::new(Mutex::new(Vec::new()));
        server.router().add_stanza_route(
            "a@localhost/1".parse().unwrap(),
            Arc::new(Capture {
                seen: Arc::clone(&seen),
            }),
        );

        let mut stanza = Element::builder("iq", ns::JABBER_CLIENT)
            .attr("type", "get")
            .attr("to", "ghost@localhost/void")
            .append(Element::builder("query", "urn:example:ping").build())
            .build();
        assert!(!server.router().route(&server, &mut stanza));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn unhandled_message_is_just_unhandled() {
        let server = test_server();
        let mut stanza = message_to("nobody@localhost/x");
        assert!(!server.router().route(&server, &mut stanza));
    }
}
