//! Multi-User Chat (XEP-0045).
//!
//! The engine owns every room on `conference.<domain>` and claims one
//! wildcard stanza route for the whole subdomain. Rooms exist exactly
//! as long as they have occupants: the first join creates a room, the
//! last leave destroys it. Occupants are known to each other only by
//! their room nickname, which doubles as the resource of the room JID.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use jid::{FullJid, Jid};
use minidom::Element;
use tracing::{debug, info, warn};
use uuid::Uuid;
use xmpp_parsers::muc::user::{Affiliation, Item, MucUser, Role, Status};
use xmpp_parsers::presence::{Presence, Type as PresenceType};

use crate::parser::ns;
use crate::pattern::JidPattern;
use crate::registry::ClientHandle;
use crate::routing::{DisconnectListener, StanzaHandler};
use crate::server::XmppServer;

/// A client present in a room.
#[derive(Debug, Clone)]
pub struct Occupant {
    /// Room-local nickname; the resource used when addressing them.
    pub nick: String,
    /// The real JID the occupant joined from.
    pub real_jid: Jid,
}

/// A chat room with at least one occupant.
#[derive(Debug)]
pub struct Room {
    /// Room name, the localpart of the room JID.
    pub name: String,
    /// `name@conference.<domain>`.
    pub jid: String,
    /// Occupants in join order.
    pub occupants: Vec<Occupant>,
}

impl Room {
    fn new(name: &str, muc_domain: &str) -> Self {
        Self {
            name: name.to_owned(),
            jid: format!("{}@{}", name, muc_domain),
            occupants: Vec::new(),
        }
    }

    /// The room JID with a nickname as resource.
    fn nick_jid(&self, nick: &str) -> String {
        format!("{}/{}", self.jid, nick)
    }

    fn occupant_index(&self, real_jid: &Jid) -> Option<usize> {
        self.occupants.iter().position(|o| o.real_jid == *real_jid)
    }
}

/// The MUC component.
pub struct MucEngine {
    muc_domain: String,
    rooms: Mutex<HashMap<String, Room>>,
    self_ref: OnceLock<Weak<MucEngine>>,
}

impl MucEngine {
    /// Create the engine for `conference.<server domain>`.
    pub fn new(server_domain: &str) -> Self {
        Self {
            muc_domain: format!("conference.{}", server_domain),
            rooms: Mutex::new(HashMap::new()),
            self_ref: OnceLock::new(),
        }
    }

    /// The subdomain this engine serves.
    pub fn muc_domain(&self) -> &str {
        &self.muc_domain
    }

    /// Claim the wildcard route for the MUC subdomain.
    pub fn install(self: Arc<Self>, server: &XmppServer) {
        let _ = self.self_ref.set(Arc::downgrade(&self));
        let pattern: JidPattern = format!("*@{}/*", self.muc_domain)
            .parse()
            .expect("muc wildcard pattern");
        server
            .router()
            .add_stanza_route(pattern, self as Arc<dyn StanzaHandler>);
    }

    /// Number of live rooms.
    pub fn room_count(&self) -> usize {
        self.rooms.lock().unwrap().len()
    }

    /// Whether a room currently exists.
    pub fn room_exists(&self, name: &str) -> bool {
        self.rooms.lock().unwrap().contains_key(name)
    }

    fn handle_presence(&self, server: &XmppServer, stanza: &mut Element) -> bool {
        let Some(to) = stanza.attr("to") else {
            warn!("MUC presence without to attribute");
            return false;
        };
        let Ok(to_jid) = to.parse::<FullJid>() else {
            warn!(to, "MUC presence has no nickname");
            return false;
        };
        let Some(room_name) = to_jid.node().map(|n| n.as_str().to_owned()) else {
            warn!(to, "MUC presence has no room name");
            return false;
        };
        let nick = to_jid.resource().as_str().to_owned();

        let Some(from_jid) = stanza.attr("from").and_then(|f| f.parse::<Jid>().ok()) else {
            warn!("MUC presence without usable from attribute");
            return false;
        };

        if stanza.attr("type") == Some("unavailable") {
            debug!(room = %room_name, nick = %nick, "leaving room");
            self.presence_leave(server, &room_name, &from_jid)
        } else {
            debug!(room = %room_name, nick = %nick, "entering room");
            self.presence_join(server, &room_name, &nick, &from_jid)
        }
    }

    fn presence_join(
        &self,
        server: &XmppServer,
        room_name: &str,
        nick: &str,
        from_jid: &Jid,
    ) -> bool {
        // Local joiners get a disconnect listener so a dropped socket
        // turns into a room leave.
        if let Some(client) = server.registry().find(from_jid) {
            if let Some(engine) = self.self_ref.get().and_then(Weak::upgrade) {
                server
                    .router()
                    .add_disconnect_listener(client.id, engine as Arc<dyn DisconnectListener>);
            }
        }

        let mut rooms = self.rooms.lock().unwrap();
        let room = rooms
            .entry(room_name.to_owned())
            .or_insert_with(|| {
                info!(room = %room_name, "creating room");
                Room::new(room_name, &self.muc_domain)
            });

        // Existing occupants are announced to the new one first.
        for occupant in &room.occupants {
            let mut presence = occupant_presence(
                &room.nick_jid(&occupant.nick),
                &from_jid.to_string(),
                false,
            );
            server.route(&mut presence);
        }

        // Then the new occupant is announced to the room.
        for occupant in &room.occupants {
            let mut presence = occupant_presence(
                &room.nick_jid(nick),
                &occupant.real_jid.to_string(),
                false,
            );
            server.route(&mut presence);
        }

        room.occupants.push(Occupant {
            nick: nick.to_owned(),
            real_jid: from_jid.clone(),
        });

        // The joiner's own copy carries status 110.
        let mut presence =
            occupant_presence(&room.nick_jid(nick), &from_jid.to_string(), true);
        server.route(&mut presence);

        info!(room = %room_name, nick = %nick, occupants = room.occupants.len(), "joined room");
        true
    }

    fn presence_leave(&self, server: &XmppServer, room_name: &str, from_jid: &Jid) -> bool {
        let mut rooms = self.rooms.lock().unwrap();
        let Some(room) = rooms.get_mut(room_name) else {
            warn!(room = %room_name, "leave for nonexistent room");
            return false;
        };
        let Some(index) = room.occupant_index(from_jid) else {
            warn!(room = %room_name, "leave from a non-member");
            return false;
        };

        Self::broadcast_leave(server, room, index);

        if room.occupants.is_empty() {
            info!(room = %room_name, "room empty, destroying");
            rooms.remove(room_name);
        }
        true
    }

    /// Remove occupant `index` from the room and announce it, the
    /// leaver's own copy first with status 110.
    fn broadcast_leave(server: &XmppServer, room: &mut Room, index: usize) {
        let leaver = room.occupants.remove(index);
        let from = room.nick_jid(&leaver.nick);

        let mut own = leave_presence(&from, &leaver.real_jid.to_string(), true);
        server.route(&mut own);

        for occupant in &room.occupants {
            let mut presence = leave_presence(&from, &occupant.real_jid.to_string(), false);
            server.route(&mut presence);
        }
    }

    fn handle_message(&self, server: &XmppServer, stanza: &mut Element) -> bool {
        if stanza.attr("type") != Some("groupchat") {
            warn!("MUC message type other than groupchat");
            return false;
        }
        let Some(orig_to) = stanza.attr("to").map(str::to_owned) else {
            return false;
        };
        let Some(orig_from) = stanza.attr("from").map(str::to_owned) else {
            return false;
        };
        let Ok(to_jid) = orig_to.parse::<Jid>() else {
            return false;
        };
        let Some(room_name) = to_jid.node().map(|n| n.as_str().to_owned()) else {
            return false;
        };
        let Ok(from_jid) = orig_from.parse::<Jid>() else {
            return false;
        };

        let rooms = self.rooms.lock().unwrap();
        let Some(room) = rooms.get(&room_name) else {
            warn!(room = %room_name, "groupchat message to nonexistent room");
            return false;
        };
        let Some(index) = room.occupant_index(&from_jid) else {
            warn!(room = %room_name, "groupchat message from outside the room");
            return false;
        };

        // Re-route one copy per occupant, sent from the sender's room
        // nickname; the caller's element gets its addressing restored.
        let nick_jid = room.nick_jid(&room.occupants[index].nick);
        stanza.set_attr("from", nick_jid);
        for occupant in &room.occupants {
            stanza.set_attr("to", occupant.real_jid.to_string());
            server.route(stanza);
        }
        stanza.set_attr("to", orig_to);
        stanza.set_attr("from", orig_from);
        true
    }

    fn handle_iq(&self, server: &XmppServer, stanza: &mut Element) -> bool {
        let Some(id) = stanza.attr("id").map(str::to_owned) else {
            warn!("MUC iq with no id");
            return false;
        };
        let Some(from) = stanza.attr("from").map(str::to_owned) else {
            warn!("MUC iq with no from");
            return false;
        };
        let Some(child) = stanza.children().next() else {
            warn!("MUC iq with no child");
            return false;
        };

        let payload = match child.ns().as_str() {
            ns::DISCO_ITEMS => self.items_query(),
            ns::DISCO_INFO => self.info_query(),
            other => {
                warn!(namespace = other, "unknown MUC iq namespace");
                return false;
            }
        };

        let mut reply = Element::builder("iq", ns::JABBER_CLIENT)
            .attr("id", id)
            .attr("type", "result")
            .attr("from", self.muc_domain.as_str())
            .attr("to", from)
            .append(payload)
            .build();
        server.route(&mut reply);
        true
    }

    /// disco#items: one item per live room.
    fn items_query(&self) -> Element {
        let rooms = self.rooms.lock().unwrap();
        let mut query = Element::builder("query", ns::DISCO_ITEMS);
        for room in rooms.values() {
            query = query.append(
                Element::builder("item", ns::DISCO_ITEMS)
                    .attr("jid", room.jid.as_str())
                    .attr("name", room.name.as_str())
                    .build(),
            );
        }
        query.build()
    }

    /// disco#info: the public chatroom service identity.
    fn info_query(&self) -> Element {
        let features = [ns::MUC, ns::DISCO_INFO, ns::DISCO_ITEMS];
        let mut query = Element::builder("query", ns::DISCO_INFO).append(
            Element::builder("identity", ns::DISCO_INFO)
                .attr("category", "conference")
                .attr("type", "text")
                .attr("name", "Public Chatrooms")
                .build(),
        );
        for feature in features {
            query = query.append(
                Element::builder("feature", ns::DISCO_INFO)
                    .attr("var", feature)
                    .build(),
            );
        }
        query.build()
    }
}

impl StanzaHandler for MucEngine {
    fn handle(&self, server: &XmppServer, stanza: &mut Element) -> bool {
        if stanza.attr("from").is_none() {
            warn!("MUC stanza without from attribute");
            return false;
        }
        match stanza.name() {
            "message" => self.handle_message(server, stanza),
            "presence" => self.handle_presence(server, stanza),
            "iq" => self.handle_iq(server, stanza),
            other => {
                warn!(name = other, "unknown MUC stanza");
                false
            }
        }
    }
}

impl DisconnectListener for MucEngine {
    fn on_disconnect(&self, server: &XmppServer, client: &ClientHandle) {
        let client_jid = Jid::from(client.jid.clone());
        let mut rooms = self.rooms.lock().unwrap();

        let joined: Vec<String> = rooms
            .iter()
            .filter(|(_, room)| room.occupant_index(&client_jid).is_some())
            .map(|(name, _)| name.clone())
            .collect();

        for name in joined {
            debug!(room = %name, jid = %client_jid, "forced leave on disconnect");
            let Some(room) = rooms.get_mut(&name) else {
                continue;
            };
            if let Some(index) = room.occupant_index(&client_jid) {
                Self::broadcast_leave(server, room, index);
            }
            if room.occupants.is_empty() {
                info!(room = %name, "room empty, destroying");
                rooms.remove(&name);
            }
        }
    }
}

/// Build an occupant presence from `room@conference.<d>/<nick>`.
fn occupant_presence(from: &str, to: &str, is_self: bool) -> Element {
    build_presence(from, to, is_self, PresenceType::None, Role::Participant)
}

/// Build an unavailable presence announcing a leave.
fn leave_presence(from: &str, to: &str, is_self: bool) -> Element {
    build_presence(from, to, is_self, PresenceType::Unavailable, Role::None)
}

fn build_presence(
    from: &str,
    to: &str,
    is_self: bool,
    type_: PresenceType,
    role: Role,
) -> Element {
    let mut presence = Presence::new(type_);
    presence.from = from.parse::<Jid>().ok();
    presence.to = to.parse::<Jid>().ok();
    presence.id = Some(Uuid::new_v4().to_string());

    let muc_user = MucUser {
        status: if is_self {
            vec![Status::SelfPresence]
        } else {
            vec![]
        },
        items: vec![Item {
            affiliation: Affiliation::Member,
            role,
            jid: None,
            nick: None,
            actor: None,
            continue_: None,
            reason: None,
        }],
    };
    presence.payloads.push(muc_user.into());

    presence.into()
}
