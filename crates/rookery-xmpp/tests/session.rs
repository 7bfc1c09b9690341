//! End-to-end session tests: negotiation, direct messages, IQ stubs,
//! and the unroutable-IQ error path, all over real loopback TCP.

mod common;

use common::{parse_stanza, plain_payload, stream_header, TestClient, TestServer};
use rookery_xmpp::ns;

#[tokio::test]
async fn bind_happy_path() {
    let server = TestServer::start().await;
    let mut client = TestClient::connect(server.addr).await;

    client.send(&stream_header()).await;
    let header = client.read_until(">").await;
    assert!(header.contains("<stream:stream"));
    assert!(header.contains("from='localhost'"));
    let features = client.read_until("</stream:features>").await;
    assert!(features.contains("<mechanism>PLAIN</mechanism>"));

    client
        .send("<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>AHRvbQB0b20=</auth>")
        .await;
    client.read_until("<success").await;
    client.read_until(">").await;

    client.send(&stream_header()).await;
    let features = client.read_until("</stream:features>").await;
    assert!(features.contains("<bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>"));

    client
        .send(
            "<iq id='1' type='set'>\
             <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
             <resource>pc</resource></bind></iq>",
        )
        .await;
    let reply = parse_stanza(&client.read_until("</iq>").await);
    assert_eq!(reply.attr("id"), Some("1"));
    assert_eq!(reply.attr("type"), Some("result"));
    let bind = reply.get_child("bind", ns::BIND).unwrap();
    assert_eq!(bind.get_child("jid", ns::BIND).unwrap().text(), "tom@localhost/pc");

    // The session is registered under its bound JID.
    let jid: jid::Jid = "tom@localhost/pc".parse().unwrap();
    assert!(server.server.registry().is_connected(&jid));
}

#[tokio::test]
async fn direct_message_between_two_clients() {
    let server = TestServer::start().await;
    let mut a = TestClient::bind(server.addr, "a", "1").await;
    let mut b = TestClient::bind(server.addr, "b", "2").await;

    a.send(
        "<message to='b@localhost/2' from='a@localhost/1' type='chat'>\
         <body>hi</body></message>",
    )
    .await;

    let received = parse_stanza(&b.read_until("</message>").await);
    assert_eq!(received.name(), "message");
    assert_eq!(received.attr("to"), Some("b@localhost/2"));
    assert_eq!(received.attr("from"), Some("a@localhost/1"));
    assert_eq!(received.attr("type"), Some("chat"));
    assert_eq!(
        received.get_child("body", ns::JABBER_CLIENT).unwrap().text(),
        "hi"
    );
}

#[tokio::test]
async fn missing_from_is_stamped_with_the_bound_jid() {
    let server = TestServer::start().await;
    let mut a = TestClient::bind(server.addr, "a", "1").await;
    let mut b = TestClient::bind(server.addr, "b", "2").await;

    a.send("<message to='b@localhost/2'><body>anonymous?</body></message>")
        .await;

    let received = parse_stanza(&b.read_until("</message>").await);
    assert_eq!(received.attr("from"), Some("a@localhost/1"));
}

#[tokio::test]
async fn bare_jid_message_reaches_a_bound_resource() {
    let server = TestServer::start().await;
    let mut a = TestClient::bind(server.addr, "a", "1").await;
    let mut b = TestClient::bind(server.addr, "b", "2").await;

    a.send("<message to='b@localhost' from='a@localhost/1'><body>bare</body></message>")
        .await;

    let received = parse_stanza(&b.read_until("</message>").await);
    assert_eq!(
        received.get_child("body", ns::JABBER_CLIENT).unwrap().text(),
        "bare"
    );
}

#[tokio::test]
async fn session_and_roster_stubs_answer() {
    let server = TestServer::start().await;
    let mut client = TestClient::bind(server.addr, "tom", "pc").await;

    client
        .send(
            "<iq id='sess1' type='set'>\
             <session xmlns='urn:ietf:params:xml:ns:xmpp-session'/></iq>",
        )
        .await;
    let reply = parse_stanza(&client.read_until("</iq>").await);
    assert_eq!(reply.attr("id"), Some("sess1"));
    assert_eq!(reply.attr("type"), Some("result"));

    client
        .send("<iq id='r1' type='get'><query xmlns='jabber:iq:roster'/></iq>")
        .await;
    let reply = parse_stanza(&client.read_until("</iq>").await);
    assert_eq!(reply.attr("type"), Some("result"));
    let query = reply.get_child("query", ns::ROSTER).unwrap();
    assert_eq!(query.children().count(), 0);
}

#[tokio::test]
async fn server_disco_stubs_answer() {
    let server = TestServer::start().await;
    let mut client = TestClient::bind(server.addr, "tom", "pc").await;

    client
        .send(
            "<iq id='d1' type='get' to='localhost'>\
             <query xmlns='http://jabber.org/protocol/disco#info'/></iq>",
        )
        .await;
    let reply = parse_stanza(&client.read_until("</iq>").await);
    let query = reply.get_child("query", ns::DISCO_INFO).unwrap();
    let identity = query.get_child("identity", ns::DISCO_INFO).unwrap();
    assert_eq!(identity.attr("category"), Some("server"));
    assert_eq!(identity.attr("type"), Some("im"));

    client
        .send(
            "<iq id='d2' type='get' to='localhost'>\
             <query xmlns='http://jabber.org/protocol/disco#items'/></iq>",
        )
        .await;
    let reply = parse_stanza(&client.read_until("</iq>").await);
    let query = reply.get_child("query", ns::DISCO_ITEMS).unwrap();
    assert_eq!(query.children().count(), 0);
}

#[tokio::test]
async fn unroutable_iq_draws_service_unavailable() {
    let server = TestServer::start().await;
    let mut a = TestClient::bind(server.addr, "a", "1").await;

    a.send(
        "<iq id='x' type='get' to='localhost' from='a@localhost/1'>\
         <ping xmlns='urn:example:ping'/></iq>",
    )
    .await;

    let reply = parse_stanza(&a.read_until("</iq>").await);
    assert_eq!(reply.attr("id"), Some("x"));
    assert_eq!(reply.attr("type"), Some("error"));
    assert_eq!(reply.attr("to"), Some("a@localhost/1"));
    let error = reply.get_child("error", ns::JABBER_CLIENT).unwrap();
    assert_eq!(error.attr("type"), Some("cancel"));
    assert!(error.get_child("service-unavailable", ns::STANZAS).is_some());
}

#[tokio::test]
async fn two_nul_rule_is_enforced_on_the_wire() {
    let server = TestServer::start().await;
    let mut client = TestClient::connect(server.addr).await;

    client.send(&stream_header()).await;
    client.read_until("</stream:features>").await;

    // One NUL only; the server must drop us without a reply.
    use base64::prelude::*;
    let payload = BASE64_STANDARD.encode(b"tom\0tom");
    client
        .send(&format!(
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{}</auth>",
            payload
        ))
        .await;

    let mut buf = [0u8; 512];
    use tokio::io::AsyncReadExt;
    let n = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        client_stream(&mut client).read(&mut buf),
    )
    .await
    .expect("timed out waiting for disconnect")
    .expect("read failed");
    assert_eq!(n, 0, "server should close on malformed SASL payload");
}

/// Reach into the client for raw reads (EOF detection).
fn client_stream(client: &mut TestClient) -> &mut tokio::net::TcpStream {
    client.stream_mut()
}

#[tokio::test]
async fn valid_payload_with_unused_password_still_binds() {
    let server = TestServer::start().await;
    // plain_payload builds authzid-less credentials for any user name.
    assert!(!plain_payload("someone").is_empty());
    let client = TestClient::bind(server.addr, "someone", "res").await;
    drop(client);
}
