// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! End-to-end porter tests over an in-memory duplex transport.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use tokio_porter::nodetree::BuildStep;
use tokio_porter::{
    CancelToken, Error, Jid, Porter, PorterConfig, PorterEvent, Reconnector, SenderMatch,
    SmMarker, Stanza, StanzaSubType, StanzaType, XmppConnection,
};

const SERVER_OPEN: &[u8] = b"<?xml version='1.0'?>\
    <stream:stream xmlns:stream='http://etherx.jabber.org/streams' \
    xmlns='jabber:client' version='1.0' id='srv-stream'>";

/// The server end of the duplex: raw byte reads, stanza-string writes.
struct TestServer {
    io: DuplexStream,
    captured: String,
}

impl TestServer {
    async fn open(mut io: DuplexStream) -> TestServer {
        io.write_all(SERVER_OPEN).await.unwrap();
        TestServer {
            io,
            captured: String::new(),
        }
    }

    async fn send(&mut self, xml: &str) {
        self.io.write_all(xml.as_bytes()).await.unwrap();
    }

    /// Read until the captured client bytes contain `needle`.
    async fn read_until(&mut self, needle: &str) -> String {
        let result = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if self.captured.contains(needle) {
                    return self.captured.clone();
                }
                let mut chunk = [0u8; 4096];
                let n = self.io.read(&mut chunk).await.expect("server read");
                if n == 0 {
                    panic!(
                        "client closed before {:?} was seen; captured: {:?}",
                        needle, self.captured
                    );
                }
                self.captured
                    .push_str(std::str::from_utf8(&chunk[..n]).unwrap());
            }
        })
        .await;
        match result {
            Ok(captured) => captured,
            Err(_) => panic!(
                "timed out waiting for {:?}; captured: {:?}",
                needle, self.captured
            ),
        }
    }

    fn extract_attr(&self, element_marker: &str, attr: &str) -> String {
        let start = self
            .captured
            .find(element_marker)
            .unwrap_or_else(|| panic!("{:?} not captured", element_marker));
        let rest = &self.captured[start..];
        let key = format!("{}='", attr);
        let at = rest.find(&key).expect("attribute present") + key.len();
        rest[at..].split('\'').next().unwrap().to_owned()
    }
}

fn resumable_marker() -> SmMarker {
    SmMarker {
        enabled: true,
        resumable: true,
        id: Some("s1".to_owned()),
        location: None,
        timeout: None,
    }
}

async fn porter_pair(sm: Option<SmMarker>) -> (Porter, TestServer) {
    porter_pair_with(sm, None).await
}

async fn porter_pair_with(
    sm: Option<SmMarker>,
    reconnector: Option<Reconnector>,
) -> (Porter, TestServer) {
    let (client, server) = tokio::io::duplex(16384);
    let mut conn = XmppConnection::new(Box::new(client));
    if let Some(marker) = sm {
        conn = conn.with_stream_management(marker);
    }
    let porter = Porter::new(
        conn,
        Jid::new("romeo@example.com/orchard").unwrap(),
        PorterConfig { reconnector },
    );
    porter.start();
    (porter, TestServer::open(server).await)
}

fn message(id: &str) -> Stanza {
    let mut st = Stanza::build(
        StanzaType::Message,
        StanzaSubType::Chat,
        None,
        Some("juliet@example.com"),
        &[BuildStep::Start("body"), BuildStep::Text("hi"), BuildStep::End],
    )
    .unwrap();
    st.set_id(id);
    st
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting until {}", what);
}

#[tokio::test]
async fn sends_preserve_call_order() {
    let (porter, mut server) = porter_pair(None).await;
    for i in 0..5 {
        porter.send(message(&format!("order-{}", i))).await.unwrap();
    }
    let captured = server.read_until("order-4").await;
    let positions: Vec<usize> = (0..5)
        .map(|i| captured.find(&format!("order-{}", i)).unwrap())
        .collect();
    for pair in positions.windows(2) {
        assert!(pair[0] < pair[1], "out of order: {:?}", positions);
    }
}

#[tokio::test]
async fn send_and_ack_counters() {
    let (porter, mut server) = porter_pair(Some(resumable_marker())).await;
    for i in 0..3 {
        porter.send(message(&format!("ack-{}", i))).await.unwrap();
    }
    server.read_until("ack-2").await;

    wait_until("three sent stanzas are tracked", || {
        let snap = porter.sm_snapshot();
        snap.sent_count == 3 && snap.sent_acked == 0 && snap.unacked_len == 3
    })
    .await;

    server.send("<a xmlns='urn:xmpp:sm:3' h='2'/>").await;
    wait_until("ack arrives", || {
        let snap = porter.sm_snapshot();
        snap.sent_acked == 2 && snap.unacked_len == 1
    })
    .await;
}

#[tokio::test]
async fn iq_correlation() {
    let (porter, mut server) = porter_pair(None).await;
    let iq = Stanza::build(
        StanzaType::Iq,
        StanzaSubType::Get,
        None,
        Some("juliet@example.com/balcony"),
        &[
            BuildStep::Start("query"),
            BuildStep::Ns(tokio_porter::nodetree::ns::DISCO_INFO),
            BuildStep::End,
        ],
    )
    .unwrap();

    let token = porter.send_iq_tracked(iq, None).unwrap();
    server.read_until("disco#info").await;
    let id = server.extract_attr("<iq", "id");
    assert!(!id.is_empty());

    server
        .send(&format!(
            "<iq type='result' id='{}' from='juliet@example.com/balcony'/>",
            id
        ))
        .await;
    let reply = token.await.unwrap();
    assert_eq!(reply.id(), Some(id.as_str()));
    assert_eq!(reply.sub_type(), StanzaSubType::Result);

    // A duplicate response with the same id is dropped on the floor; the
    // porter keeps working.
    server
        .send(&format!(
            "<iq type='result' id='{}' from='juliet@example.com/balcony'/>",
            id
        ))
        .await;
    porter.send(message("after-dup")).await.unwrap();
    server.read_until("after-dup").await;
}

#[tokio::test]
async fn iq_spoofed_reply_is_dropped() {
    let (porter, mut server) = porter_pair(None).await;
    let iq = Stanza::build(
        StanzaType::Iq,
        StanzaSubType::Get,
        None,
        Some("juliet@example.com/balcony"),
        &[],
    )
    .unwrap();
    let token = porter.send_iq_tracked(iq, None).unwrap();
    server.read_until("balcony").await;
    let id = server.extract_attr("<iq", "id");

    server
        .send(&format!(
            "<iq type='result' id='{}' from='eve@example.com/attic'/>",
            id
        ))
        .await;
    // The pending future must not resolve.
    assert!(
        tokio::time::timeout(Duration::from_millis(200), token)
            .await
            .is_err()
    );
}

#[tokio::test]
async fn unhandled_iq_gets_service_unavailable() {
    let (_porter, mut server) = porter_pair(None).await;
    server
        .send("<iq type='get' id='42' from='srv'><xyzzy xmlns='urn:x'/></iq>")
        .await;
    let captured = server.read_until("service-unavailable").await;
    assert!(captured.contains("type='error'"));
    assert!(captured.contains("id='42'"));
    assert!(captured.contains("to='srv'"));
    assert!(captured.contains("<xyzzy xmlns='urn:x'/>"));
    assert!(captured.contains(
        "<service-unavailable xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/>"
    ));
}

#[tokio::test]
async fn claimed_iq_gets_no_fallback_error() {
    let (porter, mut server) = porter_pair(None).await;
    porter.register_handler(
        SenderMatch::Anyone,
        Some(StanzaType::Iq),
        StanzaSubType::Get,
        0,
        None,
        |_, _| true,
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    server
        .send("<iq type='get' id='43' from='srv'><ping xmlns='urn:xmpp:ping'/></iq>")
        .await;
    porter.send(message("fence")).await.unwrap();
    let captured = server.read_until("fence").await;
    assert!(!captured.contains("service-unavailable"));
}

#[tokio::test]
async fn handler_priorities_and_claiming() {
    let (porter, mut server) = porter_pair(None).await;
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let o = order.clone();
    porter.register_handler(
        SenderMatch::Anyone,
        Some(StanzaType::Message),
        StanzaSubType::None,
        0,
        None,
        move |_, _| {
            o.lock().unwrap().push("low");
            true
        },
    );
    let o = order.clone();
    porter.register_handler(
        SenderMatch::Anyone,
        Some(StanzaType::Message),
        StanzaSubType::None,
        10,
        None,
        move |_, _| {
            o.lock().unwrap().push("high");
            false
        },
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    server
        .send("<message from='juliet@example.com'><body>hi</body></message>")
        .await;
    wait_until("both handlers ran", || order.lock().unwrap().len() == 2).await;
    assert_eq!(*order.lock().unwrap(), vec!["high", "low"]);
    drop(server);
}

#[tokio::test]
async fn pattern_and_sender_scoping() {
    let (porter, mut server) = porter_pair(None).await;
    let hits: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    // Only messages from juliet carrying a <special/> child.
    let (pattern, _) = tokio_porter::nodetree::build(
        "message",
        tokio_porter::nodetree::NsQuark::NONE,
        &[BuildStep::Start("special"), BuildStep::End],
    );
    let h = hits.clone();
    porter.register_handler(
        SenderMatch::Jid(Jid::new("juliet@example.com").unwrap()),
        Some(StanzaType::Message),
        StanzaSubType::None,
        0,
        Some(pattern),
        move |_, stanza| {
            h.lock().unwrap().push(stanza.id().unwrap_or("?").to_owned());
            true
        },
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    server
        .send("<message id='m1' from='juliet@example.com/balcony'><special/></message>")
        .await;
    server
        .send("<message id='m2' from='eve@example.com'><special/></message>")
        .await;
    server
        .send("<message id='m3' from='juliet@example.com/balcony'><plain/></message>")
        .await;
    server
        .send("<message id='m4' from='juliet@example.com/garden'><special/></message>")
        .await;

    wait_until("both matching stanzas dispatched", || {
        hits.lock().unwrap().len() == 2
    })
    .await;
    assert_eq!(*hits.lock().unwrap(), vec!["m1".to_owned(), "m4".to_owned()]);
}

#[tokio::test]
async fn power_saving_defers_and_flushes_in_order() {
    let (porter, mut server) = porter_pair(None).await;
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    porter.register_handler(
        SenderMatch::Anyone,
        None,
        StanzaSubType::None,
        0,
        None,
        move |_, stanza| {
            s.lock().unwrap().push(stanza.id().unwrap_or("?").to_owned());
            true
        },
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    porter.enable_power_saving(true);

    for i in 1..=3 {
        server
            .send(&format!("<presence id='p{}' from='juliet@example.com'/>", i))
            .await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(seen.lock().unwrap().is_empty());

    server
        .send("<message id='m' from='juliet@example.com'><body>hi</body></message>")
        .await;
    wait_until("queue flushed before the important stanza", || {
        seen.lock().unwrap().len() == 4
    })
    .await;
    assert_eq!(
        *seen.lock().unwrap(),
        vec!["p1".to_owned(), "p2".to_owned(), "p3".to_owned(), "m".to_owned()]
    );

    // Disabling flushes whatever is still parked.
    seen.lock().unwrap().clear();
    server.send("<presence id='p4' from='juliet@example.com'/>").await;
    server.send("<presence id='p5' from='juliet@example.com'/>").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(seen.lock().unwrap().is_empty());
    porter.enable_power_saving(false);
    wait_until("deferred stanzas flushed on disable", || {
        seen.lock().unwrap().len() == 2
    })
    .await;
    assert_eq!(*seen.lock().unwrap(), vec!["p4".to_owned(), "p5".to_owned()]);
}

#[tokio::test]
async fn whitespace_ping_without_sm() {
    let (porter, mut server) = porter_pair(None).await;
    porter.send_whitespace_ping().await.unwrap();
    let captured = server.read_until(" ").await;
    assert_eq!(captured, " ");
}

#[tokio::test]
async fn ping_with_sm_sends_r_and_gives_up_eventually() {
    let (porter, mut server) = porter_pair(Some(resumable_marker())).await;
    let mut events = porter.subscribe();

    porter.send_whitespace_ping().await.unwrap();
    server.read_until("<r xmlns='urn:xmpp:sm:3'/>").await;
    assert_eq!(porter.sm_snapshot().outstanding_r, 1);

    porter.send_whitespace_ping().await.unwrap();
    wait_until("second request recorded", || {
        porter.sm_snapshot().outstanding_r == 2
    })
    .await;

    // Third unanswered ping: the porter concludes the peer is gone.
    let result = porter.send_whitespace_ping().await;
    assert!(matches!(result, Err(Error::Transport(_))));
    loop {
        match events.recv().await {
            Ok(PorterEvent::RemoteError(Error::Transport(_))) => break,
            Ok(_) => (),
            Err(e) => panic!("event stream ended: {}", e),
        }
    }
}

#[tokio::test]
async fn ack_resets_request_pressure() {
    let (porter, mut server) = porter_pair(Some(resumable_marker())).await;
    porter.send_whitespace_ping().await.unwrap();
    server.read_until("<r xmlns='urn:xmpp:sm:3'/>").await;
    server.send("<a xmlns='urn:xmpp:sm:3' h='0'/>").await;
    wait_until("pressure cleared", || {
        porter.sm_snapshot().outstanding_r == 0
    })
    .await;
}

#[tokio::test]
async fn inbound_r_is_answered_with_the_received_count() {
    let (porter, mut server) = porter_pair(Some(resumable_marker())).await;
    porter.register_handler(
        SenderMatch::Anyone,
        None,
        StanzaSubType::None,
        0,
        None,
        |_, _| true,
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    server
        .send("<message id='x' from='juliet@example.com'><body>1</body></message>")
        .await;
    server.send("<r xmlns='urn:xmpp:sm:3'/>").await;
    server.read_until("<a xmlns='urn:xmpp:sm:3' h='1'/>").await;
}

#[tokio::test]
async fn cancellation_before_serialisation() {
    let (porter, mut server) = porter_pair(None).await;

    // A large head element keeps the queue busy while we cancel the
    // second one.
    let big_body = "x".repeat(64 * 1024);
    let mut big = Stanza::build(
        StanzaType::Message,
        StanzaSubType::Chat,
        None,
        None,
        &[
            BuildStep::Start("body"),
            BuildStep::Text(&big_body),
            BuildStep::End,
        ],
    )
    .unwrap();
    big.set_id("big");
    let mut t1 = porter.send_tracked(big, None);

    let cancel = CancelToken::new();
    let mut t2 = porter.send_tracked(message("cancelled"), Some(cancel.clone()));
    cancel.cancel();

    let mut t3 = porter.send_tracked(message("after-cancel"), None);

    // Draining the server side unblocks the large head element.
    let captured = server.read_until("after-cancel").await;
    t1.wait().await.unwrap();
    assert!(matches!(t2.wait().await, Err(Error::Cancelled)));
    t3.wait().await.unwrap();
    assert!(!captured.contains("id='cancelled'"));
}

#[tokio::test]
async fn close_flushes_then_exchanges_footers() {
    let (porter, mut server) = porter_pair(None).await;
    let mut events = porter.subscribe();
    porter.send(message("last-words")).await.unwrap();

    let closer = {
        let porter = porter.clone();
        tokio::spawn(async move { porter.close().await })
    };

    let captured = server.read_until("</stream:stream>").await;
    assert!(captured.find("last-words").unwrap() < captured.find("</stream:stream>").unwrap());

    // Sends after close fail without touching the wire.
    assert!(matches!(
        porter.send(message("too-late")).await,
        Err(Error::PorterClosing)
    ));

    server.send("</stream:stream>").await;
    drop(server);
    closer.await.unwrap().unwrap();
    loop {
        match events.recv().await {
            Ok(PorterEvent::RemoteClosed) => break,
            Ok(_) => (),
            Err(e) => panic!("event stream ended: {}", e),
        }
    }
}

#[tokio::test]
async fn force_close_terminates_pending_operations() {
    let (porter, mut server) = porter_pair(None).await;
    let iq = Stanza::build(StanzaType::Iq, StanzaSubType::Get, None, None, &[]).unwrap();
    let token = porter.send_iq_tracked(iq, None).unwrap();
    server.read_until("<iq").await;

    porter.force_close().await.unwrap();
    assert!(matches!(token.await, Err(Error::ForciblyClosed)));
}

#[tokio::test]
async fn remote_stream_error_fails_everything() {
    let (porter, mut server) = porter_pair(None).await;
    let mut events = porter.subscribe();
    let iq = Stanza::build(StanzaType::Iq, StanzaSubType::Get, None, None, &[]).unwrap();
    let token = porter.send_iq_tracked(iq, None).unwrap();
    server.read_until("<iq").await;

    server
        .send(
            "<stream:error xmlns:stream='http://etherx.jabber.org/streams'>\
             <system-shutdown xmlns='urn:ietf:params:xml:ns:xmpp-streams'/>\
             </stream:error>",
        )
        .await;

    match token.await {
        Err(Error::Stream(e)) => assert_eq!(
            e.condition,
            tokio_porter::xmpp_error::StreamErrorCondition::SystemShutdown
        ),
        other => panic!("unexpected result: {:?}", other.map(|_| ())),
    }
    loop {
        match events.recv().await {
            Ok(PorterEvent::RemoteError(Error::Stream(_))) => break,
            Ok(_) => (),
            Err(e) => panic!("event stream ended: {}", e),
        }
    }
}

#[tokio::test]
async fn resumption_replays_unacked_stanzas() {
    // The second connection is handed out by the reconnector.
    let (client2, server2_io) = tokio::io::duplex(16384);
    let second: Arc<Mutex<Option<DuplexStream>>> = Arc::new(Mutex::new(Some(client2)));
    let reconnector: Reconnector = Box::new(move |_location, slot| {
        let io = second
            .lock()
            .unwrap()
            .take()
            .expect("only one reconnect expected");
        let conn = XmppConnection::new(Box::new(io)).with_stream_management(SmMarker {
            enabled: true,
            resumable: true,
            id: Some("s1".to_owned()),
            location: None,
            timeout: None,
        });
        let _ = slot.send(conn);
    });

    let (porter, mut server) =
        porter_pair_with(Some(resumable_marker()), Some(reconnector)).await;
    let mut events = porter.subscribe();

    for i in 0..3 {
        porter.send(message(&format!("res-{}", i))).await.unwrap();
    }
    server.read_until("res-2").await;
    server.send("<a xmlns='urn:xmpp:sm:3' h='1'/>").await;
    wait_until("first stanza acked", || {
        let snap = porter.sm_snapshot();
        snap.sent_acked == 1 && snap.unacked_len == 2
    })
    .await;

    // Kill the first transport.
    drop(server);

    let mut server2 = TestServer::open(server2_io).await;
    let captured = server2.read_until("<resume").await;
    assert!(captured.contains("previd='s1'"));
    assert!(captured.contains("h='0'"));

    server2
        .send("<resumed xmlns='urn:xmpp:sm:3' previd='s1' h='2'/>")
        .await;

    // res-1 was covered by h='2'; only res-2 is replayed, then the
    // trailing <r/>.
    let captured = server2.read_until("<r xmlns='urn:xmpp:sm:3'/>").await;
    assert!(captured.contains("res-2"));
    assert!(!captured.contains("res-1"));
    assert!(
        captured.find("res-2").unwrap() < captured.find("<r xmlns='urn:xmpp:sm:3'/>").unwrap()
    );

    let mut saw_resuming = false;
    let mut saw_resumed = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !(saw_resuming && saw_resumed) {
        let ev = tokio::time::timeout_at(deadline, events.recv())
            .await
            .expect("events in time")
            .expect("event stream open");
        match ev {
            PorterEvent::Resuming => saw_resuming = true,
            PorterEvent::Resumed => saw_resumed = true,
            _ => (),
        }
    }

    // The revived stream keeps working.
    porter.send(message("after-resume")).await.unwrap();
    server2.read_until("after-resume").await;
}

#[tokio::test]
async fn failed_resumption_surfaces_resume_failed() {
    let (client2, server2_io) = tokio::io::duplex(16384);
    let second: Arc<Mutex<Option<DuplexStream>>> = Arc::new(Mutex::new(Some(client2)));
    let reconnector: Reconnector = Box::new(move |_location, slot| {
        let io = second.lock().unwrap().take().expect("one reconnect");
        let conn = XmppConnection::new(Box::new(io));
        let _ = slot.send(conn);
    });

    let (porter, server) =
        porter_pair_with(Some(resumable_marker()), Some(reconnector)).await;
    let mut events = porter.subscribe();

    porter.send(message("doomed")).await.unwrap();
    drop(server);

    let mut server2 = TestServer::open(server2_io).await;
    server2.read_until("<resume").await;
    server2.send("<failed xmlns='urn:xmpp:sm:3'/>").await;

    let mut saw_resume_failed = false;
    let mut saw_remote_error = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !(saw_resume_failed && saw_remote_error) {
        let ev = tokio::time::timeout_at(deadline, events.recv())
            .await
            .expect("events in time")
            .expect("event stream open");
        match ev {
            PorterEvent::ResumeFailed => saw_resume_failed = true,
            PorterEvent::RemoteError(Error::ResumeFailed(_)) => saw_remote_error = true,
            _ => (),
        }
    }
}
