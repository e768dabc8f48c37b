// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Drives a porter against a scripted peer over an in-memory pipe.
//!
//! Run with `RUST_LOG=debug cargo run --example loopback` to watch the
//! dispatch and stream-management machinery at work.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use tokio_porter::nodetree::BuildStep;
use tokio_porter::{
    Jid, Porter, PorterConfig, SenderMatch, Stanza, StanzaSubType, StanzaType, XmppConnection,
};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::init();

    let (client, mut server) = tokio::io::duplex(16384);
    let porter = Porter::new(
        XmppConnection::new(Box::new(client)),
        Jid::new("romeo@example.com/orchard").unwrap(),
        PorterConfig::default(),
    );

    porter.register_handler(
        SenderMatch::Anyone,
        Some(StanzaType::Message),
        StanzaSubType::None,
        0,
        None,
        |_, stanza| {
            println!(
                "<- message from {}: {:?}",
                stanza.from_attr().unwrap_or("?"),
                stanza
                    .root()
                    .child("body")
                    .and_then(|b| b.content())
                    .unwrap_or("")
            );
            true
        },
    );
    porter.start();

    // The scripted peer: opens the stream, delivers one message, echoes
    // whatever it reads back into the void.
    let peer = tokio::spawn(async move {
        server
            .write_all(
                b"<stream:stream xmlns:stream='http://etherx.jabber.org/streams' \
                  xmlns='jabber:client' version='1.0' id='demo'>",
            )
            .await
            .unwrap();
        server
            .write_all(
                b"<message from='juliet@example.com/balcony'>\
                  <body>art thou not romeo?</body></message>",
            )
            .await
            .unwrap();
        let mut sink = [0u8; 4096];
        let n = server.read(&mut sink).await.unwrap();
        println!("-> {}", String::from_utf8_lossy(&sink[..n]));
    });

    let reply = Stanza::build(
        StanzaType::Message,
        StanzaSubType::Chat,
        None,
        Some("juliet@example.com/balcony"),
        &[
            BuildStep::Start("body"),
            BuildStep::Text("neither, fair saint"),
            BuildStep::End,
        ],
    )
    .unwrap();
    porter.send(reply).await.unwrap();

    peer.await.unwrap();
    // Give the dispatch loop a moment before tearing the process down.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
}
