// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The framed XML connection handed to a porter.
//!
//! The connector collaborator authenticates and secures a transport and
//! hands it over here; this module pairs the raw byte stream with an
//! incremental [`Reader`] and a [`Writer`] and exposes stanza-sized
//! receive/transmit halves to the porter worker.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadHalf, WriteHalf};

use nodetree::{Node, NodeTree, Reader, Writer};

use crate::error::Error;

/// Transports the porter can drive.
pub trait AsyncReadAndWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncReadAndWrite for T {}

/// Boxed transport type used throughout the porter.
pub type BoxTransport = Box<dyn AsyncReadAndWrite + 'static>;

/// Stream-management facts published by the connector on the connection.
#[derive(Debug, Clone, Default)]
pub struct SmMarker {
    /// XEP-0198 was negotiated on this stream.
    pub enabled: bool,
    /// The stream can be resumed after a disconnect.
    pub resumable: bool,
    /// XEP-0198 stream id (from `<enabled/>`).
    pub id: Option<String>,
    /// Preferred resumption location, if the peer named one.
    pub location: Option<String>,
    /// Resumption timeout in seconds, if the peer named one.
    pub timeout: Option<u32>,
}

/// An authenticated, opened XML stream.
pub struct XmppConnection {
    transport: BoxTransport,
    sm: SmMarker,
}

impl XmppConnection {
    pub fn new(transport: BoxTransport) -> XmppConnection {
        XmppConnection {
            transport,
            sm: SmMarker::default(),
        }
    }

    /// Attach the stream-management marker negotiated by the connector.
    pub fn with_stream_management(mut self, sm: SmMarker) -> XmppConnection {
        self.sm = sm;
        self
    }

    pub fn sm_marker(&self) -> &SmMarker {
        &self.sm
    }

    pub(crate) fn split(self) -> (ReceiveHalf, TransmitHalf, SmMarker) {
        let (rd, wr) = tokio::io::split(self.transport);
        (
            ReceiveHalf {
                io: rd,
                reader: Reader::new(),
            },
            TransmitHalf {
                io: wr,
                writer: Writer::new(),
            },
            self.sm,
        )
    }
}

/// Receiving side: transport bytes through the incremental reader.
pub(crate) struct ReceiveHalf {
    io: ReadHalf<BoxTransport>,
    reader: Reader,
}

impl ReceiveHalf {
    /// Receive the next complete stanza tree.
    ///
    /// `Ok(None)` means the remote side closed the stream (footer or EOF).
    /// Cancellation-safe: dropping the future loses no input.
    pub(crate) async fn recv(&mut self) -> Result<Option<NodeTree>, Error> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(tree) = self.reader.pop_stanza() {
                return Ok(Some(tree));
            }
            match self.reader.state() {
                nodetree::ReaderState::Closed => return Ok(None),
                nodetree::ReaderState::Error => {
                    let err = self
                        .reader
                        .error()
                        .map(|e| match e {
                            nodetree::Error::InvalidStreamStart => Error::InvalidStreamStart,
                            other => Error::Parse(other.to_string()),
                        })
                        .unwrap_or_else(|| Error::Parse("unknown parse error".to_owned()));
                    return Err(err);
                }
                _ => (),
            }
            let n = self.io.read(&mut chunk).await?;
            if n == 0 {
                self.reader.push_eof();
            } else {
                self.reader.push(&chunk[..n]);
            }
        }
    }

    /// Attributes of the peer's stream open tag, once seen.
    pub(crate) fn stream_attributes(&self) -> &nodetree::StreamAttributes {
        self.reader.stream_attributes()
    }
}

/// Transmitting side: the writer plus the raw write half.
pub(crate) struct TransmitHalf {
    pub(crate) io: WriteHalf<BoxTransport>,
    writer: Writer,
}

impl TransmitHalf {
    /// Serialise a tree root to bytes.
    pub(crate) fn encode_root(&mut self, root: &Node) -> Vec<u8> {
        self.writer.write_root(root).to_vec()
    }

    /// The literal stream close bytes.
    pub(crate) fn encode_stream_close(&mut self) -> Vec<u8> {
        self.writer.stream_close().to_vec()
    }

    /// Shut down the write direction of the transport.
    pub(crate) async fn shutdown(&mut self) -> io::Result<()> {
        use tokio::io::AsyncWriteExt;
        self.io.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPEN: &[u8] = b"<stream:stream \
        xmlns:stream='http://etherx.jabber.org/streams' \
        xmlns='jabber:client' version='1.0' id='s1'>";

    #[tokio::test]
    async fn recv_yields_stanzas_then_close() {
        use tokio::io::AsyncWriteExt;

        let (client, mut server) = tokio::io::duplex(4096);
        let conn = XmppConnection::new(Box::new(client));
        let (mut rx, _tx, _) = conn.split();

        server.write_all(OPEN).await.unwrap();
        server.write_all(b"<presence/>").await.unwrap();

        let tree = rx.recv().await.unwrap().unwrap();
        assert_eq!(tree.root().name(), "presence");
        assert_eq!(rx.stream_attributes().id.as_deref(), Some("s1"));

        server.write_all(b"</stream:stream>").await.unwrap();
        assert!(rx.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recv_reports_eof_as_close() {
        use tokio::io::AsyncWriteExt;

        let (client, mut server) = tokio::io::duplex(4096);
        let conn = XmppConnection::new(Box::new(client));
        let (mut rx, _tx, _) = conn.split();

        server.write_all(OPEN).await.unwrap();
        drop(server);
        assert!(rx.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recv_surfaces_parse_errors() {
        use tokio::io::AsyncWriteExt;

        let (client, mut server) = tokio::io::duplex(4096);
        let conn = XmppConnection::new(Box::new(client));
        let (mut rx, _tx, _) = conn.split();

        server.write_all(b"<bogus-stream/>").await.unwrap();
        match rx.recv().await {
            Err(Error::InvalidStreamStart) => (),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }
}
