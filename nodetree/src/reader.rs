// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Incremental SAX-style stream reader.
//!
//! The reader consumes byte chunks via [`Reader::push`] and completes whole
//! element trees into an output queue drained with [`Reader::pop_stanza`].
//! It never blocks; partial input (including split UTF-8 sequences) stays
//! buffered inside the underlying parser until more bytes arrive.
//!
//! In streaming mode the parser sees one endless document whose root is
//! the `<stream:stream>` open tag; every depth-1 child is a stanza. In
//! non-streaming mode the first top-level element is the whole document.

use std::collections::VecDeque;
use std::io;

use bytes::BytesMut;
use rxml::Parse;

use crate::error::Error;
use crate::node::Node;
use crate::ns::{self, NsQuark};
use crate::tree::NodeTree;

/// Reader lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    /// No stream open tag seen yet.
    Initial,
    /// The stream is open; stanzas may complete.
    Opened,
    /// The stream was closed by footer or EOF, or (non-streaming) the
    /// document completed.
    Closed,
    /// A fatal parse error occurred; see [`Reader::error`].
    Error,
}

/// Attributes extracted from the `<stream:stream>` open tag.
#[derive(Debug, Clone, Default)]
pub struct StreamAttributes {
    pub to: Option<String>,
    pub from: Option<String>,
    pub version: Option<String>,
    pub lang: Option<String>,
    pub id: Option<String>,
}

/// The incremental reader.
pub struct Reader {
    parser: rxml::Parser,
    /// Unparsed input; the parser consumes from the front.
    buf: BytesMut,
    streaming: bool,
    state: ReaderState,
    stream_attrs: StreamAttributes,
    /// Open elements of the stanza currently being parsed, root first.
    stack: Vec<Node>,
    out: VecDeque<NodeTree>,
    error: Option<Error>,
}

fn ns_to_quark(ns: &rxml::Namespace) -> NsQuark {
    if ns.is_none() {
        NsQuark::NONE
    } else {
        ns::quark(ns.as_str())
    }
}

/// Does this rxml error just mean "feed me more bytes"?
fn is_starved(e: &rxml::error::EndOrError) -> bool {
    matches!(e, rxml::error::EndOrError::NeedMoreData)
}

impl Reader {
    /// Create a streaming-mode reader.
    pub fn new() -> Reader {
        Reader::with_mode(true)
    }

    /// Create a non-streaming reader: the first complete top-level element
    /// is the document.
    pub fn new_no_stream() -> Reader {
        Reader::with_mode(false)
    }

    fn with_mode(streaming: bool) -> Reader {
        Reader {
            parser: rxml::Parser::default(),
            buf: BytesMut::new(),
            streaming,
            state: ReaderState::Initial,
            stream_attrs: StreamAttributes::default(),
            stack: Vec::new(),
            out: VecDeque::new(),
            error: None,
        }
    }

    pub fn state(&self) -> ReaderState {
        self.state
    }

    /// The parse error, if `state() == Error`.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Attributes of the stream open tag; empty until `Opened`.
    pub fn stream_attributes(&self) -> &StreamAttributes {
        &self.stream_attrs
    }

    /// Feed bytes. Completed stanzas become available via
    /// [`Reader::pop_stanza`]; errors via [`Reader::state`] /
    /// [`Reader::error`].
    pub fn push(&mut self, data: &[u8]) {
        if matches!(self.state, ReaderState::Error) {
            return;
        }
        self.buf.extend_from_slice(data);
        self.pump();
    }

    /// Signal end of input.
    ///
    /// Whatever buffered input still parses is processed; a partial
    /// document at the end is discarded and the reader closes, matching
    /// an abruptly terminated transport.
    pub fn push_eof(&mut self) {
        if matches!(self.state, ReaderState::Error) {
            return;
        }
        self.pump();
        if matches!(self.state, ReaderState::Initial | ReaderState::Opened) {
            self.state = ReaderState::Closed;
        }
    }

    /// Remove and return the next completed stanza tree.
    pub fn pop_stanza(&mut self) -> Option<NodeTree> {
        self.out.pop_front()
    }

    /// Non-destructive look at the next completed stanza tree.
    pub fn peek_stanza(&self) -> Option<&NodeTree> {
        self.out.front()
    }

    /// Reinitialise the parser, discarding any partial document, pending
    /// input and the extracted stream attributes. Already-completed
    /// stanzas stay available.
    pub fn reset(&mut self) {
        self.parser = rxml::Parser::default();
        self.buf.clear();
        self.state = ReaderState::Initial;
        self.stream_attrs = StreamAttributes::default();
        self.stack.clear();
        self.error = None;
    }

    fn fail(&mut self, error: Error) {
        log::debug!("stream reader failed: {}", error);
        self.state = ReaderState::Error;
        self.error = Some(error);
        self.stack.clear();
    }

    fn pump(&mut self) {
        loop {
            if matches!(self.state, ReaderState::Error | ReaderState::Closed) {
                return;
            }
            // `false`: the parser is never told about EOF; element
            // completion is tracked by depth, and transport EOF is
            // handled in push_eof.
            match self.parser.parse_buf(&mut self.buf, false) {
                Ok(Some(ev)) => {
                    if let Err(e) = self.process(ev) {
                        self.fail(e);
                        return;
                    }
                }
                // Needs more input.
                Ok(None) => return,
                Err(e) if is_starved(&e) => return,
                Err(rxml::error::EndOrError::Error(e)) => {
                    self.fail(e.into());
                    return;
                }
                Err(rxml::error::EndOrError::NeedMoreData) => unreachable!(),
            }
        }
    }

    fn process(&mut self, ev: rxml::Event) -> Result<(), Error> {
        match ev {
            rxml::Event::XmlDeclaration(_, _) => Ok(()),

            rxml::Event::StartElement(_, (elem_ns, name), attrs) => {
                let quark = ns_to_quark(&elem_ns);
                let local: &str = &name;

                if self.streaming && matches!(self.state, ReaderState::Initial) {
                    if quark != ns::STREAM || local != "stream" {
                        return Err(Error::InvalidStreamStart);
                    }
                    self.open_stream(attrs);
                    return Ok(());
                }

                let mut node = Node::new(local, quark);
                for ((attr_ns, attr_name), value) in attrs.into_iter() {
                    let attr_local: &str = &attr_name;
                    let attr_quark = ns_to_quark(&attr_ns);
                    if attr_quark == ns::XML {
                        if attr_local == "lang" {
                            node.set_lang(value);
                        } else {
                            node.set_attribute_ns(attr_local, value, ns::XML);
                        }
                    } else {
                        node.set_attribute_ns(attr_local, value, attr_quark);
                    }
                }
                // Non-streaming documents start with any root element.
                if matches!(self.state, ReaderState::Initial) {
                    self.state = ReaderState::Opened;
                }
                self.stack.push(node);
                Ok(())
            }

            rxml::Event::Text(_, text) => {
                match self.stack.last_mut() {
                    Some(node) => node.append_content(text.as_str()),
                    None => {
                        // Whitespace keepalives are fine between stanzas;
                        // anything else is not.
                        if !text.as_str().chars().all(char::is_whitespace) {
                            return Err(Error::TextAtStreamLevel);
                        }
                    }
                }
                Ok(())
            }

            rxml::Event::EndElement(_) => {
                match self.stack.pop() {
                    Some(mut node) => {
                        if let Some(content) = node.content() {
                            if content.chars().all(char::is_whitespace) {
                                node.clear_content();
                            }
                        }
                        match self.stack.last_mut() {
                            Some(parent) => {
                                parent.add_node(node);
                            }
                            None => {
                                // A whole stanza (or the non-streaming
                                // document) completed.
                                self.out.push_back(NodeTree::new(node));
                                if !self.streaming {
                                    self.state = ReaderState::Closed;
                                }
                            }
                        }
                    }
                    None => {
                        // Stream footer.
                        self.state = ReaderState::Closed;
                    }
                }
                Ok(())
            }
        }
    }

    fn open_stream(&mut self, attrs: rxml::AttrMap) {
        for ((attr_ns, attr_name), value) in attrs.into_iter() {
            let local: &str = &attr_name;
            let quark = ns_to_quark(&attr_ns);
            match (quark, local) {
                (NsQuark::NONE, "to") => self.stream_attrs.to = Some(value),
                (NsQuark::NONE, "from") => self.stream_attrs.from = Some(value),
                (NsQuark::NONE, "version") => self.stream_attrs.version = Some(value),
                (NsQuark::NONE, "id") => self.stream_attrs.id = Some(value),
                (q, "lang") if q == ns::XML => self.stream_attrs.lang = Some(value),
                _ => {
                    log::debug!("ignoring unknown stream header attribute {}", local);
                }
            }
        }
        self.state = ReaderState::Opened;
    }
}

impl Default for Reader {
    fn default() -> Reader {
        Reader::new()
    }
}

/// Parse one self-contained XML document into a tree.
pub fn parse_document(data: &[u8]) -> Result<NodeTree, Error> {
    let mut reader = Reader::new_no_stream();
    reader.push(data);
    reader.push_eof();
    if let ReaderState::Error = reader.state() {
        // The stored error is moved out by value here; the reader is
        // discarded anyway.
        return Err(reader.error.take().expect("error state without error"));
    }
    reader
        .pop_stanza()
        .ok_or_else(|| Error::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "empty document")))
}
