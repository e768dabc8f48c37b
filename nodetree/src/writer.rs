// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Tree-to-bytes serialisation and stream framing.
//!
//! The writer owns a contiguous byte buffer; every `write_*` call replaces
//! its contents, so the returned slice is only valid until the next call
//! on the same writer.

use std::collections::{HashMap, HashSet};

use crate::error::Error;
use crate::node::Node;
use crate::ns::{self, NsQuark};
use crate::tree::NodeTree;

const STREAM_OPEN_PREAMBLE: &str = "<?xml version='1.0' encoding='UTF-8'?>\n\
    <stream:stream xmlns='jabber:client' \
    xmlns:stream='http://etherx.jabber.org/streams'";
const STREAM_CLOSE: &str = "</stream:stream>\n";

/// Maps attribute namespaces to serialisation prefixes.
///
/// Each writer owns its table, seeded from a read-only default map of
/// well-known prefixes. Unknown namespaces get a generated prefix derived
/// from their quark the first time they are emitted; the assignment then
/// sticks for the lifetime of the writer.
#[derive(Debug, Clone)]
pub struct PrefixTable {
    map: HashMap<NsQuark, String>,
    emitted: HashSet<NsQuark>,
}

impl PrefixTable {
    fn new() -> PrefixTable {
        let mut map = HashMap::new();
        map.insert(ns::GOOGLE_AUTH, "ga".to_owned());
        PrefixTable {
            map,
            emitted: HashSet::new(),
        }
    }

    /// Override the prefix for a namespace. Only allowed before that
    /// namespace has first been emitted by this writer.
    pub fn set_prefix(&mut self, q: NsQuark, prefix: impl Into<String>) -> bool {
        if self.emitted.contains(&q) {
            log::warn!(
                "prefix for namespace {} overridden after first use; ignored",
                ns::uri(q)
            );
            return false;
        }
        self.map.insert(q, prefix.into());
        true
    }

    fn prefix_for(&mut self, q: NsQuark) -> &str {
        self.emitted.insert(q);
        self.map
            .entry(q)
            .or_insert_with(|| format!("nodetree-{}", base26(q.index())))
    }
}

/// Lowercase base-26 rendering of a quark index.
fn base26(mut n: u32) -> String {
    let mut out = String::new();
    loop {
        out.insert(0, (b'a' + (n % 26) as u8) as char);
        n /= 26;
        if n == 0 {
            break;
        }
    }
    out
}

fn escape_into(buf: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            '&' => buf.push_str("&amp;"),
            '<' => buf.push_str("&lt;"),
            '>' => buf.push_str("&gt;"),
            '\'' => buf.push_str("&apos;"),
            '"' => buf.push_str("&quot;"),
            c => buf.push(c),
        }
    }
}

/// The serialiser.
pub struct Writer {
    buf: String,
    streaming: bool,
    prefixes: PrefixTable,
}

impl Writer {
    /// Create a streaming-mode writer (default namespace `jabber:client`,
    /// stream framing available).
    pub fn new() -> Writer {
        Writer::with_mode(true)
    }

    /// Create a writer for standalone documents.
    pub fn new_no_stream() -> Writer {
        Writer::with_mode(false)
    }

    fn with_mode(streaming: bool) -> Writer {
        Writer {
            buf: String::new(),
            streaming,
            prefixes: PrefixTable::new(),
        }
    }

    /// The attribute-namespace prefix table of this writer.
    pub fn prefixes_mut(&mut self) -> &mut PrefixTable {
        &mut self.prefixes
    }

    /// Emit the XML declaration and the unclosed stream open tag.
    ///
    /// Only legal in streaming mode.
    pub fn stream_open(
        &mut self,
        to: Option<&str>,
        from: Option<&str>,
        version: Option<&str>,
        lang: Option<&str>,
        id: Option<&str>,
    ) -> Result<&[u8], Error> {
        if !self.streaming {
            return Err(Error::WrongWriterMode);
        }
        self.buf.clear();
        self.buf.push_str(STREAM_OPEN_PREAMBLE);
        for (key, value) in [
            ("to", to),
            ("from", from),
            ("version", version),
            ("xml:lang", lang),
            ("id", id),
        ] {
            if let Some(value) = value {
                self.buf.push(' ');
                self.buf.push_str(key);
                self.buf.push_str("='");
                escape_into(&mut self.buf, value);
                self.buf.push('\'');
            }
        }
        self.buf.push('>');
        Ok(self.buf.as_bytes())
    }

    /// Emit the stream close tag.
    pub fn stream_close(&mut self) -> &[u8] {
        self.buf.clear();
        self.buf.push_str(STREAM_CLOSE);
        self.buf.as_bytes()
    }

    /// Serialise a whole tree.
    pub fn write_node_tree(&mut self, tree: &NodeTree) -> &[u8] {
        self.write_root(tree.root())
    }

    /// Serialise a tree given its root node.
    pub fn write_root(&mut self, root: &Node) -> &[u8] {
        self.buf.clear();
        let containing_ns = if self.streaming {
            ns::CLIENT
        } else {
            NsQuark::NONE
        };
        self.serialize_node(root, containing_ns);
        self.buf.as_bytes()
    }

    /// Discard the internal buffer.
    pub fn flush(&mut self) {
        self.buf.clear();
    }

    fn serialize_node(&mut self, node: &Node, parent_ns: NsQuark) {
        let stream_prefixed = self.streaming && node.ns() == ns::STREAM;

        self.buf.push('<');
        if stream_prefixed {
            self.buf.push_str("stream:");
        }
        self.buf.push_str(node.name());

        // The containing namespace declaration is omitted when it is
        // already in force from the parent (or the stream default).
        if !stream_prefixed && !node.ns().is_none() && node.ns() != parent_ns {
            self.buf.push_str(" xmlns='");
            escape_into(&mut self.buf, ns::uri(node.ns()));
            self.buf.push('\'');
        }

        if let Some(lang) = node.lang() {
            self.buf.push_str(" xml:lang='");
            escape_into(&mut self.buf, lang);
            self.buf.push('\'');
        }

        // Namespaced attributes need a prefix; prefixes other than xml:
        // are declared on the element that first uses them.
        let mut declared: Vec<NsQuark> = Vec::new();
        for attr in node.attributes() {
            self.buf.push(' ');
            if attr.ns.is_none() {
                self.buf.push_str(&attr.key);
            } else if attr.ns == ns::XML {
                self.buf.push_str("xml:");
                self.buf.push_str(&attr.key);
            } else {
                let prefix = match attr.prefix_hint {
                    Some(ref hint) => hint.clone(),
                    None => self.prefixes.prefix_for(attr.ns).to_owned(),
                };
                if !declared.contains(&attr.ns) {
                    self.buf.push_str("xmlns:");
                    self.buf.push_str(&prefix);
                    self.buf.push_str("='");
                    escape_into(&mut self.buf, ns::uri(attr.ns));
                    self.buf.push_str("' ");
                    declared.push(attr.ns);
                }
                self.buf.push_str(&prefix);
                self.buf.push(':');
                self.buf.push_str(&attr.key);
            }
            self.buf.push_str("='");
            escape_into(&mut self.buf, &attr.value);
            self.buf.push('\'');
        }

        let has_body = node.content().is_some() || node.children().next().is_some();
        if !has_body {
            self.buf.push_str("/>");
            return;
        }

        self.buf.push('>');
        if let Some(content) = node.content() {
            escape_into(&mut self.buf, content);
        }
        for child in node.children() {
            self.serialize_node(child, node.ns());
        }
        self.buf.push_str("</");
        if stream_prefixed {
            self.buf.push_str("stream:");
        }
        self.buf.push_str(node.name());
        self.buf.push('>');
    }
}

impl Default for Writer {
    fn default() -> Writer {
        Writer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::Reader;

    fn as_str(bytes: &[u8]) -> &str {
        std::str::from_utf8(bytes).unwrap()
    }

    #[test]
    fn stream_open_bytes() {
        let mut w = Writer::new();
        let bytes = w
            .stream_open(Some("example.com"), None, Some("1.0"), None, None)
            .unwrap();
        assert_eq!(
            as_str(bytes),
            "<?xml version='1.0' encoding='UTF-8'?>\n\
             <stream:stream xmlns='jabber:client' \
             xmlns:stream='http://etherx.jabber.org/streams' \
             to='example.com' version='1.0'>"
        );
    }

    #[test]
    fn stream_open_is_streaming_only() {
        let mut w = Writer::new_no_stream();
        assert!(matches!(
            w.stream_open(None, None, None, None, None),
            Err(Error::WrongWriterMode)
        ));
    }

    #[test]
    fn stream_close_bytes() {
        let mut w = Writer::new();
        assert_eq!(as_str(w.stream_close()), "</stream:stream>\n");
    }

    #[test]
    fn default_namespace_is_omitted() {
        let mut w = Writer::new();
        let mut node = Node::new("message", ns::CLIENT);
        node.set_attribute("type", "chat");
        node.add_child("body").set_content("hi");
        assert_eq!(
            as_str(w.write_root(&node)),
            "<message type='chat'><body>hi</body></message>"
        );
    }

    #[test]
    fn foreign_child_declares_its_namespace() {
        let mut w = Writer::new();
        let mut node = Node::new("message", ns::CLIENT);
        node.add_child_ns("x", ns::DATA_FORMS);
        assert_eq!(
            as_str(w.write_root(&node)),
            "<message><x xmlns='jabber:x:data'/></message>"
        );
    }

    #[test]
    fn same_namespace_child_stays_undeclared() {
        let mut w = Writer::new();
        let mut node = Node::new("iq", ns::CLIENT);
        let q = node.add_child_ns("query", ns::DISCO_INFO);
        q.add_child("feature").set_attribute("var", "urn:a");
        assert_eq!(
            as_str(w.write_root(&node)),
            "<iq><query xmlns='http://jabber.org/protocol/disco#info'>\
             <feature var='urn:a'/></query></iq>"
        );
    }

    #[test]
    fn stream_namespace_children_are_prefixed() {
        let mut w = Writer::new();
        let node = Node::new("features", ns::STREAM);
        assert_eq!(as_str(w.write_root(&node)), "<stream:features/>");
    }

    #[test]
    fn non_streaming_root_declares_namespace() {
        let mut w = Writer::new_no_stream();
        let node = Node::new("query", ns::DISCO_INFO);
        assert_eq!(
            as_str(w.write_root(&node)),
            "<query xmlns='http://jabber.org/protocol/disco#info'/>"
        );
    }

    #[test]
    fn known_attribute_prefixes_from_default_table() {
        let mut w = Writer::new();
        let mut node = Node::new("iq", ns::CLIENT);
        node.set_attribute_ns("client-uses-full-bind-result", "true", ns::GOOGLE_AUTH);
        assert_eq!(
            as_str(w.write_root(&node)),
            "<iq xmlns:ga='http://www.google.com/talk/protocol/auth' \
             ga:client-uses-full-bind-result='true'/>"
        );
    }

    #[test]
    fn unknown_attribute_namespaces_get_generated_prefixes() {
        let mut w = Writer::new();
        let q = ns::quark("urn:example:attr-ns");
        let mut node = Node::new("iq", ns::CLIENT);
        node.set_attribute_ns("marker", "1", q);
        let out = as_str(w.write_root(&node)).to_owned();
        let expected_prefix = format!("nodetree-{}", base26(q.index()));
        assert!(out.contains(&format!("xmlns:{}='urn:example:attr-ns'", expected_prefix)));
        assert!(out.contains(&format!("{}:marker='1'", expected_prefix)));

        // The assignment is stable for the writer's lifetime.
        let mut other = Node::new("iq", ns::CLIENT);
        other.set_attribute_ns("marker", "2", q);
        let out2 = as_str(w.write_root(&other)).to_owned();
        assert!(out2.contains(&format!("{}:marker='2'", expected_prefix)));
    }

    #[test]
    fn prefix_override_before_first_use() {
        let q = ns::quark("urn:example:override");
        let mut w = Writer::new();
        assert!(w.prefixes_mut().set_prefix(q, "ov"));
        let mut node = Node::new("iq", ns::CLIENT);
        node.set_attribute_ns("a", "b", q);
        let out = as_str(w.write_root(&node)).to_owned();
        assert!(out.contains("xmlns:ov='urn:example:override' ov:a='b'"));
        // After first use the mapping is frozen.
        assert!(!w.prefixes_mut().set_prefix(q, "late"));
    }

    #[test]
    fn text_and_attributes_are_escaped() {
        let mut w = Writer::new();
        let mut node = Node::new("message", ns::CLIENT);
        node.set_attribute("label", "a<b&'c\"");
        node.add_child("body").set_content("1 < 2 & 3 > 2");
        assert_eq!(
            as_str(w.write_root(&node)),
            "<message label='a&lt;b&amp;&apos;c&quot;'>\
             <body>1 &lt; 2 &amp; 3 &gt; 2</body></message>"
        );
    }

    #[test]
    fn buffer_is_replaced_by_next_write() {
        let mut w = Writer::new();
        let a = Node::new("presence", ns::CLIENT);
        let first = as_str(w.write_root(&a)).to_owned();
        let b = Node::new("message", ns::CLIENT);
        let second = as_str(w.write_root(&b)).to_owned();
        assert_eq!(first, "<presence/>");
        assert_eq!(second, "<message/>");
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut node = Node::new("message", ns::CLIENT);
        node.set_attribute("type", "chat");
        node.set_attribute("to", "juliet@example.com");
        node.set_lang("en");
        node.add_child("body").set_content("esc&ped <text>");
        let mut x = Node::new("x", ns::DATA_FORMS);
        x.set_attribute("type", "submit");
        x.add_child("field").set_attribute("var", "FORM_TYPE");
        node.add_node(x);
        let tree = NodeTree::new(node);

        let mut w = Writer::new();
        let mut r = Reader::new();
        r.push(
            b"<stream:stream xmlns:stream='http://etherx.jabber.org/streams' \
              xmlns='jabber:client' version='1.0'>",
        );
        let bytes = w.write_node_tree(&tree).to_owned();
        r.push(&bytes);
        let parsed = r.pop_stanza().expect("stanza parses back");
        assert_eq!(parsed, tree);
    }
}
