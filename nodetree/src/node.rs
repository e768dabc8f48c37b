// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The tagged XML element tree.

use crate::ns::{self, NsQuark};

/// A single attribute on a [`Node`].
///
/// Attribute keys are unique within their `(key, ns)` pair. Attributes in
/// a namespace other than the element's are serialised with a prefix; the
/// optional `prefix_hint` pins that prefix, otherwise the writer picks one
/// from its prefix table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub key: String,
    pub value: String,
    pub ns: NsQuark,
    pub prefix_hint: Option<String>,
}

/// A tagged XML element: name, namespace, attributes, optional `xml:lang`,
/// optional text content, and ordered children.
///
/// Child order is preserved (it is significant on the wire); attribute
/// order is not, and equality ignores it.
#[derive(Debug, Clone)]
pub struct Node {
    name: String,
    ns: NsQuark,
    lang: Option<String>,
    content: Option<String>,
    attributes: Vec<Attribute>,
    children: Vec<Node>,
}

impl Node {
    /// Create a node with an explicit namespace.
    pub fn new(name: impl Into<String>, ns: NsQuark) -> Node {
        let name = name.into();
        debug_assert!(!name.is_empty(), "node names must be non-empty");
        Node {
            name,
            ns,
            lang: None,
            content: None,
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ns(&self) -> NsQuark {
        self.ns
    }

    pub fn set_ns(&mut self, ns: NsQuark) {
        self.ns = ns;
    }

    /// Whether this node is `name` in namespace `ns`.
    pub fn is(&self, name: &str, ns: NsQuark) -> bool {
        self.name == name && self.ns == ns
    }

    pub fn lang(&self) -> Option<&str> {
        self.lang.as_deref()
    }

    pub fn set_lang(&mut self, lang: impl Into<String>) {
        self.lang = Some(lang.into());
    }

    pub fn content(&self) -> Option<&str> {
        self.content.as_deref()
    }

    pub fn set_content(&mut self, content: impl Into<String>) {
        self.content = Some(content.into());
    }

    pub fn clear_content(&mut self) {
        self.content = None;
    }

    /// Append a text chunk to the content. SAX parsers deliver text in
    /// pieces; consecutive chunks concatenate.
    pub fn append_content(&mut self, chunk: &str) {
        match self.content {
            Some(ref mut content) => content.push_str(chunk),
            None => self.content = Some(chunk.to_owned()),
        }
    }

    /// Look up an attribute value, ignoring attribute namespaces.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.key == key)
            .map(|a| a.value.as_str())
    }

    /// Look up an attribute value in a specific namespace.
    pub fn attribute_ns(&self, key: &str, ns: NsQuark) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.key == key && a.ns == ns)
            .map(|a| a.value.as_str())
    }

    pub fn attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.iter()
    }

    /// Set an attribute in the null namespace, replacing any previous value
    /// under the same `(key, ns)` pair.
    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.set_attribute_full(key, value, NsQuark::NONE, None)
    }

    /// Set an attribute in a specific namespace.
    pub fn set_attribute_ns(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
        ns: NsQuark,
    ) {
        self.set_attribute_full(key, value, ns, None)
    }

    /// Set an attribute with an explicit serialisation prefix.
    pub fn set_attribute_full(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
        ns: NsQuark,
        prefix_hint: Option<String>,
    ) {
        let key = key.into();
        let value = value.into();
        if let Some(attr) = self
            .attributes
            .iter_mut()
            .find(|a| a.key == key && a.ns == ns)
        {
            attr.value = value;
            if prefix_hint.is_some() {
                attr.prefix_hint = prefix_hint;
            }
            return;
        }
        self.attributes.push(Attribute {
            key,
            value,
            ns,
            prefix_hint,
        });
    }

    /// Remove an attribute. Returns whether anything was removed.
    pub fn remove_attribute(&mut self, key: &str, ns: NsQuark) -> bool {
        let before = self.attributes.len();
        self.attributes.retain(|a| !(a.key == key && a.ns == ns));
        self.attributes.len() != before
    }

    /// Append a child node, returning a mutable reference to it.
    pub fn add_node(&mut self, child: Node) -> &mut Node {
        self.children.push(child);
        self.children.last_mut().unwrap()
    }

    /// Append a child element inheriting this node's namespace.
    pub fn add_child(&mut self, name: impl Into<String>) -> &mut Node {
        let ns = self.ns;
        self.add_node(Node::new(name, ns))
    }

    /// Append a child element with an explicit namespace.
    pub fn add_child_ns(&mut self, name: impl Into<String>, ns: NsQuark) -> &mut Node {
        self.add_node(Node::new(name, ns))
    }

    pub fn children(&self) -> impl Iterator<Item = &Node> {
        self.children.iter()
    }

    pub fn children_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.children.iter_mut()
    }

    pub fn first_child(&self) -> Option<&Node> {
        self.children.first()
    }

    /// Find the first child with the given name, in any namespace.
    pub fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Find the first child with the given name and namespace.
    pub fn child_ns(&self, name: &str, ns: NsQuark) -> Option<&Node> {
        self.children.iter().find(|c| c.is(name, ns))
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.children.iter_mut().find(|c| c.name == name)
    }

    /// Whether this node has any child in the given namespace.
    pub fn has_child_in_ns(&self, ns: NsQuark) -> bool {
        self.children.iter().any(|c| c.ns == ns)
    }

    /// Subset ("pattern") matching: does `self` carry at least everything
    /// `pattern` specifies?
    ///
    /// The names must match; the pattern's namespace matches anything when
    /// it is [`NsQuark::NONE`]; pattern content, when non-empty, must equal
    /// this node's content; every pattern attribute must be present with
    /// the same value (and namespace, when the pattern gives one); and
    /// every pattern child must be matched, unordered, by some child of
    /// this node.
    pub fn is_superset(&self, pattern: &Node) -> bool {
        if self.name != pattern.name {
            return false;
        }
        if !pattern.ns.is_none() && self.ns != pattern.ns {
            return false;
        }
        match pattern.content() {
            None | Some("") => (),
            Some(expected) => {
                if self.content() != Some(expected) {
                    return false;
                }
            }
        }
        for attr in &pattern.attributes {
            let found = if attr.ns.is_none() {
                self.attribute(&attr.key)
            } else {
                self.attribute_ns(&attr.key, attr.ns)
            };
            if found != Some(attr.value.as_str()) {
                return false;
            }
        }
        for pchild in &pattern.children {
            if !self.children.iter().any(|c| c.is_superset(pchild)) {
                return false;
            }
        }
        true
    }
}

impl PartialEq for Node {
    /// Deep equality. Attribute order is ignored; child order is not.
    fn eq(&self, other: &Node) -> bool {
        if self.name != other.name
            || self.ns != other.ns
            || self.lang != other.lang
            || self.content != other.content
            || self.attributes.len() != other.attributes.len()
            || self.children.len() != other.children.len()
        {
            return false;
        }
        for attr in &self.attributes {
            match other.attribute_ns(&attr.key, attr.ns) {
                Some(v) if v == attr.value => (),
                _ => return false,
            }
        }
        self.children == other.children
    }
}

impl Eq for Node {}

impl std::fmt::Display for Node {
    /// Serialises the node as a standalone document fragment. Meant for
    /// logs and tests; wire output goes through the writer.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut w = crate::writer::Writer::new_no_stream();
        match std::str::from_utf8(w.write_root(self)) {
            Ok(s) => f.write_str(s),
            Err(_) => Err(std::fmt::Error),
        }
    }
}
