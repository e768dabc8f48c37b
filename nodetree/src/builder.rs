// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Flat-opcode tree construction.
//!
//! Trees are described as a flat slice of [`BuildStep`] opcodes executed by
//! a small stack machine. Mis-nested steps are diagnosed with a warning and
//! skipped; the produced tree is always structurally sound.

use std::collections::HashMap;

use crate::node::Node;
use crate::ns::NsQuark;
use crate::tree::NodeTree;

/// One opcode in a flat tree description.
#[derive(Debug, Clone)]
pub enum BuildStep<'a> {
    /// Open a child element, inheriting the current element's namespace.
    Start(&'a str),
    /// Close the current element.
    End,
    /// Set an attribute on the current element.
    Attr(&'a str, &'a str),
    /// Set the current element's text content.
    Text(&'a str),
    /// Set the current element's namespace.
    Ns(NsQuark),
    /// Record the current element into the given capture slot.
    Capture(usize),
}

/// Paths recorded by [`BuildStep::Capture`] opcodes.
///
/// A capture is a path of child indices from the root, so it stays valid
/// across moves of the finished tree.
#[derive(Debug, Default)]
pub struct Captures {
    paths: HashMap<usize, Vec<usize>>,
}

impl Captures {
    /// Resolve a capture slot against the tree it was built for.
    pub fn get<'t>(&self, tree: &'t NodeTree, slot: usize) -> Option<&'t Node> {
        let path = self.paths.get(&slot)?;
        let mut node = tree.root();
        for &idx in path {
            node = node.children().nth(idx)?;
        }
        Some(node)
    }

    /// Resolve a capture slot for mutation.
    pub fn get_mut<'t>(&self, tree: &'t mut NodeTree, slot: usize) -> Option<&'t mut Node> {
        let path = self.paths.get(&slot)?;
        let mut node = tree.root_mut();
        for &idx in path {
            node = node.children_mut().nth(idx)?;
        }
        Some(node)
    }
}

fn node_at<'t>(root: &'t mut Node, path: &[usize]) -> &'t mut Node {
    let mut node = root;
    for &idx in path {
        node = node
            .children_mut()
            .nth(idx)
            .expect("builder path points at a live node");
    }
    node
}

/// Run the opcode machine, producing a tree rooted at `name` in `ns`.
pub fn build(name: &str, ns: NsQuark, steps: &[BuildStep<'_>]) -> (NodeTree, Captures) {
    let mut root = Node::new(name, ns);
    // Path of child indices from the root to the current element.
    let mut path: Vec<usize> = Vec::new();
    let mut captures = Captures::default();

    for step in steps {
        match step {
            BuildStep::Start(child_name) => {
                let parent = node_at(&mut root, &path);
                let idx = parent.children().count();
                parent.add_child(*child_name);
                path.push(idx);
            }
            BuildStep::End => {
                if path.pop().is_none() {
                    log::warn!("unbalanced End step at tree root; ignored");
                }
            }
            BuildStep::Attr(key, value) => {
                node_at(&mut root, &path).set_attribute(*key, *value);
            }
            BuildStep::Text(text) => {
                node_at(&mut root, &path).set_content(*text);
            }
            BuildStep::Ns(q) => {
                node_at(&mut root, &path).set_ns(*q);
            }
            BuildStep::Capture(slot) => {
                if captures.paths.insert(*slot, path.clone()).is_some() {
                    log::warn!("capture slot {} recorded twice; keeping the later node", slot);
                }
            }
        }
    }

    if !path.is_empty() {
        log::warn!("{} element(s) left unclosed by build steps", path.len());
    }

    (NodeTree::new(root), captures)
}
