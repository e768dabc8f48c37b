// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use crate::node::Node;

/// An owning wrapper around a root [`Node`].
///
/// Cloning a tree deep-copies the whole node structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTree {
    root: Node,
}

impl NodeTree {
    pub fn new(root: Node) -> NodeTree {
        NodeTree { root }
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut Node {
        &mut self.root
    }

    pub fn into_root(self) -> Node {
        self.root
    }
}

impl From<Node> for NodeTree {
    fn from(root: Node) -> NodeTree {
        NodeTree::new(root)
    }
}
