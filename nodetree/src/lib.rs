// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! A small tagged-tree XML DOM on top of `rxml`, targeting the subset of
//! XML useful for XMPP streams.
//!
//! The crate provides four pieces:
//!
//! - [`Node`] / [`NodeTree`]: an owned element tree with interned
//!   namespaces ([`ns::NsQuark`]), ordered children, and subset matching
//!   for handler patterns.
//! - [`builder`]: flat-opcode construction of trees.
//! - [`Reader`]: an incremental, never-blocking push parser that turns a
//!   byte stream into a queue of stanza trees and tracks stream framing.
//! - [`Writer`]: tree-to-bytes serialisation with minimal namespace
//!   declarations, attribute-prefix management and byte-exact stream
//!   open/close framing.

#![forbid(unsafe_code)]

pub mod builder;
mod error;
mod node;
pub mod ns;
mod reader;
mod tree;
mod writer;

pub use crate::builder::{build, BuildStep, Captures};
pub use crate::error::{Error, Result};
pub use crate::node::{Attribute, Node};
pub use crate::ns::NsQuark;
pub use crate::reader::{parse_document, Reader, ReaderState, StreamAttributes};
pub use crate::tree::NodeTree;
pub use crate::writer::{PrefixTable, Writer};
