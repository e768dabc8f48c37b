// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Namespace interning.
//!
//! Namespace URIs are interned into small integer quarks so that nodes and
//! pattern matching can compare namespaces without string comparisons. The
//! table is process-wide and append-only; interned URIs live for the whole
//! process.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

/// An interned namespace URI.
///
/// [`NsQuark::NONE`] is the reserved "no namespace" value; in pattern
/// matching it acts as a wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NsQuark(u32);

impl NsQuark {
    /// The reserved "no namespace" quark.
    pub const NONE: NsQuark = NsQuark(0);

    /// Whether this is the reserved "no namespace" quark.
    pub fn is_none(self) -> bool {
        self == Self::NONE
    }

    pub(crate) fn index(self) -> u32 {
        self.0
    }
}

/// `jabber:client`, the default namespace of a C2S stream.
pub const CLIENT: NsQuark = NsQuark(1);
/// `http://etherx.jabber.org/streams`, the stream framing namespace.
pub const STREAM: NsQuark = NsQuark(2);
/// `urn:ietf:params:xml:ns:xmpp-stanzas`, stanza error conditions.
pub const STANZAS: NsQuark = NsQuark(3);
/// `urn:ietf:params:xml:ns:xmpp-streams`, stream error conditions.
pub const STREAMS: NsQuark = NsQuark(4);
/// `urn:xmpp:sm:3`, XEP-0198 stream management.
pub const SM: NsQuark = NsQuark(5);
/// `urn:ietf:params:xml:ns:xmpp-sasl`.
pub const SASL: NsQuark = NsQuark(6);
/// `http://www.w3.org/XML/1998/namespace`, the `xml:` namespace.
pub const XML: NsQuark = NsQuark(7);
/// `http://jabber.org/protocol/pubsub#event`.
pub const PUBSUB_EVENT: NsQuark = NsQuark(8);
/// `http://jabber.org/protocol/disco#info`.
pub const DISCO_INFO: NsQuark = NsQuark(9);
/// `jabber:x:data`, XEP-0004 data forms.
pub const DATA_FORMS: NsQuark = NsQuark(10);
/// `http://jabber.org/protocol/caps`, XEP-0115 entity capabilities.
pub const CAPS: NsQuark = NsQuark(11);
/// `http://www.google.com/talk/protocol/auth`.
pub const GOOGLE_AUTH: NsQuark = NsQuark(12);

/// Seed URIs, in quark order. Index 0 is the reserved empty namespace.
const SEED: &[&str] = &[
    "",
    "jabber:client",
    "http://etherx.jabber.org/streams",
    "urn:ietf:params:xml:ns:xmpp-stanzas",
    "urn:ietf:params:xml:ns:xmpp-streams",
    "urn:xmpp:sm:3",
    "urn:ietf:params:xml:ns:xmpp-sasl",
    "http://www.w3.org/XML/1998/namespace",
    "http://jabber.org/protocol/pubsub#event",
    "http://jabber.org/protocol/disco#info",
    "jabber:x:data",
    "http://jabber.org/protocol/caps",
    "http://www.google.com/talk/protocol/auth",
];

struct QuarkTable {
    uris: Vec<&'static str>,
    by_uri: HashMap<&'static str, u32>,
}

fn table() -> &'static RwLock<QuarkTable> {
    static TABLE: OnceLock<RwLock<QuarkTable>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut uris = Vec::with_capacity(SEED.len());
        let mut by_uri = HashMap::with_capacity(SEED.len());
        for (i, uri) in SEED.iter().enumerate() {
            uris.push(*uri);
            by_uri.insert(*uri, i as u32);
        }
        RwLock::new(QuarkTable { uris, by_uri })
    })
}

/// Intern a namespace URI, returning its quark.
///
/// The empty string interns to [`NsQuark::NONE`].
pub fn quark(uri: &str) -> NsQuark {
    {
        let table = table().read().unwrap();
        if let Some(&idx) = table.by_uri.get(uri) {
            return NsQuark(idx);
        }
    }
    let mut table = table().write().unwrap();
    // Racing interners may have beaten us to the write lock.
    if let Some(&idx) = table.by_uri.get(uri) {
        return NsQuark(idx);
    }
    let leaked: &'static str = Box::leak(uri.to_owned().into_boxed_str());
    let idx = table.uris.len() as u32;
    table.uris.push(leaked);
    table.by_uri.insert(leaked, idx);
    NsQuark(idx)
}

/// Resolve a quark back to its URI.
///
/// Returns the empty string for [`NsQuark::NONE`].
pub fn uri(q: NsQuark) -> &'static str {
    let table = table().read().unwrap();
    table
        .uris
        .get(q.index() as usize)
        .copied()
        .unwrap_or_default()
}
