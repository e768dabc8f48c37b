// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Contact interning.
//!
//! Contacts are shared objects keyed by JID; interning the same address
//! twice yields the same `Arc`. The factory holds weak references, so
//! contacts nobody uses anymore are re-created on demand rather than
//! leaked.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use jid::{BareJid, FullJid};

/// A peer known by bare JID.
#[derive(Debug, PartialEq, Eq)]
pub struct BareContact {
    jid: BareJid,
}

impl BareContact {
    pub fn jid(&self) -> &BareJid {
        &self.jid
    }
}

impl fmt::Display for BareContact {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.jid)
    }
}

/// A peer known by full JID (one online resource).
#[derive(Debug, PartialEq, Eq)]
pub struct ResourceContact {
    jid: FullJid,
}

impl ResourceContact {
    pub fn jid(&self) -> &FullJid {
        &self.jid
    }

    pub fn bare_jid(&self) -> BareJid {
        self.jid.to_bare()
    }
}

impl fmt::Display for ResourceContact {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.jid)
    }
}

#[derive(Default)]
struct FactoryInner {
    bare: HashMap<BareJid, Weak<BareContact>>,
    resource: HashMap<FullJid, Weak<ResourceContact>>,
}

/// Interns JIDs to shared contact objects.
#[derive(Default)]
pub struct ContactFactory {
    inner: Mutex<FactoryInner>,
}

impl ContactFactory {
    pub fn new() -> ContactFactory {
        ContactFactory::default()
    }

    /// Get or create the contact for a bare JID.
    pub fn ensure_bare(&self, jid: BareJid) -> Arc<BareContact> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.bare.get(&jid).and_then(Weak::upgrade) {
            return existing;
        }
        let contact = Arc::new(BareContact { jid: jid.clone() });
        inner.bare.insert(jid, Arc::downgrade(&contact));
        contact
    }

    /// The contact for a bare JID, if it is currently interned.
    pub fn lookup_bare(&self, jid: &BareJid) -> Option<Arc<BareContact>> {
        self.inner
            .lock()
            .unwrap()
            .bare
            .get(jid)
            .and_then(Weak::upgrade)
    }

    /// Get or create the contact for a full JID.
    pub fn ensure_resource(&self, jid: FullJid) -> Arc<ResourceContact> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.resource.get(&jid).and_then(Weak::upgrade) {
            return existing;
        }
        let contact = Arc::new(ResourceContact { jid: jid.clone() });
        inner.resource.insert(jid, Arc::downgrade(&contact));
        contact
    }

    pub fn lookup_resource(&self, jid: &FullJid) -> Option<Arc<ResourceContact>> {
        self.inner
            .lock()
            .unwrap()
            .resource
            .get(jid)
            .and_then(Weak::upgrade)
    }

    /// Drop map entries whose contacts are gone.
    pub fn prune(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.bare.retain(|_, weak| weak.strong_count() > 0);
        inner.resource.retain(|_, weak| weak.strong_count() > 0);
    }
}
