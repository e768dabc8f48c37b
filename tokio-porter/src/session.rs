// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Session glue: one porter plus one contact factory.

use std::sync::Arc;

use jid::Jid;

use crate::connection::XmppConnection;
use crate::contact::ContactFactory;
use crate::porter::{Porter, PorterConfig};

/// Wires a connection to a porter and a contact factory.
///
/// The session is the object feature modules hang off: they register
/// handlers on the porter and intern peers through the factory.
pub struct Session {
    porter: Porter,
    contacts: Arc<ContactFactory>,
}

impl Session {
    /// Build a session over an established connection, bound to `jid`.
    pub fn new(connection: XmppConnection, jid: Jid, config: PorterConfig) -> Session {
        Session {
            porter: Porter::new(connection, jid, config),
            contacts: Arc::new(ContactFactory::new()),
        }
    }

    /// Start the porter's receive side.
    pub fn start(&self) {
        self.porter.start();
    }

    pub fn porter(&self) -> &Porter {
        &self.porter
    }

    pub fn contact_factory(&self) -> &Arc<ContactFactory> {
        &self.contacts
    }

    pub fn full_jid(&self) -> &Jid {
        self.porter.full_jid()
    }
}
