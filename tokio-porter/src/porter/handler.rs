// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Handler registration and ordering.

use jid::Jid;

use nodetree::NodeTree;

use crate::porter::Porter;
use crate::stanza::{Stanza, StanzaSubType, StanzaType};

/// Identifies a registered handler for unregistration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(pub(crate) u64);

/// Which senders a handler wants to hear from.
#[derive(Debug, Clone)]
pub enum SenderMatch {
    /// Any sender, including none.
    Anyone,
    /// Only the server: no `from` attribute, or the user's own full or
    /// bare JID, or the bare server domain.
    Server,
    /// A specific JID. Without a resource, any resource of that bare JID
    /// matches.
    Jid(Jid),
}

/// The callback invoked for matching stanzas.
///
/// Returning `true` claims the stanza: no later handler sees it.
pub type HandlerCallback = Box<dyn FnMut(&Porter, &Stanza) -> bool + Send + 'static>;

pub(crate) struct RegisteredHandler {
    pub id: HandlerId,
    /// `None` matches every stanza type.
    pub type_: Option<StanzaType>,
    /// [`StanzaSubType::None`] matches every sub-type.
    pub sub_type: StanzaSubType,
    pub sender: SenderMatch,
    pub priority: i32,
    pub pattern: Option<NodeTree>,
    pub callback: HandlerCallback,
}

impl RegisteredHandler {
    pub fn matches_type(&self, type_: StanzaType, sub_type: StanzaSubType) -> bool {
        if let Some(t) = self.type_ {
            if t != type_ {
                return false;
            }
        }
        if self.sub_type != StanzaSubType::None && self.sub_type != sub_type {
            return false;
        }
        true
    }

    pub fn matches_sender(&self, from: Option<&Jid>, is_from_server: bool) -> bool {
        match &self.sender {
            SenderMatch::Anyone => true,
            SenderMatch::Server => is_from_server,
            SenderMatch::Jid(expected) => {
                let Some(from) = from else {
                    return false;
                };
                if from.node() != expected.node() {
                    return false;
                }
                if from.domain() != expected.domain() {
                    return false;
                }
                match expected.resource() {
                    Some(resource) => from.resource() == Some(resource),
                    None => true,
                }
            }
        }
    }

    pub fn matches_pattern(&self, stanza: &Stanza) -> bool {
        match &self.pattern {
            Some(pattern) => stanza.root().is_superset(pattern.root()),
            None => true,
        }
    }
}

/// Registry ordered by descending priority; handlers with equal priority
/// run in registration order.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    handlers: Vec<RegisteredHandler>,
}

impl HandlerRegistry {
    pub fn new() -> HandlerRegistry {
        HandlerRegistry::default()
    }

    pub fn insert(&mut self, handler: RegisteredHandler) {
        let pos = self
            .handlers
            .iter()
            .position(|h| h.priority < handler.priority)
            .unwrap_or(self.handlers.len());
        self.handlers.insert(pos, handler);
    }

    pub fn remove(&mut self, id: HandlerId) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|h| h.id != id);
        self.handlers.len() != before
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut RegisteredHandler> {
        self.handlers.iter_mut()
    }

    #[cfg(test)]
    pub fn priorities(&self) -> Vec<(i32, HandlerId)> {
        self.handlers.iter().map(|h| (h.priority, h.id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler(id: u64, priority: i32) -> RegisteredHandler {
        RegisteredHandler {
            id: HandlerId(id),
            type_: None,
            sub_type: StanzaSubType::None,
            sender: SenderMatch::Anyone,
            priority,
            pattern: None,
            callback: Box::new(|_, _| false),
        }
    }

    #[test]
    fn ordering_is_priority_desc_then_registration_order() {
        let mut reg = HandlerRegistry::new();
        reg.insert(handler(1, 0));
        reg.insert(handler(2, 10));
        reg.insert(handler(3, 10));
        reg.insert(handler(4, -5));
        reg.insert(handler(5, 0));
        assert_eq!(
            reg.priorities(),
            vec![
                (10, HandlerId(2)),
                (10, HandlerId(3)),
                (0, HandlerId(1)),
                (0, HandlerId(5)),
                (-5, HandlerId(4)),
            ]
        );
    }

    #[test]
    fn remove_by_id() {
        let mut reg = HandlerRegistry::new();
        reg.insert(handler(1, 0));
        reg.insert(handler(2, 0));
        assert!(reg.remove(HandlerId(1)));
        assert!(!reg.remove(HandlerId(1)));
        assert_eq!(reg.priorities(), vec![(0, HandlerId(2))]);
    }

    #[test]
    fn type_matching() {
        let mut h = handler(1, 0);
        h.type_ = Some(StanzaType::Message);
        assert!(h.matches_type(StanzaType::Message, StanzaSubType::Chat));
        assert!(!h.matches_type(StanzaType::Presence, StanzaSubType::None));

        h.sub_type = StanzaSubType::Groupchat;
        assert!(!h.matches_type(StanzaType::Message, StanzaSubType::Chat));
        assert!(h.matches_type(StanzaType::Message, StanzaSubType::Groupchat));
    }

    #[test]
    fn sender_matching_jid() {
        let mut h = handler(1, 0);
        h.sender = SenderMatch::Jid(Jid::new("juliet@example.com").unwrap());

        let balcony = Jid::new("juliet@example.com/balcony").unwrap();
        let attic = Jid::new("eve@example.com/attic").unwrap();
        assert!(h.matches_sender(Some(&balcony), false));
        assert!(!h.matches_sender(Some(&attic), false));
        assert!(!h.matches_sender(None, true));

        // With a resource, the resource must match.
        h.sender = SenderMatch::Jid(Jid::new("juliet@example.com/balcony").unwrap());
        assert!(h.matches_sender(Some(&balcony), false));
        let garden = Jid::new("juliet@example.com/garden").unwrap();
        assert!(!h.matches_sender(Some(&garden), false));
    }

    #[test]
    fn sender_matching_server() {
        let mut h = handler(1, 0);
        h.sender = SenderMatch::Server;
        assert!(h.matches_sender(None, true));
        let peer = Jid::new("eve@example.com").unwrap();
        assert!(!h.matches_sender(Some(&peer), false));
    }
}
