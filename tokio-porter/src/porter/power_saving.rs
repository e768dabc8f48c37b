// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The power-saving deferral queue.
//!
//! While power saving is enabled, unimportant stanzas (bare presence and
//! a fixed set of PEP notifications) are parked in arrival order. The
//! queue is flushed, ahead of the triggering stanza, as soon as something
//! important arrives, and immediately when power saving is disabled.

use std::collections::VecDeque;

use nodetree::{build, ns, BuildStep, NodeTree, NsQuark};

use crate::stanza::{Stanza, StanzaSubType, StanzaType};

/// PEP payload nodes whose notifications can safely wait.
const QUEUEABLE_PEP_NODES: &[&str] = &[
    "http://jabber.org/protocol/geoloc",
    "http://jabber.org/protocol/nick",
    "http://laptop.org/xmpp/buddy-properties",
    "http://laptop.org/xmpp/activities",
    "http://laptop.org/xmpp/current-activity",
    "http://laptop.org/xmpp/activity-properties",
];

fn build_queueable_patterns() -> Vec<NodeTree> {
    QUEUEABLE_PEP_NODES
        .iter()
        .map(|node| {
            use BuildStep::*;
            let (tree, _) = build(
                "message",
                NsQuark::NONE,
                &[
                    Start("event"),
                    Ns(ns::PUBSUB_EVENT),
                    Start("items"),
                    Attr("node", node),
                    End,
                    End,
                ],
            );
            tree
        })
        .collect()
}

pub(crate) struct PowerSaving {
    enabled: bool,
    queue: VecDeque<Stanza>,
    patterns: Vec<NodeTree>,
}

impl PowerSaving {
    pub fn new() -> PowerSaving {
        PowerSaving {
            enabled: false,
            queue: VecDeque::new(),
            patterns: Vec::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Toggle power saving. Disabling returns the deferred stanzas, in
    /// arrival order, for immediate dispatch.
    pub fn set_enabled(&mut self, enabled: bool) -> Vec<Stanza> {
        let flush = if self.enabled && !enabled {
            self.drain()
        } else {
            Vec::new()
        };
        self.enabled = enabled;
        flush
    }

    pub fn drain(&mut self) -> Vec<Stanza> {
        self.queue.drain(..).collect()
    }

    fn is_important(&mut self, stanza: &Stanza) -> bool {
        let (type_, sub_type) = stanza.type_info();
        if type_ == StanzaType::Presence
            && matches!(sub_type, StanzaSubType::None | StanzaSubType::Unavailable)
        {
            return false;
        }
        if self.patterns.is_empty() {
            self.patterns = build_queueable_patterns();
        }
        !self
            .patterns
            .iter()
            .any(|p| stanza.root().is_superset(p.root()))
    }

    /// Either park the stanza, or return what must be dispatched now:
    /// all deferred stanzas in order, then the important one.
    pub fn admit(&mut self, stanza: Stanza) -> Vec<Stanza> {
        if !self.enabled {
            return vec![stanza];
        }
        if self.is_important(&stanza) {
            let mut out = self.drain();
            out.push(stanza);
            out
        } else {
            log::trace!("deferring unimportant stanza in power-saving mode");
            self.queue.push_back(stanza);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(xml: &[u8]) -> Stanza {
        let mut reader = nodetree::Reader::new();
        reader.push(
            b"<stream:stream xmlns:stream='http://etherx.jabber.org/streams' \
              xmlns='jabber:client' version='1.0'>",
        );
        reader.push(xml);
        Stanza::from_tree(reader.pop_stanza().unwrap()).unwrap()
    }

    #[test]
    fn disabled_passes_everything_through() {
        let mut ps = PowerSaving::new();
        let out = ps.admit(parse(b"<presence/>"));
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn bare_and_unavailable_presence_are_deferred() {
        let mut ps = PowerSaving::new();
        ps.set_enabled(true);
        assert!(ps.admit(parse(b"<presence/>")).is_empty());
        assert!(ps.admit(parse(b"<presence type='unavailable'/>")).is_empty());
        // Subscription requests are important.
        let out = ps.admit(parse(b"<presence type='subscribe'/>"));
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn pep_notifications_are_deferred() {
        let mut ps = PowerSaving::new();
        ps.set_enabled(true);
        let geoloc = parse(
            b"<message from='juliet@example.com'>\
              <event xmlns='http://jabber.org/protocol/pubsub#event'>\
              <items node='http://jabber.org/protocol/geoloc'>\
              <item><geoloc xmlns='http://jabber.org/protocol/geoloc'/></item>\
              </items></event></message>",
        );
        assert!(ps.admit(geoloc).is_empty());

        // Other pubsub nodes stay important.
        let other = parse(
            b"<message from='juliet@example.com'>\
              <event xmlns='http://jabber.org/protocol/pubsub#event'>\
              <items node='urn:example:other'/></event></message>",
        );
        assert_eq!(ps.admit(other).len(), 2);
    }

    #[test]
    fn important_stanza_flushes_in_arrival_order() {
        let mut ps = PowerSaving::new();
        ps.set_enabled(true);
        let mut p1 = parse(b"<presence/>");
        p1.set_id("p1");
        let mut p2 = parse(b"<presence/>");
        p2.set_id("p2");
        assert!(ps.admit(p1).is_empty());
        assert!(ps.admit(p2).is_empty());

        let mut m = parse(b"<message><body>hi</body></message>");
        m.set_id("m");
        let out = ps.admit(m);
        let ids: Vec<_> = out.iter().map(|s| s.id().unwrap().to_owned()).collect();
        assert_eq!(ids, vec!["p1", "p2", "m"]);
    }

    #[test]
    fn disabling_flushes_the_rest() {
        let mut ps = PowerSaving::new();
        ps.set_enabled(true);
        ps.admit(parse(b"<presence/>"));
        ps.admit(parse(b"<presence/>"));
        let flushed = ps.set_enabled(false);
        assert_eq!(flushed.len(), 2);
        assert!(!ps.is_enabled());
    }
}
