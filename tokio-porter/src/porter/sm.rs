// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! XEP-0198 stream management state.
//!
//! All counters are `u32` and wrap modulo 2^32; distances are computed
//! with [`window`], never with plain subtraction.

use core::fmt;
use std::collections::VecDeque;

use nodetree::{ns, Node, NodeTree};

use crate::connection::SmMarker;
use crate::porter::queue::{QueueEntry, SendState};
use crate::xmpp_error::{StreamError, StreamErrorCondition};

/// Ack window ceiling: the porter keeps
/// `window(sent_acked, sent_count) <= ACK_WINDOW_MAX` by requesting acks.
pub const ACK_WINDOW_MAX: u32 = 10;

/// Modular distance from `start` to `stop`.
#[inline]
pub fn window(start: u32, stop: u32) -> u32 {
    stop.wrapping_sub(start)
}

/// Read-only view of the stream-management context.
#[derive(Debug, Clone, Default)]
pub struct SmSnapshot {
    pub enabled: bool,
    pub resumable: bool,
    pub id: Option<String>,
    pub location: Option<String>,
    pub timeout: Option<u32>,
    pub sent_count: u32,
    pub sent_acked: u32,
    pub received_count: u32,
    pub outstanding_r: u32,
    pub unacked_len: usize,
}

/// Counter mismatch on a remote `<a/>` or `<resumed/>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckError {
    pub h: u32,
    pub send_count: u32,
}

impl fmt::Display for AckError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "peer acked {} stanza(s) while only {} were sent",
            self.h, self.send_count
        )
    }
}

impl AckError {
    /// The stream error sent to the peer for this violation:
    /// `undefined-condition` plus `<handled-count-too-high/>` in the SM
    /// namespace.
    pub fn to_stream_error(&self) -> StreamError {
        let mut app = Node::new("handled-count-too-high", ns::SM);
        app.set_attribute("h", self.h.to_string());
        app.set_attribute("send-count", self.send_count.to_string());
        StreamError {
            condition: StreamErrorCondition::UndefinedCondition,
            text: Some(format!(
                "You acknowledged {} stanza(s), while only {} were sent.",
                self.h, self.send_count
            )),
            application: Some(app),
        }
    }
}

/// The stream-management context of one porter.
pub(crate) struct SmState {
    pub enabled: bool,
    pub resumable: bool,
    pub id: Option<String>,
    pub location: Option<String>,
    pub timeout: Option<u32>,
    pub sent_count: u32,
    pub sent_acked: u32,
    pub received_count: u32,
    /// Unanswered `<r/>` requests of ours. Bounded: the window logic
    /// keeps one in flight, the keepalive path allows a second before
    /// declaring the peer gone.
    pub outstanding_r: u32,
    /// Sent but unacknowledged stanzas, oldest first.
    pub unacked: VecDeque<QueueEntry>,
}

impl fmt::Debug for SmState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SmState")
            .field("enabled", &self.enabled)
            .field("resumable", &self.resumable)
            .field("id", &self.id)
            .field("sent_count", &self.sent_count)
            .field("sent_acked", &self.sent_acked)
            .field("received_count", &self.received_count)
            .field("len(unacked)", &self.unacked.len())
            .finish()
    }
}

impl SmState {
    pub fn from_marker(marker: &SmMarker) -> Option<SmState> {
        if !marker.enabled {
            return None;
        }
        if marker.resumable && marker.id.is_none() {
            log::warn!(
                "connector marked the stream resumable without an id; resumption disabled"
            );
        }
        Some(SmState {
            enabled: true,
            resumable: marker.resumable && marker.id.is_some(),
            id: marker.id.clone(),
            location: marker.location.clone(),
            timeout: marker.timeout,
            sent_count: 0,
            sent_acked: 0,
            received_count: 0,
            outstanding_r: 0,
            unacked: VecDeque::new(),
        })
    }

    pub fn snapshot(&self) -> SmSnapshot {
        SmSnapshot {
            enabled: self.enabled,
            resumable: self.resumable,
            id: self.id.clone(),
            location: self.location.clone(),
            timeout: self.timeout,
            sent_count: self.sent_count,
            sent_acked: self.sent_acked,
            received_count: self.received_count,
            outstanding_r: self.outstanding_r,
            unacked_len: self.unacked.len(),
        }
    }

    /// Account a serialised stanza and keep it for replay.
    pub fn count_sent(&mut self, entry: QueueEntry) {
        self.sent_count = self.sent_count.wrapping_add(1);
        self.unacked.push_back(entry);
        log::trace!(
            "stored stanza; now at {} unacked stanza(s)",
            self.unacked.len()
        );
    }

    /// Account an inbound stanza. Incremented before dispatch so the next
    /// `<a/>` covers the stanza that triggered it.
    pub fn count_received(&mut self) {
        self.received_count = self.received_count.wrapping_add(1);
    }

    /// Should an `<r/>` be sent now to bound the window?
    pub fn needs_request(&self) -> bool {
        let w = window(self.sent_acked, self.sent_count);
        w == ACK_WINDOW_MAX / 2 || w > ACK_WINDOW_MAX
    }

    /// Apply a remote `<a h='...'/>`.
    pub fn remote_acked(&mut self, h: u32) -> Result<(), AckError> {
        self.outstanding_r = 0;
        if window(self.sent_acked, h) > window(self.sent_acked, self.sent_count) {
            return Err(AckError {
                h,
                send_count: self.sent_count,
            });
        }
        self.sent_acked = h;
        // Head-drop until the queue length matches the open window.
        let keep = window(self.sent_acked, self.sent_count) as usize;
        while self.unacked.len() > keep {
            if let Some(entry) = self.unacked.pop_front() {
                entry.set_state(SendState::Acked);
            }
        }
        log::debug!(
            "ack h={}; {} unacked stanza(s) remain (window {})",
            h,
            self.unacked.len(),
            keep
        );
        Ok(())
    }

    /// Capture a late `<enabled/>`.
    pub fn handle_enabled(&mut self, node: &Node) {
        self.enabled = true;
        if let Some(id) = node.attribute("id") {
            self.id = Some(id.to_owned());
        }
        self.resumable = node
            .attribute("resume")
            .map(|r| r == "true" || r == "1")
            .unwrap_or(false)
            && self.id.is_some();
        self.location = node.attribute("location").map(str::to_owned);
        self.timeout = node.attribute("max").and_then(|m| m.parse().ok());
    }

    /// Apply `<resumed previd='...' h='...'/>`.
    ///
    /// Returns the stanzas that must be retransmitted, in their original
    /// order, after resetting `sent_count` to the acked position.
    pub fn resumed(&mut self, previd: &str, h: u32) -> Result<Vec<QueueEntry>, ResumeError> {
        match self.id {
            Some(ref id) if id == previd => (),
            _ => return Err(ResumeError::PrevIdMismatch),
        }
        self.remote_acked(h).map_err(ResumeError::Ack)?;
        let replay: Vec<QueueEntry> = self.unacked.drain(..).collect();
        // The peer never saw the leftovers; they go back through the send
        // path, which will count them again.
        self.sent_count = self.sent_acked;
        log::debug!("resumed: {} stanza(s) to retransmit", replay.len());
        Ok(replay)
    }

    /// `<failed/>`: disable stream management and discard its state.
    pub fn failed(&mut self) {
        log::debug!("stream management failed; discarding state");
        self.enabled = false;
        self.resumable = false;
        self.id = None;
        self.location = None;
        self.timeout = None;
        self.sent_count = 0;
        self.sent_acked = 0;
        self.received_count = 0;
        self.outstanding_r = 0;
        for entry in self.unacked.drain(..) {
            entry.set_state(SendState::Dropped);
        }
    }

    /// The `<a h='...'/>` tree answering a remote `<r/>`.
    pub fn ack_tree(&self) -> NodeTree {
        let mut a = Node::new("a", ns::SM);
        a.set_attribute("h", self.received_count.to_string());
        NodeTree::new(a)
    }

    /// The `<r/>` tree.
    pub fn request_tree() -> NodeTree {
        NodeTree::new(Node::new("r", ns::SM))
    }

    /// The `<resume previd='...' h='...'/>` tree, when resumable.
    pub fn resume_tree(&self) -> Option<NodeTree> {
        let id = self.id.as_deref()?;
        if !self.resumable {
            return None;
        }
        let mut resume = Node::new("resume", ns::SM);
        resume.set_attribute("previd", id);
        resume.set_attribute("h", self.received_count.to_string());
        Some(NodeTree::new(resume))
    }
}

/// Failure applying `<resumed/>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeError {
    PrevIdMismatch,
    Ack(AckError),
}

impl fmt::Display for ResumeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ResumeError::PrevIdMismatch => {
                f.write_str("resumed previd does not match the stream id")
            }
            ResumeError::Ack(e) => write!(f, "{}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::{Stanza, StanzaSubType, StanzaType};

    fn state() -> SmState {
        SmState::from_marker(&SmMarker {
            enabled: true,
            resumable: true,
            id: Some("s1".to_owned()),
            location: None,
            timeout: None,
        })
        .unwrap()
    }

    fn entry(id: &str) -> QueueEntry {
        let mut st =
            Stanza::build(StanzaType::Message, StanzaSubType::Chat, None, None, &[]).unwrap();
        st.set_id(id);
        QueueEntry::untracked(Box::new(st))
    }

    #[test]
    fn window_wraps() {
        assert_eq!(window(0, 3), 3);
        assert_eq!(window(u32::MAX, 2), 3);
        assert_eq!(window(5, 5), 0);
    }

    #[test]
    fn counting_and_acking() {
        let mut sm = state();
        for i in 0..3 {
            sm.count_sent(entry(&i.to_string()));
        }
        assert_eq!(sm.sent_count, 3);
        assert_eq!(sm.sent_acked, 0);
        assert_eq!(sm.unacked.len(), 3);

        sm.remote_acked(2).unwrap();
        assert_eq!(sm.sent_acked, 2);
        assert_eq!(sm.unacked.len(), 1);
        assert_eq!(
            sm.unacked[0].payload.as_stanza().and_then(|s| s.id()),
            Some("2")
        );
    }

    #[test]
    fn ack_beyond_sent_is_rejected() {
        let mut sm = state();
        sm.count_sent(entry("0"));
        let err = sm.remote_acked(5).unwrap_err();
        assert_eq!(err, AckError { h: 5, send_count: 1 });

        let stream_error = err.to_stream_error();
        assert_eq!(
            stream_error.condition,
            StreamErrorCondition::UndefinedCondition
        );
        let app = stream_error.application.unwrap();
        assert_eq!(app.name(), "handled-count-too-high");
        assert_eq!(app.ns(), ns::SM);
        assert_eq!(app.attribute("h"), Some("5"));
    }

    #[test]
    fn ack_going_backwards_is_rejected() {
        let mut sm = state();
        for i in 0..4 {
            sm.count_sent(entry(&i.to_string()));
        }
        sm.remote_acked(3).unwrap();
        // h went backwards: the wrapped distance exceeds the open window.
        assert!(sm.remote_acked(2).is_err());
    }

    #[test]
    fn needs_request_at_half_window_and_above_max() {
        let mut sm = state();
        for i in 0..ACK_WINDOW_MAX / 2 {
            assert!(!sm.needs_request(), "at {} sent", i);
            sm.count_sent(entry(&i.to_string()));
        }
        assert!(sm.needs_request());

        for i in 0..=ACK_WINDOW_MAX / 2 {
            sm.count_sent(entry(&(100 + i).to_string()));
        }
        assert!(window(sm.sent_acked, sm.sent_count) > ACK_WINDOW_MAX);
        assert!(sm.needs_request());
    }

    #[test]
    fn resumed_replays_the_tail() {
        let mut sm = state();
        for i in 0..10 {
            sm.count_sent(entry(&i.to_string()));
        }
        sm.remote_acked(7).unwrap();
        assert_eq!(sm.unacked.len(), 3);

        let replay = sm.resumed("s1", 9).unwrap();
        assert_eq!(replay.len(), 1);
        assert_eq!(
            replay[0].payload.as_stanza().and_then(|s| s.id()),
            Some("9")
        );
        assert_eq!(sm.sent_count, 9);
        assert_eq!(sm.sent_acked, 9);
        assert!(sm.unacked.is_empty());
    }

    #[test]
    fn resumed_rejects_wrong_previd() {
        let mut sm = state();
        assert_eq!(sm.resumed("other", 0), Err(ResumeError::PrevIdMismatch));
    }

    #[test]
    fn failed_discards_everything() {
        let mut sm = state();
        let (e, token) = QueueEntry::tracked(
            Box::new(
                Stanza::build(StanzaType::Message, StanzaSubType::Chat, None, None, &[]).unwrap(),
            ),
            None,
        );
        sm.count_sent(e);
        sm.failed();
        assert!(!sm.enabled);
        assert!(!sm.resumable);
        assert_eq!(sm.unacked.len(), 0);
        assert!(matches!(token.state(), SendState::Dropped));
    }

    #[test]
    fn counters_wrap_across_the_u32_boundary() {
        let mut sm = state();
        sm.sent_count = u32::MAX - 1;
        sm.sent_acked = u32::MAX - 1;
        for i in 0..4 {
            sm.count_sent(entry(&i.to_string()));
        }
        assert_eq!(sm.sent_count, 2);
        assert_eq!(window(sm.sent_acked, sm.sent_count), 4);
        sm.remote_acked(1).unwrap();
        assert_eq!(sm.unacked.len(), 1);
    }

    #[test]
    fn trees() {
        let mut sm = state();
        sm.count_received();
        sm.count_received();
        let ack = sm.ack_tree();
        assert_eq!(ack.root().name(), "a");
        assert_eq!(ack.root().attribute("h"), Some("2"));

        let resume = sm.resume_tree().unwrap();
        assert_eq!(resume.root().attribute("previd"), Some("s1"));
        assert_eq!(resume.root().attribute("h"), Some("2"));

        assert_eq!(SmState::request_tree().root().name(), "r");
    }
}
