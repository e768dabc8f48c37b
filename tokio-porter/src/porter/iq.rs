// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! IQ request/response correlation.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};

use futures::ready;
use futures::Stream;
use jid::Jid;
use tokio::sync::oneshot;

use crate::error::Error;
use crate::porter::queue::{SendState, SendToken};
use crate::stanza::{make_id, Stanza};

/// One pending request, keyed by its id in the tracker map.
struct PendingIq {
    /// The `to` of the request; constrains who may answer.
    recipient: Option<Jid>,
    tx: oneshot::Sender<Result<Stanza, Error>>,
}

type IqMap = HashMap<String, PendingIq>;

/// Shared id → pending-reply map. The frontend allocates entries; the
/// worker resolves them against inbound responses.
#[derive(Clone, Default)]
pub(crate) struct IqTracker {
    map: Arc<Mutex<IqMap>>,
}

/// Removes the map entry when the reply token is dropped unresolved.
struct IqMapEntryHandle {
    id: String,
    map: Weak<Mutex<IqMap>>,
}

impl Drop for IqMapEntryHandle {
    fn drop(&mut self) {
        let Some(map) = self.map.upgrade() else {
            return;
        };
        let Ok(mut map) = map.lock() else {
            return;
        };
        map.remove(&self.id);
    }
}

impl IqTracker {
    pub fn new() -> IqTracker {
        IqTracker::default()
    }

    /// Allocate an id unique among the outstanding requests, register the
    /// pending entry and return the reply token.
    ///
    /// The stanza's id attribute is rewritten to the allocated id.
    pub fn allocate(&self, stanza: &mut Stanza, recipient: Option<Jid>) -> IqReplyToken {
        let mut map = self.map.lock().unwrap();
        let mut id = make_id();
        while map.contains_key(&id) {
            id = make_id();
        }
        stanza.set_id(id.clone());

        let (tx, rx) = oneshot::channel();
        map.insert(id.clone(), PendingIq { recipient, tx });
        IqReplyToken {
            entry: Some(IqMapEntryHandle {
                id,
                map: Arc::downgrade(&self.map),
            }),
            send_states: None,
            inner: rx,
        }
    }

    /// Try to resolve an inbound `iq result|error` against a pending
    /// request. Returns `true` when the stanza was claimed.
    ///
    /// `full_jid`/`bare_jid`/`domain` describe the local user for the
    /// spoofing check.
    pub fn handle_reply(
        &self,
        reply: &Stanza,
        full_jid: &Jid,
        bare_jid: &Jid,
        domain: &str,
    ) -> bool {
        let Some(id) = reply.id() else {
            log::debug!("ignoring IQ reply without id");
            return false;
        };
        let mut map = self.map.lock().unwrap();
        let Some(pending) = map.get(id) else {
            log::debug!("ignored IQ reply with unknown id {:?}", id);
            return false;
        };

        if !check_spoofing(
            reply.from_attr(),
            pending.recipient.as_ref(),
            full_jid,
            bare_jid,
            domain,
        ) {
            // Entry stays; the genuine reply may still arrive.
            return false;
        }

        let pending = map.remove(id).unwrap();
        let _ = pending.tx.send(Ok(reply.clone()));
        true
    }

    /// Fail every pending request with the same error.
    pub fn fail_all(&self, error: &Error) {
        let mut map = self.map.lock().unwrap();
        for (_, pending) in map.drain() {
            let _ = pending.tx.send(Err(error.clone()));
        }
    }

    #[cfg(test)]
    pub fn outstanding(&self) -> usize {
        self.map.lock().unwrap().len()
    }
}

/// Is this sender the server speaking for the user's session?
pub(crate) fn jid_is_from_server(from: &Jid, full_jid: &Jid, bare_jid: &Jid, domain: &str) -> bool {
    if from == full_jid || from == bare_jid {
        return true;
    }
    from.node().is_none() && from.resource().is_none() && from.domain().as_str() == domain
}

/// Validate the `from` of an IQ reply against the `to` of its request.
///
/// Returns `true` when the reply is acceptable.
pub(crate) fn check_spoofing(
    reply_from: Option<&str>,
    recipient: Option<&Jid>,
    full_jid: &Jid,
    bare_jid: &Jid,
    domain: &str,
) -> bool {
    // Fast path: byte-for-byte match.
    match (reply_from, recipient) {
        (None, None) => return true,
        (Some(from), Some(recipient)) if from == recipient.to_string() => return true,
        _ => (),
    }

    let normalized = match reply_from {
        Some(from) => match Jid::new(from) {
            Ok(jid) => Some(jid),
            Err(_) => {
                log::debug!("IQ reply from unparseable JID {:?}; dropping", from);
                return false;
            }
        },
        None => None,
    };

    if let (Some(nfrom), Some(recipient)) = (normalized.as_ref(), recipient) {
        if nfrom == recipient {
            return true;
        }
    }

    // A request without a 'to' goes to our server; allow it to answer as
    // our full JID, bare JID or bare domain.
    if recipient.is_none() {
        match normalized.as_ref() {
            None => return true,
            Some(nfrom) => {
                if jid_is_from_server(nfrom, full_jid, bare_jid, domain) {
                    return true;
                }
            }
        }
    }

    // A request to the server domain itself may be answered without a
    // 'from' (some servers reply on behalf of the account).
    if normalized.is_none() {
        if let Some(recipient) = recipient {
            if recipient.node().is_none()
                && recipient.resource().is_none()
                && recipient.domain().as_str() == domain
            {
                return true;
            }
        }
    }

    // A request to our own full or bare JID may be answered without a
    // 'from', or from the full JID.
    if normalized.is_none() || normalized.as_ref() == Some(full_jid) {
        if let Some(recipient) = recipient {
            if recipient == full_jid || recipient == bare_jid {
                return true;
            }
        }
    }

    log::debug!(
        "'{}' (normal: '{}') attempts to spoof an IQ reply from '{}'",
        reply_from.unwrap_or("(absent)"),
        normalized
            .as_ref()
            .map(|j| j.to_string())
            .unwrap_or_else(|| "(absent)".to_owned()),
        recipient
            .map(|j| j.to_string())
            .unwrap_or_else(|| "(absent)".to_owned()),
    );
    false
}

pin_project_lite::pin_project! {
    /// Future resolving with the IQ response stanza.
    ///
    /// There is no internal timeout: if the peer never answers, combine
    /// with [`tokio::time::timeout`]. Dropping the token unregisters the
    /// pending entry.
    pub struct IqReplyToken {
        entry: Option<IqMapEntryHandle>,
        #[pin]
        send_states: Option<tokio_stream::wrappers::WatchStream<SendState>>,
        #[pin]
        inner: oneshot::Receiver<Result<Stanza, Error>>,
    }
}

impl IqReplyToken {
    /// Tie the send token of the request to this reply token so that
    /// transmission failures resolve the future.
    pub(crate) fn set_send_token(&mut self, token: SendToken) {
        debug_assert!(self.send_states.is_none());
        self.send_states = Some(token.into_stream());
    }
}

impl Future for IqReplyToken {
    type Output = Result<Stanza, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        match this.inner.poll(cx) {
            Poll::Ready(Ok(result)) => {
                this.entry.take();
                return Poll::Ready(result);
            }
            Poll::Ready(Err(_)) => {
                this.entry.take();
                return Poll::Ready(Err(Error::LostWorker));
            }
            Poll::Pending => (),
        }

        loop {
            match this.send_states.as_mut().as_pin_mut() {
                Some(stream) => match ready!(stream.poll_next(cx)) {
                    Some(SendState::Queued) | Some(SendState::Sending) => (),
                    Some(SendState::Sent) | Some(SendState::Acked) => {
                        // Request is on the wire; from here only the
                        // response channel matters.
                        *this.send_states = None;
                        return Poll::Pending;
                    }
                    Some(SendState::Cancelled) => {
                        this.entry.take();
                        return Poll::Ready(Err(Error::Cancelled));
                    }
                    Some(SendState::Failed { error }) => {
                        this.entry.take();
                        return Poll::Ready(Err(error));
                    }
                    Some(SendState::Dropped) | None => {
                        this.entry.take();
                        return Poll::Ready(Err(Error::LostWorker));
                    }
                },
                None => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::{StanzaSubType, StanzaType};

    fn user() -> (Jid, Jid, String) {
        let full = Jid::new("romeo@example.com/orchard").unwrap();
        let bare = Jid::new("romeo@example.com").unwrap();
        (full, bare, "example.com".to_owned())
    }

    fn jid(s: &str) -> Jid {
        Jid::new(s).unwrap()
    }

    #[test]
    fn exact_match_is_accepted() {
        let (full, bare, domain) = user();
        assert!(check_spoofing(
            Some("juliet@example.com/balcony"),
            Some(&jid("juliet@example.com/balcony")),
            &full,
            &bare,
            &domain,
        ));
    }

    #[test]
    fn other_sender_is_rejected() {
        let (full, bare, domain) = user();
        assert!(!check_spoofing(
            Some("eve@example.com/attic"),
            Some(&jid("juliet@example.com/balcony")),
            &full,
            &bare,
            &domain,
        ));
    }

    #[test]
    fn request_without_to_accepts_server_aliases() {
        let (full, bare, domain) = user();
        for from in [
            None,
            Some("romeo@example.com/orchard"),
            Some("romeo@example.com"),
            Some("example.com"),
        ] {
            assert!(
                check_spoofing(from, None, &full, &bare, &domain),
                "from={:?}",
                from
            );
        }
        assert!(!check_spoofing(
            Some("eve@example.com"),
            None,
            &full,
            &bare,
            &domain
        ));
    }

    #[test]
    fn request_to_domain_accepts_absent_from() {
        let (full, bare, domain) = user();
        assert!(check_spoofing(
            None,
            Some(&jid("example.com")),
            &full,
            &bare,
            &domain
        ));
        assert!(!check_spoofing(
            None,
            Some(&jid("other.example")),
            &full,
            &bare,
            &domain
        ));
    }

    #[test]
    fn request_to_self_accepts_absent_or_full_from() {
        let (full, bare, domain) = user();
        assert!(check_spoofing(
            None,
            Some(&jid("romeo@example.com")),
            &full,
            &bare,
            &domain
        ));
        assert!(check_spoofing(
            Some("romeo@example.com/orchard"),
            Some(&jid("romeo@example.com")),
            &full,
            &bare,
            &domain
        ));
        assert!(!check_spoofing(
            Some("romeo@example.com/elsewhere"),
            Some(&jid("romeo@example.com")),
            &full,
            &bare,
            &domain
        ));
    }

    #[test]
    fn malformed_from_is_rejected() {
        let (full, bare, domain) = user();
        assert!(!check_spoofing(
            Some("not a jid @@"),
            Some(&jid("juliet@example.com")),
            &full,
            &bare,
            &domain
        ));
    }

    fn iq_get() -> Stanza {
        Stanza::build(StanzaType::Iq, StanzaSubType::Get, None, None, &[]).unwrap()
    }

    fn iq_result_with_id(id: &str, from: Option<&str>) -> Stanza {
        let mut st =
            Stanza::build(StanzaType::Iq, StanzaSubType::Result, from, None, &[]).unwrap();
        st.set_id(id);
        st
    }

    #[tokio::test]
    async fn allocate_and_resolve() {
        let (full, bare, domain) = user();
        let tracker = IqTracker::new();
        let mut request = iq_get();
        let token = tracker.allocate(&mut request, Some(jid("juliet@example.com/balcony")));
        let id = request.id().unwrap().to_owned();
        assert_eq!(tracker.outstanding(), 1);

        let reply = iq_result_with_id(&id, Some("juliet@example.com/balcony"));
        assert!(tracker.handle_reply(&reply, &full, &bare, &domain));
        assert_eq!(tracker.outstanding(), 0);

        let got = token.await.unwrap();
        assert_eq!(got.id(), Some(id.as_str()));

        // A second reply with the same id finds no entry.
        assert!(!tracker.handle_reply(&reply, &full, &bare, &domain));
    }

    #[tokio::test]
    async fn spoofed_reply_leaves_future_pending() {
        let (full, bare, domain) = user();
        let tracker = IqTracker::new();
        let mut request = iq_get();
        let token = tracker.allocate(&mut request, Some(jid("juliet@example.com/balcony")));
        let id = request.id().unwrap().to_owned();

        let spoofed = iq_result_with_id(&id, Some("eve@example.com/attic"));
        assert!(!tracker.handle_reply(&spoofed, &full, &bare, &domain));
        // Entry is retained for the genuine reply.
        assert_eq!(tracker.outstanding(), 1);

        let pending = tokio::time::timeout(std::time::Duration::from_millis(20), token).await;
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn dropping_token_unregisters() {
        let tracker = IqTracker::new();
        let mut request = iq_get();
        let token = tracker.allocate(&mut request, None);
        assert_eq!(tracker.outstanding(), 1);
        drop(token);
        assert_eq!(tracker.outstanding(), 0);
    }

    #[tokio::test]
    async fn send_failure_resolves_reply_token() {
        use crate::porter::queue::QueueEntry;

        let tracker = IqTracker::new();
        let mut request = iq_get();
        let mut token = tracker.allocate(&mut request, None);
        let (entry, send_token) = QueueEntry::tracked(Box::new(request), None);
        token.set_send_token(send_token);

        entry.set_state(SendState::Failed {
            error: Error::PorterClosed,
        });
        assert!(matches!(token.await, Err(Error::PorterClosed)));
    }
}
