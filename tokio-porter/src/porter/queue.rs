// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The outbound send queue and its completion tokens.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

use crate::error::Error;
use crate::stanza::Stanza;

/// Requests cancellation of a queued operation.
///
/// Cancellation only takes effect if serialisation has not started when
/// the worker looks at the entry; bytes already committed to the
/// transport stay committed, but the operation's future still completes
/// with [`Error::Cancelled`].
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Transmission state of a queued stanza.
#[derive(Debug, Clone)]
pub enum SendState {
    /// Still in the transmit queue.
    Queued,
    /// Bytes are being written to the transport.
    Sending,
    /// Fully handed to the transport.
    Sent,
    /// Acknowledged by the peer via stream management.
    Acked,
    /// Cancelled before (or while) transmission.
    Cancelled,
    /// Transmission failed.
    Failed { error: Error },
    /// Dropped without transmission, e.g. when stream management state is
    /// discarded.
    Dropped,
}

impl SendState {
    fn is_terminal_for_wait(&self) -> bool {
        !matches!(self, SendState::Queued | SendState::Sending)
    }
}

/// Observer side of a queued send.
#[derive(Clone)]
pub struct SendToken {
    rx: watch::Receiver<SendState>,
}

impl SendToken {
    /// Read the current transmission state.
    pub fn state(&self) -> SendState {
        self.rx.borrow().clone()
    }

    /// Wait for the send to complete.
    ///
    /// Resolves `Ok` once the stanza has been handed to the transport
    /// (`Sent`, or `Acked` if the ack arrived first), and `Err` on
    /// cancellation, failure or drop.
    pub async fn wait(&mut self) -> Result<(), Error> {
        let state = match self.rx.wait_for(SendState::is_terminal_for_wait).await {
            Ok(state) => state.clone(),
            Err(_) => return Err(Error::LostWorker),
        };
        match state {
            SendState::Sent | SendState::Acked => Ok(()),
            SendState::Cancelled => Err(Error::Cancelled),
            SendState::Failed { error } => Err(error),
            SendState::Dropped => Err(Error::LostWorker),
            SendState::Queued | SendState::Sending => unreachable!(),
        }
    }

    pub(crate) fn into_stream(self) -> tokio_stream::wrappers::WatchStream<SendState> {
        tokio_stream::wrappers::WatchStream::new(self.rx)
    }
}

/// What a queue slot carries: a proper stanza, or a bare element (a
/// stream-management nonza riding the stanza queue).
#[derive(Debug)]
pub(crate) enum Payload {
    Stanza(Box<Stanza>),
    Tree(nodetree::NodeTree),
}

impl Payload {
    pub fn root(&self) -> &nodetree::Node {
        match self {
            Payload::Stanza(stanza) => stanza.root(),
            Payload::Tree(tree) => tree.root(),
        }
    }

    pub fn as_stanza(&self) -> Option<&Stanza> {
        match self {
            Payload::Stanza(stanza) => Some(stanza),
            Payload::Tree(_) => None,
        }
    }
}

/// An element in the transmit queue, with its state channel and optional
/// cancellation token.
#[derive(Debug)]
pub(crate) struct QueueEntry {
    pub payload: Payload,
    pub cancel: Option<CancelToken>,
    pub token: watch::Sender<SendState>,
}

impl QueueEntry {
    pub fn tracked(stanza: Box<Stanza>, cancel: Option<CancelToken>) -> (QueueEntry, SendToken) {
        let (tx, rx) = watch::channel(SendState::Queued);
        (
            QueueEntry {
                payload: Payload::Stanza(stanza),
                cancel,
                token: tx,
            },
            SendToken { rx },
        )
    }

    pub fn untracked(stanza: Box<Stanza>) -> QueueEntry {
        Self::tracked(stanza, None).0
    }

    /// An untracked nonza riding the stanza queue.
    pub fn nonza(tree: nodetree::NodeTree) -> QueueEntry {
        let (tx, _) = watch::channel(SendState::Queued);
        QueueEntry {
            payload: Payload::Tree(tree),
            cancel: None,
            token: tx,
        }
    }

    /// Does stream management count (and retain) this element?
    pub fn is_sm_counted(&self) -> bool {
        self.payload
            .as_stanza()
            .map(Stanza::is_sm_counted)
            .unwrap_or(false)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map(CancelToken::is_cancelled) == Some(true)
    }

    pub fn set_state(&self, state: SendState) {
        let _ = self.token.send_replace(state);
    }
}

/// FIFO transmit queue. The head element is the only one ever being
/// serialised; retransmissions prepend while preserving their order.
#[derive(Default)]
pub(crate) struct TransmitQueue {
    q: VecDeque<QueueEntry>,
}

impl TransmitQueue {
    pub fn new() -> TransmitQueue {
        TransmitQueue::default()
    }

    pub fn push_back(&mut self, entry: QueueEntry) {
        self.q.push_back(entry);
    }

    pub fn pop_front(&mut self) -> Option<QueueEntry> {
        self.q.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }

    pub fn len(&self) -> usize {
        self.q.len()
    }

    /// Put a sequence of entries at the front, preserving the order of
    /// `entries` (its first element becomes the queue head).
    pub fn requeue_front<I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = QueueEntry>,
        I::IntoIter: DoubleEndedIterator,
    {
        for entry in entries.into_iter().rev() {
            entry.set_state(SendState::Queued);
            self.q.push_front(entry);
        }
    }

    /// Fail every queued entry with the same error.
    pub fn fail_all(&mut self, error: &Error) {
        for entry in self.q.drain(..) {
            entry.set_state(SendState::Failed {
                error: error.clone(),
            });
        }
    }
}
