// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The porter's worker task: one duplex event loop owning the
//! connection, the send queue, the handler registry and the stream
//! management state.

use std::collections::VecDeque;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc, oneshot};

use nodetree::{ns, NodeTree};

use crate::connection::{ReceiveHalf, TransmitHalf, XmppConnection};
use crate::error::{Error, TransportError};
use crate::stanza::{Stanza, StanzaSubType, StanzaType};
use crate::xmpp_error::{CoreStanzaError, StreamError};

use super::handler::HandlerRegistry;
use super::iq::{jid_is_from_server, IqTracker};
use super::power_saving::PowerSaving;
use super::queue::{QueueEntry, SendState, TransmitQueue};
use super::sm::SmState;
use super::{Command, HandlerId, PorterEvent, Reconnector, WeakHandle};

/// Something to send ahead of the stanza queue: stream management
/// nonzas, stream errors, whitespace keepalives.
enum NonzaItem {
    Tree(NodeTree),
    Raw(&'static [u8]),
}

pub(super) struct PorterWorker {
    frontend: WeakHandle,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    events: broadcast::Sender<PorterEvent>,
    tracker: IqTracker,

    rx: Option<ReceiveHalf>,
    tx: Option<TransmitHalf>,
    /// Bytes of the element currently being written.
    tx_buf: BytesMut,
    /// The queue entry whose bytes are in `tx_buf`.
    inflight: Option<QueueEntry>,
    /// Items that jump the stanza queue.
    nonzas: VecDeque<NonzaItem>,
    queue: TransmitQueue,

    registry: HandlerRegistry,
    sm: Option<SmState>,
    power: PowerSaving,

    reconnector: Option<Reconnector>,
    conn_slot: Option<oneshot::Receiver<XmppConnection>>,
    /// Waiting for `<resumed/>` / `<failed/>` on a fresh transport.
    resume_pending: bool,
    /// The error that broke the stream; surfaced if resumption fails.
    resume_error: Option<Error>,

    started: bool,
    closing: bool,
    footer_sent: bool,
    /// Set when a stream error of ours is queued; once it is flushed the
    /// worker fails with this error.
    terminate_after_flush: Option<Error>,
    close_waiters: Vec<(oneshot::Sender<Result<(), Error>>, Option<super::CancelToken>)>,
    running: bool,
}

async fn write_step(tx: &mut Option<TransmitHalf>, buf: &mut BytesMut) -> io::Result<()> {
    match tx {
        Some(tx) if !buf.is_empty() => {
            tx.io.write_buf(buf).await?;
            if buf.is_empty() {
                tx.io.flush().await?;
            }
            Ok(())
        }
        _ => std::future::pending().await,
    }
}

async fn recv_step(rx: &mut Option<ReceiveHalf>, started: bool) -> Result<Option<NodeTree>, Error> {
    match rx {
        Some(rx) if started => rx.recv().await,
        _ => std::future::pending().await,
    }
}

async fn await_conn(
    slot: &mut Option<oneshot::Receiver<XmppConnection>>,
) -> Result<XmppConnection, oneshot::error::RecvError> {
    match slot {
        Some(rx) => rx.await,
        None => std::future::pending().await,
    }
}

impl PorterWorker {
    pub fn spawn(
        frontend: WeakHandle,
        connection: XmppConnection,
        cmd_rx: mpsc::UnboundedReceiver<Command>,
        events: broadcast::Sender<PorterEvent>,
        tracker: IqTracker,
        reconnector: Option<Reconnector>,
    ) {
        let (rx, tx, marker) = connection.split();
        let sm = SmState::from_marker(&marker);
        let mut worker = PorterWorker {
            frontend,
            cmd_rx,
            events,
            tracker,
            rx: Some(rx),
            tx: Some(tx),
            tx_buf: BytesMut::new(),
            inflight: None,
            nonzas: VecDeque::new(),
            queue: TransmitQueue::new(),
            registry: HandlerRegistry::new(),
            sm,
            power: PowerSaving::new(),
            reconnector,
            conn_slot: None,
            resume_pending: false,
            resume_error: None,
            started: false,
            closing: false,
            footer_sent: false,
            terminate_after_flush: None,
            close_waiters: Vec::new(),
            running: true,
        };
        worker.publish_sm();
        tokio::spawn(async move { worker.run().await });
    }

    async fn run(&mut self) {
        while self.running {
            self.advance_tx();
            if !self.running {
                break;
            }
            tokio::select! {
                biased;
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        log::debug!("all porter handles dropped; shutting down");
                        self.teardown(Error::PorterClosed);
                    }
                },
                conn = await_conn(&mut self.conn_slot) => self.handle_new_connection(conn),
                result = write_step(&mut self.tx, &mut self.tx_buf) => {
                    if let Err(e) = result {
                        self.handle_stream_broken(e.into());
                    }
                },
                result = recv_step(&mut self.rx, self.started) => match result {
                    Ok(Some(tree)) => self.handle_inbound(tree),
                    Ok(None) => self.handle_remote_eof(),
                    Err(err) => match err {
                        Error::Transport(_) => self.handle_stream_broken(err),
                        err => self.fail_fatal(err),
                    },
                },
            }
        }
        if let Some(mut tx) = self.tx.take() {
            let _ = tx.shutdown().await;
        }
    }

    // ---- transmit path ----------------------------------------------

    /// Top up the transmit buffer: complete the in-flight element and
    /// serialise the next one. Nonzas go first; a pending cancellation
    /// takes effect here, before serialisation starts.
    fn advance_tx(&mut self) {
        if self.tx.is_none() || !self.tx_buf.is_empty() {
            return;
        }
        if let Some(entry) = self.inflight.take() {
            self.finish_sent(entry);
        }
        loop {
            if let Some(item) = self.nonzas.pop_front() {
                let bytes = match item {
                    NonzaItem::Tree(tree) => {
                        self.tx.as_mut().unwrap().encode_root(tree.root())
                    }
                    NonzaItem::Raw(bytes) => bytes.to_vec(),
                };
                self.tx_buf.extend_from_slice(&bytes);
                return;
            }
            // Stanzas wait while a resumption handshake is in progress.
            if self.resume_pending {
                return;
            }
            match self.queue.pop_front() {
                Some(entry) => {
                    if entry.is_cancelled() {
                        entry.set_state(SendState::Cancelled);
                        continue;
                    }
                    entry.set_state(SendState::Sending);
                    if let Some(stanza) = entry.payload.as_stanza() {
                        let _ = self.events.send(PorterEvent::Sending(stanza.clone()));
                    }
                    let bytes = self
                        .tx
                        .as_mut()
                        .unwrap()
                        .encode_root(entry.payload.root());
                    self.tx_buf.extend_from_slice(&bytes);
                    self.inflight = Some(entry);
                    return;
                }
                None => break,
            }
        }
        if self.closing && !self.footer_sent {
            let bytes = self.tx.as_mut().unwrap().encode_stream_close();
            self.tx_buf.extend_from_slice(&bytes);
            self.footer_sent = true;
            return;
        }
        if self.footer_sent {
            if let Some(err) = self.terminate_after_flush.take() {
                self.fail_fatal(err);
            }
        }
    }

    /// Account a fully written element.
    fn finish_sent(&mut self, entry: QueueEntry) {
        if entry.is_cancelled() {
            // Bytes are committed, but the caller asked out: the future
            // reports Cancelled either way.
            entry.set_state(SendState::Cancelled);
        } else {
            entry.set_state(SendState::Sent);
        }
        let counted = entry.is_sm_counted();
        if let Some(sm) = self.sm.as_mut() {
            if sm.enabled && counted {
                sm.count_sent(entry);
                if sm.needs_request() && sm.outstanding_r == 0 {
                    sm.outstanding_r += 1;
                    self.nonzas.push_back(NonzaItem::Tree(SmState::request_tree()));
                }
            }
        }
        self.publish_sm();
    }

    fn enqueue_entry(&mut self, entry: QueueEntry) {
        if !self.running {
            entry.set_state(SendState::Failed {
                error: Error::PorterClosed,
            });
        } else if self.closing {
            entry.set_state(SendState::Failed {
                error: Error::PorterClosing,
            });
        } else {
            self.queue.push_back(entry);
        }
    }

    fn enqueue_nonza(&mut self, tree: NodeTree) {
        self.nonzas.push_back(NonzaItem::Tree(tree));
    }

    // ---- commands ---------------------------------------------------

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start => {
                self.started = true;
            }
            Command::Send(entry) => self.enqueue_entry(entry),
            Command::Register(handler) => self.registry.insert(handler),
            Command::Unregister(id) => {
                self.unregister(id);
            }
            Command::SetPowerSaving(enabled) => {
                for stanza in self.power.set_enabled(enabled) {
                    self.dispatch(stanza);
                }
            }
            Command::Ping { tx } => self.handle_ping(tx),
            Command::Close { tx, cancel } => self.handle_close(tx, cancel),
            Command::ForceClose { tx } => self.handle_force_close(tx),
        }
    }

    fn unregister(&mut self, id: HandlerId) {
        if !self.registry.remove(id) {
            log::debug!("unregister of unknown handler {:?}", id);
        }
    }

    fn handle_ping(&mut self, tx: oneshot::Sender<Result<(), Error>>) {
        if self.conn_slot.is_some() || self.resume_pending {
            log::debug!("keepalive blocked during resumption");
            let _ = tx.send(Ok(()));
            return;
        }
        let send_in_flight = self.inflight.is_some()
            || !self.tx_buf.is_empty()
            || !self.queue.is_empty()
            || !self.nonzas.is_empty();
        if send_in_flight {
            // Ongoing traffic is keepalive enough.
            let _ = tx.send(Ok(()));
            return;
        }
        match self.sm.as_mut() {
            Some(sm) if sm.enabled => {
                if sm.outstanding_r >= 2 {
                    log::warn!("two ack requests unanswered; giving up on the peer");
                    let err = Error::Transport(TransportError::new(
                        io::ErrorKind::TimedOut,
                        "peer stopped answering ack requests",
                    ));
                    let _ = tx.send(Err(err.clone()));
                    let _ = self.events.send(PorterEvent::RemoteError(err.clone()));
                    self.teardown(err);
                    return;
                }
                sm.outstanding_r += 1;
                self.nonzas.push_back(NonzaItem::Tree(SmState::request_tree()));
                self.publish_sm();
            }
            _ => self.nonzas.push_back(NonzaItem::Raw(b" ")),
        }
        let _ = tx.send(Ok(()));
    }

    fn handle_close(
        &mut self,
        tx: oneshot::Sender<Result<(), Error>>,
        cancel: Option<super::CancelToken>,
    ) {
        if !self.running {
            let _ = tx.send(Err(Error::PorterClosed));
            return;
        }
        if !self.closing {
            self.closing = true;
            let _ = self.events.send(PorterEvent::Closing);
            // With a resumable session, anything unacked is re-sent on
            // this stream before the footer; otherwise only the queue is
            // drained.
            if let Some(sm) = self.sm.as_mut() {
                if sm.resumable {
                    let replay: Vec<QueueEntry> = sm.unacked.drain(..).collect();
                    sm.sent_count = sm.sent_acked;
                    self.queue.requeue_front(replay);
                }
            }
        }
        self.close_waiters.push((tx, cancel));
    }

    fn handle_force_close(&mut self, tx: oneshot::Sender<Result<(), Error>>) {
        let _ = self.events.send(PorterEvent::Closing);
        self.teardown(Error::ForciblyClosed);
        let _ = tx.send(Ok(()));
    }

    // ---- receive path -----------------------------------------------

    fn handle_inbound(&mut self, tree: NodeTree) {
        if tree.root().ns() == ns::SM {
            self.handle_sm_nonza(tree);
            return;
        }
        let stanza = match Stanza::from_tree(tree) {
            Ok(stanza) => stanza,
            Err(tree) => {
                log::debug!(
                    "ignoring unsupported top-level element <{}/>",
                    tree.root().name()
                );
                return;
            }
        };

        if stanza.stanza_type() == StanzaType::StreamError {
            let decoded = StreamError::from_node(stanza.root());
            log::debug!("remote stream error: {}", decoded);
            let err = Error::Stream(decoded);
            let _ = self.events.send(PorterEvent::RemoteError(err.clone()));
            self.fail_pending(&err);
            self.finish_close_waiters(Ok(()));
            self.rx = None;
            self.tx = None;
            self.running = false;
            return;
        }

        if stanza.is_sm_counted() {
            if let Some(sm) = self.sm.as_mut() {
                if sm.enabled {
                    // Counted before dispatch, so an immediate <r/> from
                    // the peer is acked against this very stanza.
                    sm.count_received();
                }
            }
            self.publish_sm();
        }

        for stanza in self.power.admit(stanza) {
            self.dispatch(stanza);
        }
    }

    fn dispatch(&mut self, stanza: Stanza) {
        let (type_, sub_type) = stanza.type_info();

        if type_ == StanzaType::Iq
            && matches!(sub_type, StanzaSubType::Result | StanzaSubType::Error)
        {
            let shared = &self.frontend.shared;
            if self.tracker.handle_reply(
                &stanza,
                &shared.full_jid,
                &shared.bare_jid,
                &shared.domain,
            ) {
                return;
            }
        }

        let from = stanza.from_jid();
        let is_from_server = match stanza.from_attr() {
            None => true,
            Some(_) => match from.as_ref() {
                Some(jid) => {
                    let shared = &self.frontend.shared;
                    jid_is_from_server(jid, &shared.full_jid, &shared.bare_jid, &shared.domain)
                }
                // Unparseable sender: matches nobody specific.
                None => false,
            },
        };

        let Some(porter) = self.frontend.upgrade() else {
            // Every handle is gone; nobody is listening anymore.
            return;
        };
        let mut handled = false;
        for handler in self.registry.iter_mut() {
            if !handler.matches_type(type_, sub_type) {
                continue;
            }
            if !handler.matches_sender(from.as_ref(), is_from_server) {
                continue;
            }
            if !handler.matches_pattern(&stanza) {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| (handler.callback)(&porter, &stanza))) {
                Ok(true) => {
                    handled = true;
                    break;
                }
                Ok(false) => (),
                Err(_) => {
                    log::error!("stanza handler panicked; treating the stanza as declined");
                }
            }
        }

        if !handled {
            log::debug!("stanza not handled");
            if stanza.is_iq_request() {
                match Stanza::iq_error(&stanza, CoreStanzaError::ServiceUnavailable, None) {
                    Ok(reply) => self.enqueue_entry(QueueEntry::untracked(Box::new(reply))),
                    Err(e) => log::warn!("failed to build the fallback IQ error: {}", e),
                }
            }
        }
    }

    // ---- stream management ------------------------------------------

    fn handle_sm_nonza(&mut self, tree: NodeTree) {
        let node = tree.root();
        match node.name() {
            "r" => {
                if let Some(sm) = self.sm.as_ref() {
                    self.nonzas.push_back(NonzaItem::Tree(sm.ack_tree()));
                } else {
                    log::warn!("<r/> received without stream management");
                }
            }
            "a" => {
                let Some(h) = node.attribute("h").and_then(|h| h.parse::<u32>().ok()) else {
                    log::warn!("<a/> without a valid h attribute");
                    return;
                };
                let result = match self.sm.as_mut() {
                    Some(sm) if sm.enabled => sm.remote_acked(h),
                    _ => Ok(()),
                };
                if let Err(ack) = result {
                    log::error!("{}", ack);
                    let stream_error = ack.to_stream_error();
                    self.enqueue_nonza(stream_error.to_tree());
                    self.closing = true;
                    self.terminate_after_flush = Some(Error::Stream(stream_error));
                }
                self.publish_sm();
            }
            "enabled" => {
                let sm = self.sm.get_or_insert_with(|| {
                    SmState::from_marker(&crate::connection::SmMarker {
                        enabled: true,
                        resumable: false,
                        id: None,
                        location: None,
                        timeout: None,
                    })
                    .expect("enabled marker always builds a state")
                });
                sm.handle_enabled(node);
                self.publish_sm();
            }
            "resumed" => {
                let previd = node.attribute("previd").unwrap_or_default().to_owned();
                let h = node.attribute("h").and_then(|h| h.parse::<u32>().ok());
                self.handle_resumed(&previd, h);
            }
            "failed" => self.handle_sm_failed(),
            other => log::warn!("ignoring unknown stream management nonza <{}/>", other),
        }
    }

    fn handle_resumed(&mut self, previd: &str, h: Option<u32>) {
        let Some(h) = h else {
            log::warn!("<resumed/> without a valid h attribute");
            return;
        };
        let result = match self.sm.as_mut() {
            Some(sm) => sm.resumed(previd, h),
            None => {
                log::warn!("<resumed/> received without stream management state");
                return;
            }
        };
        match result {
            Ok(replay) => {
                self.queue.requeue_front(replay);
                self.resume_pending = false;
                self.resume_error = None;
                let _ = self.events.send(PorterEvent::Resumed);
                // A trailing <r/> after the replayed stanzas bounds what
                // is in flight on the fresh connection.
                if let Some(sm) = self.sm.as_mut() {
                    sm.outstanding_r += 1;
                }
                self.queue.push_back(QueueEntry::nonza(SmState::request_tree()));
                self.publish_sm();
                let _ = self.events.send(PorterEvent::ResumeDone);
            }
            Err(e) => {
                log::error!("resumption failed: {}", e);
                let original = self
                    .resume_error
                    .take()
                    .unwrap_or(Error::PorterClosed);
                let _ = self.events.send(PorterEvent::ResumeFailed);
                self.fail_fatal(Error::ResumeFailed(Box::new(original)));
            }
        }
    }

    fn handle_sm_failed(&mut self) {
        if let Some(sm) = self.sm.as_mut() {
            sm.failed();
        }
        self.publish_sm();
        if self.resume_pending {
            self.resume_pending = false;
            let original = self.resume_error.take().unwrap_or(Error::PorterClosed);
            let _ = self.events.send(PorterEvent::ResumeFailed);
            self.fail_fatal(Error::ResumeFailed(Box::new(original)));
        }
    }

    // ---- stream lifecycle -------------------------------------------

    fn can_resume(&self) -> bool {
        self.reconnector.is_some()
            && self
                .sm
                .as_ref()
                .map(|sm| sm.enabled && sm.resumable)
                .unwrap_or(false)
            && !self.closing
    }

    /// The transport failed or closed underneath us.
    fn handle_stream_broken(&mut self, err: Error) {
        log::debug!("stream broke: {}", err);
        if self.can_resume() {
            self.start_resume(err);
        } else {
            let _ = self.events.send(PorterEvent::RemoteClosed);
            self.fail_fatal(err);
        }
    }

    fn handle_remote_eof(&mut self) {
        if self.closing {
            let _ = self.events.send(PorterEvent::RemoteClosed);
            self.finish_close_waiters(Ok(()));
            self.fail_pending(&Error::PorterClosed);
            self.rx = None;
            self.running = false;
            return;
        }
        let err = Error::Transport(TransportError::new(
            io::ErrorKind::ConnectionAborted,
            "peer closed the XML stream",
        ));
        if self.can_resume() {
            self.start_resume(err);
        } else {
            let _ = self.events.send(PorterEvent::RemoteClosed);
            self.fail_fatal(err);
        }
    }

    fn start_resume(&mut self, original: Error) {
        self.rx = None;
        self.tx = None;
        self.tx_buf.clear();
        self.nonzas.clear();
        // An element cut off mid-write was never fully delivered; its
        // replay is covered by the unacked queue (counted stanzas) or a
        // fresh send (everything else).
        if let Some(entry) = self.inflight.take() {
            self.queue.requeue_front(std::iter::once(entry));
        }
        self.resume_error = Some(original);
        self.resume_pending = false;
        let _ = self.events.send(PorterEvent::Resuming);

        let (slot_tx, slot_rx) = oneshot::channel();
        self.conn_slot = Some(slot_rx);
        let location = self.sm.as_ref().and_then(|sm| sm.location.clone());
        (self
            .reconnector
            .as_mut()
            .expect("can_resume checked the reconnector"))(location, slot_tx);
    }

    fn handle_new_connection(
        &mut self,
        conn: Result<XmppConnection, oneshot::error::RecvError>,
    ) {
        self.conn_slot = None;
        match conn {
            Ok(conn) => {
                let (rx, tx, _marker) = conn.split();
                self.rx = Some(rx);
                self.tx = Some(tx);
                let _ = self.events.send(PorterEvent::Reconnected);
                match self.sm.as_ref().and_then(|sm| sm.resume_tree()) {
                    Some(tree) => {
                        self.nonzas.push_back(NonzaItem::Tree(tree));
                        self.resume_pending = true;
                    }
                    None => {
                        log::warn!("reconnected but resumption is not possible anymore");
                        let original =
                            self.resume_error.take().unwrap_or(Error::PorterClosed);
                        let _ = self.events.send(PorterEvent::ResumeFailed);
                        self.fail_fatal(original);
                    }
                }
            }
            Err(_) => {
                log::debug!("reconnector dropped the connection slot");
                let original = self.resume_error.take().unwrap_or(Error::LostWorker);
                let _ = self.events.send(PorterEvent::ResumeFailed);
                self.fail_fatal(original);
            }
        }
    }

    /// Fail every pending operation with the same error.
    fn fail_pending(&mut self, err: &Error) {
        if let Some(entry) = self.inflight.take() {
            entry.set_state(SendState::Failed { error: err.clone() });
        }
        self.queue.fail_all(err);
        self.tracker.fail_all(err);
        if let Some(sm) = self.sm.as_mut() {
            for entry in sm.unacked.drain(..) {
                entry.set_state(SendState::Failed { error: err.clone() });
            }
        }
        self.nonzas.clear();
        self.tx_buf.clear();
    }

    /// Fatal end of the stream: fail everything, notify, stop.
    fn fail_fatal(&mut self, err: Error) {
        self.fail_pending(&err);
        let _ = self.events.send(PorterEvent::RemoteError(err.clone()));
        self.finish_close_waiters(Err(err));
        self.rx = None;
        self.tx = None;
        self.running = false;
    }

    /// Local teardown (force close, dropped handles).
    fn teardown(&mut self, err: Error) {
        self.fail_pending(&err);
        self.finish_close_waiters(Err(err));
        self.rx = None;
        self.tx = None;
        self.running = false;
    }

    fn finish_close_waiters(&mut self, result: Result<(), Error>) {
        for (tx, cancel) in self.close_waiters.drain(..) {
            let outcome = match cancel {
                Some(token) if token.is_cancelled() => Err(Error::Cancelled),
                _ => result.clone(),
            };
            let _ = tx.send(outcome);
        }
    }

    fn publish_sm(&self) {
        let snapshot = self
            .sm
            .as_ref()
            .map(|sm| sm.snapshot())
            .unwrap_or_default();
        *self.frontend.shared.sm.lock().unwrap() = snapshot;
    }
}
