// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! # The C2S porter
//!
//! The porter owns exactly one framed XML connection. It serialises
//! outbound stanzas in FIFO order, routes inbound stanzas to registered
//! handlers by type, sender and pattern, correlates IQ requests with
//! their responses (with spoofing checks), and runs XEP-0198 stream
//! management: ack windowing, resumption with replay, and keepalives.
//!
//! The [`Porter`] handle is cheap to clone; all work happens on a single
//! worker task it communicates with over a command channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use jid::Jid;
use tokio::sync::{broadcast, mpsc, oneshot};

use nodetree::NodeTree;

use crate::connection::XmppConnection;
use crate::error::Error;
use crate::stanza::{Stanza, StanzaSubType, StanzaType};

mod handler;
mod iq;
mod power_saving;
mod queue;
mod sm;
mod worker;

pub use self::handler::{HandlerCallback, HandlerId, SenderMatch};
pub use self::iq::IqReplyToken;
pub use self::queue::{CancelToken, SendState, SendToken};
pub use self::sm::{window, SmSnapshot, ACK_WINDOW_MAX};

use self::handler::RegisteredHandler;
use self::iq::IqTracker;
use self::queue::QueueEntry;
use self::worker::PorterWorker;

/// Produces replacement connections for stream resumption.
///
/// Called with the peer's preferred resumption location (if any) and a
/// slot to deliver the fresh, authenticated connection into. Dropping
/// the slot aborts the resumption attempt.
pub type Reconnector =
    Box<dyn FnMut(Option<String>, oneshot::Sender<XmppConnection>) + Send + 'static>;

/// Porter configuration.
#[derive(Default)]
pub struct PorterConfig {
    /// Used to obtain a new transport when a resumable stream breaks.
    /// Without one, a broken stream is fatal.
    pub reconnector: Option<Reconnector>,
}

/// Status events multicast by the porter.
#[derive(Debug, Clone)]
pub enum PorterEvent {
    /// A stanza is about to be written to the transport.
    Sending(Stanza),
    /// A clean shutdown has started.
    Closing,
    /// The remote side closed the stream.
    RemoteClosed,
    /// The stream failed; all pending operations were completed with
    /// this error.
    RemoteError(Error),
    /// A resumable stream broke; a resumption attempt is starting.
    Resuming,
    /// A replacement transport was obtained.
    Reconnected,
    /// The peer accepted resumption; unacked stanzas are being replayed.
    Resumed,
    /// Resumption was rejected or impossible.
    ResumeFailed,
    /// The resumption handshake finished.
    ResumeDone,
}

pub(crate) enum Command {
    Start,
    Send(QueueEntry),
    Register(RegisteredHandler),
    Unregister(HandlerId),
    SetPowerSaving(bool),
    Ping {
        tx: oneshot::Sender<Result<(), Error>>,
    },
    Close {
        tx: oneshot::Sender<Result<(), Error>>,
        cancel: Option<CancelToken>,
    },
    ForceClose {
        tx: oneshot::Sender<Result<(), Error>>,
    },
}

pub(crate) struct SharedState {
    pub full_jid: Jid,
    pub bare_jid: Jid,
    pub domain: String,
    pub resource: Option<String>,
    pub sm: Mutex<SmSnapshot>,
}

/// Handle to a porter. Clones address the same worker.
#[derive(Clone)]
pub struct Porter {
    cmd_tx: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<PorterEvent>,
    tracker: IqTracker,
    pub(crate) shared: Arc<SharedState>,
    next_handler_id: Arc<AtomicU64>,
}

/// The worker's view of the frontend. Holds the command channel weakly
/// so that dropping every user-held [`Porter`] shuts the worker down.
pub(crate) struct WeakHandle {
    cmd_tx: mpsc::WeakUnboundedSender<Command>,
    events: broadcast::Sender<PorterEvent>,
    tracker: IqTracker,
    shared: Arc<SharedState>,
    next_handler_id: Arc<AtomicU64>,
}

impl WeakHandle {
    pub fn upgrade(&self) -> Option<Porter> {
        Some(Porter {
            cmd_tx: self.cmd_tx.upgrade()?,
            events: self.events.clone(),
            tracker: self.tracker.clone(),
            shared: self.shared.clone(),
            next_handler_id: self.next_handler_id.clone(),
        })
    }
}

impl Porter {
    /// Wrap an established connection.
    ///
    /// `jid` is the full JID the stream is bound to; it anchors the
    /// sender classification and the IQ spoofing checks.
    pub fn new(connection: XmppConnection, jid: Jid, config: PorterConfig) -> Porter {
        let bare_jid = Jid::from(jid.to_bare());
        let domain = jid.domain().as_str().to_owned();
        let resource = jid.resource().map(|r| r.as_str().to_owned());
        let shared = Arc::new(SharedState {
            full_jid: jid,
            bare_jid,
            domain,
            resource,
            sm: Mutex::new(SmSnapshot::default()),
        });

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let tracker = IqTracker::new();

        let porter = Porter {
            cmd_tx,
            events: events.clone(),
            tracker: tracker.clone(),
            shared,
            next_handler_id: Arc::new(AtomicU64::new(1)),
        };

        PorterWorker::spawn(
            porter.downgrade(),
            connection,
            cmd_rx,
            events,
            tracker,
            config.reconnector,
        );
        porter
    }

    pub(crate) fn downgrade(&self) -> WeakHandle {
        WeakHandle {
            cmd_tx: self.cmd_tx.downgrade(),
            events: self.events.clone(),
            tracker: self.tracker.clone(),
            shared: self.shared.clone(),
            next_handler_id: self.next_handler_id.clone(),
        }
    }

    fn command(&self, cmd: Command) {
        if let Err(e) = self.cmd_tx.send(cmd) {
            // Worker is gone; terminate whatever the command carried.
            match e.0 {
                Command::Send(entry) => entry.set_state(SendState::Failed {
                    error: Error::PorterClosed,
                }),
                Command::Ping { tx } | Command::Close { tx, .. } | Command::ForceClose { tx } => {
                    let _ = tx.send(Err(Error::PorterClosed));
                }
                _ => (),
            }
        }
    }

    /// Begin receiving. Idempotent.
    pub fn start(&self) {
        self.command(Command::Start);
    }

    /// Enqueue a stanza and wait until its bytes are handed to the
    /// transport.
    pub async fn send(&self, stanza: Stanza) -> Result<(), Error> {
        self.send_tracked(stanza, None).wait().await
    }

    /// Enqueue a stanza, returning a token to observe (and via
    /// `cancel`, abort) the transmission.
    pub fn send_tracked(&self, stanza: Stanza, cancel: Option<CancelToken>) -> SendToken {
        let (entry, token) = QueueEntry::tracked(Box::new(stanza), cancel);
        self.command(Command::Send(entry));
        token
    }

    /// Send an `iq get|set` and wait for the matching response.
    ///
    /// The request id is rewritten to one unique among the outstanding
    /// requests. The returned stanza may be a `type='error'` response;
    /// decode it with [`Stanza::stanza_error`].
    pub async fn send_iq(&self, iq: Stanza) -> Result<Stanza, Error> {
        self.send_iq_tracked(iq, None)?.await
    }

    /// Like [`Porter::send_iq`], but returns the reply future without
    /// awaiting it.
    pub fn send_iq_tracked(
        &self,
        mut iq: Stanza,
        cancel: Option<CancelToken>,
    ) -> Result<IqReplyToken, Error> {
        if !iq.is_iq_request() {
            return Err(Error::NotIq);
        }
        let recipient = iq.to_jid();
        let mut reply_token = self.tracker.allocate(&mut iq, recipient);
        let (entry, send_token) = QueueEntry::tracked(Box::new(iq), cancel);
        reply_token.set_send_token(send_token);
        self.command(Command::Send(entry));
        Ok(reply_token)
    }

    /// Register a stanza handler.
    ///
    /// `type_` of `None` matches every stanza type, and a `sub_type` of
    /// [`StanzaSubType::None`] matches every sub-type. Higher priorities
    /// run first; a callback returning `true` claims the stanza.
    pub fn register_handler(
        &self,
        sender: SenderMatch,
        type_: Option<StanzaType>,
        sub_type: StanzaSubType,
        priority: i32,
        pattern: Option<NodeTree>,
        callback: impl FnMut(&Porter, &Stanza) -> bool + Send + 'static,
    ) -> HandlerId {
        let id = HandlerId(self.next_handler_id.fetch_add(1, Ordering::Relaxed));
        self.command(Command::Register(RegisteredHandler {
            id,
            type_,
            sub_type,
            sender,
            priority,
            pattern,
            callback: Box::new(callback),
        }));
        id
    }

    /// Remove a handler. The callback and its captured environment are
    /// dropped on the worker.
    pub fn unregister_handler(&self, id: HandlerId) {
        self.command(Command::Unregister(id));
    }

    /// Toggle the power-saving deferral queue. Disabling dispatches any
    /// deferred stanzas immediately.
    pub fn enable_power_saving(&self, enabled: bool) {
        self.command(Command::SetPowerSaving(enabled));
    }

    /// Flush the send queue, emit the stream footer and wait for the
    /// remote close.
    pub async fn close(&self) -> Result<(), Error> {
        self.close_cancellable(None).await
    }

    /// [`Porter::close`] with a cancellation token. Cancelling completes
    /// this future with [`Error::Cancelled`] but does not undo the
    /// shutdown once the footer is on the wire.
    pub async fn close_cancellable(&self, cancel: Option<CancelToken>) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Close { tx, cancel });
        rx.await.unwrap_or(Err(Error::LostWorker))
    }

    /// Tear the connection down immediately. Pending operations complete
    /// with [`Error::ForciblyClosed`].
    pub async fn force_close(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::ForceClose { tx });
        rx.await.unwrap_or(Err(Error::LostWorker))
    }

    /// Send a keepalive: a single whitespace byte, or `<r/>` when stream
    /// management is active. The second unanswered `<r/>` tears the
    /// connection down.
    pub async fn send_whitespace_ping(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Ping { tx });
        rx.await.unwrap_or(Err(Error::LostWorker))
    }

    /// Subscribe to status events.
    pub fn subscribe(&self) -> broadcast::Receiver<PorterEvent> {
        self.events.subscribe()
    }

    pub fn full_jid(&self) -> &Jid {
        &self.shared.full_jid
    }

    pub fn bare_jid(&self) -> &Jid {
        &self.shared.bare_jid
    }

    pub fn domain(&self) -> &str {
        &self.shared.domain
    }

    pub fn resource(&self) -> Option<&str> {
        self.shared.resource.as_deref()
    }

    /// Snapshot of the stream-management context.
    pub fn sm_snapshot(&self) -> SmSnapshot {
        self.shared.sm.lock().unwrap().clone()
    }
}
