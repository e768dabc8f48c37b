// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! tokio-porter is an asynchronous XMPP client-to-server core for Rust.
//!
//! It takes an authenticated, framed XML stream (produced by an external
//! connector) and turns it into a reliable, dispatchable flow of typed
//! stanzas:
//!
//! - [`Stanza`]: typed wrapper over a [`nodetree::NodeTree`] with the
//!   closed type/sub-type matrix and IQ reply builders.
//! - [`xmpp_error`]: the RFC 6120 stanza and stream error taxonomies,
//!   including the XEP-0086 legacy-code mapping.
//! - [`Porter`]: the per-connection dispatcher: FIFO send queue, handler
//!   registry with priorities and subset patterns, IQ correlation with
//!   spoofing checks, power-saving deferral, and XEP-0198 stream
//!   management (ack windowing, resumption with replay, keepalives).
//! - [`caps`] / [`data_form`] / [`caps_cache`]: the deterministic
//!   disco#info serialisation backing XEP-0115 entity capabilities.
//! - [`Session`] / [`ContactFactory`]: glue binding a porter to contact
//!   objects.

#![forbid(unsafe_code)]

pub mod caps;
pub mod caps_cache;
mod connection;
pub mod contact;
pub mod data_form;
mod error;
mod porter;
mod session;
mod stanza;
pub mod xmpp_error;

pub use nodetree;

pub use crate::connection::{AsyncReadAndWrite, BoxTransport, SmMarker, XmppConnection};
pub use crate::contact::{BareContact, ContactFactory, ResourceContact};
pub use crate::error::{Error, TransportError};
pub use crate::porter::{
    window, CancelToken, HandlerCallback, HandlerId, IqReplyToken, Porter, PorterConfig,
    PorterEvent, Reconnector, SendState, SendToken, SenderMatch, SmSnapshot, ACK_WINDOW_MAX,
};
pub use crate::session::Session;
pub use crate::stanza::{Stanza, StanzaSubType, StanzaType};

/// The JID type used throughout the crate.
pub use jid::Jid;
