// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Error types for the porter layer.
//!
//! Failures of a stream fan out to every pending future on it, so the
//! error type is `Clone`; transport errors are captured as kind + message
//! rather than as the original `io::Error`.

use core::fmt;
use std::error::Error as StdError;
use std::io;

use crate::xmpp_error::{StanzaError, StreamError};

/// An I/O error reduced to a cloneable kind + message pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    kind: io::ErrorKind,
    message: String,
}

impl TransportError {
    pub fn new(kind: io::ErrorKind, message: impl Into<String>) -> TransportError {
        TransportError {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> io::ErrorKind {
        self.kind
    }

    pub fn into_io_error(self) -> io::Error {
        io::Error::new(self.kind, self.message)
    }
}

impl From<io::Error> for TransportError {
    fn from(other: io::Error) -> Self {
        Self {
            kind: other.kind(),
            message: other.to_string(),
        }
    }
}

impl From<&io::Error> for TransportError {
    fn from(other: &io::Error) -> Self {
        Self {
            kind: other.kind(),
            message: other.to_string(),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl StdError for TransportError {}

/// Top-level error type of the crate.
#[derive(Debug, Clone)]
pub enum Error {
    /// The porter is shutting down; the operation never touched the wire.
    PorterClosing,

    /// The porter has finished shutting down.
    PorterClosed,

    /// The operation requires a started porter.
    PorterNotStarted,

    /// The porter was torn down by `force_close` while the operation was
    /// pending.
    ForciblyClosed,

    /// An IQ-only operation was invoked with a stanza that is not an
    /// `iq get|set`.
    NotIq,

    /// A stanza was constructed with a sub-type that is not declared
    /// against its type.
    InvalidSubType,

    /// The operation was cancelled before its bytes were committed.
    Cancelled,

    /// A decoded XMPP stanza error. Only ever surfaced to the IQ future
    /// awaiting the response it arrived in; never fatal to the stream.
    Stanza(StanzaError),

    /// A decoded XMPP stream error. Always fatal to the stream.
    Stream(StreamError),

    /// The reader could not parse the inbound byte stream. Fatal.
    Parse(String),

    /// The first element of the inbound stream was not a stream open tag.
    InvalidStreamStart,

    /// Stream management resumption was rejected by the peer.
    ResumeFailed(Box<Error>),

    /// I/O failure on the underlying transport.
    Transport(TransportError),

    /// The porter's worker task is gone.
    LostWorker,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::PorterClosing => write!(f, "porter is closing"),
            Error::PorterClosed => write!(f, "porter is closed"),
            Error::PorterNotStarted => write!(f, "porter is not started"),
            Error::ForciblyClosed => write!(f, "porter was forcibly closed"),
            Error::NotIq => write!(f, "stanza is not an IQ request"),
            Error::InvalidSubType => {
                write!(f, "sub-type is not legal for this stanza type")
            }
            Error::Cancelled => write!(f, "operation was cancelled"),
            Error::Stanza(e) => write!(f, "stanza error: {}", e),
            Error::Stream(e) => write!(f, "stream error: {}", e),
            Error::Parse(msg) => write!(f, "parse error: {}", msg),
            Error::InvalidStreamStart => {
                write!(f, "stream does not start with a stream open tag")
            }
            Error::ResumeFailed(e) => write!(f, "stream resumption failed: {}", e),
            Error::Transport(e) => write!(f, "transport error: {}", e),
            Error::LostWorker => write!(f, "porter worker is gone"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Stanza(e) => Some(e),
            Error::Stream(e) => Some(e),
            Error::Transport(e) => Some(e),
            Error::ResumeFailed(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(other: io::Error) -> Error {
        Error::Transport(other.into())
    }
}

impl From<StanzaError> for Error {
    fn from(other: StanzaError) -> Error {
        Error::Stanza(other)
    }
}

impl From<StreamError> for Error {
    fn from(other: StreamError) -> Error {
        Error::Stream(other)
    }
}

impl From<nodetree::Error> for Error {
    fn from(other: nodetree::Error) -> Error {
        match other {
            nodetree::Error::InvalidStreamStart => Error::InvalidStreamStart,
            other => Error::Parse(other.to_string()),
        }
    }
}
