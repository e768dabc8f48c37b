// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Provides an error type for this crate.

use core::fmt;
use std::error::Error as StdError;
use std::io;

/// Our main error type.
#[derive(Debug)]
pub enum Error {
    /// Error from rxml while parsing.
    XmlError(rxml::Error),

    /// I/O error surfaced by the parser plumbing.
    Io(io::Error),

    /// The first element of a streaming document was not
    /// `<stream:stream/>` in the stream namespace.
    InvalidStreamStart,

    /// Non-whitespace character data between stanzas.
    TextAtStreamLevel,

    /// A streaming-only operation was invoked on a non-streaming writer,
    /// or vice versa.
    WrongWriterMode,
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::XmlError(e) => Some(e),
            Error::Io(e) => Some(e),
            Error::InvalidStreamStart | Error::TextAtStreamLevel | Error::WrongWriterMode => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::XmlError(e) => write!(fmt, "XML error: {}", e),
            Error::Io(e) => write!(fmt, "I/O error: {}", e),
            Error::InvalidStreamStart => {
                write!(fmt, "stream does not start with a stream open tag")
            }
            Error::TextAtStreamLevel => {
                write!(fmt, "non-whitespace text between stanzas")
            }
            Error::WrongWriterMode => {
                write!(fmt, "operation not available in this writer mode")
            }
        }
    }
}

impl From<rxml::Error> for Error {
    fn from(err: rxml::Error) -> Error {
        Error::XmlError(err)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(err)
    }
}

/// Our simplified Result type.
pub type Result<T> = core::result::Result<T, Error>;
