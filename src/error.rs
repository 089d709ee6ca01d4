//! Crate-wide error taxonomy.
//!
//! OS-facing failures stay as `std::io::Error` wherever a POSIX errno maps
//! cleanly onto one; everything this crate adds on top (framing errors,
//! connector/timer misuse) gets its own variant. Invariant violations
//! (wrong-thread mutation, double-start) are `assert!`/`debug_assert!`
//! panics rather than `Result` values, matching the "programmer error is
//! fatal" policy.

use std::fmt;
use std::io;

use thiserror::Error;

/// Framing-error taxonomy for the codec layer (spec §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingError {
    InvalidLength,
    CheckSumError,
    InvalidNameLen,
    UnknownMessageType,
    ParseError,
}

impl fmt::Display for FramingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FramingError::InvalidLength => "invalid length prefix",
            FramingError::CheckSumError => "crc32 checksum mismatch",
            FramingError::InvalidNameLen => "invalid message type name length",
            FramingError::UnknownMessageType => "unknown message type",
            FramingError::ParseError => "failed to parse message payload",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("framing error: {0}")]
    Framing(#[source] FramingErrorWrapper),

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("connector stopped")]
    ConnectorStopped,

    #[error("event loop pool already started")]
    PoolAlreadyStarted,

    #[error("timer already fired or cancelled")]
    TimerNotFound,
}

/// `FramingError` has no `std::error::Error` impl of its own (it is a
/// plain enum reused across the codec layer); this newtype gives
/// `thiserror`'s `#[source]` something to wrap.
#[derive(Debug)]
pub struct FramingErrorWrapper(pub FramingError);

impl fmt::Display for FramingErrorWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for FramingErrorWrapper {}

impl From<FramingError> for Error {
    fn from(e: FramingError) -> Self {
        Error::Framing(FramingErrorWrapper(e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
