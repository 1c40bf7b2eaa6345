//! Error types for tun-relay.

use std::io;

use thiserror::Error;

/// Result type alias using the crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// A malformed, truncated or unsupported packet header.
///
/// Header errors abort processing of the offending packet only. They never affect other sessions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("truncated {what}: need {need} bytes, have {have}")]
    Truncated {
        what: &'static str,
        need: usize,
        have: usize,
    },

    #[error("invalid {what} version: expected {expected}, got {actual}")]
    InvalidVersion {
        what: &'static str,
        expected: u8,
        actual: u8,
    },

    #[error("unknown IP version {0}")]
    UnknownIpVersion(u8),

    #[error("malformed header: {0}")]
    Malformed(&'static str),

    #[error("unsupported ICMP type {icmp_type}, only echo requests are supported")]
    UnsupportedIcmp { icmp_type: u8 },

    #[error("cannot serialize ICMP type {icmp_type} as a reply")]
    NotAnEcho { icmp_type: u8 },
}

impl PacketError {
    pub(crate) fn truncated(what: &'static str, need: usize, have: usize) -> Self {
        Self::Truncated { what, need, have }
    }
}

/// Errors that can occur while running the relay.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}
