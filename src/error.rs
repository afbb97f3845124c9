//! Crate-wide error type.
//!
//! Follows the manual `Display`/`From` style rather than pulling in a derive
//! crate, since nothing else in this crate does either.

use std::fmt;
use std::io;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The given path isn't a readable `.torrent` file, or its metainfo
    /// dictionary is missing a required key, malformed, or names multiple
    /// files.
    BadTorrent(String),
    /// The tracker returned a `failure reason`.
    TrackerRefused(String),
    /// The tracker could not be reached at all (connection, timeout, non-200
    /// status).
    TrackerUnreachable(String),
    /// The tracker's peer list isn't in compact (binary) form.
    UnsupportedPeerFormat,
    /// The peer's handshake was malformed or advertised the wrong info hash.
    HandshakeFailed(String),
    /// The peer violated the wire protocol (e.g. a second bitfield, a
    /// bitfield of the wrong length, an oversized message).
    ProtocolViolation(String),
    /// A completed piece's hash didn't match the metainfo's declared digest.
    BlockMismatch,
    /// The piece index passed to a piece-manager or disk operation is out of
    /// range.
    InvalidPieceIndex,
    /// Disk IO failure while writing the output file.
    Io(io::Error),
    /// Bencode (de)serialization failure.
    Bencode(serde_bencode::Error),
    /// HTTP transport failure while talking to the tracker.
    Http(reqwest::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BadTorrent(msg) => write!(f, "bad torrent: {}", msg),
            Error::TrackerRefused(reason) => {
                write!(f, "tracker refused announce: {}", reason)
            }
            Error::TrackerUnreachable(msg) => {
                write!(f, "tracker unreachable: {}", msg)
            }
            Error::UnsupportedPeerFormat => {
                write!(f, "tracker returned a dictionary-model peer list")
            }
            Error::HandshakeFailed(msg) => write!(f, "handshake failed: {}", msg),
            Error::ProtocolViolation(msg) => {
                write!(f, "peer protocol violation: {}", msg)
            }
            Error::BlockMismatch => write!(f, "piece hash mismatch"),
            Error::InvalidPieceIndex => write!(f, "invalid piece index"),
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::Bencode(e) => write!(f, "bencode error: {}", e),
            Error::Http(e) => write!(f, "http error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Error::Bencode(e)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e)
    }
}
