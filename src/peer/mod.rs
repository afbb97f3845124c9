//! A single peer connection's lifetime: handshake, availability exchange,
//! and the stop-and-wait request loop.

mod codec;
mod session;

pub(crate) use session::PeerSession;
