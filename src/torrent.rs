//! Information about the torrent being downloaded, shared read-only across
//! all of its peer sessions.

use crate::{storage_info::StorageInfo, PeerId, Sha1Hash};

/// Immutable, `Arc`-shared state describing the torrent a swarm of peer
/// sessions is cooperating to download.
pub(crate) struct SharedStatus {
    /// The torrent's info hash, sent in every handshake.
    pub info_hash: Sha1Hash,
    /// Our local peer id, sent in every handshake.
    pub client_id: PeerId,
    /// Piece geometry and output file location.
    pub storage: StorageInfo,
}
