//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

/// The 8-byte client identifier prefixed to the randomly generated suffix of
/// our peer id (see [`crate::engine::generate_peer_id`]).
pub const CRATETORRENT_CLIENT_ID_PREFIX: &[u8; 8] = b"-CT0001-";

/// The TCP port we report to the tracker in the announce query. We never
/// listen on it since this client never seeds.
pub(crate) const ANNOUNCE_PORT: u16 = 6889;

/// The maximum number of concurrently connected peers.
pub(crate) const MAX_WORKERS: usize = 40;

/// How long a pending block request may go unanswered before it is eligible
/// for re-request.
pub(crate) const MAX_PENDING_MS: u64 = 300_000;

/// How often the swarm controller wakes up to check whether it's time to
/// re-announce, in the absence of any other event.
pub(crate) const CONTROLLER_TICK: Duration = Duration::from_secs(5);

/// How long we wait for a TCP connection to a peer to complete.
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long we wait for the peer's handshake after sending ours.
pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long we wait for any single message once a session is established,
/// before considering the peer unresponsive.
pub(crate) const READ_TIMEOUT: Duration = Duration::from_secs(120);

/// How often a session retries `next_request` after getting back `None`
/// (nothing useful to request yet, e.g. waiting on other peers' ongoing
/// pieces or a piece manager not yet populated).
pub(crate) const REQUEST_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// How often an idle worker checks the peer endpoint queue for new work.
pub(crate) const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// The global configuration for the engine and the torrent it's driving.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the configuration with reasonable defaults, except for the
    /// download directory, as it is not sensible to guess that for the user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf::default(),
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The 8-byte prefix of our peer id, identifying this client
    /// implementation to the swarm. The remaining 12 bytes are randomly
    /// generated at process start (see [`crate::engine::generate_peer_id`]).
    pub client_id_prefix: [u8; 8],
}

impl Default for EngineConf {
    fn default() -> Self {
        Self {
            client_id_prefix: *CRATETORRENT_CLIENT_ID_PREFIX,
        }
    }
}

/// Configuration for a torrent download.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory the downloaded file is placed in.
    pub download_dir: PathBuf,

    /// The number of concurrently connected peers the swarm controller
    /// maintains, at most.
    pub max_connected_peer_count: usize,

    /// If the tracker doesn't provide a minimum announce interval, we default
    /// to announcing every 30 minutes.
    pub announce_interval: Duration,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            // matches spec.md's MAX_WORKERS
            max_connected_peer_count: MAX_WORKERS,
            announce_interval: Duration::from_secs(30 * 60),
        }
    }
}
