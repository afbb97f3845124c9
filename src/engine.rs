//! The swarm controller: periodic tracker re-announce, the peer endpoint
//! queue, the fixed worker pool, and shutdown.
//!
//! Translates the original reference implementation's single-threaded
//! `TorrentClient.start()` event loop
//! (`examples/original_source/client.py`) into the teacher's task-based
//! idiom: a fixed pool of `tokio::spawn`ed workers dequeuing endpoints from
//! a shared queue, each running a [`crate::peer::PeerSession`] to
//! completion before asking for the next one.

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

use rand::Rng;
use tokio::sync::{broadcast, Mutex, RwLock};

use crate::{
    conf::{Conf, CONTROLLER_TICK, WORKER_POLL_INTERVAL},
    disk::Disk,
    error::Result,
    metainfo::Metainfo,
    peer::PeerSession,
    piece_picker::PieceManager,
    storage_info::StorageInfo,
    torrent::SharedStatus,
    tracker::Tracker,
    PeerId,
};

/// How a download run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// Every piece was fetched, verified, and persisted.
    Completed,
    /// A shutdown signal (e.g. `SIGINT`) arrived before completion.
    Interrupted,
}

/// Generates this process's 20-byte peer id: the configured 8-byte client
/// prefix followed by 12 random decimal digits, per BEP 20.
pub(crate) fn generate_peer_id(prefix: &[u8; 8]) -> PeerId {
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(prefix);
    let mut rng = rand::thread_rng();
    for byte in id[8..].iter_mut() {
        *byte = b'0' + rng.gen_range(0..10);
    }
    id
}

/// Drives a single torrent download from metainfo to a complete,
/// verified file on disk.
pub struct Engine {
    conf: Conf,
}

impl Engine {
    pub fn new(conf: Conf) -> Self {
        Self { conf }
    }

    /// Runs the swarm controller to completion or interruption.
    pub async fn run(&self, metainfo: Metainfo) -> Result<DownloadOutcome> {
        let client_id = generate_peer_id(&self.conf.engine.client_id_prefix);

        let storage = StorageInfo::new(&metainfo, self.conf.torrent.download_dir.clone());
        let disk = Disk::new(&storage.file, storage.piece_len)?;
        let piece_picker = Arc::new(RwLock::new(PieceManager::new(&metainfo, &storage, disk)));
        let torrent = Arc::new(SharedStatus {
            info_hash: metainfo.info_hash,
            client_id,
            storage,
        });

        let tracker = Tracker::new(metainfo.announce.clone(), metainfo.info_hash, client_id);

        let endpoints: Arc<Mutex<VecDeque<SocketAddr>>> =
            Arc::new(Mutex::new(VecDeque::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, _) = broadcast::channel(1);

        let worker_count = self.conf.torrent.max_connected_peer_count;
        let mut workers = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            workers.push(tokio::spawn(worker_loop(
                id,
                Arc::clone(&torrent),
                Arc::clone(&piece_picker),
                Arc::clone(&endpoints),
                Arc::clone(&stop),
                shutdown_tx.clone(),
            )));
        }

        let outcome = self
            .announce_loop(&metainfo, &tracker, &piece_picker, &endpoints, &stop)
            .await;

        stop.store(true, Ordering::Relaxed);
        // wake any worker asleep on the shutdown broadcast; ignore the
        // error if every receiver has already been dropped
        let _ = shutdown_tx.send(());
        for worker in workers {
            let _ = worker.await;
        }

        piece_picker.read().await.close();
        log::info!("Engine stopped ({:?})", outcome);

        Ok(outcome)
    }

    /// The controller's main loop: re-announce on schedule, refill the
    /// endpoint queue, otherwise sleep. Returns once the download is
    /// complete or a `SIGINT` is observed.
    async fn announce_loop(
        &self,
        metainfo: &Metainfo,
        tracker: &Tracker,
        piece_picker: &Arc<RwLock<PieceManager>>,
        endpoints: &Arc<Mutex<VecDeque<SocketAddr>>>,
        stop: &Arc<AtomicBool>,
    ) -> DownloadOutcome {
        let mut last_announce: Option<Instant> = None;
        let mut interval = self.conf.torrent.announce_interval;
        let mut ctrl_c = Box::pin(tokio::signal::ctrl_c());

        loop {
            if piece_picker.read().await.complete() {
                return DownloadOutcome::Completed;
            }
            if stop.load(Ordering::Relaxed) {
                return DownloadOutcome::Interrupted;
            }

            let should_announce = last_announce.map_or(true, |t| t.elapsed() >= interval);
            if should_announce {
                let downloaded = piece_picker.read().await.bytes_downloaded();
                let uploaded = piece_picker.read().await.bytes_uploaded();
                let left = metainfo.total_length.saturating_sub(downloaded);

                match tracker
                    .announce(last_announce.is_none(), uploaded, downloaded, left)
                    .await
                {
                    Ok(announce) => {
                        last_announce = Some(Instant::now());
                        interval = announce.interval;
                        let mut queue = endpoints.lock().await;
                        queue.clear();
                        queue.extend(announce.peers);
                        log::info!("Tracker returned {} peers", queue.len());
                    }
                    Err(e) => {
                        log::warn!("Announce failed, retrying next tick: {}", e);
                    }
                }
            } else {
                tokio::select! {
                    _ = tokio::time::sleep(CONTROLLER_TICK) => {}
                    _ = &mut ctrl_c => {
                        log::info!("Received interrupt, shutting down");
                        return DownloadOutcome::Interrupted;
                    }
                }
            }
        }
    }
}

/// One worker's lifetime: repeatedly dequeue an endpoint, run a peer
/// session to completion, and go back for the next one.
async fn worker_loop(
    id: usize,
    torrent: Arc<SharedStatus>,
    piece_picker: Arc<RwLock<PieceManager>>,
    endpoints: Arc<Mutex<VecDeque<SocketAddr>>>,
    stop: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
) {
    while !stop.load(Ordering::Relaxed) {
        let addr = endpoints.lock().await.pop_front();
        let addr = match addr {
            Some(addr) => addr,
            None => {
                tokio::time::sleep(WORKER_POLL_INTERVAL).await;
                continue;
            }
        };

        log::debug!("Worker {} dequeued peer {}", id, addr);
        let mut session = PeerSession::outbound(
            Arc::clone(&torrent),
            Arc::clone(&piece_picker),
            addr,
            shutdown_tx.subscribe(),
        );
        if let Err(e) = session.start().await {
            log::debug!("Worker {} session with {} ended: {}", id, addr, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_has_client_prefix_and_right_length() {
        let prefix = crate::conf::CRATETORRENT_CLIENT_ID_PREFIX;
        let id = generate_peer_id(prefix);
        assert_eq!(&id[..8], prefix);
        assert_eq!(id.len(), 20);
        assert!(id[8..].iter().all(|b| b.is_ascii_digit()));
    }
}
