//! Owns the block/piece state lattice: which pieces are missing, in
//! progress, or verified and on disk, and which block a given peer should
//! be asked for next.
//!
//! Generalizes the teacher's availability-only `PiecePicker` into the full
//! request-scheduling state machine, following the shape of the original
//! reference implementation's `PieceManager`/`Piece`/`Block` classes
//! (`examples/original_source/client.py`).

use std::time::{SystemTime, UNIX_EPOCH};

use sha1::{Digest, Sha1};

use crate::{
    block_count, block_len,
    conf::MAX_PENDING_MS,
    disk::Disk,
    error::{Error, Result},
    metainfo::Metainfo,
    storage_info::StorageInfo,
    Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BlockStatus {
    Missing,
    Pending,
    Retrieved,
}

#[derive(Debug)]
struct Block {
    info: BlockInfo,
    status: BlockStatus,
    data: Option<Vec<u8>>,
}

#[derive(Debug)]
struct Piece {
    index: PieceIndex,
    expected_hash: Sha1Hash,
    /// Blocks in ascending offset order, tiling `[0, piece_len)`.
    blocks: Vec<Block>,
}

impl Piece {
    fn new(index: PieceIndex, expected_hash: Sha1Hash, piece_len: u32) -> Self {
        let count = block_count(piece_len);
        let blocks = (0..count)
            .map(|i| Block {
                info: BlockInfo {
                    piece_index: index,
                    offset: i as u32 * crate::REQUEST_SIZE,
                    len: block_len(piece_len, i),
                },
                status: BlockStatus::Missing,
                data: None,
            })
            .collect();
        Self {
            index,
            expected_hash,
            blocks,
        }
    }

    fn is_complete(&self) -> bool {
        self.blocks.iter().all(|b| b.status == BlockStatus::Retrieved)
    }

    /// Marks the first `Missing` block `Pending` and returns its info.
    fn next_missing_block(&mut self) -> Option<BlockInfo> {
        let block = self
            .blocks
            .iter_mut()
            .find(|b| b.status == BlockStatus::Missing)?;
        block.status = BlockStatus::Pending;
        Some(block.info)
    }

    fn block_received(&mut self, offset: u32, data: Vec<u8>) {
        match self.blocks.iter_mut().find(|b| b.info.offset == offset) {
            Some(block) => {
                block.status = BlockStatus::Retrieved;
                block.data = Some(data);
            }
            None => {
                log::warn!(
                    "Received non-existing block at offset {} in piece {}",
                    offset,
                    self.index
                );
            }
        }
    }

    fn reset(&mut self) {
        for block in self.blocks.iter_mut() {
            block.status = BlockStatus::Missing;
            block.data = None;
        }
    }

    fn concat_data(&self) -> Vec<u8> {
        debug_assert!(self.is_complete());
        let mut data = Vec::with_capacity(
            self.blocks.iter().map(|b| b.info.len as usize).sum(),
        );
        for block in self.blocks.iter() {
            data.extend_from_slice(
                block.data.as_ref().expect("retrieved block missing data"),
            );
        }
        data
    }

    fn matches_hash(&self) -> bool {
        let data = self.concat_data();
        let digest = Sha1::digest(&data);
        digest.as_slice() == self.expected_hash
    }
}

struct PendingRequest {
    piece_index: PieceIndex,
    offset: u32,
    issued_at_ms: u64,
}

/// Owns the per-block and per-piece state for a single torrent download,
/// and decides which block a peer should be asked for next.
pub(crate) struct PieceManager {
    piece_len: u32,
    piece_count: usize,
    peers: std::collections::HashMap<PeerId, Bitfield>,
    missing: Vec<Piece>,
    ongoing: Vec<Piece>,
    have: std::collections::HashSet<PieceIndex>,
    pending: Vec<PendingRequest>,
    disk: Disk,
}

impl PieceManager {
    pub fn new(metainfo: &Metainfo, storage: &StorageInfo, disk: Disk) -> Self {
        let missing = metainfo
            .pieces
            .iter()
            .enumerate()
            .map(|(index, hash)| {
                Piece::new(index, *hash, storage.piece_len(index).unwrap())
            })
            .collect();
        Self {
            piece_len: storage.piece_len,
            piece_count: storage.piece_count,
            peers: std::collections::HashMap::new(),
            missing,
            ongoing: Vec::new(),
            have: std::collections::HashSet::new(),
            pending: Vec::new(),
            disk,
        }
    }

    /// Installs a new peer's availability map.
    pub fn add_peer(&mut self, peer_id: PeerId, bitfield: Bitfield) -> Result<()> {
        if bitfield.len() != self.piece_count {
            return Err(Error::ProtocolViolation(format!(
                "bitfield length {} doesn't match piece count {}",
                bitfield.len(),
                self.piece_count
            )));
        }
        self.peers.insert(peer_id, bitfield);
        Ok(())
    }

    /// Marks a single piece as available for a peer. No-op for an unknown
    /// peer.
    pub fn update_peer(&mut self, peer_id: &PeerId, piece_index: PieceIndex) {
        if let Some(bitfield) = self.peers.get_mut(peer_id) {
            if piece_index < bitfield.len() {
                bitfield.set(piece_index, true);
            }
        }
    }

    /// Drops a peer's availability map.
    pub fn remove_peer(&mut self, peer_id: &PeerId) {
        self.peers.remove(peer_id);
    }

    /// Picks the next block `peer_id` should be asked for, if any.
    pub fn next_request(&mut self, peer_id: &PeerId) -> Option<BlockInfo> {
        if !self.peers.contains_key(peer_id) {
            return None;
        }

        if let Some(block) = self.expired_request(peer_id) {
            return Some(block);
        }
        if let Some(block) = self.next_ongoing(peer_id) {
            return Some(block);
        }
        self.next_from_rarest(peer_id)
    }

    fn peer_has(&self, peer_id: &PeerId, index: PieceIndex) -> bool {
        self.peers
            .get(peer_id)
            .and_then(|bitfield| bitfield.get(index))
            .map(|has| *has)
            .unwrap_or(false)
    }

    fn expired_request(&mut self, peer_id: &PeerId) -> Option<BlockInfo> {
        let now = now_ms();
        for req in self.pending.iter_mut() {
            if self.peers.get(peer_id).and_then(|b| b.get(req.piece_index)).map(|h| *h).unwrap_or(false)
                && now.saturating_sub(req.issued_at_ms) > MAX_PENDING_MS
            {
                log::info!(
                    "Re-requesting block {} of piece {}",
                    req.offset,
                    req.piece_index
                );
                req.issued_at_ms = now;
                let len = self
                    .ongoing
                    .iter()
                    .find(|p| p.index == req.piece_index)
                    .and_then(|p| {
                        p.blocks.iter().find(|b| b.info.offset == req.offset)
                    })
                    .map(|b| b.info.len)
                    .unwrap_or(crate::REQUEST_SIZE);
                return Some(BlockInfo {
                    piece_index: req.piece_index,
                    offset: req.offset,
                    len,
                });
            }
        }
        None
    }

    fn next_ongoing(&mut self, peer_id: &PeerId) -> Option<BlockInfo> {
        for piece in self.ongoing.iter_mut() {
            let has = self
                .peers
                .get(peer_id)
                .and_then(|b| b.get(piece.index))
                .map(|h| *h)
                .unwrap_or(false);
            if !has {
                continue;
            }
            if let Some(block) = piece.next_missing_block() {
                self.pending.push(PendingRequest {
                    piece_index: block.piece_index,
                    offset: block.offset,
                    issued_at_ms: now_ms(),
                });
                return Some(block);
            }
        }
        None
    }

    fn next_from_rarest(&mut self, peer_id: &PeerId) -> Option<BlockInfo> {
        let candidate_pos = self
            .missing
            .iter()
            .enumerate()
            .filter(|(_, piece)| self.peer_has(peer_id, piece.index))
            .map(|(pos, piece)| {
                let count = self
                    .peers
                    .values()
                    .filter(|bitfield| {
                        bitfield.get(piece.index).map(|h| *h).unwrap_or(false)
                    })
                    .count();
                (pos, count)
            })
            .min_by_key(|(_, count)| *count)
            .map(|(pos, _)| pos)?;

        let mut piece = self.missing.remove(candidate_pos);
        let block = piece.next_missing_block();
        self.ongoing.push(piece);
        block
    }

    /// Registers a received block, persisting and verifying its piece once
    /// complete.
    pub async fn block_received(
        &mut self,
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<()> {
        self.pending
            .retain(|r| !(r.piece_index == piece_index && r.offset == offset));

        let pos = match self.ongoing.iter().position(|p| p.index == piece_index) {
            Some(pos) => pos,
            None => {
                log::warn!(
                    "Received block for piece {} which isn't ongoing",
                    piece_index
                );
                return Ok(());
            }
        };

        self.ongoing[pos].block_received(offset, data);

        if !self.ongoing[pos].is_complete() {
            return Ok(());
        }

        if self.ongoing[pos].matches_hash() {
            let piece = self.ongoing.remove(pos);
            log::info!("Piece {} verified", piece.index);
            let data = piece.concat_data();
            self.disk.write_piece(piece.index, data).await?;
            self.have.insert(piece.index);
        } else {
            log::warn!("Discarding corrupt piece {}", self.ongoing[pos].index);
            self.ongoing[pos].reset();
        }

        Ok(())
    }

    /// Total verified bytes, per spec.md's `|have| * piece_length` formula.
    pub fn bytes_downloaded(&self) -> u64 {
        self.have.len() as u64 * self.piece_len as u64
    }

    /// We never seed.
    pub fn bytes_uploaded(&self) -> u64 {
        0
    }

    pub fn complete(&self) -> bool {
        self.have.len() == self.piece_count
    }

    /// Releases the output file handle. A no-op beyond logging, since the
    /// file is closed when `Disk` is dropped along with `self`.
    pub fn close(&self) {
        log::info!("Closing piece manager");
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn manager(piece_len: u32, total_len: u64, pieces: Vec<Sha1Hash>) -> PieceManager {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let metainfo = Metainfo {
            announce: "http://x.test/".into(),
            info_hash: [0; 20],
            piece_length: piece_len as u64,
            total_length: total_len,
            pieces,
            output_name: format!("cratetorrent-leech-test-{}.bin", id),
        };
        let storage = StorageInfo::new(&metainfo, PathBuf::from(std::env::temp_dir()));
        let disk =
            Disk::new(&storage.file, storage.piece_len).expect("open output file");
        PieceManager::new(&metainfo, &storage, disk)
    }

    fn seed_bitfield(have: &[usize], len: usize) -> Bitfield {
        let byte_len = (len + 7) / 8;
        let mut bitfield = Bitfield::from_vec(vec![0u8; byte_len]);
        bitfield.resize(len, false);
        for &i in have {
            bitfield.set(i, true);
        }
        bitfield
    }

    #[test]
    fn rarest_first_picks_least_available_piece() {
        // S2: three missing pieces {0,1,2}; A has {0,1}, B has {1,2}, C has {1}.
        let hash = [0; 20];
        let mut mgr = manager(4, 4 * 3, vec![hash, hash, hash]);
        let a: PeerId = [1; 20];
        let b: PeerId = [2; 20];
        let c: PeerId = [3; 20];
        mgr.add_peer(a, seed_bitfield(&[0, 1], 3)).unwrap();
        mgr.add_peer(b, seed_bitfield(&[1, 2], 3)).unwrap();
        mgr.add_peer(c, seed_bitfield(&[1], 3)).unwrap();

        let first = mgr.next_request(&a).unwrap();
        assert_eq!(first.piece_index, 0);
        let second = mgr.next_request(&b).unwrap();
        assert_eq!(second.piece_index, 2);
    }

    #[test]
    fn expiry_forces_rerequest_after_deadline() {
        let hash = [0; 20];
        let mut mgr = manager(4, 4, vec![hash]);
        let peer: PeerId = [1; 20];
        mgr.add_peer(peer, seed_bitfield(&[0], 1)).unwrap();
        let first = mgr.next_request(&peer).unwrap();
        assert_eq!(first.offset, 0);
        mgr.pending[0].issued_at_ms = now_ms() - MAX_PENDING_MS - 1;
        let reissued = mgr.next_request(&peer).unwrap();
        assert_eq!(reissued.offset, 0);
    }

    #[test]
    fn pending_request_not_reissued_before_deadline() {
        let hash = [0; 20];
        let mut mgr = manager(4, 4, vec![hash]);
        let peer: PeerId = [1; 20];
        mgr.add_peer(peer, seed_bitfield(&[0], 1)).unwrap();
        let first = mgr.next_request(&peer).unwrap();
        assert_eq!(first.offset, 0);
        // request just issued, nowhere near MAX_PENDING_MS: nothing else to
        // hand back
        assert!(mgr.next_request(&peer).is_none());
    }

    #[test]
    fn removing_peer_changes_rarest_first_pick() {
        // S5: three missing pieces {0,1,2}; R has all three, X has {0,2}.
        // Piece 1 is rarest while X is connected, since only R has it.
        let hash = [0; 20];
        let mut mgr = manager(4, 4 * 3, vec![hash, hash, hash]);
        let r: PeerId = [1; 20];
        let x: PeerId = [2; 20];
        mgr.add_peer(r, seed_bitfield(&[0, 1, 2], 3)).unwrap();
        mgr.add_peer(x, seed_bitfield(&[0, 2], 3)).unwrap();

        let first = mgr.next_request(&r).unwrap();
        assert_eq!(first.piece_index, 1);

        mgr.remove_peer(&x);

        // with x gone, pieces 0 and 2 are tied at count 1; first-seen order
        // in `missing` wins
        let second = mgr.next_request(&r).unwrap();
        assert_eq!(second.piece_index, 0);
    }

    #[test]
    fn invalid_bitfield_length_is_rejected() {
        let hash = [0; 20];
        let mut mgr = manager(4, 4, vec![hash]);
        let peer: PeerId = [1; 20];
        assert!(mgr.add_peer(peer, seed_bitfield(&[], 2)).is_err());
    }

    #[tokio::test]
    async fn hash_mismatch_resets_piece_to_missing() {
        let data = b"helloworld";
        let good_hash = Sha1::digest(data);
        let mut expected = [0; 20];
        expected.copy_from_slice(&good_hash);
        let mut mgr = manager(10, 10, vec![expected]);
        let peer: PeerId = [1; 20];
        mgr.add_peer(peer, seed_bitfield(&[0], 1)).unwrap();
        mgr.next_request(&peer).unwrap();
        mgr.block_received(0, 0, b"wrongbytes".to_vec()).await.unwrap();
        assert!(!mgr.complete());
        assert_eq!(mgr.ongoing.len(), 1);
        assert!(mgr.ongoing[0]
            .blocks
            .iter()
            .all(|b| b.status == BlockStatus::Missing));
    }

    #[tokio::test]
    async fn complete_piece_is_verified_and_moved_to_have() {
        let data = b"helloworld";
        let digest = Sha1::digest(data);
        let mut expected = [0; 20];
        expected.copy_from_slice(&digest);
        let mut mgr = manager(10, 10, vec![expected]);
        let peer: PeerId = [1; 20];
        mgr.add_peer(peer, seed_bitfield(&[0], 1)).unwrap();
        mgr.next_request(&peer).unwrap();
        mgr.block_received(0, 0, data.to_vec()).await.unwrap();
        assert!(mgr.complete());
        assert_eq!(mgr.bytes_downloaded(), 10);
    }
}
