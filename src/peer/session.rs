//! One peer connection's lifetime, generalized from the teacher's
//! `peer.rs` `PeerSession` (command channel, `Status`/`State` shape, the
//! handshake-then-message codec swap via `FramedParts`) down to the
//! stop-and-wait request discipline: at most one outstanding REQUEST at a
//! time, driven by the shared piece manager rather than a per-session
//! download pipeline.

use std::{net::SocketAddr, sync::Arc};

use futures::{select, stream::SplitSink, FutureExt, SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::{broadcast, RwLock},
    time,
};
use tokio_util::codec::{Framed, FramedParts};

use super::codec::{Handshake, HandshakeCodec, Message, PeerCodec, PROTOCOL_STRING};
use crate::{
    conf::{CONNECT_TIMEOUT, HANDSHAKE_TIMEOUT, READ_TIMEOUT, REQUEST_RETRY_INTERVAL},
    error::{Error, Result},
    piece_picker::PieceManager,
    torrent::SharedStatus,
    BlockInfo, PeerId,
};

/// At any given time a connection is in one of the below states.
#[derive(Clone, Copy, Debug, PartialEq)]
enum State {
    Connecting,
    Handshaking,
    /// Waiting for the peer's first non-keepalive message, which must be a
    /// bitfield (or, absent one, we treat the peer as having nothing until
    /// the first HAVE arrives).
    AvailabilityExchange,
    Connected,
}

/// Session-local protocol bookkeeping: our view of the choke/interest state
/// on both ends of the connection.
#[derive(Clone, Copy, Debug)]
struct Status {
    state: State,
    /// Whether the remote peer is choking us (initially true).
    is_choked: bool,
    /// Whether we've told the remote peer we're interested.
    is_interested: bool,
    /// Whether we are choking the remote peer (we never unchoke; we don't
    /// seed).
    is_peer_choked: bool,
    /// Whether the remote peer has told us it's interested in us.
    is_peer_interested: bool,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: State::Connecting,
            is_choked: true,
            is_interested: false,
            is_peer_choked: true,
            is_peer_interested: false,
        }
    }
}

pub(crate) struct PeerSession {
    torrent: Arc<SharedStatus>,
    piece_picker: Arc<RwLock<PieceManager>>,
    /// Broadcasts a single shutdown signal from the swarm controller to
    /// every live session; each session holds its own subscription.
    shutdown: broadcast::Receiver<()>,
    addr: SocketAddr,
    status: Status,
    /// The remote peer's 20-byte id, set once the handshake completes.
    peer_id: Option<PeerId>,
    /// The single request we're currently waiting on a PIECE for, per the
    /// stop-and-wait discipline: at most one outstanding REQUEST at a time.
    outstanding_request: Option<BlockInfo>,
}

impl PeerSession {
    /// Creates a new outbound session with the peer at `addr`.
    pub fn outbound(
        torrent: Arc<SharedStatus>,
        piece_picker: Arc<RwLock<PieceManager>>,
        addr: SocketAddr,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            torrent,
            piece_picker,
            shutdown,
            addr,
            status: Status::default(),
            peer_id: None,
            outstanding_request: None,
        }
    }

    /// Connects to the peer, performs the handshake, and runs the session
    /// until it ends (peer disconnect, protocol violation, or a shutdown
    /// command).
    pub async fn start(&mut self) -> Result<()> {
        log::info!("Starting peer {} session", self.addr);

        self.status.state = State::Connecting;
        let socket = time::timeout(CONNECT_TIMEOUT, TcpStream::connect(self.addr))
            .await
            .map_err(|_| Error::HandshakeFailed("connect timed out".into()))??;
        log::info!("Connected to peer {}", self.addr);

        let mut socket = Framed::new(socket, HandshakeCodec);

        self.status.state = State::Handshaking;
        let handshake = Handshake::new(self.torrent.info_hash, self.torrent.client_id);
        socket.send(handshake).await?;

        let peer_handshake = time::timeout(HANDSHAKE_TIMEOUT, socket.next())
            .await
            .map_err(|_| Error::HandshakeFailed("peer handshake timed out".into()))?
            .ok_or_else(|| Error::HandshakeFailed("peer closed before handshaking".into()))??;

        debug_assert_eq!(peer_handshake.prot, PROTOCOL_STRING.as_bytes());
        if peer_handshake.info_hash != self.torrent.info_hash {
            return Err(Error::HandshakeFailed(
                "peer advertised the wrong info hash".into(),
            ));
        }
        self.peer_id = Some(peer_handshake.peer_id);
        log::info!("Peer {} handshake ok", self.addr);

        // switch from the fixed-size handshake codec to the length-prefixed
        // message codec, carrying over any buffered bytes the peer may have
        // sent directly after its handshake
        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);

        self.status.state = State::AvailabilityExchange;
        self.run(socket).await
    }

    async fn run(&mut self, socket: Framed<TcpStream, PeerCodec>) -> Result<()> {
        let (mut sink, stream) = socket.split();
        let mut stream = stream.fuse();
        let mut retry_timer = time::interval(REQUEST_RETRY_INTERVAL).fuse();

        loop {
            select! {
                msg = time::timeout(READ_TIMEOUT, stream.select_next_some()).fuse() => {
                    let msg = msg.map_err(|_| Error::ProtocolViolation("read timed out".into()))??;
                    self.handle_msg(&mut sink, msg).await?;
                }
                _ = retry_timer.next() => {
                    self.try_request(&mut sink).await?;
                }
                _ = self.shutdown.recv().fuse() => {
                    log::info!("Shutting down peer {} session", self.addr);
                    break;
                }
                complete => break,
            }

            if self.piece_manager_complete().await {
                log::info!("Torrent complete, closing peer {} session", self.addr);
                break;
            }
        }

        if let Some(peer_id) = self.peer_id {
            self.piece_picker.write().await.remove_peer(&peer_id);
        }

        Ok(())
    }

    async fn piece_manager_complete(&self) -> bool {
        self.piece_picker.read().await.complete()
    }

    async fn handle_msg(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        msg: Message,
    ) -> Result<()> {
        if self.status.state == State::AvailabilityExchange {
            return self.handle_availability_msg(sink, msg).await;
        }

        match msg {
            Message::KeepAlive => {}
            Message::Bitfield(_) => {
                return Err(Error::ProtocolViolation(
                    "bitfield sent outside availability exchange".into(),
                ));
            }
            Message::Choke => {
                if !self.status.is_choked {
                    log::info!("Peer {} choked us", self.addr);
                    self.status.is_choked = true;
                    self.outstanding_request = None;
                }
            }
            Message::Unchoke => {
                if self.status.is_choked {
                    log::info!("Peer {} unchoked us", self.addr);
                    self.status.is_choked = false;
                    self.try_request(sink).await?;
                }
            }
            Message::Interested => {
                self.status.is_peer_interested = true;
            }
            Message::NotInterested => {
                self.status.is_peer_interested = false;
            }
            Message::Have { piece_index } => {
                if let Some(peer_id) = self.peer_id {
                    self.piece_picker
                        .write()
                        .await
                        .update_peer(&peer_id, piece_index);
                }
            }
            Message::Request(_) | Message::Cancel(_) => {
                // we never seed, so uploads are simply ignored
                log::trace!("Ignoring upload-only message from peer {}", self.addr);
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                self.handle_block_msg(sink, piece_index, offset, data).await?;
            }
        }

        Ok(())
    }

    /// Handles a message while waiting for the peer's availability
    /// announcement. A KEEP-ALIVE is ignored and we keep waiting; a
    /// BITFIELD registers the peer's availability and moves us to
    /// `Connected`; anything else means the peer has no availability
    /// announcement to make (a lone seed with nothing, or a leecher who
    /// skips it), so we register it with an empty bitfield, relying on
    /// later HAVE messages, and move to `Connected` without consuming
    /// the message (it's handled again on the next iteration, now that
    /// we're no longer in the availability-exchange state).
    async fn handle_availability_msg(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        msg: Message,
    ) -> Result<()> {
        if let Message::KeepAlive = msg {
            return Ok(());
        }

        let peer_id = self.peer_id.expect("handshake completed");
        let piece_count = self.torrent.storage.piece_count;
        let mut replay = None;
        let bitfield = match msg {
            Message::Bitfield(bitfield) => {
                // reject before any padding/truncation: a wrong-length
                // bitfield must fail, not be silently coerced to fit
                if bitfield.len() != piece_count {
                    return Err(Error::ProtocolViolation(format!(
                        "peer {} sent a bitfield of {} bits, expected {}",
                        self.addr,
                        bitfield.len(),
                        piece_count
                    )));
                }
                bitfield
            }
            other => {
                log::info!(
                    "Peer {} sent no bitfield as its first message, assuming \
                     empty availability for now",
                    self.addr
                );
                replay = Some(other);
                let mut zeroed =
                    crate::Bitfield::from_vec(vec![0u8; (piece_count + 7) / 8]);
                zeroed.resize(piece_count, false);
                zeroed
            }
        };

        self.piece_picker
            .write()
            .await
            .add_peer(peer_id, bitfield)?;

        self.status.state = State::Connected;
        log::info!("Interested in peer {}", self.addr);
        self.status.is_interested = true;
        sink.send(Message::Interested).await?;

        if let Some(msg) = replay {
            // boxed to break the mutual-recursion cycle with `handle_msg`,
            // which only ever calls back into this function once, while
            // in the `AvailabilityExchange` state
            let fut: std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + '_>> =
                Box::pin(self.handle_msg(sink, msg));
            fut.await?;
        }

        Ok(())
    }

    async fn handle_block_msg(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        piece_index: crate::PieceIndex,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<()> {
        match self.outstanding_request {
            Some(req) if req.piece_index == piece_index && req.offset == offset => {
                self.outstanding_request = None;
            }
            _ => {
                log::warn!(
                    "Peer {} sent unrequested block (piece {}, offset {})",
                    self.addr,
                    piece_index,
                    offset
                );
                return Ok(());
            }
        }

        self.piece_picker
            .write()
            .await
            .block_received(piece_index, offset, data)
            .await?;

        self.try_request(sink).await
    }

    /// Asks the piece manager for the next block to request, if we're
    /// allowed to have one outstanding and don't already.
    async fn try_request(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
    ) -> Result<()> {
        if self.status.is_choked || !self.status.is_interested {
            return Ok(());
        }
        if self.outstanding_request.is_some() {
            return Ok(());
        }
        let peer_id = match self.peer_id {
            Some(id) => id,
            None => return Ok(()),
        };

        let block = self.piece_picker.write().await.next_request(&peer_id);
        if let Some(block) = block {
            self.outstanding_request = Some(block);
            sink.send(Message::Request(block)).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{metainfo::Metainfo, storage_info::StorageInfo};
    use tokio::net::TcpListener;

    fn test_session(piece_count: usize, addr: SocketAddr) -> PeerSession {
        let metainfo = Metainfo {
            announce: "http://x.test/".into(),
            info_hash: [0; 20],
            piece_length: 16_384,
            total_length: 16_384 * piece_count as u64,
            pieces: vec![[0u8; 20]; piece_count],
            output_name: format!(
                "cratetorrent-leech-session-test-{}-{:?}.bin",
                piece_count, addr
            ),
        };
        let storage = StorageInfo::new(&metainfo, std::env::temp_dir());
        let disk = crate::disk::Disk::new(&storage.file, storage.piece_len)
            .expect("open output file");
        let piece_picker = Arc::new(RwLock::new(PieceManager::new(&metainfo, &storage, disk)));
        let torrent = Arc::new(SharedStatus {
            info_hash: metainfo.info_hash,
            client_id: [9; 20],
            storage,
        });
        let (_tx, rx) = broadcast::channel(1);
        PeerSession::outbound(torrent, piece_picker, addr, rx)
    }

    #[tokio::test]
    async fn rejects_wrong_length_bitfield_before_padding() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let client = client.unwrap();
        let _server = accepted.unwrap().0;

        let framed = Framed::new(client, PeerCodec);
        let (mut sink, _stream) = framed.split();

        // the torrent has 3 pieces; the peer claims availability over only
        // 2 bits, which must be rejected rather than silently padded
        let mut wrong_len_bitfield = crate::Bitfield::from_vec(vec![0u8]);
        wrong_len_bitfield.resize(2, false);

        let mut session = test_session(3, addr);
        session.peer_id = Some([1; 20]);

        let result = session
            .handle_availability_msg(&mut sink, Message::Bitfield(wrong_len_bitfield))
            .await;
        assert!(matches!(result, Err(Error::ProtocolViolation(_))));
    }
}
