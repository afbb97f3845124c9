//! Parsing and validation of `.torrent` metainfo files.

use std::{fmt, fs, path::Path};

use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

use crate::{
    error::{Error, Result},
    PieceIndex, Sha1Hash,
};

/// A parsed and validated single-file torrent metainfo.
#[derive(Debug)]
pub struct Metainfo {
    /// The tracker's announce URL.
    pub announce: String,
    /// The SHA-1 digest of the bencoded `info` dictionary.
    pub info_hash: Sha1Hash,
    /// The nominal length of a piece, in bytes.
    pub piece_length: u64,
    /// The total length of the file, in bytes.
    pub total_length: u64,
    /// The ordered SHA-1 digests of each piece.
    pub pieces: Vec<Sha1Hash>,
    /// The name of the output file.
    pub output_name: String,
}

impl Metainfo {
    /// Reads and validates the torrent file at `path`.
    ///
    /// Fails with [`Error::BadTorrent`] if the path doesn't look like a
    /// `.torrent` file, if it can't be parsed as bencode, if any required key
    /// is missing, if `pieces` isn't a multiple of 20 bytes, or if the
    /// torrent declares more than one file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.extension().and_then(|ext| ext.to_str()) != Some("torrent") {
            return Err(Error::BadTorrent(format!(
                "{} is not a .torrent file",
                path.display()
            )));
        }
        let buf = fs::read(path).map_err(|e| {
            Error::BadTorrent(format!("could not read {}: {}", path.display(), e))
        })?;
        Self::from_bytes(&buf)
    }

    /// Parses and validates a raw bencoded metainfo buffer.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let raw: RawMetainfo = serde_bencode::from_bytes(buf)
            .map_err(|e| Error::BadTorrent(format!("invalid bencode: {}", e)))?;

        if raw.info.files.is_some() {
            return Err(Error::BadTorrent(
                "multi-file torrents are not supported".into(),
            ));
        }
        let total_length = raw.info.length.ok_or_else(|| {
            Error::BadTorrent("info dictionary is missing `length`".into())
        })?;
        if raw.info.piece_length == 0 {
            return Err(Error::BadTorrent("piece length must be positive".into()));
        }
        if total_length == 0 {
            return Err(Error::BadTorrent("length must be positive".into()));
        }

        let raw_pieces: &[u8] = raw.info.pieces.as_ref();
        if raw_pieces.len() % 20 != 0 {
            return Err(Error::BadTorrent(
                "pieces field length is not a multiple of 20".into(),
            ));
        }
        let pieces: Vec<Sha1Hash> = raw_pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let piece_count = pieces.len();
        let expected_piece_count =
            ceil_div(total_length, raw.info.piece_length) as usize;
        if piece_count != expected_piece_count {
            return Err(Error::BadTorrent(format!(
                "expected {} piece hashes for a {} byte file with piece \
                 length {}, got {}",
                expected_piece_count, total_length, raw.info.piece_length, piece_count
            )));
        }

        let info_hash = {
            let info_bytes = serde_bencode::to_bytes(&raw.info)?;
            let digest = Sha1::digest(&info_bytes);
            let mut hash = [0; 20];
            hash.copy_from_slice(&digest);
            hash
        };

        Ok(Self {
            announce: raw.announce,
            info_hash,
            piece_length: raw.info.piece_length,
            total_length,
            pieces,
            output_name: raw.info.name,
        })
    }

    /// The number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// The length, in bytes, of the piece at `index`.
    ///
    /// All pieces are `piece_length` bytes long except for the last, which
    /// may be shorter.
    pub fn piece_len(&self, index: PieceIndex) -> u32 {
        if index == self.piece_count() - 1 {
            self.last_piece_len()
        } else {
            self.piece_length as u32
        }
    }

    /// The length, in bytes, of the last (possibly truncated) piece.
    pub fn last_piece_len(&self) -> u32 {
        let full_pieces = (self.piece_count() - 1) as u64;
        (self.total_length - self.piece_length * full_pieces) as u32
    }
}

impl fmt::Display for Metainfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} bytes, {} pieces) via {}, hash {}",
            self.output_name,
            self.total_length,
            self.piece_count(),
            self.announce,
            hex::encode(self.info_hash)
        )
    }
}

fn ceil_div(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}

#[derive(Debug, Deserialize)]
struct RawMetainfo {
    announce: String,
    info: RawInfo,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawInfo {
    name: String,
    #[serde(with = "serde_bytes")]
    pieces: ByteBuf,
    #[serde(rename = "piece length")]
    piece_length: u64,
    length: Option<u64>,
    files: Option<Vec<RawFile>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawFile {
    path: Vec<String>,
    length: i64,
}
