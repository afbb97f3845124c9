use std::path::PathBuf;

use crate::metainfo::Metainfo;

/// Information about the single output file of a torrent.
#[derive(Clone, Debug)]
pub struct FileInfo {
    /// The file's path, relative to the process's working directory.
    pub path: PathBuf,
    /// The file's length, in bytes.
    pub len: u64,
}

/// Information about a torrent's storage details, derived once from its
/// metainfo: piece geometry and the single output file's path and length.
#[derive(Clone, Debug)]
pub(crate) struct StorageInfo {
    /// The number of pieces in the torrent.
    pub piece_count: usize,
    /// The nominal length of a piece.
    pub piece_len: u32,
    /// The length of the last piece, which may be shorter than `piece_len`.
    pub last_piece_len: u32,
    /// The total length of the download.
    pub download_len: u64,
    /// The file this torrent's data is written to.
    pub file: FileInfo,
}

impl StorageInfo {
    /// Extracts storage related information from the torrent metainfo.
    ///
    /// The output file is placed directly in `download_dir`, named as the
    /// torrent declares (`Metainfo::output_name`), since multi-file
    /// torrents, and thus the subdirectory case, aren't supported.
    pub fn new(metainfo: &Metainfo, download_dir: PathBuf) -> Self {
        Self {
            piece_count: metainfo.piece_count(),
            piece_len: metainfo.piece_length as u32,
            last_piece_len: metainfo.last_piece_len(),
            download_len: metainfo.total_length,
            file: FileInfo {
                path: download_dir.join(&metainfo.output_name),
                len: metainfo.total_length,
            },
        }
    }

    /// Returns the length of the piece at the given index.
    pub fn piece_len(&self, index: crate::PieceIndex) -> crate::error::Result<u32> {
        if index < self.piece_count - 1 {
            Ok(self.piece_len)
        } else if index == self.piece_count - 1 {
            Ok(self.last_piece_len)
        } else {
            Err(crate::error::Error::InvalidPieceIndex)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metainfo(piece_length: u64, total_length: u64) -> Metainfo {
        let piece_count =
            ((total_length + piece_length - 1) / piece_length) as usize;
        Metainfo {
            announce: "http://x.test/".into(),
            info_hash: [0; 20],
            piece_length,
            total_length,
            pieces: vec![[0; 20]; piece_count],
            output_name: "f.bin".into(),
        }
    }

    #[test]
    fn derives_single_file_layout() {
        let metainfo = metainfo(16_384, 16_384 * 2 + 10);
        let info = StorageInfo::new(&metainfo, PathBuf::from("/tmp"));
        assert_eq!(info.piece_count, 3);
        assert_eq!(info.piece_len(0).unwrap(), 16_384);
        assert_eq!(info.piece_len(2).unwrap(), 10);
        assert_eq!(info.file.path, PathBuf::from("/tmp/f.bin"));
        assert_eq!(info.file.len, 16_384 * 2 + 10);
    }

    #[test]
    fn rejects_out_of_range_piece() {
        let metainfo = metainfo(16_384, 16_384 * 2 + 10);
        let info = StorageInfo::new(&metainfo, PathBuf::from("/tmp"));
        assert!(info.piece_len(3).is_err());
    }
}
