//! Persists verified pieces to the single output file.
//!
//! Adapted from the teacher's multi-file, multi-torrent disk actor:
//! since this crate only ever downloads one file for one torrent, there
//! is no need for a command channel or a per-torrent table — a single
//! file handle, shared behind the piece manager's lock, is enough.

use std::{
    fs::{File, OpenOptions},
    io::{Seek, SeekFrom, Write},
};

use tokio::task;

use crate::{error::Result, storage_info::FileInfo, PieceIndex};

/// A handle to the torrent's single output file.
pub(crate) struct Disk {
    file: File,
    piece_len: u32,
}

impl Disk {
    /// Opens (creating if necessary) the output file described by `info`,
    /// preallocating it to its final size.
    pub fn new(info: &FileInfo, piece_len: u32) -> Result<Self> {
        log::info!("Opening output file {:?}", info.path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&info.path)?;
        file.set_len(info.len)?;
        Ok(Self { file, piece_len })
    }

    /// Writes a complete, hash-verified piece's bytes at its canonical
    /// offset in the output file.
    ///
    /// Performs the actual write on a blocking thread pool, as this is
    /// sync IO and would otherwise stall the reactor.
    pub async fn write_piece(
        &mut self,
        index: PieceIndex,
        data: Vec<u8>,
    ) -> Result<()> {
        let offset = self.piece_len as u64 * index as u64;
        log::trace!("Writing piece {} ({} bytes) at offset {}", index, data.len(), offset);

        let mut file = self.file.try_clone()?;
        task::spawn_blocking(move || -> Result<()> {
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&data)?;
            Ok(())
        })
        .await
        .expect("disk write task panicked")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[tokio::test]
    async fn writes_piece_at_canonical_offset() {
        let dir = std::env::temp_dir().join(format!(
            "cratetorrent-leech-disk-test-{:?}",
            std::thread::current().id()
        ));
        let path = dir.with_extension("bin");
        let info = FileInfo {
            path: path.clone(),
            len: 20,
        };
        let mut disk = Disk::new(&info, 10).unwrap();
        disk.write_piece(1, vec![7; 10]).await.unwrap();

        let mut buf = Vec::new();
        File::open(&path).unwrap().read_to_end(&mut buf).unwrap();
        assert_eq!(&buf[0..10], &[0; 10]);
        assert_eq!(&buf[10..20], &[7; 10]);

        std::fs::remove_file(&path).ok();
    }
}
