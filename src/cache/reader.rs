//! Reader handles over cached entries.

use std::io::SeekFrom;
use std::sync::Arc;

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::controller::{CacheController, WaitOutcome};
use super::error::CacheError;

const READ_CHUNK_SIZE: usize = 64 * 1024;

/// A seekable reader over one cached entry's payload.
///
/// Reads return bytes up to the published frontier; a read past the
/// frontier blocks until the background download catches up. An
/// exhausted or invalidated entry reads as empty.
///
/// Dropping the reader releases it best-effort;
/// [`close`](Self::close) releases it explicitly and reports double
/// release.
pub struct CachedFileReader {
    controller: Arc<CacheController>,
    file: File,
    position: u64,
    id: u64,
    released: bool,
}

impl CachedFileReader {
    pub(crate) fn new(controller: Arc<CacheController>, file: File, id: u64) -> Self {
        Self {
            controller,
            file,
            position: 0,
            id,
            released: false,
        }
    }

    /// Reads up to `max_len` bytes at the current position.
    ///
    /// Blocks while the requested range lies beyond the frontier of an
    /// entry that is still downloading. Returns an empty buffer at end
    /// of file.
    pub async fn read(&mut self, max_len: usize) -> Result<Bytes, CacheError> {
        if max_len == 0 {
            return Ok(Bytes::new());
        }
        let wanted_end = self.position + max_len as u64;
        match self
            .controller
            .wait_more_data(self.position, wanted_end)
            .await
        {
            WaitOutcome::EndOfFile => return Ok(Bytes::new()),
            WaitOutcome::Ready => {}
        }

        let end = wanted_end.min(self.controller.frontier());
        if end <= self.position {
            return Ok(Bytes::new());
        }
        let mut buf = vec![0u8; (end - self.position) as usize];
        self.file.seek(SeekFrom::Start(self.position)).await?;
        self.file.read_exact(&mut buf).await?;
        self.position = end;
        Ok(Bytes::from(buf))
    }

    /// Reads from the current position to the end of the entry.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, CacheError> {
        let mut data = Vec::new();
        loop {
            let chunk = self.read(READ_CHUNK_SIZE).await?;
            if chunk.is_empty() {
                return Ok(data);
            }
            data.extend_from_slice(&chunk);
        }
    }

    /// Moves the read position and returns it. `SeekFrom::End` is
    /// resolved against the descriptor's declared size; positions
    /// before the start clamp to zero.
    pub fn seek(&mut self, pos: SeekFrom) -> u64 {
        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(delta) => self.position as i64 + delta,
            SeekFrom::End(delta) => self.controller.file_size() as i64 + delta,
        };
        self.position = target.max(0) as u64;
        self.position
    }

    /// Current read position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// The controller this reader was opened from.
    pub fn controller(&self) -> &Arc<CacheController> {
        &self.controller
    }

    /// Releases the reader. Double release is an error surfaced by the
    /// controller.
    pub fn close(mut self) -> Result<(), CacheError> {
        self.released = true;
        self.controller.release_reader(self.id)
    }
}

impl Drop for CachedFileReader {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.controller.release_reader(self.id);
        }
    }
}
