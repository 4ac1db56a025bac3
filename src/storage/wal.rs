//! Write-Ahead Log for rating records
//!
//! Every rating write is appended here before it becomes visible, so the
//! rating store (and the aggregates derived from it) can be rebuilt after a
//! restart.
//!
//! File format, one frame per entry:
//!
//! ```text
//! | len: u32 LE | crc32(payload): u32 LE | payload: bincode(WalEntry) |
//! ```

use crate::core::event::{EventId, RatingWriteEvent};
use crate::core::path::RatingPath;
use crate::core::rating::{EntityId, RaterId, RatingRecord};
use crate::error::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

/// Size of the `len` + `crc` prefix of each frame
pub const FRAME_HEADER_SIZE: usize = 8;

/// One logged rating write, with the images the trigger saw
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    pub event_id: Uuid,
    pub entity_id: EntityId,
    pub rater_id: RaterId,
    pub before: Option<RatingRecord>,
    pub after: Option<RatingRecord>,
}

impl WalEntry {
    pub fn from_event(event: &RatingWriteEvent) -> Self {
        Self {
            event_id: event.id.id,
            entity_id: event.entity_id().clone(),
            rater_id: event.rater_id().clone(),
            before: event.before,
            after: event.after,
        }
    }

    pub fn path(&self) -> RatingPath {
        RatingPath::new(self.entity_id.clone(), self.rater_id.clone())
    }

    /// The logged write as it was first delivered, id included
    pub fn into_event(self) -> RatingWriteEvent {
        let path = self.path();
        RatingWriteEvent::new(path, self.before, self.after).with_id(EventId::from_uuid(self.event_id))
    }
}

/// Write-Ahead Log trait
pub trait WriteAheadLog: Send + Sync {
    /// Append an entry to the WAL
    fn append(&mut self, entry: &WalEntry) -> Result<()>;

    /// Force appended entries to stable storage
    fn sync(&mut self) -> Result<()>;

    /// Replay entries in append order
    fn replay(&self) -> Result<Vec<WalEntry>>;
}

/// In-memory WAL (for testing)
#[derive(Default)]
pub struct InMemoryWAL {
    entries: Vec<WalEntry>,
}

impl InMemoryWAL {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WriteAheadLog for InMemoryWAL {
    fn append(&mut self, entry: &WalEntry) -> Result<()> {
        self.entries.push(entry.clone());
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn replay(&self) -> Result<Vec<WalEntry>> {
        Ok(self.entries.clone())
    }
}

/// Append-only WAL file
pub struct FileWAL {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl FileWAL {
    /// Open (or create) the log at `path`, appending after existing frames
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        // Create parent directories if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        // Drop a torn tail so new frames are not written after garbage
        let mut data = Vec::new();
        (&file).read_to_end(&mut data)?;
        let (_, valid_len) = scan_frames(path, &data)?;
        if valid_len < data.len() {
            warn!(
                path = %path.display(),
                valid_len,
                file_len = data.len(),
                "Truncating torn WAL tail"
            );
            file.set_len(valid_len as u64)?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn encode_frame(entry: &WalEntry) -> Result<BytesMut> {
        let payload = bincode::serialize(entry)?;
        let mut frame = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.put_u32_le(payload.len() as u32);
        frame.put_u32_le(crc32fast::hash(&payload));
        frame.put_slice(&payload);
        Ok(frame)
    }
}

impl WriteAheadLog for FileWAL {
    fn append(&mut self, entry: &WalEntry) -> Result<()> {
        let frame = Self::encode_frame(entry)?;
        self.writer.write_all(&frame)?;
        self.writer.flush()?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    fn replay(&self) -> Result<Vec<WalEntry>> {
        let mut data = Vec::new();
        File::open(&self.path)?.read_to_end(&mut data)?;
        let (entries, _) = scan_frames(&self.path, &data)?;
        Ok(entries)
    }
}

/// Decode frames from the start of `data`.
///
/// Returns the entries and the length of the intact prefix. A frame cut short
/// by a crash ends the scan; a frame whose checksum does not match is an error.
fn scan_frames(path: &Path, data: &[u8]) -> Result<(Vec<WalEntry>, usize)> {
    let mut buf = data;
    let mut entries = Vec::new();
    while buf.has_remaining() {
        if buf.remaining() < FRAME_HEADER_SIZE {
            warn!(
                path = %path.display(),
                trailing_bytes = buf.remaining(),
                "Ignoring torn WAL frame header"
            );
            break;
        }
        let mut header = &buf[..FRAME_HEADER_SIZE];
        let len = header.get_u32_le() as usize;
        let checksum = header.get_u32_le();
        if buf.remaining() < FRAME_HEADER_SIZE + len {
            warn!(
                path = %path.display(),
                expected = len,
                available = buf.remaining() - FRAME_HEADER_SIZE,
                "Ignoring torn WAL frame"
            );
            break;
        }

        let payload = &buf[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + len];
        let actual = crc32fast::hash(payload);
        if actual != checksum {
            return Err(Error::Storage(format!(
                "WAL checksum mismatch after {} entries: expected {}, got {}",
                entries.len(),
                checksum,
                actual
            )));
        }
        entries.push(bincode::deserialize(payload)?);
        buf.advance(FRAME_HEADER_SIZE + len);
    }

    Ok((entries, data.len() - buf.remaining()))
}
