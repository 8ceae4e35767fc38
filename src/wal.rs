use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::limits::{MAX_WAL_RECORD_BYTES, SNAPSHOT_CHUNK_BYTES};
use crate::model::Event;

/// Encode one commit to [len][bincode][crc32] format.
fn encode_commit(writer: &mut impl Write, events: &[Event]) -> io::Result<()> {
    encode_commit_within(writer, events, MAX_WAL_RECORD_BYTES)
}

/// Nothing is written when the payload exceeds `limit`: replay would treat such a
/// record as corruption and drop it along with everything after it.
fn encode_commit_within(writer: &mut impl Write, events: &[Event], limit: usize) -> io::Result<()> {
    let payload =
        bincode::serialize(events).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > limit {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("commit of {} bytes exceeds the {limit} byte record limit", payload.len()),
        ));
    }
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Split `events` into runs whose encoded size stays under `chunk_bytes`.
/// An event larger than the budget gets a run of its own.
fn snapshot_chunks(events: &[Event], chunk_bytes: usize) -> io::Result<Vec<&[Event]>> {
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut size = 0usize;
    for (i, event) in events.iter().enumerate() {
        let event_size = bincode::serialized_size(event)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))? as usize;
        if i > start && size + event_size > chunk_bytes {
            chunks.push(&events[start..i]);
            start = i;
            size = 0;
        }
        size += event_size;
    }
    if start < events.len() {
        chunks.push(&events[start..]);
    }
    Ok(chunks)
}

/// Append-only Write-Ahead Log.
///
/// Format per entry: `[u32: len][bincode: Vec<Event>][u32: crc32]`
/// - One entry is one commit. Replay applies all of its events or none of them.
/// - Truncated last entry (crash) is discarded via length-prefix + CRC check, and
///   [`Wal::recover`] cuts it off the file so later appends stay reachable.
/// - A snapshot is a run of entries, each within [`SNAPSHOT_CHUNK_BYTES`].
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append a single commit and fsync. Used by tests only.
    #[cfg(test)]
    pub fn append(&mut self, events: &[Event]) -> io::Result<()> {
        self.append_buffered(events)?;
        self.flush_sync()
    }

    /// Append a commit to the BufWriter without flushing or syncing.
    /// Call `flush_sync()` after the batch to durably commit everything buffered.
    pub fn append_buffered(&mut self, events: &[Event]) -> io::Result<()> {
        encode_commit(&mut self.writer, events)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a snapshot to a temp file, chunked into bounded records, and fsync.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file_chunked(path, events, SNAPSHOT_CHUNK_BYTES, MAX_WAL_RECORD_BYTES)
    }

    fn write_compact_file_chunked(
        path: &Path,
        events: &[Event],
        chunk_bytes: usize,
        limit: usize,
    ) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for chunk in snapshot_chunks(events, chunk_bytes)? {
            encode_commit_within(&mut writer, chunk, limit)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Atomic swap: rename temp file over the WAL and reopen.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay the WAL from disk, returning every event of every intact commit in order.
    /// A truncated or corrupt trailing commit is discarded as a whole.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Self::replay_intact(path).map(|(events, _)| events)
    }

    /// Replay, then truncate the file to its last intact commit. Bytes past that point
    /// would otherwise hide every commit appended after them from the next replay.
    pub fn recover(path: &Path) -> io::Result<Vec<Event>> {
        let (events, intact_len) = Self::replay_intact(path)?;
        let file_len = match fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(events),
            Err(e) => return Err(e),
        };
        if file_len > intact_len {
            warn!(
                path = %path.display(),
                discarded_bytes = file_len - intact_len,
                "truncating torn WAL tail"
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(intact_len)?;
            file.sync_all()?;
        }
        Ok(events)
    }

    /// Events of every intact commit plus the byte length those commits span.
    fn replay_intact(path: &Path) -> io::Result<(Vec<Event>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut intact_len = 0u64;

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            if len > MAX_WAL_RECORD_BYTES {
                break;
            }

            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }

            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                break;
            }

            match bincode::deserialize::<Vec<Event>>(&payload) {
                Ok(commit) => events.extend(commit),
                Err(_) => break,
            }
            intact_len += 8 + len as u64;
        }

        Ok((events, intact_len))
    }
}
