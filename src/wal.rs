use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

/// Upper bound on one encoded record. A length prefix above this can only come
/// from a torn or corrupt write.
const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

/// Encode a single event to [len][bincode][crc32] format.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Append-only log of booking, registration and schedule events.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - A torn last entry (crash mid-write) fails the length or CRC check and is
///   dropped on replay, along with anything after it.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// File length as of the last successful `flush_sync`.
    durable_len: u64,
    pending_len: u64,
    pending_appends: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let durable_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            durable_len,
            pending_len: 0,
            pending_appends: 0,
        })
    }

    /// Replay the log, cut off any torn tail, and open it for appends. Without
    /// the cut, new records would land behind bytes that replay stops at.
    pub fn recover(path: &Path) -> io::Result<(Vec<Event>, Self)> {
        let (events, intact_len) = Self::replay_prefix(path)?;
        let wal = Self::open(path)?;
        if wal.durable_len > intact_len {
            warn!(
                path = %path.display(),
                dropped = wal.durable_len - intact_len,
                "truncating torn WAL tail"
            );
            wal.writer.get_ref().set_len(intact_len)?;
            wal.writer.get_ref().sync_all()?;
        }
        Ok((events, Self { durable_len: intact_len, ..wal }))
    }

    /// Append and fsync one event. Tests only; the engine batches through
    /// `append_buffered` + `flush_sync`.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// One framed record, ready for `append_encoded`.
    pub fn encode(event: &Event) -> io::Result<Vec<u8>> {
        let mut record = Vec::new();
        encode_event(&mut record, event)?;
        Ok(record)
    }

    /// Buffer one event. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        let record = Self::encode(event)?;
        self.append_encoded(&record)
    }

    pub fn append_encoded(&mut self, record: &[u8]) -> io::Result<()> {
        self.writer.write_all(record)?;
        self.pending_len += record.len() as u64;
        self.pending_appends += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.durable_len += self.pending_len;
        self.appends_since_compact += self.pending_appends;
        self.pending_len = 0;
        self.pending_appends = 0;
        Ok(())
    }

    /// Throw away everything appended since the last successful `flush_sync`,
    /// whether still buffered or already written to the file.
    pub fn discard_pending(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // into_parts hands back the buffer instead of writing it out
        let (stale_file, _unwritten) = stale.into_parts();
        drop(stale_file);
        self.pending_len = 0;
        self.pending_appends = 0;
        self.writer.get_ref().set_len(self.durable_len)?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the compacted log to a sibling temp file and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Rename the temp file over the log and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.durable_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        self.pending_len = 0;
        self.pending_appends = 0;
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

    /// Read every intact event. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Self::replay_prefix(path).map(|(events, _)| events)
    }

    /// Intact events plus the byte length they occupy.
    fn replay_prefix(path: &Path) -> io::Result<(Vec<Event>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut intact_len: u64 = 0;

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            if len > MAX_RECORD_LEN {
                warn!(path = %path.display(), entries = events.len(), "WAL record length {len} out of range, discarding tail");
                break;
            }

            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    warn!(path = %path.display(), entries = events.len(), "truncated WAL record discarded");
                    break;
                }
                Err(e) => return Err(e),
            }

            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    warn!(path = %path.display(), entries = events.len(), "truncated WAL record discarded");
                    break;
                }
                Err(e) => return Err(e),
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                warn!(path = %path.display(), entries = events.len(), "WAL checksum mismatch, discarding tail");
                break;
            }

            match bincode::deserialize::<Event>(&payload) {
                Ok(event) => {
                    events.push(event);
                    intact_len += (len + 8) as u64;
                }
                Err(e) => {
                    warn!(path = %path.display(), entries = events.len(), "undecodable WAL record, discarding tail: {e}");
                    break;
                }
            }
        }

        Ok((events, intact_len))
    }
}
