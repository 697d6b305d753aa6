//! Changelog segments
//!
//! Append-only per-segment log of serialized mutations:
//! - Dense record ids starting at zero within each segment
//! - CRC32C checksums per record
//! - Torn tails truncated on open
//! - Sealing once the segment is rotated away
//!
//! File format:
//! ```text
//! header: | Magic "CLOG" | SegmentId | PrevRecordCount | Flags |
//!         | 4B           | 4B        | 4B              | 4B    |
//! record: | Magic "CREC" | RecordId  | Length | Data | CRC32C |
//!         | 4B           | 4B        | 4B     | var  | 4B     |
//! ```

use bytes::Bytes;
use cellmaster_common::{Error, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

const LOG_MAGIC: u32 = 0x474F_4C43; // "CLOG"
const RECORD_MAGIC: u32 = 0x4345_5243; // "CREC"

const HEADER_SIZE: u64 = 16;
const RECORD_HEADER_SIZE: usize = 12;
const FLAGS_OFFSET: u64 = 12;
const FLAG_SEALED: u32 = 1;

const LOG_EXTENSION: &str = "log";

fn io_error(what: &str, path: &Path, e: &std::io::Error) -> Error {
    Error::ChangeLog(format!("{what} {}: {e}", path.display()))
}

fn le_u32(buf: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[..4]);
    u32::from_le_bytes(raw)
}

fn encode_record(record_id: u32, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + data.len() + 4);
    buf.extend_from_slice(&RECORD_MAGIC.to_le_bytes());
    buf.extend_from_slice(&record_id.to_le_bytes());
    buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
    buf.extend_from_slice(data);
    let crc = crc32c::crc32c(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

/// Read the next record; `None` on a clean end, a torn tail or a corrupt record.
fn read_record(reader: &mut impl Read) -> Option<(u32, Vec<u8>)> {
    let mut header = [0u8; RECORD_HEADER_SIZE];
    reader.read_exact(&mut header).ok()?;
    if le_u32(&header[0..4]) != RECORD_MAGIC {
        return None;
    }
    let record_id = le_u32(&header[4..8]);
    let len = le_u32(&header[8..12]) as usize;

    let mut body = vec![0u8; len + 4];
    reader.read_exact(&mut body).ok()?;

    let stored_crc = le_u32(&body[len..]);
    let mut crc = crc32c::crc32c(&header);
    crc = crc32c::crc32c_append(crc, &body[..len]);
    if crc != stored_crc {
        return None;
    }
    body.truncate(len);
    Some((record_id, body))
}

/// A single changelog segment.
pub struct ChangeLog {
    path: PathBuf,
    segment_id: u32,
    prev_record_count: u32,
    writer: BufWriter<File>,
    /// Start offset of every record
    offsets: Vec<u64>,
    end_offset: u64,
    sealed: bool,
}

impl ChangeLog {
    /// Create a new empty segment, replacing any file at `path`.
    pub fn create(path: impl AsRef<Path>, segment_id: u32, prev_record_count: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| io_error("failed to create changelog", &path, &e))?;

        let mut writer = BufWriter::new(file);
        let mut header = Vec::with_capacity(HEADER_SIZE as usize);
        header.extend_from_slice(&LOG_MAGIC.to_le_bytes());
        header.extend_from_slice(&segment_id.to_le_bytes());
        header.extend_from_slice(&prev_record_count.to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes());
        writer
            .write_all(&header)
            .and_then(|()| writer.flush())
            .and_then(|()| writer.get_ref().sync_all())
            .map_err(|e| io_error("failed to write changelog header", &path, &e))?;

        debug!(segment_id, prev_record_count, "Created changelog");

        Ok(Self {
            path,
            segment_id,
            prev_record_count,
            writer,
            offsets: Vec::new(),
            end_offset: HEADER_SIZE,
            sealed: false,
        })
    }

    /// Open an existing segment, dropping a torn or corrupt tail.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| io_error("failed to open changelog", &path, &e))?;

        let mut reader = BufReader::new(
            file.try_clone()
                .map_err(|e| io_error("failed to open changelog", &path, &e))?,
        );
        let mut header = [0u8; HEADER_SIZE as usize];
        reader
            .read_exact(&mut header)
            .map_err(|e| io_error("failed to read changelog header", &path, &e))?;
        if le_u32(&header[0..4]) != LOG_MAGIC {
            return Err(Error::ChangeLog(format!(
                "invalid changelog magic in {}",
                path.display()
            )));
        }
        let segment_id = le_u32(&header[4..8]);
        let prev_record_count = le_u32(&header[8..12]);
        let sealed = le_u32(&header[12..16]) & FLAG_SEALED != 0;

        let mut offsets = Vec::new();
        let mut end_offset = HEADER_SIZE;
        while let Some((record_id, data)) = read_record(&mut reader) {
            if record_id as usize != offsets.len() {
                warn!(
                    segment_id,
                    expected = offsets.len(),
                    actual = record_id,
                    "Changelog record id out of sequence, truncating"
                );
                break;
            }
            offsets.push(end_offset);
            end_offset += (RECORD_HEADER_SIZE + data.len() + 4) as u64;
        }

        let file_len = file
            .metadata()
            .map_err(|e| io_error("failed to stat changelog", &path, &e))?
            .len();
        if file_len > end_offset {
            warn!(
                segment_id,
                valid_bytes = end_offset,
                file_bytes = file_len,
                "Truncating torn changelog tail"
            );
            file.set_len(end_offset)
                .map_err(|e| io_error("failed to truncate changelog", &path, &e))?;
        }

        let mut writer = BufWriter::new(file);
        writer
            .seek(SeekFrom::Start(end_offset))
            .map_err(|e| io_error("failed to seek changelog", &path, &e))?;

        debug!(
            segment_id,
            record_count = offsets.len(),
            sealed,
            "Opened changelog"
        );

        Ok(Self {
            path,
            segment_id,
            prev_record_count,
            writer,
            offsets,
            end_offset,
            sealed,
        })
    }

    /// Append a record; `record_id` must equal the current record count.
    pub fn append(&mut self, record_id: u32, data: &[u8]) -> Result<()> {
        assert!(
            !self.sealed,
            "append to sealed changelog {}",
            self.segment_id
        );
        assert_eq!(
            record_id as usize,
            self.offsets.len(),
            "changelog {} record id mismatch",
            self.segment_id
        );

        let bytes = encode_record(record_id, data);
        self.writer
            .write_all(&bytes)
            .map_err(|e| io_error("changelog write failed", &self.path, &e))?;
        self.offsets.push(self.end_offset);
        self.end_offset += bytes.len() as u64;
        Ok(())
    }

    /// Push buffered records to the file, optionally syncing them to disk.
    pub fn flush(&mut self, sync: bool) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| io_error("changelog flush failed", &self.path, &e))?;
        if sync {
            self.writer
                .get_ref()
                .sync_data()
                .map_err(|e| io_error("changelog sync failed", &self.path, &e))?;
        }
        Ok(())
    }

    /// Read up to `max_records` records starting at `first_record`.
    pub fn read(&mut self, first_record: u32, max_records: usize) -> Result<Vec<Bytes>> {
        let first = first_record as usize;
        if first >= self.offsets.len() || max_records == 0 {
            return Ok(Vec::new());
        }
        self.flush(false)?;

        let count = max_records.min(self.offsets.len() - first);
        let mut reader = BufReader::new(
            File::open(&self.path).map_err(|e| io_error("failed to open changelog", &self.path, &e))?,
        );
        reader
            .seek(SeekFrom::Start(self.offsets[first]))
            .map_err(|e| io_error("failed to seek changelog", &self.path, &e))?;

        let mut records = Vec::with_capacity(count);
        for expected in first..first + count {
            match read_record(&mut reader) {
                Some((record_id, data)) if record_id as usize == expected => {
                    records.push(Bytes::from(data));
                }
                _ => {
                    return Err(Error::ChangeLog(format!(
                        "changelog {} is corrupt at record {expected}",
                        self.segment_id
                    )));
                }
            }
        }
        Ok(records)
    }

    /// Drop every record at or after `record_count`.
    pub fn truncate(&mut self, record_count: u32) -> Result<()> {
        let count = record_count as usize;
        if count >= self.offsets.len() {
            return Ok(());
        }
        self.flush(false)?;

        let new_end = self.offsets[count];
        warn!(
            segment_id = self.segment_id,
            from = self.offsets.len(),
            to = count,
            "Truncating changelog"
        );
        self.writer
            .get_ref()
            .set_len(new_end)
            .map_err(|e| io_error("failed to truncate changelog", &self.path, &e))?;
        self.writer
            .seek(SeekFrom::Start(new_end))
            .map_err(|e| io_error("failed to seek changelog", &self.path, &e))?;
        self.offsets.truncate(count);
        self.end_offset = new_end;
        self.sealed = false;
        self.write_flags(0)
    }

    /// Mark the segment as finished; no further appends are accepted.
    pub fn seal(&mut self) -> Result<()> {
        if self.sealed {
            return Ok(());
        }
        self.flush(false)?;
        self.write_flags(FLAG_SEALED)?;
        self.sealed = true;
        debug!(
            segment_id = self.segment_id,
            record_count = self.offsets.len(),
            "Sealed changelog"
        );
        Ok(())
    }

    fn write_flags(&mut self, flags: u32) -> Result<()> {
        let writer = &mut self.writer;
        writer
            .seek(SeekFrom::Start(FLAGS_OFFSET))
            .and_then(|_| writer.write_all(&flags.to_le_bytes()))
            .and_then(|()| writer.flush())
            .and_then(|()| writer.get_ref().sync_all())
            .and_then(|()| writer.seek(SeekFrom::Start(self.end_offset)).map(|_| ()))
            .map_err(|e| io_error("failed to update changelog header", &self.path, &e))
    }

    pub const fn segment_id(&self) -> u32 {
        self.segment_id
    }

    /// Record count of the previous segment at the time this one was created.
    pub const fn prev_record_count(&self) -> u32 {
        self.prev_record_count
    }

    pub fn record_count(&self) -> u32 {
        self.offsets.len() as u32
    }

    pub const fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Shared handle to an open segment.
pub type ChangeLogHandle = Arc<Mutex<ChangeLog>>;

/// Directory of changelog segments, one file per segment id.
pub struct ChangeLogStore {
    dir: PathBuf,
    logs: Mutex<BTreeMap<u32, ChangeLogHandle>>,
}

impl ChangeLogStore {
    /// Open (or create) the changelog directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| io_error("failed to create changelog dir", &dir, &e))?;
        Ok(Self {
            dir,
            logs: Mutex::new(BTreeMap::new()),
        })
    }

    fn segment_path(&self, segment_id: u32) -> PathBuf {
        self.dir.join(format!("{segment_id:09}.{LOG_EXTENSION}"))
    }

    /// Segment ids present on disk, ascending.
    pub fn segment_ids(&self) -> Result<Vec<u32>> {
        let entries =
            fs::read_dir(&self.dir).map_err(|e| io_error("failed to list changelogs", &self.dir, &e))?;
        let mut ids = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|e| io_error("failed to list changelogs", &self.dir, &e))?
                .path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(LOG_EXTENSION) {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<u32>().ok())
            {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Create a fresh segment.
    pub fn create(&self, segment_id: u32, prev_record_count: u32) -> Result<ChangeLogHandle> {
        let log = ChangeLog::create(self.segment_path(segment_id), segment_id, prev_record_count)?;
        let handle = Arc::new(Mutex::new(log));
        self.logs.lock().insert(segment_id, handle.clone());
        Ok(handle)
    }

    /// Open a segment, returning `None` if it does not exist.
    pub fn find(&self, segment_id: u32) -> Result<Option<ChangeLogHandle>> {
        let mut logs = self.logs.lock();
        if let Some(handle) = logs.get(&segment_id) {
            return Ok(Some(handle.clone()));
        }
        match ChangeLog::open(self.segment_path(segment_id)) {
            Ok(log) => {
                let handle = Arc::new(Mutex::new(log));
                logs.insert(segment_id, handle.clone());
                Ok(Some(handle))
            }
            Err(_) if !self.segment_path(segment_id).exists() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Delete every segment with an id greater than `segment_id`.
    pub fn remove_after(&self, segment_id: u32) -> Result<()> {
        let mut logs = self.logs.lock();
        for id in self.segment_ids()? {
            if id <= segment_id {
                continue;
            }
            logs.remove(&id);
            let path = self.segment_path(id);
            match fs::remove_file(&path) {
                Ok(()) => warn!(segment_id = id, "Removed changelog"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(io_error("failed to remove changelog", &path, &e)),
            }
        }
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_append_read() {
        let dir = tempdir().unwrap();
        let mut log = ChangeLog::create(dir.path().join("0.log"), 0, 0).unwrap();

        log.append(0, b"first").unwrap();
        log.append(1, b"second").unwrap();
        log.append(2, b"third").unwrap();
        assert_eq!(log.record_count(), 3);

        let records = log.read(1, 10).unwrap();
        assert_eq!(records, vec![Bytes::from_static(b"second"), Bytes::from_static(b"third")]);
        assert!(log.read(3, 10).unwrap().is_empty());
        assert_eq!(log.read(0, 1).unwrap().len(), 1);
    }

    #[test]
    fn test_reopen_preserves_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("000000004.log");
        {
            let mut log = ChangeLog::create(&path, 4, 17).unwrap();
            log.append(0, b"a").unwrap();
            log.append(1, b"b").unwrap();
            log.flush(true).unwrap();
        }

        let mut log = ChangeLog::open(&path).unwrap();
        assert_eq!(log.segment_id(), 4);
        assert_eq!(log.prev_record_count(), 17);
        assert_eq!(log.record_count(), 2);
        log.append(2, b"c").unwrap();
        assert_eq!(log.read(0, 10).unwrap().len(), 3);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.log");
        {
            let mut log = ChangeLog::create(&path, 0, 0).unwrap();
            log.append(0, b"complete").unwrap();
            log.flush(true).unwrap();
        }
        let good_len = fs::metadata(&path).unwrap().len();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            let torn = encode_record(1, b"partial record");
            file.write_all(&torn[..torn.len() - 3]).unwrap();
        }

        let mut log = ChangeLog::open(&path).unwrap();
        assert_eq!(log.record_count(), 1);
        assert_eq!(fs::metadata(&path).unwrap().len(), good_len);
        log.append(1, b"replacement").unwrap();
        assert_eq!(log.read(1, 1).unwrap(), vec![Bytes::from_static(b"replacement")]);
    }

    #[test]
    fn test_truncate_and_seal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.log");
        let mut log = ChangeLog::create(&path, 0, 0).unwrap();
        for i in 0..5u32 {
            log.append(i, &i.to_le_bytes()).unwrap();
        }
        log.truncate(2).unwrap();
        assert_eq!(log.record_count(), 2);
        log.append(2, b"new").unwrap();
        log.seal().unwrap();
        assert!(log.is_sealed());
        drop(log);

        let log = ChangeLog::open(&path).unwrap();
        assert!(log.is_sealed());
        assert_eq!(log.record_count(), 3);
    }

    #[test]
    fn test_store_segments() {
        let dir = tempdir().unwrap();
        let store = ChangeLogStore::open(dir.path().join("changelogs")).unwrap();
        assert!(store.segment_ids().unwrap().is_empty());
        assert!(store.find(0).unwrap().is_none());

        store.create(0, 0).unwrap().lock().append(0, b"x").unwrap();
        store.create(1, 1).unwrap();
        store.create(2, 0).unwrap();
        assert_eq!(store.segment_ids().unwrap(), vec![0, 1, 2]);

        store.remove_after(0).unwrap();
        assert_eq!(store.segment_ids().unwrap(), vec![0]);
        assert!(store.find(1).unwrap().is_none());
        assert_eq!(store.find(0).unwrap().unwrap().lock().record_count(), 1);
    }
}
