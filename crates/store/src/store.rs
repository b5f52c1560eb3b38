use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::envelope::Envelope;
use crate::error::{DeserializationError, StoreError};
use crate::record::{Record, Source};

/// How a file's content is laid out. Decided on first read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    /// Not yet known: nothing complete has been read.
    Unknown,
    /// One envelope per line; the file may keep growing.
    Lines,
    /// A single JSON document spanning the whole file.
    Document,
}

#[derive(Debug)]
struct FileCursor {
    layout: Layout,
    /// Bytes already turned into records or errors.
    offset: u64,
    /// Lines already consumed, for 1-based error positions.
    lines: usize,
    /// Unconsumed bytes exist that did not parse yet (possibly mid-write).
    deferred: bool,
    /// File length at the last read.
    seen_len: u64,
}

impl FileCursor {
    fn new() -> Self {
        FileCursor {
            layout: Layout::Unknown,
            offset: 0,
            lines: 0,
            deferred: false,
            seen_len: 0,
        }
    }
}

/// File-backed store of the records captured for one [`Source`].
///
/// The store never holds a lock on its folder: the proxy appends, the store
/// polls. Records are staged by [`poll`](RecordStore::poll) and handed out
/// only by [`drain`](RecordStore::drain), so a caller can decide when new
/// data becomes visible to validators.
#[derive(Debug)]
pub struct RecordStore {
    source: Source,
    folder: PathBuf,
    files: BTreeMap<PathBuf, FileCursor>,
    staged: Vec<Record>,
    errors: Vec<DeserializationError>,
    next_seq: u64,
    next_exchange: u64,
}

impl RecordStore {
    pub fn new(source: Source, folder: impl Into<PathBuf>) -> Self {
        RecordStore {
            source,
            folder: folder.into(),
            files: BTreeMap::new(),
            staged: Vec::new(),
            errors: Vec::new(),
            next_seq: 0,
            next_exchange: 0,
        }
    }

    /// Store reading `<log_folder>/interfaces/<source>/`.
    pub fn for_log_folder(log_folder: &Path, source: Source) -> Self {
        let folder = log_folder.join("interfaces").join(source.dir_name());
        RecordStore::new(source, folder)
    }

    pub fn source(&self) -> Source {
        self.source
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Records ingested so far, including already drained ones.
    pub fn record_count(&self) -> u64 {
        self.next_seq
    }

    pub fn errors(&self) -> &[DeserializationError] {
        &self.errors
    }

    /// Scan the folder once and ingest new or grown files, in filename order.
    ///
    /// A missing folder is not an error: the proxy may not have written
    /// anything yet. Returns the number of records staged by this scan.
    pub fn poll(&mut self) -> Result<usize, StoreError> {
        if !self.folder.exists() {
            return Ok(0);
        }
        let mut staged = 0;
        for path in self.list_files()? {
            let len = std::fs::metadata(&path)
                .map_err(|e| StoreError::io(&path, e))?
                .len();
            let unchanged = self
                .files
                .get(&path)
                .map(|c| c.seen_len == len)
                .unwrap_or(false);
            if unchanged {
                continue;
            }
            staged += self.ingest_file(&path)?;
        }
        Ok(staged)
    }

    /// Parse whatever `path` holds beyond what was already consumed.
    ///
    /// Complete entries become records; corrupt entries become
    /// [`DeserializationError`]s. An unterminated trailing fragment that does
    /// not parse is left for a later call (the writer may be mid-write) or
    /// for [`flush`](RecordStore::flush).
    pub fn ingest_file(&mut self, path: &Path) -> Result<usize, StoreError> {
        let mut cursor = self
            .files
            .remove(path)
            .unwrap_or_else(FileCursor::new);
        let result = self.ingest_with_cursor(path, &mut cursor, false);
        self.files.insert(path.to_path_buf(), cursor);
        result
    }

    /// Settle every deferred fragment: parse it or record it as an error.
    ///
    /// Called once the writer is known to be done (replay load, end of a
    /// live wait).
    pub fn flush(&mut self) -> Result<usize, StoreError> {
        let deferred: Vec<PathBuf> = self
            .files
            .iter()
            .filter(|(_, c)| c.deferred)
            .map(|(p, _)| p.clone())
            .collect();
        let mut staged = 0;
        for path in deferred {
            let mut cursor = self.files.remove(&path).unwrap_or_else(FileCursor::new);
            let result = self.ingest_with_cursor(&path, &mut cursor, true);
            self.files.insert(path, cursor);
            staged += result?;
        }
        Ok(staged)
    }

    /// Bulk-read everything currently on disk, for replay.
    pub fn load_data_from_logs(&mut self) -> Result<usize, StoreError> {
        if !self.folder.exists() {
            debug!(folder = %self.folder.display(), "no captured data for interface");
            return Ok(0);
        }
        let staged = self.poll()? + self.flush()?;
        debug!(
            source = %self.source,
            records = staged,
            errors = self.errors.len(),
            "loaded records from logs"
        );
        Ok(staged)
    }

    /// Hand out staged records in arrival order.
    pub fn drain(&mut self) -> Vec<Record> {
        std::mem::take(&mut self.staged)
    }

    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    fn list_files(&self) -> Result<Vec<PathBuf>, StoreError> {
        let entries =
            std::fs::read_dir(&self.folder).map_err(|e| StoreError::io(&self.folder, e))?;
        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&self.folder, e))?;
            let path = entry.path();
            if path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    fn ingest_with_cursor(
        &mut self,
        path: &Path,
        cursor: &mut FileCursor,
        finalize: bool,
    ) -> Result<usize, StoreError> {
        let bytes = read_from(path, cursor.offset)?;
        cursor.seen_len = cursor.offset + bytes.len() as u64;
        let fallback_time = file_time(path);

        if cursor.layout == Layout::Unknown {
            cursor.layout = detect_layout(&bytes, finalize);
        }

        match cursor.layout {
            Layout::Unknown => {
                cursor.deferred = !bytes.is_empty();
                Ok(0)
            }
            Layout::Document => self.ingest_document(path, cursor, &bytes, fallback_time, finalize),
            Layout::Lines => self.ingest_lines(path, cursor, &bytes, fallback_time, finalize),
        }
    }

    fn ingest_document(
        &mut self,
        path: &Path,
        cursor: &mut FileCursor,
        bytes: &[u8],
        fallback_time: OffsetDateTime,
        finalize: bool,
    ) -> Result<usize, StoreError> {
        match serde_json::from_slice::<serde_json::Value>(bytes) {
            Ok(value) => {
                cursor.offset += bytes.len() as u64;
                cursor.deferred = false;
                Ok(self.accept(path, None, value, fallback_time))
            }
            Err(_) if !finalize => {
                cursor.deferred = true;
                Ok(0)
            }
            Err(e) => {
                // A broken document may still be a line-delimited file whose
                // first line is the corrupt one.
                if looks_line_delimited(bytes) {
                    cursor.layout = Layout::Lines;
                    return self.ingest_lines(path, cursor, bytes, fallback_time, true);
                }
                cursor.offset += bytes.len() as u64;
                cursor.deferred = false;
                self.reject(path, None, format!("invalid JSON document: {}", e));
                Ok(0)
            }
        }
    }

    fn ingest_lines(
        &mut self,
        path: &Path,
        cursor: &mut FileCursor,
        bytes: &[u8],
        fallback_time: OffsetDateTime,
        finalize: bool,
    ) -> Result<usize, StoreError> {
        let mut staged = 0;
        let mut consumed = 0usize;
        let mut rest = bytes;

        while !rest.is_empty() {
            let (line, terminated) = match rest.iter().position(|b| *b == b'\n') {
                Some(i) => (&rest[..i], true),
                None => (rest, false),
            };
            let advance = if terminated { line.len() + 1 } else { line.len() };
            let line_no = cursor.lines + 1;

            if line.iter().all(|b| b.is_ascii_whitespace()) {
                if terminated {
                    cursor.lines += 1;
                }
                consumed += advance;
                rest = &rest[advance..];
                continue;
            }

            match serde_json::from_slice::<serde_json::Value>(line) {
                Ok(value) => {
                    staged += self.accept(path, Some(line_no), value, fallback_time);
                }
                Err(_) if !terminated && !finalize => {
                    // Possibly a line the writer has not finished yet.
                    break;
                }
                Err(e) => {
                    self.reject(path, Some(line_no), format!("invalid JSON line: {}", e));
                }
            }
            if terminated {
                cursor.lines += 1;
            }
            consumed += advance;
            rest = &rest[advance..];
        }

        cursor.offset += consumed as u64;
        cursor.deferred = consumed < bytes.len();
        Ok(staged)
    }

    fn accept(
        &mut self,
        path: &Path,
        line: Option<usize>,
        value: serde_json::Value,
        fallback_time: OffsetDateTime,
    ) -> usize {
        let envelope: Envelope = match serde_json::from_value(value) {
            Ok(e) => e,
            Err(e) => {
                self.reject(path, line, format!("not a record envelope: {}", e));
                return 0;
            }
        };
        let records = match envelope.into_records(self.source, fallback_time) {
            Ok(r) => r,
            Err(message) => {
                self.reject(path, line, message);
                return 0;
            }
        };

        let exchange = self.next_exchange;
        self.next_exchange += 1;
        let count = records.len();
        for mut record in records {
            record.seq = self.next_seq;
            record.exchange = exchange;
            record.log_file = Some(path.to_path_buf());
            self.next_seq += 1;
            self.staged.push(record);
        }
        count
    }

    fn reject(&mut self, path: &Path, line: Option<usize>, message: String) {
        let error = DeserializationError {
            file: path.to_path_buf(),
            line,
            message,
        };
        warn!(source = %self.source, error = %error, "skipping corrupt record");
        self.errors.push(error);
    }
}

fn read_from(path: &Path, offset: u64) -> Result<Vec<u8>, StoreError> {
    let mut file = File::open(path).map_err(|e| StoreError::io(path, e))?;
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| StoreError::io(path, e))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)
        .map_err(|e| StoreError::io(path, e))?;
    Ok(bytes)
}

fn file_time(path: &Path) -> OffsetDateTime {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(OffsetDateTime::from)
        .unwrap_or_else(|_| OffsetDateTime::now_utc())
}

/// A file whose first complete line is a JSON value on its own is
/// line-delimited; anything else is treated as one document.
fn detect_layout(bytes: &[u8], finalize: bool) -> Layout {
    let trimmed_start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let body = &bytes[trimmed_start..];
    if body.is_empty() {
        return Layout::Unknown;
    }
    match body.iter().position(|b| *b == b'\n') {
        Some(i) => {
            if serde_json::from_slice::<serde_json::Value>(&body[..i]).is_ok() {
                Layout::Lines
            } else {
                Layout::Document
            }
        }
        // A single unterminated line reads the same either way.
        None if finalize => Layout::Lines,
        None => {
            if serde_json::from_slice::<serde_json::Value>(body).is_ok() {
                Layout::Lines
            } else {
                Layout::Unknown
            }
        }
    }
}

fn looks_line_delimited(bytes: &[u8]) -> bool {
    bytes
        .split(|b| *b == b'\n')
        .filter(|l| !l.iter().all(|b| b.is_ascii_whitespace()))
        .any(|l| {
            serde_json::from_slice::<serde_json::Value>(l)
                .map(|v| v.is_object())
                .unwrap_or(false)
        })
}
