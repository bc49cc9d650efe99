//! Local log store
//!
//! A directory of numbered, append-only segment files. Each record is framed as
//! `[MAGIC][SEQUENCE][LEN][PAYLOAD][CRC32]`, the checksum covering sequence, length
//! and payload. Records are strictly ascending by sequence across segments.
//!
//! On open every segment is validated. A record cut short at the end of the newest
//! segment is an unacknowledged torn write and is trimmed; any other damage is
//! reported as corruption.

use crate::common::{crc32, Error, Result, WalSyncPolicy};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const SEGMENT_MAGIC: [u8; 4] = [0x43, 0x57, 0x4C, 0x31]; // "CWL1"
const HEADER_LEN: usize = 4 + 8 + 4;
const MAX_RECORD_BYTES: usize = 256 * 1024 * 1024;
const SEGMENT_EXT: &str = "seg";

/// A framed record read back from a segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub sequence: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
struct Segment {
    number: u64,
    path: PathBuf,
    first_sequence: Option<u64>,
    last_sequence: Option<u64>,
    bytes: u64,
}

/// Append-only log split over numbered segment files
pub struct SegmentLog {
    dir: PathBuf,
    segments: Vec<Segment>,
    writer: Option<BufWriter<File>>,
    max_segment_bytes: u64,
    sync_policy: WalSyncPolicy,
}

enum Frame {
    Record(LogRecord, u64),
    End,
    Torn,
}

impl SegmentLog {
    /// Open or create the log in `dir`, validating existing segments.
    pub fn open(
        dir: impl AsRef<Path>,
        max_segment_bytes: u64,
        sync_policy: WalSyncPolicy,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut numbers = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXT) {
                continue;
            }
            let number = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or_else(|| {
                    Error::Corrupted(format!("unexpected segment file {}", path.display()))
                })?;
            numbers.push(number);
        }
        numbers.sort_unstable();

        let mut segments = Vec::with_capacity(numbers.len());
        let mut previous: Option<u64> = None;
        let newest = numbers.last().copied();
        for number in numbers {
            let path = segment_path(&dir, number);
            let segment = Self::scan_segment(number, path, Some(number) == newest, &mut previous)?;
            segments.push(segment);
        }

        Ok(Self {
            dir,
            segments,
            writer: None,
            max_segment_bytes,
            sync_policy,
        })
    }

    /// Validate one segment, trimming a torn tail if it is the newest.
    fn scan_segment(
        number: u64,
        path: PathBuf,
        is_newest: bool,
        previous: &mut Option<u64>,
    ) -> Result<Segment> {
        let file = File::open(&path)?;
        let mut reader = BufReader::new(file);
        let mut segment = Segment {
            number,
            path,
            first_sequence: None,
            last_sequence: None,
            bytes: 0,
        };

        loop {
            match read_frame(&mut reader)? {
                Frame::Record(record, len) => {
                    if previous.map_or(false, |p| record.sequence <= p) {
                        return Err(Error::Corrupted(format!(
                            "sequence {} out of order in {}",
                            record.sequence,
                            segment.path.display()
                        )));
                    }
                    *previous = Some(record.sequence);
                    segment.first_sequence.get_or_insert(record.sequence);
                    segment.last_sequence = Some(record.sequence);
                    segment.bytes += len;
                }
                Frame::End => break,
                Frame::Torn if is_newest => {
                    tracing::warn!(
                        "Trimming torn record at offset {} of {}",
                        segment.bytes,
                        segment.path.display()
                    );
                    let file = OpenOptions::new().write(true).open(&segment.path)?;
                    file.set_len(segment.bytes)?;
                    file.sync_all()?;
                    break;
                }
                Frame::Torn => {
                    return Err(Error::Corrupted(format!(
                        "truncated record inside sealed segment {}",
                        segment.path.display()
                    )));
                }
            }
        }

        Ok(segment)
    }

    /// Append a record. Sequences must be strictly increasing.
    pub fn append(&mut self, sequence: u64, payload: &[u8]) -> Result<u64> {
        if let Some(last) = self.last_sequence() {
            if sequence <= last {
                return Err(Error::Wal(format!(
                    "sequence {} not above last sequence {}",
                    sequence, last
                )));
            }
        }
        if payload.len() > MAX_RECORD_BYTES {
            return Err(Error::Wal(format!(
                "record of {} bytes exceeds the {} byte limit",
                payload.len(),
                MAX_RECORD_BYTES
            )));
        }

        self.roll_if_needed()?;
        let frame = encode_frame(sequence, payload);
        let written = match self.active_writer() {
            Ok(writer) => writer.write_all(&frame).map_err(Error::from),
            Err(e) => Err(e),
        };
        if let Err(e) = written.and_then(|_| self.sync()) {
            if let Err(trim) = self.discard_unacknowledged() {
                tracing::error!("Failed to trim WAL segment after a failed append: {}", trim);
            }
            return Err(e);
        }

        if let Some(active) = self.segments.last_mut() {
            active.first_sequence.get_or_insert(sequence);
            active.last_sequence = Some(sequence);
            active.bytes += frame.len() as u64;
        }
        Ok(frame.len() as u64)
    }

    /// Drop buffered bytes and cut the active segment back to its last complete
    /// record. The writer is reopened by the next append.
    fn discard_unacknowledged(&mut self) -> Result<()> {
        let Some(writer) = self.writer.take() else {
            return Ok(());
        };
        let (file, _unwritten) = writer.into_parts();
        let Some(active) = self.segments.last() else {
            return Ok(());
        };
        tracing::warn!(
            "Discarding partial record at offset {} of {}",
            active.bytes,
            active.path.display()
        );
        file.set_len(active.bytes)?;
        file.sync_all()?;
        Ok(())
    }

    fn roll_if_needed(&mut self) -> Result<()> {
        let needs_new = match self.segments.last() {
            None => true,
            Some(active) => active.bytes >= self.max_segment_bytes,
        };
        if !needs_new {
            return Ok(());
        }

        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        let number = self.segments.last().map_or(1, |s| s.number + 1);
        let path = segment_path(&self.dir, number);
        tracing::debug!("Starting WAL segment {}", path.display());
        self.segments.push(Segment {
            number,
            path,
            first_sequence: None,
            last_sequence: None,
            bytes: 0,
        });
        Ok(())
    }

    fn active_writer(&mut self) -> Result<&mut BufWriter<File>> {
        if self.writer.is_none() {
            let active = self
                .segments
                .last()
                .ok_or_else(|| Error::Wal("no active segment".into()))?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&active.path)?;
            self.writer = Some(BufWriter::new(file));
        }
        self.writer
            .as_mut()
            .ok_or_else(|| Error::Wal("no active segment".into()))
    }

    /// Sync based on policy
    fn sync(&mut self) -> Result<()> {
        let policy = self.sync_policy;
        if let Some(writer) = self.writer.as_mut() {
            match policy {
                WalSyncPolicy::Always => {
                    writer.flush()?;
                    writer.get_ref().sync_all()?;
                }
                WalSyncPolicy::Interval => writer.flush()?,
                WalSyncPolicy::Never => {}
            }
        }
        Ok(())
    }

    /// Flush buffered records and fsync the active segment
    pub fn sync_all(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        Ok(())
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.segments.iter().rev().find_map(|s| s.last_sequence)
    }

    pub fn first_sequence(&self) -> Option<u64> {
        self.segments.iter().find_map(|s| s.first_sequence)
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn size_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.bytes).sum()
    }

    /// Iterate records with sequence >= `from`, up to the last record appended so far.
    pub fn read_from(&mut self, from: u64) -> Result<SegmentIter> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        let end = self.last_sequence();
        let paths = self
            .segments
            .iter()
            .filter(|s| s.last_sequence.map_or(false, |last| last >= from))
            .map(|s| s.path.clone())
            .collect();
        Ok(SegmentIter {
            paths,
            current: None,
            from,
            end,
            done: end.is_none(),
        })
    }

    /// Delete sealed segments whose records all have sequence <= `through`.
    ///
    /// The active segment is never deleted. Returns the number of segments removed.
    pub fn remove_through(&mut self, through: u64) -> Result<usize> {
        let sealed = self.segments.len().saturating_sub(1);
        let mut removable = 0;
        for segment in &self.segments[..sealed] {
            match segment.last_sequence {
                Some(last) if last > through => break,
                _ => removable += 1,
            }
        }

        for segment in self.segments.drain(..removable) {
            tracing::debug!("Removing WAL segment {}", segment.path.display());
            std::fs::remove_file(&segment.path)?;
        }
        Ok(removable)
    }

    /// Remove every segment and the directory itself
    pub fn destroy(mut self) -> Result<()> {
        self.writer = None;
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Iterator over records of a [`SegmentLog`]
pub struct SegmentIter {
    paths: std::collections::VecDeque<PathBuf>,
    current: Option<BufReader<File>>,
    from: u64,
    end: Option<u64>,
    done: bool,
}

impl SegmentIter {
    fn next_record(&mut self) -> Result<Option<LogRecord>> {
        loop {
            if self.current.is_none() {
                match self.paths.pop_front() {
                    Some(path) => self.current = Some(BufReader::new(File::open(path)?)),
                    None => return Ok(None),
                }
            }
            let reader = match self.current.as_mut() {
                Some(reader) => reader,
                None => return Ok(None),
            };
            match read_frame(reader)? {
                Frame::Record(record, _) => {
                    if self.end.map_or(false, |end| record.sequence > end) {
                        return Ok(None);
                    }
                    if record.sequence >= self.from {
                        return Ok(Some(record));
                    }
                }
                Frame::End => self.current = None,
                Frame::Torn => {
                    return Err(Error::Corrupted("truncated WAL record during replay".into()))
                }
            }
        }
    }
}

impl Iterator for SegmentIter {
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_record() {
            Ok(Some(record)) => {
                if Some(record.sequence) == self.end {
                    self.done = true;
                }
                Some(Ok(record))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

fn segment_path(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{:08}.{}", number, SEGMENT_EXT))
}

fn encode_frame(sequence: u64, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len() + 4);
    frame.extend_from_slice(&SEGMENT_MAGIC);
    frame.extend_from_slice(&sequence.to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    let checksum = crc32(&frame[4..]);
    frame.extend_from_slice(&checksum.to_le_bytes());
    frame
}

/// Read into `buf` until full or EOF, returning the bytes read.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut read = 0;
    while read < buf.len() {
        match reader.read(&mut buf[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(read)
}

fn read_frame<R: Read>(reader: &mut R) -> Result<Frame> {
    let mut header = [0u8; HEADER_LEN];
    match fill(reader, &mut header)? {
        0 => return Ok(Frame::End),
        n if n < HEADER_LEN => return Ok(Frame::Torn),
        _ => {}
    }

    if header[0..4] != SEGMENT_MAGIC {
        return Err(Error::Corrupted("invalid WAL record magic".into()));
    }

    let mut seq_bytes = [0u8; 8];
    seq_bytes.copy_from_slice(&header[4..12]);
    let sequence = u64::from_le_bytes(seq_bytes);

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&header[12..16]);
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_RECORD_BYTES {
        return Err(Error::Corrupted(format!(
            "record length {} exceeds limit",
            len
        )));
    }

    let mut body = vec![0u8; len + 4];
    if fill(reader, &mut body)? < body.len() {
        return Ok(Frame::Torn);
    }

    let mut crc_bytes = [0u8; 4];
    crc_bytes.copy_from_slice(&body[len..]);
    let stored = u32::from_le_bytes(crc_bytes);
    body.truncate(len);

    let mut checksum_data = Vec::with_capacity(12 + len);
    checksum_data.extend_from_slice(&header[4..]);
    checksum_data.extend_from_slice(&body);
    let computed = crc32(&checksum_data);
    if computed != stored {
        return Err(Error::ChecksumMismatch {
            expected: stored,
            actual: computed,
        });
    }

    Ok(Frame::Record(
        LogRecord {
            sequence,
            payload: body,
        },
        (HEADER_LEN + len + 4) as u64,
    ))
}
