//! Write-Ahead Log Bridge
//!
//! The ledger and the DLQ audit trail are authoritative in the WAL;
//! everything in Redis is a projection. The core only needs an
//! append-only sink with monotonic offsets and an exactly-once,
//! in-order replay, so the capability is a trait and the default
//! implementation is a checksummed JSONL file.
//!
//! File format, one record per line:
//!
//! ```text
//! {offset:016x} {crc32:08x} {envelope-json}\n
//! ```
//!
//! A successful `append` implies the line reached the OS page cache.
//! Replay verifies the checksum per line and stops at the first torn
//! or corrupt line (only the tail can be torn under a crash), logging
//! how much was recovered.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// The persisted event envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalRecord {
    pub namespace: String,
    pub operation: String,
    pub path: String,
    pub payload: serde_json::Value,
    /// Assigned by the sink on append; monotonic per process.
    pub offset: u64,
}

#[derive(Debug)]
pub enum WalError {
    Io(std::io::Error),
    Serialize(serde_json::Error),
}

impl fmt::Display for WalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WalError::Io(e) => write!(f, "wal io error: {}", e),
            WalError::Serialize(e) => write!(f, "wal serialization error: {}", e),
        }
    }
}

impl std::error::Error for WalError {}

impl From<std::io::Error> for WalError {
    fn from(e: std::io::Error) -> Self {
        WalError::Io(e)
    }
}

impl From<serde_json::Error> for WalError {
    fn from(e: serde_json::Error) -> Self {
        WalError::Serialize(e)
    }
}

/// Append-only event sink consumed by the ledger and DLQ audit.
pub trait WalSink: Send + Sync {
    /// Persist one event. Returns the assigned monotonic offset.
    fn append(
        &self,
        namespace: &str,
        operation: &str,
        path: &str,
        payload: serde_json::Value,
    ) -> Result<u64, WalError>;

    /// Re-deliver every persisted record exactly once, in order.
    fn replay(&self, handler: &mut dyn FnMut(WalRecord)) -> Result<(), WalError>;
}

// =============================================================================
// CRC32 (IEEE)
// =============================================================================

fn crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut c = i as u32;
        let mut k = 0;
        while k < 8 {
            c = if c & 1 != 0 { 0xEDB8_8320 ^ (c >> 1) } else { c >> 1 };
            k += 1;
        }
        table[i] = c;
        i += 1;
    }
    table
}

fn crc32(data: &[u8]) -> u32 {
    let table = crc32_table();
    let mut c = 0xFFFF_FFFFu32;
    for &b in data {
        c = table[((c ^ b as u32) & 0xFF) as usize] ^ (c >> 8);
    }
    c ^ 0xFFFF_FFFF
}

// =============================================================================
// FILE WAL
// =============================================================================

struct FileWalInner {
    writer: BufWriter<File>,
    next_offset: u64,
}

/// Checksummed append-only JSONL file. Single writer per process;
/// appends serialize on the inner lock.
pub struct FileWal {
    path: PathBuf,
    inner: Mutex<FileWalInner>,
}

impl FileWal {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        // Scan existing records to recover the next offset. A torn
        // tail is truncated so the next append starts on a clean line.
        let mut next_offset = 1u64;
        let mut recovered = 0u64;
        if path.exists() {
            let mut good_bytes = 0u64;
            let reader = BufReader::new(File::open(&path)?);
            let mut torn = false;
            for line in reader.lines() {
                let line = line?;
                match parse_line(&line) {
                    Some(record) => {
                        next_offset = record.offset + 1;
                        recovered += 1;
                        good_bytes += line.len() as u64 + 1;
                    }
                    None => {
                        torn = true;
                        break;
                    }
                }
            }
            if torn {
                warn!(
                    path = %path.display(),
                    truncate_to = good_bytes,
                    "torn or corrupt wal tail; truncating to last good record"
                );
                let f = OpenOptions::new().write(true).open(&path)?;
                f.set_len(good_bytes)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!(
            path = %path.display(),
            records = recovered,
            next_offset = next_offset,
            "opened wal"
        );

        Ok(FileWal {
            path,
            inner: Mutex::new(FileWalInner {
                writer: BufWriter::new(file),
                next_offset,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn format_line(record: &WalRecord) -> Result<String, WalError> {
    let json = serde_json::to_string(record)?;
    let crc = crc32(json.as_bytes());
    Ok(format!("{:016x} {:08x} {}", record.offset, crc, json))
}

fn parse_line(line: &str) -> Option<WalRecord> {
    let mut parts = line.splitn(3, ' ');
    let offset = u64::from_str_radix(parts.next()?, 16).ok()?;
    let crc = u32::from_str_radix(parts.next()?, 16).ok()?;
    let json = parts.next()?;
    if crc32(json.as_bytes()) != crc {
        return None;
    }
    let record: WalRecord = serde_json::from_str(json).ok()?;
    if record.offset != offset {
        return None;
    }
    Some(record)
}

impl WalSink for FileWal {
    fn append(
        &self,
        namespace: &str,
        operation: &str,
        path: &str,
        payload: serde_json::Value,
    ) -> Result<u64, WalError> {
        let mut inner = self.inner.lock();
        let offset = inner.next_offset;
        let record = WalRecord {
            namespace: namespace.to_string(),
            operation: operation.to_string(),
            path: path.to_string(),
            payload,
            offset,
        };
        let line = format_line(&record)?;
        inner.writer.write_all(line.as_bytes())?;
        inner.writer.write_all(b"\n")?;
        // Durability target is the OS page cache, not fsync.
        inner.writer.flush()?;
        inner.next_offset = offset + 1;
        Ok(offset)
    }

    fn replay(&self, handler: &mut dyn FnMut(WalRecord)) -> Result<(), WalError> {
        // Hold the writer lock so replay sees a quiesced file.
        let mut inner = self.inner.lock();
        inner.writer.flush()?;

        let reader = BufReader::new(File::open(&self.path)?);
        for line in reader.lines() {
            let line = line?;
            match parse_line(&line) {
                Some(record) => handler(record),
                None => {
                    warn!(path = %self.path.display(), "torn or corrupt wal tail; replay stops here");
                    break;
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// MEMORY WAL
// =============================================================================

/// In-process sink for tests. No durability.
#[derive(Default)]
pub struct MemoryWal {
    records: Mutex<Vec<WalRecord>>,
}

impl MemoryWal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Snapshot for assertions.
    pub fn records(&self) -> Vec<WalRecord> {
        self.records.lock().clone()
    }
}

impl WalSink for MemoryWal {
    fn append(
        &self,
        namespace: &str,
        operation: &str,
        path: &str,
        payload: serde_json::Value,
    ) -> Result<u64, WalError> {
        let mut records = self.records.lock();
        let offset = records.len() as u64 + 1;
        records.push(WalRecord {
            namespace: namespace.to_string(),
            operation: operation.to_string(),
            path: path.to_string(),
            payload,
            offset,
        });
        Ok(offset)
    }

    fn replay(&self, handler: &mut dyn FnMut(WalRecord)) -> Result<(), WalError> {
        for record in self.records.lock().iter() {
            handler(record.clone());
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_memory_wal_offsets_monotonic() {
        let wal = MemoryWal::new();
        let a = wal.append("ledger", "billing_reserve", "r1", json!({"a": 1})).unwrap();
        let b = wal.append("ledger", "billing_commit", "r1", json!({"b": 2})).unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_file_wal_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.wal");

        let wal = FileWal::open(&path).unwrap();
        wal.append("ledger", "billing_reserve", "r1", json!({"amount": "100"})).unwrap();
        wal.append("dlq", "terminal_drop", "r2", json!({"reason": "max_retries"})).unwrap();

        let mut seen = Vec::new();
        wal.replay(&mut |record| seen.push(record)).unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].namespace, "ledger");
        assert_eq!(seen[0].offset, 1);
        assert_eq!(seen[1].path, "r2");
        assert_eq!(seen[1].offset, 2);
    }

    #[test]
    fn test_file_wal_reopen_continues_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.wal");

        {
            let wal = FileWal::open(&path).unwrap();
            assert_eq!(wal.append("ledger", "op", "k", json!(1)).unwrap(), 1);
            assert_eq!(wal.append("ledger", "op", "k", json!(2)).unwrap(), 2);
        }

        let wal = FileWal::open(&path).unwrap();
        assert_eq!(wal.append("ledger", "op", "k", json!(3)).unwrap(), 3);

        let mut offsets = Vec::new();
        wal.replay(&mut |r| offsets.push(r.offset)).unwrap();
        assert_eq!(offsets, vec![1, 2, 3]);
    }

    #[test]
    fn test_file_wal_tolerates_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.wal");

        {
            let wal = FileWal::open(&path).unwrap();
            wal.append("ledger", "op", "k", json!({"v": 1})).unwrap();
            wal.append("ledger", "op", "k", json!({"v": 2})).unwrap();
        }

        // Simulate a crash mid-append: garbage partial line at the tail.
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(b"00000000000000003 deadbeef {\"trunc").unwrap();
        }

        let wal = FileWal::open(&path).unwrap();
        let mut seen = Vec::new();
        wal.replay(&mut |r| seen.push(r.offset)).unwrap();
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn test_crc_detects_corruption() {
        let record = WalRecord {
            namespace: "ledger".into(),
            operation: "op".into(),
            path: "k".into(),
            payload: json!({"v": 1}),
            offset: 7,
        };
        let line = format_line(&record).unwrap();
        assert!(parse_line(&line).is_some());

        let tampered = line.replace("\"v\":1", "\"v\":2");
        assert!(parse_line(&tampered).is_none());
    }
}
