//! # File Aggregator Module
//!
//! Inbound files are received transactionally. The header parcel must pass
//! a gauntlet before any disk write happens: a file root must be configured,
//! the destination path must resolve inside it, the target volume must have
//! room, and no other in-flight transfer in this process may claim the same
//! destination. Bytes then stream into a `.temp` file next to the eventual
//! destination; on completion the payload CRC-32 is verified and the temp
//! file is renamed over the destination. Every failure path deletes the temp
//! file and releases the destination registration.

use crate::error::file_code;
use crate::wire::{ObjectHeader, Parcel, Priority};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Headroom required on the target volume beyond the announced size
const FREE_SPACE_SLACK: u64 = 1024 * 1024;

/// Why an inbound file transfer was aborted
#[derive(Debug, thiserror::Error)]
pub(crate) enum FileAbort {
    #[error("destination assignment failed: {0}")]
    Assignment(String),
    #[error("payload CRC-32 mismatch: header {expected:#010x}, computed {actual:#010x}")]
    Crc { expected: u32, actual: u32 },
    #[error("parcel out of sync: got sequence {got}, expected {expected}")]
    OutOfSync { got: u32, expected: u32 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FileAbort {
    /// Wire reason carried in the FAIL signal toward the sender
    pub fn fail_reason(&self) -> i32 {
        match self {
            Self::Crc { .. } => crate::error::fail_reason::CRC,
            _ => crate::error::fail_reason::ASSIGNMENT,
        }
    }

    /// Info code of the local FILE_ABORTED event
    pub fn local_code(&self) -> i32 {
        match self {
            Self::Crc { .. } => file_code::CRC_FAILURE,
            _ => file_code::IN_LOCAL_ASSIGNMENT,
        }
    }
}

/// Progress of an in-flight inbound file
#[derive(Debug)]
pub(crate) enum FileProgress {
    More,
    Complete,
}

static ACTIVE_DESTINATIONS: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();

fn active() -> &'static Mutex<HashSet<PathBuf>> {
    ACTIVE_DESTINATIONS.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Claim a destination for one transfer; at most one in-flight transfer per
/// canonical path across the whole process.
fn try_register(path: &Path) -> bool {
    active().lock().insert(path.to_path_buf())
}

fn release(path: &Path) {
    active().lock().remove(path);
}

/// Number of registered in-flight destinations; used by tests
pub fn active_destination_count() -> usize {
    active().lock().len()
}

/// Restore factory state; used by tests
pub fn reset() {
    active().lock().clear();
}

/// Resolve the sender-supplied relative path against the receiver's root.
/// Only plain name components are allowed, so the resolution can never
/// escape the root.
fn resolve_destination(root: &Path, relative: &str) -> Result<PathBuf, FileAbort> {
    if relative.is_empty() {
        return Err(FileAbort::Assignment("empty destination path".into()));
    }
    let relative = Path::new(relative);
    if relative.is_absolute() {
        return Err(FileAbort::Assignment(format!(
            "absolute destination path {} refused",
            relative.display()
        )));
    }
    for component in relative.components() {
        match component {
            Component::Normal(name) => {
                if name.is_empty() {
                    return Err(FileAbort::Assignment("empty path component".into()));
                }
            }
            _ => {
                return Err(FileAbort::Assignment(format!(
                    "destination path {} escapes the file root",
                    relative.display()
                )))
            }
        }
    }
    let root = root
        .canonicalize()
        .map_err(|e| FileAbort::Assignment(format!("file root unusable: {}", e)))?;
    Ok(root.join(relative))
}

#[cfg(unix)]
fn free_space(path: &Path) -> Option<u64> {
    nix::sys::statvfs::statvfs(path)
        .ok()
        .map(|s| s.blocks_available() as u64 * s.fragment_size() as u64)
}

#[cfg(not(unix))]
fn free_space(_path: &Path) -> Option<u64> {
    None
}

/// Reassembles one inbound file transfer into a temp file
#[derive(Debug)]
pub(crate) struct FileAssembler {
    pub object_id: u64,
    pub priority: Priority,
    expected_size: u64,
    expected_parcels: u32,
    next_seq: u32,
    received: u64,
    crc_expected: Option<u32>,
    hasher: crc32fast::Hasher,
    temp_path: PathBuf,
    dest_path: PathBuf,
    file: Option<fs::File>,
    started: Instant,
    /// Cleanup already ran (completed or aborted); disables the Drop net
    settled: bool,
}

impl FileAssembler {
    /// Validate the header parcel's announcement and open the temp file.
    /// Nothing is left behind when this fails.
    pub fn create(
        object_id: u64,
        priority: Priority,
        header: &ObjectHeader,
        file_root: Option<&Path>,
        max_file_size: Option<u64>,
    ) -> Result<Self, FileAbort> {
        let root = file_root.ok_or_else(|| {
            FileAbort::Assignment("no file reception configured on this connection".into())
        })?;
        let relative = header
            .path
            .as_deref()
            .ok_or_else(|| FileAbort::Assignment("file header carries no destination".into()))?;

        if let Some(limit) = max_file_size {
            if header.expected_size > limit {
                return Err(FileAbort::Assignment(format!(
                    "announced size {} exceeds the {} byte file limit",
                    header.expected_size, limit
                )));
            }
        }

        let dest_path = resolve_destination(root, relative)?;
        if dest_path.is_dir() {
            return Err(FileAbort::Assignment(format!(
                "destination {} is an existing directory",
                dest_path.display()
            )));
        }
        if let Some(parent) = dest_path.parent() {
            fs::create_dir_all(parent)?;
            if let Some(available) = free_space(parent) {
                if header.expected_size + FREE_SPACE_SLACK > available {
                    return Err(FileAbort::Assignment(format!(
                        "insufficient space for {} bytes (volume has {})",
                        header.expected_size, available
                    )));
                }
            }
        }

        if !try_register(&dest_path) {
            return Err(FileAbort::Assignment(format!(
                "destination {} is already the target of another transfer",
                dest_path.display()
            )));
        }

        let temp_path = temp_name(&dest_path);
        let file = match fs::File::create(&temp_path) {
            Ok(file) => file,
            Err(e) => {
                release(&dest_path);
                return Err(e.into());
            }
        };
        debug!(
            object_id,
            dest = %dest_path.display(),
            size = header.expected_size,
            "file reception started"
        );

        Ok(Self {
            object_id,
            priority,
            expected_size: header.expected_size,
            expected_parcels: header.expected_parcels,
            next_seq: 0,
            received: 0,
            crc_expected: header.crc32,
            hasher: crc32fast::Hasher::new(),
            temp_path,
            dest_path,
            file: Some(file),
            started: Instant::now(),
            settled: false,
        })
    }

    /// Append one parcel's bytes. The caller aborts the transfer on error.
    pub fn absorb(&mut self, parcel: &Parcel) -> Result<FileProgress, FileAbort> {
        if parcel.sequence != self.next_seq {
            return Err(FileAbort::OutOfSync {
                got: parcel.sequence,
                expected: self.next_seq,
            });
        }
        if self.received + parcel.payload.len() as u64 > self.expected_size {
            return Err(FileAbort::Assignment(format!(
                "file {} payload overflows its announced size of {} bytes",
                self.object_id, self.expected_size
            )));
        }
        let file = self.file.as_mut().expect("absorb after settle");
        file.write_all(&parcel.payload)?;
        self.hasher.update(&parcel.payload);
        self.received += parcel.payload.len() as u64;
        self.next_seq += 1;

        if self.next_seq == self.expected_parcels {
            if self.received != self.expected_size {
                return Err(FileAbort::Assignment(format!(
                    "file {} ended with {} bytes, header announced {}",
                    self.object_id, self.received, self.expected_size
                )));
            }
            return Ok(FileProgress::Complete);
        }
        Ok(FileProgress::More)
    }

    /// Verify and move the temp file to its destination. On any failure the
    /// temp file is removed and the destination released.
    pub fn finish(mut self) -> Result<(PathBuf, u64), FileAbort> {
        match self.try_finish() {
            Ok(done) => {
                self.settled = true;
                release(&self.dest_path);
                Ok(done)
            }
            Err(e) => {
                self.settle();
                Err(e)
            }
        }
    }

    fn try_finish(&mut self) -> Result<(PathBuf, u64), FileAbort> {
        let mut file = self.file.take().expect("finish after settle");
        file.flush()?;
        drop(file);

        if let Some(expected) = self.crc_expected {
            let actual = self.hasher.clone().finalize();
            if actual != expected {
                return Err(FileAbort::Crc { expected, actual });
            }
        }
        if self.dest_path.exists() {
            fs::remove_file(&self.dest_path)?;
        }
        fs::rename(&self.temp_path, &self.dest_path)?;
        info!(
            object_id = self.object_id,
            dest = %self.dest_path.display(),
            size = self.received,
            elapsed = ?self.started.elapsed(),
            "file received"
        );
        Ok((self.dest_path.clone(), self.received))
    }

    /// Destination this transfer resolves to
    pub fn destination(&self) -> &Path {
        &self.dest_path
    }

    /// Drop the transfer: close and delete the temp file, release the
    /// destination registration.
    pub fn abort(mut self) {
        self.settle();
    }

    fn settle(&mut self) {
        if self.settled {
            return;
        }
        self.settled = true;
        self.file.take();
        if let Err(e) = fs::remove_file(&self.temp_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    "could not remove temp file {}: {}",
                    self.temp_path.display(),
                    e
                );
            }
        }
        release(&self.dest_path);
    }
}

impl Drop for FileAssembler {
    fn drop(&mut self) {
        self.settle();
    }
}

fn temp_name(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(".temp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Channel;

    fn header(size: u64, parcels: u32, path: &str, crc32: Option<u32>) -> ObjectHeader {
        ObjectHeader {
            method: 0,
            expected_size: size,
            expected_parcels: parcels,
            path: Some(path.into()),
            crc32,
        }
    }

    fn parcel(object_id: u64, sequence: u32, payload: Vec<u8>) -> Parcel {
        Parcel {
            channel: Channel::File,
            priority: Priority::Normal,
            object_id,
            sequence,
            header: None,
            payload,
        }
    }

    fn assembler(root: &Path, h: &ObjectHeader) -> Result<FileAssembler, FileAbort> {
        FileAssembler::create(1, Priority::Normal, h, Some(root), None)
    }

    #[test]
    fn receives_and_renames_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let content = b"hello parcel world".to_vec();
        let crc = crc32fast::hash(&content);
        let h = header(content.len() as u64, 2, "in/greeting.txt", Some(crc));

        let mut asm = assembler(dir.path(), &h).unwrap();
        assert!(matches!(
            asm.absorb(&parcel(1, 0, content[..10].to_vec())).unwrap(),
            FileProgress::More
        ));
        assert!(matches!(
            asm.absorb(&parcel(1, 1, content[10..].to_vec())).unwrap(),
            FileProgress::Complete
        ));

        let (path, size) = asm.finish().unwrap();
        assert_eq!(size, content.len() as u64);
        assert_eq!(fs::read(&path).unwrap(), content);
        assert!(!temp_name(&path).exists());

        // the destination registration was released
        assembler(dir.path(), &h).unwrap().abort();
    }

    #[test]
    fn crc_mismatch_aborts_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let content = b"corrupted in transit".to_vec();
        let h = header(content.len() as u64, 1, "bad.bin", Some(0x1234_5678));

        let mut asm = assembler(dir.path(), &h).unwrap();
        asm.absorb(&parcel(1, 0, content)).unwrap();
        let dest = asm.destination().to_path_buf();
        let err = asm.finish().unwrap_err();
        assert!(matches!(err, FileAbort::Crc { .. }));
        assert_eq!(err.fail_reason(), crate::error::fail_reason::CRC);
        assert_eq!(err.local_code(), file_code::CRC_FAILURE);
        assert!(!dest.exists());
        assert!(!temp_name(&dest).exists());

        // the destination registration was released
        assembler(dir.path(), &h).unwrap().abort();
    }

    #[test]
    fn escaping_path_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let h = header(10, 1, "../../etc/passwd", None);
        let err = assembler(dir.path(), &h).unwrap_err();
        assert!(matches!(err, FileAbort::Assignment(_)));
        assert_eq!(err.local_code(), file_code::IN_LOCAL_ASSIGNMENT);
    }

    #[test]
    fn absolute_path_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let h = header(10, 1, "/etc/passwd", None);
        assert!(matches!(
            assembler(dir.path(), &h).unwrap_err(),
            FileAbort::Assignment(_)
        ));
    }

    #[test]
    fn missing_root_is_refused() {
        let h = header(10, 1, "anything.bin", None);
        let err = FileAssembler::create(1, Priority::Normal, &h, None, None).unwrap_err();
        assert!(matches!(err, FileAbort::Assignment(_)));
    }

    #[test]
    fn oversized_announcement_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let h = header(2048, 1, "big.bin", None);
        let err = FileAssembler::create(1, Priority::Normal, &h, Some(dir.path()), Some(1024))
            .unwrap_err();
        assert!(matches!(err, FileAbort::Assignment(_)));
    }

    #[test]
    fn colliding_destination_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let h = header(10, 1, "same.bin", None);
        let first = assembler(dir.path(), &h).unwrap();
        let err = assembler(dir.path(), &h).unwrap_err();
        assert!(matches!(err, FileAbort::Assignment(_)));
        first.abort();

        // releasing makes the destination claimable again
        assembler(dir.path(), &h).unwrap().abort();
    }

    #[test]
    fn sequence_gap_is_out_of_sync() {
        let dir = tempfile::tempdir().unwrap();
        let h = header(20, 2, "gap.bin", None);
        let mut asm = assembler(dir.path(), &h).unwrap();
        asm.absorb(&parcel(1, 0, vec![0; 10])).unwrap();
        let err = asm.absorb(&parcel(1, 5, vec![0; 10])).unwrap_err();
        assert!(matches!(err, FileAbort::OutOfSync { .. }));
        asm.abort();
    }

    #[test]
    fn drop_cleans_up_like_abort() {
        let dir = tempfile::tempdir().unwrap();
        let h = header(20, 2, "dropped.bin", None);
        let temp = {
            let mut asm = assembler(dir.path(), &h).unwrap();
            asm.absorb(&parcel(1, 0, vec![0; 10])).unwrap();
            temp_name(asm.destination())
        };
        assert!(!temp.exists());

        // dropping released the destination like an explicit abort would
        assembler(dir.path(), &h).unwrap().abort();
    }

    #[test]
    fn existing_destination_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("replace.bin");
        fs::write(&dest, b"old content").unwrap();

        let content = b"new content".to_vec();
        let h = header(
            content.len() as u64,
            1,
            "replace.bin",
            Some(crc32fast::hash(&content)),
        );
        let mut asm = assembler(dir.path(), &h).unwrap();
        asm.absorb(&parcel(1, 0, content.clone())).unwrap();
        let (path, _) = asm.finish().unwrap();
        assert_eq!(fs::read(&path).unwrap(), content);
    }
}
