//! Retention sweep for archive bundles
//!
//! Bundles are removed when they are older than the retention window or
//! explicitly marked removable. Before deleting, the sweeper recomputes the
//! bundle's content checksum and checks it against the read leases held by
//! importers and downloads; a leased bundle is left alone.
//!
//! The sweep keeps no counters of its own. Every decision is derived from
//! the directory contents, so running it repeatedly is always safe.

use crate::error::BundleResult;
use crate::types::ARCHIVE_EXTENSION;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::Xxh3;

/// Suffix of the sidecar file that marks a bundle removable
pub const REMOVABLE_MARKER_SUFFIX: &str = ".removable";

/// Content-addressed read leases on bundles
///
/// Readers hold a [`LeaseGuard`] for as long as they read a bundle.
#[derive(Debug, Default)]
pub struct ArchiveLeases {
    held: Mutex<HashMap<String, usize>>,
}

impl ArchiveLeases {
    /// Create an empty lease table
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Lease a bundle by content checksum
    pub fn acquire(self: &Arc<Self>, checksum: impl Into<String>) -> LeaseGuard {
        let checksum = checksum.into();
        *self.held.lock().entry(checksum.clone()).or_insert(0) += 1;
        LeaseGuard {
            leases: Arc::clone(self),
            checksum,
        }
    }

    /// Lease a bundle file, computing its checksum
    pub fn lease_file(self: &Arc<Self>, path: &Path) -> BundleResult<LeaseGuard> {
        Ok(self.acquire(file_checksum(path)?))
    }

    /// Whether any reader holds a lease on this checksum
    pub fn is_leased(&self, checksum: &str) -> bool {
        self.held.lock().get(checksum).is_some_and(|n| *n > 0)
    }

    fn release(&self, checksum: &str) {
        let mut held = self.held.lock();
        if let Some(count) = held.get_mut(checksum) {
            *count -= 1;
            if *count == 0 {
                held.remove(checksum);
            }
        }
    }
}

/// Lease on one bundle; released on drop
#[derive(Debug)]
pub struct LeaseGuard {
    leases: Arc<ArchiveLeases>,
    checksum: String,
}

impl LeaseGuard {
    /// Checksum of the leased bundle
    pub fn checksum(&self) -> &str {
        &self.checksum
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.leases.release(&self.checksum);
    }
}

/// Streaming xxh3 checksum of a file, in the same format as [`crate::xxh3_hex`]
pub fn file_checksum(path: &Path) -> io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Xxh3::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:016x}", hasher.digest()))
}

/// Mark a bundle for removal on the next sweep
pub fn mark_removable(bundle: &Path) -> io::Result<()> {
    fs::write(marker_path(bundle), b"")
}

fn marker_path(bundle: &Path) -> PathBuf {
    let mut name = bundle
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(REMOVABLE_MARKER_SUFFIX);
    bundle.with_file_name(name)
}

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Bundles examined
    pub scanned: usize,
    /// Bundles deleted
    pub removed: Vec<PathBuf>,
    /// Candidates left in place because a reader holds a lease
    pub leased: Vec<PathBuf>,
    /// Orphaned temp files of aborted jobs that were deleted
    pub temp_files_removed: usize,
}

/// Deletes expired or removable bundles from an archive directory
#[derive(Debug, Clone)]
pub struct RetentionSweeper {
    dir: PathBuf,
    max_age: Duration,
    leases: Arc<ArchiveLeases>,
}

impl RetentionSweeper {
    /// Create a sweeper over `dir`
    pub fn new(dir: impl Into<PathBuf>, max_age: Duration, leases: Arc<ArchiveLeases>) -> Self {
        Self {
            dir: dir.into(),
            max_age,
            leases,
        }
    }

    /// Remove every expired or removable bundle that is not leased
    pub fn remove_expired(&self, now: SystemTime) -> BundleResult<SweepReport> {
        let mut report = SweepReport::default();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if name.ends_with(&format!("{}.tmp", ARCHIVE_EXTENSION)) {
                if self.is_expired(&path, now)? && remove_if_present(&path)? {
                    report.temp_files_removed += 1;
                }
                continue;
            }
            if !name.ends_with(ARCHIVE_EXTENSION) {
                continue;
            }
            report.scanned += 1;

            let removable = marker_path(&path).exists();
            if !removable && !self.is_expired(&path, now)? {
                continue;
            }

            let checksum = match file_checksum(&path) {
                Ok(c) => c,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if self.leases.is_leased(&checksum) {
                debug!(
                    target: "folio::retention",
                    path = %path.display(),
                    "Bundle is leased, keeping"
                );
                report.leased.push(path);
                continue;
            }

            if remove_if_present(&path)? {
                let _ = remove_if_present(&marker_path(&path));
                report.removed.push(path);
            }
        }

        if !report.removed.is_empty() {
            info!(
                target: "folio::retention",
                dir = %self.dir.display(),
                removed = report.removed.len(),
                leased = report.leased.len(),
                "Expired archives removed"
            );
        }
        Ok(report)
    }

    fn is_expired(&self, path: &Path, now: SystemTime) -> BundleResult<bool> {
        let modified = match fs::metadata(path).and_then(|m| m.modified()) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        // Clock skew: a file from the future is never expired
        Ok(now
            .duration_since(modified)
            .map(|age| age > self.max_age)
            .unwrap_or(false))
    }
}

fn remove_if_present(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => {
            warn!(
                target: "folio::retention",
                path = %path.display(),
                error = %e,
                "Failed to remove"
            );
            Err(e)
        }
    }
}
