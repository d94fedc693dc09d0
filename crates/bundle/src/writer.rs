//! Archive bundle writer
//!
//! Streams units and binaries into a `.folio.tar.zst` archive. Every entry
//! is charged against the job's [`ResourceGuard`] before it is appended, so
//! a quota breach aborts while accumulating rather than at the end.
//!
//! The archive is written to a temp file and renamed on [`ArchiveWriter::finish`].
//! A writer dropped without finishing removes its temp file, which leaves
//! no partial bundle behind on any error path.

use crate::error::{BundleError, BundleResult};
use crate::guard::ResourceGuard;
use crate::retention::file_checksum;
use crate::types::{paths, xxh3_hex, ArchiveBundle, ArchiveManifest, ManifestEntry};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tar::{Builder, Header};
use tracing::debug;

type ArchiveStream = Builder<zstd::Encoder<'static, BufWriter<File>>>;

/// Streaming writer for one archive bundle
pub struct ArchiveWriter<'g> {
    path: PathBuf,
    temp_path: PathBuf,
    builder: Option<ArchiveStream>,
    guard: &'g ResourceGuard,
    entries: Vec<ManifestEntry>,
    checksums: Vec<(String, String)>,
    committed: bool,
}

impl<'g> ArchiveWriter<'g> {
    /// Start a new archive at `path`
    pub fn create(
        path: &Path,
        compression_level: i32,
        guard: &'g ResourceGuard,
    ) -> BundleResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let temp_path = temp_path_for(path);

        let file = File::create(&temp_path)?;
        let encoder = zstd::Encoder::new(BufWriter::new(file), compression_level)
            .map_err(|e| BundleError::compression(format!("zstd encoder: {}", e)))?;

        Ok(Self {
            path: path.to_path_buf(),
            temp_path,
            builder: Some(Builder::new(encoder)),
            guard,
            entries: Vec::new(),
            checksums: Vec::new(),
            committed: false,
        })
    }

    /// Append a unit file and list it in the manifest
    pub fn add_unit(&mut self, entry: ManifestEntry, data: &[u8]) -> BundleResult<()> {
        if self.entries.iter().any(|e| e.seq == entry.seq) {
            return Err(BundleError::invalid_bundle(format!(
                "unit {} written twice",
                entry.seq
            )));
        }
        self.add_file(&entry.path, data)?;
        self.entries.push(entry);
        Ok(())
    }

    /// Append a non-unit file (binary, index page)
    pub fn add_file(&mut self, rel_path: &str, data: &[u8]) -> BundleResult<()> {
        self.guard.check_and_account(data.len() as u64)?;

        let builder = self
            .builder
            .as_mut()
            .ok_or_else(|| BundleError::archive("writer already finished"))?;
        append(builder, &format!("{}/{}", paths::ROOT, rel_path), data)?;
        self.checksums.push((rel_path.to_string(), xxh3_hex(data)));
        Ok(())
    }

    /// Number of units written so far
    pub fn unit_count(&self) -> usize {
        self.entries.len()
    }

    /// Whether a file was already written at `rel_path`
    pub fn contains(&self, rel_path: &str) -> bool {
        self.checksums.iter().any(|(p, _)| p == rel_path)
    }

    /// Write the manifest, close the archive and move it into place
    ///
    /// The manifest's entity list, entity count and checksums are filled in
    /// from what was actually written.
    pub fn finish(mut self, mut manifest: ArchiveManifest) -> BundleResult<ArchiveBundle> {
        self.entries.sort_by_key(|e| e.seq);
        manifest.entities = std::mem::take(&mut self.entries);
        manifest.entity_count = manifest.entities.len() as u64;
        for (path, checksum) in self.checksums.drain(..) {
            manifest.add_checksum(path, checksum);
        }

        let manifest_json = serde_json::to_vec_pretty(&manifest)?;
        self.guard.check_and_account(manifest_json.len() as u64)?;

        let mut builder = self
            .builder
            .take()
            .ok_or_else(|| BundleError::archive("writer already finished"))?;
        append(
            &mut builder,
            &format!("{}/{}", paths::ROOT, paths::MANIFEST),
            &manifest_json,
        )?;

        let encoder = builder
            .into_inner()
            .map_err(|e| BundleError::archive(format!("tar finish: {}", e)))?;
        let mut buf_writer = encoder
            .finish()
            .map_err(|e| BundleError::compression(format!("zstd finish: {}", e)))?;
        buf_writer.flush()?;
        drop(buf_writer);

        let checksum = file_checksum(&self.temp_path)?;
        let size_bytes = fs::metadata(&self.temp_path)?.len();

        fs::rename(&self.temp_path, &self.path)?;
        self.committed = true;

        debug!(
            target: "folio::bundle",
            path = %self.path.display(),
            entity_count = manifest.entity_count,
            size_bytes,
            "Archive written"
        );

        Ok(ArchiveBundle {
            path: self.path.clone(),
            checksum,
            size_bytes,
            manifest,
        })
    }

    /// Abandon the archive and remove the temp file
    pub fn abort(self) {
        // Drop does the cleanup
    }
}

impl Drop for ArchiveWriter<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.builder.take();
            let _ = fs::remove_file(&self.temp_path);
        }
    }
}

/// Temp path used while an archive is being written
pub fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn append<W: Write>(builder: &mut Builder<W>, path: &str, data: &[u8]) -> BundleResult<()> {
    let mut header = Header::new_gnu();
    header
        .set_path(path)
        .map_err(|e| BundleError::archive(format!("set path '{}': {}", path, e)))?;
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0); // Reproducible builds: zero mtime
    header.set_cksum();

    builder
        .append(&header, data)
        .map_err(|e| BundleError::archive(format!("append '{}': {}", path, e)))?;
    Ok(())
}
