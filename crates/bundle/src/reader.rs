//! Archive bundle reader
//!
//! Reads `.folio.tar.zst` archives and validates their contents. Only
//! structured archives can be loaded for import; rendered archives pass
//! [`ArchiveReader::validate`] but are rejected by [`ArchiveReader::read_all`].

use crate::error::{BundleError, BundleResult};
use crate::types::{
    paths, xxh3_hex, ArchiveManifest, BundleVerifyInfo, NodeUnit, RevisionUnit, UnitType,
    ARCHIVE_FORMAT_VERSION,
};
use folio_core::ArchiveFormat;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tar::Archive;

/// Fully parsed structured archive
#[derive(Debug, Clone)]
pub struct ArchiveContents {
    /// Manifest
    pub manifest: ArchiveManifest,
    /// Node units, ascending by sequence number
    pub nodes: Vec<NodeUnit>,
    /// Revision units, ascending by sequence number
    pub revisions: Vec<RevisionUnit>,
    /// Every non-unit file keyed by archive-relative path
    pub files: HashMap<String, Vec<u8>>,
}

impl ArchiveContents {
    /// Binary stored at an archive-relative path
    pub fn file(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }
}

/// Reader for archive bundles
pub struct ArchiveReader;

impl ArchiveReader {
    /// Validate a bundle's integrity without parsing units
    ///
    /// Checks:
    /// - Archive can be decompressed
    /// - MANIFEST.json exists and has a supported version
    /// - Every listed unit exists
    /// - Checksums match manifest
    pub fn validate(path: &Path) -> BundleResult<BundleVerifyInfo> {
        let files = Self::extract_all_files(open(path)?)?;
        let manifest = Self::parse_manifest(&files)?;

        for entry in &manifest.entities {
            if !files.contains_key(&entry.path) {
                return Err(BundleError::missing_file(entry.path.clone()));
            }
        }
        let checksums_valid = Self::verify_checksums(&manifest, &files).is_ok();

        Ok(BundleVerifyInfo {
            format_version: manifest.format_version,
            archive_type: manifest.archive_type,
            entity_count: manifest.entity_count,
            description: manifest.description,
            checksums_valid,
        })
    }

    /// Read and parse the manifest
    pub fn read_manifest(path: &Path) -> BundleResult<ArchiveManifest> {
        let files = Self::extract_all_files(open(path)?)?;
        Self::parse_manifest(&files)
    }

    /// Read a structured archive for import
    ///
    /// Fails on checksum mismatch, rendered archives, entity-count mismatch
    /// and units that do not parse.
    pub fn read_all(path: &Path) -> BundleResult<ArchiveContents> {
        Self::read_contents(open(path)?)
    }

    /// Read a structured archive from bytes
    pub fn read_all_from_bytes(data: &[u8]) -> BundleResult<ArchiveContents> {
        Self::read_contents(data)
    }

    fn read_contents<R: Read>(reader: R) -> BundleResult<ArchiveContents> {
        let mut files = Self::extract_all_files(reader)?;
        let manifest = Self::parse_manifest(&files)?;

        if manifest.archive_type != ArchiveFormat::Structured {
            return Err(BundleError::NotImportable(format!(
                "{} archives are for browsing only",
                manifest.archive_type
            )));
        }
        Self::verify_checksums(&manifest, &files)?;

        if manifest.entity_count != manifest.entities.len() as u64 {
            return Err(BundleError::invalid_bundle(format!(
                "manifest declares {} entities but lists {}",
                manifest.entity_count,
                manifest.entities.len()
            )));
        }

        let mut nodes = Vec::new();
        let mut revisions = Vec::new();
        for entry in &manifest.entities {
            let data = files
                .remove(&entry.path)
                .ok_or_else(|| BundleError::missing_file(entry.path.clone()))?;
            match entry.unit_type {
                UnitType::Revision => {
                    let unit: RevisionUnit = serde_json::from_slice(&data)?;
                    check_seq(entry.seq, unit.seq, &entry.path)?;
                    revisions.push(unit);
                }
                _ => {
                    let unit: NodeUnit = serde_json::from_slice(&data)?;
                    check_seq(entry.seq, unit.seq, &entry.path)?;
                    if UnitType::from(unit.kind()) != entry.unit_type {
                        return Err(BundleError::invalid_bundle(format!(
                            "{} holds a {} unit",
                            entry.path,
                            unit.kind()
                        )));
                    }
                    nodes.push(unit);
                }
            }
        }
        nodes.sort_by_key(|u| u.seq);
        revisions.sort_by_key(|u| u.seq);
        files.remove(paths::MANIFEST);

        Ok(ArchiveContents {
            manifest,
            nodes,
            revisions,
            files,
        })
    }

    fn parse_manifest(files: &HashMap<String, Vec<u8>>) -> BundleResult<ArchiveManifest> {
        let data = files
            .get(paths::MANIFEST)
            .ok_or_else(|| BundleError::missing_file(paths::MANIFEST))?;
        let manifest: ArchiveManifest = serde_json::from_slice(data)?;

        if manifest.format_version != ARCHIVE_FORMAT_VERSION {
            return Err(BundleError::UnsupportedVersion {
                version: manifest.format_version,
            });
        }
        Ok(manifest)
    }

    fn verify_checksums(
        manifest: &ArchiveManifest,
        files: &HashMap<String, Vec<u8>>,
    ) -> BundleResult<()> {
        for (file, expected) in &manifest.checksums {
            let data = files
                .get(file)
                .ok_or_else(|| BundleError::missing_file(file.clone()))?;
            let actual = xxh3_hex(data);
            if expected != &actual {
                return Err(BundleError::ChecksumMismatch {
                    file: file.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(())
    }

    /// Extract all files under the archive root into a HashMap
    fn extract_all_files<R: Read>(reader: R) -> BundleResult<HashMap<String, Vec<u8>>> {
        let decoder = zstd::Decoder::new(reader)
            .map_err(|e| BundleError::compression(format!("zstd decode: {}", e)))?;

        let mut archive = Archive::new(decoder);
        let mut files = HashMap::new();
        let prefix = format!("{}/", paths::ROOT);

        for entry in archive
            .entries()
            .map_err(|e| BundleError::archive(e.to_string()))?
        {
            let mut entry = entry.map_err(|e| BundleError::archive(e.to_string()))?;
            let entry_path = entry
                .path()
                .map_err(|e| BundleError::archive(e.to_string()))?
                .to_string_lossy()
                .to_string();

            // Strip prefix to get relative file name
            if let Some(name) = entry_path.strip_prefix(&prefix) {
                if !name.is_empty() {
                    let mut data = Vec::new();
                    entry
                        .read_to_end(&mut data)
                        .map_err(|e| BundleError::archive(format!("read {}: {}", name, e)))?;
                    files.insert(name.to_string(), data);
                }
            }
        }

        Ok(files)
    }
}

fn open(path: &Path) -> BundleResult<BufReader<File>> {
    Ok(BufReader::new(File::open(path)?))
}

fn check_seq(listed: u64, actual: u64, path: &str) -> BundleResult<()> {
    if listed != actual {
        return Err(BundleError::invalid_bundle(format!(
            "{} is listed as unit {} but contains unit {}",
            path, listed, actual
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::ResourceGuard;
    use crate::types::{ManifestEntry, UnitBody};
    use crate::writer::ArchiveWriter;
    use folio_core::{Field, NodeId};
    use std::fs;
    use tempfile::{tempdir, TempDir};

    fn node_unit(seq: u64) -> NodeUnit {
        NodeUnit {
            seq,
            source_id: NodeId(100 + seq),
            global_id: format!("SD{}", 100 + seq),
            name: "Doc".into(),
            owner: "alice".into(),
            parent_seq: None,
            position: 0,
            created_at: 1,
            modified_at: 2,
            body: UnitBody::Document {
                template: None,
                signature: None,
                revisions: vec![seq + 1],
            },
        }
    }

    fn revision_unit(seq: u64, document_seq: u64) -> RevisionUnit {
        RevisionUnit {
            seq,
            document_seq,
            number: 1,
            modifier: "alice".into(),
            modified_at: 2,
            effective: true,
            fields: vec![Field::new("data", "hello")],
        }
    }

    fn write_bundle(format: ArchiveFormat) -> (TempDir, std::path::PathBuf) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.folio.tar.zst");
        let guard = ResourceGuard::default();
        let mut writer = ArchiveWriter::create(&path, 3, &guard).unwrap();

        let node = node_unit(1);
        writer
            .add_unit(
                ManifestEntry {
                    seq: 1,
                    unit_type: UnitType::Document,
                    path: paths::unit(1, "document"),
                    source_global_id: node.global_id.clone(),
                },
                &serde_json::to_vec(&node).unwrap(),
            )
            .unwrap();
        let rev = revision_unit(2, 1);
        writer
            .add_unit(
                ManifestEntry {
                    seq: 2,
                    unit_type: UnitType::Revision,
                    path: paths::unit(2, "revision"),
                    source_global_id: node.global_id.clone(),
                },
                &serde_json::to_vec(&rev).unwrap(),
            )
            .unwrap();
        writer.add_file("resources/000001/v1-a.bin", b"abc").unwrap();
        writer
            .finish(ArchiveManifest::new(format, "https://src", "desc"))
            .unwrap();
        (dir, path)
    }

    #[test]
    fn test_read_all() {
        let (_dir, path) = write_bundle(ArchiveFormat::Structured);
        let contents = ArchiveReader::read_all(&path).unwrap();
        assert_eq!(contents.manifest.entity_count, 2);
        assert_eq!(contents.nodes.len(), 1);
        assert_eq!(contents.revisions.len(), 1);
        assert_eq!(contents.nodes[0].source_id, NodeId(101));
        assert_eq!(contents.file("resources/000001/v1-a.bin"), Some(&b"abc"[..]));
    }

    #[test]
    fn test_validate() {
        let (_dir, path) = write_bundle(ArchiveFormat::Structured);
        let info = ArchiveReader::validate(&path).unwrap();
        assert_eq!(info.format_version, ARCHIVE_FORMAT_VERSION);
        assert_eq!(info.entity_count, 2);
        assert_eq!(info.description, "desc");
        assert!(info.checksums_valid);
    }

    #[test]
    fn test_rendered_archive_is_not_importable() {
        let (_dir, path) = write_bundle(ArchiveFormat::Rendered);
        assert!(ArchiveReader::validate(&path).is_ok());
        let err = ArchiveReader::read_all(&path).unwrap_err();
        assert!(matches!(err, BundleError::NotImportable(_)));
    }

    #[test]
    fn test_garbage_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("junk.folio.tar.zst");
        fs::write(&path, b"definitely not zstd").unwrap();
        assert!(ArchiveReader::read_all(&path).is_err());
        assert!(ArchiveReader::read_all_from_bytes(b"junk").is_err());
    }

    #[test]
    fn test_missing_manifest() {
        let mut buffer = Vec::new();
        {
            let encoder = zstd::Encoder::new(&mut buffer, 3).unwrap().auto_finish();
            let mut builder = tar::Builder::new(encoder);
            let mut header = tar::Header::new_gnu();
            header.set_path("archive/units/000001-document.json").unwrap();
            header.set_size(2);
            header.set_cksum();
            builder.append(&header, &b"{}"[..]).unwrap();
            builder.into_inner().unwrap();
        }
        let err = ArchiveReader::read_all_from_bytes(&buffer).unwrap_err();
        assert!(matches!(err, BundleError::MissingFile(_)));
    }
}
