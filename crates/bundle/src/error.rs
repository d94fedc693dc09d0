//! Archive bundle error types

use crate::guard::QuotaExceeded;
use folio_core::ArchiveError;
use std::io;
use thiserror::Error;

/// Errors that can occur while writing, reading or sweeping bundles
#[derive(Debug, Error)]
pub enum BundleError {
    /// Invalid bundle format or structure
    #[error("Invalid bundle: {0}")]
    InvalidBundle(String),

    /// Required file missing from bundle
    #[error("Missing required file in bundle: {0}")]
    MissingFile(String),

    /// Checksum verification failed
    #[error("Checksum mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// File that failed checksum
        file: String,
        /// Expected checksum value
        expected: String,
        /// Actual computed checksum
        actual: String,
    },

    /// Unsupported bundle format version
    #[error("Unsupported format version: {version}")]
    UnsupportedVersion {
        /// The unsupported version number
        version: u32,
    },

    /// Bundle is valid but cannot be imported (rendered archives)
    #[error("Bundle is not importable: {0}")]
    NotImportable(String),

    /// Per-job byte ceiling reached while writing
    #[error(transparent)]
    QuotaExceeded(#[from] QuotaExceeded),

    /// Archive operation failed
    #[error("Archive error: {0}")]
    Archive(String),

    /// Compression/decompression failed
    #[error("Compression error: {0}")]
    Compression(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BundleError {
    /// Create an archive error
    pub fn archive(msg: impl Into<String>) -> Self {
        Self::Archive(msg.into())
    }

    /// Create a compression error
    pub fn compression(msg: impl Into<String>) -> Self {
        Self::Compression(msg.into())
    }

    /// Create an invalid bundle error
    pub fn invalid_bundle(msg: impl Into<String>) -> Self {
        Self::InvalidBundle(msg.into())
    }

    /// Create a missing file error
    pub fn missing_file(path: impl Into<String>) -> Self {
        Self::MissingFile(path.into())
    }
}

/// Result type for bundle operations
pub type BundleResult<T> = Result<T, BundleError>;

impl From<BundleError> for ArchiveError {
    fn from(e: BundleError) -> Self {
        match e {
            BundleError::QuotaExceeded(q) => ArchiveError::QuotaExceeded {
                ceiling: q.ceiling,
                used: q.used,
                attempted: q.attempted,
            },
            BundleError::Io(io) => ArchiveError::Io(io),
            other => ArchiveError::MalformedBundle(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BundleError::ChecksumMismatch {
            file: "units/000001-document.json".to_string(),
            expected: "abc".to_string(),
            actual: "def".to_string(),
        };
        assert!(err.to_string().contains("000001-document.json"));
        assert!(err.to_string().contains("abc"));
        assert!(err.to_string().contains("def"));
    }

    #[test]
    fn test_error_constructors() {
        assert!(matches!(
            BundleError::archive("tar failed"),
            BundleError::Archive(_)
        ));
        assert!(matches!(
            BundleError::compression("zstd failed"),
            BundleError::Compression(_)
        ));
        assert!(matches!(
            BundleError::missing_file("MANIFEST.json"),
            BundleError::MissingFile(_)
        ));
    }

    #[test]
    fn test_conversion_into_archive_error() {
        let err: ArchiveError = BundleError::NotImportable("rendered".into()).into();
        assert!(matches!(err, ArchiveError::MalformedBundle(_)));

        let quota = QuotaExceeded {
            ceiling: 10,
            used: 8,
            attempted: 5,
        };
        let err: ArchiveError = BundleError::from(quota).into();
        assert!(matches!(
            err,
            ArchiveError::QuotaExceeded { ceiling: 10, .. }
        ));

        let io_err = io::Error::new(io::ErrorKind::NotFound, "gone");
        let err: ArchiveError = BundleError::from(io_err).into();
        assert!(matches!(err, ArchiveError::Io(_)));
    }
}
