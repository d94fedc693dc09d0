//! Export and import request parameters
//!
//! Both configs are immutable once a job starts. Builders consume `self`
//! the same way the engine's other configuration types do.

use crate::error::{ArchiveError, Result};
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Archive representation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveFormat {
    /// JSON units, round-trippable, accepted for import
    Structured,
    /// Browsable HTML pages, not importable
    Rendered,
}

impl ArchiveFormat {
    /// Tag stored in the manifest
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveFormat::Structured => "structured",
            ArchiveFormat::Rendered => "rendered",
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of an export request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Archive representation
    pub format: ArchiveFormat,
    /// How many hyperlink hops to follow from the root set (0 = none)
    pub max_link_level: u32,
    /// Embed files referenced on external filestores
    pub include_nfs_links: bool,
    /// Skip filestore files larger than this many bytes
    pub max_nfs_file_size: Option<u64>,
    /// Lowercase extensions (without dot) of filestore files to skip
    pub excluded_extensions: BTreeSet<String>,
    /// Serialize every revision instead of the effective one only
    pub include_all_versions: bool,
    /// Free-text description stored in the manifest
    pub description: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            format: ArchiveFormat::Structured,
            max_link_level: 1,
            include_nfs_links: false,
            max_nfs_file_size: None,
            excluded_extensions: BTreeSet::new(),
            include_all_versions: false,
            description: String::new(),
        }
    }
}

impl ExportConfig {
    /// Structured archive with default settings
    pub fn structured() -> Self {
        Self::default()
    }

    /// Rendered archive with default settings
    pub fn rendered() -> Self {
        Self {
            format: ArchiveFormat::Rendered,
            ..Self::default()
        }
    }

    /// Set the link-follow depth
    pub fn with_max_link_level(mut self, level: u32) -> Self {
        self.max_link_level = level;
        self
    }

    /// Include every revision
    pub fn with_all_versions(mut self, all: bool) -> Self {
        self.include_all_versions = all;
        self
    }

    /// Embed external filestore files
    pub fn with_nfs_links(mut self, include: bool) -> Self {
        self.include_nfs_links = include;
        self
    }

    /// Size limit for filestore files
    pub fn with_max_nfs_file_size(mut self, bytes: u64) -> Self {
        self.max_nfs_file_size = Some(bytes);
        self
    }

    /// Exclude a filestore file extension
    pub fn exclude_extension(mut self, ext: impl AsRef<str>) -> Self {
        self.excluded_extensions
            .insert(ext.as_ref().trim_start_matches('.').to_lowercase());
        self
    }

    /// Set the manifest description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Whether a filestore file extension is excluded
    pub fn is_extension_excluded(&self, ext: &str) -> bool {
        self.excluded_extensions.contains(&ext.to_lowercase())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.excluded_extensions.iter().any(|e| e.is_empty()) {
            return Err(ArchiveError::invalid_config("empty excluded extension"));
        }
        if self.max_nfs_file_size == Some(0) {
            return Err(ArchiveError::invalid_config(
                "max_nfs_file_size must be positive",
            ));
        }
        if self.max_nfs_file_size.is_some() && !self.include_nfs_links {
            return Err(ArchiveError::invalid_config(
                "max_nfs_file_size requires include_nfs_links",
            ));
        }
        Ok(())
    }
}

/// How users and groups absent from the target instance are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportScope {
    /// Create missing users and groups on the fly
    CreateUsers,
    /// Reassign content of unknown users to the requester
    IgnoreUsers,
}

/// Parameters of an import request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportConfig {
    /// User/group handling
    pub scope: ImportScope,
    /// Bundle username → target username
    pub owner_mapping: BTreeMap<String, String>,
    /// Folder receiving the imported top-level nodes
    pub target_folder: Option<NodeId>,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            scope: ImportScope::IgnoreUsers,
            owner_mapping: BTreeMap::new(),
            target_folder: None,
        }
    }
}

impl ImportConfig {
    /// Import creating missing users and groups
    pub fn create_users() -> Self {
        Self {
            scope: ImportScope::CreateUsers,
            ..Self::default()
        }
    }

    /// Import reassigning unknown owners to the requester
    pub fn ignore_users() -> Self {
        Self::default()
    }

    /// Map a bundle username onto a target username
    pub fn map_owner(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.owner_mapping.insert(from.into(), to.into());
        self
    }

    /// Place imported top-level nodes into a folder
    pub fn into_folder(mut self, folder: NodeId) -> Self {
        self.target_folder = Some(folder);
        self
    }
}
