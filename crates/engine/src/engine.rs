//! Archive engine service
//!
//! [`ArchiveEngine`] ties the pipeline together:
//!
//! ```text
//! export: ExportScope → ScopeResolver → GraphWalker → VersionSelector → Packager → ArchiveBundle
//! import: bundle file → ArchiveReader → Importer → ImportReport
//! ```
//!
//! Every job works against its own [`SnapshotReader`] and its own
//! [`ResourceGuard`], so concurrent jobs share nothing but the collaborators.
//! The requester is notified after every job, whatever its outcome.

use crate::config::EngineConfig;
use crate::importer::{ImportPhase, ImportReport, Importer};
use crate::job::{CancellationToken, Job, JobId};
use crate::packager::{PackageContext, Packager};
use crate::scope::{ExportScope, ScopeResolver};
use crate::snapshot::SnapshotReader;
use crate::versions::VersionSelector;
use crate::walker::{GraphWalker, WalkOptions};
use folio_bundle::{
    paths, ArchiveBundle, ArchiveLeases, ArchiveReader, BundleVerifyInfo, ResourceGuard,
    RetentionSweeper, SweepReport, ARCHIVE_EXTENSION,
};
use folio_core::{
    ArchiveError, ContentStore, ExportConfig, FilestoreClient, Identity, ImportConfig, JobKind,
    JobOutcome, JobStatus, NotificationSink, PermissionOracle, Result, UserId,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Builder for [`ArchiveEngine`]
pub struct ArchiveEngineBuilder {
    store: Arc<dyn ContentStore>,
    oracle: Arc<dyn PermissionOracle>,
    filestore: Option<Arc<dyn FilestoreClient>>,
    notifier: Option<Arc<dyn NotificationSink>>,
    config: EngineConfig,
    leases: Option<Arc<ArchiveLeases>>,
}

impl ArchiveEngineBuilder {
    /// Filestore client used to embed external files
    pub fn filestore(mut self, filestore: Arc<dyn FilestoreClient>) -> Self {
        self.filestore = Some(filestore);
        self
    }

    /// Sink receiving job outcomes
    pub fn notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Engine settings
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Lease table shared with other readers of the archive directory
    pub fn leases(mut self, leases: Arc<ArchiveLeases>) -> Self {
        self.leases = Some(leases);
        self
    }

    /// Validate the settings and build the engine
    pub fn build(self) -> Result<ArchiveEngine> {
        self.config.validate()?;
        Ok(ArchiveEngine {
            store: self.store,
            oracle: self.oracle,
            filestore: self.filestore,
            notifier: self.notifier,
            config: self.config,
            leases: self.leases.unwrap_or_else(ArchiveLeases::new),
        })
    }
}

/// Export/import engine
pub struct ArchiveEngine {
    store: Arc<dyn ContentStore>,
    oracle: Arc<dyn PermissionOracle>,
    filestore: Option<Arc<dyn FilestoreClient>>,
    notifier: Option<Arc<dyn NotificationSink>>,
    config: EngineConfig,
    leases: Arc<ArchiveLeases>,
}

impl ArchiveEngine {
    /// Start building an engine over a store and a permission oracle
    pub fn builder(
        store: Arc<dyn ContentStore>,
        oracle: Arc<dyn PermissionOracle>,
    ) -> ArchiveEngineBuilder {
        ArchiveEngineBuilder {
            store,
            oracle,
            filestore: None,
            notifier: None,
            config: EngineConfig::default(),
            leases: None,
        }
    }

    /// Engine settings
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Read leases on archive files
    pub fn leases(&self) -> &Arc<ArchiveLeases> {
        &self.leases
    }

    /// Content store
    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    // ------------------------------------------------------------------
    // Export
    // ------------------------------------------------------------------

    /// Export into the archive directory
    pub fn export(
        &self,
        identity: &Identity,
        scope: &ExportScope,
        config: &ExportConfig,
    ) -> Result<ArchiveBundle> {
        let job = JobId::new();
        let path = self.archive_path(identity, job);
        self.run_export(job, identity, scope, config, &path, &CancellationToken::new())
    }

    /// Export to an explicit path
    pub fn export_to(
        &self,
        identity: &Identity,
        scope: &ExportScope,
        config: &ExportConfig,
        path: &Path,
    ) -> Result<ArchiveBundle> {
        self.run_export(
            JobId::new(),
            identity,
            scope,
            config,
            path,
            &CancellationToken::new(),
        )
    }

    /// Export on tokio's blocking pool
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_export(
        self: &Arc<Self>,
        identity: Identity,
        scope: ExportScope,
        config: ExportConfig,
    ) -> Job<ArchiveBundle> {
        let id = JobId::new();
        let token = CancellationToken::new();
        let engine = Arc::clone(self);
        let job_token = token.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let path = engine.archive_path(&identity, id);
            engine.run_export(id, &identity, &scope, &config, &path, &job_token)
        });
        Job::new(id, token, handle)
    }

    fn run_export(
        &self,
        job: JobId,
        identity: &Identity,
        scope: &ExportScope,
        config: &ExportConfig,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<ArchiveBundle> {
        info!(
            target: "folio::export",
            %job,
            user = %identity.username,
            ?scope,
            format = %config.format,
            max_link_level = config.max_link_level,
            "Export started"
        );
        let result = self.export_inner(identity, scope, config, path, cancel);
        match &result {
            Ok(bundle) => info!(
                target: "folio::export",
                %job,
                path = %bundle.path.display(),
                entities = bundle.manifest.entity_count,
                skipped = bundle.manifest.skipped.len(),
                bytes = bundle.size_bytes,
                "Export finished"
            ),
            Err(e) => warn!(target: "folio::export", %job, error = %e, "Export failed"),
        }
        self.notify(identity.user, export_outcome(job, &result));
        result
    }

    fn export_inner(
        &self,
        identity: &Identity,
        scope: &ExportScope,
        config: &ExportConfig,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<ArchiveBundle> {
        config.validate()?;
        let snapshot = SnapshotReader::new(Arc::clone(&self.store));

        let roots = ScopeResolver::new(&snapshot, self.oracle.as_ref(), identity).resolve(scope)?;
        cancel.check()?;

        let options = WalkOptions {
            max_link_level: config.max_link_level,
            include_all_versions: config.include_all_versions,
        };
        let closed = GraphWalker::new(&snapshot, self.oracle.as_ref(), identity, options, cancel)
            .walk(&roots)?;
        let plan = VersionSelector::new(&snapshot, config.include_all_versions).select(&closed)?;
        debug!(
            target: "folio::export",
            roots = roots.len(),
            nodes = closed.len(),
            revisions = plan.revision_count(),
            "Content selected"
        );
        cancel.check()?;

        let guard = ResourceGuard::new(self.config.quota_bytes);
        let packager = Packager::new(PackageContext {
            snapshot: &snapshot,
            filestore: self.filestore.as_deref(),
            export: config,
            engine: &self.config,
            guard: &guard,
            cancel,
        });
        packager.package(&closed, &plan, roots.group.as_ref(), path)
    }

    /// Where an export job writes its archive
    fn archive_path(&self, identity: &Identity, job: JobId) -> PathBuf {
        self.config.archive_dir.join(format!(
            "{}-{}{}",
            paths::sanitize_segment(&identity.username),
            job,
            ARCHIVE_EXTENSION
        ))
    }

    // ------------------------------------------------------------------
    // Import
    // ------------------------------------------------------------------

    /// Import a structured archive
    pub fn import(
        &self,
        identity: &Identity,
        path: &Path,
        config: &ImportConfig,
    ) -> Result<ImportReport> {
        self.run_import(
            JobId::new(),
            identity,
            path,
            config,
            &CancellationToken::new(),
        )
    }

    /// Import on tokio's blocking pool
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_import(
        self: &Arc<Self>,
        identity: Identity,
        path: PathBuf,
        config: ImportConfig,
    ) -> Job<ImportReport> {
        let id = JobId::new();
        let token = CancellationToken::new();
        let engine = Arc::clone(self);
        let job_token = token.clone();
        let handle = tokio::task::spawn_blocking(move || {
            engine.run_import(id, &identity, &path, &config, &job_token)
        });
        Job::new(id, token, handle)
    }

    fn run_import(
        &self,
        job: JobId,
        identity: &Identity,
        path: &Path,
        config: &ImportConfig,
        cancel: &CancellationToken,
    ) -> Result<ImportReport> {
        info!(
            target: "folio::import",
            %job,
            user = %identity.username,
            path = %path.display(),
            scope = ?config.scope,
            "Import started"
        );
        let result = self.import_inner(identity, path, config, cancel);
        if let Err(e) = &result {
            warn!(target: "folio::import", %job, error = %e, "Import failed");
        }
        self.notify(identity.user, import_outcome(job, &result));
        result
    }

    fn import_inner(
        &self,
        identity: &Identity,
        path: &Path,
        config: &ImportConfig,
        cancel: &CancellationToken,
    ) -> Result<ImportReport> {
        // Held until the import is done so the sweep leaves the file alone
        let _lease = self.leases.lease_file(path)?;
        let contents = ArchiveReader::read_all(path)?;
        cancel.check()?;
        Importer::new(self.store.as_ref(), identity, config, cancel).import(&contents)
    }

    // ------------------------------------------------------------------
    // Bundles on disk
    // ------------------------------------------------------------------

    /// Check a bundle's integrity without importing it
    pub fn verify_bundle(&self, path: &Path) -> Result<BundleVerifyInfo> {
        Ok(ArchiveReader::validate(path)?)
    }

    /// Delete expired and removable archives, returning how many were deleted
    pub fn remove_expired_archives(&self) -> Result<usize> {
        Ok(self.sweep(SystemTime::now())?.removed.len())
    }

    /// Run the retention sweep as of `now`
    pub fn sweep(&self, now: SystemTime) -> Result<SweepReport> {
        let sweeper = RetentionSweeper::new(
            self.config.archive_dir.clone(),
            self.config.retention(),
            Arc::clone(&self.leases),
        );
        Ok(sweeper.remove_expired(now)?)
    }

    fn notify(&self, user: UserId, outcome: JobOutcome) {
        if let Some(notifier) = &self.notifier {
            notifier.notify(user, &outcome);
        }
    }
}

fn failure_status(error: &ArchiveError) -> JobStatus {
    match error {
        ArchiveError::Cancelled => JobStatus::Cancelled,
        _ => JobStatus::Failed,
    }
}

fn export_outcome(job: JobId, result: &Result<ArchiveBundle>) -> JobOutcome {
    match result {
        Ok(bundle) => JobOutcome {
            job_id: job.to_string(),
            kind: JobKind::Export,
            status: JobStatus::Succeeded,
            message: format!(
                "Archive with {} entities written ({} items skipped)",
                bundle.manifest.entity_count,
                bundle.manifest.skipped.len()
            ),
            archive: Some(bundle.path.clone()),
        },
        Err(e) => JobOutcome {
            job_id: job.to_string(),
            kind: JobKind::Export,
            status: failure_status(e),
            message: e.to_string(),
            archive: None,
        },
    }
}

fn import_outcome(job: JobId, result: &Result<ImportReport>) -> JobOutcome {
    let (status, message) = match result {
        Ok(report) if report.phase == ImportPhase::Cancelled => (
            JobStatus::Cancelled,
            format!(
                "Cancelled after importing {} items, {} not imported",
                report.imported.len(),
                report.errors.len()
            ),
        ),
        Ok(report) if report.errors.is_empty() => (
            JobStatus::Succeeded,
            format!("Imported {} items", report.imported.len()),
        ),
        Ok(report) if !report.imported.is_empty() => (
            JobStatus::PartiallySucceeded,
            format!(
                "Imported {} items, {} failed",
                report.imported.len(),
                report.errors.len()
            ),
        ),
        Ok(report) => (
            JobStatus::Failed,
            format!("No items imported, {} failed", report.errors.len()),
        ),
        Err(e) => (failure_status(e), e.to_string()),
    };
    JobOutcome {
        job_id: job.to_string(),
        kind: JobKind::Import,
        status,
        message,
        archive: None,
    }
}
