//! Serializer / packager
//!
//! Writes a closed set and its version plan into an archive bundle.
//!
//! Every node and every selected revision gets a bundle-local sequence
//! number: nodes in closed-set order, each document immediately followed by
//! its revisions. References between included entities are rewritten to
//! those numbers (`{{ref:SEQ}}`, `{{media:SEQ@V}}`) in structured archives
//! and to relative page links in rendered ones. References to content left
//! out become absolute URLs on the source instance.
//!
//! Files on external filestores are copied in only when requested, subject
//! to the extension and size filters. Every file that is referenced but not
//! copied is listed in the manifest with the reason.

use crate::config::EngineConfig;
use crate::job::CancellationToken;
use crate::render::{self, Cell, ExternalRow, ExternalStatus, HtmlWriter, IndexEntry};
use crate::snapshot::SnapshotReader;
use crate::versions::{SelectedRevision, VersionPlan};
use crate::walker::{ClosedSet, NfsReference, WalkedNode};
use folio_bundle::{
    paths, ArchiveBundle, ArchiveManifest, ArchiveWriter, GroupRecord, ManifestEntry,
    NfsFileRecord, NodeUnit, ResourceGuard, RevisionUnit, SkipRecord, UnitBody, UnitLink,
    UnitMediaVersion, UnitSignature, UnitType, UserRecord,
};
use folio_core::markup::{self, Token};
use folio_core::{
    ArchiveError, ArchiveFormat, ContentNode, ExportConfig, Field, FilestoreClient, GlobalId,
    Group, MediaVersionNumber, NodeBody, NodeId, NodeKind, Result, RevisionNumber, UserId,
};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use tracing::{debug, warn};

/// Bundle-local sequence numbers
#[derive(Debug, Default)]
struct Numbering {
    nodes: HashMap<NodeId, u64>,
    revisions: HashMap<(NodeId, RevisionNumber), u64>,
}

impl Numbering {
    fn assign(closed: &ClosedSet, plan: &VersionPlan) -> Self {
        let mut numbering = Numbering::default();
        let mut next = 1u64;
        for walked in closed.nodes() {
            let id = walked.node.id;
            numbering.nodes.insert(id, next);
            next += 1;
            for selected in plan.revisions(id) {
                numbering
                    .revisions
                    .insert((id, selected.revision.number), next);
                next += 1;
            }
        }
        numbering
    }

    fn node(&self, id: NodeId) -> Option<u64> {
        self.nodes.get(&id).copied()
    }

    fn revision(&self, document: NodeId, number: RevisionNumber) -> Option<u64> {
        self.revisions.get(&(document, number)).copied()
    }
}

/// A filestore file copied into the archive
struct FetchedFile {
    record: NfsFileRecord,
    data: Vec<u8>,
}

/// Filestore files of one document: copied files and skips
#[derive(Default)]
struct NfsOutcome {
    files: Vec<FetchedFile>,
    skipped: Vec<SkipRecord>,
    /// `filestore:path` of each reference → how it was handled
    status: BTreeMap<(String, String), ExternalStatus>,
}

/// Collaborators and settings of one packaging run
pub struct PackageContext<'a> {
    /// Job snapshot
    pub snapshot: &'a SnapshotReader,
    /// Filestore client, when one is configured
    pub filestore: Option<&'a dyn FilestoreClient>,
    /// Export request
    pub export: &'a ExportConfig,
    /// Engine settings
    pub engine: &'a EngineConfig,
    /// Per-job byte ceiling
    pub guard: &'a ResourceGuard,
    /// Job cancellation
    pub cancel: &'a CancellationToken,
}

/// Writes archive bundles
pub struct Packager<'a> {
    ctx: PackageContext<'a>,
}

impl<'a> Packager<'a> {
    /// Packager for one job
    pub fn new(ctx: PackageContext<'a>) -> Self {
        Self { ctx }
    }

    /// Write the archive to `path`
    ///
    /// On any error the partially written archive is removed.
    pub fn package(
        &self,
        closed: &ClosedSet,
        plan: &VersionPlan,
        group: Option<&Group>,
        path: &Path,
    ) -> Result<ArchiveBundle> {
        let numbering = Numbering::assign(closed, plan);
        let format = self.ctx.export.format;
        let mut writer =
            ArchiveWriter::create(path, self.ctx.engine.compression_level, self.ctx.guard)?;
        let mut manifest = ArchiveManifest::new(
            format,
            self.ctx.engine.instance_url.clone(),
            self.ctx.export.description.clone(),
        );

        let nfs_by_source = group_nfs(closed.nfs());
        let mut users: BTreeSet<UserId> = BTreeSet::new();
        let mut external_rows: Vec<ExternalRow> = Vec::new();
        let mut embedded: HashMap<(NodeId, MediaVersionNumber), String> = HashMap::new();

        for walked in closed.nodes() {
            self.ctx.cancel.check()?;
            let node = &walked.node;
            let seq = numbering.node(node.id).ok_or_else(|| {
                ArchiveError::internal(format!("node {} has no sequence number", node.id))
            })?;
            collect_users(node, plan, &mut users);

            // Binaries and filestore files first, so pages can point at what was copied
            if node.kind() == NodeKind::MediaFile {
                self.write_media_binaries(
                    &mut writer,
                    &mut manifest,
                    node,
                    seq,
                    plan,
                    &mut embedded,
                )?;
            }
            let nfs = match nfs_by_source.get(&node.id) {
                Some(refs) => {
                    let outcome = self.fetch_nfs(seq, refs);
                    for file in &outcome.files {
                        writer.add_file(&file.record.bundle_path, &file.data)?;
                    }
                    manifest
                        .nfs_files
                        .extend(outcome.files.iter().map(|f| f.record.clone()));
                    manifest.skipped.extend(outcome.skipped.iter().cloned());
                    for ((fs, p), status) in &outcome.status {
                        external_rows.push(ExternalRow {
                            source_href: paths::page(seq, UnitType::from(node.kind()).as_str()),
                            source_name: node.name.clone(),
                            location: format!("{}:{}", fs, p),
                            status: status.clone(),
                        });
                    }
                    outcome
                }
                None => NfsOutcome::default(),
            };

            match format {
                ArchiveFormat::Structured => self.write_structured(
                    &mut writer,
                    walked,
                    seq,
                    closed,
                    plan,
                    &numbering,
                    &embedded,
                )?,
                ArchiveFormat::Rendered => self.write_rendered(
                    &mut writer,
                    walked,
                    seq,
                    closed,
                    plan,
                    &numbering,
                    &nfs,
                )?,
            }
        }

        if format == ArchiveFormat::Rendered {
            let entries = index_entries(closed, &numbering);
            let has_external = !external_rows.is_empty();
            let index = render::index_page(
                &manifest.description,
                &manifest.generated_at,
                &entries,
                has_external,
            )?;
            writer.add_file(paths::INDEX, &index)?;
            if has_external {
                let page = render::external_links_page(&external_rows)?;
                writer.add_file(paths::EXTERNAL_LINKS, &page)?;
            }
        }

        manifest.users = self.user_records(&users)?;
        if let Some(group) = group {
            manifest.groups.push(self.group_record(group)?);
        }

        let bundle = writer.finish(manifest)?;
        debug!(
            target: "folio::export",
            path = %bundle.path.display(),
            entities = bundle.manifest.entity_count,
            bytes = bundle.size_bytes,
            "Archive packaged"
        );
        Ok(bundle)
    }

    // ------------------------------------------------------------------
    // Binaries
    // ------------------------------------------------------------------

    fn write_media_binaries(
        &self,
        writer: &mut ArchiveWriter<'_>,
        manifest: &mut ArchiveManifest,
        node: &ContentNode,
        seq: u64,
        plan: &VersionPlan,
        embedded: &mut HashMap<(NodeId, MediaVersionNumber), String>,
    ) -> Result<()> {
        let NodeBody::Media { file_name, .. } = &node.body else {
            return Ok(());
        };
        let versions = plan.media_versions(node.id);
        let fetch = |v: &MediaVersionNumber| (*v, self.ctx.snapshot.media_binary(node.id, *v));
        let fetched: Vec<(MediaVersionNumber, Result<Option<Vec<u8>>>)> =
            if self.ctx.engine.parallel_fetch && versions.len() > 1 {
                versions.par_iter().map(fetch).collect()
            } else {
                versions.iter().map(fetch).collect()
            };

        for (version, result) in fetched {
            let item = format!("{}@{}", node.global_id(), version);
            match result? {
                Some(data) => {
                    let path = paths::media_binary(seq, version, file_name);
                    writer.add_file(&path, &data)?;
                    embedded.insert((node.id, version), path);
                }
                None => {
                    warn!(
                        target: "folio::export",
                        media = %node.id,
                        version,
                        "Media binary missing from store"
                    );
                    manifest.skipped.push(SkipRecord {
                        owner_seq: Some(seq),
                        item,
                        reason: format!("media binary unavailable (version {})", version),
                    });
                }
            }
        }
        Ok(())
    }

    /// Resolve, filter and fetch the filestore files one document references
    fn fetch_nfs(&self, seq: u64, refs: &[&NfsReference]) -> NfsOutcome {
        let mut outcome = NfsOutcome::default();
        let export = self.ctx.export;

        if !export.include_nfs_links {
            for r in refs {
                outcome
                    .status
                    .insert((r.filestore.clone(), r.path.clone()), ExternalStatus::Linked);
            }
            return outcome;
        }
        let Some(client) = self.ctx.filestore else {
            for r in refs {
                let reason = "file skipped (no filestore client configured)".to_string();
                outcome.skipped.push(skip(seq, &r.filestore, &r.path, &reason));
                outcome.status.insert(
                    (r.filestore.clone(), r.path.clone()),
                    ExternalStatus::Skipped(reason),
                );
            }
            return outcome;
        };

        // Expand folders, then filter
        let mut candidates: Vec<(String, String, u64)> = Vec::new();
        for r in refs {
            let key = (r.filestore.clone(), r.path.clone());
            match list_files(client, &r.filestore, &r.path) {
                Ok(files) => {
                    let mut copied_any = false;
                    let mut reasons = Vec::new();
                    for (path, size) in files {
                        match filter_reason(export, &path, size) {
                            Some(reason) => {
                                outcome.skipped.push(skip(seq, &r.filestore, &path, &reason));
                                reasons.push(reason);
                            }
                            None => {
                                copied_any = true;
                                candidates.push((r.filestore.clone(), path, size));
                            }
                        }
                    }
                    let status = if copied_any {
                        ExternalStatus::Embedded(paths::nfs_file(seq, &r.filestore, &r.path))
                    } else {
                        ExternalStatus::Skipped(reasons.join("; "))
                    };
                    outcome.status.insert(key, status);
                }
                Err(e) => {
                    let reason = format!("file skipped (unavailable: {})", unavailable_reason(&e));
                    outcome.skipped.push(skip(seq, &r.filestore, &r.path, &reason));
                    outcome.status.insert(key, ExternalStatus::Skipped(reason));
                }
            }
        }
        candidates.sort();
        candidates.dedup();

        let fetch = |(fs, path, _size): &(String, String, u64)| {
            (fs.clone(), path.clone(), client.fetch_file(fs, path))
        };
        let fetched: Vec<(String, String, Result<Vec<u8>>)> =
            if self.ctx.engine.parallel_fetch && candidates.len() > 1 {
                candidates.par_iter().map(fetch).collect()
            } else {
                candidates.iter().map(fetch).collect()
            };

        for (filestore, path, result) in fetched {
            match result {
                Ok(data) => outcome.files.push(FetchedFile {
                    record: NfsFileRecord {
                        owner_seq: seq,
                        bundle_path: paths::nfs_file(seq, &filestore, &path),
                        size: data.len() as u64,
                        filestore,
                        path,
                    },
                    data,
                }),
                Err(e) => {
                    let reason = format!("file skipped (unavailable: {})", unavailable_reason(&e));
                    warn!(
                        target: "folio::export",
                        filestore = %filestore,
                        path = %path,
                        reason = %reason,
                        "Filestore file not copied"
                    );
                    if let Some(status) = outcome.status.get_mut(&(filestore.clone(), path.clone()))
                    {
                        *status = ExternalStatus::Skipped(reason.clone());
                    }
                    outcome.skipped.push(skip(seq, &filestore, &path, &reason));
                }
            }
        }

        // A reference stays embedded only if at least one of its files arrived
        for ((filestore, path), status) in outcome.status.iter_mut() {
            if let ExternalStatus::Embedded(prefix) = status {
                let arrived = outcome
                    .files
                    .iter()
                    .any(|f| is_within(&f.record.bundle_path, prefix));
                if !arrived {
                    *status = ExternalStatus::Skipped(format!(
                        "file skipped (unavailable: {}:{})",
                        filestore, path
                    ));
                }
            }
        }
        outcome
    }

    // ------------------------------------------------------------------
    // Structured units
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn write_structured(
        &self,
        writer: &mut ArchiveWriter<'_>,
        walked: &WalkedNode,
        seq: u64,
        closed: &ClosedSet,
        plan: &VersionPlan,
        numbering: &Numbering,
        embedded: &HashMap<(NodeId, MediaVersionNumber), String>,
    ) -> Result<()> {
        let node = &walked.node;
        let unit_type = UnitType::from(node.kind());
        let unit = NodeUnit {
            seq,
            source_id: node.id,
            global_id: node.global_id().to_string(),
            name: node.name.clone(),
            owner: self.ctx.snapshot.username(node.owner)?,
            parent_seq: node.parent.and_then(|p| numbering.node(p)),
            position: node.position,
            created_at: node.created_at,
            modified_at: node.modified_at,
            body: self.unit_body(node, closed, plan, numbering, embedded)?,
        };
        writer.add_unit(
            ManifestEntry {
                seq,
                unit_type,
                path: paths::unit(seq, unit_type.as_str()),
                source_global_id: unit.global_id.clone(),
            },
            &serde_json::to_vec_pretty(&unit)?,
        )?;

        for selected in plan.revisions(node.id) {
            let rev_seq = numbering
                .revision(node.id, selected.revision.number)
                .ok_or_else(|| ArchiveError::internal("revision without sequence number"))?;
            let unit = RevisionUnit {
                seq: rev_seq,
                document_seq: seq,
                number: selected.revision.number,
                modifier: self.ctx.snapshot.username(selected.revision.modifier)?,
                modified_at: selected.revision.modified_at,
                effective: selected.effective,
                fields: self.structured_fields(selected, numbering),
            };
            writer.add_unit(
                ManifestEntry {
                    seq: rev_seq,
                    unit_type: UnitType::Revision,
                    path: paths::unit(rev_seq, UnitType::Revision.as_str()),
                    source_global_id: node.global_id().to_string(),
                },
                &serde_json::to_vec_pretty(&unit)?,
            )?;
        }
        Ok(())
    }

    fn unit_body(
        &self,
        node: &ContentNode,
        closed: &ClosedSet,
        plan: &VersionPlan,
        numbering: &Numbering,
        embedded: &HashMap<(NodeId, MediaVersionNumber), String>,
    ) -> Result<UnitBody> {
        Ok(match &node.body {
            NodeBody::Document {
                template,
                signature,
                ..
            } => UnitBody::Document {
                template: template.map(|t| match numbering.node(t) {
                    Some(s) if closed.contains(t) => UnitLink::Ref(s),
                    _ => UnitLink::Url(self.external_url(t)),
                }),
                signature: match signature {
                    Some(sig) => match numbering.revision(node.id, sig.revision) {
                        Some(revision_seq) => Some(UnitSignature {
                            revision_seq,
                            signer: self.ctx.snapshot.username(sig.signer)?,
                            signed_at: sig.signed_at,
                        }),
                        None => None,
                    },
                    None => None,
                },
                revisions: plan
                    .revisions(node.id)
                    .iter()
                    .filter_map(|r| numbering.revision(node.id, r.revision.number))
                    .collect(),
            },
            NodeBody::Folder => UnitBody::Folder,
            NodeBody::Notebook => UnitBody::Notebook,
            NodeBody::Media {
                file_name,
                content_type,
                versions,
            } => UnitBody::Media {
                file_name: file_name.clone(),
                content_type: content_type.clone(),
                versions: versions
                    .iter()
                    .filter_map(|v| {
                        embedded.get(&(node.id, v.version)).map(|path| UnitMediaVersion {
                            version: v.version,
                            created_at: v.created_at,
                            size: v.size,
                            path: path.clone(),
                        })
                    })
                    .collect(),
            },
            NodeBody::Comment { author, text } => UnitBody::Comment {
                author: self.ctx.snapshot.username(*author)?,
                text: text.clone(),
            },
            NodeBody::Annotation { kind, data } => UnitBody::Annotation {
                kind: *kind,
                data: data.clone(),
            },
        })
    }

    fn structured_fields(&self, selected: &SelectedRevision, numbering: &Numbering) -> Vec<Field> {
        selected
            .revision
            .fields
            .iter()
            .map(|field| Field {
                name: field.name.clone(),
                content: markup::rewrite_tokens(&field.content, |token| {
                    self.structured_token(token, selected, numbering)
                }),
            })
            .collect()
    }

    fn structured_token(
        &self,
        token: &Token,
        selected: &SelectedRevision,
        numbering: &Numbering,
    ) -> Token {
        match token {
            Token::Link(target) => match numbering.node(*target) {
                Some(seq) => Token::Ref(seq),
                None => Token::Url(self.external_url(*target)),
            },
            Token::Attachment { media, version } => {
                match (
                    numbering.node(*media),
                    selected.attachment_version(*media, *version),
                ) {
                    (Some(seq), Some(v)) => Token::Media { seq, version: v },
                    _ => Token::Url(self.external_url(*media)),
                }
            }
            other => other.clone(),
        }
    }

    // ------------------------------------------------------------------
    // Rendered pages
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn write_rendered(
        &self,
        writer: &mut ArchiveWriter<'_>,
        walked: &WalkedNode,
        seq: u64,
        closed: &ClosedSet,
        plan: &VersionPlan,
        numbering: &Numbering,
        nfs: &NfsOutcome,
    ) -> Result<()> {
        let node = &walked.node;
        let unit_type = UnitType::from(node.kind());
        let mut rows: Vec<(&str, Cell)> = vec![
            ("Type", Cell::text(node.kind().as_str())),
            ("Global id", Cell::text(node.global_id().as_str())),
            ("Owner", Cell::text(self.ctx.snapshot.username(node.owner)?)),
            ("Created", Cell::text(render::timestamp(node.created_at))),
            ("Modified", Cell::text(render::timestamp(node.modified_at))),
        ];
        if let Some(parent) = node.parent.and_then(|p| closed.get(p)) {
            rows.push(("Parent", self.page_cell(&parent.node, numbering)));
        }

        let mut html = HtmlWriter::page(&node.name)?;
        match &node.body {
            NodeBody::Document {
                template,
                signature,
                ..
            } => {
                if let Some(t) = template {
                    rows.push(("Template", self.link_cell(*t, closed, numbering)));
                }
                if let Some(sig) = signature {
                    rows.push((
                        "Signed",
                        Cell::text(format!(
                            "revision {} by {} at {}",
                            sig.revision,
                            self.ctx.snapshot.username(sig.signer)?,
                            render::timestamp(sig.signed_at)
                        )),
                    ));
                }
                html.meta_table(&rows)?;

                let selected = plan.revisions(node.id);
                if let Some(effective) = selected.iter().find(|r| r.effective).or(selected.last()) {
                    self.rendered_fields(&mut html, effective, closed, numbering, nfs)?;
                }
                if selected.len() > 1 {
                    html.element("h2", &[], "Revisions")?;
                    html.start("ul", &[])?;
                    for r in selected {
                        let Some(rev_seq) = numbering.revision(node.id, r.revision.number) else {
                            continue;
                        };
                        html.start("li", &[])?;
                        html.anchor(
                            &paths::page_name(rev_seq, UnitType::Revision.as_str()),
                            &format!("Revision {}", r.revision.number),
                        )?;
                        html.text(&format!(" {}", render::timestamp(r.revision.modified_at)))?;
                        html.end("li")?;
                    }
                    html.end("ul")?;
                }
                self.child_list(&mut html, "Comments and annotations", node.id, closed, numbering)?;
            }
            NodeBody::Folder | NodeBody::Notebook => {
                html.meta_table(&rows)?;
                self.child_list(&mut html, "Contents", node.id, closed, numbering)?;
            }
            NodeBody::Media {
                file_name,
                content_type,
                ..
            } => {
                html.meta_table(&rows)?;
                html.start("ul", &[])?;
                for v in plan.media_versions(node.id) {
                    let href = format!("../{}", paths::media_binary(seq, v, file_name));
                    html.start("li", &[])?;
                    if render::is_image(content_type) {
                        html.image(&href, file_name)?;
                        html.empty("br", &[])?;
                    }
                    html.anchor(&href, &format!("{} (version {})", file_name, v))?;
                    html.end("li")?;
                }
                html.end("ul")?;
            }
            NodeBody::Comment { author, text } => {
                rows.push(("Author", Cell::text(self.ctx.snapshot.username(*author)?)));
                html.meta_table(&rows)?;
                html.start("p", &[])?;
                html.lines(text)?;
                html.end("p")?;
            }
            NodeBody::Annotation { kind, data } => {
                rows.push(("Annotation", Cell::text(format!("{:?}", kind))));
                html.meta_table(&rows)?;
                html.element("pre", &[], data)?;
            }
        }

        writer.add_unit(
            ManifestEntry {
                seq,
                unit_type,
                path: paths::page(seq, unit_type.as_str()),
                source_global_id: node.global_id().to_string(),
            },
            &html.finish()?,
        )?;

        for selected in plan.revisions(node.id) {
            let Some(rev_seq) = numbering.revision(node.id, selected.revision.number) else {
                continue;
            };
            let modifier = self.ctx.snapshot.username(selected.revision.modifier)?;
            let rows = [
                ("Document", self.page_cell(node, numbering)),
                ("Modified by", Cell::text(modifier)),
                ("Modified", Cell::text(render::timestamp(selected.revision.modified_at))),
            ];
            let title = format!("{}, revision {}", node.name, selected.revision.number);
            let mut html = HtmlWriter::page(&title)?;
            html.meta_table(&rows)?;
            self.rendered_fields(&mut html, selected, closed, numbering, nfs)?;
            writer.add_unit(
                ManifestEntry {
                    seq: rev_seq,
                    unit_type: UnitType::Revision,
                    path: paths::page(rev_seq, UnitType::Revision.as_str()),
                    source_global_id: node.global_id().to_string(),
                },
                &html.finish()?,
            )?;
        }
        Ok(())
    }

    fn rendered_fields(
        &self,
        html: &mut HtmlWriter,
        selected: &SelectedRevision,
        closed: &ClosedSet,
        numbering: &Numbering,
        nfs: &NfsOutcome,
    ) -> Result<()> {
        for field in &selected.revision.fields {
            html.start("div", &[("class", "field")])?;
            html.element("h3", &[], &field.name)?;
            html.start("div", &[])?;
            html.content(&field.content, |html, token| {
                self.rendered_token(html, token, selected, closed, numbering, nfs)
            })?;
            html.end("div")?;
            html.end("div")?;
        }
        Ok(())
    }

    fn rendered_token(
        &self,
        html: &mut HtmlWriter,
        token: &Token,
        selected: &SelectedRevision,
        closed: &ClosedSet,
        numbering: &Numbering,
        nfs: &NfsOutcome,
    ) -> Result<()> {
        match token {
            Token::Link(target) => html.cell(&self.link_cell(*target, closed, numbering)),
            Token::Attachment { media, version } => {
                let inside = closed.get(*media).zip(numbering.node(*media));
                let version = selected.attachment_version(*media, *version);
                match (inside, version) {
                    (Some((walked, seq)), Some(v)) => match &walked.node.body {
                        NodeBody::Media {
                            file_name,
                            content_type,
                            ..
                        } => {
                            let href = format!("../{}", paths::media_binary(seq, v, file_name));
                            if render::is_image(content_type) {
                                html.image(&href, file_name)
                            } else {
                                html.anchor(&href, file_name)
                            }
                        }
                        _ => html.cell(&self.link_cell(*media, closed, numbering)),
                    },
                    _ => html.cell(&self.external_cell(*media)),
                }
            }
            Token::Nfs { filestore, path } => {
                let label = format!("{}:{}", filestore, path);
                match nfs.status.get(&(filestore.clone(), path.clone())) {
                    Some(ExternalStatus::Embedded(bundle_path)) => {
                        html.anchor(&format!("../{}", bundle_path), &label)
                    }
                    _ => html.element("code", &[], &label),
                }
            }
            Token::Url(url) => html.anchor(url, url),
            other => html.text(&other.to_string()),
        }
    }

    /// Link to a node's page, or to the source instance when it was left out
    fn link_cell(&self, target: NodeId, closed: &ClosedSet, numbering: &Numbering) -> Cell {
        match closed.get(target) {
            Some(walked) => self.page_cell(&walked.node, numbering),
            None => self.external_cell(target),
        }
    }

    fn external_cell(&self, target: NodeId) -> Cell {
        let url = self.external_url(target);
        Cell::link(url.clone(), url)
    }

    /// Link from one page to another in the same directory
    fn page_cell(&self, node: &ContentNode, numbering: &Numbering) -> Cell {
        match numbering.node(node.id) {
            Some(seq) => Cell::link(
                paths::page_name(seq, UnitType::from(node.kind()).as_str()),
                node.name.clone(),
            ),
            None => Cell::text(node.name.clone()),
        }
    }

    fn child_list(
        &self,
        html: &mut HtmlWriter,
        heading: &str,
        parent: NodeId,
        closed: &ClosedSet,
        numbering: &Numbering,
    ) -> Result<()> {
        let ids = self.ctx.snapshot.children(parent)?;
        let children: Vec<&WalkedNode> = ids.iter().filter_map(|c| closed.get(*c)).collect();
        if children.is_empty() {
            return Ok(());
        }
        html.element("h2", &[], heading)?;
        html.start("ul", &[])?;
        for walked in children {
            html.start("li", &[])?;
            html.cell(&self.page_cell(&walked.node, numbering))?;
            if let NodeBody::Comment { text, .. } = &walked.node.body {
                html.text(&format!(": {}", text))?;
            }
            html.end("li")?;
        }
        html.end("ul")
    }

    // ------------------------------------------------------------------
    // Manifest records
    // ------------------------------------------------------------------

    /// Absolute URL of a node on the source instance
    fn external_url(&self, id: NodeId) -> String {
        let kind = self
            .ctx
            .snapshot
            .node(id)
            .ok()
            .flatten()
            .map(|n| n.kind())
            .unwrap_or(NodeKind::Document);
        self.ctx
            .engine
            .global_url(GlobalId::new(kind, id).as_str())
    }

    fn user_records(&self, users: &BTreeSet<UserId>) -> Result<Vec<UserRecord>> {
        let mut records = Vec::with_capacity(users.len());
        for id in users {
            records.push(match self.ctx.snapshot.user(*id)? {
                Some(user) => UserRecord {
                    username: user.username,
                    display_name: user.display_name,
                    email: user.email,
                },
                None => {
                    let username = self.ctx.snapshot.username(*id)?;
                    UserRecord {
                        display_name: username.clone(),
                        username,
                        email: None,
                    }
                }
            });
        }
        records.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(records)
    }

    fn group_record(&self, group: &Group) -> Result<GroupRecord> {
        let names = |ids: &[UserId]| -> Result<Vec<String>> {
            ids.iter().map(|u| self.ctx.snapshot.username(*u)).collect()
        };
        Ok(GroupRecord {
            name: group.name.clone(),
            members: names(&group.members)?,
            pis: names(&group.pis)?,
        })
    }
}

fn group_nfs(refs: &[NfsReference]) -> HashMap<NodeId, Vec<&NfsReference>> {
    let mut grouped: HashMap<NodeId, Vec<&NfsReference>> = HashMap::new();
    for r in refs {
        grouped.entry(r.source).or_default().push(r);
    }
    grouped
}

fn collect_users(node: &ContentNode, plan: &VersionPlan, users: &mut BTreeSet<UserId>) {
    users.insert(node.owner);
    match &node.body {
        NodeBody::Document { signature, .. } => {
            if let Some(sig) = signature {
                users.insert(sig.signer);
            }
            for r in plan.revisions(node.id) {
                users.insert(r.revision.modifier);
            }
        }
        NodeBody::Comment { author, .. } => {
            users.insert(*author);
        }
        _ => {}
    }
}

/// Files below a filestore path: the file itself, or every file in a folder tree
fn list_files(
    client: &dyn FilestoreClient,
    filestore: &str,
    path: &str,
) -> Result<Vec<(String, u64)>> {
    let entry = client.stat(filestore, path)?;
    if !entry.is_folder {
        return Ok(vec![(entry.path, entry.size)]);
    }
    let mut files = Vec::new();
    let mut stack = vec![entry.path];
    while let Some(folder) = stack.pop() {
        for child in client.list_folder(filestore, &folder)? {
            if child.is_folder {
                stack.push(child.path);
            } else {
                files.push((child.path, child.size));
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Why a filestore file must not be copied, if it must not
fn filter_reason(export: &ExportConfig, path: &str, size: u64) -> Option<String> {
    let extension = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    if let Some(ext) = extension {
        if export.is_extension_excluded(&ext) {
            return Some(format!("file skipped (file extension '{}' excluded)", ext));
        }
    }
    if let Some(limit) = export.max_nfs_file_size {
        if size > limit {
            return Some(format!(
                "file skipped (size {} exceeds limit {})",
                size, limit
            ));
        }
    }
    None
}

fn unavailable_reason(err: &ArchiveError) -> String {
    match err {
        ArchiveError::ExternalFileUnavailable { reason, .. } => reason.clone(),
        other => other.to_string(),
    }
}

/// Whether `path` is `base` itself or lies below it, segment-wise
fn is_within(path: &str, base: &str) -> bool {
    match path.strip_prefix(base) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

fn skip(seq: u64, filestore: &str, path: &str, reason: &str) -> SkipRecord {
    SkipRecord {
        owner_seq: Some(seq),
        item: format!("{}:{}", filestore, path),
        reason: reason.to_string(),
    }
}

/// Index entries in closed-set order, nested by parent
fn index_entries(closed: &ClosedSet, numbering: &Numbering) -> Vec<IndexEntry> {
    let mut children: HashMap<NodeId, Vec<&WalkedNode>> = HashMap::new();
    let mut tops: Vec<&WalkedNode> = Vec::new();
    for walked in closed.nodes() {
        match walked.node.parent.filter(|p| closed.contains(*p)) {
            Some(parent) => children.entry(parent).or_default().push(walked),
            None => tops.push(walked),
        }
    }

    let mut entries = Vec::with_capacity(closed.len());
    let mut stack: Vec<(&WalkedNode, usize)> = tops.into_iter().rev().map(|w| (w, 0)).collect();
    while let Some((walked, level)) = stack.pop() {
        let node = &walked.node;
        if let Some(seq) = numbering.node(node.id) {
            let unit_type = UnitType::from(node.kind());
            entries.push(IndexEntry {
                href: paths::page(seq, unit_type.as_str()),
                title: node.name.clone(),
                kind: unit_type.as_str(),
                level,
            });
        }
        if let Some(kids) = children.get(&node.id) {
            stack.extend(kids.iter().rev().map(|w| (*w, level + 1)));
        }
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn export() -> ExportConfig {
        ExportConfig::structured()
            .exclude_extension("raw")
            .with_max_nfs_file_size(100)
    }

    #[test]
    fn extension_filter_reason() {
        assert_eq!(
            filter_reason(&export(), "/data/scan.RAW", 1).as_deref(),
            Some("file skipped (file extension 'raw' excluded)")
        );
    }

    #[test]
    fn size_filter_reason() {
        assert_eq!(
            filter_reason(&export(), "/data/big.csv", 101).as_deref(),
            Some("file skipped (size 101 exceeds limit 100)")
        );
        assert_eq!(filter_reason(&export(), "/data/ok.csv", 100), None);
        assert_eq!(filter_reason(&export(), "/data/no-extension", 5), None);
    }

    #[test]
    fn embedded_paths_match_whole_segments() {
        let base = "resources/000001/nfs/lab/run";
        assert!(is_within("resources/000001/nfs/lab/run", base));
        assert!(is_within("resources/000001/nfs/lab/run/a.csv", base));
        assert!(!is_within("resources/000001/nfs/lab/run2/a.csv", base));
        assert!(!is_within("resources/000001/nfs/lab/ru", base));
    }

    #[test]
    fn unavailable_reason_unwraps_filestore_errors() {
        let err = ArchiveError::ExternalFileUnavailable {
            path: "lab:/a".into(),
            reason: "timeout".into(),
        };
        assert_eq!(unavailable_reason(&err), "timeout");
    }
}
