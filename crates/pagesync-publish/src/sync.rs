//! The sync orchestrator.
//!
//! One run: validate the document and find the page. An existing page has
//! its tree read, checked for structural hazards, planned against and gated
//! on discussions before the media the plan sends is uploaded. A missing page
//! is created only once all of the document's media has uploaded. Then
//! deletes, updates, creates and moves are applied in that order. The
//! identity map is written here and nowhere else, one entry per operation as
//! it completes.

use crate::api::{CoverUpdate, InsertPosition, PageParent, PageUpdate, WorkspaceApi};
use crate::create::{CreatedNode, create_subtrees};
use crate::diff::{self, Anchor, BlockPath, SyncPlan};
use crate::error::{DiscussedBlock, MediaFailure, SyncError, SyncFailure};
use crate::media::{MediaResolver, file_digest, stamp_digests};
use crate::remote::{RemoteNode, check_structure, fetch_forest};
use crate::report::{OpKind, SyncReport};
use crate::retry::Remote;
use futures_util::{StreamExt, TryStreamExt, stream};
use pagesync_common::{
    BlockId, COVER_KEY, Fingerprint, IdentityEntry, IdentityMap, IdentityStore, PageId,
    PageIdentity, SyncPolicy,
};
use pagesync_renderer::wire::{InvalidBlock, update_body, validate};
use pagesync_renderer::{Block, Document, FingerprintedBlock, MediaReference, path_key};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// The page a document is published to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageTarget {
    pub title: String,
    pub parent: PageParent,
    /// Emoji icon. `None` clears any icon.
    pub icon: Option<String>,
    /// `None` clears any cover.
    pub cover: Option<CoverSource>,
}

impl PageTarget {
    pub fn new(title: impl Into<String>, parent: PageParent) -> Self {
        Self {
            title: title.into(),
            parent,
            icon: None,
            cover: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoverSource {
    Url(String),
    File(PathBuf),
}

/// Load identities from `store`, sync, and save them back on success.
pub async fn publish<A: WorkspaceApi, S: IdentityStore>(
    api: &A,
    store: &S,
    document: &Document,
    target: &PageTarget,
    policy: &SyncPolicy,
    cancel: &CancellationToken,
) -> Result<SyncReport, SyncFailure> {
    let mut identity = store
        .load()
        .await
        .map_err(|e| SyncFailure::new(e.into(), SyncReport::default()))?;
    let report = sync(api, document, target, &mut identity, policy, cancel).await?;
    store
        .save(&identity)
        .await
        .map_err(|e| SyncFailure::new(e.into(), report.clone()))?;
    Ok(report)
}

/// Make the page titled `target.title` hold exactly `document`.
///
/// On failure the returned report lists what was applied before it.
#[instrument(skip_all, fields(title = %target.title))]
pub async fn sync<A: WorkspaceApi>(
    api: &A,
    document: &Document,
    target: &PageTarget,
    identity: &mut IdentityMap,
    policy: &SyncPolicy,
    cancel: &CancellationToken,
) -> Result<SyncReport, SyncFailure> {
    let remote = Remote::new(api, policy, cancel);
    let mut report = SyncReport::default();
    match run(&remote, document, target, identity, &mut report).await {
        Ok(()) => {
            info!(
                created = report.created,
                updated = report.updated,
                deleted = report.deleted,
                moved = report.moved,
                unchanged = report.unchanged,
                "sync complete"
            );
            Ok(report)
        }
        Err(error) => {
            warn!(error = %error, "sync failed");
            Err(SyncFailure::new(error, report))
        }
    }
}

/// Archive the page titled `target.title`, if there is one.
pub async fn unpublish<A: WorkspaceApi>(
    api: &A,
    target: &PageTarget,
    identity: &mut IdentityMap,
    policy: &SyncPolicy,
    cancel: &CancellationToken,
) -> Result<Option<PageId>, SyncError> {
    let remote = Remote::new(api, policy, cancel);
    let Some(page) = find_page(&remote, target).await?.page else {
        return Ok(None);
    };
    remote
        .call("delete_page", |api| api.delete_page(&page))
        .await?;
    identity.forget_page(&target.title);
    info!(page = %page, "page archived");
    Ok(Some(page))
}

async fn run<A: WorkspaceApi>(
    remote: &Remote<'_, A>,
    document: &Document,
    target: &PageTarget,
    identity: &mut IdentityMap,
    report: &mut SyncReport,
) -> Result<(), SyncError> {
    validate(&document.blocks)?;
    let mut blocks = document.blocks.clone();
    stamp_digests(&mut blocks).await?;
    let properties = page_properties(target).await?;

    let found = find_page(remote, target).await?;
    if found.page.is_none() {
        // whatever was recorded belonged to a page that is gone
        identity.forget_page(&target.title);
    }
    let properties_changed = identity
        .page(&target.title)
        .and_then(|page| page.get(COVER_KEY))
        .is_none_or(|entry| entry.fingerprint != properties.fingerprint);
    let cover_reference = match &target.cover {
        Some(CoverSource::File(path)) if properties_changed => Some(MediaReference::Local {
            path: path.clone(),
            digest: properties.cover_digest,
        }),
        _ => None,
    };

    let (page, plan, resolved) = match found.page {
        Some(page) => {
            debug!(page = %page, "found existing page");
            report.page_id = Some(page.clone());
            let root = BlockId::from(&page);
            let snapshot = identity.snapshot(&target.title);
            let forest = fetch_forest(remote, &root, &snapshot).await?;
            check_structure(&target.title, &forest)?;
            let plan = plan_blocks(&blocks, &forest, &root, report);
            if remote.policy.cancel_on_discussion {
                discussion_gate(remote, &target.title, &plan).await?;
            }
            // media for everything the plan sends, plus a changed cover
            let mut references = sent_media(&blocks, &plan);
            references.extend(cover_reference);
            let resolved = resolve_media(remote, references, report).await?;
            (page, plan, resolved)
        }
        None => {
            // a new page receives every block, so upload before it exists
            let mut references = Vec::new();
            for block in &blocks {
                collect_local_media(block, &mut references);
            }
            references.extend(cover_reference);
            let resolved = resolve_media(remote, references, report).await?;
            let page = create_page(remote, target, &found.title_property, report).await?;
            report.page_id = Some(page.clone());
            let plan = plan_blocks(&blocks, &[], &BlockId::from(&page), report);
            (page, plan, resolved)
        }
    };
    let root = BlockId::from(&page);
    substitute_media(&mut blocks, &resolved);

    let page_identity = identity.page_mut(&target.title);
    if properties_changed {
        let cover = match &target.cover {
            None => CoverUpdate::Clear,
            Some(CoverSource::Url(url)) => CoverUpdate::External(url.clone()),
            Some(CoverSource::File(path)) => match resolved.get(path) {
                Some(MediaReference::Uploaded { upload_id, .. }) => {
                    CoverUpdate::Uploaded(upload_id.clone())
                }
                _ => CoverUpdate::Keep,
            },
        };
        let update = PageUpdate {
            icon: target.icon.clone(),
            cover,
        };
        if let Err(e) = remote
            .call("update_page", |api| api.update_page(&page, &update))
            .await
        {
            let error = SyncError::from(e);
            report.failed(OpKind::UpdatePage, page.as_str(), &error);
            return Err(error);
        }
        report.applied(OpKind::UpdatePage, page.as_str());
        page_identity.insert(
            COVER_KEY,
            IdentityEntry::new(root.clone(), properties.fingerprint),
        );
    }

    let local = FingerprintedBlock::forest(&blocks);
    Apply {
        remote,
        blocks: &blocks,
        local: &local,
        identity: &mut *page_identity,
        report: &mut *report,
    }
    .run(&plan)
    .await?;

    // carry forward untouched blocks and drop entries for paths that are gone
    for kept in &plan.kept {
        page_identity.insert(
            path_key(&kept.path),
            IdentityEntry::new(kept.id.clone(), kept.fingerprint),
        );
    }
    let mut live = BTreeSet::new();
    collect_paths(&blocks, &mut Vec::new(), &mut live);
    page_identity.retain_keys(|key| live.contains(key));
    Ok(())
}

fn plan_blocks(
    blocks: &[Block],
    forest: &[RemoteNode],
    root: &BlockId,
    report: &mut SyncReport,
) -> SyncPlan {
    let local = FingerprintedBlock::forest(blocks);
    let plan = diff::plan(&local, forest, root);
    report.unchanged = plan.unchanged;
    info!(plan = %plan.summary(), unchanged = plan.unchanged, "planned");
    plan
}

async fn resolve_media<A: WorkspaceApi>(
    remote: &Remote<'_, A>,
    references: Vec<MediaReference>,
    report: &mut SyncReport,
) -> Result<BTreeMap<PathBuf, MediaReference>, SyncError> {
    let resolver = MediaResolver::new(remote.clone());
    let resolved = resolver.resolve_all(references).await?;
    for path in resolver.uploaded() {
        report.applied(OpKind::Upload, path.display().to_string());
    }
    Ok(resolved)
}

struct PageProperties {
    fingerprint: Fingerprint,
    cover_digest: Option<Fingerprint>,
}

/// Digest of the icon and cover as requested, so unchanged properties are
/// not rewritten on every run.
async fn page_properties(target: &PageTarget) -> Result<PageProperties, SyncError> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"pagesync page properties v1\0");
    hasher.update(target.icon.as_deref().unwrap_or("").as_bytes());
    hasher.update(b"\0");
    let mut cover_digest = None;
    match &target.cover {
        None => {
            hasher.update(b"none");
        }
        Some(CoverSource::Url(url)) => {
            hasher.update(b"url:");
            hasher.update(url.as_bytes());
        }
        Some(CoverSource::File(path)) => {
            let digest = file_digest(path).await.map_err(|cause| SyncError::MediaUpload {
                failures: vec![MediaFailure {
                    reference: path.display().to_string(),
                    cause,
                }],
            })?;
            hasher.update(b"file:");
            hasher.update(digest.as_bytes());
            cover_digest = Some(digest);
        }
    }
    Ok(PageProperties {
        fingerprint: Fingerprint::from(hasher.finalize()),
        cover_digest,
    })
}

struct FoundPage {
    page: Option<PageId>,
    title_property: String,
}

async fn find_page<A: WorkspaceApi>(
    remote: &Remote<'_, A>,
    target: &PageTarget,
) -> Result<FoundPage, SyncError> {
    let (matches, title_property): (Vec<PageId>, String) = match &target.parent {
        PageParent::Page(parent) => {
            let parent = BlockId::from(parent);
            let children = remote
                .call("list_block_children", |api| api.list_block_children(&parent))
                .await?;
            let matches = children
                .iter()
                .filter(|child| child.child_page_title() == Some(target.title.as_str()))
                .map(|child| PageId::new(child.id.as_str()))
                .collect();
            (matches, "title".to_string())
        }
        PageParent::Database(database) => {
            let schema = remote
                .call("retrieve_database", |api| api.retrieve_database(database))
                .await?;
            let pages = remote
                .call("query_database", |api| {
                    api.query_database(database, &schema.title_property)
                })
                .await?;
            let matches = pages
                .into_iter()
                .filter(|page| page.title == target.title)
                .map(|page| page.id)
                .collect();
            (matches, schema.title_property)
        }
    };

    let mut matches = matches.into_iter();
    match (matches.next(), matches.len()) {
        (None, _) => Ok(FoundPage {
            page: None,
            title_property,
        }),
        (Some(page), 0) => Ok(FoundPage {
            page: Some(page),
            title_property,
        }),
        (Some(_), rest) => Err(SyncError::AmbiguousPage {
            title: target.title.clone(),
            count: rest + 1,
        }),
    }
}

#[instrument(skip_all)]
async fn create_page<A: WorkspaceApi>(
    remote: &Remote<'_, A>,
    target: &PageTarget,
    title_property: &str,
    report: &mut SyncReport,
) -> Result<PageId, SyncError> {
    let page = remote
        .call("create_page", |api| {
            api.create_page(&target.parent, title_property, &target.title)
        })
        .await
        .map_err(|e| {
            let error = SyncError::from(e);
            report.failed(OpKind::CreatePage, target.title.as_str(), &error);
            error
        })?;
    info!(page = %page, "created page");
    report.applied(OpKind::CreatePage, page.as_str());
    Ok(page)
}

/// Refuse when anything the plan destroys carries discussions.
#[instrument(skip_all)]
async fn discussion_gate<A: WorkspaceApi>(
    remote: &Remote<'_, A>,
    title: &str,
    plan: &SyncPlan,
) -> Result<(), SyncError> {
    let destroyed = plan.destroyed();
    if destroyed.is_empty() {
        return Ok(());
    }
    debug!(blocks = destroyed.len(), "checking discussions");
    let counts: Vec<(BlockId, usize)> = stream::iter(destroyed)
        .map(|id| async move {
            let count = remote
                .call("list_discussions", |api| api.list_discussions(&id))
                .await?;
            Ok::<_, SyncError>((id, count))
        })
        .buffered(remote.policy.concurrency())
        .try_collect()
        .await?;
    let blocks: Vec<_> = counts
        .into_iter()
        .filter(|(_, count)| *count > 0)
        .map(|(id, discussions)| DiscussedBlock { id, discussions })
        .collect();
    if blocks.is_empty() {
        Ok(())
    } else {
        Err(SyncError::DiscussionsExist {
            title: title.to_string(),
            blocks,
        })
    }
}

fn block_at<'b>(blocks: &'b [Block], path: &[usize]) -> Option<&'b Block> {
    let (first, rest) = path.split_first()?;
    let mut block = blocks.get(*first)?;
    for idx in rest {
        block = block.children.get(*idx)?;
    }
    Some(block)
}

fn fingerprinted_at<'l, 'b>(
    local: &'l [FingerprintedBlock<'b>],
    path: &[usize],
) -> Option<&'l FingerprintedBlock<'b>> {
    let (first, rest) = path.split_first()?;
    let mut node = local.get(*first)?;
    for idx in rest {
        node = node.children.get(*idx)?;
    }
    Some(node)
}

/// The siblings at `parent` (empty path for the page itself).
fn siblings<'b>(blocks: &'b [Block], parent: &[usize]) -> Option<&'b [Block]> {
    if parent.is_empty() {
        Some(blocks)
    } else {
        block_at(blocks, parent).map(|b| b.children.as_slice())
    }
}

fn sent_media(blocks: &[Block], plan: &SyncPlan) -> Vec<MediaReference> {
    let mut references = Vec::new();
    for (path, whole) in plan.sent_paths() {
        let Some(block) = block_at(blocks, path) else {
            continue;
        };
        if whole {
            collect_local_media(block, &mut references);
        } else if let Some(source @ MediaReference::Local { .. }) = block.kind.media_source() {
            references.push(source.clone());
        }
    }
    references
}

fn collect_local_media(block: &Block, out: &mut Vec<MediaReference>) {
    block.walk(&mut |b| {
        if let Some(source @ MediaReference::Local { .. }) = b.kind.media_source() {
            out.push(source.clone());
        }
    });
}

fn substitute_media(blocks: &mut [Block], resolved: &BTreeMap<PathBuf, MediaReference>) {
    if resolved.is_empty() {
        return;
    }
    for block in blocks.iter_mut() {
        block.walk_mut(&mut |b| {
            if let Some(source) = b.kind.media_source_mut() {
                if let MediaReference::Local { path, .. } = source {
                    if let Some(done) = resolved.get(path) {
                        *source = done.clone();
                    }
                }
            }
        });
    }
}

fn collect_paths(blocks: &[Block], prefix: &mut Vec<usize>, out: &mut BTreeSet<String>) {
    for (idx, block) in blocks.iter().enumerate() {
        prefix.push(idx);
        out.insert(path_key(prefix));
        collect_paths(&block.children, prefix, out);
        prefix.pop();
    }
}

/// A run of consecutive new siblings created with one anchor.
struct CreateRun<'p> {
    parent: &'p BlockId,
    parent_path: &'p [usize],
    start: usize,
    end: usize,
    anchor: &'p Anchor,
}

struct Apply<'r, 'a, 'b, 'l, A> {
    remote: &'r Remote<'a, A>,
    blocks: &'b [Block],
    local: &'l [FingerprintedBlock<'b>],
    identity: &'r mut PageIdentity,
    report: &'r mut SyncReport,
}

impl<A: WorkspaceApi> Apply<'_, '_, '_, '_, A> {
    #[instrument(name = "apply", skip_all, fields(plan = %plan.summary()))]
    async fn run(mut self, plan: &SyncPlan) -> Result<(), SyncError> {
        self.deletes(plan).await?;
        self.updates(plan).await?;
        let mut placed = self.creates(plan).await?;
        self.moves(plan, &mut placed).await
    }

    fn record_created(
        &mut self,
        root: &[usize],
        node: &CreatedNode,
        placed: &mut BTreeMap<BlockPath, BlockId>,
    ) {
        for (relative, id) in node.flatten() {
            let mut path = root.to_vec();
            path.extend(relative);
            if let Some(fp) = fingerprinted_at(self.local, &path) {
                self.identity
                    .insert(path_key(&path), IdentityEntry::new(id.clone(), fp.fingerprint));
            }
            placed.insert(path, id);
        }
    }

    async fn deletes(&mut self, plan: &SyncPlan) -> Result<(), SyncError> {
        let mut by_depth: BTreeMap<std::cmp::Reverse<usize>, Vec<&BlockId>> = BTreeMap::new();
        for (id, depth) in plan.deletes() {
            by_depth.entry(std::cmp::Reverse(depth)).or_default().push(id);
        }
        let remote = self.remote;
        for (_, ids) in by_depth {
            let mut results = stream::iter(ids)
                .map(|id| async move {
                    let result = remote.call("delete_block", |api| api.delete_block(id)).await;
                    (id, result)
                })
                .buffer_unordered(remote.policy.concurrency());
            while let Some((id, result)) = results.next().await {
                match result {
                    Ok(()) => {
                        self.report.applied(OpKind::Delete, id.as_str());
                        self.identity.forget_block(id);
                    }
                    Err(e) => {
                        let error = SyncError::from(e);
                        self.report.failed(OpKind::Delete, id.as_str(), &error);
                        return Err(error);
                    }
                }
            }
        }
        Ok(())
    }

    async fn updates(&mut self, plan: &SyncPlan) -> Result<(), SyncError> {
        let remote = self.remote;
        let blocks = self.blocks;
        let mut results = stream::iter(plan.updates())
            .map(|(id, path)| async move {
                let result = async {
                    let Some(block) = block_at(blocks, path) else {
                        return Ok(());
                    };
                    let body = update_body(block).map_err(|source| InvalidBlock {
                        path: path_key(path),
                        source,
                    })?;
                    remote
                        .call("update_block", |api| api.update_block(id, &body))
                        .await?;
                    Ok::<_, SyncError>(())
                }
                .await;
                (id, path, result)
            })
            .buffer_unordered(remote.policy.concurrency());
        while let Some((id, path, result)) = results.next().await {
            match result {
                Ok(()) => {
                    self.report.applied(OpKind::Update, id.as_str());
                    if let Some(fp) = fingerprinted_at(self.local, path) {
                        self.identity
                            .insert(path_key(path), IdentityEntry::new(id.clone(), fp.fingerprint));
                    }
                }
                Err(error) => {
                    self.report.failed(OpKind::Update, id.as_str(), &error);
                    return Err(error);
                }
            }
        }
        Ok(())
    }

    /// Create new subtrees. Parents proceed concurrently; the runs under one
    /// parent go one after another so anchors resolve.
    async fn creates(&mut self, plan: &SyncPlan) -> Result<BTreeMap<BlockPath, BlockId>, SyncError> {
        let mut groups: Vec<(&BlockId, Vec<CreateRun<'_>>)> = Vec::new();
        for (parent, path, anchor) in plan.creates() {
            let Some((&idx, parent_path)) = path.split_last() else {
                continue;
            };
            let slot = match groups.iter().position(|(p, _)| *p == parent) {
                Some(slot) => slot,
                None => {
                    groups.push((parent, Vec::new()));
                    groups.len() - 1
                }
            };
            let group = &mut groups[slot].1;
            let chained = matches!(
                (group.last(), anchor),
                (Some(run), Anchor::AfterNew(prev))
                    if prev.split_last().is_some_and(|(&p, pp)| pp == run.parent_path && p == run.end && p + 1 == idx)
            );
            if let Some(run) = group.last_mut().filter(|_| chained) {
                run.end = idx;
                continue;
            }
            group.push(CreateRun {
                parent,
                parent_path,
                start: idx,
                end: idx,
                anchor,
            });
        }

        let remote = self.remote;
        let blocks = self.blocks;
        let mut results = stream::iter(groups)
            .map(|(_, runs)| async move {
                let mut done: Vec<(BlockPath, CreatedNode)> = Vec::new();
                let mut local_placed: BTreeMap<BlockPath, BlockId> = BTreeMap::new();
                for run in runs {
                    let Some(slice) = siblings(blocks, run.parent_path)
                        .and_then(|s| s.get(run.start..=run.end))
                    else {
                        continue;
                    };
                    let position = match position_for(run.anchor, &local_placed) {
                        Some(position) => position,
                        None => {
                            let missing = describe_anchor(run.anchor);
                            warn!(anchor = %missing, "anchor not placed, appending at end");
                            InsertPosition::End
                        }
                    };
                    match create_subtrees(remote, run.parent, slice, position).await {
                        Ok(nodes) => {
                            for (offset, node) in nodes.into_iter().enumerate() {
                                let mut path = run.parent_path.to_vec();
                                path.push(run.start + offset);
                                local_placed.insert(path.clone(), node.id.clone());
                                done.push((path, node));
                            }
                        }
                        Err(error) => {
                            let mut path = run.parent_path.to_vec();
                            path.push(run.start);
                            return (done, Some((path, error)));
                        }
                    }
                }
                (done, None)
            })
            .buffer_unordered(remote.policy.concurrency());

        let mut placed = BTreeMap::new();
        let mut failure = None;
        while let Some((done, error)) = results.next().await {
            for (path, node) in &done {
                self.report.applied(OpKind::Create, path_key(path));
                self.record_created(path, node, &mut placed);
            }
            if let Some((path, error)) = error {
                self.report.failed(OpKind::Create, path_key(&path), &error);
                failure.get_or_insert(error);
            }
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(placed),
        }
    }

    async fn moves(
        &mut self,
        plan: &SyncPlan,
        placed: &mut BTreeMap<BlockPath, BlockId>,
    ) -> Result<(), SyncError> {
        for (parent, moves) in plan.reorders() {
            for m in moves {
                let Some(block) = block_at(self.blocks, &m.path) else {
                    continue;
                };
                let step = async {
                    self.remote
                        .call("delete_block", |api| api.delete_block(&m.id))
                        .await?;
                    for id in &m.subtree {
                        self.identity.forget_block(id);
                    }
                    let position = position_for(&m.anchor, placed).unwrap_or(InsertPosition::End);
                    create_subtrees(self.remote, parent, std::slice::from_ref(block), position).await
                };
                match step.await {
                    Ok(nodes) => {
                        for node in &nodes {
                            self.record_created(&m.path, node, placed);
                        }
                        self.report.applied(OpKind::Reorder, m.id.as_str());
                    }
                    Err(error) => {
                        self.report.failed(OpKind::Reorder, m.id.as_str(), &error);
                        return Err(error);
                    }
                }
            }
        }
        Ok(())
    }
}

fn position_for(anchor: &Anchor, placed: &BTreeMap<BlockPath, BlockId>) -> Option<InsertPosition> {
    Some(match anchor {
        Anchor::End => InsertPosition::End,
        Anchor::AfterRemote(id) => InsertPosition::After(id.clone()),
        Anchor::AfterNew(path) => InsertPosition::After(placed.get(path)?.clone()),
    })
}

fn describe_anchor(anchor: &Anchor) -> String {
    match anchor {
        Anchor::End => "end".into(),
        Anchor::AfterRemote(id) => format!("after {id}"),
        Anchor::AfterNew(path) => format!("after new {}", path_key(path)),
    }
}
