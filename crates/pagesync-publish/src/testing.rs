//! An in-memory workspace for exercising the engine end to end.
//!
//! It holds the same constraints the real remote does: two levels per
//! append, at most 100 blocks per children array, table rows stored as
//! child blocks, uploaded files read back as short-lived URLs.

use crate::api::{
    DatabaseSchema, FileUpload, FileUploadRequest, InsertPosition, PageParent, PageSummary,
    PageUpdate, RemoteBlock, UploadMode, UploadStatus, WorkspaceApi,
};
use crate::remote::fetch_forest;
use crate::retry::Remote;
use bytes::Bytes;
use pagesync_common::{
    BlockId, DatabaseId, IdentitySnapshot, PageId, RemoteError, SyncPolicy, UploadId,
};
use pagesync_renderer::Block;
use pagesync_renderer::nesting::MAX_BLOCKS_PER_REQUEST;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub const ROOT_PAGE: &str = "root-page";

const MUTATIONS: &[&str] = &[
    "create_page",
    "update_page",
    "delete_page",
    "append_block_children",
    "update_block",
    "delete_block",
    "create_file_upload",
    "send_file_upload",
    "complete_file_upload",
];

#[derive(Debug, Clone)]
struct Node {
    block_type: String,
    payload: Value,
}

#[derive(Debug, Clone)]
struct Upload {
    filename: String,
    mode: UploadMode,
    parts: Vec<u32>,
    completed: bool,
    pending_polls: u32,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    nodes: HashMap<BlockId, Node>,
    children: HashMap<BlockId, Vec<BlockId>>,
    databases: HashMap<DatabaseId, (String, Vec<PageSummary>)>,
    archived_pages: Vec<PageId>,
    discussions: HashMap<BlockId, usize>,
    uploads: HashMap<UploadId, Upload>,
    failing_files: HashSet<String>,
    pending_polls: u32,
    failures: HashMap<&'static str, VecDeque<RemoteError>>,
    scheduled: HashMap<(&'static str, usize), RemoteError>,
    calls: BTreeMap<&'static str, usize>,
    page_updates: Vec<(PageId, PageUpdate)>,
    append_sizes: Vec<usize>,
}

impl State {
    fn id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}{}", self.next_id)
    }

    fn enter(&mut self, operation: &'static str) -> Result<(), RemoteError> {
        let count = self.calls.entry(operation).or_default();
        *count += 1;
        if let Some(error) = self.scheduled.remove(&(operation, *count)) {
            return Err(error);
        }
        match self.failures.get_mut(operation).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn remove_subtree(&mut self, id: &BlockId) {
        self.nodes.remove(id);
        for child in self.children.remove(id).unwrap_or_default() {
            self.remove_subtree(&child);
        }
    }

    /// Normalize a payload the way the remote stores it.
    fn stored_payload(
        &self,
        operation: &'static str,
        payload: &Value,
    ) -> Result<Value, RemoteError> {
        let mut payload = payload.clone();
        if let Some(map) = payload.as_object_mut() {
            map.remove("children");
            if map.get("type").and_then(Value::as_str) == Some("file_upload") {
                let upload = map
                    .get("file_upload")
                    .and_then(|u| u["id"].as_str())
                    .unwrap_or_default()
                    .to_string();
                match self.uploads.get(&UploadId::new(upload.as_str())) {
                    Some(u) if u.completed || u.mode == UploadMode::SinglePart => {}
                    _ => {
                        return Err(RemoteError::from_status(
                            operation,
                            400,
                            Some("validation_error".into()),
                            format!("file upload {upload} is not attachable"),
                        ));
                    }
                }
                map.remove("file_upload");
                map.insert("type".into(), json!("file"));
                map.insert(
                    "file".into(),
                    json!({ "url": format!("https://files.example/{upload}?sig={}", self.next_id) }),
                );
            }
        }
        Ok(payload)
    }
}

fn validation(operation: &'static str, message: impl Into<String>) -> RemoteError {
    RemoteError::from_status(operation, 400, Some("validation_error".into()), message)
}

fn not_found(operation: &'static str, what: impl std::fmt::Display) -> RemoteError {
    RemoteError::from_status(
        operation,
        404,
        Some("object_not_found".into()),
        format!("{what} not found"),
    )
}

/// Check an append payload against the nesting and size ceilings.
fn check_shape(operation: &'static str, values: &[Value], level: usize) -> Result<(), RemoteError> {
    if values.len() > MAX_BLOCKS_PER_REQUEST {
        return Err(validation(
            operation,
            format!("children length {} exceeds {MAX_BLOCKS_PER_REQUEST}", values.len()),
        ));
    }
    for value in values {
        let ty = value["type"].as_str().unwrap_or_default();
        if let Some(children) = value[ty]["children"].as_array() {
            if level >= 2 {
                return Err(validation(operation, "nesting too deep in a single request"));
            }
            check_shape(operation, children, level + 1)?;
        }
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct FakeWorkspace {
    state: Mutex<State>,
}

impl FakeWorkspace {
    /// A workspace holding one empty page, [`ROOT_PAGE`], to publish under.
    pub fn new() -> Self {
        let fake = Self::default();
        fake.state()
            .children
            .insert(BlockId::new(ROOT_PAGE), Vec::new());
        fake
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn root() -> PageParent {
        PageParent::Page(PageId::new(ROOT_PAGE))
    }

    pub fn add_database(&self, id: &str, title_property: &str) -> PageParent {
        self.state().databases.insert(
            DatabaseId::new(id),
            (title_property.to_string(), Vec::new()),
        );
        PageParent::Database(DatabaseId::new(id))
    }

    /// Add a page directly, bypassing call counting.
    pub fn add_page(&self, parent: &PageParent, title: &str) -> PageId {
        let mut state = self.state();
        let page = PageId::new(state.id("page-"));
        insert_page(&mut state, parent, &page, title);
        page
    }

    /// Append raw block JSON under `parent`, bypassing call counting.
    pub fn seed(&self, parent: &BlockId, values: &[Value]) -> Vec<BlockId> {
        let mut state = self.state();
        insert_values(&mut state, "seed", parent, values, &InsertPosition::End).unwrap()
    }

    /// Fail the next call of `operation` with `error`. Queues up.
    pub fn fail_next(&self, operation: &'static str, error: RemoteError) {
        self.state()
            .failures
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Fail call number `nth` (1-based, counted since the last reset) of
    /// `operation`.
    pub fn fail_nth(&self, operation: &'static str, nth: usize, error: RemoteError) {
        self.state().scheduled.insert((operation, nth), error);
    }

    pub fn add_discussions(&self, id: &BlockId, count: usize) {
        self.state().discussions.insert(id.clone(), count);
    }

    /// Uploads of a file with this name end in status `failed`.
    pub fn fail_uploads_named(&self, filename: &str) {
        self.state().failing_files.insert(filename.to_string());
    }

    /// Every new upload reports `pending` this many times before settling.
    pub fn pending_polls(&self, polls: u32) {
        self.state().pending_polls = polls;
    }

    pub fn calls(&self, operation: &str) -> usize {
        self.state().calls.get(operation).copied().unwrap_or(0)
    }

    pub fn mutations(&self) -> usize {
        let state = self.state();
        MUTATIONS
            .iter()
            .map(|op| state.calls.get(op).copied().unwrap_or(0))
            .sum()
    }

    pub fn reset_calls(&self) {
        let mut state = self.state();
        state.calls.clear();
        state.append_sizes.clear();
    }

    pub fn page_updates(&self) -> Vec<(PageId, PageUpdate)> {
        self.state().page_updates.clone()
    }

    pub fn archived_pages(&self) -> Vec<PageId> {
        self.state().archived_pages.clone()
    }

    /// Top-level array sizes of every append so far.
    pub fn append_sizes(&self) -> Vec<usize> {
        self.state().append_sizes.clone()
    }

    pub fn child_ids(&self, parent: &BlockId) -> Vec<BlockId> {
        self.state()
            .children
            .get(parent)
            .cloned()
            .unwrap_or_default()
    }

    pub fn block_type(&self, id: &BlockId) -> Option<String> {
        self.state().nodes.get(id).map(|n| n.block_type.clone())
    }

    pub fn contains(&self, id: &BlockId) -> bool {
        self.state().nodes.contains_key(id)
    }

    /// The page's content read back into the block model.
    pub async fn tree(&self, page: &PageId) -> Vec<Block> {
        let policy = SyncPolicy::default();
        let cancel = CancellationToken::new();
        let remote = Remote::new(self, &policy, &cancel);
        fetch_forest(&remote, &BlockId::from(page), &IdentitySnapshot::default())
            .await
            .unwrap()
            .iter()
            .map(|node| node.to_block().expect("representable block"))
            .collect()
    }
}

fn insert_page(state: &mut State, parent: &PageParent, page: &PageId, title: &str) {
    state.children.insert(BlockId::from(page), Vec::new());
    match parent {
        PageParent::Page(parent) => {
            let block = BlockId::from(page);
            state.nodes.insert(
                block.clone(),
                Node {
                    block_type: "child_page".into(),
                    payload: json!({ "title": title }),
                },
            );
            state
                .children
                .entry(BlockId::from(parent))
                .or_default()
                .push(block);
        }
        PageParent::Database(database) => {
            if let Some((_, pages)) = state.databases.get_mut(database) {
                pages.push(PageSummary {
                    id: page.clone(),
                    title: title.to_string(),
                });
            }
        }
    }
}

fn insert_values(
    state: &mut State,
    operation: &'static str,
    parent: &BlockId,
    values: &[Value],
    position: &InsertPosition,
) -> Result<Vec<BlockId>, RemoteError> {
    let Some(siblings) = state.children.get(parent) else {
        return Err(not_found(operation, parent));
    };
    let mut at = match position {
        InsertPosition::End => siblings.len(),
        InsertPosition::After(after) => {
            siblings
                .iter()
                .position(|id| id == after)
                .ok_or_else(|| validation(operation, format!("{after} is not a child of {parent}")))?
                + 1
        }
    };
    // validate everything before touching state
    for value in values {
        check_payloads(state, operation, value)?;
    }

    let mut ids = Vec::with_capacity(values.len());
    for value in values {
        let id = insert_value(state, operation, value)?;
        if let Some(siblings) = state.children.get_mut(parent) {
            siblings.insert(at, id.clone());
        }
        at += 1;
        ids.push(id);
    }
    Ok(ids)
}

fn check_payloads(state: &State, operation: &'static str, value: &Value) -> Result<(), RemoteError> {
    let ty = value["type"].as_str().unwrap_or_default();
    state.stored_payload(operation, &value[ty])?;
    if let Some(children) = value[ty]["children"].as_array() {
        for child in children {
            check_payloads(state, operation, child)?;
        }
    }
    Ok(())
}

fn insert_value(state: &mut State, operation: &'static str, value: &Value) -> Result<BlockId, RemoteError> {
    let ty = value["type"].as_str().unwrap_or_default().to_string();
    let id = BlockId::new(state.id("b"));
    let payload = state.stored_payload(operation, &value[ty.as_str()])?;
    let mut children = Vec::new();
    if let Some(nested) = value[ty.as_str()]["children"].as_array() {
        for child in nested {
            children.push(insert_value(state, operation, child)?);
        }
    }
    state.nodes.insert(
        id.clone(),
        Node {
            block_type: ty,
            payload,
        },
    );
    state.children.insert(id.clone(), children);
    Ok(id)
}

impl WorkspaceApi for FakeWorkspace {
    async fn create_page(
        &self,
        parent: &PageParent,
        title_property: &str,
        title: &str,
    ) -> Result<PageId, RemoteError> {
        let mut state = self.state();
        state.enter("create_page")?;
        if let PageParent::Database(database) = parent {
            match state.databases.get(database) {
                Some((property, _)) if property == title_property => {}
                Some(_) => return Err(validation("create_page", "unknown title property")),
                None => return Err(not_found("create_page", database)),
            }
        }
        let page = PageId::new(state.id("page-"));
        insert_page(&mut state, parent, &page, title);
        Ok(page)
    }

    async fn update_page(&self, page: &PageId, update: &PageUpdate) -> Result<(), RemoteError> {
        let mut state = self.state();
        state.enter("update_page")?;
        state.page_updates.push((page.clone(), update.clone()));
        Ok(())
    }

    async fn delete_page(&self, page: &PageId) -> Result<(), RemoteError> {
        let mut state = self.state();
        state.enter("delete_page")?;
        let block = BlockId::from(page);
        for siblings in state.children.values_mut() {
            siblings.retain(|id| *id != block);
        }
        for (_, pages) in state.databases.values_mut() {
            pages.retain(|p| p.id != *page);
        }
        state.remove_subtree(&block);
        state.archived_pages.push(page.clone());
        Ok(())
    }

    async fn append_block_children(
        &self,
        parent: &BlockId,
        children: &[Value],
        position: &InsertPosition,
    ) -> Result<Vec<BlockId>, RemoteError> {
        let mut state = self.state();
        state.enter("append_block_children")?;
        check_shape("append_block_children", children, 1)?;
        state.append_sizes.push(children.len());
        insert_values(&mut state, "append_block_children", parent, children, position)
    }

    async fn update_block(&self, id: &BlockId, body: &Value) -> Result<(), RemoteError> {
        let mut state = self.state();
        state.enter("update_block")?;
        let Some(block_type) = state.nodes.get(id).map(|n| n.block_type.clone()) else {
            return Err(not_found("update_block", id));
        };
        let Some(payload) = body.get(&block_type) else {
            return Err(validation("update_block", "block type cannot change"));
        };
        let payload = state.stored_payload("update_block", payload)?;
        if let Some(node) = state.nodes.get_mut(id) {
            node.payload = payload;
        }
        Ok(())
    }

    async fn delete_block(&self, id: &BlockId) -> Result<(), RemoteError> {
        let mut state = self.state();
        state.enter("delete_block")?;
        if !state.nodes.contains_key(id) {
            return Err(not_found("delete_block", id));
        }
        for siblings in state.children.values_mut() {
            siblings.retain(|child| child != id);
        }
        state.remove_subtree(id);
        Ok(())
    }

    async fn list_block_children(&self, parent: &BlockId) -> Result<Vec<RemoteBlock>, RemoteError> {
        let mut state = self.state();
        state.enter("list_block_children")?;
        let Some(ids) = state.children.get(parent) else {
            return Err(not_found("list_block_children", parent));
        };
        Ok(ids
            .iter()
            .filter_map(|id| {
                let node = state.nodes.get(id)?;
                Some(RemoteBlock {
                    id: id.clone(),
                    block_type: node.block_type.clone(),
                    has_children: state.children.get(id).is_some_and(|c| !c.is_empty()),
                    payload: node.payload.clone(),
                })
            })
            .collect())
    }

    async fn list_discussions(&self, id: &BlockId) -> Result<usize, RemoteError> {
        let mut state = self.state();
        state.enter("list_discussions")?;
        Ok(state.discussions.get(id).copied().unwrap_or(0))
    }

    async fn create_file_upload(&self, request: &FileUploadRequest) -> Result<FileUpload, RemoteError> {
        let mut state = self.state();
        state.enter("create_file_upload")?;
        let id = UploadId::new(state.id("upload-"));
        let pending_polls = state.pending_polls;
        state.uploads.insert(
            id.clone(),
            Upload {
                filename: request.filename.clone(),
                mode: request.mode,
                parts: Vec::new(),
                completed: false,
                pending_polls,
            },
        );
        Ok(FileUpload {
            id,
            status: UploadStatus::Pending,
        })
    }

    async fn send_file_upload(
        &self,
        id: &UploadId,
        part: Option<u32>,
        _request: &FileUploadRequest,
        _bytes: Bytes,
    ) -> Result<(), RemoteError> {
        let mut state = self.state();
        state.enter("send_file_upload")?;
        let upload = state
            .uploads
            .get_mut(id)
            .ok_or_else(|| not_found("send_file_upload", id))?;
        if let Some(part) = part {
            upload.parts.push(part);
        }
        Ok(())
    }

    async fn complete_file_upload(&self, id: &UploadId) -> Result<(), RemoteError> {
        let mut state = self.state();
        state.enter("complete_file_upload")?;
        let upload = state
            .uploads
            .get_mut(id)
            .ok_or_else(|| not_found("complete_file_upload", id))?;
        if let UploadMode::MultiPart { parts } = upload.mode {
            if upload.parts.len() != parts as usize {
                return Err(validation("complete_file_upload", "missing parts"));
            }
        }
        upload.completed = true;
        Ok(())
    }

    async fn get_file_upload(&self, id: &UploadId) -> Result<FileUpload, RemoteError> {
        let mut state = self.state();
        state.enter("get_file_upload")?;
        let failing = state.failing_files.clone();
        let upload = state
            .uploads
            .get_mut(id)
            .ok_or_else(|| not_found("get_file_upload", id))?;
        let status = if upload.pending_polls > 0 {
            upload.pending_polls -= 1;
            UploadStatus::Pending
        } else if failing.contains(&upload.filename) {
            UploadStatus::Failed
        } else {
            UploadStatus::Uploaded
        };
        Ok(FileUpload {
            id: id.clone(),
            status,
        })
    }

    async fn retrieve_database(&self, database: &DatabaseId) -> Result<DatabaseSchema, RemoteError> {
        let mut state = self.state();
        state.enter("retrieve_database")?;
        match state.databases.get(database) {
            Some((title_property, _)) => Ok(DatabaseSchema {
                title_property: title_property.clone(),
            }),
            None => Err(not_found("retrieve_database", database)),
        }
    }

    async fn query_database(
        &self,
        database: &DatabaseId,
        _title_property: &str,
    ) -> Result<Vec<PageSummary>, RemoteError> {
        let mut state = self.state();
        state.enter("query_database")?;
        match state.databases.get(database) {
            Some((_, pages)) => Ok(pages.clone()),
            None => Err(not_found("query_database", database)),
        }
    }
}
