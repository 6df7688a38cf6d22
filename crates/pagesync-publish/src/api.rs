//! The remote workspace as the publisher sees it.
//!
//! [`WorkspaceApi`] names every call the sync engine makes. The HTTP client
//! in [`crate::http`] is the real implementation; tests run against an
//! in-memory workspace.

use bytes::Bytes;
use pagesync_common::{BlockId, DatabaseId, PageId, RemoteError, UploadId};
use serde_json::Value;
use std::future::Future;

/// Where a page lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageParent {
    Page(PageId),
    Database(DatabaseId),
}

/// Where appended children go among the parent's existing children.
///
/// The remote has no way to insert before the first child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertPosition {
    End,
    After(BlockId),
}

/// One block from a children listing, without its own children.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteBlock {
    pub id: BlockId,
    pub block_type: String,
    pub has_children: bool,
    /// The type-specific object, `block[block_type]`.
    pub payload: Value,
}

impl RemoteBlock {
    /// Title of a `child_page` block.
    pub fn child_page_title(&self) -> Option<&str> {
        (self.block_type == "child_page")
            .then(|| self.payload["title"].as_str())
            .flatten()
    }
}

/// A page row found in a database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSummary {
    pub id: PageId,
    pub title: String,
}

/// What a database needs to address its pages by title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseSchema {
    /// Name of the property of type `title`.
    pub title_property: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoverUpdate {
    Keep,
    Clear,
    External(String),
    Uploaded(UploadId),
}

/// Page-level properties to set. The icon is an emoji; `None` clears it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageUpdate {
    pub icon: Option<String>,
    pub cover: CoverUpdate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadMode {
    SinglePart,
    MultiPart { parts: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUploadRequest {
    pub filename: String,
    pub content_type: String,
    pub mode: UploadMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadStatus {
    Pending,
    Uploaded,
    Failed,
    Expired,
    Other(String),
}

impl UploadStatus {
    pub fn parse(status: &str) -> Self {
        match status {
            "pending" => UploadStatus::Pending,
            "uploaded" => UploadStatus::Uploaded,
            "failed" => UploadStatus::Failed,
            "expired" => UploadStatus::Expired,
            other => UploadStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Uploaded => "uploaded",
            UploadStatus::Failed => "failed",
            UploadStatus::Expired => "expired",
            UploadStatus::Other(other) => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpload {
    pub id: UploadId,
    pub status: UploadStatus,
}

/// Calls the sync engine makes against the remote workspace.
///
/// Each method is one logical call. Listing methods follow pagination
/// themselves and return everything. Retrying is the caller's business.
pub trait WorkspaceApi: Send + Sync {
    fn create_page(
        &self,
        parent: &PageParent,
        title_property: &str,
        title: &str,
    ) -> impl Future<Output = Result<PageId, RemoteError>> + Send;

    fn update_page(
        &self,
        page: &PageId,
        update: &PageUpdate,
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;

    /// Move a page to the trash.
    fn delete_page(&self, page: &PageId) -> impl Future<Output = Result<(), RemoteError>> + Send;

    /// Append encoded blocks under `parent`, returning the ids of the
    /// top-level blocks created, in order.
    fn append_block_children(
        &self,
        parent: &BlockId,
        children: &[Value],
        position: &InsertPosition,
    ) -> impl Future<Output = Result<Vec<BlockId>, RemoteError>> + Send;

    /// Replace a block's own content. `body` is `{type: payload}`.
    fn update_block(
        &self,
        id: &BlockId,
        body: &Value,
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;

    fn delete_block(&self, id: &BlockId) -> impl Future<Output = Result<(), RemoteError>> + Send;

    fn list_block_children(
        &self,
        parent: &BlockId,
    ) -> impl Future<Output = Result<Vec<RemoteBlock>, RemoteError>> + Send;

    /// Number of discussion threads attached to a block.
    fn list_discussions(
        &self,
        id: &BlockId,
    ) -> impl Future<Output = Result<usize, RemoteError>> + Send;

    fn create_file_upload(
        &self,
        request: &FileUploadRequest,
    ) -> impl Future<Output = Result<FileUpload, RemoteError>> + Send;

    /// Send file bytes. `part` is the 1-based part number of a multi-part
    /// upload and `None` for a single-part one.
    fn send_file_upload(
        &self,
        id: &UploadId,
        part: Option<u32>,
        request: &FileUploadRequest,
        bytes: Bytes,
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;

    fn complete_file_upload(
        &self,
        id: &UploadId,
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;

    fn get_file_upload(
        &self,
        id: &UploadId,
    ) -> impl Future<Output = Result<FileUpload, RemoteError>> + Send;

    fn retrieve_database(
        &self,
        database: &DatabaseId,
    ) -> impl Future<Output = Result<DatabaseSchema, RemoteError>> + Send;

    /// Every page in the database, titled via `title_property`.
    fn query_database(
        &self,
        database: &DatabaseId,
        title_property: &str,
    ) -> impl Future<Output = Result<Vec<PageSummary>, RemoteError>> + Send;
}
