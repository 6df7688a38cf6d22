use crate::report::SyncReport;
use miette::Diagnostic;
use pagesync_common::{BlockId, RemoteError, StoreError};
use pagesync_renderer::InvalidBlock;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Everything that can stop a sync.
#[derive(Debug, Error, Diagnostic)]
pub enum SyncError {
    #[error("page {title:?} has child pages ({}), refusing to sync over them", join_ids(.pages))]
    #[diagnostic(
        code(sync::page_has_subpages),
        help("move the child pages elsewhere or publish to a different title")
    )]
    PageHasSubpages { title: String, pages: Vec<BlockId> },

    #[error("page {title:?} has inline databases ({}), refusing to sync over them", join_ids(.databases))]
    #[diagnostic(
        code(sync::page_has_databases),
        help("move the databases elsewhere or publish to a different title")
    )]
    PageHasDatabases {
        title: String,
        databases: Vec<BlockId>,
    },

    #[error(
        "page {title:?} has {} block(s) with discussions that would be deleted: {}",
        .blocks.len(),
        .blocks.iter().map(|b| format!("{} ({} thread(s))", b.id, b.discussions)).collect::<Vec<_>>().join(", ")
    )]
    #[diagnostic(
        code(sync::discussions_exist),
        help("resolve the discussions, or sync without cancel-on-discussion")
    )]
    DiscussionsExist {
        title: String,
        blocks: Vec<DiscussedBlock>,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Encoding(#[from] InvalidBlock),

    #[error("{} failed after {attempts} attempt(s)", .source.operation)]
    #[diagnostic(code(sync::remote))]
    Remote {
        attempts: u32,
        #[source]
        #[diagnostic_source]
        source: RemoteError,
    },

    #[error(
        "{} media file(s) could not be uploaded: {}",
        .failures.len(),
        .failures.iter().map(|f| f.reference.as_str()).collect::<Vec<_>>().join(", ")
    )]
    #[diagnostic(code(sync::media_upload))]
    MediaUpload {
        #[related]
        failures: Vec<MediaFailure>,
    },

    #[error("nested creation stopped partway; last block created was {}", .last_created)]
    #[diagnostic(
        code(sync::partial_tree),
        help("the block and its ancestors exist remotely; rerun the sync to converge")
    )]
    PartialTree {
        last_created: BlockId,
        #[source]
        source: Box<SyncError>,
    },

    #[error("expected one page titled {title:?} under the parent, found {count}")]
    #[diagnostic(code(sync::ambiguous_page))]
    AmbiguousPage { title: String, count: usize },

    #[error("sync cancelled")]
    #[diagnostic(code(sync::cancelled))]
    Cancelled,

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
}

impl SyncError {
    /// Refusals happen before any mutation and are never worth retrying.
    pub fn is_refusal(&self) -> bool {
        matches!(
            self,
            SyncError::PageHasSubpages { .. }
                | SyncError::PageHasDatabases { .. }
                | SyncError::DiscussionsExist { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscussedBlock {
    pub id: BlockId,
    pub discussions: usize,
}

/// One media reference that failed to resolve.
#[derive(Debug, Error, Diagnostic)]
#[error("{reference}: {cause}")]
#[diagnostic(code(sync::media_upload::file))]
pub struct MediaFailure {
    /// Path or URL as written in the document.
    pub reference: String,
    pub cause: MediaCause,
}

#[derive(Debug, Error)]
pub enum MediaCause {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{0}")]
    Remote(RemoteError),

    #[error("upload ended with status {0:?}")]
    Status(String),

    #[error("upload not finished after {0:?}")]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,
}

/// A failed sync and what it managed to apply before failing.
#[derive(Debug, Error, Diagnostic)]
#[error("{error}")]
#[diagnostic(forward(error))]
pub struct SyncFailure {
    pub error: SyncError,
    pub report: SyncReport,
}

impl SyncFailure {
    pub fn new(error: SyncError, report: SyncReport) -> Self {
        Self { error, report }
    }
}

fn join_ids(ids: &[BlockId]) -> String {
    ids.iter()
        .map(BlockId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
