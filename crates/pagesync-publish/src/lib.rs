//! Publishing a block document to a remote workspace page.
//!
//! [`sync`] makes one page hold exactly one document with the fewest remote
//! calls it can: blocks that did not change keep their ids, edits land in
//! place, reordered blocks move, and only what is new is created. The
//! [`IdentityMap`](pagesync_common::IdentityMap) carried between runs remembers
//! which remote block each local block became.

pub mod api;
pub mod create;
pub mod diff;
pub mod error;
pub mod http;
pub mod media;
pub mod remote;
pub mod report;
pub mod retry;
pub mod sync;

#[cfg(test)]
mod testing;

pub use crate::api::{CoverUpdate, InsertPosition, PageParent, PageUpdate, WorkspaceApi};
pub use crate::diff::{SyncOp, SyncPlan};
pub use crate::error::{DiscussedBlock, MediaCause, MediaFailure, SyncError, SyncFailure};
pub use crate::http::NotionClient;
pub use crate::report::{OpKind, OpOutcome, OpRecord, SyncReport};
pub use crate::sync::{CoverSource, PageTarget, publish, sync, unpublish};
