//! Types shared by the pagesync crates: remote ids, fingerprints, error
//! taxonomy, configuration, the persisted identity map and tracing setup.

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod identity;
pub mod ids;
pub mod telemetry;

pub use crate::config::{ApiConfig, SyncPolicy};
pub use crate::error::{ConfigError, RemoteError, RemoteErrorClass, StoreError};
pub use crate::fingerprint::Fingerprint;
pub use crate::identity::{
    COVER_KEY, FileStore, IdentityEntry, IdentityMap, IdentitySnapshot, IdentityStore,
    MemoryStore, PageIdentity,
};
pub use crate::ids::{BlockId, DatabaseId, PageId, UploadId};
