//! Local media: content digests and the upload lifecycle.
//!
//! A local file goes `Pending -> Uploading -> Resolved` through a remote
//! upload session, or ends in `Failed`. External URLs are resolved as-is.
//! Every file is uploaded at most once per run, however many blocks use it.

use crate::api::{FileUploadRequest, UploadMode, UploadStatus, WorkspaceApi};
use crate::error::{MediaCause, MediaFailure, SyncError};
use crate::retry::{Remote, RetryError};
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{StreamExt, stream};
use pagesync_common::{Fingerprint, UploadId};
use pagesync_renderer::{Block, MediaReference};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Files above this size go up in parts.
pub const MULTIPART_THRESHOLD: usize = 20 * 1024 * 1024;
pub const PART_SIZE: usize = 10 * 1024 * 1024;

/// Where a local file is in its upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadState {
    Pending,
    Uploading { upload_id: UploadId },
    Resolved(MediaReference),
    Failed(String),
}

/// Stamp the blake3 digest of every local file referenced by `blocks`.
///
/// Unreadable files are collected and reported together.
pub async fn stamp_digests(blocks: &mut [Block]) -> Result<(), SyncError> {
    let mut paths = BTreeSet::new();
    for block in blocks.iter() {
        block.walk(&mut |b| {
            if let Some(MediaReference::Local { path, digest: None }) = b.kind.media_source() {
                paths.insert(path.clone());
            }
        });
    }

    let mut digests = BTreeMap::new();
    let mut failures = Vec::new();
    for path in paths {
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                digests.insert(path, Fingerprint::from(blake3::hash(&bytes)));
            }
            Err(source) => failures.push(MediaFailure {
                reference: path.display().to_string(),
                cause: MediaCause::Read { path, source },
            }),
        }
    }
    if !failures.is_empty() {
        return Err(SyncError::MediaUpload { failures });
    }

    for block in blocks.iter_mut() {
        block.walk_mut(&mut |b| {
            if let Some(MediaReference::Local { path, digest }) = b.kind.media_source_mut() {
                if digest.is_none() {
                    *digest = digests.get(path).copied();
                }
            }
        });
    }
    Ok(())
}

/// Digest of one file, for the page cover.
pub async fn file_digest(path: &Path) -> Result<Fingerprint, MediaCause> {
    let bytes = tokio::fs::read(path).await.map_err(|source| MediaCause::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Fingerprint::from(blake3::hash(&bytes)))
}

pub struct MediaResolver<'a, A> {
    remote: Remote<'a, A>,
    states: DashMap<PathBuf, UploadState>,
}

impl<'a, A: WorkspaceApi> MediaResolver<'a, A> {
    pub fn new(remote: Remote<'a, A>) -> Self {
        Self {
            remote,
            states: DashMap::new(),
        }
    }

    pub fn state(&self, path: &Path) -> Option<UploadState> {
        self.states.get(path).map(|state| state.value().clone())
    }

    /// Files that finished uploading during this run.
    pub fn uploaded(&self) -> Vec<PathBuf> {
        self.states
            .iter()
            .filter(|entry| matches!(entry.value(), UploadState::Resolved(_)))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Resolve one reference to something the remote can attach.
    pub async fn resolve(&self, reference: &MediaReference) -> Result<MediaReference, MediaCause> {
        let (path, digest) = match reference {
            MediaReference::Local { path, digest } => (path, *digest),
            other => return Ok(other.clone()),
        };
        if let Some(UploadState::Resolved(done)) = self.state(path) {
            return Ok(done);
        }

        self.states.insert(path.clone(), UploadState::Pending);
        match self.upload(path).await {
            Ok(upload_id) => {
                let resolved = MediaReference::Uploaded { upload_id, digest };
                self.states
                    .insert(path.clone(), UploadState::Resolved(resolved.clone()));
                Ok(resolved)
            }
            Err(cause) => {
                self.states
                    .insert(path.clone(), UploadState::Failed(cause.to_string()));
                Err(cause)
            }
        }
    }

    /// Resolve every local reference, each distinct file once, concurrently.
    ///
    /// Fails with all failures together rather than stopping at the first.
    pub async fn resolve_all(
        &self,
        references: impl IntoIterator<Item = MediaReference>,
    ) -> Result<BTreeMap<PathBuf, MediaReference>, SyncError> {
        let mut unique = BTreeMap::new();
        for reference in references {
            if let MediaReference::Local { path, .. } = &reference {
                unique.entry(path.clone()).or_insert(reference);
            }
        }
        if unique.is_empty() {
            return Ok(BTreeMap::new());
        }
        info!(files = unique.len(), "uploading local media");

        let outcomes: Vec<_> = stream::iter(unique)
            .map(|(path, reference)| async move {
                let outcome = self.resolve(&reference).await;
                (path, outcome)
            })
            .buffer_unordered(self.remote.policy.concurrency())
            .collect()
            .await;

        let mut resolved = BTreeMap::new();
        let mut failures = Vec::new();
        for (path, outcome) in outcomes {
            match outcome {
                Ok(reference) => {
                    resolved.insert(path, reference);
                }
                Err(MediaCause::Cancelled) => return Err(SyncError::Cancelled),
                Err(cause) => {
                    warn!(path = %path.display(), error = %cause, "upload failed");
                    failures.push(MediaFailure {
                        reference: path.display().to_string(),
                        cause,
                    });
                }
            }
        }
        if failures.is_empty() {
            Ok(resolved)
        } else {
            failures.sort_by(|a, b| a.reference.cmp(&b.reference));
            Err(SyncError::MediaUpload { failures })
        }
    }

    async fn upload(&self, path: &Path) -> Result<UploadId, MediaCause> {
        let bytes = Bytes::from(tokio::fs::read(path).await.map_err(|source| MediaCause::Read {
            path: path.to_path_buf(),
            source,
        })?);
        let request = upload_request(path, &bytes);
        debug!(path = %path.display(), bytes = bytes.len(), mode = ?request.mode, "starting upload");

        let upload = self
            .remote
            .call("create_file_upload", |api| api.create_file_upload(&request))
            .await
            .map_err(remote_cause)?;
        let id = upload.id;
        self.states.insert(
            path.to_path_buf(),
            UploadState::Uploading {
                upload_id: id.clone(),
            },
        );

        match request.mode {
            UploadMode::SinglePart => {
                self.remote
                    .call("send_file_upload", |api| {
                        api.send_file_upload(&id, None, &request, bytes.clone())
                    })
                    .await
                    .map_err(remote_cause)?;
            }
            UploadMode::MultiPart { parts } => {
                for part in 1..=parts {
                    let start = (part as usize - 1) * PART_SIZE;
                    let chunk = bytes.slice(start..(start + PART_SIZE).min(bytes.len()));
                    self.remote
                        .call("send_file_upload", |api| {
                            api.send_file_upload(&id, Some(part), &request, chunk.clone())
                        })
                        .await
                        .map_err(remote_cause)?;
                }
                self.remote
                    .call("complete_file_upload", |api| api.complete_file_upload(&id))
                    .await
                    .map_err(remote_cause)?;
            }
        }

        self.wait_until_uploaded(&id).await?;
        Ok(id)
    }

    /// Poll the session until it is terminal, doubling the interval up to the
    /// backoff cap, for at most the upload timeout. A zero poll interval
    /// starts from the retry backoff base instead.
    async fn wait_until_uploaded(&self, id: &UploadId) -> Result<(), MediaCause> {
        let policy = self.remote.policy;
        let timeout = policy.upload_timeout();
        let deadline = Instant::now() + timeout;
        let mut interval = policy.upload_poll_interval();
        if interval.is_zero() {
            interval = Duration::from_millis(policy.initial_backoff_ms.max(1));
        }
        let max_interval = Duration::from_millis(policy.max_backoff_ms).max(interval);
        loop {
            let upload = self
                .remote
                .call("get_file_upload", |api| api.get_file_upload(id))
                .await
                .map_err(remote_cause)?;
            match upload.status {
                UploadStatus::Uploaded => return Ok(()),
                UploadStatus::Failed | UploadStatus::Expired => {
                    return Err(MediaCause::Status(upload.status.as_str().to_string()));
                }
                UploadStatus::Pending | UploadStatus::Other(_) => {}
            }
            if Instant::now() + interval > deadline {
                return Err(MediaCause::Timeout(timeout));
            }
            tokio::select! {
                biased;
                _ = self.remote.cancel.cancelled() => return Err(MediaCause::Cancelled),
                _ = tokio::time::sleep(interval) => {}
            }
            interval = (interval * 2).min(max_interval);
        }
    }
}

fn remote_cause(err: RetryError) -> MediaCause {
    match err {
        RetryError::Cancelled => MediaCause::Cancelled,
        RetryError::Failed { error, .. } => MediaCause::Remote(error),
    }
}

fn upload_request(path: &Path, bytes: &Bytes) -> FileUploadRequest {
    use mime_sniffer::MimeTypeSniffer;

    let filename = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("upload")
        .to_string();
    let content_type = bytes
        .sniff_mime_type()
        .or_else(|| content_type_from_extension(path))
        .unwrap_or("application/octet-stream")
        .to_string();
    let mode = if bytes.len() > MULTIPART_THRESHOLD {
        UploadMode::MultiPart {
            parts: bytes.len().div_ceil(PART_SIZE) as u32,
        }
    } else {
        UploadMode::SinglePart
    };
    FileUploadRequest {
        filename,
        content_type,
        mode,
    }
}

/// Fallback for formats the sniffer does not recognise.
fn content_type_from_extension(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    Some(match ext.as_str() {
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "pdf" => "application/pdf",
        "txt" | "md" => "text/plain",
        "json" => "application/json",
        _ => return None,
    })
}
