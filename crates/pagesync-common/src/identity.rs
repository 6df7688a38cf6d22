//! Persisted identity of published blocks.
//!
//! The map is keyed per target page title. Inside a page, keys are the
//! dotted structural path of a block in the last published tree (`"0.3.1"`),
//! and values remember which remote block holds it and what its content
//! fingerprint was at publish time.
//!
//! Only the sync orchestrator mutates an [`IdentityMap`]; everything else
//! reads an [`IdentitySnapshot`] taken before planning.

use crate::error::StoreError;
use crate::fingerprint::Fingerprint;
use crate::ids::BlockId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Reserved key for the digest of the page icon and cover.
pub const COVER_KEY: &str = "$cover";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityEntry {
    pub remote_block_id: BlockId,
    pub fingerprint: Fingerprint,
}

impl IdentityEntry {
    pub fn new(remote_block_id: BlockId, fingerprint: Fingerprint) -> Self {
        Self {
            remote_block_id,
            fingerprint,
        }
    }
}

/// Entries for a single page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageIdentity {
    entries: BTreeMap<String, IdentityEntry>,
}

impl PageIdentity {
    pub fn get(&self, key: &str) -> Option<&IdentityEntry> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, entry: IdentityEntry) {
        self.entries.insert(key.into(), entry);
    }

    /// Drop every entry pointing at `id`.
    pub fn forget_block(&mut self, id: &BlockId) {
        self.entries.retain(|_, entry| entry.remote_block_id != *id);
    }

    /// Keep only the keys accepted by `keep`. The cover entry always survives.
    pub fn retain_keys(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.entries
            .retain(|key, _| key.as_str() == COVER_KEY || keep(key.as_str()));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &IdentityEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// All pages published from one build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityMap {
    #[serde(default)]
    pages: BTreeMap<String, PageIdentity>,
}

impl IdentityMap {
    pub fn page(&self, title: &str) -> Option<&PageIdentity> {
        self.pages.get(title)
    }

    pub fn page_mut(&mut self, title: &str) -> &mut PageIdentity {
        self.pages.entry(title.to_string()).or_default()
    }

    pub fn forget_page(&mut self, title: &str) -> Option<PageIdentity> {
        self.pages.remove(title)
    }

    /// Immutable view of one page, indexed by remote block id.
    pub fn snapshot(&self, title: &str) -> IdentitySnapshot {
        let by_block = self
            .page(title)
            .map(|page| {
                page.iter()
                    .filter(|(key, _)| *key != COVER_KEY)
                    .map(|(_, entry)| (entry.remote_block_id.clone(), entry.fingerprint))
                    .collect()
            })
            .unwrap_or_default();
        IdentitySnapshot {
            by_block: Arc::new(by_block),
        }
    }
}

/// Read-only view of a page's identities, cheap to clone across tasks.
#[derive(Debug, Clone, Default)]
pub struct IdentitySnapshot {
    by_block: Arc<BTreeMap<BlockId, Fingerprint>>,
}

impl IdentitySnapshot {
    /// Fingerprint recorded when `id` was last published.
    pub fn fingerprint_of(&self, id: &BlockId) -> Option<Fingerprint> {
        self.by_block.get(id).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.by_block.is_empty()
    }
}

/// Somewhere an [`IdentityMap`] lives between builds.
pub trait IdentityStore: Send + Sync {
    /// Load the map. A store with nothing saved yet yields an empty map.
    fn load(&self) -> impl Future<Output = Result<IdentityMap, StoreError>> + Send;

    /// Replace the stored map.
    fn save(&self, map: &IdentityMap) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// An [`IdentityStore`] backed by a JSON file.
///
/// Writes go to a sibling temp file that is then renamed over the target, so
/// a crash mid-write never leaves a truncated map behind.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl IdentityStore for FileStore {
    async fn load(&self) -> Result<IdentityMap, StoreError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "no identity map yet, starting fresh");
                return Ok(IdentityMap::default());
            }
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        serde_json::from_str(&contents).map_err(|source| StoreError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    async fn save(&self, map: &IdentityMap) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(map).map_err(StoreError::Serialize)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::Write {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        let temp = self.temp_path();
        tokio::fs::write(&temp, json)
            .await
            .map_err(|source| StoreError::Write {
                path: temp.clone(),
                source,
            })?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|source| StoreError::Write {
                path: self.path.clone(),
                source,
            })
    }
}

/// In-process store, mostly for tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    map: Mutex<Option<IdentityMap>>,
}

impl MemoryStore {
    pub fn new(map: IdentityMap) -> Self {
        Self {
            map: Mutex::new(Some(map)),
        }
    }

    /// What was last saved, if anything.
    pub fn saved(&self) -> Option<IdentityMap> {
        self.map.lock().ok().and_then(|m| m.clone())
    }
}

impl IdentityStore for MemoryStore {
    async fn load(&self) -> Result<IdentityMap, StoreError> {
        Ok(self.saved().unwrap_or_default())
    }

    async fn save(&self, map: &IdentityMap) -> Result<(), StoreError> {
        if let Ok(mut slot) = self.map.lock() {
            *slot = Some(map.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(seed: &[u8]) -> Fingerprint {
        Fingerprint::from(blake3::hash(seed))
    }

    #[test]
    fn snapshot_indexes_by_block_and_skips_cover() {
        let mut map = IdentityMap::default();
        let page = map.page_mut("Guide");
        page.insert("0", IdentityEntry::new(BlockId::new("b0"), fp(b"a")));
        page.insert(COVER_KEY, IdentityEntry::new(BlockId::new("cover"), fp(b"c")));

        let snap = map.snapshot("Guide");
        assert_eq!(snap.fingerprint_of(&BlockId::new("b0")), Some(fp(b"a")));
        assert_eq!(snap.fingerprint_of(&BlockId::new("cover")), None);
        assert!(map.snapshot("Other").is_empty());
    }

    #[test]
    fn forget_and_retain() {
        let mut page = PageIdentity::default();
        page.insert("0", IdentityEntry::new(BlockId::new("b0"), fp(b"a")));
        page.insert("1", IdentityEntry::new(BlockId::new("b1"), fp(b"b")));
        page.insert(COVER_KEY, IdentityEntry::new(BlockId::new("c"), fp(b"c")));

        page.forget_block(&BlockId::new("b0"));
        assert!(page.get("0").is_none());

        page.retain_keys(|key| key == "9");
        assert!(page.get("1").is_none());
        assert!(page.get(COVER_KEY).is_some());
    }

    #[tokio::test]
    async fn file_store_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("identity.json"));
        assert_eq!(store.load().await.unwrap(), IdentityMap::default());
    }

    #[tokio::test]
    async fn file_store_round_trip_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("identity.json");
        let store = FileStore::new(&path);

        let mut map = IdentityMap::default();
        map.page_mut("Guide")
            .insert("0.1", IdentityEntry::new(BlockId::new("b1"), fp(b"x")));
        store.save(&map).await.unwrap();

        assert_eq!(store.load().await.unwrap(), map);
        assert!(!dir.path().join("nested").join("identity.json.tmp").exists());
    }

    #[tokio::test]
    async fn file_store_reports_corrupt_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        std::fs::write(&path, "{ nope").unwrap();
        let err = FileStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, StoreError::Parse { .. }));
    }
}
