//! Reading a page's current block tree back from the remote.

use crate::api::{RemoteBlock, WorkspaceApi};
use crate::error::SyncError;
use crate::retry::Remote;
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt, TryStreamExt, stream};
use pagesync_common::{BlockId, Fingerprint, IdentitySnapshot};
use pagesync_renderer::fingerprint::{combine, own_fingerprint};
use pagesync_renderer::wire::{DecodedBlock, decode_payload, decode_table_row};
use pagesync_renderer::{Block, BlockKind, MediaReference, TableRow};
use tracing::debug;

/// A remote block with its decoded content and effective fingerprints.
#[derive(Debug, Clone)]
pub struct RemoteNode {
    pub id: BlockId,
    pub block_type: String,
    /// `None` for types the block model does not represent. Those never
    /// match a local block and are replaced on sync.
    pub decoded: Option<DecodedBlock>,
    pub own: Fingerprint,
    pub fingerprint: Fingerprint,
    pub children: Vec<RemoteNode>,
}

impl RemoteNode {
    fn build(
        block: RemoteBlock,
        children: Vec<RemoteNode>,
        rows: Vec<TableRow>,
        snapshot: &IdentitySnapshot,
    ) -> Self {
        let mut decoded = decode_payload(&block.block_type, &block.payload);
        if let Some(DecodedBlock {
            kind: BlockKind::Table { rows: table_rows, .. },
            ..
        }) = decoded.as_mut()
        {
            *table_rows = rows;
        }

        let (own, fingerprint) = match &decoded {
            Some(d) => match (&d.kind, snapshot.fingerprint_of(&block.id)) {
                // A stored file reads back as a short-lived URL or an upload id,
                // neither of which says anything about the bytes. Trust what we
                // recorded when we sent it.
                (
                    BlockKind::Media {
                        source: MediaReference::Hosted { .. } | MediaReference::Uploaded { .. },
                        ..
                    },
                    Some(recorded),
                ) => (recorded, recorded),
                _ => {
                    let own = own_fingerprint(&d.kind, &d.runs, d.nested);
                    let child_fps: Vec<_> = children.iter().map(|c| c.fingerprint).collect();
                    (own, combine(&own, &child_fps))
                }
            },
            None => {
                let opaque = Fingerprint::from(blake3::hash(
                    format!("opaque:{}:{}", block.block_type, block.id).as_bytes(),
                ));
                (opaque, opaque)
            }
        };

        RemoteNode {
            id: block.id,
            block_type: block.block_type,
            decoded,
            own,
            fingerprint,
            children,
        }
    }

    /// The node as a block, if every block in its subtree is representable.
    pub fn to_block(&self) -> Option<Block> {
        let decoded = self.decoded.as_ref()?;
        let children = self
            .children
            .iter()
            .map(RemoteNode::to_block)
            .collect::<Option<Vec<_>>>()?;
        Some(Block {
            kind: decoded.kind.clone(),
            runs: decoded.runs.clone(),
            children,
        })
    }

    /// Ids of this node and everything below it.
    pub fn subtree_ids(&self) -> Vec<BlockId> {
        let mut ids = vec![self.id.clone()];
        for child in &self.children {
            ids.extend(child.subtree_ids());
        }
        ids
    }

    pub fn is_table(&self) -> bool {
        self.block_type == "table"
    }
}

/// Fetch the full tree under `root`.
///
/// Child listings run concurrently, bounded by the remote's worker pool.
/// Child pages and databases are listed but never descended into.
pub async fn fetch_forest<A: WorkspaceApi>(
    remote: &Remote<'_, A>,
    root: &BlockId,
    snapshot: &IdentitySnapshot,
) -> Result<Vec<RemoteNode>, SyncError> {
    let forest = fetch_children(remote, root.clone(), snapshot).await?;
    debug!(root = %root, blocks = count(&forest), "fetched remote tree");
    Ok(forest)
}

fn fetch_children<'f, A>(
    remote: &'f Remote<'_, A>,
    parent: BlockId,
    snapshot: &'f IdentitySnapshot,
) -> BoxFuture<'f, Result<Vec<RemoteNode>, SyncError>>
where
    A: WorkspaceApi + 'f,
{
    async move {
        let listing = remote
            .call("list_block_children", |api| api.list_block_children(&parent))
            .await?;
        stream::iter(listing)
            .map(|block| async move {
                if !block.has_children
                    || block.block_type == "child_page"
                    || block.block_type == "child_database"
                {
                    return Ok(RemoteNode::build(block, Vec::new(), Vec::new(), snapshot));
                }
                if block.block_type == "table" {
                    let rows = remote
                        .call("list_block_children", |api| api.list_block_children(&block.id))
                        .await?
                        .iter()
                        .filter(|row| row.block_type == "table_row")
                        .map(|row| decode_table_row(&row.payload))
                        .collect();
                    return Ok(RemoteNode::build(block, Vec::new(), rows, snapshot));
                }
                let children = fetch_children(remote, block.id.clone(), snapshot).await?;
                Ok(RemoteNode::build(block, children, Vec::new(), snapshot))
            })
            .buffered(remote.policy.concurrency())
            .try_collect()
            .await
    }
    .boxed()
}

fn count(forest: &[RemoteNode]) -> usize {
    forest.iter().map(|n| 1 + count(&n.children)).sum()
}

/// Refuse to sync over child pages or inline databases anywhere in the tree.
pub fn check_structure(title: &str, forest: &[RemoteNode]) -> Result<(), SyncError> {
    fn collect(nodes: &[RemoteNode], ty: &str, out: &mut Vec<BlockId>) {
        for node in nodes {
            if node.block_type == ty {
                out.push(node.id.clone());
            }
            collect(&node.children, ty, out);
        }
    }

    let mut pages = Vec::new();
    collect(forest, "child_page", &mut pages);
    if !pages.is_empty() {
        return Err(SyncError::PageHasSubpages {
            title: title.to_string(),
            pages,
        });
    }
    let mut databases = Vec::new();
    collect(forest, "child_database", &mut databases);
    if !databases.is_empty() {
        return Err(SyncError::PageHasDatabases {
            title: title.to_string(),
            databases,
        });
    }
    Ok(())
}

/// Remote nodes as the remote would hold `blocks` after a clean publish,
/// with ids `r<path>`.
#[cfg(test)]
pub(crate) fn mirror(blocks: &[Block]) -> Vec<RemoteNode> {
    fn node(block: &Block, path: &mut Vec<usize>) -> RemoteNode {
        let value = pagesync_renderer::wire::encode_block(block, None).expect("encodable block");
        let ty = value["type"].as_str().unwrap_or_default().to_string();
        let rows = value[ty.as_str()]["children"]
            .as_array()
            .map(|rows| rows.iter().map(|r| decode_table_row(&r["table_row"])).collect())
            .unwrap_or_default();
        let children = block
            .children
            .iter()
            .enumerate()
            .map(|(idx, child)| {
                path.push(idx);
                let child = node(child, path);
                path.pop();
                child
            })
            .collect();
        let listed = RemoteBlock {
            id: BlockId::new(format!("r{}", pagesync_renderer::path_key(path))),
            has_children: !block.children.is_empty(),
            payload: value[ty.as_str()].clone(),
            block_type: ty,
        };
        RemoteNode::build(listed, children, rows, &IdentitySnapshot::default())
    }

    let mut path = Vec::new();
    blocks
        .iter()
        .enumerate()
        .map(|(idx, block)| {
            path.push(idx);
            let built = node(block, &mut path);
            path.pop();
            built
        })
        .collect()
}
