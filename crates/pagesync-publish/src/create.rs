//! Creating block subtrees under the remote's nesting ceiling.
//!
//! Each append carries at most two levels. The driver sends the first round,
//! then uses the returned ids to send the levels below, so a later round for
//! a block never starts before the call creating that block has returned.

use crate::api::{InsertPosition, WorkspaceApi};
use crate::error::SyncError;
use crate::retry::Remote;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, try_join_all};
use pagesync_common::{BlockId, RemoteError};
use pagesync_renderer::Block;
use pagesync_renderer::nesting::{FollowUp, RequestEntry, plan_requests};
use pagesync_renderer::wire::InvalidBlock;
use tracing::{debug, trace};

/// Ids of a created subtree, mirroring the local blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedNode {
    pub id: BlockId,
    pub children: Vec<CreatedNode>,
}

impl CreatedNode {
    /// `(relative path, id)` for every node, this one first.
    pub fn flatten(&self) -> Vec<(Vec<usize>, BlockId)> {
        let mut out = vec![(Vec::new(), self.id.clone())];
        for (idx, child) in self.children.iter().enumerate() {
            for (mut path, id) in child.flatten() {
                path.insert(0, idx);
                out.push((path, id));
            }
        }
        out
    }
}

/// Create `blocks` as consecutive children of `parent`, the first one at
/// `position`, with all their descendants.
///
/// Returns the created ids in block order. If a round below the first one
/// fails, the error is [`SyncError::PartialTree`] naming the deepest block
/// that was created.
pub async fn create_subtrees<A: WorkspaceApi>(
    remote: &Remote<'_, A>,
    parent: &BlockId,
    blocks: &[Block],
    position: InsertPosition,
) -> Result<Vec<CreatedNode>, SyncError> {
    create_level(remote, parent.clone(), blocks, position).await
}

fn create_level<'f, A>(
    remote: &'f Remote<'_, A>,
    parent: BlockId,
    blocks: &'f [Block],
    position: InsertPosition,
) -> BoxFuture<'f, Result<Vec<CreatedNode>, SyncError>>
where
    A: WorkspaceApi + 'f,
{
    async move {
        let requests = plan_requests(blocks).map_err(|source| InvalidBlock {
            path: format!("under {parent}"),
            source,
        })?;

        let mut position = position;
        let mut created = Vec::with_capacity(blocks.len());
        for request in requests {
            let ids = remote
                .call("append_block_children", |api| {
                    api.append_block_children(&parent, &request.children, &position)
                })
                .await?;
            if ids.len() != request.entries.len() {
                return Err(SyncError::Remote {
                    attempts: 1,
                    source: RemoteError::permanent(
                        "append_block_children",
                        format!("sent {} blocks, got {} ids back", request.entries.len(), ids.len()),
                    ),
                });
            }
            trace!(parent = %parent, count = ids.len(), "appended");
            if let Some(last) = ids.last() {
                position = InsertPosition::After(last.clone());
            }

            // the remote's worker pool bounds how many of these run at once
            let follow_ups = request
                .entries
                .into_iter()
                .zip(ids)
                .map(|(entry, id)| follow_up(remote, entry, id));
            created.extend(try_join_all(follow_ups).await?);
        }
        Ok(created)
    }
    .boxed()
}

/// Send whatever of `entry`'s subtree its creating request left out.
async fn follow_up<'f, A>(
    remote: &'f Remote<'_, A>,
    entry: RequestEntry<'f>,
    id: BlockId,
) -> Result<CreatedNode, SyncError>
where
    A: WorkspaceApi + 'f,
{
    let block = entry.block;
    let children = match entry.follow_up {
        FollowUp::Done => Vec::new(),
        FollowUp::Children => {
            create_level(remote, id.clone(), &block.children, InsertPosition::End)
                .await
                .map_err(|e| partial(&id, e))?
        }
        FollowUp::Grandchildren => {
            let listed = remote
                .call("list_block_children", |api| api.list_block_children(&id))
                .await
                .map_err(|e| partial(&id, e.into()))?;
            if listed.len() != block.children.len() {
                let mismatch = SyncError::Remote {
                    attempts: 1,
                    source: RemoteError::permanent(
                        "list_block_children",
                        format!(
                            "expected {} embedded children, found {}",
                            block.children.len(),
                            listed.len()
                        ),
                    ),
                };
                return Err(partial(&id, mismatch));
            }
            debug!(parent = %id, children = listed.len(), "embedded children created");
            let grandchildren = block
                .children
                .iter()
                .zip(listed)
                .map(|(child, listed)| embedded_child(remote, child, listed.id));
            try_join_all(grandchildren).await?
        }
    };
    Ok(CreatedNode { id, children })
}

/// Descend below a child that was embedded in its parent's request.
async fn embedded_child<'f, A>(
    remote: &'f Remote<'_, A>,
    child: &'f Block,
    id: BlockId,
) -> Result<CreatedNode, SyncError>
where
    A: WorkspaceApi + 'f,
{
    let children = if child.children.is_empty() {
        Vec::new()
    } else {
        create_level(remote, id.clone(), &child.children, InsertPosition::End)
            .await
            .map_err(|e| partial(&id, e))?
    };
    Ok(CreatedNode { id, children })
}

/// Wrap a failure below `created`, keeping the deepest partial point.
fn partial(created: &BlockId, error: SyncError) -> SyncError {
    match error {
        SyncError::PartialTree { .. } | SyncError::Cancelled => error,
        other => SyncError::PartialTree {
            last_created: created.clone(),
            source: Box::new(other),
        },
    }
}
