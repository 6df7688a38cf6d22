//! Request shaping under the remote's nesting ceiling.
//!
//! One append request may carry blocks and those blocks' children, nothing
//! deeper. A subtree of depth D therefore goes out in ⌈D/2⌉ rounds: each
//! round creates two levels, and the level below waits for the ids the
//! round hands back.
//!
//! This module only decides the shape of each request. Driving the rounds
//! against the remote lives with the publisher.

use crate::block::{Block, BlockKind};
use crate::richtext::EncodingError;
use crate::wire::encode_block;
use serde_json::Value;

/// Blocks per children array, at any level of a request.
pub const MAX_BLOCKS_PER_REQUEST: usize = 100;

/// What is left of a block's subtree after the request creating it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUp {
    /// Nothing, the block has no children.
    Done,
    /// Children went out embedded; those with children of their own need a
    /// round under them once their ids are known.
    Grandchildren,
    /// Children go out in a later round under this block.
    Children,
}

#[derive(Debug, Clone)]
pub struct RequestEntry<'a> {
    pub block: &'a Block,
    pub follow_up: FollowUp,
}

/// One append call: the encoded children array plus what each entry still
/// needs afterwards, index-aligned with the ids the call returns.
#[derive(Debug, Clone)]
pub struct AppendRequest<'a> {
    pub children: Vec<Value>,
    pub entries: Vec<RequestEntry<'a>>,
}

/// Whether `block`'s children can ride along in the request creating it.
///
/// Tables already use the second level for their rows, so a block with a
/// table child holds all its children back; splitting them would break
/// source order.
pub fn embeds_children(block: &Block) -> bool {
    !block.children.is_empty()
        && block.children.len() <= MAX_BLOCKS_PER_REQUEST
        && !block
            .children
            .iter()
            .any(|child| matches!(child.kind, BlockKind::Table { .. }))
}

/// Shape the append requests that create `blocks` as siblings, in order.
///
/// Siblings beyond the per-request limit spill into further requests for
/// the same parent, which must be sent one after another.
pub fn plan_requests(blocks: &[Block]) -> Result<Vec<AppendRequest<'_>>, EncodingError> {
    blocks
        .chunks(MAX_BLOCKS_PER_REQUEST)
        .map(|chunk| {
            let mut children = Vec::with_capacity(chunk.len());
            let mut entries = Vec::with_capacity(chunk.len());
            for block in chunk {
                let follow_up = if block.children.is_empty() {
                    FollowUp::Done
                } else if embeds_children(block) {
                    FollowUp::Grandchildren
                } else {
                    FollowUp::Children
                };
                let embedded = match follow_up {
                    FollowUp::Grandchildren => Some(
                        block
                            .children
                            .iter()
                            .map(|child| encode_block(child, None))
                            .collect::<Result<Vec<_>, _>>()?,
                    ),
                    FollowUp::Done | FollowUp::Children => None,
                };
                children.push(encode_block(block, embedded)?);
                entries.push(RequestEntry { block, follow_up });
            }
            Ok(AppendRequest { children, entries })
        })
        .collect()
}

/// Number of dependent request rounds needed to create `blocks`.
pub fn round_count(blocks: &[Block]) -> usize {
    if blocks.is_empty() {
        return 0;
    }
    let deeper = blocks
        .iter()
        .map(|block| {
            if embeds_children(block) {
                block
                    .children
                    .iter()
                    .map(|child| round_count(&child.children))
                    .max()
                    .unwrap_or(0)
            } else {
                round_count(&block.children)
            }
        })
        .max()
        .unwrap_or(0);
    1 + deeper
}
