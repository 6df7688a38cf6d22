use pagesync_common::PageId;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    CreatePage,
    UpdatePage,
    Create,
    Update,
    Delete,
    Reorder,
    Upload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum OpOutcome {
    Applied,
    Failed(String),
}

/// One remote operation as it happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpRecord {
    pub kind: OpKind,
    /// Block id, structural path or file path the operation was about.
    pub subject: String,
    #[serde(flatten)]
    pub outcome: OpOutcome,
}

/// What a sync run did to the remote page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub page_id: Option<PageId>,
    pub page_created: bool,
    /// Top-level subtrees created, each counted once.
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Blocks moved by delete-and-recreate.
    pub moved: usize,
    pub uploaded: usize,
    /// Local blocks that matched remote ones and needed nothing.
    pub unchanged: usize,
    pub operations: Vec<OpRecord>,
}

impl SyncReport {
    pub fn applied(&mut self, kind: OpKind, subject: impl Into<String>) {
        match kind {
            OpKind::Create => self.created += 1,
            OpKind::Update => self.updated += 1,
            OpKind::Delete => self.deleted += 1,
            OpKind::Reorder => self.moved += 1,
            OpKind::Upload => self.uploaded += 1,
            OpKind::CreatePage => self.page_created = true,
            OpKind::UpdatePage => {}
        }
        self.operations.push(OpRecord {
            kind,
            subject: subject.into(),
            outcome: OpOutcome::Applied,
        });
    }

    pub fn failed(&mut self, kind: OpKind, subject: impl Into<String>, reason: impl ToString) {
        self.operations.push(OpRecord {
            kind,
            subject: subject.into(),
            outcome: OpOutcome::Failed(reason.to_string()),
        });
    }

    /// Failed operations with their reasons.
    pub fn errors(&self) -> impl Iterator<Item = (&OpRecord, &str)> {
        self.operations.iter().filter_map(|op| match &op.outcome {
            OpOutcome::Failed(reason) => Some((op, reason.as_str())),
            OpOutcome::Applied => None,
        })
    }

    /// Whether the run changed any block.
    pub fn changed_blocks(&self) -> bool {
        self.created + self.updated + self.deleted + self.moved > 0
    }
}
