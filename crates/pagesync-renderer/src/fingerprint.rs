//! Content fingerprints for blocks.
//!
//! A fingerprint is blake3 over a tagged, length-prefixed byte stream of the
//! block's kind, its canonical payload and the fingerprints of its children.
//! Everything hashed is in canonical form (see [`canonical_runs`]), so a block
//! and the same block read back from the remote hash identically.
//!
//! Each block has two digests: `own` covers the block itself and decides
//! whether an in-place update is needed, `fingerprint` covers the whole
//! subtree and is the cross-build identity.

use crate::block::{Block, BlockKind, InlineRun, MediaReference, TableRow, canonical_language};
use crate::richtext::canonical_runs;
use pagesync_common::Fingerprint;

const DOMAIN: &str = "pagesync block fingerprint v1";

struct FingerprintHasher(blake3::Hasher);

impl FingerprintHasher {
    fn new(section: u8) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(DOMAIN.as_bytes());
        hasher.update(&[section]);
        Self(hasher)
    }

    fn tag(&mut self, tag: u8) {
        self.0.update(&[tag]);
    }

    fn bytes(&mut self, bytes: &[u8]) {
        self.0.update(&(bytes.len() as u64).to_le_bytes());
        self.0.update(bytes);
    }

    fn str(&mut self, s: &str) {
        self.bytes(s.as_bytes());
    }

    fn bool(&mut self, b: bool) {
        self.tag(b as u8);
    }

    fn u64(&mut self, n: u64) {
        self.0.update(&n.to_le_bytes());
    }

    fn opt_str(&mut self, s: Option<&str>) {
        match s {
            Some(s) => {
                self.tag(1);
                self.str(s);
            }
            None => self.tag(0),
        }
    }

    fn fingerprint(&mut self, fp: &Fingerprint) {
        self.0.update(fp.as_bytes());
    }

    fn runs(&mut self, runs: &[InlineRun]) {
        let canonical = canonical_runs(runs);
        self.u64(canonical.len() as u64);
        for run in &canonical {
            match run {
                InlineRun::Text {
                    text,
                    annotations,
                    link,
                } => {
                    self.tag(0);
                    self.str(text);
                    self.bool(annotations.bold);
                    self.bool(annotations.italic);
                    self.bool(annotations.strikethrough);
                    self.bool(annotations.underline);
                    self.bool(annotations.code);
                    self.str(&annotations.remote_color());
                    self.opt_str(link.as_deref());
                }
                InlineRun::Equation { expression } => {
                    self.tag(1);
                    self.str(expression);
                }
            }
        }
    }

    fn finish(self) -> Fingerprint {
        Fingerprint::from(self.0.finalize())
    }
}

/// Digest of a block's own content, ignoring its children.
///
/// `nested` says whether the block holds nested blocks; only headings carry
/// that in their payload (a heading needs to be toggleable to have children).
pub fn own_fingerprint(kind: &BlockKind, runs: &[InlineRun], nested: bool) -> Fingerprint {
    let mut h = FingerprintHasher::new(0);
    h.str(crate::wire::block_type(kind));
    match kind {
        BlockKind::Paragraph
        | BlockKind::BulletedItem
        | BlockKind::NumberedItem
        | BlockKind::Quote
        | BlockKind::Toggle
        | BlockKind::Divider
        | BlockKind::TableOfContents => {}
        BlockKind::Heading { level } => {
            h.u64(u64::from(*level));
            h.bool(nested);
        }
        BlockKind::ToDo { checked } => h.bool(*checked),
        BlockKind::Callout { icon, color } => {
            h.opt_str(icon.as_deref());
            h.str(color.as_str());
        }
        BlockKind::Code { language, caption } => {
            h.str(canonical_language(language));
            h.runs(caption);
        }
        BlockKind::Table {
            rows,
            header_rows,
            stub_columns,
        } => {
            let (width, rows) = canonical_table(rows);
            h.u64(width as u64);
            h.bool(*header_rows > 0);
            h.bool(*stub_columns > 0);
            h.u64(rows.len() as u64);
            for row in &rows {
                for cell in row {
                    h.runs(cell);
                }
            }
        }
        BlockKind::Media { media, source } => {
            h.str(media.as_str());
            match source {
                MediaReference::External { url } => {
                    h.tag(0);
                    h.str(url);
                }
                MediaReference::Local {
                    digest: Some(digest),
                    ..
                }
                | MediaReference::Uploaded {
                    digest: Some(digest),
                    ..
                } => {
                    h.tag(1);
                    h.fingerprint(digest);
                }
                MediaReference::Local { path, digest: None } => {
                    h.tag(2);
                    h.str(&path.to_string_lossy());
                }
                MediaReference::Uploaded {
                    upload_id,
                    digest: None,
                } => {
                    h.tag(3);
                    h.str(upload_id.as_str());
                }
                MediaReference::Hosted { url } => {
                    h.tag(4);
                    h.str(url);
                }
            }
        }
        BlockKind::Equation { latex } => h.str(latex),
        BlockKind::Embed { url } => h.str(url),
    }
    if kind.has_text() {
        h.runs(runs);
    }
    h.finish()
}

/// Subtree digest from a block's own digest and its children's.
pub fn combine(own: &Fingerprint, children: &[Fingerprint]) -> Fingerprint {
    let mut h = FingerprintHasher::new(1);
    h.fingerprint(own);
    h.u64(children.len() as u64);
    for child in children {
        h.fingerprint(child);
    }
    h.finish()
}

/// Subtree digest for a node whose children are already fingerprinted.
pub fn fingerprint_node(kind: &BlockKind, runs: &[InlineRun], children: &[Fingerprint]) -> Fingerprint {
    combine(&own_fingerprint(kind, runs, !children.is_empty()), children)
}

/// Subtree digest of `block`.
pub fn fingerprint(block: &Block) -> Fingerprint {
    FingerprintedBlock::build(block).fingerprint
}

/// Table rows padded to a common width.
pub fn canonical_table(rows: &[TableRow]) -> (usize, Vec<Vec<Vec<InlineRun>>>) {
    let width = rows.iter().map(|row| row.cells.len()).max().unwrap_or(0);
    let rows = rows
        .iter()
        .map(|row| {
            let mut cells = row.cells.clone();
            cells.resize_with(width, Vec::new);
            cells
        })
        .collect();
    (width, rows)
}

/// A block with its digests, mirroring the block's shape.
#[derive(Debug, Clone)]
pub struct FingerprintedBlock<'a> {
    pub block: &'a Block,
    pub own: Fingerprint,
    pub fingerprint: Fingerprint,
    pub children: Vec<FingerprintedBlock<'a>>,
}

impl<'a> FingerprintedBlock<'a> {
    pub fn build(block: &'a Block) -> Self {
        let children: Vec<_> = block.children.iter().map(Self::build).collect();
        let child_fps: Vec<_> = children.iter().map(|c| c.fingerprint).collect();
        let own = own_fingerprint(&block.kind, &block.runs, !children.is_empty());
        Self {
            block,
            own,
            fingerprint: combine(&own, &child_fps),
            children,
        }
    }

    pub fn forest(blocks: &'a [Block]) -> Vec<Self> {
        blocks.iter().map(Self::build).collect()
    }
}
