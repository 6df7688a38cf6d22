//! The block model and everything that turns it into remote requests:
//! fingerprints, rich-text encoding, the wire codec and request shaping
//! under the nesting ceiling.

pub mod block;
pub mod fingerprint;
pub mod nesting;
pub mod richtext;
pub mod wire;

pub use block::{
    Annotations, Block, BlockKind, Color, Document, InlineRun, MediaKind, MediaReference,
    TableRow, path_key,
};
pub use fingerprint::{FingerprintedBlock, fingerprint, fingerprint_node};
pub use richtext::EncodingError;
pub use wire::InvalidBlock;
