//! Identifiers handed out by the remote workspace.
//!
//! The remote treats pages as blocks, so a [`PageId`] converts into a
//! [`BlockId`] whenever a page is used as the parent of an append.

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::fmt;

macro_rules! remote_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        #[repr(transparent)]
        pub struct $name(SmolStr);

        impl $name {
            pub fn new(id: impl AsRef<str>) -> Self {
                Self(SmolStr::new(id.as_ref()))
            }

            pub fn as_str(&self) -> &str {
                self.0.as_str()
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self::new(id)
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(SmolStr::from(id))
            }
        }
    };
}

remote_id!(
    /// Remote id of a single block.
    BlockId
);
remote_id!(
    /// Remote id of a page.
    PageId
);
remote_id!(
    /// Remote id of a database (a page parent holding rows).
    DatabaseId
);
remote_id!(
    /// Remote id of a file-upload session.
    UploadId
);

impl From<PageId> for BlockId {
    fn from(page: PageId) -> Self {
        BlockId(page.0)
    }
}

impl From<&PageId> for BlockId {
    fn from(page: &PageId) -> Self {
        BlockId(page.0.clone())
    }
}
