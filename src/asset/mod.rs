//! Asset tree model
//!
//! The managed tree is an arena of [`AssetEntry`] values addressed by
//! [`AssetId`]. Source entries mirror the source directory; derived entries
//! are produced by pipes and hang off their source entry, grouped by the pipe
//! that created them. Parent links are ids, so the tree carries no ownership
//! cycles.

pub mod entry;
pub mod tree;

pub use entry::*;
pub use tree::*;

use sha2::{Digest, Sha256};

/// Hash raw content. Depends only on the bytes, never on the path.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}
