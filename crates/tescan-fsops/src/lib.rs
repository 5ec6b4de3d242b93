#![forbid(unsafe_code)]
#![warn(
    unused,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    rustdoc::broken_intra_doc_links,
    missing_docs
)]
#![allow(clippy::module_name_repetitions)]

//! Filesystem primitives for the scanner: content digests, resilient
//! transfers, input-tree discovery, and empty-directory cleanup.
//!
//! Layout: `digest.rs` (streaming SHA1), `plan.rs` (path classification and
//! transfer planning), `transfer.rs` (`TransferEngine`), `tree.rs` (discovery
//! and cleanup).

pub mod digest;
pub mod error;
pub mod plan;
pub mod transfer;
pub mod tree;

pub use digest::{DIGEST_BLOCK_SIZE, Sha1Digest, content_digest};
pub use error::{FsOpsError, FsOpsResult};
pub use plan::{ChecksumPolicy, PathKind, TransferPlan, classify_path, probe_path};
pub use transfer::{
    ByteCopier, FsCopier, TransferEngine, TransferMethod, TransferOutcome, resolve_collision,
};
pub use tree::{DiscoveredFile, FileKind, discover, file_kind, remove_empty_dirs};
