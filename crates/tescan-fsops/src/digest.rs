//! Streaming SHA1 content identifier.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::{FsOpsError, FsOpsResult};

/// Read size used while hashing; memory use stays constant regardless of file size.
pub const DIGEST_BLOCK_SIZE: usize = 1024;

/// Lower-case hex SHA1 digest of a file's content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Sha1Digest(String);

impl Sha1Digest {
    /// Hash an in-memory buffer.
    #[must_use]
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(format!("{:x}", Sha1::digest(bytes)))
    }

    /// Parse a 40-character hex digest.
    ///
    /// # Errors
    ///
    /// Returns [`FsOpsError::InvalidInput`] for anything that is not 40 hex digits.
    pub fn parse(value: &str) -> FsOpsResult<Self> {
        let trimmed = value.trim();
        if trimmed.len() != 40 || !trimmed.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(FsOpsError::InvalidInput {
                field: "sha1",
                reason: "must be 40 hex digits",
                value: Some(value.to_string()),
            });
        }
        Ok(Self(trimmed.to_ascii_lowercase()))
    }

    /// Full hex representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight hex digits, used as a collision disambiguator.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..8]
    }
}

impl TryFrom<String> for Sha1Digest {
    type Error = FsOpsError;

    fn try_from(value: String) -> FsOpsResult<Self> {
        Self::parse(&value)
    }
}

impl From<Sha1Digest> for String {
    fn from(digest: Sha1Digest) -> Self {
        digest.0
    }
}

impl fmt::Display for Sha1Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compute the SHA1 digest of the file at `path`, reading it in
/// [`DIGEST_BLOCK_SIZE`] blocks.
///
/// # Errors
///
/// Returns [`FsOpsError::Io`] (`digest.open` / `digest.read`) when the file is
/// missing, locked, or unreadable.
pub fn content_digest(path: &Path) -> FsOpsResult<Sha1Digest> {
    let mut file = File::open(path).map_err(|source| FsOpsError::io("digest.open", path, source))?;
    let mut hasher = Sha1::new();
    let mut block = [0_u8; DIGEST_BLOCK_SIZE];
    loop {
        match file.read(&mut block) {
            Ok(0) => break,
            Ok(read) => hasher.update(&block[..read]),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(source) => return Err(FsOpsError::io("digest.read", path, source)),
        }
    }
    Ok(Sha1Digest(format!("{:x}", hasher.finalize())))
}
