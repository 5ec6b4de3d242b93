//! Wire-safe filename tokens.
//!
//! The appliance only ever sees the token; the original name stays here so
//! reports and relocations can use it.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::sync::Mutex;

use tescan_fsops::Sha1Digest;
use url::form_urlencoded::byte_serialize;

/// Maps original file names to ASCII tokens and back. Shared across workers.
#[derive(Debug, Default)]
pub struct FilenameRegistry {
    tokens: Mutex<HashMap<String, OsString>>,
}

impl FilenameRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for `name`, allocating one on first use.
    ///
    /// The same name always maps to the same token. Two names whose encoded
    /// forms collide get distinct tokens via a digest-derived suffix.
    pub fn token_for(&self, name: &OsStr) -> String {
        let base: String = byte_serialize(name.as_encoded_bytes()).collect();
        let mut tokens = self
            .tokens
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if claim(&mut tokens, &base, name) {
            return base;
        }
        let tag = Sha1Digest::of_bytes(name.as_encoded_bytes());
        let tagged = format!("{base}_{}", tag.short());
        if claim(&mut tokens, &tagged, name) {
            return tagged;
        }
        let mut counter = 1_u32;
        loop {
            let candidate = format!("{tagged}_{counter}");
            if claim(&mut tokens, &candidate, name) {
                return candidate;
            }
            counter += 1;
        }
    }

    /// Original name a token was issued for.
    #[must_use]
    pub fn original_name(&self, token: &str) -> Option<OsString> {
        self.tokens
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(token)
            .cloned()
    }

    /// Number of tokens issued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether no token has been issued yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn claim(tokens: &mut HashMap<String, OsString>, token: &str, name: &OsStr) -> bool {
    match tokens.get(token) {
        Some(existing) => existing == name,
        None => {
            tokens.insert(token.to_string(), name.to_os_string());
            true
        }
    }
}
