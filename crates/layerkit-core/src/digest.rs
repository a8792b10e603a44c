//! Content digests.
//!
//! Every cache decision in layerkit is made on content, never on file
//! timestamps, so this is the one hashing primitive the other crates share.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;
use std::path::Path;

/// A SHA-256 digest, stored as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentDigest(String);

impl ContentDigest {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    /// Digest a file's contents without loading it into memory at once.
    pub fn of_file(path: &Path) -> std::io::Result<Self> {
        let mut file = std::fs::File::open(path)?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self(hex::encode(hasher.finalize())))
    }

    /// Start a digest over several labelled parts.
    pub fn builder() -> DigestBuilder {
        DigestBuilder {
            hasher: Sha256::new(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First twelve hex characters, for display.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }

    /// Parse a digest from its hex form.
    pub fn from_hex(s: &str) -> Option<Self> {
        let valid = s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        valid.then(|| Self(s.to_string()))
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Incremental digest over labelled, length-prefixed parts.
///
/// Each part is framed as `label \0 len \0 bytes`, so moving bytes from one
/// part to the next always changes the result.
pub struct DigestBuilder {
    hasher: Sha256,
}

impl DigestBuilder {
    pub fn part(mut self, label: &str, bytes: &[u8]) -> Self {
        self.hasher.update(label.as_bytes());
        self.hasher.update([0]);
        self.hasher.update((bytes.len() as u64).to_le_bytes());
        self.hasher.update([0]);
        self.hasher.update(bytes);
        self
    }

    pub fn finish(self) -> ContentDigest {
        ContentDigest(hex::encode(self.hasher.finalize()))
    }
}
