//! Content digests over canonicalized records.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use super::{Canonicalizer, FieldValue};
use crate::errors::{PhaseflowError, Result};

// Bumping this prefix invalidates every stored hash, so it only changes
// together with the canonical form.
const SCHEME: &str = "phaseflow/v1";

/// Hex-encoded SHA-256 digest of a canonicalized record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    /// Wraps an existing hex digest, validating its shape.
    pub fn from_hex(hex_digest: impl Into<String>) -> Result<Self> {
        let hex_digest = hex_digest.into().to_ascii_lowercase();
        if hex_digest.len() != 64 || !hex_digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(PhaseflowError::Serialization(format!(
                "'{hex_digest}' is not a SHA-256 hex digest"
            )));
        }
        Ok(Self(hex_digest))
    }

    /// The full hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 16 hex characters, for logs.
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..16).unwrap_or(&self.0)
    }
}

impl TryFrom<String> for ContentHash {
    type Error = PhaseflowError;

    fn try_from(value: String) -> Result<Self> {
        Self::from_hex(value)
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Computes content hashes with a fixed canonicalization policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContentHasher {
    canonicalizer: Canonicalizer,
}

impl ContentHasher {
    /// Creates a hasher using the given canonicalizer.
    #[must_use]
    pub fn new(canonicalizer: Canonicalizer) -> Self {
        Self { canonicalizer }
    }

    /// Creates a hasher keeping `digits` fractional digits for numbers.
    #[must_use]
    pub fn with_float_digits(digits: u32) -> Self {
        Self::new(Canonicalizer::new(digits))
    }

    /// Hashes a single record.
    pub fn compute(&self, record: &FieldValue) -> Result<ContentHash> {
        let canonical = self.canonicalizer.canonicalize(record)?;
        Ok(digest(&[SCHEME, "out", &canonical]))
    }

    /// Hashes an output together with the input it was computed from, so a
    /// changed input is detected even when the output is identical.
    pub fn compute_with_input(
        &self,
        input: Option<&FieldValue>,
        output: &FieldValue,
    ) -> Result<ContentHash> {
        let Some(input) = input else {
            return self.compute(output);
        };
        let canonical_in = self.canonicalizer.canonicalize(input)?;
        let canonical_out = self.canonicalizer.canonicalize(output)?;
        Ok(digest(&[SCHEME, "in", &canonical_in, "out", &canonical_out]))
    }
}

fn digest(parts: &[&str]) -> ContentHash {
    let mut hasher = Sha256::new();
    for part in parts {
        // Length-prefix each part so concatenations cannot collide.
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    ContentHash(hex::encode(hasher.finalize()))
}

/// Hashes a record with the default canonicalization policy.
pub fn compute_hash(record: &FieldValue) -> Result<ContentHash> {
    ContentHasher::default().compute(record)
}

/// Returns true if both digests are identical, meaning no write is needed.
#[must_use]
pub fn hashes_equal(a: &ContentHash, b: &ContentHash) -> bool {
    a == b
}
