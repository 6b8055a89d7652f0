//! Content hash engine.
//!
//! Re-running a computation over unchanged data must be a true no-op; the
//! digest computed here is what the output store compares before writing.

mod canonical;
mod digest;
mod value;

pub use canonical::{Canonicalizer, DEFAULT_FLOAT_DIGITS};
pub use digest::{compute_hash, hashes_equal, ContentHash, ContentHasher};
pub use value::{FieldValue, Record};
