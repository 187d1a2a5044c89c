//! Hierarchical key encoding for write-sets.
//!
//! Every transaction carries the set of keys it touched as a trie of *key
//! parts*: non-leaf parts are branches recorded at the weakest strength, only
//! the leaf carries the operation's strength. The writer deduplicates parts
//! against everything appended so far and ascends to the common ancestor with
//! the previous key so that only new suffix parts are emitted.
//!
//! The serialized form is content-addressed: two nodes decoding the same
//! bytes must derive identical fingerprints, so the fingerprint is computed
//! on the writer and carried verbatim on the wire.

pub mod part;
pub mod reader;
pub mod writer;

pub use part::{KeyFingerprint, KeyPartView, KeySetVersion, ANNOTATION_ALIGNMENT};
pub use reader::KeySetIn;
pub use writer::{AppendOutcome, KeyData, KeySetOut};

/// Number of bytes in the key-section header emitted by
/// [`KeySetOut::gather`] and expected by [`KeySetIn::init`].
pub const SECTION_HEADER_SIZE: usize = 8;
