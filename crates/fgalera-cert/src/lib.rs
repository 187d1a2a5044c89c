//! Deterministic write-set certification.
//!
//! For every delivered write-set the engine computes a pass/fail verdict
//! and the seqno of the latest write-set it must wait for before applying,
//! using an in-memory index of the keys referenced by previously delivered
//! write-sets within the sliding trail. The computation depends only on the
//! write-set bytes and the index state, so every node reaches the same
//! verdict for the same delivery order.

pub mod engine;
pub mod index;
pub mod nbo;

pub use engine::{CertOutcome, Certification, TestResult};
pub use nbo::NboKey;
