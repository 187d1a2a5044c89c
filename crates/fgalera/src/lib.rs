//! Certification-based multi-primary replication core.
//!
//! This crate assembles the pieces — buffer cache, key model, write-set
//! container, certification engine, ordering monitors — into the pipeline
//! a database service drives: replicate, certify, apply in parallel where
//! dependencies allow, commit in total order.
//!
//! The group transport stays behind the [`Transport`] trait; the bundled
//! [`LoopbackTransport`] closes the loop in-process.

pub mod replicator;
pub mod service;
pub mod transport;

pub use replicator::{OrderedTrx, Replicator, ReplicatorConfig, TrxHandle};
pub use service::ServiceThread;
pub use transport::{LoopbackTransport, Transport};

pub use fgalera_cert::{CertOutcome, TestResult};
pub use fgalera_error::{GaleraError, Result, ResultCode};
pub use fgalera_types::{
    ConnId, KeyStrength, NodeId, Params, Seqno, TrxId, WsFlags,
};
