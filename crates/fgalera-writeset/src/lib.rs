//! Write-set serialization container and fragment reassembly.
//!
//! A write-set is the durable artifact of one replicated transaction:
//! header, key section, opaque data section, optional annotation, CRC
//! trailer. The serialized form is content-addressed — every node that
//! delivers the same bytes derives the same certification inputs.

pub mod container;
pub mod defrag;

pub use container::{GatherVec, WriteSetIn, WriteSetOut, HEADER_SIZE, MAGIC};
pub use defrag::{Defrag, FragOutcome, Fragment};
