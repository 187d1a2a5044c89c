//! Ordering barriers for the replication pipeline.
//!
//! Three monitors with identical mechanics and different admission
//! predicates serialize/parallelize the applier phases:
//!
//! * the **local** monitor admits strictly in seqno order and pipelines
//!   (the next seqno may enter as soon as the previous one has entered);
//! * the **apply** monitor admits a write-set once everything it depends
//!   on has left, so disjoint transactions apply in parallel;
//! * the **commit** monitor admits strictly after the previous seqno has
//!   left, making commits truly serial.
//!
//! Waiters are indexed by seqno and woken individually; a `leave` never
//! broadcasts to the whole queue.

pub mod monitor;
pub mod waiter;

pub use monitor::{
    ApplyOrder, CommitOrder, LocalOrder, MonitorPolicy, OrderedMonitor,
};
pub use waiter::{WriteSetWaiter, WriteSetWaiters};
