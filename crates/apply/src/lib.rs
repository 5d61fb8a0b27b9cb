//! kapply apply: the per-kind reconcile protocol and the batch synchronizer.

#![forbid(unsafe_code)]

pub mod memory;
pub mod reconcile;
pub mod sync;

pub use memory::MemoryCluster;
pub use reconcile::{reconcile, ReconcileOptions};
pub use sync::{SyncOptions, Synchronizer};
