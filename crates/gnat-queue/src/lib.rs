//! Per-destination backpressure queues.
//!
//! One [`BinQueueMgr`] manages the queues for exactly one local
//! destination-index: a physical queue partitioned by latency class, a
//! zombie sub-queue for expired-but-still-counted backlog, and a virtual
//! queue overlay used to steer low-volume flows.

pub mod bin_queue;
pub mod node_record;

pub use bin_queue::{
    BinQueueMgr, DequeueOutcome, DropPolicy, EfOrderPolicy, LatencyClass, Order, Packet,
    ALL_CLASSES_MASK, TTG_UNSET,
};
pub use node_record::{NodeRecord, NodeRecordTable};
