//! Transaction intake: the bounded priority queue (C2) that sits between
//! the ingress API and the Spend Controller's worker pool.

pub mod queue;

pub use queue::{IntakeQueue, QueuedTransaction};
