//! Replication
//!
//! - Pairs: primary/secondary associations and their failover state
//! - Coordinator: failover, failback and fault recovery

pub mod coordinator;
pub mod pairs;

pub use coordinator::{FailoverCoordinator, FailoverOutcome, PairReport};
pub use pairs::{PairEntry, PairState, ReplicationTable};
