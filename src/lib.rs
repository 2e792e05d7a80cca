//! # Cohort
//! The coordination core of a clustered graph database.
//!
//! This is a convenience package which includes all of the sub-projects within
//! Cohort, realistically you probably only want some of these projects:
//!
//! ### Features
//! - `cohort_node` - Failure detection, agreed cluster membership, role election and topology.
//! - `cohort_context` - Causal request contexts for ordering and de-duplicating writes.
//! - `cohort_replication` - Forwards transactions to the elected leader and applies them there.

#[cfg(feature = "cohort-context")]
pub use cohort_context as context;
#[cfg(feature = "cohort-node")]
pub use cohort_node as node;
#[cfg(feature = "cohort-replication")]
pub use cohort_replication as replication;
