//! # Cohort Context
//!
//! The causal ordering contract used by master-slave transaction replication.
//!
//! Every write forwarded to the leader carries a [RequestContext], the tuple of
//! `(session, machine, event, last applied tx, checksum)`. The leader uses it to
//! tell apart a fresh request, a retry of something it has already applied and a
//! request built on an outdated view of the session's own progress.
//!
//! ### Basic Example
//! ```rust
//! use cohort_context::{Admission, ContextTracker, SessionRegistry};
//!
//! let tracker = ContextTracker::new(1, 1);
//! let mut registry = SessionRegistry::default();
//!
//! let ctx = tracker.new_context();
//! assert_eq!(registry.admit(&ctx), Admission::Fresh);
//!
//! // The leader applies the write as tx 1 and remembers the outcome.
//! registry.record(&ctx, 1, 0);
//! tracker.observe(1, 0);
//!
//! // Retrying the same context does not apply it a second time.
//! assert!(matches!(registry.admit(&ctx), Admission::Duplicate { tx_id: 1, .. }));
//! ```

mod context;
mod session;
mod tracker;

pub use context::{Freshness, InvalidContext, RequestContext, SessionKey, TxId};
pub use session::{Admission, SessionRegistry, DEFAULT_MAX_SESSIONS, DEFAULT_OUTCOME_WINDOW};
pub use tracker::{ContextTracker, TrackerInner};
