use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::{Freshness, RequestContext, TxId};

#[derive(Debug, Clone)]
/// Allocates request contexts for a single session.
///
/// The tracker is cheap to clone, all clones share the same event counter
/// and observed transaction position.
pub struct ContextTracker(Arc<TrackerInner>);

impl Deref for ContextTracker {
    type Target = TrackerInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug)]
pub struct TrackerInner {
    session_id: u64,
    machine_id: u64,
    next_event: AtomicU64,
    observed: Mutex<Observed>,
}

#[derive(Debug, Default, Copy, Clone)]
struct Observed {
    tx_id: TxId,
    checksum: u64,
}

impl ContextTracker {
    /// Creates a new tracker for the given session on the given machine.
    pub fn new(session_id: u64, machine_id: u64) -> Self {
        Self::starting_from(session_id, machine_id, 0, 0)
    }

    /// Creates a new tracker which has already observed the given transaction.
    pub fn starting_from(
        session_id: u64,
        machine_id: u64,
        last_applied_tx_id: TxId,
        checksum: u64,
    ) -> Self {
        Self(Arc::new(TrackerInner {
            session_id,
            machine_id,
            next_event: AtomicU64::new(1),
            observed: Mutex::new(Observed {
                tx_id: last_applied_tx_id,
                checksum,
            }),
        }))
    }
}

impl TrackerInner {
    #[inline]
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    #[inline]
    pub fn machine_id(&self) -> u64 {
        self.machine_id
    }

    /// Allocates a new context using the next event identifier.
    pub fn new_context(&self) -> RequestContext {
        let event = self.next_event.fetch_add(1, Ordering::Relaxed);
        self.context_for_event(event)
    }

    /// Builds a context for an explicit event identifier.
    ///
    /// The tracker's counter is moved past `event` so later contexts
    /// never reuse it.
    pub fn context_for_event(&self, event: u64) -> RequestContext {
        self.next_event
            .fetch_max(event.saturating_add(1), Ordering::Relaxed);

        let observed = *self.observed.lock();
        RequestContext::new(
            self.session_id,
            self.machine_id,
            event,
            observed.tx_id,
            observed.checksum,
        )
    }

    /// Records that the session has observed the given transaction.
    ///
    /// Older positions are ignored, the observed position never moves backwards.
    pub fn observe(&self, tx_id: TxId, checksum: u64) {
        let mut observed = self.observed.lock();
        if tx_id >= observed.tx_id {
            *observed = Observed { tx_id, checksum };
        }
    }

    /// The most recently observed transaction id.
    pub fn last_observed(&self) -> TxId {
        self.observed.lock().tx_id
    }

    /// Validates a context against the transaction the target operation requires.
    pub fn validate(&self, context: &RequestContext, required_tx_id: TxId) -> Freshness {
        context.validate(required_tx_id)
    }
}
