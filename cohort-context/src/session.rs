use std::collections::{BTreeMap, HashMap};

use crate::context::{Freshness, RequestContext, SessionKey, TxId};

/// The number of applied events remembered per session for de-duplication.
pub const DEFAULT_OUTCOME_WINDOW: usize = 128;
/// The number of sessions remembered before the least recently used is evicted.
pub const DEFAULT_MAX_SESSIONS: usize = 10_000;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
/// Whether the leader should apply a request carrying a given context.
pub enum Admission {
    /// The request is new and the caller's view of its session is current.
    Fresh,
    /// The event has already been applied, the original outcome is returned
    /// instead of applying it again.
    Duplicate { tx_id: TxId, checksum: u64 },
    /// The session's own writes have advanced past what the caller observed.
    Stale { observed: TxId, required: TxId },
    /// The event is older than the latest event applied for the session and
    /// was never applied itself.
    OutOfOrder { event: u64, latest_event: u64 },
}

#[derive(Debug, Default)]
struct SessionState {
    last_committed_tx: TxId,
    last_event: u64,
    outcomes: BTreeMap<u64, (TxId, u64)>,
    last_touched: u64,
}

/// Leader side bookkeeping of the sessions that have committed through it.
///
/// Staleness is only ever judged against the session's own prior writes,
/// writes from other sessions advancing the log never make a context stale.
///
/// At most `max_sessions` sessions are remembered, recording a write for a
/// new session beyond that evicts the least recently written one. An evicted
/// session is treated like an unknown one, so a retry arriving after its
/// eviction is no longer recognised as a duplicate.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: HashMap<SessionKey, SessionState>,
    /// Sessions ordered by the sequence number of their last write.
    recency: BTreeMap<u64, SessionKey>,
    sequence: u64,
    window: usize,
    max_sessions: usize,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::with_limits(DEFAULT_OUTCOME_WINDOW, DEFAULT_MAX_SESSIONS)
    }
}

impl SessionRegistry {
    /// Creates a registry remembering up to `window` outcomes per session.
    pub fn with_window(window: usize) -> Self {
        Self::with_limits(window, DEFAULT_MAX_SESSIONS)
    }

    /// Creates a registry remembering up to `window` outcomes per session
    /// for at most `max_sessions` sessions.
    pub fn with_limits(window: usize, max_sessions: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            recency: BTreeMap::new(),
            sequence: 0,
            window: window.max(1),
            max_sessions: max_sessions.max(1),
        }
    }

    #[inline]
    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Decides how a request with the given context should be handled.
    pub fn admit(&self, context: &RequestContext) -> Admission {
        let state = match self.sessions.get(&context.session_key()) {
            None => return Admission::Fresh,
            Some(state) => state,
        };

        let event = context.event_identifier();
        if let Some((tx_id, checksum)) = state.outcomes.get(&event) {
            return Admission::Duplicate {
                tx_id: *tx_id,
                checksum: *checksum,
            };
        }

        if event <= state.last_event {
            return Admission::OutOfOrder {
                event,
                latest_event: state.last_event,
            };
        }

        match context.validate(state.last_committed_tx) {
            Freshness::Fresh => Admission::Fresh,
            Freshness::Stale { observed, required } => {
                Admission::Stale { observed, required }
            },
        }
    }

    /// Records that the request with the given context was applied as `tx_id`.
    ///
    /// Returns the session evicted to make room for this one, if any.
    pub fn record(
        &mut self,
        context: &RequestContext,
        tx_id: TxId,
        checksum: u64,
    ) -> Option<SessionKey> {
        let key = context.session_key();
        self.sequence += 1;

        let state = self.sessions.entry(key).or_default();
        if state.last_touched != 0 {
            self.recency.remove(&state.last_touched);
        }
        state.last_touched = self.sequence;
        self.recency.insert(self.sequence, key);

        state.last_committed_tx = state.last_committed_tx.max(tx_id);
        state.last_event = state.last_event.max(context.event_identifier());
        state
            .outcomes
            .insert(context.event_identifier(), (tx_id, checksum));

        while state.outcomes.len() > self.window {
            let oldest = match state.outcomes.keys().next() {
                Some(event) => *event,
                None => break,
            };
            state.outcomes.remove(&oldest);
        }

        if self.sessions.len() <= self.max_sessions {
            return None;
        }

        let (_, evicted) = self.recency.pop_first()?;
        self.sessions.remove(&evicted);
        Some(evicted)
    }

    /// The last transaction committed on behalf of the given session.
    pub fn last_committed(&self, key: &SessionKey) -> Option<TxId> {
        self.sessions.get(key).map(|state| state.last_committed_tx)
    }

    /// Drops all state for a session, e.g. once the client has closed it.
    pub fn forget(&mut self, key: &SessionKey) {
        if let Some(state) = self.sessions.remove(key) {
            self.recency.remove(&state.last_touched);
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
