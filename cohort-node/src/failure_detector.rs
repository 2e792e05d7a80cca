//! Heartbeat based liveness tracking.
//!
//! The detector only ever produces *suggestions*: a suspected member is still
//! part of the agreed configuration until the membership protocol agrees on
//! its failure.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use smallvec::SmallVec;
use tokio::time::Instant;

use crate::MemberId;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
/// A change in the local view of a member's liveness.
pub enum LivenessEvent {
    /// The member has missed its heartbeat deadline.
    Suspected(MemberId),
    /// A heartbeat arrived from a previously suspected member.
    Recovered(MemberId),
}

#[derive(Debug, Copy, Clone)]
struct Liveness {
    last_heartbeat: Instant,
    suspected_since: Option<Instant>,
    connection_lost: bool,
}

#[derive(Debug)]
/// Tracks the last heartbeat of each member against a timeout window.
///
/// All comparisons use the monotonic clock so wall-clock adjustments
/// never produce false suspicions.
pub struct FailureDetector {
    timeout: Duration,
    members: BTreeMap<MemberId, Liveness>,
}

impl FailureDetector {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            members: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Starts tracking a member, treating `now` as its first heartbeat.
    ///
    /// Tracking an already tracked member is a no-op.
    pub fn track(&mut self, member: MemberId, now: Instant) {
        self.members.entry(member).or_insert(Liveness {
            last_heartbeat: now,
            suspected_since: None,
            connection_lost: false,
        });
    }

    /// Stops tracking a member, e.g. once it has been removed from the cluster.
    pub fn untrack(&mut self, member: MemberId) {
        self.members.remove(&member);
    }

    #[inline]
    pub fn is_tracked(&self, member: MemberId) -> bool {
        self.members.contains_key(&member)
    }

    /// Records a heartbeat from the given member.
    ///
    /// Returns a recovery event if the member was suspected.
    pub fn heartbeat(&mut self, member: MemberId, now: Instant) -> Option<LivenessEvent> {
        let liveness = self.members.entry(member).or_insert(Liveness {
            last_heartbeat: now,
            suspected_since: None,
            connection_lost: false,
        });

        liveness.last_heartbeat = now;
        liveness.connection_lost = false;
        liveness
            .suspected_since
            .take()
            .map(|_| LivenessEvent::Recovered(member))
    }

    /// Marks the member as unreachable until its next heartbeat.
    ///
    /// Returns a suspicion event if this starts a new failure episode.
    pub fn connection_lost(
        &mut self,
        member: MemberId,
        now: Instant,
    ) -> Option<LivenessEvent> {
        let liveness = self.members.get_mut(&member)?;
        liveness.connection_lost = true;

        if liveness.suspected_since.is_none() {
            liveness.suspected_since = Some(now);
            Some(LivenessEvent::Suspected(member))
        } else {
            None
        }
    }

    /// Checks every tracked member against the timeout.
    ///
    /// A suspicion event is produced exactly once per failure episode, repeated
    /// checks while a member stays down produce nothing.
    pub fn check(&mut self, now: Instant) -> SmallVec<[LivenessEvent; 4]> {
        let mut events = SmallVec::new();
        let timeout = self.timeout;

        for (member, liveness) in self.members.iter_mut() {
            if liveness.suspected_since.is_some() {
                continue;
            }

            if !is_alive(liveness, timeout, now) {
                liveness.suspected_since = Some(now);
                events.push(LivenessEvent::Suspected(*member));
            }
        }

        events
    }

    /// Returns if a heartbeat was received from the member within the timeout window.
    ///
    /// Untracked members are never considered alive.
    pub fn is_alive(&self, member: MemberId, now: Instant) -> bool {
        self.members
            .get(&member)
            .map(|liveness| is_alive(liveness, self.timeout, now))
            .unwrap_or(false)
    }

    /// Returns if the member is in an ongoing failure episode.
    pub fn is_suspected(&self, member: MemberId) -> bool {
        self.suspected_since(member).is_some()
    }

    /// The time the member's ongoing failure episode started.
    pub fn suspected_since(&self, member: MemberId) -> Option<Instant> {
        self.members
            .get(&member)
            .and_then(|liveness| liveness.suspected_since)
    }

    /// The members whose last heartbeat exceeds the timeout.
    pub fn suspected_members(&self, now: Instant) -> BTreeSet<MemberId> {
        self.members
            .iter()
            .filter(|(_, liveness)| !is_alive(liveness, self.timeout, now))
            .map(|(member, _)| *member)
            .collect()
    }
}

fn is_alive(liveness: &Liveness, timeout: Duration, now: Instant) -> bool {
    !liveness.connection_lost
        && now.saturating_duration_since(liveness.last_heartbeat) < timeout
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[test]
    fn test_heartbeat_keeps_member_alive() {
        let start = Instant::now();
        let mut detector = FailureDetector::new(TIMEOUT);
        let member = MemberId::new(1);

        assert!(!detector.is_alive(member, start), "Untracked members are not alive.");

        detector.track(member, start);
        assert!(detector.is_alive(member, start));
        assert!(detector.is_alive(member, start + Duration::from_millis(999)));
        assert!(!detector.is_alive(member, start + TIMEOUT));

        assert!(detector.heartbeat(member, start + TIMEOUT).is_none());
        assert!(detector.is_alive(member, start + TIMEOUT));
    }

    #[test]
    fn test_single_suspicion_per_episode() {
        let start = Instant::now();
        let mut detector = FailureDetector::new(TIMEOUT);
        let member = MemberId::new(1);
        detector.track(member, start);

        assert!(detector.check(start + Duration::from_millis(500)).is_empty());

        let events = detector.check(start + Duration::from_secs(2));
        assert_eq!(events.as_slice(), &[LivenessEvent::Suspected(member)]);

        // Still down, no event storm.
        assert!(detector.check(start + Duration::from_secs(3)).is_empty());
        assert!(detector.check(start + Duration::from_secs(4)).is_empty());
        assert_eq!(
            detector.suspected_since(member),
            Some(start + Duration::from_secs(2))
        );

        // Recovery is reported exactly once.
        let recovered = detector.heartbeat(member, start + Duration::from_secs(5));
        assert_eq!(recovered, Some(LivenessEvent::Recovered(member)));
        assert!(detector
            .heartbeat(member, start + Duration::from_millis(5100))
            .is_none());
        assert!(!detector.is_suspected(member));

        // A second episode produces a new event.
        let events = detector.check(start + Duration::from_secs(7));
        assert_eq!(events.as_slice(), &[LivenessEvent::Suspected(member)]);
    }

    #[test]
    fn test_suspected_members() {
        let start = Instant::now();
        let mut detector = FailureDetector::new(TIMEOUT);
        detector.track(MemberId::new(1), start);
        detector.track(MemberId::new(2), start);
        detector.track(MemberId::new(3), start);

        let later = start + Duration::from_millis(1500);
        detector.heartbeat(MemberId::new(2), start + Duration::from_millis(1000));

        let suspected = detector.suspected_members(later);
        assert_eq!(
            suspected,
            BTreeSet::from_iter([MemberId::new(1), MemberId::new(3)])
        );
    }

    #[test]
    fn test_connection_lost_expires_member() {
        let start = Instant::now();
        let mut detector = FailureDetector::new(TIMEOUT);
        let member = MemberId::new(4);
        detector.track(member, start);

        let event = detector.connection_lost(member, start);
        assert_eq!(event, Some(LivenessEvent::Suspected(member)));
        assert!(!detector.is_alive(member, start));
        assert!(detector.connection_lost(member, start).is_none());
        assert!(detector.check(start).is_empty());

        // Unknown members are ignored.
        assert!(detector.connection_lost(MemberId::new(9), start).is_none());

        assert_eq!(
            detector.heartbeat(member, start + Duration::from_millis(10)),
            Some(LivenessEvent::Recovered(member))
        );
        assert!(detector.is_alive(member, start + Duration::from_millis(10)));
    }

    #[test]
    fn test_untrack() {
        let start = Instant::now();
        let mut detector = FailureDetector::new(TIMEOUT);
        let member = MemberId::new(1);
        detector.track(member, start);
        detector.untrack(member);

        assert!(!detector.is_tracked(member));
        assert!(detector.check(start + Duration::from_secs(5)).is_empty());
    }
}
