use std::collections::{BTreeSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::MembershipSettings;
use crate::failure_detector::{FailureDetector, LivenessEvent};
use crate::membership::configuration::diff_events;
use crate::membership::{
    ClusterConfiguration,
    ClusterEvent,
    ClusterMessage,
    ClusterOp,
    Proposal,
    RejectReason,
    Verdict,
};
use crate::{MemberId, MemberInfo, MemberStatus};

#[derive(Debug, Clone)]
/// An effect requested by the state machine.
///
/// The state machine never performs any IO itself, its owner is expected
/// to drain these after every input.
pub enum Output {
    /// Send a message to the member listening on `to`.
    Send {
        to: SocketAddr,
        message: ClusterMessage,
    },
    /// Deliver a notification to subscribers.
    Event(ClusterEvent),
}

#[derive(Debug)]
struct Round {
    proposal: Proposal,
    voters: BTreeSet<MemberId>,
    accepted: BTreeSet<MemberId>,
    rejected: BTreeSet<MemberId>,
    deadline: Instant,
    /// The size of the configuration the round was proposed against.
    num_members: usize,
    /// The lowest member of that configuration, which settles exact halves.
    tie_breaker: Option<MemberId>,
}

impl Round {
    fn quorum(&self) -> usize {
        self.voters.len() / 2 + 1
    }

    /// Whether `votes` are enough to decide the round.
    ///
    /// A majority of the voters is required. When that majority is exactly
    /// half of the configuration, which only happens when failing a member
    /// of an even sized cluster, it must include the tie breaker so two
    /// halves of a partition can never both remove each other.
    fn is_quorum<'a>(&self, votes: impl Iterator<Item = &'a MemberId>) -> bool {
        let mut count = 0;
        let mut has_tie_breaker = false;
        for voter in votes {
            count += 1;
            has_tie_breaker |= Some(*voter) == self.tie_breaker;
        }

        count >= self.quorum() && (count * 2 > self.num_members || has_tie_breaker)
    }

    fn is_decided(&self) -> bool {
        self.is_quorum(self.accepted.iter())
    }

    fn is_lost(&self) -> bool {
        !self.is_quorum(self.voters.difference(&self.rejected))
    }
}

#[derive(Debug, Copy, Clone)]
struct Promise {
    proposer: MemberId,
    slot: u64,
    round: u64,
    expires: Instant,
}

/// The membership protocol of a single member.
///
/// Every input (a message, a tick, a transport failure or a local command) is
/// applied synchronously and may queue [Output]s. Agreement works in slots:
/// the coordinator, the lowest member it does not suspect, proposes one
/// operation for configuration version `version + 1` and applies it once a
/// majority of the agreed configuration accepted it. The member a `Fail`
/// proposal removes is not a voter, every other member is, whether it is
/// suspected or not.
pub struct Membership {
    me: MemberId,
    info: MemberInfo,
    settings: MembershipSettings,
    status: MemberStatus,
    config: Arc<ClusterConfiguration>,
    detector: FailureDetector,
    contacts: BTreeSet<SocketAddr>,

    round: Option<Round>,
    round_counter: u64,
    queue: VecDeque<ClusterOp>,
    promise: Option<Promise>,
    backoff: Duration,
    next_proposal_at: Instant,

    next_request_at: Instant,
    join_rejected: bool,
    leaving: bool,
    last_heartbeat: Option<Instant>,
    abandoned_rounds: u64,

    outbox: Vec<Output>,
}

impl Membership {
    pub fn new(
        me: MemberId,
        info: MemberInfo,
        cluster_name: impl Into<String>,
        seeds: impl IntoIterator<Item = SocketAddr>,
        settings: MembershipSettings,
        now: Instant,
    ) -> Self {
        let contacts = seeds
            .into_iter()
            .filter(|seed| *seed != info.address)
            .collect();

        Self {
            me,
            info,
            detector: FailureDetector::new(settings.heartbeat_timeout),
            settings,
            status: MemberStatus::Joining,
            config: Arc::new(ClusterConfiguration::new(cluster_name)),
            contacts,
            round: None,
            round_counter: 0,
            queue: VecDeque::new(),
            promise: None,
            backoff: Duration::ZERO,
            next_proposal_at: now,
            next_request_at: now,
            join_rejected: false,
            leaving: false,
            last_heartbeat: None,
            abandoned_rounds: 0,
            outbox: Vec::new(),
        }
    }

    #[inline]
    pub fn me(&self) -> MemberId {
        self.me
    }

    #[inline]
    pub fn info(&self) -> &MemberInfo {
        &self.info
    }

    #[inline]
    /// The status of this member.
    pub fn status(&self) -> MemberStatus {
        self.status
    }

    #[inline]
    /// The latest configuration this member has adopted.
    pub fn configuration(&self) -> &Arc<ClusterConfiguration> {
        &self.config
    }

    #[inline]
    /// The number of agreement rounds which have been abandoned by this member.
    pub fn abandoned_rounds(&self) -> u64 {
        self.abandoned_rounds
    }

    /// The status of any member as seen by this member.
    pub fn member_status(&self, member: MemberId) -> Option<MemberStatus> {
        if member == self.me {
            return Some(self.status);
        }

        if self.config.contains(member) {
            if self.detector.is_suspected(member) {
                Some(MemberStatus::Suspected)
            } else {
                Some(MemberStatus::Member)
            }
        } else if self.config.is_failed(member) {
            Some(MemberStatus::Failed)
        } else {
            None
        }
    }

    /// The configured members the local failure detector currently suspects.
    pub fn suspected_members(&self) -> BTreeSet<MemberId> {
        self.config
            .members()
            .keys()
            .copied()
            .filter(|member| self.detector.is_suspected(*member))
            .collect()
    }

    /// The member currently sequencing configuration changes from this member's view.
    pub fn coordinator(&self) -> Option<MemberId> {
        self.config
            .members()
            .keys()
            .copied()
            .find(|member| *member == self.me || !self.detector.is_suspected(*member))
    }

    #[inline]
    pub fn is_coordinator(&self) -> bool {
        self.status == MemberStatus::Member && self.coordinator() == Some(self.me)
    }

    /// Takes every output queued since the last call.
    pub fn take_outputs(&mut self) -> Vec<Output> {
        std::mem::take(&mut self.outbox)
    }

    /// Starts the protocol, either bootstrapping a new cluster or contacting the seeds.
    pub fn start(&mut self, now: Instant) {
        if self.status != MemberStatus::Joining {
            return;
        }

        if self.contacts.is_empty() {
            self.bootstrap(now);
        } else {
            info!(
                member_id = %self.me,
                cluster = %self.config.name(),
                num_seeds = self.contacts.len(),
                "Joining cluster."
            );
            self.send_join_requests(now);
        }

        self.reconcile(now);
    }

    /// Asks the cluster to remove this member.
    pub fn leave(&mut self, now: Instant) {
        match self.status {
            MemberStatus::Member => {
                info!(member_id = %self.me, "Leaving cluster.");
                self.leaving = true;
                self.next_request_at = now + self.settings.join_retry_interval;
                self.enqueue(ClusterOp::Leave { member: self.me });
                self.reconcile(now);
            },
            MemberStatus::Joining => {
                self.leaving = true;
                self.status = MemberStatus::Left;
            },
            _ => {},
        }
    }

    /// Reports that a message to the given address could not be delivered.
    pub fn connection_lost(&mut self, addr: SocketAddr, now: Instant) {
        if self.status != MemberStatus::Member {
            return;
        }

        let member = self
            .config
            .members()
            .iter()
            .find(|(_, info)| info.address == addr)
            .map(|(member, _)| *member);

        if let Some(member) = member.filter(|member| *member != self.me) {
            if let Some(event) = self.detector.connection_lost(member, now) {
                self.on_liveness_event(event);
            }
        }

        self.reconcile(now);
    }

    /// Advances the timers of the protocol.
    pub fn tick(&mut self, now: Instant) {
        match self.status {
            MemberStatus::Left => return,
            MemberStatus::Joining => {
                if now >= self.next_request_at {
                    self.send_join_requests(now);
                }
                return;
            },
            _ => {},
        }

        for event in self.detector.check(now) {
            self.on_liveness_event(event);
        }

        let timed_out = self
            .round
            .as_ref()
            .map(|round| now >= round.deadline)
            .unwrap_or(false);
        if timed_out {
            self.abandon(now, "round timed out");
        }

        if self.promise.map(|p| p.expires <= now).unwrap_or(false) {
            self.promise = None;
        }

        let heartbeat_due = self
            .last_heartbeat
            .map(|last| now.saturating_duration_since(last) >= self.settings.heartbeat_interval)
            .unwrap_or(true);
        if heartbeat_due {
            self.send_heartbeats();
            self.last_heartbeat = Some(now);
        }

        if self.leaving && now >= self.next_request_at {
            self.next_request_at = now + self.settings.join_retry_interval;
            self.enqueue(ClusterOp::Leave { member: self.me });
        }

        self.reconcile(now);
    }

    /// Handles a protocol message received from `from`.
    pub fn handle_message(&mut self, from: SocketAddr, message: ClusterMessage, now: Instant) {
        if self.status == MemberStatus::Left {
            return;
        }

        match message {
            ClusterMessage::JoinRequest { member, info } => {
                self.on_join_request(member, info);
            },
            ClusterMessage::JoinDenied { member, reason } => {
                self.on_join_denied(member, reason);
            },
            ClusterMessage::LeaveRequest { member } => {
                self.on_leave_request(member);
            },
            ClusterMessage::Propose(proposal) => {
                self.on_propose(from, proposal, now);
            },
            ClusterMessage::Vote {
                proposer,
                slot,
                round,
                voter,
                verdict,
            } => {
                if proposer == self.me {
                    self.on_vote(from, slot, round, voter, verdict, now);
                }
            },
            ClusterMessage::Decided { configuration, op } => {
                trace!(
                    member_id = %self.me,
                    version = configuration.version(),
                    op = %op,
                    "Received decided configuration."
                );
                self.adopt(configuration, Some(&op), now);
            },
            ClusterMessage::Heartbeat {
                member,
                addr,
                version,
            } => {
                self.on_heartbeat(member, addr, version, now);
            },
            ClusterMessage::SyncRequest { member, version } => {
                if self.status == MemberStatus::Member && self.config.version() > version {
                    trace!(
                        member_id = %self.me,
                        target_member_id = %member,
                        "Sending configuration to lagging member."
                    );
                    let configuration = self.config.clone();
                    self.send(from, ClusterMessage::Sync { configuration });
                }
            },
            ClusterMessage::Sync { configuration } => {
                // A joiner which gave way to a diverged peer may already be
                // listed at the version it adopted.
                let admitted = self.status == MemberStatus::Joining
                    && configuration.version() == self.config.version()
                    && configuration.member(self.me) == Some(&self.info);
                if admitted {
                    self.install(configuration, None, now);
                } else {
                    self.adopt(configuration, None, now);
                }
            },
            ClusterMessage::NotMember { configuration } => {
                self.on_not_member(from, configuration, now);
            },
        }

        self.reconcile(now);
    }

    fn bootstrap(&mut self, now: Instant) {
        let mut config = ClusterConfiguration::new(self.config.name());
        config.apply(&ClusterOp::Join {
            member: self.me,
            info: self.info.clone(),
        });

        info!(
            member_id = %self.me,
            cluster = %config.name(),
            "Bootstrapped new cluster."
        );

        self.adopt(Arc::new(config), None, now);
    }

    fn enqueue(&mut self, op: ClusterOp) {
        if !self.queue.contains(&op) {
            self.queue.push_back(op);
        }
    }

    fn emit(&mut self, event: ClusterEvent) {
        self.outbox.push(Output::Event(event));
    }

    fn send(&mut self, to: SocketAddr, message: ClusterMessage) {
        if to == self.info.address {
            return;
        }
        self.outbox.push(Output::Send { to, message });
    }

    fn coordinator_addr(&self) -> Option<SocketAddr> {
        self.coordinator()
            .and_then(|member| self.config.address_of(member))
    }

    fn request_sync(&mut self, to: SocketAddr) {
        let message = ClusterMessage::SyncRequest {
            member: self.me,
            version: self.config.version(),
        };
        self.send(to, message);
    }

    fn send_join_requests(&mut self, now: Instant) {
        debug!(
            member_id = %self.me,
            num_contacts = self.contacts.len(),
            "Sending join requests."
        );

        let contacts = self.contacts.iter().copied().collect::<Vec<_>>();
        for addr in contacts {
            let message = ClusterMessage::JoinRequest {
                member: self.me,
                info: self.info.clone(),
            };
            self.send(addr, message);
        }

        self.next_request_at = now + self.settings.join_retry_interval;
    }

    fn send_heartbeats(&mut self) {
        let targets = self
            .config
            .members()
            .iter()
            .filter(|(member, _)| **member != self.me)
            .map(|(_, info)| info.address)
            .collect::<Vec<_>>();

        for addr in targets {
            let message = ClusterMessage::Heartbeat {
                member: self.me,
                addr: self.info.address,
                version: self.config.version(),
            };
            self.send(addr, message);
        }
    }

    fn on_liveness_event(&mut self, event: LivenessEvent) {
        match event {
            LivenessEvent::Suspected(member) => {
                info!(
                    member_id = %self.me,
                    target_member_id = %member,
                    "Member is suspected to be down."
                );
                self.emit(ClusterEvent::Suspected { member });
            },
            LivenessEvent::Recovered(member) => {
                info!(
                    member_id = %self.me,
                    target_member_id = %member,
                    "Suspected member has recovered."
                );
                self.emit(ClusterEvent::Recovered { member });
            },
        }
    }

    fn on_join_request(&mut self, member: MemberId, info: MemberInfo) {
        if self.status != MemberStatus::Member {
            trace!(member_id = %self.me, "Ignoring join request while not a member.");
            return;
        }

        if self.is_coordinator() {
            debug!(
                member_id = %self.me,
                target_member_id = %member,
                target_addr = %info.address,
                "Received join request."
            );
            self.enqueue(ClusterOp::Join { member, info });
        } else if let Some(addr) = self.coordinator_addr() {
            self.send(addr, ClusterMessage::JoinRequest { member, info });
        }
    }

    fn on_join_denied(&mut self, member: MemberId, reason: RejectReason) {
        if member != self.me || self.status != MemberStatus::Joining {
            return;
        }

        if !self.join_rejected {
            warn!(
                member_id = %self.me,
                reason = %reason,
                "Join was rejected by the cluster, remaining in joining state."
            );
            self.join_rejected = true;
            self.emit(ClusterEvent::JoinRejected { reason });
        }
    }

    fn on_leave_request(&mut self, member: MemberId) {
        if self.status != MemberStatus::Member {
            return;
        }

        if self.is_coordinator() {
            self.enqueue(ClusterOp::Leave { member });
        } else if let Some(addr) = self.coordinator_addr() {
            self.send(addr, ClusterMessage::LeaveRequest { member });
        }
    }

    fn on_heartbeat(
        &mut self,
        member: MemberId,
        addr: SocketAddr,
        version: u64,
        now: Instant,
    ) {
        if self.status != MemberStatus::Member || member == self.me {
            return;
        }

        if self.config.address_of(member) != Some(addr) {
            debug!(
                member_id = %self.me,
                target_member_id = %member,
                target_addr = %addr,
                "Received heartbeat from a process which is not a member."
            );
            let message = ClusterMessage::NotMember {
                configuration: self.config.clone(),
            };
            self.send(addr, message);

            // The sender may know of a decision that admitted it.
            if version > self.config.version() {
                self.request_sync(addr);
            }
            return;
        }

        if let Some(event) = self.detector.heartbeat(member, now) {
            self.on_liveness_event(event);
        }

        if version > self.config.version() {
            self.request_sync(addr);
        } else if version < self.config.version() {
            let configuration = self.config.clone();
            self.send(addr, ClusterMessage::Sync { configuration });
        }
    }

    fn on_propose(&mut self, from: SocketAddr, proposal: Proposal, now: Instant) {
        let verdict = self.judge(&proposal, now);

        if proposal.slot > self.config.version() + 1 {
            self.request_sync(from);
        }

        if verdict == Verdict::Accept {
            self.promise = Some(Promise {
                proposer: proposal.proposer,
                slot: proposal.slot,
                round: proposal.round,
                expires: now + self.settings.round_timeout,
            });
        }

        trace!(
            member_id = %self.me,
            proposer = %proposal.proposer,
            slot = proposal.slot,
            op = %proposal.op,
            verdict = ?verdict,
            "Voting on proposal."
        );

        let message = ClusterMessage::Vote {
            proposer: proposal.proposer,
            slot: proposal.slot,
            round: proposal.round,
            voter: self.me,
            verdict,
        };
        self.send(from, message);
    }

    fn judge(&self, proposal: &Proposal, now: Instant) -> Verdict {
        if self.status != MemberStatus::Member {
            return Verdict::Reject(RejectReason::NotAMember);
        }

        if proposal.slot != self.config.version() + 1 {
            return Verdict::Reject(RejectReason::StaleSlot {
                version: self.config.version(),
            });
        }

        if let Some(promise) = self.promise {
            let is_same_round =
                promise.proposer == proposal.proposer && promise.round == proposal.round;
            if promise.slot == proposal.slot && promise.expires > now && !is_same_round {
                return Verdict::Reject(RejectReason::Busy);
            }
        }

        self.validate(&proposal.op, now)
    }

    fn validate(&self, op: &ClusterOp, now: Instant) -> Verdict {
        match op {
            ClusterOp::Join { member, info } => match self.config.member(*member) {
                Some(existing) if existing.address != info.address => {
                    Verdict::Reject(RejectReason::DuplicateIdentity {
                        existing: existing.address,
                    })
                },
                _ => Verdict::Accept,
            },
            ClusterOp::Leave { member } => {
                if self.config.contains(*member) {
                    Verdict::Accept
                } else {
                    Verdict::Reject(RejectReason::NotAMember)
                }
            },
            ClusterOp::Fail { member } => {
                if !self.config.contains(*member) {
                    Verdict::Reject(RejectReason::NotAMember)
                } else if *member == self.me || self.detector.is_alive(*member, now) {
                    Verdict::Reject(RejectReason::NotSuspected)
                } else {
                    Verdict::Accept
                }
            },
            ClusterOp::Elect { role, member } => {
                if !self.config.contains(*member) {
                    return Verdict::Reject(RejectReason::NotAMember);
                }

                match self.config.role_holder(role) {
                    Some(holder) if holder != *member => {
                        Verdict::Reject(RejectReason::RoleOccupied { holder })
                    },
                    _ => Verdict::Accept,
                }
            },
        }
    }

    fn on_vote(
        &mut self,
        from: SocketAddr,
        slot: u64,
        round_id: u64,
        voter: MemberId,
        verdict: Verdict,
        now: Instant,
    ) {
        let round = match self.round.as_mut() {
            Some(round)
                if round.proposal.slot == slot
                    && round.proposal.round == round_id
                    && round.voters.contains(&voter) =>
            {
                round
            },
            _ => return,
        };

        let reason = match verdict {
            Verdict::Accept => {
                round.rejected.remove(&voter);
                round.accepted.insert(voter);
                None
            },
            Verdict::Reject(reason) => {
                round.accepted.remove(&voter);
                round.rejected.insert(voter);
                Some(reason)
            },
        };

        match reason {
            Some(RejectReason::DuplicateIdentity { existing }) => {
                if let Some(round) = self.round.take() {
                    if let ClusterOp::Join { member, info } = round.proposal.op {
                        self.deny_join(member, info.address, existing);
                    }
                }
                return;
            },
            Some(RejectReason::StaleSlot { version }) if version >= slot => {
                debug!(
                    member_id = %self.me,
                    voter = %voter,
                    version = version,
                    "Voter is ahead of the local configuration, requesting sync."
                );
                if let Some(round) = self.round.take() {
                    self.requeue(round.proposal.op);
                }
                self.request_sync(from);
                return;
            },
            Some(reason) => {
                debug!(
                    member_id = %self.me,
                    voter = %voter,
                    reason = %reason,
                    "Proposal was rejected by voter."
                );
            },
            None => {},
        }

        self.check_round(now);
    }

    fn deny_join(&mut self, member: MemberId, addr: SocketAddr, existing: SocketAddr) {
        warn!(
            member_id = %self.me,
            target_member_id = %member,
            target_addr = %addr,
            existing_addr = %existing,
            "Rejecting join of member with an identity held by a live member."
        );

        let message = ClusterMessage::JoinDenied {
            member,
            reason: RejectReason::DuplicateIdentity { existing },
        };
        self.send(addr, message);
    }

    fn requeue(&mut self, op: ClusterOp) {
        if matches!(op, ClusterOp::Join { .. } | ClusterOp::Leave { .. })
            && !self.queue.contains(&op)
        {
            self.queue.push_front(op);
        }
    }

    fn has_foreign_promise(&self, now: Instant) -> bool {
        self.promise
            .map(|promise| {
                promise.proposer != self.me
                    && promise.slot == self.config.version() + 1
                    && promise.expires > now
            })
            .unwrap_or(false)
    }

    /// Proposes the next pending change if this member is the coordinator.
    fn reconcile(&mut self, now: Instant) {
        if self.status != MemberStatus::Member {
            return;
        }

        if !self.is_coordinator() {
            self.forward_queue();
            return;
        }

        while self.round.is_none()
            && self.is_coordinator()
            && now >= self.next_proposal_at
            && !self.has_foreign_promise(now)
        {
            match self.next_op(now) {
                Some(op) => self.propose(op, now),
                None => break,
            }
        }
    }

    fn forward_queue(&mut self) {
        let addr = match self.coordinator_addr() {
            Some(addr) => addr,
            None => return,
        };

        let pending = self.queue.drain(..).collect::<Vec<_>>();
        for op in pending {
            match op {
                ClusterOp::Join { member, info } => {
                    self.send(addr, ClusterMessage::JoinRequest { member, info });
                },
                ClusterOp::Leave { member } => {
                    self.send(addr, ClusterMessage::LeaveRequest { member });
                },
                _ => {},
            }
        }
    }

    fn next_op(&mut self, now: Instant) -> Option<ClusterOp> {
        while let Some(op) = self.queue.pop_front() {
            match &op {
                ClusterOp::Join { member, info } => {
                    match self.config.member(*member).cloned() {
                        Some(existing) if existing == *info => {
                            // Already admitted, the joiner only missed the decision.
                            let configuration = self.config.clone();
                            self.send(info.address, ClusterMessage::Sync { configuration });
                        },
                        Some(existing) if existing.address != info.address => {
                            self.deny_join(*member, info.address, existing.address);
                        },
                        _ => return Some(op),
                    }
                },
                ClusterOp::Leave { member } => {
                    if self.config.contains(*member) {
                        return Some(op);
                    }
                },
                _ => return Some(op),
            }
        }

        let threshold = self.settings.fail_threshold;
        let failing = self
            .config
            .members()
            .keys()
            .copied()
            .filter(|member| *member != self.me)
            .find(|member| {
                self.detector
                    .suspected_since(*member)
                    .map(|since| now.saturating_duration_since(since) >= threshold)
                    .unwrap_or(false)
            });
        if let Some(member) = failing {
            return Some(ClusterOp::Fail { member });
        }

        for role in self.settings.elected_roles.iter() {
            if self.config.role_holder(role).is_some() {
                continue;
            }

            let candidate = self.coordinator_candidate()?;
            return Some(ClusterOp::Elect {
                role: role.clone(),
                member: candidate,
            });
        }

        None
    }

    /// The lowest member which is not suspected, used as election winner.
    fn coordinator_candidate(&self) -> Option<MemberId> {
        self.coordinator()
    }

    fn propose(&mut self, op: ClusterOp, now: Instant) {
        if let Verdict::Reject(reason) = self.validate(&op, now) {
            debug!(
                member_id = %self.me,
                op = %op,
                reason = %reason,
                "Dropping invalid operation."
            );
            return;
        }

        let slot = self.config.version() + 1;
        self.round_counter += 1;

        let failing = match &op {
            ClusterOp::Fail { member } => Some(*member),
            _ => None,
        };
        let voters = self
            .config
            .members()
            .keys()
            .copied()
            .filter(|member| Some(*member) != failing)
            .collect::<BTreeSet<_>>();

        let proposal = Proposal {
            proposer: self.me,
            slot,
            round: self.round_counter,
            op,
        };

        debug!(
            member_id = %self.me,
            slot = slot,
            op = %proposal.op,
            num_voters = voters.len(),
            "Proposing cluster change."
        );

        let targets = voters
            .iter()
            .filter(|voter| **voter != self.me)
            .filter_map(|voter| self.config.address_of(*voter))
            .collect::<Vec<_>>();
        for addr in targets {
            self.send(addr, ClusterMessage::Propose(proposal.clone()));
        }

        let deadline = now + self.settings.round_timeout;
        self.promise = Some(Promise {
            proposer: self.me,
            slot,
            round: proposal.round,
            expires: deadline,
        });
        self.round = Some(Round {
            proposal,
            voters,
            accepted: BTreeSet::from_iter([self.me]),
            rejected: BTreeSet::new(),
            deadline,
            num_members: self.config.members().len(),
            tie_breaker: self.config.members().keys().next().copied(),
        });

        self.check_round(now);
    }

    fn check_round(&mut self, now: Instant) {
        let (decided, lost) = match self.round.as_ref() {
            None => return,
            Some(round) => (round.is_decided(), round.is_lost()),
        };

        if decided {
            self.decide(now);
        } else if lost {
            self.abandon(now, "quorum is unreachable");
        }
    }

    fn decide(&mut self, now: Instant) {
        let round = match self.round.take() {
            None => return,
            Some(round) => round,
        };
        let op = round.proposal.op;

        let mut next = ClusterConfiguration::clone(&self.config);
        next.apply(&op);
        let next = Arc::new(next);

        info!(
            member_id = %self.me,
            version = next.version(),
            op = %op,
            num_accepted = round.accepted.len(),
            num_voters = round.voters.len(),
            "Cluster change agreed."
        );

        let mut recipients = self
            .config
            .members()
            .values()
            .chain(next.members().values())
            .map(|info| info.address)
            .collect::<BTreeSet<_>>();
        if let ClusterOp::Join { info, .. } = &op {
            recipients.insert(info.address);
        }

        for addr in recipients {
            let message = ClusterMessage::Decided {
                configuration: next.clone(),
                op: op.clone(),
            };
            self.send(addr, message);
        }

        self.backoff = Duration::ZERO;
        self.next_proposal_at = now;
        self.adopt(next, Some(&op), now);
    }

    fn abandon(&mut self, now: Instant, reason: &str) {
        let round = match self.round.take() {
            None => return,
            Some(round) => round,
        };

        self.abandoned_rounds += 1;
        let backoff = if self.backoff.is_zero() {
            self.settings.join_retry_interval
        } else {
            self.backoff * 2
        };
        self.backoff = backoff.min(self.settings.max_backoff);
        self.next_proposal_at = now + self.backoff;

        warn!(
            member_id = %self.me,
            slot = round.proposal.slot,
            op = %round.proposal.op,
            num_accepted = round.accepted.len(),
            num_rejected = round.rejected.len(),
            num_voters = round.voters.len(),
            backoff = ?self.backoff,
            reason = reason,
            "Agreement round abandoned, retrying after backoff."
        );

        self.requeue(round.proposal.op);
    }

    /// Handles a peer telling us we are not part of its configuration.
    ///
    /// A newer configuration is adopted like a sync, which turns this member
    /// back into a joiner if it has been removed. A configuration at the same
    /// version but with different contents means both histories diverged,
    /// the side which still lists the other as a member gives way when the
    /// sender is one of its members. Older configurations come from stale
    /// peers and are ignored, they catch up from our heartbeats.
    fn on_not_member(
        &mut self,
        from: SocketAddr,
        theirs: Arc<ClusterConfiguration>,
        now: Instant,
    ) {
        if self.status != MemberStatus::Member {
            return;
        }

        if theirs.version() > self.config.version() {
            debug!(
                member_id = %self.me,
                version = theirs.version(),
                "Peer does not list this member in a newer configuration."
            );
            self.adopt(theirs, None, now);
            return;
        }

        let from_peer = self
            .config
            .members()
            .iter()
            .any(|(member, info)| *member != self.me && info.address == from);
        if from_peer && theirs.version() == self.config.version() && theirs != self.config {
            warn!(
                member_id = %self.me,
                version = theirs.version(),
                peer_addr = %from,
                "Configuration has diverged from a peer which no longer lists this member."
            );
            self.install(theirs, None, now);
        }
    }

    /// Replaces the local configuration with a newer agreed one.
    fn adopt(
        &mut self,
        new: Arc<ClusterConfiguration>,
        op: Option<&ClusterOp>,
        now: Instant,
    ) {
        if new.version() <= self.config.version() {
            return;
        }

        self.install(new, op, now);
    }

    fn install(
        &mut self,
        new: Arc<ClusterConfiguration>,
        op: Option<&ClusterOp>,
        now: Instant,
    ) {
        if new.name() != self.config.name() {
            warn!(
                member_id = %self.me,
                cluster = %self.config.name(),
                other_cluster = %new.name(),
                "Ignoring configuration of another cluster."
            );
            return;
        }

        let old = std::mem::replace(&mut self.config, new.clone());
        let was_member = self.status == MemberStatus::Member;
        let is_member = new
            .member(self.me)
            .map(|info| info.address == self.info.address)
            .unwrap_or(false);

        if was_member {
            let events = match op {
                Some(op) if new.version() == old.version() + 1 => {
                    let mut replay = ClusterConfiguration::clone(&old);
                    replay.apply(op)
                },
                _ => diff_events(&old, &new),
            };

            for event in events {
                self.emit(event);
            }
        } else if is_member {
            self.emit(ClusterEvent::EnteredCluster(new.clone()));
        }

        match (was_member, is_member) {
            (_, true) => {
                if !was_member {
                    info!(
                        member_id = %self.me,
                        version = new.version(),
                        num_members = new.members().len(),
                        "Entered cluster."
                    );
                    self.last_heartbeat = None;
                }
                self.status = MemberStatus::Member;
                self.join_rejected = false;
            },
            (true, false) => {
                self.emit(ClusterEvent::LeftCluster);

                if self.leaving {
                    info!(member_id = %self.me, "Left cluster.");
                    self.status = MemberStatus::Left;
                } else {
                    warn!(
                        member_id = %self.me,
                        version = new.version(),
                        "Member has been removed from the cluster, rejoining."
                    );
                    self.status = MemberStatus::Joining;
                    let own_addr = self.info.address;
                    self.contacts.extend(
                        old.members()
                            .values()
                            .map(|info| info.address)
                            .filter(|addr| *addr != own_addr),
                    );
                    self.next_request_at = now;
                }
                self.queue.clear();
            },
            (false, false) => {},
        }

        if self.status == MemberStatus::Member {
            for (member, info) in old.members() {
                if new.address_of(*member) != Some(info.address) {
                    self.detector.untrack(*member);
                }
            }

            let others = new
                .members()
                .keys()
                .copied()
                .filter(|member| *member != self.me)
                .collect::<Vec<_>>();
            for member in others {
                self.detector.track(member, now);
            }
        } else {
            self.detector = FailureDetector::new(self.settings.heartbeat_timeout);
        }

        if let Some(round) = self.round.take() {
            if round.proposal.slot > new.version() && self.status == MemberStatus::Member {
                self.round = Some(round);
            } else {
                debug!(
                    member_id = %self.me,
                    slot = round.proposal.slot,
                    "Dropping round superseded by another decision."
                );
                if self.status == MemberStatus::Member {
                    self.requeue(round.proposal.op);
                }
            }
        }

        if self
            .promise
            .map(|promise| promise.slot <= new.version() || !is_member)
            .unwrap_or(false)
        {
            self.promise = None;
        }
    }
}
