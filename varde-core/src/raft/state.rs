//! Pure consensus state machine.
//!
//! Every input arrives as a method call carrying the caller's clock
//! reading, and every output comes back as `(peer, rpc)` pairs plus
//! committed entries drained through [`RaftState::take_committed`].
//! Nothing in this module sleeps, spawns, or reads the clock itself,
//! so the full election and replication protocol can be exercised by
//! hand-stepping a cluster of states in a test.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::config::RaftTuning;
use crate::error::{VardeError, VardeResult};
use crate::raft::command::Command;
use crate::raft::log::{LogEntry, RaftLog};
use crate::raft::messages::{
    AppendEntriesArgs, AppendEntriesReply, Outbound, RaftRpc, RequestVoteArgs, RequestVoteReply,
};
use crate::types::{LogIndex, NodeId, RaftRole, Term};

pub struct RaftState {
    node_id: NodeId,
    peers: Vec<NodeId>,
    tuning: RaftTuning,

    role: RaftRole,
    current_term: Term,
    voted_for: Option<NodeId>,
    log: RaftLog,
    commit_index: LogIndex,
    last_applied: LogIndex,
    leader_id: Option<NodeId>,

    election_deadline: Instant,
    heartbeat_deadline: Instant,
    votes_received: HashSet<NodeId>,
    next_index: HashMap<NodeId, LogIndex>,
    match_index: HashMap<NodeId, LogIndex>,

    rng: StdRng,
}

impl RaftState {
    pub fn new(node_id: NodeId, peers: Vec<NodeId>, tuning: RaftTuning, now: Instant) -> Self {
        Self::with_seed(node_id, peers, tuning, now, rand::random())
    }

    /// Deterministic construction for tests and simulations. The seed
    /// only drives election timeout jitter.
    pub fn with_seed(
        node_id: NodeId,
        peers: Vec<NodeId>,
        tuning: RaftTuning,
        now: Instant,
        seed: u64,
    ) -> Self {
        let mut state = Self {
            node_id,
            peers,
            tuning,
            role: RaftRole::Follower,
            current_term: 0,
            voted_for: None,
            log: RaftLog::new(),
            commit_index: 0,
            last_applied: 0,
            leader_id: None,
            election_deadline: now,
            heartbeat_deadline: now,
            votes_received: HashSet::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            rng: StdRng::seed_from_u64(seed),
        };
        state.reset_election_timer(now);
        state
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn role(&self) -> RaftRole {
        self.role
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.leader_id
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn last_log_index(&self) -> LogIndex {
        self.log.last_index()
    }

    pub fn log_len(&self) -> usize {
        self.log.len()
    }

    /// Read-only view of the log, for inspection and tests.
    pub fn log(&self) -> &RaftLog {
        &self.log
    }

    fn quorum(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    /// Picks a fresh randomized deadline in the configured window.
    fn reset_election_timer(&mut self, now: Instant) {
        let span = self
            .tuning
            .election_timeout_max
            .saturating_sub(self.tuning.election_timeout_min);
        let jitter_ms = self.rng.gen_range(0..=span.as_millis() as u64);
        self.election_deadline =
            now + self.tuning.election_timeout_min + std::time::Duration::from_millis(jitter_ms);
    }

    /// Drives timers. Call on every clock tick.
    pub fn tick(&mut self, now: Instant) -> Vec<Outbound> {
        match self.role {
            RaftRole::Follower | RaftRole::Candidate => {
                if now >= self.election_deadline {
                    self.start_election(now)
                } else {
                    Vec::new()
                }
            }
            RaftRole::Leader => {
                if now >= self.heartbeat_deadline {
                    self.heartbeat_deadline = now + self.tuning.heartbeat_interval;
                    self.broadcast_append_entries()
                } else {
                    Vec::new()
                }
            }
        }
    }

    fn start_election(&mut self, now: Instant) -> Vec<Outbound> {
        self.current_term += 1;
        self.role = RaftRole::Candidate;
        self.voted_for = Some(self.node_id);
        self.leader_id = None;
        self.votes_received.clear();
        self.votes_received.insert(self.node_id);
        self.reset_election_timer(now);
        info!(
            node_id = self.node_id,
            term = self.current_term,
            "election timeout, starting election"
        );

        if self.votes_received.len() >= self.quorum() {
            return self.become_leader(now);
        }

        let args = RequestVoteArgs {
            term: self.current_term,
            candidate_id: self.node_id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        self.peers
            .iter()
            .map(|&peer| (peer, RaftRpc::RequestVote(args.clone())))
            .collect()
    }

    fn become_leader(&mut self, now: Instant) -> Vec<Outbound> {
        self.role = RaftRole::Leader;
        self.leader_id = Some(self.node_id);
        let next = self.log.last_index() + 1;
        for &peer in &self.peers {
            self.next_index.insert(peer, next);
            self.match_index.insert(peer, 0);
        }
        self.heartbeat_deadline = now + self.tuning.heartbeat_interval;
        info!(
            node_id = self.node_id,
            term = self.current_term,
            "won election, becoming leader"
        );
        // A cluster of one has no peers to count; commit what is local.
        self.try_advance_commit();
        self.broadcast_append_entries()
    }

    /// Reverts to follower at `term`, clearing the vote if the term moved.
    fn step_down(&mut self, term: Term, now: Instant) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
        }
        if self.role != RaftRole::Follower {
            debug!(
                node_id = self.node_id,
                term = self.current_term,
                "stepping down to follower"
            );
        }
        self.role = RaftRole::Follower;
        self.votes_received.clear();
        self.reset_election_timer(now);
    }

    pub fn handle_message(&mut self, rpc: RaftRpc, now: Instant) -> Vec<Outbound> {
        match rpc {
            RaftRpc::RequestVote(args) => self.handle_request_vote(args, now),
            RaftRpc::VoteResponse(reply) => self.handle_vote_response(reply, now),
            RaftRpc::AppendEntries(args) => self.handle_append_entries(args, now),
            RaftRpc::AppendEntriesResponse(reply) => {
                self.handle_append_entries_response(reply, now)
            }
        }
    }

    pub fn handle_request_vote(&mut self, args: RequestVoteArgs, now: Instant) -> Vec<Outbound> {
        // Stale term: refuse before touching any local state.
        if args.term < self.current_term {
            return vec![(
                args.candidate_id,
                RaftRpc::VoteResponse(RequestVoteReply {
                    term: self.current_term,
                    vote_granted: false,
                    voter_id: self.node_id,
                }),
            )];
        }
        if args.term > self.current_term {
            self.step_down(args.term, now);
        }

        let can_vote = self.voted_for.is_none() || self.voted_for == Some(args.candidate_id);
        let log_current = self
            .log
            .candidate_is_current(args.last_log_index, args.last_log_term);
        let granted = can_vote && log_current;
        if granted {
            self.voted_for = Some(args.candidate_id);
            self.reset_election_timer(now);
            debug!(
                node_id = self.node_id,
                candidate = args.candidate_id,
                term = args.term,
                "granting vote"
            );
        }
        vec![(
            args.candidate_id,
            RaftRpc::VoteResponse(RequestVoteReply {
                term: self.current_term,
                vote_granted: granted,
                voter_id: self.node_id,
            }),
        )]
    }

    pub fn handle_vote_response(&mut self, reply: RequestVoteReply, now: Instant) -> Vec<Outbound> {
        if reply.term > self.current_term {
            self.step_down(reply.term, now);
            return Vec::new();
        }
        // Replies from earlier elections no longer count.
        if self.role != RaftRole::Candidate || reply.term < self.current_term || !reply.vote_granted
        {
            return Vec::new();
        }
        self.votes_received.insert(reply.voter_id);
        if self.votes_received.len() >= self.quorum() {
            return self.become_leader(now);
        }
        Vec::new()
    }

    pub fn handle_append_entries(&mut self, args: AppendEntriesArgs, now: Instant) -> Vec<Outbound> {
        // Stale leader: refuse without resetting the election timer.
        if args.term < self.current_term {
            return vec![(
                args.leader_id,
                RaftRpc::AppendEntriesResponse(AppendEntriesReply {
                    term: self.current_term,
                    success: false,
                    follower_id: self.node_id,
                    match_index: 0,
                }),
            )];
        }

        self.step_down(args.term, now);
        self.leader_id = Some(args.leader_id);

        // Consistency check on the entry just before the batch. A miss
        // is only reported; truncation waits for the conflicting append.
        let prev_ok = matches!(self.log.term_at(args.prev_log_index), Some(term) if term == args.prev_log_term);
        if !prev_ok {
            debug!(
                node_id = self.node_id,
                prev_log_index = args.prev_log_index,
                "rejecting append, previous entry does not match"
            );
            return vec![(
                args.leader_id,
                RaftRpc::AppendEntriesResponse(AppendEntriesReply {
                    term: self.current_term,
                    success: false,
                    follower_id: self.node_id,
                    match_index: 0,
                }),
            )];
        }

        // Append the batch, skipping entries already in place and
        // truncating the suffix at the first term conflict.
        for entry in &args.entries {
            match self.log.term_at(entry.index) {
                Some(existing) if existing == entry.term => continue,
                Some(_) => {
                    warn!(
                        node_id = self.node_id,
                        index = entry.index,
                        "truncating conflicting log suffix"
                    );
                    self.log.truncate_from(entry.index);
                    self.log.push(entry.clone());
                }
                None => self.log.push(entry.clone()),
            }
        }

        // Only entries this call verified are safe to commit here.
        let last_new_entry = args.prev_log_index + args.entries.len() as u64;
        if args.leader_commit > self.commit_index {
            self.commit_index = self.commit_index.max(args.leader_commit.min(last_new_entry));
        }

        vec![(
            args.leader_id,
            RaftRpc::AppendEntriesResponse(AppendEntriesReply {
                term: self.current_term,
                success: true,
                follower_id: self.node_id,
                match_index: last_new_entry,
            }),
        )]
    }

    pub fn handle_append_entries_response(
        &mut self,
        reply: AppendEntriesReply,
        now: Instant,
    ) -> Vec<Outbound> {
        if reply.term > self.current_term {
            self.step_down(reply.term, now);
            return Vec::new();
        }
        if self.role != RaftRole::Leader || reply.term < self.current_term {
            return Vec::new();
        }

        if reply.success {
            let matched = self.match_index.entry(reply.follower_id).or_insert(0);
            if reply.match_index > *matched {
                *matched = reply.match_index;
            }
            self.next_index
                .insert(reply.follower_id, reply.match_index + 1);
            self.try_advance_commit();
            // Keep streaming while the follower is behind the tip.
            if reply.match_index < self.log.last_index() {
                return vec![(
                    reply.follower_id,
                    RaftRpc::AppendEntries(self.append_entries_for(reply.follower_id)),
                )];
            }
            Vec::new()
        } else {
            // Back up one entry and retry immediately.
            let next = self.next_index.entry(reply.follower_id).or_insert(1);
            *next = next.saturating_sub(1).max(1);
            debug!(
                node_id = self.node_id,
                follower = reply.follower_id,
                next_index = *next,
                "append rejected, backing up"
            );
            vec![(
                reply.follower_id,
                RaftRpc::AppendEntries(self.append_entries_for(reply.follower_id)),
            )]
        }
    }

    /// Appends a command to the local log and starts replicating it.
    ///
    /// Returns the assigned index once replication is underway; commit
    /// happens later, when a quorum acknowledges the entry.
    pub fn propose(
        &mut self,
        command: Command,
        now: Instant,
        now_ms: i64,
    ) -> VardeResult<(LogIndex, Vec<Outbound>)> {
        if self.role != RaftRole::Leader {
            return Err(VardeError::NotLeader {
                leader_hint: self.leader_id,
            });
        }
        let index = self.log.append(self.current_term, command, now_ms);
        debug!(
            node_id = self.node_id,
            index,
            term = self.current_term,
            "appended proposal"
        );
        self.try_advance_commit();
        self.heartbeat_deadline = now + self.tuning.heartbeat_interval;
        Ok((index, self.broadcast_append_entries()))
    }

    fn broadcast_append_entries(&mut self) -> Vec<Outbound> {
        let peers: Vec<NodeId> = self.peers.clone();
        peers
            .into_iter()
            .map(|peer| {
                let args = self.append_entries_for(peer);
                (peer, RaftRpc::AppendEntries(args))
            })
            .collect()
    }

    fn append_entries_for(&self, peer: NodeId) -> AppendEntriesArgs {
        let next = self.next_index.get(&peer).copied().unwrap_or(1);
        let prev_log_index = next - 1;
        let prev_log_term = self.log.term_at(prev_log_index).unwrap_or(0);
        AppendEntriesArgs {
            term: self.current_term,
            leader_id: self.node_id,
            prev_log_index,
            prev_log_term,
            entries: self
                .log
                .entries_from(next, self.tuning.max_entries_per_append),
            leader_commit: self.commit_index,
        }
    }

    /// Finds the highest current-term index a quorum has replicated.
    fn try_advance_commit(&mut self) {
        let quorum = self.quorum();
        let mut n = self.log.last_index();
        while n > self.commit_index {
            if self.log.term_at(n) == Some(self.current_term) {
                let replicas = 1 + self
                    .peers
                    .iter()
                    .filter(|peer| self.match_index.get(*peer).copied().unwrap_or(0) >= n)
                    .count();
                if replicas >= quorum {
                    debug!(
                        node_id = self.node_id,
                        commit_index = n,
                        "advancing commit index"
                    );
                    self.commit_index = n;
                    break;
                }
            }
            n -= 1;
        }
    }

    /// Drains entries newly covered by the commit index, in order.
    /// Each entry comes out exactly once.
    pub fn take_committed(&mut self) -> Vec<LogEntry> {
        let mut out = Vec::new();
        while self.last_applied < self.commit_index {
            self.last_applied += 1;
            if let Some(entry) = self.log.entry_at(self.last_applied) {
                out.push(entry.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn put(key: &str) -> Command {
        Command::CachePut {
            key: key.to_string(),
            value: "v".to_string(),
            version: 1,
        }
    }

    fn state(id: NodeId, peers: &[NodeId], now: Instant) -> RaftState {
        RaftState::with_seed(id, peers.to_vec(), RaftTuning::default(), now, id)
    }

    fn fired(now: Instant) -> Instant {
        // Past the maximum election timeout.
        now + Duration::from_millis(400)
    }

    fn vote_request(out: &Outbound) -> &RequestVoteArgs {
        match &out.1 {
            RaftRpc::RequestVote(args) => args,
            other => panic!("expected RequestVote, got {other:?}"),
        }
    }

    fn vote_reply(out: &Outbound) -> &RequestVoteReply {
        match &out.1 {
            RaftRpc::VoteResponse(reply) => reply,
            other => panic!("expected VoteResponse, got {other:?}"),
        }
    }

    fn append_args(out: &Outbound) -> &AppendEntriesArgs {
        match &out.1 {
            RaftRpc::AppendEntries(args) => args,
            other => panic!("expected AppendEntries, got {other:?}"),
        }
    }

    fn append_reply(out: &Outbound) -> &AppendEntriesReply {
        match &out.1 {
            RaftRpc::AppendEntriesResponse(reply) => reply,
            other => panic!("expected AppendEntriesResponse, got {other:?}"),
        }
    }

    #[test]
    fn follower_starts_election_after_timeout() {
        let now = Instant::now();
        let mut s = state(1, &[2, 3], now);
        assert!(s.tick(now + Duration::from_millis(100)).is_empty());

        let out = s.tick(fired(now));
        assert_eq!(s.role(), RaftRole::Candidate);
        assert_eq!(s.current_term(), 1);
        assert_eq!(out.len(), 2);
        for o in &out {
            let args = vote_request(o);
            assert_eq!(args.candidate_id, 1);
            assert_eq!(args.term, 1);
        }
    }

    #[test]
    fn candidate_wins_with_majority_and_sends_heartbeats() {
        let now = Instant::now();
        let mut s = state(1, &[2, 3], now);
        s.tick(fired(now));

        let out = s.handle_vote_response(
            RequestVoteReply {
                term: 1,
                vote_granted: true,
                voter_id: 2,
            },
            fired(now),
        );
        assert_eq!(s.role(), RaftRole::Leader);
        assert_eq!(s.leader_id(), Some(1));
        assert_eq!(out.len(), 2);
        for o in &out {
            let args = append_args(o);
            assert!(args.entries.is_empty());
            assert_eq!(args.leader_id, 1);
        }
    }

    #[test]
    fn refused_votes_do_not_elect() {
        let now = Instant::now();
        let mut s = state(1, &[2, 3, 4, 5], now);
        s.tick(fired(now));
        for voter in [2, 3] {
            s.handle_vote_response(
                RequestVoteReply {
                    term: 1,
                    vote_granted: false,
                    voter_id: voter,
                },
                fired(now),
            );
        }
        assert_eq!(s.role(), RaftRole::Candidate);
    }

    #[test]
    fn one_vote_per_term() {
        let now = Instant::now();
        let mut s = state(1, &[2, 3], now);
        let ask = |candidate: NodeId| RequestVoteArgs {
            term: 5,
            candidate_id: candidate,
            last_log_index: 0,
            last_log_term: 0,
        };
        let first = s.handle_request_vote(ask(2), now);
        assert!(vote_reply(&first[0]).vote_granted);
        let second = s.handle_request_vote(ask(3), now);
        assert!(!vote_reply(&second[0]).vote_granted);
        // Repeat request from the same candidate is granted again.
        let again = s.handle_request_vote(ask(2), now);
        assert!(vote_reply(&again[0]).vote_granted);
    }

    #[test]
    fn vote_refused_when_candidate_log_is_behind() {
        let now = Instant::now();
        let mut s = state(1, &[2, 3], now);
        // Give the voter a log entry at term 2 via replication.
        s.handle_append_entries(
            AppendEntriesArgs {
                term: 2,
                leader_id: 3,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![LogEntry {
                    term: 2,
                    index: 1,
                    command: put("a"),
                    appended_at_ms: 0,
                }],
                leader_commit: 0,
            },
            now,
        );

        let out = s.handle_request_vote(
            RequestVoteArgs {
                term: 3,
                candidate_id: 2,
                last_log_index: 4,
                last_log_term: 1,
            },
            now,
        );
        assert!(!vote_reply(&out[0]).vote_granted);
        // Term still advances even though the vote was refused.
        assert_eq!(s.current_term(), 3);
    }

    #[test]
    fn stale_term_vote_request_is_refused_without_side_effects() {
        let now = Instant::now();
        let mut s = state(1, &[2, 3], now);
        s.tick(fired(now));
        assert_eq!(s.current_term(), 1);

        let out = s.handle_request_vote(
            RequestVoteArgs {
                term: 0,
                candidate_id: 2,
                last_log_index: 9,
                last_log_term: 9,
            },
            fired(now),
        );
        let reply = vote_reply(&out[0]);
        assert!(!reply.vote_granted);
        assert_eq!(reply.term, 1);
        assert_eq!(s.role(), RaftRole::Candidate);
    }

    #[test]
    fn stale_append_entries_refused_without_following() {
        let now = Instant::now();
        let mut s = state(1, &[2, 3], now);
        s.handle_request_vote(
            RequestVoteArgs {
                term: 4,
                candidate_id: 2,
                last_log_index: 0,
                last_log_term: 0,
            },
            now,
        );
        let out = s.handle_append_entries(
            AppendEntriesArgs {
                term: 2,
                leader_id: 3,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: Vec::new(),
                leader_commit: 0,
            },
            now,
        );
        let reply = append_reply(&out[0]);
        assert!(!reply.success);
        assert_eq!(reply.term, 4);
        assert_eq!(s.leader_id(), None);
    }

    #[test]
    fn append_rejected_on_prev_mismatch_without_truncation() {
        let now = Instant::now();
        let mut s = state(1, &[2], now);
        s.handle_append_entries(
            AppendEntriesArgs {
                term: 1,
                leader_id: 2,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![
                    LogEntry {
                        term: 1,
                        index: 1,
                        command: put("a"),
                        appended_at_ms: 0,
                    },
                    LogEntry {
                        term: 1,
                        index: 2,
                        command: put("b"),
                        appended_at_ms: 0,
                    },
                ],
                leader_commit: 0,
            },
            now,
        );
        assert_eq!(s.log_len(), 2);

        // Gap: leader assumes a match at index 5 that we do not have.
        let out = s.handle_append_entries(
            AppendEntriesArgs {
                term: 1,
                leader_id: 2,
                prev_log_index: 5,
                prev_log_term: 1,
                entries: vec![LogEntry {
                    term: 1,
                    index: 6,
                    command: put("x"),
                    appended_at_ms: 0,
                }],
                leader_commit: 0,
            },
            now,
        );
        assert!(!append_reply(&out[0]).success);
        assert_eq!(s.log_len(), 2);
    }

    #[test]
    fn conflicting_suffix_is_truncated_then_replaced() {
        let now = Instant::now();
        let mut s = state(1, &[2], now);
        s.handle_append_entries(
            AppendEntriesArgs {
                term: 1,
                leader_id: 2,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![
                    LogEntry {
                        term: 1,
                        index: 1,
                        command: put("a"),
                        appended_at_ms: 0,
                    },
                    LogEntry {
                        term: 1,
                        index: 2,
                        command: put("stale"),
                        appended_at_ms: 0,
                    },
                ],
                leader_commit: 0,
            },
            now,
        );

        let out = s.handle_append_entries(
            AppendEntriesArgs {
                term: 3,
                leader_id: 3,
                prev_log_index: 1,
                prev_log_term: 1,
                entries: vec![LogEntry {
                    term: 3,
                    index: 2,
                    command: put("fresh"),
                    appended_at_ms: 0,
                }],
                leader_commit: 0,
            },
            now,
        );
        let reply = append_reply(&out[0]);
        assert!(reply.success);
        assert_eq!(reply.match_index, 2);
        assert_eq!(s.log_len(), 2);
        assert_eq!(
            s.log.entry_at(2).unwrap().command,
            put("fresh"),
        );
    }

    #[test]
    fn duplicate_append_is_idempotent() {
        let now = Instant::now();
        let mut s = state(1, &[2], now);
        let args = AppendEntriesArgs {
            term: 1,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![LogEntry {
                term: 1,
                index: 1,
                command: put("a"),
                appended_at_ms: 0,
            }],
            leader_commit: 0,
        };
        s.handle_append_entries(args.clone(), now);
        let out = s.handle_append_entries(args, now);
        assert!(append_reply(&out[0]).success);
        assert_eq!(s.log_len(), 1);
    }

    #[test]
    fn follower_commit_capped_at_last_verified_entry() {
        let now = Instant::now();
        let mut s = state(1, &[2], now);
        let out = s.handle_append_entries(
            AppendEntriesArgs {
                term: 1,
                leader_id: 2,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![
                    LogEntry {
                        term: 1,
                        index: 1,
                        command: put("a"),
                        appended_at_ms: 0,
                    },
                    LogEntry {
                        term: 1,
                        index: 2,
                        command: put("b"),
                        appended_at_ms: 0,
                    },
                ],
                leader_commit: 10,
            },
            now,
        );
        assert!(append_reply(&out[0]).success);
        assert_eq!(s.commit_index(), 2);
        let applied = s.take_committed();
        assert_eq!(applied.len(), 2);
        assert_eq!(applied[0].index, 1);
        assert_eq!(applied[1].index, 2);
        assert!(s.take_committed().is_empty());
    }

    #[test]
    fn leader_commits_after_quorum_ack() {
        let now = Instant::now();
        let mut s = state(1, &[2, 3], now);
        s.tick(fired(now));
        s.handle_vote_response(
            RequestVoteReply {
                term: 1,
                vote_granted: true,
                voter_id: 2,
            },
            fired(now),
        );

        let (index, out) = s.propose(put("a"), fired(now), 0).unwrap();
        assert_eq!(index, 1);
        assert_eq!(out.len(), 2);
        assert_eq!(s.commit_index(), 0);

        s.handle_append_entries_response(
            AppendEntriesReply {
                term: 1,
                success: true,
                follower_id: 2,
                match_index: 1,
            },
            fired(now),
        );
        assert_eq!(s.commit_index(), 1);
        assert_eq!(s.take_committed().len(), 1);
    }

    #[test]
    fn previous_term_entries_commit_only_through_current_term() {
        let now = Instant::now();
        let mut s = state(1, &[2, 3], now);
        // Replicated entry from an old leader at term 1.
        s.handle_append_entries(
            AppendEntriesArgs {
                term: 1,
                leader_id: 2,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![LogEntry {
                    term: 1,
                    index: 1,
                    command: put("old"),
                    appended_at_ms: 0,
                }],
                leader_commit: 0,
            },
            now,
        );

        // Win an election at term 2.
        let later = fired(now);
        s.tick(later);
        s.handle_vote_response(
            RequestVoteReply {
                term: 2,
                vote_granted: true,
                voter_id: 2,
            },
            later,
        );
        assert_eq!(s.role(), RaftRole::Leader);

        // A quorum matches the old entry, but its term is not current.
        s.handle_append_entries_response(
            AppendEntriesReply {
                term: 2,
                success: true,
                follower_id: 2,
                match_index: 1,
            },
            later,
        );
        assert_eq!(s.commit_index(), 0);

        // Committing a current-term entry carries the old one with it.
        let (index, _) = s.propose(put("new"), later, 0).unwrap();
        assert_eq!(index, 2);
        s.handle_append_entries_response(
            AppendEntriesReply {
                term: 2,
                success: true,
                follower_id: 2,
                match_index: 2,
            },
            later,
        );
        assert_eq!(s.commit_index(), 2);
        let applied = s.take_committed();
        assert_eq!(applied.len(), 2);
        assert_eq!(applied[0].command, put("old"));
    }

    #[test]
    fn single_node_cluster_elects_and_commits_alone() {
        let now = Instant::now();
        let mut s = state(1, &[], now);
        let out = s.tick(fired(now));
        assert_eq!(s.role(), RaftRole::Leader);
        assert!(out.is_empty());

        let (index, out) = s.propose(put("solo"), fired(now), 0).unwrap();
        assert_eq!(index, 1);
        assert!(out.is_empty());
        assert_eq!(s.commit_index(), 1);
        assert_eq!(s.take_committed().len(), 1);
    }

    #[test]
    fn propose_on_follower_names_the_leader() {
        let now = Instant::now();
        let mut s = state(1, &[2, 3], now);
        s.handle_append_entries(
            AppendEntriesArgs {
                term: 1,
                leader_id: 3,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: Vec::new(),
                leader_commit: 0,
            },
            now,
        );
        match s.propose(put("a"), now, 0) {
            Err(VardeError::NotLeader { leader_hint }) => assert_eq!(leader_hint, Some(3)),
            other => panic!("expected NotLeader, got {other:?}"),
        }
    }

    #[test]
    fn failed_append_backs_up_and_resends() {
        let now = Instant::now();
        let mut s = state(1, &[2, 3], now);
        // Carry three entries from an old leader, then win at term 2;
        // next_index for both peers starts past our tip.
        s.handle_append_entries(
            AppendEntriesArgs {
                term: 1,
                leader_id: 2,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: ["a", "b", "c"]
                    .iter()
                    .enumerate()
                    .map(|(i, key)| LogEntry {
                        term: 1,
                        index: i as u64 + 1,
                        command: put(key),
                        appended_at_ms: 0,
                    })
                    .collect(),
                leader_commit: 0,
            },
            now,
        );
        let later = fired(now);
        s.tick(later);
        s.handle_vote_response(
            RequestVoteReply {
                term: 2,
                vote_granted: true,
                voter_id: 2,
            },
            later,
        );
        assert_eq!(s.role(), RaftRole::Leader);

        // Follower 3 rejects; leader retries one entry earlier each time.
        let out = s.handle_append_entries_response(
            AppendEntriesReply {
                term: 2,
                success: false,
                follower_id: 3,
                match_index: 0,
            },
            later,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, 3);
        let args = append_args(&out[0]);
        assert_eq!(args.prev_log_index, 2);
        assert_eq!(args.entries.len(), 1);

        let out = s.handle_append_entries_response(
            AppendEntriesReply {
                term: 2,
                success: false,
                follower_id: 3,
                match_index: 0,
            },
            later,
        );
        let args = append_args(&out[0]);
        assert_eq!(args.prev_log_index, 1);
        assert_eq!(args.entries.len(), 2);
    }

    #[test]
    fn leader_steps_down_on_higher_term_reply() {
        let now = Instant::now();
        let mut s = state(1, &[2, 3], now);
        s.tick(fired(now));
        s.handle_vote_response(
            RequestVoteReply {
                term: 1,
                vote_granted: true,
                voter_id: 2,
            },
            fired(now),
        );
        assert_eq!(s.role(), RaftRole::Leader);

        s.handle_append_entries_response(
            AppendEntriesReply {
                term: 7,
                success: false,
                follower_id: 3,
                match_index: 0,
            },
            fired(now),
        );
        assert_eq!(s.role(), RaftRole::Follower);
        assert_eq!(s.current_term(), 7);
    }

    #[test]
    fn successful_reply_behind_tip_streams_next_batch() {
        let now = Instant::now();
        let mut s = state(1, &[2, 3], now);
        s.tick(fired(now));
        s.handle_vote_response(
            RequestVoteReply {
                term: 1,
                vote_granted: true,
                voter_id: 2,
            },
            fired(now),
        );
        for key in ["a", "b"] {
            s.propose(put(key), fired(now), 0).unwrap();
        }

        let out = s.handle_append_entries_response(
            AppendEntriesReply {
                term: 1,
                success: true,
                follower_id: 2,
                match_index: 1,
            },
            fired(now),
        );
        assert_eq!(out.len(), 1);
        let args = append_args(&out[0]);
        assert_eq!(args.prev_log_index, 1);
        assert_eq!(args.entries.len(), 1);
        assert_eq!(args.entries[0].index, 2);
    }
}
