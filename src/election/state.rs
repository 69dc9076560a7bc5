use std::collections::{BTreeSet, HashMap};

use tokio::time::{Duration, Instant};

use crate::election::log::{LogEntry, ReplicatedLog};
use crate::protocol::VoteResponse;

/// Election role of the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for ElectionRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElectionRole::Follower => write!(f, "follower"),
            ElectionRole::Candidate => write!(f, "candidate"),
            ElectionRole::Leader => write!(f, "leader"),
        }
    }
}

/// Result of counting one vote response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    /// Stale term, wrong role, duplicate, or arrived after the vote window.
    Ignored,
    Denied,
    /// Granted, quorum not reached yet.
    Counted(usize),
    /// Granted and the tally reached quorum.
    Won,
    /// The response carried a higher term; we are a follower now.
    SteppedDown,
}

/// Election state of one node.
///
/// # Safety invariants
///
/// ## Election Safety
/// At most one leader per term. Enforced by:
/// - Each node grants at most one vote per term (`voted_for`), and
///   `voted_for` is only cleared when `current_term` advances (or when a
///   candidate concedes to a same-term leader, whose quorum it is not part of)
/// - A candidate needs `quorum` distinct granted votes for its own term
///
/// ## Term monotonicity
/// `current_term` never decreases: `become_follower` ignores lower terms and
/// `become_candidate` only increments.
///
/// ## Log Matching
/// Entries are appended only while leader; followers merge the leader's
/// entries after the `prev_log_index`/`prev_log_term` check and truncate
/// conflicting suffixes (see [`ReplicatedLog`]).
///
/// All mutation happens under the owning node's lock, so a term bump and a
/// vote grant can never interleave.
#[derive(Debug)]
pub struct ElectionState {
    pub current_term: u64,
    pub voted_for: Option<String>,
    pub log: ReplicatedLog,

    pub commit_index: Option<u64>,
    pub last_applied: Option<u64>,

    // Leader only, reinitialized on election
    pub next_index: HashMap<String, u64>,
    pub match_index: HashMap<String, Option<u64>>,

    pub role: ElectionRole,
    pub leader_id: Option<String>,

    // Candidate only
    pub votes: BTreeSet<String>,
    pub quorum: usize,
    pub vote_deadline: Option<Instant>,

    /// When the current election timer fires (ignored while leader).
    pub election_deadline: Instant,
}

impl ElectionState {
    pub fn new(now: Instant) -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            log: ReplicatedLog::new(),
            commit_index: None,
            last_applied: None,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            role: ElectionRole::Follower,
            leader_id: None,
            votes: BTreeSet::new(),
            quorum: 1,
            vote_deadline: None,
            election_deadline: now,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.role == ElectionRole::Leader
    }

    pub fn reset_election_timer(&mut self, now: Instant, timeout: Duration) {
        self.election_deadline = now + timeout;
    }

    /// Step down (or stay) as follower, adopting `term` if it is newer.
    pub fn become_follower(&mut self, term: u64) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.leader_id = None;
        }
        self.role = ElectionRole::Follower;
        self.votes.clear();
        self.vote_deadline = None;
    }

    /// Start a new election round: bump the term and vote for ourselves.
    pub fn become_candidate(
        &mut self,
        my_id: &str,
        quorum: usize,
        now: Instant,
        vote_window: Duration,
    ) {
        assert!(
            self.role != ElectionRole::Leader,
            "a leader must step down before starting an election"
        );
        self.role = ElectionRole::Candidate;
        self.current_term += 1;
        self.voted_for = Some(my_id.to_string());
        self.votes.clear();
        self.votes.insert(my_id.to_string());
        self.leader_id = None;
        self.quorum = quorum.max(1);
        self.vote_deadline = Some(now + vote_window);
    }

    /// Take leadership after winning the current round.
    pub fn become_leader<'a>(&mut self, my_id: &str, peer_ids: impl IntoIterator<Item = &'a String>) {
        assert!(
            self.role == ElectionRole::Candidate,
            "only a candidate can become leader (role was {})",
            self.role
        );
        self.role = ElectionRole::Leader;
        self.leader_id = Some(my_id.to_string());
        self.votes.clear();
        self.vote_deadline = None;

        let next = self.log.len() as u64;
        self.next_index.clear();
        self.match_index.clear();
        for peer_id in peer_ids {
            self.next_index.insert(peer_id.clone(), next);
            self.match_index.insert(peer_id.clone(), None);
        }
    }

    /// Count a vote response received from `voter`.
    pub fn record_vote(&mut self, voter: &str, resp: &VoteResponse, now: Instant) -> VoteOutcome {
        if resp.term > self.current_term {
            self.become_follower(resp.term);
            return VoteOutcome::SteppedDown;
        }
        if self.role != ElectionRole::Candidate || resp.term != self.current_term {
            return VoteOutcome::Ignored;
        }
        if self.vote_deadline.is_some_and(|deadline| now > deadline) {
            // Late replies count as denials.
            return VoteOutcome::Ignored;
        }
        if !resp.vote_granted {
            return VoteOutcome::Denied;
        }
        if !self.votes.insert(voter.to_string()) {
            return VoteOutcome::Ignored;
        }
        if self.votes.len() >= self.quorum {
            VoteOutcome::Won
        } else {
            VoteOutcome::Counted(self.votes.len())
        }
    }

    /// Append a command to the log. Only valid while leader.
    pub fn append_entry(&mut self, command: serde_json::Value) -> u64 {
        assert!(
            self.role == ElectionRole::Leader,
            "log entries can only be appended by the leader (role was {})",
            self.role
        );
        let index = self.log.append(self.current_term, command);
        self.advance_commit_index();
        index
    }

    /// Leader only: commit the highest index replicated on a quorum, as long
    /// as it was written in the current term.
    pub fn advance_commit_index(&mut self) {
        if self.role != ElectionRole::Leader {
            return;
        }
        let cluster_size = self.match_index.len() + 1;
        let quorum = cluster_size / 2 + 1;

        let mut matched: Vec<Option<u64>> = self.match_index.values().copied().collect();
        matched.push(self.log.last_index());
        matched.sort_unstable_by(|a, b| b.cmp(a));

        let candidate = matched.get(quorum - 1).copied().flatten();
        if candidate > self.commit_index {
            if let Some(index) = candidate {
                if self.log.term_at(index) == Some(self.current_term) {
                    self.commit_index = Some(index);
                    tracing::debug!(commit_index = index, "Updated commit index");
                }
            }
        }
    }

    /// Drain entries that are committed but not yet applied.
    pub fn take_committed(&mut self) -> Vec<LogEntry> {
        let Some(commit) = self.commit_index else {
            return Vec::new();
        };
        let start = self.last_applied.map(|i| i + 1).unwrap_or(0);
        if start > commit {
            return Vec::new();
        }
        let entries = self
            .log
            .entries_from(start, (commit - start + 1) as usize);
        self.last_applied = Some(commit);
        entries
    }

    /// Leader as seen from this node.
    pub fn known_leader(&self, my_id: &str) -> Option<String> {
        if self.is_leader() {
            Some(my_id.to_string())
        } else {
            self.leader_id.clone()
        }
    }
}
