use crate::election::log::LogMatch;
use crate::election::state::{ElectionRole, ElectionState};
use crate::protocol::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};

/// What a leader learned from an `AppendEntries` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationOutcome {
    Ignored,
    Advanced,
    Retry,
    SteppedDown,
}

/// Handle RequestVote RPC
pub fn handle_request_vote(state: &mut ElectionState, req: &VoteRequest, my_id: &str) -> VoteResponse {
    // If request term is greater, update our term and become follower
    if req.term > state.current_term {
        state.become_follower(req.term);
    }

    let vote_granted = if req.term < state.current_term {
        false
    } else if state
        .voted_for
        .as_ref()
        .is_some_and(|voted| voted != &req.candidate_id)
    {
        // Already voted for someone else in this term
        false
    } else if !state.log.is_up_to_date(req.last_log_index, req.last_log_term) {
        false
    } else {
        state.voted_for = Some(req.candidate_id.clone());
        true
    };

    tracing::debug!(
        node_id = %my_id,
        candidate = %req.candidate_id,
        term = req.term,
        granted = vote_granted,
        "RequestVote response"
    );

    VoteResponse {
        term: state.current_term,
        vote_granted,
    }
}

/// Handle AppendEntries RPC
pub fn handle_append_entries(
    state: &mut ElectionState,
    req: &AppendEntriesRequest,
    my_id: &str,
) -> AppendEntriesResponse {
    if req.term > state.current_term {
        state.become_follower(req.term);
    }

    if req.term < state.current_term {
        return reject(state);
    }

    match state.role {
        ElectionRole::Candidate => {
            // Concede to the leader of our own term
            state.become_follower(req.term);
            state.voted_for = None;
        }
        ElectionRole::Leader => {
            // Only possible when the two sides counted different peer sets.
            // Both step down and a fresh election settles it.
            tracing::warn!(
                node_id = %my_id,
                other_leader = %req.leader_id,
                term = req.term,
                "AppendEntries from another leader in our own term, stepping down"
            );
            state.become_follower(req.term);
            state.leader_id = None;
            return reject(state);
        }
        ElectionRole::Follower => {}
    }
    state.leader_id = Some(req.leader_id.clone());

    match state.log.match_prev(req.prev_log_index, req.prev_log_term) {
        LogMatch::Matched => {}
        LogMatch::Missing | LogMatch::Conflict => return reject(state),
    }

    if !req.entries.is_empty() {
        state.log.merge(req.entries.clone());
        tracing::debug!(
            node_id = %my_id,
            entries_appended = req.entries.len(),
            new_last_index = ?state.log.last_index(),
            "Appended entries"
        );
    }

    // Only the prefix checked against this request is known to match the
    // leader. Anything after it may be a stale suffix from an older term.
    let matched = last_new_index(req);
    let commit = std::cmp::min(req.leader_commit, matched);
    if commit > state.commit_index {
        state.commit_index = commit;
    }

    AppendEntriesResponse {
        term: state.current_term,
        success: true,
        match_index: matched,
    }
}

/// Index of the last entry covered by `req`: `prev_log_index + entries.len()`.
fn last_new_index(req: &AppendEntriesRequest) -> Option<u64> {
    let count = req.entries.len() as u64;
    match req.prev_log_index {
        Some(prev) => Some(prev + count),
        None => count.checked_sub(1),
    }
}

/// Apply a follower's reply to the leader's replication bookkeeping.
pub fn handle_append_entries_response(
    state: &mut ElectionState,
    peer_id: &str,
    resp: &AppendEntriesResponse,
) -> ReplicationOutcome {
    if resp.term > state.current_term {
        state.become_follower(resp.term);
        return ReplicationOutcome::SteppedDown;
    }
    if state.role != ElectionRole::Leader || resp.term != state.current_term {
        return ReplicationOutcome::Ignored;
    }

    if resp.success {
        state
            .match_index
            .insert(peer_id.to_string(), resp.match_index);
        state
            .next_index
            .insert(peer_id.to_string(), resp.match_index.map(|i| i + 1).unwrap_or(0));
        state.advance_commit_index();
        ReplicationOutcome::Advanced
    } else {
        // Back off, using the follower's last index as a hint
        let current = state.next_index.get(peer_id).copied().unwrap_or(0);
        let hint = resp.match_index.map(|i| i + 1).unwrap_or(0);
        state
            .next_index
            .insert(peer_id.to_string(), current.saturating_sub(1).min(hint));
        ReplicationOutcome::Retry
    }
}

fn reject(state: &ElectionState) -> AppendEntriesResponse {
    AppendEntriesResponse {
        term: state.current_term,
        success: false,
        match_index: state.log.last_index(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::time::{Duration, Instant};

    fn vote_req(term: u64, candidate: &str) -> VoteRequest {
        VoteRequest {
            term,
            candidate_id: candidate.to_string(),
            last_log_index: None,
            last_log_term: 0,
        }
    }

    fn heartbeat(term: u64, leader: &str) -> AppendEntriesRequest {
        AppendEntriesRequest {
            term,
            leader_id: leader.to_string(),
            prev_log_index: None,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: None,
        }
    }

    #[test]
    fn test_grant_vote_adopts_higher_term() {
        let mut state = ElectionState::new(Instant::now());
        state.current_term = 1;

        let resp = handle_request_vote(&mut state, &vote_req(2, "b"), "a");
        assert!(resp.vote_granted);
        assert_eq!(resp.term, 2);
        assert_eq!(state.voted_for.as_deref(), Some("b"));
    }

    #[test]
    fn test_vote_is_idempotent_for_same_candidate() {
        let mut state = ElectionState::new(Instant::now());
        assert!(handle_request_vote(&mut state, &vote_req(1, "b"), "a").vote_granted);
        assert!(handle_request_vote(&mut state, &vote_req(1, "b"), "a").vote_granted);
        assert!(!handle_request_vote(&mut state, &vote_req(1, "c"), "a").vote_granted);
    }

    #[test]
    fn test_reject_stale_term() {
        let mut state = ElectionState::new(Instant::now());
        state.current_term = 5;
        let resp = handle_request_vote(&mut state, &vote_req(3, "b"), "a");
        assert!(!resp.vote_granted);
        assert_eq!(resp.term, 5);
    }

    #[test]
    fn test_reject_outdated_log() {
        let mut state = ElectionState::new(Instant::now());
        state.current_term = 2;
        state.log.append(2, json!(null));

        let resp = handle_request_vote(&mut state, &vote_req(3, "b"), "a");
        assert!(!resp.vote_granted);
        // Term is still adopted
        assert_eq!(state.current_term, 3);
        assert_eq!(state.voted_for, None);
    }

    #[test]
    fn test_heartbeat_sets_leader() {
        let mut state = ElectionState::new(Instant::now());
        state.current_term = 1;
        let resp = handle_append_entries(&mut state, &heartbeat(1, "b"), "a");
        assert!(resp.success);
        assert_eq!(state.leader_id.as_deref(), Some("b"));
    }

    #[test]
    fn test_heartbeat_with_stale_term_rejected() {
        let mut state = ElectionState::new(Instant::now());
        state.current_term = 5;
        let resp = handle_append_entries(&mut state, &heartbeat(3, "b"), "a");
        assert!(!resp.success);
        assert_eq!(resp.term, 5);
        assert_eq!(state.leader_id, None);
    }

    #[test]
    fn test_candidate_concedes_to_same_term_leader() {
        let now = Instant::now();
        let mut state = ElectionState::new(now);
        state.become_candidate("a", 2, now, Duration::from_millis(100));

        let resp = handle_append_entries(&mut state, &heartbeat(1, "b"), "a");
        assert!(resp.success);
        assert_eq!(state.role, ElectionRole::Follower);
        assert_eq!(state.current_term, 1);
        assert_eq!(state.voted_for, None);
        assert_eq!(state.leader_id.as_deref(), Some("b"));
    }

    #[test]
    fn test_leader_steps_down_on_higher_term_heartbeat() {
        let now = Instant::now();
        let mut state = ElectionState::new(now);
        state.become_candidate("a", 1, now, Duration::from_millis(100));
        state.become_leader("a", &Vec::<String>::new());

        let resp = handle_append_entries(&mut state, &heartbeat(4, "b"), "a");
        assert!(resp.success);
        assert_eq!(state.role, ElectionRole::Follower);
        assert_eq!(state.current_term, 4);
        assert_eq!(state.leader_id.as_deref(), Some("b"));
    }

    #[test]
    fn test_rival_leader_in_same_term_forces_step_down() {
        let now = Instant::now();
        let mut state = ElectionState::new(now);
        state.become_candidate("a", 1, now, Duration::from_millis(100));
        state.become_leader("a", &Vec::<String>::new());

        let resp = handle_append_entries(&mut state, &heartbeat(1, "b"), "a");
        assert!(!resp.success);
        assert_eq!(state.role, ElectionRole::Follower);
        assert_eq!(state.current_term, 1);
        // No leader is adopted; the next election decides
        assert_eq!(state.leader_id, None);
        assert_eq!(state.voted_for.as_deref(), Some("a"));
    }

    #[test]
    fn test_append_rejects_missing_prev_entry() {
        let mut state = ElectionState::new(Instant::now());
        state.current_term = 1;
        let mut req = heartbeat(1, "b");
        req.prev_log_index = Some(4);
        req.prev_log_term = 1;

        let resp = handle_append_entries(&mut state, &req, "a");
        assert!(!resp.success);
        assert_eq!(resp.match_index, None);
    }

    #[test]
    fn test_append_replicates_and_commits() {
        let mut state = ElectionState::new(Instant::now());
        let mut req = heartbeat(2, "b");
        req.entries = vec![
            crate::election::log::LogEntry {
                term: 2,
                index: 0,
                command: json!("x"),
            },
            crate::election::log::LogEntry {
                term: 2,
                index: 1,
                command: json!("y"),
            },
        ];
        req.leader_commit = Some(5);

        let resp = handle_append_entries(&mut state, &req, "a");
        assert!(resp.success);
        assert_eq!(resp.match_index, Some(1));
        // Commit is capped at our last index
        assert_eq!(state.commit_index, Some(1));
    }

    #[test]
    fn test_heartbeat_reports_only_checked_prefix() {
        let mut state = ElectionState::new(Instant::now());
        state.current_term = 2;
        state.log.append(1, json!("a"));
        state.log.append(1, json!("b"));
        state.log.append(2, json!("stale"));

        let mut req = heartbeat(3, "b");
        req.prev_log_index = Some(1);
        req.prev_log_term = 1;
        req.leader_commit = Some(2);

        let resp = handle_append_entries(&mut state, &req, "a");
        assert!(resp.success);
        assert_eq!(resp.match_index, Some(1));
        // The unverified entry at 2 stays uncommitted
        assert_eq!(state.commit_index, Some(1));
        assert_eq!(state.log.len(), 3);
    }

    #[test]
    fn test_leader_tracks_follower_progress() {
        let now = Instant::now();
        let mut state = ElectionState::new(now);
        state.become_candidate("a", 2, now, Duration::from_millis(100));
        state.become_leader("a", &vec!["b".to_string(), "c".to_string()]);
        state.append_entry(json!("x"));

        let ok = AppendEntriesResponse {
            term: 1,
            success: true,
            match_index: Some(0),
        };
        assert_eq!(
            handle_append_entries_response(&mut state, "b", &ok),
            ReplicationOutcome::Advanced
        );
        assert_eq!(state.next_index.get("b"), Some(&1));
        assert_eq!(state.commit_index, Some(0));

        state.next_index.insert("c".to_string(), 3);
        let fail = AppendEntriesResponse {
            term: 1,
            success: false,
            match_index: None,
        };
        assert_eq!(
            handle_append_entries_response(&mut state, "c", &fail),
            ReplicationOutcome::Retry
        );
        assert_eq!(state.next_index.get("c"), Some(&0));
    }

    #[test]
    fn test_leader_steps_down_on_higher_term_reply() {
        let now = Instant::now();
        let mut state = ElectionState::new(now);
        state.become_candidate("a", 1, now, Duration::from_millis(100));
        state.become_leader("a", &vec!["b".to_string()]);

        let resp = AppendEntriesResponse {
            term: 3,
            success: false,
            match_index: None,
        };
        assert_eq!(
            handle_append_entries_response(&mut state, "b", &resp),
            ReplicationOutcome::SteppedDown
        );
        assert!(!state.is_leader());
        assert_eq!(state.current_term, 3);
    }
}
