//! Deterministic safety tests, driven through the RPC surface.
//!
//! A single node is exercised as a follower by hand-crafted AppendEntries
//! and RequestVote envelopes: no timers, no real peers, no races. Covers
//! log conflict truncation, AppendEntries idempotency, vote durability
//! across restarts, and commit-index clamping.

use bytes::Bytes;
use skiff::{
    AppendEntriesRequest, AppendEntriesResponse, ClusterConfig, Entry, EntryKind, LogIndex,
    MemoryStorage, Node, NodeId, Raft, RaftConfig, RaftError, RequestVoteRequest,
    RequestVoteResponse, Role, RpcMessage, StateMachine, Storage, Term, Trace,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

struct RecordingFsm {
    applied: Arc<Mutex<Vec<Bytes>>>,
}

impl StateMachine for RecordingFsm {
    fn apply(&mut self, cmd: &Bytes) -> Bytes {
        let mut applied = self.applied.lock().unwrap();
        applied.push(cmd.clone());
        Bytes::from(applied.len().to_string())
    }
}

struct TestFollower {
    raft: Raft,
    mem: MemoryStorage,
    applied: Arc<Mutex<Vec<Bytes>>>,
}

fn follower(id: &str) -> TestFollower {
    follower_on(id, MemoryStorage::new())
}

/// Build a node on an existing backing store (a "restart" when reused).
///
/// The election timeout is pushed way out so these tests stay a pure
/// request/response exercise.
fn follower_on(id: &str, mem: MemoryStorage) -> TestFollower {
    let storage = Storage::new(Box::new(mem.clone()), Box::new(mem.clone())).unwrap();
    let applied = Arc::new(Mutex::new(Vec::new()));
    let transport = Arc::new(skiff::InMemoryTransport::new(
        NodeId::new(id),
        HashMap::new(),
    ));
    let config = RaftConfig {
        heartbeat_timeout: std::time::Duration::from_secs(60),
        leader_lease_timeout: std::time::Duration::from_secs(60),
        ..RaftConfig::default()
    };
    let raft = Raft::new(
        NodeId::new(id),
        config,
        Box::new(RecordingFsm {
            applied: applied.clone(),
        }),
        storage,
        transport,
        Trace::default(),
    )
    .unwrap();
    raft.start().unwrap();
    TestFollower { raft, mem, applied }
}

async fn append_entries(raft: &Raft, request: AppendEntriesRequest) -> AppendEntriesResponse {
    let (response_tx, response_rx) = oneshot::channel();
    raft.rpc_sender()
        .send(RpcMessage::AppendEntries {
            request,
            response_tx,
        })
        .await
        .unwrap();
    response_rx.await.unwrap()
}

async fn request_vote(raft: &Raft, request: RequestVoteRequest) -> RequestVoteResponse {
    let (response_tx, response_rx) = oneshot::channel();
    raft.rpc_sender()
        .send(RpcMessage::RequestVote {
            request,
            response_tx,
        })
        .await
        .unwrap();
    response_rx.await.unwrap()
}

fn cmd(index: u64, term: u64, data: &str) -> Entry {
    Entry::new(
        EntryKind::Command,
        LogIndex(index),
        Term(term),
        Bytes::from(data.to_string()),
    )
}

fn ae(
    term: u64,
    leader: &str,
    prev_index: u64,
    prev_term: u64,
    entries: Vec<Entry>,
    commit: u64,
) -> AppendEntriesRequest {
    AppendEntriesRequest {
        term: Term(term),
        leader_id: NodeId::new(leader),
        prev_log_index: LogIndex(prev_index),
        prev_log_term: Term(prev_term),
        entries,
        leader_commit: LogIndex(commit),
    }
}

fn rv(term: u64, candidate: &str, last_index: u64, last_term: u64) -> RequestVoteRequest {
    RequestVoteRequest {
        term: Term(term),
        candidate_id: NodeId::new(candidate),
        last_log_index: LogIndex(last_index),
        last_log_term: Term(last_term),
    }
}

#[tokio::test]
async fn conflict_suffix_is_truncated_and_replaced() {
    let t = follower("a");

    // term-2 leader replicates [1T1, 2T1, 3T2], committing 2
    let resp = append_entries(
        &t.raft,
        ae(
            2,
            "b",
            0,
            0,
            vec![cmd(1, 1, "x=1"), cmd(2, 1, "x=2"), cmd(3, 2, "x=3")],
            2,
        ),
    )
    .await;
    assert!(resp.success);
    assert_eq!(resp.last_log_index, LogIndex(3));

    // term-3 leader never saw 3T2; it overwrites index 3 with 3T3
    let resp = append_entries(&t.raft, ae(3, "c", 2, 1, vec![cmd(3, 3, "y=1")], 2)).await;
    assert!(resp.success);
    assert_eq!(resp.last_log_index, LogIndex(3));
    assert_eq!(t.mem.len(), 3);

    // probe at (3, T3) succeeds: the replacement is in place
    let resp = append_entries(&t.raft, ae(3, "c", 3, 3, vec![], 2)).await;
    assert!(resp.success);
    // a probe against the dead entry's term does not
    let resp = append_entries(&t.raft, ae(3, "c", 3, 2, vec![], 2)).await;
    assert!(!resp.success);

    // commit only advances past 3 once the new leader says so
    let info = t.raft.info().await.unwrap();
    assert_eq!(info.commit_index, LogIndex(2));
    let resp = append_entries(&t.raft, ae(3, "c", 3, 3, vec![], 3)).await;
    assert!(resp.success);
    let info = t.raft.info().await.unwrap();
    assert_eq!(info.commit_index, LogIndex(3));
    assert_eq!(info.last_applied, LogIndex(3));

    // applied: x=1, x=2 from term 2, then the replacement y=1; never x=3
    // (the apply task runs one hop behind the node, so poll briefly)
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        let applied = t.applied.lock().unwrap().clone();
        if applied.len() >= 3 {
            assert_eq!(
                applied,
                vec![Bytes::from("x=1"), Bytes::from("x=2"), Bytes::from("y=1")]
            );
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "apply task never drained, saw {applied:?}"
        );
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    t.raft.shutdown().await;
}

#[tokio::test]
async fn append_entries_replay_is_idempotent() {
    let t = follower("a");

    let request = ae(1, "b", 0, 0, vec![cmd(1, 1, "x=1"), cmd(2, 1, "x=2")], 0);
    let first = append_entries(&t.raft, request.clone()).await;
    assert!(first.success);
    assert_eq!(t.mem.len(), 2);

    // same request again: same response, no log growth
    let second = append_entries(&t.raft, request).await;
    assert!(second.success);
    assert_eq!(second.term, first.term);
    assert_eq!(second.last_log_index, first.last_log_index);
    assert_eq!(t.mem.len(), 2);

    // a matching prefix in the middle of the log does not truncate the rest
    let resp = append_entries(&t.raft, ae(1, "b", 0, 0, vec![cmd(1, 1, "x=1")], 0)).await;
    assert!(resp.success);
    assert_eq!(resp.last_log_index, LogIndex(2));
    assert_eq!(t.mem.len(), 2);

    t.raft.shutdown().await;
}

#[tokio::test]
async fn stale_term_append_is_rejected_with_hint() {
    let t = follower("a");
    append_entries(&t.raft, ae(5, "b", 0, 0, vec![cmd(1, 5, "x=1")], 0)).await;

    let resp = append_entries(&t.raft, ae(3, "c", 0, 0, vec![], 0)).await;
    assert!(!resp.success);
    assert_eq!(resp.term, Term(5));
    assert_eq!(resp.last_log_index, LogIndex(1));

    // a gap past our log also fails, hinting our actual end
    let resp = append_entries(&t.raft, ae(5, "b", 7, 5, vec![], 0)).await;
    assert!(!resp.success);
    assert_eq!(resp.last_log_index, LogIndex(1));

    t.raft.shutdown().await;
}

#[tokio::test]
async fn commit_index_clamps_to_last_new_entry() {
    let t = follower("a");

    // leader claims commit 10 while shipping only 2 entries
    let resp = append_entries(
        &t.raft,
        ae(1, "b", 0, 0, vec![cmd(1, 1, "x=1"), cmd(2, 1, "x=2")], 10),
    )
    .await;
    assert!(resp.success);

    let info = t.raft.info().await.unwrap();
    assert_eq!(info.commit_index, LogIndex(2));
    assert_eq!(info.last_applied, LogIndex(2));

    t.raft.shutdown().await;
}

#[tokio::test]
async fn vote_survives_restart() {
    let mem = {
        let t = follower_on("b", MemoryStorage::new());

        // up-to-date candidate in term 5 gets the vote
        let resp = request_vote(&t.raft, rv(5, "a", 0, 0)).await;
        assert!(resp.vote_granted);
        assert_eq!(resp.term, Term(5));

        // crash before anything else happens
        t.raft.shutdown().await;
        t.mem
    };

    let t = follower_on("b", mem);
    let info = t.raft.info().await.unwrap();
    assert_eq!(info.term, Term(5));
    assert_eq!(info.voted_for, Some(NodeId::new("a")));

    // same term, different candidate: still refused after restart
    let resp = request_vote(&t.raft, rv(5, "c", 0, 0)).await;
    assert!(!resp.vote_granted);

    // next term is a fresh vote
    let resp = request_vote(&t.raft, rv(6, "c", 0, 0)).await;
    assert!(resp.vote_granted);

    t.raft.shutdown().await;
}

#[tokio::test]
async fn log_survives_restart() {
    let (mem, applied) = {
        let t = follower_on("a", MemoryStorage::new());
        let resp = append_entries(
            &t.raft,
            ae(1, "b", 0, 0, vec![cmd(1, 1, "x=1"), cmd(2, 1, "x=2")], 2),
        )
        .await;
        assert!(resp.success);
        t.raft.shutdown().await;
        let applied = t.applied.lock().unwrap().clone();
        (t.mem, applied)
    };
    assert_eq!(applied.len(), 2);

    let t = follower_on("a", mem);
    let info = t.raft.info().await.unwrap();
    assert_eq!(info.last_log_index, LogIndex(2));
    assert_eq!(info.last_log_term, Term(1));
    // commit knowledge is volatile; the next leader contact restores it
    assert_eq!(info.commit_index, LogIndex::ZERO);

    let resp = append_entries(&t.raft, ae(1, "b", 2, 1, vec![], 2)).await;
    assert!(resp.success);
    let info = t.raft.info().await.unwrap();
    assert_eq!(info.commit_index, LogIndex(2));

    t.raft.shutdown().await;
}

#[tokio::test]
async fn config_entry_updates_membership_and_redirect_hint() {
    let t = follower("a");

    let config = ClusterConfig::new(
        vec![
            Node::voter("a", "127.0.0.1:7001"),
            Node::voter("b", "127.0.0.1:7002"),
            Node::voter("c", "127.0.0.1:7003"),
        ],
        LogIndex(1),
        Term(1),
    );
    let config_entry = config.to_entry().unwrap();

    let resp = append_entries(&t.raft, ae(1, "b", 0, 0, vec![config_entry], 1)).await;
    assert!(resp.success);

    let info = t.raft.info().await.unwrap();
    assert!(info.membership.is_committed());
    assert_eq!(info.membership.committed.num_voters(), 3);
    assert_eq!(info.leader, Some(NodeId::new("b")));
    assert_eq!(info.role, Role::Follower);

    // submissions are redirected at the known leader
    match t.raft.propose(Bytes::from("x=1")).await {
        Err(RaftError::NotLeader { leader: Some(node) }) => {
            assert_eq!(node.id, NodeId::new("b"));
            assert_eq!(node.addr, "127.0.0.1:7002");
        }
        other => panic!("expected a redirect, got {other:?}"),
    }

    t.raft.shutdown().await;
}

#[tokio::test]
async fn terms_and_commit_are_monotonic() {
    let t = follower("a");

    let mut last_term = Term(0);
    let mut last_commit = LogIndex(0);

    append_entries(&t.raft, ae(2, "b", 0, 0, vec![cmd(1, 2, "x=1")], 1)).await;
    // stale and fresh interleaved
    for (term, commit) in [(2, 1), (1, 0), (4, 1), (3, 0), (4, 1)] {
        append_entries(&t.raft, ae(term, "b", 1, 2, vec![], commit)).await;
        let info = t.raft.info().await.unwrap();
        assert!(info.term >= last_term);
        assert!(info.commit_index >= last_commit);
        last_term = info.term;
        last_commit = info.commit_index;
    }

    t.raft.shutdown().await;
}
