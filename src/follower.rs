//! Follower role loop.

use tokio::time::{sleep_until, Instant};

use crate::node::{NewEntry, NodeTask, RaftNode};
use crate::transport::RpcMessage;
use crate::types::Role;

enum FollowerEvent {
    Shutdown,
    ElectionTimeout,
    Rpc(Option<RpcMessage>),
    Entry(Option<NewEntry>),
    Task(Option<NodeTask>),
}

impl RaftNode {
    /// Wait for a leader; campaign when one goes quiet.
    ///
    /// The election deadline is pushed out by valid AppendEntries from the
    /// current leader and by granting a vote. Nonvoters never campaign,
    /// and neither does a node parked on a fatal append error.
    pub(crate) async fn run_follower(&mut self) {
        let mut deadline = Instant::now() + self.config.random_election_timeout();

        while self.state == Role::Follower && !self.shutting_down {
            let event = tokio::select! {
                _ = self.shutdown_rx.recv() => FollowerEvent::Shutdown,
                _ = sleep_until(deadline) => FollowerEvent::ElectionTimeout,
                msg = self.rpc_rx.recv() => FollowerEvent::Rpc(msg),
                ne = self.entry_rx.recv() => FollowerEvent::Entry(ne),
                task = self.task_rx.recv() => FollowerEvent::Task(task),
            };

            match event {
                FollowerEvent::Shutdown => self.shutting_down = true,
                FollowerEvent::ElectionTimeout => {
                    if self.membership.latest.is_voter(&self.id) && self.append_err.is_none() {
                        tracing::info!(id = %self.id, term = %self.term, "election timeout");
                        self.leader_id = None;
                        self.set_state(Role::Candidate);
                        return;
                    }
                    deadline = Instant::now() + self.config.random_election_timeout();
                }
                FollowerEvent::Rpc(Some(msg)) => {
                    self.reply_rpc(msg).await;
                    if self.take_election_reset() {
                        deadline = Instant::now() + self.config.random_election_timeout();
                    }
                }
                FollowerEvent::Entry(Some(ne)) => ne.reply(Err(self.not_leader_error())),
                FollowerEvent::Task(Some(task)) => {
                    if let Some(task) = self.handle_common_task(task) {
                        self.reject_leader_task(task);
                    }
                }
                // a closed channel means the handle is gone
                FollowerEvent::Rpc(None)
                | FollowerEvent::Entry(None)
                | FollowerEvent::Task(None) => self.shutting_down = true,
            }
        }
    }
}
