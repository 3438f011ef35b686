//! The public handle: lifecycle, submissions, and admin operations.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::fsm::{apply_loop, ApplyResult, StateMachine};
use crate::membership::{ClusterConfig, Node};
use crate::node::{NewEntry, NodeChannels, NodeTask, RaftNode};
use crate::storage::Storage;
use crate::trace::{NodeInfo, Trace};
use crate::transport::{RaftTransport, RpcSender};
use crate::types::{EntryKind, LogIndex, NodeId};

/// A single Raft node.
///
/// Create with [`Raft::new`], wire incoming RPCs to [`Raft::rpc_sender`],
/// then call [`Raft::start`]. All methods are cheap handles onto channels;
/// the consensus work happens on background tasks.
pub struct Raft {
    id: NodeId,
    entry_tx: mpsc::Sender<NewEntry>,
    task_tx: mpsc::Sender<NodeTask>,
    rpc_tx: RpcSender,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<RaftTasks>,
}

enum RaftTasks {
    /// Built but not yet started.
    Pending {
        node: Box<RaftNode>,
        fsm: Box<dyn StateMachine>,
        fsm_rx: mpsc::Receiver<crate::fsm::ApplyItem>,
    },
    Running(Vec<JoinHandle<()>>),
    Stopped,
}

impl Raft {
    /// Assemble a node, recovering term, vote, log position, and
    /// membership from storage.
    pub fn new(
        id: NodeId,
        config: RaftConfig,
        fsm: Box<dyn StateMachine>,
        storage: Storage,
        transport: Arc<dyn RaftTransport>,
        trace: Trace,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|reason| RaftError::InvalidConfig { reason })?;

        let (rpc_tx, rpc_rx) = mpsc::channel(config.entry_channel_capacity);
        let (entry_tx, entry_rx) = mpsc::channel(config.entry_channel_capacity);
        let (task_tx, task_rx) = mpsc::channel(config.task_channel_capacity);
        let (fsm_tx, fsm_rx) = mpsc::channel(config.fsm_channel_capacity);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(4);

        let node = RaftNode::new(
            id.clone(),
            config,
            Arc::new(storage),
            transport,
            trace,
            NodeChannels {
                rpc_rx,
                entry_rx,
                task_rx,
                fsm_tx,
                shutdown_rx,
            },
        )?;

        Ok(Self {
            id,
            entry_tx,
            task_tx,
            rpc_tx,
            shutdown_tx,
            tasks: Mutex::new(RaftTasks::Pending {
                node: Box::new(node),
                fsm,
                fsm_rx,
            }),
        })
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Sender for incoming RPC envelopes; hand this to the server side of
    /// your transport.
    pub fn rpc_sender(&self) -> RpcSender {
        self.rpc_tx.clone()
    }

    /// Spawn the node and apply tasks. Idempotent only in the sense that
    /// a second call errors rather than double-starting.
    pub fn start(&self) -> Result<()> {
        let mut tasks = self.tasks.lock();
        match std::mem::replace(&mut *tasks, RaftTasks::Stopped) {
            RaftTasks::Pending { node, fsm, fsm_rx } => {
                let handles = vec![
                    tokio::spawn(node.run()),
                    tokio::spawn(apply_loop(fsm, fsm_rx)),
                ];
                *tasks = RaftTasks::Running(handles);
                Ok(())
            }
            other => {
                *tasks = other;
                Err(RaftError::Internal {
                    reason: "raft node already started".to_string(),
                })
            }
        }
    }

    /// Signal shutdown and wait for the background tasks to finish.
    /// Pending submissions are answered with [`RaftError::ServerClosed`].
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let handles = {
            let mut tasks = self.tasks.lock();
            match std::mem::replace(&mut *tasks, RaftTasks::Stopped) {
                RaftTasks::Running(handles) => handles,
                other => {
                    *tasks = RaftTasks::Stopped;
                    drop(other);
                    Vec::new()
                }
            }
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Replicate a command; resolves once committed and applied, with the
    /// state machine's output.
    pub async fn propose(&self, cmd: Bytes) -> Result<ApplyResult> {
        self.submit(EntryKind::Command, cmd).await
    }

    /// Run a read through the state machine, ordered after everything
    /// submitted before it. Not replicated, not persisted.
    pub async fn query(&self, req: Bytes) -> Result<ApplyResult> {
        self.submit(EntryKind::Query, req).await
    }

    /// Resolves once all commands submitted before it have been applied.
    pub async fn barrier(&self) -> Result<ApplyResult> {
        self.submit(EntryKind::Barrier, Bytes::new()).await
    }

    async fn submit(&self, kind: EntryKind, data: Bytes) -> Result<ApplyResult> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.entry_tx
            .send(NewEntry::new(kind, data, Some(reply_tx)))
            .await
            .map_err(|_| RaftError::ServerClosed)?;
        reply_rx.await.map_err(|_| RaftError::ServerClosed)?
    }

    /// Seed an empty node with its first configuration. The config entry
    /// commits once the cluster elects a leader.
    pub async fn bootstrap(&self, nodes: Vec<Node>) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.task_tx
            .send(NodeTask::Bootstrap {
                nodes,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RaftError::ServerClosed)?;
        reply_rx.await.map_err(|_| RaftError::ServerClosed)?
    }

    /// Submit a membership change; resolves when the config entry
    /// commits. `new.index` must equal the latest config's index, proving
    /// the change was computed against it.
    pub async fn change_config(&self, new: ClusterConfig) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.task_tx
            .send(NodeTask::ChangeConfig {
                new,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RaftError::ServerClosed)?;
        reply_rx
            .await
            .map_err(|_| RaftError::ServerClosed)?
            .map(|_| ())
    }

    /// Hand leadership to the most caught-up voter.
    pub async fn transfer_leadership(&self, timeout: Duration) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.task_tx
            .send(NodeTask::TransferLeadership {
                timeout,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RaftError::ServerClosed)?;
        reply_rx.await.map_err(|_| RaftError::ServerClosed)?
    }

    /// Drop the applied log prefix through `up_to` (snapshot truncation).
    pub async fn compact(&self, up_to: LogIndex) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.task_tx
            .send(NodeTask::Compact {
                up_to,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RaftError::ServerClosed)?;
        reply_rx.await.map_err(|_| RaftError::ServerClosed)?
    }

    /// Snapshot of the node's current state, read on the node task.
    pub async fn info(&self) -> Result<NodeInfo> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.task_tx
            .send(NodeTask::Inspect {
                f: Box::new(move |info| {
                    let _ = reply_tx.send(info.clone());
                }),
            })
            .await
            .map_err(|_| RaftError::ServerClosed)?;
        reply_rx.await.map_err(|_| RaftError::ServerClosed)
    }
}
