//! The user state machine and the apply task.

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::error::Result;
use crate::types::{EntryKind, LogIndex};

/// The user-supplied deterministic state machine.
///
/// `apply` is called on a dedicated task in strict commit order, for
/// commands and queries alike; given the same sequence of commands every
/// replica must produce the same results.
pub trait StateMachine: Send + 'static {
    fn apply(&mut self, cmd: &Bytes) -> Bytes;
}

/// Outcome of a committed submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyResult {
    /// Log index the submission was committed at. For queries and barriers
    /// this is the pseudo-index they were ordered behind.
    pub index: LogIndex,

    /// State machine output; `None` for barriers.
    pub value: Option<Bytes>,
}

/// One unit of work for the apply task.
pub(crate) struct ApplyItem {
    pub kind: EntryKind,
    pub index: LogIndex,
    pub data: Bytes,
    pub reply: Option<oneshot::Sender<Result<ApplyResult>>>,
}

/// Apply committed work in arrival order until the feeding channel closes.
///
/// Commands and queries go through the state machine; barriers reply as
/// soon as they are dequeued, which by channel order means everything
/// before them has been applied.
pub(crate) async fn apply_loop(mut fsm: Box<dyn StateMachine>, mut rx: mpsc::Receiver<ApplyItem>) {
    while let Some(item) = rx.recv().await {
        tracing::trace!(kind = %item.kind, index = %item.index, "fsm apply");
        let value = match item.kind {
            EntryKind::Command | EntryKind::Query => Some(fsm.apply(&item.data)),
            EntryKind::Barrier => None,
            EntryKind::Noop | EntryKind::Config => {
                unreachable!("[BUG] {} entries never reach the fsm", item.kind)
            }
        };
        if let Some(reply) = item.reply {
            let _ = reply.send(Ok(ApplyResult {
                index: item.index,
                value,
            }));
        }
    }
    tracing::debug!("apply loop shutdown");
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Appends commands and returns the running count.
    struct CountingFsm {
        applied: Vec<Bytes>,
    }

    impl StateMachine for CountingFsm {
        fn apply(&mut self, cmd: &Bytes) -> Bytes {
            self.applied.push(cmd.clone());
            Bytes::from(self.applied.len().to_string())
        }
    }

    #[tokio::test]
    async fn applies_in_order_and_replies() {
        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(apply_loop(
            Box::new(CountingFsm { applied: Vec::new() }),
            rx,
        ));

        let mut replies = Vec::new();
        for i in 1..=3u64 {
            let (reply_tx, reply_rx) = oneshot::channel();
            tx.send(ApplyItem {
                kind: EntryKind::Command,
                index: LogIndex(i),
                data: Bytes::from(format!("cmd{i}")),
                reply: Some(reply_tx),
            })
            .await
            .unwrap();
            replies.push(reply_rx);
        }

        let (barrier_tx, barrier_rx) = oneshot::channel();
        tx.send(ApplyItem {
            kind: EntryKind::Barrier,
            index: LogIndex(3),
            data: Bytes::new(),
            reply: Some(barrier_tx),
        })
        .await
        .unwrap();

        for (i, reply) in replies.into_iter().enumerate() {
            let result = reply.await.unwrap().unwrap();
            assert_eq!(result.index, LogIndex(i as u64 + 1));
            assert_eq!(result.value, Some(Bytes::from((i + 1).to_string())));
        }

        // the barrier resolves only after the three commands above
        let barrier = barrier_rx.await.unwrap().unwrap();
        assert_eq!(barrier.value, None);

        drop(tx);
        handle.await.unwrap();
    }
}
