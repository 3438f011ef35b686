//! Per-peer connection pooling.
//!
//! The byte-level wire protocol lives behind [`Dialer`] and
//! [`RaftConnection`]; this module owns the reuse policy: a bounded pool
//! per peer address, dial-on-demand with a timeout, and close-on-error so
//! a connection that failed mid-RPC is never handed out again.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RaftConfig;
use crate::error::Result;
use crate::membership::Node;
use crate::transport::RaftTransport;
use crate::types::*;

/// A single established connection to a peer.
///
/// Implementations frame and ship the request, then decode the response.
/// An `Err` is treated as fatal to the connection; it will be dropped, not
/// returned to the pool.
#[async_trait]
pub trait RaftConnection: Send {
    async fn request_vote(&mut self, request: &RequestVoteRequest)
        -> io::Result<RequestVoteResponse>;
    async fn append_entries(
        &mut self,
        request: &AppendEntriesRequest,
    ) -> io::Result<AppendEntriesResponse>;
    async fn timeout_now(&mut self, request: &TimeoutNowRequest)
        -> io::Result<TimeoutNowResponse>;
}

/// Opens connections to peer addresses.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Conn: RaftConnection + 'static;

    async fn dial(&self, addr: &str) -> io::Result<Self::Conn>;
}

/// Bounded pool of idle connections to one peer.
///
/// Acquire pops an idle connection or dials a new one; release keeps the
/// connection only while the pool is below capacity. Connections are
/// reused LIFO so the warmest one goes out first.
pub struct ConnectionPool<D: Dialer> {
    dialer: Arc<D>,
    addr: String,
    dial_timeout: Duration,
    max: usize,
    idle: Mutex<Vec<D::Conn>>,
}

impl<D: Dialer> ConnectionPool<D> {
    pub fn new(dialer: Arc<D>, addr: String, dial_timeout: Duration, max: usize) -> Self {
        Self {
            dialer,
            addr,
            dial_timeout,
            max,
            idle: Mutex::new(Vec::new()),
        }
    }

    pub async fn acquire(&self) -> io::Result<D::Conn> {
        if let Some(conn) = self.idle.lock().pop() {
            return Ok(conn);
        }
        match tokio::time::timeout(self.dial_timeout, self.dialer.dial(&self.addr)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("dial {} timed out", self.addr),
            )),
        }
    }

    pub fn release(&self, conn: D::Conn) {
        let mut idle = self.idle.lock();
        if idle.len() < self.max {
            idle.push(conn);
        }
        // at capacity: drop closes it
    }

    pub fn idle_len(&self) -> usize {
        self.idle.lock().len()
    }
}

/// [`RaftTransport`] over per-address connection pools.
///
/// Pools live as long as the transport; there is no cross-peer sharing.
pub struct PooledTransport<D: Dialer> {
    dialer: Arc<D>,
    dial_timeout: Duration,
    max_per_peer: usize,
    pools: Mutex<HashMap<String, Arc<ConnectionPool<D>>>>,
}

impl<D: Dialer> PooledTransport<D> {
    pub fn new(dialer: D, config: &RaftConfig) -> Self {
        Self {
            dialer: Arc::new(dialer),
            dial_timeout: config.dial_timeout,
            max_per_peer: config.max_connections_per_peer,
            pools: Mutex::new(HashMap::new()),
        }
    }

    fn pool(&self, addr: &str) -> Arc<ConnectionPool<D>> {
        let mut pools = self.pools.lock();
        pools
            .entry(addr.to_string())
            .or_insert_with(|| {
                Arc::new(ConnectionPool::new(
                    self.dialer.clone(),
                    addr.to_string(),
                    self.dial_timeout,
                    self.max_per_peer,
                ))
            })
            .clone()
    }

    /// Run one RPC on a pooled connection. The connection goes back to the
    /// pool only on success.
    async fn do_rpc(&self, addr: &str, request: Request) -> Result<Response> {
        let pool = self.pool(addr);
        let mut conn = pool.acquire().await?;
        let result = match request {
            Request::Vote(req) => conn.request_vote(&req).await.map(Response::Vote),
            Request::Append(req) => conn.append_entries(&req).await.map(Response::Append),
            Request::TimeoutNow(req) => conn.timeout_now(&req).await.map(Response::TimeoutNow),
        };
        match result {
            Ok(response) => {
                pool.release(conn);
                Ok(response)
            }
            Err(err) => {
                // conn dropped here: never reuse a failed connection
                Err(err.into())
            }
        }
    }
}

enum Request {
    Vote(RequestVoteRequest),
    Append(AppendEntriesRequest),
    TimeoutNow(TimeoutNowRequest),
}

enum Response {
    Vote(RequestVoteResponse),
    Append(AppendEntriesResponse),
    TimeoutNow(TimeoutNowResponse),
}

#[async_trait]
impl<D: Dialer> RaftTransport for PooledTransport<D> {
    async fn request_vote(
        &self,
        target: &Node,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        match self.do_rpc(&target.addr, Request::Vote(request)).await? {
            Response::Vote(response) => Ok(response),
            _ => unreachable!("[BUG] response kind mismatch"),
        }
    }

    async fn append_entries(
        &self,
        target: &Node,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        match self.do_rpc(&target.addr, Request::Append(request)).await? {
            Response::Append(response) => Ok(response),
            _ => unreachable!("[BUG] response kind mismatch"),
        }
    }

    async fn timeout_now(
        &self,
        target: &Node,
        request: TimeoutNowRequest,
    ) -> Result<TimeoutNowResponse> {
        match self
            .do_rpc(&target.addr, Request::TimeoutNow(request))
            .await?
        {
            Response::TimeoutNow(response) => Ok(response),
            _ => unreachable!("[BUG] response kind mismatch"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeConn {
        fail: Arc<AtomicBool>,
    }

    #[async_trait]
    impl RaftConnection for FakeConn {
        async fn request_vote(
            &mut self,
            request: &RequestVoteRequest,
        ) -> io::Result<RequestVoteResponse> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
            }
            Ok(RequestVoteResponse {
                term: request.term,
                vote_granted: false,
            })
        }

        async fn append_entries(
            &mut self,
            request: &AppendEntriesRequest,
        ) -> io::Result<AppendEntriesResponse> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
            }
            Ok(AppendEntriesResponse {
                term: request.term,
                success: true,
                last_log_index: request.prev_log_index,
            })
        }

        async fn timeout_now(
            &mut self,
            request: &TimeoutNowRequest,
        ) -> io::Result<TimeoutNowResponse> {
            Ok(TimeoutNowResponse { term: request.term })
        }
    }

    struct FakeDialer {
        dials: AtomicUsize,
        fail: Arc<AtomicBool>,
    }

    impl FakeDialer {
        fn new() -> Self {
            Self {
                dials: AtomicUsize::new(0),
                fail: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait]
    impl Dialer for FakeDialer {
        type Conn = FakeConn;

        async fn dial(&self, _addr: &str) -> io::Result<FakeConn> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            Ok(FakeConn {
                fail: self.fail.clone(),
            })
        }
    }

    fn heartbeat(term: u64) -> AppendEntriesRequest {
        AppendEntriesRequest {
            term: Term(term),
            leader_id: NodeId::new("n1"),
            prev_log_index: LogIndex::ZERO,
            prev_log_term: Term::ZERO,
            entries: Vec::new(),
            leader_commit: LogIndex::ZERO,
        }
    }

    #[tokio::test]
    async fn reuses_released_connections() {
        let dialer = Arc::new(FakeDialer::new());
        let pool = ConnectionPool::new(dialer.clone(), "a:1".to_string(), Duration::from_secs(1), 3);

        let conn = pool.acquire().await.unwrap();
        pool.release(conn);
        let _conn = pool.acquire().await.unwrap();
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pool_is_bounded() {
        let dialer = Arc::new(FakeDialer::new());
        let pool = ConnectionPool::new(dialer, "a:1".to_string(), Duration::from_secs(1), 3);

        let conns: Vec<_> = [
            pool.acquire().await.unwrap(),
            pool.acquire().await.unwrap(),
            pool.acquire().await.unwrap(),
            pool.acquire().await.unwrap(),
        ]
        .into_iter()
        .collect();

        for conn in conns {
            pool.release(conn);
        }
        // fourth release is dropped, not pooled
        assert_eq!(pool.idle_len(), 3);
    }

    #[tokio::test]
    async fn failed_connection_is_not_reused() {
        let transport = PooledTransport::new(FakeDialer::new(), &RaftConfig::default());
        let target = Node::voter("n2", "127.0.0.1:7002");

        transport
            .append_entries(&target, heartbeat(1))
            .await
            .unwrap();
        assert_eq!(transport.pool(&target.addr).idle_len(), 1);

        transport.dialer.fail.store(true, Ordering::SeqCst);
        assert!(transport.append_entries(&target, heartbeat(1)).await.is_err());
        // the failed connection was closed, not returned
        assert_eq!(transport.pool(&target.addr).idle_len(), 0);
    }
}
