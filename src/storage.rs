//! Durable state: the vote, the log, and the stored configurations.
//!
//! Users supply the two storage primitives ([`Stable`] and [`LogStore`]);
//! the [`Storage`] facade layers entry encoding and index bookkeeping on
//! top. [`MemoryStorage`] implements both primitives in memory and backs
//! the test suites.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use crate::error::{RaftError, Result};
use crate::membership::Membership;
use crate::types::{AppendEntriesRequest, Entry, LogIndex, NodeId, Term};

/// Durable variables that must survive crashes.
///
/// `set_vote` and `set_configs` must not return until the write is durable;
/// a vote acknowledged and then lost breaks vote uniqueness.
pub trait Stable: Send + Sync {
    fn get_vote(&self) -> io::Result<(Term, Option<NodeId>)>;
    fn set_vote(&self, term: Term, voted_for: Option<NodeId>) -> io::Result<()>;
    fn get_configs(&self) -> io::Result<Option<Bytes>>;
    fn set_configs(&self, configs: Bytes) -> io::Result<()>;
}

/// Append-only entry log.
///
/// Entries are opaque bytes addressed by zero-based position from the first
/// retained entry; the facade maps log indexes onto positions. `append`
/// must not return until the entry is durable.
pub trait LogStore: Send + Sync {
    fn empty(&self) -> io::Result<bool>;
    fn first(&self) -> io::Result<Bytes>;
    fn last(&self) -> io::Result<Bytes>;
    fn get(&self, offset: u64) -> io::Result<Bytes>;
    fn append(&self, entry: Bytes) -> io::Result<()>;
    fn delete_first(&self, n: u64) -> io::Result<()>;
    fn delete_last(&self, n: u64) -> io::Result<()>;
}

/// First and last retained log indexes. Both zero means empty; an entry
/// never has index zero.
#[derive(Debug, Clone, Copy, Default)]
struct IndexRange {
    first: u64,
    last: u64,
}

/// Storage facade over the user-supplied primitives.
///
/// Writes are serialized by the node task; reads also come from the
/// replication workers, hence the lock on the index range.
pub struct Storage {
    stable: Box<dyn Stable>,
    log: Box<dyn LogStore>,
    range: RwLock<IndexRange>,
}

impl Storage {
    /// Wrap the primitives and recover the index range from the log.
    pub fn new(stable: Box<dyn Stable>, log: Box<dyn LogStore>) -> Result<Self> {
        let storage = Self {
            stable,
            log,
            range: RwLock::new(IndexRange::default()),
        };
        storage.init()?;
        Ok(storage)
    }

    /// In-memory storage, returning the backing store for reuse across
    /// restarts in tests.
    pub fn memory() -> (Self, MemoryStorage) {
        let mem = MemoryStorage::new();
        let storage = Self::new(Box::new(mem.clone()), Box::new(mem.clone()))
            .expect("memory storage init cannot fail");
        (storage, mem)
    }

    fn init(&self) -> Result<()> {
        if self.log.empty()? {
            return Ok(());
        }
        let first = decode_entry(&self.log.first()?)?.index.0;
        let last = decode_entry(&self.log.last()?)?.index.0;
        let mut range = self.range.write();
        range.first = first;
        range.last = last;
        Ok(())
    }

    pub fn first_index(&self) -> LogIndex {
        LogIndex(self.range.read().first)
    }

    pub fn last_index(&self) -> LogIndex {
        LogIndex(self.range.read().last)
    }

    pub fn count(&self) -> u64 {
        let range = self.range.read();
        if range.first == 0 {
            0
        } else {
            range.last - range.first + 1
        }
    }

    pub fn last_entry(&self) -> Result<Option<Entry>> {
        if self.count() == 0 {
            return Ok(None);
        }
        Ok(Some(decode_entry(&self.log.last()?)?))
    }

    /// Read the entry at an absolute log index.
    pub fn get_entry(&self, index: LogIndex) -> Result<Entry> {
        let offset = {
            let range = self.range.read();
            if range.first == 0 || index.0 < range.first || index.0 > range.last {
                return Err(RaftError::Internal {
                    reason: format!(
                        "entry {} out of range [{}, {}]",
                        index, range.first, range.last
                    ),
                });
            }
            index.0 - range.first
        };
        decode_entry(&self.log.get(offset)?)
    }

    /// Append one entry; durable on return.
    pub fn append_entry(&self, entry: &Entry) -> Result<()> {
        let encoded = bincode::serialize(entry)?;
        self.log.append(Bytes::from(encoded))?;
        let mut range = self.range.write();
        if range.first == 0 {
            range.first = entry.index.0;
        }
        range.last = entry.index.0;
        Ok(())
    }

    /// Drop entries `<= index`. Compaction of the committed prefix only.
    pub fn delete_lte(&self, index: LogIndex) -> Result<()> {
        let n = {
            let range = self.range.read();
            if range.first == 0 || index.0 < range.first || index.0 > range.last {
                return Err(RaftError::Internal {
                    reason: format!("delete_lte({index}) outside log range"),
                });
            }
            index.0 - range.first + 1
        };
        self.log.delete_first(n)?;
        let mut range = self.range.write();
        if index.0 == range.last {
            range.first = 0;
            range.last = 0;
        } else {
            range.first = index.0 + 1;
        }
        Ok(())
    }

    /// Drop entries `>= index`. Conflict truncation of an uncommitted
    /// suffix only.
    pub fn delete_gte(&self, index: LogIndex) -> Result<()> {
        let n = {
            let range = self.range.read();
            if range.first == 0 || index.0 < range.first || index.0 > range.last {
                return Err(RaftError::Internal {
                    reason: format!("delete_gte({index}) outside log range"),
                });
            }
            range.last - index.0 + 1
        };
        self.log.delete_last(n)?;
        let mut range = self.range.write();
        if index.0 == range.first {
            range.first = 0;
            range.last = 0;
        } else {
            range.last = index.0 - 1;
        }
        Ok(())
    }

    pub fn get_vote(&self) -> Result<(Term, Option<NodeId>)> {
        Ok(self.stable.get_vote()?)
    }

    /// Persist term and vote; durable on return.
    pub fn set_vote(&self, term: Term, voted_for: Option<NodeId>) -> Result<()> {
        Ok(self.stable.set_vote(term, voted_for)?)
    }

    pub fn get_configs(&self) -> Result<Option<Membership>> {
        match self.stable.get_configs()? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn set_configs(&self, configs: &Membership) -> Result<()> {
        let encoded = bincode::serialize(configs)?;
        Ok(self.stable.set_configs(Bytes::from(encoded))?)
    }

    /// Fill `entries` with `[min, max]` and `prev_log_*` with the entry
    /// before `min`. `max < min` yields an empty request (heartbeat or
    /// consistency probe).
    pub(crate) fn fill_entries(
        &self,
        req: &mut AppendEntriesRequest,
        min: LogIndex,
        max: LogIndex,
    ) -> Result<()> {
        if min == LogIndex(1) {
            req.prev_log_index = LogIndex::ZERO;
            req.prev_log_term = Term::ZERO;
        } else {
            let prev = self.get_entry(LogIndex(min.0 - 1))?;
            req.prev_log_index = prev.index;
            req.prev_log_term = prev.term;
        }
        req.entries.clear();
        if max >= min {
            req.entries.reserve((max.0 - min.0 + 1) as usize);
            for index in min.0..=max.0 {
                req.entries.push(self.get_entry(LogIndex(index))?);
            }
        }
        Ok(())
    }
}

fn decode_entry(bytes: &Bytes) -> Result<Entry> {
    Ok(bincode::deserialize(bytes)?)
}

/// In-memory implementation of both storage primitives.
///
/// Clones share the same backing store, which doubles as the "disk" for
/// restart tests: rebuild a [`Storage`] from clones of the same
/// `MemoryStorage` and the vote, log, and configs all survive.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    vote: RwLock<(Term, Option<NodeId>)>,
    configs: RwLock<Option<Bytes>>,
    entries: RwLock<VecDeque<Bytes>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.read().is_empty()
    }
}

impl Stable for MemoryStorage {
    fn get_vote(&self) -> io::Result<(Term, Option<NodeId>)> {
        Ok(self.inner.vote.read().clone())
    }

    fn set_vote(&self, term: Term, voted_for: Option<NodeId>) -> io::Result<()> {
        *self.inner.vote.write() = (term, voted_for);
        Ok(())
    }

    fn get_configs(&self) -> io::Result<Option<Bytes>> {
        Ok(self.inner.configs.read().clone())
    }

    fn set_configs(&self, configs: Bytes) -> io::Result<()> {
        *self.inner.configs.write() = Some(configs);
        Ok(())
    }
}

impl LogStore for MemoryStorage {
    fn empty(&self) -> io::Result<bool> {
        Ok(self.inner.entries.read().is_empty())
    }

    fn first(&self) -> io::Result<Bytes> {
        self.inner
            .entries
            .read()
            .front()
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "log is empty"))
    }

    fn last(&self) -> io::Result<Bytes> {
        self.inner
            .entries
            .read()
            .back()
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "log is empty"))
    }

    fn get(&self, offset: u64) -> io::Result<Bytes> {
        self.inner
            .entries
            .read()
            .get(offset as usize)
            .cloned()
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("no entry at offset {offset}"))
            })
    }

    fn append(&self, entry: Bytes) -> io::Result<()> {
        self.inner.entries.write().push_back(entry);
        Ok(())
    }

    fn delete_first(&self, n: u64) -> io::Result<()> {
        let mut entries = self.inner.entries.write();
        if n as usize > entries.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "delete_first past end of log",
            ));
        }
        entries.drain(..n as usize);
        Ok(())
    }

    fn delete_last(&self, n: u64) -> io::Result<()> {
        let mut entries = self.inner.entries.write();
        if n as usize > entries.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "delete_last past end of log",
            ));
        }
        let keep = entries.len() - n as usize;
        entries.truncate(keep);
        Ok(())
    }
}
