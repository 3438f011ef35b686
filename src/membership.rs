//! Cluster membership: nodes, configurations, and the committed/latest pair.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::{RaftError, Result};
use crate::types::{Entry, EntryKind, LogIndex, NodeId, Term};

/// A single node in a cluster configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Unique id for this node, for all time.
    pub id: NodeId,

    /// Network address other nodes use to contact it.
    pub addr: String,

    /// Whether it participates in elections and its match index counts
    /// toward commit advancement.
    pub voter: bool,

    /// Whether the leader should promote this node to voter once it has
    /// caught up. Only meaningful while `voter` is false.
    pub promote: bool,
}

impl Node {
    /// A voting member.
    pub fn voter(id: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            id: NodeId::new(id),
            addr: addr.into(),
            voter: true,
            promote: false,
        }
    }

    /// A nonvoting member, optionally flagged for promotion.
    pub fn nonvoter(id: impl Into<String>, addr: impl Into<String>, promote: bool) -> Self {
        Self {
            id: NodeId::new(id),
            addr: addr.into(),
            voter: false,
            promote,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.id.as_str().is_empty() {
            return Err(RaftError::InvalidConfig {
                reason: "empty node id".to_string(),
            });
        }
        if self.addr.is_empty() {
            return Err(RaftError::InvalidConfig {
                reason: "empty address".to_string(),
            });
        }
        let port = self
            .addr
            .rsplit_once(':')
            .map(|(_, p)| p)
            .ok_or_else(|| RaftError::InvalidConfig {
                reason: format!("address {} missing port", self.addr),
            })?;
        match port.parse::<u32>() {
            Ok(p) if p > 0 && p <= u16::MAX as u32 => Ok(()),
            _ => Err(RaftError::InvalidConfig {
                reason: format!("invalid port in address {}", self.addr),
            }),
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.voter {
            write!(f, "{}[{}]", self.id, self.addr)
        } else if self.promote {
            write!(f, "{}[{},promote]", self.id, self.addr)
        } else {
            write!(f, "{}[{},nonvoter]", self.id, self.addr)
        }
    }
}

/// A cluster configuration: the node set plus the log position that
/// introduced it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub nodes: HashMap<NodeId, Node>,
    pub index: LogIndex,
    pub term: Term,
}

impl ClusterConfig {
    pub fn new(nodes: Vec<Node>, index: LogIndex, term: Term) -> Self {
        Self {
            nodes: nodes.into_iter().map(|n| (n.id.clone(), n)).collect(),
            index,
            term,
        }
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn is_voter(&self, id: &NodeId) -> bool {
        self.nodes.get(id).map_or(false, |n| n.voter)
    }

    pub fn num_voters(&self) -> usize {
        self.nodes.values().filter(|n| n.voter).count()
    }

    /// `floor(voters/2) + 1`.
    pub fn quorum(&self) -> usize {
        self.num_voters() / 2 + 1
    }

    pub fn voters(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values().filter(|n| n.voter)
    }

    pub fn validate(&self) -> Result<()> {
        let mut addrs: HashMap<&str, &NodeId> = HashMap::new();
        for (id, node) in &self.nodes {
            node.validate()?;
            if *id != node.id {
                return Err(RaftError::InvalidConfig {
                    reason: format!("id mismatch for {}", node.id),
                });
            }
            if let Some(other) = addrs.insert(node.addr.as_str(), id) {
                return Err(RaftError::InvalidConfig {
                    reason: format!("duplicate address {} ({} and {})", node.addr, other, id),
                });
            }
        }
        if self.num_voters() == 0 {
            return Err(RaftError::InvalidConfig {
                reason: "no voters".to_string(),
            });
        }
        Ok(())
    }

    /// Encode into a config log entry at this config's index and term.
    pub fn to_entry(&self) -> Result<Entry> {
        let data = bincode::serialize(&self.nodes)?;
        Ok(Entry::new(
            EntryKind::Config,
            self.index,
            self.term,
            Bytes::from(data),
        ))
    }

    /// Decode from a config log entry.
    pub fn from_entry(entry: &Entry) -> Result<Self> {
        if entry.kind != EntryKind::Config {
            return Err(RaftError::Internal {
                reason: format!("expected config entry, got {}", entry.kind),
            });
        }
        let nodes: HashMap<NodeId, Node> = bincode::deserialize(&entry.data)?;
        Ok(Self {
            nodes,
            index: entry.index,
            term: entry.term,
        })
    }
}

impl fmt::Display for ClusterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut nodes: Vec<String> = self.nodes.values().map(|n| n.to_string()).collect();
        nodes.sort();
        write!(f, "index: {}, nodes: {:?}", self.index, nodes)
    }
}

/// The committed configuration and the latest one.
///
/// They differ exactly while a membership change is in flight: `latest` is
/// swapped optimistically when the config entry is stored, locked in when
/// the entry commits, and reverted to `committed` if leadership is lost
/// first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    pub committed: ClusterConfig,
    pub latest: ClusterConfig,
}

impl Membership {
    /// True until the first configuration is stored.
    pub fn is_bootstrap(&self) -> bool {
        self.latest.index == LogIndex::ZERO
    }

    /// True when no change is in flight.
    pub fn is_committed(&self) -> bool {
        self.latest.index == self.committed.index
    }
}

/// Validate a proposed configuration against the current one.
///
/// New voters must arrive as nonvoters with the promote flag, and at most
/// one existing voter may lose its voting rights per change.
pub(crate) fn validate_change(current: &ClusterConfig, new: &ClusterConfig) -> Result<()> {
    new.validate()?;

    let gained: Vec<&NodeId> = new
        .voters()
        .map(|n| &n.id)
        .filter(|id| !current.is_voter(id))
        .collect();
    if !gained.is_empty() {
        return Err(RaftError::InvalidConfig {
            reason: "new voters must be added as nonvoters with the promote flag".to_string(),
        });
    }

    let lost = current
        .voters()
        .filter(|n| !new.is_voter(&n.id))
        .count();
    if lost > 1 {
        return Err(RaftError::InvalidConfig {
            reason: "only one voter can lose its voting rights per change".to_string(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_voters() -> ClusterConfig {
        ClusterConfig::new(
            vec![
                Node::voter("n1", "127.0.0.1:7001"),
                Node::voter("n2", "127.0.0.1:7002"),
                Node::voter("n3", "127.0.0.1:7003"),
            ],
            LogIndex(1),
            Term(1),
        )
    }

    #[test]
    fn quorum_counts_voters_only() {
        let mut config = three_voters();
        assert_eq!(config.quorum(), 2);
        config.nodes.insert(
            NodeId::new("n4"),
            Node::nonvoter("n4", "127.0.0.1:7004", true),
        );
        assert_eq!(config.num_voters(), 3);
        assert_eq!(config.quorum(), 2);
    }

    #[test]
    fn validate_rejects_duplicate_addr() {
        let config = ClusterConfig::new(
            vec![
                Node::voter("n1", "127.0.0.1:7001"),
                Node::voter("n2", "127.0.0.1:7001"),
            ],
            LogIndex(1),
            Term(1),
        );
        assert!(matches!(
            config.validate(),
            Err(RaftError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn validate_rejects_missing_port_and_no_voters() {
        let config = ClusterConfig::new(vec![Node::voter("n1", "localhost")], LogIndex(1), Term(1));
        assert!(config.validate().is_err());

        let config = ClusterConfig::new(
            vec![Node::nonvoter("n1", "127.0.0.1:7001", false)],
            LogIndex(1),
            Term(1),
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_entry_roundtrip() {
        let config = three_voters();
        let entry = config.to_entry().unwrap();
        assert_eq!(entry.kind, EntryKind::Config);
        let decoded = ClusterConfig::from_entry(&entry).unwrap();
        assert_eq!(decoded, config);
    }

    #[test]
    fn change_rejects_direct_new_voter() {
        let current = three_voters();
        let mut new = current.clone();
        new.nodes
            .insert(NodeId::new("n4"), Node::voter("n4", "127.0.0.1:7004"));
        assert!(validate_change(&current, &new).is_err());

        // adding as a promotable nonvoter is fine
        let mut new = current.clone();
        new.nodes.insert(
            NodeId::new("n4"),
            Node::nonvoter("n4", "127.0.0.1:7004", true),
        );
        assert!(validate_change(&current, &new).is_ok());
    }

    #[test]
    fn change_rejects_two_demotions() {
        let current = three_voters();
        let mut new = current.clone();
        new.nodes.get_mut(&NodeId::new("n2")).unwrap().voter = false;
        new.nodes.get_mut(&NodeId::new("n3")).unwrap().voter = false;
        assert!(validate_change(&current, &new).is_err());

        let mut new = current.clone();
        new.nodes.get_mut(&NodeId::new("n2")).unwrap().voter = false;
        assert!(validate_change(&current, &new).is_ok());
    }

    #[test]
    fn membership_flags() {
        let mut membership = Membership::default();
        assert!(membership.is_bootstrap());
        assert!(membership.is_committed());

        membership.latest = three_voters();
        assert!(!membership.is_bootstrap());
        assert!(!membership.is_committed());

        membership.committed = membership.latest.clone();
        assert!(membership.is_committed());
    }
}
