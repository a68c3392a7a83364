//! Cluster membership and quorum arithmetic.

use crate::{ReplicaId, View};

/// One entry of the node table: a replica and the address the transport
/// uses to reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaInfo {
    pub id: ReplicaId,
    pub addr: String,
}

/// The ordered cluster membership, shared by every component.
///
/// The table order is part of the protocol: the primary of view `v` is
/// the entry at index `v mod n`. All quorum thresholds derive from
/// `f = (n - 1) / 3`.
#[derive(Debug, Clone)]
pub struct NodeTable {
    my_id: ReplicaId,
    replicas: Vec<ReplicaInfo>,
}

impl NodeTable {
    /// Build a node table. The local replica must appear in the list.
    pub fn new(my_id: ReplicaId, replicas: Vec<ReplicaInfo>) -> Self {
        assert!(!replicas.is_empty(), "node table must not be empty");
        assert!(
            replicas.iter().any(|r| r.id == my_id),
            "local replica {my_id} missing from node table"
        );
        Self { my_id, replicas }
    }

    /// The local replica's id.
    pub fn my_id(&self) -> ReplicaId {
        self.my_id
    }

    /// Total number of replicas.
    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    /// True when the table is empty. Never true for a constructed table.
    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    /// Maximum number of Byzantine replicas tolerated: `(n - 1) / 3`.
    pub fn f(&self) -> usize {
        (self.replicas.len() - 1) / 3
    }

    /// Votes needed for a prepared certificate (2f, primary seed included).
    pub fn prepare_quorum(&self) -> usize {
        2 * self.f()
    }

    /// Votes needed for a committed certificate (2f + 1, self included).
    pub fn commit_quorum(&self) -> usize {
        2 * self.f() + 1
    }

    /// Matching view changes that force a lagging replica to join (f + 1).
    pub fn catchup_threshold(&self) -> usize {
        self.f() + 1
    }

    /// The primary of a view: `table[v mod n]`.
    pub fn primary_for(&self, view: View) -> ReplicaId {
        let idx = (view.0 as usize) % self.replicas.len();
        self.replicas[idx].id
    }

    /// Whether the local replica is primary for the view.
    pub fn is_primary(&self, view: View) -> bool {
        self.primary_for(view) == self.my_id
    }

    /// Whether an id belongs to the cluster.
    pub fn contains(&self, id: ReplicaId) -> bool {
        self.replicas.iter().any(|r| r.id == id)
    }

    /// Transport address of a replica.
    pub fn addr_of(&self, id: ReplicaId) -> Option<&str> {
        self.replicas
            .iter()
            .find(|r| r.id == id)
            .map(|r| r.addr.as_str())
    }

    /// All table entries in protocol order.
    pub fn replicas(&self) -> &[ReplicaInfo] {
        &self.replicas
    }

    /// All peer entries, excluding the local replica.
    pub fn peers(&self) -> impl Iterator<Item = &ReplicaInfo> {
        self.replicas.iter().filter(move |r| r.id != self.my_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_of(n: u64) -> NodeTable {
        let replicas = (0..n)
            .map(|i| ReplicaInfo {
                id: ReplicaId(i),
                addr: format!("replica-{i}:4000"),
            })
            .collect();
        NodeTable::new(ReplicaId(0), replicas)
    }

    #[test]
    fn test_fault_threshold() {
        assert_eq!(table_of(4).f(), 1);
        assert_eq!(table_of(7).f(), 2);
        assert_eq!(table_of(10).f(), 3);
    }

    #[test]
    fn test_quorums_for_four_replicas() {
        let table = table_of(4);
        assert_eq!(table.prepare_quorum(), 2);
        assert_eq!(table.commit_quorum(), 3);
        assert_eq!(table.catchup_threshold(), 2);
    }

    #[test]
    fn test_primary_rotates_with_view() {
        let table = table_of(4);
        assert_eq!(table.primary_for(View(0)), ReplicaId(0));
        assert_eq!(table.primary_for(View(1)), ReplicaId(1));
        assert_eq!(table.primary_for(View(5)), ReplicaId(1));
    }

    #[test]
    fn test_peers_excludes_self() {
        let table = table_of(4);
        let peers: Vec<_> = table.peers().map(|r| r.id).collect();
        assert_eq!(peers, vec![ReplicaId(1), ReplicaId(2), ReplicaId(3)]);
    }
}
