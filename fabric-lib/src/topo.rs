use std::collections::HashSet;

use crate::api::Reachability;

/// Physical link layout of a group of ranks.
///
/// Ranks are packed onto nodes of `ranks_per_node` consecutive ranks. Ranks
/// on the same node are NVLink-connected when `nvlink` is set; any two ranks
/// are RDMA-connected when `rdma` is set. Individual links can be removed to
/// model a broken cable or a missing peer mapping.
#[derive(Clone, Debug)]
pub struct LinkTopology {
    ranks_per_node: usize,
    nvlink: bool,
    rdma: bool,
    broken: HashSet<(usize, usize)>,
}

impl LinkTopology {
    pub fn new(ranks_per_node: usize) -> Self {
        Self {
            ranks_per_node: ranks_per_node.max(1),
            nvlink: true,
            rdma: true,
            broken: HashSet::new(),
        }
    }

    pub fn without_nvlink(mut self) -> Self {
        self.nvlink = false;
        self
    }

    pub fn without_rdma(mut self) -> Self {
        self.rdma = false;
        self
    }

    /// Remove every link between `a` and `b`, in both directions.
    pub fn with_broken_link(mut self, a: usize, b: usize) -> Self {
        self.broken.insert((a.min(b), a.max(b)));
        self
    }

    pub fn ranks_per_node(&self) -> usize {
        self.ranks_per_node
    }

    pub fn node_of(&self, rank: usize) -> usize {
        rank / self.ranks_per_node
    }

    pub fn reachability(&self, src: usize, dst: usize) -> Reachability {
        if src == dst {
            return Reachability { nvlink: true, rdma: true };
        }
        if self.broken.contains(&(src.min(dst), src.max(dst))) {
            return Reachability::default();
        }
        Reachability {
            nvlink: self.nvlink && self.node_of(src) == self.node_of(dst),
            rdma: self.rdma,
        }
    }
}

impl Default for LinkTopology {
    fn default() -> Self {
        Self::new(8)
    }
}
