use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::{EpError, Result};

/// Maximum number of NVLink-connected ranks on one node.
pub const NUM_MAX_NVL_PEERS: usize = 8;

/// Transport path of a dispatch/combine pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportMode {
    /// Every rank is on one node; NVLink only.
    Intranode,
    /// Several nodes; RDMA to the destination node, then NVLink fan-out.
    Internode,
    /// RDMA only, statically sized per-(expert, source rank) slots.
    LowLatency,
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportMode::Intranode => write!(f, "intranode"),
            TransportMode::Internode => write!(f, "internode"),
            TransportMode::LowLatency => write!(f, "low-latency"),
        }
    }
}

/// Position of one rank in the group.
///
/// Ranks are packed onto nodes of [`NUM_MAX_NVL_PEERS`]; the "RDMA rank" is
/// the node index and the "NVL rank" the slot within the node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankTopology {
    pub rank: usize,
    pub num_ranks: usize,
    pub num_nvl_peers: usize,
    pub nvl_rank: usize,
    pub rdma_rank: usize,
    pub num_rdma_ranks: usize,
}

impl RankTopology {
    pub fn resolve(rank: usize, num_ranks: usize) -> Result<Self> {
        if num_ranks == 0 || rank >= num_ranks {
            return Err(EpError::Topology(format!(
                "rank {rank} is not part of a group of {num_ranks}"
            )));
        }
        Ok(Self {
            rank,
            num_ranks,
            num_nvl_peers: num_ranks.min(NUM_MAX_NVL_PEERS),
            nvl_rank: rank % NUM_MAX_NVL_PEERS,
            rdma_rank: rank / NUM_MAX_NVL_PEERS,
            num_rdma_ranks: (num_ranks / NUM_MAX_NVL_PEERS).max(1),
        })
    }

    /// Whether every node holds [`NUM_MAX_NVL_PEERS`] ranks, or the group
    /// fits on one node.
    pub fn has_full_nodes(&self) -> bool {
        self.num_ranks <= NUM_MAX_NVL_PEERS
            || self.num_ranks.is_multiple_of(NUM_MAX_NVL_PEERS)
    }

    pub fn is_internode(&self) -> bool {
        self.num_rdma_ranks > 1
    }

    /// Transport used by dispatch/combine calls that are not low-latency.
    pub fn normal_mode(&self) -> TransportMode {
        if self.is_internode() {
            TransportMode::Internode
        } else {
            TransportMode::Intranode
        }
    }

    pub fn rdma_rank_of(&self, rank: usize) -> usize {
        rank / NUM_MAX_NVL_PEERS
    }

    pub fn nvl_rank_of(&self, rank: usize) -> usize {
        rank % NUM_MAX_NVL_PEERS
    }

    pub fn global_rank(&self, rdma_rank: usize, nvl_rank: usize) -> usize {
        rdma_rank * NUM_MAX_NVL_PEERS + nvl_rank
    }

    /// Global ranks on the local node.
    pub fn node_peers(&self) -> Range<usize> {
        let first = self.rdma_rank * NUM_MAX_NVL_PEERS;
        first..first + self.num_nvl_peers
    }

    /// Global ranks holding the local NVL slot on every node, local rank included.
    pub fn same_slot_peers(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.num_rdma_ranks)
            .map(|rdma_rank| self.global_rank(rdma_rank, self.nvl_rank))
    }
}
