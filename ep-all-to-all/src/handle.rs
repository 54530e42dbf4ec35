use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    error::{EpError, Result, ensure_usage},
    placement::ExpertPlacement,
    tensor::Matrix,
    topology::TransportMode,
};

/// Origin of a received token and its slot on the previous hop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMeta {
    pub src_rank: usize,
    pub src_token_idx: usize,
    /// Where the combine direction writes this token on the previous hop.
    pub slot: usize,
}

/// Routing state of a single-node dispatch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntranodeHandle {
    pub num_ranks: usize,
    pub num_tokens: usize,
    pub num_recv_tokens: usize,
    /// `[src][dst]`: tokens sent to `dst` by ranks `0..=src`.
    pub rank_prefix_matrix: Matrix<usize>,
    /// `[dst][channel]`: local tokens sent to `dst` by channels `0..=channel`.
    pub channel_prefix_matrix: Matrix<usize>,
    /// `[src][channel]`: first receive row of `channel` from `src`.
    pub recv_channel_prefix_matrix: Matrix<usize>,
    /// Source token index of every received row.
    pub recv_src_idx: Vec<usize>,
    pub is_token_in_rank: Matrix<bool>,
    /// `[token][dst]`: position among the tokens sent to `dst`, or `-1`.
    pub send_head: Matrix<i64>,
}

impl IntranodeHandle {
    pub(crate) fn count(&self, src: usize, dst: usize) -> usize {
        let upto = self.rank_prefix_matrix.get(src, dst);
        if src == 0 { upto } else { upto - self.rank_prefix_matrix.get(src - 1, dst) }
    }

    /// First receive row of `src` on `dst`.
    pub(crate) fn recv_offset(&self, src: usize, dst: usize) -> usize {
        if src == 0 { 0 } else { self.rank_prefix_matrix.get(src - 1, dst) }
    }

    /// Tokens of `src` sent to ranks below `dst`.
    pub(crate) fn send_offset(&self, src: usize, dst: usize) -> usize {
        (0..dst).map(|d| self.count(src, d)).sum()
    }

    pub(crate) fn num_sent(&self, src: usize) -> usize {
        self.send_offset(src, self.num_ranks)
    }
}

/// Routing state of a two-hop (RDMA, then NVLink) dispatch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InternodeHandle {
    pub num_ranks: usize,
    pub num_rdma_ranks: usize,
    pub num_tokens: usize,
    pub num_recv_tokens: usize,
    pub is_token_in_rank: Matrix<bool>,
    /// `[src][dst]` token counts of the whole group.
    pub num_tokens_per_rank_matrix: Matrix<usize>,
    /// `[src][node]` token counts of the whole group.
    pub num_tokens_per_rdma_rank_matrix: Matrix<usize>,
    /// `[node][channel]`: local tokens sent to `node` by channels `0..=channel`.
    pub rdma_channel_prefix_matrix: Matrix<usize>,
    /// `[dst][channel]`: local tokens sent to `dst` by channels `0..=channel`.
    pub gbl_channel_prefix_matrix: Matrix<usize>,
    /// `[src node][channel]`: forwarded tokens of `src node` in channels `0..=channel`.
    pub recv_rdma_channel_prefix_matrix: Matrix<usize>,
    /// Forwarded tokens received from nodes `0..=node`.
    pub recv_rdma_rank_prefix_sum: Vec<usize>,
    /// `[src][channel]`: received tokens of `src` in channels `0..=channel`.
    pub recv_gbl_channel_prefix_matrix: Matrix<usize>,
    /// Tokens received from ranks `0..=src`.
    pub recv_gbl_rank_prefix_sum: Vec<usize>,
    /// Per received token; `slot` is the row on the forwarding rank.
    pub recv_src_meta: Vec<SourceMeta>,
    /// Per forwarded token; `slot` is the row in the source's send order to
    /// this node.
    pub rdma_recv_src_meta: Vec<SourceMeta>,
    /// `[token][node]`: position among the tokens sent to `node`, or `-1`.
    pub send_rdma_head: Matrix<i64>,
    /// `[forwarded token][nvl rank]`: position among the tokens forwarded to
    /// that local rank, or `-1`.
    pub send_nvl_head: Matrix<i64>,
}

impl InternodeHandle {
    pub(crate) fn num_rdma_recv_tokens(&self) -> usize {
        self.rdma_recv_src_meta.len()
    }

    /// Tokens `src` sends to nodes below `node`.
    pub(crate) fn rdma_send_offset(&self, src: usize, node: usize) -> usize {
        self.num_tokens_per_rdma_rank_matrix.row(src)[..node].iter().sum()
    }

    pub(crate) fn num_rdma_sent(&self, src: usize) -> usize {
        self.num_tokens_per_rdma_rank_matrix.row(src).iter().sum()
    }
}

/// Routing state of a low-latency dispatch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LowLatencyHandle {
    pub num_ranks: usize,
    /// `[local expert][row]`: source token index of each packed row.
    pub packed_recv_src_info: Matrix<i32>,
    /// `[local expert][src]`: `count | (begin << 32)` of the rows from `src`.
    pub packed_recv_layout_range: Matrix<i64>,
    pub num_max_dispatch_tokens_per_rank: usize,
    pub hidden: usize,
    pub num_experts: usize,
    pub placement: ExpertPlacement,
}

impl LowLatencyHandle {
    pub fn unpack_range(range: i64) -> (usize, usize) {
        let count = (range & 0xffff_ffff) as usize;
        let begin = (range >> 32) as usize;
        (begin, count)
    }

    pub(crate) fn pack_range(begin: usize, count: usize) -> i64 {
        ((begin as i64) << 32) | count as i64
    }
}

/// Routing state returned by a dispatch and replayed by the combine and by
/// cached dispatches. Valid only for the group and batch that produced it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CommHandle {
    Intranode(Arc<IntranodeHandle>),
    Internode(Arc<InternodeHandle>),
    LowLatency(Arc<LowLatencyHandle>),
}

impl CommHandle {
    pub fn mode(&self) -> TransportMode {
        match self {
            CommHandle::Intranode(_) => TransportMode::Intranode,
            CommHandle::Internode(_) => TransportMode::Internode,
            CommHandle::LowLatency(_) => TransportMode::LowLatency,
        }
    }

    pub fn num_ranks(&self) -> usize {
        match self {
            CommHandle::Intranode(h) => h.num_ranks,
            CommHandle::Internode(h) => h.num_ranks,
            CommHandle::LowLatency(h) => h.num_ranks,
        }
    }

    /// Number of tokens of the dispatching batch; `None` for low-latency
    /// handles, whose batches vary up to the per-rank maximum.
    pub fn num_tokens(&self) -> Option<usize> {
        match self {
            CommHandle::Intranode(h) => Some(h.num_tokens),
            CommHandle::Internode(h) => Some(h.num_tokens),
            CommHandle::LowLatency(_) => None,
        }
    }

    pub fn num_recv_tokens(&self) -> usize {
        match self {
            CommHandle::Intranode(h) => h.num_recv_tokens,
            CommHandle::Internode(h) => h.num_recv_tokens,
            CommHandle::LowLatency(h) => {
                h.packed_recv_layout_range
                    .as_slice()
                    .iter()
                    .map(|range| LowLatencyHandle::unpack_range(*range).1)
                    .sum()
            }
        }
    }

    /// Reject reuse with another group size or transport.
    pub(crate) fn check_compatible(
        &self,
        mode: TransportMode,
        num_ranks: usize,
    ) -> Result<()> {
        ensure_usage!(
            self.mode() == mode,
            "a {} handle cannot be used for a {} transfer",
            self.mode(),
            mode
        );
        ensure_usage!(
            self.num_ranks() == num_ranks,
            "handle was created by a group of {} ranks, this group has {}",
            self.num_ranks(),
            num_ranks
        );
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard()).map_err(|e| {
            EpError::Serialization(format!("Failed to encode handle: {}", e))
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let config = bincode::config::standard();
        let (handle, _) = bincode::serde::decode_from_slice(bytes, config).map_err(|e| {
            EpError::Serialization(format!("Failed to decode handle: {}", e))
        })?;
        Ok(handle)
    }
}
