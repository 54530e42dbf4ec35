//! Requests and results of the buffer operations.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use crate::{
    config::Config,
    error::{Result, usage_error},
    event::EventHandle,
    handle::CommHandle,
    layout::RoutingPlan,
    payload::{TokenPayload, TopkSelection},
    placement::PlacementStrategy,
    tensor::Matrix,
};

/// Normal-mode dispatch. Either `layout` (fresh routing) or `handle`
/// (cached routing) must be set, never both.
#[derive(Clone, Debug)]
pub struct DispatchRequest {
    pub x: TokenPayload,
    pub layout: Option<RoutingPlan>,
    pub topk: Option<TopkSelection>,
    pub handle: Option<CommHandle>,
    /// Per-expert receive counts are rounded up to this multiple.
    pub expert_alignment: usize,
    /// Pad the received tensors to this many rows; zero disables padding.
    pub num_worst_tokens: usize,
    pub config: Option<Config>,
    pub previous_event: Option<EventHandle>,
    pub async_finish: bool,
}

impl DispatchRequest {
    pub fn new(
        x: TokenPayload,
        layout: RoutingPlan,
        topk: Option<TopkSelection>,
    ) -> Self {
        Self {
            x,
            layout: Some(layout),
            topk,
            handle: None,
            expert_alignment: 1,
            num_worst_tokens: 0,
            config: None,
            previous_event: None,
            async_finish: false,
        }
    }

    pub fn cached(x: TokenPayload, handle: CommHandle) -> Self {
        Self {
            x,
            layout: None,
            topk: None,
            handle: Some(handle),
            expert_alignment: 1,
            num_worst_tokens: 0,
            config: None,
            previous_event: None,
            async_finish: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DispatchOutput {
    /// Received tokens, ordered by source rank, then source token index.
    pub recv_x: TokenPayload,
    /// Local expert index per selection, `-1` for experts owned elsewhere.
    pub recv_topk_idx: Option<Matrix<i64>>,
    /// Weight per selection, `0` for experts owned elsewhere.
    pub recv_topk_weights: Option<Matrix<f32>>,
    /// Tokens per local expert; empty for cached dispatches and padded
    /// outputs.
    pub num_recv_tokens_per_expert: Vec<usize>,
    pub handle: CommHandle,
}

/// Normal-mode combine of tokens received by the dispatch that produced
/// `handle`.
#[derive(Clone, Debug)]
pub struct CombineRequest {
    pub x: Matrix<f32>,
    pub handle: CommHandle,
    pub topk_weights: Option<Matrix<f32>>,
    pub config: Option<Config>,
    pub previous_event: Option<EventHandle>,
    pub async_finish: bool,
}

impl CombineRequest {
    pub fn new(
        x: Matrix<f32>,
        handle: CommHandle,
        topk_weights: Option<Matrix<f32>>,
    ) -> Self {
        Self {
            x,
            handle,
            topk_weights,
            config: None,
            previous_event: None,
            async_finish: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CombineOutput {
    pub combined_x: Matrix<f32>,
    pub combined_topk_weights: Option<Matrix<f32>>,
}

/// Cumulative per-local-expert receive counts across low-latency dispatches.
#[derive(Debug)]
pub struct ExpertLoadCounter {
    counts: Vec<AtomicU64>,
}

impl ExpertLoadCounter {
    pub fn new(num_local_experts: usize) -> Self {
        Self { counts: (0..num_local_experts).map(|_| AtomicU64::new(0)).collect() }
    }

    pub fn num_local_experts(&self) -> usize {
        self.counts.len()
    }

    pub(crate) fn add(&self, local_expert: usize, count: usize) {
        self.counts[local_expert].fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Vec<u64> {
        self.counts.iter().map(|c| c.load(Ordering::Relaxed)).collect()
    }

    pub fn reset(&self) {
        self.counts.iter().for_each(|c| c.store(0, Ordering::Relaxed));
    }
}

#[derive(Clone, Debug)]
pub struct LowLatencyDispatchRequest {
    pub x: Matrix<f32>,
    pub topk_idx: Matrix<i64>,
    pub num_max_dispatch_tokens_per_rank: usize,
    pub num_experts: usize,
    pub placement: PlacementStrategy,
    pub use_fp8: bool,
    /// Round FP8 scales up to powers of two.
    pub round_scale: bool,
    /// Send the rounded scales as packed UE8M0 exponents; needs `use_fp8`
    /// and `round_scale`.
    pub use_ue8m0: bool,
    pub cumulative_local_expert_recv_stats: Option<Arc<ExpertLoadCounter>>,
    pub async_finish: bool,
    pub return_recv_hook: bool,
}

impl LowLatencyDispatchRequest {
    pub fn new(
        x: Matrix<f32>,
        topk_idx: Matrix<i64>,
        num_max_dispatch_tokens_per_rank: usize,
        num_experts: usize,
    ) -> Self {
        Self {
            x,
            topk_idx,
            num_max_dispatch_tokens_per_rank,
            num_experts,
            placement: PlacementStrategy::default(),
            use_fp8: false,
            round_scale: false,
            use_ue8m0: false,
            cumulative_local_expert_recv_stats: None,
            async_finish: false,
            return_recv_hook: false,
        }
    }
}

#[derive(Debug)]
pub struct LowLatencyDispatchOutput {
    /// Per local expert, `[num_ranks * max_tokens, hidden]` rows of which the
    /// first `recv_count[e]` are valid.
    pub recv_x: Vec<TokenPayload>,
    pub recv_count: Vec<usize>,
    pub handle: CommHandle,
    pub lease: SlotLease,
}

#[derive(Clone, Debug)]
pub struct LowLatencyCombineRequest {
    /// Per local expert, rows laid out like the dispatch's `recv_x`. Empty
    /// with `zero_copy`.
    pub x: Vec<Matrix<f32>>,
    pub topk_idx: Matrix<i64>,
    pub topk_weights: Matrix<f32>,
    pub handle: CommHandle,
    /// Send the rows already written through
    /// `Buffer::with_next_low_latency_combine_buffer` instead of `x`.
    pub zero_copy: bool,
    pub async_finish: bool,
    pub return_recv_hook: bool,
    /// Destination of the combined tokens, `[num_tokens, hidden]`; its
    /// previous contents are overwritten.
    pub out: Option<Matrix<f32>>,
}

impl LowLatencyCombineRequest {
    pub fn new(
        x: Vec<Matrix<f32>>,
        topk_idx: Matrix<i64>,
        topk_weights: Matrix<f32>,
        handle: CommHandle,
    ) -> Self {
        Self {
            x,
            topk_idx,
            topk_weights,
            handle,
            zero_copy: false,
            async_finish: false,
            return_recv_hook: false,
            out: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct LowLatencyCombineOutput {
    pub combined_x: Matrix<f32>,
}

/// Exclusive use of one half of the low-latency region, released on drop.
#[derive(Debug)]
pub struct SlotLease {
    slots: Arc<[AtomicBool; 2]>,
    half: usize,
}

impl SlotLease {
    pub(crate) fn acquire(slots: &Arc<[AtomicBool; 2]>, half: usize) -> Result<Self> {
        if slots[half].swap(true, Ordering::AcqRel) {
            return Err(usage_error!(
                "low-latency buffer half {} is still held by a previous result; \
                 at most two low-latency results may be alive",
                half
            ));
        }
        Ok(Self { slots: slots.clone(), half })
    }

    pub fn half(&self) -> usize {
        self.half
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        self.slots[self.half].store(false, Ordering::Release);
    }
}
