//! The communication buffer: regions, peers and the comm stream of one rank,
//! plus the public dispatch/combine entry points.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use fabric_lib::{GroupBootstrap, RdmaEngine, api::RegionKind};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    bootstrap::{PeerInfo, exchange_peer_info},
    config::{Config, ConfigSelector},
    context::{CommContext, ImmCounters, check_reachability},
    error::{EpError, Result, ensure_usage, usage_error},
    event::{EventHandle, PendingTransfer, Stream},
    handle::CommHandle,
    internode, intranode,
    layout::{RoutingPlan, compute_dispatch_layout},
    low_latency::{
        self, CombineSource, DispatchFormat, LowLatencyCombineBuffer, LowLatencyLayout,
    },
    ops::{
        CombineOutput, CombineRequest, DispatchOutput, DispatchRequest,
        LowLatencyCombineOutput, LowLatencyCombineRequest, LowLatencyDispatchOutput,
        LowLatencyDispatchRequest, SlotLease,
    },
    placement::{ExpertPlacement, PlacementStrategy},
    regions::RegisteredRegions,
    tensor::Matrix,
    topology::{NUM_MAX_NVL_PEERS, RankTopology, TransportMode},
};

const REGION_ALIGNMENT: usize = 128;

/// Construction options of a [`Buffer`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferOptions {
    /// Size of the NVLink region; zero disables it.
    pub num_nvl_bytes: usize,
    /// Size of the RDMA region; zero disables it.
    pub num_rdma_bytes: usize,
    pub low_latency_mode: bool,
    pub num_qps_per_rank: usize,
    /// Require [`Buffer::destroy`] instead of releasing on drop.
    pub explicitly_destroy: bool,
    /// Pin the comm stream worker to this CPU.
    pub comm_worker_cpu: Option<u16>,
    pub handshake_retry_delay_ms: u64,
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self {
            num_nvl_bytes: 0,
            num_rdma_bytes: 0,
            low_latency_mode: false,
            num_qps_per_rank: 1,
            explicitly_destroy: false,
            comm_worker_cpu: None,
            handshake_retry_delay_ms: 2000,
        }
    }
}

impl BufferOptions {
    fn validate(&self) -> Result<()> {
        let sizes = [
            ("num_nvl_bytes", self.num_nvl_bytes),
            ("num_rdma_bytes", self.num_rdma_bytes),
        ];
        for (name, bytes) in sizes {
            if !bytes.is_multiple_of(REGION_ALIGNMENT) {
                return Err(EpError::Configuration(format!(
                    "{name} must be a multiple of {REGION_ALIGNMENT}, got {bytes}"
                )));
            }
        }
        if self.low_latency_mode && self.num_rdma_bytes == 0 {
            return Err(EpError::Configuration(
                "low-latency mode needs an RDMA region".to_string(),
            ));
        }
        if self.num_qps_per_rank == 0 {
            return Err(EpError::Configuration(
                "num_qps_per_rank must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Expert-parallel communication buffer of one rank.
///
/// Every rank of the group creates one, and all ranks issue the same
/// sequence of collective operations.
pub struct Buffer {
    ctx: Arc<CommContext>,
    comm_stream: Option<Stream>,
    regions: RegisteredRegions,
    configs: Mutex<ConfigSelector>,
    options: BufferOptions,
    ll_op_count: AtomicUsize,
    ll_slots: Arc<[AtomicBool; 2]>,
}

impl Buffer {
    pub fn new(
        engine: Arc<dyn RdmaEngine>,
        bootstrap: &dyn GroupBootstrap,
        options: BufferOptions,
    ) -> Result<Self> {
        let topology = RankTopology::resolve(engine.rank(), engine.num_ranks())?;
        if !topology.has_full_nodes() {
            return Err(EpError::Topology(format!(
                "a multi-node group must be a multiple of {} ranks, got {}",
                NUM_MAX_NVL_PEERS, topology.num_ranks
            )));
        }
        options.validate()?;

        let regions = RegisteredRegions::register(
            engine.clone(),
            options.num_nvl_bytes,
            options.num_rdma_bytes,
        )?;
        let counters = ImmCounters::register(engine.as_ref());
        let local = PeerInfo {
            rank: topology.rank,
            address: engine.main_address(),
            nvl: regions.nvl.clone(),
            rdma: regions.rdma.clone(),
        };
        let retry_delay = Duration::from_millis(options.handshake_retry_delay_ms);
        let peers =
            exchange_peer_info(bootstrap, &local, topology.num_ranks, retry_delay)?;
        check_reachability(
            engine.as_ref(),
            &topology,
            regions.nvl.is_some(),
            options.low_latency_mode,
        )?;

        let low_latency_mode = options.low_latency_mode;
        let ctx = CommContext::new(engine, topology, peers, counters, low_latency_mode)?;
        let stream_name = format!("ep_comm_stream_{}", topology.rank);
        let comm_stream = Stream::spawn(&stream_name, options.comm_worker_cpu)?;
        info!(
            "Rank {}/{} buffer ready: node {}/{}, {} NVLink bytes, {} RDMA bytes, \
             low-latency: {}",
            topology.rank,
            topology.num_ranks,
            topology.rdma_rank,
            topology.num_rdma_ranks,
            options.num_nvl_bytes,
            options.num_rdma_bytes,
            options.low_latency_mode
        );
        Ok(Self {
            ctx: Arc::new(ctx),
            comm_stream: Some(comm_stream),
            regions,
            configs: Mutex::new(ConfigSelector::new()),
            options,
            ll_op_count: AtomicUsize::new(0),
            ll_slots: Arc::new([AtomicBool::new(false), AtomicBool::new(false)]),
        })
    }

    pub fn rank(&self) -> usize {
        self.ctx.topology.rank
    }

    pub fn num_ranks(&self) -> usize {
        self.ctx.topology.num_ranks
    }

    pub fn topology(&self) -> &RankTopology {
        &self.ctx.topology
    }

    pub fn options(&self) -> &BufferOptions {
        &self.options
    }

    /// Low-latency for low-latency buffers, otherwise the normal mode of
    /// the group.
    pub fn transport_mode(&self) -> TransportMode {
        if self.options.low_latency_mode {
            TransportMode::LowLatency
        } else {
            self.ctx.topology.normal_mode()
        }
    }

    /// Whether normal-mode traffic went through the RDMA region since the
    /// last [`Buffer::clean_low_latency_buffer`].
    pub fn is_low_latency_dirty(&self) -> bool {
        self.ctx.is_rdma_dirty()
    }

    fn stream(&self) -> Result<&Stream> {
        self.comm_stream.as_ref().ok_or_else(|| usage_error!("the buffer was destroyed"))
    }

    /// Record an event on the comm stream.
    pub fn capture(&self) -> Result<EventHandle> {
        self.stream()?.record()
    }

    pub fn set_num_sms(&self, num_sms: usize) -> Result<()> {
        self.configs.lock().set_num_sms(num_sms)
    }

    pub fn get_dispatch_config(&self) -> Result<Config> {
        self.configs.lock().dispatch(self.num_ranks())
    }

    pub fn get_combine_config(&self) -> Result<Config> {
        self.configs.lock().combine(self.num_ranks())
    }

    /// Run `f` over a read-only view of the local region.
    pub fn with_local_buffer<R>(
        &self,
        kind: RegionKind,
        offset: usize,
        len: usize,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<R> {
        self.stream()?;
        Ok(self.ctx.local_region(kind)?.with_slice(offset, len, f)?)
    }

    /// Submit `job` on the comm stream after `previous_event`.
    fn issue<T: Send + 'static>(
        &self,
        previous_event: Option<&EventHandle>,
        async_finish: bool,
        job: impl FnOnce(&CommContext) -> Result<T> + Send + 'static,
    ) -> Result<PendingTransfer<T>> {
        let stream = self.stream()?;
        if let Some(event) = previous_event {
            stream.wait_event(event)?;
        }
        let ctx = self.ctx.clone();
        let (result_tx, result_rx) = oneshot::channel();
        stream.submit(move || {
            let _ = result_tx.send(job(&ctx));
        })?;
        let event = stream.record()?;
        if !async_finish {
            event.synchronize();
        }
        Ok(PendingTransfer::issued(event, result_rx))
    }

    /// Submit a send phase and a receive phase; with `return_recv_hook` only
    /// the send phase is submitted and the call returns without waiting for
    /// it. The receive phase waits for [`PendingTransfer::await_completion`].
    fn issue_two_phase<T: Send + 'static>(
        &self,
        async_finish: bool,
        return_recv_hook: bool,
        send: impl FnOnce(&CommContext) -> Result<()> + Send + 'static,
        recv: impl FnOnce(&CommContext) -> Result<T> + Send + 'static,
    ) -> Result<PendingTransfer<T>> {
        if !return_recv_hook {
            return self.issue(None, async_finish, move |ctx| {
                send(ctx)?;
                recv(ctx)
            });
        }
        let stream = self.stream()?;
        let send_ctx = self.ctx.clone();
        let (send_tx, send_rx) = oneshot::channel();
        stream.submit(move || {
            let _ = send_tx.send(send(&send_ctx));
        })?;
        let event = stream.record()?;
        let ctx = self.ctx.clone();
        Ok(PendingTransfer::deferred(event, stream.queue().clone(), send_rx, move || {
            recv(&ctx)
        }))
    }

    /// Compute the routing plan of `topk_idx` on the comm stream.
    pub fn get_dispatch_layout(
        &self,
        topk_idx: Matrix<i64>,
        num_experts: usize,
        strategy: PlacementStrategy,
        previous_event: Option<EventHandle>,
        async_finish: bool,
    ) -> Result<PendingTransfer<RoutingPlan>> {
        let placement = ExpertPlacement::new(strategy, num_experts, self.num_ranks())?;
        let topology = self.ctx.topology;
        self.issue(previous_event.as_ref(), async_finish, move |_| {
            compute_dispatch_layout(&topk_idx, &placement, &topology)
        })
    }

    fn check_normal_regions(&self) -> Result<()> {
        ensure_usage!(
            self.ctx.has_region(RegionKind::Nvl),
            "normal-mode transfers need an NVLink region (num_nvl_bytes > 0)"
        );
        ensure_usage!(
            !self.ctx.topology.is_internode() || self.ctx.has_region(RegionKind::Rdma),
            "internode transfers need an RDMA region (num_rdma_bytes > 0)"
        );
        Ok(())
    }

    /// Send every token to the ranks owning its selected experts.
    ///
    /// Received tokens are ordered by source rank, then source token index.
    pub fn dispatch(
        &self,
        request: DispatchRequest,
    ) -> Result<PendingTransfer<DispatchOutput>> {
        self.stream()?;
        self.check_normal_regions()?;
        let DispatchRequest {
            x,
            layout,
            topk,
            handle,
            expert_alignment,
            num_worst_tokens,
            config,
            previous_event,
            async_finish,
        } = request;
        let num_ranks = self.num_ranks();
        let mode = self.ctx.topology.normal_mode();
        let config = match config {
            Some(config) => config,
            None => self.get_dispatch_config()?,
        };
        ensure_usage!(expert_alignment > 0, "expert_alignment must be positive");

        if let Some(handle) = handle {
            ensure_usage!(
                layout.is_none() && topk.is_none(),
                "a cached dispatch takes neither a layout nor top-k selections"
            );
            ensure_usage!(
                num_worst_tokens == 0,
                "num_worst_tokens applies to dispatches computing a new handle"
            );
            handle.check_compatible(mode, num_ranks)?;
            ensure_usage!(
                handle.num_tokens() == Some(x.num_tokens()),
                "handle was created for {:?} tokens, got {}",
                handle.num_tokens(),
                x.num_tokens()
            );
            return match handle {
                CommHandle::Intranode(handle) => {
                    self.issue(previous_event.as_ref(), async_finish, move |ctx| {
                        intranode::cached_dispatch(ctx, &config, &x, &handle)
                    })
                }
                CommHandle::Internode(handle) => {
                    self.issue(previous_event.as_ref(), async_finish, move |ctx| {
                        internode::cached_dispatch(ctx, &config, &x, &handle)
                    })
                }
                CommHandle::LowLatency(_) => Err(usage_error!(
                    "a low-latency handle cannot be used for a dispatch"
                )),
            };
        }

        let Some(plan) = layout else {
            return Err(usage_error!("a dispatch needs either a layout or a handle"));
        };
        ensure_usage!(
            plan.num_ranks() == num_ranks,
            "layout covers {} ranks but the group has {}",
            plan.num_ranks(),
            num_ranks
        );
        ensure_usage!(
            plan.num_tokens() == x.num_tokens(),
            "layout covers {} tokens but x has {}",
            plan.num_tokens(),
            x.num_tokens()
        );
        if let Some(topk) = &topk {
            ensure_usage!(
                topk.num_tokens() == x.num_tokens(),
                "top-k selections cover {} tokens but x has {}",
                topk.num_tokens(),
                x.num_tokens()
            );
        }
        if mode == TransportMode::Internode {
            ensure_usage!(
                num_worst_tokens == 0,
                "num_worst_tokens is only supported by intranode dispatches"
            );
            return self.issue(previous_event.as_ref(), async_finish, move |ctx| {
                let topk = topk.as_ref();
                internode::dispatch(ctx, &config, &x, &plan, topk, expert_alignment)
            });
        }
        self.issue(previous_event.as_ref(), async_finish, move |ctx| {
            intranode::dispatch(
                ctx,
                &config,
                &x,
                &plan,
                topk.as_ref(),
                expert_alignment,
                num_worst_tokens,
            )
        })
    }

    /// Reduce the tokens received by a dispatch back onto their sources.
    pub fn combine(
        &self,
        request: CombineRequest,
    ) -> Result<PendingTransfer<CombineOutput>> {
        self.stream()?;
        self.check_normal_regions()?;
        let CombineRequest {
            x,
            handle,
            topk_weights,
            config,
            previous_event,
            async_finish,
        } = request;
        handle.check_compatible(self.ctx.topology.normal_mode(), self.num_ranks())?;
        let num_recv_tokens = handle.num_recv_tokens();
        ensure_usage!(
            x.rows() >= num_recv_tokens,
            "combine input has {} rows, the dispatch received {} tokens",
            x.rows(),
            num_recv_tokens
        );
        if let Some(weights) = &topk_weights {
            ensure_usage!(
                weights.rows() >= num_recv_tokens,
                "combine weights have {} rows, the dispatch received {} tokens",
                weights.rows(),
                num_recv_tokens
            );
        }
        let config = match config {
            Some(config) => config,
            None => self.get_combine_config()?,
        };
        match handle {
            CommHandle::Intranode(handle) => {
                self.issue(previous_event.as_ref(), async_finish, move |ctx| {
                    intranode::combine(ctx, &config, &x, topk_weights.as_ref(), &handle)
                })
            }
            CommHandle::Internode(handle) => {
                self.issue(previous_event.as_ref(), async_finish, move |ctx| {
                    internode::combine(ctx, &config, &x, topk_weights.as_ref(), &handle)
                })
            }
            CommHandle::LowLatency(_) => {
                Err(usage_error!("a low-latency handle cannot be used for a combine"))
            }
        }
    }

    pub fn get_low_latency_rdma_size_hint(
        num_max_dispatch_tokens_per_rank: usize,
        hidden: usize,
        num_ranks: usize,
        num_experts: usize,
    ) -> usize {
        let num_max_tokens = num_max_dispatch_tokens_per_rank;
        LowLatencyLayout::new(num_max_tokens, hidden, num_ranks, num_experts).size_hint()
    }

    fn check_low_latency_capacity(&self, layout: &LowLatencyLayout) -> Result<()> {
        self.stream()?;
        ensure_usage!(
            self.options.low_latency_mode,
            "low-latency operations need a buffer created with low_latency_mode"
        );
        let needed = layout.size_hint();
        let capacity = |rank| self.ctx.peer_capacity(rank, RegionKind::Rdma);
        if let Some(rank) = (0..self.num_ranks()).find(|&rank| capacity(rank) < needed) {
            return Err(EpError::Capacity(format!(
                "low-latency buffer needs {} RDMA bytes, rank {} has {}",
                needed,
                rank,
                capacity(rank)
            )));
        }
        Ok(())
    }

    /// Checks shared by the low-latency operations; returns the lease of
    /// the half the operation runs on.
    fn begin_low_latency(
        &self,
        layout: &LowLatencyLayout,
        async_finish: bool,
        return_recv_hook: bool,
    ) -> Result<SlotLease> {
        ensure_usage!(
            !(async_finish && return_recv_hook),
            "async_finish and return_recv_hook cannot be combined"
        );
        self.check_low_latency_capacity(layout)?;
        if self.ctx.is_rdma_dirty() {
            warn!(
                "Rank {}: low-latency operation on an RDMA region used by normal-mode \
                 transfers; call clean_low_latency_buffer first",
                self.rank()
            );
        }
        let half = self.ll_op_count.load(Ordering::Acquire) % 2;
        let lease = SlotLease::acquire(&self.ll_slots, half)?;
        self.ll_op_count.fetch_add(1, Ordering::AcqRel);
        Ok(lease)
    }

    fn check_selections(&self, topk_idx: &Matrix<i64>, num_experts: usize) -> Result<()> {
        let invalid =
            topk_idx.as_slice().iter().find(|&&e| e < -1 || e >= num_experts as i64);
        if let Some(selection) = invalid {
            return Err(usage_error!(
                "expert selection {} is outside [0, {})",
                selection,
                num_experts
            ));
        }
        Ok(())
    }

    /// Send each token straight to the slots of its selected experts.
    pub fn low_latency_dispatch(
        &self,
        request: LowLatencyDispatchRequest,
    ) -> Result<PendingTransfer<LowLatencyDispatchOutput>> {
        let LowLatencyDispatchRequest {
            x,
            topk_idx,
            num_max_dispatch_tokens_per_rank,
            num_experts,
            placement,
            use_fp8,
            round_scale,
            use_ue8m0,
            cumulative_local_expert_recv_stats: stats,
            async_finish,
            return_recv_hook,
        } = request;
        let num_ranks = self.num_ranks();
        let placement = ExpertPlacement::new(placement, num_experts, num_ranks)?;
        let format = DispatchFormat::new(use_fp8, round_scale, use_ue8m0)?;
        ensure_usage!(
            x.rows() <= num_max_dispatch_tokens_per_rank,
            "{} tokens exceed num_max_dispatch_tokens_per_rank = {}",
            x.rows(),
            num_max_dispatch_tokens_per_rank
        );
        ensure_usage!(
            topk_idx.rows() == x.rows(),
            "top-k selections cover {} tokens but x has {}",
            topk_idx.rows(),
            x.rows()
        );
        self.check_selections(&topk_idx, num_experts)?;
        if let Some(stats) = &stats {
            ensure_usage!(
                stats.num_local_experts() == placement.num_local_experts(),
                "expert statistics track {} experts, this rank owns {}",
                stats.num_local_experts(),
                placement.num_local_experts()
            );
        }
        let layout = LowLatencyLayout::new(
            num_max_dispatch_tokens_per_rank,
            x.cols(),
            num_ranks,
            num_experts,
        );
        let lease = self.begin_low_latency(&layout, async_finish, return_recv_hook)?;
        let half = lease.half();
        self.issue_two_phase(
            async_finish,
            return_recv_hook,
            move |ctx| {
                low_latency::send_dispatch(
                    ctx,
                    &layout,
                    half,
                    &x,
                    &topk_idx,
                    &placement,
                    format,
                )
            },
            move |ctx| {
                let received = low_latency::recv_dispatch(
                    ctx,
                    &layout,
                    half,
                    &placement,
                    format,
                    stats.as_deref(),
                )?;
                Ok(LowLatencyDispatchOutput {
                    recv_x: received.recv_x,
                    recv_count: received.recv_count,
                    handle: CommHandle::LowLatency(Arc::new(received.handle)),
                    lease,
                })
            },
        )
    }

    /// Send expert outputs back to their sources and reduce them there with
    /// the selection weights.
    pub fn low_latency_combine(
        &self,
        request: LowLatencyCombineRequest,
    ) -> Result<PendingTransfer<LowLatencyCombineOutput>> {
        let LowLatencyCombineRequest {
            x,
            topk_idx,
            topk_weights,
            handle,
            zero_copy,
            async_finish,
            return_recv_hook,
            out,
        } = request;
        let num_ranks = self.num_ranks();
        handle.check_compatible(TransportMode::LowLatency, num_ranks)?;
        let CommHandle::LowLatency(handle) = handle else {
            return Err(usage_error!("low-latency combine needs a low-latency handle"));
        };
        let num_max_tokens = handle.num_max_dispatch_tokens_per_rank;
        if zero_copy {
            ensure_usage!(
                x.is_empty(),
                "a zero-copy combine sends the combine buffer; x must be empty"
            );
        } else {
            ensure_usage!(
                x.len() == handle.placement.num_local_experts(),
                "combine input has {} experts, this rank owns {}",
                x.len(),
                handle.placement.num_local_experts()
            );
        }
        for expert_x in &x {
            ensure_usage!(
                expert_x.shape() == (num_ranks * num_max_tokens, handle.hidden),
                "expert output of shape {:?} does not match the dispatch ({}, {})",
                expert_x.shape(),
                num_ranks * num_max_tokens,
                handle.hidden
            );
        }
        if let Some(out) = &out {
            ensure_usage!(
                out.shape() == (topk_idx.rows(), handle.hidden),
                "combine output of shape {:?} does not match ({}, {})",
                out.shape(),
                topk_idx.rows(),
                handle.hidden
            );
        }
        ensure_usage!(
            topk_idx.rows() <= num_max_tokens,
            "{} tokens exceed num_max_dispatch_tokens_per_rank = {}",
            topk_idx.rows(),
            num_max_tokens
        );
        ensure_usage!(
            topk_weights.shape() == topk_idx.shape(),
            "top-k weights of shape {:?} do not match the selections {:?}",
            topk_weights.shape(),
            topk_idx.shape()
        );
        self.check_selections(&topk_idx, handle.num_experts)?;

        let (hidden, num_experts) = (handle.hidden, handle.num_experts);
        let layout =
            LowLatencyLayout::new(num_max_tokens, hidden, num_ranks, num_experts);
        let lease = self.begin_low_latency(&layout, async_finish, return_recv_hook)?;
        let half = lease.half();
        self.issue_two_phase(
            async_finish,
            return_recv_hook,
            move |ctx| {
                let source = match zero_copy {
                    true => CombineSource::Staged,
                    false => CombineSource::Rows(&x),
                };
                low_latency::send_combine(ctx, &layout, half, source, &handle)
            },
            move |ctx| {
                let (idx, weights) = (&topk_idx, &topk_weights);
                let combined_x =
                    low_latency::recv_combine(ctx, &layout, half, idx, weights, out)?;
                drop(lease);
                Ok(LowLatencyCombineOutput { combined_x })
            },
        )
    }

    /// Run `f` over the rows the next low-latency combine sends when its
    /// request sets `zero_copy`. Transfers into this rank wait until `f`
    /// returns, so `f` must not call into the buffer.
    pub fn with_next_low_latency_combine_buffer<R>(
        &self,
        handle: &CommHandle,
        f: impl FnOnce(&mut LowLatencyCombineBuffer<'_>) -> R,
    ) -> Result<R> {
        handle.check_compatible(TransportMode::LowLatency, self.num_ranks())?;
        let CommHandle::LowLatency(handle) = handle else {
            return Err(usage_error!("the combine buffer needs a low-latency handle"));
        };
        let layout = LowLatencyLayout::new(
            handle.num_max_dispatch_tokens_per_rank,
            handle.hidden,
            self.num_ranks(),
            handle.num_experts,
        );
        self.check_low_latency_capacity(&layout)?;
        let half = self.ll_op_count.load(Ordering::Acquire) % 2;
        ensure_usage!(
            !self.ll_slots[half].load(Ordering::Acquire),
            "low-latency buffer half {} is still held by a previous result",
            half
        );
        let (offset, len) = layout.combine_send_range(half);
        let num_local_experts = handle.placement.num_local_experts();
        let region = self.ctx.local_region(RegionKind::Rdma)?;
        Ok(region.with_slice_mut(offset, len, |bytes| {
            f(&mut LowLatencyCombineBuffer::new(bytes, &layout, num_local_experts))
        })?)
    }

    /// Collectively zero the low-latency region and clear the dirty flag.
    pub fn clean_low_latency_buffer(
        &self,
        num_max_dispatch_tokens_per_rank: usize,
        hidden: usize,
        num_experts: usize,
    ) -> Result<()> {
        ensure_usage!(
            self.ctx.has_region(RegionKind::Rdma),
            "cleaning the low-latency buffer needs an RDMA region"
        );
        let layout = LowLatencyLayout::new(
            num_max_dispatch_tokens_per_rank,
            hidden,
            self.num_ranks(),
            num_experts,
        );
        self.issue(None, false, move |ctx| low_latency::clean(ctx, &layout))?
            .await_completion()
    }

    /// Release the buffer; only valid with `explicitly_destroy`.
    pub fn destroy(&mut self) -> Result<()> {
        ensure_usage!(
            self.options.explicitly_destroy,
            "destroy() needs a buffer created with explicitly_destroy"
        );
        ensure_usage!(self.comm_stream.is_some(), "the buffer was already destroyed");
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if let Some(stream) = self.comm_stream.take() {
            stream.synchronize()?;
        }
        self.regions.release()?;
        info!("Rank {} released its buffer", self.rank());
        Ok(())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if self.comm_stream.is_none() {
            return;
        }
        if self.options.explicitly_destroy {
            warn!("Rank {}: buffer dropped without destroy()", self.rank());
        }
        if let Err(e) = self.release() {
            warn!("Rank {} failed to release its buffer: {}", self.rank(), e);
        }
    }
}
