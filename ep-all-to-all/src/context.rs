//! Per-rank communication state shared by the transport paths.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use bytes::Bytes;
use fabric_lib::{
    HostRegion, RdmaEngine,
    api::{
        BarrierTransferRequest, ImmCounter, ImmTransferRequest, MemoryRegionDescriptor,
        RegionKind, ScatterTarget, ScatterTransferRequest, SingleTransferRequest,
        TransferRequest,
    },
};
use tracing::{debug, warn};

use crate::{
    bootstrap::PeerInfo,
    error::{EpError, Result, usage_error},
    topology::RankTopology,
};

const IMM_BASE: u32 = 0x4550_0000;

/// Immediate values counted by every rank, one per protocol phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum ImmKind {
    NotifyNvl,
    NotifyRdma,
    DispatchNvl,
    DispatchRdma,
    CombineNvl,
    CombineRdma,
    BarrierNvl,
    BarrierRdma,
}

impl ImmKind {
    const ALL: [ImmKind; 8] = [
        ImmKind::NotifyNvl,
        ImmKind::NotifyRdma,
        ImmKind::DispatchNvl,
        ImmKind::DispatchRdma,
        ImmKind::CombineNvl,
        ImmKind::CombineRdma,
        ImmKind::BarrierNvl,
        ImmKind::BarrierRdma,
    ];

    pub fn imm(self) -> u32 {
        IMM_BASE + self as u32
    }
}

pub(crate) struct ImmCounters {
    counters: Vec<ImmCounter>,
}

impl ImmCounters {
    /// Register every counter; must happen before peers learn our address.
    pub fn register(engine: &dyn RdmaEngine) -> Self {
        let counters =
            ImmKind::ALL.iter().map(|kind| engine.get_imm_counter(kind.imm())).collect();
        Self { counters }
    }

    pub fn get(&self, kind: ImmKind) -> &ImmCounter {
        &self.counters[kind as usize]
    }
}

/// Everything a transfer needs: the engine, the peers' region descriptors
/// and the local regions.
pub(crate) struct CommContext {
    pub engine: Arc<dyn RdmaEngine>,
    pub topology: RankTopology,
    pub peers: Vec<PeerInfo>,
    pub low_latency_mode: bool,
    nvl: Option<Arc<HostRegion>>,
    rdma: Option<Arc<HostRegion>>,
    counters: ImmCounters,
    rdma_dirty: AtomicBool,
}

impl CommContext {
    pub fn new(
        engine: Arc<dyn RdmaEngine>,
        topology: RankTopology,
        peers: Vec<PeerInfo>,
        counters: ImmCounters,
        low_latency_mode: bool,
    ) -> Result<Self> {
        let local = &peers[topology.rank];
        let nvl = match local.nvl {
            Some(_) => Some(engine.local_region(RegionKind::Nvl)?),
            None => None,
        };
        let rdma = match local.rdma {
            Some(_) => Some(engine.local_region(RegionKind::Rdma)?),
            None => None,
        };
        Ok(Self {
            engine,
            topology,
            peers,
            low_latency_mode,
            nvl,
            rdma,
            counters,
            rdma_dirty: AtomicBool::new(false),
        })
    }

    pub fn rank(&self) -> usize {
        self.topology.rank
    }

    pub fn local_region(&self, kind: RegionKind) -> Result<&Arc<HostRegion>> {
        let region = match kind {
            RegionKind::Nvl => self.nvl.as_ref(),
            RegionKind::Rdma => self.rdma.as_ref(),
        };
        region.ok_or_else(|| usage_error!("this buffer has no {} region", kind))
    }

    pub fn has_region(&self, kind: RegionKind) -> bool {
        self.local_region(kind).is_ok()
    }

    pub fn peer_region(
        &self,
        rank: usize,
        kind: RegionKind,
    ) -> Result<&MemoryRegionDescriptor> {
        self.peers
            .get(rank)
            .and_then(|peer| peer.region(kind))
            .ok_or_else(|| usage_error!("rank {} has no {} region", rank, kind))
    }

    /// Capacity of `kind` on `rank` as published at startup.
    pub fn peer_capacity(&self, rank: usize, kind: RegionKind) -> usize {
        self.peer_region(rank, kind).map(|mr| mr.len as usize).unwrap_or(0)
    }

    pub fn write(
        &self,
        dst: usize,
        kind: RegionKind,
        offset: usize,
        payload: Bytes,
        imm: Option<ImmKind>,
    ) -> Result<()> {
        let request = SingleTransferRequest {
            payload,
            imm_data: imm.map(ImmKind::imm),
            dst_mr: self.peer_region(dst, kind)?.clone(),
            dst_offset: offset as u64,
        };
        Ok(self.engine.submit_transfer(TransferRequest::Single(request))?)
    }

    /// Write `bytes` of `stride`-sized records starting at `offset`, at most
    /// `chunk_records` records per transfer.
    pub fn write_chunked(
        &self,
        dst: usize,
        kind: RegionKind,
        offset: usize,
        bytes: Bytes,
        stride: usize,
        chunk_records: usize,
    ) -> Result<()> {
        let chunk_bytes = stride * chunk_records.max(1);
        let mut begin = 0;
        while begin < bytes.len() {
            let end = (begin + chunk_bytes).min(bytes.len());
            self.write(dst, kind, offset + begin, bytes.slice(begin..end), None)?;
            begin = end;
        }
        Ok(())
    }

    /// Scattered writes to one destination region, without immediate.
    pub fn scatter(
        &self,
        dst: usize,
        kind: RegionKind,
        writes: Vec<(usize, Bytes)>,
    ) -> Result<()> {
        if writes.is_empty() {
            return Ok(());
        }
        let dst_mr = self.peer_region(dst, kind)?;
        let dsts = writes
            .into_iter()
            .map(|(offset, payload)| ScatterTarget {
                dst_mr: dst_mr.clone(),
                dst_offset: offset as u64,
                payload,
            })
            .collect();
        let request = ScatterTransferRequest { dsts: Arc::new(dsts), imm_data: None };
        Ok(self.engine.submit_transfer(TransferRequest::Scatter(request))?)
    }

    pub fn signal(&self, dst: usize, kind: RegionKind, imm: ImmKind) -> Result<()> {
        let dst_mr = self.peer_region(dst, kind)?.clone();
        let request = ImmTransferRequest { imm_data: imm.imm(), dst_mr };
        Ok(self.engine.submit_transfer(TransferRequest::Imm(request))?)
    }

    pub fn signal_all(
        &self,
        dsts: impl IntoIterator<Item = usize>,
        kind: RegionKind,
        imm: ImmKind,
    ) -> Result<()> {
        let dst_mrs = dsts
            .into_iter()
            .map(|dst| self.peer_region(dst, kind).cloned())
            .collect::<Result<Vec<_>>>()?;
        let request = BarrierTransferRequest { imm_data: imm.imm(), dst_mrs };
        Ok(self.engine.submit_transfer(TransferRequest::Barrier(request))?)
    }

    /// Block until `count` immediates of `kind` arrived.
    pub fn wait(&self, kind: ImmKind, count: usize) {
        self.counters.get(kind).wait(count as u32);
    }

    /// Group-wide barrier over the links the buffer uses.
    pub fn barrier(&self) -> Result<()> {
        let topo = &self.topology;
        if self.low_latency_mode || !self.has_region(RegionKind::Nvl) {
            self.signal_all(0..topo.num_ranks, RegionKind::Rdma, ImmKind::BarrierRdma)?;
            self.wait(ImmKind::BarrierRdma, topo.num_ranks);
            return Ok(());
        }
        self.signal_all(topo.node_peers(), RegionKind::Nvl, ImmKind::BarrierNvl)?;
        self.wait(ImmKind::BarrierNvl, topo.num_nvl_peers);
        if topo.is_internode() {
            let same_slot: Vec<usize> = topo.same_slot_peers().collect();
            self.signal_all(same_slot, RegionKind::Rdma, ImmKind::BarrierRdma)?;
            self.wait(ImmKind::BarrierRdma, topo.num_rdma_ranks);
        }
        Ok(())
    }

    /// Fail with a capacity error once every rank has stopped touching the
    /// regions. Each rank reaches the same verdict from the same counts.
    pub fn check_capacity(
        &self,
        kind: RegionKind,
        needs: impl IntoIterator<Item = (usize, usize)>,
        what: &str,
    ) -> Result<()> {
        let overflow = needs
            .into_iter()
            .find(|&(rank, bytes)| bytes > self.peer_capacity(rank, kind));
        let Some((rank, bytes)) = overflow else {
            return Ok(());
        };
        warn!(
            "Rank {}: {} needs {} bytes of the {} region of rank {}, which holds {}",
            self.rank(),
            what,
            bytes,
            kind,
            rank,
            self.peer_capacity(rank, kind)
        );
        self.barrier()?;
        Err(EpError::Capacity(format!(
            "{} needs {} bytes in the {} region of rank {} ({} available)",
            what,
            bytes,
            kind,
            rank,
            self.peer_capacity(rank, kind)
        )))
    }

    pub fn mark_rdma_dirty(&self) {
        if !self.rdma_dirty.swap(true, Ordering::AcqRel) {
            debug!("Rank {}: RDMA region now holds normal-mode traffic", self.rank());
        }
    }

    pub fn clear_rdma_dirty(&self) {
        self.rdma_dirty.store(false, Ordering::Release);
    }

    pub fn is_rdma_dirty(&self) -> bool {
        self.rdma_dirty.load(Ordering::Acquire)
    }
}

/// Startup check that every link the buffer needs exists.
pub(crate) fn check_reachability(
    engine: &dyn RdmaEngine,
    topology: &RankTopology,
    uses_nvl: bool,
    low_latency_mode: bool,
) -> Result<()> {
    let missing = |peer: usize, kind: RegionKind| {
        EpError::Topology(format!(
            "rank {} cannot reach rank {} over {}",
            topology.rank, peer, kind
        ))
    };
    if uses_nvl {
        for peer in topology.node_peers() {
            if !engine.reachability(peer).nvlink {
                return Err(missing(peer, RegionKind::Nvl));
            }
        }
    }
    if topology.is_internode() {
        for peer in topology.same_slot_peers() {
            if !engine.reachability(peer).rdma {
                return Err(missing(peer, RegionKind::Rdma));
            }
        }
    }
    if low_latency_mode {
        for peer in 0..topology.num_ranks {
            if !engine.reachability(peer).rdma {
                return Err(missing(peer, RegionKind::Rdma));
            }
        }
    }
    Ok(())
}
