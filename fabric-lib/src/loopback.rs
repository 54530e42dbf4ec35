//! In-process fabric: every rank of the group lives in the same process and
//! transfers are plain memory copies between per-rank regions.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, warn};

use crate::{
    api::{
        DomainAddress, ImmCounter, MemoryRegionDescriptor, MemoryRegionRemoteKey,
        Reachability, RegionKind, TransferRequest,
    },
    error::{FabricLibError, Result},
    host_region::HostRegion,
    imm_count::{ImmCountMap, ImmCountStatus},
    interface::{GroupBootstrap, RdmaEngine},
    topo::LinkTopology,
};

struct RegisteredRegion {
    rkey: MemoryRegionRemoteKey,
    region: Arc<HostRegion>,
}

struct GatherState {
    generation: u64,
    arrived: usize,
    deposits: Vec<Option<Bytes>>,
    last: Arc<Vec<Bytes>>,
}

/// Shared state of an in-process group of ranks.
pub struct LoopbackFabric {
    num_ranks: usize,
    links: LinkTopology,
    regions: RwLock<HashMap<(usize, RegionKind), RegisteredRegion>>,
    imm_maps: Vec<ImmCountMap>,
    next_rkey: AtomicU64,
    gather: Mutex<GatherState>,
    gather_cv: Condvar,
}

impl LoopbackFabric {
    pub fn new(num_ranks: usize, links: LinkTopology) -> Arc<Self> {
        Arc::new(Self {
            num_ranks,
            links,
            regions: RwLock::new(HashMap::new()),
            imm_maps: (0..num_ranks).map(|_| ImmCountMap::new()).collect(),
            next_rkey: AtomicU64::new(1),
            gather: Mutex::new(GatherState {
                generation: 0,
                arrived: 0,
                deposits: vec![None; num_ranks],
                last: Arc::new(Vec::new()),
            }),
            gather_cv: Condvar::new(),
        })
    }

    pub fn num_ranks(&self) -> usize {
        self.num_ranks
    }

    pub fn links(&self) -> &LinkTopology {
        &self.links
    }

    pub fn engine(self: &Arc<Self>, rank: usize) -> LoopbackEngine {
        assert!(rank < self.num_ranks, "rank {rank} out of {}", self.num_ranks);
        LoopbackEngine { rank, fabric: self.clone() }
    }

    pub fn bootstrap(self: &Arc<Self>, rank: usize) -> LoopbackBootstrap {
        assert!(rank < self.num_ranks, "rank {rank} out of {}", self.num_ranks);
        LoopbackBootstrap { rank, fabric: self.clone() }
    }

    fn resolve(
        &self,
        src: usize,
        dst_mr: &MemoryRegionDescriptor,
    ) -> Result<Arc<HostRegion>> {
        if !self.links.reachability(src, dst_mr.rank).supports(dst_mr.kind) {
            return Err(FabricLibError::Unreachable {
                src,
                dst: dst_mr.rank,
                kind: dst_mr.kind,
            });
        }
        let regions = self.regions.read();
        match regions.get(&(dst_mr.rank, dst_mr.kind)) {
            Some(registered) if registered.rkey == dst_mr.rkey => {
                Ok(registered.region.clone())
            }
            _ => {
                let (rank, kind) = (dst_mr.rank, dst_mr.kind);
                Err(FabricLibError::RegionNotFound { rank, kind })
            }
        }
    }

    fn deliver_imm(&self, dst: usize, imm: u32) -> Result<()> {
        match self.imm_maps[dst].inc(imm) {
            ImmCountStatus::Counted => Ok(()),
            ImmCountStatus::Vacant => {
                warn!("Dropping imm {} for rank {}: no counter registered", imm, dst);
                Err(FabricLibError::ImmNotRegistered { rank: dst, imm })
            }
        }
    }

    fn write(
        &self,
        src: usize,
        dst_mr: &MemoryRegionDescriptor,
        dst_offset: u64,
        payload: &[u8],
    ) -> Result<()> {
        let region = self.resolve(src, dst_mr)?;
        region.write(dst_offset as usize, payload)
    }

    fn signal(
        &self,
        src: usize,
        dst_mr: &MemoryRegionDescriptor,
        imm: u32,
    ) -> Result<()> {
        self.resolve(src, dst_mr)?;
        self.deliver_imm(dst_mr.rank, imm)
    }
}

/// Engine of one rank of a [`LoopbackFabric`].
#[derive(Clone)]
pub struct LoopbackEngine {
    rank: usize,
    fabric: Arc<LoopbackFabric>,
}

impl RdmaEngine for LoopbackEngine {
    fn rank(&self) -> usize {
        self.rank
    }

    fn num_ranks(&self) -> usize {
        self.fabric.num_ranks
    }

    fn main_address(&self) -> DomainAddress {
        let mut addr = b"loop".to_vec();
        addr.extend_from_slice(&(self.rank as u32).to_be_bytes());
        DomainAddress(Bytes::from(addr))
    }

    fn reachability(&self, peer: usize) -> Reachability {
        if peer >= self.fabric.num_ranks {
            return Reachability::default();
        }
        self.fabric.links.reachability(self.rank, peer)
    }

    fn register_region(
        &self,
        kind: RegionKind,
        len: usize,
    ) -> Result<MemoryRegionDescriptor> {
        let rkey =
            MemoryRegionRemoteKey(self.fabric.next_rkey.fetch_add(1, Ordering::Relaxed));
        let region = Arc::new(HostRegion::zeroed(kind, len));
        let registered = RegisteredRegion { rkey, region };
        self.fabric.regions.write().insert((self.rank, kind), registered);
        debug!("Rank {} registered {} region of {} bytes", self.rank, kind, len);
        Ok(MemoryRegionDescriptor {
            rank: self.rank,
            kind,
            len: len as u64,
            addr: self.main_address(),
            rkey,
        })
    }

    fn unregister_region(&self, kind: RegionKind) -> Result<()> {
        match self.fabric.regions.write().remove(&(self.rank, kind)) {
            Some(_) => Ok(()),
            None => Err(FabricLibError::RegionNotFound { rank: self.rank, kind }),
        }
    }

    fn local_region(&self, kind: RegionKind) -> Result<Arc<HostRegion>> {
        self.fabric
            .regions
            .read()
            .get(&(self.rank, kind))
            .map(|registered| registered.region.clone())
            .ok_or(FabricLibError::RegionNotFound { rank: self.rank, kind })
    }

    fn submit_transfer(&self, request: TransferRequest) -> Result<()> {
        let fabric = &self.fabric;
        match request {
            TransferRequest::Single(single) => {
                let (dst_mr, offset) = (&single.dst_mr, single.dst_offset);
                fabric.write(self.rank, dst_mr, offset, &single.payload)?;
                if let Some(imm) = single.imm_data {
                    fabric.deliver_imm(single.dst_mr.rank, imm)?;
                }
            }
            TransferRequest::Scatter(scatter) => {
                for target in scatter.dsts.iter() {
                    let (dst_mr, offset) = (&target.dst_mr, target.dst_offset);
                    fabric.write(self.rank, dst_mr, offset, &target.payload)?;
                    if let Some(imm) = scatter.imm_data {
                        fabric.deliver_imm(target.dst_mr.rank, imm)?;
                    }
                }
            }
            TransferRequest::Imm(imm) => {
                fabric.signal(self.rank, &imm.dst_mr, imm.imm_data)?;
            }
            TransferRequest::Barrier(barrier) => {
                for dst_mr in &barrier.dst_mrs {
                    fabric.signal(self.rank, dst_mr, barrier.imm_data)?;
                }
            }
        }
        Ok(())
    }

    fn get_imm_counter(&self, imm: u32) -> ImmCounter {
        self.fabric.imm_maps[self.rank].get_imm_counter(imm)
    }
}

/// Condvar-based all-gather among the ranks of a [`LoopbackFabric`].
#[derive(Clone)]
pub struct LoopbackBootstrap {
    rank: usize,
    fabric: Arc<LoopbackFabric>,
}

impl GroupBootstrap for LoopbackBootstrap {
    fn all_gather(&self, local: Bytes) -> Result<Vec<Bytes>> {
        let fabric = &self.fabric;
        let mut state = fabric.gather.lock();
        if state.deposits[self.rank].is_some() {
            return Err(FabricLibError::Bootstrap(format!(
                "rank {} joined the same all-gather twice",
                self.rank
            )));
        }
        let generation = state.generation;
        state.deposits[self.rank] = Some(local);
        state.arrived += 1;
        if state.arrived == fabric.num_ranks {
            let gathered = state.deposits.iter_mut().filter_map(Option::take).collect();
            state.last = Arc::new(gathered);
            state.arrived = 0;
            state.generation += 1;
            fabric.gather_cv.notify_all();
        } else {
            while state.generation == generation {
                fabric.gather_cv.wait(&mut state);
            }
        }
        Ok(state.last.as_ref().clone())
    }
}
