//! Types used in public API

use std::sync::{
    Arc,
    atomic::{AtomicI64, Ordering},
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    error::FabricLibError,
    utils::hex::{fmt_hex, from_hex},
};

/// The two memory regions a rank exposes to its peers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegionKind {
    /// Shared-memory style region, reachable from the same node only.
    Nvl,
    /// Region reachable over RDMA, both within and across nodes.
    Rdma,
}

impl std::fmt::Display for RegionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegionKind::Nvl => write!(f, "NVLink"),
            RegionKind::Rdma => write!(f, "RDMA"),
        }
    }
}

/// A remote key for a memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct MemoryRegionRemoteKey(pub u64);

/// Everything a peer needs to target a registered region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRegionDescriptor {
    pub rank: usize,
    pub kind: RegionKind,
    pub len: u64,
    pub addr: DomainAddress,
    pub rkey: MemoryRegionRemoteKey,
}

#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DomainAddress(pub Bytes);

impl std::fmt::Debug for DomainAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt_hex(f, &self.0)
    }
}

impl std::fmt::Display for DomainAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt_hex(f, &self.0)
    }
}

impl std::str::FromStr for DomainAddress {
    type Err = FabricLibError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(from_hex(s).map_err(|_| FabricLibError::Custom("Invalid address"))?))
    }
}

/// Which links connect the local rank to a peer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Reachability {
    pub nvlink: bool,
    pub rdma: bool,
}

impl Reachability {
    pub fn supports(&self, kind: RegionKind) -> bool {
        match kind {
            RegionKind::Nvl => self.nvlink,
            RegionKind::Rdma => self.rdma,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ImmTransferRequest {
    pub imm_data: u32,
    pub dst_mr: MemoryRegionDescriptor,
}

#[derive(Clone, Debug)]
pub struct BarrierTransferRequest {
    pub imm_data: u32,
    pub dst_mrs: Vec<MemoryRegionDescriptor>,
}

/// Write `payload` at `dst_offset` of the destination region, then deliver
/// `imm_data` to the destination once the bytes are visible.
#[derive(Clone, Debug)]
pub struct SingleTransferRequest {
    pub payload: Bytes,
    pub imm_data: Option<u32>,
    pub dst_mr: MemoryRegionDescriptor,
    pub dst_offset: u64,
}

#[derive(Clone, Debug)]
pub struct ScatterTarget {
    pub dst_mr: MemoryRegionDescriptor,
    pub dst_offset: u64,
    pub payload: Bytes,
}

/// Several writes sharing one immediate: each target receives `imm_data`
/// after its own payload landed.
#[derive(Clone, Debug)]
pub struct ScatterTransferRequest {
    pub dsts: Arc<Vec<ScatterTarget>>,
    pub imm_data: Option<u32>,
}

/// Use static dispatch for performance.
#[derive(Clone, Debug)]
pub enum TransferRequest {
    Imm(ImmTransferRequest),
    Single(SingleTransferRequest),
    Scatter(ScatterTransferRequest),
    Barrier(BarrierTransferRequest),
}

/// A free-range immediate counter exposed to users.
#[derive(Clone)]
pub struct ImmCounter {
    counter: Arc<AtomicI64>,
}

impl ImmCounter {
    pub fn new(counter: Arc<AtomicI64>) -> Self {
        Self { counter }
    }

    /// Block until `target` more immediates arrived than were consumed by
    /// previous waits.
    pub fn wait(&self, target: u32) {
        let old = self.counter.fetch_sub(target as i64, Ordering::AcqRel);
        if old >= target as i64 {
            return;
        }
        while self.counter.load(Ordering::Acquire) < 0 {
            std::thread::yield_now();
        }
    }

    /// Current number of unconsumed immediates.
    pub fn pending(&self) -> i64 {
        self.counter.load(Ordering::Acquire)
    }
}
