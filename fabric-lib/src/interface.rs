use mockall::automock;

use std::sync::Arc;

use bytes::Bytes;

use crate::{
    api::{
        DomainAddress, ImmCounter, MemoryRegionDescriptor, Reachability, RegionKind,
        TransferRequest,
    },
    error::Result,
    host_region::HostRegion,
};

/// One-sided transfer engine of a single rank.
#[automock]
pub trait RdmaEngine: Send + Sync {
    fn rank(&self) -> usize;

    fn num_ranks(&self) -> usize;

    fn main_address(&self) -> DomainAddress;

    /// Links between this rank and `peer`.
    fn reachability(&self, peer: usize) -> Reachability;

    /// Allocate and register a zeroed region of `len` bytes. Registering a
    /// kind twice replaces the previous region.
    fn register_region(
        &self,
        kind: RegionKind,
        len: usize,
    ) -> Result<MemoryRegionDescriptor>;

    fn unregister_region(&self, kind: RegionKind) -> Result<()>;

    /// The local region previously registered for `kind`.
    fn local_region(&self, kind: RegionKind) -> Result<Arc<HostRegion>>;

    /// Execute the request. Writes are visible at the destination before its
    /// immediate counter is incremented.
    fn submit_transfer(&self, request: TransferRequest) -> Result<()>;

    /// Register `imm` as a counter on this rank.
    fn get_imm_counter(&self, imm: u32) -> ImmCounter;
}

/// Group-membership collective used once at startup.
#[automock]
pub trait GroupBootstrap: Send + Sync {
    /// Contribute `local` and return the contributions of every rank, indexed
    /// by rank.
    fn all_gather(&self, local: Bytes) -> Result<Vec<Bytes>>;
}
