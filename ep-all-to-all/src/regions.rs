use std::sync::Arc;

use fabric_lib::{
    RdmaEngine,
    api::{MemoryRegionDescriptor, RegionKind},
};
use tracing::{debug, warn};

use crate::error::Result;

/// The NVLink and RDMA regions of one buffer, unregistered on release or
/// drop.
pub(crate) struct RegisteredRegions {
    engine: Arc<dyn RdmaEngine>,
    pub nvl: Option<MemoryRegionDescriptor>,
    pub rdma: Option<MemoryRegionDescriptor>,
}

impl RegisteredRegions {
    /// Register a zeroed region per non-zero size.
    pub fn register(
        engine: Arc<dyn RdmaEngine>,
        num_nvl_bytes: usize,
        num_rdma_bytes: usize,
    ) -> Result<Self> {
        let mut regions = Self { engine, nvl: None, rdma: None };
        if num_nvl_bytes > 0 {
            regions.nvl =
                Some(regions.engine.register_region(RegionKind::Nvl, num_nvl_bytes)?);
        }
        if num_rdma_bytes > 0 {
            regions.rdma =
                Some(regions.engine.register_region(RegionKind::Rdma, num_rdma_bytes)?);
        }
        debug!(
            "Rank {} registered {} NVLink bytes and {} RDMA bytes",
            regions.engine.rank(),
            num_nvl_bytes,
            num_rdma_bytes
        );
        Ok(regions)
    }

    pub fn release(&mut self) -> Result<()> {
        if self.nvl.take().is_some() {
            self.engine.unregister_region(RegionKind::Nvl)?;
        }
        if self.rdma.take().is_some() {
            self.engine.unregister_region(RegionKind::Rdma)?;
        }
        Ok(())
    }
}

impl Drop for RegisteredRegions {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("Rank {} failed to unregister regions: {}", self.engine.rank(), e);
        }
    }
}
