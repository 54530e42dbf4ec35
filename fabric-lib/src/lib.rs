pub mod api;
mod error;
mod host_region;
mod imm_count;
mod interface;
mod loopback;
mod topo;
mod utils;

pub use error::*;
pub use host_region::HostRegion;
pub use interface::{GroupBootstrap, RdmaEngine};
pub use loopback::{LoopbackBootstrap, LoopbackEngine, LoopbackFabric};
pub use topo::LinkTopology;

pub use interface::{MockGroupBootstrap, MockRdmaEngine};
