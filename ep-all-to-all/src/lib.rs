mod bootstrap;
mod buffer;
mod config;
mod context;
mod error;
mod event;
mod handle;
mod internode;
mod intranode;
mod layout;
mod low_latency;
mod ops;
mod payload;
mod placement;
mod quant;
mod records;
mod regions;
mod tensor;
mod topology;

pub use bootstrap::{PeerInfo, exchange_peer_info};
pub use buffer::{Buffer, BufferOptions};
pub use config::{Config, ConfigSelector};
pub use error::{EpError, Result};
pub use event::{EventHandle, EventOverlap, PendingTransfer, Stream, StreamQueue};
pub use handle::{
    CommHandle, InternodeHandle, IntranodeHandle, LowLatencyHandle, SourceMeta,
};
pub use layout::{RoutingPlan, compute_dispatch_layout};
pub use low_latency::LowLatencyCombineBuffer;
pub use ops::{
    CombineOutput, CombineRequest, DispatchOutput, DispatchRequest, ExpertLoadCounter,
    LowLatencyCombineOutput, LowLatencyCombineRequest, LowLatencyDispatchOutput,
    LowLatencyDispatchRequest, SlotLease,
};
pub use payload::{TokenPayload, TopkSelection};
pub use placement::{ExpertPlacement, PlacementStrategy};
pub use quant::{
    FP8_BLOCK_SIZE, FP8_E4M3_MAX, UE8M0_SCALES_PER_WORD, dequantize, dequantize_ue8m0,
    e4m3_to_f32, f32_to_e4m3, pack_ue8m0, quantize_row, unpack_ue8m0,
};
pub use tensor::Matrix;
pub use topology::{NUM_MAX_NVL_PEERS, RankTopology, TransportMode};


#[cfg(test)]
mod test_event;
#[cfg(test)]
mod test_handle;
#[cfg(test)]
mod test_intranode;
#[cfg(test)]
mod test_layout;
#[cfg(test)]
mod test_low_latency;
