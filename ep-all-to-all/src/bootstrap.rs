use std::time::Duration;

use bytes::Bytes;
use fabric_lib::{
    GroupBootstrap,
    api::{DomainAddress, MemoryRegionDescriptor, RegionKind},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EpError, Result};

/// What every rank publishes at startup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub rank: usize,
    pub address: DomainAddress,
    pub nvl: Option<MemoryRegionDescriptor>,
    pub rdma: Option<MemoryRegionDescriptor>,
}

impl PeerInfo {
    pub fn region(&self, kind: RegionKind) -> Option<&MemoryRegionDescriptor> {
        match kind {
            RegionKind::Nvl => self.nvl.as_ref(),
            RegionKind::Rdma => self.rdma.as_ref(),
        }
    }
}

fn encode(info: &PeerInfo) -> Result<Bytes> {
    bincode::serde::encode_to_vec(info, bincode::config::standard())
        .map(Bytes::from)
        .map_err(|e| EpError::Serialization(format!("Failed to encode peer info: {}", e)))
}

fn decode(bytes: &[u8]) -> Result<PeerInfo> {
    let config = bincode::config::standard();
    let (info, _) = bincode::serde::decode_from_slice(bytes, config).map_err(|e| {
        EpError::Serialization(format!("Failed to decode peer info: {}", e))
    })?;
    Ok(info)
}

fn gather_once(
    bootstrap: &dyn GroupBootstrap,
    local: &Bytes,
    num_ranks: usize,
) -> Result<Vec<PeerInfo>> {
    let gathered = bootstrap.all_gather(local.clone())?;
    if gathered.len() != num_ranks {
        return Err(EpError::Handshake(format!(
            "expected {} peers, gathered {}",
            num_ranks,
            gathered.len()
        )));
    }
    let peers = gathered.iter().map(|bytes| decode(bytes)).collect::<Result<Vec<_>>>()?;
    if let Some((index, peer)) = peers.iter().enumerate().find(|(i, p)| p.rank != *i) {
        return Err(EpError::Handshake(format!(
            "slot {} of the all-gather holds rank {}",
            index, peer.rank
        )));
    }
    Ok(peers)
}

/// All-gather the peer information of the group. A failed attempt is
/// retried once after `retry_delay`.
pub fn exchange_peer_info(
    bootstrap: &dyn GroupBootstrap,
    local: &PeerInfo,
    num_ranks: usize,
    retry_delay: Duration,
) -> Result<Vec<PeerInfo>> {
    let bytes = encode(local)?;
    match gather_once(bootstrap, &bytes, num_ranks) {
        Ok(peers) => {
            debug!("Rank {} gathered peer info of {} ranks", local.rank, peers.len());
            Ok(peers)
        }
        Err(first) => {
            warn!(
                "Rank {} peer exchange failed, retrying in {:?}: {}",
                local.rank, retry_delay, first
            );
            std::thread::sleep(retry_delay);
            gather_once(bootstrap, &bytes, num_ranks).map_err(|second| {
                EpError::Handshake(format!(
                    "peer exchange failed twice; first: {}; second: {}",
                    first, second
                ))
            })
        }
    }
}
