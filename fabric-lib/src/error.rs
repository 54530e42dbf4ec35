use crate::api::RegionKind;

pub type Result<T> = std::result::Result<T, FabricLibError>;

#[derive(Clone, Debug, thiserror::Error)]
pub enum FabricLibError {
    #[error("DomainError: {0}")]
    Domain(String),
    #[error("UnreachableError: rank {src} cannot reach rank {dst} over {kind}")]
    Unreachable { src: usize, dst: usize, kind: RegionKind },
    #[error(
        "OutOfBoundsError: {kind} access at offset {offset} with length {len} exceeds {capacity} bytes"
    )]
    OutOfBounds { kind: RegionKind, offset: usize, len: usize, capacity: usize },
    #[error("RegionNotFound: {kind} region of rank {rank}")]
    RegionNotFound { rank: usize, kind: RegionKind },
    #[error("ImmCounterError: imm {imm} is not registered on rank {rank}")]
    ImmNotRegistered { rank: usize, imm: u32 },
    #[error("BootstrapError: {0}")]
    Bootstrap(String),
    #[error("FabricLibError: {0}")]
    Custom(&'static str),
}
