use fabric_lib::FabricLibError;

pub type Result<T> = std::result::Result<T, EpError>;

#[derive(Clone, Debug, thiserror::Error)]
pub enum EpError {
    /// No tuned configuration, or an invalid tuning parameter.
    #[error("ConfigurationError: {0}")]
    Configuration(String),
    /// Required NVLink/RDMA reachability is missing.
    #[error("TopologyError: {0}")]
    Topology(String),
    /// The startup all-gather failed twice.
    #[error("HandshakeError: {0}")]
    Handshake(String),
    /// The caller violated a call contract.
    #[error("UsageError: {0}")]
    Usage(String),
    /// A transfer does not fit the fixed-capacity regions.
    #[error("CapacityError: {0}")]
    Capacity(String),
    #[error("{0}")]
    Fabric(#[from] FabricLibError),
    #[error("SerializationError: {0}")]
    Serialization(String),
    #[error("communication stream is disconnected")]
    Disconnected,
}

macro_rules! usage_error {
    ($($arg:tt)*) => {
        $crate::error::EpError::Usage(format!($($arg)*))
    };
}

macro_rules! ensure_usage {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            return Err($crate::error::usage_error!($($arg)*));
        }
    };
}

pub(crate) use {ensure_usage, usage_error};
