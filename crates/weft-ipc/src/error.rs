use thiserror::Error;

/// Bus status codes. The numeric taxonomy mirrors the transport the bus
/// grew up next to: policy failures are distinct variants, syscall
/// failures carry errno.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("out of memory")]
    NoMemory,
    #[error("protocol violation")]
    Protocol,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("no such process: {0}")]
    NoSuchProcess(String),
    #[error("connection lost")]
    ConnectionLost,
    #[error("payload of {len} bytes exceeds recipient slot capacity {max}")]
    OversizePayload { len: usize, max: usize },
    #[error("system call failed: {0}")]
    Errno(#[from] std::io::Error),
    #[error("name is not valid ascii")]
    MalformedUtf8,
    #[error("requested qos not supported")]
    UnsupportedQos,
    #[error("packet exceeds supported maximum")]
    OversizePacket,
    #[error("bus already initialized in this process")]
    AlreadyInitialized,
    #[error("bus not initialized")]
    NotInitialized,
    #[error("process registry is full")]
    RegistryFull,
    #[error("control region inaccessible")]
    ControlRegionInaccessible,
}
