mod bus;
mod error;
pub mod mailbox;
pub mod queue;
pub mod sysv;

pub use bus::{
    Bus, BusConfig, DEFAULT_PROC_COUNT, DEFAULT_QUEUE_CAPACITY, DEFAULT_SHM_KEY,
    DEFAULT_SLOT_SIZE, PeerInfo,
};
pub use error::BusError;
