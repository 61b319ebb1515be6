mod node;
mod socket;

pub use node::{NodeHandle, NodeId, UdpNode};
pub use socket::UdpSock;
