mod client;
mod server;
mod stream;

pub use client::{ClientCtx, ClientHandle, TcpClient};
pub use server::{ConnId, Peer, PeerCtx, ServerHandle, TcpServer};
