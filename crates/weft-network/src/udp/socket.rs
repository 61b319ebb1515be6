use std::{
    io,
    net::{SocketAddr, UdpSocket},
};

use crate::sockopt::{get_buf, set_buf};

/// Datagram socket primitive.
///
/// Options set before `open` are applied during it; afterwards they are
/// inert, matching the usual setsockopt-before-bind discipline. Opening an
/// already-open socket reports success without touching it.
#[derive(Default)]
pub struct UdpSock {
    socket: Option<UdpSocket>,
    send_buf_size: Option<usize>,
    recv_buf_size: Option<usize>,
    broadcast: bool,
}

impl UdpSock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_send_buffer_size(&mut self, size: usize) {
        self.send_buf_size = Some(size);
    }

    pub fn set_recv_buffer_size(&mut self, size: usize) {
        self.recv_buf_size = Some(size);
    }

    pub fn set_broadcast(&mut self, on: bool) {
        self.broadcast = on;
    }

    /// Binds and applies the configured options. The socket comes up
    /// non-blocking; all I/O surfaces `WouldBlock`.
    pub fn open(&mut self, local: SocketAddr) -> io::Result<()> {
        if self.socket.is_some() {
            return Ok(());
        }
        let socket = UdpSocket::bind(local)?;
        socket.set_nonblocking(true)?;
        if self.broadcast {
            socket.set_broadcast(true)?;
        }
        if let Some(size) = self.send_buf_size {
            set_buf(&socket, libc::SO_SNDBUF, size);
        }
        if let Some(size) = self.recv_buf_size {
            set_buf(&socket, libc::SO_RCVBUF, size);
        }
        self.socket = Some(socket);
        Ok(())
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    fn socket(&self) -> io::Result<&UdpSocket> {
        self.socket.as_ref().ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }

    /// Non-blocking single-datagram send.
    pub fn send_to(&self, remote: SocketAddr, data: &[u8]) -> io::Result<usize> {
        self.socket()?.send_to(data, remote)
    }

    /// Non-blocking single-datagram receive.
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket()?.recv_from(buf)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket()?.local_addr()
    }

    /// Kernel SO_SNDBUF as currently in effect.
    pub fn send_buffer_size(&self) -> io::Result<usize> {
        get_buf(self.socket()?, libc::SO_SNDBUF)
    }

    /// Kernel SO_RCVBUF as currently in effect.
    pub fn recv_buffer_size(&self) -> io::Result<usize> {
        get_buf(self.socket()?, libc::SO_RCVBUF)
    }

    /// A second handle on the same fd, for senders off the reactor thread.
    pub(crate) fn try_clone(&self) -> io::Result<UdpSocket> {
        self.socket()?.try_clone()
    }

    /// Converts a clone of the fd into a mio socket for registration.
    pub(crate) fn registrable(&self) -> io::Result<mio::net::UdpSocket> {
        Ok(mio::net::UdpSocket::from_std(self.try_clone()?))
    }

    pub fn close(&mut self) {
        self.socket = None;
    }
}
