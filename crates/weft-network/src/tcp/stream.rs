use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    net::SocketAddr,
};

use mio::{Interest, Registry, Token};
use tracing::{debug, warn};

use crate::{
    frame::{Framer, encode_frame},
    sockopt::set_socket_buf_size,
};

/// Scratch buffer for each read round.
const RX_BUF_SIZE: usize = 32 * 1024;

/// Outcome of one read or write round on a connection.
///
/// `Closed` carries the OS error that killed the stream; `None` means a
/// clean EOF or a locally initiated shutdown.
#[derive(Debug)]
pub(crate) enum Round {
    Alive,
    Closed(Option<io::Error>),
}

impl Round {
    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        matches!(self, Round::Closed(_))
    }
}

/// One connected, framed TCP socket.
///
/// Inbound: each readable round reads into the scratch buffer until
/// `WouldBlock` and feeds the framer; complete frame bodies surface
/// through the read callback in arrival order.
///
/// Outbound: `send` frame-encodes into a staging buffer and writes
/// immediately; any remainder lands in a FIFO backlog that is flushed on
/// writable events. WRITABLE interest is armed exactly while the backlog
/// is non-empty (`writable_armed == !send_backlog.is_empty()`).
pub(crate) struct TcpConnection {
    stream: mio::net::TcpStream,
    peer_addr: SocketAddr,
    token: Token,
    framer: Framer,
    rx_buf: Vec<u8>,
    send_buf: Vec<u8>,
    send_backlog: VecDeque<Vec<u8>>,
    writable_armed: bool,
}

impl TcpConnection {
    pub(crate) fn new(
        stream: mio::net::TcpStream,
        peer_addr: SocketAddr,
        token: Token,
        max_payload: usize,
        socket_buf_size: Option<usize>,
    ) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        if let Some(size) = socket_buf_size {
            set_socket_buf_size(&stream, size);
        }
        Ok(Self {
            stream,
            peer_addr,
            token,
            framer: Framer::new(max_payload),
            rx_buf: vec![0; RX_BUF_SIZE],
            send_buf: Vec::with_capacity(RX_BUF_SIZE),
            send_backlog: VecDeque::new(),
            writable_armed: false,
        })
    }

    #[inline]
    pub(crate) fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    #[inline]
    pub(crate) fn stream_mut(&mut self) -> &mut mio::net::TcpStream {
        &mut self.stream
    }

    /// Reads until `WouldBlock`, feeding the framer. `on_frame` fires once
    /// per complete frame; frame data is only valid for the callback.
    pub(crate) fn read_round<F>(&mut self, on_frame: &mut F) -> Round
    where
        F: FnMut(&[u8]),
    {
        loop {
            match self.stream.read(&mut self.rx_buf) {
                Ok(0) => return Round::Closed(None),
                Ok(n) => {
                    if let Err(err) = self.framer.push(&self.rx_buf[..n], &mut *on_frame) {
                        warn!(?err, peer = ?self.peer_addr, "tcp: framing violation");
                        return Round::Closed(Some(io::Error::new(
                            io::ErrorKind::InvalidData,
                            err,
                        )));
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Round::Alive,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    debug!(?err, peer = ?self.peer_addr, "tcp: read");
                    return Round::Closed(Some(err));
                }
            }
        }
    }

    /// Frame-encodes and writes, queueing the remainder on `WouldBlock` or
    /// behind an existing backlog. Frames never reorder.
    pub(crate) fn send(&mut self, registry: &Registry, payload: &[u8]) -> Round {
        self.send_buf.clear();
        if encode_frame(payload, &mut self.send_buf).is_err() {
            // Empty payloads are filtered at the public API; nothing to do.
            return Round::Alive;
        }

        if !self.send_backlog.is_empty() {
            let data = self.send_buf.clone();
            return self.enqueue(registry, data);
        }

        match self.stream.write(&self.send_buf) {
            Ok(n) if n == self.send_buf.len() => Round::Alive,
            Ok(0) => {
                warn!(peer = ?self.peer_addr, "tcp: stream failed to write, disconnecting");
                Round::Closed(Some(io::Error::from(io::ErrorKind::WriteZero)))
            }
            Ok(n) => {
                let data = self.send_buf[n..].to_vec();
                self.enqueue(registry, data)
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                let data = self.send_buf.clone();
                self.enqueue(registry, data)
            }
            Err(err) => {
                warn!(?err, peer = ?self.peer_addr, "tcp: stream write fail");
                Round::Closed(Some(err))
            }
        }
    }

    /// Flushes queued data until the kernel blocks or the queue empties.
    /// Drops WRITABLE interest only once fully drained.
    pub(crate) fn drain_backlog(&mut self, registry: &Registry) -> Round {
        while let Some(front) = self.send_backlog.front_mut() {
            match self.stream.write(front) {
                Ok(0) => {
                    return Round::Closed(Some(io::Error::from(io::ErrorKind::WriteZero)));
                }
                Ok(n) => {
                    if n == front.len() {
                        self.send_backlog.pop_front();
                    } else {
                        front.drain(..n);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    debug!(?err, peer = ?self.peer_addr, "tcp: write from backlog");
                    return Round::Closed(Some(err));
                }
            }
        }

        if self.send_backlog.is_empty() && self.writable_armed {
            if let Err(err) =
                registry.reregister(&mut self.stream, self.token, Interest::READABLE)
            {
                debug!(?err, "tcp: reregister drop writable");
                return Round::Closed(Some(err));
            }
            self.writable_armed = false;
        }

        Round::Alive
    }

    fn enqueue(&mut self, registry: &Registry, data: Vec<u8>) -> Round {
        self.send_backlog.push_back(data);
        if !self.writable_armed {
            if let Err(err) = registry.reregister(
                &mut self.stream,
                self.token,
                Interest::READABLE | Interest::WRITABLE,
            ) {
                debug!(?err, "tcp: poll reregister");
                return Round::Closed(Some(err));
            }
            self.writable_armed = true;
        }
        Round::Alive
    }

    pub(crate) fn close(&mut self, registry: &Registry) {
        debug!(peer = ?self.peer_addr, "terminating connection");
        let _ = registry.deregister(&mut self.stream);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}
