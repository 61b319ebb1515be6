use std::{
    io,
    net::{SocketAddr, UdpSocket},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crossbeam_channel::{Receiver, Sender, unbounded};
use mio::{Events, Interest, Poll, Token, Waker};
use once_cell::sync::OnceCell;
use tracing::{debug, info, warn};
use weft_utils::safe_panic;

use crate::{config::NodeConfig, resolve, udp::socket::UdpSock};

const SOCK: Token = Token(0);
const WAKER: Token = Token(1);

static LAST_STAMP: AtomicU64 = AtomicU64::new(0);
static STAMP_COUNT: AtomicU64 = AtomicU64::new(0);

/// Node identifier: millisecond timestamp in the upper 52 bits, a
/// per-millisecond counter in the low 12. Collision-free within a process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(pub u64);

fn next_node_id() -> NodeId {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let count = if LAST_STAMP.load(Ordering::Relaxed) == now_ms {
        STAMP_COUNT.fetch_add(1, Ordering::Relaxed) + 1
    } else {
        LAST_STAMP.store(now_ms, Ordering::Relaxed);
        STAMP_COUNT.store(0, Ordering::Relaxed);
        0
    };
    NodeId((now_ms << 12) | (count & 0xFFF))
}

type OnOpen = Box<dyn FnOnce(io::Result<SocketAddr>) + Send>;
type OnData = Box<dyn FnMut(SocketAddr, &[u8]) + Send>;
type OnSent = Box<dyn FnOnce(io::Result<usize>) + Send>;

struct AsyncSend {
    addr: SocketAddr,
    data: Vec<u8>,
    on_sent: Option<OnSent>,
}

/// Cross-thread surface of a running [`UdpNode`].
#[derive(Clone)]
pub struct NodeHandle {
    id: NodeId,
    sock: Arc<OnceCell<UdpSocket>>,
    running: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
    tx: Sender<AsyncSend>,
}

impl NodeHandle {
    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// The bound endpoint of a running node.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock
            .get()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?
            .local_addr()
    }

    /// Synchronous send: blocks the calling thread until the datagram is
    /// handed to the kernel, returning the byte count.
    pub fn send(&self, host: &str, port: u16, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }
        if !self.is_running() {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        let addr = resolve(host, port)
            .map_err(|e| io::Error::new(io::ErrorKind::NotFound, e.to_string()))?;
        let sock =
            self.sock.get().ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        blocking_send_to(sock, addr, data)
    }

    /// Asynchronous send: posts the datagram to the reactor; the completion
    /// callback runs on the reactor thread.
    pub fn send_async<F>(&self, host: &str, port: u16, data: Vec<u8>, on_sent: F)
    where
        F: FnOnce(io::Result<usize>) + Send + 'static,
    {
        if !self.is_running() {
            on_sent(Err(io::Error::from(io::ErrorKind::NotConnected)));
            return;
        }
        let addr = match resolve(host, port) {
            Ok(addr) => addr,
            Err(e) => {
                on_sent(Err(io::Error::new(io::ErrorKind::NotFound, e.to_string())));
                return;
            }
        };
        let op = AsyncSend { addr, data, on_sent: Some(Box::new(on_sent)) };
        if let Err(err) = self.tx.send(op) {
            if let Some(cb) = err.into_inner().on_sent.take() {
                cb(Err(io::Error::from(io::ErrorKind::NotConnected)));
            }
            return;
        }
        let _ = self.waker.wake();
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.waker.wake();
    }
}

/// Datagram node: one [`UdpSock`] driven by a poll loop in the thread that
/// calls [`run`]. Data callbacks are serialized on that thread; each
/// datagram is delivered whole with its remote endpoint. Single-use:
/// after a stop the instance is gone.
///
/// [`run`]: UdpNode::run
pub struct UdpNode {
    cfg: NodeConfig,
    id: NodeId,
    sock: UdpSock,
    shared: Arc<OnceCell<UdpSocket>>,
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    stop: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    tx: Sender<AsyncSend>,
    rx: Receiver<AsyncSend>,
    on_open: Option<OnOpen>,
    on_data: Option<OnData>,
}

impl UdpNode {
    pub fn new(cfg: NodeConfig) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let (tx, rx) = unbounded();
        Ok(Self {
            cfg,
            id: next_node_id(),
            sock: UdpSock::new(),
            shared: Arc::new(OnceCell::new()),
            poll,
            events: Events::with_capacity(64),
            waker,
            stop: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            tx,
            rx,
            on_open: None,
            on_data: None,
        })
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn set_open_callback<F>(&mut self, cb: F)
    where
        F: FnOnce(io::Result<SocketAddr>) + Send + 'static,
    {
        self.on_open = Some(Box::new(cb));
    }

    pub fn set_data_callback<F>(&mut self, cb: F)
    where
        F: FnMut(SocketAddr, &[u8]) + Send + 'static,
    {
        self.on_data = Some(Box::new(cb));
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            id: self.id,
            sock: self.shared.clone(),
            running: self.running.clone(),
            stop: self.stop.clone(),
            waker: self.waker.clone(),
            tx: self.tx.clone(),
        }
    }

    /// Resolves, binds and drives the reactor in the calling thread.
    /// Returns once the node is stopped. Bind and resolve failures surface
    /// through the open callback; `run` itself only fails on reactor
    /// plumbing errors.
    pub fn run(mut self, host: &str, port: u16) -> io::Result<()> {
        let on_open = self.on_open.take();
        let addr = match resolve(host, port) {
            Ok(addr) => addr,
            Err(err) => {
                if let Some(cb) = on_open {
                    let err = io::Error::new(io::ErrorKind::NotFound, err.to_string());
                    crate::shielded("open", || cb(Err(err)));
                }
                return Ok(());
            }
        };

        self.sock.set_broadcast(self.cfg.broadcast);
        if let Some(size) = self.cfg.send_os_buf_size {
            self.sock.set_send_buffer_size(size);
        }
        if let Some(size) = self.cfg.recv_os_buf_size {
            self.sock.set_recv_buffer_size(size);
        }
        if let Err(err) = self.sock.open(addr) {
            if let Some(cb) = on_open {
                crate::shielded("open", || cb(Err(err)));
            }
            return Ok(());
        }

        let _ = self.shared.set(self.sock.try_clone()?);
        let mut registered = self.sock.registrable()?;
        self.poll.registry().register(&mut registered, SOCK, Interest::READABLE)?;

        let local = self.sock.local_addr()?;
        self.running.store(true, Ordering::Release);
        info!(?local, id = self.id.0, "udp node up");
        if let Some(cb) = on_open {
            crate::shielded("open", || cb(Ok(local)));
        }

        let mut buf = vec![0u8; self.cfg.effective_recv_buf()];
        'outer: loop {
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            match self.poll.poll(&mut self.events, None) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.running.store(false, Ordering::Release);
                    return Err(e);
                }
            }
            for ev in self.events.iter() {
                match ev.token() {
                    SOCK => loop {
                        match self.sock.recv_from(&mut buf) {
                            Ok((n, peer)) => {
                                if let Some(cb) = self.on_data.as_mut() {
                                    crate::shielded("data", || cb(peer, &buf[..n]));
                                }
                            }
                            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                            Err(err) => {
                                // Mostly ICMP-driven noise; the next readable
                                // event retries.
                                debug!(?err, "udp: recv");
                                break;
                            }
                        }
                    },
                    WAKER => {
                        if self.stop.load(Ordering::Acquire) {
                            break 'outer;
                        }
                        let Some(sock) = self.shared.get() else {
                            safe_panic!("udp: socket unset inside the run loop");
                            break 'outer;
                        };
                        while let Ok(mut op) = self.rx.try_recv() {
                            let result = blocking_send_to(sock, op.addr, &op.data);
                            if let Err(err) = &result {
                                warn!(?err, addr = ?op.addr, "udp: async send");
                            }
                            if let Some(cb) = op.on_sent.take() {
                                crate::shielded("sent", || cb(result));
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        self.running.store(false, Ordering::Release);
        // Posted-but-unsent operations complete as aborted.
        while let Ok(mut op) = self.rx.try_recv() {
            if let Some(cb) = op.on_sent.take() {
                crate::shielded("sent", || {
                    cb(Err(io::Error::from(io::ErrorKind::ConnectionAborted)));
                });
            }
        }
        self.sock.close();
        debug!(id = self.id.0, "udp node stopped");
        Ok(())
    }
}

fn blocking_send_to(sock: &UdpSocket, addr: SocketAddr, data: &[u8]) -> io::Result<usize> {
    loop {
        match sock.send_to(data, addr) {
            Ok(n) => return Ok(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_micros(50));
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ids_do_not_collide() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..2048 {
            assert!(seen.insert(next_node_id()));
        }
    }

    #[test]
    fn id_layout() {
        let id = next_node_id();
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64;
        let stamp = id.0 >> 12;
        // Generated within the last few seconds.
        assert!(now_ms - stamp < 5_000, "stamp {stamp} vs now {now_ms}");
    }
}
