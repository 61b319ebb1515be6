use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use mio::{Events, Interest, Poll, Token, Waker, event::Event, net::TcpListener};
use tracing::{debug, error, info, warn};

use crate::{
    config::{ServerConfig, TlsConfig},
    error::NetError,
    frame::FrameError,
    resolve,
    tcp::stream::{Round, TcpConnection},
};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);

// Ids double as mio tokens; 0 and 1 are reserved above.
static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(2);

/// Process-unique monotonic connection id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

pub(crate) fn next_conn_id() -> ConnId {
    ConnId(NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed))
}

type OnConnection = Box<dyn FnMut(&mut Peer) + Send>;
type OnOpen = Box<dyn FnOnce(io::Result<SocketAddr>) + Send>;
type OnData = Box<dyn FnMut(&mut PeerCtx<'_>, &[u8]) + Send>;
type OnClose = Box<dyn FnOnce(ConnId, Option<io::Error>) + Send>;

/// One accepted connection plus its callback slots.
///
/// Handed to the server's connection callback exactly once, right after
/// accept, so the caller can install data/close callbacks before the read
/// loop starts. Each callback fires at most once per transition: open once,
/// data zero or more times in between, close last and exactly once.
pub struct Peer {
    id: ConnId,
    peer_addr: SocketAddr,
    conn: TcpConnection,
    on_open: Option<OnOpen>,
    on_data: Option<OnData>,
    on_close: Option<OnClose>,
}

impl Peer {
    #[inline]
    pub fn id(&self) -> ConnId {
        self.id
    }

    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn set_open_callback<F>(&mut self, cb: F)
    where
        F: FnOnce(io::Result<SocketAddr>) + Send + 'static,
    {
        self.on_open = Some(Box::new(cb));
    }

    pub fn set_data_callback<F>(&mut self, cb: F)
    where
        F: FnMut(&mut PeerCtx<'_>, &[u8]) + Send + 'static,
    {
        self.on_data = Some(Box::new(cb));
    }

    pub fn set_close_callback<F>(&mut self, cb: F)
    where
        F: FnOnce(ConnId, Option<io::Error>) + Send + 'static,
    {
        self.on_close = Some(Box::new(cb));
    }

    #[inline]
    fn token(&self) -> Token {
        Token(self.id.0 as usize)
    }
}

/// What a data callback may do to its own connection without re-entering
/// the server: queue replies (flushed right after the callback, in order)
/// and request a close.
pub struct PeerCtx<'a> {
    id: ConnId,
    peer_addr: SocketAddr,
    out: &'a mut Vec<Vec<u8>>,
    close: &'a mut bool,
}

impl PeerCtx<'_> {
    #[inline]
    pub fn id(&self) -> ConnId {
        self.id
    }

    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn send(&mut self, payload: &[u8]) -> Result<(), NetError> {
        if payload.is_empty() {
            return Err(FrameError::EmptyPayload.into());
        }
        self.out.push(payload.to_vec());
        Ok(())
    }

    pub fn close(&mut self) {
        *self.close = true;
    }
}

/// Cross-thread stop switch for a running server.
#[derive(Clone)]
pub struct ServerHandle {
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ServerHandle {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.waker.wake();
    }
}

struct ServerInner {
    cfg: ServerConfig,
    poll: Poll,
    listener: TcpListener,
    conns: Vec<Peer>,
    on_connection: OnConnection,
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ServerInner {
    fn handle_event(&mut self, ev: &Event) {
        match ev.token() {
            LISTENER => self.accept_loop(),
            WAKER => {}
            token => {
                let Some(idx) = self.conns.iter().position(|p| p.token() == token) else {
                    // Stale readiness for a connection closed earlier in
                    // this same round.
                    debug!(?token, "event for unknown token");
                    return;
                };
                self.drive_conn(idx, ev.is_readable(), ev.is_writable());
            }
        }
    }

    fn accept_loop(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, addr)) => {
                    let id = next_conn_id();
                    let token = Token(id.0 as usize);
                    if let Err(err) =
                        self.poll.registry().register(&mut stream, token, Interest::READABLE)
                    {
                        error!(?err, "couldn't register client");
                        let _ = stream.shutdown(std::net::Shutdown::Both);
                        continue;
                    }
                    let conn = match TcpConnection::new(
                        stream,
                        addr,
                        token,
                        self.cfg.max_payload,
                        self.cfg.socket_buf_size,
                    ) {
                        Ok(conn) => conn,
                        Err(err) => {
                            error!(?err, ?addr, "couldn't construct connection");
                            continue;
                        }
                    };
                    info!(?addr, id = id.0, "client connected");
                    let mut peer = Peer {
                        id,
                        peer_addr: addr,
                        conn,
                        on_open: None,
                        on_data: None,
                        on_close: None,
                    };
                    crate::shielded("connection", || (self.on_connection)(&mut peer));
                    if let Some(cb) = peer.on_open.take() {
                        crate::shielded("open", || cb(Ok(addr)));
                    }
                    self.conns.push(peer);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!(?err, "tcp: accept");
                    return;
                }
            }
        }
    }

    fn drive_conn(&mut self, idx: usize, readable: bool, writable: bool) {
        let registry = self.poll.registry();
        let mut outcome = Round::Alive;
        let mut out: Vec<Vec<u8>> = Vec::new();
        let mut close_req = false;

        {
            let Peer { id, peer_addr, conn, on_data, .. } = &mut self.conns[idx];
            let (id, peer_addr) = (*id, *peer_addr);

            if readable {
                outcome = conn.read_round(&mut |frame| {
                    if let Some(cb) = on_data.as_mut() {
                        let mut ctx =
                            PeerCtx { id, peer_addr, out: &mut out, close: &mut close_req };
                        crate::shielded("data", || cb(&mut ctx, frame));
                    }
                });
            }

            if !outcome.is_closed() {
                for payload in out.drain(..) {
                    let round = conn.send(registry, &payload);
                    if round.is_closed() {
                        outcome = round;
                        break;
                    }
                }
            }

            if !outcome.is_closed() && writable {
                outcome = conn.drain_backlog(registry);
            }
        }

        if close_req && !outcome.is_closed() {
            outcome = Round::Closed(None);
        }
        if let Round::Closed(err) = outcome {
            self.close_at(idx, err);
        }
    }

    /// Close callback fires while the entry is still in the table, then the
    /// entry goes away.
    fn close_at(&mut self, idx: usize, err: Option<io::Error>) {
        {
            let peer = &mut self.conns[idx];
            debug!(id = peer.id.0, ?err, "connection closed");
            peer.conn.close(self.poll.registry());
            if let Some(cb) = peer.on_close.take() {
                let id = peer.id;
                crate::shielded("close", || cb(id, err));
            }
        }
        self.conns.swap_remove(idx);
    }

    fn send(&mut self, id: ConnId, payload: &[u8]) -> Result<(), NetError> {
        let Some(idx) = self.conns.iter().position(|p| p.id == id) else {
            return Err(NetError::UnknownConnection(id));
        };
        let round = self.conns[idx].conn.send(self.poll.registry(), payload);
        if let Round::Closed(err) = round {
            self.close_at(idx, err);
            return Err(NetError::Closed);
        }
        Ok(())
    }

    fn broadcast(&mut self, payload: &[u8]) {
        let mut i = self.conns.len();
        while i != 0 {
            i -= 1;
            let round = self.conns[i].conn.send(self.poll.registry(), payload);
            if let Round::Closed(err) = round {
                self.close_at(i, err);
            }
        }
    }

    fn shutdown_all(&mut self) {
        while !self.conns.is_empty() {
            let last = self.conns.len() - 1;
            self.close_at(last, None);
        }
    }
}

/// Framed TCP server over a single-threaded mio poll loop.
///
/// Every accepted socket becomes a [`Peer`] with a fresh [`ConnId`]; the
/// connection callback installs per-peer data/close callbacks. All
/// callbacks run on the thread driving [`run`]/[`poll`], so per-connection
/// state needs no locking. Ordering across different peers follows event
/// readiness and is not contractual.
///
/// [`run`]: TcpServer::run
/// [`poll`]: TcpServer::poll
pub struct TcpServer {
    events: Events,
    inner: ServerInner,
}

impl TcpServer {
    pub fn bind<F>(cfg: ServerConfig, on_connection: F) -> Result<Self, NetError>
    where
        F: FnMut(&mut Peer) + Send + 'static,
    {
        cfg.validate()?;
        let addr = resolve(&cfg.host, cfg.port)?;
        let mut listener = TcpListener::bind(addr)?;
        let poll = Poll::new()?;
        poll.registry().register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        Ok(Self {
            events: Events::with_capacity(128),
            inner: ServerInner {
                cfg,
                poll,
                listener,
                conns: Vec::with_capacity(16),
                on_connection: Box::new(on_connection),
                stop: Arc::new(AtomicBool::new(false)),
                waker,
            },
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.listener.local_addr()
    }

    /// The TLS material this server was configured with, if any. Framing
    /// always operates on the plaintext stream.
    pub fn tls(&self) -> Option<&TlsConfig> {
        self.inner.cfg.tls.as_ref()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle { stop: self.inner.stop.clone(), waker: self.inner.waker.clone() }
    }

    /// One poll round: accepts, reads, dispatches callbacks, flushes
    /// backlogs. `timeout` of `None` blocks until an event or a wake.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        match self.inner.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }
        for ev in self.events.iter() {
            self.inner.handle_event(ev);
        }
        Ok(())
    }

    /// Drives the poll loop in the calling thread until [`ServerHandle::stop`].
    /// Remaining connections are closed (close callbacks fire with no error)
    /// on the way out.
    pub fn run(&mut self) -> io::Result<()> {
        info!(addr = ?self.local_addr().ok(), "tcp server listening");
        while !self.inner.stop.load(Ordering::Acquire) {
            self.poll(None)?;
        }
        self.inner.shutdown_all();
        Ok(())
    }

    /// Frame-encodes and sends to one connection. A dead connection is
    /// closed (its close callback fires) and `Closed` is returned.
    pub fn send(&mut self, id: ConnId, payload: &[u8]) -> Result<(), NetError> {
        if payload.is_empty() {
            return Err(FrameError::EmptyPayload.into());
        }
        self.inner.send(id, payload)
    }

    /// Sends to every live connection, dropping any that fail.
    pub fn broadcast(&mut self, payload: &[u8]) -> Result<(), NetError> {
        if payload.is_empty() {
            return Err(FrameError::EmptyPayload.into());
        }
        self.inner.broadcast(payload);
        Ok(())
    }

    /// Locally initiated close; fires the close callback with no error.
    pub fn kick(&mut self, id: ConnId) -> bool {
        if let Some(idx) = self.inner.conns.iter().position(|p| p.id == id) {
            self.inner.close_at(idx, None);
            return true;
        }
        false
    }

    pub fn peer_addr(&self, id: ConnId) -> Option<SocketAddr> {
        self.inner.conns.iter().find(|p| p.id == id).map(|p| p.peer_addr)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.conns.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conn_ids_are_unique_and_monotonic() {
        let a = next_conn_id();
        let b = next_conn_id();
        assert!(b.0 > a.0);
        assert!(a.0 >= 2);
    }

    #[test]
    fn resolve_localhost() {
        let addr = resolve("127.0.0.1", 9000).unwrap();
        assert_eq!(addr.port(), 9000);
        assert!(resolve("definitely-not-a-host.invalid.", 1).is_err());
    }
}
