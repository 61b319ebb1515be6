use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use crossbeam_channel::{Receiver, Sender, unbounded};
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, info};

use crate::{
    error::NetError,
    frame::FrameError,
    resolve,
    tcp::{
        server::{ConnId, next_conn_id},
        stream::{Round, TcpConnection},
    },
};

const CONN: Token = Token(0);
const WAKER: Token = Token(1);

type OnOpen = Box<dyn FnOnce(io::Result<SocketAddr>) + Send>;
type OnData = Box<dyn FnMut(&mut ClientCtx<'_>, &[u8]) + Send>;
type OnClose = Box<dyn FnOnce(Option<io::Error>) + Send>;

/// Reply/close surface handed to the client data callback.
pub struct ClientCtx<'a> {
    out: &'a mut Vec<Vec<u8>>,
    close: &'a mut bool,
}

impl ClientCtx<'_> {
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

/// Cross-thread surface of a running [`TcpClient`]: post payloads to the
/// reactor and stop the loop.
#[derive(Clone)]
pub struct ClientHandle {
    stop: Arc<AtomicBool>,
    dead: Arc<AtomicBool>,
    waker: Arc<Waker>,
    tx: Sender<Vec<u8>>,
}

impl ClientHandle {
    /// Frame-encodes and enqueues; the reactor drains asynchronously.
    /// Payloads posted before the connection opens are held back and
    /// flushed in order once it does.
    pub fn send(&self, payload: &[u8]) -> Result<(), NetError> {
        if payload.is_empty() {
            return Err(FrameError::EmptyPayload.into());
        }
        if self.dead.load(Ordering::Acquire) {
            return Err(NetError::Closed);
        }
        self.tx.send(payload.to_vec()).map_err(|_| NetError::Closed)?;
        let _ = self.waker.wake();
        Ok(())
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.waker.wake();
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }
}

/// Framed TCP client. One-shot: construct, install callbacks, [`run`].
///
/// `run` resolves the host, connects non-blocking and drives the poll loop
/// in the calling thread. The open callback fires exactly once, with the
/// peer address or with the failure cause (resolve, refusal, abort). The
/// close callback fires exactly once after a successful open, carrying the
/// terminal error or `None` for a local stop.
///
/// [`run`]: TcpClient::run
pub struct TcpClient {
    host: String,
    port: u16,
    id: ConnId,
    max_payload: usize,
    socket_buf_size: Option<usize>,
    poll: Poll,
    events: Events,
    stop: Arc<AtomicBool>,
    dead: Arc<AtomicBool>,
    waker: Arc<Waker>,
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    on_open: Option<OnOpen>,
    on_data: Option<OnData>,
    on_close: Option<OnClose>,
}

impl TcpClient {
    pub fn new(host: impl Into<String>, port: u16) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let (tx, rx) = unbounded();
        Ok(Self {
            host: host.into(),
            port,
            id: next_conn_id(),
            max_payload: crate::frame::DEFAULT_MAX_PAYLOAD,
            socket_buf_size: None,
            poll,
            events: Events::with_capacity(64),
            stop: Arc::new(AtomicBool::new(false)),
            dead: Arc::new(AtomicBool::new(false)),
            waker,
            tx,
            rx,
            on_open: None,
            on_data: None,
            on_close: None,
        })
    }

    #[inline]
    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn with_max_payload(mut self, max: usize) -> Self {
        self.max_payload = max;
        self
    }

    pub fn with_socket_buf_size(mut self, size: usize) -> Self {
        self.socket_buf_size = Some(size);
        self
    }

    pub fn set_open_callback<F>(&mut self, cb: F)
    where
        F: FnOnce(io::Result<SocketAddr>) + Send + 'static,
    {
        self.on_open = Some(Box::new(cb));
    }

    pub fn set_data_callback<F>(&mut self, cb: F)
    where
        F: FnMut(&mut ClientCtx<'_>, &[u8]) + Send + 'static,
    {
        self.on_data = Some(Box::new(cb));
    }

    pub fn set_close_callback<F>(&mut self, cb: F)
    where
        F: FnOnce(Option<io::Error>) + Send + 'static,
    {
        self.on_close = Some(Box::new(cb));
    }

    pub fn handle(&self) -> ClientHandle {
        ClientHandle {
            stop: self.stop.clone(),
            dead: self.dead.clone(),
            waker: self.waker.clone(),
            tx: self.tx.clone(),
        }
    }

    /// Connects and drives the loop until the peer closes, an error kills
    /// the stream, or [`ClientHandle::stop`] fires. Consumes the client:
    /// after `run` returns the instance is gone and the handle is dead.
    pub fn run(mut self) -> io::Result<()> {
        let on_open = self.on_open.take();
        let addr = match resolve(&self.host, self.port) {
            Ok(addr) => addr,
            Err(err) => {
                self.dead.store(true, Ordering::Release);
                if let Some(cb) = on_open {
                    let err = io::Error::new(io::ErrorKind::NotFound, err.to_string());
                    crate::shielded("open", || cb(Err(err)));
                }
                return Ok(());
            }
        };
        let stream = match mio::net::TcpStream::connect(addr) {
            Ok(stream) => stream,
            Err(err) => {
                self.dead.store(true, Ordering::Release);
                if let Some(cb) = on_open {
                    crate::shielded("open", || cb(Err(err)));
                }
                return Ok(());
            }
        };
        let mut conn =
            TcpConnection::new(stream, addr, CONN, self.max_payload, self.socket_buf_size)?;
        self.poll.registry().register(
            conn.stream_mut(),
            CONN,
            Interest::READABLE | Interest::WRITABLE,
        )?;

        let mut on_open = on_open;
        let mut opened = false;
        // Payloads posted before the socket finished connecting.
        let mut held_back: Vec<Vec<u8>> = Vec::new();
        // Some(err) once the connection is over.
        let mut terminal: Option<Option<io::Error>> = None;

        'outer: while terminal.is_none() {
            if self.stop.load(Ordering::Acquire) {
                terminal = Some(None);
                break;
            }
            match self.poll.poll(&mut self.events, None) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
            for ev in self.events.iter() {
                match ev.token() {
                    WAKER => {
                        if self.stop.load(Ordering::Acquire) {
                            terminal = Some(None);
                            break 'outer;
                        }
                        while let Ok(payload) = self.rx.try_recv() {
                            held_back.push(payload);
                        }
                        if opened {
                            let round = flush(&mut conn, &self.poll, &mut held_back);
                            if let Round::Closed(err) = round {
                                terminal = Some(err);
                                break 'outer;
                            }
                        }
                    }
                    CONN => {
                        if !opened {
                            match conn.stream_mut().take_error() {
                                Ok(Some(err)) => {
                                    debug!(?err, ?addr, "connect failed");
                                    self.cleanup(&mut conn);
                                    if let Some(cb) = on_open.take() {
                                        crate::shielded("open", || cb(Err(err)));
                                    }
                                    return Ok(());
                                }
                                Ok(None) => {}
                                Err(err) => {
                                    self.cleanup(&mut conn);
                                    if let Some(cb) = on_open.take() {
                                        crate::shielded("open", || cb(Err(err)));
                                    }
                                    return Ok(());
                                }
                            }
                            match conn.stream_mut().peer_addr() {
                                Ok(peer) => {
                                    opened = true;
                                    info!(?peer, id = self.id.0, "connected");
                                    if let Some(cb) = on_open.take() {
                                        crate::shielded("open", || cb(Ok(peer)));
                                    }
                                    while let Ok(payload) = self.rx.try_recv() {
                                        held_back.push(payload);
                                    }
                                    let round = flush(&mut conn, &self.poll, &mut held_back);
                                    if let Round::Closed(err) = round {
                                        terminal = Some(err);
                                        break 'outer;
                                    }
                                }
                                // Still connecting; wait for the next event.
                                Err(ref e) if e.kind() == io::ErrorKind::NotConnected => continue,
                                Err(err) => {
                                    self.cleanup(&mut conn);
                                    if let Some(cb) = on_open.take() {
                                        crate::shielded("open", || cb(Err(err)));
                                    }
                                    return Ok(());
                                }
                            }
                        }

                        if ev.is_readable() {
                            let mut out: Vec<Vec<u8>> = Vec::new();
                            let mut close_req = false;
                            let on_data = &mut self.on_data;
                            let round = conn.read_round(&mut |frame| {
                                if let Some(cb) = on_data.as_mut() {
                                    let mut ctx =
                                        ClientCtx { out: &mut out, close: &mut close_req };
                                    crate::shielded("data", || cb(&mut ctx, frame));
                                }
                            });
                            if let Round::Closed(err) = round {
                                terminal = Some(err);
                                break 'outer;
                            }
                            let round = flush(&mut conn, &self.poll, &mut out);
                            if let Round::Closed(err) = round {
                                terminal = Some(err);
                                break 'outer;
                            }
                            if close_req {
                                terminal = Some(None);
                                break 'outer;
                            }
                        }
                        if ev.is_writable() {
                            if let Round::Closed(err) = conn.drain_backlog(self.poll.registry())
                            {
                                terminal = Some(err);
                                break 'outer;
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        self.cleanup(&mut conn);
        let terminal = terminal.unwrap_or(None);
        if opened {
            if let Some(cb) = self.on_close.take() {
                crate::shielded("close", || cb(terminal));
            }
        } else if let Some(cb) = on_open.take() {
            // Stopped before the connect completed.
            crate::shielded("open", || {
                cb(Err(io::Error::from(io::ErrorKind::ConnectionAborted)));
            });
        }
        Ok(())
    }

    fn cleanup(&self, conn: &mut TcpConnection) {
        self.dead.store(true, Ordering::Release);
        conn.close(self.poll.registry());
    }
}

fn flush(conn: &mut TcpConnection, poll: &Poll, pending: &mut Vec<Vec<u8>>) -> Round {
    for payload in pending.drain(..) {
        let round = conn.send(poll.registry(), &payload);
        if round.is_closed() {
            return round;
        }
    }
    Round::Alive
}
