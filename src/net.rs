/*!
 * Network Layer and Event Loop
 *
 * The listener socket is bound once and shared by several worker threads.
 * Each worker runs its own mio event loop, accepts from the shared listener
 * and drives the clients it accepted. All workers hand the same `Store`
 * to their connections.
 */

use crate::config::Config;
use crate::conn::{Connection, Flow, READ_BUF};
use crate::storage::{spawn_sweeper, Store, Sweeper};
use anyhow::{anyhow, Context, Result};
use bytes::{Buf, BytesMut};
use hashbrown::HashMap;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CLIENT: usize = 2;

/// Stop reading from a client while this many reply bytes are unsent
const WBUF_HIGH_WATER: usize = 1024 * 1024;

/// Bind a non-blocking TCP listener
///
/// Uses socket2 so SO_REUSEADDR is set before binding and the backlog can be
/// chosen explicitly.
pub fn bind_listener(addr: SocketAddr) -> Result<std::net::TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    #[cfg(unix)]
    socket.set_reuse_address(true)?;

    socket.set_nonblocking(true)?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("bind {}", addr))?;
    socket.listen(1024)?;

    Ok(socket.into())
}

/// A bound, not yet running server
///
/// Owns the store that every connection shares.
pub struct Server {
    listener: std::net::TcpListener,
    store: Arc<Store>,
    config: Config,
}

impl Server {
    /// Bind the configured address with a fresh, empty store
    pub fn bind(config: Config) -> Result<Self> {
        Self::with_store(config, Arc::new(Store::new()))
    }

    pub fn with_store(config: Config, store: Arc<Store>) -> Result<Self> {
        let listener = bind_listener(config.bind)?;
        Ok(Self {
            listener,
            store,
            config,
        })
    }

    /// Actual bound address, useful when binding port 0
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Spawn the worker threads and the expiry sweeper
    pub fn start(self) -> Result<ServerHandle> {
        let addr = self.local_addr()?;
        let threads = self.config.worker_count();
        let shutdown = Arc::new(AtomicBool::new(false));

        let sweeper = match self.config.sweep_interval() {
            Some(every) => Some(spawn_sweeper(self.store.clone(), every)?),
            None => None,
        };

        log::info!("ferrokv listening on {} with {} worker threads", addr, threads);

        let mut wakers = Vec::with_capacity(threads);
        let mut workers = Vec::with_capacity(threads);
        for id in 0..threads {
            let poll = Poll::new()?;
            let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
            let listener = self.listener.try_clone()?;
            let store = self.store.clone();
            let shutdown = shutdown.clone();

            let handle = std::thread::Builder::new()
                .name(format!("worker-{}", id))
                .spawn(move || {
                    let res = run_worker_loop(id, poll, listener, store, shutdown);
                    if let Err(e) = &res {
                        log::warn!("worker {} failed: {:#}", id, e);
                    }
                    res
                })?;

            wakers.push(waker);
            workers.push(handle);
        }

        Ok(ServerHandle {
            addr,
            shutdown,
            wakers,
            workers,
            sweeper,
        })
    }

    /// Start and block until every worker exits
    pub fn run(self) -> Result<()> {
        self.start()?.join()
    }
}

/// Running server
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    wakers: Vec<Arc<Waker>>,
    workers: Vec<JoinHandle<Result<()>>>,
    sweeper: Option<Sweeper>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Ask every worker to stop, closing all client connections
    pub fn shutdown(self) -> Result<()> {
        self.shutdown.store(true, Ordering::Release);
        for w in &self.wakers {
            w.wake()?;
        }
        self.join()
    }

    /// Wait for the workers to exit
    pub fn join(mut self) -> Result<()> {
        let mut first_err = None;
        for h in self.workers.drain(..) {
            let res = h.join().map_err(|_| anyhow!("worker thread panicked"))?;
            if let Err(e) = res {
                first_err.get_or_insert(e);
            }
        }
        if let Some(s) = self.sweeper.take() {
            s.stop();
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Socket plus connection state for one accepted client
struct Client {
    sock: TcpStream,
    conn: Connection,
    wbuf: BytesMut,
    /// No more input will be read; close once `wbuf` drains
    closing: bool,
    /// Reading stopped at the high-water mark; resume once `wbuf` drains
    paused: bool,
}

impl Client {
    fn new(sock: TcpStream, store: Arc<Store>) -> Self {
        Self {
            sock,
            conn: Connection::new(store),
            wbuf: BytesMut::new(),
            closing: false,
            paused: false,
        }
    }

    /// Handle a readiness event, returning true when the client should be dropped
    ///
    /// A paused client is read again on any event, since readiness is
    /// edge-triggered and the unread input will not be signalled twice.
    fn on_event(&mut self, readable: bool, tmp_buf: &mut [u8]) -> bool {
        if (readable || self.paused) && !self.closing {
            self.paused = false;
            loop {
                if self.wbuf.len() >= WBUF_HIGH_WATER {
                    if let Err(e) = self.flush() {
                        log::debug!("write error: {}", e);
                        return true;
                    }
                    if self.wbuf.len() >= WBUF_HIGH_WATER {
                        self.paused = true;
                        break;
                    }
                }
                match self.sock.read(tmp_buf) {
                    Ok(0) => {
                        self.closing = true;
                        break;
                    }
                    Ok(n) => {
                        if self.conn.process(&tmp_buf[..n], &mut self.wbuf) == Flow::Close {
                            self.closing = true;
                            break;
                        }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(ref e) if would_block(e) => break,
                    Err(e) => {
                        log::debug!("read error: {}", e);
                        return true;
                    }
                }
            }
        }

        if let Err(e) = self.flush() {
            log::debug!("write error: {}", e);
            return true;
        }

        self.closing && self.wbuf.is_empty()
    }

    fn flush(&mut self) -> io::Result<()> {
        while !self.wbuf.is_empty() {
            match self.sock.write(&self.wbuf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.wbuf.advance(n),
                Err(ref e) if would_block(e) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn interest(&self) -> Interest {
        // A paused client needs one more event to resume, even once drained
        match (self.closing, self.wbuf.is_empty() && !self.paused) {
            (true, _) => Interest::WRITABLE,
            (false, true) => Interest::READABLE,
            (false, false) => Interest::READABLE | Interest::WRITABLE,
        }
    }
}

/// Event loop for a single worker thread
fn run_worker_loop(
    id: usize,
    mut poll: Poll,
    listener: std::net::TcpListener,
    store: Arc<Store>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let mut events = Events::with_capacity(1024);
    let mut listener = TcpListener::from_std(listener);
    poll.registry()
        .register(&mut listener, LISTENER, Interest::READABLE)?;

    let mut clients: HashMap<usize, Client> = HashMap::new();
    let mut next_tok = FIRST_CLIENT;
    let mut tmp_buf = [0u8; READ_BUF];

    loop {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e.into());
        }
        if shutdown.load(Ordering::Acquire) {
            log::debug!("worker {} stopping with {} clients", id, clients.len());
            return Ok(());
        }

        for ev in events.iter() {
            match ev.token() {
                WAKER => {}
                LISTENER => loop {
                    match listener.accept() {
                        Ok((mut sock, peer)) => {
                            sock.set_nodelay(true).ok();
                            let tok = next_tok;
                            next_tok = next_tok.checked_add(1).unwrap_or(FIRST_CLIENT);

                            if let Err(e) =
                                poll.registry()
                                    .register(&mut sock, Token(tok), Interest::READABLE)
                            {
                                log::warn!("worker {} register {}: {}", id, peer, e);
                                continue;
                            }

                            log::debug!("worker {} accepted {} as {}", id, peer, tok);
                            clients.insert(tok, Client::new(sock, store.clone()));
                        }
                        Err(ref e) if would_block(e) => break,
                        Err(e) => {
                            log::warn!("worker {} accept error: {}", id, e);
                            break;
                        }
                    }
                },
                Token(t) => {
                    let Some(client) = clients.get_mut(&t) else {
                        continue;
                    };
                    let mut remove = client.on_event(ev.is_readable(), &mut tmp_buf);
                    if !remove {
                        let interest = client.interest();
                        remove = poll
                            .registry()
                            .reregister(&mut client.sock, Token(t), interest)
                            .is_err();
                    }
                    if remove {
                        log::debug!("worker {} closing client {}", id, t);
                        clients.remove(&t);
                    }
                }
            }
        }
    }
}

/// Check if an I/O error indicates the operation would block
#[inline]
fn would_block(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    #[test]
    fn reading_pauses_while_replies_back_up() {
        let store = Arc::new(Store::new());
        store.set(Bytes::from_static(b"k"), Bytes::from(vec![b'x'; 1024]), None);

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut peer = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        let mut client = Client::new(TcpStream::from_std(accepted), store);

        // The peer pipelines GETs and never reads a reply
        let writer = std::thread::spawn(move || {
            let req = b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n".repeat(20_000);
            let _ = peer.write_all(&req);
        });

        let mut tmp_buf = [0u8; READ_BUF];
        let mut max_pending = 0;
        for _ in 0..400 {
            assert!(!client.on_event(true, &mut tmp_buf));
            max_pending = max_pending.max(client.wbuf.len());
            if client.paused {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        assert!(client.paused);
        // One read chunk of GETs can push at most READ_BUF / 22 replies past the mark
        assert!(max_pending < WBUF_HIGH_WATER + (READ_BUF / 22 + 1) * 1100);

        drop(client);
        let _ = writer.join();
    }
}
