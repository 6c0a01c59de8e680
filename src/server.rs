//! Serving Scribe clients over TCP.
//!
//! Connections are served by a fixed pool of worker threads, one connection
//! per worker at a time. When every worker is busy, a new connection gets a
//! single `TRY_LATER` reply from an overflow thread and is closed.

use std::io::{self, Read, Write};
use std::net::{self, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::TrySendError;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::frame;
use crate::router::Router;
use crate::scribe::{Service, Stats};
use crate::Error;

/// How often blocked socket calls and the accept loop look at the shutdown
/// state.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const ACCEPT_INTERVAL: Duration = Duration::from_millis(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);
/// Time an overflow connection gets for each read or write.
const REJECT_TIMEOUT: Duration = Duration::from_secs(1);
const OVERFLOW_BACKLOG: usize = 16;

const RUNNING: u8 = 0;
const DRAINING: u8 = 1;
const FORCED: u8 = 2;

/// A handle that stops a running [`Input`].
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    state: Arc<AtomicU8>,
}

impl Shutdown {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops accepting connections. Calls in progress are completed, and
    /// each connection is closed once it is idle.
    pub fn trigger(&self) {
        let _ = self
            .state
            .compare_exchange(RUNNING, DRAINING, Ordering::SeqCst, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.state.load(Ordering::SeqCst) != RUNNING
    }

    fn force(&self) {
        self.state.store(FORCED, Ordering::SeqCst);
    }

    fn is_forced(&self) -> bool {
        self.state.load(Ordering::SeqCst) == FORCED
    }
}

/// Scribe server bound to a listening socket.
pub struct Input<R> {
    listener: TcpListener,
    service: Arc<Service<R>>,
    max_connections: usize,
    max_frame_size: usize,
    shutdown_timeout: Duration,
    shutdown: Shutdown,
}

impl<R: Router + 'static> Input<R> {
    /// Binds the listening socket described by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid or the address cannot be
    /// bound.
    pub fn bind(config: &Config, router: R) -> Result<Self, Error> {
        config.validate()?;
        let listener =
            TcpListener::bind((config.bind.as_str(), config.port)).map_err(|source| {
                Error::Bind {
                    addr: format!("{}:{}", config.bind, config.port),
                    source,
                }
            })?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            service: Arc::new(Service::new(config, router)),
            max_connections: config.max_connections,
            max_frame_size: config.max_frame_size,
            shutdown_timeout: config.shutdown_timeout(),
            shutdown: Shutdown::new(),
        })
    }

    /// # Errors
    ///
    /// Returns an error if the socket address cannot be read.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    #[must_use]
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    #[must_use]
    pub fn stats(&self) -> Arc<Stats> {
        Arc::clone(self.service.stats())
    }
}

impl<R: Router + 'static> super::Input for Input<R> {
    /// Accepts connections until the shutdown handle is triggered, then
    /// waits for open connections to close.
    fn run(self) -> Result<(), Error> {
        let Self {
            listener,
            service,
            max_connections,
            max_frame_size,
            shutdown_timeout,
            shutdown,
        } = self;
        info!(local_addr = %listener.local_addr()?, "accepting Scribe connections");

        let worker = Arc::new(Worker {
            service: Arc::clone(&service),
            shutdown: shutdown.clone(),
            active: AtomicUsize::new(0),
            max_frame_size,
        });
        let (conn_tx, conn_rx) = crossbeam_channel::bounded(max_connections);
        let workers = spawn_workers(&conn_rx, &worker, max_connections)?;
        drop(conn_rx);

        let (overflow_tx, overflow_rx) = crossbeam_channel::bounded::<TcpStream>(OVERFLOW_BACKLOG);
        let rejector = {
            let service = Arc::clone(&service);
            let shutdown = shutdown.clone();
            thread::Builder::new()
                .name("scribe-overflow".into())
                .spawn(move || {
                    for stream in overflow_rx {
                        if shutdown.is_triggered() {
                            let _ = stream.shutdown(net::Shutdown::Both);
                        } else {
                            reject(stream, &service, &shutdown, max_frame_size);
                        }
                    }
                })?
        };

        while !shutdown.is_triggered() {
            let (stream, peer) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_INTERVAL);
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "cannot accept a connection");
                    thread::sleep(POLL_INTERVAL);
                    continue;
                }
            };
            // Only this thread increments `active`, so the check cannot race
            // with another admission.
            if worker.active.load(Ordering::SeqCst) < max_connections {
                worker.active.fetch_add(1, Ordering::SeqCst);
                debug!(%peer, "connection accepted");
                if conn_tx.send(stream).is_err() {
                    warn!("every connection worker has exited");
                    break;
                }
            } else {
                service.stats().connection_rejected();
                debug!(%peer, "all connection workers are busy");
                if let Err(TrySendError::Full(_)) = overflow_tx.try_send(stream) {
                    warn!(%peer, "dropping connection; too many pending rejections");
                }
            }
        }

        info!("draining Scribe connections");
        drop(listener);
        drop(conn_tx);
        drop(overflow_tx);
        let deadline = Instant::now() + shutdown_timeout;
        while workers.iter().any(|w| !w.is_finished()) && Instant::now() < deadline {
            thread::sleep(ACCEPT_INTERVAL);
        }
        if workers.iter().any(|w| !w.is_finished()) {
            warn!("closing connections still open after the shutdown timeout");
            shutdown.force();
        }
        for w in workers.into_iter().chain([rejector]) {
            if w.join().is_err() {
                warn!("a connection thread panicked");
            }
        }
        info!("Scribe input stopped");
        Ok(())
    }
}

/// Spawns the connection worker pool.
fn spawn_workers<R: Router + 'static>(
    conn_rx: &crossbeam_channel::Receiver<TcpStream>,
    worker: &Arc<Worker<R>>,
    nthreads: usize,
) -> io::Result<Vec<JoinHandle<()>>> {
    (0..nthreads)
        .map(|id| {
            let rx = conn_rx.clone();
            let worker = Arc::clone(worker);
            thread::Builder::new()
                .name(format!("scribe-conn-{id}"))
                .spawn(move || {
                    while let Ok(stream) = rx.recv() {
                        worker.serve(stream);
                        worker.active.fetch_sub(1, Ordering::SeqCst);
                    }
                })
        })
        .collect()
}

struct Worker<R> {
    service: Arc<Service<R>>,
    shutdown: Shutdown,
    /// Connections handed to the pool and not yet closed.
    active: AtomicUsize,
    max_frame_size: usize,
}

impl<R: Router> Worker<R> {
    fn serve(&self, stream: TcpStream) {
        let peer = stream.peer_addr().ok();
        match self.session(&stream) {
            Ok(()) => debug!(?peer, "connection closed"),
            Err(e) => warn!(?peer, error = %e, "closing connection"),
        }
        let _ = stream.shutdown(net::Shutdown::Both);
    }

    /// Serves calls one at a time, in arrival order, until the peer closes
    /// the connection or the server drains.
    fn session(&self, stream: &TcpStream) -> Result<(), Error> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(POLL_INTERVAL))?;
        stream.set_write_timeout(Some(POLL_INTERVAL))?;
        stream.set_nodelay(true)?;

        let mut conn = Watched {
            stream,
            shutdown: &self.shutdown,
            read_patience: None,
            write_patience: WRITE_TIMEOUT,
        };
        while self.wait_for_request(stream)? {
            let Some(payload) = frame::read_frame(&mut conn, self.max_frame_size)? else {
                break;
            };
            let reply = self.service.process(&payload)?;
            frame::write_frame(&mut conn, &reply)?;
        }
        Ok(())
    }

    /// Waits until a request starts to arrive. Returns `false` if the peer
    /// closed the connection, or the server is draining and no request has
    /// started.
    fn wait_for_request(&self, stream: &TcpStream) -> io::Result<bool> {
        let mut buf = [0_u8; 1];
        loop {
            match stream.peek(&mut buf) {
                Ok(0) => return Ok(false),
                Ok(_) => return Ok(true),
                Err(e) if is_timeout(&e) => {
                    if self.shutdown.is_triggered() {
                        return Ok(false);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }
}

/// A socket that keeps waiting through its `POLL_INTERVAL` timeouts, until
/// the server forces connections closed or the call runs out of patience.
struct Watched<'a> {
    stream: &'a TcpStream,
    shutdown: &'a Shutdown,
    /// Longest a single read may wait. `None` waits until forced.
    read_patience: Option<Duration>,
    write_patience: Duration,
}

impl Watched<'_> {
    fn retry<T>(
        &self,
        patience: Option<Duration>,
        mut call: impl FnMut() -> io::Result<T>,
    ) -> io::Result<T> {
        let started = Instant::now();
        loop {
            match call() {
                Err(e) if is_timeout(&e) => {
                    if self.shutdown.is_forced() {
                        return Err(io::Error::new(
                            io::ErrorKind::ConnectionAborted,
                            "server is shutting down",
                        ));
                    }
                    if patience.is_some_and(|p| started.elapsed() >= p) {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "peer is not responding",
                        ));
                    }
                }
                result => return result,
            }
        }
    }
}

impl Read for Watched<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut stream = self.stream;
        self.retry(self.read_patience, || stream.read(buf))
    }
}

impl Write for Watched<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut stream = self.stream;
        self.retry(Some(self.write_patience), || stream.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut stream = self.stream;
        self.retry(Some(self.write_patience), || stream.flush())
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Answers one call on `stream` with `TRY_LATER` and closes it.
fn reject<R: Router>(
    stream: TcpStream,
    service: &Service<R>,
    shutdown: &Shutdown,
    max_frame_size: usize,
) {
    let peer = stream.peer_addr().ok();
    if let Err(e) = reject_session(&stream, service, shutdown, max_frame_size) {
        debug!(?peer, error = %e, "cannot answer rejected connection");
    }
    let _ = stream.shutdown(net::Shutdown::Both);
}

fn reject_session<R: Router>(
    stream: &TcpStream,
    service: &Service<R>,
    shutdown: &Shutdown,
    max_frame_size: usize,
) -> Result<(), Error> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(POLL_INTERVAL))?;
    stream.set_write_timeout(Some(POLL_INTERVAL))?;
    let mut conn = Watched {
        stream,
        shutdown,
        read_patience: Some(REJECT_TIMEOUT),
        write_patience: REJECT_TIMEOUT,
    };
    if let Some(payload) = frame::read_frame(&mut conn, max_frame_size)? {
        let reply = service.reject(&payload)?;
        frame::write_frame(&mut conn, &reply)?;
    }
    Ok(())
}
