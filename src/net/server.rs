use std::{
    io::{self, ErrorKind},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc, Mutex, OnceLock, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use log::{debug, info, warn};

use super::{
    Error, ServerConfig,
    config::tune_stream,
    dispatcher::Dispatcher,
    handler::Handler,
    latch::Latch,
    supervisor::Supervisor,
};

const WAKE_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Listening,
    Draining,
    Closed,
}

/// Accepts connections and serves each one on its own thread.
///
/// `listen_and_serve` blocks the calling thread, so the server is usually
/// shared behind an [`Arc`] with whoever calls [`Server::shutdown`].
pub struct Server {
    config: ServerConfig,
    dispatcher: Mutex<Option<Arc<dyn Dispatcher>>>,
    state: Mutex<ServerState>,
    ready: Latch,
    stopped: Latch,
    local_addr: OnceLock<SocketAddr>,
    shutdown: Arc<AtomicBool>,
    supervisor: Arc<Supervisor>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            dispatcher: Mutex::new(None),
            state: Mutex::new(ServerState::Created),
            ready: Latch::new(),
            stopped: Latch::new(),
            local_addr: OnceLock::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            supervisor: Supervisor::new(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Installs the request dispatcher. Only allowed before serving starts.
    pub fn set_dispatcher<D: Dispatcher>(&self, dispatcher: D) -> Result<(), Error> {
        let state = self.lock_state();
        if *state != ServerState::Created {
            return Err(Error::DispatcherLocked);
        }
        *self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(dispatcher));
        Ok(())
    }

    pub fn state(&self) -> ServerState {
        *self.lock_state()
    }

    /// Fires once the listener is bound, before the first accept.
    pub fn ready(&self) -> &Latch {
        &self.ready
    }

    pub fn wait_ready(&self, timeout: Duration) -> bool {
        self.ready.wait_timeout(timeout)
    }

    /// Address the listener is bound to, once ready.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Connections currently being served.
    pub fn active_connections(&self) -> usize {
        self.supervisor.active()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ServerState) {
        *self.lock_state() = state;
    }

    fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Binds the configured address and serves until [`Server::shutdown`].
    pub fn listen_and_serve(&self) -> Result<(), Error> {
        {
            let mut state = self.lock_state();
            match *state {
                ServerState::Created => *state = ServerState::Listening,
                ServerState::Listening => return Err(Error::AlreadyServing),
                ServerState::Draining | ServerState::Closed => return Err(Error::ServerClosed),
            }
        }

        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(dispatcher) = dispatcher else {
            self.set_state(ServerState::Created);
            return Err(Error::NoDispatcher);
        };

        let listener = match self.bind() {
            Ok(listener) => listener,
            Err(e) => {
                self.set_state(ServerState::Closed);
                self.stopped.fire();
                return Err(e);
            }
        };

        self.ready.fire();
        let result = self.accept_loop(&listener, &dispatcher);
        drop(listener);
        self.stopped.fire();

        if let Err(e) = &result {
            warn!("accept loop failed: {e}");
            self.shutdown.store(true, Ordering::SeqCst);
            self.supervisor.signal_all();
            self.set_state(ServerState::Closed);
        }
        result
    }

    fn bind(&self) -> Result<TcpListener, Error> {
        let addr = self.config.address();
        let bind_err = |source| Error::Bind {
            addr: addr.clone(),
            source,
        };

        let listener = TcpListener::bind(addr.as_str()).map_err(bind_err)?;
        let local = listener.local_addr().map_err(bind_err)?;
        let _ = self.local_addr.set(local);
        info!("listening at {local}");
        Ok(listener)
    }

    fn accept_loop(
        &self,
        listener: &TcpListener,
        dispatcher: &Arc<dyn Dispatcher>,
    ) -> Result<(), Error> {
        let mut backoff = Duration::ZERO;
        loop {
            if self.shutting_down() {
                return Ok(());
            }

            match listener.accept() {
                Ok((stream, peer)) => {
                    backoff = Duration::ZERO;
                    if self.shutting_down() {
                        return Ok(());
                    }
                    self.handle(stream, peer, dispatcher);
                }
                Err(_) if self.shutting_down() => return Ok(()),
                Err(e) if is_transient(&e) => {
                    backoff = (backoff * 2).clamp(Duration::from_millis(5), MAX_ACCEPT_BACKOFF);
                    warn!("accept failed: {e}; retrying in {backoff:?}");
                    thread::sleep(backoff);
                }
                Err(e) => return Err(Error::Accept(e)),
            }
        }
    }

    fn handle(&self, stream: TcpStream, peer: SocketAddr, dispatcher: &Arc<dyn Dispatcher>) {
        let timeout = self.config.idle_timeout;
        if let Err(e) = tune_stream(&stream, timeout, timeout, self.config.keep_alive) {
            warn!("dropping connection from {peer}: {e}");
            return;
        }

        let dispatcher = Arc::clone(dispatcher);
        let shutdown = Arc::clone(&self.shutdown);
        let spawned = self.supervisor.spawn(stream, move |id, stream| {
            Handler::new(id, stream, dispatcher, shutdown).run();
        });
        match spawned {
            Ok(id) => debug!("connection {id} accepted from {peer}"),
            Err(e) => warn!("failed to spawn handler for {peer}: {e}"),
        }
    }

    /// Unblocks a pending `accept` by connecting to ourselves.
    fn wake_acceptor(&self) {
        let Some(mut addr) = self.local_addr() else {
            return;
        };
        if addr.ip().is_unspecified() {
            let loopback: IpAddr = match addr {
                SocketAddr::V4(_) => Ipv4Addr::LOCALHOST.into(),
                SocketAddr::V6(_) => Ipv6Addr::LOCALHOST.into(),
            };
            addr.set_ip(loopback);
        }
        if let Err(e) = TcpStream::connect_timeout(&addr, WAKE_TIMEOUT) {
            debug!("could not wake acceptor at {addr}: {e}");
        }
    }

    /// Stops accepting, lets in-flight requests finish and closes every
    /// connection. Connections still open after `grace` are force-closed and
    /// reported through [`Error::ShutdownTimeout`]; the server is closed
    /// either way. Calling it again is a no-op.
    pub fn shutdown(&self, grace: Duration) -> Result<(), Error> {
        {
            let mut state = self.lock_state();
            match *state {
                ServerState::Closed => return Ok(()),
                ServerState::Created => {
                    *state = ServerState::Closed;
                    self.shutdown.store(true, Ordering::SeqCst);
                    return Ok(());
                }
                ServerState::Listening | ServerState::Draining => {
                    *state = ServerState::Draining;
                }
            }
        }

        info!("shutting down, grace period {grace:?}");
        let deadline = Instant::now() + grace;
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake_acceptor();

        let listener_closed = self.stopped.wait_until(deadline);
        self.supervisor.signal_all();
        let remaining = self.supervisor.wait_until(deadline);
        self.set_state(ServerState::Closed);

        if !listener_closed || remaining > 0 {
            self.supervisor.force_close();
            warn!("shutdown deadline elapsed, {remaining} connection(s) force closed");
            return Err(Error::ShutdownTimeout { remaining });
        }
        info!("server closed");
        Ok(())
    }
}

fn is_transient(e: &io::Error) -> bool {
    if matches!(
        e.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::TimedOut
    ) {
        return true;
    }
    // EMFILE / ENFILE: out of file descriptors, retry once some are released
    cfg!(unix) && matches!(e.raw_os_error(), Some(23 | 24))
}
