use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    net::{Shutdown, TcpStream, ToSocketAddrs},
    ops::{Deref, DerefMut},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use log::{debug, trace};

use crate::protocol::{Message, ProtocolTransport};

use super::{ClientConfig, Error, config::tune_stream};

/// A client side connection to one server address.
pub struct Connection {
    addr: String,
    transport: ProtocolTransport<TcpStream>,
}

impl Connection {
    /// Connects to `addr`, trying every resolved address in turn.
    pub fn dial(addr: &str, config: &ClientConfig) -> Result<Self, Error> {
        let mut last = None;
        for candidate in addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&candidate, config.dial_timeout) {
                Ok(stream) => {
                    tune_stream(
                        &stream,
                        config.read_timeout,
                        config.write_timeout,
                        config.keep_alive,
                    )?;
                    debug!("connected to {addr} ({candidate})");
                    return Ok(Self {
                        addr: addr.to_string(),
                        transport: ProtocolTransport::new(stream),
                    });
                }
                Err(e) => last = Some(e),
            }
        }
        Err(Error::Transport(last.unwrap_or_else(|| {
            io::Error::new(ErrorKind::AddrNotAvailable, "no resolved addresses")
        })))
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn stream(&self) -> &TcpStream {
        self.transport.get_ref()
    }

    pub fn send(&mut self, message: &Message) -> Result<(), Error> {
        Ok(self.transport.write_message(message)?)
    }

    pub(crate) fn send_frame(&mut self, bytes: &[u8]) -> Result<(), Error> {
        Ok(self.transport.write_frame(bytes)?)
    }

    /// Next message, or `None` once the peer closed the connection.
    pub fn recv(&mut self) -> Result<Option<Message>, Error> {
        Ok(self.transport.read_message()?)
    }

    /// Sends one encoded request and waits for exactly one response.
    pub(crate) fn round_trip(&mut self, request: &[u8]) -> Result<Message, Error> {
        self.send_frame(request)?;
        self.recv()?.ok_or_else(|| {
            Error::Transport(io::Error::new(
                ErrorKind::UnexpectedEof,
                "connection closed before a response arrived",
            ))
        })
    }

    pub fn close(self) -> Result<(), Error> {
        match self.stream().shutdown(Shutdown::Both) {
            Err(e) if e.kind() != ErrorKind::NotConnected => Err(e.into()),
            _ => Ok(()),
        }
    }
}

fn close_logged(conn: Connection) {
    let addr = conn.addr.clone();
    if let Err(e) = conn.close() {
        debug!("closing connection to {addr} failed: {e}");
    }
}

#[derive(Default)]
struct Slot {
    idle: Vec<Connection>,
    in_use: usize,
}

#[derive(Default)]
struct PoolState {
    closed: bool,
    slots: HashMap<String, Slot>,
}

struct PoolInner {
    config: ClientConfig,
    state: Mutex<PoolState>,
    released: Condvar,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bounded, address keyed cache of client connections.
///
/// At most `max_conn` connections per address exist at any time, counting
/// both idle and checked out ones. Idle connections are not health-checked; a
/// stale one fails on its next use and is discarded by the caller.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                state: Mutex::new(PoolState::default()),
                released: Condvar::new(),
            }),
        }
    }

    /// Checks out a connection to `addr`: an idle one if available, a freshly
    /// dialed one while under the limit, otherwise waits for a release until
    /// the dial timeout elapses.
    pub fn acquire(&self, addr: &str) -> Result<PooledConnection, Error> {
        let max_conn = self.inner.config.max_conn;
        let timeout = self.inner.config.dial_timeout;
        let deadline = Instant::now() + timeout;

        let mut state = self.inner.lock();
        loop {
            if state.closed {
                return Err(Error::PoolClosed);
            }
            let slot = state.slots.entry(addr.to_string()).or_default();
            if let Some(conn) = slot.idle.pop() {
                slot.in_use += 1;
                trace!("reusing idle connection to {addr}");
                return Ok(self.checked_out(conn));
            }
            if slot.in_use < max_conn {
                slot.in_use += 1;
                break;
            }

            let now = Instant::now();
            if now >= deadline {
                debug!("pool for {addr} exhausted after {timeout:?}");
                return Err(Error::PoolExhausted {
                    addr: addr.to_string(),
                    waited: timeout,
                });
            }
            state = self
                .inner
                .released
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        drop(state);

        // the slot is reserved; dial without holding the lock
        let guard = SlotGuard {
            pool: Arc::clone(&self.inner),
            addr: addr.to_string(),
            settled: false,
        };
        let conn = Connection::dial(addr, &self.inner.config)?;
        Ok(PooledConnection { conn, slot: guard })
    }

    fn checked_out(&self, conn: Connection) -> PooledConnection {
        PooledConnection {
            slot: SlotGuard {
                pool: Arc::clone(&self.inner),
                addr: conn.addr.clone(),
                settled: false,
            },
            conn,
        }
    }

    /// Closes every idle connection. Checked out connections are closed when
    /// they come back; further `acquire` calls fail with
    /// [`Error::PoolClosed`].
    pub fn close(&self) {
        let idle: Vec<Connection> = {
            let mut state = self.inner.lock();
            state.closed = true;
            self.inner.released.notify_all();
            state
                .slots
                .values_mut()
                .flat_map(|slot| slot.idle.drain(..))
                .collect()
        };
        debug!("pool closed, dropping {} idle connection(s)", idle.len());
        for conn in idle {
            close_logged(conn);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Idle plus checked out connections to `addr`.
    pub fn live_connections(&self, addr: &str) -> usize {
        self.inner
            .lock()
            .slots
            .get(addr)
            .map_or(0, |slot| slot.idle.len() + slot.in_use)
    }

    pub fn idle_connections(&self, addr: &str) -> usize {
        self.inner
            .lock()
            .slots
            .get(addr)
            .map_or(0, |slot| slot.idle.len())
    }
}

/// Holds one unit of an address' connection budget. Dropping it without
/// settling gives the unit back.
///
/// Waiters for every address share one condvar, so each release wakes all of
/// them and lets the ones for other addresses park again.
struct SlotGuard {
    pool: Arc<PoolInner>,
    addr: String,
    settled: bool,
}

impl SlotGuard {
    /// Returns `conn` to the idle set, or closes it if the pool is closed.
    fn put_back(mut self, conn: Connection) {
        let mut state = self.pool.lock();
        let closed = state.closed;
        if let Some(slot) = state.slots.get_mut(&self.addr) {
            slot.in_use = slot.in_use.saturating_sub(1);
            if !closed {
                slot.idle.push(conn);
                self.settled = true;
                self.pool.released.notify_all();
                return;
            }
        }
        self.settled = true;
        self.pool.released.notify_all();
        drop(state);
        close_logged(conn);
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.pool.lock();
        if let Some(slot) = state.slots.get_mut(&self.addr) {
            slot.in_use = slot.in_use.saturating_sub(1);
        }
        self.pool.released.notify_all();
    }
}

/// A connection checked out of a [`ConnectionPool`].
///
/// Call [`release`](Self::release) after a clean exchange. Dropping it, or
/// calling [`discard`](Self::discard), closes the socket and frees its slot.
pub struct PooledConnection {
    conn: Connection,
    slot: SlotGuard,
}

impl PooledConnection {
    pub fn release(self) {
        let Self { conn, slot } = self;
        trace!("releasing connection to {}", conn.addr);
        slot.put_back(conn);
    }

    pub fn discard(self) {
        let Self { conn, slot } = self;
        debug!("discarding connection to {}", conn.addr);
        close_logged(conn);
        drop(slot);
    }

    /// Takes the connection out of the pool for good, freeing its slot.
    pub fn detach(self) -> Connection {
        let Self { conn, slot } = self;
        drop(slot);
        conn
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

#[cfg(test)]
mod tests {
    use std::{net::TcpListener, sync::mpsc, thread};

    use super::*;

    /// Accepts connections forever and keeps them open.
    fn sink() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        thread::spawn(move || {
            let mut held = Vec::new();
            for stream in listener.incoming().flatten() {
                held.push(stream);
            }
        });
        addr
    }

    fn pool(addr: &str, max_conn: usize, timeout: Duration) -> ConnectionPool {
        ConnectionPool::new(ClientConfig::new([addr], max_conn).with_dial_timeout(timeout))
    }

    #[test]
    fn reuses_released_connection() {
        let addr = sink();
        let pool = pool(&addr, 4, Duration::from_secs(1));

        let conn = pool.acquire(&addr).unwrap();
        let local = conn.stream().local_addr().unwrap();
        conn.release();
        assert_eq!(pool.idle_connections(&addr), 1);

        let conn = pool.acquire(&addr).unwrap();
        assert_eq!(conn.stream().local_addr().unwrap(), local);
        assert_eq!(pool.live_connections(&addr), 1);
        assert_eq!(pool.idle_connections(&addr), 0);
    }

    #[test]
    fn exhausted_pool_times_out() {
        let addr = sink();
        let pool = pool(&addr, 2, Duration::from_millis(50));

        let _a = pool.acquire(&addr).unwrap();
        let _b = pool.acquire(&addr).unwrap();
        let started = Instant::now();
        let err = pool.acquire(&addr).err().unwrap();

        assert!(matches!(err, Error::PoolExhausted { .. }));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(pool.live_connections(&addr), 2);
    }

    #[test]
    fn waiter_gets_released_connection() {
        let addr = sink();
        let pool = pool(&addr, 1, Duration::from_secs(5));
        let held = pool.acquire(&addr).unwrap();

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let pool = pool.clone();
            let addr = addr.clone();
            thread::spawn(move || {
                let conn = pool.acquire(&addr);
                tx.send(()).unwrap();
                conn.map(|c| c.release())
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        held.release();
        waiter.join().unwrap().unwrap();
        assert_eq!(pool.live_connections(&addr), 1);
    }

    #[test]
    fn release_wakes_waiter_for_its_own_address() {
        let (a, b) = (sink(), sink());
        let pool = ConnectionPool::new(
            ClientConfig::new([a.clone(), b.clone()], 1).with_dial_timeout(Duration::from_secs(2)),
        );
        let held_a = pool.acquire(&a).unwrap();
        let held_b = pool.acquire(&b).unwrap();

        let waiter = |addr: &String| {
            let pool = pool.clone();
            let addr = addr.clone();
            thread::spawn(move || {
                let started = Instant::now();
                pool.acquire(&addr).map(|c| {
                    c.release();
                    started.elapsed()
                })
            })
        };
        let waiter_b = waiter(&b);
        thread::sleep(Duration::from_millis(50));
        let waiter_a = waiter(&a);
        thread::sleep(Duration::from_millis(50));

        held_a.release();
        let waited = waiter_a.join().unwrap().unwrap();
        assert!(waited < Duration::from_secs(1), "waiter on {a} slept {waited:?}");

        held_b.release();
        waiter_b.join().unwrap().unwrap();
        assert_eq!(pool.live_connections(&a), 1);
        assert_eq!(pool.live_connections(&b), 1);
    }

    #[test]
    fn discard_and_drop_free_the_slot() {
        let addr = sink();
        let pool = pool(&addr, 1, Duration::from_millis(50));

        pool.acquire(&addr).unwrap().discard();
        assert_eq!(pool.live_connections(&addr), 0);

        drop(pool.acquire(&addr).unwrap());
        assert_eq!(pool.live_connections(&addr), 0);

        let conn = pool.acquire(&addr).unwrap().detach();
        assert_eq!(pool.live_connections(&addr), 0);
        conn.close().unwrap();
    }

    #[test]
    fn failed_dial_frees_the_slot() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let pool = pool(&addr, 1, Duration::from_millis(200));

        assert!(matches!(pool.acquire(&addr), Err(Error::Transport(_))));
        assert_eq!(pool.live_connections(&addr), 0);
        assert!(matches!(pool.acquire(&addr), Err(Error::Transport(_))));
    }

    #[test]
    fn closed_pool_rejects_acquire() {
        let addr = sink();
        let pool = pool(&addr, 2, Duration::from_secs(1));
        pool.acquire(&addr).unwrap().release();
        let out = pool.acquire(&addr).unwrap();

        pool.close();
        assert!(pool.is_closed());
        assert_eq!(pool.idle_connections(&addr), 0);
        assert!(matches!(pool.acquire(&addr), Err(Error::PoolClosed)));

        out.release();
        assert_eq!(pool.live_connections(&addr), 0);
    }

    #[test]
    fn close_wakes_waiters() {
        let addr = sink();
        let pool = pool(&addr, 1, Duration::from_secs(5));
        let _held = pool.acquire(&addr).unwrap();

        let waiter = {
            let pool = pool.clone();
            let addr = addr.clone();
            thread::spawn(move || pool.acquire(&addr).err())
        };
        thread::sleep(Duration::from_millis(20));
        pool.close();
        assert!(matches!(waiter.join().unwrap(), Some(Error::PoolClosed)));
    }
}
