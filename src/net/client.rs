use std::sync::atomic::{AtomicUsize, Ordering};

use log::debug;

use crate::protocol::{Message, Status, frame};

use super::{ClientConfig, ConnectionPool, Error, StreamChannel};

/// Picks the target address for the next request.
pub trait AddressSelector: Send + Sync {
    fn select<'a>(&self, addrs: &'a [String]) -> Option<&'a str>;
}

/// Cycles through the address list.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl AddressSelector for RoundRobin {
    fn select<'a>(&self, addrs: &'a [String]) -> Option<&'a str> {
        if addrs.is_empty() {
            return None;
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % addrs.len();
        addrs.get(i).map(String::as_str)
    }
}

/// Issues requests over pooled connections.
///
/// Every call checks out its own connection, so a `Client` can be shared
/// between threads without requests interleaving on a socket.
pub struct Client {
    addrs: Vec<String>,
    pool: ConnectionPool,
    selector: Box<dyn AddressSelector>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self, Error> {
        Self::with_selector(config, RoundRobin::default())
    }

    pub fn with_selector<S>(config: ClientConfig, selector: S) -> Result<Self, Error>
    where
        S: AddressSelector + 'static,
    {
        config.validate()?;
        Ok(Self {
            addrs: config.addrs.clone(),
            pool: ConnectionPool::new(config),
            selector: Box::new(selector),
        })
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    fn pick(&self) -> Result<&str, Error> {
        self.selector
            .select(&self.addrs)
            .ok_or(Error::InvalidConfig("no address available"))
    }

    /// Sends `req` and waits for its response.
    ///
    /// The connection goes back to the pool only after a clean exchange; on
    /// transport or protocol failure it is closed. A successful
    /// `CreateStream` sent this way also closes the connection, since it now
    /// carries a stream; use [`Client::create_stream`] to keep it.
    pub fn request(&self, req: &Message) -> Result<Message, Error> {
        let bytes = frame::encode(req).map_err(Error::Encoding)?;
        let addr = self.pick()?;
        let mut conn = self.pool.acquire(addr)?;

        match conn.round_trip(&bytes) {
            Ok(resp) if req.is_create_stream() && resp.status() == Status::Ok => {
                conn.discard();
                Ok(resp)
            }
            Ok(resp) => {
                conn.release();
                Ok(resp)
            }
            Err(e) => {
                debug!("request to {addr} failed: {e}");
                conn.discard();
                Err(e)
            }
        }
    }

    /// Sends a `CreateStream` request and, if the server accepts, turns the
    /// connection into a [`StreamChannel`] owned by the caller.
    pub fn create_stream(&self, req: &Message) -> Result<StreamChannel, Error> {
        if !req.is_create_stream() {
            return Err(Error::StreamRefused(Status::BadRequest));
        }
        let bytes = frame::encode(req).map_err(Error::Encoding)?;
        let addr = self.pick()?;
        let mut conn = self.pool.acquire(addr)?;

        let resp = match conn.round_trip(&bytes) {
            Ok(resp) => resp,
            Err(e) => {
                conn.discard();
                return Err(e);
            }
        };
        if resp.status() != Status::Ok {
            conn.release();
            return Err(Error::StreamRefused(resp.status()));
        }
        StreamChannel::open(conn.detach(), &resp)
    }

    /// Closes the pool; later requests fail with [`Error::PoolClosed`].
    pub fn close(&self) {
        self.pool.close();
    }
}
