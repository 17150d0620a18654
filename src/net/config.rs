use std::{io, net::TcpStream, time::Duration};

use socket2::{SockRef, TcpKeepalive};

/// Server side socket settings.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address to bind, e.g. `127.0.0.1` or `0.0.0.0`.
    pub bind_addr: String,
    /// Port to bind. `0` picks an ephemeral port; see
    /// [`Server::local_addr`](super::Server::local_addr).
    pub bind_port: u16,
    /// Read/write timeout applied to every accepted connection. A connection
    /// that stays silent longer than this is closed. `None` disables it.
    pub idle_timeout: Option<Duration>,
    /// TCP keep-alive period. `None` leaves the OS default.
    pub keep_alive: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            bind_port: 3320,
            idle_timeout: None,
            keep_alive: Some(Duration::from_secs(300)),
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: impl Into<String>, bind_port: u16) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            bind_port,
            ..Default::default()
        }
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn with_keep_alive(mut self, period: Duration) -> Self {
        self.keep_alive = Some(period);
        self
    }

    pub(crate) fn address(&self) -> String {
        if self.bind_addr.contains(':') {
            format!("[{}]:{}", self.bind_addr, self.bind_port)
        } else {
            format!("{}:{}", self.bind_addr, self.bind_port)
        }
    }
}

/// Client side pool settings.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Target addresses in `host:port` form.
    pub addrs: Vec<String>,
    /// Maximum live connections per address.
    pub max_conn: usize,
    /// Bounds both dialing and waiting for a free pooled connection.
    pub dial_timeout: Duration,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub keep_alive: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addrs: Vec::new(),
            max_conn: 1,
            dial_timeout: Duration::from_secs(5),
            read_timeout: None,
            write_timeout: None,
            keep_alive: Some(Duration::from_secs(300)),
        }
    }
}

impl ClientConfig {
    pub fn new<I, S>(addrs: I, max_conn: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            addrs: addrs.into_iter().map(Into::into).collect(),
            max_conn,
            ..Default::default()
        }
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), super::Error> {
        if self.addrs.is_empty() {
            return Err(super::Error::InvalidConfig("at least one address is required"));
        }
        if self.max_conn == 0 {
            return Err(super::Error::InvalidConfig("max_conn must be positive"));
        }
        Ok(())
    }
}

/// Applies timeouts and keep-alive to a connected socket. Zero durations are
/// treated as "disabled".
pub(crate) fn tune_stream(
    stream: &TcpStream,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    keep_alive: Option<Duration>,
) -> io::Result<()> {
    let enabled = |d: Option<Duration>| d.filter(|d| !d.is_zero());

    stream.set_nodelay(true)?;
    stream.set_read_timeout(enabled(read_timeout))?;
    stream.set_write_timeout(enabled(write_timeout))?;
    if let Some(period) = enabled(keep_alive) {
        SockRef::from(stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(period))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_address_formats() {
        assert_eq!(ServerConfig::new("127.0.0.1", 80).address(), "127.0.0.1:80");
        assert_eq!(ServerConfig::new("::1", 80).address(), "[::1]:80");
    }

    #[test]
    fn zero_timeouts_disable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();

        tune_stream(
            &stream,
            Some(Duration::ZERO),
            Some(Duration::from_secs(2)),
            Some(Duration::from_secs(60)),
        )
        .unwrap();
        assert_eq!(stream.read_timeout().unwrap(), None);
        assert_eq!(stream.write_timeout().unwrap(), Some(Duration::from_secs(2)));
        assert!(stream.nodelay().unwrap());
    }

    #[test]
    fn client_config_validation() {
        assert!(ClientConfig::new(["127.0.0.1:1"], 1).validate().is_ok());
        assert!(ClientConfig::new(Vec::<String>::new(), 1).validate().is_err());
        assert!(ClientConfig::new(["127.0.0.1:1"], 0).validate().is_err());
    }
}
