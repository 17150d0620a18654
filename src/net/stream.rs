use std::{io::ErrorKind, time::Duration};

use log::debug;

use crate::protocol::{Extra, Message, OpCode, StreamExtra};

use super::{Connection, Error};

/// Client end of a stream channel: a connection that, after a successful
/// `CreateStream` exchange, only carries messages pushed by the server.
///
/// The channel owns its socket; it is never returned to a pool.
pub struct StreamChannel {
    id: u64,
    conn: Connection,
    done: bool,
}

impl StreamChannel {
    pub(crate) fn open(conn: Connection, created: &Message) -> Result<Self, Error> {
        // pushes arrive on the server's schedule, not within a request timeout
        conn.stream().set_read_timeout(None)?;
        let id = created.stream_id().unwrap_or_default();
        debug!("stream channel {id} open on {}", conn.addr());
        Ok(Self {
            id,
            conn,
            done: false,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), Error> {
        Ok(self.conn.stream().set_read_timeout(timeout)?)
    }

    /// Waits for the next pushed message. `None` means the server closed the
    /// channel.
    pub fn recv(&mut self) -> Result<Option<Message>, Error> {
        if self.done {
            return Ok(None);
        }
        let next = self.conn.recv();
        self.done = match &next {
            Ok(message) => message.is_none(),
            Err(Error::Transport(e)) => !matches!(
                e.kind(),
                ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
            ),
            Err(_) => true,
        };
        next
    }

    /// Lazily yields pushed messages until the channel closes. A read timeout
    /// is yielded as an error without ending the sequence.
    pub fn messages(&mut self) -> Messages<'_> {
        Messages { channel: self }
    }

    pub fn send(&mut self, message: &Message) -> Result<(), Error> {
        if self.done {
            return Err(Error::StreamClosed);
        }
        self.conn.send(message)
    }

    /// Asks the server for a `StreamPong`, delivered through [`recv`](Self::recv).
    pub fn ping(&mut self) -> Result<(), Error> {
        let ping = Message::stream(OpCode::StreamPing)
            .with_extra(Extra::Stream(StreamExtra { stream_id: self.id }));
        self.send(&ping)
    }

    pub fn close(self) -> Result<(), Error> {
        debug!("closing stream channel {}", self.id);
        self.conn.close()
    }
}

pub struct Messages<'a> {
    channel: &'a mut StreamChannel,
}

impl Iterator for Messages<'_> {
    type Item = Result<Message, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.channel.recv() {
            Ok(Some(message)) => Some(Ok(message)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        thread,
    };

    use super::*;
    use crate::{
        net::{Client, ClientConfig, DispatchError, ResponseWriter, Server, ServerConfig},
        protocol::Status,
    };

    /// Accepts streams and pushes `count` numbered messages on each.
    fn pusher(count: u8) -> impl Fn(&mut ResponseWriter, &Message) -> Result<(), DispatchError> {
        move |w: &mut ResponseWriter, _: &Message| -> Result<(), DispatchError> {
            w.set_status(Status::Ok);
            if let Some(sender) = w.stream().cloned() {
                thread::spawn(move || {
                    for n in 0..count {
                        let msg = Message::stream(OpCode::StreamMessage).with_body(vec![n]);
                        if sender.send(msg).is_err() {
                            return;
                        }
                    }
                });
            }
            Ok(())
        }
    }

    fn start(server: Server) -> (Arc<Server>, Client, thread::JoinHandle<Result<(), Error>>) {
        let server = Arc::new(server);
        let serving = Arc::clone(&server);
        let handle = thread::spawn(move || serving.listen_and_serve());
        assert!(server.wait_ready(Duration::from_secs(5)));

        let addr = server.local_addr().unwrap().to_string();
        let client = Client::new(ClientConfig::new([addr], 2)).unwrap();
        (server, client, handle)
    }

    fn serve<D>(dispatcher: D) -> (Arc<Server>, Client, thread::JoinHandle<Result<(), Error>>)
    where
        D: crate::net::Dispatcher,
    {
        let server = Server::new(ServerConfig::new("127.0.0.1", 0));
        server.set_dispatcher(dispatcher).unwrap();
        start(server)
    }

    #[test]
    fn receives_pushed_messages() {
        let (server, client, handle) = serve(pusher(3));

        let mut channel = client
            .create_stream(&Message::stream(OpCode::CreateStream))
            .unwrap();
        assert!(channel.id() > 0);

        let bodies: Vec<Vec<u8>> = channel
            .messages()
            .take(3)
            .map(|m| m.unwrap().into_body())
            .collect();
        assert_eq!(bodies, vec![vec![0], vec![1], vec![2]]);

        // the stream connection no longer counts against the pool
        let addr = server.local_addr().unwrap().to_string();
        assert_eq!(client.pool().live_connections(&addr), 0);

        channel.close().unwrap();
        server.shutdown(Duration::from_secs(5)).unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn ping_is_answered() {
        let (server, client, handle) = serve(pusher(0));
        let mut channel = client
            .create_stream(&Message::stream(OpCode::CreateStream))
            .unwrap();

        channel.ping().unwrap();
        let pong = channel.recv().unwrap().unwrap();
        assert_eq!(pong.op(), OpCode::StreamPong);
        assert_eq!(pong.stream_id(), Some(channel.id()));

        channel.close().unwrap();
        server.shutdown(Duration::from_secs(5)).unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn server_shutdown_ends_the_stream() {
        let (server, client, handle) = serve(pusher(0));
        let mut channel = client
            .create_stream(&Message::stream(OpCode::CreateStream))
            .unwrap();
        channel
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        server.shutdown(Duration::from_secs(5)).unwrap();
        handle.join().unwrap().unwrap();

        assert!(matches!(channel.recv(), Ok(None) | Err(Error::Transport(_))));
        assert!(channel.messages().next().is_none());
    }

    #[test]
    fn client_close_stops_pusher() {
        let closed = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&closed);
        let (server, client, handle) = serve(
            move |w: &mut ResponseWriter, _: &Message| -> Result<(), DispatchError> {
                w.set_status(Status::Ok);
                *seen.lock().unwrap() = w.stream().cloned();
                Ok(())
            },
        );

        let channel = client
            .create_stream(&Message::stream(OpCode::CreateStream))
            .unwrap();
        channel.close().unwrap();

        let sender = closed.lock().unwrap().take().unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !sender.is_closed() {
            assert!(std::time::Instant::now() < deadline);
            thread::sleep(Duration::from_millis(10));
        }
        assert!(matches!(
            sender.send(Message::stream(OpCode::StreamMessage)),
            Err(Error::StreamClosed)
        ));

        server.shutdown(Duration::from_secs(5)).unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn refused_stream_keeps_connection_pooled() {
        let (server, client, handle) = serve(
            |w: &mut ResponseWriter, req: &Message| -> Result<(), DispatchError> {
                if req.op() == OpCode::CreateStream {
                    w.set_status(Status::BadRequest);
                } else {
                    w.set_status(Status::Ok);
                }
                Ok(())
            },
        );

        let err = client
            .create_stream(&Message::stream(OpCode::CreateStream))
            .err()
            .unwrap();
        assert!(matches!(err, Error::StreamRefused(Status::BadRequest)));

        let addr = server.local_addr().unwrap().to_string();
        assert_eq!(client.pool().idle_connections(&addr), 1);
        let resp = client.request(&Message::dmap(OpCode::Put)).unwrap();
        assert_eq!(resp.status(), Status::Ok);

        client.close();
        server.shutdown(Duration::from_secs(5)).unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn timeout_inside_frame_keeps_channel_in_sync() {
        use std::{io::Write, net::TcpListener};

        use crate::{net::Connection, protocol::frame};

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let conn = Connection::dial(&addr, &ClientConfig::new([addr.clone()], 1)).unwrap();
        let (mut server_side, _) = listener.accept().unwrap();

        let mut channel =
            StreamChannel::open(conn, &Message::stream(OpCode::CreateStream)).unwrap();
        channel
            .set_read_timeout(Some(Duration::from_millis(150)))
            .unwrap();

        let pushed = Message::stream(OpCode::StreamMessage).with_body(b"payload".to_vec());
        let bytes = frame::encode(&pushed).unwrap();
        server_side.write_all(&bytes[..5]).unwrap();

        let err = channel.recv().unwrap_err();
        assert!(matches!(
            err,
            Error::Transport(ref e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
        ));

        server_side.write_all(&bytes[5..]).unwrap();
        let next = channel.messages().next().unwrap().unwrap();
        assert_eq!(next, pushed);

        drop(server_side);
        assert!(channel.recv().unwrap().is_none());
    }

    #[test]
    fn pushes_inside_dispatch_stop_at_backlog() {
        use crate::net::STREAM_BACKLOG;

        let outcome = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&outcome);
        let (server, client, handle) = serve(
            move |w: &mut ResponseWriter, _: &Message| -> Result<(), DispatchError> {
                w.set_status(Status::Ok);
                if let Some(sender) = w.stream() {
                    let sent = (0..100u8)
                        .map(|n| {
                            sender.send(Message::stream(OpCode::StreamMessage).with_body(vec![n]))
                        })
                        .position(|r| r.is_err());
                    let last = sender.send(Message::stream(OpCode::StreamMessage));
                    *seen.lock().unwrap() = Some((sent, last));
                }
                Ok(())
            },
        );

        let mut channel = client
            .create_stream(&Message::stream(OpCode::CreateStream))
            .unwrap();
        channel
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        for n in 0..STREAM_BACKLOG {
            let pushed = channel.recv().unwrap().unwrap();
            assert_eq!(pushed.body(), &[n as u8]);
        }

        let (sent, last) = outcome.lock().unwrap().take().unwrap();
        assert_eq!(sent, Some(STREAM_BACKLOG));
        assert!(matches!(last, Err(Error::StreamBacklogFull { limit: STREAM_BACKLOG })));

        channel.close().unwrap();
        server.shutdown(Duration::from_secs(5)).unwrap();
        handle.join().unwrap().unwrap();
    }
}
