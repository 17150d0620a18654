use std::{
    any::Any,
    io::ErrorKind,
    net::{Shutdown, TcpStream},
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, SyncSender},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, info, trace, warn};

use crate::protocol::{
    Extra, Kind, Message, OpCode, ProtocolTransport, Status, StreamExtra, TransportError, frame,
};

use super::{
    Error,
    dispatcher::{Dispatcher, ResponseWriter, STREAM_BACKLOG, StreamSender},
};

/// How often an idle push loop re-checks for shutdown and peer close.
const STREAM_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Serves one accepted connection until the peer leaves, the connection
/// breaks, or the server shuts down.
pub(crate) struct Handler {
    id: u64,
    transport: ProtocolTransport<TcpStream>,
    dispatcher: Arc<dyn Dispatcher>,
    shutdown: Arc<AtomicBool>,
}

impl Handler {
    pub fn new(
        id: u64,
        stream: TcpStream,
        dispatcher: Arc<dyn Dispatcher>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id,
            transport: ProtocolTransport::new(stream),
            dispatcher,
            shutdown,
        }
    }

    pub fn run(mut self) {
        match self.serve() {
            Ok(()) => debug!("connection {} closed", self.id),
            Err(e) => warn!("connection {} closed: {e}", self.id),
        }
        self.close_socket();
    }

    fn close_socket(&self) {
        if let Err(e) = self.transport.get_ref().shutdown(Shutdown::Both) {
            debug!("connection {}: socket shutdown failed: {e}", self.id);
        }
    }

    fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn serve(&mut self) -> Result<(), Error> {
        loop {
            if self.shutting_down() {
                return Ok(());
            }

            let req = match self.transport.read_message() {
                Ok(Some(req)) => req,
                Ok(None) => return Ok(()),
                Err(TransportError::Io(e))
                    if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
                {
                    debug!("connection {} idle for too long", self.id);
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            trace!("connection {} received {:?}", self.id, req.op());

            if req.is_create_stream() {
                if self.upgrade(&req)? {
                    return Ok(());
                }
                continue;
            }

            let resp = self.dispatch(&req, None);
            self.respond(&req, &resp)?;
        }
    }

    fn dispatch(&self, req: &Message, stream: Option<StreamSender>) -> Message {
        let mut writer = ResponseWriter::new(stream);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.dispatcher.dispatch(&mut writer, req)
        }));

        match outcome {
            Ok(Ok(())) => writer.into_response(req),
            Ok(Err(e)) => {
                warn!("connection {}: dispatcher failed on {:?}: {e}", self.id, req.op());
                req.reply()
                    .with_status(Status::InternalError)
                    .with_body(e.to_string())
            }
            Err(cause) => {
                warn!(
                    "connection {}: dispatcher panicked on {:?}: {}",
                    self.id,
                    req.op(),
                    panic_message(&*cause)
                );
                req.reply().with_status(Status::InternalError)
            }
        }
    }

    /// Writes `resp`. A response that cannot be encoded is replaced by a bare
    /// internal error so the peer is never left waiting.
    fn respond(&mut self, req: &Message, resp: &Message) -> Result<(), Error> {
        let bytes = match frame::encode(resp) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("connection {}: unencodable response to {:?}: {e}", self.id, req.op());
                frame::encode(&req.reply().with_status(Status::InternalError))?
            }
        };
        self.transport.write_frame(&bytes)?;
        Ok(())
    }

    /// Answers a `CreateStream` request. Returns `true` once the connection
    /// has been used as a stream channel and must not serve requests again.
    fn upgrade(&mut self, req: &Message) -> Result<bool, Error> {
        let (queue, pending) = mpsc::sync_channel(STREAM_BACKLOG);
        let closed = Arc::new(AtomicBool::new(false));
        let sender = StreamSender::new(
            self.id,
            queue.clone(),
            Arc::clone(&closed),
            thread::current().id(),
        );

        let mut resp = self.dispatch(req, Some(sender));
        let accepted = resp.status() == Status::Ok;
        if accepted && resp.kind() == Kind::Stream && resp.extra() == &Extra::None {
            resp = resp.with_extra(Extra::Stream(StreamExtra { stream_id: self.id }));
        }

        if let Err(e) = self.respond(req, &resp) {
            closed.store(true, Ordering::Release);
            return Err(e);
        }
        if !accepted {
            closed.store(true, Ordering::Release);
            debug!("connection {}: stream refused with {:?}", self.id, resp.status());
            return Ok(false);
        }

        info!("connection {} upgraded to stream channel", self.id);
        let watcher = self.watch(queue, Arc::clone(&closed))?;
        let result = self.push(&pending, &closed);

        closed.store(true, Ordering::Release);
        drop(pending);
        self.close_socket();
        if watcher.join().is_err() {
            warn!("connection {}: stream watcher panicked", self.id);
        }
        debug!("stream channel {} closed", self.id);
        result.map(|()| true)
    }

    /// Writes queued messages until the channel closes or the server stops.
    fn push(&mut self, pending: &Receiver<Message>, closed: &AtomicBool) -> Result<(), Error> {
        loop {
            if closed.load(Ordering::Acquire) || self.shutting_down() {
                return Ok(());
            }
            match pending.recv_timeout(STREAM_POLL_INTERVAL) {
                Ok(message) => match frame::encode(&message) {
                    Ok(bytes) => self.transport.write_frame(&bytes)?,
                    Err(e) => warn!("stream {}: dropping unencodable message: {e}", self.id),
                },
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Ok(()),
            }
        }
    }

    /// Reads whatever the peer sends on a stream channel: pings are answered
    /// through the push queue, end of stream or garbage closes the channel.
    fn watch(
        &self,
        queue: SyncSender<Message>,
        closed: Arc<AtomicBool>,
    ) -> Result<JoinHandle<()>, Error> {
        let id = self.id;
        let mut reader = ProtocolTransport::new(self.transport.get_ref().try_clone()?);

        let watcher = thread::Builder::new()
            .name(format!("skein-stream-{id}"))
            .spawn(move || {
                while !closed.load(Ordering::Acquire) {
                    match reader.read_message() {
                        Ok(Some(msg)) if msg.op() == OpCode::StreamPing => {
                            let pong = Message::stream(OpCode::StreamPong)
                                .with_extra(Extra::Stream(StreamExtra { stream_id: id }));
                            if queue.send(pong).is_err() {
                                break;
                            }
                        }
                        Ok(Some(msg)) => {
                            debug!("stream {id}: ignoring inbound {:?}", msg.op());
                        }
                        Ok(None) => break,
                        Err(TransportError::Io(e))
                            if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
                        {
                            continue;
                        }
                        Err(e) => {
                            debug!("stream {id}: peer read failed: {e}");
                            break;
                        }
                    }
                }
                closed.store(true, Ordering::Release);
            })?;
        Ok(watcher)
    }
}

fn panic_message(cause: &(dyn Any + Send)) -> &str {
    if let Some(s) = cause.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = cause.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
