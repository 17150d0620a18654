use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::{SyncSender, TrySendError},
    },
    thread::{self, ThreadId},
    time::Duration,
};

use crate::protocol::{Extra, Message, Status};

use super::Error;

pub type DispatchError = Box<dyn std::error::Error + Send + Sync>;

/// Messages a stream may have queued before senders wait for the writer.
pub const STREAM_BACKLOG: usize = 64;
const SEND_RETRY_INTERVAL: Duration = Duration::from_millis(5);

/// Maps a decoded request to a response.
///
/// Called once per request, from the connection's own thread. Errors and
/// panics are turned into an [`Status::InternalError`] response; they never
/// tear down the connection.
pub trait Dispatcher: Send + Sync + 'static {
    fn dispatch(&self, w: &mut ResponseWriter, req: &Message) -> Result<(), DispatchError>;
}

impl<F> Dispatcher for F
where
    F: Fn(&mut ResponseWriter, &Message) -> Result<(), DispatchError> + Send + Sync + 'static,
{
    fn dispatch(&self, w: &mut ResponseWriter, req: &Message) -> Result<(), DispatchError> {
        self(w, req)
    }
}

/// Collects the response for one request.
#[derive(Debug)]
pub struct ResponseWriter {
    status: Option<Status>,
    extra: Extra,
    body: Vec<u8>,
    stream: Option<StreamSender>,
}

impl ResponseWriter {
    pub(crate) fn new(stream: Option<StreamSender>) -> Self {
        Self {
            status: None,
            extra: Extra::None,
            body: Vec::new(),
            stream,
        }
    }

    pub fn set_status(&mut self, status: Status) {
        self.status = Some(status);
    }

    /// Status set so far, if any.
    pub fn status(&self) -> Option<Status> {
        self.status
    }

    pub fn set_extra(&mut self, extra: Extra) {
        self.extra = extra;
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
    }

    /// Appends to the body.
    pub fn write(&mut self, bytes: &[u8]) {
        self.body.extend_from_slice(bytes);
    }

    /// Push side of the stream being created. Only present while handling a
    /// `CreateStream` request; clone it to keep pushing after the call
    /// returns.
    ///
    /// Nothing is written until `dispatch` returns, so at most
    /// [`STREAM_BACKLOG`] messages can be pushed from inside the call.
    pub fn stream(&self) -> Option<&StreamSender> {
        self.stream.as_ref()
    }

    pub(crate) fn into_response(self, req: &Message) -> Message {
        req.reply()
            .with_status(self.status.unwrap_or(Status::InternalError))
            .with_extra(self.extra)
            .with_body(self.body)
    }
}

/// Server side handle used to push messages down a stream channel.
#[derive(Debug, Clone)]
pub struct StreamSender {
    id: u64,
    queue: SyncSender<Message>,
    closed: Arc<AtomicBool>,
    writer: ThreadId,
}

impl StreamSender {
    /// `writer` is the thread that drains `queue`; it can never wait on a
    /// full queue.
    pub(crate) fn new(
        id: u64,
        queue: SyncSender<Message>,
        closed: Arc<AtomicBool>,
        writer: ThreadId,
    ) -> Self {
        Self {
            id,
            queue,
            closed,
            writer,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queues `message` for delivery. While the queue is full this waits for
    /// the writer to catch up, and gives up with [`Error::StreamClosed`] once
    /// the channel closes.
    ///
    /// Called from the dispatching thread itself, a full queue fails at once
    /// with [`Error::StreamBacklogFull`].
    pub fn send(&self, message: Message) -> Result<(), Error> {
        let mut message = message;
        loop {
            if self.is_closed() {
                return Err(Error::StreamClosed);
            }
            match self.queue.try_send(message) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Disconnected(_)) => return Err(Error::StreamClosed),
                Err(TrySendError::Full(_)) if thread::current().id() == self.writer => {
                    return Err(Error::StreamBacklogFull {
                        limit: STREAM_BACKLOG,
                    });
                }
                Err(TrySendError::Full(back)) => {
                    message = back;
                    thread::sleep(SEND_RETRY_INTERVAL);
                }
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
