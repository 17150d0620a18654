use std::{
    collections::HashMap,
    io,
    net::{Shutdown, TcpStream},
    sync::{
        Arc, Condvar, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    thread,
    time::Instant,
};

use log::{debug, warn};

/// Runs one worker thread per connection and keeps a handle on each socket so
/// the server can drain or force-close them during shutdown.
#[derive(Debug, Default)]
pub(crate) struct Supervisor {
    next_id: AtomicU64,
    workers: Mutex<HashMap<u64, TcpStream>>,
    drained: Condvar,
}

/// Unregisters a worker when its thread ends, panics included.
struct Worker {
    id: u64,
    supervisor: Arc<Supervisor>,
}

impl Drop for Worker {
    fn drop(&mut self) {
        let mut workers = self.supervisor.lock();
        workers.remove(&self.id);
        debug!("worker {} finished, {} still running", self.id, workers.len());
        if workers.is_empty() {
            self.supervisor.drained.notify_all();
        }
    }
}

impl Supervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, TcpStream>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `stream` and hands it to `job` on a dedicated thread. The job
    /// also gets the worker id, which doubles as the connection id.
    pub fn spawn<F>(self: &Arc<Self>, stream: TcpStream, job: F) -> io::Result<u64>
    where
        F: FnOnce(u64, TcpStream) + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.lock().insert(id, stream.try_clone()?);

        let worker = Worker {
            id,
            supervisor: Arc::clone(self),
        };
        // a failed spawn drops the closure and with it the worker guard
        thread::Builder::new()
            .name(format!("skein-conn-{id}"))
            .spawn(move || {
                let worker = worker;
                debug!("worker {} handling a connection", worker.id);
                job(worker.id, stream);
            })
            .map(|_| id)
    }

    pub fn active(&self) -> usize {
        self.lock().len()
    }

    /// Half-closes the read side of every connection so workers blocked on a
    /// read see end of stream, while a response being written still goes out.
    pub fn signal_all(&self) {
        for (id, stream) in self.lock().iter() {
            if let Err(e) = stream.shutdown(Shutdown::Read) {
                debug!("worker {id}: read shutdown failed: {e}");
            }
        }
    }

    /// Waits until every worker finished or `deadline` passed. Returns the
    /// number of workers still running.
    pub fn wait_until(&self, deadline: Instant) -> usize {
        let mut workers = self.lock();
        while !workers.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            workers = self
                .drained
                .wait_timeout(workers, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        workers.len()
    }

    /// Closes every remaining connection in both directions.
    pub fn force_close(&self) {
        for (id, stream) in self.lock().iter() {
            warn!("worker {id}: force closing connection");
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                debug!("worker {id}: shutdown failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::Read,
        net::TcpListener,
        sync::mpsc,
        time::Duration,
    };

    use super::*;

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (server, client)
    }

    #[test]
    fn tracks_workers_until_they_finish() {
        let supervisor = Supervisor::new();
        let (server, _client) = socket_pair();
        let (tx, rx) = mpsc::channel::<()>();

        supervisor
            .spawn(server, move |_, _stream| {
                let _ = rx.recv();
            })
            .unwrap();
        assert_eq!(supervisor.active(), 1);
        assert_eq!(
            supervisor.wait_until(Instant::now() + Duration::from_millis(20)),
            1
        );

        tx.send(()).unwrap();
        assert_eq!(
            supervisor.wait_until(Instant::now() + Duration::from_secs(5)),
            0
        );
    }

    #[test]
    fn signal_unblocks_reads() {
        let supervisor = Supervisor::new();
        let (server, _client) = socket_pair();
        let (tx, rx) = mpsc::channel();

        supervisor
            .spawn(server, move |_, mut stream| {
                let mut buf = [0u8; 8];
                tx.send(stream.read(&mut buf).ok()).unwrap();
            })
            .unwrap();

        thread::sleep(Duration::from_millis(20));
        supervisor.signal_all();
        let read = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(read, Some(0));
        assert_eq!(
            supervisor.wait_until(Instant::now() + Duration::from_secs(5)),
            0
        );
    }

    #[test]
    fn worker_unregisters_after_panic() {
        let supervisor = Supervisor::new();
        let (server, _client) = socket_pair();

        supervisor
            .spawn(server, |_, _| panic!("worker fault"))
            .unwrap();
        assert_eq!(
            supervisor.wait_until(Instant::now() + Duration::from_secs(5)),
            0
        );
    }
}
