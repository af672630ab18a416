use std::{
    io::{ErrorKind, Read},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};

use tracing::{debug, error, trace, warn};

use crate::{channel::transport::StreamsService, dispatch::Dispatcher};

use super::{DataProvider, DataReceiver, StreamError, StreamKind};

/// Bytes asked for or sent per remote call.
pub const READ_SIZE: usize = 1024;

pub type Callback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    Stopping,
    Stopped,
}

struct Control {
    state: WorkerState,
    callbacks: Vec<Callback>,
}

struct Shared {
    stream_id: String,
    kind: StreamKind,
    control: Mutex<Control>,
}

impl Shared {
    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stopping(&self) -> bool {
        self.control().state != WorkerState::Running
    }

    fn finish(&self) {
        let callbacks = {
            let mut control = self.control();
            control.state = WorkerState::Stopped;
            std::mem::take(&mut control.callbacks)
        };
        trace!(stream = %self.stream_id, kind = %self.kind, "worker stopped");
        for callback in callbacks {
            callback();
        }
    }
}

/// A thread moving data between one remote stream and local I/O.
///
/// The worker disconnects from the stream exactly once, on end of stream, on
/// error, or after [`StreamWorker::stop`].
#[derive(Clone)]
pub struct StreamWorker {
    shared: Arc<Shared>,
}

impl StreamWorker {
    fn new(stream_id: &str, kind: StreamKind) -> Self {
        Self {
            shared: Arc::new(Shared {
                stream_id: stream_id.to_string(),
                kind,
                control: Mutex::new(Control { state: WorkerState::Running, callbacks: Vec::new() }),
            }),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.shared.stream_id
    }

    pub fn kind(&self) -> StreamKind {
        self.shared.kind
    }

    pub fn state(&self) -> WorkerState {
        self.shared.control().state
    }

    /// Ask the worker to stop. `callback` runs once it has; right away when it
    /// already had. A read or write in flight is not interrupted: its result is
    /// still handled before the loop sees the flag.
    pub fn stop(&self, callback: Option<Callback>) {
        let mut control = self.shared.control();
        if control.state == WorkerState::Stopped {
            drop(control);
            if let Some(callback) = callback {
                callback();
            }
            return;
        }
        control.state = WorkerState::Stopping;
        control.callbacks.extend(callback);
    }

    /// Run `callback` when the worker ends on its own.
    pub fn on_eof(&self, callback: Callback) {
        let mut control = self.shared.control();
        if control.state == WorkerState::Stopped {
            drop(control);
            callback();
            return;
        }
        control.callbacks.push(callback);
    }

    /// Read `stream_id` until end of stream and hand the data to `receivers`.
    pub fn spawn_reader(
        dispatcher: Dispatcher,
        service: Arc<dyn StreamsService>,
        stream_id: &str,
        kind: StreamKind,
        receivers: Vec<Arc<dyn DataReceiver>>,
    ) -> Result<Self, StreamError> {
        let worker = Self::new(stream_id, kind);
        let shared = worker.shared.clone();
        thread::Builder::new()
            .name(format!("stream-{kind}-{stream_id}"))
            .spawn(move || read_loop(shared, dispatcher, service, receivers))
            .map_err(|e| StreamError::Spawn(e.to_string()))?;
        debug!(stream = %stream_id, %kind, "reader started");
        Ok(worker)
    }

    /// Copy `provider` into `stream_id`, then send end of stream.
    pub fn spawn_writer(
        dispatcher: Dispatcher,
        service: Arc<dyn StreamsService>,
        stream_id: &str,
        provider: DataProvider,
    ) -> Result<Self, StreamError> {
        let worker = Self::new(stream_id, StreamKind::Stdin);
        let shared = worker.shared.clone();
        thread::Builder::new()
            .name(format!("stream-stdin-{stream_id}"))
            .spawn(move || write_loop(shared, dispatcher, service, provider))
            .map_err(|e| StreamError::Spawn(e.to_string()))?;
        debug!(stream = %stream_id, "writer started");
        Ok(worker)
    }
}

fn read_loop(
    shared: Arc<Shared>,
    dispatcher: Dispatcher,
    service: Arc<dyn StreamsService>,
    receivers: Vec<Arc<dyn DataReceiver>>,
) {
    while !shared.stopping() {
        let svc = service.clone();
        let stream_id = shared.stream_id.clone();
        let read = dispatcher.invoke_and_wait(async move { svc.read(&stream_id, READ_SIZE).await });

        match read {
            Ok(Ok(chunk)) => {
                if chunk.lost_size > 0 {
                    warn!(stream = %shared.stream_id, lost = chunk.lost_size, "agent dropped stream data");
                }
                if !chunk.data.is_empty() {
                    for receiver in &receivers {
                        receiver.receive(&chunk.data);
                    }
                }
                if chunk.eos {
                    debug!(stream = %shared.stream_id, "end of stream");
                    break;
                }
            }
            Ok(Err(e)) => {
                if !shared.stopping() {
                    error!(stream = %shared.stream_id, "stream read failed: {e}");
                }
                break;
            }
            Err(e) => {
                warn!(stream = %shared.stream_id, "read not dispatched: {e}");
                break;
            }
        }
    }

    for receiver in &receivers {
        receiver.close();
    }
    disconnect_then_finish(shared, &dispatcher, service, false);
}

fn write_loop(shared: Arc<Shared>, dispatcher: Dispatcher, service: Arc<dyn StreamsService>, mut provider: DataProvider) {
    let mut buf = [0u8; READ_SIZE];
    while !shared.stopping() {
        let n = match provider.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(stream = %shared.stream_id, "reading local input failed: {e}");
                break;
            }
        };

        let svc = service.clone();
        let stream_id = shared.stream_id.clone();
        let data = buf[..n].to_vec();
        match dispatcher.invoke_and_wait(async move { svc.write(&stream_id, &data).await }) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(stream = %shared.stream_id, "stream write failed: {e}");
                break;
            }
            Err(e) => {
                warn!(stream = %shared.stream_id, "write not dispatched: {e}");
                break;
            }
        }
    }
    disconnect_then_finish(shared, &dispatcher, service, true);
}

fn disconnect_then_finish(shared: Arc<Shared>, dispatcher: &Dispatcher, service: Arc<dyn StreamsService>, send_eos: bool) {
    let done = shared.clone();
    let posted = dispatcher.invoke_later(async move {
        let stream_id = &done.stream_id;
        if send_eos {
            if let Err(e) = service.eos(stream_id).await {
                debug!(stream = %stream_id, "eos failed: {e}");
            }
        }
        if let Err(e) = service.disconnect(stream_id).await {
            debug!(stream = %stream_id, "disconnect failed: {e}");
        }
        done.finish();
    });
    if let Err(e) = posted {
        warn!(stream = %shared.stream_id, "could not disconnect: {e}");
        shared.finish();
    }
}

/// Runs `done` once every handed out callback has run and
/// [`CallbackCollector::init_done`] was called.
pub(crate) struct CallbackCollector {
    outstanding: AtomicUsize,
    done: Mutex<Option<Callback>>,
}

impl CallbackCollector {
    pub(crate) fn new(done: Callback) -> Arc<Self> {
        Arc::new(Self { outstanding: AtomicUsize::new(1), done: Mutex::new(Some(done)) })
    }

    pub(crate) fn callback(self: &Arc<Self>) -> Callback {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        let me = self.clone();
        Box::new(move || me.release())
    }

    pub(crate) fn init_done(&self) {
        self.release();
    }

    fn release(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            let done = self.done.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(done) = done {
                done();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{channel::memory::MemoryStreamsService, streams::BufferReceiver};
    use std::{io::Cursor, sync::mpsc, time::Duration};

    fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn reader_forwards_until_eos_and_disconnects_once() {
        let dispatcher = Dispatcher::start("reader-test").unwrap();
        let streams = Arc::new(MemoryStreamsService::default());
        streams.push_chunk("out", &vec![b'x'; READ_SIZE + 10]);
        streams.push_eos("out");
        let sink = BufferReceiver::new(&[StreamKind::Stdout]);

        let worker =
            StreamWorker::spawn_reader(dispatcher, streams.clone(), "out", StreamKind::Stdout, vec![sink.clone() as Arc<dyn DataReceiver>])
                .unwrap();

        assert!(wait_until(|| worker.state() == WorkerState::Stopped));
        assert_eq!(sink.contents().len(), READ_SIZE + 10);
        assert!(sink.is_closed());
        assert_eq!(streams.disconnect_count("out"), 1);
    }

    #[test]
    fn stop_lets_the_pending_read_finish_before_calling_back() {
        let dispatcher = Dispatcher::start("stop-test").unwrap();
        let streams = Arc::new(MemoryStreamsService::default());
        let sink = BufferReceiver::new(&[StreamKind::Stdout]);
        let worker =
            StreamWorker::spawn_reader(dispatcher, streams.clone(), "idle", StreamKind::Stdout, vec![sink.clone() as Arc<dyn DataReceiver>])
                .unwrap();
        assert!(wait_until(|| streams.parked_reads("idle") == 1));

        let (tx, rx) = mpsc::channel();
        let first = tx.clone();
        let seen = sink.clone();
        worker.stop(Some(Box::new(move || first.send(seen.text()).unwrap())));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(worker.state(), WorkerState::Stopping);

        streams.push_chunk("idle", b"late");
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "late");
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert!(sink.is_closed());

        // already stopped: straight away
        worker.stop(Some(Box::new(move || tx.send("second".to_string()).unwrap())));
        assert_eq!(rx.try_recv().unwrap(), "second");
        assert_eq!(streams.disconnect_count("idle"), 1);
    }

    #[test]
    fn read_error_ends_the_worker() {
        let dispatcher = Dispatcher::start("error-test").unwrap();
        let streams = Arc::new(MemoryStreamsService::default());
        streams.fail_reads("bad", crate::channel::TransportError::Io("reset".into()));
        let sink = BufferReceiver::new(&[StreamKind::Stderr]);
        let worker =
            StreamWorker::spawn_reader(dispatcher, streams.clone(), "bad", StreamKind::Stderr, vec![sink.clone() as Arc<dyn DataReceiver>])
                .unwrap();

        assert!(wait_until(|| worker.state() == WorkerState::Stopped));
        assert!(sink.is_closed());
        assert_eq!(streams.disconnect_count("bad"), 1);
    }

    #[test]
    fn writer_sends_input_then_eos_and_disconnect() {
        let dispatcher = Dispatcher::start("writer-test").unwrap();
        let streams = Arc::new(MemoryStreamsService::default());
        let input = Cursor::new(b"make all\n".to_vec());
        let worker = StreamWorker::spawn_writer(dispatcher, streams.clone(), "in", Box::new(input)).unwrap();

        let (tx, rx) = mpsc::channel();
        worker.on_eof(Box::new(move || tx.send(()).unwrap()));
        rx.recv_timeout(Duration::from_secs(2)).unwrap();

        assert_eq!(streams.written("in"), b"make all\n");
        assert!(streams.eos_received("in"));
        assert_eq!(streams.disconnect_count("in"), 1);
    }

    #[test]
    fn collector_waits_for_every_callback() {
        let (tx, rx) = mpsc::channel();
        let collector = CallbackCollector::new(Box::new(move || tx.send(()).unwrap()));
        let a = collector.callback();
        let b = collector.callback();
        collector.init_done();
        a();
        assert!(rx.try_recv().is_err());
        b();
        assert!(rx.try_recv().is_ok());
    }
}
