use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use tracing::{debug, error, trace};

use crate::channel::{
    ChannelManager, ChannelRef,
    stream_proxy::{StreamConsumer, StreamListenerProxy},
    transport::{StreamsListener, same_object},
};

use super::{
    DataProvider, DataReceiver, StreamError, StreamKind,
    worker::{Callback, CallbackCollector, StreamWorker, WorkerState},
};

/// The remote process a listener pumps streams for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessContext {
    pub id: String,
    pub stdin_id: Option<String>,
    pub stdout_id: Option<String>,
    pub stderr_id: Option<String>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Connects the standard streams of one remote process to local I/O.
///
/// stdin is fed from the [`DataProvider`], stdout and stderr go to every
/// registered [`DataReceiver`] applicable to them. A created notification is
/// acted on once per `type;id;context`.
pub struct ProcessStreamsListener {
    me: Weak<Self>,
    manager: ChannelManager,
    channel: ChannelRef,
    stream_type: String,
    context: Mutex<Option<ProcessContext>>,
    receivers: Mutex<Vec<Arc<dyn DataReceiver>>>,
    provider: Mutex<Option<DataProvider>>,
    workers: Mutex<Vec<StreamWorker>>,
    processed: Mutex<HashSet<String>>,
    proxy: Mutex<Option<Weak<StreamListenerProxy>>>,
}

impl ProcessStreamsListener {
    pub fn new(manager: ChannelManager, channel: ChannelRef, stream_type: &str) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            manager,
            channel,
            stream_type: stream_type.to_string(),
            context: Mutex::default(),
            receivers: Mutex::default(),
            provider: Mutex::default(),
            workers: Mutex::default(),
            processed: Mutex::default(),
            proxy: Mutex::default(),
        })
    }

    pub fn register_receiver(&self, receiver: Arc<dyn DataReceiver>) {
        let mut receivers = lock(&self.receivers);
        if !receivers.iter().any(|r| same_object(r, &receiver)) {
            receivers.push(receiver);
        }
    }

    pub fn unregister_receiver(&self, receiver: &Arc<dyn DataReceiver>) {
        lock(&self.receivers).retain(|r| !same_object(r, receiver));
    }

    pub fn set_data_provider(&self, provider: DataProvider) {
        *lock(&self.provider) = Some(provider);
    }

    /// Bind the listener to its process and replay what arrived before.
    pub fn set_process_context(&self, context: ProcessContext) {
        debug!(process = %context.id, "process context set");
        *lock(&self.context) = Some(context);
        let proxy = lock(&self.proxy).as_ref().and_then(Weak::upgrade);
        if let Some(proxy) = proxy {
            proxy.process_delayed_created_events();
        }
    }

    pub fn process_context(&self) -> Option<ProcessContext> {
        lock(&self.context).clone()
    }

    /// Workers started, not yet handed to a dispose and not yet stopped.
    pub fn active_workers(&self) -> usize {
        lock(&self.workers).iter().filter(|w| w.state() != WorkerState::Stopped).count()
    }

    /// Stop every worker now; `callback` runs once all of them stopped and the
    /// listener is unsubscribed.
    pub fn dispose_with(&self, callback: Option<Callback>) {
        self.dispose_inner(false, callback);
    }

    /// Like [`ProcessStreamsListener::dispose_with`], but lets the workers run
    /// to end of stream first.
    pub fn dispose_on_eof(&self, callback: Option<Callback>) {
        self.dispose_inner(true, callback);
    }

    fn dispose_inner(&self, on_eof: bool, callback: Option<Callback>) {
        let receivers = std::mem::take(&mut *lock(&self.receivers));
        let workers = std::mem::take(&mut *lock(&self.workers));
        debug!(stream_type = %self.stream_type, workers = workers.len(), on_eof, "disposing process streams");

        let me = self.me.upgrade();
        let manager = self.manager.clone();
        let channel = self.channel.clone();
        let stream_type = self.stream_type.clone();
        let dispatcher = self.manager.dispatcher().clone();

        let finalize: Callback = Box::new(move || {
            let posted = dispatcher.invoke_later(async move {
                if let Some(me) = me {
                    let consumer: Arc<dyn StreamConsumer> = me.clone();
                    if let Err(e) = manager.unsubscribe_stream(&channel, &stream_type, &consumer).await {
                        debug!(stream_type = %stream_type, "unsubscribe failed: {e}");
                    }
                    lock(&me.processed).clear();
                }
                for receiver in receivers {
                    receiver.close();
                }
                if let Some(callback) = callback {
                    callback();
                }
            });
            if let Err(e) = posted {
                error!("process streams dispose dropped: {e}");
            }
        });

        let collector = CallbackCollector::new(finalize);
        for worker in workers {
            if on_eof {
                worker.on_eof(collector.callback());
            } else {
                worker.stop(Some(collector.callback()));
            }
        }
        collector.init_done();
    }

    fn start(&self, worker: Result<StreamWorker, StreamError>) {
        match worker {
            Ok(worker) => {
                let mut workers = lock(&self.workers);
                workers.retain(|w| w.state() != WorkerState::Stopped);
                workers.push(worker);
            }
            Err(e) => error!(stream_type = %self.stream_type, "{e}"),
        }
    }
}

impl StreamsListener for ProcessStreamsListener {
    fn created(&self, stream_type: &str, stream_id: &str, context_id: Option<&str>) {
        if stream_type != self.stream_type {
            return;
        }
        let Some(context_id) = context_id else {
            return;
        };
        if !self.is_created_consumed(stream_type, stream_id, context_id) {
            return;
        }
        if !lock(&self.processed).insert(format!("{stream_type};{stream_id};{context_id}")) {
            trace!(stream_id, "created event already handled");
            return;
        }
        let (Some(context), Some(service)) = (self.process_context(), self.channel.streams()) else {
            return;
        };
        let dispatcher = self.manager.dispatcher().clone();

        if context.stdin_id.as_deref() == Some(stream_id) {
            if let Some(provider) = lock(&self.provider).take() {
                self.start(StreamWorker::spawn_writer(dispatcher.clone(), service.clone(), stream_id, provider));
            }
        }

        let receivers = lock(&self.receivers).clone();
        for (kind, id) in [(StreamKind::Stdout, &context.stdout_id), (StreamKind::Stderr, &context.stderr_id)] {
            if id.as_deref() != Some(stream_id) {
                continue;
            }
            let applicable: Vec<Arc<dyn DataReceiver>> =
                receivers.iter().filter(|r| r.is_applicable(kind)).cloned().collect();
            if applicable.is_empty() {
                continue;
            }
            self.start(StreamWorker::spawn_reader(dispatcher.clone(), service.clone(), stream_id, kind, applicable));
        }
    }

    fn disposed(&self, stream_type: &str, stream_id: &str) {
        if stream_type != self.stream_type {
            return;
        }
        let mut workers = lock(&self.workers);
        workers.retain(|w| {
            let matches = w.kind() != StreamKind::Stdin && w.stream_id() == stream_id;
            if matches {
                w.stop(None);
            }
            !matches
        });
    }
}

impl StreamConsumer for ProcessStreamsListener {
    fn has_context(&self) -> bool {
        lock(&self.context).is_some()
    }

    fn is_created_consumed(&self, _stream_type: &str, _stream_id: &str, context_id: &str) -> bool {
        lock(&self.context).as_ref().is_some_and(|c| c.id == context_id)
    }

    fn dispose(&self) {
        self.dispose_inner(false, None);
    }

    fn set_proxy(&self, proxy: Option<Weak<StreamListenerProxy>>) {
        *lock(&self.proxy) = proxy;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::{
            ChannelManagerSettings, OpenFlags, PeerDirectory, PeerInfo,
            memory::{MemoryStreamsService, MemoryTransport},
        },
        dispatch::Dispatcher,
        streams::BufferReceiver,
    };
    use std::{io::Cursor, sync::mpsc, time::Duration};

    const PROCESSES: &str = "Processes";

    fn context() -> ProcessContext {
        ProcessContext {
            id: "proc-1".into(),
            stdin_id: Some("in-1".into()),
            stdout_id: Some("out-1".into()),
            stderr_id: Some("err-1".into()),
        }
    }

    async fn setup() -> (ChannelManager, ChannelRef, Arc<MemoryStreamsService>) {
        let transport = MemoryTransport::new();
        let manager = ChannelManager::new(
            Dispatcher::start("listener-test").unwrap(),
            Arc::new(transport.clone()),
            Arc::new(PeerDirectory::new()),
            ChannelManagerSettings::default(),
        );
        let channel = manager.open_channel(&PeerInfo::new("P1"), OpenFlags::default()).await.unwrap();
        (manager, channel, transport.streams_for("P1"))
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn stdout_reaches_receivers_and_disconnects_once() {
        let (manager, channel, streams) = setup().await;
        let listener = ProcessStreamsListener::new(manager.clone(), channel.clone(), PROCESSES);
        let out = BufferReceiver::new(&[StreamKind::Stdout]);
        let err = BufferReceiver::new(&[StreamKind::Stderr]);
        listener.register_receiver(out.clone());
        listener.register_receiver(err.clone());
        listener.set_process_context(context());
        manager.subscribe_stream(&channel, PROCESSES, listener.clone()).await.unwrap();

        streams.push_chunk("out-1", b"hello ");
        streams.push_chunk("out-1", b"world");
        streams.push_eos("out-1");
        streams.create_stream(PROCESSES, "out-1", Some("proc-1"));
        streams.create_stream(PROCESSES, "out-1", Some("proc-1"));

        assert!(eventually(|| out.is_closed()).await);
        assert_eq!(out.text(), "hello world");
        assert!(err.contents().is_empty());
        assert!(eventually(|| streams.disconnect_count("out-1") == 1).await);
        assert!(eventually(|| listener.active_workers() == 0).await);
    }

    #[tokio::test]
    async fn stdin_is_fed_from_the_provider() {
        let (manager, channel, streams) = setup().await;
        let listener = ProcessStreamsListener::new(manager.clone(), channel.clone(), PROCESSES);
        listener.set_data_provider(Box::new(Cursor::new(b"y\n".to_vec())));
        listener.set_process_context(context());
        manager.subscribe_stream(&channel, PROCESSES, listener.clone()).await.unwrap();

        streams.create_stream(PROCESSES, "in-1", Some("proc-1"));
        assert!(eventually(|| streams.eos_received("in-1") && streams.disconnect_count("in-1") == 1).await);
        assert_eq!(streams.written("in-1"), b"y\n");
    }

    #[tokio::test]
    async fn streams_created_before_the_context_are_replayed() {
        let (manager, channel, streams) = setup().await;
        let listener = ProcessStreamsListener::new(manager.clone(), channel.clone(), PROCESSES);
        let out = BufferReceiver::new(&[StreamKind::Stdout]);
        listener.register_receiver(out.clone());
        manager.subscribe_stream(&channel, PROCESSES, listener.clone()).await.unwrap();

        streams.push_chunk("out-1", b"early");
        streams.push_eos("out-1");
        streams.create_stream(PROCESSES, "out-1", Some("proc-1"));
        assert_eq!(listener.active_workers(), 0);

        listener.set_process_context(context());
        assert!(eventually(|| out.is_closed()).await);
        assert_eq!(out.text(), "early");
    }

    #[tokio::test]
    async fn dispose_stops_workers_and_unsubscribes() {
        let (manager, channel, streams) = setup().await;
        let listener = ProcessStreamsListener::new(manager.clone(), channel.clone(), PROCESSES);
        let out = BufferReceiver::new(&[StreamKind::Stdout]);
        listener.register_receiver(out.clone());
        listener.set_process_context(context());
        manager.subscribe_stream(&channel, PROCESSES, listener.clone()).await.unwrap();
        assert_eq!(streams.subscriber_count(PROCESSES), 1);

        streams.create_stream(PROCESSES, "out-1", Some("proc-1"));
        assert_eq!(listener.active_workers(), 1);
        assert!(eventually(|| streams.parked_reads("out-1") == 1).await);

        let (tx, rx) = mpsc::channel();
        listener.dispose_with(Some(Box::new(move || tx.send(()).unwrap())));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        // the pending read completes and its data is still delivered
        streams.push_chunk("out-1", b"last words");
        assert!(eventually(|| rx.try_recv().is_ok()).await);

        assert_eq!(out.text(), "last words");
        assert!(out.is_closed());
        assert_eq!(streams.disconnect_count("out-1"), 1);
        assert_eq!(streams.subscriber_count(PROCESSES), 0);
        assert_eq!(listener.active_workers(), 0);
    }

    #[tokio::test]
    async fn finished_workers_are_not_counted() {
        let (manager, channel, streams) = setup().await;
        let listener = ProcessStreamsListener::new(manager.clone(), channel.clone(), PROCESSES);
        listener.register_receiver(BufferReceiver::new(&[StreamKind::Stdout, StreamKind::Stderr]));
        listener.set_process_context(context());
        manager.subscribe_stream(&channel, PROCESSES, listener.clone()).await.unwrap();

        streams.create_stream(PROCESSES, "out-1", Some("proc-1"));
        streams.create_stream(PROCESSES, "err-1", Some("proc-1"));
        assert_eq!(listener.active_workers(), 2);

        streams.push_eos("out-1");
        assert!(eventually(|| listener.active_workers() == 1).await);
        streams.push_eos("err-1");
        assert!(eventually(|| listener.active_workers() == 0).await);
    }

    #[tokio::test]
    async fn foreign_processes_are_left_alone() {
        let (manager, channel, streams) = setup().await;
        let listener = ProcessStreamsListener::new(manager.clone(), channel.clone(), PROCESSES);
        listener.register_receiver(BufferReceiver::new(&[StreamKind::Stdout]));
        listener.set_process_context(context());
        manager.subscribe_stream(&channel, PROCESSES, listener.clone()).await.unwrap();

        streams.create_stream(PROCESSES, "out-9", Some("proc-9"));
        assert_eq!(listener.active_workers(), 0);
        // nobody claimed it
        assert!(eventually(|| streams.disconnect_count("out-9") == 1).await);
    }
}
