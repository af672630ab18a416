//! One agent subscription per channel and stream type, shared by every local
//! consumer of that type.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, trace, warn};

use crate::dispatch::Dispatcher;

use super::transport::{ChannelRef, StreamsListener, same_object};

/// A local party interested in streams of one type.
///
/// A consumer that has no context yet cannot tell whether a created stream is
/// its own; the proxy holds such notifications back until
/// [`StreamListenerProxy::process_delayed_created_events`] is called.
pub trait StreamConsumer: StreamsListener {
    fn has_context(&self) -> bool;

    fn is_created_consumed(&self, stream_type: &str, stream_id: &str, context_id: &str) -> bool;

    /// Release everything; the channel went away.
    fn dispose(&self);

    fn set_proxy(&self, proxy: Option<Weak<StreamListenerProxy>>);
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CreatedEvent {
    stream_type: String,
    stream_id: String,
    context_id: String,
}

pub struct StreamListenerProxy {
    channel: ChannelRef,
    stream_type: String,
    dispatcher: Dispatcher,
    consumers: Mutex<Vec<Arc<dyn StreamConsumer>>>,
    delayed: Mutex<Vec<CreatedEvent>>,
}

impl StreamListenerProxy {
    /// Creates the proxy and disposes its consumers once `channel` closes.
    pub fn new(channel: ChannelRef, stream_type: &str, dispatcher: Dispatcher) -> Arc<Self> {
        let proxy = Arc::new(Self {
            channel: channel.clone(),
            stream_type: stream_type.to_string(),
            dispatcher: dispatcher.clone(),
            consumers: Mutex::default(),
            delayed: Mutex::default(),
        });

        let weak = Arc::downgrade(&proxy);
        let posted = dispatcher.invoke_later(async move {
            let error = channel.wait_closed().await;
            if let Some(proxy) = weak.upgrade() {
                debug!(channel = %channel.id(), stream_type = %proxy.stream_type, ?error, "channel closed, disposing stream consumers");
                proxy.dispose_all();
            }
        });
        if let Err(e) = posted {
            warn!(stream_type, "cannot watch channel for close: {e}");
        }
        proxy
    }

    pub fn stream_type(&self) -> &str {
        &self.stream_type
    }

    fn consumers(&self) -> MutexGuard<'_, Vec<Arc<dyn StreamConsumer>>> {
        self.consumers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn delayed(&self) -> MutexGuard<'_, Vec<CreatedEvent>> {
        self.delayed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_consumer(self: &Arc<Self>, consumer: Arc<dyn StreamConsumer>) {
        consumer.set_proxy(Some(Arc::downgrade(self)));
        let mut consumers = self.consumers();
        if !consumers.iter().any(|c| same_object(c, &consumer)) {
            consumers.push(consumer);
        }
    }

    pub fn remove_consumer(&self, consumer: &Arc<dyn StreamConsumer>) {
        consumer.set_proxy(None);
        self.consumers().retain(|c| !same_object(c, consumer));
    }

    pub fn is_empty(&self) -> bool {
        self.consumers().is_empty()
    }

    /// Replay the created notifications held back for consumers without context.
    pub fn process_delayed_created_events(&self) {
        let events = std::mem::take(&mut *self.delayed());
        trace!(stream_type = %self.stream_type, events = events.len(), "replaying delayed created events");
        for event in events {
            self.created(&event.stream_type, &event.stream_id, Some(&event.context_id));
        }
    }

    fn dispose_all(&self) {
        let consumers = std::mem::take(&mut *self.consumers());
        self.delayed().clear();
        for consumer in consumers {
            consumer.set_proxy(None);
            consumer.dispose();
        }
    }

    fn disconnect(&self, stream_id: &str, why: &'static str) {
        let channel = self.channel.clone();
        let stream_id = stream_id.to_string();
        let posted = self.dispatcher.invoke_later(async move {
            let Some(service) = channel.streams() else {
                return;
            };
            match service.disconnect(&stream_id).await {
                Ok(()) => debug!(stream = %stream_id, "disconnected: {why}"),
                Err(e) => debug!(stream = %stream_id, "disconnect failed: {e}"),
            }
        });
        if let Err(e) = posted {
            warn!(stream = %self.stream_type, "disconnect dropped: {e}");
        }
    }
}

impl StreamsListener for StreamListenerProxy {
    fn created(&self, stream_type: &str, stream_id: &str, context_id: Option<&str>) {
        trace!(stream_type, stream_id, ?context_id, "stream created");
        let Some(context_id) = context_id else {
            self.disconnect(stream_id, "stream has no context");
            return;
        };

        let consumers = self.consumers().clone();
        let mut delayed = false;
        let mut disconnect = true;
        for consumer in &consumers {
            if !consumer.has_context() {
                delayed = true;
                continue;
            }
            let consumed = consumer.is_created_consumed(stream_type, stream_id, context_id);
            if consumed {
                consumer.created(stream_type, stream_id, Some(context_id));
                disconnect = false;
            }
        }

        if delayed {
            let event = CreatedEvent {
                stream_type: stream_type.to_string(),
                stream_id: stream_id.to_string(),
                context_id: context_id.to_string(),
            };
            let mut pending = self.delayed();
            if !pending.contains(&event) {
                debug!(stream_id, "a consumer has no context yet, delaying");
                pending.push(event);
            }
            return;
        }

        if disconnect {
            self.disconnect(stream_id, "nobody consumes the stream");
        }
    }

    fn disposed(&self, stream_type: &str, stream_id: &str) {
        self.delayed()
            .retain(|e| !(e.stream_type == stream_type && e.stream_id == stream_id));
        let consumers = self.consumers().clone();
        for consumer in consumers {
            consumer.disposed(stream_type, stream_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Transport, memory::MemoryTransport, peer::PeerInfo};
    use std::{
        sync::atomic::{AtomicBool, Ordering},
        time::Duration,
    };

    #[derive(Default)]
    struct Recorder {
        context: Mutex<Option<String>>,
        created: Mutex<Vec<String>>,
        disposed: Mutex<Vec<String>>,
        gone: AtomicBool,
        proxy: Mutex<Option<Weak<StreamListenerProxy>>>,
    }

    impl Recorder {
        fn with_context(context: &str) -> Arc<Self> {
            let r = Arc::new(Self::default());
            *r.context.lock().unwrap() = Some(context.to_string());
            r
        }

        fn set_context(&self, context: &str) {
            *self.context.lock().unwrap() = Some(context.to_string());
            let proxy = self.proxy.lock().unwrap().clone();
            if let Some(proxy) = proxy.and_then(|p| p.upgrade()) {
                proxy.process_delayed_created_events();
            }
        }
    }

    impl StreamsListener for Recorder {
        fn created(&self, _: &str, stream_id: &str, _: Option<&str>) {
            self.created.lock().unwrap().push(stream_id.to_string());
        }

        fn disposed(&self, _: &str, stream_id: &str) {
            self.disposed.lock().unwrap().push(stream_id.to_string());
        }
    }

    impl StreamConsumer for Recorder {
        fn has_context(&self) -> bool {
            self.context.lock().unwrap().is_some()
        }

        fn is_created_consumed(&self, _: &str, _: &str, context_id: &str) -> bool {
            self.context.lock().unwrap().as_deref() == Some(context_id)
        }

        fn dispose(&self) {
            self.gone.store(true, Ordering::SeqCst);
        }

        fn set_proxy(&self, proxy: Option<Weak<StreamListenerProxy>>) {
            *self.proxy.lock().unwrap() = proxy;
        }
    }

    async fn setup() -> (MemoryTransport, ChannelRef, Arc<StreamListenerProxy>) {
        let transport = MemoryTransport::new();
        let channel = transport.open_channel(&PeerInfo::new("P1"));
        channel.wait_open().await.unwrap();
        let proxy = StreamListenerProxy::new(channel.clone(), "Processes", Dispatcher::start("proxy-test").unwrap());
        (transport, channel, proxy)
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn consumed_streams_reach_their_consumer_only() {
        let (transport, _channel, proxy) = setup().await;
        let mine = Recorder::with_context("proc-1");
        let other = Recorder::with_context("proc-2");
        proxy.add_consumer(mine.clone());
        proxy.add_consumer(other.clone());

        proxy.created("Processes", "s1", Some("proc-1"));
        assert_eq!(*mine.created.lock().unwrap(), vec!["s1"]);
        assert!(other.created.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(transport.streams_for("P1").disconnects().is_empty());
    }

    #[tokio::test]
    async fn unclaimed_and_contextless_streams_are_disconnected() {
        let (transport, _channel, proxy) = setup().await;
        proxy.add_consumer(Recorder::with_context("proc-1"));

        proxy.created("Processes", "s1", Some("proc-9"));
        proxy.created("Processes", "s2", None);
        let streams = transport.streams_for("P1");
        assert!(eventually(|| streams.disconnects().len() == 2).await);
    }

    #[tokio::test]
    async fn created_events_wait_for_a_context() {
        let (transport, _channel, proxy) = setup().await;
        let late = Arc::new(Recorder::default());
        proxy.add_consumer(late.clone());

        proxy.created("Processes", "s1", Some("proc-1"));
        proxy.created("Processes", "s1", Some("proc-1"));
        proxy.created("Processes", "s2", Some("proc-1"));
        proxy.disposed("Processes", "s2");
        assert!(late.created.lock().unwrap().is_empty());

        late.set_context("proc-1");
        assert_eq!(*late.created.lock().unwrap(), vec!["s1"]);
        assert_eq!(*late.disposed.lock().unwrap(), vec!["s2"]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(transport.streams_for("P1").disconnects().is_empty());
    }

    #[tokio::test]
    async fn closing_the_channel_disposes_consumers() {
        let (_transport, channel, proxy) = setup().await;
        let consumer = Recorder::with_context("proc-1");
        proxy.add_consumer(consumer.clone());

        channel.close();
        assert!(eventually(|| consumer.gone.load(Ordering::SeqCst)).await);
        assert!(proxy.is_empty());
    }

    #[tokio::test]
    async fn removing_a_consumer_clears_its_proxy() {
        let (_transport, _channel, proxy) = setup().await;
        let consumer = Recorder::with_context("proc-1");
        let as_consumer: Arc<dyn StreamConsumer> = consumer.clone();
        proxy.add_consumer(as_consumer.clone());
        assert!(consumer.proxy.lock().unwrap().is_some());

        proxy.remove_consumer(&as_consumer);
        assert!(proxy.is_empty());
        assert!(consumer.proxy.lock().unwrap().is_none());
    }
}
