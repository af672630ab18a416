// src/channel/manager.rs

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::ConfigManager,
    dispatch::Dispatcher,
    logger::ChannelMetrics,
    pathmap::{self, PathMapError, PathMapRule, SharedRuleStore},
    stepper::{DEFAULT_CANCEL_TIMEOUT, FullQualifiedId, Step, StepData, StepExecutor, StepGroup},
    streams::StreamError,
    value_add::ValueAddRef,
};

use super::{
    ATTR_CHANNEL, ATTR_LOG_NAME, ATTR_VALUE_ADD, ChannelError, FLAG_FORCE_NEW, FLAG_NO_PATH_MAP, FLAG_NO_VALUE_ADD,
    PROP_SKIP_SHUTDOWN_STEP,
    chain::{Hop, PeerDirectory},
    event::EventBus,
    keepalive_key,
    memory::SERVICE_PATH_MAP,
    peer::PeerInfo,
    steps::{
        self, AttachPathMapsListenerStep, ChainPeerStep, CloseChannelStep, ComputeLogNameStep, InitializeLoggingStep,
        LaunchValueAddStep, PeerContext, ShutdownValueAddStep,
    },
    stream_proxy::{StreamConsumer, StreamListenerProxy},
    transport::{ChannelRef, ChannelState, StreamsListener, Transport, TransportError, same_object},
};

pub const DEFAULT_REDIRECT_DELAY: Duration = Duration::from_millis(1000);
pub const MIN_REDIRECT_DELAY: Duration = Duration::from_millis(10);

pub const REDIRECT_DELAY_KEY: &str = "PEERCHAIN_REDIRECT_DELAY";
pub const CANCEL_TIMEOUT_KEY: &str = "PEERCHAIN_CANCEL_TIMEOUT";

/// Timing knobs of the chain steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelManagerSettings {
    /// Pause between announcing a redirect and doing it.
    pub redirect_delay: Duration,
    /// How long a cancelled open may take to settle.
    pub cancel_timeout: Duration,
}

impl Default for ChannelManagerSettings {
    fn default() -> Self {
        Self { redirect_delay: DEFAULT_REDIRECT_DELAY, cancel_timeout: DEFAULT_CANCEL_TIMEOUT }
    }
}

impl ChannelManagerSettings {
    pub fn with_redirect_delay(mut self, delay: Duration) -> Self {
        self.redirect_delay = delay.max(MIN_REDIRECT_DELAY);
        self
    }

    pub fn with_cancel_timeout(mut self, timeout: Duration) -> Self {
        self.cancel_timeout = timeout;
        self
    }

    /// Read the millisecond overrides from `config`; bad values keep the defaults.
    pub async fn from_config(config: &ConfigManager) -> Self {
        let mut settings = Self::default();
        if let Some(ms) = read_millis(config, REDIRECT_DELAY_KEY).await {
            settings = settings.with_redirect_delay(ms);
        }
        if let Some(ms) = read_millis(config, CANCEL_TIMEOUT_KEY).await {
            settings = settings.with_cancel_timeout(ms);
        }
        settings
    }
}

async fn read_millis(config: &ConfigManager, key: &str) -> Option<Duration> {
    let raw = config.0.get(key).await?;
    match raw.trim().parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(e) => {
            warn!(key, value = %raw, "ignoring bad duration: {e}");
            None
        }
    }
}

/// How a caller wants its channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenFlags {
    /// Never share: open a private channel.
    pub force_new: bool,
    pub no_value_add: bool,
    pub no_path_map: bool,
}

impl OpenFlags {
    pub fn private() -> Self {
        Self { force_new: true, ..Self::default() }
    }

    /// A channel that skips value-adds or the path map is never shared.
    pub fn is_forced(&self) -> bool {
        self.force_new || self.no_value_add || self.no_path_map
    }
}

/// A value-add a channel goes through.
#[derive(Clone, Debug)]
struct HopValueAdd {
    hop: usize,
    peer: PeerInfo,
    value_add: ValueAddRef,
    /// Started by this channel's open, as opposed to found running.
    launched: bool,
}

impl HopValueAdd {
    fn key(&self) -> (String, String) {
        (self.value_add.id().to_string(), self.peer.id.clone())
    }
}

#[derive(Clone, Debug)]
struct ChannelRecord {
    channel: ChannelRef,
    target: PeerInfo,
    flags: OpenFlags,
    log_name: Option<String>,
    value_adds: Vec<HopValueAdd>,
}

struct SharedEntry {
    channel: ChannelRef,
    refs: usize,
}

type OpenResult = Result<ChannelRef, ChannelError>;

struct PendingOpen {
    waiters: Vec<oneshot::Sender<OpenResult>>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Table {
    shared: HashMap<String, SharedEntry>,
    pending: HashMap<String, PendingOpen>,
    records: HashMap<String, ChannelRecord>,
    streams: HashMap<(String, String), Arc<StreamListenerProxy>>,
}

impl Table {
    /// Value-adds still needed by channels other than the ones being closed.
    fn value_adds_in_use(&self) -> HashSet<(String, String)> {
        self.records
            .values()
            .filter(|r| r.channel.state() != ChannelState::Closed)
            .flat_map(|r| r.value_adds.iter().map(HopValueAdd::key))
            .collect()
    }

    fn drop_streams_of(&mut self, channel_id: &str) {
        self.streams.retain(|(id, _), _| id != channel_id);
    }
}

/// Opens, shares and closes channels to peers.
///
/// Shared channels are kept per target peer id and reference counted; at most
/// one open per target is in flight and later callers wait for its outcome.
/// Forced channels are private to their caller.
#[derive(Clone)]
pub struct ChannelManager {
    executor: StepExecutor,
    transport: Arc<dyn Transport>,
    directory: Arc<PeerDirectory>,
    events: EventBus,
    shared_rules: SharedRuleStore,
    settings: ChannelManagerSettings,
    metrics: ChannelMetrics,
    table: Arc<Mutex<Table>>,
}

impl ChannelManager {
    pub fn new(
        dispatcher: Dispatcher,
        transport: Arc<dyn Transport>,
        directory: Arc<PeerDirectory>,
        settings: ChannelManagerSettings,
    ) -> Self {
        Self {
            executor: StepExecutor::new(dispatcher),
            transport,
            directory,
            events: EventBus::default(),
            shared_rules: SharedRuleStore::new(),
            settings,
            metrics: ChannelMetrics::new(),
            table: Arc::default(),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn shared_rules(&self) -> &SharedRuleStore {
        &self.shared_rules
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        self.executor.dispatcher()
    }

    pub fn directory(&self) -> &Arc<PeerDirectory> {
        &self.directory
    }

    pub fn settings(&self) -> ChannelManagerSettings {
        self.settings
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The steps an open of `target` would run, as `fqid step-id` lines.
    pub fn plan(&self, target: &PeerInfo, flags: OpenFlags) -> Result<Vec<String>, ChannelError> {
        let hops = self.directory.chain_for(target)?;
        let (group, _) = self.build_open_group(target, &hops, flags);
        Ok(group.describe())
    }

    /// Open a channel to `target`, or share the open one.
    pub async fn open_channel(&self, target: &PeerInfo, flags: OpenFlags) -> Result<ChannelRef, ChannelError> {
        let hops = self.directory.chain_for(target)?;

        if flags.is_forced() {
            let (group, data) = self.build_open_group(target, &hops, flags);
            let record = self.run_open(target, &hops, flags, group, data).await?;
            let channel = record.channel.clone();
            self.lock().records.insert(channel.id().to_string(), record);
            return Ok(channel);
        }

        let (rx, leader) = {
            let mut table = self.lock();
            if let Some(entry) = table.shared.get_mut(&target.id) {
                if entry.channel.state() == ChannelState::Open {
                    entry.refs += 1;
                    debug!(peer = %target.id, channel = %entry.channel.id(), refs = entry.refs, "sharing open channel");
                    return Ok(entry.channel.clone());
                }
                debug!(peer = %target.id, state = ?entry.channel.state(), "dropping stale shared channel");
                if let Some(stale) = table.shared.remove(&target.id) {
                    table.records.remove(stale.channel.id());
                    table.drop_streams_of(stale.channel.id());
                }
            }

            let (tx, rx) = oneshot::channel();
            match table.pending.get_mut(&target.id) {
                Some(pending) => {
                    debug!(peer = %target.id, waiting = pending.waiters.len(), "open in flight, queued");
                    pending.waiters.push(tx);
                    (rx, None)
                }
                None => {
                    let (group, data) = self.build_open_group(target, &hops, flags);
                    let cancel = data.cancellation().clone();
                    table.pending.insert(target.id.clone(), PendingOpen { waiters: vec![tx], cancel });
                    (rx, Some((group, data)))
                }
            }
        };

        if let Some((group, data)) = leader {
            let me = self.clone();
            let peer = target.clone();
            let job = async move {
                let result = me.run_open(&peer, &hops, flags, group, data).await;
                me.complete_pending(&peer.id, result).await;
            };
            if let Err(e) = self.dispatcher().invoke_later(job) {
                warn!(peer = %target.id, "could not schedule open: {e}");
                self.complete_pending(&target.id, Err(ChannelError::Dispatch(e))).await;
            }
        }

        rx.await.unwrap_or(Err(ChannelError::NotAvailable))
    }

    /// Cancel the shared open in flight for `peer_id`. True when there was one.
    pub fn cancel_open(&self, peer_id: &str) -> bool {
        match self.lock().pending.get(peer_id) {
            Some(pending) => {
                info!(peer = %peer_id, "cancelling open");
                pending.cancel.cancel();
                true
            }
            None => false,
        }
    }

    async fn complete_pending(&self, peer_id: &str, result: Result<ChannelRecord, ChannelError>) {
        let mut orphan = None;
        let (waiters, outcome) = {
            let mut table = self.lock();
            let mut waiters = table.pending.remove(peer_id).map(|p| p.waiters).unwrap_or_default();
            waiters.retain(|tx| !tx.is_closed());

            let outcome = match result {
                Ok(record) if waiters.is_empty() => {
                    debug!(peer = %peer_id, "nobody waits for the opened channel anymore");
                    let channel = record.channel.clone();
                    orphan = Some(record);
                    Ok(channel)
                }
                Ok(record) => {
                    let channel = record.channel.clone();
                    table
                        .shared
                        .insert(peer_id.to_string(), SharedEntry { channel: channel.clone(), refs: waiters.len() });
                    table.records.insert(channel.id().to_string(), record);
                    Ok(channel)
                }
                Err(e) => Err(e),
            };
            (waiters, outcome)
        };

        for tx in waiters {
            let _ = tx.send(outcome.clone());
        }
        if let Some(record) = orphan {
            let in_use = self.lock().value_adds_in_use();
            if let Err(e) = self.run_close(record, &in_use, false).await {
                warn!(peer = %peer_id, "closing unclaimed channel failed: {e}");
            }
        }
    }

    fn build_open_group(&self, target: &PeerInfo, hops: &[Hop], flags: OpenFlags) -> (StepGroup<PeerContext>, StepData) {
        let root = FullQualifiedId::root();
        let open = root.child("open");
        let data = StepData::new();
        data.set_bool(&root, FLAG_FORCE_NEW, flags.is_forced());
        data.set_bool(&root, FLAG_NO_VALUE_ADD, flags.no_value_add);
        data.set_bool(&root, FLAG_NO_PATH_MAP, flags.no_path_map);

        let chain: Arc<dyn Step<PeerContext>> = Arc::new(
            ChainPeerStep::new(self.transport.clone(), self.events.clone(), self.settings.redirect_delay)
                .with_cancel_timeout(self.settings.cancel_timeout),
        );
        let target_ctx = PeerContext::new(target.clone(), target.clone());

        let mut group = StepGroup::new(format!("open {}", target.id));
        group.push(Arc::new(ComputeLogNameStep), target_ctx.clone(), open.child("log-name"));
        for (i, hop) in hops.iter().enumerate() {
            let hop_id = open.child(format!("hop-{i}"));
            let ctx = PeerContext::new(target.clone(), hop.peer.clone());
            for va in &hop.value_adds {
                let va_id = hop_id.child(format!("va-{}", va.id()));
                data.set_object(&va_id, ATTR_VALUE_ADD, va.clone());
                group.push(Arc::new(LaunchValueAddStep), ctx.clone(), va_id.clone());
                group.push(chain.clone(), ctx.clone(), va_id.child("chain"));
            }
            group.push(chain.clone(), ctx, hop_id.child("chain"));
        }
        group.push(
            Arc::new(AttachPathMapsListenerStep::new(self.shared_rules.clone(), self.dispatcher().clone())),
            target_ctx.clone(),
            open.child("path-map"),
        );
        group.push(Arc::new(InitializeLoggingStep::new(self.events.clone())), target_ctx, open.child("logging"));
        (group, data)
    }

    async fn run_open(
        &self,
        target: &PeerInfo,
        hops: &[Hop],
        flags: OpenFlags,
        group: StepGroup<PeerContext>,
        data: StepData,
    ) -> Result<ChannelRecord, ChannelError> {
        let started = Instant::now();
        debug!(peer = %target.id, steps = group.len(), forced = flags.is_forced(), "opening channel");

        if let Err(failure) = self.executor.run(group, data.clone()).await {
            self.metrics.record_failure(&target.id);
            return Err(ChannelError::Failed { peer: target.id.clone(), failure: Arc::new(failure) });
        }

        let root = FullQualifiedId::root();
        let channel = steps::channel(&data, &root).ok_or(ChannelError::NotAvailable)?;
        let open = root.child("open");
        let mut value_adds = Vec::new();
        if !flags.no_value_add {
            for (i, hop) in hops.iter().enumerate() {
                let hop_id = open.child(format!("hop-{i}"));
                for va in &hop.value_adds {
                    let va_id = hop_id.child(format!("va-{}", va.id()));
                    value_adds.push(HopValueAdd {
                        hop: i,
                        peer: hop.peer.clone(),
                        value_add: va.clone(),
                        launched: !data.get_bool(&va_id, &keepalive_key(va.id())),
                    });
                }
            }
        }

        self.metrics.record_open(&target.id, started.elapsed().as_secs_f64() * 1_000.0);
        Ok(ChannelRecord {
            channel,
            target: target.clone(),
            flags,
            log_name: data.get_text(&root, ATTR_LOG_NAME),
            value_adds,
        })
    }

    /// Give back one reference to `channel`. The last one, or any close of a
    /// private channel, closes it and stops the value-adds it started.
    pub async fn close_channel(&self, channel: &ChannelRef) -> Result<(), ChannelError> {
        let (record, in_use, target_pending) = {
            let mut guard = self.lock();
            let table = &mut *guard;
            let Some((target_id, forced)) =
                table.records.get(channel.id()).map(|r| (r.target.id.clone(), r.flags.is_forced()))
            else {
                debug!(channel = %channel.id(), "closing unmanaged channel");
                channel.close();
                return Ok(());
            };

            if !forced {
                if let Some(entry) = table.shared.get_mut(&target_id).filter(|e| same_object(&e.channel, channel)) {
                    entry.refs = entry.refs.saturating_sub(1);
                    if entry.refs > 0 {
                        debug!(peer = %target_id, refs = entry.refs, "channel still in use");
                        return Ok(());
                    }
                    table.shared.remove(&target_id);
                }
            }

            let Some(record) = table.records.remove(channel.id()) else {
                return Ok(());
            };
            table.drop_streams_of(channel.id());
            let target_pending = table.pending.contains_key(&target_id) || table.shared.contains_key(&target_id);
            (record, table.value_adds_in_use(), target_pending)
        };

        self.run_close(record, &in_use, target_pending).await
    }

    /// Close every channel to `peer_id`, shared or private, whatever its count.
    pub async fn shutdown_peer(&self, peer_id: &str) -> Result<(), ChannelError> {
        let (records, in_use) = {
            let mut guard = self.lock();
            let table = &mut *guard;
            table.shared.remove(peer_id);
            let ids: Vec<String> = table
                .records
                .iter()
                .filter(|(_, r)| r.target.id == peer_id)
                .map(|(id, _)| id.clone())
                .collect();
            let records: Vec<ChannelRecord> = ids.iter().filter_map(|id| table.records.remove(id)).collect();
            for id in &ids {
                table.drop_streams_of(id);
            }
            (records, table.value_adds_in_use())
        };

        info!(peer = %peer_id, channels = records.len(), "shutting down peer");
        let mut first_error = None;
        for record in records {
            if let Err(e) = self.run_close(record, &in_use, false).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Cancel pending opens and close everything.
    pub async fn close_all(&self) -> Result<(), ChannelError> {
        let records: Vec<ChannelRecord> = {
            let mut table = self.lock();
            for pending in table.pending.values() {
                pending.cancel.cancel();
            }
            table.shared.clear();
            table.streams.clear();
            table.records.drain().map(|(_, r)| r).collect()
        };

        let mut first_error = None;
        for record in records {
            if let Err(e) = self.run_close(record, &HashSet::new(), false).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn run_close(
        &self,
        record: ChannelRecord,
        in_use: &HashSet<(String, String)>,
        target_pending: bool,
    ) -> Result<(), ChannelError> {
        let root = FullQualifiedId::root();
        let close = root.child("close");
        let data = StepData::new();
        data.set_object(&root, ATTR_CHANNEL, record.channel.clone());
        if let Some(name) = &record.log_name {
            data.set_text(&root, ATTR_LOG_NAME, name.clone());
        }

        let target_ctx = PeerContext::new(record.target.clone(), record.target.clone());
        let mut group = StepGroup::new(format!("close {}", record.target.id));
        group.push(Arc::new(CloseChannelStep::new(self.events.clone())), target_ctx, close.child("channel"));
        for hva in record.value_adds.iter().filter(|v| v.launched) {
            let va_id = close.child(format!("hop-{}", hva.hop)).child(format!("va-{}", hva.value_add.id()));
            let skip = target_pending || in_use.contains(&hva.key());
            data.set_object(&va_id, ATTR_VALUE_ADD, hva.value_add.clone());
            data.set_bool(&va_id, PROP_SKIP_SHUTDOWN_STEP, skip);
            group.push(
                Arc::new(ShutdownValueAddStep),
                PeerContext::new(record.target.clone(), hva.peer.clone()),
                va_id,
            );
        }

        debug!(peer = %record.target.id, channel = %record.channel.id(), "closing channel");
        let result = self.executor.run(group, data).await;
        self.metrics.record_close(&record.target.id);
        result.map_err(|failure| ChannelError::Failed { peer: record.target.id.clone(), failure: Arc::new(failure) })
    }

    /// The shared channel to `peer_id`, unless it is closed.
    pub fn get_channel(&self, peer_id: &str) -> Option<ChannelRef> {
        self.lock()
            .shared
            .get(peer_id)
            .filter(|e| e.channel.state() != ChannelState::Closed)
            .map(|e| e.channel.clone())
    }

    /// Every open channel this manager handed out.
    pub fn open_channels(&self) -> Vec<ChannelRef> {
        self.lock()
            .records
            .values()
            .filter(|r| r.channel.state() == ChannelState::Open)
            .map(|r| r.channel.clone())
            .collect()
    }

    /// Merge `client_rules` with the agent's map behind `channel` and push the
    /// result when it changed. Channels opened with `no_path_map` are left
    /// alone. Returns whether a push happened.
    pub async fn sync_path_map(
        &self,
        channel: &ChannelRef,
        client_rules: &[PathMapRule],
        client_id: &str,
        force_empty_allowed: bool,
    ) -> Result<bool, PathMapError> {
        let skip = self.lock().records.get(channel.id()).is_some_and(|r| r.flags.no_path_map);
        if skip {
            debug!(channel = %channel.id(), "path map not applied to this channel");
            return Ok(false);
        }
        let service = channel
            .path_map()
            .ok_or_else(|| PathMapError::Get(TransportError::NoService(SERVICE_PATH_MAP.to_string())))?;
        let (_, pushed) = pathmap::synchronize(client_rules, client_id, service.as_ref(), force_empty_allowed).await?;
        Ok(pushed)
    }

    /// Route created/disposed notifications of `stream_type` on `channel` to
    /// `consumer`. The first consumer per channel and type subscribes with the
    /// agent.
    pub async fn subscribe_stream(
        &self,
        channel: &ChannelRef,
        stream_type: &str,
        consumer: Arc<dyn StreamConsumer>,
    ) -> Result<(), StreamError> {
        if channel.state() != ChannelState::Open {
            return Err(StreamError::Closed);
        }
        let service = channel.streams().ok_or(StreamError::MissingService)?;
        let key = (channel.id().to_string(), stream_type.to_string());

        let (proxy, fresh) = {
            let mut table = self.lock();
            match table.streams.get(&key) {
                Some(proxy) => (proxy.clone(), false),
                None => {
                    let proxy = StreamListenerProxy::new(channel.clone(), stream_type, self.dispatcher().clone());
                    table.streams.insert(key.clone(), proxy.clone());
                    (proxy, true)
                }
            }
        };
        proxy.add_consumer(consumer);

        if fresh {
            let listener: Arc<dyn StreamsListener> = proxy.clone();
            if let Err(e) = service.subscribe(stream_type, listener).await {
                warn!(channel = %channel.id(), stream_type, "stream subscription failed: {e}");
                self.lock().streams.remove(&key);
                return Err(e.into());
            }
            debug!(channel = %channel.id(), stream_type, "subscribed to streams");
        }
        Ok(())
    }

    /// Undo [`ChannelManager::subscribe_stream`]. The agent subscription goes
    /// with the last consumer.
    pub async fn unsubscribe_stream(
        &self,
        channel: &ChannelRef,
        stream_type: &str,
        consumer: &Arc<dyn StreamConsumer>,
    ) -> Result<(), StreamError> {
        let key = (channel.id().to_string(), stream_type.to_string());
        let Some(proxy) = self.lock().streams.get(&key).cloned() else {
            return Ok(());
        };
        proxy.remove_consumer(consumer);
        if !proxy.is_empty() {
            return Ok(());
        }

        self.lock().streams.remove(&key);
        if let Some(service) = channel.streams() {
            let listener: Arc<dyn StreamsListener> = proxy;
            service.unsubscribe(stream_type, &listener).await?;
            debug!(channel = %channel.id(), stream_type, "unsubscribed from streams");
        }
        Ok(())
    }
}
