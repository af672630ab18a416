//! The steps that open and close channels.
//!
//! Every step reads what it needs from [`StepData`]: the channel under
//! construction lives at the root scope under [`ATTR_CHANNEL`], the value-add
//! of a hop at the hop's scope under [`ATTR_VALUE_ADD`].

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    dispatch::Dispatcher,
    pathmap::SharedRuleStore,
    stepper::{DEFAULT_CANCEL_TIMEOUT, FullQualifiedId, Step, StepData, StepError},
    value_add::{ValueAddError, ValueAddRef},
};

use super::{
    ATTR_ACTIVE_PEER, ATTR_CHANNEL, ATTR_LOG_NAME, ATTR_VALUE_ADD, ChannelError, FLAG_FORCE_NEW, FLAG_NO_PATH_MAP,
    FLAG_NO_VALUE_ADD, PROP_SKIP_SHUTDOWN_STEP,
    event::{ChannelEvent, ChannelEventKind, EventBus},
    keepalive_key,
    peer::PeerInfo,
    transport::{ChannelRef, ChannelState, PathMapListener, PathMapService, Transport, TransportError},
};

const ATTR_PATH_MAP_HOOK: &str = "path_map_hook";

/// What a step works on: the peer the whole group is for and the hop the step
/// belongs to.
#[derive(Debug, Clone)]
pub struct PeerContext {
    pub target: PeerInfo,
    pub active: PeerInfo,
}

impl PeerContext {
    pub fn new(target: PeerInfo, active: PeerInfo) -> Arc<Self> {
        Arc::new(Self { target, active })
    }
}

pub fn channel(data: &StepData, fqid: &FullQualifiedId) -> Option<ChannelRef> {
    data.get_object::<ChannelRef>(fqid, ATTR_CHANNEL)
}

fn value_add(data: &StepData, fqid: &FullQualifiedId, step: &str) -> Result<ValueAddRef, StepError> {
    data.get_object::<ValueAddRef>(fqid, ATTR_VALUE_ADD)
        .ok_or_else(|| StepError::validation(step, "Value-add descriptor instance not set."))
}

fn fire(events: &EventBus, kind: ChannelEventKind, channel: &ChannelRef, message: impl Into<String>, data: &StepData, fqid: &FullQualifiedId) {
    events.fire(ChannelEvent::new(kind, channel.id(), message, data.get_text(fqid, ATTR_LOG_NAME)));
}

/// Waits for the pending open or redirect unless the group is cancelled first.
async fn settle(channel: &ChannelRef, data: &StepData) -> Result<(), Option<TransportError>> {
    tokio::select! {
        res = channel.wait_open() => res.map_err(Some),
        _ = data.cancellation().cancelled() => Err(None),
    }
}

// ---------------------------------------------------------------------------

/// Names the log all events of this channel go to.
pub struct ComputeLogNameStep;

#[async_trait]
impl Step<PeerContext> for ComputeLogNameStep {
    fn id(&self) -> &str {
        "compute-log-name"
    }

    async fn execute(&self, ctx: &PeerContext, data: &StepData, fqid: &FullQualifiedId) -> Result<(), StepError> {
        let mut name: String = ctx
            .target
            .name()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        if data.get_bool(fqid, FLAG_FORCE_NEW) {
            let suffix = Uuid::new_v4().simple().to_string();
            name.push('-');
            name.push_str(&suffix[..8]);
        }
        debug!(target_peer = %ctx.target.id, log_name = %name, "log name");
        data.set_text(&FullQualifiedId::root(), ATTR_LOG_NAME, name);
        Ok(())
    }
}

/// Opens the channel to the hop's peer, or redirects the existing channel
/// there.
pub struct ChainPeerStep {
    transport: Arc<dyn Transport>,
    events: EventBus,
    redirect_delay: Duration,
    cancel_timeout: Duration,
}

impl ChainPeerStep {
    pub fn new(transport: Arc<dyn Transport>, events: EventBus, redirect_delay: Duration) -> Self {
        Self { transport, events, redirect_delay, cancel_timeout: DEFAULT_CANCEL_TIMEOUT }
    }

    pub fn with_cancel_timeout(mut self, timeout: Duration) -> Self {
        self.cancel_timeout = timeout;
        self
    }
}

#[async_trait]
impl Step<PeerContext> for ChainPeerStep {
    fn id(&self) -> &str {
        "chain-peer"
    }

    async fn execute(&self, ctx: &PeerContext, data: &StepData, fqid: &FullQualifiedId) -> Result<(), StepError> {
        let peer = match data.get_object::<PeerInfo>(fqid, ATTR_ACTIVE_PEER) {
            Some(peer) => peer,
            None if data.contains(fqid, ATTR_VALUE_ADD) => {
                debug!(fqid = %fqid, "value-add not in use, nothing to chain");
                return Ok(());
            }
            None => ctx.active.clone(),
        };

        match channel(data, fqid) {
            None => {
                let channel = self.transport.open_channel(&peer);
                fire(&self.events, ChannelEventKind::Opening, &channel, format!("to {}", peer.id), data, fqid);
                data.set_object(&FullQualifiedId::root(), ATTR_CHANNEL, channel.clone());

                if let Err(error) = settle(&channel, data).await {
                    channel.close();
                    data.remove(&FullQualifiedId::root(), ATTR_CHANNEL);
                    return Err(match error {
                        Some(source) => StepError::failed(self.id(), ChannelError::OpenChannel { peer: peer.id, source }),
                        None => StepError::Cancelled,
                    });
                }
            }
            Some(channel) => {
                let message = format!("{} --> {}", channel.remote_peer().id, peer.id);
                fire(&self.events, ChannelEventKind::Redirect, &channel, message, data, fqid);

                tokio::select! {
                    _ = tokio::time::sleep(self.redirect_delay) => {}
                    _ = data.cancellation().cancelled() => return Err(StepError::Cancelled),
                }

                let result = match channel.redirect(&peer) {
                    Ok(()) => settle(&channel, data).await,
                    Err(e) => Err(Some(e)),
                };
                if let Err(error) = result {
                    channel.close();
                    return Err(match error {
                        Some(source) => StepError::failed(self.id(), ChannelError::Redirect { peer: peer.id, source }),
                        None => StepError::Cancelled,
                    });
                }
            }
        }
        debug!(peer = %peer.id, "chained");
        Ok(())
    }

    async fn rollback(&self, _ctx: &PeerContext, data: &StepData, _status: &StepError, fqid: &FullQualifiedId) -> Result<(), StepError> {
        if let Some(channel) = channel(data, fqid) {
            if channel.state() != ChannelState::Closed {
                channel.close();
            }
        }
        Ok(())
    }

    fn cancel_timeout(&self) -> Duration {
        self.cancel_timeout
    }
}

/// Starts the hop's value-add unless one is already running.
pub struct LaunchValueAddStep;

#[async_trait]
impl Step<PeerContext> for LaunchValueAddStep {
    fn id(&self) -> &str {
        "launch-value-add"
    }

    fn validate(&self, _ctx: &PeerContext, data: &StepData, fqid: &FullQualifiedId) -> Result<(), StepError> {
        value_add(data, fqid, self.id()).map(|_| ())
    }

    async fn execute(&self, ctx: &PeerContext, data: &StepData, fqid: &FullQualifiedId) -> Result<(), StepError> {
        let va = value_add(data, fqid, self.id())?;
        if data.get_bool(fqid, FLAG_NO_VALUE_ADD) {
            return Ok(());
        }
        let peer_id = ctx.active.id.as_str();

        let alive = va.is_alive(peer_id).await.map_err(|e| StepError::failed(self.id(), e))?;
        if alive {
            // someone else owns it; a rollback here must not take it down
            debug!(value_add = %va.id(), peer = %peer_id, "value-add already running");
            data.set_bool(fqid, &keepalive_key(va.id()), true);
        } else {
            va.launch(peer_id).await.map_err(|e| StepError::failed(self.id(), e))?;
        }

        let helper = va
            .peer(peer_id)
            .ok_or_else(|| StepError::failed(self.id(), ValueAddError::NoPeer(peer_id.to_string())))?;
        data.set_object(fqid, ATTR_ACTIVE_PEER, helper);
        Ok(())
    }

    async fn rollback(&self, ctx: &PeerContext, data: &StepData, _status: &StepError, fqid: &FullQualifiedId) -> Result<(), StepError> {
        let va = value_add(data, fqid, self.id())?;
        let keepalive = data.get_bool(fqid, &keepalive_key(va.id()));
        if data.get_bool(fqid, FLAG_NO_VALUE_ADD) || keepalive {
            return Ok(());
        }
        va.shutdown(&ctx.active.id).await.map_err(|e| StepError::failed(self.id(), e))
    }
}

#[derive(Clone)]
struct PathMapHook {
    service: Arc<dyn PathMapService>,
    listener: Arc<dyn PathMapListener>,
}

/// Keeps the shared rules of one peer in line with its agent.
struct SharedRulesListener {
    peer_id: String,
    service: std::sync::Weak<dyn PathMapService>,
    store: SharedRuleStore,
    dispatcher: Dispatcher,
}

impl PathMapListener for SharedRulesListener {
    fn changed(&self) {
        let Some(service) = self.service.upgrade() else {
            return;
        };
        let peer_id = self.peer_id.clone();
        let store = self.store.clone();
        let posted = self.dispatcher.invoke_later(async move {
            let rules = match service.get().await {
                Ok(rules) => rules,
                Err(e) => {
                    warn!(peer = %peer_id, "could not read path map: {e}");
                    return;
                }
            };
            let update = tokio::task::spawn_blocking(move || store.update_from_remote(&peer_id, rules.as_deref()));
            if let Err(e) = update.await {
                warn!("shared rule update failed: {e}");
            }
        });
        if let Err(e) = posted {
            warn!(peer = %self.peer_id, "path map change dropped: {e}");
        }
    }
}

/// Tracks the rules other clients share through the agent.
pub struct AttachPathMapsListenerStep {
    store: SharedRuleStore,
    dispatcher: Dispatcher,
}

impl AttachPathMapsListenerStep {
    pub fn new(store: SharedRuleStore, dispatcher: Dispatcher) -> Self {
        Self { store, dispatcher }
    }
}

#[async_trait]
impl Step<PeerContext> for AttachPathMapsListenerStep {
    fn id(&self) -> &str {
        "attach-path-maps-listener"
    }

    fn validate(&self, _ctx: &PeerContext, data: &StepData, fqid: &FullQualifiedId) -> Result<(), StepError> {
        match channel(data, fqid) {
            Some(c) if c.state() == ChannelState::Open => Ok(()),
            _ => Err(StepError::validation(self.id(), "Channel to target not available or closed.")),
        }
    }

    async fn execute(&self, ctx: &PeerContext, data: &StepData, fqid: &FullQualifiedId) -> Result<(), StepError> {
        if data.get_bool(fqid, FLAG_NO_PATH_MAP) {
            return Ok(());
        }
        let Some(service) = channel(data, fqid).and_then(|c| c.path_map()) else {
            debug!(peer = %ctx.target.id, "agent has no path map service");
            return Ok(());
        };
        let listener: Arc<dyn PathMapListener> = Arc::new(SharedRulesListener {
            peer_id: ctx.target.id.clone(),
            service: Arc::downgrade(&service),
            store: self.store.clone(),
            dispatcher: self.dispatcher.clone(),
        });
        service.add_listener(listener.clone());
        data.set_object(fqid, ATTR_PATH_MAP_HOOK, PathMapHook { service, listener });
        Ok(())
    }

    async fn rollback(&self, _ctx: &PeerContext, data: &StepData, _status: &StepError, fqid: &FullQualifiedId) -> Result<(), StepError> {
        if let Some(hook) = data.get_object::<PathMapHook>(fqid, ATTR_PATH_MAP_HOOK) {
            hook.service.remove_listener(&hook.listener);
            data.remove(fqid, ATTR_PATH_MAP_HOOK);
        }
        Ok(())
    }
}

/// Announces the opened channel: its remote services, then how it was opened.
pub struct InitializeLoggingStep {
    events: EventBus,
}

impl InitializeLoggingStep {
    pub fn new(events: EventBus) -> Self {
        Self { events }
    }
}

#[async_trait]
impl Step<PeerContext> for InitializeLoggingStep {
    fn id(&self) -> &str {
        "initialize-logging"
    }

    fn validate(&self, _ctx: &PeerContext, data: &StepData, fqid: &FullQualifiedId) -> Result<(), StepError> {
        channel(data, fqid)
            .map(|_| ())
            .ok_or_else(|| StepError::validation(self.id(), "Channel to target not available."))
    }

    async fn execute(&self, _ctx: &PeerContext, data: &StepData, fqid: &FullQualifiedId) -> Result<(), StepError> {
        let Some(channel) = channel(data, fqid) else {
            return Err(StepError::validation(self.id(), "Channel to target not available."));
        };
        if channel.state() != ChannelState::Open {
            return Ok(());
        }

        let mut services = channel.remote_services();
        services.sort();
        fire(&self.events, ChannelEventKind::Services, &channel, services.join(", "), data, fqid);

        let mut message = String::from(if data.get_bool(fqid, FLAG_FORCE_NEW) { "Private" } else { "Shared" });
        if data.get_bool(fqid, FLAG_NO_VALUE_ADD) {
            message.push_str(", No Value Add");
        }
        if data.get_bool(fqid, FLAG_NO_PATH_MAP) {
            message.push_str(", Not Applying Path Map");
        }
        fire(&self.events, ChannelEventKind::Open, &channel, message, data, fqid);
        info!(channel = %channel.id(), peer = %channel.remote_peer().id, "channel open");
        Ok(())
    }
}

/// Stops the value-add of a hop when its last channel goes away.
pub struct ShutdownValueAddStep;

#[async_trait]
impl Step<PeerContext> for ShutdownValueAddStep {
    fn id(&self) -> &str {
        "shutdown-value-add"
    }

    fn validate(&self, _ctx: &PeerContext, data: &StepData, fqid: &FullQualifiedId) -> Result<(), StepError> {
        value_add(data, fqid, self.id()).map(|_| ())
    }

    async fn execute(&self, ctx: &PeerContext, data: &StepData, fqid: &FullQualifiedId) -> Result<(), StepError> {
        let va = value_add(data, fqid, self.id())?;
        if data.get_bool(fqid, PROP_SKIP_SHUTDOWN_STEP) {
            debug!(value_add = %va.id(), "value-add still in use, not shutting it down");
            return Ok(());
        }
        va.shutdown(&ctx.active.id).await.map_err(|e| StepError::failed(self.id(), e))
    }
}

/// Closes the channel and says so.
pub struct CloseChannelStep {
    events: EventBus,
}

impl CloseChannelStep {
    pub fn new(events: EventBus) -> Self {
        Self { events }
    }
}

#[async_trait]
impl Step<PeerContext> for CloseChannelStep {
    fn id(&self) -> &str {
        "close-channel"
    }

    fn validate(&self, _ctx: &PeerContext, data: &StepData, fqid: &FullQualifiedId) -> Result<(), StepError> {
        channel(data, fqid)
            .map(|_| ())
            .ok_or_else(|| StepError::validation(self.id(), "Channel to close not set."))
    }

    async fn execute(&self, _ctx: &PeerContext, data: &StepData, fqid: &FullQualifiedId) -> Result<(), StepError> {
        if let Some(channel) = channel(data, fqid) {
            channel.close();
            fire(&self.events, ChannelEventKind::Close, &channel, "closed", data, fqid);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::{event::drain, memory::MemoryTransport},
        stepper::{StepExecutor, StepGroup},
        value_add::{SimulatedValueAdd, ValueAdd},
    };

    fn executor() -> StepExecutor {
        StepExecutor::new(Dispatcher::start("steps-test").unwrap())
    }

    fn chain(transport: &MemoryTransport, events: &EventBus) -> Arc<dyn Step<PeerContext>> {
        Arc::new(ChainPeerStep::new(Arc::new(transport.clone()), events.clone(), Duration::from_millis(10)))
    }

    #[tokio::test]
    async fn open_then_redirect_emits_one_event_each() {
        let transport = MemoryTransport::new();
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let target = PeerInfo::new("P2");
        let root = FullQualifiedId::root();

        let group = StepGroup::new("open")
            .with_step(chain(&transport, &events), PeerContext::new(target.clone(), PeerInfo::new("P1")), root.child("hop-0"))
            .with_step(chain(&transport, &events), PeerContext::new(target.clone(), target.clone()), root.child("hop-1"));
        let data = StepData::new();
        executor().run(group, data.clone()).await.unwrap();

        let channel = channel(&data, &root).unwrap();
        assert_eq!(channel.remote_peer().id, "P2");
        let seen: Vec<_> = drain(&mut rx).into_iter().map(|e| (e.kind, e.message)).collect();
        assert_eq!(
            seen,
            vec![
                (ChannelEventKind::Opening, "to P1".to_string()),
                (ChannelEventKind::Redirect, "P1 --> P2".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn failed_open_is_wrapped_and_leaves_no_channel() {
        let transport = MemoryTransport::new();
        transport.fail_open("P1", TransportError::Refused("down".into()));
        let events = EventBus::default();
        let target = PeerInfo::new("P1");

        let group = StepGroup::new("open").with_step(
            chain(&transport, &events),
            PeerContext::new(target.clone(), target),
            FullQualifiedId::root().child("hop-0"),
        );
        let data = StepData::new();
        let failure = executor().run(group, data.clone()).await.unwrap_err();

        assert!(matches!(failure.status.cause::<ChannelError>(), Some(ChannelError::OpenChannel { .. })));
        assert!(channel(&data, &FullQualifiedId::root()).is_none());
    }

    #[tokio::test]
    async fn observed_value_add_survives_rollback() {
        let transport = MemoryTransport::new();
        transport.fail_redirect("P1", TransportError::Refused("down".into()));
        let events = EventBus::default();
        let va = SimulatedValueAdd::new("va", 4000);
        va.start_externally("P1");
        let target = PeerInfo::new("P1");
        let hop = FullQualifiedId::root().child("hop-0");
        let va_scope = hop.child("va-va");

        let data = StepData::new();
        data.set_object(&va_scope, ATTR_VALUE_ADD, Arc::new(va.clone()) as ValueAddRef);
        let ctx = PeerContext::new(target.clone(), target.clone());
        let group = StepGroup::new("open")
            .with_step(Arc::new(LaunchValueAddStep), ctx.clone(), va_scope.clone())
            .with_step(chain(&transport, &events), ctx.clone(), va_scope.child("chain"))
            .with_step(chain(&transport, &events), ctx, hop.child("chain"));

        let failure = executor().run(group, data.clone()).await.unwrap_err();
        assert_eq!(failure.rolled_back, vec!["chain-peer", "launch-value-add"]);
        assert_eq!(va.shutdowns(), 0);
        assert!(va.peer("P1").is_some());
    }

    #[tokio::test]
    async fn launched_value_add_is_shut_down_on_rollback() {
        let transport = MemoryTransport::new();
        transport.fail_redirect("P1", TransportError::Refused("down".into()));
        let events = EventBus::default();
        let va = SimulatedValueAdd::new("va", 4100);
        let target = PeerInfo::new("P1");
        let hop = FullQualifiedId::root().child("hop-0");
        let va_scope = hop.child("va-va");

        let data = StepData::new();
        data.set_object(&va_scope, ATTR_VALUE_ADD, Arc::new(va.clone()) as ValueAddRef);
        let ctx = PeerContext::new(target.clone(), target.clone());
        let group = StepGroup::new("open")
            .with_step(Arc::new(LaunchValueAddStep), ctx.clone(), va_scope.clone())
            .with_step(chain(&transport, &events), ctx.clone(), va_scope.child("chain"))
            .with_step(chain(&transport, &events), ctx, hop.child("chain"));

        let failure = executor().run(group, data.clone()).await.unwrap_err();
        assert!(matches!(failure.status.cause::<ChannelError>(), Some(ChannelError::Redirect { .. })));
        assert_eq!(va.launches(), 1);
        assert_eq!(va.shutdowns(), 1);
        assert_eq!(transport.opens(), vec!["TCP:127.0.0.1:4100".to_string()]);
    }

    #[tokio::test]
    async fn launch_without_descriptor_fails_validation() {
        let target = PeerInfo::new("P1");
        let group = StepGroup::new("open").with_step(
            Arc::new(LaunchValueAddStep) as Arc<dyn Step<PeerContext>>,
            PeerContext::new(target.clone(), target),
            FullQualifiedId::root().child("va"),
        );
        let failure = executor().run(group, StepData::new()).await.unwrap_err();
        assert!(matches!(failure.status, StepError::Validation { .. }));
    }

    #[tokio::test]
    async fn logging_reports_services_and_mode() {
        let transport = MemoryTransport::new();
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let target = PeerInfo::new("P1");
        let root = FullQualifiedId::root();
        let ctx = PeerContext::new(target.clone(), target);

        let data = StepData::new();
        data.set_bool(&root, FLAG_FORCE_NEW, true);
        data.set_bool(&root, FLAG_NO_PATH_MAP, true);
        let group = StepGroup::new("open")
            .with_step(Arc::new(ComputeLogNameStep), ctx.clone(), root.child("log-name"))
            .with_step(chain(&transport, &events), ctx.clone(), root.child("hop-0"))
            .with_step(Arc::new(InitializeLoggingStep::new(events.clone())), ctx, root.child("logging"));
        executor().run(group, data.clone()).await.unwrap();

        let events = drain(&mut rx);
        let services = events.iter().find(|e| e.kind == ChannelEventKind::Services).unwrap();
        assert_eq!(services.message, "Locator, PathMap, Streams");
        let open = events.iter().find(|e| e.kind == ChannelEventKind::Open).unwrap();
        assert_eq!(open.message, "Private, Not Applying Path Map");
        assert!(open.log_name.as_deref().unwrap().starts_with("P1-"));
    }

    #[tokio::test]
    async fn path_map_listener_requires_an_open_channel() {
        let target = PeerInfo::new("P1");
        let step = AttachPathMapsListenerStep::new(SharedRuleStore::new(), Dispatcher::start("pm").unwrap());
        let err = step
            .validate(&PeerContext { target: target.clone(), active: target }, &StepData::new(), &FullQualifiedId::root())
            .unwrap_err();
        assert!(err.to_string().contains("not available or closed"));
    }
}
