use std::{
    collections::HashMap,
    path::PathBuf,
    process::Stdio,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, ChildStdin, Command},
    task::JoinHandle,
};
use tracing::{debug, info, trace, warn};
use value_add::message::{ATTR_ID, ATTR_IP_HOST, ATTR_IP_PORT, ATTR_TRANSPORT_NAME, ServerProperties};

use crate::channel::{peer::PeerInfo, transport::Transport};

use super::{ValueAdd, ValueAddError};

const POLL_INTERVAL: Duration = Duration::from_millis(200);
pub const DEFAULT_OUTPUT_TIMEOUT: Duration = Duration::from_millis(2000);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// How to start a value-add executable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ValueAddCommand {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl ValueAddCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into(), args: Vec::new(), env: HashMap::new() }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    fn display(&self) -> String {
        let mut s = self.program.display().to_string();
        for arg in &self.args {
            s.push(' ');
            s.push_str(arg);
        }
        s
    }
}

struct Entry {
    /// `None` for the fixed debug peer, which nobody launched.
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    peer: PeerInfo,
    readers: Vec<JoinHandle<()>>,
}

impl Entry {
    fn has_exited(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => !matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn dispose(mut self, grace: Duration) {
        // closing stdin is the helper's signal to exit
        self.stdin.take();
        if let Some(mut child) = self.child.take() {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => debug!(peer = %self.peer.id, %status, "value-add exited"),
                _ => {
                    if let Err(e) = child.kill().await {
                        warn!(peer = %self.peer.id, "could not kill value-add: {e}");
                    }
                }
            }
        }
        for reader in self.readers {
            reader.abort();
        }
    }
}

/// A value-add backed by an external executable.
///
/// The executable announces its server with a `Server-Properties: {json}` line
/// on stdout and exits when its stdin is closed.
pub struct ExternalValueAdd {
    id: String,
    label: String,
    command: ValueAddCommand,
    output_timeout: Duration,
    shutdown_grace: Duration,
    /// `transport:host:port` of an already running helper to use instead of
    /// launching one.
    debug_peer_id: Option<String>,
    /// Used to test that a running helper still answers.
    probe: Option<Arc<dyn Transport>>,
    entries: Mutex<HashMap<String, Entry>>,
    launching: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl ExternalValueAdd {
    pub fn new(id: impl Into<String>, command: ValueAddCommand) -> Self {
        let id = id.into();
        Self {
            label: id.clone(),
            id,
            command,
            output_timeout: DEFAULT_OUTPUT_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            debug_peer_id: None,
            probe: None,
            entries: Mutex::new(HashMap::new()),
            launching: DashMap::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_output_timeout(mut self, timeout: Duration) -> Self {
        self.output_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_debug_peer_id(mut self, peer_id: impl Into<String>) -> Self {
        self.debug_peer_id = Some(peer_id.into());
        self
    }

    pub fn with_probe(mut self, transport: Arc<dyn Transport>) -> Self {
        self.probe = Some(transport);
        self
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn debug_peer(&self) -> Option<PeerInfo> {
        let id = self.debug_peer_id.as_deref()?;
        let parts: Vec<&str> = id.split(':').collect();
        let [transport, host, port] = parts.as_slice() else {
            warn!(value_add = %self.id, debug_peer = %id, "ignoring malformed debug peer id");
            return None;
        };
        let host = if host.is_empty() { "127.0.0.1" } else { *host };
        Some(
            PeerInfo::new(id)
                .with_attribute(ATTR_ID, id)
                .with_attribute(ATTR_TRANSPORT_NAME, *transport)
                .with_attribute(ATTR_IP_HOST, host)
                .with_attribute(ATTR_IP_PORT, *port),
        )
    }

    async fn spawn_and_wait(&self, peer_id: &str) -> Result<Entry, ValueAddError> {
        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args)
            .envs(&self.command.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| ValueAddError::Spawn {
            command: self.command.display(),
            reason: e.to_string(),
        })?;
        info!(value_add = %self.id, peer = %peer_id, pid = ?child.id(), "value-add started");

        let stdout = Arc::new(Mutex::new(String::new()));
        let stderr = Arc::new(Mutex::new(String::new()));
        let mut readers = Vec::new();
        if let Some(out) = child.stdout.take() {
            readers.push(collect_lines(out, stdout.clone()));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(collect_lines(err, stderr.clone()));
        }
        let stdin = child.stdin.take();
        let stderr_text = || stderr.lock().unwrap_or_else(PoisonError::into_inner).trim().to_string();

        let mut rounds = (self.output_timeout.max(POLL_INTERVAL).as_millis() / POLL_INTERVAL.as_millis()).max(1);
        let output = loop {
            if let Ok(Some(status)) = child.try_wait() {
                // give the readers a moment to pick up what the helper wrote last
                tokio::time::sleep(Duration::from_millis(20)).await;
                warn!(value_add = %self.id, peer = %peer_id, %status, "value-add died during startup");
                for reader in readers {
                    reader.abort();
                }
                return Err(ValueAddError::Died { status: status.to_string(), stderr: stderr_text() });
            }

            let captured = stdout.lock().unwrap_or_else(PoisonError::into_inner).clone();
            if ServerProperties::is_announced(&captured) {
                break captured;
            }

            rounds -= 1;
            if rounds == 0 {
                let err = ValueAddError::Timeout { timeout_ms: self.output_timeout.as_millis(), stderr: stderr_text() };
                Entry { child: Some(child), stdin, peer: PeerInfo::new(peer_id), readers }
                    .dispose(Duration::ZERO)
                    .await;
                return Err(err);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        };
        trace!(value_add = %self.id, %output, "value-add output");

        let props = match ServerProperties::parse_output(&output) {
            Ok(props) => props,
            Err(source) => {
                let err = ValueAddError::Properties { source, stderr: stderr_text() };
                Entry { child: Some(child), stdin, peer: PeerInfo::new(peer_id), readers }
                    .dispose(Duration::ZERO)
                    .await;
                return Err(err);
            }
        };

        let peer = PeerInfo::loopback(&props);
        // the announced id is replaced by the loopback id
        let id = peer.id.clone();
        let peer = peer.with_attribute(ATTR_ID, id);
        info!(value_add = %self.id, peer = %peer_id, helper = %peer.id, "value-add running");
        Ok(Entry { child: Some(child), stdin, peer, readers })
    }

    async fn probe(&self, peer: &PeerInfo) -> bool {
        let Some(transport) = &self.probe else {
            return true;
        };
        let channel = transport.open_channel(peer);
        let ok = channel.wait_open().await.is_ok();
        channel.close();
        ok
    }
}

fn collect_lines<R>(reader: R, sink: Arc<Mutex<String>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let mut buf = sink.lock().unwrap_or_else(PoisonError::into_inner);
            buf.push_str(&line);
            buf.push('\n');
        }
    })
}

#[async_trait]
impl ValueAdd for ExternalValueAdd {
    fn id(&self) -> &str {
        &self.id
    }

    fn label(&self) -> &str {
        &self.label
    }

    async fn is_alive(&self, peer_id: &str) -> Result<bool, ValueAddError> {
        let peer = {
            let mut entries = self.lock_entries();
            if !entries.contains_key(peer_id) {
                if let Some(peer) = self.debug_peer() {
                    entries.insert(peer_id.to_string(), Entry { child: None, stdin: None, peer, readers: Vec::new() });
                }
            }
            let exited = match entries.get_mut(peer_id) {
                None => return Ok(false),
                Some(entry) => entry.has_exited(),
            };
            if exited {
                debug!(value_add = %self.id, peer = %peer_id, "value-add exited on its own");
                entries.remove(peer_id);
                return Ok(false);
            }
            match entries.get(peer_id) {
                Some(entry) => entry.peer.clone(),
                None => return Ok(false),
            }
        };

        if self.probe(&peer).await {
            return Ok(true);
        }
        warn!(value_add = %self.id, peer = %peer_id, "value-add does not answer, dropping it");
        let stale = self.lock_entries().remove(peer_id);
        if let Some(entry) = stale {
            entry.dispose(Duration::ZERO).await;
        }
        Ok(false)
    }

    async fn launch(&self, peer_id: &str) -> Result<(), ValueAddError> {
        let slot = self.launching.entry(peer_id.to_string()).or_default().clone();
        let _launching = slot.lock().await;

        if self.lock_entries().contains_key(peer_id) {
            debug!(value_add = %self.id, peer = %peer_id, "value-add already launched");
            return Ok(());
        }
        let entry = self.spawn_and_wait(peer_id).await?;
        self.lock_entries().insert(peer_id.to_string(), entry);
        Ok(())
    }

    async fn shutdown(&self, peer_id: &str) -> Result<(), ValueAddError> {
        let entry = self.lock_entries().remove(peer_id);
        match entry {
            Some(entry) => {
                info!(value_add = %self.id, peer = %peer_id, "shutting down value-add");
                entry.dispose(self.shutdown_grace).await;
            }
            None => debug!(value_add = %self.id, peer = %peer_id, "no value-add to shut down"),
        }
        Ok(())
    }

    fn peer(&self, peer_id: &str) -> Option<PeerInfo> {
        self.lock_entries().get(peer_id).map(|e| e.peer.clone())
    }
}
