use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    env, fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tracing::{debug, error, info};
use value_add::message::{ATTR_IP_HOST, ATTR_IP_PORT, ATTR_TRANSPORT_NAME};

use crate::{
    channel::{PeerDirectory, PeerInfo, Transport},
    pathmap::PathMapRule,
    value_add::{ExternalValueAdd, SimulatedValueAdd, ValueAddCommand, ValueAddRef},
};

/// Read access to key/value settings. Boxed inside [`ConfigManager`] so the
/// source can be swapped (process environment, in-memory map).
#[async_trait::async_trait]
#[typetag::serde]
pub trait ConfigManagerType: Send + Sync {
    async fn as_vec(&self) -> Vec<(String, String)> {
        let mut config = vec![];
        for key in self.keys().await {
            if let Some(value) = self.get(&key).await {
                config.push((key, value));
            }
        }
        config
    }
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

#[derive(Serialize, Deserialize)]
pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    /// Snapshot of every setting with `overrides` on top.
    pub async fn layered(&self, overrides: impl IntoIterator<Item = (String, String)>) -> ConfigManager {
        let map = MapConfigManager::from_pairs(self.0.as_vec().await);
        for (key, value) in overrides {
            map.insert(&key, &value);
        }
        ConfigManager(map)
    }
}

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// The process environment, seeded from a `.env` file when there is one.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            match dotenvy::from_path(&env_file) {
                Ok(()) => info!("Loaded .env from {}", env_file.display()),
                Err(e) => error!("could not load .env from {}: {e}", env_file.display()),
            }
        } else {
            debug!("no .env at {}", env_file.display());
        }

        Box::new(Self { env_file })
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct MapConfigManager {
    #[schemars(with = "std::collections::HashMap<String, String>")]
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::default()
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, String)>) -> Box<Self> {
        Box::new(Self { map: pairs.into_iter().collect() })
    }

    pub fn insert(&self, key: &str, value: &str) {
        self.map.insert(key.to_string(), value.to_string());
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }
    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

/// A peer the chain file knows about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PeerConfig {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    /// Peer this one is reached through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    /// Value-adds that sit in front of this peer, outermost first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub value_adds: Vec<String>,
}

impl PeerConfig {
    pub fn peer_info(&self) -> PeerInfo {
        let mut peer = PeerInfo::new(self.id.clone());
        peer.attributes = self.attributes.clone();
        if let Some(transport) = &self.transport {
            peer.attributes.insert(ATTR_TRANSPORT_NAME.into(), transport.clone());
        }
        if let Some(host) = &self.host {
            peer.attributes.insert(ATTR_IP_HOST.into(), host.clone());
        }
        if let Some(port) = self.port {
            peer.attributes.insert(ATTR_IP_PORT.into(), port.to_string());
        }
        peer
    }
}

/// How a value-add is provided.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValueAddSource {
    /// Launch an executable that announces its server on stdout.
    External {
        program: PathBuf,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// Pretend to launch; hands out loopback ports from `base_port` on.
    Simulated { base_port: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ValueAddConfig {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(flatten)]
    pub source: ValueAddSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_timeout_ms: Option<u64>,
    /// Use an already running helper registered under this peer id instead
    /// of launching one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_peer_id: Option<String>,
}

impl ValueAddConfig {
    fn build(&self, probe: Option<Arc<dyn Transport>>) -> ValueAddRef {
        match &self.source {
            ValueAddSource::Simulated { base_port } => Arc::new(SimulatedValueAdd::new(self.id.clone(), *base_port)),
            ValueAddSource::External { program, args, env } => {
                let command = ValueAddCommand { program: program.clone(), args: args.clone(), env: env.clone() };
                let mut va = ExternalValueAdd::new(self.id.clone(), command);
                if let Some(label) = &self.label {
                    va = va.with_label(label.clone());
                }
                if let Some(ms) = self.output_timeout_ms {
                    va = va.with_output_timeout(Duration::from_millis(ms));
                }
                if let Some(peer_id) = &self.debug_peer_id {
                    va = va.with_debug_peer_id(peer_id.clone());
                }
                if let Some(transport) = probe {
                    va = va.with_probe(transport);
                }
                Arc::new(va)
            }
        }
    }
}

/// The chain file: peers, their proxies and value-adds, and the client's
/// path-map rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ChainConfig {
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(default)]
    pub value_adds: Vec<ValueAddConfig>,
    #[serde(default)]
    pub path_map: Vec<PathMapRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_delay_ms: Option<u64>,
}

impl ChainConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config = Self::parse(&text).with_context(|| format!("parsing {}", path.display()))?;
        debug!(path = %path.display(), peers = config.peers.len(), value_adds = config.value_adds.len(), "chain config loaded");
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: ChainConfig = serde_yaml_bw::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Duplicate ids and references to undeclared value-adds are errors.
    /// Unknown proxies are left to chain computation.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for peer in &self.peers {
            if !seen.insert(peer.id.as_str()) {
                bail!("peer `{}` is declared twice", peer.id);
            }
        }
        let mut value_adds = HashSet::new();
        for va in &self.value_adds {
            if !value_adds.insert(va.id.as_str()) {
                bail!("value-add `{}` is declared twice", va.id);
            }
        }
        for peer in &self.peers {
            if let Some(missing) = peer.value_adds.iter().find(|id| !value_adds.contains(id.as_str())) {
                bail!("peer `{}` uses undeclared value-add `{missing}`", peer.id);
            }
        }
        Ok(())
    }

    pub fn peer(&self, id: &str) -> Option<PeerInfo> {
        self.peers.iter().find(|p| p.id == id).map(PeerConfig::peer_info)
    }

    /// The client id, defaulting to this host's name.
    pub fn client_id(&self) -> String {
        self.client_id
            .clone()
            .or_else(|| env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "peerchain".to_string())
    }

    /// `probe` lets external value-adds test their helper with a throwaway
    /// channel.
    pub fn build_directory(&self, probe: Option<Arc<dyn Transport>>) -> PeerDirectory {
        let directory = PeerDirectory::new();
        for va in &self.value_adds {
            directory.add_value_add(va.build(probe.clone()));
        }
        for peer in &self.peers {
            directory.add_peer(peer.peer_info(), peer.proxy.clone(), peer.value_adds.clone());
        }
        directory
    }

    /// Like [`ChainConfig::build_directory`], but every value-add is
    /// simulated. Ports are handed out from `base_port` on, a hundred per
    /// value-add.
    pub fn build_simulated_directory(&self, base_port: u16) -> PeerDirectory {
        let directory = PeerDirectory::new();
        for (i, va) in self.value_adds.iter().enumerate() {
            let port = base_port.saturating_add((i as u16).saturating_mul(100));
            directory.add_value_add(Arc::new(SimulatedValueAdd::new(va.id.clone(), port)));
        }
        for peer in &self.peers {
            directory.add_peer(peer.peer_info(), peer.proxy.clone(), peer.value_adds.clone());
        }
        directory
    }

    /// Settings a [`ConfigManager`] can override, as key/value pairs.
    pub fn overrides(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        if let Some(ms) = self.redirect_delay_ms {
            map.insert(crate::channel::manager::REDIRECT_DELAY_KEY.to_string(), ms.to_string());
        }
        map
    }
}
