use std::{collections::BTreeMap, fmt};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use value_add::message::{ATTR_IP_HOST, ATTR_IP_PORT, ATTR_NAME, ATTR_TRANSPORT_NAME, ServerProperties};

/// A remote endpoint a channel can be opened or redirected to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct PeerInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl PeerInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), attributes: BTreeMap::new() }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// A peer listening on the loopback interface, as announced by a helper
    /// process. Its id is `transport:127.0.0.1:port`.
    pub fn loopback(props: &ServerProperties) -> Self {
        let transport = props.transport_name().unwrap_or("TCP");
        let port = props.port().unwrap_or("0");
        let host = "127.0.0.1";
        let mut peer = Self::new(format!("{transport}:{host}:{port}"));
        for (k, v) in &props.attributes {
            peer.attributes.insert(k.clone(), v.clone());
        }
        peer.attributes.insert(ATTR_IP_HOST.to_string(), host.to_string());
        peer
    }

    /// Display name, falling back to the id.
    pub fn name(&self) -> &str {
        self.attributes.get(ATTR_NAME).map(String::as_str).unwrap_or(&self.id)
    }

    pub fn transport(&self) -> Option<&str> {
        self.attributes.get(ATTR_TRANSPORT_NAME).map(String::as_str)
    }

    pub fn host(&self) -> Option<&str> {
        self.attributes.get(ATTR_IP_HOST).map(String::as_str)
    }

    pub fn port(&self) -> Option<&str> {
        self.attributes.get(ATTR_IP_PORT).map(String::as_str)
    }
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use value_add::message::TransportName;

    #[test]
    fn loopback_peer_from_announced_properties() {
        let props = ServerProperties::new(TransportName::Tcp, 1534);
        let peer = PeerInfo::loopback(&props);
        assert_eq!(peer.id, "TCP:127.0.0.1:1534");
        assert_eq!(peer.host(), Some("127.0.0.1"));
        assert_eq!(peer.port(), Some("1534"));
        assert_eq!(peer.transport(), Some("TCP"));
    }

    #[test]
    fn name_falls_back_to_id() {
        assert_eq!(PeerInfo::new("p1").name(), "p1");
        assert_eq!(PeerInfo::new("p1").with_attribute(ATTR_NAME, "Board").to_string(), "Board");
    }
}
