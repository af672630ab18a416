use std::collections::HashMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;
use tracing::level_filters::LevelFilter;

/// Marker a value-add prints on stdout, followed by a single-line JSON object
/// describing the local server it listens on.
pub const SERVER_PROPERTIES_PREFIX: &str = "Server-Properties:";

/// Well-known peer attribute keys, shared with the host.
pub const ATTR_ID: &str = "ID";
pub const ATTR_NAME: &str = "Name";
pub const ATTR_TRANSPORT_NAME: &str = "TransportName";
pub const ATTR_IP_HOST: &str = "Host";
pub const ATTR_IP_PORT: &str = "Port";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[derive(EnumString, AsRefStr, Display)]
#[strum(ascii_case_insensitive)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Critical,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace    => LevelFilter::TRACE,
            LogLevel::Debug    => LevelFilter::DEBUG,
            LogLevel::Info     => LevelFilter::INFO,
            LogLevel::Warn     => LevelFilter::WARN,
            LogLevel::Error    => LevelFilter::ERROR,
            LogLevel::Critical => LevelFilter::ERROR,
        }
    }
}

/// Transports a value-add can expose its server on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[derive(EnumString, AsRefStr, Display)]
#[strum(ascii_case_insensitive)]
pub enum TransportName {
    #[strum(serialize = "TCP")]
    #[serde(rename = "TCP")]
    Tcp,
    #[strum(serialize = "SSL")]
    #[serde(rename = "SSL")]
    Ssl,
    #[strum(serialize = "PIPE")]
    #[serde(rename = "PIPE")]
    Pipe,
    #[strum(serialize = "Loop")]
    #[serde(rename = "Loop")]
    Loop,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PropertiesError {
    #[error("no `{SERVER_PROPERTIES_PREFIX}` line in output")]
    Missing,

    #[error("invalid server properties: {0}")]
    Json(String),

    #[error("server properties lack `{0}`")]
    MissingAttribute(&'static str),
}

/// The attributes a value-add announces once its local server is up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
pub struct ServerProperties {
    /// All announced attributes, e.g. `TransportName`, `Port`.
    pub attributes: HashMap<String, String>,
}

impl ServerProperties {
    pub fn new(transport: TransportName, port: u16) -> Self {
        let mut attributes = HashMap::new();
        attributes.insert(ATTR_TRANSPORT_NAME.to_string(), transport.to_string());
        attributes.insert(ATTR_IP_PORT.to_string(), port.to_string());
        Self { attributes }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn transport_name(&self) -> Option<&str> {
        self.attributes.get(ATTR_TRANSPORT_NAME).map(String::as_str)
    }

    pub fn port(&self) -> Option<&str> {
        self.attributes.get(ATTR_IP_PORT).map(String::as_str)
    }

    /// The single line written to stdout.
    pub fn to_line(&self) -> String {
        // a HashMap<String, String> always serializes
        let json = serde_json::to_string(&self.attributes).unwrap_or_else(|_| "{}".into());
        format!("{SERVER_PROPERTIES_PREFIX} {json}")
    }

    /// Returns true once `output` contains the announcement marker.
    pub fn is_announced(output: &str) -> bool {
        output.contains(SERVER_PROPERTIES_PREFIX)
    }

    /// Extract the announcement from the captured stdout of a value-add.
    ///
    /// Anything before the marker is ignored, and only the first line after
    /// it is parsed.
    pub fn parse_output(output: &str) -> Result<Self, PropertiesError> {
        let start = output.find(SERVER_PROPERTIES_PREFIX).ok_or(PropertiesError::Missing)?;
        let rest = &output[start + SERVER_PROPERTIES_PREFIX.len()..];
        let line = rest.trim_start().lines().next().unwrap_or("").trim();

        let attributes: HashMap<String, String> =
            serde_json::from_str(line).map_err(|e| PropertiesError::Json(e.to_string()))?;
        let props = Self { attributes };

        if props.transport_name().is_none() {
            return Err(PropertiesError::MissingAttribute(ATTR_TRANSPORT_NAME));
        }
        if props.port().is_none() {
            return Err(PropertiesError::MissingAttribute(ATTR_IP_PORT));
        }
        Ok(props)
    }
}
