use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Who produced a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuleOwner {
    #[default]
    Client,
    Agent,
}

/// A source-to-destination path mapping.
///
/// `source` is the path as seen by the agent (e.g. in debug info),
/// `destination` the matching path on this host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
pub struct PathMapRule {
    pub source: String,
    pub destination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub shared: bool,
    #[serde(default)]
    pub owner: RuleOwner,
    /// Only applies on this host name, if set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Only applies to contexts matching this query; empty or `*` means all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_query: Option<String>,
}

impl PathMapRule {
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self { source: source.into(), destination: destination.into(), ..Default::default() }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn agent(mut self) -> Self {
        self.owner = RuleOwner::Agent;
        self
    }

    pub fn shared(mut self) -> Self {
        self.shared = true;
        self
    }

    pub fn is_agent(&self) -> bool {
        self.owner == RuleOwner::Agent
    }

    /// Rules are the same mapping when `(source, destination)` match; `id` and
    /// flags do not take part.
    pub fn same_mapping(&self, other: &PathMapRule) -> bool {
        self.source == other.source && self.destination == other.destination
    }

    pub fn is_owned_by(&self, client_id: &str) -> bool {
        self.id.as_deref().is_some_and(|id| id.starts_with(client_id))
    }

    /// True when the rule applies to every context.
    pub fn is_unrestricted(&self) -> bool {
        self.context_query.as_deref().is_none_or(|q| q.is_empty() || q == "*")
    }
}

impl fmt::Display for PathMapRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} => {}", self.source, self.destination)?;
        if let Some(id) = &self.id {
            write!(f, " [{id}]")?;
        }
        if self.is_agent() {
            f.write_str(" (agent)")?;
        }
        if self.shared {
            f.write_str(" (shared)")?;
        }
        Ok(())
    }
}
