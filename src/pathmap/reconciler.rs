//! Merge the locally configured rules with what the agent reports and push the
//! result back when it changed.

use tracing::{debug, info};

use crate::channel::transport::PathMapService;

use super::{PathMapError, rule::PathMapRule};

/// Merge `client_rules` into `agent_rules`.
///
/// Agent rules whose id starts with `client_id` were pushed by this client
/// earlier and are dropped; they are derived again from `client_rules`. All
/// other agent rules are kept as they are. A client rule is replaced by an
/// agent-tagged rule with the same mapping and is skipped when the merge
/// already holds that mapping. Client rules without an id are stamped with one
/// derived from `client_id`, so the next merge recognizes them.
pub fn reconcile(client_rules: &[PathMapRule], agent_rules: &[PathMapRule], client_id: &str) -> Vec<PathMapRule> {
    let mut merged: Vec<PathMapRule> = Vec::with_capacity(client_rules.len() + agent_rules.len());

    for rule in agent_rules {
        if rule.is_owned_by(client_id) {
            continue;
        }
        if merged.iter().any(|m| m.same_mapping(rule)) {
            continue;
        }
        merged.push(rule.clone());
    }

    for rule in client_rules {
        if rule.is_agent() {
            continue;
        }
        // an agent-tagged rule for the same mapping wins, and it is already in
        // `merged`; so does any other rule kept from the agent
        if merged.iter().any(|m| m.same_mapping(rule)) {
            continue;
        }
        let mut rule = rule.clone();
        if rule.id.is_none() {
            rule.id = Some(client_rule_id(client_id, &rule));
        }
        merged.push(rule);
    }

    debug!(client = client_rules.len(), agent = agent_rules.len(), merged = merged.len(), "path map reconciled");
    merged
}

fn client_rule_id(client_id: &str, rule: &PathMapRule) -> String {
    format!("{client_id}:{}=>{}", rule.source, rule.destination)
}

/// True when `merged` has to be pushed to the agent.
///
/// Sizes are compared, then membership. Duplicates collapse: `[r1, r1]` and
/// `[r1, r2]` count as equal. Reconciled maps never hold duplicates.
pub fn is_different(merged: &[PathMapRule], agent_rules: Option<&[PathMapRule]>) -> bool {
    let agent_rules = agent_rules.unwrap_or_default();
    if merged.len() != agent_rules.len() {
        return true;
    }
    merged.iter().any(|rule| !agent_rules.contains(rule))
}

/// Rules that belong to the agent or to other producers are never sent back.
pub fn strip_for_push(merged: &[PathMapRule]) -> Vec<PathMapRule> {
    merged
        .iter()
        .filter(|r| !r.is_agent() && !r.shared)
        .cloned()
        .collect()
}

/// Push `merged` through `service`. Does nothing for an empty map unless
/// `force_empty_allowed` is set; returns whether a push happened.
pub async fn apply(
    merged: &[PathMapRule],
    service: &dyn PathMapService,
    force_empty_allowed: bool,
) -> Result<bool, PathMapError> {
    if merged.is_empty() && !force_empty_allowed {
        debug!("empty path map, not clearing the agent side");
        return Ok(false);
    }
    let payload = strip_for_push(merged);
    info!(rules = payload.len(), "pushing path map");
    service.set(payload).await.map_err(PathMapError::Set)?;
    Ok(true)
}

/// Fetch, merge, compare, push. Returns the merged map and whether it was pushed.
pub async fn synchronize(
    client_rules: &[PathMapRule],
    client_id: &str,
    service: &dyn PathMapService,
    force_empty_allowed: bool,
) -> Result<(Vec<PathMapRule>, bool), PathMapError> {
    let agent_rules = service.get().await.map_err(PathMapError::Get)?;
    let merged = reconcile(client_rules, agent_rules.as_deref().unwrap_or_default(), client_id);
    if !is_different(&merged, agent_rules.as_deref()) {
        debug!("path map unchanged");
        return Ok((merged, false));
    }
    let pushed = apply(&merged, service, force_empty_allowed).await?;
    Ok((merged, pushed))
}
