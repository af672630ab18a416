use std::{
    any::Any,
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use tokio_util::sync::CancellationToken;

/// Position of a step inside a (possibly nested) step group, e.g.
/// `open/hop-1/launch-va`. Data stored under a child id is visible only to that
/// child; lookups fall back through the parents to the group root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FullQualifiedId {
    segments: Vec<String>,
}

impl FullQualifiedId {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            return None;
        }
        let mut segments = self.segments.clone();
        segments.pop();
        Some(Self { segments })
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn last(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }
}

impl fmt::Display for FullQualifiedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.segments.join("/"))
    }
}

/// A value in the step data container.
#[derive(Clone)]
pub enum DataValue {
    Bool(bool),
    Text(String),
    Number(i64),
    /// Anything else: channels, value-add descriptors, rule lists.
    Object(Arc<dyn Any + Send + Sync>),
}

impl fmt::Debug for DataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataValue::Bool(b) => write!(f, "Bool({b})"),
            DataValue::Text(s) => write!(f, "Text({s:?})"),
            DataValue::Number(n) => write!(f, "Number({n})"),
            DataValue::Object(_) => f.write_str("Object(..)"),
        }
    }
}

/// Shared, mutable state of one step group run.
///
/// Steps keep nothing between runs; whatever one step hands to a later one (or
/// to its own rollback) goes through here. Cloning shares the same container
/// and the same cancellation token.
#[derive(Clone, Default)]
pub struct StepData {
    inner: Arc<Mutex<HashMap<(FullQualifiedId, String), DataValue>>>,
    cancel: CancellationToken,
}

impl fmt::Debug for StepData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<String> = map.keys().map(|(id, k)| format!("{id}:{k}")).collect();
        keys.sort();
        f.debug_struct("StepData").field("keys", &keys).finish()
    }
}

impl StepData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token observed by the engine between steps and by long-waiting steps.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn set(&self, fqid: &FullQualifiedId, key: &str, value: DataValue) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((fqid.clone(), key.to_string()), value);
    }

    pub fn set_bool(&self, fqid: &FullQualifiedId, key: &str, value: bool) {
        self.set(fqid, key, DataValue::Bool(value));
    }

    pub fn set_text(&self, fqid: &FullQualifiedId, key: &str, value: impl Into<String>) {
        self.set(fqid, key, DataValue::Text(value.into()));
    }

    pub fn set_object<T: Any + Send + Sync>(&self, fqid: &FullQualifiedId, key: &str, value: T) {
        self.set(fqid, key, DataValue::Object(Arc::new(value)));
    }

    pub fn remove(&self, fqid: &FullQualifiedId, key: &str) -> Option<DataValue> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(fqid.clone(), key.to_string()))
    }

    /// Look `key` up at `fqid`, then at each parent up to the root.
    pub fn get(&self, fqid: &FullQualifiedId, key: &str) -> Option<DataValue> {
        let map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let mut scope = Some(fqid.clone());
        while let Some(id) = scope {
            if let Some(value) = map.get(&(id.clone(), key.to_string())) {
                return Some(value.clone());
            }
            scope = id.parent();
        }
        None
    }

    pub fn get_bool(&self, fqid: &FullQualifiedId, key: &str) -> bool {
        matches!(self.get(fqid, key), Some(DataValue::Bool(true)))
    }

    pub fn get_text(&self, fqid: &FullQualifiedId, key: &str) -> Option<String> {
        match self.get(fqid, key) {
            Some(DataValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_object<T: Any + Send + Sync + Clone>(&self, fqid: &FullQualifiedId, key: &str) -> Option<T> {
        match self.get(fqid, key) {
            Some(DataValue::Object(obj)) => obj.downcast_ref::<T>().cloned(),
            _ => None,
        }
    }

    pub fn contains(&self, fqid: &FullQualifiedId, key: &str) -> bool {
        self.get(fqid, key).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups_fall_back_to_parent_scopes() {
        let data = StepData::new();
        let root = FullQualifiedId::root();
        let hop = root.child("hop-0");
        let launch = hop.child("launch");

        data.set_text(&root, "log_name", "target");
        data.set_bool(&hop, "flag", true);

        assert_eq!(data.get_text(&launch, "log_name").as_deref(), Some("target"));
        assert!(data.get_bool(&launch, "flag"));
        assert!(!data.get_bool(&root, "flag"));
    }

    #[test]
    fn child_values_shadow_parents() {
        let data = StepData::new();
        let root = FullQualifiedId::root();
        let child = root.child("a");
        data.set_text(&root, "k", "root");
        data.set_text(&child, "k", "child");
        assert_eq!(data.get_text(&child, "k").as_deref(), Some("child"));
        assert_eq!(data.get_text(&root, "k").as_deref(), Some("root"));
    }

    #[test]
    fn objects_downcast_to_their_type() {
        let data = StepData::new();
        let root = FullQualifiedId::root();
        data.set_object(&root, "rules", vec!["a".to_string()]);
        assert_eq!(data.get_object::<Vec<String>>(&root, "rules"), Some(vec!["a".to_string()]));
        assert_eq!(data.get_object::<u32>(&root, "rules"), None);
    }

    #[test]
    fn display_joins_segments() {
        let id = FullQualifiedId::root().child("open").child("hop-1");
        assert_eq!(id.to_string(), "/open/hop-1");
        assert_eq!(id.parent().unwrap().to_string(), "/open");
        assert_eq!(FullQualifiedId::root().parent(), None);
    }
}
