//! The seam to the code that renders a parent's derived objects
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use vmop_core::DynamicObject;

/// Error type returned by a [`Materializer`]
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Rebuilds the derived objects (config bundles, workloads) of a parent
///
/// Called once per selecting parent whenever one of its children changes.
/// Implementations must be idempotent: the same parent is often rebuilt
/// several times in a row with no change to its inputs.
#[async_trait]
pub trait Materializer: Send + Sync + 'static {
    /// Rebuild `parent`, whose inputs include `child`
    async fn materialize(&self, parent: &DynamicObject, child: &DynamicObject) -> Result<(), BoxError>;
}

/// A [`Materializer`] that only remembers what it was asked to rebuild
///
/// Calls are recorded as `(parent, child)` pairs of `namespace/name` strings.
#[derive(Default, Debug)]
pub struct RecordingMaterializer {
    calls: Mutex<Vec<(String, String)>>,
    failure: Mutex<Option<String>>,
    parent_failures: Mutex<HashMap<String, String>>,
}

impl RecordingMaterializer {
    /// A materializer that succeeds
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every following call with `message`
    pub fn fail_with(&self, message: impl Into<String>) {
        *self.failure.lock() = Some(message.into());
    }

    /// Fail every following call for the parent at `namespace/name` with `message`
    pub fn fail_parent(&self, parent: impl Into<String>, message: impl Into<String>) {
        self.parent_failures.lock().insert(parent.into(), message.into());
    }

    /// Every call made so far, oldest first
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().clone()
    }

    /// Number of calls made so far
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

fn coordinates(obj: &DynamicObject) -> String {
    format!("{}/{}", obj.namespace_any(), obj.name_any())
}

#[async_trait]
impl Materializer for RecordingMaterializer {
    async fn materialize(&self, parent: &DynamicObject, child: &DynamicObject) -> Result<(), BoxError> {
        let parent = coordinates(parent);
        let failure = self
            .failure
            .lock()
            .clone()
            .or_else(|| self.parent_failures.lock().get(&parent).cloned());
        self.calls.lock().push((parent, coordinates(child)));
        match failure {
            Some(message) => Err(message.into()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Materializer, RecordingMaterializer};
    use vmop_core::{gvk::kinds, DynamicObject};

    #[tokio::test]
    async fn records_calls_and_fails_on_request() {
        let materializer = RecordingMaterializer::new();
        let parent = DynamicObject::new("a1", &kinds::VM_ALERT).within("ns1");
        let child = DynamicObject::new("r1", &kinds::VM_RULE).within("ns1");
        materializer.materialize(&parent, &child).await.unwrap();
        materializer.fail_with("configmap too large");
        let err = materializer.materialize(&parent, &child).await.unwrap_err();
        assert_eq!(err.to_string(), "configmap too large");
        assert_eq!(materializer.calls(), vec![
            ("ns1/a1".to_string(), "ns1/r1".to_string()),
            ("ns1/a1".to_string(), "ns1/r1".to_string()),
        ]);
    }

    #[tokio::test]
    async fn parent_failure_only_hits_that_parent() {
        let materializer = RecordingMaterializer::new();
        materializer.fail_parent("ns1/a2", "template error");
        let child = DynamicObject::new("r1", &kinds::VM_RULE).within("ns1");
        let a1 = DynamicObject::new("a1", &kinds::VM_ALERT).within("ns1");
        let a2 = DynamicObject::new("a2", &kinds::VM_ALERT).within("ns1");
        assert!(materializer.materialize(&a1, &child).await.is_ok());
        let err = materializer.materialize(&a2, &child).await.unwrap_err();
        assert_eq!(err.to_string(), "template error");
        assert_eq!(materializer.call_count(), 2);
    }
}
