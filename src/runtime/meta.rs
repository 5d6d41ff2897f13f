//! Ambient per-invocation step metadata.
//!
//! The invoker installs a fresh slot around each step invocation via a task
//! local, so concurrent invocations never see each other's writes. User code
//! records scratch data through the free functions below; the framework
//! section (attempt, status, duration) is stamped by the runtime and the
//! whole snapshot is attached to the invocation's terminal event.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};

tokio::task_local! {
    pub(crate) static CURRENT_STEP_META: Arc<Mutex<StepMeta>>;
}

/// Terminal status of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Error,
}

/// Framework-owned section of the step meta.
#[derive(Debug, Clone)]
pub struct FrameworkMeta {
    /// Attempt number, starting at 1; bumped by the retry middleware.
    pub attempt: u32,
    pub status: Option<StepStatus>,
    pub duration_s: f64,
}

impl Default for FrameworkMeta {
    fn default() -> Self {
        Self {
            attempt: 1,
            status: None,
            duration_s: 0.0,
        }
    }
}

/// Per-invocation scratch map plus the framework section.
#[derive(Debug, Clone, Default)]
pub struct StepMeta {
    data: BTreeMap<String, Value>,
    metrics: BTreeMap<String, Vec<Value>>,
    counters: BTreeMap<String, i64>,
    tags: Vec<String>,
    pub(crate) framework: FrameworkMeta,
}

impl StepMeta {
    /// Set a key in the `data` section.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    /// Append a sample to the named metric series.
    pub fn record_metric(&mut self, name: impl Into<String>, value: Value) {
        self.metrics.entry(name.into()).or_default().push(value);
    }

    /// Add `n` to the named counter.
    pub fn increment(&mut self, name: impl Into<String>, n: i64) {
        *self.counters.entry(name.into()).or_insert(0) += n;
    }

    /// Attach a tag.
    pub fn tag(&mut self, tag: impl Into<String>) {
        self.tags.push(tag.into());
    }

    /// Snapshot as a JSON object. User sections appear only when non-empty;
    /// the framework section is always present.
    pub fn snapshot(&self) -> Value {
        let mut out = serde_json::Map::new();
        if !self.data.is_empty() {
            out.insert("data".to_string(), json!(self.data));
        }
        if !self.metrics.is_empty() {
            out.insert("metrics".to_string(), json!(self.metrics));
        }
        if !self.counters.is_empty() {
            out.insert("counters".to_string(), json!(self.counters));
        }
        if !self.tags.is_empty() {
            out.insert("tags".to_string(), json!(self.tags));
        }
        out.insert(
            "framework".to_string(),
            json!({
                "attempt": self.framework.attempt,
                "status": self.framework.status,
                "duration_s": self.framework.duration_s,
            }),
        );
        Value::Object(out)
    }
}

/// Run `f` against the current invocation's meta slot, if one is installed.
pub(crate) fn with_current<R>(f: impl FnOnce(&mut StepMeta) -> R) -> Option<R> {
    CURRENT_STEP_META.try_with(|slot| f(&mut slot.lock())).ok()
}

/// Bump the framework attempt counter (retry middleware only).
pub(crate) fn bump_attempt() {
    with_current(|meta| meta.framework.attempt += 1);
}

/// Set a key in the current invocation's `data` section.
///
/// No-op outside a step invocation.
pub fn set(key: &str, value: Value) {
    with_current(|meta| meta.set(key, value));
}

/// Append a sample to a metric series of the current invocation.
pub fn record_metric(name: &str, value: Value) {
    with_current(|meta| meta.record_metric(name, value));
}

/// Add `n` to a counter of the current invocation.
pub fn increment(name: &str, n: i64) {
    with_current(|meta| meta.increment(name, n));
}

/// Attach a tag to the current invocation.
pub fn tag(tag: &str) {
    with_current(|meta| meta.tag(tag));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_framework_only_when_no_user_meta() {
        let meta = StepMeta::default();
        let snap = meta.snapshot();
        assert!(snap.get("data").is_none());
        assert!(snap.get("tags").is_none());
        let framework = snap.get("framework").expect("framework section");
        assert_eq!(framework["attempt"], json!(1));
        assert_eq!(framework["status"], Value::Null);
    }

    #[test]
    fn test_snapshot_with_user_sections() {
        let mut meta = StepMeta::default();
        meta.set("model", json!("small-v2"));
        meta.record_metric("latency", json!(1.5));
        meta.record_metric("latency", json!(2.5));
        meta.increment("processed", 3);
        meta.tag("hot");
        meta.framework.status = Some(StepStatus::Success);

        let snap = meta.snapshot();
        assert_eq!(snap["data"]["model"], json!("small-v2"));
        assert_eq!(snap["metrics"]["latency"], json!([1.5, 2.5]));
        assert_eq!(snap["counters"]["processed"], json!(3));
        assert_eq!(snap["tags"], json!(["hot"]));
        assert_eq!(snap["framework"]["status"], json!("success"));
    }

    #[tokio::test]
    async fn test_ambient_slot_is_scoped() {
        // Outside any scope the accessors are no-ops.
        assert!(with_current(|_| ()).is_none());
        set("ignored", json!(1));

        let slot = Arc::new(Mutex::new(StepMeta::default()));
        CURRENT_STEP_META
            .scope(slot.clone(), async {
                set("model", json!("tiny"));
                increment("seen", 2);
                bump_attempt();
            })
            .await;

        let snap = slot.lock().snapshot();
        assert_eq!(snap["data"]["model"], json!("tiny"));
        assert_eq!(snap["counters"]["seen"], json!(2));
        assert_eq!(snap["framework"]["attempt"], json!(2));
    }

    #[tokio::test]
    async fn test_concurrent_slots_do_not_leak() {
        let a = Arc::new(Mutex::new(StepMeta::default()));
        let b = Arc::new(Mutex::new(StepMeta::default()));

        let ta = tokio::spawn(CURRENT_STEP_META.scope(a.clone(), async {
            set("who", json!("a"));
            tokio::task::yield_now().await;
            increment("n", 1);
        }));
        let tb = tokio::spawn(CURRENT_STEP_META.scope(b.clone(), async {
            set("who", json!("b"));
            tokio::task::yield_now().await;
            increment("n", 10);
        }));
        ta.await.unwrap();
        tb.await.unwrap();

        assert_eq!(a.lock().snapshot()["data"]["who"], json!("a"));
        assert_eq!(b.lock().snapshot()["data"]["who"], json!("b"));
        assert_eq!(a.lock().snapshot()["counters"]["n"], json!(1));
        assert_eq!(b.lock().snapshot()["counters"]["n"], json!(10));
    }
}
