use super::{RetentionPolicy, StoreError, TimeSeriesStore};
use crate::line_protocol::WriteRecord;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AlterCall {
    pub(crate) name: String,
    pub(crate) duration: String,
    pub(crate) shard_group_duration: String,
}

#[derive(Debug, Default)]
struct Inner {
    writes: Vec<Vec<WriteRecord>>,
    failed_writes: Vec<Vec<WriteRecord>>,
    write_failures: VecDeque<bool>,
    policies: Vec<RetentionPolicy>,
    fail_list: bool,
    fail_alter: bool,
    panic_on_write: bool,
    list_calls: usize,
    alters: Vec<AlterCall>,
}

/// In-memory store double. Clones share state so a test can keep a handle
/// after moving the store into the write stage.
#[derive(Debug, Clone, Default)]
pub(crate) struct RecordingStore {
    inner: Arc<Mutex<Inner>>,
}

impl RecordingStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_policy(name: &str, duration: &str, shard_group_duration: &str) -> Self {
        let store = Self::new();
        store.inner.lock().unwrap().policies.push(RetentionPolicy {
            name: name.to_string(),
            duration: duration.to_string(),
            shard_group_duration: shard_group_duration.to_string(),
            replica_n: Some(1),
            default: true,
        });
        store
    }

    /// Queues the outcome of upcoming writes; `true` fails the write.
    pub(crate) fn script_write_failures(&self, outcomes: &[bool]) {
        self.inner
            .lock()
            .unwrap()
            .write_failures
            .extend(outcomes.iter().copied());
    }

    pub(crate) fn fail_list(&self) {
        self.inner.lock().unwrap().fail_list = true;
    }

    pub(crate) fn fail_alter(&self) {
        self.inner.lock().unwrap().fail_alter = true;
    }

    /// The next write panics instead of returning.
    pub(crate) fn panic_on_write(&self) {
        self.inner.lock().unwrap().panic_on_write = true;
    }

    pub(crate) fn writes(&self) -> Vec<Vec<WriteRecord>> {
        self.inner.lock().unwrap().writes.clone()
    }

    pub(crate) fn failed_writes(&self) -> Vec<Vec<WriteRecord>> {
        self.inner.lock().unwrap().failed_writes.clone()
    }

    pub(crate) fn alters(&self) -> Vec<AlterCall> {
        self.inner.lock().unwrap().alters.clone()
    }

    pub(crate) fn list_calls(&self) -> usize {
        self.inner.lock().unwrap().list_calls
    }

    pub(crate) fn policies(&self) -> Vec<RetentionPolicy> {
        self.inner.lock().unwrap().policies.clone()
    }
}

impl TimeSeriesStore for RecordingStore {
    async fn write_batch(&self, records: &[WriteRecord]) -> Result<(), StoreError> {
        let panic_now = std::mem::take(&mut self.inner.lock().unwrap().panic_on_write);
        if panic_now {
            panic!("scripted write panic");
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.write_failures.pop_front().unwrap_or(false) {
            inner.failed_writes.push(records.to_vec());
            return Err(StoreError::Unavailable("scripted write failure".into()));
        }
        inner.writes.push(records.to_vec());
        Ok(())
    }

    async fn list_retention_policies(&self) -> Result<Vec<RetentionPolicy>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.list_calls += 1;
        if inner.fail_list {
            return Err(StoreError::Unavailable("scripted list failure".into()));
        }
        Ok(inner.policies.clone())
    }

    async fn alter_retention_policy(
        &self,
        name: &str,
        duration: &str,
        shard_group_duration: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.alters.push(AlterCall {
            name: name.to_string(),
            duration: duration.to_string(),
            shard_group_duration: shard_group_duration.to_string(),
        });
        if inner.fail_alter {
            return Err(StoreError::Unavailable("scripted alter failure".into()));
        }
        if let Some(policy) = inner.policies.iter_mut().find(|p| p.name == name) {
            policy.duration = duration.to_string();
            policy.shard_group_duration = shard_group_duration.to_string();
        }
        Ok(())
    }

    fn database(&self) -> &str {
        "ppmp"
    }
}
