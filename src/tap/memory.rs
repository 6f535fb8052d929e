//! In-memory taps.

use super::{Scheme, SinkMode, Tap, TapError, TapRef, TapResult, TemporaryTapFactory, TupleCollector, TupleIter};
use crate::process::FlowProcess;
use crate::tuple::{Fields, Tuple};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone)]
struct StoredResource {
    tuples: Vec<Tuple>,
    modified: DateTime<Utc>,
}

/// A shared map of identifier to tuples. Cloning shares the storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<HashMap<String, StoredResource>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, StoredResource>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create or overwrite a resource.
    pub fn insert(&self, identifier: &str, tuples: Vec<Tuple>) {
        self.lock().insert(
            identifier.to_string(),
            StoredResource {
                tuples,
                modified: Utc::now(),
            },
        );
    }

    /// Append to a resource, creating it if missing.
    pub fn append(&self, identifier: &str, tuples: Vec<Tuple>) {
        let mut guard = self.lock();
        let entry = guard
            .entry(identifier.to_string())
            .or_insert_with(|| StoredResource {
                tuples: Vec::new(),
                modified: Utc::now(),
            });
        entry.tuples.extend(tuples);
        entry.modified = Utc::now();
    }

    pub fn read(&self, identifier: &str) -> Option<Vec<Tuple>> {
        self.lock().get(identifier).map(|r| r.tuples.clone())
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.lock().contains_key(identifier)
    }

    pub fn remove(&self, identifier: &str) -> bool {
        self.lock().remove(identifier).is_some()
    }

    pub fn modified(&self, identifier: &str) -> Option<DateTime<Utc>> {
        self.lock().get(identifier).map(|r| r.modified)
    }

    pub fn set_modified(&self, identifier: &str, time: DateTime<Utc>) {
        if let Some(resource) = self.lock().get_mut(identifier) {
            resource.modified = time;
        }
    }

    pub fn identifiers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// A shared tap over `identifier` in this store.
    pub fn tap(&self, identifier: &str, scheme: Scheme) -> TapRef {
        Arc::new(MemoryTap::new(self, identifier, scheme))
    }
}

impl TemporaryTapFactory for MemoryStore {
    fn create(&self, identifier: &str, fields: &Fields) -> TapRef {
        Arc::new(
            MemoryTap::new(self, identifier, Scheme::symmetric(fields.clone()))
                .with_sink_mode(SinkMode::Replace)
                .temporary(),
        )
    }
}

/// A tap over one resource of a [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct MemoryTap {
    store: MemoryStore,
    identifier: String,
    scheme: Scheme,
    sink_mode: SinkMode,
    temporary: bool,
}

impl MemoryTap {
    pub fn new(store: &MemoryStore, identifier: impl Into<String>, scheme: Scheme) -> Self {
        Self {
            store: store.clone(),
            identifier: identifier.into(),
            scheme,
            sink_mode: SinkMode::Keep,
            temporary: false,
        }
    }

    pub fn with_sink_mode(mut self, mode: SinkMode) -> Self {
        self.sink_mode = mode;
        self
    }

    pub fn temporary(mut self) -> Self {
        self.temporary = true;
        self
    }
}

impl Tap for MemoryTap {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    fn sink_mode(&self) -> SinkMode {
        self.sink_mode
    }

    fn is_temporary(&self) -> bool {
        self.temporary
    }

    fn open_for_read(&self, _process: &dyn FlowProcess) -> TapResult<TupleIter> {
        let tuples = self
            .store
            .read(&self.identifier)
            .ok_or_else(|| TapError::NotFound(self.identifier.clone()))?;
        Ok(Box::new(tuples.into_iter().map(Ok)))
    }

    fn open_for_write(&self, _process: &dyn FlowProcess) -> TapResult<Box<dyn TupleCollector>> {
        Ok(Box::new(MemoryCollector {
            store: self.store.clone(),
            identifier: self.identifier.clone(),
            buffer: Vec::new(),
            closed: false,
        }))
    }

    fn delete_resource(&self, _process: &dyn FlowProcess) -> TapResult<bool> {
        Ok(self.store.remove(&self.identifier))
    }

    fn resource_exists(&self, _process: &dyn FlowProcess) -> TapResult<bool> {
        Ok(self.store.contains(&self.identifier))
    }

    fn modified_time(&self, _process: &dyn FlowProcess) -> TapResult<Option<DateTime<Utc>>> {
        Ok(self.store.modified(&self.identifier))
    }
}

/// Buffers writes and commits them to the store on close.
struct MemoryCollector {
    store: MemoryStore,
    identifier: String,
    buffer: Vec<Tuple>,
    closed: bool,
}

impl TupleCollector for MemoryCollector {
    fn collect(&mut self, tuple: Tuple) -> TapResult<()> {
        if self.closed {
            return Err(TapError::Closed(self.identifier.clone()));
        }
        self.buffer.push(tuple);
        Ok(())
    }

    fn close(&mut self) -> TapResult<()> {
        if !self.closed {
            self.closed = true;
            self.store
                .append(&self.identifier, std::mem::take(&mut self.buffer));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::MockFlowProcess;
    use crate::tuple;

    #[test]
    fn test_read_missing_resource() {
        let store = MemoryStore::new();
        let tap = MemoryTap::new(&store, "missing", Scheme::default());
        let process = MockFlowProcess::new();
        assert!(matches!(tap.open_for_read(&process), Err(TapError::NotFound(_))));
    }

    #[test]
    fn test_write_commits_on_close() {
        let store = MemoryStore::new();
        let tap = MemoryTap::new(&store, "out", Scheme::default());
        let process = MockFlowProcess::new();

        let mut collector = tap.open_for_write(&process).unwrap();
        collector.collect(tuple!["a"]).unwrap();
        assert!(!store.contains("out"));
        collector.close().unwrap();
        assert_eq!(store.read("out"), Some(vec![tuple!["a"]]));
        assert!(collector.collect(tuple!["b"]).is_err());
    }

    #[test]
    fn test_dropped_collector_discards() {
        let store = MemoryStore::new();
        let tap = MemoryTap::new(&store, "out", Scheme::default());
        let process = MockFlowProcess::new();
        {
            let mut collector = tap.open_for_write(&process).unwrap();
            collector.collect(tuple!["a"]).unwrap();
        }
        assert!(!tap.resource_exists(&process).unwrap());
    }

    #[test]
    fn test_round_trip_and_delete() {
        let store = MemoryStore::new();
        store.insert("in", vec![tuple![1], tuple![2]]);
        let tap = MemoryTap::new(&store, "in", Scheme::default());
        let process = MockFlowProcess::new();

        let read: Vec<Tuple> = tap
            .open_for_read(&process)
            .unwrap()
            .collect::<TapResult<_>>()
            .unwrap();
        assert_eq!(read, vec![tuple![1], tuple![2]]);
        assert!(tap.modified_time(&process).unwrap().is_some());
        assert!(tap.delete_resource(&process).unwrap());
        assert!(!tap.delete_resource(&process).unwrap());
    }

    #[test]
    fn test_temporary_factory() {
        let store = MemoryStore::new();
        let tap = store.create("tmp/a", &Fields::from(["x"]));
        assert!(tap.is_temporary());
        assert_eq!(tap.sink_mode(), SinkMode::Replace);
        assert_eq!(tap.source_fields(), Fields::from(["x"]));
    }
}
