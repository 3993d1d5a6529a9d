// SPDX-License-Identifier: Apache-2.0

//! Checkpoint coordinator.
//!
//! The coordinator is the only component that may retain resume state
//! across runs. Nodes that support checkpointing compute a key from their
//! input coordinates and write opportunistically; on restart they consult
//! the coordinator to resume. Semantics are last-writer-wins per
//! `(pipeline_id, node_id, key)`; no distributed consensus, a single
//! process is assumed.

use crate::error::Error;
use async_trait::async_trait;
use parking_lot::RwLock;
use rill_config::{NodeId, PipelineId};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::time::SystemTime;

/// The key of a checkpoint record within a pipeline.
pub type CheckpointKey = Cow<'static, str>;

/// A stored checkpoint record.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointRecord {
    /// The pipeline this record belongs to.
    pub pipeline_id: PipelineId,
    /// The node this record belongs to.
    pub node_id: NodeId,
    /// The record key, chosen by the node.
    pub key: CheckpointKey,
    /// Structured resume state.
    pub value: Value,
    /// Opaque binary payload, if any.
    pub blob: Option<Vec<u8>>,
    /// When the record was first created.
    pub created_at: SystemTime,
    /// When the record was last updated.
    pub updated_at: SystemTime,
}

/// Pluggable store for checkpoint records.
///
/// Implementations must be safe for single-process concurrent calls.
/// Only the in-memory backend ships with the engine; persistent backends
/// are external collaborators.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Upserts a record by `(pipeline_id, node_id, key)`.
    ///
    /// # Errors
    ///
    /// Returns a [`Error::CheckpointError`] when the store cannot persist
    /// the record.
    async fn save(
        &self,
        pipeline_id: PipelineId,
        node_id: NodeId,
        key: CheckpointKey,
        value: Value,
        blob: Option<Vec<u8>>,
    ) -> Result<(), Error>;

    /// Loads the latest record for `(pipeline_id, node_id, key)`, if any.
    ///
    /// # Errors
    ///
    /// Returns a [`Error::CheckpointError`] when the store cannot be read.
    async fn load(
        &self,
        pipeline_id: &PipelineId,
        node_id: &NodeId,
        key: &CheckpointKey,
    ) -> Result<Option<CheckpointRecord>, Error>;
}

type StoreKey = (PipelineId, NodeId, CheckpointKey);

/// The mandatory process-local checkpoint backend.
///
/// Records live in an ordered map so scans by pipeline and node stay
/// cheap for diagnostics.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    records: RwLock<BTreeMap<StoreKey, CheckpointRecord>>,
}

impl InMemoryCheckpointStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Returns `true` when no records are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(
        &self,
        pipeline_id: PipelineId,
        node_id: NodeId,
        key: CheckpointKey,
        value: Value,
        blob: Option<Vec<u8>>,
    ) -> Result<(), Error> {
        let now = SystemTime::now();
        let mut records = self.records.write();
        let store_key = (pipeline_id.clone(), node_id.clone(), key.clone());
        match records.get_mut(&store_key) {
            Some(existing) => {
                existing.value = value;
                existing.blob = blob;
                existing.updated_at = now;
            }
            None => {
                let _ = records.insert(
                    store_key,
                    CheckpointRecord {
                        pipeline_id,
                        node_id,
                        key,
                        value,
                        blob,
                        created_at: now,
                        updated_at: now,
                    },
                );
            }
        }
        Ok(())
    }

    async fn load(
        &self,
        pipeline_id: &PipelineId,
        node_id: &NodeId,
        key: &CheckpointKey,
    ) -> Result<Option<CheckpointRecord>, Error> {
        let records = self.records.read();
        Ok(records
            .get(&(pipeline_id.clone(), node_id.clone(), key.clone()))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_then_load_roundtrip() {
        let store = InMemoryCheckpointStore::new();
        store
            .save(
                "p".into(),
                "src".into(),
                "offset".into(),
                Value::from(42),
                None,
            )
            .await
            .unwrap();

        let record = store
            .load(&"p".into(), &"src".into(), &"offset".into())
            .await
            .unwrap()
            .expect("record should exist");
        assert_eq!(record.value, Value::from(42));
        assert_eq!(record.created_at, record.updated_at);
    }

    #[tokio::test]
    async fn test_upsert_is_last_writer_wins() {
        let store = InMemoryCheckpointStore::new();
        store
            .save("p".into(), "src".into(), "k".into(), Value::from(1), None)
            .await
            .unwrap();
        store
            .save("p".into(), "src".into(), "k".into(), Value::from(2), None)
            .await
            .unwrap();

        let record = store
            .load(&"p".into(), &"src".into(), &"k".into())
            .await
            .unwrap()
            .expect("record should exist");
        assert_eq!(record.value, Value::from(2));
        assert!(record.updated_at >= record.created_at);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_key_loads_none() {
        let store = InMemoryCheckpointStore::new();
        let record = store
            .load(&"p".into(), &"src".into(), &"nope".into())
            .await
            .unwrap();
        assert!(record.is_none());
    }

    #[tokio::test]
    async fn test_records_are_scoped_by_node() {
        let store = InMemoryCheckpointStore::new();
        store
            .save("p".into(), "a".into(), "k".into(), Value::from("a"), None)
            .await
            .unwrap();
        store
            .save("p".into(), "b".into(), "k".into(), Value::from("b"), None)
            .await
            .unwrap();

        let a = store
            .load(&"p".into(), &"a".into(), &"k".into())
            .await
            .unwrap()
            .expect("record should exist");
        assert_eq!(a.value, Value::from("a"));
        assert_eq!(store.len(), 2);
    }
}
