//! The seam to the external relational store.
//!
//! The store proper (schema management, POI/MMR, caching) lives outside
//! this engine; handlers mutate entities through this trait and the
//! dispatcher commits once per block.

use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;

/// Errors surfaced by the store layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store backend rejected an operation.
    #[error("Store error: {0}")]
    Backend(String),
}

/// The entity store handed to mapping handlers.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StoreService: Send + Sync {
    /// Reads an entity by type and id.
    async fn get(
        &self,
        entity: &str,
        id: &str,
    ) -> Result<Option<serde_json::Value>, StoreError>;

    /// Creates or replaces an entity.
    async fn set(
        &self,
        entity: &str,
        id: &str,
        value: serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Deletes an entity.
    async fn remove(&self, entity: &str, id: &str) -> Result<(), StoreError>;

    /// Atomically commits every mutation buffered for `height`.
    ///
    /// Heights are committed in strictly ascending order; the dispatcher is
    /// responsible for serializing calls.
    async fn commit_block(&self, height: u64) -> Result<(), StoreError>;

    /// Discards buffered mutations for heights at or above `height`.
    /// Called on rewinds.
    async fn rollback(&self, height: u64) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
struct Mutation {
    entity: String,
    id: String,
    prior: Option<serde_json::Value>,
}

#[derive(Debug, Default)]
struct Journal {
    pending: Vec<Mutation>,
    committed: Vec<(u64, Vec<Mutation>)>,
}

/// An in-memory store with a rollback journal.
///
/// Backs the binary when no relational store is linked, and doubles as the
/// store for tests. Mutations are journaled with their prior values so
/// rewinds can undo whole blocks.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entities: DashMap<(String, String), serde_json::Value>,
    journal: Mutex<Journal>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, entity: &str, id: &str, prior: Option<serde_json::Value>) {
        self.journal.lock().expect("store journal lock poisoned").pending.push(Mutation {
            entity: entity.to_string(),
            id: id.to_string(),
            prior,
        });
    }

    fn undo(&self, mutations: Vec<Mutation>) {
        for mutation in mutations.into_iter().rev() {
            let key = (mutation.entity, mutation.id);
            match mutation.prior {
                Some(value) => {
                    self.entities.insert(key, value);
                }
                None => {
                    self.entities.remove(&key);
                }
            }
        }
    }
}

#[async_trait]
impl StoreService for MemoryStore {
    async fn get(
        &self,
        entity: &str,
        id: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        Ok(self.entities.get(&(entity.to_string(), id.to_string())).map(|v| v.clone()))
    }

    async fn set(
        &self,
        entity: &str,
        id: &str,
        value: serde_json::Value,
    ) -> Result<(), StoreError> {
        let prior = self.entities.insert((entity.to_string(), id.to_string()), value);
        self.record(entity, id, prior);
        Ok(())
    }

    async fn remove(&self, entity: &str, id: &str) -> Result<(), StoreError> {
        let prior = self.entities.remove(&(entity.to_string(), id.to_string())).map(|(_, v)| v);
        self.record(entity, id, prior);
        Ok(())
    }

    async fn commit_block(&self, height: u64) -> Result<(), StoreError> {
        let mut journal = self.journal.lock().expect("store journal lock poisoned");
        let mutations = std::mem::take(&mut journal.pending);
        journal.committed.push((height, mutations));
        Ok(())
    }

    async fn rollback(&self, height: u64) -> Result<(), StoreError> {
        let (undo_blocks, pending) = {
            let mut journal = self.journal.lock().expect("store journal lock poisoned");
            let pending = std::mem::take(&mut journal.pending);
            let mut undo_blocks = Vec::new();
            while journal.committed.last().is_some_and(|(h, _)| *h >= height) {
                undo_blocks.push(journal.committed.pop().expect("checked above"));
            }
            (undo_blocks, pending)
        };

        self.undo(pending);
        for (_, mutations) in undo_blocks {
            self.undo(mutations);
        }
        Ok(())
    }
}
