//! External collaborator boundaries.
//!
//! The content-addressed object store and the timeline reference manager
//! both live outside this crate. Every piece of synchronization logic in
//! `sync` and `mesh` reaches them only through these two capability traits,
//! the same way the reference daemon's sync code is generic over a
//! `Storage` bound rather than owning a concrete database type.

use async_trait::async_trait;
use thiserror::Error;

use crate::hash::Hash;
use crate::model::{Blob, Seal, Tree, TimelineMetadata};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(Hash),
    #[error("timeline not found: {0}")]
    TimelineNotFound(String),
    #[error("timeline already exists: {0}")]
    TimelineExists(String),
    #[error("backend error: {0}")]
    Backend(String),
}

/// The content-addressed object store. All methods are expected to be
/// idempotent: storing the same content-addressed object twice is a no-op,
/// not an error.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn load_seal(&self, hash: &Hash) -> Result<Option<Seal>, StorageError>;
    async fn store_seal(&self, seal: Seal) -> Result<(), StorageError>;

    async fn load_tree(&self, hash: &Hash) -> Result<Option<Tree>, StorageError>;
    async fn store_tree(&self, hash: Hash, tree: Tree) -> Result<(), StorageError>;

    async fn load_blob(&self, hash: &Hash) -> Result<Option<Blob>, StorageError>;
    async fn store_blob(&self, hash: Hash, blob: Blob) -> Result<(), StorageError>;

    async fn has_object(&self, hash: &Hash) -> Result<bool, StorageError>;

    /// List seals known for a timeline, most recent first. Implementations
    /// may cap the count; callers asking for "recent" seals should not
    /// assume more than a reasonable prefix is returned.
    async fn list_seals(&self, timeline: &str, limit: usize) -> Result<Vec<Seal>, StorageError>;
}

/// Timeline reference management. `delete_timeline` exists for the
/// repository-internal "fuse" merge collaborator, not for the sync core,
/// which never deletes timelines on its own.
#[async_trait]
pub trait TimelineManager: Send + Sync {
    async fn current(&self) -> Result<String, StorageError>;
    async fn get_head(&self, timeline: &str) -> Result<Option<Hash>, StorageError>;
    async fn update_head(&self, timeline: &str, head: Hash) -> Result<(), StorageError>;
    async fn delete_timeline(&self, timeline: &str) -> Result<(), StorageError>;
    async fn create(&self, timeline: &str, head: Hash) -> Result<(), StorageError>;
    async fn switch(&self, timeline: &str) -> Result<(), StorageError>;
    async fn list_timelines(&self) -> Result<Vec<String>, StorageError>;
    async fn get_timeline_metadata(
        &self,
        timeline: &str,
    ) -> Result<Option<TimelineMetadata>, StorageError>;
}
