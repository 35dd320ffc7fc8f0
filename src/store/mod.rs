//! Backing store abstraction and implementations.
//!
//! The synchronizer is backend-agnostic: it only needs the narrow
//! batch-apply surface plus reads, identity lookups and channel lifecycle.
//! Three implementations exist:
//!
//! - [`sqlite::SqliteChannelStore`]: async SQLite via SQLx
//! - [`file::FileChannelStore`]: one JSON document per channel
//! - [`memory::MemoryChannelStore`]: volatile store and test double

pub mod file;
pub mod memory;
pub mod sqlite;

use crate::config::Config;
use crate::error::StoreError;
use crate::model::{ChannelDetails, ChannelGroup, ChannelId, ChannelSummary, GroupId, UserId};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// How a search term is applied by [`ChannelStore::search`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchType {
    /// Return every channel, up to the limit. The term is ignored.
    All,
    /// Return channels whose name contains the term, case-insensitively.
    Contains,
}

/// Durable channel storage.
///
/// Mutating methods in the batch-apply section operate on single rows and
/// are invoked by the commit cycle; they are not transactional with each
/// other. Lifecycle methods ([`create_channel`](Self::create_channel),
/// [`remove_channel`](Self::remove_channel)) are all-or-nothing.
#[async_trait]
pub trait ChannelStore: Send + Sync {
    // Lifecycle

    /// Create a channel and seed its owner's membership row at
    /// [`OWNER_GROUP`](crate::model::OWNER_GROUP), in one transaction.
    ///
    /// The `id` and `uuid` fields of `details` are ignored; the store
    /// assigns both and returns the new internal id.
    async fn create_channel(&self, details: &ChannelDetails) -> Result<ChannelId, StoreError>;

    /// Remove a channel along with its members, bans, groups and
    /// attributes, in one transaction.
    async fn remove_channel(&self, channel: ChannelId) -> Result<(), StoreError>;

    // Read queries (uncached; see `ChannelIndex` for cached identity lookups)

    async fn channel_details(&self, channel: ChannelId) -> Result<ChannelDetails, StoreError>;
    async fn channel_attributes(
        &self,
        channel: ChannelId,
    ) -> Result<HashMap<String, String>, StoreError>;
    async fn channel_members(
        &self,
        channel: ChannelId,
    ) -> Result<HashMap<UserId, GroupId>, StoreError>;
    async fn channel_bans(&self, channel: ChannelId) -> Result<HashSet<UserId>, StoreError>;
    async fn channel_groups(&self, channel: ChannelId) -> Result<Vec<ChannelGroup>, StoreError>;

    /// Decode the channel's rank-name table, falling back through the
    /// legacy blob format where necessary. Missing blob means no names.
    async fn channel_rank_names(
        &self,
        channel: ChannelId,
    ) -> Result<BTreeMap<u8, String>, StoreError>;

    /// Re-encode and store the channel's rank-name table in the current
    /// blob format.
    async fn set_rank_names(
        &self,
        channel: ChannelId,
        names: &BTreeMap<u8, String>,
    ) -> Result<(), StoreError>;

    // Identity lookups

    async fn lookup_by_id(&self, id: ChannelId) -> Result<Option<ChannelSummary>, StoreError>;
    async fn lookup_by_uuid(&self, uuid: Uuid) -> Result<Option<ChannelSummary>, StoreError>;
    /// Case-insensitive name lookup.
    async fn lookup_by_name(&self, name: &str) -> Result<Option<ChannelSummary>, StoreError>;
    async fn search(
        &self,
        term: &str,
        search: SearchType,
        limit: usize,
    ) -> Result<Vec<ChannelSummary>, StoreError>;

    // Batch-apply surface used by the commit cycle

    async fn insert_member(
        &self,
        channel: ChannelId,
        user: UserId,
        group: GroupId,
    ) -> Result<(), StoreError>;
    async fn update_member(
        &self,
        channel: ChannelId,
        user: UserId,
        group: GroupId,
    ) -> Result<(), StoreError>;
    async fn delete_member(&self, channel: ChannelId, user: UserId) -> Result<(), StoreError>;
    async fn insert_ban(&self, channel: ChannelId, user: UserId) -> Result<(), StoreError>;
    async fn delete_ban(&self, channel: ChannelId, user: UserId) -> Result<(), StoreError>;
    async fn insert_attribute(
        &self,
        channel: ChannelId,
        key: &str,
        value: &str,
    ) -> Result<(), StoreError>;
    async fn update_attribute(
        &self,
        channel: ChannelId,
        key: &str,
        value: &str,
    ) -> Result<(), StoreError>;
    async fn delete_attribute(&self, channel: ChannelId, key: &str) -> Result<(), StoreError>;
    async fn update_group(&self, group: &ChannelGroup) -> Result<(), StoreError>;
    async fn update_details(&self, details: &ChannelDetails) -> Result<(), StoreError>;

    // Group table management is not wired up in any backend yet. The
    // explicit Unsupported result lets callers distinguish "not
    // implemented" from "successfully did nothing".

    async fn add_group(
        &self,
        _channel: ChannelId,
        _group: &ChannelGroup,
    ) -> Result<(), StoreError> {
        Err(StoreError::Unsupported("add_group"))
    }

    async fn remove_group(&self, _channel: ChannelId, _group: GroupId) -> Result<(), StoreError> {
        Err(StoreError::Unsupported("remove_group"))
    }

    /// Write out any state buffered inside the backend itself. Called at
    /// the end of every commit cycle.
    async fn flush(&self) -> Result<(), StoreError>;
}

/// Open the backing store selected by the configuration.
pub async fn open_store(config: &Config) -> Result<Arc<dyn ChannelStore>, StoreError> {
    use crate::config::StorageConfig;

    match &config.storage {
        StorageConfig::Sqlite { path } => {
            Ok(Arc::new(sqlite::SqliteChannelStore::connect(path).await?))
        }
        StorageConfig::File { directory } => Ok(Arc::new(file::FileChannelStore::open(
            directory,
            Duration::from_secs(config.cache.document_idle_secs),
        )?)),
        StorageConfig::Memory => Ok(Arc::new(memory::MemoryChannelStore::new())),
    }
}
