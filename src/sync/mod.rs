//! The channel synchronizer: buffered write-behind persistence.
//!
//! Mutation calls from the live channel layer return immediately after
//! queuing an intent; an external scheduler invokes
//! [`commit_changes`](ChannelSynchronizer::commit_changes) periodically to
//! flush the accumulated operations to the backing store. Read queries and
//! channel lifecycle bypass the queues entirely and hit the store
//! directly, so a read never reflects a pending, uncommitted mutation.

mod queues;

pub use queues::{
    AttributeChanges, AttributeKey, BanChanges, ChangeKey, MemberChanges, MemberKey,
};

use crate::error::StoreError;
use crate::model::{
    ChannelDetails, ChannelGroup, ChannelId, DEFAULT_GROUP, GroupId, UserId,
};
use crate::store::ChannelStore;
use queues::{AttributeQueue, BanQueue, DetailQueue, GroupQueue, MemberQueue};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Write-behind synchronization engine over a [`ChannelStore`].
pub struct ChannelSynchronizer {
    store: Arc<dyn ChannelStore>,
    members: MemberQueue,
    bans: BanQueue,
    attributes: AttributeQueue,
    groups: GroupQueue,
    details: DetailQueue,
    /// Serializes commit cycles: a new cycle cannot start while a previous
    /// snapshot is still being drained.
    commit_gate: tokio::sync::Mutex<()>,
}

impl ChannelSynchronizer {
    pub fn new(store: Arc<dyn ChannelStore>) -> Self {
        Self {
            store,
            members: MemberQueue::default(),
            bans: BanQueue::default(),
            attributes: AttributeQueue::default(),
            groups: GroupQueue::default(),
            details: DetailQueue::default(),
            commit_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// The underlying backing store.
    pub fn store(&self) -> &Arc<dyn ChannelStore> {
        &self.store
    }

    /// Whether any mutation is still waiting for the next commit cycle.
    pub fn has_pending_changes(&self) -> bool {
        !(self.members.is_empty()
            && self.bans.is_empty()
            && self.attributes.is_empty()
            && self.groups.is_empty()
            && self.details.is_empty())
    }

    // Mutation intake. Each call only queues an intent and returns
    // immediately; failures during the eventual write are logged by the
    // commit cycle, never surfaced here.

    /// Queue a member addition in the default group.
    pub fn add_member(&self, channel: ChannelId, user: UserId) {
        self.members.add(channel, user);
    }

    /// Queue a member group change.
    pub fn update_member(&self, channel: ChannelId, user: UserId, group: GroupId) {
        self.members.update(channel, user, group);
    }

    /// Queue a member removal.
    pub fn remove_member(&self, channel: ChannelId, user: UserId) {
        self.members.remove(channel, user);
    }

    /// Queue a ban addition.
    pub fn add_ban(&self, channel: ChannelId, user: UserId) {
        self.bans.add(channel, user);
    }

    /// Queue a ban removal.
    pub fn remove_ban(&self, channel: ChannelId, user: UserId) {
        self.bans.remove(channel, user);
    }

    /// Queue an attribute addition. Fails on commit if the attribute
    /// already exists; use [`update_attribute`](Self::update_attribute)
    /// for existing attributes.
    pub fn add_attribute(&self, channel: ChannelId, key: &str, value: &str) {
        self.attributes.add(channel, key, value);
    }

    /// Queue an attribute value change.
    pub fn update_attribute(&self, channel: ChannelId, key: &str, value: &str) {
        self.attributes.update(channel, key, value);
    }

    /// Queue an attribute removal.
    pub fn clear_attribute(&self, channel: ChannelId, key: &str) {
        self.attributes.remove(channel, key);
    }

    /// Queue a group redefinition. A later update for the same group
    /// replaces an earlier queued one.
    pub fn update_group(&self, channel: ChannelId, mut group: ChannelGroup) {
        group.channel = channel;
        self.groups.update(group);
    }

    /// Queue a full detail snapshot for a channel. The latest snapshot
    /// before a commit wins.
    pub fn sync_details(&self, channel: ChannelId, mut details: ChannelDetails) {
        details.id = channel;
        self.details.sync(details);
    }

    // Group table management is unsupported end to end; the store's
    // explicit result is passed through rather than swallowed.

    pub async fn add_group(
        &self,
        channel: ChannelId,
        group: &ChannelGroup,
    ) -> Result<(), StoreError> {
        self.store.add_group(channel, group).await
    }

    pub async fn remove_group(&self, channel: ChannelId, group: GroupId) -> Result<(), StoreError> {
        self.store.remove_group(channel, group).await
    }

    // Read queries. These bypass the pending queues and reflect only what
    // has already been committed; callers needing fresh-after-write
    // semantics must commit first.

    pub async fn channel_details(&self, channel: ChannelId) -> Result<ChannelDetails, StoreError> {
        self.store.channel_details(channel).await
    }

    pub async fn channel_attributes(
        &self,
        channel: ChannelId,
    ) -> Result<HashMap<String, String>, StoreError> {
        self.store.channel_attributes(channel).await
    }

    pub async fn channel_members(
        &self,
        channel: ChannelId,
    ) -> Result<HashMap<UserId, GroupId>, StoreError> {
        self.store.channel_members(channel).await
    }

    pub async fn channel_bans(&self, channel: ChannelId) -> Result<HashSet<UserId>, StoreError> {
        self.store.channel_bans(channel).await
    }

    pub async fn channel_groups(
        &self,
        channel: ChannelId,
    ) -> Result<Vec<ChannelGroup>, StoreError> {
        self.store.channel_groups(channel).await
    }

    pub async fn channel_rank_names(
        &self,
        channel: ChannelId,
    ) -> Result<BTreeMap<u8, String>, StoreError> {
        self.store.channel_rank_names(channel).await
    }

    // Lifecycle. Unlike the queued mutations these are written through
    // immediately and their failures surface to the caller.

    pub async fn create_channel(&self, details: &ChannelDetails) -> Result<ChannelId, StoreError> {
        self.store.create_channel(details).await
    }

    pub async fn remove_channel(&self, channel: ChannelId) -> Result<(), StoreError> {
        self.store.remove_channel(channel).await
    }

    /// Flush all pending mutations to the backing store.
    ///
    /// Safe to call with nothing pending. Every queue is snapshotted and
    /// cleared up front, so after this returns no queue holds any of the
    /// drained operations - including ones whose writes failed. Failed
    /// items are logged and lost; there is no retry path, by design, since
    /// requeueing would reorder writes across cycles.
    ///
    /// Phases run strictly in order: member additions, member updates,
    /// member removals, ban additions, ban removals, group updates, detail
    /// snapshots, then attribute additions, updates and removals.
    /// Reordering these can target rows that do not yet exist in the same
    /// cycle.
    pub async fn commit_changes(&self) {
        let _gate = self.commit_gate.lock().await;

        let members = self.members.drain();
        let bans = self.bans.drain();
        let groups = self.groups.drain();
        let details = self.details.drain();
        let attributes = self.attributes.drain();

        self.commit_member_changes(members).await;
        self.commit_ban_changes(bans).await;
        self.commit_group_changes(groups).await;
        self.commit_detail_changes(details).await;
        self.commit_attribute_changes(attributes).await;

        if let Err(err) = self.store.flush().await {
            error!(error = %err, "failed to flush backing store");
        }
    }

    async fn commit_member_changes(&self, pending: MemberChanges) {
        for key in &pending.additions {
            match self.store.insert_member(key.channel, key.subject, DEFAULT_GROUP).await {
                Ok(()) => {
                    debug!(channel = key.channel, user = key.subject, "member added to backing store");
                }
                Err(err) if err.aborts_phase() => {
                    error!(error = %err, dropped = pending.additions.len(), "aborting member addition phase");
                    break;
                }
                Err(err) => {
                    warn!(channel = key.channel, user = key.subject, error = %err, "failed to commit member addition");
                }
            }
        }

        for (key, group) in &pending.updates {
            match self.store.update_member(key.channel, key.subject, *group).await {
                Ok(()) => {
                    debug!(channel = key.channel, user = key.subject, group, "member updated in backing store");
                }
                Err(err) if err.aborts_phase() => {
                    error!(error = %err, dropped = pending.updates.len(), "aborting member update phase");
                    break;
                }
                Err(err) => {
                    warn!(channel = key.channel, user = key.subject, group, error = %err, "failed to commit member update");
                }
            }
        }

        for key in &pending.removals {
            match self.store.delete_member(key.channel, key.subject).await {
                Ok(()) => {
                    debug!(channel = key.channel, user = key.subject, "member removed from backing store");
                }
                Err(err) if err.aborts_phase() => {
                    error!(error = %err, dropped = pending.removals.len(), "aborting member removal phase");
                    break;
                }
                Err(err) => {
                    warn!(channel = key.channel, user = key.subject, error = %err, "failed to commit member removal");
                }
            }
        }
    }

    async fn commit_ban_changes(&self, pending: BanChanges) {
        for key in &pending.additions {
            match self.store.insert_ban(key.channel, key.subject).await {
                Ok(()) => {
                    debug!(channel = key.channel, user = key.subject, "ban added to backing store");
                }
                Err(err) if err.aborts_phase() => {
                    error!(error = %err, dropped = pending.additions.len(), "aborting ban addition phase");
                    break;
                }
                Err(err) => {
                    warn!(channel = key.channel, user = key.subject, error = %err, "failed to commit ban addition");
                }
            }
        }

        for key in &pending.removals {
            match self.store.delete_ban(key.channel, key.subject).await {
                Ok(()) => {
                    debug!(channel = key.channel, user = key.subject, "ban removed from backing store");
                }
                Err(err) if err.aborts_phase() => {
                    error!(error = %err, dropped = pending.removals.len(), "aborting ban removal phase");
                    break;
                }
                Err(err) => {
                    warn!(channel = key.channel, user = key.subject, error = %err, "failed to commit ban removal");
                }
            }
        }
    }

    async fn commit_group_changes(&self, pending: HashMap<(ChannelId, GroupId), ChannelGroup>) {
        for group in pending.values() {
            match self.store.update_group(group).await {
                Ok(()) => {
                    debug!(channel = group.channel, group = group.group, "group updated in backing store");
                }
                Err(err) if err.aborts_phase() => {
                    error!(error = %err, dropped = pending.len(), "aborting group update phase");
                    break;
                }
                Err(err) => {
                    warn!(channel = group.channel, group = group.group, error = %err, "failed to commit group update");
                }
            }
        }
    }

    async fn commit_detail_changes(&self, pending: HashMap<ChannelId, ChannelDetails>) {
        for details in pending.values() {
            match self.store.update_details(details).await {
                Ok(()) => {
                    debug!(channel = details.id, "channel details updated in backing store");
                }
                Err(err) if err.aborts_phase() => {
                    error!(error = %err, dropped = pending.len(), "aborting detail update phase");
                    break;
                }
                Err(err) => {
                    warn!(channel = details.id, error = %err, "failed to commit detail update");
                }
            }
        }
    }

    async fn commit_attribute_changes(&self, pending: AttributeChanges) {
        for (key, value) in &pending.additions {
            match self.store.insert_attribute(key.channel, &key.subject, value).await {
                Ok(()) => {
                    debug!(channel = key.channel, key = %key.subject, "attribute added to backing store");
                }
                Err(err) if err.aborts_phase() => {
                    error!(error = %err, dropped = pending.additions.len(), "aborting attribute addition phase");
                    break;
                }
                Err(err) => {
                    warn!(channel = key.channel, key = %key.subject, error = %err, "failed to commit attribute addition");
                }
            }
        }

        for (key, value) in &pending.updates {
            match self.store.update_attribute(key.channel, &key.subject, value).await {
                Ok(()) => {
                    debug!(channel = key.channel, key = %key.subject, "attribute updated in backing store");
                }
                Err(err) if err.aborts_phase() => {
                    error!(error = %err, dropped = pending.updates.len(), "aborting attribute update phase");
                    break;
                }
                Err(err) => {
                    warn!(channel = key.channel, key = %key.subject, error = %err, "failed to commit attribute update");
                }
            }
        }

        for key in &pending.removals {
            match self.store.delete_attribute(key.channel, &key.subject).await {
                Ok(()) => {
                    debug!(channel = key.channel, key = %key.subject, "attribute removed from backing store");
                }
                Err(err) if err.aborts_phase() => {
                    error!(error = %err, dropped = pending.removals.len(), "aborting attribute removal phase");
                    break;
                }
                Err(err) => {
                    warn!(channel = key.channel, key = %key.subject, error = %err, "failed to commit attribute removal");
                }
            }
        }
    }

    // Identity lookups pass straight through; see `ChannelIndex` for the
    // cached variants.

    pub async fn lookup_by_id(&self, id: ChannelId) -> Result<Option<crate::model::ChannelSummary>, StoreError> {
        self.store.lookup_by_id(id).await
    }

    pub async fn lookup_by_uuid(&self, uuid: Uuid) -> Result<Option<crate::model::ChannelSummary>, StoreError> {
        self.store.lookup_by_uuid(uuid).await
    }

    pub async fn lookup_by_name(&self, name: &str) -> Result<Option<crate::model::ChannelSummary>, StoreError> {
        self.store.lookup_by_name(name).await
    }
}
