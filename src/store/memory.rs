//! Volatile in-memory channel store.
//!
//! Doubles as the test backend: every operation is recorded in order so
//! tests can assert on commit-cycle call sequencing, and
//! [`set_fail_connections`](MemoryChannelStore::set_fail_connections)
//! simulates a lost backing-store connection.

use crate::error::StoreError;
use crate::model::{
    ChannelDetails, ChannelGroup, ChannelId, ChannelSummary, GroupId, OWNER_GROUP, UserId,
};
use crate::store::{ChannelStore, SearchType};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use uuid::Uuid;

/// One recorded store operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallEvent {
    pub op: &'static str,
    pub target: String,
}

/// In-memory channel store and test double.
#[derive(Default)]
pub struct MemoryChannelStore {
    details: DashMap<ChannelId, ChannelDetails>,
    attributes: DashMap<ChannelId, HashMap<String, String>>,
    members: DashMap<ChannelId, HashMap<UserId, GroupId>>,
    bans: DashMap<ChannelId, HashSet<UserId>>,
    groups: DashMap<ChannelId, BTreeMap<GroupId, ChannelGroup>>,
    rank_names: DashMap<ChannelId, BTreeMap<u8, String>>,
    next_id: AtomicI64,
    calls: Mutex<Vec<CallEvent>>,
    fail_connections: AtomicBool,
    failing_ops: Mutex<HashSet<&'static str>>,
}

impl MemoryChannelStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            ..Default::default()
        }
    }

    /// When set, every store operation fails with a connection-class error
    /// until cleared.
    pub fn set_fail_connections(&self, fail: bool) {
        self.fail_connections.store(fail, Ordering::SeqCst);
    }

    /// Make one named operation fail with a connection-class error until
    /// [`clear_failing_ops`](Self::clear_failing_ops) is called.
    pub fn fail_op(&self, op: &'static str) {
        self.failing_ops.lock().insert(op);
    }

    pub fn clear_failing_ops(&self) {
        self.failing_ops.lock().clear();
    }

    /// All operations recorded so far, in invocation order.
    pub fn calls(&self) -> Vec<CallEvent> {
        self.calls.lock().clone()
    }

    /// Names of the operations recorded so far, in invocation order.
    pub fn call_ops(&self) -> Vec<&'static str> {
        self.calls.lock().iter().map(|c| c.op).collect()
    }

    /// Number of recorded calls for one operation name.
    pub fn count_op(&self, op: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.op == op).count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Insert a group row directly, bypassing the unsupported `add_group`
    /// path. Group rows are otherwise only ever updated in place.
    pub fn seed_group(&self, group: ChannelGroup) {
        self.groups.entry(group.channel).or_default().insert(group.group, group);
    }

    fn record(&self, op: &'static str, target: String) {
        self.calls.lock().push(CallEvent { op, target });
    }

    /// Record the operation, then fail it if a simulated outage is active.
    /// Failed operations are still recorded, like a driver that logs the
    /// statement it could not run.
    fn touch(&self, op: &'static str, target: String) -> Result<(), StoreError> {
        self.record(op, target);
        self.check_online(op)
    }

    fn check_online(&self, op: &'static str) -> Result<(), StoreError> {
        if self.fail_connections.load(Ordering::SeqCst) || self.failing_ops.lock().contains(op) {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "backing store unreachable",
            )));
        }
        Ok(())
    }

    fn summaries(&self) -> Vec<ChannelSummary> {
        let mut all: Vec<ChannelSummary> =
            self.details.iter().map(|entry| ChannelSummary::from(entry.value())).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}

#[async_trait]
impl ChannelStore for MemoryChannelStore {
    async fn create_channel(&self, details: &ChannelDetails) -> Result<ChannelId, StoreError> {
        self.touch("create_channel", details.name.clone())?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut stored = details.clone();
        stored.id = id;
        stored.uuid = Uuid::new_v4();
        self.details.insert(id, stored);
        self.members
            .entry(id)
            .or_default()
            .insert(details.owner, OWNER_GROUP);
        Ok(id)
    }

    async fn remove_channel(&self, channel: ChannelId) -> Result<(), StoreError> {
        self.touch("remove_channel", channel.to_string())?;

        if self.details.remove(&channel).is_none() {
            return Err(StoreError::ChannelNotFound(channel));
        }
        self.attributes.remove(&channel);
        self.members.remove(&channel);
        self.bans.remove(&channel);
        self.groups.remove(&channel);
        self.rank_names.remove(&channel);
        Ok(())
    }

    async fn channel_details(&self, channel: ChannelId) -> Result<ChannelDetails, StoreError> {
        self.touch("channel_details", channel.to_string())?;
        self.details
            .get(&channel)
            .map(|d| d.clone())
            .ok_or(StoreError::ChannelNotFound(channel))
    }

    async fn channel_attributes(
        &self,
        channel: ChannelId,
    ) -> Result<HashMap<String, String>, StoreError> {
        self.touch("channel_attributes", channel.to_string())?;
        Ok(self.attributes.get(&channel).map(|a| a.clone()).unwrap_or_default())
    }

    async fn channel_members(
        &self,
        channel: ChannelId,
    ) -> Result<HashMap<UserId, GroupId>, StoreError> {
        self.touch("channel_members", channel.to_string())?;
        Ok(self.members.get(&channel).map(|m| m.clone()).unwrap_or_default())
    }

    async fn channel_bans(&self, channel: ChannelId) -> Result<HashSet<UserId>, StoreError> {
        self.touch("channel_bans", channel.to_string())?;
        Ok(self.bans.get(&channel).map(|b| b.clone()).unwrap_or_default())
    }

    async fn channel_groups(&self, channel: ChannelId) -> Result<Vec<ChannelGroup>, StoreError> {
        self.touch("channel_groups", channel.to_string())?;
        Ok(self
            .groups
            .get(&channel)
            .map(|g| g.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn channel_rank_names(
        &self,
        channel: ChannelId,
    ) -> Result<BTreeMap<u8, String>, StoreError> {
        self.touch("channel_rank_names", channel.to_string())?;
        Ok(self.rank_names.get(&channel).map(|n| n.clone()).unwrap_or_default())
    }

    async fn set_rank_names(
        &self,
        channel: ChannelId,
        names: &BTreeMap<u8, String>,
    ) -> Result<(), StoreError> {
        self.touch("set_rank_names", channel.to_string())?;
        if !self.details.contains_key(&channel) {
            return Err(StoreError::ChannelNotFound(channel));
        }
        self.rank_names.insert(channel, names.clone());
        Ok(())
    }

    async fn lookup_by_id(&self, id: ChannelId) -> Result<Option<ChannelSummary>, StoreError> {
        self.touch("lookup_by_id", id.to_string())?;
        Ok(self.details.get(&id).map(|d| ChannelSummary::from(d.value())))
    }

    async fn lookup_by_uuid(&self, uuid: Uuid) -> Result<Option<ChannelSummary>, StoreError> {
        self.touch("lookup_by_uuid", uuid.to_string())?;
        Ok(self
            .details
            .iter()
            .find(|entry| entry.uuid == uuid)
            .map(|entry| ChannelSummary::from(entry.value())))
    }

    async fn lookup_by_name(&self, name: &str) -> Result<Option<ChannelSummary>, StoreError> {
        self.touch("lookup_by_name", name.to_string())?;
        Ok(self
            .details
            .iter()
            .find(|entry| entry.name.eq_ignore_ascii_case(name))
            .map(|entry| ChannelSummary::from(entry.value())))
    }

    async fn search(
        &self,
        term: &str,
        search: SearchType,
        limit: usize,
    ) -> Result<Vec<ChannelSummary>, StoreError> {
        self.touch("search", term.to_string())?;
        let needle = term.to_lowercase();
        Ok(self
            .summaries()
            .into_iter()
            .filter(|s| match search {
                SearchType::All => true,
                SearchType::Contains => s.name.to_lowercase().contains(&needle),
            })
            .take(limit)
            .collect())
    }

    async fn insert_member(
        &self,
        channel: ChannelId,
        user: UserId,
        group: GroupId,
    ) -> Result<(), StoreError> {
        self.touch("insert_member", format!("{channel}:{user}"))?;
        let mut members = self.members.entry(channel).or_default();
        if members.contains_key(&user) {
            return Err(StoreError::Constraint(format!(
                "member row ({channel}, {user}) already exists"
            )));
        }
        members.insert(user, group);
        Ok(())
    }

    async fn update_member(
        &self,
        channel: ChannelId,
        user: UserId,
        group: GroupId,
    ) -> Result<(), StoreError> {
        self.touch("update_member", format!("{channel}:{user}"))?;
        // Updating an absent row affects nothing, like SQL UPDATE.
        if let Some(mut members) = self.members.get_mut(&channel)
            && let Some(slot) = members.get_mut(&user)
        {
            *slot = group;
        }
        Ok(())
    }

    async fn delete_member(&self, channel: ChannelId, user: UserId) -> Result<(), StoreError> {
        self.touch("delete_member", format!("{channel}:{user}"))?;
        if let Some(mut members) = self.members.get_mut(&channel) {
            members.remove(&user);
        }
        Ok(())
    }

    async fn insert_ban(&self, channel: ChannelId, user: UserId) -> Result<(), StoreError> {
        self.touch("insert_ban", format!("{channel}:{user}"))?;
        let mut bans = self.bans.entry(channel).or_default();
        if !bans.insert(user) {
            return Err(StoreError::Constraint(format!(
                "ban row ({channel}, {user}) already exists"
            )));
        }
        Ok(())
    }

    async fn delete_ban(&self, channel: ChannelId, user: UserId) -> Result<(), StoreError> {
        self.touch("delete_ban", format!("{channel}:{user}"))?;
        if let Some(mut bans) = self.bans.get_mut(&channel) {
            bans.remove(&user);
        }
        Ok(())
    }

    async fn insert_attribute(
        &self,
        channel: ChannelId,
        key: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        self.touch("insert_attribute", format!("{channel}:{key}"))?;
        let mut attrs = self.attributes.entry(channel).or_default();
        if attrs.contains_key(key) {
            return Err(StoreError::Constraint(format!(
                "attribute row ({channel}, {key}) already exists"
            )));
        }
        attrs.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn update_attribute(
        &self,
        channel: ChannelId,
        key: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        self.touch("update_attribute", format!("{channel}:{key}"))?;
        if let Some(mut attrs) = self.attributes.get_mut(&channel)
            && let Some(slot) = attrs.get_mut(key)
        {
            *slot = value.to_string();
        }
        Ok(())
    }

    async fn delete_attribute(&self, channel: ChannelId, key: &str) -> Result<(), StoreError> {
        self.touch("delete_attribute", format!("{channel}:{key}"))?;
        if let Some(mut attrs) = self.attributes.get_mut(&channel) {
            attrs.remove(key);
        }
        Ok(())
    }

    async fn update_group(&self, group: &ChannelGroup) -> Result<(), StoreError> {
        self.touch("update_group", format!("{}:{}", group.channel, group.group))?;
        // Updating an absent row affects nothing, like SQL UPDATE.
        if let Some(mut groups) = self.groups.get_mut(&group.channel)
            && let Some(slot) = groups.get_mut(&group.group)
        {
            *slot = group.clone();
        }
        Ok(())
    }

    async fn update_details(&self, details: &ChannelDetails) -> Result<(), StoreError> {
        self.touch("update_details", details.id.to_string())?;
        if let Some(mut stored) = self.details.get_mut(&details.id) {
            let uuid = stored.uuid;
            *stored = details.clone();
            stored.uuid = uuid; // the stable identifier never changes
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), StoreError> {
        self.touch("flush", String::new())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn details(name: &str, owner: UserId) -> ChannelDetails {
        ChannelDetails {
            name: name.to_string(),
            owner,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn records_calls_in_order() {
        let store = MemoryChannelStore::new();
        let id = store.create_channel(&details("Test", 42)).await.unwrap();
        store.insert_ban(id, 55).await.unwrap();
        store.delete_ban(id, 55).await.unwrap();

        assert_eq!(store.call_ops(), vec!["create_channel", "insert_ban", "delete_ban"]);
    }

    #[tokio::test]
    async fn connection_failures_are_phase_aborting() {
        let store = MemoryChannelStore::new();
        store.set_fail_connections(true);
        let err = store.insert_ban(1, 2).await.unwrap_err();
        assert!(err.aborts_phase());

        store.set_fail_connections(false);
        // The failed call was still recorded.
        assert_eq!(store.count_op("insert_ban"), 1);
    }

    #[tokio::test]
    async fn duplicate_inserts_are_constraint_violations() {
        let store = MemoryChannelStore::new();
        let id = store.create_channel(&details("Test", 42)).await.unwrap();

        store.insert_member(id, 7, 1).await.unwrap();
        assert!(matches!(
            store.insert_member(id, 7, 1).await,
            Err(StoreError::Constraint(_))
        ));
    }
}
