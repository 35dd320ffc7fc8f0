//! Pending-operation queues, one per mutation family.
//!
//! Each queue owns its containers behind a single mutex and exposes only
//! the coalescing operations, so at most one pending operation can exist
//! for a given key at any instant. The coalescing rules hinge on an
//! asymmetry between the two cancellation directions:
//!
//! - add then remove cancels outright: the row was never durably created,
//!   so nothing needs to be written at all;
//! - update (or plain membership) then remove must still enqueue the
//!   removal, because the row already exists in the backing store;
//! - remove then add folds into an *update* rather than an addition,
//!   because the removal is discarded and the existing durable row merely
//!   needs its value reset.
//!
//! `drain()` snapshots and clears a queue under its lock; the caller (the
//! commit cycle) performs all backing-store I/O outside of it.

use crate::model::{
    ChannelDetails, ChannelGroup, ChannelId, DEFAULT_GROUP, GroupId, UserId,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

/// Composite key identifying one pending operation: a channel plus the
/// subject (user id, attribute key, ...) the operation applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChangeKey<S> {
    pub channel: ChannelId,
    pub subject: S,
}

impl<S> ChangeKey<S> {
    pub fn new(channel: ChannelId, subject: S) -> Self {
        Self { channel, subject }
    }
}

pub type MemberKey = ChangeKey<UserId>;
pub type AttributeKey = ChangeKey<String>;

/// Drained snapshot of the membership queues.
#[derive(Debug, Default)]
pub struct MemberChanges {
    pub additions: HashSet<MemberKey>,
    pub updates: HashMap<MemberKey, GroupId>,
    pub removals: HashSet<MemberKey>,
}

impl MemberChanges {
    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.updates.is_empty() && self.removals.is_empty()
    }
}

/// Pending membership mutations for all channels.
#[derive(Debug, Default)]
pub struct MemberQueue {
    inner: Mutex<MemberChanges>,
}

impl MemberQueue {
    /// Queue a member addition. New members always start in the default
    /// group; a pending removal for the same key is cancelled and folded
    /// into an update back to the default group instead, since the durable
    /// row still exists.
    pub fn add(&self, channel: ChannelId, user: UserId) {
        let key = ChangeKey::new(channel, user);
        let mut state = self.inner.lock();
        if state.additions.contains(&key) {
            return;
        }
        if state.removals.remove(&key) {
            Self::queue_update(&mut state, key, DEFAULT_GROUP);
            return;
        }
        state.additions.insert(key);
    }

    /// Queue a group change for a member. A pending removal takes
    /// precedence; a pending update is replaced.
    pub fn update(&self, channel: ChannelId, user: UserId, group: GroupId) {
        let key = ChangeKey::new(channel, user);
        let mut state = self.inner.lock();
        Self::queue_update(&mut state, key, group);
    }

    fn queue_update(state: &mut MemberChanges, key: MemberKey, group: GroupId) {
        if state.removals.contains(&key) {
            return;
        }
        state.updates.insert(key, group);
    }

    /// Queue a member removal. A pending addition cancels out entirely;
    /// a pending update is dropped and the removal queued in its place.
    pub fn remove(&self, channel: ChannelId, user: UserId) {
        let key = ChangeKey::new(channel, user);
        let mut state = self.inner.lock();
        if state.removals.contains(&key) {
            return;
        }
        if state.additions.remove(&key) {
            return;
        }
        state.updates.remove(&key);
        state.removals.insert(key);
    }

    pub fn drain(&self) -> MemberChanges {
        std::mem::take(&mut *self.inner.lock())
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Drained snapshot of the ban queues.
#[derive(Debug, Default)]
pub struct BanChanges {
    pub additions: HashSet<MemberKey>,
    pub removals: HashSet<MemberKey>,
}

impl BanChanges {
    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.removals.is_empty()
    }
}

/// Pending ban mutations. Bans carry no payload, so the two directions
/// cancel each other symmetrically.
#[derive(Debug, Default)]
pub struct BanQueue {
    inner: Mutex<BanChanges>,
}

impl BanQueue {
    pub fn add(&self, channel: ChannelId, user: UserId) {
        let key = ChangeKey::new(channel, user);
        let mut state = self.inner.lock();
        if state.additions.contains(&key) {
            return;
        }
        if state.removals.remove(&key) {
            return;
        }
        state.additions.insert(key);
    }

    pub fn remove(&self, channel: ChannelId, user: UserId) {
        let key = ChangeKey::new(channel, user);
        let mut state = self.inner.lock();
        if state.removals.contains(&key) {
            return;
        }
        if state.additions.remove(&key) {
            return;
        }
        state.removals.insert(key);
    }

    pub fn drain(&self) -> BanChanges {
        std::mem::take(&mut *self.inner.lock())
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Drained snapshot of the attribute queues.
#[derive(Debug, Default)]
pub struct AttributeChanges {
    pub additions: HashMap<AttributeKey, String>,
    pub updates: HashMap<AttributeKey, String>,
    pub removals: HashSet<AttributeKey>,
}

impl AttributeChanges {
    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.updates.is_empty() && self.removals.is_empty()
    }
}

/// Pending attribute mutations. Same shape as memberships, with the new
/// value taking the place of the default group when a removal is folded
/// into an update.
#[derive(Debug, Default)]
pub struct AttributeQueue {
    inner: Mutex<AttributeChanges>,
}

impl AttributeQueue {
    pub fn add(&self, channel: ChannelId, key: &str, value: &str) {
        let attr_key = ChangeKey::new(channel, key.to_string());
        let mut state = self.inner.lock();
        if state.additions.contains_key(&attr_key) {
            return;
        }
        if state.removals.remove(&attr_key) {
            Self::queue_update(&mut state, attr_key, value.to_string());
            return;
        }
        state.additions.insert(attr_key, value.to_string());
    }

    pub fn update(&self, channel: ChannelId, key: &str, value: &str) {
        let attr_key = ChangeKey::new(channel, key.to_string());
        let mut state = self.inner.lock();
        Self::queue_update(&mut state, attr_key, value.to_string());
    }

    fn queue_update(state: &mut AttributeChanges, key: AttributeKey, value: String) {
        if state.removals.contains(&key) {
            return;
        }
        state.updates.insert(key, value);
    }

    pub fn remove(&self, channel: ChannelId, key: &str) {
        let attr_key = ChangeKey::new(channel, key.to_string());
        let mut state = self.inner.lock();
        if state.removals.contains(&attr_key) {
            return;
        }
        if state.additions.remove(&attr_key).is_some() {
            return;
        }
        state.updates.remove(&attr_key);
        state.removals.insert(attr_key);
    }

    pub fn drain(&self) -> AttributeChanges {
        std::mem::take(&mut *self.inner.lock())
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Pending group redefinitions, deduplicated by group identity. The
/// latest queued update for a group wins; groups are not added or removed
/// through this path.
#[derive(Debug, Default)]
pub struct GroupQueue {
    inner: Mutex<HashMap<(ChannelId, GroupId), ChannelGroup>>,
}

impl GroupQueue {
    pub fn update(&self, group: ChannelGroup) {
        self.inner.lock().insert((group.channel, group.group), group);
    }

    pub fn drain(&self) -> HashMap<(ChannelId, GroupId), ChannelGroup> {
        std::mem::take(&mut *self.inner.lock())
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Pending full detail snapshots, keyed by channel. The latest snapshot
/// before a commit wins; there is no per-field coalescing.
#[derive(Debug, Default)]
pub struct DetailQueue {
    inner: Mutex<HashMap<ChannelId, ChannelDetails>>,
}

impl DetailQueue {
    pub fn sync(&self, details: ChannelDetails) {
        self.inner.lock().insert(details.id, details);
    }

    pub fn drain(&self) -> HashMap<ChannelId, ChannelDetails> {
        std::mem::take(&mut *self.inner.lock())
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MOD_GROUP;

    #[test]
    fn member_add_is_idempotent() {
        let queue = MemberQueue::default();
        queue.add(1, 102);
        queue.add(1, 102);

        let pending = queue.drain();
        assert_eq!(pending.additions.len(), 1);
        assert!(pending.updates.is_empty());
        assert!(pending.removals.is_empty());
    }

    #[test]
    fn member_add_then_remove_cancels_outright() {
        let queue = MemberQueue::default();
        queue.add(1, 102);
        queue.remove(1, 102);

        assert!(queue.is_empty());
    }

    #[test]
    fn member_remove_then_add_folds_into_default_group_update() {
        let queue = MemberQueue::default();
        queue.remove(1, 102);
        queue.add(1, 102);

        let pending = queue.drain();
        assert!(pending.additions.is_empty());
        assert!(pending.removals.is_empty());
        assert_eq!(
            pending.updates.get(&ChangeKey::new(1, 102)),
            Some(&DEFAULT_GROUP)
        );
    }

    #[test]
    fn member_update_after_removal_is_ignored() {
        let queue = MemberQueue::default();
        queue.remove(1, 102);
        queue.update(1, 102, MOD_GROUP);

        let pending = queue.drain();
        assert!(pending.updates.is_empty());
        assert!(pending.removals.contains(&ChangeKey::new(1, 102)));
    }

    #[test]
    fn member_update_then_remove_keeps_the_removal() {
        let queue = MemberQueue::default();
        queue.update(1, 102, MOD_GROUP);
        queue.remove(1, 102);

        let pending = queue.drain();
        assert!(pending.updates.is_empty());
        assert!(pending.removals.contains(&ChangeKey::new(1, 102)));
    }

    #[test]
    fn member_later_update_replaces_earlier() {
        let queue = MemberQueue::default();
        queue.update(1, 102, 3);
        queue.update(1, 102, MOD_GROUP);

        let pending = queue.drain();
        assert_eq!(pending.updates.len(), 1);
        assert_eq!(pending.updates.get(&ChangeKey::new(1, 102)), Some(&MOD_GROUP));
    }

    #[test]
    fn member_update_while_addition_pending_is_queued_alongside() {
        // The addition stays put and the update is queued as well; the
        // commit cycle's add-before-update phase order makes this benign.
        let queue = MemberQueue::default();
        queue.add(1, 102);
        queue.update(1, 102, MOD_GROUP);

        let pending = queue.drain();
        assert!(pending.additions.contains(&ChangeKey::new(1, 102)));
        assert_eq!(pending.updates.get(&ChangeKey::new(1, 102)), Some(&MOD_GROUP));
    }

    #[test]
    fn member_keys_do_not_collide_across_channels() {
        let queue = MemberQueue::default();
        queue.add(1, 102);
        queue.remove(2, 102);

        let pending = queue.drain();
        assert!(pending.additions.contains(&ChangeKey::new(1, 102)));
        assert!(pending.removals.contains(&ChangeKey::new(2, 102)));
    }

    #[test]
    fn ban_add_then_remove_cancels_outright() {
        let queue = BanQueue::default();
        queue.add(7, 55);
        queue.remove(7, 55);

        assert!(queue.is_empty());
    }

    #[test]
    fn ban_remove_then_add_cancels_outright() {
        let queue = BanQueue::default();
        queue.remove(7, 55);
        queue.add(7, 55);

        assert!(queue.is_empty());
    }

    #[test]
    fn ban_add_is_idempotent() {
        let queue = BanQueue::default();
        queue.add(7, 55);
        queue.add(7, 55);

        let pending = queue.drain();
        assert_eq!(pending.additions.len(), 1);
    }

    #[test]
    fn attribute_remove_then_add_folds_into_update_with_new_value() {
        let queue = AttributeQueue::default();
        queue.remove(1, "welcome");
        queue.add(1, "welcome", "hello again");

        let pending = queue.drain();
        assert!(pending.additions.is_empty());
        assert!(pending.removals.is_empty());
        assert_eq!(
            pending.updates.get(&ChangeKey::new(1, "welcome".to_string())).map(String::as_str),
            Some("hello again")
        );
    }

    #[test]
    fn attribute_add_then_remove_cancels_outright() {
        let queue = AttributeQueue::default();
        queue.add(1, "color", "blue");
        queue.remove(1, "color");

        assert!(queue.is_empty());
    }

    #[test]
    fn attribute_add_keeps_first_queued_value() {
        let queue = AttributeQueue::default();
        queue.add(1, "color", "blue");
        queue.add(1, "color", "red");

        let pending = queue.drain();
        assert_eq!(
            pending.additions.get(&ChangeKey::new(1, "color".to_string())).map(String::as_str),
            Some("blue")
        );
    }

    #[test]
    fn group_updates_are_latest_wins() {
        use crate::model::GroupType;

        let queue = GroupQueue::default();
        let mut group = ChannelGroup {
            channel: 1,
            group: 5,
            name: "Mods".into(),
            permissions: vec![0, 1, 2],
            group_type: GroupType::Moderator,
            icon_url: None,
            overrides: None,
        };
        queue.update(group.clone());
        group.name = "Moderators".into();
        queue.update(group.clone());

        let pending = queue.drain();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[&(1, 5)].name, "Moderators");
    }

    #[test]
    fn detail_snapshots_are_latest_wins() {
        let queue = DetailQueue::default();
        let mut details = ChannelDetails {
            id: 3,
            name: "First".into(),
            owner: 1,
            ..Default::default()
        };
        queue.sync(details.clone());
        details.name = "Second".into();
        queue.sync(details);

        let pending = queue.drain();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[&3].name, "Second");
    }

    #[test]
    fn drain_leaves_queues_empty() {
        let queue = MemberQueue::default();
        queue.add(1, 102);
        queue.update(2, 103, MOD_GROUP);
        queue.remove(3, 104);

        let pending = queue.drain();
        assert!(!pending.is_empty());
        assert!(queue.is_empty());
        assert!(queue.drain().is_empty());
    }
}
