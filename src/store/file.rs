//! File-backed channel store.
//!
//! Stores one JSON document per channel (`<id>.json`) under a save
//! directory, plus an `index.json` holding the identity records used for
//! lookups. Mutations edit an in-memory document cache and are written out
//! by `flush` at the end of each commit cycle; the cache drops documents
//! that have not been touched for a configurable idle period so memory
//! stays bounded for channels nobody is using.
//!
//! Binary fields (group permissions, rank names) are stored as base64 of
//! the same versioned encodings the relational backend persists, so the
//! blob format contract holds across backends.

use crate::codec;
use crate::error::StoreError;
use crate::model::{
    ChannelDetails, ChannelGroup, ChannelId, ChannelSummary, GroupId, GroupType, OWNER_GROUP,
    UserId,
};
use crate::store::{ChannelStore, SearchType};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredGroup {
    name: String,
    /// Base64 of the versioned permission-array blob.
    permissions: String,
    group_type: GroupType,
    icon_url: Option<String>,
    overrides: Option<GroupId>,
}

/// On-disk document for one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChannelDocument {
    details: ChannelDetails,
    #[serde(default)]
    attributes: HashMap<String, String>,
    #[serde(default)]
    members: HashMap<UserId, GroupId>,
    #[serde(default)]
    bans: HashSet<UserId>,
    #[serde(default)]
    groups: BTreeMap<GroupId, StoredGroup>,
    /// Base64 of the versioned rank-name blob.
    #[serde(default)]
    rank_names: Option<String>,
}

struct CachedDoc {
    doc: ChannelDocument,
    last_access: Instant,
    dirty: bool,
}

/// Channel store backed by one JSON document per channel.
pub struct FileChannelStore {
    directory: PathBuf,
    idle_expiry: Duration,
    docs: DashMap<ChannelId, CachedDoc>,
    index: RwLock<HashMap<ChannelId, ChannelSummary>>,
    next_id: AtomicI64,
}

impl FileChannelStore {
    /// Open the store rooted at `directory`, creating it if necessary.
    pub fn open(directory: &Path, idle_expiry: Duration) -> Result<Self, StoreError> {
        std::fs::create_dir_all(directory)?;

        let index_path = directory.join("index.json");
        let index: HashMap<ChannelId, ChannelSummary> = if index_path.exists() {
            let raw = std::fs::read(&index_path)?;
            let entries: Vec<ChannelSummary> = serde_json::from_slice(&raw)
                .map_err(|e| StoreError::Document(format!("index.json: {e}")))?;
            entries.into_iter().map(|s| (s.id, s)).collect()
        } else {
            HashMap::new()
        };
        let next_id = index.keys().max().copied().unwrap_or(0) + 1;

        debug!(directory = %directory.display(), channels = index.len(), "file store opened");

        Ok(Self {
            directory: directory.to_path_buf(),
            idle_expiry,
            docs: DashMap::new(),
            index: RwLock::new(index),
            next_id: AtomicI64::new(next_id),
        })
    }

    /// Drop cached documents that have not been accessed within the idle
    /// expiry. Dirty documents are kept until the next flush.
    pub fn prune_idle(&self) -> usize {
        let mut removed = 0;
        self.docs.retain(|_, cached| {
            if !cached.dirty && cached.last_access.elapsed() > self.idle_expiry {
                removed += 1;
                false
            } else {
                true
            }
        });
        if removed > 0 {
            debug!(count = removed, "pruned idle channel documents");
        }
        removed
    }

    fn doc_path(&self, channel: ChannelId) -> PathBuf {
        self.directory.join(format!("{channel}.json"))
    }

    fn load_doc(&self, channel: ChannelId) -> Result<ChannelDocument, StoreError> {
        let path = self.doc_path(channel);
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::ChannelNotFound(channel));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&raw)
            .map_err(|e| StoreError::Document(format!("{}: {e}", path.display())))
    }

    fn write_doc(&self, channel: ChannelId, doc: &ChannelDocument) -> Result<(), StoreError> {
        let raw = serde_json::to_vec_pretty(doc)
            .map_err(|e| StoreError::Document(format!("channel {channel}: {e}")))?;
        let path = self.doc_path(channel);
        let tmp = self.directory.join(format!("{channel}.json.tmp"));
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn write_index(&self) -> Result<(), StoreError> {
        let mut entries: Vec<ChannelSummary> = self.index.read().values().cloned().collect();
        entries.sort_by_key(|s| s.id);
        let raw = serde_json::to_vec_pretty(&entries)
            .map_err(|e| StoreError::Document(format!("index.json: {e}")))?;
        let tmp = self.directory.join("index.json.tmp");
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, self.directory.join("index.json"))?;
        Ok(())
    }

    /// Run a closure against the (possibly cached) document for a channel.
    fn with_doc<R>(
        &self,
        channel: ChannelId,
        f: impl FnOnce(&ChannelDocument) -> R,
    ) -> Result<R, StoreError> {
        match self.docs.entry(channel) {
            Entry::Occupied(mut occupied) => {
                let cached = occupied.get_mut();
                // Lazy idle expiry: a clean entry past its idle deadline is
                // re-read so a long-idle cache cannot serve a stale file.
                if !cached.dirty && cached.last_access.elapsed() > self.idle_expiry {
                    cached.doc = self.load_doc(channel)?;
                }
                cached.last_access = Instant::now();
                Ok(f(&cached.doc))
            }
            Entry::Vacant(vacant) => {
                let doc = self.load_doc(channel)?;
                let cached = vacant.insert(CachedDoc {
                    doc,
                    last_access: Instant::now(),
                    dirty: false,
                });
                Ok(f(&cached.doc))
            }
        }
    }

    /// Like [`with_doc`](Self::with_doc) but marks the document dirty when
    /// the closure succeeds.
    fn with_doc_mut<R>(
        &self,
        channel: ChannelId,
        f: impl FnOnce(&mut ChannelDocument) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        match self.docs.entry(channel) {
            Entry::Occupied(mut occupied) => {
                let cached = occupied.get_mut();
                if !cached.dirty && cached.last_access.elapsed() > self.idle_expiry {
                    cached.doc = self.load_doc(channel)?;
                }
                cached.last_access = Instant::now();
                let result = f(&mut cached.doc)?;
                cached.dirty = true;
                Ok(result)
            }
            Entry::Vacant(vacant) => {
                let mut doc = self.load_doc(channel)?;
                let result = f(&mut doc)?;
                vacant.insert(CachedDoc {
                    doc,
                    last_access: Instant::now(),
                    dirty: true,
                });
                Ok(result)
            }
        }
    }

    fn decode_group(
        channel: ChannelId,
        group: GroupId,
        stored: &StoredGroup,
    ) -> Result<ChannelGroup, StoreError> {
        let blob = BASE64
            .decode(&stored.permissions)
            .map_err(|e| StoreError::Document(format!("group {group} permissions: {e}")))?;
        let permissions = if blob.is_empty() {
            Vec::new()
        } else {
            codec::decode_permissions(&blob)?
        };
        Ok(ChannelGroup {
            channel,
            group,
            name: stored.name.clone(),
            permissions,
            group_type: stored.group_type,
            icon_url: stored.icon_url.clone(),
            overrides: stored.overrides,
        })
    }
}

#[async_trait]
impl ChannelStore for FileChannelStore {
    async fn create_channel(&self, details: &ChannelDetails) -> Result<ChannelId, StoreError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let mut stored = details.clone();
        stored.id = id;
        stored.uuid = Uuid::new_v4();

        let mut doc = ChannelDocument {
            details: stored.clone(),
            attributes: HashMap::new(),
            members: HashMap::new(),
            bans: HashSet::new(),
            groups: BTreeMap::new(),
            rank_names: None,
        };
        doc.members.insert(details.owner, OWNER_GROUP);

        // Document first, index second; a failed index write rolls the
        // document back so the store is left unmodified.
        self.write_doc(id, &doc)?;
        self.index.write().insert(id, ChannelSummary::from(&stored));
        if let Err(err) = self.write_index() {
            self.index.write().remove(&id);
            let _ = std::fs::remove_file(self.doc_path(id));
            return Err(err);
        }

        self.docs.insert(
            id,
            CachedDoc {
                doc,
                last_access: Instant::now(),
                dirty: false,
            },
        );
        Ok(id)
    }

    async fn remove_channel(&self, channel: ChannelId) -> Result<(), StoreError> {
        let removed = self.index.write().remove(&channel);
        let Some(summary) = removed else {
            return Err(StoreError::ChannelNotFound(channel));
        };
        if let Err(err) = self.write_index() {
            self.index.write().insert(channel, summary);
            return Err(err);
        }

        self.docs.remove(&channel);
        match std::fs::remove_file(self.doc_path(channel)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn channel_details(&self, channel: ChannelId) -> Result<ChannelDetails, StoreError> {
        self.with_doc(channel, |doc| doc.details.clone())
    }

    async fn channel_attributes(
        &self,
        channel: ChannelId,
    ) -> Result<HashMap<String, String>, StoreError> {
        self.with_doc(channel, |doc| doc.attributes.clone())
    }

    async fn channel_members(
        &self,
        channel: ChannelId,
    ) -> Result<HashMap<UserId, GroupId>, StoreError> {
        self.with_doc(channel, |doc| doc.members.clone())
    }

    async fn channel_bans(&self, channel: ChannelId) -> Result<HashSet<UserId>, StoreError> {
        self.with_doc(channel, |doc| doc.bans.clone())
    }

    async fn channel_groups(&self, channel: ChannelId) -> Result<Vec<ChannelGroup>, StoreError> {
        let stored = self.with_doc(channel, |doc| doc.groups.clone())?;
        stored
            .iter()
            .map(|(group, sg)| Self::decode_group(channel, *group, sg))
            .collect()
    }

    async fn channel_rank_names(
        &self,
        channel: ChannelId,
    ) -> Result<BTreeMap<u8, String>, StoreError> {
        let encoded = self.with_doc(channel, |doc| doc.rank_names.clone())?;
        match encoded {
            Some(encoded) => {
                let blob = BASE64
                    .decode(&encoded)
                    .map_err(|e| StoreError::Document(format!("rank names: {e}")))?;
                Ok(codec::decode_rank_names(&blob)?)
            }
            None => Ok(BTreeMap::new()),
        }
    }

    async fn set_rank_names(
        &self,
        channel: ChannelId,
        names: &BTreeMap<u8, String>,
    ) -> Result<(), StoreError> {
        self.with_doc_mut(channel, |doc| {
            doc.rank_names = Some(BASE64.encode(codec::encode_rank_names(names)));
            Ok(())
        })
    }

    async fn lookup_by_id(&self, id: ChannelId) -> Result<Option<ChannelSummary>, StoreError> {
        Ok(self.index.read().get(&id).cloned())
    }

    async fn lookup_by_uuid(&self, uuid: Uuid) -> Result<Option<ChannelSummary>, StoreError> {
        Ok(self.index.read().values().find(|s| s.uuid == uuid).cloned())
    }

    async fn lookup_by_name(&self, name: &str) -> Result<Option<ChannelSummary>, StoreError> {
        Ok(self
            .index
            .read()
            .values()
            .find(|s| s.name.eq_ignore_ascii_case(name))
            .cloned())
    }

    async fn search(
        &self,
        term: &str,
        search: SearchType,
        limit: usize,
    ) -> Result<Vec<ChannelSummary>, StoreError> {
        let needle = term.to_lowercase();
        let mut hits: Vec<ChannelSummary> = self
            .index
            .read()
            .values()
            .filter(|s| match search {
                SearchType::All => true,
                SearchType::Contains => s.name.to_lowercase().contains(&needle),
            })
            .cloned()
            .collect();
        hits.sort_by(|a, b| a.name.cmp(&b.name));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn insert_member(
        &self,
        channel: ChannelId,
        user: UserId,
        group: GroupId,
    ) -> Result<(), StoreError> {
        self.with_doc_mut(channel, |doc| {
            if doc.members.contains_key(&user) {
                return Err(StoreError::Constraint(format!(
                    "member row ({channel}, {user}) already exists"
                )));
            }
            doc.members.insert(user, group);
            Ok(())
        })
    }

    async fn update_member(
        &self,
        channel: ChannelId,
        user: UserId,
        group: GroupId,
    ) -> Result<(), StoreError> {
        self.with_doc_mut(channel, |doc| {
            if let Some(slot) = doc.members.get_mut(&user) {
                *slot = group;
            }
            Ok(())
        })
    }

    async fn delete_member(&self, channel: ChannelId, user: UserId) -> Result<(), StoreError> {
        self.with_doc_mut(channel, |doc| {
            doc.members.remove(&user);
            Ok(())
        })
    }

    async fn insert_ban(&self, channel: ChannelId, user: UserId) -> Result<(), StoreError> {
        self.with_doc_mut(channel, |doc| {
            if !doc.bans.insert(user) {
                return Err(StoreError::Constraint(format!(
                    "ban row ({channel}, {user}) already exists"
                )));
            }
            Ok(())
        })
    }

    async fn delete_ban(&self, channel: ChannelId, user: UserId) -> Result<(), StoreError> {
        self.with_doc_mut(channel, |doc| {
            doc.bans.remove(&user);
            Ok(())
        })
    }

    async fn insert_attribute(
        &self,
        channel: ChannelId,
        key: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        self.with_doc_mut(channel, |doc| {
            if doc.attributes.contains_key(key) {
                return Err(StoreError::Constraint(format!(
                    "attribute row ({channel}, {key}) already exists"
                )));
            }
            doc.attributes.insert(key.to_string(), value.to_string());
            Ok(())
        })
    }

    async fn update_attribute(
        &self,
        channel: ChannelId,
        key: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        self.with_doc_mut(channel, |doc| {
            if let Some(slot) = doc.attributes.get_mut(key) {
                *slot = value.to_string();
            }
            Ok(())
        })
    }

    async fn delete_attribute(&self, channel: ChannelId, key: &str) -> Result<(), StoreError> {
        self.with_doc_mut(channel, |doc| {
            doc.attributes.remove(key);
            Ok(())
        })
    }

    async fn update_group(&self, group: &ChannelGroup) -> Result<(), StoreError> {
        self.with_doc_mut(group.channel, |doc| {
            if let Some(stored) = doc.groups.get_mut(&group.group) {
                stored.name = group.name.clone();
                stored.permissions = BASE64.encode(codec::encode_permissions(&group.permissions));
                stored.group_type = group.group_type;
                stored.icon_url = group.icon_url.clone();
                stored.overrides = group.overrides;
            }
            Ok(())
        })
    }

    async fn update_details(&self, details: &ChannelDetails) -> Result<(), StoreError> {
        self.with_doc_mut(details.id, |doc| {
            let uuid = doc.details.uuid;
            doc.details = details.clone();
            doc.details.uuid = uuid; // the stable identifier never changes
            Ok(())
        })?;
        let mut index = self.index.write();
        if let Some(summary) = index.get_mut(&details.id) {
            summary.name = details.name.clone();
            summary.alias = details.alias.clone();
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), StoreError> {
        let mut written = 0usize;
        for mut entry in self.docs.iter_mut() {
            if !entry.dirty {
                continue;
            }
            let channel = *entry.key();
            if let Err(err) = self.write_doc(channel, &entry.doc) {
                warn!(channel, error = %err, "failed to write channel document");
                continue;
            }
            entry.dirty = false;
            written += 1;
        }
        if written > 0 {
            debug!(count = written, "flushed channel documents");
        }
        self.write_index()
    }
}
