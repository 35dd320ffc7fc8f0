//! `ChannelStore` implementation for the SQLite backend.

use super::SqliteChannelStore;
use crate::codec;
use crate::error::StoreError;
use crate::model::{
    ChannelDetails, ChannelGroup, ChannelId, ChannelSummary, GroupId, GroupType, OWNER_GROUP,
    UserId,
};
use crate::store::{ChannelStore, SearchType};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::warn;
use uuid::Uuid;

type SummaryRow = (i64, String, String, String);

fn summary_from_row((id, uuid, name, alias): SummaryRow) -> Result<ChannelSummary, StoreError> {
    Ok(ChannelSummary {
        id,
        uuid: parse_uuid(&uuid)?,
        name,
        alias,
    })
}

fn parse_uuid(raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw)
        .map_err(|e| StoreError::Document(format!("invalid channel uuid {raw:?}: {e}")))
}

/// Escape LIKE wildcards in a user-supplied search term.
fn escape_like(term: &str) -> String {
    term.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

#[async_trait]
impl ChannelStore for SqliteChannelStore {
    async fn create_channel(&self, details: &ChannelDetails) -> Result<ChannelId, StoreError> {
        let uuid = Uuid::new_v4();
        let now = chrono::Utc::now().timestamp();

        // Either both inserts succeed or neither does.
        let mut tx = self.pool().begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO channels (uuid, name, alias, description, owner, track_messages, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(uuid.to_string())
        .bind(&details.name)
        .bind(&details.alias)
        .bind(&details.description)
        .bind(details.owner)
        .bind(details.track_messages)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let channel_id = result.last_insert_rowid();

        sqlx::query(
            r#"
            INSERT INTO channel_members (channel_id, user_id, group_id)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(channel_id)
        .bind(details.owner)
        .bind(OWNER_GROUP)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(channel_id)
    }

    async fn remove_channel(&self, channel: ChannelId) -> Result<(), StoreError> {
        // Member, ban, group and attribute rows are deleted via CASCADE.
        let result = sqlx::query("DELETE FROM channels WHERE id = ?")
            .bind(channel)
            .execute(self.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ChannelNotFound(channel));
        }
        Ok(())
    }

    async fn channel_details(&self, channel: ChannelId) -> Result<ChannelDetails, StoreError> {
        let row = sqlx::query_as::<_, (i64, String, String, String, String, i64, bool)>(
            r#"
            SELECT id, uuid, name, alias, description, owner, track_messages
            FROM channels
            WHERE id = ?
            "#,
        )
        .bind(channel)
        .fetch_optional(self.pool())
        .await?;

        let Some((id, uuid, name, alias, description, owner, track_messages)) = row else {
            return Err(StoreError::ChannelNotFound(channel));
        };
        Ok(ChannelDetails {
            id,
            uuid: parse_uuid(&uuid)?,
            name,
            alias,
            description,
            owner,
            track_messages,
        })
    }

    async fn channel_attributes(
        &self,
        channel: ChannelId,
    ) -> Result<HashMap<String, String>, StoreError> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT key, value FROM channel_attributes WHERE channel_id = ?",
        )
        .bind(channel)
        .fetch_all(self.pool())
        .await?;

        Ok(rows.into_iter().collect())
    }

    async fn channel_members(
        &self,
        channel: ChannelId,
    ) -> Result<HashMap<UserId, GroupId>, StoreError> {
        let rows = sqlx::query_as::<_, (i64, i64)>(
            "SELECT user_id, group_id FROM channel_members WHERE channel_id = ?",
        )
        .bind(channel)
        .fetch_all(self.pool())
        .await?;

        Ok(rows.into_iter().collect())
    }

    async fn channel_bans(&self, channel: ChannelId) -> Result<HashSet<UserId>, StoreError> {
        let rows = sqlx::query_as::<_, (i64,)>(
            "SELECT user_id FROM channel_bans WHERE channel_id = ?",
        )
        .bind(channel)
        .fetch_all(self.pool())
        .await?;

        Ok(rows.into_iter().map(|(user,)| user).collect())
    }

    async fn channel_groups(&self, channel: ChannelId) -> Result<Vec<ChannelGroup>, StoreError> {
        let rows = sqlx::query_as::<_, (i64, String, Vec<u8>, String, Option<String>, Option<i64>)>(
            r#"
            SELECT group_id, name, permissions, group_type, icon, overrides
            FROM channel_groups
            WHERE channel_id = ?
            ORDER BY group_id ASC
            "#,
        )
        .bind(channel)
        .fetch_all(self.pool())
        .await?;

        let mut groups = Vec::with_capacity(rows.len());
        for (group, name, permissions, group_type, icon_url, overrides) in rows {
            let permissions = if permissions.is_empty() {
                Vec::new()
            } else {
                codec::decode_permissions(&permissions)?
            };
            let group_type = GroupType::from_name(&group_type).unwrap_or_else(|| {
                warn!(channel, group, group_type = %group_type, "unknown group type, treating as normal");
                GroupType::Normal
            });
            groups.push(ChannelGroup {
                channel,
                group,
                name,
                permissions,
                group_type,
                icon_url,
                overrides,
            });
        }
        Ok(groups)
    }

    async fn channel_rank_names(
        &self,
        channel: ChannelId,
    ) -> Result<BTreeMap<u8, String>, StoreError> {
        let row = sqlx::query_as::<_, (Option<Vec<u8>>,)>(
            "SELECT rank_names FROM channels WHERE id = ?",
        )
        .bind(channel)
        .fetch_optional(self.pool())
        .await?;

        let Some((blob,)) = row else {
            return Err(StoreError::ChannelNotFound(channel));
        };
        match blob {
            Some(blob) => Ok(codec::decode_rank_names(&blob)?),
            None => Ok(BTreeMap::new()),
        }
    }

    async fn set_rank_names(
        &self,
        channel: ChannelId,
        names: &BTreeMap<u8, String>,
    ) -> Result<(), StoreError> {
        let blob = codec::encode_rank_names(names);
        let result = sqlx::query("UPDATE channels SET rank_names = ? WHERE id = ?")
            .bind(blob)
            .bind(channel)
            .execute(self.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ChannelNotFound(channel));
        }
        Ok(())
    }

    async fn lookup_by_id(&self, id: ChannelId) -> Result<Option<ChannelSummary>, StoreError> {
        let row = sqlx::query_as::<_, SummaryRow>(
            "SELECT id, uuid, name, alias FROM channels WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?;

        row.map(summary_from_row).transpose()
    }

    async fn lookup_by_uuid(&self, uuid: Uuid) -> Result<Option<ChannelSummary>, StoreError> {
        let row = sqlx::query_as::<_, SummaryRow>(
            "SELECT id, uuid, name, alias FROM channels WHERE uuid = ?",
        )
        .bind(uuid.to_string())
        .fetch_optional(self.pool())
        .await?;

        row.map(summary_from_row).transpose()
    }

    async fn lookup_by_name(&self, name: &str) -> Result<Option<ChannelSummary>, StoreError> {
        let row = sqlx::query_as::<_, SummaryRow>(
            "SELECT id, uuid, name, alias FROM channels WHERE name = ? COLLATE NOCASE",
        )
        .bind(name)
        .fetch_optional(self.pool())
        .await?;

        row.map(summary_from_row).transpose()
    }

    async fn search(
        &self,
        term: &str,
        search: SearchType,
        limit: usize,
    ) -> Result<Vec<ChannelSummary>, StoreError> {
        let rows = match search {
            SearchType::All => {
                sqlx::query_as::<_, SummaryRow>(
                    "SELECT id, uuid, name, alias FROM channels ORDER BY name LIMIT ?",
                )
                .bind(limit as i64)
                .fetch_all(self.pool())
                .await?
            }
            SearchType::Contains => {
                let pattern = format!("%{}%", escape_like(term));
                sqlx::query_as::<_, SummaryRow>(
                    r#"
                    SELECT id, uuid, name, alias FROM channels
                    WHERE name LIKE ? ESCAPE '\'
                    ORDER BY name
                    LIMIT ?
                    "#,
                )
                .bind(pattern)
                .bind(limit as i64)
                .fetch_all(self.pool())
                .await?
            }
        };

        rows.into_iter().map(summary_from_row).collect()
    }

    async fn insert_member(
        &self,
        channel: ChannelId,
        user: UserId,
        group: GroupId,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO channel_members (channel_id, user_id, group_id) VALUES (?, ?, ?)",
        )
        .bind(channel)
        .bind(user)
        .bind(group)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn update_member(
        &self,
        channel: ChannelId,
        user: UserId,
        group: GroupId,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE channel_members SET group_id = ? WHERE channel_id = ? AND user_id = ?",
        )
        .bind(group)
        .bind(channel)
        .bind(user)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn delete_member(&self, channel: ChannelId, user: UserId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM channel_members WHERE channel_id = ? AND user_id = ?")
            .bind(channel)
            .bind(user)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn insert_ban(&self, channel: ChannelId, user: UserId) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO channel_bans (channel_id, user_id) VALUES (?, ?)")
            .bind(channel)
            .bind(user)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn delete_ban(&self, channel: ChannelId, user: UserId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM channel_bans WHERE channel_id = ? AND user_id = ?")
            .bind(channel)
            .bind(user)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn insert_attribute(
        &self,
        channel: ChannelId,
        key: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO channel_attributes (channel_id, key, value) VALUES (?, ?, ?)")
            .bind(channel)
            .bind(key)
            .bind(value)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn update_attribute(
        &self,
        channel: ChannelId,
        key: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE channel_attributes SET value = ? WHERE channel_id = ? AND key = ?")
            .bind(value)
            .bind(channel)
            .bind(key)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn delete_attribute(&self, channel: ChannelId, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM channel_attributes WHERE channel_id = ? AND key = ?")
            .bind(channel)
            .bind(key)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn update_group(&self, group: &ChannelGroup) -> Result<(), StoreError> {
        let permissions = codec::encode_permissions(&group.permissions);
        sqlx::query(
            r#"
            UPDATE channel_groups
            SET name = ?, permissions = ?, group_type = ?, icon = ?, overrides = ?
            WHERE channel_id = ? AND group_id = ?
            "#,
        )
        .bind(&group.name)
        .bind(permissions)
        .bind(group.group_type.simple_name())
        .bind(&group.icon_url)
        .bind(group.overrides)
        .bind(group.channel)
        .bind(group.group)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn update_details(&self, details: &ChannelDetails) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE channels
            SET name = ?, alias = ?, description = ?, owner = ?, track_messages = ?
            WHERE id = ?
            "#,
        )
        .bind(&details.name)
        .bind(&details.alias)
        .bind(&details.description)
        .bind(details.owner)
        .bind(details.track_messages)
        .bind(details.id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn flush(&self) -> Result<(), StoreError> {
        // Writes are applied directly; nothing is buffered in this backend.
        Ok(())
    }
}
