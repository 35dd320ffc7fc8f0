//! Core channel data types shared between the synchronizer and the backends.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Internal channel identifier, assigned by the backing store on creation.
/// Only meaningful within a single application instance.
pub type ChannelId = i64;

/// User identifier. User records themselves live outside this crate.
pub type UserId = i64;

/// Channel group (rank) identifier.
pub type GroupId = i64;

/// Group assigned to users who are not on the channel's member list.
pub const GUEST_GROUP: GroupId = 0;

/// Group assigned automatically when a user is added as a member.
pub const DEFAULT_GROUP: GroupId = 1;

/// System group for channel moderators.
pub const MOD_GROUP: GroupId = 5;

/// System group for channel administrators.
pub const ADMIN_GROUP: GroupId = 9;

/// Highest channel-specific group. Held by a single user at a time.
pub const OWNER_GROUP: GroupId = 11;

/// Full details for a channel, as stored in the detail table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDetails {
    /// Internal id. Ignored on `create_channel`; the store assigns one.
    #[serde(default)]
    pub id: ChannelId,
    /// Globally stable identifier, used for external references.
    #[serde(default = "Uuid::new_v4")]
    pub uuid: Uuid,
    pub name: String,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub description: String,
    pub owner: UserId,
    #[serde(default)]
    pub track_messages: bool,
}

/// The identity subset of [`ChannelDetails`] returned by lookup queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub id: ChannelId,
    pub uuid: Uuid,
    pub name: String,
    pub alias: String,
}

impl From<&ChannelDetails> for ChannelSummary {
    fn from(details: &ChannelDetails) -> Self {
        Self {
            id: details.id,
            uuid: details.uuid,
            name: details.name.clone(),
            alias: details.alias.clone(),
        }
    }
}

/// The kind of a channel group.
///
/// `level` orders the kinds by authority; `simple_name` is the form written
/// to the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupType {
    Guest,
    Normal,
    Moderator,
    #[serde(rename = "admin")]
    Administrator,
    Owner,
    System,
}

impl GroupType {
    pub fn simple_name(self) -> &'static str {
        match self {
            GroupType::Guest => "guest",
            GroupType::Normal => "normal",
            GroupType::Moderator => "moderator",
            GroupType::Administrator => "admin",
            GroupType::Owner => "owner",
            GroupType::System => "system",
        }
    }

    pub fn level(self) -> i8 {
        match self {
            GroupType::Guest => -1,
            GroupType::Normal => 0,
            GroupType::Moderator => 1,
            GroupType::Administrator => 2,
            GroupType::Owner => 3,
            GroupType::System => 4,
        }
    }

    /// Resolve a stored name, case-insensitively.
    pub fn from_name(name: &str) -> Option<Self> {
        [
            GroupType::Guest,
            GroupType::Normal,
            GroupType::Moderator,
            GroupType::Administrator,
            GroupType::Owner,
            GroupType::System,
        ]
        .into_iter()
        .find(|t| t.simple_name().eq_ignore_ascii_case(name))
    }
}

impl std::fmt::Display for GroupType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.simple_name())
    }
}

/// A permission a channel group can hold.
///
/// The discriminant doubles as the wire byte in encoded permission arrays,
/// so the values here must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Permission {
    Join = 0,
    Talk = 1,
    Kick = 2,
    TempBan = 3,
    PermBan = 4,
    Reset = 5,
    MemberEdit = 6,
    GroupEdit = 7,
    DetailEdit = 8,
    LockChannel = 9,
    All = 10,
}

impl Permission {
    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Permission::Join),
            1 => Some(Permission::Talk),
            2 => Some(Permission::Kick),
            3 => Some(Permission::TempBan),
            4 => Some(Permission::PermBan),
            5 => Some(Permission::Reset),
            6 => Some(Permission::MemberEdit),
            7 => Some(Permission::GroupEdit),
            8 => Some(Permission::DetailEdit),
            9 => Some(Permission::LockChannel),
            10 => Some(Permission::All),
            _ => None,
        }
    }
}

/// A channel group row: name, permission set, kind and presentation data.
///
/// `permissions` holds raw permission ids rather than [`Permission`] values
/// so that ids written by newer deployments survive a round trip through an
/// older reader. Use [`Permission::from_id`] when interpreting them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelGroup {
    pub channel: ChannelId,
    pub group: GroupId,
    pub name: String,
    pub permissions: Vec<u8>,
    pub group_type: GroupType,
    pub icon_url: Option<String>,
    /// Id of the channel-level default group definition this group overrides,
    /// if any.
    pub overrides: Option<GroupId>,
}
