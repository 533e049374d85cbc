use serde::{Deserialize, Serialize};

use crate::{intent::Intents, shard::ShardInfo};

/// Hello payload data
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// interval in milliseconds the client should heartbeat with
    pub heartbeat_interval: u64,
}

/// Heartbeat payload data, the last sequence number the client received
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Heartbeat(pub Option<u64>);

/// Connection properties reported in identify
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyProperties {
    /// operating system
    pub os: String,
    /// library name
    pub browser: String,
    /// library name
    pub device: String,
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: env!("CARGO_PKG_NAME").to_string(),
            device: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

/// Identify payload data, starts a new session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identify {
    /// authentication token
    pub token: String,
    /// connection properties
    pub properties: IdentifyProperties,
    /// whether this connection supports per-payload compression
    pub compress: bool,
    /// member count threshold above which offline members are not sent
    pub large_threshold: u32,
    /// shard of this connection
    pub shard: ShardInfo,
    /// initial presence
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<PresenceUpdate>,
    /// subscribed intents
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intents: Option<Intents>,
}

/// Resume payload data, reattaches a previous session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resume {
    /// authentication token
    pub token: String,
    /// session to resume
    pub session_id: String,
    /// last sequence number received
    pub seq: u64,
}

/// Invalid session payload data, true if the session may be resumed
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvalidSession(pub bool);

/// Data of the READY dispatch, only the fields the gateway client needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ready {
    /// gateway protocol version
    #[serde(default)]
    pub v: u32,
    /// new session id
    pub session_id: String,
    /// shard the session was opened for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard: Option<ShardInfo>,
    /// url to use when resuming this session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_gateway_url: Option<String>,
}

/// Activity shown in a presence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    /// activity name
    pub name: String,
    /// activity type, 0 playing, 1 streaming, 2 listening, 3 watching, 5 competing
    #[serde(rename = "type")]
    pub kind: u8,
    /// stream url, only for streaming activity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Presence update payload data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    /// unix time in milliseconds the client went idle
    pub since: Option<u64>,
    /// activities
    pub activities: Vec<Activity>,
    /// online, dnd, idle, invisible or offline
    pub status: String,
    /// whether the client is afk
    pub afk: bool,
}

impl PresenceUpdate {
    /// An online presence without activity
    pub fn online() -> Self {
        Self {
            since: None,
            activities: Vec::new(),
            status: "online".to_string(),
            afk: false,
        }
    }
}

/// Voice state update payload data, joins/moves/leaves a voice channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceStateUpdate {
    /// guild id
    pub guild_id: String,
    /// channel to join, none to disconnect
    pub channel_id: Option<String>,
    /// is self muted
    pub self_mute: bool,
    /// is self deafened
    pub self_deaf: bool,
}

/// Request guild members payload data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestGuildMembers {
    /// guild id
    pub guild_id: String,
    /// username prefix to match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    /// max number of members to return, 0 for no limit
    pub limit: u32,
    /// include presences of matched members
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presences: Option<bool>,
    /// members to fetch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_ids: Option<Vec<String>>,
    /// nonce echoed back in the chunk dispatch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}
