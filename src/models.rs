use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Every frame kind the chat router understands, in its wire string form.
///
/// The wire format is a `"type"` field carrying the string; routing goes
/// through this enum so the dispatch is exhaustive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Chat,
    Private,
    PrivateFile,
    PrivateAudio,
    GroupCreate,
    GroupMessage,
    GroupFile,
    GroupAudio,
    GroupAddMember,
    GroupRemoveMember,
    GroupUpdateName,
    GroupChangeAdmin,
    GroupDelete,
    RequestPrivateHistory,
    RequestGroupHistory,
    RequestChatHistory,
    FileShare,
    AudioShare,
    ScreenShare,
    VideoInvite,
    VideoInvitePrivate,
    VideoInviteGroup,
    AudioInvite,
    AudioInvitePrivate,
    AudioInviteGroup,
    VideoMissed,
    AudioMissed,
    GetUsers,
    RequestGroups,
    DeleteMessage,
    DeleteUserChat,
    SaveRecentChat,
    Ping,
    Pong,
}

impl MessageKind {
    pub fn from_wire(s: &str) -> Option<MessageKind> {
        use MessageKind::*;
        Some(match s {
            "chat" => Chat,
            "private" => Private,
            "private_file" => PrivateFile,
            "private_audio" => PrivateAudio,
            "group_create" => GroupCreate,
            "group_message" => GroupMessage,
            "group_file" => GroupFile,
            "group_audio" => GroupAudio,
            "group_add_member" => GroupAddMember,
            "group_remove_member" => GroupRemoveMember,
            "group_update_name" => GroupUpdateName,
            "group_change_admin" => GroupChangeAdmin,
            "group_delete" => GroupDelete,
            "request_private_history" => RequestPrivateHistory,
            "request_group_history" => RequestGroupHistory,
            "request_chat_history" => RequestChatHistory,
            "file_share" => FileShare,
            "audio_share" => AudioShare,
            "screen_share" => ScreenShare,
            "video_invite" => VideoInvite,
            "video_invite_private" => VideoInvitePrivate,
            "video_invite_group" => VideoInviteGroup,
            "audio_invite" => AudioInvite,
            "audio_invite_private" => AudioInvitePrivate,
            "audio_invite_group" => AudioInviteGroup,
            "video_missed" => VideoMissed,
            "audio_missed" => AudioMissed,
            "get_users" => GetUsers,
            "request_groups" => RequestGroups,
            "delete_message" => DeleteMessage,
            "delete_user_chat" => DeleteUserChat,
            "save_recent_chat" => SaveRecentChat,
            "ping" => Ping,
            "pong" => Pong,
            _ => return None,
        })
    }
}

/// Names whose first and last character are an underscore mark system
/// identities: connections that may emit events but are invisible to user
/// listings, announcements, and broadcasts.
pub fn is_system_name(name: &str) -> bool {
    name.len() >= 2 && name.starts_with('_') && name.ends_with('_')
}

/// Server-minted timestamp: `YYYY-MM-DD hh:mm AM/PM`.
pub fn timestamp_now() -> String {
    chrono::Local::now().format("%Y-%m-%d %I:%M %p").to_string()
}

/// Monotonic group-id generator. Seeded from the epoch-millisecond clock and
/// advanced by at least one per call, so two creations in the same
/// millisecond still get distinct, increasing ids.
pub fn next_group_id() -> String {
    static LAST: AtomicI64 = AtomicI64::new(0);
    let now = chrono::Utc::now().timestamp_millis();
    let prev = LAST
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
            Some(now.max(prev + 1))
        })
        .unwrap_or(0);
    format!("group_{}", now.max(prev + 1))
}

/// Unordered pair of user names, canonicalized by lexicographic sort.
/// Keys private conversations in memory and on disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairKey {
    a: String,
    b: String,
}

impl PairKey {
    pub fn new(x: &str, y: &str) -> PairKey {
        if x <= y {
            PairKey { a: x.to_string(), b: y.to_string() }
        } else {
            PairKey { a: y.to_string(), b: x.to_string() }
        }
    }

    pub fn users(&self) -> (&str, &str) {
        (&self.a, &self.b)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.a == name || self.b == name
    }

    /// The peer opposite `name`, if `name` is one of the pair.
    pub fn other(&self, name: &str) -> Option<&str> {
        if self.a == name {
            Some(&self.b)
        } else if self.b == name {
            Some(&self.a)
        } else {
            None
        }
    }

    /// On-disk key: a JSON array string (`["alice","bob"]`), immune to
    /// underscores inside names.
    pub fn disk_key(&self) -> String {
        serde_json::to_string(&[&self.a, &self.b])
            .unwrap_or_else(|_| format!("{}_{}", self.a, self.b))
    }

    /// Parse an on-disk key: the JSON-array form, or the legacy
    /// `"alice_bob"` form as a read-compatibility shim.
    pub fn from_disk_key(key: &str) -> Option<PairKey> {
        if key.starts_with('[') {
            let pair: [String; 2] = serde_json::from_str(key).ok()?;
            return Some(PairKey::new(&pair[0], &pair[1]));
        }
        let (x, y) = key.split_once('_')?;
        Some(PairKey::new(x, y))
    }

    /// Resolve a legacy wire key (`"alice_bob"`). Names may themselves
    /// contain underscores, so every split point is tried and the unique one
    /// whose halves are both known users wins; otherwise the first
    /// underscore splits.
    pub fn from_wire_key(key: &str, known_users: &HashSet<String>) -> Option<PairKey> {
        if key.starts_with('[') {
            return PairKey::from_disk_key(key);
        }
        let mut known_match = None;
        let mut matches = 0;
        for (i, _) in key.match_indices('_') {
            let (x, y) = (&key[..i], &key[i + 1..]);
            if x.is_empty() || y.is_empty() {
                continue;
            }
            if known_users.contains(x) && known_users.contains(y) {
                matches += 1;
                known_match = Some(PairKey::new(x, y));
            }
        }
        if matches == 1 {
            return known_match;
        }
        let (x, y) = key.split_once('_')?;
        if x.is_empty() || y.is_empty() {
            return None;
        }
        Some(PairKey::new(x, y))
    }
}

/// Group definition, persisted in `groups.json`. The `admin` field was
/// absent in early data files; `Store::load_all` backfills it from
/// `created_by`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub members: Vec<String>,
    pub created_by: String,
    #[serde(default)]
    pub admin: String,
    pub created_at: String,
}

impl Group {
    pub fn is_member(&self, name: &str) -> bool {
        self.members.iter().any(|m| m == name)
    }

    /// Wire shape for `group_list` payloads.
    pub fn to_wire(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "name": self.name,
            "members": self.members,
            "created_by": self.created_by,
            "admin": self.admin,
        })
    }
}

/// File index entry, persisted in `files.json` (blob bytes stay in memory
/// only). `file_name`/`name` and `size`/`file_size` are duplicated because
/// deployed clients read one or the other.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FileRecord {
    pub file_id: String,
    pub file_name: String,
    pub name: String,
    pub size: u64,
    pub file_size: u64,
    pub sender: String,
    pub timestamp: String,
    #[serde(default = "default_true")]
    pub complete: bool,
}

fn default_true() -> bool {
    true
}

impl FileRecord {
    pub fn new(file_id: String, file_name: String, size: u64, sender: String) -> FileRecord {
        FileRecord {
            file_id,
            name: file_name.clone(),
            file_name,
            file_size: size,
            size,
            sender,
            timestamp: timestamp_now(),
            complete: false,
        }
    }
}

/// User directory entry, persisted in `users.json`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UserRecord {
    pub ip: String,
    pub last_seen: String,
}

/// The scope of a conversation, a call, or a deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Global,
    Private,
    Group,
}

impl Scope {
    pub fn from_wire(s: &str) -> Option<Scope> {
        match s {
            "global" => Some(Scope::Global),
            "private" => Some(Scope::Private),
            "group" => Some(Scope::Group),
            _ => None,
        }
    }
}

/// A live signaling session (room). `chat_id` ties the room back to the chat
/// scope its invite was posted in: `"global"`, a legacy pair key, or a group
/// id.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SessionInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub session_type: String,
    pub name: String,
    pub creator: String,
    pub chat_id: String,
    pub created_at: String,
}
