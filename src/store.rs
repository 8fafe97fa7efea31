use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::models::{FileRecord, Group, PairKey, UserRecord};

/// Soft-deleted messages keep their slot with this content.
pub const DELETED_PLACEHOLDER: &str = "🚫 This message was deleted";

/// Most recent global records retained in shared memory. The on-disk log is
/// unbounded and owned by the writer task.
const GLOBAL_RETAIN: usize = 1000;

const GLOBAL_FILE: &str = "global_chat.json";
const PRIVATE_FILE: &str = "private_chats.json";
const GROUP_CHATS_FILE: &str = "group_chats.json";
const GROUPS_FILE: &str = "groups.json";
const FILES_FILE: &str = "files.json";
const USERS_FILE: &str = "users.json";

/// Work shipped to the single writer task. `Write` carries a snapshot
/// serialized under the state lock, so the sequence of on-disk documents is
/// monotonic. The global log is special-cased: the writer privately owns the
/// full (unbounded) sequence, shared state only a bounded tail.
enum Job {
    GlobalAppend(Value),
    GlobalSoftDelete {
        needle: String,
        reply: oneshot::Sender<bool>,
    },
    Write {
        file: &'static str,
        contents: String,
    },
}

struct StoreState {
    global_tail: VecDeque<Value>,
    private_chats: HashMap<PairKey, Vec<Value>>,
    group_chats: HashMap<String, Vec<Value>>,
    groups: BTreeMap<String, Group>,
    files: BTreeMap<String, FileRecord>,
    users: HashMap<String, UserRecord>,
}

/// Single-writer persistence for chats, groups, files, and the user
/// directory. One JSON document per collection under the data directory;
/// readers observe a consistent snapshot; disk failures are logged and never
/// fatal.
pub struct Store {
    state: Arc<Mutex<StoreState>>,
    jobs: mpsc::UnboundedSender<Job>,
}

impl Store {
    /// Load everything from `data_dir` (missing files are empty collections)
    /// and spawn the writer task. Called exactly once at startup.
    pub fn open(data_dir: &Path) -> Store {
        std::fs::create_dir_all(data_dir).ok();

        let full_global: Vec<Value> = load_json(&data_dir.join(GLOBAL_FILE)).unwrap_or_default();
        let skip = full_global.len().saturating_sub(GLOBAL_RETAIN);
        let global_tail: VecDeque<Value> = full_global.iter().skip(skip).cloned().collect();

        let raw_private: HashMap<String, Vec<Value>> =
            load_json(&data_dir.join(PRIVATE_FILE)).unwrap_or_default();
        let mut private_chats = HashMap::new();
        for (key, messages) in raw_private {
            match PairKey::from_disk_key(&key) {
                Some(pair) => {
                    private_chats
                        .entry(pair)
                        .or_insert_with(Vec::new)
                        .extend(messages);
                }
                None => eprintln!("⚠️ Skipping unreadable private chat key: {key}"),
            }
        }

        let group_chats: HashMap<String, Vec<Value>> =
            load_json(&data_dir.join(GROUP_CHATS_FILE)).unwrap_or_default();

        let mut groups: BTreeMap<String, Group> =
            load_json(&data_dir.join(GROUPS_FILE)).unwrap_or_default();
        for group in groups.values_mut() {
            // Data written before admins existed has no admin field.
            if group.admin.is_empty() {
                group.admin = group.created_by.clone();
            }
        }

        let files: BTreeMap<String, FileRecord> =
            load_json(&data_dir.join(FILES_FILE)).unwrap_or_default();
        let users: HashMap<String, UserRecord> =
            load_json(&data_dir.join(USERS_FILE)).unwrap_or_default();

        println!(
            "📦 Storage loaded: {} global, {} private chats, {} groups, {} files, {} users",
            full_global.len(),
            private_chats.len(),
            groups.len(),
            files.len(),
            users.len()
        );

        let (jobs, rx) = mpsc::unbounded_channel();
        spawn_writer(data_dir.to_path_buf(), full_global, rx);

        Store {
            state: Arc::new(Mutex::new(StoreState {
                global_tail,
                private_chats,
                group_chats,
                groups,
                files,
                users,
            })),
            jobs,
        }
    }

    // ===== Global chat =====

    pub fn append_global(&self, msg: Value) {
        let mut state = self.lock();
        state.global_tail.push_back(msg.clone());
        while state.global_tail.len() > GLOBAL_RETAIN {
            state.global_tail.pop_front();
        }
        // Enqueued under the lock so the writer sees appends in tail order.
        let _ = self.jobs.send(Job::GlobalAppend(msg));
    }

    pub fn global_tail(&self, limit: usize) -> Vec<Value> {
        let state = self.lock();
        let skip = state.global_tail.len().saturating_sub(limit);
        state.global_tail.iter().skip(skip).cloned().collect()
    }

    /// Soft-delete a global message by id (falling back to timestamp).
    /// The writer task confirms against the full log, which also covers
    /// records older than the in-memory window.
    pub async fn delete_global(&self, needle: &str) -> bool {
        {
            let mut state = self.lock();
            soft_delete_in(state.global_tail.iter_mut(), needle);
        }
        let (reply, rx) = oneshot::channel();
        let _ = self.jobs.send(Job::GlobalSoftDelete {
            needle: needle.to_string(),
            reply,
        });
        rx.await.unwrap_or(false)
    }

    // ===== Private chats =====

    pub fn append_private(&self, u1: &str, u2: &str, msg: Value) {
        let key = PairKey::new(u1, u2);
        let mut state = self.lock();
        state.private_chats.entry(key).or_default().push(msg);
        self.flush_private(&state);
    }

    pub fn private_tail(&self, u1: &str, u2: &str, limit: usize) -> Vec<Value> {
        let key = PairKey::new(u1, u2);
        let state = self.lock();
        match state.private_chats.get(&key) {
            Some(messages) => tail(messages, limit),
            None => Vec::new(),
        }
    }

    /// Every private conversation `user` participates in, sorted for stable
    /// welcome payloads.
    pub fn private_pairs_for(&self, user: &str) -> Vec<PairKey> {
        let state = self.lock();
        let mut pairs: Vec<PairKey> = state
            .private_chats
            .keys()
            .filter(|k| k.contains(user))
            .cloned()
            .collect();
        pairs.sort();
        pairs
    }

    pub fn delete_private_message(&self, key: &PairKey, needle: &str) -> bool {
        let mut state = self.lock();
        let found = match state.private_chats.get_mut(key) {
            Some(messages) => soft_delete_in(messages.iter_mut(), needle),
            None => false,
        };
        if found {
            self.flush_private(&state);
        }
        found
    }

    /// Hard-delete a whole private conversation.
    pub fn delete_private_pair(&self, key: &PairKey) -> bool {
        let mut state = self.lock();
        let removed = state.private_chats.remove(key).is_some();
        if removed {
            self.flush_private(&state);
        }
        removed
    }

    // ===== Group chats =====

    pub fn append_group(&self, group_id: &str, msg: Value) {
        let mut state = self.lock();
        state
            .group_chats
            .entry(group_id.to_string())
            .or_default()
            .push(msg);
        self.flush_group_chats(&state);
    }

    pub fn group_tail(&self, group_id: &str, limit: usize) -> Vec<Value> {
        let state = self.lock();
        match state.group_chats.get(group_id) {
            Some(messages) => tail(messages, limit),
            None => Vec::new(),
        }
    }

    pub fn delete_group_message(&self, group_id: &str, needle: &str) -> bool {
        let mut state = self.lock();
        let found = match state.group_chats.get_mut(group_id) {
            Some(messages) => soft_delete_in(messages.iter_mut(), needle),
            None => false,
        };
        if found {
            self.flush_group_chats(&state);
        }
        found
    }

    // ===== Group definitions =====

    pub fn create_group(&self, group: Group) {
        let mut state = self.lock();
        state.group_chats.entry(group.id.clone()).or_default();
        state.groups.insert(group.id.clone(), group);
        self.flush_groups(&state);
        self.flush_group_chats(&state);
    }

    pub fn get_group(&self, group_id: &str) -> Option<Group> {
        self.lock().groups.get(group_id).cloned()
    }

    pub fn groups_snapshot(&self) -> Vec<Group> {
        self.lock().groups.values().cloned().collect()
    }

    /// Group ids `user` belongs to, for the welcome history payloads.
    pub fn groups_for(&self, user: &str) -> Vec<Group> {
        self.lock()
            .groups
            .values()
            .filter(|g| g.is_member(user))
            .cloned()
            .collect()
    }

    pub fn members_of(&self, group_id: &str) -> Option<Vec<String>> {
        self.lock().groups.get(group_id).map(|g| g.members.clone())
    }

    pub fn add_member(&self, group_id: &str, user: &str) -> Option<Group> {
        self.mutate_group(group_id, |g| {
            if !g.is_member(user) {
                g.members.push(user.to_string());
            }
        })
    }

    pub fn remove_member(&self, group_id: &str, user: &str) -> Option<Group> {
        self.mutate_group(group_id, |g| {
            g.members.retain(|m| m != user);
        })
    }

    pub fn rename_group(&self, group_id: &str, name: &str) -> Option<Group> {
        self.mutate_group(group_id, |g| {
            g.name = name.to_string();
        })
    }

    pub fn set_admin(&self, group_id: &str, user: &str) -> Option<Group> {
        self.mutate_group(group_id, |g| {
            g.admin = user.to_string();
        })
    }

    /// Drop a group and its message log.
    pub fn delete_group(&self, group_id: &str) -> bool {
        let mut state = self.lock();
        let removed = state.groups.remove(group_id).is_some();
        if removed {
            state.group_chats.remove(group_id);
            self.flush_groups(&state);
            self.flush_group_chats(&state);
        }
        removed
    }

    fn mutate_group(&self, group_id: &str, f: impl FnOnce(&mut Group)) -> Option<Group> {
        let mut state = self.lock();
        let group = state.groups.get_mut(group_id)?;
        f(group);
        let updated = group.clone();
        self.flush_groups(&state);
        Some(updated)
    }

    // ===== File index =====

    /// Insert the record and flush the index. The relay calls this before
    /// replying "ready", so every announced id is already on disk.
    pub fn add_file(&self, record: FileRecord) {
        let mut state = self.lock();
        state.files.insert(record.file_id.clone(), record);
        self.flush_files(&state);
    }

    pub fn set_file_complete(&self, file_id: &str, complete: bool) {
        let mut state = self.lock();
        if let Some(record) = state.files.get_mut(file_id) {
            record.complete = complete;
            self.flush_files(&state);
        }
    }

    pub fn get_file(&self, file_id: &str) -> Option<FileRecord> {
        self.lock().files.get(file_id).cloned()
    }

    /// Completed transfers only; incomplete uploads are never announced.
    pub fn files_snapshot(&self) -> Vec<FileRecord> {
        self.lock()
            .files
            .values()
            .filter(|f| f.complete)
            .cloned()
            .collect()
    }

    // ===== User directory =====

    pub fn update_user(&self, name: &str, endpoint: &str) {
        let mut state = self.lock();
        state.users.insert(
            name.to_string(),
            UserRecord {
                ip: endpoint.to_string(),
                last_seen: chrono::Utc::now().to_rfc3339(),
            },
        );
        self.flush_users(&state);
    }

    /// Directory names, used to disambiguate legacy underscore pair keys.
    pub fn known_users(&self) -> HashSet<String> {
        self.lock().users.keys().cloned().collect()
    }

    // ===== Internals =====

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn flush(&self, file: &'static str, contents: String) {
        let _ = self.jobs.send(Job::Write { file, contents });
    }

    fn flush_private(&self, state: &StoreState) {
        let disk: BTreeMap<String, &Vec<Value>> = state
            .private_chats
            .iter()
            .map(|(k, v)| (k.disk_key(), v))
            .collect();
        self.flush(PRIVATE_FILE, to_pretty(&disk));
    }

    fn flush_group_chats(&self, state: &StoreState) {
        self.flush(GROUP_CHATS_FILE, to_pretty(&state.group_chats));
    }

    fn flush_groups(&self, state: &StoreState) {
        self.flush(GROUPS_FILE, to_pretty(&state.groups));
    }

    fn flush_files(&self, state: &StoreState) {
        self.flush(FILES_FILE, to_pretty(&state.files));
    }

    fn flush_users(&self, state: &StoreState) {
        self.flush(USERS_FILE, to_pretty(&state.users));
    }
}

fn spawn_writer(data_dir: PathBuf, mut full_global: Vec<Value>, mut rx: mpsc::UnboundedReceiver<Job>) {
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            match job {
                Job::GlobalAppend(msg) => {
                    full_global.push(msg);
                    write_file(&data_dir, GLOBAL_FILE, to_pretty(&full_global));
                }
                Job::GlobalSoftDelete { needle, reply } => {
                    let found = soft_delete_in(full_global.iter_mut(), &needle);
                    if found {
                        write_file(&data_dir, GLOBAL_FILE, to_pretty(&full_global));
                    }
                    let _ = reply.send(found);
                }
                Job::Write { file, contents } => {
                    write_file(&data_dir, file, contents);
                }
            }
        }
    });
}

fn write_file(data_dir: &Path, file: &str, contents: String) {
    if let Err(e) = std::fs::write(data_dir.join(file), contents) {
        eprintln!("❌ Error saving {file}: {e}");
    }
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    if !path.exists() {
        return None;
    }
    match std::fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                eprintln!("❌ Error loading {}: {e}", path.display());
                None
            }
        },
        Err(e) => {
            eprintln!("❌ Error loading {}: {e}", path.display());
            None
        }
    }
}

fn to_pretty<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
}

fn tail(messages: &[Value], limit: usize) -> Vec<Value> {
    let skip = messages.len().saturating_sub(limit);
    messages[skip..].to_vec()
}

/// Replace the matching message's content with the deletion placeholder and
/// set its `deleted` flag. Matches by `id`, falling back to `timestamp`.
/// Idempotent: a second pass finds the same record and leaves the same
/// placeholder.
fn soft_delete_in<'a>(messages: impl Iterator<Item = &'a mut Value>, needle: &str) -> bool {
    for msg in messages {
        let matches = msg.get("id").and_then(Value::as_str) == Some(needle)
            || msg.get("timestamp").and_then(Value::as_str) == Some(needle);
        if matches {
            if let Some(obj) = msg.as_object_mut() {
                obj.insert("content".to_string(), Value::String(DELETED_PLACEHOLDER.into()));
                obj.insert("deleted".to_string(), Value::Bool(true));
            }
            return true;
        }
    }
    false
}
