//! In-memory session state with an idle timeout.
//!
//! Sessions are independent of authentication: losing one never touches the
//! auth ticket. A session expires once it has gone unused for longer than the
//! idle timeout; every successful load slides `last_access` forward.

use std::{
    collections::HashMap,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::RngCore;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub data: HashMap<String, Value>,
    /// Essential sessions are set regardless of cookie consent.
    pub essential: bool,
}

impl SessionRecord {
    fn new(id: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            created_at: now,
            last_access: now,
            data: HashMap::new(),
            essential: true,
        }
    }

    fn is_idle(&self, now: DateTime<Utc>, idle_timeout: Duration) -> bool {
        now - self.last_access > idle_timeout
    }
}

#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<DashMap<String, SessionRecord>>,
    idle_timeout: Duration,
}

impl SessionStore {
    pub fn new(idle_timeout: std::time::Duration) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            idle_timeout: Duration::from_std(idle_timeout).unwrap_or(Duration::seconds(60)),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Start an empty session and return its id.
    pub fn create(&self, now: DateTime<Utc>) -> String {
        let id = new_session_id();
        self.sessions
            .insert(id.clone(), SessionRecord::new(id.clone(), now));
        id
    }

    /// Fetch a live session and refresh its last access. Idle sessions are
    /// evicted and reported as missing.
    pub fn load(&self, id: &str, now: DateTime<Utc>) -> Option<SessionRecord> {
        {
            let mut record = self.sessions.get_mut(id)?;
            if !record.is_idle(now, self.idle_timeout) {
                record.last_access = now;
                return Some(record.clone());
            }
        }

        let timeout = self.idle_timeout;
        self.sessions
            .remove_if(id, |_, record| record.is_idle(now, timeout));
        None
    }

    pub fn get(&self, id: &str, key: &str) -> Option<Value> {
        self.sessions.get(id)?.data.get(key).cloned()
    }

    /// Write a value, recreating the record if it was swept in the meantime.
    pub fn insert(&self, id: &str, key: &str, value: Value, now: DateTime<Utc>) {
        let mut record = self
            .sessions
            .entry(id.to_string())
            .or_insert_with(|| SessionRecord::new(id.to_string(), now));
        record.last_access = now;
        record.data.insert(key.to_string(), value);
    }

    pub fn remove(&self, id: &str, key: &str) -> Option<Value> {
        self.sessions.get_mut(id)?.data.remove(key)
    }

    pub fn destroy(&self, id: &str) -> bool {
        self.sessions.remove(id).is_some()
    }

    /// Evict every idle session. Returns how many were removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.sessions.len();
        let timeout = self.idle_timeout;
        self.sessions
            .retain(|_, record| !record.is_idle(now, timeout));
        before.saturating_sub(self.sessions.len())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Per-request view of the caller's session.
///
/// The backing record is created lazily on the first write, so requests that
/// never touch session state never mint a session cookie.
#[derive(Clone)]
pub struct SessionHandle {
    store: SessionStore,
    id: Arc<OnceLock<String>>,
    created: Arc<AtomicBool>,
    destroyed: Arc<AtomicBool>,
}

impl SessionHandle {
    /// Handle for a session that was loaded successfully.
    pub fn existing(store: SessionStore, id: String) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(id);
        Self {
            store,
            id: Arc::new(cell),
            created: Arc::new(AtomicBool::new(false)),
            destroyed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle with no session yet.
    pub fn detached(store: SessionStore) -> Self {
        Self {
            store,
            id: Arc::new(OnceLock::new()),
            created: Arc::new(AtomicBool::new(false)),
            destroyed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.id.get().map(String::as_str)
    }

    fn ensure_id(&self) -> &str {
        self.id.get_or_init(|| {
            self.created.store(true, Ordering::SeqCst);
            self.store.create(Utc::now())
        })
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.store.get(self.id()?, key)
    }

    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        serde_json::from_value(self.get(key)?).ok()
    }

    pub fn insert<T: Serialize>(&self, key: &str, value: T) -> Result<(), serde_json::Error> {
        let value = serde_json::to_value(value)?;
        let id = self.ensure_id();
        self.store.insert(id, key, value, Utc::now());
        self.destroyed.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.store.remove(self.id()?, key)
    }

    /// Drop the session and its data.
    pub fn destroy(&self) {
        if let Some(id) = self.id() {
            self.store.destroy(id);
            self.destroyed.store(true, Ordering::SeqCst);
        }
    }

    /// True when this request minted the session id.
    pub fn was_created(&self) -> bool {
        self.created.load(Ordering::SeqCst)
    }

    pub fn was_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

fn new_session_id() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
