//! Session Management
//!
//! In-memory store mapping a hashed client identity to its conversation. Each session
//! sits behind its own async mutex; a turn holds that lock from start to finish so two
//! messages from one user never interleave. A background task sweeps idle sessions,
//! taking the same lock before it removes anything.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, Notify, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{AgentError, Result};
use crate::message::Message;

/// Privacy-preserving client identity: SHA-256 of `"<address>_<client id>"`, hex encoded
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionIdentity(String);

impl SessionIdentity {
    /// Wrap an already-derived identity
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Derive from a network address and an optional client identifier (User-Agent)
    pub fn from_client(address: impl fmt::Display, client_id: Option<&str>) -> Self {
        let raw = format!("{address}_{}", client_id.unwrap_or("unknown"));
        Self(hex::encode(Sha256::digest(raw.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Last-activity timestamp shared between a session and the store's id index.
///
/// Lives outside the session mutex so the store can refresh it while a turn holds
/// the lock.
#[derive(Clone, Debug)]
pub struct ActivityClock(Arc<AtomicI64>);

impl ActivityClock {
    fn starting_at(at: DateTime<Utc>) -> Self {
        Self(Arc::new(AtomicI64::new(at.timestamp_millis())))
    }

    pub fn get(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.0.load(Ordering::Acquire)).unwrap_or_default()
    }

    pub fn set(&self, at: DateTime<Utc>) {
        self.0.store(at.timestamp_millis(), Ordering::Release);
    }
}

/// One user's conversation
#[derive(Debug)]
pub struct Session {
    /// Opaque id, returned to clients as the conversation id
    pub id: String,

    pub identity: SessionIdentity,

    /// Conversation history, oldest first
    pub history: Vec<Message>,

    pub created_at: DateTime<Utc>,

    activity: ActivityClock,

    /// Set once the store has dropped this session
    pub(crate) evicted: bool,
}

impl Session {
    pub fn new(identity: SessionIdentity) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            identity,
            history: Vec::new(),
            created_at: now,
            activity: ActivityClock::starting_at(now),
            evicted: false,
        }
    }

    pub fn last_activity_at(&self) -> DateTime<Utc> {
        self.activity.get()
    }

    /// Update the activity timestamp
    pub fn touch(&self) {
        self.activity.set(Utc::now());
    }

    pub fn touch_at(&self, at: DateTime<Utc>) {
        self.activity.set(at);
    }

    /// Whether the session has been idle longer than `timeout` at `now`
    pub fn is_idle_at(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        (now - self.last_activity_at())
            .to_std()
            .is_ok_and(|idle| idle > timeout)
    }

    /// Whether the store has removed this session
    pub const fn is_evicted(&self) -> bool {
        self.evicted
    }

    fn tombstone(&mut self) {
        self.evicted = true;
        self.history.clear();
    }
}

/// Shared handle to a session
pub type SessionHandle = Arc<Mutex<Session>>;

/// What to do when a turn arrives for a session that is already mid-turn
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Queue behind the running turn
    #[default]
    Wait,
    /// Fail immediately with a retryable `SessionBusy`
    Reject,
}

impl FromStr for BusyPolicy {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wait" => Ok(Self::Wait),
            "reject" => Ok(Self::Reject),
            other => Err(AgentError::Config(format!("unknown busy policy '{other}'"))),
        }
    }
}

/// Session lifetime settings
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Idle time after which a session is evicted
    pub idle_timeout: Duration,
    /// How often the eviction sweep runs
    pub sweep_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Concurrent identity → session map
///
/// Lock order is `sessions` then `activity`; session mutexes are never awaited while
/// either map lock is held.
#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<SessionIdentity, SessionHandle>>,
    /// Session id → owner and activity clock of live sessions
    activity: RwLock<HashMap<String, (SessionIdentity, ActivityClock)>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the session for `identity`, creating it if absent. Concurrent callers
    /// for one identity always receive the same session.
    pub async fn get_or_create(&self, identity: &SessionIdentity) -> SessionHandle {
        if let Some(handle) = self.sessions.read().await.get(identity) {
            return Arc::clone(handle);
        }

        let mut sessions = self.sessions.write().await;
        if let Some(handle) = sessions.get(identity) {
            return Arc::clone(handle);
        }

        tracing::debug!(identity = %identity, "Creating session");
        let session = Session::new(identity.clone());
        self.activity
            .write()
            .await
            .insert(session.id.clone(), (identity.clone(), session.activity.clone()));
        let handle = Arc::new(Mutex::new(session));
        sessions.insert(identity.clone(), Arc::clone(&handle));
        handle
    }

    /// Lock the live session for `identity`.
    ///
    /// If the handle was evicted or cleared between lookup and lock, the identity is
    /// resolved again so the caller always ends up holding the session that is in the
    /// map.
    pub async fn acquire(&self, identity: &SessionIdentity, policy: BusyPolicy) -> Result<OwnedMutexGuard<Session>> {
        loop {
            let handle = self.get_or_create(identity).await;
            let guard = match policy {
                BusyPolicy::Wait => handle.lock_owned().await,
                BusyPolicy::Reject => handle
                    .try_lock_owned()
                    .map_err(|_| AgentError::SessionBusy("a turn is already running for this session".into()))?,
            };
            if !guard.evicted {
                return Ok(guard);
            }
            tracing::debug!(identity = %identity, "Session was evicted while waiting, re-resolving");
        }
    }

    /// Refresh a live session's activity timestamp by id. Returns whether it was found.
    ///
    /// Never waits on a session lock, so it is safe mid-turn, including on the
    /// caller's own session.
    pub async fn touch(&self, session_id: &str) -> bool {
        match self.activity.read().await.get(session_id) {
            Some((_, clock)) => {
                clock.set(Utc::now());
                true
            }
            None => false,
        }
    }

    /// Remove the session for `identity`. Returns whether one existed.
    pub async fn clear(&self, identity: &SessionIdentity) -> bool {
        let removed = {
            let mut sessions = self.sessions.write().await;
            let removed = sessions.remove(identity);
            if removed.is_some() {
                self.activity.write().await.retain(|_, (owner, _)| *owner != *identity);
            }
            removed
        };
        match removed {
            Some(handle) => {
                handle.lock().await.tombstone();
                tracing::info!(identity = %identity, "Session cleared");
                true
            }
            None => false,
        }
    }

    /// Number of live sessions
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Evict sessions idle for longer than `timeout`. Returns how many were removed.
    pub async fn evict_idle_older_than(&self, timeout: Duration) -> usize {
        self.evict_idle_at(timeout, Utc::now()).await
    }

    /// Eviction against an explicit clock.
    ///
    /// Sessions with a turn in flight are locked and therefore active; they are skipped.
    pub async fn evict_idle_at(&self, timeout: Duration, now: DateTime<Utc>) -> usize {
        let snapshot: Vec<(SessionIdentity, SessionHandle)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(identity, handle)| (identity.clone(), Arc::clone(handle)))
            .collect();

        let mut evicted = 0;
        for (identity, handle) in snapshot {
            let Ok(mut session) = handle.try_lock() else {
                continue;
            };
            if session.evicted || !session.is_idle_at(timeout, now) {
                continue;
            }

            let mut sessions = self.sessions.write().await;
            if sessions.get(&identity).is_some_and(|h| Arc::ptr_eq(h, &handle)) {
                sessions.remove(&identity);
                self.activity.write().await.remove(&session.id);
                session.tombstone();
                evicted += 1;
            }
        }

        if evicted > 0 {
            tracing::info!(evicted, timeout_secs = timeout.as_secs(), "Evicted idle sessions");
        }
        evicted
    }
}

/// Handle to the background eviction sweep
pub struct EvictionTask {
    handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

impl EvictionTask {
    /// Stop the sweep and wait for it to exit
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "Eviction task ended abnormally");
        }
    }
}

/// Spawn the periodic eviction sweep
pub fn spawn_eviction_task(store: Arc<SessionStore>, config: &SessionConfig) -> EvictionTask {
    let shutdown = Arc::new(Notify::new());
    let notified = Arc::clone(&shutdown);
    let timeout = config.idle_timeout;
    let period = config.sweep_interval;

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    store.evict_idle_older_than(timeout).await;
                }
                () = notified.notified() => {
                    tracing::debug!("Eviction task stopping");
                    break;
                }
            }
        }
    });

    tracing::info!(
        idle_timeout_secs = timeout.as_secs(),
        sweep_interval_secs = period.as_secs(),
        "Session eviction task started"
    );

    EvictionTask { handle, shutdown }
}
