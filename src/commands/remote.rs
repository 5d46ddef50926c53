use crate::commands::clock::Clock;
use crate::error::{SyncError, SyncResult};
use crate::models::document::ProfileDocument;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteAck {
    pub committed_at: i64,
}

// Edge-triggered "this document changed" signal; carries no content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteChange {
    pub user_id: String,
    pub changed_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegistrationId(uuid::Uuid);

impl RegistrationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for RegistrationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

pub struct ChangeFeed {
    pub registration: RegistrationId,
    pub receiver: mpsc::UnboundedReceiver<RemoteChange>,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    // `None` when the user has no document yet.
    async fn fetch(&self, user_id: &str) -> SyncResult<Option<ProfileDocument>>;

    async fn merge_update(&self, user_id: &str, update: &ProfileDocument) -> SyncResult<WriteAck>;

    async fn subscribe(&self, user_id: &str) -> SyncResult<ChangeFeed>;

    // Must not block; it runs from `Drop`.
    fn unsubscribe(&self, registration: &RegistrationId);
}

#[derive(Default)]
struct MemoryInner {
    documents: HashMap<String, ProfileDocument>,
    subscribers: HashMap<RegistrationId, (String, mpsc::UnboundedSender<RemoteChange>)>,
    failing_writes: u32,
    stale_rejections: u32,
    offline: bool,
    write_delay: Option<Duration>,
    fetch_delay: Option<Duration>,
    last_commit: i64,
}

// In-process store for offline mode and tests, with failure injection.
pub struct MemoryRemoteStore {
    clock: Arc<dyn Clock>,
    inner: Mutex<MemoryInner>,
}

impl MemoryRemoteStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(MemoryInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn fail_next_writes(&self, count: u32) {
        self.lock().failing_writes = count;
    }

    pub fn reject_next_writes_as_stale(&self, count: u32) {
        self.lock().stale_rejections = count;
    }

    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    pub fn set_write_delay(&self, delay: Option<Duration>) {
        self.lock().write_delay = delay;
    }

    pub fn set_fetch_delay(&self, delay: Option<Duration>) {
        self.lock().fetch_delay = delay;
    }

    pub fn document(&self, user_id: &str) -> Option<ProfileDocument> {
        self.lock().documents.get(user_id).cloned()
    }

    pub fn active_registrations(&self) -> usize {
        self.lock().subscribers.len()
    }

    // An edit made outside this session, e.g. from another device.
    pub fn touch_remotely(&self, user_id: &str, update: &ProfileDocument) -> i64 {
        let mut inner = self.lock();
        self.apply(&mut *inner, user_id, update)
    }

    fn apply(&self, inner: &mut MemoryInner, user_id: &str, update: &ProfileDocument) -> i64 {
        // Strictly increasing so every commit is distinguishable.
        let committed_at = self.clock.now_ms().max(inner.last_commit + 1);
        inner.last_commit = committed_at;

        inner
            .documents
            .entry(user_id.to_string())
            .or_default()
            .merge(update);

        inner.subscribers.retain(|_, (subscribed_user, sender)| {
            if subscribed_user.as_str() != user_id {
                return true;
            }
            sender
                .send(RemoteChange {
                    user_id: user_id.to_string(),
                    changed_at: committed_at,
                })
                .is_ok()
        });

        committed_at
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn fetch(&self, user_id: &str) -> SyncResult<Option<ProfileDocument>> {
        let delay = self.lock().fetch_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let inner = self.lock();
        if inner.offline {
            return Err(SyncError::RemoteUnavailable("store is offline".to_string()));
        }
        Ok(inner.documents.get(user_id).cloned())
    }

    async fn merge_update(&self, user_id: &str, update: &ProfileDocument) -> SyncResult<WriteAck> {
        let delay = self.lock().write_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.lock();
        if inner.offline {
            return Err(SyncError::RemoteUnavailable("store is offline".to_string()));
        }
        if inner.stale_rejections > 0 {
            inner.stale_rejections -= 1;
            return Err(SyncError::StaleWriteRejected(format!(
                "document {user_id} changed concurrently"
            )));
        }
        if inner.failing_writes > 0 {
            inner.failing_writes -= 1;
            return Err(SyncError::RemoteUnavailable("write failed".to_string()));
        }

        let committed_at = self.apply(&mut *inner, user_id, update);
        Ok(WriteAck { committed_at })
    }

    async fn subscribe(&self, user_id: &str) -> SyncResult<ChangeFeed> {
        let mut inner = self.lock();
        if inner.offline {
            return Err(SyncError::RemoteUnavailable("store is offline".to_string()));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let registration = RegistrationId::new();
        inner
            .subscribers
            .insert(registration.clone(), (user_id.to_string(), sender));

        Ok(ChangeFeed {
            registration,
            receiver,
        })
    }

    fn unsubscribe(&self, registration: &RegistrationId) {
        self.lock().subscribers.remove(registration);
    }
}
