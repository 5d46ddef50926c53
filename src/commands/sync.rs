use crate::analysis::catalog::FieldCatalog;
use crate::analysis::completion::score_at;
use crate::analysis::progress::{ProgressStateMachine, Transition};
use crate::analysis::staleness;
use crate::commands::clock::{Clock, SystemClock};
use crate::commands::db::LocalCache;
use crate::commands::observable::{ObservableState, ProgressView, Subscription};
use crate::commands::remote::{RemoteChange, RemoteStore, WriteAck};
use crate::commands::settings::{load_effective_sync_settings, EffectiveSyncSettings};
use crate::commands::watcher::{start_change_pump, SubscriptionGuard};
use crate::error::{SyncError, SyncResult};
use crate::models::document::{ProfileDocument, STAGE_FIELD};
use crate::models::snapshot::CompletionSnapshot;
use crate::models::stage::SignupStage;
use crate::models::sync_state::SyncState;
use serde_json::json;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

struct Session {
    user_id: String,
    cancel: CancellationToken,
    subscription: Option<SubscriptionGuard>,
}

struct CoordinatorInner {
    session: Option<Session>,
    // Bumped on every session start/end so late completions can tell they
    // belong to a session that no longer exists.
    generation: u64,
    sync: SyncState,
    machine: ProgressStateMachine,
    document: ProfileDocument,
}

enum Rollback {
    Document(ProfileDocument),
    Stage,
    Nothing,
}

// Holds the in-flight flag for one write. Unless disarmed, dropping it undoes
// the speculative change, which also covers a dropped future.
struct WriteGuard<'a> {
    coordinator: &'a SyncCoordinator,
    generation: u64,
    rollback: Option<Rollback>,
}

impl WriteGuard<'_> {
    fn disarm(&mut self) {
        self.rollback = None;
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.coordinator.lock();
        if inner.generation != self.generation {
            return;
        }
        match self.rollback.take() {
            Some(Rollback::Document(previous)) => inner.document = previous,
            Some(Rollback::Stage) => {
                inner.machine.rollback();
            }
            Some(Rollback::Nothing) | None => {}
        }
        inner.sync.write_in_flight = false;
    }
}

pub struct SyncCoordinator {
    remote: Arc<dyn RemoteStore>,
    cache: Arc<LocalCache>,
    catalog: FieldCatalog,
    settings: EffectiveSyncSettings,
    clock: Arc<dyn Clock>,
    observable: ObservableState,
    inner: Mutex<CoordinatorInner>,
}

impl SyncCoordinator {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        cache: Arc<LocalCache>,
        catalog: FieldCatalog,
        settings: EffectiveSyncSettings,
    ) -> Arc<Self> {
        Self::with_clock(remote, cache, catalog, settings, Arc::new(SystemClock))
    }

    pub fn with_clock(
        remote: Arc<dyn RemoteStore>,
        cache: Arc<LocalCache>,
        catalog: FieldCatalog,
        settings: EffectiveSyncSettings,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let empty = CompletionSnapshot::empty(&catalog, clock.now_ms());
        Arc::new(Self {
            remote,
            cache,
            catalog,
            settings,
            clock,
            observable: ObservableState::new(ProgressView::new(empty, SignupStage::Initial)),
            inner: Mutex::new(CoordinatorInner {
                session: None,
                generation: 0,
                sync: SyncState::default(),
                machine: ProgressStateMachine::default(),
                document: ProfileDocument::new(),
            }),
        })
    }

    pub fn open(data_dir: &Path, remote: Arc<dyn RemoteStore>) -> SyncResult<Arc<Self>> {
        let settings = load_effective_sync_settings(data_dir)?;
        let cache = LocalCache::open(&settings.cache_path(data_dir))?;
        Ok(Self::new(remote, Arc::new(cache), FieldCatalog::dating_profile(), settings))
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn catalog(&self) -> &FieldCatalog {
        &self.catalog
    }

    pub fn settings(&self) -> &EffectiveSyncSettings {
        &self.settings
    }

    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&ProgressView) + Send + Sync + 'static,
    {
        self.observable.subscribe(observer)
    }

    pub fn current_snapshot(&self) -> CompletionSnapshot {
        self.observable.current_snapshot()
    }

    pub fn current_stage(&self) -> SignupStage {
        self.observable.current_stage()
    }

    pub fn current_view(&self) -> ProgressView {
        self.observable.current_view()
    }

    pub fn active_user(&self) -> Option<String> {
        self.lock().session.as_ref().map(|s| s.user_id.clone())
    }

    pub fn sync_state(&self) -> SyncState {
        self.lock().sync.clone()
    }

    pub fn document(&self) -> ProfileDocument {
        self.lock().document.clone()
    }

    // Cached progress is published before any network round trip. If the
    // document cannot be fetched or read from the cache, the session stays
    // open on cached progress and the error is returned.
    pub async fn start_session(self: &Arc<Self>, user_id: &str) -> SyncResult<ProgressView> {
        if let Some(active) = self.active_user() {
            if active == user_id {
                return Ok(self.current_view());
            }
            self.end_session();
        }

        let cached = self.cache.load_progress(user_id).unwrap_or_else(|e| {
            log::warn!("could not read cached progress for {user_id}: {e}");
            None
        });

        // Writes are refused with WriteInFlight until the document is installed.
        let (generation, cancel, mut guard) = {
            let mut inner = self.lock();
            inner.generation += 1;
            let cancel = CancellationToken::new();
            inner.session = Some(Session {
                user_id: user_id.to_string(),
                cancel: cancel.clone(),
                subscription: None,
            });
            inner.document = ProfileDocument::new();
            inner.sync = SyncState::default();
            inner.machine = ProgressStateMachine::new(SignupStage::Initial);
            if let Some(cached) = &cached {
                inner.machine = ProgressStateMachine::new(cached.stage);
                inner.sync.last_local_write_at = cached.last_local_write_at;
                inner.sync.last_observed_remote_change_at = cached.last_observed_remote_change_at;
            }
            inner.sync.write_in_flight = true;

            let generation = inner.generation;
            let guard = WriteGuard {
                coordinator: self.as_ref(),
                generation,
                rollback: Some(Rollback::Nothing),
            };
            (generation, cancel, guard)
        };

        let cached_stage = cached.as_ref().map_or(SignupStage::Initial, |c| c.stage);
        let cached_snapshot = cached
            .and_then(|c| c.snapshot)
            .unwrap_or_else(|| CompletionSnapshot::empty(&self.catalog, self.clock.now_ms()));
        self.observable
            .publish(generation, ProgressView::new(cached_snapshot, cached_stage));
        log::info!("session started for {user_id} at stage {cached_stage}");

        match self.subscribe_changes(user_id).await {
            Ok(subscription) => {
                let mut inner = self.lock();
                let current = inner.generation == generation;
                match inner.session.as_mut() {
                    Some(session) if current => session.subscription = Some(subscription),
                    // Session ended while subscribing; the guard unregisters on drop.
                    _ => return Err(SyncError::Cancelled),
                }
            }
            Err(e) => log::warn!("change subscription for {user_id} unavailable: {e}"),
        }

        // The remote copy wins over the cache: it may carry a stage or fields
        // written from another device while this one had no subscription.
        let fetched = self.call_remote("fetch", &cancel, self.remote.fetch(user_id)).await;
        let (document, fresh) = match fetched {
            Ok(remote) => {
                let document = remote.unwrap_or_default();
                if let Err(e) = self.cache.store_document(user_id, &document) {
                    log::warn!("could not fill cache for {user_id}: {e}");
                }
                (document, true)
            }
            Err(e) => match self.cache.load_document(user_id) {
                Ok(Some(document)) => {
                    log::warn!("fetch for {user_id} failed, resuming from cache: {e}");
                    (document, false)
                }
                _ => return Err(e),
            },
        };

        self.install_document(user_id, generation, document)?;
        if fresh {
            self.mark_synced(user_id, generation);
        }
        guard.disarm();
        drop(guard);
        Ok(self.current_view())
    }

    // Logout, or first launch without an identity.
    pub fn end_session(&self) {
        let (session, user_id, generation) = {
            let mut inner = self.lock();
            let session = inner.session.take();
            let user_id = session.as_ref().map(|s| s.user_id.clone());
            inner.generation += 1;
            inner.machine.reset();
            inner.sync.reset();
            inner.document = ProfileDocument::new();
            (session, user_id, inner.generation)
        };

        if let Some(session) = session {
            session.cancel.cancel();
            // Dropping the guard unregisters the change subscription.
            drop(session.subscription);
        }

        if let Some(user_id) = &user_id {
            if let Err(e) = self.cache.clear_user(user_id) {
                log::warn!("could not clear cached state for {user_id}: {e}");
            }
            log::info!("session ended for {user_id}");
        }

        let empty = CompletionSnapshot::empty(&self.catalog, self.clock.now_ms());
        self.observable
            .publish(generation, ProgressView::new(empty, SignupStage::Initial));
    }

    pub fn cancel_pending(&self) {
        let mut inner = self.lock();
        if let Some(session) = inner.session.as_mut() {
            let previous = std::mem::replace(&mut session.cancel, CancellationToken::new());
            previous.cancel();
        }
    }

    pub async fn load(&self, user_id: &str) -> SyncResult<ProfileDocument> {
        match self.cache.load_document(user_id) {
            Ok(Some(document)) => return Ok(document),
            Ok(None) => {}
            Err(e) => log::warn!("cache read for {user_id} failed, going remote: {e}"),
        }

        let cancel = self.session_token().unwrap_or_else(CancellationToken::new);
        let document = self
            .call_remote("fetch", &cancel, self.remote.fetch(user_id))
            .await?
            .unwrap_or_default();

        if let Err(e) = self.cache.store_document(user_id, &document) {
            log::warn!("could not fill cache for {user_id}: {e}");
        }
        Ok(document)
    }

    pub fn should_refresh(&self) -> bool {
        let inner = self.lock();
        if inner.session.is_none() {
            return false;
        }
        staleness::should_refresh(&inner.sync, self.clock.now_ms(), self.settings.staleness_window)
    }

    pub async fn refresh(&self) -> SyncResult<bool> {
        if !self.should_refresh() {
            return Ok(false);
        }
        self.reload().await?;
        Ok(true)
    }

    pub async fn reload(&self) -> SyncResult<CompletionSnapshot> {
        let (user_id, cancel, mut guard) = self.begin_write(|_| Rollback::Nothing)?;

        let fetched = self.call_remote("fetch", &cancel, self.remote.fetch(&user_id)).await;
        let document = match fetched {
            Ok(document) => document.unwrap_or_default(),
            Err(e) => {
                log::warn!("refresh for {user_id} failed, keeping cached state: {e}");
                return Err(e);
            }
        };

        if let Err(e) = self.cache.store_document(&user_id, &document) {
            log::warn!("could not cache refreshed document for {user_id}: {e}");
        }
        let snapshot = self.install_document(&user_id, guard.generation, document)?;
        self.mark_synced(&user_id, guard.generation);
        guard.disarm();
        Ok(snapshot)
    }

    // The merged document is visible through `document()` while the write is
    // pending and is restored if the write fails, times out or is cancelled.
    pub async fn save(&self, update: ProfileDocument) -> SyncResult<CompletionSnapshot> {
        if update.get(STAGE_FIELD).is_some() {
            return Err(SyncError::InvalidDocument(format!(
                "{STAGE_FIELD} can only change through advance_stage"
            )));
        }

        let (user_id, cancel, mut guard) = self.begin_write(|inner| {
            let previous = inner.document.clone();
            inner.document.merge(&update);
            Rollback::Document(previous)
        })?;

        let ack = match self.write_remote("save", &user_id, &update, &cancel).await {
            Ok(ack) => ack,
            Err(e) => {
                log::warn!("save for {user_id} failed, rolling back: {e}");
                return Err(e);
            }
        };

        let generation = guard.generation;
        let snapshot = self.commit_save(&user_id, generation, ack)?;
        guard.disarm();
        drop(guard);

        self.observable.publish_snapshot(generation, snapshot.clone());
        Ok(snapshot)
    }

    pub async fn advance_stage(&self, next: SignupStage) -> SyncResult<SignupStage> {
        let mut unchanged = None;
        let (user_id, cancel, mut guard) = {
            let mut transition_error = None;
            let began = self.begin_write(|inner| match inner.machine.advance(next) {
                Ok(Transition::Advanced { .. }) => Rollback::Stage,
                Ok(Transition::Unchanged(stage)) => {
                    unchanged = Some(stage);
                    Rollback::Nothing
                }
                Err(e) => {
                    transition_error = Some(e);
                    Rollback::Nothing
                }
            })?;
            if let Some(e) = transition_error {
                return Err(e);
            }
            began
        };

        if let Some(stage) = unchanged {
            guard.disarm();
            return Ok(stage);
        }

        let update = ProfileDocument::new().with(STAGE_FIELD, json!(next.as_tag()));
        let ack = match self.write_remote("advance_stage", &user_id, &update, &cancel).await {
            Ok(ack) => ack,
            Err(e) => {
                log::warn!("stage write {next} for {user_id} failed, rolling back: {e}");
                return Err(e);
            }
        };

        let generation = guard.generation;
        self.commit_stage(&user_id, generation, &update, ack)?;
        guard.disarm();
        drop(guard);

        self.observable.publish_stage(generation, next);
        log::info!("{user_id} advanced to stage {next}");
        Ok(next)
    }

    // Notifications only move `last_observed_remote_change_at`.
    pub async fn subscribe_changes(self: &Arc<Self>, user_id: &str) -> SyncResult<SubscriptionGuard> {
        let cancel = self.session_token().unwrap_or_else(CancellationToken::new);
        let feed = self
            .call_remote("subscribe", &cancel, self.remote.subscribe(user_id))
            .await?;

        let weak = Arc::downgrade(self);
        Ok(start_change_pump(self.remote.clone(), feed, move |change| {
            weak.upgrade()
                .map(|coordinator| coordinator.record_remote_change(&change))
                .unwrap_or(false)
        }))
    }

    pub fn unsubscribe(&self) {
        let guard = self
            .lock()
            .session
            .as_mut()
            .and_then(|session| session.subscription.take());
        drop(guard);
    }

    pub fn is_subscribed(&self) -> bool {
        self.lock()
            .session
            .as_ref()
            .is_some_and(|session| session.subscription.is_some())
    }

    pub fn record_remote_change(&self, change: &RemoteChange) -> bool {
        let mut inner = self.lock();
        let Some(session) = inner.session.as_ref() else {
            return false;
        };
        if session.user_id != change.user_id {
            return false;
        }
        let user_id = session.user_id.clone();

        if !inner.sync.observe_remote_change(change.changed_at) {
            return false;
        }
        self.persist_sync_timestamps(&user_id, &inner.sync);
        true
    }

    fn session_token(&self) -> Option<CancellationToken> {
        self.lock().session.as_ref().map(|s| s.cancel.clone())
    }

    fn begin_write<F>(&self, speculate: F) -> SyncResult<(String, CancellationToken, WriteGuard<'_>)>
    where
        F: FnOnce(&mut CoordinatorInner) -> Rollback,
    {
        let mut inner = self.lock();
        let Some(session) = inner.session.as_ref() else {
            return Err(SyncError::SubsystemNotInitialized);
        };
        let user_id = session.user_id.clone();
        let cancel = session.cancel.clone();

        if inner.sync.write_in_flight {
            return Err(SyncError::WriteInFlight);
        }
        inner.sync.write_in_flight = true;

        let rollback = speculate(&mut *inner);
        let generation = inner.generation;
        drop(inner);

        Ok((
            user_id,
            cancel,
            WriteGuard {
                coordinator: self,
                generation,
                rollback: Some(rollback),
            },
        ))
    }

    async fn write_remote(
        &self,
        operation: &str,
        user_id: &str,
        update: &ProfileDocument,
        cancel: &CancellationToken,
    ) -> SyncResult<WriteAck> {
        let mut retries = 0;
        loop {
            let result = self
                .call_remote(operation, cancel, self.remote.merge_update(user_id, update))
                .await;
            match result {
                Err(SyncError::StaleWriteRejected(reason)) if retries < self.settings.stale_write_retries => {
                    retries += 1;
                    log::info!("{operation}: stale write for {user_id} ({reason}), re-sending local value");
                }
                other => return other,
            }
        }
    }

    async fn call_remote<T, Fut>(&self, operation: &str, cancel: &CancellationToken, call: Fut) -> SyncResult<T>
    where
        Fut: Future<Output = SyncResult<T>>,
    {
        let timeout = self.settings.remote_timeout;
        tokio::select! {
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
            result = tokio::time::timeout(timeout, call) => match result {
                Ok(outcome) => outcome,
                Err(_) => Err(SyncError::Timeout {
                    operation: operation.to_string(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                }),
            },
        }
    }

    fn commit_save(&self, user_id: &str, generation: u64, ack: WriteAck) -> SyncResult<CompletionSnapshot> {
        let mut inner = self.lock();
        if inner.generation != generation {
            return Err(SyncError::Cancelled);
        }

        if let Err(e) = self.cache.store_document(user_id, &inner.document) {
            log::warn!("could not cache saved document for {user_id}: {e}");
        }

        let now = self.clock.now_ms();
        let snapshot = score_at(&inner.document, &self.catalog, now);
        if let Err(e) = self.cache.store_snapshot(user_id, &snapshot) {
            log::warn!("could not cache snapshot for {user_id}: {e}");
        }

        // Never earlier than the store's own stamp, so the echo of this
        // write cannot look like a newer remote change.
        inner.sync.last_local_write_at = Some(now.max(ack.committed_at));
        self.persist_sync_timestamps(user_id, &inner.sync);

        log::debug!("{user_id} saved, completion {}%", snapshot.percent());
        Ok(snapshot)
    }

    fn commit_stage(&self, user_id: &str, generation: u64, update: &ProfileDocument, ack: WriteAck) -> SyncResult<()> {
        let mut inner = self.lock();
        if inner.generation != generation {
            return Err(SyncError::Cancelled);
        }

        inner.machine.confirm();
        inner.document.merge(update);
        if let Err(e) = self.cache.store_stage(user_id, inner.machine.current()) {
            log::warn!("could not cache stage for {user_id}: {e}");
        }
        if let Err(e) = self.cache.store_document(user_id, &inner.document) {
            log::warn!("could not cache document for {user_id}: {e}");
        }

        let now = self.clock.now_ms();
        inner.sync.last_local_write_at = Some(now.max(ack.committed_at));
        self.persist_sync_timestamps(user_id, &inner.sync);
        Ok(())
    }

    // Adopts a remote stage only when it is ahead of the local one.
    fn install_document(&self, user_id: &str, generation: u64, document: ProfileDocument) -> SyncResult<CompletionSnapshot> {
        let (snapshot, stage) = {
            let mut inner = self.lock();
            if inner.generation != generation {
                return Err(SyncError::Cancelled);
            }

            let remote_stage = document.stage_tag().map(SignupStage::from_tag);
            if let Some(remote_stage) = remote_stage {
                if remote_stage > inner.machine.current() {
                    inner.machine = ProgressStateMachine::new(remote_stage);
                    if let Err(e) = self.cache.store_stage(user_id, remote_stage) {
                        log::warn!("could not cache stage for {user_id}: {e}");
                    }
                }
            }

            let snapshot = score_at(&document, &self.catalog, self.clock.now_ms());
            inner.document = document;
            if let Err(e) = self.cache.store_snapshot(user_id, &snapshot) {
                log::warn!("could not cache snapshot for {user_id}: {e}");
            }
            (snapshot, inner.machine.current())
        };

        self.observable
            .publish(generation, ProgressView::new(snapshot.clone(), stage));
        Ok(snapshot)
    }

    // The session now holds the latest remote document.
    fn mark_synced(&self, user_id: &str, generation: u64) {
        let mut inner = self.lock();
        if inner.generation == generation {
            inner.sync.last_local_write_at = Some(self.clock.now_ms());
            self.persist_sync_timestamps(user_id, &inner.sync);
        }
    }

    fn persist_sync_timestamps(&self, user_id: &str, state: &SyncState) {
        if let Err(e) = self.cache.store_sync_timestamps(user_id, state) {
            log::warn!("could not cache sync timestamps for {user_id}: {e}");
        }
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(session) = inner.session.take() {
            session.cancel.cancel();
            drop(session.subscription);
        }
    }
}
