use crate::analysis::progress::stage_to_step;
use crate::models::snapshot::CompletionSnapshot;
use crate::models::stage::SignupStage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressView {
    pub snapshot: CompletionSnapshot,
    pub stage: SignupStage,
    pub step: usize,
}

impl ProgressView {
    pub fn new(snapshot: CompletionSnapshot, stage: SignupStage) -> Self {
        Self {
            snapshot,
            stage,
            step: stage_to_step(stage),
        }
    }
}

type Observer = Arc<dyn Fn(&ProgressView) + Send + Sync>;

struct ObservableInner {
    view: ProgressView,
    // Session generation of the last publish; older publishes are dropped.
    generation: u64,
    observers: BTreeMap<u64, Observer>,
    next_id: u64,
}

// Observers run synchronously on the publishing thread.
pub struct ObservableState {
    inner: Arc<Mutex<ObservableInner>>,
}

pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<ObservableInner>>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut inner = registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            inner.observers.remove(&self.id);
        }
    }
}

impl ObservableState {
    pub fn new(initial: ProgressView) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ObservableInner {
                view: initial,
                generation: 0,
                observers: BTreeMap::new(),
                next_id: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ObservableInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&ProgressView) + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.observers.insert(id, Arc::new(observer));

        Subscription {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    pub fn current_snapshot(&self) -> CompletionSnapshot {
        self.lock().view.snapshot.clone()
    }

    pub fn current_stage(&self) -> SignupStage {
        self.lock().view.stage
    }

    pub fn current_view(&self) -> ProgressView {
        self.lock().view.clone()
    }

    pub fn observer_count(&self) -> usize {
        self.lock().observers.len()
    }

    pub(crate) fn publish_snapshot(&self, generation: u64, snapshot: CompletionSnapshot) -> bool {
        self.publish_with(generation, |view| view.snapshot = snapshot)
    }

    pub(crate) fn publish_stage(&self, generation: u64, stage: SignupStage) -> bool {
        self.publish_with(generation, |view| {
            view.stage = stage;
            view.step = stage_to_step(stage);
        })
    }

    pub(crate) fn publish(&self, generation: u64, next: ProgressView) -> bool {
        self.publish_with(generation, |view| *view = next)
    }

    fn publish_with<F: FnOnce(&mut ProgressView)>(&self, generation: u64, update: F) -> bool {
        // Observers are called outside the lock so they may read state back.
        let (view, observers) = {
            let mut inner = self.lock();
            if generation < inner.generation {
                log::debug!("dropping publish from ended session {generation}");
                return false;
            }
            inner.generation = generation;
            update(&mut inner.view);
            let observers: Vec<Observer> = inner.observers.values().cloned().collect();
            (inner.view.clone(), observers)
        };

        for observer in observers {
            observer(&view);
        }
        true
    }
}
