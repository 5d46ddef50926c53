use crate::commands::remote::{ChangeFeed, RegistrationId, RemoteChange, RemoteStore};
use std::sync::Arc;
use tokio::task::JoinHandle;

// Dropping it stops the pump task and unregisters, including during unwinding.
pub struct SubscriptionGuard {
    registration: RegistrationId,
    remote: Arc<dyn RemoteStore>,
    task: JoinHandle<()>,
}

impl SubscriptionGuard {
    pub fn registration(&self) -> &RegistrationId {
        &self.registration
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.task.abort();
        self.remote.unsubscribe(&self.registration);
        log::debug!("change subscription {} closed", self.registration);
    }
}

// `on_change` returns false for notifications it ignored.
pub fn start_change_pump<F>(remote: Arc<dyn RemoteStore>, feed: ChangeFeed, on_change: F) -> SubscriptionGuard
where
    F: Fn(RemoteChange) -> bool + Send + 'static,
{
    let ChangeFeed {
        registration,
        mut receiver,
    } = feed;

    let label = registration.to_string();
    let task = tokio::spawn(async move {
        while let Some(change) = receiver.recv().await {
            let changed_at = change.changed_at;
            if !on_change(change) {
                log::debug!("subscription {label}: ignored notification at {changed_at}");
            }
        }
        log::debug!("subscription {label}: feed closed");
    });

    SubscriptionGuard {
        registration,
        remote,
        task,
    }
}
