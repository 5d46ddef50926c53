use serde::{Deserialize, Serialize};

/// Process-local bookkeeping for the sync coordinator. Timestamps are
/// milliseconds since the Unix epoch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub last_local_write_at: Option<i64>,
    pub last_observed_remote_change_at: Option<i64>,
    pub write_in_flight: bool,
}

impl SyncState {
    pub fn reset(&mut self) {
        *self = SyncState::default();
    }

    /// Records a remote change; returns false for duplicate or older notifications.
    pub fn observe_remote_change(&mut self, changed_at: i64) -> bool {
        match self.last_observed_remote_change_at {
            Some(previous) if previous >= changed_at => false,
            _ => {
                self.last_observed_remote_change_at = Some(changed_at);
                true
            }
        }
    }
}
