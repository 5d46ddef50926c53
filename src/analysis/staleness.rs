use crate::models::sync_state::SyncState;
use std::time::Duration;

/// Default staleness window: 5 minutes.
pub const DEFAULT_STALENESS_WINDOW: Duration = Duration::from_secs(300);

/// Decide whether the cached document is due for a remote refresh.
/// - more than `window` has passed since the last local write, and
/// - a remote change was observed after that write.
///
/// A session that has not written yet counts as arbitrarily stale, so any
/// observed remote change makes it eligible.
pub fn should_refresh(state: &SyncState, now_ms: i64, window: Duration) -> bool {
    let Some(remote_changed_at) = state.last_observed_remote_change_at else {
        return false;
    };

    match state.last_local_write_at {
        None => true,
        Some(local_write_at) => {
            let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
            let elapsed = now_ms.saturating_sub(local_write_at);
            elapsed > window_ms && remote_changed_at > local_write_at
        }
    }
}
