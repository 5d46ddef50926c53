pub mod analysis;
pub mod commands;
pub mod error;
pub mod models;

pub use analysis::catalog::FieldCatalog;
pub use analysis::completion::score;
pub use analysis::progress::{stage_to_step, step_to_stage, ProgressStateMachine};
pub use commands::db::LocalCache;
pub use commands::observable::{ProgressView, Subscription};
pub use commands::remote::{MemoryRemoteStore, RemoteChange, RemoteStore, WriteAck};
pub use commands::settings::EffectiveSyncSettings;
pub use commands::sync::SyncCoordinator;
pub use error::{SyncError, SyncResult};
pub use models::document::ProfileDocument;
pub use models::snapshot::{CompletionSnapshot, IncompleteFieldReport};
pub use models::stage::SignupStage;

/// Installs `env_logger` behind the `log` facade (default filter `info`,
/// overridable with `RUST_LOG`). Safe to call more than once.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}
