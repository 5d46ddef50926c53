pub mod document;
pub mod field;
pub mod snapshot;
pub mod stage;
pub mod sync_state;
