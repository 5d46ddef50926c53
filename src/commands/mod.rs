pub mod clock;
pub mod db;
pub mod observable;
pub mod remote;
pub mod settings;
pub mod sync;
pub mod watcher;
