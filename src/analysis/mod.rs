pub mod catalog;
pub mod completion;
pub mod progress;
pub mod staleness;
