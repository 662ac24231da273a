// Library entrypoint for the CLI binary and integration tests.
pub mod command_utils;
pub mod config;
pub mod error;
pub mod path_utils;
pub mod pipeline;
pub mod reports;
pub mod secrets;
pub mod sheets;
pub mod shutdown;
pub mod table;
pub mod tunnel;

pub use error::{Stage, SyncError};
pub use pipeline::{FetchedReports, RunSummary, SyncJob, WriteMode};
