//! Async coordination layer for the index search client: debounced search,
//! per-file download links, and sync job progress.

pub mod auth;
pub mod config;
pub mod download;
pub mod error;
pub mod progress;
pub mod schedule;
pub mod search;
pub mod transport;

pub use auth::{AdminAuth, AuthState};
pub use config::{load_settings, Settings};
pub use download::{ActionStatus, DownloadController, DownloadSettings, DownloadState, LinkOpener};
pub use error::TransportError;
pub use progress::{GracePolicy, PollDecision, ProgressController, ProgressSettings, ProgressState};
pub use search::{SearchController, SearchSettings, SearchState};
pub use transport::{Credentials, HttpTransport, QueryParams, RequestOptions, Transport};

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
