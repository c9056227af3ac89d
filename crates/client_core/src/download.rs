use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use shared::{domain::FileId, protocol::DownloadUrlResponse};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::TransportError,
    schedule::DelayTimer,
    transport::{get_json, QueryParams, RequestOptions, Transport},
};

pub const DOWNLOAD_URL_PATH: &str = "/api/v1/app/download-url";
pub const DEFAULT_REVERT_AFTER: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ActionStatus {
    #[default]
    Idle,
    Loading,
    Success,
    Error,
}

/// Receives a resolved download link. Called once per successful invocation.
pub trait LinkOpener: Send + Sync {
    fn open(&self, file_id: FileId, url: &str);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSettings {
    pub revert_after: Duration,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            revert_after: DEFAULT_REVERT_AFTER,
        }
    }
}

/// Per-file status map. Ids without an entry are idle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadState {
    statuses: HashMap<FileId, ActionStatus>,
    errors: HashMap<FileId, String>,
}

impl DownloadState {
    pub fn status(&self, file_id: FileId) -> ActionStatus {
        self.statuses.get(&file_id).copied().unwrap_or_default()
    }

    pub fn error(&self, file_id: FileId) -> Option<&str> {
        self.errors.get(&file_id).map(String::as_str)
    }

    pub fn statuses(&self) -> &HashMap<FileId, ActionStatus> {
        &self.statuses
    }

    fn set(&mut self, file_id: FileId, status: ActionStatus) {
        self.statuses.insert(file_id, status);
        self.errors.remove(&file_id);
    }
}

struct PendingRevert {
    ticket: u64,
    timer: DelayTimer,
}

struct DownloadInner {
    transport: Arc<dyn Transport>,
    opener: Arc<dyn LinkOpener>,
    settings: DownloadSettings,
    state: watch::Sender<DownloadState>,
    cache: Mutex<HashMap<FileId, String>>,
    revert_timers: Mutex<HashMap<FileId, PendingRevert>>,
    next_ticket: AtomicU64,
    disposed: CancellationToken,
}

/// Resolves download links per file and tracks a status for each one.
pub struct DownloadController {
    inner: Arc<DownloadInner>,
}

impl DownloadController {
    pub fn new(
        transport: Arc<dyn Transport>,
        opener: Arc<dyn LinkOpener>,
        settings: DownloadSettings,
    ) -> Self {
        let (state, _) = watch::channel(DownloadState::default());
        Self {
            inner: Arc::new(DownloadInner {
                transport,
                opener,
                settings,
                state,
                cache: Mutex::new(HashMap::new()),
                revert_timers: Mutex::new(HashMap::new()),
                next_ticket: AtomicU64::new(0),
                disposed: CancellationToken::new(),
            }),
        }
    }

    pub fn status(&self, file_id: FileId) -> ActionStatus {
        self.inner.state.borrow().status(file_id)
    }

    pub fn state(&self) -> DownloadState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DownloadState> {
        self.inner.state.subscribe()
    }

    pub fn cached_url(&self, file_id: FileId) -> Option<String> {
        self.inner.cache.lock().get(&file_id).cloned()
    }

    /// Opens the link for `file_id`, resolving it first unless cached.
    /// Returns the status the invocation settled on; `Loading` means another
    /// invocation for the same id was already running.
    pub async fn invoke(&self, file_id: FileId) -> ActionStatus {
        if self.inner.disposed.is_cancelled() {
            return self.status(file_id);
        }

        if let Some(url) = self.cached_url(file_id) {
            if self.status(file_id) == ActionStatus::Loading {
                debug!(%file_id, "download: already resolving");
                return ActionStatus::Loading;
            }
            debug!(%file_id, "download: using cached link");
            self.inner.open(file_id, &url);
            return ActionStatus::Success;
        }

        let claimed = self.inner.state.send_if_modified(|state| {
            if state.status(file_id) == ActionStatus::Loading {
                return false;
            }
            state.set(file_id, ActionStatus::Loading);
            true
        });
        if !claimed {
            debug!(%file_id, "download: already resolving");
            return ActionStatus::Loading;
        }
        self.inner.revert_timers.lock().remove(&file_id);

        // The lookup runs in its own task so dropping this future cannot leave
        // the id stuck in `Loading`.
        let inner = Arc::clone(&self.inner);
        match tokio::spawn(inner.resolve(file_id)).await {
            Ok(status) => status,
            Err(err) => {
                warn!(%file_id, error = %err, "download: lookup task failed");
                self.status(file_id)
            }
        }
    }

    pub fn dispose(&self) {
        if self.inner.disposed.is_cancelled() {
            return;
        }
        self.inner.disposed.cancel();
        self.inner.revert_timers.lock().clear();
        debug!("download: controller disposed");
    }
}

impl Drop for DownloadController {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl DownloadInner {
    async fn resolve(self: Arc<Self>, file_id: FileId) -> ActionStatus {
        let params = QueryParams::new().with("file_id", file_id);
        let options = RequestOptions::new().with_cancel(self.disposed.child_token());
        let result = get_json::<DownloadUrlResponse>(
            self.transport.as_ref(),
            DOWNLOAD_URL_PATH,
            &params,
            options,
        )
        .await
        .and_then(|response| {
            response
                .validate()
                .map_err(TransportError::Validation)
                .map(|()| response)
        });

        if self.disposed.is_cancelled() {
            return self.state.borrow().status(file_id);
        }

        match result {
            Ok(response) => {
                info!(%file_id, "download: link resolved");
                self.cache
                    .lock()
                    .insert(file_id, response.download_url.clone());
                self.open(file_id, &response.download_url);
                ActionStatus::Success
            }
            Err(err) => {
                warn!(%file_id, error = %err, "download: failed to resolve link");
                let message = err.to_string();
                self.state.send_modify(|state| {
                    state.statuses.insert(file_id, ActionStatus::Error);
                    state.errors.insert(file_id, message);
                });
                ActionStatus::Error
            }
        }
    }

    fn open(self: &Arc<Self>, file_id: FileId, url: &str) {
        let mut timers = self.revert_timers.lock();
        self.state
            .send_modify(|state| state.set(file_id, ActionStatus::Success));

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(self);
        let mut timer = DelayTimer::default();
        timer.start(self.settings.revert_after, async move {
            if let Some(inner) = weak.upgrade() {
                inner.revert(file_id, ticket);
            }
        });
        // Replacing the entry aborts the previous window.
        timers.insert(file_id, PendingRevert { ticket, timer });
        drop(timers);

        self.opener.open(file_id, url);
    }

    /// Success is transient; any other status is left alone.
    fn revert(&self, file_id: FileId, ticket: u64) {
        if self.disposed.is_cancelled() {
            return;
        }
        let mut timers = self.revert_timers.lock();
        if !timers
            .get(&file_id)
            .is_some_and(|pending| pending.ticket == ticket)
        {
            return;
        }
        let finished = timers.remove(&file_id);
        self.state.send_if_modified(|state| {
            if state.status(file_id) != ActionStatus::Success {
                return false;
            }
            state.statuses.remove(&file_id);
            true
        });
        drop(timers);
        // Dropping the fired timer only aborts this task, which is about to end.
        drop(finished);
    }
}

#[cfg(test)]
#[path = "tests/download_tests.rs"]
mod tests;
