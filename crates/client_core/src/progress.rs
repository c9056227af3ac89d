use std::{future::Future, sync::Arc, time::Duration};

use parking_lot::Mutex;
use shared::{
    domain::SyncStatus,
    protocol::{SyncProgress, SyncStartRequest},
};
use tokio::{
    sync::watch,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::TransportError,
    schedule::{Sequence, SequenceToken, TaskSlot},
    transport::{get_json, Credentials, QueryParams, RequestOptions, Transport},
};

pub const SYNC_PATH: &str = "/api/v1/admin/sync";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_GRACE_TICKS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressSettings {
    pub poll_interval: Duration,
    /// Non-running reads tolerated after a start before polling may stop.
    pub grace_ticks: u32,
}

impl Default for ProgressSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            grace_ticks: DEFAULT_GRACE_TICKS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollDecision {
    Continue { overlay_running: bool },
    Stop,
}

/// Decides, per poll read, whether to keep polling. A freshly started job may
/// still read as finished for a few ticks; those reads are shown as running
/// until the budget runs out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GracePolicy {
    ticks_remaining: u32,
}

impl GracePolicy {
    pub fn steady() -> Self {
        Self::default()
    }

    pub fn after_start(ticks: u32) -> Self {
        Self {
            ticks_remaining: ticks,
        }
    }

    pub fn ticks_remaining(&self) -> u32 {
        self.ticks_remaining
    }

    /// `None` means the server had no snapshot at all.
    pub fn observe(&mut self, status: Option<SyncStatus>) -> PollDecision {
        match status {
            Some(status) if status.is_running() => PollDecision::Continue {
                overlay_running: false,
            },
            _ if self.ticks_remaining > 0 => {
                self.ticks_remaining -= 1;
                PollDecision::Continue {
                    overlay_running: true,
                }
            }
            _ => PollDecision::Stop,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressState {
    pub progress: Option<SyncProgress>,
    /// A start or cancel request is in flight.
    pub loading: bool,
    pub initial_loading: bool,
    pub error: Option<String>,
    pub polling: bool,
    poll_sequence: Sequence,
}

impl ProgressState {
    pub fn status(&self) -> Option<SyncStatus> {
        self.progress.as_ref().map(|progress| progress.status)
    }

    fn apply_snapshot(&mut self, snapshot: Option<SyncProgress>, overlay_running: bool, now: i64) {
        match snapshot {
            Some(mut progress) => {
                if overlay_running {
                    progress.mark_running(now);
                }
                self.progress = Some(progress);
            }
            // Keep the optimistic snapshot while the job is still spinning up.
            None if overlay_running => {}
            None => self.progress = None,
        }
        self.error = None;
    }

    fn apply_failure(&mut self, err: &TransportError) {
        if !err.is_cancelled() {
            self.error = Some(err.to_string());
        }
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Runs `task` on its own tokio task so a dropped caller cannot abandon a
/// half-applied state transition.
async fn detached<T, F>(task: F) -> Option<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(task).await {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(error = %err, "sync: background task failed");
            None
        }
    }
}

struct ProgressInner {
    transport: Arc<dyn Transport>,
    credentials: Credentials,
    settings: ProgressSettings,
    state: watch::Sender<ProgressState>,
    poll: Mutex<TaskSlot>,
    grace: Mutex<GracePolicy>,
    disposed: CancellationToken,
}

pub struct ProgressController {
    inner: Arc<ProgressInner>,
}

impl ProgressController {
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: Credentials,
        settings: ProgressSettings,
    ) -> Self {
        let (state, _) = watch::channel(ProgressState::default());
        Self {
            inner: Arc::new(ProgressInner {
                transport,
                credentials,
                settings,
                state,
                poll: Mutex::new(TaskSlot::default()),
                grace: Mutex::new(GracePolicy::steady()),
                disposed: CancellationToken::new(),
            }),
        }
    }

    pub fn state(&self) -> ProgressState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressState> {
        self.inner.state.subscribe()
    }

    pub fn is_polling(&self) -> bool {
        self.inner.state.borrow().polling
    }

    pub async fn activate(&self) -> Option<SyncProgress> {
        if self.inner.disposed.is_cancelled() {
            return None;
        }
        if self.inner.credentials.is_empty() {
            debug!("sync: no credentials, skipping initial fetch");
            return None;
        }
        self.inner.state.send_modify(|state| state.initial_loading = true);
        detached(Arc::clone(&self.inner).activate()).await.flatten()
    }

    pub async fn start_job(&self, request: SyncStartRequest) -> bool {
        if self.inner.disposed.is_cancelled() {
            return false;
        }
        self.inner.state.send_modify(|state| {
            state.loading = true;
            state.error = None;
        });
        detached(Arc::clone(&self.inner).start_job(request))
            .await
            .unwrap_or(false)
    }

    pub async fn cancel_job(&self) -> bool {
        if self.inner.disposed.is_cancelled() {
            return false;
        }
        self.inner.state.send_modify(|state| {
            state.loading = true;
            state.error = None;
        });
        detached(Arc::clone(&self.inner).cancel_job())
            .await
            .unwrap_or(false)
    }

    pub async fn refetch(&self) -> Option<SyncProgress> {
        if self.inner.disposed.is_cancelled() {
            return None;
        }
        detached(Arc::clone(&self.inner).refetch()).await.flatten()
    }

    pub fn stop_polling(&self) {
        self.inner.stop_polling();
    }

    pub fn dispose(&self) {
        if self.inner.disposed.is_cancelled() {
            return;
        }
        self.inner.disposed.cancel();
        self.inner.poll.lock().cancel();
        debug!("sync: controller disposed");
    }
}

impl Drop for ProgressController {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl ProgressInner {
    fn options(&self) -> RequestOptions {
        RequestOptions::new()
            .with_cancel(self.disposed.child_token())
            .with_credentials(&self.credentials)
    }

    /// `Ok(None)` when the server has no job on record.
    async fn fetch(&self) -> Result<Option<SyncProgress>, TransportError> {
        let result = get_json::<SyncProgress>(
            self.transport.as_ref(),
            SYNC_PATH,
            &QueryParams::new(),
            self.options(),
        )
        .await;
        match result {
            Ok(progress) => {
                progress.validate().map_err(TransportError::Validation)?;
                Ok(Some(progress))
            }
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Non-running reads are hidden while a post-start loop still has grace.
    fn in_grace(&self, state: &ProgressState, status: Option<SyncStatus>) -> bool {
        state.polling
            && !status.is_some_and(SyncStatus::is_running)
            && self.grace.lock().ticks_remaining() > 0
    }

    /// Applies an out-of-loop read. Returns the snapshot as displayed and
    /// whether a poll loop was already running.
    fn apply_read(
        &self,
        result: Result<Option<SyncProgress>, TransportError>,
        initial: bool,
    ) -> (Option<SyncProgress>, bool) {
        let now = now_millis();
        let mut shown = None;
        let mut polling = false;
        self.state.send_modify(|state| {
            if initial {
                state.initial_loading = false;
            }
            polling = state.polling;
            match result {
                Ok(snapshot) => {
                    let found = snapshot.is_some();
                    let overlay = self.in_grace(state, snapshot.as_ref().map(|p| p.status));
                    state.apply_snapshot(snapshot, overlay, now);
                    if found {
                        shown = state.progress.clone();
                    }
                }
                Err(err) => state.apply_failure(&err),
            }
        });
        (shown, polling)
    }

    async fn activate(self: Arc<Self>) -> Option<SyncProgress> {
        let result = self.fetch().await;
        if self.disposed.is_cancelled() {
            return None;
        }
        let (snapshot, polling) = self.apply_read(result, true);

        if let Some(progress) = &snapshot {
            info!(status = %progress.status, "sync: loaded snapshot");
            if progress.status.is_running() && !polling {
                self.start_polling(GracePolicy::steady());
            }
        }
        snapshot
    }

    async fn start_job(self: Arc<Self>, request: SyncStartRequest) -> bool {
        let body = match serde_json::to_value(&request) {
            Ok(body) => body,
            Err(err) => {
                let err = TransportError::Validation(err.to_string());
                self.state.send_modify(|state| {
                    state.loading = false;
                    state.apply_failure(&err);
                });
                return false;
            }
        };

        match self.transport.post(SYNC_PATH, body, self.options()).await {
            Ok(response) => {
                info!(
                    roots = request.root_folder_ids.len(),
                    message = %response.message,
                    "sync: start accepted"
                );
            }
            Err(err) => {
                if self.disposed.is_cancelled() {
                    return false;
                }
                warn!(error = %err, code = err.code(), "sync: start rejected");
                self.state.send_modify(|state| {
                    state.loading = false;
                    state.apply_failure(&err);
                });
                return false;
            }
        }

        let fetched = self.fetch().await;
        if self.disposed.is_cancelled() {
            return true;
        }
        let now = now_millis();
        let roots = request.root_folder_ids;
        self.state.send_modify(|state| {
            state.loading = false;
            state.error = None;
            let mut progress = match fetched {
                Ok(Some(progress)) => progress,
                Ok(None) => SyncProgress::optimistic(now, &roots),
                Err(err) => {
                    warn!(error = %err, "sync: snapshot after start unavailable");
                    state
                        .progress
                        .take()
                        .unwrap_or_else(|| SyncProgress::optimistic(now, &roots))
                }
            };
            progress.mark_running(now);
            state.progress = Some(progress);
        });

        self.start_polling(GracePolicy::after_start(self.settings.grace_ticks));
        true
    }

    async fn cancel_job(self: Arc<Self>) -> bool {
        if let Err(err) = self.transport.delete(SYNC_PATH, self.options()).await {
            if self.disposed.is_cancelled() {
                return false;
            }
            warn!(error = %err, code = err.code(), "sync: cancel rejected");
            self.state.send_modify(|state| {
                state.loading = false;
                state.apply_failure(&err);
            });
            return false;
        }
        info!("sync: cancel accepted");
        self.stop_polling();

        let fetched = self.fetch().await;
        if self.disposed.is_cancelled() {
            return true;
        }
        let now = now_millis();
        self.state.send_modify(|state| {
            state.loading = false;
            match fetched {
                Ok(snapshot) => state.apply_snapshot(snapshot, false, now),
                Err(err) => state.apply_failure(&err),
            }
        });
        true
    }

    async fn refetch(self: Arc<Self>) -> Option<SyncProgress> {
        let result = self.fetch().await;
        if self.disposed.is_cancelled() {
            return None;
        }
        self.apply_read(result, false).0
    }

    fn stop_polling(&self) {
        let mut slot = self.poll.lock();
        let was_polling = slot.cancel();
        self.state.send_if_modified(|state| {
            state.poll_sequence.advance();
            *self.grace.lock() = GracePolicy::steady();
            std::mem::replace(&mut state.polling, false)
        });
        drop(slot);
        if was_polling {
            debug!("sync: polling stopped");
        }
    }

    fn start_polling(self: &Arc<Self>, policy: GracePolicy) {
        if self.disposed.is_cancelled() {
            return;
        }
        // Generation advance and task swap share the slot lock.
        let mut slot = self.poll.lock();
        let mut token = SequenceToken::default();
        self.state.send_modify(|state| {
            token = state.poll_sequence.advance();
            *self.grace.lock() = policy;
            state.polling = true;
        });
        debug!(
            seq = token.0,
            grace = policy.ticks_remaining(),
            "sync: polling started"
        );

        let weak = Arc::downgrade(self);
        let period = self.settings.poll_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if !inner.poll_once(token).await {
                    break;
                }
            }
        });
        slot.replace(handle);
    }

    /// One poll read. Returns whether the loop should keep going.
    async fn poll_once(&self, token: SequenceToken) -> bool {
        let result = self.fetch().await;
        if self.disposed.is_cancelled() {
            return false;
        }

        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(err) if err.is_cancelled() => return false,
            Err(err) => {
                warn!(error = %err, "sync: poll failed");
                return self.state.send_if_modified(|state| {
                    if !state.poll_sequence.is_current(token) {
                        return false;
                    }
                    state.apply_failure(&err);
                    true
                });
            }
        };

        let status = snapshot.as_ref().map(|progress| progress.status);
        let now = now_millis();
        let mut decision = PollDecision::Stop;
        let applied = self.state.send_if_modified(|state| {
            if !state.poll_sequence.is_current(token) {
                return false;
            }
            decision = self.grace.lock().observe(status);
            match decision {
                PollDecision::Continue { overlay_running } => {
                    state.apply_snapshot(snapshot, overlay_running, now)
                }
                PollDecision::Stop => {
                    state.apply_snapshot(snapshot, false, now);
                    state.polling = false;
                }
            }
            true
        });
        if !applied {
            return false;
        }

        match decision {
            PollDecision::Continue {
                overlay_running: true,
            } => debug!(
                remaining = self.grace.lock().ticks_remaining(),
                "sync: grace tick consumed"
            ),
            PollDecision::Continue { .. } => {}
            PollDecision::Stop => {
                info!(status = ?status, "sync: job settled, polling stopped")
            }
        }
        matches!(decision, PollDecision::Continue { .. })
    }
}

#[cfg(test)]
#[path = "tests/progress_tests.rs"]
mod tests;
