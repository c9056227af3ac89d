use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use shared::{
    domain::FileId,
    protocol::{IndexDocument, SearchResponse},
};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    error::TransportError,
    schedule::{DelayTimer, Sequence, SequenceToken},
    transport::{get_json, QueryParams, RequestOptions, Transport},
};

pub const SEARCH_PATH: &str = "/api/v1/app/search";
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(280);
pub const DEFAULT_PAGE_SIZE: u32 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchSettings {
    pub debounce: Duration,
    pub page_size: u32,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchState {
    pub query: String,
    pub page: u32,
    pub items: Vec<IndexDocument>,
    pub total: u64,
    pub loading: bool,
    pub error: Option<String>,
    /// Query the displayed items were fetched for; `load_more` pages this one.
    result_query: String,
    sequence: Sequence,
}

impl Default for SearchState {
    fn default() -> Self {
        Self {
            query: String::new(),
            page: 1,
            items: Vec::new(),
            total: 0,
            loading: false,
            error: None,
            result_query: String::new(),
            sequence: Sequence::default(),
        }
    }
}

impl SearchState {
    pub fn has_more(&self) -> bool {
        (self.items.len() as u64) < self.total
    }

    pub fn in_flight_sequence(&self) -> SequenceToken {
        self.sequence.current()
    }

    fn clear_results(&mut self) {
        self.items.clear();
        self.total = 0;
        self.page = 1;
        self.loading = false;
        self.error = None;
        self.result_query.clear();
    }

    fn begin_request(&mut self) -> SequenceToken {
        self.loading = true;
        self.error = None;
        self.sequence.advance()
    }

    /// Applies a response if `token` is still the newest request. Returns
    /// whether anything changed.
    pub(crate) fn apply_response(
        &mut self,
        token: SequenceToken,
        query: &str,
        page: u32,
        append: bool,
        result: Result<SearchResponse, TransportError>,
    ) -> bool {
        if !self.sequence.is_current(token) {
            return false;
        }

        match result {
            Ok(response) => {
                if !append {
                    self.items.clear();
                }
                merge_unique(&mut self.items, response.items);
                self.total = response.total.max(self.items.len() as u64);
                self.page = page;
                self.result_query = query.to_string();
                self.error = None;
            }
            Err(err) if err.is_cancelled() => {}
            Err(err) => self.error = Some(err.to_string()),
        }
        self.loading = false;
        true
    }
}

fn merge_unique(items: &mut Vec<IndexDocument>, incoming: Vec<IndexDocument>) {
    let mut seen: HashSet<FileId> = items.iter().map(IndexDocument::key).collect();
    items.extend(incoming.into_iter().filter(|item| seen.insert(item.key())));
}

struct InFlight {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct SearchInner {
    transport: Arc<dyn Transport>,
    settings: SearchSettings,
    state: watch::Sender<SearchState>,
    debounce: Mutex<DelayTimer>,
    /// Bumped whenever a pending debounce is superseded.
    debounce_generation: AtomicU64,
    in_flight: Mutex<Option<InFlight>>,
    disposed: CancellationToken,
}

/// Debounced, paginated search over the index service.
///
/// Must be used from within a tokio runtime. Dropping the controller disposes
/// it.
pub struct SearchController {
    inner: Arc<SearchInner>,
}

impl SearchController {
    pub fn new(transport: Arc<dyn Transport>, settings: SearchSettings) -> Self {
        let (state, _) = watch::channel(SearchState::default());
        Self {
            inner: Arc::new(SearchInner {
                transport,
                settings,
                state,
                debounce: Mutex::new(DelayTimer::default()),
                debounce_generation: AtomicU64::new(0),
                in_flight: Mutex::new(None),
                disposed: CancellationToken::new(),
            }),
        }
    }

    pub fn state(&self) -> SearchState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SearchState> {
        self.inner.state.subscribe()
    }

    pub fn set_query(&self, text: impl Into<String>) {
        if self.inner.disposed.is_cancelled() {
            return;
        }
        let text = text.into();
        let mut debounce = self.inner.debounce.lock();
        debounce.cancel();
        let generation = self.inner.supersede_debounce();

        if text.trim().is_empty() {
            self.inner.cancel_in_flight();
            self.inner.state.send_modify(|state| {
                state.sequence.advance();
                state.clear_results();
                state.query = text;
            });
            return;
        }

        self.inner.state.send_modify(|state| state.query = text.clone());
        let weak = Arc::downgrade(&self.inner);
        debounce.start(self.inner.settings.debounce, async move {
            if let Some(inner) = weak.upgrade() {
                inner.do_search(text, 1, false, Some(generation));
            }
        });
    }

    pub fn search_immediate(&self, text: impl Into<String>) {
        if self.inner.disposed.is_cancelled() {
            return;
        }
        let text = text.into();
        self.inner.debounce.lock().cancel();
        self.inner.supersede_debounce();
        self.inner
            .state
            .send_modify(|state| state.query = text.clone());
        self.inner.do_search(text, 1, false, None);
    }

    /// Fetches the next page. Returns false when the guard turned it into a
    /// no-op.
    pub fn load_more(&self) -> bool {
        if self.inner.disposed.is_cancelled() {
            return false;
        }
        let (query, next_page) = {
            let state = self.inner.state.borrow();
            if state.loading || !state.has_more() || state.result_query.trim().is_empty() {
                return false;
            }
            (state.result_query.clone(), state.page + 1)
        };
        self.inner.do_search(query, next_page, true, None);
        true
    }

    pub fn reset(&self) {
        if self.inner.disposed.is_cancelled() {
            return;
        }
        self.inner.debounce.lock().cancel();
        self.inner.supersede_debounce();
        self.inner.cancel_in_flight();
        self.inner.state.send_modify(|state| {
            state.sequence.advance();
            state.clear_results();
            state.query.clear();
        });
    }

    pub fn dispose(&self) {
        if self.inner.disposed.is_cancelled() {
            return;
        }
        self.inner.disposed.cancel();
        self.inner.debounce.lock().cancel();
        self.inner.supersede_debounce();
        self.inner.cancel_in_flight();
        debug!("search: controller disposed");
    }
}

impl Drop for SearchController {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl SearchInner {
    fn supersede_debounce(&self) -> u64 {
        self.debounce_generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn cancel_in_flight(&self) {
        if let Some(in_flight) = self.in_flight.lock().take() {
            in_flight.cancel.cancel();
            in_flight.task.abort();
        }
    }

    /// `debounced` carries the generation a fired debounce timer was started
    /// under; the search is skipped if a later edit superseded it.
    fn do_search(
        self: &Arc<Self>,
        query: String,
        page: u32,
        append: bool,
        debounced: Option<u64>,
    ) {
        if self.disposed.is_cancelled() || query.trim().is_empty() {
            return;
        }

        let mut in_flight = self.in_flight.lock();
        if debounced.is_some_and(|generation| {
            generation != self.debounce_generation.load(Ordering::SeqCst)
        }) {
            debug!(query = %query, "search: debounce superseded before dispatch");
            return;
        }
        if let Some(previous) = in_flight.take() {
            // The superseded task keeps running until the transport notices;
            // its response is dropped by the sequence check.
            previous.cancel.cancel();
        }

        let mut token = SequenceToken::default();
        self.state.send_modify(|state| token = state.begin_request());

        let cancel = self.disposed.child_token();
        let request_cancel = cancel.clone();
        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            debug!(query = %query, page, seq = token.0, "search: dispatching request");
            let params = QueryParams::new()
                .with("query", &query)
                .with("page", page)
                .with("page_size", inner.settings.page_size);
            let options = RequestOptions::new().with_cancel(request_cancel);
            let result = get_json::<SearchResponse>(
                inner.transport.as_ref(),
                SEARCH_PATH,
                &params,
                options,
            )
            .await;
            inner.commit(token, &query, page, append, result);
        });

        *in_flight = Some(InFlight {
            cancel,
            task: handle,
        });
    }

    fn commit(
        &self,
        token: SequenceToken,
        query: &str,
        page: u32,
        append: bool,
        result: Result<SearchResponse, TransportError>,
    ) {
        if self.disposed.is_cancelled() {
            return;
        }
        let failure = result
            .as_ref()
            .err()
            .filter(|err| !err.is_cancelled())
            .map(ToString::to_string);

        let applied = self
            .state
            .send_if_modified(|state| state.apply_response(token, query, page, append, result));

        match (applied, failure) {
            (true, Some(message)) => {
                warn!(query = %query, page, error = %message, "search: request failed")
            }
            (true, None) => debug!(query = %query, page, seq = token.0, "search: applied response"),
            (false, _) => debug!(seq = token.0, "search: discarded stale response"),
        }
    }
}

#[cfg(test)]
#[path = "tests/search_tests.rs"]
mod tests;
