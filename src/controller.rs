//! Query dispatcher and the host-facing controller handle.
//!
//! Architecture:
//! - `SearchController` is the public API, holding an `mpsc::UnboundedSender<ControlMessage>`
//! - `Dispatcher` runs on a single tokio task and owns all query state; nothing
//!   else mutates the token, completions or exact matches
//! - Provider fetches run on the blocking pool via each provider's `ProviderTasks`;
//!   their outcomes come back as messages on the same channel, so started and
//!   completed for one provider arrive in order
//! - Debounce is a deadline checked by the dispatcher's `select!` loop; re-arming
//!   replaces the deadline, so only the last input in the window dispatches

use std::collections::{BTreeSet, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::{Semaphore, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::aggregator::{CompletionCount, LoadingState};
use crate::analytics::{AnalyticsEvent, ProviderCount};
use crate::broadcast::ExactMatchSet;
use crate::config::Config;
use crate::error::FlurryError;
use crate::observer::{ObserverId, SearchObserver};
use crate::provider::{FetchContext, Provider, ProviderHandle, ProviderId};
use crate::query::{Query, QuerySource, QueryState, QueryToken, normalize};
use crate::task::coordinator::{Completion, DiscoverySink, ProviderTasks};

pub(crate) enum ControlMessage {
    TextChanged {
        text: String,
        source: Option<QuerySource>,
    },
    Submit,
    SetActive {
        provider: ProviderId,
        active: bool,
    },
    AddObserver {
        id: ObserverId,
        observer: Arc<dyn SearchObserver>,
    },
    RemoveObserver(ObserverId),
    PermissionResults {
        granted: HashSet<String>,
    },
    Started {
        provider: ProviderId,
        query: Query,
    },
    Completed(Completion),
    ExactMatch {
        provider: ProviderId,
        query: Query,
    },
    DeliverExactMatch {
        query: Query,
        reporters: ExactMatchSet,
    },
    RequestDiscovery {
        provider: ProviderId,
        query_update: Option<String>,
    },
    Abort {
        provider: ProviderId,
        query: Query,
    },
    Snapshot(oneshot::Sender<QuerySnapshot>),
}

/// Where the dispatcher is in its debounce/fan-out cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPhase {
    Idle,
    Debouncing,
    Dispatched,
}

/// Point-in-time view of the controller, for hosts and tests.
#[derive(Debug, Clone, Serialize)]
pub struct QuerySnapshot {
    pub text: String,
    pub token: QueryToken,
    pub confirmed: bool,
    pub source: Option<QuerySource>,
    pub phase: DispatchPhase,
    pub loading: bool,
    /// Text waiting for the debounce timer, if armed.
    pub pending_text: Option<String>,
    pub active: Vec<ProviderId>,
    pub exact_matches: Vec<ProviderId>,
    /// Completions recorded for the current token, in registration order.
    pub completions: Vec<ProviderCount>,
}

#[derive(Clone)]
struct ControlSink(mpsc::UnboundedSender<ControlMessage>);

impl DiscoverySink for ControlSink {
    fn started(&self, provider: &ProviderId, query: &Query) {
        let _ = self.0.send(ControlMessage::Started {
            provider: provider.clone(),
            query: query.clone(),
        });
    }

    fn completed(&self, completion: Completion) {
        let _ = self.0.send(ControlMessage::Completed(completion));
    }
}

/// Handle to a running search controller. Clones share the same controller;
/// it stops on `shutdown()` or when the last clone is dropped.
#[derive(Clone)]
pub struct SearchController {
    tx: mpsc::UnboundedSender<ControlMessage>,
    providers: Arc<[Arc<dyn Provider>]>,
    loading: watch::Receiver<bool>,
    next_observer: Arc<AtomicU64>,
    shutdown: CancellationToken,
    _guard: Arc<DropGuard>,
}

impl SearchController {
    /// Register `providers` (in this order) and start the control task.
    /// Must be called inside a tokio runtime. Every provider starts active.
    pub fn new(config: Config, providers: Vec<Arc<dyn Provider>>) -> Result<Self, FlurryError> {
        if providers.is_empty() {
            return Err(FlurryError::NoProviders);
        }
        let mut seen = HashSet::new();
        for provider in &providers {
            if !seen.insert(provider.name().to_string()) {
                return Err(FlurryError::DuplicateProvider(provider.name().to_string()));
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let (loading_tx, loading_rx) = watch::channel(false);
        let limiter = Arc::new(Semaphore::new(config.max_concurrent_fetches.max(1)));
        let shutdown = CancellationToken::new();

        let entries: Vec<ProviderEntry> = providers
            .iter()
            .map(|provider| {
                let id = ProviderId::from(provider.name());
                ProviderEntry {
                    provider: provider.clone(),
                    handle: ProviderHandle::new(id.clone(), tx.clone()),
                    tasks: ProviderTasks::new(id.clone(), ControlSink(tx.clone()), limiter.clone()),
                    active: true,
                    id,
                }
            })
            .collect();

        for entry in &entries {
            guarded(&entry.id, "initialize", || entry.provider.initialize(&entry.handle));
        }

        tracing::info!(
            providers = ?entries.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(),
            debounce_ms = config.debounce.as_millis() as u64,
            max_concurrent_fetches = config.max_concurrent_fetches,
            "search controller starting"
        );

        let dispatcher = Dispatcher {
            config,
            entries,
            state: QueryState::default(),
            loading: LoadingState::default(),
            loading_tx,
            phase: DispatchPhase::Idle,
            pending: None,
            debounce_deadline: None,
            observers: Vec::new(),
            tx: tx.clone(),
        };
        tokio::spawn(dispatcher.run(rx, shutdown.clone()));

        Ok(Self {
            tx,
            providers: providers.into(),
            loading: loading_rx,
            next_observer: Arc::new(AtomicU64::new(1)),
            _guard: Arc::new(shutdown.clone().drop_guard()),
            shutdown,
        })
    }

    /// Feed the latest full text of the search box. Debounced.
    pub fn on_text_changed(&self, text: &str) {
        self.on_text_changed_from(text, None);
    }

    /// Like [`on_text_changed`](Self::on_text_changed), tagging what produced the text.
    pub fn on_text_changed_from(&self, text: &str, source: Option<QuerySource>) {
        self.send(ControlMessage::TextChanged {
            text: normalize(text),
            source,
        });
    }

    /// Explicit search action: skip the debounce and dispatch now as confirmed.
    /// Returns false if the controller is shut down.
    pub fn submit(&self) -> bool {
        self.send(ControlMessage::Submit)
    }

    /// Activate or deactivate one provider. Activating re-runs the current
    /// query for that provider; deactivating drops its outstanding fetch.
    pub fn set_active(&self, provider: &str, active: bool) -> Result<(), FlurryError> {
        if !self.providers.iter().any(|p| p.name() == provider) {
            return Err(FlurryError::UnknownProvider(provider.to_string()));
        }
        if self.send(ControlMessage::SetActive {
            provider: ProviderId::from(provider),
            active,
        }) {
            Ok(())
        } else {
            Err(FlurryError::ControllerClosed)
        }
    }

    pub fn add_observer(&self, observer: Arc<dyn SearchObserver>) -> ObserverId {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        self.send(ControlMessage::AddObserver { id, observer });
        id
    }

    pub fn remove_observer(&self, id: ObserverId) {
        self.send(ControlMessage::RemoveObserver(id));
    }

    /// Union of every provider's required permissions, sorted and de-duplicated.
    pub fn required_permissions(&self) -> Vec<String> {
        self.providers
            .iter()
            .flat_map(|p| p.required_permissions())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Report which permissions the host now holds. Providers with
    /// requirements get their per-permission grant vector.
    pub fn on_permission_results<I, S>(&self, granted: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.send(ControlMessage::PermissionResults {
            granted: granted.into_iter().map(Into::into).collect(),
        });
    }

    pub fn provider_ids(&self) -> Vec<ProviderId> {
        self.providers
            .iter()
            .map(|p| ProviderId::from(p.name()))
            .collect()
    }

    pub fn is_loading(&self) -> bool {
        *self.loading.borrow()
    }

    /// Watch loading flips without registering an observer.
    pub fn loading_changes(&self) -> watch::Receiver<bool> {
        self.loading.clone()
    }

    pub async fn snapshot(&self) -> Result<QuerySnapshot, FlurryError> {
        let (reply, rx) = oneshot::channel();
        if !self.send(ControlMessage::Snapshot(reply)) {
            return Err(FlurryError::ControllerClosed);
        }
        rx.await.map_err(|_| FlurryError::ControllerClosed)
    }

    /// Cancel the debounce timer, drop every outstanding fetch and stop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn send(&self, msg: ControlMessage) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        self.tx.send(msg).is_ok()
    }
}

struct ProviderEntry {
    id: ProviderId,
    provider: Arc<dyn Provider>,
    handle: ProviderHandle,
    tasks: ProviderTasks<ControlSink>,
    active: bool,
}

struct PendingInput {
    text: String,
    source: Option<QuerySource>,
}

struct Dispatcher {
    config: Config,
    entries: Vec<ProviderEntry>,
    state: QueryState,
    loading: LoadingState,
    loading_tx: watch::Sender<bool>,
    phase: DispatchPhase,
    pending: Option<PendingInput>,
    debounce_deadline: Option<Instant>,
    observers: Vec<(ObserverId, Arc<dyn SearchObserver>)>,
    /// Our own mailbox, for work scheduled after the current message.
    tx: mpsc::UnboundedSender<ControlMessage>,
}

impl Dispatcher {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<ControlMessage>,
        shutdown: CancellationToken,
    ) {
        loop {
            let deadline = self.debounce_deadline;
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.debounce_deadline = None;
                    self.on_debounce_elapsed();
                }
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => break,
                },
            }
        }
        self.tear_down();
    }

    fn handle(&mut self, msg: ControlMessage) {
        match msg {
            ControlMessage::TextChanged { text, source } => self.on_text_changed(text, source),
            ControlMessage::Submit => self.on_submit(),
            ControlMessage::SetActive { provider, active } => self.set_active(&provider, active),
            ControlMessage::AddObserver { id, observer } => self.observers.push((id, observer)),
            ControlMessage::RemoveObserver(id) => self.observers.retain(|(oid, _)| *oid != id),
            ControlMessage::PermissionResults { granted } => self.on_permission_results(&granted),
            ControlMessage::Started { provider, query } => self.on_started(provider, &query),
            ControlMessage::Completed(completion) => self.on_completed(completion),
            ControlMessage::ExactMatch { provider, query } => self.on_exact_match(provider, query),
            ControlMessage::DeliverExactMatch { query, reporters } => {
                self.deliver_exact_match(&query, &reporters)
            }
            ControlMessage::RequestDiscovery {
                provider,
                query_update,
            } => self.on_request_discovery(&provider, query_update),
            ControlMessage::Abort { provider, query } => self.on_abort(&provider, &query),
            ControlMessage::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    // -----------------------------------------------------------------------
    // Input and debounce
    // -----------------------------------------------------------------------

    fn on_text_changed(&mut self, text: String, source: Option<QuerySource>) {
        tracing::trace!(text = %text, "text changed, arming debounce");
        self.pending = Some(PendingInput { text, source });
        self.debounce_deadline = Some(Instant::now() + self.config.debounce);
        self.phase = DispatchPhase::Debouncing;
    }

    fn on_debounce_elapsed(&mut self) {
        if let Some(pending) = self.pending.take() {
            self.dispatch(pending.text, pending.source, false);
        }
    }

    fn on_submit(&mut self) {
        self.debounce_deadline = None;
        let text = match self.pending.take() {
            Some(pending) => pending.text,
            None => self.state.text().to_string(),
        };
        self.dispatch(text, Some(QuerySource::Keyboard), true);
    }

    /// Establish a new token and fan the query out to every active provider.
    fn dispatch(&mut self, text: String, source: Option<QuerySource>, confirmed: bool) {
        let query = self.state.establish(text, source, confirmed);
        self.phase = DispatchPhase::Dispatched;
        tracing::debug!(token = %query.token, query = %query.text, confirmed, "dispatching query");

        self.emit_analytics(AnalyticsEvent::SearchExecuted {
            query: query.text.clone(),
            source: source.unwrap_or(QuerySource::Keyboard),
        });

        for idx in 0..self.entries.len() {
            if self.entries[idx].active {
                self.state.completions.expect(self.entries[idx].id.clone());
                self.start_discovery(idx, &query);
            }
        }

        if !self.entries.iter().any(|e| e.active) {
            self.phase = DispatchPhase::Idle;
        }
    }

    /// Run provider-local gating, then either fetch or abort with notification.
    fn start_discovery(&mut self, idx: usize, query: &Query) {
        let entry = &mut self.entries[idx];
        let valid = guarded(&entry.id, "is_query_valid", || {
            entry.provider.is_query_valid(query)
        })
        .unwrap_or(false);

        if !valid {
            tracing::debug!(provider = %entry.id, token = %query.token, "query not valid for provider");
            entry.tasks.abort(Some(query));
            return;
        }

        let provider = entry.provider.clone();
        let handle = entry.handle.clone();
        let capacity = provider.capacity();
        let fetch_query = query.clone();
        entry.tasks.execute(query.clone(), move |cancel| {
            let ctx = FetchContext::new(fetch_query, handle, cancel);
            provider.fetch(&ctx, capacity)
        });
    }

    // -----------------------------------------------------------------------
    // Provider lifecycle
    // -----------------------------------------------------------------------

    fn on_started(&mut self, provider: ProviderId, query: &Query) {
        if !self.state.is_current(query.token) || !self.state.completions.is_expected(&provider) {
            tracing::trace!(provider = %provider, token = %query.token, "ignoring stale start");
            return;
        }
        tracing::debug!(provider = %provider, token = %query.token, query = %query.text, "discovery started");
        self.state.completions.reopen(&provider);
        self.set_loading(true);
    }

    fn on_completed(&mut self, completion: Completion) {
        let Completion {
            provider,
            query,
            ticket,
            outcome,
        } = completion;

        let Some(idx) = self.index_of(&provider) else {
            return;
        };
        if !self.entries[idx].tasks.accept(ticket) {
            tracing::trace!(provider = %provider, token = %query.token, "dropping superseded completion");
            return;
        }
        if !self.state.is_current(query.token) {
            tracing::debug!(provider = %provider, token = %query.token, current = %self.state.token(), "dropping stale completion");
            return;
        }

        let count = match &outcome {
            Ok(hits) => CompletionCount::Results(hits.len()),
            Err(_) => CompletionCount::Error,
        };
        if !self.state.completions.record(provider.clone(), count) {
            tracing::debug!(provider = %provider, "completion from provider outside this fan-out");
            return;
        }

        match &outcome {
            Ok(hits) => {
                tracing::debug!(provider = %provider, token = %query.token, count = hits.len(), "discovery completed");
                self.notify("on_results", |o| o.on_results(&provider, &query, hits));
            }
            Err(err) => {
                match err {
                    FlurryError::Cancelled { .. } => {
                        tracing::debug!(provider = %provider, token = %query.token, "discovery cancelled")
                    }
                    FlurryError::ProviderPanicked { message, .. } => {
                        tracing::error!(provider = %provider, token = %query.token, "provider panicked: {message}")
                    }
                    other => {
                        tracing::warn!(provider = %provider, token = %query.token, "discovery failed: {other}")
                    }
                }
                self.notify("on_error", |o| o.on_error(&provider, &query, err));
            }
        }

        self.settle();
    }

    /// If every expected provider has completed, drop loading and emit the
    /// token's results summary (once).
    fn settle(&mut self) {
        if !self.state.completions.is_settled() {
            return;
        }
        self.set_loading(false);
        if self.phase == DispatchPhase::Dispatched {
            self.phase = DispatchPhase::Idle;
        }
        let summary = self
            .state
            .completions
            .claim_summary(self.entries.iter().map(|e| &e.id));
        if let Some(providers) = summary {
            self.emit_analytics(AnalyticsEvent::SearchResults {
                query: self.state.text().to_string(),
                providers,
            });
        }
    }

    fn set_loading(&mut self, loading: bool) {
        if !self.loading.set(loading) {
            return;
        }
        tracing::debug!(loading, "loading state changed");
        self.loading_tx.send_replace(loading);
        self.notify("on_loading_changed", |o| o.on_loading_changed(loading));
    }

    fn emit_analytics(&self, event: AnalyticsEvent) {
        tracing::info!(event = event.name(), properties = ?event.properties(), "analytics");
        self.notify("on_analytics", |o| o.on_analytics(&event));
    }

    // -----------------------------------------------------------------------
    // Exact matches
    // -----------------------------------------------------------------------

    fn on_exact_match(&mut self, provider: ProviderId, query: Query) {
        if !self.state.is_current(query.token) {
            tracing::trace!(provider = %provider, token = %query.token, "ignoring stale exact match");
            return;
        }
        tracing::debug!(provider = %provider, token = %query.token, "exact match reported");
        let reporters = self.state.exact_matches.report(provider);
        // Providers may be mid-way through producing results; deliver on a later turn.
        let _ = self
            .tx
            .send(ControlMessage::DeliverExactMatch { query, reporters });
    }

    /// Every accepted report is delivered, even if a newer query was
    /// dispatched meanwhile. Provider reactions carry the old token and are
    /// filtered where they land (see `on_abort`).
    fn deliver_exact_match(&mut self, query: &Query, reporters: &ExactMatchSet) {
        for entry in &self.entries {
            guarded(&entry.id, "on_exact_match", || {
                entry.provider.on_exact_match(query, reporters, &entry.handle)
            });
        }
    }

    // -----------------------------------------------------------------------
    // Provider requests
    // -----------------------------------------------------------------------

    fn on_request_discovery(&mut self, provider: &ProviderId, query_update: Option<String>) {
        tracing::debug!(provider = %provider, update = ?query_update, "discovery requested");
        match query_update {
            Some(update) if update != self.state.text() => {
                self.notify("on_query_rewrite_requested", |o| {
                    o.on_query_rewrite_requested(&update)
                });
            }
            _ => {
                let Some(idx) = self.index_of(provider) else {
                    return;
                };
                // Nothing has been dispatched yet; the first dispatch will include it.
                if !self.entries[idx].active || self.state.token() == QueryToken::default() {
                    return;
                }
                let query = self.state.current();
                self.state.completions.expect(provider.clone());
                self.start_discovery(idx, &query);
            }
        }
    }

    fn on_abort(&mut self, provider: &ProviderId, query: &Query) {
        // An abort for an old token must not kill the fetch for the current one.
        if !self.state.is_current(query.token) {
            return;
        }
        if let Some(idx) = self.index_of(provider) {
            tracing::debug!(provider = %provider, token = %query.token, "provider aborted its discovery");
            self.entries[idx].tasks.abort(Some(query));
        }
    }

    fn set_active(&mut self, provider: &ProviderId, active: bool) {
        let Some(idx) = self.index_of(provider) else {
            return;
        };
        if self.entries[idx].active == active {
            return;
        }
        self.entries[idx].active = active;
        tracing::debug!(provider = %provider, active, "provider activation changed");

        if active {
            if self.state.token() == QueryToken::default() {
                return;
            }
            // Catch up on the current query without a new token.
            let query = self.state.current();
            self.state.completions.expect(provider.clone());
            self.start_discovery(idx, &query);
        } else {
            self.entries[idx].tasks.abort(None);
            self.state.completions.forget(provider);
            self.settle();
        }
    }

    fn on_permission_results(&mut self, granted: &HashSet<String>) {
        for entry in &self.entries {
            let required = entry.provider.required_permissions();
            if required.is_empty() {
                continue;
            }
            let grants: Vec<bool> = required.iter().map(|p| granted.contains(p)).collect();
            tracing::debug!(provider = %entry.id, ?grants, "permission results");
            guarded(&entry.id, "on_permission_result", || {
                entry.provider.on_permission_result(&grants, &entry.handle)
            });
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Run `f` for every observer. A panicking observer is logged and skipped.
    fn notify(&self, callback: &'static str, f: impl Fn(&dyn SearchObserver)) {
        for (id, observer) in &self.observers {
            if std::panic::catch_unwind(AssertUnwindSafe(|| f(observer.as_ref()))).is_err() {
                tracing::error!(observer = id.0, callback, "observer callback panicked");
            }
        }
    }

    fn index_of(&self, provider: &ProviderId) -> Option<usize> {
        self.entries.iter().position(|e| &e.id == provider)
    }

    fn snapshot(&self) -> QuerySnapshot {
        QuerySnapshot {
            text: self.state.text().to_string(),
            token: self.state.token(),
            confirmed: self.state.confirmed(),
            source: self.state.source(),
            phase: self.phase,
            loading: self.loading.get(),
            pending_text: self.pending.as_ref().map(|p| p.text.clone()),
            active: self
                .entries
                .iter()
                .filter(|e| e.active)
                .map(|e| e.id.clone())
                .collect(),
            exact_matches: self.state.exact_matches.iter().cloned().collect(),
            completions: self
                .entries
                .iter()
                .filter_map(|e| {
                    self.state.completions.get(&e.id).map(|c| ProviderCount {
                        provider: e.id.clone(),
                        count: c.as_i64(),
                    })
                })
                .collect(),
        }
    }

    fn tear_down(&mut self) {
        self.debounce_deadline = None;
        self.pending = None;
        for entry in &mut self.entries {
            entry.tasks.abort(None);
        }
        tracing::info!("search controller stopped");
    }
}

/// Run a provider callback on the control task, containing any panic so one
/// provider cannot take the controller down.
fn guarded<R>(provider: &ProviderId, callback: &'static str, f: impl FnOnce() -> R) -> Option<R> {
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::error!(provider = %provider, callback, "provider callback panicked");
            None
        }
    }
}
