#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use flurry::analytics::AnalyticsEvent;
use flurry::broadcast::ExactMatchSet;
use flurry::config::Config;
use flurry::{
    FetchContext, FlurryError, Hit, Provider, ProviderHandle, ProviderId, Query, SearchController,
    SearchObserver,
};

pub const WAIT: Duration = Duration::from_secs(3);

// ---------------------------------------------------------------------------
// Observer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Event {
    Results {
        provider: String,
        query: Query,
        labels: Vec<String>,
    },
    Error {
        provider: String,
        query: Query,
        cancelled: bool,
        message: String,
    },
    Loading(bool),
    Analytics(AnalyticsEvent),
    Rewrite(String),
}

pub struct Recorder(mpsc::UnboundedSender<Event>);

pub fn recorder() -> (Arc<Recorder>, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(Recorder(tx)), rx)
}

impl SearchObserver for Recorder {
    fn on_query_rewrite_requested(&self, new_query: &str) {
        let _ = self.0.send(Event::Rewrite(new_query.to_string()));
    }

    fn on_results(&self, provider: &ProviderId, query: &Query, results: &[Hit]) {
        let _ = self.0.send(Event::Results {
            provider: provider.to_string(),
            query: query.clone(),
            labels: results.iter().map(|h| h.label.clone()).collect(),
        });
    }

    fn on_error(&self, provider: &ProviderId, query: &Query, error: &FlurryError) {
        let _ = self.0.send(Event::Error {
            provider: provider.to_string(),
            query: query.clone(),
            cancelled: error.is_cancellation(),
            message: error.to_string(),
        });
    }

    fn on_loading_changed(&self, loading: bool) {
        let _ = self.0.send(Event::Loading(loading));
    }

    fn on_analytics(&self, event: &AnalyticsEvent) {
        let _ = self.0.send(Event::Analytics(event.clone()));
    }
}

// ---------------------------------------------------------------------------
// Scripted provider
// ---------------------------------------------------------------------------

/// A closed gate holds a fetch until opened or cancelled.
pub fn gate() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}

pub fn open(gate: &AtomicBool) {
    gate.store(true, Ordering::Release);
}

pub struct Scripted {
    name: String,
    results: Vec<String>,
    min_len: usize,
    latency: Duration,
    ignore_cancel: bool,
    gate: Option<Arc<AtomicBool>>,
    fail: Option<String>,
    panic: bool,
    exact: bool,
    yield_on_exact: bool,
    permissions: Vec<String>,
    pub fetches: Mutex<Vec<Query>>,
    pub exact_calls: Mutex<Vec<(Query, Vec<String>)>>,
    pub permission_calls: Mutex<Vec<Vec<bool>>>,
    pub saw_cancel: AtomicBool,
    handle: Mutex<Option<ProviderHandle>>,
}

impl Scripted {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            results: Vec::new(),
            min_len: 1,
            latency: Duration::ZERO,
            ignore_cancel: false,
            gate: None,
            fail: None,
            panic: false,
            exact: false,
            yield_on_exact: false,
            permissions: Vec::new(),
            fetches: Mutex::new(Vec::new()),
            exact_calls: Mutex::new(Vec::new()),
            permission_calls: Mutex::new(Vec::new()),
            saw_cancel: AtomicBool::new(false),
            handle: Mutex::new(None),
        }
    }

    pub fn results(mut self, labels: &[&str]) -> Self {
        self.results = labels.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn min_len(mut self, n: usize) -> Self {
        self.min_len = n;
        self
    }

    pub fn latency_ms(mut self, ms: u64) -> Self {
        self.latency = Duration::from_millis(ms);
        self
    }

    pub fn ignoring_cancel(mut self) -> Self {
        self.ignore_cancel = true;
        self
    }

    pub fn gated(mut self, gate: &Arc<AtomicBool>) -> Self {
        self.gate = Some(gate.clone());
        self
    }

    pub fn failing(mut self, message: &str) -> Self {
        self.fail = Some(message.to_string());
        self
    }

    pub fn panicking(mut self) -> Self {
        self.panic = true;
        self
    }

    pub fn reporting_exact(mut self) -> Self {
        self.exact = true;
        self
    }

    pub fn yielding(mut self) -> Self {
        self.yield_on_exact = true;
        self
    }

    pub fn permissions(mut self, names: &[&str]) -> Self {
        self.permissions = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn build(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn fetched_texts(&self) -> Vec<String> {
        self.fetches
            .lock()
            .unwrap()
            .iter()
            .map(|q| q.text.clone())
            .collect()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().unwrap().len()
    }

    pub fn handle(&self) -> ProviderHandle {
        self.handle.lock().unwrap().clone().expect("initialized")
    }

    pub fn saw_cancel(&self) -> bool {
        self.saw_cancel.load(Ordering::Acquire)
    }

    fn cancelled(&self, ctx: &FetchContext) -> bool {
        if ctx.is_cancelled() {
            self.saw_cancel.store(true, Ordering::Release);
            return true;
        }
        false
    }
}

impl Provider for Scripted {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&self, handle: &ProviderHandle) {
        *self.handle.lock().unwrap() = Some(handle.clone());
    }

    fn is_query_valid(&self, query: &Query) -> bool {
        query.text.chars().count() >= self.min_len
    }

    fn fetch(&self, ctx: &FetchContext, capacity: usize) -> anyhow::Result<Vec<Hit>> {
        self.fetches.lock().unwrap().push(ctx.query().clone());

        if let Some(gate) = &self.gate {
            while !gate.load(Ordering::Acquire) {
                if self.cancelled(ctx) {
                    return Ok(Vec::new());
                }
                std::thread::sleep(Duration::from_millis(2));
            }
        }

        let deadline = Instant::now() + self.latency;
        while Instant::now() < deadline {
            if self.cancelled(ctx) && !self.ignore_cancel {
                return Ok(Vec::new());
            }
            std::thread::sleep(Duration::from_millis(2));
        }

        if self.panic {
            panic!("scripted panic in {}", self.name);
        }
        if let Some(message) = &self.fail {
            anyhow::bail!("{message}");
        }
        if self.exact {
            ctx.report_exact_match();
        }
        Ok(self
            .results
            .iter()
            .take(capacity)
            .map(|label| Hit::new(label.clone()))
            .collect())
    }

    fn on_exact_match(&self, query: &Query, reporters: &ExactMatchSet, handle: &ProviderHandle) {
        let names: Vec<String> = reporters.iter().map(|p| p.to_string()).collect();
        self.exact_calls
            .lock()
            .unwrap()
            .push((query.clone(), names.clone()));
        if self.yield_on_exact && names.iter().any(|n| *n != self.name) {
            handle.abort(query);
        }
    }

    fn required_permissions(&self) -> Vec<String> {
        self.permissions.clone()
    }

    fn on_permission_result(&self, granted: &[bool], handle: &ProviderHandle) {
        self.permission_calls.lock().unwrap().push(granted.to_vec());
        handle.request_discovery(None);
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub fn start(
    debounce_ms: u64,
    providers: &[&Arc<Scripted>],
) -> (SearchController, mpsc::UnboundedReceiver<Event>) {
    let config = Config::default().with_debounce(Duration::from_millis(debounce_ms));
    let providers: Vec<Arc<dyn Provider>> = providers
        .iter()
        .map(|p| Arc::clone(*p) as Arc<dyn Provider>)
        .collect();
    let controller = SearchController::new(config, providers).unwrap();
    let (observer, rx) = recorder();
    controller.add_observer(observer);
    (controller, rx)
}

/// Collect events up to and including the first one matching `pred`.
pub async fn until(
    rx: &mut mpsc::UnboundedReceiver<Event>,
    mut pred: impl FnMut(&Event) -> bool,
) -> Vec<Event> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(WAIT, rx.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for event; seen so far: {seen:#?}"))
            .expect("observer channel closed");
        let done = pred(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

/// Everything that arrives within `window`.
pub async fn drain_for(rx: &mut mpsc::UnboundedReceiver<Event>, window: Duration) -> Vec<Event> {
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, rx.recv()).await {
        seen.push(event);
    }
    seen
}

/// Poll a condition set from another thread.
pub async fn eventually(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn is_summary(event: &Event) -> bool {
    matches!(event, Event::Analytics(AnalyticsEvent::SearchResults { .. }))
}

pub fn summaries(events: &[Event]) -> Vec<(String, Vec<(String, i64)>)> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Analytics(AnalyticsEvent::SearchResults { query, providers }) => Some((
                query.clone(),
                providers
                    .iter()
                    .map(|p| (p.provider.to_string(), p.count))
                    .collect(),
            )),
            _ => None,
        })
        .collect()
}

pub fn executed(events: &[Event]) -> Vec<AnalyticsEvent> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Analytics(event @ AnalyticsEvent::SearchExecuted { .. }) => Some(event.clone()),
            _ => None,
        })
        .collect()
}

pub fn counts(pairs: &[(&str, i64)]) -> Vec<(String, i64)> {
    pairs.iter().map(|(p, c)| (p.to_string(), *c)).collect()
}
