//! In-memory provider over a fixed list of labels.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::broadcast::ExactMatchSet;
use crate::config::CatalogConfig;
use crate::provider::{FetchContext, Hit, Provider, ProviderHandle, ProviderId};
use crate::query::{Query, normalize};

/// Latency is slept in slices this long so cancellation is noticed quickly.
const LATENCY_SLICE: Duration = Duration::from_millis(5);

/// Case-insensitive substring search over configured items.
#[derive(Debug)]
pub struct CatalogProvider {
    config: CatalogConfig,
    /// Lowercased copies of `config.items`, same order.
    keys: Vec<String>,
    /// Starts true when no permissions are required.
    permitted: AtomicBool,
}

impl CatalogProvider {
    pub fn new(config: CatalogConfig) -> Self {
        let keys = config.items.iter().map(|item| normalize(item)).collect();
        let permitted = AtomicBool::new(config.permissions.is_empty());
        Self {
            config,
            keys,
            permitted,
        }
    }

    pub fn is_permitted(&self) -> bool {
        self.permitted.load(Ordering::Acquire)
    }

    fn matches(&self, text: &str, capacity: usize) -> Vec<Hit> {
        self.keys
            .iter()
            .zip(&self.config.items)
            .filter(|(key, _)| key.contains(text))
            .take(capacity)
            .map(|(key, item)| {
                Hit::new(item.clone()).with_payload(serde_json::json!({
                    "catalog": self.config.name,
                    "exact": key == text,
                }))
            })
            .collect()
    }

    /// Returns false if cancelled while waiting.
    fn simulate_latency(&self, ctx: &FetchContext) -> bool {
        if self.config.latency_ms == 0 {
            return !ctx.is_cancelled();
        }
        let deadline = Instant::now() + Duration::from_millis(self.config.latency_ms);
        loop {
            if ctx.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(LATENCY_SLICE.min(deadline - now));
        }
    }
}

impl Provider for CatalogProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn is_query_valid(&self, query: &Query) -> bool {
        self.is_permitted() && query.text.chars().count() >= self.config.min_query_len.max(1)
    }

    fn capacity(&self) -> usize {
        self.config.capacity.unwrap_or(usize::MAX)
    }

    fn fetch(&self, ctx: &FetchContext, capacity: usize) -> anyhow::Result<Vec<Hit>> {
        if !self.simulate_latency(ctx) {
            tracing::trace!(catalog = %self.config.name, "fetch cancelled during latency");
            return Ok(Vec::new());
        }

        let text = &ctx.query().text;
        let hits = self.matches(text, capacity);
        if self.config.exact_match && self.keys.iter().any(|key| key == text) {
            ctx.report_exact_match();
        }
        Ok(hits)
    }

    fn on_exact_match(&self, query: &Query, reporters: &ExactMatchSet, handle: &ProviderHandle) {
        if !self.config.yield_to_exact_match {
            return;
        }
        let me = ProviderId::from(self.config.name.as_str());
        if reporters.iter().any(|p| *p != me) {
            tracing::debug!(catalog = %self.config.name, token = %query.token, "yielding to exact match");
            handle.abort(query);
        }
    }

    fn required_permissions(&self) -> Vec<String> {
        self.config.permissions.clone()
    }

    fn on_permission_result(&self, granted: &[bool], handle: &ProviderHandle) {
        let all = granted.iter().all(|g| *g);
        let was = self.permitted.swap(all, Ordering::AcqRel);
        if all && !was {
            handle.request_discovery(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryState;
    use tokio_util::sync::CancellationToken;

    fn catalog(items: &[&str]) -> CatalogConfig {
        CatalogConfig {
            name: "apps".to_string(),
            items: items.iter().map(|s| s.to_string()).collect(),
            min_query_len: 1,
            latency_ms: 0,
            capacity: None,
            exact_match: true,
            yield_to_exact_match: false,
            permissions: Vec::new(),
        }
    }

    fn ctx(text: &str) -> FetchContext {
        let query = QueryState::default().establish(text.to_string(), None, false);
        FetchContext::new(
            query,
            ProviderHandle::detached("apps"),
            CancellationToken::new(),
        )
    }

    #[test]
    fn matches_case_insensitive_substrings_in_order() {
        let provider = CatalogProvider::new(catalog(&["Pizza Hut", "Maps", "Pizzeria"]));
        let hits = provider.fetch(&ctx("pizz"), usize::MAX).unwrap();
        let labels: Vec<&str> = hits.iter().map(|h| h.label.as_str()).collect();
        assert_eq!(labels, vec!["Pizza Hut", "Pizzeria"]);
        assert_eq!(hits[0].payload["exact"], false);
    }

    #[test]
    fn capacity_caps_results() {
        let mut config = catalog(&["a1", "a2", "a3"]);
        config.capacity = Some(2);
        let provider = CatalogProvider::new(config);
        let cap = provider.capacity();
        assert_eq!(provider.fetch(&ctx("a"), cap).unwrap().len(), 2);
    }

    #[test]
    fn min_query_len_gates_validity() {
        let mut config = catalog(&["pia"]);
        config.min_query_len = 3;
        let provider = CatalogProvider::new(config);
        let mut state = QueryState::default();
        assert!(!provider.is_query_valid(&state.establish("pi".into(), None, false)));
        assert!(provider.is_query_valid(&state.establish("pia".into(), None, false)));
        assert!(!provider.is_query_valid(&state.establish(String::new(), None, false)));
    }

    #[test]
    fn permissions_gate_until_granted() {
        let mut config = catalog(&["pia"]);
        config.permissions = vec!["read_contacts".to_string()];
        let provider = CatalogProvider::new(config);
        let query = QueryState::default().establish("pia".into(), None, false);
        assert!(!provider.is_query_valid(&query));

        let handle = ProviderHandle::detached("apps");
        provider.on_permission_result(&[true], &handle);
        assert!(provider.is_query_valid(&query));

        provider.on_permission_result(&[false], &handle);
        assert!(!provider.is_query_valid(&query));
    }

    #[test]
    fn cancelled_fetch_returns_early() {
        let mut config = catalog(&["pizza"]);
        config.latency_ms = 10_000;
        let provider = CatalogProvider::new(config);
        let ctx = ctx("pizza");
        ctx.cancellation().cancel();

        let started = Instant::now();
        let hits = provider.fetch(&ctx, usize::MAX).unwrap();
        assert!(hits.is_empty());
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
