use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};

use flurry::analytics::AnalyticsEvent;
use flurry::catalog::CatalogProvider;
use flurry::config::{CatalogConfig, Config};
use flurry::{FlurryError, Hit, Provider, ProviderId, Query, SearchController, SearchObserver};

/// Prints every observer event to stdout as one JSON object per line.
struct JsonLines;

impl JsonLines {
    fn emit(&self, value: serde_json::Value) {
        println!("{value}");
    }
}

impl SearchObserver for JsonLines {
    fn on_query_rewrite_requested(&self, new_query: &str) {
        self.emit(serde_json::json!({ "event": "rewrite", "query": new_query }));
    }

    fn on_results(&self, provider: &ProviderId, query: &Query, results: &[Hit]) {
        self.emit(serde_json::json!({
            "event": "results",
            "provider": provider,
            "query": query,
            "results": results,
        }));
    }

    fn on_error(&self, provider: &ProviderId, query: &Query, error: &FlurryError) {
        if error.is_cancellation() {
            return;
        }
        self.emit(serde_json::json!({
            "event": "error",
            "provider": provider,
            "query": query,
            "message": error.user_message(),
        }));
    }

    fn on_loading_changed(&self, loading: bool) {
        self.emit(serde_json::json!({ "event": "loading", "loading": loading }));
    }

    fn on_analytics(&self, event: &AnalyticsEvent) {
        self.emit(serde_json::json!({ "event": "analytics", "analytics": event }));
    }
}

fn sample_catalogs() -> Vec<CatalogConfig> {
    let catalog = |name: &str, items: &[&str], latency_ms: u64| CatalogConfig {
        name: name.to_string(),
        items: items.iter().map(|s| s.to_string()).collect(),
        min_query_len: 1,
        latency_ms,
        capacity: Some(5),
        exact_match: true,
        yield_to_exact_match: false,
        permissions: Vec::new(),
    };
    let mut contacts = catalog("contacts", &["Pia", "Piotr", "Zoe"], 80);
    contacts.min_query_len = 2;
    contacts.yield_to_exact_match = true;
    vec![
        catalog("apps", &["Pizza Hut", "Maps", "Pinterest", "Pizza"], 20),
        contacts,
        catalog("web", &["pizza near me", "pizza dough recipe", "pi"], 150),
    ]
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    dotenvy::dotenv().ok();

    let mut config = Config::load()?;
    if config.catalogs.is_empty() {
        tracing::info!("no catalogs configured, using built-in samples");
        config.catalogs = sample_catalogs();
    }

    let providers: Vec<Arc<dyn Provider>> = config
        .catalogs
        .iter()
        .cloned()
        .map(|c| Arc::new(CatalogProvider::new(c)) as Arc<dyn Provider>)
        .collect();

    let debounce = config.debounce;
    let controller = SearchController::new(config, providers)?;
    controller.add_observer(Arc::new(JsonLines));

    let permissions = controller.required_permissions();
    if !permissions.is_empty() {
        // The demo host grants everything it is asked for.
        controller.on_permission_results(permissions);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim_end_matches(['\r', '\n']);
        if line == "/submit" {
            controller.submit();
        } else if let Some(name) = line.strip_prefix("/on ") {
            if let Err(e) = controller.set_active(name.trim(), true) {
                tracing::warn!("{e}");
            }
        } else if let Some(name) = line.strip_prefix("/off ") {
            if let Err(e) = controller.set_active(name.trim(), false) {
                tracing::warn!("{e}");
            }
        } else {
            controller.on_text_changed(line);
        }
    }

    // Let in-flight work settle before exiting on EOF.
    let mut loading = controller.loading_changes();
    let settle = async {
        let snapshot = controller.snapshot().await?;
        if snapshot.pending_text.is_some() {
            // Give the dispatch time to fire and its fetches time to start.
            tokio::time::sleep(debounce + std::time::Duration::from_millis(50)).await;
        }
        while *loading.borrow_and_update() {
            if loading.changed().await.is_err() {
                break;
            }
        }
        Ok::<_, FlurryError>(())
    };
    match tokio::time::timeout(std::time::Duration::from_secs(10), settle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("{e}"),
        Err(_) => tracing::warn!("timed out waiting for providers"),
    }

    controller.shutdown();
    tracing::info!("flurry shutting down");
    Ok(())
}
