use serde::Serialize;

use crate::provider::ProviderId;
use crate::query::QuerySource;

/// Result count of one provider in a results summary (-1 for an error).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderCount {
    pub provider: ProviderId,
    pub count: i64,
}

/// Side-channel events for product analytics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnalyticsEvent {
    /// A query was established and is being fanned out.
    SearchExecuted { query: String, source: QuerySource },
    /// Every provider dispatched for a token has completed. Transient
    /// queries superseded while typing never produce one.
    SearchResults {
        query: String,
        providers: Vec<ProviderCount>,
    },
}

impl AnalyticsEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SearchExecuted { .. } => "search_executed",
            Self::SearchResults { .. } => "search_results",
        }
    }

    /// Flat key/value form for trackers that only take string properties.
    /// Summaries become comma-joined `providers` and `results` lists.
    pub fn properties(&self) -> Vec<(&'static str, String)> {
        match self {
            Self::SearchExecuted { query, source } => vec![
                ("query", query.clone()),
                ("source", source.analytics_value().to_string()),
            ],
            Self::SearchResults { query, providers } => {
                let names: Vec<&str> = providers.iter().map(|p| p.provider.as_str()).collect();
                let counts: Vec<String> = providers.iter().map(|p| p.count.to_string()).collect();
                vec![
                    ("query", query.clone()),
                    ("providers", names.join(",")),
                    ("results", counts.join(",")),
                ]
            }
        }
    }
}
