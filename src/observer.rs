use crate::analytics::AnalyticsEvent;
use crate::error::FlurryError;
use crate::provider::{Hit, ProviderId};
use crate::query::Query;

/// Host-side listener for controller events. Called on the control task, in
/// the order events were accepted; keep implementations quick.
pub trait SearchObserver: Send + Sync {
    /// A provider asked for the visible query to be replaced (e.g. an
    /// autosuggest click). The host should apply it and feed it back through
    /// `on_text_changed`.
    fn on_query_rewrite_requested(&self, new_query: &str);

    fn on_results(&self, _provider: &ProviderId, _query: &Query, _results: &[Hit]) {}

    /// Includes cancellations; check [`FlurryError::is_cancellation`] to skip them.
    fn on_error(&self, _provider: &ProviderId, _query: &Query, _error: &FlurryError) {}

    fn on_loading_changed(&self, _loading: bool) {}

    fn on_analytics(&self, _event: &AnalyticsEvent) {}
}

/// Returned by `add_observer`, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(pub(crate) u64);
