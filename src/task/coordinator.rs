use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::error::FlurryError;
use crate::provider::{Hit, ProviderId};
use crate::query::Query;
use crate::task::slot::{SlotError, TaskSlot, Ticket};

/// A provider's fetch finished, failed, or was cancelled.
///
/// `ticket` is None for completions synthesized by [`ProviderTasks::abort`];
/// those never went through the slot.
#[derive(Debug)]
pub struct Completion {
    pub provider: ProviderId,
    pub query: Query,
    pub ticket: Option<Ticket>,
    pub outcome: Result<Vec<Hit>, FlurryError>,
}

/// Where coordinators report task lifecycle. `started` is always reported
/// before the matching `completed` for the same provider.
pub trait DiscoverySink: Clone + Send + Sync + 'static {
    fn started(&self, provider: &ProviderId, query: &Query);
    fn completed(&self, completion: Completion);
}

/// Single-flight task slot bound to one provider identity, translating
/// outcomes into started/completed notifications on a sink.
pub struct ProviderTasks<S: DiscoverySink> {
    provider: ProviderId,
    slot: TaskSlot,
    sink: S,
}

impl<S: DiscoverySink> ProviderTasks<S> {
    pub fn new(provider: ProviderId, sink: S, limiter: Arc<Semaphore>) -> Self {
        Self {
            provider,
            slot: TaskSlot::new(limiter),
            sink,
        }
    }

    /// Report "started" for `query`, then run `action` in the slot, replacing
    /// any fetch still in flight.
    pub fn execute<F>(&mut self, query: Query, action: F) -> Ticket
    where
        F: FnOnce(CancellationToken) -> anyhow::Result<Vec<Hit>> + Send + 'static,
    {
        self.sink.started(&self.provider, &query);

        let sink = self.sink.clone();
        let provider = self.provider.clone();
        self.slot.start(action, move |ticket, outcome| {
            let outcome = outcome.map_err(|err| match err {
                SlotError::Action(e) => FlurryError::ProviderFailed {
                    provider: provider.to_string(),
                    message: format!("{e:#}"),
                },
                SlotError::Panicked(message) => FlurryError::ProviderPanicked {
                    provider: provider.to_string(),
                    message,
                },
            });
            sink.completed(Completion {
                provider,
                query,
                ticket: Some(ticket),
                outcome,
            });
        })
    }

    /// Discard the pending fetch. With `notify`, also complete that query
    /// with a cancellation so nobody waits on it; without, this is a silent
    /// teardown.
    pub fn abort(&mut self, notify: Option<&Query>) {
        self.slot.abort();
        if let Some(query) = notify {
            self.sink.completed(Completion {
                provider: self.provider.clone(),
                query: query.clone(),
                ticket: None,
                outcome: Err(FlurryError::Cancelled {
                    provider: self.provider.to_string(),
                }),
            });
        }
    }

    /// Whether a delivered completion is still wanted. Synthesized
    /// completions always are; slot completions only for the live ticket.
    pub fn accept(&mut self, ticket: Option<Ticket>) -> bool {
        ticket.is_none_or(|t| self.slot.complete(t))
    }
}
