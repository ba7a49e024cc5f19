use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::broadcast::ExactMatchSet;
use crate::controller::ControlMessage;
use crate::query::Query;

/// Stable identity of a registered provider (its name).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(Arc<str>);

impl ProviderId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ProviderId {
    fn from(name: &str) -> Self {
        Self(Arc::from(name))
    }
}

impl From<String> for ProviderId {
    fn from(name: String) -> Self {
        Self(Arc::from(name))
    }
}

impl Borrow<str> for ProviderId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One result item. The payload is opaque to the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    pub label: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

impl Hit {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// A search source plugged into the controller.
///
/// Everything except `fetch` is called on the controller's control task and
/// must return quickly. `fetch` runs on the blocking worker pool and may block
/// for as long as it needs; it should poll `ctx.is_cancelled()` when it can.
pub trait Provider: Send + Sync + 'static {
    /// Unique, stable name. Used as the provider identity.
    fn name(&self) -> &str;

    /// Called once at registration with the provider's handle back into the controller.
    fn initialize(&self, _handle: &ProviderHandle) {}

    /// Provider-local gating. An invalid query aborts any outstanding fetch and
    /// completes this provider with a cancellation for the query's token.
    fn is_query_valid(&self, query: &Query) -> bool {
        !query.text.is_empty()
    }

    /// Max number of results worth fetching.
    fn capacity(&self) -> usize {
        usize::MAX
    }

    fn fetch(&self, ctx: &FetchContext, capacity: usize) -> anyhow::Result<Vec<Hit>>;

    /// One or more providers found an exact match for `query`. May be called
    /// several times per token, always with the full set; `reporters` can
    /// include this provider.
    fn on_exact_match(&self, _query: &Query, _reporters: &ExactMatchSet, _handle: &ProviderHandle) {}

    fn required_permissions(&self) -> Vec<String> {
        Vec::new()
    }

    /// `granted[i]` answers `required_permissions()[i]`. By default a provider
    /// with requirements asks for a fresh discovery so it can pick up the grant.
    fn on_permission_result(&self, _granted: &[bool], handle: &ProviderHandle) {
        if !self.required_permissions().is_empty() {
            handle.request_discovery(None);
        }
    }
}

/// A provider's line back into its controller. Cheap to clone, usable from any thread.
#[derive(Debug, Clone)]
pub struct ProviderHandle {
    id: ProviderId,
    tx: mpsc::UnboundedSender<ControlMessage>,
}

impl ProviderHandle {
    pub(crate) fn new(id: ProviderId, tx: mpsc::UnboundedSender<ControlMessage>) -> Self {
        Self { id, tx }
    }

    /// A handle not attached to any controller; every call is a no-op.
    /// Useful for exercising a provider on its own.
    pub fn detached(id: impl Into<ProviderId>) -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { id: id.into(), tx }
    }

    pub fn id(&self) -> &ProviderId {
        &self.id
    }

    /// Ask for a fresh discovery. `None` (or the current text) re-runs this
    /// provider on the current query; different text asks the host to rewrite
    /// its visible query instead.
    pub fn request_discovery(&self, query_update: Option<String>) {
        self.send(ControlMessage::RequestDiscovery {
            provider: self.id.clone(),
            query_update,
        });
    }

    /// Flag one of this provider's results for `query` as authoritative.
    pub fn report_exact_match(&self, query: &Query) {
        self.send(ControlMessage::ExactMatch {
            provider: self.id.clone(),
            query: query.clone(),
        });
    }

    /// Drop this provider's outstanding fetch and complete `query` with a cancellation.
    pub fn abort(&self, query: &Query) {
        self.send(ControlMessage::Abort {
            provider: self.id.clone(),
            query: query.clone(),
        });
    }

    fn send(&self, msg: ControlMessage) {
        if self.tx.send(msg).is_err() {
            tracing::debug!(provider = %self.id, "controller gone, dropping provider message");
        }
    }
}

/// Everything a running fetch can see or do.
#[derive(Debug, Clone)]
pub struct FetchContext {
    query: Query,
    handle: ProviderHandle,
    cancel: CancellationToken,
}

impl FetchContext {
    pub fn new(query: Query, handle: ProviderHandle, cancel: CancellationToken) -> Self {
        Self {
            query,
            handle,
            cancel,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Set once a newer fetch replaced this one or the slot was aborted.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn report_exact_match(&self) {
        self.handle.report_exact_match(&self.query);
    }
}
