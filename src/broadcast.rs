use std::collections::BTreeSet;
use std::sync::Arc;

use crate::provider::ProviderId;

/// Immutable view of the providers that reported an exact match for one token.
pub type ExactMatchSet = Arc<BTreeSet<ProviderId>>;

/// Accumulates exact-match reporters for the current token.
///
/// Each report yields the whole accumulated set, never a delta, so a provider
/// receiving a later broadcast can make its decision from that alone.
#[derive(Debug, Default)]
pub struct ExactMatches {
    reporters: BTreeSet<ProviderId>,
}

impl ExactMatches {
    pub fn report(&mut self, provider: ProviderId) -> ExactMatchSet {
        self.reporters.insert(provider);
        Arc::new(self.reporters.clone())
    }

    pub fn clear(&mut self) {
        self.reporters.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.reporters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProviderId> {
        self.reporters.iter()
    }
}
