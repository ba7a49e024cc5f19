use std::collections::HashMap;

use crate::analytics::ProviderCount;
use crate::provider::ProviderId;

/// What a provider reported when it finished for the current token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionCount {
    Results(usize),
    Error,
}

impl CompletionCount {
    /// Count as reported in the results summary: -1 stands for an error.
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Results(n) => i64::try_from(n).unwrap_or(i64::MAX),
            Self::Error => -1,
        }
    }
}

/// Per-token completion bookkeeping.
///
/// `expected` holds the providers that were dispatched for the current token
/// (active at dispatch time, plus any activated afterwards). Completions from
/// anyone else are not counted.
#[derive(Debug, Default)]
pub struct Completions {
    expected: Vec<ProviderId>,
    recorded: HashMap<ProviderId, CompletionCount>,
    summarized: bool,
}

impl Completions {
    pub fn clear(&mut self) {
        self.expected.clear();
        self.recorded.clear();
        self.summarized = false;
    }

    pub fn expect(&mut self, provider: ProviderId) {
        if !self.expected.contains(&provider) {
            self.expected.push(provider);
        }
    }

    /// Drop a provider from the denominator (it was deactivated mid-query).
    pub fn forget(&mut self, provider: &ProviderId) {
        self.expected.retain(|p| p != provider);
        self.recorded.remove(provider);
    }

    /// The provider is fetching again for this token; its earlier count no
    /// longer holds.
    pub fn reopen(&mut self, provider: &ProviderId) {
        self.recorded.remove(provider);
    }

    /// Returns false when the provider is not part of this token's fan-out.
    pub fn record(&mut self, provider: ProviderId, count: CompletionCount) -> bool {
        if !self.expected.contains(&provider) {
            return false;
        }
        self.recorded.insert(provider, count);
        true
    }

    pub fn is_expected(&self, provider: &ProviderId) -> bool {
        self.expected.contains(provider)
    }

    /// Every expected provider has completed.
    pub fn is_settled(&self) -> bool {
        self.expected.iter().all(|p| self.recorded.contains_key(p))
    }

    pub fn is_empty(&self) -> bool {
        self.expected.is_empty() && self.recorded.is_empty()
    }

    pub fn get(&self, provider: &ProviderId) -> Option<CompletionCount> {
        self.recorded.get(provider).copied()
    }

    pub fn len(&self) -> usize {
        self.recorded.len()
    }

    /// Claim the one results summary allowed per token. Returns the per-provider
    /// counts in `order` (registration order), or None if already claimed or
    /// nothing was recorded.
    pub fn claim_summary<'a>(
        &mut self,
        order: impl IntoIterator<Item = &'a ProviderId>,
    ) -> Option<Vec<ProviderCount>> {
        if self.summarized || self.recorded.is_empty() || !self.is_settled() {
            return None;
        }
        self.summarized = true;
        Some(
            order
                .into_iter()
                .filter_map(|p| {
                    self.recorded.get(p).map(|count| ProviderCount {
                        provider: p.clone(),
                        count: count.as_i64(),
                    })
                })
                .collect(),
        )
    }
}

/// Process-wide loading flag. Only real flips are reported.
#[derive(Debug, Default)]
pub struct LoadingState {
    loading: bool,
}

impl LoadingState {
    /// Returns true if the value changed.
    pub fn set(&mut self, loading: bool) -> bool {
        if self.loading == loading {
            return false;
        }
        self.loading = loading;
        true
    }

    pub fn get(&self) -> bool {
        self.loading
    }
}
