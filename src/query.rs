use std::fmt;

use serde::{Deserialize, Serialize};

use crate::aggregator::Completions;
use crate::broadcast::ExactMatches;

/// Strictly increasing identifier of one logical query.
/// Results tagged with anything but the current token are stale.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct QueryToken(u64);

impl QueryToken {
    pub fn get(self) -> u64 {
        self.0
    }

    fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for QueryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What produced the current query text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuerySource {
    Keyboard,
    Voice,
    AutoComplete,
}

impl QuerySource {
    /// Value reported in the "search executed" analytics event.
    pub fn analytics_value(&self) -> &'static str {
        match self {
            Self::Keyboard => "keyboard",
            Self::Voice => "voice",
            Self::AutoComplete => "autosuggest",
        }
    }
}

/// The query as handed to providers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Query {
    pub text: String,
    pub token: QueryToken,
    /// True when the user explicitly submitted, false while typing.
    pub confirmed: bool,
}

impl Query {
    pub fn new(text: impl Into<String>, token: QueryToken, confirmed: bool) -> Self {
        Self {
            text: text.into(),
            token,
            confirmed,
        }
    }
}

/// Lowercase only; whitespace is significant to providers.
pub fn normalize(text: &str) -> String {
    text.to_lowercase()
}

/// The controller's notion of the current query plus everything keyed by its token.
#[derive(Debug, Default)]
pub struct QueryState {
    text: String,
    token: QueryToken,
    confirmed: bool,
    source: Option<QuerySource>,
    pub exact_matches: ExactMatches,
    pub completions: Completions,
}

impl QueryState {
    /// Establish a new logical query: bump the token and clear per-token state.
    pub fn establish(
        &mut self,
        text: String,
        source: Option<QuerySource>,
        confirmed: bool,
    ) -> Query {
        self.text = text;
        self.source = source;
        self.confirmed = confirmed;
        self.token = self.token.next();
        self.exact_matches.clear();
        self.completions.clear();
        self.current()
    }

    pub fn current(&self) -> Query {
        Query::new(self.text.clone(), self.token, self.confirmed)
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn token(&self) -> QueryToken {
        self.token
    }

    pub fn confirmed(&self) -> bool {
        self.confirmed
    }

    pub fn source(&self) -> Option<QuerySource> {
        self.source
    }

    pub fn is_current(&self, token: QueryToken) -> bool {
        token == self.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderId;

    #[test]
    fn normalize_lowercases_without_trimming() {
        assert_eq!(normalize("  PiZZa "), "  pizza ");
    }

    #[test]
    fn establish_bumps_token_every_time() {
        let mut state = QueryState::default();
        let first = state.establish("p".into(), None, false);
        let second = state.establish("p".into(), None, false);
        assert!(second.token > first.token);
        assert!(state.is_current(second.token));
        assert!(!state.is_current(first.token));
    }

    #[test]
    fn establish_clears_per_token_state() {
        let mut state = QueryState::default();
        let query = state.establish("pizza".into(), Some(QuerySource::Voice), false);
        state.exact_matches.report(ProviderId::from("apps"));
        state.completions.expect(ProviderId::from("apps"));
        state
            .completions
            .record(ProviderId::from("apps"), crate::aggregator::CompletionCount::Results(1));

        let next = state.establish("pizza".into(), Some(QuerySource::Keyboard), true);
        assert_eq!(next.token.get(), query.token.get() + 1);
        assert!(next.confirmed);
        assert_eq!(state.source(), Some(QuerySource::Keyboard));
        assert!(state.exact_matches.is_empty());
        assert!(state.completions.is_empty());
    }

    #[test]
    fn source_analytics_values() {
        assert_eq!(QuerySource::Keyboard.analytics_value(), "keyboard");
        assert_eq!(QuerySource::Voice.analytics_value(), "voice");
        assert_eq!(QuerySource::AutoComplete.analytics_value(), "autosuggest");
    }
}
