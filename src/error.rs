use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlurryError {
    #[error("discovery cancelled for {provider}")]
    Cancelled { provider: String },

    #[error("provider {provider} failed: {message}")]
    ProviderFailed { provider: String, message: String },

    #[error("provider {provider} panicked: {message}")]
    ProviderPanicked { provider: String, message: String },

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("provider registered twice: {0}")]
    DuplicateProvider(String),

    #[error("no providers registered")]
    NoProviders,

    #[error("search controller is shut down")]
    ControllerClosed,

    #[error("config error: {0}")]
    Config(String),
}

impl FlurryError {
    /// Extract provider name from structured error variants.
    /// Returns None for variants that don't carry provider context.
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::Cancelled { provider } => Some(provider),
            Self::ProviderFailed { provider, .. } => Some(provider),
            Self::ProviderPanicked { provider, .. } => Some(provider),
            Self::UnknownProvider(provider) => Some(provider),
            Self::DuplicateProvider(provider) => Some(provider),
            _ => None,
        }
    }

    /// True for errors synthesized by an abort. Hosts usually ignore these:
    /// they only exist so completion accounting never waits forever.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Short message safe to show next to a provider's section.
    /// Provider failure details stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            Self::Cancelled { .. } => "search cancelled".to_string(),
            Self::ProviderFailed { provider, .. } => {
                format!("{provider} could not complete the search")
            }
            Self::ProviderPanicked { provider, .. } => {
                format!("{provider} stopped unexpectedly")
            }
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_is_extracted_from_provider_variants() {
        let err = FlurryError::ProviderFailed {
            provider: "apps".to_string(),
            message: "disk on fire".to_string(),
        };
        assert_eq!(err.provider(), Some("apps"));
        assert_eq!(FlurryError::ControllerClosed.provider(), None);
    }

    #[test]
    fn only_cancelled_is_a_cancellation() {
        assert!(FlurryError::Cancelled { provider: "apps".into() }.is_cancellation());
        assert!(
            !FlurryError::ProviderFailed {
                provider: "apps".into(),
                message: "boom".into()
            }
            .is_cancellation()
        );
    }

    #[test]
    fn user_message_hides_failure_details() {
        let err = FlurryError::ProviderFailed {
            provider: "contacts".to_string(),
            message: "sqlite: database is locked at /data/contacts.db".to_string(),
        };
        let msg = err.user_message();
        assert!(msg.contains("contacts"));
        assert!(!msg.contains("sqlite"));
    }
}
