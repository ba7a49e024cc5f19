pub mod aggregator;
pub mod analytics;
pub mod broadcast;
pub mod catalog;
pub mod config;
pub mod controller;
pub mod error;
pub mod observer;
pub mod provider;
pub mod query;
pub mod task;

pub use controller::{DispatchPhase, QuerySnapshot, SearchController};
pub use error::FlurryError;
pub use observer::{ObserverId, SearchObserver};
pub use provider::{FetchContext, Hit, Provider, ProviderHandle, ProviderId};
pub use query::{Query, QuerySource, QueryToken};
