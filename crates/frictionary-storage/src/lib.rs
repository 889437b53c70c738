//! Suggestion persistence + rate-limited HTTP fetch utilities for Frictionary.

pub mod http;
pub mod memory;
pub mod postgres;
pub mod store;
mod top_cache;

pub use http::{FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, RetryPolicy};
pub use memory::MemoryBackend;
pub use postgres::PgBackend;
pub use store::{SampleRange, StoreConfig, StoreError, SuggestionBackend, SuggestionStore};

pub const CRATE_NAME: &str = "frictionary-storage";
