//! Article source adapters, excerpt extraction and the suggestion fetch loop.

use frictionary_storage::FetchError;
use thiserror::Error;

pub mod extract;
pub mod fetcher;
pub mod source;

pub use extract::{ExcerptExtractor, Extraction, LeadParagraphExtractor, RejectReason};
pub use fetcher::{FetchOutcome, SuggestionFetcher, WikiSite};
pub use source::{
    ArticleSource, Continuation, FixtureArticleSource, ListingRequest, MediaWikiSource, RandomBatch,
};

pub const CRATE_NAME: &str = "frictionary-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed response: {0}")]
    Decode(String),
}
