//! amoCRM REST API v4 resources.
//!
//! Every resource service delegates to the same small engine:
//! - [`pagination`]: follows `_links.next.href` cursors page by page
//! - [`batch`]: splits writes into chunks of at most
//!   [`MAX_ENTITIES_PER_BATCH`](crate::MAX_ENTITIES_PER_BATCH) items
//! - [`collect`](mod@collect): flattens pages or batch responses into one collection
//! - [`cached`]: evicts cached reads after a successful mutation
//!
//! # Example
//!
//! ```no_run
//! use amocrm_core::AccessContext;
//! use amocrm_core::rest::Client;
//! use amocrm_core::transport::HttpTransport;
//! use serde_json::json;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let api = Client::new(Arc::new(HttpTransport::new()?));
//! let context = AccessContext::new("example.amocrm.ru", "access-token")?;
//! let cancel = CancellationToken::new();
//!
//! let created = api
//!     .leads()
//!     .add(&context, &[json!({"name": "New deal", "price": 1000})], &cancel)
//!     .await?;
//! let open = api
//!     .leads()
//!     .list(&context, &[("filter[statuses][0][status_id]", "142")], &cancel)
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod client;

pub mod batch;
pub mod cached;
pub mod collect;
pub mod pagination;
pub mod resource;
pub mod service;

#[cfg(test)]
pub(crate) mod testing;

pub use batch::BatchOperation;
pub use cached::CachedService;
pub use client::{CachedClient, Client};
pub use pagination::{Link, Links, Page, Paginated};
pub use resource::{Entity, Resource};
pub use service::ResourceService;

use crate::{transport, uri};
use futures_util::{future, Stream, StreamExt};

/// Listing behaviour shared by every resource service.
///
/// The batch size is not part of the settings; it is fixed at
/// [`MAX_ENTITIES_PER_BATCH`](crate::MAX_ENTITIES_PER_BATCH).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    /// Entities requested per page (`limit` query parameter).
    pub page_size: u32,
    /// Upper bound on pages fetched by one listing call.
    pub max_pages: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            page_size: crate::DEFAULT_PAGE_SIZE,
            max_pages: crate::DEFAULT_MAX_PAGES,
        }
    }
}

impl Settings {
    /// Sets the page size.
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Sets the page-count bound.
    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages;
        self
    }
}

/// Errors returned by REST API operations.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A caller-supplied argument failed validation; nothing was sent.
    #[error("Invalid argument: {source}")]
    InvalidArgument {
        #[source]
        source: uri::Error,
    },
    /// The transport reported a failure.
    #[error("API request failed: {source}")]
    Transport {
        #[source]
        source: transport::Error,
    },
    /// A response body does not have the expected shape.
    #[error("Failed to decode response from {url}: {source}")]
    Decode {
        /// URL of the request whose response failed to decode.
        url: String,
        #[source]
        source: serde_json::Error,
    },
    /// A request payload could not be serialized.
    #[error("Failed to encode request body: {source}")]
    Encode {
        #[source]
        source: serde_json::Error,
    },
    /// A write or single-entity call returned no content.
    #[error("Empty response from {url}")]
    EmptyResponse {
        /// URL of the request.
        url: String,
    },
    /// A `next` link could not be resolved to a URL.
    #[error("Invalid pagination link '{href}': {source}")]
    InvalidCursor {
        /// The offending link.
        href: String,
        #[source]
        source: url::ParseError,
    },
    /// Pagination hit [`Settings::max_pages`].
    #[error("Pagination stopped after {limit} pages")]
    PageLimitExceeded {
        /// The configured bound.
        limit: usize,
    },
    /// The caller cancelled the operation before it completed.
    #[error("Operation cancelled")]
    Cancelled,
}

/// Ends `stream` silently at the [`Error::Cancelled`] the engine emits when it
/// stops early.
pub(crate) fn until_cancelled<S, T>(stream: S) -> impl Stream<Item = Result<T, Error>>
where
    S: Stream<Item = Result<T, Error>>,
{
    stream.take_while(|item| future::ready(!matches!(item, Err(Error::Cancelled))))
}
