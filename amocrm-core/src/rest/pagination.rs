//! Cursor pagination over `_links.next.href`.
//!
//! amoCRM listings return pages shaped like:
//!
//! ```json
//! {
//!   "_page": 1,
//!   "_links": {
//!     "self": {"href": "https://example.amocrm.ru/api/v4/leads?page=1&limit=250"},
//!     "next": {"href": "https://example.amocrm.ru/api/v4/leads?page=2&limit=250"}
//!   },
//!   "_embedded": {"leads": [{"id": 1}, {"id": 2}]}
//! }
//! ```
//!
//! [`paginate`] turns such a listing into a lazy stream of pages. One GET is
//! issued per pulled page, strictly in order.

use crate::context::AccessContext;
use crate::rest::{until_cancelled, Error, Settings};
use crate::transport::{Request, Transport};
use futures_util::{stream, Stream};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

/// A hypermedia link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    /// Absolute or relative target.
    pub href: String,
}

/// Navigation links of a page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Links {
    /// The page itself.
    #[serde(rename = "self", default, skip_serializing_if = "Option::is_none")]
    pub self_link: Option<Link>,
    /// The next page; absent or `null` on the last page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<Link>,
    /// The first page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first: Option<Link>,
    /// The previous page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev: Option<Link>,
}

/// One page of a listing, or one batch-write response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Page {
    /// Page number reported by the server.
    #[serde(rename = "_page", default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u64>,
    /// Navigation links.
    #[serde(rename = "_links", default, deserialize_with = "null_as_default")]
    pub links: Links,
    /// Entity arrays keyed by resource name.
    #[serde(rename = "_embedded", default, deserialize_with = "null_as_default")]
    pub embedded: Map<String, Value>,
}

// Some endpoints send `"_links": null` or `"_embedded": null` on the last page.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl Page {
    /// Decodes the entity array stored under `key`.
    ///
    /// A missing or `null` array yields an empty collection.
    pub fn entities<E: DeserializeOwned>(&self, key: &str) -> Result<Vec<E>, serde_json::Error> {
        match self.embedded.get(key) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(items) => Vec::<E>::deserialize(items),
        }
    }

    /// Consuming variant of [`Page::entities`].
    pub fn into_entities<E: DeserializeOwned>(
        mut self,
        key: &str,
    ) -> Result<Vec<E>, serde_json::Error> {
        match self.embedded.remove(key) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(items) => serde_json::from_value(items),
        }
    }
}

/// A page that may point at its successor.
pub trait Paginated: DeserializeOwned + Send {
    /// The `next` link, if any.
    fn next_href(&self) -> Option<&str>;
}

impl Paginated for Page {
    fn next_href(&self) -> Option<&str> {
        self.links.next.as_ref().map(|link| link.href.as_str())
    }
}

/// Adds `page=1` and `limit={page_size}` unless the caller already set them.
pub fn with_default_query(mut url: Url, page_size: u32) -> Url {
    let has = |name: &str| url.query_pairs().any(|(key, _)| key == name);
    let missing_page = !has("page");
    let missing_limit = !has("limit");

    if missing_page || missing_limit {
        let mut pairs = url.query_pairs_mut();
        if missing_page {
            pairs.append_pair("page", "1");
        }
        if missing_limit {
            pairs.append_pair("limit", &page_size.to_string());
        }
    }
    url
}

struct Cursor {
    next: Option<Url>,
    fetched: usize,
}

/// Lazily fetches a paginated listing starting at `start`.
///
/// Each pulled item costs exactly one GET. The stream ends when a page has no
/// `next` link, when the server answers with no content, or when `cancel`
/// fires; cancellation is observed before every request and ends the stream
/// without an error. Relative `next` links are resolved against the URL of
/// the page that returned them.
///
/// # Errors
///
/// Yields [`Error::Transport`] for failed requests, [`Error::Decode`] for
/// malformed pages and [`Error::PageLimitExceeded`] once
/// [`Settings::max_pages`] pages have been fetched and another is linked. The
/// stream ends after the first error.
pub fn paginate<'a, T, P>(
    transport: &'a T,
    context: &'a AccessContext,
    start: Url,
    settings: &Settings,
    cancel: &CancellationToken,
) -> impl Stream<Item = Result<P, Error>> + Send + 'a
where
    T: Transport + ?Sized,
    P: Paginated + 'a,
{
    until_cancelled(fetch_pages(transport, context, start, settings, cancel))
}

/// [`paginate`], except that stopping on cancellation yields a final
/// [`Error::Cancelled`]. A listing whose last page arrives after `cancel`
/// fired still ends normally.
pub(crate) fn fetch_pages<'a, T, P>(
    transport: &'a T,
    context: &'a AccessContext,
    start: Url,
    settings: &Settings,
    cancel: &CancellationToken,
) -> impl Stream<Item = Result<P, Error>> + Send + 'a
where
    T: Transport + ?Sized,
    P: Paginated + 'a,
{
    let max_pages = settings.max_pages;
    let cancel = cancel.clone();
    let cursor = Cursor {
        next: Some(with_default_query(start, settings.page_size)),
        fetched: 0,
    };

    stream::try_unfold(cursor, move |cursor| {
        let cancel = cancel.clone();
        async move {
            let Some(url) = cursor.next else {
                return Ok(None);
            };
            if cancel.is_cancelled() {
                debug!(url = %url, pages = cursor.fetched, "Pagination cancelled");
                return Err(Error::Cancelled);
            }
            if cursor.fetched >= max_pages {
                return Err(Error::PageLimitExceeded { limit: max_pages });
            }

            debug!(url = %url, page = cursor.fetched + 1, "Fetching page");
            let body = transport
                .send(Request::get(url.clone(), context))
                .await
                .map_err(|source| Error::Transport { source })?;
            if body.is_null() {
                debug!(url = %url, "Empty page, pagination finished");
                return Ok(None);
            }

            let page: P = serde_json::from_value(body).map_err(|source| Error::Decode {
                url: url.to_string(),
                source,
            })?;
            let next = page
                .next_href()
                .map(|href| {
                    url.join(href).map_err(|source| Error::InvalidCursor {
                        href: href.to_string(),
                        source,
                    })
                })
                .transpose()?;

            Ok(Some((
                page,
                Cursor {
                    next,
                    fetched: cursor.fetched + 1,
                },
            )))
        }
    })
}
