//! Cache invalidation around mutations.
//!
//! [`CachedService`] delegates every call to a [`ResourceService`]. After a
//! create or update succeeds it evicts everything cached under the
//! resource's base path, exactly once. Failed mutations leave the cache
//! untouched. Streamed writes evict once when the stream ends, provided at
//! least one chunk was committed.

use crate::cache::CacheInvalidator;
use crate::context::AccessContext;
use crate::rest::pagination::Page;
use crate::rest::resource::Resource;
use crate::rest::service::ResourceService;
use crate::rest::Error;
use futures_util::{stream, Stream, StreamExt};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Awaits `mutation` and, if it succeeded, evicts cached entries under `path`.
///
/// Errors are returned unchanged and skip the eviction.
pub async fn invalidate_on_success<T, E, F>(
    cache: &dyn CacheInvalidator,
    path: &str,
    mutation: F,
) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    let result = mutation.await?;
    let evicted = cache.invalidate_prefix(path).await;
    debug!(path, evicted, "Evicted cached responses after mutation");
    Ok(result)
}

struct Eviction<S> {
    pages: Pin<Box<S>>,
    cache: Arc<dyn CacheInvalidator>,
    path: String,
    committed: bool,
    finished: bool,
}

/// Passes `pages` through and evicts cached entries under `path` once the
/// stream ends, if any page was received.
///
/// Ending covers exhaustion, an error item and silent cancellation. A stream
/// dropped before its end evicts nothing.
fn evict_on_end<'a, S>(
    pages: S,
    cache: Arc<dyn CacheInvalidator>,
    path: String,
) -> impl Stream<Item = Result<Page, Error>> + Send + 'a
where
    S: Stream<Item = Result<Page, Error>> + Send + 'a,
{
    let state = Eviction {
        pages: Box::pin(pages),
        cache,
        path,
        committed: false,
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }
        let item = state.pages.next().await;
        match item {
            Some(Ok(_)) => state.committed = true,
            _ => state.finished = true,
        }
        if state.finished && state.committed {
            let evicted = state.cache.invalidate_prefix(&state.path).await;
            debug!(
                path = %state.path,
                evicted,
                "Evicted cached responses after streamed write"
            );
        }
        item.map(|item| (item, state))
    })
}

/// [`ResourceService`] that keeps a response cache consistent with its writes.
#[derive(Clone)]
pub struct CachedService<R> {
    inner: ResourceService<R>,
    cache: Arc<dyn CacheInvalidator>,
}

impl<R: Resource> CachedService<R> {
    /// Wraps `inner`; mutations evict from `cache`.
    pub fn new(inner: ResourceService<R>, cache: Arc<dyn CacheInvalidator>) -> Self {
        Self { inner, cache }
    }

    /// The wrapped service.
    pub fn inner(&self) -> &ResourceService<R> {
        &self.inner
    }

    /// See [`ResourceService::pages`].
    ///
    /// # Errors
    ///
    /// Same as [`ResourceService::pages`].
    pub fn pages<'a>(
        &'a self,
        context: &'a AccessContext,
        query: &[(&str, &str)],
        cancel: &CancellationToken,
    ) -> Result<impl Stream<Item = Result<Page, Error>> + Send + 'a, Error> {
        self.inner.pages(context, query, cancel)
    }

    /// See [`ResourceService::list`].
    ///
    /// # Errors
    ///
    /// Same as [`ResourceService::list`].
    pub async fn list(
        &self,
        context: &AccessContext,
        query: &[(&str, &str)],
        cancel: &CancellationToken,
    ) -> Result<Vec<R::Entity>, Error> {
        self.inner.list(context, query, cancel).await
    }

    /// See [`ResourceService::get`].
    ///
    /// # Errors
    ///
    /// Same as [`ResourceService::get`].
    pub async fn get(
        &self,
        context: &AccessContext,
        id: i64,
        query: &[(&str, &str)],
    ) -> Result<Option<R::Entity>, Error> {
        self.inner.get(context, id, query).await
    }

    /// [`ResourceService::add`], then eviction of the resource's cached reads.
    ///
    /// # Errors
    ///
    /// Same as [`ResourceService::add`]; nothing is evicted on error.
    pub async fn add<Req>(
        &self,
        context: &AccessContext,
        items: &[Req],
        cancel: &CancellationToken,
    ) -> Result<Vec<R::Entity>, Error>
    where
        Req: Serialize + Sync,
    {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        invalidate_on_success(
            self.cache.as_ref(),
            &self.inner.resource().path(),
            self.inner.add(context, items, cancel),
        )
        .await
    }

    /// [`ResourceService::update`], then eviction of the resource's cached reads.
    ///
    /// # Errors
    ///
    /// Same as [`ResourceService::update`]; nothing is evicted on error.
    pub async fn update<Req>(
        &self,
        context: &AccessContext,
        items: &[Req],
        cancel: &CancellationToken,
    ) -> Result<Vec<R::Entity>, Error>
    where
        Req: Serialize + Sync,
    {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        invalidate_on_success(
            self.cache.as_ref(),
            &self.inner.resource().path(),
            self.inner.update(context, items, cancel),
        )
        .await
    }

    /// [`ResourceService::add_stream`], evicting the resource's cached reads
    /// once the stream ends.
    ///
    /// Eviction also follows a partial write that stopped at an error or on
    /// cancellation. Dropping the stream early skips it.
    ///
    /// # Errors
    ///
    /// Same as [`ResourceService::add_stream`].
    pub fn add_stream<'a, Req>(
        &'a self,
        context: &'a AccessContext,
        items: &'a [Req],
        cancel: &CancellationToken,
    ) -> Result<impl Stream<Item = Result<Page, Error>> + Send + 'a, Error>
    where
        Req: Serialize + Sync,
    {
        let pages = self.inner.add_stream(context, items, cancel)?;
        Ok(evict_on_end(
            pages,
            self.cache.clone(),
            self.inner.resource().path().into_owned(),
        ))
    }

    /// [`ResourceService::update_stream`]; see [`CachedService::add_stream`].
    ///
    /// # Errors
    ///
    /// Same as [`ResourceService::update_stream`].
    pub fn update_stream<'a, Req>(
        &'a self,
        context: &'a AccessContext,
        items: &'a [Req],
        cancel: &CancellationToken,
    ) -> Result<impl Stream<Item = Result<Page, Error>> + Send + 'a, Error>
    where
        Req: Serialize + Sync,
    {
        let pages = self.inner.update_stream(context, items, cancel)?;
        Ok(evict_on_end(
            pages,
            self.cache.clone(),
            self.inner.resource().path().into_owned(),
        ))
    }
}
