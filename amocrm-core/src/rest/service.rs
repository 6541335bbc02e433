//! Per-resource operations.

use crate::context::AccessContext;
use crate::rest::batch::{send_chunks, BatchOperation};
use crate::rest::collect::collect;
use crate::rest::pagination::{fetch_pages, Page};
use crate::rest::resource::Resource;
use crate::rest::{until_cancelled, Error, Settings};
use crate::transport::{Request, Transport};
use crate::{uri, MAX_ENTITIES_PER_BATCH};
use futures_util::Stream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

/// Read and write operations for one [`Resource`].
///
/// Obtained from [`rest::Client`](crate::rest::Client). Cloning is cheap; the
/// transport is shared.
#[derive(Clone)]
pub struct ResourceService<R> {
    transport: Arc<dyn Transport>,
    settings: Settings,
    resource: R,
}

impl<R: std::fmt::Debug> std::fmt::Debug for ResourceService<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceService")
            .field("resource", &self.resource)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl<R: Resource> ResourceService<R> {
    pub(crate) fn new(transport: Arc<dyn Transport>, settings: Settings, resource: R) -> Self {
        Self {
            transport,
            settings,
            resource,
        }
    }

    /// The resource descriptor.
    pub fn resource(&self) -> &R {
        &self.resource
    }

    /// Listing settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Lazily fetches the listing page by page.
    ///
    /// `query` is appended to the first request (filters, `with`, `order`);
    /// later requests follow the server's `next` links verbatim.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the URL cannot be built. Stream
    /// items carry the errors documented on
    /// [`paginate`](crate::rest::pagination::paginate).
    pub fn pages<'a>(
        &'a self,
        context: &'a AccessContext,
        query: &[(&str, &str)],
        cancel: &CancellationToken,
    ) -> Result<impl Stream<Item = Result<Page, Error>> + Send + 'a, Error> {
        Ok(until_cancelled(self.fetch(context, query, cancel)?))
    }

    // Ends with `Error::Cancelled` when stopped early.
    fn fetch<'a>(
        &'a self,
        context: &'a AccessContext,
        query: &[(&str, &str)],
        cancel: &CancellationToken,
    ) -> Result<impl Stream<Item = Result<Page, Error>> + Send + 'a, Error> {
        let url = self.url(context, &self.resource.path(), None, query)?;
        Ok(fetch_pages(
            self.transport.as_ref(),
            context,
            url,
            &self.settings,
            cancel,
        ))
    }

    /// Fetches every page and returns all entities in server order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if `cancel` fires before the last page was
    /// requested, otherwise the first error raised while paging.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn list(
        &self,
        context: &AccessContext,
        query: &[(&str, &str)],
        cancel: &CancellationToken,
    ) -> Result<Vec<R::Entity>, Error> {
        let key = self.resource.embedded_key();
        let pages = self.fetch(context, query, cancel)?;
        collect(pages, |page| entities(page, key), &self.operation("list"), context).await
    }

    /// Fetches a single entity by id.
    ///
    /// Returns `Ok(None)` when the server answers with no content.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for a negative id,
    /// [`Error::Transport`] for a failed request (including 404) and
    /// [`Error::Decode`] for a malformed body.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all, fields(id = id)))]
    pub async fn get(
        &self,
        context: &AccessContext,
        id: i64,
        query: &[(&str, &str)],
    ) -> Result<Option<R::Entity>, Error> {
        let url = self.url(context, &self.resource.path(), Some(id), query)?;
        debug!(url = %url, "Fetching entity");

        let body = self
            .transport
            .send(Request::get(url.clone(), context))
            .await
            .map_err(|source| Error::Transport { source })?;
        if body.is_null() {
            return Ok(None);
        }

        serde_json::from_value(body)
            .map(Some)
            .map_err(|source| Error::Decode {
                url: url.to_string(),
                source,
            })
    }

    /// Creates entities, [`MAX_ENTITIES_PER_BATCH`](crate::MAX_ENTITIES_PER_BATCH)
    /// per request, and returns the created records in input order.
    ///
    /// An empty `items` slice returns immediately without a request.
    ///
    /// # Errors
    ///
    /// Returns the first failure; chunks sent before it stay applied on the
    /// server. Returns [`Error::Cancelled`] if `cancel` fires before the last
    /// chunk was sent.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all, fields(count = items.len())))]
    pub async fn add<Req>(
        &self,
        context: &AccessContext,
        items: &[Req],
        cancel: &CancellationToken,
    ) -> Result<Vec<R::Entity>, Error>
    where
        Req: Serialize + Sync,
    {
        self.write(context, items, BatchOperation::Create, cancel)
            .await
    }

    /// Updates entities in chunks; see [`ResourceService::add`].
    ///
    /// # Errors
    ///
    /// Same as [`ResourceService::add`].
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all, fields(count = items.len())))]
    pub async fn update<Req>(
        &self,
        context: &AccessContext,
        items: &[Req],
        cancel: &CancellationToken,
    ) -> Result<Vec<R::Entity>, Error>
    where
        Req: Serialize + Sync,
    {
        self.write(context, items, BatchOperation::Update, cancel)
            .await
    }

    /// Lazy form of [`ResourceService::add`]: one request per pulled chunk.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the URL cannot be built. Stream
    /// items carry the errors documented on
    /// [`send_batches`](crate::rest::batch::send_batches).
    pub fn add_stream<'a, Req>(
        &'a self,
        context: &'a AccessContext,
        items: &'a [Req],
        cancel: &CancellationToken,
    ) -> Result<impl Stream<Item = Result<Page, Error>> + Send + 'a, Error>
    where
        Req: Serialize + Sync,
    {
        Ok(until_cancelled(self.batches(
            context,
            items,
            BatchOperation::Create,
            cancel,
        )?))
    }

    /// Lazy form of [`ResourceService::update`].
    ///
    /// # Errors
    ///
    /// Same as [`ResourceService::add_stream`].
    pub fn update_stream<'a, Req>(
        &'a self,
        context: &'a AccessContext,
        items: &'a [Req],
        cancel: &CancellationToken,
    ) -> Result<impl Stream<Item = Result<Page, Error>> + Send + 'a, Error>
    where
        Req: Serialize + Sync,
    {
        Ok(until_cancelled(self.batches(
            context,
            items,
            BatchOperation::Update,
            cancel,
        )?))
    }

    // Ends with `Error::Cancelled` when stopped early.
    fn batches<'a, Req>(
        &'a self,
        context: &'a AccessContext,
        items: &'a [Req],
        operation: BatchOperation,
        cancel: &CancellationToken,
    ) -> Result<impl Stream<Item = Result<Page, Error>> + Send + 'a, Error>
    where
        Req: Serialize + Sync,
    {
        let url = self.url(context, &self.resource.write_path(), None, &[])?;
        Ok(send_chunks(
            self.transport.as_ref(),
            context,
            url,
            items,
            MAX_ENTITIES_PER_BATCH,
            operation,
            cancel,
        ))
    }

    async fn write<Req>(
        &self,
        context: &AccessContext,
        items: &[Req],
        operation: BatchOperation,
        cancel: &CancellationToken,
    ) -> Result<Vec<R::Entity>, Error>
    where
        Req: Serialize + Sync,
    {
        if items.is_empty() {
            debug!(resource = self.resource.embedded_key(), %operation, "Nothing to write");
            return Ok(Vec::new());
        }

        let key = self.resource.embedded_key();
        let responses = self.batches(context, items, operation, cancel)?;
        collect(
            responses,
            |page| entities(page, key),
            &self.operation(&operation.to_string()),
            context,
        )
        .await
    }

    fn url(
        &self,
        context: &AccessContext,
        path: &str,
        id: Option<i64>,
        query: &[(&str, &str)],
    ) -> Result<Url, Error> {
        let mut url = uri::build(context.subdomain(), path, id)
            .map_err(|source| Error::InvalidArgument { source })?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    fn operation(&self, name: &str) -> String {
        format!("{}.{name}", self.resource.embedded_key())
    }
}

fn entities<E: DeserializeOwned>(page: Page, key: &str) -> Result<Vec<E>, Error> {
    let url = page
        .links
        .self_link
        .as_ref()
        .map(|link| link.href.clone())
        .unwrap_or_default();
    page.into_entities(key)
        .map_err(|source| Error::Decode { url, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rest::resource::{Entity, Leads, Links, Notes};
    use crate::rest::testing::{page, ScriptedTransport};
    use crate::transport;
    use crate::uri::EntityType;
    use futures_util::TryStreamExt;
    use reqwest::Method;
    use serde_json::{json, Value};

    fn context() -> AccessContext {
        AccessContext::new("example.amocrm.ru", "token").unwrap()
    }

    fn service<R: Resource>(transport: &ScriptedTransport, resource: R) -> ResourceService<R> {
        ResourceService::new(Arc::new(transport.clone()), Settings::default(), resource)
    }

    fn new_leads(count: usize) -> Vec<Value> {
        (0..count)
            .map(|i| json!({"name": format!("Lead {i}"), "price": i}))
            .collect()
    }

    #[tokio::test]
    async fn test_list_collects_all_pages() {
        let transport = ScriptedTransport::new(vec![
            Ok(page(
                "leads",
                1,
                50,
                Some("https://example.amocrm.ru/api/v4/leads?page=2&limit=250"),
            )),
            Ok(page("leads", 51, 10, None)),
        ]);

        let leads = service(&transport, Leads)
            .list(&context(), &[], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(leads.len(), 60);
        let ids: Vec<i64> = leads.iter().filter_map(|lead| lead.id).collect();
        assert_eq!(ids, (1..=60).collect::<Vec<_>>());

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(
            requests[0].url.as_str(),
            "https://example.amocrm.ru/api/v4/leads?page=1&limit=250"
        );
    }

    #[tokio::test]
    async fn test_list_appends_caller_query() {
        let transport = ScriptedTransport::new(vec![Ok(page("leads", 1, 1, None))]);

        service(&transport, Leads)
            .list(
                &context(),
                &[("with", "contacts"), ("query", "acme")],
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(
            transport.requests()[0].url.query(),
            Some("with=contacts&query=acme&page=1&limit=250")
        );
    }

    #[tokio::test]
    async fn test_list_no_content_is_empty() {
        let transport = ScriptedTransport::new(vec![Ok(Value::Null)]);

        let leads = service(&transport, Leads)
            .list(&context(), &[], &CancellationToken::new())
            .await
            .unwrap();

        assert!(leads.is_empty());
    }

    #[tokio::test]
    async fn test_list_cancelled() {
        let transport = ScriptedTransport::new(vec![Ok(page("leads", 1, 1, None))]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let error = service(&transport, Leads)
            .list(&context(), &[], &cancel)
            .await
            .unwrap_err();

        assert!(matches!(error, Error::Cancelled));
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test]
    async fn test_list_completes_when_cancelled_during_last_page() {
        let cancel = CancellationToken::new();
        let transport = ScriptedTransport::new(vec![
            Ok(page(
                "leads",
                1,
                50,
                Some("https://example.amocrm.ru/api/v4/leads?page=2&limit=250"),
            )),
            Ok(page("leads", 51, 3, None)),
        ])
        .cancel_after(2, cancel.clone());

        let leads = service(&transport, Leads)
            .list(&context(), &[], &cancel)
            .await
            .unwrap();

        assert!(cancel.is_cancelled());
        assert_eq!(leads.len(), 53);
    }

    #[tokio::test]
    async fn test_list_cancelled_between_pages() {
        let cancel = CancellationToken::new();
        let transport = ScriptedTransport::new(vec![
            Ok(page(
                "leads",
                1,
                50,
                Some("https://example.amocrm.ru/api/v4/leads?page=2&limit=250"),
            )),
            Ok(page("leads", 51, 3, None)),
        ])
        .cancel_after(1, cancel.clone());
        let service = service(&transport, Leads);
        let context = context();

        let error = service.list(&context, &[], &cancel).await.unwrap_err();
        assert!(matches!(error, Error::Cancelled));
        assert_eq!(transport.request_count(), 1);

        let pages: Vec<Page> = service
            .pages(&context, &[], &cancel)
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert!(pages.is_empty());
    }

    #[tokio::test]
    async fn test_update_completes_when_cancelled_during_last_chunk() {
        let cancel = CancellationToken::new();
        let transport = ScriptedTransport::new(vec![
            Ok(page("leads", 1, 50, None)),
            Ok(page("leads", 51, 5, None)),
        ])
        .cancel_after(2, cancel.clone());

        let updated = service(&transport, Leads)
            .update(&context(), &new_leads(55), &cancel)
            .await
            .unwrap();

        assert_eq!(updated.len(), 55);
        assert_eq!(transport.request_count(), 2);
    }

    #[tokio::test]
    async fn test_add_cancelled_between_chunks() {
        let cancel = CancellationToken::new();
        let transport = ScriptedTransport::new(vec![
            Ok(page("leads", 1, 50, None)),
            Ok(page("leads", 51, 5, None)),
        ])
        .cancel_after(1, cancel.clone());

        let error = service(&transport, Leads)
            .add(&context(), &new_leads(55), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(error, Error::Cancelled));
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn test_pages_stream() {
        let transport = ScriptedTransport::new(vec![
            Ok(page(
                "notes",
                1,
                2,
                Some("https://example.amocrm.ru/api/v4/contacts/notes?page=2&limit=250"),
            )),
            Ok(page("notes", 3, 1, None)),
        ]);
        let service = service(&transport, Notes::new(EntityType::Contacts));
        let context = context();
        let cancel = CancellationToken::new();

        let pages: Vec<Page> = service
            .pages(&context, &[], &cancel)
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        assert_eq!(pages.len(), 2);
        assert!(transport.requests()[0]
            .url
            .as_str()
            .starts_with("https://example.amocrm.ru/api/v4/contacts/notes?"));
    }

    #[tokio::test]
    async fn test_get() {
        let transport = ScriptedTransport::new(vec![
            Ok(json!({"id": 42, "name": "Deal"})),
            Ok(Value::Null),
        ]);
        let service = service(&transport, Leads);

        let found = service.get(&context(), 42, &[("with", "contacts")]).await.unwrap();
        assert_eq!(found.and_then(|lead| lead.id), Some(42));
        assert_eq!(
            transport.requests()[0].url.as_str(),
            "https://example.amocrm.ru/api/v4/leads/42?with=contacts"
        );

        let missing = service.get(&context(), 43, &[]).await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_get_rejects_negative_id() {
        let transport = ScriptedTransport::new(vec![]);

        let error = service(&transport, Leads)
            .get(&context(), -1, &[])
            .await
            .unwrap_err();

        assert!(matches!(error, Error::InvalidArgument { .. }));
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test]
    async fn test_add_splits_into_batches() {
        let transport = ScriptedTransport::new(vec![
            Ok(page("leads", 1, 50, None)),
            Ok(page("leads", 51, 50, None)),
            Ok(page("leads", 101, 20, None)),
        ]);

        let created: Vec<Entity> = service(&transport, Leads)
            .add(&context(), &new_leads(120), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(created.len(), 120);
        let requests = transport.requests();
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(|r| r.method == Method::POST
            && r.url.as_str() == "https://example.amocrm.ru/api/v4/leads"));
        let sizes: Vec<usize> = requests
            .iter()
            .map(|r| r.body.as_ref().and_then(Value::as_array).map_or(0, Vec::len))
            .collect();
        assert_eq!(sizes, vec![50, 50, 20]);
    }

    #[tokio::test]
    async fn test_update_stops_at_first_failure() {
        let transport = ScriptedTransport::new(vec![
            Ok(page("leads", 1, 50, None)),
            Err(transport::Error::Validation {
                status: 400,
                message: "Bad Request".to_string(),
                errors: Vec::new(),
            }),
        ]);

        let error = service(&transport, Leads)
            .update(&context(), &new_leads(120), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            Error::Transport {
                source: transport::Error::Validation { status: 400, .. }
            }
        ));
        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(|r| r.method == Method::PATCH));
    }

    #[tokio::test]
    async fn test_empty_writes_send_nothing() {
        let transport = ScriptedTransport::new(vec![]);
        let service = service(&transport, Leads);
        let context = context();
        let cancel = CancellationToken::new();
        let nothing: Vec<Value> = Vec::new();

        assert!(service.add(&context, &nothing, &cancel).await.unwrap().is_empty());
        assert!(service.update(&context, &nothing, &cancel).await.unwrap().is_empty());
        let streamed: Vec<Page> = service
            .add_stream(&context, &nothing, &cancel)
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert!(streamed.is_empty());
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test]
    async fn test_update_stream_yields_per_chunk() {
        let transport = ScriptedTransport::new(vec![
            Ok(page("leads", 1, 50, None)),
            Ok(page("leads", 51, 5, None)),
        ]);
        let service = service(&transport, Leads);
        let context = context();
        let cancel = CancellationToken::new();
        let items = new_leads(55);

        let stream = service.update_stream(&context, &items, &cancel).unwrap();
        futures_util::pin_mut!(stream);

        let first = stream.try_next().await.unwrap().unwrap();
        assert_eq!(first.entities::<Entity>("leads").unwrap().len(), 50);
        assert_eq!(transport.request_count(), 1);
        let second = stream.try_next().await.unwrap().unwrap();
        assert_eq!(second.entities::<Entity>("leads").unwrap().len(), 5);
        assert!(stream.try_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_links_write_to_singular_path() {
        let transport = ScriptedTransport::new(vec![Ok(page("links", 1, 1, None))]);

        service(&transport, Links::new(EntityType::Leads))
            .add(
                &context(),
                &[json!({"to_entity_id": 10, "to_entity_type": "contacts"})],
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(
            transport.requests()[0].url.as_str(),
            "https://example.amocrm.ru/api/v4/leads/link"
        );
    }
}
