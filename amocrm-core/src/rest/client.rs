//! REST API v4 client that hands out per-resource services.

use crate::cache::{CacheConfig, CachingTransport, ResponseCache};
use crate::context::AccessContext;
use crate::rest::cached::CachedService;
use crate::rest::resource::{
    Companies, Contacts, CustomFields, Customers, Entity, Leads, Links, Notes, Pipelines,
    Resource, Tasks, Transactions, Users, Widgets,
};
use crate::rest::service::ResourceService;
use crate::rest::{Error, Settings};
use crate::transport::{Request, Transport};
use crate::uri::{self, EntityType};
use std::sync::Arc;

const ACCOUNT_PATH: &str = "api/v4/account";

/// Client for amoCRM REST API v4.
///
/// The client is stateless apart from its transport; the account and token
/// travel with each call in an [`AccessContext`].
///
/// # Example
///
/// ```no_run
/// use amocrm_core::AccessContext;
/// use amocrm_core::rest::Client;
/// use amocrm_core::transport::HttpTransport;
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let api = Client::new(Arc::new(HttpTransport::new()?));
/// let context = AccessContext::new("example.amocrm.ru", "access-token")?;
///
/// let contacts = api
///     .contacts()
///     .list(&context, &[("query", "Smith")], &CancellationToken::new())
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    transport: Arc<dyn Transport>,
    settings: Settings,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Creates a client over `transport` with default [`Settings`].
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            settings: Settings::default(),
        }
    }

    /// Replaces the listing settings.
    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Returns the listing settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Returns a service for any resource descriptor.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub fn resource<R: Resource>(&self, resource: R) -> ResourceService<R> {
        ResourceService::new(self.transport.clone(), self.settings, resource)
    }

    /// Deals.
    pub fn leads(&self) -> ResourceService<Leads> {
        self.resource(Leads)
    }

    /// People.
    pub fn contacts(&self) -> ResourceService<Contacts> {
        self.resource(Contacts)
    }

    /// Organisations.
    pub fn companies(&self) -> ResourceService<Companies> {
        self.resource(Companies)
    }

    /// Tasks.
    pub fn tasks(&self) -> ResourceService<Tasks> {
        self.resource(Tasks)
    }

    /// Customers.
    pub fn customers(&self) -> ResourceService<Customers> {
        self.resource(Customers)
    }

    /// Transactions across all customers.
    pub fn transactions(&self) -> ResourceService<Transactions> {
        self.resource(Transactions::all())
    }

    /// Sales pipelines.
    pub fn pipelines(&self) -> ResourceService<Pipelines> {
        self.resource(Pipelines)
    }

    /// Account users.
    pub fn users(&self) -> ResourceService<Users> {
        self.resource(Users)
    }

    /// Installed widgets.
    pub fn widgets(&self) -> ResourceService<Widgets> {
        self.resource(Widgets)
    }

    /// Notes of `entity_type`.
    pub fn notes(&self, entity_type: EntityType) -> ResourceService<Notes> {
        self.resource(Notes::new(entity_type))
    }

    /// Links of `entity_type`.
    pub fn links(&self, entity_type: EntityType) -> ResourceService<Links> {
        self.resource(Links::new(entity_type))
    }

    /// Custom field definitions of `entity_type`.
    pub fn custom_fields(&self, entity_type: EntityType) -> ResourceService<CustomFields> {
        self.resource(CustomFields::new(entity_type))
    }

    /// Fetches account information.
    ///
    /// `with` lists optional blocks such as `users_groups` or `task_types`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] for a failed request,
    /// [`Error::EmptyResponse`] if the server sent no body and
    /// [`Error::Decode`] for a malformed body.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn account(&self, context: &AccessContext, with: &[&str]) -> Result<Entity, Error> {
        let mut url = uri::build(context.subdomain(), ACCOUNT_PATH, None)
            .map_err(|source| Error::InvalidArgument { source })?;
        if !with.is_empty() {
            url.query_pairs_mut().append_pair("with", &with.join(","));
        }

        let body = self
            .transport
            .send(Request::get(url.clone(), context))
            .await
            .map_err(|source| Error::Transport { source })?;
        if body.is_null() {
            return Err(Error::EmptyResponse {
                url: url.to_string(),
            });
        }

        serde_json::from_value(body).map_err(|source| Error::Decode {
            url: url.to_string(),
            source,
        })
    }

    /// Wraps the transport in a response cache.
    ///
    /// Reads of allow-listed paths are served from the cache; every service
    /// handed out by the returned client evicts its resource's entries after a
    /// successful write.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub fn cached(self, config: CacheConfig) -> CachedClient {
        let cache = Arc::new(ResponseCache::new(config));
        let transport = CachingTransport::new(self.transport, cache.clone());
        CachedClient {
            client: Client {
                transport: Arc::new(transport),
                settings: self.settings,
            },
            cache,
        }
    }
}

/// [`Client`] with a read-side response cache.
#[derive(Clone, Debug)]
pub struct CachedClient {
    client: Client,
    cache: Arc<ResponseCache>,
}

impl CachedClient {
    /// Returns a cache-consistent service for any resource descriptor.
    pub fn resource<R: Resource>(&self, resource: R) -> CachedService<R> {
        CachedService::new(self.client.resource(resource), self.cache.clone())
    }

    /// Deals.
    pub fn leads(&self) -> CachedService<Leads> {
        self.resource(Leads)
    }

    /// People.
    pub fn contacts(&self) -> CachedService<Contacts> {
        self.resource(Contacts)
    }

    /// Organisations.
    pub fn companies(&self) -> CachedService<Companies> {
        self.resource(Companies)
    }

    /// Sales pipelines.
    pub fn pipelines(&self) -> CachedService<Pipelines> {
        self.resource(Pipelines)
    }

    /// Custom field definitions of `entity_type`.
    pub fn custom_fields(&self, entity_type: EntityType) -> CachedService<CustomFields> {
        self.resource(CustomFields::new(entity_type))
    }

    /// See [`Client::account`]; served from the cache when possible.
    ///
    /// # Errors
    ///
    /// Same as [`Client::account`].
    pub async fn account(&self, context: &AccessContext, with: &[&str]) -> Result<Entity, Error> {
        self.client.account(context, with).await
    }

    /// The response cache.
    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    /// The underlying client; its services read through the cache but do not
    /// evict after writes.
    pub fn client(&self) -> &Client {
        &self.client
    }
}
