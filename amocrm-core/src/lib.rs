//! Unofficial Rust SDK for the amoCRM (Kommo) REST API v4.
//!
//! This crate provides OAuth2 token exchange, cursor-following pagination,
//! batched writes and an optional response cache for amoCRM accounts.
//!
//! # Examples
//!
//! ```no_run
//! use amocrm_core::client::{self, Credentials};
//! use amocrm_core::rest::{self, resource::Leads};
//! use amocrm_core::transport::HttpTransport;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let auth_client = client::Builder::new()
//!     .credentials(Credentials {
//!         client_id: "...".to_string(),
//!         client_secret: "...".to_string(),
//!         redirect_uri: "https://example.com/oauth".to_string(),
//!         subdomain: "example.amocrm.ru".to_string(),
//!     })
//!     .authorization_code("...")
//!     .build()?
//!     .connect()
//!     .await?;
//!
//! let api = rest::Client::new(Arc::new(HttpTransport::new()?));
//! let context = auth_client.access_context().await?;
//! let leads = api
//!     .resource(Leads)
//!     .list(&context, &[], &CancellationToken::new())
//!     .await?;
//! # Ok(())
//! # }
//! ```

/// Default number of entities requested per listing page.
pub const DEFAULT_PAGE_SIZE: u32 = 250;

/// Maximum number of entities submitted in one write request.
///
/// amoCRM throttles or blocks accounts that send larger batches, so this is a
/// hard limit rather than a tuning knob.
pub const MAX_ENTITIES_PER_BATCH: usize = 50;

/// Default upper bound on pages fetched by a single listing call.
pub const DEFAULT_MAX_PAGES: usize = 10_000;

/// Default connection timeout for HTTP requests (30 seconds).
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default request timeout for HTTP requests (120 seconds).
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;

/// Default connection timeout for OAuth2 token requests (15 seconds).
pub const DEFAULT_AUTH_CONNECT_TIMEOUT_SECS: u64 = 15;

/// Default request timeout for OAuth2 token requests (30 seconds).
pub const DEFAULT_AUTH_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default lifetime of cached read responses, in minutes.
pub const DEFAULT_CACHE_TTL_MINUTES: u64 = 10;

/// Default maximum number of cached read responses.
pub const DEFAULT_CACHE_MAX_ENTRIES: u64 = 1_000;

/// OAuth2 token exchange and token lifecycle management.
pub mod client;

/// Per-call tenant and bearer token.
pub mod context;

/// URL construction for amoCRM resources.
pub mod uri;

/// HTTP transport used by every API call.
pub mod transport;

/// Read-side response cache and prefix invalidation.
pub mod cache;

/// REST API v4 resources, pagination and batching.
pub mod rest;

pub use context::AccessContext;
