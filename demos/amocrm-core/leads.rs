//! Example of working with leads through the REST API v4.
//!
//! This example demonstrates:
//!
//! - Exchanging a stored refresh token for an access token
//! - Reading account information
//! - Listing leads across every page
//! - Creating leads in batches
//! - Streaming a batched update chunk by chunk
//! - Serving pipeline reads from the response cache

use amocrm_core::cache::CacheConfig;
use amocrm_core::client::{self, Credentials};
use amocrm_core::rest::{self, Settings};
use amocrm_core::transport::HttpTransport;
use futures_util::TryStreamExt;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("amocrm_core=debug,leads=info")
        .init();

    // Exchange the stored refresh token
    let auth_client = client::Builder::new()
        .credentials(Credentials {
            client_id: std::env::var("AMOCRM_CLIENT_ID")?,
            client_secret: std::env::var("AMOCRM_CLIENT_SECRET")?,
            redirect_uri: std::env::var("AMOCRM_REDIRECT_URI")?,
            subdomain: std::env::var("AMOCRM_SUBDOMAIN")?,
        })
        .refresh_token(std::env::var("AMOCRM_REFRESH_TOKEN")?)
        .build()?
        .connect()
        .await?;

    // amoCRM rotates refresh tokens; persist the new one before doing anything else
    if let Some(refresh_token) = auth_client.token_pair()?.refresh_token {
        info!("New refresh token issued ({} chars)", refresh_token.len());
    }

    let context = auth_client.access_context().await?;
    let cancel = CancellationToken::new();
    let api = rest::Client::new(Arc::new(HttpTransport::new()?))
        .with_settings(Settings::default().with_page_size(100));

    info!("Reading account information");
    let account = api.account(&context, &["amojo_id", "version"]).await?;
    info!("Account: {:?}", account.name());

    info!("Listing leads");
    let leads = api
        .leads()
        .list(&context, &[("order[created_at]", "desc")], &cancel)
        .await?;
    info!("Found {} leads", leads.len());

    info!("Creating leads");
    let new_leads: Vec<_> = (1..=3)
        .map(|i| json!({"name": format!("Demo lead {i}"), "price": i * 1000}))
        .collect();
    let created = api.leads().add(&context, &new_leads, &cancel).await?;
    for lead in &created {
        info!("Created lead {:?}", lead.id);
    }

    info!("Updating leads one chunk at a time");
    let updates: Vec<_> = created
        .iter()
        .filter_map(|lead| lead.id)
        .map(|id| json!({"id": id, "price": 5000}))
        .collect();
    let leads_service = api.leads();
    let chunks = leads_service.update_stream(&context, &updates, &cancel)?;
    futures_util::pin_mut!(chunks);
    loop {
        match chunks.try_next().await {
            Ok(Some(page)) => info!("Chunk applied: {:?}", page.links.self_link),
            Ok(None) => break,
            Err(e) => {
                error!("Update failed: {e}");
                break;
            }
        }
    }

    info!("Reading pipelines through the cache");
    let cached = api.cached(CacheConfig::default());
    let pipelines = cached.pipelines().list(&context, &[], &cancel).await?;
    let again = cached.pipelines().list(&context, &[], &cancel).await?;
    info!(
        "Pipelines: {} (second read served {} from cache)",
        pipelines.len(),
        again.len()
    );

    Ok(())
}
