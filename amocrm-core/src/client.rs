use crate::context::AccessContext;
use crate::uri;
use oauth2::basic::{BasicClient, BasicTokenResponse};
use oauth2::{
    AuthType, AuthorizationCode, ClientId, ClientSecret, EndpointNotSet, EndpointSet, RedirectUrl,
    RefreshToken, TokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// OAuth2 token endpoint path on the account host.
const DEFAULT_TOKEN_PATH: &str = "/oauth2/access_token";

/// Buffer time (in seconds) before token expiry to trigger refresh.
const TOKEN_REFRESH_BUFFER_SECONDS: u64 = 300;

/// Access token lifetime assumed when the server omits `expires_in`.
const DEFAULT_TOKEN_LIFETIME_SECONDS: u64 = 86_400;

/// OAuth2 client configured with only a token endpoint.
type TokenClient =
    BasicClient<EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// Internal state for managing token lifecycle.
#[derive(Debug, Clone)]
pub(crate) struct TokenState {
    /// The current token response.
    token_response: BasicTokenResponse,
    /// Unix timestamp (seconds) when the access token expires.
    expires_at: u64,
}

impl TokenState {
    /// Creates a new token state from a token response.
    pub(crate) fn new(token_response: BasicTokenResponse) -> Result<Self, Error> {
        let now = unix_now()?;

        let lifetime = token_response
            .expires_in()
            .map(|expires_in| expires_in.as_secs())
            .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECONDS);
        let expires_at = now
            .checked_add(lifetime)
            .ok_or(Error::TokenExpiryOverflow)?;

        Ok(Self {
            token_response,
            expires_at,
        })
    }

    /// Returns true if the token is expired or will expire within the buffer time.
    fn is_expired(&self, buffer_seconds: u64) -> Result<bool, Error> {
        let threshold = unix_now()?
            .checked_add(buffer_seconds)
            .ok_or(Error::TimeThresholdOverflow)?;

        Ok(threshold >= self.expires_at)
    }

    fn access_token(&self) -> &str {
        self.token_response.access_token().secret()
    }

    fn refresh_token(&self) -> Option<&RefreshToken> {
        self.token_response.refresh_token()
    }

    fn pair(&self) -> TokenPair {
        TokenPair {
            access_token: self.access_token().to_string(),
            refresh_token: self.refresh_token().map(|token| token.secret().to_string()),
            expires_at: self.expires_at,
        }
    }
}

fn unix_now() -> Result<u64, Error> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|source| Error::SystemTimeError { source })?
        .as_secs())
}

/// Errors that can occur during client operations.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Failed to read credentials file from disk.
    #[error("Failed to read credentials file at {path}: {source}")]
    ReadCredentials {
        /// Path to the credentials file that failed to read.
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Failed to parse credentials JSON.
    #[error("Failed to parse credentials JSON: {source}")]
    ParseCredentials {
        #[source]
        source: serde_json::Error,
    },
    /// Invalid URL format in credentials.
    #[error("Invalid URL format: {source}")]
    ParseUrl {
        #[source]
        source: url::ParseError,
    },
    /// OAuth2 token exchange failed.
    #[error("OAuth2 token exchange failed: {0:?}")]
    TokenExchange(Box<dyn std::error::Error + Send + Sync>),
    /// Required builder parameter was not provided.
    #[error("Missing required attribute: {}", _0)]
    MissingRequiredAttribute(String),
    /// Credentials are incomplete for the selected grant.
    #[error("Invalid credentials for {grant}: {message}")]
    InvalidCredentials {
        /// The grant that failed validation.
        grant: String,
        /// Description of what's missing or invalid.
        message: String,
    },
    /// The token or subdomain cannot form an [`AccessContext`].
    #[error("Invalid access context: {source}")]
    InvalidContext {
        #[source]
        source: uri::Error,
    },
    /// Failed to get current system time.
    #[error("Failed to get current system time: {source}")]
    SystemTimeError {
        #[source]
        source: std::time::SystemTimeError,
    },
    /// Token expiry time calculation resulted in arithmetic overflow.
    #[error("Token expiry time calculation overflow")]
    TokenExpiryOverflow,
    /// Time threshold calculation resulted in arithmetic overflow.
    #[error("Time threshold calculation overflow")]
    TimeThresholdOverflow,
    /// The client has not been connected yet.
    #[error("Client is not connected")]
    NotConnected,
    /// Token refresh is not available (no refresh token present).
    #[error("Token refresh not available: no refresh token in response")]
    NoRefreshToken,
    /// Failed to acquire lock on token state.
    #[error("Failed to acquire lock on token state")]
    LockError,
}

/// OAuth2 grant used by [`Client::connect`].
///
/// amoCRM integrations receive a one-time authorization code when a user
/// installs them. The code is exchanged once; afterwards the integration keeps
/// the rotating refresh token and connects with [`Grant::RefreshToken`].
#[derive(Clone, PartialEq, Eq)]
pub enum Grant {
    /// `authorization_code` grant with the code from the install redirect.
    AuthorizationCode(String),
    /// `refresh_token` grant with a previously stored refresh token.
    RefreshToken(String),
}

impl Grant {
    fn name(&self) -> &'static str {
        match self {
            Grant::AuthorizationCode(_) => "authorization_code",
            Grant::RefreshToken(_) => "refresh_token",
        }
    }

    fn secret(&self) -> &str {
        match self {
            Grant::AuthorizationCode(value) | Grant::RefreshToken(value) => value,
        }
    }
}

impl std::fmt::Debug for Grant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Grant::{}([redacted])", self.name())
    }
}

/// amoCRM integration credentials.
///
/// Found on the integration's "Keys and scopes" tab in the amoCRM account.
///
/// # Example
///
/// ```
/// use amocrm_core::client::Credentials;
///
/// let creds = Credentials {
///     client_id: "integration-id".to_string(),
///     client_secret: "secret-key".to_string(),
///     redirect_uri: "https://example.com/oauth".to_string(),
///     subdomain: "example.amocrm.ru".to_string(),
/// };
/// ```
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Credentials {
    /// Integration ID.
    pub client_id: String,
    /// Secret key.
    pub client_secret: String,
    /// Redirect URI registered for the integration.
    pub redirect_uri: String,
    /// Account host, e.g. `example.amocrm.ru`.
    pub subdomain: String,
}

/// Source for loading credentials.
#[derive(Debug, Clone)]
pub enum CredentialsFrom {
    /// Load credentials from a JSON file.
    Path(PathBuf),
    /// Use credentials provided directly.
    Value(Credentials),
}

/// Access and refresh tokens currently held by a [`Client`].
///
/// amoCRM rotates the refresh token on every refresh; persist
/// `refresh_token` after each call that may have refreshed.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenPair {
    /// Bearer token for API calls.
    pub access_token: String,
    /// Token for the next `refresh_token` grant.
    pub refresh_token: Option<String>,
    /// Unix timestamp (seconds) when `access_token` expires.
    pub expires_at: u64,
}

impl std::fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"[redacted]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[redacted]"),
            )
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// OAuth2 client for amoCRM API authentication.
///
/// Use [`Builder`] to construct a client instance.
///
/// # Examples
///
/// ## First install: authorization code
///
/// ```no_run
/// use amocrm_core::client::{self, Credentials};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let client = client::Builder::new()
///     .credentials(Credentials {
///         client_id: "integration-id".to_string(),
///         client_secret: "secret-key".to_string(),
///         redirect_uri: "https://example.com/oauth".to_string(),
///         subdomain: "example.amocrm.ru".to_string(),
///     })
///     .authorization_code("def50200...")
///     .build()?
///     .connect()
///     .await?;
///
/// // Store the refresh token for the next start.
/// let tokens = client.token_pair()?;
/// # Ok(())
/// # }
/// ```
///
/// ## Later starts: stored refresh token
///
/// ```no_run
/// use amocrm_core::client;
/// use std::path::PathBuf;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let client = client::Builder::new()
///     .credentials_path(PathBuf::from("credentials.json"))
///     .refresh_token("def50200...")
///     .build()?
///     .connect()
///     .await?;
///
/// let context = client.access_context().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Client {
    /// Source of credentials (file path or direct value).
    credentials_from: CredentialsFrom,
    /// Grant used by `connect`.
    grant: Grant,
    /// Token endpoint override.
    token_url: Option<String>,
    /// Thread-safe token state with automatic refresh capabilities.
    pub(crate) token_state: Option<Arc<RwLock<TokenState>>>,
    /// Account host of the connected credentials.
    pub subdomain: Option<String>,
}

impl Client {
    fn load_credentials(&self) -> Result<Credentials, Error> {
        match &self.credentials_from {
            CredentialsFrom::Value(creds) => Ok(creds.clone()),
            CredentialsFrom::Path(path) => {
                let credentials_string =
                    fs::read_to_string(path).map_err(|e| Error::ReadCredentials {
                        path: path.clone(),
                        source: e,
                    })?;
                serde_json::from_str(&credentials_string)
                    .map_err(|e| Error::ParseCredentials { source: e })
            }
        }
    }

    /// Validates that required credential fields are present for the grant.
    fn validate_credentials(&self, credentials: &Credentials) -> Result<(), Error> {
        let invalid = |message: &str| Error::InvalidCredentials {
            grant: self.grant.name().to_string(),
            message: message.to_string(),
        };

        if credentials.client_id.trim().is_empty() {
            return Err(invalid("client_id is required"));
        }
        if credentials.client_secret.trim().is_empty() {
            return Err(invalid("client_secret is required"));
        }
        if credentials.redirect_uri.trim().is_empty() {
            return Err(invalid("redirect_uri is required"));
        }
        if self.grant.secret().trim().is_empty() {
            return Err(invalid(&format!("{} must not be empty", self.grant.name())));
        }
        uri::validate_subdomain(&credentials.subdomain).map_err(|e| invalid(&e.to_string()))
    }

    fn token_url(&self, credentials: &Credentials) -> String {
        self.token_url.clone().unwrap_or_else(|| {
            format!(
                "https://{}{}",
                credentials.subdomain.trim(),
                DEFAULT_TOKEN_PATH
            )
        })
    }

    fn oauth2_client(&self, credentials: &Credentials) -> Result<TokenClient, Error> {
        Ok(
            BasicClient::new(ClientId::new(credentials.client_id.clone()))
                .set_client_secret(ClientSecret::new(credentials.client_secret.clone()))
                .set_auth_type(AuthType::RequestBody)
                .set_token_uri(
                    TokenUrl::new(self.token_url(credentials))
                        .map_err(|e| Error::ParseUrl { source: e })?,
                )
                .set_redirect_uri(
                    RedirectUrl::new(credentials.redirect_uri.clone())
                        .map_err(|e| Error::ParseUrl { source: e })?,
                ),
        )
    }

    fn http_client() -> Result<reqwest::Client, Error> {
        reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(crate::DEFAULT_AUTH_CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(crate::DEFAULT_AUTH_REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| Error::TokenExchange(Box::new(e)))
    }

    /// Connects to amoCRM and exchanges the grant for an access token.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Credentials file cannot be read ([`Error::ReadCredentials`])
    /// - Credentials JSON is invalid ([`Error::ParseCredentials`])
    /// - Required fields are missing ([`Error::InvalidCredentials`])
    /// - Token or redirect URL is malformed ([`Error::ParseUrl`])
    /// - OAuth2 token exchange fails ([`Error::TokenExchange`])
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn connect(mut self) -> Result<Self, Error> {
        let credentials = self.load_credentials()?;
        self.validate_credentials(&credentials)?;

        let oauth2_client = self.oauth2_client(&credentials)?;
        let http_client = Self::http_client()?;

        let token_response = match &self.grant {
            Grant::AuthorizationCode(code) => oauth2_client
                .exchange_code(AuthorizationCode::new(code.clone()))
                .request_async(&http_client)
                .await
                .map_err(|e| Error::TokenExchange(Box::new(e)))?,
            Grant::RefreshToken(token) => oauth2_client
                .exchange_refresh_token(&RefreshToken::new(token.clone()))
                .add_extra_param("redirect_uri", credentials.redirect_uri.clone())
                .request_async(&http_client)
                .await
                .map_err(|e| Error::TokenExchange(Box::new(e)))?,
        };

        let token_state = TokenState::new(token_response)?;
        info!(
            subdomain = credentials.subdomain.trim(),
            grant = self.grant.name(),
            expires_at = token_state.expires_at,
            "Connected to amoCRM"
        );
        self.token_state = Some(Arc::new(RwLock::new(token_state)));
        self.subdomain = Some(credentials.subdomain.trim().to_string());

        Ok(self)
    }

    /// Exchanges the current refresh token for a new token pair.
    ///
    /// Called automatically by [`access_token`](Self::access_token) when the
    /// token is expired or about to expire.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Client is not connected ([`Error::NotConnected`])
    /// - No refresh token is available ([`Error::NoRefreshToken`])
    /// - Token refresh fails ([`Error::TokenExchange`])
    /// - Failed to acquire token state lock ([`Error::LockError`])
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn refresh(&self) -> Result<(), Error> {
        let token_state_arc = self.token_state.as_ref().ok_or(Error::NotConnected)?;

        let refresh_token = {
            let state = token_state_arc.read().map_err(|_| Error::LockError)?;
            state.refresh_token().ok_or(Error::NoRefreshToken)?.clone()
        };

        let credentials = self.load_credentials()?;
        let oauth2_client = self.oauth2_client(&credentials)?;
        let http_client = Self::http_client()?;

        let new_token_response = oauth2_client
            .exchange_refresh_token(&refresh_token)
            .add_extra_param("redirect_uri", credentials.redirect_uri.clone())
            .request_async(&http_client)
            .await
            .map_err(|e| Error::TokenExchange(Box::new(e)))?;

        let new_state = TokenState::new(new_token_response)?;
        debug!(expires_at = new_state.expires_at, "Access token refreshed");
        let mut state = token_state_arc.write().map_err(|_| Error::LockError)?;
        *state = new_state;

        Ok(())
    }

    /// Returns the current access token without refreshing.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Client is not connected ([`Error::NotConnected`])
    /// - Failed to acquire token state lock ([`Error::LockError`])
    pub fn current_access_token(&self) -> Result<String, Error> {
        let token_state_arc = self.token_state.as_ref().ok_or(Error::NotConnected)?;
        let state = token_state_arc.read().map_err(|_| Error::LockError)?;

        Ok(state.access_token().to_string())
    }

    /// Returns the tokens currently held, including the latest refresh token.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Client is not connected ([`Error::NotConnected`])
    /// - Failed to acquire token state lock ([`Error::LockError`])
    pub fn token_pair(&self) -> Result<TokenPair, Error> {
        let token_state_arc = self.token_state.as_ref().ok_or(Error::NotConnected)?;
        let state = token_state_arc.read().map_err(|_| Error::LockError)?;

        Ok(state.pair())
    }

    /// Returns a valid access token, automatically refreshing if necessary.
    ///
    /// The token is refreshed when it expires within the next 5 minutes.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Client is not connected ([`Error::NotConnected`])
    /// - Token refresh fails when needed ([`Error::TokenExchange`])
    /// - Failed to acquire token state lock ([`Error::LockError`])
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn access_token(&self) -> Result<String, Error> {
        let token_state_arc = self.token_state.as_ref().ok_or(Error::NotConnected)?;

        let needs_refresh = {
            let state = token_state_arc.read().map_err(|_| Error::LockError)?;
            state.is_expired(TOKEN_REFRESH_BUFFER_SECONDS)?
        };

        if needs_refresh {
            self.refresh().await?;
        }

        let state = token_state_arc.read().map_err(|_| Error::LockError)?;
        Ok(state.access_token().to_string())
    }

    /// Returns an [`AccessContext`] for API calls, refreshing the token first
    /// if necessary.
    ///
    /// # Errors
    ///
    /// Same as [`access_token`](Self::access_token), plus
    /// [`Error::InvalidContext`] if the token is rejected by
    /// [`AccessContext::new`].
    pub async fn access_context(&self) -> Result<AccessContext, Error> {
        let subdomain = self.subdomain.clone().ok_or(Error::NotConnected)?;
        let access_token = self.access_token().await?;

        AccessContext::new(subdomain, access_token).map_err(|source| Error::InvalidContext { source })
    }
}

/// Builder for constructing a [`Client`].
///
/// # Example
///
/// ```no_run
/// use amocrm_core::client::{self, Credentials};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let client = client::Builder::new()
///     .credentials(Credentials {
///         client_id: "integration-id".to_string(),
///         client_secret: "secret-key".to_string(),
///         redirect_uri: "https://example.com/oauth".to_string(),
///         subdomain: "example.amocrm.ru".to_string(),
///     })
///     .refresh_token("def50200...")
///     .build()?
///     .connect()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct Builder {
    credentials_from: Option<CredentialsFrom>,
    grant: Option<Grant>,
    token_url: Option<String>,
}

impl Builder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets credentials to load from a JSON file.
    ///
    /// ```json
    /// {
    ///   "client_id": "integration-id",
    ///   "client_secret": "secret-key",
    ///   "redirect_uri": "https://example.com/oauth",
    ///   "subdomain": "example.amocrm.ru"
    /// }
    /// ```
    pub fn credentials_path(mut self, path: PathBuf) -> Self {
        self.credentials_from = Some(CredentialsFrom::Path(path));
        self
    }

    /// Sets credentials directly.
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials_from = Some(CredentialsFrom::Value(credentials));
        self
    }

    /// Connects with a one-time authorization code.
    pub fn authorization_code(mut self, code: impl Into<String>) -> Self {
        self.grant = Some(Grant::AuthorizationCode(code.into()));
        self
    }

    /// Connects with a stored refresh token.
    pub fn refresh_token(mut self, token: impl Into<String>) -> Self {
        self.grant = Some(Grant::RefreshToken(token.into()));
        self
    }

    /// Overrides the token endpoint, which defaults to
    /// `https://{subdomain}/oauth2/access_token`.
    pub fn token_url(mut self, url: impl Into<String>) -> Self {
        self.token_url = Some(url.into());
        self
    }

    /// Builds the client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingRequiredAttribute`] if credentials or a grant
    /// were not provided.
    pub fn build(self) -> Result<Client, Error> {
        Ok(Client {
            credentials_from: self.credentials_from.ok_or_else(|| {
                Error::MissingRequiredAttribute("credentials or credentials_path".to_string())
            })?,
            grant: self.grant.ok_or_else(|| {
                Error::MissingRequiredAttribute("authorization_code or refresh_token".to_string())
            })?,
            token_url: self.token_url,
            token_state: None,
            subdomain: None,
        })
    }
}
