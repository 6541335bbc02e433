//! Per-call account access.

use crate::uri;
use std::fmt;

/// Maximum accepted length of a bearer token.
const MAX_ACCESS_TOKEN_LEN: usize = 8192;

/// Tenant subdomain and bearer token supplied with every API call.
///
/// Both values are opaque to this crate; they are only checked for presence
/// and length.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessContext {
    subdomain: String,
    access_token: String,
}

impl AccessContext {
    /// Creates a validated access context.
    ///
    /// # Errors
    ///
    /// Returns [`uri::Error::InvalidArgument`] if the subdomain is blank or too
    /// long, or if the token is blank or longer than 8192 characters.
    pub fn new(
        subdomain: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Result<Self, uri::Error> {
        let subdomain = subdomain.into();
        let access_token = access_token.into();

        uri::validate_subdomain(&subdomain)?;
        if access_token.trim().is_empty() {
            return Err(uri::Error::invalid("access_token", "must not be empty"));
        }
        if access_token.len() > MAX_ACCESS_TOKEN_LEN {
            return Err(uri::Error::invalid(
                "access_token",
                format!("must not exceed {MAX_ACCESS_TOKEN_LEN} characters"),
            ));
        }

        Ok(Self {
            subdomain: subdomain.trim().to_string(),
            access_token,
        })
    }

    /// Account host, e.g. `example.amocrm.ru`.
    pub fn subdomain(&self) -> &str {
        &self.subdomain
    }

    /// Bearer token sent as `Authorization: Bearer {token}`.
    pub fn access_token(&self) -> &str {
        &self.access_token
    }
}

// The token never appears in logs.
impl fmt::Debug for AccessContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessContext")
            .field("subdomain", &self.subdomain)
            .field("access_token", &"<redacted>")
            .finish()
    }
}
