//! URL construction for amoCRM resources.
//!
//! Every API URL has the shape `https://{subdomain}/{resource_path}[/{id}]`,
//! where `subdomain` is the account host (for example `example.amocrm.ru`).

use std::fmt;
use std::str::FromStr;
use url::Url;

/// Maximum length of a DNS host name.
const MAX_SUBDOMAIN_LEN: usize = 253;

/// Errors raised while validating URL inputs.
///
/// These are always raised before any network call is made.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// A caller-supplied argument is malformed.
    #[error("Invalid argument `{argument}`: {message}")]
    InvalidArgument {
        /// Name of the offending argument.
        argument: &'static str,
        /// Description of the problem.
        message: String,
    },
}

impl Error {
    pub(crate) fn invalid(argument: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            argument,
            message: message.into(),
        }
    }
}

/// Entity types that own nested collections such as notes, links and custom fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityType {
    /// Deals.
    Leads,
    /// People.
    Contacts,
    /// Organisations.
    Companies,
    /// Recurring-purchase customers.
    Customers,
}

impl EntityType {
    /// All entity types accepted in dynamic paths.
    pub const ALL: [EntityType; 4] = [
        EntityType::Leads,
        EntityType::Contacts,
        EntityType::Companies,
        EntityType::Customers,
    ];

    /// Returns the path segment used by the API for this entity type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Leads => "leads",
            EntityType::Contacts => "contacts",
            EntityType::Companies => "companies",
            EntityType::Customers => "customers",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .into_iter()
            .find(|entity_type| entity_type.as_str() == value)
            .ok_or_else(|| {
                let valid = EntityType::ALL
                    .iter()
                    .map(EntityType::as_str)
                    .collect::<Vec<_>>()
                    .join(", ");
                Error::invalid(
                    "entity_type",
                    format!("unknown entity type '{value}', expected one of: {valid}"),
                )
            })
    }
}

/// Validates an account host name.
pub fn validate_subdomain(subdomain: &str) -> Result<(), Error> {
    if subdomain.trim().is_empty() {
        return Err(Error::invalid("subdomain", "must not be empty"));
    }
    if subdomain.len() > MAX_SUBDOMAIN_LEN {
        return Err(Error::invalid(
            "subdomain",
            format!("must not exceed {MAX_SUBDOMAIN_LEN} characters"),
        ));
    }
    Ok(())
}

/// Builds `https://{subdomain}/{resource_path}[/{id}]`.
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] if the subdomain is blank or longer than
/// 253 characters, if `id` is negative, or if the result is not a valid URL.
pub fn build(subdomain: &str, resource_path: &str, id: Option<i64>) -> Result<Url, Error> {
    validate_subdomain(subdomain)?;

    let path = resource_path.trim_matches('/');
    let raw = match id {
        Some(id) if id < 0 => {
            return Err(Error::invalid("id", format!("must not be negative, got {id}")));
        }
        Some(id) => format!("https://{}/{path}/{id}", subdomain.trim()),
        None => format!("https://{}/{path}", subdomain.trim()),
    };

    Url::parse(&raw).map_err(|e| Error::invalid("subdomain", e.to_string()))
}

/// Builds `{base}/{entity_type}/{suffix}` from a caller-supplied entity type name.
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] if `entity_type` is not one of
/// [`EntityType::ALL`]; the message lists the accepted names.
pub fn entity_path(base: &str, entity_type: &str, suffix: &str) -> Result<String, Error> {
    let entity_type: EntityType = entity_type.parse()?;
    Ok(format!(
        "{}/{entity_type}/{}",
        base.trim_end_matches('/'),
        suffix.trim_start_matches('/')
    ))
}
