//! Resource descriptors.
//!
//! A [`Resource`] names where a collection lives and under which key its
//! pages embed entities. The descriptors here cover the amoCRM v4 catalogue;
//! callers can implement [`Resource`] for typed entity models of their own.

use crate::uri::{self, EntityType};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::borrow::Cow;

/// Describes an API collection.
pub trait Resource: Send + Sync {
    /// Entity model returned by reads and writes.
    type Entity: DeserializeOwned + Send + 'static;

    /// Collection path relative to the account host, e.g. `api/v4/leads`.
    fn path(&self) -> Cow<'static, str>;

    /// Path used by create and update calls.
    fn write_path(&self) -> Cow<'static, str> {
        self.path()
    }

    /// Key of the entity array inside `_embedded`.
    fn embedded_key(&self) -> &'static str;
}

/// Schemaless entity record.
///
/// `id` and `request_id` are lifted out; every other attribute stays in
/// `fields` exactly as the API returned it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Server-assigned identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// Caller-chosen correlation id echoed back by batch writes.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "string_or_number"
    )]
    pub request_id: Option<String>,
    /// Remaining attributes.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Entity {
    /// Returns an attribute by name.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// The `name` attribute, if it is a string.
    pub fn name(&self) -> Option<&str> {
        self.get("name").and_then(Value::as_str)
    }
}

// The API echoes `request_id` back as a string even when it was sent as a number.
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

macro_rules! fixed_resource {
    ($(#[$meta:meta])* $name:ident, $path:literal, $key:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct $name;

        impl Resource for $name {
            type Entity = Entity;

            fn path(&self) -> Cow<'static, str> {
                Cow::Borrowed($path)
            }

            fn embedded_key(&self) -> &'static str {
                $key
            }
        }
    };
}

fixed_resource!(
    /// Deals (`api/v4/leads`).
    Leads,
    "api/v4/leads",
    "leads"
);
fixed_resource!(
    /// People (`api/v4/contacts`).
    Contacts,
    "api/v4/contacts",
    "contacts"
);
fixed_resource!(
    /// Organisations (`api/v4/companies`).
    Companies,
    "api/v4/companies",
    "companies"
);
fixed_resource!(
    /// Tasks (`api/v4/tasks`).
    Tasks,
    "api/v4/tasks",
    "tasks"
);
fixed_resource!(
    /// Recurring-purchase customers (`api/v4/customers`).
    Customers,
    "api/v4/customers",
    "customers"
);
fixed_resource!(
    /// Sales pipelines (`api/v4/leads/pipelines`).
    Pipelines,
    "api/v4/leads/pipelines",
    "pipelines"
);
fixed_resource!(
    /// Account users (`api/v4/users`).
    Users,
    "api/v4/users",
    "users"
);
fixed_resource!(
    /// Installed widgets (`api/v4/widgets`).
    Widgets,
    "api/v4/widgets",
    "widgets"
);

/// Customer purchases.
///
/// Listing spans all customers; writes target one customer and therefore
/// require [`Transactions::for_customer`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transactions {
    customer_id: Option<i64>,
}

impl Transactions {
    /// Transactions of every customer.
    pub fn all() -> Self {
        Self::default()
    }

    /// Transactions of a single customer.
    ///
    /// # Errors
    ///
    /// Returns [`uri::Error::InvalidArgument`] if `customer_id` is negative.
    pub fn for_customer(customer_id: i64) -> Result<Self, uri::Error> {
        if customer_id < 0 {
            return Err(uri::Error::invalid(
                "customer_id",
                format!("must not be negative, got {customer_id}"),
            ));
        }
        Ok(Self {
            customer_id: Some(customer_id),
        })
    }
}

impl Resource for Transactions {
    type Entity = Entity;

    fn path(&self) -> Cow<'static, str> {
        match self.customer_id {
            Some(id) => Cow::Owned(format!("api/v4/customers/{id}/transactions")),
            None => Cow::Borrowed("api/v4/customers/transactions"),
        }
    }

    fn embedded_key(&self) -> &'static str {
        "transactions"
    }
}

macro_rules! nested_resource {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            entity_type: EntityType,
        }

        impl $name {
            /// Collection owned by `entity_type`.
            pub fn new(entity_type: EntityType) -> Self {
                Self { entity_type }
            }

            /// Parses `entity_type` from its path segment.
            ///
            /// # Errors
            ///
            /// Returns [`uri::Error::InvalidArgument`] listing the accepted
            /// names if `entity_type` is unknown.
            pub fn for_entity(entity_type: &str) -> Result<Self, uri::Error> {
                Ok(Self::new(entity_type.parse()?))
            }

            /// Owning entity type.
            pub fn entity_type(&self) -> EntityType {
                self.entity_type
            }
        }
    };
}

nested_resource!(
    /// Notes attached to an entity type (`api/v4/{entity_type}/notes`).
    Notes
);
nested_resource!(
    /// Entity links. Listed at `api/v4/{entity_type}/links`, written at
    /// `api/v4/{entity_type}/link`.
    Links
);
nested_resource!(
    /// Custom field definitions (`api/v4/{entity_type}/custom_fields`).
    CustomFields
);

impl Resource for Notes {
    type Entity = Entity;

    fn path(&self) -> Cow<'static, str> {
        Cow::Owned(format!("api/v4/{}/notes", self.entity_type))
    }

    fn embedded_key(&self) -> &'static str {
        "notes"
    }
}

impl Resource for Links {
    type Entity = Entity;

    fn path(&self) -> Cow<'static, str> {
        Cow::Owned(format!("api/v4/{}/links", self.entity_type))
    }

    fn write_path(&self) -> Cow<'static, str> {
        Cow::Owned(format!("api/v4/{}/link", self.entity_type))
    }

    fn embedded_key(&self) -> &'static str {
        "links"
    }
}

impl Resource for CustomFields {
    type Entity = Entity;

    fn path(&self) -> Cow<'static, str> {
        Cow::Owned(format!("api/v4/{}/custom_fields", self.entity_type))
    }

    fn embedded_key(&self) -> &'static str {
        "custom_fields"
    }
}
