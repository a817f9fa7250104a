//! Endpoint descriptors and the membership list stored on each entity.
//!
//! A descriptor is `title@subscriptionID@wireAddress`. An entity's membership
//! list is the comma-joined set of descriptors of every subscription bound to
//! it. All list operations are exact-match set operations.

use crate::error::{BrokerError, Result};
use crate::types::{Subscription, SubscriptionId};
use std::fmt;

/// Separator between descriptors in a membership list.
pub const LIST_SEPARATOR: char = ',';

/// Separator between descriptor fields.
pub const FIELD_SEPARATOR: char = '@';

/// Entity property path holding the membership list.
pub const MEMBERSHIP_PATH: &str = "sysField._subscribeAddr";

/// One binding's contribution to an entity's membership list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub title: String,
    pub subscription_id: SubscriptionId,
    pub address: String,
}

impl EndpointDescriptor {
    pub fn new(
        title: impl Into<String>,
        subscription_id: SubscriptionId,
        address: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            subscription_id,
            address: address.into(),
        }
    }

    /// Descriptor for a subscription's current title and endpoint.
    pub fn for_subscription(subscription: &Subscription, amqp_base: &str) -> Self {
        Self::new(
            subscription.title.clone(),
            subscription.id,
            wire_address(amqp_base, &subscription.endpoint),
        )
    }

    /// Same binding, different title.
    pub fn with_title(&self, title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..self.clone()
        }
    }

    /// Decode `title@id@address`. The address may itself contain `@`.
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, FIELD_SEPARATOR);
        let (title, id, address) = match (parts.next(), parts.next(), parts.next()) {
            (Some(title), Some(id), Some(address)) => (title, id, address),
            _ => {
                return Err(BrokerError::Validation(format!(
                    "malformed endpoint descriptor: {s:?}"
                )))
            }
        };

        let id = id.parse::<u64>().map_err(|_| {
            BrokerError::Validation(format!("bad subscription id in descriptor: {s:?}"))
        })?;

        Ok(Self::new(title, SubscriptionId(id), address))
    }
}

impl fmt::Display for EndpointDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{sep}{}{sep}{}",
            self.title,
            self.subscription_id,
            self.address,
            sep = FIELD_SEPARATOR
        )
    }
}

/// Render a subscription endpoint as its AMQP address.
pub fn wire_address(amqp_base: &str, endpoint: &str) -> String {
    format!("{}/{}", amqp_base.trim_end_matches('/'), endpoint)
}

/// Check that a title can be embedded in a descriptor.
pub fn validate_title(title: &str) -> Result<()> {
    if title.trim().is_empty() {
        return Err(BrokerError::Validation("title is empty".into()));
    }
    if title.contains(FIELD_SEPARATOR) || title.contains(LIST_SEPARATOR) {
        return Err(BrokerError::Validation(format!(
            "title contains illegal characters: {title:?}"
        )));
    }
    Ok(())
}

/// Iterate the non-empty entries of a membership list.
pub fn entries(list: &str) -> impl Iterator<Item = &str> {
    list.split(LIST_SEPARATOR).filter(|entry| !entry.is_empty())
}

/// Exact membership test.
pub fn contains(list: &str, descriptor: &str) -> bool {
    entries(list).any(|entry| entry == descriptor)
}

/// Add a descriptor. Returns the list unchanged if already present.
pub fn add(list: &str, descriptor: &str) -> String {
    if contains(list, descriptor) {
        return list.to_string();
    }
    if list.is_empty() {
        return descriptor.to_string();
    }
    format!("{list}{LIST_SEPARATOR}{descriptor}")
}

/// Remove a descriptor. Returns the list unchanged if absent; removing the
/// last entry yields the empty string.
pub fn remove(list: &str, descriptor: &str) -> String {
    if !contains(list, descriptor) {
        return list.to_string();
    }
    entries(list)
        .filter(|entry| *entry != descriptor)
        .collect::<Vec<_>>()
        .join(&LIST_SEPARATOR.to_string())
}
