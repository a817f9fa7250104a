//! Subscription consistency engine.
//!
//! Keeps the local store, the upstream subscriptions and each entity's
//! membership list in agreement. Creating a binding is all-or-nothing;
//! removing one and propagating a rename are best-effort, with failures
//! queued in the repair ledger.

use super::repair::{ReconcileReport, Repair, RepairLedger};
use super::types::{
    BulkOutcome, EntityDirectory, SubscriptionDetail, DEFAULT_DESCRIPTION, DEFAULT_TITLE,
};
use crate::descriptor::{self, EndpointDescriptor};
use crate::error::{BrokerError, Result};
use crate::gateway::{MembershipChange, SubscriptionGateway};
use crate::store::SubscriptionStore;
use crate::types::{AuthUser, BrokerStats, Subscription, SubscriptionBinding, SubscriptionId, UniqueKey};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Orchestrates subscription and binding changes across the store and the
/// external services.
pub struct SubscriptionEngine {
    store: Arc<SubscriptionStore>,
    gateway: Arc<SubscriptionGateway>,
    directory: Option<Arc<dyn EntityDirectory>>,
    repairs: RepairLedger,
}

impl SubscriptionEngine {
    pub fn new(store: Arc<SubscriptionStore>, gateway: Arc<SubscriptionGateway>) -> Self {
        Self {
            store,
            gateway,
            directory: None,
            repairs: RepairLedger::new(),
        }
    }

    /// Attach the directory used to resolve groups and templates.
    pub fn with_directory(mut self, directory: Arc<dyn EntityDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn store(&self) -> &SubscriptionStore {
        &self.store
    }

    pub fn gateway(&self) -> &SubscriptionGateway {
        &self.gateway
    }

    // --- Subscriptions ---

    pub fn create_subscription(
        &self,
        user: &AuthUser,
        title: &str,
        description: &str,
    ) -> Result<Subscription> {
        authenticate(user)?;
        descriptor::validate_title(title)?;

        let subscription = self.store.create_subscription(user, title, description, None)?;
        info!(
            user_id = %user.id,
            subscription = %subscription.id,
            endpoint = %subscription.endpoint,
            is_default = subscription.is_default,
            "subscription created"
        );
        Ok(subscription)
    }

    pub fn get_subscription(&self, user: &AuthUser, id: SubscriptionId) -> Result<SubscriptionDetail> {
        let subscription = self.owned(user, id)?;
        Ok(SubscriptionDetail {
            binding_count: self.store.binding_count(id),
            subscription,
        })
    }

    /// List the caller's subscriptions, provisioning the default one for
    /// users that have none yet.
    pub fn list_subscriptions(&self, user: &AuthUser) -> Result<Vec<SubscriptionDetail>> {
        authenticate(user)?;

        if let Some(default) = self
            .store
            .ensure_default(user, DEFAULT_TITLE, DEFAULT_DESCRIPTION)?
        {
            info!(user_id = %user.id, subscription = %default.id, "default subscription provisioned");
        }
        let subscriptions = self.store.list_subscriptions(&user.id);

        Ok(subscriptions
            .into_iter()
            .map(|subscription| SubscriptionDetail {
                binding_count: self.store.binding_count(subscription.id),
                subscription,
            })
            .collect())
    }

    /// Replace title and description. A title change is pushed to the
    /// membership list of every bound entity.
    pub fn update_subscription(
        &self,
        user: &AuthUser,
        id: SubscriptionId,
        title: &str,
        description: &str,
    ) -> Result<Subscription> {
        let before = self.owned(user, id)?;
        descriptor::validate_title(title)?;

        let after = self.store.update_subscription(id, title, description)?;
        if before.title != after.title {
            self.propagate_rename(&before, &after);
        }
        Ok(after)
    }

    /// Change only the title.
    pub fn rename_subscription(
        &self,
        user: &AuthUser,
        id: SubscriptionId,
        title: &str,
    ) -> Result<Subscription> {
        let current = self.owned(user, id)?;
        self.update_subscription(user, id, title, &current.description)
    }

    /// Delete a non-default subscription and all of its bindings.
    pub fn delete_subscription(&self, user: &AuthUser, id: SubscriptionId) -> Result<()> {
        let subscription = self.owned(user, id)?;
        if subscription.is_default {
            return Err(BrokerError::Undeleteable(
                "this is the default subscription".into(),
            ));
        }

        for binding in self.store.bindings_for(id) {
            self.unbind(&subscription, &binding)?;
        }
        // Endpoint reservations are not tracked upstream yet.
        debug!(endpoint = %subscription.endpoint, "endpoint released");

        self.store.delete_subscription(id)?;
        info!(user_id = %user.id, subscription = %id, "subscription deleted");
        Ok(())
    }

    /// Move every subscription of the caller to another tenant.
    pub fn update_tenant(&self, user: &AuthUser, tenant_id: &str) -> Result<usize> {
        authenticate(user)?;
        if tenant_id.is_empty() {
            return Err(BrokerError::Validation("tenant id is empty".into()));
        }
        let changed = self.store.update_tenant(&user.id, tenant_id)?;
        info!(user_id = %user.id, tenant_id, changed, "tenant updated");
        Ok(changed)
    }

    // --- Bindings ---

    /// Bind one entity to a subscription.
    ///
    /// On success the binding row, the upstream subscription and the
    /// membership entry all exist. On failure none of them do.
    pub fn create_binding(
        &self,
        user: &AuthUser,
        subscription_id: SubscriptionId,
        entity_id: &str,
    ) -> Result<SubscriptionBinding> {
        let subscription = self.owned(user, subscription_id)?;
        validate_entity(entity_id)?;
        self.bind(&subscription, entity_id)
    }

    /// Unbind one entity. External cleanup is best-effort; the local row is
    /// always removed.
    pub fn delete_binding(
        &self,
        user: &AuthUser,
        subscription_id: SubscriptionId,
        entity_id: &str,
    ) -> Result<()> {
        let subscription = self.owned(user, subscription_id)?;
        let binding = self
            .store
            .get_binding(&UniqueKey::new(subscription_id, entity_id))
            .ok_or_else(|| {
                BrokerError::NotFound(format!(
                    "entity {entity_id} is not bound to subscription {subscription_id}"
                ))
            })?;
        self.unbind(&subscription, &binding)
    }

    pub fn subscribe_entities<S: AsRef<str>>(
        &self,
        user: &AuthUser,
        subscription_id: SubscriptionId,
        entity_ids: &[S],
    ) -> Result<BulkOutcome> {
        let subscription = self.owned(user, subscription_id)?;
        require_targets(entity_ids.len(), "entity ids")?;

        let mut outcome = BulkOutcome::new();
        for entity_id in entity_ids {
            let entity_id = entity_id.as_ref();
            let result = validate_entity(entity_id).and_then(|_| self.bind(&subscription, entity_id));
            outcome.record(entity_id, result.map(|_| ()));
        }
        outcome.finish()
    }

    /// Bind every entity of the given groups.
    pub fn subscribe_groups<S: AsRef<str>>(
        &self,
        user: &AuthUser,
        subscription_id: SubscriptionId,
        group_ids: &[S],
    ) -> Result<BulkOutcome> {
        let subscription = self.owned(user, subscription_id)?;
        require_targets(group_ids.len(), "group ids")?;
        let directory = self.directory()?;

        let entity_ids = resolve(group_ids, |group| directory.entities_in_group(group))?;
        if entity_ids.is_empty() {
            return Err(BrokerError::NotFound("no entities in the given groups".into()));
        }
        self.bind_all(&subscription, &entity_ids)
    }

    /// Bind every entity created from the given templates.
    pub fn subscribe_templates<S: AsRef<str>>(
        &self,
        user: &AuthUser,
        subscription_id: SubscriptionId,
        template_ids: &[S],
    ) -> Result<BulkOutcome> {
        let subscription = self.owned(user, subscription_id)?;
        require_targets(template_ids.len(), "template ids")?;
        let directory = self.directory()?;

        let entity_ids = resolve(template_ids, |template| directory.entities_of_template(template))?;
        if entity_ids.is_empty() {
            return Err(BrokerError::NotFound(
                "no entities for the given templates".into(),
            ));
        }
        self.bind_all(&subscription, &entity_ids)
    }

    pub fn unsubscribe_entities<S: AsRef<str>>(
        &self,
        user: &AuthUser,
        subscription_id: SubscriptionId,
        entity_ids: &[S],
    ) -> Result<BulkOutcome> {
        let subscription = self.owned(user, subscription_id)?;
        require_targets(entity_ids.len(), "entity ids")?;

        let mut outcome = BulkOutcome::new();
        for entity_id in entity_ids {
            let entity_id = entity_id.as_ref();
            let result = match self
                .store
                .get_binding(&UniqueKey::new(subscription_id, entity_id))
            {
                Some(binding) => self.unbind(&subscription, &binding),
                None => Err(BrokerError::NotFound(format!(
                    "entity {entity_id} is not bound to subscription {subscription_id}"
                ))),
            };
            outcome.record(entity_id, result);
        }
        outcome.finish()
    }

    /// Move bindings from one subscription to another.
    ///
    /// Each entity is bound to the target before it is unbound from the
    /// source, so a failed move leaves the original binding in place.
    pub fn change_subscribed<S: AsRef<str>>(
        &self,
        user: &AuthUser,
        from: SubscriptionId,
        to: SubscriptionId,
        entity_ids: &[S],
    ) -> Result<BulkOutcome> {
        let source = self.owned(user, from)?;
        let target = self.owned(user, to)?;
        if from == to {
            return Err(BrokerError::Validation(
                "source and target subscription are the same".into(),
            ));
        }
        require_targets(entity_ids.len(), "entity ids")?;

        let mut outcome = BulkOutcome::new();
        for entity_id in entity_ids {
            let entity_id = entity_id.as_ref();
            let result = match self.store.get_binding(&UniqueKey::new(from, entity_id)) {
                Some(binding) => self
                    .bind(&target, entity_id)
                    .and_then(|_| self.unbind(&source, &binding)),
                None => Err(BrokerError::NotFound(format!(
                    "entity {entity_id} is not bound to subscription {from}"
                ))),
            };
            outcome.record(entity_id, result);
        }
        outcome.finish()
    }

    /// Bind one entity to several of the caller's subscriptions.
    pub fn subscribe_by_device(
        &self,
        user: &AuthUser,
        entity_id: &str,
        subscription_ids: &[SubscriptionId],
    ) -> Result<BulkOutcome> {
        authenticate(user)?;
        validate_entity(entity_id)?;
        require_targets(subscription_ids.len(), "subscription ids")?;
        let subscriptions = subscription_ids
            .iter()
            .map(|id| self.owned(user, *id))
            .collect::<Result<Vec<_>>>()?;

        let mut outcome = BulkOutcome::new();
        for subscription in &subscriptions {
            let result = self.bind(subscription, entity_id).map(|_| ());
            outcome.record(subscription.id.to_string(), result);
        }
        outcome.finish()
    }

    /// Check that the caller owns a subscription with this endpoint.
    pub fn validate_subscribed(&self, user: &AuthUser, endpoint: &str) -> Result<Subscription> {
        authenticate(user)?;
        self.store
            .find_by_endpoint(&user.id, endpoint)
            .ok_or_else(|| BrokerError::Unauthorized(format!("endpoint {endpoint} is not yours")))
    }

    /// Entity IDs bound to one of the caller's subscriptions.
    pub fn list_bound_entities(
        &self,
        user: &AuthUser,
        subscription_id: SubscriptionId,
    ) -> Result<Vec<String>> {
        self.owned(user, subscription_id)?;
        Ok(self
            .store
            .bindings_for(subscription_id)
            .into_iter()
            .map(|b| b.entity_id)
            .collect())
    }

    // --- Stats & Repairs ---

    pub fn stats(&self) -> BrokerStats {
        self.store.stats()
    }

    pub fn pending_repairs(&self) -> Vec<Repair> {
        self.repairs.snapshot()
    }

    /// Retry every queued repair. Repairs that fail again stay queued.
    pub fn reconcile(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for repair in self.repairs.drain() {
            match self.apply_repair(&repair) {
                Ok(true) => report.repaired += 1,
                Ok(false) => {
                    debug!(?repair, "repair no longer needed");
                    report.obsolete += 1;
                }
                Err(e) => {
                    warn!(?repair, error = %e, "repair failed again");
                    self.repairs.record(repair.clone());
                    report.pending.push(repair);
                }
            }
        }

        info!(
            repaired = report.repaired,
            obsolete = report.obsolete,
            pending = report.pending.len(),
            "reconcile finished"
        );
        report
    }

    // --- Internal ---

    /// Load a subscription, requiring the caller to own it.
    fn owned(&self, user: &AuthUser, id: SubscriptionId) -> Result<Subscription> {
        authenticate(user)?;
        let subscription = self
            .store
            .get_subscription(id)
            .ok_or_else(|| BrokerError::NotFound(format!("subscription {id}")))?;
        if subscription.user_id != user.id {
            return Err(BrokerError::Unauthorized(format!(
                "subscription {id} belongs to another user"
            )));
        }
        Ok(subscription)
    }

    fn directory(&self) -> Result<&dyn EntityDirectory> {
        self.directory
            .as_deref()
            .ok_or_else(|| BrokerError::Validation("no entity directory configured".into()))
    }

    fn descriptor(&self, subscription: &Subscription) -> String {
        EndpointDescriptor::for_subscription(subscription, &self.gateway.config().amqp_base)
            .to_string()
    }

    fn bind_all(&self, subscription: &Subscription, entity_ids: &[String]) -> Result<BulkOutcome> {
        let mut outcome = BulkOutcome::new();
        for entity_id in entity_ids {
            let result = self.bind(subscription, entity_id).map(|_| ());
            outcome.record(entity_id.as_str(), result);
        }
        outcome.finish()
    }

    /// Row, then upstream subscription, then membership entry. Any failure
    /// undoes the earlier steps. A gateway failure leaves the upstream
    /// outcome unknown, so the undo is also queued for reconcile.
    fn bind(&self, subscription: &Subscription, entity_id: &str) -> Result<SubscriptionBinding> {
        let binding = self.store.insert_binding(subscription.id, entity_id)?;
        let endpoint = &subscription.endpoint;
        let user_id = &subscription.user_id;
        let unsubscribe = || Repair::Unsubscribe {
            entity_id: entity_id.to_string(),
            subscription_id: subscription.id,
            endpoint: endpoint.clone(),
            user_id: user_id.clone(),
        };

        if let Err(e) = self.gateway.ensure_subscribed(entity_id, endpoint, user_id) {
            warn!(entity_id, subscription = %subscription.id, error = %e, "upstream subscribe failed, rolling back");
            if e.is_gateway() {
                // A timed-out subscribe can still land after this undo.
                if let Err(undo) = self.gateway.ensure_unsubscribed(entity_id, endpoint, user_id) {
                    debug!(entity_id, error = %undo, "rollback unsubscribe failed");
                }
                self.repairs.record(unsubscribe());
            }
            self.discard_row(&binding);
            return Err(e);
        }

        let descriptor = self.descriptor(subscription);
        if let Err(e) = self
            .gateway
            .patch_membership(entity_id, &descriptor, MembershipChange::Add)
        {
            warn!(entity_id, subscription = %subscription.id, error = %e, "membership patch failed, rolling back");
            if e.is_gateway() {
                self.repairs.record(Repair::RemoveDescriptor {
                    entity_id: entity_id.to_string(),
                    descriptor: descriptor.clone(),
                });
            }
            if let Err(undo) = self.gateway.ensure_unsubscribed(entity_id, endpoint, user_id) {
                warn!(entity_id, error = %undo, "rollback unsubscribe failed");
                self.repairs.record(unsubscribe());
            }
            self.discard_row(&binding);
            return Err(e);
        }

        // A rename may have landed between the caller's read and the patch.
        match self.store.get_subscription(subscription.id) {
            Some(current) => {
                let latest = self.descriptor(&current);
                if latest != descriptor {
                    debug!(entity_id, subscription = %subscription.id, "subscription renamed during bind");
                    self.swap_descriptor(entity_id, subscription.id, &descriptor, &latest);
                }
            }
            None => {
                warn!(entity_id, subscription = %subscription.id, "subscription deleted during bind");
                self.repairs.record(Repair::RemoveDescriptor {
                    entity_id: entity_id.to_string(),
                    descriptor,
                });
                self.repairs.record(unsubscribe());
                self.discard_row(&binding);
                return Err(BrokerError::NotFound(format!("subscription {}", subscription.id)));
            }
        }

        info!(entity_id, subscription = %subscription.id, "binding created");
        Ok(binding)
    }

    fn discard_row(&self, binding: &SubscriptionBinding) {
        if let Err(e) = self.store.remove_binding(&binding.unique_key) {
            error!(key = %binding.unique_key, error = %e, "failed to remove binding row during rollback");
        }
    }

    /// Membership entry, then upstream subscription, both best-effort; then
    /// the row.
    fn unbind(&self, subscription: &Subscription, binding: &SubscriptionBinding) -> Result<()> {
        let entity_id = binding.entity_id.as_str();
        let descriptor = self.descriptor(subscription);

        if let Err(e) = self
            .gateway
            .patch_membership(entity_id, &descriptor, MembershipChange::Remove)
        {
            warn!(entity_id, subscription = %subscription.id, error = %e, "membership cleanup failed");
            self.repairs.record(Repair::RemoveDescriptor {
                entity_id: entity_id.to_string(),
                descriptor,
            });
        }

        if let Err(e) =
            self.gateway
                .ensure_unsubscribed(entity_id, &subscription.endpoint, &subscription.user_id)
        {
            warn!(entity_id, subscription = %subscription.id, error = %e, "upstream unsubscribe failed");
            self.repairs.record(Repair::Unsubscribe {
                entity_id: entity_id.to_string(),
                subscription_id: subscription.id,
                endpoint: subscription.endpoint.clone(),
                user_id: subscription.user_id.clone(),
            });
        }

        self.store.remove_binding(&binding.unique_key)?;
        info!(entity_id, subscription = %subscription.id, "binding deleted");
        Ok(())
    }

    /// Swap the old descriptor for the new one on every bound entity.
    fn propagate_rename(&self, before: &Subscription, after: &Subscription) {
        let old = self.descriptor(before);
        let new = self.descriptor(after);
        let bindings = self.store.bindings_for(after.id);
        info!(subscription = %after.id, entities = bindings.len(), "propagating rename");

        for binding in &bindings {
            self.swap_descriptor(&binding.entity_id, after.id, &old, &new);
        }
    }

    /// Replace one descriptor with another in an entity's membership list.
    /// Failed steps are queued for reconcile.
    fn swap_descriptor(&self, entity_id: &str, subscription_id: SubscriptionId, old: &str, new: &str) {
        if let Err(e) = self
            .gateway
            .patch_membership(entity_id, old, MembershipChange::Remove)
        {
            warn!(entity_id, error = %e, "removing old descriptor failed");
            self.repairs.record(Repair::RemoveDescriptor {
                entity_id: entity_id.to_string(),
                descriptor: old.to_string(),
            });
        }
        if let Err(e) = self
            .gateway
            .patch_membership(entity_id, new, MembershipChange::Add)
        {
            warn!(entity_id, error = %e, "adding new descriptor failed");
            self.repairs.record(Repair::AddDescriptor {
                entity_id: entity_id.to_string(),
                subscription_id,
            });
        }
    }

    /// Apply one repair. `Ok(false)` means the store no longer calls for it.
    fn apply_repair(&self, repair: &Repair) -> Result<bool> {
        match repair {
            Repair::RemoveDescriptor {
                entity_id,
                descriptor,
            } => {
                let still_bound = EndpointDescriptor::parse(descriptor)
                    .ok()
                    .and_then(|d| self.bound_subscription(d.subscription_id, entity_id))
                    .is_some_and(|s| self.descriptor(&s) == *descriptor);
                if still_bound {
                    return Ok(false);
                }
                self.gateway
                    .patch_membership(entity_id, descriptor, MembershipChange::Remove)?;
            }
            Repair::AddDescriptor {
                entity_id,
                subscription_id,
            } => {
                let Some(subscription) = self.bound_subscription(*subscription_id, entity_id) else {
                    return Ok(false);
                };
                let descriptor = self.descriptor(&subscription);
                self.gateway
                    .patch_membership(entity_id, &descriptor, MembershipChange::Add)?;
            }
            Repair::Unsubscribe {
                entity_id,
                subscription_id,
                endpoint,
                user_id,
            } => {
                let rebound = self
                    .bound_subscription(*subscription_id, entity_id)
                    .is_some_and(|s| s.endpoint == *endpoint);
                if rebound {
                    return Ok(false);
                }
                self.gateway
                    .ensure_unsubscribed(entity_id, endpoint, user_id)?;
            }
        }
        Ok(true)
    }

    /// The subscription, if it is currently bound to the entity.
    fn bound_subscription(&self, id: SubscriptionId, entity_id: &str) -> Option<Subscription> {
        self.store.get_binding(&UniqueKey::new(id, entity_id))?;
        self.store.get_subscription(id)
    }
}

fn authenticate(user: &AuthUser) -> Result<()> {
    if user.id.is_empty() {
        return Err(BrokerError::Unauthenticated("missing user id".into()));
    }
    Ok(())
}

fn validate_entity(entity_id: &str) -> Result<()> {
    if entity_id.is_empty() {
        return Err(BrokerError::Validation("entity id is empty".into()));
    }
    Ok(())
}

fn require_targets(count: usize, what: &str) -> Result<()> {
    if count == 0 {
        return Err(BrokerError::Validation(format!("no {what} given")));
    }
    Ok(())
}

/// Resolve ids to entity ids, keeping first-seen order without repeats.
fn resolve<S, F>(ids: &[S], mut lookup: F) -> Result<Vec<String>>
where
    S: AsRef<str>,
    F: FnMut(&str) -> Result<Vec<String>>,
{
    let mut seen = HashSet::new();
    let mut entity_ids = Vec::new();
    for id in ids {
        for entity_id in lookup(id.as_ref())? {
            if seen.insert(entity_id.clone()) {
                entity_ids.push(entity_id);
            }
        }
    }
    Ok(entity_ids)
}
