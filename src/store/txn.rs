use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard};
use ulid::Ulid;

use crate::error::Error;
use crate::model::*;

use super::Store;

/// The set of locks a transaction takes up front.
///
/// Locks are always acquired in the order
/// commit gate → invite → tenant → users (sorted) → resources (sorted),
/// so two transactions can never wait on each other in a cycle.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    invite: Option<Ulid>,
    tenant: Option<Ulid>,
    tenant_resources: bool,
    users: BTreeSet<Ulid>,
    resources: BTreeSet<Ulid>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invite(mut self, id: Ulid) -> Self {
        self.invite = Some(id);
        self
    }

    pub fn tenant(mut self, id: Ulid) -> Self {
        self.tenant = Some(id);
        self
    }

    /// Also write-lock every room of the scoped tenant.
    pub fn with_tenant_resources(mut self) -> Self {
        self.tenant_resources = true;
        self
    }

    pub fn user(mut self, id: Ulid) -> Self {
        self.users.insert(id);
        self
    }

    pub fn resource(mut self, id: Ulid) -> Self {
        self.resources.insert(id);
        self
    }
}

enum Claim {
    Slug(String, Ulid),
    InviteCode(String, Ulid),
}

/// A unit of work over the store. Reads see the state as of lock
/// acquisition; staged events become visible only on `commit`.
/// Dropping an uncommitted `Txn` discards its events and unique-value claims.
pub struct Txn<'a> {
    store: &'a Store,
    now: Ms,
    _gate: OwnedRwLockReadGuard<()>,
    invite: Option<(Ulid, OwnedMutexGuard<()>)>,
    tenant: Option<(Ulid, OwnedMutexGuard<()>)>,
    users: BTreeMap<Ulid, OwnedMutexGuard<()>>,
    resources: BTreeMap<Ulid, OwnedRwLockWriteGuard<ResourceState>>,
    staged: Vec<Event>,
    claims: Vec<Claim>,
    committed: bool,
}

fn lock_handle(map: &dashmap::DashMap<Ulid, Arc<Mutex<()>>>, id: Ulid) -> Arc<Mutex<()>> {
    map.entry(id).or_default().value().clone()
}

impl Store {
    /// Start a transaction holding every lock in `scope`.
    pub async fn begin(&self, scope: Scope) -> Result<Txn<'_>, Error> {
        let gate = self.commit_gate.clone().read_owned().await;

        let invite = match scope.invite {
            Some(id) => Some((id, lock_handle(&self.invite_locks, id).lock_owned().await)),
            None => None,
        };
        let tenant = match scope.tenant {
            Some(id) => Some((id, lock_handle(&self.tenant_locks, id).lock_owned().await)),
            None => None,
        };

        let mut users = BTreeMap::new();
        for id in scope.users {
            users.insert(id, lock_handle(&self.user_locks, id).lock_owned().await);
        }

        // Room creation and deletion hold the tenant lock, so this set is stable.
        let mut resource_ids = scope.resources;
        if scope.tenant_resources
            && let Some(tenant_id) = scope.tenant
            && let Some(ids) = self.tenant_resources.get(&tenant_id)
        {
            resource_ids.extend(ids.iter().copied());
        }

        let mut resources = BTreeMap::new();
        for id in resource_ids {
            let rs = self.resource_state(&id).ok_or_else(|| Error::not_found("room", id))?;
            let guard = rs.clone().write_owned().await;
            // The room may have been deleted while we waited for its lock.
            if !self.resource_state(&id).is_some_and(|current| Arc::ptr_eq(&current, &rs)) {
                return Err(Error::not_found("room", id));
            }
            resources.insert(id, guard);
        }

        Ok(Txn {
            store: self,
            now: self.now(),
            _gate: gate,
            invite,
            tenant,
            users,
            resources,
            staged: Vec::new(),
            claims: Vec::new(),
            committed: false,
        })
    }

    /// Run `f` inside a transaction over `scope` and commit what it stages.
    pub async fn transact<T, F>(&self, scope: Scope, f: F) -> Result<T, Error>
    where
        F: FnOnce(&mut Txn<'_>) -> Result<T, Error>,
    {
        let mut txn = self.begin(scope).await?;
        let out = f(&mut txn)?;
        txn.commit().await?;
        Ok(out)
    }

    pub async fn with_resource_lock<T, F>(&self, resource_id: Ulid, f: F) -> Result<T, Error>
    where
        F: FnOnce(&mut Txn<'_>) -> Result<T, Error>,
    {
        self.transact(Scope::new().resource(resource_id), f).await
    }

    /// Lock a tenant together with all of its rooms.
    pub async fn with_tenant_lock<T, F>(&self, tenant_id: Ulid, f: F) -> Result<T, Error>
    where
        F: FnOnce(&mut Txn<'_>) -> Result<T, Error>,
    {
        self.transact(Scope::new().tenant(tenant_id).with_tenant_resources(), f)
            .await
    }

    pub async fn with_invite_lock<T, F>(&self, invite_id: Ulid, f: F) -> Result<T, Error>
    where
        F: FnOnce(&mut Txn<'_>) -> Result<T, Error>,
    {
        self.transact(Scope::new().invite(invite_id), f).await
    }

    pub async fn with_user_lock<T, F>(&self, user_id: Ulid, f: F) -> Result<T, Error>
    where
        F: FnOnce(&mut Txn<'_>) -> Result<T, Error>,
    {
        self.transact(Scope::new().user(user_id), f).await
    }
}

impl Txn<'_> {
    /// Clock reading taken when the transaction started.
    pub fn now(&self) -> Ms {
        self.now
    }

    pub fn stage(&mut self, event: Event) {
        self.staged.push(event);
    }

    pub fn staged(&self) -> &[Event] {
        &self.staged
    }

    // ── Reads ────────────────────────────────────────────────

    pub fn member(&self, user_id: &Ulid) -> Option<Member> {
        self.store.members.get(user_id).map(|m| m.value().clone())
    }

    pub fn tenant(&self, tenant_id: &Ulid) -> Option<Tenant> {
        self.store.tenants.get(tenant_id).map(|t| t.value().clone())
    }

    pub fn invite(&self, invite_id: &Ulid) -> Option<InviteCode> {
        self.store.invites.get(invite_id).map(|i| i.value().clone())
    }

    pub fn tenant_members(&self, tenant_id: Ulid) -> Vec<Member> {
        self.store
            .members
            .iter()
            .filter(|m| m.belongs_to(tenant_id))
            .map(|m| m.value().clone())
            .collect()
    }

    /// Only consistent when the tenant's lock is held by this transaction.
    pub fn active_admin_count(&self, tenant_id: Ulid) -> usize {
        self.store
            .members
            .iter()
            .filter(|m| m.belongs_to(tenant_id) && m.is_active_admin())
            .count()
    }

    pub fn room_count(&self, tenant_id: &Ulid) -> usize {
        self.store
            .tenant_resources
            .get(tenant_id)
            .map_or(0, |ids| ids.len())
    }

    pub fn slug_taken(&self, slug: &str) -> bool {
        self.store.slugs.contains_key(slug)
    }

    pub fn resource(&self, resource_id: &Ulid) -> Option<&ResourceState> {
        self.resources.get(resource_id).map(|g| &**g)
    }

    pub fn locked_resources(&self) -> impl Iterator<Item = &ResourceState> {
        self.resources.values().map(|g| &**g)
    }

    /// A reservation on one of the locked rooms.
    pub fn reservation(&self, reservation_id: &Ulid) -> Option<&Reservation> {
        let resource_id = *self.store.reservation_index.get(reservation_id)?;
        self.resource(&resource_id)?.reservation(reservation_id)
    }

    // ── Unique-value claims ──────────────────────────────────

    /// Reserve a slug for `tenant_id`. Released again if the transaction aborts.
    pub fn claim_slug(&mut self, slug: &str, tenant_id: Ulid) -> Result<(), Error> {
        match self.store.slugs.entry(slug.to_string()) {
            Entry::Occupied(_) => Err(Error::UniqueViolation("tenant slug")),
            Entry::Vacant(v) => {
                v.insert(tenant_id);
                self.claims.push(Claim::Slug(slug.to_string(), tenant_id));
                Ok(())
            }
        }
    }

    pub fn claim_invite_code(&mut self, code: &str, invite_id: Ulid) -> Result<(), Error> {
        match self.store.invite_codes.entry(code.to_string()) {
            Entry::Occupied(_) => Err(Error::UniqueViolation("invite code")),
            Entry::Vacant(v) => {
                v.insert(invite_id);
                self.claims.push(Claim::InviteCode(code.to_string(), invite_id));
                Ok(())
            }
        }
    }

    // ── Commit ───────────────────────────────────────────────

    fn holds_tenant(&self, id: &Ulid) -> bool {
        self.tenant.as_ref().is_some_and(|(t, _)| t == id)
    }

    fn holds_user(&self, id: &Ulid) -> bool {
        self.users.contains_key(id)
    }

    /// Whether this transaction holds the locks `event` mutates under.
    fn covers(&self, event: &Event) -> bool {
        if let Some(resource_id) = event.resource_id() {
            return self.resources.contains_key(&resource_id);
        }
        match event {
            Event::UserRegistered { member } => self.holds_user(&member.user_id),
            Event::CredentialsUpdated { user_id, .. } => self.holds_user(user_id),
            Event::TenantCreated { tenant } => self.holds_tenant(&tenant.id),
            Event::TenantUpdated { id, .. } => self.holds_tenant(id),
            Event::MemberAssigned { user_id, tenant_id, .. } => {
                self.holds_user(user_id) && self.holds_tenant(tenant_id)
            }
            Event::MemberRoleChanged { user_id, .. }
            | Event::MemberActiveChanged { user_id, .. }
            | Event::MemberUnassigned { user_id } => {
                let tenant_id = self.store.members.get(user_id).and_then(|m| m.tenant_id);
                self.holds_user(user_id) && tenant_id.is_some_and(|t| self.holds_tenant(&t))
            }
            Event::ResourceCreated { resource } => self.holds_tenant(&resource.tenant_id),
            Event::ResourceDeleted { id, tenant_id } => {
                self.holds_tenant(tenant_id) && self.resources.contains_key(id)
            }
            Event::InviteCreated { invite } => self.holds_tenant(&invite.tenant_id),
            Event::InviteRedeemed { id, .. } | Event::InviteRevoked { id } => {
                self.invite.as_ref().is_some_and(|(i, _)| i == id)
            }
            _ => false,
        }
    }

    /// Append the staged events to the WAL as one record, apply them, then
    /// publish them. Nothing is applied if the WAL append fails.
    pub async fn commit(mut self) -> Result<(), Error> {
        if let Some(event) = self.staged.iter().find(|e| !self.covers(e)) {
            return Err(Error::Internal(format!("event outside transaction scope: {event:?}")));
        }
        if self.staged.is_empty() {
            self.committed = true;
            return Ok(());
        }

        let events = std::mem::take(&mut self.staged);
        self.store.wal_append(events.clone()).await?;
        self.committed = true;

        let store = self.store;
        for event in &events {
            match (event.resource_id(), event) {
                (Some(resource_id), _) => {
                    if let Some(guard) = self.resources.get_mut(&resource_id) {
                        store.apply_to_resource(guard, event);
                    }
                }
                (None, Event::ResourceDeleted { id, tenant_id }) => {
                    if let Some(guard) = self.resources.get(id) {
                        store.forget_resource(*id, *tenant_id, &guard.reservations);
                    }
                }
                (None, _) => store.apply_global(event),
            }
        }
        for event in &events {
            store.publish(event);
        }
        Ok(())
    }
}

impl Drop for Txn<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for claim in self.claims.drain(..) {
            match claim {
                Claim::Slug(slug, id) => {
                    self.store.slugs.remove_if(&slug, |_, owner| *owner == id);
                }
                Claim::InviteCode(code, id) => {
                    self.store.invite_codes.remove_if(&code, |_, owner| *owner == id);
                }
            }
        }
    }
}
