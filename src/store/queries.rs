use ulid::Ulid;

use crate::model::*;

use super::{SharedResourceState, Store};

impl Store {
    pub fn member(&self, user_id: &Ulid) -> Option<Member> {
        self.members.get(user_id).map(|m| m.value().clone())
    }

    pub fn tenant(&self, tenant_id: &Ulid) -> Option<Tenant> {
        self.tenants.get(tenant_id).map(|t| t.value().clone())
    }

    pub fn tenant_by_slug(&self, slug: &str) -> Option<Tenant> {
        let id = *self.slugs.get(slug)?;
        self.tenant(&id)
    }

    /// Members of a tenant, ordered by email.
    pub fn members_of(&self, tenant_id: Ulid) -> Vec<Member> {
        let mut members: Vec<Member> = self
            .members
            .iter()
            .filter(|m| m.belongs_to(tenant_id))
            .map(|m| m.value().clone())
            .collect();
        members.sort_by(|a, b| a.email.cmp(&b.email));
        members
    }

    pub fn resource_state(&self, resource_id: &Ulid) -> Option<SharedResourceState> {
        self.resources.get(resource_id).map(|e| e.value().clone())
    }

    pub fn resource_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_index.get(reservation_id).map(|e| *e.value())
    }

    pub async fn resource(&self, resource_id: &Ulid) -> Option<Resource> {
        let rs = self.resource_state(resource_id)?;
        let guard = rs.read().await;
        Some(guard.resource.clone())
    }

    /// Room states of a tenant in id order.
    pub fn resources_of(&self, tenant_id: Ulid) -> Vec<SharedResourceState> {
        let ids: Vec<Ulid> = self
            .tenant_resources
            .get(&tenant_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.resource_state(id)).collect()
    }

    pub async fn reservation(&self, reservation_id: &Ulid) -> Option<Reservation> {
        let resource_id = self.resource_for_reservation(reservation_id)?;
        let rs = self.resource_state(&resource_id)?;
        let guard = rs.read().await;
        guard.reservation(reservation_id).cloned()
    }

    /// Reservations of any status on a room that overlap `window`.
    pub async fn reservations_in(&self, resource_id: &Ulid, window: &Span) -> Vec<Reservation> {
        let Some(rs) = self.resource_state(resource_id) else {
            return Vec::new();
        };
        let guard = rs.read().await;
        guard.overlapping(window).cloned().collect()
    }

    /// Every reservation owned by `user_id`, ordered by start.
    pub async fn reservations_owned_by(&self, user_id: &Ulid) -> Vec<Reservation> {
        let ids: Vec<Ulid> = self
            .owned
            .get(user_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(r) = self.reservation(&id).await {
                out.push(r);
            }
        }
        out.sort_by_key(|r| r.span.start);
        out
    }

    pub fn invite(&self, invite_id: &Ulid) -> Option<InviteCode> {
        self.invites.get(invite_id).map(|i| i.value().clone())
    }

    /// Look up an invite by its normalized code.
    pub fn invite_by_code(&self, code: &str) -> Option<InviteCode> {
        let id = *self.invite_codes.get(code)?;
        self.invite(&id)
    }

    pub fn invites_of(&self, tenant_id: Ulid) -> Vec<InviteCode> {
        let mut invites: Vec<InviteCode> = self
            .invites
            .iter()
            .filter(|i| i.tenant_id == tenant_id)
            .map(|i| i.value().clone())
            .collect();
        invites.sort_by_key(|i| i.created_at);
        invites
    }
}
