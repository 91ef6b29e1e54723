use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::info;
use ulid::Ulid;

use crate::availability::free_spans;
use crate::error::Error;
use crate::limits::*;
use crate::model::*;
use crate::store::{Scope, Store};

#[derive(Debug, Clone)]
pub struct RoomSpec {
    pub name: String,
    pub description: Option<String>,
    pub capacity: u32,
    pub floor: Option<i32>,
    pub amenities: Vec<String>,
    pub active: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RoomPatch {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub capacity: Option<u32>,
    pub floor: Option<Option<i32>>,
    pub amenities: Option<Vec<String>>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct RoomFilter {
    pub min_capacity: Option<u32>,
    pub max_capacity: Option<u32>,
    /// Rooms must offer every listed amenity.
    pub amenities: Vec<String>,
    pub active: Option<bool>,
}

impl RoomFilter {
    fn matches(&self, room: &Resource) -> bool {
        self.min_capacity.is_none_or(|min| room.capacity >= min)
            && self.max_capacity.is_none_or(|max| room.capacity <= max)
            && self.active.is_none_or(|active| room.active == active)
            && self.amenities.iter().all(|a| room.amenities.contains(a))
    }
}

#[derive(Debug, Clone)]
pub struct RoomSchedule {
    pub room: Resource,
    pub window: Span,
    /// Non-cancelled reservations overlapping the window, by start.
    pub reservations: Vec<Reservation>,
    pub free: Vec<Span>,
}

pub struct RoomCatalog {
    store: Arc<Store>,
}

fn validate_name(name: &str) -> Result<String, Error> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::validation("room name is required"));
    }
    if name.len() > MAX_ROOM_NAME_LEN {
        return Err(Error::LimitExceeded("room name too long"));
    }
    Ok(name.to_string())
}

fn validate_capacity(capacity: u32) -> Result<u32, Error> {
    if capacity == 0 {
        return Err(Error::validation("capacity must be at least 1"));
    }
    Ok(capacity)
}

/// Trim, drop blanks and duplicates, keep first-seen order.
fn normalize_amenities(amenities: Vec<String>) -> Result<Vec<String>, Error> {
    let mut seen = BTreeSet::new();
    let out: Vec<String> = amenities
        .into_iter()
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty() && seen.insert(a.clone()))
        .collect();
    if out.len() > MAX_AMENITIES {
        return Err(Error::LimitExceeded("too many amenities"));
    }
    Ok(out)
}

impl RoomCatalog {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub async fn create(&self, principal: &Principal, spec: RoomSpec) -> Result<Resource, Error> {
        let tenant_id = principal.require_admin()?;
        let resource = Resource {
            id: Ulid::new(),
            tenant_id,
            name: validate_name(&spec.name)?,
            description: spec.description.filter(|d| !d.trim().is_empty()),
            capacity: validate_capacity(spec.capacity)?,
            floor: spec.floor,
            amenities: normalize_amenities(spec.amenities)?,
            active: spec.active,
        };

        let created = self
            .store
            .transact(Scope::new().tenant(tenant_id), |txn| {
                if txn.tenant(&tenant_id).is_none() {
                    return Err(Error::not_found("tenant", tenant_id));
                }
                if txn.room_count(&tenant_id) >= MAX_ROOMS_PER_TENANT {
                    return Err(Error::LimitExceeded("too many rooms"));
                }
                txn.stage(Event::ResourceCreated {
                    resource: resource.clone(),
                });
                Ok(resource)
            })
            .await?;
        info!(id = %created.id, tenant = %tenant_id, name = %created.name, "room created");
        Ok(created)
    }

    pub async fn update(&self, principal: &Principal, room_id: Ulid, patch: RoomPatch) -> Result<Resource, Error> {
        let tenant_id = principal.require_admin()?;
        let name = patch.name.as_deref().map(validate_name).transpose()?;
        let capacity = patch.capacity.map(validate_capacity).transpose()?;
        let amenities = patch.amenities.map(normalize_amenities).transpose()?;

        self.store
            .with_resource_lock(room_id, move |txn| {
                let current = txn
                    .resource(&room_id)
                    .map(|rs| rs.resource.clone())
                    .filter(|r| r.tenant_id == tenant_id)
                    .ok_or_else(|| Error::not_found("room", room_id))?;

                let mut next = current.clone();
                if let Some(name) = name {
                    next.name = name;
                }
                if let Some(description) = patch.description {
                    next.description = description.filter(|d| !d.trim().is_empty());
                }
                if let Some(capacity) = capacity {
                    next.capacity = capacity;
                }
                if let Some(floor) = patch.floor {
                    next.floor = floor;
                }
                if let Some(amenities) = amenities {
                    next.amenities = amenities;
                }
                if let Some(active) = patch.active {
                    next.active = active;
                }

                if next != current {
                    txn.stage(Event::ResourceUpdated {
                        resource: next.clone(),
                    });
                }
                Ok(next)
            })
            .await
    }

    /// Rejected while the room still has confirmed reservations that have not ended.
    pub async fn delete(&self, principal: &Principal, room_id: Ulid) -> Result<(), Error> {
        let tenant_id = principal.require_admin()?;
        self.store
            .transact(Scope::new().tenant(tenant_id).resource(room_id), |txn| {
                let now = txn.now();
                let rs = txn
                    .resource(&room_id)
                    .filter(|rs| rs.resource.tenant_id == tenant_id)
                    .ok_or_else(|| Error::not_found("room", room_id))?;
                if rs.reservations.iter().any(|r| r.is_confirmed() && r.span.end > now) {
                    return Err(Error::validation("room has active reservations"));
                }
                txn.stage(Event::ResourceDeleted {
                    id: room_id,
                    tenant_id,
                });
                Ok(())
            })
            .await?;
        info!(id = %room_id, tenant = %tenant_id, "room deleted");
        Ok(())
    }

    pub async fn get(&self, tenant_id: Ulid, room_id: Ulid) -> Result<Resource, Error> {
        self.store
            .resource(&room_id)
            .await
            .filter(|r| r.tenant_id == tenant_id)
            .ok_or_else(|| Error::not_found("room", room_id))
    }

    /// Rooms of a tenant matching `filter`, sorted by name.
    pub async fn list(&self, tenant_id: Ulid, filter: &RoomFilter) -> Vec<Resource> {
        let mut rooms = Vec::new();
        for rs in self.store.resources_of(tenant_id) {
            let guard = rs.read().await;
            if filter.matches(&guard.resource) {
                rooms.push(guard.resource.clone());
            }
        }
        rooms.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        rooms
    }

    /// Reservations and free gaps for one room over `window`.
    pub async fn schedule(&self, principal: &Principal, room_id: Ulid, window: Span) -> Result<RoomSchedule, Error> {
        let tenant_id = principal.require_tenant()?;
        if window.duration_ms() > MAX_QUERY_WINDOW_MS {
            return Err(Error::LimitExceeded("query window too wide"));
        }
        let rs = self
            .store
            .resource_state(&room_id)
            .ok_or_else(|| Error::not_found("room", room_id))?;
        let guard = rs.read().await;
        if guard.resource.tenant_id != tenant_id {
            return Err(Error::not_found("room", room_id));
        }

        let reservations: Vec<Reservation> = guard
            .overlapping(&window)
            .filter(|r| !r.is_cancelled())
            .cloned()
            .collect();
        let busy: Vec<Span> = reservations.iter().map(|r| r.span).collect();
        Ok(RoomSchedule {
            room: guard.resource.clone(),
            window,
            free: free_spans(&window, &busy),
            reservations,
        })
    }
}
