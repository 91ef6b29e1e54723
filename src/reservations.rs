use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};
use ulid::Ulid;

use crate::conflict::{check_no_conflict, validate_booking_range};
use crate::error::Error;
use crate::limits::*;
use crate::model::*;
use crate::store::{Store, Txn};

/// A create request. Instants are raw so ordering is checked here.
#[derive(Debug, Clone)]
pub struct NewReservation {
    pub resource_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub title: String,
    pub description: Option<String>,
    pub participants: Vec<Ulid>,
}

/// Partial update. `None` leaves a field alone; `participants` replaces the whole set.
#[derive(Debug, Clone, Default)]
pub struct ReservationPatch {
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub participants: Option<Vec<Ulid>>,
}

pub struct ReservationEngine {
    store: Arc<Store>,
}

fn validate_title(title: &str) -> Result<String, Error> {
    let title = title.trim();
    if title.is_empty() {
        return Err(Error::validation("title is required"));
    }
    if title.len() > MAX_TITLE_LEN {
        return Err(Error::LimitExceeded("title too long"));
    }
    Ok(title.to_string())
}

fn validate_description(description: Option<String>) -> Result<Option<String>, Error> {
    match description {
        Some(d) if d.len() > MAX_DESCRIPTION_LEN => Err(Error::LimitExceeded("description too long")),
        Some(d) if d.trim().is_empty() => Ok(None),
        other => Ok(other),
    }
}

/// Dedupe, drop the owner, and require tenant membership for the rest.
fn normalize_participants(
    txn: &Txn<'_>,
    tenant_id: Ulid,
    owner_id: Ulid,
    requested: &[Ulid],
) -> Result<Vec<Ulid>, Error> {
    let mut seen = HashSet::new();
    let participants: Vec<Ulid> = requested
        .iter()
        .copied()
        .filter(|id| *id != owner_id && seen.insert(*id))
        .collect();
    if participants.len() > MAX_PARTICIPANTS {
        return Err(Error::LimitExceeded("too many participants"));
    }
    for id in &participants {
        if !txn.member(id).is_some_and(|m| m.belongs_to(tenant_id)) {
            return Err(Error::validation(format!(
                "participant {id} is not a member of this tenant"
            )));
        }
    }
    Ok(participants)
}

fn authorize(principal: &Principal, reservation: &Reservation) -> Result<(), Error> {
    let is_owner = reservation.owner_id == principal.user_id;
    let is_tenant_admin = principal.is_admin() && principal.tenant_id == Some(reservation.tenant_id);
    if is_owner || is_tenant_admin {
        Ok(())
    } else {
        Err(Error::validation(
            "only the owner or a tenant admin can change this reservation",
        ))
    }
}

/// Look up a reservation on a locked room, hiding other tenants' rows.
fn scoped<'t>(txn: &'t Txn<'_>, id: Ulid, tenant_id: Ulid) -> Result<&'t Reservation, Error> {
    txn.reservation(&id)
        .filter(|r| r.tenant_id == tenant_id)
        .ok_or_else(|| Error::not_found("reservation", id))
}

impl ReservationEngine {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    fn locate(&self, id: Ulid) -> Result<Ulid, Error> {
        self.store
            .resource_for_reservation(&id)
            .ok_or_else(|| Error::not_found("reservation", id))
    }

    pub async fn create(&self, principal: &Principal, req: NewReservation) -> Result<Reservation, Error> {
        let started = Instant::now();
        let tenant_id = principal.require_tenant()?;
        let owner_id = principal.user_id;
        let title = validate_title(&req.title)?;
        let description = validate_description(req.description)?;
        let resource_id = req.resource_id;

        let reservation = self
            .store
            .with_resource_lock(resource_id, move |txn| {
                let now = txn.now();
                let span = validate_booking_range(req.start, req.end, now)?;

                let owner = txn
                    .member(&owner_id)
                    .filter(|m| m.belongs_to(tenant_id))
                    .ok_or_else(|| Error::validation("user is not a member of this tenant"))?;
                if !owner.active {
                    return Err(Error::validation("inactive members cannot create reservations"));
                }
                let participants = normalize_participants(txn, tenant_id, owner_id, &req.participants)?;

                let rs = txn
                    .resource(&resource_id)
                    .filter(|rs| rs.resource.tenant_id == tenant_id)
                    .ok_or_else(|| Error::not_found("room", resource_id))?;
                if !rs.resource.active {
                    return Err(Error::validation("room is not active"));
                }
                check_no_conflict(rs, &span, None)?;

                let reservation = Reservation {
                    id: Ulid::new(),
                    resource_id,
                    tenant_id,
                    owner_id,
                    title,
                    description,
                    span,
                    status: ReservationStatus::Confirmed,
                    participants,
                    remote_event_id: None,
                    sync_status: SyncStatus::Unsynced,
                    created_at: now,
                    updated_at: now,
                };
                txn.stage(Event::ReservationCreated {
                    reservation: reservation.clone(),
                });
                Ok(reservation)
            })
            .await?;

        metrics::counter!(crate::observability::RESERVATIONS_CREATED_TOTAL).increment(1);
        metrics::histogram!(crate::observability::RESERVATION_CREATE_SECONDS)
            .record(started.elapsed().as_secs_f64());
        info!(id = %reservation.id, room = %resource_id, owner = %owner_id, "reservation created");
        Ok(reservation)
    }

    pub async fn modify(&self, principal: &Principal, id: Ulid, patch: ReservationPatch) -> Result<Reservation, Error> {
        let tenant_id = principal.require_tenant()?;
        let resource_id = self.locate(id)?;
        let principal = *principal;

        self.store
            .with_resource_lock(resource_id, move |txn| {
                let now = txn.now();
                let current = scoped(txn, id, tenant_id)?.clone();
                authorize(&principal, &current)?;
                if current.is_cancelled() {
                    return Err(Error::validation("cannot modify a cancelled reservation"));
                }
                if current.span.end <= now {
                    return Err(Error::validation("cannot modify a reservation that has already ended"));
                }

                let mut next = current.clone();
                if patch.start.is_some() || patch.end.is_some() {
                    let start = patch.start.unwrap_or(current.span.start);
                    let end = patch.end.unwrap_or(current.span.end);
                    let span = Span::try_new(start, end)
                        .ok_or_else(|| Error::validation("start time must be before end time"))?;
                    if span.duration_ms() > MAX_RESERVATION_DURATION_MS {
                        return Err(Error::validation("reservation cannot be longer than 8 hours"));
                    }
                    if span.end <= now {
                        return Err(Error::validation("reservation must end in the future"));
                    }
                    if span != current.span {
                        let rs = txn
                            .resource(&resource_id)
                            .ok_or_else(|| Error::not_found("room", resource_id))?;
                        check_no_conflict(rs, &span, Some(id))?;
                        next.span = span;
                    }
                }
                if let Some(title) = &patch.title {
                    next.title = validate_title(title)?;
                }
                if let Some(description) = patch.description {
                    next.description = validate_description(description)?;
                }
                if let Some(participants) = &patch.participants {
                    next.participants = normalize_participants(txn, tenant_id, current.owner_id, participants)?;
                }

                if next == current {
                    return Ok(current);
                }
                if next.sync_status == SyncStatus::Synced {
                    next.sync_status = SyncStatus::Unsynced;
                }
                next.updated_at = now;
                txn.stage(Event::ReservationUpdated {
                    reservation: next.clone(),
                });
                debug!(%id, "reservation modified");
                Ok(next)
            })
            .await
    }

    /// Soft-cancel. Cancelling twice is an error, not a no-op.
    pub async fn cancel(&self, principal: &Principal, id: Ulid) -> Result<Reservation, Error> {
        let tenant_id = principal.require_tenant()?;
        let resource_id = self.locate(id)?;
        let principal = *principal;

        let cancelled = self
            .store
            .with_resource_lock(resource_id, move |txn| {
                let now = txn.now();
                let mut reservation = scoped(txn, id, tenant_id)?.clone();
                authorize(&principal, &reservation)?;
                if reservation.is_cancelled() {
                    return Err(Error::validation("reservation is already cancelled"));
                }
                txn.stage(Event::ReservationCancelled {
                    id,
                    resource_id,
                    owner_id: reservation.owner_id,
                    at: now,
                });
                reservation.status = ReservationStatus::Cancelled;
                reservation.updated_at = now;
                Ok(reservation)
            })
            .await?;

        metrics::counter!(crate::observability::RESERVATIONS_CANCELLED_TOTAL, "reason" => "owner").increment(1);
        info!(%id, by = %principal.user_id, "reservation cancelled");
        Ok(cancelled)
    }

    /// Administrative purge: removes the row outright, scoped to the tenant only.
    pub async fn hard_delete(&self, tenant_id: Ulid, id: Ulid) -> Result<(), Error> {
        let resource_id = self.locate(id)?;
        self.store
            .with_resource_lock(resource_id, move |txn| {
                let reservation = scoped(txn, id, tenant_id)?;
                let event = Event::ReservationPurged {
                    id,
                    resource_id,
                    owner_id: reservation.owner_id,
                    remote_event_id: reservation.remote_event_id.clone(),
                };
                txn.stage(event);
                Ok(())
            })
            .await?;
        info!(%id, tenant = %tenant_id, "reservation purged");
        Ok(())
    }

    pub async fn get(&self, principal: &Principal, id: Ulid) -> Result<Reservation, Error> {
        let tenant_id = principal.require_tenant()?;
        self.store
            .reservation(&id)
            .await
            .filter(|r| r.tenant_id == tenant_id)
            .ok_or_else(|| Error::not_found("reservation", id))
    }

    /// The caller's own reservations in their current tenant, by start time.
    /// `upcoming_only` keeps confirmed reservations that have not ended.
    pub async fn list_mine(&self, principal: &Principal, upcoming_only: bool) -> Result<Vec<Reservation>, Error> {
        let tenant_id = principal.require_tenant()?;
        let now = self.store.now();
        let mut mine = self.store.reservations_owned_by(&principal.user_id).await;
        mine.retain(|r| r.tenant_id == tenant_id && (!upcoming_only || (r.is_confirmed() && r.span.end > now)));
        Ok(mine)
    }

    /// Non-cancelled reservations in the tenant overlapping `window`,
    /// optionally restricted to one room.
    pub async fn list_for_tenant(
        &self,
        principal: &Principal,
        window: Span,
        room: Option<Ulid>,
    ) -> Result<Vec<Reservation>, Error> {
        let tenant_id = principal.require_tenant()?;
        if window.duration_ms() > MAX_QUERY_WINDOW_MS {
            return Err(Error::LimitExceeded("query window too wide"));
        }

        let rooms = match room {
            Some(room_id) => {
                let rs = self
                    .store
                    .resource_state(&room_id)
                    .ok_or_else(|| Error::not_found("room", room_id))?;
                if rs.read().await.resource.tenant_id != tenant_id {
                    return Err(Error::not_found("room", room_id));
                }
                vec![rs]
            }
            None => self.store.resources_of(tenant_id),
        };

        let mut out = Vec::new();
        for rs in rooms {
            let guard = rs.read().await;
            out.extend(guard.overlapping(&window).filter(|r| !r.is_cancelled()).cloned());
        }
        out.sort_by_key(|r| (r.span.start, r.resource_id));
        Ok(out)
    }
}
