use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::Error;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Build a span from untrusted input; `None` unless `start < end`.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Admin,
    Member,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Admin => f.write_str("admin"),
            Role::Member => f.write_str("member"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    /// Reserved for approval flows; never produced by the current rules.
    Pending,
    Confirmed,
    Cancelled,
}

/// Whether a reservation has been mirrored into the owner's external calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    Unsynced,
    Synced,
    SyncFailed,
}

/// The already-authenticated caller handed to the core by the routing layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub user_id: Ulid,
    pub tenant_id: Option<Ulid>,
    pub role: Role,
}

impl Principal {
    pub fn new(user_id: Ulid, tenant_id: Option<Ulid>, role: Role) -> Self {
        Self { user_id, tenant_id, role }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// The caller's tenant, or a validation error for unassigned users.
    pub fn require_tenant(&self) -> Result<Ulid, Error> {
        self.tenant_id
            .ok_or_else(|| Error::validation("user does not belong to a tenant"))
    }

    pub fn require_admin(&self) -> Result<Ulid, Error> {
        let tenant_id = self.require_tenant()?;
        if !self.is_admin() {
            return Err(Error::validation("admin role required"));
        }
        Ok(tenant_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Ulid,
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    pub created_at: Ms,
}

/// OAuth token pair for the external calendar.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarCredentials {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

impl fmt::Debug for CalendarCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CalendarCredentials")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// A user as seen by the core. `tenant_id == None` is the unassigned state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub user_id: Ulid,
    pub email: String,
    pub tenant_id: Option<Ulid>,
    pub role: Role,
    pub active: bool,
    pub credentials: Option<CalendarCredentials>,
}

impl Member {
    pub fn unassigned(user_id: Ulid, email: String) -> Self {
        Self {
            user_id,
            email,
            tenant_id: None,
            role: Role::Member,
            active: true,
            credentials: None,
        }
    }

    pub fn belongs_to(&self, tenant_id: Ulid) -> bool {
        self.tenant_id == Some(tenant_id)
    }

    pub fn is_active_admin(&self) -> bool {
        self.active && self.role == Role::Admin
    }
}

/// A bookable room. Amenities are opaque to the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: Ulid,
    pub tenant_id: Ulid,
    pub name: String,
    pub description: Option<String>,
    pub capacity: u32,
    pub floor: Option<i32>,
    pub amenities: Vec<String>,
    pub active: bool,
}

impl Resource {
    /// Human readable location used for mirrored calendar events.
    pub fn location(&self) -> String {
        match self.floor {
            Some(floor) => format!("{}, floor {floor}", self.name),
            None => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub tenant_id: Ulid,
    pub owner_id: Ulid,
    pub title: String,
    pub description: Option<String>,
    pub span: Span,
    pub status: ReservationStatus,
    /// Non-owning participant links; never contains the owner.
    pub participants: Vec<Ulid>,
    pub remote_event_id: Option<String>,
    pub sync_status: SyncStatus,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Reservation {
    pub fn is_confirmed(&self) -> bool {
        self.status == ReservationStatus::Confirmed
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == ReservationStatus::Cancelled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redemption {
    pub user_id: Ulid,
    pub at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteCode {
    pub id: Ulid,
    pub tenant_id: Ulid,
    /// Normalized (uppercase) code.
    pub code: String,
    pub role: Role,
    /// Lowercased email restriction.
    pub email: Option<String>,
    pub expires_at: Ms,
    pub created_by: Ulid,
    pub created_at: Ms,
    pub redemption: Option<Redemption>,
}

impl InviteCode {
    pub fn is_used(&self) -> bool {
        self.redemption.is_some()
    }

    pub fn is_expired(&self, now: Ms) -> bool {
        self.expires_at < now
    }

    pub fn is_open(&self, now: Ms) -> bool {
        !self.is_used() && !self.is_expired(now)
    }
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub resource: Resource,
    /// All reservations (any status), sorted by `span.start`.
    pub reservations: Vec<Reservation>,
}

impl ResourceState {
    pub fn new(resource: Resource) -> Self {
        Self {
            resource,
            reservations: Vec::new(),
        }
    }

    pub fn id(&self) -> Ulid {
        self.resource.id
    }

    /// Insert reservation maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.span.start <= reservation.span.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn reservation(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    pub fn reservation_mut(&mut self, id: &Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == *id)
    }

    /// Reservations of any status whose span overlaps the query window.
    /// Everything at or after the partition point starts at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }
}

/// The event types. One committed transaction is a `Vec<Event>` in the WAL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserRegistered {
        member: Member,
    },
    CredentialsUpdated {
        user_id: Ulid,
        credentials: Option<CalendarCredentials>,
    },
    TenantCreated {
        tenant: Tenant,
    },
    TenantUpdated {
        id: Ulid,
        name: String,
        description: Option<String>,
    },
    MemberAssigned {
        user_id: Ulid,
        tenant_id: Ulid,
        role: Role,
    },
    MemberRoleChanged {
        user_id: Ulid,
        role: Role,
    },
    MemberActiveChanged {
        user_id: Ulid,
        active: bool,
    },
    MemberUnassigned {
        user_id: Ulid,
    },
    ResourceCreated {
        resource: Resource,
    },
    ResourceUpdated {
        resource: Resource,
    },
    ResourceDeleted {
        id: Ulid,
        tenant_id: Ulid,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    ReservationUpdated {
        reservation: Reservation,
    },
    ReservationCancelled {
        id: Ulid,
        resource_id: Ulid,
        owner_id: Ulid,
        at: Ms,
    },
    ReservationPurged {
        id: Ulid,
        resource_id: Ulid,
        owner_id: Ulid,
        remote_event_id: Option<String>,
    },
    SyncRecorded {
        id: Ulid,
        resource_id: Ulid,
        remote_event_id: Option<String>,
        status: SyncStatus,
    },
    InviteCreated {
        invite: InviteCode,
    },
    InviteRedeemed {
        id: Ulid,
        user_id: Ulid,
        at: Ms,
    },
    InviteRevoked {
        id: Ulid,
    },
}

impl Event {
    /// The resource whose lock must be held to apply this event in place.
    /// Creation and deletion of resources happen at the map level instead.
    pub fn resource_id(&self) -> Option<Ulid> {
        match self {
            Event::ResourceUpdated { resource } => Some(resource.id),
            Event::ReservationCreated { reservation } | Event::ReservationUpdated { reservation } => {
                Some(reservation.resource_id)
            }
            Event::ReservationCancelled { resource_id, .. }
            | Event::ReservationPurged { resource_id, .. }
            | Event::SyncRecorded { resource_id, .. } => Some(*resource_id),
            _ => None,
        }
    }
}
