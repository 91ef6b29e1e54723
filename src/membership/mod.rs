mod codes;

pub use codes::{candidate, generate_invite_code, normalize_code, slugify};

use std::sync::Arc;

use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::error::Error;
use crate::limits::*;
use crate::model::*;
use crate::store::{Scope, Store, Txn};

#[derive(Debug, Clone)]
pub struct InviteRequest {
    pub role: Role,
    pub email: Option<String>,
    /// Defaults to seven days.
    pub ttl_days: Option<u32>,
}

/// What an unauthenticated visitor may learn about a code before redeeming it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvitePreview {
    pub tenant_id: Ulid,
    pub tenant_name: String,
    pub role: Role,
    pub email: Option<String>,
    pub expires_at: Ms,
}

/// Outcome of a leave or removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub user_id: Ulid,
    pub tenant_id: Ulid,
    /// Future confirmed reservations cancelled along with the membership.
    pub cancelled: Vec<Ulid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DepartureKind {
    Leave,
    Remove,
}

impl DepartureKind {
    fn label(self) -> &'static str {
        match self {
            DepartureKind::Leave => "leave",
            DepartureKind::Remove => "remove",
        }
    }
}

/// Orchestrates tenant creation, invites, and membership transitions.
pub struct MembershipManager {
    store: Arc<Store>,
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn validate_tenant_name(name: &str) -> Result<String, Error> {
    let name = name.trim();
    let len = name.chars().count();
    if len < MIN_TENANT_NAME_LEN {
        return Err(Error::validation("tenant name must be at least 2 characters"));
    }
    if len > MAX_TENANT_NAME_LEN {
        return Err(Error::LimitExceeded("tenant name too long"));
    }
    Ok(name.to_string())
}

/// Load a member of `tenant_id` under the tenant lock.
fn tenant_member(txn: &Txn<'_>, tenant_id: Ulid, user_id: Ulid) -> Result<Member, Error> {
    txn.member(&user_id)
        .filter(|m| m.belongs_to(tenant_id))
        .ok_or_else(|| Error::not_found("member", user_id))
}

/// Reject a change that would take away the tenant's last active admin.
fn ensure_not_last_admin(txn: &Txn<'_>, member: &Member, tenant_id: Ulid) -> Result<(), Error> {
    if member.is_active_admin() && txn.active_admin_count(tenant_id) <= 1 {
        return Err(Error::validation(
            "sole admin must assign another admin before stepping down",
        ));
    }
    Ok(())
}

impl MembershipManager {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Make an authenticated user known to the core, unassigned.
    pub async fn register_user(&self, user_id: Ulid, email: &str) -> Result<Member, Error> {
        let email = normalize_email(email);
        if email.is_empty() || !email.contains('@') {
            return Err(Error::validation("a valid email is required"));
        }
        self.store
            .with_user_lock(user_id, |txn| {
                if txn.member(&user_id).is_some() {
                    return Err(Error::conflict("user already registered"));
                }
                let member = Member::unassigned(user_id, email);
                txn.stage(Event::UserRegistered { member: member.clone() });
                Ok(member)
            })
            .await
    }

    /// Create a tenant with `user_id` as its sole admin. The slug is derived
    /// from the name; losing a slug race retries with a fresh probe.
    pub async fn create_tenant(&self, user_id: Ulid, name: &str, description: Option<String>) -> Result<Tenant, Error> {
        let name = validate_tenant_name(name)?;
        let description = description.filter(|d| !d.trim().is_empty());
        if description.as_ref().is_some_and(|d| d.len() > MAX_DESCRIPTION_LEN) {
            return Err(Error::LimitExceeded("description too long"));
        }
        let base = slugify(&name);

        for attempt in 0..MAX_SLUG_ATTEMPTS {
            let tenant_id = Ulid::new();
            let result = self
                .store
                .transact(Scope::new().tenant(tenant_id).user(user_id), |txn| {
                    let member = txn
                        .member(&user_id)
                        .ok_or_else(|| Error::not_found("user", user_id))?;
                    if member.tenant_id.is_some() {
                        return Err(Error::conflict("user already belongs to a tenant"));
                    }

                    let slug = (0..MAX_SLUG_PROBES)
                        .map(|n| candidate(&base, n))
                        .find(|s| !txn.slug_taken(s))
                        .ok_or_else(|| Error::validation("no free slug for this tenant name"))?;
                    txn.claim_slug(&slug, tenant_id)?;

                    let tenant = Tenant {
                        id: tenant_id,
                        name: name.clone(),
                        slug,
                        description: description.clone(),
                        created_at: txn.now(),
                    };
                    txn.stage(Event::TenantCreated { tenant: tenant.clone() });
                    txn.stage(Event::MemberAssigned {
                        user_id,
                        tenant_id,
                        role: Role::Admin,
                    });
                    Ok(tenant)
                })
                .await;

            match result {
                Ok(tenant) => {
                    metrics::counter!(crate::observability::TENANTS_CREATED_TOTAL).increment(1);
                    info!(id = %tenant.id, slug = %tenant.slug, admin = %user_id, "tenant created");
                    return Ok(tenant);
                }
                Err(Error::UniqueViolation(what)) => {
                    metrics::counter!(crate::observability::UNIQUE_RETRIES_TOTAL, "what" => what).increment(1);
                    debug!(attempt, what, "slug race lost, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        warn!(%base, "gave up allocating a tenant slug");
        Err(Error::validation("could not allocate a unique slug, try another name"))
    }

    pub async fn update_tenant(
        &self,
        principal: &Principal,
        name: Option<&str>,
        description: Option<Option<String>>,
    ) -> Result<Tenant, Error> {
        let tenant_id = principal.require_admin()?;
        let name = name.map(validate_tenant_name).transpose()?;
        self.store
            .transact(Scope::new().tenant(tenant_id), |txn| {
                let mut tenant = txn
                    .tenant(&tenant_id)
                    .ok_or_else(|| Error::not_found("tenant", tenant_id))?;
                if let Some(name) = name {
                    tenant.name = name;
                }
                if let Some(description) = description {
                    tenant.description = description.filter(|d| !d.trim().is_empty());
                }
                txn.stage(Event::TenantUpdated {
                    id: tenant_id,
                    name: tenant.name.clone(),
                    description: tenant.description.clone(),
                });
                Ok(tenant)
            })
            .await
    }

    pub fn list_members(&self, tenant_id: Ulid) -> Vec<Member> {
        self.store.members_of(tenant_id)
    }

    // ── Invites ──────────────────────────────────────────────

    /// Mint a single-use code. Only admins may mint admin invites.
    pub async fn create_invite(&self, principal: &Principal, req: InviteRequest) -> Result<InviteCode, Error> {
        let tenant_id = principal.require_tenant()?;
        if req.role == Role::Admin && !principal.is_admin() {
            return Err(Error::validation("only admins can create admin invites"));
        }
        let ttl_days = req.ttl_days.unwrap_or(DEFAULT_INVITE_TTL_DAYS);
        if !(MIN_INVITE_TTL_DAYS..=MAX_INVITE_TTL_DAYS).contains(&ttl_days) {
            return Err(Error::validation(format!(
                "invite lifetime must be between {MIN_INVITE_TTL_DAYS} and {MAX_INVITE_TTL_DAYS} days"
            )));
        }
        let email = req.email.as_deref().map(normalize_email).filter(|e| !e.is_empty());

        for attempt in 0..MAX_INVITE_CODE_ATTEMPTS {
            let code = generate_invite_code();
            let email = email.clone();
            let result = self
                .store
                .transact(Scope::new().tenant(tenant_id), |txn| {
                    if txn.tenant(&tenant_id).is_none() {
                        return Err(Error::not_found("tenant", tenant_id));
                    }
                    if let Some(email) = &email
                        && txn.tenant_members(tenant_id).iter().any(|m| &m.email == email)
                    {
                        return Err(Error::conflict("user is already a member of this tenant"));
                    }

                    let now = txn.now();
                    let invite = InviteCode {
                        id: Ulid::new(),
                        tenant_id,
                        code,
                        role: req.role,
                        email,
                        expires_at: now + i64::from(ttl_days) * DAY_MS,
                        created_by: principal.user_id,
                        created_at: now,
                        redemption: None,
                    };
                    txn.claim_invite_code(&invite.code, invite.id)?;
                    txn.stage(Event::InviteCreated { invite: invite.clone() });
                    Ok(invite)
                })
                .await;

            match result {
                Ok(invite) => {
                    info!(id = %invite.id, tenant = %tenant_id, role = %invite.role, "invite created");
                    return Ok(invite);
                }
                Err(Error::UniqueViolation(what)) => {
                    metrics::counter!(crate::observability::UNIQUE_RETRIES_TOTAL, "what" => what).increment(1);
                    debug!(attempt, "invite code collision, regenerating");
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::validation("could not generate a unique invite code"))
    }

    /// Look up an open invite by code.
    fn open_invite(&self, code: &str, now: Ms) -> Result<InviteCode, Error> {
        let code = normalize_code(code);
        let invite = self
            .store
            .invite_by_code(&code)
            .ok_or_else(|| Error::not_found("invite code", &code))?;
        if invite.is_used() {
            return Err(Error::validation("invite code has already been used"));
        }
        if invite.is_expired(now) {
            return Err(Error::validation("invite code has expired"));
        }
        Ok(invite)
    }

    pub fn check_invite(&self, code: &str) -> Result<InvitePreview, Error> {
        let invite = self.open_invite(code, self.store.now())?;
        let tenant = self
            .store
            .tenant(&invite.tenant_id)
            .ok_or_else(|| Error::not_found("tenant", invite.tenant_id))?;
        Ok(InvitePreview {
            tenant_id: tenant.id,
            tenant_name: tenant.name,
            role: invite.role,
            email: invite.email,
            expires_at: invite.expires_at,
        })
    }

    /// Unused, unexpired invites of the admin's tenant.
    pub fn list_invites(&self, principal: &Principal) -> Result<Vec<InviteCode>, Error> {
        let tenant_id = principal.require_admin()?;
        let now = self.store.now();
        let mut invites = self.store.invites_of(tenant_id);
        invites.retain(|i| i.is_open(now));
        Ok(invites)
    }

    pub async fn revoke_invite(&self, principal: &Principal, invite_id: Ulid) -> Result<(), Error> {
        let tenant_id = principal.require_admin()?;
        self.store
            .with_invite_lock(invite_id, |txn| {
                let invite = txn
                    .invite(&invite_id)
                    .filter(|i| i.tenant_id == tenant_id)
                    .ok_or_else(|| Error::not_found("invite", invite_id))?;
                if invite.is_used() {
                    return Err(Error::validation("a used invite cannot be revoked"));
                }
                txn.stage(Event::InviteRevoked { id: invite_id });
                Ok(())
            })
            .await?;
        info!(id = %invite_id, "invite revoked");
        Ok(())
    }

    /// Redeem a code: mark it used and assign the user's tenant and role in
    /// one transaction under the invite's lock, so exactly one of several
    /// concurrent redemptions wins.
    pub async fn redeem_invite(&self, code: &str, user_id: Ulid, user_email: &str) -> Result<Member, Error> {
        let code = normalize_code(code);
        let user_email = normalize_email(user_email);
        let found = self
            .store
            .invite_by_code(&code)
            .ok_or_else(|| Error::not_found("invite code", &code))?;
        let (invite_id, tenant_id) = (found.id, found.tenant_id);

        let scope = Scope::new()
            .invite(invite_id)
            .tenant(tenant_id)
            .with_tenant_resources()
            .user(user_id);
        let member = self
            .store
            .transact(scope, |txn| {
                let now = txn.now();
                let invite = txn
                    .invite(&invite_id)
                    .ok_or_else(|| Error::not_found("invite code", &code))?;
                if invite.is_used() {
                    return Err(Error::validation("invite code has already been used"));
                }
                if invite.is_expired(now) {
                    return Err(Error::validation("invite code has expired"));
                }
                if let Some(restricted) = &invite.email
                    && *restricted != user_email
                {
                    return Err(Error::validation("invite code is restricted to a different email"));
                }

                let mut member = txn
                    .member(&user_id)
                    .ok_or_else(|| Error::not_found("user", user_id))?;
                if member.tenant_id.is_some() {
                    return Err(Error::conflict("user already belongs to a tenant"));
                }

                txn.stage(Event::InviteRedeemed {
                    id: invite_id,
                    user_id,
                    at: now,
                });
                txn.stage(Event::MemberAssigned {
                    user_id,
                    tenant_id,
                    role: invite.role,
                });
                member.tenant_id = Some(tenant_id);
                member.role = invite.role;
                member.active = true;
                Ok(member)
            })
            .await?;

        metrics::counter!(crate::observability::INVITES_REDEEMED_TOTAL).increment(1);
        info!(invite = %invite_id, user = %user_id, tenant = %tenant_id, role = %member.role, "invite redeemed");
        Ok(member)
    }

    // ── Departures and role changes ──────────────────────────

    pub async fn leave_tenant(&self, principal: &Principal) -> Result<Departure, Error> {
        let tenant_id = principal.require_tenant()?;
        self.depart(tenant_id, principal.user_id, DepartureKind::Leave).await
    }

    pub async fn remove_member(&self, principal: &Principal, target_id: Ulid) -> Result<Departure, Error> {
        let tenant_id = principal.require_admin()?;
        if target_id == principal.user_id {
            return Err(Error::validation("use leave to remove yourself"));
        }
        self.depart(tenant_id, target_id, DepartureKind::Remove).await
    }

    /// Unassign `user_id` from `tenant_id`, cascade-cancelling their future
    /// confirmed reservations. Holds the tenant and all of its rooms so the
    /// admin count and the reservation set cannot move underneath.
    async fn depart(&self, tenant_id: Ulid, user_id: Ulid, kind: DepartureKind) -> Result<Departure, Error> {
        let scope = Scope::new()
            .tenant(tenant_id)
            .with_tenant_resources()
            .user(user_id);
        let departure = self
            .store
            .transact(scope, |txn| {
                let now = txn.now();
                let member = tenant_member(txn, tenant_id, user_id)?;
                ensure_not_last_admin(txn, &member, tenant_id)?;

                let doomed: Vec<(Ulid, Ulid)> = txn
                    .locked_resources()
                    .flat_map(|rs| rs.reservations.iter())
                    .filter(|r| r.owner_id == user_id && r.is_confirmed() && r.span.start > now)
                    .map(|r| (r.id, r.resource_id))
                    .collect();
                for &(id, resource_id) in &doomed {
                    txn.stage(Event::ReservationCancelled {
                        id,
                        resource_id,
                        owner_id: user_id,
                        at: now,
                    });
                }
                txn.stage(Event::MemberUnassigned { user_id });

                Ok(Departure {
                    user_id,
                    tenant_id,
                    cancelled: doomed.into_iter().map(|(id, _)| id).collect(),
                })
            })
            .await?;

        metrics::counter!(crate::observability::MEMBER_DEPARTURES_TOTAL, "kind" => kind.label()).increment(1);
        metrics::counter!(crate::observability::RESERVATIONS_CANCELLED_TOTAL, "reason" => "cascade")
            .increment(departure.cancelled.len() as u64);
        info!(
            user = %user_id,
            tenant = %tenant_id,
            kind = kind.label(),
            cancelled = departure.cancelled.len(),
            "member departed"
        );
        Ok(departure)
    }

    /// Promote or demote a member. Demoting the last active admin is rejected.
    pub async fn change_role(&self, principal: &Principal, target_id: Ulid, role: Role) -> Result<Member, Error> {
        let tenant_id = principal.require_admin()?;
        if target_id == principal.user_id {
            return Err(Error::validation("admins cannot change their own role"));
        }
        let scope = Scope::new()
            .tenant(tenant_id)
            .with_tenant_resources()
            .user(target_id);
        self.store
            .transact(scope, |txn| {
                let mut member = tenant_member(txn, tenant_id, target_id)?;
                if member.role == role {
                    return Ok(member);
                }
                if role == Role::Member {
                    ensure_not_last_admin(txn, &member, tenant_id)?;
                }
                txn.stage(Event::MemberRoleChanged {
                    user_id: target_id,
                    role,
                });
                member.role = role;
                info!(user = %target_id, tenant = %tenant_id, %role, "member role changed");
                Ok(member)
            })
            .await
    }

    /// Activate or deactivate a member. Inactive members cannot book.
    pub async fn set_member_active(&self, principal: &Principal, target_id: Ulid, active: bool) -> Result<Member, Error> {
        let tenant_id = principal.require_admin()?;
        if target_id == principal.user_id {
            return Err(Error::validation("admins cannot change their own active flag"));
        }
        let scope = Scope::new()
            .tenant(tenant_id)
            .with_tenant_resources()
            .user(target_id);
        self.store
            .transact(scope, |txn| {
                let mut member = tenant_member(txn, tenant_id, target_id)?;
                if member.active == active {
                    return Ok(member);
                }
                if !active {
                    ensure_not_last_admin(txn, &member, tenant_id)?;
                }
                txn.stage(Event::MemberActiveChanged {
                    user_id: target_id,
                    active,
                });
                member.active = active;
                Ok(member)
            })
            .await
    }
}
