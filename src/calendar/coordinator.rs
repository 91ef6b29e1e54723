use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::error::Error;
use crate::model::*;
use crate::store::Store;

use super::{CalendarGateway, EventSpec, GatewayError, RemoteEvent, SyncError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFailure {
    pub reservation_id: Ulid,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: Vec<SyncFailure>,
}

/// A remote event, tagged with the reservation it mirrors if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEventView {
    pub event: RemoteEvent,
    pub reservation_id: Option<Ulid>,
}

/// Credentials for one logical operation. `refreshed` caps the
/// refresh-and-retry cycle at one per operation.
struct Session {
    user_id: Ulid,
    credentials: CalendarCredentials,
    refreshed: bool,
}

/// How a finished push landed, given the reservation it started from.
enum Settled {
    /// The outcome was recorded. `current` is false if the reservation
    /// changed while the call was in flight.
    Recorded { reservation: Reservation, current: bool },
    /// Another sync linked the reservation first.
    Superseded { reservation: Reservation },
}

/// Whether two versions of a reservation mirror to the same remote event.
fn same_mirror(a: &Reservation, b: &Reservation) -> bool {
    a.title == b.title
        && a.description == b.description
        && a.span == b.span
        && a.participants == b.participants
        && a.resource_id == b.resource_id
}

/// Mirrors reservations into the owner's external calendar.
///
/// Every gateway call happens after the local transaction it follows has
/// committed, and only ever records sync state; a gateway failure never
/// touches the reservation itself.
pub struct CalendarSync {
    store: Arc<Store>,
    gateway: Arc<dyn CalendarGateway>,
    timeout: Duration,
}

impl CalendarSync {
    pub fn new(store: Arc<Store>, gateway: Arc<dyn CalendarGateway>, timeout: Duration) -> Self {
        Self {
            store,
            gateway,
            timeout,
        }
    }

    // ── Credentials ──────────────────────────────────────────

    pub async fn connect(&self, user_id: Ulid, credentials: CalendarCredentials) -> Result<(), Error> {
        self.store
            .with_user_lock(user_id, |txn| {
                if txn.member(&user_id).is_none() {
                    return Err(Error::not_found("user", user_id));
                }
                txn.stage(Event::CredentialsUpdated {
                    user_id,
                    credentials: Some(credentials),
                });
                Ok(())
            })
            .await?;
        info!(user = %user_id, "calendar connected");
        Ok(())
    }

    pub async fn disconnect(&self, user_id: Ulid) -> Result<(), Error> {
        self.store
            .with_user_lock(user_id, |txn| {
                if txn.member(&user_id).is_none() {
                    return Err(Error::not_found("user", user_id));
                }
                txn.stage(Event::CredentialsUpdated {
                    user_id,
                    credentials: None,
                });
                Ok(())
            })
            .await?;
        info!(user = %user_id, "calendar disconnected");
        Ok(())
    }

    fn session(&self, user_id: Ulid) -> Result<Session, SyncError> {
        let credentials = self
            .store
            .member(&user_id)
            .and_then(|m| m.credentials)
            .ok_or(SyncError::NotConnected)?;
        Ok(Session {
            user_id,
            credentials,
            refreshed: false,
        })
    }

    /// Keep a refreshed token, unless the user disconnected in the meantime.
    async fn persist_credentials(&self, user_id: Ulid, credentials: CalendarCredentials) -> Result<(), Error> {
        self.store
            .with_user_lock(user_id, |txn| {
                if txn.member(&user_id).is_some_and(|m| m.credentials.is_some()) {
                    txn.stage(Event::CredentialsUpdated {
                        user_id,
                        credentials: Some(credentials),
                    });
                }
                Ok(())
            })
            .await
    }

    // ── Gateway calls ────────────────────────────────────────

    async fn bounded<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T, GatewayError>>,
    ) -> Result<T, GatewayError> {
        let started = Instant::now();
        let result = match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout),
        };
        metrics::histogram!(crate::observability::GATEWAY_CALL_SECONDS, "op" => op)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn refresh(&self, session: &mut Session) -> Result<(), GatewayError> {
        let Some(refresh_token) = session.credentials.refresh_token.clone() else {
            return Err(GatewayError::AuthExpired);
        };
        let access_token = self
            .bounded("refresh", self.gateway.refresh_credentials(&refresh_token))
            .await?;
        metrics::counter!(crate::observability::CALENDAR_REFRESH_TOTAL).increment(1);
        session.credentials.access_token = access_token;
        if let Err(e) = self
            .persist_credentials(session.user_id, session.credentials.clone())
            .await
        {
            warn!(user = %session.user_id, "could not store refreshed credentials: {e}");
        }
        Ok(())
    }

    /// Run `f` with the session's credentials. On the first auth-expired
    /// reply in this session, refresh once and retry once.
    async fn call<T, F, Fut>(&self, session: &mut Session, op: &'static str, f: F) -> Result<T, GatewayError>
    where
        F: Fn(CalendarCredentials) -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        match self.bounded(op, f(session.credentials.clone())).await {
            Err(GatewayError::AuthExpired) if !session.refreshed => {
                session.refreshed = true;
                debug!(user = %session.user_id, op, "credentials expired, refreshing");
                self.refresh(session).await?;
                self.bounded(op, f(session.credentials.clone())).await
            }
            other => other,
        }
    }

    async fn event_spec(&self, reservation: &Reservation) -> EventSpec {
        let location = self
            .store
            .resource(&reservation.resource_id)
            .await
            .map(|r| r.location())
            .unwrap_or_default();
        let attendees = reservation
            .participants
            .iter()
            .filter_map(|id| self.store.member(id).map(|m| m.email))
            .collect();
        EventSpec {
            title: reservation.title.clone(),
            description: reservation.description.clone(),
            location,
            span: reservation.span,
            attendees,
        }
    }

    async fn record(
        &self,
        reservation: &Reservation,
        remote_event_id: Option<String>,
        status: SyncStatus,
    ) -> Result<Reservation, Error> {
        let (id, resource_id) = (reservation.id, reservation.resource_id);
        self.store
            .with_resource_lock(resource_id, |txn| {
                let mut current = txn
                    .reservation(&id)
                    .cloned()
                    .ok_or_else(|| Error::not_found("reservation", id))?;
                txn.stage(Event::SyncRecorded {
                    id,
                    resource_id,
                    remote_event_id: remote_event_id.clone(),
                    status,
                });
                current.remote_event_id = remote_event_id;
                current.sync_status = status;
                Ok(current)
            })
            .await
    }

    /// Record a successful push of `base`, unless another sync relinked the
    /// reservation meanwhile. A reservation edited mid-call keeps the new
    /// link but stays unsynced.
    async fn settle(&self, base: &Reservation, remote_event_id: String) -> Result<Settled, Error> {
        let (id, resource_id) = (base.id, base.resource_id);
        self.store
            .with_resource_lock(resource_id, |txn| {
                let mut reservation = txn
                    .reservation(&id)
                    .cloned()
                    .ok_or_else(|| Error::not_found("reservation", id))?;
                if reservation.remote_event_id != base.remote_event_id {
                    return Ok(Settled::Superseded { reservation });
                }
                let current = same_mirror(base, &reservation);
                let status = if current { SyncStatus::Synced } else { SyncStatus::Unsynced };
                txn.stage(Event::SyncRecorded {
                    id,
                    resource_id,
                    remote_event_id: Some(remote_event_id.clone()),
                    status,
                });
                reservation.remote_event_id = Some(remote_event_id);
                reservation.sync_status = status;
                Ok(Settled::Recorded { reservation, current })
            })
            .await
    }

    /// Mark a failed push of `base`, keeping whatever link is stored now.
    /// Skipped if another sync relinked the reservation meanwhile.
    async fn record_failure(&self, base: &Reservation) -> Result<(), Error> {
        let (id, resource_id) = (base.id, base.resource_id);
        self.store
            .with_resource_lock(resource_id, |txn| {
                let stored = txn
                    .reservation(&id)
                    .ok_or_else(|| Error::not_found("reservation", id))?
                    .remote_event_id
                    .clone();
                if stored == base.remote_event_id {
                    txn.stage(Event::SyncRecorded {
                        id,
                        resource_id,
                        remote_event_id: stored,
                        status: SyncStatus::SyncFailed,
                    });
                }
                Ok(())
            })
            .await
    }

    async fn load_owned(&self, reservation_id: Ulid, user_id: Ulid) -> Result<Reservation, SyncError> {
        let reservation = self
            .store
            .reservation(&reservation_id)
            .await
            .ok_or_else(|| Error::not_found("reservation", reservation_id))?;
        if reservation.owner_id != user_id {
            return Err(Error::validation("only the owner can sync a reservation").into());
        }
        Ok(reservation)
    }

    // ── Operations ───────────────────────────────────────────

    /// Create or update the remote mirror of one reservation and record
    /// the outcome. A remote event deleted out-of-band is recreated. If the
    /// reservation is edited during the call it is pushed once more.
    pub async fn sync_one(&self, reservation_id: Ulid, user_id: Ulid) -> Result<Reservation, SyncError> {
        let mut reservation = self.load_owned(reservation_id, user_id).await?;
        if !reservation.is_confirmed() {
            return Err(Error::validation("only confirmed reservations can be synced").into());
        }
        let mut session = self.session(user_id)?;
        let mut repushed = false;
        loop {
            let settled = self.push(&mut session, &reservation).await?;
            match settled {
                Settled::Recorded { reservation: synced, .. } if synced.is_cancelled() => {
                    // Cancelled while the call was in flight.
                    return self.unlink(reservation_id, user_id).await;
                }
                Settled::Recorded {
                    reservation: synced,
                    current,
                } => {
                    if current || repushed {
                        return Ok(synced);
                    }
                    debug!(id = %reservation_id, "reservation changed during sync, pushing again");
                    repushed = true;
                    reservation = synced;
                }
                Settled::Superseded { reservation } => return Ok(reservation),
            }
        }
    }

    /// One gateway round for `reservation`, recorded against the version
    /// it was built from.
    async fn push(&self, session: &mut Session, reservation: &Reservation) -> Result<Settled, SyncError> {
        let spec = self.event_spec(reservation).await;
        let gateway = &self.gateway;
        let spec = &spec;

        let outcome = match reservation.remote_event_id.as_deref() {
            None => {
                self.call(session, "create", |c| async move { gateway.create_event(&c, spec).await })
                    .await
            }
            Some(remote_id) => {
                let updated = self
                    .call(session, "update", |c| async move {
                        gateway.update_event(&c, remote_id, spec).await
                    })
                    .await;
                match updated {
                    Err(GatewayError::NotFound) => {
                        debug!(id = %reservation.id, "remote event gone, recreating");
                        self.call(session, "create", |c| async move { gateway.create_event(&c, spec).await })
                            .await
                    }
                    other => other,
                }
            }
        };

        let remote = match outcome {
            Ok(remote) => remote,
            Err(e) => {
                metrics::counter!(crate::observability::CALENDAR_SYNC_TOTAL, "outcome" => "failed").increment(1);
                warn!(id = %reservation.id, "calendar sync failed: {e}");
                self.record_failure(reservation).await?;
                return Err(SyncError::Gateway(e));
            }
        };

        let settled = self.settle(reservation, remote.remote_id.clone()).await?;
        match &settled {
            Settled::Recorded { .. } => {
                metrics::counter!(crate::observability::CALENDAR_SYNC_TOTAL, "outcome" => "synced").increment(1);
                debug!(id = %reservation.id, "reservation synced");
            }
            Settled::Superseded { reservation: stored } => {
                if stored.remote_event_id.as_deref() != Some(remote.remote_id.as_str()) {
                    debug!(id = %reservation.id, remote = %remote.remote_id, "dropping duplicate remote event");
                    self.delete_remote(session.user_id, &remote.remote_id).await;
                }
            }
        }
        Ok(settled)
    }

    /// Sync every confirmed, not yet ended, unsynced or failed reservation of
    /// the user. Failures are collected, not fatal.
    pub async fn sync_all_pending(&self, user_id: Ulid) -> Result<SyncSummary, SyncError> {
        self.session(user_id)?;
        let now = self.store.now();
        let pending: Vec<Reservation> = self
            .store
            .reservations_owned_by(&user_id)
            .await
            .into_iter()
            .filter(|r| r.is_confirmed() && r.span.end > now && r.sync_status != SyncStatus::Synced)
            .collect();

        let mut summary = SyncSummary {
            total: pending.len(),
            ..Default::default()
        };
        for r in pending {
            match self.sync_one(r.id, user_id).await {
                Ok(_) => summary.succeeded += 1,
                Err(e) => summary.failed.push(SyncFailure {
                    reservation_id: r.id,
                    reason: e.to_string(),
                }),
            }
        }
        info!(
            user = %user_id,
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed.len(),
            "bulk calendar sync finished"
        );
        Ok(summary)
    }

    /// Best-effort delete of the remote event, then clear the local link
    /// whatever the remote outcome.
    pub async fn unlink(&self, reservation_id: Ulid, user_id: Ulid) -> Result<Reservation, SyncError> {
        let reservation = self.load_owned(reservation_id, user_id).await?;
        if let Some(remote_id) = reservation.remote_event_id.as_deref() {
            self.delete_remote(user_id, remote_id).await;
        }
        Ok(self.record(&reservation, None, SyncStatus::Unsynced).await?)
    }

    async fn delete_remote(&self, user_id: Ulid, remote_id: &str) {
        let mut session = match self.session(user_id) {
            Ok(session) => session,
            Err(_) => {
                debug!(user = %user_id, "no credentials, leaving remote event {remote_id}");
                return;
            }
        };
        let gateway = &self.gateway;
        match self
            .call(&mut session, "delete", |c| async move { gateway.delete_event(&c, remote_id).await })
            .await
        {
            Ok(()) | Err(GatewayError::NotFound) => {}
            Err(e) => warn!(user = %user_id, remote = remote_id, "remote delete failed: {e}"),
        }
    }

    /// The user's remote events in `window`, tagged with the reservation
    /// each one mirrors.
    pub async fn list_remote_events(&self, user_id: Ulid, window: Span) -> Result<Vec<RemoteEventView>, SyncError> {
        let mut session = self.session(user_id)?;
        let gateway = &self.gateway;
        let events = self
            .call(&mut session, "list", |c| async move { gateway.list_events(&c, window).await })
            .await?;

        let mirrored: HashMap<String, Ulid> = self
            .store
            .reservations_owned_by(&user_id)
            .await
            .into_iter()
            .filter_map(|r| r.remote_event_id.map(|remote| (remote, r.id)))
            .collect();
        Ok(events
            .into_iter()
            .map(|event| RemoteEventView {
                reservation_id: mirrored.get(&event.remote_id).copied(),
                event,
            })
            .collect())
    }

    /// React to one committed store event. Used by the sync worker; every
    /// event gets a single attempt.
    pub async fn handle_event(&self, event: &Event) {
        match event {
            Event::ReservationUpdated { reservation }
                if reservation.remote_event_id.is_some() && reservation.is_confirmed() =>
            {
                if let Err(e) = self.sync_one(reservation.id, reservation.owner_id).await {
                    debug!(id = %reservation.id, "resync after update failed: {e}");
                }
            }
            Event::ReservationCancelled { id, owner_id, .. } => {
                let linked = self
                    .store
                    .reservation(id)
                    .await
                    .is_some_and(|r| r.remote_event_id.is_some());
                if linked && let Err(e) = self.unlink(*id, *owner_id).await {
                    debug!(%id, "unlink after cancel failed: {e}");
                }
            }
            Event::ReservationPurged {
                owner_id,
                remote_event_id: Some(remote_id),
                ..
            } => self.delete_remote(*owner_id, remote_id).await,
            _ => {}
        }
    }
}
