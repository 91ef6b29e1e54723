mod queries;
mod txn;
#[cfg(test)]
mod tests;

pub use txn::{Scope, Txn};

use std::collections::BTreeSet;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, info};
use ulid::Ulid;

use crate::error::Error;
use crate::limits::{SNAPSHOT_CHUNK, WAL_CHANNEL_CAPACITY};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

/// Source of "now" for every business rule that looks at the time.
pub type Clock = Arc<dyn Fn() -> Ms + Send + Sync>;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub fn system_clock() -> Clock {
    Arc::new(now_ms)
}

type Responder<T> = oneshot::Sender<io::Result<T>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(crate) enum WalCommand {
    Append {
        record: Vec<Event>,
        response: Responder<()>,
    },
    Compact {
        records: Vec<Vec<Event>>,
        response: Responder<()>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit:
/// block for the first append, drain whatever else is queued, fsync once,
/// answer every sender with the shared result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { record, response } => {
                let mut batch = vec![(record, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { record, response }) => batch.push((record, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
    debug!("WAL writer stopped");
}

fn flush_batch(wal: &mut Wal, batch: &[(Vec<Event>, Responder<()>)]) -> io::Result<()> {
    let mut append_err = None;
    for (record, _) in batch {
        if let Err(e) = wal.append_buffered(record) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so partial bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Vec<Event>, Responder<()>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { records, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &records).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { response, .. } => {
            let _ = response.send(Err(io::Error::other("append routed to non-append handler")));
        }
    }
}

/// The reservation store: in-memory state rebuilt from the WAL, mutated only
/// through [`Txn`].
pub struct Store {
    pub(crate) tenants: DashMap<Ulid, Tenant>,
    pub(crate) slugs: DashMap<String, Ulid>,
    pub(crate) members: DashMap<Ulid, Member>,
    pub(crate) resources: DashMap<Ulid, SharedResourceState>,
    pub(crate) tenant_resources: DashMap<Ulid, BTreeSet<Ulid>>,
    /// Reverse lookup: reservation id → resource id.
    pub(crate) reservation_index: DashMap<Ulid, Ulid>,
    /// Owner → reservation ids.
    pub(crate) owned: DashMap<Ulid, BTreeSet<Ulid>>,
    pub(crate) invites: DashMap<Ulid, InviteCode>,
    pub(crate) invite_codes: DashMap<String, Ulid>,

    pub(crate) tenant_locks: DashMap<Ulid, Arc<Mutex<()>>>,
    pub(crate) user_locks: DashMap<Ulid, Arc<Mutex<()>>>,
    pub(crate) invite_locks: DashMap<Ulid, Arc<Mutex<()>>>,
    /// Read-held by every transaction, write-held by compaction.
    pub(crate) commit_gate: Arc<RwLock<()>>,

    wal_tx: mpsc::Sender<WalCommand>,
    clock: Clock,
    notify: NotifyHub,
}

impl Store {
    pub fn open(wal_path: PathBuf) -> io::Result<Self> {
        Self::open_with_clock(wal_path, system_clock())
    }

    /// Replay the WAL at `wal_path` and start the group-commit writer.
    /// Must be called from within a tokio runtime.
    pub fn open_with_clock(wal_path: PathBuf, clock: Clock) -> io::Result<Self> {
        let records = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(WAL_CHANNEL_CAPACITY);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            tenants: DashMap::new(),
            slugs: DashMap::new(),
            members: DashMap::new(),
            resources: DashMap::new(),
            tenant_resources: DashMap::new(),
            reservation_index: DashMap::new(),
            owned: DashMap::new(),
            invites: DashMap::new(),
            invite_codes: DashMap::new(),
            tenant_locks: DashMap::new(),
            user_locks: DashMap::new(),
            invite_locks: DashMap::new(),
            commit_gate: Arc::new(RwLock::new(())),
            wal_tx,
            clock,
            notify: NotifyHub::new(),
        };

        // We are the sole owner of every lock here, so try_read/try_write
        // always succeed. Never block: this may run inside an async context.
        let mut replayed = 0usize;
        for record in &records {
            for event in record {
                store.replay_event(event)?;
                replayed += 1;
            }
        }
        info!(
            path = %wal_path.display(),
            records = records.len(),
            events = replayed,
            "store opened"
        );
        Ok(store)
    }

    fn replay_event(&self, event: &Event) -> io::Result<()> {
        let contended = || io::Error::other("replay: resource state contended");
        if let Some(resource_id) = event.resource_id() {
            if let Some(rs) = self.resource_state(&resource_id) {
                let mut guard = rs.try_write().map_err(|_| contended())?;
                self.apply_to_resource(&mut guard, event);
            }
            return Ok(());
        }
        if let Event::ResourceDeleted { id, tenant_id } = event {
            if let Some(rs) = self.resource_state(id) {
                let guard = rs.try_read().map_err(|_| contended())?;
                self.forget_resource(*id, *tenant_id, &guard.reservations);
            }
            return Ok(());
        }
        self.apply_global(event);
        Ok(())
    }

    pub fn now(&self) -> Ms {
        (self.clock)()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.notify.subscribe()
    }

    pub(crate) fn publish(&self, event: &Event) {
        self.notify.send(event);
    }

    /// Write one transaction record via the background group-commit writer.
    pub(crate) async fn wal_append(&self, record: Vec<Event>) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { record, response: tx })
            .await
            .map_err(|_| Error::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| Error::WalError("WAL writer dropped response".into()))?
            .map_err(|e| Error::WalError(e.to_string()))
    }

    /// Apply an event that is not scoped to a single resource's lock.
    pub(crate) fn apply_global(&self, event: &Event) {
        match event {
            Event::UserRegistered { member } => {
                self.members.insert(member.user_id, member.clone());
            }
            Event::CredentialsUpdated { user_id, credentials } => {
                if let Some(mut m) = self.members.get_mut(user_id) {
                    m.credentials = credentials.clone();
                }
            }
            Event::TenantCreated { tenant } => {
                self.slugs.insert(tenant.slug.clone(), tenant.id);
                self.tenant_resources.entry(tenant.id).or_default();
                self.tenants.insert(tenant.id, tenant.clone());
            }
            Event::TenantUpdated { id, name, description } => {
                if let Some(mut t) = self.tenants.get_mut(id) {
                    t.name = name.clone();
                    t.description = description.clone();
                }
            }
            Event::MemberAssigned { user_id, tenant_id, role } => {
                if let Some(mut m) = self.members.get_mut(user_id) {
                    m.tenant_id = Some(*tenant_id);
                    m.role = *role;
                    m.active = true;
                }
            }
            Event::MemberRoleChanged { user_id, role } => {
                if let Some(mut m) = self.members.get_mut(user_id) {
                    m.role = *role;
                }
            }
            Event::MemberActiveChanged { user_id, active } => {
                if let Some(mut m) = self.members.get_mut(user_id) {
                    m.active = *active;
                }
            }
            Event::MemberUnassigned { user_id } => {
                if let Some(mut m) = self.members.get_mut(user_id) {
                    m.tenant_id = None;
                    m.role = Role::Member;
                    m.active = true;
                }
            }
            Event::ResourceCreated { resource } => {
                let rs = ResourceState::new(resource.clone());
                self.resources.insert(resource.id, Arc::new(RwLock::new(rs)));
                self.tenant_resources
                    .entry(resource.tenant_id)
                    .or_default()
                    .insert(resource.id);
            }
            Event::InviteCreated { invite } => {
                self.invite_codes.insert(invite.code.clone(), invite.id);
                self.invites.insert(invite.id, invite.clone());
            }
            Event::InviteRedeemed { id, user_id, at } => {
                if let Some(mut inv) = self.invites.get_mut(id) {
                    inv.redemption = Some(Redemption {
                        user_id: *user_id,
                        at: *at,
                    });
                }
            }
            Event::InviteRevoked { id } => {
                if let Some((_, inv)) = self.invites.remove(id) {
                    self.invite_codes.remove(&inv.code);
                }
            }
            // Resource deletion needs the resource's reservations; see forget_resource.
            Event::ResourceDeleted { .. } => {}
            Event::ResourceUpdated { .. }
            | Event::ReservationCreated { .. }
            | Event::ReservationUpdated { .. }
            | Event::ReservationCancelled { .. }
            | Event::ReservationPurged { .. }
            | Event::SyncRecorded { .. } => {}
        }
    }

    /// Apply a resource-scoped event. Caller holds the resource's write lock.
    pub(crate) fn apply_to_resource(&self, rs: &mut ResourceState, event: &Event) {
        match event {
            Event::ResourceUpdated { resource } => {
                rs.resource = resource.clone();
            }
            Event::ReservationCreated { reservation } => {
                self.reservation_index.insert(reservation.id, reservation.resource_id);
                self.owned
                    .entry(reservation.owner_id)
                    .or_default()
                    .insert(reservation.id);
                rs.insert_reservation(reservation.clone());
            }
            Event::ReservationUpdated { reservation } => {
                rs.remove_reservation(reservation.id);
                rs.insert_reservation(reservation.clone());
            }
            Event::ReservationCancelled { id, at, .. } => {
                if let Some(r) = rs.reservation_mut(id) {
                    r.status = ReservationStatus::Cancelled;
                    r.updated_at = *at;
                }
            }
            Event::ReservationPurged { id, owner_id, .. } => {
                rs.remove_reservation(*id);
                self.reservation_index.remove(id);
                if let Some(mut ids) = self.owned.get_mut(owner_id) {
                    ids.remove(id);
                }
            }
            Event::SyncRecorded {
                id,
                remote_event_id,
                status,
                ..
            } => {
                if let Some(r) = rs.reservation_mut(id) {
                    r.remote_event_id = remote_event_id.clone();
                    r.sync_status = *status;
                }
            }
            _ => {}
        }
    }

    /// Drop a deleted resource and every index entry pointing into it.
    pub(crate) fn forget_resource(&self, id: Ulid, tenant_id: Ulid, reservations: &[Reservation]) {
        for r in reservations {
            self.reservation_index.remove(&r.id);
            if let Some(mut ids) = self.owned.get_mut(&r.owner_id) {
                ids.remove(&r.id);
            }
        }
        if let Some(mut ids) = self.tenant_resources.get_mut(&tenant_id) {
            ids.remove(&id);
        }
        self.resources.remove(&id);
    }

    /// Rewrite the WAL as the minimal set of records that recreates the current
    /// state. Blocks new transactions for the duration.
    pub async fn compact(&self) -> Result<(), Error> {
        let _gate = self.commit_gate.write().await;

        let mut events: Vec<Event> = Vec::new();
        events.extend(self.tenants.iter().map(|t| Event::TenantCreated {
            tenant: t.value().clone(),
        }));
        events.extend(self.members.iter().map(|m| Event::UserRegistered {
            member: m.value().clone(),
        }));

        let states: Vec<SharedResourceState> = self.resources.iter().map(|e| e.value().clone()).collect();
        for rs in states {
            let guard = rs.read().await;
            events.push(Event::ResourceCreated {
                resource: guard.resource.clone(),
            });
            events.extend(guard.reservations.iter().map(|r| Event::ReservationCreated {
                reservation: r.clone(),
            }));
        }

        events.extend(self.invites.iter().map(|i| Event::InviteCreated {
            invite: i.value().clone(),
        }));

        let total = events.len();
        let records: Vec<Vec<Event>> = events.chunks(SNAPSHOT_CHUNK).map(<[Event]>::to_vec).collect();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { records, response: tx })
            .await
            .map_err(|_| Error::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| Error::WalError("WAL writer dropped response".into()))?
            .map_err(|e| Error::WalError(e.to_string()))?;

        metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
        info!(events = total, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
