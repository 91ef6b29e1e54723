#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ulid::Ulid;

use roombook::calendar::{CalendarGateway, EventSpec, GatewayError, RemoteEvent, RemoteEventRef};
use roombook::membership::{InviteRequest, MembershipManager};
use roombook::model::*;
use roombook::reservations::{NewReservation, ReservationEngine};
use roombook::rooms::{RoomCatalog, RoomSpec};
use roombook::store::Store;

/// 2026-01-05T00:00:00Z, a Monday.
pub const T0: Ms = 1_767_571_200_000;

/// `T0` plus `h` hours.
pub fn at(h: i64) -> Ms {
    T0 + h * HOUR_MS
}

// ── Clock ────────────────────────────────────────────────────

#[derive(Clone)]
pub struct ManualClock(Arc<AtomicI64>);

impl ManualClock {
    pub fn new(start: Ms) -> Self {
        Self(Arc::new(AtomicI64::new(start)))
    }

    pub fn set(&self, now: Ms) {
        self.0.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Ms) {
        self.0.fetch_add(by, Ordering::SeqCst);
    }

    pub fn clock(&self) -> roombook::store::Clock {
        let now = self.0.clone();
        Arc::new(move || now.load(Ordering::SeqCst))
    }
}

// ── Harness ──────────────────────────────────────────────────

pub struct Harness {
    pub store: Arc<Store>,
    pub clock: ManualClock,
    pub reservations: ReservationEngine,
    pub membership: MembershipManager,
    pub rooms: RoomCatalog,
}

pub fn temp_wal() -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("roombook_it_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    dir.join("roombook.wal")
}

impl Harness {
    pub fn new() -> Self {
        let clock = ManualClock::new(T0);
        let store = Arc::new(Store::open_with_clock(temp_wal(), clock.clock()).unwrap());
        Self {
            reservations: ReservationEngine::new(store.clone()),
            membership: MembershipManager::new(store.clone()),
            rooms: RoomCatalog::new(store.clone()),
            store,
            clock,
        }
    }

    /// The caller as the routing layer would see them right now.
    pub fn principal(&self, user_id: Ulid) -> Principal {
        let m = self.store.member(&user_id).unwrap();
        Principal::new(user_id, m.tenant_id, m.role)
    }

    pub async fn user(&self, email: &str) -> Ulid {
        let id = Ulid::new();
        self.membership.register_user(id, email).await.unwrap();
        id
    }

    /// A fresh tenant and its founding admin.
    pub async fn tenant(&self, name: &str, admin_email: &str) -> (Tenant, Principal) {
        let admin = self.user(admin_email).await;
        let tenant = self.membership.create_tenant(admin, name, None).await.unwrap();
        (tenant, self.principal(admin))
    }

    /// Register `email` and bring them in through an invite from `admin`.
    pub async fn join(&self, admin: &Principal, email: &str, role: Role) -> Principal {
        let user = self.user(email).await;
        let invite = self
            .membership
            .create_invite(
                admin,
                InviteRequest {
                    role,
                    email: None,
                    ttl_days: None,
                },
            )
            .await
            .unwrap();
        self.membership.redeem_invite(&invite.code, user, email).await.unwrap();
        self.principal(user)
    }

    pub async fn room(&self, admin: &Principal, name: &str) -> Resource {
        self.rooms
            .create(
                admin,
                RoomSpec {
                    name: name.into(),
                    description: None,
                    capacity: 6,
                    floor: Some(1),
                    amenities: vec!["screen".into()],
                    active: true,
                },
            )
            .await
            .unwrap()
    }

    pub async fn book(&self, who: &Principal, room: Ulid, start: Ms, end: Ms) -> Result<Reservation, roombook::Error> {
        self.reservations.create(who, booking(room, start, end)).await
    }
}

pub fn booking(resource_id: Ulid, start: Ms, end: Ms) -> NewReservation {
    NewReservation {
        resource_id,
        start,
        end,
        title: "Planning".into(),
        description: None,
        participants: Vec::new(),
    }
}

// ── Calendar double ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Create { token: String, title: String },
    Update { token: String, remote_id: String },
    Delete { token: String, remote_id: String },
    List { token: String },
    Refresh { refresh_token: String },
}

/// In-memory calendar. Replies come from per-operation scripts first and
/// fall back to success; every call is recorded.
#[derive(Default)]
pub struct ScriptedGateway {
    calls: Mutex<Vec<Call>>,
    create_script: Mutex<VecDeque<Result<(), GatewayError>>>,
    update_script: Mutex<VecDeque<Result<(), GatewayError>>>,
    delete_script: Mutex<VecDeque<Result<(), GatewayError>>>,
    refresh_script: Mutex<VecDeque<Result<String, GatewayError>>>,
    listed: Mutex<Vec<RemoteEvent>>,
    delay: Mutex<Option<std::time::Duration>>,
    next_id: AtomicU64,
}

impl ScriptedGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    pub fn script_create(&self, reply: Result<(), GatewayError>) {
        self.create_script.lock().unwrap().push_back(reply);
    }

    pub fn script_update(&self, reply: Result<(), GatewayError>) {
        self.update_script.lock().unwrap().push_back(reply);
    }

    pub fn script_delete(&self, reply: Result<(), GatewayError>) {
        self.delete_script.lock().unwrap().push_back(reply);
    }

    pub fn script_refresh(&self, reply: Result<String, GatewayError>) {
        self.refresh_script.lock().unwrap().push_back(reply);
    }

    pub fn set_listed(&self, events: Vec<RemoteEvent>) {
        *self.listed.lock().unwrap() = events;
    }

    /// Make every create call take `delay` before answering.
    pub fn set_delay(&self, delay: std::time::Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn next<T>(script: &Mutex<VecDeque<Result<T, GatewayError>>>) -> Option<Result<T, GatewayError>> {
        script.lock().unwrap().pop_front()
    }
}

#[async_trait]
impl CalendarGateway for ScriptedGateway {
    async fn create_event(
        &self,
        credentials: &CalendarCredentials,
        spec: &EventSpec,
    ) -> Result<RemoteEventRef, GatewayError> {
        self.record(Call::Create {
            token: credentials.access_token.clone(),
            title: spec.title.clone(),
        });
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Self::next(&self.create_script).unwrap_or(Ok(()))?;
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(RemoteEventRef {
            remote_id: format!("evt-{n}"),
            link: Some(format!("https://calendar.test/evt-{n}")),
        })
    }

    async fn update_event(
        &self,
        credentials: &CalendarCredentials,
        remote_id: &str,
        _spec: &EventSpec,
    ) -> Result<RemoteEventRef, GatewayError> {
        self.record(Call::Update {
            token: credentials.access_token.clone(),
            remote_id: remote_id.into(),
        });
        Self::next(&self.update_script).unwrap_or(Ok(()))?;
        Ok(RemoteEventRef {
            remote_id: remote_id.into(),
            link: None,
        })
    }

    async fn delete_event(&self, credentials: &CalendarCredentials, remote_id: &str) -> Result<(), GatewayError> {
        self.record(Call::Delete {
            token: credentials.access_token.clone(),
            remote_id: remote_id.into(),
        });
        Self::next(&self.delete_script).unwrap_or(Ok(()))
    }

    async fn list_events(&self, credentials: &CalendarCredentials, window: Span) -> Result<Vec<RemoteEvent>, GatewayError> {
        self.record(Call::List {
            token: credentials.access_token.clone(),
        });
        Ok(self
            .listed
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.span.overlaps(&window))
            .cloned()
            .collect())
    }

    async fn refresh_credentials(&self, refresh_token: &str) -> Result<String, GatewayError> {
        self.record(Call::Refresh {
            refresh_token: refresh_token.into(),
        });
        Self::next(&self.refresh_script).unwrap_or_else(|| Ok(format!("fresh-{refresh_token}")))
    }
}

pub fn credentials(access: &str) -> CalendarCredentials {
    CalendarCredentials {
        access_token: access.into(),
        refresh_token: Some("refresh-1".into()),
    }
}

/// Poll `check` until it holds or a couple of seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    check()
}
