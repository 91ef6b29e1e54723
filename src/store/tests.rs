use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use ulid::Ulid;

use super::*;
use crate::error::ErrorKind;

const H: Ms = 3_600_000;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("roombook_test_store");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn fixed_clock(at: Ms) -> (Clock, Arc<AtomicI64>) {
    let now = Arc::new(AtomicI64::new(at));
    let handle = now.clone();
    (Arc::new(move || handle.load(Ordering::SeqCst)), now)
}

fn tenant(slug: &str) -> Tenant {
    Tenant {
        id: Ulid::new(),
        name: slug.to_uppercase(),
        slug: slug.into(),
        description: None,
        created_at: 0,
    }
}

fn room(tenant_id: Ulid) -> Resource {
    Resource {
        id: Ulid::new(),
        tenant_id,
        name: "Lab".into(),
        description: None,
        capacity: 4,
        floor: None,
        amenities: Vec::new(),
        active: true,
    }
}

fn reservation(room: &Resource, owner_id: Ulid, start: Ms, end: Ms) -> Reservation {
    Reservation {
        id: Ulid::new(),
        resource_id: room.id,
        tenant_id: room.tenant_id,
        owner_id,
        title: "review".into(),
        description: None,
        span: Span::new(start, end),
        status: ReservationStatus::Confirmed,
        participants: Vec::new(),
        remote_event_id: None,
        sync_status: SyncStatus::Unsynced,
        created_at: 0,
        updated_at: 0,
    }
}

/// A tenant with one room, committed through the public transaction API.
async fn seed(store: &Store, slug: &str) -> (Tenant, Resource) {
    let t = tenant(slug);
    let r = room(t.id);
    let (t2, r2) = (t.clone(), r.clone());
    store
        .transact(Scope::new().tenant(t.id), move |txn| {
            txn.claim_slug(&t2.slug, t2.id)?;
            txn.stage(Event::TenantCreated { tenant: t2 });
            txn.stage(Event::ResourceCreated { resource: r2 });
            Ok(())
        })
        .await
        .unwrap();
    (t, r)
}

#[tokio::test]
async fn commit_applies_and_publishes() {
    let store = Store::open(test_wal_path("commit_applies.wal")).unwrap();
    let mut rx = store.subscribe();
    let (t, r) = seed(&store, "acme").await;

    assert_eq!(store.tenant(&t.id).unwrap().slug, "acme");
    assert_eq!(store.tenant_by_slug("acme").unwrap().id, t.id);
    assert_eq!(store.resource(&r.id).await.unwrap(), r);
    assert_eq!(store.resources_of(t.id).len(), 1);

    assert!(matches!(rx.recv().await.unwrap(), Event::TenantCreated { .. }));
    assert!(matches!(rx.recv().await.unwrap(), Event::ResourceCreated { .. }));
}

#[tokio::test]
async fn failed_closure_commits_nothing_and_releases_claims() {
    let store = Store::open(test_wal_path("abort_claims.wal")).unwrap();
    let t = tenant("ghost");

    let err = store
        .transact(Scope::new().tenant(t.id), |txn| {
            txn.claim_slug("ghost", t.id)?;
            txn.stage(Event::TenantCreated { tenant: t.clone() });
            Err::<(), _>(Error::validation("changed my mind"))
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(store.tenant(&t.id).is_none());
    assert!(!store.slugs.contains_key("ghost"));
    assert_eq!(store.wal_appends_since_compact().await, 0);
}

#[tokio::test]
async fn second_claim_of_a_slug_is_a_unique_violation() {
    let store = Store::open(test_wal_path("slug_claim.wal")).unwrap();
    seed(&store, "taken").await;
    let other = Ulid::new();
    let err = store
        .transact(Scope::new().tenant(other), |txn| txn.claim_slug("taken", other))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UniqueViolation("tenant slug")));
}

#[tokio::test]
async fn events_outside_scope_are_rejected() {
    let store = Store::open(test_wal_path("scope_check.wal")).unwrap();
    let (t, r) = seed(&store, "scoped").await;
    let owner = Ulid::new();

    // Resource event without the resource lock.
    let err = store
        .transact(Scope::new().tenant(t.id), |txn| {
            txn.stage(Event::ReservationCreated {
                reservation: reservation(&r, owner, 10 * H, 11 * H),
            });
            Ok(())
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);

    // Member event without the user lock.
    let err = store
        .transact(Scope::new().tenant(t.id), |txn| {
            txn.stage(Event::MemberAssigned {
                user_id: owner,
                tenant_id: t.id,
                role: Role::Member,
            });
            Ok(())
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert!(store.reservations_in(&r.id, &Span::new(0, 24 * H)).await.is_empty());
}

#[tokio::test]
async fn unknown_resource_scope_is_not_found() {
    let store = Store::open(test_wal_path("unknown_resource.wal")).unwrap();
    let err = store
        .with_resource_lock(Ulid::new(), |_| Ok(()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn reservation_lifecycle_is_indexed() {
    let (clock, _) = fixed_clock(0);
    let store = Store::open_with_clock(test_wal_path("lifecycle.wal"), clock).unwrap();
    let (_, r) = seed(&store, "lifecycle").await;
    let owner = Ulid::new();
    let res = reservation(&r, owner, 10 * H, 11 * H);
    let id = res.id;

    store
        .with_resource_lock(r.id, |txn| {
            txn.stage(Event::ReservationCreated { reservation: res });
            Ok(())
        })
        .await
        .unwrap();
    assert_eq!(store.resource_for_reservation(&id), Some(r.id));
    assert_eq!(store.reservations_owned_by(&owner).await.len(), 1);

    store
        .with_resource_lock(r.id, |txn| {
            assert!(txn.reservation(&id).is_some());
            txn.stage(Event::ReservationCancelled {
                id,
                resource_id: r.id,
                owner_id: owner,
                at: 5,
            });
            Ok(())
        })
        .await
        .unwrap();
    let cancelled = store.reservation(&id).await.unwrap();
    assert!(cancelled.is_cancelled());
    assert_eq!(cancelled.updated_at, 5);

    store
        .with_resource_lock(r.id, |txn| {
            txn.stage(Event::ReservationPurged {
                id,
                resource_id: r.id,
                owner_id: owner,
                remote_event_id: None,
            });
            Ok(())
        })
        .await
        .unwrap();
    assert!(store.reservation(&id).await.is_none());
    assert!(store.resource_for_reservation(&id).is_none());
    assert!(store.reservations_owned_by(&owner).await.is_empty());
}

#[tokio::test]
async fn state_survives_reopen() {
    let path = test_wal_path("reopen.wal");
    let owner = Ulid::new();
    let (t, r, res) = {
        let store = Store::open(path.clone()).unwrap();
        let (t, r) = seed(&store, "durable").await;
        let res = reservation(&r, owner, 10 * H, 11 * H);
        let staged = res.clone();
        store
            .with_resource_lock(r.id, |txn| {
                txn.stage(Event::ReservationCreated { reservation: staged });
                Ok(())
            })
            .await
            .unwrap();
        (t, r, res)
    };

    let store = Store::open(path).unwrap();
    assert_eq!(store.tenant(&t.id).unwrap().slug, "durable");
    assert_eq!(store.reservation(&res.id).await.unwrap(), res);
    assert_eq!(store.resource_for_reservation(&res.id), Some(r.id));
    assert!(store.slugs.contains_key("durable"));
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction.wal");
    let owner = Ulid::new();
    let store = Store::open(path.clone()).unwrap();
    let (t, r) = seed(&store, "compact").await;

    // Churn: many create/purge pairs, one survivor.
    for i in 0..20 {
        let res = reservation(&r, owner, i * H, i * H + H / 2);
        let id = res.id;
        store
            .with_resource_lock(r.id, |txn| {
                txn.stage(Event::ReservationCreated { reservation: res });
                Ok(())
            })
            .await
            .unwrap();
        store
            .with_resource_lock(r.id, |txn| {
                txn.stage(Event::ReservationPurged {
                    id,
                    resource_id: r.id,
                    owner_id: owner,
                    remote_event_id: None,
                });
                Ok(())
            })
            .await
            .unwrap();
    }
    let keeper = reservation(&r, owner, 30 * H, 31 * H);
    let staged = keeper.clone();
    store
        .with_resource_lock(r.id, |txn| {
            txn.stage(Event::ReservationCreated { reservation: staged });
            Ok(())
        })
        .await
        .unwrap();

    let before = std::fs::metadata(&path).unwrap().len();
    store.compact().await.unwrap();
    let after = std::fs::metadata(&path).unwrap().len();
    assert!(after < before, "compacted WAL should be smaller: {after} < {before}");

    let reopened = Store::open(path).unwrap();
    assert_eq!(reopened.tenant(&t.id).unwrap().slug, "compact");
    let owned = reopened.reservations_owned_by(&owner).await;
    assert_eq!(owned, vec![keeper]);
}

#[tokio::test]
async fn deleting_a_room_drops_its_index_entries() {
    let store = Store::open(test_wal_path("room_delete.wal")).unwrap();
    let (t, r) = seed(&store, "rooms").await;
    let owner = Ulid::new();
    let res = reservation(&r, owner, H, 2 * H);
    let id = res.id;
    store
        .with_resource_lock(r.id, |txn| {
            txn.stage(Event::ReservationCreated { reservation: res });
            Ok(())
        })
        .await
        .unwrap();

    store
        .transact(Scope::new().tenant(t.id).resource(r.id), |txn| {
            txn.stage(Event::ResourceDeleted {
                id: r.id,
                tenant_id: t.id,
            });
            Ok(())
        })
        .await
        .unwrap();

    assert!(store.resource(&r.id).await.is_none());
    assert!(store.resources_of(t.id).is_empty());
    assert!(store.resource_for_reservation(&id).is_none());
    assert!(store.reservations_owned_by(&owner).await.is_empty());
}

#[tokio::test]
async fn waiter_on_a_deleted_room_gets_not_found() {
    let store = Arc::new(Store::open(test_wal_path("delete_race.wal")).unwrap());
    let (t, r) = seed(&store, "race").await;

    let mut deleting = store.begin(Scope::new().tenant(t.id).resource(r.id)).await.unwrap();

    let res = reservation(&r, Ulid::new(), H, 2 * H);
    let id = res.id;
    let waiter = {
        let store = store.clone();
        let room_id = r.id;
        tokio::spawn(async move {
            store
                .with_resource_lock(room_id, |txn| {
                    txn.stage(Event::ReservationCreated { reservation: res });
                    Ok(())
                })
                .await
        })
    };
    // Let the waiter pick up the room's lock handle and block on it.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    deleting.stage(Event::ResourceDeleted {
        id: r.id,
        tenant_id: t.id,
    });
    deleting.commit().await.unwrap();

    let err = waiter.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(store.resource_for_reservation(&id).is_none());
    assert!(store.reservation(&id).await.is_none());
}

#[tokio::test]
async fn txn_clock_is_read_at_begin() {
    let (clock, now) = fixed_clock(1_000);
    let store = Store::open_with_clock(test_wal_path("txn_clock.wal"), clock).unwrap();
    let txn = store.begin(Scope::new()).await.unwrap();
    now.store(9_000, Ordering::SeqCst);
    assert_eq!(txn.now(), 1_000);
    assert_eq!(store.now(), 9_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn opposite_scope_orders_do_not_deadlock() {
    let store = Arc::new(Store::open(test_wal_path("lock_order.wal")).unwrap());
    let (a, b) = (Ulid::new(), Ulid::new());

    let mut handles = Vec::new();
    for i in 0..50 {
        let store = store.clone();
        // Scopes name the users in different orders; acquisition is sorted.
        let scope = if i % 2 == 0 {
            Scope::new().user(a).user(b)
        } else {
            Scope::new().user(b).user(a)
        };
        handles.push(tokio::spawn(async move {
            store.transact(scope, |_| Ok(())).await
        }));
    }
    let joined = tokio::time::timeout(std::time::Duration::from_secs(10), futures::future::join_all(handles))
        .await
        .expect("transactions deadlocked");
    for h in joined {
        h.unwrap().unwrap();
    }
}
