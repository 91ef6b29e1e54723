use std::io;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::calendar::{CalendarGateway, CalendarSync, run_sync_worker};
use crate::config::Config;
use crate::maintenance;
use crate::membership::MembershipManager;
use crate::reservations::ReservationEngine;
use crate::rooms::RoomCatalog;
use crate::store::Store;

/// A running roombook: the store, the engines over it and the background
/// tasks that keep it tidy and mirrored.
pub struct Service {
    pub store: Arc<Store>,
    pub reservations: Arc<ReservationEngine>,
    pub membership: Arc<MembershipManager>,
    pub rooms: Arc<RoomCatalog>,
    /// Present only when a calendar gateway was supplied.
    pub calendar: Option<Arc<CalendarSync>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Service {
    /// Open the store under `config.data_dir` and start the compactor, plus
    /// the calendar sync worker if `gateway` is given.
    pub fn start(config: &Config, gateway: Option<Arc<dyn CalendarGateway>>) -> io::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let store = Arc::new(Store::open(config.wal_path())?);

        let mut tasks = vec![tokio::spawn(maintenance::run_compactor(
            store.clone(),
            config.compact_threshold,
            config.compact_interval,
        ))];

        let calendar = gateway.map(|gateway| {
            let sync = Arc::new(CalendarSync::new(store.clone(), gateway, config.gateway_timeout));
            tasks.push(tokio::spawn(run_sync_worker(sync.clone(), store.subscribe())));
            info!(timeout = ?config.gateway_timeout, "calendar sync enabled");
            sync
        });

        Ok(Self {
            reservations: Arc::new(ReservationEngine::new(store.clone())),
            membership: Arc::new(MembershipManager::new(store.clone())),
            rooms: Arc::new(RoomCatalog::new(store.clone())),
            store,
            calendar,
            tasks,
        })
    }

    /// Stop the background tasks and compact once more.
    pub async fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        if let Err(e) = self.store.compact().await {
            warn!("final compaction failed: {e}");
        }
    }
}
