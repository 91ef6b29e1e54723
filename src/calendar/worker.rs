use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};

use crate::model::Event;

use super::CalendarSync;

/// Background task mirroring committed reservation changes into external
/// calendars. Runs until the store's broadcast channel closes.
pub async fn run_sync_worker(sync: Arc<CalendarSync>, mut rx: broadcast::Receiver<Event>) {
    loop {
        match rx.recv().await {
            Ok(event) => sync.handle_event(&event).await,
            Err(RecvError::Lagged(skipped)) => {
                // Missed events are picked up by the next bulk sync.
                warn!(skipped, "calendar sync worker lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
    info!("calendar sync worker stopped");
}
