mod coordinator;
mod worker;

pub use coordinator::{CalendarSync, RemoteEventView, SyncFailure, SyncSummary};
pub use worker::run_sync_worker;

use async_trait::async_trait;

use crate::error::Error;
use crate::model::{CalendarCredentials, Span};

/// What gets mirrored into the remote calendar for one reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSpec {
    pub title: String,
    pub description: Option<String>,
    pub location: String,
    pub span: Span,
    pub attendees: Vec<String>,
}

/// Handle to a remote event after create/update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEventRef {
    pub remote_id: String,
    pub link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEvent {
    pub remote_id: String,
    pub title: String,
    pub span: Span,
    pub link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// The access token is no longer accepted; a refresh may help.
    AuthExpired,
    NotFound,
    Failed(String),
    Timeout,
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::AuthExpired => f.write_str("calendar credentials expired"),
            GatewayError::NotFound => f.write_str("remote event not found"),
            GatewayError::Failed(msg) => write!(f, "calendar request failed: {msg}"),
            GatewayError::Timeout => f.write_str("calendar request timed out"),
        }
    }
}

impl std::error::Error for GatewayError {}

/// The external calendar service. Implementations are thin: no retries,
/// no token management; the coordinator owns both.
#[async_trait]
pub trait CalendarGateway: Send + Sync {
    async fn create_event(
        &self,
        credentials: &CalendarCredentials,
        spec: &EventSpec,
    ) -> Result<RemoteEventRef, GatewayError>;

    async fn update_event(
        &self,
        credentials: &CalendarCredentials,
        remote_id: &str,
        spec: &EventSpec,
    ) -> Result<RemoteEventRef, GatewayError>;

    async fn delete_event(&self, credentials: &CalendarCredentials, remote_id: &str) -> Result<(), GatewayError>;

    async fn list_events(&self, credentials: &CalendarCredentials, window: Span) -> Result<Vec<RemoteEvent>, GatewayError>;

    /// Exchange a refresh token for a new access token.
    async fn refresh_credentials(&self, refresh_token: &str) -> Result<String, GatewayError>;
}

#[derive(Debug)]
pub enum SyncError {
    /// The user has no calendar credentials on file.
    NotConnected,
    Store(Error),
    Gateway(GatewayError),
}

impl From<Error> for SyncError {
    fn from(e: Error) -> Self {
        SyncError::Store(e)
    }
}

impl From<GatewayError> for SyncError {
    fn from(e: GatewayError) -> Self {
        SyncError::Gateway(e)
    }
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::NotConnected => f.write_str("calendar not connected"),
            SyncError::Store(e) => write!(f, "{e}"),
            SyncError::Gateway(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SyncError {}
