use crate::model::{HOUR_MS, Ms};

// ── Reservations ─────────────────────────────────────────────

pub const MAX_RESERVATION_DURATION_MS: Ms = 8 * HOUR_MS;
pub const MAX_TITLE_LEN: usize = 200;
pub const MAX_DESCRIPTION_LEN: usize = 2_000;
pub const MAX_PARTICIPANTS: usize = 50;
/// Upper bound on a schedule/list window.
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * crate::model::DAY_MS;

// ── Rooms ────────────────────────────────────────────────────

pub const MAX_ROOM_NAME_LEN: usize = 100;
pub const MAX_AMENITIES: usize = 64;
pub const MAX_ROOMS_PER_TENANT: usize = 1_000;

// ── Tenants ──────────────────────────────────────────────────

pub const MIN_TENANT_NAME_LEN: usize = 2;
pub const MAX_TENANT_NAME_LEN: usize = 100;
pub const MAX_SLUG_LEN: usize = 50;
/// Suffixes probed per attempt before giving up on a base slug.
pub const MAX_SLUG_PROBES: u32 = 1_000;
/// Create attempts after losing a slug race.
pub const MAX_SLUG_ATTEMPTS: usize = 8;

// ── Invites ──────────────────────────────────────────────────

/// Random bytes per code; rendered as twice as many hex characters.
pub const INVITE_CODE_BYTES: usize = 6;
pub const MAX_INVITE_CODE_ATTEMPTS: usize = 5;
pub const DEFAULT_INVITE_TTL_DAYS: u32 = 7;
pub const MIN_INVITE_TTL_DAYS: u32 = 1;
pub const MAX_INVITE_TTL_DAYS: u32 = 30;

// ── Storage ──────────────────────────────────────────────────

/// Events per WAL record when writing a compacted snapshot.
pub const SNAPSHOT_CHUNK: usize = 512;
pub const WAL_CHANNEL_CAPACITY: usize = 4_096;
pub const NOTIFY_CHANNEL_CAPACITY: usize = 1_024;
