pub mod availability;
pub mod calendar;
pub mod config;
pub mod conflict;
pub mod error;
pub mod limits;
pub mod maintenance;
pub mod membership;
pub mod model;
pub mod notify;
pub mod observability;
pub mod reservations;
pub mod rooms;
pub mod service;
pub mod store;
pub mod wal;

pub use error::{Error, ErrorKind};
