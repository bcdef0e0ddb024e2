//! Core engine for a seer marketplace: availability calendars, coin
//! ledger, appointment booking and auctions, backed by Postgres with an
//! in-memory twin for tests.

pub mod auction;
pub mod availability;
pub mod booking;
pub mod calendar;
pub mod config;
pub mod error;
pub mod interval;
pub mod ledger;
pub mod models;
pub mod notify;
pub mod store;
pub mod telemetry;
pub mod util;

pub use error::CoreError;
pub use error::CoreResult;
