//! Client for the Mirahome sleep-report backend used by YUDEE smart pillows.
//!
//! [`coordinator::Coordinator`] ties the pieces together: it keeps a token
//! from [`auth::TokenManager`] fresh, fetches last night's report through
//! [`report::ReportClient`], and publishes it to the sensors in [`entity`].

pub mod api;
pub mod auth;
pub mod config;
pub mod coordinator;
pub mod data;
pub mod entity;
pub mod error;
pub mod report;

pub use config::{Config, Store};
pub use coordinator::{Coordinator, PollOutcome, PollState};
pub use error::PillowError;
