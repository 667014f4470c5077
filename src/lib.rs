//! Privacy-preserving meal attendance monitoring.
//!
//! Attendance for pseudonymous students is scored against a rolling baseline
//! and anomalies lead to rate-limited, tone-adapted check-ins.

pub mod anonymize;
pub mod checkin;
pub mod clock;
pub mod config;
pub mod db;
pub mod delivery;
pub mod detection;
pub mod error;
pub mod messages;
pub mod models;
pub mod report;
pub mod service;
pub mod signals;
pub mod store;

pub use anonymize::{sanitize_for_api, to_api_value, Anonymizer};
pub use checkin::{CheckInOrchestrator, ResponseEffect, ResponseOutcome, TriggerOutcome};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::PulseConfig;
pub use db::PgStore;
pub use delivery::{Courier, DeliveryQueue, DeliveryWorker, LogNotifier, Notifier};
pub use detection::PatternEngine;
pub use error::{DeliveryError, PulseError, StoreError};
pub use messages::MessageComposer;
pub use service::{BatchIngestRequest, IngestOutcome, IngestRequest, MealPulse, PatternReport};
pub use store::{MemoryStore, PulseStore};
