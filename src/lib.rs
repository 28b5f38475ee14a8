//! Sensor event aggregation and source localization.
//!
//! Ingests location-tagged readings from a message source, deduplicates and
//! buckets them per minute, emits per-minute averages once each bucket has
//! settled, and finally estimates where the signal originates with an
//! inverse-distance-weighted grid search.

pub mod analysis;
pub mod clock;
pub mod config;
pub mod ingest;
pub mod ledger;
pub mod locations;
pub mod logging;
pub mod model;
pub mod report;
