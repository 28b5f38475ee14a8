/// Aggregation and localization for the event monitoring service.
///
/// Submodules:
/// - `window`: the polling loop that finalizes one bucket per minute
///   after the settle lag.
/// - `localize`: grid search for the most likely signal origin.

pub mod localize;
pub mod window;
