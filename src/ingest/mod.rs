/// Message intake for the event monitoring service.
///
/// Submodules:
/// - `intake`: decoding, deduplication and the known-location check.
/// - `queue`: the `MessageSource` seam and the PostgreSQL-backed queue.
/// - `replay`: file-backed source for development runs.

pub mod intake;
pub mod queue;
pub mod replay;
