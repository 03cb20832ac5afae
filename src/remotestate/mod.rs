//! Remote state of a single unit.
//!
//! The [`Tracker`] follows every change source for the unit, folds events
//! into a [`Snapshot`] and tells its consumer when the snapshot may have
//! advanced.

pub mod snapshot;
pub mod tracker;

pub use snapshot::{RelationSnapshot, Snapshot};
pub use tracker::{Tracker, TrackerConfig};
