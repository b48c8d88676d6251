//! Domain types for the persisted task representation.
//!
//! [`TaskRecord`] is what the store serializes. It carries the fields a
//! caller never sees directly (`claimed_at`, `attempts`, the CAS `version`)
//! and converts to the caller-facing [`TaskView`](crate::types::TaskView)
//! at the boundary.

pub mod record;

pub use record::*;
