//! Status enum and the request/response shapes a transport layer maps.
//!
//! The persisted representation lives in [`domain`](crate::domain); these
//! types are what callers see.

pub mod params;
pub mod task;

pub use params::*;
pub use task::*;
