//! Energy Management System logic: mode decision and clamped/ramped apply.

pub mod applier;
pub mod decider;

pub use applier::EmsApplier;
pub use decider::{EmsMode, decide};
