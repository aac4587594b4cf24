//! Detection analysis.
//!
//! Aggregation of detection hits, package selection rules and the loop guard
//! that keeps resubmission chains finite.

pub mod aggregator;
pub mod guard;
pub mod rules;

pub use aggregator::{aggregate, DetectionSet};
pub use guard::{LoopGuard, Rejection};
pub use rules::{select_package, Package, ParentPackage};
