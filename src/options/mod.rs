//! Instrumentation options and breakpoint resolution.

pub mod breakpoint;
pub mod token;

pub use breakpoint::{resolve_breakpoints, BreakpointSlot, Resolution};
pub use token::OptionString;
