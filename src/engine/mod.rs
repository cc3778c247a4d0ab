//! Terminal side of a reconciliation pass
//!
//! The converge crate plans and executes; this module shows the plan,
//! asks for confirmation and reports progress and results.

pub mod differ;
pub mod executor;

pub use differ::display_plan;
pub use executor::{PassOptions, Prompt, execute};
