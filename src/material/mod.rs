//! Material plumbing
//!
//! Typed uniform values, the semantic registry and the string-keyed
//! material/technique lookup the pipeline renders through.

pub mod builtin;
mod library;
mod semantic;
mod variant;

pub use library::*;
pub use semantic::*;
pub use variant::*;
