//! Resource data
//!
//! Geometry consumed by the pipeline. Loading from files is left to the
//! application.

mod mesh;

pub use mesh::*;
