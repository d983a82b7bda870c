//! Backend abstraction layer
//!
//! Provides the device trait the pipeline renders through, the headless CPU
//! reference device, and (with the `wgpu-backend` feature) an offscreen wgpu
//! device.

mod headless;
pub mod program;
mod reference;
pub mod traits;
pub mod types;

#[cfg(feature = "wgpu-backend")]
pub mod wgpu_backend;

pub use headless::{HeadlessBackend, HeadlessStats};
pub use program::{LightModel, Program};
pub use traits::*;
pub use types::*;

#[cfg(feature = "wgpu-backend")]
pub use wgpu_backend::WgpuBackend;
