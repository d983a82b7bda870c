//! Deferred Renderer - a per-frame deferred pipeline over a pluggable device
//!
//! Two devices implement [`backend::GraphicsBackend`]:
//! - **headless**: a CPU reference device that records passes and runs
//!   each built-in program as a CPU kernel, used by tests and tooling
//! - **wgpu**: an offscreen GPU device (feature `wgpu-backend`)
//!
//! # Features
//! - G-buffer fill, linear depth and per-light lighting accumulation
//! - Shadow maps and cube shadow maps for shadow-casting lights
//! - Light probes captured into cube textures on demand
//! - Post-process chain: SSDO, subsurface scattering, HDR with bloom and
//!   eye adaptation, and scene-authored material effects
//! - Resolution changes that rebuild targets without re-creating layouts
//!
//! ```no_run
//! use deferred_renderer::{HeadlessBackend, PipelineConfig, PipelineManager, Scene};
//!
//! let device = HeadlessBackend::new(320, 240);
//! let mut manager = PipelineManager::new(device, PipelineConfig::default())?;
//! let mut scene = Scene::new();
//! manager.render_frame(&mut scene, 1.0 / 60.0)?;
//! # Ok::<(), deferred_renderer::PipelineError>(())
//! ```

pub mod backend;
pub mod error;
pub mod material;
pub mod pipeline;
pub mod resources;
pub mod scene;

pub use backend::{GraphicsBackend, HeadlessBackend};
#[cfg(feature = "wgpu-backend")]
pub use backend::WgpuBackend;
pub use error::{PipelineError, PipelineResult};
pub use material::{MaterialLibrary, MaterialSemantics, MaterialVariant, Semantic};
pub use pipeline::{PipelineConfig, PipelineManager};
pub use scene::{Camera, CameraOrder, Light, LightProbe, Scene};
