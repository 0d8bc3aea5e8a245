//! Streaming, multi-resolution texture atlas engine for zoomable photo galleries.
//!
//! The engine tracks a working set of photos at varying levels of detail,
//! packs their bitmaps into shared GPU-sized atlas textures, and streams
//! upgrades in as a viewport pans and zooms. Callers drive it through
//! [`engine::AtlasEngine`]; everything else is public so the pieces can be
//! exercised independently.

pub mod atlas;
pub mod device;
pub mod distributor;
pub mod engine;
pub mod error;
pub mod memory;
pub mod packer;
pub mod photo;
pub mod pool;
pub mod processor;
pub mod selector;
pub mod stream;

pub use atlas::{AtlasRegion, TextureAtlas};
pub use device::{DeviceCapabilities, PerformanceTier};
pub use engine::{AtlasEngine, EngineConfig, ViewportUpdate};
pub use error::ProcessError;
pub use memory::{MemoryStatus, Pressure};
pub use photo::{AtlasPriority, LodLevel, PhotoPriority, PhotoQuality, PhotoRef};
pub use stream::AtlasStreamResult;
