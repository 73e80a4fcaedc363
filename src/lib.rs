//! BoothPrint Core - Photo Booth Layout and Capture Engine
//!
//! # Ground Rules
//! 1. Templates Are Contracts: a layout is validated before it is saved,
//!    captured into, or printed.
//! 2. One Coordinate Space: slot geometry is stored in template pixels,
//!    never in screen pixels.
//! 3. Capture Order Is Top-To-Bottom
//! 4. Print At Native Width: 576 dots, no resampling at the sink.
//! 5. Sessions Own The Camera: it is released on every exit path.

pub mod templates;
pub mod validation;
pub mod hashing;
pub mod thermal;
pub mod camera;
pub mod editor;
pub mod session;
pub mod stage;
pub mod render;
pub mod store;
pub mod print;
pub mod config;
pub mod pipeline;

pub use templates::{BackgroundImage, LayoutError, PhotoSlot, SlotId, Template, TemplateId};
pub use validation::{ValidationResult, ValidationRule, ValidationViolation, ViolationSeverity};
pub use hashing::{canonical_json, layout_fingerprint};
pub use camera::{Camera, ImageData, QueuedCamera};
pub use editor::{EditorError, LayoutEditor};
pub use session::{CaptureSession, Phase, PhotoSet, SessionError, SessionEvent, SessionTiming};
pub use stage::{SlotRect, StageTransform};
pub use render::{CompositeDescription, Layer, Placeholder};
pub use store::{DirectoryStore, MemoryStore, StoreError, TemplateStore};
pub use print::{PngFileSink, PrintSink, PrintSpec};
pub use config::BoothConfig;
pub use pipeline::{BoothPipeline, PipelineError, PrintJob};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Schema version written into every saved template.
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Print head width of the target thermal printer, in dots.
pub const THERMAL_WIDTH: u32 = 576;
