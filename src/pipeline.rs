//! Booth Pipeline - Single Entry Point
//!
//! CRITICAL: saving a layout, starting a session and composing a print all
//! validate the template internally. No bypass.

use chrono::{DateTime, Utc};
use image::{DynamicImage, RgbaImage};
use thiserror::Error;

use crate::camera::Camera;
use crate::config::BoothConfig;
use crate::editor::{EditorError, LayoutEditor};
use crate::hashing::layout_fingerprint;
use crate::print::{PrintError, PrintSink};
use crate::render::{rasterize, render, CompositeDescription, RenderError};
use crate::session::{CaptureSession, PhotoSet, SessionError};
use crate::stage::{fit_capture_stage, StageTransform};
use crate::store::{StoreError, TemplateStore};
use crate::templates::{BackgroundImage, Template};
use crate::thermal::{self, CropRect, ThermalError};
use crate::validation::{ValidationResult, Validator};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Editor(#[from] EditorError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Print(#[from] PrintError),

    #[error("Background unavailable: {0}")]
    Background(#[from] ThermalError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// A composed print, ready for a sink.
#[derive(Debug, Clone)]
pub struct PrintJob {
    pub template_id: String,
    pub layout_hash: String,
    pub created_at: DateTime<Utc>,
    pub description: CompositeDescription,
    pub image: RgbaImage,
}

pub struct BoothPipeline<S: TemplateStore> {
    store: S,
    validator: Validator,
    config: BoothConfig,
}

impl<S: TemplateStore> BoothPipeline<S> {
    pub fn new(store: S, config: BoothConfig) -> Self {
        Self {
            store,
            validator: Validator::new(),
            config,
        }
    }

    pub fn config(&self) -> &BoothConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn list_templates(&self) -> Result<Vec<Template>, PipelineError> {
        Ok(self.store.load_all()?)
    }

    pub fn get_template(&self, id: &str) -> Result<Template, PipelineError> {
        Ok(self.store.get(id)?)
    }

    /// Validate a stored template and report every violation.
    pub fn validate_template(&self, id: &str) -> Result<ValidationResult, PipelineError> {
        let template = self.store.get(id)?;
        Ok(self.validator.validate(&template))
    }

    /// Fresh editor over a prepared (cropped, thermal-width) background.
    pub fn new_editor(&self, source_image: &[u8], crop: Option<CropRect>) -> Result<LayoutEditor, PipelineError> {
        let prepared = thermal::prepare_background(source_image, crop)?;
        let mut editor = LayoutEditor::new(BackgroundImage::embedded(prepared));
        editor.load_embedded_background()?;
        Ok(editor)
    }

    /// Editor for a stored template, with its background height re-read.
    pub fn open_editor(&self, id: &str) -> Result<LayoutEditor, PipelineError> {
        let template = self.store.get(id)?;
        let mut editor = LayoutEditor::open(&template);
        match self.background_bytes(&template) {
            Ok(bytes) => {
                if let Err(e) = editor.load_background(&bytes) {
                    log::warn!("background for '{}' unreadable, keeping stored height: {}", template.name, e);
                }
            }
            Err(e) => log::warn!("background for '{}' unavailable, keeping stored height: {}", template.name, e),
        }
        Ok(editor)
    }

    /// Persist the editor's layout. The editor is untouched on failure.
    pub fn save_layout(&mut self, editor: &LayoutEditor) -> Result<Template, PipelineError> {
        let template = editor.save()?;
        self.ensure_valid(&template)?;
        self.store.save(&template).map_err(|e| {
            log::error!("saving '{}' failed, editor state kept: {}", template.name, e);
            PipelineError::from(e)
        })
    }

    pub fn delete_template(&mut self, id: &str) -> Result<(), PipelineError> {
        self.store.delete(id).map_err(|e| {
            log::error!("deleting {} failed: {}", id, e);
            PipelineError::from(e)
        })
    }

    /// Prepare (but do not start) a session for a stored template.
    pub fn start_session<C: Camera>(&self, id: &str, camera: C) -> Result<CaptureSession<C>, PipelineError> {
        let template = self.store.get(id)?;
        if template.slots.is_empty() {
            return Err(SessionError::EmptySlotList.into());
        }
        self.ensure_valid(&template)?;
        Ok(CaptureSession::new(template, camera, self.config.timing.clone()))
    }

    /// Viewport mapping for the live capture stage, using the configured margin.
    pub fn capture_stage(&self, viewport_w: f64, viewport_h: f64, template: &Template) -> StageTransform {
        fit_capture_stage(viewport_w, viewport_h, template, self.config.stage_margin)
    }

    pub fn background_bytes(&self, template: &Template) -> Result<Vec<u8>, PipelineError> {
        match &template.background {
            BackgroundImage::Embedded { data, .. } => Ok(data.clone()),
            BackgroundImage::Url(reference) => Ok(self.store.fetch_background(reference)?),
        }
    }

    pub fn load_background(&self, template: &Template) -> Result<DynamicImage, PipelineError> {
        Ok(thermal::decode(&self.background_bytes(template)?)?)
    }

    /// Compose the final print for a finished photo set.
    ///
    /// This ALWAYS validates the template first.
    pub fn compose_print(&self, template: &Template, photos: &PhotoSet) -> Result<PrintJob, PipelineError> {
        self.ensure_valid(template)?;

        let missing = template.slots.iter().filter(|s| !photos.contains_key(&s.id)).count();
        if missing > 0 {
            log::warn!("composing '{}' with {} empty slots", template.name, missing);
        }

        let description = render(template, photos);
        let background = self.load_background(template)?;
        let image = rasterize(&description, &background, photos)?;

        Ok(PrintJob {
            template_id: template.id.clone(),
            layout_hash: layout_fingerprint(template)?,
            created_at: Utc::now(),
            description,
            image,
        })
    }

    pub fn print(&self, job: &PrintJob, sink: &mut dyn PrintSink) -> Result<(), PipelineError> {
        sink.submit(&job.image, &self.config.print).map_err(|e| {
            log::error!("print of {} failed: {}", job.template_id, e);
            PipelineError::from(e)
        })
    }

    fn ensure_valid(&self, template: &Template) -> Result<(), PipelineError> {
        let result = self.validator.validate(template);
        if result.valid {
            return Ok(());
        }
        let messages: Vec<_> = result
            .violations
            .iter()
            .filter(|v| v.is_blocking())
            .map(|v| format!("{}: {}", v.rule, v.message))
            .collect();
        log::warn!("template '{}' rejected: {}", template.name, messages.join("; "));
        Err(PipelineError::ValidationFailed(messages.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    struct BrokenStore;

    impl TemplateStore for BrokenStore {
        fn load_all(&self) -> Result<Vec<Template>, StoreError> {
            Ok(vec![])
        }

        fn save(&mut self, _template: &Template) -> Result<Template, StoreError> {
            Err(StoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full")))
        }

        fn delete(&mut self, id: &str) -> Result<(), StoreError> {
            Err(StoreError::NotFound(id.to_string()))
        }

        fn fetch_background(&self, reference: &str) -> Result<Vec<u8>, StoreError> {
            Err(StoreError::InvalidReference(reference.to_string()))
        }
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([255, 255, 255]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_failed_save_keeps_editor_state() {
        let mut pipeline = BoothPipeline::new(BrokenStore, BoothConfig::default());
        let mut editor = pipeline.new_editor(&png(288, 200), None).unwrap();
        let id = editor.add_slot();

        let err = pipeline.save_layout(&editor).unwrap_err();
        assert!(err.to_string().contains("disk full"));
        assert!(editor.slot(&id).is_some());
        assert_eq!(editor.canvas_height(), 400);
    }

    #[test]
    fn test_new_editor_normalizes_background() {
        let pipeline = BoothPipeline::new(MemoryStore::new(), BoothConfig::default());
        let editor = pipeline.new_editor(&png(1152, 600), None).unwrap();
        assert_eq!(editor.canvas_height(), 300);
        assert!(editor.background().is_embedded());
    }

    #[test]
    fn test_compose_refuses_invalid_layout() {
        let pipeline = BoothPipeline::new(MemoryStore::new(), BoothConfig::default());
        let template = Template {
            id: "t".into(),
            name: "t".into(),
            created_at: Utc::now(),
            schema_version: crate::SCHEMA_VERSION.into(),
            width: 576,
            height: 100,
            background: BackgroundImage::embedded(png(576, 100)),
            slots: vec![],
        };
        let err = pipeline.compose_print(&template, &PhotoSet::new()).unwrap_err();
        assert!(err.to_string().contains("Validation failed"));
    }

    #[test]
    fn test_capture_stage_uses_configured_margin() {
        let config = BoothConfig { stage_margin: 0.5, ..BoothConfig::default() };
        let pipeline = BoothPipeline::new(MemoryStore::new(), config);
        let mut template = Template {
            id: "t".into(),
            name: "t".into(),
            created_at: Utc::now(),
            schema_version: crate::SCHEMA_VERSION.into(),
            width: 576,
            height: 800,
            background: BackgroundImage::Url("bg".into()),
            slots: vec![],
        };
        let stage = pipeline.capture_stage(1152.0, 1600.0, &template);
        assert!((stage.scale - 1.0).abs() < 1e-9);
        template.height = 1600;
        assert!((pipeline.capture_stage(1152.0, 1600.0, &template).scale - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_session_for_unknown_template() {
        let pipeline = BoothPipeline::new(MemoryStore::new(), BoothConfig::default());
        let err = pipeline
            .start_session("missing", crate::camera::QueuedCamera::new(vec![]))
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::Store(StoreError::NotFound(_))));
    }
}
