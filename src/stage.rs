//! Template-to-viewport mapping
//!
//! Every on-screen surface (capture stage, print preview) is the template
//! scaled by ONE uniform factor. Width and height are never stretched
//! independently.

use serde::{Deserialize, Serialize};

use crate::templates::{PhotoSlot, Template};

pub const STAGE_MARGIN: f64 = 0.95;

/// Vertical space the print preview reserves for its header and footer.
pub const PREVIEW_CHROME_HEIGHT: f64 = 180.0;
pub const PREVIEW_CHROME_WIDTH: f64 = 32.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SlotRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub rotation: f64,
}

impl From<&PhotoSlot> for SlotRect {
    fn from(slot: &PhotoSlot) -> Self {
        Self {
            x: slot.x as f64,
            y: slot.y as f64,
            width: slot.width as f64,
            height: slot.height as f64,
            rotation: slot.rotation as f64,
        }
    }
}

/// Uniform scale plus the offset that centers the stage in the viewport.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageTransform {
    pub scale: f64,
    pub offset_x: f64,
    pub offset_y: f64,
}

impl StageTransform {
    fn centered(scale: f64, viewport_w: f64, viewport_h: f64, template: &Template) -> Self {
        let scale = scale.max(0.0);
        Self {
            scale,
            offset_x: (viewport_w - template.width as f64 * scale) / 2.0,
            offset_y: (viewport_h - template.height as f64 * scale) / 2.0,
        }
    }

    pub fn to_viewport(&self, rect: SlotRect) -> SlotRect {
        SlotRect {
            x: self.offset_x + rect.x * self.scale,
            y: self.offset_y + rect.y * self.scale,
            width: rect.width * self.scale,
            height: rect.height * self.scale,
            rotation: rect.rotation,
        }
    }

    pub fn to_template(&self, vx: f64, vy: f64) -> (f64, f64) {
        if self.scale == 0.0 {
            return (0.0, 0.0);
        }
        ((vx - self.offset_x) / self.scale, (vy - self.offset_y) / self.scale)
    }
}

/// Capture stage: `min(vh * margin / h, vw * margin / w)`.
pub fn fit_capture_stage(viewport_w: f64, viewport_h: f64, template: &Template, margin: f64) -> StageTransform {
    if template.width == 0 || template.height == 0 {
        return StageTransform { scale: 0.0, offset_x: 0.0, offset_y: 0.0 };
    }
    let scale_h = viewport_h * margin / template.height as f64;
    let scale_w = viewport_w * margin / template.width as f64;
    StageTransform::centered(scale_h.min(scale_w), viewport_w, viewport_h, template)
}

/// Print preview fit; display only, the print itself stays native size.
pub fn fit_print_preview(viewport_w: f64, viewport_h: f64, template: &Template) -> StageTransform {
    if template.width == 0 || template.height == 0 {
        return StageTransform { scale: 0.0, offset_x: 0.0, offset_y: 0.0 };
    }
    let scale_h = (viewport_h - PREVIEW_CHROME_HEIGHT) / template.height as f64;
    let scale_w = (viewport_w - PREVIEW_CHROME_WIDTH) / template.width as f64;
    StageTransform::centered(scale_h.min(scale_w), viewport_w, viewport_h, template)
}
