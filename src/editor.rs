//! Layout Editor - slot authoring over a background image
//!
//! Slots live in an indexed store (id -> geometry record) that knows nothing
//! about how they are drawn. All geometry is kept in template space; zoom is
//! applied only when converting pointer deltas coming from the screen.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;

use crate::templates::{
    new_slot_id, normalize_order, validate_template, BackgroundImage, LayoutError, PhotoSlot, SlotId,
    Template, TemplateId,
};
use crate::thermal::{self, ThermalError};
use crate::{SCHEMA_VERSION, THERMAL_WIDTH};

pub const DEFAULT_TEMPLATE_NAME: &str = "Untitled Template";
/// Canvas height used until a background (or stored height) is known.
pub const FALLBACK_CANVAS_HEIGHT: u32 = 800;
pub const SNAP_TOLERANCE: f64 = 10.0;
pub const MIN_ZOOM: f64 = 0.5;
pub const MAX_ZOOM: f64 = 2.0;

const DEFAULT_SLOT: SlotShape = SlotShape {
    x: 100.0,
    y: 100.0,
    width: 200.0,
    height: 150.0,
    scale_x: 1.0,
    scale_y: 1.0,
    rotation: 0.0,
};

#[derive(Debug, Error)]
pub enum EditorError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Slot not found: {0}")]
    SlotNotFound(SlotId),

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error("Background could not be read: {0}")]
    Background(#[from] ThermalError),
}

/// Geometry record for one slot while it is being edited.
///
/// `width`/`height` are the unscaled box; resize handles change the scale
/// factors. Persisted sizes are always `width * scale_x` by
/// `height * scale_y`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlotShape {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub scale_x: f64,
    pub scale_y: f64,
    pub rotation: f64,
}

impl SlotShape {
    pub fn scaled_width(&self) -> f64 {
        self.width * self.scale_x
    }

    pub fn scaled_height(&self) -> f64 {
        self.height * self.scale_y
    }

    pub fn center_x(&self) -> f64 {
        self.x + self.scaled_width() / 2.0
    }
}

impl From<&PhotoSlot> for SlotShape {
    fn from(slot: &PhotoSlot) -> Self {
        Self {
            x: slot.x as f64,
            y: slot.y as f64,
            width: slot.width as f64,
            height: slot.height as f64,
            scale_x: 1.0,
            scale_y: 1.0,
            rotation: slot.rotation as f64,
        }
    }
}

/// Slots by id, plus stacking order (last drawn on top).
#[derive(Debug, Clone, Default)]
pub struct SlotStore {
    shapes: HashMap<SlotId, SlotShape>,
    stacking: Vec<SlotId>,
}

impl SlotStore {
    pub fn insert(&mut self, id: SlotId, shape: SlotShape) {
        if self.shapes.insert(id.clone(), shape).is_none() {
            self.stacking.push(id);
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<SlotShape> {
        let removed = self.shapes.remove(id)?;
        self.stacking.retain(|s| s != id);
        Some(removed)
    }

    pub fn get(&self, id: &str) -> Option<&SlotShape> {
        self.shapes.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut SlotShape> {
        self.shapes.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.stacking.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stacking.is_empty()
    }

    /// `(id, shape)` in stacking order.
    pub fn iter(&self) -> impl Iterator<Item = (&SlotId, &SlotShape)> {
        self.stacking.iter().filter_map(move |id| self.shapes.get(id).map(|s| (id, s)))
    }
}

/// One open editing surface for one template.
#[derive(Debug)]
pub struct LayoutEditor {
    template_id: TemplateId,
    name: String,
    created_at: DateTime<Utc>,
    background: BackgroundImage,
    stored_height: Option<u32>,
    canvas_height: Option<u32>,
    slots: SlotStore,
    active: Option<SlotId>,
    zoom: f64,
}

impl LayoutEditor {
    /// Start a fresh layout over a background.
    pub fn new(background: BackgroundImage) -> Self {
        Self {
            template_id: String::new(),
            name: DEFAULT_TEMPLATE_NAME.to_string(),
            created_at: Utc::now(),
            background,
            stored_height: None,
            canvas_height: None,
            slots: SlotStore::default(),
            active: None,
            zoom: 1.0,
        }
    }

    /// Rehydrate a saved template; slot ids and geometry carry over as-is.
    pub fn open(template: &Template) -> Self {
        let mut slots = SlotStore::default();
        for slot in &template.slots {
            slots.insert(slot.id.clone(), SlotShape::from(slot));
        }
        log::info!(
            "opened '{}' ({} slots) for editing",
            template.name,
            template.slots.len()
        );
        Self {
            template_id: template.id.clone(),
            name: if template.name.trim().is_empty() {
                DEFAULT_TEMPLATE_NAME.to_string()
            } else {
                template.name.clone()
            },
            created_at: template.created_at,
            background: template.background.clone(),
            stored_height: (template.height > 0).then_some(template.height),
            canvas_height: None,
            slots,
            active: None,
            zoom: 1.0,
        }
    }

    /// Establish the working coordinate space from the background's natural height.
    pub fn load_background(&mut self, image_data: &[u8]) -> Result<u32, EditorError> {
        let (width, height) = thermal::image_dimensions(image_data)?;
        if width != THERMAL_WIDTH {
            log::warn!(
                "background is {} px wide, expected {}; slots stay in a {} px space",
                width,
                THERMAL_WIDTH,
                THERMAL_WIDTH
            );
        }
        self.canvas_height = Some(height);
        log::debug!("canvas set to {}x{}", THERMAL_WIDTH, height);
        Ok(height)
    }

    /// Load the embedded background, if the template carries one.
    pub fn load_embedded_background(&mut self) -> Result<Option<u32>, EditorError> {
        let data = match &self.background {
            BackgroundImage::Embedded { data, .. } => data.clone(),
            BackgroundImage::Url(_) => return Ok(None),
        };
        self.load_background(&data).map(Some)
    }

    pub fn canvas_width(&self) -> u32 {
        THERMAL_WIDTH
    }

    /// Live canvas height; stored height or a fallback until an image loads.
    pub fn canvas_height(&self) -> u32 {
        self.canvas_height
            .or(self.stored_height)
            .unwrap_or(FALLBACK_CANVAS_HEIGHT)
    }

    pub fn set_canvas_height(&mut self, height: u32) {
        self.canvas_height = Some(height);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn background(&self) -> &BackgroundImage {
        &self.background
    }

    pub fn set_background(&mut self, background: BackgroundImage) {
        self.background = background;
        self.canvas_height = None;
    }

    pub fn zoom(&self) -> f64 {
        self.zoom
    }

    /// Presentation only; stored geometry never sees it.
    pub fn set_zoom(&mut self, zoom: f64) -> f64 {
        self.zoom = if zoom.is_finite() { zoom.clamp(MIN_ZOOM, MAX_ZOOM) } else { 1.0 };
        self.zoom
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, id: &str) -> Option<&SlotShape> {
        self.slots.get(id)
    }

    pub fn slots(&self) -> impl Iterator<Item = (&SlotId, &SlotShape)> {
        self.slots.iter()
    }

    pub fn active_slot(&self) -> Option<&SlotId> {
        self.active.as_ref()
    }

    pub fn select(&mut self, id: &str) -> Result<(), EditorError> {
        if self.slots.get(id).is_none() {
            return Err(EditorError::SlotNotFound(id.to_string()));
        }
        self.active = Some(id.to_string());
        Ok(())
    }

    pub fn clear_selection(&mut self) {
        self.active = None;
    }

    /// New slot at the default rectangle; it becomes the selection.
    pub fn add_slot(&mut self) -> SlotId {
        let id = new_slot_id();
        self.slots.insert(id.clone(), DEFAULT_SLOT);
        self.active = Some(id.clone());
        log::debug!("added slot {}", id);
        id
    }

    /// Replace a slot's geometry; sizes are taken as final (scale resets to 1).
    pub fn move_or_resize_slot(
        &mut self,
        id: &str,
        x: f64,
        y: f64,
        width: f64,
        height: f64,
        rotation: f64,
    ) -> Result<(), EditorError> {
        require_finite(&[x, y, width, height, rotation])?;
        let shape = self.shape_mut(id)?;
        *shape = SlotShape {
            x,
            y,
            width,
            height,
            scale_x: 1.0,
            scale_y: 1.0,
            rotation,
        };
        Ok(())
    }

    /// Resize-handle drag: multiply the current scale factors.
    pub fn scale_slot(&mut self, id: &str, factor_x: f64, factor_y: f64) -> Result<(), EditorError> {
        require_finite(&[factor_x, factor_y])?;
        let shape = self.shape_mut(id)?;
        shape.scale_x *= factor_x;
        shape.scale_y *= factor_y;
        Ok(())
    }

    pub fn rotate_slot(&mut self, id: &str, degrees: f64) -> Result<(), EditorError> {
        require_finite(&[degrees])?;
        self.shape_mut(id)?.rotation = degrees;
        Ok(())
    }

    /// Interactive drag by an on-screen delta, with center snapping.
    pub fn drag_slot(&mut self, id: &str, screen_dx: f64, screen_dy: f64) -> Result<(), EditorError> {
        require_finite(&[screen_dx, screen_dy])?;
        let zoom = self.zoom;
        let shape = self.shape_mut(id)?;
        shape.x += screen_dx / zoom;
        shape.y += screen_dy / zoom;
        self.snap_to_center(id);
        Ok(())
    }

    /// Clamp the slot onto the canvas center line when it is within tolerance.
    pub fn snap_to_center(&mut self, id: &str) -> bool {
        let center = self.canvas_width() as f64 / 2.0;
        let Some(shape) = self.slots.get_mut(id) else {
            return false;
        };
        if (shape.center_x() - center).abs() < SNAP_TOLERANCE {
            shape.x = center - shape.scaled_width() / 2.0;
            true
        } else {
            false
        }
    }

    /// Remove a slot; `false` when there is nothing to remove.
    pub fn delete_slot(&mut self, id: &str) -> bool {
        if self.slots.remove(id).is_none() {
            return false;
        }
        if self.active.as_deref() == Some(id) {
            self.active = None;
        }
        log::debug!("deleted slot {}", id);
        true
    }

    pub fn delete_selected(&mut self) -> bool {
        match self.active.clone() {
            Some(id) => self.delete_slot(&id),
            None => false,
        }
    }

    /// Derive the canonical template: ordered by top edge, integer pixels.
    pub fn save(&self) -> Result<Template, EditorError> {
        if self.slots.is_empty() {
            log::warn!("save refused for '{}': no slots", self.name);
            return Err(EditorError::Validation("Please add at least 1 photo slot".to_string()));
        }
        if self.name.trim().is_empty() {
            return Err(EditorError::Validation("Template name is required".to_string()));
        }

        let slots = self
            .slots
            .iter()
            .map(|(id, shape)| {
                Ok(PhotoSlot {
                    id: id.clone(),
                    sequence: 0,
                    x: to_pixel(shape.x, "x")?,
                    y: to_pixel(shape.y, "y")?,
                    width: to_pixel(shape.scaled_width(), "width")?,
                    height: to_pixel(shape.scaled_height(), "height")?,
                    rotation: to_pixel(shape.rotation, "rotation")?,
                })
            })
            .collect::<Result<Vec<PhotoSlot>, EditorError>>()?;

        let template = Template {
            id: self.template_id.clone(),
            name: self.name.trim().to_string(),
            created_at: self.created_at,
            schema_version: SCHEMA_VERSION.to_string(),
            width: THERMAL_WIDTH,
            height: self.canvas_height(),
            background: self.background.clone(),
            slots: normalize_order(&slots),
        };
        validate_template(&template)?;
        Ok(template)
    }

    /// Explicit teardown of the editing surface.
    pub fn close(self) {
        log::info!("closed editor for '{}'", self.name);
    }

    fn shape_mut(&mut self, id: &str) -> Result<&mut SlotShape, EditorError> {
        self.slots
            .get_mut(id)
            .ok_or_else(|| EditorError::SlotNotFound(id.to_string()))
    }
}

fn require_finite(values: &[f64]) -> Result<(), EditorError> {
    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(EditorError::Validation("Slot geometry must be a finite number".to_string()))
    }
}

/// Round to a whole template pixel; out-of-range values are refused, not clamped.
fn to_pixel(value: f64, field: &str) -> Result<i32, EditorError> {
    let rounded = value.round();
    if !rounded.is_finite() || rounded < i32::MIN as f64 || rounded > i32::MAX as f64 {
        return Err(EditorError::Validation(format!("Slot {} out of range: {}", field, value)));
    }
    Ok(rounded as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([240, 240, 240]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn editor() -> LayoutEditor {
        LayoutEditor::new(BackgroundImage::Url("backgrounds/bg.jpg".into()))
    }

    #[test]
    fn test_add_slot_uses_default_rect_and_selects_it() {
        let mut ed = editor();
        let id = ed.add_slot();
        assert_eq!(ed.active_slot(), Some(&id));
        let shape = ed.slot(&id).unwrap();
        assert_eq!((shape.x, shape.y, shape.width, shape.height), (100.0, 100.0, 200.0, 150.0));
        assert_ne!(ed.add_slot(), id);
    }

    #[test]
    fn test_save_reads_back_scaled_size() {
        let mut ed = editor();
        let id = ed.add_slot();
        ed.scale_slot(&id, 1.5, 0.5).unwrap();
        let t = ed.save().unwrap();
        assert_eq!((t.slots[0].width, t.slots[0].height), (300, 75));
    }

    #[test]
    fn test_load_background_sets_canvas_height() {
        let mut ed = editor();
        assert_eq!(ed.canvas_height(), FALLBACK_CANVAS_HEIGHT);
        assert_eq!(ed.load_background(&png(576, 1024)).unwrap(), 1024);
        assert_eq!(ed.canvas_height(), 1024);
        assert!(ed.load_background(b"not an image").is_err());
        assert_eq!(ed.canvas_height(), 1024);
    }

    #[test]
    fn test_open_falls_back_to_stored_height() {
        let mut ed = editor();
        ed.add_slot();
        ed.set_canvas_height(640);
        let saved = ed.save().unwrap();
        let reopened = LayoutEditor::open(&saved);
        assert_eq!(reopened.canvas_height(), 640);
    }

    #[test]
    fn test_embedded_background_loads() {
        let mut ed = LayoutEditor::new(BackgroundImage::embedded(png(576, 300)));
        assert_eq!(ed.load_embedded_background().unwrap(), Some(300));
        assert_eq!(editor().load_embedded_background().unwrap(), None);
    }

    #[test]
    fn test_drag_snaps_to_center_within_tolerance() {
        let mut ed = editor();
        let id = ed.add_slot();
        // default center is 200; canvas center is 288
        ed.drag_slot(&id, 80.0, 0.0).unwrap();
        assert_eq!(ed.slot(&id).unwrap().x, 188.0);

        ed.drag_slot(&id, 30.0, 0.0).unwrap();
        assert_eq!(ed.slot(&id).unwrap().x, 218.0);
    }

    #[test]
    fn test_programmatic_move_does_not_snap() {
        let mut ed = editor();
        let id = ed.add_slot();
        ed.move_or_resize_slot(&id, 185.0, 10.0, 200.0, 150.0, 0.0).unwrap();
        assert_eq!(ed.slot(&id).unwrap().x, 185.0);
    }

    #[test]
    fn test_snap_uses_scaled_width() {
        let mut ed = editor();
        let id = ed.add_slot();
        ed.move_or_resize_slot(&id, 0.0, 0.0, 100.0, 100.0, 0.0).unwrap();
        ed.scale_slot(&id, 2.0, 1.0).unwrap();
        // scaled center lands at 285; the unscaled box would sit at 235
        ed.drag_slot(&id, 185.0, 0.0).unwrap();
        assert_eq!(ed.slot(&id).unwrap().x, 188.0);
    }

    #[test]
    fn test_delete_is_noop_for_unknown_slot() {
        let mut ed = editor();
        let id = ed.add_slot();
        assert!(!ed.delete_slot("missing"));
        assert!(ed.delete_selected());
        assert!(ed.active_slot().is_none());
        assert!(ed.slot(&id).is_none());
        assert!(!ed.delete_selected());
    }

    #[test]
    fn test_zoom_is_clamped() {
        let mut ed = editor();
        assert_eq!(ed.set_zoom(5.0), MAX_ZOOM);
        assert_eq!(ed.set_zoom(0.1), MIN_ZOOM);
        assert_eq!(ed.set_zoom(f64::NAN), 1.0);
    }

    #[test]
    fn test_save_rejects_missing_slot_and_name() {
        let mut ed = editor();
        assert!(matches!(ed.save(), Err(EditorError::Validation(_))));
        ed.add_slot();
        ed.rename("   ");
        assert!(matches!(ed.save(), Err(EditorError::Validation(_))));
    }

    #[test]
    fn test_save_rejects_collapsed_slot() {
        let mut ed = editor();
        let id = ed.add_slot();
        ed.move_or_resize_slot(&id, 0.0, 0.0, 0.2, 50.0, 0.0).unwrap();
        assert!(matches!(ed.save(), Err(EditorError::Layout(LayoutError::InvalidLayout(_)))));
    }

    #[test]
    fn test_unknown_slot_operations_fail() {
        let mut ed = editor();
        assert!(matches!(ed.scale_slot("nope", 1.0, 1.0), Err(EditorError::SlotNotFound(_))));
        assert!(ed.select("nope").is_err());
        assert!(!ed.snap_to_center("nope"));
    }

    #[test]
    fn test_non_finite_geometry_is_refused() {
        let mut ed = editor();
        let id = ed.add_slot();
        let err = ed.move_or_resize_slot(&id, f64::INFINITY, f64::NAN, 1e12, 50.0, 0.0);
        assert!(matches!(err, Err(EditorError::Validation(_))));
        assert!(ed.scale_slot(&id, f64::NAN, 1.0).is_err());
        assert!(ed.rotate_slot(&id, f64::NEG_INFINITY).is_err());
        assert!(ed.drag_slot(&id, f64::INFINITY, 0.0).is_err());
        // untouched default rect
        let shape = ed.slot(&id).unwrap();
        assert_eq!((shape.x, shape.y, shape.width, shape.height), (100.0, 100.0, 200.0, 150.0));
        assert!(ed.save().is_ok());
    }

    #[test]
    fn test_save_refuses_values_beyond_pixel_range() {
        let mut ed = editor();
        let id = ed.add_slot();
        ed.move_or_resize_slot(&id, 1e12, 10.0, 200.0, 50.0, 0.0).unwrap();
        assert!(matches!(ed.save(), Err(EditorError::Validation(_))));

        ed.move_or_resize_slot(&id, 10.0, 10.0, 200.0, 50.0, 0.0).unwrap();
        ed.scale_slot(&id, 1e12, 1.0).unwrap();
        match ed.save() {
            Err(EditorError::Validation(msg)) => assert!(msg.contains("width")),
            other => panic!("expected a range error, got {:?}", other),
        }
    }
}
