//! Compositing renderer
//!
//! `render` describes what goes where; `rasterize` turns a description into
//! pixels at the template's native size. Neither holds any state.

use image::imageops::{self, FilterType};
use image::{DynamicImage, Pixel, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::PhotoSet;
use crate::templates::{PhotoSlot, SlotId, Template};
use crate::validation::slot_within_size_limit;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Could not decode photo for slot {slot_id}: {source}")]
    PhotoDecode {
        slot_id: SlotId,
        #[source]
        source: image::ImageError,
    },

    #[error("Composite has no size ({0}x{1})")]
    EmptyCanvas(u32, u32),

    #[error("Slot {slot_id} is too large to draw ({width}x{height})")]
    SlotTooLarge { slot_id: SlotId, width: u32, height: u32 },
}

/// Fixed print look: brighten, add contrast, drop colour.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhotoTreatment {
    pub brightness: f32,
    pub contrast: f32,
    pub grayscale: bool,
}

pub const PRINT_TREATMENT: PhotoTreatment = PhotoTreatment {
    brightness: 1.1,
    contrast: 1.25,
    grayscale: true,
};

impl PhotoTreatment {
    /// Brightness, then contrast, then grayscale, clamping after each step.
    pub fn apply(&self, px: Rgba<u8>) -> Rgba<u8> {
        let mut c = [0f32; 3];
        for (i, ch) in c.iter_mut().enumerate() {
            let v = px[i] as f32 / 255.0;
            let v = (v * self.brightness).clamp(0.0, 1.0);
            *ch = ((v - 0.5) * self.contrast + 0.5).clamp(0.0, 1.0);
        }
        if self.grayscale {
            let luma = 0.2126 * c[0] + 0.7152 * c[1] + 0.0722 * c[2];
            c = [luma; 3];
        }
        let to_u8 = |v: f32| (v * 255.0).round().clamp(0.0, 255.0) as u8;
        Rgba([to_u8(c[0]), to_u8(c[1]), to_u8(c[2]), px[3]])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Placeholder {
    /// The slot being captured right now; the live camera shows through.
    Active { countdown: Option<u8> },
    /// A slot whose turn has not come yet.
    Ghost { number: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotPlacement {
    pub slot_id: SlotId,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub rotation: i32,
}

impl From<&PhotoSlot> for SlotPlacement {
    fn from(slot: &PhotoSlot) -> Self {
        Self {
            slot_id: slot.id.clone(),
            x: slot.x,
            y: slot.y,
            width: slot.width.max(0) as u32,
            height: slot.height.max(0) as u32,
            rotation: slot.rotation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "layer", rename_all = "snake_case")]
pub enum Layer {
    Background { width: u32, height: u32 },
    Photo { placement: SlotPlacement, treatment: PhotoTreatment },
    Placeholder { placement: SlotPlacement, placeholder: Placeholder },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeDescription {
    pub width: u32,
    pub height: u32,
    /// Back to front.
    pub layers: Vec<Layer>,
}

impl CompositeDescription {
    pub fn photo_layers(&self) -> impl Iterator<Item = &SlotPlacement> {
        self.layers.iter().filter_map(|l| match l {
            Layer::Photo { placement, .. } => Some(placement),
            _ => None,
        })
    }
}

/// Final composite: background, then every slot that has a photo.
pub fn render(template: &Template, photos: &PhotoSet) -> CompositeDescription {
    let mut layers = vec![Layer::Background {
        width: template.width,
        height: template.height,
    }];
    layers.extend(
        template
            .slots_in_capture_order()
            .into_iter()
            .filter(|slot| photos.contains_key(&slot.id))
            .map(|slot| Layer::Photo {
                placement: SlotPlacement::from(slot),
                treatment: PRINT_TREATMENT,
            }),
    );
    CompositeDescription {
        width: template.width,
        height: template.height,
        layers,
    }
}

/// Live capture overlay: photos where taken, placeholders everywhere else.
pub fn render_preview(
    template: &Template,
    photos: &PhotoSet,
    active_index: Option<usize>,
    countdown: Option<u8>,
) -> CompositeDescription {
    let mut description = render(template, photos);
    for (index, slot) in template.slots_in_capture_order().into_iter().enumerate() {
        if photos.contains_key(&slot.id) {
            continue;
        }
        let placeholder = if Some(index) == active_index {
            Placeholder::Active { countdown: countdown.filter(|n| *n > 0) }
        } else {
            Placeholder::Ghost { number: index + 1 }
        };
        description.layers.push(Layer::Placeholder {
            placement: SlotPlacement::from(slot),
            placeholder,
        });
    }
    description
}

/// Draw a description at native size.
pub fn rasterize(
    description: &CompositeDescription,
    background: &DynamicImage,
    photos: &PhotoSet,
) -> Result<RgbaImage, RenderError> {
    let (w, h) = (description.width, description.height);
    if w == 0 || h == 0 {
        return Err(RenderError::EmptyCanvas(w, h));
    }
    let mut canvas = RgbaImage::from_pixel(w, h, Rgba([255, 255, 255, 255]));

    for layer in &description.layers {
        match layer {
            Layer::Background { .. } => {
                let bg = if background.width() == w && background.height() == h {
                    background.to_rgba8()
                } else {
                    log::debug!(
                        "fitting {}x{} background to {}x{}",
                        background.width(),
                        background.height(),
                        w,
                        h
                    );
                    imageops::resize(&background.to_rgba8(), w, h, FilterType::Triangle)
                };
                for (dst, src) in canvas.pixels_mut().zip(bg.pixels()) {
                    composite(dst, *src);
                }
            }
            Layer::Photo { placement, treatment } => {
                let Some(data) = photos.get(&placement.slot_id) else {
                    log::warn!("no photo for slot {}, skipping", placement.slot_id);
                    continue;
                };
                if !drawable(placement, w, h)? {
                    continue;
                }
                let decoded = image::load_from_memory(data.as_bytes()).map_err(|source| {
                    RenderError::PhotoDecode {
                        slot_id: placement.slot_id.clone(),
                        source,
                    }
                })?;
                let mut fitted = cover_fit(&decoded, placement.width, placement.height);
                for px in fitted.pixels_mut() {
                    *px = treatment.apply(*px);
                }
                blit(&mut canvas, &fitted, placement);
            }
            Layer::Placeholder { placement, placeholder } => {
                if !drawable(placement, w, h)? {
                    continue;
                }
                blit(&mut canvas, &placeholder_tile(placement, *placeholder), placement);
            }
        }
    }
    Ok(canvas)
}

/// Whether a slot touches the canvas at all. Tiles are allocated at slot
/// size, so slots beyond the size limit are refused before any work.
fn drawable(placement: &SlotPlacement, canvas_w: u32, canvas_h: u32) -> Result<bool, RenderError> {
    if placement.width == 0 || placement.height == 0 {
        return Ok(false);
    }
    if !slot_within_size_limit(placement.width as i64, placement.height as i64, canvas_w, canvas_h) {
        return Err(RenderError::SlotTooLarge {
            slot_id: placement.slot_id.clone(),
            width: placement.width,
            height: placement.height,
        });
    }
    let (min_x, min_y, max_x, max_y) = rotated_extent(placement);
    let visible = max_x > 0.0 && max_y > 0.0 && min_x < canvas_w as f64 && min_y < canvas_h as f64;
    if !visible {
        log::debug!("slot {} is off the canvas, skipping", placement.slot_id);
    }
    Ok(visible)
}

fn rotated_extent(placement: &SlotPlacement) -> (f64, f64, f64, f64) {
    let (w, h) = (placement.width as f64, placement.height as f64);
    let cx = placement.x as f64 + w / 2.0;
    let cy = placement.y as f64 + h / 2.0;
    let (sin, cos) = (placement.rotation as f64).to_radians().sin_cos();
    let ex = (w / 2.0 * cos).abs() + (h / 2.0 * sin).abs();
    let ey = (w / 2.0 * sin).abs() + (h / 2.0 * cos).abs();
    (cx - ex, cy - ey, cx + ex, cy + ey)
}

/// Center-crop to the target aspect ratio, then resize to exactly `w x h`.
fn cover_fit(img: &DynamicImage, w: u32, h: u32) -> RgbaImage {
    let (sw, sh) = (img.width() as f64, img.height() as f64);
    let scale = (w as f64 / sw).max(h as f64 / sh);
    let crop_w = ((w as f64 / scale).round() as u32).clamp(1, img.width());
    let crop_h = ((h as f64 / scale).round() as u32).clamp(1, img.height());
    let cx = (img.width() - crop_w) / 2;
    let cy = (img.height() - crop_h) / 2;
    let cropped = img.crop_imm(cx, cy, crop_w, crop_h);
    imageops::resize(&cropped.to_rgba8(), w, h, FilterType::Lanczos3)
}

fn placeholder_tile(placement: &SlotPlacement, placeholder: Placeholder) -> RgbaImage {
    let (w, h) = (placement.width, placement.height);
    match placeholder {
        Placeholder::Ghost { .. } => RgbaImage::from_pixel(w, h, Rgba([0, 0, 0, 102])),
        Placeholder::Active { .. } => {
            let border = 4.min(w / 2).min(h / 2).max(1);
            RgbaImage::from_fn(w, h, |x, y| {
                if x < border || y < border || x >= w - border || y >= h - border {
                    Rgba([239, 68, 68, 255])
                } else {
                    Rgba([0, 0, 0, 0])
                }
            })
        }
    }
}

fn composite(dst: &mut Rgba<u8>, src: Rgba<u8>) {
    match src[3] {
        0 => {}
        255 => *dst = src,
        _ => dst.blend(&src),
    }
}

/// Place `tile` at the slot, rotated clockwise about the slot center.
///
/// Canvas pixels are inverse-mapped into the tile and sampled at their
/// centers, so a zero rotation copies the tile 1:1 onto `(x, y)`.
fn blit(canvas: &mut RgbaImage, tile: &RgbaImage, placement: &SlotPlacement) {
    let (w, h) = (tile.width() as f64, tile.height() as f64);
    let cx = placement.x as f64 + w / 2.0;
    let cy = placement.y as f64 + h / 2.0;
    let (sin, cos) = (placement.rotation as f64).to_radians().sin_cos();

    // clipped to the canvas before the cast
    let (min_x, min_y, max_x, max_y) = rotated_extent(placement);
    let (cw, ch) = (canvas.width() as f64, canvas.height() as f64);
    let x0 = min_x.floor().clamp(0.0, cw) as u32;
    let y0 = min_y.floor().clamp(0.0, ch) as u32;
    let x1 = max_x.ceil().clamp(0.0, cw) as u32;
    let y1 = max_y.ceil().clamp(0.0, ch) as u32;

    for py in y0..y1 {
        for px in x0..x1 {
            let dx = px as f64 + 0.5 - cx;
            let dy = py as f64 + 0.5 - cy;
            // inverse of a clockwise rotation in y-down space
            let lx = dx * cos + dy * sin + w / 2.0;
            let ly = -dx * sin + dy * cos + h / 2.0;
            if lx < 0.0 || ly < 0.0 || lx >= w || ly >= h {
                continue;
            }
            composite(canvas.get_pixel_mut(px, py), *tile.get_pixel(lx as u32, ly as u32));
        }
    }
}
