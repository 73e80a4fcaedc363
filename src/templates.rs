//! Template System - the shared coordinate contract
//!
//! Every slot is expressed in the template's own pixel space: origin top-left,
//! x right, y down, `THERMAL_WIDTH` pixels wide. Viewport zoom never leaks in.

use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::validation::Validator;
use crate::{SCHEMA_VERSION, THERMAL_WIDTH};

pub type TemplateId = String;
pub type SlotId = String;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LayoutError {
    #[error("Invalid layout: {0}")]
    InvalidLayout(String),

    #[error("Invalid background data: {0}")]
    InvalidBackground(String),
}

/// A saved print layout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    /// Empty until the store assigns one.
    #[serde(default)]
    pub id: TemplateId,
    pub name: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    #[serde(default = "default_width")]
    pub width: u32,
    pub height: u32,
    #[serde(rename = "backgroundUrl", with = "background_wire")]
    pub background: BackgroundImage,
    #[serde(default)]
    pub slots: Vec<PhotoSlot>,
}

fn default_schema_version() -> String { SCHEMA_VERSION.to_string() }
fn default_width() -> u32 { THERMAL_WIDTH }

impl Template {
    pub fn is_persisted(&self) -> bool {
        !self.id.trim().is_empty()
    }

    pub fn is_capture_ready(&self) -> bool {
        validate_template(self).is_ok()
    }

    /// Slots in the order a capture session walks them.
    pub fn slots_in_capture_order(&self) -> Vec<&PhotoSlot> {
        let mut ordered: Vec<&PhotoSlot> = self.slots.iter().collect();
        ordered.sort_by_key(|s| s.sequence);
        ordered
    }

    pub fn slot(&self, id: &str) -> Option<&PhotoSlot> {
        self.slots.iter().find(|s| s.id == id)
    }
}

/// One capture rectangle, in template pixels.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PhotoSlot {
    #[serde(default = "new_slot_id")]
    pub id: SlotId,
    pub sequence: u32,
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    /// Degrees clockwise about the rectangle's own center.
    #[serde(default)]
    pub rotation: i32,
}

pub fn new_slot_id() -> SlotId {
    Uuid::new_v4().to_string()
}

impl PhotoSlot {
    pub fn center(&self) -> (f64, f64) {
        (
            self.x as f64 + self.width as f64 / 2.0,
            self.y as f64 + self.height as f64 / 2.0,
        )
    }

    /// Axis-aligned bounds of the rotated rectangle as `(min_x, min_y, max_x, max_y)`.
    pub fn rotated_bounds(&self) -> (f64, f64, f64, f64) {
        let (cx, cy) = self.center();
        let (hw, hh) = (self.width as f64 / 2.0, self.height as f64 / 2.0);
        let theta = (self.rotation as f64).to_radians();
        let (sin, cos) = theta.sin_cos();
        let ex = (hw * cos).abs() + (hh * sin).abs();
        let ey = (hw * sin).abs() + (hh * cos).abs();
        (cx - ex, cy - ey, cx + ex, cy + ey)
    }
}

/// Background of a template: raw bytes before upload, a stable reference after.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackgroundImage {
    Embedded { mime: String, data: Vec<u8> },
    Url(String),
}

impl BackgroundImage {
    pub fn embedded(data: Vec<u8>) -> Self {
        let mime = image::guess_format(&data)
            .map(|f| f.to_mime_type().to_string())
            .unwrap_or_else(|_| "image/jpeg".to_string());
        Self::Embedded { mime, data }
    }

    pub fn is_embedded(&self) -> bool {
        matches!(self, Self::Embedded { .. })
    }

    pub fn from_data_url(value: &str) -> Result<Self, LayoutError> {
        let rest = value
            .strip_prefix("data:")
            .ok_or_else(|| LayoutError::InvalidBackground("missing data: prefix".into()))?;
        let (header, payload) = rest
            .split_once(',')
            .ok_or_else(|| LayoutError::InvalidBackground("missing payload separator".into()))?;
        let mime = header
            .strip_suffix(";base64")
            .ok_or_else(|| LayoutError::InvalidBackground("only base64 data URLs are supported".into()))?;
        let data = base64::engine::general_purpose::STANDARD
            .decode(payload.trim())
            .map_err(|e| LayoutError::InvalidBackground(e.to_string()))?;
        Ok(Self::Embedded {
            mime: if mime.is_empty() { "image/jpeg".to_string() } else { mime.to_string() },
            data,
        })
    }

    /// Wire form: a data URL for embedded bytes, the reference otherwise.
    pub fn to_wire(&self) -> String {
        match self {
            Self::Embedded { mime, data } => format!(
                "data:{};base64,{}",
                mime,
                base64::engine::general_purpose::STANDARD.encode(data)
            ),
            Self::Url(url) => url.clone(),
        }
    }

    pub fn from_wire(value: &str) -> Result<Self, LayoutError> {
        if value.starts_with("data:") {
            Self::from_data_url(value)
        } else {
            Ok(Self::Url(value.to_string()))
        }
    }
}

mod background_wire {
    use super::BackgroundImage;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bg: &BackgroundImage, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&bg.to_wire())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<BackgroundImage, D::Error> {
        let raw = String::deserialize(d)?;
        BackgroundImage::from_wire(&raw).map_err(serde::de::Error::custom)
    }
}

/// Reject layouts a capture session cannot run.
pub fn validate_template(template: &Template) -> Result<(), LayoutError> {
    let result = Validator::new().validate(template);
    if result.valid {
        return Ok(());
    }
    let messages: Vec<_> = result
        .violations
        .iter()
        .filter(|v| v.is_blocking())
        .map(|v| format!("{}: {}", v.rule, v.message))
        .collect();
    Err(LayoutError::InvalidLayout(messages.join("; ")))
}

/// Capture order is top edge first; sequence is rewritten as 1..N.
pub fn normalize_order(slots: &[PhotoSlot]) -> Vec<PhotoSlot> {
    let mut sorted = slots.to_vec();
    sorted.sort_by_key(|s| s.y);
    for (index, slot) in sorted.iter_mut().enumerate() {
        slot.sequence = index as u32 + 1;
    }
    sorted
}
