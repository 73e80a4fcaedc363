//! Hashing System - SHA-256 for backgrounds and layouts
//!
//! Backgrounds are stored content-addressed; layouts get a geometry
//! fingerprint that ignores ids, names and timestamps.

use serde::Serialize;
use serde_json::{to_string, Value};
use sha2::{Digest, Sha256};

use crate::templates::Template;

/// Compute SHA-256 hash of bytes, return hex string
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Convert to canonical JSON (sorted keys, no whitespace)
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let v: Value = serde_json::to_value(value)?;
    to_string(&sort_value(&v))
}

fn sort_value(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut sorted: Vec<_> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                sorted
                    .into_iter()
                    .map(|(k, v)| (k.clone(), sort_value(v)))
                    .collect(),
            )
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_value).collect()),
        _ => v.clone(),
    }
}

/// Stable storage key for background bytes.
pub fn background_key(data: &[u8]) -> String {
    sha256_hex(data)
}

#[derive(Serialize)]
struct SlotGeometry {
    sequence: u32,
    x: i32,
    y: i32,
    width: i32,
    height: i32,
    rotation: i32,
}

/// Hash of everything that affects where pixels land on the print.
pub fn layout_fingerprint(template: &Template) -> Result<String, serde_json::Error> {
    let mut slots: Vec<_> = template
        .slots
        .iter()
        .map(|s| SlotGeometry {
            sequence: s.sequence,
            x: s.x,
            y: s.y,
            width: s.width,
            height: s.height,
            rotation: s.rotation,
        })
        .collect();
    slots.sort_by_key(|s| (s.sequence, s.y, s.x));
    let payload = serde_json::json!({
        "width": template.width,
        "height": template.height,
        "slots": slots,
    });
    Ok(sha256_hex(canonical_json(&payload)?.as_bytes()))
}

mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{:02x}", b)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templates::{BackgroundImage, PhotoSlot};
    use serde_json::json;

    fn template(id: &str, name: &str) -> Template {
        Template {
            id: id.into(),
            name: name.into(),
            created_at: chrono::Utc::now(),
            schema_version: crate::SCHEMA_VERSION.into(),
            width: 576,
            height: 700,
            background: BackgroundImage::Url("bg.jpg".into()),
            slots: vec![PhotoSlot {
                id: format!("{}-slot", id),
                sequence: 1,
                x: 10,
                y: 20,
                width: 100,
                height: 50,
                rotation: 0,
            }],
        }
    }

    #[test]
    fn test_canonical_json_sorted() {
        let obj = json!({"z": 1, "a": 2, "m": 3});
        assert_eq!(canonical_json(&obj).unwrap(), r#"{"a":2,"m":3,"z":1}"#);
    }

    #[test]
    fn test_background_key_deterministic() {
        assert_eq!(background_key(b"jpeg"), background_key(b"jpeg"));
        assert_ne!(background_key(b"jpeg"), background_key(b"png"));
        assert_eq!(background_key(b"").len(), 64);
    }

    #[test]
    fn test_fingerprint_ignores_identity() {
        let a = template("one", "First");
        let b = template("two", "Second");
        assert_eq!(layout_fingerprint(&a).unwrap(), layout_fingerprint(&b).unwrap());

        let mut moved = template("one", "First");
        moved.slots[0].x += 1;
        assert_ne!(layout_fingerprint(&a).unwrap(), layout_fingerprint(&moved).unwrap());
    }
}
