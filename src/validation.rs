//! Validation System - Rule/Policy Separation
//!
//! Rules produce structured violations.
//! Errors block a save or a session; warnings are only reported.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::templates::Template;
use crate::THERMAL_WIDTH;

#[cfg(feature = "test-hooks")]
use std::sync::atomic::{AtomicU32, Ordering};

#[cfg(feature = "test-hooks")]
static VALIDATION_CALL_COUNT: AtomicU32 = AtomicU32::new(0);

#[cfg(feature = "test-hooks")]
pub fn get_validation_call_count() -> u32 {
    VALIDATION_CALL_COUNT.load(Ordering::SeqCst)
}

#[cfg(feature = "test-hooks")]
pub fn reset_validation_call_count() {
    VALIDATION_CALL_COUNT.store(0, Ordering::SeqCst);
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationViolation {
    pub rule: String,
    pub severity: ViolationSeverity,
    pub message: String,
    #[serde(default)]
    pub slot_id: Option<String>,
    pub expected: Option<String>,
    pub actual: Option<String>,
}

impl ValidationViolation {
    pub fn is_blocking(&self) -> bool {
        self.severity == ViolationSeverity::Error
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub valid: bool,
    pub violations: Vec<ValidationViolation>,
    pub template_id: String,
    pub slot_count: usize,
}

impl ValidationResult {
    pub fn has_errors(&self) -> bool {
        self.violations.iter().any(ValidationViolation::is_blocking)
    }
}

/// Validation rule trait - produces violations
pub trait ValidationRule {
    fn name(&self) -> &'static str;
    fn validate(&self, template: &Template) -> Vec<ValidationViolation>;
}

fn error(rule: &str, message: impl Into<String>) -> ValidationViolation {
    ValidationViolation {
        rule: rule.to_string(),
        severity: ViolationSeverity::Error,
        message: message.into(),
        slot_id: None,
        expected: None,
        actual: None,
    }
}

// --- Concrete Rules ---

pub struct CanvasSizeRule;

impl ValidationRule for CanvasSizeRule {
    fn name(&self) -> &'static str { "canvas_size" }

    fn validate(&self, template: &Template) -> Vec<ValidationViolation> {
        let mut violations = vec![];
        if template.width != THERMAL_WIDTH {
            violations.push(ValidationViolation {
                expected: Some(THERMAL_WIDTH.to_string()),
                actual: Some(template.width.to_string()),
                ..error(self.name(), "Width must match the thermal print width")
            });
        }
        if template.height == 0 {
            violations.push(ValidationViolation {
                expected: Some("> 0".to_string()),
                actual: Some("0".to_string()),
                ..error(self.name(), "Height must be positive")
            });
        }
        violations
    }
}

pub struct SlotPresenceRule;

impl ValidationRule for SlotPresenceRule {
    fn name(&self) -> &'static str { "slot_presence" }

    fn validate(&self, template: &Template) -> Vec<ValidationViolation> {
        if template.slots.is_empty() {
            vec![error(self.name(), "At least one photo slot is required")]
        } else {
            vec![]
        }
    }
}

pub struct SlotGeometryRule;

impl ValidationRule for SlotGeometryRule {
    fn name(&self) -> &'static str { "slot_geometry" }

    fn validate(&self, template: &Template) -> Vec<ValidationViolation> {
        template
            .slots
            .iter()
            .filter(|s| s.width <= 0 || s.height <= 0)
            .map(|s| ValidationViolation {
                slot_id: Some(s.id.clone()),
                expected: Some("positive width and height".to_string()),
                actual: Some(format!("{}x{}", s.width, s.height)),
                ..error(self.name(), "Slot size must be positive")
            })
            .collect()
    }
}

pub struct UniqueSlotIdRule;

impl ValidationRule for UniqueSlotIdRule {
    fn name(&self) -> &'static str { "unique_slot_id" }

    fn validate(&self, template: &Template) -> Vec<ValidationViolation> {
        let mut seen = HashSet::new();
        template
            .slots
            .iter()
            .filter(|s| !seen.insert(s.id.as_str()))
            .map(|s| ValidationViolation {
                slot_id: Some(s.id.clone()),
                ..error(self.name(), "Duplicate slot id")
            })
            .collect()
    }
}

/// Largest slot side, as a multiple of the matching canvas side.
pub const MAX_SLOT_CANVAS_MULTIPLE: u32 = 2;

/// True when a `width x height` slot is small enough to rasterize over the canvas.
pub fn slot_within_size_limit(width: i64, height: i64, canvas_w: u32, canvas_h: u32) -> bool {
    width <= canvas_w as i64 * MAX_SLOT_CANVAS_MULTIPLE as i64
        && height <= canvas_h as i64 * MAX_SLOT_CANVAS_MULTIPLE as i64
}

/// Slots hanging off the canvas print clipped and only warn. A slot that
/// misses the canvas entirely, or dwarfs it, blocks.
pub struct SlotBoundsRule;

impl ValidationRule for SlotBoundsRule {
    fn name(&self) -> &'static str { "slot_bounds" }

    fn validate(&self, template: &Template) -> Vec<ValidationViolation> {
        let (w, h) = (template.width as f64, template.height as f64);
        let mut violations = vec![];
        for s in template.slots.iter().filter(|s| s.width > 0 && s.height > 0) {
            let (min_x, min_y, max_x, max_y) = s.rotated_bounds();
            let actual = Some(format!("{},{} {}x{}", s.x, s.y, s.width, s.height));
            let expected = Some(format!("within {}x{}", template.width, template.height));

            if !slot_within_size_limit(s.width as i64, s.height as i64, template.width, template.height) {
                violations.push(ValidationViolation {
                    slot_id: Some(s.id.clone()),
                    expected: Some(format!(
                        "at most {}x{}",
                        template.width as i64 * MAX_SLOT_CANVAS_MULTIPLE as i64,
                        template.height as i64 * MAX_SLOT_CANVAS_MULTIPLE as i64
                    )),
                    actual,
                    ..error(self.name(), "Slot is far larger than the canvas")
                });
            } else if max_x <= 0.0 || max_y <= 0.0 || min_x >= w || min_y >= h {
                violations.push(ValidationViolation {
                    slot_id: Some(s.id.clone()),
                    expected,
                    actual,
                    ..error(self.name(), "Slot lies entirely outside the canvas")
                });
            } else if min_x < 0.0 || min_y < 0.0 || max_x > w || max_y > h {
                violations.push(ValidationViolation {
                    rule: self.name().to_string(),
                    severity: ViolationSeverity::Warning,
                    message: "Slot extends beyond the canvas and will be clipped".to_string(),
                    slot_id: Some(s.id.clone()),
                    expected,
                    actual,
                });
            }
        }
        violations
    }
}

/// Validator orchestrates rules and applies policy
pub struct Validator {
    rules: Vec<Box<dyn ValidationRule>>,
}

impl Validator {
    pub fn new() -> Self {
        Self {
            rules: vec![
                Box::new(CanvasSizeRule),
                Box::new(SlotPresenceRule),
                Box::new(SlotGeometryRule),
                Box::new(UniqueSlotIdRule),
                Box::new(SlotBoundsRule),
            ],
        }
    }

    pub fn validate(&self, template: &Template) -> ValidationResult {
        #[cfg(feature = "test-hooks")]
        VALIDATION_CALL_COUNT.fetch_add(1, Ordering::SeqCst);

        let violations: Vec<_> = self
            .rules
            .iter()
            .flat_map(|rule| rule.validate(template))
            .collect();

        for v in violations.iter().filter(|v| !v.is_blocking()) {
            log::warn!("template '{}': {} ({})", template.name, v.message, v.rule);
        }

        ValidationResult {
            valid: !violations.iter().any(ValidationViolation::is_blocking),
            violations,
            template_id: template.id.clone(),
            slot_count: template.slots.len(),
        }
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}
