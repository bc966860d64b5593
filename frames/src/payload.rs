//! Typed payloads carried inside frame data.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The presence payload a client announces on `canvas:join`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUser {
    pub user_id: Uuid,
    pub display_name: String,
    #[serde(default)]
    pub avatar_ref: Option<String>,
}

/// A point in canvas coordinates. Also used for cursor positions.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

pub type Cursor = Point;

impl Point {
    #[must_use]
    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrawKind {
    Pencil,
    Line,
    Rectangle,
    Circle,
    Clear,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DrawError {
    #[error("{0:?} requires x0, y0, x1, y1")]
    MissingSegment(DrawKind),
    #[error("pencil stroke requires points or a segment")]
    EmptyStroke,
    #[error("geometry must be finite")]
    NonFinite,
    #[error("strokeWidth must be positive")]
    BadStrokeWidth,
}

/// One drawing operation. Relayed, never stored individually.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrawEvent {
    #[serde(rename = "type")]
    pub kind: DrawKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x0: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y0: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x1: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y1: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub points: Vec<Point>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stroke_width: Option<f64>,
}

impl DrawEvent {
    /// A `clear` event with no geometry.
    #[must_use]
    pub fn clear() -> Self {
        Self {
            kind: DrawKind::Clear,
            x0: None,
            y0: None,
            x1: None,
            y1: None,
            points: Vec::new(),
            color: None,
            stroke_width: None,
        }
    }

    fn segment(&self) -> Option<[f64; 4]> {
        Some([self.x0?, self.y0?, self.x1?, self.y1?])
    }

    /// Check that the geometry matches the kind.
    ///
    /// # Errors
    ///
    /// Returns a [`DrawError`] describing the first problem found.
    pub fn validate(&self) -> Result<(), DrawError> {
        if let Some(width) = self.stroke_width {
            if !width.is_finite() || width <= 0.0 {
                return Err(DrawError::BadStrokeWidth);
            }
        }
        match self.kind {
            DrawKind::Clear => Ok(()),
            DrawKind::Pencil => {
                if self.points.is_empty() && self.segment().is_none() {
                    return Err(DrawError::EmptyStroke);
                }
                self.check_finite()
            }
            kind => {
                if self.segment().is_none() {
                    return Err(DrawError::MissingSegment(kind));
                }
                self.check_finite()
            }
        }
    }

    fn check_finite(&self) -> Result<(), DrawError> {
        let segment_ok = self.segment().is_none_or(|s| s.iter().all(|v| v.is_finite()));
        if segment_ok && self.points.iter().all(|p| p.is_finite()) {
            Ok(())
        } else {
            Err(DrawError::NonFinite)
        }
    }

    /// Whether this event completes a change worth persisting on its own:
    /// a finished shape or an explicit clear. Freehand pencil segments
    /// arrive continuously and are left to the periodic save.
    #[must_use]
    pub fn is_significant(&self) -> bool {
        !matches!(self.kind, DrawKind::Pencil)
    }
}

#[cfg(test)]
#[path = "payload_test.rs"]
mod tests;
