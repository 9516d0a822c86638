use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::PipelineError;

/// File extension used for every stored segment crop.
pub const SEGMENT_EXTENSION: &str = "png";

/// Extensions accepted for uploads and recognised in the segment directory.
pub const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Bounding box in fractional image coordinates, in detector order
/// (ymin, xmin, ymax, xmax).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub ymin: f32,
    pub xmin: f32,
    pub ymax: f32,
    pub xmax: f32,
}

impl BoundingBox {
    pub fn new(ymin: f32, xmin: f32, ymax: f32, xmax: f32) -> Self {
        Self { ymin, xmin, ymax, xmax }
    }

    /// Build from the detector's `[ymin, xmin, ymax, xmax]` array, clamping every
    /// coordinate into [0, 1] and ordering each pair.
    pub fn from_detector([a, b, c, d]: [f32; 4]) -> Self {
        let clamp = |v: f32| if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) };
        let (a, b, c, d) = (clamp(a), clamp(b), clamp(c), clamp(d));
        Self {
            ymin: a.min(c),
            xmin: b.min(d),
            ymax: a.max(c),
            xmax: b.max(d),
        }
    }

    /// Convert to absolute pixel coordinates for an image of the given size.
    ///
    /// Coordinates are scaled component-wise, rounded to the nearest pixel and
    /// clamped to the image. The result always covers at least one pixel.
    pub fn to_pixels(&self, width: u32, height: u32) -> PixelBox {
        let (left, right) = pixel_span(self.xmin, self.xmax, width);
        let (top, bottom) = pixel_span(self.ymin, self.ymax, height);
        PixelBox { left, top, right, bottom }
    }
}

fn pixel_span(start: f32, end: f32, extent: u32) -> (u32, u32) {
    let scale = |v: f32| ((v as f64) * extent as f64).round().clamp(0.0, extent as f64) as u32;
    let mut lo = scale(start);
    let mut hi = scale(end);
    if hi <= lo {
        hi = (lo + 1).min(extent);
        lo = hi.saturating_sub(1);
    }
    (lo, hi)
}

/// Absolute crop rectangle; `right` and `bottom` are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelBox {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl PixelBox {
    pub fn width(&self) -> u32 {
        self.right - self.left
    }

    pub fn height(&self) -> u32 {
        self.bottom - self.top
    }
}

/// One candidate object proposed by the detector.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    /// 1-based index into the label vocabulary.
    pub class_label: u32,
    pub score: f32,
}

/// Stable identity of a stored segment, recoverable from its file name alone.
///
/// Unique only within one detection run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId {
    pub ordinal: u32,
    pub class_label: u32,
}

impl SegmentId {
    pub fn new(ordinal: u32, class_label: u32) -> Self {
        Self { ordinal, class_label }
    }

    /// File name under which the crop is stored, e.g. `0_3.png`.
    pub fn file_name(&self) -> String {
        format!("{}.{}", self, SEGMENT_EXTENSION)
    }

    /// Parse a segment file name (`{ordinal}_{class}.{ext}`).
    ///
    /// Returns `None` for anything that is not a segment image.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let (stem, ext) = name.rsplit_once('.')?;
        if !IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
            return None;
        }
        parse_stem(stem)
    }

    /// 1-based position shown to users.
    pub fn object_number(&self) -> u32 {
        self.ordinal + 1
    }
}

fn parse_stem(stem: &str) -> Option<SegmentId> {
    let (ordinal, class_label) = stem.split_once('_')?;
    Some(SegmentId {
        ordinal: ordinal.parse().ok()?,
        class_label: class_label.parse().ok()?,
    })
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.ordinal, self.class_label)
    }
}

impl FromStr for SegmentId {
    type Err = PipelineError;

    /// Accepts both the bare identifier (`0_3`) and the file name (`0_3.png`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SegmentId::from_file_name(s)
            .or_else(|| parse_stem(s))
            .ok_or_else(|| PipelineError::Validation(format!("not a segment identifier: {s:?}")))
    }
}

// Segments are keyed by file name in every exported document.
impl Serialize for SegmentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.file_name())
    }
}

impl<'de> Deserialize<'de> for SegmentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Identifier of one detection run; each run owns its own segment directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunId(Uuid);

impl RunId {
    pub fn generate() -> Self {
        RunId(Uuid::new_v4())
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(RunId)
            .map_err(|e| PipelineError::Validation(format!("bad run id {s:?}: {e}")))
    }
}

/// An image accepted into the input directory.
#[derive(Debug, Clone)]
pub struct UploadedImage {
    pub id: i64,
    pub file_name: String,
    pub width: u32,
    pub height: u32,
    pub uploaded_at: OffsetDateTime,
}

/// Detection metadata persisted alongside a stored segment.
#[derive(Debug, Clone)]
pub struct SegmentDetail {
    pub id: SegmentId,
    pub label_name: Option<String>,
    pub score: f32,
    pub bbox: BoundingBox,
}
