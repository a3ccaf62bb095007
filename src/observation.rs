//! Observation validation and pixel canonicalization.
//!
//! Cameras, simulators and pickled fixtures disagree on pixel encoding. The
//! model is trained on 8-bit RGB, so every image is brought to `u8` HWC here
//! before it can reach inference. Range detection is a heuristic: a dim image
//! that happens to sit entirely inside [0,1] is indistinguishable from one
//! that was already scaled to [0,1].

use ndarray::Array3;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::NormalizationError;

/// Pixel buffer as it arrived, before canonicalization.
#[derive(Debug, Clone, PartialEq)]
pub enum PixelData {
    U8(Vec<u8>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl PixelData {
    pub fn len(&self) -> usize {
        match self {
            PixelData::U8(v) => v.len(),
            PixelData::F32(v) => v.len(),
            PixelData::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype_name(&self) -> &'static str {
        match self {
            PixelData::U8(_) => "uint8",
            PixelData::F32(_) => "float32",
            PixelData::F64(_) => "float64",
        }
    }

    fn as_f64(&self) -> Vec<f64> {
        match self {
            PixelData::U8(v) => v.iter().map(|&p| f64::from(p)).collect(),
            PixelData::F32(v) => v.iter().map(|&p| f64::from(p)).collect(),
            PixelData::F64(v) => v.clone(),
        }
    }
}

/// An image with an explicit shape, in row-major HWC order.
#[derive(Debug, Clone, PartialEq)]
pub struct RawImage {
    pub shape: Vec<usize>,
    pub data: PixelData,
}

impl RawImage {
    pub fn new(shape: Vec<usize>, data: PixelData) -> Self {
        Self { shape, data }
    }

    pub fn from_u8(height: usize, width: usize, data: Vec<u8>) -> Self {
        Self::new(vec![height, width, 3], PixelData::U8(data))
    }

    pub fn from_f32(height: usize, width: usize, data: Vec<f32>) -> Self {
        Self::new(vec![height, width, 3], PixelData::F32(data))
    }
}

/// Observation fields exactly as supplied by a client.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawObservation {
    pub primary_image: Option<RawImage>,
    pub wrist_image: Option<RawImage>,
    pub proprio_state: Option<Vec<f32>>,
    pub task_description: Option<String>,
}

/// A validated observation with canonical 8-bit images.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub primary_image: Array3<u8>,
    pub wrist_image: Option<Array3<u8>>,
    pub proprio_state: Option<Vec<f32>>,
    pub task_description: String,
}

/// Which encoding the range heuristic believes an image uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelRange {
    /// Floating point in [0,1].
    Unit,
    /// Centered encoding, roughly [-1,1].
    Signed,
    /// Already 8-bit [0,255].
    Byte,
}

/// Applies the range heuristic to a set of pixel values.
///
/// Checked in order: everything in [0,1], then a negative minimum, then 8-bit.
pub fn detect_range(min: f64, max: f64) -> PixelRange {
    if min >= 0.0 && max <= 1.0 {
        PixelRange::Unit
    } else if min < 0.0 {
        PixelRange::Signed
    } else {
        PixelRange::Byte
    }
}

fn to_byte(value: f64, range: PixelRange) -> u8 {
    let scaled = match range {
        PixelRange::Unit => value * 255.0,
        PixelRange::Signed => (value + 1.0) * 127.5,
        PixelRange::Byte => value,
    };
    scaled.round().clamp(0.0, 255.0) as u8
}

/// Observation normalizer, optionally pinned to an expected image resolution.
#[derive(Debug, Clone, Copy, Default)]
pub struct Normalizer {
    image_size: Option<[usize; 2]>,
}

impl Normalizer {
    pub fn new(image_size: Option<[usize; 2]>) -> Self {
        Self { image_size }
    }

    /// Validates all fields and canonicalizes both image slots.
    pub fn normalize(&self, raw: RawObservation) -> Result<Observation, NormalizationError> {
        let primary = raw
            .primary_image
            .ok_or(NormalizationError::MissingField("primary_image"))?;
        let task_description = raw
            .task_description
            .ok_or(NormalizationError::MissingField("task_description"))?;

        let primary_image = self.normalize_image("primary_image", primary)?;
        let wrist_image = raw
            .wrist_image
            .map(|img| self.normalize_image("wrist_image", img))
            .transpose()?;

        Ok(Observation {
            primary_image,
            wrist_image,
            proprio_state: raw.proprio_state,
            task_description,
        })
    }

    /// Checks the shape of a single image and converts it to `u8`.
    pub fn normalize_image(
        &self,
        field: &'static str,
        raw: RawImage,
    ) -> Result<Array3<u8>, NormalizationError> {
        let (h, w, c) = validate_shape(field, &raw)?;

        if let Some([expected_h, expected_w]) = self.image_size {
            if (h, w) != (expected_h, expected_w) {
                return Err(NormalizationError::Resolution {
                    field,
                    expected_h,
                    expected_w,
                    actual_h: h,
                    actual_w: w,
                });
            }
        }

        let pixels = match raw.data {
            PixelData::U8(bytes) => bytes,
            other => {
                let values = other.as_f64();
                if values.iter().any(|v| !v.is_finite()) {
                    return Err(NormalizationError::NonFinite { field });
                }
                let (min, max) = min_max(&values);
                let range = detect_range(min, max);
                debug!(field, ?range, min, max, "canonicalizing float image");
                values.into_iter().map(|v| to_byte(v, range)).collect()
            }
        };

        // Lengths already agree; ndarray only rejects shapes past isize::MAX.
        Array3::from_shape_vec((h, w, c), pixels)
            .map_err(|_| NormalizationError::ShapeOverflow { field, h, w, c })
    }
}

/// Normalizes with no resolution constraint.
pub fn normalize(raw: RawObservation) -> Result<Observation, NormalizationError> {
    Normalizer::default().normalize(raw)
}

fn validate_shape(
    field: &'static str,
    raw: &RawImage,
) -> Result<(usize, usize, usize), NormalizationError> {
    let &[h, w, c] = raw.shape.as_slice() else {
        return Err(NormalizationError::BadRank {
            field,
            rank: raw.shape.len(),
        });
    };
    if c != 3 {
        return Err(NormalizationError::BadChannels { field, channels: c });
    }
    let expected = h
        .checked_mul(w)
        .and_then(|hw| hw.checked_mul(c))
        .ok_or(NormalizationError::ShapeOverflow { field, h, w, c })?;
    if raw.data.len() != expected {
        return Err(NormalizationError::LengthMismatch {
            field,
            expected,
            actual: raw.data.len(),
        });
    }
    Ok((h, w, c))
}

fn min_max(values: &[f64]) -> (f64, f64) {
    values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        })
}

/// Summary of an image's raw values, used by the `inspect` tool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageStats {
    pub shape: Vec<usize>,
    pub dtype: &'static str,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub range: PixelRange,
}

impl ImageStats {
    pub fn of(image: &RawImage) -> Self {
        let values = image.data.as_f64();
        let (min, max) = if values.is_empty() {
            (0.0, 0.0)
        } else {
            min_max(&values)
        };
        let mean = if values.is_empty() {
            0.0
        } else {
            values.iter().sum::<f64>() / values.len() as f64
        };
        let range = match image.data {
            PixelData::U8(_) => PixelRange::Byte,
            _ => detect_range(min, max),
        };
        Self {
            shape: image.shape.clone(),
            dtype: image.data.dtype_name(),
            min,
            max,
            mean,
            range,
        }
    }
}
