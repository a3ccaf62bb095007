//! JSON wire format for the `/act` endpoint.
//!
//! Arrays travel as json-numpy objects: raw bytes in base64 plus the numpy
//! dtype descriptor and shape, e.g.
//! `{"__numpy__": "AAEC...", "dtype": "|u1", "shape": [256, 256, 3]}`.
//! Plain nested JSON number lists are accepted as well.

use std::path::Path;

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::action::ActionChunk;
use crate::error::{ServiceError, WireError};
use crate::observation::{Observation, PixelData, RawImage, RawObservation};

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// A numpy array encoded as base64 bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumpyArray {
    #[serde(rename = "__numpy__", alias = "__ndarray__")]
    pub data: String,
    pub dtype: String,
    pub shape: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dtype {
    U8,
    F32 { big_endian: bool },
    F64 { big_endian: bool },
}

impl Dtype {
    fn parse(descr: &str) -> Result<Self, WireError> {
        let (big_endian, body) = match descr.as_bytes().first() {
            Some(b'>') => (true, &descr[1..]),
            Some(b'<' | b'|' | b'=') => (false, &descr[1..]),
            _ => (false, descr),
        };
        match body {
            "u1" | "uint8" => Ok(Dtype::U8),
            "f4" | "float32" => Ok(Dtype::F32 { big_endian }),
            "f8" | "float64" => Ok(Dtype::F64 { big_endian }),
            _ => Err(WireError::UnsupportedDtype(descr.to_string())),
        }
    }

    fn item_size(self) -> usize {
        match self {
            Dtype::U8 => 1,
            Dtype::F32 { .. } => 4,
            Dtype::F64 { .. } => 8,
        }
    }
}

impl NumpyArray {
    pub fn from_u8(shape: Vec<usize>, values: &[u8]) -> Self {
        Self {
            data: B64.encode(values),
            dtype: "|u1".to_string(),
            shape,
        }
    }

    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Self {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self {
            data: B64.encode(bytes),
            dtype: "<f4".to_string(),
            shape,
        }
    }

    /// Decodes the payload, checking the byte count against shape and dtype.
    pub fn decode(&self) -> Result<PixelData, WireError> {
        let dtype = Dtype::parse(&self.dtype)?;
        let expected = self
            .shape
            .iter()
            .try_fold(dtype.item_size(), |acc, &dim| acc.checked_mul(dim))
            .ok_or_else(|| WireError::ShapeOverflow {
                shape: self.shape.clone(),
            })?;

        let bytes = B64
            .decode(self.data.as_bytes())
            .map_err(|e| WireError::Base64(e.to_string()))?;
        if bytes.len() != expected {
            return Err(WireError::ByteLength {
                dtype: self.dtype.clone(),
                shape: self.shape.clone(),
                expected,
                actual: bytes.len(),
            });
        }

        Ok(match dtype {
            Dtype::U8 => PixelData::U8(bytes),
            Dtype::F32 { big_endian } => PixelData::F32(
                bytes
                    .chunks_exact(4)
                    .map(|c| {
                        let raw = [c[0], c[1], c[2], c[3]];
                        if big_endian {
                            f32::from_be_bytes(raw)
                        } else {
                            f32::from_le_bytes(raw)
                        }
                    })
                    .collect(),
            ),
            Dtype::F64 { big_endian } => PixelData::F64(
                bytes
                    .chunks_exact(8)
                    .map(|c| {
                        let raw = [c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]];
                        if big_endian {
                            f64::from_be_bytes(raw)
                        } else {
                            f64::from_le_bytes(raw)
                        }
                    })
                    .collect(),
            ),
        })
    }
}

/// An array field: either json-numpy encoded or a nested number list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArrayPayload {
    Numpy(NumpyArray),
    Nested(serde_json::Value),
}

impl ArrayPayload {
    /// Returns the array's shape and values.
    pub fn decode(&self) -> Result<(Vec<usize>, PixelData), WireError> {
        match self {
            ArrayPayload::Numpy(arr) => Ok((arr.shape.clone(), arr.decode()?)),
            ArrayPayload::Nested(value) => {
                let mut shape = Vec::new();
                let mut values = Vec::new();
                flatten_nested(value, 0, &mut shape, &mut values)?;
                Ok((shape, PixelData::F64(values)))
            }
        }
    }

    fn decode_image(&self) -> Result<RawImage, WireError> {
        let (shape, data) = self.decode()?;
        Ok(RawImage::new(shape, data))
    }

    fn decode_vector(&self) -> Result<Vec<f32>, WireError> {
        let (_, data) = self.decode()?;
        Ok(match data {
            PixelData::U8(v) => v.into_iter().map(f32::from).collect(),
            PixelData::F32(v) => v,
            PixelData::F64(v) => v.into_iter().map(|x| x as f32).collect(),
        })
    }
}

fn flatten_nested(
    value: &serde_json::Value,
    depth: usize,
    shape: &mut Vec<usize>,
    out: &mut Vec<f64>,
) -> Result<(), WireError> {
    match value {
        serde_json::Value::Number(n) => {
            // A scalar must sit at the same depth as every other scalar.
            if depth != shape.len() {
                return Err(WireError::RaggedList);
            }
            out.push(n.as_f64().ok_or(WireError::RaggedList)?);
            Ok(())
        }
        serde_json::Value::Array(items) => {
            match shape.get(depth) {
                Some(&len) if len != items.len() => return Err(WireError::RaggedList),
                Some(_) => {}
                None if depth == shape.len() && out.is_empty() => shape.push(items.len()),
                None => return Err(WireError::RaggedList),
            }
            items
                .iter()
                .try_for_each(|item| flatten_nested(item, depth + 1, shape, out))
        }
        _ => Err(WireError::RaggedList),
    }
}

/// Body of `POST /act`. Every field is optional on the wire so that a
/// missing field is reported as a bad request rather than a parse failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_image: Option<ArrayPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrist_image: Option<ArrayPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ArrayPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_description: Option<String>,
}

impl ActRequest {
    pub fn into_raw_observation(self) -> Result<RawObservation, WireError> {
        Ok(RawObservation {
            primary_image: self
                .full_image
                .as_ref()
                .map(ArrayPayload::decode_image)
                .transpose()?,
            wrist_image: self
                .wrist_image
                .as_ref()
                .map(ArrayPayload::decode_image)
                .transpose()?,
            proprio_state: self
                .state
                .as_ref()
                .map(ArrayPayload::decode_vector)
                .transpose()?,
            task_description: self.task_description,
        })
    }

    pub fn from_observation(obs: &Observation) -> Self {
        let encode = |img: &ndarray::Array3<u8>| {
            let values: Vec<u8> = img.iter().copied().collect();
            ArrayPayload::Numpy(NumpyArray::from_u8(img.shape().to_vec(), &values))
        };
        Self {
            full_image: Some(encode(&obs.primary_image)),
            wrist_image: obs.wrist_image.as_ref().map(encode),
            state: obs
                .proprio_state
                .as_ref()
                .map(|s| ArrayPayload::Numpy(NumpyArray::from_f32(vec![s.len()], s))),
            task_description: Some(obs.task_description.clone()),
        }
    }

    /// Reads an observation bundle stored as a request body.
    pub fn load(path: impl AsRef<Path>) -> crate::error::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| {
            crate::error::Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })
    }
}

/// Success body: one vector per action step, execution order.
pub type ActResponse = Vec<Vec<f32>>;

impl ActionChunk {
    pub fn to_response(&self) -> ActResponse {
        self.steps().iter().map(|s| s.values().to_vec()).collect()
    }
}

/// Failure body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl From<&ServiceError> for ErrorResponse {
    fn from(err: &ServiceError) -> Self {
        let (kind, message, detail) = match err {
            ServiceError::BadRequest(msg) => ("bad_request", msg.clone(), None),
            ServiceError::InferenceFailure { message, detail } => {
                ("inference_failure", message.clone(), detail.clone())
            }
            ServiceError::Transport(msg) => ("transport", msg.clone(), None),
        };
        Self {
            error: kind.to_string(),
            message,
            detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_json_numpy_uint8() {
        let payload: ArrayPayload = serde_json::from_value(json!({
            "__numpy__": B64.encode([1u8, 2, 3, 4, 5, 6]),
            "dtype": "|u1",
            "shape": [1, 2, 3]
        }))
        .unwrap();
        let (shape, data) = payload.decode().unwrap();
        assert_eq!(shape, vec![1, 2, 3]);
        assert_eq!(data, PixelData::U8(vec![1, 2, 3, 4, 5, 6]));
    }

    #[test]
    fn decodes_little_and_big_endian_floats() {
        let le = NumpyArray::from_f32(vec![2], &[0.25, -1.5]);
        assert_eq!(le.decode().unwrap(), PixelData::F32(vec![0.25, -1.5]));

        let bytes: Vec<u8> = [0.25f64, 2.0].iter().flat_map(|v| v.to_be_bytes()).collect();
        let be = NumpyArray {
            data: B64.encode(bytes),
            dtype: ">f8".into(),
            shape: vec![2],
        };
        assert_eq!(be.decode().unwrap(), PixelData::F64(vec![0.25, 2.0]));
    }

    #[test]
    fn byte_length_must_match_shape() {
        let arr = NumpyArray {
            data: B64.encode([0u8; 5]),
            dtype: "<f4".into(),
            shape: vec![2],
        };
        assert!(matches!(
            arr.decode(),
            Err(WireError::ByteLength { expected: 8, actual: 5, .. })
        ));
    }

    #[test]
    fn oversized_shape_is_rejected_without_overflow() {
        let arr = NumpyArray {
            data: String::new(),
            dtype: "|u1".into(),
            shape: vec![1 << 32, 1 << 32, 3],
        };
        assert_eq!(
            arr.decode(),
            Err(WireError::ShapeOverflow {
                shape: vec![1 << 32, 1 << 32, 3]
            })
        );

        // Fits in usize but the item size tips it over.
        let wide = NumpyArray {
            data: String::new(),
            dtype: "<f8".into(),
            shape: vec![usize::MAX / 4],
        };
        assert!(matches!(wide.decode(), Err(WireError::ShapeOverflow { .. })));
    }

    #[test]
    fn unknown_dtype_is_rejected() {
        let arr = NumpyArray {
            data: String::new(),
            dtype: "<c16".into(),
            shape: vec![0],
        };
        assert_eq!(
            arr.decode(),
            Err(WireError::UnsupportedDtype("<c16".to_string()))
        );
    }

    #[test]
    fn nested_lists_keep_their_shape() {
        let payload = ArrayPayload::Nested(json!([[[0, 0.5, 1]], [[1, 1, 1]]]));
        let (shape, data) = payload.decode().unwrap();
        assert_eq!(shape, vec![2, 1, 3]);
        assert_eq!(data.len(), 6);

        let ragged = ArrayPayload::Nested(json!([[1, 2], [3]]));
        assert_eq!(ragged.decode(), Err(WireError::RaggedList));
    }

    #[test]
    fn missing_fields_survive_parsing() {
        let req: ActRequest = serde_json::from_value(json!({"task_description": "open the drawer"}))
            .unwrap();
        let raw = req.into_raw_observation().unwrap();
        assert!(raw.primary_image.is_none());
        assert_eq!(raw.task_description.as_deref(), Some("open the drawer"));
    }

    #[test]
    fn observation_encodes_to_request() {
        let obs = Observation {
            primary_image: ndarray::Array3::from_elem((2, 2, 3), 7u8),
            wrist_image: None,
            proprio_state: Some(vec![0.1, 0.2]),
            task_description: "stack the cups".into(),
        };
        let req = ActRequest::from_observation(&obs);
        let raw = req.into_raw_observation().unwrap();
        let primary = raw.primary_image.unwrap();
        assert_eq!(primary.shape, vec![2, 2, 3]);
        assert_eq!(primary.data, PixelData::U8(vec![7; 12]));
        assert_eq!(raw.proprio_state, Some(vec![0.1, 0.2]));
        assert!(raw.wrist_image.is_none());
    }
}
