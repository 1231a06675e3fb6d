use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, with optional facial landmarks.
///
/// Coordinates are floating-point pixels in the source image, as decoded
/// from the detector output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Round to integer pixel edges, clamped to an image of the given size.
    pub fn to_face_box(&self, image_width: u32, image_height: u32) -> FaceBox {
        let clamp = |v: f32, max: u32| v.round().clamp(0.0, max as f32) as u32;
        FaceBox {
            top: clamp(self.y, image_height),
            right: clamp(self.x + self.width, image_width),
            bottom: clamp(self.y + self.height, image_height),
            left: clamp(self.x, image_width),
        }
    }
}

/// Integer face rectangle, serialized as `[top, right, bottom, left]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "[u32; 4]", from = "[u32; 4]")]
pub struct FaceBox {
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub left: u32,
}

impl From<FaceBox> for [u32; 4] {
    fn from(b: FaceBox) -> Self {
        [b.top, b.right, b.bottom, b.left]
    }
}

impl From<[u32; 4]> for FaceBox {
    fn from([top, right, bottom, left]: [u32; 4]) -> Self {
        Self { top, right, bottom, left }
    }
}

/// Face embedding vector (512-dimensional for ArcFace w600k_r50).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean distance, or `None` when the dimensionalities differ.
    pub fn euclidean_distance(&self, other: &Embedding) -> Option<f32> {
        if self.values.len() != other.values.len() {
            return None;
        }
        Some(
            self.values
                .iter()
                .zip(other.values.iter())
                .map(|(a, b)| (a - b).powi(2))
                .sum::<f32>()
                .sqrt(),
        )
    }

    /// Scale to unit L2 norm. Zero vectors are returned unchanged.
    pub fn l2_normalized(self) -> Self {
        let norm: f32 = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            Self {
                values: self.values.iter().map(|x| x / norm).collect(),
            }
        } else {
            self
        }
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self { values }
    }
}

/// One face found by an embedder: where it is and what it looks like.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: FaceBox,
    /// Detector score for this face.
    pub score: f32,
    pub embedding: Embedding,
}

/// A registered person and every reference embedding stored for them.
///
/// Serialized with the `encodings` key the registration log has always used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    #[serde(rename = "encodings")]
    pub embeddings: Vec<Embedding>,
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
}

impl Identity {
    pub fn new(name: impl Into<String>, embedding: Embedding, created: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            embeddings: vec![embedding],
            created,
            updated: None,
        }
    }

    /// Time of the most recent registration for this identity.
    pub fn last_registered(&self) -> DateTime<Utc> {
        self.updated.unwrap_or(self.created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_euclidean_distance() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert_eq!(a.euclidean_distance(&b), Some(5.0));
    }

    #[test]
    fn test_euclidean_distance_dimension_mismatch() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![0.0, 0.0, 0.0]);
        assert_eq!(a.euclidean_distance(&b), None);
    }

    #[test]
    fn test_l2_normalized() {
        let e = Embedding::new(vec![3.0, 4.0]).l2_normalized();
        assert!((e.values[0] - 0.6).abs() < 1e-6);
        assert!((e.values[1] - 0.8).abs() < 1e-6);

        let zero = Embedding::new(vec![0.0, 0.0]).l2_normalized();
        assert_eq!(zero.values, vec![0.0, 0.0]);
    }

    #[test]
    fn test_face_box_clamped_to_image() {
        let bbox = BoundingBox {
            x: -4.6, y: 10.2, width: 120.0, height: 80.0,
            confidence: 0.9, landmarks: None,
        };
        let fb = bbox.to_face_box(100, 200);
        assert_eq!(fb, FaceBox { top: 10, right: 100, bottom: 90, left: 0 });
    }

    #[test]
    fn test_face_box_serializes_as_trbl_array() {
        let fb = FaceBox { top: 1, right: 2, bottom: 3, left: 4 };
        assert_eq!(serde_json::to_string(&fb).unwrap(), "[1,2,3,4]");
    }

    #[test]
    fn test_identity_wire_format() {
        let created = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let identity = Identity::new("Alice", Embedding::new(vec![0.5, 0.25]), created);
        let json = serde_json::to_value(&identity).unwrap();
        assert_eq!(json["name"], "Alice");
        assert_eq!(json["encodings"], serde_json::json!([[0.5, 0.25]]));
        assert!(json.get("updated").is_none());
        assert_eq!(identity.last_registered(), created);
    }
}
