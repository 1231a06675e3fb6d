//! Image bytes → face detections with embeddings.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::Detection;
use image::RgbImage;
use std::path::Path;
use thiserror::Error;

pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("could not decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Anything that turns an encoded image into zero or more face embeddings.
///
/// Implementations must produce embeddings of exactly [`dimension`](Self::dimension)
/// values. Detections are ordered by descending detector score.
pub trait Embedder {
    fn dimension(&self) -> usize;

    fn embed(&mut self, image: &[u8]) -> Result<Vec<Detection>, EmbedError>;
}

/// Decode any format the `image` crate understands into 8-bit RGB.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, EmbedError> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

/// SCRFD detection followed by ArcFace extraction for every detected face.
pub struct OnnxEmbedder {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxEmbedder {
    /// Load `det_10g.onnx` and `w600k_r50.onnx` from `model_dir`.
    pub fn load(model_dir: &Path, score_threshold: f32) -> Result<Self, EmbedError> {
        let detector =
            FaceDetector::load(&model_dir.join(SCRFD_MODEL_FILE))?.with_score_threshold(score_threshold);
        let recognizer = FaceRecognizer::load(&model_dir.join(ARCFACE_MODEL_FILE))?;
        Ok(Self { detector, recognizer })
    }
}

impl Embedder for OnnxEmbedder {
    fn dimension(&self) -> usize {
        self.recognizer.dimension()
    }

    fn embed(&mut self, bytes: &[u8]) -> Result<Vec<Detection>, EmbedError> {
        let image = decode_image(bytes)?;
        let faces = self.detector.detect(&image)?;
        tracing::debug!(
            width = image.width(),
            height = image.height(),
            faces = faces.len(),
            "faces detected"
        );

        faces
            .iter()
            .map(|face| -> Result<Detection, EmbedError> {
                Ok(Detection {
                    bbox: face.to_face_box(image.width(), image.height()),
                    score: face.confidence,
                    embedding: self.recognizer.extract(&image, face)?,
                })
            })
            .collect()
    }
}
